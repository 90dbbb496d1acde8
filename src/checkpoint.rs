//! Checkpoint tracker: collects checkpoint votes and decides when the low
//! watermark may advance.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::messages::{Checkpoint, Digest, NetworkConfig, NodeId, SeqNo};
use crate::utils::{Bitmap, MirError};

/// Checkpoint intervals past the low watermark within which every vote is
/// kept. Beyond that only the highest vote of each node is.
const TRACKED_INTERVALS: u64 = 4;

/// Tracker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CheckpointTrackerState {
    /// Collecting votes; nothing to collect yet.
    Idle,

    /// A checkpoint above the low watermark is stable and the log behind it
    /// can be garbage collected.
    GarbageCollectable,
}

/// Votes on one checkpoint sequence.
#[derive(Debug, Clone, Default)]
struct CheckpointVotes {
    /// Value each node voted for.
    votes: BTreeMap<NodeId, Digest>,

    /// Value computed by my own application.
    my_value: Option<Digest>,

    /// Value certified by a strong quorum.
    committed_value: Option<Digest>,

    /// More than one value is backed by a weak quorum, so correct nodes
    /// disagree on the application state.
    forked: bool,
}

impl CheckpointVotes {
    // Counts configured voters per distinct value.
    fn agreements(&self, config: &NetworkConfig) -> BTreeMap<&Digest, Bitmap> {
        let mut agreements: BTreeMap<&Digest, Bitmap> = BTreeMap::new();
        for (node, value) in &self.votes {
            let Some(idx) = config.node_index(*node) else {
                continue;
            };
            let map = agreements
                .entry(value)
                .or_insert_with(|| Bitmap::new(config.nodes.len()));
            map.insert(idx);
        }
        agreements
    }

    #[inline]
    fn is_stable(&self) -> bool {
        self.committed_value.is_some() && self.my_value == self.committed_value
    }
}

/// Observability snapshot of one tracked checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckpointStatus {
    pub seq_no: SeqNo,
    pub max_agreements: usize,
    pub net_quorum: bool,
    pub local_decision: bool,
    pub forked: bool,
}

/// Checkpoint tracker module.
#[derive(Debug)]
pub struct CheckpointTracker {
    /// My node ID.
    my_id: NodeId,

    network_config: NetworkConfig,

    /// Sequence of the last garbage-collected checkpoint.
    low_watermark: SeqNo,

    checkpoints: BTreeMap<SeqNo, CheckpointVotes>,

    state: CheckpointTrackerState,
}

impl CheckpointTracker {
    pub fn new(
        my_id: NodeId,
        low_watermark: SeqNo,
        network_config: NetworkConfig,
    ) -> Self {
        CheckpointTracker {
            my_id,
            network_config,
            low_watermark,
            checkpoints: BTreeMap::new(),
            state: CheckpointTrackerState::Idle,
        }
    }

    /// Resets to a new window after log recovery, keeping votes at or above
    /// the new low watermark.
    pub fn reinitialize(
        &mut self,
        network_config: NetworkConfig,
        low_watermark: SeqNo,
    ) {
        self.network_config = network_config;
        self.low_watermark = low_watermark;
        self.checkpoints.retain(|&seq_no, _| seq_no >= low_watermark);
        let seqs: Vec<SeqNo> = self.checkpoints.keys().copied().collect();
        for seq_no in seqs {
            self.evaluate(seq_no);
        }
        self.refresh_state();
    }

    /// Handler of a Checkpoint message.
    pub fn step(
        &mut self,
        source: NodeId,
        checkpoint: &Checkpoint,
    ) -> Result<(), MirError> {
        if checkpoint.seq_no < self.low_watermark {
            return Ok(()); // ignore if seq outdated
        }
        if self.network_config.node_index(source).is_none() {
            return byzantine_err!(
                "checkpoint from unknown node {} for seq {}",
                source,
                checkpoint.seq_no
            );
        }
        let ci = self.network_config.checkpoint_interval.max(1);
        if (checkpoint.seq_no - self.low_watermark) % ci != 0 {
            return byzantine_err!(
                "node {} sent checkpoint for unaligned seq {}",
                source,
                checkpoint.seq_no
            );
        }

        let horizon = self.low_watermark + TRACKED_INTERVALS * ci;
        if checkpoint.seq_no > horizon {
            let prior = self
                .checkpoints
                .range(horizon + 1..)
                .find(|(_, v)| v.votes.contains_key(&source))
                .map(|(&s, _)| s);
            match prior {
                Some(s) if s > checkpoint.seq_no => {
                    return Ok(()); // node already claims a higher one
                }
                Some(s) if s < checkpoint.seq_no => self.drop_vote(s, source),
                _ => {}
            }
        }

        let votes = self.checkpoints.entry(checkpoint.seq_no).or_default();
        if let Some(prev) = votes.votes.get(&source) {
            if *prev != checkpoint.value {
                return byzantine_err!(
                    "node {} sent conflicting checkpoints for seq {}",
                    source,
                    checkpoint.seq_no
                );
            }
            return Ok(()); // duplicate
        }
        pf_trace!(
            "received Checkpoint <- {} for seq {} value {:?}",
            source,
            checkpoint.seq_no,
            checkpoint.value
        );
        votes.votes.insert(source, checkpoint.value.clone());
        if source == self.my_id {
            votes.my_value = Some(checkpoint.value.clone());
        }

        self.evaluate(checkpoint.seq_no);
        self.refresh_state();
        Ok(())
    }

    // Withdraws a node's vote, forgetting the checkpoint if nobody else
    // voted for it.
    fn drop_vote(&mut self, seq_no: SeqNo, source: NodeId) {
        let Some(votes) = self.checkpoints.get_mut(&seq_no) else {
            return;
        };
        votes.votes.remove(&source);
        if source == self.my_id {
            votes.my_value = None;
        }
        if votes.votes.is_empty() {
            self.checkpoints.remove(&seq_no);
        } else {
            self.evaluate(seq_no);
        }
    }

    // Recomputes the certified value of a checkpoint.
    fn evaluate(&mut self, seq_no: SeqNo) {
        let Some(votes) = self.checkpoints.get(&seq_no) else {
            return;
        };
        let agreements = votes.agreements(&self.network_config);

        let weak: Vec<&Digest> = agreements
            .iter()
            .filter(|(_, m)| m.count() >= self.network_config.weak_quorum())
            .map(|(d, _)| *d)
            .collect();
        let forked = weak.len() > 1;
        if forked {
            pf_error!(
                "checkpoint fork at seq {}: {} values each backed by a correct node",
                seq_no,
                weak.len()
            );
        }

        let committed = agreements
            .iter()
            .find(|(_, m)| m.count() >= self.network_config.strong_quorum())
            .map(|(d, _)| (*d).clone());

        let votes = self.checkpoints.entry(seq_no).or_default();
        if let (Some(mine), Some(net)) = (&votes.my_value, &committed) {
            if mine != net {
                pf_error!(
                    "local checkpoint at seq {} diverges from network: {:?} vs {:?}",
                    seq_no,
                    mine,
                    net
                );
            }
        }
        if votes.committed_value.is_none() && committed.is_some() {
            pf_debug!("checkpoint at seq {} reached strong quorum", seq_no);
        }
        votes.committed_value = committed;
        votes.forked = forked;
    }

    fn refresh_state(&mut self) {
        let collectable = self
            .checkpoints
            .iter()
            .any(|(&s, v)| s > self.low_watermark && v.is_stable());
        self.state = if collectable {
            CheckpointTrackerState::GarbageCollectable
        } else {
            CheckpointTrackerState::Idle
        };
    }

    /// Moves the low watermark to the highest stable checkpoint, dropping
    /// everything older, and returns it.
    pub fn garbage_collect(&mut self) -> SeqNo {
        let new_low = self
            .checkpoints
            .iter()
            .filter(|(_, v)| v.is_stable())
            .map(|(&s, _)| s)
            .max()
            .unwrap_or(self.low_watermark)
            .max(self.low_watermark);
        self.checkpoints.retain(|&s, _| s >= new_low);
        self.low_watermark = new_low;
        self.state = CheckpointTrackerState::Idle;
        new_low
    }

    /// Highest certified checkpoint this node cannot reach by itself: its
    /// own value disagrees, or it lies beyond `reachable`.
    pub fn transfer_target(&self, reachable: SeqNo) -> Option<Checkpoint> {
        self.checkpoints
            .iter()
            .rev()
            .filter_map(|(&seq_no, v)| {
                let net = v.committed_value.as_ref()?;
                let diverged = v.my_value.as_ref().is_some_and(|m| m != net);
                let lagging = v.my_value.is_none() && seq_no > reachable;
                (diverged || lagging).then(|| Checkpoint {
                    seq_no,
                    value: net.clone(),
                })
            })
            .next()
    }

    #[inline]
    pub fn state(&self) -> CheckpointTrackerState {
        self.state
    }

    #[cfg(test)]
    fn low_watermark(&self) -> SeqNo {
        self.low_watermark
    }

    pub fn status(&self) -> Vec<CheckpointStatus> {
        self.checkpoints
            .iter()
            .map(|(&seq_no, v)| CheckpointStatus {
                seq_no,
                max_agreements: v
                    .agreements(&self.network_config)
                    .values()
                    .map(|m| m.count())
                    .max()
                    .unwrap_or(0),
                net_quorum: v.committed_value.is_some(),
                local_decision: v.my_value.is_some(),
                forked: v.forked,
            })
            .collect()
    }
}

#[cfg(test)]
mod checkpoint_tests {
    use super::*;

    fn config() -> NetworkConfig {
        NetworkConfig {
            nodes: vec![0, 1, 2, 3],
            checkpoint_interval: 5,
            max_epoch_length: 10,
            number_of_buckets: 1,
        }
    }

    fn cp(seq_no: SeqNo, v: u8) -> Checkpoint {
        Checkpoint {
            seq_no,
            value: Digest::from(vec![v]),
        }
    }

    #[test]
    fn collectable_iff_strong_quorum() -> Result<(), MirError> {
        let mut ct = CheckpointTracker::new(0, 0, config());
        ct.step(0, &cp(5, 1))?;
        ct.step(1, &cp(5, 1))?;
        assert_eq!(ct.state(), CheckpointTrackerState::Idle);
        ct.step(2, &cp(5, 1))?;
        assert_eq!(ct.state(), CheckpointTrackerState::GarbageCollectable);
        assert_eq!(ct.garbage_collect(), 5);
        assert_eq!(ct.state(), CheckpointTrackerState::Idle);
        assert_eq!(ct.low_watermark(), 5);
        Ok(())
    }

    #[test]
    fn divergent_values_do_not_collect() -> Result<(), MirError> {
        let mut ct = CheckpointTracker::new(0, 0, config());
        ct.step(0, &cp(5, 1))?;
        ct.step(1, &cp(5, 1))?;
        ct.step(2, &cp(5, 2))?;
        ct.step(3, &cp(5, 2))?;
        assert_eq!(ct.state(), CheckpointTrackerState::Idle);
        let status = ct.status();
        assert_eq!(status[0].max_agreements, 2);
        assert!(!status[0].net_quorum);
        assert!(status[0].forked);
        assert_eq!(ct.transfer_target(0), None);
        Ok(())
    }

    #[test]
    fn single_minority_value_is_no_fork() -> Result<(), MirError> {
        let mut ct = CheckpointTracker::new(0, 0, config());
        ct.step(0, &cp(5, 1))?;
        ct.step(1, &cp(5, 1))?;
        ct.step(2, &cp(5, 2))?;
        assert!(!ct.status()[0].forked);
        ct.step(3, &cp(5, 1))?;
        let status = ct.status();
        assert!(!status[0].forked);
        assert!(status[0].net_quorum);
        Ok(())
    }

    #[test]
    fn far_ahead_votes_bounded_per_node() -> Result<(), MirError> {
        let mut ct = CheckpointTracker::new(0, 0, config());
        for k in 1..=2000 {
            ct.step(1, &cp(5 * k, 1))?;
        }
        // four intervals in the window plus the single highest claim
        let status = ct.status();
        assert_eq!(status.len(), 5);
        assert_eq!(status.last().map(|s| s.seq_no), Some(10000));

        // a lower claim beyond the window does not displace the highest
        ct.step(1, &cp(9000, 1))?;
        assert_eq!(ct.status().len(), 5);

        // claims beyond the window still certify a transfer target
        ct.step(2, &cp(10000, 1))?;
        ct.step(3, &cp(10000, 1))?;
        assert_eq!(ct.status().len(), 5);
        assert_eq!(ct.transfer_target(10), Some(cp(10000, 1)));
        Ok(())
    }

    #[test]
    fn quorum_without_local_value_not_stable() -> Result<(), MirError> {
        let mut ct = CheckpointTracker::new(0, 0, config());
        ct.step(1, &cp(5, 1))?;
        ct.step(2, &cp(5, 1))?;
        ct.step(3, &cp(5, 1))?;
        assert_eq!(ct.state(), CheckpointTrackerState::Idle);
        // reachable by my own progress, no transfer
        assert_eq!(ct.transfer_target(10), None);
        // beyond what I can order, transfer
        assert_eq!(ct.transfer_target(4), Some(cp(5, 1)));
        ct.step(0, &cp(5, 1))?;
        assert_eq!(ct.state(), CheckpointTrackerState::GarbageCollectable);
        Ok(())
    }

    #[test]
    fn diverged_local_value_transfers() -> Result<(), MirError> {
        let mut ct = CheckpointTracker::new(0, 0, config());
        ct.step(0, &cp(5, 9))?;
        ct.step(1, &cp(5, 1))?;
        ct.step(2, &cp(5, 1))?;
        ct.step(3, &cp(5, 1))?;
        assert_eq!(ct.state(), CheckpointTrackerState::Idle);
        assert_eq!(ct.transfer_target(100), Some(cp(5, 1)));
        Ok(())
    }

    #[test]
    fn bad_votes_rejected() -> Result<(), MirError> {
        let mut ct = CheckpointTracker::new(0, 5, config());
        // stale, silently ignored
        ct.step(1, &cp(0, 1))?;
        assert!(ct.status().is_empty());
        assert!(ct.step(9, &cp(10, 1)).unwrap_err().is_byzantine());
        assert!(ct.step(1, &cp(12, 1)).unwrap_err().is_byzantine());
        ct.step(1, &cp(10, 1))?;
        ct.step(1, &cp(10, 1))?;
        assert!(ct.step(1, &cp(10, 2)).unwrap_err().is_byzantine());
        assert_eq!(ct.status()[0].max_agreements, 1);
        Ok(())
    }

    #[test]
    fn reinitialize_keeps_newer_votes() -> Result<(), MirError> {
        let mut ct = CheckpointTracker::new(0, 0, config());
        ct.step(1, &cp(5, 1))?;
        ct.step(1, &cp(10, 1))?;
        ct.step(2, &cp(10, 1))?;
        ct.reinitialize(config(), 10);
        let status = ct.status();
        assert_eq!(status.len(), 1);
        assert_eq!(status[0].seq_no, 10);
        assert_eq!(status[0].max_agreements, 2);
        Ok(())
    }
}
