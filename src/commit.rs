//! Commit state: the committable watermark window and in-order delivery of
//! committed batches.

use std::collections::{BTreeMap, BTreeSet};

use crate::actions::{Action, ActionList, Commit};
use crate::events::CheckpointResult;
use crate::messages::{
    CEntry, Checkpoint, ClientId, ClientState, Digest, EpochConfig, Msg,
    NetworkState, Persistent, QEntry, ReqNo, SeqNo, TEntry,
};
use crate::persisted::{LogVisitor, Persisted};
use crate::utils::MirError;

/// Commit state module.
#[derive(Debug)]
pub struct CommitState {
    /// Sequence of the last applied checkpoint.
    low_watermark: SeqNo,

    /// Last sequence delivered to the application.
    last_applied_commit: SeqNo,

    /// Highest sequence known committed, delivered or not.
    highest_commit: SeqNo,

    /// Sequences above this may not be allocated nor committed.
    stop_at_seq_no: SeqNo,

    /// Network state as of the last applied checkpoint.
    active_state: NetworkState,

    /// Committed but not yet delivered batches.
    commits: BTreeMap<SeqNo, QEntry>,

    /// A checkpoint request is out and its result has not come back.
    checkpoint_pending: bool,

    /// Checkpoint sequence of the state transfer in flight, if any.
    transfer_seq_no: Option<SeqNo>,

    /// Requests delivered above the low watermark, by sequence. Dropped once
    /// the checkpoint covering them is applied.
    delivered: BTreeMap<SeqNo, Vec<(ClientId, ReqNo)>>,
}

// Finds the last checkpoint and any state transfer started after it.
#[derive(Default)]
struct CheckpointFinder {
    last_c_entry: Option<CEntry>,
    last_t_entry: Option<TEntry>,
}

impl LogVisitor for CheckpointFinder {
    fn on_c_entry(&mut self, entry: &CEntry) {
        self.last_c_entry = Some(entry.clone());
        self.last_t_entry = None;
    }

    fn on_t_entry(&mut self, entry: &TEntry) {
        self.last_t_entry = Some(entry.clone());
    }
}

impl CommitState {
    pub fn new(initial_state: NetworkState) -> Self {
        CommitState {
            low_watermark: 0,
            last_applied_commit: 0,
            highest_commit: 0,
            stop_at_seq_no: 0,
            active_state: initial_state,
            commits: BTreeMap::new(),
            checkpoint_pending: false,
            transfer_seq_no: None,
            delivered: BTreeMap::new(),
        }
    }

    /// Re-derives the window from the last checkpoint in the log. Resumes a
    /// state transfer that was started but never completed.
    pub fn reinitialize(
        &mut self,
        persisted: &Persisted,
    ) -> Result<ActionList, MirError> {
        let mut finder = CheckpointFinder::default();
        persisted.iterate(&mut finder);
        let Some(last) = finder.last_c_entry else {
            return fatal_err!("found no checkpoints in the log");
        };

        let ci = last.network_state.config.checkpoint_interval;
        self.low_watermark = last.seq_no;
        self.stop_at_seq_no =
            if last.network_state.pending_reconfigurations.is_empty() {
                last.seq_no + 2 * ci
            } else {
                last.seq_no + ci
            };
        self.active_state = last.network_state;
        self.last_applied_commit = self.low_watermark;
        self.highest_commit = self.low_watermark;
        self.commits.clear();
        self.delivered.clear();
        self.checkpoint_pending = false;
        self.transfer_seq_no = None;

        let mut actions = ActionList::new();
        if let Some(t) = finder.last_t_entry {
            pf_info!("resuming state transfer to seq {}", t.seq_no);
            self.transfer_seq_no = Some(t.seq_no);
            actions.push(Action::StateTransfer {
                seq_no: t.seq_no,
                value: t.value,
            });
        }
        pf_debug!(
            "commit state reinitialized low {} stop_at {}",
            self.low_watermark,
            self.stop_at_seq_no
        );
        Ok(actions)
    }

    /// Applies the application's checkpoint for the next interval boundary.
    pub fn apply_checkpoint_result(
        &mut self,
        epoch_config: Option<&EpochConfig>,
        result: &CheckpointResult,
        persisted: &mut Persisted,
    ) -> Result<ActionList, MirError> {
        if self.transfer_seq_no.is_some() {
            return Ok(ActionList::new());
        }

        let ci = self.active_state.config.checkpoint_interval;
        ensure!(
            result.seq_no == self.low_watermark + ci,
            "checkpoint result for seq {} is not one interval after low watermark {}",
            result.seq_no,
            self.low_watermark
        );
        pf_debug!("applying checkpoint result for seq {}", result.seq_no);

        if result.network_state.pending_reconfigurations.is_empty() {
            let new_ci = result.network_state.config.checkpoint_interval;
            self.stop_at_seq_no = result.seq_no + 2 * new_ci;
        } else {
            pf_debug!(
                "checkpoint {} carries pending reconfigurations, not extending stop_at {}",
                result.seq_no,
                self.stop_at_seq_no
            );
        }
        self.active_state = result.network_state.clone();
        self.low_watermark = result.seq_no;
        self.delivered = self.delivered.split_off(&(result.seq_no + 1));
        self.checkpoint_pending = false;

        let mut actions = persisted.append(Persistent::CEntry(CEntry {
            seq_no: result.seq_no,
            checkpoint_value: result.value.clone(),
            network_state: result.network_state.clone(),
            epoch_config: epoch_config.cloned(),
        }));
        actions.send(
            &self.active_state.config.nodes,
            Msg::Checkpoint(Checkpoint {
                seq_no: result.seq_no,
                value: result.value.clone(),
            }),
        );
        Ok(actions)
    }

    /// Starts a state transfer to the given checkpoint unless one is
    /// already in flight.
    pub fn transfer_to(
        &mut self,
        seq_no: SeqNo,
        value: Digest,
        persisted: &mut Persisted,
    ) -> ActionList {
        if self.transfer_seq_no.is_some() {
            return ActionList::new();
        }
        pf_info!("initiating state transfer to seq {}", seq_no);
        self.transfer_seq_no = Some(seq_no);
        let mut actions = persisted.append(Persistent::TEntry(TEntry {
            seq_no,
            value: value.clone(),
        }));
        actions.push(Action::StateTransfer { seq_no, value });
        actions
    }

    /// Records a committed batch for later in-order delivery.
    pub fn commit(&mut self, q_entry: QEntry) -> Result<(), MirError> {
        if q_entry.seq_no <= self.last_applied_commit {
            return Ok(()); // already delivered
        }
        ensure!(
            q_entry.seq_no <= self.stop_at_seq_no,
            "committed seq {} beyond stop_at {}",
            q_entry.seq_no,
            self.stop_at_seq_no
        );
        self.highest_commit = self.highest_commit.max(q_entry.seq_no);
        self.commits.entry(q_entry.seq_no).or_insert(q_entry);
        Ok(())
    }

    /// Delivers every committed batch that is next in sequence order,
    /// requesting a checkpoint at each interval boundary.
    pub fn drain(&mut self) -> ActionList {
        let mut actions = ActionList::new();
        let ci = self.active_state.config.checkpoint_interval;
        loop {
            if self.last_applied_commit == self.low_watermark + ci
                && !self.checkpoint_pending
            {
                let network_state = self.checkpoint_state();
                actions.push(Action::Commit(Commit::Checkpoint {
                    seq_no: self.last_applied_commit,
                    network_state,
                }));
                self.checkpoint_pending = true;
            }

            let bound = self.stop_at_seq_no.min(self.low_watermark + 2 * ci);
            if self.last_applied_commit >= bound {
                break;
            }
            let next = self.last_applied_commit + 1;
            let Some(q_entry) = self.commits.remove(&next) else {
                break;
            };
            self.delivered.insert(
                next,
                q_entry
                    .requests
                    .iter()
                    .map(|r| (r.client_id, r.req_no))
                    .collect(),
            );
            actions.push(Action::Commit(Commit::Batch(q_entry)));
            self.last_applied_commit = next;
        }
        actions
    }

    // Folds requests delivered up to the pending checkpoint into the client
    // windows of the active state.
    fn checkpoint_state(&self) -> NetworkState {
        self.fold_delivered(self.last_applied_commit)
    }

    fn fold_delivered(&self, through: SeqNo) -> NetworkState {
        let mut state = self.active_state.clone();
        let mut reqs: BTreeMap<ClientId, BTreeSet<ReqNo>> = BTreeMap::new();
        for (_, batch) in self.delivered.range(..=through) {
            for &(client_id, req_no) in batch {
                reqs.entry(client_id).or_default().insert(req_no);
            }
        }
        for client in state.clients.iter_mut() {
            if let Some(reqs) = reqs.remove(&client.id) {
                Self::advance_client(client, reqs);
            }
        }
        state
    }

    /// Client windows as of the last delivered batch.
    pub fn current_client_states(&self) -> Vec<ClientState> {
        self.fold_delivered(self.last_applied_commit).clients
    }

    fn advance_client(client: &mut ClientState, reqs: BTreeSet<ReqNo>) {
        let mut committed: BTreeSet<ReqNo> =
            client.committed.iter().copied().collect();
        committed.extend(reqs.into_iter().filter(|&r| r >= client.low_watermark));
        while committed.remove(&client.low_watermark) {
            client.low_watermark += 1;
        }
        client.committed = committed.into_iter().collect();
    }

    #[inline]
    pub fn low_watermark(&self) -> SeqNo {
        self.low_watermark
    }

    #[inline]
    pub fn stop_at_seq_no(&self) -> SeqNo {
        self.stop_at_seq_no
    }

    #[inline]
    pub fn last_applied_commit(&self) -> SeqNo {
        self.last_applied_commit
    }

    #[inline]
    pub fn highest_commit(&self) -> SeqNo {
        self.highest_commit
    }

    #[inline]
    pub fn active_state(&self) -> &NetworkState {
        &self.active_state
    }

    #[inline]
    pub fn is_transferring(&self) -> bool {
        self.transfer_seq_no.is_some()
    }

    /// Sequence the in-flight state transfer targets.
    #[inline]
    pub fn transfer_seq_no(&self) -> Option<SeqNo> {
        self.transfer_seq_no
    }
}

#[cfg(test)]
mod commit_tests {
    use super::*;
    use crate::messages::{NetworkConfig, RequestAck};
    use crate::persisted::initial_log;

    fn network_state() -> NetworkState {
        NetworkState::new(
            NetworkConfig {
                nodes: vec![0, 1, 2, 3],
                checkpoint_interval: 2,
                max_epoch_length: 10,
                number_of_buckets: 1,
            },
            &[7],
            8,
        )
    }

    fn ready_state() -> Result<(CommitState, Persisted), MirError> {
        let mut p = Persisted::new();
        for (i, r) in initial_log(network_state(), Digest::from(vec![0]))
            .into_iter()
            .enumerate()
        {
            p.append_initial_load(i as u64, r)?;
        }
        let mut cs = CommitState::new(network_state());
        assert!(cs.reinitialize(&p)?.is_empty());
        Ok((cs, p))
    }

    fn q(seq_no: SeqNo, reqs: &[ReqNo]) -> QEntry {
        QEntry {
            seq_no,
            digest: Digest::from(vec![seq_no as u8]),
            requests: reqs
                .iter()
                .map(|&r| RequestAck {
                    client_id: 7,
                    req_no: r,
                    digest: Digest::from(vec![r as u8]),
                })
                .collect(),
        }
    }

    fn batch_seqs(actions: &ActionList) -> Vec<SeqNo> {
        actions
            .commits()
            .filter_map(|c| match c {
                Commit::Batch(q) => Some(q.seq_no),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn reinit_from_log() -> Result<(), MirError> {
        let (cs, _) = ready_state()?;
        assert_eq!(cs.low_watermark(), 0);
        assert_eq!(cs.stop_at_seq_no(), 4);
        assert!(!cs.is_transferring());
        Ok(())
    }

    #[test]
    fn reinit_without_checkpoint_fatal() {
        let p = Persisted::new();
        let mut cs = CommitState::new(network_state());
        assert!(cs.reinitialize(&p).unwrap_err().is_fatal());
    }

    #[test]
    fn drain_in_order_once() -> Result<(), MirError> {
        let (mut cs, _) = ready_state()?;
        cs.commit(q(2, &[]))?;
        assert!(cs.drain().is_empty());
        cs.commit(q(1, &[]))?;
        let actions = cs.drain();
        assert_eq!(batch_seqs(&actions), vec![1, 2]);
        // checkpoint requested right after the boundary sequence
        assert!(matches!(
            actions.as_slice().last(),
            Some(Action::Commit(Commit::Checkpoint { seq_no: 2, .. }))
        ));
        // duplicates are ignored and nothing is re-emitted
        cs.commit(q(1, &[]))?;
        assert!(cs.drain().is_empty());
        Ok(())
    }

    #[test]
    fn drain_stops_at_window() -> Result<(), MirError> {
        let (mut cs, _) = ready_state()?;
        for s in 1..=4 {
            cs.commit(q(s, &[]))?;
        }
        assert!(cs.commit(q(5, &[])).unwrap_err().is_fatal());
        let actions = cs.drain();
        assert_eq!(batch_seqs(&actions), vec![1, 2, 3, 4]);
        assert_eq!(cs.last_applied_commit(), 4);
        Ok(())
    }

    #[test]
    fn checkpoint_cadence() -> Result<(), MirError> {
        let (mut cs, mut p) = ready_state()?;
        let result = CheckpointResult {
            seq_no: 4,
            value: Digest::from(vec![4]),
            network_state: network_state(),
        };
        let err = cs.apply_checkpoint_result(None, &result, &mut p).unwrap_err();
        assert!(err.is_fatal());

        let result = CheckpointResult {
            seq_no: 2,
            value: Digest::from(vec![2]),
            network_state: network_state(),
        };
        let actions = cs.apply_checkpoint_result(None, &result, &mut p)?;
        assert_eq!(actions.len(), 2);
        assert!(matches!(
            actions.as_slice()[0],
            Action::AppendWriteAhead {
                data: Persistent::CEntry(_),
                ..
            }
        ));
        assert!(matches!(
            actions.as_slice()[1],
            Action::Send {
                msg: Msg::Checkpoint(_),
                ..
            }
        ));
        assert_eq!(cs.low_watermark(), 2);
        assert_eq!(cs.stop_at_seq_no(), 6);
        Ok(())
    }

    #[test]
    fn pending_reconfiguration_holds_stop() -> Result<(), MirError> {
        let (mut cs, mut p) = ready_state()?;
        let mut state = network_state();
        state
            .pending_reconfigurations
            .push(crate::messages::Reconfiguration::RemoveClient { id: 7 });
        let result = CheckpointResult {
            seq_no: 2,
            value: Digest::from(vec![2]),
            network_state: state,
        };
        cs.apply_checkpoint_result(None, &result, &mut p)?;
        assert_eq!(cs.stop_at_seq_no(), 4);
        Ok(())
    }

    #[test]
    fn checkpoint_state_advances_clients() -> Result<(), MirError> {
        let (mut cs, _) = ready_state()?;
        cs.commit(q(1, &[0, 2]))?;
        cs.commit(q(2, &[1, 4]))?;
        let actions = cs.drain();
        let state = actions
            .commits()
            .find_map(|c| match c {
                Commit::Checkpoint { network_state, .. } => {
                    Some(network_state.clone())
                }
                _ => None,
            })
            .unwrap();
        let client = state.client(7).unwrap();
        assert_eq!(client.low_watermark, 3);
        assert_eq!(client.committed, vec![4]);
        assert_eq!(cs.current_client_states()[0].low_watermark, 3);

        // covered requests are dropped once the checkpoint applies
        let mut p = Persisted::new();
        for (i, r) in initial_log(network_state(), Digest::from(vec![0]))
            .into_iter()
            .enumerate()
        {
            p.append_initial_load(i as u64, r)?;
        }
        let result = CheckpointResult {
            seq_no: 2,
            value: Digest::from(vec![2]),
            network_state: state,
        };
        cs.apply_checkpoint_result(None, &result, &mut p)?;
        assert!(cs.delivered.is_empty());
        assert_eq!(cs.current_client_states()[0].low_watermark, 3);
        Ok(())
    }

    #[test]
    fn transfer_once() -> Result<(), MirError> {
        let (mut cs, mut p) = ready_state()?;
        let actions = cs.transfer_to(10, Digest::from(vec![10]), &mut p);
        assert_eq!(actions.len(), 2);
        assert_eq!(cs.transfer_seq_no(), Some(10));
        assert!(cs.transfer_to(12, Digest::from(vec![12]), &mut p).is_empty());
        assert_eq!(cs.transfer_seq_no(), Some(10));

        // checkpoint results are ignored while transferring
        let result = CheckpointResult {
            seq_no: 2,
            value: Digest::from(vec![2]),
            network_state: network_state(),
        };
        assert!(cs.apply_checkpoint_result(None, &result, &mut p)?.is_empty());

        // a restart resumes the transfer
        let mut cs2 = CommitState::new(network_state());
        let actions = cs2.reinitialize(&p)?;
        assert_eq!(
            actions.as_slice(),
            &[Action::StateTransfer {
                seq_no: 10,
                value: Digest::from(vec![10])
            }]
        );
        assert_eq!(cs2.transfer_seq_no(), Some(10));
        Ok(())
    }
}
