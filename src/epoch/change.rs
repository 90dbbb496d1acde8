//! Epoch change certificates: validation and derivation of the starting
//! state of a new epoch from a quorum of them.

use std::collections::BTreeMap;

use crate::messages::{
    Checkpoint, Digest, EpochChange, EpochConfig, EpochNo, NetworkConfig,
    NewEpochConfig, NodeId, SeqNo, SetEntry,
};
use crate::utils::MirError;

/// Epoch change indexed for new-epoch construction.
#[derive(Debug, Clone)]
pub struct ParsedEpochChange {
    pub source: NodeId,
    pub digest: Digest,
    pub underlying: EpochChange,

    /// Lowest checkpoint sequence the change covers.
    pub low_watermark: SeqNo,

    pub p_set: BTreeMap<SeqNo, SetEntry>,

    /// Sequence -> epoch -> digest queued in that epoch.
    pub q_set: BTreeMap<SeqNo, BTreeMap<EpochNo, Digest>>,
}

impl ParsedEpochChange {
    /// Validates and indexes an epoch change received from `source`.
    pub fn parse(
        source: NodeId,
        digest: Digest,
        underlying: EpochChange,
    ) -> Result<Self, MirError> {
        let Some(low_watermark) =
            underlying.checkpoints.iter().map(|c| c.seq_no).min()
        else {
            return byzantine_err!(
                "epoch change from {} for epoch {} has no checkpoints",
                source,
                underlying.new_epoch
            );
        };

        let mut p_set = BTreeMap::new();
        for entry in &underlying.p_set {
            if entry.epoch >= underlying.new_epoch {
                return byzantine_err!(
                    "epoch change from {} prepares seq {} in future epoch {}",
                    source,
                    entry.seq_no,
                    entry.epoch
                );
            }
            if p_set.insert(entry.seq_no, entry.clone()).is_some() {
                return byzantine_err!(
                    "epoch change from {} has duplicate p-set seq {}",
                    source,
                    entry.seq_no
                );
            }
        }

        let mut q_set: BTreeMap<SeqNo, BTreeMap<EpochNo, Digest>> = BTreeMap::new();
        for entry in &underlying.q_set {
            if entry.epoch >= underlying.new_epoch {
                return byzantine_err!(
                    "epoch change from {} queues seq {} in future epoch {}",
                    source,
                    entry.seq_no,
                    entry.epoch
                );
            }
            q_set
                .entry(entry.seq_no)
                .or_default()
                .insert(entry.epoch, entry.digest.clone());
        }

        Ok(ParsedEpochChange {
            source,
            digest,
            underlying,
            low_watermark,
            p_set,
            q_set,
        })
    }

    /// Whether this change queued `digest` at `seq_no` in some epoch.
    pub fn has_queued(&self, seq_no: SeqNo, digest: &Digest) -> bool {
        self.q_set
            .get(&seq_no)
            .is_some_and(|m| m.values().any(|d| d == digest))
    }
}

/// Derives the starting checkpoint and the certified batches of a new epoch
/// from a set of epoch changes. Returns `None` while the set does not yet
/// determine them.
pub fn construct_new_epoch_config(
    config: &NetworkConfig,
    new_leaders: Vec<NodeId>,
    changes: &BTreeMap<NodeId, ParsedEpochChange>,
) -> Result<Option<NewEpochConfig>, MirError> {
    let strong = config.strong_quorum();
    let weak = config.weak_quorum();

    let Some(new_epoch) = changes.values().next().map(|c| c.underlying.new_epoch)
    else {
        return Ok(None);
    };

    let mut supporters: BTreeMap<&Checkpoint, usize> = BTreeMap::new();
    for change in changes.values() {
        for cp in &change.underlying.checkpoints {
            *supporters.entry(cp).or_insert(0) += 1;
        }
    }

    // highest checkpoint vouched by a correct node that a strong quorum can
    // still build on
    let mut max_checkpoint: Option<&Checkpoint> = None;
    for (&cp, &count) in &supporters {
        if count < weak {
            continue;
        }
        let lower = changes
            .values()
            .filter(|c| c.low_watermark <= cp.seq_no)
            .count();
        if lower < strong {
            continue;
        }
        match max_checkpoint {
            Some(max) if max.seq_no > cp.seq_no => {}
            Some(max) if max.seq_no == cp.seq_no => {
                return fatal_err!(
                    "two correct quorums hold different checkpoints for seq {}",
                    cp.seq_no
                );
            }
            _ => max_checkpoint = Some(cp),
        }
    }
    let Some(start) = max_checkpoint else {
        return Ok(None);
    };

    let span = 2 * config.checkpoint_interval;
    let mut final_preprepares = Vec::with_capacity(span as usize);
    for offset in 0..span {
        let seq_no = start.seq_no + 1 + offset;
        match select_prepared(seq_no, changes, strong, weak) {
            Some(digest) => final_preprepares.push(digest),
            None => {
                // no prepared batch; a strong quorum must confirm nothing
                // prepared here
                let unprepared = changes
                    .values()
                    .filter(|c| c.low_watermark < seq_no)
                    .filter(|c| !c.p_set.contains_key(&seq_no))
                    .count();
                if unprepared < strong {
                    return Ok(None);
                }
                final_preprepares.push(Digest::empty());
            }
        }
    }
    while final_preprepares.last().is_some_and(|d| d.is_empty()) {
        final_preprepares.pop();
    }

    Ok(Some(NewEpochConfig {
        config: EpochConfig {
            number: new_epoch,
            leaders: new_leaders,
            planned_expiration: start.seq_no + config.max_epoch_length,
        },
        starting_checkpoint: start.clone(),
        final_preprepares,
    }))
}

// A prepared entry is selected when a strong quorum either has nothing newer
// prepared or prepared the same digest in the same epoch, and a weak quorum
// queued it in that epoch or later.
fn select_prepared(
    seq_no: SeqNo,
    changes: &BTreeMap<NodeId, ParsedEpochChange>,
    strong: usize,
    weak: usize,
) -> Option<Digest> {
    for change in changes.values() {
        let Some(entry) = change.p_set.get(&seq_no) else {
            continue;
        };

        let a1 = changes
            .values()
            .filter(|c| c.low_watermark < seq_no)
            .filter(|c| match c.p_set.get(&seq_no) {
                None => true,
                Some(e) if e.epoch < entry.epoch => true,
                Some(e) => e.epoch == entry.epoch && e.digest == entry.digest,
            })
            .count();
        if a1 < strong {
            continue;
        }

        let a2 = changes
            .values()
            .filter(|c| {
                c.q_set.get(&seq_no).is_some_and(|m| {
                    m.range(entry.epoch..).any(|(_, d)| *d == entry.digest)
                })
            })
            .count();
        if a2 < weak {
            continue;
        }

        return Some(entry.digest.clone());
    }
    None
}
