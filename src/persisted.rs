//! Write-ahead log store: the in-memory mirror of the durable WAL.
//!
//! Records live in an index-addressed arena with a head cursor. Appending
//! produces the action that makes the record durable; truncation only ever
//! drops records from the head.

use std::collections::HashMap;

use crate::actions::{Action, ActionList};
use crate::messages::{
    CEntry, Checkpoint, ECEntry, EpochChange, EpochConfig, EpochNo, FEntry,
    NEntry, NetworkState, PEntry, Persistent, QEntry, SeqNo, SetEntry, Suspect,
    TEntry,
};
use crate::utils::MirError;

/// Typed forward walk over the log. Every method defaults to a no-op so a
/// visitor only implements the record kinds it cares about.
pub trait LogVisitor {
    fn on_p_entry(&mut self, _entry: &PEntry) {}
    fn on_q_entry(&mut self, _entry: &QEntry) {}
    fn on_c_entry(&mut self, _entry: &CEntry) {}
    fn on_n_entry(&mut self, _entry: &NEntry) {}
    fn on_f_entry(&mut self, _entry: &FEntry) {}
    fn on_ec_entry(&mut self, _entry: &ECEntry) {}
    fn on_t_entry(&mut self, _entry: &TEntry) {}
    fn on_suspect(&mut self, _entry: &Suspect) {}

    /// Checked after every visited record; returning true stops the walk.
    fn should_exit(&self) -> bool {
        false
    }
}

/// The WAL store.
#[derive(Debug, Default)]
pub struct Persisted {
    /// Record arena; `records[0]` has index `base_index`.
    records: Vec<Persistent>,

    /// Index of the first arena slot.
    base_index: u64,

    /// Arena position of the current log head.
    head: usize,

    /// Index the next appended record will get.
    next_index: u64,
}

impl Persisted {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a record read back from durable storage. Indices must be
    /// contiguous.
    pub fn append_initial_load(
        &mut self,
        index: u64,
        data: Persistent,
    ) -> Result<(), MirError> {
        if self.records.is_empty() {
            self.base_index = index;
            self.head = 0;
            self.next_index = index;
        }
        ensure!(
            self.next_index == index,
            "WAL indexes out of order: expected {} got {}, WAL corrupted?",
            self.next_index,
            index
        );
        self.records.push(data);
        self.next_index = index + 1;
        Ok(())
    }

    /// Appends a record at the next index and returns the action making it
    /// durable.
    pub fn append(&mut self, data: Persistent) -> ActionList {
        if self.records.is_empty() {
            self.base_index = self.next_index;
            self.head = 0;
        }
        let index = self.next_index;
        self.records.push(data.clone());
        self.next_index += 1;

        let mut actions = ActionList::new();
        actions.persist(index, data);
        actions
    }

    /// Drops every record before the first one still needed once the low
    /// watermark reaches `low_watermark`: a `CEntry` at or above it, or an
    /// `NEntry` strictly above it.
    pub fn truncate(&mut self, low_watermark: SeqNo) -> ActionList {
        let mut actions = ActionList::new();
        let keep = self.records[self.head..].iter().position(|r| match r {
            Persistent::CEntry(c) => c.seq_no >= low_watermark,
            Persistent::NEntry(n) => n.seq_no > low_watermark,
            _ => false,
        });
        let Some(offset) = keep else {
            return actions;
        };
        if offset == 0 {
            return actions; // head already in place
        }

        self.head += offset;
        let index = self.base_index + self.head as u64;
        pf_debug!("truncating WAL through seq {} at index {}", low_watermark, index);
        actions.push(Action::TruncateWriteAhead { index });

        // compact the arena once the dead prefix dominates
        if self.head > self.records.len() / 2 {
            self.records.drain(..self.head);
            self.base_index = index;
            self.head = 0;
        }
        actions
    }

    /// Walks the live log from head to tail.
    pub fn iterate(&self, visitor: &mut impl LogVisitor) {
        for record in &self.records[self.head..] {
            match record {
                Persistent::PEntry(e) => visitor.on_p_entry(e),
                Persistent::QEntry(e) => visitor.on_q_entry(e),
                Persistent::CEntry(e) => visitor.on_c_entry(e),
                Persistent::NEntry(e) => visitor.on_n_entry(e),
                Persistent::FEntry(e) => visitor.on_f_entry(e),
                Persistent::ECEntry(e) => visitor.on_ec_entry(e),
                Persistent::TEntry(e) => visitor.on_t_entry(e),
                Persistent::Suspect(e) => visitor.on_suspect(e),
            }
            if visitor.should_exit() {
                break;
            }
        }
    }

    /// Index of the current head record.
    #[inline]
    pub fn head_index(&self) -> u64 {
        self.base_index + self.head as u64
    }

    #[cfg(test)]
    fn next_index(&self) -> u64 {
        self.next_index
    }

    /// Number of live records.
    #[inline]
    pub fn len(&self) -> usize {
        self.records.len() - self.head
    }

    /// Live records with their indices, head first.
    #[cfg(test)]
    fn entries(&self) -> impl Iterator<Item = (u64, &Persistent)> {
        let base = self.head_index();
        self.records[self.head..]
            .iter()
            .enumerate()
            .map(move |(i, r)| (base + i as u64, r))
    }

    /// Summarizes the log into an epoch change targeting `new_epoch`.
    pub fn construct_epoch_change(&self, new_epoch: EpochNo) -> EpochChange {
        // only the last PEntry of each sequence goes into the prepared set,
        // earlier ones are stale votes from before compaction
        let mut counter = PEntryCounter {
            new_epoch,
            log_epoch: None,
            counts: HashMap::new(),
        };
        self.iterate(&mut counter);

        let mut builder = EpochChangeBuilder {
            new_epoch,
            log_epoch: None,
            skips: counter.counts,
            change: EpochChange {
                new_epoch,
                checkpoints: vec![],
                p_set: vec![],
                q_set: vec![],
            },
        };
        self.iterate(&mut builder);
        builder.change
    }
}

/// Initial log of a fresh network: a genesis checkpoint followed by the
/// end of epoch zero, so that the first epoch change targets epoch one.
pub fn initial_log(
    network_state: NetworkState,
    checkpoint_value: crate::messages::Digest,
) -> Vec<Persistent> {
    let leaders = network_state.config.nodes.clone();
    vec![
        Persistent::CEntry(CEntry {
            seq_no: 0,
            checkpoint_value,
            network_state,
            epoch_config: None,
        }),
        Persistent::FEntry(FEntry {
            ends_epoch_config: EpochConfig {
                number: 0,
                leaders,
                planned_expiration: 0,
            },
        }),
    ]
}

// First pass of epoch change construction.
struct PEntryCounter {
    new_epoch: EpochNo,
    log_epoch: Option<EpochNo>,
    counts: HashMap<SeqNo, usize>,
}

impl LogVisitor for PEntryCounter {
    fn on_p_entry(&mut self, entry: &PEntry) {
        *self.counts.entry(entry.seq_no).or_insert(0) += 1;
    }

    fn on_c_entry(&mut self, entry: &CEntry) {
        if let Some(config) = &entry.epoch_config {
            self.log_epoch = Some(config.number);
        }
    }

    fn on_n_entry(&mut self, entry: &NEntry) {
        self.log_epoch = Some(entry.epoch_config.number);
    }

    fn on_f_entry(&mut self, entry: &FEntry) {
        self.log_epoch = Some(entry.ends_epoch_config.number);
    }

    fn should_exit(&self) -> bool {
        self.log_epoch.is_some_and(|e| e >= self.new_epoch)
    }
}

// Second pass of epoch change construction.
struct EpochChangeBuilder {
    new_epoch: EpochNo,
    log_epoch: Option<EpochNo>,
    skips: HashMap<SeqNo, usize>,
    change: EpochChange,
}

impl LogVisitor for EpochChangeBuilder {
    fn on_p_entry(&mut self, entry: &PEntry) {
        let count = self.skips.get(&entry.seq_no).copied().unwrap_or(0);
        if count > 1 {
            self.skips.insert(entry.seq_no, count - 1);
            return;
        }
        let Some(epoch) = self.log_epoch else {
            return;
        };
        self.change.p_set.push(SetEntry {
            epoch,
            seq_no: entry.seq_no,
            digest: entry.digest.clone(),
        });
    }

    fn on_q_entry(&mut self, entry: &QEntry) {
        let Some(epoch) = self.log_epoch else {
            return;
        };
        self.change.q_set.push(SetEntry {
            epoch,
            seq_no: entry.seq_no,
            digest: entry.digest.clone(),
        });
    }

    fn on_c_entry(&mut self, entry: &CEntry) {
        if let Some(config) = &entry.epoch_config {
            self.log_epoch = Some(config.number);
        }
        self.change.checkpoints.push(Checkpoint {
            seq_no: entry.seq_no,
            value: entry.checkpoint_value.clone(),
        });
    }

    fn on_n_entry(&mut self, entry: &NEntry) {
        self.log_epoch = Some(entry.epoch_config.number);
    }

    fn on_f_entry(&mut self, entry: &FEntry) {
        self.log_epoch = Some(entry.ends_epoch_config.number);
    }

    fn should_exit(&self) -> bool {
        self.log_epoch.is_some_and(|e| e >= self.new_epoch)
    }
}
