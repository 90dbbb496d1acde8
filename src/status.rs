//! Read-only snapshot of a state machine, for debugging and monitoring.

use std::fmt;

use serde::Serialize;

use crate::checkpoint::CheckpointStatus;
use crate::clients::ClientWindowStatus;
use crate::epoch::EpochTrackerStatus;
use crate::messages::{NodeId, SeqNo};
use crate::sequence::SequenceState;

/// Lifecycle of the state machine itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MachineState {
    Uninitialized,
    LoadingPersisted,
    Initialized,
}

/// Snapshot returned by `StateMachine::status()`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateMachineStatus {
    pub node_id: NodeId,
    pub state: MachineState,

    pub low_watermark: SeqNo,
    /// Highest sequence allocated by the active epoch, or the low watermark
    /// while no epoch is active.
    pub high_watermark: SeqNo,
    pub last_applied_commit: SeqNo,
    pub highest_commit: SeqNo,
    pub stop_at_seq_no: SeqNo,
    pub transferring: bool,

    pub wal_head: u64,
    pub wal_len: usize,

    pub checkpoints: Vec<CheckpointStatus>,
    pub clients: Vec<ClientWindowStatus>,
    pub epoch_tracker: EpochTrackerStatus,
}

impl StateMachineStatus {
    /// Encodes the snapshot as a MessagePack map with named fields.
    pub fn to_msgpack(&self) -> Result<Vec<u8>, crate::MirError> {
        Ok(rmp_serde::to_vec_named(self)?)
    }
}

fn seq_char(state: SequenceState) -> char {
    match state {
        SequenceState::Uninitialized => '.',
        SequenceState::Allocated => 'A',
        SequenceState::Preprepared => 'Q',
        SequenceState::Prepared => 'P',
        SequenceState::Committed => 'C',
    }
}

impl fmt::Display for StateMachineStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(
            f,
            "node {} {:?}: low {} high {} applied {} highest {} stop_at {}{}",
            self.node_id,
            self.state,
            self.low_watermark,
            self.high_watermark,
            self.last_applied_commit,
            self.highest_commit,
            self.stop_at_seq_no,
            if self.transferring { " (transferring)" } else { "" }
        )?;
        writeln!(f, "  wal: head {} len {}", self.wal_head, self.wal_len)?;

        let epoch = &self.epoch_tracker.current;
        writeln!(
            f,
            "  epoch {} {:?}: changes {:?} echos {:?} readies {:?} suspicions {:?}",
            epoch.number,
            epoch.state,
            epoch.epoch_changes,
            epoch.echos,
            epoch.readies,
            epoch.suspicions
        )?;
        for bucket in &epoch.buckets {
            let seqs: String = bucket.sequences.iter().map(|s| seq_char(*s)).collect();
            writeln!(f, "  bucket {} leader {}: [{}]", bucket.id, bucket.leader, seqs)?;
        }

        for cp in &self.checkpoints {
            writeln!(
                f,
                "  checkpoint {}: agreements {} quorum {} local {}{}",
                cp.seq_no,
                cp.max_agreements,
                cp.net_quorum,
                cp.local_decision,
                if cp.forked { " FORKED" } else { "" }
            )?;
        }
        for client in &self.clients {
            let reqs: String = client
                .allocated
                .iter()
                .map(|&a| match a {
                    0 => '.',
                    1 => 'a',
                    2 => 'c',
                    _ => 'S',
                })
                .collect();
            writeln!(
                f,
                "  client {} [{}..={}]: {}",
                client.client_id, client.low_watermark, client.high_watermark, reqs
            )?;
        }
        Ok(())
    }
}
