//! Events consumed by the state machine.

use get_size::GetSize;

use serde::{Deserialize, Serialize};

use crate::actions::HashOrigin;
use crate::messages::{
    CEntry, Digest, Msg, NetworkState, NodeId, Persistent, RequestAck, SeqNo,
};
use crate::utils::MirError;

/// Per-replica parameters handed over with `Initialize`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, GetSize)]
pub struct InitialParameters {
    /// My node ID.
    pub id: NodeId,

    /// Maximum number of requests a leader puts into one batch.
    pub batch_size: u32,

    /// Ticks between two leader heartbeats (possibly empty batches) and
    /// between request ack rebroadcasts.
    pub heartbeat_ticks: u32,

    /// Ticks without commit progress before the current epoch is suspected.
    pub suspect_ticks: u32,

    /// Ticks an epoch change may take before the target epoch is suspected.
    pub new_epoch_timeout_ticks: u32,

    /// Byte budget of messages buffered per peer for future epochs or
    /// sequences.
    pub buffer_size: u32,
}

#[allow(clippy::derivable_impls)]
impl Default for InitialParameters {
    fn default() -> Self {
        InitialParameters {
            id: 0,
            batch_size: 1,
            heartbeat_ticks: 2,
            suspect_ticks: 4,
            new_epoch_timeout_ticks: 8,
            buffer_size: 5 * 1024 * 1024,
        }
    }
}

impl InitialParameters {
    /// Composes parameters for node `id` from defaults overridden by an
    /// optional TOML string, then validates them.
    pub fn from_config(
        id: NodeId,
        config_str: Option<&str>,
    ) -> Result<Self, MirError> {
        let mut params = parsed_config!(config_str => InitialParameters;
                                        batch_size, heartbeat_ticks,
                                        suspect_ticks, new_epoch_timeout_ticks,
                                        buffer_size)?;
        params.id = id;
        params.validate()?;
        Ok(params)
    }

    /// Rejects parameter values the protocol cannot run with.
    pub fn validate(&self) -> Result<(), MirError> {
        if self.batch_size == 0 {
            return logged_err!("invalid config.batch_size '{}'", self.batch_size);
        }
        if self.heartbeat_ticks == 0 {
            return logged_err!(
                "invalid config.heartbeat_ticks '{}'",
                self.heartbeat_ticks
            );
        }
        if self.suspect_ticks <= self.heartbeat_ticks {
            return logged_err!(
                "invalid config.suspect_ticks '{}' (must exceed heartbeat_ticks {})",
                self.suspect_ticks,
                self.heartbeat_ticks
            );
        }
        if self.new_epoch_timeout_ticks == 0 {
            return logged_err!(
                "invalid config.new_epoch_timeout_ticks '{}'",
                self.new_epoch_timeout_ticks
            );
        }
        Ok(())
    }
}

/// Checkpoint computed by the application after a `Commit::Checkpoint`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, GetSize)]
pub struct CheckpointResult {
    pub seq_no: SeqNo,
    pub value: Digest,
    pub network_state: NetworkState,
}

/// Digest computed for an `Action::Hash`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, GetSize)]
pub struct HashResult {
    pub digest: Digest,
    pub origin: HashOrigin,
}

/// Results of previously emitted actions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, GetSize)]
pub struct ActionResults {
    pub checkpoints: Vec<CheckpointResult>,
    pub digests: Vec<HashResult>,
}

/// Results reported by the client request store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, GetSize)]
pub struct ClientActionResults {
    /// Requests now durably held by the local request store.
    pub persisted: Vec<RequestAck>,
}

/// State machine input event type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, GetSize)]
pub enum StateEvent {
    Initialize(InitialParameters),

    /// Replays one WAL record; only valid before `CompleteInitialization`.
    LoadEntry {
        index: u64,
        data: Persistent,
    },

    CompleteInitialization,

    Tick,

    Step {
        source: NodeId,
        msg: Msg,
    },

    AddResults(ActionResults),

    AddClientResults(ClientActionResults),

    /// Requested state transfer completed at the given checkpoint.
    Transfer(CEntry),

    /// Caller finished acting on the previous action batch.
    ActionsReceived,

    /// Caller finished acting on the previous client actions.
    ClientActionsReceived,
}
