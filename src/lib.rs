//! Mircore: the deterministic state machine at the heart of a multi-leader,
//! epoch-based Byzantine fault tolerant ordering protocol.
//!
//! The state machine performs no I/O. The caller feeds it `StateEvent`s
//! (ticks, peer messages, hash and checkpoint results, WAL replay) and
//! carries out the returned `ActionList` (send, hash, persist, deliver).
//! Given the same event sequence every replica produces the same actions.

#[macro_use]
mod utils;

pub mod actions;
pub mod events;
pub mod messages;

mod batch;
mod checkpoint;
mod clients;
mod commit;
mod epoch;
mod outstanding;
mod persisted;
mod sequence;
mod statemachine;
mod status;

#[cfg(test)]
mod simulator;

pub use utils::{logger_init, MirError, ME};

#[doc(hidden)]
pub use utils::__log;

pub use actions::{Action, ActionList, Commit, HashOrigin};
pub use checkpoint::CheckpointStatus;
pub use clients::ClientWindowStatus;
pub use epoch::{BucketStatus, EpochTargetState, EpochTargetStatus, EpochTrackerStatus};
pub use events::{
    ActionResults, CheckpointResult, ClientActionResults, HashResult,
    InitialParameters, StateEvent,
};
pub use persisted::initial_log;
pub use sequence::SequenceState;
pub use statemachine::StateMachine;
pub use status::{MachineState, StateMachineStatus};
