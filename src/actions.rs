//! Actions emitted by the state machine for the caller to carry out.
//!
//! Every action is a request for work the core cannot do itself: deliver a
//! message, compute a hash, persist or truncate WAL records, apply committed
//! batches, or fetch a checkpointed state. Results come back as later
//! `StateEvent`s.

use bytes::Bytes;

use get_size::GetSize;

use serde::{Deserialize, Serialize};

use crate::messages::{
    ClientId, Digest, EpochChange, EpochNo, Msg, NetworkState, NodeId,
    Persistent, QEntry, ReqNo, RequestAck, SeqNo,
};

/// Where a hash request came from, echoed back with its result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, GetSize)]
pub enum HashOrigin {
    /// Batch assembled for (or received as a preprepare of) a sequence.
    Batch {
        source: NodeId,
        epoch: EpochNo,
        seq_no: SeqNo,
        request_acks: Vec<RequestAck>,
    },

    /// Epoch change sent by `origin`, received directly or through an ack
    /// from `source`.
    EpochChange {
        source: NodeId,
        origin: NodeId,
        epoch_change: EpochChange,
    },

    /// Batch forwarded by `source` in answer to a fetch.
    VerifyBatch {
        source: NodeId,
        seq_no: SeqNo,
        request_acks: Vec<RequestAck>,
        expected_digest: Digest,
    },

    /// Request payload forwarded by `source` in answer to a fetch.
    VerifyRequest {
        source: NodeId,
        request_ack: RequestAck,
        request_data: Vec<u8>,
    },
}

/// Notification that something became final.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, GetSize)]
pub enum Commit {
    /// Batch committed at its sequence; delivered in sequence order.
    Batch(QEntry),

    /// Request for the application to checkpoint its state at `seq_no`.
    Checkpoint {
        seq_no: SeqNo,
        network_state: NetworkState,
    },
}

/// Action type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, GetSize)]
pub enum Action {
    Send {
        targets: Vec<NodeId>,
        msg: Msg,
    },

    Hash {
        data: Vec<Vec<u8>>,
        origin: HashOrigin,
    },

    /// Durably write `data` at WAL `index`.
    AppendWriteAhead {
        index: u64,
        data: Persistent,
    },

    /// Durably drop every WAL record below `index`.
    TruncateWriteAhead {
        index: u64,
    },

    Commit(Commit),

    /// Fetch the application state at a checkpoint from other nodes.
    StateTransfer {
        seq_no: SeqNo,
        value: Digest,
    },

    /// A request number entered the client window; the request store should
    /// report the request once it holds it.
    AllocatedRequest {
        client_id: ClientId,
        req_no: ReqNo,
    },

    /// Request is known to be correct and can be ordered.
    CorrectRequest(RequestAck),

    /// Read the request payload from the request store and send it to
    /// `targets` as a `ForwardRequest`.
    ForwardRequest {
        targets: Vec<NodeId>,
        request_ack: RequestAck,
    },

    /// Persist a verified request payload fetched from a peer.
    StoreRequest {
        request_ack: RequestAck,
        request_data: Vec<u8>,
    },
}

/// Ordered batch of actions produced by one event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionList(Vec<Action>);

impl ActionList {
    pub fn new() -> Self {
        ActionList(vec![])
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[inline]
    pub fn push(&mut self, action: Action) -> &mut Self {
        self.0.push(action);
        self
    }

    /// Appends all actions of `other` in order.
    #[inline]
    pub fn concat(&mut self, other: ActionList) -> &mut Self {
        self.0.extend(other.0);
        self
    }

    pub fn send(&mut self, targets: &[NodeId], msg: Msg) -> &mut Self {
        self.push(Action::Send {
            targets: targets.to_vec(),
            msg,
        })
    }

    pub fn hash(&mut self, data: Vec<Vec<u8>>, origin: HashOrigin) -> &mut Self {
        self.push(Action::Hash { data, origin })
    }

    pub fn persist(&mut self, index: u64, data: Persistent) -> &mut Self {
        self.push(Action::AppendWriteAhead { index, data })
    }

    #[inline]
    pub fn iter(&self) -> std::slice::Iter<'_, Action> {
        self.0.iter()
    }

    #[inline]
    pub fn as_slice(&self) -> &[Action] {
        &self.0
    }

    /// Committed batches and checkpoint requests, in emission order.
    pub fn commits(&self) -> impl Iterator<Item = &Commit> {
        self.0.iter().filter_map(|a| match a {
            Action::Commit(c) => Some(c),
            _ => None,
        })
    }

    /// Encodes the batch into its canonical byte form.
    pub fn to_bytes(&self) -> Result<Bytes, crate::MirError> {
        Ok(Bytes::from(rmp_serde::to_vec(&self.0)?))
    }
}

impl IntoIterator for ActionList {
    type Item = Action;
    type IntoIter = std::vec::IntoIter<Action>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl From<Vec<Action>> for ActionList {
    fn from(v: Vec<Action>) -> Self {
        ActionList(v)
    }
}

#[cfg(test)]
mod actions_tests {
    use super::*;
    use crate::messages::{Suspect, Vote};

    #[test]
    fn concat_keeps_order() {
        let mut first = ActionList::new();
        first.push(Action::TruncateWriteAhead { index: 3 });
        let mut second = ActionList::new();
        second.send(&[0, 1], Msg::Suspect(Suspect { epoch: 2 }));
        second.push(Action::TruncateWriteAhead { index: 4 });
        first.concat(second);
        assert_eq!(first.len(), 3);
        assert_eq!(
            first.as_slice()[0],
            Action::TruncateWriteAhead { index: 3 }
        );
        assert_eq!(
            first.as_slice()[2],
            Action::TruncateWriteAhead { index: 4 }
        );
    }

    #[test]
    fn canonical_bytes_stable() -> Result<(), crate::MirError> {
        let build = || {
            let mut actions = ActionList::new();
            actions.send(
                &[0, 1, 2, 3],
                Msg::Prepare(Vote {
                    seq_no: 7,
                    epoch: 1,
                    digest: Digest::from(vec![9, 9]),
                }),
            );
            actions.push(Action::StateTransfer {
                seq_no: 5,
                value: Digest::from(vec![1]),
            });
            actions
        };
        assert_eq!(build().to_bytes()?, build().to_bytes()?);
        assert!(ActionList::new().is_empty());
        Ok(())
    }
}
