//! Per-sequence three-phase agreement: allocation, preprepare, prepare and
//! commit of one batch within one epoch.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::actions::{ActionList, HashOrigin};
use crate::batch::batch_hash_data;
use crate::messages::{
    Digest, EpochNo, Msg, NodeId, PEntry, Persistent, Preprepare, QEntry,
    RequestAck, SeqNo, Vote,
};
use crate::persisted::Persisted;
use crate::utils::MirError;

/// Agreement progress of a sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum SequenceState {
    Uninitialized,
    Allocated,
    Preprepared,
    Prepared,
    Committed,
}

/// One ordering slot of the active epoch.
#[derive(Debug)]
pub struct Sequence {
    my_id: NodeId,
    owner: NodeId,
    seq_no: SeqNo,
    epoch: EpochNo,

    nodes: Vec<NodeId>,
    strong_quorum: usize,

    state: SequenceState,

    batch: Vec<RequestAck>,
    digest: Option<Digest>,

    /// Requests of the batch not yet known correct locally.
    outstanding: BTreeSet<RequestAck>,
    hash_requested: bool,

    /// Digest -> nodes voting for it.
    prepares: BTreeMap<Digest, BTreeSet<NodeId>>,
    commits: BTreeMap<Digest, BTreeSet<NodeId>>,

    /// Node -> digest it voted for, per phase.
    prepared_by: BTreeMap<NodeId, Digest>,
    committed_by: BTreeMap<NodeId, Digest>,
}

impl Sequence {
    pub fn new(
        my_id: NodeId,
        owner: NodeId,
        seq_no: SeqNo,
        epoch: EpochNo,
        nodes: Vec<NodeId>,
        strong_quorum: usize,
    ) -> Self {
        Sequence {
            my_id,
            owner,
            seq_no,
            epoch,
            nodes,
            strong_quorum,
            state: SequenceState::Uninitialized,
            batch: vec![],
            digest: None,
            outstanding: BTreeSet::new(),
            hash_requested: false,
            prepares: BTreeMap::new(),
            commits: BTreeMap::new(),
            prepared_by: BTreeMap::new(),
            committed_by: BTreeMap::new(),
        }
    }

    #[inline]
    pub fn state(&self) -> SequenceState {
        self.state
    }

    #[inline]
    pub fn seq_no(&self) -> SeqNo {
        self.seq_no
    }

    /// The queued batch record, once the digest is known.
    pub fn q_entry(&self) -> Option<QEntry> {
        self.digest.as_ref().map(|d| QEntry {
            seq_no: self.seq_no,
            digest: d.clone(),
            requests: self.batch.clone(),
        })
    }

    /// Assigns a batch to this sequence. Hashing starts once every request
    /// in it is known correct.
    pub fn allocate(
        &mut self,
        batch: Vec<RequestAck>,
        outstanding: Vec<RequestAck>,
    ) -> Result<ActionList, MirError> {
        ensure!(
            self.state == SequenceState::Uninitialized,
            "seq {} allocated twice (state {:?})",
            self.seq_no,
            self.state
        );
        self.state = SequenceState::Allocated;
        self.batch = batch;
        self.outstanding = outstanding.into_iter().collect();
        Ok(self.request_hash())
    }

    /// A request of the batch became known correct.
    pub fn satisfy_outstanding(&mut self, ack: &RequestAck) -> ActionList {
        if self.outstanding.remove(ack) {
            self.request_hash()
        } else {
            ActionList::new()
        }
    }

    fn request_hash(&mut self) -> ActionList {
        let mut actions = ActionList::new();
        if self.state != SequenceState::Allocated
            || self.hash_requested
            || !self.outstanding.is_empty()
        {
            return actions;
        }
        self.hash_requested = true;
        actions.hash(
            batch_hash_data(&self.batch),
            HashOrigin::Batch {
                source: self.owner,
                epoch: self.epoch,
                seq_no: self.seq_no,
                request_acks: self.batch.clone(),
            },
        );
        actions
    }

    /// Batch digest is known: persist the batch and vote on it.
    pub fn apply_batch_hash_result(
        &mut self,
        digest: Digest,
        persisted: &mut Persisted,
    ) -> Result<ActionList, MirError> {
        ensure!(
            self.state == SequenceState::Allocated,
            "seq {} got batch digest in state {:?}",
            self.seq_no,
            self.state
        );
        self.state = SequenceState::Preprepared;
        self.digest = Some(digest.clone());

        let mut actions = persisted.append(Persistent::QEntry(QEntry {
            seq_no: self.seq_no,
            digest: digest.clone(),
            requests: self.batch.clone(),
        }));
        if self.owner == self.my_id {
            actions.send(
                &self.nodes,
                Msg::Preprepare(Preprepare {
                    seq_no: self.seq_no,
                    epoch: self.epoch,
                    batch: self.batch.clone(),
                }),
            );
        } else {
            actions.send(
                &self.nodes,
                Msg::Prepare(Vote {
                    seq_no: self.seq_no,
                    epoch: self.epoch,
                    digest,
                }),
            );
        }
        actions.concat(self.check_prepare_quorum(persisted));
        Ok(actions)
    }

    /// Replays a queued batch from the log.
    pub fn apply_q_entry(&mut self, q_entry: &QEntry) {
        self.batch = q_entry.requests.clone();
        self.digest = Some(q_entry.digest.clone());
        self.state = self.state.max(SequenceState::Preprepared);
        self.hash_requested = true;
    }

    /// Replays a prepare certificate from the log.
    pub fn apply_p_entry(&mut self, p_entry: &PEntry) {
        self.digest = Some(p_entry.digest.clone());
        self.state = self.state.max(SequenceState::Prepared);
    }

    /// Starts the sequence already prepared on a certified batch; used for
    /// the final preprepares of a new epoch.
    pub fn prepare_certified(
        &mut self,
        batch: Vec<RequestAck>,
        digest: Digest,
        persisted: &mut Persisted,
    ) -> ActionList {
        self.batch = batch;
        self.digest = Some(digest.clone());
        self.hash_requested = true;
        self.state = SequenceState::Prepared;
        let mut actions = persisted.append(Persistent::QEntry(QEntry {
            seq_no: self.seq_no,
            digest: digest.clone(),
            requests: self.batch.clone(),
        }));
        actions.concat(persisted.append(Persistent::PEntry(PEntry {
            seq_no: self.seq_no,
            digest: digest.clone(),
        })));
        actions.send(
            &self.nodes,
            Msg::Commit(Vote {
                seq_no: self.seq_no,
                epoch: self.epoch,
                digest,
            }),
        );
        actions
    }

    /// Re-sends this node's latest vote, after recovering from the log.
    pub fn resend_vote(&self) -> ActionList {
        let mut actions = ActionList::new();
        let Some(digest) = self.digest.clone() else {
            return actions;
        };
        let vote = Vote {
            seq_no: self.seq_no,
            epoch: self.epoch,
            digest,
        };
        match self.state {
            SequenceState::Preprepared if self.owner == self.my_id => {
                actions.send(
                    &self.nodes,
                    Msg::Preprepare(Preprepare {
                        seq_no: self.seq_no,
                        epoch: self.epoch,
                        batch: self.batch.clone(),
                    }),
                );
            }
            SequenceState::Preprepared => {
                actions.send(&self.nodes, Msg::Prepare(vote));
            }
            SequenceState::Prepared | SequenceState::Committed => {
                actions.send(&self.nodes, Msg::Commit(vote));
            }
            _ => {}
        }
        actions
    }

    pub fn apply_prepare(
        &mut self,
        source: NodeId,
        digest: &Digest,
        persisted: &mut Persisted,
    ) -> Result<ActionList, MirError> {
        if source == self.owner {
            return byzantine_err!(
                "leader {} sent a prepare for its own seq {}",
                source,
                self.seq_no
            );
        }
        if let Some(prev) = self.prepared_by.get(&source) {
            if prev != digest {
                return byzantine_err!(
                    "node {} prepared two digests for seq {}",
                    source,
                    self.seq_no
                );
            }
            return Ok(ActionList::new());
        }
        self.prepared_by.insert(source, digest.clone());
        self.prepares.entry(digest.clone()).or_default().insert(source);
        Ok(self.check_prepare_quorum(persisted))
    }

    /// Records a commit vote. Returns whether the sequence just committed.
    pub fn apply_commit(
        &mut self,
        source: NodeId,
        digest: &Digest,
    ) -> Result<bool, MirError> {
        if let Some(prev) = self.committed_by.get(&source) {
            if prev != digest {
                return byzantine_err!(
                    "node {} committed two digests for seq {}",
                    source,
                    self.seq_no
                );
            }
            return Ok(false);
        }
        self.committed_by.insert(source, digest.clone());
        self.commits.entry(digest.clone()).or_default().insert(source);
        Ok(self.check_commit_quorum())
    }

    // The leader's preprepare stands in for its prepare.
    fn check_prepare_quorum(&mut self, persisted: &mut Persisted) -> ActionList {
        let mut actions = ActionList::new();
        if self.state != SequenceState::Preprepared {
            return actions;
        }
        let Some(digest) = self.digest.clone() else {
            return actions;
        };
        let votes = self.prepares.get(&digest).map_or(0, |v| v.len());
        if votes + 1 < self.strong_quorum {
            return actions;
        }
        pf_trace!("seq {} prepared", self.seq_no);
        self.state = SequenceState::Prepared;
        actions.concat(persisted.append(Persistent::PEntry(PEntry {
            seq_no: self.seq_no,
            digest: digest.clone(),
        })));
        actions.send(
            &self.nodes,
            Msg::Commit(Vote {
                seq_no: self.seq_no,
                epoch: self.epoch,
                digest,
            }),
        );
        actions
    }

    /// Moves to Committed if prepared and a strong quorum committed the
    /// same digest. Returns whether the transition happened now.
    pub fn check_commit_quorum(&mut self) -> bool {
        if self.state != SequenceState::Prepared {
            return false;
        }
        let Some(digest) = &self.digest else {
            return false;
        };
        let votes = self.commits.get(digest).map_or(0, |v| v.len());
        if votes < self.strong_quorum {
            return false;
        }
        pf_trace!("seq {} committed", self.seq_no);
        self.state = SequenceState::Committed;
        true
    }
}
