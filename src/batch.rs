//! Batch tracker: known batches by digest, plus fetches of batches this node
//! is missing.

use std::collections::{BTreeMap, BTreeSet};

use crate::actions::{ActionList, HashOrigin};
use crate::messages::{
    Digest, Msg, NodeId, QEntry, RequestAck, SeqNo,
};
use crate::persisted::{LogVisitor, Persisted};
use crate::utils::MirError;

/// A batch known locally.
#[derive(Debug, Clone)]
struct Batch {
    request_acks: Vec<RequestAck>,

    /// Sequences this batch was seen at.
    observed_sequences: BTreeSet<SeqNo>,
}

/// Batch tracker module.
#[derive(Debug, Default)]
pub struct BatchTracker {
    batches_by_digest: BTreeMap<Digest, Batch>,

    /// Digest -> sequences waiting on a fetch of that batch.
    fetch_in_flight: BTreeMap<Digest, BTreeSet<SeqNo>>,
}

// Collects every queued batch still in the log.
#[derive(Default)]
struct QEntryCollector {
    q_entries: Vec<QEntry>,
}

impl LogVisitor for QEntryCollector {
    fn on_q_entry(&mut self, entry: &QEntry) {
        self.q_entries.push(entry.clone());
    }
}

/// Digest input of a batch: the digests of its requests in order.
pub fn batch_hash_data(request_acks: &[RequestAck]) -> Vec<Vec<u8>> {
    request_acks
        .iter()
        .map(|ack| ack.digest.as_bytes().to_vec())
        .collect()
}

impl BatchTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds the batch set from the queued batches in the log. In-flight
    /// fetches are abandoned.
    pub fn reinitialize(&mut self, persisted: &Persisted) {
        let mut collector = QEntryCollector::default();
        persisted.iterate(&mut collector);
        self.batches_by_digest.clear();
        self.fetch_in_flight.clear();
        for q in collector.q_entries {
            self.add_batch(q.seq_no, q.digest, q.requests);
        }
    }

    /// Records a batch whose digest is known.
    pub fn add_batch(
        &mut self,
        seq_no: SeqNo,
        digest: Digest,
        request_acks: Vec<RequestAck>,
    ) {
        let batch = self.batches_by_digest.entry(digest).or_insert(Batch {
            request_acks,
            observed_sequences: BTreeSet::new(),
        });
        batch.observed_sequences.insert(seq_no);
    }

    #[inline]
    pub fn get_batch(&self, digest: &Digest) -> Option<&[RequestAck]> {
        self.batches_by_digest
            .get(digest)
            .map(|b| b.request_acks.as_slice())
    }

    #[inline]
    pub fn has_batch(&self, digest: &Digest) -> bool {
        digest.is_empty() || self.batches_by_digest.contains_key(digest)
    }

    /// Asks `sources` for a missing batch, at most once per digest.
    pub fn fetch_batch(
        &mut self,
        seq_no: SeqNo,
        digest: Digest,
        sources: &[NodeId],
    ) -> ActionList {
        let mut actions = ActionList::new();
        if self.has_batch(&digest) {
            return actions;
        }
        let waiting = self.fetch_in_flight.entry(digest.clone()).or_default();
        let first = waiting.is_empty();
        waiting.insert(seq_no);
        if first {
            pf_debug!("fetching batch {:?} for seq {} from {:?}", digest, seq_no, sources);
            actions.send(sources, Msg::FetchBatch { seq_no, digest });
        }
        actions
    }

    /// Handler of FetchBatch and ForwardBatch messages.
    pub fn step(
        &mut self,
        source: NodeId,
        msg: &Msg,
    ) -> Result<ActionList, MirError> {
        let mut actions = ActionList::new();
        match msg {
            Msg::FetchBatch { seq_no, digest } => {
                // answer only if I have it
                if let Some(batch) = self.batches_by_digest.get(digest) {
                    actions.send(
                        &[source],
                        Msg::ForwardBatch {
                            seq_no: *seq_no,
                            request_acks: batch.request_acks.clone(),
                            digest: digest.clone(),
                        },
                    );
                }
            }
            Msg::ForwardBatch {
                seq_no,
                request_acks,
                digest,
            } => {
                if !self.fetch_in_flight.contains_key(digest) {
                    return Ok(actions); // ignore unsolicited forwards
                }
                actions.hash(
                    batch_hash_data(request_acks),
                    HashOrigin::VerifyBatch {
                        source,
                        seq_no: *seq_no,
                        request_acks: request_acks.clone(),
                        expected_digest: digest.clone(),
                    },
                );
            }
            _ => {
                return fatal_err!("batch tracker stepped with {}", msg.kind());
            }
        }
        Ok(actions)
    }

    /// Accepts a forwarded batch once its recomputed digest matches.
    pub fn apply_verify_batch_hash_result(
        &mut self,
        digest: &Digest,
        source: NodeId,
        seq_no: SeqNo,
        request_acks: &[RequestAck],
        expected_digest: &Digest,
    ) -> Result<(), MirError> {
        if digest != expected_digest {
            return byzantine_err!(
                "node {} forwarded batch for seq {} hashing to {:?}, expected {:?}",
                source,
                seq_no,
                digest,
                expected_digest
            );
        }
        let Some(waiting) = self.fetch_in_flight.remove(digest) else {
            return Ok(()); // already satisfied by another forward
        };
        for s in waiting {
            self.add_batch(s, digest.clone(), request_acks.to_vec());
        }
        self.add_batch(seq_no, digest.clone(), request_acks.to_vec());
        Ok(())
    }

    #[inline]
    pub fn has_fetch_in_flight(&self) -> bool {
        !self.fetch_in_flight.is_empty()
    }

    /// Drops every batch only observed at or below `seq_no`.
    pub fn truncate(&mut self, seq_no: SeqNo) {
        self.batches_by_digest.retain(|_, batch| {
            batch.observed_sequences.retain(|&s| s > seq_no);
            !batch.observed_sequences.is_empty()
        });
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.batches_by_digest.len()
    }
}

#[cfg(test)]
mod batch_tests {
    use super::*;
    use crate::actions::Action;

    fn acks(n: u64) -> Vec<RequestAck> {
        (0..n)
            .map(|r| RequestAck {
                client_id: 1,
                req_no: r,
                digest: Digest::from(vec![r as u8]),
            })
            .collect()
    }

    #[test]
    fn add_and_truncate() {
        let mut bt = BatchTracker::new();
        bt.add_batch(3, Digest::from(vec![3]), acks(1));
        bt.add_batch(8, Digest::from(vec![8]), acks(2));
        bt.add_batch(9, Digest::from(vec![3]), acks(1));
        assert_eq!(bt.len(), 2);
        bt.truncate(8);
        assert_eq!(bt.len(), 1);
        assert!(bt.has_batch(&Digest::from(vec![3])));
        assert!(!bt.has_batch(&Digest::from(vec![8])));
        assert!(bt.has_batch(&Digest::empty()));
    }

    #[test]
    fn fetch_once_and_verify() -> Result<(), MirError> {
        let mut bt = BatchTracker::new();
        let d = Digest::from(vec![42]);
        let actions = bt.fetch_batch(4, d.clone(), &[1, 2]);
        assert_eq!(actions.len(), 1);
        assert!(bt.fetch_batch(5, d.clone(), &[1, 2]).is_empty());
        assert!(bt.has_fetch_in_flight());

        let fwd = Msg::ForwardBatch {
            seq_no: 4,
            request_acks: acks(2),
            digest: d.clone(),
        };
        let actions = bt.step(1, &fwd)?;
        assert!(matches!(
            actions.as_slice()[0],
            Action::Hash {
                origin: HashOrigin::VerifyBatch { .. },
                ..
            }
        ));

        // a wrong digest is evidence and keeps the fetch open
        let err = bt
            .apply_verify_batch_hash_result(&Digest::from(vec![7]), 1, 4, &acks(2), &d)
            .unwrap_err();
        assert!(err.is_byzantine());
        assert!(bt.has_fetch_in_flight());

        bt.apply_verify_batch_hash_result(&d, 1, 4, &acks(2), &d)?;
        assert!(!bt.has_fetch_in_flight());
        assert_eq!(bt.get_batch(&d).map(|b| b.len()), Some(2));
        Ok(())
    }

    #[test]
    fn unsolicited_forward_ignored() -> Result<(), MirError> {
        let mut bt = BatchTracker::new();
        let fwd = Msg::ForwardBatch {
            seq_no: 4,
            request_acks: acks(2),
            digest: Digest::from(vec![1]),
        };
        assert!(bt.step(1, &fwd)?.is_empty());
        Ok(())
    }

    #[test]
    fn fetch_answered_when_known() -> Result<(), MirError> {
        let mut bt = BatchTracker::new();
        let d = Digest::from(vec![5]);
        let fetch = Msg::FetchBatch {
            seq_no: 5,
            digest: d.clone(),
        };
        assert!(bt.step(2, &fetch)?.is_empty());
        bt.add_batch(5, d.clone(), acks(1));
        let actions = bt.step(2, &fetch)?;
        assert!(matches!(
            &actions.as_slice()[0],
            Action::Send { targets, msg: Msg::ForwardBatch { .. } } if targets == &vec![2]
        ));
        Ok(())
    }
}
