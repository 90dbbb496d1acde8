//! Outstanding requests: per-bucket order in which client requests must be
//! allocated, and the queue of correct requests ready to be proposed.

use std::collections::{BTreeMap, BTreeSet};

use crate::clients::ClientTracker;
use crate::messages::{
    BucketId, ClientId, ClientState, NetworkConfig, ReqNo, RequestAck,
};
use crate::utils::MirError;

/// Allocation cursor of one client within one bucket.
#[derive(Debug, Clone)]
struct ClientCursor {
    /// Next request number of this client expected in this bucket.
    next_req_no: ReqNo,

    /// Request numbers already committed at the starting checkpoint.
    skip: BTreeSet<ReqNo>,
}

#[derive(Debug, Default)]
struct BucketReqs {
    clients: BTreeMap<ClientId, ClientCursor>,

    /// Correct requests not yet allocated, keyed by client and req number.
    correct: BTreeMap<(ClientId, ReqNo), RequestAck>,
}

/// Outstanding requests module.
#[derive(Debug)]
pub struct OutstandingReqs {
    number_of_buckets: u64,

    buckets: BTreeMap<BucketId, BucketReqs>,

    /// Position in the client tracker's available list consumed so far.
    available_cursor: usize,
}

impl ClientCursor {
    // Steps to the next request number mapping to the same bucket that is
    // not already committed.
    fn advance(&mut self, step: u64) {
        self.next_req_no += step;
        while self.skip.remove(&self.next_req_no) {
            self.next_req_no += step;
        }
        self.skip.retain(|&r| r > self.next_req_no);
    }
}

impl OutstandingReqs {
    /// Creates allocation cursors from the client windows the epoch starts
    /// from.
    pub fn new(config: &NetworkConfig, clients: &[ClientState]) -> Self {
        let number_of_buckets = config.number_of_buckets.max(1);
        let mut buckets: BTreeMap<BucketId, BucketReqs> = (0..number_of_buckets)
            .map(|b| (b, BucketReqs::default()))
            .collect();

        for client in clients {
            for offset in 0..number_of_buckets {
                let first = client.low_watermark + offset;
                let bucket = config.client_req_to_bucket(client.id, first);
                let skip: BTreeSet<ReqNo> = client
                    .committed
                    .iter()
                    .copied()
                    .filter(|&r| config.client_req_to_bucket(client.id, r) == bucket)
                    .collect();
                let mut cursor = ClientCursor {
                    next_req_no: first,
                    skip,
                };
                if cursor.skip.remove(&first) {
                    cursor.advance(number_of_buckets);
                }
                if let Some(b) = buckets.get_mut(&bucket) {
                    b.clients.insert(client.id, cursor);
                }
            }
        }

        OutstandingReqs {
            number_of_buckets,
            buckets,
            available_cursor: 0,
        }
    }

    /// Consumes newly available requests from the client tracker. Returns
    /// the ones that were already allocated before becoming correct
    /// locally, so that sequences waiting on them can proceed.
    pub fn advance_requests(
        &mut self,
        config: &NetworkConfig,
        tracker: &ClientTracker,
    ) -> Vec<RequestAck> {
        let mut late = vec![];
        for ack in tracker.available_since(self.available_cursor) {
            let bucket = config.client_req_to_bucket(ack.client_id, ack.req_no);
            let Some(reqs) = self.buckets.get_mut(&bucket) else {
                continue;
            };
            let Some(cursor) = reqs.clients.get(&ack.client_id) else {
                continue; // client joined after this epoch started
            };
            if ack.req_no < cursor.next_req_no {
                late.push(ack.clone());
            } else if !cursor.skip.contains(&ack.req_no) {
                reqs.correct
                    .entry((ack.client_id, ack.req_no))
                    .or_insert_with(|| ack.clone());
            }
        }
        self.available_cursor = tracker.available_end();
        late
    }

    /// Marks a batch allocated in `bucket`. Every request must be the next
    /// expected one of its client there. Returns the requests not yet known
    /// correct locally.
    pub fn apply_acks(
        &mut self,
        bucket: BucketId,
        acks: &[RequestAck],
    ) -> Result<Vec<RequestAck>, MirError> {
        let Some(reqs) = self.buckets.get_mut(&bucket) else {
            return byzantine_err!("batch for non-existent bucket {}", bucket);
        };

        // validate the whole batch before touching any cursor
        let mut expected: BTreeMap<ClientId, ClientCursor> = BTreeMap::new();
        for ack in acks {
            if !expected.contains_key(&ack.client_id) {
                let Some(c) = reqs.clients.get(&ack.client_id) else {
                    return byzantine_err!(
                        "batch in bucket {} for no such client {}",
                        bucket,
                        ack.client_id
                    );
                };
                expected.insert(ack.client_id, c.clone());
            }
            let Some(cursor) = expected.get_mut(&ack.client_id) else {
                continue;
            };
            if cursor.next_req_no != ack.req_no {
                return byzantine_err!(
                    "client {} in bucket {} expected req {} got {}",
                    ack.client_id,
                    bucket,
                    cursor.next_req_no,
                    ack.req_no
                );
            }
            cursor.advance(self.number_of_buckets);
        }

        let mut missing = vec![];
        for ack in acks {
            match reqs.correct.remove(&(ack.client_id, ack.req_no)) {
                Some(known) if known.digest == ack.digest => {}
                _ => missing.push(ack.clone()),
            }
        }
        reqs.clients.extend(expected);
        Ok(missing)
    }

    /// Up to `max` requests that can be proposed next in `bucket`, in
    /// allocation order.
    pub fn next_batch(&self, bucket: BucketId, max: usize) -> Vec<RequestAck> {
        let mut batch = vec![];
        let Some(reqs) = self.buckets.get(&bucket) else {
            return batch;
        };
        for (&client_id, cursor) in &reqs.clients {
            let mut cursor = cursor.clone();
            while batch.len() < max {
                match reqs.correct.get(&(client_id, cursor.next_req_no)) {
                    Some(ack) => {
                        batch.push(ack.clone());
                        cursor.advance(self.number_of_buckets);
                    }
                    None => break,
                }
            }
            if batch.len() >= max {
                break;
            }
        }
        batch
    }

    #[cfg(test)]
    fn expected_req_no(
        &self,
        bucket: BucketId,
        client_id: ClientId,
    ) -> Option<ReqNo> {
        self.buckets
            .get(&bucket)?
            .clients
            .get(&client_id)
            .map(|c| c.next_req_no)
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        self.buckets.values().map(|b| b.correct.len()).sum()
    }
}
