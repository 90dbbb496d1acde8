//! The epoch in progress: sequence window, leader proposals, and normal-case
//! three-phase voting.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use super::buffer::MsgBuffers;
use super::EpochContext;

use crate::actions::ActionList;
use crate::events::InitialParameters;
use crate::messages::{
    BucketId, ClientState, Digest, EpochConfig, Msg, NetworkConfig, NodeId,
    PEntry, Preprepare, QEntry, RequestAck, SeqNo,
};
use crate::outstanding::OutstandingReqs;
use crate::sequence::{Sequence, SequenceState};
use crate::utils::MirError;

/// Observability snapshot of one bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BucketStatus {
    pub id: BucketId,
    pub leader: NodeId,
    pub sequences: Vec<SequenceState>,
}

// Sequence a normal-case message refers to.
fn msg_seq_no(msg: &Msg) -> Option<SeqNo> {
    match msg {
        Msg::Preprepare(pp) => Some(pp.seq_no),
        Msg::Prepare(v) | Msg::Commit(v) => Some(v.seq_no),
        _ => None,
    }
}

/// The active epoch.
#[derive(Debug)]
pub struct ActiveEpoch {
    my_id: NodeId,
    config: EpochConfig,
    network_config: NetworkConfig,

    batch_size: usize,
    heartbeat_ticks: u32,
    suspect_ticks: u32,

    /// Sequences at or below this are garbage collected.
    low_watermark: SeqNo,

    /// Highest sequence created so far.
    high_watermark: SeqNo,

    /// Last sequence already delivered when the epoch was created; requests
    /// of batches up to it are accounted for in the client windows.
    applied_at_start: SeqNo,

    /// First sequence leaders may propose fresh batches for.
    first_fresh: SeqNo,

    sequences: BTreeMap<SeqNo, Sequence>,

    /// Certified batches whose sequences are not created yet.
    certified: BTreeMap<SeqNo, Digest>,

    outstanding: OutstandingReqs,

    /// Request -> sequences waiting for it to become known correct.
    waiting: BTreeMap<RequestAck, BTreeSet<SeqNo>>,

    /// Next sequence to allocate per bucket.
    next_allocation: BTreeMap<BucketId, SeqNo>,

    /// Preprepares that arrived ahead of their bucket's order.
    preprepare_buffer: BTreeMap<SeqNo, (NodeId, Preprepare)>,

    /// Messages for sequences above the window.
    future: MsgBuffers,

    ticks_since_proposal: u32,
    ticks_without_progress: u32,
    last_progress: SeqNo,
    suspected: bool,
}

impl ActiveEpoch {
    /// Creates an epoch whose first fresh sequence follows `certified`
    /// batches starting right after `start_seq`.
    pub fn new(
        params: &InitialParameters,
        network_config: NetworkConfig,
        config: EpochConfig,
        start_seq: SeqNo,
        certified: Vec<Digest>,
        client_states: &[ClientState],
        ctx: &EpochContext,
    ) -> Self {
        let first_fresh = start_seq + certified.len() as u64 + 1;
        let low_watermark = start_seq.max(ctx.commit_state.low_watermark());
        let outstanding = OutstandingReqs::new(&network_config, client_states);

        let buckets = network_config.number_of_buckets.max(1);
        let next_allocation = (0..buckets)
            .map(|b| (b, first_in_bucket(first_fresh.max(low_watermark + 1), b, buckets)))
            .collect();

        ActiveEpoch {
            my_id: params.id,
            config,
            network_config,
            batch_size: params.batch_size.max(1) as usize,
            heartbeat_ticks: params.heartbeat_ticks,
            suspect_ticks: params.suspect_ticks,
            low_watermark,
            high_watermark: low_watermark,
            applied_at_start: ctx.commit_state.last_applied_commit(),
            first_fresh,
            sequences: BTreeMap::new(),
            certified: certified
                .into_iter()
                .enumerate()
                .map(|(i, d)| (start_seq + 1 + i as u64, d))
                .filter(|(s, _)| *s > low_watermark)
                .collect(),
            outstanding,
            waiting: BTreeMap::new(),
            next_allocation,
            preprepare_buffer: BTreeMap::new(),
            future: MsgBuffers::new(params.buffer_size as usize),
            ticks_since_proposal: 0,
            ticks_without_progress: 0,
            last_progress: ctx.commit_state.highest_commit(),
            suspected: false,
        }
    }

    #[inline]
    pub fn config(&self) -> &EpochConfig {
        &self.config
    }

    #[inline]
    pub fn high_watermark(&self) -> SeqNo {
        self.high_watermark
    }

    fn bucket_leader(&self, bucket: BucketId) -> NodeId {
        let leaders = &self.config.leaders;
        leaders[((bucket + self.config.number) % leaders.len() as u64) as usize]
    }

    fn owner(&self, seq_no: SeqNo) -> NodeId {
        self.bucket_leader(self.network_config.seq_to_bucket(seq_no))
    }

    fn owned_buckets(&self) -> Vec<BucketId> {
        (0..self.network_config.number_of_buckets.max(1))
            .filter(|&b| self.bucket_leader(b) == self.my_id)
            .collect()
    }

    /// Creates sequences up to the commit window and the planned end of the
    /// epoch. Certified batches start prepared.
    fn extend_window(
        &mut self,
        ctx: &mut EpochContext,
    ) -> Result<ActionList, MirError> {
        let mut actions = ActionList::new();
        let bound = ctx
            .commit_state
            .stop_at_seq_no()
            .min(self.config.planned_expiration);
        while self.high_watermark < bound {
            let seq_no = self.high_watermark + 1;
            self.high_watermark = seq_no;
            let mut seq = Sequence::new(
                self.my_id,
                self.owner(seq_no),
                seq_no,
                self.config.number,
                self.network_config.nodes.clone(),
                self.network_config.strong_quorum(),
            );
            if let Some(digest) = self.certified.remove(&seq_no) {
                let batch = if digest.is_empty() {
                    vec![]
                } else {
                    match ctx.batch_tracker.get_batch(&digest) {
                        Some(b) => b.to_vec(),
                        None => {
                            return fatal_err!(
                                "certified batch {:?} for seq {} not held",
                                digest,
                                seq_no
                            );
                        }
                    }
                };
                if seq_no > self.applied_at_start {
                    let bucket = self.network_config.seq_to_bucket(seq_no);
                    if let Err(e) = self.outstanding.apply_acks(bucket, &batch) {
                        pf_warn!("certified batch at seq {} out of order: {}", seq_no, e);
                    }
                }
                if !digest.is_empty() {
                    ctx.batch_tracker.add_batch(seq_no, digest.clone(), batch.clone());
                }
                actions.concat(seq.prepare_certified(batch, digest, ctx.persisted));
            }
            self.sequences.insert(seq_no, seq);
        }
        Ok(actions)
    }

    /// Rebuilds sequence progress from the records of this epoch in the log
    /// and re-sends this node's votes.
    pub fn resume(
        &mut self,
        q_entries: &[QEntry],
        p_entries: &[PEntry],
        ctx: &mut EpochContext,
    ) -> Result<ActionList, MirError> {
        let mut actions = self.extend_window(ctx)?;
        let buckets = self.network_config.number_of_buckets.max(1);
        for q in q_entries {
            let Some(seq) = self.sequences.get_mut(&q.seq_no) else {
                continue;
            };
            seq.apply_q_entry(q);
            let bucket = self.network_config.seq_to_bucket(q.seq_no);
            if q.seq_no > self.applied_at_start {
                if let Err(e) = self.outstanding.apply_acks(bucket, &q.requests) {
                    pf_warn!("replayed batch at seq {} out of order: {}", q.seq_no, e);
                }
            }
            let next = self.next_allocation.entry(bucket).or_insert(0);
            *next = (*next).max(q.seq_no + buckets);
        }
        for p in p_entries {
            if let Some(seq) = self.sequences.get_mut(&p.seq_no) {
                seq.apply_p_entry(p);
            }
        }
        for seq in self.sequences.values() {
            actions.concat(seq.resend_vote());
        }
        Ok(actions)
    }

    /// Handler of Preprepare, Prepare, and Commit messages of this epoch.
    pub fn step(
        &mut self,
        source: NodeId,
        msg: &Msg,
        ctx: &mut EpochContext,
    ) -> Result<ActionList, MirError> {
        let Some(seq_no) = msg_seq_no(msg) else {
            return fatal_err!("active epoch stepped with {}", msg.kind());
        };
        if seq_no <= self.low_watermark || seq_no > self.config.planned_expiration
        {
            return Ok(ActionList::new()); // outside this epoch's range
        }
        if seq_no > self.high_watermark {
            self.future.store(source, msg.clone());
            return Ok(ActionList::new());
        }

        match msg {
            Msg::Preprepare(pp) => self.step_preprepare(source, pp, ctx),
            Msg::Prepare(v) => {
                let Some(seq) = self.sequences.get_mut(&seq_no) else {
                    return Ok(ActionList::new());
                };
                let actions = seq.apply_prepare(source, &v.digest, ctx.persisted)?;
                self.check_committed(seq_no, ctx)?;
                Ok(actions)
            }
            Msg::Commit(v) => {
                let Some(seq) = self.sequences.get_mut(&seq_no) else {
                    return Ok(ActionList::new());
                };
                if seq.apply_commit(source, &v.digest)? {
                    self.deliver(seq_no, ctx)?;
                }
                Ok(ActionList::new())
            }
            _ => fatal_err!("active epoch stepped with {}", msg.kind()),
        }
    }

    fn step_preprepare(
        &mut self,
        source: NodeId,
        pp: &Preprepare,
        ctx: &mut EpochContext,
    ) -> Result<ActionList, MirError> {
        let owner = self.owner(pp.seq_no);
        if source != owner {
            return byzantine_err!(
                "node {} preprepared seq {} owned by {}",
                source,
                pp.seq_no,
                owner
            );
        }
        if source == self.my_id || pp.seq_no < self.first_fresh {
            return Ok(ActionList::new()); // own loopback or certified slot
        }
        let bucket = self.network_config.seq_to_bucket(pp.seq_no);
        let next = self.next_allocation.get(&bucket).copied().unwrap_or(0);
        if pp.seq_no < next {
            return Ok(ActionList::new()); // already allocated
        }
        if pp.seq_no > next {
            self.preprepare_buffer
                .insert(pp.seq_no, (source, pp.clone()));
            return Ok(ActionList::new());
        }

        // keep the freshest view of correct requests before matching
        let late = self
            .outstanding
            .advance_requests(&self.network_config, ctx.client_tracker);
        let mut actions = self.satisfy(late);
        actions.concat(self.allocate(pp.seq_no, pp.batch.clone())?);

        // bucket order may now unblock buffered preprepares
        let buckets = self.network_config.number_of_buckets.max(1);
        let mut next = pp.seq_no + buckets;
        while let Some((_, buffered)) = self.preprepare_buffer.remove(&next) {
            match self.allocate(next, buffered.batch) {
                Ok(a) => {
                    actions.concat(a);
                }
                Err(e) if e.is_byzantine() => break,
                Err(e) => return Err(e),
            }
            next += buckets;
        }
        Ok(actions)
    }

    // Assigns a batch to the next sequence of its bucket.
    fn allocate(
        &mut self,
        seq_no: SeqNo,
        batch: Vec<RequestAck>,
    ) -> Result<ActionList, MirError> {
        let bucket = self.network_config.seq_to_bucket(seq_no);
        let missing = self.outstanding.apply_acks(bucket, &batch)?;
        let buckets = self.network_config.number_of_buckets.max(1);
        self.next_allocation.insert(bucket, seq_no + buckets);
        for ack in &missing {
            self.waiting.entry(ack.clone()).or_default().insert(seq_no);
        }
        let Some(seq) = self.sequences.get_mut(&seq_no) else {
            return fatal_err!("allocating seq {} outside the window", seq_no);
        };
        seq.allocate(batch, missing)
    }

    fn satisfy(&mut self, late: Vec<RequestAck>) -> ActionList {
        let mut actions = ActionList::new();
        for ack in late {
            let Some(seqs) = self.waiting.remove(&ack) else {
                continue;
            };
            for seq_no in seqs {
                if let Some(seq) = self.sequences.get_mut(&seq_no) {
                    actions.concat(seq.satisfy_outstanding(&ack));
                }
            }
        }
        actions
    }

    fn check_committed(
        &mut self,
        seq_no: SeqNo,
        ctx: &mut EpochContext,
    ) -> Result<(), MirError> {
        let committed = self
            .sequences
            .get_mut(&seq_no)
            .is_some_and(|s| s.check_commit_quorum());
        if committed {
            self.deliver(seq_no, ctx)?;
        }
        Ok(())
    }

    fn deliver(
        &mut self,
        seq_no: SeqNo,
        ctx: &mut EpochContext,
    ) -> Result<(), MirError> {
        let Some(q_entry) = self.sequences.get(&seq_no).and_then(|s| s.q_entry())
        else {
            return fatal_err!("seq {} committed without a batch", seq_no);
        };
        ctx.commit_state.commit(q_entry)
    }

    /// Batch digest computed for a sequence of this epoch.
    pub fn apply_batch_hash_result(
        &mut self,
        seq_no: SeqNo,
        digest: Digest,
        ctx: &mut EpochContext,
    ) -> Result<ActionList, MirError> {
        let Some(seq) = self.sequences.get_mut(&seq_no) else {
            return Ok(ActionList::new()); // garbage collected meanwhile
        };
        if seq.state() != SequenceState::Allocated {
            return Ok(ActionList::new());
        }
        let actions = seq.apply_batch_hash_result(digest, ctx.persisted)?;
        self.check_committed(seq_no, ctx)?;
        Ok(actions)
    }

    fn propose(
        &mut self,
        bucket: BucketId,
        batch: Vec<RequestAck>,
    ) -> Result<ActionList, MirError> {
        let seq_no = self.next_allocation.get(&bucket).copied().unwrap_or(0);
        pf_trace!(
            "proposing {} requests at seq {} in bucket {}",
            batch.len(),
            seq_no,
            bucket
        );
        self.allocate(seq_no, batch)
    }

    fn can_propose(&self, bucket: BucketId) -> bool {
        self.next_allocation
            .get(&bucket)
            .is_some_and(|&s| s <= self.high_watermark && s >= self.first_fresh)
    }

    /// Drives whatever progress is possible without new input: window
    /// growth, buffered messages, newly correct requests, full batches.
    pub fn advance(
        &mut self,
        ctx: &mut EpochContext,
    ) -> Result<ActionList, MirError> {
        let mut actions = self.extend_window(ctx)?;

        let (low, high) = (self.low_watermark, self.high_watermark);
        let ready = self.future.drain_where(
            |m| msg_seq_no(m).is_some_and(|s| s <= high),
            |m| msg_seq_no(m).map_or(true, |s| s <= low),
        );
        for (source, msg) in ready {
            match self.step(source, &msg, ctx) {
                Ok(a) => {
                    actions.concat(a);
                }
                Err(e) if e.is_byzantine() => {}
                Err(e) => return Err(e),
            }
        }

        let late = self
            .outstanding
            .advance_requests(&self.network_config, ctx.client_tracker);
        actions.concat(self.satisfy(late));

        for bucket in self.owned_buckets() {
            while self.can_propose(bucket) {
                let batch = self.outstanding.next_batch(bucket, self.batch_size);
                if batch.len() < self.batch_size {
                    break;
                }
                actions.concat(self.propose(bucket, batch)?);
            }
        }
        Ok(actions)
    }

    /// Heartbeat proposals and the progress timer. Returns whether this
    /// node just started suspecting the epoch.
    pub fn tick(
        &mut self,
        ctx: &mut EpochContext,
    ) -> Result<(ActionList, bool), MirError> {
        let mut actions = ActionList::new();
        self.ticks_since_proposal += 1;
        if self.ticks_since_proposal >= self.heartbeat_ticks {
            self.ticks_since_proposal = 0;
            for bucket in self.owned_buckets() {
                if self.can_propose(bucket) {
                    let batch = self.outstanding.next_batch(bucket, self.batch_size);
                    actions.concat(self.propose(bucket, batch)?);
                }
            }
        }

        let progress = ctx.commit_state.highest_commit();
        let pending = self
            .sequences
            .values()
            .any(|s| s.state() != SequenceState::Committed);
        if progress != self.last_progress || !pending {
            self.last_progress = progress;
            self.ticks_without_progress = 0;
            return Ok((actions, false));
        }
        self.ticks_without_progress += 1;
        if self.ticks_without_progress >= self.suspect_ticks && !self.suspected {
            pf_info!(
                "no progress in epoch {} for {} ticks",
                self.config.number,
                self.ticks_without_progress
            );
            self.suspected = true;
            return Ok((actions, true));
        }
        Ok((actions, false))
    }

    /// Drops sequences at or below the new low watermark.
    pub fn move_low_watermark(&mut self, seq_no: SeqNo) {
        if seq_no <= self.low_watermark {
            return;
        }
        self.low_watermark = seq_no;
        self.high_watermark = self.high_watermark.max(seq_no);
        self.sequences.retain(|&s, _| s > seq_no);
        self.certified.retain(|&s, _| s > seq_no);
        self.preprepare_buffer.retain(|&s, _| s > seq_no);
        for seqs in self.waiting.values_mut() {
            seqs.retain(|&s| s > seq_no);
        }
        self.waiting.retain(|_, seqs| !seqs.is_empty());
        let buckets = self.network_config.number_of_buckets.max(1);
        for (&bucket, next) in self.next_allocation.iter_mut() {
            if *next <= seq_no {
                *next = first_in_bucket(seq_no + 1, bucket, buckets);
            }
        }
    }

    pub fn status(&self) -> Vec<BucketStatus> {
        let buckets = self.network_config.number_of_buckets.max(1);
        (0..buckets)
            .map(|b| BucketStatus {
                id: b,
                leader: self.bucket_leader(b),
                sequences: self
                    .sequences
                    .values()
                    .filter(|s| self.network_config.seq_to_bucket(s.seq_no()) == b)
                    .map(|s| s.state())
                    .collect(),
            })
            .collect()
    }
}

/// Smallest sequence at or above `from` that falls in `bucket`.
fn first_in_bucket(from: SeqNo, bucket: BucketId, buckets: u64) -> SeqNo {
    from + (bucket + buckets - from % buckets) % buckets
}
