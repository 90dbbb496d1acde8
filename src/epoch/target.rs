//! One target epoch: the epoch change sub-protocol leading into it, its
//! active phase, and its end.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use super::active::{ActiveEpoch, BucketStatus};
use super::buffer::MsgBuffers;
use super::change::{construct_new_epoch_config, ParsedEpochChange};
use super::EpochContext;

use crate::actions::{ActionList, HashOrigin};
use crate::events::InitialParameters;
use crate::messages::{
    Digest, ECEntry, EpochChange, EpochConfig, EpochNo, FEntry, Msg, NEntry,
    NetworkConfig, NewEpoch, NewEpochConfig, NodeId, PEntry, Persistent, QEntry,
    RemoteEpochChange, SeqNo, Suspect,
};
use crate::utils::MirError;

/// Lifecycle of a target epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum EpochTargetState {
    /// Must build and send its own epoch change.
    Prepending,
    /// Collecting epoch changes, waiting for a new-epoch message.
    Pending,
    /// Checking the primary's new-epoch message against acked changes.
    Verifying,
    /// Fetching batches or state the new epoch starts from.
    Fetching,
    Echoing,
    Readying,
    Ready,
    /// Rebuilding an epoch in progress from the log.
    Resuming,
    InProgress,
    /// Planned expiration reached; writing the end record.
    Ending,
    Done,
}

// Records of an epoch in progress found in the log.
#[derive(Debug)]
struct ResumeLog {
    config: EpochConfig,
    start_seq: SeqNo,
    q_entries: Vec<QEntry>,
    p_entries: Vec<PEntry>,
}

// Acks of one epoch change digest.
#[derive(Debug)]
struct ChangeVotes {
    parsed: ParsedEpochChange,
    acks: BTreeSet<NodeId>,
}

/// Observability snapshot of the current target epoch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EpochTargetStatus {
    pub number: EpochNo,
    pub state: EpochTargetState,
    pub epoch_changes: Vec<NodeId>,
    pub echos: Vec<NodeId>,
    pub readies: Vec<NodeId>,
    pub suspicions: Vec<NodeId>,
    pub leaders: Vec<NodeId>,
    pub buckets: Vec<BucketStatus>,
}

/// Epoch target module.
#[derive(Debug)]
pub struct EpochTarget {
    number: EpochNo,
    state: EpochTargetState,

    params: InitialParameters,
    network_config: NetworkConfig,

    /// Ticks spent outside the in-progress state.
    state_ticks: u32,

    /// Origin -> digest -> acks of its epoch change.
    changes: BTreeMap<NodeId, BTreeMap<Digest, ChangeVotes>>,

    /// Epoch changes acked by a strong quorum, by origin.
    strong_changes: BTreeMap<NodeId, ParsedEpochChange>,

    /// Origins whose epoch change I acked.
    acked: BTreeSet<NodeId>,

    /// My epoch change is already in the log.
    ec_logged: bool,

    new_epoch_sent: bool,
    leader_new_epoch: Option<NewEpoch>,

    /// Verified (or quorum-adopted) starting state of this epoch.
    network_new_epoch: Option<NewEpochConfig>,

    /// Batch digest -> nodes known to hold it.
    fetch_sources: BTreeMap<Digest, Vec<NodeId>>,

    echos: Vec<(NewEpochConfig, BTreeSet<NodeId>)>,
    readies: Vec<(NewEpochConfig, BTreeSet<NodeId>)>,
    echo_sent: bool,
    ready_sent: bool,

    suspicions: BTreeSet<NodeId>,
    suspect_sent: bool,

    resume_log: Option<ResumeLog>,

    /// Normal-case messages received before the epoch became active.
    prestart: MsgBuffers,

    active: Option<ActiveEpoch>,
}

// Adds `source` to the vote set of `config`.
fn record_vote(
    votes: &mut Vec<(NewEpochConfig, BTreeSet<NodeId>)>,
    config: &NewEpochConfig,
    source: NodeId,
) -> usize {
    match votes.iter_mut().find(|(c, _)| c == config) {
        Some((_, nodes)) => {
            nodes.insert(source);
            nodes.len()
        }
        None => {
            votes.push((config.clone(), BTreeSet::from([source])));
            1
        }
    }
}

fn vote_count(
    votes: &[(NewEpochConfig, BTreeSet<NodeId>)],
    config: &NewEpochConfig,
) -> usize {
    votes
        .iter()
        .find(|(c, _)| c == config)
        .map_or(0, |(_, nodes)| nodes.len())
}

impl EpochTarget {
    fn new(
        number: EpochNo,
        state: EpochTargetState,
        params: &InitialParameters,
        network_config: NetworkConfig,
    ) -> Self {
        EpochTarget {
            number,
            state,
            params: params.clone(),
            network_config,
            state_ticks: 0,
            changes: BTreeMap::new(),
            strong_changes: BTreeMap::new(),
            acked: BTreeSet::new(),
            ec_logged: false,
            new_epoch_sent: false,
            leader_new_epoch: None,
            network_new_epoch: None,
            fetch_sources: BTreeMap::new(),
            echos: vec![],
            readies: vec![],
            echo_sent: false,
            ready_sent: false,
            suspicions: BTreeSet::new(),
            suspect_sent: false,
            resume_log: None,
            prestart: MsgBuffers::new(params.buffer_size as usize),
            active: None,
        }
    }

    /// Target that is already over; placeholder before initialization.
    pub fn done(params: &InitialParameters, network_config: NetworkConfig) -> Self {
        Self::new(0, EpochTargetState::Done, params, network_config)
    }

    /// Target that starts by sending its epoch change. `ec_logged` tells
    /// whether the log already records having sent it.
    pub fn prepending(
        number: EpochNo,
        ec_logged: bool,
        params: &InitialParameters,
        network_config: NetworkConfig,
    ) -> Self {
        let mut target =
            Self::new(number, EpochTargetState::Prepending, params, network_config);
        target.ec_logged = ec_logged;
        target
    }

    /// Target resuming an epoch in progress from its log records.
    pub fn resuming(
        config: EpochConfig,
        start_seq: SeqNo,
        q_entries: Vec<QEntry>,
        p_entries: Vec<PEntry>,
        params: &InitialParameters,
        network_config: NetworkConfig,
    ) -> Self {
        let mut target = Self::new(
            config.number,
            EpochTargetState::Resuming,
            params,
            network_config,
        );
        target.resume_log = Some(ResumeLog {
            config,
            start_seq,
            q_entries,
            p_entries,
        });
        target
    }

    #[inline]
    pub fn number(&self) -> EpochNo {
        self.number
    }

    #[inline]
    pub fn state(&self) -> EpochTargetState {
        self.state
    }

    #[inline]
    pub fn is_done(&self) -> bool {
        self.state == EpochTargetState::Done
    }

    pub fn active_config(&self) -> Option<&EpochConfig> {
        self.active.as_ref().map(|a| a.config())
    }

    pub fn high_watermark(&self) -> Option<SeqNo> {
        self.active.as_ref().map(|a| a.high_watermark())
    }

    /// Whether a verified new-epoch config is still being installed; such
    /// progress survives a reinitialization.
    pub fn is_installing(&self) -> bool {
        self.network_new_epoch.is_some()
            && self.state >= EpochTargetState::Fetching
            && self.state <= EpochTargetState::Ready
    }

    /// Restarts installation of the verified config after the rest of the
    /// node was rebuilt from the log.
    pub fn restart_installation(&mut self, network_config: NetworkConfig) {
        self.network_config = network_config;
        self.state = EpochTargetState::Fetching;
    }

    fn broadcast(&self, actions: &mut ActionList, msg: Msg) {
        actions.send(&self.network_config.nodes, msg);
    }

    /// Handler of messages tagged with this target's epoch number.
    pub fn step(
        &mut self,
        source: NodeId,
        msg: &Msg,
        ctx: &mut EpochContext,
    ) -> Result<ActionList, MirError> {
        let mut actions = ActionList::new();
        match msg {
            Msg::Suspect(_) => return self.apply_suspect(source, ctx),
            Msg::EpochChange(ec) => {
                actions.hash(
                    vec![rmp_serde::to_vec(ec)?],
                    HashOrigin::EpochChange {
                        source,
                        origin: source,
                        epoch_change: ec.clone(),
                    },
                );
            }
            Msg::EpochChangeAck {
                originator,
                epoch_change,
            } => {
                actions.hash(
                    vec![rmp_serde::to_vec(epoch_change)?],
                    HashOrigin::EpochChange {
                        source,
                        origin: *originator,
                        epoch_change: epoch_change.clone(),
                    },
                );
            }
            Msg::NewEpoch(ne) => {
                let primary = self.network_config.epoch_primary(self.number);
                if source != primary {
                    return byzantine_err!(
                        "node {} sent new epoch {} but primary is {}",
                        source,
                        self.number,
                        primary
                    );
                }
                if self.leader_new_epoch.is_none() {
                    self.leader_new_epoch = Some(ne.clone());
                }
            }
            Msg::NewEpochEcho(config) => {
                record_vote(&mut self.echos, config, source);
            }
            Msg::NewEpochReady(config) => {
                let count = record_vote(&mut self.readies, config, source);
                if count < self.network_config.weak_quorum() {
                    return Ok(actions);
                }
                // a correct node vouches for this config
                if !self.ready_sent && self.state < EpochTargetState::InProgress {
                    self.ready_sent = true;
                    self.broadcast(&mut actions, Msg::NewEpochReady(config.clone()));
                }
                if self.network_new_epoch.is_none()
                    && self.state <= EpochTargetState::Verifying
                {
                    pf_debug!("adopting new epoch {} config from readies", self.number);
                    self.network_new_epoch = Some(config.clone());
                    self.state = EpochTargetState::Fetching;
                }
            }
            Msg::Preprepare(_) | Msg::Prepare(_) | Msg::Commit(_) => {
                if let Some(active) = self.active.as_mut() {
                    return active.step(source, msg, ctx);
                }
                if self.state < EpochTargetState::InProgress {
                    self.prestart.store(source, msg.clone());
                }
            }
            _ => return fatal_err!("epoch target stepped with {}", msg.kind()),
        }
        Ok(actions)
    }

    /// Digest of an epoch change from `origin`, received from `source`.
    pub fn apply_epoch_change_digest(
        &mut self,
        source: NodeId,
        origin: NodeId,
        epoch_change: &EpochChange,
        digest: Digest,
    ) -> Result<ActionList, MirError> {
        let mut actions = ActionList::new();
        if self.network_config.node_index(origin).is_none() {
            return byzantine_err!("epoch change of unknown node {}", origin);
        }
        let by_digest = self.changes.entry(origin).or_default();
        if !by_digest.contains_key(&digest) {
            let parsed =
                ParsedEpochChange::parse(origin, digest.clone(), epoch_change.clone())?;
            by_digest.insert(
                digest.clone(),
                ChangeVotes {
                    parsed,
                    acks: BTreeSet::new(),
                },
            );
        }
        let Some(votes) = by_digest.get_mut(&digest) else {
            return Ok(actions);
        };
        votes.acks.insert(source);

        if source == origin && self.acked.insert(origin) {
            actions.send(
                &self.network_config.nodes,
                Msg::EpochChangeAck {
                    originator: origin,
                    epoch_change: epoch_change.clone(),
                },
            );
        }
        if votes.acks.len() >= self.network_config.strong_quorum()
            && !self.strong_changes.contains_key(&origin)
        {
            pf_debug!(
                "epoch change of {} for epoch {} is strong",
                origin,
                self.number
            );
            self.strong_changes.insert(origin, votes.parsed.clone());
        }
        Ok(actions)
    }

    pub fn apply_batch_hash_result(
        &mut self,
        seq_no: SeqNo,
        digest: Digest,
        ctx: &mut EpochContext,
    ) -> Result<ActionList, MirError> {
        match self.active.as_mut() {
            Some(active) => active.apply_batch_hash_result(seq_no, digest, ctx),
            None => Ok(ActionList::new()),
        }
    }

    fn suspect(&mut self, ctx: &mut EpochContext) -> ActionList {
        self.suspect_sent = true;
        pf_info!("suspecting epoch {}", self.number);
        let suspect = Suspect {
            epoch: self.number,
        };
        let mut actions = ctx.persisted.append(Persistent::Suspect(suspect.clone()));
        self.broadcast(&mut actions, Msg::Suspect(suspect));
        actions
    }

    fn apply_suspect(
        &mut self,
        source: NodeId,
        ctx: &mut EpochContext,
    ) -> Result<ActionList, MirError> {
        let mut actions = ActionList::new();
        self.suspicions.insert(source);
        if self.suspicions.len() >= self.network_config.weak_quorum()
            && !self.suspect_sent
        {
            actions.concat(self.suspect(ctx));
        }
        if self.suspicions.len() >= self.network_config.strong_quorum()
            && self.state != EpochTargetState::Done
        {
            pf_info!("epoch {} suspected by a strong quorum", self.number);
            self.state = EpochTargetState::Done;
        }
        Ok(actions)
    }

    pub fn tick(&mut self, ctx: &mut EpochContext) -> Result<ActionList, MirError> {
        match self.state {
            EpochTargetState::InProgress => {
                let Some(active) = self.active.as_mut() else {
                    return Ok(ActionList::new());
                };
                let (mut actions, suspect) = active.tick(ctx)?;
                if suspect && !self.suspect_sent {
                    actions.concat(self.suspect(ctx));
                }
                Ok(actions)
            }
            EpochTargetState::Ending | EpochTargetState::Done => Ok(ActionList::new()),
            _ => {
                self.state_ticks += 1;
                if self.state_ticks >= self.params.new_epoch_timeout_ticks
                    && !self.suspect_sent
                {
                    pf_info!(
                        "epoch change to {} stuck in {:?} for {} ticks",
                        self.number,
                        self.state,
                        self.state_ticks
                    );
                    return Ok(self.suspect(ctx));
                }
                Ok(ActionList::new())
            }
        }
    }

    pub fn move_low_watermark(&mut self, seq_no: SeqNo) {
        if let Some(active) = self.active.as_mut() {
            active.move_low_watermark(seq_no);
        }
    }

    /// Advances through as many states as current knowledge allows.
    pub fn advance_state(
        &mut self,
        ctx: &mut EpochContext,
    ) -> Result<ActionList, MirError> {
        let mut actions = ActionList::new();
        loop {
            let before = self.state;
            let step = match self.state {
                EpochTargetState::Prepending => self.send_epoch_change(ctx),
                EpochTargetState::Pending => self.check_pending()?,
                EpochTargetState::Verifying => self.verify_new_epoch()?,
                EpochTargetState::Fetching => self.fetch_new_epoch_state(ctx),
                EpochTargetState::Echoing => self.check_echos(),
                EpochTargetState::Readying => self.check_readies(),
                EpochTargetState::Ready => self.start_epoch(ctx)?,
                EpochTargetState::Resuming => self.resume_epoch(ctx)?,
                EpochTargetState::InProgress => self.advance_active(ctx)?,
                EpochTargetState::Ending => self.end_epoch(ctx),
                EpochTargetState::Done => ActionList::new(),
            };
            actions.concat(step);
            if self.state == before {
                break;
            }
            self.state_ticks = 0;
        }
        Ok(actions)
    }

    fn send_epoch_change(&mut self, ctx: &mut EpochContext) -> ActionList {
        pf_info!("starting epoch change to epoch {}", self.number);
        let mut actions = ActionList::new();
        let epoch_change = ctx.persisted.construct_epoch_change(self.number);
        if !self.ec_logged {
            self.ec_logged = true;
            actions.concat(ctx.persisted.append(Persistent::ECEntry(ECEntry {
                epoch_number: self.number,
            })));
        }
        self.broadcast(&mut actions, Msg::EpochChange(epoch_change));
        self.state = EpochTargetState::Pending;
        actions
    }

    fn check_pending(&mut self) -> Result<ActionList, MirError> {
        let mut actions = ActionList::new();
        let is_primary =
            self.network_config.epoch_primary(self.number) == self.params.id;
        if is_primary
            && !self.new_epoch_sent
            && self.strong_changes.len() >= self.network_config.strong_quorum()
        {
            // nodes that took part in the epoch change lead the new epoch
            let leaders = self
                .network_config
                .nodes
                .iter()
                .copied()
                .filter(|n| self.strong_changes.contains_key(n))
                .collect();
            if let Some(new_config) =
                construct_new_epoch_config(&self.network_config, leaders, &self.strong_changes)?
            {
                pf_info!(
                    "sending new epoch {} starting at checkpoint {}",
                    self.number,
                    new_config.starting_checkpoint.seq_no
                );
                self.new_epoch_sent = true;
                let epoch_changes = self
                    .strong_changes
                    .values()
                    .map(|c| RemoteEpochChange {
                        node_id: c.source,
                        digest: c.digest.clone(),
                    })
                    .collect();
                self.broadcast(
                    &mut actions,
                    Msg::NewEpoch(NewEpoch {
                        new_config,
                        epoch_changes,
                    }),
                );
            }
        }
        if self.network_new_epoch.is_some() {
            self.state = EpochTargetState::Fetching;
        } else if self.leader_new_epoch.is_some() {
            self.state = EpochTargetState::Verifying;
        }
        Ok(actions)
    }

    fn reject_new_epoch(&mut self, reason: String) {
        pf_warn!("byzantine evidence: rejecting new epoch {}: {}", self.number, reason);
        self.leader_new_epoch = None;
        self.state = EpochTargetState::Pending;
    }

    fn verify_new_epoch(&mut self) -> Result<ActionList, MirError> {
        let Some(new_epoch) = self.leader_new_epoch.clone() else {
            self.state = EpochTargetState::Pending;
            return Ok(ActionList::new());
        };
        if self.network_new_epoch.is_some() {
            self.state = EpochTargetState::Fetching;
            return Ok(ActionList::new());
        }

        let mut referenced = BTreeMap::new();
        for remote in &new_epoch.epoch_changes {
            match self.strong_changes.get(&remote.node_id) {
                Some(c) if c.digest == remote.digest => {
                    if referenced.insert(remote.node_id, c.clone()).is_some() {
                        self.reject_new_epoch(format!(
                            "change of {} referenced twice",
                            remote.node_id
                        ));
                        return Ok(ActionList::new());
                    }
                }
                Some(_) => {
                    self.reject_new_epoch(format!(
                        "change of {} has another digest",
                        remote.node_id
                    ));
                    return Ok(ActionList::new());
                }
                None => return Ok(ActionList::new()), // not strong here yet
            }
        }
        if referenced.len() < self.network_config.strong_quorum() {
            self.reject_new_epoch(format!(
                "only {} epoch changes referenced",
                referenced.len()
            ));
            return Ok(ActionList::new());
        }
        let leaders = &new_epoch.new_config.config.leaders;
        if leaders.is_empty()
            || leaders
                .iter()
                .any(|l| self.network_config.node_index(*l).is_none())
        {
            self.reject_new_epoch(format!("bad leader set {:?}", leaders));
            return Ok(ActionList::new());
        }

        let expected = construct_new_epoch_config(
            &self.network_config,
            leaders.clone(),
            &referenced,
        )?;
        if expected.as_ref() != Some(&new_epoch.new_config) {
            self.reject_new_epoch("config does not follow from the changes".into());
            return Ok(ActionList::new());
        }

        let start = new_epoch.new_config.starting_checkpoint.seq_no;
        for (offset, digest) in new_epoch.new_config.final_preprepares.iter().enumerate() {
            let seq_no = start + 1 + offset as u64;
            let holders = referenced
                .values()
                .filter(|c| c.has_queued(seq_no, digest))
                .map(|c| c.source)
                .collect();
            self.fetch_sources.insert(digest.clone(), holders);
        }
        pf_debug!("new epoch {} verified", self.number);
        self.network_new_epoch = Some(new_epoch.new_config);
        self.state = EpochTargetState::Fetching;
        Ok(ActionList::new())
    }

    /// Requests whatever the verified config needs that is not held
    /// locally: the starting checkpoint state and the certified batches.
    /// Moves on to echoing once everything is present.
    pub fn fetch_new_epoch_state(&mut self, ctx: &mut EpochContext) -> ActionList {
        let mut actions = ActionList::new();
        let Some(config) = self.network_new_epoch.clone() else {
            return actions;
        };
        let start = &config.starting_checkpoint;
        if ctx.commit_state.is_transferring() {
            return actions;
        }
        if start.seq_no > ctx.commit_state.last_applied_commit() {
            return ctx
                .commit_state
                .transfer_to(start.seq_no, start.value.clone(), ctx.persisted);
        }

        let others: Vec<NodeId> = self
            .network_config
            .nodes
            .iter()
            .copied()
            .filter(|&n| n != self.params.id)
            .collect();
        let mut missing = false;
        for (offset, digest) in config.final_preprepares.iter().enumerate() {
            if ctx.batch_tracker.has_batch(digest) {
                continue;
            }
            missing = true;
            let sources = match self.fetch_sources.get(digest) {
                Some(s) if !s.is_empty() => s.clone(),
                _ => others.clone(),
            };
            actions.concat(ctx.batch_tracker.fetch_batch(
                start.seq_no + 1 + offset as u64,
                digest.clone(),
                &sources,
            ));
        }
        if missing {
            return actions;
        }

        if !self.echo_sent {
            self.echo_sent = true;
            self.broadcast(&mut actions, Msg::NewEpochEcho(config));
        }
        self.state = EpochTargetState::Echoing;
        actions
    }

    fn check_echos(&mut self) -> ActionList {
        let mut actions = ActionList::new();
        let Some(config) = self.network_new_epoch.clone() else {
            return actions;
        };
        if !self.ready_sent
            && vote_count(&self.echos, &config) < self.network_config.strong_quorum()
        {
            return actions;
        }
        if !self.ready_sent {
            self.ready_sent = true;
            self.broadcast(&mut actions, Msg::NewEpochReady(config));
        }
        self.state = EpochTargetState::Readying;
        actions
    }

    fn check_readies(&mut self) -> ActionList {
        let ready = self.network_new_epoch.as_ref().is_some_and(|config| {
            vote_count(&self.readies, config) >= self.network_config.strong_quorum()
        });
        if ready {
            self.state = EpochTargetState::Ready;
        }
        ActionList::new()
    }

    fn start_epoch(&mut self, ctx: &mut EpochContext) -> Result<ActionList, MirError> {
        let Some(config) = self.network_new_epoch.clone() else {
            return fatal_err!("epoch {} ready without a config", self.number);
        };
        pf_info!(
            "epoch {} in progress from checkpoint {}",
            self.number,
            config.starting_checkpoint.seq_no
        );
        let mut actions = ctx.persisted.append(Persistent::NEntry(NEntry {
            seq_no: config.starting_checkpoint.seq_no,
            epoch_config: config.config.clone(),
        }));
        let client_states = ctx.commit_state.current_client_states();
        let mut active = ActiveEpoch::new(
            &self.params,
            self.network_config.clone(),
            config.config,
            config.starting_checkpoint.seq_no,
            config.final_preprepares,
            &client_states,
            ctx,
        );
        actions.concat(active.advance(ctx)?);
        actions.concat(self.replay_prestart(&mut active, ctx)?);
        self.active = Some(active);
        self.state = EpochTargetState::InProgress;
        Ok(actions)
    }

    fn resume_epoch(&mut self, ctx: &mut EpochContext) -> Result<ActionList, MirError> {
        let Some(log) = self.resume_log.take() else {
            return fatal_err!("epoch {} resuming without log records", self.number);
        };
        pf_info!("resuming epoch {} from the log", self.number);
        let client_states = ctx.commit_state.current_client_states();
        let mut active = ActiveEpoch::new(
            &self.params,
            self.network_config.clone(),
            log.config,
            log.start_seq,
            vec![],
            &client_states,
            ctx,
        );
        let mut actions = active.resume(&log.q_entries, &log.p_entries, ctx)?;
        actions.concat(self.replay_prestart(&mut active, ctx)?);
        self.active = Some(active);
        self.state = EpochTargetState::InProgress;
        Ok(actions)
    }

    fn replay_prestart(
        &mut self,
        active: &mut ActiveEpoch,
        ctx: &mut EpochContext,
    ) -> Result<ActionList, MirError> {
        let mut actions = ActionList::new();
        for (source, msg) in self.prestart.drain_where(|_| true, |_| false) {
            match active.step(source, &msg, ctx) {
                Ok(a) => {
                    actions.concat(a);
                }
                Err(e) if e.is_byzantine() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(actions)
    }

    fn advance_active(&mut self, ctx: &mut EpochContext) -> Result<ActionList, MirError> {
        let Some(active) = self.active.as_mut() else {
            return fatal_err!("epoch {} in progress without an active epoch", self.number);
        };
        let actions = active.advance(ctx)?;
        if ctx.commit_state.low_watermark() >= active.config().planned_expiration {
            self.state = EpochTargetState::Ending;
        }
        Ok(actions)
    }

    fn end_epoch(&mut self, ctx: &mut EpochContext) -> ActionList {
        let mut actions = ActionList::new();
        if let Some(active) = self.active.as_ref() {
            pf_info!("epoch {} reached its planned expiration", self.number);
            actions.concat(ctx.persisted.append(Persistent::FEntry(FEntry {
                ends_epoch_config: active.config().clone(),
            })));
        }
        self.state = EpochTargetState::Done;
        actions
    }

    pub fn status(&self) -> EpochTargetStatus {
        let nodes = |votes: &[(NewEpochConfig, BTreeSet<NodeId>)]| -> Vec<NodeId> {
            votes
                .iter()
                .max_by_key(|(_, n)| n.len())
                .map(|(_, n)| n.iter().copied().collect())
                .unwrap_or_default()
        };
        EpochTargetStatus {
            number: self.number,
            state: self.state,
            epoch_changes: self.strong_changes.keys().copied().collect(),
            echos: nodes(&self.echos),
            readies: nodes(&self.readies),
            suspicions: self.suspicions.iter().copied().collect(),
            leaders: self
                .active_config()
                .map(|c| c.leaders.clone())
                .unwrap_or_default(),
            buckets: self.active.as_ref().map(|a| a.status()).unwrap_or_default(),
        }
    }
}
