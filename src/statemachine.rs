//! The state machine: owns every component, routes each event to them, and
//! drives them to a fixpoint before returning the resulting actions.

use crate::actions::{ActionList, HashOrigin};
use crate::batch::BatchTracker;
use crate::checkpoint::{CheckpointTracker, CheckpointTrackerState};
use crate::clients::{ClientHashDisseminator, ClientTracker};
use crate::commit::CommitState;
use crate::epoch::{EpochContext, EpochTracker};
use crate::events::{ActionResults, CheckpointResult, HashResult, InitialParameters, StateEvent};
use crate::messages::{
    CEntry, EpochConfig, FEntry, Msg, NetworkConfig, NetworkState, NodeId, Persistent,
};
use crate::persisted::{LogVisitor, Persisted};
use crate::status::{MachineState, StateMachineStatus};
use crate::utils::{MirError, ME};

// Borrowed view for epoch handling, built from disjoint fields so that the
// epoch tracker itself can be borrowed mutably alongside it.
macro_rules! epoch_ctx {
    ($sm:expr) => {
        EpochContext {
            persisted: &mut $sm.persisted,
            commit_state: &mut $sm.commit_state,
            client_tracker: &mut $sm.client_tracker,
            batch_tracker: &mut $sm.batch_tracker,
        }
    };
}

// Finds the last checkpoint and whether an epoch end follows it.
#[derive(Default)]
struct LogRecovery {
    last_checkpoint: Option<u64>,
    truncate_to: Option<u64>,
}

impl LogVisitor for LogRecovery {
    fn on_c_entry(&mut self, entry: &CEntry) {
        self.last_checkpoint = Some(entry.seq_no);
    }

    fn on_f_entry(&mut self, _entry: &FEntry) {
        self.truncate_to = self.last_checkpoint;
    }
}

// Placeholder network state until the log is loaded.
fn bootstrap_state(id: NodeId) -> NetworkState {
    NetworkState::new(
        NetworkConfig {
            nodes: vec![id],
            checkpoint_interval: 1,
            max_epoch_length: 1,
            number_of_buckets: 1,
        },
        &[],
        0,
    )
}

/// Deterministic consensus core of one replica. Consumes `StateEvent`s and
/// returns the actions the caller must carry out; performs no I/O.
#[derive(Debug)]
pub struct StateMachine {
    state: MachineState,
    params: InitialParameters,

    persisted: Persisted,
    commit_state: CommitState,
    client_tracker: ClientTracker,
    disseminator: ClientHashDisseminator,
    checkpoint_tracker: CheckpointTracker,
    batch_tracker: BatchTracker,
    epoch_tracker: EpochTracker,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    pub fn new() -> Self {
        Self::with_params(InitialParameters::default(), MachineState::Uninitialized)
    }

    fn with_params(params: InitialParameters, state: MachineState) -> Self {
        let bootstrap = bootstrap_state(params.id);
        StateMachine {
            state,
            persisted: Persisted::new(),
            commit_state: CommitState::new(bootstrap.clone()),
            client_tracker: ClientTracker::new(),
            disseminator: ClientHashDisseminator::new(&params, bootstrap.config.clone()),
            checkpoint_tracker: CheckpointTracker::new(params.id, 0, bootstrap.config.clone()),
            batch_tracker: BatchTracker::new(),
            epoch_tracker: EpochTracker::new(&params, bootstrap.config),
            params,
        }
    }

    #[inline]
    pub fn state(&self) -> MachineState {
        self.state
    }

    /// Applies one event and returns the actions it produced. A fatal error
    /// leaves the machine unusable; byzantine input is logged and dropped.
    pub fn apply_event(&mut self, event: StateEvent) -> Result<ActionList, MirError> {
        let mut actions = ActionList::new();
        match event {
            StateEvent::Initialize(params) => {
                self.initialize(params)?;
                return Ok(actions);
            }
            StateEvent::LoadEntry { index, data } => {
                ensure!(
                    self.state == MachineState::LoadingPersisted,
                    "WAL entry {} loaded in state {:?}",
                    index,
                    self.state
                );
                self.persisted.append_initial_load(index, data)?;
                return Ok(actions);
            }
            StateEvent::CompleteInitialization => {
                ensure!(
                    self.state == MachineState::LoadingPersisted,
                    "initialization completed in state {:?}",
                    self.state
                );
                pf_info!("loaded {} WAL entries", self.persisted.len());
                self.state = MachineState::Initialized;
                actions.concat(self.reinitialize()?);
            }
            event if self.state != MachineState::Initialized => {
                return fatal_err!(
                    "event {} applied in state {:?}",
                    event_name(&event),
                    self.state
                );
            }
            StateEvent::Tick => {
                actions.concat(self.disseminator.tick());
                let ticked = self.epoch_tracker.tick(&mut epoch_ctx!(self));
                actions.concat(absorb(ticked)?);
            }
            StateEvent::Step { source, msg } => {
                actions.concat(self.step(source, &msg)?);
            }
            StateEvent::AddResults(results) => {
                actions.concat(self.add_results(results)?);
            }
            StateEvent::AddClientResults(results) => {
                actions.concat(self.disseminator.apply_new_requests(&results.persisted));
            }
            StateEvent::Transfer(c_entry) => {
                actions.concat(self.complete_transfer(c_entry)?);
            }
            StateEvent::ActionsReceived | StateEvent::ClientActionsReceived => {
                return Ok(actions);
            }
        }

        actions.concat(self.settle()?);
        Ok(actions)
    }

    fn initialize(&mut self, params: InitialParameters) -> Result<(), MirError> {
        ensure!(
            self.state == MachineState::Uninitialized,
            "initialized twice (state {:?})",
            self.state
        );
        params.validate()?;
        let _ = ME.set(params.id.to_string());
        pf_debug!("initializing with {:?}", params);
        *self = Self::with_params(params, MachineState::LoadingPersisted);
        Ok(())
    }

    // Truncates the log behind the last checkpoint when an epoch end follows
    // it.
    fn recover_log(&mut self) -> Result<ActionList, MirError> {
        let mut recovery = LogRecovery::default();
        self.persisted.iterate(&mut recovery);
        if recovery.last_checkpoint.is_none() {
            return fatal_err!("found no checkpoints in the log");
        }
        Ok(match recovery.truncate_to {
            Some(seq_no) => self.persisted.truncate(seq_no),
            None => ActionList::new(),
        })
    }

    /// Rebuilds every component from the log.
    fn reinitialize(&mut self) -> Result<ActionList, MirError> {
        let mut actions = self.recover_log()?;
        actions.concat(self.commit_state.reinitialize(&self.persisted)?);

        let low = self.commit_state.low_watermark();
        let network_state = self.commit_state.active_state().clone();
        self.client_tracker.reinitialize(&network_state);
        actions.concat(self.disseminator.reinitialize(
            low,
            &network_state,
            &mut self.client_tracker,
        ));
        self.checkpoint_tracker
            .reinitialize(network_state.config.clone(), low);
        self.batch_tracker.reinitialize(&self.persisted);
        actions.concat(self.epoch_tracker.reinitialize(&mut epoch_ctx!(self))?);
        pf_info!(
            "reinitialized at checkpoint {} with {} nodes",
            low,
            network_state.config.nodes.len()
        );
        Ok(actions)
    }

    fn step(&mut self, source: NodeId, msg: &Msg) -> Result<ActionList, MirError> {
        pf_trace!("step {} <- {}", msg.kind(), source);
        let result = match msg {
            Msg::RequestAck(_) | Msg::FetchRequest(_) | Msg::ForwardRequest { .. } => self
                .disseminator
                .step(source, msg, &mut self.client_tracker),
            Msg::Checkpoint(checkpoint) => self
                .checkpoint_tracker
                .step(source, checkpoint)
                .map(|()| ActionList::new()),
            Msg::FetchBatch { .. } | Msg::ForwardBatch { .. } => {
                self.batch_tracker.step(source, msg)
            }
            Msg::Preprepare(_)
            | Msg::Prepare(_)
            | Msg::Commit(_)
            | Msg::Suspect(_)
            | Msg::EpochChange(_)
            | Msg::EpochChangeAck { .. }
            | Msg::NewEpoch(_)
            | Msg::NewEpochEcho(_)
            | Msg::NewEpochReady(_) => {
                self.epoch_tracker.step(source, msg, &mut epoch_ctx!(self))
            }
        };
        absorb(result)
    }

    fn add_results(&mut self, results: ActionResults) -> Result<ActionList, MirError> {
        let mut actions = ActionList::new();
        for result in results.checkpoints {
            actions.concat(self.apply_checkpoint_result(result)?);
        }
        for result in results.digests {
            let applied = self.apply_hash_result(result);
            actions.concat(absorb(applied)?);
        }
        Ok(actions)
    }

    fn apply_checkpoint_result(
        &mut self,
        result: CheckpointResult,
    ) -> Result<ActionList, MirError> {
        if result.seq_no < self.commit_state.low_watermark() {
            pf_debug!("dropping stale checkpoint result for seq {}", result.seq_no);
            return Ok(ActionList::new());
        }
        let prev_stop_at = self.commit_state.stop_at_seq_no();
        let prev_config = self.commit_state.active_state().config.clone();
        let epoch_config = self.epoch_tracker.active_epoch_config().cloned();

        let mut actions = self.commit_state.apply_checkpoint_result(
            epoch_config.as_ref(),
            &result,
            &mut self.persisted,
        )?;

        if self.commit_state.stop_at_seq_no() > prev_stop_at {
            self.client_tracker
                .allocate(result.seq_no, &result.network_state);
            actions.concat(
                self.disseminator
                    .allocate(result.seq_no, &result.network_state),
            );
        }

        if result.network_state.config != prev_config {
            pf_info!(
                "network reconfigured at checkpoint {}, ending epoch {}",
                result.seq_no,
                self.epoch_tracker.current_epoch()
            );
            let ends = epoch_config.unwrap_or_else(|| EpochConfig {
                number: self.epoch_tracker.current_epoch(),
                leaders: vec![],
                planned_expiration: result.seq_no,
            });
            actions.concat(self.persisted.append(Persistent::FEntry(FEntry {
                ends_epoch_config: ends,
            })));
            actions.concat(self.reinitialize()?);
        }
        Ok(actions)
    }

    fn apply_hash_result(&mut self, result: HashResult) -> Result<ActionList, MirError> {
        let HashResult { digest, origin } = result;
        match origin {
            HashOrigin::Batch {
                epoch,
                seq_no,
                request_acks,
                ..
            } => {
                self.batch_tracker
                    .add_batch(seq_no, digest.clone(), request_acks);
                self.epoch_tracker.apply_batch_hash_result(
                    epoch,
                    seq_no,
                    digest,
                    &mut epoch_ctx!(self),
                )
            }
            HashOrigin::EpochChange {
                source,
                origin,
                epoch_change,
            } => self.epoch_tracker.apply_epoch_change_digest(
                source,
                origin,
                &epoch_change,
                digest,
            ),
            HashOrigin::VerifyBatch {
                source,
                seq_no,
                request_acks,
                expected_digest,
            } => {
                self.batch_tracker.apply_verify_batch_hash_result(
                    &digest,
                    source,
                    seq_no,
                    &request_acks,
                    &expected_digest,
                )?;
                if !self.batch_tracker.has_fetch_in_flight()
                    && self.epoch_tracker.is_fetching()
                {
                    self.epoch_tracker
                        .fetch_new_epoch_state(&mut epoch_ctx!(self))
                } else {
                    Ok(ActionList::new())
                }
            }
            HashOrigin::VerifyRequest {
                source,
                request_ack,
                request_data,
            } => self.disseminator.apply_verify_request_hash_result(
                &digest,
                source,
                &request_ack,
                &request_data,
            ),
        }
    }

    fn complete_transfer(&mut self, c_entry: CEntry) -> Result<ActionList, MirError> {
        let Some(requested) = self.commit_state.transfer_seq_no() else {
            return fatal_err!(
                "state transfer to seq {} completed but none was requested",
                c_entry.seq_no
            );
        };
        ensure!(
            c_entry.seq_no == requested,
            "state transfer completed at seq {} but seq {} was requested",
            c_entry.seq_no,
            requested
        );
        // earlier records stay in the WAL until the next garbage collection
        pf_info!("state transfer to seq {} completed", c_entry.seq_no);
        let mut actions = self.persisted.append(Persistent::CEntry(c_entry));
        actions.concat(self.reinitialize()?);
        Ok(actions)
    }

    // Common tail of every progress event: state transfer if the network
    // left this node behind, garbage collection, then alternating delivery
    // and epoch progress until neither yields anything.
    fn settle(&mut self) -> Result<ActionList, MirError> {
        let mut actions = ActionList::new();

        if let Some(target) = self
            .checkpoint_tracker
            .transfer_target(self.commit_state.stop_at_seq_no())
        {
            if target.seq_no > self.commit_state.low_watermark() {
                actions.concat(self.commit_state.transfer_to(
                    target.seq_no,
                    target.value,
                    &mut self.persisted,
                ));
            }
        }

        if self.checkpoint_tracker.state() == CheckpointTrackerState::GarbageCollectable {
            let new_low = self.checkpoint_tracker.garbage_collect();
            pf_debug!("garbage collecting through checkpoint {}", new_low);
            actions.concat(self.persisted.truncate(new_low));
            let ci = self.commit_state.active_state().config.checkpoint_interval;
            if new_low > ci {
                self.batch_tracker.truncate(new_low - ci);
            }
            actions.concat(self.epoch_tracker.move_low_watermark(new_low));
        }

        loop {
            let delivered = self.commit_state.drain();
            let advanced = self.epoch_tracker.advance_state(&mut epoch_ctx!(self))?;
            let settled = delivered.is_empty() && advanced.is_empty();
            actions.concat(delivered);
            actions.concat(advanced);
            if settled {
                break;
            }
        }
        Ok(actions)
    }

    /// Read-only snapshot of every component.
    pub fn status(&self) -> StateMachineStatus {
        StateMachineStatus {
            node_id: self.params.id,
            state: self.state,
            low_watermark: self.commit_state.low_watermark(),
            high_watermark: self
                .epoch_tracker
                .high_watermark()
                .unwrap_or(self.commit_state.low_watermark()),
            last_applied_commit: self.commit_state.last_applied_commit(),
            highest_commit: self.commit_state.highest_commit(),
            stop_at_seq_no: self.commit_state.stop_at_seq_no(),
            transferring: self.commit_state.is_transferring(),
            wal_head: self.persisted.head_index(),
            wal_len: self.persisted.len(),
            checkpoints: self.checkpoint_tracker.status(),
            clients: self.disseminator.status(),
            epoch_tracker: self.epoch_tracker.status(),
        }
    }
}

// Drops byzantine failures, which have already been logged as evidence.
fn absorb(result: Result<ActionList, MirError>) -> Result<ActionList, MirError> {
    match result {
        Err(e) if e.is_byzantine() => Ok(ActionList::new()),
        other => other,
    }
}

fn event_name(event: &StateEvent) -> &'static str {
    match event {
        StateEvent::Initialize(_) => "Initialize",
        StateEvent::LoadEntry { .. } => "LoadEntry",
        StateEvent::CompleteInitialization => "CompleteInitialization",
        StateEvent::Tick => "Tick",
        StateEvent::Step { .. } => "Step",
        StateEvent::AddResults(_) => "AddResults",
        StateEvent::AddClientResults(_) => "AddClientResults",
        StateEvent::Transfer(_) => "Transfer",
        StateEvent::ActionsReceived => "ActionsReceived",
        StateEvent::ClientActionsReceived => "ClientActionsReceived",
    }
}
