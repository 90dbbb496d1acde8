//! Epoch tracking: which epoch this node is working towards, moving to a
//! later one on expiry, suspicion, or when enough peers are already ahead.

mod active;
mod buffer;
mod change;
mod target;

use std::collections::BTreeMap;

use serde::Serialize;

use crate::actions::ActionList;
use crate::batch::BatchTracker;
use crate::clients::ClientTracker;
use crate::commit::CommitState;
use crate::events::InitialParameters;
use crate::messages::{
    CEntry, Digest, ECEntry, EpochChange, EpochConfig, EpochNo, FEntry, Msg, NEntry,
    NetworkConfig, NodeId, PEntry, QEntry, SeqNo, Suspect,
};
use crate::persisted::{LogVisitor, Persisted};
use crate::utils::MirError;

pub use active::BucketStatus;
pub use target::{EpochTargetState, EpochTargetStatus};

use buffer::MsgBuffers;
use target::EpochTarget;

/// Borrowed view of the components epoch handling works on. Built fresh by
/// the state machine for every call.
pub struct EpochContext<'a> {
    pub persisted: &'a mut Persisted,
    pub commit_state: &'a mut CommitState,
    pub client_tracker: &'a mut ClientTracker,
    pub batch_tracker: &'a mut BatchTracker,
}

/// Last epoch-relevant record of the log.
#[derive(Debug, Clone)]
enum EpochMarker {
    Active { config: EpochConfig, start_seq: SeqNo },
    Ended(EpochNo),
    Changing(EpochNo),
    Suspected(EpochNo),
}

#[derive(Default)]
struct EpochLogScanner {
    marker: Option<EpochMarker>,
    q_entries: Vec<QEntry>,
    p_entries: Vec<PEntry>,
}

impl EpochLogScanner {
    fn leave_active(&mut self, marker: EpochMarker) {
        self.marker = Some(marker);
        self.q_entries.clear();
        self.p_entries.clear();
    }
}

impl LogVisitor for EpochLogScanner {
    fn on_q_entry(&mut self, entry: &QEntry) {
        if matches!(self.marker, Some(EpochMarker::Active { .. })) {
            self.q_entries.push(entry.clone());
        }
    }

    fn on_p_entry(&mut self, entry: &PEntry) {
        if matches!(self.marker, Some(EpochMarker::Active { .. })) {
            self.p_entries.push(entry.clone());
        }
    }

    fn on_c_entry(&mut self, entry: &CEntry) {
        // a checkpoint only names the active epoch when nothing before it
        // in the live log does
        if self.marker.is_none() {
            if let Some(config) = &entry.epoch_config {
                self.marker = Some(EpochMarker::Active {
                    config: config.clone(),
                    start_seq: entry.seq_no,
                });
            }
        }
    }

    fn on_n_entry(&mut self, entry: &NEntry) {
        self.leave_active(EpochMarker::Active {
            config: entry.epoch_config.clone(),
            start_seq: entry.seq_no,
        });
    }

    fn on_f_entry(&mut self, entry: &FEntry) {
        self.leave_active(EpochMarker::Ended(entry.ends_epoch_config.number));
    }

    fn on_ec_entry(&mut self, entry: &ECEntry) {
        self.leave_active(EpochMarker::Changing(entry.epoch_number));
    }

    fn on_suspect(&mut self, entry: &Suspect) {
        self.leave_active(EpochMarker::Suspected(entry.epoch));
    }
}

/// Observability snapshot of epoch tracking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EpochTrackerStatus {
    pub current: EpochTargetStatus,

    /// Highest epoch seen from each node.
    pub max_epochs: Vec<(NodeId, EpochNo)>,

    pub buffered: usize,
}

/// The epoch tracker.
#[derive(Debug)]
pub struct EpochTracker {
    params: InitialParameters,
    network_config: NetworkConfig,

    current: EpochTarget,

    /// Highest epoch number seen in a message from each node.
    max_epochs: BTreeMap<NodeId, EpochNo>,

    /// Messages tagged with epochs later than the current one.
    future: MsgBuffers,
}

impl EpochTracker {
    pub fn new(params: &InitialParameters, network_config: NetworkConfig) -> Self {
        EpochTracker {
            params: params.clone(),
            current: EpochTarget::done(params, network_config.clone()),
            network_config,
            max_epochs: BTreeMap::new(),
            future: MsgBuffers::new(params.buffer_size as usize),
        }
    }

    /// Picks the target epoch from the last epoch record of the log. An
    /// epoch change already installing the same epoch is kept.
    pub fn reinitialize(&mut self, ctx: &mut EpochContext) -> Result<ActionList, MirError> {
        self.network_config = ctx.commit_state.active_state().config.clone();

        let mut scanner = EpochLogScanner::default();
        ctx.persisted.iterate(&mut scanner);

        let mut actions = ActionList::new();
        let target = match scanner.marker {
            Some(EpochMarker::Active { config, start_seq })
                if start_seq <= ctx.commit_state.low_watermark() =>
            {
                EpochTarget::resuming(
                    config,
                    start_seq,
                    scanner.q_entries,
                    scanner.p_entries,
                    &self.params,
                    self.network_config.clone(),
                )
            }
            Some(EpochMarker::Active { config, start_seq }) => {
                pf_warn!(
                    "epoch {} started at seq {} beyond the log's checkpoint, changing epoch",
                    config.number,
                    start_seq
                );
                self.prepending(config.number + 1, false)
            }
            Some(EpochMarker::Ended(number)) => self.prepending(number + 1, false),
            Some(EpochMarker::Changing(number)) => self.prepending(number, true),
            Some(EpochMarker::Suspected(number)) => {
                actions.send(
                    &self.network_config.nodes,
                    Msg::Suspect(Suspect { epoch: number }),
                );
                self.prepending(number + 1, false)
            }
            None => {
                let number = self.current.number().max(1);
                pf_warn!("no epoch records in the log, changing to epoch {}", number);
                self.prepending(number, false)
            }
        };

        if target.number() == self.current.number() && self.current.is_installing() {
            pf_debug!("continuing installation of epoch {}", target.number());
            self.current.restart_installation(self.network_config.clone());
        } else {
            pf_info!(
                "epoch tracker reinitialized towards epoch {} ({:?})",
                target.number(),
                target.state()
            );
            self.current = target;
        }
        Ok(actions)
    }

    fn prepending(&self, number: EpochNo, ec_logged: bool) -> EpochTarget {
        EpochTarget::prepending(number, ec_logged, &self.params, self.network_config.clone())
    }

    /// Handler of epoch-scoped peer messages.
    pub fn step(
        &mut self,
        source: NodeId,
        msg: &Msg,
        ctx: &mut EpochContext,
    ) -> Result<ActionList, MirError> {
        if self.network_config.node_index(source).is_none() {
            return byzantine_err!("{} from unknown node {}", msg.kind(), source);
        }
        let Some(epoch) = msg.epoch() else {
            return fatal_err!("epoch tracker stepped with {}", msg.kind());
        };
        let max = self.max_epochs.entry(source).or_insert(0);
        *max = (*max).max(epoch);

        let current = self.current.number();
        if epoch < current {
            Ok(ActionList::new())
        } else if epoch > current {
            self.future.store(source, msg.clone());
            Ok(ActionList::new())
        } else {
            self.current.step(source, msg, ctx)
        }
    }

    pub fn apply_batch_hash_result(
        &mut self,
        epoch: EpochNo,
        seq_no: SeqNo,
        digest: Digest,
        ctx: &mut EpochContext,
    ) -> Result<ActionList, MirError> {
        if epoch != self.current.number() {
            return Ok(ActionList::new());
        }
        self.current.apply_batch_hash_result(seq_no, digest, ctx)
    }

    pub fn apply_epoch_change_digest(
        &mut self,
        source: NodeId,
        origin: NodeId,
        epoch_change: &EpochChange,
        digest: Digest,
    ) -> Result<ActionList, MirError> {
        if epoch_change.new_epoch != self.current.number() {
            return Ok(ActionList::new());
        }
        self.current
            .apply_epoch_change_digest(source, origin, epoch_change, digest)
    }

    pub fn tick(&mut self, ctx: &mut EpochContext) -> Result<ActionList, MirError> {
        self.current.tick(ctx)
    }

    pub fn move_low_watermark(&mut self, seq_no: SeqNo) -> ActionList {
        self.current.move_low_watermark(seq_no);
        ActionList::new()
    }

    /// Re-checks the state being fetched for the new epoch.
    pub fn fetch_new_epoch_state(
        &mut self,
        ctx: &mut EpochContext,
    ) -> Result<ActionList, MirError> {
        if !self.is_fetching() {
            return Ok(ActionList::new());
        }
        self.current.advance_state(ctx)
    }

    #[inline]
    pub fn is_fetching(&self) -> bool {
        self.current.state() == EpochTargetState::Fetching
    }

    pub fn active_epoch_config(&self) -> Option<&EpochConfig> {
        self.current.active_config()
    }

    /// Highest sequence allocated by the active epoch, if any.
    pub fn high_watermark(&self) -> Option<SeqNo> {
        self.current.high_watermark()
    }

    #[inline]
    pub fn current_epoch(&self) -> EpochNo {
        self.current.number()
    }

    // Epoch a weak quorum of other nodes has reached beyond the current one.
    fn jump_target(&self) -> Option<EpochNo> {
        let current = self.current.number();
        let mut ahead: Vec<EpochNo> = self
            .max_epochs
            .iter()
            .filter(|(&n, &e)| n != self.params.id && e > current)
            .map(|(_, &e)| e)
            .collect();
        let weak = self.network_config.weak_quorum();
        if ahead.len() < weak {
            return None;
        }
        ahead.sort_unstable_by(|a, b| b.cmp(a));
        Some(ahead[weak - 1])
    }

    fn switch_to(
        &mut self,
        number: EpochNo,
        ctx: &mut EpochContext,
    ) -> Result<ActionList, MirError> {
        pf_info!("moving from epoch {} to epoch {}", self.current.number(), number);
        self.current = self.prepending(number, false);

        let mut actions = ActionList::new();
        let ready = self
            .future
            .drain_where(|m| m.epoch() == Some(number), |m| m.epoch() < Some(number));
        for (source, msg) in ready {
            match self.current.step(source, &msg, ctx) {
                Ok(a) => {
                    actions.concat(a);
                }
                Err(e) if e.is_byzantine() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(actions)
    }

    /// Advances the current target as far as possible, moving on to later
    /// epochs when it is done or left behind.
    pub fn advance_state(
        &mut self,
        ctx: &mut EpochContext,
    ) -> Result<ActionList, MirError> {
        let mut actions = ActionList::new();
        loop {
            actions.concat(self.current.advance_state(ctx)?);
            if self.current.is_done() {
                let next = self.current.number() + 1;
                actions.concat(self.switch_to(next, ctx)?);
            } else if let Some(number) = self.jump_target() {
                actions.concat(self.switch_to(number, ctx)?);
            } else {
                break;
            }
        }
        Ok(actions)
    }

    pub fn status(&self) -> EpochTrackerStatus {
        EpochTrackerStatus {
            current: self.current.status(),
            max_epochs: self.max_epochs.iter().map(|(&n, &e)| (n, e)).collect(),
            buffered: self.future.len(),
        }
    }
}
