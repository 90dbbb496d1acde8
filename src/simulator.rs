//! In-process network of state machines driven by a deterministic event
//! queue, with a fake hasher, WAL, request store and application.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, VecDeque};
use std::hash::{Hash, Hasher};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::actions::{Action, ActionList, Commit};
use crate::events::{
    ActionResults, CheckpointResult, ClientActionResults, HashResult, InitialParameters,
    StateEvent,
};
use crate::messages::{
    CEntry, ClientId, Digest, NetworkConfig, NetworkState, NodeId, Persistent, QEntry, ReqNo,
    RequestAck,
};
use crate::persisted::initial_log;
use crate::statemachine::StateMachine;
use crate::status::MachineState;
use crate::utils::MirError;

fn fake_hash(data: &[Vec<u8>]) -> Digest {
    let mut hasher = DefaultHasher::new();
    for d in data {
        d.hash(&mut hasher);
    }
    Digest::from(hasher.finish().to_be_bytes().to_vec())
}

struct SimNode {
    machine: StateMachine,
    wal: BTreeMap<u64, Persistent>,
    committed: Vec<QEntry>,
    store: BTreeMap<(ClientId, ReqNo), Vec<u8>>,

    /// Canonical bytes of every action list produced, in order.
    trace: Vec<u8>,
}

struct Simulator {
    nodes: Vec<SimNode>,
    queue: VecDeque<(NodeId, StateEvent)>,

    /// Payloads submitted by clients, delivered to a node's request store
    /// once the request number is allocated there.
    requests: BTreeMap<(ClientId, ReqNo), Vec<u8>>,

    ticks: u64,
}

impl Simulator {
    fn new(n: u64, network_state: NetworkState, reqs_per_client: u64, seed: u64) -> Result<Self, MirError> {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut requests = BTreeMap::new();
        for client in &network_state.clients {
            for req_no in 0..reqs_per_client {
                let payload: Vec<u8> = (0..16).map(|_| rng.gen()).collect();
                requests.insert((client.id, req_no), payload);
            }
        }

        let mut sim = Simulator {
            nodes: vec![],
            queue: VecDeque::new(),
            requests,
            ticks: 0,
        };
        for id in 0..n {
            let log = initial_log(network_state.clone(), Digest::from(vec![0]));
            let wal = log.into_iter().enumerate().map(|(i, r)| (i as u64, r)).collect();
            sim.nodes.push(SimNode {
                machine: StateMachine::new(),
                wal,
                committed: vec![],
                store: BTreeMap::new(),
                trace: vec![],
            });
            sim.boot(id)?;
        }
        Ok(sim)
    }

    fn params(id: NodeId) -> InitialParameters {
        InitialParameters {
            id,
            batch_size: 2,
            ..Default::default()
        }
    }

    // Replays the node's WAL into a fresh state machine.
    fn boot(&mut self, id: NodeId) -> Result<(), MirError> {
        let node = &mut self.nodes[id as usize];
        node.machine = StateMachine::new();
        node.machine.apply_event(StateEvent::Initialize(Self::params(id)))?;
        for (&index, data) in &node.wal {
            node.machine.apply_event(StateEvent::LoadEntry {
                index,
                data: data.clone(),
            })?;
        }
        let actions = node.machine.apply_event(StateEvent::CompleteInitialization)?;
        self.process(id, actions)
    }

    fn process(&mut self, id: NodeId, actions: ActionList) -> Result<(), MirError> {
        self.nodes[id as usize]
            .trace
            .extend_from_slice(&actions.to_bytes()?);
        for action in actions {
            self.perform(id, action);
        }
        Ok(())
    }

    fn perform(&mut self, id: NodeId, action: Action) {
        match action {
            Action::Send { targets, msg } => {
                for target in targets {
                    self.queue.push_back((
                        target,
                        StateEvent::Step {
                            source: id,
                            msg: msg.clone(),
                        },
                    ));
                }
            }
            Action::Hash { data, origin } => {
                let digest = fake_hash(&data);
                self.queue.push_back((
                    id,
                    StateEvent::AddResults(ActionResults {
                        checkpoints: vec![],
                        digests: vec![HashResult { digest, origin }],
                    }),
                ));
            }
            Action::AppendWriteAhead { index, data } => {
                self.nodes[id as usize].wal.insert(index, data);
            }
            Action::TruncateWriteAhead { index } => {
                self.nodes[id as usize].wal.retain(|&i, _| i >= index);
            }
            Action::Commit(Commit::Batch(q_entry)) => {
                self.nodes[id as usize].committed.push(q_entry);
            }
            Action::Commit(Commit::Checkpoint {
                seq_no,
                network_state,
            }) => {
                let value = app_value(&self.nodes[id as usize].committed, seq_no);
                self.queue.push_back((
                    id,
                    StateEvent::AddResults(ActionResults {
                        checkpoints: vec![CheckpointResult {
                            seq_no,
                            value,
                            network_state,
                        }],
                        digests: vec![],
                    }),
                ));
            }
            Action::StateTransfer { seq_no, value } => self.transfer(id, seq_no, value),
            Action::AllocatedRequest { client_id, req_no } => {
                let Some(payload) = self.requests.get(&(client_id, req_no)).cloned() else {
                    return;
                };
                let ack = RequestAck {
                    client_id,
                    req_no,
                    digest: fake_hash(&[payload.clone()]),
                };
                self.nodes[id as usize]
                    .store
                    .insert((client_id, req_no), payload);
                self.queue.push_back((
                    id,
                    StateEvent::AddClientResults(ClientActionResults {
                        persisted: vec![ack],
                    }),
                ));
            }
            Action::CorrectRequest(_) => {}
            Action::ForwardRequest {
                targets,
                request_ack,
            } => {
                let key = (request_ack.client_id, request_ack.req_no);
                let Some(data) = self.nodes[id as usize].store.get(&key).cloned() else {
                    return;
                };
                for target in targets {
                    self.queue.push_back((
                        target,
                        StateEvent::Step {
                            source: id,
                            msg: crate::messages::Msg::ForwardRequest {
                                request_ack: request_ack.clone(),
                                request_data: data.clone(),
                            },
                        },
                    ));
                }
            }
            Action::StoreRequest {
                request_ack,
                request_data,
            } => {
                self.nodes[id as usize]
                    .store
                    .insert((request_ack.client_id, request_ack.req_no), request_data);
            }
        }
    }

    // Copies the application state from a peer that already applied the
    // checkpoint.
    fn transfer(&mut self, id: NodeId, seq_no: u64, value: Digest) {
        let donor = self.nodes.iter().find_map(|n| {
            n.wal.values().find_map(|r| match r {
                Persistent::CEntry(c) if c.seq_no == seq_no && c.checkpoint_value == value => {
                    Some((c.clone(), n.committed.clone()))
                }
                _ => None,
            })
        });
        let Some((c_entry, committed)) = donor else {
            return;
        };
        let node = &mut self.nodes[id as usize];
        node.committed = committed.into_iter().filter(|q| q.seq_no <= seq_no).collect();
        self.queue.push_back((id, StateEvent::Transfer(c_entry)));
    }

    fn tick_all(&mut self) {
        self.ticks += 1;
        for id in 0..self.nodes.len() as u64 {
            self.queue.push_back((id, StateEvent::Tick));
        }
    }

    fn deliver_one(&mut self) -> Result<(), MirError> {
        let Some((id, event)) = self.queue.pop_front() else {
            self.tick_all();
            return Ok(());
        };
        let actions = self.nodes[id as usize].machine.apply_event(event)?;
        self.process(id, actions)
    }

    /// Runs until `done` holds or the step budget runs out. Returns whether
    /// `done` was reached.
    fn run_until(
        &mut self,
        max_steps: usize,
        done: impl Fn(&Simulator) -> bool,
    ) -> Result<bool, MirError> {
        for _ in 0..max_steps {
            if done(self) {
                return Ok(true);
            }
            self.deliver_one()?;
        }
        Ok(done(self))
    }

    fn committed_requests(&self, id: NodeId) -> usize {
        self.nodes[id as usize]
            .committed
            .iter()
            .map(|q| q.requests.len())
            .sum()
    }
}

// Application state digest through `seq_no`: a hash over committed batch
// digests, identical on every correct node.
fn app_value(committed: &[QEntry], seq_no: u64) -> Digest {
    let digests: Vec<Vec<u8>> = committed
        .iter()
        .filter(|q| q.seq_no <= seq_no)
        .map(|q| q.digest.as_bytes().to_vec())
        .collect();
    fake_hash(&digests)
}

fn network_state(buckets: u64) -> NetworkState {
    NetworkState::new(
        NetworkConfig {
            nodes: vec![0, 1, 2, 3],
            checkpoint_interval: 5,
            max_epoch_length: 200,
            number_of_buckets: buckets,
        },
        &[0, 1],
        20,
    )
}

#[cfg(test)]
mod simulator_tests {
    use super::*;
    use crate::actions::HashOrigin;
    use crate::batch::batch_hash_data;
    use crate::messages::{Checkpoint, Msg, SeqNo};

    fn all_committed(sim: &Simulator, total: usize) -> bool {
        (0..sim.nodes.len() as u64).all(|id| sim.committed_requests(id) >= total)
    }

    #[test]
    fn four_nodes_commit_everything() -> Result<(), MirError> {
        let mut sim = Simulator::new(4, network_state(4), 10, 7)?;
        assert!(sim.run_until(500_000, |s| all_committed(s, 20))?);

        // every node delivered the same batches in the same order
        let reference = &sim.nodes[0].committed;
        for node in &sim.nodes[1..] {
            let common = reference.len().min(node.committed.len());
            assert_eq!(node.committed[..common], reference[..common]);
        }
        for (i, q) in reference.iter().enumerate() {
            assert_eq!(q.seq_no, i as u64 + 1);
        }

        // each request delivered exactly once
        let mut seen = std::collections::BTreeSet::new();
        for q in reference {
            for r in &q.requests {
                assert!(seen.insert((r.client_id, r.req_no)));
            }
        }
        assert_eq!(seen.len(), 20);
        Ok(())
    }

    #[test]
    fn checkpoints_garbage_collect_wal() -> Result<(), MirError> {
        let mut sim = Simulator::new(4, network_state(2), 10, 11)?;
        assert!(sim.run_until(500_000, |s| {
            (0..4).all(|id| s.nodes[id as usize].machine.status().low_watermark >= 10)
        })?);
        for node in &sim.nodes {
            let status = node.machine.status();
            assert!(status.wal_head > 0);
            assert!(matches!(
                node.wal.values().next(),
                Some(Persistent::CEntry(c)) if c.seq_no >= 5
            ));
            assert_eq!(status.epoch_tracker.current.number, 1);
        }
        Ok(())
    }

    #[test]
    fn identical_runs_identical_actions() -> Result<(), MirError> {
        let run = || -> Result<Vec<Vec<u8>>, MirError> {
            let mut sim = Simulator::new(4, network_state(4), 6, 3)?;
            sim.run_until(20_000, |_| false)?;
            Ok(sim.nodes.into_iter().map(|n| n.trace).collect())
        };
        assert_eq!(run()?, run()?);
        Ok(())
    }

    #[test]
    fn restart_resumes_epoch() -> Result<(), MirError> {
        let mut sim = Simulator::new(4, network_state(4), 10, 5)?;
        assert!(sim.run_until(500_000, |s| s.nodes[0].machine.status().low_watermark >= 5)?);
        let before = sim.nodes[0].machine.status();

        sim.boot(0)?;
        let after = sim.nodes[0].machine.status();
        assert_eq!(after.state, MachineState::Initialized);
        assert_eq!(after.low_watermark, before.low_watermark);
        // the resumed epoch allocates up to the commit window
        assert_eq!(after.high_watermark, after.stop_at_seq_no);
        assert!(after.high_watermark > after.low_watermark);
        assert_eq!(after.epoch_tracker.current.number, 1);
        assert_eq!(
            after.epoch_tracker.current.state,
            crate::epoch::EpochTargetState::InProgress
        );

        // the restarted node keeps up with the rest
        assert!(sim.run_until(500_000, |s| all_committed(s, 20))?);
        Ok(())
    }

    #[test]
    fn silent_leader_replaced() -> Result<(), MirError> {
        let mut sim = Simulator::new(4, network_state(4), 10, 9)?;
        // wait for epoch 1, then cut node 1 off
        assert!(sim.run_until(100_000, |s| {
            s.nodes[0].machine.status().epoch_tracker.current.state
                == crate::epoch::EpochTargetState::InProgress
        })?);
        let mut steps = 0;
        let reached = loop {
            if (0..4).filter(|&id| id != 1).all(|id| sim.committed_requests(id) >= 20) {
                break true;
            }
            if steps >= 1_000_000 {
                break false;
            }
            steps += 1;
            match sim.queue.pop_front() {
                Some((1, _)) => {}
                Some((id, event)) => {
                    // drop everything node 1 sends
                    if matches!(event, StateEvent::Step { source: 1, .. }) {
                        continue;
                    }
                    let actions = sim.nodes[id as usize].machine.apply_event(event)?;
                    sim.process(id, actions)?;
                }
                None => sim.tick_all(),
            }
        };
        assert!(reached);
        assert!(sim.nodes[0].machine.status().epoch_tracker.current.number > 1);
        Ok(())
    }

    #[test]
    fn initialization_from_genesis() -> Result<(), MirError> {
        let mut sm = StateMachine::new();
        sm.apply_event(StateEvent::Initialize(Simulator::params(2)))?;
        for (i, r) in initial_log(network_state(1), Digest::from(vec![0]))
            .into_iter()
            .enumerate()
        {
            sm.apply_event(StateEvent::LoadEntry {
                index: i as u64,
                data: r,
            })?;
        }
        let actions = sm.apply_event(StateEvent::CompleteInitialization)?;
        assert_eq!(actions.commits().count(), 0);
        let status = sm.status();
        assert_eq!(status.low_watermark, 0);
        // epoch one is still being installed, nothing allocated yet
        assert_eq!(status.high_watermark, 0);
        assert_eq!(status.stop_at_seq_no, 10);
        assert_eq!(status.epoch_tracker.current.number, 1);
        assert!(status.to_string().contains("low 0 high 0 "));

        // acknowledging actions changes nothing
        assert!(sm.apply_event(StateEvent::ActionsReceived)?.is_empty());
        assert!(sm.apply_event(StateEvent::ClientActionsReceived)?.is_empty());
        assert_eq!(sm.status(), status);
        Ok(())
    }

    #[test]
    fn log_without_checkpoint_is_fatal() -> Result<(), MirError> {
        let mut sm = StateMachine::new();
        sm.apply_event(StateEvent::Initialize(Simulator::params(0)))?;
        let log = initial_log(network_state(1), Digest::from(vec![0]));
        sm.apply_event(StateEvent::LoadEntry {
            index: 0,
            data: log[1].clone(),
        })?;
        let err = sm.apply_event(StateEvent::CompleteInitialization).unwrap_err();
        assert!(err.is_fatal());
        Ok(())
    }

    #[test]
    fn events_out_of_order_are_fatal() -> Result<(), MirError> {
        let mut sm = StateMachine::new();
        assert!(sm.apply_event(StateEvent::Tick).unwrap_err().is_fatal());
        sm.apply_event(StateEvent::Initialize(Simulator::params(0)))?;
        assert!(sm
            .apply_event(StateEvent::Initialize(Simulator::params(0)))
            .unwrap_err()
            .is_fatal());
        let log = initial_log(network_state(1), Digest::from(vec![0]));
        sm.apply_event(StateEvent::LoadEntry {
            index: 4,
            data: log[0].clone(),
        })?;
        // indices must stay contiguous
        assert!(sm
            .apply_event(StateEvent::LoadEntry {
                index: 6,
                data: log[1].clone(),
            })
            .unwrap_err()
            .is_fatal());
        Ok(())
    }

    #[test]
    fn unrequested_transfer_is_fatal() -> Result<(), MirError> {
        let mut sim = Simulator::new(1, network_state(1), 0, 1)?;
        let c_entry = CEntry {
            seq_no: 5,
            checkpoint_value: Digest::from(vec![5]),
            network_state: network_state(1),
            epoch_config: None,
        };
        let err = sim.nodes[0]
            .machine
            .apply_event(StateEvent::Transfer(c_entry))
            .unwrap_err();
        assert!(err.is_fatal());
        Ok(())
    }

    fn checkpoint_vote(source: NodeId, seq_no: SeqNo, value: &Digest) -> StateEvent {
        StateEvent::Step {
            source,
            msg: Msg::Checkpoint(Checkpoint {
                seq_no,
                value: value.clone(),
            }),
        }
    }

    // Votes from nodes 1..=3 for a checkpoint past node 0's window, returning
    // the transfers node 0 requested.
    fn outvote(
        machine: &mut StateMachine,
        seq_no: SeqNo,
        value: &Digest,
    ) -> Result<Vec<SeqNo>, MirError> {
        let mut requested = Vec::new();
        for source in 1..4 {
            let actions = machine.apply_event(checkpoint_vote(source, seq_no, value))?;
            requested.extend(actions.iter().filter_map(|a| match a {
                Action::StateTransfer { seq_no, .. } => Some(*seq_no),
                _ => None,
            }));
        }
        Ok(requested)
    }

    fn transfer_entry(seq_no: SeqNo, value: &Digest) -> StateEvent {
        StateEvent::Transfer(CEntry {
            seq_no,
            checkpoint_value: value.clone(),
            network_state: network_state(1),
            epoch_config: None,
        })
    }

    #[test]
    fn mismatched_transfer_is_fatal() -> Result<(), MirError> {
        let mut sim = Simulator::new(1, network_state(1), 0, 1)?;
        let machine = &mut sim.nodes[0].machine;
        let value = Digest::from(vec![20]);
        assert_eq!(outvote(machine, 20, &value)?, vec![20]);
        assert!(machine.status().transferring);

        let err = machine.apply_event(transfer_entry(15, &value)).unwrap_err();
        assert!(err.is_fatal());
        Ok(())
    }

    #[test]
    fn transfer_keeps_earlier_records() -> Result<(), MirError> {
        let mut sim = Simulator::new(1, network_state(1), 0, 1)?;
        let machine = &mut sim.nodes[0].machine;
        let value = Digest::from(vec![20]);
        outvote(machine, 20, &value)?;
        let before = machine.status();

        machine.apply_event(transfer_entry(20, &value))?;
        let after = machine.status();
        assert!(!after.transferring);
        assert_eq!(after.low_watermark, 20);
        assert_eq!(after.stop_at_seq_no, 30);
        // the transferred checkpoint is appended, nothing is truncated
        assert_eq!(after.wal_head, before.wal_head);
        assert_eq!(after.wal_len, before.wal_len + 1);
        assert_eq!(after.epoch_tracker.current.number, 1);

        // a second completion has no request behind it
        let err = machine.apply_event(transfer_entry(20, &value)).unwrap_err();
        assert!(err.is_fatal());
        Ok(())
    }

    #[test]
    fn checkpoint_result_below_low_watermark_dropped() -> Result<(), MirError> {
        let mut sim = Simulator::new(1, network_state(1), 0, 1)?;
        let machine = &mut sim.nodes[0].machine;
        let value = Digest::from(vec![20]);
        outvote(machine, 20, &value)?;
        machine.apply_event(transfer_entry(20, &value))?;
        let status = machine.status();

        let result = |seq_no: SeqNo| {
            StateEvent::AddResults(ActionResults {
                checkpoints: vec![CheckpointResult {
                    seq_no,
                    value: Digest::from(vec![seq_no as u8]),
                    network_state: network_state(1),
                }],
                digests: vec![],
            })
        };
        // stale result computed before the transfer
        machine.apply_event(result(15))?;
        assert_eq!(machine.status(), status);

        // a result at the low watermark breaks the checkpoint cadence
        assert!(machine.apply_event(result(20)).unwrap_err().is_fatal());
        Ok(())
    }

    #[test]
    fn byzantine_input_absorbed() -> Result<(), MirError> {
        let mut sim = Simulator::new(1, network_state(1), 0, 1)?;
        let machine = &mut sim.nodes[0].machine;
        let acks = vec![RequestAck {
            client_id: 0,
            req_no: 0,
            digest: Digest::from(vec![7]),
        }];

        // forwarded batch whose content hashes to another digest
        let forged = StateEvent::AddResults(ActionResults {
            checkpoints: vec![],
            digests: vec![HashResult {
                digest: fake_hash(&batch_hash_data(&acks)),
                origin: HashOrigin::VerifyBatch {
                    source: 3,
                    seq_no: 4,
                    request_acks: acks.clone(),
                    expected_digest: Digest::from(vec![9]),
                },
            }],
        });
        let status = machine.status();
        machine.apply_event(forged)?;
        assert_eq!(machine.status(), status);

        // unsolicited forward is ignored without hashing
        let forward = StateEvent::Step {
            source: 3,
            msg: Msg::ForwardBatch {
                seq_no: 4,
                request_acks: acks,
                digest: Digest::from(vec![9]),
            },
        };
        let actions = machine.apply_event(forward)?;
        assert!(!actions.iter().any(|a| matches!(a, Action::Hash { .. })));

        // votes from an unknown node and conflicting votes are dropped
        let value = Digest::from(vec![20]);
        let status = machine.status();
        machine.apply_event(checkpoint_vote(9, 20, &value))?;
        assert_eq!(machine.status(), status);
        machine.apply_event(checkpoint_vote(1, 20, &value))?;
        let voted = machine.status();
        let conflicting = checkpoint_vote(1, 20, &Digest::from(vec![21]));
        machine.apply_event(conflicting)?;
        assert_eq!(machine.status(), voted);

        // processing continues: the honest quorum still triggers a transfer
        assert_eq!(outvote(machine, 20, &value)?, vec![20]);
        Ok(())
    }
}
