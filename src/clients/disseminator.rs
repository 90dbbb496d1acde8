//! Client hash disseminator: exchanges request acknowledgements with peers
//! and decides when a request is known correct.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use super::ClientTracker;

use crate::actions::{Action, ActionList, HashOrigin};
use crate::events::InitialParameters;
use crate::messages::{
    ClientId, ClientState, Digest, Msg, NetworkConfig, NetworkState, NodeId,
    ReqNo, RequestAck, SeqNo,
};
use crate::utils::MirError;

/// One digest proposed for a client request number.
#[derive(Debug, Clone)]
struct ClientRequest {
    ack: RequestAck,

    /// Nodes that acknowledged this digest.
    agreements: BTreeSet<NodeId>,

    /// The local request store holds the payload.
    stored: bool,

    /// A fetch of the payload is in flight.
    fetching: bool,
}

/// Everything known about one request number of a client.
#[derive(Debug, Clone, Default)]
struct ClientReqNo {
    digests: BTreeMap<Digest, ClientRequest>,

    /// Node -> digest it acknowledged, to spot equivocation.
    acked_by: BTreeMap<NodeId, Digest>,

    /// Digest declared correct, if any.
    correct: Option<Digest>,
}

impl ClientReqNo {
    fn request(&mut self, ack: &RequestAck) -> &mut ClientRequest {
        self.digests
            .entry(ack.digest.clone())
            .or_insert_with(|| ClientRequest {
                ack: ack.clone(),
                agreements: BTreeSet::new(),
                stored: false,
                fetching: false,
            })
    }
}

#[derive(Debug, Clone)]
struct ClientRequests {
    state: ClientState,
    reqs: BTreeMap<ReqNo, ClientReqNo>,
}

/// Observability snapshot of one client window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientWindowStatus {
    pub client_id: ClientId,
    pub low_watermark: ReqNo,
    pub high_watermark: ReqNo,

    /// Per request number in the window: 0 unknown, 1 acked, 2 correct,
    /// 3 stored locally.
    pub allocated: Vec<u8>,
}

/// Client hash disseminator module.
#[derive(Debug)]
pub struct ClientHashDisseminator {
    /// My node ID.
    my_id: NodeId,

    heartbeat_ticks: u32,

    ticks: u32,

    network_config: NetworkConfig,

    clients: BTreeMap<ClientId, ClientRequests>,
}

impl ClientHashDisseminator {
    pub fn new(params: &InitialParameters, network_config: NetworkConfig) -> Self {
        ClientHashDisseminator {
            my_id: params.id,
            heartbeat_ticks: params.heartbeat_ticks.max(1),
            ticks: 0,
            network_config,
            clients: BTreeMap::new(),
        }
    }

    /// Rebuilds the client windows from a checkpointed state. Acks still
    /// inside a window are retained and correct requests are made available
    /// again.
    pub fn reinitialize(
        &mut self,
        low_watermark: SeqNo,
        network_state: &NetworkState,
        tracker: &mut ClientTracker,
    ) -> ActionList {
        pf_debug!(
            "reinitializing client windows at checkpoint {}",
            low_watermark
        );
        self.network_config = network_state.config.clone();
        let mut old = std::mem::take(&mut self.clients);
        let mut actions = ActionList::new();

        for state in &network_state.clients {
            let mut reqs = old
                .remove(&state.id)
                .map(|c| c.reqs)
                .unwrap_or_default();
            reqs.retain(|&r, _| state.in_window(r) && !state.is_committed(r));

            for req_no in state.low_watermark..=state.high_watermark() {
                if state.is_committed(req_no) {
                    continue;
                }
                match reqs.get(&req_no) {
                    Some(crn) => {
                        if let Some(req) =
                            crn.correct.as_ref().and_then(|d| crn.digests.get(d))
                        {
                            tracker.add_available(req.ack.clone());
                        }
                    }
                    None => {
                        actions.push(Action::AllocatedRequest {
                            client_id: state.id,
                            req_no,
                        });
                    }
                }
            }

            self.clients.insert(
                state.id,
                ClientRequests {
                    state: state.clone(),
                    reqs,
                },
            );
        }
        actions
    }

    /// Slides client windows forward to a new checkpoint, announcing newly
    /// allocated request numbers.
    pub fn allocate(
        &mut self,
        seq_no: SeqNo,
        network_state: &NetworkState,
    ) -> ActionList {
        pf_debug!("sliding client windows at checkpoint {}", seq_no);
        self.network_config = network_state.config.clone();
        let mut actions = ActionList::new();
        let mut old = std::mem::take(&mut self.clients);

        for state in &network_state.clients {
            let (first_new, mut reqs) = match old.remove(&state.id) {
                Some(c) => (c.state.high_watermark() + 1, c.reqs),
                None => (state.low_watermark, BTreeMap::new()),
            };
            reqs.retain(|&r, _| state.in_window(r) && !state.is_committed(r));
            for req_no in first_new.max(state.low_watermark)..=state.high_watermark() {
                if !state.is_committed(req_no) {
                    actions.push(Action::AllocatedRequest {
                        client_id: state.id,
                        req_no,
                    });
                }
            }
            self.clients.insert(
                state.id,
                ClientRequests {
                    state: state.clone(),
                    reqs,
                },
            );
        }
        actions
    }

    /// Requests the local store has durably persisted. Each is acknowledged
    /// to every node.
    pub fn apply_new_requests(&mut self, acks: &[RequestAck]) -> ActionList {
        let mut actions = ActionList::new();
        for ack in acks {
            let Some(client) = self.clients.get_mut(&ack.client_id) else {
                pf_debug!("ignoring persisted request of unknown client {}", ack.client_id);
                continue;
            };
            if !client.state.in_window(ack.req_no)
                || client.state.is_committed(ack.req_no)
            {
                continue; // stale
            }
            let crn = client.reqs.entry(ack.req_no).or_default();
            let req = crn.request(ack);
            if req.stored {
                continue; // idempotent
            }
            req.stored = true;
            req.fetching = false;
            actions.send(&self.network_config.nodes, Msg::RequestAck(ack.clone()));
        }
        actions
    }

    /// Handler of RequestAck, FetchRequest, and ForwardRequest messages.
    pub fn step(
        &mut self,
        source: NodeId,
        msg: &Msg,
        tracker: &mut ClientTracker,
    ) -> Result<ActionList, MirError> {
        match msg {
            Msg::RequestAck(ack) => self.apply_request_ack(source, ack, tracker),
            Msg::FetchRequest(ack) => {
                let mut actions = ActionList::new();
                if self.lookup(ack).is_some_and(|r| r.stored) {
                    actions.push(Action::ForwardRequest {
                        targets: vec![source],
                        request_ack: ack.clone(),
                    });
                }
                Ok(actions)
            }
            Msg::ForwardRequest {
                request_ack,
                request_data,
            } => {
                let mut actions = ActionList::new();
                if self
                    .lookup(request_ack)
                    .is_some_and(|r| r.fetching && !r.stored)
                {
                    actions.hash(
                        vec![request_data.clone()],
                        HashOrigin::VerifyRequest {
                            source,
                            request_ack: request_ack.clone(),
                            request_data: request_data.clone(),
                        },
                    );
                }
                Ok(actions)
            }
            _ => fatal_err!("disseminator stepped with {}", msg.kind()),
        }
    }

    fn lookup(&self, ack: &RequestAck) -> Option<&ClientRequest> {
        self.clients
            .get(&ack.client_id)?
            .reqs
            .get(&ack.req_no)?
            .digests
            .get(&ack.digest)
    }

    fn apply_request_ack(
        &mut self,
        source: NodeId,
        ack: &RequestAck,
        tracker: &mut ClientTracker,
    ) -> Result<ActionList, MirError> {
        let mut actions = ActionList::new();
        if self.network_config.node_index(source).is_none() {
            return byzantine_err!("request ack from unknown node {}", source);
        }
        let Some(client) = self.clients.get_mut(&ack.client_id) else {
            return Ok(actions); // client not (yet) known
        };
        if !client.state.in_window(ack.req_no)
            || client.state.is_committed(ack.req_no)
        {
            return Ok(actions); // outside window
        }

        let crn = client.reqs.entry(ack.req_no).or_default();
        if let Some(prev) = crn.acked_by.get(&source) {
            if *prev != ack.digest {
                return byzantine_err!(
                    "node {} acked two digests for client {} req {}",
                    source,
                    ack.client_id,
                    ack.req_no
                );
            }
            return Ok(actions); // duplicate
        }
        crn.acked_by.insert(source, ack.digest.clone());

        let weak = self.network_config.weak_quorum();
        let already_correct = crn.correct.is_some();
        let req = crn.request(ack);
        req.agreements.insert(source);
        if already_correct || req.agreements.len() < weak {
            return Ok(actions);
        }

        // enough nodes vouch for it, at least one of them correct
        pf_trace!(
            "request client {} req {} became correct",
            ack.client_id,
            ack.req_no
        );
        let need_fetch = !req.stored && !req.fetching;
        if need_fetch {
            req.fetching = true;
        }
        let holders: Vec<NodeId> = req
            .agreements
            .iter()
            .copied()
            .filter(|&n| n != self.my_id)
            .collect();
        crn.correct = Some(ack.digest.clone());

        tracker.add_available(ack.clone());
        actions.push(Action::CorrectRequest(ack.clone()));
        if need_fetch && !holders.is_empty() {
            actions.send(&holders, Msg::FetchRequest(ack.clone()));
        }
        Ok(actions)
    }

    /// Accepts a fetched request payload once its digest checks out.
    pub fn apply_verify_request_hash_result(
        &mut self,
        digest: &Digest,
        source: NodeId,
        request_ack: &RequestAck,
        request_data: &[u8],
    ) -> Result<ActionList, MirError> {
        if *digest != request_ack.digest {
            return byzantine_err!(
                "node {} forwarded client {} req {} with wrong payload",
                source,
                request_ack.client_id,
                request_ack.req_no
            );
        }
        let mut actions = ActionList::new();
        let Some(client) = self.clients.get_mut(&request_ack.client_id) else {
            return Ok(actions);
        };
        let Some(req) = client
            .reqs
            .get_mut(&request_ack.req_no)
            .and_then(|crn| crn.digests.get_mut(&request_ack.digest))
        else {
            return Ok(actions);
        };
        if req.stored || !req.fetching {
            return Ok(actions); // satisfied by an earlier forward
        }
        req.fetching = false;
        actions.push(Action::StoreRequest {
            request_ack: request_ack.clone(),
            request_data: request_data.to_vec(),
        });
        Ok(actions)
    }

    /// Rebroadcasts acks of locally stored requests that have not yet been
    /// acknowledged by a strong quorum, once every heartbeat.
    pub fn tick(&mut self) -> ActionList {
        let mut actions = ActionList::new();
        self.ticks += 1;
        if self.ticks % self.heartbeat_ticks != 0 {
            return actions;
        }
        let strong = self.network_config.strong_quorum();
        for client in self.clients.values() {
            for crn in client.reqs.values() {
                for req in crn.digests.values() {
                    if req.stored && req.agreements.len() < strong {
                        actions.send(
                            &self.network_config.nodes,
                            Msg::RequestAck(req.ack.clone()),
                        );
                    }
                }
            }
        }
        actions
    }

    pub fn status(&self) -> Vec<ClientWindowStatus> {
        self.clients
            .values()
            .map(|c| ClientWindowStatus {
                client_id: c.state.id,
                low_watermark: c.state.low_watermark,
                high_watermark: c.state.high_watermark(),
                allocated: (c.state.low_watermark..=c.state.high_watermark())
                    .map(|r| match c.reqs.get(&r) {
                        None => 0,
                        Some(crn) => {
                            if crn.digests.values().any(|d| d.stored) {
                                3
                            } else if crn.correct.is_some() {
                                2
                            } else {
                                1
                            }
                        }
                    })
                    .collect(),
            })
            .collect()
    }
}

#[cfg(test)]
mod disseminator_tests {
    use super::*;

    fn network_state() -> NetworkState {
        NetworkState::new(
            NetworkConfig {
                nodes: vec![0, 1, 2, 3],
                checkpoint_interval: 5,
                max_epoch_length: 10,
                number_of_buckets: 1,
            },
            &[9],
            3,
        )
    }

    fn setup() -> (ClientHashDisseminator, ClientTracker, ActionList) {
        let ns = network_state();
        let params = InitialParameters {
            id: 0,
            ..Default::default()
        };
        let mut tracker = ClientTracker::new();
        tracker.reinitialize(&ns);
        let mut chd = ClientHashDisseminator::new(&params, ns.config.clone());
        let actions = chd.reinitialize(0, &ns, &mut tracker);
        (chd, tracker, actions)
    }

    fn ack(req_no: ReqNo, d: u8) -> RequestAck {
        RequestAck {
            client_id: 9,
            req_no,
            digest: Digest::from(vec![d]),
        }
    }

    #[test]
    fn reinit_allocates_window() {
        let (_, _, actions) = setup();
        let allocated: Vec<_> = actions
            .iter()
            .filter_map(|a| match a {
                Action::AllocatedRequest { client_id, req_no } => {
                    Some((*client_id, *req_no))
                }
                _ => None,
            })
            .collect();
        assert_eq!(allocated, vec![(9, 0), (9, 1), (9, 2)]);
    }

    #[test]
    fn weak_quorum_makes_correct_once() -> Result<(), MirError> {
        let (mut chd, mut tracker, _) = setup();
        let a = ack(0, 7);
        assert!(chd.step(1, &Msg::RequestAck(a.clone()), &mut tracker)?.is_empty());
        let actions = chd.step(2, &Msg::RequestAck(a.clone()), &mut tracker)?;
        assert_eq!(tracker.available_len(), 1);
        assert!(actions
            .iter()
            .any(|x| matches!(x, Action::CorrectRequest(r) if *r == a)));
        // not stored locally, fetch from the acking nodes
        assert!(actions.iter().any(|x| matches!(
            x,
            Action::Send { targets, msg: Msg::FetchRequest(_) } if targets == &vec![1, 2]
        )));
        // further acks never re-add
        chd.step(3, &Msg::RequestAck(a.clone()), &mut tracker)?;
        chd.step(2, &Msg::RequestAck(a), &mut tracker)?;
        assert_eq!(tracker.available_len(), 1);
        Ok(())
    }

    #[test]
    fn equivocating_ack_rejected() -> Result<(), MirError> {
        let (mut chd, mut tracker, _) = setup();
        chd.step(1, &Msg::RequestAck(ack(1, 1)), &mut tracker)?;
        let err = chd
            .step(1, &Msg::RequestAck(ack(1, 2)), &mut tracker)
            .unwrap_err();
        assert!(err.is_byzantine());
        Ok(())
    }

    #[test]
    fn out_of_window_ignored() -> Result<(), MirError> {
        let (mut chd, mut tracker, _) = setup();
        for src in 0..4 {
            chd.step(src, &Msg::RequestAck(ack(3, 1)), &mut tracker)?;
        }
        assert_eq!(tracker.available_len(), 0);
        Ok(())
    }

    #[test]
    fn stored_request_acked_and_forwarded() -> Result<(), MirError> {
        let (mut chd, mut tracker, _) = setup();
        let a = ack(0, 5);
        let actions = chd.apply_new_requests(&[a.clone()]);
        assert!(matches!(
            actions.as_slice(),
            [Action::Send { msg: Msg::RequestAck(_), .. }]
        ));
        assert!(chd.apply_new_requests(&[a.clone()]).is_empty());

        let actions = chd.step(3, &Msg::FetchRequest(a.clone()), &mut tracker)?;
        assert_eq!(
            actions.as_slice(),
            &[Action::ForwardRequest {
                targets: vec![3],
                request_ack: a.clone()
            }]
        );
        // my own ack plus one more, stored so no fetch
        chd.step(0, &Msg::RequestAck(a.clone()), &mut tracker)?;
        let actions = chd.step(1, &Msg::RequestAck(a), &mut tracker)?;
        assert!(!actions
            .iter()
            .any(|x| matches!(x, Action::Send { msg: Msg::FetchRequest(_), .. })));
        Ok(())
    }

    #[test]
    fn fetched_request_verified() -> Result<(), MirError> {
        let (mut chd, mut tracker, _) = setup();
        let a = ack(2, 8);
        chd.step(1, &Msg::RequestAck(a.clone()), &mut tracker)?;
        chd.step(2, &Msg::RequestAck(a.clone()), &mut tracker)?;
        let fwd = Msg::ForwardRequest {
            request_ack: a.clone(),
            request_data: vec![1, 2, 3],
        };
        let actions = chd.step(1, &fwd, &mut tracker)?;
        assert!(matches!(
            actions.as_slice(),
            [Action::Hash { origin: HashOrigin::VerifyRequest { .. }, .. }]
        ));
        let err = chd
            .apply_verify_request_hash_result(&Digest::from(vec![0]), 1, &a, &[1, 2, 3])
            .unwrap_err();
        assert!(err.is_byzantine());
        let actions =
            chd.apply_verify_request_hash_result(&a.digest, 1, &a, &[1, 2, 3])?;
        assert!(matches!(actions.as_slice(), [Action::StoreRequest { .. }]));
        // second forward is a no-op
        assert!(chd
            .apply_verify_request_hash_result(&a.digest, 2, &a, &[1, 2, 3])?
            .is_empty());
        Ok(())
    }

    #[test]
    fn reinit_keeps_correct_requests_available() -> Result<(), MirError> {
        let (mut chd, mut tracker, _) = setup();
        let a = ack(0, 7);
        chd.step(1, &Msg::RequestAck(a.clone()), &mut tracker)?;
        chd.step(2, &Msg::RequestAck(a.clone()), &mut tracker)?;
        chd.step(1, &Msg::RequestAck(ack(1, 8)), &mut tracker)?;

        let ns = network_state();
        tracker.reinitialize(&ns);
        let actions = chd.reinitialize(5, &ns, &mut tracker);
        // only the request that reached a weak quorum comes back
        assert_eq!(tracker.available_since(0).collect::<Vec<_>>(), vec![&a]);
        let reallocated: Vec<_> = actions
            .iter()
            .filter_map(|x| match x {
                Action::AllocatedRequest { req_no, .. } => Some(*req_no),
                _ => None,
            })
            .collect();
        assert_eq!(reallocated, vec![2]);
        Ok(())
    }

    #[test]
    fn allocate_slides_window() {
        let (mut chd, _, _) = setup();
        let mut ns = network_state();
        ns.clients[0].low_watermark = 2;
        let actions = chd.allocate(5, &ns);
        let new: Vec<_> = actions
            .iter()
            .filter_map(|a| match a {
                Action::AllocatedRequest { req_no, .. } => Some(*req_no),
                _ => None,
            })
            .collect();
        assert_eq!(new, vec![3, 4]);
        assert_eq!(chd.status()[0].low_watermark, 2);
        assert_eq!(chd.status()[0].allocated.len(), 3);
    }

    #[test]
    fn tick_rebroadcasts_unconfirmed() {
        let (mut chd, _, _) = setup();
        chd.apply_new_requests(&[ack(0, 5)]);
        assert!(chd.tick().is_empty());
        let actions = chd.tick();
        assert_eq!(actions.len(), 1);
    }
}
