//! Client request tracking: per-client request windows, the list of requests
//! known correct, and dissemination of request acknowledgements.

mod disseminator;

pub use disseminator::{ClientHashDisseminator, ClientWindowStatus};

use crate::messages::{ClientState, NetworkState, RequestAck, SeqNo};

/// Client tracker module. Owns the client windows of the active checkpoint
/// and the list of requests known to be correct.
#[derive(Debug, Default)]
pub struct ClientTracker {
    client_states: Vec<ClientState>,

    /// Requests known correct, tagged with their position in the order they
    /// became so. Readers keep their own position cursor. Requests covered
    /// by a checkpoint are dropped when it is applied.
    available: Vec<(usize, RequestAck)>,

    /// Position the next available request gets. Never goes backwards.
    next_position: usize,
}

impl ClientTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resets to the given checkpointed state. The available list starts
    /// over; the disseminator re-fills it with retained requests.
    pub fn reinitialize(&mut self, network_state: &NetworkState) {
        self.client_states = network_state.clients.clone();
        self.available.clear();
    }

    /// Adopts the client windows of a new checkpoint, dropping available
    /// requests the checkpoint already covers.
    pub fn allocate(&mut self, seq_no: SeqNo, network_state: &NetworkState) {
        self.client_states = network_state.clients.clone();
        let before = self.available.len();
        let clients = &self.client_states;
        self.available.retain(|(_, ack)| {
            clients
                .iter()
                .find(|c| c.id == ack.client_id)
                .is_some_and(|c| !c.is_committed(ack.req_no))
        });
        pf_debug!(
            "client windows moved at checkpoint {}, {} available requests dropped",
            seq_no,
            before - self.available.len()
        );
    }

    /// Appends a request that became known correct.
    #[inline]
    pub fn add_available(&mut self, ack: RequestAck) {
        self.available.push((self.next_position, ack));
        self.next_position += 1;
    }

    /// Available requests at or after position `cursor`.
    pub fn available_since(
        &self,
        cursor: usize,
    ) -> impl Iterator<Item = &RequestAck> + '_ {
        let start = self.available.partition_point(|(pos, _)| *pos < cursor);
        self.available[start..].iter().map(|(_, ack)| ack)
    }

    /// Position just past the last available request; a reader that has
    /// consumed everything sets its cursor here.
    #[inline]
    pub fn available_end(&self) -> usize {
        self.next_position
    }

    #[cfg(test)]
    fn available_len(&self) -> usize {
        self.available.len()
    }
}
