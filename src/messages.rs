//! Data model shared by every component: identifiers, network state,
//! peer-peer protocol messages, and write-ahead log records.

use std::fmt;

use bytes::Bytes;

use get_size::GetSize;

use serde::{Deserialize, Serialize};

/// Node identifier type.
pub type NodeId = u64;

/// Client identifier type.
pub type ClientId = u64;

/// Per-client request number type.
pub type ReqNo = u64;

/// Ordering slot (sequence number) type.
pub type SeqNo = u64;

/// Epoch number type.
pub type EpochNo = u64;

/// Bucket identifier type.
pub type BucketId = u64;

/// Opaque hash value produced by the external hasher. An empty digest marks
/// a null batch.
#[derive(
    Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Digest(Bytes);

impl Digest {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Digest(bytes.into())
    }

    /// The null digest.
    pub fn empty() -> Self {
        Digest(Bytes::new())
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Cheap handle on the underlying buffer, used as hash request input.
    #[inline]
    pub fn to_bytes(&self) -> Bytes {
        self.0.clone()
    }
}

impl From<&[u8]> for Digest {
    fn from(b: &[u8]) -> Self {
        Digest(Bytes::copy_from_slice(b))
    }
}

impl From<Vec<u8>> for Digest {
    fn from(b: Vec<u8>) -> Self {
        Digest(Bytes::from(b))
    }
}

impl GetSize for Digest {
    fn get_heap_size(&self) -> usize {
        self.0.len()
    }
}

// Print at most a short hex prefix, digests are long and unreadable anyway.
impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.0.is_empty() {
            return write!(f, "<null>");
        }
        for b in self.0.iter().take(4) {
            write!(f, "{:02x}", b)?;
        }
        if self.0.len() > 4 {
            write!(f, "..")?;
        }
        Ok(())
    }
}

/// Static configuration of the network, replaced only by reconfiguration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, GetSize)]
pub struct NetworkConfig {
    /// Member node IDs; a node's position in this list is its vote index.
    pub nodes: Vec<NodeId>,

    /// Number of sequences between two checkpoints.
    pub checkpoint_interval: u64,

    /// Number of sequences an epoch is planned to last.
    pub max_epoch_length: u64,

    /// Number of buckets partitioning the request and sequence spaces.
    pub number_of_buckets: u64,
}

impl NetworkConfig {
    /// Maximum number of tolerated Byzantine nodes.
    #[inline]
    pub fn f(&self) -> usize {
        self.nodes.len().saturating_sub(1) / 3
    }

    /// Smallest vote count strictly greater than two-thirds of the nodes.
    #[inline]
    pub fn strong_quorum(&self) -> usize {
        2 * self.nodes.len() / 3 + 1
    }

    /// Smallest vote count guaranteed to include one correct node.
    #[inline]
    pub fn weak_quorum(&self) -> usize {
        self.f() + 1
    }

    /// Position of a node in the configured node list.
    #[inline]
    pub fn node_index(&self, id: NodeId) -> Option<usize> {
        self.nodes.iter().position(|&n| n == id)
    }

    #[inline]
    pub fn seq_to_bucket(&self, seq_no: SeqNo) -> BucketId {
        seq_no % self.number_of_buckets.max(1)
    }

    #[inline]
    pub fn client_req_to_bucket(
        &self,
        client_id: ClientId,
        req_no: ReqNo,
    ) -> BucketId {
        client_id.wrapping_add(req_no) % self.number_of_buckets.max(1)
    }

    /// Node expected to assemble the `NewEpoch` message of an epoch.
    #[inline]
    pub fn epoch_primary(&self, epoch: EpochNo) -> NodeId {
        self.nodes[(epoch % self.nodes.len() as u64) as usize]
    }
}

/// Per-client request window as recorded in a checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, GetSize)]
pub struct ClientState {
    pub id: ClientId,

    /// Number of request numbers the client may have in flight.
    pub width: u64,

    /// First request number not yet known committed.
    pub low_watermark: ReqNo,

    /// Sorted request numbers above the low watermark already committed.
    pub committed: Vec<ReqNo>,
}

impl ClientState {
    pub fn new(id: ClientId, width: u64) -> Self {
        ClientState {
            id,
            width,
            low_watermark: 0,
            committed: vec![],
        }
    }

    #[inline]
    pub fn is_committed(&self, req_no: ReqNo) -> bool {
        req_no < self.low_watermark
            || self.committed.binary_search(&req_no).is_ok()
    }

    /// Highest request number (inclusive) inside the client window.
    #[inline]
    pub fn high_watermark(&self) -> ReqNo {
        self.low_watermark + self.width.saturating_sub(1)
    }

    #[inline]
    pub fn in_window(&self, req_no: ReqNo) -> bool {
        req_no >= self.low_watermark && req_no <= self.high_watermark()
    }
}

/// Configuration change requested by the application at a checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, GetSize)]
pub enum Reconfiguration {
    NewClient { id: ClientId, width: u64 },
    RemoveClient { id: ClientId },
    NewConfig(NetworkConfig),
}

/// Full replicated configuration at a checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, GetSize)]
pub struct NetworkState {
    pub config: NetworkConfig,
    pub clients: Vec<ClientState>,
    pub pending_reconfigurations: Vec<Reconfiguration>,
}

impl NetworkState {
    /// Network state of a freshly bootstrapped network: every client
    /// starts at request number zero.
    pub fn new(config: NetworkConfig, client_ids: &[ClientId], width: u64) -> Self {
        NetworkState {
            config,
            clients: client_ids
                .iter()
                .map(|&id| ClientState::new(id, width))
                .collect(),
            pending_reconfigurations: vec![],
        }
    }

    #[inline]
    pub fn client(&self, id: ClientId) -> Option<&ClientState> {
        self.clients.iter().find(|c| c.id == id)
    }
}

/// Attestation that a client request with the given digest exists.
#[derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    GetSize,
)]
pub struct RequestAck {
    pub client_id: ClientId,
    pub req_no: ReqNo,
    pub digest: Digest,
}

/// Leader assignment of an epoch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, GetSize)]
pub struct EpochConfig {
    pub number: EpochNo,
    pub leaders: Vec<NodeId>,

    /// Last sequence this epoch is allowed to order.
    pub planned_expiration: SeqNo,
}

#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, GetSize,
)]
pub struct Checkpoint {
    pub seq_no: SeqNo,
    pub value: Digest,
}

/// Entry of the prepared set or the queued set of an epoch change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, GetSize)]
pub struct SetEntry {
    pub epoch: EpochNo,
    pub seq_no: SeqNo,
    pub digest: Digest,
}

/// Summary of a node's log handed to the next epoch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, GetSize)]
pub struct EpochChange {
    pub new_epoch: EpochNo,
    pub checkpoints: Vec<Checkpoint>,
    pub p_set: Vec<SetEntry>,
    pub q_set: Vec<SetEntry>,
}

/// Reference to an acknowledged epoch change by its origin and digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, GetSize)]
pub struct RemoteEpochChange {
    pub node_id: NodeId,
    pub digest: Digest,
}

/// Replayable starting state of a new epoch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, GetSize)]
pub struct NewEpochConfig {
    pub config: EpochConfig,
    pub starting_checkpoint: Checkpoint,

    /// Digests certified for the sequences right after the starting
    /// checkpoint; an empty digest is a null batch.
    pub final_preprepares: Vec<Digest>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, GetSize)]
pub struct NewEpoch {
    pub new_config: NewEpochConfig,
    pub epoch_changes: Vec<RemoteEpochChange>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, GetSize)]
pub struct Preprepare {
    pub seq_no: SeqNo,
    pub epoch: EpochNo,
    pub batch: Vec<RequestAck>,
}

/// Prepare or Commit vote on a batch digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, GetSize)]
pub struct Vote {
    pub seq_no: SeqNo,
    pub epoch: EpochNo,
    pub digest: Digest,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, GetSize)]
pub struct Suspect {
    pub epoch: EpochNo,
}

/// Peer-peer message type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, GetSize)]
pub enum Msg {
    Preprepare(Preprepare),
    Prepare(Vote),
    Commit(Vote),
    Checkpoint(Checkpoint),
    Suspect(Suspect),
    EpochChange(EpochChange),
    EpochChangeAck {
        originator: NodeId,
        epoch_change: EpochChange,
    },
    NewEpoch(NewEpoch),
    NewEpochEcho(NewEpochConfig),
    NewEpochReady(NewEpochConfig),
    FetchBatch {
        seq_no: SeqNo,
        digest: Digest,
    },
    ForwardBatch {
        seq_no: SeqNo,
        request_acks: Vec<RequestAck>,
        digest: Digest,
    },
    FetchRequest(RequestAck),
    ForwardRequest {
        request_ack: RequestAck,
        request_data: Vec<u8>,
    },
    RequestAck(RequestAck),
}

impl Msg {
    /// Short name of the message kind for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Msg::Preprepare(_) => "Preprepare",
            Msg::Prepare(_) => "Prepare",
            Msg::Commit(_) => "Commit",
            Msg::Checkpoint(_) => "Checkpoint",
            Msg::Suspect(_) => "Suspect",
            Msg::EpochChange(_) => "EpochChange",
            Msg::EpochChangeAck { .. } => "EpochChangeAck",
            Msg::NewEpoch(_) => "NewEpoch",
            Msg::NewEpochEcho(_) => "NewEpochEcho",
            Msg::NewEpochReady(_) => "NewEpochReady",
            Msg::FetchBatch { .. } => "FetchBatch",
            Msg::ForwardBatch { .. } => "ForwardBatch",
            Msg::FetchRequest(_) => "FetchRequest",
            Msg::ForwardRequest { .. } => "ForwardRequest",
            Msg::RequestAck(_) => "RequestAck",
        }
    }

    /// Epoch number carried by epoch-scoped messages.
    pub fn epoch(&self) -> Option<EpochNo> {
        match self {
            Msg::Preprepare(pp) => Some(pp.epoch),
            Msg::Prepare(v) | Msg::Commit(v) => Some(v.epoch),
            Msg::Suspect(s) => Some(s.epoch),
            Msg::EpochChange(ec) => Some(ec.new_epoch),
            Msg::EpochChangeAck { epoch_change, .. } => {
                Some(epoch_change.new_epoch)
            }
            Msg::NewEpoch(ne) => Some(ne.new_config.config.number),
            Msg::NewEpochEcho(c) | Msg::NewEpochReady(c) => {
                Some(c.config.number)
            }
            _ => None,
        }
    }
}

/// Prepare certificate record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, GetSize)]
pub struct PEntry {
    pub seq_no: SeqNo,
    pub digest: Digest,
}

/// Queued (preprepared) batch record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, GetSize)]
pub struct QEntry {
    pub seq_no: SeqNo,
    pub digest: Digest,
    pub requests: Vec<RequestAck>,
}

/// Checkpoint record. `epoch_config` is the epoch active when the
/// checkpoint was taken, if any.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, GetSize)]
pub struct CEntry {
    pub seq_no: SeqNo,
    pub checkpoint_value: Digest,
    pub network_state: NetworkState,
    pub epoch_config: Option<EpochConfig>,
}

/// New epoch start record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, GetSize)]
pub struct NEntry {
    pub seq_no: SeqNo,
    pub epoch_config: EpochConfig,
}

/// Epoch end record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, GetSize)]
pub struct FEntry {
    pub ends_epoch_config: EpochConfig,
}

/// Epoch change sent record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, GetSize)]
pub struct ECEntry {
    pub epoch_number: EpochNo,
}

/// State transfer started record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, GetSize)]
pub struct TEntry {
    pub seq_no: SeqNo,
    pub value: Digest,
}

/// Stable storage WAL record type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, GetSize)]
pub enum Persistent {
    PEntry(PEntry),
    QEntry(QEntry),
    CEntry(CEntry),
    NEntry(NEntry),
    FEntry(FEntry),
    ECEntry(ECEntry),
    TEntry(TEntry),
    Suspect(Suspect),
}
