//! Per-node byte-bounded buffers of messages that cannot be applied yet.

use std::collections::{BTreeMap, VecDeque};

use get_size::GetSize;

use crate::messages::{Msg, NodeId};

#[derive(Debug, Default)]
struct NodeBuffer {
    msgs: VecDeque<Msg>,
    total_size: usize,
}

/// Message buffers keyed by source node. Each node may hold at most
/// `capacity` bytes; the oldest messages are dropped beyond that.
#[derive(Debug)]
pub struct MsgBuffers {
    capacity: usize,
    buffers: BTreeMap<NodeId, NodeBuffer>,
}

impl MsgBuffers {
    pub fn new(capacity: usize) -> Self {
        MsgBuffers {
            capacity,
            buffers: BTreeMap::new(),
        }
    }

    pub fn store(&mut self, source: NodeId, msg: Msg) {
        let size = msg.get_size();
        let buffer = self.buffers.entry(source).or_default();
        buffer.total_size += size;
        buffer.msgs.push_back(msg);
        while buffer.total_size > self.capacity {
            let Some(old) = buffer.msgs.pop_front() else {
                break;
            };
            buffer.total_size -= old.get_size();
            pf_warn!(
                "buffer of node {} full, dropped a {} message",
                source,
                old.kind()
            );
        }
    }

    /// Removes and returns every buffered message `select` accepts, node by
    /// node in arrival order. Messages `discard` accepts are dropped.
    pub fn drain_where(
        &mut self,
        select: impl Fn(&Msg) -> bool,
        discard: impl Fn(&Msg) -> bool,
    ) -> Vec<(NodeId, Msg)> {
        let mut out = vec![];
        for (&source, buffer) in self.buffers.iter_mut() {
            let mut kept = VecDeque::with_capacity(buffer.msgs.len());
            for msg in buffer.msgs.drain(..) {
                if select(&msg) {
                    buffer.total_size -= msg.get_size();
                    out.push((source, msg));
                } else if discard(&msg) {
                    buffer.total_size -= msg.get_size();
                } else {
                    kept.push_back(msg);
                }
            }
            buffer.msgs = kept;
        }
        self.buffers.retain(|_, b| !b.msgs.is_empty());
        out
    }

    /// Number of buffered messages across nodes.
    pub fn len(&self) -> usize {
        self.buffers.values().map(|b| b.msgs.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod buffer_tests {
    use super::*;
    use crate::messages::Suspect;

    fn suspect(epoch: u64) -> Msg {
        Msg::Suspect(Suspect { epoch })
    }

    #[test]
    fn bounded_per_node() {
        let size = suspect(1).get_size();
        let mut bufs = MsgBuffers::new(size * 2);
        for e in 1..=3 {
            bufs.store(1, suspect(e));
        }
        bufs.store(2, suspect(9));
        assert_eq!(bufs.len(), 3);
        // oldest dropped from node 1 only
        let got = bufs.drain_where(|m| m.epoch() == Some(1), |_| false);
        assert!(got.is_empty());
        let got = bufs.drain_where(|m| m.epoch() == Some(2), |_| false);
        assert_eq!(got, vec![(1, suspect(2))]);
    }

    #[test]
    fn drain_and_discard() {
        let mut bufs = MsgBuffers::new(1 << 20);
        bufs.store(3, suspect(4));
        bufs.store(1, suspect(5));
        bufs.store(1, suspect(2));
        let got = bufs.drain_where(
            |m| m.epoch() == Some(4) || m.epoch() == Some(5),
            |m| m.epoch() < Some(4),
        );
        assert_eq!(got, vec![(1, suspect(5)), (3, suspect(4))]);
        assert!(bufs.is_empty());
    }
}
