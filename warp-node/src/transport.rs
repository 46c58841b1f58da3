//! The transport seam.
//!
//! The core only needs `send(dst, bytes)` plus delivery of inbound
//! bytes, FIFO per (source, destination) pair. The loopback
//! implementation here is the harness used by the demo runner and the
//! integration tests: every node's inbox is one queue, so per-source
//! order is trivially preserved, and the fleet drains inboxes
//! deterministically.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use warp_object::ident::NodeId;

/// Outbound byte transport between nodes.
pub trait Transport: Send + Sync {
    /// Queue `bytes` for delivery to `dst` (or everyone on BROADCAST).
    fn send(&self, src: NodeId, dst: NodeId, bytes: Vec<u8>);
}

/// In-memory transport connecting the nodes of one fleet.
#[derive(Default)]
pub struct LoopbackTransport {
    inboxes: Mutex<HashMap<NodeId, VecDeque<(NodeId, Vec<u8>)>>>,
}

impl LoopbackTransport {
    /// An empty fleet wire.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node's inbox.
    pub fn register(&self, nid: NodeId) {
        self.inboxes.lock().unwrap().entry(nid).or_default();
    }

    /// Take every queued delivery for `nid`, in arrival order.
    pub fn drain(&self, nid: NodeId) -> Vec<(NodeId, Vec<u8>)> {
        self.inboxes
            .lock()
            .unwrap()
            .get_mut(&nid)
            .map(|q| q.drain(..).collect())
            .unwrap_or_default()
    }

    /// Total queued deliveries across the fleet.
    pub fn pending(&self) -> usize {
        self.inboxes.lock().unwrap().values().map(|q| q.len()).sum()
    }
}

impl Transport for LoopbackTransport {
    fn send(&self, src: NodeId, dst: NodeId, bytes: Vec<u8>) {
        let mut inboxes = self.inboxes.lock().unwrap();
        if dst == NodeId::BROADCAST {
            for (nid, queue) in inboxes.iter_mut() {
                if *nid != src {
                    queue.push_back((src, bytes.clone()));
                }
            }
            return;
        }
        match inboxes.get_mut(&dst) {
            Some(queue) => queue.push_back((src, bytes)),
            None => log::warn!("transport: dropping packet for unknown node {:?}", dst),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_per_pair() {
        let wire = LoopbackTransport::new();
        let a = NodeId::from_raw(2);
        let b = NodeId::from_raw(3);
        wire.register(a);
        wire.register(b);

        wire.send(a, b, vec![1]);
        wire.send(a, b, vec![2]);
        wire.send(a, b, vec![3]);
        let got = wire.drain(b);
        assert_eq!(
            got.iter().map(|(_, m)| m[0]).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert_eq!(wire.pending(), 0);
    }

    #[test]
    fn broadcast_skips_sender() {
        let wire = LoopbackTransport::new();
        let nids: Vec<NodeId> = (2u128..5).map(NodeId::from_raw).collect();
        for nid in &nids {
            wire.register(*nid);
        }
        wire.send(nids[0], NodeId::BROADCAST, vec![9]);
        assert!(wire.drain(nids[0]).is_empty());
        assert_eq!(wire.drain(nids[1]).len(), 1);
        assert_eq!(wire.drain(nids[2]).len(), 1);
    }
}
