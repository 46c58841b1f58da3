//! Coherence protocol messages and in-flight bookkeeping.
//!
//! Messages for the same address between the same pair of nodes ride a
//! FIFO transport and are therefore serialized; epochs disambiguate
//! everything that crosses pairs. Every outbound request carries a
//! deadline; timed-out requests are re-sent with the same epoch (handlers
//! are idempotent) until the retry budget runs out and the requester
//! surfaces `COHERENCE_FAULT`.

use super::VAddr;
use crate::ident::NodeId;
use alloc::collections::BTreeSet;
use alloc::vec::Vec;
use serde::{Deserialize, Serialize};

/// Resend interval for outstanding coherence requests, in milliseconds of
/// the caller-supplied clock.
pub const COHERENCE_RTO_MS: u64 = 1_000;

/// How many resends before an outstanding request becomes a
/// `COHERENCE_FAULT` on the requesting thread.
pub const COHERENCE_RETRY_LIMIT: u32 = 5;

/// On-wire coherence messages (module `Memory`).
///
/// `addr` is the raw faulting address in requests and the page base in
/// replies; owners resolve interior addresses to their allocation.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum MemoryMessage {
    /// Read miss: ask the (supposed) owner for a replica.
    ReadReq { addr: VAddr, requester: NodeId },
    /// Replica grant; the requester becomes CachedReadonly.
    ReadReply { addr: VAddr, bytes: Vec<u8>, epoch: u64 },
    /// Write miss: ask the owner for exclusive ownership.
    OwnershipReq { addr: VAddr, requester: NodeId },
    /// Ownership grant, sent once every other replica acknowledged
    /// invalidation. `copy_set` is the residual replica set the new owner
    /// inherits (the granter includes itself when it keeps a copy).
    OwnershipReply {
        addr: VAddr,
        bytes: Vec<u8>,
        epoch: u64,
        copy_set: Vec<NodeId>,
    },
    /// Drop your replica of `addr`.
    Invalidate { addr: VAddr, epoch: u64 },
    /// Replica dropped.
    InvalidateAck { addr: VAddr, epoch: u64 },
    /// Write-back from the owner to its replica holders.
    Update { addr: VAddr, bytes: Vec<u8>, epoch: u64 },
}

/// What an outstanding request is waiting for.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub(crate) enum RequestKind {
    Read,
    Ownership,
}

/// One outstanding request from this node, keyed by the raw address the
/// faulting access used.
pub(crate) struct PendingRequest {
    pub kind: RequestKind,
    pub deadline: u64,
    pub retries: u32,
}

/// Why an owner is waiting for invalidation acks.
pub(crate) enum RoundPurpose {
    /// Local OwnedReadonly → OwnedWritable promotion.
    Promote,
    /// Ownership transfer to a remote requester.
    Grant { requester: NodeId },
    /// Releasing the page after the last local reference was freed.
    Reclaim,
}

/// An invalidation round an owner runs over its copy set.
pub(crate) struct InvalidationRound {
    pub purpose: RoundPurpose,
    pub waiting: BTreeSet<NodeId>,
    pub epoch: u64,
    pub deadline: u64,
    pub retries: u32,
    /// Ownership requests that arrived while this round was in flight;
    /// forwarded to the new owner when the round completes, higher
    /// requester ids first.
    pub queued: Vec<NodeId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_shape() {
        let msg = MemoryMessage::ReadReq {
            addr: VAddr(0x42),
            requester: NodeId::from_raw(7),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"command\":\"read_req\""));
        let back: MemoryMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn bytes_round_trip() {
        let msg = MemoryMessage::Update {
            addr: VAddr(0x10),
            bytes: vec![0xde, 0xad],
            epoch: 9,
        };
        let json = serde_json::to_string(&msg).unwrap();
        let back: MemoryMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
    }
}
