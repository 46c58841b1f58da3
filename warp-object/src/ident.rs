//! Fleet-level identifiers.
//!
//! Node ids live on the routing ring and have a total order; virtual
//! process ids are opaque strings minted by whoever launches a program;
//! virtual thread ids are monotonic within one process.

use alloc::string::String;
use core::fmt;
use serde::de::{self, Deserialize, Deserializer, Visitor};
use serde::ser::{Serialize, Serializer};

/// The type of virtual thread ids. Monotonic within a process.
pub type Vtid = u64;

/// Identifier of a node in the peer fleet.
///
/// Opaque 128 bits with a total order used by the routing ring. The JSON
/// wire form is 32 lower-hex characters.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct NodeId(u128);

impl NodeId {
    /// "No node": placeholder for unknown owners and unset hints.
    pub const NONE: NodeId = NodeId(0);
    /// The local node, independent of its ring position.
    pub const THIS: NodeId = NodeId(1);
    /// Every reachable node.
    pub const BROADCAST: NodeId = NodeId(u128::MAX);

    /// Build a node id from its raw ring position.
    pub const fn from_raw(raw: u128) -> Self {
        NodeId(raw)
    }

    /// The raw ring position.
    pub const fn raw(self) -> u128 {
        self.0
    }

    /// Whether this id is one of the reserved sentinels.
    pub fn is_reserved(self) -> bool {
        self == Self::NONE || self == Self::THIS || self == Self::BROADCAST
    }

    /// Fold the id into the 20-bit allocation salt used to keep virtual
    /// addresses minted by different nodes disjoint. Never zero: the zero
    /// salt is reserved for well-known addresses shared by the whole fleet.
    pub fn alloc_salt(self) -> u32 {
        let folded = self.0 ^ (self.0 >> 20) ^ (self.0 >> 40) ^ (self.0 >> 80);
        (folded as u32 & 0xf_fffe) | 1
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            NodeId::NONE => write!(f, "NodeId(NONE)"),
            NodeId::BROADCAST => write!(f, "NodeId(BROADCAST)"),
            _ => write!(f, "NodeId({:x})", self.0),
        }
    }
}

impl Serialize for NodeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("{:032x}", self.0))
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct NodeIdVisitor;

        impl<'de> Visitor<'de> for NodeIdVisitor {
            type Value = NodeId;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a 32-character lower-hex node id")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<NodeId, E> {
                u128::from_str_radix(v, 16)
                    .map(NodeId)
                    .map_err(|_| E::custom("invalid node id"))
            }
        }

        deserializer.deserialize_str(NodeIdVisitor)
    }
}

/// Identifier of a process instance, unique across the fleet.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct Vpid(pub String);

impl Vpid {
    /// Wrap a process-id string.
    pub fn new(s: &str) -> Self {
        Vpid(String::from(s))
    }
}

impl fmt::Display for Vpid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
