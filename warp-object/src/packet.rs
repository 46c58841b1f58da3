//! Inter-node packets.
//!
//! Everything between nodes rides one JSON envelope: the process it
//! belongs to, the addressed module, and a module-specific payload. The
//! warp body inside `Vm` payloads stays bit-exact binary; the envelope
//! only frames it.

use crate::ident::{NodeId, Vpid};
use crate::{WarpError, WarpResult};
use alloc::vec::Vec;
use core::convert::TryFrom;
use core::fmt;
use numeric_enum_macro::numeric_enum;
use serde::de::{self, Deserializer, Visitor};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use serde_json::Value;

numeric_enum! {
    #[repr(u8)]
    /// Receiver module of a packet.
    #[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
    pub enum Module {
        // Coherence traffic for a process's memory space.
        Memory = 1,
        // The virtual machine hosting the process (warp handshake).
        Vm = 2,
        // The per-node scheduler.
        Scheduler = 3,
        // Daemon-level control commands.
        Controller = 4,
    }
}

impl Serialize for Module {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(*self as u8)
    }
}

impl<'de> Deserialize<'de> for Module {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct ModuleVisitor;
        impl<'de> Visitor<'de> for ModuleVisitor {
            type Value = Module;
            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a module number")
            }
            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Module, E> {
                Module::try_from(v as u8).map_err(|_| E::custom("unknown module"))
            }
        }
        deserializer.deserialize_u64(ModuleVisitor)
    }
}

/// One framed message between two nodes (or looped back locally).
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Packet {
    pub pid: Vpid,
    pub dst_nid: NodeId,
    pub src_nid: NodeId,
    pub module: Module,
    pub content: Value,
}

impl Packet {
    /// Serialize for the transport.
    pub fn to_bytes(&self) -> WarpResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|_| WarpError::INTERNAL)
    }

    /// Parse a transport delivery.
    pub fn from_bytes(bytes: &[u8]) -> WarpResult<Packet> {
        serde_json::from_slice(bytes).map_err(|_| WarpError::INTERNAL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trip() {
        let packet = Packet {
            pid: Vpid::new("pid-1"),
            dst_nid: NodeId::from_raw(9),
            src_nid: NodeId::from_raw(2),
            module: Module::Memory,
            content: serde_json::json!({"command": "read_req", "addr": 16}),
        };
        let bytes = packet.to_bytes().unwrap();
        let back = Packet::from_bytes(&bytes).unwrap();
        assert_eq!(back.pid, packet.pid);
        assert_eq!(back.module, Module::Memory);
        assert_eq!(back.content["command"], "read_req");
        assert!(Packet::from_bytes(b"{not json").is_err());
    }
}
