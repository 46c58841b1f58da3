//! The type table.
//!
//! Primitive types live at well-known salt-0 addresses every node agrees
//! on without communication; aggregate types are ordinary pages of class
//! `Type`, demand-fetched and decoded like any other allocation. The
//! table is immutable after load and may be replicated freely.

use crate::memory::{AddrClass, VAddr};
use crate::{WarpError, WarpResult};
use alloc::sync::Arc;
use alloc::vec::Vec;
use byteorder::{ByteOrder, LittleEndian};
use hashbrown::HashMap;
use lazy_static::lazy_static;

/// Magic of an encoded aggregate type page.
pub const TYPE_MAGIC: u32 = 0x5057_5459; // "PWTY"

/// Well-known primitive type addresses.
pub const TYPE_I8: VAddr = VAddr::build(AddrClass::Type, 0, 0x08);
pub const TYPE_I16: VAddr = VAddr::build(AddrClass::Type, 0, 0x10);
pub const TYPE_I32: VAddr = VAddr::build(AddrClass::Type, 0, 0x18);
pub const TYPE_I64: VAddr = VAddr::build(AddrClass::Type, 0, 0x20);
pub const TYPE_U8: VAddr = VAddr::build(AddrClass::Type, 0, 0x28);
pub const TYPE_U16: VAddr = VAddr::build(AddrClass::Type, 0, 0x30);
pub const TYPE_U32: VAddr = VAddr::build(AddrClass::Type, 0, 0x38);
pub const TYPE_U64: VAddr = VAddr::build(AddrClass::Type, 0, 0x40);
pub const TYPE_F32: VAddr = VAddr::build(AddrClass::Type, 0, 0x48);
pub const TYPE_F64: VAddr = VAddr::build(AddrClass::Type, 0, 0x50);
/// Pointers are 64-bit virtual addresses.
pub const TYPE_PTR: VAddr = VAddr::build(AddrClass::Type, 0, 0x58);

/// Shape of a type.
#[derive(Debug, Clone, PartialEq)]
pub enum TypeKind {
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
    Pointer,
    /// Fields as `(type, byte offset)`, in declaration order.
    Struct { fields: Vec<(VAddr, u32)> },
    Array { elem: VAddr, len: u32, stride: u32 },
}

/// One entry of the type table.
#[derive(Debug, Clone, PartialEq)]
pub struct TypeStore {
    pub addr: VAddr,
    pub kind: TypeKind,
    pub size: u32,
    pub align: u32,
}

impl TypeStore {
    fn primitive(addr: VAddr, kind: TypeKind, size: u32) -> Arc<Self> {
        Arc::new(TypeStore {
            addr,
            kind,
            size,
            align: size,
        })
    }

    /// Whether values of this type are loaded as floats.
    pub fn is_float(&self) -> bool {
        matches!(self.kind, TypeKind::F32 | TypeKind::F64)
    }

    /// Whether integer values of this type are sign-extended.
    pub fn is_signed(&self) -> bool {
        matches!(
            self.kind,
            TypeKind::I8 | TypeKind::I16 | TypeKind::I32 | TypeKind::I64
        )
    }

    /// Whether this is a scalar (loadable in one typed access).
    pub fn is_scalar(&self) -> bool {
        !matches!(self.kind, TypeKind::Struct { .. } | TypeKind::Array { .. })
    }

    /// Encode an aggregate descriptor into page bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&TYPE_MAGIC.to_le_bytes());
        out.extend_from_slice(&self.size.to_le_bytes());
        out.extend_from_slice(&self.align.to_le_bytes());
        match &self.kind {
            TypeKind::Struct { fields } => {
                out.push(0);
                out.extend_from_slice(&(fields.len() as u32).to_le_bytes());
                for (ty, offset) in fields {
                    out.extend_from_slice(&ty.0.to_le_bytes());
                    out.extend_from_slice(&offset.to_le_bytes());
                }
            }
            TypeKind::Array { elem, len, stride } => {
                out.push(1);
                out.extend_from_slice(&elem.0.to_le_bytes());
                out.extend_from_slice(&len.to_le_bytes());
                out.extend_from_slice(&stride.to_le_bytes());
            }
            _ => unreachable!("primitives are never encoded"),
        }
        out
    }

    /// Decode an aggregate descriptor from page bytes.
    pub fn decode(addr: VAddr, bytes: &[u8]) -> WarpResult<Arc<Self>> {
        if bytes.len() < 13 || LittleEndian::read_u32(&bytes[0..4]) != TYPE_MAGIC {
            return Err(WarpError::INVALID_TYPE);
        }
        let size = LittleEndian::read_u32(&bytes[4..8]);
        let align = LittleEndian::read_u32(&bytes[8..12]);
        let tag = bytes[12];
        let kind = match tag {
            0 => {
                if bytes.len() < 17 {
                    return Err(WarpError::INVALID_TYPE);
                }
                let count = LittleEndian::read_u32(&bytes[13..17]) as usize;
                let mut fields = Vec::with_capacity(count);
                let mut off = 17;
                for _ in 0..count {
                    if off + 12 > bytes.len() {
                        return Err(WarpError::INVALID_TYPE);
                    }
                    let ty = VAddr(LittleEndian::read_u64(&bytes[off..off + 8]));
                    let field_off = LittleEndian::read_u32(&bytes[off + 8..off + 12]);
                    fields.push((ty, field_off));
                    off += 12;
                }
                TypeKind::Struct { fields }
            }
            1 => {
                if bytes.len() < 29 {
                    return Err(WarpError::INVALID_TYPE);
                }
                TypeKind::Array {
                    elem: VAddr(LittleEndian::read_u64(&bytes[13..21])),
                    len: LittleEndian::read_u32(&bytes[21..25]),
                    stride: LittleEndian::read_u32(&bytes[25..29]),
                }
            }
            _ => return Err(WarpError::INVALID_TYPE),
        };
        Ok(Arc::new(TypeStore {
            addr,
            kind,
            size,
            align,
        }))
    }
}

lazy_static! {
    /// The fleet-wide primitive type table.
    pub static ref PRIMITIVE_TYPES: HashMap<VAddr, Arc<TypeStore>> = {
        let mut map = HashMap::new();
        map.insert(TYPE_I8, TypeStore::primitive(TYPE_I8, TypeKind::I8, 1));
        map.insert(TYPE_I16, TypeStore::primitive(TYPE_I16, TypeKind::I16, 2));
        map.insert(TYPE_I32, TypeStore::primitive(TYPE_I32, TypeKind::I32, 4));
        map.insert(TYPE_I64, TypeStore::primitive(TYPE_I64, TypeKind::I64, 8));
        map.insert(TYPE_U8, TypeStore::primitive(TYPE_U8, TypeKind::U8, 1));
        map.insert(TYPE_U16, TypeStore::primitive(TYPE_U16, TypeKind::U16, 2));
        map.insert(TYPE_U32, TypeStore::primitive(TYPE_U32, TypeKind::U32, 4));
        map.insert(TYPE_U64, TypeStore::primitive(TYPE_U64, TypeKind::U64, 8));
        map.insert(TYPE_F32, TypeStore::primitive(TYPE_F32, TypeKind::F32, 4));
        map.insert(TYPE_F64, TypeStore::primitive(TYPE_F64, TypeKind::F64, 8));
        map.insert(TYPE_PTR, TypeStore::primitive(TYPE_PTR, TypeKind::Pointer, 8));
        map
    };
}

/// Look up a primitive by its well-known address.
pub fn primitive_type(addr: VAddr) -> Option<Arc<TypeStore>> {
    PRIMITIVE_TYPES.get(&addr).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitives_resolve() {
        let t = primitive_type(TYPE_I16).unwrap();
        assert_eq!(t.size, 2);
        assert!(t.is_signed() && !t.is_float() && t.is_scalar());
        let t = primitive_type(TYPE_F64).unwrap();
        assert!(t.is_float());
        assert!(primitive_type(VAddr(0x999)).is_none());
    }

    #[test]
    fn aggregate_round_trip() {
        let ty = TypeStore {
            addr: VAddr::build(AddrClass::Type, 3, 0),
            kind: TypeKind::Struct {
                fields: vec![(TYPE_I32, 0), (TYPE_I8, 4), (TYPE_F64, 8)],
            },
            size: 16,
            align: 8,
        };
        let bytes = ty.encode();
        let back = TypeStore::decode(ty.addr, &bytes).unwrap();
        assert_eq!(*back, ty);

        let arr = TypeStore {
            addr: VAddr::build(AddrClass::Type, 3, 0x20),
            kind: TypeKind::Array {
                elem: TYPE_U16,
                len: 8,
                stride: 2,
            },
            size: 16,
            align: 2,
        };
        let back = TypeStore::decode(arr.addr, &arr.encode()).unwrap();
        assert_eq!(*back, arr);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert_eq!(
            TypeStore::decode(VAddr(1), &[0; 4]).unwrap_err(),
            WarpError::INVALID_TYPE
        );
        let mut bytes = vec![0u8; 16];
        LittleEndian::write_u32(&mut bytes[0..4], TYPE_MAGIC);
        bytes[12] = 9;
        assert_eq!(
            TypeStore::decode(VAddr(1), &bytes).unwrap_err(),
            WarpError::INVALID_TYPE
        );
    }
}
