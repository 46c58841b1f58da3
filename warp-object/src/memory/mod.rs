//! The distributed virtual memory.
//!
//! Every process owns one logical address space replicated across the
//! nodes that host its threads. The unit of distribution is the *page*:
//! one allocation, owned by exactly one node at a time and cached
//! read-only everywhere else (see [`PageStore`] and [`VMemory`]).

mod accessor;
mod coherence;
mod page;
mod space;
mod store;

pub use self::accessor::{Accessor, Scalar};
pub use self::coherence::{MemoryMessage, COHERENCE_RETRY_LIMIT, COHERENCE_RTO_MS};
pub use self::page::{Page, PageFlags, PageState};
pub use self::space::{MemoryDelegate, UpdateHandler, VMemory};
pub use self::store::PageStore;

use crate::{WarpError, WarpResult};
use core::convert::TryFrom;
use core::fmt;
use numeric_enum_macro::numeric_enum;
use serde::{Deserialize, Serialize};

numeric_enum! {
    #[repr(u8)]
    /// Allocation class of a virtual address, encoded in its top 4 bits.
    #[derive(Debug, Clone, Copy, Eq, PartialEq)]
    pub enum AddrClass {
        // The reserved zero class; only `VAddr::NULL` carries it.
        Null = 0,
        // Function code and metadata.
        Function = 1,
        // Type descriptors.
        Type = 2,
        // Basic (plain-old-data) values.
        Pod = 3,
        // Heap arrays, variable length.
        Array = 4,
        // Per-thread local storage.
        Tls = 5,
        // Per-frame stack data.
        Stack = 6,
        // The process control block.
        ProcCtrl = 7,
        // Frame-relative operand marker; never stored in the page table.
        Frame = 0xe,
        // Reserved; the `NON` sentinel lives here.
        Invalid = 0xf,
    }
}

/// A virtual address inside one process's distributed address space.
///
/// 64 bits: `class:4 | salt:20 | offset:40`. The salt identifies the
/// allocating node so two nodes can never mint the same address; salt 0
/// is reserved for well-known fleet-wide addresses (primitive types).
/// Address 0 is the reserved NULL; the all-ones `NON` means "absent".
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VAddr(pub u64);

/// Bit position of the class field.
pub const CLASS_SHIFT: u32 = 60;
/// Bit position of the salt field.
pub const SALT_SHIFT: u32 = 40;
/// Mask of the offset field.
pub const OFFSET_MASK: u64 = (1 << SALT_SHIFT) - 1;

/// Fixed content length of stack-class pages.
pub const STACK_PAGE_SIZE: usize = 4096;
/// Fixed content length of thread-local-storage pages.
pub const TLS_PAGE_SIZE: usize = 1024;

impl VAddr {
    /// The reserved null address.
    pub const NULL: VAddr = VAddr(0);
    /// The "absent" sentinel, distinct from NULL.
    pub const NON: VAddr = VAddr(u64::MAX);

    /// Assemble an address from its fields. `offset` must fit in 40 bits.
    pub const fn build(class: AddrClass, salt: u32, offset: u64) -> VAddr {
        VAddr(((class as u64) << CLASS_SHIFT) | ((salt as u64) << SALT_SHIFT) | offset)
    }

    /// A frame-relative operand: resolved against the current frame's
    /// stack page by the interpreter, never handed to the page store.
    pub const fn frame_slot(offset: u32) -> VAddr {
        VAddr::build(AddrClass::Frame, 0, offset as u64)
    }

    /// The allocation class from the top 4 bits.
    pub fn class(self) -> AddrClass {
        AddrClass::try_from((self.0 >> CLASS_SHIFT) as u8).unwrap_or(AddrClass::Invalid)
    }

    /// The allocation salt.
    pub fn salt(self) -> u32 {
        ((self.0 >> SALT_SHIFT) & 0xf_ffff) as u32
    }

    /// The offset field.
    pub fn offset(self) -> u64 {
        self.0 & OFFSET_MASK
    }

    /// Whether this is the reserved NULL address.
    pub fn is_null(self) -> bool {
        self == VAddr::NULL
    }

    /// Whether this is the "absent" sentinel.
    pub fn is_non(self) -> bool {
        self == VAddr::NON
    }

    /// Whether this encodes a frame-relative operand.
    pub fn is_frame_slot(self) -> bool {
        self.class() == AddrClass::Frame
    }

    /// An address usable by the page store: not NULL, not NON, not a
    /// frame-relative marker.
    pub fn check_memory(self) -> WarpResult<VAddr> {
        match self.class() {
            AddrClass::Null | AddrClass::Frame | AddrClass::Invalid => Err(WarpError::BAD_ACCESS),
            _ => Ok(self),
        }
    }

    /// The address `bytes` past this one, in the same allocation.
    pub fn add(self, bytes: u64) -> VAddr {
        VAddr(self.0 + bytes)
    }
}

impl fmt::Display for VAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_non() {
            f.write_str("NON")
        } else {
            write!(f, "{:#018x}", self.0)
        }
    }
}

impl fmt::Debug for VAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VAddr({})", self)
    }
}

/// Round `x` up to a multiple of `align` (a power of two).
pub fn align_up(x: u64, align: u64) -> u64 {
    (x + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addr_fields() {
        let a = VAddr::build(AddrClass::Stack, 0x1b, 0x420);
        assert_eq!(a.class(), AddrClass::Stack);
        assert_eq!(a.salt(), 0x1b);
        assert_eq!(a.offset(), 0x420);
        assert_eq!(a.add(8).offset(), 0x428);
    }

    #[test]
    fn sentinels() {
        assert!(VAddr::NULL.is_null());
        assert!(VAddr::NON.is_non());
        assert_eq!(VAddr::NULL.class(), AddrClass::Null);
        assert_eq!(VAddr::NON.class(), AddrClass::Invalid);
        assert!(VAddr::NULL.check_memory().is_err());
        assert!(VAddr::NON.check_memory().is_err());
        assert!(VAddr::frame_slot(8).check_memory().is_err());
        assert!(VAddr::build(AddrClass::Pod, 1, 0).check_memory().is_ok());
    }

    #[test]
    fn align() {
        assert_eq!(align_up(0, 8), 0);
        assert_eq!(align_up(1, 8), 8);
        assert_eq!(align_up(8, 8), 8);
        assert_eq!(align_up(13, 4), 16);
    }
}
