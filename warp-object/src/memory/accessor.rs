//! The typed memory surface the interpreter runs on.
//!
//! An [`Accessor`] is the only path by which interpreted code touches
//! memory. It enforces alignment and bounds on the fixed-width types and
//! carries the fault contract of the space it wraps: `SHOULD_WAIT` means
//! the calling thread must yield and re-execute the access once the page
//! arrives.

use super::space::VMemory;
use super::{AddrClass, VAddr};
use crate::{WarpError, WarpResult};
use alloc::sync::Arc;
use alloc::vec::Vec;

mod sealed {
    pub trait Sealed {}
}

/// A fixed-width value with an explicit little-endian byte codec.
pub trait Scalar: Copy + sealed::Sealed {
    /// Width in bytes; also the required alignment.
    const WIDTH: usize;
    /// Decode from exactly `WIDTH` little-endian bytes.
    fn decode(bytes: &[u8]) -> Self;
    /// Encode into exactly `WIDTH` little-endian bytes.
    fn encode(self, out: &mut [u8]);
}

macro_rules! impl_scalar {
    ($($t:ty),*) => {$(
        impl sealed::Sealed for $t {}
        impl Scalar for $t {
            const WIDTH: usize = core::mem::size_of::<$t>();
            fn decode(bytes: &[u8]) -> Self {
                let mut raw = [0u8; core::mem::size_of::<$t>()];
                raw.copy_from_slice(bytes);
                <$t>::from_le_bytes(raw)
            }
            fn encode(self, out: &mut [u8]) {
                out.copy_from_slice(&self.to_le_bytes());
            }
        }
    )*};
}

impl_scalar!(i8, i16, i32, i64, u8, u16, u32, u64, f32, f64);

impl sealed::Sealed for VAddr {}
impl Scalar for VAddr {
    const WIDTH: usize = 8;
    fn decode(bytes: &[u8]) -> Self {
        VAddr(u64::decode(bytes))
    }
    fn encode(self, out: &mut [u8]) {
        self.0.encode(out)
    }
}

/// Typed handle onto one process's distributed memory.
#[derive(Clone)]
pub struct Accessor {
    space: Arc<VMemory>,
}

impl Accessor {
    /// Wrap a space.
    pub fn new(space: Arc<VMemory>) -> Self {
        Accessor { space }
    }

    /// The underlying space.
    pub fn space(&self) -> &Arc<VMemory> {
        &self.space
    }

    fn check_aligned(addr: VAddr, width: usize) -> WarpResult {
        if addr.0 as usize % width != 0 {
            Err(WarpError::BAD_ACCESS)
        } else {
            Ok(())
        }
    }

    /// Read a fixed-width value.
    pub fn read<T: Scalar>(&self, addr: VAddr) -> WarpResult<T> {
        Self::check_aligned(addr, T::WIDTH)?;
        let bytes = self.space.read_bytes(addr, T::WIDTH)?;
        Ok(T::decode(&bytes))
    }

    /// Write a fixed-width value.
    pub fn write<T: Scalar>(&self, addr: VAddr, value: T) -> WarpResult {
        Self::check_aligned(addr, T::WIDTH)?;
        let mut bytes = vec![0u8; T::WIDTH];
        value.encode(&mut bytes);
        self.space.write_bytes(addr, &bytes)
    }

    /// Byte-granular read; no alignment requirement.
    pub fn read_bytes(&self, addr: VAddr, len: usize) -> WarpResult<Vec<u8>> {
        self.space.read_bytes(addr, len)
    }

    /// Byte-granular write; no alignment requirement.
    pub fn write_bytes(&self, addr: VAddr, bytes: &[u8]) -> WarpResult {
        self.space.write_bytes(addr, bytes)
    }

    /// Read the whole allocation containing `addr`.
    pub fn read_object(&self, addr: VAddr) -> WarpResult<(VAddr, Vec<u8>)> {
        self.space.read_object(addr)
    }

    /// Reserve an address and create its page locally.
    pub fn alloc(&self, class: AddrClass, size: usize) -> WarpResult<VAddr> {
        self.space.alloc(class, size)
    }

    /// Mark an allocation unreferenced.
    pub fn free(&self, addr: VAddr) -> WarpResult {
        self.space.free(addr)
    }

    /// Pull exclusive ownership of a page here.
    pub fn own(&self, addr: VAddr) -> WarpResult {
        self.space.own(addr)
    }

    /// Write back an owned page to its replica holders.
    pub fn publish(&self, addr: VAddr) -> WarpResult {
        self.space.publish(addr)
    }
}
