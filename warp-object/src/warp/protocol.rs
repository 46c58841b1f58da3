//! The warp body: a bit-exact serialization of a live thread and the
//! pages it owns.
//!
//! Layout (all integers little-endian, vaddrs 64-bit): a magic/version
//! header, the thread record (vtid, status byte, tls, frame count, then
//! per frame the function, return address, the two caller resumption
//! pcs, stack and var-arg pages, pc, the two φ-history slots and the
//! four operand temporaries), then the page table (count, then per page
//! address, class tag, length, bytes, epoch).

use crate::ident::Vtid;
use crate::memory::{AddrClass, VAddr};
use crate::task::{StackInfo, ThreadStatus};
use crate::{WarpError, WarpResult};
use alloc::vec::Vec;
use byteorder::{ByteOrder, LittleEndian};
use core::convert::TryFrom;

/// Magic of a warp body.
pub const WARP_MAGIC: u32 = 0x5057_5750; // "PWWP"
/// Format version.
pub const WARP_VERSION: u16 = 1;

/// One page travelling with a thread.
#[derive(Debug, Clone, PartialEq)]
pub struct WarpPage {
    pub addr: VAddr,
    pub class: AddrClass,
    pub bytes: Vec<u8>,
    pub epoch: u64,
}

/// The serialized form of a migrating thread.
#[derive(Clone)]
pub struct WarpBody {
    pub tid: Vtid,
    pub status: ThreadStatus,
    pub tls: VAddr,
    pub frames: Vec<StackInfo>,
    pub pages: Vec<WarpPage>,
}

impl WarpBody {
    /// Encode into transportable bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&WARP_MAGIC.to_le_bytes());
        out.extend_from_slice(&WARP_VERSION.to_le_bytes());
        out.extend_from_slice(&self.tid.to_le_bytes());
        out.push(self.status as u8);
        out.extend_from_slice(&self.tls.0.to_le_bytes());
        out.extend_from_slice(&(self.frames.len() as u32).to_le_bytes());
        for f in &self.frames {
            out.extend_from_slice(&f.func.0.to_le_bytes());
            out.extend_from_slice(&f.ret_addr.0.to_le_bytes());
            out.extend_from_slice(&f.normal_pc.to_le_bytes());
            out.extend_from_slice(&f.unwind_pc.to_le_bytes());
            out.extend_from_slice(&f.stack.0.to_le_bytes());
            out.extend_from_slice(&f.var_arg.0.to_le_bytes());
            out.extend_from_slice(&f.pc.to_le_bytes());
            out.extend_from_slice(&f.phi0.to_le_bytes());
            out.extend_from_slice(&f.phi1.to_le_bytes());
            out.extend_from_slice(&f.ty.0.to_le_bytes());
            out.extend_from_slice(&f.output.0.to_le_bytes());
            out.extend_from_slice(&f.value.0.to_le_bytes());
            out.extend_from_slice(&f.address.0.to_le_bytes());
        }
        out.extend_from_slice(&(self.pages.len() as u32).to_le_bytes());
        for p in &self.pages {
            out.extend_from_slice(&p.addr.0.to_le_bytes());
            out.push(p.class as u8);
            out.extend_from_slice(&(p.bytes.len() as u32).to_le_bytes());
            out.extend_from_slice(&p.bytes);
            out.extend_from_slice(&p.epoch.to_le_bytes());
        }
        out
    }

    /// Decode a received body.
    pub fn decode(bytes: &[u8]) -> WarpResult<WarpBody> {
        let mut r = Reader { bytes, pos: 0 };
        if r.u32()? != WARP_MAGIC || r.u16()? != WARP_VERSION {
            return Err(WarpError::BAD_STATE);
        }
        let tid = r.u64()?;
        let status = ThreadStatus::try_from(r.u8()?).map_err(|_| WarpError::BAD_STATE)?;
        let tls = VAddr(r.u64()?);
        let frame_count = r.u32()? as usize;
        let mut frames = Vec::with_capacity(frame_count);
        for _ in 0..frame_count {
            let func = VAddr(r.u64()?);
            let ret_addr = VAddr(r.u64()?);
            let normal_pc = r.u64()?;
            let unwind_pc = r.u64()?;
            let stack = VAddr(r.u64()?);
            let var_arg = VAddr(r.u64()?);
            let pc = r.u64()?;
            let phi0 = r.u32()?;
            let phi1 = r.u32()?;
            let ty = VAddr(r.u64()?);
            let output = VAddr(r.u64()?);
            let value = VAddr(r.u64()?);
            let address = VAddr(r.u64()?);
            let mut frame = StackInfo::new(func, ret_addr, normal_pc, unwind_pc, stack);
            frame.var_arg = var_arg;
            frame.pc = pc;
            frame.phi0 = phi0;
            frame.phi1 = phi1;
            frame.ty = ty;
            frame.output = output;
            frame.value = value;
            frame.address = address;
            frames.push(frame);
        }
        let page_count = r.u32()? as usize;
        let mut pages = Vec::with_capacity(page_count);
        for _ in 0..page_count {
            let addr = VAddr(r.u64()?);
            let class = AddrClass::try_from(r.u8()?).map_err(|_| WarpError::BAD_STATE)?;
            let len = r.u32()? as usize;
            let bytes = r.take(len)?.to_vec();
            let epoch = r.u64()?;
            pages.push(WarpPage {
                addr,
                class,
                bytes,
                epoch,
            });
        }
        Ok(WarpBody {
            tid,
            status,
            tls,
            frames,
            pages,
        })
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> WarpResult<&'a [u8]> {
        if self.pos + n > self.bytes.len() {
            return Err(WarpError::BAD_STATE);
        }
        let s = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }
    fn u8(&mut self) -> WarpResult<u8> {
        Ok(self.take(1)?[0])
    }
    fn u16(&mut self) -> WarpResult<u16> {
        Ok(LittleEndian::read_u16(self.take(2)?))
    }
    fn u32(&mut self) -> WarpResult<u32> {
        Ok(LittleEndian::read_u32(self.take(4)?))
    }
    fn u64(&mut self) -> WarpResult<u64> {
        Ok(LittleEndian::read_u64(self.take(8)?))
    }
}
