//! One activation record of an interpreted thread.

use crate::interp::FuncStore;
use crate::memory::VAddr;
use alloc::sync::Arc;

/// Pack a (basic-block, offset) program counter into one integer.
pub fn pack_pc(block: u32, index: u32) -> u64 {
    ((block as u64) << 32) | index as u64
}

/// Basic-block half of a packed pc.
pub fn pc_block(pc: u64) -> u32 {
    (pc >> 32) as u32
}

/// Offset half of a packed pc.
pub fn pc_index(pc: u64) -> u32 {
    pc as u32
}

/// One frame on a thread's call stack.
///
/// `normal_pc` and `unwind_pc` are resumption points in the *caller*:
/// `normal_pc` is entered when this frame returns, `unwind_pc` (when
/// non-zero) when a raised condition propagates out of it. The four
/// operand fields mirror the operands of the instruction currently being
/// executed, so a suspended access can resume with its resolved
/// addresses; they travel with the frame in a warp.
#[derive(Clone)]
pub struct StackInfo {
    /// Address of the function this frame executes.
    pub func: VAddr,
    /// Where the return value is written; `NON` for no output.
    pub ret_addr: VAddr,
    /// Caller resumption pc for a normal return.
    pub normal_pc: u64,
    /// Caller resumption pc when unwinding; 0 means keep propagating.
    pub unwind_pc: u64,
    /// This frame's stack data page.
    pub stack: VAddr,
    /// Packed variadic arguments; `NON` when the call had none.
    pub var_arg: VAddr,
    /// Current pc within `func`.
    pub pc: u64,
    /// Most recent predecessor basic block, for φ-resolution.
    pub phi0: u32,
    /// Previous value of `phi0`.
    pub phi1: u32,
    /// Type operand of the instruction being executed.
    pub ty: VAddr,
    /// Output operand (resolved destination address).
    pub output: VAddr,
    /// Value operand.
    pub value: VAddr,
    /// Address operand.
    pub address: VAddr,
    /// Decoded-function cache; not serialized, rebuilt after a warp.
    pub func_cache: Option<Arc<FuncStore>>,
}

impl StackInfo {
    /// A fresh frame at the entry of `func`.
    pub fn new(func: VAddr, ret_addr: VAddr, normal_pc: u64, unwind_pc: u64, stack: VAddr) -> Self {
        StackInfo {
            func,
            ret_addr,
            normal_pc,
            unwind_pc,
            stack,
            var_arg: VAddr::NON,
            pc: 0,
            phi0: 0,
            phi1: 0,
            ty: VAddr::NON,
            output: VAddr::NON,
            value: VAddr::NON,
            address: VAddr::NON,
            func_cache: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pc_packing() {
        let pc = pack_pc(3, 17);
        assert_eq!(pc_block(pc), 3);
        assert_eq!(pc_index(pc), 17);
        assert_eq!(pack_pc(0, 0), 0);
    }

    #[test]
    fn fresh_frame_defaults() {
        let f = StackInfo::new(VAddr(0x10), VAddr::NON, 5, 0, VAddr(0x20));
        assert_eq!(f.pc, 0);
        assert_eq!(f.phi0, 0);
        assert_eq!(f.var_arg, VAddr::NON);
        assert!(f.func_cache.is_none());
    }
}
