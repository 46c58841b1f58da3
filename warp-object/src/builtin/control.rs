//! Thread and process control builtins.

use super::{read_param_i32, read_param_i64, read_param_vaddr, BuiltinContext, BuiltinParam,
            BuiltinRegistry, PostProc};
use crate::memory::VAddr;
use crate::{WarpError, WarpResult};
use core::convert::TryInto;

/// `nop()`.
pub fn nop(
    _ctx: &mut BuiltinContext<'_>,
    _param: &BuiltinParam,
    _dst: VAddr,
    _src: &[u8],
) -> WarpResult<PostProc> {
    Ok(PostProc::Normal)
}

/// `exit(code)`: write the exit code to the process result cell and
/// finish every local thread.
pub fn exit(
    ctx: &mut BuiltinContext<'_>,
    _param: &BuiltinParam,
    _dst: VAddr,
    src: &[u8],
) -> WarpResult<PostProc> {
    let mut seek = 0;
    let code = read_param_i32(src, &mut seek)? as i64;
    match ctx.proc.exit_from(Some(ctx.tid), code) {
        Ok(()) => Ok(PostProc::FinishThread),
        Err(WarpError::SHOULD_WAIT) => Ok(PostProc::Retry),
        Err(e) => Err(e),
    }
}

/// `abort()`: fail the calling thread.
pub fn abort(
    _ctx: &mut BuiltinContext<'_>,
    _param: &BuiltinParam,
    _dst: VAddr,
    _src: &[u8],
) -> WarpResult<PostProc> {
    Err(WarpError::INTERNAL)
}

/// Byte length of a jump buffer: frame depth, pc, output address.
pub const JMPBUF_SIZE: usize = 24;

/// `setjmp(buf)`: record the call site and answer 0.
pub fn setjmp(
    ctx: &mut BuiltinContext<'_>,
    _param: &BuiltinParam,
    dst: VAddr,
    src: &[u8],
) -> WarpResult<PostProc> {
    let mut seek = 0;
    let buf = read_param_vaddr(src, &mut seek)?;
    let depth = ctx.frame_depth() as u64;
    let pc = ctx.current_pc()?;
    let acc = ctx.accessor();
    let mut bytes = [0u8; JMPBUF_SIZE];
    bytes[0..8].copy_from_slice(&depth.to_le_bytes());
    bytes[8..16].copy_from_slice(&pc.to_le_bytes());
    bytes[16..24].copy_from_slice(&dst.0.to_le_bytes());
    acc.write_bytes(buf, &bytes)?;
    acc.write::<i32>(dst, 0)?;
    Ok(PostProc::Normal)
}

/// `longjmp(buf, value)`: cut the call stack back to the recorded frame
/// and make the saved setjmp call answer `value` (1 when 0).
pub fn longjmp(
    ctx: &mut BuiltinContext<'_>,
    _param: &BuiltinParam,
    _dst: VAddr,
    src: &[u8],
) -> WarpResult<PostProc> {
    let mut seek = 0;
    let buf = read_param_vaddr(src, &mut seek)?;
    let value = read_param_i32(src, &mut seek)?;
    let acc = ctx.accessor();
    let bytes = acc.read_bytes(buf, JMPBUF_SIZE)?;
    let depth = u64::from_le_bytes(bytes[0..8].try_into().map_err(|_| WarpError::INVALID_ARGS)?);
    let pc = u64::from_le_bytes(bytes[8..16].try_into().map_err(|_| WarpError::INVALID_ARGS)?);
    let out = VAddr(u64::from_le_bytes(
        bytes[16..24].try_into().map_err(|_| WarpError::INVALID_ARGS)?,
    ));
    ctx.longjmp(depth as usize, pc)?;
    acc.write::<i32>(out, if value == 0 { 1 } else { value })?;
    Ok(PostProc::Normal)
}

/// `processwarp.fork(func, arg)`: create a thread with a one-frame call
/// stack at the entry block of `func`; answers the new vtid.
pub fn fork(
    ctx: &mut BuiltinContext<'_>,
    _param: &BuiltinParam,
    dst: VAddr,
    src: &[u8],
) -> WarpResult<PostProc> {
    let mut seek = 0;
    let func = read_param_vaddr(src, &mut seek)?;
    let arg = read_param_i64(src, &mut seek).unwrap_or(0);
    match ctx.proc.create_thread(func, &[arg as u64]) {
        Ok(tid) => {
            if !dst.is_non() {
                ctx.accessor().write::<u64>(dst, tid)?;
            }
            Ok(PostProc::Normal)
        }
        Err(WarpError::SHOULD_WAIT) => Ok(PostProc::Retry),
        Err(e) => Err(e),
    }
}

/// Register the control set.
pub fn regist(registry: &BuiltinRegistry) {
    registry.register("nop", nop, BuiltinParam::None);
    registry.register("exit", exit, BuiltinParam::None);
    registry.register("abort", abort, BuiltinParam::None);
    registry.register("setjmp", setjmp, BuiltinParam::None);
    registry.register("_setjmp", setjmp, BuiltinParam::None);
    registry.register("longjmp", longjmp, BuiltinParam::None);
    registry.register("_longjmp", longjmp, BuiltinParam::None);
    registry.register("processwarp.fork", fork, BuiltinParam::None);
}

#[cfg(test)]
mod tests {
    use super::super::push_param;
    use super::*;
    use crate::ident::{NodeId, Vpid};
    use crate::interp::{FuncBuilder, Opcode, TYPE_I32};
    use crate::memory::{AddrClass, MemoryDelegate, MemoryMessage, VMemory};
    use crate::task::{pack_pc, Process, StackInfo, Thread};
    use alloc::sync::Arc;

    struct NullDelegate;
    impl MemoryDelegate for NullDelegate {
        fn memory_send(&self, _pid: &Vpid, _dst: NodeId, _msg: MemoryMessage) {}
    }

    fn fixture() -> Arc<Process> {
        let nid = NodeId::from_raw(2);
        let memory = VMemory::new(nid, Vpid::new("p"), nid, Arc::new(NullDelegate));
        Process::create(Vpid::new("p"), nid, memory)
    }

    #[test]
    fn setjmp_longjmp_cut_the_stack() {
        let proc = fixture();
        let acc = proc.accessor();

        // A dummy function page so frames have something to point at.
        let mut b = FuncBuilder::new("f");
        let s = b.slot(TYPE_I32);
        b.push(Opcode::Ret, TYPE_I32, crate::memory::VAddr::NON, &[s.0]);
        let func_page = acc.alloc(AddrClass::Function, b.encode().len()).unwrap();
        acc.write_bytes(func_page, &b.encode()).unwrap();
        let func = proc.func_store(func_page).unwrap();

        let thread = Thread::create(1);
        {
            let mut ti = thread.inner();
            for _ in 0..3 {
                let frame: StackInfo = proc.push_activation(&func, crate::memory::VAddr::NON).unwrap();
                ti.frames.push(frame);
            }
            ti.frames[0].pc = pack_pc(0, 0);
        }

        let jmpbuf = acc.alloc(AddrClass::Pod, JMPBUF_SIZE).unwrap();
        let dst = acc.alloc(AddrClass::Pod, 8).unwrap();

        // setjmp at depth 1 (performed as if from the bottom frame).
        {
            let mut ti = thread.inner();
            ti.frames.truncate(1);
            let mut ctx = BuiltinContext {
                proc: &proc,
                tid: 1,
                thread: &mut ti,
            };
            let mut buf = alloc::vec::Vec::new();
            push_param(&mut buf, &jmpbuf.0.to_le_bytes());
            setjmp(&mut ctx, &BuiltinParam::None, dst, &buf).unwrap();
        }
        assert_eq!(acc.read::<i32>(dst).unwrap(), 0);

        // Deepen the stack, then longjmp back.
        {
            let mut ti = thread.inner();
            for _ in 0..2 {
                let frame = proc.push_activation(&func, crate::memory::VAddr::NON).unwrap();
                ti.frames.push(frame);
            }
            assert_eq!(ti.frames.len(), 3);
            let mut ctx = BuiltinContext {
                proc: &proc,
                tid: 1,
                thread: &mut ti,
            };
            let mut buf = alloc::vec::Vec::new();
            push_param(&mut buf, &jmpbuf.0.to_le_bytes());
            push_param(&mut buf, &7i32.to_le_bytes());
            longjmp(&mut ctx, &BuiltinParam::None, crate::memory::VAddr::NON, &buf).unwrap();
            assert_eq!(ti.frames.len(), 1);
        }
        assert_eq!(acc.read::<i32>(dst).unwrap(), 7);
    }

    #[test]
    fn longjmp_to_dead_frame_is_refused() {
        let proc = fixture();
        let thread = Thread::create(1);
        let mut ti = thread.inner();
        let mut ctx = BuiltinContext {
            proc: &proc,
            tid: 1,
            thread: &mut ti,
        };
        assert_eq!(ctx.longjmp(1, 0), Err(WarpError::BAD_STATE));
    }
}
