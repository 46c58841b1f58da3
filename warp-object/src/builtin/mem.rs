//! Memory intrinsics.

use super::{read_param_i32, read_param_i64, read_param_i8, read_param_vaddr, BuiltinContext,
            BuiltinParam, BuiltinRegistry, PostProc};
use crate::memory::VAddr;
use crate::WarpResult;

fn read_len(src: &[u8], seek: &mut usize, width: i64) -> WarpResult<usize> {
    Ok(match width {
        32 => read_param_i32(src, seek)? as u32 as usize,
        _ => read_param_i64(src, seek)? as usize,
    })
}

/// `memcpy(dst, src, len, ...)`. The copy is read-then-write, so it is
/// also a correct memmove.
pub fn memcpy(
    ctx: &mut BuiltinContext<'_>,
    param: &BuiltinParam,
    _dst: VAddr,
    src: &[u8],
) -> WarpResult<PostProc> {
    let mut seek = 0;
    let to = read_param_vaddr(src, &mut seek)?;
    let from = read_param_vaddr(src, &mut seek)?;
    let len = read_len(src, &mut seek, param.i64()?)?;
    let acc = ctx.accessor();
    let bytes = acc.read_bytes(from, len)?;
    acc.write_bytes(to, &bytes)?;
    Ok(PostProc::Normal)
}

/// `memset(dst, value, len, ...)`.
pub fn memset(
    ctx: &mut BuiltinContext<'_>,
    param: &BuiltinParam,
    _dst: VAddr,
    src: &[u8],
) -> WarpResult<PostProc> {
    let mut seek = 0;
    let to = read_param_vaddr(src, &mut seek)?;
    let value = read_param_i8(src, &mut seek)? as u8;
    let len = read_len(src, &mut seek, param.i64()?)?;
    ctx.accessor().write_bytes(to, &vec![value; len])?;
    Ok(PostProc::Normal)
}

/// Register the memory intrinsics under both their libc and their
/// intrinsic spellings.
pub fn regist(registry: &BuiltinRegistry) {
    registry.register("memcpy", memcpy, BuiltinParam::I64(64));
    registry.register("memmove", memcpy, BuiltinParam::I64(64));
    registry.register("memset", memset, BuiltinParam::I64(64));
    for width in [32i64, 64].iter() {
        registry.register(
            &format!("llvm.memcpy.p0i8.p0i8.i{}", width),
            memcpy,
            BuiltinParam::I64(*width),
        );
        registry.register(
            &format!("llvm.memmove.p0i8.p0i8.i{}", width),
            memcpy,
            BuiltinParam::I64(*width),
        );
        registry.register(
            &format!("llvm.memset.p0i8.i{}", width),
            memset,
            BuiltinParam::I64(*width),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::super::push_param;
    use super::*;
    use crate::ident::{NodeId, Vpid};
    use crate::memory::{AddrClass, MemoryDelegate, MemoryMessage, VMemory};
    use crate::task::{Process, Thread};
    use alloc::sync::Arc;

    struct NullDelegate;
    impl MemoryDelegate for NullDelegate {
        fn memory_send(&self, _pid: &Vpid, _dst: NodeId, _msg: MemoryMessage) {}
    }

    #[test]
    fn copy_and_fill() {
        let nid = NodeId::from_raw(2);
        let memory = VMemory::new(nid, Vpid::new("p"), nid, Arc::new(NullDelegate));
        let proc = Process::create(Vpid::new("p"), nid, memory);
        let acc = proc.accessor();
        let a = acc.alloc(AddrClass::Array, 16).unwrap();
        let b = acc.alloc(AddrClass::Array, 16).unwrap();
        acc.write_bytes(a, b"warp-this-page!!").unwrap();

        let thread = Thread::create(1);
        let mut ti = thread.inner();
        let mut ctx = BuiltinContext {
            proc: &proc,
            tid: 1,
            thread: &mut ti,
        };

        let mut buf = alloc::vec::Vec::new();
        push_param(&mut buf, &b.0.to_le_bytes());
        push_param(&mut buf, &a.0.to_le_bytes());
        push_param(&mut buf, &16i64.to_le_bytes());
        memcpy(&mut ctx, &BuiltinParam::I64(64), VAddr::NON, &buf).unwrap();
        assert_eq!(acc.read_bytes(b, 16).unwrap(), b"warp-this-page!!");

        let mut buf = alloc::vec::Vec::new();
        push_param(&mut buf, &a.0.to_le_bytes());
        push_param(&mut buf, &[0x5a_u8]);
        push_param(&mut buf, &4i64.to_le_bytes());
        memset(&mut ctx, &BuiltinParam::I64(64), VAddr::NON, &buf).unwrap();
        assert_eq!(acc.read_bytes(a, 5).unwrap(), vec![0x5a, 0x5a, 0x5a, 0x5a, b'-']);
    }
}
