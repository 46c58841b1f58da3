//! Overflow-checked arithmetic.
//!
//! Each builtin writes `{result, flag}`: the wrapped result in its
//! operand width followed by one flag byte, `0x00` when the true result
//! fits the width and `0xff` on overflow.

use super::{read_param_i16, read_param_i32, read_param_i64, BuiltinContext, BuiltinParam,
            BuiltinRegistry, PostProc};
use crate::memory::VAddr;
use crate::{WarpError, WarpResult};

macro_rules! case_per_width {
    ($method:ident, $int:ty, $read:ident, $ctx:ident, $dst:ident, $src:ident, $seek:ident) => {{
        let a = $read($src, &mut $seek)? as $int;
        let b = $read($src, &mut $seek)? as $int;
        let (res, overflow) = a.$method(b);
        let acc = $ctx.accessor();
        acc.write::<$int>($dst, res)?;
        acc.write::<u8>(
            $dst.add(core::mem::size_of::<$int>() as u64),
            if overflow { 0xff } else { 0x00 },
        )?;
    }};
}

macro_rules! func_per_method {
    ($fname:ident, $method:ident, $i16:ty, $i32:ty, $i64:ty) => {
        pub fn $fname(
            ctx: &mut BuiltinContext<'_>,
            param: &BuiltinParam,
            dst: VAddr,
            src: &[u8],
        ) -> WarpResult<PostProc> {
            let mut seek = 0;
            match param.i64()? {
                16 => case_per_width!($method, $i16, read_param_i16, ctx, dst, src, seek),
                32 => case_per_width!($method, $i32, read_param_i32, ctx, dst, src, seek),
                64 => case_per_width!($method, $i64, read_param_i64, ctx, dst, src, seek),
                _ => return Err(WarpError::INVALID_ARGS),
            }
            Ok(PostProc::Normal)
        }
    };
}

func_per_method!(sadd, overflowing_add, i16, i32, i64);
func_per_method!(smul, overflowing_mul, i16, i32, i64);
func_per_method!(ssub, overflowing_sub, i16, i32, i64);
func_per_method!(uadd, overflowing_add, u16, u32, u64);
func_per_method!(umul, overflowing_mul, u16, u32, u64);
func_per_method!(usub, overflowing_sub, u16, u32, u64);

/// Register the overflow family.
pub fn regist(registry: &BuiltinRegistry) {
    for (op, func) in [
        ("sadd", sadd as super::BuiltinFunc),
        ("smul", smul),
        ("ssub", ssub),
        ("uadd", uadd),
        ("umul", umul),
        ("usub", usub),
    ]
    .iter()
    {
        for width in [16i64, 32, 64].iter() {
            let name = format!("llvm.{}.with.overflow.i{}", op, width);
            registry.register(&name, *func, BuiltinParam::I64(*width));
        }
    }
}
