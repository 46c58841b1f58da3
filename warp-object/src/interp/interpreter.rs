//! The dispatch loop.
//!
//! `execute` runs one thread for at most one quantum of instructions.
//! Every memory touch goes through the process accessor, so the loop can
//! be suspended mid-instruction: a `SHOULD_WAIT` from the accessor
//! leaves the pc unchanged and the instruction re-executes when the
//! thread wakes. Reads carry no side effects and all commits happen
//! after the last faultable access, which is what makes re-execution
//! safe (and what lets a thread warp away while suspended on a fault).

use super::func::FuncKind;
use super::opcode::{Instruction, Opcode};
use super::types::{TypeKind, TypeStore};
use crate::builtin::{self, BuiltinContext, PostProc};
use crate::memory::{align_up, Accessor, AddrClass, VAddr};
use crate::task::{pack_pc, pc_block, pc_index, Process, StackInfo, Thread, ThreadStatus};
use crate::task::ThreadInner;
use crate::{WarpError, WarpResult};
use alloc::sync::Arc;
use alloc::vec::Vec;

/// Why the interpreter gave the thread back to the scheduler.
pub enum Yield {
    /// The instruction budget of this slice ran out.
    Quantum,
    /// Suspended on a memory fault at the given address; the pc was left
    /// unchanged and the instruction re-executes on wake.
    Fault(VAddr),
    /// A builtin asked to be re-entered later.
    BuiltinWait,
    /// The thread status left `Normal` (warp pending).
    Warp,
    /// Returned from the root frame.
    Finished,
    /// Unhandled fault, trap, or invalid instruction.
    Errored(WarpError),
}

enum Step {
    /// The instruction completed and updated the pc itself.
    Done,
    /// A builtin wants the same call re-entered.
    Wait,
    /// A builtin finished the thread.
    FinishThread,
    /// The last frame was popped.
    Finished,
}

/// Run `thread` for at most `quantum` instructions.
pub fn execute(proc: &Arc<Process>, thread: &Arc<Thread>, quantum: usize) -> Yield {
    let acc = proc.accessor();
    for _ in 0..quantum {
        if thread.status() != ThreadStatus::Normal {
            return Yield::Warp;
        }
        let mut inner = thread.inner();
        if inner.frames.is_empty() {
            return Yield::Finished;
        }
        let mut fault = VAddr::NON;
        match step(proc, &acc, &mut inner, thread.tid, &mut fault) {
            Ok(Step::Done) => {}
            Ok(Step::Wait) => return Yield::BuiltinWait,
            Ok(Step::FinishThread) | Ok(Step::Finished) => return Yield::Finished,
            Err(WarpError::SHOULD_WAIT) => return Yield::Fault(fault),
            Err(err @ WarpError::ARITHMETIC_TRAP) | Err(err @ WarpError::BAD_ACCESS) => {
                if !raise(&acc, &mut inner) {
                    return Yield::Errored(err);
                }
            }
            Err(err) => return Yield::Errored(err),
        }
    }
    Yield::Quantum
}

/// Unwind after a raised condition: pop frames until one recorded a
/// landing pad for its caller, or fail the thread when none does.
pub(crate) fn raise(acc: &Accessor, inner: &mut ThreadInner) -> bool {
    while let Some(popped) = inner.frames.pop() {
        let _ = acc.free(popped.stack);
        if popped.unwind_pc != 0 && !inner.frames.is_empty() {
            let top = inner.frames.last_mut().unwrap();
            top.pc = popped.unwind_pc;
            return true;
        }
    }
    false
}

/// Tag a faultable access with the address the thread would wait on.
fn mem<T>(r: WarpResult<T>, addr: VAddr, fault: &mut VAddr) -> WarpResult<T> {
    if let Err(WarpError::SHOULD_WAIT) = r {
        *fault = addr;
    }
    r
}

/// Resolve a frame-relative operand against the frame's stack page.
fn resolve(frame: &StackInfo, operand: u64) -> VAddr {
    let a = VAddr(operand);
    if a.is_frame_slot() {
        frame.stack.add(a.offset())
    } else {
        a
    }
}

fn advance(inner: &mut ThreadInner) {
    let f = inner.frames.last_mut().unwrap();
    f.pc = pack_pc(pc_block(f.pc), pc_index(f.pc) + 1);
}

/// Take a branch: update the φ history and enter the target block.
fn branch(inner: &mut ThreadInner, target: u32) {
    let f = inner.frames.last_mut().unwrap();
    f.phi1 = f.phi0;
    f.phi0 = pc_block(f.pc);
    f.pc = pack_pc(target, 0);
}

fn sext(v: u64, size: u32) -> i64 {
    let shift = 64 - size * 8;
    ((v << shift) as i64) >> shift
}

fn mask(size: u32) -> u64 {
    if size >= 8 {
        u64::MAX
    } else {
        (1u64 << (size * 8)) - 1
    }
}

fn read_int(acc: &Accessor, addr: VAddr, size: u32, fault: &mut VAddr) -> WarpResult<u64> {
    let bytes = mem(acc.read_bytes(addr, size as usize), addr, fault)?;
    let mut raw = [0u8; 8];
    raw[..size as usize].copy_from_slice(&bytes);
    Ok(u64::from_le_bytes(raw))
}

fn write_int(acc: &Accessor, addr: VAddr, size: u32, v: u64, fault: &mut VAddr) -> WarpResult {
    mem(
        acc.write_bytes(addr, &v.to_le_bytes()[..size as usize]),
        addr,
        fault,
    )
}

fn int_binop(op: Opcode, a: u64, b: u64, size: u32, signed: bool) -> WarpResult<u64> {
    let m = mask(size);
    let shamt = (b % (size as u64 * 8)) as u32;
    let v = match op {
        Opcode::Add => a.wrapping_add(b),
        Opcode::Sub => a.wrapping_sub(b),
        Opcode::Mul => a.wrapping_mul(b),
        Opcode::Div => {
            if b & m == 0 {
                return Err(WarpError::ARITHMETIC_TRAP);
            }
            if signed {
                sext(a, size).wrapping_div(sext(b, size)) as u64
            } else {
                (a & m) / (b & m)
            }
        }
        Opcode::Rem => {
            if b & m == 0 {
                return Err(WarpError::ARITHMETIC_TRAP);
            }
            if signed {
                sext(a, size).wrapping_rem(sext(b, size)) as u64
            } else {
                (a & m) % (b & m)
            }
        }
        Opcode::And => a & b,
        Opcode::Or => a | b,
        Opcode::Xor => a ^ b,
        Opcode::Shl => a << shamt,
        Opcode::LShr => (a & m) >> shamt,
        Opcode::AShr => (sext(a, size) >> shamt) as u64,
        _ => return Err(WarpError::INVALID_OPCODE),
    };
    Ok(v & m)
}

fn int_compare(op: Opcode, a: u64, b: u64, size: u32, signed: bool) -> WarpResult<bool> {
    let (sa, sb) = (sext(a, size), sext(b, size));
    let (ua, ub) = (a & mask(size), b & mask(size));
    Ok(match op {
        Opcode::Eq => ua == ub,
        Opcode::Ne => ua != ub,
        Opcode::Lt => {
            if signed {
                sa < sb
            } else {
                ua < ub
            }
        }
        Opcode::Le => {
            if signed {
                sa <= sb
            } else {
                ua <= ub
            }
        }
        Opcode::Gt => {
            if signed {
                sa > sb
            } else {
                ua > ub
            }
        }
        Opcode::Ge => {
            if signed {
                sa >= sb
            } else {
                ua >= ub
            }
        }
        _ => return Err(WarpError::INVALID_OPCODE),
    })
}

fn float_compare(op: Opcode, a: f64, b: f64) -> WarpResult<bool> {
    Ok(match op {
        Opcode::Eq => a == b,
        Opcode::Ne => a != b,
        Opcode::Lt => a < b,
        Opcode::Le => a <= b,
        Opcode::Gt => a > b,
        Opcode::Ge => a >= b,
        _ => return Err(WarpError::INVALID_OPCODE),
    })
}

/// Execute exactly one instruction of the top frame.
fn step(
    proc: &Arc<Process>,
    acc: &Accessor,
    inner: &mut ThreadInner,
    tid: crate::ident::Vtid,
    fault: &mut VAddr,
) -> WarpResult<Step> {
    // Decode, refreshing the frame's function cache and operand
    // temporaries.
    let (func, inst, stack, pc, phi0, phi1, out) = {
        let frame = inner.frames.last_mut().ok_or(WarpError::INTERNAL)?;
        let func = match &frame.func_cache {
            Some(f) if f.addr == frame.func => f.clone(),
            _ => {
                let f = mem(proc.func_store(frame.func), frame.func, fault)?;
                frame.func_cache = Some(f.clone());
                f
            }
        };
        let inst = func.fetch(frame.pc)?.clone();
        frame.ty = inst.ty;
        frame.output = if inst.output.is_non() {
            VAddr::NON
        } else {
            resolve(frame, inst.output.0)
        };
        let out = frame.output;
        (func, inst, frame.stack, frame.pc, frame.phi0, frame.phi1, out)
    };

    match inst.op {
        Opcode::Nop => {
            advance(inner);
            Ok(Step::Done)
        }

        Opcode::Add
        | Opcode::Sub
        | Opcode::Mul
        | Opcode::Div
        | Opcode::Rem
        | Opcode::And
        | Opcode::Or
        | Opcode::Xor
        | Opcode::Shl
        | Opcode::LShr
        | Opcode::AShr => {
            let ty = proc.type_store(inst.ty)?;
            let lhs = resolve_in(inst.operands.get(0), stack)?;
            let rhs = resolve_in(inst.operands.get(1), stack)?;
            set_operand_cache(inner, lhs, rhs);
            match ty.kind {
                TypeKind::F32 => {
                    let a = mem(acc.read::<f32>(lhs), lhs, fault)?;
                    let b = mem(acc.read::<f32>(rhs), rhs, fault)?;
                    let v = float_binop32(inst.op, a, b)?;
                    mem(acc.write::<f32>(out, v), out, fault)?;
                }
                TypeKind::F64 => {
                    let a = mem(acc.read::<f64>(lhs), lhs, fault)?;
                    let b = mem(acc.read::<f64>(rhs), rhs, fault)?;
                    let v = float_binop64(inst.op, a, b)?;
                    mem(acc.write::<f64>(out, v), out, fault)?;
                }
                _ => {
                    let a = read_int(acc, lhs, ty.size, fault)?;
                    let b = read_int(acc, rhs, ty.size, fault)?;
                    let v = int_binop(inst.op, a, b, ty.size, ty.is_signed())?;
                    write_int(acc, out, ty.size, v, fault)?;
                }
            }
            advance(inner);
            Ok(Step::Done)
        }

        Opcode::Eq | Opcode::Ne | Opcode::Lt | Opcode::Le | Opcode::Gt | Opcode::Ge => {
            let ty = proc.type_store(inst.ty)?;
            let lhs = resolve_in(inst.operands.get(0), stack)?;
            let rhs = resolve_in(inst.operands.get(1), stack)?;
            set_operand_cache(inner, lhs, rhs);
            let v = if ty.is_float() {
                let a = read_float(acc, &ty, lhs, fault)?;
                let b = read_float(acc, &ty, rhs, fault)?;
                float_compare(inst.op, a, b)?
            } else {
                let a = read_int(acc, lhs, ty.size, fault)?;
                let b = read_int(acc, rhs, ty.size, fault)?;
                int_compare(inst.op, a, b, ty.size, ty.is_signed())?
            };
            mem(acc.write::<u8>(out, v as u8), out, fault)?;
            advance(inner);
            Ok(Step::Done)
        }

        Opcode::Load => {
            let ty = proc.type_store(inst.ty)?;
            let ptr_slot = resolve_in(inst.operands.get(0), stack)?;
            let ptr = mem(acc.read::<VAddr>(ptr_slot), ptr_slot, fault)?;
            if ty.is_scalar() && ptr.0 % ty.align as u64 != 0 {
                return Err(WarpError::BAD_ACCESS);
            }
            set_operand_cache(inner, VAddr::NON, ptr);
            let bytes = mem(acc.read_bytes(ptr, ty.size as usize), ptr, fault)?;
            mem(acc.write_bytes(out, &bytes), out, fault)?;
            advance(inner);
            Ok(Step::Done)
        }

        Opcode::Store => {
            let ty = proc.type_store(inst.ty)?;
            let value = resolve_in(inst.operands.get(0), stack)?;
            let ptr_slot = resolve_in(inst.operands.get(1), stack)?;
            let ptr = mem(acc.read::<VAddr>(ptr_slot), ptr_slot, fault)?;
            if ty.is_scalar() && ptr.0 % ty.align as u64 != 0 {
                return Err(WarpError::BAD_ACCESS);
            }
            set_operand_cache(inner, value, ptr);
            let bytes = mem(acc.read_bytes(value, ty.size as usize), value, fault)?;
            mem(acc.write_bytes(ptr, &bytes), ptr, fault)?;
            advance(inner);
            Ok(Step::Done)
        }

        Opcode::Alloca => {
            let ty = proc.type_store(inst.ty)?;
            let count = inst.operands.get(0).copied().unwrap_or(1).max(1);
            let watermark = mem(acc.read::<u64>(stack), stack, fault)?;
            let at = align_up(watermark, ty.align.max(1) as u64);
            let next = at + ty.size as u64 * count;
            if next > func.stack_size as u64 {
                return Err(WarpError::BAD_ACCESS);
            }
            mem(acc.write::<u64>(stack, next), stack, fault)?;
            mem(acc.write::<VAddr>(out, stack.add(at)), out, fault)?;
            advance(inner);
            Ok(Step::Done)
        }

        Opcode::Br => {
            let target = *inst.operands.get(0).ok_or(WarpError::INVALID_OPCODE)? as u32;
            branch(inner, target);
            Ok(Step::Done)
        }

        Opcode::BrCond => {
            let cond_slot = resolve_in(inst.operands.get(0), stack)?;
            let cond = mem(acc.read::<u8>(cond_slot), cond_slot, fault)?;
            let then_blk = *inst.operands.get(1).ok_or(WarpError::INVALID_OPCODE)? as u32;
            let else_blk = *inst.operands.get(2).ok_or(WarpError::INVALID_OPCODE)? as u32;
            branch(inner, if cond != 0 { then_blk } else { else_blk });
            Ok(Step::Done)
        }

        Opcode::Switch => {
            let ty = proc.type_store(inst.ty)?;
            let val_slot = resolve_in(inst.operands.get(0), stack)?;
            let v = read_int(acc, val_slot, ty.size, fault)? & mask(ty.size);
            let default_blk = *inst.operands.get(1).ok_or(WarpError::INVALID_OPCODE)? as u32;
            let mut target = default_blk;
            for pair in inst.operands[2..].chunks(2) {
                if pair.len() == 2 && pair[0] & mask(ty.size) == v {
                    target = pair[1] as u32;
                    break;
                }
            }
            branch(inner, target);
            Ok(Step::Done)
        }

        Opcode::Phi => {
            let ty = proc.type_store(inst.ty)?;
            let mut chosen = None;
            for pair in inst.operands.chunks(2) {
                if pair.len() == 2 && pair[0] as u32 == phi0 {
                    chosen = Some(pair[1]);
                    break;
                }
            }
            if chosen.is_none() {
                for pair in inst.operands.chunks(2) {
                    if pair.len() == 2 && pair[0] as u32 == phi1 {
                        chosen = Some(pair[1]);
                        break;
                    }
                }
            }
            let src = resolve_in(chosen.as_ref(), stack)?;
            let bytes = mem(acc.read_bytes(src, ty.size as usize), src, fault)?;
            mem(acc.write_bytes(out, &bytes), out, fault)?;
            advance(inner);
            Ok(Step::Done)
        }

        Opcode::Call => do_call(proc, acc, inner, tid, &inst, stack, pc, out, false, fault),
        Opcode::Invoke => do_call(proc, acc, inner, tid, &inst, stack, pc, out, true, fault),

        Opcode::Ret => {
            if let Some(operand) = inst.operands.get(0) {
                let ty = proc.type_store(inst.ty)?;
                let src = resolve_in(Some(operand), stack)?;
                let ret_addr = inner.frames.last().map(|f| f.ret_addr).unwrap_or(VAddr::NON);
                if !ret_addr.is_non() {
                    let bytes = mem(acc.read_bytes(src, ty.size as usize), src, fault)?;
                    mem(acc.write_bytes(ret_addr, &bytes), ret_addr, fault)?;
                }
            }
            let popped = inner.frames.pop().ok_or(WarpError::INTERNAL)?;
            let _ = acc.free(popped.stack);
            if !popped.var_arg.is_non() {
                let _ = acc.free(popped.var_arg);
            }
            if inner.frames.is_empty() {
                Ok(Step::Finished)
            } else {
                let top = inner.frames.last_mut().ok_or(WarpError::INTERNAL)?;
                top.pc = popped.normal_pc;
                Ok(Step::Done)
            }
        }

        Opcode::Resume => {
            if raise(acc, inner) {
                Ok(Step::Done)
            } else {
                Err(WarpError::INTERNAL)
            }
        }

        Opcode::ExtractValue => {
            let agg_ty = proc.type_store(inst.ty)?;
            let src = resolve_in(inst.operands.get(0), stack)?;
            let (offset, leaf) = walk_aggregate(proc, &agg_ty, &inst.operands[1..])?;
            let bytes = mem(
                acc.read_bytes(src.add(offset as u64), leaf.size as usize),
                src,
                fault,
            )?;
            mem(acc.write_bytes(out, &bytes), out, fault)?;
            advance(inner);
            Ok(Step::Done)
        }

        Opcode::InsertValue => {
            let agg_ty = proc.type_store(inst.ty)?;
            let src = resolve_in(inst.operands.get(0), stack)?;
            let value = resolve_in(inst.operands.get(1), stack)?;
            let (offset, leaf) = walk_aggregate(proc, &agg_ty, &inst.operands[2..])?;
            let agg_bytes = mem(acc.read_bytes(src, agg_ty.size as usize), src, fault)?;
            let val_bytes = mem(acc.read_bytes(value, leaf.size as usize), value, fault)?;
            if out != src {
                mem(acc.write_bytes(out, &agg_bytes), out, fault)?;
            }
            mem(acc.write_bytes(out.add(offset as u64), &val_bytes), out, fault)?;
            advance(inner);
            Ok(Step::Done)
        }

        Opcode::Cast => {
            let dst_ty = proc.type_store(inst.ty)?;
            let src_ty =
                proc.type_store(VAddr(*inst.operands.get(0).ok_or(WarpError::INVALID_OPCODE)?))?;
            let src = resolve_in(inst.operands.get(1), stack)?;
            do_cast(acc, &dst_ty, &src_ty, src, out, fault)?;
            advance(inner);
            Ok(Step::Done)
        }
    }
}

fn float_binop32(op: Opcode, a: f32, b: f32) -> WarpResult<f32> {
    Ok(match op {
        Opcode::Add => a + b,
        Opcode::Sub => a - b,
        Opcode::Mul => a * b,
        Opcode::Div => a / b,
        Opcode::Rem => a % b,
        _ => return Err(WarpError::INVALID_OPCODE),
    })
}

fn float_binop64(op: Opcode, a: f64, b: f64) -> WarpResult<f64> {
    Ok(match op {
        Opcode::Add => a + b,
        Opcode::Sub => a - b,
        Opcode::Mul => a * b,
        Opcode::Div => a / b,
        Opcode::Rem => a % b,
        _ => return Err(WarpError::INVALID_OPCODE),
    })
}

fn read_float(acc: &Accessor, ty: &TypeStore, addr: VAddr, fault: &mut VAddr) -> WarpResult<f64> {
    Ok(match ty.kind {
        TypeKind::F32 => mem(acc.read::<f32>(addr), addr, fault)? as f64,
        _ => mem(acc.read::<f64>(addr), addr, fault)?,
    })
}

/// Resolve an optional operand against the current frame's stack page.
fn resolve_in(operand: Option<&u64>, stack: VAddr) -> WarpResult<VAddr> {
    let operand = *operand.ok_or(WarpError::INVALID_OPCODE)?;
    let a = VAddr(operand);
    Ok(if a.is_frame_slot() {
        stack.add(a.offset())
    } else {
        a
    })
}

/// Record the resolved value/address operands in the frame temporaries.
fn set_operand_cache(inner: &mut ThreadInner, value: VAddr, address: VAddr) {
    if let Some(frame) = inner.frames.last_mut() {
        frame.value = value;
        frame.address = address;
    }
}

/// Index through struct fields and array elements to a leaf.
fn walk_aggregate(
    proc: &Arc<Process>,
    agg: &Arc<TypeStore>,
    indices: &[u64],
) -> WarpResult<(u32, Arc<TypeStore>)> {
    let mut ty = agg.clone();
    let mut offset = 0u32;
    for idx in indices {
        let idx = *idx as u32;
        match &ty.kind {
            TypeKind::Struct { fields } => {
                let (field_ty, field_off) = fields
                    .get(idx as usize)
                    .copied()
                    .ok_or(WarpError::OUT_OF_RANGE)?;
                offset += field_off;
                ty = proc.type_store(field_ty)?;
            }
            TypeKind::Array { elem, len, stride } => {
                if idx >= *len {
                    return Err(WarpError::OUT_OF_RANGE);
                }
                offset += idx * stride;
                ty = proc.type_store(*elem)?;
            }
            _ => return Err(WarpError::INVALID_TYPE),
        }
    }
    Ok((offset, ty))
}

fn do_cast(
    acc: &Accessor,
    dst_ty: &Arc<TypeStore>,
    src_ty: &Arc<TypeStore>,
    src: VAddr,
    out: VAddr,
    fault: &mut VAddr,
) -> WarpResult {
    if dst_ty.is_float() {
        let v = if src_ty.is_float() {
            read_float(acc, src_ty, src, fault)?
        } else {
            let raw = read_int(acc, src, src_ty.size, fault)?;
            if src_ty.is_signed() {
                sext(raw, src_ty.size) as f64
            } else {
                (raw & mask(src_ty.size)) as f64
            }
        };
        match dst_ty.kind {
            TypeKind::F32 => mem(acc.write::<f32>(out, v as f32), out, fault),
            _ => mem(acc.write::<f64>(out, v), out, fault),
        }
    } else {
        let v = if src_ty.is_float() {
            let f = read_float(acc, src_ty, src, fault)?;
            if dst_ty.is_signed() {
                (f as i64) as u64
            } else {
                f as u64
            }
        } else {
            let raw = read_int(acc, src, src_ty.size, fault)?;
            if src_ty.is_signed() {
                sext(raw, src_ty.size) as u64
            } else {
                raw & mask(src_ty.size)
            }
        };
        write_int(acc, out, dst_ty.size, v & mask(dst_ty.size), fault)
    }
}

/// Shared body of `Call` and `Invoke`.
///
/// Call operands: `[callee, (ty, value)...]`.
/// Invoke operands: `[callee, normal_block, unwind_block, (ty, value)...]`.
#[allow(clippy::too_many_arguments)]
fn do_call(
    proc: &Arc<Process>,
    acc: &Accessor,
    inner: &mut ThreadInner,
    tid: crate::ident::Vtid,
    inst: &Instruction,
    stack: VAddr,
    pc: u64,
    out: VAddr,
    is_invoke: bool,
    fault: &mut VAddr,
) -> WarpResult<Step> {
    let callee_operand = VAddr(*inst.operands.get(0).ok_or(WarpError::INVALID_OPCODE)?);
    let args_from = if is_invoke { 3 } else { 1 };
    let callee = if callee_operand.class() == AddrClass::Function {
        callee_operand
    } else {
        let slot = resolve_in(inst.operands.get(0), stack)?;
        mem(acc.read::<VAddr>(slot), slot, fault)?
    };
    let func = mem(proc.func_store(callee), callee, fault)?;

    // Read every argument before committing anything.
    let pairs = inst.operands[args_from.min(inst.operands.len())..].chunks(2);
    let mut args: Vec<(Arc<TypeStore>, Vec<u8>)> = Vec::new();
    for pair in pairs {
        if pair.len() != 2 {
            return Err(WarpError::INVALID_OPCODE);
        }
        let ty = proc.type_store(VAddr(pair[0]))?;
        let src = resolve_in(Some(&pair[1]), stack)?;
        let bytes = mem(acc.read_bytes(src, ty.size as usize), src, fault)?;
        args.push((ty, bytes));
    }

    match func.kind {
        FuncKind::Normal => {
            let declared = func.param_types.len();
            if args.len() < declared {
                return Err(WarpError::INVALID_ARGS);
            }
            let mut frame = proc.push_activation(&func, out)?;
            for (i, (_, bytes)) in args.iter().take(declared).enumerate() {
                acc.write_bytes(frame.stack.add(func.param_offsets[i] as u64), bytes)?;
            }
            if func.is_var_arg && args.len() > declared {
                let mut packed = Vec::new();
                for (_, bytes) in args.iter().skip(declared) {
                    builtin::push_param(&mut packed, bytes);
                }
                let var_page = acc.alloc(AddrClass::Array, packed.len())?;
                acc.write_bytes(var_page, &packed)?;
                frame.var_arg = var_page;
            }
            if is_invoke {
                let normal_blk = *inst.operands.get(1).ok_or(WarpError::INVALID_OPCODE)? as u32;
                let unwind_blk = *inst.operands.get(2).ok_or(WarpError::INVALID_OPCODE)? as u32;
                frame.normal_pc = pack_pc(normal_blk, 0);
                frame.unwind_pc = pack_pc(unwind_blk, 0);
                // Control re-enters the caller at a block head either way;
                // the predecessor is the invoking block.
                let top = inner.frames.last_mut().ok_or(WarpError::INTERNAL)?;
                top.phi1 = top.phi0;
                top.phi0 = pc_block(pc);
            } else {
                frame.normal_pc = pack_pc(pc_block(pc), pc_index(pc) + 1);
                frame.unwind_pc = 0;
            }
            trace!("{}: call {} depth {}", tid, func.name, inner.frames.len() + 1);
            inner.frames.push(frame);
            Ok(Step::Done)
        }
        FuncKind::Builtin => {
            let mut buf = Vec::new();
            for (_, bytes) in &args {
                builtin::push_param(&mut buf, bytes);
            }
            let entry = proc
                .builtins()
                .resolve(&func.name)
                .ok_or(WarpError::NOT_SUPPORTED)?;
            let post = {
                let mut ctx = BuiltinContext {
                    proc,
                    tid,
                    thread: &mut *inner,
                };
                (entry.func)(&mut ctx, &entry.param, out, &buf)?
            };
            match post {
                PostProc::Normal => {
                    advance(inner);
                    Ok(Step::Done)
                }
                PostProc::Wait | PostProc::Retry => Ok(Step::Wait),
                PostProc::FinishThread => Ok(Step::FinishThread),
            }
        }
        FuncKind::External => {
            // The filter table maps application names to host names, but
            // marshalling across the FFI boundary is host-specific and
            // not part of the portable core.
            match proc.lib_filter(&func.name) {
                Some(host_name) => {
                    warn!("ffi call {} -> {} not dispatched", func.name, host_name);
                }
                None => {
                    warn!("ffi call {} not whitelisted", func.name);
                }
            }
            Err(WarpError::NOT_SUPPORTED)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ident::{NodeId, Vpid};
    use crate::interp::types::{TYPE_I32, TYPE_I64, TYPE_PTR, TYPE_U8};
    use crate::interp::FuncBuilder;
    use crate::memory::{MemoryDelegate, MemoryMessage, VMemory};
    use crate::task::{TickStatus, DEFAULT_QUANTUM};

    struct NullDelegate;
    impl MemoryDelegate for NullDelegate {
        fn memory_send(&self, _pid: &Vpid, _dst: NodeId, _msg: MemoryMessage) {}
    }

    fn local_process() -> Arc<Process> {
        let nid = NodeId::from_raw(2);
        let memory = VMemory::new(nid, Vpid::new("t"), nid, Arc::new(NullDelegate));
        Process::create(Vpid::new("t"), nid, memory)
    }

    fn install(proc: &Arc<Process>, b: &FuncBuilder) -> VAddr {
        let acc = proc.accessor();
        let bytes = b.encode();
        let page = acc.alloc(AddrClass::Function, bytes.len()).unwrap();
        acc.write_bytes(page, &bytes).unwrap();
        page
    }

    fn cell(proc: &Arc<Process>, bytes: &[u8]) -> VAddr {
        let acc = proc.accessor();
        let page = acc.alloc(AddrClass::Pod, bytes.len()).unwrap();
        acc.write_bytes(page, bytes).unwrap();
        page
    }

    /// Run a fresh thread of `func` to completion.
    fn run(proc: &Arc<Process>, func: VAddr) -> TickStatus {
        proc.create_thread(func, &[]).unwrap();
        for _ in 0..1000 {
            match proc.tick(DEFAULT_QUANTUM) {
                TickStatus::Running | TickStatus::Idle => {}
                done => return done,
            }
        }
        panic!("thread did not settle");
    }

    #[test]
    fn arithmetic_chain() {
        let proc = local_process();
        let c7 = cell(&proc, &7i32.to_le_bytes());
        let c6 = cell(&proc, &6i32.to_le_bytes());
        let c2 = cell(&proc, &2i32.to_le_bytes());
        let c4 = cell(&proc, &4i32.to_le_bytes());
        let out = cell(&proc, &[0u8; 4]);

        // out = (7 * 6 - 2) / 4 = 10
        let mut b = FuncBuilder::new("arith");
        let t0 = b.slot(TYPE_I32);
        let t1 = b.slot(TYPE_I32);
        b.push(Opcode::Mul, TYPE_I32, t0, &[c7.0, c6.0]);
        b.push(Opcode::Sub, TYPE_I32, t1, &[t0.0, c2.0]);
        b.push(Opcode::Div, TYPE_I32, out, &[t1.0, c4.0]);
        b.push(Opcode::Ret, VAddr::NON, VAddr::NON, &[]);
        let func = install(&proc, &b);

        assert_eq!(run(&proc, func), TickStatus::Finish);
        assert_eq!(proc.accessor().read::<i32>(out).unwrap(), 10);
    }

    #[test]
    fn signed_division_semantics() {
        let proc = local_process();
        let a = cell(&proc, &(-9i32).to_le_bytes());
        let bq = cell(&proc, &2i32.to_le_bytes());
        let out = cell(&proc, &[0u8; 4]);

        let mut b = FuncBuilder::new("sdiv");
        b.push(Opcode::Div, TYPE_I32, out, &[a.0, bq.0]);
        b.push(Opcode::Ret, VAddr::NON, VAddr::NON, &[]);
        let func = install(&proc, &b);
        assert_eq!(run(&proc, func), TickStatus::Finish);
        assert_eq!(proc.accessor().read::<i32>(out).unwrap(), -4);
    }

    #[test]
    fn loop_with_phi() {
        let proc = local_process();
        let zero = cell(&proc, &0i32.to_le_bytes());
        let one = cell(&proc, &1i32.to_le_bytes());
        let limit = cell(&proc, &5i32.to_le_bytes());
        let out = cell(&proc, &[0u8; 4]);
        let out_ptr = cell(&proc, &out.0.to_le_bytes());

        // i = 0; sum = 0; while i < 5 { i += 1; sum += i }; *out = sum
        let mut b = FuncBuilder::new("loop");
        let i = b.slot(TYPE_I32);
        let sum = b.slot(TYPE_I32);
        let i_next = b.slot(TYPE_I32);
        let sum_next = b.slot(TYPE_I32);
        let again = b.slot(TYPE_U8);
        let head = b.new_block();
        let body = b.new_block();
        let done = b.new_block();
        b.push(Opcode::Br, VAddr::NON, VAddr::NON, &[head as u64]);
        b.select(head);
        // φ picks the value matching the block just branched from.
        b.push(Opcode::Phi, TYPE_I32, i, &[0, zero.0, body as u64, i_next.0]);
        b.push(Opcode::Phi, TYPE_I32, sum, &[0, zero.0, body as u64, sum_next.0]);
        b.push(Opcode::Lt, TYPE_I32, again, &[i.0, limit.0]);
        b.push(
            Opcode::BrCond,
            VAddr::NON,
            VAddr::NON,
            &[again.0, body as u64, done as u64],
        );
        b.select(body);
        b.push(Opcode::Add, TYPE_I32, i_next, &[i.0, one.0]);
        b.push(Opcode::Add, TYPE_I32, sum_next, &[sum.0, i_next.0]);
        b.push(Opcode::Br, VAddr::NON, VAddr::NON, &[head as u64]);
        b.select(done);
        b.push(Opcode::Store, TYPE_I32, VAddr::NON, &[sum.0, out_ptr.0]);
        b.push(Opcode::Ret, VAddr::NON, VAddr::NON, &[]);
        let func = install(&proc, &b);

        assert_eq!(run(&proc, func), TickStatus::Finish);
        assert_eq!(proc.accessor().read::<i32>(out).unwrap(), 15);
    }

    #[test]
    fn call_writes_through_output() {
        let proc = local_process();
        let c30 = cell(&proc, &30i64.to_le_bytes());
        let c12 = cell(&proc, &12i64.to_le_bytes());
        let out = cell(&proc, &[0u8; 8]);
        let out_ptr = cell(&proc, &out.0.to_le_bytes());

        let mut h = FuncBuilder::new("add2");
        let x = h.param(TYPE_I64);
        let y = h.param(TYPE_I64);
        let r = h.slot(TYPE_I64);
        h.push(Opcode::Add, TYPE_I64, r, &[x.0, y.0]);
        h.push(Opcode::Ret, TYPE_I64, VAddr::NON, &[r.0]);
        let helper = install(&proc, &h);

        let mut b = FuncBuilder::new("main");
        let r = b.slot(TYPE_I64);
        b.push(
            Opcode::Call,
            VAddr::NON,
            r,
            &[helper.0, TYPE_I64.0, c30.0, TYPE_I64.0, c12.0],
        );
        b.push(Opcode::Store, TYPE_I64, VAddr::NON, &[r.0, out_ptr.0]);
        b.push(Opcode::Ret, VAddr::NON, VAddr::NON, &[]);
        let func = install(&proc, &b);

        assert_eq!(run(&proc, func), TickStatus::Finish);
        assert_eq!(proc.accessor().read::<i64>(out).unwrap(), 42);
    }

    #[test]
    fn indirect_call_through_pointer() {
        let proc = local_process();
        let c1 = cell(&proc, &1i64.to_le_bytes());
        let c2 = cell(&proc, &2i64.to_le_bytes());
        let out = cell(&proc, &[0u8; 8]);
        let out_ptr = cell(&proc, &out.0.to_le_bytes());

        let mut h = FuncBuilder::new("add2");
        let x = h.param(TYPE_I64);
        let y = h.param(TYPE_I64);
        let r = h.slot(TYPE_I64);
        h.push(Opcode::Add, TYPE_I64, r, &[x.0, y.0]);
        h.push(Opcode::Ret, TYPE_I64, VAddr::NON, &[r.0]);
        let helper = install(&proc, &h);
        let fn_ptr = cell(&proc, &helper.0.to_le_bytes());

        let mut b = FuncBuilder::new("main");
        let r = b.slot(TYPE_I64);
        b.push(
            Opcode::Call,
            VAddr::NON,
            r,
            &[fn_ptr.0, TYPE_I64.0, c1.0, TYPE_I64.0, c2.0],
        );
        b.push(Opcode::Store, TYPE_I64, VAddr::NON, &[r.0, out_ptr.0]);
        b.push(Opcode::Ret, VAddr::NON, VAddr::NON, &[]);
        let func = install(&proc, &b);

        assert_eq!(run(&proc, func), TickStatus::Finish);
        assert_eq!(proc.accessor().read::<i64>(out).unwrap(), 3);
    }

    #[test]
    fn divide_by_zero_unwinds_to_landing_pad() {
        let proc = local_process();
        let c1 = cell(&proc, &1i32.to_le_bytes());
        let c0 = cell(&proc, &0i32.to_le_bytes());
        let marker = cell(&proc, &[0u8; 4]);
        let marker_ptr = cell(&proc, &marker.0.to_le_bytes());
        let c42 = cell(&proc, &42i32.to_le_bytes());

        let mut h = FuncBuilder::new("boom");
        let r = h.slot(TYPE_I32);
        h.push(Opcode::Div, TYPE_I32, r, &[c1.0, c0.0]);
        h.push(Opcode::Ret, TYPE_I32, VAddr::NON, &[r.0]);
        let boom = install(&proc, &h);

        let mut b = FuncBuilder::new("main");
        let r = b.slot(TYPE_I32);
        let normal = b.new_block();
        let pad = b.new_block();
        b.push(
            Opcode::Invoke,
            VAddr::NON,
            r,
            &[boom.0, normal as u64, pad as u64],
        );
        b.select(normal);
        b.push(Opcode::Ret, VAddr::NON, VAddr::NON, &[]);
        b.select(pad);
        b.push(Opcode::Store, TYPE_I32, VAddr::NON, &[c42.0, marker_ptr.0]);
        b.push(Opcode::Ret, VAddr::NON, VAddr::NON, &[]);
        let func = install(&proc, &b);

        assert_eq!(run(&proc, func), TickStatus::Finish);
        assert_eq!(proc.accessor().read::<i32>(marker).unwrap(), 42);
    }

    #[test]
    fn unhandled_trap_fails_the_thread() {
        let proc = local_process();
        let c1 = cell(&proc, &1i32.to_le_bytes());
        let c0 = cell(&proc, &0i32.to_le_bytes());

        let mut b = FuncBuilder::new("boom");
        let r = b.slot(TYPE_I32);
        b.push(Opcode::Div, TYPE_I32, r, &[c1.0, c0.0]);
        b.push(Opcode::Ret, VAddr::NON, VAddr::NON, &[]);
        let func = install(&proc, &b);

        assert_eq!(run(&proc, func), TickStatus::Error);
    }

    #[test]
    fn switch_selects_case() {
        let proc = local_process();
        let sel = cell(&proc, &2i32.to_le_bytes());
        let out = cell(&proc, &[0u8; 4]);
        let out_ptr = cell(&proc, &out.0.to_le_bytes());
        let c_a = cell(&proc, &10i32.to_le_bytes());
        let c_b = cell(&proc, &20i32.to_le_bytes());
        let c_d = cell(&proc, &99i32.to_le_bytes());

        let mut b = FuncBuilder::new("switch");
        let case_a = b.new_block();
        let case_b = b.new_block();
        let fallback = b.new_block();
        let done = b.new_block();
        b.push(
            Opcode::Switch,
            TYPE_I32,
            VAddr::NON,
            &[sel.0, fallback as u64, 1, case_a as u64, 2, case_b as u64],
        );
        b.select(case_a);
        b.push(Opcode::Store, TYPE_I32, VAddr::NON, &[c_a.0, out_ptr.0]);
        b.push(Opcode::Br, VAddr::NON, VAddr::NON, &[done as u64]);
        b.select(case_b);
        b.push(Opcode::Store, TYPE_I32, VAddr::NON, &[c_b.0, out_ptr.0]);
        b.push(Opcode::Br, VAddr::NON, VAddr::NON, &[done as u64]);
        b.select(fallback);
        b.push(Opcode::Store, TYPE_I32, VAddr::NON, &[c_d.0, out_ptr.0]);
        b.push(Opcode::Br, VAddr::NON, VAddr::NON, &[done as u64]);
        b.select(done);
        b.push(Opcode::Ret, VAddr::NON, VAddr::NON, &[]);
        let func = install(&proc, &b);

        assert_eq!(run(&proc, func), TickStatus::Finish);
        assert_eq!(proc.accessor().read::<i32>(out).unwrap(), 20);
    }

    #[test]
    fn alloca_load_store() {
        let proc = local_process();
        let c9 = cell(&proc, &9i64.to_le_bytes());
        let out = cell(&proc, &[0u8; 8]);
        let out_ptr = cell(&proc, &out.0.to_le_bytes());

        let mut b = FuncBuilder::new("alloca");
        let p = b.slot(TYPE_PTR);
        let t = b.slot(TYPE_I64);
        b.push(Opcode::Alloca, TYPE_I64, p, &[1]);
        b.push(Opcode::Store, TYPE_I64, VAddr::NON, &[c9.0, p.0]);
        b.push(Opcode::Load, TYPE_I64, t, &[p.0]);
        b.push(Opcode::Store, TYPE_I64, VAddr::NON, &[t.0, out_ptr.0]);
        b.push(Opcode::Ret, VAddr::NON, VAddr::NON, &[]);
        let func = install(&proc, &b);

        assert_eq!(run(&proc, func), TickStatus::Finish);
        assert_eq!(proc.accessor().read::<i64>(out).unwrap(), 9);
    }

    #[test]
    fn cast_int_widths() {
        let proc = local_process();
        let src = cell(&proc, &(-3i32).to_le_bytes());
        let out = cell(&proc, &[0u8; 8]);

        let mut b = FuncBuilder::new("cast");
        b.push(Opcode::Cast, TYPE_I64, VAddr(out.0), &[TYPE_I32.0, src.0]);
        b.push(Opcode::Ret, VAddr::NON, VAddr::NON, &[]);
        let func = install(&proc, &b);

        assert_eq!(run(&proc, func), TickStatus::Finish);
        assert_eq!(proc.accessor().read::<i64>(out).unwrap(), -3);
    }

    #[test]
    fn aggregate_extract_insert() {
        let proc = local_process();
        // struct { i32, i64 } with explicit offsets.
        let ty = crate::interp::TypeStore {
            addr: VAddr::build(AddrClass::Type, NodeId::from_raw(2).alloc_salt(), 0),
            kind: crate::interp::TypeKind::Struct {
                fields: vec![(TYPE_I32, 0), (TYPE_I64, 8)],
            },
            size: 16,
            align: 8,
        };
        let acc = proc.accessor();
        let encoded = ty.encode();
        let ty_page = acc.alloc(AddrClass::Type, encoded.len()).unwrap();
        acc.write_bytes(ty_page, &encoded).unwrap();

        let mut agg_init = [0u8; 16];
        agg_init[0..4].copy_from_slice(&7i32.to_le_bytes());
        agg_init[8..16].copy_from_slice(&5i64.to_le_bytes());
        let agg = cell(&proc, &agg_init);
        let c11 = cell(&proc, &11i64.to_le_bytes());
        let out = cell(&proc, &[0u8; 8]);

        let mut b = FuncBuilder::new("agg");
        // agg.1 = 11, then out = agg.1
        b.push(Opcode::InsertValue, ty_page, VAddr(agg.0), &[agg.0, c11.0, 1]);
        b.push(Opcode::ExtractValue, ty_page, VAddr(out.0), &[agg.0, 1]);
        b.push(Opcode::Ret, VAddr::NON, VAddr::NON, &[]);
        let func = install(&proc, &b);

        assert_eq!(run(&proc, func), TickStatus::Finish);
        assert_eq!(proc.accessor().read::<i64>(out).unwrap(), 11);
        assert_eq!(proc.accessor().read::<i32>(agg).unwrap(), 7);
    }

    #[test]
    fn exit_builtin_finishes_the_process() {
        let proc = local_process();
        let acc = proc.accessor();
        let code = cell(&proc, &7i32.to_le_bytes());
        let exit_page = {
            let bytes = FuncBuilder::encode_builtin("exit");
            let page = acc.alloc(AddrClass::Function, bytes.len()).unwrap();
            acc.write_bytes(page, &bytes).unwrap();
            page
        };

        let mut b = FuncBuilder::new("main");
        b.push(Opcode::Call, VAddr::NON, VAddr::NON, &[exit_page.0, TYPE_I32.0, code.0]);
        // Never reached.
        b.push(Opcode::Ret, VAddr::NON, VAddr::NON, &[]);
        let func = install(&proc, &b);

        // The exit code cell is named by the control block.
        let result = acc.alloc(AddrClass::Pod, 8).unwrap();
        let pcb_bytes = crate::task::encode_control_block(func, result);
        let pcb = acc.alloc(AddrClass::ProcCtrl, pcb_bytes.len()).unwrap();
        acc.write_bytes(pcb, &pcb_bytes).unwrap();
        proc.activate(1, pcb);

        // The root thread starts from the control block on the first tick.
        let mut status = TickStatus::Idle;
        for _ in 0..100 {
            status = proc.tick(DEFAULT_QUANTUM);
            if !matches!(status, TickStatus::Running | TickStatus::Idle) {
                break;
            }
        }
        assert_eq!(status, TickStatus::Finish);
        assert_eq!(proc.exit_code().unwrap(), 7);
    }

    #[test]
    fn fork_builtin_spawns_a_thread() {
        let proc = local_process();
        let acc = proc.accessor();
        let out = cell(&proc, &[0u8; 8]);
        let out_ptr = cell(&proc, &out.0.to_le_bytes());
        let arg = cell(&proc, &21i64.to_le_bytes());

        // child(x): *out = x * 2
        let two = cell(&proc, &2i64.to_le_bytes());
        let mut h = FuncBuilder::new("child");
        let x = h.param(crate::interp::TYPE_I64);
        let d = h.slot(TYPE_I64);
        h.push(Opcode::Mul, TYPE_I64, d, &[x.0, two.0]);
        h.push(Opcode::Store, TYPE_I64, VAddr::NON, &[d.0, out_ptr.0]);
        h.push(Opcode::Ret, VAddr::NON, VAddr::NON, &[]);
        let child = install(&proc, &h);
        let child_ptr = cell(&proc, &child.0.to_le_bytes());

        let fork_page = {
            let bytes = FuncBuilder::encode_builtin("processwarp.fork");
            let page = acc.alloc(AddrClass::Function, bytes.len()).unwrap();
            acc.write_bytes(page, &bytes).unwrap();
            page
        };

        let mut b = FuncBuilder::new("main");
        let tid = b.slot(TYPE_I64);
        b.push(
            Opcode::Call,
            VAddr::NON,
            tid,
            &[fork_page.0, TYPE_PTR.0, child_ptr.0, TYPE_I64.0, arg.0],
        );
        b.push(Opcode::Ret, VAddr::NON, VAddr::NON, &[]);
        let func = install(&proc, &b);

        assert_eq!(run(&proc, func), TickStatus::Finish);
        assert_eq!(proc.accessor().read::<i64>(out).unwrap(), 42);
    }

    #[test]
    fn quantum_bounds_a_slice() {
        let proc = local_process();
        let mut b = FuncBuilder::new("spin");
        let head = b.new_block();
        b.push(Opcode::Br, VAddr::NON, VAddr::NON, &[head as u64]);
        b.select(head);
        b.push(Opcode::Nop, VAddr::NON, VAddr::NON, &[]);
        b.push(Opcode::Br, VAddr::NON, VAddr::NON, &[head as u64]);
        let func = install(&proc, &b);

        let tid = proc.create_thread(func, &[]).unwrap();
        let thread = proc.thread(tid).unwrap();
        match execute(&proc, &thread, 16) {
            Yield::Quantum => {}
            _ => panic!("expected quantum expiry"),
        }
        // The thread is still runnable and resumes where it left off.
        assert_eq!(thread.status(), crate::task::ThreadStatus::Normal);
    }
}
