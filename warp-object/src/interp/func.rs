//! Function pages: the on-page code format, its decoder, and the
//! builder used by loaders and tests to produce it.
//!
//! A function is a sequence of basic blocks, each a sequence of
//! instructions. The encoded form lives in a page of class `Function`
//! and is decoded once per node into a [`FuncStore`], cached by the
//! process (the cache is a non-owning index; the page stays the source
//! of truth and replicates like any other page).

use super::opcode::{Instruction, Opcode};
use super::types::primitive_type;
use crate::memory::{VAddr, STACK_PAGE_SIZE};
use crate::task::{pc_block, pc_index};
use crate::{WarpError, WarpResult};
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use byteorder::{ByteOrder, LittleEndian};
use core::convert::TryFrom;

/// Magic of an encoded function page.
pub const FUNC_MAGIC: u32 = 0x5057_464e; // "PWFN"

/// Offset of the first register slot in a stack page. The first eight
/// bytes hold the alloca watermark so it travels with the page.
pub const STACK_REG_BASE: u32 = 8;

/// How a function executes.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum FuncKind {
    /// Interpreted basic blocks.
    Normal,
    /// Dispatched through the builtin registry by name.
    Builtin,
    /// Foreign function; resolved through the library filter.
    External,
}

/// A decoded function.
pub struct FuncStore {
    pub addr: VAddr,
    pub name: String,
    pub kind: FuncKind,
    pub param_types: Vec<VAddr>,
    /// Stack-page offset of each parameter slot.
    pub param_offsets: Vec<u32>,
    pub is_var_arg: bool,
    /// Bytes of the register area, starting at `STACK_REG_BASE`.
    pub reg_size: u32,
    /// Stack page length to allocate per activation.
    pub stack_size: u32,
    pub blocks: Vec<Vec<Instruction>>,
}

impl FuncStore {
    /// Decode a function page.
    pub fn decode(addr: VAddr, bytes: &[u8]) -> WarpResult<Arc<Self>> {
        let mut r = Reader::new(bytes);
        if r.u32()? != FUNC_MAGIC {
            return Err(WarpError::INVALID_OPCODE);
        }
        let kind = match r.u8()? {
            0 => FuncKind::Normal,
            1 => FuncKind::Builtin,
            2 => FuncKind::External,
            _ => return Err(WarpError::INVALID_OPCODE),
        };
        let is_var_arg = r.u8()? != 0;
        let param_count = r.u16()? as usize;
        let name_len = r.u16()? as usize;
        let name = String::from_utf8(r.bytes(name_len)?.to_vec())
            .map_err(|_| WarpError::INVALID_OPCODE)?;
        let reg_size = r.u32()?;
        let stack_size = r.u32()?;
        let mut param_types = Vec::with_capacity(param_count);
        for _ in 0..param_count {
            param_types.push(VAddr(r.u64()?));
        }
        let param_offsets = param_layout(&param_types)?;
        let block_count = r.u32()? as usize;
        let mut blocks = Vec::with_capacity(block_count);
        for _ in 0..block_count {
            let inst_count = r.u32()? as usize;
            let mut block = Vec::with_capacity(inst_count);
            for _ in 0..inst_count {
                let op = Opcode::try_from(r.u8()?).map_err(|_| WarpError::INVALID_OPCODE)?;
                let operand_count = r.u16()? as usize;
                let ty = VAddr(r.u64()?);
                let output = VAddr(r.u64()?);
                let mut operands = Vec::with_capacity(operand_count);
                for _ in 0..operand_count {
                    operands.push(r.u64()?);
                }
                block.push(Instruction {
                    op,
                    ty,
                    output,
                    operands,
                });
            }
            blocks.push(block);
        }
        Ok(Arc::new(FuncStore {
            addr,
            name,
            kind,
            param_types,
            param_offsets,
            is_var_arg,
            reg_size,
            stack_size,
            blocks,
        }))
    }

    /// The instruction at a packed pc.
    pub fn fetch(&self, pc: u64) -> WarpResult<&Instruction> {
        self.blocks
            .get(pc_block(pc) as usize)
            .and_then(|b| b.get(pc_index(pc) as usize))
            .ok_or(WarpError::INVALID_OPCODE)
    }
}

/// Parameter slots are assigned from `STACK_REG_BASE` upward, each
/// aligned to its own width. Loaders and the decoder must agree on this.
fn param_layout(param_types: &[VAddr]) -> WarpResult<Vec<u32>> {
    let mut offsets = Vec::with_capacity(param_types.len());
    let mut cursor = STACK_REG_BASE;
    for ty in param_types {
        let prim = primitive_type(*ty).ok_or(WarpError::INVALID_TYPE)?;
        let align = prim.align.max(1);
        cursor = (cursor + align - 1) & !(align - 1);
        offsets.push(cursor);
        cursor += prim.size;
    }
    Ok(offsets)
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Reader { bytes, pos: 0 }
    }
    fn bytes(&mut self, n: usize) -> WarpResult<&'a [u8]> {
        if self.pos + n > self.bytes.len() {
            return Err(WarpError::INVALID_OPCODE);
        }
        let s = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }
    fn u8(&mut self) -> WarpResult<u8> {
        Ok(self.bytes(1)?[0])
    }
    fn u16(&mut self) -> WarpResult<u16> {
        Ok(LittleEndian::read_u16(self.bytes(2)?))
    }
    fn u32(&mut self) -> WarpResult<u32> {
        Ok(LittleEndian::read_u32(self.bytes(4)?))
    }
    fn u64(&mut self) -> WarpResult<u64> {
        Ok(LittleEndian::read_u64(self.bytes(8)?))
    }
}

/// Incremental builder for encoded function pages.
///
/// This is the encode half of the codec: the daemon's loader and the
/// test programs both go through it, so the layout knowledge stays in
/// one file.
pub struct FuncBuilder {
    name: String,
    kind: FuncKind,
    params: Vec<VAddr>,
    var_arg: bool,
    cursor: u32,
    blocks: Vec<Vec<Instruction>>,
    current: usize,
}

impl FuncBuilder {
    /// Start a normal (interpreted) function.
    pub fn new(name: &str) -> Self {
        FuncBuilder {
            name: String::from(name),
            kind: FuncKind::Normal,
            params: Vec::new(),
            var_arg: false,
            cursor: STACK_REG_BASE,
            blocks: vec![Vec::new()],
            current: 0,
        }
    }

    /// Encode a body-less builtin stub resolved by name at call time.
    pub fn encode_builtin(name: &str) -> Vec<u8> {
        let mut b = FuncBuilder::new(name);
        b.kind = FuncKind::Builtin;
        b.encode()
    }

    /// Encode a body-less foreign-function stub.
    pub fn encode_external(name: &str) -> Vec<u8> {
        let mut b = FuncBuilder::new(name);
        b.kind = FuncKind::External;
        b.encode()
    }

    /// Accept variadic arguments after the declared parameters.
    pub fn set_var_arg(&mut self) {
        self.var_arg = true;
    }

    /// Declare the next parameter; returns its frame slot.
    pub fn param(&mut self, ty: VAddr) -> VAddr {
        let prim = primitive_type(ty).expect("parameters must be primitive");
        self.params.push(ty);
        self.slot_bytes(prim.size, prim.align)
    }

    /// Reserve a register slot for values of `ty`.
    pub fn slot(&mut self, ty: VAddr) -> VAddr {
        let prim = primitive_type(ty).expect("slot type must be primitive");
        self.slot_bytes(prim.size, prim.align)
    }

    /// Reserve `size` register bytes with the given alignment.
    pub fn slot_bytes(&mut self, size: u32, align: u32) -> VAddr {
        let align = align.max(1);
        self.cursor = (self.cursor + align - 1) & !(align - 1);
        let slot = VAddr::frame_slot(self.cursor);
        self.cursor += size;
        assert!(
            (self.cursor as usize) < STACK_PAGE_SIZE,
            "register area exceeds the stack page"
        );
        slot
    }

    /// Append a new basic block and return its id.
    pub fn new_block(&mut self) -> u32 {
        self.blocks.push(Vec::new());
        (self.blocks.len() - 1) as u32
    }

    /// Make `block` the target of subsequent pushes.
    pub fn select(&mut self, block: u32) {
        self.current = block as usize;
    }

    /// Append an instruction to the selected block.
    pub fn push(&mut self, op: Opcode, ty: VAddr, output: VAddr, operands: &[u64]) {
        self.blocks[self.current].push(Instruction {
            op,
            ty,
            output,
            operands: operands.to_vec(),
        });
    }

    /// Encode the function page.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&FUNC_MAGIC.to_le_bytes());
        out.push(match self.kind {
            FuncKind::Normal => 0,
            FuncKind::Builtin => 1,
            FuncKind::External => 2,
        });
        out.push(self.var_arg as u8);
        out.extend_from_slice(&(self.params.len() as u16).to_le_bytes());
        out.extend_from_slice(&(self.name.len() as u16).to_le_bytes());
        out.extend_from_slice(self.name.as_bytes());
        out.extend_from_slice(&(self.cursor - STACK_REG_BASE).to_le_bytes());
        out.extend_from_slice(&(STACK_PAGE_SIZE as u32).to_le_bytes());
        for ty in &self.params {
            out.extend_from_slice(&ty.0.to_le_bytes());
        }
        out.extend_from_slice(&(self.blocks.len() as u32).to_le_bytes());
        for block in &self.blocks {
            out.extend_from_slice(&(block.len() as u32).to_le_bytes());
            for inst in block {
                out.push(inst.op as u8);
                out.extend_from_slice(&(inst.operands.len() as u16).to_le_bytes());
                out.extend_from_slice(&inst.ty.0.to_le_bytes());
                out.extend_from_slice(&inst.output.0.to_le_bytes());
                for operand in &inst.operands {
                    out.extend_from_slice(&operand.to_le_bytes());
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interp::types::{TYPE_I32, TYPE_I64};
    use crate::task::pack_pc;

    #[test]
    fn encode_decode_round_trip() {
        let mut b = FuncBuilder::new("main");
        let p0 = b.param(TYPE_I32);
        let p1 = b.param(TYPE_I64);
        let out = b.slot(TYPE_I32);
        b.push(Opcode::Add, TYPE_I32, out, &[p0.0, p1.0]);
        b.push(Opcode::Ret, TYPE_I32, VAddr::NON, &[out.0]);
        let bytes = b.encode();

        let addr = VAddr(0x1000);
        let f = FuncStore::decode(addr, &bytes).unwrap();
        assert_eq!(f.name, "main");
        assert_eq!(f.kind, FuncKind::Normal);
        assert_eq!(f.param_types, vec![TYPE_I32, TYPE_I64]);
        // i32 at 8, i64 aligned up to 16.
        assert_eq!(f.param_offsets, vec![8, 16]);
        assert_eq!(f.blocks.len(), 1);
        assert_eq!(f.blocks[0].len(), 2);
        assert_eq!(f.blocks[0][0].op, Opcode::Add);
        assert_eq!(f.blocks[0][0].operands, vec![p0.0, p1.0]);

        assert_eq!(f.fetch(pack_pc(0, 1)).unwrap().op, Opcode::Ret);
        assert!(f.fetch(pack_pc(0, 2)).is_err());
        assert!(f.fetch(pack_pc(1, 0)).is_err());
    }

    #[test]
    fn builtin_stub() {
        let bytes = FuncBuilder::encode_builtin("llvm.sadd.with.overflow.i16");
        let f = FuncStore::decode(VAddr(0x2000), &bytes).unwrap();
        assert_eq!(f.kind, FuncKind::Builtin);
        assert_eq!(f.name, "llvm.sadd.with.overflow.i16");
        assert!(f.blocks[0].is_empty());
    }

    #[test]
    fn decode_rejects_truncation() {
        let mut b = FuncBuilder::new("f");
        let s = b.slot(TYPE_I32);
        b.push(Opcode::Ret, TYPE_I32, VAddr::NON, &[s.0]);
        let bytes = b.encode();
        for cut in [3, 8, bytes.len() - 1].iter() {
            assert!(FuncStore::decode(VAddr(1), &bytes[..*cut]).is_err());
        }
    }
}
