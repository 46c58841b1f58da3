//! The instruction-set interpreter.

mod func;
mod interpreter;
mod opcode;
mod types;

pub use self::func::{FuncBuilder, FuncKind, FuncStore, FUNC_MAGIC, STACK_REG_BASE};
pub use self::interpreter::{execute, Yield};
pub use self::opcode::{Instruction, Opcode};
pub use self::types::{
    primitive_type, TypeKind, TypeStore, PRIMITIVE_TYPES, TYPE_F32, TYPE_F64, TYPE_I16, TYPE_I32,
    TYPE_I64, TYPE_I8, TYPE_PTR, TYPE_U16, TYPE_U32, TYPE_U64, TYPE_U8,
};
