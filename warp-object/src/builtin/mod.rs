//! The builtin registry.
//!
//! Builtins are registered by name with a function pointer and a
//! parameter (an integer, usually an operand width, or an opaque host
//! resource). The caller lays the arguments out in a width-tagged
//! little-endian buffer; the builtin writes its result through the
//! accessor to the destination address and answers with a post-return
//! code that tells the interpreter how to continue.

pub mod control;
pub mod gui;
pub mod mem;
pub mod overflow;

use crate::ident::Vtid;
use crate::memory::{Accessor, VAddr};
use crate::task::Process;
use crate::task::ThreadInner;
use crate::{WarpError, WarpResult};
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use byteorder::{ByteOrder, LittleEndian};
use core::any::Any;
use hashbrown::HashMap;
use spin::Mutex;

/// What the interpreter does after a builtin returns.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum PostProc {
    /// Advance the pc past the call.
    Normal,
    /// Yield without advancing; the builtin will be re-entered.
    Wait,
    /// Like `Wait`, but the caller must re-check its precondition.
    Retry,
    /// Mark the thread finished.
    FinishThread,
}

/// The registered parameter of a builtin.
#[derive(Clone)]
pub enum BuiltinParam {
    None,
    /// An integer, typically the operand width in bits.
    I64(i64),
    /// An opaque host resource (no RTTI beyond `Any`).
    Resource(Arc<dyn Any + Send + Sync>),
}

impl BuiltinParam {
    /// The integer parameter.
    pub fn i64(&self) -> WarpResult<i64> {
        match self {
            BuiltinParam::I64(v) => Ok(*v),
            _ => Err(WarpError::INVALID_ARGS),
        }
    }

    /// Borrow the host resource as `T`.
    pub fn resource<T: 'static>(&self) -> WarpResult<&T> {
        match self {
            BuiltinParam::Resource(res) => {
                (&**res as &dyn Any).downcast_ref::<T>().ok_or(WarpError::INVALID_ARGS)
            }
            _ => Err(WarpError::INVALID_ARGS),
        }
    }
}

/// Execution context handed to a builtin: the process, the calling
/// thread's id and (mutable) state, reached through methods so builtins
/// like longjmp can manipulate the call stack without touching interpreter
/// internals.
pub struct BuiltinContext<'a> {
    pub proc: &'a Arc<Process>,
    pub tid: Vtid,
    pub(crate) thread: &'a mut ThreadInner,
}

impl<'a> BuiltinContext<'a> {
    /// The process memory accessor.
    pub fn accessor(&self) -> Accessor {
        self.proc.accessor()
    }

    /// Current call-stack depth.
    pub fn frame_depth(&self) -> usize {
        self.thread.frames.len()
    }

    /// The pc of the call instruction being executed.
    pub fn current_pc(&self) -> WarpResult<u64> {
        self.thread.frames.last().map(|f| f.pc).ok_or(WarpError::BAD_STATE)
    }

    /// Pop frames down to `depth` and land the survivor at `pc` (the
    /// longjmp primitive). The interpreter's normal post-call advance
    /// then steps past the re-entered call site.
    pub fn longjmp(&mut self, depth: usize, pc: u64) -> WarpResult {
        if depth == 0 || depth > self.thread.frames.len() {
            return Err(WarpError::BAD_STATE);
        }
        let acc = self.accessor();
        while self.thread.frames.len() > depth {
            let popped = self.thread.frames.pop().ok_or(WarpError::INTERNAL)?;
            let _ = acc.free(popped.stack);
        }
        let top = self.thread.frames.last_mut().ok_or(WarpError::INTERNAL)?;
        top.pc = pc;
        Ok(())
    }
}

/// A builtin function pointer.
pub type BuiltinFunc =
    fn(&mut BuiltinContext<'_>, &BuiltinParam, VAddr, &[u8]) -> WarpResult<PostProc>;

/// One registry entry.
#[derive(Clone)]
pub struct BuiltinEntry {
    pub func: BuiltinFunc,
    pub param: BuiltinParam,
}

/// Name → builtin mapping, populated at process start.
pub struct BuiltinRegistry {
    inner: Mutex<HashMap<String, BuiltinEntry>>,
}

impl BuiltinRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        BuiltinRegistry {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Register `name`; later registrations replace earlier ones.
    pub fn register(&self, name: &str, func: BuiltinFunc, param: BuiltinParam) {
        self.inner
            .lock()
            .insert(String::from(name), BuiltinEntry { func, param });
    }

    /// Look up a builtin by name.
    pub fn resolve(&self, name: &str) -> Option<BuiltinEntry> {
        self.inner.lock().get(name).cloned()
    }
}

impl Default for BuiltinRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Register every builtin set the core always carries.
pub fn register_core(registry: &BuiltinRegistry) {
    overflow::regist(registry);
    mem::regist(registry);
    control::regist(registry);
}

// ---- width-tagged argument buffers ----

/// Append one argument: a width byte followed by its LE bytes.
pub fn push_param(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.push(bytes.len() as u8);
    buf.extend_from_slice(bytes);
}

fn read_param<'x>(src: &'x [u8], seek: &mut usize, width: usize) -> WarpResult<&'x [u8]> {
    if *seek >= src.len() || src[*seek] as usize != width || *seek + 1 + width > src.len() {
        return Err(WarpError::INVALID_ARGS);
    }
    let bytes = &src[*seek + 1..*seek + 1 + width];
    *seek += 1 + width;
    Ok(bytes)
}

/// Read an 8-bit argument.
pub fn read_param_i8(src: &[u8], seek: &mut usize) -> WarpResult<i8> {
    Ok(read_param(src, seek, 1)?[0] as i8)
}

/// Read a 16-bit argument.
pub fn read_param_i16(src: &[u8], seek: &mut usize) -> WarpResult<i16> {
    Ok(LittleEndian::read_i16(read_param(src, seek, 2)?))
}

/// Read a 32-bit argument.
pub fn read_param_i32(src: &[u8], seek: &mut usize) -> WarpResult<i32> {
    Ok(LittleEndian::read_i32(read_param(src, seek, 4)?))
}

/// Read a 64-bit argument.
pub fn read_param_i64(src: &[u8], seek: &mut usize) -> WarpResult<i64> {
    Ok(LittleEndian::read_i64(read_param(src, seek, 8)?))
}

/// Read a virtual-address argument.
pub fn read_param_vaddr(src: &[u8], seek: &mut usize) -> WarpResult<VAddr> {
    Ok(VAddr(LittleEndian::read_u64(read_param(src, seek, 8)?)))
}
