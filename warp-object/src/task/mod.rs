//! Objects of the process/thread model.

mod process;
mod stack;
mod thread;

pub use self::process::{encode_control_block, Process, TickStatus, DEFAULT_QUANTUM, PCB_MAGIC};
pub use self::stack::{pack_pc, pc_block, pc_index, StackInfo};
pub use self::thread::{Thread, ThreadStatus};

pub(crate) use self::thread::ThreadInner;
