//! Thread migration and placement.

mod protocol;
mod scheduler;

pub use self::protocol::{WarpBody, WarpPage, WARP_MAGIC, WARP_VERSION};
pub use self::scheduler::{ProcessTree, Scheduler, SchedulerDelegate, SchedulerMessage};
