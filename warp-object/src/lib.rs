#![no_std]
#![deny(unsafe_code, unused_must_use)]

//! ProcessWarp core objects.
//!
//! This crate holds the node-independent heart of the runtime: the
//! distributed virtual memory with its coherence protocol, the per-process
//! instruction interpreter, the builtin registry, and the thread-warp
//! machinery that moves a live thread between nodes. Everything that talks
//! to the outside world (transport, frontend, loader) is reached through
//! delegate traits; the crate itself is `no_std + alloc`.

#[macro_use]
extern crate alloc;

#[macro_use]
extern crate bitflags;

#[macro_use]
extern crate log;

#[cfg(test)]
#[macro_use]
extern crate std;

mod error;

pub mod builtin;
pub mod ident;
pub mod interp;
pub mod memory;
pub mod packet;
pub mod task;
pub mod vmachine;
pub mod warp;

pub use self::error::*;
