//! Virtual threads.

use super::stack::StackInfo;
use crate::ident::{NodeId, Vtid};
use crate::memory::VAddr;
use crate::WarpResult;
use alloc::sync::Arc;
use alloc::vec::Vec;
use futures::channel::oneshot;
use numeric_enum_macro::numeric_enum;
use spin::{Mutex, MutexGuard};

numeric_enum! {
    #[repr(u8)]
    /// Lifecycle state of a thread, as carried in the warp body.
    #[derive(Debug, Clone, Copy, Eq, PartialEq)]
    pub enum ThreadStatus {
        // Installed but not yet runnable; flips to `Normal` once every
        // referenced page is resident on this node.
        BeforeWarp = 0,
        // Runnable.
        Normal = 1,
        // A warp was requested; the scheduler no longer runs it.
        WaitWarp = 2,
        // The serialized body left this node; frozen until the
        // destination acknowledges.
        AfterWarp = 3,
        // Returned from its root frame.
        Finish = 4,
        // Died on an unhandled fault, trap or invalid instruction.
        Error = 5,
    }
}

/// Migration bookkeeping of a thread leaving this node.
pub(crate) struct WarpState {
    /// Destination node.
    pub dst: NodeId,
    /// The warp request packet went out.
    pub requested: bool,
    /// The destination accepted; the body may be sent.
    pub accepted: bool,
    /// Give up and restore `Normal` past this instant.
    pub deadline: u64,
    /// Completion notification for whoever asked for the warp.
    pub notify: Option<oneshot::Sender<WarpResult<NodeId>>>,
}

/// A computation entity: program counter, frame stack, thread-local
/// storage, all addressed inside its process's distributed memory.
///
/// Threads are created by process startup or by the fork builtin, and
/// destroyed on return from their root frame or on an unrecoverable
/// error. Warping neither creates nor destroys a thread: the same vtid
/// continues on the destination node. The lifecycle is plain state:
/// the scheduler polls [`status`], and warp completion is delivered
/// through the oneshot handle [`begin_warp`] returns.
///
/// [`status`]: Thread::status
/// [`begin_warp`]: Thread::begin_warp
pub struct Thread {
    /// Thread id, monotonic within the process.
    pub tid: Vtid,
    inner: Mutex<ThreadInner>,
}

pub(crate) struct ThreadInner {
    pub status: ThreadStatus,
    pub frames: Vec<StackInfo>,
    pub tls: VAddr,
    /// Address whose fault suspended this thread, if any.
    pub wait_addr: Option<VAddr>,
    pub warp: Option<WarpState>,
}

impl Thread {
    /// Create a thread record with an empty call stack.
    pub fn create(tid: Vtid) -> Arc<Self> {
        Arc::new(Thread {
            tid,
            inner: Mutex::new(ThreadInner {
                status: ThreadStatus::BeforeWarp,
                frames: Vec::new(),
                tls: VAddr::NON,
                wait_addr: None,
                warp: None,
            }),
        })
    }

    /// Rebuild a thread from a warp body on the destination node.
    pub fn restore(tid: Vtid, status: ThreadStatus, tls: VAddr, frames: Vec<StackInfo>) -> Arc<Self> {
        Arc::new(Thread {
            tid,
            inner: Mutex::new(ThreadInner {
                status,
                frames,
                tls,
                wait_addr: None,
                warp: None,
            }),
        })
    }

    pub(crate) fn inner(&self) -> MutexGuard<'_, ThreadInner> {
        self.inner.lock()
    }

    /// Current lifecycle state.
    pub fn status(&self) -> ThreadStatus {
        self.inner.lock().status
    }

    /// Thread-local-storage page address.
    pub fn tls(&self) -> VAddr {
        self.inner.lock().tls
    }

    /// Call-stack depth.
    pub fn frame_count(&self) -> usize {
        self.inner.lock().frames.len()
    }

    /// Snapshot `(status, tls, frames)` for serialization.
    pub fn snapshot(&self) -> (ThreadStatus, VAddr, Vec<StackInfo>) {
        let inner = self.inner.lock();
        (inner.status, inner.tls, inner.frames.clone())
    }

    /// Transition the lifecycle state.
    pub fn set_status(&self, status: ThreadStatus) {
        self.inner.lock().status = status;
    }

    /// Ask for a migration to `dst`. Returns a completion handle that
    /// resolves with the destination on success or `WARP_REJECTED` when
    /// the destination declines or the deadline passes.
    pub fn begin_warp(
        &self,
        dst: NodeId,
        deadline: u64,
    ) -> WarpResult<oneshot::Receiver<WarpResult<NodeId>>> {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.inner.lock();
        if inner.status != ThreadStatus::Normal {
            return Err(crate::WarpError::BAD_STATE);
        }
        inner.status = ThreadStatus::WaitWarp;
        inner.warp = Some(WarpState {
            dst,
            requested: false,
            accepted: false,
            deadline,
            notify: Some(tx),
        });
        Ok(rx)
    }

    /// Abandon a pending warp and make the thread runnable again.
    pub fn cancel_warp(&self) {
        let notify = {
            let mut inner = self.inner.lock();
            let notify = inner.warp.take().and_then(|mut w| w.notify.take());
            if matches!(inner.status, ThreadStatus::WaitWarp | ThreadStatus::AfterWarp) {
                inner.status = ThreadStatus::Normal;
            }
            notify
        };
        if let Some(tx) = notify {
            let _ = tx.send(Err(crate::WarpError::WARP_REJECTED));
        }
    }

    /// The destination acknowledged: this node's record dies.
    pub fn complete_warp(&self) {
        let (dst, notify) = {
            let mut inner = self.inner.lock();
            let mut warp = match inner.warp.take() {
                Some(w) => w,
                None => return,
            };
            inner.status = ThreadStatus::AfterWarp;
            (warp.dst, warp.notify.take())
        };
        if let Some(tx) = notify {
            let _ = tx.send(Ok(dst));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_transitions() {
        let t = Thread::create(1);
        assert_eq!(t.status(), ThreadStatus::BeforeWarp);
        t.set_status(ThreadStatus::Normal);
        assert_eq!(t.status(), ThreadStatus::Normal);
        t.set_status(ThreadStatus::Finish);
        assert_eq!(t.status(), ThreadStatus::Finish);
    }

    #[test]
    fn warp_handshake() {
        let t = Thread::create(7);
        t.set_status(ThreadStatus::Normal);
        let mut rx = t.begin_warp(NodeId::from_raw(9), 100).unwrap();
        assert_eq!(t.status(), ThreadStatus::WaitWarp);
        // A second request while one is pending is refused.
        assert!(t.begin_warp(NodeId::from_raw(9), 100).is_err());

        t.complete_warp();
        assert_eq!(t.status(), ThreadStatus::AfterWarp);
        assert_eq!(rx.try_recv().unwrap().unwrap(), Ok(NodeId::from_raw(9)));
    }

    #[test]
    fn warp_reject_restores_normal() {
        let t = Thread::create(8);
        t.set_status(ThreadStatus::Normal);
        let mut rx = t.begin_warp(NodeId::from_raw(9), 100).unwrap();
        t.cancel_warp();
        assert_eq!(t.status(), ThreadStatus::Normal);
        assert_eq!(
            rx.try_recv().unwrap().unwrap(),
            Err(crate::WarpError::WARP_REJECTED)
        );
    }

    #[test]
    fn status_byte_round_trip() {
        use core::convert::TryFrom;
        for s in [
            ThreadStatus::BeforeWarp,
            ThreadStatus::Normal,
            ThreadStatus::WaitWarp,
            ThreadStatus::AfterWarp,
            ThreadStatus::Finish,
            ThreadStatus::Error,
        ]
        .iter()
        {
            assert_eq!(ThreadStatus::try_from(*s as u8).unwrap(), *s);
        }
    }
}
