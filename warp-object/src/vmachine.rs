//! The per-process virtual machine front object.
//!
//! A `VMachine` ties one [`Process`] to the node that hosts it: it owns
//! the memory space, routes inbound packets to the memory or warp
//! handler, drives pending migrations forward on every scheduling slice,
//! and reports lifecycle events outward through its delegate. It never
//! touches the transport itself.

use crate::builtin::gui::{self, GuiDelegate};
use crate::ident::{NodeId, Vpid, Vtid};
use crate::memory::{MemoryDelegate, MemoryMessage, VMemory};
use crate::packet::Module;
use crate::task::{Process, Thread, ThreadStatus, TickStatus, DEFAULT_QUANTUM};
use crate::warp::{WarpBody, WarpPage};
use crate::{WarpError, WarpResult};
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use futures::channel::oneshot;
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use spin::Mutex;

/// How long a warp handshake may stay unanswered, in caller clock
/// milliseconds.
pub const WARP_TIMEOUT_MS: u64 = 10_000;

/// Outward events of a VMachine.
pub trait VMachineDelegate: Send + Sync {
    /// Send a packet to a module of `dst_nid`.
    fn vm_send_packet(&self, pid: &Vpid, dst_nid: NodeId, module: Module, content: Value);
    /// Every thread finished; the process is done on this node.
    fn vm_finish(&self, pid: &Vpid);
    /// One thread left this node (warp completed).
    fn vm_finish_thread(&self, pid: &Vpid, tid: Vtid);
    /// The process died on an error.
    fn vm_error(&self, pid: &Vpid, message: &str);
}

/// VM-module packets: the warp handshake plus local control relays.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum VmMessage {
    /// Local command: migrate `tid` to `dst_nid`.
    Warp { tid: Vtid, dst_nid: NodeId },
    /// Local command: kill the process here.
    Terminate,
    /// Inbound migration offer.
    WarpRequest { tid: Vtid, src_nid: NodeId },
    WarpAccept { tid: Vtid },
    WarpReject { tid: Vtid },
    WarpBody { tid: Vtid, body: Vec<u8> },
    WarpDone { tid: Vtid },
}

/// One process bound to this node.
pub struct VMachine {
    /// The hosting node.
    pub nid: NodeId,
    /// The hosted process id.
    pub pid: Vpid,
    delegate: Arc<dyn VMachineDelegate>,
    process: Arc<Process>,
    quantum: usize,
    inner: Mutex<VMachineInner>,
}

struct VMachineInner {
    now: u64,
    reported: bool,
}

impl VMachine {
    /// Create the VM for `pid` and begin hosting.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        nid: NodeId,
        pid: Vpid,
        root_tid: Vtid,
        proc_addr: crate::memory::VAddr,
        master_nid: NodeId,
        delegate: Arc<dyn VMachineDelegate>,
        memory_delegate: Arc<dyn MemoryDelegate>,
        lib_filter: HashMap<String, String>,
    ) -> Arc<Self> {
        let memory = VMemory::new(nid, pid.clone(), master_nid, memory_delegate);
        let process = Process::create(pid.clone(), master_nid, memory);
        process.set_lib_filter(lib_filter);
        process.activate(root_tid, proc_addr);
        info!("{:?}: hosting {} (master {:?})", nid, pid, master_nid);
        Arc::new(VMachine {
            nid,
            pid,
            delegate,
            process,
            quantum: DEFAULT_QUANTUM,
            inner: Mutex::new(VMachineInner {
                now: 0,
                reported: false,
            }),
        })
    }

    /// The hosted process.
    pub fn process(&self) -> &Arc<Process> {
        &self.process
    }

    /// The process memory space.
    pub fn memory(&self) -> &Arc<VMemory> {
        self.process.memory()
    }

    /// Register the GUI builtins with their outward capability.
    pub fn initialize_gui(&self, delegate: Arc<dyn GuiDelegate>) {
        gui::regist(self.process.builtins(), delegate);
    }

    /// Run one scheduling slice and drive pending migrations.
    pub fn execute(&self) -> TickStatus {
        let status = self.process.tick(self.quantum);
        self.drive_warp();
        self.memory().flush();
        match status {
            TickStatus::Finish => self.report_finish(false),
            TickStatus::Error => self.report_finish(true),
            _ => {}
        }
        status
    }

    fn report_finish(&self, errored: bool) {
        let mut inner = self.inner.lock();
        if inner.reported {
            return;
        }
        inner.reported = true;
        drop(inner);
        if errored {
            self.delegate.vm_error(&self.pid, "process failed");
        } else {
            self.delegate.vm_finish(&self.pid);
        }
    }

    /// Ask for a migration of `tid` to `dst`. The returned handle
    /// resolves when the warp completes or is rejected.
    pub fn request_warp(
        &self,
        tid: Vtid,
        dst: NodeId,
    ) -> WarpResult<oneshot::Receiver<WarpResult<NodeId>>> {
        if dst == self.nid || dst == NodeId::NONE || dst == NodeId::BROADCAST {
            return Err(WarpError::INVALID_ARGS);
        }
        let now = self.inner.lock().now;
        let thread = self.process.thread(tid)?;
        let rx = thread.begin_warp(dst, now + WARP_TIMEOUT_MS)?;
        debug!("{}:{} warp requested to {:?}", self.pid, tid, dst);
        Ok(rx)
    }

    /// Kill the process on this node.
    pub fn terminate(&self) {
        self.process.terminate(false);
        self.report_finish(false);
    }

    /// Exit code, once the process finished.
    pub fn exit_code(&self) -> WarpResult<i64> {
        self.process.exit_code()
    }

    /// Advance deadlines: coherence retries and the warp handshake.
    pub fn poll(&self, now: u64) {
        self.inner.lock().now = now;
        self.memory().poll(now);
        for thread in self.process.threads() {
            let expired = {
                let ti = thread.inner();
                match (&ti.status, &ti.warp) {
                    (ThreadStatus::WaitWarp, Some(w)) => w.deadline <= now,
                    _ => false,
                }
            };
            if expired {
                warn!("{}:{} warp timed out", self.pid, thread.tid);
                thread.cancel_warp();
                self.process.enqueue(thread.tid);
            }
        }
    }

    /// Handle an inbound packet for this process.
    pub fn recv_packet(&self, src_nid: NodeId, module: Module, content: &Value) -> WarpResult {
        match module {
            Module::Memory => {
                let msg: MemoryMessage =
                    serde_json::from_value(content.clone()).map_err(|_| WarpError::INVALID_ARGS)?;
                self.memory().recv(src_nid, msg);
                Ok(())
            }
            Module::Vm => {
                let msg: VmMessage =
                    serde_json::from_value(content.clone()).map_err(|_| WarpError::INVALID_ARGS)?;
                self.recv_vm(src_nid, msg)
            }
            _ => Err(WarpError::NOT_SUPPORTED),
        }
    }

    fn recv_vm(&self, src_nid: NodeId, msg: VmMessage) -> WarpResult {
        match msg {
            VmMessage::Warp { tid, dst_nid } => {
                // Fire-and-forget from the control plane; completion is
                // observable through the thread's signals.
                let _ = self.request_warp(tid, dst_nid)?;
                Ok(())
            }
            VmMessage::Terminate => {
                self.terminate();
                Ok(())
            }
            VmMessage::WarpRequest { tid, src_nid: from } => {
                let accept = self.process.exit_status().is_none() && self.process.thread(tid).is_err();
                let reply = if accept {
                    VmMessage::WarpAccept { tid }
                } else {
                    VmMessage::WarpReject { tid }
                };
                debug!("{}:{} inbound warp from {:?}: accept={}", self.pid, tid, from, accept);
                self.send_vm(src_nid, &reply)
            }
            VmMessage::WarpAccept { tid } => {
                if let Ok(thread) = self.process.thread(tid) {
                    let mut ti = thread.inner();
                    if let Some(warp) = ti.warp.as_mut() {
                        warp.accepted = true;
                    }
                }
                Ok(())
            }
            VmMessage::WarpReject { tid } => {
                if let Ok(thread) = self.process.thread(tid) {
                    thread.cancel_warp();
                    self.process.enqueue(tid);
                }
                Ok(())
            }
            VmMessage::WarpBody { tid, body } => self.install_warp(src_nid, tid, &body),
            VmMessage::WarpDone { tid } => {
                if let Ok(thread) = self.process.thread(tid) {
                    thread.complete_warp();
                }
                self.process.remove_thread(tid);
                self.delegate.vm_finish_thread(&self.pid, tid);
                Ok(())
            }
        }
    }

    /// Push every thread with a pending migration one step forward.
    fn drive_warp(&self) {
        for thread in self.process.threads() {
            let (dst, requested, accepted) = {
                let ti = thread.inner();
                match (&ti.status, &ti.warp) {
                    (ThreadStatus::WaitWarp, Some(w)) => (w.dst, w.requested, w.accepted),
                    _ => continue,
                }
            };
            if !requested {
                let msg = VmMessage::WarpRequest {
                    tid: thread.tid,
                    src_nid: self.nid,
                };
                if self.send_vm(dst, &msg).is_ok() {
                    if let Some(w) = thread.inner().warp.as_mut() {
                        w.requested = true;
                    }
                }
                continue;
            }
            if accepted {
                match self.send_warp_body(&thread, dst) {
                    Ok(()) => {}
                    Err(WarpError::SHOULD_WAIT) => {} // owning pages; retry next slice
                    Err(err) => {
                        warn!("{}:{} warp failed: {:?}", self.pid, thread.tid, err);
                        thread.cancel_warp();
                        self.process.enqueue(thread.tid);
                    }
                }
            }
        }
    }

    /// Enumerate the warp set, take ownership of every page in it, and
    /// ship the body. Process-wide pages (functions, types, globals) are
    /// not transferred; the destination demand-fetches them.
    fn send_warp_body(&self, thread: &Arc<Thread>, dst: NodeId) -> WarpResult {
        let (_, tls, frames) = thread.snapshot();
        let memory = self.memory();

        let mut addrs: Vec<crate::memory::VAddr> = Vec::new();
        if !tls.is_non() {
            addrs.push(tls);
        }
        for f in &frames {
            if !f.stack.is_non() {
                addrs.push(f.stack);
            }
            if !f.var_arg.is_non() {
                addrs.push(f.var_arg);
            }
        }
        // First pass: everything must be owned writable here before any
        // page leaves, so a rejection cannot strand half the set.
        for addr in &addrs {
            memory.own(*addr)?;
        }
        let mut pages = Vec::with_capacity(addrs.len());
        for addr in &addrs {
            let (base, class, bytes, epoch) = memory.warp_take(*addr, dst)?;
            pages.push(WarpPage {
                addr: base,
                class,
                bytes,
                epoch,
            });
        }

        let body = WarpBody {
            tid: thread.tid,
            status: ThreadStatus::BeforeWarp,
            tls,
            frames,
            pages,
        };
        self.send_vm(
            dst,
            &VmMessage::WarpBody {
                tid: thread.tid,
                body: body.encode(),
            },
        )?;
        thread.set_status(ThreadStatus::AfterWarp);
        info!("{}:{} warped out to {:?}", self.pid, thread.tid, dst);
        Ok(())
    }

    /// Install an inbound thread: pages first, thread record second, and
    /// only flip it runnable once every referenced page is owned here.
    fn install_warp(&self, src_nid: NodeId, tid: Vtid, body: &[u8]) -> WarpResult {
        let body = WarpBody::decode(body)?;
        if body.tid != tid {
            return Err(WarpError::INVALID_ARGS);
        }
        for page in &body.pages {
            self.memory().warp_install(page.addr, page.bytes.clone(), page.epoch)?;
        }
        let mut frames = body.frames;
        for frame in frames.iter_mut() {
            frame.func_cache = None;
        }
        let thread = Thread::restore(tid, ThreadStatus::BeforeWarp, body.tls, frames);

        let all_resident = body
            .pages
            .iter()
            .all(|p| self.memory().is_owned_writable(p.addr));
        if all_resident {
            thread.set_status(ThreadStatus::Normal);
        } else {
            error!("{}:{} warp body installed with missing pages", self.pid, tid);
        }
        self.process.install_thread(thread)?;
        info!("{}:{} warped in from {:?}", self.pid, tid, src_nid);
        self.send_vm(src_nid, &VmMessage::WarpDone { tid })
    }

    fn send_vm(&self, dst: NodeId, msg: &VmMessage) -> WarpResult {
        let content = serde_json::to_value(msg).map_err(|_| WarpError::INTERNAL)?;
        self.delegate.vm_send_packet(&self.pid, dst, Module::Vm, content);
        Ok(())
    }
}
