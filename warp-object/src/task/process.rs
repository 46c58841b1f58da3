//! Virtual processes.

use super::stack::StackInfo;
use super::thread::{Thread, ThreadStatus};
use crate::builtin::{self, BuiltinRegistry};
use crate::ident::{NodeId, Vpid, Vtid};
use crate::interp::{self, FuncStore, TypeStore, STACK_REG_BASE};
use crate::memory::{Accessor, AddrClass, VMemory, VAddr, STACK_PAGE_SIZE, TLS_PAGE_SIZE};
use crate::{WarpError, WarpResult};
use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use byteorder::{ByteOrder, LittleEndian};
use hashbrown::HashMap;
use spin::Mutex;

/// Bounded instruction count per scheduling slice.
pub const DEFAULT_QUANTUM: usize = 256;

/// Magic of an encoded process control block.
pub const PCB_MAGIC: u32 = 0x5057_5043; // "PWPC"

/// What one call to [`Process::tick`] accomplished.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum TickStatus {
    /// Nothing runnable right now.
    Idle,
    /// Ran a thread (or made progress towards one).
    Running,
    /// Every thread reached FINISH.
    Finish,
    /// Every thread terminated and at least one died on an error.
    Error,
}

/// A process instance hosted on one node.
///
/// Holds the thread map, the round-robin run queue, the decoded
/// function/type caches (non-owning indexes over pages in the
/// distributed memory), the builtin registry, and the memory accessor.
/// The process control block page is owned by the master node; any node
/// that hosts threads demand-fetches it through the coherence protocol.
pub struct Process {
    /// Process id, unique across the fleet.
    pub pid: Vpid,
    /// Owner of the process control block.
    pub master_nid: NodeId,
    memory: Arc<VMemory>,
    builtins: BuiltinRegistry,
    inner: Mutex<ProcessInner>,
}

struct ProcessInner {
    proc_addr: VAddr,
    root_tid: Vtid,
    result_addr: VAddr,
    root_started: bool,
    threads: HashMap<Vtid, Arc<Thread>>,
    run_queue: VecDeque<Vtid>,
    next_tid: Vtid,
    funcs: HashMap<VAddr, Arc<FuncStore>>,
    types: HashMap<VAddr, Arc<TypeStore>>,
    lib_filter: HashMap<alloc::string::String, alloc::string::String>,
    had_error: bool,
    exited: Option<TickStatus>,
}

/// Encode a process control block page.
pub fn encode_control_block(root_func: VAddr, result_addr: VAddr) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&PCB_MAGIC.to_le_bytes());
    out.extend_from_slice(&root_func.0.to_le_bytes());
    out.extend_from_slice(&result_addr.0.to_le_bytes());
    out
}

fn decode_control_block(bytes: &[u8]) -> WarpResult<(VAddr, VAddr)> {
    if bytes.len() < 20 || LittleEndian::read_u32(&bytes[0..4]) != PCB_MAGIC {
        return Err(WarpError::BAD_STATE);
    }
    Ok((
        VAddr(LittleEndian::read_u64(&bytes[4..12])),
        VAddr(LittleEndian::read_u64(&bytes[12..20])),
    ))
}

impl Process {
    /// Create the local instance of process `pid`.
    pub fn create(pid: Vpid, master_nid: NodeId, memory: Arc<VMemory>) -> Arc<Self> {
        let builtins = BuiltinRegistry::new();
        builtin::register_core(&builtins);
        let proc = Arc::new(Process {
            pid,
            master_nid,
            memory,
            builtins,
            inner: Mutex::new(ProcessInner {
                proc_addr: VAddr::NON,
                root_tid: 0,
                result_addr: VAddr::NON,
                root_started: false,
                threads: HashMap::new(),
                run_queue: VecDeque::new(),
                next_tid: 1,
                funcs: HashMap::new(),
                types: HashMap::new(),
                lib_filter: HashMap::new(),
                had_error: false,
                exited: None,
            }),
        });
        let weak = Arc::downgrade(&proc);
        proc.memory.add_update_callback(Box::new(move |_addr| match weak.upgrade() {
            Some(proc) => {
                proc.wake_waiting();
                false
            }
            None => true,
        }));
        proc
    }

    /// Begin hosting: remember the control block address and, on the
    /// master node, start the root thread at the next tick.
    pub fn activate(&self, root_tid: Vtid, proc_addr: VAddr) {
        let mut inner = self.inner.lock();
        inner.proc_addr = proc_addr;
        inner.root_tid = root_tid;
        inner.next_tid = inner.next_tid.max(root_tid + 1);
    }

    /// The memory accessor of this process.
    pub fn accessor(&self) -> Accessor {
        Accessor::new(self.memory.clone())
    }

    /// The underlying memory space.
    pub fn memory(&self) -> &Arc<VMemory> {
        &self.memory
    }

    /// The builtin registry.
    pub fn builtins(&self) -> &BuiltinRegistry {
        &self.builtins
    }

    /// Install the FFI whitelist (application name → host name).
    pub fn set_lib_filter(
        &self,
        filter: HashMap<alloc::string::String, alloc::string::String>,
    ) {
        self.inner.lock().lib_filter = filter;
    }

    /// Host-visible name an application-visible FFI name maps to.
    pub fn lib_filter(&self, name: &str) -> Option<alloc::string::String> {
        self.inner.lock().lib_filter.get(name).cloned()
    }

    /// The root thread id.
    pub fn root_tid(&self) -> Vtid {
        self.inner.lock().root_tid
    }

    /// A snapshot of all thread records.
    pub fn threads(&self) -> Vec<Arc<Thread>> {
        self.inner.lock().threads.values().cloned().collect()
    }

    /// Look up a thread.
    pub fn thread(&self, tid: Vtid) -> WarpResult<Arc<Thread>> {
        self.inner.lock().threads.get(&tid).cloned().ok_or(WarpError::NOT_FOUND)
    }

    /// Install a thread record (warp arrival) and schedule it if runnable.
    pub fn install_thread(&self, thread: Arc<Thread>) -> WarpResult {
        let mut inner = self.inner.lock();
        if inner.threads.contains_key(&thread.tid) {
            return Err(WarpError::ALREADY_EXISTS);
        }
        let tid = thread.tid;
        inner.next_tid = inner.next_tid.max(tid + 1);
        let runnable = thread.status() == ThreadStatus::Normal;
        inner.threads.insert(tid, thread);
        if runnable {
            inner.run_queue.push_back(tid);
        }
        Ok(())
    }

    /// Drop a thread record (warp departure acknowledged).
    pub fn remove_thread(&self, tid: Vtid) {
        let mut inner = self.inner.lock();
        inner.threads.remove(&tid);
        inner.run_queue.retain(|t| *t != tid);
    }

    /// Put a thread back on the run queue.
    pub fn enqueue(&self, tid: Vtid) {
        let mut inner = self.inner.lock();
        if inner.threads.contains_key(&tid) && !inner.run_queue.contains(&tid) {
            inner.run_queue.push_back(tid);
        }
    }

    /// Make every thread suspended on a memory fault runnable again.
    /// They re-execute the faulting instruction and re-fault if their
    /// page is still missing.
    pub fn wake_waiting(&self) {
        let mut inner = self.inner.lock();
        let woken: Vec<Vtid> = inner
            .threads
            .iter()
            .filter(|(_, t)| {
                let mut ti = t.inner();
                if ti.wait_addr.is_some() && ti.status == ThreadStatus::Normal {
                    ti.wait_addr = None;
                    true
                } else {
                    false
                }
            })
            .map(|(tid, _)| *tid)
            .collect();
        for tid in woken {
            if !inner.run_queue.contains(&tid) {
                inner.run_queue.push_back(tid);
            }
        }
    }

    /// Run one scheduling slice: start the root thread if this node is
    /// the master and it has not run yet, then pick the next runnable
    /// thread round-robin and interpret it for one quantum.
    pub fn tick(self: &Arc<Self>, quantum: usize) -> TickStatus {
        if let Some(exited) = self.inner.lock().exited {
            return exited;
        }
        if let Err(WarpError::SHOULD_WAIT) = self.try_start_root() {
            return TickStatus::Idle;
        }
        let (tid, thread) = loop {
            let mut inner = self.inner.lock();
            let tid = match inner.run_queue.pop_front() {
                Some(tid) => tid,
                None => return TickStatus::Idle,
            };
            match inner.threads.get(&tid) {
                Some(t) if t.status() == ThreadStatus::Normal => break (tid, t.clone()),
                _ => continue,
            }
        };

        let outcome = interp::execute(self, &thread, quantum);
        match outcome {
            interp::Yield::Quantum | interp::Yield::BuiltinWait => {
                self.enqueue(tid);
                TickStatus::Running
            }
            interp::Yield::Fault(addr) => {
                trace!("{}:{} suspended on {}", self.pid, tid, addr);
                thread.inner().wait_addr = Some(addr);
                TickStatus::Running
            }
            interp::Yield::Warp => TickStatus::Running,
            interp::Yield::Finished => {
                debug!("{}:{} finished", self.pid, tid);
                self.finish_thread(&thread, false)
            }
            interp::Yield::Errored(err) => {
                warn!("{}:{} died: {:?}", self.pid, tid, err);
                self.finish_thread(&thread, true)
            }
        }
    }

    fn finish_thread(&self, thread: &Arc<Thread>, errored: bool) -> TickStatus {
        let tid = thread.tid;
        {
            let mut inner = self.inner.lock();
            inner.had_error |= errored;
            inner.run_queue.retain(|t| *t != tid);
            inner.threads.remove(&tid);
        }
        thread.set_status(if errored {
            ThreadStatus::Error
        } else {
            ThreadStatus::Finish
        });
        let tls = thread.tls();
        if !tls.is_non() {
            let _ = self.accessor().free(tls);
        }
        let mut inner = self.inner.lock();
        if inner.threads.is_empty() {
            let status = if inner.had_error {
                TickStatus::Error
            } else {
                TickStatus::Finish
            };
            inner.exited = Some(status);
            status
        } else {
            TickStatus::Running
        }
    }

    /// Kill every local thread. `errored` marks a process-wide fault.
    pub fn terminate(&self, errored: bool) {
        let mut inner = self.inner.lock();
        let threads: Vec<Arc<Thread>> = inner.threads.drain().map(|(_, t)| t).collect();
        inner.run_queue.clear();
        inner.had_error |= errored;
        inner.exited = Some(if inner.had_error {
            TickStatus::Error
        } else {
            TickStatus::Finish
        });
        drop(inner);
        for thread in threads {
            thread.set_status(if errored {
                ThreadStatus::Error
            } else {
                ThreadStatus::Finish
            });
        }
    }

    /// Terminal status, if the process is done on this node.
    pub fn exit_status(&self) -> Option<TickStatus> {
        self.inner.lock().exited
    }

    /// Write `code` to the result cell and finish the process (the exit
    /// builtin).
    pub fn exit(&self, code: i64) -> WarpResult {
        self.exit_from(None, code)
    }

    /// Like [`exit`], from inside the interpreter: the calling thread's
    /// state is under the interpreter's lock and finishes through the
    /// builtin's FinishThread return instead.
    ///
    /// [`exit`]: Process::exit
    pub(crate) fn exit_from(&self, current: Option<Vtid>, code: i64) -> WarpResult {
        let result_addr = self.result_cell()?;
        self.accessor().write::<i64>(result_addr, code)?;
        let threads: Vec<(Vtid, Arc<Thread>)> = {
            let mut inner = self.inner.lock();
            inner.run_queue.clear();
            inner.exited = Some(TickStatus::Finish);
            inner.threads.drain().collect()
        };
        for (tid, thread) in threads {
            if Some(tid) != current {
                thread.set_status(ThreadStatus::Finish);
            }
        }
        Ok(())
    }

    /// The exit-code cell named by the control block.
    pub fn result_cell(&self) -> WarpResult<VAddr> {
        let cached = self.inner.lock().result_addr;
        if !cached.is_non() {
            return Ok(cached);
        }
        let proc_addr = self.inner.lock().proc_addr;
        if proc_addr.is_non() {
            return Err(WarpError::BAD_STATE);
        }
        let (_, bytes) = self.accessor().read_object(proc_addr)?;
        let (_, result_addr) = decode_control_block(&bytes)?;
        self.inner.lock().result_addr = result_addr;
        Ok(result_addr)
    }

    /// Read the process exit code from the result cell.
    pub fn exit_code(&self) -> WarpResult<i64> {
        let result_addr = self.result_cell()?;
        self.accessor().read::<i64>(result_addr)
    }

    /// Start the root thread on the master once the control block is
    /// readable. `SHOULD_WAIT` while it is being published or fetched.
    fn try_start_root(self: &Arc<Self>) -> WarpResult {
        {
            let inner = self.inner.lock();
            if inner.root_started
                || inner.proc_addr.is_non()
                || self.memory.node() != self.master_nid
            {
                return Ok(());
            }
        }
        let proc_addr = self.inner.lock().proc_addr;
        let (_, bytes) = self.accessor().read_object(proc_addr)?;
        let (root_func, result_addr) = decode_control_block(&bytes)?;
        let root_tid = self.inner.lock().root_tid;
        let thread = self.spawn_thread(root_tid, root_func, &[], result_addr)?;
        info!("{}: root thread {} started", self.pid, thread.tid);
        let mut inner = self.inner.lock();
        inner.root_started = true;
        inner.result_addr = result_addr;
        Ok(())
    }

    /// Create a thread with a one-frame call stack at the entry block of
    /// `func_addr` (process startup and the fork builtin).
    pub fn create_thread(self: &Arc<Self>, func_addr: VAddr, args: &[u64]) -> WarpResult<Vtid> {
        let tid = {
            let mut inner = self.inner.lock();
            let tid = inner.next_tid;
            inner.next_tid += 1;
            tid
        };
        let thread = self.spawn_thread(tid, func_addr, args, VAddr::NON)?;
        Ok(thread.tid)
    }

    fn spawn_thread(
        self: &Arc<Self>,
        tid: Vtid,
        func_addr: VAddr,
        args: &[u64],
        ret_addr: VAddr,
    ) -> WarpResult<Arc<Thread>> {
        let func = self.func_store(func_addr)?;
        let acc = self.accessor();
        let frame = self.push_activation(&func, ret_addr)?;
        for (i, arg) in args.iter().enumerate() {
            let offset = *func
                .param_offsets
                .get(i)
                .ok_or(WarpError::INVALID_ARGS)?;
            let prim = interp::primitive_type(func.param_types[i]).ok_or(WarpError::INVALID_TYPE)?;
            let mut bytes = vec![0u8; prim.size as usize];
            bytes.copy_from_slice(&arg.to_le_bytes()[..prim.size as usize]);
            acc.write_bytes(frame.stack.add(offset as u64), &bytes)?;
        }
        let tls = acc.alloc(AddrClass::Tls, TLS_PAGE_SIZE)?;

        let thread = Thread::create(tid);
        {
            let mut ti = thread.inner();
            ti.frames.push(frame);
            ti.tls = tls;
            ti.status = ThreadStatus::Normal;
        }
        thread.set_status(ThreadStatus::Normal);
        let mut inner = self.inner.lock();
        inner.threads.insert(tid, thread.clone());
        inner.run_queue.push_back(tid);
        Ok(thread)
    }

    /// Allocate a stack page for one activation of `func` and seed its
    /// alloca watermark.
    pub(crate) fn push_activation(
        &self,
        func: &Arc<FuncStore>,
        ret_addr: VAddr,
    ) -> WarpResult<StackInfo> {
        let acc = self.accessor();
        let stack = acc.alloc(AddrClass::Stack, func.stack_size.max(STACK_PAGE_SIZE as u32) as usize)?;
        let watermark = crate::memory::align_up((STACK_REG_BASE + func.reg_size) as u64, 8);
        acc.write::<u64>(stack, watermark)?;
        let mut frame = StackInfo::new(func.addr, ret_addr, 0, 0, stack);
        frame.func_cache = Some(func.clone());
        Ok(frame)
    }

    /// Decoded function at `func_addr`, from the cache or the page.
    pub fn func_store(&self, func_addr: VAddr) -> WarpResult<Arc<FuncStore>> {
        if func_addr.class() != AddrClass::Function {
            return Err(WarpError::INVALID_ARGS);
        }
        if let Some(f) = self.inner.lock().funcs.get(&func_addr) {
            return Ok(f.clone());
        }
        let (base, bytes) = self.accessor().read_object(func_addr)?;
        let func = FuncStore::decode(base, &bytes)?;
        self.inner.lock().funcs.insert(base, func.clone());
        Ok(func)
    }

    /// Type descriptor at `ty_addr`: a well-known primitive or a decoded
    /// type page.
    pub fn type_store(&self, ty_addr: VAddr) -> WarpResult<Arc<TypeStore>> {
        if let Some(t) = interp::primitive_type(ty_addr) {
            return Ok(t);
        }
        if ty_addr.class() != AddrClass::Type {
            return Err(WarpError::INVALID_TYPE);
        }
        if let Some(t) = self.inner.lock().types.get(&ty_addr) {
            return Ok(t.clone());
        }
        let (base, bytes) = self.accessor().read_object(ty_addr)?;
        let ty = TypeStore::decode(base, &bytes)?;
        self.inner.lock().types.insert(base, ty.clone());
        Ok(ty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ident::NodeId;
    use crate::memory::{MemoryDelegate, MemoryMessage};

    struct NullDelegate;
    impl MemoryDelegate for NullDelegate {
        fn memory_send(&self, _pid: &Vpid, _dst: NodeId, _msg: MemoryMessage) {}
    }

    fn local_process() -> Arc<Process> {
        let nid = NodeId::from_raw(2);
        let memory = VMemory::new(nid, Vpid::new("p"), nid, Arc::new(NullDelegate));
        Process::create(Vpid::new("p"), nid, memory)
    }

    #[test]
    fn control_block_round_trip() {
        let bytes = encode_control_block(VAddr(0x11), VAddr(0x22));
        let (f, r) = decode_control_block(&bytes).unwrap();
        assert_eq!(f, VAddr(0x11));
        assert_eq!(r, VAddr(0x22));
        assert!(decode_control_block(&bytes[..8]).is_err());
    }

    #[test]
    fn idle_before_activation() {
        let proc = local_process();
        assert_eq!(proc.tick(DEFAULT_QUANTUM), TickStatus::Idle);
    }

    #[test]
    fn terminate_latches_the_exit() {
        let proc = local_process();
        assert_eq!(proc.exit_status(), None);
        proc.terminate(false);
        assert_eq!(proc.exit_status(), Some(TickStatus::Finish));
        assert_eq!(proc.tick(DEFAULT_QUANTUM), TickStatus::Finish);
    }
}
