//! ProcessWarp node host.
//!
//! A [`Node`] wires one [`Scheduler`] and the [`VMachine`]s it hosts to
//! a byte [`Transport`], implementing every outward capability the core
//! is parameterized on. The [`Fleet`] drives several nodes over an
//! in-memory loopback wire deterministically, which is how the demo
//! runner and the end-to-end tests exercise multi-node behavior.

pub mod transport;

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, Weak};

use serde::Deserialize;
use serde_json::Value;

use warp_object::builtin::gui::GuiDelegate;
use warp_object::ident::{NodeId, Vpid, Vtid};
use warp_object::memory::{AddrClass, MemoryDelegate, MemoryMessage, VAddr};
use warp_object::packet::{Module, Packet};
use warp_object::task::{encode_control_block, TickStatus};
use warp_object::vmachine::{VMachine, VMachineDelegate};
use warp_object::warp::{Scheduler, SchedulerDelegate, SchedulerMessage};
use warp_object::{WarpError, WarpResult};

use transport::{LoopbackTransport, Transport};

/// Host-side tunables, deserializable from a config file in the manner
/// of the daemon's machine configuration; defaults live in code.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Virtual milliseconds that pass per fleet step.
    pub step_ms: u64,
    /// Step bound for `Fleet::run`.
    pub run_limit: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            step_ms: 10,
            run_limit: 20_000,
        }
    }
}

/// One peer of the fleet.
pub struct Node {
    nid: NodeId,
    transport: Arc<dyn Transport>,
    scheduler: Scheduler,
    vms: Mutex<HashMap<Vpid, Arc<VMachine>>>,
    local_queue: Mutex<VecDeque<Packet>>,
    hub: Arc<NodeHub>,
    gui_created: Mutex<Vec<Vpid>>,
}

/// The delegate implementations handed into the core. Holds the node
/// weakly so VMachines (owned by the node) never keep it alive.
struct NodeHub {
    node: Mutex<Weak<Node>>,
}

impl NodeHub {
    fn node(&self) -> Option<Arc<Node>> {
        self.node.lock().unwrap().upgrade()
    }
}

impl Node {
    /// Create a node on `transport`.
    pub fn new(nid: NodeId, transport: Arc<dyn Transport>) -> Arc<Node> {
        let hub = Arc::new(NodeHub {
            node: Mutex::new(Weak::new()),
        });
        let node = Arc::new(Node {
            nid,
            transport,
            scheduler: Scheduler::new(nid, hub.clone()),
            vms: Mutex::new(HashMap::new()),
            local_queue: Mutex::new(VecDeque::new()),
            hub: hub.clone(),
            gui_created: Mutex::new(Vec::new()),
        });
        *hub.node.lock().unwrap() = Arc::downgrade(&node);
        node
    }

    /// This node's id.
    pub fn nid(&self) -> NodeId {
        self.nid
    }

    /// The node's scheduler.
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// The VM hosting `pid`, if any.
    pub fn vm(&self, pid: &Vpid) -> Option<Arc<VMachine>> {
        self.vms.lock().unwrap().get(pid).cloned()
    }

    /// Processes a GUI surface was requested for.
    pub fn gui_created(&self) -> Vec<Vpid> {
        self.gui_created.lock().unwrap().clone()
    }

    /// Host `pid` without starting a root thread here; used by loaders
    /// that publish pages before the process starts, and by nodes that
    /// only receive warped-in threads. Fills in the control-block
    /// address from the directory when the process is already known.
    pub fn host_vm(&self, pid: &Vpid, master_nid: NodeId) -> Arc<VMachine> {
        match self.scheduler.process_info(pid) {
            Some(tree) => self.create_vm(pid, tree.root_tid, tree.proc_addr, tree.master_nid),
            None => self.create_vm(pid, 0, VAddr::NON, master_nid),
        }
    }

    /// Issue the `activate` control command for `pid`.
    pub fn activate(&self, pid: &Vpid, root_tid: Vtid, proc_addr: VAddr, master_nid: NodeId) {
        let cmd = serde_json::json!({
            "command": "activate",
            "root_tid": root_tid,
            "proc_addr": proc_addr,
            "master_nid": master_nid,
        });
        if let Err(err) = self.scheduler.recv_command(pid, &cmd) {
            log::warn!("{:?}: activate {} failed: {:?}", self.nid, pid, err);
        }
    }

    fn create_vm(
        &self,
        pid: &Vpid,
        root_tid: Vtid,
        proc_addr: VAddr,
        master_nid: NodeId,
    ) -> Arc<VMachine> {
        let mut vms = self.vms.lock().unwrap();
        if let Some(vm) = vms.get(pid) {
            if !proc_addr.is_non() {
                vm.process().activate(root_tid, proc_addr);
            }
            return vm.clone();
        }
        let vm = VMachine::new(
            self.nid,
            pid.clone(),
            root_tid,
            proc_addr,
            master_nid,
            self.hub.clone(),
            self.hub.clone(),
            Default::default(),
        );
        vms.insert(pid.clone(), vm.clone());
        vm
    }

    /// Parse and dispatch one transport delivery.
    pub fn deliver(&self, bytes: &[u8]) {
        match Packet::from_bytes(bytes) {
            Ok(packet) => self.dispatch(packet),
            Err(_) => log::warn!("{:?}: dropping unparseable packet", self.nid),
        }
    }

    fn dispatch(&self, packet: Packet) {
        let src = packet.src_nid;
        let result = match packet.module {
            Module::Scheduler => self.scheduler.recv_packet(&packet.pid, src, &packet.content),
            Module::Controller => self.scheduler.recv_command(&packet.pid, &packet.content),
            Module::Memory | Module::Vm => {
                let vm = self.vm(&packet.pid).or_else(|| {
                    // An inbound migration may land before this node
                    // hosts the process: admit it from the directory.
                    let is_warp_request = packet.module == Module::Vm
                        && packet.content.get("command").and_then(Value::as_str)
                            == Some("warp_request");
                    if is_warp_request && self.scheduler.admit_warp(&packet.pid).is_ok() {
                        self.vm(&packet.pid)
                    } else {
                        None
                    }
                });
                match vm {
                    Some(vm) => vm.recv_packet(src, packet.module, &packet.content),
                    None => Err(WarpError::PROCESS_GONE),
                }
            }
        };
        if let Err(err) = result {
            log::warn!(
                "{:?}: dropped {:?} packet for {}: {:?}",
                self.nid,
                packet.module,
                packet.pid,
                err
            );
        }
    }

    /// Drain the local command queue and run every hosted VM for one
    /// slice. Returns whether any work happened.
    pub fn pump(&self, now: u64) -> bool {
        let mut busy = false;
        loop {
            let next = self.local_queue.lock().unwrap().pop_front();
            match next {
                Some(packet) => {
                    busy = true;
                    self.dispatch(packet);
                }
                None => break,
            }
        }
        let vms: Vec<Arc<VMachine>> = self.vms.lock().unwrap().values().cloned().collect();
        for vm in vms {
            if vm.execute() == TickStatus::Running {
                busy = true;
            }
            vm.poll(now);
        }
        busy
    }

    fn route(&self, packet: Packet) {
        if packet.dst_nid == self.nid {
            self.local_queue.lock().unwrap().push_back(packet);
            return;
        }
        match packet.to_bytes() {
            Ok(bytes) => self.transport.send(self.nid, packet.dst_nid, bytes),
            Err(_) => log::error!("{:?}: failed to frame packet", self.nid),
        }
    }
}

impl SchedulerDelegate for NodeHub {
    fn scheduler_create_vm(&self, pid: &Vpid, root_tid: Vtid, proc_addr: VAddr, master_nid: NodeId) {
        if let Some(node) = self.node() {
            node.create_vm(pid, root_tid, proc_addr, master_nid);
        }
    }

    fn scheduler_create_gui(&self, pid: &Vpid) {
        if let Some(node) = self.node() {
            if let Some(vm) = node.vm(pid) {
                vm.initialize_gui(node.hub.clone());
            }
            node.gui_created.lock().unwrap().push(pid.clone());
            log::info!("{:?}: gui surface requested for {}", node.nid, pid);
        }
    }

    fn scheduler_send_command(&self, pid: &Vpid, module: Module, content: Value) {
        if let Some(node) = self.node() {
            node.route(Packet {
                pid: pid.clone(),
                dst_nid: node.nid,
                src_nid: node.nid,
                module,
                content,
            });
        }
    }

    fn scheduler_send_packet(&self, pid: &Vpid, dst_nid: NodeId, module: Module, content: Value) {
        if let Some(node) = self.node() {
            node.route(Packet {
                pid: pid.clone(),
                dst_nid,
                src_nid: node.nid,
                module,
                content,
            });
        }
    }
}

impl VMachineDelegate for NodeHub {
    fn vm_send_packet(&self, pid: &Vpid, dst_nid: NodeId, module: Module, content: Value) {
        if let Some(node) = self.node() {
            node.route(Packet {
                pid: pid.clone(),
                dst_nid,
                src_nid: node.nid,
                module,
                content,
            });
        }
    }

    fn vm_finish(&self, pid: &Vpid) {
        if let Some(node) = self.node() {
            log::info!("{:?}: process {} finished", node.nid, pid);
            // Announce the departure so peer directories forget this node.
            let leave = SchedulerMessage::Terminate { nid: node.nid };
            if let Ok(content) = serde_json::to_value(&leave) {
                node.route(Packet {
                    pid: pid.clone(),
                    dst_nid: NodeId::BROADCAST,
                    src_nid: node.nid,
                    module: Module::Scheduler,
                    content,
                });
            }
        }
    }

    fn vm_finish_thread(&self, pid: &Vpid, tid: Vtid) {
        if let Some(node) = self.node() {
            log::info!("{:?}: thread {}:{} left this node", node.nid, pid, tid);
        }
    }

    fn vm_error(&self, pid: &Vpid, message: &str) {
        if let Some(node) = self.node() {
            log::warn!("{:?}: process {} failed: {}", node.nid, pid, message);
        }
    }
}

impl MemoryDelegate for NodeHub {
    fn memory_send(&self, pid: &Vpid, dst: NodeId, msg: MemoryMessage) {
        if let Some(node) = self.node() {
            match serde_json::to_value(&msg) {
                Ok(content) => node.route(Packet {
                    pid: pid.clone(),
                    dst_nid: dst,
                    src_nid: node.nid,
                    module: Module::Memory,
                    content,
                }),
                Err(_) => log::error!("{:?}: failed to encode memory message", node.nid),
            }
        }
    }
}

impl GuiDelegate for NodeHub {
    fn gui_create(&self, pid: &Vpid) -> WarpResult {
        if let Some(node) = self.node() {
            node.gui_created.lock().unwrap().push(pid.clone());
        }
        Ok(())
    }

    fn gui_script(&self, pid: &Vpid, script: &str) -> WarpResult {
        log::info!("gui script from {}: {}", pid, script);
        Ok(())
    }
}

/// Several nodes on one loopback wire, stepped deterministically.
pub struct Fleet {
    pub config: NodeConfig,
    transport: Arc<LoopbackTransport>,
    nodes: Vec<Arc<Node>>,
    now: u64,
}

impl Fleet {
    /// A fleet of `n` nodes with ids 2, 3, ...
    pub fn new(n: usize) -> Fleet {
        Fleet::with_config(n, NodeConfig::default())
    }

    /// A fleet with explicit tunables.
    pub fn with_config(n: usize, config: NodeConfig) -> Fleet {
        let transport = Arc::new(LoopbackTransport::new());
        let mut nodes = Vec::with_capacity(n);
        for i in 0..n {
            let nid = NodeId::from_raw(2 + i as u128);
            transport.register(nid);
            nodes.push(Node::new(nid, transport.clone()));
        }
        Fleet {
            config,
            transport,
            nodes,
            now: 0,
        }
    }

    /// The `i`-th node.
    pub fn node(&self, i: usize) -> &Arc<Node> {
        &self.nodes[i]
    }

    /// Current virtual time.
    pub fn now(&self) -> u64 {
        self.now
    }

    /// Deliver pending traffic to every node and run each for one slice.
    pub fn step(&mut self) -> bool {
        let mut busy = false;
        for node in &self.nodes {
            for (_, bytes) in self.transport.drain(node.nid()) {
                busy = true;
                node.deliver(&bytes);
            }
            busy |= node.pump(self.now);
        }
        self.now += self.config.step_ms;
        busy || self.transport.pending() > 0
    }

    /// Step only node `i`, leaving the rest of the fleet frozen.
    pub fn step_node(&mut self, i: usize) -> bool {
        let node = &self.nodes[i];
        let mut busy = false;
        for (_, bytes) in self.transport.drain(node.nid()) {
            busy = true;
            node.deliver(&bytes);
        }
        busy |= node.pump(self.now);
        self.now += self.config.step_ms;
        busy
    }

    /// Step until the fleet goes quiet or the step bound is hit.
    pub fn run(&mut self) {
        for _ in 0..self.config.run_limit {
            if !self.step() {
                return;
            }
        }
        log::warn!("fleet still busy after {} steps", self.config.run_limit);
    }

    /// Step a fixed number of times.
    pub fn run_steps(&mut self, steps: usize) {
        for _ in 0..steps {
            self.step();
        }
    }
}

// ---- loader helpers ----
//
// Loading a program image from a file format is outside the core; these
// helpers are the minimal loader the demo runner and the tests share:
// publish pages through a process's own accessor on its master node.

/// Install an encoded function page; returns its address.
pub fn install_function(vm: &VMachine, encoded: &[u8]) -> WarpResult<VAddr> {
    let acc = vm.process().accessor();
    let page = acc.alloc(AddrClass::Function, encoded.len())?;
    acc.write_bytes(page, encoded)?;
    Ok(page)
}

/// Allocate the result cell and publish the process control block.
/// Returns `(proc_addr, result_addr)`.
pub fn publish_control_block(vm: &VMachine, root_func: VAddr) -> WarpResult<(VAddr, VAddr)> {
    let acc = vm.process().accessor();
    let result = acc.alloc(AddrClass::Pod, 8)?;
    let pcb_bytes = encode_control_block(root_func, result);
    let pcb = acc.alloc(AddrClass::ProcCtrl, pcb_bytes.len())?;
    acc.write_bytes(pcb, &pcb_bytes)?;
    Ok((pcb, result))
}

/// Allocate a pod constant.
pub fn install_const(vm: &VMachine, bytes: &[u8]) -> WarpResult<VAddr> {
    let acc = vm.process().accessor();
    let page = acc.alloc(AddrClass::Pod, bytes.len())?;
    acc.write_bytes(page, bytes)?;
    Ok(page)
}
