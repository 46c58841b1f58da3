//! The per-node scheduler.
//!
//! One instance per node. It keeps a directory of the processes it has
//! heard about (which nodes host them, who the master is, where the
//! control block lives), consumes the daemon's control commands, and
//! decides what happens to inbound migrations for processes this node
//! does not host yet. Placement policy is deliberately thin: the
//! requested destination is honored, and the master node is the one
//! that creates a process on first sighting.

use crate::ident::{NodeId, Vpid, Vtid};
use crate::memory::VAddr;
use crate::packet::Module;
use crate::{WarpError, WarpResult};
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use spin::Mutex;

/// Outward capability of the scheduler.
pub trait SchedulerDelegate: Send + Sync {
    /// Create (or re-use) the local VM hosting `pid`.
    fn scheduler_create_vm(&self, pid: &Vpid, root_tid: Vtid, proc_addr: VAddr, master_nid: NodeId);
    /// Instantiate a GUI surface for `pid` on this node.
    fn scheduler_create_gui(&self, pid: &Vpid);
    /// Route a command to a local module.
    fn scheduler_send_command(&self, pid: &Vpid, module: Module, content: Value);
    /// Send a packet to a module on another node.
    fn scheduler_send_packet(&self, pid: &Vpid, dst_nid: NodeId, module: Module, content: Value);
}

/// Where one process runs, as far as this node has heard.
#[derive(Clone)]
pub struct ProcessTree {
    pub master_nid: NodeId,
    pub root_tid: Vtid,
    pub proc_addr: VAddr,
    /// Hosting nodes and the threads last reported there.
    pub nodes: BTreeMap<NodeId, Vec<Vtid>>,
}

/// Scheduler-to-scheduler packets.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum SchedulerMessage {
    /// `nid` begins (or keeps) hosting the process.
    Activate {
        root_tid: Vtid,
        proc_addr: VAddr,
        master_nid: NodeId,
        nid: NodeId,
    },
    /// The sender stopped hosting the process.
    Terminate { nid: NodeId },
}

#[derive(Deserialize)]
struct ActivateCmd {
    root_tid: Vtid,
    proc_addr: VAddr,
    master_nid: NodeId,
}

/// The per-node scheduler.
pub struct Scheduler {
    nid: NodeId,
    delegate: Arc<dyn SchedulerDelegate>,
    inner: Mutex<HashMap<Vpid, ProcessTree>>,
}

impl Scheduler {
    /// Create the scheduler for this node.
    pub fn new(nid: NodeId, delegate: Arc<dyn SchedulerDelegate>) -> Self {
        Scheduler {
            nid,
            delegate,
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Directory entry for `pid`, if any.
    pub fn process_info(&self, pid: &Vpid) -> Option<ProcessTree> {
        self.inner.lock().get(pid).cloned()
    }

    /// Handle a control-plane command addressed to this node.
    pub fn recv_command(&self, pid: &Vpid, content: &Value) -> WarpResult {
        let command = content
            .get("command")
            .and_then(Value::as_str)
            .ok_or(WarpError::INVALID_ARGS)?;
        match command {
            "activate" => {
                let cmd: ActivateCmd =
                    serde_json::from_value(content.clone()).map_err(|_| WarpError::INVALID_ARGS)?;
                self.record(pid, cmd.master_nid, cmd.root_tid, cmd.proc_addr, self.nid);
                self.delegate
                    .scheduler_create_vm(pid, cmd.root_tid, cmd.proc_addr, cmd.master_nid);
                let announce = SchedulerMessage::Activate {
                    root_tid: cmd.root_tid,
                    proc_addr: cmd.proc_addr,
                    master_nid: cmd.master_nid,
                    nid: self.nid,
                };
                self.delegate.scheduler_send_packet(
                    pid,
                    NodeId::BROADCAST,
                    Module::Scheduler,
                    serde_json::to_value(&announce).map_err(|_| WarpError::INTERNAL)?,
                );
                Ok(())
            }
            // Thread migration, outbound and inbound, is the VM's
            // business; the scheduler only routes it.
            "warp" | "warp_request" | "terminate" => {
                if command == "terminate" {
                    self.inner.lock().remove(pid);
                }
                self.delegate
                    .scheduler_send_command(pid, Module::Vm, content.clone());
                Ok(())
            }
            "create_gui" => {
                self.delegate.scheduler_create_gui(pid);
                Ok(())
            }
            _ => {
                warn!("scheduler: unknown command {:?} for {}", command, pid);
                Err(WarpError::NOT_SUPPORTED)
            }
        }
    }

    /// Handle a scheduler packet from another node.
    pub fn recv_packet(&self, pid: &Vpid, src_nid: NodeId, content: &Value) -> WarpResult {
        let msg: SchedulerMessage =
            serde_json::from_value(content.clone()).map_err(|_| WarpError::INVALID_ARGS)?;
        match msg {
            SchedulerMessage::Activate {
                root_tid,
                proc_addr,
                master_nid,
                nid,
            } => {
                self.record(pid, master_nid, root_tid, proc_addr, nid);
                // The master hosts every process of its fleet account:
                // first sighting of a foreign activation creates the VM.
                if master_nid == self.nid && nid != self.nid {
                    self.delegate
                        .scheduler_create_vm(pid, root_tid, proc_addr, master_nid);
                }
                Ok(())
            }
            SchedulerMessage::Terminate { nid } => {
                trace!("directory: {} left {:?} (via {:?})", pid, nid, src_nid);
                let mut inner = self.inner.lock();
                if let Some(tree) = inner.get_mut(pid) {
                    tree.nodes.remove(&nid);
                    if tree.nodes.is_empty() {
                        inner.remove(pid);
                    }
                }
                Ok(())
            }
        }
    }

    /// Decide whether an inbound warp for `pid` can land here, creating
    /// the hosting VM from directory knowledge when needed.
    pub fn admit_warp(&self, pid: &Vpid) -> WarpResult {
        match self.process_info(pid) {
            Some(tree) => {
                self.delegate
                    .scheduler_create_vm(pid, tree.root_tid, tree.proc_addr, tree.master_nid);
                if let Some(t) = self.inner.lock().get_mut(pid) {
                    t.nodes.entry(self.nid).or_default();
                }
                Ok(())
            }
            None => Err(WarpError::PROCESS_GONE),
        }
    }

    fn record(&self, pid: &Vpid, master_nid: NodeId, root_tid: Vtid, proc_addr: VAddr, nid: NodeId) {
        let mut inner = self.inner.lock();
        let tree = inner.entry(pid.clone()).or_insert_with(|| ProcessTree {
            master_nid,
            root_tid,
            proc_addr,
            nodes: BTreeMap::new(),
        });
        tree.nodes.entry(nid).or_default();
        debug!("directory: {} on {:?} (master {:?})", pid, nid, tree.master_nid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct Recorder {
        created: StdMutex<Vec<(Vpid, NodeId)>>,
        commands: StdMutex<Vec<(Vpid, Module)>>,
        packets: StdMutex<Vec<(NodeId, Module, Value)>>,
        guis: StdMutex<Vec<Vpid>>,
    }

    impl SchedulerDelegate for Recorder {
        fn scheduler_create_vm(&self, pid: &Vpid, _rt: Vtid, _pa: VAddr, master: NodeId) {
            self.created.lock().unwrap().push((pid.clone(), master));
        }
        fn scheduler_create_gui(&self, pid: &Vpid) {
            self.guis.lock().unwrap().push(pid.clone());
        }
        fn scheduler_send_command(&self, pid: &Vpid, module: Module, _content: Value) {
            self.commands.lock().unwrap().push((pid.clone(), module));
        }
        fn scheduler_send_packet(&self, _pid: &Vpid, dst: NodeId, module: Module, content: Value) {
            self.packets.lock().unwrap().push((dst, module, content));
        }
    }

    fn activate_cmd() -> Value {
        serde_json::json!({
            "command": "activate",
            "root_tid": 1,
            "proc_addr": 0x7000_0000_0000_0010u64,
            "master_nid": NodeId::from_raw(2),
        })
    }

    #[test]
    fn activate_creates_and_announces() {
        let delegate = Arc::new(Recorder::default());
        let sched = Scheduler::new(NodeId::from_raw(2), delegate.clone());
        let pid = Vpid::new("p1");
        sched.recv_command(&pid, &activate_cmd()).unwrap();

        assert_eq!(delegate.created.lock().unwrap().len(), 1);
        let packets = delegate.packets.lock().unwrap();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].0, NodeId::BROADCAST);
        assert_eq!(packets[0].1, Module::Scheduler);

        let tree = sched.process_info(&pid).unwrap();
        assert_eq!(tree.master_nid, NodeId::from_raw(2));
        assert!(tree.nodes.contains_key(&NodeId::from_raw(2)));
    }

    #[test]
    fn directory_learns_from_announcements() {
        let delegate = Arc::new(Recorder::default());
        let sched = Scheduler::new(NodeId::from_raw(3), delegate.clone());
        let pid = Vpid::new("p1");
        let announce = serde_json::to_value(SchedulerMessage::Activate {
            root_tid: 1,
            proc_addr: VAddr(0x10),
            master_nid: NodeId::from_raw(2),
            nid: NodeId::from_raw(2),
        })
        .unwrap();
        sched.recv_packet(&pid, NodeId::from_raw(2), &announce).unwrap();

        let tree = sched.process_info(&pid).unwrap();
        assert!(tree.nodes.contains_key(&NodeId::from_raw(2)));
        // Not the master: no VM was created here.
        assert!(delegate.created.lock().unwrap().is_empty());

        // With directory knowledge, an inbound warp can land.
        sched.admit_warp(&pid).unwrap();
        assert_eq!(delegate.created.lock().unwrap().len(), 1);
        assert!(sched.admit_warp(&Vpid::new("ghost")).is_err());
    }

    #[test]
    fn warp_command_routes_to_vm() {
        let delegate = Arc::new(Recorder::default());
        let sched = Scheduler::new(NodeId::from_raw(2), delegate.clone());
        let pid = Vpid::new("p1");
        let cmd = serde_json::json!({
            "command": "warp",
            "tid": 1,
            "dst_nid": NodeId::from_raw(3),
        });
        sched.recv_command(&pid, &cmd).unwrap();
        assert_eq!(delegate.commands.lock().unwrap()[0], (pid.clone(), Module::Vm));
        assert!(sched
            .recv_command(&pid, &serde_json::json!({"command": "??"}))
            .is_err());
    }

    #[test]
    fn gui_command() {
        let delegate = Arc::new(Recorder::default());
        let sched = Scheduler::new(NodeId::from_raw(2), delegate.clone());
        let pid = Vpid::new("p1");
        sched
            .recv_command(&pid, &serde_json::json!({"command": "create_gui"}))
            .unwrap();
        assert_eq!(delegate.guis.lock().unwrap()[0], pid);
    }
}
