//! The GUI bridge.
//!
//! The core never renders anything: `create` asks the hosting node to
//! instantiate a GUI surface for the process, `script` forwards a
//! JSON-encoded command to the frontend. Both delegate outward through a
//! capability registered as the builtin's resource parameter.

use super::{read_param_i64, read_param_vaddr, BuiltinContext, BuiltinParam, BuiltinRegistry,
            PostProc};
use crate::ident::Vpid;
use crate::memory::VAddr;
use crate::{WarpError, WarpResult};
use alloc::string::String;
use alloc::sync::Arc;
use core::any::Any;

/// Outward capability of the GUI builtins.
pub trait GuiDelegate: Send + Sync {
    /// Instantiate a GUI surface for the process on the local node.
    fn gui_create(&self, pid: &Vpid) -> WarpResult;
    /// Forward a JSON command to the frontend.
    fn gui_script(&self, pid: &Vpid, script: &str) -> WarpResult;
}

/// `gui.create()`.
pub fn create(
    ctx: &mut BuiltinContext<'_>,
    param: &BuiltinParam,
    dst: VAddr,
    _src: &[u8],
) -> WarpResult<PostProc> {
    let delegate = param.resource::<Arc<dyn GuiDelegate>>()?;
    delegate.gui_create(&ctx.proc.pid)?;
    if !dst.is_non() {
        ctx.accessor().write::<i32>(dst, 0)?;
    }
    Ok(PostProc::Normal)
}

/// `gui.script(ptr, len)`: the command must parse as JSON before it
/// leaves the process.
pub fn script(
    ctx: &mut BuiltinContext<'_>,
    param: &BuiltinParam,
    _dst: VAddr,
    src: &[u8],
) -> WarpResult<PostProc> {
    let delegate = param.resource::<Arc<dyn GuiDelegate>>()?;
    let mut seek = 0;
    let ptr = read_param_vaddr(src, &mut seek)?;
    let len = read_param_i64(src, &mut seek)? as usize;
    let bytes = ctx.accessor().read_bytes(ptr, len)?;
    let text = String::from_utf8(bytes).map_err(|_| WarpError::INVALID_ARGS)?;
    if serde_json::from_str::<serde_json::Value>(&text).is_err() {
        return Err(WarpError::INVALID_ARGS);
    }
    delegate.gui_script(&ctx.proc.pid, &text)?;
    Ok(PostProc::Normal)
}

/// Register the GUI set with its outward capability.
pub fn regist(registry: &BuiltinRegistry, delegate: Arc<dyn GuiDelegate>) {
    let resource: Arc<dyn Any + Send + Sync> = Arc::new(delegate);
    registry.register("gui.create", create, BuiltinParam::Resource(resource.clone()));
    registry.register("gui.script", script, BuiltinParam::Resource(resource));
}

#[cfg(test)]
mod tests {
    use super::super::push_param;
    use super::*;
    use crate::ident::NodeId;
    use crate::memory::{AddrClass, MemoryDelegate, MemoryMessage, VMemory};
    use crate::task::{Process, Thread};
    use alloc::vec::Vec;
    use std::sync::Mutex as StdMutex;

    struct NullDelegate;
    impl MemoryDelegate for NullDelegate {
        fn memory_send(&self, _pid: &Vpid, _dst: NodeId, _msg: MemoryMessage) {}
    }

    #[derive(Default)]
    struct RecordingGui {
        created: StdMutex<u32>,
        scripts: StdMutex<Vec<String>>,
    }

    impl GuiDelegate for RecordingGui {
        fn gui_create(&self, _pid: &Vpid) -> WarpResult {
            *self.created.lock().unwrap() += 1;
            Ok(())
        }
        fn gui_script(&self, _pid: &Vpid, script: &str) -> WarpResult {
            self.scripts.lock().unwrap().push(String::from(script));
            Ok(())
        }
    }

    #[test]
    fn create_and_script() {
        let nid = NodeId::from_raw(2);
        let memory = VMemory::new(nid, Vpid::new("p"), nid, Arc::new(NullDelegate));
        let proc = Process::create(Vpid::new("p"), nid, memory);
        let gui = Arc::new(RecordingGui::default());
        regist(proc.builtins(), gui.clone());

        let acc = proc.accessor();
        let text = br#"{"command":"draw","x":1}"#;
        let page = acc.alloc(AddrClass::Array, text.len()).unwrap();
        acc.write_bytes(page, text).unwrap();

        let thread = Thread::create(1);
        let mut ti = thread.inner();
        let mut ctx = BuiltinContext {
            proc: &proc,
            tid: 1,
            thread: &mut ti,
        };

        let entry = proc.builtins().resolve("gui.create").unwrap();
        (entry.func)(&mut ctx, &entry.param, VAddr::NON, &[]).unwrap();
        assert_eq!(*gui.created.lock().unwrap(), 1);

        let entry = proc.builtins().resolve("gui.script").unwrap();
        let mut buf = Vec::new();
        push_param(&mut buf, &page.0.to_le_bytes());
        push_param(&mut buf, &(text.len() as i64).to_le_bytes());
        (entry.func)(&mut ctx, &entry.param, VAddr::NON, &buf).unwrap();
        assert_eq!(gui.scripts.lock().unwrap()[0], core::str::from_utf8(text).unwrap());

        // Non-JSON scripts never leave the process.
        let bad = b"not json";
        let page = acc.alloc(AddrClass::Array, bad.len()).unwrap();
        acc.write_bytes(page, bad).unwrap();
        let mut buf = Vec::new();
        push_param(&mut buf, &page.0.to_le_bytes());
        push_param(&mut buf, &(bad.len() as i64).to_le_bytes());
        assert_eq!(
            (entry.func)(&mut ctx, &entry.param, VAddr::NON, &buf),
            Err(WarpError::INVALID_ARGS)
        );
    }
}
