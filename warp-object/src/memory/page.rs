//! One unit of distributed ownership.

use crate::ident::NodeId;
use alloc::collections::BTreeSet;
use alloc::vec::Vec;

/// Local view of a page's place in the coherence protocol.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum PageState {
    /// No usable local copy.
    Invalid,
    /// A read-only replica; the owner lives at `home_hint`.
    CachedReadonly,
    /// This node owns the page and has published it to readers.
    OwnedReadonly,
    /// This node owns the page exclusively for writing.
    OwnedWritable,
}

bitflags! {
    /// Bookkeeping bits a page carries alongside its coherence state.
    #[derive(Default)]
    pub struct PageFlags: u8 {
        /// Written since the last write-back to the copy set.
        const DIRTY    = 1 << 0;
        /// The allocation was freed; reclaim once invalidations complete.
        const RELEASED = 1 << 1;
    }
}

/// A page: the contents of one allocation plus its ownership bookkeeping.
///
/// `copy_set` is meaningful only while this node is the owner; during
/// ownership transfers it may transiently be a superset of the real
/// replica holders. `epoch` is bumped on every ownership transfer and on
/// every publish, and never decreases on any node.
pub struct Page {
    /// Coherence state of the local copy.
    pub state: PageState,
    /// Page bytes; empty while `Invalid`.
    pub content: Vec<u8>,
    /// Allocation length. Stays known even when the content is dropped.
    pub len: usize,
    /// Nodes known to hold a CachedReadonly replica.
    pub copy_set: BTreeSet<NodeId>,
    /// Last known owner, if not this node. `NodeId::NONE` when unknown.
    pub home_hint: NodeId,
    /// Monotonic per-page counter linearizing coherence messages.
    pub epoch: u64,
    /// Dirty / released bookkeeping.
    pub flags: PageFlags,
}

impl Page {
    /// A freshly created page, owned writable by its first writer.
    pub fn new_owned(content: Vec<u8>) -> Self {
        let len = content.len();
        Page {
            state: PageState::OwnedWritable,
            content,
            len,
            copy_set: BTreeSet::new(),
            home_hint: NodeId::NONE,
            epoch: 0,
            flags: PageFlags::empty(),
        }
    }

    /// A replica installed from a remote reply.
    pub fn new_cached(content: Vec<u8>, epoch: u64, home: NodeId) -> Self {
        let len = content.len();
        Page {
            state: PageState::CachedReadonly,
            content,
            len,
            copy_set: BTreeSet::new(),
            home_hint: home,
            epoch,
            flags: PageFlags::empty(),
        }
    }

    /// Whether the local bytes can be read.
    pub fn is_resident(&self) -> bool {
        self.state != PageState::Invalid
    }

    /// Whether this node is the owner.
    pub fn is_owned(&self) -> bool {
        matches!(self.state, PageState::OwnedReadonly | PageState::OwnedWritable)
    }

    /// Whether the page was written since its last write-back.
    pub fn is_dirty(&self) -> bool {
        self.flags.contains(PageFlags::DIRTY)
    }

    /// Whether the allocation was freed and awaits reclamation.
    pub fn is_released(&self) -> bool {
        self.flags.contains(PageFlags::RELEASED)
    }

    /// Drop the local copy, keeping only the length and the owner hint.
    pub fn invalidate(&mut self, home: NodeId) {
        self.state = PageState::Invalid;
        self.content = Vec::new();
        self.copy_set.clear();
        self.home_hint = home;
        self.flags.remove(PageFlags::DIRTY);
    }
}
