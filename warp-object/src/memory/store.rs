//! Per-node page bookkeeping.
//!
//! The store is purely local: it holds bytes and ownership state and
//! enforces the state-machine rules, but never sends a message. The
//! surrounding [`VMemory`](super::VMemory) turns its `SHOULD_WAIT`
//! answers into coherence traffic.

use super::page::{Page, PageFlags, PageState};
use super::VAddr;
use crate::ident::NodeId;
use crate::{WarpError, WarpResult};
use alloc::collections::BTreeMap;
use alloc::vec::Vec;

/// Holder of every page this node knows about for one process.
#[derive(Default)]
pub struct PageStore {
    pages: BTreeMap<VAddr, Page>,
}

impl PageStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Base address of the allocation containing `addr`, if known locally.
    pub fn base_of(&self, addr: VAddr) -> Option<VAddr> {
        let (base, page) = self.pages.range(..=addr).next_back()?;
        if addr.0 < base.0 + page.len as u64 && base.class() == addr.class() {
            Some(*base)
        } else {
            None
        }
    }

    /// Borrow a page by its base address.
    pub fn page(&self, base: VAddr) -> Option<&Page> {
        self.pages.get(&base)
    }

    /// Mutably borrow a page by its base address.
    pub fn page_mut(&mut self, base: VAddr) -> Option<&mut Page> {
        self.pages.get_mut(&base)
    }

    /// Record a page created by its first writer on this node.
    pub fn insert_owned(&mut self, base: VAddr, content: Vec<u8>) -> WarpResult {
        if self.pages.contains_key(&base) {
            return Err(WarpError::ALREADY_EXISTS);
        }
        self.pages.insert(base, Page::new_owned(content));
        Ok(())
    }

    /// Install a page received with ownership (warp body, ownership grant).
    /// The incoming epoch must dominate whatever this node saw before.
    pub fn install_owned(&mut self, base: VAddr, content: Vec<u8>, epoch: u64) -> WarpResult {
        if let Some(page) = self.pages.get_mut(&base) {
            if epoch < page.epoch {
                warn!("install_owned: stale epoch {} < {} at {}", epoch, page.epoch, base);
                return Err(WarpError::BAD_STATE);
            }
            page.state = PageState::OwnedWritable;
            page.len = content.len();
            page.content = content;
            page.epoch = epoch;
            page.home_hint = NodeId::NONE;
            page.flags.remove(PageFlags::DIRTY);
            return Ok(());
        }
        let mut page = Page::new_owned(content);
        page.epoch = epoch;
        self.pages.insert(base, page);
        Ok(())
    }

    /// Current local view of the page containing `addr`.
    pub fn get(&self, addr: VAddr) -> WarpResult<(PageState, &[u8])> {
        let base = self.base_of(addr).ok_or(WarpError::NOT_RESIDENT)?;
        let page = &self.pages[&base];
        if !page.is_resident() {
            return Err(WarpError::NOT_RESIDENT);
        }
        Ok((page.state, &page.content))
    }

    /// Base of a page readable right now; `SHOULD_WAIT` on a miss.
    pub fn ensure_readable(&self, addr: VAddr) -> WarpResult<VAddr> {
        match self.base_of(addr) {
            Some(base) if self.pages[&base].is_resident() => Ok(base),
            _ => Err(WarpError::SHOULD_WAIT),
        }
    }

    /// Base of a page writable right now; success requires OwnedWritable.
    pub fn ensure_writable(&self, addr: VAddr) -> WarpResult<VAddr> {
        match self.base_of(addr) {
            Some(base) if self.pages[&base].state == PageState::OwnedWritable => Ok(base),
            _ => Err(WarpError::SHOULD_WAIT),
        }
    }

    /// Read `len` bytes at `addr`. The range must stay inside one page.
    pub fn read(&self, addr: VAddr, len: usize) -> WarpResult<&[u8]> {
        let base = self.ensure_readable(addr)?;
        let page = &self.pages[&base];
        let off = (addr.0 - base.0) as usize;
        if off + len > page.len {
            return Err(WarpError::BAD_ACCESS);
        }
        Ok(&page.content[off..off + len])
    }

    /// Write bytes at `addr`; requires exclusive ownership.
    pub fn write(&mut self, addr: VAddr, bytes: &[u8]) -> WarpResult {
        let base = self.ensure_writable(addr)?;
        let page = self.pages.get_mut(&base).ok_or(WarpError::NOT_RESIDENT)?;
        let off = (addr.0 - base.0) as usize;
        if off + bytes.len() > page.len {
            return Err(WarpError::BAD_ACCESS);
        }
        page.content[off..off + bytes.len()].copy_from_slice(bytes);
        page.flags.insert(PageFlags::DIRTY);
        Ok(())
    }

    /// Install bytes received from `from` and become a read-only replica.
    ///
    /// Returns `Ok(false)` when the message is stale (lower epoch) and was
    /// dropped; applying the same update twice is a no-op. Rejects while
    /// this node holds the page writable: that is a protocol violation.
    pub fn apply_update(
        &mut self,
        base: VAddr,
        bytes: Vec<u8>,
        epoch: u64,
        from: NodeId,
    ) -> WarpResult<bool> {
        if let Some(page) = self.pages.get_mut(&base) {
            if page.state == PageState::OwnedWritable {
                warn!("apply_update on writable owner at {}", base);
                return Err(WarpError::BAD_STATE);
            }
            if epoch < page.epoch {
                trace!("apply_update: drop stale epoch {} < {} at {}", epoch, page.epoch, base);
                return Ok(false);
            }
            page.state = PageState::CachedReadonly;
            page.len = bytes.len();
            page.content = bytes;
            page.epoch = epoch;
            page.home_hint = from;
            page.flags.remove(PageFlags::DIRTY);
            return Ok(true);
        }
        self.pages.insert(base, Page::new_cached(bytes, epoch, from));
        Ok(true)
    }

    /// Promote OwnedReadonly → OwnedWritable after every replica holder
    /// confirmed invalidation.
    pub fn grant_writable(&mut self, base: VAddr) -> WarpResult {
        let page = self.pages.get_mut(&base).ok_or(WarpError::NOT_FOUND)?;
        match page.state {
            PageState::OwnedWritable => Ok(()),
            PageState::OwnedReadonly => {
                page.state = PageState::OwnedWritable;
                page.copy_set.clear();
                page.epoch += 1;
                Ok(())
            }
            _ => Err(WarpError::BAD_STATE),
        }
    }

    /// Hand ownership to `new_owner`. The local copy either stays around
    /// read-only (its bytes are current at the moment of transfer) or is
    /// dropped entirely, at the sender's choice.
    pub fn release(&mut self, base: VAddr, new_owner: NodeId, keep_copy: bool) -> WarpResult {
        let page = self.pages.get_mut(&base).ok_or(WarpError::NOT_FOUND)?;
        if !page.is_owned() {
            return Err(WarpError::BAD_STATE);
        }
        page.epoch += 1;
        if keep_copy {
            page.state = PageState::CachedReadonly;
            page.copy_set.clear();
            page.home_hint = new_owner;
            page.flags.remove(PageFlags::DIRTY);
        } else {
            page.invalidate(new_owner);
        }
        Ok(())
    }

    /// Forget a page entirely.
    pub fn remove(&mut self, base: VAddr) {
        self.pages.remove(&base);
    }

    /// Iterate over all known pages.
    pub fn iter(&self) -> impl Iterator<Item = (&VAddr, &Page)> {
        self.pages.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(offset: u64) -> VAddr {
        VAddr::build(crate::memory::AddrClass::Pod, 1, offset)
    }

    #[test]
    fn containing_lookup() {
        let mut store = PageStore::new();
        store.insert_owned(addr(0x100), vec![0; 16]).unwrap();
        assert_eq!(store.base_of(addr(0x100)), Some(addr(0x100)));
        assert_eq!(store.base_of(addr(0x10f)), Some(addr(0x100)));
        assert_eq!(store.base_of(addr(0x110)), None);
        assert_eq!(store.base_of(addr(0xff)), None);
    }

    #[test]
    fn first_writer_owns() {
        let mut store = PageStore::new();
        store.insert_owned(addr(0), vec![1, 2, 3, 4]).unwrap();
        assert_eq!(
            store.insert_owned(addr(0), vec![0]),
            Err(WarpError::ALREADY_EXISTS)
        );
        let (state, bytes) = store.get(addr(0)).unwrap();
        assert_eq!(state, PageState::OwnedWritable);
        assert_eq!(bytes, &[1, 2, 3, 4]);
        assert_eq!(store.ensure_writable(addr(2)).unwrap(), addr(0));
    }

    #[test]
    fn miss_wants_wait() {
        let store = PageStore::new();
        assert_eq!(store.ensure_readable(addr(8)), Err(WarpError::SHOULD_WAIT));
        assert_eq!(store.get(addr(8)), Err(WarpError::NOT_RESIDENT));
    }

    #[test]
    fn update_is_idempotent_and_monotonic() {
        let mut store = PageStore::new();
        let from = NodeId::from_raw(7);
        assert!(store.apply_update(addr(0), vec![5; 8], 3, from).unwrap());
        // Same message again: accepted, state unchanged.
        assert!(store.apply_update(addr(0), vec![5; 8], 3, from).unwrap());
        assert_eq!(store.page(addr(0)).unwrap().epoch, 3);
        assert_eq!(store.page(addr(0)).unwrap().state, PageState::CachedReadonly);
        // Stale epoch: dropped.
        assert!(!store.apply_update(addr(0), vec![9; 8], 2, from).unwrap());
        assert_eq!(store.page(addr(0)).unwrap().content, vec![5; 8]);
    }

    #[test]
    fn update_rejected_on_writable_owner() {
        let mut store = PageStore::new();
        store.insert_owned(addr(0), vec![0; 8]).unwrap();
        assert_eq!(
            store.apply_update(addr(0), vec![1; 8], 1, NodeId::from_raw(9)),
            Err(WarpError::BAD_STATE)
        );
    }

    #[test]
    fn promote_and_release_bump_epoch() {
        let mut store = PageStore::new();
        store.insert_owned(addr(0), vec![0; 8]).unwrap();
        let page = store.page_mut(addr(0)).unwrap();
        page.state = PageState::OwnedReadonly;
        page.copy_set.insert(NodeId::from_raw(9));

        store.grant_writable(addr(0)).unwrap();
        let page = store.page(addr(0)).unwrap();
        assert_eq!(page.state, PageState::OwnedWritable);
        assert!(page.copy_set.is_empty());
        assert_eq!(page.epoch, 1);

        let dst = NodeId::from_raw(9);
        store.release(addr(0), dst, false).unwrap();
        let page = store.page(addr(0)).unwrap();
        assert_eq!(page.state, PageState::Invalid);
        assert_eq!(page.home_hint, dst);
        assert_eq!(page.epoch, 2);
        // A released page can no longer serve writes.
        assert_eq!(store.ensure_writable(addr(0)), Err(WarpError::SHOULD_WAIT));
    }
}
