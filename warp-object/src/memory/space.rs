//! One process's view of the distributed address space on one node.
//!
//! `VMemory` wraps the local [`PageStore`] with everything the coherence
//! protocol needs: the address allocator, the table of outstanding
//! requests (with deadlines and bounded retries), the invalidation rounds
//! an owner runs over its copy set, the dirty set for write-back, and the
//! retained update callbacks that wake faulted threads.
//!
//! Locking discipline: handlers decide everything under the inner lock
//! but emit messages and run callbacks only after dropping it, so a
//! delegate that loops a packet straight back cannot deadlock the space.

use super::coherence::*;
use super::page::{PageFlags, PageState};
use super::store::PageStore;
use super::{AddrClass, MemoryMessage, VAddr, align_up, OFFSET_MASK};
use crate::ident::{NodeId, Vpid};
use crate::{WarpError, WarpResult};
use alloc::collections::BTreeSet;
use alloc::sync::Arc;
use alloc::vec::Vec;
use hashbrown::HashMap;
use spin::Mutex;

/// Outbound capability: how this space reaches peers' memory modules.
pub trait MemoryDelegate: Send + Sync {
    /// Send a coherence message to the memory module of `dst`.
    fn memory_send(&self, pid: &Vpid, dst: NodeId, msg: MemoryMessage);
}

/// Retained change-notification callback: invoked with the base address
/// of every page that became resident, writable, or faulted. Returning
/// true removes the callback.
pub type UpdateHandler = alloc::boxed::Box<dyn Fn(VAddr) -> bool + Send>;

/// The distributed memory space of one process, as seen from one node.
pub struct VMemory {
    nid: NodeId,
    pid: Vpid,
    master_nid: NodeId,
    delegate: Arc<dyn MemoryDelegate>,
    inner: Mutex<VMemoryInner>,
}

struct VMemoryInner {
    store: PageStore,
    alloc_cursor: HashMap<u8, u64>,
    requests: HashMap<VAddr, PendingRequest>,
    rounds: HashMap<VAddr, InvalidationRound>,
    /// Latched terminal faults, consumed by the next access to the address.
    faults: HashMap<VAddr, WarpError>,
    callbacks: Vec<UpdateHandler>,
    now: u64,
}

type Sends = Vec<(NodeId, MemoryMessage)>;

impl VMemory {
    /// Create the space for process `pid` hosted on `nid`.
    ///
    /// `master_nid` owns the process control block and doubles as the
    /// directory fallback when a page's home is unknown.
    pub fn new(
        nid: NodeId,
        pid: Vpid,
        master_nid: NodeId,
        delegate: Arc<dyn MemoryDelegate>,
    ) -> Arc<Self> {
        Arc::new(VMemory {
            nid,
            pid,
            master_nid,
            delegate,
            inner: Mutex::new(VMemoryInner {
                store: PageStore::new(),
                alloc_cursor: HashMap::new(),
                requests: HashMap::new(),
                rounds: HashMap::new(),
                faults: HashMap::new(),
                callbacks: Vec::new(),
                now: 0,
            }),
        })
    }

    /// The hosting node.
    pub fn node(&self) -> NodeId {
        self.nid
    }

    /// The process master node.
    pub fn master(&self) -> NodeId {
        self.master_nid
    }

    /// Register a change-notification callback.
    pub fn add_update_callback(&self, callback: UpdateHandler) {
        self.inner.lock().callbacks.push(callback);
    }

    /// Atomically reserve an address and create its page locally, owned
    /// writable by this node (the first writer).
    pub fn alloc(&self, class: AddrClass, size: usize) -> WarpResult<VAddr> {
        if size == 0 {
            return Err(WarpError::INVALID_ARGS);
        }
        match class {
            AddrClass::Null | AddrClass::Frame | AddrClass::Invalid => {
                return Err(WarpError::INVALID_ARGS)
            }
            _ => {}
        }
        let mut inner = self.inner.lock();
        let cursor = inner.alloc_cursor.entry(class as u8).or_insert(0);
        let base_off = *cursor;
        let next = base_off + align_up(size as u64, 8);
        if next > OFFSET_MASK {
            return Err(WarpError::NO_MEMORY);
        }
        *cursor = next;
        let base = VAddr::build(class, self.nid.alloc_salt(), base_off);
        inner.store.insert_owned(base, vec![0; size])?;
        trace!("alloc {:?} {} bytes at {}", class, size, base);
        Ok(base)
    }

    /// Read `len` bytes at `addr`; `SHOULD_WAIT` after issuing a read
    /// request when the page is not resident.
    pub fn read_bytes(&self, addr: VAddr, len: usize) -> WarpResult<Vec<u8>> {
        let addr = addr.check_memory()?;
        let mut sends = Sends::new();
        let result = {
            let mut inner = self.inner.lock();
            if let Some(err) = inner.faults.remove(&addr) {
                return Err(err);
            }
            match inner.store.read(addr, len) {
                Ok(bytes) => Ok(bytes.to_vec()),
                Err(WarpError::SHOULD_WAIT) => {
                    self.start_read_miss(&mut inner, addr, &mut sends);
                    Err(WarpError::SHOULD_WAIT)
                }
                Err(e) => Err(e),
            }
        };
        self.emit(sends);
        result
    }

    /// Read the whole allocation containing `addr`; returns its base and
    /// bytes. Same fault contract as `read_bytes`.
    pub fn read_object(&self, addr: VAddr) -> WarpResult<(VAddr, Vec<u8>)> {
        let addr = addr.check_memory()?;
        let mut sends = Sends::new();
        let result = {
            let mut inner = self.inner.lock();
            if let Some(err) = inner.faults.remove(&addr) {
                return Err(err);
            }
            match inner.store.ensure_readable(addr) {
                Ok(base) => {
                    let page = inner.store.page(base).ok_or(WarpError::NOT_RESIDENT)?;
                    Ok((base, page.content.clone()))
                }
                Err(WarpError::SHOULD_WAIT) => {
                    self.start_read_miss(&mut inner, addr, &mut sends);
                    Err(WarpError::SHOULD_WAIT)
                }
                Err(e) => Err(e),
            }
        };
        self.emit(sends);
        result
    }

    /// Write bytes at `addr`; `SHOULD_WAIT` while ownership is acquired.
    pub fn write_bytes(&self, addr: VAddr, bytes: &[u8]) -> WarpResult {
        let addr = addr.check_memory()?;
        let mut sends = Sends::new();
        let result = {
            let mut inner = self.inner.lock();
            if let Some(err) = inner.faults.remove(&addr) {
                return Err(err);
            }
            match self.make_writable(&mut inner, addr, &mut sends) {
                Ok(()) => inner.store.write(addr, bytes),
                Err(e) => Err(e),
            }
        };
        self.emit(sends);
        result
    }

    /// Pull exclusive ownership of the page containing `addr` to this
    /// node; `SHOULD_WAIT` while the transfer is in flight. Used by warp.
    pub fn own(&self, addr: VAddr) -> WarpResult {
        let addr = addr.check_memory()?;
        let mut sends = Sends::new();
        let result = {
            let mut inner = self.inner.lock();
            if let Some(err) = inner.faults.remove(&addr) {
                return Err(err);
            }
            self.make_writable(&mut inner, addr, &mut sends)
        };
        self.emit(sends);
        result
    }

    /// Push the current bytes of an owned-writable page to its replica
    /// holders and downgrade to OwnedReadonly (write-back).
    pub fn publish(&self, addr: VAddr) -> WarpResult {
        let addr = addr.check_memory()?;
        let mut sends = Sends::new();
        let result = {
            let mut inner = self.inner.lock();
            let base = inner.store.base_of(addr).ok_or(WarpError::NOT_FOUND)?;
            let page = inner.store.page_mut(base).ok_or(WarpError::NOT_FOUND)?;
            if page.state != PageState::OwnedWritable {
                Err(WarpError::BAD_STATE)
            } else if page.copy_set.is_empty() {
                page.flags.remove(PageFlags::DIRTY);
                Ok(())
            } else {
                page.epoch += 1;
                page.flags.remove(PageFlags::DIRTY);
                let msg_epoch = page.epoch;
                let content = page.content.clone();
                for dst in page.copy_set.iter() {
                    sends.push((
                        *dst,
                        MemoryMessage::Update {
                            addr: base,
                            bytes: content.clone(),
                            epoch: msg_epoch,
                        },
                    ));
                }
                page.state = PageState::OwnedReadonly;
                Ok(())
            }
        };
        self.emit(sends);
        result
    }

    /// Write back every page dirtied since the last flush. Pages without
    /// replica holders just drop the dirty bit; pages with holders are
    /// published. Called at the end of a tick slice.
    pub fn flush(&self) {
        let targets: Vec<VAddr> = {
            let inner = self.inner.lock();
            inner
                .store
                .iter()
                .filter(|(_, p)| p.is_dirty() && p.state == PageState::OwnedWritable)
                .map(|(a, _)| *a)
                .collect()
        };
        for base in targets {
            let _ = self.publish(base);
        }
    }

    /// Mark the allocation containing `addr` unreferenced. Reclamation
    /// happens immediately when no replica exists, otherwise after every
    /// holder acknowledged invalidation.
    pub fn free(&self, addr: VAddr) -> WarpResult {
        let addr = addr.check_memory()?;
        let mut sends = Sends::new();
        let result = {
            let mut inner = self.inner.lock();
            let base = match inner.store.base_of(addr) {
                Some(base) => base,
                None => return Ok(()),
            };
            let page = inner.store.page_mut(base).ok_or(WarpError::NOT_FOUND)?;
            if !page.is_owned() {
                // Not ours to reclaim; drop the local replica.
                inner.store.remove(base);
                return Ok(());
            }
            if page.copy_set.is_empty() {
                inner.store.remove(base);
                return Ok(());
            }
            page.flags.insert(PageFlags::RELEASED);
            let members: BTreeSet<NodeId> = page.copy_set.clone();
            let epoch = page.epoch;
            for dst in members.iter() {
                sends.push((*dst, MemoryMessage::Invalidate { addr: base, epoch }));
            }
            let now = inner.now;
            inner.rounds.insert(
                base,
                InvalidationRound {
                    purpose: RoundPurpose::Reclaim,
                    waiting: members,
                    epoch,
                    deadline: now + COHERENCE_RTO_MS,
                    retries: 0,
                    queued: Vec::new(),
                },
            );
            Ok(())
        };
        self.emit(sends);
        result
    }

    /// Local coherence view of the page containing `addr`:
    /// `(state, epoch, copy_set)`. For tests and node diagnostics.
    pub fn inspect(&self, addr: VAddr) -> Option<(PageState, u64, Vec<NodeId>)> {
        let inner = self.inner.lock();
        let base = inner.store.base_of(addr)?;
        let page = inner.store.page(base)?;
        Some((page.state, page.epoch, page.copy_set.iter().copied().collect()))
    }

    /// Take the page containing `addr` out of this node for a warp to
    /// `dst`: requires exclusive ownership (acquire with [`own`] first),
    /// invalidates every replica, releases the local copy and returns
    /// `(base, class, bytes, epoch)` with the epoch already advanced past
    /// anything this node published.
    ///
    /// [`own`]: VMemory::own
    pub fn warp_take(
        &self,
        addr: VAddr,
        dst: NodeId,
    ) -> WarpResult<(VAddr, AddrClass, Vec<u8>, u64)> {
        let addr = addr.check_memory()?;
        let mut sends = Sends::new();
        let result = {
            let mut inner = self.inner.lock();
            let base = inner.store.base_of(addr).ok_or(WarpError::NOT_FOUND)?;
            let page = inner.store.page_mut(base).ok_or(WarpError::NOT_FOUND)?;
            if page.state != PageState::OwnedWritable {
                return Err(WarpError::BAD_STATE);
            }
            let epoch = page.epoch;
            for member in page.copy_set.iter() {
                if *member != dst {
                    sends.push((*member, MemoryMessage::Invalidate { addr: base, epoch }));
                }
            }
            let bytes = page.content.clone();
            inner.store.release(base, dst, false)?;
            let new_epoch = inner.store.page(base).map(|p| p.epoch).unwrap_or(epoch + 1);
            Ok((base, base.class(), bytes, new_epoch))
        };
        self.emit(sends);
        result
    }

    /// Install a page that arrived with ownership in a warp body.
    pub fn warp_install(&self, base: VAddr, bytes: Vec<u8>, epoch: u64) -> WarpResult {
        self.inner.lock().store.install_owned(base, bytes, epoch)
    }

    /// Whether the page containing `addr` is owned writable locally.
    pub fn is_owned_writable(&self, addr: VAddr) -> bool {
        matches!(self.inspect(addr), Some((PageState::OwnedWritable, _, _)))
    }

    /// Handle one inbound coherence message from `src`.
    pub fn recv(&self, src: NodeId, msg: MemoryMessage) {
        let mut sends = Sends::new();
        let mut wakes: Vec<VAddr> = Vec::new();
        {
            let mut inner = self.inner.lock();
            match msg {
                MemoryMessage::ReadReq { addr, requester } => {
                    self.on_read_req(&mut inner, addr, requester, &mut sends);
                }
                MemoryMessage::ReadReply { addr, bytes, epoch } => {
                    self.on_read_reply(&mut inner, src, addr, bytes, epoch, &mut wakes);
                }
                MemoryMessage::OwnershipReq { addr, requester } => {
                    self.on_ownership_req(&mut inner, addr, requester, &mut sends);
                }
                MemoryMessage::OwnershipReply {
                    addr,
                    bytes,
                    epoch,
                    copy_set,
                } => {
                    self.on_ownership_reply(&mut inner, addr, bytes, epoch, copy_set, &mut wakes);
                }
                MemoryMessage::Invalidate { addr, epoch } => {
                    self.on_invalidate(&mut inner, src, addr, epoch, &mut sends);
                }
                MemoryMessage::InvalidateAck { addr, epoch } => {
                    self.on_invalidate_ack(&mut inner, src, addr, epoch, &mut sends, &mut wakes);
                }
                MemoryMessage::Update { addr, bytes, epoch } => {
                    if let Ok(true) = inner.store.apply_update(addr, bytes, epoch, src) {
                        wakes.push(addr);
                    }
                }
            }
        }
        self.emit(sends);
        self.wake(wakes);
    }

    /// Drive deadlines: re-send expired requests and invalidation rounds,
    /// surface `COHERENCE_FAULT` when a retry budget runs out.
    pub fn poll(&self, now: u64) {
        let mut sends = Sends::new();
        let mut wakes: Vec<VAddr> = Vec::new();
        {
            let mut inner = self.inner.lock();
            inner.now = now;

            let expired: Vec<VAddr> = inner
                .requests
                .iter()
                .filter(|(_, r)| r.deadline <= now)
                .map(|(a, _)| *a)
                .collect();
            for addr in expired {
                let give_up = {
                    let req = &inner.requests[&addr];
                    req.retries >= COHERENCE_RETRY_LIMIT
                };
                if give_up {
                    warn!("coherence fault at {} after {} retries", addr, COHERENCE_RETRY_LIMIT);
                    inner.requests.remove(&addr);
                    inner.faults.insert(addr, WarpError::COHERENCE_FAULT);
                    wakes.push(addr);
                    continue;
                }
                let kind = inner.requests[&addr].kind;
                let target = self.home_of(&inner, addr);
                if let Some(req) = inner.requests.get_mut(&addr) {
                    req.retries += 1;
                    req.deadline = now + COHERENCE_RTO_MS;
                }
                if target != self.nid {
                    let msg = match kind {
                        RequestKind::Read => MemoryMessage::ReadReq {
                            addr,
                            requester: self.nid,
                        },
                        RequestKind::Ownership => MemoryMessage::OwnershipReq {
                            addr,
                            requester: self.nid,
                        },
                    };
                    sends.push((target, msg));
                }
            }

            let expired: Vec<VAddr> = inner
                .rounds
                .iter()
                .filter(|(_, r)| r.deadline <= now)
                .map(|(a, _)| *a)
                .collect();
            for base in expired {
                let round = inner.rounds.get_mut(&base).unwrap();
                if round.retries >= COHERENCE_RETRY_LIMIT {
                    warn!("invalidation round at {} abandoned", base);
                    let round = inner.rounds.remove(&base).unwrap();
                    if let RoundPurpose::Promote = round.purpose {
                        inner.faults.insert(base, WarpError::COHERENCE_FAULT);
                        wakes.push(base);
                    }
                    continue;
                }
                round.retries += 1;
                round.deadline = now + COHERENCE_RTO_MS;
                let epoch = round.epoch;
                for dst in round.waiting.iter() {
                    sends.push((*dst, MemoryMessage::Invalidate { addr: base, epoch }));
                }
            }
        }
        self.emit(sends);
        self.wake(wakes);
    }

    // ---- request initiation ----

    fn home_of(&self, inner: &VMemoryInner, addr: VAddr) -> NodeId {
        inner
            .store
            .base_of(addr)
            .and_then(|base| inner.store.page(base))
            .map(|p| p.home_hint)
            .filter(|h| *h != NodeId::NONE)
            .unwrap_or(self.master_nid)
    }

    fn start_read_miss(&self, inner: &mut VMemoryInner, addr: VAddr, sends: &mut Sends) {
        if inner.requests.contains_key(&addr) {
            return;
        }
        let target = self.home_of(inner, addr);
        let now = inner.now;
        inner.requests.insert(
            addr,
            PendingRequest {
                kind: RequestKind::Read,
                deadline: now + COHERENCE_RTO_MS,
                retries: 0,
            },
        );
        if target != self.nid {
            sends.push((
                target,
                MemoryMessage::ReadReq {
                    addr,
                    requester: self.nid,
                },
            ));
        }
    }

    fn start_ownership(&self, inner: &mut VMemoryInner, addr: VAddr, sends: &mut Sends) {
        if inner.requests.contains_key(&addr) {
            return;
        }
        let target = self.home_of(inner, addr);
        let now = inner.now;
        inner.requests.insert(
            addr,
            PendingRequest {
                kind: RequestKind::Ownership,
                deadline: now + COHERENCE_RTO_MS,
                retries: 0,
            },
        );
        if target != self.nid {
            sends.push((
                target,
                MemoryMessage::OwnershipReq {
                    addr,
                    requester: self.nid,
                },
            ));
        }
    }

    /// Bring the page containing `addr` to OwnedWritable, starting
    /// whatever protocol step that requires.
    fn make_writable(
        &self,
        inner: &mut VMemoryInner,
        addr: VAddr,
        sends: &mut Sends,
    ) -> WarpResult {
        let base = match inner.store.base_of(addr) {
            Some(base) => base,
            None => {
                self.start_ownership(inner, addr, sends);
                return Err(WarpError::SHOULD_WAIT);
            }
        };
        match inner.store.page(base).map(|p| p.state) {
            Some(PageState::OwnedWritable) => Ok(()),
            Some(PageState::OwnedReadonly) => {
                let empty = inner
                    .store
                    .page(base)
                    .map(|p| p.copy_set.is_empty())
                    .unwrap_or(false);
                if empty {
                    inner.store.grant_writable(base)
                } else {
                    self.start_promote(inner, base, sends);
                    Err(WarpError::SHOULD_WAIT)
                }
            }
            _ => {
                self.start_ownership(inner, addr, sends);
                Err(WarpError::SHOULD_WAIT)
            }
        }
    }

    fn start_promote(&self, inner: &mut VMemoryInner, base: VAddr, sends: &mut Sends) {
        if inner.rounds.contains_key(&base) {
            return;
        }
        let (members, epoch) = match inner.store.page(base) {
            Some(page) => (page.copy_set.clone(), page.epoch),
            None => return,
        };
        for dst in members.iter() {
            sends.push((*dst, MemoryMessage::Invalidate { addr: base, epoch }));
        }
        let now = inner.now;
        inner.rounds.insert(
            base,
            InvalidationRound {
                purpose: RoundPurpose::Promote,
                waiting: members,
                epoch,
                deadline: now + COHERENCE_RTO_MS,
                retries: 0,
                queued: Vec::new(),
            },
        );
    }

    // ---- message handlers ----

    fn on_read_req(
        &self,
        inner: &mut VMemoryInner,
        addr: VAddr,
        requester: NodeId,
        sends: &mut Sends,
    ) {
        match inner.store.base_of(addr) {
            Some(base) => {
                let page = match inner.store.page_mut(base) {
                    Some(p) => p,
                    None => return,
                };
                if page.is_owned() {
                    if requester != self.nid {
                        page.copy_set.insert(requester);
                    }
                    sends.push((
                        requester,
                        MemoryMessage::ReadReply {
                            addr: base,
                            bytes: page.content.clone(),
                            epoch: page.epoch,
                        },
                    ));
                    return;
                }
                let home = page.home_hint;
                self.forward(home, requester, MemoryMessage::ReadReq { addr, requester }, sends);
            }
            None => {
                self.forward(
                    self.master_nid,
                    requester,
                    MemoryMessage::ReadReq { addr, requester },
                    sends,
                );
            }
        }
    }

    fn on_read_reply(
        &self,
        inner: &mut VMemoryInner,
        src: NodeId,
        base: VAddr,
        bytes: Vec<u8>,
        epoch: u64,
        wakes: &mut Vec<VAddr>,
    ) {
        let len = bytes.len() as u64;
        match inner.store.apply_update(base, bytes, epoch, src) {
            Ok(_) => {}
            Err(_) => return, // already own it; the reply is stale
        }
        self.complete_requests(inner, base, len, RequestKind::Read);
        wakes.push(base);
    }

    fn on_ownership_req(
        &self,
        inner: &mut VMemoryInner,
        addr: VAddr,
        requester: NodeId,
        sends: &mut Sends,
    ) {
        let base = match inner.store.base_of(addr) {
            Some(base) => base,
            None => {
                self.forward(
                    self.master_nid,
                    requester,
                    MemoryMessage::OwnershipReq { addr, requester },
                    sends,
                );
                return;
            }
        };
        let owned = inner.store.page(base).map(|p| p.is_owned()).unwrap_or(false);
        if !owned {
            let home = inner.store.page(base).map(|p| p.home_hint).unwrap_or(NodeId::NONE);
            self.forward(home, requester, MemoryMessage::OwnershipReq { addr, requester }, sends);
            return;
        }
        if let Some(round) = inner.rounds.get_mut(&base) {
            // Transfer already in flight: serialize behind it.
            if !round.queued.contains(&requester) {
                round.queued.push(requester);
            }
            return;
        }
        let (members, epoch) = {
            let page = inner.store.page_mut(base).unwrap();
            let mut members = page.copy_set.clone();
            members.remove(&requester);
            (members, page.epoch)
        };
        if members.is_empty() {
            self.grant_now(inner, base, requester, sends);
            return;
        }
        for dst in members.iter() {
            sends.push((*dst, MemoryMessage::Invalidate { addr: base, epoch }));
        }
        let now = inner.now;
        inner.rounds.insert(
            base,
            InvalidationRound {
                purpose: RoundPurpose::Grant { requester },
                waiting: members,
                epoch,
                deadline: now + COHERENCE_RTO_MS,
                retries: 0,
                queued: Vec::new(),
            },
        );
    }

    /// Ownership handover once no foreign replica remains: bump the
    /// epoch, answer the requester, keep a read-only copy ourselves.
    fn grant_now(
        &self,
        inner: &mut VMemoryInner,
        base: VAddr,
        requester: NodeId,
        sends: &mut Sends,
    ) {
        let page = match inner.store.page_mut(base) {
            Some(p) => p,
            None => return,
        };
        page.epoch += 1;
        let epoch = page.epoch;
        sends.push((
            requester,
            MemoryMessage::OwnershipReply {
                addr: base,
                bytes: page.content.clone(),
                epoch,
                copy_set: vec![self.nid],
            },
        ));
        page.state = PageState::CachedReadonly;
        page.copy_set.clear();
        page.home_hint = requester;
        page.flags.remove(PageFlags::DIRTY);
        debug!("granted {} to {:?} at epoch {}", base, requester, epoch);
    }

    fn on_ownership_reply(
        &self,
        inner: &mut VMemoryInner,
        base: VAddr,
        bytes: Vec<u8>,
        epoch: u64,
        copy_set: Vec<NodeId>,
        wakes: &mut Vec<VAddr>,
    ) {
        let len = bytes.len() as u64;
        if inner.store.install_owned(base, bytes, epoch).is_err() {
            return;
        }
        if let Some(page) = inner.store.page_mut(base) {
            page.copy_set = copy_set.into_iter().filter(|n| *n != self.nid).collect();
            page.home_hint = NodeId::NONE;
        }
        self.complete_requests(inner, base, len, RequestKind::Ownership);
        wakes.push(base);
    }

    fn on_invalidate(
        &self,
        inner: &mut VMemoryInner,
        src: NodeId,
        addr: VAddr,
        epoch: u64,
        sends: &mut Sends,
    ) {
        if let Some(base) = inner.store.base_of(addr) {
            let page = inner.store.page_mut(base).unwrap();
            if page.is_owned() {
                // Only a stale round can invalidate an owner; two live
                // owners would be a protocol violation.
                if epoch >= page.epoch {
                    warn!("invalidate from {:?} hit owner of {}", src, addr);
                }
            } else {
                page.invalidate(src);
            }
        }
        // Always acknowledge: re-sent and misdirected invalidations must
        // not stall the round.
        sends.push((src, MemoryMessage::InvalidateAck { addr, epoch }));
    }

    fn on_invalidate_ack(
        &self,
        inner: &mut VMemoryInner,
        src: NodeId,
        base: VAddr,
        epoch: u64,
        sends: &mut Sends,
        wakes: &mut Vec<VAddr>,
    ) {
        let done = match inner.rounds.get_mut(&base) {
            Some(round) if round.epoch == epoch => {
                round.waiting.remove(&src);
                round.waiting.is_empty()
            }
            _ => {
                trace!("stray invalidate ack for {} from {:?}", base, src);
                false
            }
        };
        if !done {
            return;
        }
        let round = inner.rounds.remove(&base).unwrap();
        match round.purpose {
            RoundPurpose::Promote => {
                let released = {
                    if inner.store.grant_writable(base).is_err() {
                        return;
                    }
                    inner.store.page(base).map(|p| p.is_released()).unwrap_or(false)
                };
                if released {
                    inner.store.remove(base);
                } else {
                    wakes.push(base);
                }
            }
            RoundPurpose::Reclaim => {
                inner.store.remove(base);
            }
            RoundPurpose::Grant { requester } => {
                self.grant_now(inner, base, requester, sends);
                // Late requesters chase the new owner, higher ids first.
                let mut queued = round.queued;
                queued.sort_unstable_by(|a, b| b.cmp(a));
                for q in queued {
                    sends.push((
                        requester,
                        MemoryMessage::OwnershipReq {
                            addr: base,
                            requester: q,
                        },
                    ));
                }
            }
        }
    }

    // ---- plumbing ----

    fn complete_requests(&self, inner: &mut VMemoryInner, base: VAddr, len: u64, kind: RequestKind) {
        inner.requests.retain(|addr, req| {
            let in_range = addr.0 >= base.0 && addr.0 < base.0 + len;
            // An ownership grant also satisfies a plain read.
            let satisfied =
                in_range && (req.kind == kind || kind == RequestKind::Ownership);
            !satisfied
        });
    }

    fn forward(&self, target: NodeId, requester: NodeId, msg: MemoryMessage, sends: &mut Sends) {
        if target == NodeId::NONE || target == self.nid || target == requester {
            trace!("dropping unroutable {:?} for {:?}", msg, requester);
            return;
        }
        sends.push((target, msg));
    }

    fn emit(&self, sends: Sends) {
        for (dst, msg) in sends {
            self.delegate.memory_send(&self.pid, dst, msg);
        }
    }

    /// Run retained update callbacks outside the lock.
    fn wake(&self, addrs: Vec<VAddr>) {
        if addrs.is_empty() {
            return;
        }
        let mut callbacks = {
            let mut inner = self.inner.lock();
            core::mem::take(&mut inner.callbacks)
        };
        for addr in addrs {
            callbacks.retain(|f| !f(addr));
        }
        self.inner.lock().callbacks.append(&mut callbacks);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::PageState;
    use alloc::sync::Arc;
    use core::convert::TryInto;
    use std::sync::Mutex as StdMutex;

    /// Captures outbound traffic instead of sending it anywhere.
    struct Outbox {
        sent: StdMutex<Vec<(NodeId, MemoryMessage)>>,
    }

    impl Outbox {
        fn new() -> Arc<Self> {
            Arc::new(Outbox {
                sent: StdMutex::new(Vec::new()),
            })
        }
        fn take(&self) -> Vec<(NodeId, MemoryMessage)> {
            core::mem::take(&mut *self.sent.lock().unwrap())
        }
    }

    impl MemoryDelegate for Outbox {
        fn memory_send(&self, _pid: &Vpid, dst: NodeId, msg: MemoryMessage) {
            self.sent.lock().unwrap().push((dst, msg));
        }
    }

    fn fixture(nid: u128, master: u128) -> (Arc<VMemory>, Arc<Outbox>) {
        let outbox = Outbox::new();
        let vm = VMemory::new(
            NodeId::from_raw(nid),
            Vpid::new("test"),
            NodeId::from_raw(master),
            outbox.clone(),
        );
        (vm, outbox)
    }

    /// Deliver every queued message between two spaces until quiet.
    fn pump(a: &Arc<VMemory>, b: &Arc<VMemory>, boxes: &[(NodeId, Arc<Outbox>)]) {
        for _ in 0..32 {
            let mut moved = false;
            for (src, outbox) in boxes {
                for (dst, msg) in outbox.take() {
                    moved = true;
                    if dst == a.node() {
                        a.recv(*src, msg);
                    } else if dst == b.node() {
                        b.recv(*src, msg);
                    }
                }
            }
            if !moved {
                return;
            }
        }
        panic!("message storm");
    }

    #[test]
    fn local_read_write() {
        let (vm, _) = fixture(2, 2);
        let addr = vm.alloc(AddrClass::Pod, 8).unwrap();
        vm.write_bytes(addr, &42u64.to_le_bytes()).unwrap();
        let bytes = vm.read_bytes(addr, 8).unwrap();
        assert_eq!(u64::from_le_bytes(bytes.try_into().unwrap()), 42);
    }

    #[test]
    fn remote_read_then_upgrade() {
        // Scenario E3/E4 at the space level.
        let (a, abox) = fixture(2, 2);
        let (b, bbox) = fixture(3, 2);
        let boxes = [(a.node(), abox.clone()), (b.node(), bbox.clone())];

        let v = a.alloc(AddrClass::Pod, 4).unwrap();
        a.write_bytes(v, &1u32.to_le_bytes()).unwrap();

        // B misses, fetches, reads 1.
        assert_eq!(b.read_bytes(v, 4), Err(WarpError::SHOULD_WAIT));
        pump(&a, &b, &boxes);
        assert_eq!(b.read_bytes(v, 4).unwrap(), 1u32.to_le_bytes());
        assert_eq!(b.inspect(v).unwrap().0, PageState::CachedReadonly);
        let (_, _, copy_set) = a.inspect(v).unwrap();
        assert_eq!(copy_set, vec![b.node()]);

        // B writes 2: ownership moves, epoch grows, A still reads 2.
        let epoch_before = a.inspect(v).unwrap().1;
        assert_eq!(b.write_bytes(v, &2u32.to_le_bytes()), Err(WarpError::SHOULD_WAIT));
        pump(&a, &b, &boxes);
        b.write_bytes(v, &2u32.to_le_bytes()).unwrap();
        assert_eq!(b.inspect(v).unwrap().0, PageState::OwnedWritable);
        assert!(b.inspect(v).unwrap().1 > epoch_before);
        assert_ne!(a.inspect(v).unwrap().0, PageState::OwnedWritable);

        b.flush();
        pump(&a, &b, &boxes);
        assert_eq!(a.read_bytes(v, 4).unwrap(), 2u32.to_le_bytes());
    }

    #[test]
    fn single_owner_invariant() {
        let (a, abox) = fixture(2, 2);
        let (b, bbox) = fixture(3, 2);
        let boxes = [(a.node(), abox.clone()), (b.node(), bbox.clone())];

        let v = a.alloc(AddrClass::Pod, 8).unwrap();
        let _ = b.read_bytes(v, 8);
        pump(&a, &b, &boxes);
        let _ = b.write_bytes(v, &[1; 8]);
        pump(&a, &b, &boxes);

        let states = [a.inspect(v).unwrap().0, b.inspect(v).unwrap().0];
        let owners = states
            .iter()
            .filter(|s| matches!(**s, PageState::OwnedWritable | PageState::OwnedReadonly))
            .count();
        assert_eq!(owners, 1);
    }

    #[test]
    fn coherence_fault_after_retries() {
        // Master never answers: the requester gives up with a latched fault.
        let (a, abox) = fixture(2, 9);
        let ghost = VAddr::build(AddrClass::Pod, 5, 0);
        assert_eq!(a.read_bytes(ghost, 4), Err(WarpError::SHOULD_WAIT));
        let mut now = 0;
        for _ in 0..=COHERENCE_RETRY_LIMIT + 1 {
            now += COHERENCE_RTO_MS;
            a.poll(now);
        }
        let _ = abox.take();
        assert_eq!(a.read_bytes(ghost, 4), Err(WarpError::COHERENCE_FAULT));
        // The latch is consumed: the next access starts a fresh request.
        assert_eq!(a.read_bytes(ghost, 4), Err(WarpError::SHOULD_WAIT));
    }

    #[test]
    fn warp_take_moves_ownership() {
        let (a, abox) = fixture(2, 2);
        let dst = NodeId::from_raw(3);
        let v = a.alloc(AddrClass::Stack, 64).unwrap();
        a.write_bytes(v, &[7; 16]).unwrap();
        let before = a.inspect(v).unwrap().1;
        let (base, class, bytes, epoch) = a.warp_take(v, dst).unwrap();
        assert_eq!(base, v);
        assert_eq!(class, AddrClass::Stack);
        assert_eq!(&bytes[..16], &[7; 16]);
        assert!(epoch > before);
        assert_eq!(a.inspect(v).unwrap().0, PageState::Invalid);
        let _ = abox.take();
        // A subsequent local write chases the new owner.
        assert_eq!(a.write_bytes(v, &[1]), Err(WarpError::SHOULD_WAIT));
    }
}
