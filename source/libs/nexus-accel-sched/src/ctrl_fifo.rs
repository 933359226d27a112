// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Control-FIFO arbiter: agent sessions, exclusive write access, queue buffers
//! OWNERS: @accel-sched
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit + property tests below, session tests in `tests/ctrl_fifo.rs`
//!
//! PUBLIC API:
//!   - CtrlFifo::{add_user, remove_user, user_exists, user_is_active}
//!   - CtrlFifo::{reserve_exclusive, reset_exclusive, release_exclusive, is_exclusive_user}
//!   - CtrlFifo::{buffer_alloc, buffer_free, export_view, map_range, is_busy, lock_queues}
//!   - CtrlFifo::{open_queue, close_queue}: per-session queue usage (`active_used_queues`)
//!
//! INVARIANTS:
//!   - At most one user has `has_write_access` at any time
//!   - Session list and every buffer's mapping state change only under the queue lock
//!   - A buffer is freed only while `ref_count == 0`
//!   - Send/Receive queues are usable only by the exclusive holder; Event is shared read-only

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use bitflags::bitflags;
use log::{debug, info, warn};
use parking_lot::{Mutex, MutexGuard};

use crate::buffer::{MappedView, QueueMask, SharedBuffer, ViewCloser, ViewKey, ViewSlot};
use crate::error::{Result, SchedError};
use crate::hal::RawAllocator;
use crate::wire;

/// Queue roles of the control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueRole {
    /// Agent -> scheduler requests.
    Send,
    /// Scheduler -> agent responses.
    Receive,
    /// Scheduler -> any agent notifications.
    Event,
}

impl QueueRole {
    pub const ALL: [QueueRole; 3] = [QueueRole::Send, QueueRole::Receive, QueueRole::Event];

    const fn index(self) -> usize {
        match self {
            Self::Send => 0,
            Self::Receive => 1,
            Self::Event => 2,
        }
    }

    fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn bit(self) -> QueueSet {
        match self {
            Self::Send => QueueSet::SEND,
            Self::Receive => QueueSet::RECEIVE,
            Self::Event => QueueSet::EVENT,
        }
    }

    /// Access roles granted on this queue's buffer.
    pub fn mask(self) -> QueueMask {
        match self {
            Self::Send => QueueMask::EXCLUSIVE_CLIENT_WRITE,
            Self::Receive => QueueMask::EXCLUSIVE_CLIENT_READ,
            Self::Event => QueueMask::NON_EXCLUSIVE_CLIENT_READ,
        }
    }

    /// True when only the exclusive holder may use the queue.
    pub fn is_exclusive(self) -> bool {
        !matches!(self, Self::Event)
    }
}

bitflags! {
    /// Queues a session currently uses.
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
    pub struct QueueSet: u32 {
        const SEND = 1 << 0;
        const RECEIVE = 1 << 1;
        const EVENT = 1 << 2;
        const EXCLUSIVE = Self::SEND.bits() | Self::RECEIVE.bits();
    }
}

/// Stable session identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UserId(pub u64);

/// A connected agent session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CtrlFifoUser {
    pub id: UserId,
    pub pid: u32,
    /// Opened with a write-capable handle.
    pub writable: bool,
    pub has_write_access: bool,
    pub active_used_queues: QueueSet,
}

struct FifoState {
    users: BTreeMap<UserId, CtrlFifoUser>,
    next_user: u64,
    queues: [Option<SharedBuffer>; 3],
    revoked: bool,
}

impl FifoState {
    fn user(&self, id: UserId) -> Result<&CtrlFifoUser> {
        self.users.get(&id).ok_or(SchedError::NotFound)
    }

    fn user_mut(&mut self, id: UserId) -> Result<&mut CtrlFifoUser> {
        self.users.get_mut(&id).ok_or(SchedError::NotFound)
    }

    fn exclusive_holder(&self) -> Option<UserId> {
        self.users.values().find(|u| u.has_write_access).map(|u| u.id)
    }

    fn is_busy(&self) -> bool {
        self.queues.iter().flatten().any(SharedBuffer::is_mapped)
    }

    /// Invalidates `id`'s mappings on the queues in `roles` and drops those roles from its usage.
    fn revoke_user(&mut self, id: UserId, roles: QueueSet) -> usize {
        let mut revoked = 0;
        for role in QueueRole::ALL {
            if !roles.contains(role.bit()) {
                continue;
            }
            if let Some(buf) = self.queues[role.index()].as_mut() {
                revoked += buf.revoke_owner(id.0);
            }
            if let Some(user) = self.users.get_mut(&id) {
                user.active_used_queues.remove(role.bit());
            }
            self.release_unused(role);
        }
        revoked
    }

    /// Frees the `role` buffer once no session uses it and nothing maps it.
    fn release_unused(&mut self, role: QueueRole) {
        let still_used = self.users.values().any(|u| u.active_used_queues.contains(role.bit()));
        let slot = &mut self.queues[role.index()];
        if !still_used && slot.as_ref().is_some_and(|buf| !buf.is_mapped()) {
            *slot = None;
            debug!("ctrl-fifo: released {:?} queue", role);
        }
    }

    fn ensure_live(&self) -> Result<()> {
        if self.revoked {
            return Err(SchedError::DeviceGone);
        }
        Ok(())
    }
}

struct FifoShared {
    allocator: Arc<dyn RawAllocator>,
    state: Mutex<FifoState>,
}

impl ViewCloser for FifoShared {
    fn close_view(&self, key: ViewKey, slot: &ViewSlot) {
        let mut state = self.state.lock();
        // Revoked views no longer own a record; the id may have been reused.
        if !slot.is_live() {
            return;
        }
        let Some(buf) = state.queues.get_mut(key.queue).and_then(Option::as_mut) else {
            return;
        };
        if buf.detach(key.mapping) {
            debug!("ctrl-fifo: closed view {:?} on queue {}", key.mapping, key.queue);
        }
    }
}

/// Scoped hold of the queue lock. Dropping it unlocks.
pub struct QueueLock<'a> {
    state: MutexGuard<'a, FifoState>,
}

impl QueueLock<'_> {
    pub fn buffer(&self, role: QueueRole) -> Option<&SharedBuffer> {
        self.state.queues[role.index()].as_ref()
    }

    pub fn users(&self) -> impl Iterator<Item = &CtrlFifoUser> {
        self.state.users.values()
    }

    pub fn exclusive_holder(&self) -> Option<UserId> {
        self.state.exclusive_holder()
    }
}

/// Opaque export of one queue buffer; mapping it yields a [`MappedView`].
#[derive(Clone)]
pub struct ExportHandle {
    fifo: Weak<FifoShared>,
    role: QueueRole,
    user: UserId,
    read_only: bool,
}

impl ExportHandle {
    pub fn role(&self) -> QueueRole {
        self.role
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Maps `len` bytes at `offset`; `offset` must be zero.
    pub fn map(&self, offset: u64, len: usize) -> Result<MappedView> {
        let shared = self.fifo.upgrade().ok_or(SchedError::DeviceGone)?;
        map_locked(&shared, self.role, self.user, offset, len, self.read_only)
    }
}

impl std::fmt::Debug for ExportHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExportHandle")
            .field("role", &self.role)
            .field("user", &self.user)
            .field("read_only", &self.read_only)
            .finish()
    }
}

fn map_locked(
    shared: &Arc<FifoShared>,
    role: QueueRole,
    user: UserId,
    offset: u64,
    len: usize,
    read_only: bool,
) -> Result<MappedView> {
    let mut state = shared.state.lock();
    state.ensure_live()?;
    let holder = state.user(user)?.has_write_access;
    if role.is_exclusive() && !holder {
        warn!("ctrl-fifo: user {} mapping {:?} without exclusive access", user.0, role);
        return Err(SchedError::PermissionDenied);
    }
    let buf = state.queues[role.index()].as_mut().ok_or(SchedError::NotFound)?;
    let writable = !read_only;
    let (mapping, slot) = buf.attach(offset, len, writable, user.0)?;
    let closer: Weak<dyn ViewCloser> = Arc::downgrade(shared) as Weak<dyn ViewCloser>;
    Ok(MappedView::new(ViewKey { queue: role.index(), mapping }, len, writable, slot, closer))
}

/// Session list, exclusive access and queue buffers of one scheduler.
pub struct CtrlFifo {
    shared: Arc<FifoShared>,
}

impl CtrlFifo {
    pub fn new(allocator: Arc<dyn RawAllocator>) -> Self {
        Self {
            shared: Arc::new(FifoShared {
                allocator,
                state: Mutex::new(FifoState {
                    users: BTreeMap::new(),
                    next_user: 1,
                    queues: [None, None, None],
                    revoked: false,
                }),
            }),
        }
    }

    /// Acquires the queue lock for inspection.
    pub fn lock_queues(&self) -> QueueLock<'_> {
        QueueLock { state: self.shared.state.lock() }
    }

    pub fn add_user(&self, pid: u32, writable: bool) -> Result<UserId> {
        let mut state = self.shared.state.lock();
        state.ensure_live()?;
        if writable && state.users.values().any(|u| u.pid == pid && u.writable) {
            warn!("ctrl-fifo: pid {pid} already has a write-capable session");
            return Err(SchedError::Busy);
        }
        let id = UserId(state.next_user);
        state.next_user += 1;
        state.users.insert(
            id,
            CtrlFifoUser {
                id,
                pid,
                writable,
                has_write_access: false,
                active_used_queues: QueueSet::empty(),
            },
        );
        debug!("ctrl-fifo: add user {} pid={pid} writable={writable}", id.0);
        Ok(id)
    }

    /// Removes a session, implicitly dropping exclusive access it held.
    ///
    /// Every view the session still maps is revoked and queues nobody else
    /// uses are freed.
    pub fn remove_user(&self, id: UserId) -> Option<CtrlFifoUser> {
        let mut state = self.shared.state.lock();
        state.user(id).ok()?;
        let revoked = state.revoke_user(id, QueueSet::SEND | QueueSet::RECEIVE | QueueSet::EVENT);
        let user = state.users.remove(&id)?;
        if user.has_write_access {
            info!("ctrl-fifo: user {} left holding exclusive access; released", id.0);
        }
        if revoked > 0 {
            info!("ctrl-fifo: user {} left with {revoked} mapping(s); revoked", id.0);
        }
        debug!("ctrl-fifo: remove user {} pid={}", id.0, user.pid);
        Some(user)
    }

    pub fn user(&self, id: UserId) -> Result<CtrlFifoUser> {
        self.shared.state.lock().user(id).cloned()
    }

    pub fn user_count(&self) -> usize {
        self.shared.state.lock().users.len()
    }

    /// True if `pid` has a session; with `require_write`, only write-capable ones count.
    pub fn user_exists(&self, pid: u32, require_write: bool) -> bool {
        let state = self.shared.state.lock();
        state.users.values().any(|u| u.pid == pid && (!require_write || u.writable))
    }

    pub fn user_is_active(&self, id: UserId) -> bool {
        self.shared
            .state
            .lock()
            .user(id)
            .map(|u| !u.active_used_queues.is_empty())
            .unwrap_or(false)
    }

    pub fn is_exclusive_user(&self, id: UserId) -> bool {
        self.shared.state.lock().user(id).map(|u| u.has_write_access).unwrap_or(false)
    }

    /// Grants exclusive access unless another session already holds it.
    pub fn reserve_exclusive(&self, id: UserId) -> Result<()> {
        let mut state = self.shared.state.lock();
        state.ensure_live()?;
        if !state.user(id)?.writable {
            return Err(SchedError::PermissionDenied);
        }
        match state.exclusive_holder() {
            Some(holder) if holder == id => Ok(()),
            Some(holder) => {
                warn!("ctrl-fifo: user {} denied; {} holds exclusive access", id.0, holder.0);
                Err(SchedError::AlreadyReserved)
            }
            None => {
                state.user_mut(id)?.has_write_access = true;
                info!("ctrl-fifo: user {} reserved exclusive access", id.0);
                Ok(())
            }
        }
    }

    /// Clears exclusive access unconditionally, revoking the user's views of the exclusive queues.
    pub fn reset_exclusive(&self, id: UserId) {
        let mut state = self.shared.state.lock();
        let Some(user) = state.users.get_mut(&id) else {
            return;
        };
        user.has_write_access = false;
        let revoked = state.revoke_user(id, QueueSet::EXCLUSIVE);
        if revoked > 0 {
            debug!("ctrl-fifo: user {} reset; revoked {revoked} exclusive mapping(s)", id.0);
        }
    }

    /// Gives up exclusive access; `Busy` while an exclusive queue is still in use.
    pub fn release_exclusive(&self, id: UserId) -> Result<()> {
        let mut state = self.shared.state.lock();
        let user = state.user_mut(id)?;
        if !user.has_write_access {
            return Err(SchedError::InvalidArgument);
        }
        if user.active_used_queues.intersects(QueueSet::EXCLUSIVE) {
            return Err(SchedError::Busy);
        }
        user.has_write_access = false;
        info!("ctrl-fifo: user {} released exclusive access", id.0);
        Ok(())
    }

    /// True while any buffer is still mapped.
    pub fn is_busy(&self) -> bool {
        self.shared.state.lock().is_busy()
    }

    /// Allocates the buffer for `role`.
    pub fn buffer_alloc(&self, role: QueueRole, size: usize, mask: QueueMask) -> Result<()> {
        let mut state = self.shared.state.lock();
        state.ensure_live()?;
        if state.queues[role.index()].is_some() {
            return Err(SchedError::Busy);
        }
        let buf = SharedBuffer::alloc(self.shared.allocator.as_ref(), size, mask)?;
        state.queues[role.index()] = Some(buf);
        Ok(())
    }

    /// Frees the buffer for `role`; `Busy` while mapped.
    pub fn buffer_free(&self, role: QueueRole) -> Result<()> {
        let mut state = self.shared.state.lock();
        let buf = state.queues[role.index()].as_ref().ok_or(SchedError::NotFound)?;
        if buf.is_mapped() {
            return Err(SchedError::Busy);
        }
        state.queues[role.index()] = None;
        debug!("ctrl-fifo: freed {:?} buffer", role);
        Ok(())
    }

    /// Maps the whole `role` buffer for `user`.
    pub fn export_view(&self, role: QueueRole, user: UserId, read_only: bool) -> Result<MappedView> {
        let size = self.buffer_size(role)?;
        self.map_range(role, user, 0, size, read_only)
    }

    /// Maps `len` bytes at `offset` of the `role` buffer for `user`.
    pub fn map_range(
        &self,
        role: QueueRole,
        user: UserId,
        offset: u64,
        len: usize,
        read_only: bool,
    ) -> Result<MappedView> {
        map_locked(&self.shared, role, user, offset, len, read_only)
    }

    pub fn buffer_size(&self, role: QueueRole) -> Result<usize> {
        let state = self.shared.state.lock();
        state.queues[role.index()].as_ref().map(SharedBuffer::size).ok_or(SchedError::NotFound)
    }

    /// Starts using `role` for `user`, allocating and formatting its ring on first use.
    pub fn open_queue(&self, user: UserId, role: QueueRole, size: usize) -> Result<ExportHandle> {
        let mut state = self.shared.state.lock();
        state.ensure_live()?;
        let holder = state.user(user)?.has_write_access;
        if role.is_exclusive() && !holder {
            return Err(SchedError::PermissionDenied);
        }
        if state.queues[role.index()].is_none() {
            let buf = SharedBuffer::alloc(self.shared.allocator.as_ref(), size, role.mask())?;
            wire::ring_init(&mut **buf.bytes_mut())?;
            state.queues[role.index()] = Some(buf);
            debug!("ctrl-fifo: allocated {:?} queue ({size} bytes)", role);
        }
        state.user_mut(user)?.active_used_queues |= role.bit();
        Ok(ExportHandle {
            fifo: Arc::downgrade(&self.shared),
            role,
            user,
            read_only: role.mask().is_read_only(),
        })
    }

    /// Stops using `role`; frees the buffer once unmapped and unused.
    pub fn close_queue(&self, user: UserId, role: QueueRole) -> Result<()> {
        let mut state = self.shared.state.lock();
        if !state.user(user)?.active_used_queues.contains(role.bit()) {
            return Err(SchedError::InvalidArgument);
        }
        if state.queues[role.index()].as_ref().is_some_and(SharedBuffer::is_mapped) {
            return Err(SchedError::Busy);
        }
        state.user_mut(user)?.active_used_queues.remove(role.bit());
        let still_used = state.users.values().any(|u| u.active_used_queues.contains(role.bit()));
        if !still_used && state.queues[role.index()].take().is_some() {
            debug!("ctrl-fifo: released {:?} queue", role);
        }
        Ok(())
    }

    /// Runs `f` on the `role` buffer under the queue lock.
    pub fn with_buffer<R>(&self, role: QueueRole, f: impl FnOnce(&SharedBuffer) -> R) -> Option<R> {
        let state = self.shared.state.lock();
        state.queues[role.index()].as_ref().map(f)
    }

    /// Invalidates every mapping and frees all buffers (device teardown).
    pub fn revoke_all(&self) -> usize {
        let mut state = self.shared.state.lock();
        state.revoked = true;
        let mut revoked = 0;
        for (index, slot) in state.queues.iter_mut().enumerate() {
            if let Some(mut buf) = slot.take() {
                revoked += buf.revoke_all();
                debug!("ctrl-fifo: revoked {:?}", QueueRole::from_index(index));
            }
        }
        for user in state.users.values_mut() {
            user.has_write_access = false;
            user.active_used_queues = QueueSet::empty();
        }
        revoked
    }

    /// Tears down an idle arbiter; `Busy` while anything is mapped.
    pub fn destroy(&self) -> Result<()> {
        let mut state = self.shared.state.lock();
        if state.is_busy() {
            return Err(SchedError::Busy);
        }
        state.queues = [None, None, None];
        state.users.clear();
        state.revoked = true;
        Ok(())
    }
}
