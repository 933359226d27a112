// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Collaborator traits the scheduling core calls into.
//!
//! Register programming, engine enumeration and physical memory management
//! live behind these seams; the core never touches hardware directly.

use crate::domain::{Domain, DomainId};
use crate::error::{Result, SchedError};
use crate::event_log::monotonic_ns;

/// Hardware-side sub-domain for one runlist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunlistDomain {
    pub runlist_id: u32,
    /// Opaque token owned by the HAL.
    pub handle: u64,
}

/// Snapshot returned by [`SchedHal::hw_status`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HwStatus {
    /// Bitmask of engines currently busy.
    pub busy_engines: u32,
    /// Domain the hardware believes is resident, if any.
    pub resident: Option<DomainId>,
}

/// Scheduling hardware abstraction.
pub trait SchedHal: Send + Sync {
    /// Number of schedulable runlists; sizes each domain's sub-domain array.
    fn runlist_count(&self) -> u32;

    /// Creates the sub-domain of `domain` on `runlist_id`.
    fn alloc_runlist_domain(&self, runlist_id: u32, domain: DomainId, name: &str)
        -> Result<RunlistDomain>;

    /// Releases a sub-domain previously returned by `alloc_runlist_domain`.
    fn free_runlist_domain(&self, rl: RunlistDomain);

    /// Programs `domain` as the resident domain.
    fn apply_domain(&self, domain: &Domain) -> Result<()>;

    /// Reads the current hardware status.
    fn hw_status(&self) -> HwStatus;

    /// Clock used to stamp control responses.
    fn now_ns(&self) -> i64 {
        monotonic_ns()
    }

    /// Runs on the worker thread before it reports readiness.
    fn worker_started(&self) -> Result<()> {
        Ok(())
    }
}

/// Raw memory provider for shared buffers.
pub trait RawAllocator: Send + Sync {
    /// Returns `bytes` zeroed bytes or `OutOfMemory`.
    fn alloc(&self, bytes: usize) -> Result<Box<[u8]>>;
}

/// Heap-backed allocator used on host builds.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeapAllocator;

impl RawAllocator for HeapAllocator {
    fn alloc(&self, bytes: usize) -> Result<Box<[u8]>> {
        let mut buf: Vec<u8> = Vec::new();
        buf.try_reserve_exact(bytes).map_err(|_| SchedError::OutOfMemory)?;
        buf.resize(bytes, 0);
        Ok(buf.into_boxed_slice())
    }
}
