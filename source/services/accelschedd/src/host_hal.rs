// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Host simulation of the scheduling hardware.

use std::sync::atomic::{AtomicU64, Ordering};

use log::{debug, trace};
use nexus_accel_sched::domain::Domain;
use nexus_accel_sched::{DomainId, HwStatus, Result, RunlistDomain, SchedHal};
use parking_lot::Mutex;

/// Runlists exposed by the simulated accelerator.
pub const HOST_RUNLISTS: u32 = 2;

#[derive(Debug, Default)]
pub struct HostHal {
    next_handle: AtomicU64,
    resident: Mutex<Option<DomainId>>,
    switches: AtomicU64,
}

impl HostHal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Domain switches programmed so far.
    pub fn switches(&self) -> u64 {
        self.switches.load(Ordering::Relaxed)
    }
}

impl SchedHal for HostHal {
    fn runlist_count(&self) -> u32 {
        HOST_RUNLISTS
    }

    fn alloc_runlist_domain(&self, runlist_id: u32, domain: DomainId, name: &str) -> Result<RunlistDomain> {
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed) + 1;
        trace!("host-hal: runlist {runlist_id} sub-domain {handle:#x} for {domain} '{name}'");
        Ok(RunlistDomain { runlist_id, handle })
    }

    fn free_runlist_domain(&self, rl: RunlistDomain) {
        trace!("host-hal: free sub-domain {:#x} on runlist {}", rl.handle, rl.runlist_id);
    }

    fn apply_domain(&self, domain: &Domain) -> Result<()> {
        debug!(
            "host-hal: program domain {} timeslice={}ns grace={}ns",
            domain.id(),
            domain.timeslice_ns(),
            domain.preempt_grace_ns()
        );
        *self.resident.lock() = Some(domain.id());
        self.switches.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn hw_status(&self) -> HwStatus {
        let resident = *self.resident.lock();
        HwStatus { busy_engines: u32::from(resident.is_some()), resident }
    }
}
