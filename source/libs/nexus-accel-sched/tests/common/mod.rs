// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Shared test doubles for the scheduling core.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nexus_accel_sched::domain::Domain;
use nexus_accel_sched::{
    DomainId, HeapAllocator, HwStatus, Result, RunlistDomain, SchedConfig, SchedDevice, SchedError,
    SchedHal,
};
use parking_lot::Mutex;

/// HAL that records what the core asked of it.
#[derive(Default)]
pub struct MockHal {
    pub live_subdomains: AtomicUsize,
    pub applied: Mutex<Vec<DomainId>>,
    pub resident: AtomicU64,
    pub start_delay: Option<Duration>,
    pub reject_apply: bool,
}

impl MockHal {
    pub fn slow_start(delay: Duration) -> Self {
        Self { start_delay: Some(delay), ..Self::default() }
    }

    pub fn applied(&self) -> Vec<DomainId> {
        self.applied.lock().clone()
    }
}

impl SchedHal for MockHal {
    fn runlist_count(&self) -> u32 {
        2
    }

    fn alloc_runlist_domain(&self, runlist_id: u32, domain: DomainId, _name: &str) -> Result<RunlistDomain> {
        self.live_subdomains.fetch_add(1, Ordering::SeqCst);
        Ok(RunlistDomain { runlist_id, handle: (domain.0 << 4) | u64::from(runlist_id) })
    }

    fn free_runlist_domain(&self, _rl: RunlistDomain) {
        self.live_subdomains.fetch_sub(1, Ordering::SeqCst);
    }

    fn apply_domain(&self, domain: &Domain) -> Result<()> {
        if self.reject_apply {
            return Err(SchedError::InvalidArgument);
        }
        self.applied.lock().push(domain.id());
        self.resident.store(domain.id().0, Ordering::SeqCst);
        Ok(())
    }

    fn hw_status(&self) -> HwStatus {
        let raw = self.resident.load(Ordering::SeqCst);
        HwStatus { busy_engines: 0, resident: (raw != 0).then_some(DomainId(raw)) }
    }

    fn worker_started(&self) -> Result<()> {
        if let Some(delay) = self.start_delay {
            std::thread::sleep(delay);
        }
        Ok(())
    }
}

pub fn device_with(hal: Arc<MockHal>, config: SchedConfig) -> SchedDevice {
    SchedDevice::new(config, hal, Arc::new(HeapAllocator))
}

pub fn device() -> (Arc<MockHal>, SchedDevice) {
    let hal = Arc::new(MockHal::default());
    let dev = device_with(Arc::clone(&hal), SchedConfig::default());
    (hal, dev)
}

/// Polls `cond` for up to two seconds.
pub fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..400 {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}
