// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Scheduler controller: owns the registry, arbiter and event log, runs the switch worker
//! OWNERS: @accel-sched
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests below, worker lifecycle and switching in `tests/controller.rs`
//!
//! Worker states: `Stopped -> Initializing -> Running -> Stopped`.
//!
//! The worker waits for the nearest deadline (active timeslice, or the idle
//! bound) or an explicit wake. On wake it drains the request queue, applies
//! a pending switch and appends the resulting events. Shutdown is a flag in
//! the wake state, checked on every wake.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use parking_lot::{Condvar, Mutex};

use crate::config::SchedConfig;
use crate::ctrl_fifo::{CtrlFifo, QueueRole};
use crate::domain::{DomainId, DomainRegistry, DomainSlots};
use crate::error::{Result, SchedError};
use crate::event_log::{EventKind, EventLog, LogEvent};
use crate::hal::{HwStatus, RawAllocator, SchedHal};
use crate::wire::{self, ControlRequest, ControlResponse};

/// Shortest wait the worker performs between deadline wakes.
const MIN_WAIT: Duration = Duration::from_micros(100);

/// Event payload for a domain id; ids past the 32-bit field saturate.
fn event_data(id: DomainId) -> u32 {
    u32::try_from(id.0).unwrap_or(u32::MAX)
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Stopped = 0,
    Initializing = 1,
    Running = 2,
}

impl WorkerState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Self::Initializing,
            2 => Self::Running,
            _ => Self::Stopped,
        }
    }
}

/// Point-in-time view of the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerStatus {
    pub state: WorkerState,
    pub active: Option<DomainId>,
    pub shadow: Option<DomainId>,
    pub domains: u32,
}

#[derive(Debug, Default)]
struct WakeState {
    switch_pending: bool,
    doorbell: bool,
    reconfigure: bool,
    shutdown: bool,
}

impl WakeState {
    fn signalled(&self) -> bool {
        self.switch_pending || self.doorbell || self.reconfigure || self.shutdown
    }
}

struct Inner {
    config: SchedConfig,
    hal: Arc<dyn SchedHal>,
    registry: DomainRegistry,
    slots: DomainSlots,
    log: Mutex<EventLog>,
    fifo: CtrlFifo,
    wake: Mutex<WakeState>,
    wake_cv: Condvar,
    state: AtomicU8,
    gone: AtomicBool,
    init_failed: AtomicBool,
    requests: Mutex<()>,
}

impl Inner {
    fn state(&self) -> WorkerState {
        WorkerState::from_raw(self.state.load(Ordering::Acquire))
    }

    fn ensure_present(&self) -> Result<()> {
        if self.gone.load(Ordering::Acquire) {
            return Err(SchedError::DeviceGone);
        }
        Ok(())
    }

    fn signal(&self, f: impl FnOnce(&mut WakeState)) {
        let mut wake = self.wake.lock();
        f(&mut wake);
        self.wake_cv.notify_all();
    }

    /// Appends to the event log and mirrors the record onto the Event queue.
    fn record(&self, kind: EventKind, data: u32) {
        let mut log = self.log.lock();
        let before = log.dropped();
        let ev = log.log_event(kind, data);
        if log.dropped() != before {
            warn!("sched: event log full; {} records dropped so far", log.dropped());
        }
        let slot = wire::encode_event(&ev);
        let pushed = self.fifo.with_buffer(QueueRole::Event, |buf| {
            let mut bytes = buf.bytes_mut();
            wire::ring_push_overwrite(&mut **bytes, &slot)
        });
        if let Some(Err(err)) = pushed {
            warn!("sched: event queue rejected {:?}: {err}", kind);
        }
    }

    fn wait_bound(&self) -> Duration {
        let Some(active) = self.slots.active() else {
            return self.config.idle_timeout();
        };
        match self.registry.lookup_by_id(active) {
            Ok(domain) => Duration::from_nanos(domain.timeslice_ns()).max(MIN_WAIT),
            Err(_) => self.config.idle_timeout(),
        }
    }

    /// Programs the shadow domain into hardware, then promotes it.
    ///
    /// `target` restages the shadow slot first. When the HAL rejects the
    /// domain the active slot is untouched and the shadow slot is emptied.
    fn switch_domain(&self, target: Option<DomainId>) -> Result<DomainId> {
        let _serial = self.requests.lock();
        if let Some(id) = target {
            self.registry.set_shadow(&self.slots, id)?;
        }
        let next = self.slots.shadow().ok_or(SchedError::NotFound)?;
        let domain = self.registry.lookup_by_id(next)?;
        if let Err(err) = self.hal.apply_domain(&domain) {
            error!("sched: hal rejected domain {next}: {err}");
            self.registry.discard_shadow(&self.slots, next);
            return Err(err);
        }
        let swap = self.registry.promote_shadow(&self.slots).ok_or(SchedError::NotFound)?;
        debug!("sched: switched {:?} -> {}", swap.previous, swap.active);
        self.record(EventKind::DomainSwitch, event_data(swap.active));
        Ok(swap.active)
    }

    fn handle_request(&self, slot: &wire::Slot) -> ControlResponse {
        let (opcode, seq) = wire::request_envelope(slot);
        let status = match wire::decode_request(slot) {
            Ok(ControlRequest::SwitchDomain { domain_id, .. }) => self
                .switch_domain(Some(DomainId(domain_id)))
                .map(|_| 0)
                .unwrap_or_else(SchedError::errno),
            Ok(ControlRequest::Ping { .. }) => 0,
            Err(err) => {
                warn!("sched: malformed request seq={seq} opcode={opcode}: {err:?}");
                SchedError::from(err).errno()
            }
        };
        ControlResponse { seq, status, opcode, timestamp_ns: self.hal.now_ns() }
    }

    fn drain_requests(&self) {
        loop {
            let popped = self.fifo.with_buffer(QueueRole::Send, |buf| {
                let mut bytes = buf.bytes_mut();
                wire::ring_pop(&mut **bytes)
            });
            let slot = match popped {
                None | Some(Ok(None)) => return,
                Some(Ok(Some(slot))) => slot,
                Some(Err(err)) => {
                    warn!("sched: request queue unreadable: {err}");
                    return;
                }
            };
            let resp = self.handle_request(&slot);
            self.post_response(&resp);
        }
    }

    fn post_response(&self, resp: &ControlResponse) {
        let slot = wire::encode_response(resp);
        let pushed = self.fifo.with_buffer(QueueRole::Receive, |buf| {
            let mut bytes = buf.bytes_mut();
            wire::ring_push(&mut **bytes, &slot)
        });
        match pushed {
            None => debug!("sched: no response queue; dropping seq={}", resp.seq),
            Some(Err(err)) => warn!("sched: response seq={} not posted: {err}", resp.seq),
            Some(Ok(())) => {}
        }
    }
}

fn run_worker(inner: Arc<Inner>, ready: mpsc::Sender<Result<()>>) {
    if let Err(err) = inner.hal.worker_started() {
        let _ = ready.send(Err(err));
        return;
    }
    if inner
        .state
        .compare_exchange(
            WorkerState::Initializing as u8,
            WorkerState::Running as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        )
        .is_err()
    {
        debug!("sched: worker came up after init was abandoned");
        return;
    }
    let _ = ready.send(Ok(()));
    info!("sched: worker running");

    loop {
        let deadline = Instant::now() + inner.wait_bound();
        let mut wake = inner.wake.lock();
        while !wake.signalled() {
            if inner.wake_cv.wait_until(&mut wake, deadline).timed_out() {
                break;
            }
        }
        if wake.shutdown {
            break;
        }
        let switch = core::mem::take(&mut wake.switch_pending);
        wake.doorbell = false;
        wake.reconfigure = false;
        drop(wake);

        if inner.gone.load(Ordering::Acquire) {
            break;
        }
        inner.drain_requests();
        if switch {
            if let Err(err) = inner.switch_domain(None) {
                warn!("sched: pending switch failed: {err}");
            }
        }
    }
    info!("sched: worker stopped");
}

/// Top-level scheduler instance.
pub struct Controller {
    inner: Arc<Inner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Controller {
    pub fn new(
        config: SchedConfig,
        hal: Arc<dyn SchedHal>,
        allocator: Arc<dyn RawAllocator>,
    ) -> Result<Self> {
        config.validate()?;
        let log = EventLog::init(config.log_capacity)?;
        Ok(Self {
            inner: Arc::new(Inner {
                registry: DomainRegistry::new(Arc::clone(&hal)),
                hal,
                slots: DomainSlots::default(),
                log: Mutex::new(log),
                fifo: CtrlFifo::new(allocator),
                wake: Mutex::new(WakeState::default()),
                wake_cv: Condvar::new(),
                state: AtomicU8::new(WorkerState::Stopped as u8),
                gone: AtomicBool::new(false),
                init_failed: AtomicBool::new(false),
                requests: Mutex::new(()),
                config,
            }),
            worker: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &SchedConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &DomainRegistry {
        &self.inner.registry
    }

    pub fn slots(&self) -> &DomainSlots {
        &self.inner.slots
    }

    pub fn fifo(&self) -> &CtrlFifo {
        &self.inner.fifo
    }

    pub fn state(&self) -> WorkerState {
        self.inner.state()
    }

    /// Starts the worker and waits for it to report readiness.
    pub fn start(&self) -> Result<()> {
        self.inner.ensure_present()?;
        if self.inner.init_failed.load(Ordering::Acquire) {
            return Err(SchedError::InitTimeout);
        }
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Ok(());
        }
        *self.inner.wake.lock() = WakeState::default();
        self.inner.state.store(WorkerState::Initializing as u8, Ordering::Release);

        let (tx, rx) = mpsc::channel();
        let inner = Arc::clone(&self.inner);
        let handle = thread::Builder::new()
            .name("accel-sched-worker".into())
            .spawn(move || run_worker(inner, tx))
            .map_err(|err| {
                error!("sched: worker spawn failed: {err}");
                self.inner.state.store(WorkerState::Stopped as u8, Ordering::Release);
                SchedError::OutOfMemory
            })?;

        match rx.recv_timeout(self.inner.config.init_timeout()) {
            Ok(Ok(())) => {
                *worker = Some(handle);
                Ok(())
            }
            Ok(Err(err)) => {
                let _ = handle.join();
                self.inner.state.store(WorkerState::Stopped as u8, Ordering::Release);
                error!("sched: worker init failed: {err}");
                Err(err)
            }
            Err(_) => {
                let abandoned = self.inner.state.compare_exchange(
                    WorkerState::Initializing as u8,
                    WorkerState::Stopped as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
                *worker = Some(handle);
                if abandoned.is_ok() {
                    self.inner.init_failed.store(true, Ordering::Release);
                    error!(
                        "sched: worker not ready within {}ms",
                        self.inner.config.init_timeout_ms
                    );
                    return Err(SchedError::InitTimeout);
                }
                // Ready raced the timeout; the worker is already running.
                Ok(())
            }
        }
    }

    /// Signals shutdown and joins the worker.
    pub fn stop(&self) {
        let handle = self.worker.lock().take();
        let Some(handle) = handle else {
            return;
        };
        self.inner.signal(|w| w.shutdown = true);
        if handle.join().is_err() {
            error!("sched: worker panicked");
        }
        self.inner.state.store(WorkerState::Stopped as u8, Ordering::Release);
    }

    pub fn add_domain(&self, name: &str, timeslice_ns: u64, preempt_grace_ns: u64) -> Result<DomainId> {
        self.inner.ensure_present()?;
        let _serial = self.inner.requests.lock();
        let id = self.inner.registry.add_domain(name, timeslice_ns, preempt_grace_ns)?;
        if let Ok(domain) = self.inner.registry.lookup_by_id(id) {
            self.inner.registry.print_domain(&domain);
        }
        self.inner.record(EventKind::CreateDomain, event_data(id));
        self.inner.signal(|w| w.reconfigure = true);
        Ok(id)
    }

    pub fn remove_domain(&self, id: DomainId) -> Result<()> {
        self.inner.ensure_present()?;
        let _serial = self.inner.requests.lock();
        self.inner.registry.remove_domain(id, &self.inner.slots)?;
        self.inner.record(EventKind::RemoveDomain, event_data(id));
        self.inner.signal(|w| w.reconfigure = true);
        Ok(())
    }

    /// Stages `id` in the shadow slot and asks the worker to switch to it.
    pub fn post_switch(&self, id: DomainId) -> Result<()> {
        self.inner.ensure_present()?;
        if self.inner.state() != WorkerState::Running {
            return Err(SchedError::InvalidArgument);
        }
        {
            let _serial = self.inner.requests.lock();
            self.inner.registry.set_shadow(&self.inner.slots, id)?;
        }
        self.inner.signal(|w| w.switch_pending = true);
        Ok(())
    }

    /// Wakes the worker to drain the request queue.
    pub fn ring_doorbell(&self) -> Result<()> {
        self.inner.ensure_present()?;
        self.inner.signal(|w| w.doorbell = true);
        Ok(())
    }

    /// Logs a raw event on behalf of the request surface.
    pub fn log_event(&self, kind: EventKind, data: u32) {
        self.inner.record(kind, data);
    }

    pub fn get_event(&self) -> Option<LogEvent> {
        self.inner.log.lock().get_event()
    }

    pub fn log_len(&self) -> u32 {
        self.inner.log.lock().len()
    }

    pub fn domain_count(&self) -> u32 {
        self.inner.registry.domain_count()
    }

    pub fn status(&self) -> ControllerStatus {
        let (active, shadow) = self.inner.registry.slot_snapshot(&self.inner.slots);
        ControllerStatus {
            state: self.inner.state(),
            active,
            shadow,
            domains: self.inner.registry.domain_count(),
        }
    }

    pub fn hw_status(&self) -> Result<HwStatus> {
        self.inner.ensure_present()?;
        Ok(self.inner.hal.hw_status())
    }

    pub fn is_gone(&self) -> bool {
        self.inner.gone.load(Ordering::Acquire)
    }

    /// Device teardown: fails later requests, stops the worker, revokes mappings.
    pub fn device_gone(&self) {
        if self.inner.gone.swap(true, Ordering::AcqRel) {
            return;
        }
        warn!("sched: device gone");
        self.stop();
        let revoked = self.inner.fifo.revoke_all();
        self.inner.registry.clear_slots(&self.inner.slots);
        let drained = self.inner.registry.drain();
        info!("sched: revoked {revoked} mappings, drained {drained} domains");
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_data_saturates_wide_ids() {
        assert_eq!(event_data(DomainId(7)), 7);
        assert_eq!(event_data(DomainId(u64::from(u32::MAX))), u32::MAX);
        assert_eq!(event_data(DomainId(u64::from(u32::MAX) + 5)), u32::MAX);
    }
}
