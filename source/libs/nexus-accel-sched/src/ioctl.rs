// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Control-request surface: device node and per-process sessions
//! OWNERS: @accel-sched
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: `tests/controller.rs`, `tests/ctrl_fifo.rs`
//!
//! PUBLIC API:
//!   - SchedDevice::{create_scheduler, add_domain, remove_domain, get_log, status}
//!   - SchedDevice::{open_session, shutdown}
//!   - Session::{reserve_exclusive_access, release_exclusive_access}
//!   - Session::{create_queue, erase_queue, ring_doorbell}
//!
//! Every request returns a `Result` whose error maps onto a negative errno
//! via `SchedError::errno`. Requests before `create_scheduler` fail with
//! `InvalidArgument`; requests after `shutdown` fail with `DeviceGone`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, info};
use parking_lot::Mutex;

use crate::buffer::MappedView;
use crate::config::SchedConfig;
use crate::controller::{Controller, ControllerStatus};
use crate::ctrl_fifo::{ExportHandle, QueueRole, UserId};
use crate::domain::DomainId;
use crate::error::{Result, SchedError};
use crate::event_log::{event_kind_name, EventKind};
use crate::hal::{RawAllocator, SchedHal};

/// Longest rendered log message in bytes.
pub const LOG_MSG_MAX: usize = 128;

/// One rendered event log record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// Nanoseconds since the log was initialised.
    pub timestamp: i64,
    pub message: String,
}

/// The scheduler's device node.
pub struct SchedDevice {
    config: SchedConfig,
    hal: Arc<dyn SchedHal>,
    allocator: Arc<dyn RawAllocator>,
    ctrl: Mutex<Option<Arc<Controller>>>,
    gone: AtomicBool,
}

impl SchedDevice {
    pub fn new(config: SchedConfig, hal: Arc<dyn SchedHal>, allocator: Arc<dyn RawAllocator>) -> Self {
        Self { config, hal, allocator, ctrl: Mutex::new(None), gone: AtomicBool::new(false) }
    }

    fn controller(&self) -> Result<Arc<Controller>> {
        if self.gone.load(Ordering::Acquire) {
            return Err(SchedError::DeviceGone);
        }
        self.ctrl.lock().clone().ok_or(SchedError::InvalidArgument)
    }

    /// Creates and starts the scheduler. Idempotent.
    pub fn create_scheduler(&self) -> Result<()> {
        if self.gone.load(Ordering::Acquire) {
            return Err(SchedError::DeviceGone);
        }
        let mut ctrl = self.ctrl.lock();
        if let Some(existing) = ctrl.as_ref() {
            return existing.start();
        }
        let controller =
            Arc::new(Controller::new(self.config.clone(), Arc::clone(&self.hal), Arc::clone(&self.allocator))?);
        controller.log_event(EventKind::CreateSched, 0);
        let started = controller.start();
        *ctrl = Some(controller);
        info!("sched: scheduler created");
        started
    }

    pub fn add_domain(&self, name: &str, timeslice_ns: u64, preempt_grace_ns: u64) -> Result<DomainId> {
        self.controller()?.add_domain(name, timeslice_ns, preempt_grace_ns)
    }

    pub fn remove_domain(&self, id: DomainId) -> Result<()> {
        self.controller()?.remove_domain(id)
    }

    /// Pops and renders the oldest log record; `Ok(None)` when drained.
    pub fn get_log(&self) -> Result<Option<LogRecord>> {
        let Some(ev) = self.controller()?.get_event() else {
            return Ok(None);
        };
        let mut message = format!("{:<20} {}", event_kind_name(ev.kind as u32), ev.data);
        truncate_utf8(&mut message, LOG_MSG_MAX);
        Ok(Some(LogRecord { timestamp: ev.timestamp, message }))
    }

    pub fn domain_count(&self) -> Result<u32> {
        Ok(self.controller()?.domain_count())
    }

    pub fn status(&self) -> Result<ControllerStatus> {
        Ok(self.controller()?.status())
    }

    /// Direct access to the running controller.
    pub fn scheduler(&self) -> Result<Arc<Controller>> {
        self.controller()
    }

    /// Opens a session for `pid`; a second write-capable session from the same pid is `Busy`.
    pub fn open_session(&self, pid: u32, writable: bool) -> Result<Session> {
        let ctrl = self.controller()?;
        let user = ctrl.fifo().add_user(pid, writable)?;
        Ok(Session { ctrl, user, pid })
    }

    /// Tears the device down: stops the worker and revokes every mapping.
    pub fn shutdown(&self) {
        if self.gone.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(ctrl) = self.ctrl.lock().take() {
            ctrl.device_gone();
        }
        info!("sched: device shut down");
    }
}

impl Drop for SchedDevice {
    fn drop(&mut self) {
        if let Some(ctrl) = self.ctrl.get_mut().take() {
            ctrl.stop();
        }
    }
}

fn truncate_utf8(s: &mut String, max: usize) {
    if s.len() <= max {
        return;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s.truncate(end);
}

/// One agent's open handle on the device.
pub struct Session {
    ctrl: Arc<Controller>,
    user: UserId,
    pid: u32,
}

impl Session {
    pub fn user_id(&self) -> UserId {
        self.user
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn reserve_exclusive_access(&self) -> Result<()> {
        self.ensure_present()?;
        self.ctrl.fifo().reserve_exclusive(self.user)
    }

    pub fn release_exclusive_access(&self) -> Result<()> {
        self.ensure_present()?;
        self.ctrl.fifo().release_exclusive(self.user)
    }

    pub fn has_exclusive_access(&self) -> bool {
        self.ctrl.fifo().is_exclusive_user(self.user)
    }

    /// True while the session uses any queue.
    pub fn is_active(&self) -> bool {
        self.ctrl.fifo().user_is_active(self.user)
    }

    /// Opens `role` and exports it.
    pub fn create_queue(&self, role: QueueRole) -> Result<ExportHandle> {
        self.ensure_present()?;
        let size = self.ctrl.config().queue_bytes(role);
        let handle = self.ctrl.fifo().open_queue(self.user, role, size)?;
        debug!("session {}: created {:?} queue", self.pid, role);
        Ok(handle)
    }

    /// Creates `role` and maps the whole buffer.
    pub fn map_queue(&self, role: QueueRole) -> Result<MappedView> {
        let handle = self.create_queue(role)?;
        handle.map(0, self.ctrl.config().queue_bytes(role))
    }

    /// Stops using `role`; `Busy` while it is still mapped.
    pub fn erase_queue(&self, role: QueueRole) -> Result<()> {
        self.ensure_present()?;
        self.ctrl.fifo().close_queue(self.user, role)
    }

    /// Wakes the worker after requests were written.
    pub fn ring_doorbell(&self) -> Result<()> {
        if !self.has_exclusive_access() {
            return Err(SchedError::PermissionDenied);
        }
        self.ctrl.ring_doorbell()
    }

    fn ensure_present(&self) -> Result<()> {
        if self.ctrl.is_gone() {
            return Err(SchedError::DeviceGone);
        }
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let fifo = self.ctrl.fifo();
        fifo.reset_exclusive(self.user);
        fifo.remove_user(self.user);
        debug!("session {}: closed", self.pid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncation_respects_char_boundaries() {
        let mut s = "é".repeat(100);
        truncate_utf8(&mut s, LOG_MSG_MAX);
        assert!(s.len() <= LOG_MSG_MAX);
        assert_eq!(s.len() % 2, 0);
    }

    #[test]
    fn short_messages_untouched() {
        let mut s = String::from("Domain switch        3");
        truncate_utf8(&mut s, LOG_MSG_MAX);
        assert_eq!(s, "Domain switch        3");
    }
}
