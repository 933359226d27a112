// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![forbid(unsafe_code)]

//! CONTEXT: Accelerator domain scheduling core for a user-space scheduling agent
//!
//! OWNERS: @accel-sched
//!
//! STATUS: Functional
//!
//! API_STABILITY: Unstable
//!
//! TEST_COVERAGE:
//!   - Unit tests: `#[cfg(test)]` modules in every component
//!   - Integration: `tests/event_log.rs`, `tests/domains.rs`, `tests/ctrl_fifo.rs`, `tests/controller.rs`
//!
//! PUBLIC API:
//!   - `event_log`: bounded drop-oldest ring of scheduling events
//!   - `buffer`: mappable shared buffers and view capabilities
//!   - `ctrl_fifo`: session list, exclusive access, control queues
//!   - `domain`: domain registry with counted handles
//!   - `controller`: worker thread owning active/shadow slots
//!   - `wire`: slot rings carried inside the control queues
//!   - `ioctl`: device node and session request surface
//!
//! The scheduling policy itself lives in the agent; this crate only keeps the
//! domain bookkeeping, the control channel and the diagnostic log.

pub mod buffer;
pub mod config;
pub mod controller;
pub mod ctrl_fifo;
pub mod domain;
pub mod error;
pub mod event_log;
pub mod hal;
pub mod ioctl;
pub mod wire;

pub use buffer::{MappedView, QueueMask, SharedBuffer};
pub use config::SchedConfig;
pub use controller::{Controller, ControllerStatus, WorkerState};
pub use ctrl_fifo::{CtrlFifo, ExportHandle, QueueRole, QueueSet, UserId};
pub use domain::{DomainId, DomainRef, DomainRegistry, DomainSlots, DOMAIN_NAME_MAX};
pub use error::{Result, SchedError};
pub use event_log::{event_kind_name, EventKind, EventLog, LogEvent};
pub use hal::{HeapAllocator, HwStatus, RawAllocator, RunlistDomain, SchedHal};
pub use ioctl::{LogRecord, SchedDevice, Session, LOG_MSG_MAX};
