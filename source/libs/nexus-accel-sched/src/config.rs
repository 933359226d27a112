// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Tunables for one scheduler instance.

use std::time::Duration;

use serde::Deserialize;

use crate::ctrl_fifo::QueueRole;
use crate::error::{Result, SchedError};

/// Granularity every queue size must be a multiple of.
pub const QUEUE_ALIGN: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SchedConfig {
    /// Records retained by the event log.
    pub log_capacity: u32,
    /// Bound on worker start-up before `InitTimeout`.
    pub init_timeout_ms: u64,
    /// Worker wait bound while no domain is active.
    pub idle_timeout_ms: u64,
    pub request_queue_bytes: usize,
    pub response_queue_bytes: usize,
    pub event_queue_bytes: usize,
}

impl Default for SchedConfig {
    fn default() -> Self {
        Self {
            log_capacity: 128,
            init_timeout_ms: 100,
            idle_timeout_ms: 10,
            request_queue_bytes: QUEUE_ALIGN,
            response_queue_bytes: QUEUE_ALIGN,
            event_queue_bytes: QUEUE_ALIGN,
        }
    }
}

impl SchedConfig {
    pub fn validate(&self) -> Result<()> {
        if self.log_capacity == 0 || self.log_capacity == u32::MAX {
            return Err(SchedError::InvalidArgument);
        }
        if self.init_timeout_ms == 0 || self.idle_timeout_ms == 0 {
            return Err(SchedError::InvalidArgument);
        }
        for bytes in [self.request_queue_bytes, self.response_queue_bytes, self.event_queue_bytes] {
            if bytes == 0 || bytes % QUEUE_ALIGN != 0 {
                return Err(SchedError::InvalidArgument);
            }
        }
        Ok(())
    }

    pub fn init_timeout(&self) -> Duration {
        Duration::from_millis(self.init_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn queue_bytes(&self, role: QueueRole) -> usize {
        match role {
            QueueRole::Send => self.request_queue_bytes,
            QueueRole::Receive => self.response_queue_bytes,
            QueueRole::Event => self.event_queue_bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(SchedConfig::default().validate().is_ok());
    }

    #[test]
    fn unaligned_queue_rejected() {
        let cfg = SchedConfig { event_queue_bytes: 4000, ..SchedConfig::default() };
        assert_eq!(cfg.validate().unwrap_err(), SchedError::InvalidArgument);
        let cfg = SchedConfig { log_capacity: 0, ..SchedConfig::default() };
        assert_eq!(cfg.validate().unwrap_err(), SchedError::InvalidArgument);
    }
}
