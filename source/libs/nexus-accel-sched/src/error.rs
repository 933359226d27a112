// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Error taxonomy shared by every scheduling component
//! OWNERS: @accel-sched
//! STATUS: Functional
//! API_STABILITY: Stable
//!
//! Errors are always returned to the immediate caller. The only condition the
//! core absorbs internally is event log overflow (oldest record dropped).

/// Result alias for scheduling operations.
pub type Result<T> = core::result::Result<T, SchedError>;

/// Errors produced by the scheduling core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[must_use = "scheduling errors must be handled"]
pub enum SchedError {
    /// Allocation failed; never retried internally.
    #[error("out of memory")]
    OutOfMemory,
    /// Unknown domain id or name.
    #[error("not found")]
    NotFound,
    /// Domain or buffer is still referenced.
    #[error("resource busy")]
    Busy,
    /// Another session already holds exclusive access.
    #[error("exclusive access already reserved")]
    AlreadyReserved,
    /// Bad offset, length, size or name.
    #[error("invalid argument")]
    InvalidArgument,
    /// A domain with the same name is already registered.
    #[error("duplicate domain name")]
    DuplicateName,
    /// The worker did not report readiness within the configured bound.
    #[error("scheduler worker init timed out")]
    InitTimeout,
    /// The accelerator was torn down underneath the request.
    #[error("device gone")]
    DeviceGone,
    /// Caller lacks the access mode required by the request.
    #[error("permission denied")]
    PermissionDenied,
    /// Access through a closed or revoked mapping.
    #[error("access through invalidated mapping")]
    Fault,
}

impl SchedError {
    /// Negative errno reported as the result code of a control request.
    pub const fn errno(self) -> i32 {
        match self {
            Self::OutOfMemory => -12,
            Self::NotFound => -2,
            Self::Busy | Self::AlreadyReserved => -16,
            Self::InvalidArgument => -22,
            Self::DuplicateName => -17,
            Self::InitTimeout => -110,
            Self::DeviceGone => -19,
            Self::PermissionDenied => -1,
            Self::Fault => -14,
        }
    }
}

/// Maps a control request outcome onto its result code (`0` on success).
pub fn result_code<T>(res: &Result<T>) -> i32 {
    match res {
        Ok(_) => 0,
        Err(err) => err.errno(),
    }
}
