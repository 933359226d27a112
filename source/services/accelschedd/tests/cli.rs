// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: accelschedd CLI tests
//! OWNERS: @accel-sched
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: 5 CLI tests
//!
//! TEST_SCENARIOS:
//!   - help output
//!   - config loading: missing file, overrides, invalid values, parse errors
//!   - demo scenario: switches posted through the request queue

use std::fs;

use accelschedd::{execute, DaemonConfig, DaemonError};

#[test]
fn help_mentions_flags() {
    let out = execute(&["--help"]).unwrap();
    assert!(out.contains("--config"));
    assert!(out.contains("--demo"));
}

#[test]
fn missing_config_uses_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("absent.toml");
    assert_eq!(DaemonConfig::load(&path).unwrap(), DaemonConfig::default());
}

#[test]
fn config_overrides_apply() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("accelschedd.toml");
    fs::write(&path, "log_filter = \"debug\"\n[sched]\nlog_capacity = 8\ninit_timeout_ms = 250\n").unwrap();
    let cfg = DaemonConfig::load(&path).unwrap();
    assert_eq!(cfg.log_filter, "debug");
    assert_eq!(cfg.sched.log_capacity, 8);
    assert_eq!(cfg.sched.init_timeout_ms, 250);

    let out = execute(&["--config", path.to_str().unwrap()]).unwrap();
    assert!(out.contains("log_capacity=8"));
}

#[test]
fn bad_configs_are_reported() {
    let dir = tempfile::tempdir().unwrap();
    let garbled = dir.path().join("garbled.toml");
    fs::write(&garbled, "[sched\n").unwrap();
    assert!(matches!(DaemonConfig::load(&garbled), Err(DaemonError::Parse { .. })));

    let invalid = dir.path().join("invalid.toml");
    fs::write(&invalid, "[sched]\nrequest_queue_bytes = 100\n").unwrap();
    assert!(matches!(DaemonConfig::load(&invalid), Err(DaemonError::Sched(_))));
}

#[test]
fn demo_switches_through_queues() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("none.toml");
    let out = execute(&["--config", path.to_str().unwrap(), "--demo"]).unwrap();
    assert!(out.contains("response seq=1 status=0"));
    assert!(out.contains("response seq=2 status=0"));
    assert!(out.contains("active=2 shadow=1 domains=2 hw_switches=2"));
    assert!(out.contains("Create scheduler"));
    assert_eq!(out.matches("Domain switch").count(), 2);
}
