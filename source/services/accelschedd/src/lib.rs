// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![forbid(unsafe_code)]

//! CONTEXT: accelschedd - host daemon for the accelerator domain scheduler
//!
//! OWNERS: @accel-sched
//!
//! STATUS: Functional
//!
//! API_STABILITY: Unstable
//!
//! TEST_COVERAGE:
//!   - Unit tests: config parsing
//!   - CLI tests: `tests/cli.rs` (help, config loading, demo scenario)
//!
//! PUBLIC API:
//!   - `help()`, `execute()`, `run()`: CLI surface
//!   - `DaemonConfig`: `accelschedd.toml` loader
//!   - `HostHal`: simulated scheduling hardware

mod config;
mod host_hal;

use std::fmt::Write as _;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{info, warn};
use nexus_accel_sched::wire::{self, ControlRequest};
use nexus_accel_sched::{DomainId, HeapAllocator, QueueRole, SchedDevice};

pub use config::{DaemonConfig, DaemonError, DEFAULT_LOG_FILTER};
pub use host_hal::{HostHal, HOST_RUNLISTS};

/// Default configuration path.
pub const DEFAULT_CONFIG: &str = "accelschedd.toml";

const DEMO_RESPONSE_WAIT: Duration = Duration::from_secs(2);

pub fn help() -> &'static str {
    "accelschedd drives the accelerator domain scheduler. \
     Usage: accelschedd [--help] [--config <path>] [--demo]"
}

#[derive(Debug, Default, PartialEq, Eq)]
struct Options {
    help: bool,
    demo: bool,
    config: Option<String>,
}

fn parse_args(args: &[&str]) -> Result<Options, DaemonError> {
    let mut opts = Options::default();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match *arg {
            "--help" | "-h" => opts.help = true,
            "--demo" => opts.demo = true,
            "--config" => {
                let path = iter
                    .next()
                    .ok_or_else(|| DaemonError::Usage("--config requires a path".into()))?;
                opts.config = Some((*path).to_string());
            }
            other => return Err(DaemonError::Usage(format!("unknown argument: {other}"))),
        }
    }
    Ok(opts)
}

fn load_config(opts: &Options) -> Result<DaemonConfig, DaemonError> {
    DaemonConfig::load(Path::new(opts.config.as_deref().unwrap_or(DEFAULT_CONFIG)))
}

/// Runs one CLI invocation and returns its output.
pub fn execute(args: &[&str]) -> Result<String, DaemonError> {
    let opts = parse_args(args)?;
    if opts.help {
        return Ok(help().to_string());
    }
    let cfg = load_config(&opts)?;
    if opts.demo {
        return run_demo(&cfg);
    }
    Ok(format!(
        "accelschedd ready: log_capacity={} init_timeout={}ms queues={}/{}/{} bytes",
        cfg.sched.log_capacity,
        cfg.sched.init_timeout_ms,
        cfg.sched.request_queue_bytes,
        cfg.sched.response_queue_bytes,
        cfg.sched.event_queue_bytes,
    ))
}

/// Scripted scenario: two domains, two switches posted through the request queue.
pub fn run_demo(cfg: &DaemonConfig) -> Result<String, DaemonError> {
    let hal = Arc::new(HostHal::new());
    let dev = SchedDevice::new(cfg.sched.clone(), hal.clone(), Arc::new(HeapAllocator));
    dev.create_scheduler()?;
    let default = dev.add_domain("default", 1_000_000, 50_000)?;
    let compute = dev.add_domain("compute", 4_000_000, 200_000)?;

    let session = dev.open_session(std::process::id(), true)?;
    session.reserve_exclusive_access()?;
    let mut requests = session.map_queue(QueueRole::Send)?;
    let mut responses = session.map_queue(QueueRole::Receive)?;

    let script = [default, compute];
    for (seq, domain) in script.iter().enumerate() {
        let req = ControlRequest::SwitchDomain { seq: seq as u64 + 1, domain_id: domain.0 };
        wire::ring_push(&mut requests, &wire::encode_request(&req))?;
    }
    session.ring_doorbell()?;

    let mut out = String::new();
    let mut answered = 0;
    let deadline = Instant::now() + DEMO_RESPONSE_WAIT;
    while answered < script.len() && Instant::now() < deadline {
        match wire::ring_pop(&mut responses)? {
            Some(slot) => {
                let resp = wire::decode_response(&slot);
                let _ = writeln!(out, "response seq={} status={}", resp.seq, resp.status);
                answered += 1;
            }
            None => std::thread::sleep(Duration::from_millis(1)),
        }
    }
    if answered < script.len() {
        warn!("demo: only {answered} of {} responses arrived", script.len());
    }

    let status = dev.status()?;
    let _ = writeln!(
        out,
        "active={} shadow={} domains={} hw_switches={}",
        fmt_slot(status.active),
        fmt_slot(status.shadow),
        status.domains,
        hal.switches()
    );
    while let Some(rec) = dev.get_log()? {
        let _ = writeln!(out, "[{:>12}] {}", rec.timestamp, rec.message);
    }

    drop(requests);
    drop(responses);
    drop(session);
    dev.shutdown();
    Ok(out)
}

fn fmt_slot(slot: Option<DomainId>) -> String {
    slot.map_or_else(|| "-".to_string(), |id| id.to_string())
}

fn init_logger(filter: &str) {
    let env = env_logger::Env::default().default_filter_or(filter);
    let _ = env_logger::Builder::from_env(env).try_init();
}

/// Process entrypoint: one-shot commands print and exit, otherwise serve.
pub fn run() -> ExitCode {
    let owned: Vec<String> = std::env::args().skip(1).collect();
    let refs: Vec<&str> = owned.iter().map(|s| s.as_str()).collect();
    let opts = match parse_args(&refs) {
        Ok(opts) => opts,
        Err(err) => {
            eprintln!("accelschedd: {err}\n{}", help());
            return ExitCode::from(2);
        }
    };
    if opts.help {
        println!("{}", help());
        return ExitCode::SUCCESS;
    }
    let cfg = match load_config(&opts) {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("accelschedd: {err}");
            return ExitCode::FAILURE;
        }
    };
    init_logger(&cfg.log_filter);
    let result = if opts.demo { run_demo(&cfg).map(|out| print!("{out}")) } else { serve(&cfg) };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("accelschedd: {err}");
            ExitCode::FAILURE
        }
    }
}

/// Starts the scheduler and forwards event log records to the process log.
fn serve(cfg: &DaemonConfig) -> Result<(), DaemonError> {
    let dev = SchedDevice::new(cfg.sched.clone(), Arc::new(HostHal::new()), Arc::new(HeapAllocator));
    dev.create_scheduler()?;
    info!("accelschedd: scheduler up");
    loop {
        while let Some(rec) = dev.get_log()? {
            info!("[{}] {}", rec.timestamp, rec.message);
        }
        std::thread::sleep(cfg.sched.idle_timeout() * 10);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_flag_needs_path() {
        assert!(matches!(parse_args(&["--config"]), Err(DaemonError::Usage(_))));
    }

    #[test]
    fn flags_combine() {
        let opts = parse_args(&["--config", "x.toml", "--demo"]).unwrap();
        assert_eq!(opts, Options { help: false, demo: true, config: Some("x.toml".into()) });
    }
}
