// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Host tests for the scheduler worker, control queues and teardown
//! OWNERS: @accel-sched
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: 11 integration tests

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use nexus_accel_sched::wire::{self, ControlRequest, SLOT_SIZE};
use nexus_accel_sched::{DomainId, EventKind, LogEvent, QueueRole, SchedConfig, SchedError, WorkerState};

#[test]
fn create_scheduler_is_idempotent() {
    let (_hal, dev) = common::device();
    dev.create_scheduler().unwrap();
    dev.create_scheduler().unwrap();
    let status = dev.status().unwrap();
    assert_eq!(status.state, WorkerState::Running);
    assert_eq!((status.active, status.shadow, status.domains), (None, None, 0));
    assert!(dev.get_log().unwrap().unwrap().message.starts_with("Create scheduler"));
    assert_eq!(dev.get_log().unwrap(), None);
}

#[test]
fn requests_before_create_are_rejected() {
    let (_hal, dev) = common::device();
    assert_eq!(dev.add_domain("x", 1, 1).unwrap_err(), SchedError::InvalidArgument);
    assert!(dev.open_session(1, true).is_err());
}

#[test]
fn post_switch_swaps_slots_and_logs() {
    let (hal, dev) = common::device();
    dev.create_scheduler().unwrap();
    let a = dev.add_domain("a", 1_000_000, 0).unwrap();
    let b = dev.add_domain("b", 1_000_000, 0).unwrap();
    let ctrl = dev.scheduler().unwrap();

    ctrl.post_switch(a).unwrap();
    assert!(common::eventually(|| ctrl.status().active == Some(a)));
    ctrl.post_switch(b).unwrap();
    assert!(common::eventually(|| ctrl.status().active == Some(b)));
    assert_eq!(ctrl.status().shadow, Some(a));
    assert!(common::eventually(|| ctrl.log_len() == 5));
    assert_eq!(hal.applied(), vec![a, b]);
    assert_eq!(ctrl.hw_status().unwrap().resident, Some(b));

    let kinds: Vec<EventKind> = std::iter::from_fn(|| ctrl.get_event()).map(|ev| ev.kind).collect();
    assert_eq!(
        kinds,
        vec![
            EventKind::CreateSched,
            EventKind::CreateDomain,
            EventKind::CreateDomain,
            EventKind::DomainSwitch,
            EventKind::DomainSwitch,
        ]
    );
    assert_eq!(dev.remove_domain(a).unwrap_err(), SchedError::Busy);
    assert_eq!(dev.remove_domain(b).unwrap_err(), SchedError::Busy);
}

#[test]
fn rejected_switch_leaves_active_slot_alone() {
    let hal = Arc::new(common::MockHal { reject_apply: true, ..Default::default() });
    let dev = common::device_with(Arc::clone(&hal), SchedConfig::default());
    dev.create_scheduler().unwrap();
    let id = dev.add_domain("a", 1_000_000, 0).unwrap();
    let ctrl = dev.scheduler().unwrap();

    ctrl.post_switch(id).unwrap();
    assert!(common::eventually(|| ctrl.status().shadow.is_none()));
    assert_eq!(ctrl.status().active, None);
    assert!(hal.applied().is_empty());
    assert_eq!(ctrl.hw_status().unwrap().resident, None);

    dev.remove_domain(id).unwrap();
    assert_eq!(hal.live_subdomains.load(Ordering::SeqCst), 0);
    let kinds: Vec<EventKind> = std::iter::from_fn(|| ctrl.get_event()).map(|ev| ev.kind).collect();
    assert_eq!(kinds, vec![EventKind::CreateSched, EventKind::CreateDomain, EventKind::RemoveDomain]);
}

#[test]
fn status_reads_slots_as_a_pair() {
    let (_hal, dev) = common::device();
    dev.create_scheduler().unwrap();
    let a = dev.add_domain("a", 1_000_000, 0).unwrap();
    let b = dev.add_domain("b", 1_000_000, 0).unwrap();
    let ctrl = dev.scheduler().unwrap();
    ctrl.post_switch(a).unwrap();
    assert!(common::eventually(|| ctrl.status().active == Some(a)));
    ctrl.post_switch(b).unwrap();
    assert!(common::eventually(|| ctrl.status().active == Some(b)));

    let done = Arc::new(AtomicBool::new(false));
    let sampler = {
        let ctrl = Arc::clone(&ctrl);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            let mut samples = 0u64;
            while !done.load(Ordering::Acquire) {
                let status = ctrl.status();
                assert!(status.active.is_some() && status.active != status.shadow, "{status:?}");
                samples += 1;
            }
            samples
        })
    };
    for round in 0..50 {
        let target = if round % 2 == 0 { a } else { b };
        ctrl.post_switch(target).unwrap();
        assert!(common::eventually(|| ctrl.status().active == Some(target)));
    }
    done.store(true, Ordering::Release);
    assert!(sampler.join().unwrap() > 0);
}

#[test]
fn switch_requests_flow_through_queues() {
    let (hal, dev) = common::device();
    dev.create_scheduler().unwrap();
    let id = dev.add_domain("gfx", 2_000_000, 100_000).unwrap();
    let session = dev.open_session(7, true).unwrap();
    session.reserve_exclusive_access().unwrap();
    let mut requests = session.map_queue(QueueRole::Send).unwrap();
    let mut responses = session.map_queue(QueueRole::Receive).unwrap();

    let mut bogus = [0u8; SLOT_SIZE];
    bogus[0] = 0x55;
    bogus[8] = 3;
    wire::ring_push(&mut requests, &wire::encode_request(&ControlRequest::Ping { seq: 1 })).unwrap();
    wire::ring_push(&mut requests, &wire::encode_request(&ControlRequest::SwitchDomain { seq: 2, domain_id: id.0 }))
        .unwrap();
    wire::ring_push(&mut requests, &bogus).unwrap();
    wire::ring_push(&mut requests, &wire::encode_request(&ControlRequest::SwitchDomain { seq: 4, domain_id: 99 }))
        .unwrap();
    session.ring_doorbell().unwrap();

    let mut got = Vec::new();
    assert!(common::eventually(|| {
        while let Ok(Some(slot)) = wire::ring_pop(&mut responses) {
            got.push(wire::decode_response(&slot));
        }
        got.len() == 4
    }));
    let statuses: Vec<(u64, i32)> = got.iter().map(|r| (r.seq, r.status)).collect();
    assert_eq!(
        statuses,
        vec![
            (1, 0),
            (2, 0),
            (3, SchedError::InvalidArgument.errno()),
            (4, SchedError::NotFound.errno()),
        ]
    );
    assert_eq!(dev.status().unwrap().active, Some(id));
    assert_eq!(hal.applied(), vec![id]);
}

#[test]
fn event_queue_mirrors_switches() {
    let (_hal, dev) = common::device();
    dev.create_scheduler().unwrap();
    let observer = dev.open_session(20, false).unwrap();
    let events = observer.map_queue(QueueRole::Event).unwrap();
    let id = dev.add_domain("video", 1_000_000, 0).unwrap();
    dev.scheduler().unwrap().post_switch(id).unwrap();

    assert!(common::eventually(|| {
        wire::ring_snapshot(&events).map(|slots| slots.len() == 2).unwrap_or(false)
    }));
    let kinds: Vec<EventKind> = wire::ring_snapshot(&events)
        .unwrap()
        .iter()
        .map(|slot| wire::decode_event(slot).unwrap().kind)
        .collect();
    assert_eq!(kinds, vec![EventKind::CreateDomain, EventKind::DomainSwitch]);
}

#[test]
fn event_queue_carries_logged_timestamps() {
    let (_hal, dev) = common::device();
    dev.create_scheduler().unwrap();
    let observer = dev.open_session(21, false).unwrap();
    let events = observer.map_queue(QueueRole::Event).unwrap();
    let id = dev.add_domain("audio", 1_000_000, 0).unwrap();
    let ctrl = dev.scheduler().unwrap();
    ctrl.post_switch(id).unwrap();

    assert!(common::eventually(|| {
        wire::ring_snapshot(&events).map(|slots| slots.len() == 2).unwrap_or(false)
    }));
    let mirrored: Vec<LogEvent> = wire::ring_snapshot(&events)
        .unwrap()
        .iter()
        .map(|slot| wire::decode_event(slot).unwrap())
        .collect();
    // The scheduler-created record predates the Event queue.
    let logged: Vec<LogEvent> = std::iter::from_fn(|| ctrl.get_event()).skip(1).collect();
    assert_eq!(mirrored, logged);
}

#[test]
fn slow_worker_start_times_out() {
    let hal = Arc::new(common::MockHal::slow_start(Duration::from_millis(200)));
    let config = SchedConfig { init_timeout_ms: 20, ..SchedConfig::default() };
    let dev = common::device_with(hal, config);
    assert_eq!(dev.create_scheduler().unwrap_err(), SchedError::InitTimeout);
    assert_eq!(dev.status().unwrap().state, WorkerState::Stopped);
    assert_eq!(dev.create_scheduler().unwrap_err(), SchedError::InitTimeout);
}

#[test]
fn device_gone_fails_fast() {
    let (hal, dev) = common::device();
    dev.create_scheduler().unwrap();
    let id = dev.add_domain("a", 1_000_000, 0).unwrap();
    let ctrl = dev.scheduler().unwrap();
    ctrl.post_switch(id).unwrap();
    assert!(common::eventually(|| ctrl.status().active == Some(id)));

    dev.shutdown();
    assert_eq!(dev.add_domain("b", 1, 1).unwrap_err(), SchedError::DeviceGone);
    assert_eq!(dev.get_log().unwrap_err(), SchedError::DeviceGone);
    assert_eq!(ctrl.post_switch(id).unwrap_err(), SchedError::DeviceGone);
    assert_eq!(ctrl.state(), WorkerState::Stopped);
    assert_eq!(ctrl.status().active, None);
    assert_eq!(ctrl.domain_count(), 0);
    assert_eq!(hal.live_subdomains.load(Ordering::SeqCst), 0);
}

#[test]
fn stop_and_restart_worker() {
    let (_hal, dev) = common::device();
    dev.create_scheduler().unwrap();
    let ctrl = dev.scheduler().unwrap();
    ctrl.stop();
    assert_eq!(ctrl.state(), WorkerState::Stopped);
    assert_eq!(ctrl.post_switch(DomainId(1)).unwrap_err(), SchedError::InvalidArgument);
    dev.create_scheduler().unwrap();
    assert_eq!(ctrl.state(), WorkerState::Running);
}
