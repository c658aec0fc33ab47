//! Bus Primitive Integration Tests
//!
//! Exercises the completion-signalled write, timeout bookkeeping and
//! configuration files against the simulated analyzer.
//!
//! Run with: `cargo test -p engine --test io_tests`

use common::{CancelToken, NotificationQueue};
use engine::config::{EngineConfig, load_config};
use engine::io::{OpContext, signal_write};
use engine::transport::Connection;
use engine::transport::sim::{SimConnector, SimInstrument};
use proptest::prelude::*;
use protocol::{
    BusError, Outcome, ResultItem, ResultTag, TimeoutClass, TimeoutPurpose, TimeoutTarget,
    TransportConfig, TransportKind,
};
use std::time::{Duration, Instant};

struct Bench {
    sim: SimInstrument,
    conn: Connection,
    ctx: OpContext,
    results: NotificationQueue<ResultItem>,
}

fn bench() -> Bench {
    let sim = SimInstrument::new();
    let mut connector = SimConnector::new(sim.clone());
    let conn = Connection::open(&mut connector, &TransportConfig::default())
        .expect("simulated instrument should open");
    let results = NotificationQueue::new();
    let ctx = OpContext::new(CancelToken::new(), results.clone());
    Bench {
        sim,
        conn,
        ctx,
        results,
    }
}

fn ambient_timeouts(sim: &SimInstrument) -> (TimeoutClass, TimeoutClass) {
    (
        sim.timeout(TimeoutTarget::Controller),
        sim.timeout(TimeoutTarget::Device),
    )
}

fn progress_messages(results: &NotificationQueue<ResultItem>) -> Vec<String> {
    let mut messages = Vec::new();
    while let Some(item) = results.try_pop() {
        if item.tag == ResultTag::Progress {
            messages.push(item.message.unwrap_or_default());
        }
    }
    messages
}

// ============================================================================
// Signalled Writes
// ============================================================================

#[test]
fn test_signalled_text_command() {
    let mut b = bench();
    let ambient = ambient_timeouts(&b.sim);

    let outcome = signal_write(&mut b.conn, b"SING;", true, 5.0, &b.ctx);

    assert_eq!(outcome, Outcome::Ok);
    assert_eq!(ambient_timeouts(&b.sim), ambient);
    assert_eq!(
        b.sim.traffic(),
        vec!["CLES;ESE1;SRE32;OPC;SING;".to_string(), "ESR?;".to_string()]
    );
    assert!(!b.conn.status().is_error());
}

#[test]
fn test_signalled_binary_payload() {
    let mut b = bench();

    let outcome = signal_write(&mut b.conn, b"FORM1;INPULEAS;#A\x00\x02\x01\x02", false, 5.0, &b.ctx);

    assert_eq!(outcome, Outcome::Ok);
    let traffic = b.sim.traffic();
    assert!(traffic[0].starts_with("CLES;ESE1;SRE32;FORM1;INPULEAS;"));
    assert!(traffic[0].ends_with("OPC;NOOP;"));
    assert_eq!(b.sim.learn_string(), vec![1, 2]);
}

#[test]
fn test_signal_times_out_and_latches_error() {
    let mut b = bench();
    b.sim.set_sweep_polls(u32::MAX);
    let ambient = ambient_timeouts(&b.sim);
    let polls_before = b.sim.poll_count();

    let outcome = signal_write(&mut b.conn, b"SING;", true, 0.5, &b.ctx);

    assert_eq!(outcome, Outcome::Timeout);
    assert!(b.conn.status().is_error());
    assert_eq!(ambient_timeouts(&b.sim), ambient);
    // 0.5 s in 30 ms increments, one write poll and at most one increment over
    let polls = b.sim.poll_count() - polls_before;
    assert!((17..=19).contains(&polls), "polled {} times", polls);

    // The latched error keeps the next transfer off the bus
    let traffic = b.sim.traffic().len();
    assert_eq!(
        signal_write(&mut b.conn, b"SING;", true, 0.5, &b.ctx),
        Outcome::PreviousError
    );
    assert_eq!(b.sim.traffic().len(), traffic);

    b.conn.clear();
    b.sim.set_sweep_polls(3);
    assert_eq!(signal_write(&mut b.conn, b"CONT;", true, 0.5, &b.ctx), Outcome::Ok);
}

#[test]
fn test_signal_abort_from_another_thread() {
    let mut b = bench();
    b.sim.set_real_time(true);
    b.sim.set_sweep_polls(u32::MAX);
    let ambient = ambient_timeouts(&b.sim);

    let cancel = b.ctx.cancel.clone();
    let aborter = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(150));
        cancel.request();
    });

    let started = Instant::now();
    let outcome = signal_write(&mut b.conn, b"SING;", true, 60.0, &b.ctx);
    aborter.join().expect("abort thread panicked");

    assert_eq!(outcome, Outcome::Aborted);
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(b.conn.status().is_error());
    assert_eq!(ambient_timeouts(&b.sim), ambient);
    assert!(matches!(
        b.conn.check(outcome, "SING;"),
        Err(BusError::Aborted)
    ));
}

#[test]
fn test_missing_completion_bit() {
    let mut b = bench();
    b.sim.set_event_status(0x20);

    let outcome = signal_write(&mut b.conn, b"SAVC;", true, 5.0, &b.ctx);

    assert_eq!(outcome, Outcome::Error);
    match b.conn.check(outcome, "SAVC;") {
        Err(BusError::ProtocolMismatch {
            expected,
            event_status,
        }) => {
            assert_eq!(expected, 0x01);
            assert_eq!(event_status, 0x20);
        }
        other => panic!("expected a protocol mismatch, got {:?}", other),
    }
}

#[test]
fn test_foreign_service_request_keeps_waiting() {
    let mut b = bench();
    b.sim.set_foreign_srq(true);

    let outcome = signal_write(&mut b.conn, b"SING;", true, 5.0, &b.ctx);

    assert_eq!(outcome, Outcome::Ok);
    assert_eq!(b.sim.traffic().last().map(String::as_str), Some("ESR?;"));
}

#[test]
fn test_long_wait_progress_shows_fraction() {
    let mut b = bench();
    // 200 increments of 30 ms before the instrument answers
    b.sim.set_sweep_polls(200);

    let outcome = signal_write(&mut b.conn, b"WAIT;SING;", true, 10.0, &b.ctx);

    assert_eq!(outcome, Outcome::Ok);
    let progress = progress_messages(&b.results);
    assert_eq!(
        progress,
        vec![
            "Waiting for instrument: 5 s of 10 s (50%)".to_string(),
            "Waiting for instrument: 6 s of 10 s (60%)".to_string(),
        ]
    );
}

#[test]
fn test_disabled_timeouts_wait_past_the_bound() {
    let mut b = bench();
    b.sim.set_sweep_polls(50);
    let ctx = OpContext::new(CancelToken::new(), b.results.clone()).with_timeouts_disabled(true);

    let outcome = signal_write(&mut b.conn, b"SING;", true, 0.1, &ctx);

    assert_eq!(outcome, Outcome::Ok);
}

// ============================================================================
// Timeout Bookkeeping
// ============================================================================

proptest! {
    #[test]
    fn prop_nested_saves_restore_ambient(
        classes in prop::collection::vec(prop::sample::select(TimeoutClass::ALL.to_vec()), 1..12),
        device in any::<bool>(),
    ) {
        let mut b = bench();
        let target = if device { TimeoutTarget::Device } else { TimeoutTarget::Controller };
        let ambient = b.sim.timeout(target);

        for class in &classes {
            b.conn.timeout(target, *class, TimeoutPurpose::SaveAndSet).unwrap();
            prop_assert_eq!(b.conn.current_timeout(target).unwrap(), *class);
        }
        for _ in &classes {
            b.conn.restore_timeout(target).unwrap();
        }

        prop_assert_eq!(b.sim.timeout(target), ambient);
        prop_assert!(matches!(
            b.conn.restore_timeout(target),
            Err(BusError::NoSavedTimeout(t)) if t == target
        ));
    }
}

// ============================================================================
// Configuration Files
// ============================================================================

#[test]
fn test_config_file_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("engine.toml");

    let mut config = EngineConfig::default();
    config.engine.log_level = "debug".to_string();
    config.timeouts.sweep_seconds = 300.0;
    let mut relay = TransportConfig::numeric(TransportKind::SerialRelay, 0, 9);
    relay.serial_port = Some("/dev/ttyUSB0".to_string());
    config.identities.insert("bench-vna".to_string(), relay.clone());

    config.save(&path).unwrap();
    let loaded = load_config(path.to_str().unwrap()).unwrap();

    assert_eq!(loaded.engine.log_level, "debug");
    assert_eq!(loaded.timeouts.sweep_seconds, 300.0);
    assert_eq!(loaded.transport, config.transport);
    assert_eq!(loaded.identities.get("bench-vna"), Some(&relay));
}

#[test]
fn test_invalid_config_file_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("engine.toml");
    std::fs::write(
        &path,
        "[transport]\nkind = \"native-bus\"\ndevice_address = 31\n",
    )
    .unwrap();

    let err = load_config(path.to_str().unwrap()).unwrap_err();
    assert!(format!("{:#}", err).contains("device_address"), "{:#}", err);
}
