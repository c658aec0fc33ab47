//! Bridge Integration Tests
//!
//! Tests the consumer/dispatcher bridge with a stand-in dispatcher thread.
//!
//! # Test Scenarios
//! - Results arrive in posting order, each item closed by one complete
//! - Async and blocking consumers see the same stream
//! - Abort raises the shared token ahead of the queued items
//! - Closing the result queue ends the consumer loop
//!
//! Run with: `cargo test -p common --test bridge_tests`

use common::test_utils::{
    DEFAULT_TEST_TIMEOUT, collect_until_complete, split_per_item, with_timeout,
};
use common::{DispatcherEndpoint, create_bridge};
use protocol::{Command, ResultItem, WorkItem};
use std::thread::JoinHandle;

/// Echo dispatcher: one info and one complete per item, aborts acknowledged
fn spawn_echo(endpoint: DispatcherEndpoint) -> JoinHandle<Vec<String>> {
    std::thread::spawn(move || {
        let mut handled = Vec::new();
        while let Ok(item) = endpoint.recv_work() {
            let name = item.command.name().to_string();
            match item.command {
                Command::Abort => {
                    let message = if endpoint.cancel_token().reset() {
                        "Abort acknowledged"
                    } else {
                        "Nothing to abort"
                    };
                    endpoint.post(ResultItem::info(message));
                }
                _ if endpoint.cancel_token().is_requested() => {
                    endpoint.post(ResultItem::error(format!("{} failed: aborted", name)));
                }
                _ => endpoint.post(ResultItem::info(name.clone())),
            }
            endpoint.post(ResultItem::complete());
            handled.push(name);
            if item.command == Command::End {
                break;
            }
        }
        endpoint.close();
        handled
    })
}

// ============================================================================
// Ordering
// ============================================================================

#[test]
fn test_results_follow_submission_order() {
    let (bridge, endpoint) = create_bridge();
    let handle = spawn_echo(endpoint);

    bridge.submit(WorkItem::new(Command::RetrieveTrace { channel: 1 }));
    bridge.submit(WorkItem::new(Command::MeasureMultiPort));
    bridge.submit(WorkItem::new(Command::RetrieveStateAndCal));
    bridge.shutdown();

    let results = collect_until_complete(&bridge, 4, DEFAULT_TEST_TIMEOUT);
    let items = split_per_item(&results);
    assert_eq!(items.len(), 4);

    let names: Vec<_> = items
        .iter()
        .map(|item| item[0].message.clone().unwrap_or_default())
        .collect();
    assert_eq!(
        names,
        vec![
            "retrieve-trace",
            "measure-multi-port",
            "retrieve-state-and-calibration",
            "end"
        ]
    );
    assert!(items.iter().all(|item| item.len() == 2));

    assert_eq!(handle.join().unwrap().len(), 4);
    assert!(bridge.recv_result_blocking().is_err());
}

#[test]
fn test_many_producers_single_dispatcher() {
    let (bridge, endpoint) = create_bridge();
    let handle = spawn_echo(endpoint);

    let producers: Vec<_> = (0..4)
        .map(|_| {
            let bridge = bridge.clone();
            std::thread::spawn(move || {
                for _ in 0..25 {
                    bridge.submit(WorkItem::new(Command::MeasureMultiPort));
                }
            })
        })
        .collect();
    for producer in producers {
        producer.join().unwrap();
    }

    let results = collect_until_complete(&bridge, 100, DEFAULT_TEST_TIMEOUT);
    assert_eq!(results.len(), 200);
    assert!(split_per_item(&results).iter().all(|item| item.len() == 2));

    bridge.shutdown();
    collect_until_complete(&bridge, 1, DEFAULT_TEST_TIMEOUT);
    assert_eq!(handle.join().unwrap().len(), 101);
}

// ============================================================================
// Abort
// ============================================================================

#[test]
fn test_abort_reaches_queued_items() {
    let (bridge, endpoint) = create_bridge();

    bridge.submit(WorkItem::new(Command::MeasureMultiPort));
    bridge.submit(WorkItem::new(Command::RetrieveTrace { channel: 2 }));
    bridge.abort();
    bridge.submit(WorkItem::new(Command::RetrieveTrace { channel: 1 }));
    assert!(bridge.cancel_token().is_requested());

    let handle = spawn_echo(endpoint);
    let results = collect_until_complete(&bridge, 4, DEFAULT_TEST_TIMEOUT);
    let items = split_per_item(&results);

    assert!(items[0][0].is_error());
    assert!(items[1][0].is_error());
    assert_eq!(items[2][0].message.as_deref(), Some("Abort acknowledged"));
    assert_eq!(items[3][0].message.as_deref(), Some("retrieve-trace"));
    assert!(!bridge.cancel_token().is_requested());

    bridge.abort();
    let results = collect_until_complete(&bridge, 1, DEFAULT_TEST_TIMEOUT);
    assert_eq!(results[0].message.as_deref(), Some("Abort acknowledged"));

    bridge.shutdown();
    collect_until_complete(&bridge, 1, DEFAULT_TEST_TIMEOUT);
    handle.join().unwrap();
}

// ============================================================================
// Async Consumer
// ============================================================================

#[tokio::test]
async fn test_async_consumer_until_closed() {
    let (bridge, endpoint) = create_bridge();
    let handle = spawn_echo(endpoint);

    bridge.submit(WorkItem::with_payload(Command::SendCalKit, "CALKN50;"));
    bridge.shutdown();

    let mut received = Vec::new();
    loop {
        match with_timeout(DEFAULT_TEST_TIMEOUT, bridge.recv_result())
            .await
            .expect("consumer timed out")
        {
            Ok(item) => received.push(item),
            Err(_) => break,
        }
    }

    assert_eq!(received.len(), 4);
    assert_eq!(received[0].message.as_deref(), Some("send-calibration-kit"));
    assert!(received[3].is_complete());
    handle.join().unwrap();
}
