//! Test utilities for bench-engine
//!
//! Provides synthetic instrument data and helpers for collecting dispatcher
//! results in tests across crates.
//!
//! # Example
//!
//! ```
//! use common::test_utils::create_mock_trace_points;
//!
//! let points = create_mock_trace_points(201);
//! assert_eq!(points.len(), 201);
//! ```

use crate::InstrumentBridge;
use protocol::{
    CalType, FirmwareInfo, InstrumentState, ResultItem, TracePoint, encode_block, encode_form3,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::future::Future;
use std::time::{Duration, Instant};

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Identification string of the simulated instrument
pub const MOCK_IDENTITY: &str = "HEWLETT PACKARD,8753D,0,6.14";

/// Create `count` reproducible pseudo-random complex points
///
/// Magnitudes stay below 1.0 like real reflection data.
pub fn create_mock_trace_points(count: usize) -> Vec<TracePoint> {
    let mut rng = StdRng::seed_from_u64(count as u64);
    (0..count)
        .map(|_| TracePoint {
            re: rng.random_range(-0.7..0.7),
            im: rng.random_range(-0.7..0.7),
        })
        .collect()
}

/// Create a framed FORM3 block holding `count` points
pub fn create_mock_form3_block(count: usize) -> Vec<u8> {
    encode_block(&encode_form3(&create_mock_trace_points(count)))
        .unwrap_or_else(|e| panic!("mock block too large: {}", e))
}

/// Create a reproducible learn string body of `len` bytes
pub fn create_mock_learn_string(len: usize) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(0x8753);
    (0..len).map(|_| rng.random::<u8>()).collect()
}

/// Create a complete instrument state with a calibration of type `cal_type`
pub fn create_mock_state(cal_type: CalType) -> InstrumentState {
    InstrumentState {
        firmware: FirmwareInfo::parse(MOCK_IDENTITY),
        learn_string: create_mock_learn_string(0x300),
        cal_type,
        cal_arrays: (0..cal_type.array_count())
            .map(|i| encode_form3(&create_mock_trace_points(11 + i)))
            .collect(),
        settings: Vec::new(),
    }
}

/// Collect results until `count` operation-complete notifications arrived
///
/// Panics if `timeout` elapses first.
pub fn collect_until_complete(
    bridge: &InstrumentBridge,
    count: usize,
    timeout: Duration,
) -> Vec<ResultItem> {
    let deadline = Instant::now() + timeout;
    let mut results = Vec::new();
    let mut completes = 0;

    while completes < count {
        match bridge.try_pop_result() {
            Some(item) => {
                if item.is_complete() {
                    completes += 1;
                }
                results.push(item);
            }
            None => {
                assert!(
                    Instant::now() < deadline,
                    "timed out after {:?} with {} of {} items complete: {:?}",
                    timeout,
                    completes,
                    count,
                    results
                );
                std::thread::sleep(Duration::from_millis(2));
            }
        }
    }
    results
}

/// Split a result stream at each operation-complete notification
pub fn split_per_item(results: &[ResultItem]) -> Vec<&[ResultItem]> {
    results
        .split_inclusive(|item| item.is_complete())
        .collect()
}

/// Timeout wrapper for async tests
///
/// Wraps an async operation with a timeout to prevent tests from hanging.
pub async fn with_timeout<T, F>(duration: Duration, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| TimeoutError { duration })
}

/// Error returned when a test times out
#[derive(Debug)]
pub struct TimeoutError {
    /// The timeout duration that was exceeded
    pub duration: Duration,
}

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Test timed out after {:?}", self.duration)
    }
}

impl std::error::Error for TimeoutError {}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::{block_body, decode_form3};

    #[test]
    fn test_mock_points_are_reproducible() {
        let a = create_mock_trace_points(51);
        let b = create_mock_trace_points(51);
        assert_eq!(a, b);
        assert!(a.iter().all(|p| p.magnitude() < 1.0));
    }

    #[test]
    fn test_mock_form3_block() {
        let block = create_mock_form3_block(21);
        let points = decode_form3(block_body(&block).unwrap()).unwrap();
        assert_eq!(points.len(), 21);
    }

    #[test]
    fn test_mock_state_array_count() {
        let state = create_mock_state(CalType::FullTwoPort);
        assert_eq!(state.cal_arrays.len(), 12);
        assert_eq!(state.firmware.unwrap().model, "8753D");
    }

    #[test]
    fn test_split_per_item() {
        let results = vec![
            ResultItem::info("a"),
            ResultItem::complete(),
            ResultItem::error("b"),
            ResultItem::complete(),
        ];
        let items = split_per_item(&results);
        assert_eq!(items.len(), 2);
        assert_eq!(items[1].len(), 2);
        assert!(items[1][0].is_error());
    }

    #[tokio::test]
    async fn test_with_timeout_failure() {
        let result = with_timeout(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            42
        })
        .await;

        assert!(result.is_err());
    }
}
