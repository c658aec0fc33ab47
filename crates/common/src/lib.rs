//! Common utilities for bench-engine
//!
//! This crate provides shared functionality between the dispatcher and its
//! consumers: the notification queues and the bridge built on them, the
//! cancellation token, error handling and logging setup.

pub mod cancel;
pub mod channel;
pub mod error;
pub mod logging;
pub mod test_utils;

pub use cancel::CancelToken;
pub use channel::{DispatcherEndpoint, InstrumentBridge, NotificationQueue, create_bridge};
pub use error::{Error, Result};
pub use logging::setup_logging;
