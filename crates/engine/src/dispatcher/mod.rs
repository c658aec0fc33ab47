//! Command dispatcher
//!
//! The only code that touches the bus. It runs on a dedicated OS thread and
//! talks to the consumer exclusively through the notification queues of
//! [`common::InstrumentBridge`].

pub mod commands;
pub mod worker;

pub use worker::{DispatchSettings, Dispatcher, DispatcherState};

use crate::transport::Connector;
use common::DispatcherEndpoint;
use std::thread::JoinHandle;

/// Name of the dispatcher thread, visible in log lines
pub const DISPATCHER_THREAD: &str = "bus-dispatcher";

/// Spawn the dispatcher thread
///
/// The thread runs until it consumes the `End` sentinel (or the work queue is
/// closed) and closes the result queue on its way out.
pub fn spawn_dispatcher(
    endpoint: DispatcherEndpoint,
    connector: Box<dyn Connector>,
    settings: DispatchSettings,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name(DISPATCHER_THREAD.to_string())
        .spawn(move || Dispatcher::new(endpoint, connector, settings).run())
}
