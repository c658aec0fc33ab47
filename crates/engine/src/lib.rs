//! Instrument bus engine
//!
//! Drives a vector network analyzer over an IEEE-488 style bus. A dedicated
//! dispatcher thread owns the connection and executes queued work items;
//! every blocking bus step is a bounded, cancellable wait.
//!
//! # Example
//!
//! ```
//! use common::create_bridge;
//! use engine::dispatcher::{DispatchSettings, spawn_dispatcher};
//! use engine::transport::sim::{SimConnector, SimInstrument};
//! use protocol::{Command, ResultData, WorkItem};
//!
//! let (bridge, endpoint) = create_bridge();
//! let connector = Box::new(SimConnector::new(SimInstrument::new()));
//! let handle = spawn_dispatcher(endpoint, connector, DispatchSettings::default()).unwrap();
//!
//! bridge.submit(WorkItem::new(Command::RetrieveTrace { channel: 1 }));
//! bridge.shutdown();
//!
//! let mut traces = 0;
//! while let Ok(item) = bridge.recv_result_blocking() {
//!     if matches!(item.data, Some(ResultData::Trace(_))) {
//!         traces += 1;
//!     }
//! }
//! handle.join().unwrap();
//! assert_eq!(traces, 1);
//! ```

pub mod config;
pub mod dispatcher;
pub mod io;
pub mod transport;

pub use config::EngineConfig;
pub use dispatcher::{DispatchSettings, Dispatcher, spawn_dispatcher};
pub use transport::{Connection, Connector, HardwareConnector, Transport};
