//! Dispatcher thread
//!
//! Owns the connection and executes work items one at a time, in arrival
//! order. Every item ends with exactly one operation-complete notification,
//! posted after all other notifications of that item. Failures, including
//! panics, are reported to the consumer and never stop the loop; only the
//! `End` sentinel does.

use super::commands::{self, Session};
use crate::config::{EngineConfig, OperationTimeouts};
use crate::io::OpContext;
use crate::transport::{Connection, Connector};
use common::DispatcherEndpoint;
use protocol::{
    BusError, Command, FirmwareInfo, Result, ResultData, ResultItem, ResultTag, TransportConfig,
    WorkItem,
};
use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Lifecycle of the dispatcher loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherState {
    Idle,
    Configuring,
    Executing,
    /// Terminal; reached only through the `End` sentinel
    ShuttingDown,
}

/// What the dispatcher takes from the configuration
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    /// Used when a work item arrives before any configure
    pub transport: TransportConfig,
    pub timeouts: OperationTimeouts,
    /// Pause after the device clear that follows a failed item
    pub settle: Duration,
    pub disable_timeouts: bool,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

impl From<&EngineConfig> for DispatchSettings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            transport: config.transport.clone(),
            timeouts: config.timeouts.clone(),
            settle: config.engine.settle(),
            disable_timeouts: config.engine.disable_timeouts,
        }
    }
}

pub struct Dispatcher {
    endpoint: DispatcherEndpoint,
    connector: Box<dyn Connector>,
    settings: DispatchSettings,
    ctx: OpContext,
    connection: Option<Connection>,
    /// Last requested transport; reused by auto-configure
    transport: TransportConfig,
    /// Identity of the connected instrument, read lazily
    firmware: Option<FirmwareInfo>,
    state: DispatcherState,
}

impl Dispatcher {
    pub fn new(
        endpoint: DispatcherEndpoint,
        connector: Box<dyn Connector>,
        settings: DispatchSettings,
    ) -> Self {
        let ctx = OpContext::new(endpoint.cancel_token().clone(), endpoint.results().clone())
            .with_timeouts_disabled(settings.disable_timeouts);
        let transport = settings.transport.clone();

        Self {
            endpoint,
            connector,
            settings,
            ctx,
            connection: None,
            transport,
            firmware: None,
            state: DispatcherState::Idle,
        }
    }

    pub fn state(&self) -> DispatcherState {
        self.state
    }

    /// Run until the `End` sentinel is consumed or the work queue closes
    pub fn run(mut self) {
        info!("Dispatcher started");

        loop {
            let item = match self.endpoint.recv_work() {
                Ok(item) => item,
                Err(e) => {
                    warn!("{}, stopping dispatcher", e);
                    break;
                }
            };

            self.handle_item(item);
            self.endpoint.post(ResultItem::complete());

            if self.state == DispatcherState::ShuttingDown {
                break;
            }
        }

        if let Some(mut conn) = self.connection.take() {
            conn.close();
        }
        self.endpoint.close();
        info!("Dispatcher stopped");
    }

    /// Handle one item; never panics and never returns an error
    fn handle_item(&mut self, item: WorkItem) {
        let name = item.command.name();
        debug!("Handling {}", name);

        let result = catch_unwind(AssertUnwindSafe(|| self.handle_item_inner(item)));

        let failed = match result {
            Ok(Ok(())) => false,
            Ok(Err(e)) => {
                warn!("{} failed: {}", name, e);
                self.endpoint
                    .post(ResultItem::error(format!("{} failed: {}", name, e)));
                true
            }
            Err(panic) => {
                error!("Panic in {} handler: {}", name, panic_message(panic.as_ref()));
                self.endpoint
                    .post(ResultItem::error(format!("{} failed: internal error", name)));
                true
            }
        };

        self.recover(failed);
        if self.state != DispatcherState::ShuttingDown {
            self.state = DispatcherState::Idle;
        }
    }

    fn handle_item_inner(&mut self, item: WorkItem) -> Result<()> {
        match item.command {
            Command::End => {
                info!("Dispatcher shutting down");
                self.state = DispatcherState::ShuttingDown;
                Ok(())
            }
            Command::Abort => {
                let message = if self.ctx.cancel.reset() {
                    "Abort acknowledged"
                } else {
                    "Nothing to abort"
                };
                self.endpoint.post(ResultItem::info(message));
                Ok(())
            }
            // Items queued ahead of an abort are abandoned without bus traffic
            _ if self.ctx.cancelled() => Err(BusError::Aborted),
            Command::ConfigureTransport(config) => self.configure(config),
            command => self.execute(WorkItem { command, ..item }),
        }
    }

    /// (Re)open the connection; touches the bus only through open and ping
    fn configure(&mut self, config: TransportConfig) -> Result<()> {
        self.state = DispatcherState::Configuring;

        if let Some(mut old) = self.connection.take() {
            old.close();
        }
        self.firmware = None;
        self.transport = config.clone();

        let conn = Connection::open(self.connector.as_mut(), &config)?;
        self.endpoint.post(
            ResultItem::highlight(format!("Connected to {}", conn.describe()))
                .tagged(ResultTag::Connected),
        );
        self.connection = Some(conn);
        Ok(())
    }

    fn execute(&mut self, mut item: WorkItem) -> Result<()> {
        if self.connection.is_none() {
            info!("No open connection, configuring {}", self.transport.describe());
            self.configure(self.transport.clone())?;
        }
        self.state = DispatcherState::Executing;

        let conn = self
            .connection
            .as_mut()
            .ok_or_else(|| BusError::TransportNotFound("no open connection".to_string()))?;
        if !conn.ping() {
            return Err(BusError::TransportUnresponsive(conn.describe()));
        }

        let mut session = Session {
            conn,
            ctx: &self.ctx,
            timeouts: &self.settings.timeouts,
        };

        if self.firmware.is_none() {
            let firmware = commands::identify(&mut session)?;
            info!(
                "Instrument is {} {} firmware {:.2}",
                firmware.manufacturer, firmware.model, firmware.revision
            );
            self.endpoint.post(ResultItem::data(
                ResultTag::Identity,
                ResultData::Identity(firmware.clone()),
            ));
            self.firmware = Some(firmware);
        }

        let payload = item.take_payload();
        match &item.command {
            Command::RetrieveTrace { channel } => {
                let trace = commands::retrieve_trace(&mut session, *channel)?;
                self.endpoint
                    .post(ResultItem::data(ResultTag::Trace, ResultData::Trace(trace)));
            }
            Command::MeasureMultiPort => {
                let data = commands::measure_multiport(&mut session)?;
                self.endpoint.post(ResultItem::data(
                    ResultTag::MultiPort,
                    ResultData::MultiPort(data),
                ));
            }
            Command::RetrieveStateAndCal => {
                let state = commands::retrieve_state_and_cal(&mut session, self.firmware.as_ref())?;
                self.endpoint.post(ResultItem::data(
                    ResultTag::StateAndCal,
                    ResultData::State(Box::new(state)),
                ));
            }
            Command::SendStateAndCal(state) => {
                commands::send_state_and_cal(&mut session, state)?;
                self.endpoint.post(
                    ResultItem::highlight("State and calibration restored")
                        .tagged(ResultTag::StateAndCal),
                );
            }
            Command::AnalyzeLearnString => {
                let modification = payload_text(payload, "learn string analysis")?;
                let diffs = commands::analyze_learn_string(&mut session, &modification)?;
                self.endpoint.post(ResultItem::data(
                    ResultTag::LearnAnalysis,
                    ResultData::LearnDiff(diffs),
                ));
            }
            Command::SendCalKit => {
                let definition = payload_text(payload, "calibration kit")?;
                commands::send_cal_kit(&mut session, &definition)?;
            }
            Command::ConfigureTransport(_) | Command::Abort | Command::End => {
                debug!("{} needs no bus session", item.command.name());
            }
        }
        Ok(())
    }

    /// Clear lingering error bits before the next item
    fn recover(&mut self, failed: bool) {
        let Some(conn) = self.connection.as_mut() else {
            return;
        };
        if !failed && !conn.status().is_error() {
            return;
        }

        let status = conn.clear();
        if status.is_error() {
            warn!("Device clear left status {}", status);
        }
        std::thread::sleep(self.settings.settle);
    }
}

fn payload_text(payload: Option<Vec<u8>>, what: &str) -> Result<String> {
    let payload =
        payload.ok_or_else(|| BusError::InvalidRequest(format!("{} needs a payload", what)))?;
    Ok(String::from_utf8_lossy(&payload).into_owned())
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::sim::{SimConnector, SimInstrument};
    use common::create_bridge;
    use protocol::ResultKind;

    fn dispatcher(sim: &SimInstrument) -> (common::InstrumentBridge, Dispatcher) {
        let (bridge, endpoint) = create_bridge();
        let settings = DispatchSettings {
            settle: Duration::ZERO,
            ..DispatchSettings::default()
        };
        let dispatcher = Dispatcher::new(
            endpoint,
            Box::new(SimConnector::new(sim.clone())),
            settings,
        );
        (bridge, dispatcher)
    }

    fn drain(bridge: &common::InstrumentBridge) -> Vec<ResultItem> {
        let mut items = Vec::new();
        while let Some(item) = bridge.try_pop_result() {
            items.push(item);
        }
        items
    }

    #[test]
    fn test_initial_state() {
        let sim = SimInstrument::new();
        let (_bridge, dispatcher) = dispatcher(&sim);
        assert_eq!(dispatcher.state(), DispatcherState::Idle);
    }

    #[test]
    fn test_end_sets_shutting_down() {
        let sim = SimInstrument::new();
        let (bridge, mut dispatcher) = dispatcher(&sim);
        dispatcher.handle_item(WorkItem::end());
        assert_eq!(dispatcher.state(), DispatcherState::ShuttingDown);
        assert!(drain(&bridge).iter().all(|r| !r.is_error()));
    }

    #[test]
    fn test_configure_posts_connected() {
        let sim = SimInstrument::new();
        let (bridge, mut dispatcher) = dispatcher(&sim);
        dispatcher.handle_item(WorkItem::new(Command::ConfigureTransport(
            TransportConfig::default(),
        )));

        let results = drain(&bridge);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].tag, ResultTag::Connected);
        assert_eq!(results[0].kind, ResultKind::HighlightedInfo);
        assert!(sim.traffic().is_empty());
        assert_eq!(dispatcher.state(), DispatcherState::Idle);
    }

    #[test]
    fn test_queued_item_after_abort_is_skipped() {
        let sim = SimInstrument::new();
        let (bridge, mut dispatcher) = dispatcher(&sim);
        bridge.cancel_token().request();

        dispatcher.handle_item(WorkItem::new(Command::RetrieveTrace { channel: 1 }));
        let results = drain(&bridge);
        assert_eq!(results.len(), 1);
        assert!(results[0].is_error());
        assert!(sim.traffic().is_empty());

        dispatcher.handle_item(WorkItem::new(Command::Abort));
        assert!(!bridge.cancel_token().is_requested());
    }

    #[test]
    fn test_missing_payload_is_reported() {
        let sim = SimInstrument::new();
        let (bridge, mut dispatcher) = dispatcher(&sim);
        dispatcher.handle_item(WorkItem::new(Command::SendCalKit));

        let results = drain(&bridge);
        let errors: Vec<_> = results.iter().filter(|r| r.is_error()).collect();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.as_deref().unwrap().contains("payload"));
    }

    #[test]
    fn test_panic_message() {
        let panic: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(panic.as_ref()), "boom");
        let panic: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(panic.as_ref()), "bang");
        let panic: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(panic.as_ref()), "unknown panic");
    }
}
