//! bench-engine
//!
//! Command-line consumer of the instrument engine: queues work items for the
//! dispatcher thread and prints the notifications that come back.

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use common::{InstrumentBridge, create_bridge, setup_logging};
use engine::config::EngineConfig;
use engine::dispatcher::{DispatchSettings, spawn_dispatcher};
use engine::transport::sim::{SimConnector, SimInstrument};
use engine::transport::{Connector, HardwareConnector};
use protocol::{
    Command, InstrumentState, ResultData, ResultItem, ResultKind, ResultTag, TransportConfig,
    WorkItem,
};
use std::path::{Path, PathBuf};
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "bench-engine")]
#[command(
    author,
    version,
    about = "Bench Engine - Drive a vector network analyzer over GPIB"
)]
#[command(long_about = "
Queues measurement and configuration jobs for a dedicated bus thread and
prints its notifications. Jobs run in the order given below; Ctrl+C aborts
the job in progress.

EXAMPLES:
    # Fetch the channel 1 trace from the configured instrument
    bench-engine --trace 1

    # Use a named identity from the configuration file
    bench-engine --identity bench-vna --multiport --json

    # Save the instrument state and calibration, restore it later
    bench-engine --retrieve-state --state-file cal.json
    bench-engine --send-state cal.json

    # Find where a command changes the learn string
    bench-engine --analyze 'AVERON;'

    # Try everything against the built-in simulated analyzer
    bench-engine --simulate --trace 1 --multiport

CONFIGURATION:
    The engine looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/bench-engine/engine.toml
    3. /etc/bench-engine/engine.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<String>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Talk to a simulated analyzer instead of hardware
    #[arg(long)]
    simulate: bool,

    /// Connect to a named identity instead of the configured transport
    #[arg(long, value_name = "NAME")]
    identity: Option<String>,

    /// Retrieve the formatted trace of a display channel (1 or 2)
    #[arg(long, value_name = "N")]
    trace: Option<u8>,

    /// Measure all four S-parameters
    #[arg(long)]
    multiport: bool,

    /// Retrieve the learn string and calibration
    #[arg(long)]
    retrieve_state: bool,

    /// Where --retrieve-state writes the state (JSON)
    #[arg(long, value_name = "PATH", requires = "retrieve_state")]
    state_file: Option<PathBuf>,

    /// Restore a state saved with --retrieve-state --state-file
    #[arg(long, value_name = "PATH")]
    send_state: Option<PathBuf>,

    /// Report which learn-string bytes a command changes
    #[arg(long, value_name = "CMD")]
    analyze: Option<String>,

    /// Upload a user calibration kit definition
    #[arg(long, value_name = "FILE")]
    cal_kit: Option<PathBuf>,

    /// Print notifications as JSON lines
    #[arg(long)]
    json: bool,
}

impl Args {
    fn work_items(&self, transport: TransportConfig) -> Result<Vec<WorkItem>> {
        let mut items = vec![WorkItem::new(Command::ConfigureTransport(transport))];

        if let Some(path) = &self.send_state {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read state file: {}", path.display()))?;
            let state: InstrumentState = serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse state file: {}", path.display()))?;
            items.push(WorkItem::new(Command::SendStateAndCal(Box::new(state))));
        }
        if let Some(channel) = self.trace {
            items.push(WorkItem::new(Command::RetrieveTrace { channel }));
        }
        if self.multiport {
            items.push(WorkItem::new(Command::MeasureMultiPort));
        }
        if self.retrieve_state {
            items.push(WorkItem::new(Command::RetrieveStateAndCal));
        }
        if let Some(cmd) = &self.analyze {
            items.push(WorkItem::with_payload(
                Command::AnalyzeLearnString,
                cmd.as_bytes(),
            ));
        }
        if let Some(path) = &self.cal_kit {
            let definition = std::fs::read(path)
                .with_context(|| format!("Failed to read calibration kit: {}", path.display()))?;
            items.push(WorkItem::with_payload(Command::SendCalKit, definition));
        }

        items.push(WorkItem::end());
        Ok(items)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = EngineConfig::default();
        let path = EngineConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = if let Some(ref path) = args.config {
        engine::config::load_config(path).context("Failed to load configuration")?
    } else {
        EngineConfig::load_or_default()
    };

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.engine.log_level);
    setup_logging(log_level).context("Failed to setup logging")?;

    info!("bench-engine v{}", env!("CARGO_PKG_VERSION"));

    let transport = match &args.identity {
        Some(name) => {
            let kind = config
                .identities
                .get(name)
                .map_or(config.transport.kind, |identity| identity.kind);
            TransportConfig::named(kind, name.as_str())
        }
        None => config.transport.clone(),
    };
    let items = args.work_items(transport)?;

    let connector: Box<dyn Connector> = if args.simulate {
        info!("Using the simulated analyzer");
        Box::new(SimConnector::new(SimInstrument::new()))
    } else {
        Box::new(HardwareConnector::new(config.identities.clone()))
    };

    let (bridge, endpoint) = create_bridge();
    let handle = spawn_dispatcher(endpoint, connector, DispatchSettings::from(&config))
        .context("Failed to spawn dispatcher thread")?;

    for item in items {
        bridge.submit(item);
    }

    let failures = consume(&bridge, &args).await?;

    handle
        .join()
        .map_err(|_| anyhow!("Dispatcher thread panicked"))?;

    if failures > 0 {
        return Err(anyhow!("{} job(s) failed", failures));
    }
    Ok(())
}

/// Print results until the dispatcher closes the queue; returns the error count
async fn consume(bridge: &InstrumentBridge, args: &Args) -> Result<usize> {
    let mut failures = 0;

    loop {
        tokio::select! {
            result = bridge.recv_result() => {
                let Ok(item) = result else {
                    break;
                };
                if item.is_error() {
                    failures += 1;
                }
                if let (Some(path), Some(ResultData::State(state))) = (&args.state_file, &item.data) {
                    save_state(path, state)?;
                }
                if args.json {
                    println!("{}", serde_json::to_string(&item)?);
                } else if let Some(line) = render(&item) {
                    println!("{}", line);
                }
            }
            _ = signal::ctrl_c() => {
                warn!("Interrupted, aborting the current job");
                bridge.abort();
            }
        }
    }

    Ok(failures)
}

fn save_state(path: &Path, state: &InstrumentState) -> Result<()> {
    let content = serde_json::to_string_pretty(state).context("Failed to serialize state")?;
    std::fs::write(path, content)
        .with_context(|| format!("Failed to write state file: {}", path.display()))?;
    info!("Saved state to {}", path.display());
    Ok(())
}

/// One human readable line per notification
fn render(item: &ResultItem) -> Option<String> {
    if item.is_complete() {
        return None;
    }
    if let Some(message) = &item.message {
        return Some(match (item.kind, item.tag) {
            (ResultKind::Error, _) => {
                error!("{}", message);
                format!("error: {}", message)
            }
            (_, ResultTag::Progress) => format!("  {}", message),
            (ResultKind::HighlightedInfo, _) => format!("* {}", message),
            _ => message.clone(),
        });
    }

    let data = item.data.as_ref()?;
    Some(match data {
        ResultData::Identity(firmware) => format!(
            "Instrument: {} {} (firmware {:.2})",
            firmware.manufacturer, firmware.model, firmware.revision
        ),
        ResultData::Trace(trace) => {
            let mut lines = vec![format!(
                "Channel {} trace, {} points, {:.0} Hz to {:.0} Hz",
                trace.channel,
                trace.points.len(),
                trace.start_hz,
                trace.stop_hz
            )];
            for (i, point) in trace.points.iter().enumerate() {
                lines.push(format!("{:5} {:>14.6e} {:>14.6e}", i, point.re, point.im));
            }
            lines.join("\n")
        }
        ResultData::MultiPort(data) => {
            let mut lines = vec![format!(
                "S-parameters, {:.0} Hz to {:.0} Hz",
                data.start_hz, data.stop_hz
            )];
            for trace in &data.traces {
                let peak = trace
                    .points
                    .iter()
                    .map(|p| p.magnitude())
                    .fold(0.0_f64, f64::max);
                lines.push(format!(
                    "  {} {} points, peak magnitude {:.4}",
                    trace.parameter.mnemonic(),
                    trace.points.len(),
                    peak
                ));
            }
            lines.join("\n")
        }
        ResultData::State(state) => {
            let mut lines = vec![format!(
                "State: {} byte learn string, calibration {} ({} arrays)",
                state.learn_string.len(),
                state.cal_type.mnemonic(),
                state.cal_arrays.len()
            )];
            for setting in &state.settings {
                lines.push(format!("  {} = {:?}", setting.name, setting.value));
            }
            lines.join("\n")
        }
        ResultData::LearnDiff(diffs) => {
            let mut lines = vec![format!("{} learn-string byte(s) changed", diffs.len())];
            for diff in diffs {
                lines.push(format!(
                    "  offset {:5}: {} -> {}",
                    diff.offset,
                    hex_byte(diff.before),
                    hex_byte(diff.after)
                ));
            }
            lines.join("\n")
        }
        ResultData::Bytes(bytes) => format!("{} bytes", bytes.len()),
    })
}

fn hex_byte(byte: Option<u8>) -> String {
    byte.map_or_else(|| "--".to_string(), |b| format!("{:02x}", b))
}
