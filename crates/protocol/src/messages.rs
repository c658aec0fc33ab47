//! Work items and result items
//!
//! Work items flow from the consumer to the dispatcher, result items flow back.
//! Each item is consumed exactly once; payload ownership moves with the item.

use crate::learn::{LearnDiff, RecoveredSetting};
use crate::types::{CalType, FirmwareInfo, MultiPortData, Trace, TransportConfig};
use serde::{Deserialize, Serialize};

/// Full instrument configuration: learn string plus calibration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentState {
    pub firmware: Option<FirmwareInfo>,
    /// Learn string body (without `#A` header)
    pub learn_string: Vec<u8>,
    pub cal_type: CalType,
    /// Error-coefficient array bodies, in instrument order
    pub cal_arrays: Vec<Vec<u8>>,
    /// Settings recovered from known learn-string offsets
    pub settings: Vec<RecoveredSetting>,
}

/// Command carried by a work item
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// (Re)open the connection; the only command that needs no open handle
    ConfigureTransport(TransportConfig),
    RetrieveStateAndCal,
    SendStateAndCal(Box<InstrumentState>),
    RetrieveTrace {
        channel: u8,
    },
    MeasureMultiPort,
    /// Payload is the command that modifies the state under study
    AnalyzeLearnString,
    /// Payload is the pre-formatted kit definition
    SendCalKit,
    /// Acknowledges a cancellation requested through the bridge
    Abort,
    /// Sentinel that shuts the dispatcher down
    End,
}

impl Command {
    /// Short name for logs
    pub fn name(&self) -> &'static str {
        match self {
            Command::ConfigureTransport(_) => "configure-transport",
            Command::RetrieveStateAndCal => "retrieve-state-and-calibration",
            Command::SendStateAndCal(_) => "send-state-and-calibration",
            Command::RetrieveTrace { .. } => "retrieve-trace",
            Command::MeasureMultiPort => "measure-multi-port",
            Command::AnalyzeLearnString => "analyze-learn-string",
            Command::SendCalKit => "send-calibration-kit",
            Command::Abort => "abort",
            Command::End => "end",
        }
    }
}

/// One request for the dispatcher
#[derive(Debug, Clone, PartialEq)]
pub struct WorkItem {
    pub command: Command,
    pub payload: Option<Vec<u8>>,
    /// Number of meaningful payload bytes; `None` means all of them
    pub length: Option<usize>,
}

impl WorkItem {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            payload: None,
            length: None,
        }
    }

    pub fn with_payload(command: Command, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            command,
            payload: Some(payload.into()),
            length: None,
        }
    }

    pub fn end() -> Self {
        Self::new(Command::End)
    }

    /// Take the payload, truncated to `length`
    pub fn take_payload(&mut self) -> Option<Vec<u8>> {
        let mut payload = self.payload.take()?;
        if let Some(len) = self.length {
            payload.truncate(len);
        }
        Some(payload)
    }
}

/// Severity/category of a result item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResultKind {
    Info,
    HighlightedInfo,
    Error,
    Data,
}

/// What a result item refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResultTag {
    General,
    Progress,
    Connected,
    Identity,
    Trace,
    MultiPort,
    StateAndCal,
    LearnAnalysis,
    /// Posted exactly once after every work item
    OperationComplete,
}

/// Typed payload of a data result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ResultData {
    Bytes(Vec<u8>),
    Identity(FirmwareInfo),
    Trace(Trace),
    MultiPort(MultiPortData),
    State(Box<InstrumentState>),
    LearnDiff(Vec<LearnDiff>),
}

/// One notification for the consumer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultItem {
    pub kind: ResultKind,
    pub tag: ResultTag,
    pub message: Option<String>,
    pub data: Option<ResultData>,
}

impl ResultItem {
    pub fn info(message: impl Into<String>) -> Self {
        Self::message(ResultKind::Info, ResultTag::General, message)
    }

    pub fn highlight(message: impl Into<String>) -> Self {
        Self::message(ResultKind::HighlightedInfo, ResultTag::General, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::message(ResultKind::Error, ResultTag::General, message)
    }

    pub fn progress(message: impl Into<String>) -> Self {
        Self::message(ResultKind::Info, ResultTag::Progress, message)
    }

    pub fn data(tag: ResultTag, data: ResultData) -> Self {
        Self {
            kind: ResultKind::Data,
            tag,
            message: None,
            data: Some(data),
        }
    }

    pub fn complete() -> Self {
        Self {
            kind: ResultKind::Info,
            tag: ResultTag::OperationComplete,
            message: None,
            data: None,
        }
    }

    pub fn message(kind: ResultKind, tag: ResultTag, message: impl Into<String>) -> Self {
        Self {
            kind,
            tag,
            message: Some(message.into()),
            data: None,
        }
    }

    /// Attach a tag to a message item
    pub fn tagged(mut self, tag: ResultTag) -> Self {
        self.tag = tag;
        self
    }

    pub fn is_complete(&self) -> bool {
        self.tag == ResultTag::OperationComplete
    }

    pub fn is_error(&self) -> bool {
        self.kind == ResultKind::Error
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_payload_honours_length() {
        let mut item = WorkItem::with_payload(Command::SendCalKit, b"MODI1;XYZ".to_vec());
        item.length = Some(6);
        assert_eq!(item.take_payload().unwrap(), b"MODI1;");
        assert!(item.take_payload().is_none());
    }

    #[test]
    fn test_take_payload_length_longer_than_buffer() {
        let mut item = WorkItem::with_payload(Command::AnalyzeLearnString, b"SING;".to_vec());
        item.length = Some(64);
        assert_eq!(item.take_payload().unwrap(), b"SING;");
    }

    #[test]
    fn test_result_constructors() {
        let done = ResultItem::complete();
        assert!(done.is_complete());
        assert!(!done.is_error());

        let err = ResultItem::error("boom");
        assert!(err.is_error());
        assert_eq!(err.message.as_deref(), Some("boom"));

        let progress = ResultItem::progress("Waiting 6 s");
        assert_eq!(progress.tag, ResultTag::Progress);
        assert_eq!(progress.kind, ResultKind::Info);
    }

    #[test]
    fn test_result_item_serializes() {
        let item = ResultItem::highlight("Connected").tagged(ResultTag::Connected);
        let json = serde_json::to_string(&item).unwrap();
        assert!(json.contains("HighlightedInfo"));
        assert!(json.contains("Connected"));
    }

    #[test]
    fn test_command_names() {
        assert_eq!(Command::End.name(), "end");
        assert_eq!(Command::RetrieveTrace { channel: 2 }.name(), "retrieve-trace");
    }
}
