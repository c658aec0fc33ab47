//! Protocol library for bench-engine
//!
//! This crate defines the vocabulary shared by the instrument bus engine and
//! its consumers: status words, timeout classes, operation outcomes, work and
//! result items, the `#A` block codec and learn-string layouts.
//!
//! # Example
//!
//! ```
//! use protocol::{encode_block, block_body, decode_form3, encode_form3, TracePoint};
//!
//! let points = vec![TracePoint { re: 0.5, im: -0.25 }];
//! let framed = encode_block(&encode_form3(&points)).unwrap();
//!
//! let decoded = decode_form3(block_body(&framed).unwrap()).unwrap();
//! assert_eq!(decoded, points);
//! ```

pub mod codec;
pub mod error;
pub mod learn;
pub mod messages;
pub mod types;

pub use codec::{
    BLOCK_HEADER_LEN, FORM3_POINT_LEN, MAX_BLOCK_BODY, block_body, decode_form3, encode_block,
    encode_form3, parse_block_header, parse_number,
};
pub use error::{BusError, Result};
pub use learn::{
    LearnDiff, LearnStringLayout, RecoveredSetting, SettingValue, diff_learn_strings, diff_runs,
    layout_for, recover_settings,
};
pub use messages::{
    Command, InstrumentState, ResultData, ResultItem, ResultKind, ResultTag, WorkItem,
};
pub use types::{
    BusStatus, CalType, FirmwareInfo, MultiPortData, Outcome, SParameter, SParameterTrace,
    TimeoutClass, TimeoutPurpose, TimeoutTarget, Trace, TracePoint, TransportConfig,
    TransportKind,
};
