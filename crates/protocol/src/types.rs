//! Bus and instrument type definitions
//!
//! Status words, timeout classes, operation outcomes, transport addressing
//! and the measurement data shapes produced by the command layer.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::time::Duration;

/// Raw status word of the last bus operation
///
/// Bit positions follow the IEEE-488 controller status register (`ibsta`) so
/// the native backend can store the word unchanged; the other backends
/// synthesize the same bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct BusStatus(pub u16);

impl BusStatus {
    /// Error detected
    pub const ERR: BusStatus = BusStatus(0x8000);
    /// Timeout
    pub const TIMO: BusStatus = BusStatus(0x4000);
    /// EOI or EOS seen, end of data
    pub const END: BusStatus = BusStatus(0x2000);
    /// Service request asserted on the bus
    pub const SRQI: BusStatus = BusStatus(0x1000);
    /// Device requesting service
    pub const RQS: BusStatus = BusStatus(0x0800);
    /// I/O completed
    pub const CMPL: BusStatus = BusStatus(0x0100);

    const NAMES: [(BusStatus, &'static str); 6] = [
        (Self::ERR, "ERR"),
        (Self::TIMO, "TIMO"),
        (Self::END, "END"),
        (Self::SRQI, "SRQI"),
        (Self::RQS, "RQS"),
        (Self::CMPL, "CMPL"),
    ];

    /// Empty status word
    pub const fn empty() -> Self {
        BusStatus(0)
    }

    /// Raw bits
    pub const fn bits(self) -> u16 {
        self.0
    }

    /// True if every bit of `other` is set
    pub const fn contains(self, other: BusStatus) -> bool {
        self.0 & other.0 == other.0
    }

    /// True if any bit of `other` is set
    pub const fn intersects(self, other: BusStatus) -> bool {
        self.0 & other.0 != 0
    }

    /// Set the bits of `other`
    pub fn insert(&mut self, other: BusStatus) {
        self.0 |= other.0;
    }

    /// Clear the bits of `other`
    pub fn remove(&mut self, other: BusStatus) {
        self.0 &= !other.0;
    }

    pub const fn is_error(self) -> bool {
        self.contains(Self::ERR)
    }

    pub const fn is_timeout(self) -> bool {
        self.contains(Self::TIMO)
    }

    /// Transfer finished, either by count or by end-of-data
    pub const fn is_complete(self) -> bool {
        self.intersects(BusStatus(Self::CMPL.0 | Self::END.0))
    }
}

impl BitOr for BusStatus {
    type Output = BusStatus;

    fn bitor(self, rhs: BusStatus) -> BusStatus {
        BusStatus(self.0 | rhs.0)
    }
}

impl BitOrAssign for BusStatus {
    fn bitor_assign(&mut self, rhs: BusStatus) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for BusStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = Self::NAMES
            .iter()
            .filter(|(bit, _)| self.contains(*bit))
            .map(|(_, name)| *name)
            .collect();
        if names.is_empty() {
            write!(f, "{:#06x}", self.0)
        } else {
            write!(f, "{:#06x} {}", self.0, names.join("|"))
        }
    }
}

/// Discretized timeout register value
///
/// Discriminants match the hardware timeout codes (`TNONE` = 0 .. `T1000s` = 17),
/// so callers request classes rather than arbitrary durations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum TimeoutClass {
    None = 0,
    T10us,
    T30us,
    T100us,
    T300us,
    T1ms,
    T3ms,
    T10ms,
    T30ms,
    T100ms,
    T300ms,
    T1s,
    T3s,
    T10s,
    T30s,
    T100s,
    T300s,
    T1000s,
}

impl TimeoutClass {
    pub const ALL: [TimeoutClass; 18] = [
        TimeoutClass::None,
        TimeoutClass::T10us,
        TimeoutClass::T30us,
        TimeoutClass::T100us,
        TimeoutClass::T300us,
        TimeoutClass::T1ms,
        TimeoutClass::T3ms,
        TimeoutClass::T10ms,
        TimeoutClass::T30ms,
        TimeoutClass::T100ms,
        TimeoutClass::T300ms,
        TimeoutClass::T1s,
        TimeoutClass::T3s,
        TimeoutClass::T10s,
        TimeoutClass::T30s,
        TimeoutClass::T100s,
        TimeoutClass::T300s,
        TimeoutClass::T1000s,
    ];

    /// Hardware register code
    pub const fn code(self) -> u8 {
        self as u8
    }

    /// Class for a hardware register code
    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.get(code as usize).copied()
    }

    /// Duration of this class; `None` means wait forever
    pub fn duration(self) -> Option<Duration> {
        let micros: u64 = match self {
            TimeoutClass::None => return None,
            TimeoutClass::T10us => 10,
            TimeoutClass::T30us => 30,
            TimeoutClass::T100us => 100,
            TimeoutClass::T300us => 300,
            TimeoutClass::T1ms => 1_000,
            TimeoutClass::T3ms => 3_000,
            TimeoutClass::T10ms => 10_000,
            TimeoutClass::T30ms => 30_000,
            TimeoutClass::T100ms => 100_000,
            TimeoutClass::T300ms => 300_000,
            TimeoutClass::T1s => 1_000_000,
            TimeoutClass::T3s => 3_000_000,
            TimeoutClass::T10s => 10_000_000,
            TimeoutClass::T30s => 30_000_000,
            TimeoutClass::T100s => 100_000_000,
            TimeoutClass::T300s => 300_000_000,
            TimeoutClass::T1000s => 1_000_000_000,
        };
        Some(Duration::from_micros(micros))
    }

    /// Smallest class that is at least `duration`
    pub fn at_least(duration: Duration) -> Self {
        Self::ALL[1..]
            .iter()
            .copied()
            .find(|class| class.duration().is_some_and(|d| d >= duration))
            .unwrap_or(TimeoutClass::T1000s)
    }
}

impl fmt::Display for TimeoutClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.duration() {
            None => write!(f, "none"),
            Some(d) if d < Duration::from_millis(1) => write!(f, "{}us", d.as_micros()),
            Some(d) if d < Duration::from_secs(1) => write!(f, "{}ms", d.as_millis()),
            Some(d) => write!(f, "{}s", d.as_secs()),
        }
    }
}

/// Which descriptor a timeout applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimeoutTarget {
    /// Bus controller (board); governs service-request waits
    Controller,
    /// Addressed instrument; governs data transfers
    Device,
}

impl fmt::Display for TimeoutTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeoutTarget::Controller => write!(f, "controller"),
            TimeoutTarget::Device => write!(f, "device"),
        }
    }
}

/// How a timeout change interacts with the saved timeout record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutPurpose {
    /// Change the value, leave the saved record alone
    Set,
    /// Record the current value, then change it
    SaveAndSet,
    /// Put back the recorded value
    Restore,
}

/// Result of every blocking bus primitive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Outcome {
    Ok,
    Error,
    Timeout,
    Aborted,
    /// Refused because the connection already carried an error bit
    PreviousError,
}

impl Outcome {
    pub fn is_ok(self) -> bool {
        self == Outcome::Ok
    }

    /// Timeouts and aborts end all bus traffic for the current work item
    pub fn halts_item(self) -> bool {
        matches!(self, Outcome::Timeout | Outcome::Aborted)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Outcome::Ok => "ok",
            Outcome::Error => "error",
            Outcome::Timeout => "timeout",
            Outcome::Aborted => "aborted",
            Outcome::PreviousError => "previous error",
        };
        f.write_str(s)
    }
}

/// Physical access method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    /// IEEE-488 controller card driven through the system GPIB library
    NativeBus,
    /// USB test-and-measurement class device
    UsbClass,
    /// Serial-to-GPIB relay adapter (Prologix style)
    SerialRelay,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::NativeBus => write!(f, "native bus"),
            TransportKind::UsbClass => write!(f, "USB class device"),
            TransportKind::SerialRelay => write!(f, "serial relay"),
        }
    }
}

/// How to reach the instrument
///
/// With `use_named` set, `name` is resolved through the identity lookup table
/// (or the native library's own configuration). Otherwise the explicit
/// `controller_index` / `device_address` pair is used.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportConfig {
    pub kind: TransportKind,
    #[serde(default)]
    pub use_named: bool,
    #[serde(default)]
    pub name: Option<String>,
    /// Board index, nth USB class device, or unused for serial relays
    #[serde(default)]
    pub controller_index: u32,
    /// Primary bus address of the instrument (0-30)
    #[serde(default = "TransportConfig::default_address")]
    pub device_address: u8,
    /// Serial device path for the relay adapter
    #[serde(default)]
    pub serial_port: Option<String>,
    #[serde(default = "TransportConfig::default_baud")]
    pub baud_rate: u32,
    /// USB vendor id filter
    #[serde(default)]
    pub usb_vendor_id: Option<u16>,
    /// USB product id filter
    #[serde(default)]
    pub usb_product_id: Option<u16>,
}

impl TransportConfig {
    fn default_address() -> u8 {
        16
    }

    fn default_baud() -> u32 {
        115_200
    }

    /// Explicitly addressed configuration for `kind`
    pub fn numeric(kind: TransportKind, controller_index: u32, device_address: u8) -> Self {
        Self {
            kind,
            use_named: false,
            name: None,
            controller_index,
            device_address,
            serial_port: None,
            baud_rate: Self::default_baud(),
            usb_vendor_id: None,
            usb_product_id: None,
        }
    }

    /// Named configuration for `kind`
    pub fn named(kind: TransportKind, name: impl Into<String>) -> Self {
        Self {
            use_named: true,
            name: Some(name.into()),
            ..Self::numeric(kind, 0, Self::default_address())
        }
    }

    /// Human readable address for logs and notifications
    pub fn describe(&self) -> String {
        match (&self.name, self.use_named) {
            (Some(name), true) => format!("{} '{}'", self.kind, name),
            _ => format!(
                "{} controller {} address {}",
                self.kind, self.controller_index, self.device_address
            ),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::numeric(TransportKind::NativeBus, 0, Self::default_address())
    }
}

/// Instrument identity parsed from the identification string
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FirmwareInfo {
    pub manufacturer: String,
    pub model: String,
    pub revision: f32,
}

impl FirmwareInfo {
    /// Parse `MANUFACTURER,MODEL,SERIAL,REVISION`
    pub fn parse(reply: &str) -> Option<Self> {
        let fields: Vec<&str> = reply.trim().split(',').map(str::trim).collect();
        if fields.len() < 4 {
            return None;
        }
        let revision = fields[3].parse::<f32>().ok()?;
        Some(Self {
            manufacturer: fields[0].to_string(),
            model: fields[1].to_string(),
            revision,
        })
    }
}

/// One complex measurement point
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TracePoint {
    pub re: f64,
    pub im: f64,
}

impl TracePoint {
    pub fn magnitude(&self) -> f64 {
        self.re.hypot(self.im)
    }
}

/// Formatted trace of one display channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trace {
    pub channel: u8,
    pub start_hz: f64,
    pub stop_hz: f64,
    pub points: Vec<TracePoint>,
}

/// Scattering parameters measured by the multi-port sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SParameter {
    S11,
    S21,
    S12,
    S22,
}

impl SParameter {
    pub const ALL: [SParameter; 4] = [
        SParameter::S11,
        SParameter::S21,
        SParameter::S12,
        SParameter::S22,
    ];

    pub fn mnemonic(self) -> &'static str {
        match self {
            SParameter::S11 => "S11",
            SParameter::S21 => "S21",
            SParameter::S12 => "S12",
            SParameter::S22 => "S22",
        }
    }
}

/// Raw data of one S-parameter sweep
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SParameterTrace {
    pub parameter: SParameter,
    pub points: Vec<TracePoint>,
}

/// All four S-parameters over a common stimulus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiPortData {
    pub start_hz: f64,
    pub stop_hz: f64,
    pub traces: Vec<SParameterTrace>,
}

/// Active calibration type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CalType {
    None,
    Response,
    ResponseIsolation,
    S11OnePort,
    S22OnePort,
    FullTwoPort,
    OnePathTwoPort,
    Trl,
}

impl CalType {
    const TABLE: [(CalType, &'static str, usize); 8] = [
        (CalType::None, "CALN", 0),
        (CalType::Response, "CALIRESP", 1),
        (CalType::ResponseIsolation, "CALIRAI", 2),
        (CalType::S11OnePort, "CALIS111", 3),
        (CalType::S22OnePort, "CALIS221", 3),
        (CalType::FullTwoPort, "CALIFUL2", 12),
        (CalType::OnePathTwoPort, "CALIONE2", 12),
        (CalType::Trl, "CALITRL2", 12),
    ];

    /// Mnemonic that selects this calibration type
    pub fn mnemonic(self) -> &'static str {
        Self::TABLE
            .iter()
            .find(|(cal, _, _)| *cal == self)
            .map(|(_, m, _)| *m)
            .unwrap_or("CALN")
    }

    /// Number of error-coefficient arrays held by this calibration
    pub fn array_count(self) -> usize {
        Self::TABLE
            .iter()
            .find(|(cal, _, _)| *cal == self)
            .map(|(_, _, n)| *n)
            .unwrap_or(0)
    }

    /// Parse the calibration query reply (quotes and whitespace tolerated)
    pub fn from_mnemonic(reply: &str) -> Option<Self> {
        let cleaned = reply.trim().trim_matches('"').trim().to_ascii_uppercase();
        Self::TABLE
            .iter()
            .find(|(_, m, _)| *m == cleaned)
            .map(|(cal, _, _)| *cal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_flags() {
        let mut status = BusStatus::CMPL;
        assert!(status.is_complete());
        assert!(!status.is_error());

        status.insert(BusStatus::ERR);
        assert!(status.is_error());
        status.remove(BusStatus::ERR);
        assert!(!status.is_error());

        assert!(BusStatus::END.is_complete());
        assert!(!BusStatus::TIMO.is_complete());
    }

    #[test]
    fn test_status_display() {
        assert_eq!(BusStatus::empty().to_string(), "0x0000");
        assert_eq!(
            (BusStatus::ERR | BusStatus::TIMO).to_string(),
            "0xc000 ERR|TIMO"
        );
    }

    #[test]
    fn test_timeout_codes_match_register() {
        for (code, class) in TimeoutClass::ALL.iter().enumerate() {
            assert_eq!(class.code() as usize, code);
            assert_eq!(TimeoutClass::from_code(code as u8), Some(*class));
        }
        assert_eq!(TimeoutClass::from_code(18), None);
        assert_eq!(TimeoutClass::T30ms.code(), 8);
        assert_eq!(TimeoutClass::T3s.code(), 12);
    }

    #[test]
    fn test_timeout_at_least() {
        assert_eq!(
            TimeoutClass::at_least(Duration::from_millis(30)),
            TimeoutClass::T30ms
        );
        assert_eq!(
            TimeoutClass::at_least(Duration::from_millis(31)),
            TimeoutClass::T100ms
        );
        assert_eq!(
            TimeoutClass::at_least(Duration::from_secs(5000)),
            TimeoutClass::T1000s
        );
        assert_eq!(TimeoutClass::None.duration(), None);
    }

    #[test]
    fn test_timeout_display() {
        assert_eq!(TimeoutClass::None.to_string(), "none");
        assert_eq!(TimeoutClass::T30us.to_string(), "30us");
        assert_eq!(TimeoutClass::T30ms.to_string(), "30ms");
        assert_eq!(TimeoutClass::T3s.to_string(), "3s");
    }

    #[test]
    fn test_firmware_parse() {
        let info = FirmwareInfo::parse("HEWLETT PACKARD,8753D,0,6.14\n").unwrap();
        assert_eq!(info.model, "8753D");
        assert!((info.revision - 6.14).abs() < 1e-6);
        assert!(FirmwareInfo::parse("garbage").is_none());
    }

    #[test]
    fn test_cal_type_table() {
        assert_eq!(CalType::from_mnemonic("\"CALIFUL2\"\n"), Some(CalType::FullTwoPort));
        assert_eq!(CalType::FullTwoPort.array_count(), 12);
        assert_eq!(CalType::S11OnePort.array_count(), 3);
        assert_eq!(CalType::None.array_count(), 0);
        assert_eq!(CalType::Response.mnemonic(), "CALIRESP");
        assert_eq!(CalType::from_mnemonic("CALXYZ"), None);
    }

    #[test]
    fn test_transport_config_describe() {
        let named = TransportConfig::named(TransportKind::NativeBus, "hp8753");
        assert!(named.describe().contains("'hp8753'"));

        let numeric = TransportConfig::numeric(TransportKind::SerialRelay, 0, 16);
        assert!(numeric.describe().contains("address 16"));
    }
}
