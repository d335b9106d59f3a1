//! Core types for the CAN link library
//!
//! This module defines the runtime value objects that flow between the client
//! and its consumers (decoded messages and signals), plus the error taxonomy
//! shared by every fallible operation in the crate.

use crate::signals::dbc::DbcParseError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Result type for CAN operations
pub type Result<T> = std::result::Result<T, CanError>;

/// Category of a failure, independent of where it was raised
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Timeout,
    CommunicationError,
    SensorFailure,
    ErrorCreatingDevice,
    ErrorOpeningDevice,
    AlreadyClosed,
    AlreadyOpen,
    InvalidParameter,
    ErrorSettingSocketIsoTpOptions,
    SensorNotFound,
    SensorNotInitialized,
    SensorNotOpened,
    InvalidData,
    SchemaNotFound,
    /// Unspecified failure
    Other,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ErrorKind::Timeout => "Timeout Error",
            ErrorKind::CommunicationError => "Communication Error",
            ErrorKind::SensorFailure => "Sensor Failure",
            ErrorKind::ErrorCreatingDevice => "Error Creating Device",
            ErrorKind::ErrorOpeningDevice => "Error Opening Device",
            ErrorKind::AlreadyClosed => "Already Closed",
            ErrorKind::AlreadyOpen => "Already Open",
            ErrorKind::InvalidParameter => "Invalid Parameter",
            ErrorKind::ErrorSettingSocketIsoTpOptions => "Error Setting SOCKET ISO-TP Options",
            ErrorKind::SensorNotFound => "Sensor Not Found",
            ErrorKind::SensorNotInitialized => "Sensor Not Initialized",
            ErrorKind::SensorNotOpened => "Sensor Not Opened",
            ErrorKind::InvalidData => "Invalid Data",
            ErrorKind::SchemaNotFound => "Schema Not Found",
            ErrorKind::Other => "Unknown Error",
        };
        f.write_str(text)
    }
}

fn errno_suffix(errno: &Option<i32>) -> String {
    match errno {
        Some(code) => format!(
            " (errno: {} - {})",
            code,
            std::io::Error::from_raw_os_error(*code)
        ),
        None => String::new(),
    }
}

/// Errors that can occur while talking to the bus or building schemas
#[derive(Debug, thiserror::Error)]
pub enum CanError {
    #[error("{kind}: {message}{}", errno_suffix(.errno))]
    Os {
        kind: ErrorKind,
        message: String,
        errno: Option<i32>,
    },

    #[error("Timed out after {timeout:?} waiting for CAN address 0x{address:X}")]
    Timeout { address: u32, timeout: Duration },

    #[error("Message schema not found: {0}")]
    SchemaNotFound(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Device already closed")]
    AlreadyClosed,

    #[error("Failed to disable ECU after {attempts} attempts")]
    DisableEcuFailed { attempts: u32 },

    #[error("Failed to initialise CAN device on {interface}: {source}")]
    DeviceInit {
        interface: String,
        #[source]
        source: Box<CanError>,
    },

    #[error("Failed to parse DBC: {0}")]
    DbcParse(#[from] DbcParseError),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CanError {
    /// Build an OS-level error from `errno` as reported by the last syscall
    pub fn last_os_error(kind: ErrorKind) -> Self {
        let err = std::io::Error::last_os_error();
        CanError::Os {
            kind,
            message: err.to_string(),
            errno: err.raw_os_error(),
        }
    }

    pub fn os(kind: ErrorKind, message: impl Into<String>) -> Self {
        CanError::Os {
            kind,
            message: message.into(),
            errno: None,
        }
    }

    /// Category of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            CanError::Os { kind, .. } => *kind,
            CanError::Timeout { .. } => ErrorKind::Timeout,
            CanError::SchemaNotFound(_) => ErrorKind::SchemaNotFound,
            CanError::InvalidData(_) => ErrorKind::InvalidData,
            CanError::InvalidParameter(_) => ErrorKind::InvalidParameter,
            CanError::AlreadyClosed => ErrorKind::AlreadyClosed,
            CanError::DisableEcuFailed { .. } => ErrorKind::Other,
            CanError::DeviceInit { source, .. } => source.kind(),
            CanError::DbcParse(_) => ErrorKind::InvalidData,
            CanError::Config(_) => ErrorKind::InvalidParameter,
            CanError::Io(_) => ErrorKind::CommunicationError,
        }
    }

    /// OS error number, when the failure came from a syscall
    pub fn errno(&self) -> Option<i32> {
        match self {
            CanError::Os { errno, .. } => *errno,
            CanError::DeviceInit { source, .. } => source.errno(),
            CanError::Io(err) => err.raw_os_error(),
            _ => None,
        }
    }

    /// True when a non-blocking read found no data
    pub fn is_would_block(&self) -> bool {
        matches!(self.errno(), Some(code) if code == libc::EAGAIN || code == libc::EWOULDBLOCK)
    }
}

/// Failure of `CanClient::send_message`
///
/// When the payload was packed before the failure it is handed back for
/// diagnostics.
#[derive(Debug, thiserror::Error)]
#[error("{source}")]
pub struct SendError {
    #[source]
    pub source: CanError,
    pub payload: Option<Vec<u8>>,
}

impl SendError {
    pub fn kind(&self) -> ErrorKind {
        self.source.kind()
    }
}

/// Physical bus a message travels on
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CanBus {
    #[default]
    Main,
    Alt,
    Camera,
}

impl fmt::Display for CanBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CanBus::Main => write!(f, "main"),
            CanBus::Alt => write!(f, "alt"),
            CanBus::Camera => write!(f, "camera"),
        }
    }
}

/// A decoded (or about to be encoded) signal value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    /// Signal name from the DBC
    pub name: String,
    /// Physical value (after factor and offset)
    pub value: f64,
    /// Monotonic capture time in nanoseconds
    pub timestamp_ns: u64,
    /// Byte order copied from the schema
    pub little_endian: bool,
}

impl Signal {
    pub fn new(name: impl Into<String>, value: f64, timestamp_ns: u64, little_endian: bool) -> Self {
        Self {
            name: name.into(),
            value,
            timestamp_ns,
            little_endian,
        }
    }
}

/// Runtime representation of one CAN message and its signals
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// CAN address (identifier without flag bits)
    pub address: u32,
    /// Message name from the DBC
    pub name: String,
    pub bus: CanBus,
    /// Signals in schema order
    pub signals: Vec<Signal>,
    /// Raw payload as received (receive path only)
    #[serde(default, skip_serializing_if = "Option::is_none", with = "hex_payload")]
    pub raw_data: Option<Vec<u8>>,
}

impl Message {
    pub fn new(address: u32, name: impl Into<String>) -> Self {
        Self {
            address,
            name: name.into(),
            ..Default::default()
        }
    }

    /// Builder method: set the bus
    pub fn on_bus(mut self, bus: CanBus) -> Self {
        self.bus = bus;
        self
    }

    /// Builder method: append a signal
    pub fn with_signal(mut self, signal: Signal) -> Self {
        self.signals.push(signal);
        self
    }

    /// Find a signal by name
    pub fn signal(&self, name: &str) -> Option<&Signal> {
        self.signals.iter().find(|s| s.name == name)
    }

    /// Value of a signal by name
    pub fn value(&self, name: &str) -> Option<f64> {
        self.signal(name).map(|s| s.value)
    }
}

mod hex_payload {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match data {
            Some(bytes) => s.serialize_str(&hex::encode(bytes)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        let text: Option<String> = Option::deserialize(d)?;
        text.map(|t| hex::decode(t).map_err(serde::de::Error::custom))
            .transpose()
    }
}

/// Current monotonic time in nanoseconds
pub fn monotonic_now_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `ts` is a valid, writable timespec.
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    if rc != 0 {
        return 0;
    }
    (ts.tv_sec as u64) * 1_000_000_000 + ts.tv_nsec as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_mapping() {
        let err = CanError::SchemaNotFound("Steering".to_string());
        assert_eq!(err.kind(), ErrorKind::SchemaNotFound);
        assert_eq!(err.errno(), None);

        let err = CanError::Os {
            kind: ErrorKind::CommunicationError,
            message: "read failed".to_string(),
            errno: Some(libc::EAGAIN),
        };
        assert!(err.is_would_block());
        assert!(err.to_string().starts_with("Communication Error: read failed (errno:"));

        let wrapped = CanError::DeviceInit {
            interface: "vcan0".to_string(),
            source: Box::new(err),
        };
        assert_eq!(wrapped.kind(), ErrorKind::CommunicationError);
        assert_eq!(wrapped.errno(), Some(libc::EAGAIN));
    }

    #[test]
    fn test_message_lookup() {
        let msg = Message::new(0x122, "ES_LKAS")
            .on_bus(CanBus::Camera)
            .with_signal(Signal::new("COUNTER", 3.0, 10, true))
            .with_signal(Signal::new("LKAS_Output", -120.0, 10, true));

        assert_eq!(msg.value("COUNTER"), Some(3.0));
        assert_eq!(msg.value("LKAS_Output"), Some(-120.0));
        assert!(msg.signal("CHECKSUM").is_none());
        assert_eq!(msg.bus.to_string(), "camera");
    }

    #[test]
    fn test_monotonic_clock_advances() {
        let a = monotonic_now_ns();
        let b = monotonic_now_ns();
        assert!(b >= a);
        assert!(a > 0);
    }
}
