//! CAN Link Library
//!
//! DBC signal codec and SocketCAN send/receive client.
//!
//! # Architecture
//!
//! - `signals` parses DBC text into read-only message and signal schemas and
//!   packs/unpacks signal values in little- and big-endian layouts
//! - `frame` models a CAN/CAN FD frame and its Linux wire layout
//! - `transport` wraps the socket syscalls behind `SocketOps`, with a libc
//!   implementation and a scripted mock
//! - `device` opens raw or ISO-TP sockets on top of `SocketOps`
//! - `client` decodes received frames into `Message`s and encodes outgoing
//!   ones, keeping rolling counters and checksums
//! - `limits` holds steering torque limits for controllers built on top
//!
//! The library does NOT:
//! - Run event loops or schedule periodic sends
//! - Track signal value changes between frames
//! - Implement ISO-TP state machines beyond disabling the EyeSight ECU
//!
//! # Example Usage
//!
//! ```no_run
//! use can_link::{CanClient, DatabaseConfig, DatabaseSchema, LinuxSocketOps, SocketCanDevice};
//! use std::collections::HashMap;
//! use std::sync::Arc;
//!
//! let database = DatabaseSchema::from_file("subaru_global.dbc", &DatabaseConfig::default()).unwrap();
//! let device = SocketCanDevice::open("can0", Arc::new(LinuxSocketOps::new())).unwrap();
//! let client = CanClient::new(device, Arc::new(database));
//!
//! // Send a command; COUNTER and CHECKSUM are filled in
//! let values = HashMap::from([("LKAS_Output".to_string(), -120.0)]);
//! if let Some(message) = client.create_message("ES_LKAS", &values) {
//!     let payload = client.send_message(&message).unwrap();
//!     println!("sent {}", hex::encode(payload));
//! }
//!
//! // Poll and drain decoded traffic
//! client.enqueue_messages();
//! for message in client.get_queued_messages_and_clear_queue() {
//!     println!("{} {:?}", message.name, message.signals);
//! }
//! ```

// Public modules
pub mod client;
pub mod config;
pub mod device;
pub mod diagnostics;
pub mod frame;
pub mod limits;
pub mod signals;
pub mod transport;
pub mod types;

// Re-export main types for convenience
pub use client::CanClient;
pub use config::{ClientConfig, DatabaseConfig, DeviceConfig, DeviceMode, SignalConvention};
pub use device::{FrameTransport, SocketCanDevice};
pub use frame::{Frame, WireMessage};
pub use limits::{SignalRateCalculator, SteeringLimits};
pub use signals::{
    buffer_size_to_data_length_code, subaru_checksum, ChecksumFn, DatabaseSchema, DatabaseStats,
    DbcErrorKind, DbcParseError, MessageSchema, SignalRole, SignalSchema,
};
pub use transport::{LinuxSocketOps, MockSocketOps, SocketOps};
pub use types::{CanBus, CanError, ErrorKind, Message, Result, SendError, Signal};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
