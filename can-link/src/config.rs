//! Configuration types
//!
//! Everything here is plain data with serde derives so that applications can
//! load it from TOML or JSON. Builders (`with_*`) cover programmatic setup.

use crate::diagnostics::{DEFAULT_ISOTP_RX_ID, DEFAULT_ISOTP_TX_ID};
use crate::types::CanBus;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Layout rules a role signal (CHECKSUM or COUNTER) must satisfy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalConvention {
    /// Required width in bits, `None` accepts any width
    #[serde(default)]
    pub size: Option<u32>,

    /// Start bit must sit on a byte boundary
    #[serde(default)]
    pub byte_aligned: bool,

    /// Required byte order, `None` accepts either
    #[serde(default)]
    pub little_endian: Option<bool>,
}

impl SignalConvention {
    /// Subaru-style checksum: one little-endian byte on a byte boundary
    pub fn checksum() -> Self {
        Self {
            size: Some(8),
            byte_aligned: true,
            little_endian: Some(true),
        }
    }

    /// Subaru-style counter: little-endian, any width or position
    pub fn counter() -> Self {
        Self {
            size: None,
            byte_aligned: false,
            little_endian: Some(true),
        }
    }

    /// Accept any layout
    pub fn any() -> Self {
        Self {
            size: None,
            byte_aligned: false,
            little_endian: None,
        }
    }

    /// Check a signal layout, returning a description of the first violation
    pub fn check(&self, start_bit: u32, size: u32, little_endian: bool) -> Result<(), String> {
        if let Some(expected) = self.size {
            if size != expected {
                return Err(format!("size {} (expected {})", size, expected));
            }
        }
        if self.byte_aligned && start_bit % 8 != 0 {
            return Err(format!("start bit {} is not byte aligned", start_bit));
        }
        if let Some(expected) = self.little_endian {
            if little_endian != expected {
                let order = |le: bool| if le { "little-endian" } else { "big-endian" };
                return Err(format!("{} (expected {})", order(little_endian), order(expected)));
            }
        }
        Ok(())
    }
}

/// Options for building a `DatabaseSchema` from DBC text
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Accept two `BO_` lines with the same name (the higher address wins
    /// in the name index)
    #[serde(default)]
    pub allow_duplicate_message_names: bool,

    #[serde(default = "SignalConvention::checksum")]
    pub checksum: SignalConvention,

    #[serde(default = "SignalConvention::counter")]
    pub counter: SignalConvention,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            allow_duplicate_message_names: false,
            checksum: SignalConvention::checksum(),
            counter: SignalConvention::counter(),
        }
    }
}

impl DatabaseConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder method: allow duplicate message names
    pub fn with_duplicate_message_names(mut self, allowed: bool) -> Self {
        self.allow_duplicate_message_names = allowed;
        self
    }

    /// Builder method: set the checksum layout convention
    pub fn with_checksum_convention(mut self, convention: SignalConvention) -> Self {
        self.checksum = convention;
        self
    }

    /// Builder method: set the counter layout convention
    pub fn with_counter_convention(mut self, convention: SignalConvention) -> Self {
        self.counter = convention;
        self
    }
}

/// Runtime behavior of `CanClient`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Drop received CHECKSUM signals whose value does not match the payload
    #[serde(default)]
    pub validate_checksum: bool,

    /// Drop received COUNTER signals that do not advance by exactly one
    #[serde(default)]
    pub validate_counter: bool,

    /// Sleep between polls in `listen_for_message_by_address`
    #[serde(default = "default_listen_poll_interval_ms")]
    pub listen_poll_interval_ms: u64,

    /// Bus tag stamped on decoded messages
    #[serde(default)]
    pub bus: CanBus,
}

fn default_listen_poll_interval_ms() -> u64 {
    5
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            validate_checksum: false,
            validate_counter: false,
            listen_poll_interval_ms: default_listen_poll_interval_ms(),
            bus: CanBus::Main,
        }
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder method: enable checksum validation on receive
    pub fn with_checksum_validation(mut self, enabled: bool) -> Self {
        self.validate_checksum = enabled;
        self
    }

    /// Builder method: enable counter validation on receive
    pub fn with_counter_validation(mut self, enabled: bool) -> Self {
        self.validate_counter = enabled;
        self
    }

    /// Builder method: set the listen poll interval
    pub fn with_listen_poll_interval(mut self, interval: Duration) -> Self {
        self.listen_poll_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Builder method: set the bus tag
    pub fn with_bus(mut self, bus: CanBus) -> Self {
        self.bus = bus;
        self
    }

    pub fn listen_poll_interval(&self) -> Duration {
        Duration::from_millis(self.listen_poll_interval_ms)
    }
}

/// Socket flavour opened by `SocketCanDevice`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeviceMode {
    /// `SOCK_RAW` / `CAN_RAW` frame socket
    #[default]
    Raw,
    /// `SOCK_DGRAM` / `CAN_ISOTP` diagnostic socket
    IsoTp { rx_id: u32, tx_id: u32 },
}

impl DeviceMode {
    /// ISO-TP pair used by the EyeSight camera ECU
    pub fn eyesight_isotp() -> Self {
        DeviceMode::IsoTp {
            rx_id: DEFAULT_ISOTP_RX_ID,
            tx_id: DEFAULT_ISOTP_TX_ID,
        }
    }

    pub fn is_isotp(&self) -> bool {
        matches!(self, DeviceMode::IsoTp { .. })
    }
}

/// Options for opening a `SocketCanDevice`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Network interface name, e.g. `can0` or `vcan0`
    #[serde(default = "default_interface")]
    pub interface: String,

    /// Enable CAN FD frames (payloads up to 64 bytes)
    #[serde(default)]
    pub fd_frames: bool,

    #[serde(default)]
    pub mode: DeviceMode,
}

fn default_interface() -> String {
    "can0".to_string()
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            interface: default_interface(),
            fd_frames: false,
            mode: DeviceMode::Raw,
        }
    }
}

impl DeviceConfig {
    pub fn new(interface: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
            ..Default::default()
        }
    }

    /// Builder method: enable CAN FD frames
    pub fn with_fd_frames(mut self, enabled: bool) -> Self {
        self.fd_frames = enabled;
        self
    }

    /// Builder method: set the socket mode
    pub fn with_mode(mut self, mode: DeviceMode) -> Self {
        self.mode = mode;
        self
    }

    /// Largest payload a single write may carry
    pub fn max_payload(&self) -> usize {
        if self.fd_frames {
            crate::frame::CANFD_MAX_DLEN
        } else {
            crate::frame::CAN_MAX_DLEN
        }
    }
}
