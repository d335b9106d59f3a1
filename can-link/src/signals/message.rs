//! Message schema: one `BO_` block and its signals

use crate::signals::schema::{SignalRole, SignalSchema};
use crate::types::{CanError, Message, Result};
use std::collections::HashMap;

/// Immutable description of a CAN message
///
/// The ordered signal list and the name index are built together and never
/// change afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageSchema {
    name: String,
    address: u32,
    size: u32,
    transmitter: Option<String>,
    signals: Vec<SignalSchema>,
    index: HashMap<String, usize>,
}

impl MessageSchema {
    /// Freeze a message from its signals, rejecting duplicate signal names
    pub fn new(
        name: impl Into<String>,
        address: u32,
        size: u32,
        transmitter: Option<String>,
        signals: Vec<SignalSchema>,
    ) -> Result<Self> {
        let name = name.into();
        let mut index = HashMap::with_capacity(signals.len());
        for (position, signal) in signals.iter().enumerate() {
            if index.insert(signal.name.clone(), position).is_some() {
                return Err(CanError::InvalidParameter(format!(
                    "duplicate signal {} in message {}",
                    signal.name, name
                )));
            }
        }
        Ok(Self {
            name,
            address,
            size,
            transmitter,
            signals,
            index,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> u32 {
        self.address
    }

    /// Payload length in bytes
    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn transmitter(&self) -> Option<&str> {
        self.transmitter.as_deref()
    }

    /// Signals in DBC order
    pub fn signals(&self) -> &[SignalSchema] {
        &self.signals
    }

    pub fn signal_schema_by_name(&self, name: &str) -> Option<&SignalSchema> {
        self.index.get(name).map(|&i| &self.signals[i])
    }

    /// First signal with the COUNTER role
    pub fn counter_signal(&self) -> Option<&SignalSchema> {
        self.signal_by_role(SignalRole::Counter)
    }

    /// First signal with the CHECKSUM role
    pub fn checksum_signal(&self) -> Option<&SignalSchema> {
        self.signal_by_role(SignalRole::Checksum)
    }

    fn signal_by_role(&self, role: SignalRole) -> Option<&SignalSchema> {
        self.signals.iter().find(|s| s.role == role)
    }

    /// Build a message value from physical values keyed by signal name
    ///
    /// Signals appear in schema order; schema signals missing from `values`
    /// and map entries that name no signal are both skipped.
    pub fn create_message(&self, values: &HashMap<String, f64>) -> Message {
        let mut message = Message::new(self.address, self.name.clone());
        for schema in &self.signals {
            if let Some(&value) = values.get(&schema.name) {
                message.signals.push(schema.create_signal(value));
            }
        }
        message
    }
}
