//! Schema-aware CAN client
//!
//! `CanClient` sits between a `FrameTransport` and a `DatabaseSchema`. On the
//! receive side it turns frames into decoded `Message`s and keeps them, along
//! with the raw frames, in FIFO queues. On the send side it packs a `Message`
//! into a payload, maintains rolling counters per address and stamps the
//! checksum before writing.

use crate::config::ClientConfig;
use crate::device::FrameTransport;
use crate::frame::WireMessage;
use crate::signals::database::{
    buffer_size_to_data_length_code, DatabaseSchema, INVALID_DATA_LENGTH_CODE,
};
use crate::signals::message::MessageSchema;
use crate::signals::schema::{subaru_checksum, ChecksumFn, SignalSchema};
use crate::types::{monotonic_now_ns, CanError, Message, Result, SendError, Signal};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Name of the rolling counter filled in when no COUNTER signal exists
const FALLBACK_COUNTER_NAME: &str = "COUNT";

struct ClientState<M> {
    messages: Vec<Message>,
    raw: Vec<M>,
    /// Next counter value to send, per address
    tx_counters: HashMap<u32, u64>,
    /// Last counter value received, per address
    rx_counters: HashMap<u32, u64>,
}

impl<M> Default for ClientState<M> {
    fn default() -> Self {
        Self {
            messages: Vec::new(),
            raw: Vec::new(),
            tx_counters: HashMap::new(),
            rx_counters: HashMap::new(),
        }
    }
}

/// Send/receive client bound to one device and one signal database
///
/// All methods take `&self`; share the client through an `Arc` to poll from
/// one thread and send from another.
pub struct CanClient<D: FrameTransport> {
    database: Arc<DatabaseSchema>,
    device: D,
    config: ClientConfig,
    checksum: ChecksumFn,
    state: Mutex<ClientState<D::Message>>,
}

impl<D: FrameTransport> CanClient<D> {
    pub fn new(device: D, database: Arc<DatabaseSchema>) -> Self {
        Self::with_config(device, database, ClientConfig::default())
    }

    pub fn with_config(device: D, database: Arc<DatabaseSchema>, config: ClientConfig) -> Self {
        log::debug!(
            "CAN client initialised with {} message schemas",
            database.len()
        );
        Self {
            database,
            device,
            config,
            checksum: subaru_checksum,
            state: Mutex::new(ClientState::default()),
        }
    }

    /// Builder method: replace the checksum algorithm
    pub fn with_checksum_fn(mut self, checksum: ChecksumFn) -> Self {
        self.checksum = checksum;
        self
    }

    pub fn database(&self) -> &Arc<DatabaseSchema> {
        &self.database
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Poll the device once and queue whatever arrived
    ///
    /// Every received frame lands in the raw queue. Frames with a known
    /// address are also decoded and queued as a `Message`. Read failures,
    /// including an empty socket, queue nothing. Returns whether a frame was
    /// read.
    pub fn enqueue_messages(&self) -> bool {
        let frame = match self.device.receive() {
            Ok(frame) => frame,
            Err(e) => {
                if e.is_would_block() {
                    log::trace!("No frame pending");
                } else {
                    log::debug!("Receive failed: {}", e);
                }
                return false;
            }
        };

        let address = frame.address();
        let message = self
            .database
            .message_by_address(address)
            .map(|schema| self.decode(schema, frame.data()));

        let mut state = self.state.lock();
        if let Some(message) = message {
            state.messages.push(message);
            log::debug!("Enqueued CAN message with address: {}", address);
        }
        state.raw.push(frame);
        true
    }

    /// Take every decoded message queued so far, oldest first
    pub fn get_queued_messages_and_clear_queue(&self) -> Vec<Message> {
        let messages = std::mem::take(&mut self.state.lock().messages);
        log::debug!("Retrieved and cleared {} queued CAN messages", messages.len());
        messages
    }

    /// Take every raw frame queued so far, oldest first
    pub fn get_raw_data_and_clear_queue(&self) -> Vec<D::Message> {
        let raw = std::mem::take(&mut self.state.lock().raw);
        log::debug!("Retrieved and cleared {} queued raw CAN frames", raw.len());
        raw
    }

    /// Pack `message` with its schema and write it
    ///
    /// The schema is found by `message.name`. Signals the schema does not
    /// know are skipped. The counter signal is COUNTER, or COUNT when the
    /// schema has no COUNTER. If the caller supplies it, the rolling counter
    /// for the address is set to the supplied value; otherwise the next
    /// counter value is filled in. The checksum is computed last over the
    /// packed payload. On success, and on a failed write, the payload is
    /// returned.
    pub fn send_message(&self, message: &Message) -> std::result::Result<Vec<u8>, SendError> {
        let schema = self.database.message_by_name(&message.name).ok_or_else(|| {
            log::error!("Message schema for name: {} not found", message.name);
            SendError {
                source: CanError::SchemaNotFound(message.name.clone()),
                payload: None,
            }
        })?;

        let address = schema.address();
        let mut payload = vec![0u8; schema.size() as usize];
        self.pack_signals(schema, message, &mut payload);

        if let Some(checksum_signal) = schema.checksum_signal() {
            let checksum = (self.checksum)(address, &payload);
            checksum_signal.pack_value(&mut payload, i64::from(checksum));
        }

        if buffer_size_to_data_length_code(payload.len()) == INVALID_DATA_LENGTH_CODE {
            return Err(SendError {
                source: CanError::InvalidData(format!(
                    "{} has a payload of {} bytes, which has no data length code",
                    schema.name(),
                    payload.len()
                )),
                payload: Some(payload),
            });
        }

        let result = D::Message::from_parts(address, &payload).and_then(|frame| self.device.send(&frame));
        if let Err(source) = result {
            log::error!("Failed to send CAN message with address: {}: {}", address, source);
            return Err(SendError {
                source,
                payload: Some(payload),
            });
        }

        log::debug!(
            "Sent CAN message {} (0x{:X}): {}",
            schema.name(),
            address,
            hex::encode(&payload)
        );
        Ok(payload)
    }

    /// Write `data` to `address` without consulting the database
    pub fn send_raw_message(&self, address: u32, data: &[u8]) -> Result<()> {
        let frame = D::Message::from_parts(address, data)?;
        self.device.send(&frame)
    }

    /// Build a `Message` for the schema named `name`
    pub fn create_message(&self, name: &str, values: &HashMap<String, f64>) -> Option<Message> {
        self.database
            .message_by_name(name)
            .map(|schema| schema.create_message(values).on_bus(self.config.bus))
    }

    /// Block until a frame for `address` arrives or `timeout` elapses
    ///
    /// Frames for other addresses are read and discarded.
    pub fn listen_for_message_by_address(&self, address: u32, timeout: Duration) -> Result<D::Message> {
        let start = Instant::now();
        let poll_interval = self.config.listen_poll_interval();
        loop {
            match self.device.receive() {
                Ok(frame) if frame.address() == address => return Ok(frame),
                Ok(_) => {}
                Err(e) if e.is_would_block() => {}
                Err(e) => log::debug!("Receive failed while listening for 0x{:X}: {}", address, e),
            }

            thread::sleep(poll_interval);
            if start.elapsed() > timeout {
                log::warn!("Timed out waiting for CAN address 0x{:X}", address);
                return Err(CanError::Timeout { address, timeout });
            }
        }
    }

    fn decode(&self, schema: &MessageSchema, data: &[u8]) -> Message {
        let address = schema.address();
        let timestamp = monotonic_now_ns();
        let mut message = Message::new(address, schema.name()).on_bus(self.config.bus);
        message.raw_data = Some(data.to_vec());

        for signal in schema.signals() {
            let raw = signal.parse_value(data);

            let checksum_failed = self.config.validate_checksum
                && signal.is_checksum()
                && i64::from((self.checksum)(address, data)) != raw;
            let counter_failed = self.config.validate_counter
                && signal.is_counter()
                && !counter_advanced(&mut self.state.lock().rx_counters, address, signal, raw);

            if checksum_failed || counter_failed {
                log::warn!(
                    "Message checks failed for address: {} checksum_failed: {} counter_failed: {}",
                    address,
                    checksum_failed,
                    counter_failed
                );
                continue;
            }

            message.signals.push(Signal::new(
                signal.name.clone(),
                signal.to_physical(raw),
                timestamp,
                signal.little_endian,
            ));
        }
        message
    }

    fn pack_signals(&self, schema: &MessageSchema, message: &Message, payload: &mut [u8]) {
        let counter = schema
            .counter_signal()
            .or_else(|| schema.signal_schema_by_name(FALLBACK_COUNTER_NAME));
        let address = schema.address();
        let mut supplied_counter = None;

        for signal in &message.signals {
            let Some(signal_schema) = schema.signal_schema_by_name(&signal.name) else {
                log::debug!("{} has no signal {}, skipping", schema.name(), signal.name);
                continue;
            };
            let raw = signal_schema.to_raw(signal.value);
            signal_schema.pack_value(payload, raw);

            if counter.is_some_and(|c| c.name == signal_schema.name) {
                supplied_counter = Some(raw as u64 % signal_schema.modulus());
            }
        }

        let Some(counter) = counter else {
            return;
        };
        // Caller-driven counters become the state for later auto-filled sends
        if let Some(value) = supplied_counter {
            self.state.lock().tx_counters.insert(address, value);
            return;
        }

        let value = {
            let mut state = self.state.lock();
            let slot = state.tx_counters.entry(address).or_insert(0);
            let value = *slot;
            *slot = value.wrapping_add(1) % counter.modulus();
            value
        };
        counter.pack_value(payload, value as i64);
    }
}

/// Record `raw` as the latest counter for `address` and report whether it
/// follows the previous one
fn counter_advanced(
    rx_counters: &mut HashMap<u32, u64>,
    address: u32,
    signal: &SignalSchema,
    raw: i64,
) -> bool {
    let current = raw as u64;
    match rx_counters.insert(address, current) {
        Some(previous) => previous.wrapping_add(1) % signal.modulus() == current,
        None => true,
    }
}
