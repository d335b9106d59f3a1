//! SocketCAN device
//!
//! `SocketCanDevice` owns one CAN socket opened through a `SocketOps`
//! implementation. In raw mode it exchanges `Frame`s; in ISO-TP mode it
//! carries diagnostic payloads and is used to silence the EyeSight ECU.

use crate::config::{DeviceConfig, DeviceMode};
use crate::diagnostics::{
    SessionResponse, COMMUNICATION_DISABLE_REQUEST, DIAGNOSTIC_SESSION_REQUEST,
    DISABLE_ATTEMPT_DELAY,
};
use crate::frame::{Frame, WireMessage, CANFD_MTU, CAN_MTU};
use crate::transport::{
    CanSocketAddress, IsoTpOptions, SocketOps, CAN_ISOTP, CAN_ISOTP_OPTS, CAN_RAW,
    CAN_RAW_FD_FRAMES, PF_CAN, SOL_CAN_ISOTP, SOL_CAN_RAW,
};
use crate::types::{CanError, ErrorKind, Result};
use parking_lot::Mutex;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Largest ISO-TP payload
const ISOTP_MAX_PAYLOAD: usize = 4095;
/// Sleep between non-blocking reads while waiting for a diagnostic response
const RESPONSE_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Something a `CanClient` can read frames from and write frames to
pub trait FrameTransport: Send + Sync {
    type Message: WireMessage;

    /// One non-blocking read; an empty socket is a would-block error
    fn receive(&self) -> Result<Self::Message>;

    fn send(&self, message: &Self::Message) -> Result<()>;
}

/// A CAN socket bound to one interface
pub struct SocketCanDevice {
    config: DeviceConfig,
    ops: Arc<dyn SocketOps>,
    fd: Mutex<Option<RawFd>>,
}

impl std::fmt::Debug for SocketCanDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketCanDevice")
            .field("config", &self.config)
            .field("fd", &*self.fd.lock())
            .finish()
    }
}

impl SocketCanDevice {
    /// Open a raw classic CAN socket on `interface`
    pub fn open(interface: &str, ops: Arc<dyn SocketOps>) -> Result<Self> {
        Self::open_with_config(DeviceConfig::new(interface), ops)
    }

    pub fn open_with_config(config: DeviceConfig, ops: Arc<dyn SocketOps>) -> Result<Self> {
        log::debug!(
            "Opening CAN device on {} ({:?}, fd_frames: {})",
            config.interface,
            config.mode,
            config.fd_frames
        );

        let fd = match config.mode {
            DeviceMode::Raw => open_raw(ops.as_ref(), &config),
            DeviceMode::IsoTp { rx_id, tx_id } => open_isotp(ops.as_ref(), &config, rx_id, tx_id),
        }
        .map_err(|source| {
            log::error!("Failed to open CAN device on {}: {}", config.interface, source);
            CanError::DeviceInit {
                interface: config.interface.clone(),
                source: Box::new(source),
            }
        })?;

        log::info!("CAN device open on {}", config.interface);
        Ok(Self {
            config,
            ops,
            fd: Mutex::new(Some(fd)),
        })
    }

    pub fn interface(&self) -> &str {
        &self.config.interface
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn is_open(&self) -> bool {
        self.fd.lock().is_some()
    }

    /// Read one frame from a raw socket
    pub fn get_message(&self) -> Result<Frame> {
        self.require_raw()?;
        let mtu = if self.config.fd_frames { CANFD_MTU } else { CAN_MTU };
        let mut buf = vec![0u8; mtu];
        let n = self.read_socket(&mut buf)?;
        let frame = Frame::decode(&buf[..n])?;
        log::trace!("Received {}", frame);
        Ok(frame)
    }

    pub fn send_frame(&self, frame: &Frame) -> Result<()> {
        self.require_raw()?;
        if frame.len() > self.config.max_payload() {
            return Err(CanError::InvalidParameter(format!(
                "payload of {} bytes needs CAN FD frames on {}",
                frame.len(),
                self.config.interface
            )));
        }
        let buf = frame.encode(frame.is_fd())?;
        self.write_socket(&buf)?;
        log::trace!("Sent {}", frame);
        Ok(())
    }

    /// Send `data` to `address` without any schema
    pub fn send_raw(&self, address: u32, data: &[u8]) -> Result<()> {
        self.send_frame(&Frame::new(address, data)?)
    }

    pub fn send_message<M: WireMessage>(&self, message: &M) -> Result<()> {
        self.send_raw(message.address(), message.data())
    }

    /// Put the EyeSight ECU into the extended session and disable its
    /// normal communication
    ///
    /// Each attempt waits `DISABLE_ATTEMPT_DELAY`, sends the session request
    /// and waits up to `timeout` for one response.
    pub fn disable_ecu(&self, retry: u32, timeout: Duration) -> Result<()> {
        let rx_id = match self.config.mode {
            DeviceMode::IsoTp { rx_id, .. } => rx_id,
            DeviceMode::Raw => {
                return Err(CanError::InvalidParameter(
                    "disabling the ECU needs an ISO-TP device".to_string(),
                ))
            }
        };

        let mut response = vec![0u8; ISOTP_MAX_PAYLOAD];
        for attempt in 1..=retry {
            thread::sleep(DISABLE_ATTEMPT_DELAY);

            if let Err(e) = self.write_socket(&DIAGNOSTIC_SESSION_REQUEST) {
                log::error!("Diagnostic session request failed (attempt {}/{}): {}", attempt, retry, e);
                continue;
            }

            let n = match self.read_response(&mut response, rx_id, timeout) {
                Ok(n) => n,
                Err(e) => {
                    log::warn!("No diagnostic session response (attempt {}/{}): {}", attempt, retry, e);
                    continue;
                }
            };

            match SessionResponse::classify(&response[..n]) {
                SessionResponse::Positive => {
                    log::debug!("Extended diagnostic session established");
                    self.write_socket(&COMMUNICATION_DISABLE_REQUEST)?;
                    log::info!("ECU communication disabled on {}", self.config.interface);
                    return Ok(());
                }
                SessionResponse::Pending => {
                    log::debug!("ECU response pending (attempt {}/{})", attempt, retry);
                }
                SessionResponse::Unexpected(bytes) => {
                    log::warn!(
                        "Unexpected diagnostic response {} (attempt {}/{})",
                        hex::encode(&bytes),
                        attempt,
                        retry
                    );
                }
            }
        }

        log::error!("Failed to disable ECU after {} attempts", retry);
        Err(CanError::DisableEcuFailed { attempts: retry })
    }

    /// Close the socket; a second call reports `AlreadyClosed`
    pub fn close(&self) -> Result<()> {
        let fd = self.fd.lock().take().ok_or(CanError::AlreadyClosed)?;
        self.ops.close(fd)?;
        log::debug!("Closed CAN device on {}", self.config.interface);
        Ok(())
    }

    fn require_raw(&self) -> Result<()> {
        if self.config.mode.is_isotp() {
            return Err(CanError::InvalidParameter(format!(
                "{} is an ISO-TP device",
                self.config.interface
            )));
        }
        Ok(())
    }

    fn current_fd(&self) -> Result<RawFd> {
        let fd = *self.fd.lock();
        fd.ok_or_else(|| CanError::os(ErrorKind::SensorNotOpened, "CAN device is closed"))
    }

    fn read_socket(&self, buf: &mut [u8]) -> Result<usize> {
        let fd = self.current_fd()?;
        self.ops.read(fd, buf).map_err(|e| {
            if e.is_would_block() {
                log::trace!("No CAN data pending on {}", self.config.interface);
            } else {
                log::error!("Failed to read from {}: {}", self.config.interface, e);
            }
            e
        })
    }

    fn write_socket(&self, buf: &[u8]) -> Result<()> {
        let fd = self.current_fd()?;
        let written = self.ops.write(fd, buf).map_err(|e| {
            log::error!("Failed to write to {}: {}", self.config.interface, e);
            e
        })?;
        if written != buf.len() {
            return Err(CanError::os(
                ErrorKind::CommunicationError,
                format!("short write: {} of {} bytes", written, buf.len()),
            ));
        }
        Ok(())
    }

    fn read_response(&self, buf: &mut [u8], rx_id: u32, timeout: Duration) -> Result<usize> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.read_socket(buf) {
                Err(e) if e.is_would_block() => {
                    if Instant::now() >= deadline {
                        return Err(CanError::Timeout {
                            address: rx_id,
                            timeout,
                        });
                    }
                    thread::sleep(RESPONSE_POLL_INTERVAL);
                }
                other => return other,
            }
        }
    }
}

impl Drop for SocketCanDevice {
    fn drop(&mut self) {
        if let Some(fd) = self.fd.get_mut().take() {
            if let Err(e) = self.ops.close(fd) {
                log::warn!("Failed to close CAN device on {}: {}", self.config.interface, e);
            }
        }
    }
}

impl FrameTransport for SocketCanDevice {
    type Message = Frame;

    fn receive(&self) -> Result<Frame> {
        self.get_message()
    }

    fn send(&self, message: &Frame) -> Result<()> {
        self.send_frame(message)
    }
}

fn open_raw(ops: &dyn SocketOps, config: &DeviceConfig) -> Result<RawFd> {
    let fd = ops.socket(PF_CAN, libc::SOCK_RAW, CAN_RAW)?;
    close_on_error(ops, fd, configure_raw(ops, fd, config))
}

fn configure_raw(ops: &dyn SocketOps, fd: RawFd, config: &DeviceConfig) -> Result<()> {
    let ifindex = ops.ioctl_interface_index(fd, &config.interface)?;
    ops.set_nonblocking(fd)?;
    if config.fd_frames {
        ops.setsockopt(fd, SOL_CAN_RAW, CAN_RAW_FD_FRAMES, &1i32.to_ne_bytes())?;
    }
    ops.bind(fd, &CanSocketAddress::raw(ifindex))
}

fn open_isotp(ops: &dyn SocketOps, config: &DeviceConfig, rx_id: u32, tx_id: u32) -> Result<RawFd> {
    let fd = ops.socket(PF_CAN, libc::SOCK_DGRAM, CAN_ISOTP)?;
    close_on_error(ops, fd, configure_isotp(ops, fd, config, rx_id, tx_id))
}

fn configure_isotp(
    ops: &dyn SocketOps,
    fd: RawFd,
    config: &DeviceConfig,
    rx_id: u32,
    tx_id: u32,
) -> Result<()> {
    let options = IsoTpOptions::force_txstmin();
    ops.setsockopt(fd, SOL_CAN_ISOTP, CAN_ISOTP_OPTS, &options.to_bytes())?;
    let ifindex = ops.ioctl_interface_index(fd, &config.interface)?;
    ops.set_nonblocking(fd)?;
    ops.bind(fd, &CanSocketAddress::isotp(ifindex, rx_id, tx_id))
}

fn close_on_error(ops: &dyn SocketOps, fd: RawFd, result: Result<()>) -> Result<RawFd> {
    match result {
        Ok(()) => Ok(fd),
        Err(e) => {
            if let Err(close_err) = ops.close(fd) {
                log::warn!("Failed to close socket {} after init error: {}", fd, close_err);
            }
            Err(e)
        }
    }
}
