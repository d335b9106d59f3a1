//! Socket primitives
//!
//! `SocketOps` is the only place the crate touches the operating system.
//! `LinuxSocketOps` forwards to libc; `MockSocketOps` replays scripted reads
//! and records everything written so devices and clients can be tested
//! without a CAN interface.

mod mock;
mod socket;

pub use mock::{MockRead, MockSocketOps, SocketCall};
pub use socket::LinuxSocketOps;

use crate::types::Result;
use byteorder::{ByteOrder, NativeEndian};
use std::os::unix::io::RawFd;

// Constants from <linux/can.h>, <linux/can/raw.h> and <linux/can/isotp.h>
pub const PF_CAN: i32 = 29;
pub const AF_CAN: i32 = PF_CAN;
pub const CAN_RAW: i32 = 1;
pub const CAN_ISOTP: i32 = 6;
pub const SOL_CAN_BASE: i32 = 100;
pub const SOL_CAN_RAW: i32 = SOL_CAN_BASE + CAN_RAW;
pub const SOL_CAN_ISOTP: i32 = SOL_CAN_BASE + CAN_ISOTP;
pub const CAN_RAW_FD_FRAMES: i32 = 5;
pub const CAN_ISOTP_OPTS: i32 = 1;
/// Honour the configured minimum separation time on transmit
pub const CAN_ISOTP_FORCE_TXSTMIN: u32 = 0x100;

/// Address a CAN socket is bound to
///
/// `rx_id`/`tx_id` are only meaningful for ISO-TP sockets and are zero for
/// raw sockets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CanSocketAddress {
    pub ifindex: i32,
    pub rx_id: u32,
    pub tx_id: u32,
}

impl CanSocketAddress {
    pub fn raw(ifindex: i32) -> Self {
        Self {
            ifindex,
            ..Default::default()
        }
    }

    pub fn isotp(ifindex: i32, rx_id: u32, tx_id: u32) -> Self {
        Self {
            ifindex,
            rx_id,
            tx_id,
        }
    }
}

/// `struct can_isotp_options`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IsoTpOptions {
    pub flags: u32,
    /// Frame transmission time (N_As/N_Ar) in nanoseconds
    pub frame_txtime: u32,
    pub ext_address: u8,
    pub txpad_content: u8,
    pub rxpad_content: u8,
    pub rx_ext_address: u8,
}

impl IsoTpOptions {
    pub const SIZE: usize = 12;

    pub fn force_txstmin() -> Self {
        Self {
            flags: CAN_ISOTP_FORCE_TXSTMIN,
            ..Default::default()
        }
    }

    /// In-memory layout expected by `setsockopt`
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        NativeEndian::write_u32(&mut buf[0..4], self.flags);
        NativeEndian::write_u32(&mut buf[4..8], self.frame_txtime);
        buf[8] = self.ext_address;
        buf[9] = self.txpad_content;
        buf[10] = self.rxpad_content;
        buf[11] = self.rx_ext_address;
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::SIZE {
            return None;
        }
        Some(Self {
            flags: NativeEndian::read_u32(&buf[0..4]),
            frame_txtime: NativeEndian::read_u32(&buf[4..8]),
            ext_address: buf[8],
            txpad_content: buf[9],
            rxpad_content: buf[10],
            rx_ext_address: buf[11],
        })
    }
}

/// Narrow interface over the socket syscalls used by `SocketCanDevice`
///
/// Failures are reported as `CanError::Os` carrying the errno of the failed
/// call.
pub trait SocketOps: Send + Sync {
    fn socket(&self, domain: i32, ty: i32, protocol: i32) -> Result<RawFd>;

    /// `ioctl(SIOCGIFINDEX)` for `interface`
    fn ioctl_interface_index(&self, fd: RawFd, interface: &str) -> Result<i32>;

    /// `fcntl(F_SETFL, flags | O_NONBLOCK)`
    fn set_nonblocking(&self, fd: RawFd) -> Result<()>;

    fn setsockopt(&self, fd: RawFd, level: i32, name: i32, value: &[u8]) -> Result<()>;

    fn bind(&self, fd: RawFd, address: &CanSocketAddress) -> Result<()>;

    /// Read one datagram; would-block surfaces as an `EAGAIN` error
    fn read(&self, fd: RawFd, buf: &mut [u8]) -> Result<usize>;

    fn write(&self, fd: RawFd, buf: &[u8]) -> Result<usize>;

    fn close(&self, fd: RawFd) -> Result<()>;
}
