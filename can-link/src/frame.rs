//! CAN frame model and Linux wire layout
//!
//! `Frame` is the unit exchanged with a device: a raw identifier (flag bits
//! included) plus up to 64 payload bytes. It encodes to the kernel's
//! `struct can_frame` (16 bytes) or `struct canfd_frame` (72 bytes).

use crate::signals::database::{buffer_size_to_data_length_code, INVALID_DATA_LENGTH_CODE};
use crate::types::{CanError, Result};
use byteorder::{ByteOrder, NativeEndian};
use std::fmt;

/// Extended frame format (29-bit identifier)
pub const CAN_EFF_FLAG: u32 = 0x8000_0000;
/// Standard frame format (11-bit identifier) mask
pub const CAN_SFF_MASK: u32 = 0x0000_07FF;
/// Extended frame format mask
pub const CAN_EFF_MASK: u32 = 0x1FFF_FFFF;

pub const CAN_MAX_DLEN: usize = 8;
pub const CANFD_MAX_DLEN: usize = 64;
/// `sizeof(struct can_frame)`
pub const CAN_MTU: usize = 16;
/// `sizeof(struct canfd_frame)`
pub const CANFD_MTU: usize = 72;

/// CAN FD frame flag: this is an FD frame
pub const CANFD_FDF: u8 = 0x04;

const HEADER_LEN: usize = 8;

/// Something that can travel over a `FrameTransport`
pub trait WireMessage: Clone + Send + fmt::Debug + Sized {
    /// Identifier with flag bits removed
    fn address(&self) -> u32;

    fn data(&self) -> &[u8];

    fn from_parts(address: u32, data: &[u8]) -> Result<Self>;
}

/// One CAN or CAN FD frame
#[derive(Clone, PartialEq, Eq, Default)]
pub struct Frame {
    can_id: u32,
    data: Vec<u8>,
}

impl Frame {
    /// Frame for `address`; identifiers above 11 bits get the extended flag
    pub fn new(address: u32, data: &[u8]) -> Result<Self> {
        if address > CAN_EFF_MASK {
            return Err(CanError::InvalidParameter(format!(
                "CAN address 0x{:X} exceeds 29 bits",
                address
            )));
        }
        let can_id = if address > CAN_SFF_MASK {
            address | CAN_EFF_FLAG
        } else {
            address
        };
        Self::from_raw_id(can_id, data)
    }

    /// Frame with an identifier exactly as it appears on the wire
    pub fn from_raw_id(can_id: u32, data: &[u8]) -> Result<Self> {
        if buffer_size_to_data_length_code(data.len()) == INVALID_DATA_LENGTH_CODE {
            return Err(CanError::InvalidData(format!(
                "payload of {} bytes has no data length code",
                data.len()
            )));
        }
        Ok(Self {
            can_id,
            data: data.to_vec(),
        })
    }

    /// Raw identifier including flag bits
    pub fn can_id(&self) -> u32 {
        self.can_id
    }

    pub fn address(&self) -> u32 {
        self.can_id & CAN_EFF_MASK
    }

    pub fn is_extended(&self) -> bool {
        self.can_id & CAN_EFF_FLAG != 0
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Needs a `canfd_frame` to carry
    pub fn is_fd(&self) -> bool {
        self.data.len() > CAN_MAX_DLEN
    }

    pub fn dlc(&self) -> u8 {
        buffer_size_to_data_length_code(self.data.len())
    }

    /// Serialize to `struct can_frame`, or `struct canfd_frame` when `fd`
    pub fn encode(&self, fd: bool) -> Result<Vec<u8>> {
        let (mtu, max) = if fd {
            (CANFD_MTU, CANFD_MAX_DLEN)
        } else {
            (CAN_MTU, CAN_MAX_DLEN)
        };
        if self.data.len() > max {
            return Err(CanError::InvalidParameter(format!(
                "payload of {} bytes exceeds {} byte frame",
                self.data.len(),
                max
            )));
        }

        let mut buf = vec![0u8; mtu];
        NativeEndian::write_u32(&mut buf[0..4], self.can_id);
        buf[4] = self.data.len() as u8;
        if fd {
            buf[5] = CANFD_FDF;
        }
        buf[HEADER_LEN..HEADER_LEN + self.data.len()].copy_from_slice(&self.data);
        Ok(buf)
    }

    /// Parse a `struct can_frame` or `struct canfd_frame` read from a socket
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < CAN_MTU {
            return Err(CanError::InvalidData(format!(
                "short CAN frame: {} bytes",
                buf.len()
            )));
        }
        let max = if buf.len() >= CANFD_MTU {
            CANFD_MAX_DLEN
        } else {
            CAN_MAX_DLEN
        };
        let can_id = NativeEndian::read_u32(&buf[0..4]);
        let len = usize::from(buf[4]);
        if len > max {
            return Err(CanError::InvalidData(format!(
                "frame length {} exceeds {} bytes",
                len, max
            )));
        }
        Self::from_raw_id(can_id, &buf[HEADER_LEN..HEADER_LEN + len])
    }
}

impl WireMessage for Frame {
    fn address(&self) -> u32 {
        Frame::address(self)
    }

    fn data(&self) -> &[u8] {
        Frame::data(self)
    }

    fn from_parts(address: u32, data: &[u8]) -> Result<Self> {
        Frame::new(address, data)
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("can_id", &format_args!("0x{:X}", self.can_id))
            .field("data", &hex::encode(&self.data))
            .finish()
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_extended() {
            write!(f, "{:08X}#{}", self.address(), hex::encode_upper(&self.data))
        } else {
            write!(f, "{:03X}#{}", self.address(), hex::encode_upper(&self.data))
        }
    }
}
