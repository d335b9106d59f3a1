//! libc-backed socket primitives

use super::{CanSocketAddress, SocketOps, AF_CAN, SOL_CAN_ISOTP};
use crate::types::{CanError, ErrorKind, Result};
use libc::{c_char, c_int, c_void};
use std::mem::size_of;
use std::os::unix::io::RawFd;

/// `struct sockaddr_can` with the ISO-TP address member
#[repr(C)]
struct SockAddrCan {
    can_family: libc::sa_family_t,
    can_ifindex: c_int,
    rx_id: u32,
    tx_id: u32,
    _pad: [u8; 8],
}

/// `struct ifreq` as used by `SIOCGIFINDEX`
#[repr(C)]
struct IfReq {
    ifr_name: [c_char; libc::IFNAMSIZ],
    ifr_ifindex: c_int,
    _pad: [u8; 20],
}

/// Real sockets via libc
#[derive(Debug, Default, Clone, Copy)]
pub struct LinuxSocketOps;

impl LinuxSocketOps {
    pub fn new() -> Self {
        Self
    }
}

fn check(rc: c_int, kind: ErrorKind) -> Result<c_int> {
    if rc < 0 {
        Err(CanError::last_os_error(kind))
    } else {
        Ok(rc)
    }
}

impl SocketOps for LinuxSocketOps {
    fn socket(&self, domain: i32, ty: i32, protocol: i32) -> Result<RawFd> {
        // SAFETY: plain syscall with integer arguments.
        let fd = unsafe { libc::socket(domain, ty, protocol) };
        check(fd, ErrorKind::ErrorCreatingDevice)
    }

    fn ioctl_interface_index(&self, fd: RawFd, interface: &str) -> Result<i32> {
        let name = interface.as_bytes();
        if name.is_empty() || name.len() >= libc::IFNAMSIZ || name.contains(&0) {
            return Err(CanError::InvalidParameter(format!(
                "invalid interface name {:?}",
                interface
            )));
        }
        let mut request = IfReq {
            ifr_name: [0; libc::IFNAMSIZ],
            ifr_ifindex: 0,
            _pad: [0; 20],
        };
        for (dst, &src) in request.ifr_name.iter_mut().zip(name) {
            *dst = src as c_char;
        }
        // SAFETY: `request` is a properly sized, NUL-terminated ifreq.
        let rc = unsafe { libc::ioctl(fd, libc::SIOCGIFINDEX as _, &mut request as *mut IfReq) };
        check(rc, ErrorKind::CommunicationError)?;
        Ok(request.ifr_ifindex)
    }

    fn set_nonblocking(&self, fd: RawFd) -> Result<()> {
        // SAFETY: fcntl on a descriptor we own.
        let flags = check(unsafe { libc::fcntl(fd, libc::F_GETFL) }, ErrorKind::InvalidParameter)?;
        // SAFETY: as above.
        check(
            unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) },
            ErrorKind::InvalidParameter,
        )?;
        Ok(())
    }

    fn setsockopt(&self, fd: RawFd, level: i32, name: i32, value: &[u8]) -> Result<()> {
        let kind = if level == SOL_CAN_ISOTP {
            ErrorKind::ErrorSettingSocketIsoTpOptions
        } else {
            ErrorKind::InvalidParameter
        };
        // SAFETY: `value` is valid for `value.len()` bytes.
        let rc = unsafe {
            libc::setsockopt(
                fd,
                level,
                name,
                value.as_ptr() as *const c_void,
                value.len() as libc::socklen_t,
            )
        };
        check(rc, kind)?;
        Ok(())
    }

    fn bind(&self, fd: RawFd, address: &CanSocketAddress) -> Result<()> {
        let addr = SockAddrCan {
            can_family: AF_CAN as libc::sa_family_t,
            can_ifindex: address.ifindex,
            rx_id: address.rx_id,
            tx_id: address.tx_id,
            _pad: [0; 8],
        };
        // SAFETY: `addr` matches the kernel's sockaddr_can layout and size.
        let rc = unsafe {
            libc::bind(
                fd,
                &addr as *const SockAddrCan as *const libc::sockaddr,
                size_of::<SockAddrCan>() as libc::socklen_t,
            )
        };
        check(rc, ErrorKind::ErrorCreatingDevice)?;
        Ok(())
    }

    fn read(&self, fd: RawFd, buf: &mut [u8]) -> Result<usize> {
        // SAFETY: `buf` is writable for `buf.len()` bytes.
        let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut c_void, buf.len()) };
        if n < 0 {
            return Err(CanError::last_os_error(ErrorKind::CommunicationError));
        }
        Ok(n as usize)
    }

    fn write(&self, fd: RawFd, buf: &[u8]) -> Result<usize> {
        // SAFETY: `buf` is readable for `buf.len()` bytes.
        let n = unsafe { libc::write(fd, buf.as_ptr() as *const c_void, buf.len()) };
        if n < 0 {
            return Err(CanError::last_os_error(ErrorKind::CommunicationError));
        }
        Ok(n as usize)
    }

    fn close(&self, fd: RawFd) -> Result<()> {
        // SAFETY: closing a descriptor we own.
        check(unsafe { libc::close(fd) }, ErrorKind::CommunicationError)?;
        Ok(())
    }
}
