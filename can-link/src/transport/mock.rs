//! Scripted socket primitives for testing

use super::{CanSocketAddress, SocketOps};
use crate::frame::Frame;
use crate::types::{CanError, ErrorKind, Result};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::os::unix::io::RawFd;

/// Which primitive was invoked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketCall {
    Socket,
    Ioctl,
    SetNonblocking,
    Setsockopt,
    Bind,
    Read,
    Write,
    Close,
}

/// One scripted outcome for `read`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockRead {
    Data(Vec<u8>),
    Error { kind: ErrorKind, errno: i32 },
}

#[derive(Debug, Clone, Copy)]
struct Failure {
    kind: ErrorKind,
    errno: i32,
    once: bool,
}

#[derive(Debug)]
struct MockState {
    next_fd: RawFd,
    interface_index: i32,
    reads: VecDeque<MockRead>,
    writes: Vec<Vec<u8>>,
    calls: Vec<SocketCall>,
    sockets: Vec<(i32, i32, i32)>,
    sockopts: Vec<(i32, i32, Vec<u8>)>,
    bound: Option<CanSocketAddress>,
    closed: Vec<RawFd>,
    failures: HashMap<SocketCall, Failure>,
}

/// In-memory stand-in for `LinuxSocketOps`
///
/// Reads pop from a script and report `EAGAIN` once it runs dry, mirroring a
/// non-blocking socket with nothing pending. Writes are recorded and succeed
/// unless a failure has been injected for that call.
#[derive(Debug)]
pub struct MockSocketOps {
    state: Mutex<MockState>,
}

impl Default for MockSocketOps {
    fn default() -> Self {
        Self::new()
    }
}

impl MockSocketOps {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                next_fd: 3,
                interface_index: 3,
                reads: VecDeque::new(),
                writes: Vec::new(),
                calls: Vec::new(),
                sockets: Vec::new(),
                sockopts: Vec::new(),
                bound: None,
                closed: Vec::new(),
                failures: HashMap::new(),
            }),
        }
    }

    /// Interface index reported by `ioctl_interface_index`
    pub fn with_interface_index(self, index: i32) -> Self {
        self.state.lock().interface_index = index;
        self
    }

    /// Queue raw bytes for the next `read`
    pub fn push_read(&self, data: impl Into<Vec<u8>>) {
        self.state.lock().reads.push_back(MockRead::Data(data.into()));
    }

    /// Queue the wire encoding of `frame` for the next `read`
    pub fn push_frame(&self, frame: &Frame) {
        self.push_read(frame.encode(frame.is_fd()).unwrap_or_default());
    }

    /// Queue a failing `read`
    pub fn push_read_error(&self, kind: ErrorKind, errno: i32) {
        self.state
            .lock()
            .reads
            .push_back(MockRead::Error { kind, errno });
    }

    /// Make every future `call` fail
    pub fn fail(&self, call: SocketCall, kind: ErrorKind, errno: i32) {
        self.state.lock().failures.insert(
            call,
            Failure {
                kind,
                errno,
                once: false,
            },
        );
    }

    /// Make only the next `call` fail
    pub fn fail_once(&self, call: SocketCall, kind: ErrorKind, errno: i32) {
        self.state.lock().failures.insert(
            call,
            Failure {
                kind,
                errno,
                once: true,
            },
        );
    }

    pub fn clear_failure(&self, call: SocketCall) {
        self.state.lock().failures.remove(&call);
    }

    /// Every buffer passed to `write`, in order
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.state.lock().writes.clone()
    }

    /// Written buffers decoded as frames; undecodable writes are skipped
    pub fn written_frames(&self) -> Vec<Frame> {
        self.state
            .lock()
            .writes
            .iter()
            .filter_map(|w| Frame::decode(w).ok())
            .collect()
    }

    pub fn calls(&self) -> Vec<SocketCall> {
        self.state.lock().calls.clone()
    }

    pub fn call_count(&self, call: SocketCall) -> usize {
        self.state.lock().calls.iter().filter(|&&c| c == call).count()
    }

    /// `(domain, type, protocol)` of each created socket
    pub fn sockets(&self) -> Vec<(i32, i32, i32)> {
        self.state.lock().sockets.clone()
    }

    /// `(level, name, value)` of each `setsockopt`
    pub fn sockopts(&self) -> Vec<(i32, i32, Vec<u8>)> {
        self.state.lock().sockopts.clone()
    }

    pub fn bound_address(&self) -> Option<CanSocketAddress> {
        self.state.lock().bound
    }

    pub fn closed(&self) -> Vec<RawFd> {
        self.state.lock().closed.clone()
    }

    pub fn pending_reads(&self) -> usize {
        self.state.lock().reads.len()
    }

    fn enter(state: &mut MockState, call: SocketCall) -> Result<()> {
        state.calls.push(call);
        let failure = match state.failures.get(&call) {
            Some(failure) => *failure,
            None => return Ok(()),
        };
        if failure.once {
            state.failures.remove(&call);
        }
        Err(CanError::Os {
            kind: failure.kind,
            message: format!("injected {:?} failure", call),
            errno: Some(failure.errno),
        })
    }
}

impl SocketOps for MockSocketOps {
    fn socket(&self, domain: i32, ty: i32, protocol: i32) -> Result<RawFd> {
        let mut state = self.state.lock();
        Self::enter(&mut state, SocketCall::Socket)?;
        state.sockets.push((domain, ty, protocol));
        let fd = state.next_fd;
        state.next_fd += 1;
        Ok(fd)
    }

    fn ioctl_interface_index(&self, _fd: RawFd, _interface: &str) -> Result<i32> {
        let mut state = self.state.lock();
        Self::enter(&mut state, SocketCall::Ioctl)?;
        Ok(state.interface_index)
    }

    fn set_nonblocking(&self, _fd: RawFd) -> Result<()> {
        let mut state = self.state.lock();
        Self::enter(&mut state, SocketCall::SetNonblocking)
    }

    fn setsockopt(&self, _fd: RawFd, level: i32, name: i32, value: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        Self::enter(&mut state, SocketCall::Setsockopt)?;
        state.sockopts.push((level, name, value.to_vec()));
        Ok(())
    }

    fn bind(&self, _fd: RawFd, address: &CanSocketAddress) -> Result<()> {
        let mut state = self.state.lock();
        Self::enter(&mut state, SocketCall::Bind)?;
        state.bound = Some(*address);
        Ok(())
    }

    fn read(&self, _fd: RawFd, buf: &mut [u8]) -> Result<usize> {
        let mut state = self.state.lock();
        Self::enter(&mut state, SocketCall::Read)?;
        match state.reads.pop_front() {
            Some(MockRead::Data(data)) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                Ok(n)
            }
            Some(MockRead::Error { kind, errno }) => Err(CanError::Os {
                kind,
                message: "scripted read failure".to_string(),
                errno: Some(errno),
            }),
            None => Err(CanError::Os {
                kind: ErrorKind::CommunicationError,
                message: "no data available".to_string(),
                errno: Some(libc::EAGAIN),
            }),
        }
    }

    fn write(&self, _fd: RawFd, buf: &[u8]) -> Result<usize> {
        let mut state = self.state.lock();
        Self::enter(&mut state, SocketCall::Write)?;
        state.writes.push(buf.to_vec());
        Ok(buf.len())
    }

    fn close(&self, fd: RawFd) -> Result<()> {
        let mut state = self.state.lock();
        Self::enter(&mut state, SocketCall::Close)?;
        state.closed.push(fd);
        Ok(())
    }
}
