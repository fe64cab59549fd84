//! Framing for the control socket: one JSON object per line. A `connect`
//! request carries the consumer's eventfd as `SCM_RIGHTS` ancillary data.

use std::collections::VecDeque;
use std::io::{self, Write};
use std::mem;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::ptr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::segment::SegmentRef;
use crate::session::SessionHandle;
use crate::{Error, Result};

const RECV_CHUNK: usize = 4096;
const MAX_LINE: usize = 64 * 1024;
const MAX_FDS_PER_MESSAGE: usize = 4;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Connect { pid: u32 },
    Disconnect,
    Start,
    Stop,
    Set { name: String, value: String },
    Get { name: String },
    Shutdown,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Response {
    Connected {
        session: SessionHandle,
        segment: SegmentRef,
    },
    Ok,
    Value {
        value: String,
    },
    Error {
        kind: ErrorKind,
        message: String,
    },
}

/// Error categories that survive the trip to the client.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ErrorKind {
    CapacityExceeded { capacity: usize },
    NotConnected,
    AlreadyRunning,
    NotRunning,
    Protocol,
    Server,
}

impl Response {
    pub fn from_error(err: &Error) -> Self {
        let kind = match err {
            Error::CapacityExceeded(capacity) => ErrorKind::CapacityExceeded {
                capacity: *capacity,
            },
            Error::NotConnected => ErrorKind::NotConnected,
            Error::AlreadyRunning => ErrorKind::AlreadyRunning,
            Error::NotRunning => ErrorKind::NotRunning,
            Error::Protocol(_) => ErrorKind::Protocol,
            _ => ErrorKind::Server,
        };
        Response::Error {
            kind,
            message: err.to_string(),
        }
    }

    pub fn from_result(result: Result<()>) -> Self {
        match result {
            Ok(()) => Response::Ok,
            Err(err) => Response::from_error(&err),
        }
    }

    /// `Ok` for `Response::Ok`, the mapped error for `Response::Error`.
    pub fn into_unit(self) -> Result<()> {
        match self {
            Response::Ok => Ok(()),
            other => other.into_failure(),
        }
    }

    pub fn into_value(self) -> Result<String> {
        match self {
            Response::Value { value } => Ok(value),
            other => other.into_failure(),
        }
    }

    pub(crate) fn into_failure<T>(self) -> Result<T> {
        match self {
            Response::Error { kind, message } => Err(kind.into_error(message)),
            other => Err(Error::Protocol(format!("unexpected response {other:?}"))),
        }
    }
}

impl ErrorKind {
    fn into_error(self, message: String) -> Error {
        match self {
            ErrorKind::CapacityExceeded { capacity } => Error::CapacityExceeded(capacity),
            ErrorKind::NotConnected => Error::NotConnected,
            ErrorKind::AlreadyRunning => Error::AlreadyRunning,
            ErrorKind::NotRunning => Error::NotRunning,
            ErrorKind::Protocol => Error::Protocol(message),
            ErrorKind::Server => Error::Transport(message),
        }
    }
}

/// Writes `message` as one line, attaching `fd` to its first byte.
pub fn send_message<T: Serialize>(
    stream: &UnixStream,
    message: &T,
    fd: Option<BorrowedFd<'_>>,
) -> Result<()> {
    let mut line = serde_json::to_vec(message)?;
    line.push(b'\n');
    let mut writer = stream;
    match fd {
        Some(fd) => {
            let sent = send_with_fd(stream.as_raw_fd(), &line, fd.as_raw_fd())?;
            writer.write_all(&line[sent..])?;
        }
        None => writer.write_all(&line)?,
    }
    Ok(())
}

/// Splits a stream into lines and collects descriptors that arrive with them.
#[derive(Debug, Default)]
pub struct MessageReader {
    buf: Vec<u8>,
    fds: VecDeque<OwnedFd>,
}

impl MessageReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next message, or `None` at a clean end of stream. A read timeout on
    /// `stream` surfaces as an `Io` error of kind `WouldBlock`; partial input
    /// stays buffered for the next call.
    pub fn recv<T: DeserializeOwned>(&mut self, stream: &UnixStream) -> Result<Option<T>> {
        loop {
            if let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = self.buf.drain(..=pos).collect();
                return Ok(Some(serde_json::from_slice(&line[..pos])?));
            }
            if self.buf.len() > MAX_LINE {
                self.buf.clear();
                return Err(Error::Protocol(format!("line exceeds {MAX_LINE} bytes")));
            }
            let mut chunk = [0u8; RECV_CHUNK];
            let n = recv_with_fds(stream.as_raw_fd(), &mut chunk, &mut self.fds)?;
            if n == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                self.buf.clear();
                return Err(Error::Protocol("connection closed mid-message".to_string()));
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    /// Oldest descriptor received and not yet claimed.
    pub fn take_fd(&mut self) -> Option<OwnedFd> {
        self.fds.pop_front()
    }

    /// Closes descriptors nobody claimed.
    pub fn discard_fds(&mut self) -> usize {
        let count = self.fds.len();
        self.fds.clear();
        count
    }
}

fn send_with_fd(socket: RawFd, data: &[u8], fd: RawFd) -> io::Result<usize> {
    let mut iov = libc::iovec {
        iov_base: data.as_ptr() as *mut libc::c_void,
        iov_len: data.len(),
    };
    let space = unsafe { libc::CMSG_SPACE(mem::size_of::<libc::c_int>() as u32) } as usize;
    let mut control = vec![0u64; space.div_ceil(mem::size_of::<u64>())];
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = space as _;
    unsafe {
        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len = libc::CMSG_LEN(mem::size_of::<libc::c_int>() as u32) as _;
        ptr::write_unaligned(libc::CMSG_DATA(cmsg) as *mut libc::c_int, fd);
    }
    loop {
        let n = unsafe { libc::sendmsg(socket, &msg, libc::MSG_NOSIGNAL) };
        if n >= 0 {
            return Ok(n as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

fn recv_with_fds(socket: RawFd, data: &mut [u8], fds: &mut VecDeque<OwnedFd>) -> io::Result<usize> {
    let mut iov = libc::iovec {
        iov_base: data.as_mut_ptr() as *mut libc::c_void,
        iov_len: data.len(),
    };
    let space = unsafe {
        libc::CMSG_SPACE((MAX_FDS_PER_MESSAGE * mem::size_of::<libc::c_int>()) as u32)
    } as usize;
    let mut control = vec![0u64; space.div_ceil(mem::size_of::<u64>())];
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = space as _;
    let n = loop {
        let n = unsafe { libc::recvmsg(socket, &mut msg, libc::MSG_CMSG_CLOEXEC) };
        if n >= 0 {
            break n as usize;
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    };
    unsafe {
        let header = libc::CMSG_LEN(0) as usize;
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let count = ((*cmsg).cmsg_len as usize - header) / mem::size_of::<libc::c_int>();
                let base = libc::CMSG_DATA(cmsg) as *const libc::c_int;
                for i in 0..count {
                    fds.push_back(OwnedFd::from_raw_fd(ptr::read_unaligned(base.add(i))));
                }
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }
    if msg.msg_flags & libc::MSG_CTRUNC != 0 {
        log::warn!("control message truncated; descriptors dropped");
    }
    Ok(n)
}
