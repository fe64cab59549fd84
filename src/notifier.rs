//! Wake-up handles between the producer and its consumers.
//!
//! Each consumer owns an eventfd. At connect time the transport carries that
//! descriptor into the server, where the session table keeps its own duplicate
//! as a [`PeerNotifier`]. Reading an eventfd resets its counter, so a counter
//! that is still non-zero at the next fanout means the consumer never woke up
//! for the previous one.

use std::mem;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::time::Duration;

use libc::{poll, pollfd, read, write, POLLIN};

use crate::{Error, Result};

/// Consumer side: the eventfd a consumer blocks on.
pub struct ConsumerNotifier {
    fd: OwnedFd,
}

impl ConsumerNotifier {
    pub fn new() -> Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
        Ok(Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    /// Blocks until signaled or `timeout` passes. Returns `false` on timeout.
    /// An interrupted wait reports `true`; callers tolerate spurious wakes.
    pub fn wait(&self, timeout: Duration) -> Result<bool> {
        let mut pfd = pollfd {
            fd: self.fd.as_raw_fd(),
            events: POLLIN,
            revents: 0,
        };
        let millis = timeout.as_millis().min(i32::MAX as u128) as i32;
        let res = unsafe { poll(&mut pfd, 1, millis) };
        if res < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                return Ok(true);
            }
            return Err(Error::Io(err));
        }
        if res == 0 {
            return Ok(false);
        }
        drain(self.fd.as_fd())?;
        Ok(true)
    }

    /// Wakes this consumer from inside its own process.
    pub fn signal(&self) -> Result<()> {
        signal_fd(self.fd.as_fd())
    }
}

impl AsFd for ConsumerNotifier {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

/// Server side: the session table's own duplicate of a consumer's eventfd.
#[derive(Debug)]
pub struct PeerNotifier {
    fd: OwnedFd,
}

impl PeerNotifier {
    /// Takes ownership of a duplicate of `fd`; the caller keeps the original.
    pub fn duplicate(fd: BorrowedFd<'_>) -> Result<Self> {
        let fd = fd.try_clone_to_owned()?;
        Ok(Self { fd })
    }

    /// Signals the peer and reports whether the previous signal was still
    /// pending, i.e. the peer did not consume it.
    pub fn signal(&self) -> Result<bool> {
        let pending = is_readable(self.fd.as_fd())?;
        signal_fd(self.fd.as_fd())?;
        Ok(pending)
    }
}

fn is_readable(fd: BorrowedFd<'_>) -> Result<bool> {
    let mut pfd = pollfd {
        fd: fd.as_raw_fd(),
        events: POLLIN,
        revents: 0,
    };
    let res = unsafe { poll(&mut pfd, 1, 0) };
    if res < 0 {
        let err = std::io::Error::last_os_error();
        if err.kind() == std::io::ErrorKind::Interrupted {
            return Ok(false);
        }
        return Err(Error::Io(err));
    }
    Ok(res > 0 && (pfd.revents & POLLIN) != 0)
}

fn signal_fd(fd: BorrowedFd<'_>) -> Result<()> {
    let value: u64 = 1;
    let res = unsafe {
        write(
            fd.as_raw_fd(),
            &value as *const u64 as *const _,
            mem::size_of::<u64>(),
        )
    };
    if res < 0 {
        let err = std::io::Error::last_os_error();
        // Counter saturated: the peer already has a wake pending.
        if err.raw_os_error() == Some(libc::EAGAIN) {
            return Ok(());
        }
        return Err(Error::Io(err));
    }
    Ok(())
}

fn drain(fd: BorrowedFd<'_>) -> Result<()> {
    let mut buf: u64 = 0;
    let n = unsafe {
        read(
            fd.as_raw_fd(),
            &mut buf as *mut u64 as *mut _,
            mem::size_of::<u64>(),
        )
    };
    if n < 0 {
        let err = std::io::Error::last_os_error();
        if err.kind() == std::io::ErrorKind::WouldBlock {
            return Ok(());
        }
        return Err(Error::Io(err));
    }
    Ok(())
}
