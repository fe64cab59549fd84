use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use crate::Result;

/// A wake-up word threads can block on with a timeout.
///
/// Waiters snapshot [`WakeSignal::current`] before checking their condition and
/// pass it to [`WakeSignal::wait`]; a [`WakeSignal::notify`] issued in between
/// makes the wait return immediately instead of being lost.
#[derive(Debug, Default)]
pub struct WakeSignal {
    seq: AtomicU32,
}

impl WakeSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> u32 {
        self.seq.load(Ordering::Acquire)
    }

    /// Blocks until notified past `seen` or until `timeout` elapses.
    /// Spurious returns are possible; callers re-check their state.
    pub fn wait(&self, seen: u32, timeout: Option<Duration>) -> Result<()> {
        if self.current() != seen {
            return Ok(());
        }
        futex_wait(&self.seq, seen, timeout)
    }

    pub fn notify(&self) -> Result<()> {
        self.seq.fetch_add(1, Ordering::AcqRel);
        futex_wake(&self.seq)
    }
}

fn futex_wait(addr: &AtomicU32, expected: u32, timeout: Option<Duration>) -> Result<()> {
    use libc::{syscall, timespec, SYS_futex, EAGAIN, EINTR, ETIMEDOUT, FUTEX_WAIT};

    let mut ts = timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    let ts_ptr = if let Some(timeout) = timeout {
        ts.tv_sec = timeout.as_secs() as libc::time_t;
        ts.tv_nsec = timeout.subsec_nanos() as libc::c_long;
        &ts as *const timespec
    } else {
        std::ptr::null()
    };

    let res = unsafe {
        syscall(
            SYS_futex,
            addr as *const AtomicU32 as *const u32,
            FUTEX_WAIT,
            expected,
            ts_ptr,
            std::ptr::null::<u32>(),
            0,
        )
    };
    if res == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    match err.raw_os_error() {
        Some(code) if code == EAGAIN || code == EINTR || code == ETIMEDOUT => Ok(()),
        _ => Err(crate::Error::Io(err)),
    }
}

fn futex_wake(addr: &AtomicU32) -> Result<()> {
    use libc::{syscall, SYS_futex, FUTEX_WAKE};
    let res = unsafe {
        syscall(
            SYS_futex,
            addr as *const AtomicU32 as *const u32,
            FUTEX_WAKE,
            i32::MAX,
            std::ptr::null::<u32>(),
            std::ptr::null::<u32>(),
            0,
        )
    };
    if res < 0 {
        return Err(crate::Error::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::WakeSignal;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    #[test]
    fn wait_times_out_without_notify() {
        let signal = WakeSignal::new();
        let start = Instant::now();
        signal
            .wait(signal.current(), Some(Duration::from_millis(20)))
            .unwrap();
        assert!(start.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn notify_before_wait_is_not_lost() {
        let signal = WakeSignal::new();
        let seen = signal.current();
        signal.notify().unwrap();
        let start = Instant::now();
        signal.wait(seen, Some(Duration::from_secs(5))).unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn notify_wakes_blocked_thread() {
        let signal = Arc::new(WakeSignal::new());
        let seen = signal.current();
        let waiter = {
            let signal = Arc::clone(&signal);
            std::thread::spawn(move || {
                let start = Instant::now();
                signal.wait(seen, Some(Duration::from_secs(5))).unwrap();
                start.elapsed()
            })
        };
        std::thread::sleep(Duration::from_millis(20));
        signal.notify().unwrap();
        let elapsed = waiter.join().unwrap();
        assert!(elapsed < Duration::from_secs(4));
    }
}
