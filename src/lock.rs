use std::fs::{File, OpenOptions};
use std::io::Write;
use std::ops::{Deref, DerefMut};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::{Error, Result};

const NO_OWNER: u64 = 0;

static NEXT_THREAD_TOKEN: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_TOKEN: u64 = NEXT_THREAD_TOKEN.fetch_add(1, Ordering::Relaxed);
}

fn thread_token() -> u64 {
    THREAD_TOKEN.with(|token| *token)
}

/// A mutex that refuses to be taken twice by the same thread.
///
/// `std::sync::Mutex` deadlocks (or panics) on re-entry; the session table
/// needs the nested call reported as an error instead.
pub struct TableLock<T> {
    inner: Mutex<T>,
    owner: AtomicU64,
}

pub struct TableGuard<'a, T> {
    guard: MutexGuard<'a, T>,
    owner: &'a AtomicU64,
}

impl<T> TableLock<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
            owner: AtomicU64::new(NO_OWNER),
        }
    }

    pub fn lock(&self) -> Result<TableGuard<'_, T>> {
        let me = thread_token();
        // Only this thread can have stored its own token.
        if self.owner.load(Ordering::Acquire) == me {
            return Err(Error::LockReentered);
        }
        let guard = self.inner.lock().map_err(|_| Error::LockPoisoned)?;
        self.owner.store(me, Ordering::Release);
        Ok(TableGuard {
            guard,
            owner: &self.owner,
        })
    }

    pub fn is_held_by_current_thread(&self) -> bool {
        self.owner.load(Ordering::Acquire) == thread_token()
    }
}

impl<T> Deref for TableGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for TableGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for TableGuard<'_, T> {
    fn drop(&mut self) {
        self.owner.store(NO_OWNER, Ordering::Release);
    }
}

/// Exclusive claim on a runtime directory, held as an `flock` on a lock
/// file for as long as this value lives. The kernel drops the lock when the
/// holder exits, so a crashed server never blocks the next one.
#[derive(Debug)]
pub struct DirectoryLock {
    _file: File,
    path: PathBuf,
}

impl DirectoryLock {
    /// Fails with [`Error::DirectoryInUse`] while another holder is alive,
    /// in this process or any other.
    pub fn acquire(path: &Path) -> Result<Self> {
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)?;
        let res = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if res != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                let dir = path.parent().unwrap_or(path).to_path_buf();
                return Err(Error::DirectoryInUse(dir));
            }
            return Err(Error::Io(err));
        }
        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;
        Ok(Self {
            _file: file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
