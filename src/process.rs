use std::fs::File;
use std::io::Read;

use crate::{Error, Result};

/// Answers whether a peer process still exists.
pub trait ProcessProbe: Send + Sync + 'static {
    fn is_alive(&self, pid: u32) -> bool;
}

/// Probe backed by `/proc/<pid>/stat`, falling back to `kill(pid, 0)`.
///
/// A zombie counts as dead: it will never consume another notification.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsProcessProbe;

impl ProcessProbe for OsProcessProbe {
    fn is_alive(&self, pid: u32) -> bool {
        if pid == 0 {
            return false;
        }
        match proc_state(pid) {
            Ok(state) => !matches!(state, 'Z' | 'X' | 'x'),
            Err(Error::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => false,
            Err(_) => signal_probe(pid),
        }
    }
}

fn proc_state(pid: u32) -> Result<char> {
    let path = format!("/proc/{pid}/stat");
    let mut contents = String::new();
    File::open(&path)?.read_to_string(&mut contents)?;
    // The command name is parenthesised and may itself contain ')'.
    let end = contents.rfind(')').ok_or(Error::Corrupt("stat parse"))?;
    let after = &contents[end + 1..];
    after
        .split_whitespace()
        .next()
        .and_then(|field| field.chars().next())
        .ok_or(Error::Corrupt("stat missing state"))
}

fn signal_probe(pid: u32) -> bool {
    let res = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if res == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}
