use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("corrupt data: {0}")]
    Corrupt(&'static str),
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
    #[error("unsupported segment version: {0}")]
    UnsupportedVersion(u32),
    #[error("session table full ({0} sessions)")]
    CapacityExceeded(usize),
    #[error("session not connected")]
    NotConnected,
    #[error("session already running")]
    AlreadyRunning,
    #[error("session not running")]
    NotRunning,
    #[error("table lock re-entered by the thread holding it")]
    LockReentered,
    #[error("table lock poisoned")]
    LockPoisoned,
    #[error("no notification within {0:?}; producer presumed dead")]
    WaitTimeout(std::time::Duration),
    #[error("another server owns {}", .0.display())]
    DirectoryInUse(std::path::PathBuf),
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error::Protocol(value.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
