//! Consumer-to-server control calls.
//!
//! Everything a consumer asks of the server goes through [`ControlChannel`].
//! [`LoopbackChannel`] calls an in-process [`SessionTable`] directly;
//! [`SocketChannel`] speaks newline-delimited JSON over a Unix socket and
//! passes the consumer's eventfd with `SCM_RIGHTS`.
//!
//! [`SessionTable`]: crate::session::SessionTable

pub mod client;
pub mod listener;
pub mod loopback;
pub mod socket;
pub mod wire;

use std::os::fd::BorrowedFd;

use crate::segment::SegmentRef;
use crate::session::SessionHandle;
use crate::Result;

pub use client::{Client, ClientConfig, StreamReport};
pub use listener::ControlListener;
pub use loopback::LoopbackChannel;
pub use socket::SocketChannel;
pub use wire::{ErrorKind, Request, Response};

/// One consumer's view of the server. A channel carries at most one session.
pub trait ControlChannel: Send {
    /// Registers the calling process. The server keeps a duplicate of
    /// `notification` and signals it on every fanout while running.
    fn connect(&mut self, notification: BorrowedFd<'_>) -> Result<SegmentRef>;

    fn disconnect(&mut self) -> Result<()>;

    fn start(&mut self) -> Result<()>;

    fn stop(&mut self) -> Result<()>;

    fn set(&mut self, name: &str, value: &str) -> Result<()>;

    fn get(&mut self, name: &str) -> Result<String>;

    /// Asks the server process to exit.
    fn shutdown_server(&mut self) -> Result<()>;

    fn session(&self) -> Option<SessionHandle>;
}
