use std::os::fd::BorrowedFd;
use std::sync::Arc;

use super::ControlChannel;
use crate::segment::SegmentRef;
use crate::server::ShutdownLatch;
use crate::session::{SessionHandle, SessionTable};
use crate::{Error, Result};

/// Calls a session table living in this process.
pub struct LoopbackChannel {
    table: Arc<SessionTable>,
    latch: Arc<ShutdownLatch>,
    session: Option<SessionHandle>,
}

impl LoopbackChannel {
    pub fn new(table: Arc<SessionTable>, latch: Arc<ShutdownLatch>) -> Self {
        Self {
            table,
            latch,
            session: None,
        }
    }

    fn handle(&self) -> Result<SessionHandle> {
        self.session.ok_or(Error::NotConnected)
    }
}

impl ControlChannel for LoopbackChannel {
    fn connect(&mut self, notification: BorrowedFd<'_>) -> Result<SegmentRef> {
        if self.session.is_some() {
            return Err(Error::Protocol("channel already connected".to_string()));
        }
        let (handle, segment) = self.table.connect(std::process::id(), notification)?;
        self.session = Some(handle);
        Ok(segment)
    }

    fn disconnect(&mut self) -> Result<()> {
        let handle = self.handle()?;
        self.session = None;
        self.table.disconnect(handle)?;
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        self.table.start(self.handle()?)
    }

    fn stop(&mut self) -> Result<()> {
        self.table.stop(self.handle()?)
    }

    fn set(&mut self, name: &str, value: &str) -> Result<()> {
        self.table.set(self.handle()?, name, value)
    }

    fn get(&mut self, name: &str) -> Result<String> {
        self.table.get(self.handle()?, name)
    }

    fn shutdown_server(&mut self) -> Result<()> {
        self.latch.trigger();
        Ok(())
    }

    fn session(&self) -> Option<SessionHandle> {
        self.session
    }
}

impl Drop for LoopbackChannel {
    fn drop(&mut self) {
        if let Some(handle) = self.session.take() {
            self.table.notice_peer_disconnected(handle);
        }
    }
}
