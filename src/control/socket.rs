use std::io;
use std::os::fd::BorrowedFd;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::Duration;

use super::wire::{send_message, MessageReader, Request, Response};
use super::ControlChannel;
use crate::segment::SegmentRef;
use crate::session::SessionHandle;
use crate::{Error, Result};

const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// Client end of the control socket.
pub struct SocketChannel {
    stream: UnixStream,
    reader: MessageReader,
    session: Option<SessionHandle>,
}

impl SocketChannel {
    pub fn connect(path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(path)?;
        stream.set_read_timeout(Some(REPLY_TIMEOUT))?;
        Ok(Self {
            stream,
            reader: MessageReader::new(),
            session: None,
        })
    }

    fn call(&mut self, request: &Request, fd: Option<BorrowedFd<'_>>) -> Result<Response> {
        send_message(&self.stream, request, fd)?;
        match self.reader.recv::<Response>(&self.stream) {
            Ok(Some(response)) => Ok(response),
            Ok(None) => Err(Error::Transport("server closed the connection".to_string())),
            Err(Error::Io(err))
                if matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) =>
            {
                Err(Error::Transport(format!("no reply within {REPLY_TIMEOUT:?}")))
            }
            Err(err) => Err(err),
        }
    }

    fn connected_call(&mut self, request: &Request) -> Result<Response> {
        if self.session.is_none() {
            return Err(Error::NotConnected);
        }
        self.call(request, None)
    }
}

impl ControlChannel for SocketChannel {
    fn connect(&mut self, notification: BorrowedFd<'_>) -> Result<SegmentRef> {
        if self.session.is_some() {
            return Err(Error::Protocol("channel already connected".to_string()));
        }
        let request = Request::Connect {
            pid: std::process::id(),
        };
        match self.call(&request, Some(notification))? {
            Response::Connected { session, segment } => {
                log::debug!("connected as session {session}");
                self.session = Some(session);
                Ok(segment)
            }
            other => other.into_failure(),
        }
    }

    fn disconnect(&mut self) -> Result<()> {
        let response = self.connected_call(&Request::Disconnect)?;
        self.session = None;
        response.into_unit()
    }

    fn start(&mut self) -> Result<()> {
        self.connected_call(&Request::Start)?.into_unit()
    }

    fn stop(&mut self) -> Result<()> {
        self.connected_call(&Request::Stop)?.into_unit()
    }

    fn set(&mut self, name: &str, value: &str) -> Result<()> {
        self.connected_call(&Request::Set {
            name: name.to_string(),
            value: value.to_string(),
        })?
        .into_unit()
    }

    fn get(&mut self, name: &str) -> Result<String> {
        self.connected_call(&Request::Get {
            name: name.to_string(),
        })?
        .into_value()
    }

    fn shutdown_server(&mut self) -> Result<()> {
        self.call(&Request::Shutdown, None)?.into_unit()
    }

    fn session(&self) -> Option<SessionHandle> {
        self.session
    }
}
