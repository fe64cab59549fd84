//! Server end of the control socket.
//!
//! The accept loop runs nonblocking and polls a stop flag, one thread per
//! connection. A connection holds at most one session; losing the connection
//! without a `disconnect` posts a notice to the liveness monitor, which
//! reclaims the session on its own thread.

use std::io;
use std::os::fd::AsFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::wire::{send_message, MessageReader, Request, Response};
use crate::server::ShutdownLatch;
use crate::session::{SessionHandle, SessionTable};
use crate::{Error, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

pub struct ControlListener {
    path: PathBuf,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ControlListener {
    /// Binds `path`, replacing a stale socket file left by a dead server.
    pub fn bind(path: &Path, table: Arc<SessionTable>, latch: Arc<ShutdownLatch>) -> Result<Self> {
        if path.exists() {
            if UnixStream::connect(path).is_ok() {
                return Err(Error::Transport(format!(
                    "a server is already listening on {}",
                    path.display()
                )));
            }
            std::fs::remove_file(path)?;
        }
        let listener = UnixListener::bind(path)?;
        listener.set_nonblocking(true)?;
        log::info!("control socket listening on {}", path.display());

        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name("shmcast-control".to_string())
            .spawn(move || accept_loop(listener, table, latch, thread_stop))?;
        Ok(Self {
            path: path.to_path_buf(),
            stop,
            handle: Some(handle),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stops accepting, waits for every connection thread, removes the socket.
    pub fn shutdown(&mut self) -> Result<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        self.stop.store(true, Ordering::Release);
        let joined = handle
            .join()
            .map_err(|_| Error::Corrupt("control thread panicked"));
        if let Err(err) = std::fs::remove_file(&self.path) {
            if err.kind() != io::ErrorKind::NotFound {
                log::warn!("failed to remove {}: {err}", self.path.display());
            }
        }
        joined
    }
}

impl Drop for ControlListener {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

fn accept_loop(
    listener: UnixListener,
    table: Arc<SessionTable>,
    latch: Arc<ShutdownLatch>,
    stop: Arc<AtomicBool>,
) {
    let mut connections: Vec<JoinHandle<()>> = Vec::new();
    while !stop.load(Ordering::Acquire) {
        match listener.accept() {
            Ok((stream, _)) => {
                let table = Arc::clone(&table);
                let latch = Arc::clone(&latch);
                let stop = Arc::clone(&stop);
                let spawned = thread::Builder::new()
                    .name("shmcast-conn".to_string())
                    .spawn(move || serve(stream, table, latch, stop));
                match spawned {
                    Ok(handle) => connections.push(handle),
                    Err(err) => log::warn!("failed to spawn connection thread: {err}"),
                }
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => thread::sleep(POLL_INTERVAL),
            Err(err) => {
                log::warn!("accept failed: {err}");
                thread::sleep(POLL_INTERVAL);
            }
        }
        connections.retain(|handle| !handle.is_finished());
    }
    for handle in connections {
        let _ = handle.join();
    }
    log::debug!("control listener exiting");
}

struct Connection {
    stream: UnixStream,
    reader: MessageReader,
    table: Arc<SessionTable>,
    session: Option<SessionHandle>,
}

fn serve(stream: UnixStream, table: Arc<SessionTable>, latch: Arc<ShutdownLatch>, stop: Arc<AtomicBool>) {
    let configured = stream
        .set_nonblocking(false)
        .and_then(|_| stream.set_read_timeout(Some(POLL_INTERVAL)));
    if let Err(err) = configured {
        log::warn!("failed to configure control connection: {err}");
        return;
    }
    let mut conn = Connection {
        stream,
        reader: MessageReader::new(),
        table,
        session: None,
    };
    while !stop.load(Ordering::Acquire) {
        let request = match conn.reader.recv::<Request>(&conn.stream) {
            Ok(Some(request)) => request,
            Ok(None) => break,
            Err(Error::Io(err))
                if matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) =>
            {
                continue
            }
            Err(Error::Protocol(message)) => {
                log::warn!("malformed control message: {message}");
                let reply = Response::from_error(&Error::Protocol(message));
                if send_message(&conn.stream, &reply, None).is_err() {
                    break;
                }
                continue;
            }
            Err(err) => {
                log::warn!("control connection failed: {err}");
                break;
            }
        };
        let shutdown = request == Request::Shutdown;
        let reply = conn.handle(request);
        let stray = conn.reader.discard_fds();
        if stray > 0 {
            log::debug!("closed {stray} unclaimed descriptor(s)");
        }
        if let Err(err) = send_message(&conn.stream, &reply, None) {
            log::warn!("failed to reply: {err}");
            break;
        }
        if shutdown {
            log::info!("shutdown requested over control socket");
            latch.trigger();
        }
    }
    if let Some(handle) = conn.session.take() {
        conn.table.notice_peer_disconnected(handle);
    }
}

impl Connection {
    fn handle(&mut self, request: Request) -> Response {
        match request {
            Request::Connect { pid } => self.connect(pid),
            Request::Disconnect => match self.session.take() {
                Some(handle) => Response::from_result(self.table.disconnect(handle).map(|_| ())),
                None => Response::from_error(&Error::NotConnected),
            },
            Request::Start => self.with_session(|table, handle| table.start(handle)),
            Request::Stop => self.with_session(|table, handle| table.stop(handle)),
            Request::Set { name, value } => {
                self.with_session(|table, handle| table.set(handle, &name, &value))
            }
            Request::Get { name } => match self.session {
                Some(handle) => match self.table.get(handle, &name) {
                    Ok(value) => Response::Value { value },
                    Err(err) => Response::from_error(&err),
                },
                None => Response::from_error(&Error::NotConnected),
            },
            Request::Shutdown => Response::Ok,
        }
    }

    fn connect(&mut self, claimed_pid: u32) -> Response {
        if self.session.is_some() {
            return Response::from_error(&Error::Protocol(
                "connection already holds a session".to_string(),
            ));
        }
        let Some(fd) = self.reader.take_fd() else {
            return Response::from_error(&Error::Protocol(
                "connect carried no notification descriptor".to_string(),
            ));
        };
        let pid = peer_pid(&self.stream).unwrap_or(claimed_pid);
        match self.table.connect(pid, fd.as_fd()) {
            Ok((session, segment)) => {
                self.session = Some(session);
                Response::Connected { session, segment }
            }
            Err(err) => Response::from_error(&err),
        }
    }

    fn with_session(
        &self,
        op: impl FnOnce(&SessionTable, SessionHandle) -> Result<()>,
    ) -> Response {
        match self.session {
            Some(handle) => Response::from_result(op(&self.table, handle)),
            None => Response::from_error(&Error::NotConnected),
        }
    }
}

/// Kernel-reported pid of the peer, which outranks what the peer claims.
fn peer_pid(stream: &UnixStream) -> Option<u32> {
    use std::os::fd::AsRawFd;

    let mut cred: libc::ucred = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;
    let res = unsafe {
        libc::getsockopt(
            stream.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_PEERCRED,
            &mut cred as *mut libc::ucred as *mut libc::c_void,
            &mut len,
        )
    };
    if res != 0 || cred.pid <= 0 {
        return None;
    }
    Some(cred.pid as u32)
}
