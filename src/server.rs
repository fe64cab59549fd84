use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::clock::{Clock, MonotonicClock};
use crate::control::listener::ControlListener;
use crate::engine::{EngineConfig, FrameSource, LetterSource, ProducerEngine};
use crate::lock::DirectoryLock;
use crate::monitor::LivenessMonitor;
use crate::process::{OsProcessProbe, ProcessProbe};
use crate::properties::{Properties, StubProperties};
use crate::segment::SharedSegment;
use crate::session::{SessionTable, MAX_SESSIONS};
use crate::{Error, Result};

const SEGMENT_FILE: &str = "segment.shm";
const SOCKET_FILE: &str = "control.sock";
const LOCK_FILE: &str = "server.lock";

/// File names under a runtime directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuntimePaths {
    pub dir: PathBuf,
}

impl RuntimePaths {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    /// `$XDG_RUNTIME_DIR/shmcast`, else `<tmp>/shmcast-<uid>`.
    pub fn default_dir() -> PathBuf {
        match std::env::var_os("XDG_RUNTIME_DIR") {
            Some(dir) if !dir.is_empty() => PathBuf::from(dir).join("shmcast"),
            _ => {
                let uid = unsafe { libc::getuid() };
                std::env::temp_dir().join(format!("shmcast-{uid}"))
            }
        }
    }

    pub fn segment(&self) -> PathBuf {
        self.dir.join(SEGMENT_FILE)
    }

    pub fn socket(&self) -> PathBuf {
        self.dir.join(SOCKET_FILE)
    }

    /// Held by the one server that owns the directory.
    pub fn lock(&self) -> PathBuf {
        self.dir.join(LOCK_FILE)
    }
}

impl Default for RuntimePaths {
    fn default() -> Self {
        Self::new(Self::default_dir())
    }
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub paths: RuntimePaths,
    pub tick: Duration,
    pub scan_interval: Duration,
    pub max_sessions: usize,
    pub producer_core: Option<usize>,
    /// mlock the segment so the producer never faults on it.
    pub memlock: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            paths: RuntimePaths::default(),
            tick: Duration::from_millis(1000),
            scan_interval: Duration::from_millis(1000),
            max_sessions: MAX_SESSIONS,
            producer_core: None,
            memlock: false,
        }
    }
}

impl ServerConfig {
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        Self {
            paths: RuntimePaths::new(dir),
            ..Self::default()
        }
    }
}

/// Replaceable collaborators of a server.
pub struct ServerParts {
    pub probe: Arc<dyn ProcessProbe>,
    pub clock: Arc<dyn Clock>,
    pub source: Box<dyn FrameSource>,
    pub properties: Box<dyn Properties>,
}

impl Default for ServerParts {
    fn default() -> Self {
        Self {
            probe: Arc::new(OsProcessProbe),
            clock: Arc::new(MonotonicClock),
            source: Box::new(LetterSource::default()),
            properties: Box::new(StubProperties),
        }
    }
}

/// One-shot flag a remote `shutdown` call sets and the server's owner waits on.
#[derive(Debug, Default)]
pub struct ShutdownLatch {
    requested: Mutex<bool>,
    cond: Condvar,
}

impl ShutdownLatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        if let Ok(mut requested) = self.requested.lock() {
            *requested = true;
            self.cond.notify_all();
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.requested.lock().map(|r| *r).unwrap_or(true)
    }

    /// Returns `true` once triggered, `false` if `timeout` passed first.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<bool> {
        let guard = self.requested.lock().map_err(|_| Error::LockPoisoned)?;
        let guard = match timeout {
            Some(timeout) => {
                self.cond
                    .wait_timeout_while(guard, timeout, |requested| !*requested)
                    .map_err(|_| Error::LockPoisoned)?
                    .0
            }
            None => self
                .cond
                .wait_while(guard, |requested| !*requested)
                .map_err(|_| Error::LockPoisoned)?,
        };
        Ok(*guard)
    }
}

/// The producer-side runtime: segment, session table, engine, monitor and,
/// once [`Server::listen`] is called, the control socket.
pub struct Server {
    config: ServerConfig,
    table: Arc<SessionTable>,
    monitor: LivenessMonitor,
    listener: Option<ControlListener>,
    latch: Arc<ShutdownLatch>,
    stopped: bool,
    // Released only after everything above is torn down.
    _dir_lock: DirectoryLock,
}

impl Server {
    pub fn start(config: ServerConfig) -> Result<Self> {
        Self::start_with(config, ServerParts::default())
    }

    /// Fails with [`Error::DirectoryInUse`] while another server owns
    /// `config.paths`; that server's segment and socket are left alone.
    pub fn start_with(config: ServerConfig, parts: ServerParts) -> Result<Self> {
        std::fs::create_dir_all(&config.paths.dir)?;
        let dir_lock = DirectoryLock::acquire(&config.paths.lock())?;
        let segment = Arc::new(SharedSegment::create(&config.paths.segment())?);
        if config.memlock {
            segment.lock_in_memory()?;
        }
        let (tx, rx) = mpsc::channel();
        let engine_config = EngineConfig {
            tick: config.tick,
            core: config.producer_core,
        };
        let ServerParts {
            probe,
            clock,
            source,
            properties,
        } = parts;
        let table = SessionTable::new(
            segment,
            properties,
            tx.clone(),
            config.max_sessions,
            move |segment, fanout| {
                ProducerEngine::new(segment, fanout, clock, source, engine_config)
            },
        );
        let monitor = LivenessMonitor::spawn(
            Arc::clone(&table),
            tx,
            rx,
            probe,
            config.scan_interval,
        )?;
        log::info!(
            "server up: segment {} tick {:?} max sessions {}",
            config.paths.segment().display(),
            config.tick,
            table.capacity()
        );
        Ok(Self {
            config,
            table,
            monitor,
            listener: None,
            latch: Arc::new(ShutdownLatch::new()),
            stopped: false,
            _dir_lock: dir_lock,
        })
    }

    /// Starts accepting control connections on the runtime socket.
    pub fn listen(&mut self) -> Result<()> {
        if self.listener.is_some() {
            return Ok(());
        }
        let listener = ControlListener::bind(
            &self.config.paths.socket(),
            Arc::clone(&self.table),
            Arc::clone(&self.latch),
        )?;
        self.listener = Some(listener);
        Ok(())
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn table(&self) -> &Arc<SessionTable> {
        &self.table
    }

    pub fn monitor(&self) -> &LivenessMonitor {
        &self.monitor
    }

    pub fn latch(&self) -> &Arc<ShutdownLatch> {
        &self.latch
    }

    /// Engine first, then the listener, then the table and its monitor.
    pub fn shutdown(&mut self) -> Result<()> {
        if self.stopped {
            return Ok(());
        }
        self.stopped = true;
        self.latch.trigger();
        self.table.engine().shutdown()?;
        if let Some(mut listener) = self.listener.take() {
            listener.shutdown()?;
        }
        self.table.close()?;
        self.monitor.shutdown()?;
        log::info!("server down");
        Ok(())
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            log::warn!("server shutdown failed: {err}");
        }
    }
}
