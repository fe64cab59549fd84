//! Consumer runtime: one session, one mapped segment, one notifier.

use std::io;
use std::os::fd::AsFd;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use super::{ControlChannel, LoopbackChannel, SocketChannel};
use crate::consumer::{ConsumerReader, Observation, StreamStats};
use crate::layout::STREAM_COUNT;
use crate::notifier::ConsumerNotifier;
use crate::segment::SegmentView;
use crate::server::{RuntimePaths, Server, ServerConfig};
use crate::session::SessionHandle;
use crate::{Error, Result};

const OWNER_ATTACH_ATTEMPTS: u32 = 200;
const OWNER_ATTACH_DELAY: Duration = Duration::from_millis(10);

#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub paths: RuntimePaths,
    /// How long a consumer waits for a wake before giving up on the producer.
    pub wait_timeout: Duration,
    pub connect_attempts: u32,
    pub retry_delay: Duration,
    /// Run a server in this process when none is listening.
    pub local_fallback: bool,
    pub local_tick: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            paths: RuntimePaths::default(),
            wait_timeout: Duration::from_secs(3),
            connect_attempts: 4,
            retry_delay: Duration::from_millis(1),
            local_fallback: true,
            local_tick: Duration::from_millis(1000),
        }
    }
}

/// Result of [`Client::stream`].
#[derive(Clone, Debug)]
pub struct StreamReport {
    pub wakes: usize,
    pub observations: usize,
    pub stats: Vec<StreamStats>,
}

impl StreamReport {
    pub fn max_latency_us(&self) -> f64 {
        self.stats
            .iter()
            .map(StreamStats::max_latency_us)
            .fold(0.0, f64::max)
    }
}

pub struct Client {
    channel: Box<dyn ControlChannel>,
    reader: ConsumerReader,
    // Dropped last so the session goes before its server.
    local: Option<Server>,
}

impl Client {
    /// Connects to the server on the runtime socket, or starts one in this
    /// process if nothing is listening there.
    pub fn connect(config: &ClientConfig) -> Result<Self> {
        let socket = config.paths.socket();
        let attempts = config.connect_attempts.max(1);
        let mut last_err = None;
        for attempt in 1..=attempts {
            match SocketChannel::connect(&socket) {
                Ok(channel) => return Self::with_channel(Box::new(channel)),
                Err(err) => {
                    log::debug!("connect attempt {attempt}/{attempts} failed: {err}");
                    last_err = Some(err);
                    if attempt < attempts {
                        thread::sleep(config.retry_delay);
                    }
                }
            }
        }
        let err = last_err.unwrap_or(Error::NotConnected);
        if !config.local_fallback || !no_listener(&err) {
            return Err(err);
        }

        log::info!(
            "no server at {}; starting one in this process",
            socket.display()
        );
        let started = Server::start(ServerConfig {
            paths: config.paths.clone(),
            tick: config.local_tick,
            ..ServerConfig::default()
        });
        let mut server = match started {
            Ok(server) => server,
            // Another process won the race; its socket appears shortly.
            Err(Error::DirectoryInUse(dir)) => {
                log::info!("{} is owned by another server; waiting for it", dir.display());
                return Self::attach(&socket, OWNER_ATTACH_ATTEMPTS, OWNER_ATTACH_DELAY);
            }
            Err(err) => return Err(err),
        };
        server.listen()?;
        let channel = LoopbackChannel::new(Arc::clone(server.table()), Arc::clone(server.latch()));
        let mut client = Self::with_channel(Box::new(channel))?;
        client.local = Some(server);
        Ok(client)
    }

    fn attach(socket: &Path, attempts: u32, delay: Duration) -> Result<Self> {
        let mut last_err = Error::NotConnected;
        for _ in 0..attempts {
            match SocketChannel::connect(socket) {
                Ok(channel) => return Self::with_channel(Box::new(channel)),
                Err(err) if no_listener(&err) => {
                    last_err = err;
                    thread::sleep(delay);
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_err)
    }

    /// Registers a fresh notifier over `channel` and maps the segment it
    /// returns.
    pub fn with_channel(mut channel: Box<dyn ControlChannel>) -> Result<Self> {
        let notifier = ConsumerNotifier::new()?;
        let segment = channel.connect(notifier.as_fd())?;
        let view = SegmentView::open(&segment)?;
        let reader = ConsumerReader::new(view, notifier)?;
        Ok(Self {
            channel,
            reader,
            local: None,
        })
    }

    pub fn is_local(&self) -> bool {
        self.local.is_some()
    }

    pub fn session(&self) -> Option<SessionHandle> {
        self.channel.session()
    }

    pub fn reader(&self) -> &ConsumerReader {
        &self.reader
    }

    pub fn start(&mut self) -> Result<()> {
        self.channel.start()
    }

    pub fn stop(&mut self) -> Result<()> {
        self.channel.stop()
    }

    pub fn set(&mut self, name: &str, value: &str) -> Result<()> {
        self.channel.set(name, value)
    }

    pub fn get(&mut self, name: &str) -> Result<String> {
        self.channel.get(name)
    }

    pub fn wait(&mut self, timeout: Duration) -> Result<Vec<Observation>> {
        self.reader.wait(timeout)
    }

    /// Issues `calls` property writes and returns the total elapsed time.
    pub fn roundtrip(&mut self, calls: u32) -> Result<Duration> {
        let begin = quanta::Instant::now();
        for _ in 0..calls {
            self.channel.set("roundtrip", "ping")?;
        }
        Ok(quanta::Instant::now().duration_since(begin))
    }

    /// Starts the producer, consumes `wakes` notifications and stops it.
    pub fn stream(&mut self, wakes: usize, timeout: Duration) -> Result<StreamReport> {
        self.start()?;
        let mut observations = 0;
        for _ in 0..wakes {
            match self.reader.wait(timeout) {
                Ok(seen) => observations += seen.len(),
                Err(err) => {
                    if let Err(stop_err) = self.stop() {
                        log::debug!("stop after failed wait: {stop_err}");
                    }
                    return Err(err);
                }
            }
        }
        self.stop()?;
        Ok(StreamReport {
            wakes,
            observations,
            stats: (0..STREAM_COUNT)
                .map(|stream| self.reader.stats(stream).clone())
                .collect(),
        })
    }

    /// Ends the session. A server started by [`Client::connect`] goes with it.
    pub fn disconnect(mut self) -> Result<()> {
        self.channel.disconnect()?;
        if let Some(mut server) = self.local.take() {
            server.shutdown()?;
        }
        Ok(())
    }

    /// Ends the session and asks the server to exit. A server started by
    /// [`Client::connect`] is shut down in place.
    pub fn shutdown_server(mut self) -> Result<()> {
        self.channel.disconnect()?;
        match self.local.take() {
            Some(mut server) => server.shutdown(),
            None => self.channel.shutdown_server(),
        }
    }
}

fn no_listener(err: &Error) -> bool {
    matches!(
        err,
        Error::Io(err) if matches!(err.kind(), io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused)
    )
}
