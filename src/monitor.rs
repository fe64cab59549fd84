//! Background reclamation of sessions whose peers vanished.
//!
//! The monitor owns one thread that blocks on a message queue. Transport
//! disconnect notices and deaf-peer reports are posted to that queue and never
//! acted on inline, so nothing outside this thread sweeps the table on their
//! behalf. A timed-out receive doubles as the periodic fallback scan.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::process::ProcessProbe;
use crate::session::{SessionHandle, SessionTable};
use crate::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MonitorEvent {
    /// The transport lost this session's connection.
    PeerDisconnected(SessionHandle),
    /// A fanout found this many peers that never consumed their last wake.
    DeafPeers(usize),
    Scan,
    Shutdown,
}

pub struct LivenessMonitor {
    tx: Sender<MonitorEvent>,
    handle: Option<JoinHandle<()>>,
    scans: Arc<AtomicU64>,
}

impl LivenessMonitor {
    pub fn spawn(
        table: Arc<SessionTable>,
        tx: Sender<MonitorEvent>,
        rx: Receiver<MonitorEvent>,
        probe: Arc<dyn ProcessProbe>,
        interval: Duration,
    ) -> Result<Self> {
        let scans = Arc::new(AtomicU64::new(0));
        let thread_scans = Arc::clone(&scans);
        let handle = thread::Builder::new()
            .name("shmcast-liveness".to_string())
            .spawn(move || run(table, rx, probe, interval, thread_scans))?;
        Ok(Self {
            tx,
            handle: Some(handle),
            scans,
        })
    }

    pub fn request_scan(&self) {
        let _ = self.tx.send(MonitorEvent::Scan);
    }

    /// Sweeps completed so far.
    pub fn scans(&self) -> u64 {
        self.scans.load(Ordering::Acquire)
    }

    pub fn shutdown(&mut self) -> Result<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        let _ = self.tx.send(MonitorEvent::Shutdown);
        handle
            .join()
            .map_err(|_| Error::Corrupt("liveness thread panicked"))
    }
}

impl Drop for LivenessMonitor {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

fn run(
    table: Arc<SessionTable>,
    rx: Receiver<MonitorEvent>,
    probe: Arc<dyn ProcessProbe>,
    interval: Duration,
    scans: Arc<AtomicU64>,
) {
    let mut shutdown = false;
    while !shutdown {
        let mut orphaned = Vec::new();
        match rx.recv_timeout(interval) {
            Ok(event) => shutdown = absorb(event, &mut orphaned),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        // One sweep covers everything queued so far.
        while let Ok(event) = rx.try_recv() {
            shutdown |= absorb(event, &mut orphaned);
        }
        match table.sweep(probe.as_ref(), &orphaned) {
            Ok(report) if !report.evicted.is_empty() => {
                log::info!(
                    "evicted {} unresponsive session(s), running {} -> {}",
                    report.evicted.len(),
                    report.running_before,
                    report.running_after
                );
            }
            Ok(_) => {}
            Err(err) => log::warn!("liveness sweep failed: {err}"),
        }
        scans.fetch_add(1, Ordering::Release);
    }
    log::debug!("liveness monitor exiting");
}

fn absorb(event: MonitorEvent, orphaned: &mut Vec<SessionHandle>) -> bool {
    match event {
        MonitorEvent::PeerDisconnected(handle) => {
            log::debug!("peer for session {handle} disconnected");
            orphaned.push(handle);
        }
        MonitorEvent::DeafPeers(count) => {
            log::debug!("{count} peer(s) missed a wake; scanning");
        }
        MonitorEvent::Scan => {}
        MonitorEvent::Shutdown => return true,
    }
    false
}
