//! Server-side registry of connected consumers.
//!
//! Every mutation happens under one [`TableLock`]. The segment's `running`
//! counter always equals the number of sessions whose running flag is set;
//! each operation either applies fully or leaves both untouched.

use std::os::fd::BorrowedFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Weak};

use serde::{Deserialize, Serialize};

use crate::activity::ActivityController;
use crate::engine::{Fanout, ProducerEngine};
use crate::lock::TableLock;
use crate::monitor::MonitorEvent;
use crate::notifier::PeerNotifier;
use crate::process::ProcessProbe;
use crate::properties::Properties;
use crate::segment::{SegmentRef, SharedSegment};
use crate::{Error, Result};

pub const MAX_SESSIONS: usize = 128;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionHandle(pub u64);

impl std::fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

struct Session {
    handle: SessionHandle,
    peer_pid: u32,
    notifier: Arc<PeerNotifier>,
    running: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionInfo {
    pub handle: SessionHandle,
    pub peer_pid: u32,
    pub running: bool,
}

impl Session {
    fn info(&self) -> SessionInfo {
        SessionInfo {
            handle: self.handle,
            peer_pid: self.peer_pid,
            running: self.running,
        }
    }
}

struct Sessions {
    entries: Vec<Session>,
    next_handle: u64,
}

impl Sessions {
    fn find(&self, handle: SessionHandle) -> Option<usize> {
        self.entries.iter().position(|s| s.handle == handle)
    }
}

/// Outcome of a liveness sweep.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub evicted: Vec<SessionInfo>,
    pub running_before: i32,
    pub running_after: i32,
}

pub struct SessionTable {
    sessions: TableLock<Sessions>,
    segment: Arc<SharedSegment>,
    activity: ActivityController,
    properties: Box<dyn Properties>,
    monitor: Sender<MonitorEvent>,
    capacity: usize,
    closed: AtomicBool,
    fanouts: AtomicU64,
    deaf_signals: AtomicU64,
}

impl SessionTable {
    /// Builds the table together with the engine it drives. The engine gets
    /// a weak fanout reference back to the table.
    pub fn new(
        segment: Arc<SharedSegment>,
        properties: Box<dyn Properties>,
        monitor: Sender<MonitorEvent>,
        capacity: usize,
        engine: impl FnOnce(Arc<SharedSegment>, Weak<dyn Fanout>) -> ProducerEngine,
    ) -> Arc<Self> {
        let capacity = capacity.clamp(1, MAX_SESSIONS);
        Arc::new_cyclic(|table: &Weak<SessionTable>| {
            let fanout: Weak<dyn Fanout> = table.clone();
            let engine = Arc::new(engine(Arc::clone(&segment), fanout));
            SessionTable {
                sessions: TableLock::new(Sessions {
                    entries: Vec::with_capacity(capacity),
                    next_handle: 1,
                }),
                segment,
                activity: ActivityController::new(engine),
                properties,
                monitor,
                capacity,
                closed: AtomicBool::new(false),
                fanouts: AtomicU64::new(0),
                deaf_signals: AtomicU64::new(0),
            }
        })
    }

    pub fn engine(&self) -> &Arc<ProducerEngine> {
        self.activity.engine()
    }

    pub fn activity(&self) -> &ActivityController {
        &self.activity
    }

    pub fn segment(&self) -> &Arc<SharedSegment> {
        &self.segment
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Admits a peer. The table keeps its own duplicate of `notification`.
    pub fn connect(
        &self,
        peer_pid: u32,
        notification: BorrowedFd<'_>,
    ) -> Result<(SessionHandle, SegmentRef)> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Transport("server is shutting down".to_string()));
        }
        let notifier = Arc::new(PeerNotifier::duplicate(notification)?);
        let mut sessions = self.sessions.lock()?;
        if sessions.entries.len() >= self.capacity {
            log::warn!("rejecting pid={peer_pid}: {} sessions", sessions.entries.len());
            return Err(Error::CapacityExceeded(self.capacity));
        }
        let handle = SessionHandle(sessions.next_handle);
        sessions.next_handle += 1;
        sessions.entries.push(Session {
            handle,
            peer_pid,
            notifier,
            running: false,
        });
        log::info!(
            "session {handle} connected pid={peer_pid} ({} active)",
            sessions.entries.len()
        );
        Ok((handle, self.segment.reference()))
    }

    /// Removes the session if it exists. Unknown handles are ignored.
    pub fn disconnect(&self, handle: SessionHandle) -> Result<bool> {
        let mut sessions = self.sessions.lock()?;
        let Some(ix) = sessions.find(handle) else {
            return Ok(false);
        };
        let (before, after) = self.evict_at(&mut sessions, ix);
        self.activity.on_running_changed(before, after)?;
        Ok(true)
    }

    pub fn start(&self, handle: SessionHandle) -> Result<()> {
        let mut sessions = self.sessions.lock()?;
        let ix = sessions.find(handle).ok_or(Error::NotConnected)?;
        if sessions.entries[ix].running {
            return Err(Error::AlreadyRunning);
        }
        let (before, after) = self.segment.add_running(1);
        debug_assert!(before >= 0);
        if let Err(err) = self.activity.on_running_changed(before, after) {
            self.segment.add_running(-1);
            return Err(err);
        }
        sessions.entries[ix].running = true;
        log::debug!("session {handle} start (running={after})");
        Ok(())
    }

    pub fn stop(&self, handle: SessionHandle) -> Result<()> {
        let mut sessions = self.sessions.lock()?;
        let ix = sessions.find(handle).ok_or(Error::NotConnected)?;
        if !sessions.entries[ix].running {
            return Err(Error::NotRunning);
        }
        let (before, after) = self.segment.add_running(-1);
        debug_assert!(after >= 0);
        if let Err(err) = self.activity.on_running_changed(before, after) {
            self.segment.add_running(1);
            return Err(err);
        }
        sessions.entries[ix].running = false;
        log::debug!("session {handle} stop (running={after})");
        Ok(())
    }

    pub fn set(&self, handle: SessionHandle, name: &str, value: &str) -> Result<()> {
        let sessions = self.sessions.lock()?;
        sessions.find(handle).ok_or(Error::NotConnected)?;
        self.properties.set(name, value)
    }

    pub fn get(&self, handle: SessionHandle, name: &str) -> Result<String> {
        let sessions = self.sessions.lock()?;
        sessions.find(handle).ok_or(Error::NotConnected)?;
        self.properties.get(name)
    }

    /// Queues a liveness scan for a peer whose transport went away.
    pub fn notice_peer_disconnected(&self, handle: SessionHandle) {
        if self.monitor.send(MonitorEvent::PeerDisconnected(handle)).is_err() {
            log::debug!("liveness monitor gone; dropping disconnect notice for {handle}");
        }
    }

    /// Evicts sessions whose process is gone, plus the `orphaned` ones whose
    /// transport closed. Stops the engine if that took `running` to zero.
    pub fn sweep(
        &self,
        probe: &dyn ProcessProbe,
        orphaned: &[SessionHandle],
    ) -> Result<SweepReport> {
        let mut sessions = self.sessions.lock()?;
        let running_before = self.segment.running();
        let mut evicted = Vec::new();
        let mut ix = 0;
        while ix < sessions.entries.len() {
            let session = &sessions.entries[ix];
            let gone = orphaned.contains(&session.handle) || !probe.is_alive(session.peer_pid);
            if gone {
                evicted.push(session.info());
                self.evict_at(&mut sessions, ix);
            } else {
                ix += 1;
            }
        }
        let running_after = self.segment.running();
        debug_assert!(running_after >= 0);
        // Eviction skips the start/stop path, so the edge is handled here.
        if running_before > 0 && running_after == 0 {
            self.activity
                .on_running_changed(running_before, running_after)?;
        }
        Ok(SweepReport {
            evicted,
            running_before,
            running_after,
        })
    }

    /// Rejects new connections and evicts everyone.
    pub fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        let mut sessions = self.sessions.lock()?;
        let running_before = self.segment.running();
        while !sessions.entries.is_empty() {
            let last = sessions.entries.len() - 1;
            self.evict_at(&mut sessions, last);
        }
        let running_after = self.segment.running();
        self.activity
            .on_running_changed(running_before, running_after)?;
        Ok(())
    }

    pub fn sessions(&self) -> Result<Vec<SessionInfo>> {
        let sessions = self.sessions.lock()?;
        Ok(sessions.entries.iter().map(Session::info).collect())
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.sessions.lock()?.entries.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// `(segment running, sum of session flags)`; equal at every quiescent point.
    pub fn running_accounting(&self) -> Result<(i32, i32)> {
        let sessions = self.sessions.lock()?;
        let flags = sessions.entries.iter().filter(|s| s.running).count() as i32;
        Ok((self.segment.running(), flags))
    }

    pub fn fanout_count(&self) -> u64 {
        self.fanouts.load(Ordering::Relaxed)
    }

    pub fn deaf_signal_count(&self) -> u64 {
        self.deaf_signals.load(Ordering::Relaxed)
    }

    /// Swap-with-last removal. Closes the notifier once the last fanout
    /// snapshot holding it is done. Returns `running` before and after.
    fn evict_at(&self, sessions: &mut Sessions, ix: usize) -> (i32, i32) {
        let session = sessions.entries.swap_remove(ix);
        let delta = if session.running { -1 } else { 0 };
        let (before, after) = self.segment.add_running(delta);
        log::info!(
            "removing session[{ix}] {} pid={} running={}",
            session.handle,
            session.peer_pid,
            u8::from(session.running)
        );
        (before, after)
    }

    fn signal_running_sessions(&self) -> Result<usize> {
        // Signal outside the lock; evictions in the meantime only delay the
        // close of a notifier until this snapshot drops.
        let targets: Vec<(SessionHandle, Arc<PeerNotifier>)> = {
            let sessions = self.sessions.lock()?;
            sessions
                .entries
                .iter()
                .filter(|s| s.running)
                .map(|s| (s.handle, Arc::clone(&s.notifier)))
                .collect()
        };
        let mut deaf = 0;
        for (handle, notifier) in targets {
            match notifier.signal() {
                Ok(false) => {}
                Ok(true) => {
                    log::trace!("session {handle} did not consume its last wake");
                    deaf += 1;
                }
                Err(err) => {
                    log::warn!("signal to session {handle} failed: {err}");
                    deaf += 1;
                }
            }
        }
        Ok(deaf)
    }
}

impl Fanout for SessionTable {
    fn fanout(&self) {
        self.fanouts.fetch_add(1, Ordering::Relaxed);
        match self.signal_running_sessions() {
            Ok(0) => {}
            Ok(deaf) => {
                self.deaf_signals.fetch_add(deaf as u64, Ordering::Relaxed);
                let _ = self.monitor.send(MonitorEvent::DeafPeers(deaf));
            }
            Err(err) => log::error!("fanout failed: {err}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MonotonicClock;
    use crate::engine::{EngineConfig, EngineState, LetterSource};
    use crate::notifier::ConsumerNotifier;
    use crate::properties::{StubProperties, STUB_VALUE};
    use std::collections::HashSet;
    use std::os::fd::AsFd;
    use std::sync::mpsc::{self, Receiver};
    use std::sync::Mutex;
    use std::time::Duration;

    struct FakeProbe {
        dead: Mutex<HashSet<u32>>,
    }

    impl FakeProbe {
        fn new() -> Self {
            Self {
                dead: Mutex::new(HashSet::new()),
            }
        }

        fn kill(&self, pid: u32) {
            self.dead.lock().unwrap().insert(pid);
        }
    }

    impl ProcessProbe for FakeProbe {
        fn is_alive(&self, pid: u32) -> bool {
            !self.dead.lock().unwrap().contains(&pid)
        }
    }

    fn table(
        dir: &tempfile::TempDir,
        capacity: usize,
    ) -> (Arc<SessionTable>, Receiver<MonitorEvent>) {
        let segment = Arc::new(SharedSegment::create(&dir.path().join("segment.shm")).unwrap());
        let (tx, rx) = mpsc::channel();
        let table = SessionTable::new(
            segment,
            Box::new(StubProperties),
            tx,
            capacity,
            |segment, fanout| {
                ProducerEngine::new(
                    segment,
                    fanout,
                    Arc::new(MonotonicClock),
                    Box::new(LetterSource::new(1)),
                    EngineConfig {
                        tick: Duration::from_secs(3600),
                        core: None,
                    },
                )
            },
        );
        (table, rx)
    }

    fn assert_accounting(table: &SessionTable) {
        let (running, flags) = table.running_accounting().unwrap();
        assert_eq!(running, flags);
        assert!(running >= 0);
    }

    #[test]
    fn capacity_is_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let (table, _rx) = table(&dir, 2);
        let notifier = ConsumerNotifier::new().unwrap();
        table.connect(1, notifier.as_fd()).unwrap();
        table.connect(2, notifier.as_fd()).unwrap();
        let err = table.connect(3, notifier.as_fd()).unwrap_err();
        assert!(matches!(err, Error::CapacityExceeded(2)));
        assert_eq!(table.len().unwrap(), 2);
        table.engine().shutdown().unwrap();
    }

    #[test]
    fn start_stop_state_machine() {
        let dir = tempfile::tempdir().unwrap();
        let (table, _rx) = table(&dir, MAX_SESSIONS);
        let notifier = ConsumerNotifier::new().unwrap();
        let (a, reference) = table.connect(10, notifier.as_fd()).unwrap();
        let (b, _) = table.connect(11, notifier.as_fd()).unwrap();
        let (_c, _) = table.connect(12, notifier.as_fd()).unwrap();
        assert_eq!(reference, table.segment().reference());

        table.start(a).unwrap();
        assert_eq!(table.segment().running(), 1);
        assert_eq!(table.engine().state(), EngineState::Active);
        assert!(matches!(table.start(a), Err(Error::AlreadyRunning)));
        assert!(matches!(table.stop(b), Err(Error::NotRunning)));
        assert_accounting(&table);

        table.start(b).unwrap();
        table.stop(a).unwrap();
        assert_eq!(table.engine().state(), EngineState::Active);
        table.stop(b).unwrap();
        assert_eq!(table.engine().state(), EngineState::Parked);
        assert_eq!(table.activity().edges(), (1, 1));
        assert_accounting(&table);
        table.engine().shutdown().unwrap();
    }

    #[test]
    fn unknown_handle_is_not_connected() {
        let dir = tempfile::tempdir().unwrap();
        let (table, _rx) = table(&dir, MAX_SESSIONS);
        let ghost = SessionHandle(999);
        assert!(matches!(table.start(ghost), Err(Error::NotConnected)));
        assert!(matches!(table.stop(ghost), Err(Error::NotConnected)));
        assert!(matches!(table.get(ghost, "x"), Err(Error::NotConnected)));
        assert!(!table.disconnect(ghost).unwrap());
    }

    #[test]
    fn disconnect_is_idempotent_and_releases_running() {
        let dir = tempfile::tempdir().unwrap();
        let (table, _rx) = table(&dir, MAX_SESSIONS);
        let notifier = ConsumerNotifier::new().unwrap();
        let (a, _) = table.connect(10, notifier.as_fd()).unwrap();
        let (b, _) = table.connect(11, notifier.as_fd()).unwrap();
        table.start(a).unwrap();

        assert!(table.disconnect(a).unwrap());
        let after_first = table.sessions().unwrap();
        assert!(!table.disconnect(a).unwrap());
        assert_eq!(table.sessions().unwrap(), after_first);
        assert_eq!(after_first.len(), 1);
        assert_eq!(after_first[0].handle, b);
        assert_eq!(table.segment().running(), 0);
        assert_eq!(table.engine().state(), EngineState::Parked);
        assert!(matches!(table.start(a), Err(Error::NotConnected)));
        table.engine().shutdown().unwrap();
    }

    #[test]
    fn removal_swaps_last_into_the_hole() {
        let dir = tempfile::tempdir().unwrap();
        let (table, _rx) = table(&dir, MAX_SESSIONS);
        let notifier = ConsumerNotifier::new().unwrap();
        let (a, _) = table.connect(1, notifier.as_fd()).unwrap();
        let (b, _) = table.connect(2, notifier.as_fd()).unwrap();
        let (c, _) = table.connect(3, notifier.as_fd()).unwrap();
        table.disconnect(a).unwrap();
        let order: Vec<_> = table
            .sessions()
            .unwrap()
            .into_iter()
            .map(|s| s.handle)
            .collect();
        assert_eq!(order, vec![c, b]);
    }

    #[test]
    fn sweep_evicts_dead_peers_and_parks_engine() {
        let dir = tempfile::tempdir().unwrap();
        let (table, _rx) = table(&dir, MAX_SESSIONS);
        let probe = FakeProbe::new();
        let notifier = ConsumerNotifier::new().unwrap();
        let (a, _) = table.connect(100, notifier.as_fd()).unwrap();
        let (b, _) = table.connect(200, notifier.as_fd()).unwrap();
        table.start(a).unwrap();
        table.start(b).unwrap();

        probe.kill(100);
        let report = table.sweep(&probe, &[]).unwrap();
        assert_eq!(report.evicted.len(), 1);
        assert_eq!(report.evicted[0].handle, a);
        assert_eq!((report.running_before, report.running_after), (2, 1));
        assert_eq!(table.engine().state(), EngineState::Active);
        assert_accounting(&table);

        probe.kill(200);
        let report = table.sweep(&probe, &[]).unwrap();
        assert_eq!((report.running_before, report.running_after), (1, 0));
        assert_eq!(table.engine().state(), EngineState::Parked);
        assert!(table.is_empty().unwrap());
        assert!(matches!(table.stop(b), Err(Error::NotConnected)));
        table.engine().shutdown().unwrap();
    }

    #[test]
    fn sweep_evicts_orphaned_sessions_of_live_processes() {
        let dir = tempfile::tempdir().unwrap();
        let (table, _rx) = table(&dir, MAX_SESSIONS);
        let probe = FakeProbe::new();
        let notifier = ConsumerNotifier::new().unwrap();
        let (a, _) = table.connect(1, notifier.as_fd()).unwrap();
        let (b, _) = table.connect(1, notifier.as_fd()).unwrap();
        let report = table.sweep(&probe, &[b]).unwrap();
        assert_eq!(report.evicted.len(), 1);
        assert_eq!(report.evicted[0].handle, b);
        assert_eq!(table.sessions().unwrap()[0].handle, a);
    }

    #[test]
    fn fanout_signals_running_sessions_and_reports_deaf_ones() {
        let dir = tempfile::tempdir().unwrap();
        let (table, rx) = table(&dir, MAX_SESSIONS);
        let listening = ConsumerNotifier::new().unwrap();
        let idle = ConsumerNotifier::new().unwrap();
        let (a, _) = table.connect(1, listening.as_fd()).unwrap();
        let (_b, _) = table.connect(2, idle.as_fd()).unwrap();
        table.start(a).unwrap();

        table.fanout();
        assert!(listening.wait(Duration::from_millis(100)).unwrap());
        assert!(!idle.wait(Duration::from_millis(10)).unwrap());
        assert!(rx.try_recv().is_err());

        // `a` never consumes this one.
        table.fanout();
        table.fanout();
        assert_eq!(table.deaf_signal_count(), 1);
        assert!(matches!(rx.try_recv(), Ok(MonitorEvent::DeafPeers(1))));
        table.engine().shutdown().unwrap();
    }

    #[test]
    fn properties_are_a_stub() {
        let dir = tempfile::tempdir().unwrap();
        let (table, _rx) = table(&dir, MAX_SESSIONS);
        let notifier = ConsumerNotifier::new().unwrap();
        let (a, _) = table.connect(1, notifier.as_fd()).unwrap();
        table.set(a, "foo", "bar").unwrap();
        assert_eq!(table.get(a, "foo").unwrap(), STUB_VALUE);
    }

    #[test]
    fn close_rejects_new_peers_and_evicts_all() {
        let dir = tempfile::tempdir().unwrap();
        let (table, _rx) = table(&dir, MAX_SESSIONS);
        let notifier = ConsumerNotifier::new().unwrap();
        let (a, _) = table.connect(1, notifier.as_fd()).unwrap();
        table.start(a).unwrap();
        table.close().unwrap();
        assert!(table.is_empty().unwrap());
        assert_eq!(table.segment().running(), 0);
        assert_eq!(table.engine().state(), EngineState::Parked);
        assert!(matches!(
            table.connect(2, notifier.as_fd()),
            Err(Error::Transport(_))
        ));
        table.engine().shutdown().unwrap();
    }

    #[test]
    fn disconnect_notice_is_queued_not_applied() {
        let dir = tempfile::tempdir().unwrap();
        let (table, rx) = table(&dir, MAX_SESSIONS);
        let notifier = ConsumerNotifier::new().unwrap();
        let (a, _) = table.connect(1, notifier.as_fd()).unwrap();
        table.notice_peer_disconnected(a);
        assert_eq!(table.len().unwrap(), 1);
        assert!(matches!(rx.try_recv(), Ok(MonitorEvent::PeerDisconnected(h)) if h == a));
    }
}
