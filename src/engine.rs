//! The producer: one thread that ticks on a fixed period and writes frames.
//!
//! Streams share the tick counter; stream `i` advances on ticks where
//! `counter % (i + 1) == 0`. With the default 1 s tick, stream 0 updates at
//! 1 Hz and stream 1 at 0.5 Hz.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::clock::Clock;
use crate::layout::{Payload, PAYLOAD_LEN, STREAM_COUNT};
use crate::segment::SharedSegment;
use crate::wait::WakeSignal;
use crate::{Error, Result};

/// Wakes every interested consumer after a frame is published.
pub trait Fanout: Send + Sync {
    fn fanout(&self);
}

/// Produces the payload for the next frame of a stream.
pub trait FrameSource: Send + 'static {
    fn next_payload(&mut self, stream: usize, tick: u64) -> Payload;
}

/// Default source: a random ASCII letter, upper or lower case.
#[derive(Debug, Clone)]
pub struct LetterSource {
    rng: fastrand::Rng,
}

impl LetterSource {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: fastrand::Rng::with_seed(seed),
        }
    }
}

impl Default for LetterSource {
    fn default() -> Self {
        Self {
            rng: fastrand::Rng::new(),
        }
    }
}

impl FrameSource for LetterSource {
    fn next_payload(&mut self, _stream: usize, _tick: u64) -> Payload {
        let mut payload = [0u8; PAYLOAD_LEN];
        for byte in payload.iter_mut() {
            let base = if self.rng.bool() { b'a' } else { b'A' };
            *byte = base + self.rng.u8(0..26);
        }
        payload
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineState {
    /// Never started; no thread exists yet.
    Idle,
    Active,
    /// Stopped; the thread is blocked until the next start.
    Parked,
    Shutdown,
}

impl EngineState {
    fn from_raw(raw: u32) -> Self {
        match raw {
            1 => EngineState::Active,
            2 => EngineState::Parked,
            3 => EngineState::Shutdown,
            _ => EngineState::Idle,
        }
    }

    fn as_raw(self) -> u32 {
        match self {
            EngineState::Idle => 0,
            EngineState::Active => 1,
            EngineState::Parked => 2,
            EngineState::Shutdown => 3,
        }
    }
}

#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub tick: Duration,
    /// Core to pin the producer thread to.
    pub core: Option<usize>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(1000),
            core: None,
        }
    }
}

struct EngineShared {
    segment: Arc<SharedSegment>,
    fanout: Weak<dyn Fanout>,
    clock: Arc<dyn Clock>,
    source: Mutex<Box<dyn FrameSource>>,
    state: AtomicU32,
    wake: WakeSignal,
    ticks: AtomicU64,
    writes: AtomicU64,
}

impl EngineShared {
    fn state(&self) -> EngineState {
        EngineState::from_raw(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: EngineState) {
        self.state.store(state.as_raw(), Ordering::Release);
    }

    fn producing(&self) -> bool {
        self.state() == EngineState::Active && self.segment.running() > 0
    }

    fn tick(&self, counter: u64) -> Result<usize> {
        let mut source = self
            .source
            .lock()
            .map_err(|_| Error::Corrupt("frame source lock poisoned"))?;
        let mut updated = 0;
        for stream in 0..STREAM_COUNT {
            if counter % (stream as u64 + 1) != 0 {
                continue;
            }
            // A stop may land mid-tick; do not re-arm behind it.
            if !self.producing() {
                break;
            }
            let payload = source.next_payload(stream, counter);
            let timestamp = self.clock.monotonic_seconds();
            let (index, count) = self.segment.publish(stream, &payload, timestamp);
            self.writes.fetch_add(1, Ordering::Relaxed);
            log::debug!(
                "{timestamp:.6} stream[{stream}].frames[{index:02}] := 0x{:02X} (mc={count})",
                payload[0]
            );
            if let Some(fanout) = self.fanout.upgrade() {
                fanout.fanout();
            }
            updated += 1;
        }
        self.ticks.fetch_add(1, Ordering::Relaxed);
        Ok(updated)
    }
}

pub struct ProducerEngine {
    shared: Arc<EngineShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
    config: EngineConfig,
}

impl ProducerEngine {
    pub fn new(
        segment: Arc<SharedSegment>,
        fanout: Weak<dyn Fanout>,
        clock: Arc<dyn Clock>,
        source: Box<dyn FrameSource>,
        config: EngineConfig,
    ) -> Self {
        Self {
            shared: Arc::new(EngineShared {
                segment,
                fanout,
                clock,
                source: Mutex::new(source),
                state: AtomicU32::new(EngineState::Idle.as_raw()),
                wake: WakeSignal::new(),
                ticks: AtomicU64::new(0),
                writes: AtomicU64::new(0),
            }),
            thread: Mutex::new(None),
            config,
        }
    }

    pub fn state(&self) -> EngineState {
        self.shared.state()
    }

    pub fn ticks(&self) -> u64 {
        self.shared.ticks.load(Ordering::Relaxed)
    }

    pub fn writes(&self) -> u64 {
        self.shared.writes.load(Ordering::Relaxed)
    }

    /// Resumes production, creating the thread on first use.
    pub fn start(&self) -> Result<()> {
        if self.state() == EngineState::Shutdown {
            return Err(Error::Unsupported("producer engine already shut down"));
        }
        self.shared.set_state(EngineState::Active);
        let mut slot = self
            .thread
            .lock()
            .map_err(|_| Error::Corrupt("engine thread lock poisoned"))?;
        if slot.is_none() {
            let shared = Arc::clone(&self.shared);
            let config = self.config.clone();
            let handle = thread::Builder::new()
                .name("shmcast-producer".to_string())
                .spawn(move || run(shared, config))?;
            *slot = Some(handle);
        }
        drop(slot);
        self.shared.wake.notify()?;
        log::info!("-- started");
        Ok(())
    }

    /// Disarms every stream and parks the thread.
    pub fn stop(&self) -> Result<()> {
        if self.state() == EngineState::Shutdown {
            return Ok(());
        }
        self.shared.set_state(EngineState::Parked);
        self.shared.segment.disarm_all();
        self.shared.wake.notify()?;
        log::info!("-- stopped");
        Ok(())
    }

    /// Runs one tick on the calling thread. Writes only while active and
    /// while the segment has running sessions.
    pub fn tick(&self, counter: u64) -> Result<usize> {
        self.shared.tick(counter)
    }

    /// Stops the thread for good and joins it. Must not be called while
    /// holding the session table lock: the thread may be inside a fanout.
    pub fn shutdown(&self) -> Result<()> {
        self.shared.set_state(EngineState::Shutdown);
        self.shared.segment.disarm_all();
        self.shared.wake.notify()?;
        let handle = self
            .thread
            .lock()
            .map_err(|_| Error::Corrupt("engine thread lock poisoned"))?
            .take();
        if let Some(handle) = handle {
            // The last owner can be released from the producer thread itself
            // when a fanout upgrade outlives everyone else.
            if handle.thread().id() == thread::current().id() {
                return Ok(());
            }
            handle
                .join()
                .map_err(|_| Error::Corrupt("producer thread panicked"))?;
        }
        Ok(())
    }
}

impl Drop for ProducerEngine {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

fn run(shared: Arc<EngineShared>, config: EngineConfig) {
    if let Some(core) = config.core {
        pin_to_core(core);
    }
    let mut counter: u64 = 0;
    let mut next_tick: Option<Instant> = None;
    loop {
        let seen = shared.wake.current();
        let timeout = match shared.state() {
            EngineState::Shutdown => break,
            EngineState::Active => {
                let deadline = *next_tick.get_or_insert_with(|| Instant::now() + config.tick);
                Some(deadline.saturating_duration_since(Instant::now()))
            }
            EngineState::Parked | EngineState::Idle => {
                // Catches a write that raced the stop.
                shared.segment.disarm_all();
                next_tick = None;
                None
            }
        };
        if timeout != Some(Duration::ZERO) {
            if let Err(err) = shared.wake.wait(seen, timeout) {
                log::warn!("producer wait failed: {err}");
                thread::sleep(config.tick);
            }
        }
        let Some(deadline) = next_tick else {
            continue;
        };
        let now = Instant::now();
        if shared.state() != EngineState::Active || now < deadline {
            continue;
        }
        if shared.segment.running() > 0 {
            if let Err(err) = shared.tick(counter) {
                log::error!("producer tick failed: {err}");
            }
        }
        counter = counter.wrapping_add(1);
        let following = deadline + config.tick;
        next_tick = Some(if following < now { now + config.tick } else { following });
    }
    log::debug!(
        "producer thread exiting after {} ticks",
        shared.ticks.load(Ordering::Relaxed)
    );
}

fn pin_to_core(core: usize) {
    match core_affinity::get_core_ids() {
        Some(ids) => match ids.into_iter().find(|id| id.id == core) {
            Some(id) => {
                if core_affinity::set_for_current(id) {
                    log::info!("producer pinned to core {core}");
                } else {
                    log::warn!("failed to pin producer to core {core}");
                }
            }
            None => log::warn!("core {core} not available; producer left unpinned"),
        },
        None => log::warn!("core ids unavailable; producer left unpinned"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MonotonicClock;
    use crate::layout::{Cursor, FRAME_CAPACITY};

    #[derive(Default)]
    struct CountingFanout {
        calls: AtomicU64,
    }

    impl Fanout for CountingFanout {
        fn fanout(&self) {
            self.calls.fetch_add(1, Ordering::Relaxed);
        }
    }

    struct FixedSource(u8);

    impl FrameSource for FixedSource {
        fn next_payload(&mut self, stream: usize, _tick: u64) -> Payload {
            [self.0 + stream as u8]
        }
    }

    fn engine(
        dir: &tempfile::TempDir,
        tick: Duration,
    ) -> (Arc<SharedSegment>, Arc<CountingFanout>, ProducerEngine) {
        let segment = Arc::new(SharedSegment::create(&dir.path().join("segment.shm")).unwrap());
        let fanout = Arc::new(CountingFanout::default());
        let weak: Weak<dyn Fanout> = Arc::downgrade(&fanout) as Weak<dyn Fanout>;
        let engine = ProducerEngine::new(
            Arc::clone(&segment),
            weak,
            Arc::new(MonotonicClock),
            Box::new(FixedSource(b'A')),
            EngineConfig {
                tick,
                core: None,
            },
        );
        (segment, fanout, engine)
    }

    fn wait_until(deadline: Duration, mut f: impl FnMut() -> bool) -> bool {
        let end = Instant::now() + deadline;
        while Instant::now() < end {
            if f() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        f()
    }

    #[test]
    fn letter_source_yields_ascii_letters() {
        let mut source = LetterSource::new(42);
        let mut upper = false;
        let mut lower = false;
        for tick in 0..200 {
            let [byte] = source.next_payload(0, tick);
            assert!(byte.is_ascii_alphabetic(), "got {byte:#x}");
            upper |= byte.is_ascii_uppercase();
            lower |= byte.is_ascii_lowercase();
        }
        assert!(upper && lower);
    }

    #[test]
    fn letter_source_is_reproducible_from_a_seed() {
        let mut a = LetterSource::new(9);
        let mut b = LetterSource::new(9);
        for tick in 0..32 {
            assert_eq!(a.next_payload(0, tick), b.next_payload(0, tick));
        }
    }

    #[test]
    fn cadence_divides_the_tick_counter() {
        let dir = tempfile::tempdir().unwrap();
        let (segment, fanout, engine) = engine(&dir, Duration::from_secs(3600));
        segment.add_running(1);
        engine.shared.set_state(EngineState::Active);

        let updates: Vec<usize> = (0..6).map(|k| engine.tick(k).unwrap()).collect();
        assert_eq!(updates, vec![2, 1, 2, 1, 2, 1]);
        assert_eq!(fanout.calls.load(Ordering::Relaxed), 9);
        assert_eq!(segment.layout().stream(0).cursor(), Cursor::Armed { next: 6 });
        assert_eq!(segment.layout().stream(1).cursor(), Cursor::Armed { next: 3 });
    }

    #[test]
    fn thirty_ticks_cover_the_whole_ring() {
        let dir = tempfile::tempdir().unwrap();
        let (segment, _fanout, engine) = engine(&dir, Duration::from_secs(3600));
        segment.add_running(1);
        engine.shared.set_state(EngineState::Active);

        let stream = segment.layout().stream(0);
        for k in 0..30 {
            engine.tick(k).unwrap();
            assert!(stream.latest_index().is_some());
        }
        assert!(stream
            .frames()
            .iter()
            .all(|frame| frame.modification_count() >= 1));
        assert_eq!(stream.cursor(), Cursor::Armed { next: 30 % FRAME_CAPACITY });
    }

    #[test]
    fn tick_is_a_no_op_without_running_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let (segment, fanout, engine) = engine(&dir, Duration::from_secs(3600));
        engine.shared.set_state(EngineState::Active);
        assert_eq!(engine.tick(0).unwrap(), 0);
        assert_eq!(fanout.calls.load(Ordering::Relaxed), 0);
        assert_eq!(segment.layout().stream(0).cursor(), Cursor::Disarmed);
    }

    #[test]
    fn start_produces_promptly_and_stop_disarms() {
        let dir = tempfile::tempdir().unwrap();
        let (segment, fanout, engine) = engine(&dir, Duration::from_millis(5));
        assert_eq!(engine.state(), EngineState::Idle);

        segment.add_running(1);
        engine.start().unwrap();
        assert_eq!(engine.state(), EngineState::Active);
        assert!(wait_until(Duration::from_secs(2), || engine.writes() >= 4));
        assert!(fanout.calls.load(Ordering::Relaxed) >= 4);

        segment.add_running(-1);
        engine.stop().unwrap();
        assert_eq!(engine.state(), EngineState::Parked);
        thread::sleep(Duration::from_millis(20));
        let parked_writes = engine.writes();
        thread::sleep(Duration::from_millis(30));
        assert_eq!(engine.writes(), parked_writes);
        for stream in segment.layout().streams() {
            assert_eq!(stream.cursor(), Cursor::Disarmed);
        }

        segment.add_running(1);
        engine.start().unwrap();
        assert!(wait_until(Duration::from_secs(2), || engine.writes() > parked_writes));
        engine.shutdown().unwrap();
        assert_eq!(engine.state(), EngineState::Shutdown);
    }

    #[test]
    fn start_after_shutdown_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (_segment, _fanout, engine) = engine(&dir, Duration::from_millis(5));
        engine.shutdown().unwrap();
        assert!(engine.start().is_err());
    }
}
