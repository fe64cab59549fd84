use std::time::Duration;

use hdrhistogram::Histogram;

use crate::clock::{Clock, MonotonicClock};
use crate::layout::{Sample, STREAM_COUNT};
use crate::notifier::ConsumerNotifier;
use crate::segment::SegmentView;
use crate::{Error, Result};

/// Latencies at or above this are a consumer attaching to a producer that
/// was already running, not transport latency.
pub const LATENCY_NOISE_FLOOR: Duration = Duration::from_secs(1);

const HISTOGRAM_MAX_US: u64 = 1_000_000;

/// Per-stream latency accounting.
#[derive(Clone, Debug)]
pub struct StreamStats {
    pub observed: u64,
    pub torn: u64,
    pub noise: u64,
    /// Seconds.
    pub max_latency: f64,
    histogram: Histogram<u64>,
}

impl StreamStats {
    fn new() -> Result<Self> {
        let histogram = Histogram::new_with_bounds(1, HISTOGRAM_MAX_US, 3)
            .map_err(|_| Error::Unsupported("latency histogram bounds"))?;
        Ok(Self {
            observed: 0,
            torn: 0,
            noise: 0,
            max_latency: 0.0,
            histogram,
        })
    }

    fn record(&mut self, latency: f64) {
        self.observed += 1;
        if latency > self.max_latency {
            self.max_latency = latency;
        }
        let micros = (latency * 1_000_000.0).round().max(1.0) as u64;
        self.histogram.saturating_record(micros);
    }

    pub fn max_latency_us(&self) -> f64 {
        self.max_latency * 1_000_000.0
    }

    /// Latency at `quantile` in microseconds, 0 when nothing was recorded.
    pub fn quantile_us(&self, quantile: f64) -> u64 {
        if self.histogram.is_empty() {
            return 0;
        }
        self.histogram.value_at_quantile(quantile)
    }
}

/// One frame accepted from the segment.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Observation {
    pub stream: usize,
    pub index: usize,
    pub sample: Sample,
    /// Seconds from the producer's timestamp to this read.
    pub latency: f64,
    /// False when the latency fell above [`LATENCY_NOISE_FLOOR`].
    pub counted: bool,
}

/// Reads the newest frame of every stream after each wake.
///
/// Spurious wakes and laps of the ring are both normal: the reader only
/// compares the latest completed index against the one it saw last.
pub struct ConsumerReader<C: Clock = MonotonicClock> {
    view: SegmentView,
    notifier: ConsumerNotifier,
    clock: C,
    last_index: [Option<usize>; STREAM_COUNT],
    stats: Vec<StreamStats>,
}

impl ConsumerReader<MonotonicClock> {
    pub fn new(view: SegmentView, notifier: ConsumerNotifier) -> Result<Self> {
        Self::with_clock(view, notifier, MonotonicClock)
    }
}

impl<C: Clock> ConsumerReader<C> {
    pub fn with_clock(view: SegmentView, notifier: ConsumerNotifier, clock: C) -> Result<Self> {
        let stats = (0..STREAM_COUNT)
            .map(|_| StreamStats::new())
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            view,
            notifier,
            clock,
            last_index: [None; STREAM_COUNT],
            stats,
        })
    }

    pub fn view(&self) -> &SegmentView {
        &self.view
    }

    pub fn notifier(&self) -> &ConsumerNotifier {
        &self.notifier
    }

    pub fn stats(&self, stream: usize) -> &StreamStats {
        &self.stats[stream]
    }

    /// Blocks for the next wake, then polls. A timeout means the producer
    /// is presumed dead.
    pub fn wait(&mut self, timeout: Duration) -> Result<Vec<Observation>> {
        if !self.notifier.wait(timeout)? {
            return Err(Error::WaitTimeout(timeout));
        }
        Ok(self.poll())
    }

    pub fn poll(&mut self) -> Vec<Observation> {
        let mut observations = Vec::new();
        for stream in 0..STREAM_COUNT {
            let slot = self.view.stream(stream);
            let Some(index) = slot.latest_index() else {
                continue;
            };
            if self.last_index[stream] == Some(index) {
                continue;
            }
            // Marked consumed even when torn: the next write lands elsewhere.
            self.last_index[stream] = Some(index);
            let sample = match slot.frame(index).read() {
                Ok(sample) => sample,
                Err(torn) => {
                    self.stats[stream].torn += 1;
                    log::debug!(
                        "IGNORE stream[{stream}].frames[{index}]: modified in flight (mc {} -> {})",
                        torn.before,
                        torn.after
                    );
                    continue;
                }
            };
            let latency = (self.clock.monotonic_seconds() - sample.timestamp).max(0.0);
            let counted = latency < LATENCY_NOISE_FLOOR.as_secs_f64();
            if counted {
                self.stats[stream].record(latency);
            } else {
                self.stats[stream].noise += 1;
            }
            log::debug!(
                "stream[{stream}].frames[{index:02}] = 0x{:02X} (mc={}) latency={:.3}us",
                sample.payload[0],
                sample.modification_count,
                latency * 1_000_000.0
            );
            observations.push(Observation {
                stream,
                index,
                sample,
                latency,
                counted,
            });
        }
        observations
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::SharedSegment;

    struct FixedClock(f64);

    impl Clock for FixedClock {
        fn monotonic_seconds(&self) -> f64 {
            self.0
        }
    }

    fn reader(
        dir: &tempfile::TempDir,
        now: f64,
    ) -> (SharedSegment, ConsumerReader<FixedClock>) {
        let segment = SharedSegment::create(&dir.path().join("segment.shm")).unwrap();
        let view = SegmentView::open(&segment.reference()).unwrap();
        let reader =
            ConsumerReader::with_clock(view, ConsumerNotifier::new().unwrap(), FixedClock(now))
                .unwrap();
        (segment, reader)
    }

    #[test]
    fn disarmed_streams_yield_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let (_segment, mut reader) = reader(&dir, 10.0);
        assert!(reader.poll().is_empty());
    }

    #[test]
    fn new_frames_are_observed_once() {
        let dir = tempfile::tempdir().unwrap();
        let (segment, mut reader) = reader(&dir, 10.0);
        segment.publish(0, b"a", 9.999_5);

        let seen = reader.poll();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].stream, 0);
        assert_eq!(seen[0].index, 0);
        assert_eq!(seen[0].sample.payload, *b"a");
        assert!(seen[0].counted);
        assert!((reader.stats(0).max_latency_us() - 500.0).abs() < 1.0);

        // Spurious wake: nothing new.
        assert!(reader.poll().is_empty());
        assert_eq!(reader.stats(0).observed, 1);
    }

    #[test]
    fn missed_updates_only_surface_the_latest() {
        let dir = tempfile::tempdir().unwrap();
        let (segment, mut reader) = reader(&dir, 10.0);
        for (i, byte) in b"abcde".iter().enumerate() {
            segment.publish(1, &[*byte], 9.9 + i as f64 * 0.01);
        }
        let seen = reader.poll();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].index, 4);
        assert_eq!(seen[0].sample.payload, *b"e");
    }

    #[test]
    fn startup_latency_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let (segment, mut reader) = reader(&dir, 100.0);
        segment.publish(0, b"x", 50.0);
        let seen = reader.poll();
        assert_eq!(seen.len(), 1);
        assert!(!seen[0].counted);
        assert_eq!(reader.stats(0).noise, 1);
        assert_eq!(reader.stats(0).observed, 0);
        assert_eq!(reader.stats(0).max_latency, 0.0);
        assert_eq!(reader.stats(0).quantile_us(0.99), 0);
    }

    #[test]
    fn max_latency_keeps_the_worst_sample() {
        let dir = tempfile::tempdir().unwrap();
        let (segment, mut reader) = reader(&dir, 10.0);
        segment.publish(0, b"a", 9.9999);
        reader.poll();
        segment.publish(0, b"b", 9.9990);
        reader.poll();
        segment.publish(0, b"c", 9.99995);
        reader.poll();
        let stats = reader.stats(0);
        assert_eq!(stats.observed, 3);
        assert!((stats.max_latency_us() - 1000.0).abs() < 1.0);
        assert!(stats.quantile_us(1.0) >= 999);
    }

    #[test]
    fn wait_times_out_without_producer() {
        let dir = tempfile::tempdir().unwrap();
        let (_segment, mut reader) = reader(&dir, 10.0);
        let err = reader.wait(Duration::from_millis(10)).unwrap_err();
        assert!(matches!(err, Error::WaitTimeout(_)));
    }

    #[test]
    fn wait_returns_after_signal() {
        let dir = tempfile::tempdir().unwrap();
        let (segment, mut reader) = reader(&dir, 10.0);
        segment.publish(0, b"z", 9.9999);
        reader.notifier().signal().unwrap();
        let seen = reader.wait(Duration::from_secs(1)).unwrap();
        assert_eq!(seen.len(), 1);
    }
}
