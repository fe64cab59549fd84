//! Cross-process layout of the shared segment.
//!
//! ```text
//! SegmentLayout (64-byte header, then streams)
//! ┌────────┬─────────┬────────────┬─────────┬──────────────────────┐
//! │ magic  │ version │ init_state │ running │ geometry │ pad        │
//! ├────────┴─────────┴────────────┴─────────┴──────────────────────┤
//! │ StreamSlot[0]: next_write_index │ FrameSlot[0..FRAME_CAPACITY]  │
//! │ StreamSlot[1]: next_write_index │ FrameSlot[0..FRAME_CAPACITY]  │
//! └────────────────────────────────────────────────────────────────┘
//! FrameSlot: modification_count │ timestamp (f64 bits) │ payload
//! ```
//!
//! Single writer, many readers, no locks. The writer stores the payload, then
//! the timestamp, then bumps `modification_count`, and only then publishes the
//! slot by advancing `next_write_index` with release ordering. A reader that
//! acquires the index therefore sees a completed frame; the before/after
//! counter comparison catches the writer lapping the ring and rewriting the
//! slot while it is being copied.

use std::sync::atomic::{fence, AtomicI32, AtomicU32, AtomicU64, AtomicU8, Ordering};

use crate::{Error, Result};

pub const SEGMENT_MAGIC: u32 = 0x5348_4D43; // 'SHMC'
pub const SEGMENT_VERSION: u32 = 1;

pub const STREAM_COUNT: usize = 2;
pub const FRAME_CAPACITY: usize = 26;
pub const PAYLOAD_LEN: usize = 1;

const INIT_READY: u32 = 2;
const DISARMED: i32 = -1;

pub type Payload = [u8; PAYLOAD_LEN];

#[repr(C)]
pub struct FrameSlot {
    modification_count: AtomicU32,
    _pad: [u8; 4],
    timestamp_bits: AtomicU64,
    payload: [AtomicU8; PAYLOAD_LEN],
}

/// A consistent copy of one frame.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Sample {
    pub modification_count: u32,
    pub timestamp: f64,
    pub payload: Payload,
}

/// The frame changed while it was being copied.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TornRead {
    pub before: u32,
    pub after: u32,
}

impl FrameSlot {
    pub fn modification_count(&self) -> u32 {
        self.modification_count.load(Ordering::Acquire)
    }

    pub fn read(&self) -> std::result::Result<Sample, TornRead> {
        self.read_observed(|| {})
    }

    /// Seqlock read. `mid_copy` runs between the payload and timestamp copies
    /// so tests can force a write into the middle of a read.
    pub(crate) fn read_observed(
        &self,
        mid_copy: impl FnOnce(),
    ) -> std::result::Result<Sample, TornRead> {
        let before = self.modification_count.load(Ordering::Acquire);
        let mut payload = [0u8; PAYLOAD_LEN];
        for (dst, src) in payload.iter_mut().zip(self.payload.iter()) {
            *dst = src.load(Ordering::Relaxed);
        }
        mid_copy();
        let timestamp = f64::from_bits(self.timestamp_bits.load(Ordering::Relaxed));
        fence(Ordering::Acquire);
        let after = self.modification_count.load(Ordering::Relaxed);
        if before != after {
            return Err(TornRead { before, after });
        }
        Ok(Sample {
            modification_count: after,
            timestamp,
            payload,
        })
    }

    pub(crate) fn write(&self, payload: &Payload, timestamp: f64) -> u32 {
        for (dst, src) in self.payload.iter().zip(payload.iter()) {
            dst.store(*src, Ordering::Relaxed);
        }
        self.timestamp_bits
            .store(timestamp.to_bits(), Ordering::Relaxed);
        self.modification_count.fetch_add(1, Ordering::Release) + 1
    }
}

/// Where the producer stands on a stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Cursor {
    /// Not producing: before the first start or after a stop.
    Disarmed,
    /// `next` is the slot the producer writes next.
    Armed { next: usize },
}

impl Cursor {
    fn from_raw(raw: i32) -> Self {
        if raw < 0 {
            Cursor::Disarmed
        } else {
            Cursor::Armed {
                next: raw as usize % FRAME_CAPACITY,
            }
        }
    }

    /// The most recently completed slot.
    pub fn latest(self) -> Option<usize> {
        match self {
            Cursor::Disarmed => None,
            Cursor::Armed { next } => Some((next + FRAME_CAPACITY - 1) % FRAME_CAPACITY),
        }
    }
}

#[repr(C)]
pub struct StreamSlot {
    next_write_index: AtomicI32,
    _pad: [u8; 4],
    frames: [FrameSlot; FRAME_CAPACITY],
}

impl StreamSlot {
    pub fn cursor(&self) -> Cursor {
        Cursor::from_raw(self.next_write_index.load(Ordering::Acquire))
    }

    pub fn latest_index(&self) -> Option<usize> {
        self.cursor().latest()
    }

    pub fn frame(&self, index: usize) -> &FrameSlot {
        &self.frames[index % FRAME_CAPACITY]
    }

    pub fn frames(&self) -> &[FrameSlot; FRAME_CAPACITY] {
        &self.frames
    }

    pub(crate) fn disarm(&self) {
        self.next_write_index.store(DISARMED, Ordering::Release);
    }

    /// Writes the next slot and publishes it. A disarmed stream restarts at
    /// slot 0. Returns the slot written and its new modification count.
    pub(crate) fn publish(&self, payload: &Payload, timestamp: f64) -> (usize, u32) {
        let index = match self.cursor() {
            Cursor::Disarmed => 0,
            Cursor::Armed { next } => next,
        };
        let count = self.frames[index].write(payload, timestamp);
        let next = (index + 1) % FRAME_CAPACITY;
        self.next_write_index.store(next as i32, Ordering::Release);
        (index, count)
    }
}

#[repr(C, align(64))]
pub struct SegmentLayout {
    magic: AtomicU32,
    version: AtomicU32,
    init_state: AtomicU32,
    running: AtomicI32,
    stream_count: AtomicU32,
    frame_capacity: AtomicU32,
    payload_len: AtomicU32,
    _pad: [u8; 36],
    streams: [StreamSlot; STREAM_COUNT],
}

impl SegmentLayout {
    /// Initializes a zero-filled region and marks it ready for readers.
    pub(crate) fn init(&self) {
        self.init_state.store(1, Ordering::Relaxed);
        self.version.store(SEGMENT_VERSION, Ordering::Relaxed);
        self.stream_count
            .store(STREAM_COUNT as u32, Ordering::Relaxed);
        self.frame_capacity
            .store(FRAME_CAPACITY as u32, Ordering::Relaxed);
        self.payload_len.store(PAYLOAD_LEN as u32, Ordering::Relaxed);
        self.running.store(0, Ordering::Relaxed);
        for stream in &self.streams {
            stream.disarm();
        }
        self.magic.store(SEGMENT_MAGIC, Ordering::Relaxed);
        self.init_state.store(INIT_READY, Ordering::Release);
    }

    pub fn check_ready(&self) -> Result<()> {
        if self.init_state.load(Ordering::Acquire) != INIT_READY {
            return Err(Error::Corrupt("segment not initialized"));
        }
        if self.magic.load(Ordering::Acquire) != SEGMENT_MAGIC {
            return Err(Error::Corrupt("segment magic mismatch"));
        }
        let version = self.version.load(Ordering::Acquire);
        if version != SEGMENT_VERSION {
            return Err(Error::UnsupportedVersion(version));
        }
        let geometry = (
            self.stream_count.load(Ordering::Acquire) as usize,
            self.frame_capacity.load(Ordering::Acquire) as usize,
            self.payload_len.load(Ordering::Acquire) as usize,
        );
        if geometry != (STREAM_COUNT, FRAME_CAPACITY, PAYLOAD_LEN) {
            return Err(Error::Corrupt("segment geometry mismatch"));
        }
        Ok(())
    }

    pub fn running(&self) -> i32 {
        self.running.load(Ordering::Acquire)
    }

    /// Applies `delta` and returns `(before, after)`. Callers hold the table lock.
    pub(crate) fn add_running(&self, delta: i32) -> (i32, i32) {
        let before = self.running.fetch_add(delta, Ordering::AcqRel);
        (before, before + delta)
    }

    pub fn streams(&self) -> &[StreamSlot; STREAM_COUNT] {
        &self.streams
    }

    pub fn stream(&self, index: usize) -> &StreamSlot {
        &self.streams[index]
    }
}
