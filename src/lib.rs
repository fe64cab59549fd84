//! Shared-memory frame broadcast from one producer to many consumers.
//!
//! A server process owns a file-backed segment holding a small ring of frames
//! per stream. Consumers map that segment read-only, register an eventfd over
//! the control socket, and are woken after every batch of writes. Frames are
//! read seqlock-style: a consumer copies a slot and keeps it only if the
//! slot's modification count did not move during the copy.
//!
//! ```no_run
//! use shmcast::control::{Client, ClientConfig};
//!
//! let config = ClientConfig::default();
//! let mut client = Client::connect(&config)?;
//! let report = client.stream(27, config.wait_timeout)?;
//! println!("max latency {:.3}us", report.max_latency_us());
//! client.disconnect()?;
//! # Ok::<(), shmcast::Error>(())
//! ```

#[cfg(not(target_os = "linux"))]
compile_error!("shmcast relies on eventfd, futex and SCM_RIGHTS and only builds on Linux");

pub mod activity;
pub mod clock;
pub mod consumer;
pub mod control;
pub mod engine;
pub mod error;
pub mod layout;
pub mod lock;
pub mod mmap;
pub mod monitor;
pub mod notifier;
pub mod process;
pub mod properties;
pub mod segment;
pub mod server;
pub mod session;
pub mod wait;

pub use clock::{Clock, MonotonicClock, QuantaClock};
pub use consumer::{ConsumerReader, Observation, StreamStats, LATENCY_NOISE_FLOOR};
pub use control::{Client, ClientConfig, ControlChannel};
pub use engine::{EngineConfig, EngineState, FrameSource, LetterSource, ProducerEngine};
pub use error::{Error, Result};
pub use layout::{Sample, FRAME_CAPACITY, STREAM_COUNT};
pub use segment::{SegmentRef, SegmentView, SharedSegment};
pub use server::{RuntimePaths, Server, ServerConfig, ServerParts};
pub use session::{SessionHandle, SessionTable, MAX_SESSIONS};
