use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::engine::ProducerEngine;
use crate::Result;

/// Turns changes of the segment's `running` count into engine start/stop
/// calls, once per edge.
pub struct ActivityController {
    engine: Arc<ProducerEngine>,
    starts: AtomicU64,
    stops: AtomicU64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Edge {
    Started,
    Stopped,
    Unchanged,
}

impl ActivityController {
    pub fn new(engine: Arc<ProducerEngine>) -> Self {
        Self {
            engine,
            starts: AtomicU64::new(0),
            stops: AtomicU64::new(0),
        }
    }

    pub fn engine(&self) -> &Arc<ProducerEngine> {
        &self.engine
    }

    /// Called with the counter value before and after a change, under the
    /// table lock.
    pub fn on_running_changed(&self, before: i32, after: i32) -> Result<Edge> {
        if before <= 0 && after > 0 {
            self.starts.fetch_add(1, Ordering::Relaxed);
            self.engine.start()?;
            return Ok(Edge::Started);
        }
        if before > 0 && after <= 0 {
            self.stops.fetch_add(1, Ordering::Relaxed);
            self.engine.stop()?;
            return Ok(Edge::Stopped);
        }
        Ok(Edge::Unchanged)
    }

    /// `(starts, stops)` issued so far.
    pub fn edges(&self) -> (u64, u64) {
        (
            self.starts.load(Ordering::Relaxed),
            self.stops.load(Ordering::Relaxed),
        )
    }
}
