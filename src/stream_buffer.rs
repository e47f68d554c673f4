// =============================================================================
// Stream Buffer — bounded per-instrument tick queues with drop-oldest policy
// =============================================================================
//
// Holds the most recent ticks per instrument for batch durable writes. Under
// sustained overload the oldest, already-stale ticks are evicted rather than
// blocking the real-time path. A single mutex guards the whole map so that
// `drain_all` is atomic with respect to concurrent pushes: no consumer ever
// observes a partially-drained buffer.
// =============================================================================

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::types::Tick;

pub struct StreamBuffer {
    buffers: Mutex<HashMap<String, VecDeque<Tick>>>,
    capacity: usize,
}

impl StreamBuffer {
    /// Create a buffer retaining at most `capacity` ticks per instrument.
    pub fn new(capacity: usize) -> Self {
        Self {
            buffers: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    /// Append a tick to its instrument's queue, evicting the oldest entry
    /// first when at capacity.
    pub fn push(&self, tick: Tick) {
        let mut map = self.buffers.lock();
        let queue = map
            .entry(tick.instrument.clone())
            .or_insert_with(|| VecDeque::with_capacity(self.capacity));

        if queue.len() == self.capacity {
            queue.pop_front();
            debug!(instrument = %tick.instrument, "stream buffer full — oldest tick evicted");
        }
        queue.push_back(tick);
    }

    /// Atomically return and clear every instrument's ticks, in arrival order.
    pub fn drain_all(&self) -> Vec<(String, Vec<Tick>)> {
        let mut map = self.buffers.lock();
        map.drain()
            .filter(|(_, queue)| !queue.is_empty())
            .map(|(instrument, queue)| (instrument, queue.into_iter().collect()))
            .collect()
    }

    /// Ticks currently buffered for one instrument (test/diagnostic view).
    pub fn len(&self, instrument: &str) -> usize {
        self.buffers.lock().get(instrument).map_or(0, VecDeque::len)
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.lock().values().all(VecDeque::is_empty)
    }

    /// Discard everything (called on resync). Returns the dropped count.
    pub fn clear(&self) -> usize {
        let mut map = self.buffers.lock();
        let dropped: usize = map.values().map(VecDeque::len).sum();
        map.clear();
        if dropped > 0 {
            warn!(dropped, "stream buffer cleared on resync — buffered ticks dropped");
        }
        dropped
    }
}

// =============================================================================
// Tests
// =============================================================================
