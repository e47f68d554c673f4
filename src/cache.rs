// =============================================================================
// Candle Snapshot Cache — time-bounded replay store for closed candles
// =============================================================================
//
// Keeps the most recent closed candles per (instrument, timeframe) so newly
// attached consumers can be brought up to date without touching aggregator
// state. Entries expire a fixed TTL after their last insert and the whole
// cache is cleared on resync.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::debug;

use crate::types::{Candle, CandleKey};

struct CacheEntry {
    candles: VecDeque<Candle>,
    expires_at: Instant,
}

pub struct CandleCache {
    entries: RwLock<HashMap<CandleKey, CacheEntry>>,
    max_candles: usize,
    ttl: Duration,
}

impl CandleCache {
    /// Retain at most `max_candles` closed candles per key, each entry valid
    /// for `ttl` after its last insert.
    pub fn new(max_candles: usize, ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            max_candles,
            ttl,
        }
    }

    /// Record a closed candle. Open candles are never cached — the forming
    /// candle is only observable through live events.
    pub fn insert_closed(&self, candle: Candle) {
        debug_assert!(candle.closed, "only closed candles may be cached");
        if !candle.closed {
            return;
        }

        let key = CandleKey {
            instrument: candle.instrument.clone(),
            timeframe: candle.timeframe,
        };

        let mut map = self.entries.write();
        let entry = map.entry(key).or_insert_with(|| CacheEntry {
            candles: VecDeque::with_capacity(self.max_candles),
            expires_at: Instant::now() + self.ttl,
        });

        entry.candles.push_back(candle);
        while entry.candles.len() > self.max_candles {
            entry.candles.pop_front();
        }
        entry.expires_at = Instant::now() + self.ttl;
    }

    /// Snapshot of the recent closed candles for a key (oldest first), or
    /// `None` when nothing is cached or the entry has expired. Expired
    /// entries are removed on access.
    pub fn snapshot(&self, key: &CandleKey) -> Option<Vec<Candle>> {
        {
            let map = self.entries.read();
            match map.get(key) {
                Some(entry) if entry.expires_at > Instant::now() => {
                    return Some(entry.candles.iter().cloned().collect());
                }
                Some(_) => {}
                None => return None,
            }
        }
        // Entry exists but has expired — invalidate it.
        self.entries.write().remove(key);
        debug!(key = %key, "expired candle snapshot invalidated");
        None
    }

    /// Drop every snapshot (called on resync).
    pub fn clear(&self) {
        let mut map = self.entries.write();
        let n = map.len();
        map.clear();
        if n > 0 {
            debug!(entries = n, "candle cache cleared");
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

// =============================================================================
// Tests
// =============================================================================
