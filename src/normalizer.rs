// =============================================================================
// Tick Normalizer — validates raw upstream events into canonical Ticks
// =============================================================================
//
// The normalizer is the only consumer of the raw upstream boundary. It is
// stateless across instruments except for the per-instrument last-accepted
// timestamp, which enforces monotonicity: a tick older than the last accepted
// tick for its instrument is discarded, never reordered.
// =============================================================================

use std::collections::HashMap;

use serde_json::Value;
use tracing::debug;

use crate::types::Tick;

// =============================================================================
// Discard reasons
// =============================================================================

/// Why a raw upstream event was discarded. Logged, never propagated.
#[derive(Debug, Clone, PartialEq)]
pub enum DiscardReason {
    MissingInstrument,
    MissingPrice,
    /// Price was NaN, infinite, zero or negative.
    InvalidPrice(f64),
    MissingTimestamp,
    /// Timestamp older than the last accepted tick for this instrument.
    StaleTimestamp { last: i64, got: i64 },
}

impl std::fmt::Display for DiscardReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingInstrument => write!(f, "missing or empty instrument"),
            Self::MissingPrice => write!(f, "missing or unparsable price"),
            Self::InvalidPrice(p) => write!(f, "price not finite and positive: {p}"),
            Self::MissingTimestamp => write!(f, "missing or unparsable timestamp"),
            Self::StaleTimestamp { last, got } => {
                write!(f, "stale timestamp {got} (last accepted {last})")
            }
        }
    }
}

// =============================================================================
// TickNormalizer
// =============================================================================

/// Validates raw upstream events and converts them into `Tick`s.
///
/// Owned by the pipeline dispatcher task; no internal locking needed.
pub struct TickNormalizer {
    /// Last accepted timestamp per instrument (monotonicity watermark).
    last_seen: HashMap<String, i64>,
}

impl TickNormalizer {
    pub fn new() -> Self {
        Self {
            last_seen: HashMap::new(),
        }
    }

    /// Validate one raw event. On success the instrument's watermark advances.
    ///
    /// Accepted raw shapes are loose on purpose — the upstream collaborator
    /// sends `instrument`/`asset`, `price`/`value`, `timestamp`/`time`, with
    /// numbers either as JSON numbers or strings.
    pub fn normalize(&mut self, raw: &Value) -> Result<Tick, DiscardReason> {
        let instrument = raw
            .get("instrument")
            .or_else(|| raw.get("asset"))
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or(DiscardReason::MissingInstrument)?;

        let price = raw
            .get("price")
            .or_else(|| raw.get("value"))
            .and_then(parse_f64)
            .ok_or(DiscardReason::MissingPrice)?;
        if !price.is_finite() || price <= 0.0 {
            return Err(DiscardReason::InvalidPrice(price));
        }

        let timestamp = raw
            .get("timestamp")
            .or_else(|| raw.get("time"))
            .and_then(parse_i64)
            .ok_or(DiscardReason::MissingTimestamp)?;

        if let Some(&last) = self.last_seen.get(instrument) {
            if timestamp < last {
                return Err(DiscardReason::StaleTimestamp {
                    last,
                    got: timestamp,
                });
            }
        }
        self.last_seen.insert(instrument.to_string(), timestamp);

        Ok(Tick {
            instrument: instrument.to_string(),
            price,
            timestamp,
        })
    }

    /// Whether this instrument has been seen before.
    pub fn knows(&self, instrument: &str) -> bool {
        self.last_seen.contains_key(instrument)
    }

    /// Drop all monotonicity watermarks (called on resync).
    pub fn reset(&mut self) {
        let n = self.last_seen.len();
        self.last_seen.clear();
        debug!(instruments = n, "normalizer watermarks cleared");
    }
}

impl Default for TickNormalizer {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Loose-JSON helpers
// =============================================================================

/// Numbers arrive either as JSON numbers or as strings.
fn parse_f64(val: &Value) -> Option<f64> {
    match val {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn parse_i64(val: &Value) -> Option<i64> {
    match val {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

// =============================================================================
// Tests
// =============================================================================
