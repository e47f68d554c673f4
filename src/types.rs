// =============================================================================
// Shared types used across the tickflow streaming core
// =============================================================================

use serde::{Deserialize, Serialize};

// =============================================================================
// Tick
// =============================================================================

/// A single validated price tick. Immutable once created by the normalizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub instrument: String,
    pub price: f64,
    /// Epoch milliseconds.
    pub timestamp: i64,
}

/// Price/timestamp pair carried inside a `price_tick` event.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PricePoint {
    pub price: f64,
    pub timestamp: i64,
}

// =============================================================================
// Timeframe
// =============================================================================

/// Aggregation window size for candles, stored as milliseconds.
///
/// Parses and displays the conventional short form ("1m", "5m", "15m", "1h").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Timeframe(i64);

impl Timeframe {
    pub const fn from_millis(ms: i64) -> Self {
        Self(ms)
    }

    pub fn window_ms(&self) -> i64 {
        self.0
    }

    /// Window floor for a timestamp: `floor(t / window) * window`.
    pub fn window_start(&self, timestamp: i64) -> i64 {
        (timestamp / self.0) * self.0
    }

    /// Parse a short-form timeframe like "30s", "1m", "5m", "1h".
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        if s.len() < 2 {
            return None;
        }
        let (num, unit) = s.split_at(s.len() - 1);
        let n: i64 = num.parse().ok()?;
        if n <= 0 {
            return None;
        }
        let ms = match unit {
            "s" => n * 1_000,
            "m" => n * 60_000,
            "h" => n * 3_600_000,
            _ => return None,
        };
        Some(Self(ms))
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ms = self.0;
        if ms % 3_600_000 == 0 {
            write!(f, "{}h", ms / 3_600_000)
        } else if ms % 60_000 == 0 {
            write!(f, "{}m", ms / 60_000)
        } else {
            write!(f, "{}s", ms / 1_000)
        }
    }
}

impl Serialize for Timeframe {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Timeframe {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid timeframe: {s}")))
    }
}

// =============================================================================
// Candle
// =============================================================================

/// OHLC summary of price movement within one timeframe window.
///
/// Exactly one open (`closed == false`) candle exists per
/// (instrument, timeframe) at any time. The aggregator mutates it in place
/// until it closes, after which it is immutable. Mutating a closed candle is
/// a contract breach and panics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub instrument: String,
    pub timeframe: Timeframe,
    /// Window start, epoch milliseconds, timeframe-aligned.
    pub start_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub closed: bool,
}

impl Candle {
    /// Open a new candle at the window containing `timestamp`.
    pub fn open_at(instrument: &str, timeframe: Timeframe, timestamp: i64, price: f64) -> Self {
        Self {
            instrument: instrument.to_string(),
            timeframe,
            start_time: timeframe.window_start(timestamp),
            open: price,
            high: price,
            low: price,
            close: price,
            closed: false,
        }
    }

    /// Fold a price into the open candle.
    pub fn apply(&mut self, price: f64) {
        assert!(
            !self.closed,
            "attempted to mutate a closed candle {}@{} start={}",
            self.instrument, self.timeframe, self.start_time
        );
        self.high = self.high.max(price);
        self.low = self.low.min(price);
        self.close = price;
    }

    /// Seal the candle. Closing twice is a contract breach.
    pub fn close(&mut self) {
        assert!(
            !self.closed,
            "attempted to close an already-closed candle {}@{} start={}",
            self.instrument, self.timeframe, self.start_time
        );
        self.closed = true;
    }
}

/// Composite key that identifies a unique candle series.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct CandleKey {
    pub instrument: String,
    pub timeframe: Timeframe,
}

impl std::fmt::Display for CandleKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.instrument, self.timeframe)
    }
}

// =============================================================================
// Stream events (outbound)
// =============================================================================

/// Events delivered through the fan-out hub to live consumers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// A validated tick passed through the pipeline.
    PriceTick { instrument: String, tick: PricePoint },
    /// An in-progress or just-closed candle (`candle.closed` tells which).
    CandleUpdate { instrument: String, candle: Candle },
    /// Upstream connectivity was lost.
    StreamError { reason: String },
    /// In-memory state was discarded; consumers must reload.
    Resync,
    /// First tick accepted for a previously unseen instrument.
    AssetDetected { instrument: String },
    /// Focus-state transition (`None` means unfocused).
    AssetFocusChanged { instrument: Option<String> },
}

impl StreamEvent {
    pub fn from_tick(tick: &Tick) -> Self {
        Self::PriceTick {
            instrument: tick.instrument.clone(),
            tick: PricePoint {
                price: tick.price,
                timestamp: tick.timestamp,
            },
        }
    }

    pub fn from_candle(candle: Candle) -> Self {
        Self::CandleUpdate {
            instrument: candle.instrument.clone(),
            candle,
        }
    }

    /// Instrument this event concerns, if it is instrument-scoped.
    ///
    /// Control events (`stream_error`, `resync`, focus transitions) return
    /// `None` and are never filtered by focus or subscription filters.
    pub fn instrument(&self) -> Option<&str> {
        match self {
            Self::PriceTick { instrument, .. } | Self::CandleUpdate { instrument, .. } => {
                Some(instrument)
            }
            _ => None,
        }
    }
}

// =============================================================================
// Connectivity events (internal)
// =============================================================================

/// Connectivity signals consumed by the reconnect/resync controller.
#[derive(Debug, Clone)]
pub enum ConnectivityEvent {
    /// Upstream feed dropped.
    UpstreamLost { reason: String },
    /// Upstream feed came back; triggers a full drop-and-resync.
    UpstreamRestored,
    /// A downstream consumer disconnected; only its subscription goes.
    ConsumerDropped { id: uuid::Uuid },
}

// =============================================================================
// Tests
// =============================================================================
