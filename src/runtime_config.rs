// =============================================================================
// Runtime Configuration — Pipeline tunables with atomic save
// =============================================================================
//
// Central configuration for the tickflow streaming core. Every tunable lives
// here so the pipeline can be reconfigured without code changes.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash. All fields carry `#[serde(default)]` so that adding new fields never
// breaks loading an older config file.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::Timeframe;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_timeframes() -> Vec<Timeframe> {
    vec![
        Timeframe::parse("1m").unwrap(),
        Timeframe::parse("5m").unwrap(),
    ]
}

fn default_buffer_capacity() -> usize {
    1000
}

fn default_candle_chunk_size() -> usize {
    100
}

fn default_tick_chunk_size() -> usize {
    1000
}

fn default_flush_interval_secs() -> u64 {
    30
}

fn default_flush_max_attempts() -> u32 {
    3
}

fn default_flush_attempt_timeout_secs() -> u64 {
    5
}

fn default_cache_ttl_secs() -> u64 {
    300
}

fn default_cache_max_candles() -> usize {
    500
}

fn default_subscriber_queue_capacity() -> usize {
    256
}

fn default_data_dir() -> String {
    "data".to_string()
}

fn default_durable_dir() -> String {
    "data/durable".to_string()
}

// =============================================================================
// CollectMode
// =============================================================================

/// Which event streams the persistence writer records to disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectMode {
    Tick,
    Candle,
    Both,
    None,
}

impl Default for CollectMode {
    fn default() -> Self {
        Self::Both
    }
}

impl CollectMode {
    pub fn collects_ticks(&self) -> bool {
        matches!(self, Self::Tick | Self::Both)
    }

    pub fn collects_candles(&self) -> bool {
        matches!(self, Self::Candle | Self::Both)
    }
}

impl std::fmt::Display for CollectMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tick => write!(f, "tick"),
            Self::Candle => write!(f, "candle"),
            Self::Both => write!(f, "both"),
            Self::None => write!(f, "none"),
        }
    }
}

impl std::str::FromStr for CollectMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "tick" => Ok(Self::Tick),
            "candle" => Ok(Self::Candle),
            "both" => Ok(Self::Both),
            "none" => Ok(Self::None),
            other => Err(format!("unknown collect mode: {other}")),
        }
    }
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level runtime configuration for the tickflow pipeline.
///
/// Every field has a serde default so that older JSON files missing new fields
/// will still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    // --- Aggregation ---------------------------------------------------------

    /// Timeframes aggregated in parallel for every instrument.
    #[serde(default = "default_timeframes")]
    pub timeframes: Vec<Timeframe>,

    // --- Buffering & backpressure --------------------------------------------

    /// Per-instrument stream buffer capacity (drop-oldest beyond this).
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,

    /// Per-subscriber outbound queue capacity in the fan-out hub.
    #[serde(default = "default_subscriber_queue_capacity")]
    pub subscriber_queue_capacity: usize,

    // --- Persistence ---------------------------------------------------------

    /// Which streams the persistence writer records.
    #[serde(default)]
    pub collect_stream: CollectMode,

    /// Closed-candle rows per file before rotation.
    #[serde(default = "default_candle_chunk_size")]
    pub candle_chunk_size: usize,

    /// Tick rows per file before rotation.
    #[serde(default = "default_tick_chunk_size")]
    pub tick_chunk_size: usize,

    /// Directory for rotating CSV chunks.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    // --- Batch flushing ------------------------------------------------------

    /// Seconds between stream-buffer drains into the durable store.
    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,

    /// Retry budget per batch before it is logged as lost.
    #[serde(default = "default_flush_max_attempts")]
    pub flush_max_attempts: u32,

    /// Per-attempt timeout for durable-store writes.
    #[serde(default = "default_flush_attempt_timeout_secs")]
    pub flush_attempt_timeout_secs: u64,

    /// Directory for the durable JSONL store.
    #[serde(default = "default_durable_dir")]
    pub durable_dir: String,

    // --- Snapshot cache ------------------------------------------------------

    /// Seconds a cached candle snapshot stays valid after its last insert.
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,

    /// Closed candles retained per (instrument, timeframe) for replay.
    #[serde(default = "default_cache_max_candles")]
    pub cache_max_candles: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            timeframes: default_timeframes(),
            buffer_capacity: default_buffer_capacity(),
            subscriber_queue_capacity: default_subscriber_queue_capacity(),
            collect_stream: CollectMode::default(),
            candle_chunk_size: default_candle_chunk_size(),
            tick_chunk_size: default_tick_chunk_size(),
            data_dir: default_data_dir(),
            flush_interval_secs: default_flush_interval_secs(),
            flush_max_attempts: default_flush_max_attempts(),
            flush_attempt_timeout_secs: default_flush_attempt_timeout_secs(),
            durable_dir: default_durable_dir(),
            cache_ttl_secs: default_cache_ttl_secs(),
            cache_max_candles: default_cache_max_candles(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(
            path = %path.display(),
            timeframes = ?config.timeframes.iter().map(|t| t.to_string()).collect::<Vec<_>>(),
            collect_stream = %config.collect_stream,
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise runtime config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.timeframes.len(), 2);
        assert_eq!(cfg.timeframes[0].to_string(), "1m");
        assert_eq!(cfg.buffer_capacity, 1000);
        assert_eq!(cfg.candle_chunk_size, 100);
        assert_eq!(cfg.tick_chunk_size, 1000);
        assert_eq!(cfg.flush_interval_secs, 30);
        assert_eq!(cfg.flush_max_attempts, 3);
        assert_eq!(cfg.collect_stream, CollectMode::Both);
        assert_eq!(cfg.subscriber_queue_capacity, 256);
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: RuntimeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.buffer_capacity, 1000);
        assert_eq!(cfg.collect_stream, CollectMode::Both);
        assert_eq!(cfg.cache_max_candles, 500);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "collect_stream": "tick", "timeframes": ["1m"], "buffer_capacity": 50 }"#;
        let cfg: RuntimeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.collect_stream, CollectMode::Tick);
        assert_eq!(cfg.timeframes.len(), 1);
        assert_eq!(cfg.buffer_capacity, 50);
        assert_eq!(cfg.candle_chunk_size, 100);
    }

    #[test]
    fn collect_mode_parsing() {
        assert_eq!("both".parse::<CollectMode>().unwrap(), CollectMode::Both);
        assert_eq!("TICK".parse::<CollectMode>().unwrap(), CollectMode::Tick);
        assert_eq!("none".parse::<CollectMode>().unwrap(), CollectMode::None);
        assert!("candles!".parse::<CollectMode>().is_err());

        assert!(CollectMode::Both.collects_ticks());
        assert!(CollectMode::Both.collects_candles());
        assert!(!CollectMode::Candle.collects_ticks());
        assert!(!CollectMode::None.collects_candles());
    }

    #[test]
    fn roundtrip_serialisation() {
        let cfg = RuntimeConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: RuntimeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.timeframes, cfg2.timeframes);
        assert_eq!(cfg.collect_stream, cfg2.collect_stream);
        assert_eq!(cfg.buffer_capacity, cfg2.buffer_capacity);
    }
}
