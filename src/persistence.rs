// =============================================================================
// Persistence Writer — rotating CSV files for closed candles and raw ticks
// =============================================================================
//
// Runs on its own task fed by a hub subscription, so file I/O never touches
// the real-time tick path. Only candles with `closed == true` are ever
// written — the open/forming candle is filtered here by construction.
//
// Files are named `{stream}_{session}_partNNN.csv`; the session prefix is
// random per run so chunks never collide across restarts. When a chunk
// reaches its configured row count the file is closed and the next part
// opened. A write failure puts that stream into degraded mode (further rows
// dropped, logged once) until a manual reset — it never crashes the pipeline.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::hub::Subscription;
use crate::runtime_config::CollectMode;
use crate::types::{Candle, StreamEvent, Tick};

// =============================================================================
// Chunk file
// =============================================================================

struct ChunkFile {
    file: File,
    path: PathBuf,
    rows: usize,
    part: u32,
}

fn open_chunk(dir: &Path, stream: &str, session: &str, part: u32) -> Result<ChunkFile> {
    let path = dir.join(format!("{stream}_{session}_part{part:03}.csv"));
    let file = File::create(&path)
        .with_context(|| format!("failed to create chunk file {}", path.display()))?;
    Ok(ChunkFile {
        file,
        path,
        rows: 0,
        part,
    })
}

fn utc_string(epoch_ms: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(epoch_ms)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|| epoch_ms.to_string())
}

// =============================================================================
// PersistenceWriter
// =============================================================================

pub struct PersistenceWriter {
    data_dir: PathBuf,
    session: String,
    mode: CollectMode,
    candle_chunk_size: usize,
    tick_chunk_size: usize,
    /// One rotating file per stream label (`EURUSD_1m` or `EURUSD_ticks`).
    files: HashMap<String, ChunkFile>,
    /// Streams that hit a write failure; rows are dropped until reset.
    degraded: HashSet<String>,
}

impl PersistenceWriter {
    pub fn new(
        data_dir: impl Into<PathBuf>,
        mode: CollectMode,
        candle_chunk_size: usize,
        tick_chunk_size: usize,
    ) -> Self {
        let session = Uuid::new_v4().simple().to_string()[..8].to_string();
        Self {
            data_dir: data_dir.into(),
            session,
            mode,
            candle_chunk_size,
            tick_chunk_size,
            files: HashMap::new(),
            degraded: HashSet::new(),
        }
    }

    /// Consume hub events until the subscription ends.
    pub async fn run(mut self, mut subscription: Subscription) {
        info!(
            dir = %self.data_dir.display(),
            session = %self.session,
            mode = %self.mode,
            "persistence writer started"
        );
        while let Some(event) = subscription.recv().await {
            self.handle_event(&event);
        }
        info!("persistence writer stopped");
    }

    pub fn handle_event(&mut self, event: &StreamEvent) {
        match event {
            StreamEvent::CandleUpdate { candle, .. }
                if candle.closed && self.mode.collects_candles() =>
            {
                self.write_candle(candle);
            }
            StreamEvent::PriceTick { instrument, tick } if self.mode.collects_ticks() => {
                self.write_tick(&Tick {
                    instrument: instrument.clone(),
                    price: tick.price,
                    timestamp: tick.timestamp,
                });
            }
            _ => {}
        }
    }

    fn write_candle(&mut self, candle: &Candle) {
        let stream = format!("{}_{}", candle.instrument, candle.timeframe);
        let row = format!(
            "{},{},{},{},{}\n",
            utc_string(candle.start_time),
            candle.open,
            candle.close,
            candle.high,
            candle.low
        );
        self.write_row(&stream, &row, self.candle_chunk_size);
    }

    fn write_tick(&mut self, tick: &Tick) {
        let stream = format!("{}_ticks", tick.instrument);
        let row = format!(
            "{},{},{}\n",
            utc_string(tick.timestamp),
            tick.instrument,
            tick.price
        );
        self.write_row(&stream, &row, self.tick_chunk_size);
    }

    fn write_row(&mut self, stream: &str, row: &str, chunk_size: usize) {
        if self.degraded.contains(stream) {
            return;
        }
        if let Err(e) = self.try_write_row(stream, row, chunk_size) {
            error!(stream = %stream, error = %e, "persistence write failed — stream degraded");
            self.degraded.insert(stream.to_string());
            self.files.remove(stream);
        }
    }

    fn try_write_row(&mut self, stream: &str, row: &str, chunk_size: usize) -> Result<()> {
        if !self.files.contains_key(stream) {
            std::fs::create_dir_all(&self.data_dir).with_context(|| {
                format!("failed to create data dir {}", self.data_dir.display())
            })?;
            let chunk = open_chunk(&self.data_dir, stream, &self.session, 1)?;
            info!(path = %chunk.path.display(), "chunk file opened");
            self.files.insert(stream.to_string(), chunk);
        }
        // Infallible: inserted just above when missing.
        let chunk = self.files.get_mut(stream).unwrap();

        chunk
            .file
            .write_all(row.as_bytes())
            .with_context(|| format!("failed to append to {}", chunk.path.display()))?;
        chunk.rows += 1;

        if chunk.rows >= chunk_size {
            let next_part = chunk.part + 1;
            info!(path = %chunk.path.display(), rows = chunk.rows, "chunk full — rotating");
            let fresh = open_chunk(&self.data_dir, stream, &self.session, next_part)?;
            self.files.insert(stream.to_string(), fresh);
        }
        Ok(())
    }

    /// Manual recovery from degraded mode for all streams.
    pub fn reset_degraded(&mut self) {
        if !self.degraded.is_empty() {
            warn!(streams = self.degraded.len(), "degraded persistence streams reset");
            self.degraded.clear();
        }
    }

    pub fn is_degraded(&self, stream: &str) -> bool {
        self.degraded.contains(stream)
    }

    pub fn session(&self) -> &str {
        &self.session
    }
}

// =============================================================================
// Tests
// =============================================================================
