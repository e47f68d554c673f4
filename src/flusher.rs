// =============================================================================
// Batch Flusher — periodic drain of the stream buffer into a durable store
// =============================================================================
//
// Runs on a fixed interval, fully decoupled from the real-time fan-out: its
// failures never affect live candle delivery. Each non-empty instrument
// buffer is drained atomically and appended to the durable store with a
// per-attempt timeout and exponential-backoff retry. After the retry budget
// is exhausted the batch is logged as lost rather than re-queued, so memory
// stays bounded.
// =============================================================================

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, warn};

use crate::stream_buffer::StreamBuffer;
use crate::types::Tick;

/// First retry delay; doubles per attempt.
const BACKOFF_BASE_MS: u64 = 500;

// =============================================================================
// Durable store port
// =============================================================================

/// Destination for drained tick batches.
#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn append_ticks(&self, instrument: &str, ticks: &[Tick]) -> Result<()>;
}

/// Append-only JSONL files, one per instrument.
pub struct JsonlStore {
    dir: PathBuf,
}

impl JsonlStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl DurableStore for JsonlStore {
    async fn append_ticks(&self, instrument: &str, ticks: &[Tick]) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("failed to create durable dir {}", self.dir.display()))?;

        let path = self.dir.join(format!("{instrument}.jsonl"));
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("failed to open durable file {}", path.display()))?;

        let mut lines = String::with_capacity(ticks.len() * 64);
        for tick in ticks {
            lines.push_str(&serde_json::to_string(tick).context("failed to serialise tick")?);
            lines.push('\n');
        }
        file.write_all(lines.as_bytes())
            .await
            .with_context(|| format!("failed to append to {}", path.display()))?;
        file.flush().await?;
        Ok(())
    }
}

// =============================================================================
// BatchFlusher
// =============================================================================

pub struct BatchFlusher {
    buffer: Arc<StreamBuffer>,
    store: Arc<dyn DurableStore>,
    interval: Duration,
    max_attempts: u32,
    attempt_timeout: Duration,
}

impl BatchFlusher {
    pub fn new(
        buffer: Arc<StreamBuffer>,
        store: Arc<dyn DurableStore>,
        interval: Duration,
        max_attempts: u32,
        attempt_timeout: Duration,
    ) -> Self {
        Self {
            buffer,
            store,
            interval,
            max_attempts,
            attempt_timeout,
        }
    }

    /// Timer loop; runs until the task is aborted at shutdown.
    pub async fn run(self) {
        info!(interval = ?self.interval, "batch flusher started");
        let mut ticker = tokio::time::interval(self.interval);
        // The first tick fires immediately; skip it so an empty startup
        // buffer is not drained pointlessly.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            self.flush_once().await;
        }
    }

    /// Drain every non-empty instrument buffer and persist each batch.
    pub async fn flush_once(&self) {
        for (instrument, ticks) in self.buffer.drain_all() {
            self.flush_batch(&instrument, ticks).await;
        }
    }

    async fn flush_batch(&self, instrument: &str, ticks: Vec<Tick>) {
        for attempt in 1..=self.max_attempts {
            let write = self.store.append_ticks(instrument, &ticks);
            match tokio::time::timeout(self.attempt_timeout, write).await {
                Ok(Ok(())) => {
                    debug!(instrument = %instrument, ticks = ticks.len(), "batch flushed");
                    return;
                }
                Ok(Err(e)) => {
                    warn!(
                        instrument = %instrument,
                        attempt,
                        error = %e,
                        "durable store write failed"
                    );
                }
                Err(_) => {
                    warn!(
                        instrument = %instrument,
                        attempt,
                        timeout = ?self.attempt_timeout,
                        "durable store write timed out"
                    );
                }
            }

            if attempt < self.max_attempts {
                let backoff = Duration::from_millis(BACKOFF_BASE_MS << (attempt - 1));
                tokio::time::sleep(backoff).await;
            }
        }

        error!(
            instrument = %instrument,
            ticks = ticks.len(),
            attempts = self.max_attempts,
            "batch lost — retry budget exhausted"
        );
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn tick(instrument: &str, seq: i64) -> Tick {
        Tick {
            instrument: instrument.into(),
            price: 1.0,
            timestamp: seq,
        }
    }

    /// Store that fails the first `fail_first` attempts, then succeeds.
    struct FlakyStore {
        fail_first: u32,
        attempts: Mutex<u32>,
        written: Mutex<Vec<(String, usize)>>,
    }

    impl FlakyStore {
        fn new(fail_first: u32) -> Self {
            Self {
                fail_first,
                attempts: Mutex::new(0),
                written: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl DurableStore for FlakyStore {
        async fn append_ticks(&self, instrument: &str, ticks: &[Tick]) -> Result<()> {
            let mut attempts = self.attempts.lock();
            *attempts += 1;
            if *attempts <= self.fail_first {
                anyhow::bail!("simulated store failure");
            }
            self.written.lock().push((instrument.into(), ticks.len()));
            Ok(())
        }
    }

    /// Store that never answers within any timeout.
    struct HangingStore {
        attempts: Mutex<u32>,
    }

    #[async_trait]
    impl DurableStore for HangingStore {
        async fn append_ticks(&self, _instrument: &str, _ticks: &[Tick]) -> Result<()> {
            *self.attempts.lock() += 1;
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        }
    }

    fn flusher(buffer: Arc<StreamBuffer>, store: Arc<dyn DurableStore>) -> BatchFlusher {
        BatchFlusher::new(
            buffer,
            store,
            Duration::from_secs(30),
            3,
            Duration::from_millis(100),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn flush_drains_buffer_into_store() {
        let buffer = Arc::new(StreamBuffer::new(100));
        for i in 0..10 {
            buffer.push(tick("EURUSD", i));
        }
        buffer.push(tick("GBPUSD", 0));

        let store = Arc::new(FlakyStore::new(0));
        flusher(buffer.clone(), store.clone()).flush_once().await;

        assert!(buffer.is_empty());
        let mut written = store.written.lock().clone();
        written.sort();
        assert_eq!(written, vec![("EURUSD".into(), 10), ("GBPUSD".into(), 1)]);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_with_backoff_then_succeeds() {
        let buffer = Arc::new(StreamBuffer::new(100));
        buffer.push(tick("EURUSD", 1));

        let store = Arc::new(FlakyStore::new(2));
        flusher(buffer.clone(), store.clone()).flush_once().await;

        assert_eq!(*store.attempts.lock(), 3);
        assert_eq!(store.written.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_drop_batch_without_requeue() {
        let buffer = Arc::new(StreamBuffer::new(100));
        buffer.push(tick("EURUSD", 1));

        let store = Arc::new(FlakyStore::new(u32::MAX));
        flusher(buffer.clone(), store.clone()).flush_once().await;

        assert_eq!(*store.attempts.lock(), 3);
        // The batch is lost, not re-queued: buffer stays empty.
        assert!(buffer.is_empty());
        assert!(store.written.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_store_counts_as_failed_attempt() {
        let buffer = Arc::new(StreamBuffer::new(100));
        buffer.push(tick("EURUSD", 1));

        let store = Arc::new(HangingStore {
            attempts: Mutex::new(0),
        });
        flusher(buffer.clone(), store.clone()).flush_once().await;

        // Every attempt timed out; the retry budget was consumed.
        assert_eq!(*store.attempts.lock(), 3);
        assert!(buffer.is_empty());
    }

    #[tokio::test]
    async fn jsonl_store_appends_parseable_lines() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlStore::new(dir.path());

        store
            .append_ticks("EURUSD", &[tick("EURUSD", 1), tick("EURUSD", 2)])
            .await
            .unwrap();
        store
            .append_ticks("EURUSD", &[tick("EURUSD", 3)])
            .await
            .unwrap();

        let content = std::fs::read_to_string(dir.path().join("EURUSD.jsonl")).unwrap();
        let ticks: Vec<Tick> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(ticks.len(), 3);
        assert_eq!(ticks[2].timestamp, 3);
    }
}
