// =============================================================================
// Central Application State — tickflow streaming core
// =============================================================================
//
// Ties the pipeline subsystems together and exposes the control operations
// consumed by the external CLI/config layer. All subsystems manage their own
// interior mutability; AppState just holds the Arcs and the pipeline handle.
// =============================================================================

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::cache::CandleCache;
use crate::focus::AssetFocusController;
use crate::hub::FanOutHub;
use crate::pipeline::{self, PipelineHandle};
use crate::reconnect::ReconnectController;
use crate::runtime_config::RuntimeConfig;
use crate::stream_buffer::StreamBuffer;
use crate::types::{ConnectivityEvent, StreamEvent};

pub struct AppState {
    pub runtime_config: Arc<RwLock<RuntimeConfig>>,

    // ── Pipeline subsystems ─────────────────────────────────────────────
    pub hub: Arc<FanOutHub>,
    pub focus: Arc<AssetFocusController>,
    pub stream_buffer: Arc<StreamBuffer>,
    pub candle_cache: Arc<CandleCache>,
    pub pipeline: PipelineHandle,

    /// Inbox of the reconnect/resync controller.
    pub connectivity: mpsc::Sender<ConnectivityEvent>,

    /// Instant when the core was started. Used for uptime reporting.
    pub start_time: Instant,
}

impl AppState {
    /// Build all subsystems from the given configuration and spawn the
    /// pipeline and reconnect-controller tasks. Must run inside a tokio
    /// runtime.
    pub fn new(config: RuntimeConfig) -> Arc<Self> {
        let hub = Arc::new(FanOutHub::new(config.subscriber_queue_capacity));
        let focus = Arc::new(AssetFocusController::new());
        let stream_buffer = Arc::new(StreamBuffer::new(config.buffer_capacity));
        let candle_cache = Arc::new(CandleCache::new(
            config.cache_max_candles,
            Duration::from_secs(config.cache_ttl_secs),
        ));

        let pipeline = pipeline::spawn(
            config.timeframes.clone(),
            focus.clone(),
            candle_cache.clone(),
            stream_buffer.clone(),
            hub.clone(),
        );

        let (controller, connectivity) = ReconnectController::new(pipeline.clone(), hub.clone());
        tokio::spawn(controller.run());

        Arc::new(Self {
            runtime_config: Arc::new(RwLock::new(config)),
            hub,
            focus,
            stream_buffer,
            candle_cache,
            pipeline,
            connectivity,
            start_time: Instant::now(),
        })
    }

    // ── Control operations (external CLI/config layer) ──────────────────

    /// `start_stream(instrument)` — focus on one instrument.
    pub fn start_stream(&self, instrument: &str) {
        if self.focus.set_focus(instrument) {
            self.hub.publish(&StreamEvent::AssetFocusChanged {
                instrument: Some(instrument.to_string()),
            });
        }
    }

    /// `stop_stream()` — back to pass-everything mode.
    pub fn stop_stream(&self) {
        if self.focus.release_focus() {
            self.hub
                .publish(&StreamEvent::AssetFocusChanged { instrument: None });
        }
    }

    /// `change_asset(instrument)` — switch focus to a different instrument.
    pub fn change_asset(&self, instrument: &str) {
        self.start_stream(instrument);
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn control_operations_publish_focus_transitions() {
        let state = AppState::new(RuntimeConfig::default());
        let mut sub = state.hub.subscribe(None);

        state.start_stream("EURUSD");
        match sub.recv().await.unwrap() {
            StreamEvent::AssetFocusChanged { instrument } => {
                assert_eq!(instrument.as_deref(), Some("EURUSD"));
            }
            other => panic!("unexpected event: {other:?}"),
        }

        // Idempotent re-focus publishes nothing; the next event is the
        // release.
        state.start_stream("EURUSD");
        state.stop_stream();
        match sub.recv().await.unwrap() {
            StreamEvent::AssetFocusChanged { instrument } => assert!(instrument.is_none()),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn change_asset_switches_focus() {
        let state = AppState::new(RuntimeConfig::default());
        state.start_stream("EURUSD");
        state.change_asset("GBPUSD");
        let snap = state.focus.snapshot();
        assert!(snap.focused);
        assert_eq!(snap.instrument.as_deref(), Some("GBPUSD"));
    }
}
