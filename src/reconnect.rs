// =============================================================================
// Reconnect/Resync Controller — one state machine, one reset policy
// =============================================================================
//
// All connectivity handling funnels through this controller instead of being
// scattered across call sites. Upstream loss surfaces to consumers as an
// explicit `stream_error` (never silent staleness); the subsequent reconnect
// triggers the drop-and-resync policy: in-memory state is discarded and a
// `resync` notification tells consumers to reload rather than gap-fill.
// Downstream consumer drops only remove that consumer's subscription.
// =============================================================================

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::hub::FanOutHub;
use crate::pipeline::PipelineHandle;
use crate::types::{ConnectivityEvent, StreamEvent};

const CONTROLLER_INBOX: usize = 64;

pub struct ReconnectController {
    rx: mpsc::Receiver<ConnectivityEvent>,
    pipeline: PipelineHandle,
    hub: Arc<FanOutHub>,
    /// True between an upstream loss and the next restore. The very first
    /// connect is not a reconnect and triggers no resync.
    upstream_lost: bool,
}

impl ReconnectController {
    /// Returns the controller and the sender used by connectivity observers
    /// (the ingest adapter and the feed WebSocket handler).
    pub fn new(
        pipeline: PipelineHandle,
        hub: Arc<FanOutHub>,
    ) -> (Self, mpsc::Sender<ConnectivityEvent>) {
        let (tx, rx) = mpsc::channel(CONTROLLER_INBOX);
        (
            Self {
                rx,
                pipeline,
                hub,
                upstream_lost: false,
            },
            tx,
        )
    }

    pub async fn run(mut self) {
        info!("reconnect controller started");
        while let Some(event) = self.rx.recv().await {
            self.handle(event).await;
        }
        info!("reconnect controller stopped");
    }

    async fn handle(&mut self, event: ConnectivityEvent) {
        match event {
            ConnectivityEvent::UpstreamLost { reason } => {
                warn!(reason = %reason, "upstream connectivity lost");
                self.upstream_lost = true;
                self.hub.publish(&StreamEvent::StreamError { reason });
            }
            ConnectivityEvent::UpstreamRestored => {
                if self.upstream_lost {
                    self.upstream_lost = false;
                    info!("upstream reconnected — running drop-and-resync");
                    self.pipeline.resync().await;
                } else {
                    info!("upstream connected");
                }
            }
            ConnectivityEvent::ConsumerDropped { id } => {
                // Never touches aggregation or other consumers.
                self.hub.unsubscribe(id);
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CandleCache;
    use crate::focus::AssetFocusController;
    use crate::pipeline;
    use crate::stream_buffer::StreamBuffer;
    use crate::types::Timeframe;
    use serde_json::json;
    use std::time::Duration;

    struct Harness {
        handle: PipelineHandle,
        hub: Arc<FanOutHub>,
        connectivity: mpsc::Sender<ConnectivityEvent>,
        buffer: Arc<StreamBuffer>,
        cache: Arc<CandleCache>,
    }

    fn harness() -> Harness {
        let focus = Arc::new(AssetFocusController::new());
        let cache = Arc::new(CandleCache::new(100, Duration::from_secs(60)));
        let buffer = Arc::new(StreamBuffer::new(1000));
        let hub = Arc::new(FanOutHub::new(256));
        let handle = pipeline::spawn(
            vec![Timeframe::parse("1m").unwrap()],
            focus,
            cache.clone(),
            buffer.clone(),
            hub.clone(),
        );
        let (controller, connectivity) = ReconnectController::new(handle.clone(), hub.clone());
        tokio::spawn(controller.run());
        Harness {
            handle,
            hub,
            connectivity,
            buffer,
            cache,
        }
    }

    async fn recv(sub: &mut crate::hub::Subscription) -> StreamEvent {
        tokio::time::timeout(Duration::from_secs(5), sub.recv())
            .await
            .expect("timed out waiting for event")
            .expect("subscription closed")
    }

    #[tokio::test]
    async fn upstream_loss_publishes_stream_error() {
        let h = harness();
        let mut sub = h.hub.subscribe(None);

        h.connectivity
            .send(ConnectivityEvent::UpstreamLost {
                reason: "socket closed".into(),
            })
            .await
            .unwrap();

        match recv(&mut sub).await {
            StreamEvent::StreamError { reason } => assert_eq!(reason, "socket closed"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn reconnect_after_loss_resyncs_before_further_candles() {
        let h = harness();
        let mut sub = h.hub.subscribe(None);

        h.handle
            .ingest_raw(json!({"instrument": "EURUSD", "price": 1.1, "timestamp": 60_000}))
            .await;
        h.handle
            .ingest_raw(json!({"instrument": "EURUSD", "price": 1.2, "timestamp": 130_000}))
            .await;

        // Wait until the rolled candle reaches the snapshot cache, so the
        // resync below demonstrably clears real state.
        for _ in 0..500 {
            if !h.cache.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!h.cache.is_empty());

        h.connectivity
            .send(ConnectivityEvent::UpstreamLost {
                reason: "feed gone".into(),
            })
            .await
            .unwrap();
        h.connectivity
            .send(ConnectivityEvent::UpstreamRestored)
            .await
            .unwrap();

        // Resync applied once the cache is empty again.
        for _ in 0..500 {
            if h.cache.is_empty() && h.buffer.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(h.cache.is_empty());
        h.handle
            .ingest_raw(json!({"instrument": "EURUSD", "price": 1.3, "timestamp": 200_000}))
            .await;

        // Consumer view: stream_error, then resync, then only post-reset
        // candle updates.
        let mut saw_error = false;
        let mut saw_resync = false;
        loop {
            match recv(&mut sub).await {
                StreamEvent::StreamError { .. } => saw_error = true,
                StreamEvent::Resync => {
                    assert!(saw_error, "stream_error must precede resync");
                    saw_resync = true;
                }
                StreamEvent::CandleUpdate { candle, .. } if saw_resync => {
                    assert!(!candle.closed);
                    assert_eq!(candle.start_time, 180_000);
                    break;
                }
                _ => {}
            }
        }
    }

    #[tokio::test]
    async fn first_connect_is_not_a_reconnect() {
        let h = harness();
        let mut sub = h.hub.subscribe(None);

        h.connectivity
            .send(ConnectivityEvent::UpstreamRestored)
            .await
            .unwrap();
        // No resync notification follows; the next event a consumer sees is
        // regular traffic.
        h.handle
            .ingest_raw(json!({"instrument": "EURUSD", "price": 1.1, "timestamp": 1}))
            .await;
        assert!(matches!(
            recv(&mut sub).await,
            StreamEvent::AssetDetected { .. }
        ));
    }

    #[tokio::test]
    async fn consumer_drop_removes_only_that_subscription() {
        let h = harness();
        let doomed = h.hub.subscribe(None);
        let mut survivor = h.hub.subscribe(None);
        let doomed_id = doomed.id();
        assert_eq!(h.hub.subscriber_count(), 2);

        h.connectivity
            .send(ConnectivityEvent::ConsumerDropped { id: doomed_id })
            .await
            .unwrap();

        for _ in 0..100 {
            if h.hub.subscriber_count() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(h.hub.subscriber_count(), 1);

        // Aggregation and remaining consumers unaffected.
        h.handle
            .ingest_raw(json!({"instrument": "EURUSD", "price": 1.1, "timestamp": 1}))
            .await;
        assert!(matches!(
            recv(&mut survivor).await,
            StreamEvent::AssetDetected { .. }
        ));
    }
}
