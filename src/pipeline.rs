// =============================================================================
// Pipeline — dispatcher and egress tasks tying the core together
// =============================================================================
//
// Data flow: raw event → normalizer → aggregator workers → egress (snapshot
// cache, focus gate) → fan-out hub → subscribers. All cross-component
// communication is message passing; the dispatcher exclusively owns the
// normalizer and the aggregator worker set.
//
// Resync runs through the dispatcher inbox so it is strictly ordered against
// tick processing: every worker clears its open candle (acked) before the
// resync control message reaches the egress task, and egress drains the
// already-queued candle events before clearing the snapshot cache and
// publishing the `resync` notification. Post-reset candle updates can only
// follow it.
// =============================================================================

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::aggregator::Aggregator;
use crate::cache::CandleCache;
use crate::focus::AssetFocusController;
use crate::hub::{FanOutHub, Subscription};
use crate::normalizer::TickNormalizer;
use crate::stream_buffer::StreamBuffer;
use crate::types::{StreamEvent, Tick, Timeframe};

const DISPATCHER_INBOX: usize = 1024;
const EGRESS_QUEUE: usize = 1024;

// =============================================================================
// Handle
// =============================================================================

enum PipelineMsg {
    Raw(Value),
    Resync { ack: oneshot::Sender<()> },
}

/// Control messages from the dispatcher to the egress task.
enum EgressCtl {
    Resync { ack: oneshot::Sender<()> },
}

/// Cloneable entry point used by the ingest adapter and the reconnect
/// controller.
#[derive(Clone)]
pub struct PipelineHandle {
    tx: mpsc::Sender<PipelineMsg>,
}

impl PipelineHandle {
    /// Feed one raw upstream event. Returns false once the pipeline is gone.
    pub async fn ingest_raw(&self, raw: Value) -> bool {
        self.tx.send(PipelineMsg::Raw(raw)).await.is_ok()
    }

    /// Full drop-and-resync: open candles, normalizer watermarks, snapshot
    /// cache and stream buffer are all discarded, then `resync` is published.
    /// Resolves once the reset has been applied everywhere, including the
    /// egress task.
    pub async fn resync(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(PipelineMsg::Resync { ack: ack_tx }).await.is_ok() {
            let _ = ack_rx.await;
        }
    }
}

// =============================================================================
// Spawning
// =============================================================================

/// Spawn the dispatcher and egress tasks and return the ingest handle.
pub fn spawn(
    timeframes: Vec<Timeframe>,
    focus: Arc<AssetFocusController>,
    cache: Arc<CandleCache>,
    buffer: Arc<StreamBuffer>,
    hub: Arc<FanOutHub>,
) -> PipelineHandle {
    let (msg_tx, msg_rx) = mpsc::channel(DISPATCHER_INBOX);
    let (egress_tx, egress_rx) = mpsc::channel(EGRESS_QUEUE);
    let (ctl_tx, ctl_rx) = mpsc::channel(8);

    let aggregator = Aggregator::new(timeframes, egress_tx.clone());
    tokio::spawn(run_dispatcher(msg_rx, aggregator, egress_tx, ctl_tx, buffer));
    tokio::spawn(run_egress(egress_rx, ctl_rx, focus, cache, hub));

    PipelineHandle { tx: msg_tx }
}

// =============================================================================
// Dispatcher
// =============================================================================

async fn run_dispatcher(
    mut rx: mpsc::Receiver<PipelineMsg>,
    mut aggregator: Aggregator,
    egress: mpsc::Sender<StreamEvent>,
    ctl: mpsc::Sender<EgressCtl>,
    buffer: Arc<StreamBuffer>,
) {
    let mut normalizer = TickNormalizer::new();
    let mut seen: HashSet<String> = HashSet::new();
    info!("pipeline dispatcher started");

    while let Some(msg) = rx.recv().await {
        match msg {
            PipelineMsg::Raw(raw) => match normalizer.normalize(&raw) {
                Ok(tick) => {
                    if seen.insert(tick.instrument.clone()) {
                        info!(instrument = %tick.instrument, "new instrument detected");
                        if egress
                            .send(StreamEvent::AssetDetected {
                                instrument: tick.instrument.clone(),
                            })
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    if egress.send(StreamEvent::from_tick(&tick)).await.is_err() {
                        break;
                    }
                    aggregator.route(&tick).await;
                }
                Err(reason) => {
                    warn!(reason = %reason, "raw tick discarded");
                }
            },
            PipelineMsg::Resync { ack } => {
                // Worker acks guarantee every pre-reset candle event is
                // already queued ahead of the control message below.
                aggregator.reset().await;
                normalizer.reset();
                seen.clear();
                let dropped = buffer.clear();
                debug!(buffered_dropped = dropped, "pipeline state cleared for resync");
                if ctl.send(EgressCtl::Resync { ack }).await.is_err() {
                    break;
                }
            }
        }
    }
    info!("pipeline dispatcher stopped");
}

// =============================================================================
// Egress
// =============================================================================

async fn run_egress(
    mut rx: mpsc::Receiver<StreamEvent>,
    mut ctl: mpsc::Receiver<EgressCtl>,
    focus: Arc<AssetFocusController>,
    cache: Arc<CandleCache>,
    hub: Arc<FanOutHub>,
) {
    loop {
        // Biased towards the event queue: a resync control message is only
        // taken once every already-queued (pre-reset) event has been
        // processed, so no stale candle lands in the cache after the clear.
        tokio::select! {
            biased;

            event = rx.recv() => {
                let Some(event) = event else { break };
                // Closed candles are cached for every instrument, focused or
                // not, so a refocused consumer can be replayed without a gap.
                if let StreamEvent::CandleUpdate { candle, .. } = &event {
                    if candle.closed {
                        cache.insert_closed(candle.clone());
                    }
                }
                if focus.allows(&event) {
                    hub.publish(&event);
                }
            }

            msg = ctl.recv() => {
                let Some(EgressCtl::Resync { ack }) = msg else { break };
                cache.clear();
                hub.publish(&StreamEvent::Resync);
                let _ = ack.send(());
            }
        }
    }
}

// =============================================================================
// Buffer feeder
// =============================================================================

/// Hub subscriber pushing delivered ticks into the stream buffer for the
/// batch flusher.
pub async fn run_buffer_feeder(mut subscription: Subscription, buffer: Arc<StreamBuffer>) {
    while let Some(event) = subscription.recv().await {
        if let StreamEvent::PriceTick { instrument, tick } = event {
            buffer.push(Tick {
                instrument,
                price: tick.price,
                timestamp: tick.timestamp,
            });
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    struct Harness {
        handle: PipelineHandle,
        hub: Arc<FanOutHub>,
        focus: Arc<AssetFocusController>,
        cache: Arc<CandleCache>,
        buffer: Arc<StreamBuffer>,
    }

    fn harness() -> Harness {
        let focus = Arc::new(AssetFocusController::new());
        let cache = Arc::new(CandleCache::new(100, Duration::from_secs(60)));
        let buffer = Arc::new(StreamBuffer::new(1000));
        let hub = Arc::new(FanOutHub::new(256));
        let handle = spawn(
            vec![Timeframe::parse("1m").unwrap()],
            focus.clone(),
            cache.clone(),
            buffer.clone(),
            hub.clone(),
        );
        Harness {
            handle,
            hub,
            focus,
            cache,
            buffer,
        }
    }

    fn raw(instrument: &str, price: f64, timestamp: i64) -> Value {
        json!({"instrument": instrument, "price": price, "timestamp": timestamp})
    }

    async fn recv(sub: &mut Subscription) -> StreamEvent {
        tokio::time::timeout(Duration::from_secs(5), sub.recv())
            .await
            .expect("timed out waiting for event")
            .expect("subscription closed")
    }

    /// Skip ticks and announcements until the next candle event.
    async fn next_candle(sub: &mut Subscription) -> crate::types::Candle {
        loop {
            match recv(sub).await {
                StreamEvent::CandleUpdate { candle, .. } => return candle,
                StreamEvent::PriceTick { .. } | StreamEvent::AssetDetected { .. } => {}
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn end_to_end_one_minute_scenario() {
        let h = harness();
        let mut sub = h.hub.subscribe(None);
        let t0: i64 = 1_700_000_040_000; // minute-aligned

        h.handle.ingest_raw(raw("EURUSD", 1.1000, t0)).await;
        let candle = next_candle(&mut sub).await;
        assert!(!candle.closed);
        assert!((candle.open - 1.1000).abs() < f64::EPSILON);
        assert_eq!(candle.start_time, t0);

        h.handle.ingest_raw(raw("EURUSD", 1.1005, t0 + 10_000)).await;
        let candle = next_candle(&mut sub).await;
        assert!(!candle.closed);
        assert!((candle.open - 1.1000).abs() < f64::EPSILON);
        assert!((candle.high - 1.1005).abs() < f64::EPSILON);
        assert!((candle.low - 1.1000).abs() < f64::EPSILON);
        assert!((candle.close - 1.1005).abs() < f64::EPSILON);

        // Third tick rolls the window: closed candle, then fresh open candle.
        h.handle.ingest_raw(raw("EURUSD", 1.0995, t0 + 70_000)).await;
        let sealed = next_candle(&mut sub).await;
        assert!(sealed.closed);
        assert_eq!(sealed.start_time, t0);
        assert!((sealed.close - 1.1005).abs() < f64::EPSILON);

        let fresh = next_candle(&mut sub).await;
        assert!(!fresh.closed);
        assert_eq!(fresh.start_time, t0 + 60_000);
        assert!((fresh.open - 1.0995).abs() < f64::EPSILON);
        assert_eq!(fresh.open, fresh.high);
        assert_eq!(fresh.open, fresh.low);
        assert_eq!(fresh.open, fresh.close);
    }

    #[tokio::test]
    async fn focus_filters_events_but_aggregation_continues() {
        let h = harness();
        h.focus.set_focus("EURUSD");
        let mut sub = h.hub.subscribe(None);

        // GBPUSD ticks roll a full window so a candle closes while filtered.
        h.handle.ingest_raw(raw("GBPUSD", 1.2500, 60_000)).await;
        h.handle.ingest_raw(raw("GBPUSD", 1.2510, 130_000)).await;
        h.handle.ingest_raw(raw("EURUSD", 1.1000, 130_000)).await;

        // Everything instrument-scoped reaching the hub is EURUSD.
        loop {
            match recv(&mut sub).await {
                StreamEvent::PriceTick { instrument, .. } => assert_eq!(instrument, "EURUSD"),
                StreamEvent::CandleUpdate { instrument, .. } => {
                    assert_eq!(instrument, "EURUSD");
                    break;
                }
                StreamEvent::AssetDetected { .. } => {}
                other => panic!("unexpected event: {other:?}"),
            }
        }

        // The filtered instrument's candle state kept aggregating in the
        // background: its closed candle lands in the snapshot cache.
        let key = crate::types::CandleKey {
            instrument: "GBPUSD".into(),
            timeframe: Timeframe::parse("1m").unwrap(),
        };
        let mut snap = None;
        for _ in 0..500 {
            if let Some(v) = h.cache.snapshot(&key) {
                snap = Some(v);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let snap = snap.expect("closed candle never reached the cache");
        assert_eq!(snap.len(), 1);
        assert!((snap[0].open - 1.2500).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn resync_clears_state_and_orders_notification_first() {
        let h = harness();
        let mut sub = h.hub.subscribe(None);

        h.handle.ingest_raw(raw("EURUSD", 1.1000, 60_000)).await;
        h.handle.ingest_raw(raw("EURUSD", 1.1005, 130_000)).await;

        h.handle.resync().await;
        assert!(h.buffer.is_empty());
        assert!(h.cache.is_empty());

        // A post-resync tick in an *older* window is accepted (watermarks
        // cleared) and opens a fresh candle.
        h.handle.ingest_raw(raw("EURUSD", 1.2000, 30_000)).await;

        // Drain until the resync marker; no candle_update may follow it
        // before the fresh post-reset candle.
        let mut saw_resync = false;
        loop {
            match recv(&mut sub).await {
                StreamEvent::Resync => {
                    saw_resync = true;
                }
                StreamEvent::CandleUpdate { candle, .. } if saw_resync => {
                    assert!(!candle.closed);
                    assert_eq!(candle.start_time, 0);
                    assert!((candle.open - 1.2000).abs() < f64::EPSILON);
                    break;
                }
                _ => {}
            }
        }
        assert!(saw_resync);
    }

    #[tokio::test]
    async fn discarded_raw_events_produce_nothing() {
        let h = harness();
        let mut sub = h.hub.subscribe(None);

        h.handle
            .ingest_raw(json!({"instrument": "EURUSD", "price": -4.0, "timestamp": 1}))
            .await;
        h.handle.ingest_raw(json!({"price": 1.0})).await;
        // A valid event afterwards is the first thing delivered.
        h.handle.ingest_raw(raw("EURUSD", 1.1, 60_000)).await;

        assert!(matches!(
            recv(&mut sub).await,
            StreamEvent::AssetDetected { .. }
        ));
    }

    #[tokio::test]
    async fn buffer_feeder_collects_delivered_ticks() {
        let h = harness();
        let feeder_sub = h.hub.subscribe(None);
        tokio::spawn(run_buffer_feeder(feeder_sub, h.buffer.clone()));

        let mut probe = h.hub.subscribe(None);
        h.handle.ingest_raw(raw("EURUSD", 1.1, 60_000)).await;
        // Wait until the event round-trips to our probe subscriber.
        while !matches!(recv(&mut probe).await, StreamEvent::PriceTick { .. }) {}

        // Give the feeder a moment to drain its own queue.
        for _ in 0..100 {
            if h.buffer.len("EURUSD") == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(h.buffer.len("EURUSD"), 1);
    }
}
