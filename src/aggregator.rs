// =============================================================================
// Candle Aggregator — one OHLC state machine per (instrument, timeframe)
// =============================================================================
//
// Each (instrument, timeframe) pair runs as its own tokio task owning its
// state machine exclusively; ticks and control commands arrive over a channel
// and emitted candle events are multiplexed into a single egress channel.
// External readers only ever see candle state through published events.
//
// A panicking worker (invariant violation — a logic defect, never a transient
// condition) takes down only its own key; the router prunes it and the
// remaining workers are unaffected.
// =============================================================================

use std::collections::HashMap;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

use crate::types::{Candle, CandleKey, StreamEvent, Tick, Timeframe};

/// Inbox capacity per (instrument, timeframe) worker.
const WORKER_INBOX: usize = 64;

// =============================================================================
// CandleMachine
// =============================================================================

/// OHLC state machine for a single (instrument, timeframe).
///
/// States: no candle → open candle (same window updates in place) → roll on
/// the first tick of a later window, closing the old candle and opening a new
/// one.
pub struct CandleMachine {
    key: CandleKey,
    current: Option<Candle>,
    /// Ticks rejected for falling in a past window. The normalizer's
    /// monotonicity rule already filters these; this is re-checked here.
    rejected_past: u64,
}

impl CandleMachine {
    pub fn new(key: CandleKey) -> Self {
        Self {
            key,
            current: None,
            rejected_past: 0,
        }
    }

    /// Feed one tick. Returns `(closed, update)`:
    ///
    /// * `closed` — the previous candle, sealed, when this tick rolled the
    ///   window.
    /// * `update` — the open candle after applying the tick (a fresh candle
    ///   when the window rolled or no candle existed).
    ///
    /// A tick in a past window returns `(None, None)`.
    pub fn on_tick(&mut self, tick: &Tick) -> (Option<Candle>, Option<Candle>) {
        let window = self.key.timeframe.window_start(tick.timestamp);

        match self.current.as_mut() {
            Some(candle) if window == candle.start_time => {
                candle.apply(tick.price);
                (None, Some(candle.clone()))
            }
            Some(candle) if window > candle.start_time => {
                candle.close();
                let closed = self.current.take();
                let fresh = Candle::open_at(
                    &self.key.instrument,
                    self.key.timeframe,
                    tick.timestamp,
                    tick.price,
                );
                self.current = Some(fresh.clone());
                (closed, Some(fresh))
            }
            Some(candle) => {
                // Past window relative to the open candle.
                self.rejected_past += 1;
                warn!(
                    key = %self.key,
                    tick_window = window,
                    open_window = candle.start_time,
                    rejected = self.rejected_past,
                    "tick in past window rejected"
                );
                (None, None)
            }
            None => {
                let fresh = Candle::open_at(
                    &self.key.instrument,
                    self.key.timeframe,
                    tick.timestamp,
                    tick.price,
                );
                self.current = Some(fresh.clone());
                (None, Some(fresh))
            }
        }
    }

    /// Discard the forming candle without closing it (drop-and-resync).
    pub fn reset(&mut self) {
        if self.current.take().is_some() {
            debug!(key = %self.key, "open candle discarded on reset");
        }
    }

    pub fn open_candle(&self) -> Option<&Candle> {
        self.current.as_ref()
    }
}

// =============================================================================
// Worker task
// =============================================================================

/// Commands accepted by a per-key worker.
pub enum AggCmd {
    Tick(Tick),
    /// Discard the open candle; the ack lets the caller order a resync
    /// notification strictly after all workers have cleared.
    Reset(oneshot::Sender<()>),
}

async fn run_worker(key: CandleKey, mut rx: mpsc::Receiver<AggCmd>, out: mpsc::Sender<StreamEvent>) {
    let mut machine = CandleMachine::new(key);

    while let Some(cmd) = rx.recv().await {
        match cmd {
            AggCmd::Tick(tick) => {
                let (closed, update) = machine.on_tick(&tick);
                for candle in closed.into_iter().chain(update) {
                    if out.send(StreamEvent::from_candle(candle)).await.is_err() {
                        // Egress gone — the pipeline is shutting down.
                        return;
                    }
                }
            }
            AggCmd::Reset(ack) => {
                machine.reset();
                let _ = ack.send(());
            }
        }
    }
}

// =============================================================================
// Aggregator — lazily-spawned worker set
// =============================================================================

/// Owns the per-(instrument, timeframe) worker tasks and routes ticks to
/// every configured timeframe for the tick's instrument. Workers are spawned
/// lazily on the first tick for an instrument.
pub struct Aggregator {
    timeframes: Vec<Timeframe>,
    workers: HashMap<CandleKey, mpsc::Sender<AggCmd>>,
    out: mpsc::Sender<StreamEvent>,
}

impl Aggregator {
    pub fn new(timeframes: Vec<Timeframe>, out: mpsc::Sender<StreamEvent>) -> Self {
        Self {
            timeframes,
            workers: HashMap::new(),
            out,
        }
    }

    /// Forward a tick to each timeframe worker for its instrument.
    ///
    /// A worker whose inbox is gone (the task panicked on an invariant
    /// violation) is pruned and replaced with a fresh one; other keys are
    /// never affected.
    pub async fn route(&mut self, tick: &Tick) {
        for tf in self.timeframes.clone() {
            let key = CandleKey {
                instrument: tick.instrument.clone(),
                timeframe: tf,
            };

            let sender = self
                .workers
                .entry(key.clone())
                .or_insert_with(|| spawn_worker(key.clone(), self.out.clone()));

            if sender.send(AggCmd::Tick(tick.clone())).await.is_err() {
                error!(key = %key, "aggregator worker died — respawning");
                let fresh = spawn_worker(key.clone(), self.out.clone());
                let _ = fresh.send(AggCmd::Tick(tick.clone())).await;
                self.workers.insert(key, fresh);
            }
        }
    }

    /// Clear every worker's open candle and wait for all acks, so the caller
    /// can publish a resync notification that precedes any post-reset
    /// candle event.
    pub async fn reset(&mut self) {
        let mut acks = Vec::with_capacity(self.workers.len());
        let mut dead = Vec::new();

        for (key, sender) in &self.workers {
            let (tx, rx) = oneshot::channel();
            if sender.send(AggCmd::Reset(tx)).await.is_err() {
                dead.push(key.clone());
            } else {
                acks.push(rx);
            }
        }

        for key in dead {
            error!(key = %key, "aggregator worker died — pruned during reset");
            self.workers.remove(&key);
        }

        for rx in acks {
            let _ = rx.await;
        }
        debug!(workers = self.workers.len(), "aggregator reset complete");
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }
}

fn spawn_worker(key: CandleKey, out: mpsc::Sender<StreamEvent>) -> mpsc::Sender<AggCmd> {
    let (tx, rx) = mpsc::channel(WORKER_INBOX);
    tokio::spawn(run_worker(key, rx, out));
    tx
}

// =============================================================================
// Tests
// =============================================================================
