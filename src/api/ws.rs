// =============================================================================
// WebSocket Handlers — upstream ingest and downstream feed
// =============================================================================
//
// `/ws/ingest` — the browser-automation collaborator pushes raw tick events
// as JSON text frames. Socket lifecycle doubles as the upstream connectivity
// signal: a connection after a loss maps to UpstreamRestored (triggering
// drop-and-resync), a close or error maps to UpstreamLost.
//
// `/ws/feed?instrument=EURUSD` — a dashboard consumer subscribes to the
// fan-out hub (optionally filtered to one instrument), receives a replay of
// the cached closed candles, then live events as JSON. Disconnects are
// reported to the reconnect controller as ConsumerDropped.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::app_state::AppState;
use crate::types::{CandleKey, ConnectivityEvent, StreamEvent};

// =============================================================================
// Feed endpoint
// =============================================================================

#[derive(Deserialize)]
pub struct FeedQuery {
    instrument: Option<String>,
}

pub async fn feed_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(query): Query<FeedQuery>,
) -> impl IntoResponse {
    info!(instrument = ?query.instrument, "feed WebSocket connection accepted — upgrading");
    ws.on_upgrade(move |socket| handle_feed(socket, state, query.instrument))
}

async fn handle_feed(socket: WebSocket, state: Arc<AppState>, instrument: Option<String>) {
    let mut subscription = state.hub.subscribe(instrument.clone());
    let subscriber_id = subscription.id();
    let (mut sender, mut receiver) = socket.split();

    // Replay cached closed candles so the consumer starts with history.
    // Without an explicit instrument, replay the focused one (if any).
    let replay_instrument = instrument.or_else(|| state.focus.snapshot().instrument);
    if let Some(instrument) = replay_instrument {
        let timeframes = state.runtime_config.read().timeframes.clone();
        for timeframe in timeframes {
            let key = CandleKey {
                instrument: instrument.clone(),
                timeframe,
            };
            let Some(candles) = state.candle_cache.snapshot(&key) else {
                continue;
            };
            debug!(key = %key, candles = candles.len(), "replaying cached candles");
            for candle in candles {
                let event = StreamEvent::from_candle(candle);
                if send_event(&mut sender, &event).await.is_err() {
                    cleanup(&state, subscriber_id).await;
                    return;
                }
            }
        }
    }

    // Concurrent push/recv loop.
    loop {
        tokio::select! {
            event = subscription.recv() => {
                match event {
                    Some(event) => {
                        if let Err(e) = send_event(&mut sender, &event).await {
                            debug!(error = %e, "feed WebSocket send failed — disconnecting");
                            break;
                        }
                    }
                    // Unsubscribed elsewhere (e.g. by the controller).
                    None => break,
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!(id = %subscriber_id, "feed WebSocket closed");
                        break;
                    }
                    Some(Ok(_)) => {
                        // Text/Binary/Pong from consumers carry no meaning here.
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "feed WebSocket receive error — disconnecting");
                        break;
                    }
                }
            }
        }
    }

    cleanup(&state, subscriber_id).await;
}

async fn send_event<S>(sender: &mut S, event: &StreamEvent) -> Result<(), axum::Error>
where
    S: futures_util::Sink<Message, Error = axum::Error> + Unpin,
{
    match serde_json::to_string(event) {
        Ok(json) => sender.send(Message::Text(json)).await,
        Err(e) => {
            // Serialisation errors are not network errors; don't disconnect.
            warn!(error = %e, "failed to serialise stream event");
            Ok(())
        }
    }
}

/// Report the disconnect so the controller removes the subscription.
async fn cleanup(state: &Arc<AppState>, id: uuid::Uuid) {
    let _ = state
        .connectivity
        .send(ConnectivityEvent::ConsumerDropped { id })
        .await;
    info!(id = %id, "feed consumer cleanup complete");
}

// =============================================================================
// Ingest endpoint
// =============================================================================

pub async fn ingest_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    info!("ingest WebSocket connection accepted — upgrading");
    ws.on_upgrade(move |socket| handle_ingest(socket, state))
}

async fn handle_ingest(mut socket: WebSocket, state: Arc<AppState>) {
    let _ = state
        .connectivity
        .send(ConnectivityEvent::UpstreamRestored)
        .await;

    let reason = loop {
        match socket.recv().await {
            Some(Ok(Message::Text(text))) => match serde_json::from_str(&text) {
                Ok(raw) => {
                    if !state.pipeline.ingest_raw(raw).await {
                        break "pipeline stopped".to_string();
                    }
                }
                Err(e) => {
                    warn!(error = %e, "unparsable ingest frame discarded");
                }
            },
            Some(Ok(Message::Ping(data))) => {
                if socket.send(Message::Pong(data)).await.is_err() {
                    break "socket closed".to_string();
                }
            }
            Some(Ok(Message::Close(_))) => break "upstream closed the socket".to_string(),
            Some(Ok(_)) => {
                debug!("non-text ingest frame ignored");
            }
            Some(Err(e)) => break format!("ingest socket error: {e}"),
            None => break "ingest stream ended".to_string(),
        }
    };

    warn!(reason = %reason, "upstream ingest disconnected");
    let _ = state
        .connectivity
        .send(ConnectivityEvent::UpstreamLost { reason })
        .await;
}
