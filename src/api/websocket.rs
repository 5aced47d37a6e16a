//! WebSocket support for live session streaming.
//!
//! Clients connect to `/ws` and receive real-time events:
//! - The session view on every alert state change and countdown tick
//! - G-force / speed telemetry as readings arrive

use axum::{
    extract::{State, WebSocketUpgrade, ws::{Message, WebSocket}},
    response::IntoResponse,
};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{info, debug, warn};

use crate::api::AppState;
use crate::session::SessionView;

/// What a session viewer receives
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WsEvent {
    /// Full view after a state change or countdown tick
    Session { view: SessionView },
    /// Latest readings, one per motion sample
    Telemetry { gforce: f64, speed: f64 },
}

/// Fan-out of session events to every attached viewer
#[derive(Clone)]
pub struct WsBroadcaster {
    sender: broadcast::Sender<WsEvent>,
}

impl WsBroadcaster {
    /// `backlog` bounds how far a slow viewer may lag before skipping
    pub fn new(backlog: usize) -> Self {
        Self { sender: broadcast::channel(backlog).0 }
    }

    /// Events published with no viewer attached are dropped
    pub fn broadcast(&self, event: WsEvent) {
        if self.sender.send(event).is_err() {
            debug!("No session viewers attached");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WsEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// Upgrade `/ws` into a session stream
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(runtime): State<AppState>,
) -> impl IntoResponse {
    // Subscribe before the snapshot so no transition falls between them
    let events = runtime.broadcaster().subscribe();
    let snapshot = runtime.view().await;
    info!(
        "🔌 Session viewer attached (watching: {})",
        runtime.broadcaster().subscriber_count()
    );
    ws.on_upgrade(move |socket| stream_session(socket, events, snapshot))
}

async fn send_event(
    sink: &mut SplitSink<WebSocket, Message>,
    event: &WsEvent,
) -> Result<(), axum::Error> {
    match serde_json::to_string(event) {
        Ok(json) => sink.send(Message::Text(json)).await,
        Err(e) => {
            warn!("Failed to serialize session event: {}", e);
            Ok(())
        }
    }
}

/// Push the current view, then every event, until the viewer leaves
async fn stream_session(
    socket: WebSocket,
    mut events: broadcast::Receiver<WsEvent>,
    snapshot: SessionView,
) {
    let (mut sink, mut incoming) = socket.split();
    let mut sent = 0u64;

    if send_event(&mut sink, &WsEvent::Session { view: snapshot }).await.is_ok() {
        sent += 1;
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(event) => {
                        if send_event(&mut sink, &event).await.is_err() {
                            break;
                        }
                        sent += 1;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!("Session viewer fell behind by {} events", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                msg = incoming.next() => match msg {
                    // Controls arrive over HTTP; only close matters here
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                },
            }
        }
    }

    info!("🔌 Session viewer detached after {} events", sent);
}
