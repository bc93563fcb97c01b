//! WebSocket relay.
//!
//! Clients subscribe and unsubscribe per topic; the relay forwards
//! broadcast envelopes in publisher order per topic. A client that falls
//! behind a topic ring sees a `gap` frame with the missed count and then
//! continues from the oldest retained event. Producers are never
//! back-pressured by slow consumers.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{sink::SinkExt, stream::StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::broadcast::Topic;

use super::AppState;

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum ClientFrame {
    Subscribe { topic: String },
    Unsubscribe { topic: String },
    Ping,
}

pub async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| client_session(state, socket))
}

async fn client_session(state: AppState, socket: WebSocket) {
    let (mut sink, mut stream) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<String>(256);
    let mut forwarders: HashMap<String, JoinHandle<()>> = HashMap::new();

    let writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if sink.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(message)) = stream.next().await {
        let Message::Text(text) = message else {
            continue;
        };
        let frame: ClientFrame = match serde_json::from_str(&text) {
            Ok(frame) => frame,
            Err(_) => {
                let _ = out_tx
                    .send(json!({ "kind": "error", "message": "bad frame" }).to_string())
                    .await;
                continue;
            }
        };
        match frame {
            ClientFrame::Subscribe { topic } => {
                let Some(parsed) = Topic::parse(&topic) else {
                    let _ = out_tx
                        .send(
                            json!({ "kind": "error", "message": format!("bad topic: {topic}") })
                                .to_string(),
                        )
                        .await;
                    continue;
                };
                if forwarders.contains_key(&topic) {
                    continue;
                }
                let rx = state.engine.shared().broadcaster.subscribe(parsed);
                let tx = out_tx.clone();
                let key = topic.clone();
                forwarders.insert(
                    topic,
                    tokio::spawn(forward_topic(rx, tx, key)),
                );
            }
            ClientFrame::Unsubscribe { topic } => {
                if let Some(handle) = forwarders.remove(&topic) {
                    handle.abort();
                }
            }
            ClientFrame::Ping => {
                let _ = out_tx.send(json!({ "kind": "pong" }).to_string()).await;
            }
        }
    }

    for handle in forwarders.into_values() {
        handle.abort();
    }
    writer.abort();
    debug!("ws client disconnected");
}

async fn forward_topic(
    mut rx: tokio::sync::broadcast::Receiver<std::sync::Arc<crate::broadcast::Envelope>>,
    tx: mpsc::Sender<String>,
    topic: String,
) {
    loop {
        match rx.recv().await {
            Ok(envelope) => {
                let Ok(frame) = serde_json::to_string(&*envelope) else {
                    continue;
                };
                // A full client buffer drops this event rather than
                // stalling the relay.
                if tx.try_send(frame).is_err() && tx.is_closed() {
                    break;
                }
            }
            Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                let gap = json!({ "kind": "gap", "topic": topic, "missed": missed }).to_string();
                if tx.try_send(gap).is_err() && tx.is_closed() {
                    break;
                }
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
    }
}
