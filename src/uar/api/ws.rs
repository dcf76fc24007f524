//! WebSocket transport for the subscription protocol.
//!
//! The first text message is the subscribe request. A pump task moves frames
//! from the gateway into a bounded channel; the socket loop drains it, so a
//! slow client applies backpressure to its own pump and nothing else.

use std::sync::Arc;

use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::uar::runtime::gateway::{ServerFrame, StreamingGateway};
use crate::uar::runtime::manager::RunManager;

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(manager): State<Arc<RunManager>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, manager))
}

async fn handle_socket(socket: WebSocket, manager: Arc<RunManager>) {
    let (mut sender, mut receiver) = socket.split();

    let request = loop {
        match receiver.next().await {
            Some(Ok(Message::Text(text))) => break StreamingGateway::parse(text.as_str()),
            Some(Ok(Message::Close(_))) | None => return,
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                tracing::debug!(error = %e, "WebSocket closed before subscribing");
                return;
            }
        }
    };

    let capacity = manager.settings().event_channel_capacity;
    let gateway = StreamingGateway::new(manager);
    let mut frames = match request {
        Ok(request) => gateway.subscribe(request).await,
        Err(frame) => StreamingGateway::reject(frame),
    };

    let (tx, mut rx) = mpsc::channel::<ServerFrame>(capacity);
    let pump = tokio::spawn(async move {
        while let Some(frame) = frames.next().await {
            if tx.send(frame).await.is_err() {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            frame = rx.recv() => {
                let Some(frame) = frame else { break };
                let text = match serde_json::to_string(&frame) {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to encode frame");
                        continue;
                    }
                };
                if sender.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    // Dropping the frame stream cancels a run this socket started.
    pump.abort();
    if let Err(e) = sender.close().await {
        tracing::debug!(error = %e, "WebSocket close failed");
    }
}
