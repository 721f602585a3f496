// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! WebSocket transport for the [`AgentMessageBus`].
//!
//! One socket per agent at `GET /agents/ws`. Every text frame carries one JSON
//! wire message; binary frames are ignored. The bus decides what to write and
//! when to close, this module only shuttles frames.

use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message as WsMessage, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
    routing::get,
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::application::message_bus::{AgentMessageBus, OutboundFrame};

pub const AGENT_SOCKET_PATH: &str = "/agents/ws";

pub fn router(bus: Arc<AgentMessageBus>) -> Router {
    Router::new()
        .route(AGENT_SOCKET_PATH, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(bus)
}

pub async fn bind(addr: SocketAddr) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind agent bus to {}", addr))
}

/// Serve the bus until its shutdown token fires.
pub async fn serve(listener: TcpListener, bus: Arc<AgentMessageBus>) -> Result<()> {
    let shutdown = bus.shutdown_token();
    if let Ok(addr) = listener.local_addr() {
        info!("Agent bus listening on ws://{}{}", addr, AGENT_SOCKET_PATH);
    }

    axum::serve(listener, router(bus))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("Agent bus server failed")?;

    info!("Agent bus stopped");
    Ok(())
}

async fn health_handler(State(bus): State<Arc<AgentMessageBus>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "connected_agents": bus.connected_agents().len(),
    }))
}

async fn ws_handler(ws: WebSocketUpgrade, State(bus): State<Arc<AgentMessageBus>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, bus))
}

async fn handle_socket(socket: WebSocket, bus: Arc<AgentMessageBus>) {
    let (connection, mut outbound) = bus.open_connection();
    let (mut sender, mut receiver) = socket.split();
    debug!(connection = %connection, "Agent socket opened");

    let mut write_task = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            match frame {
                OutboundFrame::Message(message) => {
                    let text = match serde_json::to_string(&message) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!("Failed to encode bus message {}: {}", message.id, e);
                            continue;
                        }
                    };
                    if sender.send(WsMessage::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                OutboundFrame::Close { reason } => {
                    let _ = sender
                        .send(WsMessage::Close(Some(CloseFrame {
                            code: close_code::NORMAL,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            }
        }
    });

    let reason = loop {
        tokio::select! {
            incoming = receiver.next() => match incoming {
                Some(Ok(WsMessage::Text(text))) => {
                    if let Err(e) = bus.handle_frame(connection, text.as_str()).await {
                        debug!(connection = %connection, "Frame rejected: {}", e);
                    }
                }
                Some(Ok(WsMessage::Close(_))) | None => break "socket closed",
                Some(Ok(WsMessage::Binary(data))) => {
                    debug!(connection = %connection, len = data.len(), "Ignoring binary frame");
                }
                // Protocol-level ping/pong is answered by axum
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(connection = %connection, "Agent socket error: {}", e);
                    break "socket error";
                }
            },
            _ = &mut write_task => break "closed by orchestrator",
        }
    };

    write_task.abort();
    bus.connection_closed(connection, reason);
}
