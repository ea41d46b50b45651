// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Canvas WebSocket bridge — translates browser connections into the
//! canvas channel's frame protocol.
//!
//! One JSON object per text frame.  `drag` and `ping` are handled here at
//! the transport; steering and aborts act on the session natively;
//! everything else flows through the canvas channel's inbound handler into
//! the shared dispatch path.
//!
//! Authentication is a bearer token carried as `?token=`; when the config
//! sets none, the socket is open (development mode).

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use harbor_canvas::{CanvasOp, Position};
use harbor_channels::{CanvasClientAction, ClientFrame, ServerFrame};
use harbor_engine::SteeringMessage;

use crate::gateway::GatewayState;

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(session_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    State(state): State<Arc<GatewayState>>,
) -> Response {
    // Token check happens before the upgrade; the socket adds no auth.
    let expected = state
        .cfg
        .channels
        .canvas
        .as_ref()
        .and_then(|c| c.auth_token.clone());
    if let Some(expected) = expected {
        if params.get("token").map(String::as_str) != Some(expected.as_str()) {
            warn!(session = %session_id, "websocket token rejected");
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }

    ws.on_upgrade(move |socket| handle_socket(socket, state, session_id))
}

async fn handle_socket(mut socket: WebSocket, state: Arc<GatewayState>, session_id: String) {
    info!(session = %session_id, "canvas client connected");

    let Some(canvas_channel) = state.canvas_channel.clone() else {
        let _ = socket.send(Message::Close(None)).await;
        return;
    };
    let mut frames = canvas_channel.subscribe_frames();
    let context_key = format!("canvas:{session_id}");

    // Late joiners get the current canvas immediately.
    let snapshot = state.canvas_for(&context_key).lock().unwrap().snapshot();
    send_frame(&mut socket, &ServerFrame::CanvasSnapshot { snapshot }).await;

    loop {
        tokio::select! {
            // Incoming frame from the browser.
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let frame: ClientFrame = match serde_json::from_str(&text) {
                            Ok(f) => f,
                            Err(e) => {
                                debug!(session = %session_id, "bad client frame: {e}");
                                continue;
                            }
                        };
                        if let Some(reply) = apply_client_frame(&state, &canvas_channel, &session_id, frame) {
                            send_frame(&mut socket, &reply).await;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {} // binary frames ignored
                    Some(Err(e)) => {
                        debug!(session = %session_id, "websocket recv error: {e}");
                        break;
                    }
                }
            }
            // Outgoing frame from the agent side.
            result = frames.recv() => {
                match result {
                    Ok(frame) => send_frame(&mut socket, &frame).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(session = %session_id, "canvas client lagged by {n} frames");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    info!(session = %session_id, "canvas client disconnected");
}

/// Apply one client frame.  Returns a frame to send directly back on this
/// socket (pong), if any.
fn apply_client_frame(
    state: &Arc<GatewayState>,
    canvas_channel: &harbor_channels::CanvasChannel,
    session_id: &str,
    frame: ClientFrame,
) -> Option<ServerFrame> {
    let context_key = format!("canvas:{session_id}");
    match canvas_channel.handle_client_frame(session_id, frame) {
        // Inbound text already dispatched through the channel handler.
        CanvasClientAction::Inbound { .. } => None,
        CanvasClientAction::Steer { kind, content } => {
            if let Some(session) = state.manager.get(&context_key) {
                let msg = match kind.as_str() {
                    "reminder" => SteeringMessage::reminder(content),
                    _ => SteeringMessage::inject(content),
                };
                session.lock().unwrap().steer(msg);
            }
            None
        }
        CanvasClientAction::Abort { reason } => {
            // Immediate: cancel the active run, and leave the abort in the
            // queue so a turn boundary also observes it.
            if let Some(session) = state.manager.get(&context_key) {
                session
                    .lock()
                    .unwrap()
                    .steer(SteeringMessage::abort(reason));
            }
            if let Some(token) = state.active_run(&context_key) {
                token.cancel();
            }
            None
        }
        CanvasClientAction::Drag { id, x, y } => {
            // Transport-level: position sync only, no inbound message.
            let canvas = state.canvas_for(&context_key);
            let change = canvas.lock().unwrap().apply(CanvasOp::Move {
                id,
                position: Position {
                    x,
                    y,
                    w: None,
                    h: None,
                },
            });
            if let Ok(change) = change {
                canvas_channel.broadcast(ServerFrame::CanvasChange { change });
            }
            None
        }
        CanvasClientAction::Pong { ts } => Some(ServerFrame::Pong { ts }),
    }
}

async fn send_frame(socket: &mut WebSocket, frame: &ServerFrame) {
    if let Ok(json) = serde_json::to_string(frame) {
        let _ = socket.send(Message::Text(json)).await;
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
