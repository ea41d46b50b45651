// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! The control plane: a minimal JSON REST surface over the session
//! manager plus the canvas WebSocket upgrade.
//!
//! - `GET /health` — overall health and timestamp
//! - `GET /sessions` — session summaries
//! - `POST /sessions/{id}/steer` — enqueue a steering message
//! - `DELETE /sessions/{id}` — end a session
//! - `GET /ws/{session_id}` — canvas WebSocket (see `ws.rs`)

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde_json::json;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::info;

use harbor_engine::SteeringMessage;

use crate::gateway::GatewayState;

/// Control-plane bodies are tiny; anything bigger is a client bug.
const MAX_BODY_BYTES: usize = 64 * 1024;

pub fn router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/sessions", get(list_sessions))
        .route("/sessions/:id/steer", post(steer_session))
        .route("/sessions/:id", delete(end_session))
        .route("/ws/:session_id", get(crate::ws::ws_handler))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .with_state(state)
}

async fn health(State(state): State<Arc<GatewayState>>) -> Response {
    let healthy = state.monitor.overall_health();
    let body = json!({
        "status": if healthy { "ok" } else { "degraded" },
        "timestamp": chrono::Utc::now().to_rfc3339(),
    });
    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(body)).into_response()
}

async fn list_sessions(State(state): State<Arc<GatewayState>>) -> Response {
    let sessions: Vec<serde_json::Value> = state
        .manager
        .list()
        .into_iter()
        .map(|s| {
            json!({
                "sessionId": s.session_id,
                "channelId": s.channel_id,
                "userId": s.user_id,
                "status": s.status,
                "createdAt": s.created_at.to_rfc3339(),
                "lastActiveAt": s.last_active_at.to_rfc3339(),
            })
        })
        .collect();
    (StatusCode::OK, Json(json!({ "sessions": sessions }))).into_response()
}

async fn steer_session(
    State(state): State<Arc<GatewayState>>,
    Path(id): Path<String>,
    body: Option<Json<serde_json::Value>>,
) -> Response {
    let message = body
        .as_ref()
        .and_then(|b| b.0.get("message"))
        .and_then(|m| m.as_str())
        .unwrap_or("")
        .to_string();
    if message.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "message is required" })),
        )
            .into_response();
    }

    let Some((_, session)) = state.manager.find_by_session_id(&id) else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("unknown session {id}") })),
        )
            .into_response();
    };

    info!(session = %id, "steering via control plane");
    session
        .lock()
        .unwrap()
        .steer(SteeringMessage::inject(&message));

    (
        StatusCode::OK,
        Json(json!({
            "sessionId": id,
            "steered": true,
            "message": message,
        })),
    )
        .into_response()
}

async fn end_session(
    State(state): State<Arc<GatewayState>>,
    Path(id): Path<String>,
) -> Response {
    let Some((key, _)) = state.manager.find_by_session_id(&id) else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("unknown session {id}") })),
        )
            .into_response();
    };

    info!(session = %id, key = %key, "ending session via control plane");
    state.manager.end(&key);
    (
        StatusCode::OK,
        Json(json!({ "sessionId": id, "ended": true })),
    )
        .into_response()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
