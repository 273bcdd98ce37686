// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Websocket upgrade endpoints: agent sessions and UI log subscriptions.
//! Auth happens before the upgrade; a bad token never reaches the hub.

use crate::auth::{require_operator, require_operator_or_agent};
use crate::error::ServerError;
use crate::AppState;
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::Response;
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsQuery {
	#[serde(default)]
	pub node_id: String,
}

pub async fn agent_socket(
	State(state): State<AppState>,
	headers: HeaderMap,
	Query(query): Query<WsQuery>,
	ws: WebSocketUpgrade,
) -> Result<Response, ServerError> {
	if query.node_id.is_empty() {
		return Err(ServerError::BadRequest("nodeId required".to_string()));
	}
	require_operator_or_agent(&state.tokens, &state.store, &query.node_id, &headers).await?;
	let hub = Arc::clone(&state.hub);
	let node_id = query.node_id;
	info!(node_id = %node_id, "agent websocket upgrade");
	Ok(ws.on_upgrade(move |socket| async move {
		hub.run_agent_connection(socket, node_id).await;
	}))
}

pub async fn log_socket(
	State(state): State<AppState>,
	headers: HeaderMap,
	Query(query): Query<WsQuery>,
	ws: WebSocketUpgrade,
) -> Result<Response, ServerError> {
	if query.node_id.is_empty() {
		return Err(ServerError::BadRequest("nodeId required".to_string()));
	}
	require_operator(&state.tokens, &headers)?;
	let hub = Arc::clone(&state.hub);
	let node_id = query.node_id;
	Ok(ws.on_upgrade(move |socket| async move {
		hub.run_log_subscriber(socket, node_id).await;
	}))
}
