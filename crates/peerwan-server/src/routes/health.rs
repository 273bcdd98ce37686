// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Agent heartbeat ingestion and health history queries.

use crate::auth::{require_operator, require_operator_or_agent};
use crate::error::ServerError;
use crate::AppState;
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::Json;
use chrono::Utc;
use peerwan_model::{AuditEntry, HealthReport};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::instrument;

/// Ingest a health snapshot and recompute plans against the new telemetry;
/// any long-poller and connected agent sees the refreshed ordering.
#[instrument(skip(state, headers, report), fields(node_id = %report.node_id))]
pub async fn post_health(
	State(state): State<AppState>,
	headers: HeaderMap,
	Json(mut report): Json<HealthReport>,
) -> Result<Json<Value>, ServerError> {
	if report.node_id.is_empty() {
		return Err(ServerError::BadRequest("nodeId is required".to_string()));
	}
	require_operator_or_agent(&state.tokens, &state.store, &report.node_id, &headers).await?;
	report.timestamp = Utc::now();
	let node_id = report.node_id.clone();
	let timestamp = report.timestamp;
	state.store.save_health(report).await?;
	state.plans.recompute_all().await?;
	let _ = state
		.store
		.append_audit(AuditEntry {
			actor: node_id,
			action: "health_report".to_string(),
			target: "self".to_string(),
			detail: String::new(),
			timestamp,
		})
		.await;
	Ok(Json(json!({ "status": "ok" })))
}

pub async fn list_health(
	State(state): State<AppState>,
	headers: HeaderMap,
) -> Result<Json<Vec<HealthReport>>, ServerError> {
	require_operator(&state.tokens, &headers)?;
	Ok(Json(state.store.list_health().await?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryQuery {
	#[serde(default)]
	pub node_id: String,
	#[serde(default)]
	pub hours: Option<u32>,
}

pub async fn history(
	State(state): State<AppState>,
	headers: HeaderMap,
	Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<HealthReport>>, ServerError> {
	require_operator(&state.tokens, &headers)?;
	if query.node_id.is_empty() {
		return Err(ServerError::BadRequest("nodeId is required".to_string()));
	}
	let hours = query.hours.filter(|h| *h > 0).unwrap_or(24);
	let since = Utc::now() - chrono::Duration::hours(hours as i64);
	Ok(Json(
		state.store.list_health_history(&query.node_id, since).await?,
	))
}
