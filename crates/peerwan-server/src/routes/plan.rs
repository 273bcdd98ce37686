// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Plan fetch (with long-poll), history and rollback.

use crate::auth::{require_operator, require_operator_or_agent};
use crate::error::ServerError;
use crate::AppState;
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::Json;
use peerwan_model::{Node, Plan, PlanResponse};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanQuery {
	#[serde(default)]
	pub node_id: String,
	#[serde(default)]
	pub wait_version: Option<i64>,
}

/// Fetch the node's current plan. With `waitVersion` the request parks
/// until the global version moves past it (bounded), so disconnected agents
/// converge without the push channel. A node that has never been planned
/// gets one computed on the spot.
pub async fn get_plan(
	State(state): State<AppState>,
	headers: HeaderMap,
	Query(query): Query<PlanQuery>,
) -> Result<Json<PlanResponse>, ServerError> {
	if query.node_id.is_empty() {
		return Err(ServerError::BadRequest("nodeId is required".to_string()));
	}
	require_operator_or_agent(&state.tokens, &state.store, &query.node_id, &headers).await?;
	if let Some(wait) = query.wait_version {
		state.plans.wait_for_version(wait).await;
	}
	let plan = match state.store.get_plan(&query.node_id).await? {
		Some(plan) => plan,
		None => state.plans.recompute_node(&query.node_id).await?,
	};
	let node = state
		.store
		.get_node(&query.node_id)
		.await?
		.unwrap_or_else(|| Node {
			id: query.node_id.clone(),
			..Default::default()
		});
	let settings = state.store.get_settings().await?.or_defaults();
	Ok(Json(state.plans.plan_response(
		&node,
		&plan,
		&settings,
		"dynamic plan based on current health",
	)))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryQuery {
	#[serde(default)]
	pub node_id: String,
}

pub async fn history(
	State(state): State<AppState>,
	headers: HeaderMap,
	Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<Plan>>, ServerError> {
	require_operator(&state.tokens, &headers)?;
	if query.node_id.is_empty() {
		return Err(ServerError::BadRequest("nodeId is required".to_string()));
	}
	Ok(Json(
		state
			.store
			.list_plan_history(&query.node_id, peerwan_store::PLAN_HISTORY_LIMIT)
			.await?,
	))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackRequest {
	#[serde(default)]
	pub node_id: String,
	pub version: i64,
}

pub async fn rollback(
	State(state): State<AppState>,
	headers: HeaderMap,
	Json(req): Json<RollbackRequest>,
) -> Result<Json<Plan>, ServerError> {
	require_operator(&state.tokens, &headers)?;
	if req.node_id.is_empty() {
		return Err(ServerError::BadRequest("invalid payload".to_string()));
	}
	let plan = state.plans.rollback(&req.node_id, req.version).await?;
	Ok(Json(plan))
}
