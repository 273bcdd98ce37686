// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Policy authoring, command dispatch, and the agent status/diag channels.

use crate::auth::{require_operator, require_operator_or_agent};
use crate::error::ServerError;
use crate::AppState;
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::Json;
use chrono::Utc;
use peerwan_model::{
	Envelope, PolicyDiagReport, PolicyInstallLog, PolicyRule, Task, TaskStep,
};
use peerwan_store::PolicyUpdate;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, instrument};
use uuid::Uuid;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyRequest {
	#[serde(default)]
	pub node_id: String,
	#[serde(default, rename = "egressPeerId")]
	pub egress_peer: String,
	#[serde(default)]
	pub policy_rules: Vec<PolicyRule>,
	#[serde(default)]
	pub default_route: bool,
	#[serde(default)]
	pub bypass_cidrs: Vec<String>,
	#[serde(default)]
	pub default_route_next_hop: String,
}

/// Store the node's rules and propagate: bump plans so long-pollers wake,
/// and dispatch a `policy_apply` task at the live session.
#[instrument(skip(state, headers, req), fields(node_id = %req.node_id))]
pub async fn set_policy(
	State(state): State<AppState>,
	headers: HeaderMap,
	Json(mut req): Json<PolicyRequest>,
) -> Result<Json<Value>, ServerError> {
	require_operator(&state.tokens, &headers)?;
	if req.node_id.is_empty() {
		return Err(ServerError::BadRequest("invalid payload".to_string()));
	}
	if !req.policy_rules.is_empty() {
		let mut valid = 0;
		for rule in &mut req.policy_rules {
			rule.prefix = rule.prefix.trim().to_string();
			if rule.via_node.is_empty() {
				if let Some(tail) = rule.path.last() {
					rule.via_node = tail.clone();
				}
			}
			if rule.is_valid() {
				valid += 1;
			}
		}
		if valid == 0 {
			return Err(ServerError::BadRequest("no valid policy rules".to_string()));
		}
	}
	state
		.store
		.update_policy(
			&req.node_id,
			PolicyUpdate {
				egress_peer_id: req.egress_peer.clone(),
				rules: req.policy_rules.clone(),
				default_route: req.default_route,
				bypass_cidrs: req.bypass_cidrs.clone(),
				default_route_next_hop: req.default_route_next_hop.clone(),
			},
		)
		.await?;
	let _ = state
		.store
		.append_audit(peerwan_model::AuditEntry::now(
			"controller",
			"update_policy",
			&req.node_id,
			format!("{} rule(s)", req.policy_rules.len()),
		))
		.await;
	state.plans.recompute_all().await?;

	let task_id = Uuid::new_v4().to_string();
	let task = Task {
		id: task_id.clone(),
		node_id: req.node_id.clone(),
		kind: "policy_apply".to_string(),
		status: "running".to_string(),
		steps: vec![TaskStep {
			name: "dispatch".to_string(),
			status: "running".to_string(),
			message: "sending to agent".to_string(),
			timestamp: Utc::now(),
			..Default::default()
		}],
		created_at: Utc::now(),
		updated_at: Utc::now(),
		..Default::default()
	};
	let _ = state.store.save_task(task).await;
	state
		.hub
		.send(
			&req.node_id,
			Envelope::new(
				"task",
				&req.node_id,
				json!({ "taskId": task_id, "type": "policy_apply" }),
			),
		)
		.await;
	info!(node_id = %req.node_id, rules = req.policy_rules.len(), "policy updated");

	let node = state.store.get_node(&req.node_id).await?;
	Ok(Json(match node {
		Some(node) => json!({
			"status": "ok",
			"egressPeerId": node.egress_peer_id,
			"policyRules": node.policy_rules,
			"defaultRoute": node.default_route,
			"bypassCidrs": node.bypass_cidrs,
			"defaultRouteNextHop": node.default_route_next_hop,
		}),
		None => json!({ "status": "ok" }),
	}))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeQuery {
	#[serde(default)]
	pub node_id: String,
	#[serde(default)]
	pub limit: Option<usize>,
}

pub async fn get_policy(
	State(state): State<AppState>,
	headers: HeaderMap,
	Query(query): Query<NodeQuery>,
) -> Result<Json<Value>, ServerError> {
	require_operator(&state.tokens, &headers)?;
	if query.node_id.is_empty() {
		return Err(ServerError::BadRequest("nodeId is required".to_string()));
	}
	let node = state
		.store
		.get_node(&query.node_id)
		.await?
		.ok_or_else(|| ServerError::NotFound("node not found".to_string()))?;
	Ok(Json(json!({
		"egressPeerId": node.egress_peer_id,
		"policyRules": node.policy_rules,
		"defaultRoute": node.default_route,
		"bypassCidrs": node.bypass_cidrs,
		"defaultRouteNextHop": node.default_route_next_hop,
	})))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRequest {
	#[serde(default)]
	pub node_id: String,
	#[serde(default)]
	pub action: String,
	#[serde(default)]
	pub data: Value,
}

/// Push an ad-hoc command at a connected agent through the hub.
pub async fn command(
	State(state): State<AppState>,
	headers: HeaderMap,
	Json(req): Json<CommandRequest>,
) -> Result<Json<Value>, ServerError> {
	require_operator(&state.tokens, &headers)?;
	if req.node_id.is_empty() || req.action.is_empty() {
		return Err(ServerError::BadRequest("invalid payload".to_string()));
	}
	let payload = json!({
		"nodeId": req.node_id,
		"action": req.action,
		"data": req.data,
	});
	state
		.hub
		.send(&req.node_id, Envelope::new("command", &req.node_id, payload))
		.await;
	Ok(Json(json!({ "status": "sent" })))
}

pub async fn post_status(
	State(state): State<AppState>,
	headers: HeaderMap,
	Json(req): Json<PolicyInstallLog>,
) -> Result<Json<Value>, ServerError> {
	if req.node_id.is_empty() || req.status.is_empty() {
		return Err(ServerError::BadRequest("invalid payload".to_string()));
	}
	require_operator_or_agent(&state.tokens, &state.store, &req.node_id, &headers).await?;
	state.store.save_policy_status(req).await?;
	Ok(Json(json!({ "status": "ok" })))
}

pub async fn list_status(
	State(state): State<AppState>,
	headers: HeaderMap,
	Query(query): Query<NodeQuery>,
) -> Result<Json<Value>, ServerError> {
	if query.node_id.is_empty() {
		return Err(ServerError::BadRequest("nodeId is required".to_string()));
	}
	require_operator_or_agent(&state.tokens, &state.store, &query.node_id, &headers).await?;
	let items = state
		.store
		.list_policy_status(&query.node_id, query.limit.unwrap_or(20))
		.await?;
	Ok(Json(json!({ "items": items })))
}

pub async fn post_diag(
	State(state): State<AppState>,
	headers: HeaderMap,
	Json(req): Json<PolicyDiagReport>,
) -> Result<Json<Value>, ServerError> {
	if req.node_id.is_empty() {
		return Err(ServerError::BadRequest("invalid payload".to_string()));
	}
	require_operator_or_agent(&state.tokens, &state.store, &req.node_id, &headers).await?;
	state.store.save_policy_diag(req).await?;
	Ok(Json(json!({ "status": "ok" })))
}

pub async fn list_diag(
	State(state): State<AppState>,
	headers: HeaderMap,
	Query(query): Query<NodeQuery>,
) -> Result<Json<Value>, ServerError> {
	if query.node_id.is_empty() {
		return Err(ServerError::BadRequest("nodeId is required".to_string()));
	}
	require_operator_or_agent(&state.tokens, &state.store, &query.node_id, &headers).await?;
	let items = state
		.store
		.list_policy_diag(&query.node_id, query.limit.unwrap_or(10))
		.await?;
	Ok(Json(json!({ "items": items })))
}
