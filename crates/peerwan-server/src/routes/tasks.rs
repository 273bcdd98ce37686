// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Multi-step task creation and listing. A task fans out over the hub to
//! its target agents; step updates stream back as `task_step` envelopes.

use crate::auth::require_operator;
use crate::error::ServerError;
use crate::AppState;
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::Json;
use chrono::Utc;
use peerwan_model::{Envelope, Task, TaskStep};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::info;
use uuid::Uuid;

const TASK_LIST_LIMIT: usize = 50;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTaskRequest {
	#[serde(default)]
	pub node_id: String,
	#[serde(default)]
	pub targets: Vec<String>,
	#[serde(default, rename = "type")]
	pub kind: String,
	#[serde(default)]
	pub verify_targets: Vec<String>,
	#[serde(default)]
	pub data: Option<Value>,
}

pub async fn create_task(
	State(state): State<AppState>,
	headers: HeaderMap,
	Json(req): Json<CreateTaskRequest>,
) -> Result<Json<Task>, ServerError> {
	require_operator(&state.tokens, &headers)?;
	if req.kind.is_empty() {
		return Err(ServerError::BadRequest("invalid payload".to_string()));
	}
	let mut targets = req.targets;
	if targets.is_empty() && !req.node_id.is_empty() {
		targets = vec![req.node_id.clone()];
	}
	if targets.is_empty() {
		return Err(ServerError::BadRequest("targets required".to_string()));
	}

	let task_id = Uuid::new_v4().to_string();
	let task = Task {
		id: task_id.clone(),
		node_id: req.node_id.clone(),
		targets: targets.clone(),
		kind: req.kind.clone(),
		status: "running".to_string(),
		overall_status: "running".to_string(),
		steps: vec![TaskStep {
			name: "dispatch".to_string(),
			status: "running".to_string(),
			message: "sending to agents".to_string(),
			timestamp: Utc::now(),
			..Default::default()
		}],
		created_at: Utc::now(),
		updated_at: Utc::now(),
	};
	state.store.save_task(task.clone()).await?;

	let mut payload = Map::new();
	payload.insert("taskId".to_string(), json!(task_id));
	payload.insert("type".to_string(), json!(req.kind));
	if !req.verify_targets.is_empty() {
		payload.insert("verifyTargets".to_string(), json!(req.verify_targets));
	}
	if let Some(data) = req.data {
		payload.insert("data".to_string(), data);
	}
	for target in &targets {
		state
			.hub
			.send(target, Envelope::new("task", target, Value::Object(payload.clone())))
			.await;
	}
	info!(task_id = %task.id, kind = %task.kind, targets = targets.len(), "task dispatched");
	Ok(Json(task))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
	#[serde(default)]
	pub node_id: String,
}

pub async fn list_tasks(
	State(state): State<AppState>,
	headers: HeaderMap,
	Query(query): Query<ListQuery>,
) -> Result<Json<Value>, ServerError> {
	require_operator(&state.tokens, &headers)?;
	let items = state
		.store
		.list_tasks(&query.node_id, TASK_LIST_LIMIT)
		.await?;
	Ok(Json(json!({ "items": items })))
}
