// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Controller-side diagnosis of one node from the telemetry it has (or has
//! not) been sending.

use crate::auth::require_operator;
use crate::error::ServerError;
use crate::AppState;
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::Json;
use chrono::{DateTime, Utc};
use peerwan_model::{node::host_of, HealthReport, Node, Plan, Settings};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Serialize)]
pub struct DiagnoseResult {
	pub check: String,
	pub status: String,
	/// Mirrors `status`; kept separate for UI coloring.
	pub severity: String,
	pub detail: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnoseResponse {
	pub node_id: String,
	pub summary: String,
	pub results: Vec<DiagnoseResult>,
	pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnoseQuery {
	#[serde(default)]
	pub node_id: String,
}

pub async fn diagnose(
	State(state): State<AppState>,
	headers: HeaderMap,
	Query(query): Query<DiagnoseQuery>,
) -> Result<Json<DiagnoseResponse>, ServerError> {
	require_operator(&state.tokens, &headers)?;
	if query.node_id.is_empty() {
		return Err(ServerError::BadRequest("nodeId is required".to_string()));
	}
	let node = state.store.get_node(&query.node_id).await?;
	let Some(node) = node else {
		return Ok(Json(DiagnoseResponse {
			node_id: query.node_id,
			summary: "node not found".to_string(),
			results: vec![result("node exists", "fail", "no such node")],
			timestamp: Utc::now(),
		}));
	};
	let settings = state.store.get_settings().await?.or_defaults();
	let health = state
		.store
		.list_health()
		.await?
		.into_iter()
		.find(|h| h.node_id == node.id);
	let plan = state.store.get_plan(&node.id).await?;
	Ok(Json(diagnose_node(&node, health, plan, &settings)))
}

fn result(check: &str, status: &str, detail: impl Into<String>) -> DiagnoseResult {
	DiagnoseResult {
		check: check.to_string(),
		status: status.to_string(),
		severity: status.to_string(),
		detail: detail.into(),
	}
}

fn diagnose_node(
	node: &Node,
	health: Option<HealthReport>,
	plan: Option<Plan>,
	settings: &Settings,
) -> DiagnoseResponse {
	let now = Utc::now();
	let mut results = Vec::new();

	let Some(health) = health else {
		return DiagnoseResponse {
			node_id: node.id.clone(),
			summary: "no health reports received".to_string(),
			results: vec![result(
				"agent heartbeat",
				"fail",
				"no health report received; the agent may not be installed or running",
			)],
			timestamp: now,
		};
	};

	let interval = settings.diag.ping_interval_duration();
	let stale_threshold = std::cmp::max(interval * 5, Duration::from_secs(15));
	let age = (now - health.timestamp)
		.to_std()
		.unwrap_or(Duration::ZERO);
	if age > stale_threshold {
		results.push(result(
			"agent heartbeat",
			"warn",
			format!(
				"last report is {}s old; the agent may have stopped or lost connectivity",
				age.as_secs()
			),
		));
	} else {
		results.push(result("agent heartbeat", "ok", "reporting on schedule"));
	}

	if node.endpoints.is_empty() {
		results.push(result(
			"endpoint configuration",
			"warn",
			"no endpoints configured; other nodes cannot dial this one",
		));
	} else {
		results.push(result(
			"endpoint configuration",
			"ok",
			node.endpoints.join(", "),
		));
	}

	let peers = plan.map(|p| p.peers).unwrap_or_default();
	if peers.is_empty() {
		results.push(result(
			"topology plan",
			"warn",
			"no plan or no peers; check controller topology computation",
		));
	} else {
		let mut missing = Vec::new();
		let mut blocked = Vec::new();
		for peer in &peers {
			let overlay = peer
				.overlay_ip()
				.map(host_of)
				.unwrap_or_default();
			match health.latency_ms.get(overlay) {
				None => missing.push(peer.id.clone()),
				Some(_) => {
					let loss = health.packet_loss.get(overlay).copied().unwrap_or(0.0);
					if loss >= 100.0 {
						blocked.push(format!("{}(loss={loss:.0}%)", peer.id));
					}
				}
			}
		}
		if !blocked.is_empty() {
			results.push(result(
				"tunnel/firewall",
				"fail",
				format!("peers with total packet loss: {}", blocked.join(", ")),
			));
		}
		if !missing.is_empty() {
			results.push(result(
				"tunnel links",
				"warn",
				format!(
					"no latency data for: {}; handshakes may be failing or blocked",
					missing.join(", ")
				),
			));
		} else {
			results.push(result(
				"tunnel links",
				"ok",
				"latency and loss data received for all peers",
			));
		}
	}

	if !health.bgp_state.is_empty() {
		let bad: Vec<String> = health
			.bgp_state
			.iter()
			.filter(|(_, state)| !state.eq_ignore_ascii_case("established"))
			.map(|(neighbor, state)| format!("{neighbor}={state}"))
			.collect();
		if bad.is_empty() {
			results.push(result(
				"routing neighbors",
				"ok",
				"all neighbors established",
			));
		} else {
			results.push(result(
				"routing neighbors",
				"warn",
				format!("neighbors not established: {}", bad.join("; ")),
			));
		}
	}

	let summary = summarize(&results);
	DiagnoseResponse {
		node_id: node.id.clone(),
		summary,
		results,
		timestamp: now,
	}
}

fn summarize(results: &[DiagnoseResult]) -> String {
	let rank = |s: &str| match s {
		"fail" => 3,
		"warn" => 2,
		"ok" => 1,
		_ => 0,
	};
	match results.iter().map(|r| rank(&r.severity)).max().unwrap_or(0) {
		3 => "blocking errors found".to_string(),
		2 => "warnings present; investigation recommended".to_string(),
		_ => "all checks passed".to_string(),
	}
}
