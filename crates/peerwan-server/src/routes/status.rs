// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Mesh overview: nodes with best-effort geolocation and pairwise link
//! health derived from the latest reports.

use crate::auth::require_operator;
use crate::error::ServerError;
use crate::geo::GeoLocation;
use crate::AppState;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use peerwan_model::{node::host_of, HealthReport, Node};
use serde::Serialize;
use std::collections::HashMap;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
	pub id: String,
	#[serde(skip_serializing_if = "String::is_empty")]
	pub overlay_ip: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub location: Option<GeoLocation>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkStatus {
	pub from: String,
	pub to: String,
	pub ok: bool,
	#[serde(skip_serializing_if = "is_zero")]
	pub latency_ms: u32,
	#[serde(skip_serializing_if = "is_zero_f64")]
	pub packet_loss: f64,
	#[serde(skip_serializing_if = "String::is_empty")]
	pub probe_ip: String,
	#[serde(skip_serializing_if = "String::is_empty")]
	pub reason: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MeshStatusResponse {
	pub nodes: Vec<NodeStatus>,
	pub links: Vec<LinkStatus>,
	#[serde(skip_serializing_if = "is_zero_u64")]
	pub ping_interval_sec: u64,
}

pub async fn mesh(
	State(state): State<AppState>,
	headers: HeaderMap,
) -> Result<Json<MeshStatusResponse>, ServerError> {
	require_operator(&state.tokens, &headers)?;
	let nodes = state.store.list_nodes().await?;
	let health = state.store.list_health().await?;
	let settings = state.store.get_settings().await?.or_defaults();

	let mut statuses = Vec::with_capacity(nodes.len());
	for node in &nodes {
		let probe_ip = node
			.endpoints
			.first()
			.and_then(|ep| ep.rsplit_once(':').map(|(host, _)| host.trim_matches(['[', ']'])))
			.filter(|host| !host.is_empty())
			.map(str::to_string)
			.unwrap_or_else(|| host_of(&node.overlay_ip).to_string());
		statuses.push(NodeStatus {
			id: node.id.clone(),
			overlay_ip: host_of(&node.overlay_ip).to_string(),
			location: state.geo.resolve(&probe_ip).await,
		});
	}

	Ok(Json(MeshStatusResponse {
		nodes: statuses,
		links: build_links(&nodes, &health),
		ping_interval_sec: settings.diag.ping_interval_duration().as_secs(),
	}))
}

/// One link per node pair; telemetry from either side counts, missing
/// endpoints or 100% loss mark the link down.
fn build_links(nodes: &[Node], health: &[HealthReport]) -> Vec<LinkStatus> {
	let by_node: HashMap<&str, &HealthReport> =
		health.iter().map(|h| (h.node_id.as_str(), h)).collect();
	let mut links = Vec::new();
	for i in 0..nodes.len() {
		for j in (i + 1)..nodes.len() {
			let (a, b) = (&nodes[i], &nodes[j]);
			let mut link = LinkStatus {
				from: a.id.clone(),
				to: b.id.clone(),
				ok: false,
				latency_ms: 0,
				packet_loss: 0.0,
				probe_ip: String::new(),
				reason: String::new(),
			};
			if a.endpoints.is_empty() || b.endpoints.is_empty() {
				link.reason = "missing endpoint".to_string();
				links.push(link);
				continue;
			}
			let a_ip = host_of(&a.overlay_ip);
			let b_ip = host_of(&b.overlay_ip);
			let observed = by_node
				.get(a.id.as_str())
				.and_then(|h| h.latency_ms.get(b_ip).map(|ms| (*ms, h.packet_loss.get(b_ip), b_ip)))
				.or_else(|| {
					by_node.get(b.id.as_str()).and_then(|h| {
						h.latency_ms.get(a_ip).map(|ms| (*ms, h.packet_loss.get(a_ip), a_ip))
					})
				});
			match observed {
				Some((latency, loss, probe_ip)) => {
					link.latency_ms = latency;
					link.packet_loss = loss.copied().unwrap_or(0.0);
					link.probe_ip = probe_ip.to_string();
					link.ok = link.packet_loss < 100.0;
					if !link.ok {
						link.reason = "packet loss 100%".to_string();
					}
				}
				None => {
					link.reason = "no telemetry".to_string();
				}
			}
			links.push(link);
		}
	}
	links
}

fn is_zero(v: &u32) -> bool {
	*v == 0
}

fn is_zero_f64(v: &f64) -> bool {
	*v == 0.0
}

fn is_zero_u64(v: &u64) -> bool {
	*v == 0
}

#[cfg(test)]
mod tests {
	use super::*;

	fn node(id: &str, endpoint: Option<&str>, overlay: &str) -> Node {
		Node {
			id: id.to_string(),
			endpoints: endpoint.map(|e| vec![e.to_string()]).unwrap_or_default(),
			overlay_ip: overlay.to_string(),
			..Default::default()
		}
	}

	#[test]
	fn link_down_without_endpoints_or_telemetry() {
		let nodes = vec![
			node("a", Some("203.0.113.1:51820"), "10.10.1.1/32"),
			node("b", None, "10.10.2.1/32"),
			node("c", Some("203.0.113.3:51820"), "10.10.3.1/32"),
		];
		let links = build_links(&nodes, &[]);
		assert_eq!(links.len(), 3);
		let ab = &links[0];
		assert!(!ab.ok);
		assert_eq!(ab.reason, "missing endpoint");
		let ac = &links[1];
		assert_eq!(ac.reason, "no telemetry");
	}

	#[test]
	fn telemetry_from_either_side_marks_link() {
		let nodes = vec![
			node("a", Some("203.0.113.1:51820"), "10.10.1.1/32"),
			node("b", Some("203.0.113.2:51820"), "10.10.2.1/32"),
		];
		let mut report = HealthReport {
			node_id: "b".to_string(),
			..Default::default()
		};
		report.latency_ms.insert("10.10.1.1".to_string(), 12);
		let links = build_links(&nodes, &[report]);
		assert!(links[0].ok);
		assert_eq!(links[0].latency_ms, 12);
		assert_eq!(links[0].probe_ip, "10.10.1.1");
	}

	#[test]
	fn total_loss_marks_link_down() {
		let nodes = vec![
			node("a", Some("203.0.113.1:51820"), "10.10.1.1/32"),
			node("b", Some("203.0.113.2:51820"), "10.10.2.1/32"),
		];
		let mut report = HealthReport {
			node_id: "a".to_string(),
			..Default::default()
		};
		report.latency_ms.insert("10.10.2.1".to_string(), 5);
		report.packet_loss.insert("10.10.2.1".to_string(), 100.0);
		let links = build_links(&nodes, &[report]);
		assert!(!links[0].ok);
		assert_eq!(links[0].reason, "packet loss 100%");
	}
}
