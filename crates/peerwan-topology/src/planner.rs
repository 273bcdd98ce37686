// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use peerwan_model::{HealthReport, HealthStatus, Node, Peer};
use std::collections::HashMap;

/// Default score for a node with no latency data; any measured peer beats it.
const UNMEASURED_SCORE: u32 = 100_000;
/// Penalty per routing neighbor not in the Established state.
const UNESTABLISHED_PENALTY: u32 = 10_000;
const KEEPALIVE_SECONDS: u16 = 25;

/// Derive the ordered peer list for `target_id` from the full node set and
/// the latest health per node.
///
/// Nodes without announced CIDRs or a public key are not peers; nodes
/// reported `down` are skipped outright. A candidate's latency is the best
/// measurement the mesh holds for it: the minimum of its own probe map and
/// the latency the target itself observed toward the candidate's overlay
/// address (a freshly probed peer that has not reported yet is still
/// rankable). Unmeasured candidates score [`UNMEASURED_SCORE`]; each
/// unestablished routing neighbor adds a penalty. The result is
/// stable-sorted ascending, so equal scores keep the input order and the
/// output is deterministic.
pub fn build_peer_plan(
	target_id: &str,
	nodes: &[Node],
	health: &HashMap<String, HealthReport>,
) -> Vec<Peer> {
	let target_health = health.get(target_id);
	let mut scored: Vec<(Peer, u32)> = Vec::new();
	for node in nodes {
		if node.id == target_id {
			continue;
		}
		if node.cidrs.is_empty() || node.public_key.is_empty() {
			continue;
		}
		let mut score = UNMEASURED_SCORE;
		if let Some(report) = health.get(&node.id) {
			if report.status == HealthStatus::Down {
				continue;
			}
			if let Some(min) = report.min_latency_ms() {
				score = min;
			}
		}
		if let Some(observed) = target_health
			.and_then(|report| report.latency_ms.get(node.overlay_host()))
		{
			score = score.min(*observed);
		}
		if let Some(report) = health.get(&node.id) {
			score += report.unestablished_neighbors() as u32 * UNESTABLISHED_PENALTY;
		}
		let mut allowed_ips: Vec<String> = Vec::new();
		if !node.overlay_ip.is_empty() {
			allowed_ips.push(node.overlay_ip.clone());
		}
		for cidr in &node.cidrs {
			if !allowed_ips.contains(cidr) {
				allowed_ips.push(cidr.clone());
			}
		}
		scored.push((
			Peer {
				id: node.id.clone(),
				public_key: node.public_key.clone(),
				endpoint: node.endpoints.first().cloned().unwrap_or_default(),
				allowed_ips,
				keepalive: KEEPALIVE_SECONDS,
			},
			score,
		));
	}
	scored.sort_by_key(|(_, score)| *score);
	scored.into_iter().map(|(peer, _)| peer).collect()
}

#[cfg(test)]
mod tests {
	use super::*;

	fn node(id: &str, endpoint: &str, overlay: &str, cidr: &str) -> Node {
		Node {
			id: id.to_string(),
			public_key: format!("pk-{id}"),
			endpoints: vec![endpoint.to_string()],
			overlay_ip: overlay.to_string(),
			cidrs: vec![cidr.to_string()],
			..Default::default()
		}
	}

	fn three_nodes() -> Vec<Node> {
		vec![
			node("a", "203.0.113.1:51820", "10.10.1.1/32", "10.1.0.0/24"),
			node("b", "203.0.113.2:51820", "10.10.2.1/32", "10.2.0.0/24"),
			node("c", "203.0.113.3:51820", "10.10.3.1/32", "10.3.0.0/24"),
		]
	}

	#[test]
	fn target_is_never_its_own_peer() {
		let nodes = three_nodes();
		let peers = build_peer_plan("a", &nodes, &HashMap::new());
		assert_eq!(peers.len(), 2);
		assert!(peers.iter().all(|p| p.id != "a"));
	}

	#[test]
	fn two_node_mesh_produces_expected_peer() {
		let nodes = vec![
			node("edge-1", "203.0.113.1:51820", "10.10.1.1/32", "10.1.0.0/24"),
			node("edge-2", "203.0.113.2:51820", "10.10.2.1/32", "10.2.0.0/24"),
		];
		let peers = build_peer_plan("edge-1", &nodes, &HashMap::new());
		assert_eq!(peers.len(), 1);
		let peer = &peers[0];
		assert_eq!(peer.id, "edge-2");
		assert_eq!(peer.endpoint, "203.0.113.2:51820");
		assert_eq!(peer.allowed_ips, vec!["10.10.2.1/32", "10.2.0.0/24"]);
		assert_eq!(peer.keepalive, 25);
	}

	#[test]
	fn latency_orders_peers_ascending() {
		let nodes = three_nodes();
		let mut health = HashMap::new();
		let mut hb = HealthReport {
			node_id: "b".to_string(),
			..Default::default()
		};
		hb.latency_ms.insert("10.10.1.1".to_string(), 50);
		health.insert("b".to_string(), hb);
		let mut hc = HealthReport {
			node_id: "c".to_string(),
			..Default::default()
		};
		hc.latency_ms.insert("10.10.1.1".to_string(), 10);
		health.insert("c".to_string(), hc);

		let peers = build_peer_plan("a", &nodes, &health);
		let order: Vec<&str> = peers.iter().map(|p| p.id.as_str()).collect();
		assert_eq!(order, vec!["c", "b"]);
	}

	#[test]
	fn targets_own_probes_rank_unreported_peers() {
		let nodes = three_nodes();
		// Only the target has reported; its probe map covers both candidates.
		let mut ha = HealthReport {
			node_id: "a".to_string(),
			..Default::default()
		};
		ha.latency_ms.insert("10.10.2.1".to_string(), 50);
		ha.latency_ms.insert("10.10.3.1".to_string(), 10);
		let mut health = HashMap::new();
		health.insert("a".to_string(), ha);

		let peers = build_peer_plan("a", &nodes, &health);
		let order: Vec<&str> = peers.iter().map(|p| p.id.as_str()).collect();
		assert_eq!(order, vec!["c", "b"]);
	}

	#[test]
	fn down_nodes_are_excluded() {
		let nodes = three_nodes();
		let mut health = HashMap::new();
		health.insert(
			"b".to_string(),
			HealthReport {
				node_id: "b".to_string(),
				status: HealthStatus::Down,
				..Default::default()
			},
		);
		let peers = build_peer_plan("a", &nodes, &health);
		assert!(peers.iter().all(|p| p.id != "b"));
	}

	#[test]
	fn unestablished_neighbors_deprioritize() {
		let nodes = three_nodes();
		let mut health = HashMap::new();
		let mut hb = HealthReport {
			node_id: "b".to_string(),
			..Default::default()
		};
		hb.latency_ms.insert("10.10.1.1".to_string(), 5);
		hb.bgp_state
			.insert("10.10.3.1".to_string(), "Connect".to_string());
		health.insert("b".to_string(), hb);
		let mut hc = HealthReport {
			node_id: "c".to_string(),
			..Default::default()
		};
		hc.latency_ms.insert("10.10.1.1".to_string(), 80);
		health.insert("c".to_string(), hc);

		// b has lower latency but a broken neighbor; c wins.
		let peers = build_peer_plan("a", &nodes, &health);
		assert_eq!(peers[0].id, "c");
	}

	#[test]
	fn nodes_without_key_or_cidrs_are_skipped() {
		let mut nodes = three_nodes();
		nodes[1].public_key = String::new();
		nodes[2].cidrs.clear();
		let peers = build_peer_plan("a", &nodes, &HashMap::new());
		assert!(peers.is_empty());
	}

	#[test]
	fn allowed_ips_dedupe_preserving_order() {
		let mut n = node("b", "203.0.113.2:51820", "10.10.2.1/32", "10.2.0.0/24");
		n.cidrs = vec![
			"10.10.2.1/32".to_string(),
			"10.2.0.0/24".to_string(),
			"10.2.0.0/24".to_string(),
		];
		let nodes = vec![
			node("a", "203.0.113.1:51820", "10.10.1.1/32", "10.1.0.0/24"),
			n,
		];
		let peers = build_peer_plan("a", &nodes, &HashMap::new());
		assert_eq!(peers[0].allowed_ips, vec!["10.10.2.1/32", "10.2.0.0/24"]);
	}

	#[test]
	fn equal_scores_keep_input_order() {
		let nodes = three_nodes();
		let peers = build_peer_plan("c", &nodes, &HashMap::new());
		let order: Vec<&str> = peers.iter().map(|p| p.id.as_str()).collect();
		assert_eq!(order, vec!["a", "b"]);
	}
}
