// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Text renderers for the tunnel daemon and routing daemon configs. Pure
//! functions; the reconciler decides what goes in and writes the results.

use peerwan_model::{node::host_of, Node, Peer};
use std::fmt::Write;

/// wg-quick compatible interface config with one `[Peer]` block per peer.
/// Endpoints honor the node's per-peer overrides.
pub fn render_wireguard(node: &Node, peers: &[Peer], private_key: &str) -> String {
	let mut out = String::new();
	out.push_str("[Interface]\n");
	if !node.overlay_ip.is_empty() {
		let _ = writeln!(out, "Address = {}", node.overlay_ip);
	}
	if node.listen_port > 0 {
		let _ = writeln!(out, "ListenPort = {}", node.listen_port);
	}
	if !private_key.is_empty() {
		let _ = writeln!(out, "PrivateKey = {private_key}");
	}
	out.push('\n');

	for peer in peers {
		out.push_str("[Peer]\n");
		let _ = writeln!(out, "PublicKey = {}", peer.public_key);
		let endpoint = node
			.peer_endpoints
			.get(&peer.id)
			.filter(|ep| !ep.is_empty())
			.map(String::as_str)
			.unwrap_or(&peer.endpoint);
		if !endpoint.is_empty() {
			let _ = writeln!(out, "Endpoint = {endpoint}");
		}
		if !peer.allowed_ips.is_empty() {
			let _ = writeln!(out, "AllowedIPs = {}", peer.allowed_ips.join(", "));
		}
		if peer.keepalive > 0 {
			let _ = writeln!(out, "PersistentKeepalive = {}", peer.keepalive);
		}
		out.push('\n');
	}
	out
}

/// Minimal bgpd.conf for iBGP across the overlay: one neighbor per peer
/// overlay address, `network` lines for announced prefixes, a static default
/// via the egress overlay when set, and one static route per expanded policy
/// prefix.
pub fn render_bgp(
	asn: u32,
	router_id: &str,
	iface: &str,
	neighbors: &[String],
	advertised: &[String],
	default_next_hop: Option<&str>,
	static_routes: &[(String, String)],
) -> String {
	let asn = if asn == 0 { 65000 } else { asn };
	let iface = if iface.is_empty() { "wg0" } else { iface };
	let mut out = String::new();
	let _ = writeln!(out, "router bgp {asn}");
	if !router_id.is_empty() {
		let _ = writeln!(out, " bgp router-id {router_id}");
	}
	for neighbor in neighbors {
		let neighbor = host_of(neighbor);
		let _ = writeln!(out, " neighbor {neighbor} remote-as {asn}");
		let _ = writeln!(out, " neighbor {neighbor} update-source {iface}");
	}
	for prefix in advertised {
		let _ = writeln!(out, " network {prefix}");
	}
	if let Some(next_hop) = default_next_hop {
		let _ = writeln!(out, " ip route 0.0.0.0/0 {}", host_of(next_hop));
	}
	for (prefix, next_hop) in static_routes {
		let _ = writeln!(out, " ip route {prefix} {}", host_of(next_hop));
	}
	out.push_str("!\n");
	out
}

/// First allowed prefix of the named peer, by convention its overlay `/32`.
pub fn overlay_for_peer<'a>(peer_id: &str, peers: &'a [Peer]) -> Option<&'a str> {
	peers
		.iter()
		.find(|p| p.id == peer_id)
		.and_then(|p| p.overlay_ip())
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::collections::HashMap;

	fn sample_node() -> Node {
		Node {
			id: "edge-1".to_string(),
			overlay_ip: "10.10.1.1/32".to_string(),
			listen_port: 51820,
			cidrs: vec!["10.1.0.0/24".to_string()],
			..Default::default()
		}
	}

	fn sample_peer() -> Peer {
		Peer {
			id: "edge-2".to_string(),
			public_key: "pk-edge-2".to_string(),
			endpoint: "203.0.113.2:51820".to_string(),
			allowed_ips: vec!["10.10.2.1/32".to_string(), "10.2.0.0/24".to_string()],
			keepalive: 25,
		}
	}

	#[test]
	fn wireguard_config_has_interface_and_peer_blocks() {
		let conf = render_wireguard(&sample_node(), &[sample_peer()], "priv-key");
		assert!(conf.starts_with("[Interface]\n"));
		assert!(conf.contains("Address = 10.10.1.1/32\n"));
		assert!(conf.contains("ListenPort = 51820\n"));
		assert!(conf.contains("PrivateKey = priv-key\n"));
		assert!(conf.contains("[Peer]\nPublicKey = pk-edge-2\n"));
		assert!(conf.contains("Endpoint = 203.0.113.2:51820\n"));
		assert!(conf.contains("AllowedIPs = 10.10.2.1/32, 10.2.0.0/24\n"));
		assert!(conf.contains("PersistentKeepalive = 25\n"));
	}

	#[test]
	fn peer_endpoint_override_wins() {
		let mut node = sample_node();
		let mut overrides = HashMap::new();
		overrides.insert("edge-2".to_string(), "198.51.100.9:443".to_string());
		node.peer_endpoints = overrides;
		let conf = render_wireguard(&node, &[sample_peer()], "");
		assert!(conf.contains("Endpoint = 198.51.100.9:443\n"));
		assert!(!conf.contains("203.0.113.2"));
		assert!(!conf.contains("PrivateKey"));
	}

	#[test]
	fn bgp_config_renders_neighbors_and_routes() {
		let conf = render_bgp(
			65010,
			"10.10.1.1",
			"wg0",
			&["10.10.2.1/32".to_string()],
			&["10.1.0.0/24".to_string()],
			Some("10.10.2.1/32"),
			&[("192.0.2.0/24".to_string(), "10.10.2.1/32".to_string())],
		);
		assert!(conf.starts_with("router bgp 65010\n"));
		assert!(conf.contains(" bgp router-id 10.10.1.1\n"));
		assert!(conf.contains(" neighbor 10.10.2.1 remote-as 65010\n"));
		assert!(conf.contains(" neighbor 10.10.2.1 update-source wg0\n"));
		assert!(conf.contains(" network 10.1.0.0/24\n"));
		assert!(conf.contains(" ip route 0.0.0.0/0 10.10.2.1\n"));
		assert!(conf.contains(" ip route 192.0.2.0/24 10.10.2.1\n"));
		assert!(conf.ends_with("!\n"));
	}

	#[test]
	fn bgp_defaults_cover_missing_asn_and_iface() {
		let conf = render_bgp(0, "", "", &[], &[], None, &[]);
		assert!(conf.starts_with("router bgp 65000\n"));
		assert!(!conf.contains("router-id"));
	}

	#[test]
	fn overlay_lookup_by_peer_id() {
		let peers = vec![sample_peer()];
		assert_eq!(overlay_for_peer("edge-2", &peers), Some("10.10.2.1/32"));
		assert_eq!(overlay_for_peer("edge-9", &peers), None);
	}
}
