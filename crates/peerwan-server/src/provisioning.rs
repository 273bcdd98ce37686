// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! One-time provisioning: mint a tunnel keypair, allocate an overlay host,
//! bind a one-shot token, and hand the operator an install command.

use base64::prelude::*;
use peerwan_model::{node::host_of, Node};
use rand::rngs::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};

pub const DEFAULT_LISTEN_PORT: u16 = 51820;
pub const DEFAULT_ASN: u32 = 65000;
const OVERLAY_FALLBACK: &str = "10.10.250.1/32";

#[derive(Debug, Clone)]
pub struct KeyPair {
	pub private_key: String,
	pub public_key: String,
}

/// Fresh Curve25519 keypair, base64 per the tunnel daemon's key format.
pub fn generate_keypair() -> KeyPair {
	let secret = StaticSecret::random_from_rng(&mut OsRng);
	let public = PublicKey::from(&secret);
	KeyPair {
		private_key: BASE64_STANDARD.encode(secret.to_bytes()),
		public_key: BASE64_STANDARD.encode(public.to_bytes()),
	}
}

/// First free `10.10.<octet>.1/32` host, scanning the registered nodes.
pub fn allocate_overlay(nodes: &[Node]) -> String {
	let mut used = [false; 256];
	for node in nodes {
		let host = host_of(&node.overlay_ip);
		let mut parts = host.split('.');
		if parts.next() == Some("10") && parts.next() == Some("10") {
			if let Some(octet) = parts.next().and_then(|s| s.parse::<usize>().ok()) {
				if octet < 256 {
					used[octet] = true;
				}
			}
		}
	}
	for octet in 1..254 {
		if !used[octet] {
			return format!("10.10.{octet}.1/32");
		}
	}
	OVERLAY_FALLBACK.to_string()
}

/// Opaque one-time token, unique per prepare call.
pub fn mint_provision_token() -> String {
	let nanos = chrono::Utc::now()
		.timestamp_nanos_opt()
		.unwrap_or_default();
	format!("pt-{nanos}")
}

/// The one-shot install command shown to the operator after prepare.
pub fn install_command(controller_addr: &str, node_id: &str, token: &str) -> String {
	format!(
		"curl -fsSL https://raw.githubusercontent.com/ghuntley/peerwan/main/scripts/agent-install.sh -o /tmp/agent-install.sh && chmod +x /tmp/agent-install.sh && sudo /tmp/agent-install.sh --controller={controller_addr} --node-id={node_id} --provision-token={token} --auto-endpoint=true"
	)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn keypair_is_base64_32_bytes() {
		let pair = generate_keypair();
		assert_eq!(BASE64_STANDARD.decode(&pair.private_key).unwrap().len(), 32);
		assert_eq!(BASE64_STANDARD.decode(&pair.public_key).unwrap().len(), 32);
		assert_ne!(pair.private_key, pair.public_key);
	}

	#[test]
	fn overlay_allocation_skips_used_octets() {
		assert_eq!(allocate_overlay(&[]), "10.10.1.1/32");
		let nodes = vec![
			Node {
				id: "a".to_string(),
				overlay_ip: "10.10.1.1/32".to_string(),
				..Default::default()
			},
			Node {
				id: "b".to_string(),
				overlay_ip: "10.10.2.1/32".to_string(),
				..Default::default()
			},
		];
		assert_eq!(allocate_overlay(&nodes), "10.10.3.1/32");
	}

	#[test]
	fn overlay_allocation_falls_back_when_exhausted() {
		let nodes: Vec<Node> = (1..254)
			.map(|octet| Node {
				id: format!("n{octet}"),
				overlay_ip: format!("10.10.{octet}.1/32"),
				..Default::default()
			})
			.collect();
		assert_eq!(allocate_overlay(&nodes), OVERLAY_FALLBACK);
	}

	#[test]
	fn provision_token_shape() {
		let token = mint_provision_token();
		assert!(token.starts_with("pt-"));
		assert!(token[3..].chars().all(|c| c.is_ascii_digit()));
	}

	#[test]
	fn install_command_embeds_identity() {
		let cmd = install_command("https://ctrl.example.com:8080", "edge-1", "pt-7");
		assert!(cmd.contains("--controller=https://ctrl.example.com:8080"));
		assert!(cmd.contains("--node-id=edge-1"));
		assert!(cmd.contains("--provision-token=pt-7"));
	}
}
