// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use peerwan_model::Peer;
use sha2::{Digest, Sha256};

/// Content signature over a composed plan: sha256 of the node id, the config
/// version, then each peer in plan order as its id followed by its allowed-IP
/// set sorted lexicographically and joined with `,`. Sorting makes the
/// signature insensitive to allowed-IP ordering so rollback verification
/// survives planner reordering.
pub fn sign_plan(node_id: &str, config_version: &str, peers: &[Peer]) -> String {
	let mut hasher = Sha256::new();
	hasher.update(node_id.as_bytes());
	hasher.update(config_version.as_bytes());
	for peer in peers {
		hasher.update(peer.id.as_bytes());
		let mut allowed = peer.allowed_ips.clone();
		allowed.sort();
		hasher.update(allowed.join(",").as_bytes());
	}
	let digest = hasher.finalize();
	digest.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
	use super::*;

	fn peer(id: &str, allowed: &[&str]) -> Peer {
		Peer {
			id: id.to_string(),
			public_key: format!("pk-{id}"),
			allowed_ips: allowed.iter().map(|s| s.to_string()).collect(),
			..Default::default()
		}
	}

	#[test]
	fn deterministic_for_equal_input() {
		let peers = vec![peer("b", &["10.10.2.1/32", "10.2.0.0/24"])];
		let a = sign_plan("edge-1", "dynamic-v3", &peers);
		let b = sign_plan("edge-1", "dynamic-v3", &peers);
		assert_eq!(a, b);
		assert_eq!(a.len(), 64);
	}

	#[test]
	fn allowed_ip_order_does_not_matter() {
		let forward = vec![peer("b", &["10.10.2.1/32", "10.2.0.0/24"])];
		let reversed = vec![peer("b", &["10.2.0.0/24", "10.10.2.1/32"])];
		assert_eq!(
			sign_plan("edge-1", "dynamic-v3", &forward),
			sign_plan("edge-1", "dynamic-v3", &reversed)
		);
	}

	#[test]
	fn peer_order_and_version_do_matter() {
		let ab = vec![peer("a", &["10.10.1.1/32"]), peer("b", &["10.10.2.1/32"])];
		let ba = vec![peer("b", &["10.10.2.1/32"]), peer("a", &["10.10.1.1/32"])];
		assert_ne!(
			sign_plan("edge-1", "dynamic-v3", &ab),
			sign_plan("edge-1", "dynamic-v3", &ba)
		);
		assert_ne!(
			sign_plan("edge-1", "dynamic-v3", &ab),
			sign_plan("edge-1", "dynamic-v4", &ab)
		);
	}
}
