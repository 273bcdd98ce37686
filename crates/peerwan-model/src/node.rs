// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::policy::PolicyRule;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Registered node state plus desired overlay properties.
///
/// `private_key` and `provision_token` are controller-side secrets: they are
/// never serialized here. The store wraps nodes in its own record type when it
/// needs to persist them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
	pub id: String,
	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub public_key: String,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub endpoints: Vec<String>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub cidrs: Vec<String>,
	/// Store-assigned record revision (`v0.0.<n>`), bumped on every upsert.
	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub config_version: String,
	#[serde(default, skip_serializing_if = "is_zero_u16")]
	pub listen_port: u16,
	/// Host-scoped address on the overlay, e.g. `10.10.2.1/32`.
	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub overlay_ip: String,
	#[serde(default, skip_serializing_if = "is_zero_u32")]
	pub asn: u32,
	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub router_id: String,
	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub egress_peer_id: String,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub policy_rules: Vec<PolicyRule>,
	#[serde(default, skip_serializing_if = "std::ops::Not::not")]
	pub default_route: bool,
	/// CIDRs whose traffic stays on local routing (management access).
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub bypass_cidrs: Vec<String>,
	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub default_route_next_hop: String,
	/// Per-peer endpoint overrides, keyed by peer node id.
	#[serde(default, skip_serializing_if = "HashMap::is_empty")]
	pub peer_endpoints: HashMap<String, String>,
	#[serde(skip)]
	pub private_key: String,
	#[serde(skip)]
	pub provision_token: String,
}

impl Node {
	/// Overlay host without the prefix length, used as the default router id
	/// and as the BGP next-hop address.
	pub fn overlay_host(&self) -> &str {
		host_of(&self.overlay_ip)
	}

	/// Whether two records carry the same operator-visible intent. Secrets,
	/// revisions and policy are compared elsewhere; this gates the
	/// skip-unchanged-registration path.
	pub fn same_intent(&self, other: &Node) -> bool {
		self.id == other.id
			&& self.public_key == other.public_key
			&& self.listen_port == other.listen_port
			&& self.overlay_ip == other.overlay_ip
			&& self.asn == other.asn
			&& self.router_id == other.router_id
			&& self.endpoints == other.endpoints
			&& self.cidrs == other.cidrs
			&& self.peer_endpoints == other.peer_endpoints
	}
}

/// Strip the prefix length from a CIDR-style address.
pub fn host_of(cidr: &str) -> &str {
	match cidr.find('/') {
		Some(idx) => &cidr[..idx],
		None => cidr,
	}
}

fn is_zero_u16(v: &u16) -> bool {
	*v == 0
}

fn is_zero_u32(v: &u32) -> bool {
	*v == 0
}
