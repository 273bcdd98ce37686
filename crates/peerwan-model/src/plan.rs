// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::peer::Peer;
use crate::policy::PolicyRule;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A computed, versioned, signed per-node configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
	pub node_id: String,
	/// Globally monotone plan version (shared counter across all nodes).
	pub version: i64,
	/// `dynamic-v<version>`.
	pub config_version: String,
	pub peers: Vec<Peer>,
	/// CIDRs this node announces.
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub routes: Vec<String>,
	pub created_at: DateTime<Utc>,
	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub signature: String,
	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub egress_peer_id: String,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub policy_rules: Vec<PolicyRule>,
	#[serde(default, skip_serializing_if = "HashMap::is_empty")]
	pub peer_endpoints: HashMap<String, String>,
	#[serde(default, skip_serializing_if = "std::ops::Not::not")]
	pub default_route: bool,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub bypass_cidrs: Vec<String>,
	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub default_route_next_hop: String,
}
