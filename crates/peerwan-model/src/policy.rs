// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An operator-authored forwarding instruction: a target specifier (CIDR,
/// bare IP, domain list, or `geoip:CC` / `geoip6:CC`) mapped to a next hop or
/// an ordered multi-hop path whose last element is the egress.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyRule {
	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub prefix: String,
	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub via_node: String,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub path: Vec<String>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub domains: Vec<String>,
}

impl PolicyRule {
	/// A rule needs at least one target specifier and one forwarding target.
	pub fn is_valid(&self) -> bool {
		(!self.prefix.is_empty() || !self.domains.is_empty())
			&& (!self.via_node.is_empty() || !self.path.is_empty())
	}

	/// The node a matching packet is handed to first: the head of the path
	/// when one is set, otherwise the single next hop.
	pub fn next_hop(&self) -> &str {
		match self.path.first() {
			Some(first) => first,
			None => &self.via_node,
		}
	}
}

/// Install/apply status reported by the agent for policy or default-route
/// changes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyInstallLog {
	pub node_id: String,
	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub version: String,
	/// applying / success / failed / checking
	pub status: String,
	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub message: String,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub logs: Vec<String>,
	#[serde(default = "Utc::now")]
	pub timestamp: DateTime<Utc>,
}

/// One check result inside a diagnostic snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyDiagCheck {
	pub name: String,
	/// ok / warn / fail / info
	pub status: String,
	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub detail: String,
}

/// A diagnostic snapshot of the policy/install state on one node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyDiagReport {
	pub node_id: String,
	pub summary: String,
	pub checks: Vec<PolicyDiagCheck>,
	#[serde(default = "Utc::now")]
	pub timestamp: DateTime<Utc>,
}

impl PolicyDiagReport {
	/// Worst severity across all checks: fail > warn > ok > info.
	pub fn worst_status(&self) -> &'static str {
		let rank = |s: &str| match s {
			"fail" => 3,
			"warn" => 2,
			"ok" => 1,
			_ => 0,
		};
		match self.checks.iter().map(|c| rank(&c.status)).max() {
			Some(3) => "fail",
			Some(2) => "warn",
			Some(1) => "ok",
			_ => "info",
		}
	}
}
