// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Coarse node liveness as judged by the agent itself.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
	#[default]
	Up,
	Degraded,
	Down,
}

/// Periodic health snapshot posted by an agent.
///
/// Latency and loss maps are keyed by the probed peer overlay address;
/// `bgp_state` is keyed by neighbor address with the session state string
/// (`Established` when healthy).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
	pub node_id: String,
	#[serde(default)]
	pub status: HealthStatus,
	#[serde(default, skip_serializing_if = "HashMap::is_empty")]
	pub latency_ms: HashMap<String, u32>,
	#[serde(default, skip_serializing_if = "HashMap::is_empty")]
	pub packet_loss: HashMap<String, f64>,
	#[serde(default, skip_serializing_if = "HashMap::is_empty")]
	pub bgp_state: HashMap<String, String>,
	#[serde(default = "Utc::now")]
	pub timestamp: DateTime<Utc>,
}

impl HealthReport {
	/// Minimum observed latency, if any probe succeeded.
	pub fn min_latency_ms(&self) -> Option<u32> {
		self.latency_ms.values().copied().min()
	}

	/// Number of neighbors not in the `Established` state.
	pub fn unestablished_neighbors(&self) -> usize {
		self
			.bgp_state
			.values()
			.filter(|state| !state.eq_ignore_ascii_case("established"))
			.count()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn status_serializes_lowercase() {
		let report = HealthReport {
			node_id: "edge-1".to_string(),
			status: HealthStatus::Degraded,
			..Default::default()
		};
		let json = serde_json::to_value(&report).unwrap();
		assert_eq!(json["status"], "degraded");
	}

	#[test]
	fn min_latency_over_probes() {
		let mut report = HealthReport::default();
		report.latency_ms.insert("10.10.2.1".to_string(), 50);
		report.latency_ms.insert("10.10.3.1".to_string(), 10);
		assert_eq!(report.min_latency_ms(), Some(10));
	}

	#[test]
	fn counts_unestablished_case_insensitively() {
		let mut report = HealthReport::default();
		report
			.bgp_state
			.insert("10.10.2.1".to_string(), "Established".to_string());
		report
			.bgp_state
			.insert("10.10.3.1".to_string(), "Connect".to_string());
		assert_eq!(report.unestablished_neighbors(), 1);
	}
}
