// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single step of a multi-step task, as reported by one node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStep {
	pub name: String,
	/// pending / running / success / fail
	pub status: String,
	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub message: String,
	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub node_id: String,
	#[serde(default = "Utc::now")]
	pub timestamp: DateTime<Utc>,
}

/// A multi-step action (`policy_apply`, `policy_diag`, `verify`) dispatched
/// to one or more nodes over the message hub.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
	pub id: String,
	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub node_id: String,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub targets: Vec<String>,
	#[serde(rename = "type")]
	pub kind: String,
	pub status: String,
	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub overall_status: String,
	pub steps: Vec<TaskStep>,
	#[serde(default = "Utc::now")]
	pub created_at: DateTime<Utc>,
	#[serde(default = "Utc::now")]
	pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn kind_serializes_as_type() {
		let task = Task {
			id: "t1".to_string(),
			kind: "policy_apply".to_string(),
			status: "running".to_string(),
			..Default::default()
		};
		let json = serde_json::to_value(&task).unwrap();
		assert_eq!(json["type"], "policy_apply");
	}
}
