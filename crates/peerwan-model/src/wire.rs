// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Request/response bodies and the websocket envelope shared by controller
//! and agent.

use crate::peer::Peer;
use crate::policy::PolicyRule;
use crate::settings::GeoIpConfig;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Envelope for every controller<->agent websocket message.
///
/// Controller → agent: `plan`, `command`, `task`.
/// Agent → controller: `agent_log`, `task_step`, `install_status`,
/// `diag_result`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
	#[serde(rename = "type")]
	pub kind: String,
	#[serde(default, rename = "nodeId", skip_serializing_if = "String::is_empty")]
	pub node_id: String,
	#[serde(default, skip_serializing_if = "Value::is_null")]
	pub payload: Value,
}

impl Envelope {
	pub fn new(kind: impl Into<String>, node_id: impl Into<String>, payload: Value) -> Self {
		Self {
			kind: kind.into(),
			node_id: node_id.into(),
			payload,
		}
	}
}

/// Body of `POST /api/v1/nodes/register`, sent by agents at bootstrap and by
/// operators editing a node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
	pub id: String,
	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub public_key: String,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub endpoints: Vec<String>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub cidrs: Vec<String>,
	/// Re-register even when nothing changed.
	#[serde(default, skip_serializing_if = "std::ops::Not::not")]
	pub force: bool,
	#[serde(default, skip_serializing_if = "is_zero_u16")]
	pub listen_port: u16,
	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub overlay_ip: String,
	#[serde(default, skip_serializing_if = "is_zero_u32")]
	pub asn: u32,
	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub router_id: String,
	#[serde(default, skip_serializing_if = "HashMap::is_empty")]
	pub peer_endpoints: HashMap<String, String>,
	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub provision_token: String,
}

/// The configuration an agent should apply, returned by register and plan
/// fetches and pushed over the hub as a `plan` envelope.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanResponse {
	pub id: String,
	pub config_version: String,
	pub peers: Vec<Peer>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub routes: Vec<String>,
	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub overlay_ip: String,
	#[serde(default, skip_serializing_if = "is_zero_u16")]
	pub listen_port: u16,
	#[serde(default, skip_serializing_if = "is_zero_u32")]
	pub asn: u32,
	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub router_id: String,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub endpoints: Vec<String>,
	/// Only present on the provisioning path.
	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub private_key: String,
	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub public_key: String,
	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub egress_peer_id: String,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub policy_rules: Vec<PolicyRule>,
	#[serde(default, skip_serializing_if = "HashMap::is_empty")]
	pub peer_endpoints: HashMap<String, String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub geoip_config: Option<GeoIpConfig>,
	#[serde(default, skip_serializing_if = "std::ops::Not::not")]
	pub default_route: bool,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub bypass_cidrs: Vec<String>,
	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub default_route_next_hop: String,
	#[serde(default, skip_serializing_if = "is_zero_u64")]
	pub health_interval_sec: u64,
	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PrepareRequest {
	pub id: String,
}

/// Controller-minted identity for a node about to be installed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrepareResponse {
	pub id: String,
	pub public_key: String,
	pub private_key: String,
	pub overlay_ip: String,
	pub listen_port: u16,
	pub provision_token: String,
	/// One-shot install command embedding controller URL, node id and token.
	pub command: String,
}

fn is_zero_u16(v: &u16) -> bool {
	*v == 0
}

fn is_zero_u32(v: &u32) -> bool {
	*v == 0
}

fn is_zero_u64(v: &u64) -> bool {
	*v == 0
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn envelope_kind_serializes_as_type() {
		let env = Envelope::new("plan", "edge-1", serde_json::json!({"configVersion": "dynamic-v3"}));
		let json = serde_json::to_value(&env).unwrap();
		assert_eq!(json["type"], "plan");
		assert_eq!(json["nodeId"], "edge-1");
	}

	#[test]
	fn register_request_accepts_minimal_body() {
		let req: RegisterRequest =
			serde_json::from_str(r#"{"id":"edge-1","provisionToken":"pt-17"}"#).unwrap();
		assert_eq!(req.id, "edge-1");
		assert_eq!(req.provision_token, "pt-17");
		assert!(!req.force);
		assert!(req.endpoints.is_empty());
	}

	#[test]
	fn plan_response_omits_empty_secrets() {
		let resp = PlanResponse {
			id: "edge-1".to_string(),
			config_version: "dynamic-v1".to_string(),
			..Default::default()
		};
		let json = serde_json::to_string(&resp).unwrap();
		assert!(!json.contains("privateKey"));
	}
}
