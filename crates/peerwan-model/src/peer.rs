// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use serde::{Deserialize, Serialize};

/// A derived tunnel edge: one per `(from, to)` node pair in a plan.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Peer {
	/// Node id of the other end.
	pub id: String,
	#[serde(rename = "publicKey")]
	pub public_key: String,
	#[serde(default, rename = "endpoint", skip_serializing_if = "String::is_empty")]
	pub endpoint: String,
	/// Destination prefixes routed into this tunnel; deduplicated, insertion
	/// order preserved.
	#[serde(rename = "allowedIPs")]
	pub allowed_ips: Vec<String>,
	#[serde(default, rename = "keepaliveSeconds", skip_serializing_if = "is_zero")]
	pub keepalive: u16,
}

impl Peer {
	/// First allowed prefix, by convention the peer's overlay `/32`.
	pub fn overlay_ip(&self) -> Option<&str> {
		self.allowed_ips.first().map(String::as_str)
	}
}

fn is_zero(v: &u16) -> bool {
	*v == 0
}
