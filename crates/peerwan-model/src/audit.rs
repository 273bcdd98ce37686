// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One append-only record of an operation against the control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
	pub actor: String,
	pub action: String,
	pub target: String,
	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub detail: String,
	pub timestamp: DateTime<Utc>,
}

impl AuditEntry {
	pub fn now(
		actor: impl Into<String>,
		action: impl Into<String>,
		target: impl Into<String>,
		detail: impl Into<String>,
	) -> Self {
		Self {
			actor: actor.into(),
			action: action.into(),
			target: target.into(),
			detail: detail.into(),
			timestamp: Utc::now(),
		}
	}
}
