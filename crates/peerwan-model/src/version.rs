// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Version string helpers shared by the store and the plan service.

/// Store-assigned node record revision.
pub fn node_revision(n: u64) -> String {
	format!("v0.0.{n}")
}

/// Plan config version embedding the global plan counter.
pub fn dynamic_version(n: i64) -> String {
	format!("dynamic-v{n}")
}

/// Extract the numeric counter from a `dynamic-v<n>` config version.
/// Non-dynamic versions parse as `None` so callers fall back to
/// always-apply semantics.
pub fn parse_dynamic_version(config_version: &str) -> Option<i64> {
	config_version
		.strip_prefix("dynamic-v")
		.and_then(|rest| rest.parse().ok())
}
