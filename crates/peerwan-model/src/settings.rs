// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_GEOIP_CACHE_DIR: &str = "/tmp/peer-wan-geoip";
pub const DEFAULT_GEOIP_SOURCE_V4: &str =
	"https://raw.githubusercontent.com/ipverse/rir-ip/master/country/ipv4/{cc}.cidr";
pub const DEFAULT_GEOIP_SOURCE_V6: &str =
	"https://raw.githubusercontent.com/ipverse/rir-ip/master/country/ipv6/{cc}.cidr";

/// Country-feed sources and cache behavior for policy expansion.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeoIpConfig {
	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub source_v4: String,
	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub source_v6: String,
	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub cache_dir: String,
	/// Duration string, e.g. `24h`.
	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub cache_ttl: String,
}

impl GeoIpConfig {
	pub fn cache_ttl_duration(&self) -> Duration {
		parse_duration(&self.cache_ttl).unwrap_or(Duration::from_secs(24 * 60 * 60))
	}

	/// Fill any empty field from the built-in defaults.
	pub fn or_defaults(mut self) -> Self {
		if self.source_v4.is_empty() {
			self.source_v4 = DEFAULT_GEOIP_SOURCE_V4.to_string();
		}
		if self.source_v6.is_empty() {
			self.source_v6 = DEFAULT_GEOIP_SOURCE_V6.to_string();
		}
		if self.cache_dir.is_empty() {
			self.cache_dir = DEFAULT_GEOIP_CACHE_DIR.to_string();
		}
		if self.cache_ttl.is_empty() {
			self.cache_ttl = "24h".to_string();
		}
		self
	}
}

/// Diagnostic probing cadence between agents.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagConfig {
	/// Duration string, e.g. `3s`.
	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub ping_interval: String,
}

impl DiagConfig {
	pub fn ping_interval_duration(&self) -> Duration {
		parse_duration(&self.ping_interval).unwrap_or(Duration::from_secs(3))
	}
}

/// Global controller settings, a singleton in the store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
	#[serde(default)]
	pub geoip: GeoIpConfig,
	#[serde(default)]
	pub diag: DiagConfig,
}

impl Settings {
	pub fn with_defaults() -> Self {
		Self {
			geoip: GeoIpConfig::default().or_defaults(),
			diag: DiagConfig {
				ping_interval: "3s".to_string(),
			},
		}
	}

	/// Resolve missing fields against the defaults.
	pub fn or_defaults(mut self) -> Self {
		self.geoip = self.geoip.or_defaults();
		if self.diag.ping_interval.is_empty() {
			self.diag.ping_interval = "3s".to_string();
		}
		self
	}
}

/// Parse `<n>s` / `<n>m` / `<n>h` duration strings. Bare numbers are seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
	let s = s.trim();
	if s.is_empty() {
		return None;
	}
	let (digits, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
		Some(idx) => s.split_at(idx),
		None => (s, "s"),
	};
	let value: u64 = digits.parse().ok()?;
	match unit {
		"s" => Some(Duration::from_secs(value)),
		"m" => Some(Duration::from_secs(value * 60)),
		"h" => Some(Duration::from_secs(value * 60 * 60)),
		_ => None,
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_duration_suffixes() {
		assert_eq!(parse_duration("3s"), Some(Duration::from_secs(3)));
		assert_eq!(parse_duration("5m"), Some(Duration::from_secs(300)));
		assert_eq!(parse_duration("24h"), Some(Duration::from_secs(86400)));
		assert_eq!(parse_duration("30"), Some(Duration::from_secs(30)));
		assert_eq!(parse_duration("nope"), None);
		assert_eq!(parse_duration(""), None);
	}

	#[test]
	fn defaults_fill_empty_fields() {
		let settings = Settings::default().or_defaults();
		assert_eq!(settings.geoip.cache_dir, DEFAULT_GEOIP_CACHE_DIR);
		assert_eq!(settings.geoip.cache_ttl, "24h");
		assert_eq!(settings.diag.ping_interval, "3s");
		assert_eq!(
			settings.geoip.cache_ttl_duration(),
			Duration::from_secs(86400)
		);
	}

	#[test]
	fn or_defaults_keeps_explicit_values() {
		let settings = Settings {
			geoip: GeoIpConfig {
				cache_dir: "/var/cache/geo".to_string(),
				..Default::default()
			},
			diag: DiagConfig {
				ping_interval: "10s".to_string(),
			},
		}
		.or_defaults();
		assert_eq!(settings.geoip.cache_dir, "/var/cache/geo");
		assert_eq!(settings.diag.ping_interval, "10s");
	}
}
