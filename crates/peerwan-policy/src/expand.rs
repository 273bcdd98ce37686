// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use ipnet::IpNet;
use peerwan_model::{GeoIpConfig, PolicyRule};
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, warn};

const FEED_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Expands policy rules into concrete IP prefixes.
///
/// Country feeds are fetched once per TTL and cached as plain files under the
/// configured cache directory (`v4-<cc>.cidr` / `v6-<cc>.cidr`); a fresh cache
/// file short-circuits the network entirely. Expansion is best-effort: invalid
/// entries and failed lookups are dropped, never propagated.
pub struct Expander {
	cfg: GeoIpConfig,
	http: reqwest::Client,
}

impl Expander {
	pub fn new(cfg: GeoIpConfig) -> Self {
		Self {
			cfg: cfg.or_defaults(),
			http: peerwan_common_http::new_client_with_timeout(FEED_FETCH_TIMEOUT),
		}
	}

	/// Swap in updated feed settings without rebuilding the HTTP client.
	pub fn set_config(&mut self, cfg: GeoIpConfig) {
		self.cfg = cfg.or_defaults();
	}

	/// Expand one rule into a deduplicated, insertion-ordered prefix list.
	pub async fn expand(&self, rule: &PolicyRule) -> Vec<String> {
		if !rule.is_valid() {
			return Vec::new();
		}
		let mut out: Vec<String> = Vec::new();
		let mut add = |prefix: String| {
			if !prefix.is_empty() && !out.contains(&prefix) {
				out.push(prefix);
			}
		};

		if !rule.prefix.is_empty() {
			let lower = rule.prefix.to_ascii_lowercase();
			if let Some(cc) = lower.strip_prefix("geoip6:") {
				for prefix in self.country_prefixes(cc, true).await {
					add(prefix);
				}
			} else if let Some(cc) = lower.strip_prefix("geoip:") {
				for prefix in self.country_prefixes(cc, false).await {
					add(prefix);
				}
			} else {
				let candidate = if rule.prefix.contains('/') {
					rule.prefix.clone()
				} else {
					format!("{}/32", rule.prefix)
				};
				if candidate.parse::<IpNet>().is_ok() {
					add(candidate);
				} else if let Ok(ip) = rule.prefix.parse::<IpAddr>() {
					add(format!("{ip}/32"));
				}
			}
		}

		for domain in &rule.domains {
			for ip in resolve_domain(domain).await {
				add(format!("{ip}/32"));
			}
		}
		out
	}

	/// Prefixes for a country code, read-through cached. Tries the lowercase
	/// code first (matching the ipverse repo layout), then uppercase for
	/// custom sources.
	async fn country_prefixes(&self, cc: &str, ipv6: bool) -> Vec<String> {
		let cc = cc.trim();
		if cc.is_empty() {
			return Vec::new();
		}
		let mut codes = vec![cc.to_ascii_lowercase()];
		let upper = cc.to_ascii_uppercase();
		if upper != codes[0] {
			codes.push(upper);
		}
		let (kind, template) = if ipv6 {
			("v6", &self.cfg.source_v6)
		} else {
			("v4", &self.cfg.source_v4)
		};
		if std::fs::create_dir_all(&self.cfg.cache_dir).is_err() {
			return Vec::new();
		}
		let ttl = self.cfg.cache_ttl_duration();
		for code in codes {
			let cache_file = PathBuf::from(&self.cfg.cache_dir).join(format!("{kind}-{code}.cidr"));
			if cache_is_fresh(&cache_file, ttl) {
				if let Ok(data) = std::fs::read_to_string(&cache_file) {
					return parse_cidrs(&data);
				}
			}
			let url = template.replace("{cc}", &code);
			match self.fetch_feed(&url).await {
				Ok(body) => {
					if let Err(err) = std::fs::write(&cache_file, &body) {
						warn!(path = %cache_file.display(), error = %err, "failed to cache country feed");
					}
					return parse_cidrs(&body);
				}
				Err(err) => {
					debug!(%url, error = %err, "country feed fetch failed");
				}
			}
		}
		Vec::new()
	}

	async fn fetch_feed(&self, url: &str) -> Result<String, reqwest::Error> {
		self
			.http
			.get(url)
			.send()
			.await?
			.error_for_status()?
			.text()
			.await
	}
}

fn cache_is_fresh(path: &std::path::Path, ttl: Duration) -> bool {
	std::fs::metadata(path)
		.and_then(|meta| meta.modified())
		.ok()
		.and_then(|mtime| mtime.elapsed().ok())
		.map(|age| age < ttl)
		.unwrap_or(false)
}

/// One CIDR per non-comment, non-empty line; deduplicated.
fn parse_cidrs(content: &str) -> Vec<String> {
	let mut out: Vec<String> = Vec::new();
	for line in content.lines() {
		let line = line.trim();
		if line.is_empty() || line.starts_with('#') || !line.contains('/') {
			continue;
		}
		if !out.iter().any(|seen| seen == line) {
			out.push(line.to_string());
		}
	}
	out
}

/// Resolve a domain to its IPv4 addresses through the system resolver.
async fn resolve_domain(domain: &str) -> Vec<IpAddr> {
	let Ok(addrs) = tokio::net::lookup_host((domain, 0)).await else {
		return Vec::new();
	};
	addrs
		.map(|sock| sock.ip())
		.filter(IpAddr::is_ipv4)
		.collect()
}

#[cfg(test)]
mod tests {
	use super::*;

	fn expander_with_cache(dir: &std::path::Path) -> Expander {
		Expander::new(GeoIpConfig {
			cache_dir: dir.display().to_string(),
			cache_ttl: "24h".to_string(),
			// Unroutable sources so a cache miss cannot silently hit the network.
			source_v4: "http://127.0.0.1:1/{cc}".to_string(),
			source_v6: "http://127.0.0.1:1/{cc}".to_string(),
		})
	}

	#[tokio::test]
	async fn literal_cidr_passes_through() {
		let dir = tempfile::tempdir().unwrap();
		let expander = expander_with_cache(dir.path());
		let rule = PolicyRule {
			prefix: "192.0.2.0/24".to_string(),
			via_node: "edge-2".to_string(),
			..Default::default()
		};
		assert_eq!(expander.expand(&rule).await, vec!["192.0.2.0/24"]);
	}

	#[tokio::test]
	async fn bare_ip_gets_host_mask() {
		let dir = tempfile::tempdir().unwrap();
		let expander = expander_with_cache(dir.path());
		let rule = PolicyRule {
			prefix: "198.51.100.7".to_string(),
			via_node: "edge-2".to_string(),
			..Default::default()
		};
		assert_eq!(expander.expand(&rule).await, vec!["198.51.100.7/32"]);
	}

	#[tokio::test]
	async fn invalid_prefix_is_dropped_silently() {
		let dir = tempfile::tempdir().unwrap();
		let expander = expander_with_cache(dir.path());
		let rule = PolicyRule {
			prefix: "not-an-ip".to_string(),
			via_node: "edge-2".to_string(),
			..Default::default()
		};
		assert!(expander.expand(&rule).await.is_empty());
	}

	#[tokio::test]
	async fn invalid_rule_expands_to_nothing() {
		let dir = tempfile::tempdir().unwrap();
		let expander = expander_with_cache(dir.path());
		let rule = PolicyRule {
			prefix: "192.0.2.0/24".to_string(),
			..Default::default()
		};
		assert!(expander.expand(&rule).await.is_empty());
	}

	#[tokio::test]
	async fn country_expansion_reads_fresh_cache_without_network() {
		let dir = tempfile::tempdir().unwrap();
		std::fs::write(dir.path().join("v4-cn.cidr"), "1.0.1.0/24\n1.0.2.0/23\n").unwrap();
		let expander = expander_with_cache(dir.path());
		let rule = PolicyRule {
			prefix: "geoip:cn".to_string(),
			via_node: "edge-2".to_string(),
			..Default::default()
		};
		assert_eq!(
			expander.expand(&rule).await,
			vec!["1.0.1.0/24", "1.0.2.0/23"]
		);
	}

	#[tokio::test]
	async fn country_code_is_case_insensitive() {
		let dir = tempfile::tempdir().unwrap();
		std::fs::write(dir.path().join("v4-us.cidr"), "203.0.113.0/24\n").unwrap();
		let expander = expander_with_cache(dir.path());
		let lower = PolicyRule {
			prefix: "geoip:us".to_string(),
			via_node: "edge-2".to_string(),
			..Default::default()
		};
		let upper = PolicyRule {
			prefix: "GEOIP:US".to_string(),
			via_node: "edge-2".to_string(),
			..Default::default()
		};
		assert_eq!(
			expander.expand(&lower).await,
			expander.expand(&upper).await
		);
		assert_eq!(expander.expand(&lower).await, vec!["203.0.113.0/24"]);
	}

	#[test]
	fn parse_cidrs_skips_comments_and_dupes() {
		let parsed = parse_cidrs("# header\n1.0.1.0/24\n\n1.0.1.0/24\nbogus-line\n1.0.2.0/23\n");
		assert_eq!(parsed, vec!["1.0.1.0/24", "1.0.2.0/23"]);
	}

	#[test]
	fn stale_cache_is_not_fresh() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("v4-zz.cidr");
		std::fs::write(&path, "1.0.1.0/24\n").unwrap();
		assert!(cache_is_fresh(&path, Duration::from_secs(60)));
		assert!(!cache_is_fresh(&path, Duration::from_secs(0)));
		assert!(!cache_is_fresh(&dir.path().join("missing"), Duration::from_secs(60)));
	}
}
