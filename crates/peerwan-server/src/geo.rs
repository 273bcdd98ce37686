// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Best-effort IP geolocation for the mesh map, backed by an external HTTP
//! lookup with a short-lived in-memory cache. Failures cache as "unknown" so
//! a flapping provider doesn't stall the status endpoint.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

const CACHE_TTL: Duration = Duration::from_secs(30 * 60);
const LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct GeoLocation {
	#[serde(skip_serializing_if = "String::is_empty")]
	pub ip: String,
	pub lat: f64,
	pub lng: f64,
	#[serde(skip_serializing_if = "String::is_empty")]
	pub city: String,
	#[serde(skip_serializing_if = "String::is_empty")]
	pub country: String,
	#[serde(skip_serializing_if = "String::is_empty")]
	pub source: String,
}

#[derive(Debug, Deserialize)]
struct IpApiBody {
	#[serde(default)]
	latitude: f64,
	#[serde(default)]
	longitude: f64,
	#[serde(default)]
	city: String,
	#[serde(default)]
	country_name: String,
}

pub struct GeoResolver {
	http: reqwest::Client,
	cache: Mutex<HashMap<String, (Option<GeoLocation>, Instant)>>,
}

impl GeoResolver {
	pub fn new() -> Self {
		Self {
			http: peerwan_common_http::new_client_with_timeout(LOOKUP_TIMEOUT),
			cache: Mutex::new(HashMap::new()),
		}
	}

	pub async fn resolve(&self, ip: &str) -> Option<GeoLocation> {
		if ip.parse::<std::net::IpAddr>().is_err() {
			return None;
		}
		{
			let cache = self.cache.lock().await;
			if let Some((location, at)) = cache.get(ip) {
				if at.elapsed() < CACHE_TTL {
					return location.clone();
				}
			}
		}
		let location = self.fetch(ip).await;
		self
			.cache
			.lock()
			.await
			.insert(ip.to_string(), (location.clone(), Instant::now()));
		location
	}

	async fn fetch(&self, ip: &str) -> Option<GeoLocation> {
		let url = format!("https://ipapi.co/{ip}/json/");
		let body: IpApiBody = match self.http.get(&url).send().await {
			Ok(resp) if resp.status().is_success() => match resp.json().await {
				Ok(body) => body,
				Err(err) => {
					debug!(%ip, error = %err, "geo lookup returned unparseable body");
					return None;
				}
			},
			Ok(resp) => {
				debug!(%ip, status = %resp.status(), "geo lookup rejected");
				return None;
			}
			Err(err) => {
				debug!(%ip, error = %err, "geo lookup failed");
				return None;
			}
		};
		Some(GeoLocation {
			ip: ip.to_string(),
			lat: body.latitude,
			lng: body.longitude,
			city: body.city,
			country: body.country_name,
			source: "ipapi".to_string(),
		})
	}
}

impl Default for GeoResolver {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn invalid_ip_resolves_to_none_without_caching() {
		let resolver = GeoResolver::new();
		assert!(resolver.resolve("not-an-ip").await.is_none());
		assert!(resolver.cache.lock().await.is_empty());
	}

	#[tokio::test]
	async fn cache_hit_skips_refetch() {
		let resolver = GeoResolver::new();
		let loc = GeoLocation {
			ip: "203.0.113.1".to_string(),
			lat: 1.0,
			lng: 2.0,
			city: "Test".to_string(),
			country: "Testland".to_string(),
			source: "ipapi".to_string(),
		};
		resolver
			.cache
			.lock()
			.await
			.insert("203.0.113.1".to_string(), (Some(loc.clone()), Instant::now()));
		assert_eq!(resolver.resolve("203.0.113.1").await, Some(loc));
	}
}
