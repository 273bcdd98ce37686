// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::kv::{KvClient, KvEntry};
use crate::{Result, StoreError};
use async_trait::async_trait;
use base64::prelude::*;
use serde::Deserialize;
use std::time::Duration;

/// Server-side bound for blocking prefix reads.
const BLOCKING_WAIT: &str = "30s";
/// Client timeout for blocking reads; must exceed [`BLOCKING_WAIT`].
const BLOCKING_TIMEOUT: Duration = Duration::from_secs(40);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Consul KV over its HTTP API. Values arrive base64-encoded in JSON; the
/// modify index doubles as the CAS token and the blocking-query cursor.
pub struct ConsulKv {
	base: String,
	http: reqwest::Client,
	blocking_http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct RawEntry {
	#[serde(rename = "Key")]
	key: String,
	#[serde(default, rename = "Value")]
	value: Option<String>,
	#[serde(rename = "ModifyIndex")]
	modify_index: u64,
}

#[derive(Debug, Deserialize)]
struct SessionCreated {
	#[serde(rename = "ID")]
	id: String,
}

impl ConsulKv {
	/// `addr` is `host:port` or a full `http(s)://` base.
	pub fn new(addr: &str) -> Self {
		let base = if addr.starts_with("http://") || addr.starts_with("https://") {
			addr.trim_end_matches('/').to_string()
		} else {
			format!("http://{addr}")
		};
		Self {
			base,
			http: http_client(REQUEST_TIMEOUT),
			blocking_http: http_client(BLOCKING_TIMEOUT),
		}
	}

	fn kv_url(&self, key: &str) -> String {
		format!("{}/v1/kv/{key}", self.base)
	}

	fn decode(raw: RawEntry) -> Result<KvEntry> {
		let value = match raw.value {
			Some(encoded) => BASE64_STANDARD
				.decode(encoded)
				.map_err(|err| StoreError::Backend(format!("bad base64 for {}: {err}", raw.key)))?,
			None => Vec::new(),
		};
		Ok(KvEntry {
			key: raw.key,
			value,
			modify_index: raw.modify_index,
		})
	}
}

fn http_client(timeout: Duration) -> reqwest::Client {
	reqwest::Client::builder()
		.timeout(timeout)
		.build()
		.expect("failed to build KV HTTP client")
}

#[async_trait]
impl KvClient for ConsulKv {
	async fn get(&self, key: &str) -> Result<Option<KvEntry>> {
		let resp = self.http.get(self.kv_url(key)).send().await?;
		if resp.status() == reqwest::StatusCode::NOT_FOUND {
			return Ok(None);
		}
		let raw: Vec<RawEntry> = resp.error_for_status()?.json().await?;
		match raw.into_iter().next() {
			Some(entry) => Ok(Some(Self::decode(entry)?)),
			None => Ok(None),
		}
	}

	async fn list(&self, prefix: &str) -> Result<Vec<KvEntry>> {
		let resp = self
			.http
			.get(self.kv_url(prefix))
			.query(&[("recurse", "true")])
			.send()
			.await?;
		if resp.status() == reqwest::StatusCode::NOT_FOUND {
			return Ok(Vec::new());
		}
		let raw: Vec<RawEntry> = resp.error_for_status()?.json().await?;
		raw.into_iter().map(Self::decode).collect()
	}

	async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
		self
			.http
			.put(self.kv_url(key))
			.body(value)
			.send()
			.await?
			.error_for_status()?;
		Ok(())
	}

	async fn cas(&self, key: &str, value: Vec<u8>, modify_index: u64) -> Result<bool> {
		let body = self
			.http
			.put(self.kv_url(key))
			.query(&[("cas", modify_index.to_string())])
			.body(value)
			.send()
			.await?
			.error_for_status()?
			.text()
			.await?;
		Ok(body.trim() == "true")
	}

	async fn delete(&self, key: &str) -> Result<()> {
		self
			.http
			.delete(self.kv_url(key))
			.send()
			.await?
			.error_for_status()?;
		Ok(())
	}

	async fn wait_prefix(&self, prefix: &str, index: u64) -> Result<u64> {
		let resp = self
			.blocking_http
			.get(self.kv_url(prefix))
			.query(&[
				("recurse", "true".to_string()),
				("index", index.to_string()),
				("wait", BLOCKING_WAIT.to_string()),
			])
			.send()
			.await?;
		let next = resp
			.headers()
			.get("X-Consul-Index")
			.and_then(|v| v.to_str().ok())
			.and_then(|v| v.parse().ok())
			.unwrap_or(index);
		resp.error_for_status()?;
		Ok(next)
	}

	async fn create_session(&self, ttl: Duration) -> Result<String> {
		let created: SessionCreated = self
			.http
			.put(format!("{}/v1/session/create", self.base))
			.json(&serde_json::json!({
				"TTL": format!("{}s", ttl.as_secs()),
				"Behavior": "release",
			}))
			.send()
			.await?
			.error_for_status()?
			.json()
			.await?;
		Ok(created.id)
	}

	async fn renew_session(&self, session: &str) -> Result<()> {
		self
			.http
			.put(format!("{}/v1/session/renew/{session}", self.base))
			.send()
			.await?
			.error_for_status()?;
		Ok(())
	}

	async fn destroy_session(&self, session: &str) -> Result<()> {
		self
			.http
			.put(format!("{}/v1/session/destroy/{session}", self.base))
			.send()
			.await?
			.error_for_status()?;
		Ok(())
	}

	async fn acquire(&self, key: &str, session: &str) -> Result<bool> {
		let body = self
			.http
			.put(self.kv_url(key))
			.query(&[("acquire", session)])
			.send()
			.await?
			.error_for_status()?
			.text()
			.await?;
		Ok(body.trim() == "true")
	}

	async fn release(&self, key: &str, session: &str) -> Result<()> {
		self
			.http
			.put(self.kv_url(key))
			.query(&[("release", session)])
			.send()
			.await?
			.error_for_status()?;
		Ok(())
	}

	async fn ping(&self) -> Result<()> {
		self
			.http
			.get(format!("{}/v1/status/leader", self.base))
			.send()
			.await?
			.error_for_status()?;
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn bare_address_gets_http_scheme() {
		let kv = ConsulKv::new("127.0.0.1:8500");
		assert_eq!(kv.kv_url("peer-wan/settings"), "http://127.0.0.1:8500/v1/kv/peer-wan/settings");
		let kv = ConsulKv::new("https://kv.example.com/");
		assert_eq!(kv.base, "https://kv.example.com");
	}

	#[test]
	fn decode_handles_missing_value() {
		let entry = ConsulKv::decode(RawEntry {
			key: "peer-wan/plan/version".to_string(),
			value: Some(BASE64_STANDARD.encode("42")),
			modify_index: 7,
		})
		.unwrap();
		assert_eq!(entry.value, b"42");
		assert_eq!(entry.modify_index, 7);

		let empty = ConsulKv::decode(RawEntry {
			key: "k".to_string(),
			value: None,
			modify_index: 1,
		})
		.unwrap();
		assert!(empty.value.is_empty());
	}
}
