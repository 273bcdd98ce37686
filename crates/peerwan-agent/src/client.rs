// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! HTTP client for the controller API. Agent requests authenticate with the
//! operator bearer when configured, plus the node's provision token.

use crate::error::{AgentError, Result};
use peerwan_model::{HealthReport, PlanResponse, PolicyDiagReport, PolicyInstallLog, RegisterRequest};
use reqwest::RequestBuilder;
use serde::de::DeserializeOwned;
use tracing::{debug, instrument};

pub const PROVISION_TOKEN_HEADER: &str = "X-Provision-Token";

#[derive(Clone)]
pub struct ControllerClient {
	base: String,
	http: reqwest::Client,
	auth_token: String,
	provision_token: String,
}

impl ControllerClient {
	pub fn new(
		base: &str,
		http: reqwest::Client,
		auth_token: &str,
		provision_token: &str,
	) -> Self {
		Self {
			base: base.trim_end_matches('/').to_string(),
			http,
			auth_token: auth_token.to_string(),
			provision_token: provision_token.to_string(),
		}
	}

	fn authorize(&self, req: RequestBuilder) -> RequestBuilder {
		let mut req = req;
		if !self.auth_token.is_empty() {
			req = req.bearer_auth(&self.auth_token);
		}
		if !self.provision_token.is_empty() {
			req = req.header(PROVISION_TOKEN_HEADER, &self.provision_token);
		}
		req
	}

	async fn decode<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T> {
		let status = resp.status();
		if !status.is_success() {
			let body = resp.text().await.unwrap_or_default();
			return Err(AgentError::Controller {
				status: status.as_u16(),
				body: body.trim().to_string(),
			});
		}
		Ok(resp.json().await?)
	}

	#[instrument(skip(self, req), fields(node_id = %req.id))]
	pub async fn register(&self, req: &RegisterRequest) -> Result<PlanResponse> {
		let resp = self
			.authorize(self.http.post(format!("{}/api/v1/nodes/register", self.base)))
			.json(req)
			.send()
			.await?;
		let cfg: PlanResponse = Self::decode(resp).await?;
		debug!(config_version = %cfg.config_version, peers = cfg.peers.len(), "registered");
		Ok(cfg)
	}

	/// Fetch the node's plan; with `wait_version` the controller parks the
	/// request until the global version moves past it.
	pub async fn fetch_plan(&self, node_id: &str, wait_version: Option<i64>) -> Result<PlanResponse> {
		let mut req = self
			.http
			.get(format!("{}/api/v1/plan", self.base))
			.query(&[("nodeId", node_id)]);
		if let Some(version) = wait_version {
			req = req.query(&[("waitVersion", version.to_string())]);
		}
		let resp = self.authorize(req).send().await?;
		Self::decode(resp).await
	}

	pub async fn post_health(&self, report: &HealthReport) -> Result<()> {
		let resp = self
			.authorize(self.http.post(format!("{}/api/v1/health", self.base)))
			.json(report)
			.send()
			.await?;
		Self::decode::<serde_json::Value>(resp).await.map(|_| ())
	}

	pub async fn post_policy_status(&self, log: &PolicyInstallLog) -> Result<()> {
		let resp = self
			.authorize(self.http.post(format!("{}/api/v1/policy/status", self.base)))
			.json(log)
			.send()
			.await?;
		Self::decode::<serde_json::Value>(resp).await.map(|_| ())
	}

	pub async fn post_policy_diag(&self, report: &PolicyDiagReport) -> Result<()> {
		let resp = self
			.authorize(self.http.post(format!("{}/api/v1/policy/diag", self.base)))
			.json(report)
			.send()
			.await?;
		Self::decode::<serde_json::Value>(resp).await.map(|_| ())
	}

	/// Websocket endpoint for the message session, derived from the HTTP
	/// base (`http` → `ws`, `https` → `wss`).
	pub fn session_url(&self, node_id: &str) -> String {
		let ws_base = if let Some(rest) = self.base.strip_prefix("https://") {
			format!("wss://{rest}")
		} else if let Some(rest) = self.base.strip_prefix("http://") {
			format!("ws://{rest}")
		} else {
			format!("ws://{}", self.base)
		};
		format!("{ws_base}/api/v1/ws/agent?nodeId={node_id}")
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn client(base: &str) -> ControllerClient {
		ControllerClient::new(base, reqwest::Client::new(), "", "pt-1")
	}

	#[test]
	fn session_url_switches_scheme() {
		assert_eq!(
			client("http://ctrl:8080").session_url("edge-1"),
			"ws://ctrl:8080/api/v1/ws/agent?nodeId=edge-1"
		);
		assert_eq!(
			client("https://ctrl:8443/").session_url("edge-1"),
			"wss://ctrl:8443/api/v1/ws/agent?nodeId=edge-1"
		);
	}

	#[tokio::test]
	async fn unreachable_controller_is_an_http_error() {
		// Nothing is listening here; the request error path is exercised
		// rather than the decode path.
		let client = client("http://127.0.0.1:1");
		let err = client.fetch_plan("edge-1", None).await.unwrap_err();
		assert!(matches!(err, AgentError::Http(_)));
	}
}
