// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! End-to-end controller scenarios over the in-memory store: provisioning,
//! registration, mesh planning, policy distribution, long-poll wake and
//! rollback.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use peerwan_server::auth::{TokenIssuer, TOKEN_TTL};
use peerwan_server::{create_router, AppState};
use peerwan_store::{MemoryStore, Store};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

struct TestController {
	router: Router,
	state: AppState,
	bearer: String,
}

fn controller() -> TestController {
	let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
	let mut state = AppState::new(store, "memory", "http://ctrl.test:8080");
	state.tokens = Arc::new(TokenIssuer::new("test-secret"));
	let bearer = state.tokens.issue(1, "admin", TOKEN_TTL).unwrap();
	TestController {
		router: create_router(state.clone()),
		state,
		bearer,
	}
}

async fn request(
	router: &Router,
	method: &str,
	path: &str,
	bearer: Option<&str>,
	provision_token: Option<&str>,
	body: Option<Value>,
) -> (StatusCode, Value) {
	let mut builder = Request::builder().method(method).uri(path);
	if let Some(bearer) = bearer {
		builder = builder.header("authorization", format!("Bearer {bearer}"));
	}
	if let Some(token) = provision_token {
		builder = builder.header("x-provision-token", token);
	}
	let request = match body {
		Some(body) => builder
			.header("content-type", "application/json")
			.body(Body::from(serde_json::to_vec(&body).unwrap()))
			.unwrap(),
		None => builder.body(Body::empty()).unwrap(),
	};
	let response = router.clone().oneshot(request).await.unwrap();
	let status = response.status();
	let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
		.await
		.unwrap();
	let value = if bytes.is_empty() {
		Value::Null
	} else {
		serde_json::from_slice(&bytes).unwrap_or(Value::String(
			String::from_utf8_lossy(&bytes).into_owned(),
		))
	};
	(status, value)
}

impl TestController {
	async fn prepare(&self, id: &str) -> Value {
		let (status, body) = request(
			&self.router,
			"POST",
			"/api/v1/nodes/prepare",
			Some(&self.bearer),
			None,
			Some(json!({ "id": id })),
		)
		.await;
		assert_eq!(status, StatusCode::OK, "prepare failed: {body}");
		body
	}

	async fn register(&self, body: Value, token: Option<&str>) -> (StatusCode, Value) {
		request(
			&self.router,
			"POST",
			"/api/v1/nodes/register",
			if token.is_none() { Some(&self.bearer) } else { None },
			token,
			Some(body),
		)
		.await
	}

	async fn plan(&self, node_id: &str) -> Value {
		let (status, body) = request(
			&self.router,
			"GET",
			&format!("/api/v1/plan?nodeId={node_id}"),
			Some(&self.bearer),
			None,
			None,
		)
		.await;
		assert_eq!(status, StatusCode::OK, "plan fetch failed: {body}");
		body
	}

	async fn version(&self) -> i64 {
		let (status, body) = request(
			&self.router,
			"GET",
			"/api/v1/version",
			Some(&self.bearer),
			None,
			None,
		)
		.await;
		assert_eq!(status, StatusCode::OK);
		body["version"].as_i64().unwrap()
	}

	/// Full bootstrap: prepare, then register the way an installed agent
	/// does, with its provision token.
	async fn bootstrap(&self, id: &str, endpoint: &str, cidr: &str) -> Value {
		let prepared = self.prepare(id).await;
		let token = prepared["provisionToken"].as_str().unwrap().to_string();
		let (status, body) = self
			.register(
				json!({
					"id": id,
					"provisionToken": token,
					"endpoints": [endpoint],
					"cidrs": [cidr],
					"listenPort": 51820,
				}),
				Some(&token),
			)
			.await;
		assert_eq!(status, StatusCode::OK, "register failed: {body}");
		body
	}
}

#[tokio::test]
async fn healthz_is_open() {
	let ctl = controller();
	let (status, _) = request(&ctl.router, "GET", "/healthz", None, None, None).await;
	assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn prepare_then_bootstrap_registration() {
	let ctl = controller();
	let prepared = ctl.prepare("edge-1").await;
	assert_ne!(prepared["publicKey"], "");
	assert_ne!(prepared["privateKey"], "");
	assert_eq!(prepared["overlayIp"], "10.10.1.1/32");
	let token = prepared["provisionToken"].as_str().unwrap();
	assert!(token.starts_with("pt-"));
	assert!(token[3..].chars().all(|c| c.is_ascii_digit()));
	assert!(prepared["command"].as_str().unwrap().contains("edge-1"));

	let (status, body) = ctl
		.register(json!({ "id": "edge-1", "provisionToken": token }), Some(token))
		.await;
	assert_eq!(status, StatusCode::OK);
	assert_eq!(body["id"], "edge-1");
	assert!(body["configVersion"]
		.as_str()
		.unwrap()
		.starts_with("dynamic-v"));
	assert!(body["peers"].as_array().unwrap().is_empty());
	// The bootstrap path hands the agent its key material.
	assert_ne!(body["privateKey"], "");
}

#[tokio::test]
async fn wrong_provision_token_is_rejected() {
	let ctl = controller();
	ctl.prepare("edge-1").await;
	let (status, _) = ctl
		.register(
			json!({ "id": "edge-1", "provisionToken": "pt-wrong" }),
			Some("pt-wrong"),
		)
		.await;
	assert_eq!(status, StatusCode::UNAUTHORIZED);

	// Registering an unknown node with a token is equally rejected.
	let (status, _) = ctl
		.register(json!({ "id": "ghost", "provisionToken": "pt-1" }), Some("pt-1"))
		.await;
	assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn two_node_mesh_produces_symmetric_peers() {
	let ctl = controller();
	ctl.bootstrap("edge-1", "203.0.113.1:51820", "10.1.0.0/24").await;
	ctl.bootstrap("edge-2", "203.0.113.2:51820", "10.2.0.0/24").await;

	let plan = ctl.plan("edge-1").await;
	let peers = plan["peers"].as_array().unwrap();
	assert_eq!(peers.len(), 1);
	assert_eq!(peers[0]["id"], "edge-2");
	assert_eq!(peers[0]["endpoint"], "203.0.113.2:51820");
	assert_eq!(
		peers[0]["allowedIPs"],
		json!(["10.10.2.1/32", "10.2.0.0/24"])
	);
	assert_eq!(peers[0]["keepaliveSeconds"], 25);

	let mirror = ctl.plan("edge-2").await;
	assert_eq!(mirror["peers"][0]["id"], "edge-1");
	assert_eq!(
		mirror["peers"][0]["allowedIPs"],
		json!(["10.10.1.1/32", "10.1.0.0/24"])
	);
}

#[tokio::test]
async fn health_latency_orders_peers() {
	let ctl = controller();
	let a = ctl.bootstrap("a", "203.0.113.1:51820", "10.1.0.0/24").await;
	ctl.bootstrap("b", "203.0.113.2:51820", "10.2.0.0/24").await;
	ctl.bootstrap("c", "203.0.113.3:51820", "10.3.0.0/24").await;
	assert_eq!(a["id"], "a");

	// a's probes: c is closer than b.
	let (status, _) = request(
		&ctl.router,
		"POST",
		"/api/v1/health",
		Some(&ctl.bearer),
		None,
		Some(json!({
			"nodeId": "a",
			"status": "up",
			"latencyMs": { "10.10.2.1": 50, "10.10.3.1": 10 },
		})),
	)
	.await;
	assert_eq!(status, StatusCode::OK);

	let plan = ctl.plan("a").await;
	let order: Vec<&str> = plan["peers"]
		.as_array()
		.unwrap()
		.iter()
		.map(|p| p["id"].as_str().unwrap())
		.collect();
	assert_eq!(order, vec!["c", "b"]);
}

#[tokio::test]
async fn policy_path_distributes_per_hop() {
	let ctl = controller();
	ctl.bootstrap("edge-1", "203.0.113.1:51820", "10.1.0.0/24").await;
	ctl.bootstrap("edge-2", "203.0.113.2:51820", "10.2.0.0/24").await;
	ctl.bootstrap("edge-3", "203.0.113.3:51820", "10.3.0.0/24").await;

	let (status, _) = request(
		&ctl.router,
		"POST",
		"/api/v1/policy",
		Some(&ctl.bearer),
		None,
		Some(json!({
			"nodeId": "edge-1",
			"policyRules": [
				{ "prefix": "192.0.2.0/24", "path": ["edge-2", "edge-3"] },
			],
		})),
	)
	.await;
	assert_eq!(status, StatusCode::OK);

	let source = ctl.plan("edge-1").await;
	assert_eq!(source["policyRules"][0]["viaNode"], "edge-2");
	assert!(source["policyRules"][0].get("path").is_none());

	let hop = ctl.plan("edge-2").await;
	assert_eq!(hop["policyRules"][0]["prefix"], "192.0.2.0/24");
	assert_eq!(hop["policyRules"][0]["viaNode"], "edge-3");

	let egress = ctl.plan("edge-3").await;
	assert!(egress.get("policyRules").is_none());
}

#[tokio::test]
async fn invalid_policy_rules_are_rejected() {
	let ctl = controller();
	ctl.bootstrap("edge-1", "203.0.113.1:51820", "10.1.0.0/24").await;
	let (status, _) = request(
		&ctl.router,
		"POST",
		"/api/v1/policy",
		Some(&ctl.bearer),
		None,
		Some(json!({
			"nodeId": "edge-1",
			"policyRules": [{ "prefix": "192.0.2.0/24" }],
		})),
	)
	.await;
	assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn long_poll_wakes_on_policy_mutation() {
	let ctl = controller();
	ctl.bootstrap("edge-1", "203.0.113.1:51820", "10.1.0.0/24").await;
	ctl.bootstrap("edge-2", "203.0.113.2:51820", "10.2.0.0/24").await;
	let current = ctl.version().await;

	let router = ctl.router.clone();
	let bearer = ctl.bearer.clone();
	let waiter = tokio::spawn(async move {
		request(
			&router,
			"GET",
			&format!("/api/v1/plan?nodeId=edge-1&waitVersion={current}"),
			Some(&bearer),
			None,
			None,
		)
		.await
	});

	tokio::time::sleep(Duration::from_millis(100)).await;
	let (status, _) = request(
		&ctl.router,
		"POST",
		"/api/v1/policy",
		Some(&ctl.bearer),
		None,
		Some(json!({
			"nodeId": "edge-1",
			"policyRules": [{ "prefix": "198.51.100.0/24", "viaNode": "edge-2" }],
		})),
	)
	.await;
	assert_eq!(status, StatusCode::OK);

	let (status, plan) = tokio::time::timeout(Duration::from_secs(2), waiter)
		.await
		.expect("long-poll did not wake within a second")
		.unwrap();
	assert_eq!(status, StatusCode::OK);
	let woke_version =
		peerwan_model::parse_dynamic_version(plan["configVersion"].as_str().unwrap()).unwrap();
	assert!(woke_version > current);
}

#[tokio::test]
async fn unchanged_registration_produces_no_new_version() {
	let ctl = controller();
	let prepared = ctl.prepare("edge-1").await;
	let token = prepared["provisionToken"].as_str().unwrap().to_string();
	let body = json!({
		"id": "edge-1",
		"provisionToken": token,
		"endpoints": ["203.0.113.1:51820"],
		"cidrs": ["10.1.0.0/24"],
	});
	let (status, _) = ctl.register(body.clone(), Some(&token)).await;
	assert_eq!(status, StatusCode::OK);
	let before = ctl.version().await;

	let (status, resp) = ctl.register(body.clone(), Some(&token)).await;
	assert_eq!(status, StatusCode::OK);
	assert_eq!(ctl.version().await, before);
	assert_eq!(resp["id"], "edge-1");

	// force=true re-registers even without changes.
	let mut forced = body.clone();
	forced["force"] = json!(true);
	let (status, _) = ctl.register(forced, Some(&token)).await;
	assert_eq!(status, StatusCode::OK);
	assert!(ctl.version().await > before);
}

#[tokio::test]
async fn rollback_restores_signature_and_version() {
	let ctl = controller();
	ctl.bootstrap("edge-1", "203.0.113.1:51820", "10.1.0.0/24").await;
	ctl.bootstrap("edge-2", "203.0.113.2:51820", "10.2.0.0/24").await;

	// Three policy mutations, three plan generations.
	for prefix in ["192.0.2.0/24", "198.51.100.0/24", "203.0.113.0/24"] {
		let (status, _) = request(
			&ctl.router,
			"POST",
			"/api/v1/policy",
			Some(&ctl.bearer),
			None,
			Some(json!({
				"nodeId": "edge-1",
				"policyRules": [{ "prefix": prefix, "viaNode": "edge-2" }],
			})),
		)
		.await;
		assert_eq!(status, StatusCode::OK);
	}

	let (status, history) = request(
		&ctl.router,
		"GET",
		"/api/v1/plan/history?nodeId=edge-1",
		Some(&ctl.bearer),
		None,
		None,
	)
	.await;
	assert_eq!(status, StatusCode::OK);
	let entries = history.as_array().unwrap();
	assert!(entries.len() >= 3);
	let target = &entries[0];
	let target_version = target["version"].as_i64().unwrap();
	let target_signature = target["signature"].as_str().unwrap().to_string();

	let (status, rolled) = request(
		&ctl.router,
		"POST",
		"/api/v1/plan/rollback",
		Some(&ctl.bearer),
		None,
		Some(json!({ "nodeId": "edge-1", "version": target_version })),
	)
	.await;
	assert_eq!(status, StatusCode::OK, "rollback failed: {rolled}");
	assert_eq!(rolled["version"].as_i64().unwrap(), target_version);
	assert_eq!(rolled["signature"].as_str().unwrap(), target_signature);
	assert_eq!(ctl.version().await, target_version);

	let latest = ctl
		.state
		.store
		.get_plan("edge-1")
		.await
		.unwrap()
		.unwrap();
	assert_eq!(latest.version, target_version);
	assert_eq!(latest.signature, target_signature);
}

#[tokio::test]
async fn operator_endpoints_require_bearer() {
	let ctl = controller();
	for (method, path) in [
		("GET", "/api/v1/nodes"),
		("GET", "/api/v1/audit"),
		("GET", "/api/v1/health"),
		("POST", "/api/v1/nodes/prepare"),
	] {
		let body = (method == "POST").then(|| json!({ "id": "x" }));
		let (status, _) = request(&ctl.router, method, path, None, None, body).await;
		assert_eq!(status, StatusCode::UNAUTHORIZED, "{method} {path}");
	}
}

#[tokio::test]
async fn agent_token_covers_health_and_plan_but_not_operator_surface() {
	let ctl = controller();
	let prepared = ctl.prepare("edge-1").await;
	let token = prepared["provisionToken"].as_str().unwrap().to_string();
	let (status, _) = ctl
		.register(json!({ "id": "edge-1", "provisionToken": token }), Some(&token))
		.await;
	assert_eq!(status, StatusCode::OK);

	let (status, _) = request(
		&ctl.router,
		"POST",
		"/api/v1/health",
		None,
		Some(&token),
		Some(json!({ "nodeId": "edge-1", "status": "up" })),
	)
	.await;
	assert_eq!(status, StatusCode::OK);

	let (status, _) = request(
		&ctl.router,
		"GET",
		"/api/v1/plan?nodeId=edge-1",
		None,
		Some(&token),
		None,
	)
	.await;
	assert_eq!(status, StatusCode::OK);

	let (status, _) = request(&ctl.router, "GET", "/api/v1/nodes", None, Some(&token), None).await;
	assert_eq!(status, StatusCode::UNAUTHORIZED);
}
