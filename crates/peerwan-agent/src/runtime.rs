// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! The agent's shared state and message handlers.
//!
//! Everything long-lived is constructed once at boot and threaded through
//! [`AgentRuntime`]: the controller client, the reconciler, the cached plan
//! and the session handle. Handlers and tickers all borrow the same runtime;
//! nothing lives in process globals.

use crate::client::ControllerClient;
use crate::commands::CommandRunner;
use crate::diag::{collect_verify_targets, run_policy_diag, run_verify};
use crate::reconcile::{expand_rules, Reconciler};
use crate::session::SessionHandle;
use peerwan_model::{
	parse_dynamic_version, Envelope, Node, PlanResponse, PolicyInstallLog,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tracing::{info, warn};

/// The plan the agent last applied, kept for self-heal and task replays.
#[derive(Clone)]
pub struct CachedPlan {
	pub cfg: PlanResponse,
	pub node: Node,
}

pub struct AgentRuntime {
	pub client: ControllerClient,
	pub runner: Arc<dyn CommandRunner>,
	reconciler: Reconciler,
	session: SessionHandle,
	node_id: String,
	iface: String,
	private_key: String,
	cached: RwLock<Option<CachedPlan>>,
	/// Numeric version of the last successfully applied plan; pushed plans
	/// at or below it are ignored.
	last_version: AtomicI64,
	/// Current peer set, observed by the health reporter.
	peers_tx: watch::Sender<Vec<peerwan_model::Peer>>,
}

impl AgentRuntime {
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		client: ControllerClient,
		runner: Arc<dyn CommandRunner>,
		reconciler: Reconciler,
		session: SessionHandle,
		node_id: &str,
		iface: &str,
		private_key: &str,
	) -> Self {
		Self {
			client,
			runner,
			reconciler,
			session,
			node_id: node_id.to_string(),
			iface: iface.to_string(),
			private_key: private_key.to_string(),
			cached: RwLock::new(None),
			last_version: AtomicI64::new(0),
			peers_tx: watch::channel(Vec::new()).0,
		}
	}

	pub fn node_id(&self) -> &str {
		&self.node_id
	}

	pub fn last_version(&self) -> i64 {
		self.last_version.load(Ordering::SeqCst)
	}

	pub fn peers_watch(&self) -> watch::Receiver<Vec<peerwan_model::Peer>> {
		self.peers_tx.subscribe()
	}

	/// Apply a plan response: merge it over the cached node, reconcile, and
	/// advance the version watermark. Stale pushes are dropped unless
	/// `forced` (initial apply and self-heal re-apply).
	pub async fn handle_plan(&self, cfg: PlanResponse, forced: bool) -> crate::error::Result<()> {
		let version = parse_dynamic_version(&cfg.config_version);
		if !forced {
			if let Some(version) = version {
				if version <= self.last_version() {
					info!(
						version,
						last = self.last_version(),
						"ignoring stale plan"
					);
					return Ok(());
				}
			}
		}
		let base = self
			.cached
			.read()
			.await
			.as_ref()
			.map(|cache| cache.node.clone())
			.unwrap_or_else(|| Node {
				id: self.node_id.clone(),
				..Default::default()
			});
		let node = merge_plan_into_node(base, &cfg);
		self
			.reconciler
			.reconcile(&node, &cfg.peers, &self.private_key, cfg.geoip_config.clone())
			.await?;
		if let Some(version) = version {
			self.last_version.fetch_max(version, Ordering::SeqCst);
		}
		let _ = self.peers_tx.send(cfg.peers.clone());
		*self.cached.write().await = Some(CachedPlan {
			cfg: cfg.clone(),
			node,
		});
		self
			.session
			.push_log(format!("plan {} applied", cfg.config_version));
		info!(config_version = %cfg.config_version, peers = cfg.peers.len(), "plan applied");
		Ok(())
	}

	/// Re-render and re-apply the cached plan, correcting operator drift.
	/// Failures surface as a failed install log.
	pub async fn self_heal_tick(&self) {
		let Some(cache) = self.cached.read().await.clone() else {
			return;
		};
		if let Err(err) = self
			.reconciler
			.reconcile(
				&cache.node,
				&cache.cfg.peers,
				&self.private_key,
				cache.cfg.geoip_config.clone(),
			)
			.await
		{
			warn!(error = %err, "self-heal reconcile failed");
			self.report_install_status("failed", &err.to_string(), &cache.cfg.config_version)
				.await;
		}
	}

	async fn report_install_status(&self, status: &str, message: &str, version: &str) {
		let log = PolicyInstallLog {
			node_id: self.node_id.clone(),
			version: version.to_string(),
			status: status.to_string(),
			message: message.to_string(),
			logs: Vec::new(),
			timestamp: chrono::Utc::now(),
		};
		if let Err(err) = self.client.post_policy_status(&log).await {
			warn!(error = %err, "install status report failed");
		}
		self.session.send(Envelope::new(
			"install_status",
			&self.node_id,
			json!({ "status": status, "message": message, "version": version }),
		));
	}

	fn send_task_step(&self, task_id: &str, name: &str, status: &str, message: &str) {
		self.session.send(Envelope::new(
			"task_step",
			&self.node_id,
			json!({
				"taskId": task_id,
				"name": name,
				"status": status,
				"message": message,
				"nodeId": self.node_id,
				"timestamp": chrono::Utc::now(),
			}),
		));
	}

	/// `policy_apply`: re-apply the cached plan, streaming step updates.
	pub async fn run_apply_task(&self, task_id: &str) {
		self.send_task_step(task_id, "apply", "running", "re-applying configuration");
		let Some(cache) = self.cached.read().await.clone() else {
			self.send_task_step(task_id, "apply", "fail", "no plan cached yet");
			return;
		};
		match self
			.reconciler
			.reconcile(
				&cache.node,
				&cache.cfg.peers,
				&self.private_key,
				cache.cfg.geoip_config.clone(),
			)
			.await
		{
			Ok(_) => {
				self.send_task_step(task_id, "apply", "success", "configuration applied");
				self
					.report_install_status("success", "policy applied", &cache.cfg.config_version)
					.await;
			}
			Err(err) => {
				self.send_task_step(task_id, "apply", "fail", &err.to_string());
				self
					.report_install_status("failed", &err.to_string(), &cache.cfg.config_version)
					.await;
			}
		}
	}

	/// `policy_diag`: run the local probes, persist the report, stream it.
	pub async fn run_diag_task(&self, task_id: Option<&str>) {
		if let Some(task_id) = task_id {
			self.send_task_step(task_id, "diagnose", "running", "collecting checks");
		}
		let report = run_policy_diag(&self.runner, &self.iface, &self.node_id).await;
		if let Err(err) = self.client.post_policy_diag(&report).await {
			warn!(error = %err, "diag report failed");
		}
		if let Ok(payload) = serde_json::to_value(&report) {
			self
				.session
				.send(Envelope::new("diag_result", &self.node_id, payload));
		}
		if let Some(task_id) = task_id {
			let status = if report.summary == "fail" { "fail" } else { "success" };
			self.send_task_step(
				task_id,
				"diagnose",
				status,
				&format!("summary: {}", report.summary),
			);
		}
	}

	/// `verify`: outbound reachability of policy targets (or the given ones).
	pub async fn run_verify_task(&self, task_id: Option<&str>, mut targets: Vec<String>) {
		if targets.is_empty() {
			if let Some(cache) = self.cached.read().await.clone() {
				let expanded = expand_rules(&cache.node, cache.cfg.geoip_config.clone()).await;
				let prefixes: Vec<Vec<String>> =
					expanded.iter().map(|item| item.prefixes.clone()).collect();
				targets = collect_verify_targets(&cache.node.policy_rules, &prefixes);
			}
		}
		if let Some(task_id) = task_id {
			self.send_task_step(
				task_id,
				"verify",
				"running",
				&format!("{} target(s)", targets.len()),
			);
		}
		match run_verify(&targets).await {
			Ok(()) => {
				if let Some(task_id) = task_id {
					self.send_task_step(task_id, "verify", "success", "all targets reachable");
				}
			}
			Err(err) => {
				warn!(error = %err, "verify failed");
				if let Some(task_id) = task_id {
					self.send_task_step(task_id, "verify", "fail", &err.to_string());
				}
			}
		}
	}

	/// Dispatch for `command` envelopes pushed by operators.
	pub async fn handle_command(&self, payload: Value) {
		let action = payload
			.get("action")
			.and_then(Value::as_str)
			.unwrap_or_default();
		info!(action, "command received");
		match action {
			"apply" => self.self_heal_tick().await,
			"diag" => self.run_diag_task(None).await,
			"verify" => {
				let targets = payload
					.get("data")
					.and_then(|d| d.get("targets"))
					.and_then(Value::as_array)
					.map(|list| {
						list
							.iter()
							.filter_map(Value::as_str)
							.map(str::to_string)
							.collect()
					})
					.unwrap_or_default();
				self.run_verify_task(None, targets).await;
			}
			other => warn!(action = other, "unknown command action"),
		}
	}

	/// Dispatch for `task` envelopes.
	pub async fn handle_task(&self, payload: Value) {
		let task_id = payload
			.get("taskId")
			.and_then(Value::as_str)
			.unwrap_or_default()
			.to_string();
		let kind = payload
			.get("type")
			.and_then(Value::as_str)
			.unwrap_or_default();
		info!(task_id = %task_id, kind, "task received");
		match kind {
			"policy_apply" => self.run_apply_task(&task_id).await,
			"policy_diag" => self.run_diag_task(Some(&task_id)).await,
			"verify" => {
				let targets = payload
					.get("verifyTargets")
					.and_then(Value::as_array)
					.map(|list| {
						list
							.iter()
							.filter_map(Value::as_str)
							.map(str::to_string)
							.collect()
					})
					.unwrap_or_default();
				self.run_verify_task(Some(&task_id), targets).await;
			}
			other => warn!(kind = other, "unknown task type"),
		}
	}
}

/// Overlay the controller's plan response onto the known node identity.
/// Non-empty response fields win; everything else carries over.
pub fn merge_plan_into_node(mut node: Node, cfg: &PlanResponse) -> Node {
	if !cfg.overlay_ip.is_empty() {
		node.overlay_ip = cfg.overlay_ip.clone();
	}
	if cfg.listen_port > 0 {
		node.listen_port = cfg.listen_port;
	}
	if cfg.asn > 0 {
		node.asn = cfg.asn;
	}
	if !cfg.router_id.is_empty() {
		node.router_id = cfg.router_id.clone();
	}
	if !cfg.routes.is_empty() {
		node.cidrs = cfg.routes.clone();
	}
	if !cfg.peer_endpoints.is_empty() {
		node.peer_endpoints = cfg.peer_endpoints.clone();
	}
	node.egress_peer_id = cfg.egress_peer_id.clone();
	node.policy_rules = cfg.policy_rules.clone();
	node.default_route = cfg.default_route;
	node.bypass_cidrs = cfg.bypass_cidrs.clone();
	node.default_route_next_hop = cfg.default_route_next_hop.clone();
	node
}

/// Long-poll fallback: parked on the version watermark, it converges the
/// agent while the push channel is down.
pub async fn plan_poll_loop(
	runtime: Arc<AgentRuntime>,
	interval: Duration,
	mut shutdown: watch::Receiver<bool>,
) {
	loop {
		if *shutdown.borrow() {
			return;
		}
		let before = runtime.last_version();
		let fetched = tokio::select! {
			_ = shutdown.changed() => return,
			fetched = runtime.client.fetch_plan(runtime.node_id(), Some(before)) => fetched,
		};
		match fetched {
			Ok(cfg) => {
				if let Err(err) = runtime.handle_plan(cfg, false).await {
					warn!(error = %err, "plan apply failed");
				}
			}
			Err(err) => {
				warn!(error = %err, "plan poll failed");
			}
		}
		// Pace re-polls unless the watermark actually advanced; the global
		// version can move without this node's plan changing.
		if runtime.last_version() <= before {
			tokio::select! {
				_ = shutdown.changed() => return,
				_ = tokio::time::sleep(interval) => {}
			}
		}
	}
}

/// Periodic self-heal at the plan-poll cadence.
pub async fn self_heal_loop(
	runtime: Arc<AgentRuntime>,
	interval: Duration,
	mut shutdown: watch::Receiver<bool>,
) {
	let mut ticker = tokio::time::interval(interval);
	ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
	// The first tick fires immediately; skip it, the boot apply just ran.
	ticker.tick().await;
	loop {
		tokio::select! {
			_ = shutdown.changed() => {
				if *shutdown.borrow() {
					return;
				}
			}
			_ = ticker.tick() => {
				runtime.self_heal_tick().await;
			}
		}
	}
}
