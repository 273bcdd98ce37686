// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Versioned plan computation.
//!
//! Every mutation that can affect plans (registration, policy edit, health
//! arrival, leader tick, KV watch fire) funnels through here: distribute
//! rules, run the planner per node, compose and sign a plan, persist it under
//! a freshly incremented global version, and push it to the connected agent.
//! Long-polling agents wake through [`PlanService::wait_for_version`].

use crate::error::ServerError;
use crate::hub::Hub;
use peerwan_model::{
	dynamic_version, AuditEntry, HealthReport, Node, Plan, PlanResponse, PolicyRule, Settings,
};
use peerwan_policy::distribute_rules;
use peerwan_store::{Store, StoreError};
use peerwan_topology::{build_peer_plan, sign_plan};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

const RECOMPUTE_RETRIES: usize = 3;
const LONG_POLL_WINDOW: Duration = Duration::from_secs(20);
const LONG_POLL_TICK: Duration = Duration::from_millis(500);

pub struct PlanService {
	store: Arc<dyn Store>,
	hub: Arc<Hub>,
	version: AtomicI64,
}

impl PlanService {
	pub fn new(store: Arc<dyn Store>, hub: Arc<Hub>) -> Self {
		Self {
			store,
			hub,
			version: AtomicI64::new(0),
		}
	}

	/// Seed the in-process counter from the store at boot (and after CAS
	/// conflicts, where another controller may have advanced it).
	pub async fn sync_version_floor(&self) {
		if let Ok(stored) = self.store.get_global_plan_version().await {
			self.version.fetch_max(stored, Ordering::SeqCst);
		}
	}

	pub fn current_version(&self) -> i64 {
		self.version.load(Ordering::SeqCst)
	}

	/// Advance the counter without composing plans (provisioning path).
	pub async fn bump(&self) -> i64 {
		let next = self.version.fetch_add(1, Ordering::SeqCst) + 1;
		if let Err(err) = self.store.set_global_plan_version(next).await {
			warn!(error = %err, "failed to mirror plan version to store");
		}
		next
	}

	/// Block until the global version exceeds `target`, up to the long-poll
	/// window.
	pub async fn wait_for_version(&self, target: i64) {
		let deadline = tokio::time::Instant::now() + LONG_POLL_WINDOW;
		while tokio::time::Instant::now() < deadline {
			if self.current_version() > target {
				return;
			}
			tokio::time::sleep(LONG_POLL_TICK).await;
		}
	}

	/// Recompute and persist plans for every node, retrying the whole pass on
	/// a store CAS conflict.
	#[instrument(skip(self))]
	pub async fn recompute_all(&self) -> Result<(), ServerError> {
		for attempt in 1..=RECOMPUTE_RETRIES {
			match self.recompute_all_once().await {
				Ok(()) => return Ok(()),
				Err(ServerError::Store(StoreError::Conflict(node))) => {
					warn!(attempt, node, "plan CAS conflict; retrying recompute");
					self.sync_version_floor().await;
				}
				Err(err) => return Err(err),
			}
		}
		Err(ServerError::Internal(
			"plan recompute exhausted CAS retries".to_string(),
		))
	}

	async fn recompute_all_once(&self) -> Result<(), ServerError> {
		let nodes = self.store.list_nodes().await?;
		let mut rules = distribute_rules(&nodes);
		let health = self.health_by_node().await?;
		for node in &nodes {
			let peers = build_peer_plan(&node.id, &nodes, &health);
			let node_rules = rules.remove(&node.id).unwrap_or_default();
			self.save_plan_with_rules(node, peers, node_rules).await?;
		}
		debug!(nodes = nodes.len(), version = self.current_version(), "plans recomputed");
		Ok(())
	}

	/// Recompute and persist the plan for a single node against current
	/// state, returning it.
	#[instrument(skip(self))]
	pub async fn recompute_node(&self, node_id: &str) -> Result<Plan, ServerError> {
		let nodes = self.store.list_nodes().await?;
		let node = nodes
			.iter()
			.find(|n| n.id == node_id)
			.cloned()
			.unwrap_or_else(|| Node {
				id: node_id.to_string(),
				..Default::default()
			});
		let mut rules = distribute_rules(&nodes);
		let health = self.health_by_node().await?;
		let peers = build_peer_plan(node_id, &nodes, &health);
		let node_rules = rules.remove(node_id).unwrap_or_default();
		self.save_plan_with_rules(&node, peers, node_rules).await
	}

	async fn health_by_node(&self) -> Result<HashMap<String, HealthReport>, ServerError> {
		let mut map = HashMap::new();
		for report in self.store.list_health().await? {
			map.insert(report.node_id.clone(), report);
		}
		Ok(map)
	}

	async fn save_plan_with_rules(
		&self,
		node: &Node,
		peers: Vec<peerwan_model::Peer>,
		rules: Vec<PolicyRule>,
	) -> Result<Plan, ServerError> {
		let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
		let config_version = dynamic_version(version);
		let plan = Plan {
			node_id: node.id.clone(),
			version,
			config_version: config_version.clone(),
			signature: sign_plan(&node.id, &config_version, &peers),
			peers,
			routes: node.cidrs.clone(),
			created_at: chrono::Utc::now(),
			egress_peer_id: node.egress_peer_id.clone(),
			policy_rules: rules,
			peer_endpoints: node.peer_endpoints.clone(),
			default_route: node.default_route,
			bypass_cidrs: node.bypass_cidrs.clone(),
			default_route_next_hop: node.default_route_next_hop.clone(),
		};
		self.store.save_plan(plan.clone()).await?;
		if let Err(err) = self.store.set_global_plan_version(version).await {
			warn!(error = %err, "failed to mirror plan version to store");
		}
		self.push_plan(node, &plan).await;
		Ok(plan)
	}

	/// Push a freshly saved plan to the node's live session, if any.
	async fn push_plan(&self, node: &Node, plan: &Plan) {
		let settings = self
			.store
			.get_settings()
			.await
			.unwrap_or_else(|_| Settings::with_defaults());
		let response = self.plan_response(node, plan, &settings, "plan push");
		let payload = match serde_json::to_value(&response) {
			Ok(payload) => payload,
			Err(err) => {
				warn!(error = %err, "failed to encode plan push");
				return;
			}
		};
		self
			.hub
			.send(&node.id, peerwan_model::Envelope::new("plan", &node.id, payload))
			.await;
	}

	/// Assemble the agent-facing view of a plan. Secrets are the caller's
	/// concern; the bootstrap path adds them explicitly.
	pub fn plan_response(
		&self,
		node: &Node,
		plan: &Plan,
		settings: &Settings,
		message: &str,
	) -> PlanResponse {
		PlanResponse {
			id: node.id.clone(),
			config_version: plan.config_version.clone(),
			peers: plan.peers.clone(),
			routes: node.cidrs.clone(),
			overlay_ip: node.overlay_ip.clone(),
			listen_port: node.listen_port,
			asn: node.asn,
			router_id: node.router_id.clone(),
			endpoints: node.endpoints.clone(),
			private_key: String::new(),
			public_key: node.public_key.clone(),
			egress_peer_id: node.egress_peer_id.clone(),
			policy_rules: plan.policy_rules.clone(),
			peer_endpoints: node.peer_endpoints.clone(),
			geoip_config: Some(settings.geoip.clone().or_defaults()),
			default_route: node.default_route,
			bypass_cidrs: node.bypass_cidrs.clone(),
			default_route_next_hop: node.default_route_next_hop.clone(),
			health_interval_sec: settings.diag.ping_interval_duration().as_secs(),
			message: message.to_string(),
		}
	}

	/// Roll the node back to a historical version: re-verify the stored
	/// signature, restore it as latest, reset the global counter, audit.
	#[instrument(skip(self))]
	pub async fn rollback(&self, node_id: &str, version: i64) -> Result<Plan, ServerError> {
		let plan = self.store.rollback_plan(node_id, version).await?;
		if !plan.signature.is_empty() {
			let expected = sign_plan(&plan.node_id, &plan.config_version, &plan.peers);
			if plan.signature != expected {
				return Err(ServerError::BadRequest(
					"rollback signature mismatch".to_string(),
				));
			}
		}
		self.version.store(plan.version, Ordering::SeqCst);
		self.store.set_global_plan_version(plan.version).await?;
		let _ = self
			.store
			.append_audit(AuditEntry::now(
				"controller",
				"rollback_plan",
				node_id,
				format!("rollback to version {version}"),
			))
			.await;
		info!(node_id, version, "plan rolled back");
		Ok(plan)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use peerwan_model::HealthStatus;
	use peerwan_store::MemoryStore;

	fn node(id: &str, endpoint: &str, overlay: &str, cidr: &str) -> Node {
		Node {
			id: id.to_string(),
			public_key: format!("pk-{id}"),
			endpoints: vec![endpoint.to_string()],
			overlay_ip: overlay.to_string(),
			cidrs: vec![cidr.to_string()],
			..Default::default()
		}
	}

	async fn service_with_two_nodes() -> (Arc<PlanService>, Arc<dyn Store>) {
		let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
		store
			.upsert_node(node("edge-1", "203.0.113.1:51820", "10.10.1.1/32", "10.1.0.0/24"))
			.await
			.unwrap();
		store
			.upsert_node(node("edge-2", "203.0.113.2:51820", "10.10.2.1/32", "10.2.0.0/24"))
			.await
			.unwrap();
		let service = Arc::new(PlanService::new(Arc::clone(&store), Arc::new(Hub::new())));
		(service, store)
	}

	#[tokio::test]
	async fn recompute_assigns_strictly_increasing_versions() {
		let (service, store) = service_with_two_nodes().await;
		service.recompute_all().await.unwrap();
		let first = store.get_plan("edge-1").await.unwrap().unwrap();
		service.recompute_all().await.unwrap();
		let second = store.get_plan("edge-1").await.unwrap().unwrap();
		assert!(second.version > first.version);
		assert_eq!(second.config_version, dynamic_version(second.version));
		assert_eq!(
			store.get_global_plan_version().await.unwrap(),
			service.current_version()
		);
	}

	#[tokio::test]
	async fn two_node_mesh_plans_are_symmetric() {
		let (service, store) = service_with_two_nodes().await;
		service.recompute_all().await.unwrap();
		let plan = store.get_plan("edge-1").await.unwrap().unwrap();
		assert_eq!(plan.peers.len(), 1);
		assert_eq!(plan.peers[0].id, "edge-2");
		assert_eq!(plan.peers[0].endpoint, "203.0.113.2:51820");
		assert_eq!(
			plan.peers[0].allowed_ips,
			vec!["10.10.2.1/32", "10.2.0.0/24"]
		);
		assert_eq!(plan.peers[0].keepalive, 25);

		let mirror = store.get_plan("edge-2").await.unwrap().unwrap();
		assert_eq!(mirror.peers[0].id, "edge-1");
		assert!(!plan.signature.is_empty());
	}

	#[tokio::test]
	async fn rollback_restores_version_and_counter() {
		let (service, store) = service_with_two_nodes().await;
		service.recompute_all().await.unwrap();
		let v1 = store.get_plan("edge-1").await.unwrap().unwrap();
		service.recompute_all().await.unwrap();
		service.recompute_all().await.unwrap();

		let rolled = service.rollback("edge-1", v1.version).await.unwrap();
		assert_eq!(rolled.version, v1.version);
		assert_eq!(rolled.signature, v1.signature);
		assert_eq!(service.current_version(), v1.version);
		assert_eq!(store.get_global_plan_version().await.unwrap(), v1.version);
		assert_eq!(
			store.get_plan("edge-1").await.unwrap().unwrap().version,
			v1.version
		);
	}

	#[tokio::test]
	async fn rollback_rejects_tampered_history() {
		let (service, store) = service_with_two_nodes().await;
		service.recompute_all().await.unwrap();
		let mut plan = store.get_plan("edge-1").await.unwrap().unwrap();
		// A history entry whose signature does not match its contents.
		plan.version = 999;
		plan.config_version = dynamic_version(999);
		plan.signature = "deadbeef".to_string();
		store.save_plan(plan).await.unwrap();

		let result = service.rollback("edge-1", 999).await;
		assert!(matches!(result, Err(ServerError::BadRequest(_))));
	}

	#[tokio::test]
	async fn down_peers_drop_out_after_health_arrival() {
		let (service, store) = service_with_two_nodes().await;
		service.recompute_all().await.unwrap();
		store
			.save_health(HealthReport {
				node_id: "edge-2".to_string(),
				status: HealthStatus::Down,
				timestamp: chrono::Utc::now(),
				..Default::default()
			})
			.await
			.unwrap();
		let plan = service.recompute_node("edge-1").await.unwrap();
		assert!(plan.peers.is_empty());
	}

	#[tokio::test]
	async fn wait_for_version_returns_on_bump() {
		let (service, _) = service_with_two_nodes().await;
		let current = service.current_version();
		let waiter = Arc::clone(&service);
		let handle = tokio::spawn(async move {
			let started = tokio::time::Instant::now();
			waiter.wait_for_version(current).await;
			started.elapsed()
		});
		tokio::time::sleep(Duration::from_millis(50)).await;
		service.bump().await;
		let waited = handle.await.unwrap();
		assert!(waited < Duration::from_secs(2));
	}
}
