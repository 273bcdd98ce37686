// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::{
	PolicyUpdate, Result, Store, StoreError, AUDIT_RING_LIMIT, PLAN_HISTORY_LIMIT,
	POLICY_DIAG_LIMIT, POLICY_STATUS_LIMIT,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use peerwan_model::{
	node_revision, AuditEntry, HealthReport, Node, Plan, PolicyDiagReport, PolicyInstallLog,
	Settings, Task,
};
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Default)]
struct Inner {
	nodes: HashMap<String, Node>,
	revisions: HashMap<String, u64>,
	plans: HashMap<String, Plan>,
	plan_history: HashMap<String, Vec<Plan>>,
	global_plan_version: i64,
	health: HashMap<String, HealthReport>,
	health_history: HashMap<String, Vec<HealthReport>>,
	policy_status: HashMap<String, Vec<PolicyInstallLog>>,
	policy_diag: HashMap<String, Vec<PolicyDiagReport>>,
	tasks: HashMap<String, Task>,
	audit: Vec<AuditEntry>,
	settings: Settings,
}

/// Single-process store behind one reader-writer lock. Leader guard and
/// prefix watch are inherited no-ops: there is nobody else to coordinate
/// with.
pub struct MemoryStore {
	inner: RwLock<Inner>,
}

impl MemoryStore {
	pub fn new() -> Self {
		Self {
			inner: RwLock::new(Inner {
				settings: Settings::with_defaults(),
				..Default::default()
			}),
		}
	}
}

impl Default for MemoryStore {
	fn default() -> Self {
		Self::new()
	}
}

fn tail<T: Clone>(items: &[T], limit: usize) -> Vec<T> {
	let limit = if limit == 0 || limit > items.len() {
		items.len()
	} else {
		limit
	};
	items[items.len() - limit..].to_vec()
}

#[async_trait]
impl Store for MemoryStore {
	async fn upsert_node(&self, mut node: Node) -> Result<Node> {
		let mut inner = self.inner.write().await;
		let rev = inner.revisions.get(&node.id).copied().unwrap_or(0) + 1;
		node.config_version = node_revision(rev);
		inner.revisions.insert(node.id.clone(), rev);
		inner.nodes.insert(node.id.clone(), node.clone());
		Ok(node)
	}

	async fn get_node(&self, id: &str) -> Result<Option<Node>> {
		Ok(self.inner.read().await.nodes.get(id).cloned())
	}

	async fn list_nodes(&self) -> Result<Vec<Node>> {
		let inner = self.inner.read().await;
		let mut nodes: Vec<Node> = inner.nodes.values().cloned().collect();
		nodes.sort_by(|a, b| a.id.cmp(&b.id));
		Ok(nodes)
	}

	async fn save_plan(&self, plan: Plan) -> Result<()> {
		let mut inner = self.inner.write().await;
		let history = inner.plan_history.entry(plan.node_id.clone()).or_default();
		history.push(plan.clone());
		if history.len() > PLAN_HISTORY_LIMIT {
			let excess = history.len() - PLAN_HISTORY_LIMIT;
			history.drain(..excess);
		}
		inner.plans.insert(plan.node_id.clone(), plan);
		Ok(())
	}

	async fn get_plan(&self, node_id: &str) -> Result<Option<Plan>> {
		Ok(self.inner.read().await.plans.get(node_id).cloned())
	}

	async fn list_plan_history(&self, node_id: &str, limit: usize) -> Result<Vec<Plan>> {
		let inner = self.inner.read().await;
		let history = inner
			.plan_history
			.get(node_id)
			.map(Vec::as_slice)
			.unwrap_or_default();
		Ok(tail(history, limit))
	}

	async fn rollback_plan(&self, node_id: &str, version: i64) -> Result<Plan> {
		let mut inner = self.inner.write().await;
		let plan = inner
			.plan_history
			.get(node_id)
			.and_then(|history| history.iter().find(|p| p.version == version))
			.cloned()
			.ok_or_else(|| {
				StoreError::NotFound(format!("plan version {version} for node {node_id}"))
			})?;
		inner.plans.insert(node_id.to_string(), plan.clone());
		inner.global_plan_version = version;
		Ok(plan)
	}

	async fn set_global_plan_version(&self, version: i64) -> Result<()> {
		self.inner.write().await.global_plan_version = version;
		Ok(())
	}

	async fn get_global_plan_version(&self) -> Result<i64> {
		Ok(self.inner.read().await.global_plan_version)
	}

	async fn update_policy(&self, node_id: &str, update: PolicyUpdate) -> Result<()> {
		let mut inner = self.inner.write().await;
		let node = inner
			.nodes
			.get_mut(node_id)
			.ok_or_else(|| StoreError::NotFound(format!("node {node_id}")))?;
		node.egress_peer_id = update.egress_peer_id;
		node.policy_rules = update.rules;
		node.default_route = update.default_route;
		node.bypass_cidrs = update.bypass_cidrs;
		node.default_route_next_hop = update.default_route_next_hop;
		Ok(())
	}

	async fn save_health(&self, mut report: HealthReport) -> Result<()> {
		let mut inner = self.inner.write().await;
		if report.timestamp.timestamp() == 0 {
			report.timestamp = Utc::now();
		}
		let history = inner
			.health_history
			.entry(report.node_id.clone())
			.or_default();
		history.push(report.clone());
		let cutoff = Utc::now() - chrono::Duration::hours(24);
		history.retain(|h| h.timestamp > cutoff);
		inner.health.insert(report.node_id.clone(), report);
		Ok(())
	}

	async fn list_health(&self) -> Result<Vec<HealthReport>> {
		let inner = self.inner.read().await;
		let mut reports: Vec<HealthReport> = inner.health.values().cloned().collect();
		reports.sort_by(|a, b| a.node_id.cmp(&b.node_id));
		Ok(reports)
	}

	async fn list_health_history(
		&self,
		node_id: &str,
		since: DateTime<Utc>,
	) -> Result<Vec<HealthReport>> {
		let inner = self.inner.read().await;
		Ok(inner
			.health_history
			.get(node_id)
			.map(|history| {
				history
					.iter()
					.filter(|h| h.timestamp >= since)
					.cloned()
					.collect()
			})
			.unwrap_or_default())
	}

	async fn prune_health_before(&self, cutoff: DateTime<Utc>) -> Result<()> {
		let mut inner = self.inner.write().await;
		for history in inner.health_history.values_mut() {
			history.retain(|h| h.timestamp >= cutoff);
		}
		Ok(())
	}

	async fn save_policy_status(&self, log: PolicyInstallLog) -> Result<()> {
		let mut inner = self.inner.write().await;
		let list = inner.policy_status.entry(log.node_id.clone()).or_default();
		list.push(log);
		if list.len() > POLICY_STATUS_LIMIT {
			let excess = list.len() - POLICY_STATUS_LIMIT;
			list.drain(..excess);
		}
		Ok(())
	}

	async fn list_policy_status(
		&self,
		node_id: &str,
		limit: usize,
	) -> Result<Vec<PolicyInstallLog>> {
		let inner = self.inner.read().await;
		let list = inner
			.policy_status
			.get(node_id)
			.map(Vec::as_slice)
			.unwrap_or_default();
		Ok(tail(list, limit))
	}

	async fn save_policy_diag(&self, report: PolicyDiagReport) -> Result<()> {
		let mut inner = self.inner.write().await;
		let list = inner.policy_diag.entry(report.node_id.clone()).or_default();
		list.push(report);
		if list.len() > POLICY_DIAG_LIMIT {
			let excess = list.len() - POLICY_DIAG_LIMIT;
			list.drain(..excess);
		}
		Ok(())
	}

	async fn list_policy_diag(
		&self,
		node_id: &str,
		limit: usize,
	) -> Result<Vec<PolicyDiagReport>> {
		let inner = self.inner.read().await;
		let list = inner
			.policy_diag
			.get(node_id)
			.map(Vec::as_slice)
			.unwrap_or_default();
		Ok(tail(list, limit))
	}

	async fn save_task(&self, mut task: Task) -> Result<()> {
		let mut inner = self.inner.write().await;
		task.updated_at = Utc::now();
		inner.tasks.insert(task.id.clone(), task);
		Ok(())
	}

	async fn get_task(&self, id: &str) -> Result<Option<Task>> {
		Ok(self.inner.read().await.tasks.get(id).cloned())
	}

	async fn list_tasks(&self, node_id: &str, limit: usize) -> Result<Vec<Task>> {
		let inner = self.inner.read().await;
		let mut tasks: Vec<Task> = inner
			.tasks
			.values()
			.filter(|t| node_id.is_empty() || t.node_id == node_id || t.targets.iter().any(|x| x == node_id))
			.cloned()
			.collect();
		tasks.sort_by_key(|t| t.created_at);
		Ok(tail(&tasks, limit))
	}

	async fn append_audit(&self, entry: AuditEntry) -> Result<()> {
		let mut inner = self.inner.write().await;
		inner.audit.push(entry);
		if inner.audit.len() > AUDIT_RING_LIMIT {
			let excess = inner.audit.len() - AUDIT_RING_LIMIT;
			inner.audit.drain(..excess);
		}
		Ok(())
	}

	async fn list_audit(&self, limit: usize) -> Result<Vec<AuditEntry>> {
		let inner = self.inner.read().await;
		Ok(tail(&inner.audit, limit))
	}

	async fn get_settings(&self) -> Result<Settings> {
		Ok(self.inner.read().await.settings.clone())
	}

	async fn update_settings(&self, settings: Settings) -> Result<()> {
		self.inner.write().await.settings = settings;
		Ok(())
	}

	async fn ping(&self) -> Result<()> {
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use peerwan_model::PolicyRule;

	#[tokio::test]
	async fn upsert_bumps_node_revision() {
		let store = MemoryStore::new();
		let node = Node {
			id: "edge-1".to_string(),
			..Default::default()
		};
		let first = store.upsert_node(node.clone()).await.unwrap();
		assert_eq!(first.config_version, "v0.0.1");
		let second = store.upsert_node(node).await.unwrap();
		assert_eq!(second.config_version, "v0.0.2");
	}

	#[tokio::test]
	async fn plan_history_is_bounded_and_rollback_restores() {
		let store = MemoryStore::new();
		for v in 1..=25i64 {
			store
				.save_plan(Plan {
					node_id: "edge-1".to_string(),
					version: v,
					config_version: format!("dynamic-v{v}"),
					created_at: Utc::now(),
					..Default::default()
				})
				.await
				.unwrap();
		}
		let history = store.list_plan_history("edge-1", 0).await.unwrap();
		assert_eq!(history.len(), PLAN_HISTORY_LIMIT);
		assert_eq!(history.first().unwrap().version, 6);

		let rolled = store.rollback_plan("edge-1", 10).await.unwrap();
		assert_eq!(rolled.version, 10);
		assert_eq!(store.get_plan("edge-1").await.unwrap().unwrap().version, 10);
		assert_eq!(store.get_global_plan_version().await.unwrap(), 10);

		let missing = store.rollback_plan("edge-1", 3).await;
		assert!(matches!(missing, Err(StoreError::NotFound(_))));
	}

	#[tokio::test]
	async fn health_history_prunes_old_entries() {
		let store = MemoryStore::new();
		let mut old = HealthReport {
			node_id: "edge-1".to_string(),
			..Default::default()
		};
		old.timestamp = Utc::now() - chrono::Duration::hours(30);
		// Insert directly so save_health's own pruning doesn't interfere.
		store
			.inner
			.write()
			.await
			.health_history
			.entry("edge-1".to_string())
			.or_default()
			.push(old);
		store
			.save_health(HealthReport {
				node_id: "edge-1".to_string(),
				timestamp: Utc::now(),
				..Default::default()
			})
			.await
			.unwrap();
		store
			.prune_health_before(Utc::now() - chrono::Duration::hours(24))
			.await
			.unwrap();
		let history = store
			.list_health_history("edge-1", Utc::now() - chrono::Duration::hours(48))
			.await
			.unwrap();
		assert_eq!(history.len(), 1);
	}

	#[tokio::test]
	async fn update_policy_requires_existing_node() {
		let store = MemoryStore::new();
		let missing = store
			.update_policy("ghost", PolicyUpdate::default())
			.await;
		assert!(matches!(missing, Err(StoreError::NotFound(_))));

		store
			.upsert_node(Node {
				id: "edge-1".to_string(),
				..Default::default()
			})
			.await
			.unwrap();
		store
			.update_policy(
				"edge-1",
				PolicyUpdate {
					egress_peer_id: "edge-2".to_string(),
					rules: vec![PolicyRule {
						prefix: "192.0.2.0/24".to_string(),
						via_node: "edge-2".to_string(),
						..Default::default()
					}],
					..Default::default()
				},
			)
			.await
			.unwrap();
		let node = store.get_node("edge-1").await.unwrap().unwrap();
		assert_eq!(node.egress_peer_id, "edge-2");
		assert_eq!(node.policy_rules.len(), 1);
	}

	#[tokio::test]
	async fn policy_status_keeps_last_fifty() {
		let store = MemoryStore::new();
		for i in 0..60 {
			store
				.save_policy_status(PolicyInstallLog {
					node_id: "edge-1".to_string(),
					status: "success".to_string(),
					message: format!("apply {i}"),
					..Default::default()
				})
				.await
				.unwrap();
		}
		let all = store.list_policy_status("edge-1", 0).await.unwrap();
		assert_eq!(all.len(), POLICY_STATUS_LIMIT);
		assert_eq!(all.last().unwrap().message, "apply 59");
		let page = store.list_policy_status("edge-1", 5).await.unwrap();
		assert_eq!(page.len(), 5);
	}

	#[tokio::test]
	async fn tasks_filter_by_node_and_sort_by_creation() {
		let store = MemoryStore::new();
		for (id, node) in [("t1", "edge-1"), ("t2", "edge-2"), ("t3", "edge-1")] {
			store
				.save_task(Task {
					id: id.to_string(),
					node_id: node.to_string(),
					kind: "policy_apply".to_string(),
					status: "running".to_string(),
					created_at: Utc::now(),
					..Default::default()
				})
				.await
				.unwrap();
		}
		let edge1 = store.list_tasks("edge-1", 50).await.unwrap();
		assert_eq!(edge1.len(), 2);
		let all = store.list_tasks("", 50).await.unwrap();
		assert_eq!(all.len(), 3);
	}

	#[tokio::test]
	async fn settings_default_and_update() {
		let store = MemoryStore::new();
		let settings = store.get_settings().await.unwrap();
		assert_eq!(settings.diag.ping_interval, "3s");
		let mut updated = settings.clone();
		updated.diag.ping_interval = "10s".to_string();
		store.update_settings(updated).await.unwrap();
		assert_eq!(
			store.get_settings().await.unwrap().diag.ping_interval,
			"10s"
		);
	}
}
