// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::{
	keys, LeaderEvent, PolicyUpdate, Result, Store, StoreError, ChangeCallback,
	PLAN_HISTORY_LIMIT,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use peerwan_model::{
	node_revision, AuditEntry, HealthReport, Node, Plan, PolicyDiagReport, PolicyInstallLog,
	Settings, Task,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// One stored key with the backend's modify index for compare-and-set.
#[derive(Debug, Clone)]
pub struct KvEntry {
	pub key: String,
	pub value: Vec<u8>,
	pub modify_index: u64,
}

/// Minimal replicated-KV surface the [`KvStore`] is written against:
/// plain get/put/list/delete, compare-and-set keyed on the modify index,
/// blocking prefix reads for watches, and TTL sessions for locks.
#[async_trait]
pub trait KvClient: Send + Sync + 'static {
	async fn get(&self, key: &str) -> Result<Option<KvEntry>>;
	async fn list(&self, prefix: &str) -> Result<Vec<KvEntry>>;
	async fn put(&self, key: &str, value: Vec<u8>) -> Result<()>;
	/// Write only if the key's modify index still equals `modify_index`
	/// (0 = key must not exist). Returns whether the write happened.
	async fn cas(&self, key: &str, value: Vec<u8>, modify_index: u64) -> Result<bool>;
	async fn delete(&self, key: &str) -> Result<()>;
	/// Block until the index under `prefix` moves past `index`, returning the
	/// new index. Implementations bound the wait server-side.
	async fn wait_prefix(&self, prefix: &str, index: u64) -> Result<u64>;
	async fn create_session(&self, ttl: Duration) -> Result<String>;
	async fn renew_session(&self, session: &str) -> Result<()>;
	async fn destroy_session(&self, session: &str) -> Result<()>;
	async fn acquire(&self, key: &str, session: &str) -> Result<bool>;
	async fn release(&self, key: &str, session: &str) -> Result<()>;
	async fn ping(&self) -> Result<()>;
}

/// Node as persisted in the KV backend: the public record plus the
/// controller-side secrets the wire type never serializes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NodeRecord {
	#[serde(flatten)]
	node: Node,
	#[serde(default, skip_serializing_if = "String::is_empty")]
	private_key: String,
	#[serde(default, skip_serializing_if = "String::is_empty")]
	provision_token: String,
}

impl NodeRecord {
	fn wrap(node: Node) -> Self {
		let private_key = node.private_key.clone();
		let provision_token = node.provision_token.clone();
		Self {
			node,
			private_key,
			provision_token,
		}
	}

	fn unwrap(self) -> Node {
		let mut node = self.node;
		node.private_key = self.private_key;
		node.provision_token = self.provision_token;
		node
	}
}

/// [`Store`] over a replicated KV backend, laid out per [`keys`].
pub struct KvStore<C: KvClient> {
	client: Arc<C>,
}

impl<C: KvClient> KvStore<C> {
	pub fn new(client: C) -> Self {
		Self {
			client: Arc::new(client),
		}
	}

	fn node_key(id: &str) -> String {
		format!("{}{id}", keys::NODE_PREFIX)
	}

	fn plan_key(node_id: &str) -> String {
		format!("{}{node_id}", keys::PLAN_PREFIX)
	}

	fn plan_history_key(node_id: &str, version: i64) -> String {
		format!("{}{node_id}/{version}", keys::PLAN_PREFIX)
	}

	async fn read_node(&self, id: &str) -> Result<Option<Node>> {
		match self.client.get(&Self::node_key(id)).await? {
			Some(entry) => {
				let record: NodeRecord = serde_json::from_slice(&entry.value)?;
				Ok(Some(record.unwrap()))
			}
			None => Ok(None),
		}
	}

	async fn write_node(&self, node: Node) -> Result<()> {
		let key = Self::node_key(&node.id);
		let record = NodeRecord::wrap(node);
		self.client.put(&key, serde_json::to_vec(&record)?).await
	}

	/// Decode a timestamp-suffixed key (`prefix/<id>/<unixnanos>`).
	fn key_nanos(key: &str) -> Option<i64> {
		key.rsplit('/').next().and_then(|tail| tail.parse().ok())
	}
}

#[async_trait]
impl<C: KvClient> Store for KvStore<C> {
	async fn upsert_node(&self, mut node: Node) -> Result<Node> {
		let rev = match self.read_node(&node.id).await? {
			Some(existing) => existing
				.config_version
				.rsplit('.')
				.next()
				.and_then(|n| n.parse::<u64>().ok())
				.unwrap_or(0),
			None => 0,
		};
		node.config_version = node_revision(rev + 1);
		self.write_node(node.clone()).await?;
		Ok(node)
	}

	async fn get_node(&self, id: &str) -> Result<Option<Node>> {
		self.read_node(id).await
	}

	async fn list_nodes(&self) -> Result<Vec<Node>> {
		let entries = self.client.list(keys::NODE_PREFIX).await?;
		let mut nodes = Vec::with_capacity(entries.len());
		for entry in entries {
			match serde_json::from_slice::<NodeRecord>(&entry.value) {
				Ok(record) => nodes.push(record.unwrap()),
				Err(err) => warn!(key = %entry.key, error = %err, "skipping corrupt node record"),
			}
		}
		nodes.sort_by(|a, b| a.id.cmp(&b.id));
		Ok(nodes)
	}

	async fn save_plan(&self, plan: Plan) -> Result<()> {
		let key = Self::plan_key(&plan.node_id);
		let index = self
			.client
			.get(&key)
			.await?
			.map(|entry| entry.modify_index)
			.unwrap_or(0);
		let body = serde_json::to_vec(&plan)?;
		if !self.client.cas(&key, body.clone(), index).await? {
			return Err(StoreError::Conflict(plan.node_id));
		}
		self
			.client
			.put(&Self::plan_history_key(&plan.node_id, plan.version), body)
			.await?;
		// Trim history beyond the retention bound.
		let mut history = self.list_plan_history(&plan.node_id, 0).await?;
		if history.len() > PLAN_HISTORY_LIMIT {
			history.sort_by_key(|p| p.version);
			for stale in &history[..history.len() - PLAN_HISTORY_LIMIT] {
				let _ = self
					.client
					.delete(&Self::plan_history_key(&stale.node_id, stale.version))
					.await;
			}
		}
		Ok(())
	}

	async fn get_plan(&self, node_id: &str) -> Result<Option<Plan>> {
		match self.client.get(&Self::plan_key(node_id)).await? {
			Some(entry) => Ok(Some(serde_json::from_slice(&entry.value)?)),
			None => Ok(None),
		}
	}

	async fn list_plan_history(&self, node_id: &str, limit: usize) -> Result<Vec<Plan>> {
		let prefix = format!("{}{node_id}/", keys::PLAN_PREFIX);
		let entries = self.client.list(&prefix).await?;
		let mut plans: Vec<Plan> = Vec::with_capacity(entries.len());
		for entry in entries {
			if let Ok(plan) = serde_json::from_slice::<Plan>(&entry.value) {
				plans.push(plan);
			}
		}
		plans.sort_by_key(|p| p.version);
		if limit > 0 && plans.len() > limit {
			let excess = plans.len() - limit;
			plans.drain(..excess);
		}
		Ok(plans)
	}

	async fn rollback_plan(&self, node_id: &str, version: i64) -> Result<Plan> {
		let entry = self
			.client
			.get(&Self::plan_history_key(node_id, version))
			.await?
			.ok_or_else(|| {
				StoreError::NotFound(format!("plan version {version} for node {node_id}"))
			})?;
		let plan: Plan = serde_json::from_slice(&entry.value)?;
		let latest_key = Self::plan_key(node_id);
		let index = self
			.client
			.get(&latest_key)
			.await?
			.map(|e| e.modify_index)
			.unwrap_or(0);
		if !self
			.client
			.cas(&latest_key, entry.value.clone(), index)
			.await?
		{
			return Err(StoreError::Conflict(node_id.to_string()));
		}
		self.set_global_plan_version(version).await?;
		Ok(plan)
	}

	async fn set_global_plan_version(&self, version: i64) -> Result<()> {
		self
			.client
			.put(keys::VERSION_KEY, version.to_string().into_bytes())
			.await
	}

	async fn get_global_plan_version(&self) -> Result<i64> {
		Ok(self
			.client
			.get(keys::VERSION_KEY)
			.await?
			.and_then(|entry| String::from_utf8(entry.value).ok())
			.and_then(|text| text.trim().parse().ok())
			.unwrap_or(0))
	}

	async fn update_policy(&self, node_id: &str, update: PolicyUpdate) -> Result<()> {
		let mut node = self
			.read_node(node_id)
			.await?
			.ok_or_else(|| StoreError::NotFound(format!("node {node_id}")))?;
		node.egress_peer_id = update.egress_peer_id;
		node.policy_rules = update.rules;
		node.default_route = update.default_route;
		node.bypass_cidrs = update.bypass_cidrs;
		node.default_route_next_hop = update.default_route_next_hop;
		self.write_node(node).await
	}

	async fn save_health(&self, mut report: HealthReport) -> Result<()> {
		if report.timestamp.timestamp() == 0 {
			report.timestamp = Utc::now();
		}
		let body = serde_json::to_vec(&report)?;
		self
			.client
			.put(
				&format!("{}{}", keys::HEALTH_PREFIX, report.node_id),
				body.clone(),
			)
			.await?;
		let nanos = report.timestamp.timestamp_nanos_opt().unwrap_or_default();
		self
			.client
			.put(
				&format!("{}{}/{nanos}", keys::HEALTH_HISTORY_PREFIX, report.node_id),
				body,
			)
			.await
	}

	async fn list_health(&self) -> Result<Vec<HealthReport>> {
		let entries = self.client.list(keys::HEALTH_PREFIX).await?;
		let mut reports = Vec::with_capacity(entries.len());
		for entry in entries {
			if let Ok(report) = serde_json::from_slice::<HealthReport>(&entry.value) {
				reports.push(report);
			}
		}
		Ok(reports)
	}

	async fn list_health_history(
		&self,
		node_id: &str,
		since: DateTime<Utc>,
	) -> Result<Vec<HealthReport>> {
		let prefix = format!("{}{node_id}/", keys::HEALTH_HISTORY_PREFIX);
		let entries = self.client.list(&prefix).await?;
		let mut reports = Vec::new();
		for entry in entries {
			if let Ok(report) = serde_json::from_slice::<HealthReport>(&entry.value) {
				if report.timestamp >= since {
					reports.push(report);
				}
			}
		}
		reports.sort_by_key(|r| r.timestamp);
		Ok(reports)
	}

	async fn prune_health_before(&self, cutoff: DateTime<Utc>) -> Result<()> {
		let cutoff_nanos = cutoff.timestamp_nanos_opt().unwrap_or_default();
		let entries = self.client.list(keys::HEALTH_HISTORY_PREFIX).await?;
		for entry in entries {
			if let Some(nanos) = Self::key_nanos(&entry.key) {
				if nanos < cutoff_nanos {
					self.client.delete(&entry.key).await?;
				}
			}
		}
		Ok(())
	}

	async fn save_policy_status(&self, mut log: PolicyInstallLog) -> Result<()> {
		if log.timestamp.timestamp() == 0 {
			log.timestamp = Utc::now();
		}
		let nanos = log.timestamp.timestamp_nanos_opt().unwrap_or_default();
		self
			.client
			.put(
				&format!("{}{}/{nanos}", keys::POLICY_STATUS_PREFIX, log.node_id),
				serde_json::to_vec(&log)?,
			)
			.await
	}

	async fn list_policy_status(
		&self,
		node_id: &str,
		limit: usize,
	) -> Result<Vec<PolicyInstallLog>> {
		let prefix = format!("{}{node_id}/", keys::POLICY_STATUS_PREFIX);
		let entries = self.client.list(&prefix).await?;
		let mut logs: Vec<PolicyInstallLog> = entries
			.iter()
			.filter_map(|entry| serde_json::from_slice(&entry.value).ok())
			.collect();
		logs.sort_by_key(|l| l.timestamp);
		if limit > 0 && logs.len() > limit {
			let excess = logs.len() - limit;
			logs.drain(..excess);
		}
		Ok(logs)
	}

	async fn save_policy_diag(&self, mut report: PolicyDiagReport) -> Result<()> {
		if report.timestamp.timestamp() == 0 {
			report.timestamp = Utc::now();
		}
		let nanos = report.timestamp.timestamp_nanos_opt().unwrap_or_default();
		self
			.client
			.put(
				&format!("{}{}/{nanos}", keys::POLICY_DIAG_PREFIX, report.node_id),
				serde_json::to_vec(&report)?,
			)
			.await
	}

	async fn list_policy_diag(
		&self,
		node_id: &str,
		limit: usize,
	) -> Result<Vec<PolicyDiagReport>> {
		let prefix = format!("{}{node_id}/", keys::POLICY_DIAG_PREFIX);
		let entries = self.client.list(&prefix).await?;
		let mut reports: Vec<PolicyDiagReport> = entries
			.iter()
			.filter_map(|entry| serde_json::from_slice(&entry.value).ok())
			.collect();
		reports.sort_by_key(|r| r.timestamp);
		if limit > 0 && reports.len() > limit {
			let excess = reports.len() - limit;
			reports.drain(..excess);
		}
		Ok(reports)
	}

	async fn save_task(&self, mut task: Task) -> Result<()> {
		task.updated_at = Utc::now();
		self
			.client
			.put(
				&format!("{}{}", keys::TASK_PREFIX, task.id),
				serde_json::to_vec(&task)?,
			)
			.await
	}

	async fn get_task(&self, id: &str) -> Result<Option<Task>> {
		match self.client.get(&format!("{}{id}", keys::TASK_PREFIX)).await? {
			Some(entry) => Ok(Some(serde_json::from_slice(&entry.value)?)),
			None => Ok(None),
		}
	}

	async fn list_tasks(&self, node_id: &str, limit: usize) -> Result<Vec<Task>> {
		let entries = self.client.list(keys::TASK_PREFIX).await?;
		let mut tasks: Vec<Task> = entries
			.iter()
			.filter_map(|entry| serde_json::from_slice::<Task>(&entry.value).ok())
			.filter(|t| {
				node_id.is_empty() || t.node_id == node_id || t.targets.iter().any(|x| x == node_id)
			})
			.collect();
		tasks.sort_by_key(|t| t.created_at);
		if limit > 0 && tasks.len() > limit {
			let excess = tasks.len() - limit;
			tasks.drain(..excess);
		}
		Ok(tasks)
	}

	async fn append_audit(&self, entry: AuditEntry) -> Result<()> {
		let nanos = entry.timestamp.timestamp_nanos_opt().unwrap_or_default();
		self
			.client
			.put(
				&format!("{}{nanos}-{}", keys::AUDIT_PREFIX, entry.target),
				serde_json::to_vec(&entry)?,
			)
			.await
	}

	async fn list_audit(&self, limit: usize) -> Result<Vec<AuditEntry>> {
		let entries = self.client.list(keys::AUDIT_PREFIX).await?;
		let mut audit: Vec<AuditEntry> = entries
			.iter()
			.filter_map(|entry| serde_json::from_slice(&entry.value).ok())
			.collect();
		audit.sort_by_key(|e| e.timestamp);
		if limit > 0 && audit.len() > limit {
			let excess = audit.len() - limit;
			audit.drain(..excess);
		}
		Ok(audit)
	}

	async fn get_settings(&self) -> Result<Settings> {
		match self.client.get(keys::SETTINGS_KEY).await? {
			Some(entry) => Ok(serde_json::from_slice::<Settings>(&entry.value)?.or_defaults()),
			None => Ok(Settings::with_defaults()),
		}
	}

	async fn update_settings(&self, settings: Settings) -> Result<()> {
		self
			.client
			.put(keys::SETTINGS_KEY, serde_json::to_vec(&settings)?)
			.await
	}

	async fn ping(&self) -> Result<()> {
		self.client.ping().await
	}

	fn spawn_watch(
		&self,
		prefixes: Vec<String>,
		shutdown: watch::Receiver<bool>,
		on_change: ChangeCallback,
	) {
		for prefix in prefixes {
			let client = Arc::clone(&self.client);
			let on_change = Arc::clone(&on_change);
			let mut shutdown = shutdown.clone();
			tokio::spawn(async move {
				let mut index = 0u64;
				loop {
					tokio::select! {
						_ = shutdown.changed() => {
							if *shutdown.borrow() {
								return;
							}
						}
						moved = client.wait_prefix(&prefix, index) => {
							match moved {
								Ok(next) => {
									if index != 0 && next != index {
										on_change();
									}
									index = next;
								}
								Err(err) => {
									debug!(%prefix, error = %err, "prefix watch failed; backing off");
									tokio::time::sleep(Duration::from_secs(1)).await;
								}
							}
						}
					}
				}
			});
		}
	}

	fn spawn_leader_guard(
		&self,
		key: String,
		ttl: Duration,
		shutdown: watch::Receiver<bool>,
		events: mpsc::Sender<LeaderEvent>,
	) {
		let client = Arc::clone(&self.client);
		let mut shutdown = shutdown.clone();
		tokio::spawn(async move {
			'outer: loop {
				if *shutdown.borrow() {
					return;
				}
				let session = match client.create_session(ttl).await {
					Ok(session) => session,
					Err(err) => {
						warn!(error = %err, "leader session create failed; retrying");
						tokio::time::sleep(ttl).await;
						continue;
					}
				};
				// Contend for the lock until acquired or shut down.
				loop {
					match client.acquire(&key, &session).await {
						Ok(true) => break,
						Ok(false) => {
							tokio::select! {
								_ = shutdown.changed() => {
									if *shutdown.borrow() {
										let _ = client.destroy_session(&session).await;
										return;
									}
								}
								_ = tokio::time::sleep(ttl) => {}
							}
						}
						Err(err) => {
							warn!(error = %err, "leader acquire failed; retrying");
							tokio::time::sleep(ttl).await;
						}
					}
				}
				info!(%key, "leader lock acquired");
				if events.send(LeaderEvent::Acquired).await.is_err() {
					let _ = client.release(&key, &session).await;
					let _ = client.destroy_session(&session).await;
					return;
				}
				// Hold by renewing; loss of the session means loss of the lock.
				loop {
					tokio::select! {
						_ = shutdown.changed() => {
							if *shutdown.borrow() {
								let _ = client.release(&key, &session).await;
								let _ = client.destroy_session(&session).await;
								return;
							}
						}
						_ = tokio::time::sleep(ttl / 2) => {
							if let Err(err) = client.renew_session(&session).await {
								warn!(error = %err, "leader session renew failed; stepping down");
								let _ = events.send(LeaderEvent::Lost).await;
								let _ = client.destroy_session(&session).await;
								continue 'outer;
							}
						}
					}
				}
			}
		});
	}
}
