// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Persistence for the control plane.
//!
//! [`Store`] is the single interface the controller talks to: node records,
//! versioned plans with history, health snapshots, policy status channels,
//! tasks, audit and global settings. Two implementations ship here — the
//! in-process [`MemoryStore`] for single-controller deployments and
//! [`KvStore`], which layers the same contract over any replicated KV backend
//! implementing [`KvClient`] (compare-and-set, blocking prefix reads,
//! TTL-session locks). Cross-process coordination lives entirely inside the
//! backend; callers only ever see [`StoreError::Conflict`].

mod consul;
mod kv;
mod memory;

pub use consul::ConsulKv;
pub use kv::{KvClient, KvEntry, KvStore};
pub use memory::MemoryStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use peerwan_model::{
	AuditEntry, HealthReport, Node, Plan, PolicyDiagReport, PolicyInstallLog, PolicyRule,
	Settings, Task,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
	#[error("not found: {0}")]
	NotFound(String),

	/// Compare-and-set miss on a plan write; the caller re-reads and retries.
	#[error("plan version conflict for node {0}")]
	Conflict(String),

	#[error("store backend unavailable: {0}")]
	Backend(String),

	#[error("corrupt record: {0}")]
	Corrupt(#[from] serde_json::Error),
}

impl From<reqwest::Error> for StoreError {
	fn from(err: reqwest::Error) -> Self {
		StoreError::Backend(err.to_string())
	}
}

/// Policy fields applied to a node in one write.
#[derive(Debug, Clone, Default)]
pub struct PolicyUpdate {
	pub egress_peer_id: String,
	pub rules: Vec<PolicyRule>,
	pub default_route: bool,
	pub bypass_cidrs: Vec<String>,
	pub default_route_next_hop: String,
}

/// Leadership transitions emitted by [`Store::spawn_leader_guard`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaderEvent {
	Acquired,
	Lost,
}

/// Callback fired by the prefix watcher; bridge into async via a channel.
pub type ChangeCallback = Arc<dyn Fn() + Send + Sync>;

/// Uniform persistence contract for the controller.
///
/// Bounds: plan history keeps the last 20 entries per node, policy status the
/// last 50, diag reports the last 20; health history is pruned past 24 hours
/// by the periodic sweeper calling [`Store::prune_health_before`].
#[async_trait]
pub trait Store: Send + Sync {
	async fn upsert_node(&self, node: Node) -> Result<Node>;
	async fn get_node(&self, id: &str) -> Result<Option<Node>>;
	async fn list_nodes(&self) -> Result<Vec<Node>>;

	/// Persist a plan as latest and append it to the node's history. The
	/// replicated backend performs a compare-and-set against the previously
	/// read version index and reports a miss as [`StoreError::Conflict`].
	async fn save_plan(&self, plan: Plan) -> Result<()>;
	async fn get_plan(&self, node_id: &str) -> Result<Option<Plan>>;
	async fn list_plan_history(&self, node_id: &str, limit: usize) -> Result<Vec<Plan>>;
	/// Copy a history entry back over latest and reset the global version.
	async fn rollback_plan(&self, node_id: &str, version: i64) -> Result<Plan>;

	async fn set_global_plan_version(&self, version: i64) -> Result<()>;
	async fn get_global_plan_version(&self) -> Result<i64>;

	async fn update_policy(&self, node_id: &str, update: PolicyUpdate) -> Result<()>;

	async fn save_health(&self, report: HealthReport) -> Result<()>;
	async fn list_health(&self) -> Result<Vec<HealthReport>>;
	async fn list_health_history(
		&self,
		node_id: &str,
		since: DateTime<Utc>,
	) -> Result<Vec<HealthReport>>;
	async fn prune_health_before(&self, cutoff: DateTime<Utc>) -> Result<()>;

	async fn save_policy_status(&self, log: PolicyInstallLog) -> Result<()>;
	async fn list_policy_status(
		&self,
		node_id: &str,
		limit: usize,
	) -> Result<Vec<PolicyInstallLog>>;

	async fn save_policy_diag(&self, report: PolicyDiagReport) -> Result<()>;
	async fn list_policy_diag(&self, node_id: &str, limit: usize)
		-> Result<Vec<PolicyDiagReport>>;

	async fn save_task(&self, task: Task) -> Result<()>;
	async fn get_task(&self, id: &str) -> Result<Option<Task>>;
	async fn list_tasks(&self, node_id: &str, limit: usize) -> Result<Vec<Task>>;

	async fn append_audit(&self, entry: AuditEntry) -> Result<()>;
	async fn list_audit(&self, limit: usize) -> Result<Vec<AuditEntry>>;

	async fn get_settings(&self) -> Result<Settings>;
	async fn update_settings(&self, settings: Settings) -> Result<()>;

	/// Backend reachability, surfaced on the info endpoint.
	async fn ping(&self) -> Result<()>;

	/// Fire `on_change` on any key mutation under the given prefixes. The
	/// in-memory backend has no cross-process writers and spawns nothing.
	fn spawn_watch(
		&self,
		_prefixes: Vec<String>,
		_shutdown: watch::Receiver<bool>,
		_on_change: ChangeCallback,
	) {
	}

	/// Acquire the named lock with a TTL and report transitions on `events`.
	/// The in-memory backend is always the leader: it emits `Acquired` once.
	fn spawn_leader_guard(
		&self,
		_key: String,
		_ttl: Duration,
		_shutdown: watch::Receiver<bool>,
		events: mpsc::Sender<LeaderEvent>,
	) {
		let _ = events.try_send(LeaderEvent::Acquired);
	}
}

/// Key layout of the replicated backend.
pub mod keys {
	pub const NODE_PREFIX: &str = "peer-wan/nodes/";
	pub const HEALTH_PREFIX: &str = "peer-wan/health/";
	pub const HEALTH_HISTORY_PREFIX: &str = "peer-wan/health-history/";
	pub const POLICY_STATUS_PREFIX: &str = "peer-wan/policy-status/";
	pub const POLICY_DIAG_PREFIX: &str = "peer-wan/policy-diag/";
	pub const TASK_PREFIX: &str = "peer-wan/tasks/";
	pub const AUDIT_PREFIX: &str = "peer-wan/audit/";
	pub const PLAN_PREFIX: &str = "peer-wan/plan/";
	pub const VERSION_KEY: &str = "peer-wan/plan/version";
	pub const SETTINGS_KEY: &str = "peer-wan/settings";
	pub const DEFAULT_LEADER_LOCK: &str = "peer-wan/locks/leader";
}

pub const PLAN_HISTORY_LIMIT: usize = 20;
pub const POLICY_STATUS_LIMIT: usize = 50;
pub const POLICY_DIAG_LIMIT: usize = 20;
pub const AUDIT_RING_LIMIT: usize = 512;
