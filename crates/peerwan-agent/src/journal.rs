// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! SQLite journal of policy operations. Telemetry only: nothing reads it to
//! make decisions, it exists so an operator can reconstruct what the
//! reconciler did and when.

use crate::error::Result;
use peerwan_model::PolicyRule;
use rusqlite::Connection;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Mutex;
use tracing::warn;

pub const DEFAULT_JOURNAL_PATH: &str = "/var/lib/peer-wan/state.db";

pub struct PolicyJournal {
	conn: Mutex<Connection>,
}

impl PolicyJournal {
	pub fn open(path: &Path) -> Result<Self> {
		if let Some(parent) = path.parent() {
			let _ = std::fs::create_dir_all(parent);
		}
		let conn = Connection::open(path)?;
		conn.busy_timeout(std::time::Duration::from_secs(5))?;
		conn.execute_batch(
			"CREATE TABLE IF NOT EXISTS policy_ops(rule_hash TEXT, op TEXT, detail TEXT, ts INTEGER);
			 CREATE INDEX IF NOT EXISTS idx_policy_ops_rule ON policy_ops(rule_hash);",
		)?;
		Ok(Self {
			conn: Mutex::new(conn),
		})
	}

	/// Best-effort append; journal trouble never blocks reconciliation.
	pub fn record(&self, rule_hash: &str, op: &str, detail: &str) {
		let conn = self.conn.lock().unwrap();
		if let Err(err) = conn.execute(
			"INSERT INTO policy_ops(rule_hash, op, detail, ts) VALUES(?1, ?2, ?3, ?4)",
			(rule_hash, op, detail, chrono::Utc::now().timestamp()),
		) {
			warn!(error = %err, "policy journal write failed");
		}
	}

	/// Drop records for rules no longer present, leaving a purge marker.
	pub fn purge_missing(&self, current: &HashSet<String>) {
		let stale: Vec<String> = {
			let conn = self.conn.lock().unwrap();
			let mut stmt = match conn
				.prepare("SELECT rule_hash FROM policy_ops GROUP BY rule_hash")
			{
				Ok(stmt) => stmt,
				Err(err) => {
					warn!(error = %err, "policy journal query failed");
					return;
				}
			};
			let rows = stmt.query_map([], |row| row.get::<_, String>(0));
			match rows {
				Ok(rows) => rows
					.flatten()
					.filter(|hash| !current.contains(hash))
					.collect(),
				Err(err) => {
					warn!(error = %err, "policy journal scan failed");
					return;
				}
			}
		};
		for hash in stale {
			{
				let conn = self.conn.lock().unwrap();
				if let Err(err) =
					conn.execute("DELETE FROM policy_ops WHERE rule_hash = ?1", [&hash])
				{
					warn!(error = %err, "policy journal purge failed");
					continue;
				}
			}
			self.record(&hash, "purge", "rule removed; records purged");
		}
	}

	#[cfg(test)]
	fn ops_for(&self, rule_hash: &str) -> Vec<(String, String)> {
		let conn = self.conn.lock().unwrap();
		let mut stmt = conn
			.prepare("SELECT op, detail FROM policy_ops WHERE rule_hash = ?1 ORDER BY ts")
			.unwrap();
		stmt.query_map([rule_hash], |row| Ok((row.get(0)?, row.get(1)?)))
			.unwrap()
			.flatten()
			.collect()
	}
}

/// Stable content hash of a rule, used as the journal key.
pub fn hash_rule(rule: &PolicyRule) -> String {
	let body = serde_json::to_vec(rule).unwrap_or_default();
	let digest = Sha256::digest(&body);
	digest.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
	use super::*;

	fn rule(prefix: &str) -> PolicyRule {
		PolicyRule {
			prefix: prefix.to_string(),
			via_node: "edge-2".to_string(),
			..Default::default()
		}
	}

	#[test]
	fn hash_is_stable_and_content_sensitive() {
		let a = hash_rule(&rule("192.0.2.0/24"));
		assert_eq!(a, hash_rule(&rule("192.0.2.0/24")));
		assert_ne!(a, hash_rule(&rule("198.51.100.0/24")));
		assert_eq!(a.len(), 64);
	}

	#[test]
	fn record_and_purge_lifecycle() {
		let dir = tempfile::tempdir().unwrap();
		let journal = PolicyJournal::open(&dir.path().join("state.db")).unwrap();
		let keep = hash_rule(&rule("192.0.2.0/24"));
		let drop = hash_rule(&rule("198.51.100.0/24"));
		journal.record(&keep, "apply_route", "192.0.2.0/24 via 10.10.2.1");
		journal.record(&drop, "apply_route", "198.51.100.0/24 via 10.10.2.1");

		let mut current = HashSet::new();
		current.insert(keep.clone());
		journal.purge_missing(&current);

		assert_eq!(journal.ops_for(&keep).len(), 1);
		let dropped = journal.ops_for(&drop);
		assert_eq!(dropped.len(), 1);
		assert_eq!(dropped[0].0, "purge");
	}

	#[test]
	fn reopen_preserves_rows() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("state.db");
		let hash = hash_rule(&rule("192.0.2.0/24"));
		{
			let journal = PolicyJournal::open(&path).unwrap();
			journal.record(&hash, "apply_rule", "test");
		}
		let journal = PolicyJournal::open(&path).unwrap();
		assert_eq!(journal.ops_for(&hash).len(), 1);
	}
}
