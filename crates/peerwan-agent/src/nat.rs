// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Source-NAT upkeep: forwarding sysctl, FORWARD accept pair and the
//! MASQUERADE rule letting overlay traffic egress. Runs on every apply so
//! rules survive firewall restarts; the previously installed triple is kept
//! on disk and cleaned up when the configuration changes.

use crate::commands::CommandRunner;
use crate::error::{AgentError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const DEFAULT_OVERLAY_CIDR: &str = "10.10.0.0/16";
pub const DEFAULT_NAT_STATE_PATH: &str = "/var/lib/peer-wan/nat_state.json";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct NatState {
	iface: String,
	egress: String,
	cidr: String,
}

pub struct NatManager {
	runner: Arc<dyn CommandRunner>,
	state_path: PathBuf,
}

impl NatManager {
	pub fn new(runner: Arc<dyn CommandRunner>, state_path: PathBuf) -> Self {
		Self { runner, state_path }
	}

	/// Ensure forwarding and NAT for `iface`, resolving the egress device
	/// from the environment or the primary default route. Disabled with
	/// `AUTO_NAT=false`; silently skipped where iptables is unavailable.
	pub async fn ensure(&self, iface: &str, primary_egress: Option<&str>) -> Result<()> {
		if cfg!(target_os = "macos") {
			return Ok(());
		}
		if std::env::var("AUTO_NAT")
			.map(|v| v.eq_ignore_ascii_case("false"))
			.unwrap_or(false)
		{
			return Ok(());
		}
		let iface = if iface.is_empty() { "wg0" } else { iface };
		if !self.iptables_available().await {
			debug!("iptables not found, skipping NAT setup");
			return Ok(());
		}

		let cidr = std::env::var("WG_CIDR").unwrap_or_else(|_| DEFAULT_OVERLAY_CIDR.to_string());
		let egress = std::env::var("NAT_EGRESS_IF")
			.or_else(|_| std::env::var("WAN_IF"))
			.ok()
			.filter(|v| !v.is_empty())
			.or_else(|| primary_egress.map(str::to_string))
			.unwrap_or_else(|| iface.to_string());

		let previous = self.load_state();
		let desired = NatState {
			iface: iface.to_string(),
			egress: egress.clone(),
			cidr: cidr.clone(),
		};
		if !previous.iface.is_empty() && previous != desired {
			if let Err(err) = self.cleanup(&previous).await {
				warn!(error = %err, "cleanup of previous NAT rules failed");
			}
		}

		let _ = self
			.runner
			.run("sysctl", &["-w", "net.ipv4.ip_forward=1"])
			.await;

		self
			.ensure_rule(
				&["-C", "FORWARD", "-i", iface, "-o", egress.as_str(), "-j", "ACCEPT"],
				&["-A", "FORWARD", "-i", iface, "-o", egress.as_str(), "-j", "ACCEPT"],
			)
			.await?;
		self
			.ensure_rule(
				&[
					"-C", "FORWARD", "-i", egress.as_str(), "-o", iface, "-m", "state", "--state",
					"RELATED,ESTABLISHED", "-j", "ACCEPT",
				],
				&[
					"-A", "FORWARD", "-i", egress.as_str(), "-o", iface, "-m", "state", "--state",
					"RELATED,ESTABLISHED", "-j", "ACCEPT",
				],
			)
			.await?;
		self
			.ensure_rule(
				&[
					"-t", "nat", "-C", "POSTROUTING", "-s", cidr.as_str(), "-o", egress.as_str(),
					"-j", "MASQUERADE",
				],
				&[
					"-t", "nat", "-A", "POSTROUTING", "-s", cidr.as_str(), "-o", egress.as_str(),
					"-j", "MASQUERADE",
				],
			)
			.await?;

		self.save_state(&desired);
		info!(iface, egress = %egress, cidr = %cidr, "NAT ensured");
		Ok(())
	}

	async fn iptables_available(&self) -> bool {
		self.runner.run("iptables", &["--version"]).await.is_ok()
	}

	/// Check-then-add: the check's failure just means the rule is absent.
	async fn ensure_rule(&self, check: &[&str], add: &[&str]) -> Result<()> {
		if let Ok(output) = self.runner.run("iptables", check).await {
			if output.success() {
				return Ok(());
			}
		}
		let output = self
			.runner
			.run("iptables", add)
			.await
			.map_err(|err| AgentError::Command {
				command: crate::commands::command_line("iptables", add),
				detail: err.to_string(),
			})?;
		if !output.success() {
			return Err(AgentError::Command {
				command: crate::commands::command_line("iptables", add),
				detail: output.combined(),
			});
		}
		Ok(())
	}

	async fn cleanup(&self, state: &NatState) -> Result<()> {
		if state.iface.is_empty() || state.egress.is_empty() || state.cidr.is_empty() {
			return Ok(());
		}
		let deletions: [&[&str]; 3] = [
			&[
				"-t", "nat", "-D", "POSTROUTING", "-s", state.cidr.as_str(), "-o",
				state.egress.as_str(), "-j", "MASQUERADE",
			],
			&[
				"-D", "FORWARD", "-i", state.iface.as_str(), "-o", state.egress.as_str(), "-j",
				"ACCEPT",
			],
			&[
				"-D", "FORWARD", "-i", state.egress.as_str(), "-o", state.iface.as_str(), "-m",
				"state", "--state", "RELATED,ESTABLISHED", "-j", "ACCEPT",
			],
		];
		for args in deletions {
			let _ = self.runner.run("iptables", args).await;
		}
		Ok(())
	}

	fn load_state(&self) -> NatState {
		std::fs::read(&self.state_path)
			.ok()
			.and_then(|data| serde_json::from_slice(&data).ok())
			.unwrap_or_default()
	}

	fn save_state(&self, state: &NatState) {
		if let Some(parent) = self.state_path.parent() {
			let _ = std::fs::create_dir_all(parent);
		}
		match serde_json::to_vec(state) {
			Ok(data) => {
				if let Err(err) = std::fs::write(&self.state_path, data) {
					warn!(error = %err, "failed to persist NAT state");
				}
			}
			Err(err) => warn!(error = %err, "failed to encode NAT state"),
		}
	}
}

#[cfg(test)]
#[cfg(not(target_os = "macos"))]
mod tests {
	use super::*;
	use crate::commands::testing::RecordingRunner;
	use crate::commands::CommandOutput;

	fn manager(dir: &std::path::Path) -> (Arc<RecordingRunner>, NatManager) {
		let runner = Arc::new(RecordingRunner::default());
		let manager = NatManager::new(runner.clone(), dir.join("nat_state.json"));
		(runner, manager)
	}

	fn fail_checks(runner: &RecordingRunner, iface: &str, egress: &str, cidr: &str) {
		// -C probes report "absent" so the -A path runs.
		runner.respond_failure(
			&format!("iptables -C FORWARD -i {iface} -o {egress} -j ACCEPT"),
			"no rule",
		);
		runner.respond_failure(
			&format!("iptables -C FORWARD -i {egress} -o {iface} -m state --state RELATED,ESTABLISHED -j ACCEPT"),
			"no rule",
		);
		runner.respond_failure(
			&format!("iptables -t nat -C POSTROUTING -s {cidr} -o {egress} -j MASQUERADE"),
			"no rule",
		);
	}

	#[tokio::test]
	async fn installs_forwarding_and_masquerade() {
		let dir = tempfile::tempdir().unwrap();
		let (runner, manager) = manager(dir.path());
		fail_checks(&runner, "wg0", "eth0", DEFAULT_OVERLAY_CIDR);
		manager.ensure("wg0", Some("eth0")).await.unwrap();

		assert!(runner.ran("sysctl -w net.ipv4.ip_forward=1"));
		assert!(runner.ran("iptables -A FORWARD -i wg0 -o eth0 -j ACCEPT"));
		assert!(runner.ran("-A POSTROUTING -s 10.10.0.0/16 -o eth0 -j MASQUERADE"));

		let state: NatState =
			serde_json::from_slice(&std::fs::read(dir.path().join("nat_state.json")).unwrap())
				.unwrap();
		assert_eq!(state.egress, "eth0");
	}

	#[tokio::test]
	async fn present_rules_are_not_duplicated() {
		let dir = tempfile::tempdir().unwrap();
		let (runner, manager) = manager(dir.path());
		// All -C checks succeed (default scripted output is success).
		manager.ensure("wg0", Some("eth0")).await.unwrap();
		assert!(!runner.ran("iptables -A FORWARD"));
		assert!(!runner.ran("-A POSTROUTING"));
	}

	#[tokio::test]
	async fn egress_change_cleans_previous_rules() {
		let dir = tempfile::tempdir().unwrap();
		let (runner, manager) = manager(dir.path());
		fail_checks(&runner, "wg0", "eth0", DEFAULT_OVERLAY_CIDR);
		manager.ensure("wg0", Some("eth0")).await.unwrap();

		fail_checks(&runner, "wg0", "eth1", DEFAULT_OVERLAY_CIDR);
		manager.ensure("wg0", Some("eth1")).await.unwrap();
		assert!(runner.ran("-t nat -D POSTROUTING -s 10.10.0.0/16 -o eth0 -j MASQUERADE"));
		assert!(runner.ran("iptables -A FORWARD -i wg0 -o eth1 -j ACCEPT"));
	}

	#[tokio::test]
	async fn failed_add_surfaces_command_and_stderr() {
		let dir = tempfile::tempdir().unwrap();
		let (runner, manager) = manager(dir.path());
		fail_checks(&runner, "wg0", "eth0", DEFAULT_OVERLAY_CIDR);
		runner.respond(
			"iptables -A FORWARD -i wg0 -o eth0 -j ACCEPT",
			CommandOutput {
				status: 2,
				stdout: String::new(),
				stderr: "permission denied".to_string(),
			},
		);
		let err = manager.ensure("wg0", Some("eth0")).await.unwrap_err();
		let text = err.to_string();
		assert!(text.contains("iptables -A FORWARD"));
		assert!(text.contains("permission denied"));
	}
}
