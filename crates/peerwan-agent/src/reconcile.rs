// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! The reconciler: turn a plan into rendered configs and kernel state.
//!
//! Rendering expands policy rules, augments each next-hop peer's allowed-IP
//! set with its rule prefixes (plus `0.0.0.0/0` on the egress when the
//! default route is on), writes the tunnel and routing-daemon configs, and
//! installs static routes. Applying brings the interface up (or syncs peers
//! in place to avoid flaps), keeps NAT present and reloads the routing
//! daemon. Re-running against the same plan is a no-op by construction:
//! every kernel operation is a replace.

use crate::commands::{command_line, CommandRunner};
use crate::error::{AgentError, Result};
use crate::journal::PolicyJournal;
use crate::nat::NatManager;
use crate::render::{overlay_for_peer, render_bgp, render_wireguard};
use crate::routes::{ExpandedRule, RouteInstaller};
use peerwan_model::{GeoIpConfig, Node, Peer};
use peerwan_policy::Expander;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, instrument};

pub const DEFAULT_LISTEN_PORT: u16 = 51820;

pub struct Reconciler {
	runner: Arc<dyn CommandRunner>,
	routes: RouteInstaller,
	nat: NatManager,
	out_dir: PathBuf,
	iface: String,
	apply: bool,
}

impl Reconciler {
	pub fn new(
		runner: Arc<dyn CommandRunner>,
		journal: Arc<PolicyJournal>,
		out_dir: PathBuf,
		iface: &str,
		apply: bool,
		nat_state_path: PathBuf,
	) -> Self {
		let iface = if iface.is_empty() { "wg0" } else { iface };
		Self {
			routes: RouteInstaller::new(Arc::clone(&runner), journal, iface),
			nat: NatManager::new(Arc::clone(&runner), nat_state_path),
			runner,
			out_dir,
			iface: iface.to_string(),
			apply,
		}
	}

	pub fn config_paths(&self) -> (PathBuf, PathBuf) {
		(
			self.out_dir.join(format!("{}.conf", self.iface)),
			self.out_dir.join("bgpd.conf"),
		)
	}

	/// Render configs, install routes, and (when applying) drive the
	/// external tools. Returns the written config paths.
	#[instrument(skip(self, node, peers, private_key), fields(node_id = %node.id))]
	pub async fn reconcile(
		&self,
		node: &Node,
		peers: &[Peer],
		private_key: &str,
		geoip: Option<GeoIpConfig>,
	) -> Result<(PathBuf, PathBuf)> {
		let mut node = node.clone();
		if node.listen_port == 0 {
			node.listen_port = DEFAULT_LISTEN_PORT;
		}

		let expanded = expand_rules(&node, geoip).await;
		let augmented = augment_allowed_ips(peers, &node, &expanded);

		let wg_text = render_wireguard(&node, &augmented, private_key);
		let neighbors: Vec<String> = peers
			.iter()
			.filter_map(|p| p.overlay_ip().map(str::to_string))
			.collect();
		let router_id = if node.router_id.is_empty() {
			node.overlay_host().to_string()
		} else {
			node.router_id.clone()
		};
		let default_next_hop = if node.egress_peer_id.is_empty() {
			None
		} else {
			overlay_for_peer(&node.egress_peer_id, peers).map(str::to_string)
		};
		let mut static_routes = Vec::new();
		for item in &expanded {
			let Some(next_hop) = overlay_for_peer(item.rule.next_hop(), peers) else {
				continue;
			};
			for prefix in &item.prefixes {
				static_routes.push((prefix.clone(), next_hop.to_string()));
			}
		}
		let bgp_text = render_bgp(
			node.asn,
			&router_id,
			&self.iface,
			&neighbors,
			&node.cidrs,
			default_next_hop.as_deref(),
			&static_routes,
		);

		std::fs::create_dir_all(&self.out_dir).map_err(|source| AgentError::WriteConfig {
			path: self.out_dir.clone(),
			source,
		})?;
		let (wg_path, bgp_path) = self.config_paths();
		write_file(&wg_path, &wg_text, true)?;
		write_file(&bgp_path, &bgp_text, false)?;
		info!(wg = %wg_path.display(), bgp = %bgp_path.display(), "configs rendered");

		let primary = self.routes.apply(&node, &augmented, &expanded).await;

		if self.apply {
			self
				.apply_configs(&wg_path, &bgp_path, primary.map(|(_, dev)| dev))
				.await?;
		}
		Ok((wg_path, bgp_path))
	}

	/// Bring the tunnel up, or sync peers in place when it already exists so
	/// live sessions don't flap; then NAT and the routing daemon reload.
	pub async fn apply_configs(
		&self,
		wg_path: &Path,
		bgp_path: &Path,
		primary_egress: Option<String>,
	) -> Result<()> {
		let wg = wg_path.to_string_lossy().to_string();
		if self.iface_exists().await {
			let stripped = self.run_ok("wg-quick", &["strip", wg.as_str()]).await?;
			let output = self
				.runner
				.run_with_stdin(
					"wg",
					&["syncconf", self.iface.as_str(), "/dev/stdin"],
					stripped.as_bytes(),
				)
				.await
				.map_err(|err| AgentError::Command {
					command: format!("wg syncconf {}", self.iface),
					detail: err.to_string(),
				})?;
			if !output.success() {
				return Err(AgentError::Command {
					command: format!("wg syncconf {}", self.iface),
					detail: output.combined(),
				});
			}
			info!(iface = %self.iface, "tunnel peers synced in place");
		} else {
			self.run_ok("wg-quick", &["up", wg.as_str()]).await?;
			info!(iface = %self.iface, "tunnel brought up");
		}

		if let Err(err) = self.nat.ensure(&self.iface, primary_egress.as_deref()).await {
			tracing::warn!(error = %err, "NAT upkeep failed");
		}

		let bgp = bgp_path.to_string_lossy().to_string();
		self.run_ok("vtysh", &["-b", "-f", bgp.as_str()]).await?;
		Ok(())
	}

	async fn iface_exists(&self) -> bool {
		matches!(
			self.runner.run("ip", &["link", "show", "dev", self.iface.as_str()]).await,
			Ok(output) if output.success()
		)
	}

	async fn run_ok(&self, program: &str, args: &[&str]) -> Result<String> {
		let output = self
			.runner
			.run(program, args)
			.await
			.map_err(|err| AgentError::Command {
				command: command_line(program, args),
				detail: err.to_string(),
			})?;
		if !output.success() {
			return Err(AgentError::Command {
				command: command_line(program, args),
				detail: output.combined(),
			});
		}
		Ok(output.stdout)
	}
}

/// Expand every rule of the node once; expansion is best-effort and shared
/// by the renderer, the route installer and verification.
pub async fn expand_rules(node: &Node, geoip: Option<GeoIpConfig>) -> Vec<ExpandedRule> {
	let expander = Expander::new(geoip.unwrap_or_default());
	let mut out = Vec::with_capacity(node.policy_rules.len());
	for rule in &node.policy_rules {
		let prefixes = expander.expand(rule).await;
		out.push(ExpandedRule {
			rule: rule.clone(),
			prefixes,
		});
	}
	out
}

/// Attach each rule's prefixes to the allowed-IP set of its next-hop peer so
/// the tunnel actually forwards those flows, and `0.0.0.0/0` to the egress
/// peer when the default route is enabled. Only named next hops receive
/// prefixes.
pub fn augment_allowed_ips(
	peers: &[Peer],
	node: &Node,
	expanded: &[ExpandedRule],
) -> Vec<Peer> {
	let mut targets: HashMap<&str, Vec<String>> = HashMap::new();
	for item in expanded {
		if item.prefixes.is_empty() {
			continue;
		}
		let target = item.rule.next_hop();
		if target.is_empty() || target == "local" || target == "main" {
			continue;
		}
		targets
			.entry(target)
			.or_default()
			.extend(item.prefixes.iter().cloned());
	}
	if node.default_route && !node.egress_peer_id.is_empty() {
		targets
			.entry(node.egress_peer_id.as_str())
			.or_default()
			.push("0.0.0.0/0".to_string());
	}

	let mut out = peers.to_vec();
	for peer in &mut out {
		let Some(wanted) = targets.get(peer.id.as_str()) else {
			continue;
		};
		for prefix in wanted {
			if !peer.allowed_ips.contains(prefix) {
				peer.allowed_ips.push(prefix.clone());
			}
		}
	}
	out
}

fn write_file(path: &Path, content: &str, private: bool) -> Result<()> {
	std::fs::write(path, content).map_err(|source| AgentError::WriteConfig {
		path: path.to_path_buf(),
		source,
	})?;
	#[cfg(unix)]
	if private {
		use std::os::unix::fs::PermissionsExt;
		let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600));
	}
	#[cfg(not(unix))]
	let _ = private;
	Ok(())
}
