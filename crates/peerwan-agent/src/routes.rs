// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Kernel route installation for policy rules and the default route.
//!
//! Policy prefixes land in the main table and the dedicated policy table
//! (100) with a guaranteed link-scope next-hop route. `via = local|main`
//! rules instead pin the prefix to the primary underlay gateway. Peer
//! allowed prefixes are mirrored into table 52 so lookups that land there
//! still resolve. Everything is best-effort: failures log and the
//! reconciler carries on to the next tick.

use crate::commands::{command_line, CommandRunner};
use crate::journal::{hash_rule, PolicyJournal};
use crate::render::overlay_for_peer;
use peerwan_model::{node::host_of, Node, Peer, PolicyRule};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const POLICY_TABLE: &str = "100";
pub const PEER_TABLE: &str = "52";
const BYPASS_RULE_PRIORITY: &str = "100";
const POLICY_MAIN_PRIORITY: &str = "140";
const LOCAL_MAIN_PRIORITY: &str = "150";
const CATCHALL_PRIORITY: &str = "200";

/// A policy rule together with its expanded concrete prefixes.
#[derive(Debug, Clone)]
pub struct ExpandedRule {
	pub rule: PolicyRule,
	pub prefixes: Vec<String>,
}

pub struct RouteInstaller {
	runner: Arc<dyn CommandRunner>,
	journal: Arc<PolicyJournal>,
	iface: String,
}

impl RouteInstaller {
	pub fn new(runner: Arc<dyn CommandRunner>, journal: Arc<PolicyJournal>, iface: &str) -> Self {
		Self {
			runner,
			journal,
			iface: if iface.is_empty() {
				"wg0".to_string()
			} else {
				iface.to_string()
			},
		}
	}

	/// First default route not pointing at a tunnel device: `(gateway, dev)`.
	pub async fn detect_primary_route(&self) -> Option<(String, String)> {
		let output = self
			.runner
			.run("ip", &["route", "show", "default"])
			.await
			.ok()?;
		for line in output.stdout.lines() {
			let fields: Vec<&str> = line.split_whitespace().collect();
			if fields.first() != Some(&"default") {
				continue;
			}
			let mut gw = "";
			let mut dev = "";
			for pair in fields.windows(2) {
				match pair[0] {
					"via" => gw = pair[1],
					"dev" => dev = pair[1],
					_ => {}
				}
			}
			if dev.starts_with("wg") {
				continue;
			}
			if !gw.is_empty() && !dev.is_empty() {
				return Some((gw.to_string(), dev.to_string()));
			}
		}
		None
	}

	/// Install policy and default routes for the plan. Returns the primary
	/// underlay route so NAT can reuse the detection.
	pub async fn apply(
		&self,
		node: &Node,
		peers: &[Peer],
		expanded: &[ExpandedRule],
	) -> Option<(String, String)> {
		let primary = self.detect_primary_route().await;
		match &primary {
			Some((gw, dev)) => debug!(gw = %gw, dev = %dev, "primary route detected"),
			None => warn!("primary route not detected; local bypass may still hit the tunnel"),
		}

		self.sync_peer_routes(peers).await;

		let mut live_hashes: HashSet<String> = HashSet::new();

		if node.default_route {
			self.install_default_route(node, peers).await;
		}

		for item in expanded {
			if !item.rule.is_valid() {
				continue;
			}
			let rule_hash = hash_rule(&item.rule);
			live_hashes.insert(rule_hash.clone());
			let via = &item.rule.via_node;
			if via == "local" || via == "main" {
				self
					.install_local_bypass(&item.prefixes, &rule_hash, primary.as_ref())
					.await;
				continue;
			}
			let next_hop = item.rule.next_hop();
			let Some(next_hop_overlay) = overlay_for_peer(next_hop, peers) else {
				debug!(rule = %item.rule.prefix, next_hop, "next hop has no overlay address; skipping");
				continue;
			};
			let next_hop_ip = host_of(next_hop_overlay).to_string();
			info!(
				prefix = %item.rule.prefix,
				domains = ?item.rule.domains,
				via = %via,
				next_hop = %next_hop_ip,
				targets = item.prefixes.len(),
				"applying policy rule"
			);
			for prefix in &item.prefixes {
				if self.install_policy_route(prefix, &next_hop_ip).await {
					self
						.journal
						.record(&rule_hash, "apply_route", &format!("{prefix} via {next_hop_ip}"));
				}
			}
		}

		self.journal.purge_missing(&live_hashes);
		self.run_quiet("ip", &["route", "flush", "cache"]).await;
		primary
	}

	async fn install_default_route(&self, node: &Node, peers: &[Peer]) {
		let target = if node.default_route_next_hop.is_empty() {
			&node.egress_peer_id
		} else {
			&node.default_route_next_hop
		};
		let Some(next_hop_overlay) = overlay_for_peer(target, peers) else {
			warn!(target = %target, "default route target has no overlay address");
			return;
		};
		let next_hop = host_of(next_hop_overlay).to_string();
		self
			.run_quiet(
				"ip",
				&[
					"route", "replace", "default", "via", next_hop.as_str(), "dev", self.iface.as_str(), "table",
					POLICY_TABLE,
				],
			)
			.await;
		for bypass in &node.bypass_cidrs {
			self
				.run_quiet(
					"ip",
					&[
						"rule", "add", "from", bypass.as_str(), "lookup", "main", "priority",
						BYPASS_RULE_PRIORITY,
					],
				)
				.await;
		}
		self
			.run_quiet(
				"ip",
				&["rule", "add", "priority", CATCHALL_PRIORITY, "lookup", POLICY_TABLE],
			)
			.await;
		info!(next_hop = %next_hop, bypass = ?node.bypass_cidrs, "default route installed via policy table");
	}

	/// Route a prefix via the overlay next hop in main and the policy table,
	/// making sure the next hop itself has a link-scope route first.
	async fn install_policy_route(&self, prefix: &str, next_hop: &str) -> bool {
		let host_route = format!("{next_hop}/32");
		if let Err(detail) = self
			.run_checked(
				"ip",
				&["route", "replace", host_route.as_str(), "dev", self.iface.as_str(), "scope", "link"],
			)
			.await
		{
			warn!(next_hop, detail = %detail, "failed to ensure next-hop link route");
		}
		for table in [None, Some(POLICY_TABLE)] {
			let mut args = vec!["route", "replace", prefix, "via", next_hop, "dev", self.iface.as_str()];
			if let Some(table) = table {
				args.push("table");
				args.push(table);
			}
			if let Err(detail) = self.run_checked("ip", &args).await {
				warn!(prefix, next_hop, detail = %detail, "policy route install failed");
				return false;
			}
		}
		// Prefer main for this prefix ahead of broader catch-all rules.
		if let Err(detail) = self
			.run_checked(
				"ip",
				&[
					"rule", "add", "to", prefix, "lookup", "main", "priority",
					POLICY_MAIN_PRIORITY,
				],
			)
			.await
		{
			if !detail.contains("File exists") {
				warn!(prefix, detail = %detail, "policy main-table rule failed");
			}
		}
		true
	}

	/// `via = local|main`: keep the prefix on the underlay instead of the
	/// overlay, pinning it to the primary gateway when one was detected.
	async fn install_local_bypass(
		&self,
		prefixes: &[String],
		rule_hash: &str,
		primary: Option<&(String, String)>,
	) {
		for prefix in prefixes {
			if let Err(detail) = self
				.run_checked(
					"ip",
					&[
						"rule", "add", "to", prefix.as_str(), "lookup", "main", "priority",
						LOCAL_MAIN_PRIORITY,
					],
				)
				.await
			{
				if !detail.contains("File exists") {
					warn!(prefix = %prefix, detail = %detail, "local bypass rule failed");
				}
			}
			if let Some((gw, dev)) = primary {
				if let Err(detail) = self
					.run_checked(
						"ip",
						&[
							"route", "replace", prefix.as_str(), "via", gw.as_str(), "dev",
							dev.as_str(),
						],
					)
					.await
				{
					warn!(prefix = %prefix, detail = %detail, "local bypass pin failed");
				}
			}
			self
				.journal
				.record(rule_hash, "apply_rule", &format!("local main rule {prefix}"));
			info!(prefix = %prefix, "policy prefix kept on local routing");
		}
	}

	/// Mirror peer allowed prefixes into main and the peer table, pruning
	/// overlay leftovers from the peer table.
	async fn sync_peer_routes(&self, peers: &[Peer]) {
		let mut desired: HashSet<String> = HashSet::new();
		for peer in peers {
			for prefix in &peer.allowed_ips {
				if prefix.is_empty() || prefix == "0.0.0.0/0" {
					continue;
				}
				match prefix.parse::<ipnet::IpNet>() {
					Ok(ipnet::IpNet::V4(_)) => {
						desired.insert(prefix.clone());
					}
					_ => continue,
				}
			}
		}
		for table in [None, Some(PEER_TABLE)] {
			for prefix in &desired {
				let mut args = vec!["route", "replace", prefix.as_str(), "dev", self.iface.as_str()];
				if let Some(table) = table {
					args.push("table");
					args.push(table);
				}
				if let Err(detail) = self.run_checked("ip", &args).await {
					warn!(prefix = %prefix, detail = %detail, "peer route sync failed");
				}
			}
		}

		// Prune stale overlay entries; never touch non-overlay routes.
		let Ok(output) = self
			.runner
			.run("ip", &["route", "show", "table", PEER_TABLE, "dev", self.iface.as_str()])
			.await
		else {
			return;
		};
		for line in output.stdout.lines() {
			let Some(prefix) = line.split_whitespace().next() else {
				continue;
			};
			if desired.contains(prefix) || !prefix.starts_with("10.") {
				continue;
			}
			self
				.run_quiet(
					"ip",
					&["route", "del", prefix, "dev", self.iface.as_str(), "table", PEER_TABLE],
				)
				.await;
		}
	}

	async fn run_checked(&self, program: &str, args: &[&str]) -> Result<(), String> {
		match self.runner.run(program, args).await {
			Ok(output) if output.success() => Ok(()),
			Ok(output) => Err(format!(
				"{}: {}",
				command_line(program, args),
				output.combined()
			)),
			Err(err) => Err(format!("{}: {err}", command_line(program, args))),
		}
	}

	async fn run_quiet(&self, program: &str, args: &[&str]) {
		if let Err(detail) = self.run_checked(program, args).await {
			debug!(detail = %detail, "command ignored failure");
		}
	}
}
