// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Periodic peer probing: ping each peer's overlay address, read the routing
//! daemon's neighbor table, and post the structured report.

use crate::client::ControllerClient;
use crate::commands::CommandRunner;
use peerwan_model::{node::host_of, HealthReport, HealthStatus, Peer};
use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

const PING_FALLBACK_PORT: u16 = 80;

fn loss_regex() -> &'static Regex {
	static RE: OnceLock<Regex> = OnceLock::new();
	RE.get_or_init(|| Regex::new(r"([0-9.]+)% packet loss").expect("loss regex"))
}

fn rtt_regex() -> &'static Regex {
	static RE: OnceLock<Regex> = OnceLock::new();
	RE.get_or_init(|| Regex::new(r"= ([0-9.]+)/").expect("rtt regex"))
}

pub fn parse_ping_loss(output: &str) -> f64 {
	loss_regex()
		.captures(output)
		.and_then(|caps| caps.get(1))
		.and_then(|m| m.as_str().parse().ok())
		.unwrap_or(0.0)
}

pub fn parse_ping_latency(output: &str) -> f64 {
	rtt_regex()
		.captures(output)
		.and_then(|caps| caps.get(1))
		.and_then(|m| m.as_str().parse().ok())
		.unwrap_or(0.0)
}

/// Neighbor -> session state from `show bgp summary json`, falling back to
/// the tabular form when the daemon predates JSON output.
pub async fn read_bgp_neighbors(runner: &Arc<dyn CommandRunner>) -> HashMap<String, String> {
	if let Ok(out) = runner
		.run("vtysh", &["-c", "show bgp summary json"])
		.await
	{
		if out.success() {
			let parsed = parse_bgp_summary_json(&out.stdout);
			if !parsed.is_empty() {
				return parsed;
			}
		}
	}
	if let Ok(out) = runner.run("vtysh", &["-c", "show bgp summary"]).await {
		if out.success() {
			return parse_bgp_summary_table(&out.stdout);
		}
	}
	HashMap::new()
}

pub fn parse_bgp_summary_json(body: &str) -> HashMap<String, String> {
	let mut out = HashMap::new();
	let Ok(value) = serde_json::from_str::<serde_json::Value>(body) else {
		return out;
	};
	// Either the address-family wrapper or a bare neighbors object.
	let neighbor_maps = value
		.as_object()
		.map(|root| {
			root
				.values()
				.filter_map(|family| family.get("peers").and_then(|p| p.as_object()))
				.chain(root.get("neighbors").and_then(|n| n.as_object()))
				.collect::<Vec<_>>()
		})
		.unwrap_or_default();
	for neighbors in neighbor_maps {
		for (address, details) in neighbors {
			if let Some(state) = details.get("state").and_then(|s| s.as_str()) {
				out.insert(address.clone(), state.to_string());
			}
		}
	}
	out
}

pub fn parse_bgp_summary_table(body: &str) -> HashMap<String, String> {
	let mut out = HashMap::new();
	for line in body.lines() {
		let fields: Vec<&str> = line.split_whitespace().collect();
		if fields.len() < 6 {
			continue;
		}
		if fields[0].parse::<std::net::IpAddr>().is_err() {
			continue;
		}
		if let Some(state) = fields.last() {
			out.insert(fields[0].to_string(), state.to_string());
		}
	}
	out
}

pub struct HealthReporter {
	client: ControllerClient,
	runner: Arc<dyn CommandRunner>,
	node_id: String,
}

impl HealthReporter {
	pub fn new(client: ControllerClient, runner: Arc<dyn CommandRunner>, node_id: &str) -> Self {
		Self {
			client,
			runner,
			node_id: node_id.to_string(),
		}
	}

	/// Probe peers and post one report. Probe failures just leave gaps.
	pub async fn report_once(&self, peers: &[Peer]) {
		let mut latency = HashMap::new();
		let mut loss = HashMap::new();
		for peer in peers {
			let Some(overlay) = peer.overlay_ip() else {
				continue;
			};
			let target = host_of(overlay).to_string();
			match self.probe(&target).await {
				Some((ms, pct)) => {
					latency.insert(target.clone(), ms as u32);
					loss.insert(target, pct);
				}
				None => debug!(target = %target, "peer probe failed"),
			}
		}
		let report = HealthReport {
			node_id: self.node_id.clone(),
			status: HealthStatus::Up,
			latency_ms: latency,
			packet_loss: loss,
			bgp_state: read_bgp_neighbors(&self.runner).await,
			timestamp: chrono::Utc::now(),
		};
		if let Err(err) = self.client.post_health(&report).await {
			warn!(error = %err, "health report failed");
		}
	}

	/// ICMP via the system ping; TCP connect as a fallback where ping is
	/// unavailable or unprivileged.
	async fn probe(&self, target: &str) -> Option<(f64, f64)> {
		if let Ok(out) = self
			.runner
			.run("ping", &["-c", "3", "-W", "1", target])
			.await
		{
			if out.success() {
				return Some((parse_ping_latency(&out.stdout), parse_ping_loss(&out.stdout)));
			}
		}
		let started = std::time::Instant::now();
		match tokio::time::timeout(
			Duration::from_secs(1),
			tokio::net::TcpStream::connect((target, PING_FALLBACK_PORT)),
		)
		.await
		{
			Ok(Ok(_)) => Some((started.elapsed().as_millis() as f64, 0.0)),
			_ => None,
		}
	}

	/// Probe/report loop; the peer set tracks the currently applied plan.
	pub async fn run(
		self,
		interval: Duration,
		peers: watch::Receiver<Vec<Peer>>,
		mut shutdown: watch::Receiver<bool>,
	) {
		let mut ticker = tokio::time::interval(interval);
		ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
		loop {
			tokio::select! {
				_ = shutdown.changed() => {
					if *shutdown.borrow() {
						return;
					}
				}
				_ = ticker.tick() => {
					let current = peers.borrow().clone();
					self.report_once(&current).await;
				}
			}
		}
	}
}
