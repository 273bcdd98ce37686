// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Local diagnostics: probe the pieces the reconciler owns (tunnel
//! interface, NAT rules, forwarding, policy tables, routing neighbors) and
//! verify reachability of policy targets with bounded IPv4 HTTP probes.

use crate::commands::CommandRunner;
use crate::error::{AgentError, Result};
use peerwan_model::{PolicyDiagCheck, PolicyDiagReport, PolicyRule};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

const VERIFY_TIMEOUT: Duration = Duration::from_secs(5);

fn check(name: &str, status: &str, detail: impl Into<String>) -> PolicyDiagCheck {
	PolicyDiagCheck {
		name: name.to_string(),
		status: status.to_string(),
		detail: detail.into(),
	}
}

/// One check per reconciler-owned concern; overall summary is the worst
/// severity observed.
pub async fn run_policy_diag(
	runner: &Arc<dyn CommandRunner>,
	iface: &str,
	node_id: &str,
) -> PolicyDiagReport {
	let iface = if iface.is_empty() { "wg0" } else { iface };
	let mut checks = Vec::new();

	match runner.run("ip", &["link", "show", "dev", iface]).await {
		Ok(out) if out.success() => {
			checks.push(check("tunnel interface", "ok", format!("{iface} present")));
		}
		Ok(out) => checks.push(check(
			"tunnel interface",
			"fail",
			format!("{iface} missing: {}", out.combined().trim()),
		)),
		Err(err) => checks.push(check("tunnel interface", "fail", err.to_string())),
	}

	match runner.run("ip", &["-br", "addr", "show", "dev", iface]).await {
		Ok(out) if out.success() => {
			checks.push(check("interface address", "info", out.stdout.trim()));
		}
		_ => checks.push(check("interface address", "info", "unavailable")),
	}

	match runner
		.run("iptables", &["-t", "nat", "-S", "POSTROUTING"])
		.await
	{
		Ok(out) if out.success() => {
			if out.stdout.contains("MASQUERADE") {
				checks.push(check("source nat", "ok", "MASQUERADE rule present"));
			} else {
				checks.push(check("source nat", "warn", "no MASQUERADE rule installed"));
			}
		}
		_ => checks.push(check("source nat", "info", "iptables unavailable")),
	}

	match runner.run("iptables", &["-S", "FORWARD"]).await {
		Ok(out) if out.success() => {
			let accepts = out
				.stdout
				.lines()
				.any(|line| line.contains(&format!("-i {iface}")) && line.contains("-j ACCEPT"));
			if accepts {
				checks.push(check("forward chain", "ok", "tunnel forward accept present"));
			} else {
				checks.push(check(
					"forward chain",
					"warn",
					format!("no ACCEPT rule for {iface} in FORWARD"),
				));
			}
		}
		_ => checks.push(check("forward chain", "info", "iptables unavailable")),
	}

	match runner.run("sysctl", &["-n", "net.ipv4.ip_forward"]).await {
		Ok(out) if out.success() => {
			let value = out.stdout.trim();
			if value == "1" {
				checks.push(check("ip forwarding", "ok", "net.ipv4.ip_forward=1"));
			} else {
				checks.push(check(
					"ip forwarding",
					"fail",
					format!("net.ipv4.ip_forward={value}"),
				));
			}
		}
		_ => checks.push(check("ip forwarding", "info", "sysctl unavailable")),
	}

	match runner
		.run("ip", &["route", "show", "table", crate::routes::POLICY_TABLE])
		.await
	{
		Ok(out) if out.success() && !out.stdout.trim().is_empty() => {
			checks.push(check(
				"policy table",
				"ok",
				format!("{} route(s) in table {}", out.stdout.lines().count(), crate::routes::POLICY_TABLE),
			));
		}
		Ok(_) => checks.push(check(
			"policy table",
			"warn",
			format!("table {} is empty", crate::routes::POLICY_TABLE),
		)),
		Err(err) => checks.push(check("policy table", "info", err.to_string())),
	}

	match crate::health::read_bgp_neighbors(runner).await {
		neighbors if neighbors.is_empty() => {
			checks.push(check("routing neighbors", "info", "no neighbor data"));
		}
		neighbors => {
			let bad: Vec<String> = neighbors
				.iter()
				.filter(|(_, state)| !state.eq_ignore_ascii_case("established"))
				.map(|(neighbor, state)| format!("{neighbor}={state}"))
				.collect();
			if bad.is_empty() {
				checks.push(check(
					"routing neighbors",
					"ok",
					format!("{} neighbor(s) established", neighbors.len()),
				));
			} else {
				checks.push(check(
					"routing neighbors",
					"warn",
					format!("not established: {}", bad.join("; ")),
				));
			}
		}
	}

	let mut report = PolicyDiagReport {
		node_id: node_id.to_string(),
		summary: String::new(),
		checks,
		timestamp: chrono::Utc::now(),
	};
	report.summary = report.worst_status().to_string();
	report
}

/// Distinct verify targets for a rule set: rule prefixes and domains as
/// written, plus expanded hosts.
pub fn collect_verify_targets(rules: &[PolicyRule], expanded: &[Vec<String>]) -> Vec<String> {
	let mut targets: Vec<String> = Vec::new();
	let mut add = |target: &str| {
		let target = target.split('/').next().unwrap_or(target).trim();
		if !target.is_empty() && !targets.iter().any(|t| t == target) {
			targets.push(target.to_string());
		}
	};
	for (idx, rule) in rules.iter().enumerate() {
		if !rule.prefix.is_empty() && !rule.prefix.to_ascii_lowercase().starts_with("geoip") {
			add(&rule.prefix);
		}
		for domain in &rule.domains {
			add(domain);
		}
		if let Some(prefixes) = expanded.get(idx) {
			for prefix in prefixes {
				add(prefix);
			}
		}
	}
	targets
}

/// Bounded IPv4 GET per target; the first failure fails the batch with the
/// offending target's error text.
pub async fn run_verify(targets: &[String]) -> Result<()> {
	let client = reqwest::Client::builder()
		.timeout(VERIFY_TIMEOUT)
		.local_address(Some(IpAddr::V4(Ipv4Addr::UNSPECIFIED)))
		.user_agent(peerwan_common_http::user_agent())
		.build()?;
	for target in targets {
		let url = if target.contains("://") {
			target.clone()
		} else {
			format!("http://{target}")
		};
		let result = client.get(&url).send().await;
		match result {
			Ok(resp) if resp.status().is_success() => {}
			Ok(resp) => {
				return Err(AgentError::Verify {
					target: target.clone(),
					detail: format!("status {}", resp.status()),
				});
			}
			Err(err) => {
				return Err(AgentError::Verify {
					target: target.clone(),
					detail: err.to_string(),
				});
			}
		}
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::commands::testing::RecordingRunner;
	use crate::commands::CommandRunner;

	fn runner() -> Arc<dyn CommandRunner> {
		Arc::new(RecordingRunner::default())
	}

	fn scripted() -> Arc<RecordingRunner> {
		Arc::new(RecordingRunner::default())
	}

	#[tokio::test]
	async fn healthy_host_reports_ok_overall() {
		let rec = scripted();
		rec.respond_stdout("ip -br addr show dev wg0", "wg0 UNKNOWN 10.10.1.1/32");
		rec.respond_stdout(
			"iptables -t nat -S POSTROUTING",
			"-A POSTROUTING -s 10.10.0.0/16 -o eth0 -j MASQUERADE",
		);
		rec.respond_stdout("iptables -S FORWARD", "-A FORWARD -i wg0 -o eth0 -j ACCEPT");
		rec.respond_stdout("sysctl -n net.ipv4.ip_forward", "1\n");
		rec.respond_stdout("ip route show table 100", "192.0.2.0/24 via 10.10.2.1 dev wg0");
		rec.respond_stdout(
			"vtysh -c show bgp summary json",
			r#"{"ipv4Unicast":{"peers":{"10.10.2.1":{"state":"Established"}}}}"#,
		);
		let runner: Arc<dyn CommandRunner> = rec;
		let report = run_policy_diag(&runner, "wg0", "edge-1").await;
		assert_eq!(report.summary, "ok");
		assert!(report.checks.iter().any(|c| c.name == "source nat" && c.status == "ok"));
	}

	#[tokio::test]
	async fn missing_masquerade_and_forwarding_degrade() {
		let rec = scripted();
		rec.respond_stdout("iptables -t nat -S POSTROUTING", "-P POSTROUTING ACCEPT");
		rec.respond_stdout("iptables -S FORWARD", "-P FORWARD DROP");
		rec.respond_stdout("sysctl -n net.ipv4.ip_forward", "0\n");
		let runner: Arc<dyn CommandRunner> = rec;
		let report = run_policy_diag(&runner, "wg0", "edge-1").await;
		assert_eq!(report.summary, "fail");
		assert!(report
			.checks
			.iter()
			.any(|c| c.name == "ip forwarding" && c.status == "fail"));
		assert!(report
			.checks
			.iter()
			.any(|c| c.name == "source nat" && c.status == "warn"));
	}

	#[tokio::test]
	async fn empty_policy_table_warns() {
		let runner = runner();
		let report = run_policy_diag(&runner, "wg0", "edge-1").await;
		assert!(report
			.checks
			.iter()
			.any(|c| c.name == "policy table" && c.status == "warn"));
	}

	#[test]
	fn verify_targets_dedupe_and_strip_masks() {
		let rules = vec![
			PolicyRule {
				prefix: "192.0.2.0/24".to_string(),
				via_node: "edge-2".to_string(),
				domains: vec!["example.com".to_string()],
				..Default::default()
			},
			PolicyRule {
				prefix: "geoip:us".to_string(),
				via_node: "edge-2".to_string(),
				..Default::default()
			},
		];
		let expanded = vec![
			vec!["192.0.2.0/24".to_string(), "198.51.100.7/32".to_string()],
			vec!["203.0.113.0/24".to_string()],
		];
		let targets = collect_verify_targets(&rules, &expanded);
		assert_eq!(
			targets,
			vec!["192.0.2.0", "example.com", "198.51.100.7", "203.0.113.0"]
		);
	}

	#[tokio::test]
	async fn verify_failure_names_the_target() {
		// Unroutable loopback port; connection is refused immediately.
		let err = run_verify(&["127.0.0.1:1".to_string()]).await.unwrap_err();
		assert!(err.to_string().contains("127.0.0.1:1"));
	}
}
