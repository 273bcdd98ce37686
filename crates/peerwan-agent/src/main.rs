// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! peerwan agent binary: register with the controller, reconcile tunnel and
//! routing state against the received plan, and keep a message session open
//! for pushed plans, commands and tasks.

mod client;
mod commands;
mod diag;
mod endpoints;
mod error;
mod health;
mod journal;
mod nat;
mod reconcile;
mod render;
mod routes;
mod runtime;
mod session;

use clap::Parser;
use client::ControllerClient;
use commands::{CommandRunner, SystemRunner};
use futures::FutureExt;
use journal::PolicyJournal;
use peerwan_common_http::TlsOptions;
use peerwan_model::{node::host_of, Node, RegisterRequest};
use reconcile::Reconciler;
use runtime::AgentRuntime;
use session::SessionClient;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// peerwan agent - applies controller plans to this node.
#[derive(Parser, Debug)]
#[command(name = "peerwan-agent", about = "peerwan overlay agent", version)]
struct Args {
	/// Node id.
	#[arg(long, env = "NODE_ID")]
	id: Option<String>,

	/// Controller base URL.
	#[arg(long, env = "CONTROLLER_ADDR", default_value = "http://127.0.0.1:8080")]
	controller: String,

	/// Operator bearer token.
	#[arg(long, env = "AUTH_TOKEN", default_value = "")]
	token: String,

	/// One-time provision token from the controller.
	#[arg(long = "provision-token", env = "PROVISION_TOKEN", default_value = "")]
	provision_token: String,

	/// CA bundle for controller TLS.
	#[arg(long, env = "CA_FILE")]
	ca: Option<PathBuf>,

	/// Client certificate for mutual TLS.
	#[arg(long)]
	cert: Option<PathBuf>,

	/// Client key for mutual TLS.
	#[arg(long)]
	key: Option<PathBuf>,

	/// Skip TLS verification. Not recommended.
	#[arg(long)]
	insecure: bool,

	/// Comma-separated externally reachable endpoints (host:port).
	#[arg(long, value_delimiter = ',')]
	endpoints: Vec<String>,

	/// Comma-separated CIDRs announced by this node.
	#[arg(long, value_delimiter = ',')]
	cidrs: Vec<String>,

	/// Overlay interface address.
	#[arg(long = "overlay-ip", default_value = "")]
	overlay_ip: String,

	/// Tunnel listen port.
	#[arg(long = "listen-port", default_value_t = 51820)]
	listen_port: u16,

	/// Tunnel interface name.
	#[arg(long, default_value = "wg0")]
	iface: String,

	/// Routing protocol AS number.
	#[arg(long, default_value_t = 65000)]
	asn: u32,

	/// Routing router-id override (defaults to the overlay host).
	#[arg(long = "router-id", default_value = "")]
	router_id: String,

	/// Tunnel private key (usually delivered by the controller).
	#[arg(long = "private-key", default_value = "")]
	private_key: String,

	/// Tunnel public key matching --private-key.
	#[arg(long = "public-key", default_value = "")]
	public_key: String,

	/// Apply rendered configs with the system tools.
	#[arg(long)]
	apply: bool,

	/// Peer probe interval, e.g. 30s; 0 disables.
	#[arg(long = "health-interval", value_parser = parse_duration_arg, default_value = "0")]
	health_interval: Duration,

	/// Plan poll / self-heal interval, e.g. 30s; 0 disables.
	#[arg(long = "plan-interval", value_parser = parse_duration_arg, default_value = "0")]
	plan_interval: Duration,

	/// Directory for rendered configs.
	#[arg(long, default_value = "./out")]
	out: PathBuf,

	/// Detect public endpoints automatically (`--auto-endpoint=false` to
	/// announce only the configured ones).
	#[arg(long = "auto-endpoint", action = clap::ArgAction::Set, default_value_t = true)]
	auto_endpoint: bool,
}

fn parse_duration_arg(s: &str) -> Result<Duration, String> {
	peerwan_model::settings::parse_duration(s).ok_or_else(|| format!("invalid duration: {s}"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	dotenvy::dotenv().ok();
	let args = Args::parse();

	tracing_subscriber::registry()
		.with(
			tracing_subscriber::EnvFilter::try_from_default_env()
				.unwrap_or_else(|_| "info".into()),
		)
		.with(tracing_subscriber::fmt::layer())
		.init();

	let Some(node_id) = args.id.clone().filter(|id| !id.is_empty()) else {
		return Err(error::AgentError::Config("node id is required (--id or NODE_ID)".to_string()).into());
	};
	if args.controller.is_empty() {
		return Err(error::AgentError::Config("controller base URL is required".to_string()).into());
	}

	let tls = TlsOptions {
		ca_file: args.ca.clone(),
		cert_file: args.cert.clone(),
		key_file: args.key.clone(),
		insecure: args.insecure,
	};
	let http = peerwan_common_http::new_client_with_tls(&tls, REQUEST_TIMEOUT)?;
	let client = ControllerClient::new(&args.controller, http, &args.token, &args.provision_token);

	let mut endpoints = args.endpoints.clone();
	if args.auto_endpoint {
		let detected = endpoints::detect_endpoints(args.listen_port).await;
		if !detected.is_empty() {
			tracing::info!(endpoints = ?detected, "auto-detected public endpoints");
			endpoints = detected;
		}
	}

	let register_request = RegisterRequest {
		id: node_id.clone(),
		public_key: args.public_key.clone(),
		endpoints,
		cidrs: args.cidrs.clone(),
		listen_port: args.listen_port,
		overlay_ip: args.overlay_ip.clone(),
		asn: args.asn,
		router_id: args.router_id.clone(),
		provision_token: args.provision_token.clone(),
		..Default::default()
	};
	let cfg = client.register(&register_request).await?;
	tracing::info!(
		node_id = %cfg.id,
		config_version = %cfg.config_version,
		peers = cfg.peers.len(),
		routes = ?cfg.routes,
		"registered with controller"
	);

	let overlay = first_non_empty(&[cfg.overlay_ip.as_str(), args.overlay_ip.as_str()]);
	let private_key = first_non_empty(&[cfg.private_key.as_str(), args.private_key.as_str()]);
	let router_id = first_non_empty(&[
		cfg.router_id.as_str(),
		args.router_id.as_str(),
		host_of(&overlay),
	]);
	let initial_node = Node {
		id: cfg.id.clone(),
		cidrs: cfg.routes.clone(),
		overlay_ip: overlay,
		listen_port: if cfg.listen_port > 0 { cfg.listen_port } else { args.listen_port },
		asn: if cfg.asn > 0 { cfg.asn } else { args.asn },
		router_id,
		..Default::default()
	};

	let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner);
	let journal = open_journal(&args.out);
	let reconciler = Reconciler::new(
		Arc::clone(&runner),
		journal,
		args.out.clone(),
		&args.iface,
		args.apply,
		PathBuf::from(nat::DEFAULT_NAT_STATE_PATH),
	);

	let mut session = SessionClient::new(
		&client.session_url(&node_id),
		&node_id,
		&args.token,
		&args.provision_token,
	);
	let runtime = Arc::new(AgentRuntime::new(
		client.clone(),
		Arc::clone(&runner),
		reconciler,
		session.handle(),
		&node_id,
		&args.iface,
		&private_key,
	));

	// First apply: render whatever the controller handed us at registration.
	let mut initial_cfg = cfg;
	merge_initial(&mut initial_cfg, &initial_node);
	let advertised_health_secs = initial_cfg.health_interval_sec;
	if let Err(err) = runtime.handle_plan(initial_cfg, true).await {
		anyhow::bail!("initial render/apply failed: {err}");
	}

	let (shutdown_tx, shutdown_rx) = watch::channel(false);

	register_session_handlers(&mut session, &runtime);
	tokio::spawn(session.run(shutdown_rx.clone()));

	// The flag wins; otherwise use the cadence the controller advertised.
	let health_interval = if args.health_interval > Duration::ZERO {
		args.health_interval
	} else {
		Duration::from_secs(advertised_health_secs)
	};
	if health_interval > Duration::ZERO {
		let reporter = health::HealthReporter::new(client.clone(), Arc::clone(&runner), &node_id);
		tokio::spawn(reporter.run(
			health_interval,
			runtime.peers_watch(),
			shutdown_rx.clone(),
		));
	}

	if args.plan_interval > Duration::ZERO {
		tokio::spawn(runtime::plan_poll_loop(
			Arc::clone(&runtime),
			args.plan_interval,
			shutdown_rx.clone(),
		));
		tokio::spawn(runtime::self_heal_loop(
			Arc::clone(&runtime),
			args.plan_interval,
			shutdown_rx.clone(),
		));
	}

	tokio::signal::ctrl_c().await?;
	tracing::info!("shutdown signal received");
	let _ = shutdown_tx.send(true);
	Ok(())
}

fn first_non_empty(values: &[&str]) -> String {
	values
		.iter()
		.find(|v| !v.trim().is_empty())
		.map(|v| v.to_string())
		.unwrap_or_default()
}

/// The journal prefers its system path but falls back next to the rendered
/// configs when that is not writable (unprivileged runs).
fn open_journal(out_dir: &std::path::Path) -> Arc<PolicyJournal> {
	let default = PathBuf::from(journal::DEFAULT_JOURNAL_PATH);
	match PolicyJournal::open(&default) {
		Ok(journal) => Arc::new(journal),
		Err(err) => {
			tracing::warn!(error = %err, "system journal unavailable; using output directory");
			let fallback = out_dir.join("state.db");
			Arc::new(PolicyJournal::open(&fallback).expect("journal fallback open failed"))
		}
	}
}

/// Make the registration response carry the node identity the agent derived
/// from flags where the controller left fields empty.
fn merge_initial(cfg: &mut peerwan_model::PlanResponse, node: &Node) {
	if cfg.overlay_ip.is_empty() {
		cfg.overlay_ip = node.overlay_ip.clone();
	}
	if cfg.listen_port == 0 {
		cfg.listen_port = node.listen_port;
	}
	if cfg.asn == 0 {
		cfg.asn = node.asn;
	}
	if cfg.router_id.is_empty() {
		cfg.router_id = node.router_id.clone();
	}
	if cfg.routes.is_empty() {
		cfg.routes = node.cidrs.clone();
	}
}

fn register_session_handlers(session: &mut SessionClient, runtime: &Arc<AgentRuntime>) {
	let plan_runtime = Arc::clone(runtime);
	session.on(
		"plan",
		Arc::new(move |payload| {
			let runtime = Arc::clone(&plan_runtime);
			async move {
				match serde_json::from_value::<peerwan_model::PlanResponse>(payload) {
					Ok(cfg) => {
						if let Err(err) = runtime.handle_plan(cfg, false).await {
							tracing::warn!(error = %err, "pushed plan apply failed");
						}
					}
					Err(err) => tracing::warn!(error = %err, "unparseable plan payload"),
				}
			}
			.boxed()
		}),
	);

	let command_runtime = Arc::clone(runtime);
	session.on(
		"command",
		Arc::new(move |payload| {
			let runtime = Arc::clone(&command_runtime);
			async move {
				runtime.handle_command(payload).await;
			}
			.boxed()
		}),
	);

	let task_runtime = Arc::clone(runtime);
	session.on(
		"task",
		Arc::new(move |payload| {
			let runtime = Arc::clone(&task_runtime);
			async move {
				runtime.handle_task(payload).await;
			}
			.boxed()
		}),
	);
}
