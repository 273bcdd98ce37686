// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! peerwan controller binary.

use clap::{Parser, Subcommand};
use peerwan_server::{create_router, AppState};
use peerwan_store::{keys, ConsulKv, KvStore, LeaderEvent, MemoryStore, Store};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const LEADER_TTL: Duration = Duration::from_secs(15);
const LEADER_RECOMPUTE_INTERVAL: Duration = Duration::from_secs(30);
const HEALTH_PRUNE_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// peerwan controller - plans and distributes overlay configuration.
#[derive(Parser, Debug)]
#[command(name = "peerwan-server", about = "peerwan overlay controller", version)]
struct Args {
	/// Listen address.
	#[arg(long, default_value = "0.0.0.0:8080")]
	addr: String,

	/// Store backend: memory | kv.
	#[arg(long, env = "STORE", default_value = "memory")]
	store: String,

	/// KV backend address (when --store=kv).
	#[arg(long = "kv-addr", env = "KV_ADDR", default_value = "127.0.0.1:8500")]
	kv_addr: String,

	/// TLS certificate path (enables HTTPS together with --tls-key).
	#[arg(long = "tls-cert")]
	tls_cert: Option<PathBuf>,

	/// TLS key path.
	#[arg(long = "tls-key")]
	tls_key: Option<PathBuf>,

	/// Require and verify client certificates against this CA.
	#[arg(long = "client-ca")]
	client_ca: Option<PathBuf>,

	/// Leader lock key in the KV backend.
	#[arg(long = "lock-key", default_value = keys::DEFAULT_LEADER_LOCK)]
	lock_key: String,

	/// External base URL embedded in agent install commands.
	#[arg(long = "public-addr", env = "PUBLIC_ADDR", default_value = "")]
	public_addr: String,

	#[command(subcommand)]
	command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
	/// Show version information.
	Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let args = Args::parse();
	if let Some(Command::Version) = args.command {
		println!("peerwan-server {}", env!("CARGO_PKG_VERSION"));
		return Ok(());
	}

	dotenvy::dotenv().ok();

	tracing_subscriber::registry()
		.with(
			tracing_subscriber::EnvFilter::try_from_default_env()
				.unwrap_or_else(|_| "info".into()),
		)
		.with(tracing_subscriber::fmt::layer())
		.init();

	let store: Arc<dyn Store> = match args.store.as_str() {
		"memory" => Arc::new(MemoryStore::new()),
		"kv" => Arc::new(KvStore::new(ConsulKv::new(&args.kv_addr))),
		other => anyhow::bail!("unsupported store type: {other}"),
	};

	tracing::info!(
		addr = %args.addr,
		store = %args.store,
		kv_addr = %args.kv_addr,
		public_addr = %args.public_addr,
		"starting peerwan controller"
	);

	let state = AppState::new(Arc::clone(&store), &args.store, &args.public_addr);
	state.plans.sync_version_floor().await;

	let (shutdown_tx, shutdown_rx) = watch::channel(false);

	// Cross-controller coordination only exists on the replicated backend.
	if args.store == "kv" {
		spawn_watch_recompute(&state, shutdown_rx.clone());
		spawn_leader_loop(&state, &args.lock_key, shutdown_rx.clone());
	}
	spawn_health_pruner(&state, shutdown_rx.clone());

	let app = create_router(state)
		.layer(TraceLayer::new_for_http())
		.layer(
			CorsLayer::new()
				.allow_origin(Any)
				.allow_methods(Any)
				.allow_headers(Any),
		);

	match (&args.tls_cert, &args.tls_key) {
		(Some(cert), Some(key)) => {
			let tls = peerwan_server::tls::server_config(cert, key, args.client_ca.as_deref())?;
			let rustls_config =
				axum_server::tls_rustls::RustlsConfig::from_config(Arc::new(tls));
			let addr: std::net::SocketAddr = args.addr.parse()?;
			let handle = axum_server::Handle::new();
			let shutdown_handle = handle.clone();
			tokio::spawn(async move {
				let _ = tokio::signal::ctrl_c().await;
				tracing::info!("shutdown signal received");
				let _ = shutdown_tx.send(true);
				shutdown_handle.graceful_shutdown(Some(Duration::from_secs(10)));
			});
			tracing::info!(%addr, "controller listening (https)");
			axum_server::bind_rustls(addr, rustls_config)
				.handle(handle)
				.serve(app.into_make_service())
				.await?;
		}
		_ => {
			let listener = tokio::net::TcpListener::bind(&args.addr).await?;
			tracing::info!(addr = %args.addr, "controller listening (http)");
			axum::serve(listener, app)
				.with_graceful_shutdown(async move {
					let _ = tokio::signal::ctrl_c().await;
					tracing::info!("shutdown signal received");
					let _ = shutdown_tx.send(true);
				})
				.await?;
		}
	}

	tracing::info!("controller shutdown complete");
	Ok(())
}

/// Recompute plans when another controller mutates node intent in the KV
/// backend. Events collapse through a capacity-1 channel so a burst of key
/// writes triggers one recompute pass.
fn spawn_watch_recompute(state: &AppState, shutdown: watch::Receiver<bool>) {
	let (tx, mut rx) = mpsc::channel::<()>(1);
	state.store.spawn_watch(
		vec![keys::NODE_PREFIX.to_string()],
		shutdown,
		Arc::new(move || {
			let _ = tx.try_send(());
		}),
	);
	let plans = Arc::clone(&state.plans);
	tokio::spawn(async move {
		while rx.recv().await.is_some() {
			if let Err(err) = plans.recompute_all().await {
				tracing::warn!(error = %err, "watch-triggered recompute failed");
			} else {
				tracing::info!(version = plans.current_version(), "watch-triggered recompute");
			}
		}
	});
}

/// Only the lock holder runs the periodic full recompute; registration and
/// policy writes still recompute everywhere, last writer winning through the
/// store's compare-and-set.
fn spawn_leader_loop(state: &AppState, lock_key: &str, shutdown: watch::Receiver<bool>) {
	let (events_tx, mut events_rx) = mpsc::channel(4);
	state
		.store
		.spawn_leader_guard(lock_key.to_string(), LEADER_TTL, shutdown, events_tx);
	let plans = Arc::clone(&state.plans);
	tokio::spawn(async move {
		let mut leading = false;
		let mut ticker = tokio::time::interval(LEADER_RECOMPUTE_INTERVAL);
		ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
		loop {
			tokio::select! {
				event = events_rx.recv() => match event {
					Some(LeaderEvent::Acquired) => {
						tracing::info!("leadership acquired; periodic recompute enabled");
						leading = true;
					}
					Some(LeaderEvent::Lost) => {
						tracing::info!("leadership lost; periodic recompute disabled");
						leading = false;
					}
					None => return,
				},
				_ = ticker.tick() => {
					if leading {
						if let Err(err) = plans.recompute_all().await {
							tracing::warn!(error = %err, "leader recompute failed");
						}
					}
				}
			}
		}
	});
}

fn spawn_health_pruner(state: &AppState, mut shutdown: watch::Receiver<bool>) {
	let store = Arc::clone(&state.store);
	tokio::spawn(async move {
		let mut ticker = tokio::time::interval(HEALTH_PRUNE_INTERVAL);
		ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
		loop {
			tokio::select! {
				_ = shutdown.changed() => {
					if *shutdown.borrow() {
						return;
					}
				}
				_ = ticker.tick() => {
					let cutoff = chrono::Utc::now() - chrono::Duration::hours(24);
					if let Err(err) = store.prune_health_before(cutoff).await {
						tracing::warn!(error = %err, "health history prune failed");
					}
				}
			}
		}
	});
}
