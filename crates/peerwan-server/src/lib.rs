// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! peerwan controller: HTTP surface, websocket hub and plan service.

pub mod auth;
pub mod error;
pub mod geo;
pub mod hub;
pub mod plan_service;
pub mod provisioning;
pub mod routes;
pub mod tls;

use crate::auth::{InMemoryUsers, TokenIssuer, UserDirectory};
use crate::geo::GeoResolver;
use crate::hub::Hub;
use crate::plan_service::PlanService;
use axum::routing::{get, post};
use axum::Router;
use peerwan_store::Store;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
	pub store: Arc<dyn Store>,
	pub plans: Arc<PlanService>,
	pub hub: Arc<Hub>,
	pub users: Arc<dyn UserDirectory>,
	pub tokens: Arc<TokenIssuer>,
	pub geo: Arc<GeoResolver>,
	/// External base URL embedded in install commands.
	pub public_addr: String,
	pub store_kind: String,
}

impl AppState {
	pub fn new(store: Arc<dyn Store>, store_kind: &str, public_addr: &str) -> Self {
		let hub = Arc::new(Hub::new());
		let plans = Arc::new(PlanService::new(Arc::clone(&store), Arc::clone(&hub)));
		Self {
			store,
			plans,
			hub,
			users: Arc::new(InMemoryUsers::default()),
			tokens: Arc::new(TokenIssuer::from_env()),
			geo: Arc::new(GeoResolver::new()),
			public_addr: public_addr.to_string(),
			store_kind: store_kind.to_string(),
		}
	}
}

pub fn create_router(state: AppState) -> Router {
	Router::new()
		.route("/", get(|| async { "peerwan controller" }))
		.route("/healthz", get(|| async { "ok" }))
		.route("/api/v1/auth/register", post(routes::auth::register))
		.route("/api/v1/auth/login", post(routes::auth::login))
		.route("/api/v1/version", get(routes::auth::version))
		.route("/api/v1/info", get(routes::info::info))
		.route("/api/v1/nodes", get(routes::nodes::list_nodes))
		.route("/api/v1/nodes/prepare", post(routes::nodes::prepare))
		.route("/api/v1/nodes/register", post(routes::nodes::register))
		.route("/api/v1/plan", get(routes::plan::get_plan))
		.route("/api/v1/plan/history", get(routes::plan::history))
		.route("/api/v1/plan/rollback", post(routes::plan::rollback))
		.route(
			"/api/v1/policy",
			get(routes::policy::get_policy).post(routes::policy::set_policy),
		)
		.route("/api/v1/policy/command", post(routes::policy::command))
		.route(
			"/api/v1/policy/status",
			get(routes::policy::list_status).post(routes::policy::post_status),
		)
		.route(
			"/api/v1/policy/diag",
			get(routes::policy::list_diag).post(routes::policy::post_diag),
		)
		.route(
			"/api/v1/tasks",
			get(routes::tasks::list_tasks).post(routes::tasks::create_task),
		)
		.route(
			"/api/v1/health",
			get(routes::health::list_health).post(routes::health::post_health),
		)
		.route("/api/v1/health/history", get(routes::health::history))
		.route("/api/v1/status/mesh", get(routes::status::mesh))
		.route("/api/v1/diagnose", get(routes::diagnose::diagnose))
		.route(
			"/api/v1/settings/geoip",
			get(routes::settings::get_geoip).post(routes::settings::set_geoip),
		)
		.route(
			"/api/v1/settings/diag",
			get(routes::settings::get_diag).post(routes::settings::set_diag),
		)
		.route("/api/v1/audit", get(routes::audit::list_audit))
		.route("/api/v1/ws/agent", get(routes::ws::agent_socket))
		.route("/api/v1/ws/logs", get(routes::ws::log_socket))
		.with_state(state)
}
