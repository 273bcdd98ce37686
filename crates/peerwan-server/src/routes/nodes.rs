// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Node listing, provisioning and registration.

use crate::auth::{self, require_operator};
use crate::error::ServerError;
use crate::provisioning::{
	allocate_overlay, generate_keypair, install_command, mint_provision_token, DEFAULT_ASN,
	DEFAULT_LISTEN_PORT,
};
use crate::AppState;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use peerwan_model::node::host_of;
use peerwan_model::{
	AuditEntry, Node, PlanResponse, PrepareRequest, PrepareResponse, RegisterRequest,
};
use tracing::{info, instrument};

/// Placeholder values agents send before they know their real identity.
const PLACEHOLDER_PUBLIC_KEY: &str = "stub-public-key";
const PLACEHOLDER_OVERLAY: &str = "10.10.1.1/32";

pub async fn list_nodes(
	State(state): State<AppState>,
	headers: HeaderMap,
) -> Result<Json<Vec<Node>>, ServerError> {
	require_operator(&state.tokens, &headers)?;
	Ok(Json(state.store.list_nodes().await?))
}

/// Mint identity for a node about to be installed: keypair, free overlay
/// host, one-time token, and the install command embedding all three.
/// Re-preparing an already-prepared node returns the stored identity.
#[instrument(skip(state, headers))]
pub async fn prepare(
	State(state): State<AppState>,
	headers: HeaderMap,
	Json(req): Json<PrepareRequest>,
) -> Result<Json<PrepareResponse>, ServerError> {
	require_operator(&state.tokens, &headers)?;
	if req.id.is_empty() {
		return Err(ServerError::BadRequest("id is required".to_string()));
	}
	let existing = state.store.get_node(&req.id).await?;
	let node = match existing {
		Some(node) if !node.provision_token.is_empty() => node,
		_ => {
			let keys = generate_keypair();
			let nodes = state.store.list_nodes().await?;
			let overlay = allocate_overlay(&nodes);
			let node = Node {
				id: req.id.clone(),
				public_key: keys.public_key,
				private_key: keys.private_key,
				overlay_ip: overlay.clone(),
				listen_port: DEFAULT_LISTEN_PORT,
				asn: DEFAULT_ASN,
				router_id: host_of(&overlay).to_string(),
				provision_token: mint_provision_token(),
				..Default::default()
			};
			let saved = state.store.upsert_node(node).await?;
			info!(node_id = %saved.id, overlay = %saved.overlay_ip, "node prepared");
			saved
		}
	};
	state.plans.bump().await;
	let command = install_command(&state.public_addr, &req.id, &node.provision_token);
	Ok(Json(PrepareResponse {
		id: req.id,
		public_key: node.public_key,
		private_key: node.private_key,
		overlay_ip: node.overlay_ip,
		listen_port: node.listen_port,
		provision_token: node.provision_token,
		command,
	}))
}

/// Register or update a node.
///
/// Two auth paths: a provision token minted at prepare (bootstrap), or an
/// operator bearer (edit). Fields merge non-empty-wins over the stored
/// record; the stored overlay and token always win once assigned. An
/// unchanged registration without `force` writes nothing and produces no new
/// plan version.
#[instrument(skip(state, headers, req), fields(node_id = %req.id))]
pub async fn register(
	State(state): State<AppState>,
	headers: HeaderMap,
	Json(req): Json<RegisterRequest>,
) -> Result<Json<PlanResponse>, ServerError> {
	if req.id.is_empty() {
		return Err(ServerError::BadRequest("id is required".to_string()));
	}
	let mut token = req.provision_token.clone();
	if token.is_empty() {
		token = auth::provision_token(&headers).unwrap_or_default().to_string();
	}
	let bootstrap = !token.is_empty();
	if !bootstrap {
		require_operator(&state.tokens, &headers)?;
	}

	let existing = state.store.get_node(&req.id).await?;
	if bootstrap {
		let valid = existing
			.as_ref()
			.map(|node| !node.provision_token.is_empty() && node.provision_token == token)
			.unwrap_or(false);
		if !valid {
			return Err(ServerError::Unauthorized);
		}
	}

	let mut node = Node {
		id: req.id.clone(),
		public_key: if req.public_key == PLACEHOLDER_PUBLIC_KEY {
			String::new()
		} else {
			req.public_key
		},
		endpoints: req.endpoints,
		cidrs: req.cidrs,
		listen_port: req.listen_port,
		overlay_ip: if req.overlay_ip == PLACEHOLDER_OVERLAY {
			String::new()
		} else {
			req.overlay_ip
		},
		asn: req.asn,
		router_id: req.router_id,
		peer_endpoints: req.peer_endpoints,
		provision_token: token,
		..Default::default()
	};

	if let Some(existing) = &existing {
		if node.public_key.is_empty() {
			node.public_key = existing.public_key.clone();
		}
		node.private_key = existing.private_key.clone();
		// The controller-assigned overlay wins once set.
		if !existing.overlay_ip.is_empty() {
			node.overlay_ip = existing.overlay_ip.clone();
		}
		// The token survives until rotated by a fresh prepare.
		node.provision_token = existing.provision_token.clone();
		if node.listen_port == 0 {
			node.listen_port = existing.listen_port;
		}
		if node.asn == 0 {
			node.asn = existing.asn;
		}
		if node.router_id.is_empty() {
			node.router_id = existing.router_id.clone();
		}
		if node.endpoints.is_empty() {
			node.endpoints = existing.endpoints.clone();
		}
		if node.cidrs.is_empty() {
			node.cidrs = existing.cidrs.clone();
		}
		if node.peer_endpoints.is_empty() {
			node.peer_endpoints = existing.peer_endpoints.clone();
		}
		// Policy is authored through its own endpoint; registration never
		// touches it.
		node.egress_peer_id = existing.egress_peer_id.clone();
		node.policy_rules = existing.policy_rules.clone();
		node.default_route = existing.default_route;
		node.bypass_cidrs = existing.bypass_cidrs.clone();
		node.default_route_next_hop = existing.default_route_next_hop.clone();
	}
	if node.router_id.is_empty() && !node.overlay_ip.is_empty() {
		node.router_id = host_of(&node.overlay_ip).to_string();
	}

	let unchanged = existing
		.as_ref()
		.map(|stored| stored.same_intent(&node))
		.unwrap_or(false);
	let saved = if unchanged && !req.force {
		existing.clone().expect("unchanged implies existing")
	} else {
		state.store.upsert_node(node).await?
	};

	let _ = state
		.store
		.append_audit(AuditEntry::now(
			"controller",
			"register",
			&saved.id,
			"node registered/updated",
		))
		.await;

	if !(unchanged && !req.force) {
		state.plans.recompute_all().await?;
		info!(
			node_id = %saved.id,
			endpoints = ?saved.endpoints,
			cidrs = ?saved.cidrs,
			revision = %saved.config_version,
			"node registered"
		);
	}

	let settings = state.store.get_settings().await?.or_defaults();
	let plan = match state.store.get_plan(&saved.id).await? {
		Some(plan) => plan,
		None => state.plans.recompute_node(&saved.id).await?,
	};
	let mut resp = state.plans.plan_response(
		&saved,
		&plan,
		&settings,
		"registered; peer plan derived from currently known nodes",
	);
	resp.private_key = saved.private_key.clone();
	Ok(Json(resp))
}
