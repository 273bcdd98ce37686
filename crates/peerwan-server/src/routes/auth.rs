// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Operator bootstrap and login, plus the global plan version endpoint
//! agents poll between long-poll cycles.

use crate::auth::{self, hash_password, verify_password, TOKEN_TTL};
use crate::error::ServerError;
use crate::AppState;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use tracing::info;

#[derive(Debug, Deserialize)]
pub struct Credentials {
	#[serde(default)]
	pub username: String,
	#[serde(default)]
	pub password: String,
}

/// First-user-only bootstrap: creates the admin account and returns a
/// bearer token. Subsequent calls are rejected; user management beyond the
/// bootstrap lives outside this service.
pub async fn register(
	State(state): State<AppState>,
	Json(creds): Json<Credentials>,
) -> Result<Json<serde_json::Value>, ServerError> {
	if creds.username.is_empty() || creds.password.is_empty() {
		return Err(ServerError::BadRequest("invalid payload".to_string()));
	}
	if state.users.count().await > 0 {
		return Err(ServerError::Conflict("registration closed".to_string()));
	}
	let hash = hash_password(&creds.password)?;
	let user = state.users.create(&creds.username, &hash, true).await;
	let token = state.tokens.issue(user.id, &user.username, TOKEN_TTL)?;
	info!(username = %user.username, "bootstrap admin created");
	Ok(Json(json!({ "token": token })))
}

pub async fn login(
	State(state): State<AppState>,
	Json(creds): Json<Credentials>,
) -> Result<Json<serde_json::Value>, ServerError> {
	if creds.username.is_empty() || creds.password.is_empty() {
		return Err(ServerError::BadRequest("invalid payload".to_string()));
	}
	let user = state
		.users
		.find(&creds.username)
		.await
		.ok_or(ServerError::Unauthorized)?;
	if !verify_password(&creds.password, &user.password_hash) {
		return Err(ServerError::Unauthorized);
	}
	let token = state.tokens.issue(user.id, &user.username, TOKEN_TTL)?;
	Ok(Json(json!({ "token": token })))
}

/// Current global plan version. Accepts an operator bearer or any node's
/// provision token; agents hit this before deciding whether to refetch.
pub async fn version(
	State(state): State<AppState>,
	headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ServerError> {
	let authorized = auth::operator_claims(&state.tokens, &headers).is_some()
		|| match auth::provision_token(&headers) {
			Some(token) => state
				.store
				.list_nodes()
				.await?
				.iter()
				.any(|n| !n.provision_token.is_empty() && n.provision_token == token),
			None => false,
		};
	if !authorized {
		return Err(ServerError::Unauthorized);
	}
	Ok(Json(json!({ "version": state.plans.current_version() })))
}
