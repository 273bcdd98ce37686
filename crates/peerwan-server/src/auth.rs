// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Operator and agent authentication.
//!
//! Operators carry an HS256 bearer JWT minted at login; agents carry either
//! the same bearer or their node-scoped `X-Provision-Token`, checked against
//! the stored node record per request.

use crate::error::ServerError;
use argon2::password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use async_trait::async_trait;
use axum::http::HeaderMap;
use chrono::Utc;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use peerwan_store::Store;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

pub const PROVISION_TOKEN_HEADER: &str = "x-provision-token";
pub const TOKEN_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
	pub uid: u64,
	pub username: String,
	pub exp: i64,
	pub iat: i64,
}

/// Issues and verifies operator bearer tokens.
pub struct TokenIssuer {
	encoding: EncodingKey,
	decoding: DecodingKey,
}

impl TokenIssuer {
	pub fn new(secret: &str) -> Self {
		Self {
			encoding: EncodingKey::from_secret(secret.as_bytes()),
			decoding: DecodingKey::from_secret(secret.as_bytes()),
		}
	}

	/// Secret from `JWT_SECRET`, with a development fallback.
	pub fn from_env() -> Self {
		let secret =
			std::env::var("JWT_SECRET").unwrap_or_else(|_| "change-me-secret".to_string());
		Self::new(&secret)
	}

	pub fn issue(&self, uid: u64, username: &str, ttl: Duration) -> Result<String, ServerError> {
		let now = Utc::now().timestamp();
		let claims = Claims {
			uid,
			username: username.to_string(),
			iat: now,
			exp: now + ttl.as_secs() as i64,
		};
		encode(&Header::default(), &claims, &self.encoding)
			.map_err(|err| ServerError::Internal(format!("token issue failed: {err}")))
	}

	pub fn verify(&self, token: &str) -> Option<Claims> {
		decode::<Claims>(token, &self.decoding, &Validation::default())
			.map(|data| data.claims)
			.ok()
	}
}

/// An operator account. Password storage and the relational backend behind
/// it are external concerns; the directory below is the seam.
#[derive(Debug, Clone)]
pub struct User {
	pub id: u64,
	pub username: String,
	pub password_hash: String,
	pub is_admin: bool,
}

#[async_trait]
pub trait UserDirectory: Send + Sync {
	async fn count(&self) -> usize;
	async fn create(&self, username: &str, password_hash: &str, is_admin: bool) -> User;
	async fn find(&self, username: &str) -> Option<User>;
}

/// Process-local user directory; sufficient for the single-admin bootstrap.
#[derive(Default)]
pub struct InMemoryUsers {
	users: RwLock<Vec<User>>,
}

#[async_trait]
impl UserDirectory for InMemoryUsers {
	async fn count(&self) -> usize {
		self.users.read().await.len()
	}

	async fn create(&self, username: &str, password_hash: &str, is_admin: bool) -> User {
		let mut users = self.users.write().await;
		let user = User {
			id: users.len() as u64 + 1,
			username: username.to_string(),
			password_hash: password_hash.to_string(),
			is_admin,
		};
		users.push(user.clone());
		user
	}

	async fn find(&self, username: &str) -> Option<User> {
		self
			.users
			.read()
			.await
			.iter()
			.find(|u| u.username == username)
			.cloned()
	}
}

pub fn hash_password(password: &str) -> Result<String, ServerError> {
	let salt = SaltString::generate(&mut OsRng);
	Argon2::default()
		.hash_password(password.as_bytes(), &salt)
		.map(|hash| hash.to_string())
		.map_err(|err| ServerError::Internal(format!("password hash failed: {err}")))
}

pub fn verify_password(password: &str, hash: &str) -> bool {
	PasswordHash::new(hash)
		.map(|parsed| {
			Argon2::default()
				.verify_password(password.as_bytes(), &parsed)
				.is_ok()
		})
		.unwrap_or(false)
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
	headers
		.get(axum::http::header::AUTHORIZATION)
		.and_then(|value| value.to_str().ok())
		.and_then(|value| value.strip_prefix("Bearer "))
}

pub fn provision_token(headers: &HeaderMap) -> Option<&str> {
	headers
		.get(PROVISION_TOKEN_HEADER)
		.and_then(|value| value.to_str().ok())
		.filter(|token| !token.is_empty())
}

/// Operator auth: a valid bearer JWT.
pub fn operator_claims(issuer: &TokenIssuer, headers: &HeaderMap) -> Option<Claims> {
	bearer_token(headers).and_then(|token| issuer.verify(token))
}

pub fn require_operator(
	issuer: &TokenIssuer,
	headers: &HeaderMap,
) -> Result<Claims, ServerError> {
	operator_claims(issuer, headers).ok_or(ServerError::Unauthorized)
}

/// Agent auth: the presented provision token matches the node's stored one.
pub async fn agent_authorized(
	store: &Arc<dyn Store>,
	node_id: &str,
	headers: &HeaderMap,
) -> bool {
	let Some(token) = provision_token(headers) else {
		return false;
	};
	if node_id.is_empty() {
		return false;
	}
	match store.get_node(node_id).await {
		Ok(Some(node)) => !node.provision_token.is_empty() && node.provision_token == token,
		_ => false,
	}
}

/// Endpoints marked "bearer or token": JWT first, then the node token.
pub async fn require_operator_or_agent(
	issuer: &TokenIssuer,
	store: &Arc<dyn Store>,
	node_id: &str,
	headers: &HeaderMap,
) -> Result<(), ServerError> {
	if operator_claims(issuer, headers).is_some() {
		return Ok(());
	}
	if agent_authorized(store, node_id, headers).await {
		return Ok(());
	}
	Err(ServerError::Unauthorized)
}
