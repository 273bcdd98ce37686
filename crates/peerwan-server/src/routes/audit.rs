// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::auth::require_operator;
use crate::error::ServerError;
use crate::AppState;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use peerwan_model::AuditEntry;

const AUDIT_PAGE: usize = 50;

pub async fn list_audit(
	State(state): State<AppState>,
	headers: HeaderMap,
) -> Result<Json<Vec<AuditEntry>>, ServerError> {
	require_operator(&state.tokens, &headers)?;
	Ok(Json(state.store.list_audit(AUDIT_PAGE).await?))
}
