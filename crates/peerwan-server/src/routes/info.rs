// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::auth::require_operator;
use crate::error::ServerError;
use crate::AppState;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use serde_json::{json, Value};

pub async fn info(
	State(state): State<AppState>,
	headers: HeaderMap,
) -> Result<Json<Value>, ServerError> {
	require_operator(&state.tokens, &headers)?;
	let store_status = match state.store.ping().await {
		Ok(()) => "ok".to_string(),
		Err(err) => err.to_string(),
	};
	Ok(Json(json!({
		"store": state.store_kind,
		"publicAddr": state.public_addr,
		"planVersion": state.plans.current_version(),
		"buildVersion": env!("CARGO_PKG_VERSION"),
		"storeStatus": store_status,
		"connectedAgents": state.hub.connected_nodes().await,
	})))
}
