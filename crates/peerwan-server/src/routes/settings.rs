// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Global settings: country-feed sources and diag probing cadence.
//! Posted fields merge non-empty-wins over the stored values.

use crate::auth::require_operator;
use crate::error::ServerError;
use crate::AppState;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use peerwan_model::{DiagConfig, GeoIpConfig};

pub async fn get_geoip(
	State(state): State<AppState>,
	headers: HeaderMap,
) -> Result<Json<GeoIpConfig>, ServerError> {
	require_operator(&state.tokens, &headers)?;
	Ok(Json(state.store.get_settings().await?.or_defaults().geoip))
}

pub async fn set_geoip(
	State(state): State<AppState>,
	headers: HeaderMap,
	Json(update): Json<GeoIpConfig>,
) -> Result<Json<GeoIpConfig>, ServerError> {
	require_operator(&state.tokens, &headers)?;
	let mut settings = state.store.get_settings().await?.or_defaults();
	if !update.cache_dir.is_empty() {
		settings.geoip.cache_dir = update.cache_dir;
	}
	if !update.source_v4.is_empty() {
		settings.geoip.source_v4 = update.source_v4;
	}
	if !update.source_v6.is_empty() {
		settings.geoip.source_v6 = update.source_v6;
	}
	if !update.cache_ttl.is_empty() {
		settings.geoip.cache_ttl = update.cache_ttl;
	}
	state.store.update_settings(settings.clone()).await?;
	Ok(Json(settings.geoip))
}

pub async fn get_diag(
	State(state): State<AppState>,
	headers: HeaderMap,
) -> Result<Json<DiagConfig>, ServerError> {
	require_operator(&state.tokens, &headers)?;
	Ok(Json(state.store.get_settings().await?.or_defaults().diag))
}

pub async fn set_diag(
	State(state): State<AppState>,
	headers: HeaderMap,
	Json(update): Json<DiagConfig>,
) -> Result<Json<DiagConfig>, ServerError> {
	require_operator(&state.tokens, &headers)?;
	let mut settings = state.store.get_settings().await?.or_defaults();
	if !update.ping_interval.is_empty() {
		settings.diag.ping_interval = update.ping_interval;
	}
	state.store.update_settings(settings.clone()).await?;
	Ok(Json(settings.diag))
}
