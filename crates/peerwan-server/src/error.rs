// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use peerwan_store::StoreError;

/// Request-level failure taxonomy. Input errors are 400 and never retried,
/// auth errors 401, lookups 404, plan CAS exhaustion and store failures 5xx.
/// The controller never crashes on a bad request.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
	#[error("{0}")]
	BadRequest(String),

	#[error("unauthorized")]
	Unauthorized,

	#[error("{0}")]
	NotFound(String),

	#[error("{0}")]
	Conflict(String),

	#[error(transparent)]
	Store(#[from] StoreError),

	#[error("{0}")]
	Internal(String),
}

impl IntoResponse for ServerError {
	fn into_response(self) -> Response {
		let (status, body) = match self {
			ServerError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
			ServerError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized".to_string()),
			ServerError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
			ServerError::Conflict(msg) => (StatusCode::CONFLICT, msg),
			ServerError::Store(StoreError::NotFound(msg)) => (StatusCode::NOT_FOUND, msg),
			ServerError::Store(err) => {
				tracing::error!(error = %err, "store operation failed");
				(StatusCode::INTERNAL_SERVER_ERROR, "store failure".to_string())
			}
			ServerError::Internal(msg) => {
				tracing::error!(error = %msg, "internal error");
				(StatusCode::INTERNAL_SERVER_ERROR, msg)
			}
		};
		(status, body).into_response()
	}
}
