// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::path::PathBuf;

/// Agent failure taxonomy. Only missing startup configuration is fatal;
/// everything else is reported and retried on the next tick.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
	#[error("configuration: {0}")]
	Config(String),

	#[error("controller returned {status}: {body}")]
	Controller { status: u16, body: String },

	#[error("request failed: {0}")]
	Http(#[from] reqwest::Error),

	#[error("failed to write {path}: {source}")]
	WriteConfig {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},

	#[error("{command} failed: {detail}")]
	Command { command: String, detail: String },

	#[error("verify {target} failed: {detail}")]
	Verify { target: String, detail: String },

	#[error("journal: {0}")]
	Journal(#[from] rusqlite::Error),
}

pub type Result<T> = std::result::Result<T, AgentError>;
