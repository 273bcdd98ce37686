// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Shared HTTP client assembly with a consistent User-Agent and optional
//! custom TLS trust (root CA, client certificate, verification skip).

use reqwest::{Certificate, Client, ClientBuilder, Identity};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum HttpClientError {
	#[error("failed to read {path}: {source}")]
	ReadFile {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},

	#[error("invalid certificate material: {0}")]
	Tls(#[source] reqwest::Error),

	#[error("failed to build HTTP client: {0}")]
	Build(#[source] reqwest::Error),
}

/// TLS knobs for clients talking to the controller.
#[derive(Debug, Clone, Default)]
pub struct TlsOptions {
	/// Extra root CA (PEM) trusted for the controller endpoint.
	pub ca_file: Option<PathBuf>,
	/// Client certificate (PEM) presented for mutual TLS.
	pub cert_file: Option<PathBuf>,
	/// Client private key (PEM) matching `cert_file`.
	pub key_file: Option<PathBuf>,
	/// Skip server certificate verification. Not recommended.
	pub insecure: bool,
}

/// Returns the standard User-Agent string, `peerwan/<version>`.
pub fn user_agent() -> String {
	format!("peerwan/{}", env!("CARGO_PKG_VERSION"))
}

/// A client builder carrying the standard User-Agent. Customize and build
/// when the defaults don't fit.
pub fn builder() -> ClientBuilder {
	Client::builder().user_agent(user_agent())
}

/// A plain client with the standard User-Agent and no overall timeout.
pub fn new_client() -> Client {
	builder().build().expect("failed to build HTTP client")
}

/// A plain client with the given request timeout.
pub fn new_client_with_timeout(timeout: Duration) -> Client {
	builder()
		.timeout(timeout)
		.build()
		.expect("failed to build HTTP client")
}

/// A client with custom TLS trust for controller traffic.
pub fn new_client_with_tls(
	opts: &TlsOptions,
	timeout: Duration,
) -> Result<Client, HttpClientError> {
	let mut builder = builder().timeout(timeout);
	if opts.insecure {
		builder = builder.danger_accept_invalid_certs(true);
	}
	if let Some(ca_path) = &opts.ca_file {
		let pem = read_pem(ca_path)?;
		let cert = Certificate::from_pem(&pem).map_err(HttpClientError::Tls)?;
		builder = builder.add_root_certificate(cert);
	}
	if let (Some(cert_path), Some(key_path)) = (&opts.cert_file, &opts.key_file) {
		let mut pem = read_pem(cert_path)?;
		pem.extend_from_slice(&read_pem(key_path)?);
		let identity = Identity::from_pem(&pem).map_err(HttpClientError::Tls)?;
		builder = builder.identity(identity);
	}
	builder.build().map_err(HttpClientError::Build)
}

fn read_pem(path: &Path) -> Result<Vec<u8>, HttpClientError> {
	std::fs::read(path).map_err(|source| HttpClientError::ReadFile {
		path: path.to_path_buf(),
		source,
	})
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn user_agent_has_product_and_version() {
		let ua = user_agent();
		assert!(ua.starts_with("peerwan/"));
		assert_eq!(ua.split('/').count(), 2);
	}

	#[test]
	fn default_tls_options_build_a_client() {
		let client = new_client_with_tls(&TlsOptions::default(), Duration::from_secs(5));
		assert!(client.is_ok());
	}

	#[test]
	fn missing_ca_file_is_reported_with_path() {
		let opts = TlsOptions {
			ca_file: Some(PathBuf::from("/nonexistent/ca.pem")),
			..Default::default()
		};
		let err = new_client_with_tls(&opts, Duration::from_secs(5)).unwrap_err();
		assert!(err.to_string().contains("/nonexistent/ca.pem"));
	}
}
