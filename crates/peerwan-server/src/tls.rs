// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Server TLS assembly: certificate/key loading and optional mutual auth
//! against a client CA.

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum TlsError {
	#[error("failed to read {0}: {1}")]
	Read(String, #[source] std::io::Error),

	#[error("no private key found in {0}")]
	NoKey(String),

	#[error("invalid client CA bundle {0}")]
	BadClientCa(String),

	#[error("TLS configuration rejected: {0}")]
	Config(#[from] rustls::Error),
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
	let data = std::fs::read(path)
		.map_err(|err| TlsError::Read(path.display().to_string(), err))?;
	rustls_pemfile::certs(&mut data.as_slice())
		.collect::<Result<Vec<_>, _>>()
		.map_err(|err| TlsError::Read(path.display().to_string(), err))
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
	let data = std::fs::read(path)
		.map_err(|err| TlsError::Read(path.display().to_string(), err))?;
	rustls_pemfile::private_key(&mut data.as_slice())
		.map_err(|err| TlsError::Read(path.display().to_string(), err))?
		.ok_or_else(|| TlsError::NoKey(path.display().to_string()))
}

/// Build the server TLS config. With `client_ca` set, client certificates
/// are required and verified against it.
pub fn server_config(
	cert_path: &Path,
	key_path: &Path,
	client_ca: Option<&Path>,
) -> Result<ServerConfig, TlsError> {
	let certs = load_certs(cert_path)?;
	let key = load_key(key_path)?;
	let config = match client_ca {
		Some(ca_path) => {
			let mut roots = RootCertStore::empty();
			for cert in load_certs(ca_path)? {
				roots
					.add(cert)
					.map_err(|_| TlsError::BadClientCa(ca_path.display().to_string()))?;
			}
			let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
				.build()
				.map_err(|_| TlsError::BadClientCa(ca_path.display().to_string()))?;
			ServerConfig::builder()
				.with_client_cert_verifier(verifier)
				.with_single_cert(certs, key)?
		}
		None => ServerConfig::builder()
			.with_no_client_auth()
			.with_single_cert(certs, key)?,
	};
	Ok(config)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn missing_cert_file_reports_path() {
		let err = server_config(
			Path::new("/nonexistent/cert.pem"),
			Path::new("/nonexistent/key.pem"),
			None,
		)
		.unwrap_err();
		assert!(err.to_string().contains("/nonexistent/cert.pem"));
	}

	#[test]
	fn pem_without_key_is_rejected() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("empty.pem");
		std::fs::write(&path, "").unwrap();
		let err = server_config(&path, &path, None).unwrap_err();
		assert!(matches!(err, TlsError::NoKey(_)));
	}
}
