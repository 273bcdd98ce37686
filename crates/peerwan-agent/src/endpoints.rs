// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Best-effort public endpoint discovery for freshly provisioned agents:
//! the local address of a UDP dial toward a public resolver, backed up by
//! public-IP echo services.

use std::net::IpAddr;
use std::time::Duration;
use tracing::debug;

const PUBLIC_IP_SERVICES: [&str; 3] = [
	"http://ipv4.icanhazip.com",
	"https://api.ipify.org",
	"http://ipv6.icanhazip.com",
];
const FETCH_TIMEOUT: Duration = Duration::from_secs(2);

pub fn is_private(ip: IpAddr) -> bool {
	match ip {
		IpAddr::V4(v4) => {
			let octets = v4.octets();
			v4.is_loopback()
				|| v4.is_private()
				|| v4.is_link_local()
				|| (octets[0] == 100 && (octets[1] & 0xc0) == 0x40)
		}
		IpAddr::V6(v6) => {
			// ULA fc00::/7 and loopback.
			v6.is_loopback() || (v6.octets()[0] & 0xfe) == 0xfc
		}
	}
}

pub fn is_public(ip: IpAddr) -> bool {
	!ip.is_unspecified() && !ip.is_multicast() && !is_private(ip)
}

fn format_endpoint(ip: IpAddr, port: u16) -> String {
	match ip {
		IpAddr::V4(v4) => format!("{v4}:{port}"),
		IpAddr::V6(v6) => format!("[{v6}]:{port}"),
	}
}

/// Detect externally reachable `host:port` endpoints, deduplicated.
pub async fn detect_endpoints(listen_port: u16) -> Vec<String> {
	let mut endpoints = Vec::new();
	let mut add = |ip: IpAddr| {
		if !is_public(ip) {
			return;
		}
		let endpoint = format_endpoint(ip, listen_port);
		if !endpoints.contains(&endpoint) {
			endpoints.push(endpoint);
		}
	};

	// The kernel's pick for a public destination is the default egress
	// address; no packet is sent.
	if let Ok(socket) = std::net::UdpSocket::bind("0.0.0.0:0") {
		if socket.connect("8.8.8.8:80").is_ok() {
			if let Ok(local) = socket.local_addr() {
				add(local.ip());
			}
		}
	}

	let client = peerwan_common_http::new_client_with_timeout(FETCH_TIMEOUT);
	for service in PUBLIC_IP_SERVICES {
		match fetch_public_ip(&client, service).await {
			Some(ip) => add(ip),
			None => debug!(service, "public IP service unavailable"),
		}
	}
	endpoints
}

async fn fetch_public_ip(client: &reqwest::Client, url: &str) -> Option<IpAddr> {
	let body = client.get(url).send().await.ok()?.text().await.ok()?;
	let ip: IpAddr = body.trim().parse().ok()?;
	is_public(ip).then_some(ip)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn private_ranges_are_not_public() {
		for addr in ["10.0.0.1", "172.16.0.1", "192.168.1.1", "100.64.0.1", "169.254.1.1", "127.0.0.1"] {
			let ip: IpAddr = addr.parse().unwrap();
			assert!(!is_public(ip), "{addr} should be private");
		}
		assert!(!is_public("fc00::1".parse().unwrap()));
		assert!(!is_public("::".parse().unwrap()));
	}

	#[test]
	fn global_addresses_are_public() {
		assert!(is_public("203.0.113.9".parse().unwrap()));
		assert!(is_public("2001:db8::1".parse().unwrap()));
	}

	#[test]
	fn v6_endpoints_are_bracketed() {
		assert_eq!(
			format_endpoint("203.0.113.9".parse().unwrap(), 51820),
			"203.0.113.9:51820"
		);
		assert_eq!(
			format_endpoint("2001:db8::1".parse().unwrap(), 51820),
			"[2001:db8::1]:51820"
		);
	}
}
