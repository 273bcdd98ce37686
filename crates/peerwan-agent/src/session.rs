// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Long-lived message session with the controller.
//!
//! Dials the hub's websocket with the agent's credentials, dispatches
//! inbound envelopes (`plan`, `command`, `task`) to registered handlers —
//! each on its own task so a slow handler never blocks the read loop — and
//! drains a bounded log buffer upstream every couple of seconds. Disconnects
//! retry forever with a fixed backoff.

use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use peerwan_model::Envelope;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const LOG_FLUSH_INTERVAL: Duration = Duration::from_secs(2);
const LOG_BUFFER: usize = 200;
const LOG_BATCH: usize = 50;
const OUTBOUND_QUEUE: usize = 64;

pub type Handler = Arc<dyn Fn(Value) -> BoxFuture<'static, ()> + Send + Sync>;

/// Cloneable handle other components use to push logs and status envelopes
/// through the session.
#[derive(Clone)]
pub struct SessionHandle {
	logs: mpsc::Sender<String>,
	outbound: mpsc::Sender<Envelope>,
}

impl SessionHandle {
	/// Queue a log line for the next flush; drops when the buffer is full.
	pub fn push_log(&self, line: impl Into<String>) {
		let _ = self.logs.try_send(line.into());
	}

	/// Queue an envelope for delivery over the current connection.
	pub fn send(&self, envelope: Envelope) {
		let _ = self.outbound.try_send(envelope);
	}
}

pub struct SessionClient {
	url: String,
	auth_token: String,
	provision_token: String,
	node_id: String,
	handlers: HashMap<String, Handler>,
	logs_rx: mpsc::Receiver<String>,
	outbound_rx: mpsc::Receiver<Envelope>,
	handle: SessionHandle,
}

impl SessionClient {
	pub fn new(url: &str, node_id: &str, auth_token: &str, provision_token: &str) -> Self {
		let (logs_tx, logs_rx) = mpsc::channel(LOG_BUFFER);
		let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
		Self {
			url: url.to_string(),
			auth_token: auth_token.to_string(),
			provision_token: provision_token.to_string(),
			node_id: node_id.to_string(),
			handlers: HashMap::new(),
			logs_rx,
			outbound_rx,
			handle: SessionHandle {
				logs: logs_tx,
				outbound: outbound_tx,
			},
		}
	}

	pub fn handle(&self) -> SessionHandle {
		self.handle.clone()
	}

	/// Register the handler for an envelope type. One handler per type;
	/// later registrations replace earlier ones.
	pub fn on(&mut self, kind: &str, handler: Handler) {
		self.handlers.insert(kind.to_string(), handler);
	}

	/// Dial-dispatch-redial forever, until shutdown.
	pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
		loop {
			if *shutdown.borrow() {
				return;
			}
			let request = match self.build_request() {
				Ok(request) => request,
				Err(err) => {
					warn!(error = %err, "invalid session URL; session disabled");
					return;
				}
			};
			match connect_async(request).await {
				Ok((socket, _)) => {
					info!(url = %self.url, "session connected");
					self.serve_connection(socket, &mut shutdown).await;
					if *shutdown.borrow() {
						return;
					}
					info!("session disconnected; retrying in 5s");
				}
				Err(err) => {
					warn!(error = %err, url = %self.url, "session dial failed");
				}
			}
			tokio::select! {
				_ = shutdown.changed() => {
					if *shutdown.borrow() {
						return;
					}
				}
				_ = tokio::time::sleep(RECONNECT_DELAY) => {}
			}
		}
	}

	fn build_request(
		&self,
	) -> Result<tokio_tungstenite::tungstenite::handshake::client::Request, String> {
		let mut request = self
			.url
			.as_str()
			.into_client_request()
			.map_err(|err| err.to_string())?;
		if !self.auth_token.is_empty() {
			let value = format!("Bearer {}", self.auth_token)
				.parse()
				.map_err(|_| "invalid bearer token".to_string())?;
			request.headers_mut().insert("Authorization", value);
		}
		if !self.provision_token.is_empty() {
			let value = self
				.provision_token
				.parse()
				.map_err(|_| "invalid provision token".to_string())?;
			request.headers_mut().insert("X-Provision-Token", value);
		}
		Ok(request)
	}

	async fn serve_connection<S>(
		&mut self,
		socket: tokio_tungstenite::WebSocketStream<S>,
		shutdown: &mut watch::Receiver<bool>,
	) where
		S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
	{
		let (mut sink, mut stream) = socket.split();
		let mut flush_ticker = tokio::time::interval(LOG_FLUSH_INTERVAL);
		flush_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

		loop {
			tokio::select! {
				_ = shutdown.changed() => {
					if *shutdown.borrow() {
						let _ = sink.send(Message::Close(None)).await;
						return;
					}
				}
				envelope = self.outbound_rx.recv() => {
					let Some(envelope) = envelope else { return };
					if let Ok(text) = serde_json::to_string(&envelope) {
						if sink.send(Message::Text(text)).await.is_err() {
							return;
						}
					}
				}
				_ = flush_ticker.tick() => {
					let Some(envelope) = drain_logs(&mut self.logs_rx, &self.node_id) else {
						continue;
					};
					if let Ok(text) = serde_json::to_string(&envelope) {
						if sink.send(Message::Text(text)).await.is_err() {
							return;
						}
					}
				}
				inbound = stream.next() => {
					match inbound {
						Some(Ok(Message::Text(text))) => dispatch(&self.handlers, &text),
						Some(Ok(Message::Close(_))) | None => return,
						Some(Ok(_)) => {}
						Some(Err(err)) => {
							debug!(error = %err, "session read failed");
							return;
						}
					}
				}
			}
		}
	}
}

/// Batch buffered log lines into one `agent_log` envelope.
fn drain_logs(logs_rx: &mut mpsc::Receiver<String>, node_id: &str) -> Option<Envelope> {
	let mut lines = Vec::new();
	while lines.len() < LOG_BATCH {
		match logs_rx.try_recv() {
			Ok(line) => lines.push(line),
			Err(_) => break,
		}
	}
	if lines.is_empty() {
		return None;
	}
	Some(Envelope::new(
		"agent_log",
		node_id,
		serde_json::json!({
			"lines": lines,
			"ts": chrono::Utc::now().timestamp(),
		}),
	))
}

/// Decode and hand off to the registered handler, each invocation on its
/// own task so a slow handler never blocks reads.
fn dispatch(handlers: &HashMap<String, Handler>, text: &str) {
	let envelope: Envelope = match serde_json::from_str(text) {
		Ok(envelope) => envelope,
		Err(err) => {
			debug!(error = %err, "unparseable session message");
			return;
		}
	};
	debug!(kind = %envelope.kind, "session message received");
	match handlers.get(&envelope.kind) {
		Some(handler) => {
			let future = handler(envelope.payload);
			tokio::spawn(future);
		}
		None => debug!(kind = %envelope.kind, "no handler registered"),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::{AtomicUsize, Ordering};

	#[test]
	fn request_carries_auth_headers() {
		let client = SessionClient::new(
			"ws://ctrl:8080/api/v1/ws/agent?nodeId=edge-1",
			"edge-1",
			"jwt-token",
			"pt-9",
		);
		let request = client.build_request().unwrap();
		assert_eq!(
			request.headers().get("Authorization").unwrap(),
			"Bearer jwt-token"
		);
		assert_eq!(request.headers().get("X-Provision-Token").unwrap(), "pt-9");
	}

	#[test]
	fn log_drain_batches_up_to_fifty() {
		let mut client = SessionClient::new("ws://ctrl/api/v1/ws/agent", "edge-1", "", "pt-1");
		let handle = client.handle();
		for i in 0..60 {
			handle.push_log(format!("line {i}"));
		}
		let envelope = drain_logs(&mut client.logs_rx, &client.node_id).unwrap();
		assert_eq!(envelope.kind, "agent_log");
		assert_eq!(envelope.payload["lines"].as_array().unwrap().len(), LOG_BATCH);
		let rest = drain_logs(&mut client.logs_rx, &client.node_id).unwrap();
		assert_eq!(rest.payload["lines"].as_array().unwrap().len(), 10);
		assert!(drain_logs(&mut client.logs_rx, &client.node_id).is_none());
	}

	#[tokio::test]
	async fn dispatch_runs_registered_handler() {
		let mut client = SessionClient::new("ws://ctrl/api/v1/ws/agent", "edge-1", "", "pt-1");
		static HITS: AtomicUsize = AtomicUsize::new(0);
		client.on(
			"plan",
			Arc::new(|payload: Value| {
				Box::pin(async move {
					assert_eq!(payload["configVersion"], "dynamic-v9");
					HITS.fetch_add(1, Ordering::SeqCst);
				})
			}),
		);
		dispatch(
			&client.handlers,
			r#"{"type":"plan","payload":{"configVersion":"dynamic-v9"}}"#,
		);
		dispatch(&client.handlers, r#"{"type":"unknown","payload":{}}"#);
		tokio::time::sleep(Duration::from_millis(50)).await;
		assert_eq!(HITS.load(Ordering::SeqCst), 1);
	}
}
