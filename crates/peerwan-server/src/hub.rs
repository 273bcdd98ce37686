// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Websocket hub: one live connection per agent, keyed by node id, plus
//! per-node UI log subscribers and an in-memory buffer of task step updates.

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use peerwan_model::Envelope;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch, RwLock};
use tracing::{debug, info, warn};

const OUTBOUND_QUEUE: usize = 64;
const LOG_CHANNEL_CAPACITY: usize = 64;
const TASK_UPDATE_LIMIT: usize = 100;

struct AgentConn {
	tx: mpsc::Sender<Envelope>,
	conn_id: u64,
	cancel: watch::Sender<bool>,
}

/// Connection registry shared by the HTTP handlers and the plan service.
pub struct Hub {
	agents: RwLock<HashMap<String, AgentConn>>,
	log_subs: RwLock<HashMap<String, broadcast::Sender<Value>>>,
	task_updates: RwLock<HashMap<String, Vec<Envelope>>>,
	conn_counter: AtomicU64,
}

impl Hub {
	pub fn new() -> Self {
		Self {
			agents: RwLock::new(HashMap::new()),
			log_subs: RwLock::new(HashMap::new()),
			task_updates: RwLock::new(HashMap::new()),
			conn_counter: AtomicU64::new(0),
		}
	}

	/// Deliver an envelope to a connected agent. Returns false (with a log
	/// line, never an error) when the node has no live connection.
	pub async fn send(&self, node_id: &str, envelope: Envelope) -> bool {
		let agents = self.agents.read().await;
		match agents.get(node_id) {
			Some(conn) => match conn.tx.try_send(envelope) {
				Ok(()) => true,
				Err(err) => {
					warn!(node_id, error = %err, "agent send queue rejected message");
					false
				}
			},
			None => {
				debug!(node_id, "send skipped; agent not connected");
				false
			}
		}
	}

	pub async fn connected_nodes(&self) -> Vec<String> {
		self.agents.read().await.keys().cloned().collect()
	}

	/// Serve an upgraded agent socket until it closes or is replaced by a
	/// newer connection for the same node id.
	pub async fn run_agent_connection(self: &Arc<Self>, socket: WebSocket, node_id: String) {
		let conn_id = self.conn_counter.fetch_add(1, Ordering::Relaxed) + 1;
		let (tx, mut rx) = mpsc::channel::<Envelope>(OUTBOUND_QUEUE);
		let (cancel_tx, mut cancel_rx) = watch::channel(false);
		{
			let mut agents = self.agents.write().await;
			if let Some(old) = agents.insert(
				node_id.clone(),
				AgentConn {
					tx,
					conn_id,
					cancel: cancel_tx,
				},
			) {
				info!(node_id = %node_id, "replacing existing agent connection");
				let _ = old.cancel.send(true);
			}
		}
		info!(node_id = %node_id, "agent connected");

		let (mut sink, mut stream) = socket.split();
		let writer_node = node_id.clone();
		let writer = tokio::spawn(async move {
			while let Some(envelope) = rx.recv().await {
				let text = match serde_json::to_string(&envelope) {
					Ok(text) => text,
					Err(err) => {
						warn!(node_id = %writer_node, error = %err, "failed to encode envelope");
						continue;
					}
				};
				if let Err(err) = sink.send(Message::Text(text.into())).await {
					debug!(node_id = %writer_node, error = %err, "agent write failed");
					break;
				}
			}
		});

		loop {
			tokio::select! {
				_ = cancel_rx.changed() => {
					if *cancel_rx.borrow() {
						break;
					}
				}
				inbound = stream.next() => {
					match inbound {
						Some(Ok(Message::Text(text))) => {
							match serde_json::from_str::<Envelope>(&text) {
								Ok(envelope) => self.dispatch(&node_id, envelope).await,
								Err(err) => debug!(node_id = %node_id, error = %err, "unparseable agent message"),
							}
						}
						Some(Ok(Message::Close(_))) | None => break,
						Some(Ok(_)) => {}
						Some(Err(err)) => {
							debug!(node_id = %node_id, error = %err, "agent read failed");
							break;
						}
					}
				}
			}
		}

		writer.abort();
		let mut agents = self.agents.write().await;
		if agents.get(&node_id).map(|c| c.conn_id) == Some(conn_id) {
			agents.remove(&node_id);
			info!(node_id = %node_id, "agent disconnected");
		}
	}

	async fn dispatch(&self, node_id: &str, envelope: Envelope) {
		match envelope.kind.as_str() {
			"agent_log" => self.fanout_logs(node_id, envelope.payload).await,
			"task_step" => self.record_task_step(envelope).await,
			// Agents also persist these over HTTP; the hub treats them as opaque.
			"install_status" | "diag_result" => {
				debug!(node_id, kind = %envelope.kind, "status envelope received");
			}
			other => debug!(node_id, kind = other, "ignoring unknown envelope type"),
		}
	}

	async fn fanout_logs(&self, node_id: &str, payload: Value) {
		let subs = self.log_subs.read().await;
		if let Some(sender) = subs.get(node_id) {
			let _ = sender.send(payload);
		}
	}

	async fn record_task_step(&self, envelope: Envelope) {
		let Some(task_id) = envelope
			.payload
			.get("taskId")
			.and_then(Value::as_str)
			.map(str::to_string)
		else {
			return;
		};
		let mut updates = self.task_updates.write().await;
		let list = updates.entry(task_id).or_default();
		list.push(envelope);
		if list.len() > TASK_UPDATE_LIMIT {
			let excess = list.len() - TASK_UPDATE_LIMIT;
			list.drain(..excess);
		}
	}

	pub async fn task_updates(&self, task_id: &str) -> Vec<Envelope> {
		self
			.task_updates
			.read()
			.await
			.get(task_id)
			.cloned()
			.unwrap_or_default()
	}

	async fn subscribe_logs(&self, node_id: &str) -> broadcast::Receiver<Value> {
		let mut subs = self.log_subs.write().await;
		match subs.get(node_id) {
			Some(sender) => sender.subscribe(),
			None => {
				let (tx, rx) = broadcast::channel(LOG_CHANNEL_CAPACITY);
				subs.insert(node_id.to_string(), tx);
				rx
			}
		}
	}

	/// Serve a UI log subscription socket: forward this node's `agent_log`
	/// payloads until the subscriber goes away.
	pub async fn run_log_subscriber(self: &Arc<Self>, socket: WebSocket, node_id: String) {
		let mut rx = self.subscribe_logs(&node_id).await;
		let (mut sink, mut stream) = socket.split();
		debug!(node_id = %node_id, "ui log subscriber connected");
		loop {
			tokio::select! {
				payload = rx.recv() => {
					match payload {
						Ok(payload) => {
							let Ok(text) = serde_json::to_string(&payload) else {
								continue;
							};
							if sink.send(Message::Text(text.into())).await.is_err() {
								break;
							}
						}
						Err(broadcast::error::RecvError::Lagged(skipped)) => {
							debug!(node_id = %node_id, skipped, "log subscriber lagging");
						}
						Err(broadcast::error::RecvError::Closed) => break,
					}
				}
				inbound = stream.next() => {
					match inbound {
						Some(Ok(Message::Close(_))) | None => break,
						Some(Err(_)) => break,
						Some(Ok(_)) => {}
					}
				}
			}
		}
		debug!(node_id = %node_id, "ui log subscriber disconnected");
	}
}

impl Default for Hub {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn send_without_connection_is_a_noop() {
		let hub = Hub::new();
		let delivered = hub
			.send("edge-1", Envelope::new("plan", "edge-1", Value::Null))
			.await;
		assert!(!delivered);
	}

	#[tokio::test]
	async fn task_steps_buffer_by_task_id_and_are_bounded() {
		let hub = Hub::new();
		for i in 0..110 {
			hub.record_task_step(Envelope::new(
				"task_step",
				"edge-1",
				serde_json::json!({"taskId": "t1", "step": i}),
			))
			.await;
		}
		// Steps without a task id are dropped.
		hub.record_task_step(Envelope::new("task_step", "edge-1", serde_json::json!({})))
			.await;

		let updates = hub.task_updates("t1").await;
		assert_eq!(updates.len(), TASK_UPDATE_LIMIT);
		assert_eq!(updates.last().unwrap().payload["step"], 109);
		assert!(hub.task_updates("t2").await.is_empty());
	}

	#[tokio::test]
	async fn log_fanout_reaches_subscribers() {
		let hub = Hub::new();
		let mut rx = hub.subscribe_logs("edge-1").await;
		hub.fanout_logs("edge-1", serde_json::json!({"lines": ["hello"]}))
			.await;
		let payload = rx.recv().await.unwrap();
		assert_eq!(payload["lines"][0], "hello");
	}
}
