//! Control server (spec §4.10, component C10): accept, classify (control vs
//! data), auth, heartbeat, and routing of register/unregister to C11/C12.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;

use crate::codec::{read_frame, write_frame};
use crate::errors::TunnelError;
use crate::protocol::{
	AuthReply, ControlMessage, DataConnectionData, MessageType, RegisterServiceReply, RegisterServiceRequest,
};
use crate::registry::ServiceRegistry;
use crate::reverse_proxy::{ClientMessenger, ReverseProxyEngine};

pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(30);
const HEARTBEAT_TICK: Duration = Duration::from_secs(10);

struct ClientConn {
	writer: Arc<AsyncMutex<tokio::net::tcp::OwnedWriteHalf>>,
	last_activity: Mutex<Instant>,
}

/// `activeConns` (spec §4.10): per-connection writer mutex so concurrent
/// `SendMessageToClient` calls to the same client serialize their frames.
pub struct ControlServer {
	active: RwLock<HashMap<String, Arc<ClientConn>>>,
	auth_tokens: HashMap<String, String>,
	registry: Arc<ServiceRegistry>,
	reverse_proxy: Arc<ReverseProxyEngine>,
	cancel: CancellationToken,
}

#[derive(Debug, Deserialize)]
struct TolerantFrame {
	#[serde(rename = "type")]
	kind: String,
	#[serde(default, rename = "sessionId")]
	#[allow(dead_code)]
	session_id: Option<String>,
	#[serde(default)]
	data: Value,
}

impl ControlServer {
	pub fn new(auth_tokens: HashMap<String, String>, registry: Arc<ServiceRegistry>, reverse_proxy: Arc<ReverseProxyEngine>) -> Self {
		Self { active: RwLock::new(HashMap::new()), auth_tokens, registry, reverse_proxy, cancel: CancellationToken::new() }
	}

	pub fn cancellation_token(&self) -> CancellationToken {
		self.cancel.clone()
	}

	/// Heartbeat checker task (spec §4.10, 10s tick).
	pub async fn run_heartbeat_checker(&self) {
		let mut tick = tokio::time::interval(HEARTBEAT_TICK);
		loop {
			tokio::select! {
				_ = self.cancel.cancelled() => return,
				_ = tick.tick() => self.evict_stale_clients().await,
			}
		}
	}

	async fn evict_stale_clients(&self) {
		let stale: Vec<String> = {
			let active = self.active.read();
			active
				.iter()
				.filter(|(_, conn)| conn.last_activity.lock().elapsed() > HEARTBEAT_TIMEOUT)
				.map(|(id, _)| id.clone())
				.collect()
		};
		for client_id in stale {
			tracing::info!(client_id, "evicting client after heartbeat timeout");
			self.evict_client(&client_id).await;
		}
	}

	/// Mirrors `handle_unregister`'s teardown: both paths must tear down the
	/// reverse proxy's public listener/pool for each of the client's
	/// services, not just the registry's own bookkeeping, or the service
	/// stays bound and "online" from the public port's perspective forever.
	async fn evict_client(&self, client_id: &str) {
		for service_id in self.registry.services_for_client(client_id) {
			self.reverse_proxy.stop_service(&service_id).await;
		}
		self.registry.unregister_client(client_id).await;
		self.active.write().remove(client_id);
	}

	/// Per-connection loop (spec §4.10 steps 1-5). The first frame decides
	/// whether this stream is a control connection or a bare data handoff.
	pub async fn handle_connection(&self, mut stream: TcpStream) {
		let first = match read_frame(&mut stream).await {
			Ok(bytes) => bytes,
			Err(e) => {
				let err = TunnelError::Frame(e);
				tracing::debug!(error = %err, closes_connection = err.closes_connection(), "failed to read first frame, closing connection");
				return;
			},
		};
		let Ok(frame) = serde_json::from_slice::<TolerantFrame>(&first) else {
			let err = TunnelError::BadMessage("first frame was not valid JSON".into());
			tracing::debug!(error = %err, closes_connection = err.closes_connection(), "closing connection");
			return;
		};

		if frame.kind == "data_connection" {
			let Ok(data) = serde_json::from_value::<DataConnectionData>(frame.data) else {
				tracing::debug!("malformed data_connection frame, closing connection");
				return;
			};
			self.reverse_proxy.handle_client_data_connection(&data.connection_id, stream).await;
			return;
		}

		self.run_control_loop(stream, frame).await;
	}

	async fn run_control_loop(&self, stream: TcpStream, first_frame: TolerantFrame) {
		let (mut read_half, write_half) = stream.into_split();
		let writer = Arc::new(AsyncMutex::new(write_half));
		let mut client_id: Option<String> = None;
		let mut frame = Some(first_frame);

		loop {
			let frame = match frame.take() {
				Some(f) => f,
				None => {
					// Select against the server's shutdown signal so `Stop` (spec
					// §4.13) can close this connection's read loop promptly instead
					// of waiting for the peer to disconnect or time out.
					let read = tokio::select! {
						biased;
						_ = self.cancel.cancelled() => None,
						res = read_frame(&mut read_half) => Some(res),
					};
					match read {
						None => break,
						Some(Ok(bytes)) => match serde_json::from_slice::<TolerantFrame>(&bytes) {
							Ok(f) => f,
							Err(_) => {
								let err = TunnelError::BadMessage("malformed control message".into());
								tracing::debug!(error = %err, closes_connection = err.closes_connection(), "closing connection");
								self.send_error(&writer, "malformed control message").await;
								break;
							},
						},
						Some(Err(e)) => {
							let err = TunnelError::Frame(e);
							tracing::debug!(error = %err, closes_connection = err.closes_connection(), "closing connection");
							break;
						},
					}
				},
			};

			if let Some(id) = &client_id {
				if let Some(conn) = self.active.read().get(id) {
					*conn.last_activity.lock() = Instant::now();
				}
			}

			match frame.kind.as_str() {
				"auth" => {
					if let Err(e) = self.handle_auth(frame.data, &writer, &mut client_id).await {
						tracing::debug!(error = %e, closes_connection = e.closes_connection(), "auth failed");
						break;
					}
				},
				"heartbeat" => self.handle_heartbeat(&client_id, &writer).await,
				"register_service" => self.handle_register(&client_id, frame.data, &writer).await,
				"unregister_service" => self.handle_unregister(&client_id, frame.data, &writer).await,
				other => {
					tracing::debug!(kind = other, "unknown control message type");
					self.send_error(&writer, "unknown message type").await;
				},
			}
		}

		if let Some(id) = client_id {
			self.evict_client(&id).await;
		}
	}

	async fn handle_auth(
		&self,
		data: Value,
		writer: &Arc<AsyncMutex<tokio::net::tcp::OwnedWriteHalf>>,
		client_id_slot: &mut Option<String>,
	) -> Result<(), TunnelError> {
		#[derive(Deserialize)]
		struct AuthData {
			#[serde(rename = "clientId")]
			client_id: String,
			token: String,
		}
		let Ok(auth) = serde_json::from_value::<AuthData>(data) else {
			self.send_reply(writer, AuthReply { success: false, message: "malformed auth frame".into() }).await;
			return Err(TunnelError::BadMessage("malformed auth frame".into()));
		};
		let expected = self.auth_tokens.get(&auth.client_id);
		let ok = expected.is_some_and(|t| constant_time_eq(t.as_bytes(), auth.token.as_bytes()));
		if !ok {
			self.send_reply(writer, AuthReply { success: false, message: "authentication rejected".into() }).await;
			return Err(TunnelError::AuthRejected(auth.client_id));
		}
		self.active.write().insert(
			auth.client_id.clone(),
			Arc::new(ClientConn { writer: writer.clone(), last_activity: Mutex::new(Instant::now()) }),
		);
		*client_id_slot = Some(auth.client_id);
		self.send_reply(writer, AuthReply { success: true, message: "authenticated".into() }).await;
		Ok(())
	}

	async fn handle_heartbeat(&self, client_id: &Option<String>, writer: &Arc<AsyncMutex<tokio::net::tcp::OwnedWriteHalf>>) {
		if client_id.is_none() {
			self.send_reply(writer, AuthReply { success: false, message: "not authenticated".into() }).await;
			return;
		}
		self.send_reply(writer, AuthReply { success: true, message: "heartbeat received".into() }).await;
	}

	async fn handle_register(&self, client_id: &Option<String>, data: Value, writer: &Arc<AsyncMutex<tokio::net::tcp::OwnedWriteHalf>>) {
		let Some(client_id) = client_id else {
			self.send_reply(writer, RegisterServiceReply { success: false, service_id: None, remote_port: None, message: Some("not authenticated".into()) }).await;
			return;
		};
		#[derive(Deserialize)]
		struct RegisterData {
			service: RegisterServiceRequest,
		}
		let Ok(payload) = serde_json::from_value::<RegisterData>(data) else {
			self.send_reply(writer, RegisterServiceReply { success: false, service_id: None, remote_port: None, message: Some("malformed register_service frame".into()) }).await;
			return;
		};
		let service_id = uuid::Uuid::new_v4().to_string();
		match self.registry.register(client_id, service_id.clone(), payload.service).await {
			Ok(port) => {
				if let Err(e) = self.reverse_proxy.start_service(&service_id, client_id, port).await {
					tracing::warn!(error = %e, "failed to bind public listener after registration");
					self.registry.unregister(&service_id).await;
					self.send_reply(writer, RegisterServiceReply { success: false, service_id: None, remote_port: None, message: Some(e.to_string()) }).await;
					return;
				}
				self.send_reply(writer, RegisterServiceReply { success: true, service_id: Some(service_id), remote_port: Some(port), message: None }).await;
			},
			Err(e) => {
				let err = TunnelError::from(e);
				self.send_reply(writer, RegisterServiceReply { success: false, service_id: None, remote_port: None, message: Some(err.to_string()) }).await;
			},
		}
	}

	async fn handle_unregister(&self, client_id: &Option<String>, data: Value, writer: &Arc<AsyncMutex<tokio::net::tcp::OwnedWriteHalf>>) {
		if client_id.is_none() {
			self.send_reply(writer, AuthReply { success: false, message: "not authenticated".into() }).await;
			return;
		}
		#[derive(Deserialize)]
		struct UnregisterData {
			#[serde(rename = "serviceName")]
			service_name: String,
		}
		let Ok(payload) = serde_json::from_value::<UnregisterData>(data) else {
			self.send_reply(writer, AuthReply { success: false, message: "malformed unregister_service frame".into() }).await;
			return;
		};
		match self.registry.find_service_id_by_name(client_id, &payload.service_name) {
			Some(service_id) => {
				self.reverse_proxy.stop_service(&service_id).await;
				self.registry.unregister(&service_id).await;
				self.send_reply(writer, AuthReply { success: true, message: "unregistered".into() }).await;
			},
			None => {
				self.send_reply(writer, AuthReply { success: false, message: "no such service for this client".into() }).await;
			},
		}
	}

	async fn send_reply<T: serde::Serialize>(&self, writer: &Arc<AsyncMutex<tokio::net::tcp::OwnedWriteHalf>>, body: T) {
		let msg = ControlMessage::new(MessageType::Response, serde_json::to_value(body).unwrap_or(Value::Null));
		let Ok(bytes) = msg.to_frame_bytes() else { return };
		let mut w = writer.lock().await;
		if let Err(e) = write_frame(&mut *w, &bytes).await {
			tracing::debug!(error = %e, "failed to write reply frame");
		}
	}

	async fn send_error(&self, writer: &Arc<AsyncMutex<tokio::net::tcp::OwnedWriteHalf>>, message: &str) {
		let msg = ControlMessage::new(MessageType::Error, serde_json::json!({ "message": message }));
		if let Ok(bytes) = msg.to_frame_bytes() {
			let mut w = writer.lock().await;
			let _ = write_frame(&mut *w, &bytes).await;
		}
	}
}

#[async_trait]
impl ClientMessenger for ControlServer {
	async fn send_message_to_client(&self, client_id: &str, msg: ControlMessage) -> anyhow::Result<()> {
		let conn = self
			.active
			.read()
			.get(client_id)
			.cloned()
			.ok_or_else(|| anyhow::anyhow!("client {client_id:?} is not connected"))?;
		let bytes = msg.to_frame_bytes()?;
		let mut w = conn.writer.lock().await;
		write_frame(&mut *w, &bytes).await?;
		Ok(())
	}
}

/// Constant-time comparison for auth tokens (spec §4.10 "compare token to
/// server config (constant-time comparison recommended)").
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
	if a.len() != b.len() {
		return false;
	}
	let mut diff = 0u8;
	for (x, y) in a.iter().zip(b.iter()) {
		diff |= x ^ y;
	}
	diff == 0
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn constant_time_eq_matches_equal_slices() {
		assert!(constant_time_eq(b"token-a", b"token-a"));
		assert!(!constant_time_eq(b"token-a", b"token-b"));
		assert!(!constant_time_eq(b"short", b"longer-token"));
	}
}
