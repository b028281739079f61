//! Reverse proxy engine (spec §4.12, component C12): per-service public
//! listener, connection pool, pending-connection table, bidirectional
//! bridging, pool maintenance loop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock as SyncRwLock;
use socket2::{SockRef, TcpKeepalive};
use tokio::io::copy_bidirectional;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::errors::TunnelError;
use crate::pool::ConnectionPool;
use crate::protocol::{ControlMessage, MessageType, PreConnectRequestData, ProxyRequestData};

const PENDING_TIMEOUT: Duration = Duration::from_secs(10);
const MAINTENANCE_TICK: Duration = Duration::from_secs(30);

/// Narrow capability the reverse proxy uses to reach the control server
/// (spec §9 "break via a one-directional wiring"): C12 never holds a
/// handle back to C10 beyond this.
#[async_trait]
pub trait ClientMessenger: Send + Sync {
	async fn send_message_to_client(&self, client_id: &str, msg: ControlMessage) -> anyhow::Result<()>;
}

#[derive(Default)]
pub struct ServiceCounters {
	pub active: AtomicU64,
	pub total: AtomicU64,
	pub bytes_in: AtomicU64,
	pub bytes_out: AtomicU64,
}

struct ServiceProxyState {
	service_id: String,
	client_id: String,
	pool: ConnectionPool,
	counters: ServiceCounters,
	cancel: CancellationToken,
}

/// A public-side connection waiting for its matching client data
/// connection (spec §3 ProxyConnection).
struct PendingEntry {
	tx: oneshot::Sender<TcpStream>,
}

pub struct ReverseProxyEngine {
	messenger: Arc<dyn ClientMessenger>,
	services: SyncRwLock<HashMap<String, Arc<ServiceProxyState>>>,
	pending: AsyncMutex<HashMap<String, PendingEntry>>,
	cancel: CancellationToken,
}

impl ReverseProxyEngine {
	pub fn new(messenger: Arc<dyn ClientMessenger>) -> Self {
		Self {
			messenger,
			services: SyncRwLock::new(HashMap::new()),
			pending: AsyncMutex::new(HashMap::new()),
			cancel: CancellationToken::new(),
		}
	}

	/// Opens the public listener for a newly registered service and spawns
	/// its accept loop + pool-maintenance loop (spec §4.12).
	pub async fn start_service(
		self: &Arc<Self>,
		service_id: &str,
		client_id: &str,
		remote_port: u16,
	) -> std::io::Result<()> {
		let listener = TcpListener::bind(("0.0.0.0", remote_port)).await?;
		let state = Arc::new(ServiceProxyState {
			service_id: service_id.to_string(),
			client_id: client_id.to_string(),
			pool: ConnectionPool::default(),
			counters: ServiceCounters::default(),
			cancel: self.cancel.child_token(),
		});
		self.services.write().insert(service_id.to_string(), state.clone());

		let engine = self.clone();
		let accept_state = state.clone();
		tokio::spawn(async move { engine.accept_loop(listener, accept_state).await });

		let engine = self.clone();
		let maint_state = state.clone();
		tokio::spawn(async move { engine.maintenance_loop(maint_state).await });

		Ok(())
	}

	/// Shutdown for a single service (spec §4.12 "Shutdown").
	pub async fn stop_service(&self, service_id: &str) {
		let state = self.services.write().remove(service_id);
		if let Some(state) = state {
			state.cancel.cancel();
			state.pool.drain().await;
		}
	}

	async fn accept_loop(self: Arc<Self>, listener: TcpListener, state: Arc<ServiceProxyState>) {
		loop {
			tokio::select! {
				_ = state.cancel.cancelled() => return,
				accepted = listener.accept() => {
					let Ok((conn, _peer)) = accepted else { continue };
					configure_tunnel_socket(&conn);
					let engine = self.clone();
					let state = state.clone();
					tokio::spawn(async move { engine.handle_public_connection(state, conn).await });
				}
			}
		}
	}

	async fn maintenance_loop(self: Arc<Self>, state: Arc<ServiceProxyState>) {
		let mut tick = tokio::time::interval(MAINTENANCE_TICK);
		loop {
			tokio::select! {
				_ = state.cancel.cancelled() => return,
				_ = tick.tick() => {
					let needed = state.pool.maintain().await;
					for _ in 0..needed {
						let msg = ControlMessage::new(
							MessageType::PreConnectRequest,
							serde_json::to_value(PreConnectRequestData { service_id: state.service_id.clone(), pooled: true }).unwrap(),
						);
						if let Err(e) = self.messenger.send_message_to_client(&state.client_id, msg).await {
							tracing::warn!(service_id = %state.service_id, error = %e, "failed to request pool refill");
						}
					}
				}
			}
		}
	}

	async fn handle_public_connection(&self, state: Arc<ServiceProxyState>, public_conn: TcpStream) {
		state.counters.active.fetch_add(1, Ordering::Relaxed);
		state.counters.total.fetch_add(1, Ordering::Relaxed);

		let data_conn = if let Some(conn) = state.pool.try_pop().await {
			Some(conn)
		} else {
			match self.request_and_wait(&state, public_conn.peer_addr().ok()).await {
				Ok(conn) => Some(conn),
				Err(e) => {
					tracing::debug!(error = %e, service_id = %state.service_id, "no data connection available for public connection");
					None
				},
			}
		};

		let data_conn = match data_conn {
			Some(conn) => conn,
			None => {
				state.counters.active.fetch_sub(1, Ordering::Relaxed);
				return;
			},
		};

		let (bytes_a, bytes_b) = self.bridge(public_conn, data_conn, &state).await;
		state.counters.bytes_in.fetch_add(bytes_a, Ordering::Relaxed);
		state.counters.bytes_out.fetch_add(bytes_b, Ordering::Relaxed);
		state.counters.active.fetch_sub(1, Ordering::Relaxed);
	}

	/// Waits for a fresh data connection via the `proxy_request` handshake
	/// (spec §4.12 steps 3-4): 10s timeout, removing the pending entry
	/// either way.
	async fn request_and_wait(&self, state: &Arc<ServiceProxyState>, _peer: Option<std::net::SocketAddr>) -> Result<TcpStream, TunnelError> {
		let connection_id = Uuid::new_v4().to_string();
		let (tx, rx) = oneshot::channel();
		self.pending.lock().await.insert(connection_id.clone(), PendingEntry { tx });

		let msg = ControlMessage::new(
			MessageType::ProxyRequest,
			serde_json::to_value(ProxyRequestData {
				service_id: state.service_id.clone(),
				connection_id: connection_id.clone(),
				local_address: String::new(),
				local_port: 0,
			})
			.unwrap(),
		);
		if let Err(e) = self.messenger.send_message_to_client(&state.client_id, msg).await {
			tracing::warn!(error = %e, "failed to send proxy_request");
			self.pending.lock().await.remove(&connection_id);
			return Err(TunnelError::ProxyTimeout);
		}

		let result = tokio::select! {
			res = rx => res.ok().ok_or(TunnelError::ProxyTimeout),
			_ = tokio::time::sleep(PENDING_TIMEOUT) => Err(TunnelError::ProxyTimeout),
			_ = state.cancel.cancelled() => Err(TunnelError::ServerShuttingDown),
		};
		self.pending.lock().await.remove(&connection_id);
		result
	}

	/// Receiving a client data connection (spec §4.12 "Receiving a client
	/// data connection"): probe the pending table first, then fall back to
	/// treating the identifier as a `serviceId` pool hint.
	pub async fn handle_client_data_connection(&self, connection_id: &str, conn: TcpStream) {
		let pending = self.pending.lock().await.remove(connection_id);
		if let Some(entry) = pending {
			if entry.tx.send(conn).is_err() {
				tracing::debug!(connection_id, "pending waiter already gave up");
			}
			return;
		}

		let service = self.services.read().get(connection_id).cloned();
		match service {
			Some(state) => {
				if state.pool.try_push(conn).await.is_err() {
					tracing::debug!(service_id = %connection_id, "pool full, closing spare data connection");
				}
			},
			None => {
				tracing::debug!(connection_id, "data connection matches neither a pending entry nor a known service; closing");
			},
		}
	}

	async fn bridge(&self, mut public_conn: TcpStream, mut data_conn: TcpStream, state: &Arc<ServiceProxyState>) -> (u64, u64) {
		let result = copy_bidirectional(&mut public_conn, &mut data_conn).await;
		let (a, b) = result.unwrap_or((0, 0));
		drop(public_conn);
		if state.pool.try_push(data_conn).await.is_err() {
			tracing::debug!(service_id = %state.service_id, "pool full after bridging, closing data connection");
		}
		(a, b)
	}

	/// Server-wide shutdown (spec §4.13 "Stop C12 (prevent new proxy
	/// requests)").
	pub async fn stop_all(&self) {
		self.cancel.cancel();
		let services: Vec<Arc<ServiceProxyState>> = self.services.write().drain().map(|(_, v)| v).collect();
		for state in services {
			state.pool.drain().await;
		}
	}
}

fn configure_tunnel_socket(conn: &TcpStream) {
	let sock = SockRef::from(conn);
	let keepalive = TcpKeepalive::new().with_time(Duration::from_secs(30));
	let _ = sock.set_tcp_keepalive(&keepalive);
	let _ = conn.set_nodelay(true);
}

#[cfg(test)]
mod tests {
	use super::*;

	struct RecordingMessenger {
		sent: AsyncMutex<Vec<ControlMessage>>,
	}

	#[async_trait]
	impl ClientMessenger for RecordingMessenger {
		async fn send_message_to_client(&self, _client_id: &str, msg: ControlMessage) -> anyhow::Result<()> {
			self.sent.lock().await.push(msg);
			Ok(())
		}
	}

	impl ReverseProxyEngine {
		fn insert_service_for_test(&self, service_id: &str) {
			self.services.write().insert(
				service_id.to_string(),
				Arc::new(ServiceProxyState {
					service_id: service_id.to_string(),
					client_id: "client-1".to_string(),
					pool: ConnectionPool::default(),
					counters: ServiceCounters::default(),
					cancel: self.cancel.child_token(),
				}),
			);
		}
	}

	async fn connected_pair() -> (TcpStream, TcpStream) {
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();
		let (client, (server, _)) = tokio::join!(TcpStream::connect(addr), listener.accept());
		(client.unwrap(), server)
	}

	/// Spec §8 invariant 4: a `data_connection` whose `connectionId` matches
	/// a pending entry always bridges to exactly that waiter.
	#[tokio::test]
	async fn matching_connection_id_resolves_the_pending_waiter() {
		let messenger = Arc::new(RecordingMessenger { sent: AsyncMutex::new(Vec::new()) });
		let engine = Arc::new(ReverseProxyEngine::new(messenger.clone()));
		engine.insert_service_for_test("svc-1");
		let state = engine.services.read().get("svc-1").unwrap().clone();

		let engine2 = engine.clone();
		let state2 = state.clone();
		let waiter = tokio::spawn(async move { engine2.request_and_wait(&state2, None).await });

		// Give the waiter a moment to register its pending entry, then
		// discover the connectionId it advertised via the mocked messenger.
		tokio::time::sleep(Duration::from_millis(20)).await;
		let sent = messenger.sent.lock().await;
		let msg = sent.last().expect("proxy_request should have been sent");
		let data: ProxyRequestData = serde_json::from_value(msg.data.clone()).unwrap();
		drop(sent);

		let (_client, server) = connected_pair().await;
		engine.handle_client_data_connection(&data.connection_id, server).await;

		let resolved = waiter.await.unwrap();
		assert!(resolved.is_ok());
	}

	/// Spec §4.12 "Receiving a client data connection": an unmatched
	/// identifier is treated as a `serviceId` pool hint.
	#[tokio::test]
	async fn unmatched_connection_id_falls_back_to_service_pool() {
		let messenger = Arc::new(RecordingMessenger { sent: AsyncMutex::new(Vec::new()) });
		let engine = ReverseProxyEngine::new(messenger);
		engine.insert_service_for_test("svc-pool");

		let (_client, server) = connected_pair().await;
		engine.handle_client_data_connection("svc-pool", server).await;

		let state = engine.services.read().get("svc-pool").unwrap().clone();
		assert_eq!(state.pool.current_size(), 1);
	}

	#[tokio::test]
	async fn unmatched_connection_id_with_no_service_is_dropped() {
		let messenger = Arc::new(RecordingMessenger { sent: AsyncMutex::new(Vec::new()) });
		let engine = ReverseProxyEngine::new(messenger);
		let (_client, server) = connected_pair().await;
		// No panics, no pending entry, no pool: the connection is simply closed.
		engine.handle_client_data_connection("nothing-matches", server).await;
	}
}
