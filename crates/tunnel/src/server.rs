//! Tunnel server lifecycle (spec §4.13, component C13): `Start`/`Stop`,
//! client table, cross-cutting glue between C10-C12.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::control::ControlServer;
use crate::registry::{PortRange, ServiceRegistry};
use crate::repository::{ServerRecord, ServerRepository, ServiceRepository};
use crate::reverse_proxy::{ClientMessenger, ReverseProxyEngine};

pub struct TunnelServerConfig {
	pub bind_addr: SocketAddr,
	pub port_range: PortRange,
	pub auth_tokens: HashMap<String, String>,
	/// Caller-supplied deadline for draining in-flight connections on `Stop`.
	pub shutdown_deadline: Duration,
}

impl Default for TunnelServerConfig {
	fn default() -> Self {
		Self {
			bind_addr: "0.0.0.0:7000".parse().unwrap(),
			port_range: PortRange::default(),
			auth_tokens: HashMap::new(),
			shutdown_deadline: Duration::from_secs(10),
		}
	}
}

struct RunningState {
	local_addr: SocketAddr,
	listener_cancel: CancellationToken,
	accept_task: JoinHandle<()>,
	heartbeat_task: JoinHandle<()>,
	client_tasks: Arc<RwLock<Vec<JoinHandle<()>>>>,
}

pub struct TunnelServer {
	cfg: TunnelServerConfig,
	control: Arc<ControlServer>,
	reverse_proxy: Arc<ReverseProxyEngine>,
	server_repo: Arc<dyn ServerRepository>,
	running: RwLock<Option<RunningState>>,
}

impl TunnelServer {
	pub fn new(
		cfg: TunnelServerConfig,
		service_repo: Arc<dyn ServiceRepository>,
		server_repo: Arc<dyn ServerRepository>,
	) -> Arc<Self> {
		let registry = Arc::new(ServiceRegistry::new(cfg.port_range, service_repo));

		// `ControlServer` needs a handle to the reverse proxy, and the reverse
		// proxy reaches back only through the narrow `ClientMessenger`
		// capability C10 itself implements (spec §9 one-directional wiring).
		// Built via `Arc::new_cyclic` so both sides can hold a real `Arc`
		// without either one owning the other.
		Arc::new_cyclic(|weak: &std::sync::Weak<TunnelServer>| {
			let weak = weak.clone();
			let reverse_proxy = Arc::new(ReverseProxyEngine::new(Arc::new(ControlMessengerHandle(weak))));
			let control = Arc::new(ControlServer::new(cfg.auth_tokens.clone(), registry, reverse_proxy.clone()));
			TunnelServer { cfg, control, reverse_proxy, server_repo, running: RwLock::new(None) }
		})
	}

	/// `Start` (spec §4.13): opens the control listener, spawns accept and
	/// heartbeat-checker tasks, persists `status=running`.
	pub async fn start(self: &Arc<Self>) -> std::io::Result<()> {
		let listener = TcpListener::bind(self.cfg.bind_addr).await?;
		let local_addr = listener.local_addr()?;
		let listener_cancel = CancellationToken::new();
		let client_tasks = Arc::new(RwLock::new(Vec::new()));

		let server = self.clone();
		let accept_cancel = listener_cancel.clone();
		let accept_tasks = client_tasks.clone();
		let accept_task = tokio::spawn(async move {
			loop {
				tokio::select! {
					_ = accept_cancel.cancelled() => return,
					accepted = listener.accept() => {
						let Ok((stream, _peer)) = accepted else { continue };
						let control = server.control.clone();
						let handle = tokio::spawn(async move { control.handle_connection(stream).await });
						accept_tasks.write().push(handle);
					}
				}
			}
		});

		let server = self.clone();
		let heartbeat_task = tokio::spawn(async move { server.control.run_heartbeat_checker().await });

		*self.running.write() = Some(RunningState { local_addr, listener_cancel, accept_task, heartbeat_task, client_tasks });

		let _ = self
			.server_repo
			.save(ServerRecord { instance_id: "tunnel-server".to_string(), status: "running".to_string(), start_time: Utc::now() })
			.await;
		Ok(())
	}

	/// `Stop` (spec §4.13): idempotent, ordered shutdown. Each step is a
	/// no-op if the previous one already ran or the server was never started.
	pub async fn stop(self: &Arc<Self>) {
		let state = self.running.write().take();
		let Some(state) = state else { return };

		state.listener_cancel.cancel();
		state.accept_task.abort();

		self.reverse_proxy.stop_all().await;
		// Cancelling here breaks every in-flight `run_control_loop` out of its
		// read select (spec §4.13 "close every client's control connection"),
		// so the drain below observes tasks actually winding down rather than
		// waiting on peers to disconnect.
		self.control.cancellation_token().cancel();

		let tasks: Vec<JoinHandle<()>> = state.client_tasks.write().drain(..).collect();
		let drain = async {
			for task in tasks {
				let _ = task.await;
			}
		};
		if tokio::time::timeout(self.cfg.shutdown_deadline, drain).await.is_err() {
			tracing::warn!("shutdown deadline elapsed before all client connections drained");
		}
		state.heartbeat_task.abort();

		let _ = self
			.server_repo
			.save(ServerRecord { instance_id: "tunnel-server".to_string(), status: "stopped".to_string(), start_time: Utc::now() })
			.await;
	}

	pub fn is_running(&self) -> bool {
		self.running.read().is_some()
	}

	/// The control listener's bound address, once `start` has succeeded.
	/// Useful when `bind_addr` requested an ephemeral port (`:0`).
	pub fn local_addr(&self) -> Option<SocketAddr> {
		self.running.read().as_ref().map(|s| s.local_addr)
	}
}

/// Adapts a `Weak<TunnelServer>` into the `ClientMessenger` capability so the
/// reverse proxy can call back into the control server without either side
/// owning the other (spec §9 "break via a one-directional wiring").
struct ControlMessengerHandle(std::sync::Weak<TunnelServer>);

#[async_trait::async_trait]
impl ClientMessenger for ControlMessengerHandle {
	async fn send_message_to_client(&self, client_id: &str, msg: crate::protocol::ControlMessage) -> anyhow::Result<()> {
		let server = self.0.upgrade().ok_or_else(|| anyhow::anyhow!("tunnel server has been dropped"))?;
		server.control.send_message_to_client(client_id, msg).await
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::repository::{InMemoryServerRepository, InMemoryServiceRepository};

	#[tokio::test]
	async fn start_then_stop_is_idempotent() {
		let cfg = TunnelServerConfig { bind_addr: "127.0.0.1:0".parse().unwrap(), ..Default::default() };
		let server = TunnelServer::new(cfg, Arc::new(InMemoryServiceRepository::default()), Arc::new(InMemoryServerRepository::default()));
		server.start().await.unwrap();
		assert!(server.is_running());
		server.stop().await;
		assert!(!server.is_running());
		// Second `stop` is a no-op, not a panic.
		server.stop().await;
	}
}
