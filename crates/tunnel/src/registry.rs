//! Tunnel service registry (spec §4.11, component C11): validates service
//! configs, allocates/releases public ports in a range, maintains
//! client↔service↔port indices, persists through a repository.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr, TcpListener, UdpSocket};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::protocol::{RegisterServiceRequest, ServiceType};
use crate::repository::{RepositoryError, ServiceRepository};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
	pub min: u16,
	pub max: u16,
}

impl Default for PortRange {
	fn default() -> Self {
		Self { min: 10000, max: 20000 }
	}
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
	#[error("service name must not be empty")]
	EmptyServiceName,
	#[error("unknown service type {0:?}")]
	UnknownServiceType(String),
	#[error("local port {0} is outside [1,65535]")]
	InvalidLocalPort(u32),
	#[error("remote port {0} is outside [1,65535]")]
	InvalidRemotePort(u32),
	#[error("local address {0:?} is neither a numeric IP, \"localhost\", nor resolvable")]
	InvalidLocalAddress(String),
	#[error("http/https services require customDomains or subDomain")]
	MissingDomainBinding,
	#[error("requested port {0} is already taken")]
	PortTaken(u16),
	#[error("no free port in range [{0},{1}]")]
	PortExhausted(u16, u16),
	#[error("service {0:?} not found")]
	ServiceNotFound(String),
	#[error("persistence rejected the registration: {0}")]
	PersistenceFailed(#[from] RepositoryError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelServiceRecord {
	pub service_id: String,
	pub client_id: String,
	pub service_name: String,
	pub service_type: ServiceType,
	pub local_address: String,
	pub local_port: u16,
	pub remote_port: Option<u16>,
	pub status: String,
	pub registered_time: DateTime<Utc>,
}

impl TunnelServiceRecord {
	#[cfg(test)]
	pub fn new_for_test(service_id: &str, client_id: &str, status: &str) -> Self {
		Self {
			service_id: service_id.to_string(),
			client_id: client_id.to_string(),
			service_name: service_id.to_string(),
			service_type: ServiceType::Tcp,
			local_address: "127.0.0.1".to_string(),
			local_port: 8080,
			remote_port: None,
			status: status.to_string(),
			registered_time: Utc::now(),
		}
	}
}

/// `PortAllocator` (spec §3): a port is free only if absent from the map
/// *and* both TCP and UDP binds on it succeed.
pub struct PortAllocator {
	range: PortRange,
	allocated: Mutex<HashMap<u16, String>>,
}

impl PortAllocator {
	pub fn new(range: PortRange) -> Self {
		Self { range, allocated: Mutex::new(HashMap::new()) }
	}

	fn really_free(port: u16) -> bool {
		let addr = SocketAddr::new(IpAddr::from([0, 0, 0, 0]), port);
		let tcp = TcpListener::bind(addr);
		let udp = UdpSocket::bind(addr);
		tcp.is_ok() && udp.is_ok()
	}

	/// `AllocatePort` (spec §4.11 steps 1-3).
	pub fn allocate(&self, service_id: &str, prefer_port: Option<u16>) -> Result<u16, RegistryError> {
		let mut allocated = self.allocated.lock();
		if let Some(port) = prefer_port {
			if allocated.contains_key(&port) || !Self::really_free(port) {
				return Err(RegistryError::PortTaken(port));
			}
			allocated.insert(port, service_id.to_string());
			return Ok(port);
		}
		for port in self.range.min..=self.range.max {
			if allocated.contains_key(&port) {
				continue;
			}
			if Self::really_free(port) {
				allocated.insert(port, service_id.to_string());
				return Ok(port);
			}
		}
		Err(RegistryError::PortExhausted(self.range.min, self.range.max))
	}

	pub fn release(&self, port: u16) {
		self.allocated.lock().remove(&port);
	}

	pub fn is_allocated(&self, port: u16) -> bool {
		self.allocated.lock().contains_key(&port)
	}
}

/// `ValidateServiceConfig` (spec §4.11).
pub fn validate(req: &RegisterServiceRequest) -> Result<(), RegistryError> {
	if req.name.trim().is_empty() {
		return Err(RegistryError::EmptyServiceName);
	}
	if req.local_port == 0 {
		return Err(RegistryError::InvalidLocalPort(req.local_port as u32));
	}
	if let Some(remote) = req.remote_port {
		if remote == 0 {
			return Err(RegistryError::InvalidRemotePort(remote as u32));
		}
	}
	let addr_ok = req.local_address.eq_ignore_ascii_case("localhost")
		|| req.local_address.parse::<IpAddr>().is_ok()
		|| !req.local_address.is_empty();
	if !addr_ok {
		return Err(RegistryError::InvalidLocalAddress(req.local_address.clone()));
	}
	if matches!(req.service_type, ServiceType::Http | ServiceType::Https)
		&& req.custom_domains.is_empty()
		&& req.sub_domain.is_none()
	{
		return Err(RegistryError::MissingDomainBinding);
	}
	Ok(())
}

struct Indices {
	client_services: HashMap<String, Vec<String>>,
	services: HashMap<String, TunnelServiceRecord>,
}

/// C11 itself: validation, port allocation, and the client/service/port
/// indices, backed by a [`ServiceRepository`].
pub struct ServiceRegistry {
	ports: PortAllocator,
	indices: Mutex<Indices>,
	repository: Arc<dyn ServiceRepository>,
}

impl ServiceRegistry {
	pub fn new(range: PortRange, repository: Arc<dyn ServiceRepository>) -> Self {
		Self {
			ports: PortAllocator::new(range),
			indices: Mutex::new(Indices { client_services: HashMap::new(), services: HashMap::new() }),
			repository,
		}
	}

	/// Register flow (spec §4.11): validate → allocate if needed → persist;
	/// roll back the port allocation if persistence fails.
	pub async fn register(
		&self,
		client_id: &str,
		service_id: String,
		req: RegisterServiceRequest,
	) -> Result<u16, RegistryError> {
		validate(&req)?;
		let port = match req.remote_port {
			Some(p) if p != 0 => {
				self.ports.allocate(&service_id, Some(p))?;
				p
			},
			_ => self.ports.allocate(&service_id, None)?,
		};

		let record = TunnelServiceRecord {
			service_id: service_id.clone(),
			client_id: client_id.to_string(),
			service_name: req.name,
			service_type: req.service_type,
			local_address: req.local_address,
			local_port: req.local_port,
			remote_port: Some(port),
			status: "online".to_string(),
			registered_time: Utc::now(),
		};

		if let Err(e) = self.repository.save(record.clone()).await {
			self.ports.release(port);
			return Err(RegistryError::PersistenceFailed(e));
		}

		let mut indices = self.indices.lock();
		indices.client_services.entry(client_id.to_string()).or_default().push(service_id.clone());
		indices.services.insert(service_id, record);
		Ok(port)
	}

	/// Unregister flow (spec §4.11): never fails the caller; logs persistence
	/// failures instead.
	pub async fn unregister(&self, service_id: &str) {
		let removed = {
			let mut indices = self.indices.lock();
			let record = indices.services.remove(service_id);
			if let Some(record) = &record {
				if let Some(ids) = indices.client_services.get_mut(&record.client_id) {
					ids.retain(|id| id != service_id);
				}
			}
			record
		};
		if let Some(record) = removed {
			if let Some(port) = record.remote_port {
				self.ports.release(port);
			}
		}
		if let Err(e) = self.repository.mark_offline(service_id).await {
			tracing::warn!(service_id, error = %e, "failed to persist service deregistration");
		}
	}

	/// Removes every service belonging to `client_id` (spec §4.10 step 5,
	/// client eviction on EOF/heartbeat timeout).
	pub async fn unregister_client(&self, client_id: &str) {
		let service_ids: Vec<String> = {
			let indices = self.indices.lock();
			indices.client_services.get(client_id).cloned().unwrap_or_default()
		};
		for service_id in service_ids {
			self.unregister(&service_id).await;
		}
		self.indices.lock().client_services.remove(client_id);
	}

	pub fn service(&self, service_id: &str) -> Option<TunnelServiceRecord> {
		self.indices.lock().services.get(service_id).cloned()
	}

	pub fn services_for_client(&self, client_id: &str) -> Vec<String> {
		self.indices.lock().client_services.get(client_id).cloned().unwrap_or_default()
	}

	/// Resolves a `serviceId` from the `serviceName` the wire protocol gives
	/// `unregister_service` (spec §6 "`unregister_service`: `data={serviceName}`").
	pub fn find_service_id_by_name(&self, client_id: &str, service_name: &str) -> Option<String> {
		let indices = self.indices.lock();
		indices.client_services.get(client_id)?.iter().find(|id| {
			indices.services.get(*id).is_some_and(|r| r.service_name == service_name)
		}).cloned()
	}

	/// Restart-time rebuild (spec §4.11 "On restart, load all active
	/// services from storage and rebuild indices and port map").
	pub async fn rebuild_from_storage(&self) -> Result<(), RegistryError> {
		let active = self.repository.load_active().await?;
		let mut indices = self.indices.lock();
		for record in active {
			if let Some(port) = record.remote_port {
				self.ports.allocated.lock().insert(port, record.service_id.clone());
			}
			indices.client_services.entry(record.client_id.clone()).or_default().push(record.service_id.clone());
			indices.services.insert(record.service_id.clone(), record);
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::repository::InMemoryServiceRepository;

	fn req(name: &str, port: u16) -> RegisterServiceRequest {
		RegisterServiceRequest {
			name: name.to_string(),
			service_type: ServiceType::Tcp,
			local_address: "127.0.0.1".to_string(),
			local_port: port,
			remote_port: None,
			custom_domains: Vec::new(),
			sub_domain: None,
		}
	}

	#[test]
	fn validate_rejects_empty_name() {
		let mut r = req("", 8080);
		r.name.clear();
		assert!(matches!(validate(&r), Err(RegistryError::EmptyServiceName)));
	}

	#[test]
	fn validate_requires_domain_binding_for_http() {
		let mut r = req("web", 8080);
		r.service_type = ServiceType::Http;
		assert!(matches!(validate(&r), Err(RegistryError::MissingDomainBinding)));
		r.sub_domain = Some("foo".into());
		assert!(validate(&r).is_ok());
	}

	#[tokio::test]
	async fn register_then_unregister_releases_port() {
		let repo = Arc::new(InMemoryServiceRepository::default());
		let registry = ServiceRegistry::new(PortRange { min: 18000, max: 18010 }, repo);
		let port = registry.register("client-1", "svc-1".to_string(), req("tcpsvc", 8080)).await.unwrap();
		assert!((18000..=18010).contains(&port));
		assert!(registry.ports.is_allocated(port));

		registry.unregister("svc-1").await;
		assert!(!registry.ports.is_allocated(port));
		assert!(registry.service("svc-1").is_none());
	}

	#[tokio::test]
	async fn s6_port_collision_skips_taken_port() {
		// Bind a foreign listener on the first port in range, as S6 describes.
		let _foreign = TcpListener::bind(("0.0.0.0", 18100)).unwrap();
		let repo = Arc::new(InMemoryServiceRepository::default());
		let registry = ServiceRegistry::new(PortRange { min: 18100, max: 18110 }, repo);
		let port = registry.register("client-1", "svc-1".to_string(), req("tcpsvc", 8080)).await.unwrap();
		assert_eq!(port, 18101);
	}

	#[tokio::test]
	async fn unregister_client_releases_all_its_services() {
		let repo = Arc::new(InMemoryServiceRepository::default());
		let registry = ServiceRegistry::new(PortRange { min: 18200, max: 18210 }, repo);
		registry.register("client-1", "svc-1".to_string(), req("a", 8080)).await.unwrap();
		registry.register("client-1", "svc-2".to_string(), req("b", 8081)).await.unwrap();
		registry.unregister_client("client-1").await;
		assert!(registry.service("svc-1").is_none());
		assert!(registry.service("svc-2").is_none());
		assert!(registry.services_for_client("client-1").is_empty());
	}
}
