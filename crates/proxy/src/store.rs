//! `ServiceManager` (spec §4.4 item 3, §9 "treat as injected dependencies"):
//! owns the versioned `ServiceConfig`/`NodeConfig` set the resolver falls
//! back to when a service carries no external-discovery metadata.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::balancer::{LoadBalancer, SelectContext};
use crate::types::{NodeConfig, ServiceConfig};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
	#[error("service {0:?} not found")]
	ServiceNotFound(String),
}

#[async_trait]
pub trait ServiceManager: Send + Sync {
	async fn get_service(&self, service_id: &str) -> Result<ServiceConfig, StoreError>;
	async fn get_nodes(&self, service_id: &str) -> Result<Vec<NodeConfig>, StoreError>;
	/// `SelectNode` (spec §4.4 item 3): the manager's own load-balanced pick,
	/// used when a service has no external discovery metadata.
	async fn select_node(&self, service_id: &str, ctx: &SelectContext) -> Result<NodeConfig, StoreError>;
}

struct Entry {
	service: ServiceConfig,
	nodes: Vec<NodeConfig>,
}

/// In-memory `ServiceManager`, grounded on spec §9's guidance to treat the
/// registry/service-center singletons as plain injected dependencies —
/// here extended to the manager itself so the resolver is hermetically
/// testable without any external process.
pub struct InMemoryServiceManager {
	entries: RwLock<HashMap<String, Entry>>,
	balancer: Arc<LoadBalancer>,
}

impl InMemoryServiceManager {
	pub fn new(balancer: Arc<LoadBalancer>) -> Self {
		Self { entries: RwLock::new(HashMap::new()), balancer }
	}

	pub fn upsert(&self, service: ServiceConfig, nodes: Vec<NodeConfig>) {
		let id = service.id.to_string();
		self.entries.write().insert(id, Entry { service, nodes });
	}

	pub fn update_node_stats(&self, node_id: &str, stats: crate::types::NodeStats) {
		self.balancer.update_stats(node_id, stats);
	}
}

#[async_trait]
impl ServiceManager for InMemoryServiceManager {
	async fn get_service(&self, service_id: &str) -> Result<ServiceConfig, StoreError> {
		self.entries
			.read()
			.get(service_id)
			.map(|e| e.service.clone())
			.ok_or_else(|| StoreError::ServiceNotFound(service_id.to_string()))
	}

	async fn get_nodes(&self, service_id: &str) -> Result<Vec<NodeConfig>, StoreError> {
		self.entries
			.read()
			.get(service_id)
			.map(|e| e.nodes.clone())
			.ok_or_else(|| StoreError::ServiceNotFound(service_id.to_string()))
	}

	async fn select_node(&self, service_id: &str, ctx: &SelectContext) -> Result<NodeConfig, StoreError> {
		let nodes = self.get_nodes(service_id).await?;
		self.balancer
			.select(&nodes, ctx)
			.map(|n| n.clone())
			.map_err(|_| StoreError::ServiceNotFound(service_id.to_string()))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::balancer::Algorithm;
	use std::collections::BTreeMap;

	fn node(id: &str) -> NodeConfig {
		NodeConfig { id: id.into(), url: format!("http://{id}"), weight: 1, health: true, enabled: true, metadata: Default::default() }
	}

	#[tokio::test]
	async fn upsert_then_lookup_round_trips() {
		let mgr = InMemoryServiceManager::new(Arc::new(LoadBalancer::new(Algorithm::RoundRobin)));
		let svc = ServiceConfig { id: "s1".into(), name: "orders".into(), metadata: BTreeMap::new() };
		mgr.upsert(svc.clone(), vec![node("n1")]);

		let got = mgr.get_service("s1").await.unwrap();
		assert_eq!(got.name.as_str(), "orders");
		let nodes = mgr.get_nodes("s1").await.unwrap();
		assert_eq!(nodes.len(), 1);
	}

	#[tokio::test]
	async fn missing_service_errors() {
		let mgr = InMemoryServiceManager::new(Arc::new(LoadBalancer::new(Algorithm::RoundRobin)));
		assert!(matches!(mgr.get_service("nope").await, Err(StoreError::ServiceNotFound(_))));
	}
}
