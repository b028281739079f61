//! Service resolver (spec §4.4, component C4): picks one of three discovery
//! paths — inline, registry, or service-center — and returns the node set
//! to hand the load balancer.

use std::sync::Arc;

use async_trait::async_trait;

use crate::types::{DiscoveryKind, NodeConfig, RegistryServiceMetadata};

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
	#[error("service {0:?} has no nodes configured")]
	NoNodes(String),
	#[error("registry lookup failed for service {service:?}: {source}")]
	RegistryUnavailable { service: String, #[source] source: anyhow::Error },
	#[error("service-center lookup failed for service {service:?}: {source}")]
	ServiceCenterUnavailable { service: String, #[source] source: anyhow::Error },
}

/// Collaborator for `DiscoveryKind::Registry` lookups (spec §4.4 item 1).
/// A thin seam so the registry backend (tenant/service-group directory) can
/// be swapped without touching resolution logic.
#[async_trait]
pub trait ServiceRegistryClient: Send + Sync {
	async fn lookup_nodes(
		&self,
		tenant_id: Option<&str>,
		service_group_id: Option<&str>,
		service_name: &str,
	) -> anyhow::Result<Vec<NodeConfig>>;
}

/// Collaborator for `DiscoveryKind::ServiceCenter` lookups (spec §4.4 item 2).
#[async_trait]
pub trait ServiceCenterCache: Send + Sync {
	async fn lookup_nodes(&self, discovery_config: Option<&str>, service_name: &str) -> anyhow::Result<Vec<NodeConfig>>;
}

pub struct ServiceResolver {
	registry: Option<Arc<dyn ServiceRegistryClient>>,
	service_center: Option<Arc<dyn ServiceCenterCache>>,
}

impl ServiceResolver {
	pub fn new(
		registry: Option<Arc<dyn ServiceRegistryClient>>,
		service_center: Option<Arc<dyn ServiceCenterCache>>,
	) -> Self {
		Self { registry, service_center }
	}

	/// Resolves a single externally-discovered node for `meta` (spec §4.4
	/// items 1-2: registry and service-center lookups each reduce to one
	/// `NodeConfig`). Callers dispatch `DiscoveryKind::Inline` to the
	/// `ServiceManager`'s own `SelectNode` (item 3) before ever reaching here.
	pub async fn resolve(&self, meta: &RegistryServiceMetadata) -> Result<NodeConfig, ResolveError> {
		match meta.discovery_kind() {
			DiscoveryKind::Registry => {
				let client = self
					.registry
					.as_ref()
					.ok_or_else(|| ResolveError::RegistryUnavailable {
						service: meta.service_name.clone(),
						source: anyhow::anyhow!("no registry client configured"),
					})?;
				let nodes = client
					.lookup_nodes(meta.tenant_id.as_deref(), meta.service_group_id.as_deref(), &meta.service_name)
					.await
					.map_err(|source| ResolveError::RegistryUnavailable { service: meta.service_name.clone(), source })?;
				first_selectable(nodes, &meta.service_name)
			},
			DiscoveryKind::ServiceCenter => {
				let cache = self
					.service_center
					.as_ref()
					.ok_or_else(|| ResolveError::ServiceCenterUnavailable {
						service: meta.service_name.clone(),
						source: anyhow::anyhow!("no service-center cache configured"),
					})?;
				let nodes = cache
					.lookup_nodes(meta.discovery_config.as_deref(), &meta.service_name)
					.await
					.map_err(|source| ResolveError::ServiceCenterUnavailable { service: meta.service_name.clone(), source })?;
				// spec §4.4 item 2: "pick the first node with instanceStatus=UP ∧ healthyStatus=Healthy".
				first_selectable(nodes, &meta.service_name)
			},
			DiscoveryKind::Inline => Err(ResolveError::NoNodes(meta.service_name.clone())),
		}
	}
}

fn first_selectable(nodes: Vec<NodeConfig>, service_name: &str) -> Result<NodeConfig, ResolveError> {
	nodes
		.into_iter()
		.find(|n| n.selectable())
		.ok_or_else(|| ResolveError::NoNodes(service_name.to_string()))
}

#[cfg(test)]
mod tests {
	use super::*;

	fn node(id: &str) -> NodeConfig {
		NodeConfig { id: id.into(), url: format!("http://{id}"), weight: 1, health: true, enabled: true, metadata: Default::default() }
	}

	fn meta(discovery_type: Option<&str>) -> RegistryServiceMetadata {
		RegistryServiceMetadata {
			tenant_id: None,
			service_group_id: None,
			group_name: None,
			service_name: "orders".to_string(),
			discovery_type: discovery_type.map(str::to_string),
			discovery_config: None,
		}
	}

	struct StaticRegistry(Vec<NodeConfig>);
	#[async_trait]
	impl ServiceRegistryClient for StaticRegistry {
		async fn lookup_nodes(&self, _: Option<&str>, _: Option<&str>, _: &str) -> anyhow::Result<Vec<NodeConfig>> {
			Ok(self.0.clone())
		}
	}

	struct StaticServiceCenter(Vec<NodeConfig>);
	#[async_trait]
	impl ServiceCenterCache for StaticServiceCenter {
		async fn lookup_nodes(&self, _: Option<&str>, _: &str) -> anyhow::Result<Vec<NodeConfig>> {
			Ok(self.0.clone())
		}
	}

	#[tokio::test]
	async fn registry_service_dispatches_to_registry_client() {
		let resolver = ServiceResolver::new(Some(Arc::new(StaticRegistry(vec![node("r1")]))), None);
		let node = resolver.resolve(&meta(None)).await.unwrap();
		assert_eq!(node.id.as_str(), "r1");
	}

	#[tokio::test]
	async fn service_center_service_dispatches_to_cache() {
		let resolver = ServiceResolver::new(None, Some(Arc::new(StaticServiceCenter(vec![node("sc1")]))));
		let node = resolver.resolve(&meta(Some("servicecenter"))).await.unwrap();
		assert_eq!(node.id.as_str(), "sc1");
	}

	#[tokio::test]
	async fn service_center_skips_unhealthy_nodes() {
		let mut bad = node("bad");
		bad.health = false;
		let resolver = ServiceResolver::new(None, Some(Arc::new(StaticServiceCenter(vec![bad, node("good")]))));
		let node = resolver.resolve(&meta(Some("servicecenter"))).await.unwrap();
		assert_eq!(node.id.as_str(), "good");
	}

	#[tokio::test]
	async fn registry_without_client_errors() {
		let resolver = ServiceResolver::new(None, None);
		assert!(matches!(resolver.resolve(&meta(None)).await, Err(ResolveError::RegistryUnavailable { .. })));
	}

	#[tokio::test]
	async fn empty_candidate_list_errors() {
		let resolver = ServiceResolver::new(Some(Arc::new(StaticRegistry(vec![]))), None);
		assert!(matches!(resolver.resolve(&meta(None)).await, Err(ResolveError::NoNodes(_))));
	}
}
