//! Service & node data model (spec §3, component C2).

use std::collections::BTreeMap;

use relaygate_core::Strng;
use serde::{Deserialize, Serialize};

/// A named logical upstream, resolved to a [`NodeConfig`] at request time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceConfig {
	pub id: Strng,
	pub name: Strng,
	#[serde(default)]
	pub metadata: BTreeMap<String, String>,
}

impl ServiceConfig {
	/// `metadata` is authoritative for registry-backed discovery iff at least
	/// one of `tenantId`/`serviceGroupId`/`groupId`/`serviceName` is present
	/// (spec §4.4 item 1's registry trigger). Once any of those fields is
	/// present, `serviceName` becomes mandatory — its absence is `Err`, not a
	/// silent fall-through to inline dispatch, because that would route a
	/// misconfigured registry service as though registry discovery was never
	/// requested at all.
	pub fn registry_metadata(&self) -> Result<Option<RegistryServiceMetadata>, MissingServiceName> {
		let tenant_id = lookup(&self.metadata, &["tenantId", "tenant_id"]);
		let service_group_id = lookup(&self.metadata, &["serviceGroupId", "service_group_id", "groupId", "group_id"]);
		let service_name = lookup(&self.metadata, &["serviceName", "service_name"]).filter(|s| !s.is_empty());

		if tenant_id.is_none() && service_group_id.is_none() && service_name.is_none() {
			return Ok(None);
		}
		let Some(service_name) = service_name else {
			return Err(MissingServiceName);
		};

		Ok(Some(RegistryServiceMetadata {
			tenant_id,
			service_group_id,
			group_name: lookup(&self.metadata, &["groupName", "group_name"]),
			service_name,
			discovery_type: lookup(&self.metadata, &["discoveryType", "discovery_type"]),
			discovery_config: lookup(&self.metadata, &["discoveryConfig", "discovery_config"]),
		}))
	}
}

/// Registry-trigger fields (`tenantId`/`serviceGroupId`/`groupId`) were
/// present on a service's metadata but `serviceName` was missing or empty —
/// maps to `ProxyError::InvalidServiceMetadata` at the call site.
#[derive(Debug, Clone, Copy)]
pub struct MissingServiceName;

fn lookup(map: &BTreeMap<String, String>, keys: &[&str]) -> Option<String> {
	for k in keys {
		if let Some(v) = map.get(*k) {
			return Some(v.clone());
		}
	}
	None
}

/// `RegistryServiceMetadata` — see spec §3.
#[derive(Debug, Clone)]
pub struct RegistryServiceMetadata {
	pub tenant_id: Option<String>,
	pub service_group_id: Option<String>,
	pub group_name: Option<String>,
	pub service_name: String,
	pub discovery_type: Option<String>,
	pub discovery_config: Option<String>,
}

/// Discovery kind, selecting the resolver path (spec GLOSSARY).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryKind {
	Inline,
	Registry,
	ServiceCenter,
}

impl RegistryServiceMetadata {
	/// `IsRegistryService` (spec §4.4 item 1).
	pub fn is_registry_service(&self) -> bool {
		let has_registry_fields = self.tenant_id.is_some()
			|| self.service_group_id.is_some()
			|| !self.service_name.is_empty();
		let discovery_ok = match &self.discovery_type {
			None => true,
			Some(d) => d.eq_ignore_ascii_case("registry"),
		};
		has_registry_fields && discovery_ok
	}

	/// `IsServiceCenterService` (spec §4.4 item 2).
	pub fn is_service_center_service(&self) -> bool {
		matches!(
			self.discovery_type.as_deref(),
			Some(d) if d.eq_ignore_ascii_case("servicecenter")
		)
	}

	pub fn discovery_kind(&self) -> DiscoveryKind {
		if self.is_service_center_service() {
			DiscoveryKind::ServiceCenter
		} else if self.is_registry_service() {
			DiscoveryKind::Registry
		} else {
			DiscoveryKind::Inline
		}
	}
}

/// A concrete backend endpoint belonging to a service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeConfig {
	pub id: Strng,
	pub url: String,
	#[serde(default = "default_weight")]
	pub weight: u32,
	#[serde(default = "default_true")]
	pub health: bool,
	#[serde(default = "default_true")]
	pub enabled: bool,
	#[serde(default)]
	pub metadata: BTreeMap<String, String>,
}

fn default_weight() -> u32 {
	1
}
fn default_true() -> bool {
	true
}

impl NodeConfig {
	/// A node is selectable iff `enabled ∧ health` (spec §3 invariant).
	pub fn selectable(&self) -> bool {
		self.enabled && self.health
	}
}

/// Per-node live statistics fed into the load balancer (spec §4.3).
#[derive(Debug, Clone, Copy, Default)]
pub struct NodeStats {
	pub active_connections: u32,
	pub latency_ms: f64,
	pub error_rate_pct: f64,
	pub cpu_pct: f64,
	pub mem_pct: f64,
	pub load: f64,
}

/// Retry/timeout policy shared by the HTTP proxy engine.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
	pub retry_count: u32,
	pub retry_timeout: std::time::Duration,
}

impl Default for RetryPolicy {
	fn default() -> Self {
		Self {
			retry_count: 0,
			retry_timeout: std::time::Duration::from_millis(50),
		}
	}
}
