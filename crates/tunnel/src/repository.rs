//! Persistence interfaces (spec §6 "Persisted state (abstract)"): the CORE
//! only depends on these traits; concrete storage is out of scope. An
//! in-memory implementation is provided so the rest of the crate is
//! hermetically testable (SPEC_FULL.md §B).

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::registry::TunnelServiceRecord;

#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
	#[error("no such record: {0}")]
	NotFound(String),
	#[error("storage backend rejected the write: {0}")]
	WriteRejected(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerRecord {
	pub instance_id: String,
	pub status: String,
	pub start_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientRecord {
	pub client_id: String,
	pub client_name: String,
	pub client_ip: String,
	pub status: String,
	pub last_connect_time: DateTime<Utc>,
}

#[async_trait]
pub trait ServerRepository: Send + Sync {
	async fn save(&self, record: ServerRecord) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait ClientRepository: Send + Sync {
	async fn save(&self, record: ClientRecord) -> Result<(), RepositoryError>;
	async fn remove(&self, client_id: &str) -> Result<(), RepositoryError>;
}

/// Backs C11's persistence step: "persist through the repository; on
/// persistence failure, roll back the port allocation" (spec §4.11).
#[async_trait]
pub trait ServiceRepository: Send + Sync {
	async fn save(&self, record: TunnelServiceRecord) -> Result<(), RepositoryError>;
	async fn mark_offline(&self, service_id: &str) -> Result<(), RepositoryError>;
	/// Supports C11's restart-time index rebuild ("load all active services
	/// from storage", spec §4.11).
	async fn load_active(&self) -> Result<Vec<TunnelServiceRecord>, RepositoryError>;
}

#[derive(Default)]
pub struct InMemoryServiceRepository {
	records: RwLock<HashMap<String, TunnelServiceRecord>>,
}

#[async_trait]
impl ServiceRepository for InMemoryServiceRepository {
	async fn save(&self, record: TunnelServiceRecord) -> Result<(), RepositoryError> {
		self.records.write().insert(record.service_id.clone(), record);
		Ok(())
	}

	async fn mark_offline(&self, service_id: &str) -> Result<(), RepositoryError> {
		let mut records = self.records.write();
		let rec = records.get_mut(service_id).ok_or_else(|| RepositoryError::NotFound(service_id.to_string()))?;
		rec.status = "offline".to_string();
		Ok(())
	}

	async fn load_active(&self) -> Result<Vec<TunnelServiceRecord>, RepositoryError> {
		Ok(self.records.read().values().filter(|r| r.status == "online").cloned().collect())
	}
}

#[derive(Default)]
pub struct InMemoryClientRepository {
	records: RwLock<HashMap<String, ClientRecord>>,
}

#[async_trait]
impl ClientRepository for InMemoryClientRepository {
	async fn save(&self, record: ClientRecord) -> Result<(), RepositoryError> {
		self.records.write().insert(record.client_id.clone(), record);
		Ok(())
	}

	async fn remove(&self, client_id: &str) -> Result<(), RepositoryError> {
		self.records.write().remove(client_id);
		Ok(())
	}
}

#[derive(Default)]
pub struct InMemoryServerRepository {
	last: RwLock<Option<ServerRecord>>,
}

#[async_trait]
impl ServerRepository for InMemoryServerRepository {
	async fn save(&self, record: ServerRecord) -> Result<(), RepositoryError> {
		*self.last.write() = Some(record);
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn load_active_excludes_offline_services() {
		let repo = InMemoryServiceRepository::default();
		repo.save(TunnelServiceRecord::new_for_test("s1", "c1", "online")).await.unwrap();
		repo.save(TunnelServiceRecord::new_for_test("s2", "c1", "offline")).await.unwrap();
		let active = repo.load_active().await.unwrap();
		assert_eq!(active.len(), 1);
		assert_eq!(active[0].service_id, "s1");
	}

	#[tokio::test]
	async fn mark_offline_flips_status() {
		let repo = InMemoryServiceRepository::default();
		repo.save(TunnelServiceRecord::new_for_test("s1", "c1", "online")).await.unwrap();
		repo.mark_offline("s1").await.unwrap();
		assert!(repo.load_active().await.unwrap().is_empty());
	}
}
