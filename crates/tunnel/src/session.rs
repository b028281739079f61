//! Session / connection tracker (spec §2 C14, optional extension surface):
//! aggregates per-client session lifecycle and per-service traffic stats on
//! top of the counters C12 already keeps, for callers that want a single
//! place to query "who is connected and how much have they moved".

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

#[derive(Debug, Clone)]
pub struct SessionRecord {
	pub client_id: String,
	pub connected_at: DateTime<Utc>,
	pub last_activity: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct ServiceStats {
	bytes_in: AtomicU64,
	bytes_out: AtomicU64,
	connections: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ServiceStatsSnapshot {
	pub bytes_in: u64,
	pub bytes_out: u64,
	pub connections: u64,
}

/// Tracks client session lifecycle and per-service traffic totals.
/// Intentionally a passive aggregator: C10/C12 call into it at the points
/// they already touch a client or a service, rather than it owning any
/// network resources itself.
#[derive(Default)]
pub struct SessionTracker {
	sessions: RwLock<HashMap<String, SessionRecord>>,
	service_stats: RwLock<HashMap<String, ServiceStats>>,
}

impl SessionTracker {
	pub fn new() -> Self {
		Self::default()
	}

	/// Spec §4.10 step 2: a client moves into `activeConns` on successful auth.
	pub fn record_connect(&self, client_id: &str, at: DateTime<Utc>) {
		self.sessions.write().insert(client_id.to_string(), SessionRecord { client_id: client_id.to_string(), connected_at: at, last_activity: at });
	}

	pub fn record_activity(&self, client_id: &str, at: DateTime<Utc>) {
		if let Some(record) = self.sessions.write().get_mut(client_id) {
			record.last_activity = at;
		}
	}

	/// Spec §4.10 step 5 / §4.13: heartbeat timeout or control EOF evicts the client.
	pub fn record_disconnect(&self, client_id: &str) {
		self.sessions.write().remove(client_id);
	}

	pub fn session(&self, client_id: &str) -> Option<SessionRecord> {
		self.sessions.read().get(client_id).cloned()
	}

	pub fn active_session_count(&self) -> usize {
		self.sessions.read().len()
	}

	/// Spec §4.12's per-service byte/connection counters, mirrored here so a
	/// caller doesn't need a handle to the reverse proxy engine itself.
	pub fn record_connection(&self, service_id: &str, bytes_in: u64, bytes_out: u64) {
		let mut stats = self.service_stats.write();
		let entry = stats.entry(service_id.to_string()).or_default();
		entry.connections.fetch_add(1, Ordering::Relaxed);
		entry.bytes_in.fetch_add(bytes_in, Ordering::Relaxed);
		entry.bytes_out.fetch_add(bytes_out, Ordering::Relaxed);
	}

	pub fn service_snapshot(&self, service_id: &str) -> ServiceStatsSnapshot {
		match self.service_stats.read().get(service_id) {
			Some(s) => ServiceStatsSnapshot {
				bytes_in: s.bytes_in.load(Ordering::Relaxed),
				bytes_out: s.bytes_out.load(Ordering::Relaxed),
				connections: s.connections.load(Ordering::Relaxed),
			},
			None => ServiceStatsSnapshot::default(),
		}
	}
}
