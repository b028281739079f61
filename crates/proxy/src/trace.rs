//! Backend trace record (spec §6): one structured log line per proxied
//! request, emitted through `tracing` rather than a bespoke sink.

use std::time::Duration;

use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct BackendTraceRecord {
	pub request_id: String,
	pub service_id: String,
	pub node_id: String,
	pub method: String,
	pub path: String,
	pub status: Option<u16>,
	pub attempt: u32,
	pub duration_ms: f64,
	pub error: Option<String>,
}

impl BackendTraceRecord {
	pub fn new(request_id: impl Into<String>, service_id: impl Into<String>, node_id: impl Into<String>, method: impl Into<String>, path: impl Into<String>, attempt: u32) -> Self {
		Self {
			request_id: request_id.into(),
			service_id: service_id.into(),
			node_id: node_id.into(),
			method: method.into(),
			path: path.into(),
			status: None,
			attempt,
			duration_ms: 0.0,
			error: None,
		}
	}

	pub fn succeeded(mut self, status: u16, elapsed: Duration) -> Self {
		self.status = Some(status);
		self.duration_ms = elapsed.as_secs_f64() * 1000.0;
		self
	}

	pub fn failed(mut self, error: impl std::fmt::Display, elapsed: Duration) -> Self {
		self.error = Some(error.to_string());
		self.duration_ms = elapsed.as_secs_f64() * 1000.0;
		self
	}

	/// Emits this record as a single structured `tracing` event, per spec
	/// §6's "one line per attempt" requirement.
	pub fn emit(&self) {
		tracing::info!(
			target: "backend_trace",
			request_id = %self.request_id,
			service_id = %self.service_id,
			node_id = %self.node_id,
			method = %self.method,
			path = %self.path,
			status = self.status,
			attempt = self.attempt,
			duration_ms = self.duration_ms,
			error = self.error.as_deref(),
			"backend request",
		);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn succeeded_sets_status_and_duration() {
		let rec = BackendTraceRecord::new("req-1", "svc", "node-1", "GET", "/x", 1)
			.succeeded(200, Duration::from_millis(15));
		assert_eq!(rec.status, Some(200));
		assert!(rec.duration_ms >= 15.0);
		assert!(rec.error.is_none());
	}

	#[test]
	fn failed_sets_error_message() {
		let rec = BackendTraceRecord::new("req-2", "svc", "node-1", "GET", "/x", 2)
			.failed("connection reset", Duration::from_millis(5));
		assert_eq!(rec.error.as_deref(), Some("connection reset"));
		assert!(rec.status.is_none());
	}
}
