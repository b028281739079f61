//! Wire types for the tunnel control protocol (spec §6 "Tunnel control
//! protocol (bit-exact)", §3 ControlMessage/TunnelService).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
	Auth,
	Heartbeat,
	RegisterService,
	UnregisterService,
	NewProxy,
	CloseProxy,
	ProxyRequest,
	PreConnectRequest,
	DataConnection,
	Response,
	Error,
}

/// `{ type, sessionId, data, timestamp }` (spec §6). `data` is a tolerant
/// bag rather than a per-type struct so unrecognized extra fields round-trip
/// and a single decoder can classify before dispatch (spec §4.10 step 1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlMessage {
	#[serde(rename = "type")]
	pub kind: MessageType,
	#[serde(default, rename = "sessionId", skip_serializing_if = "Option::is_none")]
	pub session_id: Option<String>,
	#[serde(default)]
	pub data: Value,
	#[serde(default = "Utc::now")]
	pub timestamp: DateTime<Utc>,
}

impl ControlMessage {
	pub fn new(kind: MessageType, data: Value) -> Self {
		Self { kind, session_id: None, data, timestamp: Utc::now() }
	}

	pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
		self.session_id = Some(session_id.into());
		self
	}

	pub fn to_frame_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
		serde_json::to_vec(self)
	}

	pub fn from_frame_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
		serde_json::from_slice(bytes)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceType {
	Tcp,
	Udp,
	Http,
	Https,
	Stcp,
	Sudp,
	Xtcp,
}

/// `register_service` payload skeleton (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterServiceRequest {
	pub name: String,
	#[serde(rename = "type")]
	pub service_type: ServiceType,
	pub local_address: String,
	pub local_port: u16,
	#[serde(default)]
	pub remote_port: Option<u16>,
	#[serde(default)]
	pub custom_domains: Vec<String>,
	#[serde(default)]
	pub sub_domain: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuthReply {
	pub success: bool,
	pub message: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterServiceReply {
	pub success: bool,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub service_id: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub remote_port: Option<u16>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub message: Option<String>,
}

/// `proxy_request` server→client payload (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyRequestData {
	pub service_id: String,
	pub connection_id: String,
	pub local_address: String,
	pub local_port: u16,
}

/// `pre_connect_request` server→client payload (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreConnectRequestData {
	pub service_id: String,
	pub pooled: bool,
}

/// `data_connection` client→server first-frame payload (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataConnectionData {
	pub connection_id: String,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn control_message_round_trips_through_json() {
		let msg = ControlMessage::new(MessageType::Heartbeat, serde_json::json!({})).with_session("sess-1");
		let bytes = msg.to_frame_bytes().unwrap();
		let back = ControlMessage::from_frame_bytes(&bytes).unwrap();
		assert_eq!(back.kind, MessageType::Heartbeat);
		assert_eq!(back.session_id.as_deref(), Some("sess-1"));
	}

	#[test]
	fn message_type_uses_snake_case_on_the_wire() {
		let v = serde_json::to_value(MessageType::RegisterService).unwrap();
		assert_eq!(v, serde_json::json!("register_service"));
	}

	#[test]
	fn data_connection_payload_round_trips() {
		let data = DataConnectionData { connection_id: "c-1".into() };
		let v = serde_json::to_value(&data).unwrap();
		let back: DataConnectionData = serde_json::from_value(v).unwrap();
		assert_eq!(back.connection_id, "c-1");
	}
}
