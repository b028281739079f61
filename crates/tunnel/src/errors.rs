//! Tunnel-side error taxonomy (spec §7): codec/auth/registry/proxy failure
//! kinds and their propagation policy.

use crate::codec::FrameError;
use crate::registry::RegistryError;

#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
	#[error("framing error: {0}")]
	Frame(#[from] FrameError),
	#[error("malformed control message: {0}")]
	BadMessage(String),
	#[error("authentication rejected for client {0:?}")]
	AuthRejected(String),
	#[error(transparent)]
	Registry(#[from] RegistryError),
	#[error("timed out waiting for a data connection")]
	ProxyTimeout,
	#[error("server is shutting down")]
	ServerShuttingDown,
}

impl TunnelError {
	/// True for errors fatal to the connection, not the whole server (spec
	/// §7 "Fatal vs recoverable"): framing/auth violations close just the
	/// offending connection.
	pub fn closes_connection(&self) -> bool {
		matches!(self, TunnelError::Frame(_) | TunnelError::BadMessage(_) | TunnelError::AuthRejected(_))
	}
}
