//! HTTP-proxy-side error taxonomy (spec §7): resolver, dispatch, and
//! WebSocket failure kinds, plus their HTTP surfacing.

use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
	#[error("service {0:?} not found")]
	ServiceNotFound(String),
	#[error("invalid service metadata for {0:?}")]
	InvalidServiceMetadata(String),
	#[error("discovery backend unavailable for {0:?}: {1}")]
	DiscoveryUnavailable(String, #[source] anyhow::Error),
	#[error("no instance found for {0:?}")]
	NoInstanceFound(String),
	#[error("no healthy nodes for {0:?}")]
	NoHealthyNodes(String),
	#[error("failed to dial upstream: {0}")]
	UpstreamDialError(#[source] anyhow::Error),
	#[error("upstream I/O error: {0}")]
	UpstreamIoError(#[source] anyhow::Error),
	#[error("upstream returned a malformed response: {0}")]
	UpstreamBadResponse(String),
	#[error("client aborted the request")]
	ClientAborted,
	#[error("no selectable node after resolving {service:?}")]
	ServiceUnavailable { service: String },
	#[error("upstream request failed after {attempts} attempt(s)")]
	BadGateway { attempts: u32, target_url: String, service: String, details: String },
}

impl ProxyError {
	/// Maps to the HTTP status code spec §6 assigns to each failure kind.
	pub fn status_code(&self) -> u16 {
		match self {
			ProxyError::ServiceUnavailable { .. } | ProxyError::NoHealthyNodes(_) => 503,
			ProxyError::BadGateway { .. }
			| ProxyError::UpstreamDialError(_)
			| ProxyError::UpstreamIoError(_)
			| ProxyError::UpstreamBadResponse(_)
			| ProxyError::DiscoveryUnavailable(..)
			| ProxyError::NoInstanceFound(_) => 502,
			ProxyError::ServiceNotFound(_) | ProxyError::InvalidServiceMetadata(_) => 400,
			ProxyError::ClientAborted => 499,
		}
	}

	/// True for the kinds spec §7 marks as retriable (all dispatch errors,
	/// except once SSE streaming has begun — that check lives in the engine).
	pub fn is_retriable(&self) -> bool {
		matches!(
			self,
			ProxyError::UpstreamDialError(_) | ProxyError::UpstreamIoError(_) | ProxyError::UpstreamBadResponse(_)
		)
	}

	pub fn to_error_body(&self) -> ErrorBody {
		match self {
			ProxyError::BadGateway { target_url, service, details, .. } => ErrorBody {
				error: "bad gateway".to_string(),
				details: Some(details.clone()),
				target_url: Some(target_url.clone()),
				service: Some(service.clone()),
			},
			ProxyError::ServiceUnavailable { service } => ErrorBody {
				error: "service unavailable".to_string(),
				details: None,
				target_url: None,
				service: Some(service.clone()),
			},
			other => ErrorBody { error: other.to_string(), details: None, target_url: None, service: None },
		}
	}
}

/// `{error, details?, target_url?, service?}` (spec §6).
#[derive(Debug, Serialize)]
pub struct ErrorBody {
	pub error: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub details: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub target_url: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub service: Option<String>,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn bad_gateway_maps_to_502() {
		let err = ProxyError::BadGateway {
			attempts: 2,
			target_url: "http://n1/x".into(),
			service: "orders".into(),
			details: "reset".into(),
		};
		assert_eq!(err.status_code(), 502);
		let body = err.to_error_body();
		assert_eq!(body.target_url.as_deref(), Some("http://n1/x"));
	}

	#[test]
	fn service_unavailable_maps_to_503() {
		assert_eq!(ProxyError::ServiceUnavailable { service: "x".into() }.status_code(), 503);
	}
}
