//! Shared backend HTTP client (spec §4.7 "Issue via a shared HTTP client").
//!
//! One [`BackendClient`] is built per [`HTTPProxyConfig`] and reused across
//! requests so the underlying transport can pool connections per host, the
//! way the teacher's `client::Client` wraps a single `hyper_util` legacy
//! client rather than dialing fresh per call.

use std::time::Duration;

use http_body_util::Full;
use hyper::body::Bytes;
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client as LegacyClient;
use hyper_util::rt::TokioExecutor;

use crate::config::HTTPProxyConfig;

pub type Req = hyper::Request<Full<Bytes>>;
pub type Resp = hyper::Response<hyper::body::Incoming>;

#[derive(Clone)]
pub struct BackendClient {
	inner: LegacyClient<HttpsConnector<HttpConnector>, Full<Bytes>>,
	pub response_header_timeout: Duration,
}

impl BackendClient {
	/// Builds a client whose connector carries the pool/timeout knobs spec
	/// §4.7 assigns to the transport: `MaxIdleConnsPerHost = maxIdleConns/4`,
	/// dial timeout = `connectTimeout`, TCP keep-alive 30s. TLS is layered on
	/// top with `hyper-rustls` so `https://` nodes (spec §4.4 item 1 node
	/// URLs) are reachable, honoring `tlsInsecureSkipVerify`.
	pub fn new(cfg: &HTTPProxyConfig) -> Self {
		let mut connector = HttpConnector::new();
		connector.set_connect_timeout(Some(cfg.connect_timeout));
		connector.set_keepalive(Some(Duration::from_secs(30)));
		connector.set_nodelay(true);
		connector.enforce_http(false);

		let https = HttpsConnectorBuilder::new()
			.with_tls_config(crate::tls::client_config(cfg))
			.https_or_http()
			.enable_http1()
			.enable_http2()
			.wrap_connector(connector);

		let per_host = (cfg.max_idle_conns / 4).max(1);
		let inner = LegacyClient::builder(TokioExecutor::new())
			.pool_idle_timeout(cfg.idle_conn_timeout)
			.pool_max_idle_per_host(per_host)
			.build(https);

		Self { inner, response_header_timeout: cfg.read_timeout }
	}

	/// Issues `req`, applying the response-header timeout (spec §4.7:
	/// `ResponseHeaderTimeout=readTimeout`).
	pub async fn send(&self, req: Req) -> Result<Resp, ClientError> {
		tokio::time::timeout(self.response_header_timeout, self.inner.request(req))
			.await
			.map_err(|_| ClientError::ResponseHeaderTimeout)?
			.map_err(ClientError::Dial)
	}
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
	#[error("timed out waiting for response headers")]
	ResponseHeaderTimeout,
	#[error("upstream dial/request error: {0}")]
	Dial(#[source] hyper_util::client::legacy::Error),
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn per_host_pool_size_is_quarter_of_max_idle() {
		let mut cfg = HTTPProxyConfig::default();
		cfg.max_idle_conns = 40;
		let client = BackendClient::new(&cfg);
		assert_eq!(client.response_header_timeout, cfg.read_timeout);
	}
}
