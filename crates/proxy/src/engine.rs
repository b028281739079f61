//! HTTP proxy engine (spec §4.7, component C7): per-request orchestrator —
//! resolve, rewrite, dispatch, retry with per-attempt re-resolution, stream
//! (SSE specially), emit a backend trace record per attempt.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::{HeaderMap, Response};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use uuid::Uuid;

use crate::balancer::SelectContext;
use crate::client::{BackendClient, Req};
use crate::config::HTTPProxyConfig;
use crate::errors::ProxyError;
use crate::headers::{self, RewriteContext};
use crate::path::build_proxy_path;
use crate::resolver::{ResolveError, ServiceResolver};
use crate::store::ServiceManager;
use crate::trace::BackendTraceRecord;
use crate::types::{DiscoveryKind, NodeConfig, ServiceConfig};

const SSE_CHUNK_SIZE: usize = 1024;

/// Errors a downstream TCP peer throws up when it has simply gone away;
/// these are recorded but swallowed (spec §4.7 SSE bullet, §7 `<ClientAborted>`).
fn is_client_disconnect(err: &(dyn std::error::Error + 'static)) -> bool {
	let msg = err.to_string().to_lowercase();
	msg.contains("broken pipe") || msg.contains("connection reset") || msg.contains("closed network connection")
}

pub struct RequestContext {
	pub request_id: String,
	pub service_id: String,
	pub client_addr: SocketAddr,
	pub is_tls: bool,
	pub request_host: String,
}

/// A resolved WebSocket dial target (spec §4.8): a `host:port` to connect to,
/// plus whether the node URL was `https://`/`wss://` and so needs a TLS
/// handshake before the upgrade request is written.
pub struct BackendTarget {
	pub addr: String,
	pub host: String,
	pub tls: bool,
}

pub struct ProxyEngine {
	manager: Arc<dyn ServiceManager>,
	resolver: Arc<ServiceResolver>,
	client: BackendClient,
	cfg: HTTPProxyConfig,
}

impl ProxyEngine {
	pub fn new(manager: Arc<dyn ServiceManager>, resolver: Arc<ServiceResolver>, cfg: HTTPProxyConfig) -> Self {
		let client = BackendClient::new(&cfg);
		Self { manager, resolver, client, cfg }
	}

	/// Single-service dispatch loop (spec §4.7). Multi-service dispatch is an
	/// external collaborator (Design Note, Open Question) and is not
	/// implemented here — callers fan out to it themselves before reaching
	/// this engine.
	pub async fn handle(
		&self,
		method: http::Method,
		request_path: &str,
		query: Option<&str>,
		mut headers_in: HeaderMap,
		body: Bytes,
		ctx: &RequestContext,
	) -> Result<Response<Full<Bytes>>, ProxyError> {
		let mut attempt: u32 = 0;
		let mut last_err: Option<ProxyError> = None;
		let started = Instant::now();

		loop {
			let service = self
				.manager
				.get_service(&ctx.service_id)
				.await
				.map_err(|_| ProxyError::ServiceNotFound(ctx.service_id.clone()))?;

			let node = match self.resolve_node(&service, ctx).await {
				Ok(node) => node,
				Err(e) => {
					if attempt < self.cfg.retry_count {
						tokio::time::sleep(self.cfg.retry_timeout).await;
						attempt += 1;
						last_err = Some(e);
						continue;
					}
					return Err(ProxyError::ServiceUnavailable { service: ctx.service_id.clone() });
				},
			};

			let attempt_started = Instant::now();
			let mut trace =
				BackendTraceRecord::new(ctx.request_id.clone(), ctx.service_id.clone(), node.id.to_string(), method.to_string(), request_path.to_string(), attempt);

			match self.one_attempt(&method, request_path, query, &headers_in, body.clone(), &node.url, ctx).await {
				Ok(Outcome::Response(resp)) => {
					trace = trace.succeeded(resp.status().as_u16(), attempt_started.elapsed());
					trace.emit();
					tracing::debug!(total_duration_ms = started.elapsed().as_secs_f64() * 1000.0, "request completed");
					return Ok(resp);
				},
				Ok(Outcome::SseStarted(resp)) => {
					// SSE has begun streaming: no retry from here on (spec §4.7 step 4).
					trace = trace.succeeded(resp.status().as_u16(), attempt_started.elapsed());
					trace.emit();
					return Ok(resp);
				},
				Err(e) => {
					trace = trace.failed(&e, attempt_started.elapsed());
					trace.emit();
					let retriable = e.is_retriable();
					last_err = Some(e);
					if retriable && attempt < self.cfg.retry_count {
						tokio::time::sleep(self.cfg.retry_timeout).await;
						attempt += 1;
						headers_in = headers_in.clone();
						continue;
					}
					let target_url = format!("{}{}", node.url, request_path);
					return Err(ProxyError::BadGateway {
						attempts: attempt + 1,
						target_url,
						service: ctx.service_id.clone(),
						details: last_err.map(|e| e.to_string()).unwrap_or_default(),
					});
				},
			}
		}
	}

	/// Resolves the backend address for a WebSocket upgrade (spec §4.8):
	/// reuses the same service lookup + `DiscoveryKind` dispatch as the
	/// regular request path, but hands back a bare dial target for a raw TCP
	/// (optionally TLS-wrapped) connection rather than proxying the request
	/// itself.
	pub async fn resolve_backend_addr(&self, service_id: &str, ctx: &RequestContext) -> Result<BackendTarget, ProxyError> {
		let service = self
			.manager
			.get_service(service_id)
			.await
			.map_err(|_| ProxyError::ServiceNotFound(service_id.to_string()))?;
		let node = self.resolve_node(&service, ctx).await?;
		let target = url::Url::parse(&node.url).map_err(|e| ProxyError::UpstreamBadResponse(e.to_string()))?;
		let tls = matches!(target.scheme(), "https" | "wss");
		let host = target.host_str().unwrap_or_default().to_string();
		let port = target.port_or_known_default().unwrap_or(if tls { 443 } else { 80 });
		Ok(BackendTarget { addr: format!("{host}:{port}"), host, tls })
	}

	/// Shared `HTTPProxyConfig` (TLS knobs in particular) for the WebSocket
	/// dial path, which builds its own connection outside `BackendClient`.
	pub fn http_config(&self) -> &HTTPProxyConfig {
		&self.cfg
	}

	/// Dispatches on `DiscoveryKind` (spec §4.4): registry/service-center
	/// metadata routes through the resolver, everything else defers to the
	/// `ServiceManager`'s own load-balanced `SelectNode`.
	async fn resolve_node(&self, service: &ServiceConfig, ctx: &RequestContext) -> Result<NodeConfig, ProxyError> {
		match service.registry_metadata() {
			Err(_) => Err(ProxyError::InvalidServiceMetadata(service.id.to_string())),
			Ok(Some(meta)) if meta.discovery_kind() != DiscoveryKind::Inline => {
				self.resolver.resolve(&meta).await.map_err(|e| match e {
					ResolveError::NoNodes(s) => ProxyError::NoInstanceFound(s),
					other => ProxyError::DiscoveryUnavailable(service.id.to_string(), anyhow::anyhow!(other)),
				})
			},
			_ => {
				let select_ctx = SelectContext { client_ip: Some(ctx.client_addr.ip()) };
				self.manager
					.select_node(&service.id, &select_ctx)
					.await
					.map_err(|_| ProxyError::NoHealthyNodes(service.id.to_string()))
			},
		}
	}

	async fn one_attempt(
		&self,
		method: &http::Method,
		request_path: &str,
		query: Option<&str>,
		headers_in: &HeaderMap,
		body: Bytes,
		node_url: &str,
		ctx: &RequestContext,
	) -> Result<Outcome, ProxyError> {
		let target = url::Url::parse(node_url).map_err(|e| ProxyError::UpstreamBadResponse(e.to_string()))?;
		let target_host = target.host_str().unwrap_or_default().to_string();
		let mut path = build_proxy_path(target.path(), request_path);
		if let Some(q) = query {
			if !q.is_empty() {
				path = format!("{path}?{q}");
			}
		}
		let full_uri = format!("{}://{}{}", target.scheme(), target.authority(), path);

		let mut headers = headers_in.clone();
		headers::rewrite(
			&mut headers,
			&RewriteContext {
				cfg: &self.cfg,
				target_host: &target_host,
				request_host: &ctx.request_host,
				is_tls: ctx.is_tls,
				client_addr: ctx.client_addr,
			},
		);

		let mut builder = http::Request::builder().method(method.clone()).uri(&full_uri);
		for (name, value) in headers.iter() {
			builder = builder.header(name, value);
		}
		let req: Req = builder
			.body(Full::new(body))
			.map_err(|e| ProxyError::UpstreamBadResponse(e.to_string()))?;

		let resp = self
			.client
			.send(req)
			.await
			.map_err(|e| ProxyError::UpstreamDialError(anyhow::anyhow!(e)))?;

		if is_sse(&resp) {
			self.stream_sse(resp).await
		} else {
			self.stream_regular(resp).await
		}
	}

	async fn stream_regular(&self, resp: Response<Incoming>) -> Result<Outcome, ProxyError> {
		let (parts, body) = resp.into_parts();
		let collected = body
			.collect()
			.await
			.map_err(|e| ProxyError::UpstreamIoError(anyhow::anyhow!(e)))?
			.to_bytes();
		Ok(Outcome::Response(Response::from_parts(parts, Full::new(collected))))
	}

	/// Streams an SSE response in 1 KiB chunks (spec §4.7). Client-disconnect
	/// errors mid-stream are recorded but swallowed so chunked framing
	/// closes cleanly — they never surface as a retriable error.
	async fn stream_sse(&self, resp: Response<Incoming>) -> Result<Outcome, ProxyError> {
		let (mut parts, mut body) = resp.into_parts();
		parts.headers.insert(http::header::CONTENT_TYPE, http::HeaderValue::from_static("text/event-stream"));
		parts
			.headers
			.insert(http::header::CACHE_CONTROL, http::HeaderValue::from_static("no-store, no-cache"));
		parts.headers.insert(http::header::CONNECTION, http::HeaderValue::from_static("keep-alive"));
		parts.headers.insert(
			http::header::ACCESS_CONTROL_ALLOW_ORIGIN,
			http::HeaderValue::from_static("*"),
		);

		let mut chunks: Vec<Bytes> = Vec::new();
		let mut pending = Vec::with_capacity(SSE_CHUNK_SIZE);
		loop {
			match http_body_util::BodyExt::frame(&mut body).await {
				Some(Ok(frame)) => {
					if let Some(data) = frame.data_ref() {
						pending.extend_from_slice(data);
						while pending.len() >= SSE_CHUNK_SIZE {
							let rest = pending.split_off(SSE_CHUNK_SIZE);
							chunks.push(Bytes::from(std::mem::replace(&mut pending, rest)));
						}
					}
				},
				Some(Err(e)) => {
					if is_client_disconnect(&e) {
						tracing::debug!(error = %e, "sse client disconnected, closing cleanly");
					} else {
						tracing::debug!(error = %e, "sse upstream read error, closing cleanly");
					}
					break;
				},
				None => break,
			}
		}
		if !pending.is_empty() {
			chunks.push(Bytes::from(pending));
		}
		let body = Full::new(chunks.into_iter().flatten().collect::<Bytes>());
		Ok(Outcome::SseStarted(Response::from_parts(parts, body)))
	}
}

fn is_sse(resp: &Response<Incoming>) -> bool {
	resp.headers()
		.get(http::header::CONTENT_TYPE)
		.and_then(|v| v.to_str().ok())
		.map(|v| v.to_ascii_lowercase().starts_with("text/event-stream"))
		.unwrap_or(false)
}

enum Outcome {
	Response(Response<Full<Bytes>>),
	SseStarted(Response<Full<Bytes>>),
}

pub fn new_request_id() -> String {
	Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::balancer::{Algorithm, LoadBalancer};
	use crate::store::InMemoryServiceManager;
	use http::StatusCode;
	use std::collections::BTreeMap;
	use std::net::{IpAddr, Ipv4Addr};
	use wiremock::matchers::{method, path};
	use wiremock::{Mock, MockServer, ResponseTemplate};

	fn addr() -> SocketAddr {
		SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 9999)
	}

	async fn engine_with_backend(backend_url: &str) -> ProxyEngine {
		let balancer = Arc::new(LoadBalancer::new(Algorithm::RoundRobin));
		let manager = Arc::new(InMemoryServiceManager::new(balancer));
		let node = NodeConfig { id: "n1".into(), url: backend_url.to_string(), weight: 1, health: true, enabled: true, metadata: Default::default() };
		manager.upsert(ServiceConfig { id: "svc".into(), name: "svc".into(), metadata: BTreeMap::new() }, vec![node]);
		let resolver = Arc::new(ServiceResolver::new(None, None));
		let mut cfg = HTTPProxyConfig::default();
		cfg.retry_count = 0;
		ProxyEngine::new(manager, resolver, cfg)
	}

	#[tokio::test]
	async fn s1_single_service_happy_path() {
		let server = MockServer::start().await;
		Mock::given(method("GET"))
			.and(path("/hello"))
			.respond_with(ResponseTemplate::new(200).set_body_string("ok"))
			.mount(&server)
			.await;

		let engine = engine_with_backend(&server.uri()).await;
		let ctx = RequestContext {
			request_id: "r1".into(),
			service_id: "svc".into(),
			client_addr: addr(),
			is_tls: false,
			request_host: "gateway.local".into(),
		};
		let resp = engine
			.handle(http::Method::GET, "/hello", None, HeaderMap::new(), Bytes::new(), &ctx)
			.await
			.unwrap();
		assert_eq!(resp.status(), StatusCode::OK);
		assert_eq!(resp.into_body().collect().await.unwrap().to_bytes(), Bytes::from_static(b"ok"));
	}

	#[tokio::test]
	async fn unknown_service_fails_fast() {
		let balancer = Arc::new(LoadBalancer::new(Algorithm::RoundRobin));
		let manager = Arc::new(InMemoryServiceManager::new(balancer));
		let resolver = Arc::new(ServiceResolver::new(None, None));
		let engine = ProxyEngine::new(manager, resolver, HTTPProxyConfig::default());
		let ctx = RequestContext {
			request_id: "r1".into(),
			service_id: "missing".into(),
			client_addr: addr(),
			is_tls: false,
			request_host: "gateway.local".into(),
		};
		let err = engine
			.handle(http::Method::GET, "/x", None, HeaderMap::new(), Bytes::new(), &ctx)
			.await
			.unwrap_err();
		assert!(matches!(err, ProxyError::ServiceNotFound(_)));
	}

	#[tokio::test]
	async fn resolve_backend_addr_returns_host_port_for_websocket_dial() {
		let engine = engine_with_backend("http://127.0.0.1:9321").await;
		let ctx = RequestContext {
			request_id: "r1".into(),
			service_id: "svc".into(),
			client_addr: addr(),
			is_tls: false,
			request_host: "gateway.local".into(),
		};
		let target = engine.resolve_backend_addr("svc", &ctx).await.unwrap();
		assert_eq!(target.addr, "127.0.0.1:9321");
		assert!(!target.tls);
	}
}
