//! Downstream HTTP listener: accepts client connections, extracts a
//! [`RequestContext`], and hands each request to the [`ProxyEngine`] (spec
//! §4.7, component C7). Grounded on the teacher's inbound-listener shape
//! (accept loop, one spawned task per connection, `hyper_util` server conn
//! builder over `TokioIo`) rather than its xDS-driven route matching, since
//! that layer is out of scope (spec §1).

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http::{HeaderValue, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder;
use relaygate_proxy::engine::new_request_id;
use relaygate_proxy::websocket;
use relaygate_proxy::{ProxyEngine, ProxyError, RequestContext};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Out of scope (spec §1 "request routing/admin config loading" is an
/// external collaborator): callers pick a service by setting this header
/// rather than the gateway deriving it from a route table.
const SERVICE_HEADER: &str = "x-relaygate-service";

/// `shutdown` bounds both the accept loop and any in-flight WebSocket
/// bridges (spec §4.13 draining): cancelling it stops new connections and
/// gives live bridges `SHUTDOWN_GRACE` to close before the process exits.
pub async fn serve(addr: SocketAddr, engine: Arc<ProxyEngine>, shutdown: CancellationToken) -> anyhow::Result<()> {
	let listener = TcpListener::bind(addr).await?;
	tracing::info!(%addr, "http proxy listening");

	loop {
		let (stream, peer_addr) = tokio::select! {
			biased;
			_ = shutdown.cancelled() => {
				tracing::info!("http proxy shutting down, no longer accepting connections");
				return Ok(());
			},
			accepted = listener.accept() => match accepted {
				Ok(pair) => pair,
				Err(e) => {
					tracing::warn!(error = %e, "failed to accept connection");
					continue;
				},
			},
		};
		let engine = engine.clone();
		let shutdown = shutdown.clone();
		tokio::task::spawn(async move {
			let io = TokioIo::new(stream);
			let service = service_fn(move |req| handle(engine.clone(), peer_addr, shutdown.clone(), req));
			if let Err(e) = Builder::new(TokioExecutor::new()).serve_connection(io, service).await {
				tracing::debug!(error = %e, "connection closed with error");
			}
		});
	}
}

async fn handle(
	engine: Arc<ProxyEngine>,
	peer_addr: SocketAddr,
	shutdown: CancellationToken,
	mut req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, Infallible> {
	let Some(service_id) = req.headers().get(SERVICE_HEADER).and_then(|v| v.to_str().ok()).map(str::to_string) else {
		return Ok(error_response(StatusCode::BAD_REQUEST, "missing x-relaygate-service header"));
	};

	// WebSocket-upgrade short-circuit (spec §4.8): delegate entirely to C8,
	// no retries, before the body is ever touched.
	if websocket::is_upgrade_request(req.headers()) {
		return Ok(handle_websocket_upgrade(engine, peer_addr, shutdown, service_id, &mut req).await);
	}

	let (parts, body) = req.into_parts();

	let body_bytes = match body.collect().await {
		Ok(collected) => collected.to_bytes(),
		Err(e) => {
			tracing::debug!(error = %e, "failed to read request body");
			return Ok(error_response(StatusCode::BAD_REQUEST, "failed to read request body"));
		},
	};

	let request_host = parts
		.headers
		.get(http::header::HOST)
		.and_then(|v| v.to_str().ok())
		.unwrap_or_default()
		.to_string();

	let ctx = RequestContext {
		request_id: new_request_id(),
		service_id,
		client_addr: peer_addr,
		is_tls: false,
		request_host,
	};

	let path = parts.uri.path().to_string();
	let query = parts.uri.query().map(str::to_string);

	match engine.handle(parts.method, &path, query.as_deref(), parts.headers, body_bytes, &ctx).await {
		Ok(resp) => Ok(resp),
		Err(e) => {
			tracing::warn!(error = %e, service_id = %ctx.service_id, request_id = %ctx.request_id, "request failed");
			Ok(error_json_response(&e))
		},
	}
}

/// Resolves a backend, primes the upstream connection, then hijacks the
/// downstream one via `hyper::upgrade::on` and relays bytes in the
/// background (spec §4.8). Returns the `101` the client needs to see; the
/// actual bridge only starts once that response has gone out and hyper
/// hands back the upgraded connection.
/// `shutdown` is cloned into the spawned bridge task so a server shutdown
/// closes live WebSocket connections within the grace window documented on
/// [`websocket::bridge`] instead of leaving them running indefinitely.
async fn handle_websocket_upgrade(
	engine: Arc<ProxyEngine>,
	peer_addr: SocketAddr,
	shutdown: CancellationToken,
	service_id: String,
	req: &mut Request<Incoming>,
) -> Response<Full<Bytes>> {
	let request_host = req
		.headers()
		.get(http::header::HOST)
		.and_then(|v| v.to_str().ok())
		.unwrap_or_default()
		.to_string();
	let ctx = RequestContext { request_id: new_request_id(), service_id: service_id.clone(), client_addr: peer_addr, is_tls: false, request_host };

	let target = match engine.resolve_backend_addr(&service_id, &ctx).await {
		Ok(target) => target,
		Err(e) => {
			tracing::warn!(error = %e, service_id = %service_id, "failed to resolve websocket backend");
			return error_json_response(&e);
		},
	};

	let backend = match websocket::dial_and_prime(&target, engine.http_config(), req).await {
		Ok(stream) => stream,
		Err(e) => {
			tracing::warn!(error = %e, service_id = %service_id, "failed to prime websocket upstream");
			return error_response(StatusCode::BAD_GATEWAY, "failed to reach backend");
		},
	};

	let upgrade_header = req.headers().get(http::header::UPGRADE).cloned().unwrap_or_else(|| HeaderValue::from_static("websocket"));
	let on_upgrade = hyper::upgrade::on(req);
	tokio::task::spawn(async move {
		match on_upgrade.await {
			Ok(upgraded) => {
				if let Err(e) = websocket::bridge(upgraded, backend, shutdown).await {
					tracing::debug!(error = %e, "websocket bridge ended with an error");
				}
			},
			Err(e) => tracing::debug!(error = %e, "failed to hijack the downstream connection"),
		}
	});

	Response::builder()
		.status(StatusCode::SWITCHING_PROTOCOLS)
		.header(http::header::UPGRADE, upgrade_header)
		.header(http::header::CONNECTION, HeaderValue::from_static("Upgrade"))
		.body(Full::new(Bytes::new()))
		.unwrap_or_else(|_| Response::new(Full::new(Bytes::new())))
}

fn error_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
	let body = serde_json::json!({ "error": message }).to_string();
	Response::builder()
		.status(status)
		.header(http::header::CONTENT_TYPE, "application/json")
		.body(Full::new(Bytes::from(body)))
		.unwrap_or_else(|_| Response::new(Full::new(Bytes::new())))
}

fn error_json_response(err: &ProxyError) -> Response<Full<Bytes>> {
	let status = StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
	let body = serde_json::to_string(&err.to_error_body()).unwrap_or_else(|_| "{}".to_string());
	Response::builder()
		.status(status)
		.header(http::header::CONTENT_TYPE, "application/json")
		.body(Full::new(Bytes::from(body)))
		.unwrap_or_else(|_| Response::new(Full::new(Bytes::new())))
}
