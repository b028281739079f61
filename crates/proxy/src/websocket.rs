//! WebSocket upgrade handler (spec §4.8, component C8): detect, dial raw
//! TCP (or TLS, for `wss://`/`https://` nodes) to the backend, hijack the
//! downstream connection, then relay bytes in both directions until either
//! side closes or the server shuts down.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use http::{HeaderMap, Request};
use hyper::body::Incoming;
use hyper::upgrade::Upgraded;
use hyper_util::rt::TokioIo;
use rustls::ClientConfig;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;

use crate::config::HTTPProxyConfig;
use crate::engine::BackendTarget;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Detection per spec §4.8: `Connection` contains the `Upgrade` token
/// (case-insensitive) and `Upgrade` equals `websocket`.
pub fn is_upgrade_request(headers: &HeaderMap) -> bool {
	let has_connection_upgrade = headers
		.get_all(http::header::CONNECTION)
		.iter()
		.filter_map(|v| v.to_str().ok())
		.flat_map(|v| v.split(','))
		.any(|tok| tok.trim().eq_ignore_ascii_case("upgrade"));
	let is_websocket = headers
		.get(http::header::UPGRADE)
		.and_then(|v| v.to_str().ok())
		.map(|v| v.eq_ignore_ascii_case("websocket"))
		.unwrap_or(false);
	has_connection_upgrade && is_websocket
}

#[derive(Debug, thiserror::Error)]
pub enum WebSocketError {
	#[error("failed to dial backend {0:?}: {1}")]
	Dial(String, #[source] std::io::Error),
	#[error("invalid TLS server name {0:?}: {1}")]
	ServerName(String, #[source] rustls_pki_types::InvalidDnsNameError),
	#[error("TLS handshake with backend {0:?} failed: {1}")]
	Tls(String, #[source] std::io::Error),
	#[error("failed to hijack the downstream connection: {0}")]
	Hijack(#[source] hyper::Error),
	#[error("failed to write upgrade request upstream: {0}")]
	UpstreamWrite(#[source] std::io::Error),
}

/// Either side of a bridged WebSocket connection: a plain TCP socket, or one
/// wrapped in TLS for a `wss://`/`https://` node. Grounded on the teacher
/// fork's `SocketType` (manual `AsyncRead`/`AsyncWrite` delegation unifies
/// the two under one type so `copy_bidirectional` can operate on either).
pub enum BackendStream {
	Plain(TcpStream),
	Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for BackendStream {
	fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
		match self.get_mut() {
			BackendStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
			BackendStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
		}
	}
}

impl AsyncWrite for BackendStream {
	fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
		match self.get_mut() {
			BackendStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
			BackendStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
		}
	}

	fn poll_write_vectored(self: Pin<&mut Self>, cx: &mut Context<'_>, bufs: &[std::io::IoSlice<'_>]) -> Poll<std::io::Result<usize>> {
		match self.get_mut() {
			BackendStream::Plain(s) => Pin::new(s).poll_write_vectored(cx, bufs),
			BackendStream::Tls(s) => Pin::new(s.as_mut()).poll_write_vectored(cx, bufs),
		}
	}

	fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
		match self.get_mut() {
			BackendStream::Plain(s) => Pin::new(s).poll_flush(cx),
			BackendStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
		}
	}

	fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
		match self.get_mut() {
			BackendStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
			BackendStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
		}
	}
}

/// Dials `target` (TLS-wrapping the connection when the node URL was
/// `https://`/`wss://`) and writes the original request line + headers
/// (minus hop-by-hop, but keeping `Upgrade`/`Connection`/`Sec-WebSocket-*`)
/// verbatim, per spec §4.8.
pub async fn dial_and_prime(target: &BackendTarget, cfg: &HTTPProxyConfig, req: &Request<Incoming>) -> Result<BackendStream, WebSocketError> {
	let tcp = TcpStream::connect(&target.addr).await.map_err(|e| WebSocketError::Dial(target.addr.clone(), e))?;
	tcp.set_nodelay(true).ok();

	let mut stream = if target.tls {
		let tls_cfg: Arc<ClientConfig> = Arc::new(crate::tls::client_config(cfg));
		let server_name =
			crate::tls::server_name(cfg, &target.host).map_err(|e| WebSocketError::ServerName(target.host.clone(), e))?;
		let connector = TlsConnector::from(tls_cfg);
		let tls = connector
			.connect(server_name, tcp)
			.await
			.map_err(|e| WebSocketError::Tls(target.addr.clone(), e))?;
		BackendStream::Tls(Box::new(tls))
	} else {
		BackendStream::Plain(tcp)
	};

	write_upgrade_request(&mut stream, req).await?;
	Ok(stream)
}

async fn write_upgrade_request(stream: &mut BackendStream, req: &Request<Incoming>) -> Result<(), WebSocketError> {
	let path = req.uri().path_and_query().map(|p| p.as_str()).unwrap_or("/");
	let mut out = format!("{} {} HTTP/1.1\r\n", req.method(), path);
	for (name, value) in req.headers() {
		let lower = name.as_str();
		if matches!(lower, "content-length" | "transfer-encoding") {
			continue;
		}
		if let Ok(v) = value.to_str() {
			out.push_str(name.as_str());
			out.push_str(": ");
			out.push_str(v);
			out.push_str("\r\n");
		}
	}
	out.push_str("\r\n");

	stream.write_all(out.as_bytes()).await.map_err(WebSocketError::UpstreamWrite)
}

/// Takes over the downstream connection after the 101 response has been
/// sent, and relays bytes bidirectionally until either side closes or the
/// server begins shutting down, at which point both peers are closed within
/// a bounded grace window (spec §4.8, §4.13 draining). Hijack failures here
/// must not invoke the standard HTTP abort path — callers only get this far
/// once the upgrade handshake has already succeeded.
pub async fn bridge(upgraded: Upgraded, mut backend: BackendStream, shutdown: CancellationToken) -> Result<(u64, u64), WebSocketError> {
	let mut client = TokioIo::new(upgraded);
	tokio::select! {
		result = tokio::io::copy_bidirectional(&mut client, &mut backend) => {
			match result {
				Ok(counts) => Ok(counts),
				Err(e) => {
					tracing::debug!(error = %e, "websocket bridge ended with an I/O error");
					Ok((0, 0))
				},
			}
		},
		_ = shutdown.cancelled() => {
			tracing::debug!("server shutting down, closing websocket bridge");
			if tokio::time::timeout(SHUTDOWN_GRACE, async {
				let _ = client.shutdown().await;
				let _ = backend.shutdown().await;
			})
			.await
			.is_err()
			{
				tracing::debug!("websocket shutdown grace window elapsed, forcing close");
			}
			Ok((0, 0))
		},
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use http::HeaderValue;

	#[test]
	fn detects_websocket_upgrade() {
		let mut headers = HeaderMap::new();
		headers.insert(http::header::CONNECTION, HeaderValue::from_static("Upgrade"));
		headers.insert(http::header::UPGRADE, HeaderValue::from_static("websocket"));
		assert!(is_upgrade_request(&headers));
	}

	#[test]
	fn ignores_non_websocket_upgrade() {
		let mut headers = HeaderMap::new();
		headers.insert(http::header::CONNECTION, HeaderValue::from_static("Upgrade"));
		headers.insert(http::header::UPGRADE, HeaderValue::from_static("h2c"));
		assert!(!is_upgrade_request(&headers));
	}

	#[test]
	fn requires_both_connection_token_and_upgrade_header() {
		let mut headers = HeaderMap::new();
		headers.insert(http::header::UPGRADE, HeaderValue::from_static("websocket"));
		assert!(!is_upgrade_request(&headers));
	}
}
