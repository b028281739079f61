//! Header rewriting (spec §4.6, component C6): hop-by-hop stripping,
//! Connection-token expansion, X-Forwarded-*, pass/hide/set directives.

use std::net::SocketAddr;

use http::{HeaderMap, HeaderName, HeaderValue};

use crate::config::HTTPProxyConfig;

/// RFC 7230 §6.1 hop-by-hop headers, plus the headers the HTTP client
/// manages on our behalf (spec §4.6 bullet 1).
const ALWAYS_STRIPPED: &[&str] = &[
	"connection",
	"keep-alive",
	"proxy-authenticate",
	"proxy-authorization",
	"te",
	"trailers",
	"upgrade",
	"host",
	"content-length",
	"transfer-encoding",
];

const SYSTEM_HEADERS: &[&str] = &[
	"host",
	"x-forwarded-for",
	"x-real-ip",
	"x-forwarded-proto",
	"x-forwarded-host",
	"user-agent",
];

pub struct RewriteContext<'a> {
	pub cfg: &'a HTTPProxyConfig,
	pub target_host: &'a str,
	pub request_host: &'a str,
	pub is_tls: bool,
	pub client_addr: SocketAddr,
}

/// Extracts the client IP per spec §4.6's priority: `X-Forwarded-For`
/// first token, then `X-Real-IP`, then the TCP peer address.
pub fn client_ip(headers: &HeaderMap, peer: SocketAddr) -> String {
	if let Some(v) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
		if let Some(first) = v.split(',').next() {
			let trimmed = first.trim();
			if !trimmed.is_empty() {
				return trimmed.to_string();
			}
		}
	}
	if let Some(v) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
		let trimmed = v.trim();
		if !trimmed.is_empty() {
			return trimmed.to_string();
		}
	}
	peer.ip().to_string()
}

/// Tokens named in a `Connection` header must also be stripped (spec §4.6
/// bullet 1, "plus any header listed as a token in Connection").
fn connection_tokens(headers: &HeaderMap) -> Vec<String> {
	headers
		.get_all(http::header::CONNECTION)
		.iter()
		.filter_map(|v| v.to_str().ok())
		.flat_map(|v| v.split(','))
		.map(|s| s.trim().to_ascii_lowercase())
		.filter(|s| !s.is_empty())
		.collect()
}

/// Rewrites `headers` in place for the outbound request, per spec §4.6.
pub fn rewrite(headers: &mut HeaderMap, ctx: &RewriteContext) {
	let extra_hop_by_hop = connection_tokens(headers);

	for name in ALWAYS_STRIPPED {
		headers.remove(*name);
	}
	for name in &extra_hop_by_hop {
		if let Ok(name) = HeaderName::from_bytes(name.as_bytes()) {
			headers.remove(name);
		}
	}
	// Never let callers set Accept-Encoding; the client chooses & decompresses.
	headers.remove(http::header::ACCEPT_ENCODING);

	for (k, v) in &ctx.cfg.set_headers {
		if let (Ok(name), Ok(value)) = (HeaderName::from_bytes(k.as_bytes()), HeaderValue::from_str(v)) {
			headers.insert(name, value);
		}
	}
	if !headers.contains_key(http::header::USER_AGENT) {
		headers.insert(
			http::header::USER_AGENT,
			HeaderValue::from_static("relaygate-proxy"),
		);
	}

	if ctx.cfg.add_x_forwarded_for {
		let client = ctx.client_addr.ip().to_string();
		let existing = headers
			.get("x-forwarded-for")
			.and_then(|v| v.to_str().ok())
			.map(|v| v.to_string());
		let new_val = match existing {
			Some(prev) if !prev.is_empty() => format!("{prev}, {client}"),
			_ => client,
		};
		if let Ok(v) = HeaderValue::from_str(&new_val) {
			headers.insert(HeaderName::from_static("x-forwarded-for"), v);
		}
	}
	if ctx.cfg.add_x_real_ip {
		if let Ok(v) = HeaderValue::from_str(&client_ip(headers, ctx.client_addr)) {
			headers.insert(HeaderName::from_static("x-real-ip"), v);
		}
	}
	if ctx.cfg.add_x_forwarded_proto {
		let scheme = if ctx.is_tls { "https" } else { "http" };
		headers.insert(
			HeaderName::from_static("x-forwarded-proto"),
			HeaderValue::from_static(scheme),
		);
		if let Ok(v) = HeaderValue::from_str(ctx.request_host) {
			headers.insert(HeaderName::from_static("x-forwarded-host"), v);
		}
	}

	let host_value = if ctx.cfg.preserve_host { ctx.request_host } else { ctx.target_host };
	if let Ok(v) = HeaderValue::from_str(host_value) {
		headers.insert(http::header::HOST, v);
	}

	for name in &ctx.cfg.hide_headers {
		if let Ok(name) = HeaderName::from_bytes(name.to_ascii_lowercase().as_bytes()) {
			headers.remove(name);
		}
	}

	if !ctx.cfg.pass_headers.is_empty() {
		let allow: Vec<String> = ctx.cfg.pass_headers.iter().map(|s| s.to_ascii_lowercase()).collect();
		let to_remove: Vec<HeaderName> = headers
			.keys()
			.filter(|name| {
				let lower = name.as_str();
				!(SYSTEM_HEADERS.contains(&lower) || allow.iter().any(|a| a == lower))
			})
			.cloned()
			.collect();
		for name in to_remove {
			headers.remove(name);
		}
	}

	let connection_value = if ctx.cfg.keep_alive && ctx.cfg.http_version == "1.1" { "" } else { "close" };
	if let Ok(v) = HeaderValue::from_str(connection_value) {
		headers.insert(http::header::CONNECTION, v);
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::net::{IpAddr, Ipv4Addr};

	fn addr() -> SocketAddr {
		SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 4242)
	}

	#[test]
	fn hop_by_hop_headers_never_survive() {
		let cfg = HTTPProxyConfig::default();
		let mut headers = HeaderMap::new();
		headers.insert(http::header::CONNECTION, HeaderValue::from_static("keep-alive, x-custom"));
		headers.insert(HeaderName::from_static("x-custom"), HeaderValue::from_static("v"));
		headers.insert(http::header::UPGRADE, HeaderValue::from_static("websocket"));
		headers.insert(http::header::TE, HeaderValue::from_static("trailers"));

		rewrite(
			&mut headers,
			&RewriteContext {
				cfg: &cfg,
				target_host: "backend.local",
				request_host: "gateway.local",
				is_tls: false,
				client_addr: addr(),
			},
		);

		for name in ALWAYS_STRIPPED {
			assert!(!headers.contains_key(*name), "{name} should have been stripped");
		}
		assert!(!headers.contains_key("x-custom"), "token named in Connection should be stripped");
	}

	#[test]
	fn pass_headers_restricts_to_allow_list_plus_system() {
		let mut cfg = HTTPProxyConfig::default();
		cfg.pass_headers = vec!["x-allowed".to_string()];
		let mut headers = HeaderMap::new();
		headers.insert(HeaderName::from_static("x-allowed"), HeaderValue::from_static("1"));
		headers.insert(HeaderName::from_static("x-blocked"), HeaderValue::from_static("1"));

		rewrite(
			&mut headers,
			&RewriteContext {
				cfg: &cfg,
				target_host: "backend.local",
				request_host: "gateway.local",
				is_tls: false,
				client_addr: addr(),
			},
		);

		assert!(headers.contains_key("x-allowed"));
		assert!(!headers.contains_key("x-blocked"));
		assert!(headers.contains_key(http::header::HOST), "system headers survive passHeaders");
	}

	#[test]
	fn preserve_host_uses_request_host() {
		let mut cfg = HTTPProxyConfig::default();
		cfg.preserve_host = true;
		let mut headers = HeaderMap::new();
		rewrite(
			&mut headers,
			&RewriteContext {
				cfg: &cfg,
				target_host: "backend.local",
				request_host: "gateway.local",
				is_tls: false,
				client_addr: addr(),
			},
		);
		assert_eq!(headers.get(http::header::HOST).unwrap(), "gateway.local");
	}

	#[test]
	fn client_ip_prefers_xff_then_xrealip_then_peer() {
		let mut headers = HeaderMap::new();
		assert_eq!(client_ip(&headers, addr()), "10.0.0.1");
		headers.insert(HeaderName::from_static("x-real-ip"), HeaderValue::from_static("1.1.1.1"));
		assert_eq!(client_ip(&headers, addr()), "1.1.1.1");
		headers.insert(HeaderName::from_static("x-forwarded-for"), HeaderValue::from_static("2.2.2.2, 3.3.3.3"));
		assert_eq!(client_ip(&headers, addr()), "2.2.2.2");
	}
}
