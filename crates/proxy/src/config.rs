//! Tolerant `HTTPProxyConfig` decoder (spec §2 C1, §3 HTTPProxyConfig table).
//!
//! Accepts camelCase or snake_case keys, numeric-or-duration-string
//! timeouts, and coerces bool/list/map shapes, rather than failing closed
//! the way a `deny_unknown_fields` struct would — the recognized-key table
//! below is the single place that knows about this (Design Note: "Centralize
//! into a single tolerant decoder").

use std::collections::BTreeMap;
use std::time::Duration;

use indexmap::IndexMap;
use serde_json::Value;

#[derive(Debug, Clone)]
pub struct HTTPProxyConfig {
	pub timeout: Duration,
	pub connect_timeout: Duration,
	pub read_timeout: Duration,
	pub send_timeout: Option<Duration>,
	pub follow_redirects: bool,
	pub redirect_limit: u32,
	pub keep_alive: bool,
	pub http_version: String,
	pub max_idle_conns: usize,
	pub idle_conn_timeout: Duration,
	pub buffer_size: usize,
	pub max_buffer_size: usize,
	pub proxy_buffering: bool,
	pub retry_count: u32,
	pub retry_timeout: Duration,
	pub set_headers: IndexMap<String, String>,
	pub pass_headers: Vec<String>,
	pub hide_headers: Vec<String>,
	pub preserve_host: bool,
	pub add_x_forwarded_for: bool,
	pub add_x_real_ip: bool,
	pub add_x_forwarded_proto: bool,
	pub tls_insecure_skip_verify: bool,
	pub tls_server_name: Option<String>,
	pub copy_response_body: bool,
}

impl Default for HTTPProxyConfig {
	fn default() -> Self {
		Self {
			timeout: Duration::from_secs(30),
			connect_timeout: Duration::from_secs(30),
			read_timeout: Duration::from_secs(30),
			send_timeout: None,
			follow_redirects: false,
			redirect_limit: 5,
			keep_alive: true,
			http_version: "1.1".to_string(),
			max_idle_conns: 100,
			idle_conn_timeout: Duration::from_secs(90),
			buffer_size: 8 * 1024,
			max_buffer_size: 64 * 1024,
			proxy_buffering: true,
			retry_count: 0,
			retry_timeout: Duration::from_millis(100),
			set_headers: IndexMap::new(),
			pass_headers: Vec::new(),
			hide_headers: Vec::new(),
			preserve_host: false,
			add_x_forwarded_for: true,
			add_x_real_ip: true,
			add_x_forwarded_proto: true,
			tls_insecure_skip_verify: false,
			tls_server_name: None,
			copy_response_body: false,
		}
	}
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
	#[error("invalid value for {key}: {reason}")]
	InvalidValue { key: &'static str, reason: String },
	#[error("bufferSize ({buffer_size}) must be <= maxBufferSize ({max_buffer_size})")]
	BufferSizeExceedsMax { buffer_size: usize, max_buffer_size: usize },
}

/// Decodes a tolerant key-map (e.g. parsed from JSON/YAML) into a resolved
/// [`HTTPProxyConfig`], applying defaults for anything absent.
pub fn decode(raw: &BTreeMap<String, Value>) -> Result<HTTPProxyConfig, ConfigError> {
	let mut cfg = HTTPProxyConfig::default();

	if let Some(v) = dur(raw, "timeout")? {
		cfg.timeout = v;
	}
	cfg.connect_timeout = dur(raw, "connectTimeout")?.unwrap_or(cfg.timeout);
	if let Some(v) = dur(raw, "readTimeout")? {
		cfg.read_timeout = v;
	}
	cfg.send_timeout = dur(raw, "sendTimeout")?;

	if let Some(v) = boolean(raw, "followRedirects")? {
		cfg.follow_redirects = v;
	}
	if let Some(v) = boolean(raw, "keepAlive")? {
		cfg.keep_alive = v;
	}
	if let Some(v) = string(raw, "httpVersion")? {
		cfg.http_version = v;
	}
	if let Some(v) = uint(raw, "maxIdleConns")? {
		cfg.max_idle_conns = v as usize;
	}
	if let Some(v) = dur(raw, "idleConnTimeout")? {
		cfg.idle_conn_timeout = v;
	}
	if let Some(v) = uint(raw, "bufferSize")? {
		cfg.buffer_size = v as usize;
	}
	if let Some(v) = uint(raw, "maxBufferSize")? {
		cfg.max_buffer_size = v as usize;
	}
	if cfg.buffer_size > cfg.max_buffer_size {
		return Err(ConfigError::BufferSizeExceedsMax {
			buffer_size: cfg.buffer_size,
			max_buffer_size: cfg.max_buffer_size,
		});
	}
	if let Some(v) = boolean(raw, "proxyBuffering")? {
		cfg.proxy_buffering = v;
	}
	if !cfg.proxy_buffering {
		// shrink buffers for SSE/streaming (spec §3 proxyBuffering row).
		cfg.buffer_size = cfg.buffer_size.min(1024);
		cfg.max_buffer_size = cfg.max_buffer_size.max(cfg.buffer_size);
	}
	if let Some(v) = uint(raw, "retryCount")? {
		cfg.retry_count = v as u32;
	}
	if let Some(v) = dur(raw, "retryTimeout")? {
		cfg.retry_timeout = v;
	}
	if let Some(m) = map(raw, "setHeaders")? {
		cfg.set_headers = m;
	}
	if let Some(l) = list(raw, "passHeaders")? {
		cfg.pass_headers = l;
	}
	if let Some(l) = list(raw, "hideHeaders")? {
		cfg.hide_headers = l;
	}
	if let Some(v) = boolean(raw, "preserveHost")? {
		cfg.preserve_host = v;
	}
	if let Some(v) = boolean(raw, "addXForwardedFor")? {
		cfg.add_x_forwarded_for = v;
	}
	if let Some(v) = boolean(raw, "addXRealIP")? {
		cfg.add_x_real_ip = v;
	}
	if let Some(v) = boolean(raw, "addXForwardedProto")? {
		cfg.add_x_forwarded_proto = v;
	}
	if let Some(v) = boolean(raw, "tlsInsecureSkipVerify")? {
		cfg.tls_insecure_skip_verify = v;
	}
	cfg.tls_server_name = string(raw, "tlsServerName")?;
	if let Some(v) = boolean(raw, "copyResponseBody")? {
		cfg.copy_response_body = v;
	}

	Ok(cfg)
}

/// Looks a key up tolerating camelCase and the snake_case equivalent.
fn get<'a>(raw: &'a BTreeMap<String, Value>, camel: &'static str) -> Option<&'a Value> {
	if let Some(v) = raw.get(camel) {
		return Some(v);
	}
	let snake = camel_to_snake(camel);
	raw.get(&snake)
}

fn camel_to_snake(s: &str) -> String {
	let mut out = String::with_capacity(s.len() + 4);
	for c in s.chars() {
		if c.is_ascii_uppercase() {
			out.push('_');
			out.push(c.to_ascii_lowercase());
		} else {
			out.push(c);
		}
	}
	out
}

fn dur(raw: &BTreeMap<String, Value>, key: &'static str) -> Result<Option<Duration>, ConfigError> {
	let Some(v) = get(raw, key) else { return Ok(None) };
	let s = match v {
		Value::Number(n) => n.to_string(),
		Value::String(s) => s.clone(),
		other => {
			return Err(ConfigError::InvalidValue {
				key,
				reason: format!("expected number or duration string, got {other}"),
			});
		},
	};
	relaygate_core::parse_tolerant_duration(&s)
		.map(Some)
		.map_err(|e| ConfigError::InvalidValue { key, reason: e.to_string() })
}

fn boolean(raw: &BTreeMap<String, Value>, key: &'static str) -> Result<Option<bool>, ConfigError> {
	let Some(v) = get(raw, key) else { return Ok(None) };
	match v {
		Value::Bool(b) => Ok(Some(*b)),
		Value::String(s) => match s.as_str() {
			"true" | "1" | "yes" | "on" => Ok(Some(true)),
			"false" | "0" | "no" | "off" => Ok(Some(false)),
			other => Err(ConfigError::InvalidValue {
				key,
				reason: format!("cannot coerce {other:?} to bool"),
			}),
		},
		Value::Number(n) => Ok(Some(n.as_f64().unwrap_or(0.0) != 0.0)),
		other => Err(ConfigError::InvalidValue {
			key,
			reason: format!("cannot coerce {other} to bool"),
		}),
	}
}

fn uint(raw: &BTreeMap<String, Value>, key: &'static str) -> Result<Option<u64>, ConfigError> {
	let Some(v) = get(raw, key) else { return Ok(None) };
	match v {
		Value::Number(n) => n.as_u64().ok_or_else(|| ConfigError::InvalidValue {
			key,
			reason: format!("{n} is not a non-negative integer"),
		}).map(Some),
		Value::String(s) => s.parse().map(Some).map_err(|_| ConfigError::InvalidValue {
			key,
			reason: format!("{s:?} is not an integer"),
		}),
		other => Err(ConfigError::InvalidValue { key, reason: format!("cannot coerce {other} to int") }),
	}
}

fn string(raw: &BTreeMap<String, Value>, key: &'static str) -> Result<Option<String>, ConfigError> {
	let Some(v) = get(raw, key) else { return Ok(None) };
	match v {
		Value::String(s) => Ok(Some(s.clone())),
		Value::Null => Ok(None),
		other => Ok(Some(other.to_string())),
	}
}

fn list(raw: &BTreeMap<String, Value>, key: &'static str) -> Result<Option<Vec<String>>, ConfigError> {
	let Some(v) = get(raw, key) else { return Ok(None) };
	match v {
		Value::Array(items) => {
			let mut out = Vec::with_capacity(items.len());
			for item in items {
				match item {
					Value::String(s) => out.push(s.clone()),
					other => out.push(other.to_string()),
				}
			}
			Ok(Some(out))
		},
		Value::String(s) => Ok(Some(s.split(',').map(|s| s.trim().to_string()).collect())),
		other => Err(ConfigError::InvalidValue { key, reason: format!("expected a list, got {other}") }),
	}
}

fn map(
	raw: &BTreeMap<String, Value>,
	key: &'static str,
) -> Result<Option<IndexMap<String, String>>, ConfigError> {
	let Some(v) = get(raw, key) else { return Ok(None) };
	match v {
		Value::Object(o) => {
			let mut out = IndexMap::with_capacity(o.len());
			for (k, v) in o {
				let v = match v {
					Value::String(s) => s.clone(),
					other => other.to_string(),
				};
				out.insert(k.clone(), v);
			}
			Ok(Some(out))
		},
		other => Err(ConfigError::InvalidValue { key, reason: format!("expected a map, got {other}") }),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn raw(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
		pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
	}

	#[test]
	fn defaults_applied() {
		let cfg = decode(&BTreeMap::new()).unwrap();
		assert_eq!(cfg.timeout, Duration::from_secs(30));
		assert_eq!(cfg.connect_timeout, cfg.timeout);
		assert!(!cfg.follow_redirects);
		assert_eq!(cfg.redirect_limit, 5);
	}

	#[test]
	fn snake_case_keys_accepted() {
		let cfg = decode(&raw(&[("retry_count", Value::from(3))])).unwrap();
		assert_eq!(cfg.retry_count, 3);
	}

	#[test]
	fn duration_as_numeric_seconds() {
		let cfg = decode(&raw(&[("timeout", Value::from(45))])).unwrap();
		assert_eq!(cfg.timeout, Duration::from_secs(45));
	}

	#[test]
	fn duration_as_go_style_string() {
		let cfg = decode(&raw(&[("timeout", Value::from("1m30s"))])).unwrap();
		assert_eq!(cfg.timeout, Duration::from_secs(90));
	}

	#[test]
	fn bool_coerces_from_string() {
		let cfg = decode(&raw(&[("followRedirects", Value::from("true"))])).unwrap();
		assert!(cfg.follow_redirects);
	}

	#[test]
	fn buffer_size_must_not_exceed_max() {
		let err = decode(&raw(&[
			("bufferSize", Value::from(100)),
			("maxBufferSize", Value::from(10)),
		]))
		.unwrap_err();
		assert!(matches!(err, ConfigError::BufferSizeExceedsMax { .. }));
	}

	#[test]
	fn proxy_buffering_off_shrinks_buffers() {
		let cfg = decode(&raw(&[("proxyBuffering", Value::from(false))])).unwrap();
		assert!(cfg.buffer_size <= 1024);
	}
}
