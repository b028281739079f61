// Shared primitives used by both the HTTP proxy core and the tunnel server core:
// a cheap-to-clone interned string, tolerant duration (de)serialization, and a
// small "build info" struct used in startup logging.

use std::time::Duration;

pub use arcstr::ArcStr;

/// Cheap-to-clone immutable string, used anywhere a config value or identifier
/// is passed around and cloned across tasks (service ids, node ids, header
/// names). Mirrors the `Strng` alias used throughout the rest of the stack.
pub type Strng = ArcStr;

pub fn strng(s: impl Into<ArcStr>) -> Strng {
	s.into()
}

#[derive(Debug, Clone)]
pub struct BuildInfo {
	pub version: &'static str,
	pub name: &'static str,
}

impl BuildInfo {
	pub fn new() -> Self {
		Self {
			version: env!("CARGO_PKG_VERSION"),
			name: "relaygate",
		}
	}
}

impl Default for BuildInfo {
	fn default() -> Self {
		Self::new()
	}
}

/// Parses a tolerant "duration" value: either a bare number of seconds
/// (`30`, `30.0`, `"30"`) or a Go-style duration string (`"30s"`, `"1m30s"`).
pub fn parse_tolerant_duration(raw: &str) -> anyhow::Result<Duration> {
	let trimmed = raw.trim();
	if let Ok(secs) = trimmed.parse::<f64>() {
		if secs < 0.0 {
			anyhow::bail!("duration must not be negative: {trimmed}");
		}
		return Ok(Duration::from_secs_f64(secs));
	}
	let nanos = go_parse_duration::parse_duration(trimmed)
		.map_err(|e| anyhow::anyhow!("invalid duration {trimmed:?}: {e:?}"))?;
	if nanos < 0 {
		anyhow::bail!("duration must not be negative: {trimmed}");
	}
	Ok(Duration::from_nanos(nanos as u64))
}
