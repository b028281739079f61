//! nginx-like `proxy_pass` path composition (spec §4.5, component C5).

/// Canonicalizes a path: ensures a leading `/` and collapses `.`/`..` and
/// duplicate separators, the way spec §4.5 step 1 describes.
fn canonicalize(path: &str) -> String {
	let had_leading_slash = path.starts_with('/');
	let mut stack: Vec<&str> = Vec::new();
	for seg in path.split('/') {
		match seg {
			"" | "." => continue,
			".." => {
				stack.pop();
			},
			other => stack.push(other),
		}
	}
	let mut out = String::from("/");
	out.push_str(&stack.join("/"));
	let _ = had_leading_slash; // a leading "/" is always produced, per spec.
	out
}

fn trailing_slash(path: &str) -> bool {
	path.len() > 1 && path.ends_with('/')
}

/// Builds the final upstream request path from the target URL's path `t`
/// and the incoming request path `r`, per spec §4.5.
pub fn build_proxy_path(t: &str, r: &str) -> String {
	let t_had_trailing_slash = trailing_slash(t);
	let r_had_trailing_slash = trailing_slash(r);

	let t_clean = canonicalize(t);
	let r_clean = canonicalize(r);

	// Step 2: empty/root target passes the request path through unchanged.
	if t_clean == "/" {
		return restore_slash(&r_clean, r_had_trailing_slash && r_clean != "/");
	}

	// Step 3: boundary-respecting prefix match between t_clean and r_clean.
	let remainder = t_clean.trim_end_matches('/');
	let prefixes_match = if remainder.is_empty() {
		r_clean == "/"
	} else {
		r_clean.starts_with(remainder)
			&& (r_clean.len() == remainder.len() || r_clean.as_bytes()[remainder.len()] == b'/')
	};
	if !prefixes_match {
		return restore_slash(&t_clean, t_had_trailing_slash);
	}

	// Step 4: exact match.
	if t_clean == r_clean {
		return restore_slash(&t_clean, t_had_trailing_slash);
	}

	// Step 5: request already carries the target prefix verbatim.
	if r_clean.starts_with(&t_clean) {
		return restore_slash(&r_clean, r_had_trailing_slash && r_clean != "/");
	}

	// Step 6: concatenate, respecting whether the original target had a
	// trailing slash.
	let suffix = &r_clean[remainder.len()..];
	if t_had_trailing_slash {
		if r_clean == "/" {
			return format!("{remainder}/");
		}
		format!("{remainder}{suffix}")
	} else {
		format!("{remainder}{suffix}")
	}
}

fn restore_slash(path: &str, want_slash: bool) -> String {
	if want_slash && !path.ends_with('/') {
		format!("{path}/")
	} else if !want_slash && path.len() > 1 && path.ends_with('/') {
		path.trim_end_matches('/').to_string()
	} else {
		path.to_string()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn s4_scenarios() {
		assert_eq!(build_proxy_path("/api/", "/api/v1/users"), "/api/v1/users");
		assert_eq!(build_proxy_path("/api", "/api/v1"), "/api/v1");
		assert_eq!(build_proxy_path("/api/", "/"), "/api/");
		assert_eq!(build_proxy_path("/other", "/api"), "/other");
	}

	#[test]
	fn empty_target_passes_request_through() {
		assert_eq!(build_proxy_path("", "/foo/bar"), "/foo/bar");
		assert_eq!(build_proxy_path("/", "/foo/bar"), "/foo/bar");
	}

	#[test]
	fn request_already_prefixed_is_not_duplicated() {
		assert_eq!(build_proxy_path("/api", "/api/v1/x"), "/api/v1/x");
	}

	#[test]
	fn result_always_starts_with_slash_and_is_clean() {
		for (t, r) in [("/api/", "/api/v1/users"), ("/other", "/api"), ("", "/x")] {
			let out = build_proxy_path(t, r);
			assert!(out.starts_with('/'));
			assert!(!out.contains("//"));
			assert!(!out.split('/').any(|seg| seg == ".." || seg == "."));
		}
	}

	#[test]
	fn exact_match_returns_target() {
		assert_eq!(build_proxy_path("/api/v1", "/api/v1"), "/api/v1");
	}

	#[test]
	fn prefix_boundary_is_respected() {
		// "/apiextra" must not be treated as sharing the "/api" prefix.
		assert_eq!(build_proxy_path("/api", "/apiextra"), "/api");
	}
}
