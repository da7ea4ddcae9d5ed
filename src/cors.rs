//! CORS with wildcard origin patterns.
//!
//! The allow-list accepts exact origins and patterns like
//! `https://*.example.com`. warp's built-in CORS builder only takes exact
//! origins, so preflight and response decoration are handled here; the
//! allow-list itself comes from `Config` unchanged.

use std::sync::Arc;
use warp::http::header::HeaderValue;
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

const ALLOWED_METHODS: &str = "GET, POST, DELETE, OPTIONS";
const ALLOWED_HEADERS: &str = "content-type, authorization";
const MAX_AGE_SECONDS: &str = "3600";

/// Immutable origin allow-list
#[derive(Debug, Clone)]
pub struct CorsPolicy {
    patterns: Vec<String>,
}

impl CorsPolicy {
    pub fn new(patterns: Vec<String>) -> Self {
        Self { patterns }
    }

    /// Is this `Origin` header value allowed?
    pub fn origin_allowed(&self, origin: &str) -> bool {
        self.patterns.iter().any(|p| pattern_matches(p, origin))
    }
}

fn pattern_matches(pattern: &str, origin: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if !pattern.contains('*') {
        return pattern
            .trim_end_matches('/')
            .eq_ignore_ascii_case(origin.trim_end_matches('/'));
    }

    let Ok(origin_url) = url::Url::parse(origin) else {
        return false;
    };
    let Some((pattern_scheme, pattern_rest)) = pattern.split_once("://") else {
        return false;
    };
    if !pattern_scheme.eq_ignore_ascii_case(origin_url.scheme()) {
        return false;
    }

    let pattern_rest = pattern_rest.trim_end_matches('/');
    let (pattern_host, pattern_port) = match pattern_rest.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => {
            (host, port.parse::<u16>().ok())
        }
        _ => (pattern_rest, None),
    };

    let Some(origin_host) = origin_url.host_str() else {
        return false;
    };
    let origin_host = origin_host.to_ascii_lowercase();

    let host_ok = if let Some(suffix) = pattern_host.strip_prefix("*.") {
        let suffix = suffix.to_ascii_lowercase();
        origin_host == suffix || origin_host.ends_with(&format!(".{}", suffix))
    } else if pattern_host == "*" {
        true
    } else {
        pattern_host.eq_ignore_ascii_case(&origin_host)
    };
    if !host_ok {
        return false;
    }

    match pattern_port {
        Some(port) => origin_url.port_or_known_default() == Some(port),
        None => true,
    }
}

/// Add CORS headers to an outgoing reply when the origin is allowed.
pub fn decorate(
    reply: impl Reply,
    origin: Option<String>,
    policy: &CorsPolicy,
) -> warp::reply::Response {
    let mut response = reply.into_response();
    if let Some(origin) = origin {
        if policy.origin_allowed(&origin) {
            if let Ok(value) = HeaderValue::from_str(&origin) {
                let headers = response.headers_mut();
                headers.insert("access-control-allow-origin", value);
                headers.insert("vary", HeaderValue::from_static("origin"));
                headers.insert(
                    "access-control-allow-credentials",
                    HeaderValue::from_static("true"),
                );
            }
        }
    }
    response
}

/// Preflight route: 204 with the CORS grant when the origin is allowed,
/// 204 without it otherwise.
pub fn preflight(
    policy: Arc<CorsPolicy>,
) -> impl Filter<Extract = (warp::reply::Response,), Error = Rejection> + Clone {
    warp::options()
        .and(warp::header::optional::<String>("origin"))
        .map(move |origin: Option<String>| {
            let mut response =
                warp::reply::with_status(warp::reply(), StatusCode::NO_CONTENT).into_response();
            if let Some(origin) = origin {
                if policy.origin_allowed(&origin) {
                    if let Ok(value) = HeaderValue::from_str(&origin) {
                        let headers = response.headers_mut();
                        headers.insert("access-control-allow-origin", value);
                        headers.insert(
                            "access-control-allow-methods",
                            HeaderValue::from_static(ALLOWED_METHODS),
                        );
                        headers.insert(
                            "access-control-allow-headers",
                            HeaderValue::from_static(ALLOWED_HEADERS),
                        );
                        headers.insert(
                            "access-control-max-age",
                            HeaderValue::from_static(MAX_AGE_SECONDS),
                        );
                        headers.insert(
                            "access-control-allow-credentials",
                            HeaderValue::from_static("true"),
                        );
                    }
                }
            }
            response
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_origin_match() {
        let policy = CorsPolicy::new(vec!["https://app.example.com".to_string()]);
        assert!(policy.origin_allowed("https://app.example.com"));
        assert!(policy.origin_allowed("https://APP.example.com"));
        assert!(!policy.origin_allowed("https://other.example.com"));
        assert!(!policy.origin_allowed("http://app.example.com"));
    }

    #[test]
    fn test_wildcard_subdomains() {
        let policy = CorsPolicy::new(vec!["https://*.example.com".to_string()]);
        assert!(policy.origin_allowed("https://app.example.com"));
        assert!(policy.origin_allowed("https://deep.nested.example.com"));
        assert!(policy.origin_allowed("https://example.com"));
        assert!(!policy.origin_allowed("https://example.org"));
        assert!(!policy.origin_allowed("https://badexample.com"));
        assert!(!policy.origin_allowed("http://app.example.com"));
    }

    #[test]
    fn test_wildcard_with_port() {
        let policy = CorsPolicy::new(vec!["http://*.local:3000".to_string()]);
        assert!(policy.origin_allowed("http://dev.local:3000"));
        assert!(!policy.origin_allowed("http://dev.local:4000"));
    }

    #[test]
    fn test_star_allows_everything() {
        let policy = CorsPolicy::new(vec!["*".to_string()]);
        assert!(policy.origin_allowed("https://anything.example"));
    }

    #[test]
    fn test_empty_policy_rejects() {
        let policy = CorsPolicy::new(Vec::new());
        assert!(!policy.origin_allowed("https://app.example.com"));
    }
}
