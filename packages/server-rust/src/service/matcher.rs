//! Request predicates used to route connections and HTTP requests.

use std::fmt;

use http::header::CONTENT_TYPE;
use http::{HeaderMap, HeaderValue};
use regex::Regex;

/// Content type of RPC traffic.
pub const GRPC_CONTENT_TYPE: &str = "application/grpc";

/// Content type that marks a request for the HTTP/JSON gateway.
pub const GATEWAY_CONTENT_TYPE: &str = "application/grpc-gateway";

/// The request metadata a [`Matcher`] inspects.
///
/// Built either from a classified connection preface or from an HTTP
/// request; `path` never carries the query string.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub path: String,
    pub headers: HeaderMap,
}

impl<B> From<&http::Request<B>> for RequestHead {
    fn from(req: &http::Request<B>) -> Self {
        Self {
            method: req.method().as_str().to_string(),
            path: req.uri().path().to_string(),
            headers: req.headers().clone(),
        }
    }
}

/// A pure predicate over request metadata.
///
/// Matchers hold no state beyond their construction arguments and are safe
/// to evaluate concurrently.
#[derive(Clone)]
pub enum Matcher {
    /// `Content-Type` equals the value exactly.
    ContentType(HeaderValue),
    /// Path starts with the prefix.
    PathPrefix(String),
    /// Path matches the regular expression.
    PathRegex(Regex),
}

impl Matcher {
    /// Matches an exact `Content-Type`.
    #[must_use]
    pub fn content_type(value: &'static str) -> Self {
        Self::ContentType(HeaderValue::from_static(value))
    }

    /// Matches the gateway sentinel content type.
    #[must_use]
    pub fn gateway_content_type() -> Self {
        Self::content_type(GATEWAY_CONTENT_TYPE)
    }

    #[must_use]
    pub fn path_prefix(prefix: impl Into<String>) -> Self {
        Self::PathPrefix(prefix.into())
    }

    /// Matches paths against a regular expression.
    ///
    /// # Panics
    ///
    /// Panics if `pattern` is not a valid regular expression. Patterns are
    /// static configuration, so a bad one is a programming error.
    #[must_use]
    pub fn path_regex(pattern: &str) -> Self {
        match Regex::new(pattern) {
            Ok(re) => Self::PathRegex(re),
            Err(err) => panic!("invalid path pattern {pattern:?}: {err}"),
        }
    }

    /// Evaluates the matcher.
    #[must_use]
    pub fn matches(&self, head: &RequestHead) -> bool {
        self.matches_parts(&head.path, &head.headers)
    }

    /// Evaluates the matcher against a path and header map without building
    /// a [`RequestHead`].
    #[must_use]
    pub fn matches_parts(&self, path: &str, headers: &HeaderMap) -> bool {
        match self {
            Self::ContentType(expected) => headers.get(CONTENT_TYPE) == Some(expected),
            Self::PathPrefix(prefix) => path.starts_with(prefix.as_str()),
            Self::PathRegex(re) => re.is_match(path),
        }
    }
}

impl fmt::Debug for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ContentType(v) => f.debug_tuple("ContentType").field(v).finish(),
            Self::PathPrefix(p) => f.debug_tuple("PathPrefix").field(p).finish(),
            Self::PathRegex(re) => f.debug_tuple("PathRegex").field(&re.as_str()).finish(),
        }
    }
}

/// Whether a `Content-Type` marks RPC traffic: `application/grpc` itself or
/// one of its `application/grpc+<codec>` subtypes.
#[must_use]
pub fn is_grpc_content_type(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| {
            ct == GRPC_CONTENT_TYPE
                || ct
                    .strip_prefix(GRPC_CONTENT_TYPE)
                    .is_some_and(|rest| rest.starts_with('+'))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn head(path: &str, content_type: Option<&'static str>) -> RequestHead {
        let mut headers = HeaderMap::new();
        if let Some(ct) = content_type {
            headers.insert(CONTENT_TYPE, HeaderValue::from_static(ct));
        }
        RequestHead {
            method: "POST".to_string(),
            path: path.to_string(),
            headers,
        }
    }

    #[test]
    fn content_type_is_exact() {
        let m = Matcher::gateway_content_type();
        assert!(m.matches(&head("/", Some("application/grpc-gateway"))));
        assert!(!m.matches(&head("/", Some("application/grpc-gateway+json"))));
        assert!(!m.matches(&head("/", Some("Application/grpc-gateway"))));
        assert!(!m.matches(&head("/", None)));
    }

    #[test]
    fn path_prefix() {
        let m = Matcher::path_prefix("/v1/");
        assert!(m.matches(&head("/v1/things", None)));
        assert!(!m.matches(&head("/v2/things", None)));
        assert!(!m.matches(&head("/v1", None)));
    }

    #[test]
    fn path_regex() {
        let m = Matcher::path_regex(r"^/api/v\d+/");
        assert!(m.matches(&head("/api/v3/users", None)));
        assert!(!m.matches(&head("/api/latest/users", None)));
    }

    #[test]
    #[should_panic(expected = "invalid path pattern")]
    fn invalid_regex_panics() {
        let _ = Matcher::path_regex("(unclosed");
    }

    #[test]
    fn matching_is_repeatable() {
        let m = Matcher::path_prefix("/v1/");
        let h = head("/v1/x", None);
        assert!((0..3).all(|_| m.matches(&h)));
    }

    #[test]
    fn head_from_request_drops_query() {
        let req = http::Request::builder()
            .method("GET")
            .uri("http://example.com/v1/items?limit=5")
            .header(CONTENT_TYPE, "application/json")
            .body(())
            .unwrap();
        let head = RequestHead::from(&req);
        assert_eq!(head.path, "/v1/items");
        assert_eq!(head.method, "GET");
        assert!(Matcher::content_type("application/json").matches(&head));
    }

    #[test]
    fn grpc_content_types() {
        assert!(is_grpc_content_type(&head("/", Some("application/grpc")).headers));
        assert!(is_grpc_content_type(&head("/", Some("application/grpc+proto")).headers));
        assert!(!is_grpc_content_type(&head("/", Some("application/grpc-gateway")).headers));
        assert!(!is_grpc_content_type(&head("/", Some("application/json")).headers));
        assert!(!is_grpc_content_type(&head("/", None).headers));
    }
}
