use axum::body::Body;
use axum::http::header::{self, HeaderMap, HeaderValue};
use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use std::time::Duration;

use crate::config::{ConfigError, CorsConfig};

const ALLOWED_METHODS: &str = "GET, POST, PUT, PATCH, DELETE, OPTIONS";
const DEFAULT_ALLOWED_HEADERS: &str =
    "Content-Type, Accept, X-Adapter-Name, X-Session-ID, X-Thread-ID, X-Request-Id";
const EXPOSED_HEADERS: &str = "X-RateLimit-Limit, X-RateLimit-Remaining, X-RateLimit-Reset, Retry-After, X-Request-Id";

#[derive(Debug, Clone, PartialEq, Eq)]
enum OriginRule {
    Any,
    Exact(String),
    /// `scheme://*.suffix`, matches any subdomain of `suffix`.
    Subdomain { scheme: String, suffix: String },
}

impl OriginRule {
    fn parse(raw: &str) -> Result<Self, ConfigError> {
        let trimmed = raw.trim().trim_end_matches('/').to_ascii_lowercase();
        if trimmed == "*" {
            return Ok(Self::Any);
        }
        let Some((scheme, rest)) = trimmed.split_once("://") else {
            return Err(ConfigError::InvalidOrigin(raw.to_string()));
        };
        if scheme.is_empty() || rest.is_empty() {
            return Err(ConfigError::InvalidOrigin(raw.to_string()));
        }
        if let Some(suffix) = rest.strip_prefix("*.") {
            return Ok(Self::Subdomain {
                scheme: scheme.to_string(),
                suffix: suffix.to_string(),
            });
        }
        Ok(Self::Exact(trimmed))
    }

    fn matches(&self, origin: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Exact(exact) => exact == origin,
            Self::Subdomain { scheme, suffix } => origin
                .strip_prefix(scheme.as_str())
                .and_then(|rest| rest.strip_prefix("://"))
                .and_then(|host| host.strip_suffix(suffix.as_str()))
                .is_some_and(|sub| sub.len() > 1 && sub.ends_with('.')),
        }
    }
}

/// Outcome of the CORS stage, carried to later stages so responses can
/// reflect it without re-evaluating the policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CorsDecision {
    /// No `Origin` header, a non-browser caller.
    NoOrigin,
    Allowed(HeaderValue),
}

#[derive(Debug, Clone)]
pub struct CorsPolicy {
    rules: Vec<OriginRule>,
    allow_credentials: bool,
    max_age: Duration,
}

impl CorsPolicy {
    pub fn from_config(config: &CorsConfig) -> Result<Self, ConfigError> {
        let rules = config
            .allowed_origins
            .iter()
            .map(|raw| OriginRule::parse(raw))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            rules,
            allow_credentials: config.allow_credentials,
            max_age: Duration::from_secs(config.max_age_secs),
        })
    }

    pub fn allows_any(&self) -> bool {
        self.rules.contains(&OriginRule::Any)
    }

    /// `None` means the origin is present and not allowed.
    pub fn evaluate(&self, origin: Option<&HeaderValue>) -> Option<CorsDecision> {
        let Some(origin) = origin else {
            return Some(CorsDecision::NoOrigin);
        };
        let normalized = origin
            .to_str()
            .ok()?
            .trim()
            .trim_end_matches('/')
            .to_ascii_lowercase();
        self.rules
            .iter()
            .any(|rule| rule.matches(&normalized))
            .then(|| CorsDecision::Allowed(origin.clone()))
    }

    /// Reflect an already-made decision onto response headers.
    pub fn apply(&self, decision: &CorsDecision, headers: &mut HeaderMap) {
        match decision {
            CorsDecision::Allowed(origin) => {
                headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin.clone());
                let varies_on_origin = headers
                    .get_all(header::VARY)
                    .iter()
                    .any(|v| v.as_bytes().eq_ignore_ascii_case(b"origin"));
                if !varies_on_origin {
                    headers.append(header::VARY, HeaderValue::from_static("Origin"));
                }
                if self.allow_credentials {
                    headers.insert(
                        header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
                        HeaderValue::from_static("true"),
                    );
                }
            }
            CorsDecision::NoOrigin => {
                if !self.allows_any() {
                    return;
                }
                headers.insert(
                    header::ACCESS_CONTROL_ALLOW_ORIGIN,
                    HeaderValue::from_static("*"),
                );
            }
        }
        headers.insert(
            header::ACCESS_CONTROL_EXPOSE_HEADERS,
            HeaderValue::from_static(EXPOSED_HEADERS),
        );
    }

    /// Answer an `OPTIONS` request without touching the upstream.
    pub fn preflight(&self, decision: &CorsDecision, req: &Request<Body>) -> Response {
        let mut response = StatusCode::NO_CONTENT.into_response();
        let headers = response.headers_mut();
        self.apply(decision, headers);
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_static(ALLOWED_METHODS),
        );
        let requested = req
            .headers()
            .get(header::ACCESS_CONTROL_REQUEST_HEADERS)
            .cloned()
            .unwrap_or_else(|| HeaderValue::from_static(DEFAULT_ALLOWED_HEADERS));
        headers.insert(header::ACCESS_CONTROL_ALLOW_HEADERS, requested);
        if let Ok(value) = HeaderValue::from_str(&self.max_age.as_secs().to_string()) {
            headers.insert(header::ACCESS_CONTROL_MAX_AGE, value);
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(origins: &[&str]) -> CorsPolicy {
        CorsPolicy::from_config(&CorsConfig {
            allowed_origins: origins.iter().map(|o| o.to_string()).collect(),
            ..CorsConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn missing_origin_is_always_allowed() {
        let policy = policy(&["https://app.example.com"]);
        assert_eq!(policy.evaluate(None), Some(CorsDecision::NoOrigin));
    }

    #[test]
    fn allow_list_matches_exact_origins_case_insensitively() {
        let policy = policy(&["https://App.Example.com/"]);
        let ok = HeaderValue::from_static("https://app.example.com");
        let bad = HeaderValue::from_static("https://evil.example.com");
        assert_eq!(
            policy.evaluate(Some(&ok)),
            Some(CorsDecision::Allowed(ok.clone()))
        );
        assert_eq!(policy.evaluate(Some(&bad)), None);
    }

    #[test]
    fn subdomain_patterns_do_not_match_the_bare_suffix_or_lookalikes() {
        let policy = policy(&["https://*.example.com"]);
        let sub = HeaderValue::from_static("https://chat.example.com");
        let bare = HeaderValue::from_static("https://example.com");
        let lookalike = HeaderValue::from_static("https://badexample.com");
        let wrong_scheme = HeaderValue::from_static("http://chat.example.com");
        assert!(policy.evaluate(Some(&sub)).is_some());
        assert!(policy.evaluate(Some(&bare)).is_none());
        assert!(policy.evaluate(Some(&lookalike)).is_none());
        assert!(policy.evaluate(Some(&wrong_scheme)).is_none());
    }

    #[test]
    fn wildcard_reflects_the_concrete_origin() {
        let policy = policy(&["*"]);
        let origin = HeaderValue::from_static("https://widget.example.org");
        let decision = policy.evaluate(Some(&origin)).unwrap();
        let mut headers = HeaderMap::new();
        policy.apply(&decision, &mut headers);
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], origin);
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_CREDENTIALS], "true");
        assert_eq!(headers[header::VARY], "Origin");
    }

    #[test]
    fn origin_without_scheme_is_rejected_at_construction() {
        let result = CorsPolicy::from_config(&CorsConfig {
            allowed_origins: vec!["example.com".to_string()],
            ..CorsConfig::default()
        });
        assert!(matches!(result, Err(ConfigError::InvalidOrigin(_))));
    }

    #[test]
    fn preflight_reflects_requested_headers() {
        let policy = policy(&["*"]);
        let req = Request::builder()
            .method("OPTIONS")
            .header(header::ORIGIN, "https://a.example")
            .header(header::ACCESS_CONTROL_REQUEST_HEADERS, "x-adapter-name")
            .body(Body::empty())
            .unwrap();
        let decision = policy.evaluate(req.headers().get(header::ORIGIN)).unwrap();
        let resp = policy.preflight(&decision, &req);
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        assert_eq!(
            resp.headers()[header::ACCESS_CONTROL_ALLOW_HEADERS],
            "x-adapter-name"
        );
        assert_eq!(resp.headers()[header::ACCESS_CONTROL_MAX_AGE], "86400");
    }
}
