//! Header rewrite policy for both directions of the proxy.
//!
//! Outbound copying is two-tier: headers on [`PRESERVED_REQUEST_HEADERS`]
//! are always forwarded, everything else is forwarded unless it is on
//! [`DENIED_REQUEST_HEADERS`] or names the adapter-selection or auth header.
//! The deny-list is authoritative, so a header missing from the preserve
//! list still goes through unless explicitly denied.

use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};

use crate::config::{ConfigError, ProxyConfig};

/// Chat protocol headers that are always copied to the upstream.
pub const PRESERVED_REQUEST_HEADERS: &[&str] = &[
    "content-type",
    "accept",
    "x-session-id",
    "x-thread-id",
];

/// Never copied from the client. Hop-by-hop headers, framing that the
/// outbound client recomputes, and any client-held credential.
pub const DENIED_REQUEST_HEADERS: &[&str] = &[
    "host",
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "content-length",
    "authorization",
    "cookie",
];

/// Stripped from upstream responses before relay.
pub const DENIED_RESPONSE_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "authorization",
    "www-authenticate",
    "set-cookie",
];

#[derive(Debug, Clone)]
pub struct HeaderPolicy {
    adapter_header: HeaderName,
    auth_header: HeaderName,
    preserved: Vec<HeaderName>,
    denied_request: Vec<HeaderName>,
    denied_response: Vec<HeaderName>,
}

impl HeaderPolicy {
    pub fn from_config(config: &ProxyConfig) -> Result<Self, ConfigError> {
        let adapter_header = parse_name(&config.adapter_header)?;
        let auth_header = parse_name(&config.auth_header)?;
        Ok(Self {
            adapter_header,
            auth_header,
            preserved: PRESERVED_REQUEST_HEADERS
                .iter()
                .copied()
                .map(HeaderName::from_static)
                .collect(),
            denied_request: DENIED_REQUEST_HEADERS
                .iter()
                .copied()
                .map(HeaderName::from_static)
                .collect(),
            denied_response: DENIED_RESPONSE_HEADERS
                .iter()
                .copied()
                .map(HeaderName::from_static)
                .collect(),
        })
    }

    pub fn adapter_header(&self) -> &HeaderName {
        &self.adapter_header
    }

    /// The adapter name the client asked for, if any.
    pub fn adapter_name<'a>(&self, headers: &'a HeaderMap) -> Option<&'a str> {
        headers
            .get(&self.adapter_header)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    }

    pub fn is_denied_request_header(&self, name: &HeaderName) -> bool {
        name == self.adapter_header
            || name == self.auth_header
            || self.denied_request.iter().any(|denied| denied == name)
    }

    /// Build the header set sent upstream. The credential is inserted last so
    /// nothing copied from the client can replace it.
    pub fn outbound(&self, inbound: &HeaderMap, credential: &HeaderValue) -> HeaderMap {
        let mut out = HeaderMap::with_capacity(inbound.len() + 1);
        for name in &self.preserved {
            if self.is_denied_credential(name) {
                continue;
            }
            for value in inbound.get_all(name) {
                out.append(name.clone(), value.clone());
            }
        }
        for name in inbound.keys() {
            if out.contains_key(name) || self.is_denied_request_header(name) {
                continue;
            }
            for value in inbound.get_all(name) {
                out.append(name.clone(), value.clone());
            }
        }
        out.insert(self.auth_header.clone(), credential.clone());
        out
    }

    /// Copy upstream response headers, dropping hop-by-hop fields, anything
    /// credential-shaped, and upstream CORS decisions (the gateway owns those).
    pub fn inbound(&self, upstream: &HeaderMap) -> HeaderMap {
        let mut out = HeaderMap::with_capacity(upstream.len());
        for name in upstream.keys() {
            if name == self.auth_header
                || self.denied_response.iter().any(|denied| denied == name)
                || name.as_str().starts_with("access-control-")
            {
                continue;
            }
            for value in upstream.get_all(name) {
                out.append(name.clone(), value.clone());
            }
        }
        out
    }

    fn is_denied_credential(&self, name: &HeaderName) -> bool {
        name == self.auth_header || name == header::AUTHORIZATION
    }
}

fn parse_name(raw: &str) -> Result<HeaderName, ConfigError> {
    HeaderName::from_bytes(raw.trim().as_bytes())
        .map_err(|_| ConfigError::InvalidHeaderName(raw.to_string()))
}
