//! Fixed-window request quotas keyed by adapter or client address.
//!
//! Each key owns an independent window in a [`DashMap`]; the entry guard
//! serializes updates for one key without touching any other key. Denied
//! requests still count, so a retry storm stays denied until the window
//! rolls over.

use axum::http::HeaderMap;
use dashmap::DashMap;
use ipnet::IpNet;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::{ConfigError, RateLimitConfig, WindowConfig, parse_trusted_proxy};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowPolicy {
    pub max_requests: u32,
    pub window: Duration,
}

impl WindowPolicy {
    pub fn new(max_requests: u32, window: Duration) -> Result<Self, ConfigError> {
        WindowConfig {
            max_requests,
            window_ms: window.as_millis() as u64,
        }
        .validate("rate limiter")?;
        Ok(Self {
            max_requests,
            window,
        })
    }

    pub fn from_config(scope: &str, config: &WindowConfig) -> Result<Self, ConfigError> {
        config.validate(scope)?;
        Ok(Self {
            max_requests: config.max_requests,
            window: Duration::from_millis(config.window_ms),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    pub reset_after: Duration,
}

impl RateLimitDecision {
    pub fn reset_after_ms(&self) -> u64 {
        self.reset_after.as_millis() as u64
    }

    /// Whole seconds until the window resets, rounded up.
    pub fn reset_after_secs(&self) -> u64 {
        self.reset_after_ms().div_ceil(1000)
    }

    /// Seconds a denied client should wait. Never zero.
    pub fn retry_after_secs(&self) -> u64 {
        self.reset_after_secs().max(1)
    }

    /// Unix timestamp (seconds) at which the current window resets.
    pub fn reset_at_unix(&self) -> i64 {
        chrono::Utc::now().timestamp() + self.reset_after_secs() as i64
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RateLimitKey {
    Adapter(String),
    ClientIp(String),
}

impl RateLimitKey {
    fn storage_key(&self) -> String {
        match self {
            Self::Adapter(name) => format!("adapter:{name}"),
            Self::ClientIp(ip) => format!("ip:{ip}"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    count: u32,
    length: Duration,
}

impl Window {
    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.started) >= self.length
    }
}

#[derive(Debug)]
pub struct RateLimiter {
    windows: DashMap<String, Window>,
    default_policy: WindowPolicy,
    last_sweep: Mutex<Instant>,
}

impl RateLimiter {
    pub fn new(default_policy: WindowPolicy) -> Self {
        Self {
            windows: DashMap::new(),
            default_policy,
            last_sweep: Mutex::new(Instant::now()),
        }
    }

    pub fn default_policy(&self) -> WindowPolicy {
        self.default_policy
    }

    pub fn allow(&self, key: &RateLimitKey) -> RateLimitDecision {
        self.allow_with(key, self.default_policy)
    }

    /// Count one request against `key` under `policy`.
    pub fn allow_with(&self, key: &RateLimitKey, policy: WindowPolicy) -> RateLimitDecision {
        let now = Instant::now();
        let decision = self.allow_at(key, policy, now);
        self.maybe_sweep(now);
        decision
    }

    fn allow_at(&self, key: &RateLimitKey, policy: WindowPolicy, now: Instant) -> RateLimitDecision {
        // The entry guard must be released before any sweep touches the map.
        let mut window = self.windows.entry(key.storage_key()).or_insert(Window {
            started: now,
            count: 0,
            length: policy.window,
        });
        if window.is_expired(now) {
            *window = Window {
                started: now,
                count: 0,
                length: policy.window,
            };
        }
        window.count = window.count.saturating_add(1);
        let reset_after = (window.started + window.length).saturating_duration_since(now);
        RateLimitDecision {
            allowed: window.count <= policy.max_requests,
            limit: policy.max_requests,
            remaining: policy.max_requests.saturating_sub(window.count),
            reset_after,
        }
    }

    /// Drop every window that has already expired. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    fn sweep_at(&self, now: Instant) -> usize {
        let before = self.windows.len();
        self.windows.retain(|_, window| !window.is_expired(now));
        let removed = before.saturating_sub(self.windows.len());
        if removed > 0 {
            tracing::debug!(removed, remaining = self.windows.len(), "rate limit windows swept");
        }
        removed
    }

    fn maybe_sweep(&self, now: Instant) {
        let Ok(mut last) = self.last_sweep.try_lock() else {
            return;
        };
        if now.duration_since(*last) < self.default_policy.window {
            return;
        }
        *last = now;
        drop(last);
        self.sweep_at(now);
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}

/// Picks the address a request is attributed to. Forwarding headers are
/// honored only when explicitly trusted, and then only from trusted peers
/// if a trusted set is configured.
#[derive(Debug, Clone, Default)]
pub struct ClientIpResolver {
    trust_proxy_headers: bool,
    trusted: Vec<IpNet>,
}

impl ClientIpResolver {
    pub fn from_config(config: &RateLimitConfig) -> Result<Self, ConfigError> {
        let trusted = config
            .trusted_proxies
            .iter()
            .map(|raw| parse_trusted_proxy(raw))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            trust_proxy_headers: config.trust_proxy_headers,
            trusted,
        })
    }

    pub fn resolve(&self, peer: Option<IpAddr>, headers: &HeaderMap) -> String {
        if self.trusts(peer) {
            let forwarded = header_str(headers, "x-forwarded-for")
                .and_then(|v| v.split(',').next())
                .map(str::trim)
                .filter(|v| !v.is_empty());
            if let Some(client) = forwarded.or_else(|| header_str(headers, "x-real-ip")) {
                return client.to_string();
            }
        }
        peer.map(|ip| ip.to_string())
            .unwrap_or_else(|| "unknown".to_string())
    }

    fn trusts(&self, peer: Option<IpAddr>) -> bool {
        if !self.trust_proxy_headers {
            return false;
        }
        if self.trusted.is_empty() {
            return true;
        }
        peer.is_some_and(|ip| self.trusted.iter().any(|net| net.contains(&ip)))
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}
