use arc_swap::ArcSwap;
use axum::http::HeaderValue;
use reqwest::Url;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::config::{AdapterConfig, ConfigError};
use crate::error::GatewayError;
use crate::headers::HeaderPolicy;
use crate::proxy::{ProxyEngine, ProxySettings};
use crate::rate_limit::WindowPolicy;

/// A named upstream plus the secret the gateway attaches on its behalf.
#[derive(Clone)]
pub struct AdapterDescriptor {
    pub name: String,
    api_key: String,
    pub upstream_base_url: Url,
    pub rate_limit: Option<WindowPolicy>,
}

impl AdapterDescriptor {
    fn from_config(index: usize, config: &AdapterConfig) -> Result<Self, ConfigError> {
        let name = config.name.trim().to_string();
        if name.is_empty() {
            return Err(ConfigError::EmptyAdapterName { index });
        }
        if config.api_key.trim().is_empty() {
            return Err(ConfigError::EmptyApiKey(name));
        }
        if HeaderValue::from_str(&config.api_key).is_err() {
            return Err(ConfigError::InvalidApiKey(name));
        }
        let upstream_base_url = parse_upstream_url(&name, &config.upstream_url)?;
        let rate_limit = config
            .rate_limit
            .as_ref()
            .map(|window| WindowPolicy::from_config(&format!("adapter '{name}'"), window))
            .transpose()?;
        Ok(Self {
            name,
            api_key: config.api_key.clone(),
            upstream_base_url,
            rate_limit,
        })
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }
}

impl fmt::Debug for AdapterDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdapterDescriptor")
            .field("name", &self.name)
            .field("api_key", &"<redacted>")
            .field("upstream_base_url", &self.upstream_base_url.as_str())
            .field("rate_limit", &self.rate_limit)
            .finish()
    }
}

fn parse_upstream_url(name: &str, raw: &str) -> Result<Url, ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidUpstreamUrl {
        name: name.to_string(),
        reason,
    };
    let url = Url::parse(raw.trim()).map_err(|err| invalid(err.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid(format!("unsupported scheme '{}'", url.scheme())));
    }
    if url.cannot_be_a_base() || url.host_str().is_none_or(str::is_empty) {
        return Err(invalid("missing host".to_string()));
    }
    if url.query().is_some() || url.fragment().is_some() {
        return Err(invalid("base url must not carry a query or fragment".to_string()));
    }
    Ok(url)
}

/// Immutable name -> adapter lookup. Replaced wholesale on reload.
#[derive(Debug, Clone, Default)]
pub struct AdapterTable {
    adapters: HashMap<String, Arc<AdapterDescriptor>>,
}

impl AdapterTable {
    pub fn new(configs: &[AdapterConfig]) -> Result<Self, ConfigError> {
        let mut adapters = HashMap::with_capacity(configs.len());
        for (index, config) in configs.iter().enumerate() {
            let descriptor = AdapterDescriptor::from_config(index, config)?;
            if adapters.contains_key(&descriptor.name) {
                return Err(ConfigError::DuplicateAdapter(descriptor.name));
            }
            adapters.insert(descriptor.name.clone(), Arc::new(descriptor));
        }
        Ok(Self { adapters })
    }

    pub fn lookup(&self, name: &str) -> Option<&Arc<AdapterDescriptor>> {
        self.adapters.get(name)
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }

    /// Adapter names in sorted order. Never keys or URLs.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.adapters.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<AdapterDescriptor>> {
        self.adapters.values()
    }
}

#[derive(Debug)]
struct AdapterSet {
    table: AdapterTable,
    engines: HashMap<String, Arc<ProxyEngine>>,
}

impl AdapterSet {
    fn build(
        configs: &[AdapterConfig],
        policy: &Arc<HeaderPolicy>,
        settings: &ProxySettings,
    ) -> Result<Self, GatewayError> {
        let table = AdapterTable::new(configs)?;
        let mut engines = HashMap::with_capacity(table.len());
        for descriptor in table.iter() {
            let engine = ProxyEngine::new(Arc::clone(descriptor), Arc::clone(policy), settings.clone())?;
            engines.insert(descriptor.name.clone(), Arc::new(engine));
        }
        Ok(Self { table, engines })
    }
}

/// The live adapter table and one [`ProxyEngine`] per adapter, swapped
/// atomically on reload. Readers holding the previous set keep using it
/// until their request finishes.
#[derive(Debug, Clone)]
pub struct AdapterRegistry {
    current: Arc<ArcSwap<AdapterSet>>,
    policy: Arc<HeaderPolicy>,
    settings: ProxySettings,
}

impl AdapterRegistry {
    pub fn build(
        configs: &[AdapterConfig],
        policy: Arc<HeaderPolicy>,
        settings: ProxySettings,
    ) -> Result<Self, GatewayError> {
        let set = AdapterSet::build(configs, &policy, &settings)?;
        Ok(Self {
            current: Arc::new(ArcSwap::from_pointee(set)),
            policy,
            settings,
        })
    }

    pub fn engine(&self, name: &str) -> Option<Arc<ProxyEngine>> {
        self.current.load().engines.get(name).cloned()
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<AdapterDescriptor>> {
        self.current.load().table.lookup(name).cloned()
    }

    /// Rate limit override for `name`, if the adapter has one.
    pub fn window_for(&self, name: &str) -> Option<WindowPolicy> {
        self.current
            .load()
            .table
            .lookup(name)
            .and_then(|adapter| adapter.rate_limit)
    }

    pub fn adapter_count(&self) -> usize {
        self.current.load().table.len()
    }

    pub fn names(&self) -> Vec<String> {
        self.current.load().table.names()
    }

    /// Build a complete new set and swap it in. On error the current set
    /// stays in place.
    pub fn reload(&self, configs: &[AdapterConfig]) -> Result<usize, GatewayError> {
        let set = AdapterSet::build(configs, &self.policy, &self.settings)?;
        let count = set.table.len();
        self.current.store(Arc::new(set));
        tracing::info!(adapters = count, "adapter table reloaded");
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProxyConfig, WindowConfig};

    fn adapter(name: &str, key: &str, url: &str) -> AdapterConfig {
        AdapterConfig {
            name: name.to_string(),
            api_key: key.to_string(),
            upstream_url: url.to_string(),
            rate_limit: None,
        }
    }

    fn registry(configs: &[AdapterConfig]) -> AdapterRegistry {
        let proxy = ProxyConfig::default();
        AdapterRegistry::build(
            configs,
            Arc::new(HeaderPolicy::from_config(&proxy).unwrap()),
            ProxySettings::from_config(&proxy, false),
        )
        .unwrap()
    }

    #[test]
    fn lookup_finds_configured_adapters_only() {
        let table = AdapterTable::new(&[
            adapter("Chat", "k1", "http://chat.internal:3000"),
            adapter("Search", "k2", "https://search.internal/base/"),
        ])
        .unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(
            table.lookup("Chat").unwrap().upstream_base_url.as_str(),
            "http://chat.internal:3000/"
        );
        assert!(table.lookup("chat").is_none());
        assert!(table.lookup("Missing").is_none());
        assert_eq!(table.names(), vec!["Chat".to_string(), "Search".to_string()]);
    }

    #[test]
    fn construction_rejects_bad_entries() {
        let cases = [
            (adapter(" ", "k", "http://a"), "empty name"),
            (adapter("A", "", "http://a"), "empty key"),
            (adapter("A", "bad\nkey", "http://a"), "key not a header value"),
            (adapter("A", "k", "not a url"), "relative url"),
            (adapter("A", "k", "ftp://files.example"), "scheme"),
            (adapter("A", "k", "mailto:ops@example.com"), "no host"),
        ];
        for (config, label) in cases {
            assert!(AdapterTable::new(&[config]).is_err(), "{label} accepted");
        }
    }

    #[test]
    fn duplicate_names_abort_construction() {
        let err = AdapterTable::new(&[
            adapter("Chat", "k1", "http://a"),
            adapter("Chat", "k2", "http://b"),
        ])
        .unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateAdapter(name) if name == "Chat"));
    }

    #[test]
    fn debug_output_redacts_the_key() {
        let table = AdapterTable::new(&[adapter("Chat", "sk-live-123", "http://a")]).unwrap();
        let rendered = format!("{:?}", table.lookup("Chat").unwrap());
        assert!(!rendered.contains("sk-live-123"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn per_adapter_window_is_carried() {
        let mut config = adapter("Chat", "k", "http://a");
        config.rate_limit = Some(WindowConfig {
            max_requests: 3,
            window_ms: 1000,
        });
        let registry = registry(&[config, adapter("Search", "k", "http://b")]);
        assert_eq!(registry.window_for("Chat").unwrap().max_requests, 3);
        assert!(registry.window_for("Search").is_none());
    }

    #[test]
    fn reload_swaps_the_whole_table() {
        let registry = registry(&[adapter("Chat", "k1", "http://a")]);
        let held = registry.engine("Chat").unwrap();

        let count = registry
            .reload(&[adapter("Search", "k2", "http://b"), adapter("Docs", "k3", "http://c")])
            .unwrap();
        assert_eq!(count, 2);
        assert!(registry.engine("Chat").is_none());
        assert_eq!(registry.names(), vec!["Docs".to_string(), "Search".to_string()]);
        assert_eq!(held.adapter().name, "Chat");
    }

    #[test]
    fn failed_reload_keeps_the_current_table() {
        let registry = registry(&[adapter("Chat", "k1", "http://a")]);
        assert!(registry.reload(&[adapter("Bad", "", "http://a")]).is_err());
        assert!(registry.engine("Chat").is_some());
        assert_eq!(registry.adapter_count(), 1);
    }
}
