//! Named source registries a run can mirror from.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::catalog::{Catalog, FixedCatalog, GCR_NAMESPACE, GCR_URL, GcrCatalog};
use crate::config::Configuration;
use crate::error::ConfigError;
use crate::fetcher::RateLimitedFetcher;
use crate::registry::RegistryClient;
use crate::sync::Source;

pub const QUAY_REPO: &str = "quay.io";
pub const QUAY_URL: &str = "https://quay.io";
pub const FLANNEL_NAMESPACE: &str = "coreos";

/// Builds the [`Source`] for one registry from the run's configuration.
pub type Builder = fn(&Configuration, Arc<RateLimitedFetcher>) -> Source;

#[derive(Clone, Default)]
pub struct Synchronizers {
    builders: BTreeMap<String, Builder>,
}

impl Synchronizers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defaults() -> Self {
        let mut synchronizers = Self::new();
        synchronizers.register("gcr", gcr);
        synchronizers.register("flannel", flannel);
        synchronizers
    }

    /// Adds or replaces the builder for `name`.
    pub fn register(&mut self, name: &str, builder: Builder) -> &mut Self {
        self.builders.insert(name.to_string(), builder);
        self
    }

    pub fn names(&self) -> Vec<&str> {
        self.builders.keys().map(String::as_str).collect()
    }

    pub fn build(
        &self,
        name: &str,
        config: &Configuration,
        fetcher: Arc<RateLimitedFetcher>,
    ) -> Result<Source, ConfigError> {
        let builder = self
            .builders
            .get(name)
            .ok_or_else(|| ConfigError::UnknownSynchronizer {
                name: name.to_string(),
                known: self.names().join(", "),
            })?;

        Ok(builder(config, fetcher))
    }
}

fn client(
    config: &Configuration,
    default_url: &str,
    fetcher: Arc<RateLimitedFetcher>,
) -> Arc<RegistryClient> {
    let url = config.source.url.as_deref().unwrap_or(default_url);
    Arc::new(RegistryClient::new(url.trim_end_matches('/'), fetcher))
}

fn source(namespace: String, catalog: Arc<dyn Catalog>, client: Arc<RegistryClient>) -> Source {
    Source {
        namespace,
        catalog,
        manifests: client,
    }
}

fn gcr(config: &Configuration, fetcher: Arc<RateLimitedFetcher>) -> Source {
    let client = client(config, GCR_URL, fetcher);
    let namespace = config
        .namespace
        .clone()
        .unwrap_or_else(|| GCR_NAMESPACE.to_string());

    source(namespace, Arc::new(GcrCatalog::new(client.clone())), client)
}

fn flannel(config: &Configuration, fetcher: Arc<RateLimitedFetcher>) -> Source {
    let client = client(config, QUAY_URL, fetcher);
    let namespace = config
        .namespace
        .clone()
        .unwrap_or_else(|| FLANNEL_NAMESPACE.to_string());
    let names = match config.images.is_empty() {
        true => vec!["flannel".to_string()],
        false => config.images.clone(),
    };

    source(
        namespace,
        Arc::new(FixedCatalog::new(QUAY_REPO, names, client.clone())),
        client,
    )
}
