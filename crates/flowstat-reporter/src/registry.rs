use mockall::automock;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::watch;

/// Reserved resource identifier for the gateway-wide rate limit.
pub const GLOBAL_RESOURCE: &str = "_global";

/// Rate-limit configuration entry as seen by the reporter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRateLimitConfig {
    pub resource: String,
    pub id: i32,
}

/// Lookup into the gateway's rate-limit configuration registry.
#[automock]
pub trait ResourceRegistry: Send + Sync {
    fn lookup(&self, resource: &str) -> Option<ResourceRateLimitConfig>;
}

pub type RegistryEntries = Arc<HashMap<String, ResourceRateLimitConfig>>;

/// Registry backed by the `resources` section of the settings.
///
/// Reads the latest map published by the settings refresher.
#[derive(Debug, Clone)]
pub struct ConfigRegistry {
    entries: watch::Receiver<RegistryEntries>,
}

impl ConfigRegistry {
    pub fn new(entries: watch::Receiver<RegistryEntries>) -> Self {
        Self { entries }
    }

    pub fn from_configs(configs: impl IntoIterator<Item = ResourceRateLimitConfig>) -> Self {
        let (_tx, rx) = watch::channel(index_configs(configs));
        Self::new(rx)
    }

    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ResourceRegistry for ConfigRegistry {
    fn lookup(&self, resource: &str) -> Option<ResourceRateLimitConfig> {
        self.entries.borrow().get(resource).cloned()
    }
}

pub fn index_configs(configs: impl IntoIterator<Item = ResourceRateLimitConfig>) -> RegistryEntries {
    Arc::new(
        configs
            .into_iter()
            .map(|config| (config.resource.clone(), config))
            .collect(),
    )
}
