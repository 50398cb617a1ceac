//! Device inventory: providers and name matching.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, warn};
use moka::sync::Cache;

use crate::credential::name_matcher;
use crate::device::{DeviceDescriptor, DeviceInfo};
use crate::error::AgentError;

const MATCH_CACHE_CAPACITY: u64 = 1024;

/// A source of device descriptors.
#[async_trait]
pub trait InventoryProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Current snapshot of the devices this provider knows about.
    fn list_devices(&self) -> Vec<DeviceDescriptor>;

    /// Reloads the provider's backing data.
    async fn refresh(&self) -> Result<(), AgentError> {
        Ok(())
    }
}

/// Provider serving a fixed list, usually from the agent configuration.
pub struct StaticInventory {
    name: String,
    devices: Vec<DeviceDescriptor>,
}

impl StaticInventory {
    pub fn new(name: impl Into<String>, devices: Vec<DeviceDescriptor>) -> Self {
        let name = name.into();
        let devices = devices
            .into_iter()
            .map(|mut device| {
                device.source_provider = name.clone();
                device
            })
            .collect();
        Self { name, devices }
    }
}

#[async_trait]
impl InventoryProvider for StaticInventory {
    fn name(&self) -> &str {
        &self.name
    }

    fn list_devices(&self) -> Vec<DeviceDescriptor> {
        self.devices.clone()
    }
}

/// Merged view over every registered provider.
///
/// Providers are consulted in priority order (lower first); the first
/// provider to know a name owns it.
pub struct Inventory {
    providers: Vec<(u32, Arc<dyn InventoryProvider>)>,
    match_cache: Cache<String, Arc<BTreeSet<String>>>,
}

impl Default for Inventory {
    fn default() -> Self {
        Self::new()
    }
}

impl Inventory {
    pub fn new() -> Self {
        Self {
            providers: Vec::new(),
            match_cache: Cache::new(MATCH_CACHE_CAPACITY),
        }
    }

    pub fn with_provider(mut self, priority: u32, provider: Arc<dyn InventoryProvider>) -> Self {
        self.add_provider(priority, provider);
        self
    }

    pub fn add_provider(&mut self, priority: u32, provider: Arc<dyn InventoryProvider>) {
        self.providers.push((priority, provider));
        self.providers.sort_by_key(|(priority, _)| *priority);
        self.match_cache.invalidate_all();
    }

    fn merged(&self) -> BTreeMap<String, DeviceDescriptor> {
        let mut merged = BTreeMap::new();
        for (_, provider) in &self.providers {
            for device in provider.list_devices() {
                merged.entry(device.name.clone()).or_insert(device);
            }
        }
        merged
    }

    pub fn device(&self, name: &str) -> Result<DeviceDescriptor, AgentError> {
        self.providers
            .iter()
            .find_map(|(_, provider)| {
                provider
                    .list_devices()
                    .into_iter()
                    .find(|device| device.name == name)
            })
            .ok_or_else(|| AgentError::NotFound(name.to_string()))
    }

    /// Names of every device whose name matches `regexp`.
    ///
    /// The pattern is anchored and case-insensitive. Results are cached per
    /// pattern until the next [`Inventory::refresh`].
    pub fn devices_matching(&self, regexp: &str) -> Result<Arc<BTreeSet<String>>, AgentError> {
        if let Some(hit) = self.match_cache.get(regexp) {
            return Ok(hit);
        }
        let matcher = name_matcher(regexp)
            .map_err(|e| AgentError::InvalidRequest(format!("bad regexp {regexp:?}: {e}")))?;
        let names: BTreeSet<String> = self
            .merged()
            .into_keys()
            .filter(|name| matcher.is_match(name))
            .collect();
        debug!("{} devices match {:?}", names.len(), regexp);
        let names = Arc::new(names);
        self.match_cache.insert(regexp.to_string(), names.clone());
        Ok(names)
    }

    pub fn devices_info(&self, regexp: &str) -> Result<BTreeMap<String, DeviceInfo>, AgentError> {
        let names = self.devices_matching(regexp)?;
        Ok(self
            .merged()
            .into_iter()
            .filter(|(name, _)| names.contains(name))
            .map(|(name, device)| (name, device.info()))
            .collect())
    }

    /// Refreshes every provider and drops cached matches.
    ///
    /// A failing provider keeps serving its previous data.
    pub async fn refresh(&self) {
        for (_, provider) in &self.providers {
            if let Err(e) = provider.refresh().await {
                warn!("inventory provider {} failed to refresh: {}", provider.name(), e);
            }
        }
        self.match_cache.invalidate_all();
    }
}
