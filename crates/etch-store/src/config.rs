use etch_core::EtchConfig;
use serde::{Deserialize, Serialize};

/// Configuration for an [`EtchStore`](crate::EtchStore).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Number of resolved cells kept in the LRU cache. Zero disables it.
    pub cache_capacity: usize,
    /// Settings for every Etch file the store opens, including the targets
    /// of garbage collection.
    pub etch: EtchConfig,
    /// Register every Etch file the store opens with the global
    /// [`ShutdownRegistry`](etch_core::ShutdownRegistry).
    #[serde(default)]
    pub close_on_shutdown: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            cache_capacity: 10_000,
            etch: EtchConfig::default(),
            close_on_shutdown: false,
        }
    }
}
