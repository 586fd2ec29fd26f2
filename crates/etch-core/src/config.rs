use serde::{Deserialize, Serialize};

use crate::format::MAX_REGION_SIZE;

/// Configuration for an Etch engine instance.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EtchConfig {
    /// Capacity of a region's first mapping, doubled on each growth.
    /// Rounded up to a power of two.
    pub initial_region_size: usize,
    /// Cut the file back to its data length on close, dropping the
    /// over-allocated tail of the last region.
    pub truncate_on_close: bool,
    /// `msync` mapped regions on every flush. Without it, flush only
    /// updates the header in memory and leaves write-back to the OS.
    pub sync_on_flush: bool,
}

impl Default for EtchConfig {
    fn default() -> Self {
        Self {
            initial_region_size: 64 * 1024,
            truncate_on_close: true,
            sync_on_flush: true,
        }
    }
}

impl EtchConfig {
    pub(crate) fn normalized_region_size(&self) -> usize {
        self.initial_region_size
            .clamp(4096, MAX_REGION_SIZE)
            .next_power_of_two()
    }
}
