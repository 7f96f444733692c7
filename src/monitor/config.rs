//! Monitor configuration, loaded from JSON and reloadable on SIGHUP.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::MONITOR_TIMEOUT;
use crate::{Error, Result};

/// GC never runs more often than this.
pub const MIN_GC_INTERVAL_MS: u64 = 1000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Period of the dead-endpoint sweep.
    /// Default: 1000 ms (also the minimum)
    pub gc_interval_ms: u64,

    /// Reclaim topics that have no subscribers left.
    /// Default: true
    pub drain_empty_topics: bool,

    /// How long a smart shutdown waits for in-flight publishes.
    /// Default: 300 s
    pub drain_timeout_secs: u64,

    /// Longest park of the monitor loop between checks.
    /// Default: 100 ms
    pub tick_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            gc_interval_ms: MIN_GC_INTERVAL_MS,
            drain_empty_topics: true,
            drain_timeout_secs: MONITOR_TIMEOUT.as_secs(),
            tick_ms: 100,
        }
    }
}

impl MonitorConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: MonitorConfig = serde_json::from_str(&text)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        Ok(config)
    }

    pub fn gc_interval(&self) -> Duration {
        Duration::from_millis(self.gc_interval_ms.max(MIN_GC_INTERVAL_MS))
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }
}
