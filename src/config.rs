//! Tunables for every component, loadable from host configuration.

use std::time::Duration;

use serde::Deserialize;

/// Top-level configuration handed to [`crate::runtime::service::SyncService`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Connectivity monitor settings.
    pub monitor: MonitorConfig,
    /// Sync processor settings.
    pub processor: ProcessorConfig,
    /// Query cache settings.
    pub query: QueryConfig,
    /// Store actor persistence settings.
    pub runtime: RuntimeConfig,
}

/// Connectivity monitor settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Quiet period raw platform events must survive before subscribers hear about them.
    pub debounce_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self { debounce_ms: 1000 }
    }
}

impl MonitorConfig {
    /// Settle window as a [`Duration`].
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

/// Sync processor settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    /// Coalescing window for drain triggers.
    pub trigger_debounce_ms: u64,
    /// Pause between two mutations of the same pass.
    pub inter_mutation_delay_ms: u64,
    /// Retryable failures allowed before a mutation is failed for good.
    pub max_retries: u32,
    /// Delay before re-triggering a pass that left retryable work behind.
    pub retry_delay_ms: u64,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            trigger_debounce_ms: 500,
            inter_mutation_delay_ms: 100,
            max_retries: 3,
            retry_delay_ms: 5000,
        }
    }
}

impl ProcessorConfig {
    /// Trigger window as a [`Duration`].
    pub fn trigger_debounce(&self) -> Duration {
        Duration::from_millis(self.trigger_debounce_ms)
    }

    /// Inter-mutation pause as a [`Duration`].
    pub fn inter_mutation_delay(&self) -> Duration {
        Duration::from_millis(self.inter_mutation_delay_ms)
    }

    /// Retry re-arm delay as a [`Duration`].
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// Query cache settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    /// Age after which cache-sourced data is reported stale.
    pub stale_time_ms: u64,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            stale_time_ms: 5 * 60 * 1000,
        }
    }
}

/// Store actor persistence settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Write the sync namespace immediately after every enqueue.
    pub flush_on_enqueue: bool,
    /// Longest time a dirty snapshot may wait before it is written.
    pub batch_max_latency_ms: u64,
    /// Bound of the channel feeding the persistence worker.
    pub persist_queue_bound: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            flush_on_enqueue: true,
            batch_max_latency_ms: 75,
            persist_queue_bound: 64,
        }
    }
}
