//! Engine configuration for Weft.
//!
//! `EngineConfig` controls the write-coalescing cadence, the generation poll
//! interval, and the patch retry budget. Loaded from TOML; all fields have
//! defaults matching the reference deployment.

use serde::{Deserialize, Serialize};

/// Tuning knobs for the Weft engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// How often the patch queues drain pending batches to storage, in
    /// milliseconds.
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    /// How often the dispatcher re-reads a persisted generation while
    /// waiting for it to reach a terminal state, in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Write attempts per patch batch before the batch is dropped.
    #[serde(default = "default_patch_retry_limit")]
    pub patch_retry_limit: u32,
}

fn default_flush_interval_ms() -> u64 {
    50
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_patch_retry_limit() -> u32 {
    3
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: default_flush_interval_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            patch_retry_limit: default_patch_retry_limit(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let config = EngineConfig::default();
        assert_eq!(config.flush_interval_ms, 50);
        assert_eq!(config.poll_interval_ms, 1000);
        assert_eq!(config.patch_retry_limit, 3);
    }

    #[test]
    fn deserialize_empty_toml_uses_defaults() {
        let config: EngineConfig = toml::from_str("").unwrap();
        assert_eq!(config.flush_interval_ms, 50);
        assert_eq!(config.patch_retry_limit, 3);
    }

    #[test]
    fn deserialize_overrides() {
        let config: EngineConfig = toml::from_str(
            r#"
flush_interval_ms = 10
poll_interval_ms = 100
"#,
        )
        .unwrap();
        assert_eq!(config.flush_interval_ms, 10);
        assert_eq!(config.poll_interval_ms, 100);
        assert_eq!(config.patch_retry_limit, 3);
    }
}
