//! Engine configuration.
//!
//! Parsing a config *file* is out of scope (the HTTP/ops layer owns that);
//! this module only defines the typed value the engine's constructors need.

use serde::{Deserialize, Serialize};

/// Engine-wide tunables, with conservative built-in defaults; callers (or
/// the external config-file loader) override as needed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum size in bytes of a single container file, header included.
    /// A payload may occupy at most `max_container_size - HEADER_LEN` bytes.
    pub max_container_size: u64,

    /// Optional ceiling on total bytes stored across all topics. `None`
    /// disables the check.
    pub max_total_disk_bytes: Option<u64>,

    /// Maximum length in bytes of a metadata key.
    pub max_metadata_key_length: usize,

    /// Maximum size in bytes of a metadata value's textual form.
    pub max_metadata_value_bytes: usize,

    /// Maximum number of operations accepted in one `batch_metadata` call.
    pub batch_metadata_max_operations: usize,

    /// Maximum length in bytes of a sanitised filename/origin_name.
    pub max_filename_length: usize,

    /// Maximum length in bytes of a sanitised extension.
    pub max_extension_length: usize,

    /// Number of entries between verifier progress callbacks.
    pub progress_interval: u64,

    /// Busy-wait timeout (milliseconds) for topic/orchestrator database
    /// connections.
    pub busy_timeout_ms: u32,

    /// Row cap for a single preset query, per topic and in aggregate.
    pub query_result_limit: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_container_size: 256 * 1024 * 1024, // 256 MiB
            max_total_disk_bytes: None,
            max_metadata_key_length: 256,
            max_metadata_value_bytes: 64 * 1024,
            batch_metadata_max_operations: 500,
            max_filename_length: 255,
            max_extension_length: 16,
            progress_interval: 1000,
            busy_timeout_ms: 5000,
            query_result_limit: 10_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_round_trips_through_json() {
        let cfg = EngineConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.max_container_size, back.max_container_size);
        assert_eq!(cfg.progress_interval, back.progress_interval);
    }
}
