//! Ingestion configuration

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Tuning knobs for the ingestion pipeline.
///
/// Four bounded buffers sit between the decoders and the consumer, so at most
/// `4 * page_buffer_size` pages are resident at once, each holding at most
/// `revision_buffer_size` revision payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Decoder concurrency, enricher pool size and page channel capacity.
    #[serde(default = "default_page_buffer_size")]
    pub page_buffer_size: usize,
    /// Capacity of each per-page revision channel.
    #[serde(default = "default_revision_buffer_size")]
    pub revision_buffer_size: usize,
    /// Per-page deadline for the abstract lookup, in seconds. Generous so
    /// that large backfills survive upstream rate limiting.
    #[serde(default = "default_abstract_timeout_secs")]
    pub abstract_timeout_secs: u64,
    /// Restrict the run to the first dump file. Used for test runs against a
    /// full mirror.
    #[serde(default)]
    pub restrict_to_first_file: bool,
}

fn default_page_buffer_size() -> usize {
    40
}

fn default_revision_buffer_size() -> usize {
    300
}

fn default_abstract_timeout_secs() -> u64 {
    6 * 60 * 60
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            page_buffer_size: default_page_buffer_size(),
            revision_buffer_size: default_revision_buffer_size(),
            abstract_timeout_secs: default_abstract_timeout_secs(),
            restrict_to_first_file: false,
        }
    }
}

impl IngestConfig {
    /// Load configuration from a TOML file and validate it.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            anyhow::anyhow!("Failed to read config file '{}': {}", path.display(), e)
        })?;
        let config: IngestConfig = toml::from_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse config file '{}': {}", path.display(), e)
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all fields, reporting every problem at once.
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        if self.page_buffer_size == 0 {
            errors.push("page_buffer_size must be positive".to_string());
        }
        if self.revision_buffer_size == 0 {
            errors.push("revision_buffer_size must be positive".to_string());
        }
        if self.abstract_timeout_secs == 0 {
            errors.push("abstract_timeout_secs must be positive".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            anyhow::bail!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            );
        }
    }

    pub fn abstract_timeout(&self) -> Duration {
        Duration::from_secs(self.abstract_timeout_secs)
    }
}
