//! TOML Configuration File Support
//!
//! Configuration is read from `$XDG_CONFIG_HOME/switchboard/switchboard.toml`
//! (typically `~/.config/switchboard/switchboard.toml`).
//!
//! # Configuration Priority
//!
//! Highest first:
//! 1. CLI arguments ([`ConfigOverrides`])
//! 2. Environment variables (`SWITCHBOARD_*`)
//! 3. TOML configuration file
//! 4. Default values
//!
//! # Example Configuration
//!
//! ```toml
//! [merge]
//! capacity = 256
//!
//! [broadcast]
//! sink_capacity = 512
//!
//! [buffer]
//! max_fragments = 10000
//! orphan_grace_secs = 30
//! stalled_producer_secs = 600
//! sweep_interval_secs = 10
//!
//! [reconcile]
//! reasoning_separator = "\n-----\n"
//!
//! [history]
//! cache_topics = 64
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::client::CompositeConfig;
use crate::reconcile::ReconcileOptions;
use crate::resume::ResumeConfig;
use crate::streaming::StreamManagerConfig;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Tracks where a configuration value came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from command-line argument
    Cli,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// Prompt merge section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeToml {
    /// Capacity of the merged prompt channel
    pub capacity: Option<usize>,
}

/// Response broadcast section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcastToml {
    /// Per-sink queue capacity
    pub sink_capacity: Option<usize>,
}

/// Stream buffer section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferToml {
    /// Fragments retained per topic
    pub max_fragments: Option<usize>,

    /// Seconds an abandoned buffer is kept
    pub orphan_grace_secs: Option<u64>,

    /// Seconds a silent producer may go before its buffer is reclaimed
    pub stalled_producer_secs: Option<u64>,

    /// Seconds between orphan sweeps
    pub sweep_interval_secs: Option<u64>,
}

/// Reconciliation section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileToml {
    /// Text placed between reasoning of consecutive replies
    pub reasoning_separator: Option<String>,
}

/// History section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryToml {
    /// Topics whose history a resume keeps cached
    pub cache_topics: Option<usize>,
}

/// Top-level TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SwitchboardToml {
    /// Prompt merge section
    pub merge: MergeToml,

    /// Response broadcast section
    pub broadcast: BroadcastToml,

    /// Stream buffer section
    pub buffer: BufferToml,

    /// Reconciliation section
    pub reconcile: ReconcileToml,

    /// History section
    pub history: HistoryToml,
}

// =============================================================================
// Main Configuration Struct
// =============================================================================

/// Resolved configuration for switchboard
///
/// Use [`load_config`] to load it with proper priority handling, then
/// convert it with [`stream_manager_config`](Self::stream_manager_config),
/// [`composite_config`](Self::composite_config) and
/// [`resume_config`](Self::resume_config).
#[derive(Clone, Debug)]
pub struct SwitchboardConfig {
    /// Capacity of the merged prompt channel
    pub merge_capacity: usize,

    /// Per-sink queue capacity
    pub sink_capacity: usize,

    /// Fragments retained per topic
    pub max_fragments: usize,

    /// How long an abandoned buffer is kept
    pub orphan_grace: Duration,

    /// How long a silent producer may go before its buffer is reclaimed
    pub stalled_producer: Duration,

    /// Interval between orphan sweeps
    pub sweep_interval: Duration,

    /// Text placed between reasoning of consecutive replies
    pub reasoning_separator: String,

    /// Topics whose history a resume keeps cached
    pub history_cache_topics: usize,

    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,

    source: ConfigSource,
}

impl Default for SwitchboardConfig {
    fn default() -> Self {
        let streams = StreamManagerConfig::default();
        let composite = CompositeConfig::default();
        let resume = ResumeConfig::default();
        Self {
            merge_capacity: composite.merge_capacity,
            sink_capacity: composite.sink_capacity,
            max_fragments: streams.max_fragments,
            orphan_grace: streams.orphan_grace,
            stalled_producer: streams.stalled_producer,
            sweep_interval: streams.sweep_interval,
            reasoning_separator: resume.reconcile.reasoning_separator,
            history_cache_topics: resume.cache_topics,
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl SwitchboardConfig {
    /// Create a new configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the highest-priority source that set a value
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Set the configuration source
    pub fn set_source(&mut self, source: ConfigSource) {
        self.source = source;
    }

    /// Reject values the runtime cannot work with
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] naming the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let zero = |name: &str| Err(ConfigError::ValidationError(format!("{name} must be greater than zero")));

        if self.merge_capacity == 0 {
            return zero("merge.capacity");
        }
        if self.sink_capacity == 0 {
            return zero("broadcast.sink_capacity");
        }
        if self.max_fragments == 0 {
            return zero("buffer.max_fragments");
        }
        if self.sweep_interval.is_zero() {
            return zero("buffer.sweep_interval_secs");
        }
        if self.stalled_producer < self.orphan_grace {
            return Err(ConfigError::ValidationError(
                "buffer.stalled_producer_secs must not be shorter than buffer.orphan_grace_secs"
                    .to_string(),
            ));
        }
        Ok(())
    }

    /// Settings for the [`StreamManager`](crate::streaming::StreamManager)
    #[must_use]
    pub fn stream_manager_config(&self) -> StreamManagerConfig {
        StreamManagerConfig {
            max_fragments: self.max_fragments,
            orphan_grace: self.orphan_grace,
            stalled_producer: self.stalled_producer,
            sweep_interval: self.sweep_interval,
            ..StreamManagerConfig::default()
        }
    }

    /// Settings for the [`CompositeClient`](crate::client::CompositeClient)
    #[must_use]
    pub fn composite_config(&self) -> CompositeConfig {
        CompositeConfig {
            merge_capacity: self.merge_capacity,
            sink_capacity: self.sink_capacity,
        }
    }

    /// Settings for the [`StreamResumeCoordinator`](crate::resume::StreamResumeCoordinator)
    #[must_use]
    pub fn resume_config(&self) -> ResumeConfig {
        ResumeConfig {
            reconcile: ReconcileOptions {
                reasoning_separator: self.reasoning_separator.clone(),
            },
            cache_topics: self.history_cache_topics,
        }
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/switchboard/switchboard.toml` or
/// `~/.config/switchboard/switchboard.toml` if `XDG_CONFIG_HOME` is not set.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("switchboard").join("switchboard.toml"))
}

/// Load configuration from the default path, then the environment
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed, or if
/// the result fails validation. A missing config file is not an error.
pub fn load_config() -> Result<SwitchboardConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path, then the environment
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read or parsed,
/// or if the result fails validation.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<SwitchboardConfig, ConfigError> {
    let mut config = SwitchboardConfig::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: SwitchboardToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, &toml_config);
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    apply_env_config(&mut config, |key| std::env::var(key).ok());

    config.validate()?;
    Ok(config)
}

fn apply_toml_config(config: &mut SwitchboardConfig, toml: &SwitchboardToml) {
    if let Some(capacity) = toml.merge.capacity {
        config.merge_capacity = capacity;
    }
    if let Some(capacity) = toml.broadcast.sink_capacity {
        config.sink_capacity = capacity;
    }

    if let Some(max) = toml.buffer.max_fragments {
        config.max_fragments = max;
    }
    if let Some(secs) = toml.buffer.orphan_grace_secs {
        config.orphan_grace = Duration::from_secs(secs);
    }
    if let Some(secs) = toml.buffer.stalled_producer_secs {
        config.stalled_producer = Duration::from_secs(secs);
    }
    if let Some(secs) = toml.buffer.sweep_interval_secs {
        config.sweep_interval = Duration::from_secs(secs);
    }

    if let Some(ref separator) = toml.reconcile.reasoning_separator {
        config.reasoning_separator = separator.clone();
    }
    if let Some(topics) = toml.history.cache_topics {
        config.history_cache_topics = topics;
    }
}

/// Apply `SWITCHBOARD_*` overrides read through `lookup`
///
/// Values that fail to parse are ignored with a warning.
fn apply_env_config<F>(config: &mut SwitchboardConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    fn parsed<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
        let raw = lookup(key)?;
        match raw.trim().parse() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(key, value = %raw, "Ignoring unparseable environment override");
                None
            }
        }
    }

    if let Some(n) = parsed::<usize>(&lookup, "SWITCHBOARD_MERGE_CAPACITY") {
        config.merge_capacity = n;
        config.source = ConfigSource::Env;
    }
    if let Some(n) = parsed::<usize>(&lookup, "SWITCHBOARD_SINK_CAPACITY") {
        config.sink_capacity = n;
        config.source = ConfigSource::Env;
    }
    if let Some(n) = parsed::<usize>(&lookup, "SWITCHBOARD_MAX_FRAGMENTS") {
        config.max_fragments = n;
        config.source = ConfigSource::Env;
    }
    if let Some(secs) = parsed::<u64>(&lookup, "SWITCHBOARD_ORPHAN_GRACE_SECS") {
        config.orphan_grace = Duration::from_secs(secs);
        config.source = ConfigSource::Env;
    }
    if let Some(secs) = parsed::<u64>(&lookup, "SWITCHBOARD_STALLED_PRODUCER_SECS") {
        config.stalled_producer = Duration::from_secs(secs);
        config.source = ConfigSource::Env;
    }
    if let Some(secs) = parsed::<u64>(&lookup, "SWITCHBOARD_SWEEP_INTERVAL_SECS") {
        config.sweep_interval = Duration::from_secs(secs);
        config.source = ConfigSource::Env;
    }
    if let Some(separator) = lookup("SWITCHBOARD_REASONING_SEPARATOR") {
        config.reasoning_separator = separator;
        config.source = ConfigSource::Env;
    }
    if let Some(n) = parsed::<usize>(&lookup, "SWITCHBOARD_HISTORY_CACHE_TOPICS") {
        config.history_cache_topics = n;
        config.source = ConfigSource::Env;
    }
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// Builder for applying CLI overrides to configuration
///
/// Use this after [`load_config`] to apply command-line argument overrides.
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Merge channel capacity override
    pub merge_capacity: Option<usize>,

    /// Per-sink capacity override
    pub sink_capacity: Option<usize>,

    /// Orphan grace override (seconds)
    pub orphan_grace_secs: Option<u64>,
}

impl ConfigOverrides {
    /// Create a new empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set merge channel capacity override
    #[must_use]
    pub fn with_merge_capacity(mut self, capacity: usize) -> Self {
        self.merge_capacity = Some(capacity);
        self
    }

    /// Set per-sink capacity override
    #[must_use]
    pub fn with_sink_capacity(mut self, capacity: usize) -> Self {
        self.sink_capacity = Some(capacity);
        self
    }

    /// Set orphan grace override
    #[must_use]
    pub fn with_orphan_grace_secs(mut self, secs: u64) -> Self {
        self.orphan_grace_secs = Some(secs);
        self
    }

    /// Apply overrides to a configuration, then re-validate it
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] if an override is invalid.
    pub fn apply(&self, config: &mut SwitchboardConfig) -> Result<(), ConfigError> {
        if self.merge_capacity.is_some() || self.sink_capacity.is_some() || self.orphan_grace_secs.is_some() {
            config.source = ConfigSource::Cli;
        }

        if let Some(capacity) = self.merge_capacity {
            config.merge_capacity = capacity;
        }
        if let Some(capacity) = self.sink_capacity {
            config.sink_capacity = capacity;
        }
        if let Some(secs) = self.orphan_grace_secs {
            config.orphan_grace = Duration::from_secs(secs);
        }

        config.validate()
    }
}

// =============================================================================
// Tests
// =============================================================================
