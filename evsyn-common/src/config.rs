//! Configuration loading and config file resolution
//!
//! Config file resolution follows a fixed priority order:
//! 1. Command-line argument (highest priority)
//! 2. `EVSYN_CONFIG` environment variable
//! 3. `<config dir>/evsyn/<module>.toml` if it exists
//! 4. Compiled defaults (no file)
//!
//! A missing config file never prevents startup: the caller gets defaults
//! and a warning. A config file that exists but does not parse is an error.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Environment variable naming an explicit config file
pub const CONFIG_ENV_VAR: &str = "EVSYN_CONFIG";
/// Environment override for the inference service endpoint
pub const INFERENCE_ENDPOINT_ENV_VAR: &str = "EVSYN_INFERENCE_ENDPOINT";
/// Environment override for the inference service API key
pub const INFERENCE_API_KEY_ENV_VAR: &str = "EVSYN_INFERENCE_API_KEY";

/// Top-level TOML configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TomlConfig {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub inference: InferenceConfig,
    pub pipeline: PipelineSettings,
    pub retention: RetentionConfig,
}

/// `[server]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Socket address the HTTP surface binds to
    pub bind_address: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:5780".to_string(),
        }
    }
}

/// `[logging]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when RUST_LOG is unset (e.g. "info", "debug")
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// `[inference]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    /// Base URL of the inference service. None selects the offline heuristic client.
    pub endpoint: Option<String>,
    /// Bearer token for the inference service
    pub api_key: Option<String>,
    /// Model used when a pipeline does not name one
    pub default_model: String,
    /// Client-side pacing of outgoing calls
    pub requests_per_second: u32,
    /// Per-call timeout (milliseconds)
    pub call_timeout_ms: u64,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            api_key: None,
            default_model: "evsyn-default".to_string(),
            requests_per_second: 10,
            call_timeout_ms: 30_000,
        }
    }
}

/// `[pipeline]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    /// Concurrent inference calls within one stage
    pub max_concurrent_calls: usize,
    /// Buffered progress events per subscriber before dropping oldest
    pub subscriber_buffer: usize,
    /// Minimum confidence for a duplicate to fail the later study
    pub duplicate_threshold: f64,
    /// Quality scores below this floor are flagged for manual review
    pub quality_floor: f64,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            max_concurrent_calls: 4,
            subscriber_buffer: 256,
            duplicate_threshold: 0.9,
            quality_floor: 0.4,
        }
    }
}

/// `[retention]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// Completed runs kept before the oldest are evicted
    pub max_retained_runs: usize,
    /// Completed runs older than this are evicted (seconds)
    pub run_ttl_secs: u64,
    /// Pipelines idle this long with no retained runs are evicted (seconds)
    pub pipeline_ttl_secs: u64,
    /// Background sweep interval (seconds)
    pub sweep_interval_secs: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            max_retained_runs: 100,
            run_ttl_secs: 3_600,
            pipeline_ttl_secs: 86_400,
            sweep_interval_secs: 60,
        }
    }
}

impl TomlConfig {
    /// Apply environment overrides on top of file values
    pub fn apply_env_overrides(&mut self) {
        if let Ok(endpoint) = std::env::var(INFERENCE_ENDPOINT_ENV_VAR) {
            if !endpoint.trim().is_empty() {
                info!("Inference endpoint overridden from environment");
                self.inference.endpoint = Some(endpoint);
            }
        }
        if let Ok(key) = std::env::var(INFERENCE_API_KEY_ENV_VAR) {
            if !key.trim().is_empty() {
                info!("Inference API key loaded from environment variable");
                self.inference.api_key = Some(key);
            }
        }
    }

    /// Reject values that would make the pipeline unusable
    pub fn validate(&self) -> Result<()> {
        if self.pipeline.max_concurrent_calls == 0 {
            return Err(Error::InvalidValue(
                "pipeline.max_concurrent_calls must be at least 1".to_string(),
            ));
        }
        if self.pipeline.subscriber_buffer == 0 {
            return Err(Error::InvalidValue(
                "pipeline.subscriber_buffer must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.pipeline.duplicate_threshold) {
            return Err(Error::InvalidValue(format!(
                "pipeline.duplicate_threshold must be within 0.0-1.0, got {}",
                self.pipeline.duplicate_threshold
            )));
        }
        if !(0.0..=1.0).contains(&self.pipeline.quality_floor) {
            return Err(Error::InvalidValue(format!(
                "pipeline.quality_floor must be within 0.0-1.0, got {}",
                self.pipeline.quality_floor
            )));
        }
        if self.inference.requests_per_second == 0 {
            return Err(Error::InvalidValue(
                "inference.requests_per_second must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Resolves which config file a module should read
#[derive(Debug, Clone)]
pub struct ConfigResolver {
    module_name: String,
}

impl ConfigResolver {
    pub fn new(module_name: impl Into<String>) -> Self {
        Self {
            module_name: module_name.into(),
        }
    }

    /// Resolve the config file path, or None when compiled defaults apply
    pub fn resolve(&self, cli_arg: Option<&Path>) -> Option<PathBuf> {
        // Priority 1: Command-line argument
        if let Some(path) = cli_arg {
            return Some(path.to_path_buf());
        }

        // Priority 2: Environment variable
        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            if !path.trim().is_empty() {
                return Some(PathBuf::from(path));
            }
        }

        // Priority 3: User config directory (only if present)
        let user_config = self.default_path()?;
        if user_config.exists() {
            Some(user_config)
        } else {
            None
        }
    }

    /// Platform config location for this module, whether or not it exists
    pub fn default_path(&self) -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("evsyn").join(format!("{}.toml", self.module_name)))
    }
}

/// Load and parse a TOML config file
pub fn load_toml_config(path: &Path) -> Result<TomlConfig> {
    let content = std::fs::read_to_string(path).map_err(Error::config_io(path))?;
    let config: TomlConfig = toml::from_str(&content).map_err(|source| Error::ConfigParse {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(config)
}

/// Load config from an optional path, falling back to defaults when missing
///
/// Environment overrides are applied and the result is validated.
pub fn load_or_default(path: Option<&Path>) -> Result<TomlConfig> {
    let mut config = match path {
        Some(path) if path.exists() => {
            info!("Loading configuration from {}", path.display());
            load_toml_config(path)?
        }
        Some(path) => {
            warn!(
                "Config file {} not found, using compiled defaults",
                path.display()
            );
            TomlConfig::default()
        }
        None => {
            info!("No config file configured, using compiled defaults");
            TomlConfig::default()
        }
    };

    config.apply_env_overrides();
    config.validate()?;
    Ok(config)
}

/// Write config atomically (temp file + rename)
pub fn write_toml_config(config: &TomlConfig, path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(config)?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(Error::config_io(parent))?;
        }
    }

    let tmp_path = path.with_extension("toml.tmp");
    std::fs::write(&tmp_path, content).map_err(Error::config_io(&tmp_path))?;
    std::fs::rename(&tmp_path, path).map_err(Error::config_io(path))?;
    Ok(())
}

/// User-Agent sent by outgoing HTTP clients
pub fn get_user_agent() -> String {
    format!("evsyn/{}", env!("CARGO_PKG_VERSION"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(TomlConfig::default().validate().is_ok());
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let mut config = TomlConfig::default();
        config.pipeline.max_concurrent_calls = 0;
        assert!(matches!(config.validate(), Err(Error::InvalidValue(_))));
    }

    #[test]
    fn test_threshold_out_of_range_rejected() {
        let mut config = TomlConfig::default();
        config.pipeline.duplicate_threshold = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: TomlConfig = toml::from_str(
            r#"
            [pipeline]
            max_concurrent_calls = 8
            "#,
        )
        .unwrap();

        assert_eq!(config.pipeline.max_concurrent_calls, 8);
        assert_eq!(config.pipeline.subscriber_buffer, 256);
        assert_eq!(config.server, ServerConfig::default());
        assert!(config.inference.endpoint.is_none());
    }

    #[test]
    fn test_cli_arg_wins() {
        let resolver = ConfigResolver::new("evsyn-ingest");
        let path = PathBuf::from("/tmp/explicit.toml");
        assert_eq!(resolver.resolve(Some(&path)), Some(path));
    }

    #[test]
    fn test_user_agent_has_version() {
        assert!(get_user_agent().starts_with("evsyn/"));
    }
}
