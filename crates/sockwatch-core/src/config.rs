//! Configuration system for sockwatch
//!
//! Provides:
//! - Config file discovery (CLI flag, env var, standard paths)
//! - TOML parsing with serde
//! - Environment variable overrides
//! - Validation

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Complete sensor configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    /// Sensor settings
    pub sensor: SensorSettings,

    /// Capture settings
    pub capture: CaptureSettings,

    /// Output settings
    pub output: OutputSettings,
}

/// Sensor settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorSettings {
    /// Log level: trace, debug, info, warn, error
    pub log_level: String,
}

impl Default for SensorSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

/// Capture settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSettings {
    /// Path to the compiled bpf object
    pub ebpf_path: Option<String>,

    /// Kernel function probed for outbound connects
    pub connect_symbol: String,

    /// Attach the exec/exit tracepoints
    pub process: bool,

    /// Attach the connect/accept/close probes
    pub network: bool,

    /// Entries in the userspace correlation store (demo mode)
    pub correlation_capacity: usize,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            ebpf_path: None,
            connect_symbol: "tcp_v4_connect".to_string(),
            process: true,
            network: true,
            correlation_capacity: sockwatch_common::CORRELATION_CAPACITY as usize,
        }
    }
}

/// How decoded events are written
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// One human readable line per event on stdout
    #[default]
    Text,
    /// JSON lines on stdout
    Json,
    /// JSON lines appended to `output.path`
    Jsonl,
}

impl OutputFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputFormat::Text => "text",
            OutputFormat::Json => "json",
            OutputFormat::Jsonl => "jsonl",
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutputFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            "jsonl" => Ok(OutputFormat::Jsonl),
            other => Err(ConfigError::ValidationError(format!(
                "Invalid output format: {}. Must be one of: text, json, jsonl",
                other
            ))),
        }
    }
}

/// Output settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputSettings {
    pub format: OutputFormat,

    /// File path for the `jsonl` format
    pub path: Option<String>,
}

/// Configuration loader
pub struct ConfigLoader {
    /// Path to config file (if specified via CLI)
    cli_path: Option<PathBuf>,
}

impl ConfigLoader {
    /// Create a new config loader
    pub fn new() -> Self {
        Self { cli_path: None }
    }

    /// Set the config path from CLI argument
    pub fn with_cli_path(mut self, path: Option<PathBuf>) -> Self {
        self.cli_path = path;
        self
    }

    /// Load configuration with the following precedence:
    /// 1. CLI --config flag
    /// 2. SOCKWATCH_CONFIG environment variable
    /// 3. $XDG_CONFIG_HOME/sockwatch/config.toml
    /// 4. /etc/sockwatch/config.toml
    /// 5. Default values
    pub fn load(&self) -> ConfigResult<SensorConfig> {
        let config_path = self.find_config_file();

        let mut config = if let Some(path) = config_path {
            info!("Loading configuration from: {}", path.display());
            self.load_from_file(&path)?
        } else {
            debug!("No config file found, using defaults");
            SensorConfig::default()
        };

        self.apply_env_overrides(&mut config)?;
        self.validate(&config)?;

        Ok(config)
    }

    /// Find the config file to use
    fn find_config_file(&self) -> Option<PathBuf> {
        // 1. CLI --config flag
        if let Some(path) = &self.cli_path {
            if path.exists() {
                return Some(path.clone());
            }
            warn!("CLI config path does not exist: {}", path.display());
        }

        // 2. SOCKWATCH_CONFIG environment variable
        if let Ok(env_path) = std::env::var("SOCKWATCH_CONFIG") {
            let path = PathBuf::from(&env_path);
            if path.exists() {
                return Some(path);
            }
            warn!("SOCKWATCH_CONFIG path does not exist: {}", env_path);
        }

        // 3. $XDG_CONFIG_HOME/sockwatch/config.toml
        if let Some(path) = Self::default_config_path() {
            if path.exists() {
                return Some(path);
            }
        }

        // 4. /etc/sockwatch/config.toml
        let path = PathBuf::from("/etc/sockwatch/config.toml");
        if path.exists() {
            return Some(path);
        }

        None
    }

    /// Load configuration from a TOML file
    pub fn load_from_file(&self, path: &Path) -> ConfigResult<SensorConfig> {
        let content = std::fs::read_to_string(path)?;
        let config: SensorConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&self, config: &mut SensorConfig) -> ConfigResult<()> {
        apply_overrides(config, |name| std::env::var(name).ok())
    }

    /// Validate configuration
    pub fn validate(&self, config: &SensorConfig) -> ConfigResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&config.sensor.log_level.to_lowercase().as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log level: {}. Must be one of: {:?}",
                config.sensor.log_level, valid_levels
            )));
        }

        if config.capture.connect_symbol.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "connect_symbol cannot be empty".to_string(),
            ));
        }

        if config.capture.correlation_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "correlation_capacity cannot be 0".to_string(),
            ));
        }

        if !config.capture.process && !config.capture.network {
            return Err(ConfigError::ValidationError(
                "At least one of capture.process or capture.network must be enabled".to_string(),
            ));
        }

        if config.output.format == OutputFormat::Jsonl && config.output.path.is_none() {
            return Err(ConfigError::ValidationError(
                "output.path is required for the jsonl format".to_string(),
            ));
        }

        Ok(())
    }

    /// Save configuration to a file
    pub fn save(&self, config: &SensorConfig, path: &Path) -> ConfigResult<()> {
        let content = toml::to_string_pretty(config).map_err(|e| {
            ConfigError::ValidationError(format!("Failed to serialize config: {}", e))
        })?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, content)?;
        info!("Configuration saved to: {}", path.display());
        Ok(())
    }

    /// Get the default per-user config file path
    pub fn default_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("sockwatch").join("config.toml"))
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Overrides read through `lookup`, one variable per setting
fn apply_overrides(
    config: &mut SensorConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> ConfigResult<()> {
    if let Some(val) = lookup("SOCKWATCH_LOG_LEVEL") {
        config.sensor.log_level = val;
    }
    if let Some(val) = lookup("SOCKWATCH_EBPF_PATH") {
        config.capture.ebpf_path = Some(val);
    }
    if let Some(val) = lookup("SOCKWATCH_OUTPUT_FORMAT") {
        config.output.format = val.parse()?;
    }
    Ok(())
}

/// Helper module for platform-specific directories
mod dirs {
    use std::path::PathBuf;

    /// Get the user's config directory
    pub fn config_dir() -> Option<PathBuf> {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .filter(|dir| !dir.is_empty())
            .map(PathBuf::from)
            .or_else(|| {
                std::env::var("HOME")
                    .ok()
                    .map(|h| PathBuf::from(h).join(".config"))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = SensorConfig::default();
        assert_eq!(config.sensor.log_level, "info");
        assert_eq!(config.capture.connect_symbol, "tcp_v4_connect");
        assert!(config.capture.process);
        assert!(config.capture.network);
        assert_eq!(config.capture.correlation_capacity, 512);
        assert_eq!(config.output.format, OutputFormat::Text);
        assert!(ConfigLoader::new().validate(&config).is_ok());
    }

    #[test]
    fn test_parse_minimal_toml() {
        let toml_str = r#"
            [sensor]
            log_level = "debug"
        "#;
        let config: SensorConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.sensor.log_level, "debug");
        // Other fields should be default
        assert!(config.capture.network);
    }

    #[test]
    fn test_parse_full_toml() {
        let toml_str = r#"
            [sensor]
            log_level = "trace"

            [capture]
            ebpf_path = "/opt/sockwatch/sockwatch"
            connect_symbol = "__tcp_v4_connect"
            process = false
            correlation_capacity = 64

            [output]
            format = "jsonl"
            path = "/tmp/events.jsonl"
        "#;

        let config: SensorConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.sensor.log_level, "trace");
        assert_eq!(
            config.capture.ebpf_path.as_deref(),
            Some("/opt/sockwatch/sockwatch")
        );
        assert_eq!(config.capture.connect_symbol, "__tcp_v4_connect");
        assert!(!config.capture.process);
        assert!(config.capture.network);
        assert_eq!(config.capture.correlation_capacity, 64);
        assert_eq!(config.output.format, OutputFormat::Jsonl);
        assert_eq!(config.output.path.as_deref(), Some("/tmp/events.jsonl"));
    }

    #[test]
    fn test_validation_invalid_log_level() {
        let config = SensorConfig {
            sensor: SensorSettings {
                log_level: "invalid".to_string(),
            },
            ..Default::default()
        };
        let loader = ConfigLoader::new();
        assert!(loader.validate(&config).is_err());
    }

    #[test]
    fn test_validation_jsonl_needs_path() {
        let mut config = SensorConfig::default();
        config.output.format = OutputFormat::Jsonl;
        let loader = ConfigLoader::new();
        assert!(loader.validate(&config).is_err());

        config.output.path = Some("/tmp/out.jsonl".to_string());
        assert!(loader.validate(&config).is_ok());
    }

    #[test]
    fn test_validation_nothing_to_capture() {
        let mut config = SensorConfig::default();
        config.capture.process = false;
        config.capture.network = false;
        assert!(ConfigLoader::new().validate(&config).is_err());
    }

    #[test]
    fn test_validation_zero_capacity() {
        let mut config = SensorConfig::default();
        config.capture.correlation_capacity = 0;
        assert!(ConfigLoader::new().validate(&config).is_err());
    }

    #[test]
    fn test_overrides() {
        let env = HashMap::from([
            ("SOCKWATCH_LOG_LEVEL", "warn"),
            ("SOCKWATCH_EBPF_PATH", "/tmp/sockwatch.o"),
            ("SOCKWATCH_OUTPUT_FORMAT", "JSON"),
        ]);
        let mut config = SensorConfig::default();
        apply_overrides(&mut config, |name| env.get(name).map(|v| v.to_string())).unwrap();

        assert_eq!(config.sensor.log_level, "warn");
        assert_eq!(config.capture.ebpf_path.as_deref(), Some("/tmp/sockwatch.o"));
        assert_eq!(config.output.format, OutputFormat::Json);
    }

    #[test]
    fn test_override_rejects_unknown_format() {
        let mut config = SensorConfig::default();
        let result = apply_overrides(&mut config, |name| {
            (name == "SOCKWATCH_OUTPUT_FORMAT").then(|| "xml".to_string())
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_load_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[output]\nformat = \"json\"\n").unwrap();

        let loader = ConfigLoader::new().with_cli_path(Some(path.clone()));
        let config = loader.load_from_file(&path).unwrap();
        assert_eq!(config.output.format, OutputFormat::Json);
    }

    #[test]
    fn test_load_rejects_bad_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[output\nformat = ").unwrap();

        let result = ConfigLoader::new().load_from_file(&path);
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = SensorConfig::default();
        config.capture.connect_symbol = "tcp_connect".to_string();
        config.output.format = OutputFormat::Json;

        let loader = ConfigLoader::new();
        loader.save(&config, &path).unwrap();
        assert_eq!(loader.load_from_file(&path).unwrap(), config);
    }

    #[test]
    fn test_serialize_config() {
        let config = SensorConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(toml_str.contains("[sensor]"));
        assert!(toml_str.contains("log_level"));
        assert!(toml_str.contains("format = \"text\""));
    }
}
