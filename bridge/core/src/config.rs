//! TOML Configuration File Support
//!
//! Centralized configuration loading for the bridge, supporting a TOML file
//! at `~/.config/worker-bridge/bridge.toml`.
//!
//! # Configuration Priority
//!
//! Configuration values are loaded with the following priority (highest first):
//! 1. CLI arguments (applied by the caller through [`ConfigOverrides`])
//! 2. Environment variables
//! 3. TOML configuration file
//! 4. Default values
//!
//! # XDG Base Directory Compliance
//!
//! - `$XDG_CONFIG_HOME/worker-bridge/bridge.toml` (typically `~/.config/worker-bridge/bridge.toml`)
//!
//! # Example Configuration
//!
//! ```toml
//! [gateway]
//! bind_address = "127.0.0.1:3001"
//! max_connections = 100
//! max_message_size = 16777216
//! recognition_path = "/recognition"
//! chat_path = "/chat"
//!
//! [worker]
//! store_path = "faces.db"
//! recognition_program = "python3"
//! recognition_args = ["face_recognition_server.py"]
//! chat_program = "python3"
//! chat_args = ["chat_rag.py"]
//! restart_backoff_ms = 1000
//! max_line_bytes = 10485760
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::framer::MAX_LINE_SIZE;
use crate::gateway::{
    GatewayConfig, Routes, DEFAULT_CHAT_PATH, DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_RECOGNITION_PATH,
};
use crate::supervisor::{SupervisorConfig, WorkerProgram, DEFAULT_RESTART_BACKOFF};

/// Default listen address
pub const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1:3001";

/// Default cap on concurrent client connections
pub const DEFAULT_MAX_CONNECTIONS: usize = 100;

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

/// Gateway section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayToml {
    /// Address to listen on
    pub bind_address: Option<String>,

    /// Maximum concurrent client connections
    pub max_connections: Option<usize>,

    /// Largest accepted client message in bytes
    pub max_message_size: Option<usize>,

    /// Path that opens a recognition Session
    pub recognition_path: Option<String>,

    /// Path that opens a chat Session
    pub chat_path: Option<String>,
}

/// Worker section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerToml {
    /// Shared persistent store passed to every worker
    pub store_path: Option<PathBuf>,

    /// Recognition worker program
    pub recognition_program: Option<String>,

    /// Recognition worker arguments, before the store path
    pub recognition_args: Option<Vec<String>>,

    /// Chat worker program
    pub chat_program: Option<String>,

    /// Chat worker arguments, before the store path
    pub chat_args: Option<Vec<String>>,

    /// Delay before a crashed chat worker is replaced, in milliseconds
    pub restart_backoff_ms: Option<u64>,

    /// Longest accepted worker output line in bytes
    pub max_line_bytes: Option<usize>,
}

/// Top-level TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeToml {
    /// Gateway configuration section
    pub gateway: GatewayToml,

    /// Worker configuration section
    pub worker: WorkerToml,
}

// =============================================================================
// Main Configuration Struct
// =============================================================================

/// Centralized configuration for the bridge
///
/// Use [`load_config`] to load configuration with proper priority handling.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BridgeConfig {
    /// Address to listen on
    pub bind_address: String,

    /// Maximum concurrent client connections
    pub max_connections: usize,

    /// Largest accepted client message in bytes
    pub max_message_size: usize,

    /// Path that opens a recognition Session
    pub recognition_path: String,

    /// Path that opens a chat Session
    pub chat_path: String,

    /// Shared persistent store passed to every worker
    pub store_path: PathBuf,

    /// Recognition worker program
    pub recognition_program: String,

    /// Recognition worker arguments
    pub recognition_args: Vec<String>,

    /// Chat worker program
    pub chat_program: String,

    /// Chat worker arguments
    pub chat_args: Vec<String>,

    /// Delay before a crashed chat worker is replaced
    pub restart_backoff: Duration,

    /// Longest accepted worker output line in bytes
    pub max_line_bytes: usize,

    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,

    /// Source of configuration values
    source: ConfigSource,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        let workers = SupervisorConfig::default();
        Self {
            bind_address: DEFAULT_BIND_ADDRESS.to_string(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            recognition_path: DEFAULT_RECOGNITION_PATH.to_string(),
            chat_path: DEFAULT_CHAT_PATH.to_string(),
            store_path: workers.store_path,
            recognition_program: workers.recognition.program,
            recognition_args: workers.recognition.args,
            chat_program: workers.chat.program,
            chat_args: workers.chat.args,
            restart_backoff: DEFAULT_RESTART_BACKOFF,
            max_line_bytes: MAX_LINE_SIZE,
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl BridgeConfig {
    /// Create a new configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the primary source of this configuration
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Worker settings for the supervisor
    #[must_use]
    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            store_path: self.store_path.clone(),
            recognition: WorkerProgram::new(
                self.recognition_program.clone(),
                self.recognition_args.clone(),
            ),
            chat: WorkerProgram::new(self.chat_program.clone(), self.chat_args.clone()),
            restart_backoff: self.restart_backoff,
            max_line_bytes: self.max_line_bytes,
        }
    }

    /// Connection settings for the gateway
    #[must_use]
    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            routes: Routes {
                recognition_path: self.recognition_path.clone(),
                chat_path: self.chat_path.clone(),
            },
            max_message_size: self.max_message_size,
        }
    }

    /// Check that the values can actually be served
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` describing the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bind_address.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "bind_address must not be empty".to_string(),
            ));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::ValidationError(
                "max_connections must be greater than 0".to_string(),
            ));
        }
        if self.max_message_size == 0 {
            return Err(ConfigError::ValidationError(
                "max_message_size must be greater than 0".to_string(),
            ));
        }
        if self.max_line_bytes == 0 {
            return Err(ConfigError::ValidationError(
                "max_line_bytes must be greater than 0".to_string(),
            ));
        }
        if self.recognition_program.trim().is_empty() || self.chat_program.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "worker programs must not be empty".to_string(),
            ));
        }
        for (name, path) in [
            ("recognition_path", &self.recognition_path),
            ("chat_path", &self.chat_path),
        ] {
            if !path.starts_with('/') {
                return Err(ConfigError::ValidationError(format!(
                    "{name} must start with '/', got {path:?}"
                )));
            }
        }
        if self.recognition_path == self.chat_path {
            return Err(ConfigError::ValidationError(format!(
                "recognition_path and chat_path must differ, both are {:?}",
                self.chat_path
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/worker-bridge/bridge.toml` or
/// `~/.config/worker-bridge/bridge.toml` if `XDG_CONFIG_HOME` is not set.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("worker-bridge").join("bridge.toml"))
}

/// Load configuration from all sources with proper priority
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed, or if
/// the resulting values fail validation. A missing config file is not an
/// error (defaults are used).
pub fn load_config() -> Result<BridgeConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path
///
/// # Arguments
///
/// * `path` - Optional path to the configuration file. If `None`, only defaults
///   and environment variables are used.
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read or parsed,
/// or if the resulting values fail validation.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<BridgeConfig, ConfigError> {
    let mut config = load_file_config(path)?;
    apply_env_config_from(&mut config, |key| std::env::var(key).ok());
    config.validate()?;
    Ok(config)
}

/// Defaults overlaid with the file, without environment variables
fn load_file_config(path: Option<PathBuf>) -> Result<BridgeConfig, ConfigError> {
    let mut config = BridgeConfig::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: BridgeToml = toml::from_str(&toml_content)?;
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

    Ok(config)
}

/// Apply TOML configuration values to the config struct
fn apply_toml_config(config: &mut BridgeConfig, toml: &BridgeToml) {
    // Gateway settings
    if let Some(ref address) = toml.gateway.bind_address {
        config.bind_address = address.clone();
    }
    if let Some(max) = toml.gateway.max_connections {
        config.max_connections = max;
    }
    if let Some(size) = toml.gateway.max_message_size {
        config.max_message_size = size;
    }
    if let Some(ref path) = toml.gateway.recognition_path {
        config.recognition_path = path.clone();
    }
    if let Some(ref path) = toml.gateway.chat_path {
        config.chat_path = path.clone();
    }

    // Worker settings
    if let Some(ref path) = toml.worker.store_path {
        config.store_path = path.clone();
    }
    if let Some(ref program) = toml.worker.recognition_program {
        config.recognition_program = program.clone();
    }
    if let Some(ref args) = toml.worker.recognition_args {
        config.recognition_args = args.clone();
    }
    if let Some(ref program) = toml.worker.chat_program {
        config.chat_program = program.clone();
    }
    if let Some(ref args) = toml.worker.chat_args {
        config.chat_args = args.clone();
    }
    if let Some(ms) = toml.worker.restart_backoff_ms {
        config.restart_backoff = Duration::from_millis(ms);
    }
    if let Some(bytes) = toml.worker.max_line_bytes {
        config.max_line_bytes = bytes;
    }
}

/// Apply environment variable overrides using `lookup` to read variables
///
/// Unparseable numeric values are ignored with a warning.
pub fn apply_env_config_from<F>(config: &mut BridgeConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    fn parsed<T: std::str::FromStr>(key: &str, value: &str) -> Option<T> {
        let parsed = value.trim().parse::<T>().ok();
        if parsed.is_none() {
            tracing::warn!(key, value, "Ignoring unparseable environment override");
        }
        parsed
    }

    if let Some(address) = lookup("BRIDGE_BIND_ADDRESS") {
        config.bind_address = address;
        config.source = ConfigSource::Env;
    }
    if let Some(value) = lookup("BRIDGE_MAX_CONNECTIONS") {
        if let Some(n) = parsed::<usize>("BRIDGE_MAX_CONNECTIONS", &value) {
            config.max_connections = n;
            config.source = ConfigSource::Env;
        }
    }
    if let Some(value) = lookup("BRIDGE_MAX_MESSAGE_SIZE") {
        if let Some(n) = parsed::<usize>("BRIDGE_MAX_MESSAGE_SIZE", &value) {
            config.max_message_size = n;
            config.source = ConfigSource::Env;
        }
    }
    if let Some(path) = lookup("BRIDGE_STORE_PATH") {
        config.store_path = PathBuf::from(path);
        config.source = ConfigSource::Env;
    }
    if let Some(program) = lookup("BRIDGE_RECOGNITION_PROGRAM") {
        config.recognition_program = program;
        config.source = ConfigSource::Env;
    }
    if let Some(program) = lookup("BRIDGE_CHAT_PROGRAM") {
        config.chat_program = program;
        config.source = ConfigSource::Env;
    }
    if let Some(value) = lookup("BRIDGE_RESTART_BACKOFF_MS") {
        if let Some(ms) = parsed::<u64>("BRIDGE_RESTART_BACKOFF_MS", &value) {
            config.restart_backoff = Duration::from_millis(ms);
            config.source = ConfigSource::Env;
        }
    }
    if let Some(value) = lookup("BRIDGE_MAX_LINE_BYTES") {
        if let Some(n) = parsed::<usize>("BRIDGE_MAX_LINE_BYTES", &value) {
            config.max_line_bytes = n;
            config.source = ConfigSource::Env;
        }
    }
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// Builder for applying CLI overrides to configuration
///
/// Use this after [`load_config`] to apply command-line argument overrides.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConfigOverrides {
    /// Listen address override
    pub bind_address: Option<String>,
    /// Store path override
    pub store_path: Option<PathBuf>,
}

impl ConfigOverrides {
    /// Create a new empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set listen address override
    #[must_use]
    pub fn with_bind_address(mut self, address: String) -> Self {
        self.bind_address = Some(address);
        self
    }

    /// Set store path override
    #[must_use]
    pub fn with_store_path(mut self, path: PathBuf) -> Self {
        self.store_path = Some(path);
        self
    }

    /// Apply overrides to a configuration
    pub fn apply(&self, config: &mut BridgeConfig) {
        if self.bind_address.is_some() || self.store_path.is_some() {
            config.source = ConfigSource::Cli;
        }

        if let Some(ref address) = self.bind_address {
            config.bind_address = address.clone();
        }
        if let Some(ref path) = self.store_path {
            config.store_path = path.clone();
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    fn env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    // =========================================================================
    // Default Configuration Tests
    // =========================================================================

    #[test]
    fn test_default_config() {
        let config = BridgeConfig::default();
        assert_eq!(config.bind_address, "127.0.0.1:3001");
        assert_eq!(config.max_connections, 100);
        assert_eq!(config.max_message_size, 16 * 1024 * 1024);
        assert_eq!(config.recognition_path, "/recognition");
        assert_eq!(config.chat_path, "/chat");
        assert_eq!(config.store_path, PathBuf::from("faces.db"));
        assert_eq!(config.restart_backoff, Duration::from_millis(1000));
        assert_eq!(config.max_line_bytes, 10 * 1024 * 1024);
        assert_eq!(config.source(), ConfigSource::Default);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_config_path() {
        if let Some(p) = default_config_path() {
            assert!(p.to_string_lossy().contains("worker-bridge"));
            assert!(p.to_string_lossy().ends_with("bridge.toml"));
        }
    }

    // =========================================================================
    // TOML Parsing Tests
    // =========================================================================

    #[test]
    fn test_parse_valid_toml() {
        let file = write_config(
            r#"
[gateway]
bind_address = "0.0.0.0:9000"
max_connections = 8
max_message_size = 1048576
recognition_path = "/faces"
chat_path = "/ask"

[worker]
store_path = "/var/lib/bridge/faces.db"
recognition_program = "/opt/bridge/recognize"
recognition_args = ["--gpu"]
chat_program = "/opt/bridge/chat"
chat_args = []
restart_backoff_ms = 250
max_line_bytes = 4096
"#,
        );

        let config = load_file_config(Some(file.path().to_path_buf())).unwrap();

        assert_eq!(config.bind_address, "0.0.0.0:9000");
        assert_eq!(config.max_connections, 8);
        assert_eq!(config.max_message_size, 1_048_576);
        assert_eq!(config.recognition_path, "/faces");
        assert_eq!(config.chat_path, "/ask");
        assert_eq!(config.store_path, PathBuf::from("/var/lib/bridge/faces.db"));
        assert_eq!(config.recognition_program, "/opt/bridge/recognize");
        assert_eq!(config.recognition_args, vec!["--gpu"]);
        assert!(config.chat_args.is_empty());
        assert_eq!(config.restart_backoff, Duration::from_millis(250));
        assert_eq!(config.max_line_bytes, 4096);
        assert_eq!(config.source(), ConfigSource::File);
        assert_eq!(config.config_file_path, Some(file.path().to_path_buf()));
    }

    #[test]
    fn test_parse_partial_toml() {
        let file = write_config(
            r#"
[worker]
restart_backoff_ms = 50
"#,
        );

        let config = load_file_config(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(config.restart_backoff, Duration::from_millis(50));
        // Everything else keeps its default
        assert_eq!(config.bind_address, DEFAULT_BIND_ADDRESS);
        assert_eq!(config.chat_args, vec!["chat_rag.py"]);
    }

    #[test]
    fn test_missing_file_graceful() {
        let path = PathBuf::from("/nonexistent/path/bridge.toml");
        let config = load_file_config(Some(path)).unwrap();
        assert_eq!(config.source(), ConfigSource::Default);
        assert!(config.config_file_path.is_none());
    }

    #[test]
    fn test_malformed_toml_error() {
        let file = write_config(
            r#"
[gateway
max_connections = "many"
"#,
        );
        let result = load_file_config(Some(file.path().to_path_buf()));
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_wrong_type_is_parse_error() {
        let file = write_config(
            r#"
[worker]
restart_backoff_ms = "soon"
"#,
        );
        let result = load_file_config(Some(file.path().to_path_buf()));
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_invalid_values_fail_load() {
        let file = write_config(
            r#"
[gateway]
chat_path = "/recognition"
"#,
        );
        let result = load_config_from_path(Some(file.path().to_path_buf()));
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }

    // =========================================================================
    // Environment Override Tests
    // =========================================================================

    #[test]
    fn test_env_overrides_file() {
        let file = write_config(
            r#"
[gateway]
bind_address = "0.0.0.0:9000"
"#,
        );
        let mut config = load_file_config(Some(file.path().to_path_buf())).unwrap();
        apply_env_config_from(
            &mut config,
            env(&[
                ("BRIDGE_BIND_ADDRESS", "127.0.0.1:4000"),
                ("BRIDGE_RESTART_BACKOFF_MS", "10"),
                ("BRIDGE_STORE_PATH", "/data/faces.db"),
            ]),
        );

        assert_eq!(config.bind_address, "127.0.0.1:4000");
        assert_eq!(config.restart_backoff, Duration::from_millis(10));
        assert_eq!(config.store_path, PathBuf::from("/data/faces.db"));
        assert_eq!(config.source(), ConfigSource::Env);
    }

    #[test]
    fn test_unparseable_env_is_ignored() {
        let mut config = BridgeConfig::default();
        apply_env_config_from(&mut config, env(&[("BRIDGE_MAX_CONNECTIONS", "lots")]));
        assert_eq!(config.max_connections, DEFAULT_MAX_CONNECTIONS);
        assert_eq!(config.source(), ConfigSource::Default);
    }

    // =========================================================================
    // Validation Tests
    // =========================================================================

    #[test]
    fn test_validation_rules() {
        let mut config = BridgeConfig::default();
        config.max_connections = 0;
        assert!(config.validate().is_err());

        let mut config = BridgeConfig::default();
        config.max_line_bytes = 0;
        assert!(config.validate().is_err());

        let mut config = BridgeConfig::default();
        config.chat_program = "  ".to_string();
        assert!(config.validate().is_err());

        let mut config = BridgeConfig::default();
        config.recognition_path = "recognition".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("recognition_path"));
    }

    // =========================================================================
    // CLI Override Tests
    // =========================================================================

    #[test]
    fn test_cli_overrides() {
        let mut config = BridgeConfig::default();
        let overrides = ConfigOverrides::new()
            .with_bind_address("127.0.0.1:5555".to_string())
            .with_store_path(PathBuf::from("/tmp/other.db"));

        overrides.apply(&mut config);

        assert_eq!(config.bind_address, "127.0.0.1:5555");
        assert_eq!(config.store_path, PathBuf::from("/tmp/other.db"));
        assert_eq!(config.source(), ConfigSource::Cli);
    }

    #[test]
    fn test_empty_overrides_keep_source() {
        let mut config = BridgeConfig::default();
        ConfigOverrides::new().apply(&mut config);
        assert_eq!(config.source(), ConfigSource::Default);
    }

    // =========================================================================
    // Derived Settings Tests
    // =========================================================================

    #[test]
    fn test_derived_settings() {
        let mut config = BridgeConfig::default();
        config.store_path = PathBuf::from("/srv/faces.db");
        config.chat_path = "/ask".to_string();

        let supervisor = config.supervisor_config();
        let command = supervisor.command_for(crate::session::SessionKind::Chat);
        assert_eq!(command.args.last().map(String::as_str), Some("/srv/faces.db"));

        let gateway = config.gateway_config();
        assert_eq!(
            gateway.routes.classify("/ask"),
            Some(crate::session::SessionKind::Chat)
        );
    }
}
