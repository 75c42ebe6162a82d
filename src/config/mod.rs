//! Configuration loading and parsing.
//!
//! Two kinds of YAML input are supported: the engine settings
//! ([`EngineConfig`]) and a directory of per-project job definition files
//! (see [`load_definitions_from_directory`]).

mod definitions;
mod error;

pub use definitions::{
    JobEntry, ProjectDefinitions, ProjectFile, load_definitions_from_directory,
    parse_project_file,
};
pub use error::ConfigError;

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::storage::DEFAULT_DEBUG_LOG_LIMIT;

/// Deployment environment the engine runs in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    /// Production deployment.
    #[default]
    Production,
    /// Local development server. Enables destructive maintenance calls.
    DevServer,
}

/// Engine settings (cronkeeper.yaml).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Attempts per job transaction before contention is reported.
    pub transaction_attempts: u32,
    /// Random draws per invocation ID before giving up.
    pub invocation_id_attempts: u32,
    /// Delay between queueing a start request and its delivery, in seconds.
    #[serde(with = "serde_duration")]
    pub start_delay: Duration,
    /// Size cap of an invocation's debug log in bytes.
    pub debug_log_limit: usize,
    /// Deployment environment.
    pub environment: Environment,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            transaction_attempts: 10,
            invocation_id_attempts: 10,
            start_delay: Duration::from_secs(1),
            debug_log_limit: DEFAULT_DEBUG_LOG_LIMIT,
            environment: Environment::Production,
        }
    }
}

impl EngineConfig {
    /// Load engine settings from a file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content =
            std::fs::read_to_string(path).map_err(|source| ConfigError::FileReadError {
                path: path.to_path_buf(),
                source,
            })?;
        Self::parse(&content).map_err(|e| match e {
            ConfigError::YamlError(source) => ConfigError::YamlFileError {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })
    }

    /// Parse engine settings from a YAML string.
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.transaction_attempts == 0 {
            return Err(ConfigError::InvalidConfig(
                "transaction_attempts cannot be zero".into(),
            ));
        }
        if self.invocation_id_attempts == 0 {
            return Err(ConfigError::InvalidConfig(
                "invocation_id_attempts cannot be zero".into(),
            ));
        }
        if self.debug_log_limit < crate::storage::TRUNCATION_MARKER.len() {
            return Err(ConfigError::InvalidConfig(format!(
                "debug_log_limit must be at least {} bytes",
                crate::storage::TRUNCATION_MARKER.len()
            )));
        }
        Ok(())
    }
}

/// Serde helper for Duration serialization.
///
/// Serializes Duration as seconds (matching YAML config format).
mod serde_duration {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
