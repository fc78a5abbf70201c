//! Configuration loading and validation for Baton.
//!
//! A configuration file is optional: every setting has a default and the
//! binary lets flags and environment variables override file values.
//! Files ending in `.kdl` are parsed as KDL, files ending in `.toml` as TOML.

pub mod kdl;
pub mod server;
pub mod validate;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

pub use server::{ListenerConfig, LifecycleConfig, StreamConfig};
pub use validate::{ValidationResult, ValidationWarning};

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read configuration file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse configuration file {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("unsupported configuration format '{0}' (expected .kdl or .toml)")]
    UnsupportedFormat(String),

    #[error("invalid configuration:\n{}", .0.join("\n"))]
    Invalid(Vec<String>),
}

/// Complete Baton configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub listeners: Vec<ListenerConfig>,
    pub lifecycle: LifecycleConfig,
    pub stream: StreamConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listeners: vec![server::default_listener()],
            lifecycle: LifecycleConfig::default(),
            stream: StreamConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a `.kdl` or `.toml` file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        debug!(path = %path.display(), "Loading configuration file");

        let source = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();

        let parsed = match extension.as_str() {
            "kdl" => Self::from_kdl_str(&source),
            "toml" => Self::from_toml_str(&source),
            other => return Err(ConfigError::UnsupportedFormat(other.to_string())),
        };

        parsed.map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: format!("{:#}", e),
        })
    }

    pub fn from_kdl_str(source: &str) -> anyhow::Result<Self> {
        kdl::parse_document(source)
    }

    pub fn from_toml_str(source: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(source)?)
    }

    /// Validate the configuration, logging warnings.
    ///
    /// Returns the full result on success so callers can report warnings.
    pub fn validate(&self) -> Result<ValidationResult, ConfigError> {
        let result = validate::validate_config(self);

        for warning in &result.warnings {
            warn!("{}", warning.message);
        }

        if !result.is_valid() {
            return Err(ConfigError::Invalid(
                result.errors.iter().map(ToString::to_string).collect(),
            ));
        }

        info!(
            listeners = self.listeners.len(),
            warnings = result.warnings.len(),
            "Configuration validated"
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const KDL_SAMPLE: &str = r#"
listeners {
    listener "http" {
        address "127.0.0.1:9090"
    }
    listener "admin-http" {
        address "127.0.0.1:9091"
    }
}
lifecycle {
    drain-grace-secs 5
    hard-exit-secs 2
    pid-file "/tmp/baton-test.pid"
    successor-program "/usr/local/bin/baton"
    successor-args "-c" "/etc/baton/baton.kdl"
}
stream {
    interval-ms 250
    release-tag "v2"
}
"#;

    #[test]
    fn test_kdl_config() {
        let config = Config::from_kdl_str(KDL_SAMPLE).unwrap();

        assert_eq!(config.listeners.len(), 2);
        assert_eq!(config.listeners[0], ListenerConfig::new("http", "127.0.0.1:9090"));
        assert_eq!(config.lifecycle.drain_grace_secs, 5);
        assert_eq!(config.lifecycle.hard_exit_secs, 2);
        assert_eq!(
            config.lifecycle.readiness_timeout_secs,
            server::default_readiness_timeout()
        );
        assert_eq!(
            config.lifecycle.pid_file.as_deref(),
            Some(Path::new("/tmp/baton-test.pid"))
        );
        assert_eq!(
            config.lifecycle.successor_program.as_deref(),
            Some(Path::new("/usr/local/bin/baton"))
        );
        assert_eq!(
            config.lifecycle.successor_args,
            Some(vec!["-c".to_string(), "/etc/baton/baton.kdl".to_string()])
        );
        assert_eq!(config.stream.interval_ms, 250);
        assert_eq!(config.stream.release_tag.as_deref(), Some("v2"));
    }

    #[test]
    fn test_kdl_without_listeners_keeps_default() {
        let config = Config::from_kdl_str("lifecycle {\n    drain-grace-secs 1\n}\n").unwrap();
        assert_eq!(config.listeners, vec![server::default_listener()]);
        assert_eq!(config.lifecycle.drain_grace_secs, 1);
    }

    #[test]
    fn test_kdl_listener_without_address() {
        let err = Config::from_kdl_str("listeners {\n    listener \"http\"\n}\n").unwrap_err();
        assert!(err.to_string().contains("requires an 'address'"));
    }

    #[test]
    fn test_kdl_negative_duration() {
        let err = Config::from_kdl_str("lifecycle {\n    drain-grace-secs -1\n}\n").unwrap_err();
        assert!(err.to_string().contains("non-negative"));
    }

    #[test]
    fn test_toml_config() {
        let config = Config::from_toml_str(
            r#"
[[listeners]]
name = "http"
address = "127.0.0.1:7070"

[lifecycle]
drain_grace_secs = 3
"#,
        )
        .unwrap();

        assert_eq!(config.listeners[0].address, "127.0.0.1:7070");
        assert_eq!(config.lifecycle.drain_grace_secs, 3);
        assert_eq!(config.lifecycle.hard_exit_secs, server::default_hard_exit());
        assert_eq!(config.stream, StreamConfig::default());
    }

    #[test]
    fn test_from_file_dispatches_on_extension() {
        let mut file = tempfile::Builder::new().suffix(".kdl").tempfile().unwrap();
        file.write_all(KDL_SAMPLE.as_bytes()).unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.listeners.len(), 2);

        let yaml = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        assert!(matches!(
            Config::from_file(yaml.path()),
            Err(ConfigError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_validate_rejects_empty_listeners() {
        let config = Config {
            listeners: vec![],
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}
