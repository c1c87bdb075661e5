//! Agent configuration module.
//!
//! The on-disk agent configuration is a TOML record read at startup and
//! rewritten by the agent itself when serving material changes. The
//! presence of the `[serving]` section is what marks a host as a
//! controller.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::tag::Tag;

/// Name of the uninstall marker file inside the data directory. Its
/// presence at termination instructs the agent to remove itself.
pub const UNINSTALL_MARKER_FILE: &str = "uninstall-agent";

/// On-disk agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// This agent's identity tag.
    pub tag: Tag,

    /// Directory holding agent state, including the uninstall marker.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Directory for log files.
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,

    /// Ordered `host:port` control-plane endpoints.
    pub control_plane: Vec<String>,

    /// Backing-store connection info.
    pub store: StoreConfig,

    /// Serving material; present only on controller hosts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serving: Option<ServingConfig>,

    /// The version the previous upgrade-steps run completed at.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upgraded_to_version: Option<String>,

    /// Cloud provider type this host was provisioned on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_type: Option<String>,

    /// Namespace for host services, shared by all agents of one install.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Provisioning nonce; the control plane checks it against the host
    /// record to detect an agent running on the wrong machine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,

    /// Whether this host can serve image material over TLS.
    #[serde(default)]
    pub allows_secure_connection: bool,

    /// The host service unit the agent runs under.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,

    /// Lease duration D for singular flags.
    #[serde(default = "default_lease_duration")]
    #[serde(with = "duration_serde")]
    pub lease_duration: Duration,
}

/// Backing-store connection info.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Ordered `host:port` store addresses.
    pub addresses: Vec<String>,

    /// Store username.
    #[serde(default)]
    pub username: String,

    /// Store password.
    #[serde(default)]
    pub password: String,

    /// CA certificate validating the store's TLS endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_cert: Option<String>,
}

/// Serving material for controller hosts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServingConfig {
    /// PEM server certificate.
    pub cert: String,

    /// PEM server private key.
    pub private_key: String,

    /// PEM CA private key, used to reissue the server certificate.
    #[serde(default)]
    pub ca_private_key: String,

    /// Port the in-process API server listens on.
    pub api_port: u16,

    /// Shared secret for store peer authentication.
    #[serde(default)]
    pub shared_secret: String,
}

const fn default_lease_duration() -> Duration {
    Duration::from_secs(60)
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/fleetd")
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("/var/log/fleetd")
}

impl AgentConfig {
    /// Read and validate a configuration file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if a
    /// required entry is missing or malformed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Write the configuration to a file.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn to_file(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let raw = toml::to_string_pretty(self)?;
        std::fs::write(path, raw)?;
        Ok(())
    }

    /// Check the configuration's required entries.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the offending entry.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.control_plane.is_empty() {
            return Err(ConfigError::Invalid(
                "control_plane must list at least one endpoint",
            ));
        }
        if self.store.addresses.is_empty() {
            return Err(ConfigError::Invalid(
                "store.addresses must list at least one endpoint",
            ));
        }
        if let Some(serving) = &self.serving {
            if serving.cert.is_empty() || serving.private_key.is_empty() {
                return Err(ConfigError::Invalid(
                    "serving requires both cert and private_key",
                ));
            }
            if serving.api_port == 0 {
                return Err(ConfigError::Invalid("serving.api_port must be non-zero"));
            }
        }
        Ok(())
    }

    /// Whether this host carries the controller role.
    #[must_use]
    pub const fn is_controller(&self) -> bool {
        self.serving.is_some()
    }

    /// Path of the uninstall marker file.
    #[must_use]
    pub fn uninstall_marker(&self) -> PathBuf {
        self.data_dir.join(UNINSTALL_MARKER_FILE)
    }
}

/// Errors from reading or validating the agent configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read or written.
    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The file is not valid TOML for this schema.
    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// The configuration could not be serialized.
    #[error("config encode error: {0}")]
    Encode(#[from] toml::ser::Error),

    /// A required entry is missing or malformed.
    #[error("invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Durations in the agent file are written the humantime way ("30s",
/// "2m 30s") rather than as second counts.
mod duration_serde {
    use std::time::Duration;

    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&humantime::format_duration(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw)
            .map_err(|err| D::Error::custom(format!("bad duration {raw:?}: {err}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_toml() -> &'static str {
        r#"
            tag = "host-0"
            control_plane = ["10.0.0.2:17070"]

            [store]
            addresses = ["10.0.0.2:37017"]
            username = "host-0"
            password = "sekrit"
        "#
    }

    #[test]
    fn test_minimal_config_parses_with_defaults() {
        let config: AgentConfig = toml::from_str(minimal_toml()).expect("parse failed");
        config.validate().expect("validation failed");

        assert_eq!(config.tag, Tag::Host("0".to_string()));
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/fleetd"));
        assert_eq!(config.lease_duration, Duration::from_secs(60));
        assert!(!config.is_controller());
        assert!(!config.allows_secure_connection);
    }

    #[test]
    fn test_serving_section_marks_controller() {
        let raw = format!(
            "{}\n[serving]\ncert = \"CERT\"\nprivate_key = \"KEY\"\napi_port = 17070\n",
            minimal_toml()
        );
        let config: AgentConfig = toml::from_str(&raw).expect("parse failed");
        config.validate().expect("validation failed");
        assert!(config.is_controller());
    }

    #[test]
    fn test_validation_rejects_empty_endpoints() {
        let raw = r#"
            tag = "host-0"
            control_plane = []

            [store]
            addresses = ["10.0.0.2:37017"]
        "#;
        let config: AgentConfig = toml::from_str(raw).expect("parse failed");
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validation_rejects_incomplete_serving() {
        let raw = format!(
            "{}\n[serving]\ncert = \"\"\nprivate_key = \"KEY\"\napi_port = 17070\n",
            minimal_toml()
        );
        let config: AgentConfig = toml::from_str(&raw).expect("parse failed");
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_file_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir failed");
        let path = dir.path().join("agent.toml");

        let mut config: AgentConfig = toml::from_str(minimal_toml()).expect("parse failed");
        config.upgraded_to_version = Some("0.2.9".to_string());
        config.lease_duration = Duration::from_secs(90);
        config.to_file(&path).expect("write failed");

        let back = AgentConfig::from_file(&path).expect("read failed");
        assert_eq!(back.tag, config.tag);
        assert_eq!(back.upgraded_to_version, Some("0.2.9".to_string()));
        assert_eq!(back.lease_duration, Duration::from_secs(90));
    }

    #[test]
    fn test_humantime_durations() {
        let raw = r#"
            tag = "host-0"
            control_plane = ["10.0.0.2:17070"]
            lease_duration = "2m 30s"

            [store]
            addresses = ["10.0.0.2:37017"]
        "#;
        let config: AgentConfig = toml::from_str(raw).expect("parse failed");
        assert_eq!(config.lease_duration, Duration::from_secs(150));
    }
}
