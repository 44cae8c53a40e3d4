// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Volume connection settings

use std::path::Path;

use gfapi_logging::LoggingConfig;
use serde::{Deserialize, Serialize};

use crate::error::{GlfsError, Result};
use crate::types::{DEFAULT_PORT, DEFAULT_TRANSPORT};

const TRANSPORTS: &[&str] = &["tcp", "rdma", "unix"];

/// Where to find a volume and how to talk to its management daemon
///
/// ```toml
/// host = "gluster1.example.com"
/// volume = "test"
/// port = 24007
///
/// [logging]
/// level = "debug"
/// file = "test.log"
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct VolumeConfig {
    pub host: String,
    pub volume: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_transport")]
    pub transport: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_transport() -> String {
    DEFAULT_TRANSPORT.to_string()
}

impl VolumeConfig {
    pub fn builder(host: impl Into<String>, volume: impl Into<String>) -> VolumeConfigBuilder {
        VolumeConfigBuilder {
            config: VolumeConfig {
                host: host.into(),
                volume: volume.into(),
                port: DEFAULT_PORT,
                transport: DEFAULT_TRANSPORT.to_string(),
                logging: None,
            },
        }
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: VolumeConfig =
            toml::from_str(s).map_err(|e| GlfsError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| GlfsError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(GlfsError::Config("host must not be empty".into()));
        }
        if self.volume.is_empty() {
            return Err(GlfsError::Config("volume must not be empty".into()));
        }
        if self.port == 0 {
            return Err(GlfsError::Config("port must not be 0".into()));
        }
        if !TRANSPORTS.contains(&self.transport.as_str()) {
            return Err(GlfsError::Config(format!(
                "unknown transport {:?}, expected one of {:?}",
                self.transport, TRANSPORTS
            )));
        }
        Ok(())
    }
}

/// Builder returned by [`VolumeConfig::builder`]
#[derive(Clone, Debug)]
pub struct VolumeConfigBuilder {
    config: VolumeConfig,
}

impl VolumeConfigBuilder {
    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    pub fn transport(mut self, transport: impl Into<String>) -> Self {
        self.config.transport = transport.into();
        self
    }

    pub fn logging(mut self, logging: LoggingConfig) -> Self {
        self.config.logging = Some(logging);
        self
    }

    pub fn build(self) -> Result<VolumeConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gfapi_logging::LogLevel;

    #[test]
    fn test_defaults_from_minimal_toml() {
        let config = VolumeConfig::from_toml_str(
            r#"
            host = "localhost"
            volume = "test"
            "#,
        )
        .unwrap();
        assert_eq!(config.port, 24007);
        assert_eq!(config.transport, "tcp");
        assert!(config.logging.is_none());
    }

    #[test]
    fn test_logging_section() {
        let config = VolumeConfig::from_toml_str(
            r#"
            host = "localhost"
            volume = "test"
            port = 24008

            [logging]
            level = "debug"
            file = "/var/log/gfapi/test.log"
            "#,
        )
        .unwrap();
        assert_eq!(config.port, 24008);
        let logging = config.logging.unwrap();
        assert_eq!(logging.level(), LogLevel::Debug);
        assert_eq!(
            logging.resolve_log_path("test"),
            std::path::PathBuf::from("/var/log/gfapi/test.log")
        );
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let err = VolumeConfig::from_toml_str("host = ").unwrap_err();
        assert!(matches!(err, GlfsError::Config(_)));

        let err = VolumeConfig::from_toml_str("host = \"h\"\nvolume = \"\"").unwrap_err();
        assert!(err.to_string().contains("volume"), "{err}");
    }

    #[test]
    fn test_builder_validation() {
        assert!(VolumeConfig::builder("", "test").build().is_err());
        assert!(VolumeConfig::builder("localhost", "").build().is_err());
        assert!(VolumeConfig::builder("localhost", "test").port(0).build().is_err());
        assert!(VolumeConfig::builder("localhost", "test").transport("udp").build().is_err());

        let config = VolumeConfig::builder("localhost", "test").transport("rdma").build().unwrap();
        assert_eq!(config.transport, "rdma");
    }

    #[test]
    fn test_from_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("volume.toml");
        std::fs::write(&path, "host = \"localhost\"\nvolume = \"test\"\n").unwrap();
        assert_eq!(VolumeConfig::from_toml_file(&path).unwrap().volume, "test");

        let missing = VolumeConfig::from_toml_file(dir.path().join("missing.toml"));
        assert!(matches!(missing, Err(GlfsError::Config(_))));
    }
}
