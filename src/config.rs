use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// TLS settings for the connection to the OpAMP server.
///
/// A CA file alone is allowed. When verification is enabled the key and certificate files must be
/// given together.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsConfig {
    #[serde(default)]
    pub insecure_skip_verify: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_file: Option<String>,
}

impl TlsConfig {
    fn validate(&self) -> Result<()> {
        if self.insecure_skip_verify {
            return Ok(());
        }
        if self.key_file.is_some() != self.cert_file.is_some() {
            return Err(Error::MissingTlsFiles);
        }

        let files = [
            ("key", &self.key_file),
            ("cert", &self.cert_file),
            ("ca", &self.ca_file),
        ];
        for (kind, file) in files {
            if let Some(path) = file {
                if !Path::new(path).exists() {
                    return Err(Error::InvalidTlsFile {
                        kind,
                        path: path.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

/// The agent's manager config: how to reach the OpAMP server and how the agent describes itself.
///
/// Only `agent_name`, `labels`, `measurements_interval` and `extra_measurements_attributes` may be
/// changed by the server, see [`Config::cmp_updatable_fields`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    pub endpoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_key: Option<String>,
    #[serde(default)]
    pub agent_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_config: Option<TlsConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
    #[serde(
        default,
        with = "humantime_serde",
        skip_serializing_if = "Duration::is_zero"
    )]
    pub measurements_interval: Duration,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub extra_measurements_attributes: HashMap<String, String>,
}

/// Reads and validates the manager config at `path`
pub fn parse_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let data = std::fs::read(path.as_ref()).map_err(Error::ConfigRead)?;
    let config: Config = serde_yaml::from_slice(&data).map_err(Error::ConfigParse)?;
    if let Some(tls) = &config.tls_config {
        tls.validate()?;
    }
    Ok(config)
}

impl Config {
    pub fn secret_key(&self) -> &str {
        self.secret_key.as_deref().unwrap_or("")
    }

    /// True when every server-updatable field is equal
    pub fn cmp_updatable_fields(&self, other: &Config) -> bool {
        self.agent_name == other.agent_name
            && self.labels == other.labels
            && self.measurements_interval == other.measurements_interval
            && self.extra_measurements_attributes == other.extra_measurements_attributes
    }

    /// Copies the server-updatable fields of `other` into this config
    pub fn apply_updatable_fields(&mut self, other: &Config) {
        self.agent_name = other.agent_name.clone();
        self.labels = other.labels.clone();
        self.measurements_interval = other.measurements_interval;
        self.extra_measurements_attributes = other.extra_measurements_attributes.clone();
    }

    pub fn endpoint_url(&self) -> Result<url::Url> {
        let url = url::Url::parse(&self.endpoint)
            .map_err(|e| Error::UnsupportedUrl(format!("{}: {}", self.endpoint, e)))?;
        match url.scheme() {
            "ws" | "wss" | "http" | "https" => Ok(url),
            _ => Err(Error::UnsupportedUrl(self.endpoint.clone())),
        }
    }
}
