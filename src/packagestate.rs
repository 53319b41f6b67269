use crate::error::{Error, Result};
use crate::managed_config::write_private;
use crate::opamp::spec::{PackageStatus, PackageStatuses};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// File name of the persisted package statuses inside the install directory
pub const DEFAULT_FILE_NAME: &str = "package_statuses.json";

/// Name of the agent's own package
pub const MAIN_PACKAGE_NAME: &str = "observiq-otel-collector";

/// Byte fields are stored base64 encoded
mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            Some(encoded) => STANDARD.decode(encoded).map_err(serde::de::Error::custom),
            None => Ok(Vec::new()),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PackageState {
    pub name: String,
    pub agent_version: String,
    #[serde(with = "base64_bytes", default)]
    pub agent_hash: Vec<u8>,
    pub server_version: String,
    #[serde(with = "base64_bytes", default)]
    pub server_hash: Vec<u8>,
    pub status: i32,
    pub error_message: String,
}

/// On-disk form of [`PackageStatuses`]
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PackageStates {
    #[serde(with = "base64_bytes", default)]
    pub all_packages_hash: Vec<u8>,
    #[serde(default)]
    pub all_error_message: String,
    #[serde(default)]
    pub package_states: HashMap<String, PackageState>,
}

pub fn package_statuses_to_states(statuses: &PackageStatuses) -> PackageStates {
    PackageStates {
        all_packages_hash: statuses.server_provided_all_packages_hash.clone(),
        all_error_message: statuses.error_message.clone(),
        package_states: statuses
            .packages
            .iter()
            .map(|(name, status)| {
                (
                    name.clone(),
                    PackageState {
                        name: status.name.clone(),
                        agent_version: status.agent_has_version.clone(),
                        agent_hash: status.agent_has_hash.clone(),
                        server_version: status.server_offered_version.clone(),
                        server_hash: status.server_offered_hash.clone(),
                        status: status.status,
                        error_message: status.error_message.clone(),
                    },
                )
            })
            .collect(),
    }
}

pub fn package_states_to_statuses(states: PackageStates) -> PackageStatuses {
    PackageStatuses {
        server_provided_all_packages_hash: states.all_packages_hash,
        error_message: states.all_error_message,
        packages: states
            .package_states
            .into_iter()
            .map(|(name, state)| {
                (
                    name,
                    PackageStatus {
                        name: state.name,
                        agent_has_version: state.agent_version,
                        agent_has_hash: state.agent_hash,
                        server_offered_version: state.server_version,
                        server_offered_hash: state.server_hash,
                        status: state.status,
                        error_message: state.error_message,
                    },
                )
            })
            .collect(),
    }
}

/// Persists [`PackageStatuses`] to a JSON file so an install in progress survives a restart.
///
/// Every save replaces the whole file; a missing or unreadable file means no prior history.
#[derive(Clone, Debug)]
pub struct PackagesStateManager {
    json_path: PathBuf,
}

impl PackagesStateManager {
    pub fn new<P: Into<PathBuf>>(json_path: P) -> PackagesStateManager {
        PackagesStateManager {
            json_path: json_path.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.json_path
    }

    pub fn load_statuses(&self) -> Result<PackageStatuses> {
        log::debug!("loading package statuses path={}", self.json_path.display());
        let data = std::fs::read(&self.json_path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                log::debug!("package statuses json doesn't exist");
            }
            Error::PackageState(format!("failed to read package statuses json: {}", e))
        })?;
        let states: PackageStates = serde_json::from_slice(&data).map_err(|e| {
            Error::PackageState(format!("failed to unmarshal package statuses: {}", e))
        })?;
        Ok(package_states_to_statuses(states))
    }

    pub fn save_statuses(&self, statuses: &PackageStatuses) -> Result<()> {
        log::debug!("saving package statuses path={}", self.json_path.display());

        // a stale file is worse than none
        if let Err(e) = std::fs::remove_file(&self.json_path) {
            log::debug!("failed to delete package statuses json error={}", e);
        }

        let data = serde_json::to_vec(&package_statuses_to_states(statuses)).map_err(|e| {
            Error::PackageState(format!("failed to marshal package statuses: {}", e))
        })?;
        write_private(&self.json_path, &data).map_err(|e| {
            Error::PackageState(format!("failed to write package statuses json: {}", e))
        })
    }
}
