use crate::config::Config;
use crate::error::{Error, Result};
use crate::managed_config::{noop_reload, write_private, ManagedConfig, ValidatorFn};
use crate::opamp::determine_content_type;
use crate::opamp::spec::{AgentConfigFile, AgentConfigMap, AgentRemoteConfig, EffectiveConfig};
use serde_yaml::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

pub const COLLECTOR_CONFIG_NAME: &str = "collector.yaml";
pub const MANAGER_CONFIG_NAME: &str = "manager.yaml";
pub const LOGGING_CONFIG_NAME: &str = "logging.yaml";

/// Manager config keys the server is allowed to change
const UPDATABLE_MANAGER_FIELDS: [&str; 4] = [
    "agent_name",
    "labels",
    "measurements_interval",
    "extra_measurements_attributes",
];

/// Result of applying a remote config
#[derive(Clone, Debug, PartialEq)]
pub struct AppliedConfig {
    pub effective_config: EffectiveConfig,
    pub changed: bool,
}

/// Tracks the agent's config files and reconciles them against remote configs.
pub trait ConfigManager: Send {
    /// Tracks the file at `path` under `name`. Tracking an existing name replaces it.
    fn add_config(&mut self, name: &str, path: &Path, validator: ValidatorFn) -> Result<()>;

    /// Reads every tracked file fresh from disk
    fn compose_effective_config(&self) -> Result<EffectiveConfig>;

    /// Writes the files of `remote` that differ from disk and reloads them
    fn apply_config_changes(&mut self, remote: &AgentRemoteConfig) -> Result<AppliedConfig>;
}

struct Tracked {
    config: ManagedConfig,
    validator: ValidatorFn,
}

/// File backed [`ConfigManager`].
///
/// Remote files that are neither tracked nor allowed with [`AgentConfigManager::allow_config`]
/// are skipped. An allowed but untracked file is written into `base_dir` and tracked from then on.
pub struct AgentConfigManager {
    base_dir: PathBuf,
    configs: BTreeMap<String, Tracked>,
    acceptable: HashSet<String>,
}

impl AgentConfigManager {
    pub fn new<P: Into<PathBuf>>(base_dir: P) -> AgentConfigManager {
        let acceptable = [COLLECTOR_CONFIG_NAME, MANAGER_CONFIG_NAME, LOGGING_CONFIG_NAME]
            .iter()
            .map(|name| name.to_string())
            .collect();
        AgentConfigManager {
            base_dir: base_dir.into(),
            configs: BTreeMap::new(),
            acceptable,
        }
    }

    /// Tracks `config` under `name`, reloading it through its own callback on change
    pub fn add_managed_config(&mut self, name: &str, config: ManagedConfig, validator: ValidatorFn) {
        self.configs
            .insert(name.to_string(), Tracked { config, validator });
    }

    /// Lets the server create `name` even though it is not tracked yet
    pub fn allow_config(&mut self, name: &str) {
        self.acceptable.insert(name.to_string());
    }

    pub fn is_acceptable(&self, name: &str) -> bool {
        self.configs.contains_key(name) || self.acceptable.contains(name)
    }

    pub fn current_config_hash(&self, name: &str) -> Option<&[u8]> {
        self.configs
            .get(name)
            .map(|tracked| tracked.config.current_config_hash())
    }

    fn add_untracked(&mut self, name: &str, body: &[u8]) -> Result<()> {
        if !check_content_type(name, body) || !is_plain_file_name(name) {
            return Err(Error::Validation(name.to_string()));
        }
        let path = self.base_dir.join(name);
        write_private(&path, body).map_err(|e| Error::ConfigFile {
            name: name.to_string(),
            source: e,
        })?;
        let config = ManagedConfig::new(&path, noop_reload())?;
        self.add_managed_config(name, config, crate::managed_config::noop_validator());
        Ok(())
    }

    fn update_tracked(&mut self, name: &str, body: &[u8]) -> Result<()> {
        let tracked = match self.configs.get_mut(name) {
            Some(tracked) => tracked,
            None => return Ok(()),
        };

        let contents = if name == MANAGER_CONFIG_NAME {
            let current = std::fs::read(tracked.config.path()).map_err(|e| Error::ConfigFile {
                name: name.to_string(),
                source: e,
            })?;
            merge_manager_config(&current, body)?
        } else {
            body.to_vec()
        };

        if !check_content_type(name, &contents) || !(tracked.validator)(&contents) {
            return Err(Error::Validation(name.to_string()));
        }
        write_private(tracked.config.path(), &contents).map_err(|e| Error::ConfigFile {
            name: name.to_string(),
            source: e,
        })?;

        let reloaded = tracked.config.reload(&contents);
        tracked.config.compute_config_hash()?;
        match reloaded {
            Ok(restarted) => {
                log::debug!("config reloaded config={} changed={}", name, restarted);
                Ok(())
            }
            Err(e) => Err(Error::Reload {
                name: name.to_string(),
                reason: e.to_string(),
            }),
        }
    }
}

impl ConfigManager for AgentConfigManager {
    fn add_config(&mut self, name: &str, path: &Path, validator: ValidatorFn) -> Result<()> {
        let config = ManagedConfig::new(path, noop_reload())?;
        self.add_managed_config(name, config, validator);
        Ok(())
    }

    fn compose_effective_config(&self) -> Result<EffectiveConfig> {
        let mut config_map = HashMap::with_capacity(self.configs.len());
        let mut hasher = Sha256::new();

        // BTreeMap iteration keeps the hash input in ascending name order
        for (name, tracked) in &self.configs {
            let path = tracked.config.path();
            let body = match std::fs::read(path) {
                Ok(body) => body,
                Err(e)
                    if e.kind() == std::io::ErrorKind::NotFound
                        && !tracked.config.is_required() =>
                {
                    continue
                }
                Err(e) => {
                    return Err(Error::ConfigFile {
                        name: name.clone(),
                        source: e,
                    })
                }
            };
            hasher.update(&body);
            config_map.insert(
                name.clone(),
                AgentConfigFile {
                    body,
                    content_type: determine_content_type(&path.to_string_lossy()).to_string(),
                },
            );
        }

        Ok(EffectiveConfig {
            hash: hasher.finalize().to_vec(),
            config_map: Some(AgentConfigMap { config_map }),
        })
    }

    fn apply_config_changes(&mut self, remote: &AgentRemoteConfig) -> Result<AppliedConfig> {
        let effective_config = self.compose_effective_config()?;
        if remote.config_hash == effective_config.hash {
            return Ok(AppliedConfig {
                effective_config,
                changed: false,
            });
        }

        let current = effective_config
            .config_map
            .as_ref()
            .map(|map| &map.config_map);
        let remote_files = match &remote.config {
            Some(map) => &map.config_map,
            None => {
                return Ok(AppliedConfig {
                    effective_config,
                    changed: false,
                })
            }
        };

        let mut names: Vec<&String> = remote_files.keys().collect();
        names.sort();

        let mut changed = false;
        for name in names {
            let body = &remote_files[name].body;
            if !self.is_acceptable(name) {
                log::info!("unsupported config received, skipping config={}", name);
                continue;
            }

            if !self.configs.contains_key(name.as_str()) {
                log::info!("untracked config found config={}", name);
                self.add_untracked(name, body)?;
                changed = true;
                continue;
            }

            let unchanged = current
                .and_then(|files| files.get(name.as_str()))
                .map(|file| &file.body == body)
                .unwrap_or(false);
            if unchanged {
                continue;
            }

            log::info!("change made to config file, updating config={}", name);
            changed = true;
            self.update_tracked(name, body)?;
        }

        let effective_config = if changed {
            self.compose_effective_config()?
        } else {
            effective_config
        };
        Ok(AppliedConfig {
            effective_config,
            changed,
        })
    }
}

/// Takes the updatable fields from `remote` and everything else from `current`.
///
/// An updatable field missing from `remote` is removed. The result must still be a valid
/// manager config.
pub fn merge_manager_config(current: &[u8], remote: &[u8]) -> Result<Vec<u8>> {
    let invalid = || Error::Validation(MANAGER_CONFIG_NAME.to_string());

    let current: Value = serde_yaml::from_slice(current)?;
    let remote: Value = serde_yaml::from_slice(remote).map_err(|_| invalid())?;
    let mut current = match current {
        Value::Mapping(map) => map,
        Value::Null => serde_yaml::Mapping::new(),
        _ => return Err(invalid()),
    };
    let remote = match remote {
        Value::Mapping(map) => map,
        Value::Null => serde_yaml::Mapping::new(),
        _ => return Err(invalid()),
    };

    for field in UPDATABLE_MANAGER_FIELDS {
        let key = Value::String(field.to_string());
        match remote.get(&key) {
            Some(value) => {
                current.insert(key, value.clone());
            }
            None => {
                current.remove(&key);
            }
        }
    }

    let merged = serde_yaml::to_string(&Value::Mapping(current))?;
    serde_yaml::from_str::<Config>(&merged).map_err(|_| invalid())?;
    Ok(merged.into_bytes())
}

/// Structural check of a config body by the content type of its name
fn check_content_type(name: &str, body: &[u8]) -> bool {
    match determine_content_type(name) {
        "text/yaml" => serde_yaml::from_slice::<Value>(body).is_ok(),
        "text/json" => serde_json::from_slice::<serde_json::Value>(body).is_ok(),
        _ => true,
    }
}

fn is_plain_file_name(name: &str) -> bool {
    let path = Path::new(name);
    path.file_name().map(|f| f == path.as_os_str()).unwrap_or(false)
}
