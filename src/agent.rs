use crate::config::Config;
use crate::config_manager::ConfigManager;
use crate::download::DownloadableFileManager;
use crate::error::{Error, Result};
use crate::identity::Identity;
use crate::opamp::spec::*;
use crate::packagestate::{PackagesStateManager, MAIN_PACKAGE_NAME};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Callbacks the control plane connection invokes on the agent.
///
/// A returned `AgentToServer` is a report the connection should send right away. Reports produced
/// later by background work are delivered through the receiver returned from [`Agent::new`].
pub trait AgentCallbacks: Send + Sync {
    /// The effective config to report, read fresh from disk
    fn effective_config(&self) -> Result<EffectiveConfig>;
    /// The connection to the server was established
    fn on_connect(&self) -> Option<AgentToServer>;
    /// The connection attempt failed with `error`
    fn on_connect_failed(&self, error: &str);
    /// The server deployed a new remote config
    fn on_remote_config(&self, remote: &AgentRemoteConfig) -> AgentToServer;
    /// The server offered packages for installation
    fn on_packages_available(&self, available: &PackagesAvailable) -> Result<AgentToServer>;
}

/// Everything an [`Agent`] is built from
pub struct AgentSettings {
    pub identity: Identity,
    pub config_manager: Box<dyn ConfigManager>,
    pub packages: PackagesStateManager,
    pub files: Arc<dyn DownloadableFileManager>,
}

struct Inner {
    version: String,
    identity: Mutex<Identity>,
    config_manager: Mutex<Box<dyn ConfigManager>>,
    packages: PackagesStateManager,
    files: Arc<dyn DownloadableFileManager>,
    sequence_num: AtomicU64,
    installing: AtomicBool,
    disconnecting: AtomicBool,
    reports: mpsc::UnboundedSender<AgentToServer>,
}

/// The agent side of OpAMP remote configuration and package installation.
#[derive(Clone)]
pub struct Agent {
    inner: Arc<Inner>,
}

impl Agent {
    pub fn new(settings: AgentSettings) -> (Agent, mpsc::UnboundedReceiver<AgentToServer>) {
        let (reports, outbox) = mpsc::unbounded_channel();
        let agent = Agent {
            inner: Arc::new(Inner {
                version: settings.identity.version.clone(),
                identity: Mutex::new(settings.identity),
                config_manager: Mutex::new(settings.config_manager),
                packages: settings.packages,
                files: settings.files,
                sequence_num: AtomicU64::new(0),
                installing: AtomicBool::new(false),
                disconnecting: AtomicBool::new(false),
                reports,
            }),
        };
        (agent, outbox)
    }

    pub fn version(&self) -> &str {
        &self.inner.version
    }

    pub fn agent_description(&self) -> AgentDescription {
        self.inner.identity.lock().to_agent_description()
    }

    /// Picks up a changed agent name or labels from the manager config
    pub fn update_identity(&self, config: &Config) {
        self.inner.identity.lock().update(config);
    }

    /// Connection failures while disconnecting do not fail an install in progress
    pub fn set_disconnecting(&self, disconnecting: bool) {
        self.inner
            .disconnecting
            .store(disconnecting, Ordering::SeqCst);
    }

    pub fn is_installing(&self) -> bool {
        self.inner.installing.load(Ordering::SeqCst)
    }

    /// The persisted package statuses, or the running main package as installed when nothing
    /// was persisted yet
    pub fn last_reported_statuses(&self) -> Result<PackageStatuses> {
        if !self.inner.packages.path().exists() {
            log::debug!("package statuses json doesn't exist");
            let mut packages = HashMap::new();
            packages.insert(
                MAIN_PACKAGE_NAME.to_string(),
                PackageStatus {
                    name: MAIN_PACKAGE_NAME.to_string(),
                    agent_has_version: self.inner.version.clone(),
                    status: PackageStatusEnum::Installed.into(),
                    ..Default::default()
                },
            );
            return Ok(PackageStatuses {
                packages,
                ..Default::default()
            });
        }
        self.inner.packages.load_statuses()
    }

    fn report(&self) -> AgentToServer {
        let (instance_uid, description) = {
            let identity = self.inner.identity.lock();
            (identity.agent_id.clone(), identity.to_agent_description())
        };
        AgentToServer {
            instance_uid,
            sequence_num: self.inner.sequence_num.fetch_add(1, Ordering::SeqCst),
            agent_description: Some(description),
            ..Default::default()
        }
    }

    fn package_report(&self, statuses: PackageStatuses) -> AgentToServer {
        AgentToServer {
            package_statuses: Some(statuses),
            ..self.report()
        }
    }

    /// Last statuses, only when they carry the main package
    fn verified_package_statuses(&self) -> Result<PackageStatuses> {
        let statuses = self.last_reported_statuses().map_err(|e| {
            Error::PackageState(format!(
                "failed to retrieve last reported package statuses: {}",
                e
            ))
        })?;
        if !statuses.packages.contains_key(MAIN_PACKAGE_NAME) {
            return Err(Error::PackageState(
                "failed to retrieve last reported package status for main package".to_string(),
            ));
        }
        Ok(statuses)
    }

    fn build_initial_status(
        &self,
        name: &str,
        available: &PackageAvailable,
        last: Option<&PackageStatus>,
    ) -> PackageStatus {
        if name != MAIN_PACKAGE_NAME {
            log::error!(
                "package update failed because it is not supported package={}",
                name
            );
            return PackageStatus {
                name: name.to_string(),
                server_offered_version: available.version.clone(),
                server_offered_hash: available.hash.clone(),
                status: PackageStatusEnum::InstallFailed.into(),
                error_message: "Package not supported".to_string(),
                ..Default::default()
            };
        }

        let version = &self.inner.version;
        let mut status = PackageStatus {
            name: name.to_string(),
            agent_has_version: version.clone(),
            server_offered_version: available.version.clone(),
            server_offered_hash: available.hash.clone(),
            status: PackageStatusEnum::Installed.into(),
            ..Default::default()
        };

        if *version == available.version {
            log::info!(
                "package update ignored because no new version offered package={}",
                name
            );
            status.agent_has_hash = available.hash.clone();
            return status;
        }

        if let Some(last) = last {
            if last.agent_has_version == *version {
                status.agent_has_hash = last.agent_has_hash.clone();
            } else {
                log::debug!(
                    "current version {} and last reported version {} differ package={}",
                    version,
                    last.agent_has_version,
                    name
                );
            }
        }

        if available.version.is_empty() {
            status.error_message =
                "Packaged update failed because no new version detected".to_string();
            status.set_status(PackageStatusEnum::InstallFailed);
        } else if available.file.is_none() {
            status.error_message =
                "Packaged update failed because no downloadable file detected".to_string();
            status.set_status(PackageStatusEnum::InstallFailed);
        } else {
            status.set_status(PackageStatusEnum::Installing);
        }
        if !status.error_message.is_empty() {
            log::info!("{} package={}", status.error_message, name);
        }
        status
    }

    /// Marks the main package failed, keeping the first error message, and persists the result.
    /// Returns a report when `send_now` is set.
    fn fail_install(
        &self,
        mut statuses: PackageStatuses,
        message: &str,
        send_now: bool,
    ) -> Option<AgentToServer> {
        let main = statuses.packages.get_mut(MAIN_PACKAGE_NAME)?;
        main.set_status(PackageStatusEnum::InstallFailed);
        if main.error_message.is_empty() {
            main.error_message = message.to_string();
        }
        log::error!(
            "package update failed package={} error={}",
            MAIN_PACKAGE_NAME,
            main.error_message
        );

        if let Err(e) = self.inner.packages.save_statuses(&statuses) {
            log::error!("failed to save failed install package statuses error={}", e);
        }
        send_now.then(|| self.package_report(statuses))
    }

    /// Fails the install only when the main package is still installing
    fn try_fail_install(&self, message: &str, send_now: bool) -> Option<AgentToServer> {
        let statuses = match self.verified_package_statuses() {
            Ok(statuses) => statuses,
            Err(e) => {
                log::error!("problem with package statuses error={}", e);
                return None;
            }
        };
        if statuses.packages[MAIN_PACKAGE_NAME].status() != PackageStatusEnum::Installing {
            return None;
        }
        self.fail_install(statuses, message, send_now)
    }

    fn finish_install(&self, mut statuses: PackageStatuses) -> Option<AgentToServer> {
        let main = statuses.packages.get_mut(MAIN_PACKAGE_NAME)?;
        main.set_status(PackageStatusEnum::Installed);
        main.agent_has_version = self.inner.version.clone();
        main.agent_has_hash = main.server_offered_hash.clone();
        log::info!(
            "package update was successful package={} all_packages_hash={}",
            MAIN_PACKAGE_NAME,
            hex::encode(&statuses.server_provided_all_packages_hash)
        );

        if let Err(e) = self.inner.packages.save_statuses(&statuses) {
            log::error!("failed to set last reported package statuses error={}", e);
        }
        Some(self.package_report(statuses))
    }

    fn start_install(&self, file: Option<DownloadableFile>) -> Option<AgentToServer> {
        let file = match file {
            Some(file) => file,
            None => return self.try_fail_install("No valid downloadable file found", true),
        };
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(e) => {
                return self.try_fail_install(&format!("Failed to start install: {}", e), true)
            }
        };

        self.inner.installing.store(true, Ordering::SeqCst);
        let agent = self.clone();
        runtime.spawn(async move {
            agent.install_from_file(file).await;
            agent.inner.installing.store(false, Ordering::SeqCst);
        });
        None
    }

    async fn install_from_file(&self, file: DownloadableFile) {
        match self.inner.files.fetch_and_extract_archive(&file).await {
            Ok(()) => log::info!(
                "package archive staged, waiting for updater package={}",
                MAIN_PACKAGE_NAME
            ),
            Err(e) => {
                self.inner.files.cleanup_artifacts();
                let message = format!(
                    "Failed to download and verify the supplied downloadable file: {}",
                    e
                );
                if let Some(report) = self.try_fail_install(&message, true) {
                    if self.inner.reports.send(report).is_err() {
                        log::warn!("report receiver dropped, failed install not reported");
                    }
                }
            }
        }
    }
}

impl AgentCallbacks for Agent {
    fn effective_config(&self) -> Result<EffectiveConfig> {
        log::debug!("compose effective config");
        self.inner.config_manager.lock().compose_effective_config()
    }

    fn on_connect(&self) -> Option<AgentToServer> {
        log::info!("successfully connected to server");

        let statuses = match self.verified_package_statuses() {
            Ok(statuses) => statuses,
            Err(e) => {
                log::error!("problem with package statuses error={}", e);
                return None;
            }
        };
        let main = &statuses.packages[MAIN_PACKAGE_NAME];
        if main.status() != PackageStatusEnum::Installing {
            return None;
        }

        // a fresh start in the middle of an install was most likely done by the updater
        if main.server_offered_version != self.inner.version {
            let message = format!(
                "Failed because of collector version mismatch: expected {}, actual {}",
                main.server_offered_version, self.inner.version
            );
            return self.fail_install(statuses, &message, false);
        }
        self.finish_install(statuses)
    }

    fn on_connect_failed(&self, error: &str) {
        log::error!("failed to connect to server error={}", error);
        if !self.inner.disconnecting.load(Ordering::SeqCst) {
            self.try_fail_install(&format!("Failed to connect to OpAMP Server: {}", error), false);
        }
    }

    fn on_remote_config(&self, remote: &AgentRemoteConfig) -> AgentToServer {
        log::debug!("remote config handler");
        let applied = self
            .inner
            .config_manager
            .lock()
            .apply_config_changes(remote);

        let mut status = crate::opamp::defaults::remote_config_status(&remote.config_hash);
        let effective_config = match applied {
            Ok(applied) => applied.changed.then_some(applied.effective_config),
            Err(e) => {
                log::error!("failed applying remote config error={}", e);
                status.set_status(RemoteConfigStatuses::Failed);
                status.error_message = format!("Failed to apply config changes: {}", e);
                None
            }
        };

        AgentToServer {
            remote_config_status: Some(status),
            effective_config,
            ..self.report()
        }
    }

    fn on_packages_available(&self, available: &PackagesAvailable) -> Result<AgentToServer> {
        log::debug!("packages available handler");
        let mut statuses = PackageStatuses {
            server_provided_all_packages_hash: available.all_packages_hash.clone(),
            ..Default::default()
        };

        if self.is_installing() {
            log::warn!(
                "not starting new package update as already installing new packages all_packages_hash={}",
                hex::encode(&available.all_packages_hash)
            );
            statuses.error_message = "Already installing new packages".to_string();
            return Ok(self.package_report(statuses));
        }

        let last = match self.verified_package_statuses() {
            Ok(last) => last.packages,
            Err(e) => {
                log::warn!(
                    "problem with package statuses on starting install error={}",
                    e
                );
                HashMap::new()
            }
        };

        for (name, package) in &available.packages {
            let status = self.build_initial_status(name, package, last.get(name));
            statuses.packages.insert(name.clone(), status);
        }

        self.inner.packages.save_statuses(&statuses)?;

        let installing = statuses
            .packages
            .get(MAIN_PACKAGE_NAME)
            .map(|main| main.status() == PackageStatusEnum::Installing)
            .unwrap_or(false);
        if installing {
            log::info!(
                "package update started package={} all_packages_hash={}",
                MAIN_PACKAGE_NAME,
                hex::encode(&available.all_packages_hash)
            );
            let file = available
                .packages
                .get(MAIN_PACKAGE_NAME)
                .and_then(|package| package.file.clone());
            if let Some(report) = self.start_install(file) {
                return Ok(report);
            }
        }
        Ok(self.package_report(statuses))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config_manager::{AgentConfigManager, COLLECTOR_CONFIG_NAME};
    use crate::managed_config::noop_validator;
    use crate::packagestate::DEFAULT_FILE_NAME;
    use async_trait::async_trait;
    use std::path::Path;
    use tokio::sync::Notify;

    #[derive(Default)]
    struct FakeFiles {
        fail: bool,
        fetched: Mutex<Vec<String>>,
        cleaned: AtomicBool,
        release: Notify,
    }

    #[async_trait]
    impl DownloadableFileManager for FakeFiles {
        async fn fetch_and_extract_archive(&self, file: &DownloadableFile) -> Result<()> {
            self.fetched.lock().push(file.download_url.clone());
            self.release.notified().await;
            if self.fail {
                return Err(Error::HashMismatch);
            }
            Ok(())
        }

        fn cleanup_artifacts(&self) {
            self.cleaned.store(true, Ordering::SeqCst);
        }
    }

    fn identity(version: &str) -> Identity {
        Identity {
            agent_id: "agent-1".to_string(),
            agent_name: None,
            service_name: crate::identity::SERVICE_NAME.to_string(),
            version: version.to_string(),
            labels: None,
            os_arch: "x86_64".to_string(),
            os_details: "".to_string(),
            os_family: "linux".to_string(),
            hostname: "host".to_string(),
        }
    }

    fn agent(dir: &Path, files: Arc<FakeFiles>) -> (Agent, mpsc::UnboundedReceiver<AgentToServer>) {
        std::fs::write(dir.join(COLLECTOR_CONFIG_NAME), "receivers: {}\n").unwrap();
        let mut manager = AgentConfigManager::new(dir);
        manager
            .add_config(
                COLLECTOR_CONFIG_NAME,
                &dir.join(COLLECTOR_CONFIG_NAME),
                noop_validator(),
            )
            .unwrap();
        Agent::new(AgentSettings {
            identity: identity("1.0.0"),
            config_manager: Box::new(manager),
            packages: PackagesStateManager::new(dir.join(DEFAULT_FILE_NAME)),
            files,
        })
    }

    fn offer(version: &str, with_file: bool) -> PackagesAvailable {
        let mut packages = HashMap::new();
        packages.insert(
            MAIN_PACKAGE_NAME.to_string(),
            PackageAvailable {
                version: version.to_string(),
                hash: vec![7, 7],
                file: with_file.then(|| DownloadableFile {
                    download_url: "https://example.com/agent.tar.gz".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            },
        );
        packages.insert(
            "plugins".to_string(),
            PackageAvailable {
                version: "0.1".to_string(),
                ..Default::default()
            },
        );
        PackagesAvailable {
            packages,
            all_packages_hash: vec![1],
        }
    }

    #[test]
    fn barebones_statuses_without_file() {
        let dir = tempfile::tempdir().unwrap();
        let (agent, _outbox) = agent(dir.path(), Arc::default());
        let statuses = agent.last_reported_statuses().unwrap();
        let main = &statuses.packages[MAIN_PACKAGE_NAME];
        assert_eq!(main.status(), PackageStatusEnum::Installed);
        assert_eq!(main.agent_has_version, "1.0.0");
    }

    #[test]
    fn remote_config_reports_status_and_effective_config() {
        let dir = tempfile::tempdir().unwrap();
        let (agent, _outbox) = agent(dir.path(), Arc::default());

        let mut config_map = HashMap::new();
        config_map.insert(
            COLLECTOR_CONFIG_NAME.to_string(),
            AgentConfigFile {
                body: b"receivers: {otlp: {}}\n".to_vec(),
                content_type: "text/yaml".to_string(),
            },
        );
        let remote = AgentRemoteConfig {
            config: Some(AgentConfigMap { config_map }),
            config_hash: vec![42],
        };
        let report = agent.on_remote_config(&remote);
        let status = report.remote_config_status.unwrap();
        assert_eq!(status.status(), RemoteConfigStatuses::Applied);
        assert_eq!(status.last_remote_config_hash, vec![42]);
        assert_eq!(
            report.effective_config.unwrap(),
            agent.effective_config().unwrap()
        );

        // unchanged the second time
        let report = agent.on_remote_config(&remote);
        assert!(report.effective_config.is_none());
        assert!(report.sequence_num > 0);
    }

    #[test]
    fn remote_config_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let (agent, _outbox) = agent(dir.path(), Arc::default());
        let mut config_map = HashMap::new();
        config_map.insert(
            COLLECTOR_CONFIG_NAME.to_string(),
            AgentConfigFile {
                body: b"receivers: [".to_vec(),
                content_type: "text/yaml".to_string(),
            },
        );
        let report = agent.on_remote_config(&AgentRemoteConfig {
            config: Some(AgentConfigMap { config_map }),
            config_hash: vec![1],
        });
        let status = report.remote_config_status.unwrap();
        assert_eq!(status.status(), RemoteConfigStatuses::Failed);
        assert!(status
            .error_message
            .starts_with("Failed to apply config changes: "));
        assert!(report.effective_config.is_none());
    }

    #[test]
    fn same_version_is_already_installed() {
        let dir = tempfile::tempdir().unwrap();
        let files = Arc::new(FakeFiles::default());
        let (agent, _outbox) = agent(dir.path(), files.clone());

        let report = agent.on_packages_available(&offer("1.0.0", true)).unwrap();
        let statuses = report.package_statuses.unwrap();
        let main = &statuses.packages[MAIN_PACKAGE_NAME];
        assert_eq!(main.status(), PackageStatusEnum::Installed);
        assert_eq!(main.agent_has_hash, vec![7, 7]);
        let plugins = &statuses.packages["plugins"];
        assert_eq!(plugins.status(), PackageStatusEnum::InstallFailed);
        assert_eq!(plugins.error_message, "Package not supported");
        assert!(files.fetched.lock().is_empty());
        assert_eq!(agent.last_reported_statuses().unwrap(), statuses);
    }

    #[test]
    fn offer_without_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let (agent, _outbox) = agent(dir.path(), Arc::default());
        let report = agent.on_packages_available(&offer("2.0.0", false)).unwrap();
        let main = &report.package_statuses.unwrap().packages[MAIN_PACKAGE_NAME];
        assert_eq!(main.status(), PackageStatusEnum::InstallFailed);
        assert!(!agent.is_installing());
    }

    #[tokio::test]
    async fn failed_download_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let files = Arc::new(FakeFiles {
            fail: true,
            ..Default::default()
        });
        let (agent, mut outbox) = agent(dir.path(), files.clone());

        let report = agent.on_packages_available(&offer("2.0.0", true)).unwrap();
        let main = &report.package_statuses.unwrap().packages[MAIN_PACKAGE_NAME];
        assert_eq!(main.status(), PackageStatusEnum::Installing);
        assert!(agent.is_installing());

        let busy = agent.on_packages_available(&offer("3.0.0", true)).unwrap();
        assert_eq!(
            busy.package_statuses.unwrap().error_message,
            "Already installing new packages"
        );

        files.release.notify_one();
        let failed = outbox.recv().await.unwrap();
        let main = &failed.package_statuses.unwrap().packages[MAIN_PACKAGE_NAME];
        assert_eq!(main.status(), PackageStatusEnum::InstallFailed);
        assert!(main
            .error_message
            .starts_with("Failed to download and verify the supplied downloadable file"));
        assert!(files.cleaned.load(Ordering::SeqCst));
        assert_eq!(
            agent.last_reported_statuses().unwrap().packages[MAIN_PACKAGE_NAME].status(),
            PackageStatusEnum::InstallFailed
        );
    }

    #[test]
    fn connect_after_update_resolves_install() {
        let dir = tempfile::tempdir().unwrap();
        let (old, _outbox) = agent(dir.path(), Arc::default());
        let mut statuses = old.last_reported_statuses().unwrap();
        {
            let main = statuses.packages.get_mut(MAIN_PACKAGE_NAME).unwrap();
            main.set_status(PackageStatusEnum::Installing);
            main.server_offered_version = "1.0.0".to_string();
            main.server_offered_hash = vec![5];
        }
        PackagesStateManager::new(dir.path().join(DEFAULT_FILE_NAME))
            .save_statuses(&statuses)
            .unwrap();

        let report = old.on_connect().unwrap();
        let main = &report.package_statuses.unwrap().packages[MAIN_PACKAGE_NAME];
        assert_eq!(main.status(), PackageStatusEnum::Installed);
        assert_eq!(main.agent_has_hash, vec![5]);
        assert!(old.on_connect().is_none());
    }

    #[test]
    fn connect_with_version_mismatch_fails_install() {
        let dir = tempfile::tempdir().unwrap();
        let (agent, _outbox) = agent(dir.path(), Arc::default());
        let mut statuses = agent.last_reported_statuses().unwrap();
        {
            let main = statuses.packages.get_mut(MAIN_PACKAGE_NAME).unwrap();
            main.set_status(PackageStatusEnum::Installing);
            main.server_offered_version = "2.0.0".to_string();
        }
        PackagesStateManager::new(dir.path().join(DEFAULT_FILE_NAME))
            .save_statuses(&statuses)
            .unwrap();

        assert!(agent.on_connect().is_none());
        let main = agent.last_reported_statuses().unwrap().packages[MAIN_PACKAGE_NAME].clone();
        assert_eq!(main.status(), PackageStatusEnum::InstallFailed);
        assert_eq!(
            main.error_message,
            "Failed because of collector version mismatch: expected 2.0.0, actual 1.0.0"
        );
    }

    #[test]
    fn connect_failure_while_disconnecting_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let (agent, _outbox) = agent(dir.path(), Arc::default());
        let mut statuses = agent.last_reported_statuses().unwrap();
        statuses
            .packages
            .get_mut(MAIN_PACKAGE_NAME)
            .unwrap()
            .set_status(PackageStatusEnum::Installing);
        PackagesStateManager::new(dir.path().join(DEFAULT_FILE_NAME))
            .save_statuses(&statuses)
            .unwrap();

        agent.set_disconnecting(true);
        agent.on_connect_failed("connection reset");
        assert_eq!(
            agent.last_reported_statuses().unwrap().packages[MAIN_PACKAGE_NAME].status(),
            PackageStatusEnum::Installing
        );

        agent.set_disconnecting(false);
        agent.on_connect_failed("connection reset");
        let main = agent.last_reported_statuses().unwrap().packages[MAIN_PACKAGE_NAME].clone();
        assert_eq!(main.status(), PackageStatusEnum::InstallFailed);
        assert_eq!(
            main.error_message,
            "Failed to connect to OpAMP Server: connection reset"
        );
    }
}
