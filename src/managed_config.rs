use crate::error::{Error, Result};
use sha2::{Digest, Sha256};
use std::fmt;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

/// Called with the new contents after a config file was written. Returns whether the running
/// agent actually changed.
pub type ReloadFn = Box<dyn Fn(&[u8]) -> Result<bool> + Send + Sync>;

/// Reload callback for files nothing has to react to
pub fn noop_reload() -> ReloadFn {
    Box::new(|_| Ok(false))
}

/// Validator run against a remote config body before it is written
pub type ValidatorFn = Box<dyn Fn(&[u8]) -> bool + Send + Sync>;

pub fn noop_validator() -> ValidatorFn {
    Box::new(|_| true)
}

/// An on-disk config file and the SHA-256 of its last read contents.
///
/// A missing file that is not `required` hashes as an empty file.
pub struct ManagedConfig {
    path: PathBuf,
    reload: ReloadFn,
    current_hash: Vec<u8>,
    required: bool,
}

impl fmt::Debug for ManagedConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedConfig")
            .field("path", &self.path)
            .field("current_hash", &hex::encode(&self.current_hash))
            .field("required", &self.required)
            .finish()
    }
}

impl ManagedConfig {
    /// Tracks a file that must exist; fails when it cannot be read
    pub fn new<P: Into<PathBuf>>(path: P, reload: ReloadFn) -> Result<ManagedConfig> {
        Self::build(path.into(), reload, true)
    }

    /// Tracks a file that may not have been written yet
    pub fn optional<P: Into<PathBuf>>(path: P, reload: ReloadFn) -> Result<ManagedConfig> {
        Self::build(path.into(), reload, false)
    }

    fn build(path: PathBuf, reload: ReloadFn, required: bool) -> Result<ManagedConfig> {
        let mut config = ManagedConfig {
            path,
            reload,
            current_hash: Vec::new(),
            required,
        };
        config.compute_config_hash()?;
        Ok(config)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_required(&self) -> bool {
        self.required
    }

    /// Re-reads the file and stores its hash. The previous hash is kept when reading fails.
    pub fn compute_config_hash(&mut self) -> Result<()> {
        let contents = match std::fs::read(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound && !self.required => Vec::new(),
            Err(e) => {
                return Err(Error::ConfigFile {
                    name: self.path.display().to_string(),
                    source: e,
                })
            }
        };
        self.current_hash = Sha256::digest(&contents).to_vec();
        Ok(())
    }

    pub fn current_config_hash(&self) -> &[u8] {
        &self.current_hash
    }

    pub fn reload(&self, contents: &[u8]) -> Result<bool> {
        (self.reload)(contents)
    }
}

/// Writes `contents` to `path`, creating the file owner read/write only
pub(crate) fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(contents)?;
    file.flush()
}

/// A copy of a config file taken before it is replaced.
///
/// The copy lives next to the original as `<path>.rollback` and is removed when the guard drops.
pub struct Rollback {
    path: PathBuf,
    rollback_path: PathBuf,
}

/// Copies `path` aside so a failed reload can restore it
pub fn prep_rollback<P: AsRef<Path>>(path: P) -> Result<Rollback> {
    let path = path.as_ref().to_path_buf();
    let mut rollback_path = path.clone().into_os_string();
    rollback_path.push(".rollback");
    let rollback_path = PathBuf::from(rollback_path);

    std::fs::copy(&path, &rollback_path)?;
    Ok(Rollback {
        path,
        rollback_path,
    })
}

impl Rollback {
    /// Restores the original file contents
    pub fn rollback(&self) -> Result<()> {
        std::fs::copy(&self.rollback_path, &self.path)?;
        Ok(())
    }

    pub fn rollback_path(&self) -> &Path {
        &self.rollback_path
    }
}

impl Drop for Rollback {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.rollback_path) {
            log::warn!(
                "failed to cleanup rollback file path={} error={}",
                self.rollback_path.display(),
                e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn hash_tracks_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(&path, "hello world").unwrap();

        let mut config = ManagedConfig::new(&path, noop_reload()).unwrap();
        let first = config.current_config_hash().to_vec();
        assert_eq!(
            hex::encode(&first),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );

        config.compute_config_hash().unwrap();
        assert_eq!(config.current_config_hash(), first.as_slice());

        fs::write(&path, "hello there").unwrap();
        config.compute_config_hash().unwrap();
        assert_ne!(config.current_config_hash(), first.as_slice());
    }

    #[test]
    fn missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.yaml");
        assert!(ManagedConfig::new(&path, noop_reload()).is_err());

        let config = ManagedConfig::optional(&path, noop_reload()).unwrap();
        assert_eq!(
            config.current_config_hash(),
            Sha256::digest(b"").as_slice()
        );
    }

    #[test]
    fn failed_read_keeps_previous_hash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(&path, "a: 1").unwrap();
        let mut config = ManagedConfig::new(&path, noop_reload()).unwrap();
        let before = config.current_config_hash().to_vec();

        fs::remove_file(&path).unwrap();
        assert!(config.compute_config_hash().is_err());
        assert_eq!(config.current_config_hash(), before.as_slice());
    }

    #[test]
    fn reload_callback_is_invoked() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(&path, "a: 1").unwrap();
        let config = ManagedConfig::new(
            &path,
            Box::new(|contents| Ok(contents == b"a: 2".as_slice())),
        )
        .unwrap();
        assert!(config.reload(b"a: 2").unwrap());
        assert!(!config.reload(b"a: 1").unwrap());
    }

    #[test]
    fn rollback_restores_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("collector.yaml");
        fs::write(&path, "old").unwrap();

        let rollback_path = {
            let rollback = prep_rollback(&path).unwrap();
            fs::write(&path, "new").unwrap();
            rollback.rollback().unwrap();
            assert_eq!(fs::read_to_string(&path).unwrap(), "old");
            rollback.rollback_path().to_path_buf()
        };
        assert!(!rollback_path.exists());
        assert!(prep_rollback(dir.path().join("absent.yaml")).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn private_files_are_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secret.json");
        write_private(&path, b"{}").unwrap();
        write_private(&path, b"[]").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"[]");
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
