use crate::component::ComponentId;
use std::path::PathBuf;

/// Convenience alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// The `Error` enum reports every failure surfaced by the components in this crate.
///
/// Configuration errors are returned from load/validate calls and are meant to fail fast.
/// Transient I/O and protocol errors are normally logged by the component that hit them and the
/// work is dropped; they only escape to the caller from direct API calls.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to read OpAmp config file: {0}")]
    ConfigRead(#[source] std::io::Error),

    #[error("failed to parse OpAmp config: {0}")]
    ConfigParse(#[source] serde_yaml::Error),

    #[error("must specify both Key and Certificate file")]
    MissingTlsFiles,

    #[error("failed to read TLS {kind} file: {path}")]
    InvalidTlsFile { kind: &'static str, path: String },

    #[error("unsupported URL: {0}")]
    UnsupportedUrl(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to validate config {0}")]
    Validation(String),

    #[error("error reading config file {name}: {source}")]
    ConfigFile {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("config {name} was written but failed to reload: {reason}")]
    Reload { name: String, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error("compression failure: {0}")]
    Compression(String),

    #[error("custom capability error: {0}")]
    Capability(String),

    #[error("gave up sending custom message after {attempts} attempts")]
    SendTimeout { attempts: u32 },

    #[error("opamp extension \"{0}\" does not exist")]
    ExtensionNotFound(ComponentId),

    #[error("extension \"{0}\" is not a custom message registry")]
    NotACapabilityRegistry(ComponentId),

    #[error("shutdown of {0} did not complete before the deadline")]
    ShutdownTimeout(String),

    #[error("package state: {0}")]
    PackageState(String),

    #[error("failed to download file: {0}")]
    Download(String),

    #[error("file hash did not match expected")]
    HashMismatch,

    #[error("archive path is tainted: {0:?}")]
    TaintedPath(PathBuf),

    #[error("failed to install logger: {0}")]
    Logger(String),
}

impl From<log::SetLoggerError> for Error {
    fn from(e: log::SetLoggerError) -> Self {
        Error::Logger(e.to_string())
    }
}

#[cfg(feature = "http")]
impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Download(e.to_string())
    }
}
