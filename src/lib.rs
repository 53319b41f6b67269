//! # OpAMP Agent Components
//!
//! Building blocks for an OpAMP managed telemetry agent: remote configuration, package state,
//! telemetry snapshots and log anomaly detection.
//!
//! The components plug into a host that owns the pipeline and the OpAMP connection. At a high
//! level the crate provides:
//!
//! * Remote configuration: tracked config files with content hashes, an effective config
//!   composed from them and reconciliation against configs pushed by the server
//! * Package installation state persisted across restarts, plus download and verification of
//!   offered package archives (feature `http`)
//! * Custom capability messaging with explicit backpressure between components and the control
//!   plane
//! * Snapshot processors that tee logs, metrics and traces into bounded ring buffers and export a
//!   filtered, gzip compressed view on request
//! * Log anomaly processors that watch the log rate and serve detected spikes and drops on request
//!
//! ## Not supported
//! The following are left to the embedding agent
//!
//! * The OpAMP transport itself (HTTP/Websocket framing, handshakes)
//! * Enforcement of package signatures
//! * The pipeline execution engine
//! * Conversion between telemetry wire formats
//!
//! # Integrating
//!
//! ```toml
//! otel-opamp-agent = { version = "0.1.0", features = ["http"] }
//! ```
//!
//! The connection invokes the agent through the [`agent::AgentCallbacks`] trait
//!
//! ```ignore
//! pub trait AgentCallbacks: Send + Sync {
//!     fn effective_config(&self) -> Result<EffectiveConfig>;
//!     fn on_connect(&self) -> Option<AgentToServer>;
//!     fn on_connect_failed(&self, error: &str);
//!     fn on_remote_config(&self, remote: &AgentRemoteConfig) -> AgentToServer;
//!     fn on_packages_available(&self, available: &PackagesAvailable) -> Result<AgentToServer>;
//! }
//! ```
//!
//! Wiring up an agent looks like so:
//!
//! ```ignore
//! let config = config::parse_config("manager.yaml")?;
//! let mut manager = AgentConfigManager::new("/opt/agent");
//! manager.add_config(COLLECTOR_CONFIG_NAME, Path::new("/opt/agent/collector.yaml"), noop_validator())?;
//!
//! let (agent, mut outbox) = Agent::new(AgentSettings {
//!     identity: Identity::new(&config, env!("CARGO_PKG_VERSION")),
//!     config_manager: Box::new(manager),
//!     packages: PackagesStateManager::new("/opt/agent/package_statuses.json"),
//!     files: Arc::new(HttpDownloadableFileManager::new("/opt/agent/tmp")),
//! });
//!
//! // Reports produced in the background, e.g. a failed package download
//! while let Some(report) = outbox.recv().await {
//!     // hand over to the connection
//! }
//! ```
//!
//! # Under the hood
//!
//! ## Custom capabilities
//!
//! Snapshot and anomaly processors talk to the control plane through a
//! [`capability::CustomCapabilityRegistry`] found on a host extension. A send either goes out,
//! fails, or reports that the previous message on the capability is still in flight; the sender
//! then waits for it to flush and tries again ([`capability::send_with_retry`]). The retry loop
//! is unbounded unless a [`capability::RetryPolicy`] caps it, so a stalled connection blocks the
//! responding task.
//!
//! [`capability::LocalCapabilityRegistry`] is an in-process registry for embedders without a
//! network transport and for tests.
//!
//! ## Concurrency
//!
//! Every processor keeps its mutable state behind a single lock shared by the consume path and
//! its background tasks. Background tasks exit on a done signal; `stop` waits for them up to a
//! caller supplied deadline.
//!
//! ## Logging
//!
//! All components log through the `log` facade with inline `key=value` fields.
//! [`logging::init`] installs `simple_logger` for binaries that have no logger of their own.
//!

pub mod agent;
pub mod anomaly;
pub mod capability;
pub mod component;
pub mod config;
pub mod config_manager;
pub mod download;
pub mod error;
pub mod gzip;
pub mod identity;
pub mod logging;
pub mod managed_config;
pub mod opamp;
pub mod packagestate;
pub mod snapshot;
pub mod telemetry;

pub use error::{Error, Result};
