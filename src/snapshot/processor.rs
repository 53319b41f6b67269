use super::buffer::{LogBuffer, MetricBuffer, TraceBuffer};
use super::registry::RegistryHandle;
use crate::capability::{send_with_retry, CustomCapabilityHandler, RetryPolicy};
use crate::component::{self, ComponentId, Host};
use crate::error::{Error, Result};
use crate::gzip;
use crate::opamp::spec::CustomMessage;
use crate::telemetry::{Logs, Metrics, Traces};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

pub const SNAPSHOT_CAPABILITY: &str = "com.bindplane.snapshot";
pub const SNAPSHOT_REQUEST_TYPE: &str = "requestSnapshot";
pub const SNAPSHOT_REPORT_TYPE: &str = "reportSnapshot";

/// Number of batches kept per signal when no size is configured
pub const DEFAULT_BUFFER_SIZE: usize = 100;

/// Configuration of a snapshot processor.
///
/// Properties:
///
/// * `enabled`: when false the processor passes telemetry through without buffering it.
/// * `opamp`: id of the OpAMP extension that provides the custom capability registry.
/// * `buffer_size`: number of batches retained per signal.
/// * `retry`: bounds on waiting for the control channel while it reports a message pending.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    pub enabled: bool,
    pub opamp: ComponentId,
    pub buffer_size: usize,
    pub retry: RetryPolicy,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        SnapshotConfig {
            enabled: true,
            opamp: ComponentId::new("opamp"),
            buffer_size: DEFAULT_BUFFER_SIZE,
            retry: RetryPolicy::default(),
        }
    }
}

impl SnapshotConfig {
    pub fn validate(&self) -> Result<()> {
        if self.buffer_size == 0 {
            return Err(Error::InvalidConfig(
                "buffer_size must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineType {
    Logs,
    Metrics,
    Traces,
}

/// Body of a `requestSnapshot` custom message
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct SnapshotRequest {
    pub processor: ComponentId,
    pub pipeline_type: PipelineType,
    pub session_id: String,
    #[serde(default)]
    pub search_query: Option<String>,
    #[serde(default)]
    pub minimum_timestamp: Option<DateTime<Utc>>,
}

/// Body of a `reportSnapshot` custom message, before compression
#[derive(Debug, Serialize)]
pub struct SnapshotReport {
    pub session_id: String,
    pub telemetry_type: PipelineType,
    pub telemetry_payload: Box<RawValue>,
}

/// Inbound custom messages understood by the snapshot processor
#[derive(Debug, PartialEq)]
pub enum SnapshotMessage {
    Request(SnapshotRequest),
    Unknown(String),
}

impl SnapshotMessage {
    /// Parses a custom message. Request bodies are YAML, which also accepts JSON.
    pub fn parse(message: &CustomMessage) -> Result<SnapshotMessage> {
        match message.r#type.as_str() {
            SNAPSHOT_REQUEST_TYPE => Ok(SnapshotMessage::Request(serde_yaml::from_slice(
                &message.data,
            )?)),
            other => Ok(SnapshotMessage::Unknown(other.to_string())),
        }
    }
}

struct State {
    logs: LogBuffer,
    metrics: MetricBuffer,
    traces: TraceBuffer,
    handler: Option<Arc<dyn CustomCapabilityHandler>>,
    done: Option<watch::Sender<()>>,
    tasks: Vec<JoinHandle<()>>,
}

/// Tees telemetry into per-signal ring buffers and answers snapshot requests received on the
/// `com.bindplane.snapshot` capability.
///
/// One instance exists per component id; see [`super::ProcessorRegistry`]. It is shared by the
/// logs, metrics and traces pipelines that reference the same id, so `start` and `stop` only take
/// effect on their first call.
pub struct SnapshotProcessor {
    id: ComponentId,
    config: SnapshotConfig,
    state: Arc<Mutex<State>>,
    started: AtomicBool,
    stopped: AtomicBool,
    registry: Option<RegistryHandle>,
}

impl SnapshotProcessor {
    pub fn new(id: ComponentId, config: SnapshotConfig) -> SnapshotProcessor {
        let size = config.buffer_size;
        SnapshotProcessor {
            id,
            config,
            state: Arc::new(Mutex::new(State {
                logs: LogBuffer::new(size),
                metrics: MetricBuffer::new(size),
                traces: TraceBuffer::new(size),
                handler: None,
                done: None,
                tasks: Vec::new(),
            })),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            registry: None,
        }
    }

    pub(crate) fn with_registry(mut self, handle: RegistryHandle) -> SnapshotProcessor {
        self.registry = Some(handle);
        self
    }

    pub fn id(&self) -> &ComponentId {
        &self.id
    }

    pub fn config(&self) -> &SnapshotConfig {
        &self.config
    }

    /// Registers the snapshot capability with the host's OpAMP extension and spawns the
    /// listener task. Must be called from within a tokio runtime.
    pub fn start(&self, host: &dyn Host) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let registration = component::capability_registry(host, &self.config.opamp)
            .and_then(|registry| registry.register(SNAPSHOT_CAPABILITY))
            .map_err(|e| {
                self.started.store(false, Ordering::SeqCst);
                e
            })?;

        let (done_tx, done_rx) = watch::channel(());
        let listener = Listener {
            id: self.id.clone(),
            state: self.state.clone(),
            handler: registration.handler.clone(),
            retry: self.config.retry.clone(),
        };
        let task = tokio::spawn(listener.run(registration.messages, done_rx));

        let mut state = self.state.lock();
        state.handler = Some(registration.handler);
        state.done = Some(done_tx);
        state.tasks.push(task);
        log::debug!("snapshot processor started processor={}", self.id);
        Ok(())
    }

    pub fn process_logs(&self, logs: Logs) -> Logs {
        if self.config.enabled {
            self.state.lock().logs.add(logs.clone());
        }
        logs
    }

    pub fn process_metrics(&self, metrics: Metrics) -> Metrics {
        if self.config.enabled {
            self.state.lock().metrics.add(metrics.clone());
        }
        metrics
    }

    pub fn process_traces(&self, traces: Traces) -> Traces {
        if self.config.enabled {
            self.state.lock().traces.add(traces.clone());
        }
        traces
    }

    /// Removes the processor from its registry, unregisters the capability, signals the
    /// listener and waits up to `deadline` for it to exit.
    pub async fn stop(&self, deadline: Duration) -> Result<()> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if let Some(registry) = &self.registry {
            registry.deregister(&self.id, self);
        }

        let (handler, done, tasks) = {
            let mut state = self.state.lock();
            (
                state.handler.take(),
                state.done.take(),
                std::mem::take(&mut state.tasks),
            )
        };

        if let Some(handler) = handler {
            handler.unregister();
        }
        drop(done);

        match tokio::time::timeout(deadline, futures::future::join_all(tasks)).await {
            Ok(results) => {
                for e in results.into_iter().filter_map(|r| r.err()) {
                    log::error!("snapshot listener failed processor={} error={}", self.id, e);
                }
                log::debug!("snapshot processor stopped processor={}", self.id);
                Ok(())
            }
            Err(_) => Err(Error::ShutdownTimeout(self.id.to_string())),
        }
    }
}

struct Listener {
    id: ComponentId,
    state: Arc<Mutex<State>>,
    handler: Arc<dyn CustomCapabilityHandler>,
    retry: RetryPolicy,
}

impl Listener {
    async fn run(self, mut messages: mpsc::Receiver<CustomMessage>, mut done: watch::Receiver<()>) {
        loop {
            tokio::select! {
                _ = done.changed() => return,
                message = messages.recv() => match message {
                    Some(message) => self.handle(message).await,
                    None => return,
                },
            }
        }
    }

    async fn handle(&self, message: CustomMessage) {
        match SnapshotMessage::parse(&message) {
            Ok(SnapshotMessage::Request(request)) => {
                if request.processor != self.id {
                    return;
                }
                self.respond(request).await;
            }
            Ok(SnapshotMessage::Unknown(kind)) => {
                log::warn!(
                    "received message of unknown type processor={} message_type={}",
                    self.id,
                    kind
                );
            }
            Err(e) => {
                log::error!("got invalid snapshot request processor={} error={}", self.id, e);
            }
        }
    }

    async fn respond(&self, request: SnapshotRequest) {
        log::info!(
            "responding to snapshot request processor={} session={} pipeline={:?}",
            self.id,
            request.session_id,
            request.pipeline_type
        );

        let body = match self.build_report(&request) {
            Ok(body) => body,
            Err(e) => {
                log::error!(
                    "failed to build snapshot report processor={} session={} error={}",
                    self.id,
                    request.session_id,
                    e
                );
                return;
            }
        };

        match send_with_retry(
            self.handler.as_ref(),
            SNAPSHOT_REPORT_TYPE,
            &body,
            &self.retry,
        )
        .await
        {
            Ok(()) => log::debug!(
                "snapshot report scheduled processor={} session={}",
                self.id,
                request.session_id
            ),
            Err(e) => log::error!(
                "failed to send snapshot report processor={} session={} error={}",
                self.id,
                request.session_id,
                e
            ),
        }
    }

    fn build_report(&self, request: &SnapshotRequest) -> Result<Vec<u8>> {
        let query = request.search_query.as_deref();
        let min = request.minimum_timestamp.as_ref();
        let payload = {
            let state = self.state.lock();
            match request.pipeline_type {
                PipelineType::Logs => state.logs.construct_payload(query, min)?,
                PipelineType::Metrics => state.metrics.construct_payload(query, min)?,
                PipelineType::Traces => state.traces.construct_payload(query, min)?,
            }
        };

        let report = SnapshotReport {
            session_id: request.session_id.clone(),
            telemetry_type: request.pipeline_type,
            telemetry_payload: RawValue::from_string(String::from_utf8_lossy(&payload).into_owned())?,
        };
        gzip::compress(&serde_json::to_vec(&report)?)
    }
}
