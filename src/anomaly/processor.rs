use super::config::{AnomalyConfig, Strategy};
use super::detector::{AnomalyDetector, AnomalyStat, StatisticalDetector, WindowDeviationDetector};
use crate::capability::{send_with_retry, CustomCapabilityHandler, RetryPolicy};
use crate::component::{self, ComponentId, Host};
use crate::error::{Error, Result};
use crate::gzip;
use crate::opamp::spec::CustomMessage;
use crate::telemetry::Logs;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

pub const ANOMALY_CAPABILITY: &str = "com.observiq.loganomalies";
pub const ANOMALY_REQUEST_TYPE: &str = "requestAnomalySnapshot";
pub const ANOMALY_REPORT_TYPE: &str = "reportAnomalySnapshot";

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct AnomalyRequest {
    #[serde(rename = "sessionId")]
    pub session_id: String,
    #[serde(default)]
    pub since: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnomalyResponse {
    #[serde(rename = "sessionId")]
    pub session_id: String,
    pub telemetry_payload: Vec<AnomalyStat>,
}

#[derive(Debug, PartialEq)]
pub enum AnomalyMessage {
    Request(AnomalyRequest),
    Unknown(String),
}

impl AnomalyMessage {
    pub fn parse(message: &CustomMessage) -> Result<AnomalyMessage> {
        match message.r#type.as_str() {
            ANOMALY_REQUEST_TYPE => Ok(AnomalyMessage::Request(serde_yaml::from_slice(
                &message.data,
            )?)),
            other => Ok(AnomalyMessage::Unknown(other.to_string())),
        }
    }
}

struct State {
    detector: Box<dyn AnomalyDetector>,
    anomalies: VecDeque<AnomalyStat>,
    capacity: usize,
    handler: Option<Arc<dyn CustomCapabilityHandler>>,
    done: Option<watch::Sender<()>>,
    tasks: Vec<JoinHandle<()>>,
}

impl State {
    fn record(&mut self, id: &ComponentId, anomaly: AnomalyStat) {
        log::info!(
            "log anomaly detected processor={} anomaly_type={:?} current_rate={} baseline_rate={} z_score={:?} mad_score={:?} deviation_percentage={}",
            id,
            anomaly.anomaly_type,
            anomaly.current_rate,
            anomaly.baseline_rate,
            anomaly.z_score,
            anomaly.mad_score,
            anomaly.percentage_diff
        );
        if self.anomalies.len() >= self.capacity {
            self.anomalies.pop_front();
        }
        self.anomalies.push_back(anomaly);
    }

    fn anomalies_since(&self, since: Option<&DateTime<Utc>>) -> Vec<AnomalyStat> {
        self.anomalies
            .iter()
            .filter(|a| since.map(|s| a.timestamp >= *s).unwrap_or(true))
            .cloned()
            .collect()
    }
}

/// Watches the log rate of a pipeline, records rate anomalies and serves them to the control
/// plane on the `com.observiq.loganomalies` capability.
///
/// The consume path and the background ticker share one lock over the detector and the anomaly
/// buffer, so a prune and the following check always see the same counts.
pub struct LogAnomalyProcessor {
    id: ComponentId,
    config: AnomalyConfig,
    state: Arc<Mutex<State>>,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl LogAnomalyProcessor {
    /// Builds a processor after validating `config`
    pub fn new(id: ComponentId, config: AnomalyConfig) -> Result<LogAnomalyProcessor> {
        config.validate()?;
        let detector: Box<dyn AnomalyDetector> = match config.strategy {
            Strategy::Window => Box::new(WindowDeviationDetector::new(
                config.window.clone(),
                Utc::now(),
            )),
            Strategy::Statistical => {
                Box::new(StatisticalDetector::new(config.statistical.clone()))
            }
        };

        Ok(LogAnomalyProcessor {
            id,
            state: Arc::new(Mutex::new(State {
                detector,
                anomalies: VecDeque::with_capacity(config.anomaly_buffer_size),
                capacity: config.anomaly_buffer_size,
                handler: None,
                done: None,
                tasks: Vec::new(),
            })),
            config,
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> &ComponentId {
        &self.id
    }

    /// Spawns the ticker and, when enabled, registers the anomaly capability and spawns the
    /// request listener. Must be called from within a tokio runtime.
    pub fn start(&self, host: &dyn Host) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let registration = if self.config.enabled {
            let registration = component::capability_registry(host, &self.config.opamp)
                .and_then(|registry| registry.register(ANOMALY_CAPABILITY))
                .map_err(|e| {
                    self.started.store(false, Ordering::SeqCst);
                    e
                })?;
            Some(registration)
        } else {
            None
        };

        let (done_tx, done_rx) = watch::channel(());
        let mut tasks = vec![tokio::spawn(run_ticker(
            self.id.clone(),
            self.state.clone(),
            self.config.tick_interval(),
            done_rx.clone(),
        ))];

        let mut state = self.state.lock();
        if let Some(registration) = registration {
            let listener = Listener {
                id: self.id.clone(),
                state: self.state.clone(),
                handler: registration.handler.clone(),
                retry: self.config.retry.clone(),
            };
            tasks.push(tokio::spawn(listener.run(registration.messages, done_rx)));
            state.handler = Some(registration.handler);
        }
        state.done = Some(done_tx);
        state.tasks.extend(tasks);
        log::debug!(
            "log anomaly processor started processor={} strategy={:?}",
            self.id,
            self.config.strategy
        );
        Ok(())
    }

    /// Accounts for a batch at the current time and passes it on unchanged
    pub fn consume_logs(&self, logs: Logs) -> Logs {
        self.consume_logs_at(logs, Utc::now())
    }

    pub fn consume_logs_at(&self, logs: Logs, now: DateTime<Utc>) -> Logs {
        let mut state = self.state.lock();
        if let Some(anomaly) = state.detector.observe(&logs, now) {
            state.record(&self.id, anomaly);
        }
        logs
    }

    /// Runs the periodic update at `now`, as the background ticker does
    pub fn tick_at(&self, now: DateTime<Utc>) {
        tick(&self.id, &self.state, now);
    }

    /// Buffered anomalies detected at or after `since`, oldest first
    pub fn anomalies(&self, since: Option<&DateTime<Utc>>) -> Vec<AnomalyStat> {
        self.state.lock().anomalies_since(since)
    }

    /// Unregisters the capability, signals the background tasks and waits up to `deadline` for
    /// them to exit.
    pub async fn stop(&self, deadline: Duration) -> Result<()> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
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
                    log::error!("log anomaly task failed processor={} error={}", self.id, e);
                }
                Ok(())
            }
            Err(_) => Err(Error::ShutdownTimeout(self.id.to_string())),
        }
    }
}

fn tick(id: &ComponentId, state: &Mutex<State>, now: DateTime<Utc>) {
    let mut state = state.lock();
    if let Some(anomaly) = state.detector.tick(now) {
        state.record(id, anomaly);
    }
}

async fn run_ticker(
    id: ComponentId,
    state: Arc<Mutex<State>>,
    period: Duration,
    mut done: watch::Receiver<()>,
) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = done.changed() => return,
            _ = ticker.tick() => tick(&id, &state, Utc::now()),
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
        let request = match AnomalyMessage::parse(&message) {
            Ok(AnomalyMessage::Request(request)) => request,
            Ok(AnomalyMessage::Unknown(kind)) => {
                log::warn!(
                    "received message of unknown type processor={} message_type={}",
                    self.id,
                    kind
                );
                return;
            }
            Err(e) => {
                log::error!(
                    "got invalid anomaly snapshot request processor={} error={}",
                    self.id,
                    e
                );
                return;
            }
        };
        log::debug!(
            "got anomaly snapshot request processor={} session={}",
            self.id,
            request.session_id
        );

        let body = match self.build_response(&request) {
            Ok(body) => body,
            Err(e) => {
                log::error!(
                    "failed to build anomaly snapshot processor={} session={} error={}",
                    self.id,
                    request.session_id,
                    e
                );
                return;
            }
        };

        if let Err(e) =
            send_with_retry(self.handler.as_ref(), ANOMALY_REPORT_TYPE, &body, &self.retry).await
        {
            log::error!(
                "failed to send anomaly snapshot processor={} session={} error={}",
                self.id,
                request.session_id,
                e
            );
        }
    }

    fn build_response(&self, request: &AnomalyRequest) -> Result<Vec<u8>> {
        let anomalies = self.state.lock().anomalies_since(request.since.as_ref());
        let response = AnomalyResponse {
            session_id: request.session_id.clone(),
            telemetry_payload: anomalies,
        };
        gzip::compress(&serde_json::to_vec(&response)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anomaly::config::WindowConfig;
    use crate::anomaly::detector::AnomalyKind;
    use crate::capability::LocalCapabilityRegistry;
    use crate::component::StaticHost;
    use crate::telemetry::*;
    use chrono::TimeZone;

    fn window_processor(buffer: usize) -> LogAnomalyProcessor {
        LogAnomalyProcessor::new(
            ComponentId::new("loganomaly"),
            AnomalyConfig {
                anomaly_buffer_size: buffer,
                strategy: Strategy::Window,
                window: WindowConfig {
                    current_window: Duration::from_secs(60),
                    baseline_window: Duration::from_secs(600),
                    deviation_threshold: 50.0,
                },
                ..Default::default()
            },
        )
        .unwrap()
    }

    fn logs(count: usize) -> Logs {
        Logs {
            resource_logs: vec![ResourceLogs {
                scope_logs: vec![ScopeLogs {
                    log_records: vec![LogRecord::default(); count],
                    ..Default::default()
                }],
                ..Default::default()
            }],
        }
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = AnomalyConfig {
            strategy: Strategy::Window,
            window: WindowConfig {
                deviation_threshold: 0.0,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(LogAnomalyProcessor::new(ComponentId::new("loganomaly"), config).is_err());
    }

    #[test]
    fn parse_request() {
        let message = CustomMessage {
            capability: ANOMALY_CAPABILITY.to_string(),
            r#type: ANOMALY_REQUEST_TYPE.to_string(),
            data: br#"{"sessionId": "abc", "since": "2024-01-01T00:00:00Z"}"#.to_vec(),
        };
        let expected = AnomalyRequest {
            session_id: "abc".to_string(),
            since: Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()),
        };
        assert_eq!(
            AnomalyMessage::parse(&message).unwrap(),
            AnomalyMessage::Request(expected)
        );
    }

    #[test]
    fn anomaly_buffer_evicts_oldest() {
        let processor = window_processor(2);
        // the window strategy never reports before a full baseline window has passed, so drive
        // the buffer directly
        let id = processor.id().clone();
        let base = Utc::now();
        for minute in 0..3 {
            let stat = AnomalyStat {
                anomaly_type: AnomalyKind::Spike,
                current_rate: 10.0,
                baseline_rate: 1.0,
                percentage_diff: 900.0,
                z_score: None,
                mad_score: None,
                baseline: None,
                timestamp: base + chrono::Duration::minutes(minute),
            };
            processor.state.lock().record(&id, stat);
        }
        let all = processor.anomalies(None);
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].timestamp, base + chrono::Duration::minutes(1));

        let since = base + chrono::Duration::minutes(2);
        assert_eq!(processor.anomalies(Some(&since)).len(), 1);
    }

    #[tokio::test]
    async fn serves_anomaly_snapshot() {
        let registry = LocalCapabilityRegistry::new();
        let host =
            StaticHost::new().with_extension(ComponentId::new("opamp"), Arc::new(registry.clone()));
        let processor = window_processor(10);
        processor.start(&host).unwrap();

        // a steady baseline, then silence for a whole current window
        let start = Utc::now();
        for minute in 0..9 {
            processor.consume_logs_at(logs(10), start + chrono::Duration::minutes(minute));
        }
        processor.tick_at(start + chrono::Duration::minutes(11));
        let detected = processor.anomalies(None);
        assert_eq!(detected.len(), 1);
        assert_eq!(detected[0].anomaly_type, AnomalyKind::Drop);

        registry.deliver(CustomMessage {
            capability: ANOMALY_CAPABILITY.to_string(),
            r#type: ANOMALY_REQUEST_TYPE.to_string(),
            data: b"sessionId: s-42\n".to_vec(),
        });
        let sent = registry.next_outbound(ANOMALY_CAPABILITY).await;
        assert_eq!(sent.r#type, ANOMALY_REPORT_TYPE);
        let response: AnomalyResponse =
            serde_json::from_slice(&gzip::decompress(&sent.data).unwrap()).unwrap();
        assert_eq!(response.session_id, "s-42");
        assert_eq!(response.telemetry_payload, detected);

        processor.stop(Duration::from_secs(1)).await.unwrap();
        assert!(!registry.is_registered(ANOMALY_CAPABILITY));
    }
}
