//! Log rate anomaly detection. A processor counts the logs flowing through it, runs one of two
//! detection strategies and keeps a bounded history of detected anomalies that the control plane
//! can fetch over OpAMP.

pub mod config;
pub mod detector;
pub mod processor;
pub mod stats;

pub use config::{AnomalyConfig, StatisticalConfig, Strategy, WindowConfig};
pub use detector::{AnomalyDetector, AnomalyKind, AnomalyStat};
pub use processor::{
    AnomalyMessage, AnomalyRequest, AnomalyResponse, LogAnomalyProcessor, ANOMALY_CAPABILITY,
    ANOMALY_REPORT_TYPE, ANOMALY_REQUEST_TYPE,
};
