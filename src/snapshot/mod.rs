//! Snapshot capture: ring buffers that tee pipeline telemetry and the processor that exports a
//! filtered, gzip compressed view of them when the control plane asks for one.

pub mod buffer;
pub mod filter;
pub mod processor;
pub mod registry;

pub use buffer::{LogBuffer, MetricBuffer, RingBuffer, TraceBuffer};
pub use processor::{
    PipelineType, SnapshotConfig, SnapshotMessage, SnapshotProcessor, SnapshotReport,
    SnapshotRequest, SNAPSHOT_CAPABILITY, SNAPSHOT_REPORT_TYPE, SNAPSHOT_REQUEST_TYPE,
};
pub use registry::ProcessorRegistry;
