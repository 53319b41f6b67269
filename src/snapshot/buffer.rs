use super::filter::{self, Filter};
use crate::error::Result;
use crate::telemetry::{datetime_to_nanos, Logs, Metrics, Traces};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;

/// A telemetry signal that can be buffered and exported as a snapshot.
pub trait Signal: Clone + Serialize {
    /// Concatenates the resources of every batch into one payload
    fn merge<'a, I>(batches: I) -> Self
    where
        I: Iterator<Item = &'a Self>,
        Self: 'a;

    fn filter(self, filter: &Filter) -> Self;
}

impl Signal for Logs {
    fn merge<'a, I>(batches: I) -> Self
    where
        I: Iterator<Item = &'a Self>,
    {
        Logs {
            resource_logs: batches
                .flat_map(|b| b.resource_logs.iter().cloned())
                .collect(),
        }
    }

    fn filter(self, f: &Filter) -> Self {
        filter::filter_logs(self, f)
    }
}

impl Signal for Metrics {
    fn merge<'a, I>(batches: I) -> Self
    where
        I: Iterator<Item = &'a Self>,
    {
        Metrics {
            resource_metrics: batches
                .flat_map(|b| b.resource_metrics.iter().cloned())
                .collect(),
        }
    }

    fn filter(self, f: &Filter) -> Self {
        filter::filter_metrics(self, f)
    }
}

impl Signal for Traces {
    fn merge<'a, I>(batches: I) -> Self
    where
        I: Iterator<Item = &'a Self>,
    {
        Traces {
            resource_spans: batches
                .flat_map(|b| b.resource_spans.iter().cloned())
                .collect(),
        }
    }

    fn filter(self, f: &Filter) -> Self {
        filter::filter_traces(self, f)
    }
}

/// Fixed capacity FIFO of telemetry batches. Each `add` stores one batch; once `capacity` batches
/// are held the oldest is evicted.
#[derive(Clone, Debug)]
pub struct RingBuffer<T> {
    capacity: usize,
    entries: VecDeque<T>,
}

pub type LogBuffer = RingBuffer<Logs>;
pub type MetricBuffer = RingBuffer<Metrics>;
pub type TraceBuffer = RingBuffer<Traces>;

impl<T> RingBuffer<T> {
    pub fn new(capacity: usize) -> RingBuffer<T> {
        RingBuffer {
            capacity,
            entries: VecDeque::with_capacity(capacity),
        }
    }

    pub fn add(&mut self, batch: T) {
        if self.capacity == 0 {
            return;
        }
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(batch);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Oldest to newest
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries.iter()
    }
}

impl<T: Signal> RingBuffer<T> {
    /// Merges the buffered batches, applies the query and timestamp filters and renders the
    /// result as OTLP-JSON. The buffer itself is left untouched.
    pub fn construct_payload(
        &self,
        search_query: Option<&str>,
        minimum_timestamp: Option<&DateTime<Utc>>,
    ) -> Result<Vec<u8>> {
        let filter = Filter {
            query: search_query,
            minimum_timestamp: minimum_timestamp.map(datetime_to_nanos),
        };
        let payload = T::merge(self.entries.iter()).filter(&filter);
        Ok(serde_json::to_vec(&payload)?)
    }
}
