//! Search query and minimum timestamp filtering of buffered telemetry.
//!
//! A query matches a value when it is a substring of the value's text or, for containers, of
//! any key or nested value. When the query matches a resource's attributes every record under
//! that resource passes the query check. Resources and scopes left without records are dropped.

use crate::telemetry::{
    AnyValue, KeyValue, LogRecord, Logs, Metric, Metrics, ResourceLogs, ResourceMetrics,
    ResourceSpans, Span, Traces,
};

/// Reports whether `query` occurs in `value`, searching nested arrays and maps depth first.
pub fn query_matches_value(value: &AnyValue, query: &str) -> bool {
    match value {
        AnyValue::ArrayValue(array) => array.values.iter().any(|v| query_matches_value(v, query)),
        AnyValue::KvlistValue(list) => query_matches_attributes(&list.values, query),
        scalar => scalar.as_text().contains(query),
    }
}

/// Reports whether `query` occurs in any attribute key or value.
pub fn query_matches_attributes(attributes: &[KeyValue], query: &str) -> bool {
    attributes
        .iter()
        .any(|kv| kv.key.contains(query) || query_matches_value(&kv.value, query))
}

/// Resolved filter for one snapshot request
#[derive(Clone, Copy, Debug, Default)]
pub struct Filter<'a> {
    pub query: Option<&'a str>,
    pub minimum_timestamp: Option<u64>,
}

impl<'a> Filter<'a> {
    pub fn is_empty(&self) -> bool {
        self.query.is_none() && self.minimum_timestamp.is_none()
    }

    fn matches_resource(&self, attributes: &[KeyValue]) -> bool {
        match self.query {
            Some(query) => query_matches_attributes(attributes, query),
            None => true,
        }
    }

    fn matches_time(&self, timestamp: u64) -> bool {
        self.minimum_timestamp
            .map(|min| timestamp >= min)
            .unwrap_or(true)
    }

    fn matches_query<F: FnOnce(&str) -> bool>(&self, already_matched: bool, check: F) -> bool {
        if already_matched {
            return true;
        }
        match self.query {
            Some(query) => check(query),
            None => true,
        }
    }
}

fn log_matches_query(record: &LogRecord, query: &str) -> bool {
    query_matches_attributes(&record.attributes, query)
        || record
            .body
            .as_ref()
            .map(|body| query_matches_value(body, query))
            .unwrap_or(false)
}

pub fn filter_logs(logs: Logs, filter: &Filter) -> Logs {
    if filter.is_empty() {
        return logs;
    }

    let resource_logs = logs
        .resource_logs
        .into_iter()
        .filter_map(|mut rl: ResourceLogs| {
            let resource_matches = filter.matches_resource(&rl.resource.attributes);
            for sl in rl.scope_logs.iter_mut() {
                sl.log_records.retain(|record| {
                    filter.matches_time(record.observed_time_unix_nano)
                        && filter.matches_query(resource_matches, |q| log_matches_query(record, q))
                });
            }
            rl.scope_logs.retain(|sl| !sl.log_records.is_empty());
            (!rl.scope_logs.is_empty()).then_some(rl)
        })
        .collect();

    Logs { resource_logs }
}

fn filter_metric(metric: &mut Metric, resource_matches: bool, filter: &Filter) {
    let name_matches = !resource_matches
        && filter
            .query
            .map(|q| metric.name.contains(q))
            .unwrap_or(true);
    let already_matched = resource_matches || name_matches;

    metric.retain_data_points(|attributes, timestamp| {
        filter.matches_time(timestamp)
            && filter.matches_query(already_matched, |q| query_matches_attributes(attributes, q))
    });
}

pub fn filter_metrics(metrics: Metrics, filter: &Filter) -> Metrics {
    if filter.is_empty() {
        return metrics;
    }

    let resource_metrics = metrics
        .resource_metrics
        .into_iter()
        .filter_map(|mut rm: ResourceMetrics| {
            let resource_matches = filter.matches_resource(&rm.resource.attributes);
            for sm in rm.scope_metrics.iter_mut() {
                for metric in sm.metrics.iter_mut() {
                    filter_metric(metric, resource_matches, filter);
                }
                sm.metrics.retain(|m| m.data_point_count() != 0);
            }
            rm.scope_metrics.retain(|sm| !sm.metrics.is_empty());
            (!rm.scope_metrics.is_empty()).then_some(rm)
        })
        .collect();

    Metrics { resource_metrics }
}

fn span_matches_query(span: &Span, query: &str) -> bool {
    query_matches_attributes(&span.attributes, query)
        || span.name.contains(query)
        || span.trace_id.to_string().contains(query)
        || span.span_id.to_string().contains(query)
        || span.parent_span_id.to_string().contains(query)
        || span.kind_name().contains(query)
}

pub fn filter_traces(traces: Traces, filter: &Filter) -> Traces {
    if filter.is_empty() {
        return traces;
    }

    let resource_spans = traces
        .resource_spans
        .into_iter()
        .filter_map(|mut rs: ResourceSpans| {
            let resource_matches = filter.matches_resource(&rs.resource.attributes);
            for ss in rs.scope_spans.iter_mut() {
                ss.spans.retain(|span| {
                    filter.matches_time(span.end_time_unix_nano)
                        && filter.matches_query(resource_matches, |q| span_matches_query(span, q))
                });
            }
            rs.scope_spans.retain(|ss| !ss.spans.is_empty());
            (!rs.scope_spans.is_empty()).then_some(rs)
        })
        .collect();

    Traces { resource_spans }
}
