use super::config::{StatisticalConfig, WindowConfig};
use super::stats::{calculate_statistics, Statistics};
use crate::telemetry::{nanos_to_datetime, Logs};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AnomalyKind {
    Spike,
    Drop,
}

/// A detected deviation of the log rate.
///
/// `baseline_rate` is the baseline window rate for the window strategy and the sample mean for
/// the statistical strategy; the scores and `baseline` are only set by the statistical strategy.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnomalyStat {
    pub anomaly_type: AnomalyKind,
    pub current_rate: f64,
    pub baseline_rate: f64,
    pub percentage_diff: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub z_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mad_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baseline: Option<Statistics>,
    pub timestamp: DateTime<Utc>,
}

/// A log rate anomaly detection strategy. Both calls take the current time explicitly.
pub trait AnomalyDetector: Send {
    /// Accounts for a consumed batch; may report an anomaly
    fn observe(&mut self, logs: &Logs, now: DateTime<Utc>) -> Option<AnomalyStat>;
    /// Periodic update for when no logs arrive
    fn tick(&mut self, now: DateTime<Utc>) -> Option<AnomalyStat>;
}

fn to_chrono(d: std::time::Duration) -> Duration {
    Duration::from_std(d).unwrap_or_else(|_| Duration::days(365 * 1000))
}

fn minutes(d: Duration) -> f64 {
    d.num_milliseconds() as f64 / 60_000.0
}

/// Compares a current rate with a baseline rate.
///
/// Returns an anomaly when the absolute percentage deviation exceeds `threshold`. A zero baseline
/// never yields an anomaly.
pub fn evaluate_deviation(
    current_rate: f64,
    baseline_rate: f64,
    threshold: f64,
    timestamp: DateTime<Utc>,
) -> Option<AnomalyStat> {
    if baseline_rate == 0.0 {
        return None;
    }
    let deviation = (current_rate - baseline_rate) / baseline_rate * 100.0;
    if deviation.abs() <= threshold {
        return None;
    }

    Some(AnomalyStat {
        anomaly_type: if current_rate > baseline_rate {
            AnomalyKind::Spike
        } else {
            AnomalyKind::Drop
        },
        current_rate,
        baseline_rate,
        percentage_diff: deviation.abs(),
        z_score: None,
        mad_score: None,
        baseline: None,
        timestamp,
    })
}

/// Counts log timestamps in a short current window and a longer baseline window and flags the
/// current rate when it deviates from the baseline rate by more than the threshold percentage.
pub struct WindowDeviationDetector {
    config: WindowConfig,
    current_window: Duration,
    baseline_window: Duration,
    started: DateTime<Utc>,
    timestamps: VecDeque<DateTime<Utc>>,
    current_count: u64,
    baseline_count: u64,
    last_check: Option<DateTime<Utc>>,
}

impl WindowDeviationDetector {
    pub fn new(config: WindowConfig, now: DateTime<Utc>) -> WindowDeviationDetector {
        WindowDeviationDetector {
            current_window: to_chrono(config.current_window),
            baseline_window: to_chrono(config.baseline_window),
            config,
            started: now,
            timestamps: VecDeque::new(),
            current_count: 0,
            baseline_count: 0,
            last_check: None,
        }
    }

    pub fn counts(&self) -> (u64, u64) {
        (self.current_count, self.baseline_count)
    }

    /// Drops timestamps older than the baseline window and recounts both windows
    fn prune(&mut self, now: DateTime<Utc>) {
        let baseline_cutoff = now - self.baseline_window;
        let current_cutoff = now - self.current_window;
        self.timestamps.retain(|ts| *ts >= baseline_cutoff);
        self.baseline_count = self.timestamps.len() as u64;
        self.current_count = self
            .timestamps
            .iter()
            .filter(|ts| **ts >= current_cutoff)
            .count() as u64;
    }

    fn check_for_anomaly(&mut self, now: DateTime<Utc>) -> Option<AnomalyStat> {
        if now - self.started < self.baseline_window {
            return None;
        }
        if let Some(last) = self.last_check {
            if now - last < self.current_window {
                return None;
            }
        }
        self.last_check = Some(now);

        let current_rate = self.current_count as f64 / minutes(self.current_window);
        let baseline_rate = self.baseline_count as f64 / minutes(self.baseline_window);
        evaluate_deviation(
            current_rate,
            baseline_rate,
            self.config.deviation_threshold,
            now,
        )
    }
}

impl AnomalyDetector for WindowDeviationDetector {
    fn observe(&mut self, logs: &Logs, now: DateTime<Utc>) -> Option<AnomalyStat> {
        for nanos in logs.record_timestamps() {
            let ts = if nanos == 0 {
                now
            } else {
                nanos_to_datetime(nanos)
            };
            let age = now - ts;
            if age > self.baseline_window {
                continue;
            }
            if age <= self.current_window {
                self.current_count += 1;
            }
            self.baseline_count += 1;
            self.timestamps.push_back(ts);
        }
        self.tick(now)
    }

    fn tick(&mut self, now: DateTime<Utc>) -> Option<AnomalyStat> {
        self.prune(now);
        self.check_for_anomaly(now)
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Sample {
    pub timestamp: DateTime<Utc>,
    pub rate: f64,
}

/// Samples the log rate at a fixed interval and flags the newest sample when its z-score or MAD
/// score against the earlier samples exceeds the configured thresholds.
pub struct StatisticalDetector {
    config: StatisticalConfig,
    sample_interval: Duration,
    max_window_age: Duration,
    history: Vec<Sample>,
    bucket_count: u64,
    bucket_start: Option<DateTime<Utc>>,
    last_sample: Option<DateTime<Utc>>,
}

impl StatisticalDetector {
    pub fn new(config: StatisticalConfig) -> StatisticalDetector {
        StatisticalDetector {
            sample_interval: to_chrono(config.sample_interval),
            max_window_age: to_chrono(config.max_window_age),
            config,
            history: Vec::new(),
            bucket_count: 0,
            bucket_start: None,
            last_sample: None,
        }
    }

    pub fn history(&self) -> &[Sample] {
        &self.history
    }

    fn sample_due(&self, now: DateTime<Utc>) -> bool {
        self.last_sample
            .map(|last| now - last >= self.sample_interval)
            .unwrap_or(true)
    }

    /// Closes the current bucket as a rate sample. Buckets shorter than a second are left open.
    pub fn take_sample(&mut self, now: DateTime<Utc>) -> Option<AnomalyStat> {
        let start = match self.bucket_start {
            Some(start) => start,
            None => {
                self.bucket_start = Some(now);
                return None;
            }
        };
        let elapsed = minutes(now - start);
        if elapsed < 1.0 / 60.0 {
            return None;
        }

        self.history.push(Sample {
            timestamp: now,
            rate: self.bucket_count as f64 / elapsed,
        });
        self.bucket_count = 0;
        self.bucket_start = Some(now);
        self.last_sample = Some(now);

        self.prune(now);
        self.check_for_anomaly()
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        let cutoff = now - self.max_window_age;
        let keep_from = self.history.partition_point(|s| s.timestamp <= cutoff);
        if keep_from > 0 {
            self.history.drain(..keep_from);
        }

        if self.history.len() > self.config.emergency_max_size {
            let excess = self.history.len() - self.config.emergency_max_size;
            self.history.drain(..excess);
            log::warn!(
                "emergency max buffer was exceeded, purge was performed samples_removed={}",
                excess
            );
        }
    }

    pub fn check_for_anomaly(&self) -> Option<AnomalyStat> {
        let (latest, earlier) = self.history.split_last()?;
        let rates: Vec<f64> = earlier.iter().map(|s| s.rate).collect();
        let stats = calculate_statistics(&rates);
        if stats.std_dev == 0.0 || stats.mad == 0.0 {
            return None;
        }

        let current_rate = latest.rate;
        let z_score = (current_rate - stats.mean) / stats.std_dev;
        let mad_score = (current_rate - stats.median) / stats.mad;
        if z_score.abs() <= self.config.zscore_threshold
            && mad_score.abs() <= self.config.mad_threshold
        {
            return None;
        }

        Some(AnomalyStat {
            anomaly_type: if current_rate > stats.mean {
                AnomalyKind::Spike
            } else {
                AnomalyKind::Drop
            },
            current_rate,
            baseline_rate: stats.mean,
            percentage_diff: ((current_rate - stats.mean) / stats.mean * 100.0).abs(),
            z_score: Some(z_score),
            mad_score: Some(mad_score),
            baseline: Some(stats),
            timestamp: latest.timestamp,
        })
    }
}

impl AnomalyDetector for StatisticalDetector {
    fn observe(&mut self, logs: &Logs, now: DateTime<Utc>) -> Option<AnomalyStat> {
        if self.bucket_start.is_none() {
            self.bucket_start = Some(now);
        }
        self.bucket_count += logs.log_record_count() as u64;
        if self.sample_due(now) {
            return self.take_sample(now);
        }
        None
    }

    fn tick(&mut self, now: DateTime<Utc>) -> Option<AnomalyStat> {
        if self.sample_due(now) {
            return self.take_sample(now);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn logs_at(times: &[DateTime<Utc>]) -> Logs {
        Logs {
            resource_logs: vec![ResourceLogs {
                scope_logs: vec![ScopeLogs {
                    log_records: times
                        .iter()
                        .map(|t| LogRecord {
                            time_unix_nano: datetime_to_nanos(t),
                            ..Default::default()
                        })
                        .collect(),
                    ..Default::default()
                }],
                ..Default::default()
            }],
        }
    }

    fn batch(count: usize) -> Logs {
        logs_at(&vec![t0(); count])
    }

    #[test]
    fn deviation_classification() {
        let now = t0();
        for d in [60.0, -60.0, 150.0, -99.0] {
            let base = 40.0;
            let current = base * (1.0 + d / 100.0);
            let stat = evaluate_deviation(current, base, 50.0, now).unwrap();
            assert!((stat.percentage_diff - f64::abs(d)).abs() < 1e-9);
            let expected = if d > 0.0 {
                AnomalyKind::Spike
            } else {
                AnomalyKind::Drop
            };
            assert_eq!(stat.anomaly_type, expected);
        }
        for d in [50.0, -50.0, 10.0, 0.0] {
            assert!(evaluate_deviation(40.0 * (1.0 + d / 100.0), 40.0, 50.0, now).is_none());
        }
        assert!(evaluate_deviation(10.0, 0.0, 50.0, now).is_none());
    }

    fn window_config() -> WindowConfig {
        WindowConfig {
            current_window: std::time::Duration::from_secs(60),
            baseline_window: std::time::Duration::from_secs(600),
            deviation_threshold: 50.0,
        }
    }

    #[test]
    fn window_counts_are_recomputed_on_tick() {
        let start = t0();
        let mut detector = WindowDeviationDetector::new(window_config(), start);
        let now = start + Duration::minutes(5);
        detector.observe(
            &logs_at(&[
                now - Duration::seconds(30),
                now - Duration::minutes(3),
                now - Duration::minutes(20),
            ]),
            now,
        );
        assert_eq!(detector.counts(), (1, 2));

        detector.tick(now + Duration::minutes(8));
        assert_eq!(detector.counts(), (0, 1));
        detector.tick(now + Duration::minutes(20));
        assert_eq!(detector.counts(), (0, 0));
    }

    #[test]
    fn window_waits_for_full_baseline() {
        let start = t0();
        let mut detector = WindowDeviationDetector::new(window_config(), start);

        // 1 log per minute for the first 9 minutes, then a burst
        for minute in 0..9 {
            let now = start + Duration::minutes(minute);
            assert!(detector.observe(&logs_at(&[now]), now).is_none());
        }
        let burst_time = start + Duration::minutes(9) + Duration::seconds(30);
        assert!(detector
            .observe(&logs_at(&vec![burst_time; 30]), burst_time)
            .is_none());

        let now = start + Duration::minutes(10);
        let stat = detector.tick(now).unwrap();
        assert_eq!(stat.anomaly_type, AnomalyKind::Spike);
        // current 30/min vs baseline 39/10min
        assert!((stat.current_rate - 30.0).abs() < 1e-9);
        assert!((stat.baseline_rate - 3.9).abs() < 1e-9);

        // rate limited until another current window has passed
        assert!(detector.tick(now + Duration::seconds(30)).is_none());
    }

    #[test]
    fn window_detects_drop() {
        let start = t0();
        let mut detector = WindowDeviationDetector::new(window_config(), start);
        for minute in 0..9 {
            let now = start + Duration::minutes(minute);
            detector.observe(&logs_at(&vec![now; 10]), now);
        }
        let stat = detector.tick(start + Duration::minutes(10)).unwrap();
        assert_eq!(stat.anomaly_type, AnomalyKind::Drop);
        assert_eq!(stat.current_rate, 0.0);
        assert!((stat.percentage_diff - 100.0).abs() < 1e-9);
    }

    fn statistical() -> StatisticalDetector {
        StatisticalDetector::new(StatisticalConfig {
            sample_interval: std::time::Duration::from_secs(60),
            max_window_age: std::time::Duration::from_secs(3600),
            zscore_threshold: 3.0,
            mad_threshold: 3.0,
            emergency_max_size: 1000,
        })
    }

    #[test]
    fn statistical_flags_spike() {
        let mut detector = statistical();
        let mut now = t0();
        detector.observe(&batch(0), now);

        let counts = [100, 110, 90, 105, 95, 100, 102, 98];
        for count in counts {
            detector.observe(&batch(count), now);
            now = now + Duration::minutes(1);
            assert!(detector.tick(now).is_none());
        }
        assert_eq!(detector.history().len(), counts.len());

        detector.observe(&batch(1000), now);
        now = now + Duration::minutes(1);
        let stat = detector.tick(now).unwrap();
        assert_eq!(stat.anomaly_type, AnomalyKind::Spike);
        assert!(stat.z_score.unwrap() > 3.0);
        assert_eq!(stat.timestamp, now);
        assert!((stat.current_rate - 1000.0).abs() < 1e-9);
    }

    #[test]
    fn statistical_ignores_short_buckets_and_flat_history() {
        let mut detector = statistical();
        let now = t0();
        detector.observe(&batch(5), now);
        assert!(detector.take_sample(now).is_none());
        assert!(detector.history().is_empty());

        let mut flat = statistical();
        let mut t = now;
        flat.observe(&batch(0), t);
        for _ in 0..5 {
            flat.observe(&batch(60), t);
            t = t + Duration::minutes(1);
            assert!(flat.tick(t).is_none());
        }
        flat.observe(&batch(6000), t);
        // every earlier sample is identical, so there is no spread to score against
        assert!(flat.tick(t + Duration::minutes(1)).is_none());
        assert_eq!(flat.history().len(), 6);
    }

    #[test]
    fn statistical_prunes_old_and_excess_samples() {
        let mut detector = StatisticalDetector::new(StatisticalConfig {
            emergency_max_size: 5,
            ..StatisticalConfig::default()
        });
        let mut now = t0();
        detector.observe(&batch(1), now);
        for _ in 0..8 {
            now = now + Duration::minutes(1);
            detector.observe(&batch(1), now);
        }
        assert_eq!(detector.history().len(), 5);

        let mut aging = statistical();
        let mut now = t0();
        aging.observe(&batch(1), now);
        for _ in 0..3 {
            now = now + Duration::minutes(1);
            aging.tick(now);
        }
        assert_eq!(aging.history().len(), 3);
        aging.tick(now + Duration::hours(2));
        assert_eq!(aging.history().len(), 1);
    }
}
