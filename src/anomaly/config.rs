use crate::capability::RetryPolicy;
use crate::component::ComponentId;
use crate::error::{Error, Result};
use serde::Deserialize;
use std::time::Duration;

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(60 * 60);

/// Which detection strategy a log anomaly processor runs
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Percentage deviation of the current window rate from the baseline window rate
    Window,
    /// Z-score and MAD score of the latest sample against the sample history
    #[default]
    Statistical,
}

/// Settings of the window deviation strategy.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    #[serde(with = "humantime_serde")]
    pub current_window: Duration,
    #[serde(with = "humantime_serde")]
    pub baseline_window: Duration,
    /// Percentage in (0, 100]
    pub deviation_threshold: f64,
}

impl Default for WindowConfig {
    fn default() -> Self {
        WindowConfig {
            current_window: 5 * MINUTE,
            baseline_window: HOUR,
            deviation_threshold: 50.0,
        }
    }
}

impl WindowConfig {
    pub fn validate(&self) -> Result<()> {
        if self.current_window.is_zero() {
            return Err(Error::InvalidConfig(
                "current_window must be positive".to_string(),
            ));
        }
        if self.baseline_window <= self.current_window {
            return Err(Error::InvalidConfig(format!(
                "baseline_window ({:?}) must be greater than current_window ({:?})",
                self.baseline_window, self.current_window
            )));
        }
        if !(self.deviation_threshold > 0.0 && self.deviation_threshold <= 100.0) {
            return Err(Error::InvalidConfig(format!(
                "deviation_threshold must be in (0, 100], got {}",
                self.deviation_threshold
            )));
        }
        Ok(())
    }
}

/// Settings of the statistical strategy.
///
/// Properties:
///
/// * `sample_interval`: how often a rate sample is taken, between one minute and one hour.
/// * `max_window_age`: how long samples are kept, at least one hour and at least ten sample
/// intervals.
/// * `zscore_threshold`: absolute z-score above which a sample is anomalous.
/// * `mad_threshold`: absolute MAD score above which a sample is anomalous.
/// * `emergency_max_size`: hard cap on the number of retained samples.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct StatisticalConfig {
    #[serde(with = "humantime_serde")]
    pub sample_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub max_window_age: Duration,
    pub zscore_threshold: f64,
    pub mad_threshold: f64,
    pub emergency_max_size: usize,
}

impl Default for StatisticalConfig {
    fn default() -> Self {
        StatisticalConfig {
            sample_interval: MINUTE,
            max_window_age: 24 * HOUR,
            zscore_threshold: 3.0,
            mad_threshold: 3.5,
            emergency_max_size: 1000,
        }
    }
}

impl StatisticalConfig {
    pub fn validate(&self) -> Result<()> {
        if self.sample_interval < MINUTE {
            return Err(Error::InvalidConfig(format!(
                "sample_interval must be at least 1 minute, got {:?}",
                self.sample_interval
            )));
        }
        if self.sample_interval > HOUR {
            return Err(Error::InvalidConfig(format!(
                "sample_interval must not exceed 1 hour, got {:?}",
                self.sample_interval
            )));
        }
        if self.max_window_age < HOUR {
            return Err(Error::InvalidConfig(format!(
                "max_window_age must be at least 1 hour, got {:?}",
                self.max_window_age
            )));
        }
        if self.max_window_age < self.sample_interval * 10 {
            return Err(Error::InvalidConfig(format!(
                "max_window_age ({:?}) must be at least 10 times larger than sample_interval ({:?})",
                self.max_window_age, self.sample_interval
            )));
        }
        if self.zscore_threshold <= 0.0 {
            return Err(Error::InvalidConfig(format!(
                "zscore_threshold must be positive, got {}",
                self.zscore_threshold
            )));
        }
        if self.mad_threshold <= 0.0 {
            return Err(Error::InvalidConfig(format!(
                "mad_threshold must be positive, got {}",
                self.mad_threshold
            )));
        }
        if self.emergency_max_size == 0 {
            return Err(Error::InvalidConfig(
                "emergency_max_size must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration of a log anomaly processor
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct AnomalyConfig {
    /// Answer anomaly snapshot requests over OpAMP
    pub enabled: bool,
    pub opamp: ComponentId,
    pub anomaly_buffer_size: usize,
    pub retry: RetryPolicy,
    pub strategy: Strategy,
    pub window: WindowConfig,
    pub statistical: StatisticalConfig,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        AnomalyConfig {
            enabled: true,
            opamp: ComponentId::new("opamp"),
            anomaly_buffer_size: 100,
            retry: RetryPolicy::default(),
            strategy: Strategy::default(),
            window: WindowConfig::default(),
            statistical: StatisticalConfig::default(),
        }
    }
}

impl AnomalyConfig {
    /// Validates the settings of the selected strategy only
    pub fn validate(&self) -> Result<()> {
        if self.anomaly_buffer_size == 0 {
            return Err(Error::InvalidConfig(
                "anomaly_buffer_size must be positive".to_string(),
            ));
        }
        match self.strategy {
            Strategy::Window => self.window.validate(),
            Strategy::Statistical => self.statistical.validate(),
        }
    }

    /// Period of the background ticker driving the selected strategy
    pub fn tick_interval(&self) -> Duration {
        match self.strategy {
            Strategy::Window => self.window.current_window,
            Strategy::Statistical => self.statistical.sample_interval,
        }
    }
}
