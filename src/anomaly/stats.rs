use serde::{Deserialize, Serialize};

/// Consistency constant making the MAD comparable to a standard deviation for normal data
pub const MAD_SCALE: f64 = 1.4826;

/// Summary statistics of a window of rate samples
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Statistics {
    pub mean: f64,
    pub std_dev: f64,
    pub median: f64,
    pub mad: f64,
    #[serde(skip)]
    pub samples: Vec<f64>,
}

fn upper_median(sorted: &[f64]) -> f64 {
    sorted[sorted.len() / 2]
}

/// Mean, population standard deviation, median (upper middle for even lengths) and scaled
/// median absolute deviation of `rates`. All zero for an empty slice.
pub fn calculate_statistics(rates: &[f64]) -> Statistics {
    if rates.is_empty() {
        return Statistics::default();
    }

    let n = rates.len() as f64;
    let mean = rates.iter().sum::<f64>() / n;
    let std_dev = (rates.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / n).sqrt();

    let mut sorted = rates.to_vec();
    sorted.sort_by(f64::total_cmp);
    let median = upper_median(&sorted);

    let mut deviations: Vec<f64> = rates.iter().map(|r| (r - median).abs()).collect();
    deviations.sort_by(f64::total_cmp);
    let mad = upper_median(&deviations) * MAD_SCALE;

    Statistics {
        mean,
        std_dev,
        median,
        mad,
        samples: rates.to_vec(),
    }
}
