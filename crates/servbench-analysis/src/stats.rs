use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricStats {
    pub mean: f64,
    pub std: f64,
    pub max_dev: f64,
    pub count: usize,
}

impl MetricStats {
    /// Returns `None` for an empty sample.
    pub fn from_values(values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        Some(Self {
            mean: mean(values),
            std: population_std(values),
            max_dev: max_deviation(values),
            count: values.len(),
        })
    }
}

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Root-mean-square deviation from the mean. Zero below two samples and for
/// constant samples, where rounding in the mean would otherwise leak through.
pub fn population_std(values: &[f64]) -> f64 {
    if values.len() < 2 || all_equal(values) {
        return 0.0;
    }
    let avg = mean(values);
    let var = values.iter().map(|v| (v - avg).powi(2)).sum::<f64>() / values.len() as f64;
    var.sqrt()
}

/// `max(max - mean, mean - min)`.
pub fn max_deviation(values: &[f64]) -> f64 {
    if values.is_empty() || all_equal(values) {
        return 0.0;
    }
    let avg = mean(values);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    (max - avg).max(avg - min)
}

fn all_equal(values: &[f64]) -> bool {
    values.windows(2).all(|w| w[0] == w[1])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn three_trial_throughput_scenario() {
        let values = [100.0, 110.0, 90.0];
        assert!((mean(&values) - 100.0).abs() < 1e-9);
        assert!((population_std(&values) - 8.1649658).abs() < 1e-6);
        assert!((max_deviation(&values) - 10.0).abs() < 1e-9);
    }

    #[test]
    fn std_is_zero_for_fewer_than_two_samples() {
        assert_eq!(population_std(&[]), 0.0);
        assert_eq!(population_std(&[42.5]), 0.0);
    }

    #[test]
    fn std_is_zero_iff_values_are_equal() {
        assert_eq!(population_std(&[0.1, 0.1, 0.1]), 0.0);
        assert_eq!(population_std(&[3.0, 3.0]), 0.0);
        assert!(population_std(&[3.0, 3.0000001]) > 0.0);
        assert!(population_std(&[1.0, 2.0, 1.0]) > 0.0);
    }

    #[test]
    fn max_deviation_picks_the_larger_side() {
        // mean 4, max-mean 6, mean-min 3
        let values = [1.0, 1.0, 10.0];
        assert!((max_deviation(&values) - 6.0).abs() < 1e-9);
    }

    #[test]
    fn metric_stats_handles_empty_and_single() {
        assert!(MetricStats::from_values(&[]).is_none());
        let one = MetricStats::from_values(&[5.0]).expect("stats");
        assert_eq!(one.mean, 5.0);
        assert_eq!(one.std, 0.0);
        assert_eq!(one.max_dev, 0.0);
        assert_eq!(one.count, 1);
    }
}
