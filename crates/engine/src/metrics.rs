//! Summary statistics over repeated metric samples

use serde::{Deserialize, Serialize};

use crate::model::Statistic;

/// Summary of a sample set. Non-finite samples are counted as errors and
/// left out of every statistic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleSummary {
    pub count: usize,
    pub finite_count: usize,
    pub mean: f64,
    pub median: f64,
    pub min: f64,
    pub max: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
}

impl SampleSummary {
    /// Summarise `samples`; `None` when no sample is finite.
    pub fn from_samples(samples: &[f64]) -> Option<Self> {
        let mut xs: Vec<f64> = samples.iter().copied().filter(|x| x.is_finite()).collect();
        if xs.is_empty() {
            return None;
        }
        xs.sort_by(f64::total_cmp);

        Some(Self {
            count: samples.len(),
            finite_count: xs.len(),
            mean: xs.iter().sum::<f64>() / xs.len() as f64,
            median: percentile(&xs, 50.0),
            min: xs[0],
            max: xs[xs.len() - 1],
            p90: percentile(&xs, 90.0),
            p95: percentile(&xs, 95.0),
            p99: percentile(&xs, 99.0),
        })
    }

    pub fn get(&self, statistic: Statistic) -> f64 {
        match statistic {
            Statistic::Mean => self.mean,
            Statistic::Median => self.median,
            Statistic::Min => self.min,
            Statistic::Max => self.max,
            Statistic::P90 => self.p90,
            Statistic::P95 => self.p95,
            Statistic::P99 => self.p99,
        }
    }
}

/// Linear-interpolated percentile (`p` in 0..=100) of sorted values
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let k = (sorted.len() - 1) as f64 * (p / 100.0);
    let f = k.floor() as usize;
    let c = (f + 1).min(sorted.len() - 1);
    if f == c {
        return sorted[f];
    }
    sorted[f] * (c as f64 - k) + sorted[c] * (k - f as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percentile_interpolates() {
        let xs = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(percentile(&xs, 50.0), 3.0);
        assert_eq!(percentile(&xs, 0.0), 1.0);
        assert_eq!(percentile(&xs, 100.0), 5.0);
        assert!((percentile(&xs, 90.0) - 4.6).abs() < 1e-9);
    }

    #[test]
    fn test_summary_ignores_non_finite() {
        let summary = SampleSummary::from_samples(&[300.0, f64::NAN, 100.0, 200.0, f64::INFINITY]).unwrap();
        assert_eq!(summary.count, 5);
        assert_eq!(summary.finite_count, 3);
        assert_eq!(summary.mean, 200.0);
        assert_eq!(summary.median, 200.0);
        assert_eq!(summary.min, 100.0);
        assert_eq!(summary.get(Statistic::Max), 300.0);
    }

    #[test]
    fn test_summary_of_nothing_finite() {
        assert!(SampleSummary::from_samples(&[]).is_none());
        assert!(SampleSummary::from_samples(&[f64::NAN]).is_none());
    }
}
