use ringbuffer::{AllocRingBuffer, RingBuffer, RingBufferExt, RingBufferRead, RingBufferWrite};
use serde::{Deserialize, Serialize};

const DAYS_PER_YEAR: f64 = 365.0;

/// Volatility regime buckets. Boundary values classify downward, so an
/// annualized volatility of exactly 0.30 is still `Normal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VolRegime {
    Low,
    Normal,
    Elevated,
    High,
    Extreme,
}

pub fn classify(annualized: f64) -> VolRegime {
    if annualized <= 0.15 {
        VolRegime::Low
    } else if annualized <= 0.30 {
        VolRegime::Normal
    } else if annualized <= 0.50 {
        VolRegime::Elevated
    } else if annualized <= 0.80 {
        VolRegime::High
    } else {
        VolRegime::Extreme
    }
}

/// Sample standard deviation of log returns, annualized with √365 crypto
/// convention scaled by the sampling cadence.
pub fn annualized_volatility(returns: &[f64], samples_per_day: f64) -> Option<f64> {
    if returns.len() < 2 || samples_per_day <= 0.0 {
        return None;
    }
    let n = returns.len() as f64;
    let mean = returns.iter().sum::<f64>() / n;
    let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / n;
    let sigma = variance.max(0.0).sqrt();
    Some(sigma * (DAYS_PER_YEAR * samples_per_day).sqrt())
}

/// Rolling log-return window fed one observation per run.
#[derive(Debug)]
pub struct VolTracker {
    lookback: usize,
    samples_per_day: f64,
    returns: AllocRingBuffer<f64>,
    last_value: Option<f64>,
}

impl VolTracker {
    pub fn new(lookback: usize, samples_per_day: f64) -> Self {
        let capacity = lookback.next_power_of_two().max(2);
        Self {
            lookback,
            samples_per_day,
            returns: AllocRingBuffer::with_capacity(capacity),
            last_value: None,
        }
    }

    pub fn observe(&mut self, value: f64) {
        if let Some(prev) = self.last_value {
            if prev > 0.0 && value > 0.0 {
                self.returns.push((value / prev).ln());
                while self.returns.len() > self.lookback {
                    let _ = self.returns.dequeue();
                }
            }
        }
        self.last_value = Some(value);
    }

    pub fn annualized(&self) -> Option<f64> {
        let returns: Vec<f64> = self.returns.iter().copied().collect();
        annualized_volatility(&returns, self.samples_per_day)
    }

    /// Regime of the current window. `Low` until the window has enough
    /// returns to say anything.
    pub fn regime(&self) -> VolRegime {
        self.annualized().map(classify).unwrap_or(VolRegime::Low)
    }

    pub fn sample_count(&self) -> usize {
        self.returns.len()
    }

    pub fn reset(&mut self) {
        self.returns.clear();
        self.last_value = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boundary_classifies_downward() {
        assert_eq!(classify(0.15), VolRegime::Low);
        assert_eq!(classify(0.30), VolRegime::Normal);
        assert_eq!(classify(0.50), VolRegime::Elevated);
        assert_eq!(classify(0.80), VolRegime::High);
        assert_eq!(classify(0.81), VolRegime::Extreme);
    }

    #[test]
    fn flat_series_has_zero_volatility() {
        let returns = vec![0.0; 10];
        let vol = annualized_volatility(&returns, 96.0).unwrap();
        assert_eq!(vol, 0.0);
        assert_eq!(classify(vol), VolRegime::Low);
    }

    #[test]
    fn needs_two_returns() {
        assert_eq!(annualized_volatility(&[0.01], 96.0), None);
    }

    #[test]
    fn annualization_scales_with_cadence() {
        let returns = vec![0.01, -0.01, 0.01, -0.01, 0.01, -0.01];
        let daily = annualized_volatility(&returns, 1.0).unwrap();
        let quarter_hourly = annualized_volatility(&returns, 96.0).unwrap();
        assert!((quarter_hourly / daily - 96f64.sqrt()).abs() < 1e-9);
    }

    #[test]
    fn tracker_rolls_the_window() {
        let mut tracker = VolTracker::new(4, 96.0);
        for value in [100.0, 101.0, 100.5, 102.0, 101.0, 103.0, 102.5] {
            tracker.observe(value);
        }
        assert_eq!(tracker.sample_count(), 4);
        assert!(tracker.annualized().is_some());
    }

    #[test]
    fn tracker_ignores_non_positive_values() {
        let mut tracker = VolTracker::new(8, 96.0);
        tracker.observe(100.0);
        tracker.observe(0.0);
        tracker.observe(100.0);
        assert_eq!(tracker.sample_count(), 0);
        assert_eq!(tracker.regime(), VolRegime::Low);
    }
}
