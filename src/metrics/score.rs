use serde::{Deserialize, Serialize};

use super::volatility::VolRegime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

/// 0-40 points from LCR coverage. Unbounded coverage scores zero.
pub fn lcr_points(ratio: Option<f64>) -> u8 {
    match ratio {
        None => 0,
        Some(r) if r >= 1.5 => 0,
        Some(r) if r >= 1.2 => 10,
        Some(r) if r >= 1.0 => 20,
        Some(r) if r >= 0.8 => 30,
        Some(_) => 40,
    }
}

/// 0-30 points from average exit half-life. Positions with no exit path
/// score the maximum.
pub fn exit_points(avg_half_life_hours: Option<f64>) -> u8 {
    match avg_half_life_hours {
        Some(h) if h <= 6.0 => 0,
        Some(h) if h <= 24.0 => 10,
        Some(h) if h <= 72.0 => 20,
        Some(_) => 30,
        None => 30,
    }
}

/// 0-30 points from the volatility regime.
pub fn vol_points(regime: VolRegime) -> u8 {
    match regime {
        VolRegime::Low => 0,
        VolRegime::Normal => 8,
        VolRegime::Elevated => 15,
        VolRegime::High => 23,
        VolRegime::Extreme => 30,
    }
}

pub fn risk_score(
    lcr: Option<f64>,
    avg_half_life_hours: Option<f64>,
    regime: VolRegime,
) -> u8 {
    lcr_points(lcr) + exit_points(avg_half_life_hours) + vol_points(regime)
}

pub fn classify(score: u8) -> RiskLevel {
    if score <= 25 {
        RiskLevel::Low
    } else if score <= 50 {
        RiskLevel::Medium
    } else if score <= 75 {
        RiskLevel::High
    } else {
        RiskLevel::Critical
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn healthy_treasury_scores_low() {
        let score = risk_score(Some(1.8), Some(2.0), VolRegime::Low);
        assert_eq!(score, 0);
        assert_eq!(classify(score), RiskLevel::Low);
    }

    #[test]
    fn distressed_treasury_scores_critical() {
        let score = risk_score(Some(0.5), None, VolRegime::Extreme);
        assert_eq!(score, 100);
        assert_eq!(classify(score), RiskLevel::Critical);
    }

    #[test]
    fn level_boundaries_classify_downward() {
        assert_eq!(classify(25), RiskLevel::Low);
        assert_eq!(classify(26), RiskLevel::Medium);
        assert_eq!(classify(50), RiskLevel::Medium);
        assert_eq!(classify(75), RiskLevel::High);
        assert_eq!(classify(76), RiskLevel::Critical);
    }

    #[test]
    fn unbounded_coverage_scores_nothing() {
        assert_eq!(lcr_points(None), 0);
    }
}
