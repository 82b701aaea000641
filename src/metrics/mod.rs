pub mod depth;
pub mod exit;
pub mod lcr;
pub mod score;
pub mod volatility;

use std::{collections::HashMap, sync::Mutex};

use alloy_primitives::Address;
use serde::{Deserialize, Serialize};

use crate::{
    chain::treasury::TreasurySnapshot,
    config::RiskConfig,
    gateway::MarketDepth,
};
use depth::{DepthBand, ImpactCurve};
use score::RiskLevel;
use volatility::{VolRegime, VolTracker};

/// Exit characteristics of one position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionExit {
    pub symbol: String,
    pub position_usd: f64,
    /// `None` when the position has no exit path (zero volume).
    pub half_life_hours: Option<f64>,
}

/// Risk metrics attached to one run. Pure data; recomputable from the
/// snapshot plus whatever market data the run purchased.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    /// `None` means no net projected outflows (unbounded coverage).
    pub lcr: Option<f64>,
    pub total_value_usd: f64,
    pub positions: Vec<PositionExit>,
    pub avg_half_life_hours: Option<f64>,
    pub annualized_volatility: Option<f64>,
    pub regime: VolRegime,
    pub depth_bands: Option<Vec<DepthBand>>,
    pub impact: Option<ImpactCurve>,
    pub risk_score: u8,
    pub risk_level: RiskLevel,
}

impl Metrics {
    /// Fold freshly purchased depth data into the metrics without
    /// advancing the volatility window.
    pub fn attach_depth(&mut self, book: &MarketDepth) {
        self.depth_bands = Some(depth::depth_bands(book));
        self.impact = Some(depth::impact_curve(book));
    }

    /// Smallest combined band notional at 1 % from mid, used by the depth
    /// crisis guard.
    pub fn depth_at_one_percent(&self) -> Option<f64> {
        self.depth_bands.as_ref().and_then(|bands| {
            bands
                .iter()
                .find(|band| (band.percent - 1.0).abs() < f64::EPSILON)
                .map(|band| band.bid_notional + band.ask_notional)
        })
    }
}

/// Deterministic metric computation plus the rolling volatility window
/// carried across runs.
pub struct MetricEngine {
    risk: RiskConfig,
    daily_volume_usd: HashMap<Address, f64>,
    tracker: Mutex<VolTracker>,
}

impl MetricEngine {
    pub fn new(
        risk: RiskConfig,
        daily_volume_usd: HashMap<Address, f64>,
        samples_per_day: f64,
    ) -> Self {
        let tracker = VolTracker::new(risk.vol_lookback, samples_per_day);
        Self {
            risk,
            daily_volume_usd,
            tracker: Mutex::new(tracker),
        }
    }

    /// Compute metrics for one run. Advances the volatility window by one
    /// observation; everything else is a pure function of the inputs.
    pub fn compute(
        &self,
        snapshots: &[TreasurySnapshot],
        market_depth: Option<&MarketDepth>,
    ) -> Metrics {
        let total_value_usd: f64 = snapshots.iter().map(|s| s.total_usd()).sum();

        let (annualized, regime) = {
            let mut tracker = self.tracker.lock().expect("vol tracker lock");
            tracker.observe(total_value_usd);
            (tracker.annualized(), tracker.regime())
        };

        let lcr = lcr::liquidity_coverage_ratio(
            total_value_usd,
            self.risk.projected_outflows_usd,
            self.risk.projected_inflows_usd,
        );

        let mut positions = Vec::new();
        for snapshot in snapshots {
            for balance in &snapshot.balances {
                let Some(position_usd) = balance.usd_value else {
                    continue;
                };
                let volume = self
                    .daily_volume_usd
                    .get(&balance.token)
                    .copied()
                    .unwrap_or(0.0);
                positions.push(PositionExit {
                    symbol: balance.symbol.clone(),
                    position_usd,
                    half_life_hours: exit::exit_half_life_hours(
                        position_usd,
                        volume,
                        self.risk.participation_rate,
                    ),
                });
            }
        }

        let finite: Vec<f64> = positions
            .iter()
            .filter_map(|p| p.half_life_hours)
            .collect();
        let avg_half_life_hours = if positions.is_empty() {
            Some(0.0)
        } else if finite.len() < positions.len() {
            // Any inescapable position dominates the average.
            None
        } else if finite.is_empty() {
            Some(0.0)
        } else {
            Some(finite.iter().sum::<f64>() / finite.len() as f64)
        };

        let depth_bands = market_depth.map(depth::depth_bands);
        let impact = market_depth.map(depth::impact_curve);

        let risk_score = score::risk_score(lcr, avg_half_life_hours, regime);

        Metrics {
            lcr,
            total_value_usd,
            positions,
            avg_half_life_hours,
            annualized_volatility: annualized,
            regime,
            depth_bands,
            impact,
            risk_score,
            risk_level: score::classify(risk_score),
        }
    }

    pub fn risk_config(&self) -> &RiskConfig {
        &self.risk
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::treasury::TokenBalance;
    use crate::gateway::BookLevel;
    use crate::types::{ChainId, UnixMillis};
    use alloy_primitives::U256;

    fn snapshot(usd: f64) -> TreasurySnapshot {
        TreasurySnapshot {
            chain_id: ChainId::new(8453),
            wallet: Address::repeat_byte(0xaa),
            block_number: 100,
            taken_at: UnixMillis::new(0),
            balances: vec![TokenBalance {
                token: Address::repeat_byte(0x01),
                symbol: "USDC".to_string(),
                decimals: 6,
                raw_balance: U256::from((usd * 1e6) as u64),
                usd_value: Some(usd),
            }],
        }
    }

    fn engine(outflows: f64) -> MetricEngine {
        let risk = RiskConfig {
            projected_outflows_usd: outflows,
            ..RiskConfig::default()
        };
        let volumes = HashMap::from([(Address::repeat_byte(0x01), 1_000_000.0)]);
        MetricEngine::new(risk, volumes, 96.0)
    }

    #[test]
    fn aggregates_portfolio_value() {
        let engine = engine(0.0);
        let metrics = engine.compute(&[snapshot(500_000.0), snapshot(250_000.0)], None);
        assert!((metrics.total_value_usd - 750_000.0).abs() < 1e-6);
        assert_eq!(metrics.positions.len(), 2);
        assert_eq!(metrics.lcr, None);
    }

    #[test]
    fn lcr_uses_configured_outflows() {
        let engine = engine(1_000_000.0);
        let metrics = engine.compute(&[snapshot(1_300_000.0)], None);
        let ratio = metrics.lcr.unwrap();
        assert!((ratio - 1.3).abs() < 1e-9);
    }

    #[test]
    fn unknown_volume_makes_position_inescapable() {
        let risk = RiskConfig::default();
        let engine = MetricEngine::new(risk, HashMap::new(), 96.0);
        let metrics = engine.compute(&[snapshot(100_000.0)], None);
        assert_eq!(metrics.positions[0].half_life_hours, None);
        assert_eq!(metrics.avg_half_life_hours, None);
    }

    #[test]
    fn depth_metrics_only_with_market_data() {
        let engine = engine(0.0);
        let book = MarketDepth {
            mid_price: 100.0,
            bids: vec![BookLevel { price: 99.5, quantity: 100.0 }],
            asks: vec![BookLevel { price: 100.5, quantity: 100.0 }],
        };
        let without = engine.compute(&[snapshot(100.0)], None);
        assert!(without.depth_bands.is_none());
        let with = engine.compute(&[snapshot(100.0)], Some(&book));
        assert_eq!(with.depth_bands.as_ref().unwrap().len(), 6);
        assert!(with.depth_at_one_percent().unwrap() > 0.0);
        assert!(with.impact.is_some());
    }
}
