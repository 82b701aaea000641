use serde::{Deserialize, Serialize};

use crate::gateway::MarketDepth;

/// Percent distances from mid at which depth is aggregated.
pub const DEPTH_BAND_PERCENTS: [f64; 6] = [0.1, 0.25, 0.5, 1.0, 2.0, 5.0];

/// Notional sizes (USD) at which the impact curve is sampled.
pub const IMPACT_NOTIONALS_USD: [f64; 5] =
    [10_000.0, 50_000.0, 100_000.0, 500_000.0, 1_000_000.0];

/// Aggregate notional liquidity within `percent` of mid, per side.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DepthBand {
    pub percent: f64,
    pub bid_notional: f64,
    pub ask_notional: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ImpactPoint {
    pub notional_usd: f64,
    pub execution_price: f64,
    pub slippage: f64,
    /// Whether the book held enough asks to fill the full size.
    pub filled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImpactCurve {
    pub points: Vec<ImpactPoint>,
    /// Largest notional fully fillable from the ask side.
    pub max_tradeable_usd: f64,
}

/// Sum bid and ask notional inside each band around mid.
pub fn depth_bands(book: &MarketDepth) -> Vec<DepthBand> {
    let mid = book.mid_price;
    DEPTH_BAND_PERCENTS
        .iter()
        .map(|&percent| {
            let low = mid * (1.0 - percent / 100.0);
            let high = mid * (1.0 + percent / 100.0);
            let bid_notional = book
                .bids
                .iter()
                .filter(|level| level.price >= low)
                .map(|level| level.price * level.quantity)
                .sum();
            let ask_notional = book
                .asks
                .iter()
                .filter(|level| level.price <= high)
                .map(|level| level.price * level.quantity)
                .sum();
            DepthBand {
                percent,
                bid_notional,
                ask_notional,
            }
        })
        .collect()
}

/// Walk the sorted ask side filling each target notional. Execution price
/// is total cost over total quantity; slippage is measured against mid.
pub fn impact_curve(book: &MarketDepth) -> ImpactCurve {
    let mid = book.mid_price;
    let mut asks: Vec<_> = book.asks.clone();
    asks.sort_by(|a, b| a.price.partial_cmp(&b.price).unwrap_or(std::cmp::Ordering::Equal));

    let max_tradeable_usd = asks.iter().map(|l| l.price * l.quantity).sum();

    let points = IMPACT_NOTIONALS_USD
        .iter()
        .map(|&target| {
            let mut remaining = target;
            let mut total_cost = 0.0;
            let mut total_qty = 0.0;
            for level in &asks {
                if remaining <= 0.0 {
                    break;
                }
                let level_notional = level.price * level.quantity;
                let take_notional = level_notional.min(remaining);
                let take_qty = take_notional / level.price;
                total_cost += take_notional;
                total_qty += take_qty;
                remaining -= take_notional;
            }
            let filled = remaining <= 1e-9;
            let execution_price = if total_qty > 0.0 {
                total_cost / total_qty
            } else {
                0.0
            };
            let slippage = if mid > 0.0 && total_qty > 0.0 {
                (execution_price - mid) / mid
            } else {
                0.0
            };
            ImpactPoint {
                notional_usd: target,
                execution_price,
                slippage,
                filled,
            }
        })
        .collect();

    ImpactCurve {
        points,
        max_tradeable_usd,
    }
}
