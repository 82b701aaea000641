/// Liquidity coverage ratio: high-quality liquid assets over net projected
/// 30-day outflows. Inflows offset at most 75 % of outflows. `None` means
/// the denominator is zero and coverage is unbounded.
pub fn liquidity_coverage_ratio(
    hqla: f64,
    projected_outflows: f64,
    projected_inflows: f64,
) -> Option<f64> {
    let capped_inflows = projected_inflows.min(0.75 * projected_outflows);
    let net_outflows = (projected_outflows - capped_inflows).max(0.0);
    if net_outflows <= 0.0 {
        None
    } else {
        Some(hqla / net_outflows)
    }
}

pub fn is_compliant(ratio: Option<f64>, threshold: f64) -> bool {
    match ratio {
        Some(ratio) => ratio >= threshold,
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_ratio() {
        let ratio = liquidity_coverage_ratio(1_300_000.0, 1_000_000.0, 0.0).unwrap();
        assert!((ratio - 1.3).abs() < 1e-9);
    }

    #[test]
    fn inflows_capped_at_three_quarters() {
        // Inflows of 2M against 1M outflows still leave 250k net.
        let ratio = liquidity_coverage_ratio(500_000.0, 1_000_000.0, 2_000_000.0).unwrap();
        assert!((ratio - 2.0).abs() < 1e-9);
    }

    #[test]
    fn zero_outflows_is_unbounded() {
        assert_eq!(liquidity_coverage_ratio(100.0, 0.0, 0.0), None);
        assert!(is_compliant(None, 1.0));
    }

    #[test]
    fn compliance_threshold() {
        assert!(is_compliant(Some(1.0), 1.0));
        assert!(!is_compliant(Some(0.99), 1.0));
    }
}
