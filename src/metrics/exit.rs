/// Hours to liquidate half a position at a bounded participation rate of
/// daily volume. `None` means the position cannot be exited (no volume).
pub fn exit_half_life_hours(
    position_usd: f64,
    daily_volume_usd: f64,
    participation_rate: f64,
) -> Option<f64> {
    if daily_volume_usd <= 0.0 || participation_rate <= 0.0 {
        return None;
    }
    if position_usd <= 0.0 {
        return Some(0.0);
    }
    Some((position_usd / 2.0) / (daily_volume_usd * participation_rate) * 24.0)
}

/// Full exit takes twice the half-life.
pub fn full_exit_hours(
    position_usd: f64,
    daily_volume_usd: f64,
    participation_rate: f64,
) -> Option<f64> {
    exit_half_life_hours(position_usd, daily_volume_usd, participation_rate).map(|h| h * 2.0)
}
