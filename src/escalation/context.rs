use std::time::{Duration, Instant};

use super::Level;
use crate::types::UnixMillis;

/// Mutable carrier for the machine's own state. Budget numbers live in
/// the ledger and are joined in at guard-evaluation time.
#[derive(Debug, Clone)]
pub struct EscalationContext {
    pub level: Level,
    pub entered_at: Instant,
    pub entered_at_wall: UnixMillis,
    pub last_escalation: Option<Instant>,
    pub cooldown: Duration,
    pub paused: bool,
}

impl EscalationContext {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            level: Level::L0Idle,
            entered_at: Instant::now(),
            entered_at_wall: UnixMillis::now(),
            last_escalation: None,
            cooldown,
            paused: false,
        }
    }

    pub fn starting_at(level: Level, cooldown: Duration) -> Self {
        Self {
            level,
            ..Self::new(cooldown)
        }
    }

    /// Time spent at the current level.
    pub fn dwell(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.entered_at)
    }

    pub fn enter(&mut self, level: Level, now: Instant) {
        let escalated = match (self.level.rank(), level.rank()) {
            (Some(from), Some(to)) => to > from,
            _ => false,
        };
        self.level = level;
        self.entered_at = now;
        self.entered_at_wall = UnixMillis::now();
        if escalated {
            self.last_escalation = Some(now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enter_tracks_escalation_time() {
        let mut ctx = EscalationContext::new(Duration::from_secs(300));
        assert_eq!(ctx.level, Level::L0Idle);
        assert!(ctx.last_escalation.is_none());

        let now = Instant::now();
        ctx.enter(Level::L1Monitor, now);
        assert_eq!(ctx.level, Level::L1Monitor);
        assert_eq!(ctx.last_escalation, Some(now));

        // De-escalation does not refresh last_escalation.
        let later = now + Duration::from_secs(10);
        ctx.enter(Level::L0Idle, later);
        assert_eq!(ctx.last_escalation, Some(now));
    }

    #[test]
    fn dwell_measures_current_level() {
        let mut ctx = EscalationContext::new(Duration::from_secs(300));
        let start = Instant::now();
        ctx.enter(Level::L2Alert, start);
        assert!(ctx.dwell(start + Duration::from_secs(60)) >= Duration::from_secs(60));
    }
}
