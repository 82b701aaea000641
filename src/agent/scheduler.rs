use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use time::OffsetDateTime;
use tokio::sync::watch;
use tracing::{error, info, warn};

use super::run::Sentinel;
use crate::{errors::SentinelError, types::UnixMillis};

/// One cron field, expanded to its matching values at parse time.
#[derive(Debug, Clone, PartialEq, Eq)]
enum CronField {
    Any,
    Values(Vec<u8>),
}

impl CronField {
    fn matches(&self, value: u8) -> bool {
        match self {
            CronField::Any => true,
            CronField::Values(values) => values.contains(&value),
        }
    }
}

/// Five-field cron schedule (minute, hour, day-of-month, month,
/// day-of-week), UTC. Supports `*`, `*/n`, values, ranges and comma
/// lists; anything else is a startup configuration error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    minute: CronField,
    hour: CronField,
    day_of_month: CronField,
    month: CronField,
    day_of_week: CronField,
}

impl CronSchedule {
    pub fn parse(expression: &str) -> Result<Self, String> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(format!(
                "expected 5 cron fields, got {}",
                fields.len()
            ));
        }
        Ok(Self {
            minute: parse_field(fields[0], 0, 59)?,
            hour: parse_field(fields[1], 0, 23)?,
            day_of_month: parse_field(fields[2], 1, 31)?,
            month: parse_field(fields[3], 1, 12)?,
            day_of_week: parse_field(fields[4], 0, 6)?,
        })
    }

    pub fn matches(&self, t: OffsetDateTime) -> bool {
        self.minute.matches(t.minute())
            && self.hour.matches(t.hour())
            && self.day_of_month.matches(t.day())
            && self.month.matches(u8::from(t.month()))
            && self
                .day_of_week
                .matches(t.weekday().number_days_from_sunday())
    }

    /// First matching minute strictly after `t`.
    pub fn next_after(&self, t: OffsetDateTime) -> OffsetDateTime {
        let mut candidate = t
            .replace_second(0)
            .expect("0 is a valid second")
            .replace_nanosecond(0)
            .expect("0 is a valid nanosecond")
            + time::Duration::minutes(1);
        // A 5-field schedule always fires within 366 days.
        for _ in 0..(366 * 24 * 60) {
            if self.matches(candidate) {
                return candidate;
            }
            candidate += time::Duration::minutes(1);
        }
        candidate
    }

    /// Approximate seconds between consecutive fires, for cadence-derived
    /// parameters like volatility annualization.
    pub fn period_hint(&self) -> Duration {
        let reference = time::macros::datetime!(2024-01-01 00:00 UTC);
        let first = self.next_after(reference);
        let second = self.next_after(first);
        let seconds = (second - first).whole_seconds().max(60);
        Duration::from_secs(seconds as u64)
    }
}

fn parse_field(raw: &str, min: u8, max: u8) -> Result<CronField, String> {
    if raw == "*" {
        return Ok(CronField::Any);
    }
    let mut values = Vec::new();
    for part in raw.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u8 = step
                    .parse()
                    .map_err(|_| format!("bad step in {part:?}"))?;
                if step == 0 {
                    return Err(format!("zero step in {part:?}"));
                }
                (range, step)
            }
            None => (part, 1),
        };
        let (lo, hi) = if range == "*" {
            (min, max)
        } else if let Some((lo, hi)) = range.split_once('-') {
            (
                lo.parse().map_err(|_| format!("bad range in {part:?}"))?,
                hi.parse().map_err(|_| format!("bad range in {part:?}"))?,
            )
        } else {
            let value: u8 = range.parse().map_err(|_| format!("bad value {part:?}"))?;
            // "5/15" means every 15 starting at 5.
            (value, if step > 1 { max } else { value })
        };
        if lo < min || hi > max || lo > hi {
            return Err(format!("value out of range in {part:?} ({min}-{max})"));
        }
        let mut v = lo;
        while v <= hi {
            values.push(v);
            if v.checked_add(step).is_none() {
                break;
            }
            v += step;
        }
    }
    values.sort_unstable();
    values.dedup();
    if values.is_empty() {
        return Err(format!("empty field {raw:?}"));
    }
    Ok(CronField::Values(values))
}

/// Drives the agent on the configured cron cadence. Single-flight: a tick
/// that lands while the previous run is still going is persisted as
/// SKIPPED and nothing else happens.
pub struct Scheduler {
    agent: Arc<Sentinel>,
    schedule: CronSchedule,
    grace_period: Duration,
    shutdown: watch::Receiver<bool>,
}

impl Scheduler {
    pub fn new(
        agent: Arc<Sentinel>,
        schedule: CronSchedule,
        grace_period: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            agent,
            schedule,
            grace_period,
            shutdown,
        }
    }

    pub async fn run(mut self) -> Result<(), SentinelError> {
        let running = Arc::new(AtomicBool::new(false));
        let halt = Arc::new(AtomicBool::new(false));

        loop {
            if *self.shutdown.borrow() || halt.load(Ordering::SeqCst) {
                break;
            }
            let now = OffsetDateTime::now_utc();
            let next = self.schedule.next_after(now);
            let wait = (next - now).whole_milliseconds().max(0) as u64;
            info!(next = %next, "scheduler sleeping until next tick");

            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(wait)) => {}
                _ = self.shutdown.changed() => {
                    info!("scheduler received shutdown");
                    break;
                }
            }

            let scheduled_at = UnixMillis::now();
            if running.swap(true, Ordering::SeqCst) {
                // Already true: the in-flight run owns the flag and will
                // clear it when done.
                warn!("previous run still in flight, skipping tick");
                if let Err(err) = self.agent.record_skip(scheduled_at, "overlap") {
                    error!(error = %err, "failed to persist skipped run");
                    if err.is_fatal() {
                        break;
                    }
                }
                continue;
            }

            let agent = self.agent.clone();
            let running_flag = running.clone();
            let halt_flag = halt.clone();
            tokio::spawn(async move {
                match agent.run_once(scheduled_at).await {
                    Ok(summary) => {
                        info!(
                            run_id = summary.run_id.into_inner(),
                            level_after = %summary.level_after,
                            spend_delta = %summary.spend_delta,
                            transitions = summary.transitions,
                            "run completed"
                        );
                    }
                    Err(err) => {
                        error!(error = %err, "run failed");
                        if err.is_fatal() {
                            halt_flag.store(true, Ordering::SeqCst);
                        }
                    }
                }
                running_flag.store(false, Ordering::SeqCst);
            });
        }

        // Cooperative shutdown: let the in-flight run finish within the
        // grace period, then flush.
        let deadline = tokio::time::Instant::now() + self.grace_period;
        while running.load(Ordering::SeqCst) && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        self.agent.flush()?;
        info!("scheduler stopped");
        Ok(())
    }
}
