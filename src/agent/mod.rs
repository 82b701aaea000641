pub mod replay;
pub mod run;
pub mod scheduler;

pub use replay::{replay, ReplayReport};
pub use run::{RunSummary, Sentinel, SentinelStatus};
pub use scheduler::{CronSchedule, Scheduler};
