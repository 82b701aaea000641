pub mod context;
pub mod guards;
pub mod ledger;
pub mod level;
pub mod machine;

pub use context::EscalationContext;
pub use guards::{Guard, GuardInput};
pub use ledger::TransitionLedger;
pub use level::{Level, Trigger};
pub use machine::{EscalationMachine, PendingTransition, StepOutcome};
