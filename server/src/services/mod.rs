//! Services module
//!
//! Business logic services that coordinate between the HTTP handlers and
//! the repository.

pub mod access;
pub mod check_in;
pub mod dedup;
pub mod dispatch;
pub mod evaluator;
pub mod panic;
pub mod reminders;
pub mod runner;
pub mod scheduler;

pub use access::AccessService;
pub use check_in::CheckInService;
pub use dedup::{DedupGuard, DedupStore, InMemoryDedupStore, SqlDedupStore};
pub use dispatch::DispatchService;
pub use evaluator::EvaluatorService;
pub use panic::PanicTriggerService;
pub use reminders::RemindersService;
pub use runner::NotificationRunner;
pub use scheduler::{SchedulerService, TriggerSchedule};
