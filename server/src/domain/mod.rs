//! Domain model
//!
//! Pure types and arithmetic shared by the evaluator, the dispatch
//! pipeline and the HTTP layer:
//! - `duration`: hour/minute conversion, quarter-hour snapping, reminder offsets
//! - `recurring`: repeat patterns and occurrence computation
//! - `condition`: the condition tagged union and panic configuration

pub mod condition;
pub mod duration;
pub mod recurring;

pub use condition::{
    AccessPolicy, CancelWindow, Condition, ConditionKind, Deadline, PanicConfig, PanicMethod,
    Recipient, Trigger,
};
pub use duration::{
    format_duration, snap_minutes_to_quarter, snap_to_quarter_hour, to_hours_and_minutes,
    to_minutes, validate_reminder_offset, HoursMinutes,
};
pub use recurring::{RecurringPattern, RepeatKind};
