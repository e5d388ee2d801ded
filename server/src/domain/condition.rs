//! Delivery conditions
//!
//! Stored rows carry a `condition_type` string plus a loose bag of optional
//! columns. They are parsed once into [`Condition`], whose [`Trigger`] holds
//! exactly the fields each kind needs, so evaluation and post-delivery
//! handling are exhaustive matches rather than string switches.

use crate::config::{DEFAULT_CANCEL_WINDOW_SECS, VALID_CANCEL_WINDOWS};
use crate::database::ConditionRow;
use crate::domain::recurring::RecurringPattern;
use crate::error::{AppError, ValidationError};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionKind {
    NoCheckIn,
    RegularCheckIn,
    #[serde(alias = "specific_date")]
    ScheduledDate,
    InactivityToDate,
    InactivityToRecurring,
    RecurringCheckIn,
    GroupConfirmation,
    PanicTrigger,
}

impl ConditionKind {
    pub const ALL: [ConditionKind; 8] = [
        ConditionKind::NoCheckIn,
        ConditionKind::RegularCheckIn,
        ConditionKind::ScheduledDate,
        ConditionKind::InactivityToDate,
        ConditionKind::InactivityToRecurring,
        ConditionKind::RecurringCheckIn,
        ConditionKind::GroupConfirmation,
        ConditionKind::PanicTrigger,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ConditionKind::NoCheckIn => "no_check_in",
            ConditionKind::RegularCheckIn => "regular_check_in",
            ConditionKind::ScheduledDate => "scheduled_date",
            ConditionKind::InactivityToDate => "inactivity_to_date",
            ConditionKind::InactivityToRecurring => "inactivity_to_recurring",
            ConditionKind::RecurringCheckIn => "recurring_check_in",
            ConditionKind::GroupConfirmation => "group_confirmation",
            ConditionKind::PanicTrigger => "panic_trigger",
        }
    }
}

impl fmt::Display for ConditionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConditionKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim() {
            "specific_date" => Ok(ConditionKind::ScheduledDate),
            other => ConditionKind::ALL
                .into_iter()
                .find(|kind| kind.as_str() == other)
                .ok_or_else(|| format!("Unknown condition type: {}", other)),
        }
    }
}

/// A person who receives the message once the condition fires
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    pub id: String,
    pub name: String,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PanicMethod {
    App,
    Whatsapp,
}

/// Seconds between arming a panic trigger and sending; one of
/// {0, 5, 10, 15, 30, 60}
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct CancelWindow(u32);

impl CancelWindow {
    pub fn new(seconds: u32) -> Result<Self, ValidationError> {
        if VALID_CANCEL_WINDOWS.contains(&seconds) {
            Ok(Self(seconds))
        } else {
            Err(ValidationError::InvalidCancelWindow(seconds))
        }
    }

    pub fn seconds(&self) -> u32 {
        self.0
    }

    pub fn duration(&self) -> Duration {
        Duration::seconds(i64::from(self.0))
    }
}

impl Default for CancelWindow {
    fn default() -> Self {
        Self(DEFAULT_CANCEL_WINDOW_SECS)
    }
}

impl TryFrom<u32> for CancelWindow {
    type Error = ValidationError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<CancelWindow> for u32 {
    fn from(window: CancelWindow) -> Self {
        window.0
    }
}

fn default_true() -> bool {
    true
}

fn default_methods() -> Vec<PanicMethod> {
    vec![PanicMethod::App]
}

/// Panic trigger settings. Immutable; every update returns a new value
/// that has been validated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PanicConfig {
    #[serde(default = "default_true")]
    enabled: bool,
    #[serde(default = "default_methods")]
    methods: Vec<PanicMethod>,
    #[serde(default)]
    cancel_window_seconds: CancelWindow,
    #[serde(default)]
    bypass_logging: bool,
    /// Stays armed after firing unless explicitly turned off
    #[serde(default = "default_true")]
    keep_armed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    trigger_keyword: Option<String>,
}

impl Default for PanicConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            methods: default_methods(),
            cancel_window_seconds: CancelWindow::default(),
            bypass_logging: false,
            keep_armed: true,
            trigger_keyword: None,
        }
    }
}

impl PanicConfig {
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn methods(&self) -> &[PanicMethod] {
        &self.methods
    }

    pub fn supports(&self, method: PanicMethod) -> bool {
        self.methods.contains(&method)
    }

    pub fn cancel_window(&self) -> CancelWindow {
        self.cancel_window_seconds
    }

    pub fn bypass_logging(&self) -> bool {
        self.bypass_logging
    }

    pub fn keep_armed(&self) -> bool {
        self.keep_armed
    }

    pub fn trigger_keyword(&self) -> Option<&str> {
        self.trigger_keyword.as_deref()
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.enabled && self.methods.is_empty() {
            return Err(ValidationError::NoPanicMethods);
        }
        Ok(())
    }

    pub fn with_enabled(&self, enabled: bool) -> Result<Self, ValidationError> {
        self.updated(|c| c.enabled = enabled)
    }

    pub fn with_methods(&self, methods: &[PanicMethod]) -> Result<Self, ValidationError> {
        let mut unique: Vec<PanicMethod> = Vec::with_capacity(methods.len());
        for method in methods {
            if !unique.contains(method) {
                unique.push(*method);
            }
        }
        self.updated(|c| c.methods = unique)
    }

    pub fn with_cancel_window(&self, seconds: u32) -> Result<Self, ValidationError> {
        let window = CancelWindow::new(seconds)?;
        self.updated(|c| c.cancel_window_seconds = window)
    }

    pub fn with_bypass_logging(&self, bypass: bool) -> Result<Self, ValidationError> {
        self.updated(|c| c.bypass_logging = bypass)
    }

    pub fn with_keep_armed(&self, keep_armed: bool) -> Result<Self, ValidationError> {
        self.updated(|c| c.keep_armed = keep_armed)
    }

    pub fn with_trigger_keyword(&self, keyword: Option<&str>) -> Result<Self, ValidationError> {
        let keyword = keyword
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(str::to_string);
        self.updated(|c| c.trigger_keyword = keyword)
    }

    fn updated<F>(&self, apply: F) -> Result<Self, ValidationError>
    where
        F: FnOnce(&mut Self),
    {
        let mut next = self.clone();
        apply(&mut next);
        next.validate()?;
        Ok(next)
    }
}

/// Offset of a deadline from the owner's last check-in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    pub hours: i64,
    pub minutes: i64,
}

impl Deadline {
    pub fn new(hours: i64, minutes: i64) -> Self {
        Self { hours, minutes }
    }

    pub fn total_minutes(&self) -> i64 {
        self.hours.saturating_mul(60).saturating_add(self.minutes)
    }

    /// `None` when the offset does not fit a `Duration`
    pub fn duration(&self) -> Option<Duration> {
        Duration::try_minutes(self.total_minutes())
    }

    /// `None` when the deadline falls outside the representable calendar
    pub fn due_at(&self, last_checked: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.duration()
            .and_then(|offset| last_checked.checked_add_signed(offset))
    }
}

/// What makes a condition fire
#[derive(Debug, Clone, PartialEq)]
pub enum Trigger {
    NoCheckIn {
        deadline: Deadline,
    },
    RegularCheckIn {
        deadline: Deadline,
    },
    ScheduledDate {
        trigger_date: DateTime<Utc>,
        pattern: Option<RecurringPattern>,
    },
    InactivityToDate {
        trigger_date: DateTime<Utc>,
    },
    InactivityToRecurring {
        deadline: Deadline,
        pattern: RecurringPattern,
    },
    RecurringCheckIn {
        pattern: Option<RecurringPattern>,
        next_check: Option<DateTime<Utc>>,
    },
    GroupConfirmation {
        required: u32,
        confirmations: u32,
    },
    PanicTrigger {
        config: PanicConfig,
    },
}

impl Trigger {
    pub fn kind(&self) -> ConditionKind {
        match self {
            Trigger::NoCheckIn { .. } => ConditionKind::NoCheckIn,
            Trigger::RegularCheckIn { .. } => ConditionKind::RegularCheckIn,
            Trigger::ScheduledDate { .. } => ConditionKind::ScheduledDate,
            Trigger::InactivityToDate { .. } => ConditionKind::InactivityToDate,
            Trigger::InactivityToRecurring { .. } => ConditionKind::InactivityToRecurring,
            Trigger::RecurringCheckIn { .. } => ConditionKind::RecurringCheckIn,
            Trigger::GroupConfirmation { .. } => ConditionKind::GroupConfirmation,
            Trigger::PanicTrigger { .. } => ConditionKind::PanicTrigger,
        }
    }

    pub fn pattern(&self) -> Option<&RecurringPattern> {
        match self {
            Trigger::ScheduledDate { pattern, .. } | Trigger::RecurringCheckIn { pattern, .. } => {
                pattern.as_ref()
            }
            Trigger::InactivityToRecurring { pattern, .. } => Some(pattern),
            _ => None,
        }
    }
}

/// View-time gates on a delivered message
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessPolicy {
    pub pin_code: Option<String>,
    pub unlock_delay_hours: Option<i64>,
    pub expiry_hours: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub id: String,
    pub message_id: String,
    pub active: bool,
    pub last_checked: DateTime<Utc>,
    pub trigger: Trigger,
    /// Minutes before the deadline at which the owner is nudged
    pub reminder_offsets: Vec<u32>,
    pub recipients: Vec<Recipient>,
    pub whatsapp_enabled: bool,
    pub access: AccessPolicy,
}

impl Condition {
    pub fn kind(&self) -> ConditionKind {
        self.trigger.kind()
    }

    /// Inactivity deadline for kinds that have one
    pub fn deadline_at(&self) -> Option<DateTime<Utc>> {
        match &self.trigger {
            Trigger::NoCheckIn { deadline }
            | Trigger::RegularCheckIn { deadline }
            | Trigger::InactivityToRecurring { deadline, .. } => {
                deadline.due_at(self.last_checked)
            }
            Trigger::InactivityToDate { trigger_date } => Some(*trigger_date),
            Trigger::ScheduledDate { .. }
            | Trigger::RecurringCheckIn { .. }
            | Trigger::GroupConfirmation { .. }
            | Trigger::PanicTrigger { .. } => None,
        }
    }

    pub fn panic_config(&self) -> Option<&PanicConfig> {
        match &self.trigger {
            Trigger::PanicTrigger { config } => Some(config),
            _ => None,
        }
    }

    pub fn has_recipient_email(&self, email: &str) -> bool {
        self.recipients
            .iter()
            .any(|r| r.email.eq_ignore_ascii_case(email.trim()))
    }

    /// Next `next_check` value for recurring check-ins, anchored at the
    /// last check-in
    pub fn next_recurring_check(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match &self.trigger {
            Trigger::RecurringCheckIn {
                pattern: Some(pattern),
                ..
            } => pattern.next_occurrence(after, self.last_checked),
            _ => None,
        }
    }

    /// Parse a stored row. Incomplete rows are reported as
    /// [`AppError::InvalidCondition`].
    pub fn from_row(row: &ConditionRow) -> Result<Self, AppError> {
        let invalid = |reason: String| AppError::InvalidCondition {
            id: row.id.clone(),
            reason,
        };

        let kind: ConditionKind = row.condition_type.parse().map_err(invalid)?;

        let pattern: Option<RecurringPattern> = match row.recurring_pattern.as_deref() {
            Some(raw) if !raw.trim().is_empty() && raw.trim() != "null" => {
                let pattern: RecurringPattern = serde_json::from_str(raw)
                    .map_err(|e| invalid(format!("recurring_pattern: {}", e)))?;
                pattern
                    .validate()
                    .map_err(|e| invalid(format!("recurring_pattern: {}", e)))?;
                Some(pattern)
            }
            _ => None,
        };

        let deadline = || -> Result<Deadline, AppError> {
            match (row.hours_threshold, row.minutes_threshold) {
                (None, None) => Err(invalid(format!("{} has no threshold", kind))),
                (hours, minutes) => {
                    let deadline = Deadline::new(hours.unwrap_or(0), minutes.unwrap_or(0));
                    if deadline.due_at(row.last_checked).is_none() {
                        return Err(invalid(format!(
                            "threshold of {} minutes is out of range",
                            deadline.total_minutes()
                        )));
                    }
                    Ok(deadline)
                }
            }
        };

        let trigger_date = || {
            row.trigger_date
                .ok_or_else(|| invalid(format!("{} has no trigger_date", kind)))
        };

        let recipients: Vec<Recipient> = decode_json_list(&row.recipients)
            .map_err(|e| invalid(format!("recipients: {}", e)))?;

        let trigger = match kind {
            ConditionKind::NoCheckIn => Trigger::NoCheckIn {
                deadline: deadline()?,
            },
            ConditionKind::RegularCheckIn => Trigger::RegularCheckIn {
                deadline: deadline()?,
            },
            ConditionKind::ScheduledDate => Trigger::ScheduledDate {
                trigger_date: trigger_date()?,
                pattern,
            },
            ConditionKind::InactivityToDate => Trigger::InactivityToDate {
                trigger_date: trigger_date()?,
            },
            ConditionKind::InactivityToRecurring => Trigger::InactivityToRecurring {
                deadline: deadline()?,
                pattern: RecurringPattern::resolve(pattern, true, true).unwrap_or_default(),
            },
            ConditionKind::RecurringCheckIn => {
                if pattern.is_none() && row.next_check.is_none() {
                    return Err(invalid(
                        "recurring_check_in needs next_check or a recurring_pattern".to_string(),
                    ));
                }
                Trigger::RecurringCheckIn {
                    pattern,
                    next_check: row.next_check,
                }
            }
            ConditionKind::GroupConfirmation => {
                let required = match row.confirmation_threshold {
                    Some(n) if n > 0 => u32::try_from(n).unwrap_or(u32::MAX),
                    _ => u32::try_from(recipients.len()).unwrap_or(u32::MAX),
                };
                if required == 0 {
                    return Err(invalid("group_confirmation has no recipients".to_string()));
                }
                Trigger::GroupConfirmation {
                    required,
                    confirmations: u32::try_from(row.confirmation_count.max(0)).unwrap_or(0),
                }
            }
            ConditionKind::PanicTrigger => {
                let config = match row.panic_config.as_deref() {
                    Some(raw) if !raw.trim().is_empty() && raw.trim() != "null" => {
                        serde_json::from_str::<PanicConfig>(raw)
                            .map_err(|e| invalid(format!("panic_config: {}", e)))?
                    }
                    _ => PanicConfig::default(),
                };
                Trigger::PanicTrigger { config }
            }
        };

        let reminder_hours: Vec<u32> = decode_json_list(&row.reminder_hours)
            .map_err(|e| invalid(format!("reminder_hours: {}", e)))?;
        let reminder_minutes: Vec<u32> = decode_json_list(&row.reminder_minutes)
            .map_err(|e| invalid(format!("reminder_minutes: {}", e)))?;
        let mut reminder_offsets: Vec<u32> = reminder_hours
            .into_iter()
            .map(|h| h.saturating_mul(60))
            .chain(reminder_minutes)
            .filter(|m| *m > 0)
            .collect();
        reminder_offsets.sort_unstable();
        reminder_offsets.dedup();

        Ok(Self {
            id: row.id.clone(),
            message_id: row.message_id.clone(),
            active: row.active,
            last_checked: row.last_checked,
            trigger,
            reminder_offsets,
            recipients,
            whatsapp_enabled: row.whatsapp_enabled,
            access: AccessPolicy {
                pin_code: row.pin_code.clone().filter(|p| !p.trim().is_empty()),
                unlock_delay_hours: row.unlock_delay_hours.filter(|h| *h > 0),
                expiry_hours: row.expiry_hours.filter(|h| *h > 0),
            },
        })
    }
}

fn decode_json_list<T>(raw: &str) -> Result<Vec<T>, serde_json::Error>
where
    T: serde::de::DeserializeOwned,
{
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed == "null" {
        return Ok(Vec::new());
    }
    serde_json::from_str(trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_row(kind: &str) -> ConditionRow {
        let now = Utc::now();
        ConditionRow {
            id: "cond-1".to_string(),
            message_id: "msg-1".to_string(),
            condition_type: kind.to_string(),
            active: true,
            hours_threshold: Some(24),
            minutes_threshold: Some(0),
            last_checked: now,
            next_check: None,
            trigger_date: None,
            recurring_pattern: None,
            reminder_hours: "[]".to_string(),
            reminder_minutes: "[]".to_string(),
            panic_config: None,
            recipients: r#"[{"id":"r1","name":"Ana","email":"ana@example.com"}]"#.to_string(),
            whatsapp_enabled: false,
            confirmation_threshold: None,
            confirmation_count: 0,
            pin_code: None,
            unlock_delay_hours: None,
            expiry_hours: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_kind_parsing_accepts_alias() {
        assert_eq!(
            "specific_date".parse::<ConditionKind>(),
            Ok(ConditionKind::ScheduledDate)
        );
        for kind in ConditionKind::ALL {
            assert_eq!(kind.as_str().parse::<ConditionKind>(), Ok(kind));
        }
        assert!("weekly_lottery".parse::<ConditionKind>().is_err());
    }

    #[test]
    fn test_cancel_window_is_constrained() {
        assert!(CancelWindow::new(30).is_ok());
        assert_eq!(
            CancelWindow::new(20),
            Err(ValidationError::InvalidCancelWindow(20))
        );
        assert!(serde_json::from_str::<PanicConfig>(r#"{"cancel_window_seconds":7}"#).is_err());
    }

    #[test]
    fn test_panic_config_updates_are_validated() {
        let config = PanicConfig::default();
        assert!(config.keep_armed());

        let updated = config.with_cancel_window(60).unwrap();
        assert_eq!(updated.cancel_window().seconds(), 60);
        assert_eq!(config.cancel_window().seconds(), DEFAULT_CANCEL_WINDOW_SECS);

        assert_eq!(
            config.with_methods(&[]),
            Err(ValidationError::NoPanicMethods)
        );
        let disabled = config.with_enabled(false).unwrap();
        assert!(disabled.with_methods(&[]).is_ok());

        let both = config
            .with_methods(&[PanicMethod::App, PanicMethod::Whatsapp, PanicMethod::App])
            .unwrap();
        assert_eq!(both.methods().len(), 2);
        assert!(both.supports(PanicMethod::Whatsapp));

        let keyword = config.with_trigger_keyword(Some("  HELP ")).unwrap();
        assert_eq!(keyword.trigger_keyword(), Some("HELP"));
    }

    #[test]
    fn test_panic_config_keep_armed_defaults_true() {
        let config: PanicConfig = serde_json::from_str(r#"{"enabled":true}"#).unwrap();
        assert!(config.keep_armed());
        let config: PanicConfig = serde_json::from_str(r#"{"keep_armed":false}"#).unwrap();
        assert!(!config.keep_armed());
    }

    #[test]
    fn test_from_row_rejects_unrepresentable_threshold() {
        let mut row = base_row("no_check_in");
        row.hours_threshold = Some(200_000_000_000);
        assert!(matches!(
            Condition::from_row(&row),
            Err(AppError::InvalidCondition { .. })
        ));

        row.hours_threshold = Some(i64::MAX);
        row.minutes_threshold = Some(i64::MAX);
        assert!(Condition::from_row(&row).is_err());
    }

    #[test]
    fn test_from_row_no_check_in() {
        let mut row = base_row("no_check_in");
        row.reminder_hours = "[1, 2]".to_string();
        row.reminder_minutes = "[30, 60]".to_string();
        let condition = Condition::from_row(&row).unwrap();
        assert_eq!(condition.kind(), ConditionKind::NoCheckIn);
        assert_eq!(condition.reminder_offsets, vec![30, 60, 120]);
        assert_eq!(
            condition.deadline_at(),
            Some(row.last_checked + Duration::hours(24))
        );
        assert_eq!(condition.recipients.len(), 1);
        assert!(condition.has_recipient_email("ANA@example.com"));
    }

    #[test]
    fn test_from_row_rejects_incomplete() {
        let mut row = base_row("no_check_in");
        row.hours_threshold = None;
        row.minutes_threshold = None;
        assert!(matches!(
            Condition::from_row(&row),
            Err(AppError::InvalidCondition { .. })
        ));

        let row = base_row("scheduled_date");
        assert!(Condition::from_row(&row).is_err());

        let row = base_row("recurring_check_in");
        assert!(Condition::from_row(&row).is_err());

        let row = base_row("mystery");
        assert!(Condition::from_row(&row).is_err());

        let mut row = base_row("no_check_in");
        row.recipients = "{not json".to_string();
        assert!(Condition::from_row(&row).is_err());
    }

    #[test]
    fn test_from_row_group_confirmation_defaults_to_all() {
        let mut row = base_row("group_confirmation");
        row.recipients = r#"[{"id":"a","name":"A","email":"a@x"},{"id":"b","name":"B","email":"b@x"}]"#
            .to_string();
        row.confirmation_count = 1;
        let condition = Condition::from_row(&row).unwrap();
        assert_eq!(
            condition.trigger,
            Trigger::GroupConfirmation {
                required: 2,
                confirmations: 1
            }
        );
    }

    #[test]
    fn test_from_row_inactivity_to_recurring_gets_default_pattern() {
        let row = base_row("inactivity_to_recurring");
        let condition = Condition::from_row(&row).unwrap();
        assert_eq!(
            condition.trigger.pattern(),
            Some(&RecurringPattern::default())
        );
    }
}
