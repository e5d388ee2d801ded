//! Creator reminders
//!
//! Nudges the owner of a message to check in before an inactivity
//! deadline passes. Each reminder offset yields one entry at
//! `deadline - offset`; entries are keyed by the deadline they belong to, so
//! a check-in (which moves the deadline) re-arms them.

use crate::clock::SharedClock;
use crate::database::Repository;
use crate::domain::{Condition, Trigger};
use crate::error::{AppError, Result};
use crate::providers::EmailProvider;
use crate::templates;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReminderEntry {
    pub offset_minutes: u32,
    pub deadline: DateTime<Utc>,
    pub reminder_at: DateTime<Utc>,
}

/// Reminder entries of a condition, soonest first. Only kinds driven by an
/// inactivity deadline produce any.
pub fn reminder_schedule(condition: &Condition) -> Vec<ReminderEntry> {
    let deadline = match &condition.trigger {
        Trigger::NoCheckIn { .. }
        | Trigger::RegularCheckIn { .. }
        | Trigger::InactivityToDate { .. }
        | Trigger::InactivityToRecurring { .. } => condition.deadline_at(),
        Trigger::ScheduledDate { .. }
        | Trigger::RecurringCheckIn { .. }
        | Trigger::GroupConfirmation { .. }
        | Trigger::PanicTrigger { .. } => None,
    };
    let Some(deadline) = deadline else {
        return Vec::new();
    };

    let mut entries: Vec<ReminderEntry> = condition
        .reminder_offsets
        .iter()
        .filter_map(|offset| {
            let reminder_at = deadline.checked_sub_signed(Duration::minutes(i64::from(*offset)))?;
            Some(ReminderEntry {
                offset_minutes: *offset,
                deadline,
                reminder_at,
            })
        })
        .collect();
    entries.sort_by_key(|e| e.reminder_at);
    entries
}

/// Entries whose time has come while the deadline is still ahead
pub fn due_reminders(condition: &Condition, now: DateTime<Utc>) -> Vec<ReminderEntry> {
    reminder_schedule(condition)
        .into_iter()
        .filter(|e| e.reminder_at <= now && now < e.deadline)
        .collect()
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReminderReport {
    pub sent: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Reminder service
#[derive(Clone)]
pub struct RemindersService {
    repo: Repository,
    clock: SharedClock,
    email: Arc<dyn EmailProvider>,
}

impl RemindersService {
    pub fn new(repo: Repository, clock: SharedClock, email: Arc<dyn EmailProvider>) -> Self {
        Self { repo, clock, email }
    }

    /// Send every reminder that is due and not yet sent.
    ///
    /// When several entries of one condition are due at once only the one
    /// closest to the deadline is emailed; the others are recorded as sent.
    pub async fn send_due_reminders(&self) -> Result<ReminderReport> {
        let now = self.clock.now();
        let mut report = ReminderReport::default();

        for row in self.repo.list_conditions(true).await? {
            let condition = match Condition::from_row(&row) {
                Ok(condition) => condition,
                Err(e) => {
                    tracing::warn!("Skipping condition: {}", e);
                    continue;
                }
            };

            let mut pending = Vec::new();
            for entry in due_reminders(&condition, now) {
                if !self
                    .repo
                    .reminder_sent(&condition.id, entry.offset_minutes, entry.deadline)
                    .await?
                {
                    pending.push(entry);
                }
            }
            // Latest reminder_at is the smallest offset.
            let Some(latest) = pending.last().cloned() else {
                continue;
            };

            let message = match self.repo.get_message(&condition.message_id).await {
                Ok(message) => message,
                Err(AppError::MessageNotFound(id)) => {
                    tracing::warn!("Condition {} points at missing message {}", condition.id, id);
                    report.skipped += 1;
                    continue;
                }
                Err(e) => return Err(e),
            };
            let email = match self.repo.get_profile(&message.user_id).await? {
                Some(profile) => profile.email.filter(|e| !e.trim().is_empty()),
                None => None,
            };
            let Some(email) = email else {
                tracing::warn!(
                    "No email for owner {} of message {}; reminder skipped",
                    message.user_id,
                    message.id
                );
                report.skipped += 1;
                continue;
            };

            let remaining = (latest.deadline - now).num_minutes().max(0);
            let html = templates::reminder_email(
                &message.title,
                latest.deadline,
                u32::try_from(remaining).unwrap_or(u32::MAX),
            );
            let subject = format!("Reminder: check in to hold \"{}\"", message.title);

            match self
                .email
                .send_email(&email, &subject, &html, &BTreeMap::new())
                .await
            {
                Ok(()) => {
                    for entry in &pending {
                        self.repo
                            .record_sent_reminder(
                                &condition.id,
                                &message.id,
                                &message.user_id,
                                entry.offset_minutes,
                                entry.deadline,
                                now,
                            )
                            .await?;
                    }
                    tracing::info!(
                        "Sent {} minute reminder for message {}",
                        latest.offset_minutes,
                        message.id
                    );
                    report.sent += 1;
                }
                Err(e) => {
                    tracing::error!("Reminder for message {} failed: {}", message.id, e);
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }
}
