//! Condition evaluator
//!
//! Decides which messages are due for delivery right now. Evaluation is a
//! pure function of the stored condition and the current instant; the
//! service wrapper only loads rows and joins them to their messages.

use crate::clock::SharedClock;
use crate::database::{Message, Repository};
use crate::domain::{Condition, ConditionKind, Trigger};
use crate::error::{AppError, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// A message whose condition is satisfied
#[derive(Debug, Clone)]
pub struct DueMessage {
    pub message: Message,
    pub condition: Condition,
}

/// Outcome of evaluating one condition
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Evaluation {
    pub condition_id: String,
    pub message_id: String,
    pub kind: Option<ConditionKind>,
    pub due: bool,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct EvaluationRun {
    pub due: Vec<DueMessage>,
    pub evaluations: Vec<Evaluation>,
}

/// Evaluate a single condition at `now`.
///
/// Panic triggers are never due here; they only fire through an explicit
/// trigger.
pub fn evaluate(condition: &Condition, now: DateTime<Utc>) -> Evaluation {
    let (due, reason) = match &condition.trigger {
        Trigger::NoCheckIn { deadline } | Trigger::RegularCheckIn { deadline } => {
            match deadline.due_at(condition.last_checked) {
                Some(due_at) => (now >= due_at, format!("deadline {}", due_at.to_rfc3339())),
                None => (false, "deadline out of range".to_string()),
            }
        }
        Trigger::ScheduledDate {
            trigger_date,
            pattern,
        } => {
            let floor_ok = pattern.as_ref().map_or(true, |p| p.floor_reached(now));
            let reason = if floor_ok {
                format!("trigger date {}", trigger_date.to_rfc3339())
            } else {
                "recurring start date not reached".to_string()
            };
            (now >= *trigger_date && floor_ok, reason)
        }
        Trigger::InactivityToDate { trigger_date } => {
            let passed = now >= *trigger_date;
            let checked_in_after = condition.last_checked >= *trigger_date;
            let reason = if checked_in_after {
                "owner checked in after the trigger date".to_string()
            } else {
                format!("trigger date {}", trigger_date.to_rfc3339())
            };
            (passed && !checked_in_after, reason)
        }
        Trigger::InactivityToRecurring { deadline, pattern } => {
            match deadline.due_at(condition.last_checked) {
                _ if !pattern.floor_reached(now) => {
                    (false, "recurring start date not reached".to_string())
                }
                Some(due_at) => (now >= due_at, format!("deadline {}", due_at.to_rfc3339())),
                None => (false, "deadline out of range".to_string()),
            }
        }
        Trigger::RecurringCheckIn {
            pattern,
            next_check,
        } => {
            let next = next_check.or_else(|| {
                pattern
                    .as_ref()
                    .and_then(|p| p.next_occurrence(condition.last_checked, condition.last_checked))
            });
            match next {
                Some(at) => (now >= at, format!("next check {}", at.to_rfc3339())),
                None => (false, "no upcoming occurrence".to_string()),
            }
        }
        Trigger::GroupConfirmation {
            required,
            confirmations,
        } => (
            confirmations >= required,
            format!("{} of {} confirmations", confirmations, required),
        ),
        Trigger::PanicTrigger { .. } => (false, "panic triggers fire manually".to_string()),
    };

    Evaluation {
        condition_id: condition.id.clone(),
        message_id: condition.message_id.clone(),
        kind: Some(condition.kind()),
        due,
        reason,
    }
}

#[derive(Clone)]
pub struct EvaluatorService {
    repo: Repository,
    clock: SharedClock,
}

impl EvaluatorService {
    pub fn new(repo: Repository, clock: SharedClock) -> Self {
        Self { repo, clock }
    }

    /// Messages due for delivery.
    ///
    /// `force_send` ignores `active`; combined with a specific message id it
    /// includes that message without evaluating its condition.
    pub async fn messages_to_notify(
        &self,
        specific_message_id: Option<&str>,
        force_send: bool,
    ) -> Result<Vec<DueMessage>> {
        Ok(self.run(specific_message_id, force_send).await?.due)
    }

    /// Same as [`Self::messages_to_notify`], keeping a line per condition
    pub async fn run(
        &self,
        specific_message_id: Option<&str>,
        force_send: bool,
    ) -> Result<EvaluationRun> {
        let now = self.clock.now();
        let mut run = EvaluationRun::default();

        let rows = match specific_message_id {
            Some(message_id) => match self.repo.get_condition_for_message(message_id).await {
                Ok(row) => vec![row],
                Err(AppError::ConditionNotFound(_)) => {
                    tracing::warn!("No condition for message {}", message_id);
                    return Ok(run);
                }
                Err(e) => return Err(e),
            },
            None => self.repo.list_conditions(!force_send).await?,
        };

        let considered = rows.len();
        for row in rows {
            let condition = match Condition::from_row(&row) {
                Ok(condition) => condition,
                Err(e) => {
                    tracing::warn!("Skipping condition: {}", e);
                    run.evaluations.push(Evaluation {
                        condition_id: row.id.clone(),
                        message_id: row.message_id.clone(),
                        kind: row.condition_type.parse().ok(),
                        due: false,
                        reason: e.to_string(),
                    });
                    continue;
                }
            };

            let evaluation = if force_send && specific_message_id.is_some() {
                Evaluation {
                    condition_id: condition.id.clone(),
                    message_id: condition.message_id.clone(),
                    kind: Some(condition.kind()),
                    due: true,
                    reason: "forced".to_string(),
                }
            } else if !condition.active && !force_send {
                Evaluation {
                    condition_id: condition.id.clone(),
                    message_id: condition.message_id.clone(),
                    kind: Some(condition.kind()),
                    due: false,
                    reason: "inactive".to_string(),
                }
            } else {
                evaluate(&condition, now)
            };

            if evaluation.due {
                match self.repo.get_message(&condition.message_id).await {
                    Ok(message) => run.due.push(DueMessage { message, condition }),
                    Err(AppError::MessageNotFound(id)) => {
                        tracing::warn!("Condition {} points at missing message {}", row.id, id);
                    }
                    Err(e) => return Err(e),
                }
            }
            run.evaluations.push(evaluation);
        }

        tracing::info!(
            "Evaluated {} conditions, {} due",
            considered,
            run.due.len()
        );
        Ok(run)
    }
}
