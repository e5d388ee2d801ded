//! Notification runner
//!
//! One pass of the trigger endpoint: creator reminders, evaluation, then
//! dispatch of each due message.

use crate::clock::SharedClock;
use crate::config::DedupBackend;
use crate::database::Repository;
use crate::error::Result;
use crate::services::dispatch::{DispatchOptions, DispatchOutcome, DispatchService};
use crate::services::evaluator::{Evaluation, EvaluatorService};
use crate::services::reminders::{ReminderReport, RemindersService};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NotifyRequest {
    pub message_id: Option<String>,
    pub is_emergency: bool,
    pub debug: bool,
    pub force_send: bool,
    /// Evaluate and report without sending or changing anything
    pub test_mode: bool,
    pub source: Option<String>,
    pub bypass_deduplication: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageResult {
    pub message_id: String,
    pub condition_id: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<DispatchOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub success: bool,
    pub source: String,
    pub test_mode: bool,
    pub evaluated: usize,
    pub due: usize,
    pub sent: usize,
    pub duplicates: usize,
    pub failed: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reminders: Option<ReminderReport>,
    pub results: Vec<MessageResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debug: Option<Vec<Evaluation>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub status: &'static str,
    pub version: &'static str,
    pub active_conditions: i64,
    pub dedup_backend: &'static str,
    pub time: DateTime<Utc>,
}

#[derive(Clone)]
pub struct NotificationRunner {
    repo: Repository,
    clock: SharedClock,
    evaluator: EvaluatorService,
    dispatch: DispatchService,
    reminders: RemindersService,
    dedup_backend: DedupBackend,
}

impl NotificationRunner {
    pub fn new(
        repo: Repository,
        clock: SharedClock,
        evaluator: EvaluatorService,
        dispatch: DispatchService,
        reminders: RemindersService,
        dedup_backend: DedupBackend,
    ) -> Self {
        Self {
            repo,
            clock,
            evaluator,
            dispatch,
            reminders,
            dedup_backend,
        }
    }

    pub async fn run(&self, request: NotifyRequest) -> Result<RunReport> {
        let source = request
            .source
            .clone()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| "api".to_string());
        tracing::info!(
            "Notification run (source: {}, message: {:?}, test mode: {})",
            source,
            request.message_id,
            request.test_mode
        );

        let reminders = if request.message_id.is_none() && !request.test_mode {
            match self.reminders.send_due_reminders().await {
                Ok(report) => Some(report),
                Err(e) => {
                    tracing::error!("Reminder pass failed: {}", e);
                    None
                }
            }
        } else {
            None
        };

        let evaluation = self
            .evaluator
            .run(request.message_id.as_deref(), request.force_send)
            .await?;

        let options = DispatchOptions {
            is_emergency: request.is_emergency,
            bypass_deduplication: request.bypass_deduplication,
            source: source.clone(),
        };

        let mut results = Vec::with_capacity(evaluation.due.len());
        let (mut sent, mut duplicates, mut failed) = (0, 0, 0);

        for due in &evaluation.due {
            let mut result = MessageResult {
                message_id: due.message.id.clone(),
                condition_id: due.condition.id.clone(),
                title: due.message.title.clone(),
                outcome: None,
                error: None,
            };

            if !request.test_mode {
                match self.dispatch.send_message_notification(due, &options).await {
                    Ok(outcome) => {
                        if outcome.duplicate {
                            duplicates += 1;
                        } else if outcome.success {
                            sent += 1;
                        } else {
                            failed += 1;
                        }
                        result.outcome = Some(outcome);
                    }
                    Err(e) => {
                        tracing::error!("Dispatch of message {} failed: {}", due.message.id, e);
                        failed += 1;
                        result.error = Some(e.to_string());
                    }
                }
            }
            results.push(result);
        }

        tracing::info!(
            "Notification run done: {} due, {} sent, {} duplicates, {} failed",
            evaluation.due.len(),
            sent,
            duplicates,
            failed
        );

        Ok(RunReport {
            success: failed == 0,
            source,
            test_mode: request.test_mode,
            evaluated: evaluation.evaluations.len(),
            due: evaluation.due.len(),
            sent,
            duplicates,
            failed,
            reminders,
            results,
            debug: request.debug.then_some(evaluation.evaluations),
        })
    }

    pub async fn status(&self) -> Result<StatusReport> {
        Ok(StatusReport {
            status: "ok",
            version: env!("CARGO_PKG_VERSION"),
            active_conditions: self.repo.count_active_conditions().await?,
            dedup_backend: self.dedup_backend.as_str(),
            time: self.clock.now(),
        })
    }
}
