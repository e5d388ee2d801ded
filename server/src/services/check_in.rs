//! Owner check-ins and group confirmations

use crate::clock::SharedClock;
use crate::database::Repository;
use crate::domain::{Condition, Trigger};
use crate::error::{AppError, Result};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckInReport {
    pub conditions_updated: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmationReport {
    /// False when this recipient had already confirmed
    pub recorded: bool,
    pub confirmations: i64,
    pub required: u32,
}

#[derive(Clone)]
pub struct CheckInService {
    repo: Repository,
    clock: SharedClock,
}

impl CheckInService {
    pub fn new(repo: Repository, clock: SharedClock) -> Self {
        Self { repo, clock }
    }

    /// Reset every deadline of the user's messages to start from now.
    ///
    /// Recurring check-ins get their next occurrence recomputed from the new
    /// anchor, and sent reminders for the previous deadlines are dropped.
    pub async fn check_in(&self, user_id: &str) -> Result<CheckInReport> {
        let now = self.clock.now();
        let updated = self.repo.touch_last_checked_for_user(user_id, now).await?;
        if updated == 0 {
            return Err(AppError::NotFound(format!(
                "No conditions for user {}",
                user_id
            )));
        }

        for row in self.repo.list_conditions_for_user(user_id).await? {
            let condition = match Condition::from_row(&row) {
                Ok(condition) => condition,
                Err(e) => {
                    tracing::warn!("Skipping condition: {}", e);
                    continue;
                }
            };
            if let Trigger::RecurringCheckIn {
                pattern: Some(_), ..
            } = &condition.trigger
            {
                let next = condition.next_recurring_check(now);
                self.repo.set_next_check(&condition.id, next).await?;
            }

            // Reminders for the old deadline can no longer fire.
            let deadline = condition.deadline_at();
            for sent in self.repo.list_sent_reminders(&condition.id).await? {
                if Some(sent.deadline) != deadline {
                    let offset = u32::try_from(sent.offset_minutes).unwrap_or_default();
                    self.repo
                        .forget_sent_reminder(&condition.id, offset, sent.deadline)
                        .await?;
                }
            }
        }

        tracing::info!("User {} checked in ({} conditions)", user_id, updated);
        Ok(CheckInReport {
            conditions_updated: updated,
        })
    }

    /// Record a recipient's confirmation on a group-confirmation condition
    pub async fn confirm(&self, condition_id: &str, recipient_id: &str) -> Result<ConfirmationReport> {
        let row = self.repo.get_condition(condition_id).await?;
        let condition = Condition::from_row(&row)?;

        let Trigger::GroupConfirmation { required, .. } = condition.trigger else {
            return Err(AppError::InvalidCondition {
                id: condition.id,
                reason: "Condition does not take confirmations".to_string(),
            });
        };

        if !condition.recipients.iter().any(|r| r.id == recipient_id) {
            return Err(AppError::Unauthorized(format!(
                "{} is not a recipient of this message",
                recipient_id
            )));
        }

        let recorded = self
            .repo
            .add_group_confirmation(condition_id, recipient_id, self.clock.now())
            .await?;
        let confirmations = self.repo.get_condition(condition_id).await?.confirmation_count;

        tracing::info!(
            "Confirmation from {} on {}: {}/{}",
            recipient_id,
            condition_id,
            confirmations,
            required
        );
        Ok(ConfirmationReport {
            recorded,
            confirmations,
            required,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::database::{create_memory_pool, CreateConditionRequest, CreateMessageRequest};
    use crate::domain::{ConditionKind, Recipient, RecurringPattern};
    use chrono::{Duration, Utc};
    use std::sync::Arc;

    async fn setup() -> (CheckInService, Repository, ManualClock) {
        let repo = Repository::new(create_memory_pool().await.unwrap());
        let clock = ManualClock::new(Utc::now());
        (
            CheckInService::new(repo.clone(), Arc::new(clock.clone())),
            repo,
            clock,
        )
    }

    async fn create(repo: &Repository, kind: ConditionKind, build: impl FnOnce(&mut CreateConditionRequest)) -> String {
        let message = repo
            .create_message(CreateMessageRequest {
                user_id: "u1".to_string(),
                title: "Letter".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        let mut req = CreateConditionRequest::new(&message.id, kind);
        build(&mut req);
        repo.create_condition(req).await.unwrap().id
    }

    fn recipient(id: &str) -> Recipient {
        Recipient {
            id: id.to_string(),
            name: id.to_string(),
            email: format!("{}@example.com", id),
            phone: None,
        }
    }

    #[tokio::test]
    async fn test_check_in_resets_deadlines() {
        let (service, repo, clock) = setup().await;
        let start = clock.now();
        let deadline = create(&repo, ConditionKind::NoCheckIn, |req| {
            req.hours_threshold = Some(24);
            req.last_checked = Some(start - Duration::hours(20));
        })
        .await;
        let recurring = create(&repo, ConditionKind::RecurringCheckIn, |req| {
            req.recurring_pattern = Some(RecurringPattern::default());
            req.last_checked = Some(start - Duration::days(3));
            req.next_check = Some(start - Duration::days(2));
        })
        .await;

        let message_id = repo.get_condition(&deadline).await.unwrap().message_id;
        repo.record_sent_reminder(
            &deadline,
            &message_id,
            "u1",
            60,
            start + Duration::hours(4),
            start,
        )
        .await
        .unwrap();

        clock.advance(Duration::hours(1));
        let report = service.check_in("u1").await.unwrap();
        assert_eq!(report.conditions_updated, 2);

        let row = repo.get_condition(&deadline).await.unwrap();
        assert_eq!(row.last_checked, clock.now());
        assert!(repo.list_sent_reminders(&deadline).await.unwrap().is_empty());

        let row = repo.get_condition(&recurring).await.unwrap();
        assert_eq!(row.next_check, Some(clock.now() + Duration::days(1)));

        assert!(matches!(
            service.check_in("nobody").await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_confirmations() {
        let (service, repo, _clock) = setup().await;
        let id = create(&repo, ConditionKind::GroupConfirmation, |req| {
            req.recipients = vec![recipient("a"), recipient("b")];
        })
        .await;

        let first = service.confirm(&id, "a").await.unwrap();
        assert!(first.recorded);
        assert_eq!((first.confirmations, first.required), (1, 2));

        let repeat = service.confirm(&id, "a").await.unwrap();
        assert!(!repeat.recorded);
        assert_eq!(repeat.confirmations, 1);

        assert!(matches!(
            service.confirm(&id, "mallory").await,
            Err(AppError::Unauthorized(_))
        ));
    }

    #[tokio::test]
    async fn test_confirm_rejects_other_kinds() {
        let (service, repo, _clock) = setup().await;
        let id = create(&repo, ConditionKind::ScheduledDate, |req| {
            req.trigger_date = Some(Utc::now());
            req.recipients = vec![recipient("a")];
        })
        .await;
        assert!(matches!(
            service.confirm(&id, "a").await,
            Err(AppError::InvalidCondition { .. })
        ));
    }
}
