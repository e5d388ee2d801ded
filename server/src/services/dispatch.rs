//! Notification dispatch pipeline
//!
//! Sends a due message to every recipient of its condition, records the
//! deliveries and moves the condition to its post-delivery state. Failures
//! of individual recipients are collected into the outcome, never raised.

use crate::clock::SharedClock;
use crate::config::{
    DISPATCH_CLAIM_LEASE_SECS, EMERGENCY_EMAIL_ATTEMPTS, STANDARD_EMAIL_ATTEMPTS,
};
use crate::database::{DeliveryRecord, Repository};
use crate::domain::{Condition, ConditionKind, Recipient, Trigger};
use crate::error::Result;
use crate::providers::{EmailProvider, WhatsAppProvider};
use crate::services::dedup::DedupGuard;
use crate::services::evaluator::DueMessage;
use crate::templates;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct DispatchOptions {
    pub is_emergency: bool,
    pub bypass_deduplication: bool,
    /// Who asked for the dispatch; recorded in the audit log
    pub source: String,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            is_emergency: false,
            bypass_deduplication: false,
            source: "api".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecipientOutcome {
    pub recipient_id: String,
    pub delivery_id: String,
    pub email_sent: bool,
    pub whatsapp_sent: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RecipientOutcome {
    pub fn succeeded(&self) -> bool {
        self.email_sent || self.whatsapp_sent
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchOutcome {
    pub success: bool,
    /// Suppressed by a dedup guard or a concurrent claim; nothing was sent
    pub duplicate: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub recipients: Vec<RecipientOutcome>,
}

impl DispatchOutcome {
    fn skipped(details: String) -> Self {
        Self {
            success: true,
            duplicate: true,
            details: Some(details),
            ..Default::default()
        }
    }
}

/// State a condition moves to after a successful delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PostDelivery {
    pub active: bool,
    pub next_check: Option<DateTime<Utc>>,
}

/// Recurring check-ins stay armed and advance to their next occurrence.
/// Panic triggers stay armed unless `keep_armed` is off. Everything else
/// is done.
pub fn post_delivery_state(condition: &Condition, now: DateTime<Utc>) -> PostDelivery {
    match &condition.trigger {
        Trigger::RecurringCheckIn { .. } => PostDelivery {
            active: true,
            next_check: condition.next_recurring_check(now),
        },
        Trigger::PanicTrigger { config } => PostDelivery {
            active: config.keep_armed(),
            next_check: None,
        },
        Trigger::NoCheckIn { .. }
        | Trigger::RegularCheckIn { .. }
        | Trigger::ScheduledDate { .. }
        | Trigger::InactivityToDate { .. }
        | Trigger::InactivityToRecurring { .. }
        | Trigger::GroupConfirmation { .. } => PostDelivery {
            active: false,
            next_check: None,
        },
    }
}

#[derive(Clone)]
pub struct DispatchService {
    repo: Repository,
    clock: SharedClock,
    email: Arc<dyn EmailProvider>,
    whatsapp: Arc<dyn WhatsAppProvider>,
    guard: DedupGuard,
    public_base_url: String,
    email_retry_delay: Duration,
}

impl DispatchService {
    pub fn new(
        repo: Repository,
        clock: SharedClock,
        email: Arc<dyn EmailProvider>,
        whatsapp: Arc<dyn WhatsAppProvider>,
        guard: DedupGuard,
        public_base_url: String,
        email_retry_delay: Duration,
    ) -> Self {
        Self {
            repo,
            clock,
            email,
            whatsapp,
            guard,
            public_base_url,
            email_retry_delay,
        }
    }

    /// Deliver a due message to all of its recipients
    pub async fn send_message_notification(
        &self,
        due: &DueMessage,
        options: &DispatchOptions,
    ) -> Result<DispatchOutcome> {
        let DueMessage { message, condition } = due;
        // Panic messages always go out as emergencies, whoever asked.
        let options = &DispatchOptions {
            is_emergency: options.is_emergency || condition.kind() == ConditionKind::PanicTrigger,
            ..options.clone()
        };

        if condition.recipients.is_empty() {
            tracing::info!("Message {} has no recipients; nothing to send", message.id);
            return Ok(DispatchOutcome {
                success: true,
                details: Some("No recipients".to_string()),
                ..Default::default()
            });
        }

        let fresh = self.guard.try_acquire(&message.id).await?;
        if !fresh && !options.bypass_deduplication {
            return Ok(DispatchOutcome::skipped(format!(
                "Skipped duplicate notification for message {} (sent within the last {} minutes)",
                message.id,
                self.guard.window().num_minutes()
            )));
        }

        let now = self.clock.now();
        let lease_ms = DISPATCH_CLAIM_LEASE_SECS * 1000;
        if !self
            .repo
            .try_claim_dispatch(&condition.id, now.timestamp_millis(), lease_ms)
            .await?
        {
            tracing::info!("Message {} is already being dispatched", message.id);
            return Ok(DispatchOutcome::skipped(format!(
                "Skipped duplicate notification for message {} (dispatch already in progress)",
                message.id
            )));
        }

        let audit = !condition.panic_config().is_some_and(|c| c.bypass_logging());
        if audit {
            self.audit(due, options, "sending", None).await;
        }

        let mut seen = HashSet::new();
        let recipients: Vec<&Recipient> = condition
            .recipients
            .iter()
            .filter(|r| seen.insert(r.id.as_str()))
            .collect();

        tracing::info!(
            "Dispatching message {} to {} recipients (emergency: {}, source: {})",
            message.id,
            recipients.len(),
            options.is_emergency,
            options.source
        );

        let sends = recipients
            .iter()
            .map(|recipient| self.send_to_recipient(due, recipient, options.is_emergency));
        let results = futures::future::join_all(sends).await;

        let delivered = results.iter().filter(|r| r.succeeded()).count();
        let failures: Vec<String> = results
            .iter()
            .filter_map(|r| r.error.as_ref().map(|e| format!("{}: {}", r.recipient_id, e)))
            .collect();

        let mut details = format!("Delivered to {} of {} recipients", delivered, results.len());
        if !failures.is_empty() {
            details.push_str("; ");
            details.push_str(&failures.join("; "));
        }

        if delivered > 0 {
            let state = post_delivery_state(condition, now);
            if let Err(e) = self
                .repo
                .finish_dispatch(&condition.id, state.active, state.next_check)
                .await
            {
                tracing::error!("Failed to update condition {} after delivery: {}", condition.id, e);
            }
            if audit {
                self.audit(due, options, "delivered", Some(&details)).await;
            }
            tracing::info!("Message {}: {}", message.id, details);

            Ok(DispatchOutcome {
                success: true,
                duplicate: false,
                error: None,
                details: Some(details),
                recipients: results,
            })
        } else {
            if let Err(e) = self.repo.release_dispatch(&condition.id).await {
                tracing::error!("Failed to release claim on {}: {}", condition.id, e);
            }
            if let Err(e) = self.guard.release(&message.id).await {
                tracing::warn!("Failed to clear dedup marker for {}: {}", message.id, e);
            }
            if audit {
                self.audit(due, options, "failed", Some(&details)).await;
            }
            tracing::error!("Message {} was not delivered: {}", message.id, details);

            Ok(DispatchOutcome {
                success: false,
                duplicate: false,
                error: Some("All recipients failed".to_string()),
                details: Some(details),
                recipients: results,
            })
        }
    }

    async fn audit(&self, due: &DueMessage, options: &DispatchOptions, status: &str, detail: Option<&str>) {
        if let Err(e) = self
            .repo
            .log_delivery(
                &due.message.id,
                &due.condition.id,
                &options.source,
                options.is_emergency,
                status,
                detail,
            )
            .await
        {
            tracing::warn!("Failed to write delivery log for {}: {}", due.message.id, e);
        }
    }

    fn access_link(&self, message_id: &str, recipient_email: &str, delivery_id: &str) -> String {
        let base = format!("{}/access", self.public_base_url.trim_end_matches('/'));
        let params = [
            ("id", message_id),
            ("recipient", recipient_email),
            ("delivery", delivery_id),
        ];
        match reqwest::Url::parse_with_params(&base, &params) {
            Ok(url) => url.to_string(),
            Err(e) => {
                tracing::warn!("Invalid public base url {}: {}", base, e);
                format!(
                    "{}?id={}&recipient={}&delivery={}",
                    base, message_id, recipient_email, delivery_id
                )
            }
        }
    }

    async fn send_to_recipient(
        &self,
        due: &DueMessage,
        recipient: &Recipient,
        is_emergency: bool,
    ) -> RecipientOutcome {
        let message = &due.message;
        let delivery_id = Uuid::new_v4().to_string();
        let mut outcome = RecipientOutcome {
            recipient_id: recipient.id.clone(),
            delivery_id: delivery_id.clone(),
            ..Default::default()
        };

        let record = DeliveryRecord {
            delivery_id: delivery_id.clone(),
            message_id: message.id.clone(),
            condition_id: due.condition.id.clone(),
            recipient_id: recipient.id.clone(),
            recipient_email: recipient.email.clone(),
            delivered_at: self.clock.now(),
            viewed_at: None,
            viewed_count: 0,
            device_info: None,
        };
        if let Err(e) = self.repo.create_delivery(&record).await {
            tracing::warn!("Failed to record delivery for {}: {}", recipient.id, e);
        }

        let link = self.access_link(&message.id, &recipient.email, &delivery_id);
        let mut errors = Vec::new();

        match self
            .send_email_with_retry(recipient, &message.title, &link, is_emergency)
            .await
        {
            Ok(()) => outcome.email_sent = true,
            Err(e) => errors.push(format!("email failed: {}", e)),
        }

        if due.condition.whatsapp_enabled {
            if let Some(phone) = recipient.phone.as_deref().filter(|p| !p.trim().is_empty()) {
                let text = if is_emergency {
                    format!("URGENT: {}\n{}", message.title, link)
                } else {
                    format!("{}\n{}", message.title, link)
                };
                match self
                    .whatsapp
                    .send_whatsapp(phone, &text, &message.id, is_emergency)
                    .await
                {
                    Ok(()) => outcome.whatsapp_sent = true,
                    Err(e) => {
                        tracing::error!("WhatsApp to {} failed: {}", recipient.id, e);
                        errors.push(format!("whatsapp failed: {}", e));
                    }
                }
            }
        }

        if !errors.is_empty() {
            outcome.error = Some(errors.join(", "));
        }
        outcome
    }

    async fn send_email_with_retry(
        &self,
        recipient: &Recipient,
        title: &str,
        link: &str,
        is_emergency: bool,
    ) -> Result<()> {
        let attempts = if is_emergency {
            EMERGENCY_EMAIL_ATTEMPTS
        } else {
            STANDARD_EMAIL_ATTEMPTS
        };

        let subject = if is_emergency {
            format!("URGENT: {}", title)
        } else {
            format!("A message for you: {}", title)
        };
        let mut headers = BTreeMap::new();
        if is_emergency {
            headers.insert("X-Priority".to_string(), "1".to_string());
            headers.insert("X-MSMail-Priority".to_string(), "High".to_string());
            headers.insert("Importance".to_string(), "high".to_string());
        }
        let html = templates::notification_email(&recipient.name, title, link, is_emergency);

        let mut attempt = 1;
        loop {
            match self
                .email
                .send_email(&recipient.email, &subject, &html, &headers)
                .await
            {
                Ok(()) => return Ok(()),
                Err(e) if attempt < attempts => {
                    tracing::warn!(
                        "Email to {} failed (attempt {}/{}): {}",
                        recipient.id,
                        attempt,
                        attempts,
                        e
                    );
                    tokio::time::sleep(self.email_retry_delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    tracing::error!("Email to {} failed after {} attempts: {}", recipient.id, attempt, e);
                    return Err(e);
                }
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::{RecordingEmail, RecordingWhatsApp};
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::config::{NOTIFICATION_DEDUP_RETENTION_SECS, NOTIFICATION_DEDUP_WINDOW_SECS};
    use crate::database::{create_memory_pool, CreateConditionRequest, CreateMessageRequest};
    use crate::domain::{ConditionKind, PanicConfig, RecurringPattern};
    use crate::services::dedup::InMemoryDedupStore;
    use std::sync::atomic::Ordering;

    struct Fixture {
        repo: Repository,
        clock: ManualClock,
        email: Arc<RecordingEmail>,
        whatsapp: Arc<RecordingWhatsApp>,
        service: DispatchService,
    }

    async fn fixture(email: RecordingEmail) -> Fixture {
        let repo = Repository::new(create_memory_pool().await.unwrap());
        let clock = ManualClock::new(Utc::now());
        let email = Arc::new(email);
        let whatsapp = Arc::new(RecordingWhatsApp::default());
        let guard = DedupGuard::new(
            Arc::new(InMemoryDedupStore::new()),
            Arc::new(clock.clone()),
            "notification",
            chrono::Duration::seconds(NOTIFICATION_DEDUP_WINDOW_SECS),
            chrono::Duration::seconds(NOTIFICATION_DEDUP_RETENTION_SECS),
        );
        let service = DispatchService::new(
            repo.clone(),
            Arc::new(clock.clone()),
            email.clone(),
            whatsapp.clone(),
            guard,
            "https://vault.example.com/".to_string(),
            Duration::ZERO,
        );
        Fixture {
            repo,
            clock,
            email,
            whatsapp,
            service,
        }
    }

    fn recipient(id: &str, phone: Option<&str>) -> Recipient {
        Recipient {
            id: id.to_string(),
            name: id.to_uppercase(),
            email: format!("{}@example.com", id),
            phone: phone.map(str::to_string),
        }
    }

    async fn due_message(
        repo: &Repository,
        kind: ConditionKind,
        build: impl FnOnce(&mut CreateConditionRequest),
    ) -> DueMessage {
        let message = repo
            .create_message(CreateMessageRequest {
                user_id: "u1".to_string(),
                title: "Letter".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        let mut req = CreateConditionRequest::new(&message.id, kind);
        req.hours_threshold = Some(1);
        req.trigger_date = Some(Utc::now());
        req.recipients = vec![recipient("r1", None)];
        build(&mut req);
        let row = repo.create_condition(req).await.unwrap();
        DueMessage {
            message,
            condition: Condition::from_row(&row).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_second_dispatch_within_window_is_skipped() {
        let f = fixture(RecordingEmail::default()).await;
        let due = due_message(&f.repo, ConditionKind::NoCheckIn, |_| {}).await;

        let first = f
            .service
            .send_message_notification(&due, &DispatchOptions::default())
            .await
            .unwrap();
        assert!(first.success);
        assert!(!first.duplicate);

        let second = f
            .service
            .send_message_notification(&due, &DispatchOptions::default())
            .await
            .unwrap();
        assert!(second.success);
        assert!(second.duplicate);
        assert!(second.details.unwrap().starts_with("Skipped duplicate"));
        assert_eq!(f.email.count(), 1);
    }

    #[tokio::test]
    async fn test_no_recipients_is_trivial_success() {
        let f = fixture(RecordingEmail::default()).await;
        let due = due_message(&f.repo, ConditionKind::NoCheckIn, |req| req.recipients.clear()).await;

        let outcome = f
            .service
            .send_message_notification(&due, &DispatchOptions::default())
            .await
            .unwrap();
        assert!(outcome.success);
        assert_eq!(f.email.count(), 0);
        assert!(f.repo.get_condition(&due.condition.id).await.unwrap().active);
    }

    #[tokio::test]
    async fn test_delivery_records_and_deactivation() {
        let f = fixture(RecordingEmail::default()).await;
        let due = due_message(&f.repo, ConditionKind::NoCheckIn, |req| {
            req.recipients = vec![
                recipient("r1", Some("+15550001")),
                recipient("r2", None),
                recipient("r1", Some("+15550001")),
            ];
            req.whatsapp_enabled = true;
        })
        .await;

        let outcome = f
            .service
            .send_message_notification(&due, &DispatchOptions::default())
            .await
            .unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.recipients.len(), 2);
        assert_eq!(f.email.count(), 2);
        assert_eq!(f.whatsapp.calls.load(Ordering::SeqCst), 1);

        let deliveries = f.repo.list_deliveries_for_message(&due.message.id).await.unwrap();
        assert_eq!(deliveries.len(), 2);

        let row = f.repo.get_condition(&due.condition.id).await.unwrap();
        assert!(!row.active);

        let log = f.repo.list_delivery_log(&due.message.id).await.unwrap();
        let statuses: Vec<_> = log.iter().map(|e| e.status.as_str()).collect();
        assert_eq!(statuses, vec!["sending", "delivered"]);
        assert!(log.iter().all(|e| e.source == "api"));
    }

    #[tokio::test]
    async fn test_emergency_retries_and_priority_headers() {
        let f = fixture(RecordingEmail::failing(1)).await;
        let due = due_message(&f.repo, ConditionKind::PanicTrigger, |req| {
            req.panic_config = Some(PanicConfig::default());
        })
        .await;

        let options = DispatchOptions {
            is_emergency: true,
            bypass_deduplication: true,
            source: "panic".to_string(),
        };
        let outcome = f.service.send_message_notification(&due, &options).await.unwrap();
        assert!(outcome.success);
        assert_eq!(f.email.count(), 2);

        let sent = f.email.sent.lock().unwrap();
        assert!(sent[0].1.starts_with("URGENT:"));
        assert_eq!(sent[0].2.get("X-Priority").map(String::as_str), Some("1"));
        drop(sent);

        // keep_armed defaults to true
        assert!(f.repo.get_condition(&due.condition.id).await.unwrap().active);
    }

    #[tokio::test]
    async fn test_panic_message_is_emergency_without_flag() {
        let f = fixture(RecordingEmail::failing(1)).await;
        let due = due_message(&f.repo, ConditionKind::PanicTrigger, |req| {
            req.panic_config = Some(PanicConfig::default());
        })
        .await;

        let outcome = f
            .service
            .send_message_notification(&due, &DispatchOptions::default())
            .await
            .unwrap();
        assert!(outcome.success);
        assert_eq!(f.email.count(), 2);

        let sent = f.email.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].1.starts_with("URGENT:"));
        assert_eq!(sent[0].2.get("X-Priority").map(String::as_str), Some("1"));
        drop(sent);

        let log = f.repo.list_delivery_log(&due.message.id).await.unwrap();
        assert!(log.iter().all(|e| e.is_emergency));
    }

    #[tokio::test]
    async fn test_standard_email_is_attempted_once_and_failure_releases_guard() {
        let f = fixture(RecordingEmail::failing(1)).await;
        let due = due_message(&f.repo, ConditionKind::ScheduledDate, |_| {}).await;

        let outcome = f
            .service
            .send_message_notification(&due, &DispatchOptions::default())
            .await
            .unwrap();
        assert!(!outcome.success);
        assert_eq!(f.email.count(), 1);
        assert!(f.repo.get_condition(&due.condition.id).await.unwrap().active);

        // The failed run left no marker or claim behind.
        let retry = f
            .service
            .send_message_notification(&due, &DispatchOptions::default())
            .await
            .unwrap();
        assert!(retry.success);
        assert!(!retry.duplicate);
        assert_eq!(f.email.count(), 2);
    }

    #[tokio::test]
    async fn test_recurring_condition_stays_active_and_advances() {
        let f = fixture(RecordingEmail::default()).await;
        let due = due_message(&f.repo, ConditionKind::RecurringCheckIn, |req| {
            req.recurring_pattern = Some(RecurringPattern::default());
            req.last_checked = Some(Utc::now() - chrono::Duration::days(2));
        })
        .await;

        let outcome = f
            .service
            .send_message_notification(&due, &DispatchOptions::default())
            .await
            .unwrap();
        assert!(outcome.success);

        let row = f.repo.get_condition(&due.condition.id).await.unwrap();
        assert!(row.active);
        let next = row.next_check.unwrap();
        assert!(next > f.clock.now());
        assert!(next <= f.clock.now() + chrono::Duration::days(1));
    }

    #[tokio::test]
    async fn test_window_expiry_allows_resend() {
        let f = fixture(RecordingEmail::default()).await;
        let due = due_message(&f.repo, ConditionKind::PanicTrigger, |_| {}).await;

        f.service
            .send_message_notification(&due, &DispatchOptions::default())
            .await
            .unwrap();
        f.clock.advance(chrono::Duration::minutes(6));
        let again = f
            .service
            .send_message_notification(&due, &DispatchOptions::default())
            .await
            .unwrap();
        assert!(!again.duplicate);
        assert_eq!(f.email.count(), 2);
    }

    #[test]
    fn test_post_delivery_state() {
        let row_now = Utc::now();
        let mut condition = Condition {
            id: "c".to_string(),
            message_id: "m".to_string(),
            active: true,
            last_checked: row_now,
            trigger: Trigger::PanicTrigger {
                config: PanicConfig::default().with_keep_armed(false).unwrap(),
            },
            reminder_offsets: Vec::new(),
            recipients: Vec::new(),
            whatsapp_enabled: false,
            access: Default::default(),
        };
        assert!(!post_delivery_state(&condition, row_now).active);

        condition.trigger = Trigger::GroupConfirmation {
            required: 1,
            confirmations: 1,
        };
        assert!(!post_delivery_state(&condition, row_now).active);
    }
}
