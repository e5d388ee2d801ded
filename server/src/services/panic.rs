//! Panic trigger
//!
//! [`PanicMachine`] is the press/confirm/cancel state machine a client
//! drives; it is pure and takes the current instant with every event.
//! [`PanicRunner`] wires it to a clock and a [`PanicFirer`] and performs
//! the fire attempts. [`PanicTriggerService`] is the server-side firer:
//! it guards against double invocation and dispatches as an emergency.

use crate::clock::SharedClock;
use crate::config::{
    PANIC_BACKOFF_STEP_MS, PANIC_CONFIRM_WINDOW_SECS, PANIC_MAX_ATTEMPTS,
    PANIC_SUCCESS_COUNTDOWN_SECS,
};
use crate::database::Repository;
use crate::domain::{CancelWindow, Condition, PanicMethod};
use crate::error::{AppError, Result, ValidationError};
use crate::services::dedup::DedupGuard;
use crate::services::dispatch::{DispatchOptions, DispatchService};
use crate::services::evaluator::DueMessage;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::Arc;

/// A message the user can arm
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PanicTarget {
    pub message_id: String,
    pub cancel_window: CancelWindow,
    pub keep_armed: bool,
}

impl PanicTarget {
    /// Armable target for an active, enabled panic condition
    pub fn from_condition(condition: &Condition) -> Option<Self> {
        let config = condition.panic_config()?;
        (condition.active && config.enabled()).then(|| Self {
            message_id: condition.message_id.clone(),
            cancel_window: config.cancel_window(),
            keep_armed: config.keep_armed(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PanicState {
    Idle,
    /// First press seen; a second press before `until` arms
    Confirming { until: DateTime<Utc> },
    /// Several panic messages exist; waiting for a pick
    Selecting,
    CancelWindow {
        message_id: String,
        ends_at: DateTime<Utc>,
    },
    Firing { message_id: String },
    /// Fired; the success countdown runs until `until`
    Succeeded {
        until: DateTime<Utc>,
        keep_armed: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PanicEvent {
    Press,
    Select(String),
    Tick,
    FireSucceeded,
    FireFailed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PanicEffect {
    /// The user cancelled during the countdown
    Cancelled { message_id: String },
    BeginFire { message_id: String },
    Reload,
    NavigateAway,
    ReportFailure(String),
}

#[derive(Debug, Clone)]
pub struct PanicMachine {
    state: PanicState,
    targets: Vec<PanicTarget>,
}

impl PanicMachine {
    pub fn new(targets: Vec<PanicTarget>) -> Self {
        Self {
            state: PanicState::Idle,
            targets,
        }
    }

    pub fn state(&self) -> &PanicState {
        &self.state
    }

    fn target(&self, message_id: &str) -> Option<&PanicTarget> {
        self.targets.iter().find(|t| t.message_id == message_id)
    }

    fn keep_armed(&self, message_id: &str) -> bool {
        self.target(message_id).map_or(true, |t| t.keep_armed)
    }

    /// Feed one event. Timeouts that elapsed before `now` are applied first.
    pub fn handle(&mut self, event: PanicEvent, now: DateTime<Utc>) -> Vec<PanicEffect> {
        let mut effects = self.expire(now);

        let state = std::mem::replace(&mut self.state, PanicState::Idle);
        let (next, effect) = match (state, event) {
            (PanicState::Idle, PanicEvent::Press) => (
                PanicState::Confirming {
                    until: now + Duration::seconds(PANIC_CONFIRM_WINDOW_SECS),
                },
                None,
            ),
            (PanicState::Confirming { .. }, PanicEvent::Press) => match self.targets.as_slice() {
                [] => (
                    PanicState::Idle,
                    Some(PanicEffect::ReportFailure(
                        "No panic message is configured".to_string(),
                    )),
                ),
                [only] => {
                    let only = only.clone();
                    self.arm(&only, now)
                }
                _ => (PanicState::Selecting, None),
            },
            (PanicState::Selecting, PanicEvent::Select(message_id)) => {
                match self.target(&message_id).cloned() {
                    Some(target) => self.arm(&target, now),
                    None => (PanicState::Selecting, None),
                }
            }
            (PanicState::CancelWindow { message_id, .. }, PanicEvent::Press) => {
                tracing::info!("Panic trigger for {} cancelled", message_id);
                (PanicState::Idle, Some(PanicEffect::Cancelled { message_id }))
            }
            (PanicState::Firing { message_id }, PanicEvent::FireSucceeded) => (
                PanicState::Succeeded {
                    until: now + Duration::seconds(PANIC_SUCCESS_COUNTDOWN_SECS),
                    keep_armed: self.keep_armed(&message_id),
                },
                None,
            ),
            (PanicState::Firing { .. }, PanicEvent::FireFailed(reason)) => {
                (PanicState::Idle, Some(PanicEffect::ReportFailure(reason)))
            }
            (state, _) => (state, None),
        };

        self.state = next;
        effects.extend(effect);
        effects
    }

    fn arm(&self, target: &PanicTarget, now: DateTime<Utc>) -> (PanicState, Option<PanicEffect>) {
        if target.cancel_window.seconds() == 0 {
            return (
                PanicState::Firing {
                    message_id: target.message_id.clone(),
                },
                Some(PanicEffect::BeginFire {
                    message_id: target.message_id.clone(),
                }),
            );
        }
        (
            PanicState::CancelWindow {
                message_id: target.message_id.clone(),
                ends_at: now + target.cancel_window.duration(),
            },
            None,
        )
    }

    fn expire(&mut self, now: DateTime<Utc>) -> Vec<PanicEffect> {
        let state = std::mem::replace(&mut self.state, PanicState::Idle);
        let (next, effect) = match state {
            PanicState::Confirming { until } if now >= until => (PanicState::Idle, None),
            PanicState::CancelWindow {
                message_id,
                ends_at,
            } if now >= ends_at => (
                PanicState::Firing {
                    message_id: message_id.clone(),
                },
                Some(PanicEffect::BeginFire { message_id }),
            ),
            PanicState::Succeeded { until, keep_armed } if now >= until => (
                PanicState::Idle,
                Some(if keep_armed {
                    PanicEffect::Reload
                } else {
                    PanicEffect::NavigateAway
                }),
            ),
            other => (other, None),
        };
        self.state = next;
        effect.into_iter().collect()
    }
}

/// Performs one fire attempt for a message
#[async_trait]
pub trait PanicFirer: Send + Sync {
    async fn fire(&self, message_id: &str) -> Result<()>;
}

/// Drives a [`PanicMachine`] and executes fire attempts with backoff
pub struct PanicRunner {
    machine: PanicMachine,
    clock: SharedClock,
    firer: Arc<dyn PanicFirer>,
    max_attempts: u32,
    backoff_step: std::time::Duration,
}

impl PanicRunner {
    pub fn new(targets: Vec<PanicTarget>, clock: SharedClock, firer: Arc<dyn PanicFirer>) -> Self {
        Self {
            machine: PanicMachine::new(targets),
            clock,
            firer,
            max_attempts: PANIC_MAX_ATTEMPTS,
            backoff_step: std::time::Duration::from_millis(PANIC_BACKOFF_STEP_MS),
        }
    }

    pub fn with_backoff_step(mut self, step: std::time::Duration) -> Self {
        self.backoff_step = step;
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn state(&self) -> &PanicState {
        self.machine.state()
    }

    pub async fn press(&mut self) -> Vec<PanicEffect> {
        self.dispatch(PanicEvent::Press).await
    }

    pub async fn select(&mut self, message_id: &str) -> Vec<PanicEffect> {
        self.dispatch(PanicEvent::Select(message_id.to_string())).await
    }

    pub async fn tick(&mut self) -> Vec<PanicEffect> {
        self.dispatch(PanicEvent::Tick).await
    }

    async fn dispatch(&mut self, event: PanicEvent) -> Vec<PanicEffect> {
        let mut pending = self.machine.handle(event, self.clock.now());
        let mut observed = Vec::new();

        while let Some(effect) = pending.first().cloned() {
            pending.remove(0);
            if let PanicEffect::BeginFire { message_id } = &effect {
                let result = self.fire_with_retry(message_id).await;
                let follow_up = match result {
                    Ok(()) => PanicEvent::FireSucceeded,
                    Err(e) => PanicEvent::FireFailed(e.to_string()),
                };
                pending.extend(self.machine.handle(follow_up, self.clock.now()));
            }
            observed.push(effect);
        }
        observed
    }

    async fn fire_with_retry(&self, message_id: &str) -> Result<()> {
        let mut attempt = 1;
        loop {
            match self.firer.fire(message_id).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < self.max_attempts => {
                    tracing::warn!(
                        "Panic fire for {} failed (attempt {}/{}): {}",
                        message_id,
                        attempt,
                        self.max_attempts,
                        e
                    );
                    tokio::time::sleep(self.backoff_step * attempt).await;
                    attempt += 1;
                }
                Err(e) => {
                    tracing::error!("Panic fire for {} failed: {}", message_id, e);
                    return Err(e);
                }
            }
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PanicTriggerOutcome {
    pub success: bool,
    pub duplicate: bool,
    pub keep_armed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

#[derive(Clone)]
pub struct PanicTriggerService {
    repo: Repository,
    dispatch: DispatchService,
    guard: DedupGuard,
}

impl PanicTriggerService {
    pub fn new(repo: Repository, dispatch: DispatchService, guard: DedupGuard) -> Self {
        Self {
            repo,
            dispatch,
            guard,
        }
    }

    /// Fire the panic message. With `user_id`, the message must belong to
    /// that user.
    pub async fn trigger(
        &self,
        message_id: &str,
        user_id: Option<&str>,
    ) -> Result<PanicTriggerOutcome> {
        let message = self.repo.get_message(message_id).await?;
        if let Some(user_id) = user_id {
            if message.user_id != user_id {
                return Err(AppError::Unauthorized(
                    "Message belongs to another user".to_string(),
                ));
            }
        }

        let row = self.repo.get_condition_for_message(message_id).await?;
        let condition = Condition::from_row(&row)?;
        let config = condition.panic_config().ok_or_else(|| {
            AppError::Validation(ValidationError::Other(format!(
                "Message {} is not a panic message",
                message_id
            )))
        })?;
        if !config.enabled() {
            return Err(AppError::Validation(ValidationError::Other(
                "Panic trigger is disabled".to_string(),
            )));
        }
        if !condition.active {
            return Err(AppError::Validation(ValidationError::Other(
                "Panic trigger is disarmed".to_string(),
            )));
        }
        let keep_armed = config.keep_armed();

        if !self.guard.try_acquire(message_id).await? {
            return Ok(PanicTriggerOutcome {
                success: true,
                duplicate: true,
                keep_armed,
                error: None,
                details: Some("Panic alert already sent".to_string()),
            });
        }

        tracing::warn!("Panic trigger fired for message {}", message_id);
        let options = DispatchOptions {
            is_emergency: true,
            bypass_deduplication: true,
            source: "panic".to_string(),
        };
        let due = DueMessage { message, condition };
        let outcome = match self.dispatch.send_message_notification(&due, &options).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.release_guard(message_id).await;
                return Err(e);
            }
        };

        if !outcome.success {
            self.release_guard(message_id).await;
        }

        Ok(PanicTriggerOutcome {
            success: outcome.success,
            duplicate: outcome.duplicate,
            keep_armed,
            error: outcome.error,
            details: outcome.details,
        })
    }

    /// Fire the user's panic message whose WhatsApp keyword matches `text`
    pub async fn trigger_by_keyword(
        &self,
        user_id: &str,
        text: &str,
    ) -> Result<Option<PanicTriggerOutcome>> {
        let wanted = text.trim();
        let rows = self.repo.list_conditions_for_user(user_id).await?;

        let matched = rows
            .iter()
            .filter_map(|row| match Condition::from_row(row) {
                Ok(condition) => Some(condition),
                Err(e) => {
                    tracing::warn!("Skipping condition: {}", e);
                    None
                }
            })
            .find(|condition| {
                condition.active
                    && condition.panic_config().is_some_and(|config| {
                        config.enabled()
                            && config.supports(PanicMethod::Whatsapp)
                            && config
                                .trigger_keyword()
                                .is_some_and(|k| k.eq_ignore_ascii_case(wanted))
                    })
            });

        match matched {
            Some(condition) => Ok(Some(self.trigger(&condition.message_id, Some(user_id)).await?)),
            None => Ok(None),
        }
    }

    async fn release_guard(&self, message_id: &str) {
        if let Err(e) = self.guard.release(message_id).await {
            tracing::warn!("Failed to clear panic marker for {}: {}", message_id, e);
        }
    }
}

#[async_trait]
impl PanicFirer for PanicTriggerService {
    async fn fire(&self, message_id: &str) -> Result<()> {
        let outcome = self.trigger(message_id, None).await?;
        if outcome.success {
            Ok(())
        } else {
            Err(AppError::TransientDelivery(
                outcome.error.unwrap_or_else(|| "Panic delivery failed".to_string()),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{PANIC_DEDUP_RETENTION_SECS, PANIC_DEDUP_WINDOW_SECS};
    use crate::database::{create_memory_pool, CreateConditionRequest, CreateMessageRequest};
    use crate::domain::{ConditionKind, PanicConfig, Recipient};
    use crate::services::dedup::InMemoryDedupStore;
    use crate::services::dispatch::test_support::{RecordingEmail, RecordingWhatsApp};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn target(id: &str, window: u32) -> PanicTarget {
        PanicTarget {
            message_id: id.to_string(),
            cancel_window: CancelWindow::new(window).unwrap(),
            keep_armed: true,
        }
    }

    #[derive(Default)]
    struct CountingFirer {
        attempts: AtomicUsize,
        failures: usize,
    }

    #[async_trait]
    impl PanicFirer for CountingFirer {
        async fn fire(&self, _message_id: &str) -> Result<()> {
            let n = self.attempts.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err(AppError::TransientDelivery("offline".to_string()))
            } else {
                Ok(())
            }
        }
    }

    fn runner(
        targets: Vec<PanicTarget>,
        clock: &ManualClock,
        firer: Arc<CountingFirer>,
    ) -> PanicRunner {
        PanicRunner::new(targets, Arc::new(clock.clone()), firer)
            .with_backoff_step(std::time::Duration::ZERO)
    }

    #[tokio::test]
    async fn test_third_press_cancels() {
        let clock = ManualClock::new(Utc::now());
        let firer = Arc::new(CountingFirer::default());
        let mut runner = runner(vec![target("m1", 10)], &clock, firer.clone());

        runner.press().await;
        clock.advance(Duration::seconds(1));
        runner.press().await;
        assert!(matches!(runner.state(), PanicState::CancelWindow { .. }));

        clock.advance(Duration::seconds(4));
        let effects = runner.press().await;
        assert_eq!(
            effects,
            vec![PanicEffect::Cancelled {
                message_id: "m1".to_string()
            }]
        );
        assert_eq!(runner.state(), &PanicState::Idle);

        clock.advance(Duration::seconds(30));
        runner.tick().await;
        assert_eq!(firer.attempts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_window_elapsing_fires_once() {
        let clock = ManualClock::new(Utc::now());
        let firer = Arc::new(CountingFirer::default());
        let mut runner = runner(vec![target("m1", 5)], &clock, firer.clone());

        runner.press().await;
        runner.press().await;
        clock.advance(Duration::seconds(5));
        let effects = runner.tick().await;
        assert_eq!(
            effects,
            vec![PanicEffect::BeginFire {
                message_id: "m1".to_string()
            }]
        );
        assert!(matches!(runner.state(), PanicState::Succeeded { .. }));

        runner.tick().await;
        clock.advance(Duration::seconds(3));
        assert_eq!(runner.tick().await, vec![PanicEffect::Reload]);
        assert_eq!(runner.state(), &PanicState::Idle);
        assert_eq!(firer.attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_single_press_reverts() {
        let clock = ManualClock::new(Utc::now());
        let firer = Arc::new(CountingFirer::default());
        let mut runner = runner(vec![target("m1", 5)], &clock, firer);

        runner.press().await;
        clock.advance(Duration::seconds(3));
        runner.tick().await;
        assert_eq!(runner.state(), &PanicState::Idle);

        // A late second press starts over instead of arming.
        runner.press().await;
        assert!(matches!(runner.state(), PanicState::Confirming { .. }));
    }

    #[tokio::test]
    async fn test_selection_step_with_several_targets() {
        let clock = ManualClock::new(Utc::now());
        let firer = Arc::new(CountingFirer::default());
        let mut runner = runner(vec![target("m1", 10), target("m2", 0)], &clock, firer.clone());

        runner.press().await;
        runner.press().await;
        assert_eq!(runner.state(), &PanicState::Selecting);

        runner.select("unknown").await;
        assert_eq!(runner.state(), &PanicState::Selecting);

        // A zero-second window fires straight away.
        let effects = runner.select("m2").await;
        assert_eq!(
            effects,
            vec![PanicEffect::BeginFire {
                message_id: "m2".to_string()
            }]
        );
        assert_eq!(firer.attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhausted_retries_return_to_idle() {
        let clock = ManualClock::new(Utc::now());
        let firer = Arc::new(CountingFirer {
            attempts: AtomicUsize::new(0),
            failures: 5,
        });
        let mut runner = runner(vec![target("m1", 0)], &clock, firer.clone());

        runner.press().await;
        let effects = runner.press().await;
        assert_eq!(effects.len(), 2);
        assert!(matches!(effects[1], PanicEffect::ReportFailure(_)));
        assert_eq!(runner.state(), &PanicState::Idle);
        assert_eq!(firer.attempts.load(Ordering::SeqCst), PANIC_MAX_ATTEMPTS as usize);
    }

    async fn trigger_service() -> (PanicTriggerService, Repository, Arc<RecordingEmail>, ManualClock) {
        let repo = Repository::new(create_memory_pool().await.unwrap());
        let clock = ManualClock::new(Utc::now());
        let email = Arc::new(RecordingEmail::default());
        let notification_guard = DedupGuard::new(
            Arc::new(InMemoryDedupStore::new()),
            Arc::new(clock.clone()),
            "notification",
            Duration::minutes(5),
            Duration::minutes(10),
        );
        let dispatch = DispatchService::new(
            repo.clone(),
            Arc::new(clock.clone()),
            email.clone(),
            Arc::new(RecordingWhatsApp::default()),
            notification_guard,
            "http://localhost".to_string(),
            std::time::Duration::ZERO,
        );
        let panic_guard = DedupGuard::new(
            Arc::new(InMemoryDedupStore::new()),
            Arc::new(clock.clone()),
            "panic",
            Duration::seconds(PANIC_DEDUP_WINDOW_SECS),
            Duration::seconds(PANIC_DEDUP_RETENTION_SECS),
        );
        (
            PanicTriggerService::new(repo.clone(), dispatch, panic_guard),
            repo,
            email,
            clock,
        )
    }

    async fn panic_message(repo: &Repository, config: PanicConfig) -> String {
        let message = repo
            .create_message(CreateMessageRequest {
                user_id: "u1".to_string(),
                title: "Help".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        let mut req = CreateConditionRequest::new(&message.id, ConditionKind::PanicTrigger);
        req.panic_config = Some(config);
        req.recipients = vec![Recipient {
            id: "r1".to_string(),
            name: "Ana".to_string(),
            email: "ana@example.com".to_string(),
            phone: None,
        }];
        repo.create_condition(req).await.unwrap();
        message.id
    }

    #[tokio::test]
    async fn test_trigger_dedups_within_thirty_seconds() {
        let (service, repo, email, clock) = trigger_service().await;
        let message_id = panic_message(&repo, PanicConfig::default()).await;

        assert!(service.trigger(&message_id, Some("u1")).await.unwrap().success);
        let again = service.trigger(&message_id, Some("u1")).await.unwrap();
        assert!(again.success && again.duplicate);
        assert_eq!(email.count(), 1);

        // A legitimate repeat after the guard window goes out again.
        clock.advance(Duration::seconds(31));
        let later = service.trigger(&message_id, None).await.unwrap();
        assert!(!later.duplicate);
        assert_eq!(email.count(), 2);
    }

    #[tokio::test]
    async fn test_trigger_rejects_other_users_and_disabled() {
        let (service, repo, _email, _clock) = trigger_service().await;
        let message_id = panic_message(&repo, PanicConfig::default()).await;
        assert!(matches!(
            service.trigger(&message_id, Some("intruder")).await,
            Err(AppError::Unauthorized(_))
        ));

        let disabled = PanicConfig::default().with_enabled(false).unwrap();
        let off = panic_message(&repo, disabled).await;
        assert!(matches!(
            service.trigger(&off, None).await,
            Err(AppError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_keep_armed_false_deactivates() {
        let (service, repo, email, clock) = trigger_service().await;
        let config = PanicConfig::default().with_keep_armed(false).unwrap();
        let message_id = panic_message(&repo, config).await;

        let outcome = service.trigger(&message_id, None).await.unwrap();
        assert!(outcome.success);
        assert!(!outcome.keep_armed);
        let row = repo.get_condition_for_message(&message_id).await.unwrap();
        assert!(!row.active);

        // Once disarmed, a later press past the guard window sends nothing.
        clock.advance(Duration::seconds(31));
        assert!(matches!(
            service.trigger(&message_id, Some("u1")).await,
            Err(AppError::Validation(_))
        ));
        assert_eq!(email.count(), 1);
    }

    #[tokio::test]
    async fn test_trigger_by_whatsapp_keyword() {
        let (service, repo, email, _clock) = trigger_service().await;
        let config = PanicConfig::default()
            .with_methods(&[PanicMethod::App, PanicMethod::Whatsapp])
            .unwrap()
            .with_trigger_keyword(Some("MAYDAY"))
            .unwrap();
        panic_message(&repo, config).await;

        assert!(service.trigger_by_keyword("u1", "hello").await.unwrap().is_none());
        let fired = service
            .trigger_by_keyword("u1", " mayday ")
            .await
            .unwrap()
            .unwrap();
        assert!(fired.success);
        assert_eq!(email.count(), 1);
    }
}
