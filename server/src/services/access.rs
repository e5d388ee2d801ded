//! Public access security gate
//!
//! Decides what a recipient opening a delivery link gets to see. Gates are
//! applied at view time only: expiry first, then the unlock delay, then
//! the PIN.

use crate::clock::SharedClock;
use crate::database::{DeliveryRecord, Message, Repository};
use crate::domain::{AccessPolicy, Condition};
use crate::error::{AppError, Result};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use subtle::ConstantTimeEq;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityStatus {
    pub has_pin_code: bool,
    pub has_delayed_access: bool,
    pub has_expiry: bool,
    pub unlock_date: DateTime<Utc>,
    pub expiry_date: Option<DateTime<Utc>>,
    pub is_expired: bool,
    pub pin_verified: bool,
}

impl SecurityStatus {
    pub fn decision(&self, now: DateTime<Utc>) -> AccessDecision {
        if self.is_expired {
            // is_expired implies an expiry date
            AccessDecision::Expired(self.expiry_date.unwrap_or(now))
        } else if self.has_delayed_access && now < self.unlock_date {
            AccessDecision::Locked(self.unlock_date)
        } else if self.has_pin_code && !self.pin_verified {
            AccessDecision::PinRequired
        } else {
            AccessDecision::Granted
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessDecision {
    Expired(DateTime<Utc>),
    Locked(DateTime<Utc>),
    PinRequired,
    Granted,
}

/// Offsets past the end of the calendar saturate.
fn offset_hours(base: DateTime<Utc>, hours: i64) -> DateTime<Utc> {
    Duration::try_hours(hours)
        .and_then(|offset| base.checked_add_signed(offset))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Work out the gates for one delivery.
///
/// Without a delivery record the base instant is `now`, so access is
/// immediate and not expired.
pub fn check_security_conditions(
    policy: &AccessPolicy,
    record: Option<&DeliveryRecord>,
    now: DateTime<Utc>,
) -> SecurityStatus {
    let base = record.map_or(now, |r| r.delivered_at);
    let delay = policy.unlock_delay_hours.filter(|h| *h > 0);
    let expiry = policy.expiry_hours.filter(|h| *h > 0);

    let unlock_date = match (delay, record) {
        (Some(hours), Some(_)) => offset_hours(base, hours),
        _ => now,
    };
    let expiry_date = match (expiry, record) {
        (Some(hours), Some(_)) => Some(offset_hours(base, hours)),
        _ => None,
    };

    SecurityStatus {
        has_pin_code: policy.pin_code.is_some(),
        has_delayed_access: delay.is_some(),
        has_expiry: expiry.is_some(),
        unlock_date,
        expiry_date,
        is_expired: expiry_date.is_some_and(|at| at < now),
        pin_verified: record.is_some_and(|r| r.viewed_count > 0),
    }
}

/// What the viewing page should render
#[derive(Debug, Clone)]
pub enum AccessView {
    Expired(DateTime<Utc>),
    Locked(DateTime<Utc>),
    PinRequired {
        message_id: String,
        delivery_id: String,
        recipient_email: String,
    },
    Content {
        message: Message,
        delivery_id: Option<String>,
    },
}

#[derive(Clone)]
pub struct AccessService {
    repo: Repository,
    clock: SharedClock,
}

impl AccessService {
    pub fn new(repo: Repository, clock: SharedClock) -> Self {
        Self { repo, clock }
    }

    async fn authorized_condition(&self, message_id: &str, recipient_email: &str) -> Result<Condition> {
        let row = self.repo.get_condition_for_message(message_id).await?;
        let condition = Condition::from_row(&row)?;
        if !condition.has_recipient_email(recipient_email) {
            return Err(AppError::Unauthorized(
                "This message was not addressed to you".to_string(),
            ));
        }
        Ok(condition)
    }

    /// Delivery record for the link, if the token belongs to this message
    /// and, when given, to this recipient
    async fn delivery_for(
        &self,
        message_id: &str,
        recipient_email: Option<&str>,
        delivery_id: Option<&str>,
    ) -> Result<Option<DeliveryRecord>> {
        let Some(delivery_id) = delivery_id.filter(|d| !d.is_empty()) else {
            return Ok(None);
        };
        let record = self.repo.get_delivery(delivery_id).await?;
        let owned = recipient_email
            .map_or(true, |email| record.recipient_email.eq_ignore_ascii_case(email.trim()));
        if record.message_id != message_id || !owned {
            return Err(AppError::DeliveryNotFound(delivery_id.to_string()));
        }
        Ok(Some(record))
    }

    pub async fn view(
        &self,
        message_id: &str,
        recipient_email: &str,
        delivery_id: Option<&str>,
    ) -> Result<AccessView> {
        let message = self.repo.get_message(message_id).await?;
        let condition = self.authorized_condition(message_id, recipient_email).await?;
        let record = self
            .delivery_for(message_id, Some(recipient_email), delivery_id)
            .await?;

        let now = self.clock.now();
        let status = check_security_conditions(&condition.access, record.as_ref(), now);
        tracing::debug!("Access check for {}: {:?}", message_id, status);

        Ok(match status.decision(now) {
            AccessDecision::Expired(at) => AccessView::Expired(at),
            AccessDecision::Locked(at) => AccessView::Locked(at),
            // Without a delivery record the form has no token and verify-pin rejects it.
            AccessDecision::PinRequired => AccessView::PinRequired {
                message_id: message_id.to_string(),
                delivery_id: record
                    .map(|r| r.delivery_id)
                    .unwrap_or_default(),
                recipient_email: recipient_email.to_string(),
            },
            AccessDecision::Granted => AccessView::Content {
                message,
                delivery_id: record.map(|r| r.delivery_id),
            },
        })
    }

    /// Check a PIN; a match counts as the first view of the delivery
    pub async fn verify_pin(
        &self,
        pin: &str,
        message_id: &str,
        delivery_id: &str,
        recipient_email: &str,
    ) -> Result<bool> {
        let condition = self.authorized_condition(message_id, recipient_email).await?;
        let record = self
            .delivery_for(message_id, Some(recipient_email), Some(delivery_id))
            .await?
            .ok_or_else(|| AppError::DeliveryNotFound(delivery_id.to_string()))?;

        let now = self.clock.now();
        let status = check_security_conditions(&condition.access, Some(&record), now);
        match status.decision(now) {
            AccessDecision::Expired(_) => {
                return Err(AppError::Unauthorized("This message has expired".to_string()))
            }
            AccessDecision::Locked(_) => {
                return Err(AppError::Unauthorized("This message is still locked".to_string()))
            }
            AccessDecision::PinRequired | AccessDecision::Granted => {}
        }

        let expected = condition.access.pin_code.as_deref().unwrap_or_default();
        let matches: bool = expected.as_bytes().ct_eq(pin.trim().as_bytes()).into();
        if !matches {
            tracing::warn!("Incorrect PIN for delivery {}", delivery_id);
            return Ok(false);
        }

        self.repo
            .record_view(&record.delivery_id, message_id, now, None)
            .await?;
        tracing::info!("PIN verified for delivery {}", delivery_id);
        Ok(true)
    }

    /// Count a view of content the viewer has already been shown
    pub async fn record_view(
        &self,
        message_id: &str,
        delivery_id: &str,
        device_info: Option<&str>,
    ) -> Result<DeliveryRecord> {
        let record = self
            .delivery_for(message_id, None, Some(delivery_id))
            .await?
            .ok_or_else(|| AppError::DeliveryNotFound(delivery_id.to_string()))?;
        let row = self.repo.get_condition_for_message(message_id).await?;
        let condition = Condition::from_row(&row)?;

        let now = self.clock.now();
        let status = check_security_conditions(&condition.access, Some(&record), now);
        if status.decision(now) != AccessDecision::Granted {
            return Err(AppError::Unauthorized(
                "This message is not open for viewing".to_string(),
            ));
        }

        self.repo
            .record_view(delivery_id, message_id, now, device_info)
            .await
    }
}
