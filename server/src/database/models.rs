//! Database models
//!
//! Rust structs representing database rows. JSON-shaped columns stay as
//! TEXT here and are decoded by the domain layer.

use crate::domain::{
    to_hours_and_minutes, to_minutes, validate_reminder_offset, ConditionKind, PanicConfig,
    Recipient, RecurringPattern,
};
use crate::error::ValidationError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Account-level contact details for a message owner
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct UserProfile {
    pub user_id: String,
    pub email: Option<String>,
    pub whatsapp_number: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// File attached to a message (stored in external object storage)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    pub size: i64,
    #[serde(rename = "type")]
    pub mime_type: String,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Message {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub content: Option<String>,
    /// JSON array of [`Attachment`]
    pub attachments: String,
    pub location_latitude: Option<f64>,
    pub location_longitude: Option<f64>,
    pub location_name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Message {
    /// Decoded attachments; a malformed column yields none
    pub fn attachment_list(&self) -> Vec<Attachment> {
        serde_json::from_str(&self.attachments).unwrap_or_else(|e| {
            tracing::warn!("Ignoring malformed attachments on message {}: {}", self.id, e);
            Vec::new()
        })
    }

    pub fn location(&self) -> Option<Location> {
        match (self.location_latitude, self.location_longitude) {
            (Some(latitude), Some(longitude)) => Some(Location {
                latitude,
                longitude,
                name: self.location_name.clone(),
            }),
            _ => None,
        }
    }
}

/// Create message request
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateMessageRequest {
    pub user_id: String,
    pub title: String,
    pub content: Option<String>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    pub location: Option<Location>,
}

/// Raw `message_conditions` row, with the group-confirmation vote count
/// joined in
#[derive(Debug, Clone, FromRow)]
pub struct ConditionRow {
    pub id: String,
    pub message_id: String,
    pub condition_type: String,
    pub active: bool,
    pub hours_threshold: Option<i64>,
    pub minutes_threshold: Option<i64>,
    pub last_checked: DateTime<Utc>,
    pub next_check: Option<DateTime<Utc>>,
    pub trigger_date: Option<DateTime<Utc>>,
    pub recurring_pattern: Option<String>,
    pub reminder_hours: String,
    pub reminder_minutes: String,
    pub panic_config: Option<String>,
    pub recipients: String,
    pub whatsapp_enabled: bool,
    pub confirmation_threshold: Option<i64>,
    pub confirmation_count: i64,
    pub pin_code: Option<String>,
    pub unlock_delay_hours: Option<i64>,
    pub expiry_hours: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One recipient's copy of a delivered message
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct DeliveryRecord {
    pub delivery_id: String,
    pub message_id: String,
    pub condition_id: String,
    pub recipient_id: String,
    pub recipient_email: String,
    pub delivered_at: DateTime<Utc>,
    pub viewed_at: Option<DateTime<Utc>>,
    pub viewed_count: i64,
    pub device_info: Option<String>,
}

/// Creator reminder already sent for a particular deadline
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SentReminder {
    pub id: String,
    pub condition_id: String,
    pub message_id: String,
    pub user_id: String,
    pub offset_minutes: i64,
    pub deadline: DateTime<Utc>,
    pub sent_at: DateTime<Utc>,
}

/// Audit entry for a notification attempt
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct DeliveryLogEntry {
    pub id: String,
    pub message_id: String,
    pub condition_id: String,
    pub source: String,
    pub is_emergency: bool,
    pub status: String,
    pub detail: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Create condition request
#[derive(Debug, Clone)]
pub struct CreateConditionRequest {
    pub message_id: String,
    pub kind: ConditionKind,
    pub active: bool,
    pub hours_threshold: Option<i64>,
    pub minutes_threshold: Option<i64>,
    /// Defaults to the creation time
    pub last_checked: Option<DateTime<Utc>>,
    pub next_check: Option<DateTime<Utc>>,
    pub trigger_date: Option<DateTime<Utc>>,
    pub recurring_pattern: Option<RecurringPattern>,
    pub reminder_minutes: Vec<u32>,
    pub panic_config: Option<PanicConfig>,
    pub recipients: Vec<Recipient>,
    pub whatsapp_enabled: bool,
    pub confirmation_threshold: Option<i64>,
    pub pin_code: Option<String>,
    pub unlock_delay_hours: Option<i64>,
    pub expiry_hours: Option<i64>,
}

impl CreateConditionRequest {
    pub fn new(message_id: impl Into<String>, kind: ConditionKind) -> Self {
        Self {
            message_id: message_id.into(),
            kind,
            active: true,
            hours_threshold: None,
            minutes_threshold: None,
            last_checked: None,
            next_check: None,
            trigger_date: None,
            recurring_pattern: None,
            reminder_minutes: Vec::new(),
            panic_config: None,
            recipients: Vec::new(),
            whatsapp_enabled: false,
            confirmation_threshold: None,
            pin_code: None,
            unlock_delay_hours: None,
            expiry_hours: None,
        }
    }

    /// Reject reminder offsets, patterns and panic settings the editor
    /// would not accept
    pub fn validate(&self) -> Result<(), ValidationError> {
        let threshold = match self.kind {
            ConditionKind::NoCheckIn
            | ConditionKind::RegularCheckIn
            | ConditionKind::InactivityToRecurring => {
                let part = |v: Option<i64>| u32::try_from(v.unwrap_or(0).max(0)).unwrap_or(u32::MAX);
                to_minutes(part(self.hours_threshold), part(self.minutes_threshold))
            }
            _ => u32::MAX,
        };

        let mut accepted = Vec::with_capacity(self.reminder_minutes.len());
        for offset in &self.reminder_minutes {
            let split = to_hours_and_minutes(*offset);
            let total = validate_reminder_offset(split.hours, split.minutes, &accepted, threshold)?;
            accepted.push(total);
        }

        if let Some(pattern) = &self.recurring_pattern {
            pattern.validate()?;
        }
        if let Some(config) = &self.panic_config {
            config.validate()?;
        }
        Ok(())
    }
}
