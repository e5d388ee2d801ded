//! Repository layer for database operations
//!
//! All SQL lives here. Services receive rows and decide what they mean.

use super::models::*;
use crate::error::{AppError, Result};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

const CONDITION_SELECT: &str = r#"
    SELECT c.id, c.message_id, c.condition_type, c.active,
           c.hours_threshold, c.minutes_threshold, c.last_checked, c.next_check,
           c.trigger_date, c.recurring_pattern, c.reminder_hours, c.reminder_minutes,
           c.panic_config, c.recipients, c.whatsapp_enabled, c.confirmation_threshold,
           (SELECT COUNT(*) FROM group_confirmations g WHERE g.condition_id = c.id)
               AS confirmation_count,
           c.pin_code, c.unlock_delay_hours, c.expiry_hours, c.created_at, c.updated_at
    FROM message_conditions c
"#;

/// Repository for database operations
#[derive(Clone)]
pub struct Repository {
    pool: SqlitePool,
}

impl Repository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    // ===== Profiles =====

    /// Create or update an owner's contact details
    pub async fn upsert_profile(
        &self,
        user_id: &str,
        email: Option<&str>,
        whatsapp_number: Option<&str>,
    ) -> Result<UserProfile> {
        let profile = sqlx::query_as::<_, UserProfile>(
            r#"
            INSERT INTO user_profiles (user_id, email, whatsapp_number, created_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(user_id) DO UPDATE SET
                email = excluded.email,
                whatsapp_number = excluded.whatsapp_number
            RETURNING *
            "#,
        )
        .bind(user_id)
        .bind(email)
        .bind(whatsapp_number)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;

        tracing::debug!("Upserted profile: {}", user_id);
        Ok(profile)
    }

    pub async fn get_profile(&self, user_id: &str) -> Result<Option<UserProfile>> {
        let profile =
            sqlx::query_as::<_, UserProfile>("SELECT * FROM user_profiles WHERE user_id = ?")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(profile)
    }

    pub async fn find_profile_by_whatsapp(&self, number: &str) -> Result<Option<UserProfile>> {
        let profile = sqlx::query_as::<_, UserProfile>(
            "SELECT * FROM user_profiles WHERE whatsapp_number = ? LIMIT 1",
        )
        .bind(number)
        .fetch_optional(&self.pool)
        .await?;

        Ok(profile)
    }

    // ===== Messages =====

    pub async fn create_message(&self, req: CreateMessageRequest) -> Result<Message> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let attachments = serde_json::to_string(&req.attachments)?;
        let location = req.location.as_ref();

        let message = sqlx::query_as::<_, Message>(
            r#"
            INSERT INTO messages (id, user_id, title, content, attachments,
                                  location_latitude, location_longitude, location_name,
                                  created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(&id)
        .bind(&req.user_id)
        .bind(&req.title)
        .bind(&req.content)
        .bind(attachments)
        .bind(location.map(|l| l.latitude))
        .bind(location.map(|l| l.longitude))
        .bind(location.and_then(|l| l.name.clone()))
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        tracing::debug!("Created message: {}", id);
        Ok(message)
    }

    pub async fn get_message(&self, id: &str) -> Result<Message> {
        sqlx::query_as::<_, Message>("SELECT * FROM messages WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| AppError::MessageNotFound(id.to_string()))
    }

    pub async fn delete_message(&self, id: &str) -> Result<()> {
        let rows = sqlx::query("DELETE FROM messages WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?
            .rows_affected();

        if rows == 0 {
            return Err(AppError::MessageNotFound(id.to_string()));
        }

        tracing::debug!("Deleted message: {}", id);
        Ok(())
    }

    // ===== Conditions =====

    pub async fn create_condition(&self, req: CreateConditionRequest) -> Result<ConditionRow> {
        req.validate()?;
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();

        let recurring_pattern = req
            .recurring_pattern
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let panic_config = req
            .panic_config
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        sqlx::query(
            r#"
            INSERT INTO message_conditions (
                id, message_id, condition_type, active, hours_threshold, minutes_threshold,
                last_checked, next_check, trigger_date, recurring_pattern,
                reminder_hours, reminder_minutes, panic_config, recipients, whatsapp_enabled,
                confirmation_threshold, pin_code, unlock_delay_hours, expiry_hours,
                created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, '[]', ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&req.message_id)
        .bind(req.kind.as_str())
        .bind(req.active)
        .bind(req.hours_threshold)
        .bind(req.minutes_threshold)
        .bind(req.last_checked.unwrap_or(now))
        .bind(req.next_check)
        .bind(req.trigger_date)
        .bind(recurring_pattern)
        .bind(serde_json::to_string(&req.reminder_minutes)?)
        .bind(panic_config)
        .bind(serde_json::to_string(&req.recipients)?)
        .bind(req.whatsapp_enabled)
        .bind(req.confirmation_threshold)
        .bind(&req.pin_code)
        .bind(req.unlock_delay_hours)
        .bind(req.expiry_hours)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        tracing::debug!("Created {} condition {} for message {}", req.kind, id, req.message_id);
        self.get_condition(&id).await
    }

    pub async fn get_condition(&self, id: &str) -> Result<ConditionRow> {
        sqlx::query_as::<_, ConditionRow>(&format!("{} WHERE c.id = ?", CONDITION_SELECT))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| AppError::ConditionNotFound(id.to_string()))
    }

    pub async fn get_condition_for_message(&self, message_id: &str) -> Result<ConditionRow> {
        sqlx::query_as::<_, ConditionRow>(&format!("{} WHERE c.message_id = ?", CONDITION_SELECT))
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| AppError::ConditionNotFound(format!("message {}", message_id)))
    }

    /// All conditions, optionally restricted to armed ones
    pub async fn list_conditions(&self, active_only: bool) -> Result<Vec<ConditionRow>> {
        let sql = if active_only {
            format!("{} WHERE c.active = 1 ORDER BY c.created_at ASC", CONDITION_SELECT)
        } else {
            format!("{} ORDER BY c.created_at ASC", CONDITION_SELECT)
        };

        let rows = sqlx::query_as::<_, ConditionRow>(&sql)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows)
    }

    pub async fn list_conditions_for_user(&self, user_id: &str) -> Result<Vec<ConditionRow>> {
        let rows = sqlx::query_as::<_, ConditionRow>(&format!(
            "{} JOIN messages m ON m.id = c.message_id WHERE m.user_id = ? ORDER BY c.created_at ASC",
            CONDITION_SELECT
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    pub async fn count_active_conditions(&self) -> Result<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM message_conditions WHERE active = 1")
                .fetch_one(&self.pool)
                .await?;

        Ok(count)
    }

    pub async fn set_next_check(&self, id: &str, next_check: Option<DateTime<Utc>>) -> Result<()> {
        sqlx::query("UPDATE message_conditions SET next_check = ?, updated_at = ? WHERE id = ?")
            .bind(next_check)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;

        tracing::debug!("Condition {} next_check = {:?}", id, next_check);
        Ok(())
    }

    /// Reset `last_checked` on every condition belonging to the user
    pub async fn touch_last_checked_for_user(
        &self,
        user_id: &str,
        at: DateTime<Utc>,
    ) -> Result<u64> {
        let rows = sqlx::query(
            r#"
            UPDATE message_conditions SET last_checked = ?, updated_at = ?
            WHERE message_id IN (SELECT id FROM messages WHERE user_id = ?)
            "#,
        )
        .bind(at)
        .bind(Utc::now())
        .bind(user_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        tracing::debug!("Checked in user {} ({} conditions)", user_id, rows);
        Ok(rows)
    }

    /// Take the dispatch claim on a condition unless another run holds a
    /// claim younger than the lease. Returns whether the claim was taken.
    pub async fn try_claim_dispatch(&self, id: &str, now_ms: i64, lease_ms: i64) -> Result<bool> {
        let rows = sqlx::query(
            r#"
            UPDATE message_conditions SET dispatch_claimed_at = ?
            WHERE id = ? AND (dispatch_claimed_at IS NULL OR dispatch_claimed_at < ?)
            "#,
        )
        .bind(now_ms)
        .bind(id)
        .bind(now_ms - lease_ms)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(rows == 1)
    }

    /// Drop the claim without changing the condition
    pub async fn release_dispatch(&self, id: &str) -> Result<()> {
        sqlx::query("UPDATE message_conditions SET dispatch_claimed_at = NULL WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Apply the post-delivery state and drop the claim in one write
    pub async fn finish_dispatch(
        &self,
        id: &str,
        active: bool,
        next_check: Option<DateTime<Utc>>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE message_conditions
            SET active = ?, next_check = COALESCE(?, next_check),
                dispatch_claimed_at = NULL, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(active)
        .bind(next_check)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;

        tracing::debug!("Finished dispatch for condition {} (active = {})", id, active);
        Ok(())
    }

    // ===== Group confirmations =====

    /// Record a recipient's vote; returns false when it was already recorded
    pub async fn add_group_confirmation(
        &self,
        condition_id: &str,
        recipient_id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let rows = sqlx::query(
            r#"
            INSERT OR IGNORE INTO group_confirmations (id, condition_id, recipient_id, confirmed_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(condition_id)
        .bind(recipient_id)
        .bind(at)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(rows == 1)
    }

    // ===== Deliveries =====

    pub async fn create_delivery(&self, record: &DeliveryRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO delivered_messages (delivery_id, message_id, condition_id, recipient_id,
                                            recipient_email, delivered_at, viewed_at,
                                            viewed_count, device_info)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.delivery_id)
        .bind(&record.message_id)
        .bind(&record.condition_id)
        .bind(&record.recipient_id)
        .bind(&record.recipient_email)
        .bind(record.delivered_at)
        .bind(record.viewed_at)
        .bind(record.viewed_count)
        .bind(&record.device_info)
        .execute(&self.pool)
        .await?;

        tracing::debug!(
            "Recorded delivery {} of message {} to {}",
            record.delivery_id,
            record.message_id,
            record.recipient_id
        );
        Ok(())
    }

    pub async fn get_delivery(&self, delivery_id: &str) -> Result<DeliveryRecord> {
        sqlx::query_as::<_, DeliveryRecord>(
            "SELECT * FROM delivered_messages WHERE delivery_id = ?",
        )
        .bind(delivery_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::DeliveryNotFound(delivery_id.to_string()))
    }

    pub async fn list_deliveries_for_message(&self, message_id: &str) -> Result<Vec<DeliveryRecord>> {
        let records = sqlx::query_as::<_, DeliveryRecord>(
            "SELECT * FROM delivered_messages WHERE message_id = ? ORDER BY delivered_at ASC",
        )
        .bind(message_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    /// Count a successful view of a delivered message
    pub async fn record_view(
        &self,
        delivery_id: &str,
        message_id: &str,
        at: DateTime<Utc>,
        device_info: Option<&str>,
    ) -> Result<DeliveryRecord> {
        let record = sqlx::query_as::<_, DeliveryRecord>(
            r#"
            UPDATE delivered_messages
            SET viewed_count = viewed_count + 1,
                viewed_at = ?,
                device_info = COALESCE(?, device_info)
            WHERE delivery_id = ? AND message_id = ?
            RETURNING *
            "#,
        )
        .bind(at)
        .bind(device_info)
        .bind(delivery_id)
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::DeliveryNotFound(delivery_id.to_string()))?;

        tracing::debug!("Recorded view {} of delivery {}", record.viewed_count, delivery_id);
        Ok(record)
    }

    // ===== Creator reminders =====

    /// Record a sent reminder; returns false if this (condition, offset,
    /// deadline) entry was already sent
    pub async fn record_sent_reminder(
        &self,
        condition_id: &str,
        message_id: &str,
        user_id: &str,
        offset_minutes: u32,
        deadline: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let rows = sqlx::query(
            r#"
            INSERT OR IGNORE INTO sent_reminders
                (id, condition_id, message_id, user_id, offset_minutes, deadline, sent_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(condition_id)
        .bind(message_id)
        .bind(user_id)
        .bind(i64::from(offset_minutes))
        .bind(deadline)
        .bind(at)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(rows == 1)
    }

    pub async fn reminder_sent(
        &self,
        condition_id: &str,
        offset_minutes: u32,
        deadline: DateTime<Utc>,
    ) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM sent_reminders
            WHERE condition_id = ? AND offset_minutes = ? AND deadline = ?
            "#,
        )
        .bind(condition_id)
        .bind(i64::from(offset_minutes))
        .bind(deadline)
        .fetch_one(&self.pool)
        .await?;

        Ok(count > 0)
    }

    pub async fn forget_sent_reminder(
        &self,
        condition_id: &str,
        offset_minutes: u32,
        deadline: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "DELETE FROM sent_reminders WHERE condition_id = ? AND offset_minutes = ? AND deadline = ?",
        )
        .bind(condition_id)
        .bind(i64::from(offset_minutes))
        .bind(deadline)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn list_sent_reminders(&self, condition_id: &str) -> Result<Vec<SentReminder>> {
        let reminders = sqlx::query_as::<_, SentReminder>(
            "SELECT * FROM sent_reminders WHERE condition_id = ? ORDER BY sent_at ASC",
        )
        .bind(condition_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(reminders)
    }

    // ===== Audit log =====

    pub async fn log_delivery(
        &self,
        message_id: &str,
        condition_id: &str,
        source: &str,
        is_emergency: bool,
        status: &str,
        detail: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO message_delivery_log
                (id, message_id, condition_id, source, is_emergency, status, detail, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(message_id)
        .bind(condition_id)
        .bind(source)
        .bind(is_emergency)
        .bind(status)
        .bind(detail)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn list_delivery_log(&self, message_id: &str) -> Result<Vec<DeliveryLogEntry>> {
        let entries = sqlx::query_as::<_, DeliveryLogEntry>(
            "SELECT * FROM message_delivery_log WHERE message_id = ? ORDER BY created_at ASC",
        )
        .bind(message_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(entries)
    }

    // ===== Dedup markers =====

    /// Set the marker unless one newer than `cutoff_ms` exists. Returns
    /// whether the marker was set.
    pub async fn try_mark_dedup(
        &self,
        scope: &str,
        key: &str,
        now_ms: i64,
        cutoff_ms: i64,
    ) -> Result<bool> {
        let rows = sqlx::query(
            r#"
            INSERT INTO dedup_markers (scope, key, marked_at_ms) VALUES (?, ?, ?)
            ON CONFLICT(scope, key) DO UPDATE SET marked_at_ms = excluded.marked_at_ms
            WHERE dedup_markers.marked_at_ms <= ?
            "#,
        )
        .bind(scope)
        .bind(key)
        .bind(now_ms)
        .bind(cutoff_ms)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(rows == 1)
    }

    pub async fn dedup_marked_at(&self, scope: &str, key: &str) -> Result<Option<i64>> {
        let marked: Option<i64> = sqlx::query_scalar(
            "SELECT marked_at_ms FROM dedup_markers WHERE scope = ? AND key = ?",
        )
        .bind(scope)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(marked)
    }

    pub async fn remove_dedup(&self, scope: &str, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM dedup_markers WHERE scope = ? AND key = ?")
            .bind(scope)
            .bind(key)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn purge_dedup(&self, scope: &str, older_than_ms: i64) -> Result<u64> {
        let rows = sqlx::query("DELETE FROM dedup_markers WHERE scope = ? AND marked_at_ms < ?")
            .bind(scope)
            .bind(older_than_ms)
            .execute(&self.pool)
            .await?
            .rows_affected();

        Ok(rows)
    }
}
