//! Application configuration
//!
//! Central location for the timing constants used by the dispatch and panic
//! logic, plus the server configuration loaded from environment variables.
//! All settings have defaults so the service starts with zero configuration
//! for local development.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

// ===== Time arithmetic =====

/// Reminder offsets and thresholds are edited in quarter-hour steps
pub const QUARTER_HOUR_MINUTES: u32 = 15;

// ===== Panic trigger =====

/// A first press arms confirmation; a second press must follow within this window
pub const PANIC_CONFIRM_WINDOW_SECS: i64 = 3;

/// Cancellation windows a panic condition may be configured with
pub const VALID_CANCEL_WINDOWS: &[u32] = &[0, 5, 10, 15, 30, 60];

/// Default cancellation window for new panic configurations
pub const DEFAULT_CANCEL_WINDOW_SECS: u32 = 10;

/// Repeat fires of the same message inside this window are treated as already sent
pub const PANIC_DEDUP_WINDOW_SECS: i64 = 30;

/// Panic guard entries older than this are purged
pub const PANIC_DEDUP_RETENTION_SECS: i64 = 60;

/// Fire attempts made by the panic runner before reporting failure
pub const PANIC_MAX_ATTEMPTS: u32 = 2;

/// Backoff between panic fire attempts is this many milliseconds times the attempt number
pub const PANIC_BACKOFF_STEP_MS: u64 = 1_500;

/// Countdown shown after a successful panic fire before reload / navigation
pub const PANIC_SUCCESS_COUNTDOWN_SECS: i64 = 3;

/// Keyword an owner sends over WhatsApp to check in
pub const WHATSAPP_CHECK_IN_KEYWORD: &str = "CHECKIN";

// ===== Notification dispatch =====

/// Repeat dispatches of the same message inside this window are skipped
pub const NOTIFICATION_DEDUP_WINDOW_SECS: i64 = 5 * 60;

/// Notification guard entries older than this are purged
pub const NOTIFICATION_DEDUP_RETENTION_SECS: i64 = 10 * 60;

/// Email attempts for emergency (panic) messages
pub const EMERGENCY_EMAIL_ATTEMPTS: u32 = 2;

/// Email attempts for every other message
pub const STANDARD_EMAIL_ATTEMPTS: u32 = 1;

/// Fixed delay between email attempts
pub const DEFAULT_EMAIL_RETRY_DELAY_SECS: u64 = 5;

/// A dispatch claim older than this is considered abandoned
pub const DISPATCH_CLAIM_LEASE_SECS: i64 = 15 * 60;

/// Which store backs the dedup guards
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupBackend {
    /// Process-local map; correct for a single instance only
    Memory,
    /// `dedup_markers` table; shared by every instance using the database
    Database,
}

impl DedupBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            DedupBackend::Memory => "memory",
            DedupBackend::Database => "database",
        }
    }
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP API.
    /// Env: `HTTP_ADDR`, default `0.0.0.0:8080`
    pub http_addr: SocketAddr,

    /// SQLite database file.
    /// Env: `DATABASE_PATH`, default `./data/echovault.db`
    pub database_path: PathBuf,

    /// Base URL used to build links in delivery emails.
    /// Env: `PUBLIC_BASE_URL`, default `http://localhost:8080`
    pub public_base_url: String,

    /// Email provider endpoint and credentials.
    /// Env: `EMAIL_API_URL`, `EMAIL_API_KEY`, `EMAIL_FROM`.
    /// Without a key, emails are logged instead of sent.
    pub email_api_url: String,
    pub email_api_key: Option<String>,
    pub email_from: String,

    /// WhatsApp provider endpoint and token.
    /// Env: `WHATSAPP_API_URL`, `WHATSAPP_TOKEN`.
    pub whatsapp_api_url: Option<String>,
    pub whatsapp_token: Option<String>,

    /// Optional cron expression for the in-process evaluator trigger.
    /// Env: `EVALUATOR_CRON` (six fields, seconds first)
    pub evaluator_cron: Option<String>,

    /// Env: `DEDUP_BACKEND` (`memory` | `database`), default `memory`
    pub dedup_backend: DedupBackend,

    /// Bearer token required on `POST /notify` when set.
    /// Env: `TRIGGER_TOKEN`
    pub trigger_token: Option<String>,

    /// Env: `EMAIL_RETRY_DELAY_SECS`, default 5
    pub email_retry_delay: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], 8080).into(),
            database_path: PathBuf::from("./data/echovault.db"),
            public_base_url: "http://localhost:8080".to_string(),
            email_api_url: "https://api.resend.com/emails".to_string(),
            email_api_key: None,
            email_from: "EchoVault <notifications@echovault.local>".to_string(),
            whatsapp_api_url: None,
            whatsapp_token: None,
            evaluator_cron: None,
            dedup_backend: DedupBackend::Memory,
            trigger_token: None,
            email_retry_delay: Duration::from_secs(DEFAULT_EMAIL_RETRY_DELAY_SECS),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(addr) = lookup("HTTP_ADDR") {
            match addr.parse::<SocketAddr>() {
                Ok(parsed) => config.http_addr = parsed,
                Err(_) => tracing::warn!(value = %addr, "Invalid HTTP_ADDR, using default"),
            }
        }

        if let Some(path) = lookup("DATABASE_PATH") {
            config.database_path = PathBuf::from(path);
        }

        if let Some(url) = lookup("PUBLIC_BASE_URL") {
            config.public_base_url = url.trim_end_matches('/').to_string();
        }

        if let Some(url) = lookup("EMAIL_API_URL") {
            config.email_api_url = url;
        }
        config.email_api_key = non_empty(lookup("EMAIL_API_KEY"));
        if let Some(from) = non_empty(lookup("EMAIL_FROM")) {
            config.email_from = from;
        }

        config.whatsapp_api_url = non_empty(lookup("WHATSAPP_API_URL"));
        config.whatsapp_token = non_empty(lookup("WHATSAPP_TOKEN"));
        config.evaluator_cron = non_empty(lookup("EVALUATOR_CRON"));
        config.trigger_token = non_empty(lookup("TRIGGER_TOKEN"));

        if let Some(backend) = lookup("DEDUP_BACKEND") {
            match backend.trim().to_lowercase().as_str() {
                "memory" => config.dedup_backend = DedupBackend::Memory,
                "database" | "db" => config.dedup_backend = DedupBackend::Database,
                other => tracing::warn!(value = %other, "Invalid DEDUP_BACKEND, using memory"),
            }
        }

        if let Some(delay) = lookup("EMAIL_RETRY_DELAY_SECS") {
            match delay.parse::<u64>() {
                Ok(secs) => config.email_retry_delay = Duration::from_secs(secs),
                Err(_) => tracing::warn!(value = %delay, "Invalid EMAIL_RETRY_DELAY_SECS, using default"),
            }
        }

        config
    }

    /// Whether a WhatsApp provider is configured at all
    pub fn whatsapp_configured(&self) -> bool {
        self.whatsapp_api_url.is_some() && self.whatsapp_token.is_some()
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}
