//! Application state and initialization
//!
//! All services are built here from the configuration and made available to
//! the HTTP handlers through AppState.

use crate::clock::SharedClock;
use crate::config::{
    DedupBackend, ServerConfig, NOTIFICATION_DEDUP_RETENTION_SECS, NOTIFICATION_DEDUP_WINDOW_SECS,
    PANIC_DEDUP_RETENTION_SECS, PANIC_DEDUP_WINDOW_SECS,
};
use crate::database::Repository;
use crate::error::Result;
use crate::providers::{self, EmailProvider, WhatsAppProvider};
use crate::services::{
    AccessService, CheckInService, DedupGuard, DedupStore, DispatchService, EvaluatorService,
    InMemoryDedupStore, NotificationRunner, PanicTriggerService, RemindersService, SqlDedupStore,
};
use chrono::Duration;
use sqlx::SqlitePool;
use std::sync::Arc;

/// Central application state holding all services
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub repo: Repository,
    pub runner: NotificationRunner,
    pub access: AccessService,
    pub check_in: CheckInService,
    pub panic: PanicTriggerService,
}

impl AppState {
    /// Build the state with providers taken from the configuration
    pub fn new(config: ServerConfig, pool: SqlitePool, clock: SharedClock) -> Result<Self> {
        let email = providers::email_from_config(&config)?;
        let whatsapp = providers::whatsapp_from_config(&config)?;
        Ok(Self::with_providers(config, pool, clock, email, whatsapp))
    }

    pub fn with_providers(
        config: ServerConfig,
        pool: SqlitePool,
        clock: SharedClock,
        email: Arc<dyn EmailProvider>,
        whatsapp: Arc<dyn WhatsAppProvider>,
    ) -> Self {
        let repo = Repository::new(pool);

        let store: Arc<dyn DedupStore> = match config.dedup_backend {
            DedupBackend::Memory => Arc::new(InMemoryDedupStore::new()),
            DedupBackend::Database => Arc::new(SqlDedupStore::new(repo.clone())),
        };
        tracing::info!("Dedup markers kept in {}", config.dedup_backend.as_str());

        let notification_guard = DedupGuard::new(
            store.clone(),
            clock.clone(),
            "notification",
            Duration::seconds(NOTIFICATION_DEDUP_WINDOW_SECS),
            Duration::seconds(NOTIFICATION_DEDUP_RETENTION_SECS),
        );
        let panic_guard = DedupGuard::new(
            store,
            clock.clone(),
            "panic",
            Duration::seconds(PANIC_DEDUP_WINDOW_SECS),
            Duration::seconds(PANIC_DEDUP_RETENTION_SECS),
        );

        let dispatch = DispatchService::new(
            repo.clone(),
            clock.clone(),
            email.clone(),
            whatsapp,
            notification_guard,
            config.public_base_url.clone(),
            config.email_retry_delay,
        );
        let runner = NotificationRunner::new(
            repo.clone(),
            clock.clone(),
            EvaluatorService::new(repo.clone(), clock.clone()),
            dispatch.clone(),
            RemindersService::new(repo.clone(), clock.clone(), email),
            config.dedup_backend,
        );

        Self {
            access: AccessService::new(repo.clone(), clock.clone()),
            check_in: CheckInService::new(repo.clone(), clock),
            panic: PanicTriggerService::new(repo.clone(), dispatch, panic_guard),
            runner,
            repo,
            config: Arc::new(config),
        }
    }
}
