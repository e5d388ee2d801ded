/// Scheduler Service
/// Runs the notification runner on a cron schedule inside the process.
/// Used only when EVALUATOR_CRON is configured; otherwise an external
/// caller drives POST /notify.
use crate::error::{AppError, Result};
use crate::services::runner::{NotificationRunner, NotifyRequest};
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_cron_scheduler::{Job, JobScheduler};
use uuid::Uuid;

/// How often the evaluator runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerSchedule {
    Minutes(u32),
    Hours(u32),
    /// Six-field cron expression, seconds first
    Cron(String),
}

impl TriggerSchedule {
    /// Convert schedule to cron expression
    pub fn to_cron(&self) -> String {
        match self {
            TriggerSchedule::Minutes(1) => "0 * * * * *".to_string(),
            TriggerSchedule::Minutes(m) => format!("0 */{} * * * *", m),
            TriggerSchedule::Hours(1) => "0 0 * * * *".to_string(),
            TriggerSchedule::Hours(h) => format!("0 0 */{} * * *", h),
            TriggerSchedule::Cron(expr) => expr.clone(),
        }
    }
}

impl FromStr for TriggerSchedule {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        // Either "<number><unit>" ("5m", "1h") or a full cron expression
        let s = s.trim();
        if s.is_empty() {
            return Err("Empty schedule".to_string());
        }

        let fields = s.split_whitespace().count();
        if fields > 1 {
            if fields != 6 {
                return Err(format!(
                    "Cron expression needs 6 fields (seconds first), got {}",
                    fields
                ));
            }
            return Ok(TriggerSchedule::Cron(s.to_string()));
        }

        let lower = s.to_lowercase();
        let split = lower.char_indices().last().map_or(0, |(i, _)| i);
        let (number_part, unit) = lower.split_at(split);
        let value: u32 = number_part
            .parse()
            .map_err(|_| format!("Invalid number in schedule: {}", s))?;

        if value == 0 {
            return Err("Schedule value must be greater than 0".to_string());
        }

        match unit {
            "m" => Ok(TriggerSchedule::Minutes(value)),
            "h" => Ok(TriggerSchedule::Hours(value)),
            _ => Err(format!(
                "Invalid schedule unit '{}'. Use 'm' (minutes) or 'h' (hours)",
                unit
            )),
        }
    }
}

/// Cron trigger for the notification runner
pub struct SchedulerService {
    scheduler: Arc<RwLock<JobScheduler>>,
    runner: Arc<NotificationRunner>,
    current_job_id: Arc<RwLock<Option<Uuid>>>,
}

impl SchedulerService {
    pub async fn new(runner: NotificationRunner) -> Result<Self> {
        let scheduler = JobScheduler::new()
            .await
            .map_err(|e| AppError::Scheduler(format!("Failed to create scheduler: {}", e)))?;

        Ok(Self {
            scheduler: Arc::new(RwLock::new(scheduler)),
            runner: Arc::new(runner),
            current_job_id: Arc::new(RwLock::new(None)),
        })
    }

    pub async fn start(&self) -> Result<()> {
        let scheduler = self.scheduler.read().await;
        scheduler
            .start()
            .await
            .map_err(|e| AppError::Scheduler(format!("Failed to start scheduler: {}", e)))?;
        tracing::info!("Evaluator scheduler started");
        Ok(())
    }

    /// Replace the evaluator job with one on `schedule`
    pub async fn schedule(&self, schedule: &TriggerSchedule) -> Result<()> {
        self.cancel().await?;

        let cron_expr = schedule.to_cron();
        let runner = Arc::clone(&self.runner);

        let job = Job::new_async(cron_expr.clone(), move |_uuid, _l| {
            let runner = Arc::clone(&runner);
            Box::pin(async move {
                let request = NotifyRequest {
                    source: Some("cron".to_string()),
                    ..Default::default()
                };
                match runner.run(request).await {
                    Ok(report) => tracing::info!(
                        "Scheduled run: {} due, {} sent, {} failed",
                        report.due,
                        report.sent,
                        report.failed
                    ),
                    Err(e) => tracing::error!("Scheduled run failed: {}", e),
                }
            })
        })
        .map_err(|e| AppError::Scheduler(format!("Failed to create evaluator job: {}", e)))?;

        let job_id = job.guid();

        let scheduler = self.scheduler.write().await;
        scheduler
            .add(job)
            .await
            .map_err(|e| AppError::Scheduler(format!("Failed to schedule job: {}", e)))?;

        let mut current_job = self.current_job_id.write().await;
        *current_job = Some(job_id);

        tracing::info!("Evaluator scheduled: {:?} ({})", schedule, cron_expr);
        Ok(())
    }

    pub async fn cancel(&self) -> Result<()> {
        let mut current_job = self.current_job_id.write().await;

        if let Some(job_id) = *current_job {
            let scheduler = self.scheduler.write().await;
            scheduler
                .remove(&job_id)
                .await
                .map_err(|e| AppError::Scheduler(format!("Failed to remove job: {}", e)))?;

            *current_job = None;
            tracing::info!("Evaluator schedule cancelled");
        }

        Ok(())
    }

    pub async fn shutdown(&self) -> Result<()> {
        let mut scheduler = self.scheduler.write().await;
        scheduler
            .shutdown()
            .await
            .map_err(|e| AppError::Scheduler(format!("Failed to shutdown scheduler: {}", e)))?;
        tracing::info!("Evaluator scheduler shutdown");
        Ok(())
    }
}
