//! Recurring maintenance: cron-driven cleanup and the hot-reload ticker.

use chrono::Utc;
use cron::Schedule;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::ingest::QueueIngestor;

#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error("invalid cron expression {expr:?}: {source}")]
    InvalidCron {
        expr: String,
        source: cron::error::Error,
    },
}

/// Parse a schedule, accepting the conventional five-field form by
/// prepending a seconds column.
pub fn parse_cron(expr: &str) -> Result<Schedule, ScheduleError> {
    let normalized = if expr.split_whitespace().count() == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    };
    Schedule::from_str(&normalized).map_err(|source| ScheduleError::InvalidCron {
        expr: expr.to_string(),
        source,
    })
}

/// Enqueue a CLEANUP job on every cron firing until shutdown.
///
/// The job itself carries `days_to_keep`; the schedule only decides when
/// it runs (daily at 02:00 by default).
pub fn spawn_cleanup_cron(
    ingestor: QueueIngestor,
    cron_expr: &str,
    days_to_keep: u32,
    shutdown: watch::Receiver<bool>,
) -> Result<JoinHandle<()>, ScheduleError> {
    let schedule = parse_cron(cron_expr)?;
    info!(cron = cron_expr, days_to_keep, "Cleanup schedule armed");

    Ok(tokio::spawn(run_cron(
        schedule,
        days_to_keep,
        ingestor,
        shutdown,
    )))
}

async fn run_cron(
    schedule: Schedule,
    days_to_keep: u32,
    ingestor: QueueIngestor,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let Some(next) = schedule.upcoming(Utc).next() else {
            error!("Cleanup schedule has no future firings, stopping");
            return;
        };
        let wait = (next - Utc::now())
            .to_std()
            .unwrap_or(std::time::Duration::from_secs(0));

        tokio::select! {
            _ = tokio::time::sleep(wait) => {
                match ingestor.schedule_cleanup_once(days_to_keep).await {
                    Ok(job_id) => info!(%job_id, "Scheduled cleanup enqueued"),
                    Err(e) => error!(error = %e, "Failed to enqueue scheduled cleanup"),
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("Cleanup schedule stopped");
                    return;
                }
            }
        }
    }
}

/// Spawn the rule hot-reload loop when an interval is configured.
pub fn spawn_hot_reload(
    repository: Arc<vigil_engine::RuleRepository>,
    interval: Option<std::time::Duration>,
    shutdown: watch::Receiver<bool>,
) -> Option<JoinHandle<()>> {
    interval.map(|interval| tokio::spawn(repository.hot_reload(interval, shutdown)))
}
