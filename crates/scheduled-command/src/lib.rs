//! A library for running a job on a cron-like schedule.
//!
//! Jobs implement [`Schedulable`] and are either run once or triggered by a
//! schedule string. A schedule is either a six-field cron expression
//! (`"*/10 * * * * *"`, seconds first) or a short interval (`"10s"`, `"5m"`).
//! Ticks never overlap: when a tick is still running at the next trigger, the
//! new trigger is skipped.
//!
//! # Example
//!
//! ```
//! use anyhow::Result;
//! use clap::Parser;
//! use flowstat_scheduled_command::{Schedulable, ScheduleOption};
//!
//! #[derive(Parser, Clone)]
//! struct MyJob {
//!     #[command(flatten)]
//!     schedule: ScheduleOption,
//!
//!     #[arg(long)]
//!     message: String,
//! }
//!
//! #[async_trait::async_trait]
//! impl Schedulable for MyJob {
//!     fn schedule(&self) -> &ScheduleOption {
//!         &self.schedule
//!     }
//!
//!     async fn execute_once(&self) -> Result<()> {
//!         println!("{}", self.message);
//!         Ok(())
//!     }
//! }
//! ```

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use anyhow::{Result, bail};
use clap::Args;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Schedule configuration that can be flattened into command structs.
#[derive(Debug, Args, Clone, Default)]
pub struct ScheduleOption {
    /// Cron expression (seconds first) or interval (e.g. "10s", "5m", "2h").
    /// If not provided, runs once and exits.
    #[arg(
        long,
        help = "Cron expression (e.g. '*/10 * * * * *') or interval (e.g. '10s', '5m')"
    )]
    pub schedule: Option<String>,
}

impl ScheduleOption {
    pub fn new(schedule: impl Into<String>) -> Self {
        Self {
            schedule: Some(schedule.into()),
        }
    }

    /// Check if a schedule is configured
    pub fn is_scheduled(&self) -> bool {
        self.schedule.is_some()
    }

    /// Resolve the configured schedule into a cron expression, if any.
    pub fn cron(&self) -> Result<Option<String>> {
        self.schedule.as_deref().map(schedule_to_cron).transpose()
    }
}

/// Trait for jobs that can be triggered on a schedule.
#[async_trait::async_trait]
pub trait Schedulable: Clone {
    /// Get the schedule configuration.
    fn schedule(&self) -> &ScheduleOption;

    /// Execute one tick of the job.
    async fn execute_once(&self) -> Result<()>;

    /// Execute the job, either once or on schedule until `shutdown` fires.
    async fn execute(&self, shutdown: CancellationToken) -> Result<()>
    where
        Self: Sized + Send + Sync + 'static,
    {
        run_schedulable(self, shutdown).await
    }
}

/// Clears the in-flight marker when a tick finishes, even if it panics.
struct TickGuard(Arc<AtomicBool>);

impl Drop for TickGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Try to mark a tick as in flight. Returns `None` if one already is.
fn begin_tick(in_flight: &Arc<AtomicBool>) -> Option<TickGuard> {
    if in_flight.swap(true, Ordering::AcqRel) {
        None
    } else {
        Some(TickGuard(in_flight.clone()))
    }
}

/// Run a schedulable job, handling both one-time and scheduled execution.
pub async fn run_schedulable<T: Schedulable + Send + Sync + 'static>(
    command: &T,
    shutdown: CancellationToken,
) -> Result<()> {
    let Some(cron_expr) = command.schedule().cron()? else {
        return command.execute_once().await;
    };

    let in_flight = Arc::new(AtomicBool::new(false));
    let command_clone = command.clone();
    let job = Job::new_async(cron_expr.as_str(), move |_uuid, _l| {
        let command = command_clone.clone();
        let in_flight = in_flight.clone();
        Box::pin(async move {
            let Some(_guard) = begin_tick(&in_flight) else {
                warn!("previous tick still running, skipping this trigger");
                return;
            };
            if let Err(e) = command.execute_once().await {
                error!("Scheduled tick failed: {e}");
            }
        })
    })?;

    let mut sched = JobScheduler::new().await?;
    sched.add(job).await?;
    sched.start().await?;

    info!(schedule = %cron_expr, "Scheduler started");

    shutdown.cancelled().await;
    info!("Shutting down scheduler...");
    sched.shutdown().await?;

    Ok(())
}

/// Convert a schedule string to a cron expression.
///
/// Strings containing whitespace are taken as cron expressions and must have
/// six or seven fields. Otherwise supports intervals like "5s", "10m", "2h" or
/// plain numbers (treated as seconds). Intervals must be non-zero and less
/// than 24 hours.
fn schedule_to_cron(s: &str) -> Result<String> {
    let s = s.trim();

    if s.contains(char::is_whitespace) {
        let fields = s.split_whitespace().count();
        if !(6..=7).contains(&fields) {
            bail!("Cron expression '{s}' must have 6 or 7 fields (seconds first), got {fields}");
        }
        return Ok(s.split_whitespace().collect::<Vec<_>>().join(" "));
    }

    let s = s.to_lowercase();
    let duration = if let Some(num_str) = s.strip_suffix('s') {
        let secs: u64 = num_str.parse()?;
        Duration::from_secs(secs)
    } else if let Some(num_str) = s.strip_suffix('m') {
        let mins: u64 = num_str.parse()?;
        Duration::from_secs(mins * 60)
    } else if let Some(num_str) = s.strip_suffix('h') {
        let hours: u64 = num_str.parse()?;
        Duration::from_secs(hours * 3600)
    } else {
        let secs: u64 = s.parse()?;
        Duration::from_secs(secs)
    };

    if duration.is_zero() {
        bail!("Schedule interval '{s}' must be greater than zero");
    }

    // Check if duration is 24 hours or more.
    if duration.as_secs() >= 24 * 3600 {
        bail!(
            "Schedule duration '{}' is too long. Maximum allowed is less than 24 hours.",
            s
        );
    }

    let secs = duration.as_secs();
    if secs < 60 {
        Ok(format!("*/{} * * * * *", secs))
    } else if secs < 3600 {
        let mins = secs / 60;
        Ok(format!("0 */{} * * * *", mins))
    } else {
        let hours = secs / 3600;
        Ok(format!("0 0 */{} * * *", hours))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone)]
    struct OnceJob {
        schedule: ScheduleOption,
        runs: Arc<std::sync::atomic::AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl Schedulable for OnceJob {
        fn schedule(&self) -> &ScheduleOption {
            &self.schedule
        }

        async fn execute_once(&self) -> Result<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_schedule_to_cron() {
        assert_eq!(schedule_to_cron("30s").unwrap(), "*/30 * * * * *");
        assert_eq!(schedule_to_cron("2m").unwrap(), "0 */2 * * * *");
        assert_eq!(schedule_to_cron("2h").unwrap(), "0 0 */2 * * *");

        // Plain numbers are seconds
        assert_eq!(schedule_to_cron("10").unwrap(), "*/10 * * * * *");
        assert_eq!(schedule_to_cron("120").unwrap(), "0 */2 * * * *");

        assert_eq!(schedule_to_cron("5S").unwrap(), "*/5 * * * * *");
        assert_eq!(schedule_to_cron(" 10s ").unwrap(), "*/10 * * * * *");

        assert!(schedule_to_cron("0s").is_err());
        assert!(schedule_to_cron("24h").is_err());
        assert!(schedule_to_cron("86400").is_err());
        assert!(schedule_to_cron("23h").is_ok());
    }

    #[test]
    fn test_cron_expressions_pass_through() {
        assert_eq!(
            schedule_to_cron("*/10 * * * * *").unwrap(),
            "*/10 * * * * *"
        );
        assert_eq!(
            schedule_to_cron("  0,10,20,30,40,50   * * * * * ").unwrap(),
            "0,10,20,30,40,50 * * * * *"
        );
        // Five-field crontab lines lack the seconds column
        assert!(schedule_to_cron("*/10 * * * *").is_err());
    }

    #[test]
    fn test_schedule() {
        let schedule = ScheduleOption::default();
        assert!(!schedule.is_scheduled());
        assert!(schedule.cron().unwrap().is_none());

        let schedule = ScheduleOption::new("10s");
        assert!(schedule.is_scheduled());
        assert_eq!(schedule.cron().unwrap().as_deref(), Some("*/10 * * * * *"));
    }

    #[test]
    fn test_overlapping_ticks_are_rejected() {
        let in_flight = Arc::new(AtomicBool::new(false));

        let first = begin_tick(&in_flight);
        assert!(first.is_some());
        assert!(begin_tick(&in_flight).is_none());

        drop(first);
        assert!(begin_tick(&in_flight).is_some());
    }

    #[tokio::test]
    async fn test_unscheduled_job_runs_once() {
        let job = OnceJob {
            schedule: ScheduleOption::default(),
            runs: Arc::default(),
        };

        job.execute(CancellationToken::new()).await.unwrap();
        assert_eq!(job.runs.load(Ordering::SeqCst), 1);
    }
}
