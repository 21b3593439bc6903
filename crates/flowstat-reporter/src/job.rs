use crate::{
    Result,
    classifier::classify,
    dispatch::Dispatcher,
    record::RecordBuilder,
    registry::ResourceRegistry,
    settings::ReportConfig,
    stats::{ResourceTimeWindowStat, StatsSource},
    window::{ReportWindow, WINDOW_SIZE_SECS, format_slot},
};
use flowstat_scheduled_command::{Schedulable, ScheduleOption};
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// Reporting switched off; ticks do nothing
    Disabled,
    /// Next tick is the first one since start and is skipped
    Warmup,
    Active,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    Disabled,
    WarmedUp,
    NoData {
        start: i64,
        end: i64,
    },
    Reported {
        window: ReportWindow,
        records: usize,
        skipped_resources: usize,
    },
}

impl TickOutcome {
    fn label(&self) -> &'static str {
        match self {
            TickOutcome::Disabled => "disabled",
            TickOutcome::WarmedUp => "warmup",
            TickOutcome::NoData { .. } => "no_data",
            TickOutcome::Reported { .. } => "reported",
        }
    }
}

/// Reports the latest settled statistics window on every tick.
pub struct ReportingJob {
    stats: Arc<dyn StatsSource>,
    registry: Arc<dyn ResourceRegistry>,
    builder: RecordBuilder,
    dispatcher: Dispatcher,
    config: watch::Receiver<Arc<ReportConfig>>,
    warmed_up: AtomicBool,
}

impl ReportingJob {
    pub fn new(
        stats: Arc<dyn StatsSource>,
        registry: Arc<dyn ResourceRegistry>,
        builder: RecordBuilder,
        dispatcher: Dispatcher,
        config: watch::Receiver<Arc<ReportConfig>>,
    ) -> Self {
        Self {
            stats,
            registry,
            builder,
            dispatcher,
            config,
            warmed_up: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> JobState {
        if !self.config.borrow().flow_control {
            JobState::Disabled
        } else if !self.warmed_up.load(Ordering::Acquire) {
            JobState::Warmup
        } else {
            JobState::Active
        }
    }

    /// Run one reporting cycle. Ticks must not overlap.
    pub fn tick(&self) -> TickOutcome {
        let outcome = self.run_tick();
        metrics::counter!("flowstat_ticks", "outcome" => outcome.label()).increment(1);
        outcome
    }

    fn run_tick(&self) -> TickOutcome {
        let config = self.config.borrow().clone();
        if !config.flow_control {
            return TickOutcome::Disabled;
        }
        if !self.warmed_up.swap(true, Ordering::AcqRel) {
            debug!("first flow stat tick skipped");
            return TickOutcome::WarmedUp;
        }

        let window = ReportWindow::settled_before(self.stats.current_time_slot_id());
        let resource_stats =
            self.stats
                .resource_time_window_stats(None, window.start, window.end, WINDOW_SIZE_SECS);
        if resource_stats.is_empty() {
            info!(
                "{} - {} no flow stat data",
                format_slot(window.start),
                format_slot(window.end)
            );
            return TickOutcome::NoData {
                start: window.start,
                end: window.end,
            };
        }

        let mut records = 0;
        let mut skipped_resources = 0;
        for resource_stat in &resource_stats {
            match self.report_resource(&config, resource_stat) {
                Ok(count) => records += count,
                Err(err) => {
                    skipped_resources += 1;
                    warn!(?err, resource = %resource_stat.resource_id, "skipping resource");
                    metrics::counter!("flowstat_resources_skipped").increment(1);
                }
            }
        }

        debug!(
            start = window.start,
            end = window.end,
            resources = resource_stats.len(),
            records,
            "flow stat tick done"
        );

        TickOutcome::Reported {
            window,
            records,
            skipped_resources,
        }
    }

    fn report_resource(&self, config: &ReportConfig, stat: &ResourceTimeWindowStat) -> Result<usize> {
        let resource = stat.resource_id.as_str();
        let classification = classify(self.registry.as_ref(), resource)?;
        for window in &stat.windows {
            let record = self.builder.build(resource, classification, window);
            self.dispatcher.dispatch(config.dest, &config.queue, &record);
        }
        Ok(stat.windows.len())
    }
}

/// Binds a [`ReportingJob`] to its trigger.
#[derive(Clone)]
pub struct ScheduledReport {
    job: Arc<ReportingJob>,
    schedule: ScheduleOption,
}

impl ScheduledReport {
    pub fn new(job: Arc<ReportingJob>, schedule: ScheduleOption) -> Self {
        Self { job, schedule }
    }
}

#[async_trait::async_trait]
impl Schedulable for ScheduledReport {
    fn schedule(&self) -> &ScheduleOption {
        &self.schedule
    }

    async fn execute_once(&self) -> anyhow::Result<()> {
        self.job.tick();
        Ok(())
    }
}
