use anyhow::{Context, Result};
use clap::Parser;
use flowstat_reporter::{
    dispatch::{Dispatcher, LogPipelineSink, QueueSink, RedisPublisher},
    job::{ReportingJob, ScheduledReport},
    net,
    record::RecordBuilder,
    settings::{LiveSettings, Settings},
    stats::MemoryStats,
};
use flowstat_scheduled_command::{Schedulable, ScheduleOption};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::{fs::File, io::BufReader, path::PathBuf, sync::Arc, time::Duration};
use tokio::{runtime::Handle, signal};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

const REDIS_RECONNECT_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(
    name = "flowstat-reporter",
    about = "Reports settled per-resource flow statistics windows to a telemetry sink",
    version,
    after_help = r#"Configuration:
    Configuration can be provided via:
    1. Environment variables with FLOWSTAT__ prefix (e.g., FLOWSTAT__FLOW_STAT_SCHED__DEST=kafka)
    2. .env file in the current directory
    3. Config file with -c option (re-read periodically while running)

Examples:
    # Report every 10 seconds using the config file schedule
    flowstat-reporter -c flowstat.toml

    # Replay windows from a file through the log pipeline every 10 seconds
    FLOWSTAT__FLOW_STAT_SCHED__DEST=kafka flowstat-reporter --stats-file windows.jsonl --schedule 10s"#
)]
struct AppArgs {
    /// Path to the configuration file (TOML format)
    #[clap(short = 'c', long, value_name = "FILE")]
    config: Option<PathBuf>,

    // Overrides flow_stat_sched.cron
    #[command(flatten)]
    schedule: ScheduleOption,

    /// JSON lines of {"resource": .., "window": {..}} to seed the statistics store
    #[clap(long, value_name = "FILE")]
    stats_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = AppArgs::parse();
    let settings = Settings::load(args.config.as_deref())?;
    init_logging(&settings.log_level);
    debug!("{settings}");

    if let Some(addr) = settings.metrics_addr {
        PrometheusBuilder::new().with_http_listener(addr).install()?;
    }
    export_build_info();

    let server_ip = net::server_ip(settings.server_ip.as_deref());

    let stats = Arc::new(MemoryStats::new());
    if let Some(path) = &args.stats_file {
        let file = File::open(path).with_context(|| format!("Failed to open stats file: {path:?}"))?;
        let loaded = stats.load_jsonl(BufReader::new(file))?;
        info!(loaded, path = %path.display(), "seeded statistics store");
    }

    let shutdown = shutdown_listener()?;
    let live = Arc::new(LiveSettings::new(&settings));
    if let Some(path) = args.config.clone() {
        tokio::spawn(live.clone().refresh_from(path, settings.refresh_interval(), shutdown.clone()));
    }

    let publisher = Arc::new(RedisPublisher::new(&settings.redis.url)?);
    tokio::spawn(publisher.clone().connect(REDIS_RECONNECT_INTERVAL, shutdown.clone()));

    let dispatcher = Dispatcher::new(LogPipelineSink, QueueSink::new(publisher, Handle::current()));
    let job = ReportingJob::new(
        stats,
        Arc::new(live.registry()),
        RecordBuilder::new(server_ip.clone()),
        dispatcher,
        live.subscribe(),
    );

    let schedule = if args.schedule.is_scheduled() {
        args.schedule
    } else {
        ScheduleOption::new(settings.flow_stat_sched.cron.clone())
    };

    info!(
        %server_ip,
        flow_control = settings.flow_control,
        dest = %settings.flow_stat_sched.dest,
        queue = %settings.flow_stat_sched.queue,
        "flow stat reporter starting"
    );

    ScheduledReport::new(Arc::new(job), schedule)
        .execute(shutdown)
        .await?;

    info!("flow stat reporter shutting down");

    Ok(())
}

fn init_logging(log_level: &str) {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level)))
        .with(tracing_subscriber::fmt::layer().with_thread_ids(false).with_thread_names(false))
        .init();
}

fn shutdown_listener() -> Result<CancellationToken> {
    let cancellation_token = CancellationToken::new();
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
        .context("sigterm listener failed")?;
    tokio::spawn({
        let cancellation_token = cancellation_token.clone();
        async move {
            tokio::select! {
                _ = sigterm.recv() => cancellation_token.cancel(),
                _ = signal::ctrl_c() => cancellation_token.cancel(),
            }
        }
    });

    Ok(cancellation_token)
}

fn export_build_info() {
    let version = option_env!("BUILD_VERSION").unwrap_or(env!("CARGO_PKG_VERSION"));
    let build_commit = option_env!("BUILD_COMMIT").unwrap_or("UNKNOWN");
    let build_date = option_env!("DATE").unwrap_or("UNKNOWN");
    let pkg_version = env!("CARGO_PKG_VERSION");

    metrics::gauge!(
        "flowstat_reporter_build_info",
        "version" => version,
        "commit" => build_commit,
        "date" => build_date,
        "pkg_version" => pkg_version
    )
    .set(1);
}
