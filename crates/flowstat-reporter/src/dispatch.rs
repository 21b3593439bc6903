use crate::{Error, Result, record::ReportRecord, window::format_slot};
use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use mockall::automock;
use redis::{AsyncCommands, Client, aio::ConnectionManager};
use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};
use tokio::{runtime::Handle, sync::OnceCell, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Target of the tracing events picked up by the log shipping pipeline.
pub const PIPELINE_TARGET: &str = "flowstat::pipeline";
/// Delivery strategy tag attached to pipeline events.
pub const HANDLE_STRATEGY: &str = "kafka";

/// Where records go, selected by the `dest` setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Dest {
    LogPipeline,
    #[default]
    Queue,
}

impl From<&str> for Dest {
    fn from(dest: &str) -> Self {
        match dest {
            "kafka" => Dest::LogPipeline,
            _ => Dest::Queue,
        }
    }
}

/// A delivery channel for serialized records. Dispatch never blocks on
/// delivery and never reports failure to the caller.
#[automock]
pub trait RecordSink: Send + Sync {
    fn name(&self) -> &'static str;

    fn dispatch(&self, topic: &str, line: &str);
}

/// Hands records to the logging subsystem, which owns shipping them.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogPipelineSink;

impl RecordSink for LogPipelineSink {
    fn name(&self) -> &'static str {
        "log_pipeline"
    }

    fn dispatch(&self, topic: &str, line: &str) {
        info!(target: PIPELINE_TARGET, handle_stgy = HANDLE_STRATEGY, topic, "{line}");
    }
}

/// Message queue publish primitive.
#[automock]
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, channel: &str, message: &str) -> Result<()>;
}

const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
const PUBLISH_TIMEOUT: Duration = Duration::from_secs(2);

/// Redis pub/sub publisher.
///
/// The connection is opened by [`RedisPublisher::connect`]; until it is up,
/// every publish fails straight away. Once open, the connection manager
/// reconnects on its own.
pub struct RedisPublisher {
    client: Client,
    connection: OnceCell<ConnectionManager>,
}

impl RedisPublisher {
    pub fn new(url: &str) -> Result<Self> {
        Ok(Self {
            client: Client::open(url)?,
            connection: OnceCell::new(),
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connection.initialized()
    }

    /// Keep trying to open the connection until it is up or `shutdown` fires.
    pub async fn connect(self: Arc<Self>, retry_every: Duration, shutdown: CancellationToken) {
        loop {
            let attempt = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return,
                result = connect_with_retry(&self.client) => result,
            };
            match attempt {
                Ok(connection) => {
                    // Only this task sets the cell
                    let _ = self.connection.set(connection);
                    info!("redis connected");
                    return;
                }
                Err(err) => {
                    warn!(?err, retry_in = ?retry_every, "redis unavailable, queue records are dropped")
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(retry_every) => {}
            }
        }
    }
}

async fn connect_with_retry(client: &Client) -> Result<ConnectionManager> {
    let attempts = AtomicUsize::new(0);
    let backoff = ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(200))
        .with_max_delay(Duration::from_secs(5))
        .with_max_times(3)
        .with_jitter();

    (|| async {
        tokio::time::timeout(CONNECT_TIMEOUT, ConnectionManager::new(client.clone()))
            .await
            .map_err(|_| Error::Timeout("redis connect", CONNECT_TIMEOUT))?
            .map_err(Error::from)
    })
        .retry(backoff)
        .when(|err: &Error| err.is_transient())
        .notify(|err: &Error, delay: Duration| {
            let attempt = attempts.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(attempt, retry_in = ?delay, error = ?err, "redis connection failed");
        })
        .await
}

#[async_trait]
impl Publisher for RedisPublisher {
    async fn publish(&self, channel: &str, message: &str) -> Result<()> {
        let mut connection = self.connection.get().cloned().ok_or(Error::QueueUnavailable)?;
        let _receivers: i64 = tokio::time::timeout(PUBLISH_TIMEOUT, connection.publish(channel, message))
            .await
            .map_err(|_| Error::Timeout("redis publish", PUBLISH_TIMEOUT))??;
        Ok(())
    }
}

/// Publishes records on a background task; the caller never waits for it.
pub struct QueueSink<P> {
    publisher: Arc<P>,
    runtime: Handle,
    failed: Arc<AtomicU64>,
}

impl<P: Publisher + 'static> QueueSink<P> {
    pub fn new(publisher: Arc<P>, runtime: Handle) -> Self {
        Self {
            publisher,
            runtime,
            failed: Arc::default(),
        }
    }

    /// Publishes that ended in an error since start.
    pub fn failed_publishes(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Start publishing `line` to `channel`. Failures are logged and counted.
    pub fn publish(&self, channel: &str, line: &str) -> JoinHandle<()> {
        let publisher = self.publisher.clone();
        let failed = self.failed.clone();
        let channel = channel.to_string();
        let line = line.to_string();
        self.runtime.spawn(async move {
            if let Err(err) = publisher.publish(&channel, &line).await {
                warn!(?err, %channel, "failed to publish flow stat record");
                failed.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("flowstat_publish_failed").increment(1);
            }
        })
    }
}

impl<P: Publisher + 'static> RecordSink for QueueSink<P> {
    fn name(&self) -> &'static str {
        "queue"
    }

    fn dispatch(&self, topic: &str, line: &str) {
        // Detached: delivery is not awaited
        drop(self.publish(topic, line));
    }
}

/// Routes each record to the sink selected for the current tick.
pub struct Dispatcher {
    log_pipeline: Box<dyn RecordSink>,
    queue: Box<dyn RecordSink>,
}

impl Dispatcher {
    pub fn new(log_pipeline: impl RecordSink + 'static, queue: impl RecordSink + 'static) -> Self {
        Self {
            log_pipeline: Box::new(log_pipeline),
            queue: Box::new(queue),
        }
    }

    pub fn dispatch(&self, dest: Dest, topic: &str, record: &ReportRecord) {
        let line = record.to_line();
        let sink = match dest {
            Dest::LogPipeline => &self.log_pipeline,
            Dest::Queue => &self.queue,
        };
        sink.dispatch(topic, &line);
        metrics::counter!("flowstat_records_dispatched", "dest" => sink.name()).increment(1);
        debug!("report {} win10: {line}", format_slot(record.start));
    }
}
