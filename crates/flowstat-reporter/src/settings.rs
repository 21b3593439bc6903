use crate::{
    Error, Result,
    dispatch::Dest,
    registry::{ConfigRegistry, RegistryEntries, ResourceRateLimitConfig, index_configs},
};
use config::{Config as ConfigBuilder, Environment, File};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashSet,
    fmt,
    net::{IpAddr, SocketAddr},
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::{
    sync::watch,
    time::{MissedTickBehavior, interval},
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub const DEFAULT_QUEUE: &str = "fizz_resource_access_stat";

/// Reporter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Log level for application logging (e.g., "info", "debug", "warn", "error")
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Address stamped on every record; discovered when unset
    #[serde(default)]
    pub server_ip: Option<String>,
    /// Prometheus exporter listen address; exporter disabled when unset
    #[serde(default)]
    pub metrics_addr: Option<SocketAddr>,
    /// Master switch for flow statistics reporting
    #[serde(default)]
    pub flow_control: bool,
    #[serde(default)]
    pub flow_stat_sched: FlowStatSchedSettings,
    #[serde(default)]
    pub redis: RedisSettings,
    /// Rate-limit configuration ids by resource
    #[serde(default)]
    pub resources: Vec<ResourceRateLimitConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowStatSchedSettings {
    /// Cron expression, seconds first
    pub cron: String,
    /// "kafka" ships records through the log pipeline, anything else publishes to redis
    pub dest: String,
    /// Queue, channel or topic name records are sent to
    pub queue: String,
    /// How often the config file is re-read
    pub refresh_interval_secs: u64,
}

impl Default for FlowStatSchedSettings {
    fn default() -> Self {
        Self {
            cron: "*/10 * * * * *".to_string(),
            dest: "redis".to_string(),
            queue: DEFAULT_QUEUE.to_string(),
            refresh_interval_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisSettings {
    pub url: String,
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// The part of the settings re-read at the start of every tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportConfig {
    pub flow_control: bool,
    pub dest: Dest,
    pub queue: String,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            flow_control: false,
            dest: Dest::default(),
            queue: DEFAULT_QUEUE.to_string(),
        }
    }
}

impl Settings {
    /// Load configuration from a config file, env vars take priority
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::build(Some(path.as_ref()), &working_dir())
    }

    /// Load configuration from environment variables only
    pub fn from_env() -> Result<Self> {
        Self::build(None, &working_dir())
    }

    fn build(path: Option<&Path>, dotenv_dir: &Path) -> Result<Self> {
        // NOTE: It's ok if this fails (file might not exist)
        let _ = dotenvy::from_path(dotenv_dir.join(".env"));

        let mut builder = ConfigBuilder::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::with_name(&path.to_string_lossy()));
        }
        let settings: Settings = builder.add_source(env_source()).build()?.try_deserialize()?;

        settings.validate()?;
        Ok(settings)
    }

    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_path(path),
            None => Self::from_env(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.log_level.to_lowercase().as_str()) {
            return invalid(format!(
                "invalid log level '{}', valid options are: {valid_log_levels:?}",
                self.log_level
            ));
        }

        if let Some(ip) = &self.server_ip {
            if ip.trim().parse::<IpAddr>().is_err() {
                return invalid(format!("server_ip '{ip}' is not an IP address"));
            }
        }

        if self.flow_stat_sched.queue.trim().is_empty() {
            return invalid("flow_stat_sched.queue cannot be empty".to_string());
        }
        if self.flow_stat_sched.cron.trim().is_empty() {
            return invalid("flow_stat_sched.cron cannot be empty".to_string());
        }
        if self.flow_stat_sched.refresh_interval_secs == 0 {
            return invalid("flow_stat_sched.refresh_interval_secs must be greater than 0".to_string());
        }

        if !self.redis.url.starts_with("redis://") && !self.redis.url.starts_with("rediss://") {
            return invalid("redis.url must start with redis:// or rediss://".to_string());
        }

        let mut seen = HashSet::new();
        for config in &self.resources {
            if config.resource.is_empty() {
                return invalid("resources entries need a non-empty resource".to_string());
            }
            if !seen.insert(config.resource.as_str()) {
                return invalid(format!("duplicate resource '{}' in resources", config.resource));
            }
        }

        Ok(())
    }

    pub fn report_config(&self) -> ReportConfig {
        ReportConfig {
            flow_control: self.flow_control,
            dest: Dest::from(self.flow_stat_sched.dest.as_str()),
            queue: self.flow_stat_sched.queue.clone(),
        }
    }

    pub fn registry_entries(&self) -> RegistryEntries {
        index_configs(self.resources.iter().cloned())
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.flow_stat_sched.refresh_interval_secs)
    }
}

fn working_dir() -> PathBuf {
    std::env::current_dir().unwrap_or_default()
}

fn env_source() -> Environment {
    Environment::with_prefix("FLOWSTAT")
        .separator("__")
        .try_parsing(true)
}

fn invalid(reason: String) -> Result<()> {
    Err(Error::InvalidSettings(reason))
}

impl fmt::Display for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Settings {{\n\
             \tLog Level: {}\n\
             \tFlow Control: {}\n\
             \tCron: {}\n\
             \tDest: {}\n\
             \tQueue: {}\n\
             \tRedis URL: {}\n\
             \tRegistered Resources: {}\n\
             }}",
            self.log_level,
            self.flow_control,
            self.flow_stat_sched.cron,
            self.flow_stat_sched.dest,
            self.flow_stat_sched.queue,
            self.redis.url,
            self.resources.len(),
        )
    }
}

/// Settings that can change while the process runs.
///
/// Readers hold `watch` receivers and always see the latest snapshot.
pub struct LiveSettings {
    config: watch::Sender<Arc<ReportConfig>>,
    registry: watch::Sender<RegistryEntries>,
}

impl LiveSettings {
    pub fn new(settings: &Settings) -> Self {
        let (config, _) = watch::channel(Arc::new(settings.report_config()));
        let (registry, _) = watch::channel(settings.registry_entries());
        Self { config, registry }
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<ReportConfig>> {
        self.config.subscribe()
    }

    pub fn registry(&self) -> ConfigRegistry {
        ConfigRegistry::new(self.registry.subscribe())
    }

    pub fn current(&self) -> Arc<ReportConfig> {
        self.config.borrow().clone()
    }

    /// Publish a freshly loaded configuration. Returns whether anything changed.
    pub fn apply(&self, settings: &Settings) -> bool {
        let next = settings.report_config();
        let config_changed = self.config.send_if_modified(|current| {
            if **current == next {
                return false;
            }
            *current = Arc::new(next);
            true
        });

        let entries = settings.registry_entries();
        let registry_changed = self.registry.send_if_modified(|current| {
            if *current == entries {
                return false;
            }
            *current = entries;
            true
        });

        config_changed || registry_changed
    }

    /// Re-read `path` every `every` until `shutdown` fires.
    ///
    /// A file that fails to load or validate leaves the previous snapshot in place.
    pub async fn refresh_from(self: Arc<Self>, path: PathBuf, every: Duration, shutdown: CancellationToken) {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately and the file was just loaded
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    match Settings::from_path(&path) {
                        Ok(settings) => {
                            if self.apply(&settings) {
                                let current = self.current();
                                info!(
                                    flow_control = current.flow_control,
                                    dest = ?current.dest,
                                    queue = %current.queue,
                                    "flow stat settings refreshed"
                                );
                            }
                        }
                        Err(err) => {
                            warn!(?err, path = %path.display(), "failed to reload settings; keeping previous");
                            metrics::counter!("flowstat_settings_reload_failed").increment(1);
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ResourceRegistry;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(contents: &str) -> NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_dotenv_applies_with_config_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(".env"),
            "FLOWSTAT__METRICS_ADDR=127.0.0.1:19464\n",
        )
        .unwrap();
        let file = write_config("flow_control = true\n");

        let settings = Settings::build(Some(file.path()), dir.path()).unwrap();
        assert!(settings.flow_control);
        assert_eq!(settings.metrics_addr, Some("127.0.0.1:19464".parse().unwrap()));
    }

    fn base_settings() -> Settings {
        Settings {
            log_level: "info".to_string(),
            server_ip: None,
            metrics_addr: None,
            flow_control: true,
            flow_stat_sched: FlowStatSchedSettings::default(),
            redis: RedisSettings::default(),
            resources: Vec::new(),
        }
    }

    #[test]
    fn test_defaults_from_minimal_file() {
        let file = write_config("log_level = \"debug\"\n");
        let settings = Settings::from_path(file.path()).unwrap();

        assert!(!settings.flow_control);
        assert_eq!(settings.flow_stat_sched.dest, "redis");
        assert_eq!(settings.flow_stat_sched.queue, DEFAULT_QUEUE);
        assert_eq!(settings.flow_stat_sched.cron, "*/10 * * * * *");
        assert_eq!(settings.report_config().dest, Dest::Queue);
        assert!(settings.resources.is_empty());
    }

    #[test]
    fn test_full_file() {
        let file = write_config(
            r#"
log_level = "info"
server_ip = "10.0.0.5"
flow_control = true

[flow_stat_sched]
cron = "*/10 * * * * *"
dest = "kafka"
queue = "gateway_stats"

[redis]
url = "redis://cache:6379/0"

[[resources]]
resource = "_global"
id = 1

[[resources]]
resource = "/orders/list"
id = 17
"#,
        );
        let settings = Settings::from_path(file.path()).unwrap();

        let config = settings.report_config();
        assert!(config.flow_control);
        assert_eq!(config.dest, Dest::LogPipeline);
        assert_eq!(config.queue, "gateway_stats");
        assert_eq!(settings.registry_entries().get("/orders/list").map(|c| c.id), Some(17));
    }

    #[test]
    fn test_example_config_loads() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("example.config.toml");
        let settings = Settings::from_path(path).unwrap();
        assert!(settings.flow_control);
        assert_eq!(settings.resources.len(), 2);
    }

    #[test]
    fn test_validation() {
        assert!(base_settings().validate().is_ok());

        let mut settings = base_settings();
        settings.log_level = "verbose".to_string();
        assert!(settings.validate().is_err());

        let mut settings = base_settings();
        settings.flow_stat_sched.queue = " ".to_string();
        assert!(settings.validate().is_err());

        let mut settings = base_settings();
        settings.redis.url = "http://cache".to_string();
        assert!(settings.validate().is_err());

        let mut settings = base_settings();
        settings.server_ip = Some("gateway-1".to_string());
        assert!(settings.validate().is_err());

        let mut settings = base_settings();
        settings.resources = vec![
            ResourceRateLimitConfig {
                resource: "a".to_string(),
                id: 1,
            },
            ResourceRateLimitConfig {
                resource: "a".to_string(),
                id: 2,
            },
        ];
        assert!(matches!(settings.validate(), Err(Error::InvalidSettings(_))));
    }

    #[test]
    fn test_apply_publishes_changes() {
        let live = LiveSettings::new(&base_settings());
        let rx = live.subscribe();
        let registry = live.registry();
        assert_eq!(rx.borrow().dest, Dest::Queue);

        assert!(!live.apply(&base_settings()));

        let mut next = base_settings();
        next.flow_stat_sched.dest = "kafka".to_string();
        next.resources.push(ResourceRateLimitConfig {
            resource: "payment-service".to_string(),
            id: 9,
        });
        assert!(live.apply(&next));

        assert_eq!(rx.borrow().dest, Dest::LogPipeline);
        assert_eq!(live.current().dest, Dest::LogPipeline);
        assert_eq!(registry.lookup("payment-service").map(|c| c.id), Some(9));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_keeps_previous_on_bad_file() {
        let file = write_config("flow_control = true\n");
        let settings = Settings::from_path(file.path()).unwrap();
        let live = Arc::new(LiveSettings::new(&settings));
        let shutdown = CancellationToken::new();

        let task = tokio::spawn(live.clone().refresh_from(
            file.path().to_path_buf(),
            Duration::from_secs(1),
            shutdown.clone(),
        ));

        std::fs::write(file.path(), "log_level = \"nope\"\n").unwrap();

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(live.current().flow_control);

        shutdown.cancel();
        task.await.unwrap();
    }
}
