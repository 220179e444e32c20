use std::collections::BTreeMap;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use tally_common::retry::{RetryBackoff, RetryParams};
use tally_common::time::to_chrono_duration;
use tally_log::LogConfig;
use tally_metrics::{MetricSchema, MetricSpec, MetricValue, ValueKind};

/// Default aggregation window when neither the metric nor the file sets one.
const DEFAULT_BUFFER_SECONDS: u64 = 10;

/// Default bound for a graceful shutdown.
const DEFAULT_SHUTDOWN_TIMEOUT_SECONDS: u64 = 10;

/// Default base URL of the service-control API.
const DEFAULT_SERVICE_CONTROL_URL: &str = "https://servicecontrol.googleapis.com";

/// Indicates config related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("could not open config file at {path:?}")]
    CouldNotOpenFile {
        /// The attempted path.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The config file is not valid YAML for the expected schema.
    #[error("could not parse config file at {path:?}: {source}")]
    BadYaml {
        /// The attempted path.
        path: PathBuf,
        /// The underlying parse error.
        #[source]
        source: serde_yaml::Error,
    },

    /// A field value violates a constraint.
    #[error("invalid configuration field {field}: {reason}")]
    InvalidValue {
        /// The offending field, in config file notation.
        field: String,
        /// Why the value was rejected.
        reason: String,
    },
}

impl ConfigError {
    fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// A metric the agent accepts.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricConfig {
    /// The metric name; any other name is rejected at ingestion.
    pub name: String,
    /// The value kind reports for this metric must carry.
    #[serde(rename = "type")]
    pub kind: ValueKind,
    /// Aggregation window override for this metric, in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buffer_seconds: Option<u64>,
}

/// Parameters of the disk endpoint variant.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskEndpointConfig {
    /// Directory that receives one JSON file per report.
    pub report_dir: PathBuf,
    /// Age in seconds after which written reports are removed again.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expire_seconds: Option<u64>,
}

/// Parameters of the service-control endpoint variant.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceControlEndpointConfig {
    /// The reported service name, e.g. `example.mygoogleservice.com`.
    pub service_name: String,
    /// The consumer id stamped onto every operation.
    pub consumer_id: String,
    /// Base URL of the service-control API.
    #[serde(default = "default_service_url")]
    pub service_url: String,
    /// Path to a file holding a bearer token for the API.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials_file: Option<PathBuf>,
}

fn default_service_url() -> String {
    DEFAULT_SERVICE_CONTROL_URL.to_owned()
}

/// Parameters of the log endpoint variant. It has none.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct LogEndpointConfig {}

/// The remote variant behind an endpoint name.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum EndpointKind {
    /// Writes reports into a local directory.
    Disk(DiskEndpointConfig),
    /// Reports usage to a service-control API.
    ServiceControl(ServiceControlEndpointConfig),
    /// Logs reports through the agent's own log output.
    Log(LogEndpointConfig),
}

impl EndpointKind {
    /// The config key selecting this variant, used in logs and errors.
    pub fn variant(&self) -> &'static str {
        match self {
            Self::Disk(_) => "disk",
            Self::ServiceControl(_) => "serviceControl",
            Self::Log(_) => "log",
        }
    }
}

/// A configured remote endpoint.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct EndpointConfig {
    /// Symbolic endpoint id, used in logs and as the durable queue key.
    pub name: String,
    /// The endpoint variant and its parameters.
    #[serde(flatten)]
    pub kind: EndpointKind,
}

/// Parameters of a heartbeat source.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatConfig {
    /// The metric the heartbeat reports into; must be configured.
    pub metric: String,
    /// Seconds between beats.
    pub interval_seconds: u64,
    /// The value reported with every beat.
    pub value: MetricValue,
    /// Labels stamped on every beat.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

/// The generator variant behind a source name.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SourceKind {
    /// Emits a constant report on a fixed interval.
    Heartbeat(HeartbeatConfig),
}

/// A configured synthetic report source.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SourceConfig {
    /// Symbolic source id, used in logs.
    pub name: String,
    /// The source variant and its parameters.
    #[serde(flatten)]
    pub kind: SourceKind,
}

/// Backoff and give-up parameters for the retrying senders.
#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RetryConfig {
    /// Delay before the first retry, in seconds.
    #[serde(alias = "baseDelay")]
    pub base_delay_seconds: f64,
    /// Upper bound for a single delay, in seconds.
    #[serde(alias = "maxDelay")]
    pub max_delay_seconds: f64,
    /// Backoff factor applied per consecutive failure.
    pub multiplier: f64,
    /// Relative randomization of each delay, in `[0, 1)`.
    pub jitter: f64,
    /// Number of attempts after which an entry is dropped as dead.
    pub max_attempts: u32,
    /// Seconds after the first attempt at which an entry is dropped as dead.
    #[serde(alias = "maxLifetime")]
    pub max_lifetime_seconds: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_seconds: 1.0,
            max_delay_seconds: 60.0,
            multiplier: 2.0,
            jitter: 0.2,
            max_attempts: 10,
            max_lifetime_seconds: 3600,
        }
    }
}

impl RetryConfig {
    /// Returns the backoff schedule parameters.
    pub fn params(&self) -> RetryParams {
        RetryParams {
            base_delay: Duration::from_secs_f64(self.base_delay_seconds),
            max_delay: Duration::from_secs_f64(self.max_delay_seconds),
            multiplier: self.multiplier,
            jitter: self.jitter,
        }
    }

    /// Returns the maximum entry lifetime.
    pub fn max_lifetime(&self) -> Duration {
        Duration::from_secs(self.max_lifetime_seconds)
    }
}

/// The agent configuration file.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    /// Accepted metrics.
    metrics: Vec<MetricConfig>,
    /// Global aggregation window, in seconds.
    buffer_seconds: Option<u64>,
    /// Remote endpoints every batch fans out to.
    endpoints: Vec<EndpointConfig>,
    /// Synthetic report sources.
    sources: Vec<SourceConfig>,
    /// Retry policy shared by all senders.
    retry: RetryConfig,
    /// Logging options.
    logging: LogConfig,
    /// Bound for a graceful shutdown, in seconds.
    shutdown_timeout_seconds: Option<u64>,
}

impl Config {
    /// Loads and validates a config file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::CouldNotOpenFile {
            path: path.to_owned(),
            source,
        })?;

        let config: Config =
            serde_yaml::from_str(&contents).map_err(|source| ConfigError::BadYaml {
                path: path.to_owned(),
                source,
            })?;

        config.validate()?;
        Ok(config)
    }

    /// Parses a config document from a string and validates it.
    pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        let config: Config =
            serde_yaml::from_str(contents).map_err(|source| ConfigError::BadYaml {
                path: PathBuf::from("<inline>"),
                source,
            })?;

        config.validate()?;
        Ok(config)
    }

    /// Checks all cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.metrics.is_empty() {
            return Err(ConfigError::invalid("metrics", "at least one metric is required"));
        }

        let mut metric_names = HashSet::new();
        for metric in &self.metrics {
            if !metric_names.insert(metric.name.as_str()) {
                return Err(ConfigError::invalid(
                    "metrics.name",
                    format!("duplicate metric {:?}", metric.name),
                ));
            }
            if metric.buffer_seconds == Some(0) {
                return Err(ConfigError::invalid(
                    "metrics.bufferSeconds",
                    format!("window for metric {:?} must be positive", metric.name),
                ));
            }
        }

        if self.buffer_seconds == Some(0) {
            return Err(ConfigError::invalid("bufferSeconds", "window must be positive"));
        }

        if self.endpoints.is_empty() {
            return Err(ConfigError::invalid(
                "endpoints",
                "at least one endpoint is required",
            ));
        }

        let mut endpoint_names = HashSet::new();
        for endpoint in &self.endpoints {
            if !endpoint_names.insert(endpoint.name.as_str()) {
                return Err(ConfigError::invalid(
                    "endpoints.name",
                    format!("duplicate endpoint {:?}", endpoint.name),
                ));
            }
        }

        let mut source_names = HashSet::new();
        for source in &self.sources {
            if !source_names.insert(source.name.as_str()) {
                return Err(ConfigError::invalid(
                    "sources.name",
                    format!("duplicate source {:?}", source.name),
                ));
            }

            let SourceKind::Heartbeat(ref heartbeat) = source.kind;
            let Some(metric) = self.metrics.iter().find(|m| m.name == heartbeat.metric) else {
                return Err(ConfigError::invalid(
                    "sources.heartbeat.metric",
                    format!(
                        "source {:?} references unknown metric {:?}",
                        source.name, heartbeat.metric
                    ),
                ));
            };
            if heartbeat.value.kind() != metric.kind {
                return Err(ConfigError::invalid(
                    "sources.heartbeat.value",
                    format!(
                        "source {:?} reports {} values into the {} metric {:?}",
                        source.name,
                        heartbeat.value.kind(),
                        metric.kind,
                        metric.name
                    ),
                ));
            }
            if heartbeat.interval_seconds == 0 {
                return Err(ConfigError::invalid(
                    "sources.heartbeat.intervalSeconds",
                    format!("interval for source {:?} must be positive", source.name),
                ));
            }
        }

        let retry = &self.retry;
        if retry.base_delay_seconds <= 0.0 {
            return Err(ConfigError::invalid(
                "retry.baseDelaySeconds",
                "base delay must be positive",
            ));
        }
        if retry.max_delay_seconds < retry.base_delay_seconds {
            return Err(ConfigError::invalid(
                "retry.maxDelaySeconds",
                "maximum delay must be at least the base delay",
            ));
        }
        if retry.multiplier < 1.0 {
            return Err(ConfigError::invalid(
                "retry.multiplier",
                "multiplier must be at least 1",
            ));
        }
        if !(0.0..1.0).contains(&retry.jitter) {
            return Err(ConfigError::invalid("retry.jitter", "jitter must be in [0, 1)"));
        }
        if retry.max_attempts == 0 {
            return Err(ConfigError::invalid(
                "retry.maxAttempts",
                "at least one attempt is required",
            ));
        }
        if retry.max_lifetime_seconds == 0 {
            return Err(ConfigError::invalid(
                "retry.maxLifetimeSeconds",
                "lifetime must be positive",
            ));
        }

        Ok(())
    }

    /// Returns the configured metrics.
    pub fn metrics(&self) -> &[MetricConfig] {
        &self.metrics
    }

    /// Returns the configured endpoints.
    pub fn endpoints(&self) -> &[EndpointConfig] {
        &self.endpoints
    }

    /// Returns the configured synthetic sources.
    pub fn sources(&self) -> &[SourceConfig] {
        &self.sources
    }

    /// Returns the retry policy.
    pub fn retry(&self) -> &RetryConfig {
        &self.retry
    }

    /// Returns the backoff schedule built from the retry policy.
    pub fn retry_backoff(&self) -> RetryBackoff {
        RetryBackoff::new(self.retry.params())
    }

    /// Returns the logging options.
    pub fn logging(&self) -> &LogConfig {
        &self.logging
    }

    /// Returns the aggregation window for a metric, falling back to the
    /// global default.
    pub fn buffer_for(&self, metric: &MetricConfig) -> Duration {
        let seconds = metric
            .buffer_seconds
            .or(self.buffer_seconds)
            .unwrap_or(DEFAULT_BUFFER_SECONDS);
        Duration::from_secs(seconds)
    }

    /// Builds the metric schema consumed by the aggregator.
    pub fn metric_schema(&self) -> MetricSchema {
        self.metrics
            .iter()
            .map(|metric| {
                (
                    metric.name.clone(),
                    MetricSpec {
                        kind: metric.kind,
                        buffer: to_chrono_duration(self.buffer_for(metric)),
                    },
                )
            })
            .collect()
    }

    /// Returns the bound for a graceful shutdown.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(
            self.shutdown_timeout_seconds
                .unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT_SECONDS),
        )
    }
}
