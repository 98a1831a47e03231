//! # Harvester Engine - Workload Discovery & Scrape Core
//!
//! The discovery-and-scrape core of a cluster metrics agent. It keeps track of
//! which workloads expose a scrapeable metrics endpoint and, once per collection
//! tick, pulls metrics from every known endpoint within a bounded time budget.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                           HARVESTER ENGINE                               │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │  WORKLOAD EVENTS ─┐                                                      │
//! │                   ├─→ DISCOVERY MANAGER → PROVIDER REGISTRY              │
//! │  RULE FILE ───────┘                              │                       │
//! │                                                  ▼                       │
//! │              COLLECTION TICK → SOURCE MANAGER → DATA BATCH → SINK        │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! - **Discovery Manager**: reconciles workload add/update/delete events and a
//!   hot-reloaded rule file into registered metric-source providers.
//! - **Source Manager**: fans out one scrape per source under a global deadline,
//!   spreading requests with jitter and merging whatever arrives in time.

// ============================================================================
// SECTION 1: IMPORTS & DEPENDENCIES
// ============================================================================

#![allow(dead_code)]
#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]

// ----------------------------------------------------------------------------
// Standard Library Imports
// ----------------------------------------------------------------------------
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::{self, Debug, Display, Formatter};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

// ----------------------------------------------------------------------------
// Async Runtime - Tokio
// ----------------------------------------------------------------------------
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinHandle as TokioJoinHandle;
use tokio::time::{interval, sleep, timeout, timeout_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

// ----------------------------------------------------------------------------
// Concurrency Primitives
// ----------------------------------------------------------------------------
use arc_swap::ArcSwapOption;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::{Mutex, RwLock};

// ----------------------------------------------------------------------------
// Serialization
// ----------------------------------------------------------------------------
use serde::{Deserialize, Serialize};

// ----------------------------------------------------------------------------
// Error Handling
// ----------------------------------------------------------------------------
use anyhow::{Context as AnyhowContext, Result as AnyhowResult};
use thiserror::Error;

// ----------------------------------------------------------------------------
// Logging & Tracing
// ----------------------------------------------------------------------------
use tracing::level_filters::LevelFilter;
use tracing::{debug, error, info, trace, warn};
use tracing_subscriber::{fmt as tracing_fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

// ----------------------------------------------------------------------------
// Time, Networking, Randomness
// ----------------------------------------------------------------------------
use chrono::{DateTime, Utc};
use rand::Rng;
use reqwest::{Client as HttpClient, Url};

// ----------------------------------------------------------------------------
// Async Traits, Configuration, CLI, Self-Monitoring
// ----------------------------------------------------------------------------
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, Registry as PrometheusRegistry, TextEncoder};
use prometheus_parse::{Sample as PromSample, Scrape, Value as PromValue};

// ============================================================================
// SECTION 2: CONSTANTS & VERSION INFORMATION
// ============================================================================

pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const ENGINE_NAME: &str = "harvester-engine";
pub const ENGINE_FULL_NAME: &str = "Harvester Metrics Agent";

/// Default agent configuration file
pub const DEFAULT_CONFIG_PATH: &str = "harvester.toml";

// ----------------------------------------------------------------------------
// Scrape Orchestration
// ----------------------------------------------------------------------------

/// Global budget for one collection tick
pub const DEFAULT_METRICS_SCRAPE_TIMEOUT: Duration = Duration::from_secs(20);

/// Upper bound of the per-source jitter ceiling (milliseconds)
pub const MAX_DELAY_MS: u64 = 4 * 1000;

/// Jitter ceiling contribution of each source (milliseconds)
pub const DELAY_PER_SOURCE_MS: u64 = 8;

/// Buckets of the per-tick latency histogram; the last one holds everything >= 10s
pub const LATENCY_BUCKETS: usize = 11;

/// Default cap on scrapes in flight at once (0 = unbounded)
pub const DEFAULT_MAX_CONCURRENT_SCRAPES: usize = 256;

/// Default collection tick
pub const DEFAULT_COLLECTION_INTERVAL: Duration = Duration::from_secs(60);

/// Minimum allowed collection tick
pub const MIN_COLLECTION_INTERVAL: Duration = Duration::from_secs(1);

/// Grace period for shutdown
pub const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(30);

/// Name the source manager reports when used as a metric source itself
pub const SOURCE_MANAGER_NAME: &str = "source_manager";

// ----------------------------------------------------------------------------
// Discovery
// ----------------------------------------------------------------------------

/// Default interval of the rule-driven discovery sweep
pub const DEFAULT_DISCOVERY_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// How often the rule file's modification time is checked
pub const DEFAULT_RULE_POLL_INTERVAL: Duration = Duration::from_secs(60);

/// Prefix of every provider key created by discovery
pub const PROMETHEUS_PROVIDER_NAME: &str = "prometheus_source";

/// Opt-in marker and scrape parameter annotations
pub const SCRAPE_ANNOTATION: &str = "prometheus.io/scrape";
pub const PORT_ANNOTATION: &str = "prometheus.io/port";
pub const PATH_ANNOTATION: &str = "prometheus.io/path";
pub const SCHEME_ANNOTATION: &str = "prometheus.io/scheme";

pub const DEFAULT_METRICS_PATH: &str = "/metrics";
pub const DEFAULT_SCHEME: &str = "http";

/// Buffered workload events per watcher before slow consumers start lagging
pub const WORKLOAD_EVENT_CAPACITY: usize = 1024;

// ============================================================================
// SECTION 3: CORE TYPE SYSTEM
// ============================================================================
// Workloads and their identities on the discovery side, metric sets, points
// and batches on the scrape side.
// ============================================================================

// ----------------------------------------------------------------------------
// 3.1 Workloads
// ----------------------------------------------------------------------------

/// Kinds of workloads discovery knows about.
///
/// Only pods have a discovery strategy; services and ingresses are declared
/// so rules can name them, and are rejected as unsupported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkloadKind {
    #[default]
    Pod,
    Service,
    Ingress,
}

impl Display for WorkloadKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            WorkloadKind::Pod => write!(f, "pod"),
            WorkloadKind::Service => write!(f, "service"),
            WorkloadKind::Ingress => write!(f, "ingress"),
        }
    }
}

/// Namespace + name. The registration key of a scrape target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkloadIdentity {
    pub namespace: String,
    pub name: String,
}

impl WorkloadIdentity {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl Display for WorkloadIdentity {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Equality-based label selector. An empty selector matches everything.
pub type LabelSelector = BTreeMap<String, String>;

/// Check whether `labels` satisfies every requirement of `selector`.
pub fn selector_matches(selector: &LabelSelector, labels: &BTreeMap<String, String>) -> bool {
    selector.iter().all(|(key, value)| labels.get(key) == Some(value))
}

/// A running workload that may expose a metrics endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workload {
    #[serde(default)]
    pub kind: WorkloadKind,
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

impl Workload {
    pub fn new(kind: WorkloadKind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: namespace.into(),
            name: name.into(),
            ip: None,
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
        }
    }

    pub fn pod(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(WorkloadKind::Pod, namespace, name)
    }

    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.ip = Some(ip.into());
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    pub fn identity(&self) -> WorkloadIdentity {
        WorkloadIdentity::new(self.namespace.clone(), self.name.clone())
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }
}

/// Change notification from the watch collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkloadEvent {
    Added(Workload),
    Updated(Workload),
    Deleted(Workload),
}

impl WorkloadEvent {
    pub fn workload(&self) -> &Workload {
        match self {
            WorkloadEvent::Added(w) | WorkloadEvent::Updated(w) | WorkloadEvent::Deleted(w) => w,
        }
    }

    pub fn action(&self) -> &'static str {
        match self {
            WorkloadEvent::Added(_) => "added",
            WorkloadEvent::Updated(_) => "updated",
            WorkloadEvent::Deleted(_) => "deleted",
        }
    }
}

// ----------------------------------------------------------------------------
// 3.2 Metric Values, Sets & Points
// ----------------------------------------------------------------------------

/// A single metric value inside a metric set.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum MetricValue {
    Int(i64),
    Float(f64),
}

impl MetricValue {
    pub fn as_f64(&self) -> f64 {
        match self {
            MetricValue::Int(v) => *v as f64,
            MetricValue::Float(v) => *v,
        }
    }
}

impl From<i64> for MetricValue {
    fn from(v: i64) -> Self {
        MetricValue::Int(v)
    }
}

impl From<f64> for MetricValue {
    fn from(v: f64) -> Self {
        MetricValue::Float(v)
    }
}

/// A named grouping of related metrics produced by one source.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MetricSet {
    pub create_time: Option<DateTime<Utc>>,
    pub scrape_time: Option<DateTime<Utc>>,
    pub labels: BTreeMap<String, String>,
    pub values: BTreeMap<String, MetricValue>,
}

impl MetricSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_scrape_time(mut self, time: DateTime<Utc>) -> Self {
        self.scrape_time = Some(time);
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_value(mut self, name: impl Into<String>, value: impl Into<MetricValue>) -> Self {
        self.values.insert(name.into(), value.into());
        self
    }

    pub fn value(&self, name: &str) -> Option<MetricValue> {
        self.values.get(name).copied()
    }
}

/// A raw, individually tagged sample.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricPoint {
    pub metric: String,
    pub value: f64,
    pub timestamp_ms: i64,
    pub source: String,
    pub tags: BTreeMap<String, String>,
}

// ----------------------------------------------------------------------------
// 3.3 Data Batch
// ----------------------------------------------------------------------------

/// The per-tick aggregate handed to the exporter.
///
/// Metric set keys are unique. An empty batch is valid and means nothing was
/// collected this tick.
#[derive(Debug, Clone, PartialEq)]
pub struct DataBatch {
    pub timestamp: DateTime<Utc>,
    pub metric_sets: HashMap<String, MetricSet>,
    pub metric_points: Vec<MetricPoint>,
}

impl DataBatch {
    pub fn new(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            metric_sets: HashMap::new(),
            metric_points: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.metric_sets.is_empty() && self.metric_points.is_empty()
    }

    /// Absorb a partial batch: its sets overwrite entries under the same key,
    /// its points are appended.
    ///
    /// Arrival order across sources is not deterministic, so on a key
    /// collision whichever partial is merged last wins.
    pub fn merge_from(&mut self, partial: DataBatch) {
        self.metric_sets.extend(partial.metric_sets);
        self.metric_points.extend(partial.metric_points);
    }
}

// ----------------------------------------------------------------------------
// 3.4 Scrape Endpoint
// ----------------------------------------------------------------------------

/// Where and how to scrape a discovered workload.
#[derive(Debug, Clone, PartialEq)]
pub struct ScrapeEndpoint {
    pub url: Url,
    /// Prepended to every metric name scraped from this endpoint
    pub prefix: String,
    /// Attached to every point scraped from this endpoint
    pub tags: BTreeMap<String, String>,
    /// Per-request timeout
    pub timeout: Duration,
}

// ============================================================================
// SECTION 4: ERROR HANDLING FRAMEWORK
// ============================================================================

// ----------------------------------------------------------------------------
// 4.1 Core Engine Errors
// ----------------------------------------------------------------------------

/// The main error type for the harvester.
#[derive(Error, Debug)]
pub enum HarvesterError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Discovery error: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("Scrape error: {0}")]
    Scrape(#[from] ScrapeError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl HarvesterError {
    pub fn is_recoverable(&self) -> bool {
        match self {
            HarvesterError::Config(e) => e.is_recoverable(),
            HarvesterError::Discovery(e) => e.is_recoverable(),
            HarvesterError::Scrape(_) => true,
            HarvesterError::Io(_) => true,
            HarvesterError::Internal(_) => false,
        }
    }

    /// Error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            HarvesterError::Config(_) => "config",
            HarvesterError::Discovery(_) => "discovery",
            HarvesterError::Scrape(_) => "scrape",
            HarvesterError::Io(_) => "io",
            HarvesterError::Internal(_) => "internal",
        }
    }
}

// ----------------------------------------------------------------------------
// 4.2 Configuration Errors
// ----------------------------------------------------------------------------

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Failed to parse configuration {path}: {message}")]
    ParseError { path: PathBuf, message: String },

    #[error("Invalid configuration value for '{field}': {message}")]
    InvalidValue { field: String, message: String },

    /// The discovery rule file cannot even be stat'ed. Fatal.
    #[error("Unable to get discovery config file stats for {path}: {source}")]
    SourceUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ConfigError {
    pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn parse(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        ConfigError::ParseError {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn is_recoverable(&self) -> bool {
        !matches!(self, ConfigError::SourceUnavailable { .. })
    }
}

// ----------------------------------------------------------------------------
// 4.3 Discovery Errors
// ----------------------------------------------------------------------------

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("Workload already registered: {identity}")]
    AlreadyRegistered { identity: WorkloadIdentity },

    #[error("Unable to resolve scrape endpoint for {identity}: {message}")]
    Resolution {
        identity: WorkloadIdentity,
        message: String,
    },

    #[error("Failed to create provider for {identity}: {message}")]
    ProviderInit {
        identity: WorkloadIdentity,
        message: String,
    },

    #[error("Discovery of {kind} workloads is not supported")]
    UnsupportedKind { kind: WorkloadKind },

    #[error("Listing workloads failed: {message}")]
    ListFailed { message: String },
}

impl DiscoveryError {
    pub fn resolution(identity: &WorkloadIdentity, message: impl Into<String>) -> Self {
        DiscoveryError::Resolution {
            identity: identity.clone(),
            message: message.into(),
        }
    }

    /// Resolution and listing failures clear up on the next event or sweep.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            DiscoveryError::Resolution { .. } | DiscoveryError::ListFailed { .. } | DiscoveryError::ProviderInit { .. }
        )
    }
}

// ----------------------------------------------------------------------------
// 4.4 Scrape Errors
// ----------------------------------------------------------------------------

#[derive(Error, Debug)]
pub enum ScrapeError {
    #[error("Request to '{source_name}' failed: {message}")]
    Request { source_name: String, message: String },

    #[error("Source '{source_name}' returned HTTP {status}")]
    Status { source_name: String, status: u16 },

    #[error("Timeout scraping '{source_name}' after {timeout_ms}ms")]
    Timeout { source_name: String, timeout_ms: u64 },

    #[error("Invalid response body from '{source_name}': {message}")]
    Body { source_name: String, message: String },
}

// ----------------------------------------------------------------------------
// 4.5 Result Type Aliases
// ----------------------------------------------------------------------------

pub type HarvesterResult<T> = Result<T, HarvesterError>;
pub type DiscoveryResult<T> = Result<T, DiscoveryError>;
pub type ScrapeResult<T> = Result<T, ScrapeError>;

// ============================================================================
// SECTION 5: CONFIGURATION SYSTEM
// ============================================================================
// Two documents: the agent configuration (figment, TOML + HARVESTER_ env
// overrides) read once at startup, and the discovery rule file, polled for
// modification-time changes and hot-reloaded.
// ============================================================================

// ----------------------------------------------------------------------------
// 5.1 Agent Configuration
// ----------------------------------------------------------------------------

/// Root agent configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub agent: GeneralConfig,

    #[serde(default)]
    pub discovery: DiscoverySettings,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Collection loop settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_instance_name")]
    pub instance_name: String,

    /// Interval between collection ticks
    #[serde(default = "default_collection_interval", with = "humantime_serde")]
    pub collection_interval: Duration,

    /// Global deadline of one scrape fan-out
    #[serde(default = "default_scrape_timeout", with = "humantime_serde")]
    pub scrape_timeout: Duration,

    /// Cap on concurrently running scrapes (0 = unbounded)
    #[serde(default = "default_max_concurrent_scrapes")]
    pub max_concurrent_scrapes: usize,

    #[serde(default = "default_shutdown_timeout", with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            instance_name: default_instance_name(),
            collection_interval: default_collection_interval(),
            scrape_timeout: default_scrape_timeout(),
            max_concurrent_scrapes: default_max_concurrent_scrapes(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

/// Where discovery input comes from
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoverySettings {
    /// Hot-reloaded rule file; rule-driven discovery is off when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rules_file: Option<PathBuf>,

    #[serde(default = "default_rule_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Static workload inventory used by the standalone binary
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inventory_file: Option<PathBuf>,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            rules_file: None,
            poll_interval: default_rule_poll_interval(),
            inventory_file: None,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,

    /// json, pretty, compact
    #[serde(default = "default_log_format")]
    pub format: String,

    #[serde(default = "default_true")]
    pub colors: bool,

    #[serde(default)]
    pub source_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            colors: true,
            source_location: false,
        }
    }
}

fn default_instance_name() -> String {
    ENGINE_NAME.to_string()
}
fn default_collection_interval() -> Duration {
    DEFAULT_COLLECTION_INTERVAL
}
fn default_scrape_timeout() -> Duration {
    DEFAULT_METRICS_SCRAPE_TIMEOUT
}
fn default_max_concurrent_scrapes() -> usize {
    DEFAULT_MAX_CONCURRENT_SCRAPES
}
fn default_shutdown_timeout() -> Duration {
    SHUTDOWN_GRACE_PERIOD
}
fn default_rule_poll_interval() -> Duration {
    DEFAULT_RULE_POLL_INTERVAL
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "pretty".to_string()
}
fn default_true() -> bool {
    true
}

impl AgentConfig {
    /// Load configuration from file with environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }

        let figment = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("HARVESTER_").split("__"));

        let config: Self = figment
            .extract()
            .map_err(|e| ConfigError::parse(path, e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Load from string (for testing)
    pub fn from_str(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(toml_str).map_err(|e| ConfigError::parse("<inline>", e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.agent.collection_interval < MIN_COLLECTION_INTERVAL {
            return Err(ConfigError::invalid_value(
                "agent.collection_interval",
                format!(
                    "Collection interval must be at least {}",
                    humantime::format_duration(MIN_COLLECTION_INTERVAL)
                ),
            ));
        }

        if self.agent.scrape_timeout.is_zero() {
            return Err(ConfigError::invalid_value(
                "agent.scrape_timeout",
                "Scrape timeout must be greater than zero",
            ));
        }

        if self.discovery.poll_interval.is_zero() {
            return Err(ConfigError::invalid_value(
                "discovery.poll_interval",
                "Rule file poll interval must be greater than zero",
            ));
        }

        if !matches!(self.logging.format.as_str(), "json" | "pretty" | "compact") {
            return Err(ConfigError::invalid_value(
                "logging.format",
                format!("Unknown log format '{}'", self.logging.format),
            ));
        }

        Ok(())
    }
}

/// Generate a default configuration file
pub fn generate_default_config() -> String {
    let config = AgentConfig::default();
    toml::to_string_pretty(&config).unwrap_or_else(|_| String::from("# Failed to generate config"))
}

// ----------------------------------------------------------------------------
// 5.2 Discovery Rules
// ----------------------------------------------------------------------------

/// Parsed contents of the discovery rule file.
///
/// ```toml
/// [global]
/// discovery_interval = "5m"
///
/// [[rules]]
/// name = "frontend"
/// kind = "pod"
/// namespace = "web"
/// labels = { app = "frontend" }
/// port = 9102
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default)]
    pub global: GlobalDiscoveryConfig,

    #[serde(default)]
    pub rules: Vec<DiscoveryRule>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GlobalDiscoveryConfig {
    /// Sweep interval; missing or zero means the default
    #[serde(default, with = "humantime_serde")]
    pub discovery_interval: Option<Duration>,

    /// Per-request timeout of discovered endpoints
    #[serde(default, with = "humantime_serde")]
    pub scrape_timeout: Option<Duration>,
}

/// One rule-driven discovery scope.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryRule {
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub kind: WorkloadKind,

    /// Unset or empty means all namespaces
    #[serde(default)]
    pub namespace: Option<String>,

    #[serde(default)]
    pub labels: LabelSelector,

    #[serde(default)]
    pub port: Option<u16>,

    #[serde(default)]
    pub path: Option<String>,

    #[serde(default)]
    pub scheme: Option<String>,

    #[serde(default)]
    pub prefix: String,
}

impl DiscoveryRule {
    /// Namespace the rule is restricted to, if any.
    pub fn scope(&self) -> Option<&str> {
        self.namespace.as_deref().filter(|ns| !ns.is_empty())
    }
}

impl DiscoveryConfig {
    pub fn from_str(toml_str: &str) -> Result<Self, ConfigError> {
        toml::from_str(toml_str).map_err(|e| ConfigError::parse("<inline>", e.to_string()))
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| ConfigError::parse(path, e.to_string()))?;
        toml::from_str(&content).map_err(|e| ConfigError::parse(path, e.to_string()))
    }

    pub fn discovery_interval(&self) -> Duration {
        self.global
            .discovery_interval
            .filter(|d| !d.is_zero())
            .unwrap_or(DEFAULT_DISCOVERY_INTERVAL)
    }

    pub fn scrape_timeout(&self) -> Option<Duration> {
        self.global.scrape_timeout.filter(|d| !d.is_zero())
    }
}

// ----------------------------------------------------------------------------
// 5.3 Rule File Watcher
// ----------------------------------------------------------------------------

/// Result of one rule file poll.
#[derive(Debug)]
pub enum RuleFileChange {
    /// Modification time did not advance
    Unchanged,
    /// New contents parsed successfully
    Updated(DiscoveryConfig),
    /// New contents failed to parse; the previous rules stay in force
    ParseFailed(ConfigError),
}

/// Tracks the rule file's last observed modification time.
#[derive(Debug)]
pub struct RuleFileWatcher {
    path: PathBuf,
    last_modified: Mutex<Option<SystemTime>>,
}

impl RuleFileWatcher {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            last_modified: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stat the file and re-read it when its modification time advanced.
    ///
    /// The recorded time moves forward even when parsing fails, so a broken
    /// file is reported once and then ignored until it changes again.
    pub fn poll(&self) -> Result<RuleFileChange, ConfigError> {
        let unavailable = |source: std::io::Error| ConfigError::SourceUnavailable {
            path: self.path.clone(),
            source,
        };
        let modified = fs::metadata(&self.path)
            .and_then(|meta| meta.modified())
            .map_err(unavailable)?;

        {
            let mut last = self.last_modified.lock();
            if matches!(*last, Some(previous) if modified <= previous) {
                return Ok(RuleFileChange::Unchanged);
            }
            *last = Some(modified);
        }

        match DiscoveryConfig::from_file(&self.path) {
            Ok(config) => Ok(RuleFileChange::Updated(config)),
            Err(e) => Ok(RuleFileChange::ParseFailed(e)),
        }
    }
}

// ============================================================================
// SECTION 6: LOGGING & TRACING INFRASTRUCTURE
// ============================================================================

/// Initialize the logging system
pub fn init_logging(config: &LoggingConfig) -> HarvesterResult<()> {
    let level_filter = match config.level.to_lowercase().as_str() {
        "trace" => LevelFilter::TRACE,
        "debug" => LevelFilter::DEBUG,
        "info" => LevelFilter::INFO,
        "warn" => LevelFilter::WARN,
        "error" => LevelFilter::ERROR,
        _ => LevelFilter::INFO,
    };

    let env_filter = EnvFilter::builder()
        .with_default_directive(level_filter.into())
        .from_env_lossy();

    let registry = tracing_subscriber::registry().with(env_filter);
    let result = match config.format.as_str() {
        "json" => registry
            .with(
                tracing_fmt::layer()
                    .json()
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location)
                    .with_thread_ids(true),
            )
            .try_init(),
        "compact" => registry
            .with(
                tracing_fmt::layer()
                    .compact()
                    .with_ansi(config.colors)
                    .with_target(true),
            )
            .try_init(),
        _ => registry
            .with(
                tracing_fmt::layer()
                    .pretty()
                    .with_ansi(config.colors)
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location),
            )
            .try_init(),
    };

    result.map_err(|e| HarvesterError::Internal(format!("Failed to set logger: {}", e)))
}

// ============================================================================
// SECTION 7: COLLABORATOR CONTRACTS
// ============================================================================
// The seams between the engine and the outside world: metric sources and
// their providers on the scrape side, listing, watching, resolution and
// provider construction on the discovery side.
// ============================================================================

/// Anything that can produce a batch of metrics for a time window.
#[async_trait]
pub trait MetricSource: Send + Sync {
    fn name(&self) -> &str;

    async fn scrape(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> ScrapeResult<DataBatch>;
}

/// A named bundle of metric sources. The name is the registry key.
pub trait MetricSourceProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Current sources; may be empty.
    fn sources(&self) -> Vec<Arc<dyn MetricSource>>;
}

/// Sink for provider registrations coming out of discovery.
pub trait ProviderHandler: Send + Sync {
    /// Insert or replace by provider name.
    fn add_provider(&self, provider: Arc<dyn MetricSourceProvider>);

    /// Remove by provider name; a no-op when absent.
    fn delete_provider(&self, name: &str);
}

/// Point-in-time listing of workloads.
#[async_trait]
pub trait WorkloadLister: Send + Sync {
    async fn list(
        &self,
        kind: WorkloadKind,
        namespace: Option<&str>,
        selector: &LabelSelector,
    ) -> DiscoveryResult<Vec<Workload>>;
}

/// Stream of workload changes; the initial snapshot arrives as `Added`.
pub trait WorkloadWatcher: Send + Sync {
    fn events(&self) -> BoxStream<'static, WorkloadEvent>;
}

/// Maps a workload to its scrape endpoint, if it has one.
pub trait TargetResolver: Send + Sync {
    /// `Ok(None)` means "nothing to scrape here", which is not an error.
    fn resolve(
        &self,
        workload: &Workload,
        rule: &DiscoveryRule,
        require_marker: bool,
    ) -> DiscoveryResult<Option<ScrapeEndpoint>>;
}

/// Builds the provider registered for a discovered workload.
pub trait ProviderFactory: Send + Sync {
    fn create(
        &self,
        name: &str,
        identity: &WorkloadIdentity,
        endpoint: ScrapeEndpoint,
    ) -> DiscoveryResult<Arc<dyn MetricSourceProvider>>;
}

/// Receives every merged batch.
#[async_trait]
pub trait BatchSink: Send + Sync {
    async fn export(&self, batch: DataBatch);
}

// ============================================================================
// SECTION 8: PROVIDER REGISTRY
// ============================================================================

/// Name-keyed set of metric source providers.
///
/// Readers take snapshots; nothing holds the lock across I/O.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: RwLock<HashMap<String, Arc<dyn MetricSourceProvider>>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_providers(providers: impl IntoIterator<Item = Arc<dyn MetricSourceProvider>>) -> Self {
        let registry = Self::new();
        for provider in providers {
            registry.upsert(provider);
        }
        registry
    }

    /// Insert or replace; returns the provider previously stored under the name.
    pub fn upsert(&self, provider: Arc<dyn MetricSourceProvider>) -> Option<Arc<dyn MetricSourceProvider>> {
        let name = provider.name().to_string();
        self.providers.write().insert(name, provider)
    }

    pub fn remove(&self, name: &str) -> Option<Arc<dyn MetricSourceProvider>> {
        self.providers.write().remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.providers.read().contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.providers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.read().is_empty()
    }

    /// Sorted provider names
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Flattened sources of every provider, collected under one read lock.
    pub fn sources(&self) -> Vec<Arc<dyn MetricSource>> {
        let providers = self.providers.read();
        providers
            .values()
            .flat_map(|provider| {
                trace!(target: "harvester::sources", provider = provider.name(), "Collecting sources from provider");
                provider.sources()
            })
            .collect()
    }
}

impl ProviderHandler for ProviderRegistry {
    fn add_provider(&self, provider: Arc<dyn MetricSourceProvider>) {
        self.upsert(provider);
    }

    fn delete_provider(&self, name: &str) {
        self.remove(name);
    }
}

impl Debug for ProviderRegistry {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.names())
            .finish()
    }
}

// ============================================================================
// SECTION 9: SOURCE MANAGER
// ============================================================================
// One scrape task per source, each delayed by a random jitter drawn below a
// ceiling that grows with the source count. A single aggregator receives
// partial batches over a rendezvous channel until every source answered or
// the global deadline passed. Late answers are dropped.
// ============================================================================

// ----------------------------------------------------------------------------
// 9.1 Latency Histogram
// ----------------------------------------------------------------------------

/// Per-tick latency buckets: bucket `i` counts results received `i` whole
/// seconds into the tick, the last bucket everything from 10s on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LatencyHistogram {
    buckets: [u64; LATENCY_BUCKETS],
}

impl LatencyHistogram {
    pub fn record(&mut self, elapsed: Duration) {
        let bucket = usize::try_from(elapsed.as_secs())
            .unwrap_or(usize::MAX)
            .min(LATENCY_BUCKETS - 1);
        self.buckets[bucket] += 1;
    }

    pub fn buckets(&self) -> &[u64; LATENCY_BUCKETS] {
        &self.buckets
    }

    pub fn total(&self) -> u64 {
        self.buckets.iter().sum()
    }
}

/// Upper bound (exclusive, milliseconds) of the start jitter for `sources` sources.
pub fn jitter_ceiling_ms(sources: usize) -> u64 {
    DELAY_PER_SOURCE_MS
        .saturating_mul(sources as u64)
        .min(MAX_DELAY_MS)
}

// ----------------------------------------------------------------------------
// 9.2 Self Metrics
// ----------------------------------------------------------------------------

/// Outcome labels of `harvester_scrape_results_total`
pub const OUTCOME_SUCCESS: &str = "success";
pub const OUTCOME_ERROR: &str = "error";
pub const OUTCOME_TIMEOUT: &str = "timeout";

/// Prometheus counters describing the scrape loop itself.
#[derive(Clone)]
pub struct SourceManagerMetrics {
    results: IntCounterVec,
    providers: IntGauge,
}

impl SourceManagerMetrics {
    pub fn register(registry: &PrometheusRegistry) -> Result<Self, prometheus::Error> {
        let results = IntCounterVec::new(
            Opts::new(
                "harvester_scrape_results_total",
                "Scrape results per collection tick by outcome",
            ),
            &["outcome"],
        )?;
        let providers = IntGauge::new(
            "harvester_registered_providers",
            "Metric source providers currently registered",
        )?;
        registry.register(Box::new(results.clone()))?;
        registry.register(Box::new(providers.clone()))?;
        Ok(Self { results, providers })
    }

    fn record(&self, outcome: &str) {
        self.results.with_label_values(&[outcome]).inc();
    }

    pub fn outcome_count(&self, outcome: &str) -> u64 {
        self.results.with_label_values(&[outcome]).get()
    }

    pub fn registered_providers(&self) -> i64 {
        self.providers.get()
    }
}

impl Debug for SourceManagerMetrics {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceManagerMetrics")
            .field("success", &self.outcome_count(OUTCOME_SUCCESS))
            .field("error", &self.outcome_count(OUTCOME_ERROR))
            .field("timeout", &self.outcome_count(OUTCOME_TIMEOUT))
            .field("providers", &self.registered_providers())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// 9.3 Scrape Task
// ----------------------------------------------------------------------------

/// Everything one detached scrape needs. Outlives the tick when the source
/// is slower than the deadline; its result is then discarded.
struct ScrapeTask {
    source: Arc<dyn MetricSource>,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    deadline: Instant,
    delay: Duration,
    permits: Option<Arc<Semaphore>>,
    metrics: Option<SourceManagerMetrics>,
}

impl ScrapeTask {
    async fn run(self, tx: flume::Sender<DataBatch>) {
        sleep(self.delay).await;
        let name = self.source.name().to_string();

        let permit = match &self.permits {
            Some(permits) => match timeout_at(self.deadline, Arc::clone(permits).acquire_owned()).await {
                Ok(Ok(permit)) => Some(permit),
                Ok(Err(_)) => {
                    debug!(target: "harvester::scrape", source = %name, "Tick ended before a scrape slot freed up");
                    self.record(OUTCOME_TIMEOUT);
                    return;
                }
                Err(_) => {
                    warn!(target: "harvester::scrape", source = %name, "No scrape slot available before deadline");
                    self.record(OUTCOME_TIMEOUT);
                    return;
                }
            },
            None => None,
        };

        trace!(target: "harvester::scrape", source = %name, "Querying source");
        let batch = match self.source.scrape(self.start, self.end).await {
            Ok(batch) => batch,
            Err(e) => {
                error!(target: "harvester::scrape", source = %name, error = %e, "Error scraping source");
                self.record(OUTCOME_ERROR);
                return;
            }
        };
        drop(permit);

        if Instant::now() >= self.deadline {
            warn!(target: "harvester::scrape", source = %name, "Failed to get response in time");
            self.record(OUTCOME_TIMEOUT);
            return;
        }

        match timeout_at(self.deadline, tx.send_async(batch)).await {
            Ok(Ok(())) => self.record(OUTCOME_SUCCESS),
            Ok(Err(_)) => {
                warn!(target: "harvester::scrape", source = %name, "Aggregator gone before response was delivered");
                self.record(OUTCOME_TIMEOUT);
            }
            Err(_) => {
                warn!(target: "harvester::scrape", source = %name, "Failed to send the response back");
                self.record(OUTCOME_TIMEOUT);
            }
        }
    }

    fn record(&self, outcome: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.record(outcome);
        }
    }
}

// ----------------------------------------------------------------------------
// 9.4 Source Manager
// ----------------------------------------------------------------------------

/// Scrapes every registered source once per call and merges the results.
pub struct SourceManager {
    registry: Arc<ProviderRegistry>,
    scrape_timeout: Duration,
    max_concurrency: usize,
    last_latencies: Mutex<LatencyHistogram>,
    metrics: Option<SourceManagerMetrics>,
}

impl SourceManager {
    /// A zero timeout falls back to [`DEFAULT_METRICS_SCRAPE_TIMEOUT`].
    pub fn new(registry: Arc<ProviderRegistry>, scrape_timeout: Duration) -> Self {
        let scrape_timeout = if scrape_timeout.is_zero() {
            DEFAULT_METRICS_SCRAPE_TIMEOUT
        } else {
            scrape_timeout
        };
        Self {
            registry,
            scrape_timeout,
            max_concurrency: 0,
            last_latencies: Mutex::new(LatencyHistogram::default()),
            metrics: None,
        }
    }

    /// Cap the number of scrapes running at once within one call; 0 removes
    /// the cap. Slots never carry over between calls.
    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max;
        self
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    pub fn with_metrics(mut self, metrics: SourceManagerMetrics) -> Self {
        metrics.providers.set(self.registry.len() as i64);
        self.metrics = Some(metrics);
        self
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    pub fn scrape_timeout(&self) -> Duration {
        self.scrape_timeout
    }

    pub fn metrics(&self) -> Option<&SourceManagerMetrics> {
        self.metrics.as_ref()
    }

    /// Histogram of the most recent completed call.
    pub fn last_latencies(&self) -> LatencyHistogram {
        *self.last_latencies.lock()
    }

    /// Scrape all sources concurrently and merge whatever arrives before the
    /// deadline. Never fails; missing sources simply contribute nothing.
    pub async fn scrape_metrics(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> DataBatch {
        debug!(target: "harvester::sources", %start, %end, "Scraping metrics");

        let sources = self.registry.sources();
        let total = sources.len();
        let started = Instant::now();
        let deadline = started + self.scrape_timeout;

        let ceiling = jitter_ceiling_ms(total);
        let delays: Vec<Duration> = {
            let mut rng = rand::thread_rng();
            (0..total)
                .map(|_| {
                    if ceiling == 0 {
                        Duration::ZERO
                    } else {
                        Duration::from_millis(rng.gen_range(0..ceiling))
                    }
                })
                .collect()
        };

        // Closed once this call returns, so a hung scrape only ever holds a
        // slot of its own tick.
        let permits = (self.max_concurrency > 0).then(|| Arc::new(Semaphore::new(self.max_concurrency)));

        let (tx, rx) = flume::bounded::<DataBatch>(0);
        for (source, delay) in sources.into_iter().zip(delays) {
            let task = ScrapeTask {
                source,
                start,
                end,
                deadline,
                delay,
                permits: permits.clone(),
                metrics: self.metrics.clone(),
            };
            tokio::spawn(task.run(tx.clone()));
        }
        drop(tx);

        let mut response = DataBatch::new(end);
        let mut latencies = LatencyHistogram::default();

        for received in 0..total {
            if Instant::now() >= deadline {
                warn!(target: "harvester::sources", received, total, "Failed to get all responses in time");
                break;
            }
            match timeout_at(deadline, rx.recv_async()).await {
                Ok(Ok(partial)) => {
                    response.merge_from(partial);
                    latencies.record(started.elapsed());
                }
                Ok(Err(_)) => {
                    debug!(target: "harvester::sources", received, total, "All scrape tasks finished");
                    break;
                }
                Err(_) => {
                    warn!(target: "harvester::sources", received, total, "Failed to get all responses in time (got {}/{})", received, total);
                    break;
                }
            }
        }

        if let Some(permits) = &permits {
            permits.close();
        }
        *self.last_latencies.lock() = latencies;

        debug!(
            target: "harvester::sources",
            elapsed_ms = started.elapsed().as_millis() as u64,
            metric_sets = response.metric_sets.len(),
            metric_points = response.metric_points.len(),
            "ScrapeMetrics: time: {:?} size: {}",
            started.elapsed(),
            response.metric_sets.len()
        );
        for (bucket, count) in latencies.buckets().iter().enumerate() {
            trace!(target: "harvester::sources", bucket, count, "Scrape latency bucket");
        }

        response
    }
}

#[async_trait]
impl MetricSource for SourceManager {
    fn name(&self) -> &str {
        SOURCE_MANAGER_NAME
    }

    async fn scrape(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> ScrapeResult<DataBatch> {
        Ok(self.scrape_metrics(start, end).await)
    }
}

impl ProviderHandler for SourceManager {
    fn add_provider(&self, provider: Arc<dyn MetricSourceProvider>) {
        let name = provider.name().to_string();
        if self.registry.upsert(provider).is_some() {
            debug!(target: "harvester::sources", provider = %name, "Replaced metric source provider");
        } else {
            info!(target: "harvester::sources", provider = %name, "Added metric source provider");
        }
        if let Some(metrics) = &self.metrics {
            metrics.providers.set(self.registry.len() as i64);
        }
    }

    fn delete_provider(&self, name: &str) {
        if self.registry.remove(name).is_some() {
            info!(target: "harvester::sources", provider = %name, "Deleted metric source provider");
        } else {
            trace!(target: "harvester::sources", provider = %name, "Delete of unknown provider ignored");
        }
        if let Some(metrics) = &self.metrics {
            metrics.providers.set(self.registry.len() as i64);
        }
    }
}

impl Debug for SourceManager {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceManager")
            .field("registry", &self.registry)
            .field("scrape_timeout", &self.scrape_timeout)
            .field("max_concurrency", &self.max_concurrency)
            .field("last_latencies", &self.last_latencies())
            .finish()
    }
}

// ============================================================================
// SECTION 10: TARGET RESOLUTION
// ============================================================================

/// Resolves scrape endpoints from `prometheus.io/*` annotations, with rule
/// fields taking precedence over annotations.
#[derive(Debug, Clone, Default)]
pub struct AnnotationResolver;

impl AnnotationResolver {
    pub fn new() -> Self {
        Self
    }
}

impl TargetResolver for AnnotationResolver {
    fn resolve(
        &self,
        workload: &Workload,
        rule: &DiscoveryRule,
        require_marker: bool,
    ) -> DiscoveryResult<Option<ScrapeEndpoint>> {
        let identity = workload.identity();

        if require_marker && workload.annotation(SCRAPE_ANNOTATION).map(str::trim) != Some("true") {
            return Ok(None);
        }

        let Some(ip) = workload.ip.as_deref().map(str::trim).filter(|ip| !ip.is_empty()) else {
            return Ok(None);
        };

        let port = match rule.port {
            Some(port) => port,
            None => match workload.annotation(PORT_ANNOTATION) {
                Some(raw) => raw.trim().parse::<u16>().map_err(|e| {
                    DiscoveryError::resolution(
                        &identity,
                        format!("invalid {} annotation '{}': {}", PORT_ANNOTATION, raw, e),
                    )
                })?,
                None => return Ok(None),
            },
        };

        let scheme = rule
            .scheme
            .as_deref()
            .or_else(|| workload.annotation(SCHEME_ANNOTATION))
            .map(|s| s.trim().to_ascii_lowercase())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_SCHEME.to_string());
        if scheme != "http" && scheme != "https" {
            return Err(DiscoveryError::resolution(
                &identity,
                format!("unsupported scheme '{}'", scheme),
            ));
        }

        let path = rule
            .path
            .as_deref()
            .or_else(|| workload.annotation(PATH_ANNOTATION))
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .unwrap_or(DEFAULT_METRICS_PATH);
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{}", path)
        };

        // IPv6 literals need brackets in the authority
        let host = if ip.contains(':') {
            format!("[{}]", ip)
        } else {
            ip.to_string()
        };

        let url = Url::parse(&format!("{}://{}:{}{}", scheme, host, port, path))
            .map_err(|e| DiscoveryError::resolution(&identity, format!("invalid endpoint url: {}", e)))?;

        let mut tags = BTreeMap::new();
        tags.insert("namespace".to_string(), workload.namespace.clone());
        tags.insert(workload.kind.to_string(), workload.name.clone());
        if !rule.name.is_empty() {
            tags.insert("discovery_rule".to_string(), rule.name.clone());
        }

        Ok(Some(ScrapeEndpoint {
            url,
            prefix: rule.prefix.clone(),
            tags,
            timeout: DEFAULT_METRICS_SCRAPE_TIMEOUT,
        }))
    }
}

// ============================================================================
// SECTION 11: PROMETHEUS TEXT EXPOSITION SOURCE
// ============================================================================

// ----------------------------------------------------------------------------
// 11.1 Exposition Samples
// ----------------------------------------------------------------------------

/// One value of a parsed sample, flattened the way it appears on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct ExpositionValue {
    pub metric: String,
    pub labels: BTreeMap<String, String>,
    pub value: f64,
    pub timestamp_ms: i64,
}

/// Non-comment, non-blank lines of a text exposition body.
fn count_sample_lines(body: &str) -> usize {
    body.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .count()
}

fn format_bound(bound: f64) -> String {
    if bound == f64::INFINITY {
        "+Inf".to_string()
    } else if bound == f64::NEG_INFINITY {
        "-Inf".to_string()
    } else {
        bound.to_string()
    }
}

/// Expand a parsed sample back into one value per exposition line.
/// Histogram and summary families are grouped by the parser; each bucket or
/// quantile becomes its own value carrying an `le` or `quantile` label.
pub fn flatten_sample(sample: &PromSample) -> Vec<ExpositionValue> {
    let labels: BTreeMap<String, String> = sample
        .labels
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    let timestamp_ms = sample.timestamp.timestamp_millis();
    let single = |value: f64| ExpositionValue {
        metric: sample.metric.clone(),
        labels: labels.clone(),
        value,
        timestamp_ms,
    };

    match &sample.value {
        PromValue::Counter(v) | PromValue::Gauge(v) | PromValue::Untyped(v) => vec![single(*v)],
        PromValue::Histogram(buckets) => {
            let metric = if sample.metric.ends_with("_bucket") {
                sample.metric.clone()
            } else {
                format!("{}_bucket", sample.metric)
            };
            buckets
                .iter()
                .map(|bucket| {
                    let mut labels = labels.clone();
                    labels.insert("le".to_string(), format_bound(bucket.less_than));
                    ExpositionValue {
                        metric: metric.clone(),
                        labels,
                        value: bucket.count,
                        timestamp_ms,
                    }
                })
                .collect()
        }
        PromValue::Summary(quantiles) => quantiles
            .iter()
            .map(|quantile| {
                let mut labels = labels.clone();
                labels.insert("quantile".to_string(), format_bound(quantile.quantile));
                ExpositionValue {
                    metric: sample.metric.clone(),
                    labels,
                    value: quantile.count,
                    timestamp_ms,
                }
            })
            .collect(),
    }
}

// ----------------------------------------------------------------------------
// 11.2 HTTP Scrape Source
// ----------------------------------------------------------------------------

/// Scrapes one endpoint over HTTP and converts the body into metric points.
pub struct PrometheusSource {
    name: String,
    endpoint: ScrapeEndpoint,
    client: HttpClient,
}

impl PrometheusSource {
    pub fn new(name: impl Into<String>, endpoint: ScrapeEndpoint, client: HttpClient) -> Self {
        Self {
            name: name.into(),
            endpoint,
            client,
        }
    }

    pub fn endpoint(&self) -> &ScrapeEndpoint {
        &self.endpoint
    }

    /// Build the batch for one scraped body: a point per exposition value
    /// plus a summary metric set keyed by the source name.
    pub fn to_batch(&self, body: &str, timestamp: DateTime<Utc>) -> ScrapeResult<DataBatch> {
        let scrape = Scrape::parse(body.lines().map(|line| Ok(line.to_owned()))).map_err(|e| ScrapeError::Body {
            source_name: self.name.clone(),
            message: e.to_string(),
        })?;

        let values: Vec<ExpositionValue> = scrape.samples.iter().flat_map(flatten_sample).collect();
        let skipped_lines = count_sample_lines(body).saturating_sub(values.len());
        if skipped_lines > 0 {
            debug!(
                target: "harvester::scrape",
                source = %self.name,
                skipped = skipped_lines,
                "Skipped malformed exposition lines"
            );
        }

        let mut batch = DataBatch::new(timestamp);
        let point_count = values.len();

        for value in values {
            let mut tags = self.endpoint.tags.clone();
            tags.extend(value.labels);
            batch.metric_points.push(MetricPoint {
                metric: format!("{}{}", self.endpoint.prefix, value.metric),
                value: value.value,
                timestamp_ms: value.timestamp_ms,
                source: self.name.clone(),
                tags,
            });
        }

        let mut set = MetricSet::new()
            .with_scrape_time(timestamp)
            .with_value("up", 1i64)
            .with_value("points", point_count as i64)
            .with_value("skipped_lines", skipped_lines as i64);
        set.labels = self.endpoint.tags.clone();
        batch.metric_sets.insert(self.name.clone(), set);

        Ok(batch)
    }
}

#[async_trait]
impl MetricSource for PrometheusSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn scrape(&self, _start: DateTime<Utc>, end: DateTime<Utc>) -> ScrapeResult<DataBatch> {
        let response = self
            .client
            .get(self.endpoint.url.clone())
            .timeout(self.endpoint.timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ScrapeError::Timeout {
                        source_name: self.name.clone(),
                        timeout_ms: self.endpoint.timeout.as_millis() as u64,
                    }
                } else {
                    ScrapeError::Request {
                        source_name: self.name.clone(),
                        message: e.to_string(),
                    }
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ScrapeError::Status {
                source_name: self.name.clone(),
                status: status.as_u16(),
            });
        }

        let body = response.text().await.map_err(|e| ScrapeError::Body {
            source_name: self.name.clone(),
            message: e.to_string(),
        })?;

        self.to_batch(&body, end)
    }
}

impl Debug for PrometheusSource {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrometheusSource")
            .field("name", &self.name)
            .field("url", &self.endpoint.url.as_str())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// 11.3 Provider & Factory
// ----------------------------------------------------------------------------

/// Provider wrapping the single source of a discovered workload.
pub struct PrometheusProvider {
    name: String,
    sources: Vec<Arc<dyn MetricSource>>,
}

impl PrometheusProvider {
    pub fn new(name: impl Into<String>, sources: Vec<Arc<dyn MetricSource>>) -> Self {
        Self {
            name: name.into(),
            sources,
        }
    }
}

impl MetricSourceProvider for PrometheusProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn sources(&self) -> Vec<Arc<dyn MetricSource>> {
        self.sources.clone()
    }
}

impl Debug for PrometheusProvider {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrometheusProvider")
            .field("name", &self.name)
            .field("sources", &self.sources.iter().map(|s| s.name().to_string()).collect::<Vec<_>>())
            .finish()
    }
}

/// Creates HTTP-backed providers sharing one connection pool.
#[derive(Debug, Clone)]
pub struct PrometheusProviderFactory {
    client: HttpClient,
}

impl PrometheusProviderFactory {
    pub fn new() -> Self {
        let client = HttpClient::builder()
            .user_agent(format!("{}/{}", ENGINE_NAME, ENGINE_VERSION))
            .build()
            .unwrap_or_default();
        Self { client }
    }

    pub fn with_client(client: HttpClient) -> Self {
        Self { client }
    }
}

impl Default for PrometheusProviderFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderFactory for PrometheusProviderFactory {
    fn create(
        &self,
        name: &str,
        identity: &WorkloadIdentity,
        endpoint: ScrapeEndpoint,
    ) -> DiscoveryResult<Arc<dyn MetricSourceProvider>> {
        if endpoint.timeout.is_zero() {
            return Err(DiscoveryError::ProviderInit {
                identity: identity.clone(),
                message: "endpoint timeout must be greater than zero".to_string(),
            });
        }
        let source_name = format!("{}: {}", PROMETHEUS_PROVIDER_NAME, endpoint.url);
        let source: Arc<dyn MetricSource> =
            Arc::new(PrometheusSource::new(source_name, endpoint, self.client.clone()));
        Ok(Arc::new(PrometheusProvider::new(name, vec![source])))
    }
}

// ============================================================================
// SECTION 12: IN-MEMORY WORKLOAD INVENTORY
// ============================================================================

#[derive(Debug, Default, Deserialize)]
struct InventoryFile {
    #[serde(default)]
    workloads: Vec<Workload>,
}

/// Workload store implementing both listing and watching.
///
/// Backs the standalone binary (loaded from a TOML file) and the tests.
pub struct InMemoryInventory {
    workloads: RwLock<BTreeMap<(WorkloadKind, WorkloadIdentity), Workload>>,
    events: broadcast::Sender<WorkloadEvent>,
}

impl InMemoryInventory {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(WORKLOAD_EVENT_CAPACITY);
        Self {
            workloads: RwLock::new(BTreeMap::new()),
            events,
        }
    }

    /// Load `[[workloads]]` entries from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }
        let content = fs::read_to_string(path).map_err(|e| ConfigError::parse(path, e.to_string()))?;
        let file: InventoryFile = toml::from_str(&content).map_err(|e| ConfigError::parse(path, e.to_string()))?;

        let inventory = Self::new();
        for workload in file.workloads {
            inventory.upsert(workload);
        }
        Ok(inventory)
    }

    /// Insert or update a workload and notify watchers.
    pub fn upsert(&self, workload: Workload) {
        let key = (workload.kind, workload.identity());
        let previous = self.workloads.write().insert(key, workload.clone());
        let event = if previous.is_some() {
            WorkloadEvent::Updated(workload)
        } else {
            WorkloadEvent::Added(workload)
        };
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    pub fn remove(&self, kind: WorkloadKind, identity: &WorkloadIdentity) -> Option<Workload> {
        let removed = self.workloads.write().remove(&(kind, identity.clone()));
        if let Some(workload) = &removed {
            let _ = self.events.send(WorkloadEvent::Deleted(workload.clone()));
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.workloads.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.workloads.read().is_empty()
    }
}

impl Default for InMemoryInventory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkloadLister for InMemoryInventory {
    async fn list(
        &self,
        kind: WorkloadKind,
        namespace: Option<&str>,
        selector: &LabelSelector,
    ) -> DiscoveryResult<Vec<Workload>> {
        let workloads = self.workloads.read();
        Ok(workloads
            .values()
            .filter(|w| w.kind == kind)
            .filter(|w| namespace.map_or(true, |ns| w.namespace == ns))
            .filter(|w| selector_matches(selector, &w.labels))
            .cloned()
            .collect())
    }
}

impl WorkloadWatcher for InMemoryInventory {
    fn events(&self) -> BoxStream<'static, WorkloadEvent> {
        // Subscribe first so nothing changed during the snapshot is lost.
        let receiver = self.events.subscribe();
        let snapshot: Vec<WorkloadEvent> = self
            .workloads
            .read()
            .values()
            .cloned()
            .map(WorkloadEvent::Added)
            .collect();

        let live = stream::unfold(receiver, |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => return Some((event, receiver)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(target: "harvester::discovery", skipped, "Workload watcher lagged; events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });

        stream::iter(snapshot).chain(live).boxed()
    }
}

impl Debug for InMemoryInventory {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryInventory")
            .field("workloads", &self.len())
            .field("watchers", &self.events.receiver_count())
            .finish()
    }
}

// ============================================================================
// SECTION 13: DISCOVERY MANAGER
// ============================================================================
// Two inputs feed one registration path. Workload events register opted-in
// pods immediately; the rule file drives a periodic sweep that registers
// every matching workload. Each hot reload replaces the sweep: the previous
// one is cancelled before its successor starts.
// ============================================================================

/// Outcome of a registration attempt that did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Registration {
    Registered { provider: String },
    /// The workload has nothing to scrape
    NoEndpoint,
}

/// Outcome of one rule file check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleReload {
    Unchanged,
    Applied { generation: u64 },
    ParseFailed,
}

/// Handle of the running rule sweep.
struct SweepHandle {
    generation: u64,
    token: CancellationToken,
    task: TokioJoinHandle<()>,
}

/// Reconciles workload events and discovery rules into provider registrations.
pub struct DiscoveryManager {
    lister: Arc<dyn WorkloadLister>,
    resolver: Arc<dyn TargetResolver>,
    factory: Arc<dyn ProviderFactory>,
    handler: Arc<dyn ProviderHandler>,
    /// Guards the whole check-resolve-create-add sequence
    registered: Mutex<HashSet<WorkloadIdentity>>,
    config: ArcSwapOption<DiscoveryConfig>,
    sweep: Mutex<Option<SweepHandle>>,
    generation: AtomicU64,
}

impl DiscoveryManager {
    pub fn new(
        lister: Arc<dyn WorkloadLister>,
        resolver: Arc<dyn TargetResolver>,
        factory: Arc<dyn ProviderFactory>,
        handler: Arc<dyn ProviderHandler>,
    ) -> Self {
        Self {
            lister,
            resolver,
            factory,
            handler,
            registered: Mutex::new(HashSet::new()),
            config: ArcSwapOption::empty(),
            sweep: Mutex::new(None),
            generation: AtomicU64::new(0),
        }
    }

    /// Provider key derived from a workload identity.
    pub fn provider_key(identity: &WorkloadIdentity) -> String {
        format!("{}: {}", PROMETHEUS_PROVIDER_NAME, identity)
    }

    pub fn is_registered(&self, identity: &WorkloadIdentity) -> bool {
        self.registered.lock().contains(identity)
    }

    /// Sorted snapshot of registered identities
    pub fn registered(&self) -> Vec<WorkloadIdentity> {
        let mut identities: Vec<WorkloadIdentity> = self.registered.lock().iter().cloned().collect();
        identities.sort();
        identities
    }

    /// Rules currently in force, if any were ever applied.
    pub fn current_config(&self) -> Option<Arc<DiscoveryConfig>> {
        self.config.load_full()
    }

    /// Generation of the most recently applied rule set (0 = none).
    pub fn generation(&self) -> u64 {
        self.generation.load(AtomicOrdering::SeqCst)
    }

    // ------------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------------

    /// Register a workload as a scrape target.
    ///
    /// The identity is checked, the endpoint resolved, the provider built and
    /// handed to the handler, and the identity recorded, all under one lock,
    /// so a workload is never registered twice no matter how many callers
    /// race on it.
    pub fn register(
        &self,
        workload: &Workload,
        rule: &DiscoveryRule,
        require_marker: bool,
    ) -> DiscoveryResult<Registration> {
        let identity = workload.identity();
        let mut registered = self.registered.lock();

        if registered.contains(&identity) {
            debug!(target: "harvester::discovery", workload = %identity, "Workload already registered");
            return Err(DiscoveryError::AlreadyRegistered { identity });
        }

        let endpoint = match self.resolver.resolve(workload, rule, require_marker) {
            Ok(Some(endpoint)) => endpoint,
            Ok(None) => {
                trace!(target: "harvester::discovery", workload = %identity, "No scrape endpoint for workload");
                return Ok(Registration::NoEndpoint);
            }
            Err(e) => {
                error!(target: "harvester::discovery", workload = %identity, error = %e, "Unable to resolve scrape endpoint");
                return Err(e);
            }
        };
        let endpoint = self.apply_endpoint_overrides(endpoint);
        let url = endpoint.url.to_string();

        let key = Self::provider_key(&identity);
        let provider = self.factory.create(&key, &identity, endpoint).map_err(|e| {
            error!(target: "harvester::discovery", workload = %identity, error = %e, "Unable to create provider");
            e
        })?;

        self.handler.add_provider(provider);
        registered.insert(identity.clone());
        info!(target: "harvester::discovery", workload = %identity, provider = %key, url = %url, "Registered scrape target");

        Ok(Registration::Registered { provider: key })
    }

    fn apply_endpoint_overrides(&self, mut endpoint: ScrapeEndpoint) -> ScrapeEndpoint {
        if let Some(timeout) = self.config.load_full().and_then(|c| c.scrape_timeout()) {
            endpoint.timeout = timeout;
        }
        endpoint
    }

    /// Remove a workload's provider. Returns false when it was not registered.
    pub fn unregister(&self, identity: &WorkloadIdentity) -> bool {
        let mut registered = self.registered.lock();
        if !registered.contains(identity) {
            trace!(target: "harvester::discovery", workload = %identity, "Unregister of unknown workload ignored");
            return false;
        }
        let key = Self::provider_key(identity);
        self.handler.delete_provider(&key);
        registered.remove(identity);
        info!(target: "harvester::discovery", workload = %identity, provider = %key, "Unregistered scrape target");
        true
    }

    // ------------------------------------------------------------------------
    // Event-driven discovery
    // ------------------------------------------------------------------------

    /// Apply one workload event. Only pods are reconciled from events, and
    /// only those carrying the scrape opt-in marker.
    pub fn on_workload_event(&self, event: &WorkloadEvent) {
        let workload = event.workload();
        if workload.kind != WorkloadKind::Pod {
            trace!(target: "harvester::discovery", kind = %workload.kind, action = event.action(), "Ignoring event for non-pod workload");
            return;
        }

        debug!(target: "harvester::discovery", workload = %workload.identity(), action = event.action(), "Workload event");
        match event {
            WorkloadEvent::Added(w) | WorkloadEvent::Updated(w) => {
                // failures are logged inside register
                let _ = self.register(w, &DiscoveryRule::default(), true);
            }
            WorkloadEvent::Deleted(w) => {
                self.unregister(&w.identity());
            }
        }
    }

    /// Consume workload events until the stream ends or shutdown is requested.
    pub async fn run_event_loop(&self, mut events: BoxStream<'static, WorkloadEvent>, shutdown: CancellationToken) {
        info!(target: "harvester::discovery", "Workload event loop started");
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                next = events.next() => match next {
                    Some(event) => self.on_workload_event(&event),
                    None => {
                        warn!(target: "harvester::discovery", "Workload event stream ended");
                        break;
                    }
                },
            }
        }
        info!(target: "harvester::discovery", "Workload event loop stopped");
    }

    // ------------------------------------------------------------------------
    // Rule-driven discovery
    // ------------------------------------------------------------------------

    /// Check the rule file and apply it when it changed.
    ///
    /// Only a file that cannot be stat'ed is an error; a file that fails to
    /// parse leaves the current rules and sweep untouched.
    pub fn reload_rules(self: &Arc<Self>, watcher: &RuleFileWatcher) -> Result<RuleReload, ConfigError> {
        match watcher.poll()? {
            RuleFileChange::Unchanged => {
                trace!(target: "harvester::config", path = %watcher.path().display(), "Discovery rule file unchanged");
                Ok(RuleReload::Unchanged)
            }
            RuleFileChange::ParseFailed(e) => {
                error!(target: "harvester::config", path = %watcher.path().display(), error = %e, "Unable to load discovery config");
                Ok(RuleReload::ParseFailed)
            }
            RuleFileChange::Updated(config) => {
                info!(target: "harvester::config", path = %watcher.path().display(), rules = config.rules.len(), "Discovery rule file changed");
                let generation = self.apply_rules(config);
                Ok(RuleReload::Applied { generation })
            }
        }
    }

    /// Poll the rule file until shutdown. Returns an error when the file
    /// becomes unavailable, which the caller treats as fatal.
    pub async fn watch_rules(
        self: Arc<Self>,
        watcher: RuleFileWatcher,
        poll_interval: Duration,
        shutdown: CancellationToken,
    ) -> Result<(), ConfigError> {
        let mut ticker = interval(poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Ok(()),
                _ = ticker.tick() => {
                    if let Err(e) = self.reload_rules(&watcher) {
                        error!(target: "harvester::config", error = %e, "Unable to get discovery config file stats");
                        return Err(e);
                    }
                }
            }
        }
    }

    /// Make `config` the rule set in force and restart the sweep on it.
    ///
    /// The previous sweep is cancelled before the new one is spawned; it may
    /// finish an iteration already in progress but never starts another.
    pub fn apply_rules(self: &Arc<Self>, config: DiscoveryConfig) -> u64 {
        let config = Arc::new(config);
        let period = config.discovery_interval();
        self.config.store(Some(Arc::clone(&config)));

        let mut sweep = self.sweep.lock();
        if let Some(previous) = sweep.take() {
            previous.token.cancel();
            debug!(target: "harvester::discovery", generation = previous.generation, "Cancelled previous discovery sweep");
        }

        let generation = self.generation.fetch_add(1, AtomicOrdering::SeqCst) + 1;
        let token = CancellationToken::new();
        let manager = Arc::clone(self);
        let sweep_token = token.clone();
        let rules = Arc::clone(&config);
        let task = tokio::spawn(async move {
            manager.run_sweep(rules, period, generation, sweep_token).await;
        });

        *sweep = Some(SweepHandle {
            generation,
            token,
            task,
        });

        info!(
            target: "harvester::discovery",
            generation,
            rules = config.rules.len(),
            interval = %humantime::format_duration(period),
            "Applied discovery rules"
        );
        generation
    }

    async fn run_sweep(&self, config: Arc<DiscoveryConfig>, period: Duration, generation: u64, token: CancellationToken) {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    let registered = self.sweep_rules(&config.rules).await;
                    debug!(target: "harvester::discovery", generation, registered, "Discovery sweep finished");
                }
            }
        }
        trace!(target: "harvester::discovery", generation, "Ended discovery config processing");
    }

    /// Run every rule once. Returns how many workloads were newly registered.
    pub async fn sweep_rules(&self, rules: &[DiscoveryRule]) -> usize {
        if rules.is_empty() {
            debug!(target: "harvester::discovery", "Empty discovery rules");
            return 0;
        }

        let mut registered = 0;
        for rule in rules {
            let workloads = match self.discover(rule).await {
                Ok(workloads) => workloads,
                Err(e) => {
                    error!(target: "harvester::discovery", rule = %rule.name, kind = %rule.kind, error = %e, "Discovery rule failed");
                    continue;
                }
            };
            trace!(target: "harvester::discovery", rule = %rule.name, matched = workloads.len(), "Discovered workloads");

            for workload in &workloads {
                if let Ok(Registration::Registered { .. }) = self.register(workload, rule, false) {
                    registered += 1;
                }
            }
        }
        registered
    }

    async fn discover(&self, rule: &DiscoveryRule) -> DiscoveryResult<Vec<Workload>> {
        match rule.kind {
            WorkloadKind::Pod => self.lister.list(WorkloadKind::Pod, rule.scope(), &rule.labels).await,
            kind @ (WorkloadKind::Service | WorkloadKind::Ingress) => Err(DiscoveryError::UnsupportedKind { kind }),
        }
    }

    /// Cancel the running sweep, if any, and wait for it to finish.
    pub async fn stop(&self) {
        let handle = self.sweep.lock().take();
        if let Some(handle) = handle {
            handle.token.cancel();
            if let Err(e) = handle.task.await {
                warn!(target: "harvester::discovery", error = %e, "Discovery sweep task failed");
            }
        }
    }
}

impl Debug for DiscoveryManager {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiscoveryManager")
            .field("registered", &self.registered.lock().len())
            .field("generation", &self.generation())
            .field("rules", &self.current_config().map(|c| c.rules.len()))
            .finish()
    }
}

// ============================================================================
// SECTION 14: AGENT
// ============================================================================

/// Sink that reports each batch through the log.
#[derive(Debug, Clone, Default)]
pub struct LogSink;

#[async_trait]
impl BatchSink for LogSink {
    async fn export(&self, batch: DataBatch) {
        info!(
            target: "harvester::export",
            timestamp = %batch.timestamp,
            metric_sets = batch.metric_sets.len(),
            metric_points = batch.metric_points.len(),
            "Exported batch"
        );
    }
}

/// Wires discovery, the source manager and a sink into a running agent.
pub struct Agent {
    config: AgentConfig,
    sources: Arc<SourceManager>,
    discovery: Arc<DiscoveryManager>,
    watcher: Arc<dyn WorkloadWatcher>,
    sink: Arc<dyn BatchSink>,
    self_metrics: PrometheusRegistry,
    shutdown: CancellationToken,
}

impl Agent {
    pub fn new(
        config: AgentConfig,
        lister: Arc<dyn WorkloadLister>,
        watcher: Arc<dyn WorkloadWatcher>,
        resolver: Arc<dyn TargetResolver>,
        factory: Arc<dyn ProviderFactory>,
        sink: Arc<dyn BatchSink>,
    ) -> HarvesterResult<Self> {
        config.validate()?;

        let self_metrics = PrometheusRegistry::new();
        let metrics = SourceManagerMetrics::register(&self_metrics)
            .map_err(|e| HarvesterError::Internal(format!("Failed to register self metrics: {}", e)))?;

        let sources = Arc::new(
            SourceManager::new(Arc::new(ProviderRegistry::new()), config.agent.scrape_timeout)
                .with_max_concurrency(config.agent.max_concurrent_scrapes)
                .with_metrics(metrics),
        );
        let handler: Arc<dyn ProviderHandler> = Arc::clone(&sources) as Arc<dyn ProviderHandler>;
        let discovery = Arc::new(DiscoveryManager::new(lister, resolver, factory, handler));

        Ok(Self {
            config,
            sources,
            discovery,
            watcher,
            sink,
            self_metrics,
            shutdown: CancellationToken::new(),
        })
    }

    /// Standalone wiring: static inventory, annotation resolution, HTTP
    /// scraping, log export.
    pub fn from_config(config: AgentConfig) -> HarvesterResult<Self> {
        let inventory = match &config.discovery.inventory_file {
            Some(path) => Arc::new(InMemoryInventory::from_file(path)?),
            None => Arc::new(InMemoryInventory::new()),
        };
        info!(target: "harvester::engine", workloads = inventory.len(), "Workload inventory loaded");

        Self::new(
            config,
            Arc::clone(&inventory) as Arc<dyn WorkloadLister>,
            inventory,
            Arc::new(AnnotationResolver::new()),
            Arc::new(PrometheusProviderFactory::new()),
            Arc::new(LogSink),
        )
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn source_manager(&self) -> &Arc<SourceManager> {
        &self.sources
    }

    pub fn discovery(&self) -> &Arc<DiscoveryManager> {
        &self.discovery
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Self metrics in the Prometheus text format.
    pub fn render_self_metrics(&self) -> String {
        let mut buffer = Vec::new();
        if let Err(e) = TextEncoder::new().encode(&self.self_metrics.gather(), &mut buffer) {
            warn!(target: "harvester::engine", error = %e, "Failed to encode self metrics");
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }

    /// One collection tick: scrape everything and hand the batch to the sink.
    pub async fn collect_once(&self, start: DateTime<Utc>, end: DateTime<Utc>) {
        let batch = self.sources.scrape_metrics(start, end).await;
        self.sink.export(batch).await;
    }

    /// Run until shutdown is requested or the rule file becomes unavailable.
    pub async fn run(&self) -> HarvesterResult<()> {
        info!(
            target: "harvester::engine",
            instance = %self.config.agent.instance_name,
            version = ENGINE_VERSION,
            interval = %humantime::format_duration(self.config.agent.collection_interval),
            "Starting {}",
            ENGINE_FULL_NAME
        );

        // An unavailable rule file aborts startup before the event loop exists.
        let mut rules_task = None;
        if let Some(path) = &self.config.discovery.rules_file {
            let watcher = RuleFileWatcher::new(path);
            self.discovery.reload_rules(&watcher)?;
            rules_task = Some(tokio::spawn(Arc::clone(&self.discovery).watch_rules(
                watcher,
                self.config.discovery.poll_interval,
                self.shutdown.child_token(),
            )));
        }

        let events_task = {
            let discovery = Arc::clone(&self.discovery);
            let events = self.watcher.events();
            let token = self.shutdown.child_token();
            tokio::spawn(async move { discovery.run_event_loop(events, token).await })
        };

        let signal_token = self.shutdown.clone();
        tokio::spawn(async move {
            wait_for_signal().await;
            signal_token.cancel();
        });

        let period = self.config.agent.collection_interval;
        let window = chrono::Duration::from_std(period).unwrap_or_else(|_| chrono::Duration::zero());
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let outcome = loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break Ok(()),
                joined = join_rule_watcher(&mut rules_task) => {
                    break match joined {
                        Ok(Ok(())) => Ok(()),
                        Ok(Err(e)) => Err(HarvesterError::from(e)),
                        Err(e) => Err(HarvesterError::Internal(format!("Rule watcher panicked: {}", e))),
                    };
                }
                _ = ticker.tick() => {
                    let end = Utc::now();
                    self.collect_once(end - window, end).await;
                }
            }
        };

        info!(target: "harvester::engine", "Shutting down");
        self.shutdown.cancel();
        self.discovery.stop().await;
        if timeout(self.config.agent.shutdown_timeout, events_task).await.is_err() {
            warn!(target: "harvester::engine", "Workload event loop did not stop in time");
        }
        debug!(target: "harvester::engine", metrics = %self.render_self_metrics(), "Final self metrics");

        outcome
    }
}

async fn join_rule_watcher(
    task: &mut Option<TokioJoinHandle<Result<(), ConfigError>>>,
) -> Result<Result<(), ConfigError>, tokio::task::JoinError> {
    match task {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => info!(target: "harvester::engine", "Received SIGTERM"),
                    _ = tokio::signal::ctrl_c() => info!(target: "harvester::engine", "Received SIGINT"),
                }
                return;
            }
            Err(e) => warn!(target: "harvester::engine", error = %e, "Unable to install SIGTERM handler"),
        }
    }
    if tokio::signal::ctrl_c().await.is_ok() {
        info!(target: "harvester::engine", "Received SIGINT");
    }
}

impl Debug for Agent {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Agent")
            .field("instance", &self.config.agent.instance_name)
            .field("sources", &self.sources)
            .field("discovery", &self.discovery)
            .finish()
    }
}

// ============================================================================
// SECTION 15: CLI INTERFACE
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "harvester")]
#[command(author = "Platform Observability Team")]
#[command(version = ENGINE_VERSION)]
#[command(about = "Workload discovery and metrics scraping agent", long_about = None)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH, env = "HARVESTER_CONFIG")]
    pub config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, env = "HARVESTER_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Enable debug mode
    #[arg(short, long)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the agent (default)
    Run,

    /// Validate a discovery rule file
    ValidateRules {
        #[arg(short, long)]
        rules: PathBuf,

        /// Print every rule
        #[arg(short, long)]
        verbose: bool,
    },

    /// Generate default configuration
    GenerateConfig {
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show version information
    Version,
}

fn handle_validate_rules(path: &Path, verbose: bool) -> AnyhowResult<()> {
    println!("Validating discovery rules: {}", path.display());

    let config = DiscoveryConfig::from_file(path).context("Discovery rule file is invalid")?;
    println!("✅ {} rule(s), sweep every {}", config.rules.len(), humantime::format_duration(config.discovery_interval()));

    let mut unsupported = 0;
    for rule in &config.rules {
        if rule.kind != WorkloadKind::Pod {
            unsupported += 1;
            println!("⚠️  rule '{}': {} discovery is not supported and will be skipped", rule.name, rule.kind);
        }
        if verbose {
            println!(
                "   - {} kind={} namespace={} labels={:?} port={:?}",
                rule.name,
                rule.kind,
                rule.scope().unwrap_or("*"),
                rule.labels,
                rule.port
            );
        }
    }
    if unsupported == 0 {
        println!("✅ All rules use supported workload kinds");
    }
    Ok(())
}

fn handle_generate_config(output: Option<&Path>) -> AnyhowResult<()> {
    let config = generate_default_config();
    match output {
        Some(path) => {
            fs::write(path, &config).with_context(|| format!("Failed to write {}", path.display()))?;
            println!("Configuration written to: {}", path.display());
        }
        None => println!("{}", config),
    }
    Ok(())
}

fn handle_version() {
    println!("{} v{}", ENGINE_FULL_NAME, ENGINE_VERSION);
    println!("Engine: {}", ENGINE_NAME);
}

// ============================================================================
// SECTION 16: MAIN ENTRY POINT
// ============================================================================

#[tokio::main]
async fn main() -> AnyhowResult<()> {
    let cli = Cli::parse();

    match &cli.command {
        Some(Commands::Version) => {
            handle_version();
            return Ok(());
        }
        Some(Commands::GenerateConfig { output }) => return handle_generate_config(output.as_deref()),
        Some(Commands::ValidateRules { rules, verbose }) => return handle_validate_rules(rules, *verbose),
        Some(Commands::Run) | None => {}
    }

    let config_found = cli.config.exists();
    let mut config = if config_found {
        AgentConfig::load(&cli.config)
            .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?
    } else {
        AgentConfig::default()
    };

    if cli.debug {
        config.logging.level = "debug".to_string();
    } else if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
    init_logging(&config.logging)?;

    if !config_found {
        warn!(target: "harvester::config", path = %cli.config.display(), "Config file not found, using defaults");
    }

    let agent = Agent::from_config(config)?;
    if let Err(e) = agent.run().await {
        error!(target: "harvester::engine", category = e.category(), error = %e, "Agent terminated");
        return Err(e.into());
    }

    info!(target: "harvester::engine", "Agent stopped");
    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================


#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_workload_identity_display() {
        let identity = WorkloadIdentity::new("kube-system", "dns-0");
        assert_eq!(identity.to_string(), "kube-system/dns-0");
        assert_eq!(
            DiscoveryManager::provider_key(&identity),
            "prometheus_source: kube-system/dns-0"
        );
    }

    #[test]
    fn test_selector_matching() {
        let labels: BTreeMap<String, String> = [("app", "api"), ("tier", "backend")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        assert!(selector_matches(&LabelSelector::new(), &labels));

        let mut selector = LabelSelector::new();
        selector.insert("app".into(), "api".into());
        assert!(selector_matches(&selector, &labels));

        selector.insert("tier".into(), "frontend".into());
        assert!(!selector_matches(&selector, &labels));
    }

    #[test]
    fn test_merge_overwrites_sets_and_appends_points() {
        let mut merged = DataBatch::new(Utc::now());
        merged.merge_from(test_support::batch_with("pod-a", 1, 2));
        merged.merge_from(test_support::batch_with("pod-a", 7, 3));
        merged.merge_from(test_support::batch_with("pod-b", 4, 0));

        assert_eq!(merged.metric_sets.len(), 2);
        assert_eq!(merged.metric_points.len(), 5);
        assert_eq!(
            merged.metric_sets["pod-a"].value("value"),
            Some(MetricValue::Int(7))
        );
    }

    #[test]
    fn test_empty_batch() {
        let batch = DataBatch::new(Utc::now());
        assert!(batch.is_empty());
        assert!(!test_support::batch_with("x", 1, 0).is_empty());
    }

    #[test]
    fn test_error_categories() {
        let err = HarvesterError::from(DiscoveryError::UnsupportedKind {
            kind: WorkloadKind::Ingress,
        });
        assert_eq!(err.category(), "discovery");
        assert!(!err.is_recoverable());
        assert_eq!(
            err.to_string(),
            "Discovery error: Discovery of ingress workloads is not supported"
        );

        let err = HarvesterError::from(ConfigError::SourceUnavailable {
            path: PathBuf::from("/etc/rules.toml"),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        });
        assert_eq!(err.category(), "config");
        assert!(!err.is_recoverable());

        let err = HarvesterError::from(DiscoveryError::resolution(
            &WorkloadIdentity::new("a", "b"),
            "bad port",
        ));
        assert!(err.is_recoverable());
    }
}


#[cfg(test)]
mod source_manager_tests {
    use super::test_support::*;
    use super::*;
    use test_case::test_case;

    fn manager(providers: Vec<Arc<dyn MetricSourceProvider>>, timeout: Duration) -> SourceManager {
        SourceManager::new(Arc::new(ProviderRegistry::with_providers(providers)), timeout)
    }

    #[test_case(0 => 0; "no sources")]
    #[test_case(1 => 8; "single source")]
    #[test_case(100 => 800; "grows per source")]
    #[test_case(500 => 4000; "reaches the cap")]
    #[test_case(10_000 => 4000; "clamped")]
    fn test_jitter_ceiling(sources: usize) -> u64 {
        jitter_ceiling_ms(sources)
    }

    #[test]
    fn test_latency_histogram_buckets() {
        let mut histogram = LatencyHistogram::default();
        histogram.record(Duration::from_millis(20));
        histogram.record(Duration::from_millis(999));
        histogram.record(Duration::from_millis(3_500));
        histogram.record(Duration::from_secs(10));
        histogram.record(Duration::from_secs(42));

        pretty_assertions::assert_eq!(histogram.buckets()[0], 2);
        pretty_assertions::assert_eq!(histogram.buckets()[3], 1);
        pretty_assertions::assert_eq!(histogram.buckets()[10], 2);
        pretty_assertions::assert_eq!(histogram.total(), 5);
    }

    #[test]
    fn test_registry_upsert_and_remove() {
        let registry = ProviderRegistry::new();
        assert!(registry.upsert(provider("p1", vec![])).is_none());
        assert!(registry.upsert(provider("p1", vec![])).is_some());
        registry.upsert(provider("p0", vec![]));

        pretty_assertions::assert_eq!(registry.names(), vec!["p0".to_string(), "p1".to_string()]);
        assert!(registry.remove("missing").is_none());
        pretty_assertions::assert_eq!(registry.len(), 2);

        registry.delete_provider("p1");
        assert!(!registry.contains("p1"));
        pretty_assertions::assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_zero_timeout_uses_default() {
        let manager = manager(vec![], Duration::ZERO);
        pretty_assertions::assert_eq!(manager.scrape_timeout(), DEFAULT_METRICS_SCRAPE_TIMEOUT);
        pretty_assertions::assert_eq!(manager.name(), SOURCE_MANAGER_NAME);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_registry_returns_empty_batch() {
        let manager = manager(vec![], Duration::from_secs(5));
        let end = Utc::now();
        let started = Instant::now();

        let batch = manager.scrape_metrics(end - chrono::Duration::seconds(60), end).await;

        assert!(batch.is_empty());
        pretty_assertions::assert_eq!(batch.timestamp, end);
        pretty_assertions::assert_eq!(started.elapsed(), Duration::ZERO);
        pretty_assertions::assert_eq!(manager.last_latencies().total(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_timeout_keeps_responders() {
        let timeout = Duration::from_millis(500);
        let manager = manager(
            vec![
                provider("a", vec![StaticSource::ok("a", Duration::from_millis(100), batch_with("shared", 1, 1))]),
                provider("b", vec![StaticSource::ok("b", Duration::from_millis(150), batch_with("shared", 2, 1))]),
                provider("c", vec![StaticSource::hanging("c")]),
            ],
            timeout,
        );

        let started = Instant::now();
        let end = Utc::now();
        let batch = manager.scrape_metrics(end, end).await;
        let elapsed = started.elapsed();

        assert!(elapsed >= timeout, "returned before the deadline: {:?}", elapsed);
        assert!(elapsed < timeout + Duration::from_millis(50), "overran the deadline: {:?}", elapsed);
        pretty_assertions::assert_eq!(batch.metric_sets.len(), 1);
        pretty_assertions::assert_eq!(batch.metric_points.len(), 2);
        let value = batch.metric_sets["shared"].value("value");
        assert!(value == Some(MetricValue::Int(1)) || value == Some(MetricValue::Int(2)));

        let latencies = manager.last_latencies();
        pretty_assertions::assert_eq!(latencies.total(), 2);
        pretty_assertions::assert_eq!(latencies.buckets()[0], 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_excludes_slow_sources() {
        let timeout = Duration::from_secs(1);
        let providers = (0..4u32)
            .map(|i| {
                let name = format!("source-{}", i);
                provider(
                    &name,
                    vec![StaticSource::ok(&name, timeout * i, batch_with(&name, i as i64, 1))],
                )
            })
            .collect();
        let registry = PrometheusRegistry::new();
        let metrics = SourceManagerMetrics::register(&registry).unwrap();
        let manager = manager(providers, timeout).with_metrics(metrics.clone());

        let started = Instant::now();
        let batch = manager.scrape_metrics(Utc::now(), Utc::now()).await;

        assert!(started.elapsed() <= timeout + Duration::from_millis(10));
        pretty_assertions::assert_eq!(batch.metric_sets.keys().collect::<Vec<_>>(), vec!["source-0"]);
        pretty_assertions::assert_eq!(batch.metric_points.len(), 1);

        // late scrapes keep running detached and are dropped once they finish
        sleep(timeout * 4).await;
        pretty_assertions::assert_eq!(metrics.outcome_count(OUTCOME_SUCCESS), 1);
        pretty_assertions::assert_eq!(metrics.outcome_count(OUTCOME_TIMEOUT), 3);
        pretty_assertions::assert_eq!(metrics.outcome_count(OUTCOME_ERROR), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_source_does_not_exhaust_scrape_slots() {
        let manager = manager(
            vec![
                provider("hung", vec![StaticSource::hanging("hung")]),
                provider("ok", vec![StaticSource::ok("ok", Duration::from_millis(10), batch_with("ok", 1, 1))]),
            ],
            Duration::from_millis(500),
        )
        .with_max_concurrency(2);

        for tick in 0..6 {
            let batch = manager.scrape_metrics(Utc::now(), Utc::now()).await;
            assert!(batch.metric_sets.contains_key("ok"), "healthy source missing on tick {}", tick);
        }
        pretty_assertions::assert_eq!(manager.max_concurrency(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_sources_contribute_nothing() {
        let registry = PrometheusRegistry::new();
        let metrics = SourceManagerMetrics::register(&registry).unwrap();
        let manager = manager(
            vec![provider(
                "mixed",
                vec![
                    StaticSource::failing("broken", Duration::from_millis(5)),
                    StaticSource::ok("healthy", Duration::from_millis(10), batch_with("healthy", 3, 4)),
                ],
            )],
            DEFAULT_METRICS_SCRAPE_TIMEOUT,
        )
        .with_metrics(metrics.clone());

        let started = Instant::now();
        let batch = manager.scrape_metrics(Utc::now(), Utc::now()).await;

        // every task finished, so there is no need to wait for the deadline
        assert!(started.elapsed() < Duration::from_secs(1));
        pretty_assertions::assert_eq!(batch.metric_sets.len(), 1);
        assert!(batch.metric_sets.contains_key("healthy"));
        pretty_assertions::assert_eq!(batch.metric_points.len(), 4);
        pretty_assertions::assert_eq!(metrics.outcome_count(OUTCOME_SUCCESS), 1);
        pretty_assertions::assert_eq!(metrics.outcome_count(OUTCOME_ERROR), 1);
        pretty_assertions::assert_eq!(metrics.outcome_count(OUTCOME_TIMEOUT), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_cap_serializes_scrapes() {
        let manager = manager(
            vec![provider(
                "capped",
                (0..3)
                    .map(|i| {
                        let name = format!("s{}", i);
                        StaticSource::ok(&name, Duration::from_millis(100), batch_with(&name, i, 0))
                    })
                    .collect(),
            )],
            Duration::from_secs(10),
        )
        .with_max_concurrency(1);

        let started = Instant::now();
        let batch = manager.scrape_metrics(Utc::now(), Utc::now()).await;

        pretty_assertions::assert_eq!(batch.metric_sets.len(), 3);
        assert!(started.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_provider_handler_updates_gauge() {
        let registry = PrometheusRegistry::new();
        let metrics = SourceManagerMetrics::register(&registry).unwrap();
        let manager = manager(vec![], Duration::from_secs(1)).with_metrics(metrics.clone());

        manager.add_provider(provider("p1", vec![]));
        manager.add_provider(provider("p2", vec![]));
        manager.add_provider(provider("p2", vec![]));
        pretty_assertions::assert_eq!(metrics.registered_providers(), 2);

        manager.delete_provider("p1");
        manager.delete_provider("p1");
        pretty_assertions::assert_eq!(metrics.registered_providers(), 1);
        pretty_assertions::assert_eq!(manager.registry().names(), vec!["p2".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_source_manager_as_metric_source() {
        let manager = manager(
            vec![provider("a", vec![StaticSource::ok("a", Duration::ZERO, batch_with("a", 1, 2))])],
            Duration::from_secs(1),
        );
        let source: &dyn MetricSource = &manager;

        let batch = source.scrape(Utc::now(), Utc::now()).await.unwrap();
        pretty_assertions::assert_eq!(batch.metric_points.len(), 2);
    }
}



#[cfg(test)]
mod inventory_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_list_filters() {
        let inventory = InMemoryInventory::new();
        inventory.upsert(Workload::pod("a", "p1").with_label("app", "x"));
        inventory.upsert(Workload::pod("a", "p2").with_label("app", "y"));
        inventory.upsert(Workload::pod("b", "p3").with_label("app", "x"));
        inventory.upsert(Workload::new(WorkloadKind::Service, "a", "svc").with_label("app", "x"));

        let mut selector = LabelSelector::new();
        selector.insert("app".into(), "x".into());

        let scoped = inventory.list(WorkloadKind::Pod, Some("a"), &selector).await.unwrap();
        assert_eq!(scoped.iter().map(|w| w.name.as_str()).collect::<Vec<_>>(), vec!["p1"]);

        let all_pods = inventory.list(WorkloadKind::Pod, None, &LabelSelector::new()).await.unwrap();
        assert_eq!(all_pods.len(), 3);
    }

    #[tokio::test]
    async fn test_events_replay_snapshot_then_changes() {
        let inventory = InMemoryInventory::new();
        inventory.upsert(Workload::pod("a", "p1"));

        let mut events = inventory.events();
        inventory.upsert(Workload::pod("a", "p1").with_ip("10.0.0.1"));
        inventory.remove(WorkloadKind::Pod, &WorkloadIdentity::new("a", "p1"));

        assert_eq!(events.next().await.map(|e| e.action()), Some("added"));
        assert_eq!(events.next().await.map(|e| e.action()), Some("updated"));
        assert_eq!(events.next().await.map(|e| e.action()), Some("deleted"));
        assert!(inventory.is_empty());
    }

    #[test]
    fn test_inventory_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("inventory.toml");
        fs::write(
            &path,
            r#"
            [[workloads]]
            namespace = "default"
            name = "api-0"
            ip = "10.0.0.4"
            labels = { app = "api" }
            annotations = { "prometheus.io/scrape" = "true", "prometheus.io/port" = "9102" }

            [[workloads]]
            kind = "service"
            namespace = "default"
            name = "api"
            "#,
        )
        .unwrap();

        let inventory = InMemoryInventory::from_file(&path).unwrap();
        assert_eq!(inventory.len(), 2);
        assert!(matches!(
            InMemoryInventory::from_file(dir.path().join("missing.toml")),
            Err(ConfigError::FileNotFound { .. })
        ));
    }
}

#[cfg(test)]
mod discovery_tests {
    use super::test_support::*;
    use super::*;
    use pretty_assertions::assert_eq;

    fn write_rules(path: &Path, content: &str, modified: SystemTime) {
        fs::write(path, content).unwrap();
        fs::File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(modified)
            .unwrap();
    }

    #[test]
    fn test_register_is_idempotent() {
        let h = harness(Arc::new(InMemoryInventory::new()));
        let pod = marked_pod("default", "api", "10.0.0.1");

        let first = h.manager.register(&pod, &DiscoveryRule::default(), true).unwrap();
        assert_eq!(
            first,
            Registration::Registered {
                provider: "prometheus_source: default/api".to_string()
            }
        );

        let second = h.manager.register(&pod, &DiscoveryRule::default(), true);
        assert!(matches!(second, Err(DiscoveryError::AlreadyRegistered { .. })));
        assert_eq!(h.registry.len(), 1);
        assert_eq!(h.factory.created.load(AtomicOrdering::SeqCst), 1);
    }

    #[test]
    fn test_concurrent_register_adds_one_provider() {
        let h = harness(Arc::new(InMemoryInventory::new()));
        let pod = marked_pod("default", "api", "10.0.0.1");

        let successes: usize = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| scope.spawn(|| h.manager.register(&pod, &DiscoveryRule::default(), true).is_ok()))
                .collect();
            handles
                .into_iter()
                .map(|handle| usize::from(handle.join().unwrap()))
                .sum()
        });

        assert_eq!(successes, 1);
        assert_eq!(h.registry.len(), 1);
        assert_eq!(h.factory.created.load(AtomicOrdering::SeqCst), 1);
    }

    #[test]
    fn test_unregister_unknown_is_noop() {
        let h = harness(Arc::new(InMemoryInventory::new()));
        h.manager
            .register(&marked_pod("default", "api", "10.0.0.1"), &DiscoveryRule::default(), true)
            .unwrap();

        let ghost = WorkloadIdentity::new("default", "ghost");
        assert!(!h.manager.unregister(&ghost));
        assert!(!h.manager.unregister(&ghost));
        assert_eq!(h.registry.names(), vec!["prometheus_source: default/api".to_string()]);
    }

    #[test]
    fn test_unregister_then_register_again() {
        let h = harness(Arc::new(InMemoryInventory::new()));
        let pod = marked_pod("default", "api", "10.0.0.1");

        h.manager.register(&pod, &DiscoveryRule::default(), true).unwrap();
        assert!(h.manager.unregister(&pod.identity()));
        assert!(h.registry.is_empty());
        assert!(!h.manager.is_registered(&pod.identity()));

        h.manager.register(&pod, &DiscoveryRule::default(), true).unwrap();
        assert_eq!(h.registry.len(), 1);
        assert_eq!(h.factory.created.load(AtomicOrdering::SeqCst), 2);
    }

    #[test]
    fn test_unresolvable_workload_stays_unregistered() {
        let h = harness(Arc::new(InMemoryInventory::new()));

        let no_ip = Workload::pod("default", "pending").with_annotation(SCRAPE_ANNOTATION, "true");
        assert_eq!(
            h.manager.register(&no_ip, &DiscoveryRule::default(), true).unwrap(),
            Registration::NoEndpoint
        );

        let bad_port = marked_pod("default", "broken", "10.0.0.2").with_annotation(PORT_ANNOTATION, "99999");
        assert!(matches!(
            h.manager.register(&bad_port, &DiscoveryRule::default(), true),
            Err(DiscoveryError::Resolution { .. })
        ));

        assert!(h.manager.registered().is_empty());
        assert!(h.registry.is_empty());
    }

    #[test]
    fn test_workload_events() {
        let h = harness(Arc::new(InMemoryInventory::new()));
        let api = marked_pod("default", "api", "10.0.0.1");
        let unmarked = Workload::pod("default", "batch")
            .with_ip("10.0.0.2")
            .with_annotation(PORT_ANNOTATION, "9102");
        let service = Workload::new(WorkloadKind::Service, "default", "api-svc")
            .with_ip("10.96.0.1")
            .with_annotation(SCRAPE_ANNOTATION, "true")
            .with_annotation(PORT_ANNOTATION, "9102");

        h.manager.on_workload_event(&WorkloadEvent::Added(api.clone()));
        h.manager.on_workload_event(&WorkloadEvent::Added(unmarked.clone()));
        h.manager.on_workload_event(&WorkloadEvent::Added(service));
        assert_eq!(h.manager.registered(), vec![api.identity()]);

        h.manager.on_workload_event(&WorkloadEvent::Updated(api.clone()));
        assert_eq!(h.factory.created.load(AtomicOrdering::SeqCst), 1);

        h.manager.on_workload_event(&WorkloadEvent::Deleted(api.clone()));
        h.manager.on_workload_event(&WorkloadEvent::Deleted(api));
        h.manager.on_workload_event(&WorkloadEvent::Deleted(unmarked));
        assert!(h.manager.registered().is_empty());
        assert!(h.registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_event_loop_follows_inventory() {
        let inventory = Arc::new(InMemoryInventory::new());
        inventory.upsert(marked_pod("default", "api", "10.0.0.1"));
        let h = harness(Arc::clone(&inventory));

        let token = CancellationToken::new();
        let task = tokio::spawn({
            let manager = Arc::clone(&h.manager);
            let events = inventory.events();
            let token = token.clone();
            async move { manager.run_event_loop(events, token).await }
        });

        settle().await;
        assert!(h.manager.is_registered(&WorkloadIdentity::new("default", "api")));

        inventory.upsert(marked_pod("default", "worker", "10.0.0.3"));
        settle().await;
        assert_eq!(h.registry.len(), 2);

        inventory.remove(WorkloadKind::Pod, &WorkloadIdentity::new("default", "api"));
        settle().await;
        assert_eq!(h.registry.names(), vec!["prometheus_source: default/worker".to_string()]);

        token.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_label_scoped_rule() {
        let inventory = Arc::new(InMemoryInventory::new());
        inventory.upsert(Workload::pod("ns1", "w1").with_ip("10.0.1.1").with_label("app", "x"));
        inventory.upsert(Workload::pod("ns1", "w2").with_ip("10.0.1.2").with_label("app", "x"));
        inventory.upsert(Workload::pod("ns2", "w3").with_ip("10.0.2.3").with_label("app", "x"));
        inventory.upsert(Workload::pod("ns1", "w4").with_ip("10.0.1.4").with_label("app", "y"));
        let h = harness(inventory);

        let rule = DiscoveryRule {
            name: "x-in-ns1".into(),
            namespace: Some("ns1".into()),
            labels: [("app".to_string(), "x".to_string())].into_iter().collect(),
            port: Some(9100),
            ..DiscoveryRule::default()
        };

        let registered = h.manager.sweep_rules(&[rule]).await;

        assert_eq!(registered, 2);
        assert_eq!(
            h.manager.registered(),
            vec![WorkloadIdentity::new("ns1", "w1"), WorkloadIdentity::new("ns1", "w2")]
        );
        assert_eq!(*h.lister.namespaces.lock(), vec![Some("ns1".to_string())]);
        assert!(!h
            .lister
            .returned
            .lock()
            .contains(&WorkloadIdentity::new("ns2", "w3")));

        // marker-less rule registration does not need annotations
        let endpoints = h.factory.endpoints.lock();
        assert!(endpoints.iter().all(|e| e.url.port() == Some(9100)));
    }

    #[tokio::test]
    async fn test_unsupported_rule_kinds_are_skipped() {
        let inventory = Arc::new(InMemoryInventory::new());
        inventory.upsert(Workload::new(WorkloadKind::Service, "default", "api").with_ip("10.96.0.1"));
        let h = harness(inventory);

        let rules = vec![
            DiscoveryRule {
                kind: WorkloadKind::Service,
                port: Some(80),
                ..DiscoveryRule::default()
            },
            DiscoveryRule {
                kind: WorkloadKind::Ingress,
                port: Some(80),
                ..DiscoveryRule::default()
            },
        ];

        assert_eq!(h.manager.sweep_rules(&rules).await, 0);
        assert!(h.lister.namespaces.lock().is_empty());
        assert!(h.registry.is_empty());
        assert_eq!(h.manager.sweep_rules(&[]).await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rule_timeout_applies_to_endpoints() {
        let inventory = Arc::new(InMemoryInventory::new());
        inventory.upsert(Workload::pod("default", "api").with_ip("10.0.0.1"));
        let h = harness(inventory);

        let config = DiscoveryConfig::from_str(
            "[global]\nscrape_timeout = \"2s\"\n\n[[rules]]\nname = \"all\"\nport = 9100\n",
        )
        .unwrap();
        h.manager.apply_rules(config);
        settle().await;

        let endpoints = h.factory.endpoints.lock();
        assert_eq!(endpoints.len(), 1);
        assert_eq!(endpoints[0].timeout, Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hot_reload_replaces_sweep() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.toml");
        let base = SystemTime::now();
        let h = harness(Arc::new(InMemoryInventory::new()));
        let watcher = RuleFileWatcher::new(&path);

        write_rules(
            &path,
            "[global]\ndiscovery_interval = \"100s\"\n\n[[rules]]\nname = \"old\"\nnamespace = \"old\"\n",
            base,
        );
        assert_eq!(h.manager.reload_rules(&watcher).unwrap(), RuleReload::Applied { generation: 1 });
        settle().await;
        assert_eq!(h.lister.calls_for("old"), 1);
        assert_eq!(h.manager.reload_rules(&watcher).unwrap(), RuleReload::Unchanged);

        // a broken file keeps the old rules and their sweep
        write_rules(&path, "[[rules]\nname = ", base + Duration::from_secs(10));
        assert_eq!(h.manager.reload_rules(&watcher).unwrap(), RuleReload::ParseFailed);
        assert_eq!(h.manager.generation(), 1);
        assert_eq!(h.manager.current_config().unwrap().rules[0].name, "old");
        sleep(Duration::from_secs(100)).await;
        assert_eq!(h.lister.calls_for("old"), 2);

        write_rules(
            &path,
            "[global]\ndiscovery_interval = \"30s\"\n\n[[rules]]\nname = \"new\"\nnamespace = \"new\"\n",
            base + Duration::from_secs(20),
        );
        assert_eq!(h.manager.reload_rules(&watcher).unwrap(), RuleReload::Applied { generation: 2 });
        let old_calls = h.lister.calls_for("old");

        sleep(Duration::from_secs(250)).await;

        assert_eq!(h.lister.calls_for("old"), old_calls);
        assert!(h.lister.calls_for("new") >= 8, "new sweep ran {} times", h.lister.calls_for("new"));
        assert_eq!(h.manager.current_config().unwrap().rules[0].name, "new");

        h.manager.stop().await;
        let stopped_at = h.lister.calls_for("new");
        sleep(Duration::from_secs(100)).await;
        assert_eq!(h.lister.calls_for("new"), stopped_at);
    }

    #[tokio::test]
    async fn test_missing_rule_file_is_fatal() {
        let h = harness(Arc::new(InMemoryInventory::new()));
        let watcher = RuleFileWatcher::new("/nonexistent/harvester/rules.toml");

        let err = h.manager.reload_rules(&watcher).unwrap_err();
        assert!(matches!(err, ConfigError::SourceUnavailable { .. }));
        assert_eq!(h.manager.generation(), 0);

        let result = Arc::clone(&h.manager)
            .watch_rules(watcher, Duration::from_secs(1), CancellationToken::new())
            .await;
        assert!(result.is_err());
    }
}
