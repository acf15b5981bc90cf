//! Application configuration structures.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::models::Partition;

/// Root application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Source adapter settings
    #[serde(default)]
    pub source: SourceConfig,

    /// Catalog partitions enumerated by discovery
    #[serde(default = "defaults::partitions")]
    pub partitions: Vec<Partition>,

    /// HTTP client settings
    #[serde(default)]
    pub http: HttpConfig,

    /// Work queue backend settings
    #[serde(default)]
    pub queue: QueueConfig,

    /// Backoff policy shared by discovery and workers
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Mandatory delay after each processed item
    #[serde(default)]
    pub rate_limit: RateLimit,

    /// Detail worker pool
    #[serde(default)]
    pub worker: RunConfig,

    /// Missing-item verifier pool
    #[serde(default)]
    pub verifier: RunConfig,

    /// Discovery pass settings
    #[serde(default)]
    pub coordinator: CoordinatorConfig,

    /// Downstream sink
    #[serde(default)]
    pub sink: SinkConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Apply `RECRAWL_*` environment overrides.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(n) = lookup("RECRAWL_MAX_ATTEMPTS").and_then(|v| v.parse().ok()) {
            self.retry.max_attempts = n;
        }
        if let Some(n) = lookup("RECRAWL_CONCURRENCY").and_then(|v| v.parse().ok()) {
            self.worker.concurrency = n;
            self.verifier.concurrency = n;
        }
        if let Some(ms) = lookup("RECRAWL_RATE_LIMIT_MS").and_then(|v| v.parse().ok()) {
            self.rate_limit.base_delay_ms = ms;
        }
        if let Some(path) = lookup("RECRAWL_STATE_FILE").filter(|v| !v.trim().is_empty()) {
            self.queue.state_file = Some(PathBuf::from(path));
        }
        if let Some(path) = lookup("RECRAWL_DATABASE").filter(|v| !v.trim().is_empty()) {
            self.queue.backend = QueueBackend::Sqlite;
            self.queue.database = Some(PathBuf::from(path));
        }
    }

    /// Validate configuration values for basic sanity.
    pub fn validate(&self) -> Result<()> {
        if self.http.user_agent.trim().is_empty() {
            return Err(AppError::validation("http.user_agent is empty"));
        }
        if self.http.timeout_secs == 0 {
            return Err(AppError::validation("http.timeout_secs must be > 0"));
        }
        if self.source.search_url.trim().is_empty() || self.source.detail_url.trim().is_empty() {
            return Err(AppError::validation(
                "source.search_url and source.detail_url are required",
            ));
        }
        if !self.source.detail_url.contains("{id}") {
            return Err(AppError::validation(
                "source.detail_url must contain an {id} placeholder",
            ));
        }
        if let Some(form) = self.source.page_urls.iter().find(|u| !u.contains("{id}")) {
            return Err(AppError::validation(format!(
                "source.page_urls entry '{form}' has no {{id}} placeholder"
            )));
        }
        if self.partitions.is_empty() {
            return Err(AppError::validation("No partitions defined"));
        }
        if self.retry.max_attempts == 0 {
            return Err(AppError::validation("retry.max_attempts must be > 0"));
        }
        if self.retry.multiplier < 1.0 {
            return Err(AppError::validation("retry.multiplier must be >= 1.0"));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_ratio)
            || !(0.0..=1.0).contains(&self.rate_limit.jitter_ratio)
        {
            return Err(AppError::validation("jitter_ratio must be within [0, 1]"));
        }
        if self.worker.concurrency == 0 || self.verifier.concurrency == 0 {
            return Err(AppError::validation("concurrency must be > 0"));
        }
        if self.coordinator.max_pages == 0 {
            return Err(AppError::validation("coordinator.max_pages must be > 0"));
        }
        if self.coordinator.max_concurrent_partitions == 0 {
            return Err(AppError::validation(
                "coordinator.max_concurrent_partitions must be > 0",
            ));
        }
        if self.coordinator.max_drop_percent > 100 {
            return Err(AppError::validation(
                "coordinator.max_drop_percent must be <= 100",
            ));
        }
        if self.queue.backend == QueueBackend::Sqlite && self.queue.database.is_none() {
            return Err(AppError::validation("queue.database is required for the sqlite backend"));
        }
        if self.queue.backend == QueueBackend::Sqlite && self.queue.lease_secs == 0 {
            return Err(AppError::validation("queue.lease_secs must be > 0"));
        }
        if self.sink.kind == SinkKind::Http && self.sink.ingest_url.is_none() {
            return Err(AppError::validation("sink.ingest_url is required for http sink"));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            source: SourceConfig::default(),
            partitions: defaults::partitions(),
            http: HttpConfig::default(),
            queue: QueueConfig::default(),
            retry: RetryPolicy::default(),
            rate_limit: RateLimit::default(),
            worker: RunConfig::default(),
            verifier: RunConfig::default(),
            coordinator: CoordinatorConfig::default(),
            sink: SinkConfig::default(),
        }
    }
}

/// How search result pages are encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchFormat {
    Json,
    Html,
}

/// Source adapter settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Source name (e.g., "idealista")
    #[serde(default = "defaults::source_name")]
    pub name: String,

    /// Country code of the catalog
    #[serde(default = "defaults::country")]
    pub country: String,

    /// Catalog key override; defaults to `{name}-{country}`
    #[serde(default)]
    pub catalog: Option<String>,

    /// Search page template with `{city}`, `{operation}`, `{page}`, `{country}`
    #[serde(default = "defaults::search_url")]
    pub search_url: String,

    /// Detail API template with `{id}`, `{country}`
    #[serde(default = "defaults::detail_url")]
    pub detail_url: String,

    /// Equivalent public page forms tried by the verifier, each with `{id}`
    #[serde(default = "defaults::page_urls")]
    pub page_urls: Vec<String>,

    #[serde(default = "defaults::search_format")]
    pub search_format: SearchFormat,

    /// JSON pointer to the result array (json format)
    #[serde(default = "defaults::items_pointer")]
    pub items_pointer: String,

    /// Field holding the item id inside each result (json format)
    #[serde(default = "defaults::id_field")]
    pub id_field: String,

    /// JSON pointer to the advertised total (json format)
    #[serde(default = "defaults::total_pointer")]
    pub total_pointer: Option<String>,

    /// CSS selector for result links (html format)
    #[serde(default = "defaults::link_selector")]
    pub link_selector: String,

    /// Regex with one capture group extracting the id from a link
    #[serde(default = "defaults::id_pattern")]
    pub id_pattern: String,

    /// CSS selector present only on a "listing removed" page
    #[serde(default)]
    pub removed_selector: Option<String>,
}

impl SourceConfig {
    /// Catalog key used for sink upserts.
    pub fn catalog(&self) -> String {
        self.catalog
            .clone()
            .unwrap_or_else(|| format!("{}-{}", self.name, self.country))
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            name: defaults::source_name(),
            country: defaults::country(),
            catalog: None,
            search_url: defaults::search_url(),
            detail_url: defaults::detail_url(),
            page_urls: defaults::page_urls(),
            search_format: defaults::search_format(),
            items_pointer: defaults::items_pointer(),
            id_field: defaults::id_field(),
            total_pointer: defaults::total_pointer(),
            link_selector: defaults::link_selector(),
            id_pattern: defaults::id_pattern(),
            removed_selector: None,
        }
    }
}

/// HTTP client settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// User-Agent header for HTTP requests
    #[serde(default = "defaults::user_agent")]
    pub user_agent: String,

    /// Per-call timeout in seconds, applied to every outbound call
    #[serde(default = "defaults::timeout")]
    pub timeout_secs: u64,

    /// Extra headers sent with every request
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl HttpConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            user_agent: defaults::user_agent(),
            timeout_secs: defaults::timeout(),
            headers: BTreeMap::new(),
        }
    }
}

/// Work queue backend kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueBackend {
    /// One process, optional JSON state file
    Local,
    /// SQLite database shared by any number of processes
    Sqlite,
}

/// Work queue backend settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "defaults::queue_backend")]
    pub backend: QueueBackend,

    /// Durable state file (local backend); in-memory queue when absent
    #[serde(default)]
    pub state_file: Option<PathBuf>,

    /// Database file (sqlite backend)
    #[serde(default)]
    pub database: Option<PathBuf>,

    /// A claim not finished within this many seconds goes back to pending (sqlite backend)
    #[serde(default = "defaults::lease_secs")]
    pub lease_secs: u64,

    /// Processed ids fetched longer ago than this are re-admitted
    #[serde(default = "defaults::dedup_horizon_hours")]
    pub dedup_horizon_hours: u64,

    /// Verified-inactive ids are ignored by discovery for this long
    #[serde(default = "defaults::inactive_horizon_hours")]
    pub inactive_horizon_hours: u64,

    /// Bounded wait of a blocking pop
    #[serde(default = "defaults::pop_timeout_ms")]
    pub pop_timeout_ms: u64,
}

impl QueueConfig {
    pub fn dedup_horizon(&self) -> chrono::Duration {
        chrono::Duration::hours(self.dedup_horizon_hours as i64)
    }

    pub fn inactive_horizon(&self) -> chrono::Duration {
        chrono::Duration::hours(self.inactive_horizon_hours as i64)
    }

    pub fn pop_timeout(&self) -> Duration {
        Duration::from_millis(self.pop_timeout_ms)
    }

    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backend: defaults::queue_backend(),
            state_file: None,
            database: None,
            lease_secs: defaults::lease_secs(),
            dedup_horizon_hours: defaults::dedup_horizon_hours(),
            inactive_horizon_hours: defaults::inactive_horizon_hours(),
            pop_timeout_ms: defaults::pop_timeout_ms(),
        }
    }
}

/// Exponential backoff policy: `base * multiplier^(attempt-1)`, capped, jittered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempts before an item counts as permanently failed
    #[serde(default = "defaults::max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "defaults::base_delay")]
    pub base_delay_ms: u64,

    #[serde(default = "defaults::multiplier")]
    pub multiplier: f64,

    #[serde(default = "defaults::max_delay")]
    pub max_delay_ms: u64,

    /// Fraction of the delay added as random jitter
    #[serde(default = "defaults::jitter_ratio")]
    pub jitter_ratio: f64,

    /// Retries of a single discovery page before the partition is abandoned
    #[serde(default = "defaults::page_retries")]
    pub page_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: defaults::max_attempts(),
            base_delay_ms: defaults::base_delay(),
            multiplier: defaults::multiplier(),
            max_delay_ms: defaults::max_delay(),
            jitter_ratio: defaults::jitter_ratio(),
            page_retries: defaults::page_retries(),
        }
    }
}

/// Randomized delay applied after every processed item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimit {
    #[serde(default = "defaults::rate_limit_delay")]
    pub base_delay_ms: u64,

    /// Delay varies uniformly within `base ± base * jitter_ratio`
    #[serde(default = "defaults::rate_limit_jitter")]
    pub jitter_ratio: f64,
}

impl Default for RateLimit {
    fn default() -> Self {
        Self {
            base_delay_ms: defaults::rate_limit_delay(),
            jitter_ratio: defaults::rate_limit_jitter(),
        }
    }
}

/// Settings of a worker or verifier pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Loops run by one process
    #[serde(default = "defaults::concurrency")]
    pub concurrency: usize,

    /// Consecutive empty polls before a batch run exits
    #[serde(default = "defaults::max_idle_polls")]
    pub max_idle_polls: u32,

    /// Keep polling until shutdown instead of exiting when idle
    #[serde(default)]
    pub daemon: bool,

    /// Log a counters summary every N handled items (0 disables)
    #[serde(default = "defaults::stats_every")]
    pub stats_every: u64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            concurrency: defaults::concurrency(),
            max_idle_polls: defaults::max_idle_polls(),
            daemon: false,
            stats_every: defaults::stats_every(),
        }
    }
}

/// Discovery pass settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Items unseen for this long become missing candidates
    #[serde(default = "defaults::missing_threshold_hours")]
    pub missing_threshold_hours: u64,

    /// Upper page-count safety bound per partition
    #[serde(default = "defaults::max_pages")]
    pub max_pages: u32,

    #[serde(default = "defaults::max_concurrent_partitions")]
    pub max_concurrent_partitions: usize,

    /// Skip missing detection if the pass saw this much less than the last one
    #[serde(default = "defaults::max_drop_percent")]
    pub max_drop_percent: u8,

    /// Below this previous count the drop guard is not applied
    #[serde(default = "defaults::min_baseline")]
    pub min_baseline: usize,

    /// Consistent held-back passes (no failed partitions) after which the
    /// smaller count becomes the new baseline; 0 never accepts it
    #[serde(default = "defaults::confirm_passes")]
    pub confirm_passes: u32,
}

impl CoordinatorConfig {
    pub fn missing_threshold(&self) -> chrono::Duration {
        chrono::Duration::hours(self.missing_threshold_hours as i64)
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            missing_threshold_hours: defaults::missing_threshold_hours(),
            max_pages: defaults::max_pages(),
            max_concurrent_partitions: defaults::max_concurrent_partitions(),
            max_drop_percent: defaults::max_drop_percent(),
            min_baseline: defaults::min_baseline(),
            confirm_passes: defaults::confirm_passes(),
        }
    }
}

/// Sink backend kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    Http,
    Local,
}

/// Downstream sink settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkConfig {
    #[serde(default = "defaults::sink_kind")]
    pub kind: SinkKind,

    /// Ingest endpoint (http sink)
    #[serde(default)]
    pub ingest_url: Option<String>,

    /// Mark-inactive endpoint (http sink); defaults to `{ingest_url}/inactive`
    #[serde(default)]
    pub inactive_url: Option<String>,

    /// Bearer token for the ingestion API
    #[serde(default)]
    pub token: Option<String>,

    /// Output directory (local sink)
    #[serde(default = "defaults::output_dir")]
    pub output_dir: PathBuf,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            kind: defaults::sink_kind(),
            ingest_url: None,
            inactive_url: None,
            token: None,
            output_dir: defaults::output_dir(),
        }
    }
}

mod defaults {
    use std::path::PathBuf;

    use super::{Partition, QueueBackend, SearchFormat, SinkKind};

    // Source defaults
    pub fn source_name() -> String {
        "idealista".into()
    }
    pub fn country() -> String {
        "es".into()
    }
    pub fn search_url() -> String {
        "https://api.listings.example/{country}/search?locationId={city}&operation={operation}&numPage={page}&maxItems=50".into()
    }
    pub fn detail_url() -> String {
        "https://api.listings.example/{country}/detail/{id}".into()
    }
    pub fn page_urls() -> Vec<String> {
        vec![
            "https://www.listings.example/inmueble/{id}/".into(),
            "https://m.listings.example/inmueble/{id}/".into(),
        ]
    }
    pub fn search_format() -> SearchFormat {
        SearchFormat::Json
    }
    pub fn items_pointer() -> String {
        "/elementList".into()
    }
    pub fn id_field() -> String {
        "propertyCode".into()
    }
    pub fn total_pointer() -> Option<String> {
        Some("/total".into())
    }
    pub fn link_selector() -> String {
        "a[href]".into()
    }
    pub fn id_pattern() -> String {
        r"/(?:inmueble|listing|property)/(\d+)".into()
    }

    pub fn partitions() -> Vec<Partition> {
        vec![
            Partition::new("madrid", "sale"),
            Partition::new("madrid", "rent"),
        ]
    }

    // HTTP defaults
    pub fn user_agent() -> String {
        "Mozilla/5.0 (compatible; recrawl/0.1)".into()
    }
    pub fn timeout() -> u64 {
        30
    }

    // Queue defaults
    pub fn queue_backend() -> QueueBackend {
        QueueBackend::Local
    }
    pub fn lease_secs() -> u64 {
        600
    }
    pub fn dedup_horizon_hours() -> u64 {
        24
    }
    pub fn inactive_horizon_hours() -> u64 {
        24 * 30
    }
    pub fn pop_timeout_ms() -> u64 {
        2_000
    }

    // Retry defaults
    pub fn max_attempts() -> u32 {
        3
    }
    pub fn base_delay() -> u64 {
        1_000
    }
    pub fn multiplier() -> f64 {
        2.0
    }
    pub fn max_delay() -> u64 {
        60_000
    }
    pub fn jitter_ratio() -> f64 {
        0.25
    }
    pub fn page_retries() -> u32 {
        3
    }

    // Rate limit defaults
    pub fn rate_limit_delay() -> u64 {
        1_500
    }
    pub fn rate_limit_jitter() -> f64 {
        0.5
    }

    // Run defaults
    pub fn concurrency() -> usize {
        2
    }
    pub fn max_idle_polls() -> u32 {
        5
    }
    pub fn stats_every() -> u64 {
        100
    }

    // Coordinator defaults
    pub fn missing_threshold_hours() -> u64 {
        48
    }
    pub fn max_pages() -> u32 {
        500
    }
    pub fn max_concurrent_partitions() -> usize {
        2
    }
    pub fn max_drop_percent() -> u8 {
        20
    }
    pub fn min_baseline() -> usize {
        100
    }
    pub fn confirm_passes() -> u32 {
        3
    }

    // Sink defaults
    pub fn sink_kind() -> SinkKind {
        SinkKind::Local
    }
    pub fn output_dir() -> PathBuf {
        PathBuf::from("output")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_default_config_ok() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn validate_rejects_empty_user_agent() {
        let mut config = Config::default();
        config.http.user_agent = "  ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_concurrency() {
        let mut config = Config::default();
        config.worker.concurrency = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_detail_url_without_placeholder() {
        let mut config = Config::default();
        config.source.detail_url = "https://api.listings.example/detail".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_http_sink_without_endpoint() {
        let mut config = Config::default();
        config.sink.kind = SinkKind::Http;
        assert!(config.validate().is_err());
        config.sink.ingest_url = Some("https://ingest.example/listings".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_requires_database_for_sqlite() {
        let mut config = Config::default();
        config.queue.backend = QueueBackend::Sqlite;
        assert!(config.validate().is_err());
        config.queue.database = Some(PathBuf::from("queue.db"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [retry]
            max_attempts = 5

            [[partitions]]
            city = "valencia"
            operation = "rent"
            "#,
        )
        .unwrap();

        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.base_delay_ms, 1_000);
        assert_eq!(config.partitions, vec![Partition::new("valencia", "rent")]);
        assert_eq!(config.source.catalog(), "idealista-es");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn env_overrides_apply() {
        let mut config = Config::default();
        config.apply_overrides(|key| match key {
            "RECRAWL_MAX_ATTEMPTS" => Some("7".to_string()),
            "RECRAWL_CONCURRENCY" => Some("4".to_string()),
            "RECRAWL_STATE_FILE" => Some("/tmp/queue.json".to_string()),
            "RECRAWL_DATABASE" => Some("/var/lib/recrawl/queue.db".to_string()),
            _ => None,
        });

        assert_eq!(config.retry.max_attempts, 7);
        assert_eq!(config.worker.concurrency, 4);
        assert_eq!(config.verifier.concurrency, 4);
        assert_eq!(config.queue.state_file, Some(PathBuf::from("/tmp/queue.json")));
        assert_eq!(config.rate_limit.base_delay_ms, 1_500);
        assert_eq!(config.queue.backend, QueueBackend::Sqlite);
        assert_eq!(
            config.queue.database,
            Some(PathBuf::from("/var/lib/recrawl/queue.db"))
        );
    }
}
