use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration structure for c2c-scraper
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub crawler: CrawlerConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    #[serde(rename = "user-agent")]
    pub user_agent: UserAgentConfig,
    pub output: OutputConfig,
    #[serde(rename = "source", default)]
    pub sources: Vec<SourceConfig>,
}

impl Config {
    /// Total number of seed URLs across all sources
    pub fn seed_count(&self) -> usize {
        self.sources.iter().map(|s| s.seeds.len()).sum()
    }
}

/// Crawler behavior configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CrawlerConfig {
    /// Maximum discovery depth; continuation targets beyond it are never produced
    #[serde(rename = "max-depth")]
    pub max_depth: u32,

    /// Number of concurrent fetch-process cycles
    pub workers: u32,

    /// Minimum time between requests to the same host (milliseconds)
    #[serde(rename = "min-request-interval")]
    pub min_request_interval: u64,

    /// Attempts per target before a retryable failure becomes fatal
    #[serde(rename = "max-attempts", default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Per-request timeout (seconds)
    #[serde(rename = "request-timeout", default = "default_request_timeout")]
    pub request_timeout: u64,

    /// First retry delay when the server gives no hint (milliseconds)
    #[serde(rename = "backoff-base", default = "default_backoff_base")]
    pub backoff_base: u64,

    /// Upper bound for any retry delay (milliseconds)
    #[serde(rename = "backoff-max", default = "default_backoff_max")]
    pub backoff_max: u64,

    /// How long in-flight cycles may run after a shutdown signal (seconds)
    #[serde(rename = "shutdown-grace", default = "default_shutdown_grace")]
    pub shutdown_grace: u64,

    /// Whether robots.txt is fetched and honored
    #[serde(rename = "respect-robots", default = "default_true")]
    pub respect_robots: bool,

    /// Days before the latest stored outing that `--update` crawls again
    #[serde(rename = "update-margin-days", default = "default_update_margin_days")]
    pub update_margin_days: u32,
}

impl CrawlerConfig {
    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_request_interval)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }

    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace)
    }
}

/// When periodic checkpoints are taken
#[derive(Debug, Clone, Deserialize)]
pub struct CheckpointConfig {
    /// Seconds between checkpoints
    #[serde(rename = "interval-secs", default = "default_checkpoint_secs")]
    pub interval_secs: u64,

    /// Completed cycles between checkpoints
    #[serde(rename = "interval-cycles", default = "default_checkpoint_cycles")]
    pub interval_cycles: u64,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_checkpoint_secs(),
            interval_cycles: default_checkpoint_cycles(),
        }
    }
}

/// User agent identification configuration
#[derive(Debug, Clone, Deserialize)]
pub struct UserAgentConfig {
    /// Name of the crawler
    #[serde(rename = "crawler-name")]
    pub crawler_name: String,

    /// Version of the crawler
    #[serde(rename = "crawler-version")]
    pub crawler_version: String,

    /// URL with information about the crawler
    #[serde(rename = "contact-url")]
    pub contact_url: String,

    /// Email address for crawler-related contact
    #[serde(rename = "contact-email")]
    pub contact_email: String,
}

impl UserAgentConfig {
    /// Formats the header value: `Name/Version (+ContactURL; ContactEmail)`
    pub fn header_value(&self) -> String {
        format!(
            "{}/{} (+{}; {})",
            self.crawler_name, self.crawler_version, self.contact_url, self.contact_email
        )
    }
}

/// Output configuration
#[derive(Debug, Clone, Deserialize)]
pub struct OutputConfig {
    /// Directory holding the record store and the checkpoint file
    #[serde(rename = "data-dir")]
    pub data_dir: PathBuf,
}

/// Page format produced by a source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceFormat {
    /// camptocamp.org document API (JSON, offset/limit pagination)
    C2cApi,
    /// HTML listing pages with CSS selectors
    Html,
}

/// One configured listing source
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    /// Unique name, stored with every record
    pub name: String,

    pub format: SourceFormat,

    /// URLs the crawl starts from
    pub seeds: Vec<String>,

    /// Documents requested per API page
    #[serde(rename = "page-size", default = "default_page_size")]
    pub page_size: u32,

    /// Queue detail fetches for routes associated with outings
    #[serde(rename = "follow-associations", default)]
    pub follow_associations: bool,

    /// Host patterns continuation links may point to (defaults to the seed hosts)
    #[serde(rename = "allowed-hosts", default)]
    pub allowed_hosts: Vec<String>,

    /// Locale preferred when picking a document title
    #[serde(rename = "preferred-lang", default = "default_lang")]
    pub preferred_lang: String,

    /// Selectors for `format = "html"`
    #[serde(default)]
    pub html: Option<HtmlSelectors>,
}

/// CSS selectors describing an HTML listing page
#[derive(Debug, Clone, Deserialize)]
pub struct HtmlSelectors {
    /// Matches one element per listing
    pub listing: String,

    /// Attribute of the listing element holding its id
    #[serde(rename = "id-attribute")]
    pub id_attribute: String,

    /// Matches the `<a>` of the next page, if any
    #[serde(default)]
    pub next: Option<String>,

    /// Field name -> selector relative to the listing element
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_request_timeout() -> u64 {
    30
}

fn default_backoff_base() -> u64 {
    1000
}

fn default_backoff_max() -> u64 {
    60_000
}

fn default_shutdown_grace() -> u64 {
    30
}

fn default_update_margin_days() -> u32 {
    7
}

fn default_true() -> bool {
    true
}

fn default_checkpoint_secs() -> u64 {
    60
}

fn default_checkpoint_cycles() -> u64 {
    25
}

fn default_page_size() -> u32 {
    100
}

fn default_lang() -> String {
    "fr".to_string()
}
