//! Configuration parsing and validation.
//!
//! docmirror is configured with a single TOML file (default
//! `./config/docmirror.toml`). Documentation sites are declared as
//! `[[sources]]` entries: each one is data for the shared crawler, not a
//! new type.
//!
//! # Example
//!
//! ```toml
//! [db]
//! path = "./data/docmirror.sqlite"
//!
//! [crawl]
//! max_pages = 40
//!
//! [embedding]
//! provider = "ollama"
//! model = "nomic-embed-text"
//!
//! [notifications]
//! webhook_url = "https://hooks.example.com/services/T000/B000/XXXX"
//! min_severity = "medium"
//!
//! [tenants.acme]
//! allow_sources = ["stripe", "plaid"]
//! min_trust_score = 0.6
//!
//! [[sources]]
//! id = "stripe"
//! name = "Stripe Docs"
//! base_url = "https://docs.stripe.com"
//! seed_urls = ["https://docs.stripe.com/webhooks"]
//! allow_path_prefixes = ["/webhooks", "/payments"]
//! line_noise_patterns = ["^Was this page helpful\\?"]
//! trust_score = 0.95
//! ```
//!
//! Validation happens in [`load_config`]; invalid values fail fast with a
//! descriptive error instead of surfacing mid-crawl.

use anyhow::{bail, Context, Result};
use regex::Regex;
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use docmirror_core::decision::{SourcePolicy, DEFAULT_STALE_THRESHOLD_MINUTES};
use docmirror_core::models::{Severity, Source, SourceKind};
use docmirror_core::url_policy::UrlPolicy;

/// Top-level configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub crawl: CrawlConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub answer: AnswerConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub notifications: NotificationsConfig,
    #[serde(default)]
    pub tenants: BTreeMap<String, SourcePolicy>,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

/// Crawl defaults, overridable per source.
#[derive(Debug, Deserialize, Clone)]
pub struct CrawlConfig {
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_pages")]
    pub max_pages: usize,
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
    #[serde(default = "default_fetch_retries")]
    pub fetch_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_min_text_chars")]
    pub min_text_chars: usize,
    #[serde(default = "default_max_chunk_chars")]
    pub max_chunk_chars: usize,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            max_pages: default_max_pages(),
            max_depth: default_max_depth(),
            fetch_retries: default_fetch_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            min_text_chars: default_min_text_chars(),
            max_chunk_chars: default_max_chunk_chars(),
            user_agent: default_user_agent(),
        }
    }
}

fn default_timeout_ms() -> u64 {
    10_000
}
fn default_max_pages() -> usize {
    20
}
fn default_max_depth() -> usize {
    1
}
fn default_fetch_retries() -> u32 {
    2
}
fn default_retry_backoff_ms() -> u64 {
    500
}
fn default_min_text_chars() -> usize {
    120
}
fn default_max_chunk_chars() -> usize {
    docmirror_core::chunk::DEFAULT_MAX_CHUNK_CHARS
}
fn default_user_agent() -> String {
    format!("docmirror/{}", env!("CARGO_PKG_VERSION"))
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_candidate_limit")]
    pub candidate_limit: i64,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            candidate_limit: default_candidate_limit(),
            top_k: default_top_k(),
        }
    }
}

fn default_candidate_limit() -> i64 {
    docmirror_core::search::DEFAULT_CANDIDATE_LIMIT
}
fn default_top_k() -> usize {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct AnswerConfig {
    #[serde(default = "default_stale_threshold")]
    pub stale_threshold_minutes: i64,
}

impl Default for AnswerConfig {
    fn default() -> Self {
        Self {
            stale_threshold_minutes: default_stale_threshold(),
        }
    }
}

fn default_stale_threshold() -> i64 {
    DEFAULT_STALE_THRESHOLD_MINUTES
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_chars_per_input")]
    pub max_chars_per_input: usize,
    #[serde(default = "default_query_cache_size")]
    pub query_cache_size: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            base_url: None,
            timeout_secs: default_timeout_secs(),
            max_chars_per_input: default_max_chars_per_input(),
            query_cache_size: default_query_cache_size(),
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_timeout_secs() -> u64 {
    20
}
fn default_max_chars_per_input() -> usize {
    3500
}
fn default_query_cache_size() -> usize {
    docmirror_core::embedding::DEFAULT_QUERY_CACHE_SIZE
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkerConfig {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

fn default_concurrency() -> usize {
    3
}
fn default_max_attempts() -> u32 {
    3
}
fn default_backoff_base_ms() -> u64 {
    3000
}
fn default_poll_interval_ms() -> u64 {
    1000
}

#[derive(Debug, Deserialize, Clone)]
pub struct NotificationsConfig {
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default = "default_min_severity")]
    pub min_severity: Severity,
    #[serde(default)]
    pub include_updated: bool,
    #[serde(default = "default_max_events")]
    pub max_events: usize,
}

impl Default for NotificationsConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            min_severity: default_min_severity(),
            include_updated: false,
            max_events: default_max_events(),
        }
    }
}

fn default_min_severity() -> Severity {
    Severity::Medium
}
fn default_max_events() -> usize {
    8
}

/// One documentation site.
///
/// Crawl limits left unset fall back to `[crawl]`.
#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub kind: SourceKind,
    pub base_url: String,
    #[serde(default = "default_trust_score")]
    pub trust_score: f64,
    #[serde(default = "default_poll_interval_minutes")]
    pub poll_interval_minutes: i64,
    #[serde(default)]
    pub sitemap_url: Option<String>,
    #[serde(default)]
    pub seed_urls: Vec<String>,
    #[serde(default)]
    pub allow_path_prefixes: Vec<String>,
    #[serde(default)]
    pub deny_path_prefixes: Vec<String>,
    #[serde(default)]
    pub html_noise_patterns: Vec<String>,
    #[serde(default)]
    pub line_noise_patterns: Vec<String>,
    #[serde(default)]
    pub max_pages: Option<usize>,
    #[serde(default)]
    pub max_depth: Option<usize>,
    #[serde(default)]
    pub min_text_chars: Option<usize>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub version_tag: Option<String>,
}

fn default_trust_score() -> f64 {
    1.0
}
fn default_poll_interval_minutes() -> i64 {
    60
}

impl SourceConfig {
    /// The row upserted into the store on every sync.
    pub fn to_source(&self) -> Source {
        Source {
            id: self.id.clone(),
            name: self.name.clone().unwrap_or_else(|| self.id.clone()),
            kind: self.kind,
            base_url: self.base_url.clone(),
            trust_score: self.trust_score,
            poll_interval_minutes: self.poll_interval_minutes,
        }
    }

    pub fn url_policy(&self) -> UrlPolicy {
        UrlPolicy {
            allow_prefixes: self.allow_path_prefixes.clone(),
            deny_prefixes: self.deny_path_prefixes.clone(),
        }
    }
}

impl Config {
    pub fn source(&self, id: &str) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| s.id == id)
    }

    /// Tenant policy by id. Unknown tenants are an error.
    pub fn tenant_policy(&self, tenant: Option<&str>) -> Result<SourcePolicy> {
        match tenant {
            None => Ok(SourcePolicy::default()),
            Some(id) => self
                .tenants
                .get(id)
                .cloned()
                .with_context(|| format!("Unknown tenant: '{}'", id)),
        }
    }
}

/// Compile a list of noise patterns.
pub fn compile_patterns(patterns: &[String]) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|p| Regex::new(p).with_context(|| format!("Invalid noise pattern: '{}'", p)))
        .collect()
}

/// Read, parse, and validate a config file.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

/// Parse and validate config TOML.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;

    if config.crawl.max_chunk_chars == 0 {
        bail!("crawl.max_chunk_chars must be > 0");
    }
    if config.crawl.max_pages == 0 {
        bail!("crawl.max_pages must be > 0");
    }

    if config.retrieval.top_k == 0 {
        bail!("retrieval.top_k must be >= 1");
    }
    if config.retrieval.candidate_limit < 1 {
        bail!("retrieval.candidate_limit must be >= 1");
    }

    if config.worker.concurrency == 0 {
        bail!("worker.concurrency must be > 0");
    }
    if config.worker.max_attempts == 0 {
        bail!("worker.max_attempts must be > 0");
    }

    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" => {}
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, or ollama.",
            other
        ),
    }

    for (id, policy) in &config.tenants {
        if let Some(min) = policy.min_trust_score {
            if !(0.0..=1.0).contains(&min) {
                bail!("tenants.{}.min_trust_score must be in [0.0, 1.0]", id);
            }
        }
    }

    let mut ids = HashSet::new();
    for source in &config.sources {
        if source.id.trim().is_empty() {
            bail!("sources: id must not be empty");
        }
        if !ids.insert(source.id.as_str()) {
            bail!("Duplicate source id: '{}'", source.id);
        }
        if !(0.0..=1.0).contains(&source.trust_score) {
            bail!("sources.{}.trust_score must be in [0.0, 1.0]", source.id);
        }
        if source.poll_interval_minutes < 1 {
            bail!("sources.{}.poll_interval_minutes must be >= 1", source.id);
        }
        url::Url::parse(&source.base_url)
            .with_context(|| format!("sources.{}.base_url is not a valid URL", source.id))?;
        compile_patterns(&source.html_noise_patterns)
            .with_context(|| format!("sources.{}.html_noise_patterns", source.id))?;
        compile_patterns(&source.line_noise_patterns)
            .with_context(|| format!("sources.{}.line_noise_patterns", source.id))?;
    }

    Ok(config)
}
