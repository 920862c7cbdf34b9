//! Breadth-first crawl of one documentation source.
//!
//! A crawl resolves seeds (explicit seed URLs, else the base URL), merges
//! in sitemap entries when a sitemap is configured, then walks a FIFO
//! queue of `(url, depth)` pairs one fetch at a time until the queue is
//! empty or `max_pages` documents were produced.
//!
//! Each page goes through extraction, line sanitization, and chunking. A
//! page becomes a document only if its sanitized text has at least
//! `min_text_chars` characters and yields at least one chunk. Per-URL
//! failures and sanitizer findings are recorded on the run and downgrade
//! its status; they never abort the crawl.

use std::collections::{HashMap, HashSet, VecDeque};

use anyhow::Result;
use regex::Regex;

use docmirror_core::chunk::chunk_structured_text;
use docmirror_core::extract::{
    extract_links, extract_main_html, extract_sitemap_urls, extract_title, html_to_text,
    strip_html_noise, strip_noise_lines,
};
use docmirror_core::models::{
    FetchConditions, IngestRunResult, IngestedDocument, NotModifiedDocument,
};
use docmirror_core::sanitize::sanitize_lines;
use docmirror_core::url_policy::{canonicalize, is_allowed, UrlPolicy};

use crate::config::{compile_patterns, CrawlConfig, SourceConfig};
use crate::fetch::{FetchOutcome, PageFetcher};

/// Version tag attached to documents of sources that do not set one.
pub const DEFAULT_VERSION_TAG: &str = "latest";

/// Everything the crawler needs to know about one source, with per-source
/// overrides already resolved against the `[crawl]` defaults.
#[derive(Debug, Clone)]
pub struct CrawlPlan {
    pub source_id: String,
    pub base_url: String,
    pub seed_urls: Vec<String>,
    pub sitemap_url: Option<String>,
    pub policy: UrlPolicy,
    pub html_noise: Vec<Regex>,
    pub line_noise: Vec<Regex>,
    pub max_pages: usize,
    pub max_depth: usize,
    pub min_text_chars: usize,
    pub max_chunk_chars: usize,
    pub language: String,
    pub version_tag: String,
}

impl CrawlPlan {
    pub fn new(source: &SourceConfig, crawl: &CrawlConfig) -> Result<Self> {
        Ok(Self {
            source_id: source.id.clone(),
            base_url: source.base_url.clone(),
            seed_urls: source.seed_urls.clone(),
            sitemap_url: source.sitemap_url.clone(),
            policy: source.url_policy(),
            html_noise: compile_patterns(&source.html_noise_patterns)?,
            line_noise: compile_patterns(&source.line_noise_patterns)?,
            max_pages: source.max_pages.unwrap_or(crawl.max_pages),
            max_depth: source.max_depth.unwrap_or(crawl.max_depth),
            min_text_chars: source.min_text_chars.unwrap_or(crawl.min_text_chars),
            max_chunk_chars: crawl.max_chunk_chars,
            language: source.language.clone().unwrap_or_else(|| "en".to_string()),
            version_tag: source
                .version_tag
                .clone()
                .unwrap_or_else(|| DEFAULT_VERSION_TAG.to_string()),
        })
    }

    /// Canonical, deduplicated seed URLs.
    fn seeds(&self, run: &mut IngestRunResult) -> Vec<String> {
        let raw: Vec<&String> = if self.seed_urls.is_empty() {
            vec![&self.base_url]
        } else {
            self.seed_urls.iter().collect()
        };

        let mut seen = HashSet::new();
        let mut seeds = Vec::new();
        for url in raw {
            match canonicalize(url) {
                Ok(canonical) => {
                    if seen.insert(canonical.clone()) {
                        seeds.push(canonical);
                    }
                }
                Err(e) => run.push_error(format!("{}: {}", url, e)),
            }
        }
        seeds
    }
}

/// Crawl one source and return the run result for persistence.
///
/// `conditions` holds stored validators keyed by canonical URL; pages
/// with validators are fetched conditionally.
pub async fn crawl_source(
    fetcher: &dyn PageFetcher,
    plan: &CrawlPlan,
    conditions: &HashMap<String, FetchConditions>,
) -> IngestRunResult {
    let mut run = IngestRunResult::new(&plan.source_id);
    let mut urls = plan.seeds(&mut run);

    if let Some(sitemap_url) = &plan.sitemap_url {
        match fetcher.fetch(sitemap_url, None).await {
            Ok(FetchOutcome::Fetched(page)) => {
                for url in extract_sitemap_urls(&page.body, &plan.base_url, &plan.policy) {
                    if !urls.contains(&url) {
                        urls.push(url);
                    }
                }
            }
            Ok(FetchOutcome::NotModified(_)) => {}
            Err(e) => {
                tracing::warn!(source = %plan.source_id, error = %e, "sitemap fetch failed");
                run.push_error(format!("sitemap: {}", e));
            }
        }
    }

    let mut queue: VecDeque<(String, usize)> = urls
        .into_iter()
        .filter(|url| is_allowed(url, &plan.base_url, &plan.policy))
        .map(|url| (url, 0))
        .collect();
    let mut seen: HashSet<String> = HashSet::new();

    while run.documents.len() < plan.max_pages {
        let Some((next_url, depth)) = queue.pop_front() else {
            break;
        };
        let url = match canonicalize(&next_url) {
            Ok(url) => url,
            Err(e) => {
                run.push_error(format!("{}: {}", next_url, e));
                continue;
            }
        };
        if !seen.insert(url.clone()) {
            continue;
        }

        let page = match fetcher.fetch(&url, conditions.get(&url)).await {
            Ok(FetchOutcome::Fetched(page)) => page,
            Ok(FetchOutcome::NotModified(fetch)) => {
                tracing::debug!(url = %url, "not modified");
                run.not_modified_documents.push(NotModifiedDocument {
                    canonical_url: url.clone(),
                    fetch,
                });
                run.fetched_urls.push(url);
                continue;
            }
            Err(e) => {
                tracing::warn!(url = %url, error = %e, "fetch failed");
                run.failed_urls.push(url.clone());
                run.push_error(format!("{}: {}", url, e));
                continue;
            }
        };

        let title = extract_title(&page.body, &url);
        let main_html = extract_main_html(&page.body);
        let text = strip_noise_lines(
            &html_to_text(&strip_html_noise(main_html, &plan.html_noise)),
            &plan.line_noise,
        );
        let sanitized = sanitize_lines(&text);

        if sanitized.removed_lines > 0 {
            let ids: Vec<&str> = sanitized.findings.iter().map(String::as_str).collect();
            tracing::warn!(
                url = %url,
                removed = sanitized.removed_lines,
                findings = %ids.join(", "),
                "sanitized suspicious lines"
            );
            run.push_error(format!(
                "{}: sanitized {} suspicious line(s) [{}]",
                url,
                sanitized.removed_lines,
                ids.join(", ")
            ));
        }

        if sanitized.text.chars().count() >= plan.min_text_chars {
            let chunks = chunk_structured_text(&sanitized.text, plan.max_chunk_chars);
            if !chunks.is_empty() {
                run.fetched_urls.push(url.clone());
                run.documents.push(IngestedDocument {
                    canonical_url: url.clone(),
                    title,
                    language: plan.language.clone(),
                    version_tag: Some(plan.version_tag.clone()),
                    content: sanitized.text,
                    chunks,
                    fetch: Some(page.metadata),
                });
            }
        }

        if depth < plan.max_depth {
            for link in extract_links(main_html, &url) {
                if is_allowed(&link, &plan.base_url, &plan.policy) && !seen.contains(&link) {
                    queue.push_back((link, depth + 1));
                }
            }
        }
    }

    run.finish();
    run
}
