//! Multi-signal hybrid reranking.
//!
//! Candidates arrive from the store with lexical scores (`ilike_score`,
//! `fts_score`) and an optional cosine `semantic_score`. Reranking adds
//! query-intent coverage, bigram phrase coverage, a schema-noise quality
//! signal, a section-type signal for action-oriented queries, and recency,
//! then combines everything with fixed weights.
//!
//! # Weights
//!
//! | Signal | Weight |
//! |--------|--------|
//! | `ilike_score` | 0.20 |
//! | normalized `fts_score` | 0.22 |
//! | normalized semantic (shifted to `[0, 1]`) | 0.26 |
//! | intent term coverage | 0.12 |
//! | phrase coverage | 0.09 |
//! | section type | 0.08 |
//! | quality | 0.02 |
//! | recency | 0.01 |
//!
//! Lexical and semantic signals alone over-rank API-reference schema
//! tables for "how do I set up X" queries; the quality and section-type
//! signals push guides back up.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

const WEIGHT_ILIKE: f64 = 0.20;
const WEIGHT_FTS: f64 = 0.22;
const WEIGHT_SEMANTIC: f64 = 0.26;
const WEIGHT_INTENT: f64 = 0.12;
const WEIGHT_PHRASE: f64 = 0.09;
const WEIGHT_SECTION_TYPE: f64 = 0.08;
const WEIGHT_QUALITY: f64 = 0.02;
const WEIGHT_RECENCY: f64 = 0.01;

const QUERY_EXPANSIONS: &[(&str, &[&str])] = &[
    ("auth", &["authentication", "oauth", "token", "bearer"]),
    ("oauth", &["token", "authorization"]),
    ("payments", &["payment", "payout", "charge", "invoice"]),
    ("webhook", &["event", "callback", "signature"]),
    ("reasoning", &["reasoning models", "deliberate", "chain"]),
    ("migration", &["upgrade", "deprecation", "breaking change"]),
    ("retry", &["backoff", "idempotency", "timeout"]),
    (
        "plaid",
        &["link", "link token", "products", "payment initiation", "open banking"],
    ),
    (
        "stripe",
        &["payment intents", "webhooks", "endpoint secret", "checkout"],
    ),
    (
        "payment",
        &["initiation", "intent", "mandate", "consent", "sepa", "pis", "open banking"],
    ),
    ("open", &["open banking", "open-banking"]),
    ("banking", &["open banking", "open-banking"]),
    ("europe", &["eu", "uk", "sepa"]),
];

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "do", "for", "from", "how", "in", "is", "it",
    "of", "on", "or", "that", "the", "this", "to", "what", "when", "where", "which", "with",
];

const ACTION_TERMS: &[&str] = &[
    "enable",
    "setup",
    "configure",
    "integrate",
    "create",
    "start",
    "initiation",
];

static SCHEMA_LINE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*[a-z0-9_]+\s+(nullable\s+)?(string|integer|number|boolean|array|object)\b")
        .unwrap()
});
static TYPE_TOKEN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(nullable|string|integer|number|boolean|array|object)\b").unwrap()
});
static GUIDE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(quickstart|get started|get-started|how to|setup|configure|integration|guide)\b")
        .unwrap()
});
static REFERENCE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(dashboard|activity|logs?|errors?|status|reference|schema)\b").unwrap()
});
static PLAID_GUIDE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"plaid\.com/.+\b(payment-initiation|open-banking)\b").unwrap());
static STRIPE_GUIDE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"stripe\.com/.+\b(webhooks|payment-intents|checkout)\b").unwrap());

/// A chunk retrieved by the store, with its lexical scores.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub chunk_id: String,
    pub text: String,
    pub heading_path: Option<String>,
    pub code_lang: Option<String>,
    pub title: String,
    pub url: String,
    pub source: String,
    pub version_tag: Option<String>,
    pub last_changed_at: DateTime<Utc>,
    pub ilike_score: f64,
    pub fts_score: f64,
    /// Cosine similarity in `[-1, 1]`, when embeddings are available.
    pub semantic_score: Option<f64>,
}

/// A scored search result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedResult {
    pub chunk_id: String,
    pub score: f64,
    pub text: String,
    pub heading_path: Option<String>,
    pub code_lang: Option<String>,
    pub title: String,
    pub url: String,
    pub source: String,
    pub version_tag: Option<String>,
    pub last_changed_at: DateTime<Utc>,
}

/// Lowercase, split on non-alphanumerics, drop stopwords and 1-char tokens.
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|t| t.len() >= 2 && !STOPWORDS.contains(t))
        .map(str::to_string)
        .collect()
}

/// Query tokens plus their dictionary expansions.
pub fn intent_terms(query: &str) -> BTreeSet<String> {
    let mut terms = BTreeSet::new();
    for token in tokenize(query) {
        if let Some((_, expanded)) = QUERY_EXPANSIONS.iter().find(|(k, _)| *k == token) {
            terms.extend(expanded.iter().map(|t| t.to_lowercase()));
        }
        terms.insert(token);
    }
    terms
}

/// Distinct adjacent-token bigrams of the query, in order.
pub fn intent_phrases(query: &str) -> Vec<String> {
    let tokens = tokenize(query);
    let mut phrases: Vec<String> = Vec::new();
    for pair in tokens.windows(2) {
        let phrase = format!("{} {}", pair[0], pair[1]);
        if !phrases.contains(&phrase) {
            phrases.push(phrase);
        }
    }
    phrases
}

fn haystack(item: &Candidate) -> String {
    format!("{} {} {}", item.title, item.text, item.url).to_lowercase()
}

fn coverage<'a>(haystack: &str, needles: impl ExactSizeIterator<Item = &'a String>) -> f64 {
    let total = needles.len();
    if total == 0 {
        return 0.0;
    }
    let hits = needles.filter(|n| haystack.contains(n.as_str())).count();
    hits as f64 / total as f64
}

/// Penalty in `[0, 1]` for text that reads like a field/type table.
pub fn schema_noise_penalty(text: &str) -> f64 {
    let schema_lines = text
        .lines()
        .filter(|line| SCHEMA_LINE_RE.is_match(line.trim()))
        .count();
    let type_tokens = TYPE_TOKEN_RE.find_iter(text).count();

    let line_penalty = (schema_lines as f64 / 6.0).min(1.0);
    let token_penalty = (type_tokens as f64 / 45.0).min(1.0);
    line_penalty * 0.7 + token_penalty * 0.3
}

fn quality_score(item: &Candidate) -> f64 {
    let text = format!("{}\n{}", item.title, item.text);
    (1.0 - schema_noise_penalty(&text)).max(0.0)
}

/// Neutral 0.5 unless the query asks to *do* something; then guides are
/// boosted and dashboards/reference pages penalized.
pub fn section_type_score(item: &Candidate, query_tokens: &[String]) -> f64 {
    let action_intent = query_tokens
        .iter()
        .any(|t| ACTION_TERMS.contains(&t.as_str()));
    if !action_intent {
        return 0.5;
    }

    let context = format!(
        "{} {} {}",
        item.heading_path.as_deref().unwrap_or(""),
        item.title,
        item.url
    )
    .to_lowercase();
    let url = item.url.to_lowercase();
    let mut score: f64 = 0.5;

    if GUIDE_RE.is_match(&context) {
        score += 0.35;
    }
    if REFERENCE_RE.is_match(&context) {
        score -= 0.3;
    }
    if PLAID_GUIDE_RE.is_match(&url) {
        score += 0.15;
    }
    if STRIPE_GUIDE_RE.is_match(&url) {
        score += 0.1;
    }

    score.clamp(0.0, 1.0)
}

/// `1 / (1 + age_minutes / 1440)`.
pub fn recency_score(last_changed_at: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    let age_minutes = ((now - last_changed_at).num_seconds() as f64 / 60.0).max(0.0);
    1.0 / (1.0 + age_minutes / 1440.0)
}

fn normalize_by_max(values: &[f64]) -> Vec<f64> {
    let max = values.iter().copied().fold(0.0_f64, f64::max);
    if max <= 0.0 {
        return vec![0.0; values.len()];
    }
    values.iter().map(|v| v / max).collect()
}

/// Score, sort descending, and keep the best `top_k` candidates.
pub fn rerank(
    query: &str,
    candidates: Vec<Candidate>,
    top_k: usize,
    now: DateTime<Utc>,
) -> Vec<RankedResult> {
    if candidates.is_empty() {
        return Vec::new();
    }

    let terms = intent_terms(query);
    let phrases = intent_phrases(query);
    let query_tokens = tokenize(query);

    let fts: Vec<f64> = candidates.iter().map(|c| c.fts_score).collect();
    let semantic: Vec<f64> = candidates
        .iter()
        .map(|c| ((c.semantic_score.unwrap_or(0.0) + 1.0) / 2.0).clamp(0.0, 1.0))
        .collect();
    let fts = normalize_by_max(&fts);
    let semantic = normalize_by_max(&semantic);

    let mut scored: Vec<RankedResult> = candidates
        .into_iter()
        .enumerate()
        .map(|(idx, item)| {
            let hay = haystack(&item);
            let combined = item.ilike_score * WEIGHT_ILIKE
                + fts[idx] * WEIGHT_FTS
                + semantic[idx] * WEIGHT_SEMANTIC
                + coverage(&hay, terms.iter()) * WEIGHT_INTENT
                + coverage(&hay, phrases.iter()) * WEIGHT_PHRASE
                + section_type_score(&item, &query_tokens) * WEIGHT_SECTION_TYPE
                + quality_score(&item) * WEIGHT_QUALITY
                + recency_score(item.last_changed_at, now) * WEIGHT_RECENCY;

            RankedResult {
                chunk_id: item.chunk_id,
                score: combined,
                text: item.text,
                heading_path: item.heading_path,
                code_lang: item.code_lang,
                title: item.title,
                url: item.url,
                source: item.source,
                version_tag: item.version_tag,
                last_changed_at: item.last_changed_at,
            }
        })
        .collect();

    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    scored.truncate(top_k);
    scored
}
