//! Core data models shared by the ingestion and retrieval pipelines.
//!
//! The types in this module mirror the relational schema (sources,
//! documents, chunks, embeddings, change events, snapshots) and the
//! in-flight values produced by a crawl run before they are persisted.

use std::fmt;
use std::str::FromStr;

use anyhow::bail;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of documentation a source publishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    #[default]
    Docs,
    Repo,
    ApiRef,
    Changelog,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Docs => "docs",
            SourceKind::Repo => "repo",
            SourceKind::ApiRef => "api_ref",
            SourceKind::Changelog => "changelog",
        }
    }
}

impl FromStr for SourceKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        Ok(match s {
            "docs" => SourceKind::Docs,
            "repo" => SourceKind::Repo,
            "api_ref" => SourceKind::ApiRef,
            "changelog" => SourceKind::Changelog,
            other => bail!("unknown source kind: '{}'", other),
        })
    }
}

/// A documentation site being mirrored. Upserted on every sync run.
#[derive(Debug, Clone, Serialize)]
pub struct Source {
    pub id: String,
    pub name: String,
    pub kind: SourceKind,
    pub base_url: String,
    pub trust_score: f64,
    pub poll_interval_minutes: i64,
}

/// HTTP validators and status recorded for the last fetch of a page.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FetchMetadata {
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub status: Option<u16>,
    pub checked_at: Option<DateTime<Utc>>,
}

/// Conditional request headers derived from stored [`FetchMetadata`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchConditions {
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

impl FetchConditions {
    pub fn is_empty(&self) -> bool {
        self.etag.is_none() && self.last_modified.is_none()
    }
}

/// A chunk as produced by the chunker, before it is assigned an id.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestedChunk {
    pub text: String,
    pub heading_path: Option<String>,
    pub code_lang: Option<String>,
}

/// A page that passed extraction, sanitization, and chunking.
#[derive(Debug, Clone)]
pub struct IngestedDocument {
    pub canonical_url: String,
    pub title: String,
    pub language: String,
    pub version_tag: Option<String>,
    pub content: String,
    pub chunks: Vec<IngestedChunk>,
    pub fetch: Option<FetchMetadata>,
}

/// A page the server answered with `304 Not Modified`.
#[derive(Debug, Clone)]
pub struct NotModifiedDocument {
    pub canonical_url: String,
    pub fetch: FetchMetadata,
}

/// Outcome of one ingestion run for one source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Partial,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::Partial => "partial",
            RunStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        Ok(match s {
            "success" => RunStatus::Success,
            "partial" => RunStatus::Partial,
            "failed" => RunStatus::Failed,
            other => bail!("unknown run status: '{}'", other),
        })
    }
}

/// Result of crawling one source, consumed by [`crate::persist`].
#[derive(Debug, Clone)]
pub struct IngestRunResult {
    pub source: String,
    pub status: RunStatus,
    pub documents: Vec<IngestedDocument>,
    pub not_modified_documents: Vec<NotModifiedDocument>,
    pub fetched_urls: Vec<String>,
    pub failed_urls: Vec<String>,
    pub errors: Vec<String>,
}

impl IngestRunResult {
    pub fn new(source: &str) -> Self {
        Self {
            source: source.to_string(),
            status: RunStatus::Success,
            documents: Vec::new(),
            not_modified_documents: Vec::new(),
            fetched_urls: Vec::new(),
            failed_urls: Vec::new(),
            errors: Vec::new(),
        }
    }

    /// Record a non-fatal problem; the run can no longer be a full success.
    pub fn push_error(&mut self, message: String) {
        self.errors.push(message);
        if self.status == RunStatus::Success {
            self.status = RunStatus::Partial;
        }
    }

    /// Settle the final status once the crawl loop has finished.
    ///
    /// Zero documents with errors is a failure; zero documents without
    /// errors is partial (nothing usable was found).
    pub fn finish(&mut self) {
        if self.documents.is_empty() {
            self.status = if self.errors.is_empty() {
                RunStatus::Partial
            } else {
                RunStatus::Failed
            };
        } else if !self.errors.is_empty() {
            self.status = RunStatus::Partial;
        }
    }
}

/// A stored documentation page, unique on `(source_id, canonical_url, version_tag)`.
#[derive(Debug, Clone)]
pub struct Document {
    pub id: String,
    pub source_id: String,
    pub canonical_url: String,
    pub version_tag: Option<String>,
    pub title: String,
    pub language: String,
    pub content_hash: String,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub last_changed_at: DateTime<Utc>,
    pub fetch: FetchMetadata,
}

/// A stored chunk. `chunk_index` is dense and 0-based within its document.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub chunk_index: i64,
    pub text: String,
    pub token_count: i64,
    pub heading_path: Option<String>,
    pub code_lang: Option<String>,
    pub valid_from: DateTime<Utc>,
    pub valid_to: Option<DateTime<Utc>>,
}

/// Unit-length embedding for a single chunk.
#[derive(Debug, Clone)]
pub struct ChunkEmbedding {
    pub chunk_id: String,
    pub model: String,
    pub vector: Vec<f32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    DocumentAdded,
    Updated,
    Deprecation,
    BreakingChange,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::DocumentAdded => "document_added",
            EventType::Updated => "updated",
            EventType::Deprecation => "deprecation",
            EventType::BreakingChange => "breaking_change",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        Ok(match s {
            "document_added" => EventType::DocumentAdded,
            "updated" => EventType::Updated,
            "deprecation" => EventType::Deprecation,
            "breaking_change" => EventType::BreakingChange,
            other => bail!("unknown event type: '{}'", other),
        })
    }
}

/// Severity of a change event. Ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "low" => Severity::Low,
            "medium" => Severity::Medium,
            "high" => Severity::High,
            "critical" => Severity::Critical,
            other => bail!("unknown severity: '{}'", other),
        })
    }
}

/// Append-only record that a document was added or changed.
///
/// `document_id` is a back-reference for lookup only; events outlive
/// any particular version of the document's content.
#[derive(Debug, Clone, Serialize)]
pub struct ChangeEvent {
    pub id: String,
    pub source_id: String,
    pub document_id: String,
    pub canonical_url: String,
    pub title: String,
    pub event_type: EventType,
    pub severity: Severity,
    pub summary: String,
    pub details: serde_json::Value,
    pub detected_at: DateTime<Utc>,
}

/// Audit row written once per ingestion run.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub id: String,
    pub source_id: String,
    pub fetched_at: DateTime<Utc>,
    pub status: RunStatus,
    pub error: Option<String>,
    pub raw_ref: String,
    pub parser_version: String,
}
