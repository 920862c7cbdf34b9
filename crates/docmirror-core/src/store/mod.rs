//! Storage abstraction for docmirror.
//!
//! The [`Store`] trait is the relational-store contract the ingestion and
//! retrieval pipelines depend on: per-document lookup by
//! `(source_id, canonical_url, version_tag)`, atomic chunk replacement,
//! append-only change events, candidate retrieval with lexical scores, and
//! snapshot bookkeeping.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{
    Chunk, ChangeEvent, ChunkEmbedding, Document, EventType, FetchConditions, FetchMetadata,
    Severity, Snapshot, Source,
};
use crate::rerank::Candidate;

/// The fields of an existing document that persistence decisions need.
#[derive(Debug, Clone, PartialEq)]
pub struct ExistingDocument {
    pub id: String,
    pub content_hash: String,
    pub title: String,
}

/// Refresh of an existing document row after a successful fetch.
///
/// `changed_hash` is set only when the content hash differs; it advances
/// both `content_hash` and `last_changed_at`. `None` fetch fields keep the
/// stored value.
#[derive(Debug, Clone)]
pub struct DocumentUpdate {
    pub id: String,
    pub title: String,
    pub language: String,
    pub seen_at: DateTime<Utc>,
    pub changed_hash: Option<String>,
    pub fetch: FetchMetadata,
}

/// How [`Store::write_document`] changes the document row.
#[derive(Debug, Clone)]
pub enum DocumentRow {
    /// A document seen for the first time.
    Insert(Document),
    /// An existing document whose content hash changed.
    Update(DocumentUpdate),
}

/// New state of one document: its row, the replacement chunks and
/// embeddings, and the change events the new content produced.
///
/// Applied all-or-nothing, so a stored content hash always describes the
/// stored chunks and a failed write can be retried from scratch.
#[derive(Debug, Clone)]
pub struct DocumentWrite {
    pub row: DocumentRow,
    pub chunks: Vec<Chunk>,
    pub embeddings: Vec<ChunkEmbedding>,
    pub events: Vec<ChangeEvent>,
}

impl DocumentWrite {
    pub fn document_id(&self) -> &str {
        match &self.row {
            DocumentRow::Insert(doc) => &doc.id,
            DocumentRow::Update(update) => &update.id,
        }
    }
}

/// Filters applied before candidates are scored.
#[derive(Debug, Clone, Default)]
pub struct SearchFilters {
    /// Source ids; empty means every source.
    pub sources: Vec<String>,
    /// Version tag; documents without one match `"latest"`.
    pub version: Option<String>,
    pub updated_after: Option<DateTime<Utc>>,
    pub language: Option<String>,
}

/// Query for the append-only change feed.
#[derive(Debug, Clone)]
pub struct ChangeFilter {
    pub source: Option<String>,
    pub event_type: Option<EventType>,
    pub severity: Option<Severity>,
    pub limit: i64,
}

impl Default for ChangeFilter {
    fn default() -> Self {
        Self {
            source: None,
            event_type: None,
            severity: None,
            limit: 20,
        }
    }
}

/// Abstract storage backend.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`upsert_source`](Store::upsert_source) | Insert or refresh a source row |
/// | [`find_document`](Store::find_document) | Lookup by identifying triple |
/// | [`insert_document`](Store::insert_document) | Create a new document |
/// | [`update_document`](Store::update_document) | Refresh seen/changed state |
/// | [`document_text`](Store::document_text) | Reconstruct text from chunks |
/// | [`replace_chunks`](Store::replace_chunks) | Atomic delete-then-insert of chunks |
/// | [`insert_change_events`](Store::insert_change_events) | Append change events |
/// | [`write_document`](Store::write_document) | Row, chunks, and events in one atomic step |
/// | [`touch_not_modified`](Store::touch_not_modified) | Record a `304` fetch |
/// | [`fetch_conditions`](Store::fetch_conditions) | Stored validators per URL |
/// | [`record_snapshot`](Store::record_snapshot) | Audit row for a run |
/// | [`search_candidates`](Store::search_candidates) | Lexical + vector candidates |
/// | [`list_changes`](Store::list_changes) | Newest-first change feed |
#[async_trait]
pub trait Store: Send + Sync {
    /// Insert a source, or refresh its mutable attributes.
    async fn upsert_source(&self, source: &Source) -> Result<()>;

    /// All known sources, ordered by id.
    async fn list_sources(&self) -> Result<Vec<Source>>;

    /// Find a document by `(source_id, canonical_url, version_tag)`.
    async fn find_document(
        &self,
        source_id: &str,
        canonical_url: &str,
        version_tag: Option<&str>,
    ) -> Result<Option<ExistingDocument>>;

    /// Insert a new document row.
    async fn insert_document(&self, doc: &Document) -> Result<()>;

    /// Apply a [`DocumentUpdate`].
    async fn update_document(&self, update: &DocumentUpdate) -> Result<()>;

    /// Current chunk texts of a document joined by blank lines, in
    /// `chunk_index` order.
    async fn document_text(&self, document_id: &str) -> Result<String>;

    /// Replace every chunk (and embedding) of a document in one atomic step.
    async fn replace_chunks(
        &self,
        document_id: &str,
        chunks: &[Chunk],
        embeddings: &[ChunkEmbedding],
    ) -> Result<()>;

    /// Append change events. Events are never updated or deleted.
    async fn insert_change_events(&self, events: &[ChangeEvent]) -> Result<()>;

    /// Apply a [`DocumentWrite`] atomically. On error nothing is changed.
    async fn write_document(&self, write: &DocumentWrite) -> Result<()>;

    /// Advance `last_seen_at` and fetch metadata for every version of a
    /// URL that answered `304 Not Modified`.
    async fn touch_not_modified(
        &self,
        source_id: &str,
        canonical_url: &str,
        fetch: &FetchMetadata,
        seen_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Stored validators for every document of a source, keyed by URL.
    async fn fetch_conditions(&self, source_id: &str) -> Result<HashMap<String, FetchConditions>>;

    async fn record_snapshot(&self, snapshot: &Snapshot) -> Result<()>;

    /// Most recent snapshot of a source, if any run was recorded.
    async fn last_snapshot(&self, source_id: &str) -> Result<Option<Snapshot>>;

    /// Retrieve scoring candidates for a query.
    ///
    /// Every candidate carries `ilike_score` (0.8 for a text substring
    /// match plus 0.2 for a title match) and `fts_score` (full-text
    /// strength, larger is better). When `query_vec` is given, candidates
    /// with a stored embedding also carry `semantic_score`.
    async fn search_candidates(
        &self,
        query: &str,
        filters: &SearchFilters,
        query_vec: Option<&[f32]>,
        limit: i64,
    ) -> Result<Vec<Candidate>>;

    /// Change events matching `filter`, newest first.
    async fn list_changes(&self, filter: &ChangeFilter) -> Result<Vec<ChangeEvent>>;
}
