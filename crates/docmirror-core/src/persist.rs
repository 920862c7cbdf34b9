//! Change-aware persistence of ingestion runs.
//!
//! For each ingested document:
//!
//! - **New** `(source, url, version_tag)`: insert the document and its
//!   chunks, emit one `document_added` event.
//! - **Unchanged** content hash: refresh `last_seen_at` and fetch metadata
//!   only. No chunk replacement, no events.
//! - **Changed** content hash: reconstruct the previous text from the old
//!   chunks and classify the change.
//!
//! New and changed documents are stored with one [`Store::write_document`]
//! call, so the row, its chunks, and its events land together or not at
//! all. Pages that answered `304 Not Modified` only have their seen time
//! and validators refreshed.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::change::{document_added, ChangeClassifier, DetectedChange};
use crate::chunk::{content_hash, estimate_token_count};
use crate::embedding::{normalize_vector, Embedder};
use crate::models::{
    ChangeEvent, Chunk, ChunkEmbedding, Document, FetchMetadata, IngestRunResult,
    IngestedDocument,
};
use crate::store::{DocumentRow, DocumentUpdate, DocumentWrite, Store};

/// Status recorded for a not-modified page whose fetch carried no status.
const NOT_MODIFIED_STATUS: u16 = 304;

/// Counters for one persisted run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PersistStats {
    pub inserted_documents: usize,
    pub updated_documents: usize,
    pub inserted_chunks: usize,
    pub change_events: usize,
}

/// Outcome of persisting a single document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DocumentOutcome {
    pub inserted: bool,
    pub changed: bool,
    pub chunks_inserted: usize,
    pub change_events: usize,
}

/// Dependencies of the persistence flow.
pub struct Persister<'a> {
    pub store: &'a dyn Store,
    pub classifier: &'a dyn ChangeClassifier,
    pub embedder: Option<&'a dyn Embedder>,
}

impl<'a> Persister<'a> {
    /// Persist every document of a run, then touch its not-modified pages.
    pub async fn persist_run(
        &self,
        source_id: &str,
        run: &IngestRunResult,
        ingested_at: DateTime<Utc>,
    ) -> Result<PersistStats> {
        let mut stats = PersistStats::default();

        for doc in &run.documents {
            let outcome = self.persist_document(source_id, doc, ingested_at).await?;
            if outcome.inserted {
                stats.inserted_documents += 1;
            } else if outcome.changed {
                stats.updated_documents += 1;
            }
            stats.inserted_chunks += outcome.chunks_inserted;
            stats.change_events += outcome.change_events;
        }

        for doc in &run.not_modified_documents {
            let fetch = FetchMetadata {
                status: doc.fetch.status.or(Some(NOT_MODIFIED_STATUS)),
                checked_at: doc.fetch.checked_at.or(Some(ingested_at)),
                ..doc.fetch.clone()
            };
            self.store
                .touch_not_modified(source_id, &doc.canonical_url, &fetch, ingested_at)
                .await?;
        }

        tracing::debug!(
            source = %source_id,
            inserted = stats.inserted_documents,
            updated = stats.updated_documents,
            not_modified = run.not_modified_documents.len(),
            "persisted run"
        );

        Ok(stats)
    }

    /// Persist one document according to its content hash.
    pub async fn persist_document(
        &self,
        source_id: &str,
        doc: &IngestedDocument,
        ingested_at: DateTime<Utc>,
    ) -> Result<DocumentOutcome> {
        let hash = content_hash(&doc.content);
        let fetch = FetchMetadata {
            checked_at: doc
                .fetch
                .as_ref()
                .and_then(|f| f.checked_at)
                .or(Some(ingested_at)),
            ..doc.fetch.clone().unwrap_or_default()
        };

        let existing = self
            .store
            .find_document(source_id, &doc.canonical_url, doc.version_tag.as_deref())
            .await?;

        let Some(existing) = existing else {
            let document_id = Uuid::new_v4().to_string();
            let (chunks, embeddings) = self.build_chunks(&document_id, doc, ingested_at).await;
            let events = change_events(
                source_id,
                &document_id,
                doc,
                vec![document_added(&doc.title)],
                ingested_at,
            );
            let outcome = DocumentOutcome {
                inserted: true,
                changed: true,
                chunks_inserted: chunks.len(),
                change_events: events.len(),
            };

            self.store
                .write_document(&DocumentWrite {
                    row: DocumentRow::Insert(Document {
                        id: document_id,
                        source_id: source_id.to_string(),
                        canonical_url: doc.canonical_url.clone(),
                        version_tag: doc.version_tag.clone(),
                        title: doc.title.clone(),
                        language: doc.language.clone(),
                        content_hash: hash,
                        first_seen_at: ingested_at,
                        last_seen_at: ingested_at,
                        last_changed_at: ingested_at,
                        fetch,
                    }),
                    chunks,
                    embeddings,
                    events,
                })
                .await?;
            return Ok(outcome);
        };

        let update = DocumentUpdate {
            id: existing.id.clone(),
            title: doc.title.clone(),
            language: doc.language.clone(),
            seen_at: ingested_at,
            changed_hash: None,
            fetch,
        };

        if existing.content_hash == hash {
            self.store.update_document(&update).await?;
            return Ok(DocumentOutcome {
                inserted: false,
                changed: false,
                chunks_inserted: 0,
                change_events: 0,
            });
        }

        // The stored hash only advances together with the chunks and events,
        // so a failed write is detected as a change again on retry.
        let previous_text = self.store.document_text(&existing.id).await?;
        let (chunks, embeddings) = self.build_chunks(&existing.id, doc, ingested_at).await;
        let detected = self
            .classifier
            .classify(&previous_text, &doc.content, &doc.title);
        let events = change_events(source_id, &existing.id, doc, detected, ingested_at);
        let outcome = DocumentOutcome {
            inserted: false,
            changed: true,
            chunks_inserted: chunks.len(),
            change_events: events.len(),
        };

        self.store
            .write_document(&DocumentWrite {
                row: DocumentRow::Update(DocumentUpdate {
                    changed_hash: Some(hash),
                    ..update
                }),
                chunks,
                embeddings,
                events,
            })
            .await?;
        Ok(outcome)
    }

    async fn build_chunks(
        &self,
        document_id: &str,
        doc: &IngestedDocument,
        valid_from: DateTime<Utc>,
    ) -> (Vec<Chunk>, Vec<ChunkEmbedding>) {
        let chunks: Vec<Chunk> = doc
            .chunks
            .iter()
            .enumerate()
            .map(|(index, c)| Chunk {
                id: Uuid::new_v4().to_string(),
                document_id: document_id.to_string(),
                chunk_index: index as i64,
                text: c.text.clone(),
                token_count: estimate_token_count(&c.text),
                heading_path: c.heading_path.clone(),
                code_lang: c.code_lang.clone(),
                valid_from,
                valid_to: None,
            })
            .collect();

        let embeddings = self.embed_chunks(&chunks).await;
        (chunks, embeddings)
    }

    async fn embed_chunks(&self, chunks: &[Chunk]) -> Vec<ChunkEmbedding> {
        let Some(embedder) = self.embedder else {
            return Vec::new();
        };
        if chunks.is_empty() {
            return Vec::new();
        }

        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let Some(vectors) = embedder.embed(&texts).await else {
            return Vec::new();
        };

        let model = embedder.model_id();
        chunks
            .iter()
            .zip(vectors)
            .filter_map(|(chunk, vector)| {
                let vector = normalize_vector(&vector?)?;
                Some(ChunkEmbedding {
                    chunk_id: chunk.id.clone(),
                    model: model.clone(),
                    vector,
                })
            })
            .collect()
    }
}

fn change_events(
    source_id: &str,
    document_id: &str,
    doc: &IngestedDocument,
    detected: Vec<DetectedChange>,
    detected_at: DateTime<Utc>,
) -> Vec<ChangeEvent> {
    detected
        .into_iter()
        .map(|d| ChangeEvent {
            id: Uuid::new_v4().to_string(),
            source_id: source_id.to_string(),
            document_id: document_id.to_string(),
            canonical_url: doc.canonical_url.clone(),
            title: doc.title.clone(),
            event_type: d.event_type,
            severity: d.severity,
            summary: d.summary,
            details: d.details,
            detected_at,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::KeywordSectionClassifier;
    use crate::chunk::chunk_structured_text;
    use crate::models::{EventType, NotModifiedDocument, Severity};
    use crate::store::memory::InMemoryStore;
    use crate::store::ChangeFilter;
    use async_trait::async_trait;

    fn ingested(url: &str, content: &str) -> IngestedDocument {
        IngestedDocument {
            canonical_url: url.to_string(),
            title: "Webhooks".to_string(),
            language: "en".to_string(),
            version_tag: None,
            content: content.to_string(),
            chunks: chunk_structured_text(content, 1800),
            fetch: Some(FetchMetadata {
                etag: Some("\"v1\"".to_string()),
                ..Default::default()
            }),
        }
    }

    fn run_with(docs: Vec<IngestedDocument>) -> IngestRunResult {
        let mut run = IngestRunResult::new("acme");
        run.documents = docs;
        run.finish();
        run
    }

    async fn persist(store: &InMemoryStore, run: &IngestRunResult) -> PersistStats {
        let classifier = KeywordSectionClassifier;
        Persister {
            store,
            classifier: &classifier,
            embedder: None,
        }
        .persist_run("acme", run, Utc::now())
        .await
        .unwrap()
    }

    const URL: &str = "https://docs.acme.dev/webhooks";

    #[tokio::test]
    async fn test_new_document_emits_added() {
        let store = InMemoryStore::new();
        let stats = persist(&store, &run_with(vec![ingested(URL, "## Setup\n\nRegister an endpoint.")])).await;

        assert_eq!(stats.inserted_documents, 1);
        assert_eq!(stats.inserted_chunks, 1);
        assert_eq!(stats.change_events, 1);

        let events = store.list_changes(&ChangeFilter::default()).await.unwrap();
        assert_eq!(events[0].event_type, EventType::DocumentAdded);
        assert_eq!(events[0].severity, Severity::Low);
        assert_eq!(events[0].summary, "Documentation added for Webhooks");
    }

    #[tokio::test]
    async fn test_unchanged_resync_is_noop() {
        let store = InMemoryStore::new();
        let run = run_with(vec![ingested(URL, "## Setup\n\nRegister an endpoint.")]);
        persist(&store, &run).await;
        let stats = persist(&store, &run).await;

        assert_eq!(stats, PersistStats::default());
        assert_eq!(store.list_changes(&ChangeFilter::default()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_changed_document_classified() {
        let store = InMemoryStore::new();
        persist(&store, &run_with(vec![ingested(URL, "## Setup\n\nRegister an endpoint.")])).await;
        let stats = persist(
            &store,
            &run_with(vec![ingested(
                URL,
                "## Setup\n\nRegister an endpoint. Legacy endpoints are deprecated.",
            )]),
        )
        .await;

        assert_eq!(stats.updated_documents, 1);
        assert_eq!(stats.inserted_chunks, 1);
        assert_eq!(stats.change_events, 1);

        let events = store.list_changes(&ChangeFilter::default()).await.unwrap();
        assert_eq!(events.len(), 2);
        assert!(events.iter().any(|e| e.event_type == EventType::Deprecation));

        let doc = store.find_document("acme", URL, None).await.unwrap().unwrap();
        let text = store.document_text(&doc.id).await.unwrap();
        assert!(text.contains("deprecated"));
    }

    #[tokio::test]
    async fn test_single_char_change_updates_hash() {
        let store = InMemoryStore::new();
        persist(&store, &run_with(vec![ingested(URL, "## Setup\n\nRegister an endpoint.")])).await;
        let before = store.find_document("acme", URL, None).await.unwrap().unwrap();
        persist(&store, &run_with(vec![ingested(URL, "## Setup\n\nRegister an endpoint!")])).await;
        let after = store.find_document("acme", URL, None).await.unwrap().unwrap();

        assert_ne!(before.content_hash, after.content_hash);
        let events = store.list_changes(&ChangeFilter::default()).await.unwrap();
        assert_eq!(events[0].event_type, EventType::Updated);
    }

    #[tokio::test]
    async fn test_not_modified_touch_keeps_content() {
        let store = InMemoryStore::new();
        persist(&store, &run_with(vec![ingested(URL, "## Setup\n\nRegister an endpoint.")])).await;

        let mut run = IngestRunResult::new("acme");
        run.not_modified_documents.push(NotModifiedDocument {
            canonical_url: URL.to_string(),
            fetch: FetchMetadata {
                etag: Some("\"v2\"".to_string()),
                ..Default::default()
            },
        });
        let stats = persist(&store, &run).await;
        assert_eq!(stats, PersistStats::default());

        let conditions = store.fetch_conditions("acme").await.unwrap();
        assert_eq!(conditions[URL].etag.as_deref(), Some("\"v2\""));
        let fetch = store.document_fetch("acme", URL).unwrap();
        assert_eq!(fetch.status, Some(304));
    }

    struct FixedEmbedder;

    #[async_trait]
    impl Embedder for FixedEmbedder {
        fn model_id(&self) -> String {
            "test:fixed".to_string()
        }

        async fn embed(&self, texts: &[String]) -> Option<Vec<Option<Vec<f32>>>> {
            Some(texts.iter().map(|_| Some(vec![3.0, 4.0])).collect())
        }
    }

    #[tokio::test]
    async fn test_embeddings_stored_normalized() {
        let store = InMemoryStore::new();
        let classifier = KeywordSectionClassifier;
        let embedder = FixedEmbedder;
        Persister {
            store: &store,
            classifier: &classifier,
            embedder: Some(&embedder),
        }
        .persist_run("acme", &run_with(vec![ingested(URL, "Register an endpoint.")]), Utc::now())
        .await
        .unwrap();

        let embeddings = store.embeddings();
        assert_eq!(embeddings.len(), 1);
        assert_eq!(embeddings[0].model, "test:fixed");
        assert!((embeddings[0].vector[0] - 0.6).abs() < 1e-6);
    }

    /// Delegates to an [`InMemoryStore`] but rejects document writes while
    /// `down` is set.
    struct FlakyStore {
        inner: InMemoryStore,
        down: std::sync::atomic::AtomicBool,
    }

    impl FlakyStore {
        fn new() -> Self {
            Self {
                inner: InMemoryStore::new(),
                down: std::sync::atomic::AtomicBool::new(false),
            }
        }

        fn set_down(&self, down: bool) {
            self.down.store(down, std::sync::atomic::Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl Store for FlakyStore {
        async fn upsert_source(&self, source: &crate::models::Source) -> Result<()> {
            self.inner.upsert_source(source).await
        }
        async fn list_sources(&self) -> Result<Vec<crate::models::Source>> {
            self.inner.list_sources().await
        }
        async fn find_document(
            &self,
            source_id: &str,
            canonical_url: &str,
            version_tag: Option<&str>,
        ) -> Result<Option<crate::store::ExistingDocument>> {
            self.inner.find_document(source_id, canonical_url, version_tag).await
        }
        async fn insert_document(&self, doc: &Document) -> Result<()> {
            self.inner.insert_document(doc).await
        }
        async fn update_document(&self, update: &DocumentUpdate) -> Result<()> {
            self.inner.update_document(update).await
        }
        async fn document_text(&self, document_id: &str) -> Result<String> {
            self.inner.document_text(document_id).await
        }
        async fn replace_chunks(
            &self,
            document_id: &str,
            chunks: &[Chunk],
            embeddings: &[ChunkEmbedding],
        ) -> Result<()> {
            self.inner.replace_chunks(document_id, chunks, embeddings).await
        }
        async fn insert_change_events(&self, events: &[ChangeEvent]) -> Result<()> {
            self.inner.insert_change_events(events).await
        }
        async fn write_document(&self, write: &DocumentWrite) -> Result<()> {
            if self.down.load(std::sync::atomic::Ordering::SeqCst) {
                anyhow::bail!("store unavailable");
            }
            self.inner.write_document(write).await
        }
        async fn touch_not_modified(
            &self,
            source_id: &str,
            canonical_url: &str,
            fetch: &FetchMetadata,
            seen_at: DateTime<Utc>,
        ) -> Result<()> {
            self.inner.touch_not_modified(source_id, canonical_url, fetch, seen_at).await
        }
        async fn fetch_conditions(
            &self,
            source_id: &str,
        ) -> Result<std::collections::HashMap<String, crate::models::FetchConditions>> {
            self.inner.fetch_conditions(source_id).await
        }
        async fn record_snapshot(&self, snapshot: &crate::models::Snapshot) -> Result<()> {
            self.inner.record_snapshot(snapshot).await
        }
        async fn last_snapshot(&self, source_id: &str) -> Result<Option<crate::models::Snapshot>> {
            self.inner.last_snapshot(source_id).await
        }
        async fn search_candidates(
            &self,
            query: &str,
            filters: &crate::store::SearchFilters,
            query_vec: Option<&[f32]>,
            limit: i64,
        ) -> Result<Vec<crate::rerank::Candidate>> {
            self.inner.search_candidates(query, filters, query_vec, limit).await
        }
        async fn list_changes(&self, filter: &ChangeFilter) -> Result<Vec<ChangeEvent>> {
            self.inner.list_changes(filter).await
        }
    }

    fn persister<'a>(store: &'a dyn Store, classifier: &'a KeywordSectionClassifier) -> Persister<'a> {
        Persister {
            store,
            classifier,
            embedder: None,
        }
    }

    #[tokio::test]
    async fn test_failed_change_write_is_redone_on_retry() {
        let store = FlakyStore::new();
        let classifier = KeywordSectionClassifier;
        let persister = persister(&store, &classifier);
        let old = ingested(URL, "## A\n\nold body");
        let new = ingested(URL, "## A\n\nnew body, this API is deprecated");

        persister.persist_document("acme", &old, Utc::now()).await.unwrap();
        let before = store.find_document("acme", URL, None).await.unwrap().unwrap();

        store.set_down(true);
        let err = persister.persist_document("acme", &new, Utc::now()).await.unwrap_err();
        assert!(err.to_string().contains("store unavailable"));

        let after_failure = store.find_document("acme", URL, None).await.unwrap().unwrap();
        assert_eq!(after_failure.content_hash, before.content_hash);
        assert_eq!(store.document_text(&before.id).await.unwrap(), "## A\n\nold body");

        store.set_down(false);
        let outcome = persister.persist_document("acme", &new, Utc::now()).await.unwrap();
        assert!(outcome.changed);
        assert!(!outcome.inserted);
        assert_eq!(outcome.chunks_inserted, 1);

        let text = store.document_text(&before.id).await.unwrap();
        assert!(text.contains("deprecated"));
        let events = store.list_changes(&ChangeFilter::default()).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, EventType::Deprecation);
    }

    #[tokio::test]
    async fn test_failed_insert_leaves_no_document() {
        let store = FlakyStore::new();
        let classifier = KeywordSectionClassifier;
        let persister = persister(&store, &classifier);
        let doc = ingested(URL, "## Setup\n\nRegister an endpoint.");

        store.set_down(true);
        assert!(persister.persist_document("acme", &doc, Utc::now()).await.is_err());
        assert!(store.find_document("acme", URL, None).await.unwrap().is_none());

        store.set_down(false);
        let outcome = persister.persist_document("acme", &doc, Utc::now()).await.unwrap();
        assert!(outcome.inserted);
        assert_eq!(outcome.change_events, 1);
    }
}
