//! In-memory [`Store`] implementation for tests and embedding in tools.
//!
//! Uses `HashMap`/`Vec` behind `std::sync::RwLock`. Full-text strength is
//! approximated by counting query tokens present in the chunk text; vector
//! similarity is brute-force cosine over every stored embedding.

use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::embedding::cosine_similarity;
use crate::models::{
    ChangeEvent, Chunk, ChunkEmbedding, Document, FetchConditions, FetchMetadata, Snapshot, Source,
};
use crate::rerank::{tokenize, Candidate};

use super::{
    ChangeFilter, DocumentRow, DocumentUpdate, DocumentWrite, ExistingDocument, SearchFilters, Store,
};

/// In-memory store.
pub struct InMemoryStore {
    sources: RwLock<BTreeMap<String, Source>>,
    docs: RwLock<HashMap<String, Document>>,
    chunks: RwLock<Vec<Chunk>>,
    embeddings: RwLock<HashMap<String, ChunkEmbedding>>,
    events: RwLock<Vec<ChangeEvent>>,
    snapshots: RwLock<Vec<Snapshot>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            sources: RwLock::new(BTreeMap::new()),
            docs: RwLock::new(HashMap::new()),
            chunks: RwLock::new(Vec::new()),
            embeddings: RwLock::new(HashMap::new()),
            events: RwLock::new(Vec::new()),
            snapshots: RwLock::new(Vec::new()),
        }
    }

    /// Stored fetch metadata of the first document at `canonical_url`.
    pub fn document_fetch(&self, source_id: &str, canonical_url: &str) -> Option<FetchMetadata> {
        let docs = read(&self.docs);
        docs.values()
            .find(|d| d.source_id == source_id && d.canonical_url == canonical_url)
            .map(|d| d.fetch.clone())
    }

    /// Every stored embedding, in no particular order.
    pub fn embeddings(&self) -> Vec<ChunkEmbedding> {
        read(&self.embeddings).values().cloned().collect()
    }

    pub fn chunk_count(&self) -> usize {
        read(&self.chunks).len()
    }

    /// Overwrite a document's `last_changed_at`, for freshness tests.
    pub fn set_last_changed_at(&self, document_id: &str, at: DateTime<Utc>) {
        if let Some(doc) = write(&self.docs).get_mut(document_id) {
            doc.last_changed_at = at;
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

// No mutation here can panic halfway, so a poisoned lock still guards consistent data.
fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

fn ensure_insertable(docs: &HashMap<String, Document>, doc: &Document) -> Result<()> {
    let duplicate = docs.values().any(|d| {
        d.source_id == doc.source_id
            && d.canonical_url == doc.canonical_url
            && d.version_tag == doc.version_tag
    });
    if duplicate {
        anyhow::bail!(
            "document already exists: {} {} {:?}",
            doc.source_id,
            doc.canonical_url,
            doc.version_tag
        );
    }
    Ok(())
}

fn apply_update(doc: &mut Document, update: &DocumentUpdate) {
    doc.title = update.title.clone();
    doc.language = update.language.clone();
    doc.last_seen_at = update.seen_at;
    if let Some(hash) = &update.changed_hash {
        doc.content_hash = hash.clone();
        doc.last_changed_at = update.seen_at;
    }
    merge_fetch(&mut doc.fetch, &update.fetch);
}

fn swap_chunks(
    stored: &mut Vec<Chunk>,
    vectors: &mut HashMap<String, ChunkEmbedding>,
    document_id: &str,
    chunks: &[Chunk],
    embeddings: &[ChunkEmbedding],
) {
    stored.retain(|c| {
        if c.document_id == document_id {
            vectors.remove(&c.id);
            false
        } else {
            true
        }
    });
    stored.extend(chunks.iter().cloned());
    for e in embeddings {
        vectors.insert(e.chunk_id.clone(), e.clone());
    }
}

fn merge_fetch(stored: &mut FetchMetadata, update: &FetchMetadata) {
    if update.etag.is_some() {
        stored.etag = update.etag.clone();
    }
    if update.last_modified.is_some() {
        stored.last_modified = update.last_modified.clone();
    }
    if update.status.is_some() {
        stored.status = update.status;
    }
    stored.checked_at = update.checked_at;
}

fn matches_filters(doc: &Document, sources: &BTreeMap<String, Source>, filters: &SearchFilters) -> bool {
    if !sources.contains_key(&doc.source_id) {
        return false;
    }
    if !filters.sources.is_empty() && !filters.sources.contains(&doc.source_id) {
        return false;
    }
    if let Some(version) = &filters.version {
        if doc.version_tag.as_deref().unwrap_or("latest") != version {
            return false;
        }
    }
    if let Some(after) = filters.updated_after {
        if doc.last_changed_at < after {
            return false;
        }
    }
    if let Some(language) = &filters.language {
        if &doc.language != language {
            return false;
        }
    }
    true
}

#[async_trait]
impl Store for InMemoryStore {
    async fn upsert_source(&self, source: &Source) -> Result<()> {
        write(&self.sources).insert(source.id.clone(), source.clone());
        Ok(())
    }

    async fn list_sources(&self) -> Result<Vec<Source>> {
        Ok(read(&self.sources).values().cloned().collect())
    }

    async fn find_document(
        &self,
        source_id: &str,
        canonical_url: &str,
        version_tag: Option<&str>,
    ) -> Result<Option<ExistingDocument>> {
        let docs = read(&self.docs);
        Ok(docs
            .values()
            .find(|d| {
                d.source_id == source_id
                    && d.canonical_url == canonical_url
                    && d.version_tag.as_deref().unwrap_or("") == version_tag.unwrap_or("")
            })
            .map(|d| ExistingDocument {
                id: d.id.clone(),
                content_hash: d.content_hash.clone(),
                title: d.title.clone(),
            }))
    }

    async fn insert_document(&self, doc: &Document) -> Result<()> {
        let mut docs = write(&self.docs);
        ensure_insertable(&docs, doc)?;
        docs.insert(doc.id.clone(), doc.clone());
        Ok(())
    }

    async fn update_document(&self, update: &DocumentUpdate) -> Result<()> {
        let mut docs = write(&self.docs);
        let Some(doc) = docs.get_mut(&update.id) else {
            anyhow::bail!("document not found: {}", update.id);
        };
        apply_update(doc, update);
        Ok(())
    }

    async fn document_text(&self, document_id: &str) -> Result<String> {
        let chunks = read(&self.chunks);
        let mut own: Vec<&Chunk> = chunks.iter().filter(|c| c.document_id == document_id).collect();
        own.sort_by_key(|c| c.chunk_index);
        Ok(own
            .iter()
            .map(|c| c.text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n"))
    }

    async fn replace_chunks(
        &self,
        document_id: &str,
        chunks: &[Chunk],
        embeddings: &[ChunkEmbedding],
    ) -> Result<()> {
        let mut stored = write(&self.chunks);
        let mut vectors = write(&self.embeddings);
        swap_chunks(&mut stored, &mut vectors, document_id, chunks, embeddings);
        Ok(())
    }

    async fn insert_change_events(&self, events: &[ChangeEvent]) -> Result<()> {
        write(&self.events).extend(events.iter().cloned());
        Ok(())
    }

    async fn write_document(&self, change: &DocumentWrite) -> Result<()> {
        let mut docs = write(&self.docs);
        let mut stored = write(&self.chunks);
        let mut vectors = write(&self.embeddings);
        let mut events = write(&self.events);

        match &change.row {
            DocumentRow::Insert(doc) => {
                ensure_insertable(&docs, doc)?;
                docs.insert(doc.id.clone(), doc.clone());
            }
            DocumentRow::Update(update) => {
                let Some(doc) = docs.get_mut(&update.id) else {
                    anyhow::bail!("document not found: {}", update.id);
                };
                apply_update(doc, update);
            }
        }
        swap_chunks(
            &mut stored,
            &mut vectors,
            change.document_id(),
            &change.chunks,
            &change.embeddings,
        );
        events.extend(change.events.iter().cloned());
        Ok(())
    }

    async fn touch_not_modified(
        &self,
        source_id: &str,
        canonical_url: &str,
        fetch: &FetchMetadata,
        seen_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut docs = write(&self.docs);
        for doc in docs
            .values_mut()
            .filter(|d| d.source_id == source_id && d.canonical_url == canonical_url)
        {
            doc.last_seen_at = seen_at;
            merge_fetch(&mut doc.fetch, fetch);
        }
        Ok(())
    }

    async fn fetch_conditions(&self, source_id: &str) -> Result<HashMap<String, FetchConditions>> {
        let docs = read(&self.docs);
        Ok(docs
            .values()
            .filter(|d| d.source_id == source_id)
            .filter(|d| d.fetch.etag.is_some() || d.fetch.last_modified.is_some())
            .map(|d| {
                (
                    d.canonical_url.clone(),
                    FetchConditions {
                        etag: d.fetch.etag.clone(),
                        last_modified: d.fetch.last_modified.clone(),
                    },
                )
            })
            .collect())
    }

    async fn record_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        write(&self.snapshots).push(snapshot.clone());
        Ok(())
    }

    async fn last_snapshot(&self, source_id: &str) -> Result<Option<Snapshot>> {
        let snapshots = read(&self.snapshots);
        Ok(snapshots
            .iter()
            .filter(|s| s.source_id == source_id)
            .max_by_key(|s| s.fetched_at)
            .cloned())
    }

    async fn search_candidates(
        &self,
        query: &str,
        filters: &SearchFilters,
        query_vec: Option<&[f32]>,
        limit: i64,
    ) -> Result<Vec<Candidate>> {
        let needle = query.trim().to_lowercase();
        let tokens = tokenize(query);
        if needle.is_empty() && query_vec.is_none() {
            return Ok(Vec::new());
        }

        let sources = read(&self.sources);
        let docs = read(&self.docs);
        let chunks = read(&self.chunks);
        let vectors = read(&self.embeddings);

        let mut candidates: Vec<Candidate> = chunks
            .iter()
            .filter_map(|chunk| {
                let doc = docs.get(&chunk.document_id)?;
                if !matches_filters(doc, &sources, filters) {
                    return None;
                }

                let text = chunk.text.to_lowercase();
                let title = doc.title.to_lowercase();
                let mut ilike_score = 0.0;
                if !needle.is_empty() && text.contains(&needle) {
                    ilike_score += 0.8;
                }
                if !needle.is_empty() && title.contains(&needle) {
                    ilike_score += 0.2;
                }
                let fts_score = tokens.iter().filter(|t| text.contains(t.as_str())).count() as f64;
                let semantic_score = query_vec.and_then(|qv| {
                    vectors
                        .get(&chunk.id)
                        .map(|e| cosine_similarity(qv, &e.vector) as f64)
                });

                if ilike_score <= 0.0 && fts_score <= 0.0 && semantic_score.is_none() {
                    return None;
                }

                Some(Candidate {
                    chunk_id: chunk.id.clone(),
                    text: chunk.text.clone(),
                    heading_path: chunk.heading_path.clone(),
                    code_lang: chunk.code_lang.clone(),
                    title: doc.title.clone(),
                    url: doc.canonical_url.clone(),
                    source: doc.source_id.clone(),
                    version_tag: doc.version_tag.clone(),
                    last_changed_at: doc.last_changed_at,
                    ilike_score,
                    fts_score,
                    semantic_score,
                })
            })
            .collect();

        candidates.sort_by(|a, b| {
            let left = a.ilike_score + a.fts_score + a.semantic_score.unwrap_or(0.0);
            let right = b.ilike_score + b.fts_score + b.semantic_score.unwrap_or(0.0);
            right
                .partial_cmp(&left)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.last_changed_at.cmp(&a.last_changed_at))
        });
        candidates.truncate(limit.max(0) as usize);
        Ok(candidates)
    }

    async fn list_changes(&self, filter: &ChangeFilter) -> Result<Vec<ChangeEvent>> {
        let events = read(&self.events);
        let mut matching: Vec<ChangeEvent> = events
            .iter()
            .rev()
            .filter(|e| filter.source.as_deref().map_or(true, |s| e.source_id == s))
            .filter(|e| filter.event_type.map_or(true, |t| e.event_type == t))
            .filter(|e| filter.severity.map_or(true, |s| e.severity == s))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.detected_at.cmp(&a.detected_at));
        matching.truncate(filter.limit.max(0) as usize);
        Ok(matching)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SourceKind;

    fn source(id: &str) -> Source {
        Source {
            id: id.to_string(),
            name: id.to_string(),
            kind: SourceKind::Docs,
            base_url: format!("https://{}.example.com", id),
            trust_score: 0.9,
            poll_interval_minutes: 60,
        }
    }

    fn document(id: &str, source_id: &str, url: &str, version: Option<&str>) -> Document {
        let now = Utc::now();
        Document {
            id: id.to_string(),
            source_id: source_id.to_string(),
            canonical_url: url.to_string(),
            version_tag: version.map(str::to_string),
            title: "Auth guide".to_string(),
            language: "en".to_string(),
            content_hash: "h".to_string(),
            first_seen_at: now,
            last_seen_at: now,
            last_changed_at: now,
            fetch: FetchMetadata::default(),
        }
    }

    fn chunk(id: &str, doc: &str, index: i64, text: &str) -> Chunk {
        Chunk {
            id: id.to_string(),
            document_id: doc.to_string(),
            chunk_index: index,
            text: text.to_string(),
            token_count: 1,
            heading_path: None,
            code_lang: None,
            valid_from: Utc::now(),
            valid_to: None,
        }
    }

    #[tokio::test]
    async fn test_version_tag_is_part_of_identity() {
        let store = InMemoryStore::new();
        store.insert_document(&document("d1", "s", "https://s/a", None)).await.unwrap();
        store.insert_document(&document("d2", "s", "https://s/a", Some("v2"))).await.unwrap();
        assert!(store.insert_document(&document("d3", "s", "https://s/a", None)).await.is_err());

        let found = store.find_document("s", "https://s/a", Some("v2")).await.unwrap().unwrap();
        assert_eq!(found.id, "d2");
        let found = store.find_document("s", "https://s/a", None).await.unwrap().unwrap();
        assert_eq!(found.id, "d1");
    }

    #[tokio::test]
    async fn test_replace_chunks_drops_old_embeddings() {
        let store = InMemoryStore::new();
        let old = vec![chunk("c1", "d1", 0, "one"), chunk("c2", "d1", 1, "two")];
        let emb = vec![ChunkEmbedding {
            chunk_id: "c1".into(),
            model: "m".into(),
            vector: vec![1.0],
        }];
        store.replace_chunks("d1", &old, &emb).await.unwrap();
        assert_eq!(store.document_text("d1").await.unwrap(), "one\n\ntwo");

        store.replace_chunks("d1", &[chunk("c3", "d1", 0, "three")], &[]).await.unwrap();
        assert_eq!(store.chunk_count(), 1);
        assert!(store.embeddings().is_empty());
    }

    #[tokio::test]
    async fn test_search_candidates_scores_and_filters() {
        let store = InMemoryStore::new();
        store.upsert_source(&source("stripe")).await.unwrap();
        store.upsert_source(&source("plaid")).await.unwrap();
        store.insert_document(&document("d1", "stripe", "https://stripe/a", None)).await.unwrap();
        store.insert_document(&document("d2", "plaid", "https://plaid/a", None)).await.unwrap();
        store
            .replace_chunks("d1", &[chunk("c1", "d1", 0, "Use a bearer token for auth.")], &[])
            .await
            .unwrap();
        store
            .replace_chunks("d2", &[chunk("c2", "d2", 0, "Link token exchange.")], &[])
            .await
            .unwrap();

        let all = store
            .search_candidates("bearer token", &SearchFilters::default(), None, 10)
            .await
            .unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].chunk_id, "c1");
        assert!((all[0].ilike_score - 0.8).abs() < 1e-9);
        assert_eq!(all[0].fts_score, 2.0);
        assert_eq!(all[1].ilike_score, 0.0);

        let filters = SearchFilters {
            sources: vec!["plaid".into()],
            ..Default::default()
        };
        let scoped = store.search_candidates("token", &filters, None, 10).await.unwrap();
        assert_eq!(scoped.len(), 1);
        assert_eq!(scoped[0].source, "plaid");

        let versioned = SearchFilters {
            version: Some("latest".into()),
            ..Default::default()
        };
        assert_eq!(store.search_candidates("token", &versioned, None, 10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_list_changes_newest_first_with_limit() {
        let store = InMemoryStore::new();
        let base = Utc::now();
        let events: Vec<ChangeEvent> = (0..5)
            .map(|i| ChangeEvent {
                id: format!("e{}", i),
                source_id: "s".into(),
                document_id: "d".into(),
                canonical_url: "https://s/a".into(),
                title: "A".into(),
                event_type: crate::models::EventType::Updated,
                severity: crate::models::Severity::Low,
                summary: "updated".into(),
                details: serde_json::json!({}),
                detected_at: base + chrono::Duration::minutes(i),
            })
            .collect();
        store.insert_change_events(&events).await.unwrap();

        let filter = ChangeFilter {
            limit: 2,
            ..Default::default()
        };
        let listed = store.list_changes(&filter).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, "e4");
        assert_eq!(listed[1].id, "e3");
    }

    #[tokio::test]
    async fn test_rejected_write_document_changes_nothing() {
        let store = InMemoryStore::new();
        store.insert_document(&document("d1", "s", "https://s/a", None)).await.unwrap();
        store.replace_chunks("d1", &[chunk("c1", "d1", 0, "old")], &[]).await.unwrap();

        // Same identifying triple as d1 under a new id.
        let duplicate = DocumentWrite {
            row: DocumentRow::Insert(document("d2", "s", "https://s/a", None)),
            chunks: vec![chunk("c2", "d2", 0, "new")],
            embeddings: Vec::new(),
            events: Vec::new(),
        };
        assert!(store.write_document(&duplicate).await.is_err());
        assert_eq!(store.chunk_count(), 1);
        assert_eq!(store.document_text("d1").await.unwrap(), "old");

        let now = Utc::now();
        let update = DocumentWrite {
            row: DocumentRow::Update(DocumentUpdate {
                id: "d1".into(),
                title: "Auth guide".into(),
                language: "en".into(),
                seen_at: now,
                changed_hash: Some("h2".into()),
                fetch: FetchMetadata::default(),
            }),
            chunks: vec![chunk("c3", "d1", 0, "new")],
            embeddings: Vec::new(),
            events: Vec::new(),
        };
        store.write_document(&update).await.unwrap();
        let found = store.find_document("s", "https://s/a", None).await.unwrap().unwrap();
        assert_eq!(found.content_hash, "h2");
        assert_eq!(store.document_text("d1").await.unwrap(), "new");
    }

    #[tokio::test]
    async fn test_store_usable_after_poisoned_lock() {
        let store = std::sync::Arc::new(InMemoryStore::new());
        store.insert_document(&document("d1", "s", "https://s/a", None)).await.unwrap();

        let holder = store.clone();
        let _ = std::thread::spawn(move || {
            let _guard = holder.docs.write().unwrap();
            panic!("panic while holding the document lock");
        })
        .join();
        assert!(store.docs.is_poisoned());

        assert!(store.find_document("s", "https://s/a", None).await.unwrap().is_some());
        store.insert_document(&document("d2", "s", "https://s/b", None)).await.unwrap();
    }
}
