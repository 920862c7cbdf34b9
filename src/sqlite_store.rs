//! SQLite-backed [`Store`] implementation.
//!
//! Maps each [`Store`] operation onto the schema created by
//! [`crate::migrate`]. Lexical candidates come from a `LIKE` substring test
//! plus FTS5 `bm25`; vector similarity is brute-force cosine over the
//! stored BLOBs of documents that pass the filters.

use std::collections::{HashMap, HashSet};
use std::str::FromStr;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqliteConnection, SqlitePool};

use docmirror_core::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use docmirror_core::models::{
    ChangeEvent, Chunk, ChunkEmbedding, Document, EventType, FetchConditions, FetchMetadata,
    RunStatus, Severity, Snapshot, Source, SourceKind,
};
use docmirror_core::rerank::{tokenize, Candidate};
use docmirror_core::store::{
    ChangeFilter, DocumentRow, DocumentUpdate, DocumentWrite, ExistingDocument, SearchFilters,
    Store,
};

/// SQLite implementation of the [`Store`] trait.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Number of chunks stored for a source.
    pub async fn chunk_count(&self, source_id: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM chunk c JOIN document d ON d.id = c.document_id WHERE d.source_id = ?",
        )
        .bind(source_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }
}

pub(crate) fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn version_param(version_tag: Option<&str>) -> &str {
    version_tag.unwrap_or("")
}

fn version_from_row(value: String) -> Option<String> {
    (!value.is_empty()).then_some(value)
}

/// `%query%` with LIKE wildcards escaped by `\`.
fn like_pattern(query: &str) -> String {
    let mut escaped = String::with_capacity(query.len() + 2);
    escaped.push('%');
    for c in query.trim().to_lowercase().chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push('%');
    escaped
}

/// FTS5 query OR-ing every query token as a quoted string.
fn fts_query(query: &str) -> Option<String> {
    let tokens = tokenize(query);
    if tokens.is_empty() {
        return None;
    }
    Some(
        tokens
            .iter()
            .map(|t| format!("\"{}\"", t))
            .collect::<Vec<_>>()
            .join(" OR "),
    )
}

fn push_filters(qb: &mut QueryBuilder<'_, Sqlite>, filters: &SearchFilters) {
    if !filters.sources.is_empty() {
        qb.push(" AND d.source_id IN (");
        let mut sep = qb.separated(", ");
        for source in &filters.sources {
            sep.push_bind(source.clone());
        }
        qb.push(")");
    }
    if let Some(version) = &filters.version {
        qb.push(" AND COALESCE(NULLIF(d.version_tag, ''), 'latest') = ");
        qb.push_bind(version.clone());
    }
    if let Some(after) = filters.updated_after {
        qb.push(" AND d.last_changed_at >= ");
        qb.push_bind(to_millis(after));
    }
    if let Some(language) = &filters.language {
        qb.push(" AND d.language = ");
        qb.push_bind(language.clone());
    }
}

fn candidate_from_row(row: &SqliteRow) -> Candidate {
    Candidate {
        chunk_id: row.get("chunk_id"),
        text: row.get("text"),
        heading_path: row.get("heading_path"),
        code_lang: row.get("code_lang"),
        title: row.get("title"),
        url: row.get("url"),
        source: row.get("source"),
        version_tag: version_from_row(row.get("version_tag")),
        last_changed_at: from_millis(row.get("last_changed_at")),
        ilike_score: row.get("ilike_score"),
        fts_score: row.get("fts_score"),
        semantic_score: None,
    }
}

const CANDIDATE_COLUMNS: &str = "c.id AS chunk_id, c.text, c.heading_path, c.code_lang, \
     d.title, d.canonical_url AS url, d.source_id AS source, d.version_tag, d.last_changed_at";

fn event_from_row(row: &SqliteRow) -> Result<ChangeEvent> {
    let event_type: String = row.get("event_type");
    let severity: String = row.get("severity");
    let details: String = row.get("details_json");
    Ok(ChangeEvent {
        id: row.get("id"),
        source_id: row.get("source_id"),
        document_id: row.get("document_id"),
        canonical_url: row.get("canonical_url"),
        title: row.get("title"),
        event_type: EventType::from_str(&event_type)?,
        severity: Severity::from_str(&severity)?,
        summary: row.get("summary"),
        details: serde_json::from_str(&details).unwrap_or(serde_json::json!({})),
        detected_at: from_millis(row.get("detected_at")),
    })
}

async fn insert_document_row(conn: &mut SqliteConnection, doc: &Document) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO document (id, source_id, canonical_url, version_tag, title, language,
                              content_hash, first_seen_at, last_seen_at, last_changed_at,
                              etag, last_modified, http_status, checked_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&doc.id)
    .bind(&doc.source_id)
    .bind(&doc.canonical_url)
    .bind(version_param(doc.version_tag.as_deref()))
    .bind(&doc.title)
    .bind(&doc.language)
    .bind(&doc.content_hash)
    .bind(to_millis(doc.first_seen_at))
    .bind(to_millis(doc.last_seen_at))
    .bind(to_millis(doc.last_changed_at))
    .bind(&doc.fetch.etag)
    .bind(&doc.fetch.last_modified)
    .bind(doc.fetch.status.map(i64::from))
    .bind(doc.fetch.checked_at.map(to_millis))
    .execute(&mut *conn)
    .await
    .with_context(|| format!("Failed to insert document {}", doc.canonical_url))?;
    Ok(())
}

async fn update_document_row(conn: &mut SqliteConnection, update: &DocumentUpdate) -> Result<()> {
    let changed_at = update.changed_hash.as_ref().map(|_| to_millis(update.seen_at));
    let result = sqlx::query(
        r#"
        UPDATE document SET
            title = ?,
            language = ?,
            last_seen_at = ?,
            content_hash = COALESCE(?, content_hash),
            last_changed_at = COALESCE(?, last_changed_at),
            etag = COALESCE(?, etag),
            last_modified = COALESCE(?, last_modified),
            http_status = COALESCE(?, http_status),
            checked_at = ?
        WHERE id = ?
        "#,
    )
    .bind(&update.title)
    .bind(&update.language)
    .bind(to_millis(update.seen_at))
    .bind(&update.changed_hash)
    .bind(changed_at)
    .bind(&update.fetch.etag)
    .bind(&update.fetch.last_modified)
    .bind(update.fetch.status.map(i64::from))
    .bind(update.fetch.checked_at.map(to_millis))
    .bind(&update.id)
    .execute(&mut *conn)
    .await?;
    if result.rows_affected() == 0 {
        anyhow::bail!("document not found: {}", update.id);
    }
    Ok(())
}

/// Delete-then-insert of a document's chunks, FTS rows, and embeddings.
async fn replace_chunk_rows(
    conn: &mut SqliteConnection,
    document_id: &str,
    chunks: &[Chunk],
    embeddings: &[ChunkEmbedding],
) -> Result<()> {
    sqlx::query(
        "DELETE FROM chunk_embedding WHERE chunk_id IN (SELECT id FROM chunk WHERE document_id = ?)",
    )
    .bind(document_id)
    .execute(&mut *conn)
    .await?;

    sqlx::query("DELETE FROM chunk_fts WHERE document_id = ?")
        .bind(document_id)
        .execute(&mut *conn)
        .await?;

    sqlx::query("DELETE FROM chunk WHERE document_id = ?")
        .bind(document_id)
        .execute(&mut *conn)
        .await?;

    for chunk in chunks {
        sqlx::query(
            r#"
            INSERT INTO chunk (id, document_id, chunk_index, text, token_count,
                               heading_path, code_lang, valid_from, valid_to)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&chunk.id)
        .bind(&chunk.document_id)
        .bind(chunk.chunk_index)
        .bind(&chunk.text)
        .bind(chunk.token_count)
        .bind(&chunk.heading_path)
        .bind(&chunk.code_lang)
        .bind(to_millis(chunk.valid_from))
        .bind(chunk.valid_to.map(to_millis))
        .execute(&mut *conn)
        .await?;

        sqlx::query("INSERT INTO chunk_fts (chunk_id, document_id, text) VALUES (?, ?, ?)")
            .bind(&chunk.id)
            .bind(&chunk.document_id)
            .bind(&chunk.text)
            .execute(&mut *conn)
            .await?;
    }

    for embedding in embeddings {
        sqlx::query(
            "INSERT INTO chunk_embedding (chunk_id, model, dims, vector) VALUES (?, ?, ?, ?)",
        )
        .bind(&embedding.chunk_id)
        .bind(&embedding.model)
        .bind(embedding.vector.len() as i64)
        .bind(vec_to_blob(&embedding.vector))
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

async fn insert_event_rows(conn: &mut SqliteConnection, events: &[ChangeEvent]) -> Result<()> {
    for event in events {
        sqlx::query(
            r#"
            INSERT INTO change_event (id, source_id, document_id, canonical_url, title,
                                      event_type, severity, summary, details_json, detected_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&event.id)
        .bind(&event.source_id)
        .bind(&event.document_id)
        .bind(&event.canonical_url)
        .bind(&event.title)
        .bind(event.event_type.as_str())
        .bind(event.severity.as_str())
        .bind(&event.summary)
        .bind(event.details.to_string())
        .bind(to_millis(event.detected_at))
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

#[async_trait]
impl Store for SqliteStore {
    async fn upsert_source(&self, source: &Source) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO source (id, name, kind, base_url, trust_score, poll_interval_minutes, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                kind = excluded.kind,
                base_url = excluded.base_url,
                trust_score = excluded.trust_score,
                poll_interval_minutes = excluded.poll_interval_minutes,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&source.id)
        .bind(&source.name)
        .bind(source.kind.as_str())
        .bind(&source.base_url)
        .bind(source.trust_score)
        .bind(source.poll_interval_minutes)
        .bind(to_millis(Utc::now()))
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to upsert source '{}'", source.id))?;
        Ok(())
    }

    async fn list_sources(&self) -> Result<Vec<Source>> {
        let rows = sqlx::query(
            "SELECT id, name, kind, base_url, trust_score, poll_interval_minutes FROM source ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let kind: String = row.get("kind");
                Ok(Source {
                    id: row.get("id"),
                    name: row.get("name"),
                    kind: SourceKind::from_str(&kind)?,
                    base_url: row.get("base_url"),
                    trust_score: row.get("trust_score"),
                    poll_interval_minutes: row.get("poll_interval_minutes"),
                })
            })
            .collect()
    }

    async fn find_document(
        &self,
        source_id: &str,
        canonical_url: &str,
        version_tag: Option<&str>,
    ) -> Result<Option<ExistingDocument>> {
        let row = sqlx::query(
            "SELECT id, content_hash, title FROM document WHERE source_id = ? AND canonical_url = ? AND version_tag = ?",
        )
        .bind(source_id)
        .bind(canonical_url)
        .bind(version_param(version_tag))
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| ExistingDocument {
            id: r.get("id"),
            content_hash: r.get("content_hash"),
            title: r.get("title"),
        }))
    }

    async fn insert_document(&self, doc: &Document) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        insert_document_row(&mut conn, doc).await
    }

    async fn update_document(&self, update: &DocumentUpdate) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        update_document_row(&mut conn, update).await
    }

    async fn document_text(&self, document_id: &str) -> Result<String> {
        let texts: Vec<String> = sqlx::query_scalar(
            "SELECT text FROM chunk WHERE document_id = ? ORDER BY chunk_index ASC",
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(texts.join("\n\n"))
    }

    async fn replace_chunks(
        &self,
        document_id: &str,
        chunks: &[Chunk],
        embeddings: &[ChunkEmbedding],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        replace_chunk_rows(&mut tx, document_id, chunks, embeddings).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn insert_change_events(&self, events: &[ChangeEvent]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        insert_event_rows(&mut tx, events).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn write_document(&self, change: &DocumentWrite) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        match &change.row {
            DocumentRow::Insert(doc) => insert_document_row(&mut tx, doc).await?,
            DocumentRow::Update(update) => update_document_row(&mut tx, update).await?,
        }
        replace_chunk_rows(&mut tx, change.document_id(), &change.chunks, &change.embeddings)
            .await?;
        insert_event_rows(&mut tx, &change.events).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn touch_not_modified(
        &self,
        source_id: &str,
        canonical_url: &str,
        fetch: &FetchMetadata,
        seen_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE document SET
                last_seen_at = ?,
                etag = COALESCE(?, etag),
                last_modified = COALESCE(?, last_modified),
                http_status = COALESCE(?, http_status),
                checked_at = ?
            WHERE source_id = ? AND canonical_url = ?
            "#,
        )
        .bind(to_millis(seen_at))
        .bind(&fetch.etag)
        .bind(&fetch.last_modified)
        .bind(fetch.status.map(i64::from))
        .bind(fetch.checked_at.map(to_millis))
        .bind(source_id)
        .bind(canonical_url)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fetch_conditions(&self, source_id: &str) -> Result<HashMap<String, FetchConditions>> {
        let rows = sqlx::query(
            r#"
            SELECT canonical_url, etag, last_modified FROM document
            WHERE source_id = ? AND (etag IS NOT NULL OR last_modified IS NOT NULL)
            "#,
        )
        .bind(source_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| {
                (
                    row.get("canonical_url"),
                    FetchConditions {
                        etag: row.get("etag"),
                        last_modified: row.get("last_modified"),
                    },
                )
            })
            .collect())
    }

    async fn record_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO snapshot (id, source_id, fetched_at, status, error, raw_ref, parser_version)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&snapshot.id)
        .bind(&snapshot.source_id)
        .bind(to_millis(snapshot.fetched_at))
        .bind(snapshot.status.as_str())
        .bind(&snapshot.error)
        .bind(&snapshot.raw_ref)
        .bind(&snapshot.parser_version)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn last_snapshot(&self, source_id: &str) -> Result<Option<Snapshot>> {
        let row = sqlx::query(
            r#"
            SELECT id, source_id, fetched_at, status, error, raw_ref, parser_version
            FROM snapshot WHERE source_id = ?
            ORDER BY fetched_at DESC, rowid DESC
            LIMIT 1
            "#,
        )
        .bind(source_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| {
            let status: String = r.get("status");
            Ok(Snapshot {
                id: r.get("id"),
                source_id: r.get("source_id"),
                fetched_at: from_millis(r.get("fetched_at")),
                status: RunStatus::from_str(&status)?,
                error: r.get("error"),
                raw_ref: r.get("raw_ref"),
                parser_version: r.get("parser_version"),
            })
        })
        .transpose()
    }

    async fn search_candidates(
        &self,
        query: &str,
        filters: &SearchFilters,
        query_vec: Option<&[f32]>,
        limit: i64,
    ) -> Result<Vec<Candidate>> {
        let needle = query.trim();
        if needle.is_empty() && query_vec.is_none() {
            return Ok(Vec::new());
        }

        let mut candidates = Vec::new();

        if !needle.is_empty() {
            let like = like_pattern(needle);
            let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT ");
            qb.push(CANDIDATE_COLUMNS);
            qb.push(", (CASE WHEN lower(c.text) LIKE ");
            qb.push_bind(like.clone());
            qb.push(" ESCAPE '\\' THEN 0.8 ELSE 0.0 END + CASE WHEN lower(d.title) LIKE ");
            qb.push_bind(like.clone());
            qb.push(" ESCAPE '\\' THEN 0.2 ELSE 0.0 END) AS ilike_score");
            qb.push(", COALESCE(f.fts_score, 0.0) AS fts_score");
            qb.push(" FROM chunk c JOIN document d ON d.id = c.document_id");
            qb.push(" JOIN source s ON s.id = d.source_id");
            match fts_query(needle) {
                Some(fts) => {
                    qb.push(
                        " LEFT JOIN (SELECT chunk_id, -bm25(chunk_fts) AS fts_score FROM chunk_fts WHERE chunk_fts MATCH ",
                    );
                    qb.push_bind(fts);
                    qb.push(") f ON f.chunk_id = c.id");
                }
                None => {
                    qb.push(" LEFT JOIN (SELECT NULL AS chunk_id, 0.0 AS fts_score WHERE 0) f ON f.chunk_id = c.id");
                }
            }
            qb.push(" WHERE (lower(c.text) LIKE ");
            qb.push_bind(like.clone());
            qb.push(" ESCAPE '\\' OR lower(d.title) LIKE ");
            qb.push_bind(like);
            qb.push(" ESCAPE '\\' OR f.chunk_id IS NOT NULL)");
            push_filters(&mut qb, filters);
            qb.push(" ORDER BY ilike_score + fts_score DESC, d.last_changed_at DESC LIMIT ");
            qb.push_bind(limit.max(0));

            let rows = qb.build().fetch_all(&self.pool).await?;
            candidates.extend(rows.iter().map(candidate_from_row));
        }

        if let Some(query_vec) = query_vec {
            let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT ");
            qb.push(CANDIDATE_COLUMNS);
            qb.push(", 0.0 AS ilike_score, 0.0 AS fts_score, e.vector");
            qb.push(" FROM chunk_embedding e JOIN chunk c ON c.id = e.chunk_id");
            qb.push(" JOIN document d ON d.id = c.document_id");
            qb.push(" JOIN source s ON s.id = d.source_id WHERE 1 = 1");
            push_filters(&mut qb, filters);

            let rows = qb.build().fetch_all(&self.pool).await?;
            let mut similarity: HashMap<String, f64> = HashMap::new();
            let mut semantic_only: Vec<Candidate> = Vec::new();
            let lexical: HashSet<String> = candidates.iter().map(|c| c.chunk_id.clone()).collect();

            for row in &rows {
                let blob: Vec<u8> = row.get("vector");
                let score = cosine_similarity(query_vec, &blob_to_vec(&blob)) as f64;
                let mut candidate = candidate_from_row(row);
                if lexical.contains(&candidate.chunk_id) {
                    similarity.insert(candidate.chunk_id, score);
                } else {
                    candidate.semantic_score = Some(score);
                    semantic_only.push(candidate);
                }
            }

            for candidate in &mut candidates {
                candidate.semantic_score = similarity.get(&candidate.chunk_id).copied();
            }

            semantic_only.sort_by(|a, b| {
                b.semantic_score
                    .partial_cmp(&a.semantic_score)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            semantic_only.truncate(limit.max(0) as usize);
            candidates.extend(semantic_only);
        }

        Ok(candidates)
    }

    async fn list_changes(&self, filter: &ChangeFilter) -> Result<Vec<ChangeEvent>> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT id, source_id, document_id, canonical_url, title, event_type, severity, \
             summary, details_json, detected_at FROM change_event WHERE 1 = 1",
        );
        if let Some(source) = &filter.source {
            qb.push(" AND source_id = ");
            qb.push_bind(source.clone());
        }
        if let Some(event_type) = filter.event_type {
            qb.push(" AND event_type = ");
            qb.push_bind(event_type.as_str());
        }
        if let Some(severity) = filter.severity {
            qb.push(" AND severity = ");
            qb.push_bind(severity.as_str());
        }
        qb.push(" ORDER BY detected_at DESC, rowid DESC LIMIT ");
        qb.push_bind(filter.limit.max(0));

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(event_from_row).collect()
    }
}
