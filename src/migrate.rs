//! Idempotent schema creation.
//!
//! Timestamps are stored as Unix milliseconds (`INTEGER`). A document
//! without a version tag stores `''` so the `(source_id, canonical_url,
//! version_tag)` uniqueness constraint holds (SQLite treats `NULL`s as
//! distinct).

use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

/// Open the configured database and apply the schema.
pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply_schema(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create every table and index if missing. Safe to run repeatedly.
pub async fn apply_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS source (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            kind TEXT NOT NULL,
            base_url TEXT NOT NULL,
            trust_score REAL NOT NULL DEFAULT 1.0,
            poll_interval_minutes INTEGER NOT NULL DEFAULT 60,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS document (
            id TEXT PRIMARY KEY,
            source_id TEXT NOT NULL,
            canonical_url TEXT NOT NULL,
            version_tag TEXT NOT NULL DEFAULT '',
            title TEXT NOT NULL,
            language TEXT NOT NULL DEFAULT 'en',
            content_hash TEXT NOT NULL,
            first_seen_at INTEGER NOT NULL,
            last_seen_at INTEGER NOT NULL,
            last_changed_at INTEGER NOT NULL,
            etag TEXT,
            last_modified TEXT,
            http_status INTEGER,
            checked_at INTEGER,
            UNIQUE(source_id, canonical_url, version_tag),
            FOREIGN KEY (source_id) REFERENCES source(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunk (
            id TEXT PRIMARY KEY,
            document_id TEXT NOT NULL,
            chunk_index INTEGER NOT NULL,
            text TEXT NOT NULL,
            token_count INTEGER NOT NULL,
            heading_path TEXT,
            code_lang TEXT,
            valid_from INTEGER NOT NULL,
            valid_to INTEGER,
            UNIQUE(document_id, chunk_index),
            FOREIGN KEY (document_id) REFERENCES document(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunk_embedding (
            chunk_id TEXT PRIMARY KEY,
            model TEXT NOT NULL,
            dims INTEGER NOT NULL,
            vector BLOB NOT NULL,
            FOREIGN KEY (chunk_id) REFERENCES chunk(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // No foreign key to document: events outlive content changes.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS change_event (
            id TEXT PRIMARY KEY,
            source_id TEXT NOT NULL,
            document_id TEXT NOT NULL,
            canonical_url TEXT NOT NULL,
            title TEXT NOT NULL,
            event_type TEXT NOT NULL,
            severity TEXT NOT NULL,
            summary TEXT NOT NULL,
            details_json TEXT NOT NULL DEFAULT '{}',
            detected_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS snapshot (
            id TEXT PRIMARY KEY,
            source_id TEXT NOT NULL,
            fetched_at INTEGER NOT NULL,
            status TEXT NOT NULL,
            error TEXT,
            raw_ref TEXT NOT NULL,
            parser_version TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS source_sync_request (
            id TEXT PRIMARY KEY,
            source_id TEXT NOT NULL,
            requested_at INTEGER NOT NULL,
            status TEXT NOT NULL DEFAULT 'queued',
            attempts INTEGER NOT NULL DEFAULT 0,
            available_at INTEGER NOT NULL,
            processed_at INTEGER,
            error TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    // FTS5 CREATE is not idempotent natively, so we check first
    let fts_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='chunk_fts'",
    )
    .fetch_one(pool)
    .await?;

    if !fts_exists {
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE chunk_fts USING fts5(
                chunk_id UNINDEXED,
                document_id UNINDEXED,
                text
            )
            "#,
        )
        .execute(pool)
        .await?;
    }

    let indexes = [
        "CREATE INDEX IF NOT EXISTS idx_document_source ON document(source_id)",
        "CREATE INDEX IF NOT EXISTS idx_document_changed ON document(last_changed_at DESC)",
        "CREATE INDEX IF NOT EXISTS idx_chunk_document ON chunk(document_id)",
        "CREATE INDEX IF NOT EXISTS idx_change_event_source ON change_event(source_id, detected_at DESC)",
        "CREATE INDEX IF NOT EXISTS idx_snapshot_source ON snapshot(source_id, fetched_at DESC)",
        "CREATE INDEX IF NOT EXISTS idx_sync_request_status ON source_sync_request(status, available_at)",
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_sync_request_pending ON source_sync_request(source_id) WHERE status IN ('queued', 'processing')",
    ];
    for sql in indexes {
        sqlx::query(sql).execute(pool).await?;
    }

    Ok(())
}
