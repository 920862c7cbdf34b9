//! # docmirror
//!
//! A change-aware local mirror of third-party developer documentation.
//!
//! docmirror crawls configured documentation sites, extracts and sanitizes
//! their pages, records what changed between crawls (added pages, updates,
//! deprecations, breaking changes), and answers questions from the mirrored
//! text with citations and an explicit decision about whether the answer
//! can be trusted.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────┐   ┌─────────────┐
//! │   Crawler   │──▶│   Persister   │──▶│   SQLite    │
//! │ fetch+clean │   │ diff+classify │   │ FTS5 + vecs │
//! └──────▲──────┘   └──────────────┘   └──────┬──────┘
//!        │                                    │
//! ┌──────┴──────┐                       ┌─────▼──────┐
//! │ Sync queue  │                       │  Retriever │
//! │  + workers  │                       │ + decision │
//! └─────────────┘                       └────────────┘
//! ```
//!
//! Pure logic (extraction, chunking, change classification, reranking, the
//! answer decision engine) lives in the `docmirror-core` crate. This crate
//! adds the I/O around it.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`db`] | SQLite connection pool |
//! | [`migrate`] | Idempotent schema creation |
//! | [`sqlite_store`] | `Store` implementation on SQLite + FTS5 |
//! | [`fetch`] | HTTP page fetcher with timeouts, retries, conditional GET |
//! | [`crawl`] | Bounded breadth-first crawl of one source |
//! | [`embedding`] | OpenAI-compatible and Ollama embedding providers |
//! | [`queue`] | Persistent sync queue with retry and backoff |
//! | [`worker`] | Sync job handler and worker pool |
//! | [`notify`] | Change alert rendering and webhook delivery |
//! | [`sources`] | Source listing with sync health |
//! | [`ingest`] | `sync` and `worker` commands |
//! | [`search`] | `search` and `answer` commands |
//! | [`changes`] | `changes` command |

pub mod changes;
pub mod config;
pub mod crawl;
pub mod db;
pub mod embedding;
pub mod fetch;
pub mod ingest;
pub mod migrate;
pub mod notify;
pub mod queue;
pub mod search;
pub mod sources;
pub mod sqlite_store;
pub mod worker;
