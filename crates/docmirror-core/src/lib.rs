//! # docmirror core
//!
//! Pure logic for docmirror: data models, URL policy, HTML extraction,
//! prompt-injection sanitization, structured chunking, change
//! classification, change-aware persistence, hybrid reranking, and the
//! answer decision engine.
//!
//! Storage and embeddings sit behind the [`store::Store`] and
//! [`embedding::Embedder`] traits. This crate contains no tokio, sqlx, or
//! HTTP client code; the `docmirror` app crate provides the SQLite store,
//! the crawler, the embedding providers, and the sync queue.

pub mod change;
pub mod chunk;
pub mod decision;
pub mod embedding;
pub mod extract;
pub mod models;
pub mod persist;
pub mod rerank;
pub mod sanitize;
pub mod search;
pub mod store;
pub mod url_policy;
