//! `search` and `answer` commands.
//!
//! Both go through the core [`Retriever`] over the SQLite store, with the
//! configured embedder (if any) providing the semantic half of the hybrid
//! score. `search` prints ranked chunks; `answer` prints the full
//! [`AnswerResponse`] as JSON.

use anyhow::Result;
use chrono::Utc;

use docmirror_core::embedding::{Embedder, QueryEmbeddingCache};
use docmirror_core::rerank::RankedResult;
use docmirror_core::search::{AnswerRequest, AnswerResponse, AnswerStyle, Retriever};
use docmirror_core::store::{SearchFilters, Store};

use crate::config::Config;

/// Build a retriever over `store` with the configured limits.
pub fn retriever<'a>(
    config: &Config,
    store: &'a dyn Store,
    embedder: Option<&'a dyn Embedder>,
    cache: &'a QueryEmbeddingCache,
) -> Retriever<'a> {
    Retriever {
        store,
        embedder,
        cache,
        candidate_limit: config.retrieval.candidate_limit,
        stale_threshold_minutes: config.answer.stale_threshold_minutes,
        max_query_chars: config.embedding.max_chars_per_input,
    }
}

/// Options of the `search` command.
#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    pub sources: Vec<String>,
    pub version: Option<String>,
    pub limit: Option<usize>,
}

pub async fn search_docs(
    config: &Config,
    store: &dyn Store,
    embedder: Option<&dyn Embedder>,
    query: &str,
    options: &SearchOptions,
) -> Result<Vec<RankedResult>> {
    let cache = QueryEmbeddingCache::new(config.embedding.query_cache_size);
    let filters = SearchFilters {
        sources: options.sources.clone(),
        version: options.version.clone(),
        ..Default::default()
    };
    let top_k = options.limit.unwrap_or(config.retrieval.top_k).max(1);
    retriever(config, store, embedder, &cache)
        .search(query, &filters, top_k, Utc::now())
        .await
}

pub async fn run_search(
    config: &Config,
    store: &dyn Store,
    embedder: Option<&dyn Embedder>,
    query: &str,
    options: &SearchOptions,
) -> Result<()> {
    let results = search_docs(config, store, embedder, query, options).await?;
    if results.is_empty() {
        println!("No results.");
        return Ok(());
    }

    for (i, result) in results.iter().enumerate() {
        println!("{}. [{:.2}] {}", i + 1, result.score, result.title);
        println!("    source: {}", result.source);
        println!("    url: {}", result.url);
        if let Some(heading) = &result.heading_path {
            println!("    section: {}", heading);
        }
        println!(
            "    version: {}",
            result.version_tag.as_deref().unwrap_or("latest")
        );
        println!(
            "    changed: {}",
            result.last_changed_at.format("%Y-%m-%d %H:%M")
        );
        println!("    snippet: \"{}\"", snippet(&result.text, 200));
        println!();
    }
    Ok(())
}

fn snippet(text: &str, max_chars: usize) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= max_chars {
        return flat;
    }
    let cut: String = flat.chars().take(max_chars).collect();
    format!("{}...", cut.trim_end())
}

/// Options of the `answer` command.
#[derive(Debug, Clone, Default)]
pub struct AnswerOptions {
    pub tenant: Option<String>,
    pub sources: Vec<String>,
    pub detailed: bool,
}

pub async fn answer_question(
    config: &Config,
    store: &dyn Store,
    embedder: Option<&dyn Embedder>,
    question: &str,
    options: &AnswerOptions,
) -> Result<AnswerResponse> {
    let policy = config.tenant_policy(options.tenant.as_deref())?;
    let cache = QueryEmbeddingCache::new(config.embedding.query_cache_size);

    let mut request = AnswerRequest::new(question);
    request.filters.sources = options.sources.clone();
    request.max_citations = config.retrieval.top_k;
    if options.detailed {
        request.style = AnswerStyle::Detailed;
    }

    retriever(config, store, embedder, &cache)
        .answer(&request, &policy, Utc::now())
        .await
}

pub async fn run_answer(
    config: &Config,
    store: &dyn Store,
    embedder: Option<&dyn Embedder>,
    question: &str,
    options: &AnswerOptions,
) -> Result<()> {
    let response = answer_question(config, store, embedder, question, options).await?;
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;
    use docmirror_core::decision::DecisionStatus;
    use docmirror_core::models::{Chunk, Document, FetchMetadata, Source, SourceKind};
    use docmirror_core::store::memory::InMemoryStore;

    const CONFIG: &str = r#"
[db]
path = "./data/docmirror.sqlite"

[tenants.acme]
allow_sources = ["plaid"]

[[sources]]
id = "stripe"
kind = "docs"
base_url = "https://docs.stripe.com"
trust_score = 0.9
"#;

    async fn seeded() -> InMemoryStore {
        let store = InMemoryStore::new();
        let now = Utc::now();
        store
            .upsert_source(&Source {
                id: "stripe".into(),
                name: "Stripe".into(),
                kind: SourceKind::Docs,
                base_url: "https://docs.stripe.com".into(),
                trust_score: 0.9,
                poll_interval_minutes: 60,
            })
            .await
            .unwrap();
        let doc = Document {
            id: "doc-webhooks".into(),
            source_id: "stripe".into(),
            canonical_url: "https://docs.stripe.com/webhooks".into(),
            title: "Webhooks".into(),
            version_tag: None,
            language: "en".into(),
            content_hash: "h".into(),
            first_seen_at: now,
            last_seen_at: now,
            last_changed_at: now,
            fetch: FetchMetadata::default(),
        };
        store.insert_document(&doc).await.unwrap();
        store
            .replace_chunks(
                &doc.id,
                &[Chunk {
                    id: "chunk-1".into(),
                    document_id: doc.id.clone(),
                    chunk_index: 0,
                    text: "Verify webhook signatures with the signing secret before trusting events."
                        .into(),
                    heading_path: Some("Signatures".into()),
                    code_lang: None,
                    token_count: 11,
                    valid_from: now,
                    valid_to: None,
                }],
                &[],
            )
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_search_docs_returns_ranked_chunk() {
        let config = parse_config(CONFIG).unwrap();
        let store = seeded().await;
        let results = search_docs(
            &config,
            &store,
            None,
            "webhook signatures",
            &SearchOptions::default(),
        )
        .await
        .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].url, "https://docs.stripe.com/webhooks");
        assert_eq!(results[0].heading_path.as_deref(), Some("Signatures"));
    }

    #[tokio::test]
    async fn test_answer_question_grounded_and_policy_blocked() {
        let config = parse_config(CONFIG).unwrap();
        let store = seeded().await;

        let response = answer_question(
            &config,
            &store,
            None,
            "how do I verify webhook signatures",
            &AnswerOptions::default(),
        )
        .await
        .unwrap();
        assert_eq!(response.decision.status, DecisionStatus::Grounded);
        assert_eq!(response.citations.len(), 1);

        let blocked = answer_question(
            &config,
            &store,
            None,
            "how do I verify webhook signatures",
            &AnswerOptions {
                tenant: Some("acme".into()),
                sources: vec!["stripe".into()],
                detailed: false,
            },
        )
        .await
        .unwrap();
        assert_eq!(blocked.decision.status, DecisionStatus::PolicyBlocked);
    }

    #[tokio::test]
    async fn test_answer_unknown_tenant_is_error() {
        let config = parse_config(CONFIG).unwrap();
        let store = seeded().await;
        let options = AnswerOptions {
            tenant: Some("nobody".into()),
            ..Default::default()
        };
        assert!(answer_question(&config, &store, None, "webhooks", &options)
            .await
            .is_err());
    }

    #[test]
    fn test_snippet_flattens_and_truncates() {
        assert_eq!(snippet("a\n\nb   c", 20), "a b c");
        assert_eq!(snippet("abcdef", 3), "abc...");
    }
}
