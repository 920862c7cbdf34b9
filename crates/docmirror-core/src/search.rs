//! Retrieval path: candidate fetch, hybrid rerank, answer decision.
//!
//! [`Retriever::search`] returns reranked chunks. [`Retriever::answer`]
//! additionally applies the tenant [`SourcePolicy`], runs the decision
//! engine, and renders an answer with citations and freshness metadata.
//! Only store failures propagate as errors.

use std::collections::HashMap;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::decision::{decide, policy_blocked, Decision, DecisionEnvelope, DecisionStatus, SourcePolicy};
use crate::embedding::{embed_query, Embedder, QueryEmbeddingCache};
use crate::rerank::{rerank, Candidate, RankedResult};
use crate::store::{SearchFilters, Store};

/// Default number of citations an answer carries.
pub const DEFAULT_MAX_CITATIONS: usize = 5;
/// Default number of candidates fetched from the store before reranking.
pub const DEFAULT_CANDIDATE_LIMIT: i64 = 80;

const INSUFFICIENT_ANSWER: &str =
    "I could not find sufficient matching documentation in the selected sources.";
const NO_CITABLE_ANSWER: &str = "No citable evidence is available for this question.";
const UNSAFE_ANSWER: &str = "Potential prompt-injection instructions were detected in retrieved content. Manual review is required before acting on this guidance.";
const STALE_ANSWER: &str =
    "Sources are stale beyond policy threshold; sync sources before using this guidance.";
const POLICY_ANSWER: &str = "The requested sources are not permitted by the tenant policy.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AnswerStyle {
    #[default]
    Concise,
    Detailed,
}

#[derive(Debug, Clone)]
pub struct AnswerRequest {
    pub question: String,
    pub filters: SearchFilters,
    pub max_citations: usize,
    pub style: AnswerStyle,
}

impl AnswerRequest {
    pub fn new(question: &str) -> Self {
        Self {
            question: question.to_string(),
            filters: SearchFilters::default(),
            max_citations: DEFAULT_MAX_CITATIONS,
            style: AnswerStyle::Concise,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Citation {
    pub title: String,
    pub url: String,
    pub source: String,
    pub version_tag: Option<String>,
    pub last_changed_at: DateTime<Utc>,
}

impl From<&RankedResult> for Citation {
    fn from(r: &RankedResult) -> Self {
        Self {
            title: r.title.clone(),
            url: r.url.clone(),
            source: r.source.clone(),
            version_tag: r.version_tag.clone(),
            last_changed_at: r.last_changed_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Freshness {
    pub generated_at: DateTime<Utc>,
    pub max_source_age_minutes: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnswerResponse {
    pub answer: String,
    pub citations: Vec<Citation>,
    pub freshness: Freshness,
    pub warnings: Vec<String>,
    pub decision: DecisionEnvelope,
}

/// Read-side entry point over a [`Store`].
pub struct Retriever<'a> {
    pub store: &'a dyn Store,
    pub embedder: Option<&'a dyn Embedder>,
    pub cache: &'a QueryEmbeddingCache,
    pub candidate_limit: i64,
    pub stale_threshold_minutes: i64,
    pub max_query_chars: usize,
}

impl<'a> Retriever<'a> {
    async fn candidates(&self, query: &str, filters: &SearchFilters) -> Result<Vec<Candidate>> {
        let query_vec = match self.embedder {
            Some(embedder) => embed_query(embedder, self.cache, query, self.max_query_chars).await,
            None => None,
        };
        self.store
            .search_candidates(query, filters, query_vec.as_deref(), self.candidate_limit)
            .await
    }

    /// Hybrid search: the `top_k` best chunks for `query`.
    pub async fn search(
        &self,
        query: &str,
        filters: &SearchFilters,
        top_k: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<RankedResult>> {
        let candidates = self.candidates(query, filters).await?;
        Ok(rerank(query, candidates, top_k, now))
    }

    /// Answer a question under a tenant policy.
    pub async fn answer(
        &self,
        request: &AnswerRequest,
        policy: &SourcePolicy,
        now: DateTime<Utc>,
    ) -> Result<AnswerResponse> {
        let mut filters = request.filters.clone();
        if let Some(resolved) = policy.resolve_sources(&request.filters.sources) {
            if resolved.is_empty() {
                return Ok(render(request, &policy_blocked(), &[], now));
            }
            filters.sources = resolved;
        }

        let candidates = self.candidates(&request.question, &filters).await?;
        let before = candidates.len();

        let trust: HashMap<String, f64> = self
            .store
            .list_sources()
            .await?
            .into_iter()
            .map(|s| (s.id, s.trust_score))
            .collect();
        let permitted: Vec<Candidate> = candidates
            .into_iter()
            .filter(|c| policy.permits(&c.source, trust.get(&c.source).copied().unwrap_or(0.0)))
            .collect();

        if before > 0 && permitted.is_empty() {
            return Ok(render(request, &policy_blocked(), &[], now));
        }

        let results = rerank(&request.question, permitted, request.max_citations, now);
        let decision = decide(&results, self.stale_threshold_minutes, now);

        tracing::debug!(
            status = %decision.envelope.status,
            results = results.len(),
            confidence = decision.envelope.confidence,
            "answer decided"
        );

        Ok(render(request, &decision, &results, now))
    }
}

fn render(
    request: &AnswerRequest,
    decision: &Decision,
    results: &[RankedResult],
    now: DateTime<Utc>,
) -> AnswerResponse {
    let answer = match decision.envelope.status {
        DecisionStatus::PolicyBlocked => POLICY_ANSWER.to_string(),
        DecisionStatus::InsufficientSources if results.is_empty() => INSUFFICIENT_ANSWER.to_string(),
        DecisionStatus::InsufficientSources => NO_CITABLE_ANSWER.to_string(),
        DecisionStatus::UnsafeContent => UNSAFE_ANSWER.to_string(),
        DecisionStatus::StaleSources => STALE_ANSWER.to_string(),
        DecisionStatus::Grounded | DecisionStatus::ConflictDetected => {
            match (decision.cited.first(), request.style) {
                (Some(top), AnswerStyle::Detailed) => format!(
                    "Primary guidance from {}:\n{}\n\nThis response is grounded in indexed source content.",
                    top.source, top.text
                ),
                (Some(top), AnswerStyle::Concise) => top.text.clone(),
                (None, _) => NO_CITABLE_ANSWER.to_string(),
            }
        }
    };

    AnswerResponse {
        answer,
        citations: decision.cited.iter().map(Citation::from).collect(),
        freshness: Freshness {
            generated_at: now,
            max_source_age_minutes: decision.max_age_minutes,
        },
        warnings: decision.warnings.clone(),
        decision: decision.envelope.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Chunk, Document, FetchMetadata, Source, SourceKind};
    use crate::store::memory::InMemoryStore;
    use chrono::Duration;

    async fn seed(store: &InMemoryStore, source: &str, trust: f64, doc_id: &str, text: &str) {
        store
            .upsert_source(&Source {
                id: source.to_string(),
                name: source.to_string(),
                kind: SourceKind::Docs,
                base_url: format!("https://{}.example.com", source),
                trust_score: trust,
                poll_interval_minutes: 60,
            })
            .await
            .unwrap();
        let now = Utc::now();
        store
            .insert_document(&Document {
                id: doc_id.to_string(),
                source_id: source.to_string(),
                canonical_url: format!("https://{}.example.com/{}", source, doc_id),
                version_tag: None,
                title: format!("{} guide", source),
                language: "en".to_string(),
                content_hash: "h".to_string(),
                first_seen_at: now,
                last_seen_at: now,
                last_changed_at: now,
                fetch: FetchMetadata::default(),
            })
            .await
            .unwrap();
        store
            .replace_chunks(
                doc_id,
                &[Chunk {
                    id: format!("{}-c0", doc_id),
                    document_id: doc_id.to_string(),
                    chunk_index: 0,
                    text: text.to_string(),
                    token_count: 10,
                    heading_path: None,
                    code_lang: None,
                    valid_from: now,
                    valid_to: None,
                }],
                &[],
            )
            .await
            .unwrap();
    }

    fn retriever<'a>(store: &'a InMemoryStore, cache: &'a QueryEmbeddingCache) -> Retriever<'a> {
        Retriever {
            store,
            embedder: None,
            cache,
            candidate_limit: DEFAULT_CANDIDATE_LIMIT,
            stale_threshold_minutes: 1440,
            max_query_chars: 3500,
        }
    }

    #[tokio::test]
    async fn test_answer_grounded_concise_and_detailed() {
        let store = InMemoryStore::new();
        let cache = QueryEmbeddingCache::default();
        seed(&store, "stripe", 0.9, "d1", "Verify webhook signatures with the endpoint secret.").await;
        let r = retriever(&store, &cache);

        let resp = r
            .answer(&AnswerRequest::new("webhook signatures"), &SourcePolicy::default(), Utc::now())
            .await
            .unwrap();
        assert_eq!(resp.decision.status, DecisionStatus::Grounded);
        assert_eq!(resp.answer, "Verify webhook signatures with the endpoint secret.");
        assert_eq!(resp.citations.len(), 1);
        assert_eq!(resp.citations[0].source, "stripe");

        let mut detailed = AnswerRequest::new("webhook signatures");
        detailed.style = AnswerStyle::Detailed;
        let resp = r.answer(&detailed, &SourcePolicy::default(), Utc::now()).await.unwrap();
        assert!(resp.answer.starts_with("Primary guidance from stripe:\n"));
        assert!(resp.answer.ends_with("This response is grounded in indexed source content."));
    }

    #[tokio::test]
    async fn test_answer_insufficient_when_nothing_matches() {
        let store = InMemoryStore::new();
        let cache = QueryEmbeddingCache::default();
        seed(&store, "stripe", 0.9, "d1", "Verify webhook signatures.").await;

        let resp = retriever(&store, &cache)
            .answer(&AnswerRequest::new("kubernetes"), &SourcePolicy::default(), Utc::now())
            .await
            .unwrap();
        assert_eq!(resp.decision.status, DecisionStatus::InsufficientSources);
        assert_eq!(resp.answer, INSUFFICIENT_ANSWER);
        assert!(resp.citations.is_empty());
    }

    #[tokio::test]
    async fn test_answer_stale_sources() {
        let store = InMemoryStore::new();
        let cache = QueryEmbeddingCache::default();
        seed(&store, "stripe", 0.9, "d1", "Rotate API keys yearly.").await;
        store.set_last_changed_at("d1", Utc::now() - Duration::days(3));

        let resp = retriever(&store, &cache)
            .answer(&AnswerRequest::new("rotate keys"), &SourcePolicy::default(), Utc::now())
            .await
            .unwrap();
        assert_eq!(resp.decision.status, DecisionStatus::StaleSources);
        assert_eq!(resp.answer, STALE_ANSWER);
        assert!(resp.freshness.max_source_age_minutes >= 3 * 1440);
    }

    #[tokio::test]
    async fn test_answer_policy_blocked() {
        let store = InMemoryStore::new();
        let cache = QueryEmbeddingCache::default();
        seed(&store, "stripe", 0.3, "d1", "Verify webhook signatures.").await;
        let r = retriever(&store, &cache);

        let deny = SourcePolicy {
            deny_sources: vec!["stripe".into()],
            ..Default::default()
        };
        let mut request = AnswerRequest::new("webhook");
        request.filters.sources = vec!["stripe".into()];
        let resp = r.answer(&request, &deny, Utc::now()).await.unwrap();
        assert_eq!(resp.decision.status, DecisionStatus::PolicyBlocked);
        assert_eq!(resp.warnings, vec!["policy_blocked"]);

        let trust = SourcePolicy {
            min_trust_score: Some(0.5),
            ..Default::default()
        };
        let resp = r.answer(&AnswerRequest::new("webhook"), &trust, Utc::now()).await.unwrap();
        assert_eq!(resp.decision.status, DecisionStatus::PolicyBlocked);
        assert_eq!(resp.answer, POLICY_ANSWER);
    }

    #[tokio::test]
    async fn test_search_filters_by_source() {
        let store = InMemoryStore::new();
        let cache = QueryEmbeddingCache::default();
        seed(&store, "stripe", 0.9, "d1", "Webhook retries use exponential backoff.").await;
        seed(&store, "plaid", 0.9, "d2", "Webhook retries happen hourly.").await;
        let r = retriever(&store, &cache);

        let all = r.search("webhook retries", &SearchFilters::default(), 10, Utc::now()).await.unwrap();
        assert_eq!(all.len(), 2);

        let filters = SearchFilters {
            sources: vec!["plaid".into()],
            ..Default::default()
        };
        let scoped = r.search("webhook retries", &filters, 10, Utc::now()).await.unwrap();
        assert_eq!(scoped.len(), 1);
        assert_eq!(scoped[0].source, "plaid");
    }
}
