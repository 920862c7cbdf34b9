//! Embedding provider trait and vector utilities.
//!
//! Defines the [`Embedder`] trait that all embedding backends implement,
//! pure helpers for normalization, similarity, and BLOB serialization, and
//! the bounded [`QueryEmbeddingCache`] shared by concurrent queries.
//!
//! Concrete HTTP providers (OpenAI-compatible, Ollama) live in the
//! `docmirror` app crate.

use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use indexmap::IndexMap;

/// Default number of query embeddings kept by [`QueryEmbeddingCache`].
pub const DEFAULT_QUERY_CACHE_SIZE: usize = 200;

/// A text → unit-vector function.
///
/// Providers never fail past this boundary: a disabled provider or any
/// transport/decoding error yields `None` for the whole batch, and a single
/// unusable vector yields `None` in its slot.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Model identifier stored next to each vector, as `provider:model`.
    fn model_id(&self) -> String;

    /// Embed a batch of texts, one slot per input.
    async fn embed(&self, texts: &[String]) -> Option<Vec<Option<Vec<f32>>>>;
}

/// Scale a vector to unit length, dropping non-finite components.
///
/// Returns `None` when nothing finite remains or the magnitude is zero.
pub fn normalize_vector(values: &[f32]) -> Option<Vec<f32>> {
    let clean: Vec<f32> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if clean.is_empty() {
        return None;
    }

    let magnitude = clean.iter().map(|v| v * v).sum::<f32>().sqrt();
    if magnitude <= 0.0 || !magnitude.is_finite() {
        return None;
    }

    Some(clean.into_iter().map(|v| v / magnitude).collect())
}

/// Trim whitespace and cap the input at `max_chars` characters.
pub fn trim_input(value: &str, max_chars: usize) -> String {
    value.trim().chars().take(max_chars).collect()
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
///
/// # Example
///
/// ```rust
/// use docmirror_core::embedding::{vec_to_blob, blob_to_vec};
///
/// let v = vec![1.0f32, -2.5, 3.125];
/// let blob = vec_to_blob(&v);
/// assert_eq!(blob.len(), 12);
/// assert_eq!(blob_to_vec(&blob), v);
/// ```
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB produced by [`vec_to_blob`].
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity in `[-1.0, 1.0]`.
///
/// Returns `0.0` for empty vectors or vectors of different lengths.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    (dot / denom).clamp(-1.0, 1.0)
}

/// Bounded cache of query embeddings, safe for concurrent use.
///
/// A hit moves the entry to the back; when the cache grows past its
/// capacity the entry at the front (the oldest inserted or touched) is
/// evicted.
pub struct QueryEmbeddingCache {
    capacity: usize,
    entries: Mutex<IndexMap<String, Vec<f32>>>,
}

impl QueryEmbeddingCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(IndexMap::new()),
        }
    }

    fn entries(&self) -> MutexGuard<'_, IndexMap<String, Vec<f32>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, key: &str) -> Option<Vec<f32>> {
        let mut entries = self.entries();
        let hit = entries.shift_remove(key)?;
        entries.insert(key.to_string(), hit.clone());
        Some(hit)
    }

    pub fn insert(&self, key: String, vector: Vec<f32>) {
        let mut entries = self.entries();
        entries.shift_remove(&key);
        entries.insert(key, vector);
        while entries.len() > self.capacity {
            entries.shift_remove_index(0);
        }
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for QueryEmbeddingCache {
    fn default() -> Self {
        Self::new(DEFAULT_QUERY_CACHE_SIZE)
    }
}

/// Embed a query through `cache`.
///
/// The input is trimmed and capped at `max_chars`; the cache key includes
/// the model id so switching providers never returns stale vectors.
/// Returns `None` for blank input or when the provider yields nothing.
pub async fn embed_query(
    embedder: &dyn Embedder,
    cache: &QueryEmbeddingCache,
    text: &str,
    max_chars: usize,
) -> Option<Vec<f32>> {
    let input = trim_input(text, max_chars);
    if input.is_empty() {
        return None;
    }

    let key = format!("{}:{}", embedder.model_id(), input);
    if let Some(hit) = cache.get(&key) {
        return Some(hit);
    }

    let vector = embedder
        .embed(std::slice::from_ref(&input))
        .await?
        .into_iter()
        .next()
        .flatten()
        .and_then(|v| normalize_vector(&v))?;
    cache.insert(key, vector.clone());
    Some(vector)
}
