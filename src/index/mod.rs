//! Vector index generations.
//!
//! A [`Generation`] is an immutable build of the index: every passage, one
//! L2-normalized vector per passage, and the metadata needed to detect an
//! incompatible provider at load time. Similarity is the inner product of
//! normalized vectors, i.e. cosine similarity. Both stored vectors and query
//! vectors are normalized here, never by providers, so the metric cannot
//! drift between build time and query time.
//!
//! Submodules:
//! - [`persist`]: on-disk layout, `CURRENT` pointer, load validation.
//! - [`active`]: the single swappable pointer to the active generation.

pub mod active;
pub mod persist;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::embedding::EmbeddingProvider;
use crate::error::{IndexBuildError, SearchError};
use crate::models::{Passage, ScoredPassage};

pub use active::ActiveIndex;

/// On-disk format version written into `meta.json`.
pub const FORMAT_VERSION: u32 = 1;
/// The only supported metric: inner product over L2-normalized vectors.
pub const METRIC: &str = "cosine-normalized";

/// Metadata persisted alongside a generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationMeta {
    pub id: String,
    pub format_version: u32,
    pub model: String,
    pub dims: usize,
    pub metric: String,
    pub passage_count: usize,
    pub created_at: DateTime<Utc>,
    /// Hex SHA-256 over the serialized passages followed by the vector bytes.
    pub checksum: String,
}

/// One immutable build of the vector index.
#[derive(Debug)]
pub struct Generation {
    meta: GenerationMeta,
    passages: Vec<Passage>,
    /// Row-major, `passages.len() * meta.dims` values.
    vectors: Vec<f32>,
}

impl Generation {
    /// Embed every passage and assemble a new, not-yet-active generation.
    ///
    /// Passages are embedded in batches of `batch_size`. Any provider error
    /// aborts the build; nothing is substituted for a failed batch.
    pub async fn build(
        passages: Vec<Passage>,
        provider: &dyn EmbeddingProvider,
        batch_size: usize,
    ) -> Result<Generation, IndexBuildError> {
        let dims = provider.dims();
        let mut vectors = Vec::with_capacity(passages.len() * dims);
        let texts: Vec<String> = passages.iter().map(|p| p.text.clone()).collect();

        for (batch_idx, batch) in texts.chunks(batch_size.max(1)).enumerate() {
            let embedded = provider.embed_batch(batch).await?;
            crate::embedding::check_vectors(&embedded, batch.len(), dims)?;
            for mut vector in embedded {
                normalize(&mut vector);
                vectors.extend_from_slice(&vector);
            }
            tracing::debug!(batch = batch_idx, size = batch.len(), "embedded batch");
        }

        let checksum = checksum(&serde_json::to_vec(&passages)?, &persist::encode_vectors(&vectors));
        let meta = GenerationMeta {
            id: new_generation_id(),
            format_version: FORMAT_VERSION,
            model: provider.model_name().to_string(),
            dims,
            metric: METRIC.to_string(),
            passage_count: passages.len(),
            created_at: Utc::now(),
            checksum,
        };
        Ok(Generation {
            meta,
            passages,
            vectors,
        })
    }

    /// Assemble a generation from validated parts. Used by the loader.
    pub(crate) fn from_parts(meta: GenerationMeta, passages: Vec<Passage>, vectors: Vec<f32>) -> Self {
        Generation {
            meta,
            passages,
            vectors,
        }
    }

    pub fn id(&self) -> &str {
        &self.meta.id
    }

    pub fn meta(&self) -> &GenerationMeta {
        &self.meta
    }

    pub fn passages(&self) -> &[Passage] {
        &self.passages
    }

    pub fn dims(&self) -> usize {
        self.meta.dims
    }

    pub fn len(&self) -> usize {
        self.passages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.passages.is_empty()
    }

    pub(crate) fn vectors(&self) -> &[f32] {
        &self.vectors
    }

    fn vector(&self, i: usize) -> &[f32] {
        let dims = self.meta.dims;
        &self.vectors[i * dims..(i + 1) * dims]
    }

    /// The `k` passages most similar to `query`, best first.
    ///
    /// The query is normalized before scoring. Equal scores keep passage
    /// order. `k == 0` and an empty generation both yield no results.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<ScoredPassage>, SearchError> {
        if k == 0 || self.passages.is_empty() {
            return Ok(Vec::new());
        }
        if query.len() != self.meta.dims {
            return Err(SearchError::Dimension {
                expected: self.meta.dims,
                actual: query.len(),
            });
        }

        let mut query = query.to_vec();
        normalize(&mut query);

        let mut scored: Vec<(usize, f32)> = (0..self.passages.len())
            .map(|i| (i, dot(&query, self.vector(i))))
            .collect();
        let by_rank = |a: &(usize, f32), b: &(usize, f32)| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0));
        if k < scored.len() {
            scored.select_nth_unstable_by(k - 1, by_rank);
            scored.truncate(k);
        }
        scored.sort_by(by_rank);

        Ok(scored
            .into_iter()
            .map(|(i, score)| ScoredPassage {
                passage: self.passages[i].clone(),
                score,
            })
            .collect())
    }
}

/// Scale `v` to unit length. Zero vectors are left as is.
pub fn normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

pub(crate) fn checksum(passages_json: &[u8], vector_bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(passages_json);
    hasher.update(vector_bytes);
    hex::encode(hasher.finalize())
}

/// Whether `name` has the shape of an id from [`new_generation_id`]:
/// `YYYYMMDDTHHMMSSZ-` followed by eight lowercase hex digits.
pub(crate) fn is_generation_id(name: &str) -> bool {
    let Some((stamp, suffix)) = name.split_once('-') else {
        return false;
    };
    let stamp = stamp.as_bytes();
    stamp.len() == 16
        && stamp[8] == b'T'
        && stamp[15] == b'Z'
        && stamp[..8].iter().chain(&stamp[9..15]).all(u8::is_ascii_digit)
        && suffix.len() == 8
        && suffix.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

fn new_generation_id() -> String {
    format!(
        "{}-{}",
        Utc::now().format("%Y%m%dT%H%M%SZ"),
        &uuid::Uuid::new_v4().simple().to_string()[..8]
    )
}
