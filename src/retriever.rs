//! Query-time retrieval over the active generation.

use std::sync::Arc;

use crate::embedding::EmbeddingProvider;
use crate::error::ServiceError;
use crate::index::ActiveIndex;
use crate::models::{Passage, ScoredPassage};

/// Separator placed between passages in a prompt context.
pub const CONTEXT_SEPARATOR: &str = "\n\n";

#[derive(Clone)]
pub struct Retriever {
    index: Arc<ActiveIndex>,
    embedder: Arc<dyn EmbeddingProvider>,
    top_k: usize,
}

impl Retriever {
    pub fn new(index: Arc<ActiveIndex>, embedder: Arc<dyn EmbeddingProvider>, top_k: usize) -> Self {
        Self {
            index,
            embedder,
            top_k,
        }
    }

    pub fn top_k(&self) -> usize {
        self.top_k
    }

    /// Embed `query` (one provider call) and search the active generation.
    pub async fn search(&self, query: &str, k: usize) -> Result<Vec<ScoredPassage>, ServiceError> {
        let vector = self.embedder.embed(query).await?;
        let generation = self.index.snapshot();
        let results = generation.search(&vector, k)?;
        tracing::debug!(
            generation = generation.id(),
            k,
            hits = results.len(),
            "retrieved passages"
        );
        Ok(results)
    }

    /// The configured top-k passages for `query`, scores dropped.
    pub async fn retrieve(&self, query: &str) -> Result<Vec<Passage>, ServiceError> {
        Ok(self
            .search(query, self.top_k)
            .await?
            .into_iter()
            .map(|scored| scored.passage)
            .collect())
    }
}

/// Join passage texts into one prompt context block.
pub fn format_context(passages: &[Passage]) -> String {
    passages
        .iter()
        .map(|p| p.text.as_str())
        .collect::<Vec<_>>()
        .join(CONTEXT_SEPARATOR)
}
