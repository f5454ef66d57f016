//! Typed failures of the indexing and answering pipelines.
//!
//! Per-file problems ([`DocumentReadError`]) are absorbed by the loader.
//! Provider and index failures propagate to whoever started the operation:
//! a query ([`ServiceError`]) or a rebuild ([`IndexBuildError`]).

use std::path::PathBuf;
use thiserror::Error;

/// Text extraction failed for one file's bytes.
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("unsupported binary content")]
    UnsupportedBinary,
    #[error("PDF extraction failed: {0}")]
    Pdf(String),
    #[error("OOXML extraction failed: {0}")]
    Ooxml(String),
}

/// One document could not be loaded. Never fatal to a load.
#[derive(Debug, Error)]
pub enum DocumentReadError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{path} is {size} bytes, over the {limit} byte limit")]
    TooLarge { path: String, size: u64, limit: u64 },
    #[error("{path}: {source}")]
    Extract {
        path: String,
        #[source]
        source: ExtractError,
    },
    #[error("{path}: no extractable text")]
    Empty { path: String },
}

impl DocumentReadError {
    pub fn path(&self) -> &str {
        match self {
            DocumentReadError::Io { path, .. }
            | DocumentReadError::TooLarge { path, .. }
            | DocumentReadError::Extract { path, .. }
            | DocumentReadError::Empty { path } => path,
        }
    }
}

/// The embedding provider failed. Never papered over with zero vectors.
#[derive(Debug, Error)]
pub enum EmbeddingProviderError {
    #[error("embedding provider is disabled")]
    Disabled,
    #[error("{provider} credentials missing: {message}")]
    Auth { provider: String, message: String },
    #[error("{provider} request timed out after {secs}s")]
    Timeout { provider: String, secs: u64 },
    #[error("{provider} API error {status}: {body}")]
    Http {
        provider: String,
        status: u16,
        body: String,
    },
    #[error("{provider} connection error: {message}")]
    Network { provider: String, message: String },
    #[error("invalid {provider} response: {message}")]
    InvalidResponse { provider: String, message: String },
    #[error("provider returned {actual} vectors for {expected} inputs")]
    CountMismatch { expected: usize, actual: usize },
    #[error("provider returned a {actual}-dimensional vector, expected {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
}

/// The completion provider failed. Surfaced as a service error, never
/// mapped onto a trigger string.
#[derive(Debug, Error)]
pub enum LlmProviderError {
    #[error("language model provider is disabled")]
    Disabled,
    #[error("{provider} credentials missing: {message}")]
    Auth { provider: String, message: String },
    #[error("{provider} request timed out after {secs}s")]
    Timeout { provider: String, secs: u64 },
    #[error("{provider} API error {status}: {body}")]
    Http {
        provider: String,
        status: u16,
        body: String,
    },
    #[error("{provider} connection error: {message}")]
    Network { provider: String, message: String },
    #[error("invalid {provider} response: {message}")]
    InvalidResponse { provider: String, message: String },
}

/// A persisted generation is missing, corrupt, or incompatible with the
/// configured embedding provider. Nothing partially loaded is ever returned.
#[derive(Debug, Error)]
pub enum IndexLoadError {
    #[error("no persisted index at {0}")]
    NotFound(PathBuf),
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("corrupt index at {path}: {message}")]
    Corrupt { path: PathBuf, message: String },
    #[error("index format version {found} is not supported (expected {expected})")]
    FormatVersion { found: u32, expected: u32 },
    #[error("index metric '{found}' does not match '{expected}'")]
    Metric { found: String, expected: String },
    #[error("index was built with model '{stored}', configured model is '{configured}'")]
    Model { stored: String, configured: String },
    #[error("index has {stored}-dimensional vectors, configured provider produces {configured}")]
    Dimension { stored: usize, configured: usize },
}

/// A rebuild failed before activation; the previous generation stays active.
#[derive(Debug, Error)]
pub enum IndexBuildError {
    #[error("embedding failed: {0}")]
    Embedding(#[from] EmbeddingProviderError),
    #[error("failed to write index at {path}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize index: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("rebuild task failed: {0}")]
    Task(String),
}

/// Searching a generation with an incompatible query vector.
#[derive(Debug, Error)]
pub enum SearchError {
    #[error("query vector has {actual} dimensions, index has {expected}")]
    Dimension { expected: usize, actual: usize },
}

#[derive(Debug, Error)]
pub enum EscalationLogError {
    #[error("escalation database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("escalation record {0} not found")]
    NotFound(i64),
    #[error("failed to prepare escalation database at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Anything that prevents a query from producing a legitimate reply.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Embedding(#[from] EmbeddingProviderError),
    #[error(transparent)]
    Llm(#[from] LlmProviderError),
    #[error(transparent)]
    Search(#[from] SearchError),
    #[error("query exceeded its {0}s deadline")]
    Deadline(u64),
}
