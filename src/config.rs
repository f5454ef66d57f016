//! TOML configuration.
//!
//! Every tunable of the pipeline lives in one file (default
//! `./config/campus.toml`). Sections map one-to-one onto the structs below;
//! anything omitted falls back to the documented default.
//!
//! ```toml
//! [documents]
//! root = "./documents"
//!
//! [index]
//! dir = "./data/index"
//!
//! [chunking]
//! max_chars = 2000
//! overlap_chars = 300
//!
//! [retrieval]
//! top_k = 30
//!
//! [embedding]
//! provider = "gemini"
//! model = "text-embedding-004"
//! dims = 768
//!
//! [llm]
//! provider = "gemini"
//! model = "gemini-2.5-flash"
//!
//! [escalation]
//! db_path = "./data/escalations.sqlite"
//!
//! [server]
//! bind = "127.0.0.1:5000"
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Reply that marks a query for human follow-up. Must be reproduced verbatim
/// by the model; equality with this string is what creates an escalation.
pub const DEFAULT_ESCALATION_MESSAGE: &str =
    "We have received your query, soon our concerned department will contact you. Thank You!";

/// Reply for questions outside the institution's domain.
pub const DEFAULT_UNRELATED_MESSAGE: &str =
    "I’m the official assistant of this college. Please ask questions related to the college.";

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub documents: DocumentsConfig,
    pub index: IndexConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
    pub escalation: EscalationConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DocumentsConfig {
    pub root: PathBuf,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
}

fn default_max_file_bytes() -> u64 {
    50 * 1024 * 1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    pub dir: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,
    #[serde(default = "default_overlap_chars")]
    pub overlap_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chars: default_max_chars(),
            overlap_chars: default_overlap_chars(),
        }
    }
}

fn default_max_chars() -> usize {
    2000
}
fn default_overlap_chars() -> usize {
    300
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    /// Passages handed to the model per in-domain question. 3 is the
    /// conservative legacy setting; 30 suits long-context models.
    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
        }
    }
}

fn default_top_k() -> usize {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_disabled")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL override (OpenAI-compatible gateways, remote Ollama).
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_embedding_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_disabled(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_embedding_timeout_secs(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_disabled() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_embedding_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_disabled")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_disabled(),
            model: None,
            url: None,
            temperature: default_temperature(),
            timeout_secs: default_llm_timeout_secs(),
        }
    }
}

fn default_temperature() -> f32 {
    0.5
}
fn default_llm_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct PolicyConfig {
    #[serde(default = "default_assistant_name")]
    pub assistant_name: String,
    #[serde(default = "default_institution")]
    pub institution: String,
    #[serde(default = "default_escalation_message")]
    pub escalation_message: String,
    #[serde(default = "default_unrelated_message")]
    pub unrelated_message: String,
    /// Upper bound on one query's provider calls, end to end.
    #[serde(default = "default_query_timeout_secs")]
    pub query_timeout_secs: u64,
    #[serde(default = "default_true")]
    pub categorize_escalations: bool,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            assistant_name: default_assistant_name(),
            institution: default_institution(),
            escalation_message: default_escalation_message(),
            unrelated_message: default_unrelated_message(),
            query_timeout_secs: default_query_timeout_secs(),
            categorize_escalations: true,
        }
    }
}

fn default_assistant_name() -> String {
    "Campus Assistant".to_string()
}
fn default_institution() -> String {
    "the college".to_string()
}
fn default_escalation_message() -> String {
    DEFAULT_ESCALATION_MESSAGE.to_string()
}
fn default_unrelated_message() -> String {
    DEFAULT_UNRELATED_MESSAGE.to_string()
}
fn default_query_timeout_secs() -> u64 {
    120
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct EscalationConfig {
    pub db_path: PathBuf,
    /// Offset applied to escalation timestamps (330 = IST).
    #[serde(default = "default_utc_offset_minutes")]
    pub utc_offset_minutes: i32,
}

fn default_utc_offset_minutes() -> i32 {
    330
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:5000".to_string(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.validate()?;
    Ok(config)
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        // Validate chunking
        if self.chunking.max_chars == 0 {
            bail!("chunking.max_chars must be > 0");
        }
        if self.chunking.overlap_chars >= self.chunking.max_chars {
            bail!(
                "chunking.overlap_chars ({}) must be smaller than chunking.max_chars ({})",
                self.chunking.overlap_chars,
                self.chunking.max_chars
            );
        }

        // Validate retrieval
        if self.retrieval.top_k < 1 {
            bail!("retrieval.top_k must be >= 1");
        }

        // Validate embedding
        match self.embedding.provider.as_str() {
            "openai" | "ollama" | "gemini" => {
                if self.embedding.dims.is_none() || self.embedding.dims == Some(0) {
                    bail!(
                        "embedding.dims must be > 0 when provider is '{}'",
                        self.embedding.provider
                    );
                }
                if self.embedding.model.is_none() {
                    bail!(
                        "embedding.model must be specified when provider is '{}'",
                        self.embedding.provider
                    );
                }
            }
            "disabled" | "hash" | "local" => {}
            other => bail!(
                "Unknown embedding provider: '{}'. Must be disabled, openai, ollama, gemini, hash, or local.",
                other
            ),
        }
        if self.embedding.batch_size == 0 {
            bail!("embedding.batch_size must be > 0");
        }

        // Validate llm
        match self.llm.provider.as_str() {
            "openai" | "ollama" | "gemini" => {
                if self.llm.model.is_none() {
                    bail!(
                        "llm.model must be specified when provider is '{}'",
                        self.llm.provider
                    );
                }
            }
            "disabled" => {}
            other => bail!(
                "Unknown llm provider: '{}'. Must be disabled, openai, ollama, or gemini.",
                other
            ),
        }

        // Validate trigger strings
        let escalation = self.policy.escalation_message.trim();
        let unrelated = self.policy.unrelated_message.trim();
        if escalation.is_empty() || unrelated.is_empty() {
            bail!("policy.escalation_message and policy.unrelated_message must not be empty");
        }
        if escalation == unrelated {
            bail!("policy.escalation_message and policy.unrelated_message must differ");
        }

        if self.escalation.utc_offset_minutes.abs() >= 24 * 60 {
            bail!("escalation.utc_offset_minutes must be within one day");
        }

        Ok(())
    }
}
