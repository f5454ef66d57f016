//! # Campus RAG
//!
//! Retrieval-augmented question answering over a college's documents.
//!
//! Staff drop documents (text, Markdown, PDF, Word, PowerPoint, Excel) into
//! a directory. A rebuild loads and chunks them, embeds every passage, and
//! atomically swaps in a new index generation. Student questions are
//! classified, answered from retrieved passages, and escalated to a human
//! when the passages do not contain the answer.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌─────────┐   ┌───────────┐   ┌──────────────┐
//! │  loader  │──▶│  chunk  │──▶│ embedding │──▶│    index     │
//! │ +extract │   │         │   │           │   │ (generation) │
//! └──────────┘   └─────────┘   └───────────┘   └──────┬───────┘
//!       ▲                                             │ snapshot
//!       │ rebuild                                     ▼
//! ┌──────────┐   ┌───────────┐   ┌──────────┐   ┌───────────┐
//! │ rebuild  │   │ assistant │──▶│  policy  │──▶│ retriever │
//! └──────────┘   └─────┬─────┘   │  + llm   │   └───────────┘
//!                      ▼         └──────────┘
//!               ┌────────────┐
//!               │ escalation │
//!               └────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`error`] | Typed error taxonomy |
//! | [`extract`] | File type → text extractors |
//! | [`loader`] | Document loading |
//! | [`chunk`] | Recursive character chunking |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`index`] | Index generations, persistence, active pointer |
//! | [`retriever`] | Top-k retrieval and context formatting |
//! | [`llm`] | Completion providers |
//! | [`policy`] | Intent classification, prompts, trigger detection |
//! | [`escalation`] | Escalation log backends |
//! | [`rebuild`] | Rebuild orchestration |
//! | [`assistant`] | Per-query handling |
//! | [`server`] | HTTP server |

pub mod assistant;
pub mod chunk;
pub mod config;
pub mod embedding;
pub mod error;
pub mod escalation;
pub mod extract;
mod http;
pub mod index;
pub mod llm;
pub mod loader;
pub mod models;
pub mod policy;
pub mod rebuild;
pub mod retriever;
pub mod server;
