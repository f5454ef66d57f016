//! Core data models shared by the indexing and answering pipelines.
//!
//! Documents flow out of the [`loader`](crate::loader), are split into
//! [`Passage`]s by the [`chunk`](crate::chunk) module, and passages are what
//! an index generation stores and what retrieval returns.

use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// File type as detected from the extension (or content sniffing for
/// unknown extensions).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    Text,
    Markdown,
    Pdf,
    Word,
    Presentation,
    Spreadsheet,
}

impl DocumentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentKind::Text => "text",
            DocumentKind::Markdown => "markdown",
            DocumentKind::Pdf => "pdf",
            DocumentKind::Word => "word",
            DocumentKind::Presentation => "presentation",
            DocumentKind::Spreadsheet => "spreadsheet",
        }
    }
}

/// A source file after text extraction.
///
/// Identity is `path`: the `/`-separated path relative to the document root.
#[derive(Debug, Clone)]
pub struct Document {
    pub path: String,
    pub kind: DocumentKind,
    pub text: String,
    pub modified: DateTime<Utc>,
    pub size_bytes: u64,
}

/// A bounded slice of one document's text; the unit of retrieval.
///
/// Passages are derived data: they are regenerated on every rebuild and
/// owned by the generation that embedded them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Passage {
    /// Deterministic id derived from `source` and `position`.
    pub id: String,
    /// Relative path of the source document.
    pub source: String,
    /// Zero-based order of this passage within its source.
    pub position: u32,
    pub text: String,
    /// SHA-256 of `text`.
    pub hash: String,
}

/// A passage with its similarity to the query.
#[derive(Debug, Clone, Serialize)]
pub struct ScoredPassage {
    pub passage: Passage,
    pub score: f32,
}

/// Caller-supplied identity attached to a query. Passed through to the
/// escalation log, never persisted otherwise.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Requester {
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
}

/// One user question.
#[derive(Debug, Clone)]
pub struct Query {
    pub text: String,
    pub requester: Requester,
}

/// Lifecycle of an escalated query. Only the external resolution workflow
/// moves a record from `Initiated` to `Finished`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EscalationStatus {
    Initiated,
    Finished,
}

impl EscalationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EscalationStatus::Initiated => "Initiated",
            EscalationStatus::Finished => "Finished",
        }
    }
}

impl fmt::Display for EscalationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EscalationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "initiated" => Ok(EscalationStatus::Initiated),
            "finished" => Ok(EscalationStatus::Finished),
            other => Err(format!(
                "unknown escalation status '{}': expected Initiated or Finished",
                other
            )),
        }
    }
}

/// Department bucket used to route an escalated query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryCategory {
    Admission,
    Hostel,
    #[serde(rename = "Campus-Facility")]
    CampusFacility,
    Placement,
    General,
}

impl QueryCategory {
    pub const ALL: [QueryCategory; 5] = [
        QueryCategory::Admission,
        QueryCategory::Hostel,
        QueryCategory::CampusFacility,
        QueryCategory::Placement,
        QueryCategory::General,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueryCategory::Admission => "Admission",
            QueryCategory::Hostel => "Hostel",
            QueryCategory::CampusFacility => "Campus-Facility",
            QueryCategory::Placement => "Placement",
            QueryCategory::General => "General",
        }
    }

    /// Parse a model-produced label. Whitespace, newlines and periods are
    /// stripped; anything outside the fixed set is `General`.
    pub fn from_label(label: &str) -> Self {
        let cleaned: String = label
            .trim()
            .chars()
            .filter(|c| *c != '\n' && *c != '\r' && *c != '.')
            .collect();
        QueryCategory::ALL
            .into_iter()
            .find(|c| c.as_str() == cleaned)
            .unwrap_or(QueryCategory::General)
    }
}

/// Fields the core supplies when appending an escalation.
#[derive(Debug, Clone)]
pub struct NewEscalation {
    pub timestamp: DateTime<FixedOffset>,
    pub requester: Requester,
    pub query_text: String,
    pub answer_text: String,
    pub category: QueryCategory,
}

/// A stored escalation as seen by the resolution workflow.
#[derive(Debug, Clone, Serialize)]
pub struct EscalationRecord {
    pub id: i64,
    pub timestamp: String,
    pub user_name: String,
    pub email: String,
    pub phone_number: String,
    pub query_text: String,
    pub bot_response: String,
    pub status: EscalationStatus,
    pub remarks: String,
    pub category: String,
}

/// Placeholder written for identity fields the caller did not supply.
pub const NOT_PROVIDED: &str = "Not Provided";
