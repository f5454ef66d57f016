//! Query handling: policy, trigger detection, escalation append.
//!
//! Trigger detection runs exactly once per successful completion, and at
//! most one escalation record is appended per query. Provider failures and
//! deadline expiry are returned as [`ServiceError`]s, which callers render as
//! [`INTERNAL_ERROR_MESSAGE`], never as either trigger string.

use chrono::{FixedOffset, Offset, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::error::ServiceError;
use crate::escalation::EscalationLog;
use crate::models::{NewEscalation, Query, QueryCategory};
use crate::policy::{AnswerPolicy, Decision, Intent};

/// Generic failure text shown to users.
pub const INTERNAL_ERROR_MESSAGE: &str = "An internal server error occurred";

#[derive(Debug, Clone)]
pub struct Reply {
    pub answer: String,
    pub intent: Intent,
    pub decision: Decision,
    /// Set when an escalation record was written for this query.
    pub escalation_id: Option<i64>,
    pub category: Option<QueryCategory>,
}

pub struct Assistant {
    policy: AnswerPolicy,
    log: Arc<dyn EscalationLog>,
    utc_offset: FixedOffset,
}

impl Assistant {
    pub fn new(policy: AnswerPolicy, log: Arc<dyn EscalationLog>, utc_offset_minutes: i32) -> Self {
        let utc_offset =
            FixedOffset::east_opt(utc_offset_minutes * 60).unwrap_or_else(|| Utc.fix());
        Self {
            policy,
            log,
            utc_offset,
        }
    }

    pub fn policy(&self) -> &AnswerPolicy {
        &self.policy
    }

    pub fn escalation_log(&self) -> Arc<dyn EscalationLog> {
        self.log.clone()
    }

    /// Answer one query within the configured deadline.
    pub async fn handle(&self, query: &Query) -> Result<Reply, ServiceError> {
        let secs = self.policy.config().query_timeout_secs;
        let deadline = Instant::now() + Duration::from_secs(secs);

        let outcome = tokio::time::timeout_at(deadline, self.policy.respond(&query.text))
            .await
            .map_err(|_| ServiceError::Deadline(secs))??;

        let mut reply = Reply {
            answer: outcome.answer,
            intent: outcome.intent,
            decision: outcome.decision,
            escalation_id: None,
            category: None,
        };
        if !reply.decision.is_escalation() {
            return Ok(reply);
        }

        tracing::info!(
            intent = reply.intent.as_str(),
            passages = outcome.passages_used,
            "escalation trigger detected"
        );
        let category = self.categorize(&query.text, deadline).await;
        reply.category = Some(category);

        let entry = NewEscalation {
            timestamp: Utc::now().with_timezone(&self.utc_offset),
            requester: query.requester.clone(),
            query_text: query.text.clone(),
            answer_text: reply.answer.clone(),
            category,
        };
        match self.log.record_escalation(entry).await {
            Ok(id) => {
                tracing::info!(id, category = category.as_str(), "escalation recorded");
                reply.escalation_id = Some(id);
            }
            // The user still gets the escalation reply; staff lose the record.
            Err(e) => tracing::error!(error = %e, "failed to record escalation"),
        }
        Ok(reply)
    }

    async fn categorize(&self, question: &str, deadline: Instant) -> QueryCategory {
        if !self.policy.config().categorize_escalations {
            return QueryCategory::General;
        }
        match tokio::time::timeout_at(deadline, self.policy.categorize(question)).await {
            Ok(Ok(category)) => category,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "escalation categorization failed; using General");
                QueryCategory::General
            }
            Err(_) => {
                tracing::warn!("escalation categorization hit the query deadline; using General");
                QueryCategory::General
            }
        }
    }
}
