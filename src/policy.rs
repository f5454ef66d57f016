//! Answer policy: intent classification, prompt construction, and trigger
//! detection.
//!
//! Each query goes through one pass:
//!
//! 1. The model labels the query `small_talk`, `college` or `unrelated`.
//!    Any other label is treated as `unrelated`.
//! 2. Small talk is answered from general knowledge with no retrieval.
//!    College questions are answered from retrieved context only.
//!    Unrelated questions get the configured refusal string verbatim.
//! 3. The trimmed output is compared byte-for-byte against the escalation
//!    string. Equality is the only escalation signal; [`Decision`] is derived
//!    from that comparison, never the other way around.

use std::sync::Arc;

use crate::config::PolicyConfig;
use crate::error::{LlmProviderError, ServiceError};
use crate::llm::LanguageModel;
use crate::models::QueryCategory;
use crate::retriever::{format_context, Retriever};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    SmallTalk,
    College,
    Unrelated,
}

impl Intent {
    pub fn as_str(self) -> &'static str {
        match self {
            Intent::SmallTalk => "small_talk",
            Intent::College => "college",
            Intent::Unrelated => "unrelated",
        }
    }

    /// Parse a model-produced label, defaulting to `Unrelated`.
    pub fn from_label(label: &str) -> Self {
        let cleaned: String = label
            .trim()
            .trim_matches(|c: char| c == '.' || c == '"' || c == '\'' || c == '*' || c == '`')
            .to_lowercase()
            .replace(|c: char| c == ' ' || c == '-', "_");
        match cleaned.as_str() {
            "small_talk" => Intent::SmallTalk,
            "college" => Intent::College,
            _ => Intent::Unrelated,
        }
    }
}

/// Structured reading of a policy output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// A legitimate answer to show the user.
    Answered(String),
    /// The output was the escalation string: a human must follow up.
    Escalate(String),
    /// The output was the unrelated-topic string.
    Refused(String),
}

impl Decision {
    pub fn kind(&self) -> &'static str {
        match self {
            Decision::Answered(_) => "answered",
            Decision::Escalate(_) => "escalate",
            Decision::Refused(_) => "refused",
        }
    }

    pub fn is_escalation(&self) -> bool {
        matches!(self, Decision::Escalate(_))
    }
}

/// What the policy produced for one query.
#[derive(Debug, Clone)]
pub struct PolicyOutcome {
    pub intent: Intent,
    /// The text shown to the user, exactly as produced.
    pub answer: String,
    pub decision: Decision,
    /// Passages handed to the model; zero unless `intent` is `College`.
    pub passages_used: usize,
}

pub struct AnswerPolicy {
    llm: Arc<dyn LanguageModel>,
    retriever: Retriever,
    config: PolicyConfig,
}

impl AnswerPolicy {
    pub fn new(llm: Arc<dyn LanguageModel>, retriever: Retriever, config: PolicyConfig) -> Self {
        Self {
            llm,
            retriever,
            config,
        }
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    /// Run the full single-turn procedure for `question`.
    pub async fn respond(&self, question: &str) -> Result<PolicyOutcome, ServiceError> {
        let intent = self.classify_intent(question).await?;
        tracing::debug!(intent = intent.as_str(), "classified query");

        let (answer, passages_used) = match intent {
            Intent::SmallTalk => {
                let answer = self.llm.complete(&self.small_talk_prompt(question)).await?;
                (answer, 0)
            }
            Intent::Unrelated => (self.config.unrelated_message.clone(), 0),
            Intent::College => {
                let passages = self.retriever.retrieve(question).await?;
                let prompt = self.answer_prompt(&format_context(&passages), question);
                let answer = self.llm.complete(&prompt).await?;
                (answer, passages.len())
            }
        };

        let decision = self.decide(&answer);
        Ok(PolicyOutcome {
            intent,
            answer,
            decision,
            passages_used,
        })
    }

    pub async fn classify_intent(&self, question: &str) -> Result<Intent, LlmProviderError> {
        let label = self.llm.complete(&self.intent_prompt(question)).await?;
        Ok(Intent::from_label(&label))
    }

    /// Map an escalated query to a department. Labels outside the fixed set
    /// become `General`.
    pub async fn categorize(&self, question: &str) -> Result<QueryCategory, LlmProviderError> {
        let label = self.llm.complete(&category_prompt(question)).await?;
        Ok(QueryCategory::from_label(&label))
    }

    /// Trigger detection. Whitespace is trimmed; nothing else is forgiven.
    pub fn decide(&self, answer: &str) -> Decision {
        let trimmed = answer.trim();
        if trimmed == self.config.escalation_message {
            Decision::Escalate("retrieved context does not answer the question".to_string())
        } else if trimmed == self.config.unrelated_message {
            Decision::Refused("question is not about the institution".to_string())
        } else {
            Decision::Answered(answer.to_string())
        }
    }

    pub fn intent_prompt(&self, question: &str) -> String {
        format!(
            r#"You are the query router for {name}, the official assistant of {institution}.
Classify the user's message into EXACTLY ONE of these labels:

small_talk - greetings or questions about the assistant itself (e.g. "Hello", "Who are you?", "How are you?")
college - any question about {institution} (admissions, departments, fees, hostel, rules, facilities, placements)
unrelated - anything else (other institutions, weather, general trivia)

Rules:
- Return ONLY the label.
- Do not add punctuation or explanation.

Message: {question}

Label:"#,
            name = self.config.assistant_name,
            institution = self.config.institution,
            question = question,
        )
    }

    pub fn small_talk_prompt(&self, question: &str) -> String {
        format!(
            r#"You are {name}, the official virtual assistant of {institution}.
Reply naturally and briefly to the user's message. Be friendly and vary your wording.
If asked who you are, say you are {name}, here to help with questions about {institution}.

Message: {question}

Reply:"#,
            name = self.config.assistant_name,
            institution = self.config.institution,
            question = question,
        )
    }

    /// The grounded-answer prompt. `context` is inserted verbatim.
    pub fn answer_prompt(&self, context: &str, question: &str) -> String {
        format!(
            r#"You are {name}, the official virtual assistant of {institution}.
Answer the QUESTION using ONLY the CONTEXT below. Never use outside knowledge.

1. If the CONTEXT contains the answer:
   - Do not copy the context. Write a short, clear summary that answers the question.
   - Use **bold** for important numbers, dates, names and deadlines.
   - Use bullet points for lists and numbered steps for procedures.

2. If the CONTEXT clearly rules the answer out (for example it lists every
   department and the one asked about is not among them), say so plainly.

3. If the CONTEXT does not contain the answer, reply with this exact message and nothing else:
{escalation}

4. If the QUESTION is not about {institution}, reply with this exact message and nothing else:
{unrelated}

CONTEXT:
{context}

QUESTION:
{question}

ANSWER:"#,
            name = self.config.assistant_name,
            institution = self.config.institution,
            escalation = self.config.escalation_message,
            unrelated = self.config.unrelated_message,
            context = context,
            question = question,
        )
    }
}

fn category_prompt(question: &str) -> String {
    format!(
        r#"You are a strict query classifier for a college assistant.
Classify the following user query into EXACTLY ONE of these categories:

1. Admission
2. Hostel
3. Campus-Facility
4. Placement
5. General (use this if it doesn't fit the above 4)

Rules:
- Return ONLY the category name.
- Do not add punctuation or explanation.
- Example output: Hostel

User query: {question}

Category:"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::{EmbeddingProvider, HashEmbedder};
    use crate::index::{ActiveIndex, Generation};
    use crate::models::Passage;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// Replies from a fixed script and records every prompt.
    struct Scripted {
        replies: Mutex<Vec<&'static str>>,
        prompts: Mutex<Vec<String>>,
    }

    impl Scripted {
        fn new(replies: Vec<&'static str>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies),
                prompts: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl LanguageModel for Scripted {
        fn model_name(&self) -> &str {
            "scripted"
        }
        async fn complete(&self, prompt: &str) -> Result<String, LlmProviderError> {
            self.prompts.lock().push(prompt.to_string());
            let mut replies = self.replies.lock();
            if replies.is_empty() {
                return Err(LlmProviderError::Disabled);
            }
            Ok(replies.remove(0).to_string())
        }
    }

    async fn policy(llm: Arc<Scripted>) -> AnswerPolicy {
        let embedder: Arc<dyn EmbeddingProvider> = Arc::new(HashEmbedder::new(64));
        let passage = Passage {
            id: "p0".to_string(),
            source: "fees.txt".to_string(),
            position: 0,
            text: "Hostel fee is ₹45000 per year".to_string(),
            hash: String::new(),
        };
        let generation = Generation::build(vec![passage], embedder.as_ref(), 8)
            .await
            .unwrap();
        let retriever = Retriever::new(Arc::new(ActiveIndex::new(generation)), embedder, 30);
        AnswerPolicy::new(llm, retriever, PolicyConfig::default())
    }

    #[test]
    fn intent_labels_fall_back_to_unrelated() {
        assert_eq!(Intent::from_label("college"), Intent::College);
        assert_eq!(Intent::from_label(" Small Talk.\n"), Intent::SmallTalk);
        assert_eq!(Intent::from_label("small-talk"), Intent::SmallTalk);
        assert_eq!(Intent::from_label("finance"), Intent::Unrelated);
        assert_eq!(Intent::from_label(""), Intent::Unrelated);
    }

    #[tokio::test]
    async fn decision_requires_exact_trigger() {
        let policy = policy(Scripted::new(vec![])).await;
        let trigger = policy.config().escalation_message.clone();

        assert!(policy.decide(&format!("  {}\n", trigger)).is_escalation());
        assert!(!policy.decide(&format!("{} Sorry.", trigger)).is_escalation());
        assert!(!policy.decide(&trigger.to_lowercase()).is_escalation());
        assert!(!policy.decide(&trigger[..trigger.len() - 1]).is_escalation());
        assert_eq!(
            policy.decide(&policy.config().unrelated_message.clone()).kind(),
            "refused"
        );
        assert_eq!(policy.decide("Fees are 45000").kind(), "answered");
    }

    #[tokio::test]
    async fn college_question_uses_context() {
        let llm = Scripted::new(vec!["college", "The hostel fee is **₹45000** per year."]);
        let policy = policy(llm.clone()).await;
        let outcome = policy.respond("What is the hostel fee?").await.unwrap();

        assert_eq!(outcome.intent, Intent::College);
        assert_eq!(outcome.passages_used, 1);
        assert!(outcome.answer.contains("45000"));
        let prompts = llm.prompts.lock();
        assert!(prompts[1].contains("Hostel fee is ₹45000 per year"));
        assert!(prompts[1].contains("QUESTION:\nWhat is the hostel fee?"));
    }

    #[tokio::test]
    async fn small_talk_skips_retrieval() {
        let llm = Scripted::new(vec!["small_talk", "I'm Campus Assistant, happy to help!"]);
        let policy = policy(llm.clone()).await;
        let outcome = policy.respond("Who are you?").await.unwrap();

        assert_eq!(outcome.intent, Intent::SmallTalk);
        assert_eq!(outcome.passages_used, 0);
        assert!(!outcome.decision.is_escalation());
        assert!(!llm.prompts.lock()[1].contains("CONTEXT:"));
    }

    #[tokio::test]
    async fn unrelated_returns_configured_string() {
        let llm = Scripted::new(vec!["weather"]);
        let policy = policy(llm.clone()).await;
        let outcome = policy.respond("What is the weather?").await.unwrap();

        assert_eq!(outcome.intent, Intent::Unrelated);
        assert_eq!(outcome.answer, policy.config().unrelated_message);
        assert!(matches!(outcome.decision, Decision::Refused(_)));
        assert_eq!(llm.prompts.lock().len(), 1);
    }

    #[tokio::test]
    async fn llm_failure_is_a_service_error() {
        let policy = policy(Scripted::new(vec!["college"])).await;
        let err = policy.respond("What is the hostel fee?").await.unwrap_err();
        assert!(matches!(err, ServiceError::Llm(_)));
    }

    #[tokio::test]
    async fn categorize_cleans_label() {
        let policy = policy(Scripted::new(vec!["Placement.\n", "Sports"])).await;
        assert_eq!(
            policy.categorize("Which companies visit?").await.unwrap(),
            QueryCategory::Placement
        );
        assert_eq!(
            policy.categorize("Is there a cricket team?").await.unwrap(),
            QueryCategory::General
        );
    }
}
