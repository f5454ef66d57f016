//! Whole-pipeline behavior: rebuild, persistence, retrieval and the answer
//! policy, driven through the public library API with a deterministic
//! embedder and scripted language models.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

use campus_rag::assistant::Assistant;
use campus_rag::chunk::ChunkSettings;
use campus_rag::config::{PolicyConfig, DEFAULT_ESCALATION_MESSAGE};
use campus_rag::embedding::{EmbeddingProvider, HashEmbedder};
use campus_rag::error::{EmbeddingProviderError, IndexBuildError, LlmProviderError};
use campus_rag::escalation::InMemoryEscalationLog;
use campus_rag::extract::ExtractorRegistry;
use campus_rag::index::persist::IndexStore;
use campus_rag::llm::LanguageModel;
use campus_rag::loader::{LoaderSettings, PLACEHOLDER_TEXT};
use campus_rag::models::{Query, Requester};
use campus_rag::policy::{AnswerPolicy, Intent};
use campus_rag::rebuild::{BuildSettings, IndexManager};
use campus_rag::retriever::Retriever;

const DIMS: usize = 256;

// ============ Test doubles ============

/// Hash embeddings that can be switched to fail, and that count query calls.
struct FlakyEmbedder {
    inner: HashEmbedder,
    failing: AtomicBool,
    calls: AtomicUsize,
}

impl FlakyEmbedder {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: HashEmbedder::new(DIMS),
            failing: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl EmbeddingProvider for FlakyEmbedder {
    fn model_name(&self) -> &str {
        "hash"
    }
    fn dims(&self) -> usize {
        DIMS
    }
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(EmbeddingProviderError::Http {
                provider: "test".to_string(),
                status: 503,
                body: "unavailable".to_string(),
            });
        }
        self.inner.embed_batch(texts).await
    }
}

/// Labels the intent by keyword and answers college questions from the
/// prompt's CONTEXT block only, like a well-behaved model would.
struct ContextBoundModel {
    prompts: Mutex<Vec<String>>,
}

impl ContextBoundModel {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            prompts: Mutex::new(Vec::new()),
        })
    }

    fn prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }
}

fn section<'a>(prompt: &'a str, start: &str, end: &str) -> &'a str {
    let from = prompt.find(start).map(|i| i + start.len()).unwrap_or(0);
    let to = prompt[from..].find(end).map(|i| from + i).unwrap_or(prompt.len());
    &prompt[from..to]
}

#[async_trait]
impl LanguageModel for ContextBoundModel {
    fn model_name(&self) -> &str {
        "context-bound"
    }

    async fn complete(&self, prompt: &str) -> Result<String, LlmProviderError> {
        self.prompts.lock().push(prompt.to_string());

        if prompt.contains("Label:") {
            let message = section(prompt, "Message: ", "\n").to_lowercase();
            let label = if message.contains("who are you") || message.starts_with("hello") {
                "small_talk"
            } else if message.contains("weather") {
                "unrelated"
            } else {
                "college"
            };
            return Ok(label.to_string());
        }
        if prompt.contains("Category:") {
            return Ok("Campus-Facility".to_string());
        }
        if prompt.contains("Reply:") {
            return Ok("I'm Campus Assistant, here to help with questions about the college!".to_string());
        }

        let context = section(prompt, "CONTEXT:\n", "\n\nQUESTION:");
        let question = section(prompt, "QUESTION:\n", "\n\nANSWER:").to_lowercase();
        if question.contains("hostel fee") {
            if let Some(line) = context.lines().find(|l| l.contains("Hostel fee")) {
                let amount: String = line.chars().filter(|c| c.is_ascii_digit()).collect();
                return Ok(format!("The hostel fee is **₹{}** per year.", amount));
            }
        }
        if question.contains("aerospace") {
            if context.contains("Departments:") && !context.contains("Aerospace") {
                return Ok("No, the college does not have an Aerospace department.".to_string());
            }
        }
        Ok(DEFAULT_ESCALATION_MESSAGE.to_string())
    }
}

// ============ Fixtures ============

struct Campus {
    _tmp: TempDir,
    docs: PathBuf,
    index_dir: PathBuf,
}

fn campus() -> Campus {
    let tmp = TempDir::new().unwrap();
    let docs = tmp.path().join("documents");
    fs::create_dir_all(docs.join("hostel")).unwrap();
    fs::write(
        docs.join("hostel/fees.txt"),
        "Hostel Information\n\nHostel fee is ₹45000 per year.\n\nMess charges are included.",
    )
    .unwrap();
    fs::write(
        docs.join("departments.md"),
        "# Academics\n\nDepartments: Computer Science, Electronics, Electrical, Mechanical, Civil, Biotechnology.",
    )
    .unwrap();
    fs::write(
        docs.join("library.txt"),
        "The central library opens at 8 AM and closes at 8 PM.",
    )
    .unwrap();
    let index_dir = tmp.path().join("index");
    Campus {
        _tmp: tmp,
        docs,
        index_dir,
    }
}

fn settings() -> BuildSettings {
    BuildSettings {
        loader: LoaderSettings::default(),
        chunking: ChunkSettings::default(),
        batch_size: 2,
    }
}

async fn open(index_dir: &Path, docs: &Path, embedder: Arc<dyn EmbeddingProvider>) -> IndexManager {
    IndexManager::open(
        IndexStore::new(index_dir),
        embedder,
        Arc::new(ExtractorRegistry::with_builtins()),
        settings(),
        docs,
    )
    .await
    .unwrap()
}

fn assistant(
    manager: &IndexManager,
    llm: Arc<dyn LanguageModel>,
    log: Arc<InMemoryEscalationLog>,
) -> Assistant {
    let retriever = Retriever::new(manager.active(), manager.embedder(), 30);
    Assistant::new(AnswerPolicy::new(llm, retriever, PolicyConfig::default()), log, 330)
}

fn query(text: &str) -> Query {
    Query {
        text: text.to_string(),
        requester: Requester {
            name: Some("Priya".to_string()),
            email: Some("priya@example.edu".to_string()),
            phone: Some("9876543210".to_string()),
        },
    }
}

async fn search_texts(manager: &IndexManager, q: &str) -> Vec<(String, u32, String)> {
    let retriever = Retriever::new(manager.active(), manager.embedder(), 30);
    retriever
        .search(q, 5)
        .await
        .unwrap()
        .into_iter()
        .map(|hit| (hit.passage.source, hit.passage.position, format!("{:.6}", hit.score)))
        .collect()
}

// ============ Index lifecycle ============

#[tokio::test]
async fn persisted_index_searches_like_the_in_memory_one() {
    let campus = campus();
    let embedder: Arc<dyn EmbeddingProvider> = Arc::new(HashEmbedder::new(DIMS));

    let built = open(&campus.index_dir, &campus.docs, embedder.clone()).await;
    let in_memory = search_texts(&built, "hostel fee per year").await;
    let id = built.status().generation_id;
    drop(built);

    let reloaded = open(&campus.index_dir, &campus.docs, embedder).await;
    assert_eq!(reloaded.status().generation_id, id);
    assert_eq!(search_texts(&reloaded, "hostel fee per year").await, in_memory);
    assert_eq!(in_memory[0].0, "hostel/fees.txt");
}

#[tokio::test]
async fn rebuild_twice_yields_identical_passages() {
    let campus = campus();
    let manager = open(&campus.index_dir, &campus.docs, Arc::new(HashEmbedder::new(DIMS))).await;

    manager.rebuild(&campus.docs).await.unwrap();
    let first = manager.active().snapshot();
    manager.rebuild(&campus.docs).await.unwrap();
    let second = manager.active().snapshot();

    assert_ne!(first.id(), second.id());
    assert_eq!(first.passages(), second.passages());
    assert_eq!(first.meta().checksum, second.meta().checksum);
}

#[tokio::test]
async fn failed_rebuild_keeps_previous_generation() {
    let campus = campus();
    let embedder = FlakyEmbedder::new();
    let manager = open(&campus.index_dir, &campus.docs, embedder.clone()).await;
    let before_id = manager.status().generation_id;
    let before = search_texts(&manager, "library hours").await;

    fs::write(campus.docs.join("new.txt"), "Sports complex opens at 6 AM.").unwrap();
    embedder.failing.store(true, Ordering::SeqCst);
    let err = manager.rebuild(&campus.docs).await.unwrap_err();
    assert!(matches!(err, IndexBuildError::Embedding(_)));
    assert!(!manager.rebuild_ok(&campus.docs).await);

    embedder.failing.store(false, Ordering::SeqCst);
    assert_eq!(manager.status().generation_id, before_id);
    assert_eq!(search_texts(&manager, "library hours").await, before);

    // Nothing but the active generation is left on disk.
    let dirs: Vec<_> = fs::read_dir(&campus.index_dir)
        .unwrap()
        .flatten()
        .filter(|e| e.path().is_dir())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(dirs, vec![before_id]);
}

#[tokio::test]
async fn corrupt_persisted_index_triggers_full_rebuild() {
    let campus = campus();
    let embedder: Arc<dyn EmbeddingProvider> = Arc::new(HashEmbedder::new(DIMS));
    let first = open(&campus.index_dir, &campus.docs, embedder.clone()).await;
    let status = first.status();
    drop(first);

    fs::write(status.index_dir.join("vectors.bin"), b"garbage").unwrap();
    let second = open(&campus.index_dir, &campus.docs, embedder).await;
    assert_ne!(second.status().generation_id, status.generation_id);
    assert_eq!(second.status().passages, status.passages);
}

#[tokio::test]
async fn empty_root_yields_searchable_placeholder_index() {
    let tmp = TempDir::new().unwrap();
    let docs = tmp.path().join("documents");
    fs::create_dir_all(&docs).unwrap();
    let manager = open(&tmp.path().join("index"), &docs, Arc::new(HashEmbedder::new(DIMS))).await;

    let retriever = Retriever::new(manager.active(), manager.embedder(), 30);
    let hits = retriever.retrieve("anything at all").await.unwrap();
    assert!(hits.len() <= 1);
    assert!(hits.iter().all(|p| p.text == PLACEHOLDER_TEXT));

    let report = manager.rebuild(&docs).await.unwrap();
    assert!(report.placeholder);
    assert_eq!(report.documents, 0);
}

// ============ Answer policy scenarios ============

#[tokio::test]
async fn grounded_answer_comes_from_retrieved_passages() {
    let campus = campus();
    let embedder = FlakyEmbedder::new();
    let manager = open(&campus.index_dir, &campus.docs, embedder.clone()).await;
    let llm = ContextBoundModel::new();
    let log = Arc::new(InMemoryEscalationLog::new());
    let assistant = assistant(&manager, llm.clone(), log.clone());

    let calls_before = embedder.calls.load(Ordering::SeqCst);
    let reply = assistant.handle(&query("What is the hostel fee?")).await.unwrap();

    assert_eq!(reply.intent, Intent::College);
    assert!(reply.answer.contains("45000"), "answer: {}", reply.answer);
    assert!(!reply.decision.is_escalation());
    assert!(log.is_empty());
    // Exactly one embedding call for the query.
    assert_eq!(embedder.calls.load(Ordering::SeqCst) - calls_before, 1);

    let answer_prompt = llm.prompts().into_iter().find(|p| p.contains("CONTEXT:")).unwrap();
    assert!(answer_prompt.contains("Hostel fee is ₹45000 per year."));
}

#[tokio::test]
async fn missing_department_is_not_fabricated() {
    let campus = campus();
    let manager = open(&campus.index_dir, &campus.docs, Arc::new(HashEmbedder::new(DIMS))).await;
    let log = Arc::new(InMemoryEscalationLog::new());
    let assistant = assistant(&manager, ContextBoundModel::new(), log.clone());

    let reply = assistant
        .handle(&query("Is there an Aerospace department?"))
        .await
        .unwrap();
    let answer = reply.answer.to_lowercase();
    assert!(
        reply.decision.is_escalation() || answer.starts_with("no"),
        "fabricated answer: {}",
        reply.answer
    );
    assert!(!answer.starts_with("yes"));
}

#[tokio::test]
async fn small_talk_never_retrieves_or_escalates() {
    let campus = campus();
    let embedder = FlakyEmbedder::new();
    let manager = open(&campus.index_dir, &campus.docs, embedder.clone()).await;
    let log = Arc::new(InMemoryEscalationLog::new());
    let assistant = assistant(&manager, ContextBoundModel::new(), log.clone());

    let calls_before = embedder.calls.load(Ordering::SeqCst);
    let reply = assistant.handle(&query("Who are you?")).await.unwrap();

    assert_eq!(reply.intent, Intent::SmallTalk);
    assert_eq!(embedder.calls.load(Ordering::SeqCst), calls_before);
    assert_ne!(reply.answer.trim(), DEFAULT_ESCALATION_MESSAGE);
    assert!(log.is_empty());
}

#[tokio::test]
async fn unanswerable_question_escalates_exactly_once() {
    let campus = campus();
    let manager = open(&campus.index_dir, &campus.docs, Arc::new(HashEmbedder::new(DIMS))).await;
    let log = Arc::new(InMemoryEscalationLog::new());
    let assistant = assistant(&manager, ContextBoundModel::new(), log.clone());

    let reply = assistant
        .handle(&query("Is there a swimming pool on campus?"))
        .await
        .unwrap();
    assert!(reply.decision.is_escalation());
    assert_eq!(reply.answer, DEFAULT_ESCALATION_MESSAGE);

    let records = log.records();
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(Some(record.id), reply.escalation_id);
    assert_eq!(record.user_name, "Priya");
    assert_eq!(record.phone_number, "9876543210");
    assert_eq!(record.query_text, "Is there a swimming pool on campus?");
    assert_eq!(record.bot_response, DEFAULT_ESCALATION_MESSAGE);
    assert_eq!(record.category, "Campus-Facility");
}

#[tokio::test]
async fn unrelated_question_gets_refusal_without_retrieval() {
    let campus = campus();
    let embedder = FlakyEmbedder::new();
    let manager = open(&campus.index_dir, &campus.docs, embedder.clone()).await;
    let log = Arc::new(InMemoryEscalationLog::new());
    let assistant = assistant(&manager, ContextBoundModel::new(), log.clone());

    let calls_before = embedder.calls.load(Ordering::SeqCst);
    let reply = assistant.handle(&query("What is the weather today?")).await.unwrap();
    assert_eq!(reply.intent, Intent::Unrelated);
    assert_eq!(reply.answer, PolicyConfig::default().unrelated_message);
    assert_eq!(embedder.calls.load(Ordering::SeqCst), calls_before);
    assert!(log.is_empty());
}

#[tokio::test]
async fn query_embedding_failure_is_a_service_error() {
    let campus = campus();
    let embedder = FlakyEmbedder::new();
    let manager = open(&campus.index_dir, &campus.docs, embedder.clone()).await;
    let log = Arc::new(InMemoryEscalationLog::new());
    let assistant = assistant(&manager, ContextBoundModel::new(), log.clone());

    embedder.failing.store(true, Ordering::SeqCst);
    let err = assistant
        .handle(&query("What is the hostel fee?"))
        .await
        .unwrap_err();
    assert!(matches!(err, campus_rag::error::ServiceError::Embedding(_)));
    assert!(log.is_empty());
}
