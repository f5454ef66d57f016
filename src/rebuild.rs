//! Index rebuild orchestration.
//!
//! [`IndexManager`] owns the active-generation pointer and the on-disk index
//! directory. A rebuild is always a full rebuild:
//!
//! 1. load and chunk every document under the root,
//! 2. embed every passage into a brand-new generation,
//! 3. persist it to a fresh directory,
//! 4. point `CURRENT` at it and swap the active pointer,
//! 5. delete the previous generation's directory and any other stale ones.
//!
//! A failure in steps 1 to 4 leaves the previous generation active and on
//! disk. Rebuilds are serialized; a second request waits for the first.

use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use crate::chunk::{self, ChunkSettings};
use crate::embedding::EmbeddingProvider;
use crate::error::{IndexBuildError, IndexLoadError};
use crate::extract::ExtractorRegistry;
use crate::index::persist::IndexStore;
use crate::index::{ActiveIndex, Generation, GenerationMeta};
use crate::loader::{self, LoaderSettings};

/// Everything a build needs besides the embedding provider.
#[derive(Debug, Clone)]
pub struct BuildSettings {
    pub loader: LoaderSettings,
    pub chunking: ChunkSettings,
    pub batch_size: usize,
}

impl BuildSettings {
    pub fn from_config(config: &crate::config::Config) -> Self {
        Self {
            loader: LoaderSettings::from(&config.documents),
            chunking: ChunkSettings {
                max_chars: config.chunking.max_chars,
                overlap_chars: config.chunking.overlap_chars,
            },
            batch_size: config.embedding.batch_size,
        }
    }
}

/// Summary of one successful rebuild.
#[derive(Debug, Clone, Serialize)]
pub struct RebuildReport {
    pub generation_id: String,
    pub previous_generation_id: Option<String>,
    pub documents: usize,
    pub skipped_files: usize,
    pub placeholder: bool,
    pub passages: usize,
    pub elapsed_ms: u128,
}

/// What is serving queries right now.
#[derive(Debug, Clone, Serialize)]
pub struct IndexStatus {
    pub generation_id: String,
    pub model: String,
    pub dims: usize,
    pub metric: String,
    pub passages: usize,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub index_dir: PathBuf,
}

impl IndexStatus {
    fn from_meta(meta: &GenerationMeta, store: &IndexStore) -> Self {
        IndexStatus {
            generation_id: meta.id.clone(),
            model: meta.model.clone(),
            dims: meta.dims,
            metric: meta.metric.clone(),
            passages: meta.passage_count,
            created_at: meta.created_at,
            index_dir: store.generation_dir(&meta.id),
        }
    }
}

struct Built {
    generation: Generation,
    documents: usize,
    skipped_files: usize,
    placeholder: bool,
}

pub struct IndexManager {
    store: IndexStore,
    active: Arc<ActiveIndex>,
    embedder: Arc<dyn EmbeddingProvider>,
    registry: Arc<ExtractorRegistry>,
    settings: BuildSettings,
    rebuild_lock: tokio::sync::Mutex<()>,
}

impl IndexManager {
    /// Load the persisted generation, or build one from `root` if there is
    /// none or it cannot be used with `embedder`.
    ///
    /// Leftover directories from interrupted rebuilds are removed.
    pub async fn open(
        store: IndexStore,
        embedder: Arc<dyn EmbeddingProvider>,
        registry: Arc<ExtractorRegistry>,
        settings: BuildSettings,
        root: &Path,
    ) -> Result<Self, IndexBuildError> {
        let generation = match load_persisted(&store, embedder.as_ref()).await? {
            Ok(generation) => {
                tracing::info!(
                    generation = generation.id(),
                    passages = generation.len(),
                    "loaded persisted index"
                );
                generation
            }
            Err(err) => {
                match &err {
                    IndexLoadError::NotFound(_) => {
                        tracing::info!(dir = %store.dir().display(), "no persisted index; building")
                    }
                    _ => tracing::warn!(error = %err, "persisted index unusable; rebuilding"),
                }
                let built = build(root, embedder.as_ref(), &registry, &settings).await?;
                let generation = persist_and_point(&store, built.generation).await?;
                tracing::info!(
                    generation = generation.id(),
                    passages = generation.len(),
                    "index built"
                );
                generation
            }
        };

        let swept = store.sweep(Some(generation.id()));
        if swept > 0 {
            tracing::info!(removed = swept, "swept stale index directories");
        }
        Ok(Self::with_generation(store, generation, embedder, registry, settings))
    }

    /// Like [`open`](Self::open), but never builds. Without a usable
    /// persisted generation the manager starts from an empty one that exists
    /// only in memory. Used when a [`rebuild`](Self::rebuild) follows
    /// immediately, so the corpus is embedded once.
    pub async fn open_for_rebuild(
        store: IndexStore,
        embedder: Arc<dyn EmbeddingProvider>,
        registry: Arc<ExtractorRegistry>,
        settings: BuildSettings,
    ) -> Result<Self, IndexBuildError> {
        let generation = match load_persisted(&store, embedder.as_ref()).await? {
            Ok(generation) => generation,
            Err(err) => {
                match &err {
                    IndexLoadError::NotFound(_) => {
                        tracing::debug!(dir = %store.dir().display(), "no persisted index")
                    }
                    _ => tracing::warn!(error = %err, "persisted index unusable; it will be replaced"),
                }
                Generation::build(Vec::new(), embedder.as_ref(), settings.batch_size).await?
            }
        };
        Ok(Self::with_generation(store, generation, embedder, registry, settings))
    }

    fn with_generation(
        store: IndexStore,
        generation: Generation,
        embedder: Arc<dyn EmbeddingProvider>,
        registry: Arc<ExtractorRegistry>,
        settings: BuildSettings,
    ) -> Self {
        Self {
            store,
            active: Arc::new(ActiveIndex::new(generation)),
            embedder,
            registry,
            settings,
            rebuild_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Status of the generation `CURRENT` names, read from its metadata.
    /// Builds nothing and writes nothing; `None` if no generation was ever
    /// activated.
    pub fn persisted_status(store: &IndexStore) -> Result<Option<IndexStatus>, IndexLoadError> {
        Ok(store
            .current_meta()?
            .map(|meta| IndexStatus::from_meta(&meta, store)))
    }

    pub fn active(&self) -> Arc<ActiveIndex> {
        self.active.clone()
    }

    pub fn embedder(&self) -> Arc<dyn EmbeddingProvider> {
        self.embedder.clone()
    }

    pub fn status(&self) -> IndexStatus {
        IndexStatus::from_meta(self.active.snapshot().meta(), &self.store)
    }

    /// Rebuild from `root` and activate the result.
    pub async fn rebuild(&self, root: &Path) -> Result<RebuildReport, IndexBuildError> {
        let _guard = self.rebuild_lock.lock().await;
        let started = Instant::now();
        tracing::info!(root = %root.display(), "rebuild started");

        let built = build(root, self.embedder.as_ref(), &self.registry, &self.settings).await?;
        let (documents, skipped_files, placeholder) =
            (built.documents, built.skipped_files, built.placeholder);
        let generation = persist_and_point(&self.store, built.generation).await?;
        let generation_id = generation.id().to_string();
        let passages = generation.len();

        let previous = self.active.activate(Arc::new(generation));
        tracing::info!(
            generation = %generation_id,
            previous = previous.id(),
            "activated new index generation"
        );

        let previous_id = self
            .store
            .generation_dir(previous.id())
            .is_dir()
            .then(|| previous.id().to_string());
        let swept = self.store.sweep(Some(&generation_id));
        if swept > 0 {
            tracing::debug!(removed = swept, "removed superseded index directories");
        }

        let report = RebuildReport {
            generation_id,
            previous_generation_id: previous_id,
            documents,
            skipped_files,
            placeholder,
            passages,
            elapsed_ms: started.elapsed().as_millis(),
        };
        tracing::info!(
            documents = report.documents,
            skipped = report.skipped_files,
            passages = report.passages,
            elapsed_ms = report.elapsed_ms as u64,
            "rebuild finished"
        );
        Ok(report)
    }

    /// [`rebuild`](Self::rebuild) reduced to success or failure. Failures are logged.
    pub async fn rebuild_ok(&self, root: &Path) -> bool {
        match self.rebuild(root).await {
            Ok(_) => true,
            Err(e) => {
                tracing::error!(error = %e, "rebuild failed; previous index remains active");
                false
            }
        }
    }
}

/// Read the generation `CURRENT` names, checked against `embedder`. The
/// outer error is a failed blocking task; the inner one says why nothing
/// usable is on disk.
async fn load_persisted(
    store: &IndexStore,
    embedder: &dyn EmbeddingProvider,
) -> Result<Result<Generation, IndexLoadError>, IndexBuildError> {
    let store = store.clone();
    let model = embedder.model_name().to_string();
    let dims = embedder.dims();
    tokio::task::spawn_blocking(move || store.load_current(&model, dims))
        .await
        .map_err(|e| IndexBuildError::Task(e.to_string()))
}

async fn build(
    root: &Path,
    embedder: &dyn EmbeddingProvider,
    registry: &Arc<ExtractorRegistry>,
    settings: &BuildSettings,
) -> Result<Built, IndexBuildError> {
    let (report, passages) = {
        let root = root.to_path_buf();
        let registry = registry.clone();
        let settings = settings.clone();
        tokio::task::spawn_blocking(move || {
            let report = loader::load(&root, &settings.loader, &registry);
            let passages = chunk::split_documents(&report.documents, settings.chunking);
            (report, passages)
        })
        .await
        .map_err(|e| IndexBuildError::Task(e.to_string()))?
    };
    tracing::info!(
        documents = report.documents.len(),
        passages = passages.len(),
        "documents chunked; embedding"
    );

    let generation = Generation::build(passages, embedder, settings.batch_size).await?;
    Ok(Built {
        generation,
        documents: if report.placeholder { 0 } else { report.documents.len() },
        skipped_files: report.skipped.len(),
        placeholder: report.placeholder,
    })
}

/// Persist `generation` and point `CURRENT` at it. On failure the new
/// directory is removed and `CURRENT` is left as it was.
async fn persist_and_point(
    store: &IndexStore,
    generation: Generation,
) -> Result<Generation, IndexBuildError> {
    let store = store.clone();
    tokio::task::spawn_blocking(move || {
        store.persist(&generation)?;
        if let Err(e) = store.set_current(generation.id()) {
            let _ = store.remove(generation.id());
            return Err(e);
        }
        Ok(generation)
    })
    .await
    .map_err(|e| IndexBuildError::Task(e.to_string()))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashEmbedder;
    use crate::error::EmbeddingProviderError;
    use async_trait::async_trait;
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::Notify;

    /// Counts `embed_batch` calls.
    struct CountingEmbedder {
        inner: HashEmbedder,
        batches: AtomicUsize,
    }

    #[async_trait]
    impl EmbeddingProvider for CountingEmbedder {
        fn model_name(&self) -> &str {
            self.inner.model_name()
        }
        fn dims(&self) -> usize {
            self.inner.dims()
        }
        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingProviderError> {
            self.batches.fetch_add(1, Ordering::SeqCst);
            self.inner.embed_batch(texts).await
        }
    }

    /// Holds every `embed_batch` call until `gate` is notified, recording
    /// which generation was active when the call started.
    struct GatedEmbedder {
        inner: HashEmbedder,
        gate: Notify,
        entered: Notify,
        active: parking_lot::Mutex<Option<Arc<ActiveIndex>>>,
        seen: parking_lot::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl EmbeddingProvider for GatedEmbedder {
        fn model_name(&self) -> &str {
            self.inner.model_name()
        }
        fn dims(&self) -> usize {
            self.inner.dims()
        }
        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingProviderError> {
            let active = self.active.lock().clone();
            if let Some(active) = active {
                self.seen.lock().push(active.snapshot().id().to_string());
            }
            self.entered.notify_one();
            self.gate.notified().await;
            self.inner.embed_batch(texts).await
        }
    }

    fn generation_dirs(index: &Path) -> Vec<String> {
        let mut dirs: Vec<String> = fs::read_dir(index)
            .unwrap()
            .flatten()
            .filter(|e| e.path().is_dir())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        dirs.sort();
        dirs
    }

    fn settings() -> BuildSettings {
        BuildSettings {
            loader: LoaderSettings::default(),
            chunking: ChunkSettings::default(),
            batch_size: 4,
        }
    }

    async fn open(tmp: &TempDir, embedder: Arc<dyn EmbeddingProvider>) -> IndexManager {
        IndexManager::open(
            IndexStore::new(tmp.path().join("index")),
            embedder,
            Arc::new(ExtractorRegistry::with_builtins()),
            settings(),
            &tmp.path().join("docs"),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn open_builds_then_reloads() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("docs")).unwrap();
        fs::write(tmp.path().join("docs/fees.txt"), "Hostel fee is 45000 per year").unwrap();

        let first = open(&tmp, Arc::new(HashEmbedder::new(32))).await;
        let id = first.status().generation_id;
        drop(first);

        let second = open(&tmp, Arc::new(HashEmbedder::new(32))).await;
        assert_eq!(second.status().generation_id, id);
    }

    #[tokio::test]
    async fn open_rebuilds_on_dimension_change() {
        let tmp = TempDir::new().unwrap();
        let first = open(&tmp, Arc::new(HashEmbedder::new(32))).await;
        let old_id = first.status().generation_id;
        drop(first);

        let second = open(&tmp, Arc::new(HashEmbedder::new(64))).await;
        let status = second.status();
        assert_ne!(status.generation_id, old_id);
        assert_eq!(status.dims, 64);
        assert!(!tmp.path().join("index").join(&old_id).exists());
    }

    #[tokio::test]
    async fn rebuild_swaps_and_removes_previous() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("docs")).unwrap();
        let manager = open(&tmp, Arc::new(HashEmbedder::new(32))).await;
        let before = manager.status();
        assert_eq!(before.passages, 1);

        fs::write(tmp.path().join("docs/library.md"), "Library opens at 8 AM").unwrap();
        let report = manager.rebuild(&tmp.path().join("docs")).await.unwrap();
        assert_eq!(report.documents, 1);
        assert!(!report.placeholder);
        assert_eq!(report.previous_generation_id.as_deref(), Some(before.generation_id.as_str()));
        assert_eq!(manager.status().generation_id, report.generation_id);
        assert!(!before.index_dir.exists());
        assert!(manager.status().index_dir.exists());
    }

    #[tokio::test]
    async fn open_for_rebuild_embeds_the_corpus_once() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("docs")).unwrap();
        fs::write(tmp.path().join("docs/fees.txt"), "Hostel fee is 45000 per year").unwrap();
        let index = tmp.path().join("index");
        let embedder = Arc::new(CountingEmbedder {
            inner: HashEmbedder::new(32),
            batches: AtomicUsize::new(0),
        });

        let manager = IndexManager::open_for_rebuild(
            IndexStore::new(&index),
            embedder.clone(),
            Arc::new(ExtractorRegistry::with_builtins()),
            settings(),
        )
        .await
        .unwrap();
        assert_eq!(embedder.batches.load(Ordering::SeqCst), 0);
        assert!(!index.exists());

        let report = manager.rebuild(&tmp.path().join("docs")).await.unwrap();
        assert_eq!(embedder.batches.load(Ordering::SeqCst), 1);
        assert_eq!(report.previous_generation_id, None);
        assert_eq!(generation_dirs(&index), vec![report.generation_id.clone()]);
    }

    #[tokio::test]
    async fn open_for_rebuild_reuses_usable_generation() {
        let tmp = TempDir::new().unwrap();
        let first = open(&tmp, Arc::new(HashEmbedder::new(32))).await;
        let id = first.status().generation_id;
        drop(first);

        let manager = IndexManager::open_for_rebuild(
            IndexStore::new(tmp.path().join("index")),
            Arc::new(HashEmbedder::new(32)),
            Arc::new(ExtractorRegistry::with_builtins()),
            settings(),
        )
        .await
        .unwrap();
        assert_eq!(manager.status().generation_id, id);
    }

    #[tokio::test]
    async fn persisted_status_never_builds() {
        let tmp = TempDir::new().unwrap();
        let store = IndexStore::new(tmp.path().join("index"));
        assert!(IndexManager::persisted_status(&store).unwrap().is_none());
        assert!(!store.dir().exists());

        let manager = open(&tmp, Arc::new(HashEmbedder::new(32))).await;
        let status = IndexManager::persisted_status(&store).unwrap().unwrap();
        assert_eq!(status.generation_id, manager.status().generation_id);
        assert_eq!(status.dims, 32);
        assert_eq!(status.index_dir, manager.status().index_dir);
    }

    #[tokio::test]
    async fn concurrent_rebuilds_run_one_at_a_time() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("docs")).unwrap();
        fs::write(tmp.path().join("docs/fees.txt"), "Hostel fee is 45000 per year").unwrap();
        let root = tmp.path().join("docs");
        let index = tmp.path().join("index");

        let embedder = Arc::new(GatedEmbedder {
            inner: HashEmbedder::new(32),
            gate: Notify::new(),
            entered: Notify::new(),
            active: parking_lot::Mutex::new(None),
            seen: parking_lot::Mutex::new(Vec::new()),
        });
        let manager = Arc::new(
            IndexManager::open_for_rebuild(
                IndexStore::new(&index),
                embedder.clone(),
                Arc::new(ExtractorRegistry::with_builtins()),
                settings(),
            )
            .await
            .unwrap(),
        );
        *embedder.active.lock() = Some(manager.active());
        let initial = manager.status().generation_id;

        let spawn_rebuild = || {
            let manager = manager.clone();
            let root = root.clone();
            tokio::spawn(async move { manager.rebuild(&root).await })
        };

        let first = spawn_rebuild();
        embedder.entered.notified().await;
        let second = spawn_rebuild();

        // The second rebuild must still be waiting for the first.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(embedder.seen.lock().len(), 1);
        assert!(!second.is_finished());

        embedder.gate.notify_one();
        embedder.entered.notified().await;
        embedder.gate.notify_one();

        let first = first.await.unwrap().unwrap();
        let second = second.await.unwrap().unwrap();

        assert_eq!(
            *embedder.seen.lock(),
            vec![initial, first.generation_id.clone()]
        );
        assert_eq!(second.previous_generation_id.as_deref(), Some(first.generation_id.as_str()));
        assert_eq!(manager.status().generation_id, second.generation_id);
        assert_eq!(generation_dirs(&index), vec![second.generation_id.clone()]);
    }
}
