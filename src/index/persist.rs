//! On-disk generations.
//!
//! ```text
//! <index_dir>/
//!   CURRENT                  id of the active generation
//!   <generation_id>/
//!     meta.json              GenerationMeta
//!     passages.json          Vec<Passage>
//!     vectors.bin            little-endian f32, row-major
//! ```
//!
//! A generation is written under `<generation_id>.partial/` and renamed into
//! place once every file is synced, so a crash never leaves a directory that
//! looks complete. `CURRENT` is replaced through a temp file and a rename.
//! Directories that are neither current nor complete are swept by
//! [`IndexStore::sweep`].

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use super::{checksum, is_generation_id, Generation, GenerationMeta, FORMAT_VERSION, METRIC};
use crate::error::{IndexBuildError, IndexLoadError};
use crate::models::Passage;

const META_FILE: &str = "meta.json";
const PASSAGES_FILE: &str = "passages.json";
const VECTORS_FILE: &str = "vectors.bin";
const CURRENT_FILE: &str = "CURRENT";
const PARTIAL_SUFFIX: &str = ".partial";

/// Encode vectors as little-endian `f32` bytes.
pub fn encode_vectors(vectors: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vectors.len() * 4);
    for &v in vectors {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Reverse of [`encode_vectors`]. Trailing bytes short of a full `f32` are ignored.
pub fn decode_vectors(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Durably write `generation` into the directory `location`, which must not exist.
pub fn persist(generation: &Generation, location: &Path) -> Result<(), IndexBuildError> {
    let persist_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source| IndexBuildError::Persist { path, source }
    };

    let staging = partial_path(location);
    if staging.exists() {
        fs::remove_dir_all(&staging).map_err(persist_err(&staging))?;
    }
    fs::create_dir_all(&staging).map_err(persist_err(&staging))?;

    let passages_json = serde_json::to_vec(generation.passages())?;
    let vector_bytes = encode_vectors(generation.vectors());
    let meta_json = serde_json::to_vec_pretty(generation.meta())?;

    write_synced(&staging.join(PASSAGES_FILE), &passages_json).map_err(persist_err(&staging))?;
    write_synced(&staging.join(VECTORS_FILE), &vector_bytes).map_err(persist_err(&staging))?;
    write_synced(&staging.join(META_FILE), &meta_json).map_err(persist_err(&staging))?;

    fs::rename(&staging, location).map_err(persist_err(location))?;
    Ok(())
}

/// Read the generation stored at `location`.
///
/// Fails unless the stored format, metric, model and dimensionality match
/// what the configured provider produces and the checksum verifies.
pub fn load(location: &Path, model: &str, dims: usize) -> Result<Generation, IndexLoadError> {
    let meta_path = location.join(META_FILE);
    if !meta_path.is_file() {
        return Err(IndexLoadError::NotFound(location.to_path_buf()));
    }
    let corrupt = |message: String| IndexLoadError::Corrupt {
        path: location.to_path_buf(),
        message,
    };

    let meta: GenerationMeta = serde_json::from_slice(&read(&meta_path)?)
        .map_err(|e| corrupt(format!("{}: {}", META_FILE, e)))?;

    if meta.format_version != FORMAT_VERSION {
        return Err(IndexLoadError::FormatVersion {
            found: meta.format_version,
            expected: FORMAT_VERSION,
        });
    }
    if meta.metric != METRIC {
        return Err(IndexLoadError::Metric {
            found: meta.metric,
            expected: METRIC.to_string(),
        });
    }
    if meta.model != model {
        return Err(IndexLoadError::Model {
            stored: meta.model,
            configured: model.to_string(),
        });
    }
    if meta.dims != dims {
        return Err(IndexLoadError::Dimension {
            stored: meta.dims,
            configured: dims,
        });
    }

    let passages_json = read(&location.join(PASSAGES_FILE))?;
    let vector_bytes = read(&location.join(VECTORS_FILE))?;
    if checksum(&passages_json, &vector_bytes) != meta.checksum {
        return Err(corrupt("checksum mismatch".to_string()));
    }

    let passages: Vec<Passage> = serde_json::from_slice(&passages_json)
        .map_err(|e| corrupt(format!("{}: {}", PASSAGES_FILE, e)))?;
    if passages.len() != meta.passage_count {
        return Err(corrupt(format!(
            "meta lists {} passages, found {}",
            meta.passage_count,
            passages.len()
        )));
    }
    let expected_bytes = passages.len() * meta.dims * 4;
    if vector_bytes.len() != expected_bytes {
        return Err(corrupt(format!(
            "{} is {} bytes, expected {}",
            VECTORS_FILE,
            vector_bytes.len(),
            expected_bytes
        )));
    }

    let vectors = decode_vectors(&vector_bytes);
    Ok(Generation::from_parts(meta, passages, vectors))
}

fn read(path: &Path) -> Result<Vec<u8>, IndexLoadError> {
    fs::read(path).map_err(|source| IndexLoadError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn write_synced(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

fn partial_path(location: &Path) -> PathBuf {
    let mut name = location
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(PARTIAL_SUFFIX);
    location.with_file_name(name)
}

/// The index directory: generation subdirectories plus the `CURRENT` pointer.
#[derive(Debug, Clone)]
pub struct IndexStore {
    dir: PathBuf,
}

impl IndexStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn generation_dir(&self, id: &str) -> PathBuf {
        self.dir.join(id)
    }

    /// Id named by `CURRENT`, or `None` if no generation was ever activated.
    pub fn current_id(&self) -> Result<Option<String>, IndexLoadError> {
        let path = self.dir.join(CURRENT_FILE);
        match fs::read_to_string(&path) {
            Ok(contents) => {
                let id = contents.trim();
                if id.is_empty() {
                    Err(IndexLoadError::Corrupt {
                        path,
                        message: "CURRENT is empty".to_string(),
                    })
                } else {
                    Ok(Some(id.to_string()))
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(IndexLoadError::Io { path, source }),
        }
    }

    /// Load the generation named by `CURRENT`.
    pub fn load_current(&self, model: &str, dims: usize) -> Result<Generation, IndexLoadError> {
        let id = self
            .current_id()?
            .ok_or_else(|| IndexLoadError::NotFound(self.dir.clone()))?;
        load(&self.generation_dir(&id), model, dims)
    }

    /// Write `generation` into its own fresh subdirectory.
    pub fn persist(&self, generation: &Generation) -> Result<PathBuf, IndexBuildError> {
        fs::create_dir_all(&self.dir).map_err(|source| IndexBuildError::Persist {
            path: self.dir.clone(),
            source,
        })?;
        let location = self.generation_dir(generation.id());
        persist(generation, &location)?;
        Ok(location)
    }

    /// Point `CURRENT` at `id`.
    pub fn set_current(&self, id: &str) -> Result<(), IndexBuildError> {
        let tmp = self.dir.join(format!("{}.tmp", CURRENT_FILE));
        let target = self.dir.join(CURRENT_FILE);
        let persist_err = |source| IndexBuildError::Persist {
            path: target.clone(),
            source,
        };
        write_synced(&tmp, format!("{}\n", id).as_bytes()).map_err(persist_err)?;
        fs::rename(&tmp, &target).map_err(persist_err)?;
        Ok(())
    }

    /// Delete one generation directory.
    pub fn remove(&self, id: &str) -> std::io::Result<()> {
        let path = self.generation_dir(id);
        if path.exists() {
            fs::remove_dir_all(path)?;
        }
        Ok(())
    }

    /// Metadata of the generation named by `CURRENT`, without reading its
    /// passages or vectors. `None` if no generation was ever activated.
    pub fn current_meta(&self) -> Result<Option<GenerationMeta>, IndexLoadError> {
        let Some(id) = self.current_id()? else {
            return Ok(None);
        };
        let location = self.generation_dir(&id);
        let meta_path = location.join(META_FILE);
        if !meta_path.is_file() {
            return Err(IndexLoadError::NotFound(location));
        }
        let meta = serde_json::from_slice(&read(&meta_path)?).map_err(|e| IndexLoadError::Corrupt {
            path: location,
            message: format!("{}: {}", META_FILE, e),
        })?;
        Ok(Some(meta))
    }

    /// Delete every generation directory other than `keep`, including
    /// partially written ones. Directories whose names are not generation
    /// ids are never touched. Returns the number of directories removed.
    pub fn sweep(&self, keep: Option<&str>) -> usize {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(_) => return 0,
        };
        let mut removed = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let generation = name.strip_suffix(PARTIAL_SUFFIX).unwrap_or(&name);
            if !is_generation_id(generation) || Some(name.as_str()) == keep {
                continue;
            }
            match fs::remove_dir_all(&path) {
                Ok(()) => {
                    tracing::info!(dir = %path.display(), "removed stale index directory");
                    removed += 1;
                }
                Err(e) => {
                    tracing::warn!(dir = %path.display(), error = %e, "failed to remove stale index directory")
                }
            }
        }
        removed
    }
}
