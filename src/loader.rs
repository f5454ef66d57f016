//! Document loader.
//!
//! Walks the document root recursively and turns every regular file into a
//! [`Document`] via the [`ExtractorRegistry`]. A file that cannot be read or
//! extracted is recorded in [`LoadReport::skipped`] and logged; it never
//! aborts the load. If nothing usable is found a single placeholder document
//! is returned so the index build always has input.

use chrono::{DateTime, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::Path;
use walkdir::WalkDir;

use crate::config::DocumentsConfig;
use crate::error::DocumentReadError;
use crate::extract::ExtractorRegistry;
use crate::models::{Document, DocumentKind};

/// Source path of the placeholder document.
pub const PLACEHOLDER_PATH: &str = "placeholder";
/// Text of the placeholder document.
pub const PLACEHOLDER_TEXT: &str = "No documents found.";

#[derive(Debug, Clone)]
pub struct LoaderSettings {
    pub exclude_globs: Vec<String>,
    pub follow_symlinks: bool,
    pub max_file_bytes: u64,
}

impl Default for LoaderSettings {
    fn default() -> Self {
        Self {
            exclude_globs: Vec::new(),
            follow_symlinks: false,
            max_file_bytes: 50 * 1024 * 1024,
        }
    }
}

impl From<&DocumentsConfig> for LoaderSettings {
    fn from(config: &DocumentsConfig) -> Self {
        Self {
            exclude_globs: config.exclude_globs.clone(),
            follow_symlinks: config.follow_symlinks,
            max_file_bytes: config.max_file_bytes,
        }
    }
}

/// Outcome of one load.
#[derive(Debug, Default)]
pub struct LoadReport {
    /// Loaded documents sorted by path. Never empty.
    pub documents: Vec<Document>,
    /// Files (or the root itself) that could not be used.
    pub skipped: Vec<DocumentReadError>,
    /// True when `documents` holds only the placeholder.
    pub placeholder: bool,
}

/// Load every usable document under `root`.
pub fn load(root: &Path, settings: &LoaderSettings, registry: &ExtractorRegistry) -> LoadReport {
    let mut report = LoadReport::default();

    match build_excludes(&settings.exclude_globs) {
        Ok(excludes) => walk(root, settings, registry, &excludes, &mut report),
        Err(e) => {
            tracing::warn!(error = %e, "invalid exclude glob; loading without excludes");
            walk(root, settings, registry, &GlobSet::empty(), &mut report);
        }
    }

    // Sort for deterministic ordering
    report.documents.sort_by(|a, b| a.path.cmp(&b.path));

    if report.documents.is_empty() {
        tracing::warn!(root = %root.display(), "no usable documents; using placeholder");
        report.documents.push(placeholder_document());
        report.placeholder = true;
    }

    tracing::info!(
        root = %root.display(),
        documents = report.documents.len(),
        skipped = report.skipped.len(),
        "documents loaded"
    );
    report
}

/// The stand-in document used when the root holds nothing usable.
pub fn placeholder_document() -> Document {
    Document {
        path: PLACEHOLDER_PATH.to_string(),
        kind: DocumentKind::Text,
        text: PLACEHOLDER_TEXT.to_string(),
        modified: DateTime::<Utc>::UNIX_EPOCH,
        size_bytes: PLACEHOLDER_TEXT.len() as u64,
    }
}

fn walk(
    root: &Path,
    settings: &LoaderSettings,
    registry: &ExtractorRegistry,
    excludes: &GlobSet,
    report: &mut LoadReport,
) {
    let walker = WalkDir::new(root).follow_links(settings.follow_symlinks);
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                let path = e
                    .path()
                    .map(|p| relative_path(root, p))
                    .filter(|p| !p.is_empty())
                    .unwrap_or_else(|| root.display().to_string());
                let source = e
                    .into_io_error()
                    .unwrap_or_else(|| std::io::Error::other("filesystem loop detected"));
                skip(report, DocumentReadError::Io { path, source });
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let rel = relative_path(root, entry.path());
        if excludes.is_match(&rel) {
            continue;
        }

        match read_document(entry.path(), rel, settings, registry) {
            Ok(doc) => report.documents.push(doc),
            Err(e) => skip(report, e),
        }
    }
}

fn skip(report: &mut LoadReport, error: DocumentReadError) {
    tracing::warn!(path = error.path(), error = %error, "skipping document");
    report.skipped.push(error);
}

fn read_document(
    path: &Path,
    rel: String,
    settings: &LoaderSettings,
    registry: &ExtractorRegistry,
) -> Result<Document, DocumentReadError> {
    let io_err = |source| DocumentReadError::Io {
        path: rel.clone(),
        source,
    };
    let metadata = std::fs::metadata(path).map_err(io_err)?;
    if metadata.len() > settings.max_file_bytes {
        return Err(DocumentReadError::TooLarge {
            path: rel,
            size: metadata.len(),
            limit: settings.max_file_bytes,
        });
    }
    let modified: DateTime<Utc> = metadata
        .modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);

    let bytes = std::fs::read(path).map_err(io_err)?;
    let extension = path.extension().and_then(|e| e.to_str());
    let (kind, text) = registry
        .extract(extension, &bytes)
        .map_err(|source| DocumentReadError::Extract {
            path: rel.clone(),
            source,
        })?;

    if text.trim().is_empty() {
        return Err(DocumentReadError::Empty { path: rel });
    }

    Ok(Document {
        path: rel,
        kind,
        text,
        modified,
        size_bytes: metadata.len(),
    })
}

/// `/`-separated path of `path` relative to `root`.
fn relative_path(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    parts.join("/")
}

fn build_excludes(extra: &[String]) -> Result<GlobSet, globset::Error> {
    let mut patterns: Vec<String> = vec![
        "**/.git/**".to_string(),
        "**/.*".to_string(),
        // Office lock files left behind while a document is open.
        "**/~$*".to_string(),
    ];
    patterns.extend(extra.iter().cloned());

    let mut builder = GlobSetBuilder::new();
    for pattern in &patterns {
        builder.add(Glob::new(pattern)?);
    }
    builder.build()
}
