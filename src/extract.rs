//! Text extraction, keyed by file type.
//!
//! An [`ExtractorRegistry`] maps lower-cased file extensions to a
//! [`DocumentKind`] and a [`TextExtractor`]. Extractors turn raw bytes into
//! UTF-8 text or fail locally with an [`ExtractError`]; the loader records
//! the failure and moves on. Files whose extension is not registered are
//! sniffed: UTF-8-ish content without NUL bytes is read as plain text,
//! anything else is an unsupported binary.

use std::collections::HashMap;
use std::io::Read;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use quick_xml::events::Event;

use crate::error::ExtractError;
use crate::models::DocumentKind;

/// Separator placed between PDF pages and between Word paragraphs.
pub const SEGMENT_SEPARATOR: &str = "\n";

/// Maximum decompressed bytes to read from a single ZIP entry (zip-bomb protection).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;
/// Maximum sheets to read from a workbook.
const XLSX_MAX_SHEETS: usize = 100;
/// Maximum cells to read per sheet.
const XLSX_MAX_CELLS_PER_SHEET: usize = 100_000;
/// Bytes inspected when sniffing an unknown file for binary content.
const SNIFF_BYTES: usize = 8192;

/// Produces text from a file's bytes, or fails for that file alone.
pub trait TextExtractor: Send + Sync {
    fn extract(&self, bytes: &[u8]) -> Result<String, ExtractError>;
}

/// Registry of extractors by file extension.
pub struct ExtractorRegistry {
    by_extension: HashMap<String, (DocumentKind, Arc<dyn TextExtractor>)>,
}

impl ExtractorRegistry {
    /// An empty registry. Every file goes through content sniffing.
    pub fn new() -> Self {
        Self {
            by_extension: HashMap::new(),
        }
    }

    /// Registry with the built-in formats: text, markdown, PDF, docx, pptx, xlsx.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        let text: Arc<dyn TextExtractor> = Arc::new(PlainTextExtractor);
        for ext in ["txt", "text", "csv", "json", "html", "htm", "rst", "log"] {
            registry.register(ext, DocumentKind::Text, text.clone());
        }
        registry.register("md", DocumentKind::Markdown, text.clone());
        registry.register("markdown", DocumentKind::Markdown, text);
        registry.register("pdf", DocumentKind::Pdf, Arc::new(PdfExtractor));
        registry.register("docx", DocumentKind::Word, Arc::new(DocxExtractor));
        registry.register("pptx", DocumentKind::Presentation, Arc::new(PptxExtractor));
        registry.register("xlsx", DocumentKind::Spreadsheet, Arc::new(XlsxExtractor));
        registry
    }

    /// Register (or replace) the extractor for an extension.
    pub fn register(&mut self, extension: &str, kind: DocumentKind, extractor: Arc<dyn TextExtractor>) {
        self.by_extension
            .insert(extension.to_ascii_lowercase(), (kind, extractor));
    }

    /// Extract text from `bytes` of a file with the given extension.
    pub fn extract(
        &self,
        extension: Option<&str>,
        bytes: &[u8],
    ) -> Result<(DocumentKind, String), ExtractError> {
        let entry = extension.and_then(|ext| self.by_extension.get(&ext.to_ascii_lowercase()));
        match entry {
            Some((kind, extractor)) => Ok((*kind, extractor.extract(bytes)?)),
            None => {
                if looks_binary(bytes) {
                    Err(ExtractError::UnsupportedBinary)
                } else {
                    Ok((DocumentKind::Text, decode_lossy(bytes)))
                }
            }
        }
    }
}

impl Default for ExtractorRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

fn looks_binary(bytes: &[u8]) -> bool {
    let head = &bytes[..bytes.len().min(SNIFF_BYTES)];
    if head.contains(&0) {
        return true;
    }
    match std::str::from_utf8(head) {
        Ok(_) => false,
        // A multi-byte sequence cut at the sniff boundary is still text.
        Err(e) => e.error_len().is_some(),
    }
}

/// UTF-8 decode, replacing invalid sequences instead of failing.
fn decode_lossy(bytes: &[u8]) -> String {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}

pub struct PlainTextExtractor;

impl TextExtractor for PlainTextExtractor {
    fn extract(&self, bytes: &[u8]) -> Result<String, ExtractError> {
        Ok(decode_lossy(bytes))
    }
}

/// Concatenates per-page text; pages without extractable text are skipped.
pub struct PdfExtractor;

impl TextExtractor for PdfExtractor {
    fn extract(&self, bytes: &[u8]) -> Result<String, ExtractError> {
        // pdf-extract panics on some malformed inputs; keep it contained to this file.
        let pages = catch_unwind(AssertUnwindSafe(|| {
            pdf_extract::extract_text_from_mem_by_pages(bytes)
        }))
        .map_err(|_| ExtractError::Pdf("parser panicked".to_string()))?
        .map_err(|e| ExtractError::Pdf(e.to_string()))?;

        let text = pages
            .iter()
            .map(|page| page.trim())
            .filter(|page| !page.is_empty())
            .collect::<Vec<_>>()
            .join(SEGMENT_SEPARATOR);
        Ok(text)
    }
}

/// Word-processor documents: one line per `w:p` paragraph.
pub struct DocxExtractor;

impl TextExtractor for DocxExtractor {
    fn extract(&self, bytes: &[u8]) -> Result<String, ExtractError> {
        let mut archive = open_archive(bytes)?;
        let xml = read_zip_entry_bounded(&mut archive, "word/document.xml", MAX_XML_ENTRY_BYTES)?;
        let paragraphs = extract_paragraphs(&xml, b"p")?;
        Ok(paragraphs.join(SEGMENT_SEPARATOR))
    }
}

/// Presentations: slides in numeric order, one line per `a:p` paragraph.
pub struct PptxExtractor;

impl TextExtractor for PptxExtractor {
    fn extract(&self, bytes: &[u8]) -> Result<String, ExtractError> {
        let mut archive = open_archive(bytes)?;
        let slide_names = numbered_entries(&archive, "ppt/slides/slide");
        let mut lines = Vec::new();
        for name in slide_names {
            let xml = read_zip_entry_bounded(&mut archive, &name, MAX_XML_ENTRY_BYTES)?;
            lines.extend(extract_paragraphs(&xml, b"p")?);
        }
        Ok(lines.join(SEGMENT_SEPARATOR))
    }
}

/// Spreadsheets: shared-string cells, one line per sheet.
pub struct XlsxExtractor;

impl TextExtractor for XlsxExtractor {
    fn extract(&self, bytes: &[u8]) -> Result<String, ExtractError> {
        let mut archive = open_archive(bytes)?;
        let shared_strings = read_shared_strings(&mut archive)?;
        let sheet_names = numbered_entries(&archive, "xl/worksheets/sheet");
        let mut lines = Vec::new();
        for name in sheet_names.into_iter().take(XLSX_MAX_SHEETS) {
            let xml = read_zip_entry_bounded(&mut archive, &name, MAX_XML_ENTRY_BYTES)?;
            let cells = extract_sheet_cells(&xml, &shared_strings)?;
            if !cells.is_empty() {
                lines.push(cells);
            }
        }
        Ok(lines.join(SEGMENT_SEPARATOR))
    }
}

type Archive<'a> = zip::ZipArchive<std::io::Cursor<&'a [u8]>>;

fn open_archive(bytes: &[u8]) -> Result<Archive<'_>, ExtractError> {
    zip::ZipArchive::new(std::io::Cursor::new(bytes)).map_err(|e| ExtractError::Ooxml(e.to_string()))
}

fn read_zip_entry_bounded(
    archive: &mut Archive<'_>,
    name: &str,
    max_bytes: u64,
) -> Result<Vec<u8>, ExtractError> {
    let entry = archive
        .by_name(name)
        .map_err(|e| ExtractError::Ooxml(format!("{}: {}", name, e)))?;
    let mut out = Vec::new();
    entry
        .take(max_bytes)
        .read_to_end(&mut out)
        .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
    if out.len() as u64 >= max_bytes {
        return Err(ExtractError::Ooxml(format!(
            "ZIP entry {} exceeds size limit ({} bytes)",
            name, max_bytes
        )));
    }
    Ok(out)
}

/// Entries `<prefix><n>.xml`, sorted by `n`.
fn numbered_entries(archive: &Archive<'_>, prefix: &str) -> Vec<String> {
    let mut names: Vec<String> = archive
        .file_names()
        .filter(|n| n.starts_with(prefix) && n.ends_with(".xml"))
        .map(|s| s.to_string())
        .collect();
    names.sort_by_key(|name| {
        name.trim_start_matches(prefix)
            .trim_end_matches(".xml")
            .parse::<u32>()
            .unwrap_or(u32::MAX)
    });
    names
}

/// Collect the text of `t` runs, grouped by the enclosing paragraph element.
/// Empty paragraphs are dropped.
fn extract_paragraphs(xml: &[u8], paragraph_tag: &[u8]) -> Result<Vec<String>, ExtractError> {
    let mut paragraphs = Vec::new();
    let mut current = String::new();
    let mut in_text = false;
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"t" => in_text = true,
            Ok(Event::Empty(e)) if e.local_name().as_ref() == b"tab" => current.push('\t'),
            Ok(Event::Text(te)) if in_text => {
                current.push_str(te.unescape().unwrap_or_default().as_ref());
            }
            Ok(Event::End(e)) => {
                let name = e.local_name();
                if name.as_ref() == b"t" {
                    in_text = false;
                } else if name.as_ref() == paragraph_tag {
                    let para = current.trim();
                    if !para.is_empty() {
                        paragraphs.push(para.to_string());
                    }
                    current.clear();
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    let tail = current.trim();
    if !tail.is_empty() {
        paragraphs.push(tail.to_string());
    }
    Ok(paragraphs)
}

fn read_shared_strings(archive: &mut Archive<'_>) -> Result<Vec<String>, ExtractError> {
    // Workbooks with only numeric cells have no shared strings part.
    if archive.by_name("xl/sharedStrings.xml").is_err() {
        return Ok(Vec::new());
    }
    let xml = read_zip_entry_bounded(archive, "xl/sharedStrings.xml", MAX_XML_ENTRY_BYTES)?;
    let mut strings = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml.as_slice());
    let mut buf = Vec::new();
    let mut current: Option<String> = None;
    let mut in_text = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"si" => current = Some(String::new()),
                b"t" => in_text = true,
                _ => {}
            },
            Ok(Event::Text(te)) if in_text => {
                if let Some(s) = current.as_mut() {
                    s.push_str(te.unescape().unwrap_or_default().as_ref());
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"si" => strings.push(current.take().unwrap_or_default()),
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(strings)
}

fn extract_sheet_cells(xml: &[u8], shared_strings: &[String]) -> Result<String, ExtractError> {
    let mut cells: Vec<String> = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut in_v = false;
    let mut cell_is_shared_str = false;
    loop {
        if cells.len() >= XLSX_MAX_CELLS_PER_SHEET {
            break;
        }
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                if e.local_name().as_ref() == b"c" {
                    cell_is_shared_str = e.attributes().any(|a| {
                        a.as_ref()
                            .map(|a| a.key.as_ref() == b"t" && a.value.as_ref() == b"s")
                            .unwrap_or(false)
                    });
                } else if e.local_name().as_ref() == b"v" {
                    in_v = true;
                }
            }
            Ok(Event::Text(te)) if in_v => {
                let v = te.unescape().unwrap_or_default();
                let s = v.trim();
                if cell_is_shared_str {
                    if let Some(text) = s.parse::<usize>().ok().and_then(|i| shared_strings.get(i)) {
                        cells.push(text.clone());
                    }
                } else if !s.is_empty() {
                    cells.push(s.to_string());
                }
            }
            Ok(Event::End(e)) => {
                if e.local_name().as_ref() == b"v" {
                    in_v = false;
                } else if e.local_name().as_ref() == b"c" {
                    cell_is_shared_str = false;
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(cells.join(" "))
}
