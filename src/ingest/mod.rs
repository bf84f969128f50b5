// Ingest module
// Turns text and PDF documents into plain text, skipping pages with no usable content

pub mod pdf;


use async_trait::async_trait;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::embeddings::ChunkingConfig;
use crate::{Result, StudyError};

pub use pdf::{PdfToText, TesseractOcr};

/// Separator placed between the surviving pages of a document
pub const PAGE_SEPARATOR: &str = "\n\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    PlainText,
    Pdf,
}

impl DocumentKind {
    /// Infer the kind from a file name's extension
    pub fn from_name(name: &str) -> Result<Self> {
        let extension = Path::new(name)
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        match extension.as_str() {
            "txt" => Ok(DocumentKind::PlainText),
            "pdf" => Ok(DocumentKind::Pdf),
            _ => Err(StudyError::Validation(format!(
                "unsupported document type for '{name}' (expected .txt or .pdf)"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentSource {
    Path(PathBuf),
    Bytes(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    pub id: String,
    pub name: String,
    pub kind: DocumentKind,
    pub source: DocumentSource,
}

impl Document {
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path.display().to_string());
        Ok(Self {
            id: Uuid::new_v4().to_string(),
            kind: DocumentKind::from_name(&name)?,
            name,
            source: DocumentSource::Path(path.to_path_buf()),
        })
    }

    pub fn from_bytes(name: impl Into<String>, bytes: Vec<u8>) -> Result<Self> {
        let name = name.into();
        Ok(Self {
            id: Uuid::new_v4().to_string(),
            kind: DocumentKind::from_name(&name)?,
            name,
            source: DocumentSource::Bytes(bytes),
        })
    }

    /// Replace the generated identifier
    #[inline]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }
}

/// Plain text recovered from a document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedText {
    pub document_id: String,
    pub document_name: String,
    pub text: String,
    pub pages_kept: usize,
    pub pages_skipped: usize,
    pub pages_recovered_by_ocr: usize,
}

/// Reads the text layer of a PDF, one string per page
#[async_trait]
pub trait PageExtractor: Send + Sync {
    async fn pages(&self, path: &Path) -> Result<Vec<String>>;
}

/// Image-to-text fallback for pages without a text layer
#[async_trait]
pub trait OcrEngine: Send + Sync {
    /// `page` is 1-based
    async fn recognize_page(&self, path: &Path, page: usize) -> Result<String>;
}

#[derive(Clone)]
pub struct DocumentIngestor {
    extractor: Arc<dyn PageExtractor>,
    ocr: Option<Arc<dyn OcrEngine>>,
    min_page_chars: usize,
}

impl DocumentIngestor {
    /// Poppler text extraction, with tesseract OCR when enabled
    pub fn new(config: &ChunkingConfig) -> Self {
        let ocr: Option<Arc<dyn OcrEngine>> = if config.ocr_fallback {
            Some(Arc::new(TesseractOcr::default()))
        } else {
            None
        };
        Self::with_backends(Arc::new(PdfToText), ocr, config.min_page_chars)
    }

    #[inline]
    pub fn with_backends(
        extractor: Arc<dyn PageExtractor>,
        ocr: Option<Arc<dyn OcrEngine>>,
        min_page_chars: usize,
    ) -> Self {
        Self {
            extractor,
            ocr,
            min_page_chars,
        }
    }

    /// Extract the usable text of `document`.
    ///
    /// Fails with [`StudyError::Extraction`] when no page survives.
    pub async fn extract(&self, document: &Document) -> Result<ExtractedText> {
        let extracted = match document.kind {
            DocumentKind::PlainText => self.extract_plain_text(document).await?,
            DocumentKind::Pdf => match &document.source {
                DocumentSource::Path(path) => self.extract_pdf(document, path).await?,
                DocumentSource::Bytes(bytes) => {
                    let mut spill = tempfile::Builder::new()
                        .prefix("medbot-upload-")
                        .suffix(".pdf")
                        .tempfile()?;
                    spill.write_all(bytes)?;
                    spill.flush()?;
                    self.extract_pdf(document, spill.path()).await?
                }
            },
        };

        if extracted.text.is_empty() {
            warn!(
                "No usable content in {} ({} pages skipped)",
                document.name, extracted.pages_skipped
            );
            return Err(StudyError::Extraction(format!(
                "no page of '{}' has more than {} characters of text",
                document.name, self.min_page_chars
            )));
        }

        info!(
            "Extracted {} characters from {} ({} pages kept, {} skipped, {} via OCR)",
            extracted.text.len(),
            document.name,
            extracted.pages_kept,
            extracted.pages_skipped,
            extracted.pages_recovered_by_ocr
        );
        Ok(extracted)
    }

    async fn extract_plain_text(&self, document: &Document) -> Result<ExtractedText> {
        let raw = match &document.source {
            DocumentSource::Path(path) => {
                let bytes = tokio::fs::read(path).await.map_err(|e| {
                    StudyError::Extraction(format!("failed to read {}: {e}", path.display()))
                })?;
                String::from_utf8_lossy(&bytes).to_string()
            }
            DocumentSource::Bytes(bytes) => String::from_utf8_lossy(bytes).to_string(),
        };

        let mut extracted = self.empty_result(document);
        for page in pdf::split_pages(&raw) {
            self.keep_or_skip(&mut extracted, &page, false);
        }
        Ok(extracted)
    }

    async fn extract_pdf(&self, document: &Document, path: &Path) -> Result<ExtractedText> {
        let pages = self.extractor.pages(path).await?;
        let mut extracted = self.empty_result(document);

        for (index, page) in pages.iter().enumerate() {
            if !page.trim().is_empty() {
                self.keep_or_skip(&mut extracted, page, false);
                continue;
            }

            let Some(ocr) = &self.ocr else {
                debug!("Page {} of {} has no text layer", index + 1, document.name);
                extracted.pages_skipped += 1;
                continue;
            };

            info!("Page {} of {} has no text, trying OCR", index + 1, document.name);
            match ocr.recognize_page(path, index + 1).await {
                Ok(text) => self.keep_or_skip(&mut extracted, &text, true),
                Err(e) => {
                    warn!("OCR failed on page {} of {}: {}", index + 1, document.name, e);
                    extracted.pages_skipped += 1;
                }
            }
        }

        Ok(extracted)
    }

    fn empty_result(&self, document: &Document) -> ExtractedText {
        ExtractedText {
            document_id: document.id.clone(),
            document_name: document.name.clone(),
            text: String::new(),
            pages_kept: 0,
            pages_skipped: 0,
            pages_recovered_by_ocr: 0,
        }
    }

    fn keep_or_skip(&self, extracted: &mut ExtractedText, page: &str, via_ocr: bool) {
        let page = page.trim();
        if page.chars().count() <= self.min_page_chars {
            debug!(
                "Skipping page with {} characters in {}",
                page.chars().count(),
                extracted.document_name
            );
            extracted.pages_skipped += 1;
            return;
        }

        if !extracted.text.is_empty() {
            extracted.text.push_str(PAGE_SEPARATOR);
        }
        extracted.text.push_str(page);
        extracted.pages_kept += 1;
        if via_ocr {
            extracted.pages_recovered_by_ocr += 1;
        }
    }
}

impl std::fmt::Debug for DocumentIngestor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentIngestor")
            .field("ocr", &self.ocr.is_some())
            .field("min_page_chars", &self.min_page_chars)
            .finish_non_exhaustive()
    }
}

/// Every `.txt` and `.pdf` file under `dir`, sorted by path.
///
/// The directory is created when it does not exist yet.
pub fn collect_documents<P: AsRef<Path>>(dir: P) -> Result<Vec<Document>> {
    let dir = dir.as_ref();
    if !dir.exists() {
        warn!("Material folder not found: {}. Creating it.", dir.display());
        fs::create_dir_all(dir)?;
        return Ok(Vec::new());
    }

    let mut paths = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        for entry in fs::read_dir(&current)? {
            let path = entry?.path();
            if path.is_dir() {
                pending.push(path);
            } else {
                paths.push(path);
            }
        }
    }
    paths.sort();

    let documents: Vec<Document> = paths
        .into_iter()
        .filter_map(|path| match Document::from_path(&path) {
            Ok(document) => Some(document),
            Err(_) => {
                debug!("Ignoring unsupported file {}", path.display());
                None
            }
        })
        .collect();

    debug!("Found {} documents in {}", documents.len(), dir.display());
    Ok(documents)
}
