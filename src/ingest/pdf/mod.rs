
use async_trait::async_trait;
use std::path::Path;
use tokio::process::Command;
use tracing::{debug, warn};

use super::{OcrEngine, PageExtractor};
use crate::{Result, StudyError};

const PAGE_BREAK: char = '\u{c}';

/// Split `pdftotext` output into pages. The trailing form feed after the
/// last page does not start another page.
pub fn split_pages(text: &str) -> Vec<String> {
    if text.is_empty() {
        return Vec::new();
    }
    let text = text.strip_suffix(PAGE_BREAK).unwrap_or(text);
    text.split(PAGE_BREAK).map(str::to_string).collect()
}

/// Text layer extraction with poppler's `pdftotext`
#[derive(Debug, Clone, Default)]
pub struct PdfToText;

#[async_trait]
impl PageExtractor for PdfToText {
    async fn pages(&self, path: &Path) -> Result<Vec<String>> {
        let output = Command::new("pdftotext")
            .arg("-layout")
            .arg("-enc")
            .arg("UTF-8")
            .arg(path)
            .arg("-")
            .output()
            .await
            .map_err(|e| {
                warn!("Failed to run pdftotext command: {}", e);
                StudyError::Extraction(format!(
                    "pdftotext command failed: {e} (is poppler installed?)"
                ))
            })?;

        if !output.status.success() {
            let error_msg = String::from_utf8_lossy(&output.stderr);
            warn!("pdftotext failed on {}: {}", path.display(), error_msg.trim());
            return Err(StudyError::Extraction(format!(
                "pdftotext failed on {}: {}",
                path.display(),
                error_msg.trim()
            )));
        }

        let pages = split_pages(&String::from_utf8_lossy(&output.stdout));
        debug!("pdftotext read {} pages from {}", pages.len(), path.display());
        Ok(pages)
    }
}

/// Renders one page with `pdftoppm` and reads it back with `tesseract`
#[derive(Debug, Clone)]
pub struct TesseractOcr {
    resolution: u32,
}

impl Default for TesseractOcr {
    fn default() -> Self {
        Self { resolution: 300 }
    }
}

impl TesseractOcr {
    #[inline]
    pub fn with_resolution(mut self, dpi: u32) -> Self {
        self.resolution = dpi;
        self
    }
}

#[async_trait]
impl OcrEngine for TesseractOcr {
    async fn recognize_page(&self, path: &Path, page: usize) -> Result<String> {
        let workdir = tempfile::tempdir()?;
        let prefix = workdir.path().join("page");
        let page_arg = page.to_string();

        let render = Command::new("pdftoppm")
            .args(["-f", &page_arg, "-l", &page_arg])
            .arg("-r")
            .arg(self.resolution.to_string())
            .args(["-png", "-singlefile"])
            .arg(path)
            .arg(&prefix)
            .output()
            .await
            .map_err(|e| StudyError::Extraction(format!("pdftoppm command failed: {e}")))?;
        if !render.status.success() {
            return Err(StudyError::Extraction(format!(
                "pdftoppm could not render page {page}: {}",
                String::from_utf8_lossy(&render.stderr).trim()
            )));
        }

        let image = prefix.with_extension("png");
        let recognized = Command::new("tesseract")
            .arg(&image)
            .arg("stdout")
            .output()
            .await
            .map_err(|e| StudyError::Extraction(format!("tesseract command failed: {e}")))?;
        if !recognized.status.success() {
            return Err(StudyError::Extraction(format!(
                "tesseract could not read page {page}: {}",
                String::from_utf8_lossy(&recognized.stderr).trim()
            )));
        }

        let text = String::from_utf8_lossy(&recognized.stdout).to_string();
        debug!("OCR recovered {} characters from page {}", text.trim().len(), page);
        Ok(text)
    }
}
