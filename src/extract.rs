//! Text extraction collaborators.
//!
//! PDF decoding itself is delegated: `.pdf` files go through the external
//! `pdftotext` tool, and `.txt` files are treated as already-extracted text
//! in the same format, with form feeds (`\x0c`) separating pages.

use std::{path::Path, process::Command};

use tracing::debug;

use crate::error::{Error, Result};

/// Page break marker emitted by `pdftotext`.
pub const PAGE_BREAK: char = '\x0c';

/// Turns a stored file into per-page raw text.
pub trait TextExtractor: Send + Sync {
    fn extract(&self, path: &Path) -> Result<Vec<String>>;
}

/// Reads form-feed separated plain text.
#[derive(Debug, Default, Clone, Copy)]
pub struct PagedTextExtractor;

impl TextExtractor for PagedTextExtractor {
    fn extract(&self, path: &Path) -> Result<Vec<String>> {
        let raw = std::fs::read_to_string(path)?;
        Ok(split_pages(&raw))
    }
}

/// Shells out to `pdftotext` (poppler) and splits its output into pages.
#[derive(Debug, Clone)]
pub struct PdftotextExtractor {
    program: String,
}

impl Default for PdftotextExtractor {
    fn default() -> Self {
        Self {
            program: "pdftotext".to_string(),
        }
    }
}

impl TextExtractor for PdftotextExtractor {
    fn extract(&self, path: &Path) -> Result<Vec<String>> {
        debug!(path = %path.display(), "running {}", self.program);
        let output = Command::new(&self.program)
            .arg("-enc")
            .arg("UTF-8")
            .arg(path)
            .arg("-")
            .output()
            .map_err(|e| {
                Error::Extract(format!("failed to run {}: {e}", self.program))
            })?;

        if !output.status.success() {
            return Err(Error::Extract(format!(
                "{} failed on {}: {}",
                self.program,
                path.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok(split_pages(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// Supported upload extensions, lowercase.
pub const SUPPORTED_EXTENSIONS: &[&str] = &["pdf", "txt"];

/// Pick the extractor for a file based on its extension.
pub fn extractor_for(path: &Path) -> Result<Box<dyn TextExtractor>> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);

    match ext.as_deref() {
        Some("pdf") => Ok(Box::new(PdftotextExtractor::default())),
        Some("txt") => Ok(Box::new(PagedTextExtractor)),
        _ => Err(Error::Extract(format!(
            "unsupported file type: {} (expected .pdf or .txt)",
            path.display()
        ))),
    }
}

/// Split form-feed separated text into pages.
///
/// Line endings are normalized to `\n`. A trailing page break does not
/// start a new page, so empty input yields no pages at all.
pub fn split_pages(raw: &str) -> Vec<String> {
    let normalized = raw.replace("\r\n", "\n");
    let mut pages: Vec<String> =
        normalized.split(PAGE_BREAK).map(str::to_string).collect();
    if pages.last().is_some_and(|p| p.is_empty()) {
        pages.pop();
    }
    pages
}
