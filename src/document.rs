/// A single page of extracted text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    /// 1-based page number within the owning document.
    pub number: u64,
    pub text: String,
}

/// An extracted document, identified by its filename within the store.
///
/// Pages are numbered from 1 in extraction order and never change once the
/// document is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    filename: String,
    pages: Vec<Page>,
}

impl Document {
    pub fn new(filename: impl Into<String>, texts: Vec<String>) -> Self {
        let pages = texts
            .into_iter()
            .enumerate()
            .map(|(i, text)| Page {
                number: i as u64 + 1,
                text,
            })
            .collect();
        Self {
            filename: filename.into(),
            pages,
        }
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn pages(&self) -> &[Page] {
        &self.pages
    }

    pub fn page(&self, number: u64) -> Option<&Page> {
        let idx = usize::try_from(number.checked_sub(1)?).ok()?;
        self.pages.get(idx)
    }
}

/// Public location of a page of a stored document.
pub fn page_url(filename: &str, page: u64) -> String {
    format!("/pdf/{filename}#page={page}")
}
