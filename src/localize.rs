//! Paragraph/line localization of a query inside one page of text.
//!
//! Candidate pages come from the stemmed index; here the query is matched as
//! a literal, case-insensitive substring so every hit points at visible text.

use std::{iter::Enumerate, str::Split};

/// Separator between paragraphs: a blank line.
pub const PARAGRAPH_BREAK: &str = "\n\n";

/// One matching line within a page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineMatch {
    /// 1-based paragraph ordinal within the page.
    pub paragraph: usize,
    /// 1-based line ordinal within the paragraph.
    pub line: usize,
    /// The matching line, verbatim.
    pub content: String,
}

/// Find every line of `text` containing `query`, in document order.
///
/// Paragraphs that do not contain the query are skipped without being split
/// into lines. A blank query matches nothing.
///
/// ```
/// use folioscan::localize::find;
///
/// let page = "Intro\n\nClause A\nThe lot is defined in Annex B\nEnd";
/// let hits: Vec<_> = find(page, "LOT").collect();
/// assert_eq!(hits.len(), 1);
/// assert_eq!((hits[0].paragraph, hits[0].line), (2, 2));
/// ```
pub fn find<'a>(text: &'a str, query: &str) -> LineMatches<'a> {
    let needle = if query.trim().is_empty() {
        None
    } else {
        Some(query.to_lowercase())
    };
    LineMatches {
        needle,
        paragraphs: text.split(PARAGRAPH_BREAK).enumerate(),
        current: None,
    }
}

/// Lazy iterator returned by [`find`].
pub struct LineMatches<'a> {
    needle: Option<String>,
    paragraphs: Enumerate<Split<'a, &'static str>>,
    current: Option<(usize, Enumerate<Split<'a, char>>)>,
}

impl Iterator for LineMatches<'_> {
    type Item = LineMatch;

    fn next(&mut self) -> Option<LineMatch> {
        let needle = self.needle.as_deref()?;

        loop {
            if let Some((paragraph, lines)) = self.current.as_mut() {
                for (idx, line) in lines.by_ref() {
                    if line.to_lowercase().contains(needle) {
                        return Some(LineMatch {
                            paragraph: *paragraph,
                            line: idx + 1,
                            content: line.to_string(),
                        });
                    }
                }
                self.current = None;
            }

            let (idx, paragraph) = self.paragraphs.next()?;
            if paragraph.to_lowercase().contains(needle) {
                self.current = Some((idx + 1, paragraph.split('\n').enumerate()));
            }
        }
    }
}
