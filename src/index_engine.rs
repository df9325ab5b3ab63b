use std::{
    path::Path,
    sync::{
        Mutex,
        atomic::{AtomicU64, Ordering},
    },
};

use tantivy::{
    DocAddress,
    Index,
    IndexReader,
    IndexWriter,
    ReloadPolicy,
    Searcher,
    TantivyDocument,
    Term,
    collector::TopDocs,
    doc,
    query::QueryParser,
    schema::*,
    tokenizer::{
        LowerCaser,
        RemoveLongFilter,
        SimpleTokenizer,
        Stemmer,
        TextAnalyzer,
    },
};
use tracing::{debug, info};

use crate::{
    config::{DEFAULT_CANDIDATE_LIMIT, DEFAULT_WRITER_MEMORY, MAX_CANDIDATE_LIMIT},
    document::Document,
    error::{IndexError, QueryError, Result},
};

/// Field names used in the schema.
pub mod fields {
    pub const FILENAME: &str = "filename";
    pub const PAGE: &str = "page";
    pub const CONTENT: &str = "content";
    /// Insertion sequence, used to break relevance ties.
    pub const SEQ: &str = "seq";
}

const PAGE_TOKENIZER: &str = "en_stem";

/// Resolved field handles for the schema.
#[derive(Clone, Copy)]
pub struct SchemaFields {
    pub filename: Field,
    pub page: Field,
    pub content: Field,
    pub seq: Field,
}

impl SchemaFields {
    fn resolve(schema: &Schema) -> tantivy::Result<Self> {
        Ok(Self {
            filename: schema.get_field(fields::FILENAME)?,
            page: schema.get_field(fields::PAGE)?,
            content: schema.get_field(fields::CONTENT)?,
            seq: schema.get_field(fields::SEQ)?,
        })
    }
}

fn build_schema() -> Schema {
    let mut builder = Schema::builder();

    builder.add_text_field(fields::FILENAME, STRING | STORED);
    builder.add_u64_field(fields::PAGE, STORED);

    let content_opts = TextOptions::default()
        .set_indexing_options(
            TextFieldIndexing::default()
                .set_tokenizer(PAGE_TOKENIZER)
                .set_index_option(IndexRecordOption::WithFreqsAndPositions),
        )
        .set_stored();
    builder.add_text_field(fields::CONTENT, content_opts);

    builder.add_u64_field(fields::SEQ, STORED | FAST);

    builder.build()
}

fn register_tokenizers(index: &Index) {
    let en_stem = TextAnalyzer::builder(SimpleTokenizer::default())
        .filter(RemoveLongFilter::limit(40))
        .filter(LowerCaser)
        .filter(Stemmer::new(tantivy::tokenizer::Language::English))
        .build();
    index.tokenizers().register(PAGE_TOKENIZER, en_stem);
}

/// Page-level inverted index over stored documents.
///
/// One tantivy document per page, keyed by `(filename, page)`, with the raw
/// page text stored next to the postings. Writers are serialized through
/// `write_lock`; readers get a point-in-time [`Searcher`] that is reloaded
/// only after a successful commit, so a query never observes a half-written
/// document.
pub struct IndexEngine {
    index: Index,
    reader: IndexReader,
    fields: SchemaFields,
    write_lock: Mutex<()>,
    next_seq: AtomicU64,
    writer_memory: usize,
    candidate_limit: usize,
}

/// A page returned by the index as plausibly containing the query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidatePage {
    pub filename: String,
    pub page: u64,
    /// Stored raw text. Always present for pages written by
    /// [`IndexEngine::index_document`].
    pub text: Option<String>,
}

impl IndexEngine {
    /// Open or create an index at the given directory.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;

        let mmap_dir = tantivy::directory::MmapDirectory::open(dir)
            .map_err(|e| tantivy::TantivyError::SystemError(e.to_string()))?;
        let index = if Index::exists(&mmap_dir)
            .map_err(|e| tantivy::TantivyError::SystemError(e.to_string()))?
        {
            Index::open(mmap_dir)?
        } else {
            Index::create(
                mmap_dir,
                build_schema(),
                tantivy::IndexSettings::default(),
            )?
        };

        let engine = Self::from_index(index)?;
        info!(
            dir = %dir.display(),
            pages = engine.num_pages(),
            "opened page index"
        );
        Ok(engine)
    }

    /// Create an in-memory index (for testing).
    pub fn open_in_ram() -> Result<Self> {
        Self::from_index(Index::create_in_ram(build_schema()))
    }

    fn from_index(index: Index) -> Result<Self> {
        register_tokenizers(&index);
        let fields = SchemaFields::resolve(&index.schema())?;
        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()?;
        let next_seq = next_sequence(&reader)?;

        Ok(Self {
            index,
            reader,
            fields,
            write_lock: Mutex::new(()),
            next_seq: AtomicU64::new(next_seq),
            writer_memory: DEFAULT_WRITER_MEMORY,
            candidate_limit: DEFAULT_CANDIDATE_LIMIT,
        })
    }

    /// Cap on candidate pages per query, clamped to `1..=MAX_CANDIDATE_LIMIT`.
    pub fn with_candidate_limit(mut self, limit: usize) -> Self {
        self.candidate_limit = limit.clamp(1, MAX_CANDIDATE_LIMIT);
        self
    }

    pub fn with_writer_memory(mut self, bytes: usize) -> Self {
        self.writer_memory = bytes;
        self
    }

    pub fn fields(&self) -> SchemaFields {
        self.fields
    }

    /// Number of live pages in the current snapshot.
    pub fn num_pages(&self) -> u64 {
        self.reader.searcher().num_docs()
    }

    /// Index every page of `doc`, replacing any pages previously stored
    /// under the same filename.
    pub fn index_document(
        &self,
        doc: &Document,
    ) -> std::result::Result<(), IndexError> {
        if doc.pages().is_empty() {
            return Err(IndexError::ExtractionFailure(
                doc.filename().to_string(),
            ));
        }

        self.write(|writer, f| {
            writer.delete_term(Term::from_field_text(
                f.filename,
                doc.filename(),
            ));
            for page in doc.pages() {
                let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
                writer.add_document(doc!(
                    f.filename => doc.filename(),
                    f.page => page.number,
                    f.content => page.text.as_str(),
                    f.seq => seq,
                ))?;
            }
            Ok(())
        })?;

        debug!(
            filename = doc.filename(),
            pages = doc.pages().len(),
            "indexed document"
        );
        Ok(())
    }

    /// Delete every page stored under `filename`.
    pub fn remove_document(
        &self,
        filename: &str,
    ) -> std::result::Result<(), IndexError> {
        self.write(|writer, f| {
            writer.delete_term(Term::from_field_text(f.filename, filename));
            Ok(())
        })
    }

    /// Delete every page in the index.
    pub fn clear(&self) -> std::result::Result<(), IndexError> {
        self.write(|writer, _| {
            writer.delete_all_documents()?;
            Ok(())
        })
    }

    /// Run `op` against a fresh writer while holding the write lock, then
    /// commit and publish the new snapshot to readers. Dropping the writer
    /// without committing discards the batch.
    fn write<F>(&self, op: F) -> std::result::Result<(), IndexError>
    where
        F: FnOnce(&IndexWriter, SchemaFields) -> tantivy::Result<()>,
    {
        let _guard = self.write_lock.lock().map_err(|_| {
            IndexError::IoFailure("index write lock poisoned".to_string())
        })?;

        let mut writer: IndexWriter = self.index.writer(self.writer_memory)?;
        op(&writer, self.fields)?;
        writer.commit()?;
        self.reader.reload()?;
        Ok(())
    }

    /// Resolve `text` into candidate pages, best match first.
    ///
    /// Ties in relevance keep insertion order. At most `candidate_limit`
    /// pages are returned, and page text is only loaded as the returned
    /// iterator advances. Blank queries match nothing.
    pub fn query(
        &self,
        text: &str,
    ) -> std::result::Result<Candidates, QueryError> {
        let searcher = self.reader.searcher();
        if text.trim().is_empty() {
            return Ok(Candidates::new(searcher, self.fields, Vec::new()));
        }

        check_syntax(text)?;
        let parser = QueryParser::for_index(&self.index, vec![self.fields.content]);
        let query = parser
            .parse_query(text)
            .map_err(|e| QueryError::MalformedQuery(e.to_string()))?;

        let top_docs =
            searcher.search(&query, &TopDocs::with_limit(self.candidate_limit))?;

        let mut ranked = Vec::with_capacity(top_docs.len());
        for (score, address) in top_docs {
            let seq = searcher
                .segment_reader(address.segment_ord)
                .fast_fields()
                .u64(fields::SEQ)?
                .first(address.doc_id)
                .unwrap_or(u64::MAX);
            ranked.push((score, seq, address));
        }
        ranked.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)));

        debug!(query = text, candidates = ranked.len(), "resolved candidates");
        let hits = ranked.into_iter().map(|(_, _, address)| address).collect();
        Ok(Candidates::new(searcher, self.fields, hits))
    }
}

impl std::fmt::Debug for IndexEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexEngine")
            .field("candidate_limit", &self.candidate_limit)
            .finish_non_exhaustive()
    }
}

/// Lazily loaded candidate pages from one index snapshot.
///
/// Holds the snapshot's segment readers until dropped.
pub struct Candidates {
    searcher: Searcher,
    fields: SchemaFields,
    hits: std::vec::IntoIter<DocAddress>,
}

impl Candidates {
    fn new(searcher: Searcher, fields: SchemaFields, hits: Vec<DocAddress>) -> Self {
        Self {
            searcher,
            fields,
            hits: hits.into_iter(),
        }
    }

    /// Candidates not yet yielded.
    pub fn remaining(&self) -> usize {
        self.hits.len()
    }

    fn load(
        &self,
        address: DocAddress,
    ) -> std::result::Result<CandidatePage, IndexError> {
        let doc: TantivyDocument = self.searcher.doc(address)?;
        let f = self.fields;
        Ok(CandidatePage {
            filename: extract_text(&doc, f.filename),
            page: doc.get_first(f.page).and_then(|v| v.as_u64()).unwrap_or(0),
            text: doc
                .get_first(f.content)
                .and_then(|v| v.as_str())
                .map(str::to_string),
        })
    }
}

impl Iterator for Candidates {
    type Item = std::result::Result<CandidatePage, IndexError>;

    fn next(&mut self) -> Option<Self::Item> {
        let address = self.hits.next()?;
        Some(self.load(address))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.hits.size_hint()
    }
}

fn extract_text(doc: &TantivyDocument, field: Field) -> String {
    doc.get_first(field)
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string()
}

fn next_sequence(reader: &IndexReader) -> tantivy::Result<u64> {
    let searcher = reader.searcher();
    let mut next = 0;
    for segment in searcher.segment_readers() {
        if segment.max_doc() == 0 {
            continue;
        }
        let column = segment.fast_fields().u64(fields::SEQ)?;
        next = next.max(column.max_value().saturating_add(1));
    }
    Ok(next)
}

/// Reject queries with unbalanced quotes or parentheses, or with a boolean
/// operator missing an operand.
pub fn check_syntax(text: &str) -> std::result::Result<(), QueryError> {
    let malformed = |reason: &str| {
        Err(QueryError::MalformedQuery(format!("{reason} in '{text}'")))
    };

    let mut depth: i64 = 0;
    let mut in_quotes = false;
    for c in text.chars() {
        match c {
            '"' => in_quotes = !in_quotes,
            '(' if !in_quotes => depth += 1,
            ')' if !in_quotes => {
                depth -= 1;
                if depth < 0 {
                    return malformed("unexpected ')'");
                }
            }
            _ => {}
        }
    }
    if in_quotes {
        return malformed("unterminated quote");
    }
    if depth > 0 {
        return malformed("unclosed '('");
    }

    let words: Vec<&str> = text
        .split(|c: char| c.is_whitespace() || c == '(' || c == ')')
        .filter(|w| !w.is_empty())
        .collect();
    let is_binary = |w: &&str| *w == "AND" || *w == "OR";
    if words.first().is_some_and(is_binary) {
        return malformed("operator without left operand");
    }
    if words
        .last()
        .is_some_and(|w| is_binary(w) || *w == "NOT")
    {
        return malformed("operator without right operand");
    }

    Ok(())
}
