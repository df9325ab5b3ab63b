use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("index error: {0}")]
    Index(#[from] IndexError),

    #[error("query error: {0}")]
    Query(#[from] QueryError),

    #[error("search index error: {0}")]
    Tantivy(#[from] tantivy::TantivyError),

    #[error("database error: {0}")]
    Redb(#[from] redb::Error),

    #[error("database open error: {0}")]
    RedbDatabase(#[from] redb::DatabaseError),

    #[error("database storage error: {0}")]
    RedbStorage(#[from] redb::StorageError),

    #[error("database transaction error: {0}")]
    RedbTransaction(#[from] redb::TransactionError),

    #[error("database table error: {0}")]
    RedbTable(#[from] redb::TableError),

    #[error("database commit error: {0}")]
    RedbCommit(#[from] redb::CommitError),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("text extraction failed: {0}")]
    Extract(String),

    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    #[error("data directory does not exist and could not be created: {0}")]
    DataDir(PathBuf),

    #[error("search failed: {0}")]
    Search(String),
}

/// Failures while writing pages into the index store.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("index store I/O failure: {0}")]
    IoFailure(String),

    #[error("text extraction produced no pages for {0}")]
    ExtractionFailure(String),
}

impl From<tantivy::TantivyError> for IndexError {
    fn from(e: tantivy::TantivyError) -> Self {
        IndexError::IoFailure(e.to_string())
    }
}

impl From<std::io::Error> for IndexError {
    fn from(e: std::io::Error) -> Self {
        IndexError::IoFailure(e.to_string())
    }
}

/// Failures while resolving a query into candidate pages.
#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("malformed query: {0}")]
    MalformedQuery(String),

    #[error(transparent)]
    Store(#[from] IndexError),
}

impl From<tantivy::TantivyError> for QueryError {
    fn from(e: tantivy::TantivyError) -> Self {
        QueryError::Store(e.into())
    }
}

/// A candidate page that could not be localized. Given a well-formed index
/// this does not happen, so it is reported as a bug signal.
#[derive(Debug, thiserror::Error)]
#[error("localization fault on {filename} page {page}: {detail}")]
pub struct LocalizationFault {
    pub filename: String,
    pub page: u64,
    pub detail: String,
}
