//! Stored documents: upload, removal and re-indexing.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use chrono::Local;
use rayon::prelude::*;
use tracing::{info, warn};

use crate::{
    audit::{AuditLog, AuditRecord},
    catalog::{Catalog, DocumentRecord},
    document::Document,
    error::{Error, Result},
    extract::extractor_for,
    index_engine::IndexEngine,
};

/// Public location of a stored document.
pub fn document_url(filename: &str) -> String {
    format!("/pdf/{filename}")
}

/// Owns the document store and keeps the catalog and the page index in step
/// with it.
#[derive(Debug)]
pub struct Library {
    documents_dir: PathBuf,
    catalog: Catalog,
    engine: Arc<IndexEngine>,
    audit: Option<AuditLog>,
}

impl Library {
    pub fn new(
        documents_dir: PathBuf,
        catalog: Catalog,
        engine: Arc<IndexEngine>,
    ) -> Self {
        Self {
            documents_dir,
            catalog,
            engine,
            audit: None,
        }
    }

    pub fn with_audit(mut self, audit: AuditLog) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn engine(&self) -> &Arc<IndexEngine> {
        &self.engine
    }

    pub fn list(&self) -> Result<Vec<DocumentRecord>> {
        self.catalog.list_documents()
    }

    /// Store a copy of `path`, index its pages and record it in the catalog.
    ///
    /// A document with the same filename is replaced. Index failures are
    /// returned as [`Error::Index`].
    pub fn add_file(&self, path: &Path, user: &str) -> Result<DocumentRecord> {
        let filename = upload_name(path)?;
        let added = self.store_and_index(path, &filename);

        if let Some(audit) = &self.audit {
            audit.record(match &added {
                Ok(record) => AuditRecord::UploadOk {
                    user: user.to_string(),
                    filename: filename.clone(),
                    bytes: record.bytes,
                    url: document_url(&filename),
                },
                Err(e) => AuditRecord::UploadError {
                    user: user.to_string(),
                    filename: filename.clone(),
                    error: e.to_string(),
                },
            });
        }

        if let Err(e) = &added {
            warn!(filename = %filename, "upload failed: {e}");
        }
        added
    }

    /// Stage the copy, index it, then publish the copy and the catalog
    /// record. A failure before indexing leaves the previous version
    /// untouched; a failure after it drops the document everywhere so the
    /// index never serves pages without a stored copy.
    fn store_and_index(&self, path: &Path, filename: &str) -> Result<DocumentRecord> {
        let extractor = extractor_for(path)?;
        let pages = extractor.extract(path)?;
        let doc = Document::new(filename, pages);
        let bytes = std::fs::metadata(path)?.len();

        let stored = self.documents_dir.join(filename);
        let staged = if same_file(path, &stored) {
            None
        } else {
            let staging = self.documents_dir.join(format!(".{filename}.partial"));
            std::fs::copy(path, &staging)?;
            Some(staging)
        };

        if let Err(e) = self.engine.index_document(&doc) {
            if let Some(staging) = &staged {
                discard(staging);
            }
            return Err(e.into());
        }

        if let Some(staging) = &staged {
            if let Err(e) = std::fs::rename(staging, &stored) {
                discard(staging);
                self.roll_back(filename);
                return Err(e.into());
            }
        }

        let record = DocumentRecord {
            filename: filename.to_string(),
            pages: doc.pages().len(),
            bytes,
            indexed_at: Local::now().to_rfc3339(),
        };
        if let Err(e) = self.catalog.put_document(&record) {
            self.roll_back(filename);
            return Err(e);
        }

        info!(filename, pages = record.pages, bytes, "document indexed");
        Ok(record)
    }

    /// Best-effort removal of a half-added document from every store.
    fn roll_back(&self, filename: &str) {
        if let Err(e) = self.engine.remove_document(filename) {
            warn!(filename, "rollback could not drop indexed pages: {e}");
        }
        discard(&self.documents_dir.join(filename));
        if let Err(e) = self.catalog.remove_document(filename) {
            warn!(filename, "rollback could not drop catalog entry: {e}");
        }
    }

    /// Drop a document from the index, the store and the catalog.
    pub fn remove(&self, filename: &str) -> Result<()> {
        if self.catalog.get_document(filename)?.is_none() {
            return Err(Error::NotFound {
                kind: "document",
                name: filename.to_string(),
            });
        }

        self.engine.remove_document(filename)?;
        match std::fs::remove_file(self.documents_dir.join(filename)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.catalog.remove_document(filename)?;

        info!(filename, "document removed");
        Ok(())
    }

    /// Wipe the index and re-index every stored document.
    ///
    /// Documents whose stored copy can no longer be extracted are skipped
    /// and stay out of the index. Returns how many documents were indexed.
    pub fn rebuild(&self) -> Result<usize> {
        let records = self.catalog.list_documents()?;
        self.engine.clear()?;

        // Extract in parallel, then index sequentially (one writer at a time).
        let extracted: Vec<_> = records
            .par_iter()
            .map(|record| {
                let path = self.documents_dir.join(&record.filename);
                let pages = extractor_for(&path).and_then(|x| x.extract(&path));
                (record, pages)
            })
            .collect();

        let mut indexed = 0;
        for (record, pages) in extracted {
            let pages = match pages {
                Ok(pages) => pages,
                Err(e) => {
                    warn!(filename = %record.filename, "skipping document: {e}");
                    continue;
                }
            };

            let doc = Document::new(record.filename.as_str(), pages);
            if let Err(e) = self.engine.index_document(&doc) {
                warn!(filename = %record.filename, "skipping document: {e}");
                continue;
            }

            self.catalog.put_document(&DocumentRecord {
                pages: doc.pages().len(),
                indexed_at: Local::now().to_rfc3339(),
                ..record.clone()
            })?;
            indexed += 1;
        }

        info!(documents = indexed, pages = self.engine.num_pages(), "rebuild complete");
        Ok(indexed)
    }
}

fn upload_name(path: &Path) -> Result<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty())
        .map(str::to_string)
        .ok_or_else(|| {
            Error::Config(format!("not a file name: {}", path.display()))
        })
}

fn discard(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), "could not remove file: {e}"),
    }
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::IndexError;

    struct Fixture {
        tmp: tempfile::TempDir,
        library: Library,
        audit: tokio::sync::mpsc::UnboundedReceiver<AuditRecord>,
    }

    fn fixture() -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let documents = tmp.path().join("documents");
        std::fs::create_dir_all(&documents).unwrap();
        let catalog = Catalog::open(&tmp.path().join("catalog.redb")).unwrap();
        let engine = Arc::new(IndexEngine::open_in_ram().unwrap());
        let (log, audit) = AuditLog::detached();
        let library = Library::new(documents, catalog, engine).with_audit(log);
        Fixture {
            tmp,
            library,
            audit,
        }
    }

    fn write(fx: &Fixture, name: &str, contents: &str) -> PathBuf {
        let dir = fx.tmp.path().join("uploads");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    fn candidates(library: &Library, query: &str) -> Vec<(String, u64)> {
        library
            .engine()
            .query(query)
            .unwrap()
            .map(|c| {
                let c = c.unwrap();
                (c.filename, c.page)
            })
            .collect()
    }

    #[test]
    fn add_file_stores_indexes_and_records() {
        let mut fx = fixture();
        let path = write(&fx, "Contract.txt", "Preamble\x0cClause A\n\nThe lot\x0c");

        let record = fx.library.add_file(&path, "ana").unwrap();
        assert_eq!(record.filename, "Contract.txt");
        assert_eq!(record.pages, 2);
        assert!(fx.tmp.path().join("documents/Contract.txt").exists());

        assert_eq!(candidates(&fx.library, "lot"), vec![("Contract.txt".into(), 2)]);
        assert_eq!(fx.library.list().unwrap(), vec![record]);

        match fx.audit.try_recv().unwrap() {
            AuditRecord::UploadOk { user, url, .. } => {
                assert_eq!(user, "ana");
                assert_eq!(url, "/pdf/Contract.txt");
            }
            other => panic!("expected UploadOk, got {other:?}"),
        }
    }

    #[test]
    fn unsupported_extension_is_rejected() {
        let mut fx = fixture();
        let path = write(&fx, "notes.docx", "lot");

        assert!(fx.library.add_file(&path, "ana").is_err());
        assert!(fx.library.list().unwrap().is_empty());
        assert!(matches!(
            fx.audit.try_recv().unwrap(),
            AuditRecord::UploadError { .. }
        ));
    }

    #[test]
    fn empty_document_surfaces_index_error() {
        let fx = fixture();
        let path = write(&fx, "empty.txt", "");

        let err = fx.library.add_file(&path, "ana").unwrap_err();
        assert!(matches!(
            err,
            Error::Index(IndexError::ExtractionFailure(ref name)) if name == "empty.txt"
        ));
        assert!(fx.library.catalog().get_document("empty.txt").unwrap().is_none());
        assert!(!fx.tmp.path().join("documents/empty.txt").exists());
        assert!(!fx.tmp.path().join("documents/.empty.txt.partial").exists());
    }

    #[test]
    fn failed_copy_leaves_nothing_indexed() {
        let tmp = tempfile::tempdir().unwrap();
        // A regular file where the documents directory should be makes
        // every copy fail, even for root.
        let documents = tmp.path().join("documents");
        std::fs::write(&documents, "").unwrap();
        let catalog = Catalog::open(&tmp.path().join("catalog.redb")).unwrap();
        let engine = Arc::new(IndexEngine::open_in_ram().unwrap());
        let library = Library::new(documents, catalog, engine);

        let source = tmp.path().join("a.txt");
        std::fs::write(&source, "the lot").unwrap();

        assert!(matches!(
            library.add_file(&source, "ana"),
            Err(Error::Io(_))
        ));
        assert!(candidates(&library, "lot").is_empty());
        assert_eq!(library.engine().num_pages(), 0);
        assert!(library.list().unwrap().is_empty());
    }

    #[test]
    fn failed_reupload_keeps_previous_version() {
        let fx = fixture();
        let path = write(&fx, "a.txt", "the lot");
        fx.library.add_file(&path, "ana").unwrap();

        std::fs::write(&path, "").unwrap();
        assert!(fx.library.add_file(&path, "ana").is_err());

        assert_eq!(candidates(&fx.library, "lot"), vec![("a.txt".into(), 1)]);
        assert_eq!(
            std::fs::read_to_string(fx.tmp.path().join("documents/a.txt")).unwrap(),
            "the lot"
        );
        assert_eq!(fx.library.list().unwrap().len(), 1);
        assert!(!fx.tmp.path().join("documents/.a.txt.partial").exists());
    }

    #[test]
    fn reupload_replaces_previous_version() {
        let fx = fixture();
        let path = write(&fx, "a.txt", "old lot\x0cmore lot");
        fx.library.add_file(&path, "ana").unwrap();

        std::fs::write(&path, "new lot").unwrap();
        let record = fx.library.add_file(&path, "ana").unwrap();

        assert_eq!(record.pages, 1);
        assert_eq!(candidates(&fx.library, "lot"), vec![("a.txt".into(), 1)]);
        assert_eq!(fx.library.list().unwrap().len(), 1);
    }

    #[test]
    fn remove_drops_everything() {
        let fx = fixture();
        let path = write(&fx, "a.txt", "lot");
        fx.library.add_file(&path, "ana").unwrap();

        fx.library.remove("a.txt").unwrap();
        assert!(candidates(&fx.library, "lot").is_empty());
        assert!(!fx.tmp.path().join("documents/a.txt").exists());
        assert!(fx.library.list().unwrap().is_empty());

        assert!(matches!(
            fx.library.remove("a.txt"),
            Err(Error::NotFound { kind: "document", .. })
        ));
    }

    #[test]
    fn rebuild_restores_index_from_store() {
        let fx = fixture();
        fx.library
            .add_file(&write(&fx, "a.txt", "lot one"), "ana")
            .unwrap();
        fx.library
            .add_file(&write(&fx, "b.txt", "lot two\x0clot three"), "ana")
            .unwrap();

        fx.library.engine().clear().unwrap();
        assert!(candidates(&fx.library, "lot").is_empty());

        assert_eq!(fx.library.rebuild().unwrap(), 2);
        assert_eq!(fx.library.engine().num_pages(), 3);
    }

    #[test]
    fn rebuild_skips_missing_copies() {
        let fx = fixture();
        fx.library
            .add_file(&write(&fx, "a.txt", "lot one"), "ana")
            .unwrap();
        fx.library
            .add_file(&write(&fx, "b.txt", "lot two"), "ana")
            .unwrap();
        std::fs::remove_file(fx.tmp.path().join("documents/a.txt")).unwrap();

        assert_eq!(fx.library.rebuild().unwrap(), 1);
        assert_eq!(candidates(&fx.library, "lot"), vec![("b.txt".into(), 1)]);
    }
}
