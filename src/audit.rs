//! Out-of-band audit trail of searches and uploads.
//!
//! Records are queued on an unbounded channel and appended to the audit file
//! by a background task, so recording never blocks or fails the caller.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use tokio::{
    fs::OpenOptions,
    io::AsyncWriteExt,
    sync::mpsc,
    task::JoinHandle,
};
use tracing::{info, warn};

use crate::channel::SearchResult;

/// User label recorded when the client does not supply one.
pub const DEFAULT_USER: &str = "anonymous";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuditRecord {
    SearchOk {
        user: String,
        query: String,
        results: Vec<SearchResult>,
    },
    SearchError {
        user: String,
        query: String,
        error: String,
    },
    UploadOk {
        user: String,
        filename: String,
        bytes: u64,
        url: String,
    },
    UploadError {
        user: String,
        filename: String,
        error: String,
    },
}

impl AuditRecord {
    /// Render the record as one audit line.
    pub fn format_line(&self, at: DateTime<Local>) -> String {
        let ts = at.format("%Y-%m-%d %H:%M:%S%:z");
        match self {
            AuditRecord::SearchOk {
                user,
                query,
                results,
            } => {
                let locations = results
                    .iter()
                    .map(|r| format!("{}#page={}:{}:{}", r.filename, r.page, r.paragraph, r.line))
                    .collect::<Vec<_>>()
                    .join(",");
                format!(
                    "{ts} | user={} | action=SEARCH | status=OK | query=\"{}\" | occurrences={} | at=[{}]",
                    safe(user),
                    safe(query),
                    results.len(),
                    safe(&locations)
                )
            }
            AuditRecord::SearchError { user, query, error } => format!(
                "{ts} | user={} | action=SEARCH | status=ERROR | query=\"{}\" | error={}",
                safe(user),
                safe(query),
                safe(error)
            ),
            AuditRecord::UploadOk {
                user,
                filename,
                bytes,
                url,
            } => format!(
                "{ts} | user={} | action=UPLOAD | status=OK | file={} | size={bytes} bytes | url={}",
                safe(user),
                safe(filename),
                safe(url)
            ),
            AuditRecord::UploadError {
                user,
                filename,
                error,
            } => format!(
                "{ts} | user={} | action=UPLOAD | status=ERROR | file={} | error={}",
                safe(user),
                safe(filename),
                safe(error)
            ),
        }
    }
}

/// Flatten line breaks so one record stays on one line.
fn safe(s: &str) -> String {
    s.replace(['\n', '\r'], " ")
}

/// Handle used to queue audit records. Cheap to clone.
#[derive(Debug, Clone)]
pub struct AuditLog {
    tx: mpsc::UnboundedSender<AuditRecord>,
}

impl AuditLog {
    /// Start the background writer appending to `path`.
    ///
    /// Must be called from within a tokio runtime. The returned handle
    /// finishes once every `AuditLog` clone has been dropped and the queue
    /// is drained.
    pub fn spawn(path: &Path) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(write_records(path.to_path_buf(), rx));
        (Self { tx }, handle)
    }

    /// A log whose records go nowhere but the returned receiver.
    pub fn detached() -> (Self, mpsc::UnboundedReceiver<AuditRecord>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn record(&self, record: AuditRecord) {
        if self.tx.send(record).is_err() {
            warn!("audit writer stopped, record dropped");
        }
    }
}

async fn write_records(
    path: PathBuf,
    mut rx: mpsc::UnboundedReceiver<AuditRecord>,
) {
    let mut file = match OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await
    {
        Ok(f) => Some(f),
        Err(e) => {
            warn!(path = %path.display(), "cannot open audit log: {e}");
            None
        }
    };

    while let Some(record) = rx.recv().await {
        let line = record.format_line(Local::now());
        info!(target: "folioscan::audit", "{line}");

        if let Some(f) = file.as_mut() {
            let written = async {
                f.write_all(line.as_bytes()).await?;
                f.write_all(b"\n").await?;
                f.flush().await
            }
            .await;
            if let Err(e) = written {
                warn!(path = %path.display(), "audit write failed: {e}");
            }
        }
    }
}
