//! folioscan - full-text search over uploaded documents, located down to the
//! paragraph and line.
//!
//! Search runs in two stages. The [`IndexEngine`] resolves a query into
//! candidate pages through a stemmed [Tantivy](https://github.com/quickwit-oss/tantivy)
//! index; [`localize::find`] then scans each candidate page for the literal
//! query text. Every match is pushed to the client's [`SessionChannel`] as
//! soon as it is found, and each session ends with exactly one terminal event.
//!
//! # Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use folioscan::{IndexEngine, Orchestrator, SessionChannel, document::Document};
//!
//! let engine = Arc::new(IndexEngine::open_in_ram().unwrap());
//! engine
//!     .index_document(&Document::new(
//!         "Contract.pdf",
//!         vec!["Preamble\n\nClause A\nThe lot is defined in Annex B\nEnd".into()],
//!     ))
//!     .unwrap();
//!
//! let orchestrator = Orchestrator::new(engine);
//! let mut channel = SessionChannel::new(Vec::new());
//! orchestrator.run("lot", "anonymous", &mut channel);
//! for event in channel.into_sink() {
//!     println!("{}", serde_json::to_string(&event).unwrap());
//! }
//! ```

pub mod audit;
pub mod catalog;
pub mod channel;
pub mod config;
pub mod data_dir;
pub mod document;
pub mod error;
pub mod extract;
pub mod index_engine;
pub mod library;
pub mod localize;
pub mod search;
pub mod session;

pub use audit::AuditLog;
pub use catalog::{Catalog, DocumentRecord};
pub use channel::{SearchEvent, SearchResult, SessionChannel};
pub use config::Settings;
pub use data_dir::DataDir;
pub use error::{Error, Result};
pub use index_engine::IndexEngine;
pub use library::Library;
pub use search::{Orchestrator, SearchOutcome, SearchState};
pub use session::{SearchRequest, SearchSession, SessionRegistry};
