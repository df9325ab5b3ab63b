use std::{
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    time::Instant,
};

use tracing::{debug, error, info, warn};

use crate::{
    audit::{AuditLog, AuditRecord},
    channel::{Discard, EventSink, Interruption, SearchResult, SessionChannel},
    error::{IndexError, LocalizationFault, QueryError},
    index_engine::{CandidatePage, IndexEngine},
    localize,
};

/// Lifecycle of one search run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchState {
    Pending,
    /// At least one candidate page has been read.
    Streaming,
    Completed,
    Errored,
    /// The transport went away before a terminal event could be sent.
    Abandoned,
}

/// Summary of a finished run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchOutcome {
    pub state: SearchState,
    /// Results pushed to the channel.
    pub results: usize,
    pub error: Option<String>,
}

#[derive(Debug, thiserror::Error)]
enum SearchFault {
    #[error(transparent)]
    Query(#[from] QueryError),
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error(transparent)]
    Localization(#[from] LocalizationFault),
}

enum Flow {
    Exhausted,
    Interrupted(Interruption),
}

struct Run {
    state: SearchState,
    realized: Option<Vec<SearchResult>>,
}

/// Drives the two-stage search: candidate pages from the index, then
/// line localization on each page, pushing every match as soon as it is
/// found.
#[derive(Debug, Clone)]
pub struct Orchestrator {
    engine: Arc<IndexEngine>,
    audit: Option<AuditLog>,
}

impl Orchestrator {
    pub fn new(engine: Arc<IndexEngine>) -> Self {
        Self {
            engine,
            audit: None,
        }
    }

    pub fn with_audit(mut self, audit: AuditLog) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn engine(&self) -> &Arc<IndexEngine> {
        &self.engine
    }

    /// Run `query` to completion, delivering events on `channel`.
    ///
    /// Always ends the channel with exactly one terminal event unless the
    /// transport disconnected first. Faults from the index or the localizer,
    /// including panics, become an error event and never escape.
    pub fn run<S: EventSink>(
        &self,
        query: &str,
        user: &str,
        channel: &mut SessionChannel<S>,
    ) -> SearchOutcome {
        let (outcome, realized) = self.execute(query, channel, self.audit.is_some());

        if let (Some(audit), Some(realized)) = (&self.audit, realized) {
            let record = match &outcome.error {
                None => AuditRecord::SearchOk {
                    user: user.to_string(),
                    query: query.to_string(),
                    results: realized,
                },
                Some(error) => AuditRecord::SearchError {
                    user: user.to_string(),
                    query: query.to_string(),
                    error: error.clone(),
                },
            };
            audit.record(record);
        }

        outcome
    }

    /// Run each query once and discard the results, to page in the index
    /// before the first client arrives.
    pub fn warmup(&self, queries: &[String]) {
        for query in queries {
            let started = Instant::now();
            let mut channel = SessionChannel::new(Discard);
            let (outcome, _) = self.execute(query, &mut channel, false);
            debug!(
                query = query.as_str(),
                results = outcome.results,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "warmup query done"
            );
        }
        info!(queries = queries.len(), "warmup finished");
    }

    fn execute<S: EventSink>(
        &self,
        query: &str,
        channel: &mut SessionChannel<S>,
        keep_results: bool,
    ) -> (SearchOutcome, Option<Vec<SearchResult>>) {
        let mut run = Run {
            state: SearchState::Pending,
            realized: keep_results.then(Vec::new),
        };

        let driven = panic::catch_unwind(AssertUnwindSafe(|| {
            self.drive(query, channel, &mut run)
        }));

        let error = match driven {
            Ok(Ok(Flow::Exhausted)) => None,
            Ok(Ok(Flow::Interrupted(Interruption::Disconnected))) => {
                Some("client disconnected".to_string())
            }
            Ok(Ok(Flow::Interrupted(Interruption::Cancelled))) => {
                Some("search cancelled".to_string())
            }
            Ok(Ok(Flow::Interrupted(Interruption::TimedOut))) => {
                Some("search timed out".to_string())
            }
            Ok(Err(SearchFault::Localization(fault))) => {
                error!(query, "{fault}");
                Some(fault.to_string())
            }
            Ok(Err(fault)) => {
                warn!(query, "search failed: {fault}");
                Some(fault.to_string())
            }
            Err(payload) => {
                let detail = panic_message(payload.as_ref());
                error!(query, "search panicked: {detail}");
                Some(format!("internal search fault: {detail}"))
            }
        };

        let disconnected = channel.interruption() == Some(Interruption::Disconnected)
            && !channel.is_terminated();
        run.state = match &error {
            None => {
                channel.push_completion();
                SearchState::Completed
            }
            Some(_) if disconnected => SearchState::Abandoned,
            Some(message) => {
                channel.push_error(message.clone());
                SearchState::Errored
            }
        };

        info!(
            query,
            state = ?run.state,
            results = channel.delivered(),
            "search finished"
        );

        let outcome = SearchOutcome {
            state: run.state,
            results: channel.delivered(),
            error,
        };
        (outcome, run.realized)
    }

    fn drive<S: EventSink>(
        &self,
        query: &str,
        channel: &mut SessionChannel<S>,
        run: &mut Run,
    ) -> Result<Flow, SearchFault> {
        let candidates = self.engine.query(query)?;

        for candidate in candidates {
            if let Some(interruption) = channel.interruption() {
                return Ok(Flow::Interrupted(interruption));
            }

            let candidate = candidate?;
            if run.state == SearchState::Pending {
                run.state = SearchState::Streaming;
                debug!(query, "streaming");
            }

            let text = page_text(&candidate)?;
            for found in localize::find(text, query) {
                if let Some(interruption) = channel.interruption() {
                    return Ok(Flow::Interrupted(interruption));
                }
                let result =
                    SearchResult::new(&candidate.filename, candidate.page, found);
                if let Some(realized) = run.realized.as_mut() {
                    realized.push(result.clone());
                }
                channel.push(result);
            }
        }

        Ok(Flow::Exhausted)
    }
}

fn page_text(candidate: &CandidatePage) -> Result<&str, LocalizationFault> {
    let fault = |detail: &str| LocalizationFault {
        filename: candidate.filename.clone(),
        page: candidate.page,
        detail: detail.to_string(),
    };

    if candidate.filename.is_empty() {
        return Err(fault("stored filename missing"));
    }
    if candidate.page == 0 {
        return Err(fault("stored page number missing"));
    }
    candidate
        .text
        .as_deref()
        .ok_or_else(|| fault("stored page text missing"))
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::atomic::AtomicBool, time::Duration};

    use super::*;
    use crate::{channel::SearchEvent, document::Document};

    fn engine_with(docs: &[(&str, &[&str])]) -> Arc<IndexEngine> {
        let engine = IndexEngine::open_in_ram().unwrap();
        for (filename, pages) in docs {
            engine
                .index_document(&Document::new(
                    *filename,
                    pages.iter().map(|p| p.to_string()).collect(),
                ))
                .unwrap();
        }
        Arc::new(engine)
    }

    fn run(engine: Arc<IndexEngine>, query: &str) -> (SearchOutcome, Vec<SearchEvent>) {
        let orchestrator = Orchestrator::new(engine);
        let mut channel = SessionChannel::new(Vec::new());
        let outcome = orchestrator.run(query, "tester", &mut channel);
        (outcome, channel.into_sink())
    }

    fn results(events: &[SearchEvent]) -> Vec<&SearchResult> {
        events
            .iter()
            .filter_map(|e| match e {
                SearchEvent::Result(r) => Some(r),
                _ => None,
            })
            .collect()
    }

    const CONTRACT: &str =
        "Preamble\n\nClause A\nThe lot is defined in Annex B\nEnd";

    /// Pushes results into a shared vector and closes after `limit` events.
    struct ClosingSink {
        events: Vec<SearchEvent>,
        limit: usize,
    }

    impl EventSink for ClosingSink {
        fn deliver(&mut self, event: SearchEvent) -> bool {
            if self.events.len() >= self.limit {
                return false;
            }
            self.events.push(event);
            true
        }

        fn is_closed(&self) -> bool {
            self.events.len() >= self.limit
        }
    }

    #[test]
    fn contract_example() {
        let engine = engine_with(&[("Contract.pdf", &[CONTRACT])]);
        let (outcome, events) = run(engine, "lot");

        assert_eq!(outcome.state, SearchState::Completed);
        assert_eq!(outcome.results, 1);
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[0],
            SearchEvent::Result(SearchResult {
                filename: "Contract.pdf".into(),
                page: 1,
                paragraph: 2,
                line: 2,
                line_content: "The lot is defined in Annex B".into(),
                url: "/pdf/Contract.pdf#page=1".into(),
            })
        );
        assert_eq!(events[1], SearchEvent::Completed);
    }

    #[test]
    fn malformed_query_ends_in_error() {
        let engine = engine_with(&[("Contract.pdf", &[CONTRACT])]);
        let (outcome, events) = run(engine, "lot AND(");

        assert_eq!(outcome.state, SearchState::Errored);
        assert_eq!(events.len(), 1);
        match &events[0] {
            SearchEvent::Error { message } => {
                assert!(message.contains("malformed query"), "{message}");
            }
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[test]
    fn zero_matches_still_complete() {
        let engine = engine_with(&[("Contract.pdf", &[CONTRACT])]);
        let (outcome, events) = run(engine, "zebra");

        assert_eq!(outcome.state, SearchState::Completed);
        assert_eq!(events, vec![SearchEvent::Completed]);
    }

    #[test]
    fn empty_query_completes_without_results() {
        let engine = engine_with(&[("Contract.pdf", &[CONTRACT])]);
        let (outcome, events) = run(engine, "");

        assert_eq!(outcome.state, SearchState::Completed);
        assert_eq!(events, vec![SearchEvent::Completed]);
    }

    #[test]
    fn oversized_candidate_limit_completes() {
        let engine = IndexEngine::open_in_ram()
            .unwrap()
            .with_candidate_limit(1 << 62);
        engine
            .index_document(&Document::new("Contract.pdf", vec![CONTRACT.into()]))
            .unwrap();
        let (outcome, events) = run(Arc::new(engine), "lot");

        assert_eq!(outcome.state, SearchState::Completed);
        assert_eq!(results(&events).len(), 1);
        assert_eq!(events.last(), Some(&SearchEvent::Completed));
    }

    #[test]
    fn candidate_without_literal_match_yields_nothing() {
        // "running" is a stemmed candidate for "run", but the literal text
        // "runs" does not appear.
        let engine = engine_with(&[("a.pdf", &["we were running"])]);
        let (outcome, events) = run(engine, "runs");

        assert_eq!(outcome.state, SearchState::Completed);
        assert!(results(&events).is_empty());
    }

    #[test]
    fn results_follow_candidate_then_document_order() {
        let engine = engine_with(&[
            ("a.pdf", &["annex one\n\nannex two", "annex three"]),
            ("b.pdf", &["annex four"]),
        ]);
        let (_, events) = run(engine.clone(), "annex");

        let got: Vec<_> = results(&events)
            .into_iter()
            .map(|r| (r.filename.clone(), r.page, r.paragraph, r.line))
            .collect();

        // Candidate order comes from the index; within each page results
        // are in paragraph/line order.
        let pages: Vec<_> = engine
            .query("annex")
            .unwrap()
            .map(|c| {
                let c = c.unwrap();
                (c.filename, c.page)
            })
            .collect();
        let mut expected = Vec::new();
        for (filename, page) in pages {
            let mut local: Vec<_> = got
                .iter()
                .filter(|r| r.0 == filename && r.1 == page)
                .cloned()
                .collect();
            let sorted = {
                let mut s = local.clone();
                s.sort_by_key(|r| (r.2, r.3));
                s
            };
            assert_eq!(local, sorted);
            expected.append(&mut local);
        }
        assert_eq!(got, expected);
        assert_eq!(got.len(), 4);
    }

    #[test]
    fn every_result_is_reproducible_from_the_page() {
        let page = "Alpha lot\nBeta\n\nGamma\nLOT delta\n\nno";
        let engine = engine_with(&[("x.pdf", &["intro", page])]);
        let (_, events) = run(engine, "lot");

        let found = results(&events);
        assert_eq!(found.len(), 2);
        for r in found {
            assert_eq!(r.page, 2);
            let paragraph = page.split("\n\n").nth(r.paragraph - 1).unwrap();
            let line = paragraph.split('\n').nth(r.line - 1).unwrap();
            assert_eq!(line, r.line_content);
            assert!(line.to_lowercase().contains("lot"));
        }
    }

    #[test]
    fn disconnect_mid_stream_stops_pushing() {
        let engine = engine_with(&[("a.pdf", &["lot\nlot\nlot\nlot\nlot"])]);
        let orchestrator = Orchestrator::new(engine);
        let mut channel = SessionChannel::new(ClosingSink {
            events: Vec::new(),
            limit: 2,
        });

        let outcome = orchestrator.run("lot", "tester", &mut channel);
        assert_eq!(outcome.state, SearchState::Abandoned);

        let sink = channel.into_sink();
        assert_eq!(sink.events.len(), 2);
        assert!(sink.events.iter().all(|e| !e.is_terminal()));
    }

    #[test]
    fn cancelled_session_reports_error() {
        let engine = engine_with(&[("a.pdf", &["lot"])]);
        let orchestrator = Orchestrator::new(engine);
        let flag = Arc::new(AtomicBool::new(true));
        let mut channel = SessionChannel::new(Vec::new()).with_cancel(flag);

        let outcome = orchestrator.run("lot", "tester", &mut channel);
        assert_eq!(outcome.state, SearchState::Errored);
        assert_eq!(
            channel.into_sink(),
            vec![SearchEvent::Error {
                message: "search cancelled".into()
            }]
        );
    }

    #[test]
    fn timed_out_session_reports_error() {
        let engine = engine_with(&[("a.pdf", &["lot"])]);
        let orchestrator = Orchestrator::new(engine);
        let mut channel = SessionChannel::new(Vec::new())
            .with_deadline(Instant::now() - Duration::from_millis(1));

        let outcome = orchestrator.run("lot", "tester", &mut channel);
        assert_eq!(outcome.state, SearchState::Errored);
        assert_eq!(outcome.error.as_deref(), Some("search timed out"));
    }

    #[test]
    fn audit_receives_realized_results() {
        let engine = engine_with(&[("Contract.pdf", &[CONTRACT])]);
        let (audit, mut rx) = AuditLog::detached();
        let orchestrator = Orchestrator::new(engine).with_audit(audit);

        let mut channel = SessionChannel::new(Vec::new());
        orchestrator.run("lot", "ana", &mut channel);
        let mut channel = SessionChannel::new(Vec::new());
        orchestrator.run("lot AND(", "ana", &mut channel);

        match rx.try_recv().unwrap() {
            AuditRecord::SearchOk { user, results, .. } => {
                assert_eq!(user, "ana");
                assert_eq!(results.len(), 1);
                assert_eq!(results[0].line, 2);
            }
            other => panic!("expected SearchOk, got {other:?}"),
        }
        assert!(matches!(
            rx.try_recv().unwrap(),
            AuditRecord::SearchError { .. }
        ));
    }

    #[test]
    fn missing_page_text_is_a_localization_fault() {
        let candidate = CandidatePage {
            filename: "a.pdf".into(),
            page: 3,
            text: None,
        };
        let fault = page_text(&candidate).unwrap_err();
        assert_eq!(fault.page, 3);
        assert!(fault.to_string().contains("a.pdf page 3"));
    }

    #[test]
    fn warmup_does_not_audit() {
        let engine = engine_with(&[("a.pdf", &["lot"])]);
        let (audit, mut rx) = AuditLog::detached();
        let orchestrator = Orchestrator::new(engine).with_audit(audit);

        orchestrator.warmup(&["lot".to_string(), "lot AND(".to_string()]);
        assert!(rx.try_recv().is_err());
    }
}
