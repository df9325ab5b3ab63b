//! Per-session delivery of search events.
//!
//! A [`SessionChannel`] wraps whatever transport carries events to the
//! client ([`EventSink`]) and enforces the session protocol: any number of
//! results, then exactly one terminal event. Delivery never fails from the
//! orchestrator's point of view; once the transport is gone every push is a
//! no-op.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Instant,
};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::{document::page_url, localize::LineMatch};

/// One located occurrence of a query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResult {
    pub filename: String,
    pub page: u64,
    pub paragraph: usize,
    pub line: usize,
    pub line_content: String,
    pub url: String,
}

impl SearchResult {
    pub fn new(filename: &str, page: u64, found: LineMatch) -> Self {
        Self {
            filename: filename.to_string(),
            page,
            paragraph: found.paragraph,
            line: found.line,
            line_content: found.content,
            url: page_url(filename, page),
        }
    }
}

impl std::fmt::Display for SearchResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: page {} | paragraph {} | line {} -> {}",
            self.filename, self.page, self.paragraph, self.line, self.line_content
        )
    }
}

/// Wire message delivered to a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SearchEvent {
    Result(SearchResult),
    Completed,
    Error { message: String },
}

impl SearchEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SearchEvent::Result(_))
    }
}

/// Transport end of a session.
pub trait EventSink: Send {
    /// Hand an event to the transport. Returns `false` once the receiving
    /// side is gone.
    fn deliver(&mut self, event: SearchEvent) -> bool;

    fn is_closed(&self) -> bool;
}

/// Bounded channel sink. Applies backpressure by blocking the calling
/// thread, so it must only be driven from blocking tasks.
impl EventSink for mpsc::Sender<SearchEvent> {
    fn deliver(&mut self, event: SearchEvent) -> bool {
        self.blocking_send(event).is_ok()
    }

    fn is_closed(&self) -> bool {
        mpsc::Sender::is_closed(self)
    }
}

impl EventSink for mpsc::UnboundedSender<SearchEvent> {
    fn deliver(&mut self, event: SearchEvent) -> bool {
        self.send(event).is_ok()
    }

    fn is_closed(&self) -> bool {
        mpsc::UnboundedSender::is_closed(self)
    }
}

/// Collects events in memory.
impl EventSink for Vec<SearchEvent> {
    fn deliver(&mut self, event: SearchEvent) -> bool {
        self.push(event);
        true
    }

    fn is_closed(&self) -> bool {
        false
    }
}

/// Drops every event. Used for warmup queries.
#[derive(Debug, Default, Clone, Copy)]
pub struct Discard;

impl EventSink for Discard {
    fn deliver(&mut self, _event: SearchEvent) -> bool {
        true
    }

    fn is_closed(&self) -> bool {
        false
    }
}

/// Why a session should stop producing results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interruption {
    /// The transport is gone; nothing more can be delivered.
    Disconnected,
    Cancelled,
    TimedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Open,
    Disconnected,
    Terminated,
}

pub struct SessionChannel<S> {
    sink: S,
    state: State,
    delivered: usize,
    cancel: Option<Arc<AtomicBool>>,
    deadline: Option<Instant>,
}

impl<S: EventSink> SessionChannel<S> {
    pub fn new(sink: S) -> Self {
        Self {
            sink,
            state: State::Open,
            delivered: 0,
            cancel: None,
            deadline: None,
        }
    }

    /// Interrupt the session once `flag` is set.
    pub fn with_cancel(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn push(&mut self, result: SearchResult) {
        if self.send(SearchEvent::Result(result)) {
            self.delivered += 1;
        }
    }

    pub fn push_completion(&mut self) {
        self.terminate(SearchEvent::Completed);
    }

    pub fn push_error(&mut self, cause: impl Into<String>) {
        self.terminate(SearchEvent::Error {
            message: cause.into(),
        });
    }

    /// Whether the session should stop, checked between pushes.
    pub fn interruption(&self) -> Option<Interruption> {
        if self.state == State::Disconnected || self.sink.is_closed() {
            return Some(Interruption::Disconnected);
        }
        if self
            .cancel
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Acquire))
        {
            return Some(Interruption::Cancelled);
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Some(Interruption::TimedOut);
        }
        None
    }

    pub fn is_terminated(&self) -> bool {
        self.state == State::Terminated
    }

    /// Results actually handed to the transport.
    pub fn delivered(&self) -> usize {
        self.delivered
    }

    pub fn into_sink(self) -> S {
        self.sink
    }

    fn terminate(&mut self, event: SearchEvent) {
        if self.state == State::Terminated {
            warn!(?event, "dropping second terminal event");
            return;
        }
        self.send(event);
        self.state = State::Terminated;
    }

    fn send(&mut self, event: SearchEvent) -> bool {
        match self.state {
            State::Open => {
                if self.sink.deliver(event) {
                    true
                } else {
                    debug!("transport closed, dropping further events");
                    self.state = State::Disconnected;
                    false
                }
            }
            State::Disconnected => false,
            State::Terminated => {
                warn!(?event, "event after terminal event dropped");
                false
            }
        }
    }
}
