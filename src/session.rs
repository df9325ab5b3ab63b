//! Registry of concurrently running search sessions.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        Mutex,
        MutexGuard,
        PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use serde::Deserialize;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info_span};

use crate::{
    audit::DEFAULT_USER,
    channel::{SearchEvent, SessionChannel},
    config::{DEFAULT_CHANNEL_CAPACITY, DEFAULT_SESSION_TIMEOUT},
    error::{Error, Result},
    search::{Orchestrator, SearchOutcome},
};

/// A client's request to start a search.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchRequest {
    pub query: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
}

impl SearchRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Self::default()
        }
    }
}

/// A started session: its id, the event stream, and the task driving it.
pub struct SearchSession {
    pub id: String,
    pub events: mpsc::Receiver<SearchEvent>,
    pub handle: JoinHandle<SearchOutcome>,
}

/// Maps session ids to their cancellation flags.
///
/// Every session runs on its own blocking task and deregisters itself when
/// that task ends, whichever way it ends.
pub struct SessionRegistry {
    orchestrator: Orchestrator,
    timeout: Duration,
    capacity: usize,
    sessions: Mutex<HashMap<String, Arc<AtomicBool>>>,
}

impl SessionRegistry {
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self {
            orchestrator,
            timeout: DEFAULT_SESSION_TIMEOUT,
            capacity: DEFAULT_CHANNEL_CAPACITY,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    /// Start a session for `request`. Must be called from within a tokio
    /// runtime.
    pub fn start(self: &Arc<Self>, request: SearchRequest) -> Result<SearchSession> {
        let id = request
            .session_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let cancel = Arc::new(AtomicBool::new(false));

        {
            let mut sessions = self.lock();
            if sessions.contains_key(&id) {
                return Err(Error::Search(format!("session {id} is already active")));
            }
            sessions.insert(id.clone(), Arc::clone(&cancel));
        }

        let (tx, rx) = mpsc::channel(self.capacity);
        let user = request.user.unwrap_or_else(|| DEFAULT_USER.to_string());
        let query = request.query;
        // Timeouts too large to represent leave the session without a deadline.
        let deadline = Instant::now().checked_add(self.timeout);
        let registration = Registration {
            registry: Arc::clone(self),
            id: id.clone(),
        };

        let handle = tokio::task::spawn_blocking(move || {
            let registration = registration;
            let span = info_span!("session", session = %registration.id, user = %user);
            let _entered = span.enter();

            let mut channel = SessionChannel::new(tx).with_cancel(cancel);
            if let Some(deadline) = deadline {
                channel = channel.with_deadline(deadline);
            }
            registration
                .registry
                .orchestrator
                .run(&query, &user, &mut channel)
        });

        debug!(session = %id, "session started");
        Ok(SearchSession {
            id,
            events: rx,
            handle,
        })
    }

    /// Ask a running session to stop. Returns `false` if no such session is
    /// active.
    pub fn cancel(&self, id: &str) -> bool {
        match self.lock().get(id) {
            Some(flag) => {
                flag.store(true, Ordering::Release);
                debug!(session = id, "cancellation requested");
                true
            }
            None => false,
        }
    }

    /// Ids of the sessions currently running, sorted.
    pub fn active(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<AtomicBool>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct Registration {
    registry: Arc<SessionRegistry>,
    id: String,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.lock().remove(&self.id);
        debug!(session = %self.id, "session ended");
    }
}
