use std::time::Duration;

use crate::{
    catalog::Catalog,
    error::{Error, Result},
};

/// Maximum number of candidate pages a single query may return.
pub const DEFAULT_CANDIDATE_LIMIT: usize = 100;

/// Upper bound accepted for `candidate_limit`.
pub const MAX_CANDIDATE_LIMIT: usize = 100;

/// Memory budget handed to the tantivy writer, in bytes.
pub const DEFAULT_WRITER_MEMORY: usize = 50_000_000;

pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(300);

/// Bound on events buffered between a session and its transport.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// Setting keys understood by [`Settings::load`].
pub mod keys {
    pub const CANDIDATE_LIMIT: &str = "candidate_limit";
    pub const WRITER_MEMORY: &str = "writer_memory_bytes";
    pub const SESSION_TIMEOUT: &str = "session_timeout_secs";
    pub const CHANNEL_CAPACITY: &str = "channel_capacity";
    pub const WARMUP_QUERIES: &str = "warmup_queries";

    pub const ALL: &[&str] = &[
        CANDIDATE_LIMIT,
        WRITER_MEMORY,
        SESSION_TIMEOUT,
        CHANNEL_CAPACITY,
        WARMUP_QUERIES,
    ];
}

/// Runtime tunables, stored as strings in the catalog's settings table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub candidate_limit: usize,
    pub writer_memory: usize,
    pub session_timeout: Duration,
    pub channel_capacity: usize,
    pub warmup_queries: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            candidate_limit: DEFAULT_CANDIDATE_LIMIT,
            writer_memory: DEFAULT_WRITER_MEMORY,
            session_timeout: DEFAULT_SESSION_TIMEOUT,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            warmup_queries: Vec::new(),
        }
    }
}

impl Settings {
    /// Load settings from the catalog, falling back to defaults for
    /// anything unset.
    pub fn load(catalog: &Catalog) -> Result<Self> {
        let mut settings = Self::default();
        for key in keys::ALL {
            if let Some(value) = catalog.get_setting(key)? {
                settings.apply(key, &value)?;
            }
        }
        Ok(settings)
    }

    /// Validate and apply a single `key = value` pair.
    pub fn apply(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            keys::CANDIDATE_LIMIT => {
                let limit = parse_positive(key, value)?;
                if limit > MAX_CANDIDATE_LIMIT {
                    return Err(Error::Config(format!(
                        "setting '{key}' must be at most {MAX_CANDIDATE_LIMIT}, got '{value}'"
                    )));
                }
                self.candidate_limit = limit;
            }
            keys::WRITER_MEMORY => {
                self.writer_memory = parse_positive(key, value)?;
            }
            keys::SESSION_TIMEOUT => {
                self.session_timeout =
                    Duration::from_secs(parse_positive(key, value)? as u64);
            }
            keys::CHANNEL_CAPACITY => {
                self.channel_capacity = parse_positive(key, value)?;
            }
            keys::WARMUP_QUERIES => {
                self.warmup_queries = value
                    .split(',')
                    .map(str::trim)
                    .filter(|q| !q.is_empty())
                    .map(str::to_string)
                    .collect();
            }
            other => {
                return Err(Error::Config(format!(
                    "unknown setting '{other}' (expected one of: {})",
                    keys::ALL.join(", ")
                )));
            }
        }
        Ok(())
    }

    /// Render every setting as `(key, value)` pairs for display.
    pub fn entries(&self) -> Vec<(&'static str, String)> {
        vec![
            (keys::CANDIDATE_LIMIT, self.candidate_limit.to_string()),
            (keys::WRITER_MEMORY, self.writer_memory.to_string()),
            (
                keys::SESSION_TIMEOUT,
                self.session_timeout.as_secs().to_string(),
            ),
            (keys::CHANNEL_CAPACITY, self.channel_capacity.to_string()),
            (keys::WARMUP_QUERIES, self.warmup_queries.join(",")),
        ]
    }
}

fn parse_positive(key: &str, value: &str) -> Result<usize> {
    match value.trim().parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(Error::Config(format!(
            "setting '{key}' must be a positive integer, got '{value}'"
        ))),
    }
}
