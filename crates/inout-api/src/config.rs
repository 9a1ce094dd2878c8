use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub const DB_PATH_ENV: &str = "INOUT_DB_PATH";
pub const LOG_FILTER_ENV: &str = "INOUT_LOG";
pub const RECENT_LIMIT_ENV: &str = "INOUT_RECENT_LIMIT";

const DEFAULT_DB_PATH: &str = "./inout.sqlite3";
const DEFAULT_LOG_FILTER: &str = "info";
const DEFAULT_RECENT_LIMIT: usize = 10;
const RECENT_LIMIT_RANGE: (usize, usize) = (1, 500);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct InOutConfig {
    pub db_path: PathBuf,
    /// `tracing_subscriber::EnvFilter` directive string.
    pub log_filter: String,
    /// How many recently completed items the `recent` views return.
    pub recent_limit: usize,
}

impl Default for InOutConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(DEFAULT_DB_PATH),
            log_filter: DEFAULT_LOG_FILTER.to_string(),
            recent_limit: DEFAULT_RECENT_LIMIT,
        }
    }
}

impl InOutConfig {
    /// Defaults overlaid with `INOUT_DB_PATH`, `INOUT_LOG` and `INOUT_RECENT_LIMIT`.
    #[must_use]
    pub fn from_env() -> Self {
        Self::default().overlay(|name| std::env::var(name).ok())
    }

    /// Overlay values found through `lookup`. Blank or unparsable values keep
    /// the current setting.
    #[must_use]
    pub fn overlay(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(path) = non_blank(lookup(DB_PATH_ENV)) {
            self.db_path = PathBuf::from(path);
        }
        if let Some(filter) = non_blank(lookup(LOG_FILTER_ENV)) {
            self.log_filter = filter;
        }
        if let Some(limit) = lookup(RECENT_LIMIT_ENV).and_then(|raw| parse_limit(&raw)) {
            self.recent_limit = limit;
        }
        self
    }

    /// `recent_limit` clamped to the supported range.
    #[must_use]
    pub fn effective_recent_limit(&self) -> usize {
        self.recent_limit.clamp(RECENT_LIMIT_RANGE.0, RECENT_LIMIT_RANGE.1)
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn parse_limit(raw: &str) -> Option<usize> {
    raw.trim()
        .parse::<usize>()
        .ok()
        .map(|v| v.clamp(RECENT_LIMIT_RANGE.0, RECENT_LIMIT_RANGE.1))
}
