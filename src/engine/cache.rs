//! Query-result cache with freshness tracking and advisory refresh locks.
//!
//! Results are cached centrally per (session, server, query) so bot
//! groups sharing a query share the result. The refresh-lock map prevents
//! two concurrent refreshes of the same entry; it is advisory, not
//! blocking — a caller that cannot take the lock skips the refresh for
//! this tick and retries next cycle.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::source::QueryResult;
use crate::types::{GroupQuery, QueryWindow, SessionId};

#[derive(Debug, Clone, Error)]
pub enum CacheError {
    #[error("no cached result: server: {server}  query: {query}")]
    Missing { server: String, query: String },
    #[error("cached result is over its {interval_secs}s interval: server: {server}  query: {query}")]
    Stale {
        server: String,
        query: String,
        interval_secs: u64,
    },
    #[error("cached result does not match requested window: server: {server}  query: {query}")]
    WindowMismatch { server: String, query: String },
}

/// One cached result and the bookkeeping around it.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub server: String,
    pub query: String,
    pub session: SessionId,
    pub time_requested: DateTime<Utc>,
    pub time_received: DateTime<Utc>,
    pub window: QueryWindow,
    pub result: QueryResult,
    pub is_valid: bool,
}

/// A fetched result. `expired` is set when the entry is older than the
/// query's refresh interval and the caller asked for the value anyway;
/// downstream consumers treat it as a staleness signal on the dependent
/// bots rather than a hard failure.
#[derive(Debug, Clone)]
pub struct FetchedResult {
    pub result: QueryResult,
    pub expired: bool,
    pub time_received: DateTime<Utc>,
}

/// Concurrency-safe store of the latest result per (session, server,
/// query). The entry map and the refresh-lock map are guarded separately
/// so a long scoring pass never holds either beyond a single call.
pub struct QueryCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    refresh_locks: Mutex<HashMap<String, DateTime<Utc>>>,
    lock_timeout_secs: u64,
}

impl QueryCache {
    pub fn new(lock_timeout_secs: u64) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            refresh_locks: Mutex::new(HashMap::new()),
            lock_timeout_secs,
        }
    }

    /// Cache key: session, server and the query text itself, so bot
    /// groups sharing a query from the same server share the entry.
    pub fn key(session: SessionId, query: &GroupQuery) -> String {
        format!("{}.{}.{}", session, query.query_server, query.query)
    }

    /// Store a result, replacing any entry for the same key.
    pub fn store(
        &self,
        session: SessionId,
        query: &GroupQuery,
        window: QueryWindow,
        time_requested: DateTime<Utc>,
        now: DateTime<Utc>,
        result: QueryResult,
    ) {
        let entry = CacheEntry {
            server: query.query_server.clone(),
            query: query.query.clone(),
            session,
            time_requested,
            time_received: now,
            window,
            result,
            is_valid: true,
        };

        let mut entries = self.entries.lock().expect("query cache poisoned");
        entries.insert(Self::key(session, query), entry);
    }

    /// Fetch the cached entry for a query.
    ///
    /// When the entry is older than the query's refresh interval:
    /// `error_if_stale = true` fails with [`CacheError::Stale`] (what-if
    /// callers must never silently use old data), `false` returns the
    /// value marked expired (the production loop's staleness signal).
    ///
    /// `require_window` additionally rejects an entry whose window does
    /// not match; what-if sessions pass their window so historical data is
    /// never confused with a fresher result for the same query.
    pub fn fetch(
        &self,
        session: SessionId,
        query: &GroupQuery,
        now: DateTime<Utc>,
        error_if_stale: bool,
        require_window: Option<&QueryWindow>,
    ) -> Result<FetchedResult, CacheError> {
        let entries = self.entries.lock().expect("query cache poisoned");
        let entry = entries
            .get(&Self::key(session, query))
            .ok_or_else(|| CacheError::Missing {
                server: query.query_server.clone(),
                query: query.name.clone(),
            })?;

        if let Some(window) = require_window {
            if entry.window != *window {
                return Err(CacheError::WindowMismatch {
                    server: query.query_server.clone(),
                    query: query.name.clone(),
                });
            }
        }

        let age_secs = (now - entry.time_received).num_seconds();
        let expired = age_secs > query.interval_secs as i64;
        if expired && error_if_stale {
            return Err(CacheError::Stale {
                server: query.query_server.clone(),
                query: query.name.clone(),
                interval_secs: query.interval_secs,
            });
        }

        Ok(FetchedResult {
            result: entry.result.clone(),
            expired,
            time_received: entry.time_received,
        })
    }

    /// Try to take the advisory refresh lock for a query. Returns false
    /// when another refresh holds it and has not exceeded the lock
    /// timeout; the caller should skip rather than queue.
    pub fn try_acquire_refresh_lock(
        &self,
        session: SessionId,
        query: &GroupQuery,
        now: DateTime<Utc>,
    ) -> bool {
        let key = Self::key(session, query);
        let mut locks = self.refresh_locks.lock().expect("refresh lock map poisoned");

        if let Some(taken_at) = locks.get(&key) {
            let held_secs = (now - *taken_at).num_seconds();
            if held_secs < self.lock_timeout_secs as i64 {
                return false;
            }
            // Held past the timeout: the refresh hung or died, reclaim.
        }

        locks.insert(key, now);
        true
    }

    /// Release the refresh lock after a refresh completes or fails.
    pub fn release_refresh_lock(&self, session: SessionId, query: &GroupQuery) {
        let mut locks = self.refresh_locks.lock().expect("refresh lock map poisoned");
        locks.remove(&Self::key(session, query));
    }
}
