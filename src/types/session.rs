//! Session identity, query windows and what-if overrides.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifies a pipeline run context. Zero is reserved for the production
/// loop; anything else is an interactive what-if session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub struct SessionId(pub u64);

impl SessionId {
    pub const PRODUCTION: SessionId = SessionId(0);

    pub fn is_production(self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The time window a session's queries cover. Production windows end at
/// "now"; what-if sessions substitute an arbitrary historical window.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueryWindow {
    pub start: DateTime<Utc>,
    pub duration_secs: u64,
}

impl QueryWindow {
    pub fn new(start: DateTime<Utc>, duration_secs: u64) -> Self {
        Self {
            start,
            duration_secs,
        }
    }

    /// The production window: the trailing `duration_secs` ending at `now`.
    pub fn trailing(now: DateTime<Utc>, duration_secs: u64) -> Self {
        Self {
            start: now - chrono::Duration::seconds(duration_secs as i64),
            duration_secs,
        }
    }
}

/// Overrides to one bot: substituted variable values and forced states.
/// Useful to see how scores would change if some monitoring data were
/// different, without waiting for a time where that was true.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BotOverride {
    pub bot_name: String,
    #[serde(default)]
    pub variables: HashMap<String, f64>,
    /// `Name.Label` states forced active, replacing the current label of
    /// the same state.
    #[serde(default)]
    pub states: Vec<String>,
}

/// Overrides to one group: action and consideration weights, applied to
/// every bot in the group's cloned tree.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GroupOverride {
    pub group_name: String,
    /// Action name to replacement weight.
    #[serde(default)]
    pub action_weights: HashMap<String, f64>,
    /// Action name to (consideration name to replacement weight).
    #[serde(default)]
    pub consideration_weights: HashMap<String, HashMap<String, f64>>,
}

/// All override changes carried by a what-if session. Applied only to the
/// session's private clone, never to production data.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SessionOverrides {
    #[serde(default)]
    pub groups: Vec<GroupOverride>,
    #[serde(default)]
    pub bots: Vec<BotOverride>,
}
