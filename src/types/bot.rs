//! Bots: the ephemeral monitored entities, and their per-action scoring
//! state and command history.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Sentinel stored when a query row is present but its value is missing
/// or malformed. Distinguishable from any real measurement without
/// poisoning arithmetic the way NaN would.
pub const UNSET_VALUE: f64 = f64::MIN_POSITIVE;

/// Whether a variable value is the unset sentinel.
pub fn is_unset(value: f64) -> bool {
    value == UNSET_VALUE
}

/// Per-action scoring state for one bot. Created on the first scoring
/// pass for the (bot, action) pair and kept for the bot's lifetime so
/// availability duration and repeat delay survive across ticks.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BotActionData {
    /// Total result of scoring this action for execution.
    pub final_score: f64,
    /// Set while the score is over the threshold and the required states
    /// are active.
    pub is_available: bool,
    /// When availability began; cleared whenever it is lost.
    pub available_start: Option<DateTime<Utc>>,
    /// Last time this action executed for this bot.
    pub last_executed: Option<DateTime<Utc>>,
    /// Narrative of the evaluation and scoring, for inspection.
    pub details: Vec<String>,
    pub raw_scores: HashMap<String, f64>,
    pub ranged_scores: HashMap<String, f64>,
    pub curved_scores: HashMap<String, f64>,
    /// Per-consideration weighted contributions.
    pub final_scores: HashMap<String, f64>,
}

impl BotActionData {
    /// Reset the per-pass scoring output, keeping the stateful fields
    /// (availability start, last execution).
    pub fn clear_scores(&mut self) {
        self.details.clear();
        self.raw_scores.clear();
        self.ranged_scores.clear();
        self.curved_scores.clear();
        self.final_scores.clear();
    }
}

/// Record of one executed command, stored in the bot's history.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CommandResult {
    pub bot_group: String,
    pub bot: String,
    pub action: String,
    /// Rendered `log_format`, a rich version of the command name.
    pub command_log: String,
    pub result_status: String,
    pub result_content: String,
    /// Host the command ran on, reported by the executor.
    pub host: String,
    pub started: DateTime<Utc>,
    pub finished: DateTime<Utc>,
    /// The action's final score at execution time.
    pub score: f64,
    pub states_before: Vec<String>,
    pub states_after: Vec<String>,
}

/// An ephemeral monitored entity, built from the group template and
/// expected to appear and disappear at any time.
///
/// A bot is expected to receive every variable the group declares; if any
/// is missing the bot is invalid, because decisions would be made on an
/// incomplete data set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bot {
    /// Unique identity pulled from the group's extractor key.
    pub name: String,
    /// Resolved variable values, the input to all consideration scoring.
    pub variables: HashMap<String, f64>,
    /// Active `Name.Label` states, kept sorted. One entry per declared
    /// state.
    pub states: Vec<String>,
    /// Keyed by action name.
    pub action_data: HashMap<String, BotActionData>,
    pub command_history: Vec<CommandResult>,
    /// Per-bot kill switch.
    pub freeze_actions: bool,
    /// Set when a declared variable is missing; invalid bots cannot
    /// execute actions.
    pub is_invalid: bool,
    /// Short sentences concatenated into the reasons for invalidity.
    pub invalid_reason: String,
    /// Set when no variable update arrived within the stale timeout.
    /// Invalid is the super-state and is marked alongside.
    pub is_stale: bool,
    /// Last time a query variable landed on this bot; drives staleness
    /// and removal.
    pub last_variable_update: DateTime<Utc>,
    pub created: DateTime<Utc>,
}

impl Bot {
    pub fn new(name: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            variables: HashMap::new(),
            states: Vec::new(),
            action_data: HashMap::new(),
            command_history: Vec::new(),
            freeze_actions: false,
            is_invalid: false,
            invalid_reason: String::new(),
            is_stale: false,
            last_variable_update: now,
            created: now,
        }
    }

    /// Whether this exact `Name.Label` state is active.
    pub fn has_state(&self, state: &str) -> bool {
        self.states.iter().any(|s| s == state)
    }

    /// Append an invalidity reason and mark the bot invalid.
    pub fn mark_invalid(&mut self, reason: &str) {
        self.is_invalid = true;
        self.invalid_reason.push_str(reason);
        self.invalid_reason.push_str(".  ");
    }

    /// Drop history entries older than the retention window.
    pub fn prune_history(&mut self, now: DateTime<Utc>, keep_secs: u64) {
        self.command_history
            .retain(|r| (now - r.started).num_seconds() <= keep_secs as i64);
    }
}
