//! Bot group templates: everything used to populate the ephemeral bots.

use serde::{Deserialize, Serialize};

use super::{Action, LookupError};

/// How bots are discovered: the named query whose result rows carry the
/// identity key. Something that uniquely identifies an entity inside the
/// group, like "instance", "node" or "service".
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BotExtractor {
    pub query_name: String,
    pub key: String,
}

/// Query request shape, which controls the endpoint we hit.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum QueryKind {
    #[default]
    Range,
}

impl QueryKind {
    /// Endpoint path fragment for building the request.
    pub fn endpoint(self) -> &'static str {
        match self {
            QueryKind::Range => "query_range",
        }
    }
}

/// A named query owned by a bot group, used to populate bot variables.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GroupQuery {
    pub query_server: String,
    #[serde(default)]
    pub kind: QueryKind,
    pub name: String,
    #[serde(default)]
    pub info: String,
    pub query: String,
    /// Refresh interval; a cached result older than this is expired.
    pub interval_secs: u64,
}

/// Raw input type of a variable. Everything becomes f64 internally, but
/// knowing the origin type drives formatting.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum VariableKind {
    Boolean,
    #[default]
    Float,
}

/// Human-readable presentation for a variable value.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum VariableFormat {
    #[default]
    Float,
    Bool,
    Bytes,
    Percent,
    Duration,
}

/// Definition of one bot variable.
///
/// If `evaluate` is non-empty this is a synthetic variable: no query is
/// read, and the expression runs after all query variables are set,
/// consuming only query variables (synthetics cannot reference each other).
///
/// Otherwise the variable is populated from the named query's cached
/// result. `bot_key` names the result column matched against the bot name;
/// when empty the row applies to every bot as a broadcast signal.
/// `query_key`/`query_key_value` optionally filter rows before binding.
/// The name itself may contain `{{label}}` templates expanded from the
/// row's label set, fanning one query out into several variables.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct VariableDef {
    #[serde(default)]
    pub kind: VariableKind,
    pub name: String,
    #[serde(default)]
    pub format: VariableFormat,
    #[serde(default)]
    pub bot_key: String,
    #[serde(default)]
    pub query_name: String,
    #[serde(default)]
    pub query_key: String,
    #[serde(default)]
    pub query_key_value: String,
    #[serde(default)]
    pub evaluate: String,
    /// When set, the resolved value is published through the metric
    /// exporter for every bot that has it.
    #[serde(default)]
    pub export: bool,
}

impl VariableDef {
    /// Synthetic variables are produced by expression evaluation, not a query.
    pub fn is_synthetic(&self) -> bool {
        !self.evaluate.is_empty()
    }
}

/// A forward sequence state: a state machine with a single forward
/// sequence. It can be advanced (skipping steps is allowed) and it can be
/// reset to the first label, but it can never go backwards.
///
/// States exclude actions from being tested, so actions can be targeted at
/// a specific phase of a bot's operation: investigating, remediating,
/// checking for resolution, escalating.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StateDef {
    pub name: String,
    #[serde(default)]
    pub info: String,
    pub labels: Vec<String>,
}

/// Scope of a lock timer: one shared slot for the whole group, or one slot
/// per bot. Group scope acts as a global mutual-exclusion lane, since bot
/// groups are data silos that never interact.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LockTimerScope {
    #[default]
    Group,
    Bot,
}

/// Definition of a named lock timer. Live timer state is tracked by the
/// engine's lock timer registry, not here.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LockTimerDef {
    #[serde(default)]
    pub scope: LockTimerScope,
    pub name: String,
    #[serde(default)]
    pub info: String,
}

/// The template from which bots are created: how entities are discovered,
/// which queries feed them, which variables and states they carry, and
/// which actions compete for execution. Mutated only by config reload; the
/// live bot list lives in the engine's per-group runtime.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BotGroup {
    pub name: String,
    #[serde(default)]
    pub info: String,
    pub bot_extractor: BotExtractor,
    #[serde(default)]
    pub states: Vec<StateDef>,
    #[serde(default)]
    pub lock_timers: Vec<LockTimerDef>,
    /// Seconds since the last variable update until a bot is marked stale.
    #[serde(default = "default_timeout_stale")]
    pub bot_timeout_stale_secs: u64,
    /// Seconds since the last variable update until a bot is removed.
    #[serde(default = "default_timeout_remove")]
    pub bot_timeout_remove_secs: u64,
    /// How long a removed bot is stored for inspection. If it returns
    /// within this window it is resumed, unless `refuse_bot_resumption`.
    #[serde(default = "default_remove_store")]
    pub bot_remove_store_secs: u64,
    /// When set, a returning bot always starts fresh, disconnecting it
    /// from the stored history even though it shares the same identity.
    #[serde(default)]
    pub refuse_bot_resumption: bool,
    /// Minimum final score for any action in this group to execute.
    #[serde(default)]
    pub action_threshold: f64,
    /// How long command results are kept in a bot's history.
    #[serde(default = "default_history")]
    pub command_history_secs: u64,
    #[serde(default)]
    pub queries: Vec<GroupQuery>,
    #[serde(default)]
    pub variables: Vec<VariableDef>,
    #[serde(default)]
    pub actions: Vec<Action>,
    /// Group-level kill switch: score everything, execute nothing.
    #[serde(default)]
    pub freeze_actions: bool,
}

const fn default_timeout_stale() -> u64 {
    60
}

const fn default_timeout_remove() -> u64 {
    300
}

const fn default_remove_store() -> u64 {
    3600
}

const fn default_history() -> u64 {
    86400
}

impl BotGroup {
    pub fn query(&self, name: &str) -> Result<&GroupQuery, LookupError> {
        self.queries
            .iter()
            .find(|q| q.name == name)
            .ok_or_else(|| LookupError::Query {
                group: self.name.clone(),
                name: name.to_string(),
            })
    }

    pub fn variable(&self, name: &str) -> Result<&VariableDef, LookupError> {
        self.variables
            .iter()
            .find(|v| v.name == name)
            .ok_or_else(|| LookupError::Variable {
                group: self.name.clone(),
                name: name.to_string(),
            })
    }

    pub fn action(&self, name: &str) -> Result<&Action, LookupError> {
        self.actions
            .iter()
            .find(|a| a.name == name)
            .ok_or_else(|| LookupError::Action {
                group: self.name.clone(),
                name: name.to_string(),
            })
    }

    pub fn state(&self, name: &str) -> Result<&StateDef, LookupError> {
        self.states
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| LookupError::State {
                group: self.name.clone(),
                name: name.to_string(),
            })
    }

    pub fn lock_timer(&self, name: &str) -> Result<&LockTimerDef, LookupError> {
        self.lock_timers
            .iter()
            .find(|t| t.name == name)
            .ok_or_else(|| LookupError::LockTimer {
                group: self.name.clone(),
                name: name.to_string(),
            })
    }

    /// Names of the non-synthetic variables, the only ones visible to
    /// synthetic evaluation.
    pub fn query_variable_names(&self) -> Vec<&str> {
        self.variables
            .iter()
            .filter(|v| !v.is_synthetic())
            .map(|v| v.name.as_str())
            .collect()
    }

    /// A bot's variables with their human-readable renderings, sorted by
    /// name so they display consistently. Variables without a matching
    /// definition (templated fan-outs) fall back to float formatting.
    pub fn formatted_variables(&self, bot: &super::Bot) -> Vec<(String, String)> {
        let mut rows: Vec<(String, String)> = bot
            .variables
            .iter()
            .map(|(name, value)| {
                let format = self
                    .variable(name)
                    .map(|v| v.format)
                    .unwrap_or(VariableFormat::Float);
                (name.clone(), crate::format::format_value(format, *value))
            })
            .collect();
        rows.sort();
        rows
    }
}
