//! Actions, considerations and commands: the candidates the scoring
//! engine ranks, and the side effect that runs when one is selected.

use serde::{Deserialize, Serialize};

use super::LookupError;

/// One scoring input to an action's utility function. Each consideration
/// produces a score, and the combined result becomes the action's score.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Consideration {
    pub name: String,
    pub weight: f64,
    /// Named curve used to reshape the ranged score.
    pub curve: String,
    pub range_start: f64,
    pub range_end: f64,
    /// Expression evaluated over the bot's resolved variables.
    pub evaluate: String,
}

/// What kind of side effect a command is. One thing per action, because
/// this is a decision system.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    Shell,
    WebHttps,
    WebHttpInsecure,
    WebRpc,
    #[default]
    NoOp,
}

/// The side effect executed when an action is selected. Execution itself
/// is delegated to a [`CommandExecutor`](crate::executor::CommandExecutor);
/// the engine only records the result and applies the state transitions.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Command {
    /// Description of the effect this command causes.
    pub name: String,
    /// `{{key}}` template rendered into the command-history log line.
    #[serde(default)]
    pub log_format: String,
    #[serde(default)]
    pub kind: CommandKind,
    /// Payload: URL, shell line or RPC body, depending on the kind.
    #[serde(default)]
    pub content: String,
    /// Status the executor treats as success; 0 means any completion.
    #[serde(default)]
    pub success_status: i64,
    #[serde(default)]
    pub success_content: String,
    /// On success, every required lock timer of the owning action is
    /// activated for this long, blocking its whole execution lane.
    #[serde(default)]
    pub lock_timer_duration_secs: u64,
    /// States advanced on success. A bare state name advances one label;
    /// a `Name.Label` target jumps forward to that label.
    #[serde(default)]
    pub set_bot_states: Vec<String>,
    /// States reset to their first label on success.
    #[serde(default)]
    pub reset_bot_states: Vec<String>,
}

/// A candidate remediation. Actions are scored from their considerations
/// and the highest-scoring available one that passes every gate (lock
/// timers, repeat delay, required states, required availability duration)
/// is executed.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Action {
    pub name: String,
    #[serde(default)]
    pub info: String,
    /// Launched means configured and ready to run live. Unlaunched
    /// actions are scored for inspection but never executed.
    #[serde(default)]
    pub is_launched: bool,
    /// Temporarily disable without removing configuration.
    #[serde(default)]
    pub is_disabled: bool,
    /// Multiplier applied to the combined consideration score.
    pub weight: f64,
    /// Floor for the post-weight score: a positive score below this is
    /// raised to it. Independent of `weight_threshold`.
    #[serde(default)]
    pub weight_min: f64,
    /// Minimum post-weight score for this action to become available.
    /// Zero means always eligible on score alone.
    #[serde(default)]
    pub weight_threshold: f64,
    /// Seconds after an execution before this action may run again.
    #[serde(default)]
    pub execute_repeat_delay_secs: u64,
    /// When non-zero, the action must have been continuously available
    /// for this long before it may execute. Filters out flapping scores.
    #[serde(default)]
    pub required_available_secs: u64,
    /// All of these lock timers must be inactive to execute, and all are
    /// activated afterwards.
    #[serde(default)]
    pub required_lock_timers: Vec<String>,
    /// All of these `Name.Label` states must be active on the bot.
    #[serde(default)]
    pub required_states: Vec<String>,
    #[serde(default)]
    pub considerations: Vec<Consideration>,
    #[serde(default)]
    pub command: Command,
}

impl Action {
    pub fn consideration(&self, name: &str) -> Result<&Consideration, LookupError> {
        self.considerations
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| LookupError::Consideration {
                action: self.name.clone(),
                name: name.to_string(),
            })
    }
}
