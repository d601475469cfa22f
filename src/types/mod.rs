//! Core data model: sites, bot groups, bots, actions, sessions.
//!
//! Everything in here is plain serde data. Behavior lives in the `engine`
//! modules; these types only carry configuration and runtime state.

mod action;
mod bot;
mod group;
mod session;
mod site;

pub use action::{Action, Command, CommandKind, Consideration};
pub use bot::{is_unset, Bot, BotActionData, CommandResult, UNSET_VALUE};
pub use group::{
    BotExtractor, BotGroup, GroupQuery, LockTimerDef, LockTimerScope, QueryKind, StateDef,
    VariableDef, VariableFormat, VariableKind,
};
pub use session::{BotOverride, GroupOverride, QueryWindow, SessionId, SessionOverrides};
pub use site::{QueryServer, QueryServerKind, SiteConfig};

use thiserror::Error;

/// A named configuration entity could not be found.
///
/// These always indicate a config/data mismatch that would silently skew
/// decisions, so they are surfaced by name instead of defaulted.
#[derive(Debug, Clone, Error)]
pub enum LookupError {
    #[error("query server missing: {name}")]
    QueryServer { name: String },
    #[error("bot group {group}: query missing: {name}")]
    Query { group: String, name: String },
    #[error("bot group {group}: variable missing: {name}")]
    Variable { group: String, name: String },
    #[error("bot group {group}: action missing: {name}")]
    Action { group: String, name: String },
    #[error("action {action}: consideration missing: {name}")]
    Consideration { action: String, name: String },
    #[error("bot group {group}: state missing: {name}")]
    State { group: String, name: String },
    #[error("bot group {group}: lock timer missing: {name}")]
    LockTimer { group: String, name: String },
    #[error("bot group {group}: bot missing: {name}")]
    Bot { group: String, name: String },
    #[error("curve missing: {name}")]
    Curve { name: String },
}
