//! Warden: automated operations decision engine.
//!
//! Warden watches live metric streams, synthesizes a population of
//! ephemeral monitored entities ("bots") from the results, scores a
//! configurable set of candidate remediation actions per bot with a
//! utility-function model, and executes the highest-scoring eligible
//! action under cooldowns, prerequisite states and mutual-exclusion lock
//! timers.
//!
//! ## Architecture
//!
//! - **Engine**: the periodic driver and its injected registries (query
//!   cache, lock timers, sessions)
//! - **Scoring**: range mapping, curve lookup, multiplicative combination
//!   with averaging correction
//! - **Expression language**: tiny arithmetic/comparison/logical
//!   evaluator feeding considerations and synthetic variables
//! - **Collaborator seams**: metric source, command executor and metric
//!   exporter traits, injected at construction

pub mod config;
pub mod curves;
pub mod engine;
pub mod executor;
pub mod export;
pub mod expr;
pub mod format;
pub mod source;
pub mod types;

// Re-export the engine surface
pub use engine::{Engine, GroupReport, WhatIfControl, WhatIfReport};

// Re-export commonly used types
pub use types::{
    Action, Bot, BotActionData, BotGroup, Command, CommandKind, CommandResult, Consideration,
    GroupQuery, LookupError, QueryServer, QueryWindow, SessionId, SessionOverrides, SiteConfig,
    VariableDef,
};

// Re-export the scoring primitives for tooling and tests
pub use curves::{Curve, CurveTable};
pub use engine::scoring::{average_and_fixup, range_map};
pub use expr::{EvalError, Expression};

// Re-export collaborator seams
pub use executor::{CommandExecutor, ExecutionOutcome, HttpExecutor, NoopExecutor};
pub use export::{MetricExporter, NoopExporter, TracingExporter};
pub use source::{MetricSource, PrometheusSource, QueryResult, QueryRow, SourceError};
