//! Metric exporter seam: a write-only side channel the engine publishes
//! gauges and counters into. Never read back by the engine.

use std::collections::HashMap;

use tracing::debug;

use crate::types::{Bot, BotGroup};

pub trait MetricExporter: Send + Sync {
    fn set_gauge(&self, name: &str, value: f64, info: &str, labels: &HashMap<String, String>);
    fn add_counter(&self, name: &str, value: u64, info: &str, labels: &HashMap<String, String>);
}

/// Discards everything.
pub struct NoopExporter;

impl MetricExporter for NoopExporter {
    fn set_gauge(&self, _name: &str, _value: f64, _info: &str, _labels: &HashMap<String, String>) {}
    fn add_counter(&self, _name: &str, _value: u64, _info: &str, _labels: &HashMap<String, String>) {
    }
}

/// Emits metrics as debug-level tracing events. Stands in until a real
/// telemetry pipeline is wired up downstream.
pub struct TracingExporter;

impl MetricExporter for TracingExporter {
    fn set_gauge(&self, name: &str, value: f64, _info: &str, labels: &HashMap<String, String>) {
        debug!(metric = name, value, ?labels, "gauge");
    }

    fn add_counter(&self, name: &str, value: u64, _info: &str, labels: &HashMap<String, String>) {
        debug!(metric = name, value, ?labels, "counter");
    }
}

/// Labels identifying a bot variable.
pub fn variable_labels(group: &BotGroup, bot: &Bot, variable: &str) -> HashMap<String, String> {
    let mut labels = HashMap::new();
    labels.insert("bot_group".to_string(), group.name.clone());
    labels.insert("bot".to_string(), bot.name.clone());
    labels.insert("variable".to_string(), variable.to_string());
    labels
}

/// Labels identifying a bot action.
pub fn action_labels(group: &BotGroup, bot: &Bot, action: &str) -> HashMap<String, String> {
    let mut labels = HashMap::new();
    labels.insert("bot_group".to_string(), group.name.clone());
    labels.insert("bot".to_string(), bot.name.clone());
    labels.insert("action".to_string(), action.to_string());
    labels
}
