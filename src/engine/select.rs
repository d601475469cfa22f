//! Action availability, selection gates and execution.
//!
//! Availability is the scored-side gate: the post-weight final score must
//! meet the action's threshold and every required state must be active.
//! Selection applies the operational gates on top: launched and enabled,
//! nothing frozen, bot valid and fresh, lock timers free, repeat delay
//! passed, and continuous availability long enough. Among the selectable
//! actions the highest final score wins, ties broken by declaration
//! order.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use super::locks::LockTimerRegistry;
use super::session::GroupRuntime;
use super::states;
use super::variables::render_template;
use crate::executor::CommandExecutor;
use crate::export::{action_labels, MetricExporter};
use crate::types::{Action, Bot, Command, CommandResult};

/// Update each action's availability from its freshly computed score.
///
/// The threshold compares the post-weight final score. The moment the
/// conditions first hold the start time is recorded, and it is preserved
/// across ticks while they keep holding; the moment they stop, the flag
/// and start time reset. An action whose required states are missing also
/// has its recorded score forced to 0, so state-gated actions never rank.
pub fn update_availability(group: &GroupRuntime, now: DateTime<Utc>) {
    let spec = &group.spec;

    for handle in group.bot_handles() {
        let mut bot = handle.lock().expect("bot poisoned");

        for action in &spec.actions {
            let states_ok = action.required_states.iter().all(|s| bot.has_state(s));
            // Split borrow: the states check is done before the data map
            // is touched.
            let Some(data) = bot.action_data.get_mut(&action.name) else {
                continue;
            };

            if data.final_score >= action.weight_threshold && states_ok {
                if !data.is_available {
                    data.is_available = true;
                    data.available_start = Some(now);
                }
                continue;
            }

            if !states_ok {
                data.final_score = 0.0;
                data.details.push(format!(
                    "Setting final score to 0.  Missing required states: {}",
                    action.required_states.join(", ")
                ));
            }
            if data.final_score < action.weight_threshold {
                data.details.push(format!(
                    "Final score ({:.2}) under the action threshold ({:.2})",
                    data.final_score, action.weight_threshold
                ));
            }
            data.is_available = false;
            data.available_start = None;
        }
    }
}

/// Whether an action passes every execution gate for this bot right now.
fn is_selectable(
    action: &Action,
    group: &GroupRuntime,
    bot: &Bot,
    timers: &LockTimerRegistry,
    now: DateTime<Utc>,
) -> bool {
    if !action.is_launched || action.is_disabled {
        return false;
    }

    let Some(data) = bot.action_data.get(&action.name) else {
        return false;
    };
    if !data.is_available {
        return false;
    }
    if data.final_score <= group.spec.action_threshold {
        return false;
    }

    if !timers.all_available(action, &group.spec, &bot.name, now) {
        return false;
    }

    if let Some(last) = data.last_executed {
        if (now - last).num_seconds() < action.execute_repeat_delay_secs as i64 {
            return false;
        }
    }

    if action.required_available_secs > 0 {
        match data.available_start {
            Some(start)
                if (now - start).num_seconds() >= action.required_available_secs as i64 => {}
            _ => return false,
        }
    }

    true
}

/// The name of the best selectable action for a bot, if any.
fn select_action(
    group: &GroupRuntime,
    bot: &Bot,
    timers: &LockTimerRegistry,
    now: DateTime<Utc>,
) -> Option<String> {
    let mut best: Option<(&Action, f64)> = None;
    for action in &group.spec.actions {
        if !is_selectable(action, group, bot, timers, now) {
            continue;
        }
        let score = bot.action_data[&action.name].final_score;
        // Strictly greater keeps the earliest declared action on ties.
        if best.map_or(true, |(_, best_score)| score > best_score) {
            best = Some((action, score));
        }
    }
    best.map(|(action, _)| action.name.clone())
}

/// A decision taken under the bot's lock, carried across the await on the
/// executor so no lock is held while the command runs.
struct PendingExecution {
    action: Action,
    bot_name: String,
    score: f64,
    states_before: Vec<String>,
    command_log: String,
    rendered_content: String,
}

/// Select and execute the top action for each bot in the group.
///
/// Returns whether anything executed, so the driver can rescore: a state
/// change from an executed command usually changes which actions are
/// available.
pub async fn select_and_execute(
    group: &GroupRuntime,
    timers: &LockTimerRegistry,
    executor: &Arc<dyn CommandExecutor>,
    exporter: &Arc<dyn MetricExporter>,
    now: DateTime<Utc>,
) -> bool {
    if group.spec.freeze_actions {
        return false;
    }

    let mut executed_any = false;

    for handle in group.bot_handles() {
        // Decide under the bot lock, then release it before the command
        // runs; a slow command must not block readers of this bot.
        let pending: Option<PendingExecution> = {
            let bot = handle.lock().expect("bot poisoned");
            if bot.is_invalid || bot.is_stale || bot.freeze_actions {
                None
            } else {
                select_action(group, &bot, timers, now).and_then(|name| {
                    let action = group.spec.action(&name).ok()?.clone();
                    let score = bot.action_data[&name].final_score;
                    let render = render_context(group, &bot, &action, score);
                    Some(PendingExecution {
                        command_log: render_template(&action.command.log_format, &render),
                        rendered_content: render_template(&action.command.content, &render),
                        bot_name: bot.name.clone(),
                        states_before: bot.states.clone(),
                        score,
                        action,
                    })
                })
            }
        };

        let Some(pending) = pending else {
            continue;
        };

        info!(
            group = %group.spec.name,
            bot = %pending.bot_name,
            action = %pending.action.name,
            score = pending.score,
            "executing action"
        );

        let outcome = executor
            .execute(&pending.action.command, pending.rendered_content.clone())
            .await;

        apply_outcome(group, &handle, timers, exporter, &pending, &outcome, now);
        executed_any = true;
    }

    executed_any
}

/// Record the outcome and, on success, apply the command's effects: lock
/// timers, state transitions and the history entry.
fn apply_outcome(
    group: &GroupRuntime,
    handle: &Arc<std::sync::Mutex<Bot>>,
    timers: &LockTimerRegistry,
    exporter: &Arc<dyn MetricExporter>,
    pending: &PendingExecution,
    outcome: &crate::executor::ExecutionOutcome,
    now: DateTime<Utc>,
) {
    let mut bot = handle.lock().expect("bot poisoned");
    let command: &Command = &pending.action.command;

    if outcome.succeeded {
        timers.activate_all(
            &pending.action,
            &group.spec,
            &bot.name,
            command.lock_timer_duration_secs,
            now,
        );

        if let Err(err) = states::set_states(&group.spec, &mut bot, &command.set_bot_states) {
            warn!(
                group = %group.spec.name,
                bot = %bot.name,
                action = %pending.action.name,
                %err,
                "state advance failed after execution; states may be out of sync"
            );
        }
        for state in &command.reset_bot_states {
            if let Err(err) = states::reset_state(&group.spec, &mut bot, state) {
                warn!(
                    group = %group.spec.name,
                    bot = %bot.name,
                    state = %state,
                    %err,
                    "state reset failed after execution"
                );
            }
        }

        exporter.add_counter(
            "warden_action_executed",
            1,
            "An action met every requirement with the top score and executed",
            &action_labels(&group.spec, &bot, &pending.action.name),
        );
    }

    if let Some(data) = bot.action_data.get_mut(&pending.action.name) {
        data.last_executed = Some(now);
    }

    let result = CommandResult {
        bot_group: group.spec.name.clone(),
        bot: bot.name.clone(),
        action: pending.action.name.clone(),
        command_log: pending.command_log.clone(),
        result_status: outcome.status.clone(),
        result_content: outcome.content.clone(),
        host: outcome.host.clone(),
        started: outcome.started,
        finished: outcome.finished,
        score: pending.score,
        states_before: pending.states_before.clone(),
        states_after: bot.states.clone(),
    };
    bot.command_history.push(result);
}

/// Template values available to a command's content and log format.
fn render_context(
    group: &GroupRuntime,
    bot: &Bot,
    action: &Action,
    score: f64,
) -> HashMap<String, String> {
    HashMap::from([
        ("bot_group".to_string(), group.spec.name.clone()),
        ("bot".to_string(), bot.name.clone()),
        ("action".to_string(), action.name.clone()),
        ("command".to_string(), action.command.name.clone()),
        ("score".to_string(), format!("{score:.2}")),
    ])
}
