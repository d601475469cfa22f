//! Variable resolution: populating each bot's variable set.
//!
//! Phase 1 binds query variables from cached results. Phase 2 evaluates
//! synthetic variables from expressions over the query-phase values.
//! Synthetic variables may reference only query variables, never each
//! other; resolving the phases in order makes cyclic dependency
//! impossible by construction.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use super::cache::QueryCache;
use super::session::GroupRuntime;
use crate::expr::Expression;
use crate::types::{is_unset, SessionId, VariableDef, UNSET_VALUE};

/// Expand `{{key}}` placeholders from a label map. Unknown keys are left
/// in place so a misconfigured template stays visible in the output.
pub fn render_template(template: &str, values: &HashMap<String, String>) -> String {
    let mut out = template.to_string();
    for (key, value) in values {
        out = out.replace(&format!("{{{{{key}}}}}"), value);
    }
    out
}

/// Clear every bot's variable map so the pass starts fresh. A metric that
/// vanished upstream becomes a missing variable instead of a zombie value
/// from a previous tick.
pub fn clear_variables(group: &GroupRuntime) {
    for handle in group.bot_handles() {
        let mut bot = handle.lock().expect("bot poisoned");
        bot.variables.clear();
    }
}

/// Phase 1: bind query variables from the cached results.
///
/// For each declared query variable, each row of its query's cached
/// result is matched against the bots. A row binds to the bot whose name
/// equals the row's `bot_key` label; with no `bot_key` the row is a
/// broadcast applied to every bot. A `query_key`/`query_key_value` pair
/// filters rows before binding. The variable name is rendered against the
/// row's labels, letting one query fan out into differently-named
/// variables.
///
/// Expired cache entries are still used here, but binding from one does
/// not refresh the bots' liveness timestamp: values keep flowing while
/// the staleness propagates to the dependent bots through the stale
/// timeout instead of failing the pass.
pub fn resolve_query_variables(
    group: &GroupRuntime,
    cache: &QueryCache,
    session: SessionId,
    error_if_stale: bool,
    now: DateTime<Utc>,
) {
    let spec = &group.spec;
    let handles = group.bot_handles();

    for query in &spec.queries {
        let fetched = match cache.fetch(session, query, now, error_if_stale, None) {
            Ok(fetched) => fetched,
            Err(err) => {
                debug!(group = %spec.name, query = %query.name, %err, "skipping query");
                continue;
            }
        };

        for row in &fetched.result.rows {
            for variable in &spec.variables {
                if variable.query_name != query.name || variable.is_synthetic() {
                    continue;
                }

                // Optional row filter on a label value.
                if !variable.query_key.is_empty()
                    && row.labels.get(&variable.query_key) != Some(&variable.query_key_value)
                {
                    continue;
                }

                let value = match row.first_value() {
                    Some(raw) => raw.parse::<f64>().unwrap_or_else(|_| {
                        warn!(
                            group = %spec.name,
                            variable = %variable.name,
                            raw,
                            "malformed sample value; storing unset"
                        );
                        UNSET_VALUE
                    }),
                    None => UNSET_VALUE,
                };

                let name = render_template(&variable.name, &row.labels);

                for handle in &handles {
                    let mut bot = handle.lock().expect("bot poisoned");

                    // The row binds to the matching bot, or to every bot
                    // when no bot_key is declared (a broadcast signal).
                    let matches = variable.bot_key.is_empty()
                        || row.labels.get(&variable.bot_key) == Some(&bot.name);
                    if !matches {
                        continue;
                    }

                    bot.variables.insert(name.clone(), value);
                    if !fetched.expired {
                        bot.last_variable_update = now;
                    }

                    // A keyed row matches exactly one bot; a broadcast
                    // applies to all of them.
                    if !variable.bot_key.is_empty() {
                        break;
                    }
                }
            }
        }
    }
}

/// Phase 2: evaluate synthetic variables.
///
/// Each expression compiles once and evaluates once per bot against a
/// snapshot containing only that bot's query-phase variables. A failed or
/// non-numeric evaluation leaves the variable unset for that bot and
/// moves on; other bots and other variables are unaffected.
pub fn resolve_synthetic_variables(group: &GroupRuntime) {
    let spec = &group.spec;
    let query_names: Vec<&str> = spec.query_variable_names();

    for variable in &spec.variables {
        if !variable.is_synthetic() {
            continue;
        }

        let expression = match Expression::parse(&variable.evaluate) {
            Ok(expression) => expression,
            Err(err) => {
                warn!(
                    group = %spec.name,
                    variable = %variable.name,
                    %err,
                    "synthetic variable expression failed to compile"
                );
                continue;
            }
        };

        for handle in group.bot_handles() {
            let mut bot = handle.lock().expect("bot poisoned");
            let snapshot = query_phase_snapshot(&bot.variables, &query_names);

            match expression.evaluate(&snapshot) {
                Ok(value) => {
                    bot.variables.insert(variable.name.clone(), value);
                }
                Err(err) => {
                    debug!(
                        group = %spec.name,
                        bot = %bot.name,
                        variable = %variable.name,
                        %err,
                        "synthetic variable left unset"
                    );
                }
            }
        }
    }
}

/// The read-only snapshot synthetic evaluation sees: query-phase
/// variables only, and never the unset sentinel.
fn query_phase_snapshot(
    variables: &HashMap<String, f64>,
    query_names: &[&str],
) -> HashMap<String, f64> {
    variables
        .iter()
        .filter(|(name, value)| {
            !is_unset(**value) && query_names.iter().any(|q| q == name)
        })
        .map(|(name, value)| (name.clone(), *value))
        .collect()
}

/// Mark bots missing any declared variable as invalid, with the reason.
/// Templated names are skipped: their concrete names depend on live label
/// sets, so absence is not statically decidable.
pub fn mark_invalid_bots(group: &GroupRuntime) {
    let declared: Vec<&VariableDef> = group
        .spec
        .variables
        .iter()
        .filter(|v| !v.name.contains("{{"))
        .collect();

    for handle in group.bot_handles() {
        let mut bot = handle.lock().expect("bot poisoned");
        bot.is_invalid = false;
        bot.invalid_reason.clear();

        for variable in &declared {
            if !bot.variables.contains_key(&variable.name) {
                let reason = format!("Missing variable: {}", variable.name);
                bot.mark_invalid(&reason);
            }
        }

        if bot.is_stale {
            bot.mark_invalid("Bot is stale");
        }
    }
}
