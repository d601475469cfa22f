//! Entity extraction: turning a query result into the bot population.
//!
//! The extractor reads the group's extractor query from the cache and
//! collects the distinct values of the identity key across the result
//! rows. Unknown names become new bots; known names are left completely
//! untouched, so extraction can never clobber accumulated state. Bots
//! that stop appearing are removed by the staleness timeouts, never by
//! extraction absence.

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use super::session::GroupRuntime;
use super::states;
use crate::source::QueryResult;

/// Distinct identity-key values across the result rows, in first-seen
/// order. Rows without the key are skipped.
pub fn extract_bot_names(result: &QueryResult, key: &str) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for row in &result.rows {
        let Some(name) = row.labels.get(key) else {
            continue;
        };
        if name.is_empty() || names.iter().any(|n| n == name) {
            continue;
        }
        names.push(name.clone());
    }
    names
}

/// Bring the group's population in sync with the extracted names.
///
/// New names become bots initialized with every declared state at its
/// first label. A name that was recently removed and is still in the
/// stored window resumes its old record instead, unless the group refuses
/// resumption.
pub fn sync_bots(group: &GroupRuntime, names: &[String], now: DateTime<Utc>) {
    let known = group.bot_names();

    for name in names {
        if known.iter().any(|k| k == name) {
            continue;
        }

        if let Some(mut resumed) = group.take_stored_bot(name, now) {
            info!(group = %group.spec.name, bot = %name, "resuming stored bot");
            // Resumption keeps history and action data but starts fresh on
            // liveness, so the bot is not immediately stale again.
            resumed.is_stale = false;
            resumed.is_invalid = false;
            resumed.invalid_reason.clear();
            resumed.last_variable_update = now;
            group.add_bot(resumed);
            continue;
        }

        debug!(group = %group.spec.name, bot = %name, "creating bot");
        let mut bot = crate::types::Bot::new(name.clone(), now);
        states::initialize_states(&group.spec, &mut bot);
        group.add_bot(bot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::QueryRow;
    use crate::types::{BotGroup, StateDef};
    use std::collections::HashMap;

    fn result_with_instances(instances: &[&str]) -> QueryResult {
        QueryResult {
            server: "prom".to_string(),
            query: "up".to_string(),
            rows: instances
                .iter()
                .map(|name| QueryRow {
                    labels: HashMap::from([("instance".to_string(), name.to_string())]),
                    samples: vec![(0.0, "1".to_string())],
                })
                .collect(),
        }
    }

    #[test]
    fn extraction_deduplicates_and_skips_missing_keys() {
        let mut result = result_with_instances(&["web-1", "web-2", "web-1"]);
        result.rows.push(QueryRow::default());

        let names = extract_bot_names(&result, "instance");
        assert_eq!(names, vec!["web-1".to_string(), "web-2".to_string()]);
    }

    #[test]
    fn sync_creates_new_bots_with_initial_states() {
        let group = GroupRuntime::new(BotGroup {
            name: "web".to_string(),
            states: vec![StateDef {
                name: "Triage".to_string(),
                info: String::new(),
                labels: vec!["A".to_string(), "B".to_string()],
            }],
            ..Default::default()
        });

        sync_bots(&group, &["web-1".to_string()], Utc::now());

        let bot = group.find_bot("web-1").unwrap();
        let bot = bot.lock().unwrap();
        assert!(bot.has_state("Triage.A"));
    }

    #[test]
    fn sync_never_overwrites_existing_bots() {
        let group = GroupRuntime::new(BotGroup {
            name: "web".to_string(),
            ..Default::default()
        });
        let now = Utc::now();
        sync_bots(&group, &["web-1".to_string()], now);

        {
            let bot = group.find_bot("web-1").unwrap();
            bot.lock().unwrap().variables.insert("cpu".to_string(), 0.7);
        }

        // A second extraction pass sees the same name and leaves the bot
        // alone.
        sync_bots(&group, &["web-1".to_string()], now);
        assert_eq!(group.bot_count(), 1);
        let bot = group.find_bot("web-1").unwrap();
        assert_eq!(bot.lock().unwrap().variables["cpu"], 0.7);
    }
}
