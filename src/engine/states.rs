//! Forward-only per-bot state machine.
//!
//! Each declared state has an ordered label sequence, and a bot carries
//! one active `Name.Label` entry per state. The label can move to a
//! strictly later label (skipping is allowed), advance one step, or reset
//! to the first label. Moving to an earlier-but-not-first label is
//! invalid and rejected, keeping remediation flows monotonic until a
//! reset starts them over.

use thiserror::Error;

use crate::types::{Bot, BotGroup, LookupError};

#[derive(Debug, Clone, Error)]
pub enum StateError {
    #[error(transparent)]
    Lookup(#[from] LookupError),
    #[error("bot {bot} has no active label for state {state}")]
    MissingActive { bot: String, state: String },
    #[error(
        "cannot move state backwards: target {target} (index {target_index}) is earlier than \
         current {current} (index {current_index})"
    )]
    Backward {
        target: String,
        target_index: usize,
        current: String,
        current_index: usize,
    },
    #[error("state entry is not in Name.Label form: {0}")]
    Malformed(String),
}

/// Compose the `Name.Label` entry stored on bots.
pub fn state_key(state_name: &str, label: &str) -> String {
    format!("{state_name}.{label}")
}

/// Initialize every declared state to its first label. New bots start
/// here; the previous entries are discarded so they cannot accumulate.
pub fn initialize_states(group: &BotGroup, bot: &mut Bot) {
    bot.states.clear();
    for state in &group.states {
        if let Some(first) = state.labels.first() {
            bot.states.push(state_key(&state.name, first));
        }
    }
    bot.states.sort();
}

/// The index of a `Name.Label` entry within its state's label sequence.
pub fn state_index(group: &BotGroup, entry: &str) -> Result<usize, StateError> {
    let (state_name, label) = entry
        .split_once('.')
        .ok_or_else(|| StateError::Malformed(entry.to_string()))?;
    let state = group.state(state_name)?;
    state
        .labels
        .iter()
        .position(|l| l == label)
        .ok_or_else(|| {
            LookupError::State {
                group: group.name.clone(),
                name: entry.to_string(),
            }
            .into()
        })
}

/// The bot's current `Name.Label` entry and index for one state.
pub fn current_state(
    group: &BotGroup,
    bot: &Bot,
    state_name: &str,
) -> Result<(String, usize), StateError> {
    let prefix = format!("{state_name}.");
    for entry in &bot.states {
        if entry.starts_with(&prefix) {
            let index = state_index(group, entry)?;
            return Ok((entry.clone(), index));
        }
    }
    Err(StateError::MissingActive {
        bot: bot.name.clone(),
        state: state_name.to_string(),
    })
}

/// Apply a command's state targets.
///
/// A `Name.Label` target jumps forward to that label, rejecting anything
/// earlier than the current label. A bare state name advances one label
/// and saturates at the end; staying at the final label is not an error,
/// the state simply waits there until reset.
pub fn set_states(group: &BotGroup, bot: &mut Bot, targets: &[String]) -> Result<(), StateError> {
    for target in targets {
        if let Some((state_name, _label)) = target.split_once('.') {
            let (current, current_index) = current_state(group, bot, state_name)?;
            let target_index = state_index(group, target)?;
            if target_index < current_index {
                return Err(StateError::Backward {
                    target: target.clone(),
                    target_index,
                    current,
                    current_index,
                });
            }
            bot.states.retain(|s| s != &current);
            bot.states.push(target.clone());
        } else {
            let state = group.state(target)?;
            let (current, current_index) = current_state(group, bot, target)?;
            let last_index = state.labels.len() - 1;
            if current_index < last_index {
                let next = state_key(&state.name, &state.labels[current_index + 1]);
                bot.states.retain(|s| s != &current);
                bot.states.push(next);
            }
        }
    }

    bot.states.sort();
    Ok(())
}

/// Reset one state to its first label. This is how flows start over: a
/// resolution-detecting action resets the investigation sequence.
pub fn reset_state(group: &BotGroup, bot: &mut Bot, state_name: &str) -> Result<(), StateError> {
    let state = group.state(state_name)?;
    let (current, _) = current_state(group, bot, state_name)?;

    bot.states.retain(|s| s != &current);
    if let Some(first) = state.labels.first() {
        bot.states.push(state_key(&state.name, first));
    }
    bot.states.sort();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StateDef;
    use chrono::Utc;

    fn group() -> BotGroup {
        BotGroup {
            name: "web".to_string(),
            states: vec![
                StateDef {
                    name: "Triage".to_string(),
                    info: String::new(),
                    labels: vec!["A".to_string(), "B".to_string(), "C".to_string()],
                },
                StateDef {
                    name: "Escalate".to_string(),
                    info: String::new(),
                    labels: vec!["No".to_string(), "Yes".to_string()],
                },
            ],
            ..Default::default()
        }
    }

    fn bot(group: &BotGroup) -> Bot {
        let mut bot = Bot::new("web-1", Utc::now());
        initialize_states(group, &mut bot);
        bot
    }

    #[test]
    fn new_bots_start_every_state_at_first_label() {
        let g = group();
        let b = bot(&g);
        assert!(b.has_state("Triage.A"));
        assert!(b.has_state("Escalate.No"));
        assert_eq!(b.states.len(), 2);
    }

    #[test]
    fn set_by_target_skips_forward() {
        let g = group();
        let mut b = bot(&g);
        set_states(&g, &mut b, &["Triage.C".to_string()]).unwrap();
        assert!(b.has_state("Triage.C"));
        assert!(!b.has_state("Triage.A"));
    }

    #[test]
    fn moving_backwards_is_rejected() {
        let g = group();
        let mut b = bot(&g);
        set_states(&g, &mut b, &["Triage.B".to_string()]).unwrap();

        let err = set_states(&g, &mut b, &["Triage.A".to_string()]).unwrap_err();
        assert!(matches!(err, StateError::Backward { .. }));
        // The failed transition left the current state untouched.
        assert!(b.has_state("Triage.B"));
    }

    #[test]
    fn advance_moves_one_label_and_saturates() {
        let g = group();
        let mut b = bot(&g);

        set_states(&g, &mut b, &["Triage".to_string()]).unwrap();
        assert!(b.has_state("Triage.B"));

        set_states(&g, &mut b, &["Triage".to_string()]).unwrap();
        assert!(b.has_state("Triage.C"));

        // At the end: stays, without error, until reset.
        set_states(&g, &mut b, &["Triage".to_string()]).unwrap();
        assert!(b.has_state("Triage.C"));
        assert_eq!(b.states.len(), 2);
    }

    #[test]
    fn reset_returns_to_first_label_from_anywhere() {
        let g = group();
        let mut b = bot(&g);
        set_states(&g, &mut b, &["Triage.C".to_string()]).unwrap();

        reset_state(&g, &mut b, "Triage").unwrap();
        assert!(b.has_state("Triage.A"));
        assert_eq!(b.states.len(), 2);
    }

    #[test]
    fn unknown_state_is_a_lookup_error() {
        let g = group();
        let mut b = bot(&g);
        let err = set_states(&g, &mut b, &["Nope.A".to_string()]).unwrap_err();
        assert!(matches!(err, StateError::MissingActive { .. } | StateError::Lookup(_)));
    }

    #[test]
    fn setting_current_label_again_is_allowed() {
        let g = group();
        let mut b = bot(&g);
        set_states(&g, &mut b, &["Triage.B".to_string()]).unwrap();
        // Equal index is not backwards.
        set_states(&g, &mut b, &["Triage.B".to_string()]).unwrap();
        assert!(b.has_state("Triage.B"));
        assert_eq!(b.states.len(), 2);
    }
}
