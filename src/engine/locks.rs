//! Lock timer registry: named, time-bounded mutual-exclusion gates.
//!
//! A timer is blocking while it is active and its timeout has not passed.
//! Group-scoped timers share one slot for the whole group, acting as a
//! global execution lane; bot-scoped timers get a slot per bot. Actions
//! that require several timers form overlapping lanes where only one
//! action executes at a time.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::types::{Action, BotGroup, LockTimerScope};

/// Live state of one timer slot.
#[derive(Debug, Clone)]
pub struct LockTimerState {
    pub is_active: bool,
    pub timeout: DateTime<Utc>,
    /// Bot that last activated this timer, for tracing decisions.
    pub activated_by: String,
}

/// All live timer slots, keyed by scope. Constructor-injected so tests
/// get an isolated registry per case.
#[derive(Default)]
pub struct LockTimerRegistry {
    timers: Mutex<HashMap<String, LockTimerState>>,
}

impl LockTimerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot_key(group: &BotGroup, timer_name: &str, scope: LockTimerScope, bot: &str) -> String {
        match scope {
            LockTimerScope::Group => format!("{}/{}", group.name, timer_name),
            LockTimerScope::Bot => format!("{}/{}/{}", group.name, timer_name, bot),
        }
    }

    /// Whether a timer currently blocks execution. An inactive or expired
    /// slot does not block; expiry is evaluated lazily on read.
    pub fn is_blocking(
        &self,
        group: &BotGroup,
        timer_name: &str,
        bot: &str,
        now: DateTime<Utc>,
    ) -> bool {
        let Ok(def) = group.lock_timer(timer_name) else {
            return false;
        };
        let key = Self::slot_key(group, timer_name, def.scope, bot);

        let timers = self.timers.lock().expect("lock timer registry poisoned");
        match timers.get(&key) {
            Some(state) => state.is_active && now < state.timeout,
            None => false,
        }
    }

    /// Activate a timer for a duration, recording the activating bot.
    pub fn activate(
        &self,
        group: &BotGroup,
        timer_name: &str,
        bot: &str,
        duration_secs: u64,
        now: DateTime<Utc>,
    ) {
        let Ok(def) = group.lock_timer(timer_name) else {
            warn!(
                group = %group.name,
                timer = timer_name,
                "cannot activate unknown lock timer"
            );
            return;
        };
        let key = Self::slot_key(group, timer_name, def.scope, bot);

        let mut timers = self.timers.lock().expect("lock timer registry poisoned");
        timers.insert(
            key,
            LockTimerState {
                is_active: true,
                timeout: now + chrono::Duration::seconds(duration_secs as i64),
                activated_by: bot.to_string(),
            },
        );
    }

    /// Whether every lock timer an action requires is free to be taken.
    /// A required timer that is not defined in the group is a config
    /// mismatch: the action can never run, which is logged rather than
    /// silently allowed.
    pub fn all_available(
        &self,
        action: &Action,
        group: &BotGroup,
        bot: &str,
        now: DateTime<Utc>,
    ) -> bool {
        for timer_name in &action.required_lock_timers {
            if group.lock_timer(timer_name).is_err() {
                warn!(
                    group = %group.name,
                    action = %action.name,
                    timer = %timer_name,
                    "required lock timer is not defined; action will never execute"
                );
                return false;
            }
            if self.is_blocking(group, timer_name, bot, now) {
                return false;
            }
        }
        true
    }

    /// Activate every lock timer the action required, for the command's
    /// configured duration. They all had to be available; now they are all
    /// blocked together.
    pub fn activate_all(
        &self,
        action: &Action,
        group: &BotGroup,
        bot: &str,
        duration_secs: u64,
        now: DateTime<Utc>,
    ) {
        for timer_name in &action.required_lock_timers {
            self.activate(group, timer_name, bot, duration_secs, now);
        }
    }
}
