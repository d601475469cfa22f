//! Sessions: the production pipeline context and isolated what-if clones.
//!
//! Session 0 is the production tree the periodic driver updates. A
//! what-if session deep-clones that tree, substitutes the query window
//! and applies value/state/weight overrides to the clone, so interactive
//! exploration can rerun the identical pipeline without ever touching
//! production data.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::types::{Bot, BotGroup, QueryWindow, SessionId, SessionOverrides};

/// A removed bot retained read-only for inspection, and for resumption if
/// it returns within the group's store window.
#[derive(Debug, Clone)]
pub struct StoredBot {
    pub bot: Bot,
    pub removed_at: DateTime<Utc>,
}

/// Runtime of one bot group inside a session: the (possibly overridden)
/// template plus the live bot population.
///
/// Each bot sits behind its own mutex; that mutex is the per-entity lock
/// every read or mutation of the bot's variables, states and action data
/// must hold. The list itself takes a brief write lock only to append
/// discovered bots or drop removed ones.
pub struct GroupRuntime {
    pub spec: BotGroup,
    bots: RwLock<Vec<Arc<Mutex<Bot>>>>,
    removed: Mutex<Vec<StoredBot>>,
}

impl GroupRuntime {
    pub fn new(spec: BotGroup) -> Self {
        Self {
            spec,
            bots: RwLock::new(Vec::new()),
            removed: Mutex::new(Vec::new()),
        }
    }

    fn from_parts(spec: BotGroup, bots: Vec<Bot>, removed: Vec<StoredBot>) -> Self {
        Self {
            spec,
            bots: RwLock::new(bots.into_iter().map(|b| Arc::new(Mutex::new(b))).collect()),
            removed: Mutex::new(removed),
        }
    }

    /// Handles to the current bot population. Cloned out so callers never
    /// hold the list lock while working a bot.
    pub fn bot_handles(&self) -> Vec<Arc<Mutex<Bot>>> {
        self.bots.read().expect("bot list poisoned").clone()
    }

    pub fn bot_count(&self) -> usize {
        self.bots.read().expect("bot list poisoned").len()
    }

    /// Handle to one bot by name.
    pub fn find_bot(&self, name: &str) -> Option<Arc<Mutex<Bot>>> {
        self.bots
            .read()
            .expect("bot list poisoned")
            .iter()
            .find(|b| b.lock().expect("bot poisoned").name == name)
            .cloned()
    }

    /// Append a bot discovered by the extractor.
    pub fn add_bot(&self, bot: Bot) {
        self.bots
            .write()
            .expect("bot list poisoned")
            .push(Arc::new(Mutex::new(bot)));
    }

    /// Names of the current population, for extraction de-duplication.
    pub fn bot_names(&self) -> Vec<String> {
        self.bot_handles()
            .iter()
            .map(|b| b.lock().expect("bot poisoned").name.clone())
            .collect()
    }

    /// Move bots failing `keep` into the removed store, stamping the
    /// removal time.
    pub fn retain_bots<F: Fn(&Bot) -> bool>(&self, keep: F, now: DateTime<Utc>) {
        let mut bots = self.bots.write().expect("bot list poisoned");
        let mut removed = self.removed.lock().expect("removed store poisoned");
        bots.retain(|handle| {
            let bot = handle.lock().expect("bot poisoned");
            if keep(&bot) {
                true
            } else {
                info!(group = %self.spec.name, bot = %bot.name, "removing bot");
                removed.push(StoredBot {
                    bot: bot.clone(),
                    removed_at: now,
                });
                false
            }
        });
    }

    /// Take a stored bot back out for resumption, if one is present and
    /// still within the store window. Expired entries are dropped as a
    /// side effect.
    pub fn take_stored_bot(&self, name: &str, now: DateTime<Utc>) -> Option<Bot> {
        let mut removed = self.removed.lock().expect("removed store poisoned");
        removed.retain(|stored| {
            (now - stored.removed_at).num_seconds() <= self.spec.bot_remove_store_secs as i64
        });

        if self.spec.refuse_bot_resumption {
            return None;
        }

        let index = removed.iter().position(|stored| stored.bot.name == name)?;
        Some(removed.swap_remove(index).bot)
    }

    /// Read-only copies of the removed store, for inspection.
    pub fn stored_bots(&self) -> Vec<StoredBot> {
        self.removed.lock().expect("removed store poisoned").clone()
    }

    /// Deep copy of this runtime's data: the template and every bot,
    /// cloned under their locks so each copy is internally consistent.
    fn clone_parts(&self) -> (BotGroup, Vec<Bot>, Vec<StoredBot>) {
        let bots = self
            .bot_handles()
            .iter()
            .map(|handle| handle.lock().expect("bot poisoned").clone())
            .collect();
        let removed = self.removed.lock().expect("removed store poisoned").clone();
        (self.spec.clone(), bots, removed)
    }

    /// Plain-data copies of the current bots, each cloned under its lock.
    /// This is the read surface for dashboards: consistent per bot, not
    /// across the whole group.
    pub fn snapshot_bots(&self) -> Vec<Bot> {
        self.bot_handles()
            .iter()
            .map(|handle| handle.lock().expect("bot poisoned").clone())
            .collect()
    }
}

/// One pipeline context: the window its queries cover and its group tree.
pub struct SessionState {
    pub id: SessionId,
    window: Mutex<QueryWindow>,
    last_request: Mutex<DateTime<Utc>>,
    pub groups: Vec<GroupRuntime>,
}

impl SessionState {
    pub fn new(id: SessionId, window: QueryWindow, groups: Vec<GroupRuntime>) -> Self {
        Self {
            id,
            window: Mutex::new(window),
            last_request: Mutex::new(Utc::now()),
            groups,
        }
    }

    pub fn window(&self) -> QueryWindow {
        *self.window.lock().expect("session window poisoned")
    }

    pub fn set_window(&self, window: QueryWindow) {
        *self.window.lock().expect("session window poisoned") = window;
    }

    pub fn touch(&self, now: DateTime<Utc>) {
        *self.last_request.lock().expect("session poisoned") = now;
    }

    pub fn last_request(&self) -> DateTime<Utc> {
        *self.last_request.lock().expect("session poisoned")
    }

    pub fn group(&self, name: &str) -> Option<&GroupRuntime> {
        self.groups.iter().find(|g| g.spec.name == name)
    }
}

/// All live sessions. The production session is created at startup and
/// never pruned; what-if sessions are purged after idling past the
/// timeout.
pub struct SessionPool {
    production: Arc<SessionState>,
    sessions: Mutex<HashMap<u64, Arc<SessionState>>>,
    idle_timeout_secs: u64,
}

impl SessionPool {
    pub fn new(production: Arc<SessionState>, idle_timeout_secs: u64) -> Self {
        Self {
            production,
            sessions: Mutex::new(HashMap::new()),
            idle_timeout_secs,
        }
    }

    pub fn production(&self) -> Arc<SessionState> {
        Arc::clone(&self.production)
    }

    pub fn get(&self, id: SessionId) -> Option<Arc<SessionState>> {
        if id.is_production() {
            return Some(self.production());
        }
        self.sessions
            .lock()
            .expect("session pool poisoned")
            .get(&id.0)
            .cloned()
    }

    /// Create (or replace) a what-if session: clone the production tree,
    /// set the window, apply overrides to the clone before it is shared.
    pub fn create_what_if(
        &self,
        id: SessionId,
        window: QueryWindow,
        overrides: &SessionOverrides,
    ) -> Arc<SessionState> {
        debug_assert!(!id.is_production(), "session 0 is reserved for production");

        let groups: Vec<GroupRuntime> = self
            .production
            .groups
            .iter()
            .map(|runtime| {
                let (mut spec, mut bots, removed) = runtime.clone_parts();
                apply_group_overrides(&mut spec, overrides);
                for bot in &mut bots {
                    apply_bot_overrides(bot, overrides);
                }
                GroupRuntime::from_parts(spec, bots, removed)
            })
            .collect();

        let session = Arc::new(SessionState::new(id, window, groups));
        self.sessions
            .lock()
            .expect("session pool poisoned")
            .insert(id.0, Arc::clone(&session));
        debug!(session = %id, "created what-if session");
        session
    }

    /// Drop what-if sessions idle past the timeout.
    pub fn prune(&self, now: DateTime<Utc>) {
        let mut sessions = self.sessions.lock().expect("session pool poisoned");
        sessions.retain(|_, session| {
            (now - session.last_request()).num_seconds() <= self.idle_timeout_secs as i64
        });
    }
}

/// Apply action and consideration weight overrides to a cloned template.
fn apply_group_overrides(spec: &mut BotGroup, overrides: &SessionOverrides) {
    for group_override in &overrides.groups {
        if group_override.group_name != spec.name {
            continue;
        }
        for action in &mut spec.actions {
            if let Some(weight) = group_override.action_weights.get(&action.name) {
                action.weight = *weight;
            }
            if let Some(considerations) = group_override.consideration_weights.get(&action.name) {
                for consideration in &mut action.considerations {
                    if let Some(weight) = considerations.get(&consideration.name) {
                        consideration.weight = *weight;
                    }
                }
            }
        }
    }
}

/// Re-apply bot overrides across a session's groups. The what-if pipeline
/// calls this after variable resolution, which starts from a cleared
/// variable map and would otherwise clobber the overridden values.
pub fn apply_bot_overrides_to_groups(groups: &[GroupRuntime], overrides: &SessionOverrides) {
    for group in groups {
        for handle in group.bot_handles() {
            let mut bot = handle.lock().expect("bot poisoned");
            apply_bot_overrides(&mut bot, overrides);
        }
    }
}

/// Apply variable and state overrides to a cloned bot.
///
/// State overrides force the target label directly: exploration is
/// allowed to pose "what if the bot were back at Triage.A" without
/// replaying the forward-only rules.
fn apply_bot_overrides(bot: &mut Bot, overrides: &SessionOverrides) {
    for bot_override in &overrides.bots {
        if bot_override.bot_name != bot.name {
            continue;
        }
        for (name, value) in &bot_override.variables {
            bot.variables.insert(name.clone(), *value);
        }
        for target in &bot_override.states {
            if let Some((state_name, _)) = target.split_once('.') {
                let prefix = format!("{state_name}.");
                bot.states.retain(|s| !s.starts_with(&prefix));
                bot.states.push(target.clone());
            }
        }
        bot.states.sort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Action, BotOverride, Consideration, GroupOverride};

    fn production_with_one_bot() -> SessionPool {
        let spec = BotGroup {
            name: "web".to_string(),
            actions: vec![Action {
                name: "restart".to_string(),
                weight: 2.0,
                considerations: vec![Consideration {
                    name: "load".to_string(),
                    weight: 1.0,
                    ..Default::default()
                }],
                ..Default::default()
            }],
            ..Default::default()
        };
        let runtime = GroupRuntime::new(spec);
        let mut bot = Bot::new("web-1", Utc::now());
        bot.variables.insert("cpu".to_string(), 0.5);
        runtime.add_bot(bot);

        let production = Arc::new(SessionState::new(
            SessionId::PRODUCTION,
            QueryWindow::trailing(Utc::now(), 60),
            vec![runtime],
        ));
        SessionPool::new(production, 3600)
    }

    #[test]
    fn what_if_overrides_do_not_touch_production() {
        let pool = production_with_one_bot();

        let overrides = SessionOverrides {
            groups: vec![GroupOverride {
                group_name: "web".to_string(),
                action_weights: [("restart".to_string(), 9.0)].into_iter().collect(),
                consideration_weights: [(
                    "restart".to_string(),
                    [("load".to_string(), 0.5)].into_iter().collect(),
                )]
                .into_iter()
                .collect(),
            }],
            bots: vec![BotOverride {
                bot_name: "web-1".to_string(),
                variables: [("cpu".to_string(), 0.99)].into_iter().collect(),
                states: vec![],
            }],
        };

        let session = pool.create_what_if(
            SessionId(42),
            QueryWindow::trailing(Utc::now() - chrono::Duration::hours(1), 60),
            &overrides,
        );

        // The clone carries the overrides...
        let cloned = session.group("web").unwrap();
        assert_eq!(cloned.spec.actions[0].weight, 9.0);
        assert_eq!(cloned.spec.actions[0].considerations[0].weight, 0.5);
        let cloned_bot = cloned.find_bot("web-1").unwrap();
        assert_eq!(cloned_bot.lock().unwrap().variables["cpu"], 0.99);

        // ...and production is untouched.
        let production = pool.production();
        let original = production.group("web").unwrap();
        assert_eq!(original.spec.actions[0].weight, 2.0);
        assert_eq!(original.spec.actions[0].considerations[0].weight, 1.0);
        let original_bot = original.find_bot("web-1").unwrap();
        assert_eq!(original_bot.lock().unwrap().variables["cpu"], 0.5);
    }

    #[test]
    fn idle_sessions_are_pruned() {
        let pool = production_with_one_bot();
        let session = pool.create_what_if(
            SessionId(7),
            QueryWindow::trailing(Utc::now(), 60),
            &SessionOverrides::default(),
        );

        let now = Utc::now();
        session.touch(now - chrono::Duration::seconds(3601));
        pool.prune(now);
        assert!(pool.get(SessionId(7)).is_none());

        // Production is never pruned.
        assert!(pool.get(SessionId::PRODUCTION).is_some());
    }

    #[test]
    fn removed_bots_resume_within_store_window() {
        let pool = production_with_one_bot();
        let production = pool.production();
        let group = production.group("web").unwrap();
        let now = Utc::now();

        group.retain_bots(|_| false, now);
        assert_eq!(group.bot_count(), 0);

        let resumed = group.take_stored_bot("web-1", now).unwrap();
        assert_eq!(resumed.variables["cpu"], 0.5);
    }

    #[test]
    fn resumption_is_refused_when_configured() {
        let spec = BotGroup {
            name: "web".to_string(),
            refuse_bot_resumption: true,
            ..Default::default()
        };
        let runtime = GroupRuntime::new(spec);
        runtime.add_bot(Bot::new("web-1", Utc::now()));

        let now = Utc::now();
        runtime.retain_bots(|_| false, now);
        assert!(runtime.take_stored_bot("web-1", now).is_none());
        // The record stays stored for inspection even when resumption is
        // refused.
        assert_eq!(runtime.stored_bots().len(), 1);
    }
}
