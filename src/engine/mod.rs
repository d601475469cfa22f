//! The decision engine: injected services, the periodic driver, and the
//! what-if entry point.
//!
//! One driver task runs the full update pass per group on a fixed
//! interval: extraction, variable resolution, scoring, selection and
//! execution. Request handlers read bot snapshots and create what-if
//! sessions concurrently; safety comes from the per-bot locks, the cache
//! and timer registries' own mutexes, and never from a global pass lock.

pub mod cache;
pub mod extract;
pub mod locks;
pub mod scoring;
pub mod select;
pub mod session;
pub mod states;
pub mod variables;

use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::curves::CurveTable;
use crate::executor::CommandExecutor;
use crate::export::{variable_labels, MetricExporter};
use crate::source::MetricSource;
use crate::types::{
    Bot, BotGroup, CommandResult, QueryWindow, SessionId, SessionOverrides, SiteConfig,
};
use cache::QueryCache;
use locks::LockTimerRegistry;
use session::{GroupRuntime, SessionPool, SessionState};

/// Parameters of a what-if run: a session, its historical window, and the
/// overrides to explore.
#[derive(Debug, Clone)]
pub struct WhatIfControl {
    pub session_id: SessionId,
    pub window: QueryWindow,
    pub overrides: SessionOverrides,
}

/// Scored snapshot of one group, for display.
#[derive(Debug, Clone)]
pub struct GroupReport {
    pub group: String,
    pub bots: Vec<Bot>,
}

/// Result of a what-if run: the scored clone plus any queries whose
/// historical data was unavailable. Stale or missing data is reported,
/// never silently substituted.
#[derive(Debug, Clone)]
pub struct WhatIfReport {
    pub session_id: SessionId,
    pub query_errors: Vec<String>,
    pub groups: Vec<GroupReport>,
}

/// The engine owns every registry and collaborator seam. All of them are
/// constructor-injected with process lifetime, so tests build isolated
/// engines per case.
pub struct Engine {
    app: AppConfig,
    site: ArcSwap<SiteConfig>,
    curves: CurveTable,
    cache: QueryCache,
    timers: LockTimerRegistry,
    sessions: SessionPool,
    source: Arc<dyn MetricSource>,
    executor: Arc<dyn CommandExecutor>,
    exporter: Arc<dyn MetricExporter>,
}

impl Engine {
    pub fn new(
        app: AppConfig,
        site: SiteConfig,
        groups: Vec<BotGroup>,
        curves: CurveTable,
        source: Arc<dyn MetricSource>,
        executor: Arc<dyn CommandExecutor>,
        exporter: Arc<dyn MetricExporter>,
    ) -> Self {
        let now = Utc::now();
        let runtimes: Vec<GroupRuntime> = groups.into_iter().map(GroupRuntime::new).collect();
        let production = Arc::new(SessionState::new(
            SessionId::PRODUCTION,
            QueryWindow::trailing(now, 60),
            runtimes,
        ));
        let cache = QueryCache::new(app.query_lock_timeout_secs);
        let sessions = SessionPool::new(production, app.session_idle_timeout_secs);

        Self {
            app,
            site: ArcSwap::from_pointee(site),
            curves,
            cache,
            timers: LockTimerRegistry::new(),
            sessions,
            source,
            executor,
            exporter,
        }
    }

    /// Swap in a reloaded site config. Query-server changes take effect on
    /// the next refresh; group definitions require a restart.
    pub fn reload_site(&self, site: SiteConfig) {
        info!(site = %site.name, "site config reloaded");
        self.site.store(Arc::new(site));
    }

    pub fn cache(&self) -> &QueryCache {
        &self.cache
    }

    pub fn timers(&self) -> &LockTimerRegistry {
        &self.timers
    }

    pub fn sessions(&self) -> &SessionPool {
        &self.sessions
    }

    /// Run the driver until cancelled. The cancellation token is observed
    /// at cycle boundaries; in-flight queries finish on their own.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!("engine driver starting");

        while !cancel.is_cancelled() {
            let now = Utc::now();
            self.tick(now).await;

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(std::time::Duration::from_secs(
                    self.app.server_loop_delay_secs,
                )) => {}
            }
        }

        info!("engine driver stopping");
    }

    /// One driver cycle: refresh due queries in the background, then run
    /// the update pass across all production groups.
    pub async fn tick(self: &Arc<Self>, now: DateTime<Utc>) {
        self.refresh_due_queries(now);

        let production = self.sessions.production();
        let site_frozen = self.site.load().freeze_actions;
        for group in &production.groups {
            self.update_group(&production, group, !site_frozen, now).await;
        }

        self.sessions.prune(now);
    }

    /// Launch a background refresh for every production query that is
    /// missing or past its interval. The advisory lock keeps concurrent
    /// refreshes of the same query from stacking up; a held lock means
    /// skip this tick and retry next cycle.
    fn refresh_due_queries(self: &Arc<Self>, now: DateTime<Utc>) {
        let production = self.sessions.production();

        for group in &production.groups {
            for query in &group.spec.queries {
                let fresh = self
                    .cache
                    .fetch(SessionId::PRODUCTION, query, now, true, None)
                    .is_ok();
                if fresh {
                    continue;
                }
                if !self
                    .cache
                    .try_acquire_refresh_lock(SessionId::PRODUCTION, query, now)
                {
                    continue;
                }

                let engine = Arc::clone(self);
                let query = query.clone();
                tokio::spawn(async move {
                    engine
                        .background_refresh(SessionId::PRODUCTION, query, now)
                        .await;
                });
            }
        }
    }

    /// Perform one query against the metric source and store the result.
    /// A slow or failing server delays only this query's refresh; the
    /// cached data everyone else reads is untouched.
    async fn background_refresh(
        &self,
        session: SessionId,
        query: crate::types::GroupQuery,
        now: DateTime<Utc>,
    ) {
        let site = self.site.load();
        let server = match site.query_server(&query.query_server) {
            Ok(server) => server.clone(),
            Err(err) => {
                warn!(query = %query.name, %err, "cannot refresh query");
                self.cache.release_refresh_lock(session, &query);
                return;
            }
        };

        let window = QueryWindow::trailing(now, server.default_data_duration_secs);
        match self
            .source
            .query(&server, query.kind, &query.query, window.start, window.duration_secs)
            .await
        {
            Ok(result) => {
                self.cache
                    .store(session, &query, window, now, Utc::now(), result);
                debug!(query = %query.name, "query refreshed");
            }
            Err(err) => {
                warn!(query = %query.name, %err, "query refresh failed");
            }
        }

        self.cache.release_refresh_lock(session, &query);
    }

    /// The full update pass for one group: extraction, resolution,
    /// liveness, scoring, availability, selection and execution.
    async fn update_group(
        &self,
        session: &SessionState,
        group: &GroupRuntime,
        execute: bool,
        now: DateTime<Utc>,
    ) {
        self.extract_group_bots(session.id, group, now);

        variables::clear_variables(group);
        variables::resolve_query_variables(group, &self.cache, session.id, false, now);
        variables::resolve_synthetic_variables(group);
        self.export_marked_variables(group);

        self.update_bot_liveness(group, now);
        variables::mark_invalid_bots(group);

        scoring::score_group(group, &self.curves);
        select::update_availability(group, now);

        if execute {
            let executed = select::select_and_execute(
                group,
                &self.timers,
                &self.executor,
                &self.exporter,
                now,
            )
            .await;

            // Executed commands change states, and with them which
            // actions score and gate; rescore so readers never see the
            // pre-execution availability.
            if executed {
                scoring::score_group(group, &self.curves);
                select::update_availability(group, now);
            }
        }

        for handle in group.bot_handles() {
            let mut bot = handle.lock().expect("bot poisoned");
            bot.prune_history(now, group.spec.command_history_secs);
        }
    }

    /// Create bots from the extractor query's cached result.
    fn extract_group_bots(&self, session: SessionId, group: &GroupRuntime, now: DateTime<Utc>) {
        let extractor = &group.spec.bot_extractor;
        let query = match group.spec.query(&extractor.query_name) {
            Ok(query) => query,
            Err(err) => {
                warn!(group = %group.spec.name, %err, "extractor query not defined");
                return;
            }
        };

        let fetched = match self.cache.fetch(session, query, now, false, None) {
            Ok(fetched) => fetched,
            Err(err) => {
                debug!(group = %group.spec.name, %err, "extractor query has no data yet");
                return;
            }
        };

        let names = extract::extract_bot_names(&fetched.result, &extractor.key);
        extract::sync_bots(group, &names, now);
    }

    /// Mark bots stale past the stale timeout and remove them past the
    /// removal timeout. Removal is driven purely by these timeouts, never
    /// by extraction absence.
    fn update_bot_liveness(&self, group: &GroupRuntime, now: DateTime<Utc>) {
        let stale_secs = group.spec.bot_timeout_stale_secs as i64;
        let remove_secs = group.spec.bot_timeout_remove_secs as i64;

        for handle in group.bot_handles() {
            let mut bot = handle.lock().expect("bot poisoned");
            let silent_secs = (now - bot.last_variable_update).num_seconds();
            let was_stale = bot.is_stale;
            bot.is_stale = silent_secs > stale_secs;
            if bot.is_stale && !was_stale {
                warn!(
                    group = %group.spec.name,
                    bot = %bot.name,
                    silent_secs,
                    "bot is stale"
                );
            }
        }

        group.retain_bots(
            |bot| (now - bot.last_variable_update).num_seconds() <= remove_secs,
            now,
        );
    }

    /// Publish variables marked for export, for every bot that has them.
    fn export_marked_variables(&self, group: &GroupRuntime) {
        for variable in &group.spec.variables {
            if !variable.export {
                continue;
            }
            for handle in group.bot_handles() {
                let bot = handle.lock().expect("bot poisoned");
                let Some(value) = bot.variables.get(&variable.name) else {
                    continue;
                };
                self.exporter.set_gauge(
                    "warden_variable",
                    *value,
                    "A bot variable marked for export, usually synthesized",
                    &variable_labels(&group.spec, &bot, &variable.name),
                );
            }
        }
    }

    /// Run the identical pipeline against an isolated clone with a
    /// substituted window and overrides. Never mutates production, never
    /// executes commands, and reports rather than hides unavailable
    /// historical data.
    pub async fn run_what_if(&self, control: WhatIfControl) -> WhatIfReport {
        let session =
            self.sessions
                .create_what_if(control.session_id, control.window, &control.overrides);
        session.touch(Utc::now());

        let mut query_errors = Vec::new();

        // Make sure every query has data for the requested window,
        // querying the source directly for anything missing.
        for group in &session.groups {
            for query in &group.spec.queries {
                let now = Utc::now();
                if self
                    .cache
                    .fetch(session.id, query, now, true, Some(&control.window))
                    .is_ok()
                {
                    continue;
                }

                let site = self.site.load();
                let server = match site.query_server(&query.query_server) {
                    Ok(server) => server.clone(),
                    Err(err) => {
                        query_errors.push(err.to_string());
                        continue;
                    }
                };

                match self
                    .source
                    .query(
                        &server,
                        query.kind,
                        &query.query,
                        control.window.start,
                        control.window.duration_secs,
                    )
                    .await
                {
                    Ok(result) => {
                        self.cache.store(
                            session.id,
                            query,
                            control.window,
                            now,
                            Utc::now(),
                            result,
                        );
                    }
                    Err(err) => {
                        query_errors.push(format!("query {}: {err}", query.name));
                    }
                }
            }
        }

        let now = Utc::now();
        for group in &session.groups {
            self.extract_group_bots(session.id, group, now);
            variables::clear_variables(group);
            variables::resolve_query_variables(group, &self.cache, session.id, true, now);
            variables::resolve_synthetic_variables(group);
        }

        // Resolution starts from a cleared map; put the explored values
        // back on top before the validity check and scoring, so an
        // overridden variable satisfies the declared set.
        session::apply_bot_overrides_to_groups(&session.groups, &control.overrides);

        for group in &session.groups {
            variables::mark_invalid_bots(group);
            scoring::score_group(group, &self.curves);
            select::update_availability(group, now);
        }

        WhatIfReport {
            session_id: session.id,
            query_errors,
            groups: session
                .groups
                .iter()
                .map(|group| GroupReport {
                    group: group.spec.name.clone(),
                    bots: group.snapshot_bots(),
                })
                .collect(),
        }
    }

    /// Scored snapshot of the production tree, each bot cloned under its
    /// own lock.
    pub fn snapshot(&self) -> Vec<GroupReport> {
        self.sessions
            .production()
            .groups
            .iter()
            .map(|group| GroupReport {
                group: group.spec.name.clone(),
                bots: group.snapshot_bots(),
            })
            .collect()
    }

    /// All command results across the production tree, most recent first,
    /// bounded by `count` when non-zero.
    pub fn command_history(&self, count: usize) -> Vec<CommandResult> {
        let mut history: Vec<CommandResult> = self
            .sessions
            .production()
            .groups
            .iter()
            .flat_map(|group| {
                group
                    .snapshot_bots()
                    .into_iter()
                    .flat_map(|bot| bot.command_history)
            })
            .collect();

        history.sort_by(|a, b| b.started.cmp(&a.started));
        if count > 0 && history.len() > count {
            history.truncate(count);
        }
        history
    }
}
