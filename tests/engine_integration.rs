//! End-to-end engine tests.
//!
//! Exercises the full pipeline (extraction -> resolution -> scoring ->
//! availability -> execution) through the public `Engine` surface with an
//! in-memory metric source, pinning the spec-level properties: the scored
//! example flow, threshold semantics, invalid-bot exclusion, staleness
//! propagation and what-if isolation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use warden::config::AppConfig;
use warden::curves::{Curve, CurveTable};
use warden::engine::WhatIfControl;
use warden::executor::NoopExecutor;
use warden::export::NoopExporter;
use warden::source::{MetricSource, QueryResult, QueryRow, SourceError};
use warden::types::{
    Action, BotExtractor, BotGroup, BotOverride, Consideration, GroupQuery, QueryServer,
    QueryWindow, SessionId, SessionOverrides, SiteConfig, VariableDef,
};
use warden::Engine;

/// Metric source serving canned rows per query text, with a failure
/// switch to simulate an unreachable server.
struct InMemorySource {
    responses: Mutex<HashMap<String, Vec<QueryRow>>>,
    fail: AtomicBool,
}

impl InMemorySource {
    fn new() -> Self {
        Self {
            responses: Mutex::new(HashMap::new()),
            fail: AtomicBool::new(false),
        }
    }

    fn set_rows(&self, query: &str, rows: Vec<QueryRow>) {
        self.responses
            .lock()
            .unwrap()
            .insert(query.to_string(), rows);
    }

    fn set_failing(&self, failing: bool) {
        self.fail.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl MetricSource for InMemorySource {
    async fn query(
        &self,
        server: &QueryServer,
        _kind: warden::types::QueryKind,
        query: &str,
        _start: DateTime<Utc>,
        _duration_secs: u64,
    ) -> Result<QueryResult, SourceError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(SourceError::BadStatus {
                status: "unreachable".to_string(),
            });
        }
        let rows = self
            .responses
            .lock()
            .unwrap()
            .get(query)
            .cloned()
            .unwrap_or_default();
        Ok(QueryResult {
            server: server.name.clone(),
            query: query.to_string(),
            rows,
        })
    }
}

fn row(pairs: &[(&str, &str)], value: &str) -> QueryRow {
    QueryRow {
        labels: pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        samples: vec![(0.0, value.to_string())],
    }
}

fn identity_curves() -> CurveTable {
    let mut table = CurveTable::new();
    table.insert(Curve {
        name: "linear".to_string(),
        values: (0..=100).map(|i| i as f64 * 0.01).collect(),
    });
    table
}

fn site() -> SiteConfig {
    SiteConfig {
        name: "test-site".to_string(),
        query_servers: vec![QueryServer {
            name: "prom".to_string(),
            host: "localhost".to_string(),
            port: 9090,
            default_data_duration_secs: 60,
            ..Default::default()
        }],
        ..Default::default()
    }
}

/// One group: bots extracted from the `up` query, a `cpu` variable keyed
/// by instance, and a restart action scoring `cpu` through an identity
/// curve with action weight 2.0.
fn web_group(weight_threshold: f64) -> BotGroup {
    BotGroup {
        name: "web".to_string(),
        bot_extractor: BotExtractor {
            query_name: "up".to_string(),
            key: "instance".to_string(),
        },
        bot_timeout_stale_secs: 60,
        bot_timeout_remove_secs: 300,
        bot_remove_store_secs: 3600,
        command_history_secs: 86400,
        queries: vec![GroupQuery {
            query_server: "prom".to_string(),
            name: "up".to_string(),
            query: "up".to_string(),
            interval_secs: 30,
            ..Default::default()
        }],
        variables: vec![VariableDef {
            name: "cpu".to_string(),
            query_name: "up".to_string(),
            bot_key: "instance".to_string(),
            ..Default::default()
        }],
        actions: vec![Action {
            name: "restart".to_string(),
            is_launched: true,
            weight: 2.0,
            weight_threshold,
            considerations: vec![Consideration {
                name: "load".to_string(),
                weight: 1.0,
                curve: "linear".to_string(),
                range_start: 0.0,
                range_end: 1.0,
                evaluate: "cpu".to_string(),
            }],
            ..Default::default()
        }],
        ..Default::default()
    }
}

fn build_engine(group: BotGroup, source: Arc<InMemorySource>) -> Arc<Engine> {
    let app = AppConfig {
        site_config_path: String::new(),
        curve_dir: String::new(),
        server_loop_delay_secs: 1,
        query_lock_timeout_secs: 60,
        session_idle_timeout_secs: 3600,
        session_window_minutes_default: 15,
    };
    Arc::new(Engine::new(
        app,
        site(),
        vec![group],
        identity_curves(),
        source,
        Arc::new(NoopExecutor),
        Arc::new(NoopExporter),
    ))
}

/// Store fresh rows for the `up` query straight into the engine cache so
/// a tick runs against deterministic data with no background refresh.
fn prime_cache(engine: &Engine, group: &BotGroup, rows: Vec<QueryRow>, now: DateTime<Utc>) {
    engine.cache().store(
        SessionId::PRODUCTION,
        &group.queries[0],
        QueryWindow::trailing(now, 60),
        now,
        now,
        QueryResult {
            server: "prom".to_string(),
            query: "up".to_string(),
            rows,
        },
    );
}

#[tokio::test]
async fn scores_flow_end_to_end_and_threshold_compares_post_weight() {
    // cpu 0.9 through an identity curve, consideration weight 1.0, action
    // weight 2.0: fixup(0.9, n=1) = 0.9, final = 1.8. The 1.0 threshold
    // compares against the post-weight 1.8, so the action is available.
    let group = web_group(1.0);
    let source = Arc::new(InMemorySource::new());
    let engine = build_engine(group.clone(), Arc::clone(&source));
    let now = Utc::now();

    prime_cache(&engine, &group, vec![row(&[("instance", "web-1")], "0.9")], now);
    engine.tick(now).await;

    let snapshot = engine.snapshot();
    assert_eq!(snapshot.len(), 1);
    let bots = &snapshot[0].bots;
    assert_eq!(bots.len(), 1);
    assert_eq!(bots[0].name, "web-1");
    assert_eq!(bots[0].variables["cpu"], 0.9);

    let data = &bots[0].action_data["restart"];
    assert!((data.final_score - 1.8).abs() < 1e-9);
    assert!(data.is_available);

    // Available, above the group threshold, no gates in the way: the
    // action executed and left a history record.
    let history = engine.command_history(0);
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].action, "restart");
    assert!((history[0].score - 1.8).abs() < 1e-9);
}

#[tokio::test]
async fn post_weight_score_under_threshold_is_not_available() {
    // Same flow with threshold 2.0: 1.8 < 2.0, never available, never
    // executed.
    let group = web_group(2.0);
    let source = Arc::new(InMemorySource::new());
    let engine = build_engine(group.clone(), Arc::clone(&source));
    let now = Utc::now();

    prime_cache(&engine, &group, vec![row(&[("instance", "web-1")], "0.9")], now);
    engine.tick(now).await;

    let snapshot = engine.snapshot();
    let data = &snapshot[0].bots[0].action_data["restart"];
    assert!((data.final_score - 1.8).abs() < 1e-9);
    assert!(!data.is_available);
    assert!(data.available_start.is_none());
    assert!(engine.command_history(0).is_empty());
}

#[tokio::test]
async fn bot_missing_a_declared_variable_is_invalid_and_excluded() {
    let mut group = web_group(0.0);
    group.variables.push(VariableDef {
        name: "memory".to_string(),
        query_name: "up".to_string(),
        bot_key: "instance".to_string(),
        query_key: "kind".to_string(),
        query_key_value: "memory".to_string(),
        ..Default::default()
    });
    let source = Arc::new(InMemorySource::new());
    let engine = build_engine(group.clone(), Arc::clone(&source));
    let now = Utc::now();

    // Only cpu rows arrive; the memory variable never binds.
    prime_cache(&engine, &group, vec![row(&[("instance", "web-1")], "0.9")], now);
    engine.tick(now).await;

    let snapshot = engine.snapshot();
    let bot = &snapshot[0].bots[0];
    assert!(bot.is_invalid);
    assert!(bot.invalid_reason.contains("memory"));

    // Scoring data exists and would qualify, but the invalid bot is
    // excluded from execution.
    assert!(bot.action_data["restart"].final_score > 0.0);
    assert!(engine.command_history(0).is_empty());
}

#[tokio::test]
async fn stale_bots_are_flagged_then_removed() {
    let group = web_group(0.0);
    let source = Arc::new(InMemorySource::new());
    let engine = build_engine(group.clone(), Arc::clone(&source));
    let t0 = Utc::now();

    prime_cache(&engine, &group, vec![row(&[("instance", "web-1")], "0.9")], t0);
    engine.tick(t0).await;
    assert!(!engine.snapshot()[0].bots[0].is_stale);

    // The metric source goes dark: the cache entry expires and binding
    // from the expired result no longer counts as a liveness update.
    source.set_failing(true);

    let t1 = t0 + Duration::seconds(61);
    engine.tick(t1).await;
    let bot = &engine.snapshot()[0].bots[0];
    assert!(bot.is_stale);
    assert!(bot.is_invalid);
    assert!(engine.command_history(0).is_empty());

    // Past the removal timeout the bot is gone from the population.
    let t2 = t0 + Duration::seconds(301);
    engine.tick(t2).await;
    assert!(engine.snapshot()[0].bots.is_empty());
}

#[tokio::test]
async fn what_if_session_is_isolated_from_production() {
    let group = web_group(1.0);
    let source = Arc::new(InMemorySource::new());
    source.set_rows("up", vec![row(&[("instance", "web-1")], "0.9")]);
    let engine = build_engine(group.clone(), Arc::clone(&source));
    let now = Utc::now();

    prime_cache(&engine, &group, vec![row(&[("instance", "web-1")], "0.9")], now);
    engine.tick(now).await;

    let report = engine
        .run_what_if(WhatIfControl {
            session_id: SessionId(42),
            window: QueryWindow::trailing(now - Duration::hours(2), 60),
            overrides: SessionOverrides {
                groups: vec![],
                bots: vec![BotOverride {
                    bot_name: "web-1".to_string(),
                    variables: [("cpu".to_string(), 0.2)].into_iter().collect(),
                    states: vec![],
                }],
            },
        })
        .await;

    assert!(report.query_errors.is_empty());
    let what_if_bot = &report.groups[0].bots[0];
    // Overridden cpu 0.2 -> final 2.0 * 0.2 = 0.4, under the threshold.
    assert_eq!(what_if_bot.variables["cpu"], 0.2);
    assert!((what_if_bot.action_data["restart"].final_score - 0.4).abs() < 1e-9);
    assert!(!what_if_bot.action_data["restart"].is_available);

    // Production is untouched by the exploration.
    let production = engine.snapshot();
    let bot = &production[0].bots[0];
    assert_eq!(bot.variables["cpu"], 0.9);
    assert!((bot.action_data["restart"].final_score - 1.8).abs() < 1e-9);
}

#[tokio::test]
async fn what_if_reports_unavailable_historical_data() {
    let group = web_group(1.0);
    let source = Arc::new(InMemorySource::new());
    let engine = build_engine(group.clone(), Arc::clone(&source));
    let now = Utc::now();

    prime_cache(&engine, &group, vec![row(&[("instance", "web-1")], "0.9")], now);
    engine.tick(now).await;

    // The source cannot serve the historical window.
    source.set_failing(true);

    let report = engine
        .run_what_if(WhatIfControl {
            session_id: SessionId(7),
            window: QueryWindow::trailing(now - Duration::hours(2), 60),
            overrides: SessionOverrides::default(),
        })
        .await;

    // The caller is told explicitly instead of silently reading the
    // production-window value.
    assert!(!report.query_errors.is_empty());
    let bot = &report.groups[0].bots[0];
    assert!(bot.variables.get("cpu").is_none());
    assert!(bot.is_invalid);
}

#[tokio::test]
async fn frozen_group_scores_but_never_executes() {
    let mut group = web_group(0.0);
    group.freeze_actions = true;
    let source = Arc::new(InMemorySource::new());
    let engine = build_engine(group.clone(), Arc::clone(&source));
    let now = Utc::now();

    prime_cache(&engine, &group, vec![row(&[("instance", "web-1")], "0.9")], now);
    engine.tick(now).await;

    let snapshot = engine.snapshot();
    let data = &snapshot[0].bots[0].action_data["restart"];
    assert!(data.final_score > 0.0);
    assert!(data.is_available);
    assert!(engine.command_history(0).is_empty());
}
