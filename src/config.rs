//! Engine configuration loading.
//!
//! Engine settings live in a TOML file (`warden.toml` by default, or the
//! path in the `WARDEN_CONFIG` environment variable). Site, bot-group and
//! curve definitions are JSON data files referenced from the engine
//! settings. Configuration failures are fatal at process start; nothing
//! here is defaulted silently once a path is given.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::types::{BotGroup, SiteConfig};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("invalid config {path}: {reason}")]
    Invalid { path: String, reason: String },
}

/// Engine process settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Path to the site JSON file.
    pub site_config_path: String,
    /// Directory of curve JSON files.
    pub curve_dir: String,
    /// Delay between driver cycles. Short, so decisions track the data,
    /// but never a full spin.
    #[serde(default = "default_loop_delay")]
    pub server_loop_delay_secs: u64,
    /// Queries run in the background; if one runs longer than this its
    /// advisory refresh lock is considered abandoned and cleared.
    #[serde(default = "default_query_lock_timeout")]
    pub query_lock_timeout_secs: u64,
    /// Idle duration after which a what-if session is purged.
    #[serde(default = "default_session_timeout")]
    pub session_idle_timeout_secs: u64,
    /// Default window length for what-if sessions, minutes.
    #[serde(default = "default_session_window_minutes")]
    pub session_window_minutes_default: u64,
}

const fn default_loop_delay() -> u64 {
    1
}

const fn default_query_lock_timeout() -> u64 {
    60
}

const fn default_session_timeout() -> u64 {
    3600
}

const fn default_session_window_minutes() -> u64 {
    15
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            site_config_path: "config/site.json".to_string(),
            curve_dir: "config/curves".to_string(),
            server_loop_delay_secs: default_loop_delay(),
            query_lock_timeout_secs: default_query_lock_timeout(),
            session_idle_timeout_secs: default_session_timeout(),
            session_window_minutes_default: default_session_window_minutes(),
        }
    }
}

impl AppConfig {
    /// Load engine settings from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config: Self = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source: source.into(),
        })?;
        info!(path = %path.display(), "loaded engine config");
        Ok(config)
    }
}

/// Load a site definition from JSON.
pub fn load_site(path: impl AsRef<Path>) -> Result<SiteConfig, ConfigError> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source: source.into(),
    })
}

/// Load one bot group definition from JSON.
pub fn load_bot_group(path: impl AsRef<Path>) -> Result<BotGroup, ConfigError> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let group: BotGroup = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source: source.into(),
    })?;

    for state in &group.states {
        if state.labels.is_empty() {
            return Err(ConfigError::Invalid {
                path: path.display().to_string(),
                reason: format!("state {} has no labels", state.name),
            });
        }
    }

    Ok(group)
}

/// Load the site and every bot group it references.
pub fn load_site_with_groups(
    app: &AppConfig,
) -> Result<(SiteConfig, Vec<BotGroup>), ConfigError> {
    let site = load_site(&app.site_config_path)?;
    let mut groups = Vec::with_capacity(site.bot_group_paths.len());
    for path in &site.bot_group_paths {
        let group = load_bot_group(path)?;
        info!(group = %group.name, path = %path, "loaded bot group");
        groups.push(group);
    }
    Ok((site, groups))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn app_config_parses_with_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "site_config_path = \"site.json\"\ncurve_dir = \"curves\""
        )
        .unwrap();

        let config = AppConfig::load(file.path()).unwrap();
        assert_eq!(config.site_config_path, "site.json");
        assert_eq!(config.server_loop_delay_secs, 1);
        assert_eq!(config.query_lock_timeout_secs, 60);
    }

    #[test]
    fn bot_group_with_empty_state_labels_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "name": "web",
                "bot_extractor": {{"query_name": "up", "key": "instance"}},
                "states": [{{"name": "Triage", "labels": []}}]
            }}"#
        )
        .unwrap();

        let err = load_bot_group(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn bot_group_round_trips_from_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "name": "web",
                "bot_extractor": {{"query_name": "up", "key": "instance"}},
                "queries": [{{
                    "query_server": "prom",
                    "name": "up",
                    "query": "up{{job=\"web\"}}",
                    "interval_secs": 30
                }}],
                "variables": [{{"name": "cpu", "query_name": "up", "bot_key": "instance"}}],
                "actions": [{{"name": "restart", "weight": 2.0, "is_launched": true}}]
            }}"#
        )
        .unwrap();

        let group = load_bot_group(file.path()).unwrap();
        assert_eq!(group.name, "web");
        assert_eq!(group.queries.len(), 1);
        assert_eq!(group.actions[0].weight, 2.0);
        assert!(group.query("up").is_ok());
        assert!(group.query("down").is_err());
    }
}
