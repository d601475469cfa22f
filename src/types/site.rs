//! Site and query-server connection descriptors.

use serde::{Deserialize, Serialize};

use super::LookupError;

/// Query server software, which defines how requests are built and parsed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum QueryServerKind {
    #[default]
    Prometheus,
}

impl std::fmt::Display for QueryServerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueryServerKind::Prometheus => write!(f, "Prometheus"),
        }
    }
}

/// Connection descriptor for a metric source. Stored at the site level so
/// every bot group in the site can share it. Immutable after load.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct QueryServer {
    #[serde(default)]
    pub kind: QueryServerKind,
    pub name: String,
    #[serde(default)]
    pub info: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub auth_user: String,
    #[serde(default)]
    pub auth_secret: String,
    /// Sample step used when building range queries, e.g. "15s".
    #[serde(default = "default_step")]
    pub default_step: String,
    /// Window length used when a query does not specify its own.
    #[serde(default = "default_data_duration")]
    pub default_data_duration_secs: u64,
    /// URL template for human-facing links into the server's own UI.
    #[serde(default)]
    pub web_url_format: String,
}

fn default_step() -> String {
    "15s".to_string()
}

const fn default_data_duration() -> u64 {
    60
}

/// Top level of the configuration tree. A site silos its bot groups and
/// query servers; sites never share data with each other.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SiteConfig {
    pub name: String,
    #[serde(default)]
    pub info: String,
    #[serde(default)]
    pub query_servers: Vec<QueryServer>,
    /// Paths to the JSON files holding each bot group definition.
    #[serde(default)]
    pub bot_group_paths: Vec<String>,
    /// Site-wide kill switch: when set, no group executes anything.
    #[serde(default)]
    pub freeze_actions: bool,
}

impl SiteConfig {
    /// Look up a query server by name.
    pub fn query_server(&self, name: &str) -> Result<&QueryServer, LookupError> {
        self.query_servers
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| LookupError::QueryServer {
                name: name.to_string(),
            })
    }
}
