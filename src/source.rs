//! Metric source seam: the collaborator that answers queries.
//!
//! The engine only depends on [`MetricSource`] and the tabular
//! [`QueryResult`] shape: rows with a label set and time-ordered samples.
//! A Prometheus-style HTTP implementation ships here; tests inject their
//! own in-memory sources.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::types::{QueryKind, QueryServer};

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("query request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("query response could not be decoded: {0}")]
    Decode(String),
    #[error("query server returned status {status}")]
    BadStatus { status: String },
}

/// One result row: a label set plus time-ordered (timestamp, value)
/// samples. Values stay as wire strings; the variable resolver parses
/// them and treats malformed values as unset.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct QueryRow {
    pub labels: HashMap<String, String>,
    pub samples: Vec<(f64, String)>,
}

impl QueryRow {
    /// The first sample's value, the one the resolver binds.
    pub fn first_value(&self) -> Option<&str> {
        self.samples.first().map(|(_, v)| v.as_str())
    }
}

/// Tabular result of one query.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct QueryResult {
    pub server: String,
    pub query: String,
    pub rows: Vec<QueryRow>,
}

/// The metric source capability. Failure surfaces as an error, never a
/// partial result.
#[async_trait]
pub trait MetricSource: Send + Sync {
    async fn query(
        &self,
        server: &QueryServer,
        kind: QueryKind,
        query: &str,
        start: DateTime<Utc>,
        duration_secs: u64,
    ) -> Result<QueryResult, SourceError>;
}

// ---------------------------------------------------------------------------
// Prometheus implementation
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct PromEnvelope {
    status: String,
    #[serde(default)]
    data: PromData,
}

#[derive(Debug, Deserialize, Default)]
struct PromData {
    #[serde(default)]
    result: Vec<PromSeries>,
}

#[derive(Debug, Deserialize)]
struct PromSeries {
    #[serde(default)]
    metric: HashMap<String, String>,
    #[serde(default)]
    values: Vec<(f64, String)>,
}

/// HTTP client for Prometheus-compatible servers.
pub struct PrometheusSource {
    client: reqwest::Client,
}

impl PrometheusSource {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    fn build_url(
        server: &QueryServer,
        kind: QueryKind,
        query: &str,
        start: DateTime<Utc>,
        duration_secs: u64,
    ) -> String {
        let end = start + chrono::Duration::seconds(duration_secs as i64);
        format!(
            "http://{}:{}/api/v1/{}?query={}&start={}&end={}&step={}",
            server.host,
            server.port,
            kind.endpoint(),
            urlencode(query),
            start.to_rfc3339(),
            end.to_rfc3339(),
            server.default_step,
        )
    }
}

impl Default for PrometheusSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MetricSource for PrometheusSource {
    async fn query(
        &self,
        server: &QueryServer,
        kind: QueryKind,
        query: &str,
        start: DateTime<Utc>,
        duration_secs: u64,
    ) -> Result<QueryResult, SourceError> {
        let url = Self::build_url(server, kind, query, start, duration_secs);
        debug!(server = %server.name, %url, "issuing metric query");

        let mut request = self.client.get(&url);
        if !server.auth_user.is_empty() {
            request = request.basic_auth(&server.auth_user, Some(&server.auth_secret));
        }

        let envelope: PromEnvelope = request.send().await?.json().await?;
        if envelope.status != "success" {
            return Err(SourceError::BadStatus {
                status: envelope.status,
            });
        }

        Ok(QueryResult {
            server: server.name.clone(),
            query: query.to_string(),
            rows: envelope
                .data
                .result
                .into_iter()
                .map(|series| QueryRow {
                    labels: series.metric,
                    samples: series.values,
                })
                .collect(),
        })
    }
}

/// Percent-encode a query string for use in a URL query parameter.
fn urlencode(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char);
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_encoding_escapes_query_syntax() {
        assert_eq!(urlencode("up"), "up");
        assert_eq!(
            urlencode(r#"up{job="web"}"#),
            "up%7Bjob%3D%22web%22%7D"
        );
        assert_eq!(urlencode("a b"), "a%20b");
    }

    #[test]
    fn range_url_hits_query_range() {
        let server = QueryServer {
            name: "prom".to_string(),
            host: "localhost".to_string(),
            port: 9090,
            default_step: "15s".to_string(),
            ..Default::default()
        };
        let start = Utc::now();
        let url = PrometheusSource::build_url(&server, QueryKind::Range, "up", start, 60);
        assert!(url.starts_with("http://localhost:9090/api/v1/query_range?query=up&"));
        assert!(url.ends_with("&step=15s"));
    }

    #[test]
    fn envelope_decodes_prometheus_shape() {
        let raw = r#"{
            "status": "success",
            "data": {
                "resultType": "matrix",
                "result": [
                    {"metric": {"instance": "web-1"}, "values": [[1700000000.0, "0.9"]]}
                ]
            }
        }"#;
        let envelope: PromEnvelope = serde_json::from_str(raw).unwrap();
        assert_eq!(envelope.status, "success");
        assert_eq!(envelope.data.result.len(), 1);
        assert_eq!(
            envelope.data.result[0].metric.get("instance").map(String::as_str),
            Some("web-1")
        );
        assert_eq!(envelope.data.result[0].values[0].1, "0.9");
    }
}
