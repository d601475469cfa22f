//! Command executor seam.
//!
//! The engine decides *what* to run; running it is delegated here. An
//! executor receives the action's command descriptor with its content
//! already template-rendered, performs the side effect, and reports an
//! outcome. The engine records the outcome verbatim and applies the
//! configured state transitions on success; it never interprets command
//! semantics beyond that.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::warn;

use crate::types::{Command, CommandKind};

/// What the executor reports back. Errors are folded into a failed
/// outcome rather than surfaced as pipeline failures; a failed command is
/// an operational fact to record, not an engine fault.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub succeeded: bool,
    pub status: String,
    pub content: String,
    /// Host the command ran on, when the executor knows it.
    pub host: String,
    pub started: DateTime<Utc>,
    pub finished: DateTime<Utc>,
}

#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(&self, command: &Command, rendered_content: String) -> ExecutionOutcome;
}

/// Executes web command kinds with a GET request. Shell and RPC kinds are
/// reported as skipped; those run through an external client with its own
/// access, not in this process.
pub struct HttpExecutor {
    client: reqwest::Client,
}

impl HttpExecutor {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CommandExecutor for HttpExecutor {
    async fn execute(&self, command: &Command, rendered_content: String) -> ExecutionOutcome {
        let started = Utc::now();

        match command.kind {
            CommandKind::WebHttps | CommandKind::WebHttpInsecure => {
                match self.client.get(&rendered_content).send().await {
                    Ok(response) => {
                        let status = response.status();
                        let content = response.text().await.unwrap_or_default();
                        let succeeded = if command.success_status > 0 {
                            i64::from(status.as_u16()) == command.success_status
                        } else {
                            status.is_success()
                        };
                        ExecutionOutcome {
                            succeeded,
                            status: status.as_u16().to_string(),
                            content,
                            host: String::new(),
                            started,
                            finished: Utc::now(),
                        }
                    }
                    Err(err) => ExecutionOutcome {
                        succeeded: false,
                        status: "error".to_string(),
                        content: format!("Error: {err}"),
                        host: String::new(),
                        started,
                        finished: Utc::now(),
                    },
                }
            }
            CommandKind::NoOp => ExecutionOutcome {
                succeeded: true,
                status: "noop".to_string(),
                content: String::new(),
                host: String::new(),
                started,
                finished: Utc::now(),
            },
            CommandKind::Shell | CommandKind::WebRpc => {
                warn!(
                    command = %command.name,
                    kind = ?command.kind,
                    "command kind requires an external execution client; skipping"
                );
                ExecutionOutcome {
                    succeeded: false,
                    status: "unsupported".to_string(),
                    content: "no execution client for this command kind".to_string(),
                    host: String::new(),
                    started,
                    finished: Utc::now(),
                }
            }
        }
    }
}

/// Executor that succeeds without doing anything. Useful for tests and
/// for running the engine in observe-only mode.
pub struct NoopExecutor;

#[async_trait]
impl CommandExecutor for NoopExecutor {
    async fn execute(&self, _command: &Command, _rendered_content: String) -> ExecutionOutcome {
        let now = Utc::now();
        ExecutionOutcome {
            succeeded: true,
            status: "noop".to_string(),
            content: String::new(),
            host: String::new(),
            started: now,
            finished: now,
        }
    }
}
