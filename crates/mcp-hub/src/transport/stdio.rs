//! Stdio transport: spawns a backend as a child process and speaks
//! newline-delimited JSON-RPC over its stdin/stdout. Raw `tokio::process`
//! plumbing (rather than rmcp's `TokioChildProcess`) is used so stderr can
//! be drained into a ring buffer independently of the JSON-RPC stream.

use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

use crate::config::BackendConfig;
use crate::error::HubError;
use crate::events::{Event, EventKind, EventSink};

use super::StderrRing;

/// A spawned backend process plus the transport halves rmcp reads/writes.
pub struct StdioProcess {
    pub child: Child,
    pub transport: (ChildStdout, ChildStdin),
}

pub fn spawn(
    config: &BackendConfig,
    stderr_ring: Arc<StderrRing>,
    sink: Arc<dyn EventSink>,
) -> Result<StdioProcess, HubError> {
    let command =
        config.command.as_deref().filter(|c| !c.trim().is_empty()).ok_or_else(|| {
            HubError::BackendCommandEmpty { id: config.name.clone() }
        })?;

    let mut cmd = Command::new(command);
    cmd.args(&config.args);
    if !config.env.is_empty() {
        cmd.envs(&config.env);
    }
    cmd.stdin(std::process::Stdio::piped());
    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::piped());
    cmd.kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .with_context(|| format!("failed to spawn process '{command}'"))
        .map_err(|err| HubError::Internal(err.to_string()))?;

    let stdin = child.stdin.take().ok_or_else(|| HubError::Internal("missing stdin".into()))?;
    let stdout = child.stdout.take().ok_or_else(|| HubError::Internal("missing stdout".into()))?;
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(drain_stderr(stderr, config.name.clone(), stderr_ring, sink));
    }

    Ok(StdioProcess { child, transport: (stdout, stdin) })
}

async fn drain_stderr(
    stderr: tokio::process::ChildStderr,
    backend: String,
    ring: Arc<StderrRing>,
    sink: Arc<dyn EventSink>,
) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                ring.push(line.clone());
                tracing::debug!(backend = %backend, bytes = line.len(), "captured backend stderr line");
                sink.emit(
                    Event::new(EventKind::BackendStderr, serde_json::json!({ "line": line }))
                        .with_backend(backend.clone()),
                );
            }
            Ok(None) | Err(_) => break,
        }
    }
}
