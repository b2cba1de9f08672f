//! Event sink: a one-way, best-effort fan-out of lifecycle, capability,
//! execution and audit events. Generalized from a per-server JSONL log with
//! broadcast fan-out into the hub's unified event schema.

use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use time::macros::format_description;
use tokio::sync::broadcast;

/// Bound on the in-memory fan-out queue; events beyond this are dropped and
/// counted via [`EventSink::overflow_count`].
pub const EVENT_QUEUE_MAX: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ConnectionState,
    CapabilitiesChanged,
    RequestComplete,
    ToolStart,
    ToolComplete,
    SessionOpen,
    SessionClose,
    ChainStart,
    ChainStep,
    ChainComplete,
    SinkOverflow,
    ProtocolWarning,
    BackendStderr,
}

/// A single emitted event, matching the schema in the external interfaces
/// section: `{ts, kind, backend?, sessionId?, executionId?, data}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
    pub data: serde_json::Value,
}

impl Event {
    pub fn new(kind: EventKind, data: serde_json::Value) -> Self {
        Self {
            ts: OffsetDateTime::now_utc(),
            kind,
            backend: None,
            session_id: None,
            execution_id: None,
            data,
        }
    }

    pub fn with_backend(mut self, backend: impl Into<String>) -> Self {
        self.backend = Some(backend.into());
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_execution(mut self, execution_id: impl Into<String>) -> Self {
        self.execution_id = Some(execution_id.into());
        self
    }
}

/// Sink interface consumed by every other subsystem. Non-blocking,
/// best-effort: a slow or absent subscriber must never stall the caller.
pub trait EventSink: Send + Sync + 'static {
    fn emit(&self, event: Event);

    fn subscribe(&self) -> broadcast::Receiver<Event>;

    fn overflow_count(&self) -> u64;
}

struct FileState {
    date: time::Date,
    file: File,
}

/// Default sink: bounded broadcast fan-out plus an optional append-only
/// JSONL file, rotated daily.
pub struct InMemoryEventSink {
    tx: broadcast::Sender<Event>,
    overflow: AtomicU64,
    file_dir: Option<PathBuf>,
    file_state: Mutex<Option<FileState>>,
}

impl InMemoryEventSink {
    pub fn new(file_dir: Option<PathBuf>) -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_QUEUE_MAX);
        Self { tx, overflow: AtomicU64::new(0), file_dir, file_state: Mutex::new(None) }
    }

    fn append_to_file(&self, event: &Event) {
        let Some(dir) = &self.file_dir else { return };
        let mut guard = self.file_state.lock().expect("event sink file lock poisoned");
        let today = event.ts.date();
        let needs_new_file = match guard.as_ref() {
            Some(state) => state.date != today,
            None => true,
        };
        if needs_new_file {
            if let Err(err) = std::fs::create_dir_all(dir) {
                tracing::warn!(error = %err, "failed to create event log directory");
                return;
            }
            let path = day_log_path(dir, today);
            match OpenOptions::new().create(true).append(true).open(&path) {
                Ok(file) => *guard = Some(FileState { date: today, file }),
                Err(err) => {
                    tracing::warn!(error = %err, path = %path.display(), "failed to open event log file");
                    return;
                }
            }
        }
        if let Some(state) = guard.as_mut() {
            if let Ok(line) = serde_json::to_string(event) {
                let _ = writeln!(state.file, "{line}");
            }
        }
    }
}

fn day_log_path(dir: &Path, date: time::Date) -> PathBuf {
    let format = format_description!("[year]-[month]-[day]");
    let stamp = date.format(&format).unwrap_or_else(|_| date.to_string());
    dir.join(format!("{stamp}.jsonl"))
}

impl EventSink for InMemoryEventSink {
    fn emit(&self, event: Event) {
        self.append_to_file(&event);
        // `send` only errs when there are no receivers; that's fine, the
        // event is still durable in the file sink.
        if self.tx.send(event).is_err() {
            return;
        }
        if self.tx.len() >= EVENT_QUEUE_MAX {
            self.overflow.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    fn overflow_count(&self) -> u64 {
        self.overflow.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribers_receive_emitted_events() {
        let sink = InMemoryEventSink::new(None);
        let mut rx = sink.subscribe();
        sink.emit(Event::new(EventKind::SessionOpen, serde_json::json!({"id": "s1"})));
        let received = rx.try_recv().expect("expected an event");
        assert_eq!(received.kind, EventKind::SessionOpen);
    }

    #[test]
    fn writes_jsonl_to_file_sink() {
        let dir = tempfile::tempdir().unwrap();
        let sink = InMemoryEventSink::new(Some(dir.path().to_path_buf()));
        sink.emit(Event::new(EventKind::ToolStart, serde_json::json!({"tool": "x"})));
        let mut entries = std::fs::read_dir(dir.path()).unwrap();
        assert!(entries.next().is_some());
    }
}
