//! Transport variants a [`Connection`](crate::connection::Connection) can
//! be reached through. All three share the rmcp client transport contract
//! (`send`/`recv`/`close` live inside `rmcp::service::Service`); this module
//! only adds the construction logic per [`TransportKind`](crate::config::TransportKind)
//! plus stderr capture for stdio backends.

pub mod http_sse;
pub mod stdio;
pub mod streamable_http;

use std::collections::VecDeque;
use std::sync::Mutex;

/// Bound on how many stderr lines a stdio backend keeps buffered before the
/// oldest lines are dropped. Exceeding this never fails the connection; it
/// only means older `backend_stderr` history is lost.
pub const STDERR_RING_CAPACITY: usize = 256;

/// Bounded ring buffer of a backend's raw stderr lines, surfaced only via
/// `backend_stderr` events and never mixed into the hub's own tracing
/// output.
#[derive(Default)]
pub struct StderrRing {
    lines: Mutex<VecDeque<String>>,
}

impl StderrRing {
    pub fn push(&self, line: String) {
        let mut guard = self.lines.lock().expect("stderr ring lock poisoned");
        if guard.len() == STDERR_RING_CAPACITY {
            guard.pop_front();
        }
        guard.push_back(line);
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.lines.lock().expect("stderr ring lock poisoned").iter().cloned().collect()
    }
}
