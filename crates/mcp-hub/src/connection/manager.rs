//! Owns every backend [`Connection`], drives its supervisor loop
//! (start/reconnect/backoff) and publishes lifecycle events that the
//! `CapabilityIndex` subscribes to for rebuilds.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{Notify, RwLock, broadcast};

use crate::clock::{Clock, Random};
use crate::config::BackendConfig;
use crate::error::HubError;
use crate::events::EventSink;

use super::{Connection, ConnectionSnapshot, ConnectionState, DisconnectReason};

const BACKOFF_BASE_MS: u64 = 500;
const BACKOFF_CAP_MS: u64 = 30_000;
const BACKOFF_MULTIPLIER: u64 = 2;

/// Minimal cooperative cancellation signal for a supervisor task.
#[derive(Clone)]
struct CancelToken {
    cancelled: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancelToken {
    fn new() -> Self {
        Self { cancelled: Arc::new(AtomicBool::new(false)), notify: Arc::new(Notify::new()) }
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        self.notify.notified().await;
    }
}

/// Broadcast to anything that needs to react to a backend changing shape:
/// today that's the `CapabilityIndex`, but tests subscribe too.
#[derive(Debug, Clone)]
pub enum ManagerEvent {
    StateChanged { backend: String, state: ConnectionState },
    CapabilitiesChanged { backend: String },
    Removed { backend: String },
}

pub struct ConnectionManager {
    connections: RwLock<HashMap<String, Arc<Connection>>>,
    supervisors: RwLock<HashMap<String, CancelToken>>,
    sink: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    random: Arc<dyn Random>,
    events: broadcast::Sender<ManagerEvent>,
}

impl ConnectionManager {
    pub fn new(sink: Arc<dyn EventSink>, clock: Arc<dyn Clock>, random: Arc<dyn Random>) -> Arc<Self> {
        let (events, _rx) = broadcast::channel(1024);
        Arc::new(Self {
            connections: RwLock::new(HashMap::new()),
            supervisors: RwLock::new(HashMap::new()),
            sink,
            clock,
            random,
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ManagerEvent> {
        self.events.subscribe()
    }

    /// Register a new backend. Honors `disabled`; does not start a disabled
    /// backend automatically.
    pub async fn add(self: &Arc<Self>, config: BackendConfig) -> Result<(), HubError> {
        config.validate()?;
        let name = config.name.clone();
        let disabled = config.disabled;
        let connection = Arc::new(Connection::new(config, self.sink.clone(), self.clock.clone()));
        self.connections.write().await.insert(name.clone(), connection);

        if !disabled {
            self.spawn_supervisor(name).await;
        }
        Ok(())
    }

    /// Stop and forget a backend entirely.
    pub async fn remove(self: &Arc<Self>, name: &str) -> Result<(), HubError> {
        if let Some(token) = self.supervisors.write().await.remove(name) {
            token.cancel();
        }
        let connection = self.connections.write().await.remove(name);
        if let Some(connection) = connection {
            let _ = connection.stop(DisconnectReason::Removed).await;
            let _ = self.events.send(ManagerEvent::Removed { backend: name.to_string() });
            Ok(())
        } else {
            Err(HubError::UnknownBackend(name.to_string()))
        }
    }

    pub async fn start(self: &Arc<Self>, name: &str) -> Result<(), HubError> {
        let connection = self.get(name).await?;
        connection.set_disabled(false).await;
        self.spawn_supervisor(name.to_string()).await;
        Ok(())
    }

    pub async fn stop(&self, name: &str) -> Result<(), HubError> {
        if let Some(token) = self.supervisors.write().await.remove(name) {
            token.cancel();
        }
        let connection = self.get(name).await?;
        connection.set_disabled(true).await;
        connection.stop(DisconnectReason::Disabled).await
    }

    pub async fn restart(self: &Arc<Self>, name: &str) -> Result<(), HubError> {
        self.stop(name).await?;
        self.start(name).await
    }

    pub async fn get(&self, name: &str) -> Result<Arc<Connection>, HubError> {
        self.connections
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| HubError::UnknownBackend(name.to_string()))
    }

    pub async fn list(&self) -> Vec<ConnectionSnapshot> {
        let connections = self.connections.read().await.values().cloned().collect::<Vec<_>>();
        let mut snapshots = Vec::with_capacity(connections.len());
        for connection in connections {
            snapshots.push(connection.snapshot().await);
        }
        snapshots
    }

    pub async fn connected_backends(&self) -> Vec<Arc<Connection>> {
        let connections = self.connections.read().await.values().cloned().collect::<Vec<_>>();
        let mut live = Vec::new();
        for connection in connections {
            if connection.state().await == ConnectionState::Connected {
                live.push(connection);
            }
        }
        live
    }

    async fn spawn_supervisor(self: &Arc<Self>, name: String) {
        let token = CancelToken::new();
        self.supervisors.write().await.insert(name.clone(), token.clone());
        let manager = self.clone();
        tokio::spawn(async move {
            manager.supervise(name, token).await;
        });
    }

    /// One backend's connect/reconnect loop: exponential backoff with
    /// jitter, unbounded attempts unless the backend is disabled or
    /// removed.
    async fn supervise(self: Arc<Self>, name: String, token: CancelToken) {
        let mut attempt: u32 = 0;
        loop {
            if token.is_cancelled() {
                return;
            }
            let Ok(connection) = self.get(&name).await else { return };
            if connection.is_disabled().await {
                return;
            }

            match connection.start().await {
                Ok(()) => {
                    attempt = 0;
                    self.notify_state(&name, ConnectionState::Connected).await;
                    self.notify_capabilities(&name).await;
                    // Park here for the lifetime of the connection; the
                    // state machine itself detects transport closure and
                    // we simply poll for that to re-enter the backoff loop.
                    loop {
                        tokio::select! {
                            _ = token.cancelled() => return,
                            _ = tokio::time::sleep(Duration::from_secs(2)) => {}
                        }
                        let Ok(connection) = self.get(&name).await else { return };
                        if connection.is_disabled().await {
                            return;
                        }
                        match connection.state().await {
                            ConnectionState::Connected => {
                                if connection.needs_refresh() {
                                    let _ = connection.refresh_if_needed().await;
                                    self.notify_capabilities(&name).await;
                                }
                            }
                            ConnectionState::Failed => {
                                // Self-reference or unrecoverable handshake
                                // failure: stop supervising.
                                return;
                            }
                            _ => break,
                        }
                    }
                }
                Err(_) => {
                    if matches!(connection.state().await, ConnectionState::Failed) {
                        // e.g. SelfReference: do not retry.
                        return;
                    }
                }
            }

            connection.mark_reconnecting().await;
            self.notify_state(&name, ConnectionState::Reconnecting).await;
            attempt += 1;
            let delay = backoff_delay(attempt, self.random.as_ref());
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn notify_state(&self, name: &str, state: ConnectionState) {
        let _ = self
            .events
            .send(ManagerEvent::StateChanged { backend: name.to_string(), state });
    }

    async fn notify_capabilities(&self, name: &str) {
        let _ = self.events.send(ManagerEvent::CapabilitiesChanged { backend: name.to_string() });
    }

    pub async fn shutdown(&self) {
        let tokens = self.supervisors.write().await.drain().map(|(_, t)| t).collect::<Vec<_>>();
        for token in tokens {
            token.cancel();
        }
        let connections = self.connections.read().await.values().cloned().collect::<Vec<_>>();
        for connection in connections {
            let _ = connection.stop(DisconnectReason::Removed).await;
        }
    }
}

fn backoff_delay(attempt: u32, random: &dyn Random) -> Duration {
    let exp = BACKOFF_MULTIPLIER.saturating_pow(attempt.saturating_sub(1));
    let base = (BACKOFF_BASE_MS.saturating_mul(exp)).min(BACKOFF_CAP_MS);
    let jitter_span = (base as f64) * 0.2;
    let jitter = (random.unit() * 2.0 - 1.0) * jitter_span;
    Duration::from_millis((base as f64 + jitter).max(0.0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{FixedRandom, SystemClock};
    use crate::events::InMemoryEventSink;

    #[test]
    fn backoff_respects_base_and_cap() {
        let random = FixedRandom::new(vec![0.5]);
        let first = backoff_delay(1, &random);
        assert!(first.as_millis() >= 400 && first.as_millis() <= 600);
        let capped = backoff_delay(20, &random);
        assert!(capped.as_millis() <= (BACKOFF_CAP_MS as f64 * 1.2) as u128);
    }

    #[tokio::test]
    async fn unknown_backend_errors_on_get() {
        let sink: Arc<dyn EventSink> = Arc::new(InMemoryEventSink::new(None));
        let manager = ConnectionManager::new(sink, Arc::new(SystemClock::default()), Arc::new(FixedRandom::new(vec![0.0])));
        assert!(manager.get("missing").await.is_err());
    }
}
