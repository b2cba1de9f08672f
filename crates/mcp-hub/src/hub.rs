//! Top-level wiring: owns every subsystem and the background task that
//! keeps the `CapabilityIndex` in lock-step with `ConnectionManager`
//! lifecycle events.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::debug;

use crate::capability::CapabilityIndex;
use crate::chain::ChainExecutor;
use crate::clock::{Clock, Random};
use crate::config::BackendConfig;
use crate::connection::manager::ConnectionManager;
use crate::credential::CredentialProvider;
use crate::error::HubError;
use crate::events::EventSink;
use crate::meta_tools::MetaToolHandler;
use crate::virtual_endpoint::{SessionRegistry, VirtualEndpoint};

pub struct Hub {
    pub manager: Arc<ConnectionManager>,
    pub index: Arc<CapabilityIndex>,
    pub executor: Arc<ChainExecutor>,
    pub endpoint: Arc<VirtualEndpoint>,
    rebuild_task: JoinHandle<()>,
    notification_task: JoinHandle<()>,
}

impl Hub {
    /// Wires the subsystems together and loads every configured backend.
    /// Backends with a credential reference that fails to resolve are
    /// skipped with a warning rather than aborting startup — one
    /// misconfigured backend should not take the whole hub down.
    pub async fn start(
        configs: Vec<BackendConfig>,
        credentials: Arc<dyn CredentialProvider>,
        sink: Arc<dyn EventSink>,
        clock: Arc<dyn Clock>,
        random: Arc<dyn Random>,
        meta_only: bool,
    ) -> Result<Self, HubError> {
        let manager = ConnectionManager::new(sink.clone(), clock, random);
        let index = CapabilityIndex::new();
        let executor = Arc::new(ChainExecutor::new(manager.clone(), sink.clone()));
        let meta_tools = Arc::new(MetaToolHandler::new(manager.clone(), index.clone(), executor.clone()));
        let sessions = Arc::new(SessionRegistry::new());
        let endpoint =
            Arc::new(VirtualEndpoint::new(index.clone(), manager.clone(), meta_tools, meta_only, sessions.clone()));

        for config in configs {
            let resolved = match config.resolve_credentials(credentials.as_ref()) {
                Ok(resolved) => resolved,
                Err(err) => {
                    tracing::warn!(backend = %config.name, error = %err, "skipping backend with unresolved credential");
                    continue;
                }
            };
            manager.add(resolved).await?;
        }

        let rebuild_task = spawn_rebuild_task(manager.clone(), index.clone());
        let notification_task = spawn_notification_task(index.clone(), sessions);

        Ok(Self { manager, index, executor, endpoint, rebuild_task, notification_task })
    }

    pub async fn shutdown(self) {
        self.rebuild_task.abort();
        self.notification_task.abort();
        self.manager.shutdown().await;
    }
}

/// Subscribes to every `StateChanged`/`CapabilitiesChanged`/`Removed`
/// event and rebuilds the capability index wholesale. A full rebuild is
/// cheap relative to a backend round-trip and keeps the index's
/// deterministic-collision-suffix invariant simple: there is only ever
/// one code path that assigns namespaced names.
fn spawn_rebuild_task(manager: Arc<ConnectionManager>, index: Arc<CapabilityIndex>) -> JoinHandle<()> {
    let mut events = manager.subscribe();
    tokio::spawn(async move {
        index.rebuild(&manager).await;
        loop {
            match events.recv().await {
                Ok(event) => {
                    debug!(?event, "rebuilding capability index");
                    index.rebuild(&manager).await;
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                    index.rebuild(&manager).await;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            }
        }
    })
}

/// Subscribes to `CapabilityIndex::subscribe` and pushes a `list_changed`
/// notification to every registered session on each rebuild. The real
/// `ClientCapabilities` type exposes no per-kind flag a client could have
/// declared during its own `initialize`, so this broadcasts unconditionally
/// to every session rather than gating on a capability that doesn't exist.
fn spawn_notification_task(index: Arc<CapabilityIndex>, sessions: Arc<SessionRegistry>) -> JoinHandle<()> {
    let mut events = index.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(crate::capability::index::IndexEvent::Rebuilt { .. }) => {
                    sessions.broadcast_tools_changed().await;
                    sessions.broadcast_resources_changed().await;
                    sessions.broadcast_prompts_changed().await;
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{FixedRandom, SystemClock};
    use crate::credential::EnvCredentialProvider;
    use crate::events::InMemoryEventSink;

    #[tokio::test]
    async fn starts_with_no_backends_and_shuts_down_cleanly() {
        let hub = Hub::start(
            vec![],
            Arc::new(EnvCredentialProvider),
            Arc::new(InMemoryEventSink::new(None)),
            Arc::new(SystemClock::default()),
            Arc::new(FixedRandom::new(vec![0.5])),
            false,
        )
        .await
        .unwrap();
        assert!(hub.manager.list().await.is_empty());
        hub.shutdown().await;
    }
}
