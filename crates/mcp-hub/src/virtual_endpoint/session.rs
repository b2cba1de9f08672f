//! Tracks every live upstream session's outbound notification channel so a
//! capability change on any backend can be pushed to every connected
//! client, not just observed on the next `tools/list` poll.

use std::collections::HashMap;

use rmcp::service::{Peer, RoleServer};
use tokio::sync::RwLock;

#[derive(Default)]
pub struct SessionRegistry {
    peers: RwLock<HashMap<String, Peer<RoleServer>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, session_id: String, peer: Peer<RoleServer>) {
        self.peers.write().await.insert(session_id, peer);
    }

    pub async fn unregister(&self, session_id: &str) {
        self.peers.write().await.remove(session_id);
    }

    pub async fn broadcast_tools_changed(&self) {
        self.broadcast(|peer| async move { peer.notify_tool_list_changed().await }).await;
    }

    pub async fn broadcast_resources_changed(&self) {
        self.broadcast(|peer| async move { peer.notify_resource_list_changed().await }).await;
    }

    pub async fn broadcast_prompts_changed(&self) {
        self.broadcast(|peer| async move { peer.notify_prompt_list_changed().await }).await;
    }

    /// Fires `notify` against every registered session, dropping any whose
    /// send fails — a dead peer here means the session's transport already
    /// closed and the registry shouldn't keep holding it alive.
    async fn broadcast<F, Fut>(&self, notify: F)
    where
        F: Fn(Peer<RoleServer>) -> Fut,
        Fut: std::future::Future<Output = Result<(), rmcp::service::ServiceError>>,
    {
        let peers: Vec<(String, Peer<RoleServer>)> =
            self.peers.read().await.iter().map(|(id, peer)| (id.clone(), peer.clone())).collect();
        let mut dead = Vec::new();
        for (id, peer) in peers {
            if notify(peer).await.is_err() {
                dead.push(id);
            }
        }
        if !dead.is_empty() {
            let mut guard = self.peers.write().await;
            for id in dead {
                guard.remove(&id);
            }
        }
    }
}
