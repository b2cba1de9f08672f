//! Aggregated, namespaced view over every connected backend's capabilities.
//! Rebuilt wholesale on each `CapabilitiesChanged`/`StateChanged` manager
//! event rather than patched incrementally, matching the atomic
//! `rebuild(kind?)` contract: readers never see a half-updated index.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{RwLock, broadcast};

use crate::connection::manager::ConnectionManager;

use super::{Capability, CapabilityDefinition, CapabilityKind, namespaced_name, safe_id};

#[derive(Debug, Clone)]
pub enum IndexEvent {
    Rebuilt { tools: usize, resources: usize, resource_templates: usize, prompts: usize },
}

#[derive(Default)]
struct Tables {
    by_name: HashMap<String, Capability>,
    /// Longest-matching URI prefix routing for resource templates, used when
    /// a `resources/read` URI doesn't match any concrete resource exactly.
    template_prefixes: Vec<(String, String)>,
}

pub struct CapabilityIndex {
    tables: RwLock<Tables>,
    events: broadcast::Sender<IndexEvent>,
}

impl CapabilityIndex {
    pub fn new() -> Arc<Self> {
        let (events, _rx) = broadcast::channel(256);
        Arc::new(Self { tables: RwLock::new(Tables::default()), events })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<IndexEvent> {
        self.events.subscribe()
    }

    /// Full rebuild from every currently-connected backend. Self-referencing
    /// backends never reach `Connected`, so they are excluded automatically
    /// by construction, races included: a connection only appears here once
    /// `ConnectionManager::connected_backends` observes it as `Connected`.
    pub async fn rebuild(&self, manager: &ConnectionManager) {
        let mut by_name: HashMap<String, Capability> = HashMap::new();
        let mut used_ids: HashMap<String, u32> = HashMap::new();
        let mut used_names: HashMap<String, u32> = HashMap::new();
        let mut template_prefixes = Vec::new();

        let (mut tool_count, mut resource_count, mut template_count, mut prompt_count) = (0, 0, 0, 0);

        for connection in manager.connected_backends().await {
            let backend = connection.name().to_string();
            let prefix = unique_backend_id(&backend, &mut used_ids);

            for tool in connection.tools().await {
                let original = tool.name.to_string();
                let name = unique_name(&prefix, &original, &mut used_names);
                by_name.insert(
                    name.clone(),
                    Capability {
                        namespaced_name: name,
                        original_name: original,
                        backend: backend.clone(),
                        kind: CapabilityKind::Tool,
                        definition: CapabilityDefinition::Tool(tool),
                    },
                );
                tool_count += 1;
            }

            for resource in connection.resources().await {
                let original = resource.uri.clone();
                let name = unique_name(&prefix, &resource.name, &mut used_names);
                by_name.insert(
                    name.clone(),
                    Capability {
                        namespaced_name: name,
                        original_name: original,
                        backend: backend.clone(),
                        kind: CapabilityKind::Resource,
                        definition: CapabilityDefinition::Resource(resource),
                    },
                );
                resource_count += 1;
            }

            for template in connection.resource_templates().await {
                let original = template.uri_template.clone();
                let name = unique_name(&prefix, &template.name, &mut used_names);
                template_prefixes.push((uri_prefix(&template.uri_template), name.clone()));
                by_name.insert(
                    name.clone(),
                    Capability {
                        namespaced_name: name,
                        original_name: original,
                        backend: backend.clone(),
                        kind: CapabilityKind::ResourceTemplate,
                        definition: CapabilityDefinition::ResourceTemplate(template),
                    },
                );
                template_count += 1;
            }

            for prompt in connection.prompts().await {
                let original = prompt.name.clone();
                let name = unique_name(&prefix, &original, &mut used_names);
                by_name.insert(
                    name.clone(),
                    Capability {
                        namespaced_name: name,
                        original_name: original,
                        backend: backend.clone(),
                        kind: CapabilityKind::Prompt,
                        definition: CapabilityDefinition::Prompt(prompt),
                    },
                );
                prompt_count += 1;
            }
        }

        // Longer prefixes win so a more specific template is preferred.
        template_prefixes.sort_by(|a, b| b.0.len().cmp(&a.0.len()));

        *self.tables.write().await = Tables { by_name, template_prefixes };
        let _ = self.events.send(IndexEvent::Rebuilt {
            tools: tool_count,
            resources: resource_count,
            resource_templates: template_count,
            prompts: prompt_count,
        });
    }

    pub async fn lookup(&self, namespaced_name: &str) -> Option<Capability> {
        self.tables.read().await.by_name.get(namespaced_name).cloned()
    }

    pub async fn list(&self, kind: Option<CapabilityKind>) -> Vec<Capability> {
        self.tables
            .read()
            .await
            .by_name
            .values()
            .filter(|cap| kind.is_none_or(|k| cap.kind == k))
            .cloned()
            .collect()
    }

    pub async fn list_for_backend(&self, backend: &str) -> Vec<Capability> {
        self.tables.read().await.by_name.values().filter(|cap| cap.backend == backend).cloned().collect()
    }

    pub async fn find_resource_by_uri(&self, uri: &str) -> Option<Capability> {
        self.tables
            .read()
            .await
            .by_name
            .values()
            .find(|cap| cap.kind == CapabilityKind::Resource && cap.original_name == uri)
            .cloned()
    }

    /// Resolve a resource URI against known resource templates when no
    /// concrete resource matches it exactly.
    pub async fn resolve_template_for_uri(&self, uri: &str) -> Option<Capability> {
        let tables = self.tables.read().await;
        for (prefix, name) in &tables.template_prefixes {
            if uri.starts_with(prefix.as_str()) {
                return tables.by_name.get(name).cloned();
            }
        }
        None
    }

    pub async fn find(&self, query: &str) -> Vec<Capability> {
        let query = query.to_ascii_lowercase();
        self.tables
            .read()
            .await
            .by_name
            .values()
            .filter(|cap| {
                cap.namespaced_name.to_ascii_lowercase().contains(&query)
                    || cap.original_name.to_ascii_lowercase().contains(&query)
                    || description_matches(cap, &query)
            })
            .cloned()
            .collect()
    }
}

fn description_matches(cap: &Capability, query: &str) -> bool {
    match &cap.definition {
        CapabilityDefinition::Tool(tool) => {
            tool.description.as_deref().map(|d| d.to_ascii_lowercase().contains(query)).unwrap_or(false)
        }
        _ => false,
    }
}

fn uri_prefix(uri_template: &str) -> String {
    uri_template.split('{').next().unwrap_or(uri_template).to_string()
}

/// Assigns one stable safe id per backend, in the order backends are
/// visited here, before any of that backend's capabilities are namespaced.
/// Two backend names that sanitize to the same `safe_id` (e.g. `A.x` and
/// `A_x`) must not share a prefix: the first claimant keeps it unsuffixed,
/// later ones get `_2`, `_3`, ... appended to the id itself. Keying the
/// suffix on the backend id alone, rather than on a `prefix__tool` name,
/// keeps it independent of which tools a backend happens to expose.
fn unique_backend_id(backend_name: &str, used: &mut HashMap<String, u32>) -> String {
    let candidate = safe_id(backend_name);
    let count = used.entry(candidate.clone()).or_insert(0);
    *count += 1;
    if *count == 1 { candidate } else { format!("{candidate}_{count}") }
}

/// Deterministic insertion-order collision handling for names within one
/// backend's own capability list: first claimant of a `prefix__name` keeps
/// it unsuffixed, later claimants get `_2`, `_3`, ...
fn unique_name(prefix: &str, original: &str, used: &mut HashMap<String, u32>) -> String {
    let candidate = namespaced_name(prefix, original);
    let count = used.entry(candidate.clone()).or_insert(0);
    *count += 1;
    if *count == 1 { candidate } else { format!("{candidate}_{count}") }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_name_suffixes_on_collision() {
        let mut used = HashMap::new();
        assert_eq!(unique_name("svc", "read", &mut used), "svc__read");
        assert_eq!(unique_name("svc", "read", &mut used), "svc__read_2");
        assert_eq!(unique_name("svc", "read", &mut used), "svc__read_3");
    }

    #[test]
    fn unique_backend_id_suffixes_distinct_backends_sharing_a_safe_id() {
        let mut used = HashMap::new();
        assert_eq!(unique_backend_id("A.x", &mut used), "A_x");
        assert_eq!(unique_backend_id("A_x", &mut used), "A_x_2");
    }

    #[test]
    fn backend_id_suffix_is_independent_of_each_backends_tool_names() {
        // Two backends whose names collide after sanitization must end up
        // with distinct prefixes even when their tool names never collide,
        // so the backend a capability belongs to stays recoverable from the
        // namespaced name alone.
        let mut used = HashMap::new();
        let prefix_a = unique_backend_id("A.x", &mut used);
        let prefix_b = unique_backend_id("A_x", &mut used);
        assert_ne!(prefix_a, prefix_b);

        let mut used_names = HashMap::new();
        let read = unique_name(&prefix_a, "read", &mut used_names);
        let list = unique_name(&prefix_b, "list", &mut used_names);
        assert_eq!(read, "A_x__read");
        assert_eq!(list, "A_x_2__list");
    }

    #[test]
    fn uri_prefix_stops_at_first_placeholder() {
        assert_eq!(uri_prefix("file:///{path}"), "file:///");
        assert_eq!(uri_prefix("static://no-template"), "static://no-template");
    }
}
