//! Namespaced capability model: wraps a backend's raw tool/resource/
//! resource-template/prompt definitions with the name the virtual endpoint
//! actually exposes, annotating each with a provenance note and a
//! deterministic namespaced name instead of a flat tool cache.

pub mod index;

use std::borrow::Cow;

use rmcp::model::{Prompt, Resource, ResourceTemplate, Tool};

pub use index::CapabilityIndex;

pub const NAMESPACE_SEPARATOR: &str = "__";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityKind {
    Tool,
    Resource,
    ResourceTemplate,
    Prompt,
}

/// Dynamic dispatch surface: the virtual endpoint matches on `kind`/variant
/// rather than downcasting, so one `Capability` can flow through generic
/// bookkeeping (the index, `Find_Tools`, chain argument validation) while
/// still carrying its real rmcp payload when a caller needs it.
#[derive(Debug, Clone)]
pub enum CapabilityDefinition {
    Tool(Tool),
    Resource(Resource),
    ResourceTemplate(ResourceTemplate),
    Prompt(Prompt),
}

#[derive(Debug, Clone)]
pub struct Capability {
    pub namespaced_name: String,
    pub original_name: String,
    pub backend: String,
    pub kind: CapabilityKind,
    pub definition: CapabilityDefinition,
}

impl Capability {
    pub fn as_tool(&self) -> Option<Tool> {
        match &self.definition {
            CapabilityDefinition::Tool(tool) => {
                let mut tool = tool.clone();
                tool.name = Cow::Owned(self.namespaced_name.clone());
                tool.description = Some(Cow::Owned(describe(&self.backend, tool.description.as_deref())));
                Some(tool)
            }
            _ => None,
        }
    }

    pub fn as_resource(&self) -> Option<Resource> {
        match &self.definition {
            CapabilityDefinition::Resource(resource) => {
                let mut resource = resource.clone();
                resource.raw.name = self.namespaced_name.clone();
                Some(resource)
            }
            _ => None,
        }
    }

    pub fn as_resource_template(&self) -> Option<ResourceTemplate> {
        match &self.definition {
            CapabilityDefinition::ResourceTemplate(template) => {
                let mut template = template.clone();
                template.raw.name = self.namespaced_name.clone();
                Some(template)
            }
            _ => None,
        }
    }

    pub fn as_prompt(&self) -> Option<Prompt> {
        match &self.definition {
            CapabilityDefinition::Prompt(prompt) => {
                let mut prompt = prompt.clone();
                prompt.name = self.namespaced_name.clone();
                Some(prompt)
            }
            _ => None,
        }
    }
}

fn describe(backend: &str, original: Option<&str>) -> String {
    let note = format!("[provided by {backend}]");
    match original {
        Some(desc) if !desc.is_empty() => {
            if desc.contains("[provided by") {
                desc.to_string()
            } else {
                format!("{desc}\n{note}")
            }
        }
        _ => note,
    }
}

/// Sanitizes a backend name into an identifier-safe fragment: ASCII
/// alphanumerics and underscores pass through, everything else becomes `_`.
/// Not required to be unique by itself; [`index::CapabilityIndex`] appends a
/// numeric suffix on collision.
pub fn safe_id(backend_name: &str) -> String {
    let mut out = String::with_capacity(backend_name.len());
    for ch in backend_name.chars() {
        if ch.is_ascii_alphanumeric() || ch == '_' {
            out.push(ch);
        } else {
            out.push('_');
        }
    }
    if out.is_empty() { "backend".to_string() } else { out }
}

pub fn namespaced_name(safe_backend_id: &str, original_name: &str) -> String {
    format!("{safe_backend_id}{NAMESPACE_SEPARATOR}{original_name}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safe_id_replaces_non_identifier_chars() {
        assert_eq!(safe_id("my-backend.v2"), "my_backend_v2");
        assert_eq!(safe_id("already_ok"), "already_ok");
    }

    #[test]
    fn safe_id_never_empty() {
        assert_eq!(safe_id("---"), "___");
        assert_eq!(safe_id(""), "backend");
    }

    #[test]
    fn namespaced_name_uses_double_underscore_separator() {
        assert_eq!(namespaced_name("svc", "read_file"), "svc__read_file");
    }
}
