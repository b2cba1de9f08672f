//! Multi-step tool orchestration across backends: typed steps dispatched
//! directly by `(server_name, tool_name)`, grouped into the positional
//! alternating sequential/parallel blocks the caller laid out, with retry,
//! a soft approval gate for write operations, and best-effort rollback.

pub mod executor;
pub mod expr;
pub mod transform;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::id_generator::generate_id;

pub use executor::{ChainExecutor, ChainResult};

pub const MAX_STEPS: usize = 256;
pub const MAX_ARG_BYTES: usize = 1024 * 1024;
pub const MAX_PARALLEL: usize = 16;

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct RetryPolicy {
    #[serde(default)]
    pub max_attempts: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub backoff_ms: u64,
}

fn default_retry_backoff_ms() -> u64 {
    200
}

/// `execute_if` gates whether the step runs at all (absent means "always
/// run"); `skip_on_error` decides whether a failed call aborts the chain or
/// simply leaves its failure recorded in the context for later steps.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct Conditions {
    #[serde(default)]
    pub execute_if: Option<String>,
    #[serde(default)]
    pub skip_on_error: bool,
}

/// A compensating call fired, best-effort, if a later step forces the chain
/// to abort after this step already succeeded.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Compensation {
    pub server_name: String,
    pub tool_name: String,
    #[serde(default)]
    pub arguments: Value,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChainStep {
    /// Caller-declared step id; left blank to have one generated.
    #[serde(default)]
    pub id: String,
    pub server_name: String,
    pub tool_name: String,
    #[serde(default)]
    pub arguments: Value,
    /// Explicit `{targetKey: sourcePath}` pulls from `PREV.*`/`VARS.*`/
    /// `<stepId>.*` into `arguments` before the call. The only path into
    /// `arguments` richer than a bare `{{VARS.name}}` substitution.
    #[serde(default)]
    pub input_mapping: BTreeMap<String, String>,
    /// Applied in list order to the raw tool result before it's recorded.
    #[serde(default)]
    pub transformations: Vec<transform::TransformSpec>,
    #[serde(default)]
    pub conditions: Conditions,
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Steps sharing a group id that appear consecutively in `steps` form
    /// one parallel block, bounded by [`MAX_PARALLEL`]; non-adjacent
    /// occurrences of the same id start a new block.
    #[serde(default)]
    pub parallel_group: Option<String>,
    #[serde(default)]
    pub rollback_action: Option<Compensation>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChainDefinition {
    #[serde(default)]
    pub variables: BTreeMap<String, Value>,
    pub steps: Vec<ChainStep>,
    /// Acknowledges the write operations a prior `RequiresApproval` response
    /// enumerated; without it, a chain containing an un-pre-approved write
    /// is rejected before any step runs.
    #[serde(default)]
    pub approval_granted: bool,
    /// Gates Phase 4: rollback only fires for an aborted chain when this is
    /// set, even if individual steps declare a `rollback_action`.
    #[serde(default)]
    pub rollback_on_error: bool,
}

impl ChainDefinition {
    /// Fills in a generated id for every step left blank, guarding against
    /// collision with both declared and already-generated ids.
    pub fn assign_generated_ids(&mut self) {
        let mut existing: std::collections::HashSet<String> =
            self.steps.iter().map(|step| step.id.clone()).filter(|id| !id.is_empty()).collect();
        for step in &mut self.steps {
            if step.id.is_empty() {
                let id = generate_id(&existing);
                existing.insert(id.clone());
                step.id = id;
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StepResult {
    pub step_id: String,
    pub backend: String,
    pub tool: String,
    pub success: bool,
    pub skipped: bool,
    pub value: Value,
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// Running state threaded through a chain execution: initial variables plus
/// every step's result so far, addressable via `PREV.*`, `VARS.*` and
/// `<stepId>.*` paths (see [`expr`]).
#[derive(Debug, Clone, Default)]
pub struct ChainContext {
    pub variables: BTreeMap<String, Value>,
    pub results: BTreeMap<String, StepResult>,
    pub last_step_id: Option<String>,
}

impl ChainContext {
    pub fn new(variables: BTreeMap<String, Value>) -> Self {
        Self { variables, results: BTreeMap::new(), last_step_id: None }
    }

    pub fn record(&mut self, result: StepResult) {
        self.last_step_id = Some(result.step_id.clone());
        self.results.insert(result.step_id.clone(), result);
    }

    pub fn previous(&self) -> Option<&StepResult> {
        self.last_step_id.as_ref().and_then(|id| self.results.get(id))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChainOutcome {
    pub execution_id: String,
    pub aborted: bool,
    pub steps: Vec<StepResult>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bare_step(id: &str, tool: &str) -> ChainStep {
        ChainStep {
            id: id.to_string(),
            server_name: "svc".to_string(),
            tool_name: tool.to_string(),
            arguments: Value::Null,
            input_mapping: BTreeMap::new(),
            transformations: Vec::new(),
            conditions: Conditions::default(),
            retry: RetryPolicy::default(),
            parallel_group: None,
            rollback_action: None,
        }
    }

    #[test]
    fn assigns_ids_only_to_blank_steps() {
        let mut definition = ChainDefinition {
            variables: BTreeMap::new(),
            steps: vec![bare_step("first", "x"), bare_step("", "y"), bare_step("", "z")],
            approval_granted: false,
            rollback_on_error: false,
        };
        definition.assign_generated_ids();
        assert_eq!(definition.steps[0].id, "first");
        assert!(!definition.steps[1].id.is_empty());
        assert!(!definition.steps[2].id.is_empty());
        assert_ne!(definition.steps[1].id, definition.steps[2].id);
    }
}
