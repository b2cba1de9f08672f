//! Four-phase chain execution: validate & gate on write-operation approval,
//! group into the positional alternating sequential/parallel blocks the
//! caller declared, execute with bounded concurrency and retry, then fire
//! compensations if the chain aborted partway through.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::Semaphore;
use tokio::time::Duration;

use crate::connection::manager::ConnectionManager;
use crate::error::HubError;
use crate::events::{Event, EventKind, EventSink};

use super::expr::{evaluate_condition, resolve_path};
use super::{ChainContext, ChainDefinition, ChainOutcome, ChainStep, MAX_ARG_BYTES, MAX_PARALLEL, MAX_STEPS, transform};

/// Either the chain ran to completion, or it stopped short of dispatching
/// anything because it contains a write operation the caller hasn't
/// acknowledged yet.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ChainResult {
    RequiresApproval { write_operations: Vec<String> },
    Completed(ChainOutcome),
}

pub struct ChainExecutor {
    manager: Arc<ConnectionManager>,
    sink: Arc<dyn EventSink>,
}

/// One maximal run of the positional alternating-group walk over `steps`:
/// a bare step runs alone, a run of consecutive steps sharing the same
/// non-empty `parallel_group` runs concurrently as one block. Cross-block
/// ordering is always strict sequential, including between two distinct
/// parallel blocks.
enum Block {
    Sequential(ChainStep),
    Parallel { steps: Vec<ChainStep> },
}

fn group_into_blocks(steps: &[ChainStep]) -> Vec<Block> {
    let mut blocks: Vec<Block> = Vec::new();
    for step in steps {
        match (&step.parallel_group, blocks.last_mut()) {
            (Some(group_id), Some(Block::Parallel { steps: group_steps }))
                if group_steps.last().and_then(|s| s.parallel_group.as_ref()) == Some(group_id) =>
            {
                group_steps.push(step.clone());
            }
            (Some(_), _) => {
                blocks.push(Block::Parallel { steps: vec![step.clone()] });
            }
            (None, _) => {
                blocks.push(Block::Sequential(step.clone()));
            }
        }
    }
    blocks
}

impl ChainExecutor {
    pub fn new(manager: Arc<ConnectionManager>, sink: Arc<dyn EventSink>) -> Self {
        Self { manager, sink }
    }

    pub async fn execute(
        &self,
        execution_id: String,
        mut definition: ChainDefinition,
    ) -> Result<ChainResult, HubError> {
        definition.assign_generated_ids();
        let write_operations = self.validate(&definition).await?;
        if !write_operations.is_empty() && !definition.approval_granted {
            return Ok(ChainResult::RequiresApproval { write_operations });
        }

        let rollback_on_error = definition.rollback_on_error;
        let blocks = group_into_blocks(&definition.steps);
        let steps_by_id: BTreeMap<String, ChainStep> =
            definition.steps.into_iter().map(|s| (s.id.clone(), s)).collect();
        let mut ctx = ChainContext::new(definition.variables);
        let mut completed_order: Vec<String> = Vec::new();
        let mut aborted = false;

        self.sink.emit(
            Event::new(EventKind::ChainStart, json!({ "steps": steps_by_id.len() }))
                .with_execution(execution_id.clone()),
        );

        'blocks: for block in blocks {
            match block {
                Block::Sequential(step) => {
                    let should_abort = self.run_step(&step, &mut ctx, &execution_id).await;
                    completed_order.push(step.id.clone());
                    if should_abort {
                        aborted = true;
                        break 'blocks;
                    }
                }
                Block::Parallel { steps } => {
                    let semaphore = Arc::new(Semaphore::new(MAX_PARALLEL));
                    let mut handles = Vec::new();
                    for step in steps {
                        let permit = semaphore.clone();
                        let ctx_snapshot = ctx.clone();
                        let this = self.clone_refs();
                        let execution_id = execution_id.clone();
                        handles.push(tokio::spawn(async move {
                            let _permit = permit.acquire_owned().await.ok();
                            this.run_step_owned(step, ctx_snapshot, execution_id).await
                        }));
                    }
                    let mut any_abort = false;
                    for handle in handles {
                        if let Ok((step_id, result, should_abort)) = handle.await {
                            completed_order.push(step_id);
                            ctx.record(result);
                            if should_abort {
                                any_abort = true;
                            }
                        }
                    }
                    if any_abort {
                        aborted = true;
                        break 'blocks;
                    }
                }
            }
        }

        if aborted && rollback_on_error {
            self.rollback(&steps_by_id, &completed_order, &ctx).await;
        }

        self.sink.emit(
            Event::new(EventKind::ChainComplete, json!({ "aborted": aborted, "steps_run": ctx.results.len() }))
                .with_execution(execution_id.clone()),
        );

        Ok(ChainResult::Completed(ChainOutcome {
            execution_id,
            aborted,
            steps: ctx.results.into_values().collect(),
        }))
    }

    fn clone_refs(&self) -> Self {
        Self { manager: self.manager.clone(), sink: self.sink.clone() }
    }

    /// Phase 1: structural limits, duplicate ids, recursion guard, unknown
    /// backend/tool, and write-operation detection from each tool's own
    /// annotations. Returns the namespaced `server:tool` write operations
    /// still pending approval (empty if the chain is all reads, or every
    /// write is already in its backend's `auto_approve` allowlist).
    async fn validate(&self, definition: &ChainDefinition) -> Result<Vec<String>, HubError> {
        if definition.steps.is_empty() {
            return Err(HubError::InvalidParams("chain must contain at least one step".into()));
        }
        if definition.steps.len() > MAX_STEPS {
            return Err(HubError::ResourceExceeded(format!("chain exceeds {MAX_STEPS} steps")));
        }

        let mut seen_ids = HashSet::new();
        let mut write_operations = Vec::new();
        for step in &definition.steps {
            if !seen_ids.insert(step.id.clone()) {
                return Err(HubError::InvalidParams(format!("duplicate step id '{}'", step.id)));
            }
            let arg_bytes = serde_json::to_vec(&step.arguments).map(|v| v.len()).unwrap_or(0);
            if arg_bytes > MAX_ARG_BYTES {
                return Err(HubError::ResourceExceeded(format!(
                    "step '{}' arguments exceed {MAX_ARG_BYTES} bytes",
                    step.id
                )));
            }
            if step.tool_name == crate::meta_tools::CALL_TOOL_CHAIN {
                return Err(HubError::InvalidParams(
                    "Call_Tool_Chain cannot be invoked recursively from within a chain step".into(),
                ));
            }

            let connection = self.manager.get(&step.server_name).await?;
            let tool = connection
                .tools()
                .await
                .into_iter()
                .find(|t| t.name == step.tool_name)
                .ok_or_else(|| HubError::UnknownCapability(format!("{}:{}", step.server_name, step.tool_name)))?;

            let backend_config = connection.config().await;
            let pre_approved = backend_config.auto_approve.contains(&step.tool_name);
            if is_write_operation(&tool) && !pre_approved {
                write_operations.push(format!("{}:{}", step.server_name, step.tool_name));
            }
        }

        Ok(write_operations)
    }

    async fn run_step(&self, step: &ChainStep, ctx: &mut ChainContext, execution_id: &str) -> bool {
        let (_, result, should_abort) =
            self.run_step_owned(step.clone(), ctx.clone(), execution_id.to_string()).await;
        ctx.record(result);
        should_abort
    }

    /// Runs one step to completion (including retries), emitting a
    /// `tool_start`/`tool_complete` telemetry pair around the call itself
    /// (skipped steps emit neither — they never call out to a backend).
    /// Returns whether this step's outcome should abort the chain.
    async fn run_step_owned(
        &self,
        step: ChainStep,
        ctx: ChainContext,
        execution_id: String,
    ) -> (String, super::StepResult, bool) {
        if let Some(condition) = &step.conditions.execute_if {
            if !evaluate_condition(condition, &ctx) {
                let result = super::StepResult {
                    step_id: step.id.clone(),
                    backend: step.server_name.clone(),
                    tool: step.tool_name.clone(),
                    success: true,
                    skipped: true,
                    value: Value::Null,
                    error: None,
                    duration_ms: 0,
                };
                return (step.id, result, false);
            }
        }

        self.sink.emit(
            Event::new(
                EventKind::ToolStart,
                json!({
                    "executionId": execution_id,
                    "stepId": step.id,
                    "backend": step.server_name,
                    "tool": step.tool_name,
                }),
            )
            .with_execution(execution_id.clone())
            .with_backend(step.server_name.clone()),
        );

        let started = tokio::time::Instant::now();
        let mut attempts_left = step.retry.max_attempts + 1;
        let mut last_err: Option<HubError> = None;
        let outcome = loop {
            match self.call(&step, &ctx).await {
                Ok(value) => break Ok(value),
                Err(err) => {
                    last_err = Some(err);
                    attempts_left -= 1;
                    if attempts_left == 0 {
                        break Err(());
                    }
                    tokio::time::sleep(Duration::from_millis(step.retry.backoff_ms)).await;
                }
            }
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        let (result, success, error_code) = match outcome {
            Ok(value) => {
                let value = step.transformations.iter().fold(value, |acc, spec| transform::apply(spec, &acc, &ctx));
                let result = super::StepResult {
                    step_id: step.id.clone(),
                    backend: step.server_name.clone(),
                    tool: step.tool_name.clone(),
                    success: true,
                    skipped: false,
                    value,
                    error: None,
                    duration_ms,
                };
                (result, true, None)
            }
            Err(()) => {
                let message = last_err.map(|e| e.upstream_message()).unwrap_or_default();
                let result = super::StepResult {
                    step_id: step.id.clone(),
                    backend: step.server_name.clone(),
                    tool: step.tool_name.clone(),
                    success: false,
                    skipped: false,
                    value: Value::Null,
                    error: Some(message.clone()),
                    duration_ms,
                };
                (result, false, Some(message))
            }
        };

        self.sink.emit(
            Event::new(
                EventKind::ToolComplete,
                json!({
                    "executionId": execution_id,
                    "stepId": step.id,
                    "backend": step.server_name,
                    "tool": step.tool_name,
                    "durationMs": duration_ms,
                    "success": success,
                    "errorCode": error_code,
                }),
            )
            .with_execution(execution_id.clone())
            .with_backend(step.server_name.clone()),
        );

        let should_abort = !success && !step.conditions.skip_on_error;
        (step.id, result, should_abort)
    }

    async fn call(&self, step: &ChainStep, ctx: &ChainContext) -> Result<Value, HubError> {
        let connection = self.manager.get(&step.server_name).await?;
        let arguments = prepare_arguments(step, ctx);
        let params = rmcp::model::CallToolRequestParam {
            name: step.tool_name.clone().into(),
            arguments: arguments.as_object().cloned(),
        };
        let result = connection.call_tool(params).await?;
        serde_json::to_value(result).map_err(|err| HubError::Internal(err.to_string()))
    }

    /// Phase 4: best-effort rollback. Fires `rollback_action` calls for
    /// steps that completed successfully, in reverse order, swallowing
    /// errors (a failed compensation is logged, never re-aborts the chain).
    async fn rollback(&self, steps_by_id: &BTreeMap<String, ChainStep>, completed: &[String], ctx: &ChainContext) {
        for step_id in completed.iter().rev() {
            let Some(step) = steps_by_id.get(step_id) else { continue };
            let Some(compensation) = &step.rollback_action else { continue };
            let Some(result) = ctx.results.get(step_id) else { continue };
            if !result.success {
                continue;
            }
            let Ok(connection) = self.manager.get(&compensation.server_name).await else { continue };
            let params = rmcp::model::CallToolRequestParam {
                name: compensation.tool_name.clone().into(),
                arguments: compensation.arguments.as_object().cloned(),
            };
            if let Err(err) = connection.call_tool(params).await {
                tracing::warn!(step = %step_id, error = %err, "chain rollback compensation failed");
            }
        }
    }
}

/// A tool with no `readOnlyHint`/`read_only_hint` annotation is treated as a
/// write, matching the conservative default a caller without annotation
/// access would have to make.
fn is_write_operation(tool: &rmcp::model::Tool) -> bool {
    let value = serde_json::to_value(tool).unwrap_or(Value::Null);
    let read_only = value
        .get("annotations")
        .and_then(|a| a.get("readOnlyHint").or_else(|| a.get("read_only_hint")))
        .and_then(Value::as_bool);
    !read_only.unwrap_or(false)
}

/// Phase 3 step 2, "Prepare arguments": start from `step.arguments`, apply
/// `input_mapping` (explicit `{targetKey: sourcePath}` pulls against
/// `PREV`/`VARS`/`<stepId>` paths), then substitute `{{VARS.name}}` in any
/// remaining string leaf. This is the only path a chain step has into
/// `PREV`/`<stepId>` data — richer than a bare variable reference must go
/// through `input_mapping`, by design.
fn prepare_arguments(step: &ChainStep, ctx: &ChainContext) -> Value {
    let mut arguments = step.arguments.clone();
    if let Value::Object(map) = &mut arguments {
        for (target_key, source_path) in &step.input_mapping {
            if let Some(value) = resolve_path(source_path, ctx) {
                map.insert(target_key.clone(), value);
            }
        }
    }
    substitute_vars(&arguments, ctx)
}

fn substitute_vars(value: &Value, ctx: &ChainContext) -> Value {
    match value {
        Value::String(s) => substitute_vars_in_string(s, ctx),
        Value::Object(map) => {
            Value::Object(map.iter().map(|(k, v)| (k.clone(), substitute_vars(v, ctx))).collect())
        }
        Value::Array(items) => Value::Array(items.iter().map(|v| substitute_vars(v, ctx)).collect()),
        other => other.clone(),
    }
}

/// A string leaf that is *exactly* one `{{VARS.name}}` reference is replaced
/// by the variable's raw JSON value (preserving its type); any other string
/// gets textual substitution, with unresolved or non-`VARS` placeholders
/// left untouched rather than silently blanked.
fn substitute_vars_in_string(s: &str, ctx: &ChainContext) -> Value {
    if let Some(name) = whole_var_reference(s.trim()) {
        if let Some(value) = ctx.variables.get(name) {
            return value.clone();
        }
    }

    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(start) = rest.find("{{") {
        let Some(end_rel) = rest[start..].find("}}") else {
            out.push_str(rest);
            return Value::String(out);
        };
        let end = start + end_rel;
        let path = rest[start + 2..end].trim();
        match path.strip_prefix("VARS.").and_then(|name| ctx.variables.get(name)) {
            Some(value) => {
                out.push_str(&rest[..start]);
                out.push_str(&scalar_to_string(value));
            }
            None => out.push_str(&rest[..end + 2]),
        }
        rest = &rest[end + 2..];
    }
    out.push_str(rest);
    Value::String(out)
}

fn whole_var_reference(s: &str) -> Option<&str> {
    s.strip_prefix("{{VARS.")?.strip_suffix("}}")
}

fn scalar_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{Conditions, RetryPolicy};
    use std::collections::BTreeMap;

    fn step(id: &str, parallel_group: Option<&str>) -> ChainStep {
        ChainStep {
            id: id.into(),
            server_name: "svc".into(),
            tool_name: "noop".into(),
            arguments: Value::Null,
            input_mapping: BTreeMap::new(),
            transformations: Vec::new(),
            conditions: Conditions::default(),
            retry: RetryPolicy::default(),
            parallel_group: parallel_group.map(str::to_string),
            rollback_action: None,
        }
    }

    #[test]
    fn bare_steps_each_form_their_own_sequential_block() {
        let steps = vec![step("a", None), step("b", None)];
        let blocks = group_into_blocks(&steps);
        assert_eq!(blocks.len(), 2);
        assert!(blocks.iter().all(|b| matches!(b, Block::Sequential(_))));
    }

    #[test]
    fn consecutive_same_group_steps_form_one_parallel_block() {
        let steps = vec![step("a", Some("g1")), step("b", Some("g1")), step("c", Some("g1"))];
        let blocks = group_into_blocks(&steps);
        assert_eq!(blocks.len(), 1);
        match &blocks[0] {
            Block::Parallel { steps } => assert_eq!(steps.len(), 3),
            _ => panic!("expected one parallel block"),
        }
    }

    #[test]
    fn two_distinct_parallel_groups_stay_separate_blocks_even_when_adjacent() {
        // Scenario: a chain with two independent parallel fan-outs back to
        // back must not be merged into a single semaphore-bounded batch —
        // the second group only starts once the first has fully finished.
        let steps = vec![step("a", Some("g1")), step("b", Some("g1")), step("c", Some("g2")), step("d", Some("g2"))];
        let blocks = group_into_blocks(&steps);
        assert_eq!(blocks.len(), 2);
        for block in &blocks {
            match block {
                Block::Parallel { steps } => assert_eq!(steps.len(), 2),
                _ => panic!("expected parallel blocks"),
            }
        }
    }

    #[test]
    fn non_adjacent_occurrences_of_the_same_group_id_stay_separate_blocks() {
        let steps = vec![step("a", Some("g1")), step("mid", None), step("b", Some("g1"))];
        let blocks = group_into_blocks(&steps);
        assert_eq!(blocks.len(), 3);
    }

    #[test]
    fn whole_string_var_reference_preserves_value_type() {
        let mut ctx = ChainContext::new(BTreeMap::new());
        ctx.variables.insert("limit".into(), Value::from(5));
        let resolved = substitute_vars_in_string("{{VARS.limit}}", &ctx);
        assert_eq!(resolved, Value::from(5));
    }

    #[test]
    fn embedded_var_reference_renders_as_text() {
        let mut ctx = ChainContext::new(BTreeMap::new());
        ctx.variables.insert("name".into(), Value::String("world".into()));
        let resolved = substitute_vars_in_string("hello {{VARS.name}}", &ctx);
        assert_eq!(resolved, Value::String("hello world".into()));
    }

    #[test]
    fn non_vars_placeholder_is_left_untouched() {
        let ctx = ChainContext::new(BTreeMap::new());
        let resolved = substitute_vars_in_string("{{PREV.body}}", &ctx);
        assert_eq!(resolved, Value::String("{{PREV.body}}".into()));
    }

    #[test]
    fn input_mapping_pulls_from_a_previous_step() {
        let mut ctx = ChainContext::new(BTreeMap::new());
        ctx.record(crate::chain::StepResult {
            step_id: "read".into(),
            backend: "fs".into(),
            tool: "read_file".into(),
            success: true,
            skipped: false,
            value: json!({"content": [{"type": "text", "text": "hello"}]}),
            error: None,
            duration_ms: 1,
        });
        let mut step = step("write", None);
        step.arguments = json!({"path": "/tmp/out"});
        step.input_mapping.insert("body".into(), "read.content.0.text".into());
        let prepared = prepare_arguments(&step, &ctx);
        assert_eq!(prepared["body"], Value::String("hello".into()));
        assert_eq!(prepared["path"], Value::String("/tmp/out".into()));
    }
}
