// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The parallel harness (C7, §4.6): one agent per parallel-batch item at a
//! given order level, with bounded-concurrency fan-out/fan-in and a single
//! merged `apply()` per batch.

use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::agent::Agent;
use crate::apply::apply;
use crate::inspect::{inspect, InspectOptions};
use crate::model::{Issue, ParsedForm, Patch};
use crate::plan::{plan, ItemType, PlanItem};
use crate::serialize::{markdown_sha256, FormSerializer};

use super::serial::{SessionTurn, TurnAfter};
use super::HarnessConfig;

pub type CallbackFn = Arc<dyn Fn(&str) + Send + Sync>;

/// Lifecycle callbacks (§4.6 step 4). Every invocation is isolated with
/// `catch_unwind` so a buggy observer cannot destabilize the fill (§9).
#[derive(Default, Clone)]
pub struct ParallelCallbacks {
    pub on_order_level_start: Option<CallbackFn>,
    pub on_order_level_complete: Option<CallbackFn>,
    pub on_batch_start: Option<CallbackFn>,
    pub on_batch_complete: Option<CallbackFn>,
}

fn safe_call(cb: &Option<CallbackFn>, arg: &str) {
    if let Some(f) = cb {
        let f = f.clone();
        let arg = arg.to_string();
        if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| f(&arg))).is_err() {
            tracing::warn!("a parallel-harness callback panicked; ignoring");
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionThreadTurn {
    pub execution_id: String,
    pub turn: SessionTurn,
}

#[derive(Debug, Default)]
pub struct ParallelRunResult {
    pub turns: Vec<ExecutionThreadTurn>,
    pub order_levels: Vec<i64>,
    pub execution_threads: Vec<String>,
}

fn field_ids_for_item(form: &ParsedForm, item: &PlanItem) -> Vec<String> {
    match item.item_type {
        ItemType::Field => vec![item.item_id.clone()],
        ItemType::Group => form
            .schema
            .groups
            .iter()
            .find(|g| g.id == item.item_id)
            .map(|g| g.fields.iter().map(|f| f.id.clone()).collect())
            .unwrap_or_default(),
    }
}

/// Scope issues to an item's field ids; form-scoped issues are dropped (they
/// are not per-agent) (§4.6 scoping rule).
fn scope_issues(issues: &[Issue], field_ids: &[String]) -> Vec<Issue> {
    issues
        .iter()
        .filter(|i| !matches!(i.scope, crate::model::IssueScope::Form) && field_ids.iter().any(|f| f == i.field_id()))
        .cloned()
        .collect()
}

fn snapshot_after(form: &ParsedForm, serializer: &dyn FormSerializer, required_issue_count: usize) -> TurnAfter {
    let text = serializer.serialize(form);
    let answered = form
        .responses_by_field_id
        .values()
        .filter(|r| r.state == crate::model::ResponseState::Answered)
        .count();
    let skipped = form
        .responses_by_field_id
        .values()
        .filter(|r| r.state == crate::model::ResponseState::Skipped)
        .count();
    TurnAfter {
        required_issue_count,
        markdown_sha256: markdown_sha256(&text),
        answered_field_count: answered,
        skipped_field_count: skipped,
    }
}

/// Run the parallel harness to completion over every order level.
///
/// Mutations from order level N are fully visible before any agent at level
/// N+1 starts; within a batch, sibling agents see the pre-batch form and
/// conflicts surface as rejections at merge time (§4.6 ordering guarantees).
pub async fn run(
    form: &mut ParsedForm,
    config: &HarnessConfig,
    primary_agent: Arc<dyn Agent>,
    agent_factory: Option<Arc<dyn Fn() -> Arc<dyn Agent> + Send + Sync>>,
    callbacks: &ParallelCallbacks,
    serializer: Arc<dyn FormSerializer>,
) -> ParallelRunResult {
    let execution_plan = plan(form);
    let mut result = ParallelRunResult::default();
    let mut turn_counter: u32 = 0;

    for level in execution_plan.order_levels {
        let order_str = level.order.to_string();
        safe_call(&callbacks.on_order_level_start, &order_str);
        result.order_levels.push(level.order);

        for item in &level.loose_serial {
            let inspected = inspect(form, &InspectOptions { target_roles: Some(config.target_roles.clone()) });
            let field_ids = field_ids_for_item(form, item);
            let scoped = scope_issues(&inspected.issues, &field_ids);
            if scoped.is_empty() {
                continue;
            }
            let execution_id = format!("{}-serial-{}", level.order, item.item_id);
            let response = primary_agent
                .fill_form_tool(&scoped, form, config.max_patches_per_turn as usize, None)
                .await;
            let patches: Vec<Patch> = response.map(|r| r.patches).unwrap_or_default();
            let apply_result = apply(form, &patches);
            turn_counter += 1;
            let reinspected = inspect(form, &InspectOptions { target_roles: Some(config.target_roles.clone()) });
            let after = snapshot_after(form, serializer.as_ref(), reinspected.progress_summary.required_issue_count);
            result.execution_threads.push(execution_id.clone());
            result.turns.push(ExecutionThreadTurn {
                execution_id,
                turn: SessionTurn {
                    turn: turn_counter,
                    inspected_issues: scoped,
                    applied_patches: apply_result.applied,
                    rejected_patches: apply_result.rejected,
                    warnings: apply_result.warnings,
                    after,
                    llm_stats: None,
                },
            });
        }

        for batch in &level.parallel_batches {
            safe_call(&callbacks.on_batch_start, &batch.batch_id);

            let pre_batch_form = form.clone();
            let inspected = inspect(&pre_batch_form, &InspectOptions { target_roles: Some(config.target_roles.clone()) });
            let semaphore = Arc::new(Semaphore::new(config.max_parallel_agents.max(1) as usize));

            let mut handles = Vec::new();
            for (idx, item) in batch.items.iter().enumerate() {
                let field_ids = field_ids_for_item(&pre_batch_form, item);
                let scoped = scope_issues(&inspected.issues, &field_ids);
                let agent = agent_factory.as_ref().map(|f| f()).unwrap_or_else(|| primary_agent.clone());
                let form_snapshot = pre_batch_form.clone();
                let permit_source = semaphore.clone();
                let execution_id = format!("{}-batch-{}-{}", level.order, batch.batch_id, idx);
                let max_patches = config.max_patches_per_turn as usize;

                handles.push(tokio::spawn(async move {
                    let _permit = permit_source.acquire_owned().await.expect("semaphore never closed");
                    let outcome = agent.fill_form_tool(&scoped, &form_snapshot, max_patches, None).await;
                    (execution_id, scoped, outcome)
                }));
            }

            let mut merged_patches = Vec::new();
            let mut per_thread: Vec<(String, Vec<Issue>)> = Vec::new();
            for handle in handles {
                match handle.await {
                    Ok((execution_id, scoped, Ok(response))) => {
                        merged_patches.extend(response.patches);
                        per_thread.push((execution_id, scoped));
                    }
                    Ok((execution_id, scoped, Err(e))) => {
                        tracing::warn!(execution_id, error = %e, "agent failed in parallel batch; continuing");
                        per_thread.push((execution_id, scoped));
                    }
                    Err(join_err) => {
                        tracing::warn!(error = %join_err, "parallel agent task panicked");
                    }
                }
            }

            let apply_result = apply(form, &merged_patches);
            turn_counter += 1;
            let reinspected = inspect(form, &InspectOptions { target_roles: Some(config.target_roles.clone()) });
            let after = snapshot_after(form, serializer.as_ref(), reinspected.progress_summary.required_issue_count);

            for (execution_id, scoped) in per_thread {
                result.execution_threads.push(execution_id.clone());
                result.turns.push(ExecutionThreadTurn {
                    execution_id,
                    turn: SessionTurn {
                        turn: turn_counter,
                        inspected_issues: scoped,
                        applied_patches: apply_result.applied.clone(),
                        rejected_patches: apply_result.rejected.clone(),
                        warnings: apply_result.warnings.clone(),
                        after: after.clone(),
                        llm_stats: None,
                    },
                });
            }

            safe_call(&callbacks.on_batch_complete, &batch.batch_id);
        }

        safe_call(&callbacks.on_order_level_complete, &order_str);
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{Agent, AgentResponse};
    use crate::model::{Field, FieldKind, FormMetadata, Group, PatchRejection, Schema};
    use crate::serialize::JsonFormSerializer;
    use async_trait::async_trait;

    struct EchoAgent;

    #[async_trait]
    impl Agent for EchoAgent {
        async fn fill_form_tool(
            &self,
            issues: &[Issue],
            _form: &ParsedForm,
            _max_patches: usize,
            _previous_rejections: Option<&[PatchRejection]>,
        ) -> anyhow::Result<AgentResponse> {
            let patches = issues
                .iter()
                .map(|i| Patch::SetString { field_id: i.field_id().to_string(), value: Some("x".into()) })
                .collect();
            Ok(AgentResponse { patches, stats: None })
        }
    }

    fn scenario_d_form() -> ParsedForm {
        let f = |id: &str, order: i64, batch: Option<&str>| Field {
            id: id.into(),
            label: id.into(),
            kind: FieldKind::String { min_length: None, max_length: None, pattern: None },
            role: "agent".into(),
            required: true,
            order,
            parallel_batch: batch.map(|s| s.to_string()),
        };
        let schema = Schema {
            id: "f".into(),
            title: "t".into(),
            description: None,
            groups: vec![Group {
                id: "g".into(),
                title: "g".into(),
                implicit: false,
                fields: vec![f("a", 0, None), f("b", 1, Some("x")), f("c", 1, Some("x")), f("d", 2, None)],
            }],
        };
        ParsedForm::new(schema, vec![], vec![], FormMetadata::default())
    }

    #[tokio::test]
    async fn scenario_d_produces_expected_order_levels_and_threads() {
        let mut form = scenario_d_form();
        let config = HarnessConfig { max_parallel_agents: 2, ..HarnessConfig::default() };
        let result = run(
            &mut form,
            &config,
            Arc::new(EchoAgent),
            None,
            &ParallelCallbacks::default(),
            Arc::new(JsonFormSerializer),
        )
        .await;

        assert_eq!(result.order_levels, vec![0, 1, 2]);
        assert!(result.execution_threads.contains(&"1-batch-x-0".to_string()));
        assert!(result.execution_threads.contains(&"1-batch-x-1".to_string()));
        assert_eq!(form.responses_by_field_id["a"].state, crate::model::ResponseState::Answered);
        assert_eq!(form.responses_by_field_id["b"].state, crate::model::ResponseState::Answered);
        assert_eq!(form.responses_by_field_id["d"].state, crate::model::ResponseState::Answered);
    }

    #[tokio::test]
    async fn max_parallel_agents_one_behaves_like_serial_within_a_batch() {
        let mut form = scenario_d_form();
        let config = HarnessConfig { max_parallel_agents: 1, ..HarnessConfig::default() };
        let result = run(
            &mut form,
            &config,
            Arc::new(EchoAgent),
            None,
            &ParallelCallbacks::default(),
            Arc::new(JsonFormSerializer),
        )
        .await;
        assert_eq!(form.responses_by_field_id["b"].state, crate::model::ResponseState::Answered);
        assert_eq!(form.responses_by_field_id["c"].state, crate::model::ResponseState::Answered);
        assert_eq!(result.order_levels, vec![0, 1, 2]);
    }
}
