// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! `fillForm` (C9, §4.8): the public entry point. Wires the harness, the
//! agent, input-context coercion, cancellation and the `FillRecord`
//! collector together into one call.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value as Json;

use markform_model::LanguageModel;

use crate::agent::{Agent, LiveAgent, LiveAgentConfig};
use crate::coerce::coerce_input_context;
use crate::error::FillError;
use crate::harness::parallel::{self, ParallelCallbacks};
use crate::harness::serial::{SerialHarness, SessionTurn};
use crate::harness::{FillMode, HarnessConfig};
use crate::model::{Issue, ParsedForm, PatchWarning};
use crate::record::{FillRecord, FillRecordCollector, FormProgress, FillStatusKind};
use crate::serialize::{FormSerializer, JsonFormSerializer};

/// Cooperative cancellation token, checked at defined suspension points
/// between turns (§5, §9 "cooperative cancellation").
#[derive(Clone, Default)]
pub struct CancellationSignal(Arc<AtomicBool>);

impl CancellationSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub type TurnCallback = Arc<dyn Fn(&SessionTurn) + Send + Sync>;

#[derive(Clone, Default)]
pub struct FillCallbacks {
    pub on_turn: Option<TurnCallback>,
    pub parallel: ParallelCallbacks,
}

/// Options accepted by [`fill_form`] (§4.8).
pub struct FillOptions {
    pub form: ParsedForm,

    /// `"provider/modelId"`, resolved against `providers` below. Ignored
    /// when `test_agent` is set.
    pub model: Option<String>,
    /// Language-model instances the caller has already constructed, keyed
    /// by provider id. Building provider wire adapters is out of scope
    /// (§1) — callers plug them in here.
    pub providers: HashMap<String, Arc<dyn LanguageModel>>,
    pub enable_web_search: bool,
    pub capture_wire_format: bool,
    pub record_fill: bool,

    pub max_turns_total: u32,
    pub max_turns_this_call: Option<u32>,
    pub starting_turn_number: u32,
    pub max_patches_per_turn: u32,
    pub max_issues_per_turn: u32,
    pub max_steps_per_turn: u32,

    pub target_roles: Vec<String>,
    pub fill_mode: FillMode,
    pub enable_parallel: bool,
    pub max_parallel_agents: u32,
    pub input_context: Option<HashMap<String, Json>>,
    pub system_prompt_addition: Option<String>,
    pub additional_tools: Vec<markform_model::ToolSchema>,
    pub callbacks: FillCallbacks,
    pub signal: Option<CancellationSignal>,
    pub serializer: Option<Arc<dyn FormSerializer>>,

    /// Test hook: bypass model resolution entirely and drive the harness
    /// with a caller-supplied agent (§4.8, used by `MockAgent` /
    /// `RejectionRecoveryMockAgent` in tests).
    pub test_agent: Option<Arc<dyn Agent>>,
}

impl Default for FillOptions {
    fn default() -> Self {
        Self {
            form: ParsedForm::new(
                crate::model::Schema { id: "empty".into(), title: "empty".into(), description: None, groups: vec![] },
                vec![],
                vec![],
                Default::default(),
            ),
            model: None,
            providers: HashMap::new(),
            enable_web_search: false,
            capture_wire_format: false,
            record_fill: false,
            max_turns_total: 100,
            max_turns_this_call: None,
            starting_turn_number: 0,
            max_patches_per_turn: 20,
            max_issues_per_turn: 20,
            max_steps_per_turn: 4,
            target_roles: vec!["agent".to_string()],
            fill_mode: FillMode::Continue,
            enable_parallel: false,
            max_parallel_agents: 4,
            input_context: None,
            system_prompt_addition: None,
            additional_tools: Vec::new(),
            callbacks: FillCallbacks::default(),
            signal: None,
            serializer: None,
            test_agent: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillStatus {
    Completed,
    Partial,
    Cancelled,
}

/// Why a fill stopped (§4.8, §7). Distinguishes the `maxTurnsThisCall`
/// per-call budget — resumable via `startingTurnNumber` — from the
/// `maxTurnsTotal` hard cap, which is not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillStopReason {
    Completed,
    MaxTurns,
    BatchLimit,
    Cancelled,
}

pub struct FillResult {
    pub status: FillStatus,
    pub stop_reason: FillStopReason,
    pub markdown: String,
    pub form: ParsedForm,
    pub turns: Vec<SessionTurn>,
    pub total_patches: usize,
    pub input_context_warnings: Vec<PatchWarning>,
    pub remaining_issues: Vec<Issue>,
    pub record: Option<FillRecord>,
}

fn parse_model_spec(s: &str) -> Result<(&str, &str), FillError> {
    s.split_once('/')
        .ok_or_else(|| FillError::configuration(format!("model id '{s}' must be formatted as 'provider/modelId'")))
}

/// Resolve the agent that will drive this fill (§4.8 step 2). Fails fast on
/// missing configuration, before any form mutation or LLM call, per §7.
fn resolve_agent(options: &FillOptions) -> Result<Arc<dyn Agent>, FillError> {
    if let Some(agent) = &options.test_agent {
        return Ok(agent.clone());
    }

    let spec = options
        .model
        .as_deref()
        .ok_or_else(|| FillError::configuration("fillForm requires either `model` or `_testAgent`"))?;
    let (provider_id, _model_id) = parse_model_spec(spec)?;

    let driver = markform_model::get_driver(provider_id)
        .ok_or_else(|| FillError::configuration(format!("unknown model provider '{provider_id}'")))?;

    if let Some(env_var) = driver.default_api_key_env {
        std::env::var(env_var)
            .map_err(|_| FillError::configuration(format!("{env_var} is not set for provider '{provider_id}'")))?;
    }

    let model = options
        .providers
        .get(provider_id)
        .cloned()
        .ok_or_else(|| FillError::configuration(format!("no LanguageModel registered for provider '{provider_id}'")))?;

    Ok(Arc::new(LiveAgent::new(
        model,
        LiveAgentConfig {
            enable_web_search: options.enable_web_search,
            max_steps_per_turn: options.max_steps_per_turn,
            tool_choice: markform_model::ToolChoice::Required,
            max_retries: 3,
            system_prompt_addition: options.system_prompt_addition.clone(),
            additional_tools: options.additional_tools.clone(),
        },
    )))
}

fn build_harness_config(options: &FillOptions) -> HarnessConfig {
    // Caller options > form metadata overrides > defaults (§4.8 step 3).
    let form_override = options.form.metadata.harness_config.clone().unwrap_or_default();
    HarnessConfig {
        max_turns: options.max_turns_total.min(form_override.max_turns.unwrap_or(options.max_turns_total)),
        max_patches_per_turn: form_override.max_patches_per_turn.unwrap_or(options.max_patches_per_turn),
        max_issues_per_turn: form_override.max_issues_per_turn.unwrap_or(options.max_issues_per_turn),
        max_fields_per_turn: 20,
        max_groups_per_turn: 10,
        fill_mode: options.fill_mode,
        target_roles: options.target_roles.clone(),
        max_parallel_agents: options.max_parallel_agents,
    }
}

fn emit_turn(callbacks: &FillCallbacks, turn: &SessionTurn) {
    if let Some(cb) = &callbacks.on_turn {
        let cb = cb.clone();
        let turn = turn.clone();
        if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| cb(&turn))).is_err() {
            tracing::warn!("on_turn callback panicked; ignoring");
        }
    }
}

/// `fillForm(options) -> FillResult` (§4.8). Steps: parse/clone form; resolve
/// the agent; apply `inputContext`; build the harness config; drive the
/// harness to completion or until `maxTurnsThisCall`/cancellation; assemble
/// the result.
pub async fn fill_form(mut options: FillOptions) -> Result<FillResult, FillError> {
    let agent = resolve_agent(&options)?;
    let serializer: Arc<dyn FormSerializer> = options.serializer.take().unwrap_or_else(|| Arc::new(JsonFormSerializer));
    let signal = options.signal.clone().unwrap_or_default();

    let mut input_context_warnings = Vec::new();
    if let Some(mapping) = options.input_context.take() {
        let outcome = coerce_input_context(&options.form, &mapping);
        if !outcome.errors.is_empty() {
            return Err(FillError::Coercion(outcome.errors.join("; ")));
        }
        crate::apply::apply(&mut options.form, &outcome.patches);
        input_context_warnings = outcome.warnings;
    }

    let config = build_harness_config(&options);
    let batch_limit = options.max_turns_this_call.unwrap_or(u32::MAX);
    let started_at = chrono::Utc::now();
    let mut collector = options.record_fill.then(|| FillRecordCollector::new(started_at));

    if options.enable_parallel {
        let mut form = options.form;
        let result = parallel::run(&mut form, &config, agent, None, &options.callbacks.parallel, serializer.clone()).await;

        let execution_ids: Vec<String> = result.turns.iter().map(|t| t.execution_id.clone()).collect();
        let turns: Vec<SessionTurn> = result.turns.into_iter().map(|t| t.turn).collect();
        for (execution_id, turn) in execution_ids.iter().zip(turns.iter()) {
            emit_turn(&options.callbacks, turn);
            if let Some(c) = &mut collector {
                let now = chrono::Utc::now();
                c.on_turn_start(now, execution_id, turn.turn);
                c.on_turn_complete(
                    now,
                    execution_id,
                    turn.turn,
                    turn.inspected_issues.len(),
                    turn.applied_patches.len(),
                    turn.rejected_patches.len(),
                );
            }
        }

        let final_inspect = crate::inspect::inspect(&form, &crate::inspect::InspectOptions { target_roles: Some(config.target_roles.clone()) });
        let total_patches = turns.iter().map(|t| t.applied_patches.len()).sum();
        let markdown = serializer.serialize(&form);
        let (status, stop_reason) = if final_inspect.is_complete {
            (FillStatus::Completed, FillStopReason::Completed)
        } else {
            (FillStatus::Partial, FillStopReason::MaxTurns)
        };

        let record = collector.map(|c| {
            c.get_record(
                FormProgress { answered_fields: final_inspect.progress_summary.answered_fields, unanswered_required: final_inspect.progress_summary.required_issue_count },
                true,
                Some(config.max_parallel_agents),
            )
        });

        return Ok(FillResult {
            status,
            stop_reason,
            markdown,
            form,
            turns,
            total_patches,
            input_context_warnings,
            remaining_issues: final_inspect.issues,
            record,
        });
    }

    let target_roles = config.target_roles.clone();
    let mut harness = SerialHarness::with_serializer(options.form, config, serializer.clone());
    // Resume turn numbering across calls (§4.8 step 7, §8 scenario F).
    harness.set_turn_number(options.starting_turn_number);

    let mut calls_this_batch: u32 = 0;
    let mut cancelled = false;
    let mut stop_reason = FillStopReason::Completed;

    loop {
        let step = harness.step();
        if step.is_complete {
            stop_reason = FillStopReason::Completed;
            break;
        }
        if signal.is_cancelled() {
            cancelled = true;
            stop_reason = FillStopReason::Cancelled;
            break;
        }
        if calls_this_batch >= batch_limit {
            stop_reason = FillStopReason::BatchLimit;
            break;
        }

        let execution_id = "serial";
        if let Some(c) = &mut collector {
            c.on_turn_start(chrono::Utc::now(), execution_id, step.turn_number + 1);
            c.on_llm_call_start(chrono::Utc::now(), execution_id);
        }

        let response = agent.fill_form_tool(&step.issues, harness.form(), step.step_budget, None).await;

        if signal.is_cancelled() {
            cancelled = true;
            stop_reason = FillStopReason::Cancelled;
            break;
        }

        let (patches, stats) = match response {
            Ok(r) => (r.patches, r.stats),
            Err(e) => return Err(FillError::Agent(e.to_string())),
        };

        if let Some(c) = &mut collector {
            c.on_llm_call_end(
                chrono::Utc::now(),
                execution_id,
                stats.as_ref().map(|s| s.input_tokens).unwrap_or(0),
                stats.as_ref().map(|s| s.output_tokens).unwrap_or(0),
            );
        }

        let mut patches = patches;
        patches.truncate(step.step_budget);
        let after = harness.apply_turn(&patches, &step.issues, stats);
        calls_this_batch += 1;

        let turn = harness.turns().last().expect("apply_turn always records a turn");
        emit_turn(&options.callbacks, turn);
        if let Some(c) = &mut collector {
            c.on_turn_complete(
                chrono::Utc::now(),
                execution_id,
                turn.turn,
                turn.inspected_issues.len(),
                turn.applied_patches.len(),
                turn.rejected_patches.len(),
            );
        }

        if after.is_complete {
            stop_reason = FillStopReason::Completed;
            break;
        }
        if harness.has_reached_max_turns() {
            stop_reason = FillStopReason::MaxTurns;
            break;
        }
    }

    let final_inspect = crate::inspect::inspect(harness.form(), &crate::inspect::InspectOptions { target_roles: Some(target_roles) });
    let total_patches = harness.turns().iter().map(|t| t.applied_patches.len()).sum();
    let status = if cancelled {
        FillStatus::Cancelled
    } else if final_inspect.is_complete {
        FillStatus::Completed
    } else {
        FillStatus::Partial
    };

    if let Some(c) = &mut collector {
        c.set_status(if status == FillStatus::Completed { FillStatusKind::Completed } else { FillStatusKind::Partial });
    }

    let turns = harness.turns().to_vec();
    let record = collector.map(|c| {
        c.get_record(
            FormProgress {
                answered_fields: final_inspect.progress_summary.answered_fields,
                unanswered_required: final_inspect.progress_summary.required_issue_count,
            },
            false,
            None,
        )
    });

    let remaining_issues = final_inspect.issues;
    let markdown = serializer.serialize(harness.form());
    let form = harness.into_form();

    Ok(FillResult { status, stop_reason, markdown, form, turns, total_patches, input_context_warnings, remaining_issues, record })
}
