// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Agent abstraction & prompts (C8, §4.7). The contract between the harness
//! and the LLM: `fillFormTool(issues, form, maxPatches, previousRejections)
//! -> {patches, stats?}`. `LiveAgent` drives a real `LanguageModel`;
//! `MockAgent` and `RejectionRecoveryMockAgent` are deterministic test
//! doubles.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;

use markform_model::{CompletionRequest, LanguageModel, Message, ResponseEvent, ToolChoice, ToolSchema};

use crate::model::{CheckboxMode, Field, FieldKind, FieldValue, Issue, ParsedForm, Patch, PatchRejection, ResponseState};

#[derive(Debug, Clone, Default)]
pub struct TurnStats {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub retries: u32,
}

#[derive(Debug, Clone, Default)]
pub struct AgentResponse {
    pub patches: Vec<Patch>,
    pub stats: Option<TurnStats>,
}

/// Contract every agent implementation satisfies (§4.7).
#[async_trait]
pub trait Agent: Send + Sync {
    async fn fill_form_tool(
        &self,
        issues: &[Issue],
        form: &ParsedForm,
        max_patches: usize,
        previous_rejections: Option<&[PatchRejection]>,
    ) -> anyhow::Result<AgentResponse>;
}

// ─── Prompt building ────────────────────────────────────────────────────────

pub const BASE_SYSTEM_PROMPT: &str = "\
You are filling in a structured form. You will be given a list of issues \
describing what still needs attention. Respond only by calling the fill_form \
tool with a batch of patches; do not write prose.";

fn role_instructions_for(form: &ParsedForm, role: &str) -> Option<&str> {
    form.metadata.role_instructions.get(role).map(|s| s.as_str())
}

fn field_instructions(form: &ParsedForm, field_id: &str) -> Option<&str> {
    form.docs.iter().find(|d| d.r#ref == field_id && d.tag == "instructions").map(|d| d.body_markdown.as_str())
}

fn form_level_instructions(form: &ParsedForm) -> Option<&str> {
    form.docs
        .iter()
        .find(|d| d.r#ref == form.schema.id && d.tag == "instructions")
        .map(|d| d.body_markdown.as_str())
}

/// Build the system prompt for a turn: base + form-level + role-specific +
/// per-field instructions for every field referenced by this turn's issues +
/// an optional caller-supplied addition (§4.7a).
pub fn build_system_prompt(form: &ParsedForm, issues: &[Issue], addition: Option<&str>) -> String {
    let mut sections = vec![BASE_SYSTEM_PROMPT.to_string()];

    if let Some(instr) = form_level_instructions(form) {
        sections.push(format!("## Form instructions\n{instr}"));
    }

    let mut roles_seen: Vec<&str> = Vec::new();
    for issue in issues {
        if let Some(field) = form.field(issue.field_id()) {
            if !roles_seen.contains(&field.role.as_str()) {
                roles_seen.push(field.role.as_str());
            }
        }
    }
    for role in roles_seen {
        if let Some(instr) = role_instructions_for(form, role) {
            sections.push(format!("## Role instructions ({role})\n{instr}"));
        }
    }

    let mut fields_seen: Vec<&str> = Vec::new();
    for issue in issues {
        let field_id = issue.field_id();
        if !fields_seen.contains(&field_id) {
            fields_seen.push(field_id);
        }
    }
    for field_id in fields_seen {
        if let Some(instr) = field_instructions(form, field_id) {
            sections.push(format!("## Field instructions ({field_id})\n{instr}"));
        }
    }

    if let Some(addition) = addition {
        sections.push(addition.to_string());
    }

    sections.join("\n\n")
}

fn describe_field_kind(field: &Field) -> String {
    match &field.kind {
        FieldKind::SingleSelect { options } | FieldKind::MultiSelect { options } => {
            let ids: Vec<&str> = options.iter().map(|o| o.id.as_str()).collect();
            format!("{} (options: {})", field.kind.name(), ids.join(", "))
        }
        FieldKind::Checkboxes { options, checkbox_mode, .. } => {
            let ids: Vec<&str> = options.iter().map(|o| o.id.as_str()).collect();
            format!(
                "checkboxes mode={:?} (options: {}; valid states: {})",
                checkbox_mode,
                ids.join(", "),
                alphabet_names(*checkbox_mode).join(", ")
            )
        }
        FieldKind::Table { columns } => {
            let ids: Vec<&str> = columns.iter().map(|c| c.id.as_str()).collect();
            format!("table (columns: {})", ids.join(", "))
        }
        other => other.name().to_string(),
    }
}

fn alphabet_names(mode: CheckboxMode) -> Vec<&'static str> {
    mode.alphabet()
        .iter()
        .map(|s| match s {
            crate::model::CheckboxState::Todo => "todo",
            crate::model::CheckboxState::Done => "done",
            crate::model::CheckboxState::Incomplete => "incomplete",
            crate::model::CheckboxState::Active => "active",
            crate::model::CheckboxState::Na => "na",
            crate::model::CheckboxState::Unfilled => "unfilled",
            crate::model::CheckboxState::Yes => "yes",
            crate::model::CheckboxState::No => "no",
        })
        .collect()
}

/// Build the context prompt enumerating this turn's issues (§4.7b), plus
/// corrective feedback for any rejections from the previous turn.
pub fn build_context_prompt(form: &ParsedForm, issues: &[Issue], previous_rejections: Option<&[PatchRejection]>) -> String {
    let mut lines = vec!["## Issues to address".to_string()];
    for issue in issues {
        let field_kind = form.field(issue.field_id()).map(describe_field_kind);
        let kind_part = field_kind.map(|k| format!(", kind={k}")).unwrap_or_default();
        lines.push(format!(
            "- ref={} scope={:?} severity={:?} priority={}{}: {}",
            issue.r#ref, issue.scope, issue.severity, issue.priority, kind_part, issue.message
        ));
    }

    if let Some(rejections) = previous_rejections {
        if !rejections.is_empty() {
            lines.push("\n## Corrections needed from the previous turn".to_string());
            for rej in rejections {
                let field_kind = rej.field_kind.as_deref().unwrap_or("unknown");
                let expected = rej.expected_format.as_deref().unwrap_or("see field kind");
                lines.push(format!(
                    "- patch op '{}' on field '{}' was rejected: {} (field kind: {field_kind}; expected: {expected})",
                    rej.patch_op,
                    rej.field_id.as_deref().unwrap_or("?"),
                    rej.reason
                ));
            }
        }
    }

    lines.join("\n")
}

/// The `fill_form` tool schema offered to the model (§4.7c).
pub fn fill_form_tool_schema() -> ToolSchema {
    ToolSchema {
        name: "fill_form".to_string(),
        description: "Submit a batch of patches that address the listed issues.".to_string(),
        parameters: serde_json::json!({
            "type": "object",
            "properties": {
                "patches": {
                    "type": "array",
                    "items": { "type": "object" }
                }
            },
            "required": ["patches"]
        }),
    }
}

/// Built-in web-search tool, attached only when `enableWebSearch` is set
/// (§4.7). Results are expected back as a regular tool call the harness's
/// `FillRecordCollector::on_web_search` records; `markform-core` does not
/// execute the search itself (§1).
pub fn web_search_tool_schema() -> ToolSchema {
    ToolSchema {
        name: "web_search".to_string(),
        description: "Search the web for information needed to answer an issue.".to_string(),
        parameters: serde_json::json!({
            "type": "object",
            "properties": {
                "query": { "type": "string" }
            },
            "required": ["query"]
        }),
    }
}

/// Merge caller-supplied tools over the built-ins, custom winning on name
/// collision (§4.7: "custom tools merge over built-ins").
fn merge_tools(base: Vec<ToolSchema>, custom: &[ToolSchema]) -> Vec<ToolSchema> {
    let mut merged: Vec<ToolSchema> = base.into_iter().filter(|b| !custom.iter().any(|c| c.name == b.name)).collect();
    merged.extend(custom.iter().cloned());
    merged
}

#[derive(serde::Deserialize)]
struct PatchesWire {
    patches: Vec<Patch>,
}

// ─── LiveAgent ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct LiveAgentConfig {
    pub enable_web_search: bool,
    pub max_steps_per_turn: u32,
    pub tool_choice: ToolChoice,
    pub max_retries: u32,
    pub system_prompt_addition: Option<String>,
    /// Caller-supplied tools merged over the built-ins, custom winning on
    /// name collision (§4.7).
    pub additional_tools: Vec<ToolSchema>,
}

impl Default for LiveAgentConfig {
    fn default() -> Self {
        Self {
            enable_web_search: false,
            max_steps_per_turn: 4,
            // §4.7, §9: required rather than auto — some models under-use
            // tools with auto and return bare prose, breaking the protocol.
            tool_choice: ToolChoice::Required,
            max_retries: 3,
            system_prompt_addition: None,
            additional_tools: Vec::new(),
        }
    }
}

pub struct LiveAgent {
    model: std::sync::Arc<dyn LanguageModel>,
    config: LiveAgentConfig,
}

impl LiveAgent {
    pub fn new(model: std::sync::Arc<dyn LanguageModel>, config: LiveAgentConfig) -> Self {
        Self { model, config }
    }

    async fn call_with_retries(&self, req: CompletionRequest) -> anyhow::Result<(Vec<Patch>, TurnStats)> {
        let mut attempt = 0;
        loop {
            match self.call_once(req.clone()).await {
                Ok(result) => return Ok(result),
                Err(e) if attempt < self.config.max_retries && is_transient(&e) => {
                    attempt += 1;
                    let backoff_ms = 200u64 * 2u64.pow(attempt) + jitter_ms(attempt);
                    tracing::warn!(attempt, backoff_ms, error = %e, "transient provider error, retrying");
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn call_once(&self, req: CompletionRequest) -> anyhow::Result<(Vec<Patch>, TurnStats)> {
        let mut stream = self.model.complete(req).await?;
        let mut patches = Vec::new();
        let mut stats = TurnStats::default();
        let mut steps = 0u32;
        while let Some(event) = stream.next().await {
            match event? {
                ResponseEvent::ToolCall { name, arguments, .. } if name == "fill_form" => {
                    let wire: PatchesWire = serde_json::from_str(&arguments)
                        .or_else(|_| repair_and_parse(&arguments))
                        .map_err(|e| anyhow::anyhow!("could not parse fill_form arguments: {e}"))?;
                    patches.extend(wire.patches);
                    steps += 1;
                }
                ResponseEvent::Usage(u) => {
                    stats.input_tokens += u.input_tokens;
                    stats.output_tokens += u.output_tokens;
                }
                ResponseEvent::Error(msg) => {
                    tracing::warn!(%msg, "model reported a recoverable error");
                }
                ResponseEvent::TextDelta(_) | ResponseEvent::Done => {}
            }
            if steps >= self.config.max_steps_per_turn {
                break;
            }
        }
        Ok((patches, stats))
    }
}

fn is_transient(e: &anyhow::Error) -> bool {
    let msg = e.to_string();
    msg.contains("429") || msg.contains("503") || msg.contains("timeout")
}

/// Deterministic jitter without a `rand` dependency: hash the attempt number
/// together with a fresh UUID's bytes.
fn jitter_ms(attempt: u32) -> u64 {
    let id = uuid::Uuid::new_v4();
    let b = id.as_bytes();
    let seed = u64::from(b[0]) ^ (u64::from(b[1]) << 8) ^ (u64::from(attempt) << 16);
    seed % 250
}

fn repair_and_parse(raw: &str) -> Result<PatchesWire, serde_json::Error> {
    let fixed = raw.replace(",}", "}").replace(",]", "]");
    serde_json::from_str(&fixed)
}

#[async_trait]
impl Agent for LiveAgent {
    async fn fill_form_tool(
        &self,
        issues: &[Issue],
        form: &ParsedForm,
        max_patches: usize,
        previous_rejections: Option<&[PatchRejection]>,
    ) -> anyhow::Result<AgentResponse> {
        let system = build_system_prompt(form, issues, self.config.system_prompt_addition.as_deref());
        let context = build_context_prompt(form, issues, previous_rejections);

        let mut base_tools = vec![fill_form_tool_schema()];
        if self.config.enable_web_search {
            base_tools.push(web_search_tool_schema());
        }
        let tools = merge_tools(base_tools, &self.config.additional_tools);

        let req = CompletionRequest {
            messages: vec![Message::system(system), Message::user(context)],
            tools,
            tool_choice: self.config.tool_choice,
        };

        let (mut patches, stats) = self.call_with_retries(req).await?;
        patches.truncate(max_patches);
        Ok(AgentResponse { patches, stats: Some(stats) })
    }
}

// ─── MockAgent ──────────────────────────────────────────────────────────────

/// Constructed from a pre-filled "completed" form. For each incoming issue,
/// emits the patch that reproduces the completed value, or `skip_field` for
/// empty optional fields (§4.7). Deterministic; no `stats`.
pub struct MockAgent {
    completed: ParsedForm,
}

impl MockAgent {
    pub fn from_completed(completed: ParsedForm) -> Self {
        Self { completed }
    }

    fn patch_for(&self, field_id: &str) -> Option<Patch> {
        let response = self.completed.responses_by_field_id.get(field_id)?;
        let field = self.completed.field(field_id)?;
        match (&response.state, &response.value) {
            (ResponseState::Answered, Some(value)) => Some(value_to_patch(field_id, value)),
            _ if !field.required => Some(Patch::SkipField { field_id: field_id.to_string(), reason: None }),
            _ => None,
        }
    }
}

fn value_to_patch(field_id: &str, value: &FieldValue) -> Patch {
    let field_id = field_id.to_string();
    match value.clone() {
        FieldValue::String { value } => Patch::SetString { field_id, value },
        FieldValue::Number { value } => Patch::SetNumber { field_id, value },
        FieldValue::StringList { items } => Patch::SetStringList { field_id, items },
        FieldValue::Url { value } => Patch::SetUrl { field_id, value },
        FieldValue::UrlList { items } => Patch::SetUrlList { field_id, items },
        FieldValue::SingleSelect { selected } => Patch::SetSingleSelect { field_id, selected },
        FieldValue::MultiSelect { selected } => Patch::SetMultiSelect { field_id, selected },
        FieldValue::Checkboxes { values } => Patch::SetCheckboxes { field_id, values },
        FieldValue::Table { rows } => Patch::SetTable { field_id, rows },
        FieldValue::Date { value } => Patch::SetDate { field_id, value },
        FieldValue::Year { value } => Patch::SetYear { field_id, value },
    }
}

#[async_trait]
impl Agent for MockAgent {
    async fn fill_form_tool(
        &self,
        issues: &[Issue],
        _form: &ParsedForm,
        max_patches: usize,
        _previous_rejections: Option<&[PatchRejection]>,
    ) -> anyhow::Result<AgentResponse> {
        let mut seen = std::collections::HashSet::new();
        let mut patches = Vec::new();
        for issue in issues {
            let field_id = issue.field_id();
            if !seen.insert(field_id.to_string()) {
                continue;
            }
            if let Some(patch) = self.patch_for(field_id) {
                patches.push(patch);
            }
            if patches.len() >= max_patches {
                break;
            }
        }
        Ok(AgentResponse { patches, stats: None })
    }
}

// ─── RejectionRecoveryMockAgent ─────────────────────────────────────────────

/// Deliberately emits a type-mismatched patch on its first attempt for each
/// field, then the correct patch once it sees that field's rejection on a
/// later call — used to validate the previous-rejection feedback loop
/// (§4.7, scenario C).
pub struct RejectionRecoveryMockAgent {
    completed: ParsedForm,
    attempted: std::sync::Mutex<HashMap<String, u32>>,
}

impl RejectionRecoveryMockAgent {
    pub fn from_completed(completed: ParsedForm) -> Self {
        Self { completed, attempted: std::sync::Mutex::new(HashMap::new()) }
    }
}

#[async_trait]
impl Agent for RejectionRecoveryMockAgent {
    async fn fill_form_tool(
        &self,
        issues: &[Issue],
        _form: &ParsedForm,
        max_patches: usize,
        previous_rejections: Option<&[PatchRejection]>,
    ) -> anyhow::Result<AgentResponse> {
        let rejected_fields: std::collections::HashSet<&str> = previous_rejections
            .unwrap_or(&[])
            .iter()
            .filter_map(|r| r.field_id.as_deref())
            .collect();

        let mut patches = Vec::new();
        let mut seen = std::collections::HashSet::new();
        for issue in issues {
            let field_id = issue.field_id();
            if !seen.insert(field_id.to_string()) {
                continue;
            }
            let mut attempted = self.attempted.lock().unwrap();
            let count = attempted.entry(field_id.to_string()).or_insert(0);
            let already_rejected = rejected_fields.contains(field_id);

            if *count == 0 && !already_rejected {
                *count += 1;
                patches.push(Patch::SetString { field_id: field_id.to_string(), value: Some("wrong-shape".into()) });
            } else if let Some(response) = self.completed.responses_by_field_id.get(field_id) {
                if let Some(value) = &response.value {
                    patches.push(value_to_patch(field_id, value));
                }
                *count += 1;
            }
            if patches.len() >= max_patches {
                break;
            }
        }
        Ok(AgentResponse { patches, stats: None })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FormMetadata, Group, IssueScope, IssueSeverity, Schema};

    fn schema_with_table() -> ParsedForm {
        let schema = Schema {
            id: "f".into(),
            title: "t".into(),
            description: None,
            groups: vec![Group {
                id: "g".into(),
                title: "g".into(),
                implicit: false,
                fields: vec![Field {
                    id: "members".into(),
                    label: "Members".into(),
                    kind: FieldKind::Table {
                        columns: vec![crate::model::Column {
                            id: "name".into(),
                            label: "Name".into(),
                            kind: crate::model::ColumnKind::String,
                            required: true,
                        }],
                    },
                    role: "agent".into(),
                    required: true,
                    order: 0,
                    parallel_batch: None,
                }],
            }],
        };
        ParsedForm::new(schema, vec![], vec![], FormMetadata::default())
    }

    #[tokio::test]
    async fn mock_agent_reproduces_completed_values() {
        let mut completed = schema_with_table();
        crate::apply::apply(
            &mut completed,
            &[Patch::SetTable {
                field_id: "members".into(),
                rows: vec![HashMap::from([("name".to_string(), crate::model::CellValue::Str("Alice".into()))])],
            }],
        );
        let agent = MockAgent::from_completed(completed);
        let issue = Issue {
            scope: IssueScope::Field,
            r#ref: "members".into(),
            message: "x".into(),
            severity: IssueSeverity::Required,
            priority: 1,
            kind: "required_empty".into(),
        };
        let response = agent.fill_form_tool(&[issue], &schema_with_table(), 10, None).await.unwrap();
        assert_eq!(response.patches.len(), 1);
        assert!(matches!(response.patches[0], Patch::SetTable { .. }));
    }

    #[tokio::test]
    async fn rejection_recovery_agent_corrects_on_second_attempt() {
        let mut completed = schema_with_table();
        crate::apply::apply(
            &mut completed,
            &[Patch::SetTable {
                field_id: "members".into(),
                rows: vec![HashMap::from([("name".to_string(), crate::model::CellValue::Str("Alice".into()))])],
            }],
        );
        let agent = RejectionRecoveryMockAgent::from_completed(completed);
        let issue = Issue {
            scope: IssueScope::Field,
            r#ref: "members".into(),
            message: "x".into(),
            severity: IssueSeverity::Required,
            priority: 1,
            kind: "required_empty".into(),
        };

        let first = agent.fill_form_tool(&[issue.clone()], &schema_with_table(), 10, None).await.unwrap();
        assert!(matches!(first.patches[0], Patch::SetString { .. }));

        let mut form = schema_with_table();
        let apply_result = crate::apply::apply(&mut form, &first.patches);
        assert_eq!(apply_result.rejected.len(), 1);

        let second = agent
            .fill_form_tool(&[issue], &schema_with_table(), 10, Some(&apply_result.rejected))
            .await
            .unwrap();
        assert!(matches!(second.patches[0], Patch::SetTable { .. }));
    }

    #[test]
    fn merge_tools_lets_custom_tool_win_on_name_collision() {
        let base = vec![fill_form_tool_schema()];
        let custom = vec![ToolSchema {
            name: "fill_form".to_string(),
            description: "custom override".to_string(),
            parameters: serde_json::json!({}),
        }];
        let merged = merge_tools(base, &custom);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].description, "custom override");
    }

    #[test]
    fn merge_tools_appends_non_colliding_custom_tools() {
        let base = vec![fill_form_tool_schema()];
        let custom = vec![ToolSchema { name: "lookup".to_string(), description: "d".to_string(), parameters: serde_json::json!({}) }];
        let merged = merge_tools(base, &custom);
        assert_eq!(merged.len(), 2);
        assert!(merged.iter().any(|t| t.name == "fill_form"));
        assert!(merged.iter().any(|t| t.name == "lookup"));
    }

    #[test]
    fn context_prompt_includes_option_ids_for_select_fields() {
        let schema = Schema {
            id: "f".into(),
            title: "t".into(),
            description: None,
            groups: vec![Group {
                id: "g".into(),
                title: "g".into(),
                implicit: false,
                fields: vec![Field {
                    id: "color".into(),
                    label: "Color".into(),
                    kind: FieldKind::SingleSelect {
                        options: vec![crate::model::SelectOption { id: "red".into(), label: "Red".into() }],
                    },
                    role: "agent".into(),
                    required: true,
                    order: 0,
                    parallel_batch: None,
                }],
            }],
        };
        let form = ParsedForm::new(schema, vec![], vec![], FormMetadata::default());
        let issue = Issue {
            scope: IssueScope::Field,
            r#ref: "color".into(),
            message: "x".into(),
            severity: IssueSeverity::Required,
            priority: 1,
            kind: "required_empty".into(),
        };
        let prompt = build_context_prompt(&form, &[issue], None);
        assert!(prompt.contains("red"));
    }
}
