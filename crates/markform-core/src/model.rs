// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The immutable-schema, mutable-response data model (C1). A `ParsedForm` is
//! constructed once by an external parser and mutated only through
//! [`crate::apply::apply`]; everything else here is read-only for the
//! lifetime of a fill.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

// ─── Schema ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schema {
    pub id: String,
    pub title: String,
    pub description: Option<String>,
    pub groups: Vec<Group>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub implicit: bool,
    pub fields: Vec<Field>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Field {
    pub id: String,
    pub label: String,
    pub kind: FieldKind,
    #[serde(default = "default_role")]
    pub role: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub order: i64,
    #[serde(default)]
    pub parallel_batch: Option<String>,
}

pub fn default_role() -> String {
    "user".to_string()
}

impl Field {
    pub fn kind_name(&self) -> &'static str {
        self.kind.name()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectOption {
    pub id: String,
    pub label: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckboxMode {
    Simple,
    Multi,
    Explicit,
}

impl CheckboxMode {
    /// The alphabet of valid states for this mode (§3, §4.1).
    pub fn alphabet(&self) -> &'static [CheckboxState] {
        match self {
            CheckboxMode::Simple => &[CheckboxState::Todo, CheckboxState::Done],
            CheckboxMode::Multi => &[
                CheckboxState::Todo,
                CheckboxState::Done,
                CheckboxState::Incomplete,
                CheckboxState::Active,
                CheckboxState::Na,
            ],
            CheckboxMode::Explicit => &[CheckboxState::Unfilled, CheckboxState::Yes, CheckboxState::No],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckboxState {
    Todo,
    Done,
    Incomplete,
    Active,
    Na,
    Unfilled,
    Yes,
    No,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Column {
    pub id: String,
    pub label: String,
    pub kind: ColumnKind,
    #[serde(default)]
    pub required: bool,
}

/// Column kinds are a subset of field kinds: no nested tables or lists-of-lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnKind {
    String,
    Number,
    Url,
    Date,
    Year,
}

/// Field kinds, tagged by `kind` (§3, §9 "tagged variants over inheritance").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FieldKind {
    String {
        #[serde(default)]
        min_length: Option<usize>,
        #[serde(default)]
        max_length: Option<usize>,
        #[serde(default)]
        pattern: Option<String>,
    },
    Number {
        #[serde(default)]
        min: Option<f64>,
        #[serde(default)]
        max: Option<f64>,
        #[serde(default)]
        integer: bool,
    },
    StringList {
        #[serde(default)]
        min_items: Option<usize>,
        #[serde(default)]
        max_items: Option<usize>,
    },
    UrlList {
        #[serde(default)]
        min_items: Option<usize>,
        #[serde(default)]
        max_items: Option<usize>,
    },
    SingleSelect {
        options: Vec<SelectOption>,
    },
    MultiSelect {
        options: Vec<SelectOption>,
    },
    Checkboxes {
        options: Vec<SelectOption>,
        checkbox_mode: CheckboxMode,
        #[serde(default)]
        min_done: Option<usize>,
    },
    Url,
    Date {
        #[serde(default)]
        min_date: Option<String>,
        #[serde(default)]
        max_date: Option<String>,
    },
    Year {
        #[serde(default)]
        min: Option<i64>,
        #[serde(default)]
        max: Option<i64>,
    },
    Table {
        columns: Vec<Column>,
    },
}

impl FieldKind {
    pub fn name(&self) -> &'static str {
        match self {
            FieldKind::String { .. } => "string",
            FieldKind::Number { .. } => "number",
            FieldKind::StringList { .. } => "string_list",
            FieldKind::UrlList { .. } => "url_list",
            FieldKind::SingleSelect { .. } => "single_select",
            FieldKind::MultiSelect { .. } => "multi_select",
            FieldKind::Checkboxes { .. } => "checkboxes",
            FieldKind::Url => "url",
            FieldKind::Date { .. } => "date",
            FieldKind::Year { .. } => "year",
            FieldKind::Table { .. } => "table",
        }
    }
}

// ─── Values ─────────────────────────────────────────────────────────────────

pub type TableRow = HashMap<String, CellValue>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CellValue {
    Str(String),
    Num(f64),
    Null,
}

/// A response value, tagged by `kind`; its tag must equal the owning field's
/// kind (§3 invariant).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FieldValue {
    String { value: Option<String> },
    Number { value: Option<f64> },
    StringList { items: Vec<String> },
    Url { value: Option<String> },
    UrlList { items: Vec<String> },
    SingleSelect { selected: Option<String> },
    MultiSelect { selected: Vec<String> },
    Checkboxes { values: HashMap<String, CheckboxState> },
    Table { rows: Vec<TableRow> },
    Date { value: Option<String> },
    Year { value: Option<i64> },
}

impl FieldValue {
    pub fn kind_name(&self) -> &'static str {
        match self {
            FieldValue::String { .. } => "string",
            FieldValue::Number { .. } => "number",
            FieldValue::StringList { .. } => "string_list",
            FieldValue::Url { .. } => "url",
            FieldValue::UrlList { .. } => "url_list",
            FieldValue::SingleSelect { .. } => "single_select",
            FieldValue::MultiSelect { .. } => "multi_select",
            FieldValue::Checkboxes { .. } => "checkboxes",
            FieldValue::Table { .. } => "table",
            FieldValue::Date { .. } => "date",
            FieldValue::Year { .. } => "year",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseState {
    Empty,
    Answered,
    Skipped,
    Aborted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub state: ResponseState,
    #[serde(default)]
    pub value: Option<FieldValue>,
}

impl Response {
    pub fn empty() -> Self {
        Self { state: ResponseState::Empty, value: None }
    }
}

// ─── Docs & notes ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentationBlock {
    pub r#ref: String,
    pub tag: String,
    pub body_markdown: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Note {
    pub id: String,
    pub r#ref: String,
    pub role: String,
    pub body: String,
}

// ─── Id index ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Form,
    Group,
    Field,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdIndexEntry {
    pub node_type: NodeType,
    pub parent_id: Option<String>,
}

// ─── Metadata ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Interactive,
    Fill,
    Research,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HarnessConfigOverride {
    pub max_turns: Option<u32>,
    pub max_patches_per_turn: Option<u32>,
    pub max_issues_per_turn: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FormMetadata {
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub role_instructions: HashMap<String, String>,
    #[serde(default)]
    pub harness_config: Option<HarnessConfigOverride>,
    #[serde(default)]
    pub run_mode: Option<RunMode>,
}

// ─── ParsedForm ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParsedForm {
    pub schema: Schema,
    pub responses_by_field_id: HashMap<String, Response>,
    pub docs: Vec<DocumentationBlock>,
    pub notes: Vec<Note>,
    pub id_index: HashMap<String, IdIndexEntry>,
    pub metadata: FormMetadata,
}

impl ParsedForm {
    /// Construct a form from a schema, filling `responsesByFieldId` with
    /// empty responses and building `idIndex` (§3, §9 "build once at parse
    /// time").
    pub fn new(schema: Schema, docs: Vec<DocumentationBlock>, notes: Vec<Note>, metadata: FormMetadata) -> Self {
        let mut responses = HashMap::new();
        let mut id_index = HashMap::new();
        id_index.insert(schema.id.clone(), IdIndexEntry { node_type: NodeType::Form, parent_id: None });
        for group in &schema.groups {
            id_index.insert(
                group.id.clone(),
                IdIndexEntry { node_type: NodeType::Group, parent_id: Some(schema.id.clone()) },
            );
            for field in &group.fields {
                id_index.insert(
                    field.id.clone(),
                    IdIndexEntry { node_type: NodeType::Field, parent_id: Some(group.id.clone()) },
                );
                responses.insert(field.id.clone(), Response::empty());
            }
        }
        Self { schema, responses_by_field_id: responses, docs, notes, id_index, metadata }
    }

    pub fn field(&self, field_id: &str) -> Option<&Field> {
        self.schema.groups.iter().flat_map(|g| g.fields.iter()).find(|f| f.id == field_id)
    }

    pub fn all_fields(&self) -> impl Iterator<Item = &Field> {
        self.schema.groups.iter().flat_map(|g| g.fields.iter())
    }

    pub fn group_of(&self, field_id: &str) -> Option<&Group> {
        self.schema.groups.iter().find(|g| g.fields.iter().any(|f| f.id == field_id))
    }

    /// Invariant check (§8 property 3): responses' domain equals exactly the
    /// schema's field ids.
    pub fn domain_matches_schema(&self) -> bool {
        let schema_ids: std::collections::HashSet<&str> =
            self.all_fields().map(|f| f.id.as_str()).collect();
        let response_ids: std::collections::HashSet<&str> =
            self.responses_by_field_id.keys().map(|s| s.as_str()).collect();
        schema_ids == response_ids
    }
}

// ─── Issues ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueScope {
    Form,
    Group,
    Field,
    Option,
    Cell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueSeverity {
    Required,
    Recommended,
    Informational,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    pub scope: IssueScope,
    pub r#ref: String,
    pub message: String,
    pub severity: IssueSeverity,
    pub priority: u32,
    pub kind: String,
}

impl Issue {
    /// The field id this issue's ref belongs to, stripping any `.option`/`.cell` suffix.
    pub fn field_id(&self) -> &str {
        self.r#ref.split('.').next().unwrap_or(&self.r#ref)
    }
}

// ─── Patches ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Patch {
    SetString { field_id: String, value: Option<String> },
    SetNumber { field_id: String, value: Option<f64> },
    SetStringList { field_id: String, items: Vec<String> },
    SetUrl { field_id: String, value: Option<String> },
    SetUrlList { field_id: String, items: Vec<String> },
    SetSingleSelect { field_id: String, selected: Option<String> },
    SetMultiSelect { field_id: String, selected: Vec<String> },
    SetCheckboxes { field_id: String, values: HashMap<String, CheckboxState> },
    SetDate { field_id: String, value: Option<String> },
    SetYear { field_id: String, value: Option<i64> },
    SetTable { field_id: String, rows: Vec<TableRow> },
    AppendTable { field_id: String, row: TableRow },
    DeleteTable { field_id: String, row_index: usize },
    AppendStringList { field_id: String, value: String },
    DeleteStringList { field_id: String, value: String },
    AppendUrlList { field_id: String, value: String },
    DeleteUrlList { field_id: String, value: String },
    ClearField { field_id: String },
    SkipField { field_id: String, reason: Option<String> },
    AbortField { field_id: String, reason: Option<String> },
    AddNote { r#ref: String, text: String, note_id: Option<String> },
    RemoveNote { note_id: String },
}

impl Patch {
    /// The target field id, where applicable (note ops have none).
    pub fn field_id(&self) -> Option<&str> {
        match self {
            Patch::SetString { field_id, .. }
            | Patch::SetNumber { field_id, .. }
            | Patch::SetStringList { field_id, .. }
            | Patch::SetUrl { field_id, .. }
            | Patch::SetUrlList { field_id, .. }
            | Patch::SetSingleSelect { field_id, .. }
            | Patch::SetMultiSelect { field_id, .. }
            | Patch::SetCheckboxes { field_id, .. }
            | Patch::SetDate { field_id, .. }
            | Patch::SetYear { field_id, .. }
            | Patch::SetTable { field_id, .. }
            | Patch::AppendTable { field_id, .. }
            | Patch::DeleteTable { field_id, .. }
            | Patch::AppendStringList { field_id, .. }
            | Patch::DeleteStringList { field_id, .. }
            | Patch::AppendUrlList { field_id, .. }
            | Patch::DeleteUrlList { field_id, .. }
            | Patch::ClearField { field_id }
            | Patch::SkipField { field_id, .. }
            | Patch::AbortField { field_id, .. } => Some(field_id),
            Patch::AddNote { .. } | Patch::RemoveNote { .. } => None,
        }
    }

    pub fn op_name(&self) -> &'static str {
        match self {
            Patch::SetString { .. } => "set_string",
            Patch::SetNumber { .. } => "set_number",
            Patch::SetStringList { .. } => "set_string_list",
            Patch::SetUrl { .. } => "set_url",
            Patch::SetUrlList { .. } => "set_url_list",
            Patch::SetSingleSelect { .. } => "set_single_select",
            Patch::SetMultiSelect { .. } => "set_multi_select",
            Patch::SetCheckboxes { .. } => "set_checkboxes",
            Patch::SetDate { .. } => "set_date",
            Patch::SetYear { .. } => "set_year",
            Patch::SetTable { .. } => "set_table",
            Patch::AppendTable { .. } => "append_table",
            Patch::DeleteTable { .. } => "delete_table",
            Patch::AppendStringList { .. } => "append_string_list",
            Patch::DeleteStringList { .. } => "delete_string_list",
            Patch::AppendUrlList { .. } => "append_url_list",
            Patch::DeleteUrlList { .. } => "delete_url_list",
            Patch::ClearField { .. } => "clear_field",
            Patch::SkipField { .. } => "skip_field",
            Patch::AbortField { .. } => "abort_field",
            Patch::AddNote { .. } => "add_note",
            Patch::RemoveNote { .. } => "remove_note",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchRejection {
    pub field_id: Option<String>,
    pub patch_op: String,
    pub reason: String,
    pub field_kind: Option<String>,
    pub expected_format: Option<String>,
    pub column_ids: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchWarning {
    pub field_id: String,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn simple_form() -> ParsedForm {
        let schema = Schema {
            id: "form-1".into(),
            title: "Test form".into(),
            description: None,
            groups: vec![Group {
                id: "g1".into(),
                title: "Basics".into(),
                implicit: false,
                fields: vec![
                    Field {
                        id: "name".into(),
                        label: "Name".into(),
                        kind: FieldKind::String { min_length: None, max_length: None, pattern: None },
                        role: "agent".into(),
                        required: true,
                        order: 0,
                        parallel_batch: None,
                    },
                    Field {
                        id: "age".into(),
                        label: "Age".into(),
                        kind: FieldKind::Number { min: Some(0.0), max: Some(150.0), integer: true },
                        role: "agent".into(),
                        required: true,
                        order: 0,
                        parallel_batch: None,
                    },
                ],
            }],
        };
        ParsedForm::new(schema, vec![], vec![], FormMetadata::default())
    }

    #[test]
    fn new_form_has_empty_response_per_field() {
        let form = simple_form();
        assert_eq!(form.responses_by_field_id.len(), 2);
        assert_eq!(form.responses_by_field_id["name"].state, ResponseState::Empty);
    }

    #[test]
    fn id_index_covers_form_group_and_fields() {
        let form = simple_form();
        assert!(matches!(form.id_index["form-1"].node_type, NodeType::Form));
        assert!(matches!(form.id_index["g1"].node_type, NodeType::Group));
        assert_eq!(form.id_index["g1"].parent_id.as_deref(), Some("form-1"));
        assert_eq!(form.id_index["name"].parent_id.as_deref(), Some("g1"));
    }

    #[test]
    fn domain_matches_schema_holds_for_fresh_form() {
        let form = simple_form();
        assert!(form.domain_matches_schema());
    }

    #[test]
    fn issue_field_id_strips_option_suffix() {
        let issue = Issue {
            scope: IssueScope::Option,
            r#ref: "colors.red".into(),
            message: "x".into(),
            severity: IssueSeverity::Required,
            priority: 1,
            kind: "option_required".into(),
        };
        assert_eq!(issue.field_id(), "colors");
    }

    #[test]
    fn patch_field_id_is_none_for_note_ops() {
        let p = Patch::AddNote { r#ref: "form-1".into(), text: "hi".into(), note_id: None };
        assert!(p.field_id().is_none());
    }

    #[test]
    fn checkbox_alphabet_matches_mode() {
        assert_eq!(CheckboxMode::Simple.alphabet(), &[CheckboxState::Todo, CheckboxState::Done]);
        assert_eq!(CheckboxMode::Explicit.alphabet().len(), 3);
    }
}
