// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The patch applier (C3, §4.2). `apply(form, patches)` mutates
//! `responsesByFieldId` in place, one patch at a time; a rejection never
//! corrupts state (§8 invariant 1).

use crate::model::{
    CellValue, CheckboxState, Column, FieldKind, FieldValue, Note, Patch, PatchRejection, PatchWarning, ParsedForm,
    Response, ResponseState,
};

#[derive(Debug, Default)]
pub struct ApplyResult {
    pub applied: Vec<Patch>,
    pub rejected: Vec<PatchRejection>,
    pub warnings: Vec<PatchWarning>,
}

fn reject(field_id: Option<&str>, op: &str, reason: impl Into<String>) -> PatchRejection {
    PatchRejection {
        field_id: field_id.map(|s| s.to_string()),
        patch_op: op.to_string(),
        reason: reason.into(),
        field_kind: None,
        expected_format: None,
        column_ids: None,
    }
}

fn kind_mismatch(field_id: &str, op: &str, field_kind: &FieldKind, expected_op: &str) -> PatchRejection {
    let columns = match field_kind {
        FieldKind::Table { columns } => Some(columns.iter().map(|c| c.id.clone()).collect()),
        _ => None,
    };
    PatchRejection {
        field_id: Some(field_id.to_string()),
        patch_op: op.to_string(),
        reason: format!("field '{field_id}' has kind '{}', not '{expected_op}'", field_kind.name()),
        field_kind: Some(field_kind.name().to_string()),
        expected_format: Some(format!("use op:\"{expected_op}\" for this field")),
        column_ids: columns,
    }
}

/// Apply a batch of patches to `form`, mutating it in place.
pub fn apply(form: &mut ParsedForm, patches: &[Patch]) -> ApplyResult {
    let mut result = ApplyResult::default();
    for patch in patches {
        match apply_one(form, patch) {
            Ok(warning) => {
                if let Some(w) = warning {
                    result.warnings.push(w);
                }
                result.applied.push(patch.clone());
            }
            Err(rejection) => result.rejected.push(rejection),
        }
    }
    result
}

fn current_string_list(form: &ParsedForm, field_id: &str) -> Vec<String> {
    match form.responses_by_field_id.get(field_id).and_then(|r| r.value.as_ref()) {
        Some(FieldValue::StringList { items }) => items.clone(),
        Some(FieldValue::UrlList { items }) => items.clone(),
        _ => Vec::new(),
    }
}

fn current_table_rows(form: &ParsedForm, field_id: &str) -> Vec<crate::model::TableRow> {
    match form.responses_by_field_id.get(field_id).and_then(|r| r.value.as_ref()) {
        Some(FieldValue::Table { rows }) => rows.clone(),
        _ => Vec::new(),
    }
}

fn set_answered(form: &mut ParsedForm, field_id: &str, value: FieldValue) {
    form.responses_by_field_id
        .insert(field_id.to_string(), Response { state: ResponseState::Answered, value: Some(value) });
}

fn apply_one(form: &mut ParsedForm, patch: &Patch) -> Result<Option<PatchWarning>, PatchRejection> {
    match patch {
        Patch::AddNote { r#ref, text, note_id } => {
            let id = note_id.clone().unwrap_or_else(|| format!("note-{}", form.notes.len() + 1));
            form.notes.push(Note { id, r#ref: r#ref.clone(), role: "agent".to_string(), body: text.clone() });
            Ok(None)
        }
        Patch::RemoveNote { note_id } => {
            let before = form.notes.len();
            form.notes.retain(|n| &n.id != note_id);
            if form.notes.len() == before {
                return Err(reject(None, "remove_note", format!("no note with id '{note_id}'")));
            }
            Ok(None)
        }
        _ => apply_field_patch(form, patch),
    }
}

fn apply_field_patch(form: &mut ParsedForm, patch: &Patch) -> Result<Option<PatchWarning>, PatchRejection> {
    let field_id = patch.field_id().expect("non-note patch always targets a field").to_string();
    let op = patch.op_name();

    let field = match form.field(&field_id) {
        Some(f) => f.clone(),
        None => return Err(reject(Some(&field_id), op, "unknown_field")),
    };

    match patch {
        Patch::ClearField { .. } => {
            form.responses_by_field_id.insert(field_id, Response::empty());
            return Ok(None);
        }
        Patch::SkipField { reason: _, .. } => {
            let prior = form.responses_by_field_id.get(&field_id).cloned();
            form.responses_by_field_id.insert(
                field_id,
                Response { state: ResponseState::Skipped, value: prior.and_then(|r| r.value) },
            );
            return Ok(None);
        }
        Patch::AbortField { reason: _, .. } => {
            let prior = form.responses_by_field_id.get(&field_id).cloned();
            form.responses_by_field_id.insert(
                field_id,
                Response { state: ResponseState::Aborted, value: prior.and_then(|r| r.value) },
            );
            return Ok(None);
        }
        _ => {}
    }

    match (patch, &field.kind) {
        (Patch::SetString { value, .. }, FieldKind::String { min_length, max_length, pattern }) => {
            if let Some(v) = value {
                if let Some(min) = min_length {
                    if v.len() < *min {
                        return Err(reject(Some(&field_id), op, format!("string shorter than minLength={min}")));
                    }
                }
                if let Some(max) = max_length {
                    if v.len() > *max {
                        return Err(reject(Some(&field_id), op, format!("string longer than maxLength={max}")));
                    }
                }
                if let Some(pat) = pattern {
                    let re = regex::Regex::new(pat)
                        .map_err(|e| reject(Some(&field_id), op, format!("invalid pattern: {e}")))?;
                    if !re.is_match(v) {
                        return Err(reject(Some(&field_id), op, format!("value does not match pattern '{pat}'")));
                    }
                }
            }
            set_answered(form, &field_id, FieldValue::String { value: value.clone() });
            Ok(None)
        }
        (Patch::SetString { .. }, other) => Err(kind_mismatch(&field_id, op, other, "set_string")),

        (Patch::SetNumber { value, .. }, FieldKind::Number { min, max, integer }) => {
            if let Some(v) = value {
                if *integer && v.fract() != 0.0 {
                    return Err(reject(Some(&field_id), op, "value must be an integer"));
                }
                if let Some(min) = min {
                    if v < min {
                        return Err(reject(Some(&field_id), op, format!("value below min={min}")));
                    }
                }
                if let Some(max) = max {
                    if v > max {
                        return Err(reject(Some(&field_id), op, format!("value above max={max}")));
                    }
                }
            }
            set_answered(form, &field_id, FieldValue::Number { value: *value });
            Ok(None)
        }
        (Patch::SetNumber { .. }, other) => Err(kind_mismatch(&field_id, op, other, "set_number")),

        (Patch::SetStringList { items, .. }, FieldKind::StringList { min_items, max_items }) => {
            check_item_bounds(&field_id, op, items.len(), *min_items, *max_items)?;
            set_answered(form, &field_id, FieldValue::StringList { items: items.clone() });
            Ok(None)
        }
        (Patch::SetStringList { .. }, other) => Err(kind_mismatch(&field_id, op, other, "set_string_list")),

        (Patch::SetUrlList { items, .. }, FieldKind::UrlList { min_items, max_items }) => {
            check_item_bounds(&field_id, op, items.len(), *min_items, *max_items)?;
            for item in items {
                validate_url(&field_id, op, item)?;
            }
            set_answered(form, &field_id, FieldValue::UrlList { items: items.clone() });
            Ok(None)
        }
        (Patch::SetUrlList { .. }, other) => Err(kind_mismatch(&field_id, op, other, "set_url_list")),

        (Patch::SetUrl { value, .. }, FieldKind::Url) => {
            if let Some(v) = value {
                validate_url(&field_id, op, v)?;
            }
            set_answered(form, &field_id, FieldValue::Url { value: value.clone() });
            Ok(None)
        }
        (Patch::SetUrl { .. }, other) => Err(kind_mismatch(&field_id, op, other, "set_url")),

        (Patch::SetSingleSelect { selected, .. }, FieldKind::SingleSelect { options }) => {
            if let Some(id) = selected {
                check_option_membership(&field_id, op, id, options)?;
            }
            set_answered(form, &field_id, FieldValue::SingleSelect { selected: selected.clone() });
            Ok(None)
        }
        (Patch::SetSingleSelect { .. }, other) => Err(kind_mismatch(&field_id, op, other, "set_single_select")),

        (Patch::SetMultiSelect { selected, .. }, FieldKind::MultiSelect { options }) => {
            for id in selected {
                check_option_membership(&field_id, op, id, options)?;
            }
            set_answered(form, &field_id, FieldValue::MultiSelect { selected: selected.clone() });
            Ok(None)
        }
        (Patch::SetMultiSelect { .. }, other) => Err(kind_mismatch(&field_id, op, other, "set_multi_select")),

        (Patch::SetCheckboxes { values, .. }, FieldKind::Checkboxes { options, checkbox_mode, min_done }) => {
            let alphabet = checkbox_mode.alphabet();
            for (opt_id, state) in values {
                if !options.iter().any(|o| &o.id == opt_id) {
                    return Err(reject(Some(&field_id), op, format!("'{opt_id}' is not a valid checkbox option id")));
                }
                if !alphabet.contains(state) {
                    return Err(reject(
                        Some(&field_id),
                        op,
                        format!("{state:?} is not valid in {checkbox_mode:?} mode"),
                    ));
                }
            }
            if let Some(min) = min_done {
                let done_count = values
                    .values()
                    .filter(|s| matches!(s, CheckboxState::Done | CheckboxState::Yes))
                    .count();
                if done_count < *min {
                    return Err(reject(Some(&field_id), op, format!("fewer than minDone={min} options completed")));
                }
            }
            set_answered(form, &field_id, FieldValue::Checkboxes { values: values.clone() });
            Ok(None)
        }
        (Patch::SetCheckboxes { .. }, other) => Err(kind_mismatch(&field_id, op, other, "set_checkboxes")),

        (Patch::SetDate { value, .. }, FieldKind::Date { min_date, max_date }) => {
            if let Some(v) = value {
                validate_date(&field_id, op, v, min_date.as_deref(), max_date.as_deref())?;
            }
            set_answered(form, &field_id, FieldValue::Date { value: value.clone() });
            Ok(None)
        }
        (Patch::SetDate { .. }, other) => Err(kind_mismatch(&field_id, op, other, "set_date")),

        (Patch::SetYear { value, .. }, FieldKind::Year { min, max }) => {
            if let Some(v) = value {
                if let Some(min) = min {
                    if v < min {
                        return Err(reject(Some(&field_id), op, format!("year below min={min}")));
                    }
                }
                if let Some(max) = max {
                    if v > max {
                        return Err(reject(Some(&field_id), op, format!("year above max={max}")));
                    }
                }
            }
            set_answered(form, &field_id, FieldValue::Year { value: *value });
            Ok(None)
        }
        (Patch::SetYear { .. }, other) => Err(kind_mismatch(&field_id, op, other, "set_year")),

        (Patch::SetTable { rows, .. }, FieldKind::Table { columns }) => {
            for row in rows {
                validate_table_row(&field_id, op, row, columns)?;
            }
            set_answered(form, &field_id, FieldValue::Table { rows: rows.clone() });
            Ok(None)
        }
        (Patch::AppendTable { row, .. }, FieldKind::Table { columns }) => {
            validate_table_row(&field_id, op, row, columns)?;
            let mut rows = current_table_rows(form, &field_id);
            rows.push(row.clone());
            set_answered(form, &field_id, FieldValue::Table { rows });
            Ok(None)
        }
        (Patch::DeleteTable { row_index, .. }, FieldKind::Table { .. }) => {
            let mut rows = current_table_rows(form, &field_id);
            if *row_index >= rows.len() {
                return Err(reject(Some(&field_id), op, format!("row_index {row_index} out of bounds")));
            }
            rows.remove(*row_index);
            set_answered(form, &field_id, FieldValue::Table { rows });
            Ok(None)
        }
        (Patch::SetTable { .. } | Patch::AppendTable { .. } | Patch::DeleteTable { .. }, other) => {
            Err(kind_mismatch(&field_id, op, other, "set_table"))
        }

        (Patch::AppendStringList { value, .. }, FieldKind::StringList { max_items, .. }) => {
            let mut items = current_string_list(form, &field_id);
            if let Some(max) = max_items {
                if items.len() >= *max {
                    return Err(reject(Some(&field_id), op, format!("list already at maxItems={max}")));
                }
            }
            items.push(value.clone());
            set_answered(form, &field_id, FieldValue::StringList { items });
            Ok(None)
        }
        (Patch::DeleteStringList { value, .. }, FieldKind::StringList { .. }) => {
            let mut items = current_string_list(form, &field_id);
            let before = items.len();
            items.retain(|v| v != value);
            if items.len() == before {
                return Err(reject(Some(&field_id), op, format!("'{value}' not present in list")));
            }
            set_answered(form, &field_id, FieldValue::StringList { items });
            Ok(None)
        }
        (Patch::AppendStringList { .. } | Patch::DeleteStringList { .. }, other) => {
            Err(kind_mismatch(&field_id, op, other, "set_string_list"))
        }

        (Patch::AppendUrlList { value, .. }, FieldKind::UrlList { max_items, .. }) => {
            validate_url(&field_id, op, value)?;
            let mut items = current_string_list(form, &field_id);
            if let Some(max) = max_items {
                if items.len() >= *max {
                    return Err(reject(Some(&field_id), op, format!("list already at maxItems={max}")));
                }
            }
            items.push(value.clone());
            set_answered(form, &field_id, FieldValue::UrlList { items });
            Ok(None)
        }
        (Patch::DeleteUrlList { value, .. }, FieldKind::UrlList { .. }) => {
            let mut items = current_string_list(form, &field_id);
            let before = items.len();
            items.retain(|v| v != value);
            if items.len() == before {
                return Err(reject(Some(&field_id), op, format!("'{value}' not present in list")));
            }
            set_answered(form, &field_id, FieldValue::UrlList { items });
            Ok(None)
        }
        (Patch::AppendUrlList { .. } | Patch::DeleteUrlList { .. }, other) => {
            Err(kind_mismatch(&field_id, op, other, "set_url_list"))
        }

        (Patch::ClearField { .. } | Patch::SkipField { .. } | Patch::AbortField { .. }, _) => unreachable!("handled above"),
        (Patch::AddNote { .. } | Patch::RemoveNote { .. }, _) => unreachable!("handled in apply_one"),
    }
}

fn check_item_bounds(
    field_id: &str,
    op: &str,
    len: usize,
    min_items: Option<usize>,
    max_items: Option<usize>,
) -> Result<(), PatchRejection> {
    if let Some(min) = min_items {
        if len < min {
            return Err(reject(Some(field_id), op, format!("fewer than minItems={min}")));
        }
    }
    if let Some(max) = max_items {
        if len > max {
            return Err(reject(Some(field_id), op, format!("more than maxItems={max}")));
        }
    }
    Ok(())
}

fn validate_url(field_id: &str, op: &str, value: &str) -> Result<(), PatchRejection> {
    if !(value.starts_with("http://") || value.starts_with("https://") || value.contains("://")) {
        return Err(reject(Some(field_id), op, format!("'{value}' is not an absolute URL")));
    }
    Ok(())
}

fn validate_date(
    field_id: &str,
    op: &str,
    value: &str,
    min_date: Option<&str>,
    max_date: Option<&str>,
) -> Result<(), PatchRejection> {
    if chrono::NaiveDate::parse_from_str(value, "%Y-%m-%d").is_err() {
        return Err(reject(Some(field_id), op, format!("'{value}' is not an ISO-8601 date")));
    }
    if let Some(min) = min_date {
        if value < min {
            return Err(reject(Some(field_id), op, format!("date before minDate={min}")));
        }
    }
    if let Some(max) = max_date {
        if value > max {
            return Err(reject(Some(field_id), op, format!("date after maxDate={max}")));
        }
    }
    Ok(())
}

fn check_option_membership(
    field_id: &str,
    op: &str,
    id: &str,
    options: &[crate::model::SelectOption],
) -> Result<(), PatchRejection> {
    if options.iter().any(|o| o.id == id) {
        Ok(())
    } else {
        let valid: Vec<&str> = options.iter().map(|o| o.id.as_str()).collect();
        Err(reject(Some(field_id), op, format!("'{id}' is not a valid option id; valid ids: {}", valid.join(", "))))
    }
}

fn validate_table_row(
    field_id: &str,
    op: &str,
    row: &crate::model::TableRow,
    columns: &[Column],
) -> Result<(), PatchRejection> {
    for col in columns {
        match row.get(&col.id) {
            None | Some(CellValue::Null) if col.required => {
                return Err(reject(Some(field_id), op, format!("column '{}' is required", col.id)));
            }
            _ => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Field, FormMetadata, Group, Schema, SelectOption};

    fn form_with_string_and_select() -> ParsedForm {
        let schema = Schema {
            id: "f".into(),
            title: "t".into(),
            description: None,
            groups: vec![Group {
                id: "g".into(),
                title: "g".into(),
                implicit: false,
                fields: vec![
                    Field {
                        id: "name".into(),
                        label: "Name".into(),
                        kind: FieldKind::String { min_length: Some(2), max_length: None, pattern: None },
                        role: "agent".into(),
                        required: true,
                        order: 0,
                        parallel_batch: None,
                    },
                    Field {
                        id: "color".into(),
                        label: "Color".into(),
                        kind: FieldKind::SingleSelect {
                            options: vec![
                                SelectOption { id: "red".into(), label: "Red".into() },
                                SelectOption { id: "blue".into(), label: "Blue".into() },
                            ],
                        },
                        role: "agent".into(),
                        required: false,
                        order: 0,
                        parallel_batch: None,
                    },
                ],
            }],
        };
        ParsedForm::new(schema, vec![], vec![], FormMetadata::default())
    }

    #[test]
    fn applies_valid_string_patch() {
        let mut form = form_with_string_and_select();
        let result = apply(&mut form, &[Patch::SetString { field_id: "name".into(), value: Some("Alice".into()) }]);
        assert_eq!(result.applied.len(), 1);
        assert!(result.rejected.is_empty());
        assert_eq!(form.responses_by_field_id["name"].state, ResponseState::Answered);
    }

    #[test]
    fn rejects_string_shorter_than_min_length() {
        let mut form = form_with_string_and_select();
        let result = apply(&mut form, &[Patch::SetString { field_id: "name".into(), value: Some("a".into()) }]);
        assert_eq!(result.rejected.len(), 1);
        assert_eq!(form.responses_by_field_id["name"].state, ResponseState::Empty);
    }

    #[test]
    fn kind_mismatch_carries_expected_format_and_column_ids_for_table() {
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
                        columns: vec![Column { id: "name".into(), label: "Name".into(), kind: crate::model::ColumnKind::String, required: true }],
                    },
                    role: "agent".into(),
                    required: true,
                    order: 0,
                    parallel_batch: None,
                }],
            }],
        };
        let mut form = ParsedForm::new(schema, vec![], vec![], FormMetadata::default());
        let result = apply(&mut form, &[Patch::SetString { field_id: "members".into(), value: Some("x".into()) }]);
        assert_eq!(result.rejected.len(), 1);
        let rej = &result.rejected[0];
        assert_eq!(rej.field_kind.as_deref(), Some("table"));
        assert!(rej.expected_format.as_deref().unwrap().contains("set_table"));
        assert_eq!(rej.column_ids.as_ref().unwrap(), &vec!["name".to_string()]);
    }

    #[test]
    fn applied_and_rejected_partition_the_batch() {
        let mut form = form_with_string_and_select();
        let patches = vec![
            Patch::SetString { field_id: "name".into(), value: Some("Alice".into()) },
            Patch::SetSingleSelect { field_id: "color".into(), selected: Some("green".into()) },
        ];
        let result = apply(&mut form, &patches);
        assert_eq!(result.applied.len() + result.rejected.len(), patches.len());
    }

    #[test]
    fn clear_field_resets_to_empty() {
        let mut form = form_with_string_and_select();
        apply(&mut form, &[Patch::SetString { field_id: "name".into(), value: Some("Alice".into()) }]);
        apply(&mut form, &[Patch::ClearField { field_id: "name".into() }]);
        assert_eq!(form.responses_by_field_id["name"].state, ResponseState::Empty);
        assert!(form.responses_by_field_id["name"].value.is_none());
    }

    #[test]
    fn abort_then_clear_returns_to_empty() {
        let mut form = form_with_string_and_select();
        apply(&mut form, &[Patch::AbortField { field_id: "name".into(), reason: None }]);
        assert_eq!(form.responses_by_field_id["name"].state, ResponseState::Aborted);
        apply(&mut form, &[Patch::ClearField { field_id: "name".into() }]);
        assert_eq!(form.responses_by_field_id["name"].state, ResponseState::Empty);
    }

    #[test]
    fn unknown_field_is_rejected_not_thrown() {
        let mut form = form_with_string_and_select();
        let result = apply(&mut form, &[Patch::SetString { field_id: "ghost".into(), value: Some("x".into()) }]);
        assert_eq!(result.rejected.len(), 1);
        assert_eq!(result.rejected[0].reason, "unknown_field");
    }

    #[test]
    fn applying_same_patch_twice_is_idempotent() {
        let mut form = form_with_string_and_select();
        apply(&mut form, &[Patch::SetString { field_id: "name".into(), value: Some("Alice".into()) }]);
        let snapshot_once = form.responses_by_field_id["name"].value.clone();
        apply(&mut form, &[Patch::SetString { field_id: "name".into(), value: Some("Alice".into()) }]);
        assert_eq!(form.responses_by_field_id["name"].value, snapshot_once);
    }
}
