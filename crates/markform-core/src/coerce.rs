// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Value coercion (C2, §4.1): normalize loose input values into typed patches
//! for a target field, or a precise error. Shared by `coerceInputContext` and
//! re-run inside the patch applier against patch payloads (§4.2 step 3).

use std::collections::HashMap;

use serde_json::Value as Json;

use crate::model::{CheckboxState, ColumnKind, Field, FieldKind, Patch, PatchWarning, TableRow};

#[derive(Debug, Clone)]
pub struct CoercionOutcome {
    pub patch: Patch,
    pub warning: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CoerceError {
    pub message: String,
}

impl std::fmt::Display for CoerceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

fn err(msg: impl Into<String>) -> CoerceError {
    CoerceError { message: msg.into() }
}

/// Coerce a raw JSON value for `field` into a `Patch`, or fail with a precise
/// error. Pure and synchronous (§5).
pub fn coerce_value(field: &Field, raw: &Json) -> Result<CoercionOutcome, CoerceError> {
    let field_id = field.id.clone();
    match &field.kind {
        FieldKind::String { .. } => coerce_string(field_id, raw),
        FieldKind::Number { .. } => coerce_number(field_id, raw),
        FieldKind::StringList { .. } => coerce_string_list(field_id, raw, false),
        FieldKind::UrlList { .. } => coerce_string_list(field_id, raw, true),
        FieldKind::Url => coerce_url(field_id, raw),
        FieldKind::SingleSelect { options } => coerce_single_select(field_id, raw, options),
        FieldKind::MultiSelect { options } => coerce_multi_select(field_id, raw, options),
        FieldKind::Checkboxes { options, checkbox_mode, .. } => {
            coerce_checkboxes(field_id, raw, options, *checkbox_mode)
        }
        FieldKind::Date { .. } => coerce_date(field_id, raw),
        FieldKind::Year { .. } => coerce_year(field_id, raw),
        FieldKind::Table { columns } => coerce_table(field_id, raw, columns),
    }
}

fn coerce_string(field_id: String, raw: &Json) -> Result<CoercionOutcome, CoerceError> {
    match raw {
        Json::Null => Ok(CoercionOutcome { patch: Patch::SetString { field_id, value: None }, warning: None }),
        Json::String(s) => {
            Ok(CoercionOutcome { patch: Patch::SetString { field_id, value: Some(s.clone()) }, warning: None })
        }
        Json::Number(n) => Ok(CoercionOutcome {
            patch: Patch::SetString { field_id, value: Some(n.to_string()) },
            warning: Some("coerced number to string".into()),
        }),
        Json::Bool(b) => Ok(CoercionOutcome {
            patch: Patch::SetString { field_id, value: Some(b.to_string()) },
            warning: Some("coerced boolean to string".into()),
        }),
        Json::Array(_) | Json::Object(_) => Err(err("string field cannot accept an array or object")),
    }
}

fn coerce_number(field_id: String, raw: &Json) -> Result<CoercionOutcome, CoerceError> {
    match raw {
        Json::Null => Ok(CoercionOutcome { patch: Patch::SetNumber { field_id, value: None }, warning: None }),
        Json::Number(n) => {
            let v = n.as_f64().ok_or_else(|| err("number is not finite"))?;
            Ok(CoercionOutcome { patch: Patch::SetNumber { field_id, value: Some(v) }, warning: None })
        }
        Json::String(s) => {
            if s.trim().is_empty() {
                return Err(err("empty string is not a valid number"));
            }
            let v: f64 = s.trim().parse().map_err(|_| err(format!("'{s}' is not a valid number")))?;
            if !v.is_finite() {
                return Err(err("number is not finite"));
            }
            Ok(CoercionOutcome {
                patch: Patch::SetNumber { field_id, value: Some(v) },
                warning: Some("parsed numeric string".into()),
            })
        }
        _ => Err(err("number field cannot accept this value")),
    }
}

fn coerce_string_list(field_id: String, raw: &Json, as_url: bool) -> Result<CoercionOutcome, CoerceError> {
    let (items, warning) = match raw {
        Json::Array(arr) => {
            let mut items = Vec::with_capacity(arr.len());
            for v in arr {
                match v {
                    Json::String(s) => items.push(s.clone()),
                    _ => return Err(err("list items must be strings")),
                }
            }
            (items, None)
        }
        Json::String(s) => (vec![s.clone()], Some("wrapped single string into a one-element array".to_string())),
        _ => return Err(err("expected an array of strings or a single string")),
    };
    if as_url {
        for item in &items {
            validate_absolute_url(item)?;
        }
        Ok(CoercionOutcome { patch: Patch::SetUrlList { field_id, items }, warning })
    } else {
        Ok(CoercionOutcome { patch: Patch::SetStringList { field_id, items }, warning })
    }
}

fn validate_absolute_url(s: &str) -> Result<(), CoerceError> {
    let has_scheme = s.contains("://");
    let scheme_ok = s.starts_with("http://") || s.starts_with("https://") || has_scheme;
    if !scheme_ok || s.trim().is_empty() {
        return Err(err(format!("'{s}' is not an absolute URL")));
    }
    Ok(())
}

fn coerce_url(field_id: String, raw: &Json) -> Result<CoercionOutcome, CoerceError> {
    match raw {
        Json::Null => Ok(CoercionOutcome { patch: Patch::SetUrl { field_id, value: None }, warning: None }),
        Json::String(s) => {
            validate_absolute_url(s)?;
            Ok(CoercionOutcome { patch: Patch::SetUrl { field_id, value: Some(s.clone()) }, warning: None })
        }
        _ => Err(err("url field requires a string")),
    }
}

fn coerce_single_select(
    field_id: String,
    raw: &Json,
    options: &[crate::model::SelectOption],
) -> Result<CoercionOutcome, CoerceError> {
    match raw {
        Json::Null => Ok(CoercionOutcome { patch: Patch::SetSingleSelect { field_id, selected: None }, warning: None }),
        Json::String(s) => {
            if options.iter().any(|o| &o.id == s) {
                Ok(CoercionOutcome {
                    patch: Patch::SetSingleSelect { field_id, selected: Some(s.clone()) },
                    warning: None,
                })
            } else {
                let valid: Vec<&str> = options.iter().map(|o| o.id.as_str()).collect();
                Err(err(format!("'{s}' is not a valid option id; valid ids: {}", valid.join(", "))))
            }
        }
        _ => Err(err("single_select requires a string option id or null")),
    }
}

fn coerce_multi_select(
    field_id: String,
    raw: &Json,
    options: &[crate::model::SelectOption],
) -> Result<CoercionOutcome, CoerceError> {
    let (ids, warning) = match raw {
        Json::Array(arr) => {
            let mut ids = Vec::with_capacity(arr.len());
            for v in arr {
                match v {
                    Json::String(s) => ids.push(s.clone()),
                    _ => return Err(err("multi_select items must be strings")),
                }
            }
            (ids, None)
        }
        Json::String(s) => (vec![s.clone()], Some("wrapped single string into a one-element array".to_string())),
        _ => return Err(err("expected an array of option ids or a single option id")),
    };
    let valid: Vec<&str> = options.iter().map(|o| o.id.as_str()).collect();
    for id in &ids {
        if !valid.contains(&id.as_str()) {
            return Err(err(format!("'{id}' is not a valid option id; valid ids: {}", valid.join(", "))));
        }
    }
    Ok(CoercionOutcome { patch: Patch::SetMultiSelect { field_id, selected: ids }, warning })
}

fn coerce_checkboxes(
    field_id: String,
    raw: &Json,
    options: &[crate::model::SelectOption],
    mode: crate::model::CheckboxMode,
) -> Result<CoercionOutcome, CoerceError> {
    let obj = raw.as_object().ok_or_else(|| err("checkboxes requires a mapping of optionId to state"))?;
    let valid_ids: Vec<&str> = options.iter().map(|o| o.id.as_str()).collect();
    let alphabet = mode.alphabet();
    let mut values = HashMap::new();
    for (k, v) in obj {
        if !valid_ids.contains(&k.as_str()) {
            return Err(err(format!("'{k}' is not a valid checkbox option id")));
        }
        let state_str = v.as_str().ok_or_else(|| err("checkbox state must be a string"))?;
        let state = parse_checkbox_state(state_str)
            .ok_or_else(|| err(format!("'{state_str}' is not a recognized checkbox state")))?;
        if !alphabet.contains(&state) {
            return Err(err(format!("{state_str} is not valid in {mode:?} mode", mode = mode)));
        }
        values.insert(k.clone(), state);
    }
    Ok(CoercionOutcome { patch: Patch::SetCheckboxes { field_id, values }, warning: None })
}

fn parse_checkbox_state(s: &str) -> Option<CheckboxState> {
    match s {
        "todo" => Some(CheckboxState::Todo),
        "done" => Some(CheckboxState::Done),
        "incomplete" => Some(CheckboxState::Incomplete),
        "active" => Some(CheckboxState::Active),
        "na" => Some(CheckboxState::Na),
        "unfilled" => Some(CheckboxState::Unfilled),
        "yes" => Some(CheckboxState::Yes),
        "no" => Some(CheckboxState::No),
        _ => None,
    }
}

fn coerce_date(field_id: String, raw: &Json) -> Result<CoercionOutcome, CoerceError> {
    match raw {
        Json::Null => Ok(CoercionOutcome { patch: Patch::SetDate { field_id, value: None }, warning: None }),
        Json::String(s) => {
            if chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d").is_err() {
                return Err(err(format!("'{s}' is not an ISO-8601 date")));
            }
            Ok(CoercionOutcome { patch: Patch::SetDate { field_id, value: Some(s.clone()) }, warning: None })
        }
        _ => Err(err("date field requires an ISO-8601 string")),
    }
}

fn coerce_year(field_id: String, raw: &Json) -> Result<CoercionOutcome, CoerceError> {
    match raw {
        Json::Null => Ok(CoercionOutcome { patch: Patch::SetYear { field_id, value: None }, warning: None }),
        Json::Number(n) => {
            let i = n.as_i64().ok_or_else(|| err("year must be an integer"))?;
            Ok(CoercionOutcome { patch: Patch::SetYear { field_id, value: Some(i) }, warning: None })
        }
        Json::String(s) => {
            let i: i64 = s.trim().parse().map_err(|_| err(format!("'{s}' is not a valid year")))?;
            Ok(CoercionOutcome {
                patch: Patch::SetYear { field_id, value: Some(i) },
                warning: Some("parsed numeric string".into()),
            })
        }
        _ => Err(err("year field requires an integer")),
    }
}

fn coerce_table(field_id: String, raw: &Json, columns: &[crate::model::Column]) -> Result<CoercionOutcome, CoerceError> {
    let arr = raw.as_array().ok_or_else(|| err("table requires an array of row objects"))?;
    let mut rows = Vec::with_capacity(arr.len());
    for row_json in arr {
        let obj = row_json.as_object().ok_or_else(|| err("each table row must be an object"))?;
        let mut row: TableRow = HashMap::new();
        for col in columns {
            let cell = obj.get(&col.id).cloned().unwrap_or(Json::Null);
            row.insert(col.id.clone(), coerce_cell(&cell, col.kind)?);
        }
        rows.push(row);
    }
    Ok(CoercionOutcome { patch: Patch::SetTable { field_id, rows }, warning: None })
}

fn coerce_cell(raw: &Json, kind: ColumnKind) -> Result<crate::model::CellValue, CoerceError> {
    use crate::model::CellValue;
    match (kind, raw) {
        (_, Json::Null) => Ok(CellValue::Null),
        (ColumnKind::String, Json::String(s)) => Ok(CellValue::Str(s.clone())),
        (ColumnKind::String, Json::Number(n)) => Ok(CellValue::Str(n.to_string())),
        (ColumnKind::Number, Json::Number(n)) => Ok(CellValue::Num(n.as_f64().unwrap_or_default())),
        (ColumnKind::Number, Json::String(s)) => {
            s.trim().parse::<f64>().map(CellValue::Num).map_err(|_| err(format!("'{s}' is not a number")))
        }
        (ColumnKind::Url, Json::String(s)) => {
            validate_absolute_url(s)?;
            Ok(CellValue::Str(s.clone()))
        }
        (ColumnKind::Date, Json::String(s)) => {
            if chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d").is_err() {
                return Err(err(format!("'{s}' is not an ISO-8601 date")));
            }
            Ok(CellValue::Str(s.clone()))
        }
        (ColumnKind::Year, Json::Number(n)) => Ok(CellValue::Num(n.as_f64().unwrap_or_default())),
        (ColumnKind::Year, Json::String(s)) => {
            s.trim().parse::<f64>().map(CellValue::Num).map_err(|_| err(format!("'{s}' is not a year")))
        }
        _ => Err(err("cell value does not match column kind")),
    }
}

/// `coerceInputContext(form, mapping) → {patches, warnings, errors}` (§4.1).
/// Unknown field ids are errors; unrecognized fields never silently vanish.
pub struct InputContextResult {
    pub patches: Vec<Patch>,
    pub warnings: Vec<PatchWarning>,
    pub errors: Vec<String>,
}

pub fn coerce_input_context(
    form: &crate::model::ParsedForm,
    mapping: &HashMap<String, Json>,
) -> InputContextResult {
    let mut patches = Vec::new();
    let mut warnings = Vec::new();
    let mut errors = Vec::new();
    for (field_id, raw) in mapping {
        match form.field(field_id) {
            None => errors.push(format!("unknown field id in input context: '{field_id}'")),
            Some(field) => match coerce_value(field, raw) {
                Ok(outcome) => {
                    if let Some(msg) = outcome.warning {
                        warnings.push(PatchWarning { field_id: field_id.clone(), message: msg });
                    }
                    patches.push(outcome.patch);
                }
                Err(e) => errors.push(format!("field '{field_id}': {e}")),
            },
        }
    }
    InputContextResult { patches, warnings, errors }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Field, FieldKind};
    use serde_json::json;

    fn number_field() -> Field {
        Field {
            id: "age".into(),
            label: "Age".into(),
            kind: FieldKind::Number { min: Some(0.0), max: Some(150.0), integer: true },
            role: "agent".into(),
            required: true,
            order: 0,
            parallel_batch: None,
        }
    }

    #[test]
    fn coerces_numeric_string_with_warning() {
        let f = number_field();
        let outcome = coerce_value(&f, &json!("42")).unwrap();
        assert!(outcome.warning.is_some());
        match outcome.patch {
            Patch::SetNumber { value, .. } => assert_eq!(value, Some(42.0)),
            _ => panic!("wrong patch"),
        }
    }

    #[test]
    fn rejects_empty_numeric_string() {
        let f = number_field();
        assert!(coerce_value(&f, &json!("")).is_err());
    }

    #[test]
    fn wraps_single_string_into_list_with_warning() {
        let f = Field {
            id: "tags".into(),
            label: "Tags".into(),
            kind: FieldKind::StringList { min_items: None, max_items: None },
            role: "agent".into(),
            required: false,
            order: 0,
            parallel_batch: None,
        };
        let outcome = coerce_value(&f, &json!("solo")).unwrap();
        assert!(outcome.warning.is_some());
        match outcome.patch {
            Patch::SetStringList { items, .. } => assert_eq!(items, vec!["solo".to_string()]),
            _ => panic!("wrong patch"),
        }
    }

    #[test]
    fn rejects_non_absolute_url() {
        let f = Field {
            id: "site".into(),
            label: "Site".into(),
            kind: FieldKind::Url,
            role: "agent".into(),
            required: false,
            order: 0,
            parallel_batch: None,
        };
        assert!(coerce_value(&f, &json!("not-a-url")).is_err());
    }

    #[test]
    fn unknown_field_in_input_context_is_an_error_not_a_silent_drop() {
        let schema = crate::model::Schema {
            id: "f".into(),
            title: "t".into(),
            description: None,
            groups: vec![],
        };
        let form = crate::model::ParsedForm::new(schema, vec![], vec![], Default::default());
        let mut mapping = HashMap::new();
        mapping.insert("ghost".to_string(), json!("x"));
        let result = coerce_input_context(&form, &mapping);
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].contains("ghost"));
    }
}
