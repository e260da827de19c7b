// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The inspector (C4, §4.3). Pure and synchronous: derives a prioritized
//! issue list and progress counts from current form state. Never mutates.

use crate::model::{CheckboxState, Field, FieldKind, FieldValue, Issue, IssueScope, IssueSeverity, ParsedForm, ResponseState};

#[derive(Debug, Clone, Default)]
pub struct StructureSummary {
    pub total_fields: usize,
    pub total_groups: usize,
}

#[derive(Debug, Clone, Default)]
pub struct ProgressSummary {
    pub answered_fields: usize,
    pub skipped_fields: usize,
    pub aborted_fields: usize,
    pub empty_fields: usize,
    pub required_issue_count: usize,
}

#[derive(Debug, Clone, Default)]
pub struct InspectOptions {
    pub target_roles: Option<Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct InspectResult {
    pub issues: Vec<Issue>,
    pub structure_summary: StructureSummary,
    pub progress_summary: ProgressSummary,
    pub is_complete: bool,
}

/// Fields whose `role` is in `roles`, or all fields when `roles == ["*"]`.
pub fn get_fields_for_roles<'a>(form: &'a ParsedForm, roles: &[String]) -> Vec<&'a Field> {
    let wildcard = roles.iter().any(|r| r == "*");
    form.all_fields().filter(|f| wildcard || roles.iter().any(|r| r == &f.role)).collect()
}

pub fn inspect(form: &ParsedForm, options: &InspectOptions) -> InspectResult {
    let target_roles = options.target_roles.clone().unwrap_or_else(|| vec!["agent".to_string()]);
    let target_fields = get_fields_for_roles(form, &target_roles);

    let mut issues = Vec::new();
    let mut progress = ProgressSummary::default();

    for field in &target_fields {
        let response = form.responses_by_field_id.get(&field.id);
        let state = response.map(|r| r.state).unwrap_or(ResponseState::Empty);
        match state {
            ResponseState::Answered => progress.answered_fields += 1,
            ResponseState::Skipped => progress.skipped_fields += 1,
            ResponseState::Aborted => progress.aborted_fields += 1,
            ResponseState::Empty => progress.empty_fields += 1,
        }

        // §4.5/§9 open question: aborted fields are suppressed from the
        // inspector entirely while aborted; clear_field returns them to empty.
        if state == ResponseState::Aborted {
            continue;
        }

        if state == ResponseState::Empty {
            if field.required {
                issues.push(Issue {
                    scope: IssueScope::Field,
                    r#ref: field.id.clone(),
                    message: format!("'{}' is required and has not been answered", field.label),
                    severity: IssueSeverity::Required,
                    priority: 1,
                    kind: "required_empty".to_string(),
                });
            } else {
                issues.push(Issue {
                    scope: IssueScope::Field,
                    r#ref: field.id.clone(),
                    message: format!("'{}' is optional and has not been answered", field.label),
                    severity: IssueSeverity::Recommended,
                    priority: 2,
                    kind: "optional_empty".to_string(),
                });
            }
            continue;
        }

        if state == ResponseState::Answered {
            if let Some(value) = response.and_then(|r| r.value.as_ref()) {
                issues.extend(constraint_issues(field, value));
            }
        }
    }

    issues.extend(group_and_form_issues(form, &target_fields));

    issues.sort_by_key(|i| (i.priority, field_order(form, i.field_id()), 0i64));

    progress.required_issue_count = issues.iter().filter(|i| i.severity == IssueSeverity::Required).count();
    let is_complete = !issues.iter().any(|i| i.severity == IssueSeverity::Required);

    InspectResult {
        issues,
        structure_summary: StructureSummary {
            total_fields: form.all_fields().count(),
            total_groups: form.schema.groups.len(),
        },
        progress_summary: progress,
        is_complete,
    }
}

fn field_order(form: &ParsedForm, field_id: &str) -> i64 {
    form.field(field_id).map(|f| f.order).unwrap_or(0)
}

fn constraint_issues(field: &Field, value: &FieldValue) -> Vec<Issue> {
    let mut out = Vec::new();
    let violation = match (&field.kind, value) {
        (FieldKind::String { min_length, max_length, pattern }, FieldValue::String { value: Some(v) }) => {
            let too_short = min_length.map(|m| v.len() < m).unwrap_or(false);
            let too_long = max_length.map(|m| v.len() > m).unwrap_or(false);
            let bad_pattern = pattern
                .as_ref()
                .and_then(|p| regex::Regex::new(p).ok())
                .map(|re| !re.is_match(v))
                .unwrap_or(false);
            too_short || too_long || bad_pattern
        }
        (FieldKind::Number { min, max, integer }, FieldValue::Number { value: Some(v) }) => {
            let below = min.map(|m| *v < m).unwrap_or(false);
            let above = max.map(|m| *v > m).unwrap_or(false);
            let not_int = *integer && v.fract() != 0.0;
            below || above || not_int
        }
        (FieldKind::StringList { min_items, max_items }, FieldValue::StringList { items }) => {
            min_items.map(|m| items.len() < m).unwrap_or(false) || max_items.map(|m| items.len() > m).unwrap_or(false)
        }
        (FieldKind::UrlList { min_items, max_items }, FieldValue::UrlList { items }) => {
            min_items.map(|m| items.len() < m).unwrap_or(false) || max_items.map(|m| items.len() > m).unwrap_or(false)
        }
        (FieldKind::Date { min_date, max_date }, FieldValue::Date { value: Some(v) }) => {
            min_date.as_deref().map(|m| v.as_str() < m).unwrap_or(false)
                || max_date.as_deref().map(|m| v.as_str() > m).unwrap_or(false)
        }
        (FieldKind::Year { min, max }, FieldValue::Year { value: Some(v) }) => {
            min.map(|m| *v < m).unwrap_or(false) || max.map(|m| *v > m).unwrap_or(false)
        }
        _ => false,
    };
    if violation {
        out.push(Issue {
            scope: IssueScope::Field,
            r#ref: field.id.clone(),
            message: format!("'{}' has a value that violates its constraints", field.label),
            severity: IssueSeverity::Required,
            priority: 1,
            kind: "constraint_violation".to_string(),
        });
    }

    if let (FieldKind::Checkboxes { options, checkbox_mode, min_done: Some(min) }, FieldValue::Checkboxes { values }) =
        (&field.kind, value)
    {
        let done_count =
            values.values().filter(|s| matches!(s, CheckboxState::Done | CheckboxState::Yes)).count();
        if done_count < *min {
            for opt in options {
                let state = values.get(&opt.id).copied();
                let unresolved = !matches!(state, Some(CheckboxState::Done) | Some(CheckboxState::Yes));
                if unresolved {
                    out.push(Issue {
                        scope: IssueScope::Option,
                        r#ref: format!("{}.{}", field.id, opt.id),
                        message: format!("minDone={min} not yet satisfied for '{}'", field.label),
                        severity: IssueSeverity::Required,
                        priority: 1,
                        kind: "checkbox_min_done".to_string(),
                    });
                }
            }
            let _ = checkbox_mode;
        }
    }
    out
}

fn group_and_form_issues(form: &ParsedForm, target_fields: &[&Field]) -> Vec<Issue> {
    let mut out = Vec::new();
    for group in &form.schema.groups {
        if group.fields.is_empty() && !group.implicit {
            out.push(Issue {
                scope: IssueScope::Group,
                r#ref: group.id.clone(),
                message: format!("group '{}' has no fields", group.title),
                severity: IssueSeverity::Informational,
                priority: 3,
                kind: "empty_group".to_string(),
            });
        }
    }
    let target_ids: std::collections::HashSet<&str> = target_fields.iter().map(|f| f.id.as_str()).collect();
    for note in &form.notes {
        let refers_to_known = form.id_index.contains_key(&note.r#ref);
        if !refers_to_known {
            out.push(Issue {
                scope: IssueScope::Form,
                r#ref: note.id.clone(),
                message: format!("note '{}' refers to unknown id '{}'", note.id, note.r#ref),
                severity: IssueSeverity::Informational,
                priority: 3,
                kind: "orphan_note".to_string(),
            });
        }
    }
    let _ = target_ids;
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apply::apply;
    use crate::model::{Field, FormMetadata, Group, Patch, Schema};

    fn form() -> ParsedForm {
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
                        kind: FieldKind::String { min_length: None, max_length: None, pattern: None },
                        role: "agent".into(),
                        required: true,
                        order: 0,
                        parallel_batch: None,
                    },
                    Field {
                        id: "nickname".into(),
                        label: "Nickname".into(),
                        kind: FieldKind::String { min_length: None, max_length: None, pattern: None },
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
    fn required_empty_field_is_severity_required_priority_1() {
        let form = form();
        let result = inspect(&form, &InspectOptions::default());
        let name_issue = result.issues.iter().find(|i| i.r#ref == "name").unwrap();
        assert_eq!(name_issue.severity, IssueSeverity::Required);
        assert_eq!(name_issue.priority, 1);
        assert!(!result.is_complete);
    }

    #[test]
    fn optional_empty_field_is_recommended() {
        let form = form();
        let result = inspect(&form, &InspectOptions::default());
        let nick_issue = result.issues.iter().find(|i| i.r#ref == "nickname").unwrap();
        assert_eq!(nick_issue.severity, IssueSeverity::Recommended);
    }

    #[test]
    fn is_complete_once_all_required_answered() {
        let mut form = form();
        apply(&mut form, &[Patch::SetString { field_id: "name".into(), value: Some("Alice".into()) }]);
        let result = inspect(&form, &InspectOptions::default());
        assert!(result.is_complete);
    }

    #[test]
    fn aborted_field_is_suppressed_until_cleared() {
        let mut form = form();
        apply(&mut form, &[Patch::AbortField { field_id: "name".into(), reason: None }]);
        let result = inspect(&form, &InspectOptions::default());
        assert!(!result.issues.iter().any(|i| i.r#ref == "name"));
        apply(&mut form, &[Patch::ClearField { field_id: "name".into() }]);
        let result2 = inspect(&form, &InspectOptions::default());
        assert!(result2.issues.iter().any(|i| i.r#ref == "name"));
    }

    #[test]
    fn issues_sorted_by_priority_then_order() {
        let form = form();
        let result = inspect(&form, &InspectOptions::default());
        for pair in result.issues.windows(2) {
            assert!(pair[0].priority <= pair[1].priority);
        }
    }

    #[test]
    fn get_fields_for_roles_supports_wildcard() {
        let form = form();
        let fields = get_fields_for_roles(&form, &["*".to_string()]);
        assert_eq!(fields.len(), 2);
    }
}
