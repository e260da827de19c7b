// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Harness state machines (C6 serial, C7 parallel): the protocol that drives
//! inspect → agent → apply to completion under turn/patch/issue budgets.

pub mod parallel;
pub mod serial;

use crate::model::{Issue, ParsedForm};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillMode {
    Continue,
    Overwrite,
}

#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub max_turns: u32,
    pub max_patches_per_turn: u32,
    pub max_issues_per_turn: u32,
    pub max_fields_per_turn: u32,
    pub max_groups_per_turn: u32,
    pub fill_mode: FillMode,
    pub target_roles: Vec<String>,
    /// Concurrency cap for the parallel harness (§4.6); unused by the serial
    /// harness.
    pub max_parallel_agents: u32,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            max_turns: 100,
            max_patches_per_turn: 20,
            max_issues_per_turn: 20,
            max_fields_per_turn: 20,
            max_groups_per_turn: 10,
            fill_mode: FillMode::Continue,
            target_roles: vec!["agent".to_string()],
            max_parallel_agents: 4,
        }
    }
}

/// Bound the issues shown to the agent this turn (§4.5 `step`): form-scoped
/// issues always pass; field/option/cell-scoped issues are admitted only
/// while the distinct field/group set they touch stays under the caps, then
/// the whole list is capped to `maxIssues`.
pub fn filter_issues_by_scope(issues: Vec<Issue>, form: &ParsedForm, config: &HarnessConfig) -> Vec<Issue> {
    let mut out = Vec::new();
    let mut fields_seen = std::collections::HashSet::new();
    let mut groups_seen = std::collections::HashSet::new();

    for issue in issues {
        match issue.scope {
            crate::model::IssueScope::Form => out.push(issue),
            crate::model::IssueScope::Group => {
                let would_be_new = !groups_seen.contains(&issue.r#ref);
                if would_be_new && groups_seen.len() as u32 >= config.max_groups_per_turn {
                    continue;
                }
                groups_seen.insert(issue.r#ref.clone());
                out.push(issue);
            }
            crate::model::IssueScope::Field | crate::model::IssueScope::Option | crate::model::IssueScope::Cell => {
                let field_id = issue.field_id().to_string();
                let field_is_new = !fields_seen.contains(&field_id);
                if field_is_new && fields_seen.len() as u32 >= config.max_fields_per_turn {
                    continue;
                }
                let group_id = form.group_of(&field_id).map(|g| g.id.clone());
                if let Some(gid) = &group_id {
                    let group_is_new = !groups_seen.contains(gid);
                    if group_is_new && groups_seen.len() as u32 >= config.max_groups_per_turn {
                        continue;
                    }
                    groups_seen.insert(gid.clone());
                }
                fields_seen.insert(field_id);
                out.push(issue);
            }
        }
    }

    out.truncate(config.max_issues_per_turn as usize);
    out
}
