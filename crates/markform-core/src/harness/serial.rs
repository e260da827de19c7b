// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The serial harness (C6, §4.5): state machine `{init, step, wait,
//! complete}` with turn/patch/issue budgets.

use std::sync::Arc;

use crate::agent::TurnStats;
use crate::apply::apply;
use crate::inspect::{inspect, InspectOptions, ProgressSummary, StructureSummary};
use crate::model::{Issue, ParsedForm, Patch, PatchRejection, PatchWarning};
use crate::serialize::{markdown_sha256, FormSerializer, JsonFormSerializer};

use super::{filter_issues_by_scope, FillMode, HarnessConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HarnessState {
    Init,
    Step,
    Wait,
    Complete,
}

#[derive(Debug, Clone)]
pub struct StepResult {
    pub issues: Vec<Issue>,
    pub step_budget: usize,
    pub progress_summary: ProgressSummary,
    pub structure_summary: StructureSummary,
    pub is_complete: bool,
    pub turn_number: u32,
}

#[derive(Debug, Clone)]
pub struct TurnAfter {
    pub required_issue_count: usize,
    pub markdown_sha256: String,
    pub answered_field_count: usize,
    pub skipped_field_count: usize,
}

#[derive(Debug, Clone)]
pub struct SessionTurn {
    pub turn: u32,
    pub inspected_issues: Vec<Issue>,
    pub applied_patches: Vec<Patch>,
    pub rejected_patches: Vec<PatchRejection>,
    pub warnings: Vec<PatchWarning>,
    pub after: TurnAfter,
    pub llm_stats: Option<TurnStats>,
}

pub struct SerialHarness {
    form: ParsedForm,
    config: HarnessConfig,
    state: HarnessState,
    turn_number: u32,
    turns: Vec<SessionTurn>,
    did_overwrite_clear: bool,
    serializer: Arc<dyn FormSerializer>,
}

impl SerialHarness {
    pub fn new(form: ParsedForm, config: HarnessConfig) -> Self {
        Self::with_serializer(form, config, Arc::new(JsonFormSerializer))
    }

    pub fn with_serializer(form: ParsedForm, config: HarnessConfig, serializer: Arc<dyn FormSerializer>) -> Self {
        Self {
            form,
            config,
            state: HarnessState::Init,
            turn_number: 0,
            turns: Vec::new(),
            did_overwrite_clear: false,
            serializer,
        }
    }

    pub fn state(&self) -> HarnessState {
        self.state
    }

    pub fn form(&self) -> &ParsedForm {
        &self.form
    }

    pub fn into_form(self) -> ParsedForm {
        self.form
    }

    pub fn turns(&self) -> &[SessionTurn] {
        &self.turns
    }

    pub fn turn_number(&self) -> u32 {
        self.turn_number
    }

    /// Seed the turn counter when resuming a fill across calls (§4.8 step 7,
    /// §8 scenario F). Only meaningful before the first `step()`.
    pub fn set_turn_number(&mut self, turn_number: u32) {
        self.turn_number = turn_number;
    }

    /// `hasReachedMaxTurns`: true iff the last allowed turn's `apply` has
    /// already happened. At `turnNumber == maxTurns` in state `wait` one more
    /// apply is still owed, so this is false there (§4.5, §9 open question 1
    /// — the later, non-buggy variant).
    pub fn has_reached_max_turns(&self) -> bool {
        match self.state {
            HarnessState::Wait => false,
            _ => self.turn_number >= self.config.max_turns,
        }
    }

    fn inspect_now(&self) -> crate::inspect::InspectResult {
        inspect(&self.form, &InspectOptions { target_roles: Some(self.config.target_roles.clone()) })
    }

    fn snapshot_after(&self, required_issue_count: usize) -> TurnAfter {
        let text = self.serializer.serialize(&self.form);
        let answered = self
            .form
            .responses_by_field_id
            .values()
            .filter(|r| r.state == crate::model::ResponseState::Answered)
            .count();
        let skipped = self
            .form
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

    /// `init -> step` (and `wait -> step` internally after `apply`).
    pub fn step(&mut self) -> StepResult {
        if self.state == HarnessState::Init && self.config.fill_mode == FillMode::Overwrite && !self.did_overwrite_clear {
            let target_fields: Vec<String> = crate::inspect::get_fields_for_roles(&self.form, &self.config.target_roles)
                .into_iter()
                .map(|f| f.id.clone())
                .collect();
            let clears: Vec<Patch> = target_fields.into_iter().map(|field_id| Patch::ClearField { field_id }).collect();
            apply(&mut self.form, &clears);
            self.did_overwrite_clear = true;
        }

        let inspected = self.inspect_now();
        let filtered = filter_issues_by_scope(inspected.issues, &self.form, &self.config);
        let step_budget = (self.config.max_patches_per_turn as usize).min(filtered.len());

        self.state = if inspected.is_complete { HarnessState::Complete } else { HarnessState::Wait };

        StepResult {
            issues: filtered,
            step_budget,
            progress_summary: inspected.progress_summary,
            structure_summary: inspected.structure_summary,
            is_complete: inspected.is_complete,
            turn_number: self.turn_number,
        }
    }

    /// `wait -> apply(patches, shownIssues, llmStats?)`.
    ///
    /// # Panics
    /// If `patches.len() > maxPatchesPerTurn` — a programming error (an
    /// agent that ignored its budget), not a user-facing condition (§4.5,
    /// §7 propagation policy).
    pub fn apply_turn(&mut self, patches: &[Patch], shown_issues: &[Issue], llm_stats: Option<TurnStats>) -> StepResult {
        assert!(
            patches.len() <= self.config.max_patches_per_turn as usize,
            "apply_turn called with {} patches, exceeding maxPatchesPerTurn={}",
            patches.len(),
            self.config.max_patches_per_turn
        );
        assert_eq!(self.state, HarnessState::Wait, "apply_turn called outside the wait state");

        let result = apply(&mut self.form, patches);
        self.turn_number += 1;

        let reinspected = self.inspect_now();
        let after = self.snapshot_after(reinspected.progress_summary.required_issue_count);

        self.turns.push(SessionTurn {
            turn: self.turn_number,
            inspected_issues: shown_issues.to_vec(),
            applied_patches: result.applied,
            rejected_patches: result.rejected,
            warnings: result.warnings,
            after,
            llm_stats,
        });

        let filtered = filter_issues_by_scope(reinspected.issues, &self.form, &self.config);
        self.state = if reinspected.is_complete || self.turn_number >= self.config.max_turns {
            HarnessState::Complete
        } else {
            HarnessState::Wait
        };

        StepResult {
            issues: filtered,
            step_budget: (self.config.max_patches_per_turn as usize).min(reinspected.progress_summary.required_issue_count),
            progress_summary: reinspected.progress_summary,
            structure_summary: reinspected.structure_summary,
            is_complete: reinspected.is_complete,
            turn_number: self.turn_number,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Field, FieldKind, FormMetadata, Group, Schema};

    fn two_field_form() -> ParsedForm {
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
    fn scenario_a_completes_in_one_turn() {
        let mut harness = SerialHarness::new(two_field_form(), HarnessConfig::default());
        let step = harness.step();
        assert_eq!(step.issues.len(), 2);
        let patches = vec![
            Patch::SetString { field_id: "name".into(), value: Some("Alice".into()) },
            Patch::SetNumber { field_id: "age".into(), value: Some(30.0) },
        ];
        let after = harness.apply_turn(&patches, &step.issues, None);
        assert!(after.is_complete);
        assert_eq!(harness.turn_number(), 1);
        assert_eq!(harness.turns()[0].applied_patches.len(), 2);
    }

    #[test]
    #[should_panic]
    fn apply_turn_panics_when_patches_exceed_budget() {
        let mut config = HarnessConfig::default();
        config.max_patches_per_turn = 1;
        let mut harness = SerialHarness::new(two_field_form(), config);
        harness.step();
        let patches = vec![
            Patch::SetString { field_id: "name".into(), value: Some("Alice".into()) },
            Patch::SetNumber { field_id: "age".into(), value: Some(30.0) },
        ];
        harness.apply_turn(&patches, &[], None);
    }

    #[test]
    fn has_reached_max_turns_is_false_mid_final_turn() {
        let mut config = HarnessConfig::default();
        config.max_turns = 1;
        let mut harness = SerialHarness::new(two_field_form(), config);
        harness.step();
        assert!(!harness.has_reached_max_turns());
        harness.apply_turn(
            &[Patch::SetString { field_id: "name".into(), value: Some("Alice".into()) }],
            &[],
            None,
        );
        assert!(harness.has_reached_max_turns());
    }

    #[test]
    fn overwrite_mode_clears_all_target_fields_on_first_step() {
        let mut form = two_field_form();
        apply(&mut form, &[Patch::SetString { field_id: "name".into(), value: Some("Bob".into()) }]);
        let mut config = HarnessConfig::default();
        config.fill_mode = FillMode::Overwrite;
        let mut harness = SerialHarness::new(form, config);
        harness.step();
        assert_eq!(harness.form().responses_by_field_id["name"].state, crate::model::ResponseState::Empty);
    }
}
