// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! FillRecord collector (C10, §4.9). An append-only event log; all
//! derivation (pairing, percentiles, timing) runs at `get_record` time over
//! the snapshot (§9 "append-only event log for observability").

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone)]
enum RecordEvent {
    TurnStart { execution_id: String, turn_number: u32 },
    TurnComplete { execution_id: String, turn_number: u32, issues_addressed: usize, patches_applied: usize, patches_rejected: usize },
    LlmCallStart { execution_id: String },
    LlmCallEnd { execution_id: String, input_tokens: u32, output_tokens: u32 },
    ToolStart { execution_id: String, tool_name: String },
    ToolEnd { execution_id: String, tool_name: String, success: bool, result_count: Option<usize> },
    WebSearch { execution_id: String, query: String },
}

#[derive(Debug, Clone)]
struct LoggedEvent {
    at: DateTime<Utc>,
    event: RecordEvent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FillStatusKind {
    Completed,
    Partial,
}

pub struct FillRecordCollector {
    events: Vec<LoggedEvent>,
    started_at: DateTime<Utc>,
    status_override: Option<FillStatusKind>,
}

impl FillRecordCollector {
    pub fn new(started_at: DateTime<Utc>) -> Self {
        Self { events: Vec::new(), started_at, status_override: None }
    }

    fn push(&mut self, at: DateTime<Utc>, event: RecordEvent) {
        self.events.push(LoggedEvent { at, event });
    }

    pub fn on_turn_start(&mut self, at: DateTime<Utc>, execution_id: &str, turn_number: u32) {
        self.push(at, RecordEvent::TurnStart { execution_id: execution_id.to_string(), turn_number });
    }

    pub fn on_turn_complete(
        &mut self,
        at: DateTime<Utc>,
        execution_id: &str,
        turn_number: u32,
        issues_addressed: usize,
        patches_applied: usize,
        patches_rejected: usize,
    ) {
        self.push(
            at,
            RecordEvent::TurnComplete {
                execution_id: execution_id.to_string(),
                turn_number,
                issues_addressed,
                patches_applied,
                patches_rejected,
            },
        );
    }

    pub fn on_llm_call_start(&mut self, at: DateTime<Utc>, execution_id: &str) {
        self.push(at, RecordEvent::LlmCallStart { execution_id: execution_id.to_string() });
    }

    pub fn on_llm_call_end(&mut self, at: DateTime<Utc>, execution_id: &str, input_tokens: u32, output_tokens: u32) {
        self.push(at, RecordEvent::LlmCallEnd { execution_id: execution_id.to_string(), input_tokens, output_tokens });
    }

    pub fn on_tool_start(&mut self, at: DateTime<Utc>, execution_id: &str, tool_name: &str) {
        self.push(at, RecordEvent::ToolStart { execution_id: execution_id.to_string(), tool_name: tool_name.to_string() });
    }

    pub fn on_tool_end(&mut self, at: DateTime<Utc>, execution_id: &str, tool_name: &str, success: bool, result_count: Option<usize>) {
        self.push(
            at,
            RecordEvent::ToolEnd { execution_id: execution_id.to_string(), tool_name: tool_name.to_string(), success, result_count },
        );
    }

    pub fn on_web_search(&mut self, at: DateTime<Utc>, execution_id: &str, query: &str) {
        self.push(at, RecordEvent::WebSearch { execution_id: execution_id.to_string(), query: query.to_string() });
    }

    pub fn set_status(&mut self, status: FillStatusKind) {
        self.status_override = Some(status);
    }

    /// Assemble the `FillRecord` from the accumulated event log.
    pub fn get_record(&self, form_progress: FormProgress, parallel_enabled: bool, max_parallel_agents: Option<u32>) -> FillRecord {
        let timeline = self.build_timeline();
        let tool_summary = self.build_tool_summary();
        let timing = self.build_timing(&timeline);

        let mut order_levels: Vec<i64> = Vec::new();
        let mut execution_threads: Vec<String> = Vec::new();
        for entry in &timeline {
            if !execution_threads.contains(&entry.execution_id) {
                execution_threads.push(entry.execution_id.clone());
            }
            if let Some(order) = entry.order {
                if !order_levels.contains(&order) {
                    order_levels.push(order);
                }
            }
        }
        order_levels.sort();

        let status = self.status_override.unwrap_or_else(|| {
            if form_progress.unanswered_required == 0 {
                FillStatusKind::Completed
            } else {
                FillStatusKind::Partial
            }
        });

        FillRecord {
            timeline,
            tool_summary,
            timing,
            execution: ExecutionMetadata {
                total_turns: self.distinct_turn_count(),
                parallel_enabled,
                max_parallel_agents,
                order_levels,
                execution_threads,
            },
            form_progress,
            status,
        }
    }

    fn distinct_turn_count(&self) -> usize {
        let mut seen = std::collections::HashSet::new();
        for e in &self.events {
            if let RecordEvent::TurnComplete { execution_id, turn_number, .. } = &e.event {
                seen.insert((execution_id.clone(), *turn_number));
            }
        }
        seen.len()
    }

    fn build_timeline(&self) -> Vec<TimelineEntry> {
        // Pair turn_start/turn_complete by composite key (executionId, turnNumber),
        // falling back to first-unmatched-start for legacy events (§4.9).
        let mut starts: HashMap<(String, u32), Vec<DateTime<Utc>>> = HashMap::new();
        for e in &self.events {
            if let RecordEvent::TurnStart { execution_id, turn_number } = &e.event {
                starts.entry((execution_id.clone(), *turn_number)).or_default().push(e.at);
            }
        }

        let mut entries = Vec::new();
        for e in &self.events {
            if let RecordEvent::TurnComplete { execution_id, turn_number, issues_addressed, patches_applied, patches_rejected } =
                &e.event
            {
                let key = (execution_id.clone(), *turn_number);
                let started_at = starts
                    .get_mut(&key)
                    .and_then(|v| if v.is_empty() { None } else { Some(v.remove(0)) })
                    .unwrap_or(e.at);
                let completed_at = e.at;

                let tokens = self.sum_tokens_for(execution_id, started_at, completed_at);
                let tool_calls = self.tool_calls_for(execution_id, started_at, completed_at);
                let order = execution_id.split('-').next().and_then(|s| s.parse::<i64>().ok());

                entries.push(TimelineEntry {
                    execution_id: execution_id.clone(),
                    turn_number: *turn_number,
                    started_at,
                    completed_at,
                    start_ms: (started_at - self.started_at).num_milliseconds().max(0),
                    duration_ms: (completed_at - started_at).num_milliseconds().max(0),
                    issues_addressed: *issues_addressed,
                    patches_applied: *patches_applied,
                    patches_rejected: *patches_rejected,
                    tokens,
                    tool_calls,
                    order,
                });
            }
        }
        entries.sort_by_key(|e| e.started_at);
        entries
    }

    fn sum_tokens_for(&self, execution_id: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> u32 {
        self.events
            .iter()
            .filter_map(|e| match &e.event {
                RecordEvent::LlmCallEnd { execution_id: eid, input_tokens, output_tokens }
                    if eid == execution_id && e.at >= start && e.at <= end =>
                {
                    Some(input_tokens + output_tokens)
                }
                _ => None,
            })
            .sum()
    }

    fn tool_calls_for(&self, execution_id: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<String> {
        self.events
            .iter()
            .filter_map(|e| match &e.event {
                RecordEvent::ToolEnd { execution_id: eid, tool_name, .. } if eid == execution_id && e.at >= start && e.at <= end => {
                    Some(tool_name.clone())
                }
                _ => None,
            })
            .collect()
    }

    fn build_tool_summary(&self) -> HashMap<String, ToolSummary> {
        let mut starts: HashMap<(String, String), Vec<DateTime<Utc>>> = HashMap::new();
        for e in &self.events {
            if let RecordEvent::ToolStart { execution_id, tool_name } = &e.event {
                starts.entry((execution_id.clone(), tool_name.clone())).or_default().push(e.at);
            }
        }

        let mut durations_by_tool: HashMap<String, Vec<i64>> = HashMap::new();
        let mut calls: HashMap<String, (u32, u32, Vec<usize>)> = HashMap::new();

        for e in &self.events {
            if let RecordEvent::ToolEnd { execution_id, tool_name, success, result_count } = &e.event {
                let key = (execution_id.clone(), tool_name.clone());
                let started = starts.get_mut(&key).and_then(|v| if v.is_empty() { None } else { Some(v.remove(0)) }).unwrap_or(e.at);
                let dur = (e.at - started).num_milliseconds().max(0);
                durations_by_tool.entry(tool_name.clone()).or_default().push(dur);

                let entry = calls.entry(tool_name.clone()).or_insert((0, 0, Vec::new()));
                if *success {
                    entry.0 += 1;
                } else {
                    entry.1 += 1;
                }
                if let Some(rc) = result_count {
                    entry.2.push(*rc);
                }
            }
        }

        let mut out = HashMap::new();
        for (tool_name, (success_count, failure_count, results)) in calls {
            let call_count = success_count + failure_count;
            let mut durations = durations_by_tool.remove(&tool_name).unwrap_or_default();
            durations.sort();
            let timing = build_timing_stats(&durations);
            let results_summary = if results.is_empty() {
                None
            } else {
                let total: usize = results.iter().sum();
                Some(ToolResultsSummary {
                    total_results: total,
                    avg_results_per_call: total as f64 / results.len() as f64,
                    zero_result_calls: results.iter().filter(|r| **r == 0).count(),
                })
            };
            out.insert(
                tool_name,
                ToolSummary {
                    call_count,
                    success_count,
                    failure_count,
                    success_rate: if call_count > 0 { success_count as f64 / call_count as f64 } else { 0.0 },
                    results: results_summary,
                    timing,
                },
            );
        }
        out
    }

    fn build_timing(&self, timeline: &[TimelineEntry]) -> TimingBreakdown {
        let total_ms = self
            .events
            .iter()
            .map(|e| (e.at - self.started_at).num_milliseconds())
            .max()
            .unwrap_or(0)
            .max(0);

        let llm_time_ms: i64 = timeline.iter().map(|t| t.duration_ms).sum();
        let tool_time_ms: i64 = self
            .build_tool_summary()
            .values()
            .map(|s| s.timing.total_ms)
            .sum();

        // Sums can exceed wall-clock under parallelism; clamp (§4.9).
        let overhead_ms = (total_ms - llm_time_ms - tool_time_ms).max(0);

        let breakdown = if total_ms > 0 {
            vec![
                ("llm".to_string(), llm_time_ms as f64 / total_ms as f64 * 100.0),
                ("tools".to_string(), tool_time_ms as f64 / total_ms as f64 * 100.0),
                ("overhead".to_string(), overhead_ms as f64 / total_ms as f64 * 100.0),
            ]
        } else {
            vec![]
        };

        let effective_parallelism = if total_ms > 0 { Some((llm_time_ms + tool_time_ms) as f64 / total_ms as f64) } else { None };

        TimingBreakdown { total_ms, llm_time_ms, tool_time_ms, overhead_ms, breakdown, effective_parallelism }
    }
}

fn build_timing_stats(sorted_durations: &[i64]) -> ToolTiming {
    if sorted_durations.is_empty() {
        return ToolTiming { total_ms: 0, avg_ms: 0.0, min_ms: 0, max_ms: 0, p50_ms: 0.0, p95_ms: 0.0 };
    }
    let total: i64 = sorted_durations.iter().sum();
    let avg = total as f64 / sorted_durations.len() as f64;
    ToolTiming {
        total_ms: total,
        avg_ms: avg,
        min_ms: sorted_durations[0],
        max_ms: sorted_durations[sorted_durations.len() - 1],
        p50_ms: percentile(sorted_durations, 0.50),
        p95_ms: percentile(sorted_durations, 0.95),
    }
}

/// Linear-interpolation percentile over already-sorted samples (§4.9).
fn percentile(sorted: &[i64], p: f64) -> f64 {
    if sorted.len() == 1 {
        return sorted[0] as f64;
    }
    let rank = p * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    if lower == upper {
        sorted[lower] as f64
    } else {
        let frac = rank - lower as f64;
        sorted[lower] as f64 * (1.0 - frac) + sorted[upper] as f64 * frac
    }
}

#[derive(Debug, Clone, Default)]
pub struct FormProgress {
    pub answered_fields: usize,
    pub unanswered_required: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineEntry {
    pub execution_id: String,
    pub turn_number: u32,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub start_ms: i64,
    pub duration_ms: i64,
    pub issues_addressed: usize,
    pub patches_applied: usize,
    pub patches_rejected: usize,
    pub tokens: u32,
    pub tool_calls: Vec<String>,
    pub order: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResultsSummary {
    pub total_results: usize,
    pub avg_results_per_call: f64,
    pub zero_result_calls: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolTiming {
    pub total_ms: i64,
    pub avg_ms: f64,
    pub min_ms: i64,
    pub max_ms: i64,
    pub p50_ms: f64,
    pub p95_ms: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSummary {
    pub call_count: u32,
    pub success_count: u32,
    pub failure_count: u32,
    pub success_rate: f64,
    pub results: Option<ToolResultsSummary>,
    pub timing: ToolTiming,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingBreakdown {
    pub total_ms: i64,
    pub llm_time_ms: i64,
    pub tool_time_ms: i64,
    pub overhead_ms: i64,
    pub breakdown: Vec<(String, f64)>,
    pub effective_parallelism: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionMetadata {
    pub total_turns: usize,
    pub parallel_enabled: bool,
    pub max_parallel_agents: Option<u32>,
    pub order_levels: Vec<i64>,
    pub execution_threads: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FillRecord {
    pub timeline: Vec<TimelineEntry>,
    pub tool_summary: HashMap<String, ToolSummary>,
    pub timing: TimingBreakdown,
    pub execution: ExecutionMetadata,
    pub form_progress: FormProgress,
    pub status: FillStatusKind,
}

impl FillRecord {
    /// A stable projection for golden-test comparisons: strips every timing
    /// and timestamp-bearing field (§4.9).
    pub fn stable_projection(&self) -> StableProjection {
        StableProjection {
            timeline: self
                .timeline
                .iter()
                .map(|t| StableTimelineEntry {
                    execution_id: t.execution_id.clone(),
                    turn_number: t.turn_number,
                    issues_addressed: t.issues_addressed,
                    patches_applied: t.patches_applied,
                    patches_rejected: t.patches_rejected,
                    tokens: t.tokens,
                    tool_calls: t.tool_calls.clone(),
                    order: t.order,
                })
                .collect(),
            execution: self.execution.clone(),
            status: self.status,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StableTimelineEntry {
    pub execution_id: String,
    pub turn_number: u32,
    pub issues_addressed: usize,
    pub patches_applied: usize,
    pub patches_rejected: usize,
    pub tokens: u32,
    pub tool_calls: Vec<String>,
    pub order: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StableProjection {
    pub timeline: Vec<StableTimelineEntry>,
    pub execution: ExecutionMetadata,
    pub status: FillStatusKind,
}
