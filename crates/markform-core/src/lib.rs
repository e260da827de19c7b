// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The fill engine: data model, value coercion, patch applier, inspector,
//! execution planner, agent contract, harness state machines, serializer
//! seam and `FillRecord` observability, wired together by `fill_form`.

pub mod agent;
pub mod apply;
pub mod coerce;
pub mod error;
pub mod harness;
pub mod inspect;
pub mod model;
pub mod orchestrator;
pub mod plan;
pub mod record;
pub mod serialize;

pub use agent::{Agent, AgentResponse, LiveAgent, LiveAgentConfig, MockAgent, RejectionRecoveryMockAgent, TurnStats};
pub use apply::{apply, ApplyResult};
pub use coerce::{coerce_input_context, coerce_value, CoerceError, CoercionOutcome, InputContextResult};
pub use error::FillError;
pub use harness::parallel::{ParallelCallbacks, ParallelRunResult};
pub use harness::serial::{HarnessState, SerialHarness, SessionTurn};
pub use harness::{filter_issues_by_scope, FillMode, HarnessConfig};
pub use inspect::{inspect, InspectOptions, InspectResult, ProgressSummary, StructureSummary};
pub use model::{
    CellValue, CheckboxMode, CheckboxState, Column, ColumnKind, DocumentationBlock, Field, FieldKind, FieldValue,
    FormMetadata, Group, HarnessConfigOverride, IdIndexEntry, Issue, IssueScope, IssueSeverity, NodeType, Note,
    Patch, PatchRejection, PatchWarning, ParsedForm, Response, ResponseState, RunMode, Schema, SelectOption,
    TableRow,
};
pub use orchestrator::{fill_form, CancellationSignal, FillCallbacks, FillOptions, FillResult, FillStatus, TurnCallback};
pub use plan::{plan, ExecutionPlan, ItemType, OrderLevelPlan, ParallelBatch, PlanItem};
pub use record::{
    ExecutionMetadata, FillRecord, FillRecordCollector, FillStatusKind, FormProgress, StableProjection, TimelineEntry,
    TimingBreakdown, ToolSummary,
};
pub use serialize::{markdown_sha256, FormSerializer, JsonFormSerializer};
