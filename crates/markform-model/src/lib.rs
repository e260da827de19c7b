// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Model-provider seam: message/tool-call types, the [`LanguageModel`] trait,
//! a static driver registry for API-key-env resolution, and deterministic
//! mock providers for tests. Wire protocols for concrete providers
//! (Anthropic, OpenAI, ...) are out of scope and are left to an external
//! adapter crate.

mod mock;
mod provider;
mod registry;
mod types;

pub use mock::{MockProvider, ScriptedMockProvider};
pub use provider::{LanguageModel, ResponseStream};
pub use registry::{get_driver, DriverMeta, DRIVERS};
pub use types::{
    CompletionRequest, FunctionCall, Message, MessageContent, ResponseEvent, Role, ToolChoice,
    ToolSchema, Usage,
};
