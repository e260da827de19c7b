// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Error taxonomy (§7). The harness loop never throws through to the caller
//! except for programming errors (invariant violations); everything else
//! becomes structured data on `FillResult`/`FillRecord`. `FillError` is the
//! typed core used internally and at configuration/parse boundaries; callers
//! further up generally see it wrapped in `anyhow::Result`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FillError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("could not parse form: {0}")]
    Parse(String),

    #[error("coercion error: {0}")]
    Coercion(String),

    #[error("fill cancelled")]
    Cancelled,

    #[error("budget exceeded: {0}")]
    BudgetExceeded(String),

    #[error("agent error: {0}")]
    Agent(String),

    #[error("invariant violated: {0}")]
    Invariant(String),
}

impl FillError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::Invariant(msg.into())
    }
}
