// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;

use crate::{CompletionRequest, ResponseEvent};

pub type ResponseStream = Pin<Box<dyn Stream<Item = anyhow::Result<ResponseEvent>> + Send>>;

/// The `LanguageModel` abstraction consumed by the harness (§6.5).
///
/// Provider-specific wire protocols (Anthropic/OpenAI/etc request shaping)
/// are out of scope (§1) — this trait is the seam an external adapter
/// crate would implement. `markform-model` ships only [`crate::MockProvider`]
/// and [`crate::ScriptedMockProvider`], which implement this trait directly
/// for tests and for the harness's own `MockAgent` (§4.7).
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Human-readable provider name, e.g. `"anthropic"`.
    fn provider_name(&self) -> &str;

    /// Model identifier as reported to callers, e.g. `"claude-opus-4-5"`.
    fn model_name(&self) -> &str;

    /// Send a completion request and return a streamed response.
    async fn complete(&self, req: CompletionRequest) -> anyhow::Result<ResponseStream>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Message, MockProvider};

    #[tokio::test]
    async fn mock_provider_implements_language_model() {
        let p = MockProvider;
        assert_eq!(p.provider_name(), "mock");
        let req = CompletionRequest { messages: vec![Message::user("hi")], ..Default::default() };
        let stream = p.complete(req).await;
        assert!(stream.is_ok());
    }
}
