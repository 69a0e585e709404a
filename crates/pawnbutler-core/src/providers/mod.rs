// Pawnbutler Core — LLM Provider Facade
// The core never implements a provider wire protocol. Concrete adapters
// (Anthropic, OpenAI, Google, local) live outside and implement
// `LlmProvider`; the core calls `chat_stream` for summarisation and agent
// reasoning and observes typed events for metering.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::atoms::error::EngineResult;

// ── Provider variants ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Anthropic,
    Openai,
    Google,
    Local,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::Openai => "openai",
            ProviderKind::Google => "google",
            ProviderKind::Local => "local",
        }
    }
}

// ── Chat types ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

/// A provider-agnostic chat message. Tool traffic stays in the session
/// layer; by the time a conversation reaches a provider adapter it is
/// plain text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        ChatMessage { role: ChatRole::System, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        ChatMessage { role: ChatRole::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        ChatMessage { role: ChatRole::Assistant, content: content.into() }
    }
}

/// Unified streaming chunk from any provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamChunk {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delta_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
}

/// Token usage reported by the API (for metering).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

// ── Capability interface ───────────────────────────────────────────────

/// Type-erased LLM access. Callers hold `Arc<dyn LlmProvider>` and call
/// `chat` / `chat_stream` without knowing which backend is in use.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Chat completion with streaming chunks.
    async fn chat_stream(
        &self,
        messages: &[ChatMessage],
        temperature: Option<f64>,
    ) -> EngineResult<Vec<StreamChunk>>;

    /// Convenience: run `chat_stream` and concatenate the text deltas.
    async fn chat(&self, messages: &[ChatMessage], temperature: Option<f64>) -> EngineResult<String> {
        let chunks = self.chat_stream(messages, temperature).await?;
        Ok(chunks.iter().filter_map(|c| c.delta_text.as_deref()).collect())
    }
}

// ── Provider events ────────────────────────────────────────────────────

/// Typed events a provider adapter may publish (usage metering, request
/// lifecycle, failures). No stringly-typed channels at the core boundary.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProviderEvent {
    Request { provider: ProviderKind, model: String },
    Usage { provider: ProviderKind, usage: TokenUsage },
    Error { provider: ProviderKind, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedProvider(String);

    #[async_trait]
    impl LlmProvider for FixedProvider {
        fn kind(&self) -> ProviderKind {
            ProviderKind::Local
        }

        async fn chat_stream(
            &self,
            _messages: &[ChatMessage],
            _temperature: Option<f64>,
        ) -> EngineResult<Vec<StreamChunk>> {
            Ok(self
                .0
                .split_inclusive(' ')
                .map(|piece| StreamChunk { delta_text: Some(piece.to_string()), usage: None })
                .collect())
        }
    }

    #[tokio::test]
    async fn test_chat_concatenates_deltas() {
        let provider = FixedProvider("three word answer".into());
        let text = provider.chat(&[ChatMessage::user("q")], None).await.unwrap();
        assert_eq!(text, "three word answer");
    }

    #[test]
    fn test_provider_kind_tags() {
        assert_eq!(serde_json::to_string(&ProviderKind::Anthropic).unwrap(), "\"anthropic\"");
        assert_eq!(ProviderKind::Openai.as_str(), "openai");
    }
}
