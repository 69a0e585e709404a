// Pawnbutler Core — Context Pruner
// Trims a conversation to fit `context_window − reserve_tokens` without
// ever splitting a tool-call/tool-result pair. Two real strategies:
// sliding window (deterministic) and summarize (LLM-backed, falls back to
// the sliding window whenever the model is unavailable or the transcript
// is too short).

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::atoms::constants::DEFAULT_RESERVE_TOKENS;
use crate::providers::{ChatMessage, LlmProvider};
use crate::sessions::{MessageRole, SessionMessage};

// ── Configuration ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PruneStrategy {
    None,
    SlidingWindow,
    Summarize,
}

#[derive(Debug, Clone)]
pub struct PrunerConfig {
    pub context_window: usize,
    pub reserve_tokens: usize,
    pub strategy: PruneStrategy,
}

impl PrunerConfig {
    pub fn new(context_window: usize, strategy: PruneStrategy) -> Self {
        PrunerConfig {
            context_window,
            reserve_tokens: DEFAULT_RESERVE_TOKENS,
            strategy,
        }
    }

    /// Usable token budget after the reserve.
    pub fn budget(&self) -> usize {
        self.context_window.saturating_sub(self.reserve_tokens)
    }
}

/// What the pruner did, so callers can tell whether anything changed.
#[derive(Debug, Clone)]
pub struct PruneOutcome {
    pub messages: Vec<SessionMessage>,
    pub pruned: bool,
    pub removed_count: usize,
    pub summary: Option<String>,
}

impl PruneOutcome {
    fn unchanged(messages: Vec<SessionMessage>) -> Self {
        PruneOutcome { messages, pruned: false, removed_count: 0, summary: None }
    }
}

// ── Token estimation ───────────────────────────────────────────────────

/// Estimate the token count of a message (~4 chars per token), counting
/// the JSON-serialised tool fields.
pub fn estimate_message_tokens(message: &SessionMessage) -> usize {
    let mut chars = message.content.len();
    if let Some(tool_calls) = &message.tool_calls {
        chars += serde_json::to_string(tool_calls).map(|s| s.len()).unwrap_or(0);
    }
    if let Some(tool_result) = &message.tool_result {
        chars += serde_json::to_string(tool_result).map(|s| s.len()).unwrap_or(0);
    }
    chars / 4 + 4
}

pub fn estimate_total_tokens(messages: &[SessionMessage]) -> usize {
    messages.iter().map(estimate_message_tokens).sum()
}

// ── ContextPruner ──────────────────────────────────────────────────────

pub struct ContextPruner {
    config: PrunerConfig,
}

impl ContextPruner {
    pub fn new(config: PrunerConfig) -> Self {
        ContextPruner { config }
    }

    pub fn config(&self) -> &PrunerConfig {
        &self.config
    }

    /// Apply the configured strategy. `llm` is only consulted by the
    /// summarize strategy; passing `None` forces its fallback.
    pub async fn prune(
        &self,
        messages: &[SessionMessage],
        llm: Option<&dyn LlmProvider>,
    ) -> PruneOutcome {
        match self.config.strategy {
            PruneStrategy::None => PruneOutcome::unchanged(messages.to_vec()),
            PruneStrategy::SlidingWindow => self.sliding_window(messages),
            PruneStrategy::Summarize => self.summarize(messages, llm).await,
        }
    }

    // ── Sliding window ─────────────────────────────────────────────────

    /// Keep all system messages; from the non-system tail greedily keep
    /// the newest messages that fit. A tool result and its assistant
    /// tool-call message form one atomic unit: both or neither.
    fn sliding_window(&self, messages: &[SessionMessage]) -> PruneOutcome {
        let budget = self.config.budget();

        let system_cost: usize = messages
            .iter()
            .filter(|m| m.role == MessageRole::System)
            .map(estimate_message_tokens)
            .sum();
        let mut remaining = budget.saturating_sub(system_cost);

        // Group non-system indices into atomic units: an assistant message
        // with tool calls travels with every tool result answering it.
        let units = pair_units(messages);

        let mut keep = vec![false; messages.len()];
        for (i, message) in messages.iter().enumerate() {
            if message.role == MessageRole::System {
                keep[i] = true;
            }
        }

        let mut removed = 0;
        let mut fits = true;
        for unit in units.iter().rev() {
            let cost: usize = unit.iter().map(|&i| estimate_message_tokens(&messages[i])).sum();
            if fits && cost <= remaining {
                remaining -= cost;
                for &i in unit {
                    keep[i] = true;
                }
            } else {
                // First unit that does not fit ends the window; everything
                // older goes too, which is what keeps pairs whole.
                fits = false;
                removed += unit.len();
            }
        }

        let kept: Vec<SessionMessage> = messages
            .iter()
            .enumerate()
            .filter(|(i, _)| keep[*i])
            .map(|(_, m)| m.clone())
            .collect();

        if removed > 0 {
            info!("[pruner] Sliding window removed {} message(s)", removed);
        }
        PruneOutcome {
            messages: kept,
            pruned: removed > 0,
            removed_count: removed,
            summary: None,
        }
    }

    // ── Summarize ──────────────────────────────────────────────────────

    /// Replace the older 60% of the non-system transcript with a single
    /// LLM-written summary message; keep the newer 40% verbatim. Falls
    /// back to the sliding window when the transcript is short or the
    /// model call fails.
    async fn summarize(
        &self,
        messages: &[SessionMessage],
        llm: Option<&dyn LlmProvider>,
    ) -> PruneOutcome {
        if estimate_total_tokens(messages) <= self.config.budget() {
            return PruneOutcome::unchanged(messages.to_vec());
        }

        let non_system: Vec<usize> = messages
            .iter()
            .enumerate()
            .filter(|(_, m)| m.role != MessageRole::System)
            .map(|(i, _)| i)
            .collect();

        if non_system.len() < 5 {
            return self.sliding_window(messages);
        }

        let Some(llm) = llm else {
            warn!("[pruner] Summarize requested without an LLM; using sliding window");
            return self.sliding_window(messages);
        };

        let split = non_system.len() * 60 / 100;
        let older: Vec<&SessionMessage> = non_system[..split].iter().map(|&i| &messages[i]).collect();
        let newer: Vec<&SessionMessage> = non_system[split..].iter().map(|&i| &messages[i]).collect();

        let summary = match llm
            .chat(&build_summary_prompt(&older), Some(0.3))
            .await
        {
            Ok(text) if !text.trim().is_empty() => text,
            Ok(_) => {
                warn!("[pruner] Summarizer returned empty text; using sliding window");
                return self.sliding_window(messages);
            }
            Err(e) => {
                warn!("[pruner] Summarizer failed ({}); using sliding window", e);
                return self.sliding_window(messages);
            }
        };

        let mut result: Vec<SessionMessage> = messages
            .iter()
            .filter(|m| m.role == MessageRole::System)
            .cloned()
            .collect();
        result.push(SessionMessage::text(
            MessageRole::System,
            format!("[Previous conversation summary]: {}", summary),
        ));
        result.extend(newer.iter().map(|m| (*m).clone()));

        info!(
            "[pruner] Summarized {} message(s) into one summary, kept {} verbatim",
            older.len(),
            newer.len()
        );
        PruneOutcome {
            messages: result,
            pruned: true,
            removed_count: older.len(),
            summary: Some(summary),
        }
    }
}

/// Indices of each atomic unit of the non-system transcript, in order.
/// An assistant message with tool calls and every tool message answering
/// one of its call ids form a single unit; everything else is a singleton.
fn pair_units(messages: &[SessionMessage]) -> Vec<Vec<usize>> {
    use std::collections::HashMap;

    let mut units: Vec<Vec<usize>> = Vec::new();
    // tool_call_id → unit index
    let mut owner: HashMap<String, usize> = HashMap::new();

    for (i, message) in messages.iter().enumerate() {
        if message.role == MessageRole::System {
            continue;
        }
        if let Some(tool_calls) = &message.tool_calls {
            let unit_index = units.len();
            units.push(vec![i]);
            for call in tool_calls {
                owner.insert(call.id.clone(), unit_index);
            }
            continue;
        }
        if let Some(tool_result) = &message.tool_result {
            if let Some(&unit_index) = owner.get(&tool_result.tool_call_id) {
                units[unit_index].push(i);
                continue;
            }
        }
        units.push(vec![i]);
    }
    units
}

fn build_summary_prompt(older: &[&SessionMessage]) -> Vec<ChatMessage> {
    let mut transcript = String::new();
    for message in older {
        let label = match message.role {
            MessageRole::System => "System",
            MessageRole::User => "User",
            MessageRole::Assistant => "Assistant",
            MessageRole::Tool => "Tool",
        };
        if let Some(tool_result) = &message.tool_result {
            let preview = crate::atoms::types::truncate_utf8(&tool_result.output, 200);
            transcript.push_str(&format!("[{}: {} → {}]\n", label, tool_result.tool_call_id, preview));
        } else {
            let preview = crate::atoms::types::truncate_utf8(&message.content, 500);
            transcript.push_str(&format!("{}: {}\n", label, preview));
        }
    }

    vec![
        ChatMessage::system(
            "Summarise the conversation concisely. Preserve facts, decisions, \
             tool results, and user preferences. Use bullet points.",
        ),
        ChatMessage::user(format!("Summarise this conversation:\n\n{}", transcript)),
    ]
}

// ── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::error::EngineResult;
    use crate::providers::{ProviderKind, StreamChunk};
    use crate::sessions::ToolCall;
    use async_trait::async_trait;
    use serde_json::json;

    fn text(role: MessageRole, content: &str) -> SessionMessage {
        SessionMessage::text(role, content)
    }

    fn assistant_call(id: &str, content: &str) -> SessionMessage {
        SessionMessage::assistant_with_tool_calls(
            content,
            vec![ToolCall { id: id.into(), name: "t".into(), arguments: json!({}) }],
        )
    }

    struct FixedSummarizer;

    #[async_trait]
    impl LlmProvider for FixedSummarizer {
        fn kind(&self) -> ProviderKind {
            ProviderKind::Local
        }
        async fn chat_stream(
            &self,
            _messages: &[ChatMessage],
            _temperature: Option<f64>,
        ) -> EngineResult<Vec<StreamChunk>> {
            Ok(vec![StreamChunk { delta_text: Some("the gist".into()), usage: None }])
        }
    }

    struct FailingSummarizer;

    #[async_trait]
    impl LlmProvider for FailingSummarizer {
        fn kind(&self) -> ProviderKind {
            ProviderKind::Local
        }
        async fn chat_stream(
            &self,
            _messages: &[ChatMessage],
            _temperature: Option<f64>,
        ) -> EngineResult<Vec<StreamChunk>> {
            Err("model offline".into())
        }
    }

    fn pruner(context_window: usize, strategy: PruneStrategy) -> ContextPruner {
        ContextPruner::new(PrunerConfig {
            context_window,
            reserve_tokens: 0,
            strategy,
        })
    }

    #[tokio::test]
    async fn test_none_passthrough() {
        let p = pruner(10, PruneStrategy::None);
        let messages = vec![text(MessageRole::User, &"x".repeat(1000))];
        let outcome = p.prune(&messages, None).await;
        assert!(!outcome.pruned);
        assert_eq!(outcome.messages.len(), 1);
    }

    #[tokio::test]
    async fn test_sliding_keeps_system_unconditionally() {
        let p = pruner(30, PruneStrategy::SlidingWindow);
        let messages = vec![
            text(MessageRole::System, "you are a butler"),
            text(MessageRole::User, &"a".repeat(400)),
            text(MessageRole::User, "recent"),
        ];
        let outcome = p.prune(&messages, None).await;
        assert!(outcome.messages.iter().any(|m| m.role == MessageRole::System));
        // The big middle message is gone, the newest survives.
        assert!(outcome.pruned);
        assert!(outcome.messages.iter().any(|m| m.content == "recent"));
        assert!(!outcome.messages.iter().any(|m| m.content.len() == 400));
    }

    #[tokio::test]
    async fn test_sliding_pair_atomicity() {
        // Budget fits only the trailing two messages. The tool result and
        // its assistant call must stay together; here they don't fit, so
        // neither survives.
        let messages = vec![
            text(MessageRole::System, "sys"),
            assistant_call("t1", &"call context ".repeat(20)),
            SessionMessage::tool_result("t1", "tool output ".repeat(20), true),
            text(MessageRole::Assistant, "done"),
        ];
        let tail_cost = estimate_message_tokens(&messages[3]);
        let sys_cost = estimate_message_tokens(&messages[0]);
        let p = pruner(sys_cost + tail_cost + 2, PruneStrategy::SlidingWindow);

        let outcome = p.prune(&messages, None).await;
        let has_tool = outcome.messages.iter().any(|m| m.tool_result.is_some());
        let has_call = outcome.messages.iter().any(|m| m.tool_calls.is_some());
        assert_eq!(has_tool, has_call, "pair split by pruner");
        assert!(!has_tool, "pair should not fit this budget");
        assert!(outcome.messages.iter().any(|m| m.content == "done"));
    }

    #[tokio::test]
    async fn test_sliding_pair_kept_when_it_fits() {
        let messages = vec![
            assistant_call("t1", "call"),
            SessionMessage::tool_result("t1", "out", true),
            text(MessageRole::Assistant, "done"),
        ];
        let p = pruner(10_000, PruneStrategy::SlidingWindow);
        let outcome = p.prune(&messages, None).await;
        assert!(!outcome.pruned);
        assert_eq!(outcome.messages.len(), 3);
    }

    #[tokio::test]
    async fn test_sliding_multi_result_pair_atomic() {
        // One assistant message with two calls and two results: all four
        // messages form one unit.
        let assistant = SessionMessage::assistant_with_tool_calls(
            "dual",
            vec![
                ToolCall { id: "a".into(), name: "t".into(), arguments: json!({}) },
                ToolCall { id: "b".into(), name: "t".into(), arguments: json!({}) },
            ],
        );
        let messages = vec![
            assistant,
            SessionMessage::tool_result("a", &"x".repeat(200), true),
            SessionMessage::tool_result("b", &"y".repeat(200), true),
            text(MessageRole::User, "next"),
        ];
        // Budget for "next" plus one result but not the whole unit.
        let p = pruner(
            estimate_message_tokens(&messages[3]) + estimate_message_tokens(&messages[1]) + 2,
            PruneStrategy::SlidingWindow,
        );
        let outcome = p.prune(&messages, None).await;
        for m in &outcome.messages {
            assert!(m.tool_result.is_none() && m.tool_calls.is_none());
        }
        assert_eq!(outcome.messages.len(), 1);
    }

    #[tokio::test]
    async fn test_summarize_under_budget_unchanged() {
        let p = pruner(100_000, PruneStrategy::Summarize);
        let messages: Vec<SessionMessage> =
            (0..10).map(|i| text(MessageRole::User, &format!("msg {}", i))).collect();
        let outcome = p.prune(&messages, Some(&FixedSummarizer)).await;
        assert!(!outcome.pruned);
        assert_eq!(outcome.messages.len(), 10);
    }

    #[tokio::test]
    async fn test_summarize_replaces_older_majority() {
        let p = pruner(100, PruneStrategy::Summarize);
        let messages: Vec<SessionMessage> = (0..10)
            .map(|i| text(MessageRole::User, &format!("message number {} {}", i, "pad ".repeat(20))))
            .collect();
        let outcome = p.prune(&messages, Some(&FixedSummarizer)).await;
        assert!(outcome.pruned);
        assert_eq!(outcome.removed_count, 6);
        assert_eq!(outcome.summary.as_deref(), Some("the gist"));
        // Synthetic summary message leads, newer 40% follow verbatim.
        assert!(outcome.messages[0]
            .content
            .starts_with("[Previous conversation summary]:"));
        assert_eq!(outcome.messages.len(), 1 + 4);
    }

    #[tokio::test]
    async fn test_summarize_llm_failure_falls_back() {
        let p = pruner(100, PruneStrategy::Summarize);
        let messages: Vec<SessionMessage> = (0..10)
            .map(|i| text(MessageRole::User, &format!("message number {} {}", i, "pad ".repeat(20))))
            .collect();
        let outcome = p.prune(&messages, Some(&FailingSummarizer)).await;
        // Fallback is the sliding window: no summary, still pruned.
        assert!(outcome.summary.is_none());
        assert!(outcome.pruned);
    }

    #[tokio::test]
    async fn test_summarize_too_few_messages_falls_back() {
        let p = pruner(10, PruneStrategy::Summarize);
        let messages = vec![
            text(MessageRole::User, &"long ".repeat(100)),
            text(MessageRole::User, "tail"),
        ];
        let outcome = p.prune(&messages, Some(&FixedSummarizer)).await;
        assert!(outcome.summary.is_none());
        assert!(outcome.pruned);
    }

    #[test]
    fn test_estimate_counts_tool_fields() {
        let plain = text(MessageRole::User, "12345678");
        assert_eq!(estimate_message_tokens(&plain), 8 / 4 + 4);

        let with_call = assistant_call("t1", "12345678");
        assert!(estimate_message_tokens(&with_call) > estimate_message_tokens(&plain));
    }
}
