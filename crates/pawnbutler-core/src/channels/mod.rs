// Pawnbutler Core — Approval Channel Interface
// The core never speaks WhatsApp/Telegram/Discord/Slack itself; concrete
// drivers live outside and implement `ApprovalChannel`. The core only
// needs three things from them: connect, disconnect, and delivery of an
// approval notification. Responses come back through the guardian's
// rendezvous (`Guardian::deliver_approval_response`).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::atoms::error::EngineResult;
use crate::atoms::types::SafetyLevel;

// ── Channel variants ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Whatsapp,
    Telegram,
    Discord,
    Slack,
}

impl ChannelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKind::Whatsapp => "whatsapp",
            ChannelKind::Telegram => "telegram",
            ChannelKind::Discord => "discord",
            ChannelKind::Slack => "slack",
        }
    }
}

// ── Wire payloads ──────────────────────────────────────────────────────

/// What the user sees when asked to approve a dangerous action. `params`
/// is sanitised before this struct is built; channel drivers may render
/// it verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalNotification {
    pub request_id: String,
    pub agent_name: String,
    pub action_type: String,
    pub safety_level: SafetyLevel,
    pub description: String,
    pub params: Value,
}

/// The user's (or the fail-safe timer's) answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalResponse {
    pub request_id: String,
    pub approved: bool,
    pub responded_by: String,
    pub responded_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

// ── Capability interface ───────────────────────────────────────────────

/// A messaging channel able to carry approval traffic. Implementations own
/// their transport; the core treats them as fire-and-forget senders and
/// learns about responses via the guardian rendezvous.
#[async_trait]
pub trait ApprovalChannel: Send + Sync {
    fn kind(&self) -> ChannelKind;

    async fn connect(&self) -> EngineResult<()>;

    async fn disconnect(&self) -> EngineResult<()>;

    /// Deliver an approval request to the user. An `Err` here is treated
    /// by the guardian as a fail-safe rejection, never an approval.
    async fn send_approval_request(&self, notification: &ApprovalNotification) -> EngineResult<()>;
}

// ── Channel events ─────────────────────────────────────────────────────

/// Typed lifecycle events a channel driver may publish. Replaces the
/// stringly-typed emitter pattern at the core boundary.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChannelEvent {
    Connected { channel: ChannelKind },
    Disconnected { channel: ChannelKind },
    Error { channel: ChannelKind, message: String },
}
