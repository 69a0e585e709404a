// Pawnbutler Core — Shared vocabulary types
// These are the data structures that flow through the entire engine.
// They are independent of any specific LLM provider or chat channel.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ── Safety levels ──────────────────────────────────────────────────────

/// The scalar output of the action classifier. Ordered from harmless to
/// prohibited so policy code can compare levels instead of matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SafetyLevel {
    Safe,
    Moderate,
    Dangerous,
    Forbidden,
}

impl SafetyLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            SafetyLevel::Safe => "safe",
            SafetyLevel::Moderate => "moderate",
            SafetyLevel::Dangerous => "dangerous",
            SafetyLevel::Forbidden => "forbidden",
        }
    }

    /// Parse a config-file level string. Unknown strings are rejected, not
    /// defaulted; a typo must never weaken the policy.
    pub fn parse(s: &str) -> Option<SafetyLevel> {
        match s {
            "safe" => Some(SafetyLevel::Safe),
            "moderate" => Some(SafetyLevel::Moderate),
            "dangerous" => Some(SafetyLevel::Dangerous),
            "forbidden" => Some(SafetyLevel::Forbidden),
            _ => None,
        }
    }
}

// ── Agent roles ────────────────────────────────────────────────────────

/// The four cooperating agent roles. The butler orchestrates, the
/// researcher reads, the executor writes and runs, the guardian monitors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Butler,
    Researcher,
    Executor,
    Guardian,
}

impl AgentRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentRole::Butler => "butler",
            AgentRole::Researcher => "researcher",
            AgentRole::Executor => "executor",
            AgentRole::Guardian => "guardian",
        }
    }

    pub fn parse(s: &str) -> Option<AgentRole> {
        match s {
            "butler" => Some(AgentRole::Butler),
            "researcher" => Some(AgentRole::Researcher),
            "executor" => Some(AgentRole::Executor),
            "guardian" => Some(AgentRole::Guardian),
            _ => None,
        }
    }
}

// ── Action requests & results ──────────────────────────────────────────

/// A single tool invocation, as seen by the guardian pipeline.
/// Immutable once created; the `safety_level` carried on input is advisory
/// only; the guardian always recomputes it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionRequest {
    pub id: String,
    pub agent_id: String,
    pub agent_role: AgentRole,
    pub action_type: String,
    pub params: Value,
    pub safety_level: SafetyLevel,
    pub timestamp: DateTime<Utc>,
    pub requires_approval: bool,
}

impl ActionRequest {
    /// Build a request with a fresh globally-unique id.
    pub fn new(
        agent_id: impl Into<String>,
        agent_role: AgentRole,
        action_type: impl Into<String>,
        params: Value,
    ) -> Self {
        ActionRequest {
            id: uuid::Uuid::new_v4().to_string(),
            agent_id: agent_id.into(),
            agent_role,
            action_type: action_type.into(),
            params,
            safety_level: SafetyLevel::Safe,
            timestamp: Utc::now(),
            requires_approval: false,
        }
    }

    pub fn with_safety_level(mut self, level: SafetyLevel) -> Self {
        self.safety_level = level;
        self.requires_approval = level == SafetyLevel::Dangerous;
        self
    }
}

/// Outcome of an action request. Exactly one of:
///   • success = true, or
///   • success = false with a non-empty `error` or `blocked_reason`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionResult {
    pub request_id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocked_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocked_reason: Option<String>,
}

impl ActionResult {
    pub fn ok(request_id: impl Into<String>, data: Option<Value>) -> Self {
        ActionResult {
            request_id: request_id.into(),
            success: true,
            data,
            error: None,
            blocked_by: None,
            blocked_reason: None,
        }
    }

    pub fn error(request_id: impl Into<String>, error: impl Into<String>) -> Self {
        ActionResult {
            request_id: request_id.into(),
            success: false,
            data: None,
            error: Some(error.into()),
            blocked_by: None,
            blocked_reason: None,
        }
    }

    pub fn blocked(
        request_id: impl Into<String>,
        blocked_by: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        ActionResult {
            request_id: request_id.into(),
            success: false,
            data: None,
            error: None,
            blocked_by: Some(blocked_by.into()),
            blocked_reason: Some(reason.into()),
        }
    }
}

// ── Approvals ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    AutoApproved,
    AutoBlocked,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Rejected => "rejected",
            ApprovalStatus::AutoApproved => "auto_approved",
            ApprovalStatus::AutoBlocked => "auto_blocked",
        }
    }

    /// A terminal status never transitions again.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ApprovalStatus::Pending)
    }
}

/// An approval decision in flight. Created `Pending`; takes exactly one
/// terminal transition, at which point it leaves the engine's pending table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRequest {
    pub action_request: ActionRequest,
    pub status: ApprovalStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reviewed_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reviewed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ApprovalRequest {
    pub fn pending(action_request: ActionRequest) -> Self {
        ApprovalRequest {
            action_request,
            status: ApprovalStatus::Pending,
            reviewed_by: None,
            reviewed_at: None,
            reason: None,
        }
    }

    /// Apply a terminal transition. Panics in debug builds if the request
    /// was already terminal; callers must check `is_terminal` first.
    pub fn resolve(
        &mut self,
        status: ApprovalStatus,
        reviewed_by: impl Into<String>,
        reason: Option<String>,
    ) {
        debug_assert!(!self.status.is_terminal(), "approval resolved twice");
        self.status = status;
        self.reviewed_by = Some(reviewed_by.into());
        self.reviewed_at = Some(Utc::now());
        self.reason = reason;
    }
}

// ── Inter-agent messages ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentMessageType {
    Task,
    Result,
    ApprovalRequest,
    ApprovalResponse,
    Alert,
}

/// A message on the in-process bus. Ordering is FIFO per recipient.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentMessage {
    pub from: String,
    pub to: String,
    pub message_type: AgentMessageType,
    pub payload: Value,
}

impl AgentMessage {
    pub fn new(
        from: impl Into<String>,
        to: impl Into<String>,
        message_type: AgentMessageType,
        payload: Value,
    ) -> Self {
        AgentMessage { from: from.into(), to: to.into(), message_type, payload }
    }
}

// ── Utility ────────────────────────────────────────────────────────────

/// UTF-8–safe string truncation.  Returns a `&str` of at most `max_bytes`
/// bytes, backing up to the previous char boundary if `max_bytes` falls
/// inside a multi-byte character.
///
/// Use this instead of `&s[..s.len().min(N)]` which panics on non-ASCII.
pub fn truncate_utf8(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    // Walk backwards from max_bytes to find a valid char boundary
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
