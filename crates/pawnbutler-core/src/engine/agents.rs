// Pawnbutler Core — Agent trait & profiles
// Agents are the engine's tenants: the butler orchestrates, the researcher
// reads, the executor acts, the guardian watches. The engine owns their
// lifecycle and mailboxes; agents themselves only see the handles passed
// into their callbacks.

use std::collections::HashSet;

use async_trait::async_trait;

use crate::atoms::error::EngineResult;
use crate::atoms::types::{AgentMessage, AgentRole};
use crate::engine::AgentEngine;

// ── Profile ────────────────────────────────────────────────────────────

/// Static identity and tool ACL of an agent. The deny list always wins
/// over the allow list; an absent allow list means "any tool".
#[derive(Debug, Clone)]
pub struct AgentProfile {
    pub id: String,
    pub role: AgentRole,
    pub allowed_tools: Option<HashSet<String>>,
    pub denied_tools: HashSet<String>,
}

impl AgentProfile {
    pub fn new(id: impl Into<String>, role: AgentRole) -> Self {
        AgentProfile {
            id: id.into(),
            role,
            allowed_tools: None,
            denied_tools: HashSet::new(),
        }
    }

    pub fn allow_tools<I: IntoIterator<Item = S>, S: Into<String>>(mut self, tools: I) -> Self {
        self.allowed_tools = Some(tools.into_iter().map(Into::into).collect());
        self
    }

    pub fn deny_tools<I: IntoIterator<Item = S>, S: Into<String>>(mut self, tools: I) -> Self {
        self.denied_tools = tools.into_iter().map(Into::into).collect();
        self
    }

    /// Agent-level tool ACL: deny wins, then the allow list (absent =
    /// everything) decides.
    pub fn is_tool_allowed(&self, tool: &str) -> bool {
        if self.denied_tools.contains(tool) {
            return false;
        }
        match &self.allowed_tools {
            Some(allowed) => allowed.contains(tool),
            None => true,
        }
    }
}

// ── Agent trait ────────────────────────────────────────────────────────

/// One cooperating agent. Implementations hold no engine references; the
/// engine hands itself into every callback, which keeps ownership a tree
/// and agents trivially testable.
#[async_trait]
pub trait Agent: Send + Sync {
    fn profile(&self) -> &AgentProfile;

    /// Called once at engine start, in role order (guardian first). The
    /// LLM facade, sessions, and tools are reachable through `engine`.
    async fn init(&self, engine: &AgentEngine) -> EngineResult<()> {
        let _ = engine;
        Ok(())
    }

    /// One mailbox message. Messages for a given agent arrive strictly in
    /// send order; the engine's per-agent loop never overlaps two calls.
    async fn on_message(&self, engine: &AgentEngine, message: AgentMessage) -> EngineResult<()>;

    /// Called once at engine shutdown, in reverse init order.
    async fn shutdown(&self, engine: &AgentEngine) -> EngineResult<()> {
        let _ = engine;
        Ok(())
    }
}

// ── MailboxAgent ───────────────────────────────────────────────────────

/// The default agent implementation used when no external reasoning loop
/// is attached: it keeps a bounded record of everything it receives so
/// status surfaces and drivers can inspect the traffic. Real deployments
/// swap in agents whose `on_message` calls an LLM.
pub struct MailboxAgent {
    profile: AgentProfile,
    inbox: parking_lot::Mutex<Vec<AgentMessage>>,
    capacity: usize,
}

impl MailboxAgent {
    pub fn new(profile: AgentProfile) -> Self {
        MailboxAgent {
            profile,
            inbox: parking_lot::Mutex::new(Vec::new()),
            capacity: 200,
        }
    }

    pub fn inbox(&self) -> Vec<AgentMessage> {
        self.inbox.lock().clone()
    }
}

#[async_trait]
impl Agent for MailboxAgent {
    fn profile(&self) -> &AgentProfile {
        &self.profile
    }

    async fn on_message(&self, _engine: &AgentEngine, message: AgentMessage) -> EngineResult<()> {
        log::debug!(
            "[agent:{}] {:?} message from '{}'",
            self.profile.id,
            message.message_type,
            message.from
        );
        let mut inbox = self.inbox.lock();
        if inbox.len() >= self.capacity {
            inbox.remove(0);
        }
        inbox.push(message);
        Ok(())
    }
}
