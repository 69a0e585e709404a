// Pawnbutler Core — Agent Engine
// Lifecycle owner for the cooperating agents: registration, the message
// bus, the pending-approval table, and the guardian handoff. The engine
// performs no blocking work itself; everything long-running happens in
// per-agent tasks or inside the explicit suspension points (guardian
// approval waits, tool executions, LLM calls).
//
// Module layout:
//   bus.rs    — in-process FIFO mailboxes + bounded history
//   agents.rs — Agent trait + tool ACL profiles

pub mod agents;
pub mod bus;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use chrono::Utc;
use log::{info, warn};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::atoms::error::EngineResult;
use crate::atoms::types::{
    ActionRequest, ActionResult, AgentMessage, AgentMessageType, AgentRole, ApprovalRequest,
    ApprovalStatus,
};
use crate::events::{EngineEvent, EventStream};
use crate::guardian::{Guardian, Verdict};
use crate::providers::LlmProvider;
use crate::sessions::SessionManager;

use agents::Agent;
use bus::MessageBus;

// ── Status surface ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub running: bool,
    pub agents: Vec<AgentStatusLine>,
    pub pending_approvals: usize,
    pub total_checked: u64,
    pub blocked_count: u64,
    pub external_approval_channel: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentStatusLine {
    pub id: String,
    pub role: AgentRole,
}

// ── AgentEngine ────────────────────────────────────────────────────────

pub struct AgentEngine {
    agents: RwLock<HashMap<String, Arc<dyn Agent>>>,
    /// Fast-access ids for the two special roles.
    butler_id: RwLock<Option<String>>,
    guardian_agent_id: RwLock<Option<String>>,
    bus: MessageBus,
    guardian: Guardian,
    llm: Option<Arc<dyn LlmProvider>>,
    sessions: Option<Arc<SessionManager>>,
    /// Pending approvals keyed by action-request id. Terminal transitions
    /// remove the entry, which is what makes `resolve_approval`
    /// exactly-once.
    pending_approvals: Mutex<HashMap<String, ApprovalRequest>>,
    events: EventStream,
    running: AtomicBool,
    agent_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl AgentEngine {
    pub fn new(guardian: Guardian) -> Self {
        AgentEngine {
            agents: RwLock::new(HashMap::new()),
            butler_id: RwLock::new(None),
            guardian_agent_id: RwLock::new(None),
            bus: MessageBus::new(),
            guardian,
            llm: None,
            sessions: None,
            pending_approvals: Mutex::new(HashMap::new()),
            events: EventStream::new(),
            running: AtomicBool::new(false),
            agent_tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn with_llm(mut self, llm: Arc<dyn LlmProvider>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn with_sessions(mut self, sessions: Arc<SessionManager>) -> Self {
        self.sessions = Some(sessions);
        self
    }

    // ── Accessors ──────────────────────────────────────────────────────

    pub fn guardian(&self) -> &Guardian {
        &self.guardian
    }

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    pub fn events(&self) -> &EventStream {
        &self.events
    }

    pub fn llm(&self) -> Option<Arc<dyn LlmProvider>> {
        self.llm.clone()
    }

    pub fn sessions(&self) -> Option<Arc<SessionManager>> {
        self.sessions.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn agent(&self, agent_id: &str) -> Option<Arc<dyn Agent>> {
        self.agents.read().get(agent_id).cloned()
    }

    pub fn butler_id(&self) -> Option<String> {
        self.butler_id.read().clone()
    }

    pub fn guardian_agent_id(&self) -> Option<String> {
        self.guardian_agent_id.read().clone()
    }

    // ── Registration & lifecycle ───────────────────────────────────────

    /// Register an agent. Ids are unique; the butler and guardian roles
    /// are remembered for fast access.
    pub fn register_agent(&self, agent: Arc<dyn Agent>) -> EngineResult<()> {
        let profile = agent.profile().clone();
        let mut agents = self.agents.write();
        if agents.contains_key(&profile.id) {
            return Err(format!("Agent '{}' is already registered", profile.id).into());
        }
        match profile.role {
            AgentRole::Butler => *self.butler_id.write() = Some(profile.id.clone()),
            AgentRole::Guardian => *self.guardian_agent_id.write() = Some(profile.id.clone()),
            _ => {}
        }
        info!("[engine] Registered agent '{}' ({})", profile.id, profile.role.as_str());
        agents.insert(profile.id, agent);
        Ok(())
    }

    /// Start the engine: wire every agent's mailbox to a dedicated task,
    /// then run `init` in role order guardian → butler → researcher →
    /// executor.
    pub async fn start(self: Arc<Self>) -> EngineResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err("Engine is already running".into());
        }

        let ordered = self.agents_in_role_order();

        // Mailboxes first so init code can already send messages.
        for agent in &ordered {
            spawn_agent_loop(&self, agent.clone());
        }

        for agent in &ordered {
            if let Err(e) = agent.init(&self).await {
                // A half-initialized engine must not look running.
                self.running.store(false, Ordering::SeqCst);
                for task in self.agent_tasks.lock().drain(..) {
                    task.abort();
                }
                return Err(format!("Agent '{}' failed to init: {}", agent.profile().id, e).into());
            }
        }

        self.events.publish(EngineEvent::Started);
        info!("[engine] Started with {} agent(s)", ordered.len());
        Ok(())
    }

    /// Stop the engine: shutdown hooks in reverse init order, then tear
    /// down the mailbox tasks.
    pub async fn shutdown(&self) -> EngineResult<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        let mut ordered = self.agents_in_role_order();
        ordered.reverse();
        for agent in &ordered {
            if let Err(e) = agent.shutdown(self).await {
                warn!("[engine] Agent '{}' shutdown error: {}", agent.profile().id, e);
            }
            self.bus.unregister(&agent.profile().id);
        }

        for task in self.agent_tasks.lock().drain(..) {
            task.abort();
        }

        self.events.publish(EngineEvent::Stopped);
        info!("[engine] Stopped");
        Ok(())
    }

    /// Agents sorted guardian → butler → researcher → executor, stable
    /// within a role.
    fn agents_in_role_order(&self) -> Vec<Arc<dyn Agent>> {
        fn rank(role: AgentRole) -> u8 {
            match role {
                AgentRole::Guardian => 0,
                AgentRole::Butler => 1,
                AgentRole::Researcher => 2,
                AgentRole::Executor => 3,
            }
        }
        let agents = self.agents.read();
        let mut ordered: Vec<Arc<dyn Agent>> = agents.values().cloned().collect();
        ordered.sort_by_key(|a| (rank(a.profile().role), a.profile().id.clone()));
        ordered
    }

    // ── User entry point ───────────────────────────────────────────────

    /// Post a user request as a `task` message to the butler.
    pub fn submit_user_request(&self, text: &str) -> EngineResult<()> {
        if !self.is_running() {
            return Err("Engine is not running".into());
        }
        let butler = self
            .butler_id
            .read()
            .clone()
            .ok_or("No butler agent registered")?;
        self.bus.send(AgentMessage::new(
            "user",
            butler,
            AgentMessageType::Task,
            json!({ "text": text, "submittedAt": Utc::now() }),
        ))
    }

    // ── Guardian handoff ───────────────────────────────────────────────

    /// Run one action request through the guardian and fold the verdict
    /// into an ActionResult. Dangerous requests without an external
    /// channel are parked for the butler via `request_approval`.
    pub async fn authorize(&self, request: &ActionRequest) -> ActionResult {
        match self.guardian.validate_action(request).await {
            Verdict::Approved => {
                self.events.publish(EngineEvent::ActionChecked {
                    request_id: request.id.clone(),
                    agent_id: request.agent_id.clone(),
                    action_type: request.action_type.clone(),
                    safety_level: request.safety_level,
                });
                ActionResult::ok(request.id.as_str(), None)
            }
            Verdict::Blocked { by, reason } => {
                self.events.publish(EngineEvent::ActionBlocked {
                    request_id: request.id.clone(),
                    agent_id: request.agent_id.clone(),
                    action_type: request.action_type.clone(),
                    reason: reason.clone(),
                });
                ActionResult::blocked(request.id.as_str(), by, reason)
            }
            Verdict::AwaitingApproval(approval) => self.request_approval(approval),
        }
    }

    // ── Approval brokering (local butler path) ─────────────────────────

    /// Park a pending approval and notify the butler. The caller gets a
    /// non-success "awaiting approval" result; the real outcome arrives at
    /// the requesting agent as an `approval_response` message later.
    pub fn request_approval(&self, approval: ApprovalRequest) -> ActionResult {
        let request = approval.action_request.clone();
        self.pending_approvals
            .lock()
            .insert(request.id.clone(), approval.clone());

        self.events.publish(EngineEvent::ApprovalRequested {
            request_id: request.id.clone(),
            agent_id: request.agent_id.clone(),
            action_type: request.action_type.clone(),
        });

        let butler = self.butler_id.read().clone();
        match butler {
            Some(butler) => {
                let payload = serde_json::to_value(&approval).unwrap_or_else(|_| json!({}));
                if let Err(e) = self.bus.send(AgentMessage::new(
                    "engine",
                    butler,
                    AgentMessageType::ApprovalRequest,
                    payload,
                )) {
                    warn!("[engine] Could not notify butler of approval request: {}", e);
                }
            }
            None => warn!(
                "[engine] Approval {} parked with no butler registered",
                request.id
            ),
        }

        ActionResult::error(
            request.id.as_str(),
            format!(
                "Awaiting approval for '{}' (request {})",
                request.action_type, request.id
            ),
        )
    }

    /// Apply the terminal decision for a pending approval. Unknown ids are
    /// a no-op (`Ok(false)`): the decision was already made once and only
    /// once.
    pub fn resolve_approval(
        &self,
        request_id: &str,
        approved: bool,
        reviewer: &str,
        reason: Option<String>,
    ) -> EngineResult<bool> {
        let mut approval = match self.pending_approvals.lock().remove(request_id) {
            Some(approval) => approval,
            None => {
                info!("[engine] resolve_approval for unknown id '{}' ignored", request_id);
                return Ok(false);
            }
        };

        let status = if approved { ApprovalStatus::Approved } else { ApprovalStatus::Rejected };
        approval.resolve(status, reviewer, reason);

        self.events.publish(EngineEvent::ApprovalResolved {
            request_id: request_id.to_string(),
            status,
            reviewed_by: reviewer.to_string(),
        });

        let requester = approval.action_request.agent_id.clone();
        let payload = serde_json::to_value(&approval).unwrap_or_else(|_| json!({}));
        if let Err(e) = self.bus.send(AgentMessage::new(
            "engine",
            requester,
            AgentMessageType::ApprovalResponse,
            payload,
        )) {
            warn!("[engine] Could not deliver approval response: {}", e);
        }
        Ok(true)
    }

    pub fn pending_approvals(&self) -> Vec<ApprovalRequest> {
        self.pending_approvals.lock().values().cloned().collect()
    }

    // ── Status ─────────────────────────────────────────────────────────

    pub fn status(&self) -> StatusReport {
        let (total_checked, blocked_count) = self.guardian.counters();
        let agents = self
            .agents_in_role_order()
            .iter()
            .map(|a| AgentStatusLine {
                id: a.profile().id.clone(),
                role: a.profile().role,
            })
            .collect();
        StatusReport {
            running: self.is_running(),
            agents,
            pending_approvals: self.pending_approvals.lock().len(),
            total_checked,
            blocked_count,
            external_approval_channel: self.guardian.has_external_channel(),
        }
    }
}

/// One mailbox + one consumer task per agent. The bus handler only
/// enqueues, so per-recipient FIFO survives; the consumer task processes
/// one message at a time (cooperative, single-threaded per agent). The
/// task holds only a weak engine reference so shutdown can drop the
/// engine without waiting on idle mailboxes.
fn spawn_agent_loop(engine: &Arc<AgentEngine>, agent: Arc<dyn Agent>) {
    let agent_id = agent.profile().id.clone();
    let (tx, mut rx) = mpsc::unbounded_channel::<AgentMessage>();

    engine.bus.register(&agent_id, Box::new(move |message| {
        // Receiver dropped means the engine is shutting down.
        let _ = tx.send(message);
    }));

    let weak: Weak<AgentEngine> = Arc::downgrade(engine);
    let task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let Some(engine) = weak.upgrade() else { break };
            if let Err(e) = agent.on_message(&engine, message).await {
                warn!("[engine] Agent '{}' handler error: {}", agent.profile().id, e);
            }
        }
    });
    engine.agent_tasks.lock().push(task);
}

// ── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::agents::AgentProfile;
    use crate::guardian::audit::AuditLog;
    use crate::guardian::classifier::ActionClassifier;
    use crate::guardian::url_policy::UrlPolicy;
    use crate::guardian::vault::SecretVault;
    use async_trait::async_trait;
    use std::sync::Arc;

    struct RecordingAgent {
        profile: AgentProfile,
        seen: Arc<Mutex<Vec<AgentMessage>>>,
    }

    impl RecordingAgent {
        fn new(id: &str, role: AgentRole) -> (Arc<Self>, Arc<Mutex<Vec<AgentMessage>>>) {
            let seen = Arc::new(Mutex::new(Vec::new()));
            let agent = Arc::new(RecordingAgent {
                profile: AgentProfile::new(id, role),
                seen: seen.clone(),
            });
            (agent, seen)
        }
    }

    #[async_trait]
    impl Agent for RecordingAgent {
        fn profile(&self) -> &AgentProfile {
            &self.profile
        }
        async fn on_message(&self, _engine: &AgentEngine, message: AgentMessage) -> EngineResult<()> {
            self.seen.lock().push(message);
            Ok(())
        }
    }

    fn test_engine(dir: &tempfile::TempDir) -> Arc<AgentEngine> {
        let guardian = Guardian::new(
            UrlPolicy::new(),
            ActionClassifier::with_defaults(),
            Arc::new(SecretVault::new()),
            AuditLog::new(dir.path().join("audit.jsonl"), dir.path().join("alerts.jsonl")),
        );
        Arc::new(AgentEngine::new(guardian))
    }

    async fn settle() {
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
    }

    #[tokio::test]
    async fn test_duplicate_registration_fails() {
        let dir = tempfile::tempdir().unwrap();
        let engine = test_engine(&dir);
        let (a, _) = RecordingAgent::new("butler", AgentRole::Butler);
        let (b, _) = RecordingAgent::new("butler", AgentRole::Butler);
        engine.register_agent(a).unwrap();
        assert!(engine.register_agent(b).is_err());
    }

    #[tokio::test]
    async fn test_submit_requires_running_and_butler() {
        let dir = tempfile::tempdir().unwrap();
        let engine = test_engine(&dir);
        assert!(engine.submit_user_request("hello").is_err());

        let (researcher, _) = RecordingAgent::new("res", AgentRole::Researcher);
        engine.register_agent(researcher).unwrap();
        engine.clone().start().await.unwrap();
        // Running but no butler.
        assert!(engine.submit_user_request("hello").is_err());
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_user_request_reaches_butler() {
        let dir = tempfile::tempdir().unwrap();
        let engine = test_engine(&dir);
        let (butler, seen) = RecordingAgent::new("butler", AgentRole::Butler);
        engine.register_agent(butler).unwrap();
        engine.clone().start().await.unwrap();

        engine.submit_user_request("walk the dog").unwrap();
        settle().await;

        let messages = seen.lock().clone();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].message_type, AgentMessageType::Task);
        assert_eq!(messages[0].payload["text"], "walk the dog");
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_approval_flow_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let engine = test_engine(&dir);
        let (butler, butler_seen) = RecordingAgent::new("butler", AgentRole::Butler);
        let (executor, executor_seen) = RecordingAgent::new("exec", AgentRole::Executor);
        engine.register_agent(butler).unwrap();
        engine.register_agent(executor).unwrap();
        engine.clone().start().await.unwrap();

        // A dangerous request with no external channel parks an approval.
        let request = ActionRequest::new("exec", AgentRole::Executor, "exec_command",
            json!({"command": "make deploy"}));
        let request_id = request.id.clone();
        let result = engine.authorize(&request).await;
        assert!(!result.success);
        assert!(result.error.as_deref().unwrap_or("").contains("Awaiting approval"));
        assert_eq!(engine.pending_approvals().len(), 1);

        settle().await;
        // Butler got the approval_request.
        let butler_msgs = butler_seen.lock().clone();
        assert!(butler_msgs
            .iter()
            .any(|m| m.message_type == AgentMessageType::ApprovalRequest));

        // Butler decides; requester gets the response, table drains.
        let changed = engine
            .resolve_approval(&request_id, true, "butler", Some("fine".into()))
            .unwrap();
        assert!(changed);
        assert_eq!(engine.pending_approvals().len(), 0);

        settle().await;
        let exec_msgs = executor_seen.lock().clone();
        assert!(exec_msgs
            .iter()
            .any(|m| m.message_type == AgentMessageType::ApprovalResponse));

        // Second resolve is a no-op.
        let changed_again = engine
            .resolve_approval(&request_id, false, "butler", None)
            .unwrap();
        assert!(!changed_again);

        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_authorize_safe_action() {
        let dir = tempfile::tempdir().unwrap();
        let engine = test_engine(&dir);
        let request = ActionRequest::new("res", AgentRole::Researcher, "read_file", json!({}));
        let result = engine.authorize(&request).await;
        assert!(result.success);
    }

    #[tokio::test]
    async fn test_status_report() {
        let dir = tempfile::tempdir().unwrap();
        let engine = test_engine(&dir);
        let (butler, _) = RecordingAgent::new("butler", AgentRole::Butler);
        engine.register_agent(butler).unwrap();
        engine.clone().start().await.unwrap();

        let status = engine.status();
        assert!(status.running);
        assert_eq!(status.agents.len(), 1);
        assert!(!status.external_approval_channel);
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_double_start_fails() {
        let dir = tempfile::tempdir().unwrap();
        let engine = test_engine(&dir);
        engine.clone().start().await.unwrap();
        assert!(engine.clone().start().await.is_err());
        engine.shutdown().await.unwrap();
    }
}
