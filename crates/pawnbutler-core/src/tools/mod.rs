// Pawnbutler Core — Tool Registry
// Write-once catalogue of named tools with role ACLs, parameter
// validation, and dispatch into the guardian. Every tool call an agent
// makes goes through `execute`; this is the security enforcement point.
//
// Module layout:
//   exec.rs — exec_command (sandbox-routed shell)
//   web.rs  — web_fetch / web_search
//   fs.rs   — workspace-confined file tools

pub mod exec;
pub mod fs;
pub mod web;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::future::BoxFuture;
use log::{info, warn};
use parking_lot::RwLock;
use serde_json::Value;

use crate::atoms::error::EngineResult;
use crate::atoms::types::{ActionRequest, ActionResult, AgentRole, SafetyLevel};
use crate::engine::agents::AgentProfile;
use crate::engine::AgentEngine;

// ── ToolDefinition ─────────────────────────────────────────────────────

pub type ToolFuture = BoxFuture<'static, EngineResult<Value>>;
pub type ToolExecFn = Arc<dyn Fn(Value, ToolContext) -> ToolFuture + Send + Sync>;
pub type ParamValidator = Arc<dyn Fn(&Value) -> Result<(), String> + Send + Sync>;

/// Who is calling. Tools that keep per-agent state (workspaces) key off
/// the agent id; most ignore it.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub agent_id: String,
    pub agent_role: AgentRole,
}

/// One registered tool. `required_role` absent means any role may call
/// it; `validate_params` runs before the guardian ever sees the request.
#[derive(Clone)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub safety_level: SafetyLevel,
    pub required_role: Option<HashSet<AgentRole>>,
    pub validate_params: Option<ParamValidator>,
    pub execute: ToolExecFn,
}

impl ToolDefinition {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        safety_level: SafetyLevel,
        execute: ToolExecFn,
    ) -> Self {
        ToolDefinition {
            name: name.into(),
            description: description.into(),
            safety_level,
            required_role: None,
            validate_params: None,
            execute,
        }
    }

    pub fn require_roles<I: IntoIterator<Item = AgentRole>>(mut self, roles: I) -> Self {
        self.required_role = Some(roles.into_iter().collect());
        self
    }

    pub fn with_validator(mut self, validator: ParamValidator) -> Self {
        self.validate_params = Some(validator);
        self
    }
}

// ── ToolRegistry ───────────────────────────────────────────────────────

pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Arc<ToolDefinition>>>,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        ToolRegistry { tools: RwLock::new(HashMap::new()) }
    }

    /// Register a tool. Registration is write-once; redefining an existing
    /// name fails.
    pub fn register(&self, definition: ToolDefinition) -> EngineResult<()> {
        let mut tools = self.tools.write();
        if tools.contains_key(&definition.name) {
            return Err(format!("Tool '{}' is already registered", definition.name).into());
        }
        info!("[tools] Registered '{}' ({})", definition.name, definition.safety_level.as_str());
        tools.insert(definition.name.clone(), Arc::new(definition));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<ToolDefinition>> {
        self.tools.read().get(name).cloned()
    }

    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Execute a tool on behalf of an agent.
    ///
    /// Check order (fixed):
    ///   1. unknown tool → error
    ///   2. tool role ACL → blocked by `tool_registry` (guardian not consulted)
    ///   3. agent tool ACL (deny wins) → blocked by `agent_policy` (guardian
    ///      not consulted)
    ///   4. parameter validation → error
    ///   5. guardian authorization via the engine
    ///   6. the tool function; thrown errors become `{success:false, error}`
    pub async fn execute(
        &self,
        name: &str,
        params: Value,
        agent: &AgentProfile,
        engine: &AgentEngine,
    ) -> ActionResult {
        let request = ActionRequest::new(agent.id.as_str(), agent.role, name, params.clone());

        let Some(tool) = self.get(name) else {
            return ActionResult::error(request.id.as_str(), format!("Unknown tool: {}", name));
        };

        if let Some(required) = &tool.required_role {
            if !required.contains(&agent.role) {
                return ActionResult::blocked(
                    request.id.as_str(),
                    "tool_registry",
                    format!(
                        "Tool '{}' is not available to role '{}'",
                        name,
                        agent.role.as_str()
                    ),
                );
            }
        }

        if !agent.is_tool_allowed(name) {
            return ActionResult::blocked(
                request.id.as_str(),
                "agent_policy",
                format!("Agent '{}' is not allowed to use tool '{}'", agent.id, name),
            );
        }

        if let Some(validator) = &tool.validate_params {
            if let Err(reason) = validator(&params) {
                return ActionResult::error(request.id.as_str(), format!("Invalid parameters: {}", reason));
            }
        }

        let request = request.with_safety_level(tool.safety_level);
        let authorization = engine.authorize(&request).await;
        if !authorization.success {
            return authorization;
        }

        let context = ToolContext { agent_id: agent.id.clone(), agent_role: agent.role };
        match (tool.execute)(params, context).await {
            Ok(data) => ActionResult::ok(request.id.as_str(), Some(data)),
            Err(e) => {
                warn!("[tools] '{}' failed: {}", name, e);
                ActionResult::error(request.id.as_str(), e.to_string())
            }
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guardian::audit::AuditLog;
    use crate::guardian::classifier::ActionClassifier;
    use crate::guardian::url_policy::UrlPolicy;
    use crate::guardian::vault::SecretVault;
    use crate::guardian::Guardian;
    use serde_json::json;

    fn noop_tool(name: &str, level: SafetyLevel) -> ToolDefinition {
        ToolDefinition::new(
            name,
            "test tool",
            level,
            Arc::new(|params, _ctx| Box::pin(async move { Ok(json!({"echo": params})) })),
        )
    }

    fn failing_tool(name: &str) -> ToolDefinition {
        ToolDefinition::new(
            name,
            "always fails",
            SafetyLevel::Safe,
            Arc::new(|_, _| Box::pin(async { Err("tool exploded".into()) })),
        )
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

    fn executor_profile() -> AgentProfile {
        AgentProfile::new("exec", AgentRole::Executor)
    }

    #[test]
    fn test_write_once_registration() {
        let registry = ToolRegistry::new();
        registry.register(noop_tool("echo", SafetyLevel::Safe)).unwrap();
        assert!(registry.register(noop_tool("echo", SafetyLevel::Safe)).is_err());
        assert_eq!(registry.list(), vec!["echo"]);
    }

    #[tokio::test]
    async fn test_unknown_tool_errors() {
        let dir = tempfile::tempdir().unwrap();
        let engine = test_engine(&dir);
        let registry = ToolRegistry::new();
        let result = registry
            .execute("missing", json!({}), &executor_profile(), &engine)
            .await;
        assert!(!result.success);
        assert!(result.error.as_deref().unwrap_or("").contains("Unknown tool"));
    }

    #[tokio::test]
    async fn test_role_acl_blocks_without_guardian() {
        let dir = tempfile::tempdir().unwrap();
        let engine = test_engine(&dir);
        let registry = ToolRegistry::new();
        registry
            .register(noop_tool("run_things", SafetyLevel::Safe).require_roles([AgentRole::Executor]))
            .unwrap();

        let researcher = AgentProfile::new("res", AgentRole::Researcher);
        let result = registry
            .execute("run_things", json!({}), &researcher, &engine)
            .await;
        assert!(!result.success);
        assert_eq!(result.blocked_by.as_deref(), Some("tool_registry"));
        // Guardian never saw the request.
        assert_eq!(engine.guardian().counters().0, 0);
    }

    #[tokio::test]
    async fn test_agent_acl_blocks_without_guardian() {
        let dir = tempfile::tempdir().unwrap();
        let engine = test_engine(&dir);
        let registry = ToolRegistry::new();
        registry.register(noop_tool("echo", SafetyLevel::Safe)).unwrap();

        let restricted = AgentProfile::new("exec", AgentRole::Executor).deny_tools(["echo"]);
        let result = registry.execute("echo", json!({}), &restricted, &engine).await;
        assert!(!result.success);
        assert_eq!(result.blocked_by.as_deref(), Some("agent_policy"));
        assert_eq!(engine.guardian().counters().0, 0);
    }

    #[tokio::test]
    async fn test_param_validation_errors() {
        let dir = tempfile::tempdir().unwrap();
        let engine = test_engine(&dir);
        let registry = ToolRegistry::new();
        registry
            .register(noop_tool("strict", SafetyLevel::Safe).with_validator(Arc::new(|params| {
                params
                    .get("required_field")
                    .map(|_| ())
                    .ok_or_else(|| "missing 'required_field'".to_string())
            })))
            .unwrap();

        let result = registry
            .execute("strict", json!({}), &executor_profile(), &engine)
            .await;
        assert!(!result.success);
        assert!(result.error.as_deref().unwrap_or("").contains("required_field"));

        let result = registry
            .execute("strict", json!({"required_field": 1}), &executor_profile(), &engine)
            .await;
        assert!(result.success);
    }

    #[tokio::test]
    async fn test_successful_execution_returns_data() {
        let dir = tempfile::tempdir().unwrap();
        let engine = test_engine(&dir);
        let registry = ToolRegistry::new();
        registry.register(noop_tool("echo", SafetyLevel::Safe)).unwrap();

        let result = registry
            .execute("echo", json!({"x": 1}), &executor_profile(), &engine)
            .await;
        assert!(result.success);
        assert_eq!(result.data.unwrap()["echo"]["x"], 1);
        // This one did go through the guardian.
        assert_eq!(engine.guardian().counters().0, 1);
    }

    #[tokio::test]
    async fn test_tool_error_wrapped() {
        let dir = tempfile::tempdir().unwrap();
        let engine = test_engine(&dir);
        let registry = ToolRegistry::new();
        registry.register(failing_tool("boom")).unwrap();

        let result = registry
            .execute("boom", json!({}), &executor_profile(), &engine)
            .await;
        assert!(!result.success);
        assert!(result.error.as_deref().unwrap_or("").contains("tool exploded"));
    }

    #[tokio::test]
    async fn test_guardian_block_returned_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let engine = test_engine(&dir);
        let registry = ToolRegistry::new();
        // "signup" as an action type is forbidden by the default policy.
        registry.register(noop_tool("signup", SafetyLevel::Safe)).unwrap();

        let result = registry
            .execute("signup", json!({}), &executor_profile(), &engine)
            .await;
        assert!(!result.success);
        assert_eq!(result.blocked_by.as_deref(), Some("guardian"));
    }
}
