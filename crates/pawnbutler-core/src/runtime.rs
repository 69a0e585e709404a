// Pawnbutler Core — Runtime assembly
// Builds the whole substrate from a validated Config: vault (+ env
// ingestion), audit log (+ retention pruning), URL policy, classifier,
// guardian, engine, sandbox, tool registry, session manager, and the
// cron heartbeat. The CLI's `start` is a thin wrapper over this.

use std::sync::Arc;

use log::{info, warn};
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::atoms::constants::VAULT_ENV_PREFIX;
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::AgentRole;
use crate::config::Config;
use crate::engine::agents::{AgentProfile, MailboxAgent};
use crate::engine::AgentEngine;
use crate::guardian::audit::AuditLog;
use crate::guardian::classifier::ActionClassifier;
use crate::guardian::url_policy::UrlPolicy;
use crate::guardian::vault::SecretVault;
use crate::guardian::Guardian;
use crate::sandbox::Sandbox;
use crate::sessions::SessionManager;
use crate::tasks::{self, TaskStore};
use crate::tools::{exec, fs, web, ToolRegistry};

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeStatus {
    #[serde(flatten)]
    pub engine: crate::engine::StatusReport,
    pub sandbox_available: bool,
    pub scheduled_tasks: usize,
}

pub struct Runtime {
    config: Config,
    pub engine: Arc<AgentEngine>,
    pub registry: Arc<ToolRegistry>,
    pub sandbox: Arc<Sandbox>,
    pub tasks: Arc<TaskStore>,
    sessions: Arc<SessionManager>,
    vault: Arc<SecretVault>,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime").finish_non_exhaustive()
    }
}

impl Runtime {
    /// Assemble everything. Fails fast on any validation problem; a
    /// misconfigured policy must never come up half-armed.
    pub fn from_config(config: Config) -> EngineResult<Runtime> {
        let problems = config.validate();
        if !problems.is_empty() {
            return Err(EngineError::Config(problems.join("; ")));
        }

        // Vault: persisted entries first, then environment overrides.
        let vault = Arc::new(SecretVault::new());
        if config.secret_vault.enabled {
            match vault.load_from(&config.vault_store_path()) {
                Ok(n) if n > 0 => info!("[runtime] Vault loaded {} entr(ies)", n),
                Ok(_) => {}
                Err(e) => warn!("[runtime] Vault store unreadable: {}", e),
            }
        }
        vault.load_from_env(VAULT_ENV_PREFIX);

        // Audit journal with startup retention pruning.
        let audit = AuditLog::new(config.audit_log_path(), config.alerts_path());
        if let Err(e) = audit.prune_older_than(config.audit_log.retention_days) {
            warn!("[runtime] Audit retention pruning failed: {}", e);
        }

        let url_policy = UrlPolicy::from_lists(&config.url_allowlist, &config.url_blocklist)?;
        let classifier = ActionClassifier::new(config.safety_config())?;
        let guardian = Guardian::new(url_policy, classifier, vault.clone(), audit);

        let sessions = Arc::new(SessionManager::new(config.sessions_dir()));
        if let Err(e) = sessions.load_all() {
            warn!("[runtime] Session restore failed: {}", e);
        }

        let engine = Arc::new(AgentEngine::new(guardian).with_sessions(sessions.clone()));

        for entry in &config.agents {
            // validate() already vetted every role string.
            let Some(role) = AgentRole::parse(&entry.role) else { continue };
            let mut profile = AgentProfile::new(entry.id.as_str(), role);
            if let Some(allowed) = &entry.allowed_tools {
                profile = profile.allow_tools(allowed.iter().cloned());
            }
            profile = profile.deny_tools(entry.denied_tools.iter().cloned());
            engine.register_agent(Arc::new(MailboxAgent::new(profile)))?;
        }

        let sandbox = Arc::new(Sandbox::new(config.sandbox_config()));

        let registry = Arc::new(ToolRegistry::new());
        registry.register(exec::definition(sandbox.clone()))?;
        registry.register(web::fetch_definition())?;
        registry.register(web::search_definition())?;
        for definition in fs::definitions(config.state_dir()) {
            registry.register(definition)?;
        }

        let tasks = Arc::new(TaskStore::new(config.tasks_store_path()));
        match tasks.load() {
            Ok(n) if n > 0 => info!("[runtime] Loaded {} scheduled task(s)", n),
            Ok(_) => {}
            Err(e) => warn!("[runtime] Task store unreadable: {}", e),
        }

        Ok(Runtime {
            config,
            engine,
            registry,
            sandbox,
            tasks,
            sessions,
            vault,
            heartbeat: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn vault(&self) -> &SecretVault {
        &self.vault
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// Start the engine and the cron heartbeat.
    pub async fn start(&self) -> EngineResult<()> {
        self.engine.clone().start().await?;
        let handle = tokio::spawn(tasks::run_heartbeat(self.engine.clone(), self.tasks.clone()));
        *self.heartbeat.lock() = Some(handle);
        info!(
            "[runtime] Up: {} tool(s), {} agent(s)",
            self.registry.list().len(),
            self.engine.status().agents.len()
        );
        Ok(())
    }

    /// Engine status plus the sandbox probe, for the status surface.
    pub async fn status(&self) -> RuntimeStatus {
        RuntimeStatus {
            engine: self.engine.status(),
            sandbox_available: self.sandbox.is_available().await,
            scheduled_tasks: self.tasks.list().len(),
        }
    }

    /// Stop everything and persist what survives restarts: sessions, the
    /// vault store, and (already-on-disk) tasks and audit.
    pub async fn shutdown(&self) -> EngineResult<()> {
        if let Some(handle) = self.heartbeat.lock().take() {
            handle.abort();
        }
        self.engine.shutdown().await?;
        if let Err(e) = self.sessions.save_all() {
            warn!("[runtime] Session save failed: {}", e);
        }
        if self.config.secret_vault.enabled {
            if let Err(e) = self.vault.save_to(&self.config.vault_store_path()) {
                warn!("[runtime] Vault save failed: {}", e);
            }
        }
        if let Err(e) = self.sandbox.destroy().await {
            warn!("[runtime] Sandbox teardown failed: {}", e);
        }
        info!("[runtime] Shut down");
        Ok(())
    }
}

// ── Tests ──────────────────────────────────────────────────────────────
