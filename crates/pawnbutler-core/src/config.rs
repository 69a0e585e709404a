// Pawnbutler Core — Configuration
// One JSON document drives the whole runtime. Fields that gate policy are
// kept as raw strings here and validated into typed values explicitly, so
// a typo produces a path-qualified message ("safety.defaultLevel: …")
// instead of an opaque deserialization error. Any validation message
// aborts startup.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::atoms::constants::DEFAULT_APPROVAL_TIMEOUT_MS;
use crate::atoms::error::EngineResult;
use crate::atoms::types::{AgentRole, SafetyLevel};
use crate::guardian::classifier::SafetyConfig;
use crate::sandbox::{NetworkMode, SandboxConfig};
use crate::sessions::pruner::{PruneStrategy, PrunerConfig};

// ── Sections ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentEntry {
    pub id: String,
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_tools: Option<Vec<String>>,
    #[serde(default)]
    pub denied_tools: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SafetySection {
    #[serde(default)]
    pub default_level: Option<String>,
    #[serde(default)]
    pub forbidden_actions: Vec<String>,
    #[serde(default)]
    pub dangerous_actions: Vec<String>,
    #[serde(default)]
    pub secret_patterns: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VaultSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub store_path: Option<PathBuf>,
}

impl Default for VaultSection {
    fn default() -> Self {
        VaultSection { enabled: true, store_path: None }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditSection {
    #[serde(default)]
    pub log_path: Option<PathBuf>,
    #[serde(default)]
    pub alerts_path: Option<PathBuf>,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

impl Default for AuditSection {
    fn default() -> Self {
        AuditSection {
            log_path: None,
            alerts_path: None,
            retention_days: default_retention_days(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxSection {
    #[serde(default = "default_sandbox_image")]
    pub image: String,
    #[serde(default = "default_network_mode")]
    pub network_mode: String,
    #[serde(default = "default_memory_limit")]
    pub memory_limit: i64,
    #[serde(default = "default_cpu_limit")]
    pub cpu_limit: f64,
    #[serde(default = "default_sandbox_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub mount_paths: Vec<String>,
    #[serde(default)]
    pub allow_write_mount: bool,
}

impl Default for SandboxSection {
    fn default() -> Self {
        SandboxSection {
            image: default_sandbox_image(),
            network_mode: default_network_mode(),
            memory_limit: default_memory_limit(),
            cpu_limit: default_cpu_limit(),
            timeout_secs: default_sandbox_timeout(),
            mount_paths: Vec::new(),
            allow_write_mount: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationsSection {
    /// Which channel carries external approvals, if any.
    #[serde(default)]
    pub approval_channel: Option<String>,
    #[serde(default = "default_approval_timeout_ms")]
    pub approval_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionsSection {
    #[serde(default)]
    pub dir: Option<PathBuf>,
    #[serde(default = "default_context_window")]
    pub context_window: usize,
    #[serde(default = "default_reserve_tokens")]
    pub reserve_tokens: usize,
    #[serde(default = "default_prune_strategy")]
    pub prune_strategy: String,
}

impl Default for SessionsSection {
    fn default() -> Self {
        SessionsSection {
            dir: None,
            context_window: default_context_window(),
            reserve_tokens: default_reserve_tokens(),
            prune_strategy: default_prune_strategy(),
        }
    }
}

// ── Config ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Root for all state files; defaults to `~/.pawnbutler`.
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
    pub agents: Vec<AgentEntry>,
    #[serde(default)]
    pub safety: SafetySection,
    #[serde(default)]
    pub url_allowlist: Vec<String>,
    #[serde(default)]
    pub url_blocklist: Vec<String>,
    #[serde(default)]
    pub secret_vault: VaultSection,
    #[serde(default)]
    pub audit_log: AuditSection,
    #[serde(default)]
    pub sandbox: SandboxSection,
    #[serde(default)]
    pub notifications: Option<NotificationsSection>,
    #[serde(default)]
    pub memory: Option<serde_json::Value>,
    #[serde(default)]
    pub llm: Option<serde_json::Value>,
    #[serde(default)]
    pub channels: Option<serde_json::Value>,
    #[serde(default)]
    pub sessions: SessionsSection,
}

impl Config {
    pub fn load(path: &Path) -> EngineResult<Config> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("Cannot read config {}: {}", path.display(), e))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|e| format!("Config {} is not valid JSON: {}", path.display(), e))?;
        Ok(config)
    }

    /// Path-qualified validation messages. Empty means the config is
    /// usable; anything else aborts startup.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();

        // agents
        if self.agents.is_empty() {
            problems.push("agents: at least one agent is required".to_string());
        }
        let mut seen_ids = HashSet::new();
        let mut has_butler = false;
        for (index, entry) in self.agents.iter().enumerate() {
            let prefix = format!("agents[{}]", index);
            if entry.id.trim().is_empty() {
                problems.push(format!("{}.id: must not be empty", prefix));
            }
            if !seen_ids.insert(entry.id.clone()) {
                problems.push(format!("{}.id: duplicate agent id '{}'", prefix, entry.id));
            }
            match AgentRole::parse(&entry.role) {
                Some(AgentRole::Butler) => has_butler = true,
                Some(_) => {}
                None => problems.push(format!(
                    "{}.role: unknown role '{}' (expected butler|researcher|executor|guardian)",
                    prefix, entry.role
                )),
            }
        }
        if !self.agents.is_empty() && !has_butler {
            problems.push("agents: a butler agent is required".to_string());
        }

        // safety
        if let Some(level) = &self.safety.default_level {
            if SafetyLevel::parse(level).is_none() {
                problems.push(format!(
                    "safety.defaultLevel: unknown level '{}' (expected safe|moderate|dangerous|forbidden)",
                    level
                ));
            }
        }
        for (index, pattern) in self.safety.secret_patterns.iter().enumerate() {
            if let Err(e) = regex::Regex::new(pattern) {
                problems.push(format!("safety.secretPatterns[{}]: invalid regex: {}", index, e));
            }
        }

        // URL policy
        for (index, pattern) in self.url_blocklist.iter().enumerate() {
            if let Err(e) = regex::Regex::new(pattern) {
                problems.push(format!("urlBlocklist[{}]: invalid regex: {}", index, e));
            }
        }

        // sandbox
        match self.sandbox.network_mode.as_str() {
            "none" | "bridge" => {}
            other => problems.push(format!(
                "sandbox.networkMode: unknown mode '{}' (expected none|bridge)",
                other
            )),
        }
        if self.sandbox.memory_limit <= 0 {
            problems.push("sandbox.memoryLimit: must be positive".to_string());
        }
        if self.sandbox.cpu_limit <= 0.0 {
            problems.push("sandbox.cpuLimit: must be positive".to_string());
        }
        if self.sandbox.timeout_secs == 0 {
            problems.push("sandbox.timeoutSecs: must be positive".to_string());
        }

        // notifications
        if let Some(notifications) = &self.notifications {
            if notifications.approval_timeout_ms == 0 {
                problems.push("notifications.approvalTimeoutMs: must be positive".to_string());
            }
            if let Some(channel) = &notifications.approval_channel {
                if !matches!(channel.as_str(), "whatsapp" | "telegram" | "discord" | "slack") {
                    problems.push(format!(
                        "notifications.approvalChannel: unknown channel '{}'",
                        channel
                    ));
                }
            }
        }

        // sessions
        if self.sessions.context_window <= self.sessions.reserve_tokens {
            problems.push("sessions.contextWindow: must exceed sessions.reserveTokens".to_string());
        }
        if !matches!(
            self.sessions.prune_strategy.as_str(),
            "none" | "sliding_window" | "summarize"
        ) {
            problems.push(format!(
                "sessions.pruneStrategy: unknown strategy '{}' (expected none|sliding_window|summarize)",
                self.sessions.prune_strategy
            ));
        }

        problems
    }

    // ── Typed builders (call only after validate() came back empty) ────

    pub fn state_dir(&self) -> PathBuf {
        match &self.state_dir {
            Some(dir) => dir.clone(),
            None => dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".pawnbutler"),
        }
    }

    pub fn audit_log_path(&self) -> PathBuf {
        self.audit_log
            .log_path
            .clone()
            .unwrap_or_else(|| self.state_dir().join("audit.jsonl"))
    }

    pub fn alerts_path(&self) -> PathBuf {
        self.audit_log
            .alerts_path
            .clone()
            .unwrap_or_else(|| self.state_dir().join("alerts.jsonl"))
    }

    pub fn vault_store_path(&self) -> PathBuf {
        self.secret_vault
            .store_path
            .clone()
            .unwrap_or_else(|| self.state_dir().join("vault.json"))
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.sessions
            .dir
            .clone()
            .unwrap_or_else(|| self.state_dir().join("sessions"))
    }

    pub fn tasks_store_path(&self) -> PathBuf {
        self.state_dir().join("tasks.json")
    }

    pub fn safety_config(&self) -> SafetyConfig {
        let default_level = self
            .safety
            .default_level
            .as_deref()
            .and_then(SafetyLevel::parse)
            .unwrap_or(SafetyLevel::Safe);
        SafetyConfig::with_additions(
            default_level,
            &self.safety.forbidden_actions,
            &self.safety.dangerous_actions,
            &self.safety.secret_patterns,
        )
    }

    pub fn sandbox_config(&self) -> SandboxConfig {
        SandboxConfig {
            image: self.sandbox.image.clone(),
            network_mode: match self.sandbox.network_mode.as_str() {
                "bridge" => NetworkMode::Bridge,
                _ => NetworkMode::None,
            },
            memory_limit: self.sandbox.memory_limit,
            cpu_limit: self.sandbox.cpu_limit,
            timeout_secs: self.sandbox.timeout_secs,
            mount_paths: self.sandbox.mount_paths.clone(),
            allow_write_mount: self.sandbox.allow_write_mount,
        }
    }

    pub fn pruner_config(&self) -> PrunerConfig {
        let strategy = match self.sessions.prune_strategy.as_str() {
            "none" => PruneStrategy::None,
            "summarize" => PruneStrategy::Summarize,
            _ => PruneStrategy::SlidingWindow,
        };
        PrunerConfig {
            context_window: self.sessions.context_window,
            reserve_tokens: self.sessions.reserve_tokens,
            strategy,
        }
    }

    pub fn approval_timeout_ms(&self) -> u64 {
        self.notifications
            .as_ref()
            .map(|n| n.approval_timeout_ms)
            .unwrap_or(DEFAULT_APPROVAL_TIMEOUT_MS)
    }
}

// ── serde defaults ─────────────────────────────────────────────────────

fn default_true() -> bool {
    true
}

fn default_retention_days() -> u32 {
    30
}

fn default_sandbox_image() -> String {
    "alpine:latest".to_string()
}

fn default_network_mode() -> String {
    "none".to_string()
}

fn default_memory_limit() -> i64 {
    256 * 1024 * 1024
}

fn default_cpu_limit() -> f64 {
    1.0
}

fn default_sandbox_timeout() -> u64 {
    30
}

fn default_approval_timeout_ms() -> u64 {
    DEFAULT_APPROVAL_TIMEOUT_MS
}

fn default_context_window() -> usize {
    128_000
}

fn default_reserve_tokens() -> usize {
    crate::atoms::constants::DEFAULT_RESERVE_TOKENS
}

fn default_prune_strategy() -> String {
    "sliding_window".to_string()
}

// ── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn minimal() -> Config {
        serde_json::from_value(json!({
            "agents": [
                {"id": "butler", "role": "butler"},
                {"id": "exec", "role": "executor"}
            ]
        }))
        .unwrap()
    }

    #[test]
    fn test_minimal_config_valid() {
        let config = minimal();
        assert!(config.validate().is_empty());
        assert_eq!(config.sandbox.network_mode, "none");
        assert_eq!(config.audit_log.retention_days, 30);
    }

    #[test]
    fn test_missing_butler_reported() {
        let config: Config = serde_json::from_value(json!({
            "agents": [{"id": "exec", "role": "executor"}]
        }))
        .unwrap();
        let problems = config.validate();
        assert!(problems.iter().any(|p| p.contains("butler agent is required")));
    }

    #[test]
    fn test_path_qualified_messages() {
        let config: Config = serde_json::from_value(json!({
            "agents": [
                {"id": "butler", "role": "butler"},
                {"id": "butler", "role": "chef"}
            ],
            "safety": {"defaultLevel": "extreme", "secretPatterns": ["[bad"]},
            "urlBlocklist": ["(unclosed"],
            "sandbox": {"networkMode": "host", "memoryLimit": -5},
        }))
        .unwrap();
        let problems = config.validate();
        let text = problems.join("\n");
        assert!(text.contains("agents[1].id: duplicate"));
        assert!(text.contains("agents[1].role: unknown role 'chef'"));
        assert!(text.contains("safety.defaultLevel: unknown level 'extreme'"));
        assert!(text.contains("safety.secretPatterns[0]"));
        assert!(text.contains("urlBlocklist[0]"));
        assert!(text.contains("sandbox.networkMode: unknown mode 'host'"));
        assert!(text.contains("sandbox.memoryLimit"));
    }

    #[test]
    fn test_unknown_channel_reported() {
        let config: Config = serde_json::from_value(json!({
            "agents": [{"id": "b", "role": "butler"}],
            "notifications": {"approvalChannel": "carrier_pigeon"}
        }))
        .unwrap();
        assert!(config
            .validate()
            .iter()
            .any(|p| p.contains("notifications.approvalChannel")));
    }

    #[test]
    fn test_sessions_window_check() {
        let config: Config = serde_json::from_value(json!({
            "agents": [{"id": "b", "role": "butler"}],
            "sessions": {"contextWindow": 1000, "reserveTokens": 4096}
        }))
        .unwrap();
        assert!(config
            .validate()
            .iter()
            .any(|p| p.contains("sessions.contextWindow")));
    }

    #[test]
    fn test_typed_builders() {
        let config = minimal();
        let safety = config.safety_config();
        assert!(safety.forbidden_actions.contains("signup"));

        let sandbox = config.sandbox_config();
        assert_eq!(sandbox.network_mode, NetworkMode::None);

        let pruner = config.pruner_config();
        assert_eq!(pruner.strategy, PruneStrategy::SlidingWindow);
    }

    #[test]
    fn test_default_paths_under_state_dir() {
        let config: Config = serde_json::from_value(json!({
            "stateDir": "/tmp/pb-test",
            "agents": [{"id": "b", "role": "butler"}]
        }))
        .unwrap();
        assert_eq!(config.audit_log_path(), PathBuf::from("/tmp/pb-test/audit.jsonl"));
        assert_eq!(config.vault_store_path(), PathBuf::from("/tmp/pb-test/vault.json"));
        assert_eq!(config.sessions_dir(), PathBuf::from("/tmp/pb-test/sessions"));
        assert_eq!(config.tasks_store_path(), PathBuf::from("/tmp/pb-test/tasks.json"));
    }

    #[test]
    fn test_load_rejects_bad_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(Config::load(&path).is_err());
        assert!(Config::load(&dir.path().join("missing.json")).is_err());
    }
}
