// Pawnbutler Core — Audit Log
// Append-only JSON-lines journal of every guardian decision, with a
// parallel alerts file for blocks. Writes are totally ordered; entries are
// sanitised before they reach this module (no secret ever lands on disk).

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use log::{info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::atoms::error::EngineResult;
use crate::atoms::types::{AgentRole, ApprovalStatus, SafetyLevel};

// ── Types ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Success,
    Blocked,
    Error,
}

impl AuditOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditOutcome::Success => "success",
            AuditOutcome::Blocked => "blocked",
            AuditOutcome::Error => "error",
        }
    }
}

/// One journal line. `params` must already be masked by the vault.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub agent_id: String,
    pub agent_role: AgentRole,
    pub action_type: String,
    pub safety_level: SafetyLevel,
    pub approval_status: ApprovalStatus,
    pub params: Value,
    pub result: AuditOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Alert lines carry the entry plus the alert annotation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AlertEntry {
    #[serde(flatten)]
    entry: AuditEntry,
    alert_message: String,
    is_alert: bool,
}

/// Filter for journal queries. All fields are conjunctive; `None` matches
/// everything.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub agent_id: Option<String>,
    pub action_type: Option<String>,
    pub result: Option<AuditOutcome>,
    pub limit: Option<usize>,
}

/// Aggregate view over the journal, for status surfaces.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditSummary {
    pub total: u64,
    pub blocked: u64,
    pub errors: u64,
    /// blocked / total; 0.0 for an empty journal.
    pub block_rate: f64,
    pub by_level: HashMap<String, u64>,
    pub by_agent: HashMap<String, u64>,
}

// ── AuditLog ───────────────────────────────────────────────────────────

/// The journal plus its parallel alerts file. A single mutex covers both
/// files so the write order matches the decision order.
pub struct AuditLog {
    log_path: PathBuf,
    alerts_path: PathBuf,
    write_lock: Mutex<()>,
}

impl AuditLog {
    pub fn new(log_path: impl Into<PathBuf>, alerts_path: impl Into<PathBuf>) -> Self {
        AuditLog {
            log_path: log_path.into(),
            alerts_path: alerts_path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn alerts_path(&self) -> &Path {
        &self.alerts_path
    }

    /// Append one entry to the journal.
    pub fn append(&self, entry: &AuditEntry) -> EngineResult<()> {
        let line = serde_json::to_string(entry)?;
        let _guard = self.write_lock.lock();
        append_line(&self.log_path, &line)
    }

    /// Append one entry to the journal AND the alerts file.
    pub fn alert(&self, entry: &AuditEntry, alert_message: &str) -> EngineResult<()> {
        let journal_line = serde_json::to_string(entry)?;
        let alert_line = serde_json::to_string(&AlertEntry {
            entry: entry.clone(),
            alert_message: alert_message.to_string(),
            is_alert: true,
        })?;
        let _guard = self.write_lock.lock();
        append_line(&self.log_path, &journal_line)?;
        append_line(&self.alerts_path, &alert_line)
    }

    /// Read entries matching `filter`, newest last. Unparseable lines are
    /// skipped (a torn final line after a crash must not poison queries).
    pub fn query(&self, filter: &AuditFilter) -> EngineResult<Vec<AuditEntry>> {
        let entries = self.read_all()?;
        let mut matched: Vec<AuditEntry> = entries
            .into_iter()
            .filter(|e| {
                filter.agent_id.as_deref().is_none_or(|a| e.agent_id == a)
                    && filter.action_type.as_deref().is_none_or(|t| e.action_type == t)
                    && filter.result.is_none_or(|r| e.result == r)
            })
            .collect();
        if let Some(limit) = filter.limit {
            let skip = matched.len().saturating_sub(limit);
            matched.drain(..skip);
        }
        Ok(matched)
    }

    /// Aggregate counts over the whole journal.
    pub fn summary(&self) -> EngineResult<AuditSummary> {
        let entries = self.read_all()?;
        let mut summary = AuditSummary {
            total: 0,
            blocked: 0,
            errors: 0,
            block_rate: 0.0,
            by_level: HashMap::new(),
            by_agent: HashMap::new(),
        };
        for entry in &entries {
            summary.total += 1;
            match entry.result {
                AuditOutcome::Blocked => summary.blocked += 1,
                AuditOutcome::Error => summary.errors += 1,
                AuditOutcome::Success => {}
            }
            *summary.by_level.entry(entry.safety_level.as_str().to_string()).or_insert(0) += 1;
            *summary.by_agent.entry(entry.agent_id.clone()).or_insert(0) += 1;
        }
        if summary.total > 0 {
            summary.block_rate = summary.blocked as f64 / summary.total as f64;
        }
        Ok(summary)
    }

    /// Drop journal lines older than `retention_days`. Called at startup;
    /// the alerts file is pruned with the same cutoff.
    pub fn prune_older_than(&self, retention_days: u32) -> EngineResult<usize> {
        let cutoff = Utc::now() - Duration::days(i64::from(retention_days));
        let _guard = self.write_lock.lock();
        let mut removed = prune_file(&self.log_path, cutoff)?;
        removed += prune_file(&self.alerts_path, cutoff)?;
        if removed > 0 {
            info!("[audit] Pruned {} entries older than {} days", removed, retention_days);
        }
        Ok(removed)
    }

    fn read_all(&self) -> EngineResult<Vec<AuditEntry>> {
        read_entries(&self.log_path)
    }

    /// Read the alert lines (entry + annotation flattened back out).
    pub fn read_alerts(&self) -> EngineResult<Vec<AuditEntry>> {
        read_entries(&self.alerts_path)
    }
}

// ── File helpers ───────────────────────────────────────────────────────

fn append_line(path: &Path, line: &str) -> EngineResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{}", line)?;
    Ok(())
}

fn read_entries(path: &Path) -> EngineResult<Vec<AuditEntry>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = std::fs::read_to_string(path)?;
    let mut entries = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<AuditEntry>(line) {
            Ok(entry) => entries.push(entry),
            Err(e) => warn!("[audit] Skipping unreadable journal line: {}", e),
        }
    }
    Ok(entries)
}

fn prune_file(path: &Path, cutoff: DateTime<Utc>) -> EngineResult<usize> {
    if !path.exists() {
        return Ok(0);
    }
    let content = std::fs::read_to_string(path)?;
    let mut kept = Vec::new();
    let mut removed = 0;
    for line in content.lines() {
        let timestamp = serde_json::from_str::<Value>(line)
            .ok()
            .and_then(|v| v.get("timestamp").and_then(Value::as_str).map(str::to_string))
            .and_then(|t| t.parse::<DateTime<Utc>>().ok());
        match timestamp {
            Some(ts) if ts < cutoff => removed += 1,
            // Keep lines we cannot date rather than destroy evidence.
            _ => kept.push(line.to_string()),
        }
    }
    if removed > 0 {
        let tmp = path.with_extension("tmp");
        let mut body = kept.join("\n");
        if !body.is_empty() {
            body.push('\n');
        }
        std::fs::write(&tmp, body)?;
        std::fs::rename(&tmp, path)?;
    }
    Ok(removed)
}

// ── Tests ──────────────────────────────────────────────────────────────
