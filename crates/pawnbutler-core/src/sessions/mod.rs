// Pawnbutler Core — Session Manager
// Conversation storage, one active session per agent, line-delimited JSON
// persistence (header line + one message per line). Agents never touch
// `Session` values directly; they hold ids and mutate through this
// manager.
//
//   pruner.rs — token-budgeted context pruning (sliding window / summarize)

pub mod pruner;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::{info, warn};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::atoms::error::EngineResult;

// ── Message types ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

/// A tool invocation recorded on an assistant message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// The tool's answer, recorded on a `tool` message. `tool_call_id` must
/// reference a preceding assistant message's tool call; the pruner keeps
/// the pair together or drops both.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResultPayload {
    pub tool_call_id: String,
    pub output: String,
    pub success: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMessage {
    pub role: MessageRole,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_result: Option<ToolResultPayload>,
    pub timestamp: DateTime<Utc>,
}

impl SessionMessage {
    pub fn text(role: MessageRole, content: impl Into<String>) -> Self {
        SessionMessage {
            role,
            content: content.into(),
            tool_calls: None,
            tool_result: None,
            timestamp: Utc::now(),
        }
    }

    pub fn assistant_with_tool_calls(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        SessionMessage {
            role: MessageRole::Assistant,
            content: content.into(),
            tool_calls: Some(tool_calls),
            tool_result: None,
            timestamp: Utc::now(),
        }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, output: impl Into<String>, success: bool) -> Self {
        SessionMessage {
            role: MessageRole::Tool,
            content: String::new(),
            tool_calls: None,
            tool_result: Some(ToolResultPayload {
                tool_call_id: tool_call_id.into(),
                output: output.into(),
                success,
            }),
            timestamp: Utc::now(),
        }
    }
}

// ── Session ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Paused,
    Completed,
    Expired,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub agent_id: String,
    pub messages: Vec<SessionMessage>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: SessionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// First line of every session file.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionHeader {
    #[serde(rename = "_type")]
    record_type: String,
    id: String,
    agent_id: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    status: SessionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    metadata: Option<Value>,
}

const HEADER_TYPE: &str = "session_header";

// ── SessionManager ─────────────────────────────────────────────────────

pub struct SessionManager {
    dir: PathBuf,
    sessions: RwLock<HashMap<String, Session>>,
}

impl SessionManager {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        SessionManager {
            dir: dir.into(),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create a new active session for an agent. Any prior active session
    /// for the same agent is paused first; at most one stays active.
    pub fn create_session(&self, agent_id: &str) -> EngineResult<String> {
        let mut sessions = self.sessions.write();

        let prior_active: Option<String> = sessions
            .values()
            .find(|s| s.agent_id == agent_id && s.status == SessionStatus::Active)
            .map(|s| s.id.clone());
        if let Some(prior) = prior_active {
            if let Some(session) = sessions.get_mut(&prior) {
                session.status = SessionStatus::Paused;
                session.updated_at = Utc::now();
            }
            info!("[sessions] Paused prior active session {} for '{}'", prior, agent_id);
        }

        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        sessions.insert(
            id.clone(),
            Session {
                id: id.clone(),
                agent_id: agent_id.to_string(),
                messages: Vec::new(),
                created_at: now,
                updated_at: now,
                status: SessionStatus::Active,
                metadata: None,
            },
        );
        Ok(id)
    }

    pub fn get_session(&self, session_id: &str) -> Option<Session> {
        self.sessions.read().get(session_id).cloned()
    }

    pub fn active_session_for(&self, agent_id: &str) -> Option<Session> {
        self.sessions
            .read()
            .values()
            .find(|s| s.agent_id == agent_id && s.status == SessionStatus::Active)
            .cloned()
    }

    pub fn list_sessions(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> = self.sessions.read().values().cloned().collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        sessions
    }

    /// Append a message. Timestamps are forced monotonic within the
    /// session (a clock step backwards must not reorder the transcript).
    pub fn append_message(&self, session_id: &str, mut message: SessionMessage) -> EngineResult<()> {
        let mut sessions = self.sessions.write();
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| format!("Session not found: {}", session_id))?;
        if let Some(last) = session.messages.last() {
            if message.timestamp < last.timestamp {
                message.timestamp = last.timestamp;
            }
        }
        session.updated_at = Utc::now();
        session.messages.push(message);
        Ok(())
    }

    pub fn set_status(&self, session_id: &str, status: SessionStatus) -> EngineResult<()> {
        let mut sessions = self.sessions.write();
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| format!("Session not found: {}", session_id))?;
        session.status = status;
        session.updated_at = Utc::now();
        Ok(())
    }

    // ── Persistence ────────────────────────────────────────────────────

    fn path_for(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{}.jsonl", session_id))
    }

    /// Write one session to disk: header line, then one line per message.
    pub fn save(&self, session_id: &str) -> EngineResult<()> {
        let session = self
            .get_session(session_id)
            .ok_or_else(|| format!("Session not found: {}", session_id))?;
        std::fs::create_dir_all(&self.dir)?;

        let header = SessionHeader {
            record_type: HEADER_TYPE.to_string(),
            id: session.id.clone(),
            agent_id: session.agent_id.clone(),
            created_at: session.created_at,
            updated_at: session.updated_at,
            status: session.status,
            metadata: session.metadata.clone(),
        };
        let mut out = serde_json::to_string(&header)?;
        out.push('\n');
        for message in &session.messages {
            out.push_str(&serde_json::to_string(message)?);
            out.push('\n');
        }

        let path = self.path_for(session_id);
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, out)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    pub fn save_all(&self) -> EngineResult<usize> {
        let ids: Vec<String> = self.sessions.read().keys().cloned().collect();
        for id in &ids {
            self.save(id)?;
        }
        Ok(ids.len())
    }

    /// Load every `*.jsonl` session file under the directory. Unreadable
    /// files are skipped with a warning; a trailing torn message line is
    /// tolerated.
    pub fn load_all(&self) -> EngineResult<usize> {
        if !self.dir.exists() {
            return Ok(0);
        }
        let mut loaded = 0;
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            match load_session_file(&path) {
                Ok(session) => {
                    self.sessions.write().insert(session.id.clone(), session);
                    loaded += 1;
                }
                Err(e) => warn!("[sessions] Skipping {:?}: {}", path, e),
            }
        }
        info!("[sessions] Loaded {} session(s) from {:?}", loaded, self.dir);
        Ok(loaded)
    }
}

fn load_session_file(path: &Path) -> EngineResult<Session> {
    let content = std::fs::read_to_string(path)?;
    let mut lines = content.lines().filter(|l| !l.trim().is_empty());

    let header_line = lines.next().ok_or("empty session file")?;
    let header: SessionHeader = serde_json::from_str(header_line)?;
    if header.record_type != HEADER_TYPE {
        return Err(format!("first line is not a {}", HEADER_TYPE).into());
    }

    let mut messages = Vec::new();
    for line in lines {
        match serde_json::from_str::<SessionMessage>(line) {
            Ok(message) => messages.push(message),
            Err(e) => {
                warn!("[sessions] Dropping unreadable message line in {:?}: {}", path, e);
            }
        }
    }

    Ok(Session {
        id: header.id,
        agent_id: header.agent_id,
        messages,
        created_at: header.created_at,
        updated_at: header.updated_at,
        status: header.status,
        metadata: header.metadata,
    })
}

// ── Tests ──────────────────────────────────────────────────────────────
