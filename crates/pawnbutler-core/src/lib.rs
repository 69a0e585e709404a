// Pawnbutler Core — library entry point.
// The Policy & Isolation Core of the Pawnbutler runtime: every
// agent-initiated action funnels through the guardian pipeline before it
// may touch the world, commands run in a network-less container sandbox,
// and the engine owns agent lifecycle, mailboxes, and approvals.

// ── Atoms (constants, error types, shared vocabulary) ─────────────────
pub mod atoms;

// ── Guardian (policy pipeline: URL policy, vault, classifier, audit) ──
pub mod guardian;

// ── Agent Engine (lifecycle, message bus, approvals) ──────────────────
pub mod engine;

// ── Sandbox (container isolation + network guard) ─────────────────────
pub mod sandbox;

// ── Tool Registry + built-in tools ────────────────────────────────────
pub mod tools;

// ── Sessions + context pruning ────────────────────────────────────────
pub mod sessions;

// ── Scheduled tasks (cron store + heartbeat) ──────────────────────────
pub mod tasks;

// ── Collaborator interfaces (LLM providers, approval channels) ────────
pub mod channels;
pub mod providers;

// ── Configuration, events, assembly ───────────────────────────────────
pub mod config;
pub mod events;
pub mod runtime;

pub use atoms::error::{EngineError, EngineResult};
pub use atoms::types::{
    ActionRequest, ActionResult, AgentMessage, AgentMessageType, AgentRole, ApprovalRequest,
    ApprovalStatus, SafetyLevel,
};
pub use config::Config;
pub use engine::AgentEngine;
pub use guardian::Guardian;
pub use runtime::Runtime;
