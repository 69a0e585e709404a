// ── Pawnbutler Atoms: Constants ────────────────────────────────────────────
// All named constants for the crate live here.
// Rationale: collecting constants in one place eliminates magic strings,
// makes auditing easier, and keeps every layer's code self-documenting.

// ── Environment ingestion ──────────────────────────────────────────────────
// Variables named `PAWNBUTLER_SECRET_<NAME>` are loaded into the vault at
// startup under key `<name>` lowercased. Treat as a stable identifier.
pub const VAULT_ENV_PREFIX: &str = "PAWNBUTLER_SECRET_";

// ── Approval protocol ──────────────────────────────────────────────────────
// How long an externally-routed approval may stay unanswered before the
// fail-safe rejection fires.
pub const DEFAULT_APPROVAL_TIMEOUT_MS: u64 = 120_000;
// Reviewer identity stamped on fail-safe rejections.
pub const TIMEOUT_REVIEWER: &str = "system:timeout";

// ── Message bus ────────────────────────────────────────────────────────────
pub const BUS_HISTORY_CAPACITY: usize = 1000;
// UI-facing event stream retention (oldest dropped).
pub const EVENT_STREAM_CAPACITY: usize = 200;

// ── Sandbox ────────────────────────────────────────────────────────────────
pub const SANDBOX_DEFAULT_TIMEOUT_SECS: u64 = 30;
pub const SANDBOX_PIDS_LIMIT: i64 = 256;
// Exit codes: 124 = timed out (mirrors coreutils `timeout`), 126 = refused
// before dispatch (escape attempt or forbidden command).
pub const EXIT_TIMEOUT: i64 = 124;
pub const EXIT_BLOCKED: i64 = 126;
// Command output beyond this is truncated (kept, noted) to protect context.
pub const MAX_COMMAND_OUTPUT: usize = 50_000;

// ── Web fetch ──────────────────────────────────────────────────────────────
pub const WEB_FETCH_TIMEOUT_SECS: u64 = 15;
pub const WEB_FETCH_BODY_CAP: usize = 50 * 1024;

// ── Context pruning ────────────────────────────────────────────────────────
pub const DEFAULT_RESERVE_TOKENS: usize = 4096;

// ── Cron heartbeat ─────────────────────────────────────────────────────────
pub const HEARTBEAT_INTERVAL_SECS: u64 = 60;
