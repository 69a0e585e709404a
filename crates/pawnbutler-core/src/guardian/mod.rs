// Pawnbutler Core — Guardian
// The central policy pipeline. Every tool invocation becomes an
// ActionRequest and passes through `validate_action` before it may touch
// the world: classification, URL policy, secret scanning, signup/payment
// heuristics, masked audit logging, and the external-approval protocol
// with its fail-safe timeout.
//
// Module layout:
//   url_policy.rs — domain allowlist + regex blocklist
//   vault.rs      — keyed secret store + output masking
//   classifier.rs — safety-level classification
//   audit.rs      — append-only JSONL journal + alerts

pub mod audit;
pub mod classifier;
pub mod url_policy;
pub mod vault;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{info, warn};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::atoms::constants::{DEFAULT_APPROVAL_TIMEOUT_MS, TIMEOUT_REVIEWER};
use crate::atoms::error::EngineResult;
use crate::atoms::types::{ActionRequest, ApprovalRequest, ApprovalStatus, SafetyLevel};
use crate::channels::{ApprovalChannel, ApprovalNotification, ApprovalResponse};

use audit::{AuditEntry, AuditLog, AuditOutcome};
use classifier::ActionClassifier;
use url_policy::UrlPolicy;
use vault::SecretVault;

// ── Verdict ────────────────────────────────────────────────────────────

/// Outcome of the guardian pipeline for one action request.
#[derive(Debug)]
pub enum Verdict {
    /// The action may execute.
    Approved,
    /// The action is denied. `by` names the blocking layer.
    Blocked { by: String, reason: String },
    /// Dangerous with no external channel: the local butler must decide.
    /// The pending request travels with the verdict.
    AwaitingApproval(ApprovalRequest),
}

// ── Guardian ───────────────────────────────────────────────────────────

pub struct Guardian {
    url_policy: UrlPolicy,
    classifier: ActionClassifier,
    vault: Arc<SecretVault>,
    audit: AuditLog,
    approval_channel: Option<Arc<dyn ApprovalChannel>>,
    approval_timeout: Duration,
    /// One-shot rendezvous per outstanding external approval, keyed by
    /// request id. `deliver_approval_response` completes the waiting side.
    pending_external: Mutex<HashMap<String, oneshot::Sender<ApprovalResponse>>>,
    total_checked: AtomicU64,
    blocked_count: AtomicU64,
}

impl Guardian {
    pub fn new(
        url_policy: UrlPolicy,
        classifier: ActionClassifier,
        vault: Arc<SecretVault>,
        audit: AuditLog,
    ) -> Self {
        Guardian {
            url_policy,
            classifier,
            vault,
            audit,
            approval_channel: None,
            approval_timeout: Duration::from_millis(DEFAULT_APPROVAL_TIMEOUT_MS),
            pending_external: Mutex::new(HashMap::new()),
            total_checked: AtomicU64::new(0),
            blocked_count: AtomicU64::new(0),
        }
    }

    /// Route dangerous-action approvals over an external channel instead
    /// of the local butler.
    pub fn with_approval_channel(
        mut self,
        channel: Arc<dyn ApprovalChannel>,
        timeout: Duration,
    ) -> Self {
        self.approval_channel = Some(channel);
        self.approval_timeout = timeout;
        self
    }

    pub fn url_policy(&self) -> &UrlPolicy {
        &self.url_policy
    }

    pub fn classifier(&self) -> &ActionClassifier {
        &self.classifier
    }

    pub fn vault(&self) -> &SecretVault {
        &self.vault
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    /// (total requests checked, requests blocked). "Awaiting approval" is
    /// not a block.
    pub fn counters(&self) -> (u64, u64) {
        (
            self.total_checked.load(Ordering::Relaxed),
            self.blocked_count.load(Ordering::Relaxed),
        )
    }

    pub fn has_external_channel(&self) -> bool {
        self.approval_channel.is_some()
    }

    // ── Pipeline ───────────────────────────────────────────────────────

    /// Validate one action request. Executes the fixed pipeline order;
    /// every decision is audited with masked params, blocks also land in
    /// the alerts journal.
    pub async fn validate_action(&self, request: &ActionRequest) -> Verdict {
        self.total_checked.fetch_add(1, Ordering::Relaxed);

        // 1. Classify. The inbound safety_level is advisory only.
        let level = self.classifier.classify(request);

        // 2. Forbidden actions never reach approval.
        if level == SafetyLevel::Forbidden {
            return self.block(
                request,
                level,
                "Action is forbidden by safety policy".to_string(),
            );
        }

        // 3. Outbound web access consults the URL policy.
        if request.action_type == "web_fetch" || request.action_type == "web_search" {
            if let Some(url) = web_target(&request.params) {
                if url.starts_with("http") {
                    let decision = self.url_policy.check(url);
                    if !decision.allowed {
                        return self.block(request, level, decision.reason);
                    }
                }
            }
        }

        // 4. Secret re-check, even when classification came out lower
        //    (a configured safe action type must not smuggle a key out).
        let blob = request.params.to_string();
        if let Some(pattern) = self.classifier.contains_secret_pattern(&blob) {
            return self.block(
                request,
                SafetyLevel::Dangerous,
                format!("Potential secret exposure detected: {}", pattern),
            );
        }

        // 5. Signup / payment re-check.
        if self.classifier.contains_signup_pattern(&request.params) {
            return self.block(
                request,
                SafetyLevel::Forbidden,
                "Account signup detected - forbidden by safety policy".to_string(),
            );
        }
        if self.classifier.contains_payment_pattern(&request.params) {
            return self.block(
                request,
                SafetyLevel::Forbidden,
                "Payment attempt detected - forbidden by safety policy".to_string(),
            );
        }

        // 6–7. Dangerous actions need a human.
        if level == SafetyLevel::Dangerous {
            if let Some(channel) = self.approval_channel.clone() {
                return self.run_external_approval(request, level, channel).await;
            }
            // No external channel: park the request for the butler.
            let mut pending_request = request.clone();
            pending_request.safety_level = level;
            pending_request.requires_approval = true;
            let approval = ApprovalRequest::pending(pending_request);
            self.write_audit(request, level, ApprovalStatus::Pending, AuditOutcome::Success, Some("awaiting approval".to_string()));
            return Verdict::AwaitingApproval(approval);
        }

        // 8. Auto-approved.
        self.write_audit(request, level, ApprovalStatus::AutoApproved, AuditOutcome::Success, None);
        Verdict::Approved
    }

    /// Complete an outstanding external approval. Returns false when no
    /// rendezvous exists for the id (already resolved, timed out, or never
    /// requested); delivering twice is a no-op, not an error.
    pub fn deliver_approval_response(&self, response: ApprovalResponse) -> bool {
        match self.pending_external.lock().remove(&response.request_id) {
            Some(tx) => tx.send(response).is_ok(),
            None => false,
        }
    }

    // ── External approval protocol ─────────────────────────────────────

    async fn run_external_approval(
        &self,
        request: &ActionRequest,
        level: SafetyLevel,
        channel: Arc<dyn ApprovalChannel>,
    ) -> Verdict {
        let notification = ApprovalNotification {
            request_id: request.id.clone(),
            agent_name: request.agent_id.clone(),
            action_type: request.action_type.clone(),
            safety_level: level,
            description: format!(
                "Agent '{}' wants to run '{}'",
                request.agent_id, request.action_type
            ),
            params: self.sanitize(&request.params),
        };

        let (tx, rx) = oneshot::channel();
        self.pending_external.lock().insert(request.id.clone(), tx);

        info!(
            "[guardian] Requesting external approval for {} ({}) via {}",
            request.id,
            request.action_type,
            channel.kind().as_str()
        );

        if let Err(e) = channel.send_approval_request(&notification).await {
            // Transport failure fails safe, never auto-approves.
            self.pending_external.lock().remove(&request.id);
            warn!("[guardian] Approval channel send failed: {}", e);
            return self.block(
                request,
                level,
                format!("Approval channel unreachable - auto-rejected (fail-safe): {}", e),
            );
        }

        let response = match tokio::time::timeout(self.approval_timeout, rx).await {
            Ok(Ok(response)) => response,
            // Timeout, or the sender was dropped: synthesise the rejection.
            _ => {
                self.pending_external.lock().remove(&request.id);
                ApprovalResponse {
                    request_id: request.id.clone(),
                    approved: false,
                    responded_by: TIMEOUT_REVIEWER.to_string(),
                    responded_at: Utc::now(),
                    reason: Some("Approval timed out - auto-rejected (fail-safe)".to_string()),
                }
            }
        };

        if response.approved {
            self.write_audit(
                request,
                level,
                ApprovalStatus::AutoApproved,
                AuditOutcome::Success,
                Some(format!("approved by {}", response.responded_by)),
            );
            Verdict::Approved
        } else {
            let reason = match response.reason {
                Some(r) => format!("Rejected by {}: {}", response.responded_by, r),
                None => format!("Rejected by {}", response.responded_by),
            };
            self.block(request, level, reason)
        }
    }

    // ── Internal helpers ───────────────────────────────────────────────

    /// Record a block (journal + alerts + counter) and build the verdict.
    fn block(&self, request: &ActionRequest, level: SafetyLevel, reason: String) -> Verdict {
        self.blocked_count.fetch_add(1, Ordering::Relaxed);
        let entry = self.entry(request, level, ApprovalStatus::AutoBlocked, AuditOutcome::Blocked, Some(reason.clone()));
        if let Err(e) = self.audit.alert(&entry, &reason) {
            warn!("[guardian] Failed to write alert: {}", e);
        }
        Verdict::Blocked { by: "guardian".to_string(), reason }
    }

    fn write_audit(
        &self,
        request: &ActionRequest,
        level: SafetyLevel,
        approval_status: ApprovalStatus,
        result: AuditOutcome,
        details: Option<String>,
    ) {
        let entry = self.entry(request, level, approval_status, result, details);
        if let Err(e) = self.audit.append(&entry) {
            warn!("[guardian] Failed to write audit entry: {}", e);
        }
    }

    fn entry(
        &self,
        request: &ActionRequest,
        level: SafetyLevel,
        approval_status: ApprovalStatus,
        result: AuditOutcome,
        details: Option<String>,
    ) -> AuditEntry {
        AuditEntry {
            timestamp: Utc::now(),
            agent_id: request.agent_id.clone(),
            agent_role: request.agent_role,
            action_type: request.action_type.clone(),
            safety_level: level,
            approval_status,
            params: self.sanitize(&request.params),
            result,
            details,
        }
    }

    /// Pass every string in the parameter tree through the vault's mask.
    pub fn sanitize(&self, params: &Value) -> Value {
        mask_value(params, &self.vault)
    }
}

fn mask_value(value: &Value, vault: &SecretVault) -> Value {
    match value {
        Value::String(s) => Value::String(vault.mask(s)),
        Value::Array(items) => Value::Array(items.iter().map(|v| mask_value(v, vault)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), mask_value(v, vault)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// The URL (or query) a web action is targeting.
fn web_target(params: &Value) -> Option<&str> {
    params
        .get("url")
        .and_then(Value::as_str)
        .or_else(|| params.get("query").and_then(Value::as_str))
}

// ── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::types::AgentRole;
    use crate::channels::ChannelKind;
    use async_trait::async_trait;
    use serde_json::json;

    fn test_guardian(dir: &tempfile::TempDir) -> Guardian {
        let url_policy = UrlPolicy::new();
        url_policy.add_allowed("example.com");
        Guardian::new(
            url_policy,
            ActionClassifier::with_defaults(),
            Arc::new(SecretVault::new()),
            AuditLog::new(dir.path().join("audit.jsonl"), dir.path().join("alerts.jsonl")),
        )
    }

    fn request(action: &str, params: Value) -> ActionRequest {
        ActionRequest::new("executor", AgentRole::Executor, action, params)
    }

    #[tokio::test]
    async fn test_safe_action_auto_approved() {
        let dir = tempfile::tempdir().unwrap();
        let guardian = test_guardian(&dir);
        let verdict = guardian.validate_action(&request("read_file", json!({"path": "x"}))).await;
        assert!(matches!(verdict, Verdict::Approved));
        assert_eq!(guardian.counters(), (1, 0));
    }

    #[tokio::test]
    async fn test_forbidden_action_blocked_and_alerted() {
        let dir = tempfile::tempdir().unwrap();
        let guardian = test_guardian(&dir);
        let verdict = guardian.validate_action(&request("signup", json!({}))).await;
        match verdict {
            Verdict::Blocked { reason, .. } => assert!(reason.contains("forbidden")),
            other => panic!("expected block, got {:?}", other),
        }
        assert_eq!(guardian.counters(), (1, 1));
        assert_eq!(guardian.audit().read_alerts().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_url_policy_blocks_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let guardian = test_guardian(&dir);
        let verdict = guardian
            .validate_action(&request("web_fetch", json!({"url": "https://other.org/x"})))
            .await;
        match verdict {
            Verdict::Blocked { reason, .. } => assert!(reason.contains("allowlist")),
            other => panic!("expected block, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_allowed_subdomain_fetch_passes() {
        let dir = tempfile::tempdir().unwrap();
        let guardian = test_guardian(&dir);
        let verdict = guardian
            .validate_action(&request("web_fetch", json!({"url": "https://api.example.com/x"})))
            .await;
        assert!(matches!(verdict, Verdict::Approved));
    }

    #[tokio::test]
    async fn test_secret_recheck_blocks_even_safe_action() {
        let dir = tempfile::tempdir().unwrap();
        let guardian = test_guardian(&dir);
        let verdict = guardian
            .validate_action(&request("read_file", json!({"content": "sk-ABCDEFGHIJKLMNOPQRST"})))
            .await;
        match verdict {
            Verdict::Blocked { reason, .. } => {
                assert!(reason.contains("Potential secret exposure detected"));
            }
            other => panic!("expected block, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_dangerous_without_channel_awaits_approval() {
        let dir = tempfile::tempdir().unwrap();
        let guardian = test_guardian(&dir);
        let verdict = guardian
            .validate_action(&request("exec_command", json!({"command": "make build"})))
            .await;
        match verdict {
            Verdict::AwaitingApproval(approval) => {
                assert_eq!(approval.status, ApprovalStatus::Pending);
                assert!(approval.action_request.requires_approval);
            }
            other => panic!("expected awaiting approval, got {:?}", other),
        }
        // Awaiting approval is not a block.
        assert_eq!(guardian.counters(), (1, 0));
    }

    #[tokio::test]
    async fn test_audit_params_masked() {
        let dir = tempfile::tempdir().unwrap();
        let guardian = test_guardian(&dir);
        guardian.vault().store("token", "SUPERSECRETVALUE");
        let _ = guardian
            .validate_action(&request("read_file", json!({"note": "key is SUPERSECRETVALUE here"})))
            .await;
        let journal = std::fs::read_to_string(dir.path().join("audit.jsonl")).unwrap();
        assert!(!journal.contains("SUPERSECRETVALUE"));
        assert!(journal.contains("***"));
    }

    // ── External approval protocol ─────────────────────────────────────

    struct SilentChannel;

    #[async_trait]
    impl ApprovalChannel for SilentChannel {
        fn kind(&self) -> ChannelKind {
            ChannelKind::Telegram
        }
        async fn connect(&self) -> EngineResult<()> {
            Ok(())
        }
        async fn disconnect(&self) -> EngineResult<()> {
            Ok(())
        }
        async fn send_approval_request(&self, _n: &ApprovalNotification) -> EngineResult<()> {
            Ok(())
        }
    }

    struct BrokenChannel;

    #[async_trait]
    impl ApprovalChannel for BrokenChannel {
        fn kind(&self) -> ChannelKind {
            ChannelKind::Slack
        }
        async fn connect(&self) -> EngineResult<()> {
            Ok(())
        }
        async fn disconnect(&self) -> EngineResult<()> {
            Ok(())
        }
        async fn send_approval_request(&self, _n: &ApprovalNotification) -> EngineResult<()> {
            Err("transport down".into())
        }
    }

    #[tokio::test]
    async fn test_external_timeout_fails_safe() {
        let dir = tempfile::tempdir().unwrap();
        let guardian = test_guardian(&dir)
            .with_approval_channel(Arc::new(SilentChannel), Duration::from_millis(50));
        let verdict = guardian
            .validate_action(&request("exec_command", json!({"command": "make deploy"})))
            .await;
        match verdict {
            Verdict::Blocked { reason, .. } => assert!(reason.contains("fail-safe")),
            other => panic!("expected fail-safe block, got {:?}", other),
        }
        // Audit reflects the auto_blocked terminal state.
        let alerts = guardian.audit().read_alerts().unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].approval_status, ApprovalStatus::AutoBlocked);
    }

    #[tokio::test]
    async fn test_external_transport_error_fails_safe() {
        let dir = tempfile::tempdir().unwrap();
        let guardian = test_guardian(&dir)
            .with_approval_channel(Arc::new(BrokenChannel), Duration::from_secs(5));
        let verdict = guardian
            .validate_action(&request("exec_command", json!({"command": "make deploy"})))
            .await;
        match verdict {
            Verdict::Blocked { reason, .. } => assert!(reason.contains("fail-safe")),
            other => panic!("expected fail-safe block, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_external_approval_granted() {
        let dir = tempfile::tempdir().unwrap();
        let guardian = Arc::new(
            test_guardian(&dir)
                .with_approval_channel(Arc::new(SilentChannel), Duration::from_secs(5)),
        );
        let req = request("exec_command", json!({"command": "make deploy"}));
        let req_id = req.id.clone();

        let g = guardian.clone();
        let task = tokio::spawn(async move { g.validate_action(&req).await });

        // Let the request register its rendezvous, then respond.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let delivered = guardian.deliver_approval_response(ApprovalResponse {
            request_id: req_id,
            approved: true,
            responded_by: "user:telegram".into(),
            responded_at: Utc::now(),
            reason: None,
        });
        assert!(delivered);

        let verdict = task.await.unwrap();
        assert!(matches!(verdict, Verdict::Approved));
    }

    #[tokio::test]
    async fn test_external_rejection_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let guardian = Arc::new(
            test_guardian(&dir)
                .with_approval_channel(Arc::new(SilentChannel), Duration::from_secs(5)),
        );
        let req = request("exec_command", json!({"command": "make deploy"}));
        let req_id = req.id.clone();

        let g = guardian.clone();
        let task = tokio::spawn(async move { g.validate_action(&req).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        guardian.deliver_approval_response(ApprovalResponse {
            request_id: req_id,
            approved: false,
            responded_by: "user:telegram".into(),
            responded_at: Utc::now(),
            reason: Some("no deploys on friday".into()),
        });

        let verdict = task.await.unwrap();
        match verdict {
            Verdict::Blocked { reason, .. } => {
                assert!(reason.contains("user:telegram"));
                assert!(reason.contains("no deploys on friday"));
            }
            other => panic!("expected block, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_deliver_unknown_id_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let guardian = test_guardian(&dir);
        let delivered = guardian.deliver_approval_response(ApprovalResponse {
            request_id: "never-registered".into(),
            approved: true,
            responded_by: "user".into(),
            responded_at: Utc::now(),
            reason: None,
        });
        assert!(!delivered);
    }
}
