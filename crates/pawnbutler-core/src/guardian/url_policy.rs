// Pawnbutler Core — URL Policy
// Domain allowlist + regex blocklist for outbound web access.
// The blocklist always wins: a blocked pattern match denies the URL even
// when its host is on the allowlist.

use log::warn;
use parking_lot::RwLock;
use regex::RegexBuilder;

use crate::atoms::error::EngineResult;

// ── Types ──────────────────────────────────────────────────────────────

/// Outcome of a policy check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlDecision {
    pub allowed: bool,
    pub reason: String,
}

impl UrlDecision {
    fn allow(reason: impl Into<String>) -> Self {
        UrlDecision { allowed: true, reason: reason.into() }
    }

    fn deny(reason: impl Into<String>) -> Self {
        UrlDecision { allowed: false, reason: reason.into() }
    }
}

/// A compiled blocklist entry; the original pattern is kept for listing.
struct BlockedPattern {
    pattern: String,
    regex: regex::Regex,
}

// ── UrlPolicy ──────────────────────────────────────────────────────────

/// Allowlist of registered domains plus case-insensitive regex blocklist.
pub struct UrlPolicy {
    allowed_domains: RwLock<Vec<String>>,
    blocked_patterns: RwLock<Vec<BlockedPattern>>,
}

impl Default for UrlPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl UrlPolicy {
    pub fn new() -> Self {
        UrlPolicy {
            allowed_domains: RwLock::new(Vec::new()),
            blocked_patterns: RwLock::new(Vec::new()),
        }
    }

    /// Build a policy from config lists. Invalid block patterns are
    /// rejected; a pattern that failed to compile would leave a hole in
    /// the blocklist.
    pub fn from_lists(allow: &[String], block: &[String]) -> EngineResult<Self> {
        let policy = UrlPolicy::new();
        for domain in allow {
            policy.add_allowed(domain);
        }
        for pattern in block {
            policy.add_blocked(pattern)?;
        }
        Ok(policy)
    }

    /// Register an allowed domain (stored lowercased, exact-or-subdomain
    /// matched at check time).
    pub fn add_allowed(&self, domain: &str) {
        let domain = domain.trim().trim_start_matches('.').to_lowercase();
        if domain.is_empty() {
            return;
        }
        let mut allowed = self.allowed_domains.write();
        if !allowed.contains(&domain) {
            allowed.push(domain);
        }
    }

    /// Register a blocked regex pattern, compiled case-insensitively.
    pub fn add_blocked(&self, pattern: &str) -> EngineResult<()> {
        let regex = RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .map_err(|e| format!("Invalid blocklist pattern '{}': {}", pattern, e))?;
        self.blocked_patterns.write().push(BlockedPattern {
            pattern: pattern.to_string(),
            regex,
        });
        Ok(())
    }

    pub fn list_allowed(&self) -> Vec<String> {
        self.allowed_domains.read().clone()
    }

    pub fn list_blocked(&self) -> Vec<String> {
        self.blocked_patterns.read().iter().map(|p| p.pattern.clone()).collect()
    }

    /// Decide whether `url` may be fetched.
    ///
    /// Order matters:
    ///   1. Unparsable URL → deny ("invalid URL").
    ///   2. Any blocked pattern matching hostname OR full URL → deny.
    ///   3. Hostname equal to, or a subdomain of, an allowed domain → allow.
    ///   4. Otherwise → deny.
    pub fn check(&self, url: &str) -> UrlDecision {
        let parsed = match url::Url::parse(url) {
            Ok(p) => p,
            Err(e) => {
                warn!("[urlpolicy] invalid URL '{}': {}", url, e);
                return UrlDecision::deny(format!("invalid URL: {}", e));
            }
        };
        let host = match parsed.host_str() {
            Some(h) => h.to_lowercase(),
            None => return UrlDecision::deny("invalid URL: no host"),
        };

        // Blacklist has priority over any allowlist membership.
        for blocked in self.blocked_patterns.read().iter() {
            if blocked.regex.is_match(&host) || blocked.regex.is_match(url) {
                return UrlDecision::deny(format!(
                    "URL matches blocked pattern '{}'",
                    blocked.pattern
                ));
            }
        }

        for domain in self.allowed_domains.read().iter() {
            if host == *domain || host.ends_with(&format!(".{}", domain)) {
                return UrlDecision::allow(format!("domain '{}' is allowed", domain));
            }
        }

        UrlDecision::deny(format!("domain '{}' is not in the allowlist", host))
    }

    /// Convenience wrapper for callers that only need the boolean.
    pub fn is_allowed(&self, url: &str) -> bool {
        self.check(url).allowed
    }
}

// ── Tests ──────────────────────────────────────────────────────────────
