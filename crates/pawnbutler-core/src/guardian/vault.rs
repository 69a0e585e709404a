// Pawnbutler Core — Secret Vault
// In-memory keyed secret store with `$VAULT{key}` reference tokens and
// output masking. Agents only ever see the reference form; the guardian
// masks stored values out of every string that leaves the engine.

use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use log::{info, warn};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::atoms::error::EngineResult;

/// Replacement text for masked secrets.
const MASK: &str = "***";

// ── Types ──────────────────────────────────────────────────────────────

/// One stored secret. The value is wiped from memory on drop.
#[derive(Debug, Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct VaultEntry {
    pub key: String,
    pub value: String,
    #[zeroize(skip)]
    pub added_at: DateTime<Utc>,
}

// ── SecretVault ────────────────────────────────────────────────────────

/// Keyed secret store. Shared across the engine behind `Arc`; interior
/// locking makes every method callable from any task.
pub struct SecretVault {
    entries: RwLock<HashMap<String, VaultEntry>>,
}

impl Default for SecretVault {
    fn default() -> Self {
        Self::new()
    }
}

impl SecretVault {
    pub fn new() -> Self {
        SecretVault { entries: RwLock::new(HashMap::new()) }
    }

    /// Store a secret, replacing any prior entry under the same key.
    /// Returns the reference literal (`$VAULT{key}`) that agents should
    /// carry instead of the raw value.
    pub fn store(&self, key: &str, value: &str) -> String {
        let entry = VaultEntry {
            key: key.to_string(),
            value: value.to_string(),
            added_at: Utc::now(),
        };
        self.entries.write().insert(key.to_string(), entry);
        Self::reference(key)
    }

    /// The reference literal for a key.
    pub fn reference(key: &str) -> String {
        format!("$VAULT{{{}}}", key)
    }

    /// Resolve a reference of the exact form `$VAULT{key}` to the stored
    /// value. A missing key is an error, never an empty substitution.
    pub fn resolve(&self, reference: &str) -> EngineResult<String> {
        let key = reference
            .strip_prefix("$VAULT{")
            .and_then(|rest| rest.strip_suffix('}'))
            .ok_or_else(|| format!("Not a vault reference: {}", reference))?;
        match self.entries.read().get(key) {
            Some(entry) => Ok(entry.value.clone()),
            None => Err(format!("Vault key not found: {}", key).into()),
        }
    }

    /// Whether a key is present (value is not revealed).
    pub fn contains(&self, key: &str) -> bool {
        self.entries.read().contains_key(key)
    }

    /// All stored keys, for status surfaces. Values are never listed.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Replace every occurrence of every stored value with `***`.
    ///
    /// Guarantees: masks all occurrences of all values regardless of
    /// length, is idempotent (`mask(mask(x)) == mask(x)`), and never
    /// fails; a text with no secrets passes through unchanged.
    ///
    /// Passes repeat until no value matches, so a replacement can never
    /// expose a different stored value spanning the inserted `***`. The
    /// loop terminates: every replaced value carries at least one
    /// non-`*` character, and each pass removes some. Empty values and
    /// values made solely of `*` are unmaskable (they are
    /// indistinguishable from the mask itself) and are skipped.
    pub fn mask(&self, text: &str) -> String {
        let entries = self.entries.read();
        let mut out = text.to_string();
        loop {
            let mut changed = false;
            for entry in entries.values() {
                if entry.value.is_empty() || entry.value.bytes().all(|b| b == b'*') {
                    continue;
                }
                if out.contains(&entry.value) {
                    out = out.replace(&entry.value, MASK);
                    changed = true;
                }
            }
            if !changed {
                return out;
            }
        }
    }

    /// Load secrets from the process environment. Every variable whose name
    /// starts with `prefix` is ingested; the remainder of the name,
    /// lowercased, becomes the vault key.
    ///
    /// `PAWNBUTLER_SECRET_GITHUB_TOKEN=x` → key `github_token`.
    pub fn load_from_env(&self, prefix: &str) -> usize {
        let mut loaded = 0;
        for (name, value) in std::env::vars() {
            if let Some(rest) = name.strip_prefix(prefix) {
                if rest.is_empty() || value.is_empty() {
                    continue;
                }
                self.store(&rest.to_lowercase(), &value);
                loaded += 1;
            }
        }
        if loaded > 0 {
            info!("[vault] Loaded {} secret(s) from environment", loaded);
        }
        loaded
    }

    // ── Persistence ────────────────────────────────────────────────────

    /// Write all entries to `path` as JSON. Atomic: writes a temp file in
    /// the same directory, then renames over the target.
    pub fn save_to(&self, path: &Path) -> EngineResult<()> {
        let entries = self.entries.read();
        let list: Vec<&VaultEntry> = entries.values().collect();
        let json = serde_json::to_string_pretty(&list)?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Load entries from `path`, merging over anything already stored.
    /// A missing file is not an error; the vault just starts empty.
    pub fn load_from(&self, path: &Path) -> EngineResult<usize> {
        if !path.exists() {
            return Ok(0);
        }
        let json = std::fs::read_to_string(path)?;
        let list: Vec<VaultEntry> = match serde_json::from_str(&json) {
            Ok(l) => l,
            Err(e) => {
                warn!("[vault] Store file at {:?} is unreadable: {}", path, e);
                return Err(e.into());
            }
        };
        let count = list.len();
        let mut entries = self.entries.write();
        for entry in list {
            entries.insert(entry.key.clone(), entry);
        }
        Ok(count)
    }
}

// ── Tests ──────────────────────────────────────────────────────────────
