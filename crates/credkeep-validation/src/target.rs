//! What the validator inspects.
//!
//! The validator never trusts the component it checks. It observes it
//! through these narrow traits, implemented here for the credkeep types.

use credkeep_audit::SecurityAuditor;
use credkeep_secrets::{CredentialLifecycleManager, SecretContainer, SecretKind};
use serde_json::Value;

use crate::scope::find;

/// Observed state of a cleanup target.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetSnapshot {
    /// Slot names holding a buffer, expired or not.
    pub occupied: Vec<String>,
    /// Slot names holding an expired buffer that was never erased.
    pub expired_residue: Vec<String>,
    /// Bytes held in live buffers.
    pub live_bytes: usize,
}

/// A component whose cleanup state can be validated.
pub trait CleanupTarget: Send + Sync {
    /// Name used in results.
    fn target_name(&self) -> &str;

    /// Current state, or `None` when the target can no longer be read.
    fn snapshot(&self) -> Option<TargetSnapshot>;
}

/// A place where secret bytes could linger.
pub trait MemorySurface: Send + Sync {
    /// Name used in finding locations.
    fn surface_name(&self) -> &str;

    /// Whether `needle` occurs anywhere on the surface.
    fn contains_bytes(&self, needle: &[u8]) -> bool;
}

/// Memory that can be forced through a reclamation pass.
pub trait ReclaimableMemory: Send + Sync {
    /// Name used in results.
    fn memory_name(&self) -> &str;

    /// Bytes currently held.
    fn live_bytes(&self) -> usize;

    /// Releases whatever can be released and returns the items reclaimed.
    fn reclaim(&self) -> usize;
}

fn container_snapshot(container: &SecretContainer) -> Option<TargetSnapshot> {
    let kinds = container.occupied().ok()?;
    let mut snapshot = TargetSnapshot {
        live_bytes: container.live_secret_bytes(),
        ..TargetSnapshot::default()
    };
    for kind in kinds {
        if container.peek_expires_at(&kind).ok()?.is_none() {
            snapshot.expired_residue.push(kind.to_string());
        }
        snapshot.occupied.push(kind.to_string());
    }
    Some(snapshot)
}

impl CleanupTarget for SecretContainer {
    fn target_name(&self) -> &str {
        "secret_container"
    }

    fn snapshot(&self) -> Option<TargetSnapshot> {
        container_snapshot(self)
    }
}

impl MemorySurface for SecretContainer {
    fn surface_name(&self) -> &str {
        "secret_container"
    }

    fn contains_bytes(&self, needle: &[u8]) -> bool {
        SecretContainer::contains_bytes(self, needle)
    }
}

impl ReclaimableMemory for SecretContainer {
    fn memory_name(&self) -> &str {
        "secret_container"
    }

    fn live_bytes(&self) -> usize {
        self.live_secret_bytes()
    }

    fn reclaim(&self) -> usize {
        self.reap_expired().unwrap_or(0)
    }
}

impl CleanupTarget for CredentialLifecycleManager {
    fn target_name(&self) -> &str {
        "credential_lifecycle_manager"
    }

    fn snapshot(&self) -> Option<TargetSnapshot> {
        if self.is_disposed() {
            return None;
        }
        container_snapshot(self.container())
    }
}

/// Plaintext tokens are only reachable by decrypting, so the manager's
/// surface is what a caller could read back from it.
impl MemorySurface for CredentialLifecycleManager {
    fn surface_name(&self) -> &str {
        "credential_lifecycle_manager"
    }

    fn contains_bytes(&self, needle: &[u8]) -> bool {
        if needle.is_empty() {
            return false;
        }
        let container = self.container();
        if container.contains_bytes(needle) {
            return true;
        }
        let Ok(kinds) = container.occupied() else {
            return false;
        };
        kinds.iter().any(|kind| readable_contains(self, kind, needle))
    }
}

fn readable_contains(manager: &CredentialLifecycleManager, kind: &SecretKind, needle: &[u8]) -> bool {
    let container = manager.container();
    // Expired slots are left for the owner to reap.
    if !matches!(container.peek_expires_at(kind), Ok(Some(_))) {
        return false;
    }
    let Ok(Some(payload)) = container.retrieve_payload(kind) else {
        return false;
    };
    manager
        .cipher()
        .decrypt(&payload)
        .is_ok_and(|plain| plain.contains(needle))
}

impl MemorySurface for SecurityAuditor {
    fn surface_name(&self) -> &str {
        "audit_trail"
    }

    /// Only details carry free text, so they are searched unescaped.
    fn contains_bytes(&self, needle: &[u8]) -> bool {
        if needle.is_empty() {
            return false;
        }
        let Ok(entries) = self.snapshot() else {
            return false;
        };
        entries.iter().any(|entry| {
            entry
                .details
                .iter()
                .any(|(key, value)| find(key.as_bytes(), needle).is_some() || value_contains(value, needle))
        })
    }
}

fn value_contains(value: &Value, needle: &[u8]) -> bool {
    match value {
        Value::String(text) => find(text.as_bytes(), needle).is_some(),
        Value::Number(number) => find(number.to_string().as_bytes(), needle).is_some(),
        Value::Array(items) => items.iter().any(|item| value_contains(item, needle)),
        Value::Object(map) => map
            .iter()
            .any(|(key, item)| find(key.as_bytes(), needle).is_some() || value_contains(item, needle)),
        Value::Bool(_) | Value::Null => false,
    }
}
