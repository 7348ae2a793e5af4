//! Slot storage for secrets with expiry.
//!
//! Each [`SecretKind`] gets one slot guarded by its own mutex; the slot map
//! is read-mostly and only write-locked when a new kind first appears.
//! Expiry events are published after every lock has been released.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use chrono::{DateTime, Utc};
use credkeep_config::CredentialConfig;
use credkeep_runtime::{EventBus, SubscriptionId};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::cipher::{ENVELOPE_OVERHEAD, EncryptedPayload};
use crate::error::{Result, SecretsError};
use crate::types::{SecretBuffer, SecretKind};

const COMPONENT: &str = "secret container";

/// Container tunables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerOptions {
    /// Largest accepted payload.
    pub max_payload_bytes: usize,
}

impl Default for ContainerOptions {
    fn default() -> Self {
        Self {
            max_payload_bytes: 1024 * 1024 + ENVELOPE_OVERHEAD,
        }
    }
}

impl From<&CredentialConfig> for ContainerOptions {
    fn from(config: &CredentialConfig) -> Self {
        Self {
            max_payload_bytes: config.max_secret_bytes.saturating_add(ENVELOPE_OVERHEAD),
        }
    }
}

/// Published once when a stored secret is found past its expiry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretExpired {
    /// Slot that expired.
    pub kind: SecretKind,
    /// Recorded expiry.
    pub expired_at: DateTime<Utc>,
    /// When the expiry was noticed.
    pub detected_at: DateTime<Utc>,
}

/// A stored secret.
struct StoredSecret {
    payload: SecretBuffer,
    key_version: u32,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl StoredSecret {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[derive(Default)]
struct Slot {
    secret: Mutex<Option<StoredSecret>>,
}

/// Outcome of inspecting one slot.
enum Lookup<T> {
    Absent,
    Live(T),
    Expired(SecretExpired),
}

/// In-memory secret storage.
///
/// Secrets are replaced wholesale by [`store`](Self::store) and destroyed
/// by [`clear`](Self::clear), by expiry detection, or by
/// [`dispose`](Self::dispose). Every destroyed buffer is zeroized.
pub struct SecretContainer {
    options: ContainerOptions,
    slots: RwLock<HashMap<SecretKind, Arc<Slot>>>,
    live_bytes: AtomicUsize,
    expired: EventBus<SecretExpired>,
    disposed: AtomicBool,
}

impl SecretContainer {
    /// Creates an empty container with the fixed slots pre-allocated.
    #[must_use]
    pub fn new(options: ContainerOptions) -> Self {
        let slots = [SecretKind::Access, SecretKind::Refresh, SecretKind::UserId]
            .into_iter()
            .map(|kind| (kind, Arc::new(Slot::default())))
            .collect();
        Self {
            options,
            slots: RwLock::new(slots),
            live_bytes: AtomicUsize::new(0),
            expired: EventBus::new("secret-expired"),
            disposed: AtomicBool::new(false),
        }
    }

    /// Creates a container from the shared configuration.
    #[must_use]
    pub fn from_config(config: &CredentialConfig) -> Self {
        Self::new(ContainerOptions::from(config))
    }

    /// Subscribes to expiry notifications.
    pub fn subscribe_expired<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&SecretExpired) + Send + Sync + 'static,
    {
        self.expired.subscribe(handler)
    }

    /// Removes an expiry subscription.
    pub fn unsubscribe_expired(&self, id: SubscriptionId) -> bool {
        self.expired.unsubscribe(id)
    }

    /// Stores `raw` in the slot for `kind`, replacing any existing secret.
    ///
    /// A zero `ttl` is accepted and yields a secret that is already expired.
    ///
    /// # Errors
    ///
    /// Returns [`SecretsError::ArgumentInvalid`] for an empty or oversized
    /// secret or a negative `ttl`, and [`SecretsError::ResourceDisposed`]
    /// after disposal.
    pub fn store(&self, kind: SecretKind, raw: &[u8], ttl: chrono::Duration) -> Result<()> {
        self.store_payload(
            kind,
            EncryptedPayload {
                key_version: 0,
                bytes: SecretBuffer::from_slice(raw),
            },
            ttl,
        )
    }

    /// Stores an already-sealed payload, keeping its key version.
    ///
    /// # Errors
    ///
    /// See [`store`](Self::store).
    pub fn store_payload(
        &self,
        kind: SecretKind,
        payload: EncryptedPayload,
        ttl: chrono::Duration,
    ) -> Result<()> {
        self.ensure_active()?;
        if payload.bytes.is_empty() {
            return Err(SecretsError::invalid("secret cannot be empty"));
        }
        if payload.bytes.len() > self.options.max_payload_bytes {
            return Err(SecretsError::invalid(format!(
                "secret exceeds the {} byte limit",
                self.options.max_payload_bytes
            )));
        }
        if ttl < chrono::Duration::zero() {
            return Err(SecretsError::invalid("ttl cannot be negative"));
        }

        let now = Utc::now();
        let expires_at = now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC);
        let len = payload.bytes.len();
        let stored = StoredSecret {
            payload: payload.bytes,
            key_version: payload.key_version,
            created_at: now,
            expires_at,
        };

        let slot = self.slot_or_insert(&kind);
        self.live_bytes.fetch_add(len, Ordering::AcqRel);
        let replaced = slot.secret.lock().replace(stored);
        if let Some(old) = replaced {
            self.release(old);
        }

        // Lost a race with dispose: do not leave the secret behind.
        if self.is_disposed() {
            self.clear_slot(&slot);
            return Err(SecretsError::ResourceDisposed {
                component: COMPONENT,
            });
        }

        debug!(kind = %kind, bytes = len, %expires_at, "secret stored");
        Ok(())
    }

    /// Returns a copy of the secret if it is present and not expired.
    ///
    /// # Errors
    ///
    /// Returns [`SecretsError::ResourceDisposed`] after disposal.
    pub fn retrieve(&self, kind: &SecretKind) -> Result<Option<SecretBuffer>> {
        Ok(self.retrieve_payload(kind)?.map(|p| p.bytes))
    }

    /// Returns a copy of the stored payload with its key version.
    ///
    /// # Errors
    ///
    /// Returns [`SecretsError::ResourceDisposed`] after disposal.
    pub fn retrieve_payload(&self, kind: &SecretKind) -> Result<Option<EncryptedPayload>> {
        self.ensure_active()?;
        Ok(self.inspect(kind, |s| EncryptedPayload {
            key_version: s.key_version,
            bytes: s.payload.clone(),
        }))
    }

    /// Whether a non-expired secret is held for `kind`.
    ///
    /// # Errors
    ///
    /// Returns [`SecretsError::ResourceDisposed`] after disposal.
    pub fn contains(&self, kind: &SecretKind) -> Result<bool> {
        self.ensure_active()?;
        Ok(self.inspect(kind, |_| ()).is_some())
    }

    /// Expiry of the secret held for `kind`, if any.
    ///
    /// # Errors
    ///
    /// Returns [`SecretsError::ResourceDisposed`] after disposal.
    pub fn expires_at(&self, kind: &SecretKind) -> Result<Option<DateTime<Utc>>> {
        self.ensure_active()?;
        Ok(self.inspect(kind, |s| s.expires_at))
    }

    /// Expiry of a live secret, read without erasing an expired one.
    ///
    /// # Errors
    ///
    /// Returns [`SecretsError::ResourceDisposed`] after disposal.
    pub fn peek_expires_at(&self, kind: &SecretKind) -> Result<Option<DateTime<Utc>>> {
        self.ensure_active()?;
        let Some(slot) = self.slot(kind) else {
            return Ok(None);
        };
        let now = Utc::now();
        let guard = slot.secret.lock();
        Ok(guard
            .as_ref()
            .filter(|s| !s.is_expired(now))
            .map(|s| s.expires_at))
    }

    /// When the secret held for `kind` was stored.
    ///
    /// # Errors
    ///
    /// Returns [`SecretsError::ResourceDisposed`] after disposal.
    pub fn stored_at(&self, kind: &SecretKind) -> Result<Option<DateTime<Utc>>> {
        self.ensure_active()?;
        Ok(self.inspect(kind, |s| s.created_at))
    }

    /// Whether the secret is absent or expires within `window`.
    ///
    /// # Errors
    ///
    /// Returns [`SecretsError::ResourceDisposed`] after disposal.
    pub fn will_expire_within(&self, kind: &SecretKind, window: chrono::Duration) -> Result<bool> {
        Ok(match self.expires_at(kind)? {
            None => true,
            Some(expires_at) => Utc::now()
                .checked_add_signed(window)
                .is_none_or(|limit| limit >= expires_at),
        })
    }

    /// Erases the secret held for `kind`.
    ///
    /// Returns whether a buffer was present, expired or not.
    ///
    /// # Errors
    ///
    /// Returns [`SecretsError::ResourceDisposed`] after disposal.
    pub fn clear(&self, kind: &SecretKind) -> Result<bool> {
        self.ensure_active()?;
        let Some(slot) = self.slot(kind) else {
            return Ok(false);
        };
        let cleared = self.clear_slot(&slot);
        if cleared {
            debug!(kind = %kind, "secret cleared");
        }
        Ok(cleared)
    }

    /// Erases every slot and returns the number of buffers erased.
    ///
    /// # Errors
    ///
    /// Returns [`SecretsError::ResourceDisposed`] after disposal.
    pub fn clear_all(&self) -> Result<usize> {
        self.ensure_active()?;
        Ok(self.erase_everything())
    }

    /// Erases every expired secret, publishing one event for each.
    ///
    /// # Errors
    ///
    /// Returns [`SecretsError::ResourceDisposed`] after disposal.
    pub fn reap_expired(&self) -> Result<usize> {
        self.ensure_active()?;
        let now = Utc::now();
        let mut events = Vec::new();
        {
            let slots = self.slots.read();
            for (kind, slot) in slots.iter() {
                let mut guard = slot.secret.lock();
                if guard.as_ref().is_some_and(|s| s.is_expired(now)) {
                    if let Some(stored) = guard.take() {
                        events.push(SecretExpired {
                            kind: kind.clone(),
                            expired_at: stored.expires_at,
                            detected_at: now,
                        });
                        self.release(stored);
                    }
                }
            }
        }
        for event in &events {
            self.expired.publish(event);
        }
        if !events.is_empty() {
            debug!(reaped = events.len(), "expired secrets reaped");
        }
        Ok(events.len())
    }

    /// Kinds currently holding a buffer, expired or not.
    ///
    /// # Errors
    ///
    /// Returns [`SecretsError::ResourceDisposed`] after disposal.
    pub fn occupied(&self) -> Result<Vec<SecretKind>> {
        self.ensure_active()?;
        let slots = self.slots.read();
        let mut kinds: Vec<SecretKind> = slots
            .iter()
            .filter(|(_, slot)| slot.secret.lock().is_some())
            .map(|(kind, _)| kind.clone())
            .collect();
        kinds.sort();
        Ok(kinds)
    }

    /// Total bytes held in live buffers.
    #[must_use]
    pub fn live_secret_bytes(&self) -> usize {
        self.live_bytes.load(Ordering::Acquire)
    }

    /// Whether any held buffer contains `needle`.
    ///
    /// Returns `false` after disposal since nothing is held.
    #[must_use]
    pub fn contains_bytes(&self, needle: &[u8]) -> bool {
        let slots = self.slots.read();
        slots.values().any(|slot| {
            slot.secret
                .lock()
                .as_ref()
                .is_some_and(|s| s.payload.contains(needle))
        })
    }

    /// Whether [`dispose`](Self::dispose) has run.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Erases everything and rejects every later call. Idempotent.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let erased = self.erase_everything();
        self.expired.clear();
        info!(erased, "secret container disposed");
    }

    fn ensure_active(&self) -> Result<()> {
        if self.is_disposed() {
            Err(SecretsError::ResourceDisposed {
                component: COMPONENT,
            })
        } else {
            Ok(())
        }
    }

    fn slot(&self, kind: &SecretKind) -> Option<Arc<Slot>> {
        self.slots.read().get(kind).cloned()
    }

    fn slot_or_insert(&self, kind: &SecretKind) -> Arc<Slot> {
        if let Some(slot) = self.slot(kind) {
            return slot;
        }
        let mut slots = self.slots.write();
        Arc::clone(slots.entry(kind.clone()).or_default())
    }

    /// Reads a live secret; an expired one is erased and reported once.
    fn inspect<T>(&self, kind: &SecretKind, read: impl FnOnce(&StoredSecret) -> T) -> Option<T> {
        let slot = self.slot(kind)?;
        let lookup = {
            let mut guard = slot.secret.lock();
            let now = Utc::now();
            match guard.as_ref().map(|s| s.is_expired(now)) {
                None => Lookup::Absent,
                Some(false) => guard.as_ref().map_or(Lookup::Absent, |s| Lookup::Live(read(s))),
                Some(true) => guard.take().map_or(Lookup::Absent, |stored| {
                    let event = SecretExpired {
                        kind: kind.clone(),
                        expired_at: stored.expires_at,
                        detected_at: now,
                    };
                    self.release(stored);
                    Lookup::Expired(event)
                }),
            }
        };

        match lookup {
            Lookup::Live(value) => Some(value),
            Lookup::Absent => None,
            Lookup::Expired(event) => {
                debug!(kind = %event.kind, "secret expired");
                self.expired.publish(&event);
                None
            }
        }
    }

    fn clear_slot(&self, slot: &Slot) -> bool {
        let taken = slot.secret.lock().take();
        match taken {
            Some(stored) => {
                self.release(stored);
                true
            }
            None => false,
        }
    }

    /// Clears every slot. Does not allocate.
    fn erase_everything(&self) -> usize {
        let slots = self.slots.read();
        slots.values().filter(|slot| self.clear_slot(slot)).count()
    }

    fn release(&self, mut stored: StoredSecret) {
        let len = stored.payload.len();
        stored.payload.wipe();
        self.live_bytes.fetch_sub(len, Ordering::AcqRel);
    }
}

impl Default for SecretContainer {
    fn default() -> Self {
        Self::new(ContainerOptions::default())
    }
}

impl std::fmt::Debug for SecretContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretContainer")
            .field("slots", &self.slots.read().len())
            .field("live_bytes", &self.live_secret_bytes())
            .field("disposed", &self.is_disposed())
            .finish_non_exhaustive()
    }
}
