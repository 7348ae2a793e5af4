//! The credential lifecycle manager.
//!
//! Front door for callers that hold tokens: encrypts on store, decrypts on
//! retrieve, audits every operation, and runs the background refresh,
//! rotation and maintenance tasks.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use credkeep_audit::{AuditOutcome, AuditRecord, AuditEventType, SecurityAuditor, Severity};
use credkeep_config::CredentialConfig;
use credkeep_runtime::{EventBus, ScheduledTask, SubscriptionId, TickControl};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::cipher::{EncryptedPayload, KeyRotated, KeyedCipher};
use crate::container::{SecretContainer, SecretExpired};
use crate::error::{Result, SecretsError};
use crate::events::{SecurityEvent, SecurityEventKind, TokenRefreshRequested};
use crate::types::{CleanupTriggers, SecretKind};

const COMPONENT: &str = "credential lifecycle manager";

/// Upper bound on how often the rotation task checks whether rotation is due.
const ROTATION_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Manager tunables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifecycleOptions {
    /// How often to check for expiring tokens; `None` disables auto refresh.
    pub refresh_interval: Option<Duration>,
    /// Tokens expiring within this window trigger a refresh request.
    pub refresh_threshold: Duration,
    /// How often expired secrets are reaped and the idle timeout checked.
    pub maintenance_interval: Duration,
    /// Automatic erase triggers.
    pub triggers: CleanupTriggers,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            refresh_interval: Some(Duration::from_secs(60)),
            refresh_threshold: Duration::from_secs(5 * 60),
            maintenance_interval: Duration::from_secs(30),
            triggers: CleanupTriggers::default(),
        }
    }
}

impl From<&CredentialConfig> for LifecycleOptions {
    fn from(config: &CredentialConfig) -> Self {
        let triggers = CleanupTriggers::from(config);
        let default_maintenance = Self::default().maintenance_interval;
        let maintenance_interval = triggers
            .idle_timeout
            .map_or(default_maintenance, |idle| (idle / 2).min(default_maintenance));
        Self {
            refresh_interval: config.token_refresh_interval(),
            refresh_threshold: config.token_refresh_threshold(),
            maintenance_interval,
            triggers,
        }
    }
}

/// Point-in-time view of the manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityStatus {
    /// Whether a live access token is held.
    pub authenticated: bool,
    /// Expiry of the access token.
    pub access_token_expires_at: Option<DateTime<Utc>>,
    /// Whether a live refresh token is held.
    pub refresh_token_present: bool,
    /// Slots holding a buffer, expired or not.
    pub stored_secrets: usize,
    /// Bytes held in live buffers.
    pub live_secret_bytes: usize,
    /// Whether payloads are encrypted.
    pub encryption_enabled: bool,
    /// Current key version.
    pub key_version: u32,
    /// Last key rotation.
    pub last_key_rotation: DateTime<Utc>,
    /// Next scheduled key rotation.
    pub next_key_rotation: Option<DateTime<Utc>>,
    /// Running background tasks.
    pub background_tasks: usize,
}

/// State shared with the background tasks.
struct Shared {
    options: LifecycleOptions,
    container: Arc<SecretContainer>,
    cipher: Arc<KeyedCipher>,
    auditor: Arc<SecurityAuditor>,
    security: Arc<EventBus<SecurityEvent>>,
    refresh: EventBus<TokenRefreshRequested>,
    rotated: EventBus<KeyRotated>,
    last_activity: Mutex<Instant>,
    disposed: AtomicBool,
}

fn decode_utf8(cipher: &KeyedCipher, payload: &EncryptedPayload) -> Result<Zeroizing<String>> {
    cipher.decrypt(payload).and_then(|plain| {
        plain.expose(|bytes| {
            std::str::from_utf8(bytes)
                .map(|s| Zeroizing::new(s.to_owned()))
                .map_err(|_| SecretsError::EncryptionError {
                    reason: "stored token is not valid UTF-8".to_string(),
                })
        })
    })
}

impl Shared {
    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    fn rotate(&self) -> KeyRotated {
        let rotated = self.cipher.rotate_keys();
        self.rotated.publish(&rotated);
        self.security
            .publish(&SecurityEvent::now(SecurityEventKind::KeyRotation, None));
        record(
            self.auditor
                .log_key_rotation(rotated.version, rotated.next_rotation),
        );
        rotated
    }

    fn clear_all(&self, scope: &str) -> Result<usize> {
        match self.container.clear_all() {
            Ok(erased) => {
                self.security.publish(&SecurityEvent::now(
                    SecurityEventKind::SecurityStateCleared,
                    None,
                ));
                record(
                    self.auditor
                        .log_cleanup_operation(scope, erased, AuditOutcome::Success),
                );
                info!(scope, erased, "security state cleared");
                Ok(erased)
            }
            Err(e) => {
                record(
                    self.auditor
                        .log_cleanup_operation(scope, 0, AuditOutcome::Failure),
                );
                Err(e)
            }
        }
    }

    fn refresh_tick(&self) -> TickControl {
        if self.disposed.load(Ordering::Acquire) {
            return TickControl::Stop;
        }
        let kind = SecretKind::Access;
        let threshold = chrono::Duration::from_std(self.options.refresh_threshold)
            .unwrap_or(chrono::Duration::MAX);
        // Peek first: the expiry check below transitions an expired slot.
        let Ok(expires_at) = self.container.peek_expires_at(&kind) else {
            return TickControl::Stop;
        };
        let Ok(due) = self.container.will_expire_within(&kind, threshold) else {
            return TickControl::Stop;
        };
        if due {
            debug!(kind = %kind, ?expires_at, "token refresh requested");
            self.refresh.publish(&TokenRefreshRequested {
                kind,
                expires_at,
                requested_at: Utc::now(),
            });
        }
        TickControl::Continue
    }

    fn rotation_tick(&self) -> TickControl {
        if self.disposed.load(Ordering::Acquire) {
            return TickControl::Stop;
        }
        if self.cipher.rotation_due() {
            self.rotate();
        }
        TickControl::Continue
    }

    fn maintenance_tick(&self) -> TickControl {
        if self.disposed.load(Ordering::Acquire) {
            return TickControl::Stop;
        }
        if let Err(e) = self.container.reap_expired() {
            warn!(error = %e, "reaping expired secrets failed");
            return TickControl::Stop;
        }

        if let Some(idle) = self.options.triggers.idle_timeout {
            let idle_for = self.last_activity.lock().elapsed();
            if idle_for >= idle && self.container.live_secret_bytes() > 0 {
                info!(?idle_for, "idle timeout reached");
                if self.clear_all("idle_timeout").is_err() {
                    return TickControl::Stop;
                }
                self.touch();
            }
        }
        TickControl::Continue
    }
}

/// Logs audit failures; auditing never fails the audited operation.
fn record<T>(result: credkeep_audit::Result<T>) {
    if let Err(e) = result {
        warn!(error = %e, "audit entry was not recorded");
    }
}

/// Manages stored credentials from store to erase.
///
/// Components are injected so callers (and validators) can share them.
pub struct CredentialLifecycleManager {
    shared: Arc<Shared>,
    tasks: Mutex<Vec<ScheduledTask>>,
    expiry_subscription: SubscriptionId,
}

impl CredentialLifecycleManager {
    /// Creates a manager over existing components.
    #[must_use]
    pub fn new(
        options: LifecycleOptions,
        container: Arc<SecretContainer>,
        cipher: Arc<KeyedCipher>,
        auditor: Arc<SecurityAuditor>,
    ) -> Self {
        let security = Arc::new(EventBus::new("security"));

        let expiry_subscription = {
            let security = Arc::clone(&security);
            let auditor = Arc::clone(&auditor);
            container.subscribe_expired(move |expired: &SecretExpired| {
                security.publish(&SecurityEvent::now(
                    SecurityEventKind::SecretExpired,
                    Some(expired.kind.clone()),
                ));
                record(
                    auditor.log_event(
                        AuditRecord::new(AuditEventType::SecretExpired)
                            .severity(Severity::Low)
                            .detail("kind", expired.kind.as_str())
                            .detail("expired_at", expired.expired_at.to_rfc3339()),
                    ),
                );
            })
        };

        Self {
            shared: Arc::new(Shared {
                options,
                container,
                cipher,
                auditor,
                security,
                refresh: EventBus::new("token-refresh"),
                rotated: EventBus::new("key-rotated"),
                last_activity: Mutex::new(Instant::now()),
                disposed: AtomicBool::new(false),
            }),
            tasks: Mutex::new(Vec::new()),
            expiry_subscription,
        }
    }

    /// Builds the container and cipher from the shared configuration.
    #[must_use]
    pub fn from_config(config: &CredentialConfig, auditor: Arc<SecurityAuditor>) -> Self {
        Self::new(
            LifecycleOptions::from(config),
            Arc::new(SecretContainer::from_config(config)),
            Arc::new(KeyedCipher::from_config(config)),
            auditor,
        )
    }

    /// The underlying container.
    #[must_use]
    pub fn container(&self) -> &Arc<SecretContainer> {
        &self.shared.container
    }

    /// The cipher.
    #[must_use]
    pub fn cipher(&self) -> &Arc<KeyedCipher> {
        &self.shared.cipher
    }

    /// The auditor.
    #[must_use]
    pub fn auditor(&self) -> &Arc<SecurityAuditor> {
        &self.shared.auditor
    }

    /// Manager options.
    #[must_use]
    pub fn options(&self) -> &LifecycleOptions {
        &self.shared.options
    }

    /// Subscribes to security events.
    pub fn subscribe_security_events<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&SecurityEvent) + Send + Sync + 'static,
    {
        self.shared.security.subscribe(handler)
    }

    /// Removes a security event subscription.
    pub fn unsubscribe_security_events(&self, id: SubscriptionId) -> bool {
        self.shared.security.unsubscribe(id)
    }

    /// Subscribes to refresh requests.
    pub fn subscribe_token_refresh<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&TokenRefreshRequested) + Send + Sync + 'static,
    {
        self.shared.refresh.subscribe(handler)
    }

    /// Subscribes to key rotations.
    pub fn subscribe_key_rotated<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&KeyRotated) + Send + Sync + 'static,
    {
        self.shared.rotated.subscribe(handler)
    }

    /// Encrypts and stores a token.
    ///
    /// # Errors
    ///
    /// Returns [`SecretsError::ArgumentInvalid`] for an empty or oversized
    /// value or a negative `ttl`, and [`SecretsError::ResourceDisposed`]
    /// after teardown.
    pub fn store_token_securely(
        &self,
        value: &str,
        ttl: chrono::Duration,
        kind: SecretKind,
    ) -> Result<()> {
        self.ensure_active()?;
        let result = if value.is_empty() {
            Err(SecretsError::invalid("token cannot be empty"))
        } else {
            self.shared
                .cipher
                .encrypt(value.as_bytes())
                .and_then(|payload| self.shared.container.store_payload(kind.clone(), payload, ttl))
        };

        record(self.shared.auditor.log_token_operation(
            "store",
            kind.as_str(),
            AuditOutcome::from_success(result.is_ok()),
        ));
        result?;

        self.shared.touch();
        self.shared
            .security
            .publish(&SecurityEvent::now(SecurityEventKind::TokenStored, Some(kind)));
        Ok(())
    }

    /// Retrieves and decrypts a token.
    ///
    /// Returns `None` when the token is absent or expired.
    ///
    /// # Errors
    ///
    /// Returns [`SecretsError::ResourceDisposed`] after teardown,
    /// [`SecretsError::KeyVersionUnavailable`] if the sealing key was
    /// evicted, or [`SecretsError::EncryptionError`] if decryption fails.
    pub fn retrieve_token_securely(&self, kind: &SecretKind) -> Result<Option<Zeroizing<String>>> {
        self.ensure_active()?;
        let Some(payload) = self.shared.container.retrieve_payload(kind)? else {
            return Ok(None);
        };

        let result = decode_utf8(&self.shared.cipher, &payload);

        record(self.shared.auditor.log_token_operation(
            "retrieve",
            kind.as_str(),
            AuditOutcome::from_success(result.is_ok()),
        ));
        let token = result?;

        self.shared.touch();
        self.shared.security.publish(&SecurityEvent::now(
            SecurityEventKind::TokenRetrieved,
            Some(kind.clone()),
        ));
        Ok(Some(token))
    }

    /// Records the authenticated user's id.
    ///
    /// # Errors
    ///
    /// See [`store_token_securely`](Self::store_token_securely).
    pub fn bind_user_id(&self, user_id: &str, ttl: chrono::Duration) -> Result<()> {
        self.store_token_securely(user_id, ttl, SecretKind::UserId)
    }

    /// Whether a live access token is held.
    ///
    /// # Errors
    ///
    /// Returns [`SecretsError::ResourceDisposed`] after teardown.
    pub fn is_authenticated(&self) -> Result<bool> {
        self.ensure_active()?;
        self.shared.container.contains(&SecretKind::Access)
    }

    /// The bound user id, reported only while authenticated.
    ///
    /// A status read: it is not audited and does not count as activity for
    /// the idle timeout.
    ///
    /// # Errors
    ///
    /// Returns [`SecretsError::ResourceDisposed`] after teardown, or a
    /// decryption error if the stored id cannot be read.
    pub fn current_user_id(&self) -> Result<Option<Zeroizing<String>>> {
        if !self.is_authenticated()? {
            return Ok(None);
        }
        let container = &self.shared.container;
        if container.peek_expires_at(&SecretKind::UserId)?.is_none() {
            return Ok(None);
        }
        let Some(payload) = container.retrieve_payload(&SecretKind::UserId)? else {
            return Ok(None);
        };
        decode_utf8(&self.shared.cipher, &payload).map(Some)
    }

    /// Rotates the encryption key now.
    ///
    /// # Errors
    ///
    /// Returns [`SecretsError::ResourceDisposed`] after teardown.
    pub fn rotate_encryption_key(&self) -> Result<KeyRotated> {
        self.ensure_active()?;
        Ok(self.shared.rotate())
    }

    /// Erases every held secret.
    ///
    /// Safe to call concurrently and repeatedly; later calls erase nothing.
    /// When explicit cleanup is disabled the call is audited as skipped and
    /// erases nothing.
    ///
    /// # Errors
    ///
    /// Returns [`SecretsError::ResourceDisposed`] after teardown.
    pub fn clear_all_security_state(&self) -> Result<usize> {
        self.ensure_active()?;
        if !self.shared.options.triggers.on_explicit_call {
            info!("explicit cleanup is disabled; nothing erased");
            record(
                self.shared
                    .auditor
                    .log_cleanup_operation("explicit", 0, AuditOutcome::Skipped),
            );
            return Ok(0);
        }
        self.shared.clear_all("explicit")
    }

    /// Snapshot of the manager's state. Does not change any state.
    ///
    /// # Errors
    ///
    /// Returns [`SecretsError::ResourceDisposed`] after teardown.
    pub fn get_security_status(&self) -> Result<SecurityStatus> {
        self.ensure_active()?;
        let container = &self.shared.container;
        let cipher = &self.shared.cipher;
        let access_token_expires_at = container.peek_expires_at(&SecretKind::Access)?;

        Ok(SecurityStatus {
            authenticated: access_token_expires_at.is_some(),
            access_token_expires_at,
            refresh_token_present: container.peek_expires_at(&SecretKind::Refresh)?.is_some(),
            stored_secrets: container.occupied()?.len(),
            live_secret_bytes: container.live_secret_bytes(),
            encryption_enabled: cipher.is_enabled(),
            key_version: cipher.current_version(),
            last_key_rotation: cipher.last_rotation(),
            next_key_rotation: cipher.next_rotation(),
            background_tasks: self.tasks.lock().iter().filter(|t| t.is_running()).count(),
        })
    }

    /// Spawns the background tasks on the current tokio runtime.
    ///
    /// Returns the number of running tasks. Calling it again while tasks are
    /// running starts nothing new.
    ///
    /// # Errors
    ///
    /// Returns [`SecretsError::RuntimeUnavailable`] outside a runtime and
    /// [`SecretsError::ResourceDisposed`] after teardown.
    pub fn start(&self) -> Result<usize> {
        self.ensure_active()?;
        tokio::runtime::Handle::try_current().map_err(|_| SecretsError::RuntimeUnavailable)?;

        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return Ok(tasks.len());
        }

        if let Some(interval) = self.shared.options.refresh_interval {
            let shared = Arc::clone(&self.shared);
            tasks.extend(ScheduledTask::spawn("token-refresh", interval, move || {
                let shared = Arc::clone(&shared);
                async move { shared.refresh_tick() }
            }));
        }

        if let Some(interval) = self.shared.cipher.options().rotation_interval {
            let shared = Arc::clone(&self.shared);
            let check = interval.min(ROTATION_CHECK_INTERVAL);
            tasks.extend(ScheduledTask::spawn("key-rotation", check, move || {
                let shared = Arc::clone(&shared);
                async move { shared.rotation_tick() }
            }));
        }

        let shared = Arc::clone(&self.shared);
        tasks.extend(ScheduledTask::spawn(
            "maintenance",
            self.shared.options.maintenance_interval,
            move || {
                let shared = Arc::clone(&shared);
                async move { shared.maintenance_tick() }
            },
        ));

        info!(tasks = tasks.len(), "credential lifecycle started");
        Ok(tasks.len())
    }

    /// Stops and joins the background tasks, then disposes.
    pub async fn shutdown(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in &tasks {
            task.stop().await;
        }
        self.dispose();
    }

    /// Whether the manager was torn down.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.shared.disposed.load(Ordering::Acquire)
    }

    /// Erases everything, cancels background tasks and disposes the
    /// container. Idempotent; later calls fail with
    /// [`SecretsError::ResourceDisposed`].
    pub fn dispose(&self) {
        if self.shared.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        for task in self.tasks.lock().drain(..) {
            task.cancel();
        }

        let container = &self.shared.container;
        container.unsubscribe_expired(self.expiry_subscription);
        if let Ok(erased) = container.clear_all() {
            record(
                self.shared
                    .auditor
                    .log_cleanup_operation("dispose", erased, AuditOutcome::Success),
            );
        }
        container.dispose();

        self.shared.security.clear();
        self.shared.refresh.clear();
        self.shared.rotated.clear();
        info!("credential lifecycle disposed");
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
}

impl Drop for CredentialLifecycleManager {
    fn drop(&mut self) {
        if self.shared.options.triggers.on_process_exit {
            self.dispose();
        } else {
            for task in self.tasks.lock().iter() {
                task.cancel();
            }
            self.shared
                .container
                .unsubscribe_expired(self.expiry_subscription);
        }
    }
}

impl std::fmt::Debug for CredentialLifecycleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialLifecycleManager")
            .field("options", &self.shared.options)
            .field("tasks", &self.tasks.lock().len())
            .field("disposed", &self.is_disposed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::CipherOptions;
    use credkeep_audit::{AuditQuery, AuditorOptions, NoopAuditSink};
    use credkeep_scan::SensitiveDataScanner;
    use std::sync::atomic::AtomicUsize;

    fn auditor() -> Arc<SecurityAuditor> {
        Arc::new(SecurityAuditor::new(
            AuditorOptions::default(),
            Arc::new(NoopAuditSink::new()),
            Arc::new(SensitiveDataScanner::with_defaults()),
        ))
    }

    fn manager_with(options: LifecycleOptions, encryption: bool) -> CredentialLifecycleManager {
        CredentialLifecycleManager::new(
            options,
            Arc::new(SecretContainer::default()),
            Arc::new(KeyedCipher::new(CipherOptions {
                enabled: encryption,
                ..CipherOptions::default()
            })),
            auditor(),
        )
    }

    fn manager() -> CredentialLifecycleManager {
        manager_with(LifecycleOptions::default(), true)
    }

    fn minutes(n: i64) -> chrono::Duration {
        chrono::Duration::minutes(n)
    }

    fn counter_for(
        manager: &CredentialLifecycleManager,
        wanted: SecurityEventKind,
    ) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        manager.subscribe_security_events(move |event: &SecurityEvent| {
            if event.kind == wanted {
                c.fetch_add(1, Ordering::SeqCst);
            }
        });
        count
    }

    #[test]
    fn store_and_retrieve_roundtrip_is_encrypted_at_rest() {
        let manager = manager();
        manager
            .store_token_securely("access-token-value", minutes(10), SecretKind::Access)
            .expect("store");

        assert!(!manager.container().contains_bytes(b"access-token-value"));
        let token = manager
            .retrieve_token_securely(&SecretKind::Access)
            .expect("retrieve")
            .expect("present");
        assert_eq!(token.as_str(), "access-token-value");
    }

    #[test]
    fn disabled_encryption_stores_plaintext_with_same_api() {
        let manager = manager_with(LifecycleOptions::default(), false);
        manager
            .store_token_securely("visible", minutes(10), SecretKind::Access)
            .expect("store");
        assert!(manager.container().contains_bytes(b"visible"));
        assert_eq!(
            manager
                .retrieve_token_securely(&SecretKind::Access)
                .expect("retrieve")
                .expect("present")
                .as_str(),
            "visible"
        );
    }

    #[test]
    fn operations_publish_events_and_audit() {
        let manager = manager();
        let stored = counter_for(&manager, SecurityEventKind::TokenStored);
        let retrieved = counter_for(&manager, SecurityEventKind::TokenRetrieved);

        manager
            .store_token_securely("abc", minutes(10), SecretKind::Refresh)
            .expect("store");
        manager
            .retrieve_token_securely(&SecretKind::Refresh)
            .expect("retrieve");
        manager
            .retrieve_token_securely(&SecretKind::Access)
            .expect("retrieve");

        assert_eq!(stored.load(Ordering::SeqCst), 1);
        assert_eq!(retrieved.load(Ordering::SeqCst), 1);

        let entries = manager
            .auditor()
            .query(&AuditQuery {
                event_types: vec![AuditEventType::TokenOperation],
                ..AuditQuery::default()
            })
            .expect("query");
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| !e.to_json().expect("json").contains("abc\"")));
    }

    #[test]
    fn invalid_store_is_rejected_and_audited_as_failure() {
        let manager = manager();
        assert!(matches!(
            manager.store_token_securely("", minutes(1), SecretKind::Access),
            Err(SecretsError::ArgumentInvalid { .. })
        ));
        assert!(matches!(
            manager.store_token_securely("x", minutes(-1), SecretKind::Access),
            Err(SecretsError::ArgumentInvalid { .. })
        ));

        let stats = manager.auditor().statistics(None).expect("stats");
        assert_eq!(stats.by_outcome[&AuditOutcome::Failure], 2);
    }

    #[test]
    fn authentication_follows_access_token() {
        let manager = manager();
        manager.bind_user_id("user-42", minutes(60)).expect("bind");
        assert!(!manager.is_authenticated().expect("auth"));
        assert_eq!(manager.current_user_id().expect("user"), None);

        manager
            .store_token_securely("token", minutes(10), SecretKind::Access)
            .expect("store");
        assert!(manager.is_authenticated().expect("auth"));
        assert_eq!(
            manager
                .current_user_id()
                .expect("user")
                .as_deref()
                .map(String::as_str),
            Some("user-42")
        );
    }

    #[test]
    fn expiry_is_forwarded_and_audited() {
        let manager = manager();
        let expired = counter_for(&manager, SecurityEventKind::SecretExpired);
        manager
            .store_token_securely("short", chrono::Duration::zero(), SecretKind::Access)
            .expect("store");

        assert!(
            manager
                .retrieve_token_securely(&SecretKind::Access)
                .expect("retrieve")
                .is_none()
        );
        assert_eq!(expired.load(Ordering::SeqCst), 1);
        let stats = manager.auditor().statistics(None).expect("stats");
        assert_eq!(stats.by_type[&AuditEventType::SecretExpired], 1);
    }

    #[test]
    fn clear_all_is_idempotent_and_audited() {
        let manager = manager();
        let cleared = counter_for(&manager, SecurityEventKind::SecurityStateCleared);
        manager
            .store_token_securely("a", minutes(10), SecretKind::Access)
            .expect("store");
        manager
            .store_token_securely("r", minutes(10), SecretKind::Refresh)
            .expect("store");

        assert_eq!(manager.clear_all_security_state().expect("clear"), 2);
        assert_eq!(manager.clear_all_security_state().expect("clear"), 0);
        assert_eq!(cleared.load(Ordering::SeqCst), 2);
        assert!(!manager.is_authenticated().expect("auth"));

        let stats = manager.auditor().statistics(None).expect("stats");
        assert_eq!(stats.cleanup_succeeded, 2);
        assert_eq!(stats.cleanup_failed, 0);
    }

    #[test]
    fn explicit_clear_can_be_disabled() {
        let manager = manager_with(
            LifecycleOptions {
                triggers: CleanupTriggers {
                    on_explicit_call: false,
                    ..CleanupTriggers::default()
                },
                ..LifecycleOptions::default()
            },
            true,
        );
        manager
            .store_token_securely("a", minutes(10), SecretKind::Access)
            .expect("store");
        assert_eq!(manager.clear_all_security_state().expect("clear"), 0);
        assert!(manager.is_authenticated().expect("auth"));
    }

    #[test]
    fn concurrent_clears_are_safe() {
        let manager = Arc::new(manager());
        manager
            .store_token_securely("a", minutes(10), SecretKind::Access)
            .expect("store");

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let manager = Arc::clone(&manager);
                std::thread::spawn(move || manager.clear_all_security_state().expect("clear"))
            })
            .collect();
        let total: usize = handles.into_iter().map(|h| h.join().expect("join")).sum();
        assert_eq!(total, 1);
    }

    #[test]
    fn rotation_keeps_tokens_readable() {
        let manager = manager();
        let rotations = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&rotations);
        manager.subscribe_key_rotated(move |_: &KeyRotated| {
            r.fetch_add(1, Ordering::SeqCst);
        });

        manager
            .store_token_securely("before-rotation", minutes(10), SecretKind::Access)
            .expect("store");
        let rotated = manager.rotate_encryption_key().expect("rotate");
        assert_eq!(rotated.version, 2);
        assert_eq!(rotations.load(Ordering::SeqCst), 1);
        assert_eq!(
            manager
                .retrieve_token_securely(&SecretKind::Access)
                .expect("retrieve")
                .expect("present")
                .as_str(),
            "before-rotation"
        );
    }

    #[test]
    fn status_is_a_snapshot() {
        let manager = manager();
        manager
            .store_token_securely("a", minutes(10), SecretKind::Access)
            .expect("store");
        manager
            .store_token_securely("gone", chrono::Duration::zero(), SecretKind::Refresh)
            .expect("store");

        let status = manager.get_security_status().expect("status");
        assert!(status.authenticated);
        assert!(status.access_token_expires_at.is_some());
        assert!(!status.refresh_token_present);
        assert_eq!(status.stored_secrets, 2);
        assert!(status.encryption_enabled);
        assert_eq!(status.key_version, 1);
        assert_eq!(status.background_tasks, 0);

        // Reading the status does not reap the expired refresh token.
        assert_eq!(manager.get_security_status().expect("status").stored_secrets, 2);
    }

    #[test]
    fn start_requires_a_runtime() {
        let manager = manager();
        assert!(matches!(manager.start(), Err(SecretsError::RuntimeUnavailable)));
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_task_requests_refresh_without_refreshing() {
        let manager = manager_with(
            LifecycleOptions {
                refresh_interval: Some(Duration::from_secs(1)),
                refresh_threshold: Duration::from_secs(300),
                ..LifecycleOptions::default()
            },
            true,
        );
        let requests = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&requests);
        manager.subscribe_token_refresh(move |request: &TokenRefreshRequested| {
            assert_eq!(request.kind, SecretKind::Access);
            r.fetch_add(1, Ordering::SeqCst);
        });

        manager
            .store_token_securely("expiring", minutes(2), SecretKind::Access)
            .expect("store");
        assert!(manager.start().expect("start") >= 2);

        tokio::time::sleep(Duration::from_millis(2_500)).await;

        assert!(requests.load(Ordering::SeqCst) >= 1);
        assert_eq!(
            manager
                .retrieve_token_securely(&SecretKind::Access)
                .expect("retrieve")
                .expect("present")
                .as_str(),
            "expiring"
        );
        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_task_requests_refresh_for_expired_or_missing_token() {
        let manager = manager_with(
            LifecycleOptions {
                refresh_interval: Some(Duration::from_secs(1)),
                refresh_threshold: Duration::from_secs(300),
                ..LifecycleOptions::default()
            },
            true,
        );
        let requests = Arc::new(Mutex::new(Vec::new()));
        let r = Arc::clone(&requests);
        manager.subscribe_token_refresh(move |request: &TokenRefreshRequested| {
            r.lock().push(request.clone());
        });

        manager
            .store_token_securely("stale", chrono::Duration::zero(), SecretKind::Access)
            .expect("store");
        manager.start().expect("start");

        tokio::time::sleep(Duration::from_millis(1_500)).await;
        {
            let seen = requests.lock();
            assert_eq!(seen.len(), 1);
            assert_eq!(seen[0].kind, SecretKind::Access);
            assert_eq!(seen[0].expires_at, None);
        }

        // The expired token was reaped; an absent token still needs a refresh.
        assert!(manager.container().occupied().expect("occupied").is_empty());
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(requests.lock().len(), 2);
        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn user_id_polling_does_not_postpone_idle_timeout() {
        let manager = manager_with(
            LifecycleOptions {
                refresh_interval: None,
                maintenance_interval: Duration::from_secs(1),
                triggers: CleanupTriggers {
                    idle_timeout: Some(Duration::from_secs(3)),
                    ..CleanupTriggers::default()
                },
                ..LifecycleOptions::default()
            },
            true,
        );
        manager
            .store_token_securely("idle", minutes(10), SecretKind::Access)
            .expect("store");
        manager.bind_user_id("user-7", minutes(10)).expect("bind");
        let audited = manager.auditor().snapshot().expect("snapshot").len();
        manager.start().expect("start");

        for _ in 0..2 {
            tokio::time::sleep(Duration::from_millis(900)).await;
            assert_eq!(
                manager
                    .current_user_id()
                    .expect("user")
                    .as_deref()
                    .map(String::as_str),
                Some("user-7")
            );
        }
        assert_eq!(manager.auditor().snapshot().expect("snapshot").len(), audited);

        tokio::time::sleep(Duration::from_millis(2_700)).await;
        assert!(!manager.is_authenticated().expect("auth"));
        assert_eq!(manager.current_user_id().expect("user"), None);
        assert_eq!(manager.container().live_secret_bytes(), 0);
        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn idle_timeout_clears_state() {
        let manager = manager_with(
            LifecycleOptions {
                refresh_interval: None,
                maintenance_interval: Duration::from_secs(1),
                triggers: CleanupTriggers {
                    idle_timeout: Some(Duration::from_secs(3)),
                    ..CleanupTriggers::default()
                },
                ..LifecycleOptions::default()
            },
            true,
        );
        manager
            .store_token_securely("idle", minutes(10), SecretKind::Access)
            .expect("store");
        manager.start().expect("start");

        tokio::time::sleep(Duration::from_millis(4_500)).await;

        assert!(!manager.is_authenticated().expect("auth"));
        assert_eq!(manager.container().live_secret_bytes(), 0);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_joins_tasks_and_disposes() {
        let manager = manager();
        manager
            .store_token_securely("a", minutes(10), SecretKind::Access)
            .expect("store");
        assert!(manager.start().expect("start") > 0);
        assert_eq!(manager.start().expect("start again"), manager.tasks.lock().len());

        manager.shutdown().await;
        manager.shutdown().await;

        assert!(manager.is_disposed());
        assert!(manager.container().is_disposed());
        assert!(matches!(
            manager.store_token_securely("b", minutes(1), SecretKind::Access),
            Err(SecretsError::ResourceDisposed { .. })
        ));
        assert!(matches!(
            manager.clear_all_security_state(),
            Err(SecretsError::ResourceDisposed { .. })
        ));
        assert!(matches!(
            manager.get_security_status(),
            Err(SecretsError::ResourceDisposed { .. })
        ));
    }

    #[test]
    fn drop_erases_when_exit_trigger_is_set() {
        let container = Arc::new(SecretContainer::default());
        let cipher = Arc::new(KeyedCipher::default());
        {
            let manager = CredentialLifecycleManager::new(
                LifecycleOptions::default(),
                Arc::clone(&container),
                Arc::clone(&cipher),
                auditor(),
            );
            manager
                .store_token_securely("a", minutes(10), SecretKind::Access)
                .expect("store");
        }
        assert!(container.is_disposed());
        assert_eq!(container.live_secret_bytes(), 0);

        let container = Arc::new(SecretContainer::default());
        {
            let manager = CredentialLifecycleManager::new(
                LifecycleOptions {
                    triggers: CleanupTriggers {
                        on_process_exit: false,
                        ..CleanupTriggers::default()
                    },
                    ..LifecycleOptions::default()
                },
                Arc::clone(&container),
                cipher,
                auditor(),
            );
            manager
                .store_token_securely("b", minutes(10), SecretKind::Access)
                .expect("store");
        }
        assert!(!container.is_disposed());
        assert!(container.live_secret_bytes() > 0);
    }
}
