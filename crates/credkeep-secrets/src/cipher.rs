//! Authenticated encryption with a rotating, versioned key.
//!
//! Payloads are sealed with ChaCha20-Poly1305 as `nonce || ciphertext || tag`
//! and carry the version of the key that sealed them. Superseded keys stay
//! in a bounded ring so payloads sealed before a rotation remain readable.
//!
//! With encryption disabled the cipher passes bytes through unchanged but
//! keeps the same signatures, size checks and version bookkeeping.

use std::collections::VecDeque;
use std::time::Duration;

use chacha20poly1305::{
    ChaCha20Poly1305, Nonce,
    aead::{Aead, KeyInit},
};
use chrono::{DateTime, Utc};
use credkeep_config::CredentialConfig;
use parking_lot::RwLock;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Result, SecretsError};
use crate::types::SecretBuffer;

/// Size of the encryption key in bytes (256 bits).
pub const KEY_SIZE: usize = 32;

/// Size of the nonce in bytes (96 bits).
pub const NONCE_SIZE: usize = 12;

/// Size of the authentication tag in bytes (128 bits).
pub const TAG_SIZE: usize = 16;

/// Bytes a sealed payload adds to its plaintext.
pub const ENVELOPE_OVERHEAD: usize = NONCE_SIZE + TAG_SIZE;

/// A 256-bit key, zeroized when dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecretKey {
    bytes: [u8; KEY_SIZE],
}

impl SecretKey {
    /// Generates a new random key.
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self { bytes }
    }

    /// Creates a key from raw bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the slice is not exactly 32 bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != KEY_SIZE {
            return Err(SecretsError::EncryptionError {
                reason: format!("key must be exactly {KEY_SIZE} bytes, got {}", bytes.len()),
            });
        }

        let mut key_bytes = [0u8; KEY_SIZE];
        key_bytes.copy_from_slice(bytes);
        Ok(Self { bytes: key_bytes })
    }
}

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// A key together with its version.
#[derive(Debug, Clone)]
pub struct KeyMaterial {
    key: SecretKey,
    version: u32,
    created_at: DateTime<Utc>,
}

impl KeyMaterial {
    fn generate(version: u32) -> Self {
        Self {
            key: SecretKey::generate(),
            version,
            created_at: Utc::now(),
        }
    }

    /// Key version, starting at 1.
    #[must_use]
    pub const fn version(&self) -> u32 {
        self.version
    }

    /// When the key was generated.
    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

/// Bytes produced by [`KeyedCipher::encrypt`] and the key version that
/// produced them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedPayload {
    /// Version of the sealing key.
    pub key_version: u32,
    /// Sealed bytes, or the plaintext when encryption is disabled.
    pub bytes: SecretBuffer,
}

/// Emitted after every key rotation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRotated {
    /// New key version.
    pub version: u32,
    /// When the rotation happened.
    pub rotated_at: DateTime<Utc>,
    /// When the next scheduled rotation is due.
    pub next_rotation: Option<DateTime<Utc>>,
}

/// Cipher tunables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CipherOptions {
    /// Whether payloads are actually encrypted.
    pub enabled: bool,
    /// Scheduled rotation interval; `None` disables scheduled rotation.
    pub rotation_interval: Option<Duration>,
    /// Superseded key versions kept for decryption.
    pub retained_versions: usize,
    /// Largest accepted plaintext.
    pub max_plaintext_bytes: usize,
}

impl Default for CipherOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            rotation_interval: Some(Duration::from_secs(24 * 3600)),
            retained_versions: 3,
            max_plaintext_bytes: 1024 * 1024,
        }
    }
}

impl From<&CredentialConfig> for CipherOptions {
    fn from(config: &CredentialConfig) -> Self {
        Self {
            enabled: config.encryption_enabled,
            rotation_interval: config.key_rotation_interval(),
            retained_versions: config.retained_key_versions,
            max_plaintext_bytes: config.max_secret_bytes,
        }
    }
}

struct KeyState {
    current: KeyMaterial,
    retired: VecDeque<KeyMaterial>,
    last_rotation: DateTime<Utc>,
    next_rotation: Option<DateTime<Utc>>,
}

impl KeyState {
    fn find(&self, version: u32) -> Option<&KeyMaterial> {
        if self.current.version == version {
            return Some(&self.current);
        }
        self.retired.iter().find(|k| k.version == version)
    }
}

/// Encrypts and decrypts secrets under a rotating key.
///
/// The key state sits behind one lock, so readers see either the state
/// before a rotation or the state after it.
pub struct KeyedCipher {
    options: CipherOptions,
    state: RwLock<KeyState>,
}

impl KeyedCipher {
    /// Creates a cipher with a fresh version-1 key.
    #[must_use]
    pub fn new(options: CipherOptions) -> Self {
        let now = Utc::now();
        Self {
            options,
            state: RwLock::new(KeyState {
                current: KeyMaterial::generate(1),
                retired: VecDeque::new(),
                last_rotation: now,
                next_rotation: next_rotation_after(now, options.rotation_interval),
            }),
        }
    }

    /// Creates a cipher from the shared configuration.
    #[must_use]
    pub fn from_config(config: &CredentialConfig) -> Self {
        Self::new(CipherOptions::from(config))
    }

    /// Cipher options.
    #[must_use]
    pub const fn options(&self) -> &CipherOptions {
        &self.options
    }

    /// Whether payloads are actually encrypted.
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.options.enabled
    }

    /// Seals `plaintext` under the current key.
    ///
    /// # Errors
    ///
    /// Returns [`SecretsError::ArgumentInvalid`] if the plaintext is empty
    /// or exceeds the size limit, or [`SecretsError::EncryptionError`] if
    /// sealing fails.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<EncryptedPayload> {
        if plaintext.is_empty() {
            return Err(SecretsError::invalid("secret must not be empty"));
        }
        if plaintext.len() > self.options.max_plaintext_bytes {
            return Err(SecretsError::invalid(format!(
                "secret of {} bytes exceeds the {} byte limit",
                plaintext.len(),
                self.options.max_plaintext_bytes
            )));
        }

        let state = self.state.read();
        let key_version = state.current.version;
        let bytes = if self.options.enabled {
            SecretBuffer::new(seal(&state.current.key, plaintext)?)
        } else {
            SecretBuffer::from_slice(plaintext)
        };
        Ok(EncryptedPayload { key_version, bytes })
    }

    /// Opens a payload produced by [`encrypt`](Self::encrypt).
    ///
    /// # Errors
    ///
    /// Returns [`SecretsError::KeyVersionUnavailable`] if the sealing key
    /// was evicted, or [`SecretsError::EncryptionError`] if authentication
    /// fails.
    pub fn decrypt(&self, payload: &EncryptedPayload) -> Result<SecretBuffer> {
        let state = self.state.read();
        let material =
            state
                .find(payload.key_version)
                .ok_or(SecretsError::KeyVersionUnavailable {
                    version: payload.key_version,
                })?;

        if self.options.enabled {
            payload
                .bytes
                .expose(|sealed| open(&material.key, sealed))
                .map(SecretBuffer::new)
        } else {
            Ok(payload.bytes.clone())
        }
    }

    /// Replaces the current key with a new version.
    ///
    /// The previous key joins the retained ring; the oldest retained key is
    /// dropped (and zeroized) once the ring is full.
    pub fn rotate_keys(&self) -> KeyRotated {
        let now = Utc::now();
        let mut state = self.state.write();

        let next = KeyMaterial::generate(state.current.version.saturating_add(1));
        let previous = std::mem::replace(&mut state.current, next);
        state.retired.push_front(previous);
        while state.retired.len() > self.options.retained_versions {
            if let Some(evicted) = state.retired.pop_back() {
                debug!(version = evicted.version, "retired key evicted");
            }
        }
        state.last_rotation = now;
        state.next_rotation = next_rotation_after(now, self.options.rotation_interval);

        let rotated = KeyRotated {
            version: state.current.version,
            rotated_at: now,
            next_rotation: state.next_rotation,
        };
        drop(state);

        info!(version = rotated.version, "encryption key rotated");
        rotated
    }

    /// Whether scheduled rotation is due.
    #[must_use]
    pub fn rotation_due(&self) -> bool {
        self.state.read()
            .next_rotation
            .is_some_and(|next| Utc::now() >= next)
    }

    /// Current key version.
    #[must_use]
    pub fn current_version(&self) -> u32 {
        self.state.read().current.version
    }

    /// Versions that can still be decrypted, newest first.
    #[must_use]
    pub fn available_versions(&self) -> Vec<u32> {
        let state = self.state.read();
        std::iter::once(state.current.version)
            .chain(state.retired.iter().map(KeyMaterial::version))
            .collect()
    }

    /// When the key was last rotated (or created).
    #[must_use]
    pub fn last_rotation(&self) -> DateTime<Utc> {
        self.state.read().last_rotation
    }

    /// When the next scheduled rotation is due.
    #[must_use]
    pub fn next_rotation(&self) -> Option<DateTime<Utc>> {
        self.state.read().next_rotation
    }
}

impl Default for KeyedCipher {
    fn default() -> Self {
        Self::new(CipherOptions::default())
    }
}

impl std::fmt::Debug for KeyedCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyedCipher")
            .field("options", &self.options)
            .field("current_version", &self.current_version())
            .field("key", &"[REDACTED]")
            .finish()
    }
}

fn next_rotation_after(from: DateTime<Utc>, interval: Option<Duration>) -> Option<DateTime<Utc>> {
    interval
        .and_then(|i| chrono::Duration::from_std(i).ok())
        .and_then(|i| from.checked_add_signed(i))
}

fn seal(key: &SecretKey, plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher =
        ChaCha20Poly1305::new_from_slice(&key.bytes).map_err(|e| SecretsError::EncryptionError {
            reason: format!("failed to create cipher: {e}"),
        })?;

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext =
        cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| SecretsError::EncryptionError {
                reason: format!("encryption failed: {e}"),
            })?;

    let mut output = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    output.extend_from_slice(&nonce_bytes);
    output.extend_from_slice(&ciphertext);
    Ok(output)
}

fn open(key: &SecretKey, sealed: &[u8]) -> Result<Vec<u8>> {
    if sealed.len() < ENVELOPE_OVERHEAD {
        return Err(SecretsError::EncryptionError {
            reason: format!(
                "ciphertext too short: expected at least {ENVELOPE_OVERHEAD} bytes, got {}",
                sealed.len()
            ),
        });
    }

    let cipher =
        ChaCha20Poly1305::new_from_slice(&key.bytes).map_err(|e| SecretsError::EncryptionError {
            reason: format!("failed to create cipher: {e}"),
        })?;

    let nonce = Nonce::from_slice(&sealed[..NONCE_SIZE]);
    cipher
        .decrypt(nonce, &sealed[NONCE_SIZE..])
        .map_err(|e| SecretsError::EncryptionError {
            reason: format!("decryption failed: {e}"),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use test_case::test_case;

    fn cipher(enabled: bool) -> KeyedCipher {
        KeyedCipher::new(CipherOptions {
            enabled,
            ..CipherOptions::default()
        })
    }

    #[test_case(KEY_SIZE, true ; "exact length")]
    #[test_case(16, false ; "too short")]
    #[test_case(64, false ; "too long")]
    #[test_case(0, false ; "empty")]
    fn secret_key_from_bytes_checks_length(len: usize, ok: bool) {
        assert_eq!(SecretKey::from_bytes(&vec![42u8; len]).is_ok(), ok);
    }

    #[test]
    fn secret_key_debug_redacts() {
        let debug = format!("{:?}", SecretKey::generate());
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let cipher = cipher(true);
        let payload = cipher.encrypt(b"hello, world!").expect("encrypt");

        assert_eq!(payload.key_version, 1);
        assert_eq!(payload.bytes.len(), 13 + ENVELOPE_OVERHEAD);
        assert!(!payload.bytes.contains(b"hello"));

        let plain = cipher.decrypt(&payload).expect("decrypt");
        assert_eq!(plain, SecretBuffer::from_slice(b"hello, world!"));
    }

    #[test]
    fn same_plaintext_gives_different_ciphertexts() {
        let cipher = cipher(true);
        let a = cipher.encrypt(b"same message").expect("encrypt");
        let b = cipher.encrypt(b"same message").expect("encrypt");
        assert_ne!(a.bytes, b.bytes);
    }

    #[test]
    fn tampered_payload_fails_authentication() {
        let cipher = cipher(true);
        let payload = cipher.encrypt(b"secret").expect("encrypt");
        let mut bytes = payload.bytes.expose(<[u8]>::to_vec);
        if let Some(last) = bytes.last_mut() {
            *last ^= 0xFF;
        }
        let tampered = EncryptedPayload {
            key_version: payload.key_version,
            bytes: SecretBuffer::new(bytes),
        };
        assert!(matches!(
            cipher.decrypt(&tampered),
            Err(SecretsError::EncryptionError { .. })
        ));

        let short = EncryptedPayload {
            key_version: 1,
            bytes: SecretBuffer::from_slice(&[0u8; 4]),
        };
        assert!(matches!(
            cipher.decrypt(&short),
            Err(SecretsError::EncryptionError { .. })
        ));
    }

    #[test]
    fn disabled_cipher_is_identity_with_same_bookkeeping() {
        let cipher = cipher(false);
        let payload = cipher.encrypt(b"plain").expect("encrypt");
        assert_eq!(payload.bytes, SecretBuffer::from_slice(b"plain"));
        assert_eq!(payload.key_version, 1);

        let rotated = cipher.rotate_keys();
        assert_eq!(rotated.version, 2);
        assert_eq!(
            cipher.decrypt(&payload).expect("decrypt"),
            SecretBuffer::from_slice(b"plain")
        );
    }

    #[test_case(true ; "enabled")]
    #[test_case(false ; "disabled")]
    fn empty_plaintext_is_rejected(enabled: bool) {
        let cipher = cipher(enabled);
        assert!(matches!(
            cipher.encrypt(b""),
            Err(SecretsError::ArgumentInvalid { .. })
        ));
        assert_eq!(cipher.current_version(), 1);
    }

    #[test]
    fn oversized_plaintext_is_rejected() {
        let cipher = KeyedCipher::new(CipherOptions {
            max_plaintext_bytes: 8,
            ..CipherOptions::default()
        });
        assert!(cipher.encrypt(b"12345678").is_ok());
        assert!(matches!(
            cipher.encrypt(b"123456789"),
            Err(SecretsError::ArgumentInvalid { .. })
        ));
    }

    #[test]
    fn rotation_keeps_old_payloads_readable_until_evicted() {
        let cipher = KeyedCipher::new(CipherOptions {
            retained_versions: 2,
            ..CipherOptions::default()
        });
        let v1 = cipher.encrypt(b"first").expect("encrypt");

        cipher.rotate_keys();
        cipher.rotate_keys();
        assert_eq!(cipher.available_versions(), vec![3, 2, 1]);
        assert!(cipher.decrypt(&v1).is_ok());

        let rotated = cipher.rotate_keys();
        assert_eq!(rotated.version, 4);
        assert_eq!(cipher.available_versions(), vec![4, 3, 2]);
        assert!(matches!(
            cipher.decrypt(&v1),
            Err(SecretsError::KeyVersionUnavailable { version: 1 })
        ));
    }

    #[test]
    fn rotation_updates_schedule() {
        let cipher = cipher(true);
        let before = cipher.last_rotation();
        let rotated = cipher.rotate_keys();

        assert!(rotated.rotated_at >= before);
        assert_eq!(cipher.last_rotation(), rotated.rotated_at);
        let next = rotated.next_rotation.expect("scheduled");
        assert_eq!(next - rotated.rotated_at, chrono::Duration::hours(24));
        assert!(!cipher.rotation_due());
    }

    #[test]
    fn disabled_schedule_still_allows_manual_rotation() {
        let cipher = KeyedCipher::new(CipherOptions {
            rotation_interval: None,
            ..CipherOptions::default()
        });
        assert_eq!(cipher.next_rotation(), None);
        assert!(!cipher.rotation_due());
        assert_eq!(cipher.rotate_keys().next_rotation, None);
        assert_eq!(cipher.current_version(), 2);
    }

    #[test]
    fn readers_never_see_half_rotated_state() {
        let cipher = std::sync::Arc::new(cipher(true));
        let writer = {
            let cipher = std::sync::Arc::clone(&cipher);
            std::thread::spawn(move || {
                for _ in 0..50 {
                    cipher.rotate_keys();
                }
            })
        };
        for _ in 0..200 {
            let payload = cipher.encrypt(b"value").expect("encrypt");
            // The sealing version is always retained right after sealing
            // unless four or more rotations land in between.
            match cipher.decrypt(&payload) {
                Ok(plain) => assert_eq!(plain, SecretBuffer::from_slice(b"value")),
                Err(SecretsError::KeyVersionUnavailable { .. }) => {}
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        writer.join().expect("join");
    }

    proptest! {
        #[test]
        fn roundtrip_any_plaintext(plaintext in proptest::collection::vec(any::<u8>(), 1..512)) {
            let cipher = KeyedCipher::default();
            let payload = cipher.encrypt(&plaintext).expect("encrypt");
            let plain = cipher.decrypt(&payload).expect("decrypt");
            prop_assert_eq!(plain, SecretBuffer::from_slice(&plaintext));
        }
    }
}
