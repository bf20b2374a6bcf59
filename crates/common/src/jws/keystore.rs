//! Signing key lifecycle: configure, rotate, resolve, purge.
//!
//! Each [`KeyKind`] owns one [`KeyRing`] persisted as a single seal-wrapped
//! storage entry, so a rotation is one atomic write. Configuring a key always
//! produces a new version; the previous active key is demoted to retained and
//! stays resolvable by kid until it is purged.

use core::fmt;

use base64::{engine::general_purpose, Engine};
use chrono::{DateTime, Utc};
use ed25519_dalek::{SigningKey, VerifyingKey};
use error_stack::{Report, ResultExt};
use jose_jwk::Jwk;
use serde::{Deserialize, Serialize};

use crate::error::WebhookError;
use crate::storage::{is_valid_path_segment, Storage, StorageEntry};

use super::keys::{
    generate_kid, parse_ed25519_signing_key, validate_algorithm, verifying_key_from_jwk, KeyKind,
    Keypair, JWS_ALGORITHM,
};

/// One version of a signing key.
///
/// The private seed is only reachable inside the crate. Published material is
/// built from `certificate`, the public JWK.
#[derive(Clone, Serialize, Deserialize)]
pub struct SigningKeyConfig {
    pub kid: String,
    private_key: String,
    /// Public key as a JWK; this is what gets published.
    pub certificate: Jwk,
    pub algorithm: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotated_from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retired_at: Option<DateTime<Utc>>,
}

impl fmt::Debug for SigningKeyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKeyConfig")
            .field("kid", &self.kid)
            .field("private_key", &"<redacted>")
            .field("algorithm", &self.algorithm)
            .field("created_at", &self.created_at)
            .field("rotated_from", &self.rotated_from)
            .field("retired_at", &self.retired_at)
            .finish_non_exhaustive()
    }
}

impl SigningKeyConfig {
    pub(crate) fn new(
        kid: String,
        keypair: &Keypair,
        created_at: DateTime<Utc>,
        rotated_from: Option<String>,
    ) -> Self {
        Self {
            certificate: keypair.get_jwk(kid.clone()),
            kid,
            private_key: general_purpose::STANDARD.encode(keypair.signing_key.as_bytes()),
            algorithm: JWS_ALGORITHM.to_string(),
            created_at,
            rotated_from,
            retired_at: None,
        }
    }

    pub(crate) fn signing_key(&self) -> Result<SigningKey, Report<WebhookError>> {
        parse_ed25519_signing_key(self.private_key.as_bytes())
            .change_context(WebhookError::storage("Stored signing key is corrupt"))
            .attach(format!("kid: {}", self.kid))
    }

    /// Verifying key derived from the published certificate.
    ///
    /// # Errors
    ///
    /// Returns a [`WebhookError::Storage`] if the stored certificate is corrupt.
    pub fn verifying_key(&self) -> Result<VerifyingKey, Report<WebhookError>> {
        verifying_key_from_jwk(&self.certificate)
            .change_context(WebhookError::storage("Stored certificate is corrupt"))
            .attach(format!("kid: {}", self.kid))
    }

    #[must_use]
    pub fn is_retained(&self) -> bool {
        self.retired_at.is_some()
    }
}

/// Active key plus retained predecessors for one [`KeyKind`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeyRing {
    pub active: Option<SigningKeyConfig>,
    #[serde(default)]
    pub retained: Vec<SigningKeyConfig>,
    /// Kids removed by a purge. They are never issued again, so an envelope
    /// signed under one keeps failing as an unknown key.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub purged: Vec<String>,
}

impl KeyRing {
    #[must_use]
    pub fn find(&self, kid: &str) -> Option<&SigningKeyConfig> {
        self.active
            .iter()
            .chain(self.retained.iter())
            .find(|key| key.kid == kid)
    }

    #[must_use]
    pub fn contains(&self, kid: &str) -> bool {
        self.find(kid).is_some()
    }

    /// True when `kid` is resolvable now or was purged.
    #[must_use]
    pub fn has_issued(&self, kid: &str) -> bool {
        self.contains(kid) || self.purged.iter().any(|purged| purged == kid)
    }

    /// Active kid first, then retained kids oldest first.
    #[must_use]
    pub fn kids(&self) -> Vec<String> {
        self.active
            .iter()
            .chain(self.retained.iter())
            .map(|key| key.kid.clone())
            .collect()
    }

    /// Public keys of every resolvable version, active first.
    #[must_use]
    pub fn public_keys(&self) -> Vec<Jwk> {
        self.active
            .iter()
            .chain(self.retained.iter())
            .map(|key| key.certificate.clone())
            .collect()
    }

    fn rotate(&mut self, next: SigningKeyConfig, now: DateTime<Utc>) -> Option<String> {
        let previous = self.active.replace(next);
        previous.map(|mut key| {
            key.retired_at = Some(now);
            let kid = key.kid.clone();
            self.retained.push(key);
            kid
        })
    }

    fn purge_retained(&mut self, older_than: DateTime<Utc>) -> Vec<String> {
        let mut purged = Vec::new();
        self.retained.retain(|key| match key.retired_at {
            Some(retired_at) if retired_at < older_than => {
                purged.push(key.kid.clone());
                false
            }
            _ => true,
        });
        self.purged.extend(purged.iter().cloned());
        purged
    }
}

/// Operator input for configuring a key.
#[derive(Debug, Clone, Default)]
pub struct KeyMaterial {
    /// Ed25519 seed, raw or base64. A fresh key is generated when absent.
    pub private_key: Option<Vec<u8>>,
    pub algorithm: Option<String>,
    pub kid: Option<String>,
}

#[derive(Debug, Clone)]
pub struct KeyRotationResult {
    pub new_kid: String,
    pub previous_kid: Option<String>,
    pub retained_kids: Vec<String>,
    pub jwk: Jwk,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyListing {
    pub active: Option<String>,
    pub retained: Vec<String>,
}

/// Storage-backed key store. Locking is the caller's concern.
pub struct KeyStore<'a> {
    storage: &'a dyn Storage,
}

impl<'a> KeyStore<'a> {
    #[must_use]
    pub fn new(storage: &'a dyn Storage) -> Self {
        Self { storage }
    }

    /// Loads the key ring for `kind`, empty when nothing is configured yet.
    ///
    /// # Errors
    ///
    /// Returns a [`WebhookError::Storage`] if the storage read fails or the ring
    /// cannot be decoded.
    pub fn load(&self, kind: KeyKind) -> Result<KeyRing, Report<WebhookError>> {
        let entry = self
            .storage
            .get(kind.config_path())
            .attach(format!("while loading {} key ring", kind))?;

        match entry {
            Some(entry) => entry.decode(),
            None => Ok(KeyRing::default()),
        }
    }

    fn save(&self, kind: KeyKind, ring: &KeyRing) -> Result<(), Report<WebhookError>> {
        let entry = StorageEntry::json(kind.config_path(), ring)?;
        self.storage
            .put(entry)
            .attach(format!("while saving {} key ring", kind))
    }

    /// Stores a new active key, demoting the current one to retained.
    ///
    /// # Errors
    ///
    /// Returns [`WebhookError::InvalidKeyMaterial`] when the algorithm is not
    /// `EdDSA`, the seed is malformed, or the kid is malformed or already in use;
    /// [`WebhookError::Storage`] when persistence fails.
    pub fn configure_signing_key(
        &self,
        kind: KeyKind,
        material: &KeyMaterial,
        now: DateTime<Utc>,
    ) -> Result<KeyRotationResult, Report<WebhookError>> {
        validate_algorithm(material.algorithm.as_deref().unwrap_or(JWS_ALGORITHM))?;

        let keypair = match &material.private_key {
            Some(bytes) => Keypair::from_signing_key(parse_ed25519_signing_key(bytes)?),
            None => Keypair::generate(),
        };

        let mut ring = self.load(kind)?;

        let new_kid = match &material.kid {
            Some(kid) => {
                if !is_valid_path_segment(kid) {
                    return Err(Report::new(WebhookError::InvalidKeyMaterial {
                        message: format!("malformed kid '{}'", kid),
                    }));
                }
                if ring.has_issued(kid) {
                    return Err(Report::new(WebhookError::InvalidKeyMaterial {
                        message: format!("kid '{}' is already in use", kid),
                    }));
                }
                kid.clone()
            }
            None => loop {
                let kid = generate_kid(kind, now);
                if !ring.has_issued(&kid) {
                    break kid;
                }
            },
        };

        let rotated_from = ring.active.as_ref().map(|key| key.kid.clone());
        let next = SigningKeyConfig::new(new_kid.clone(), &keypair, now, rotated_from);
        let jwk = next.certificate.clone();
        let previous_kid = ring.rotate(next, now);

        self.save(kind, &ring)?;

        log::info!(
            "Configured {} key '{}' (previous: {})",
            kind,
            new_kid,
            previous_kid.as_deref().unwrap_or("none")
        );

        Ok(KeyRotationResult {
            new_kid,
            previous_kid,
            retained_kids: ring.retained.iter().map(|key| key.kid.clone()).collect(),
            jwk,
        })
    }

    /// # Errors
    ///
    /// Returns [`WebhookError::NotConfigured`] when no key of `kind` is active.
    pub fn get_active_signing_key(
        &self,
        kind: KeyKind,
    ) -> Result<SigningKeyConfig, Report<WebhookError>> {
        active_key(&self.load(kind)?, kind).cloned()
    }

    /// Resolves an active or retained key by id.
    ///
    /// # Errors
    ///
    /// Returns [`WebhookError::UnknownKey`] if the kid is not in the ring.
    pub fn get_signing_key_by_id(
        &self,
        kind: KeyKind,
        kid: &str,
    ) -> Result<SigningKeyConfig, Report<WebhookError>> {
        self.load(kind)?.find(kid).cloned().ok_or_else(|| {
            Report::new(WebhookError::UnknownKey {
                kid: kid.to_string(),
            })
        })
    }

    /// Irreversibly removes retained keys retired before `older_than`. The active
    /// key is never touched.
    ///
    /// # Errors
    ///
    /// Returns a [`WebhookError::Storage`] if the ring cannot be read or written.
    pub fn purge_retained_keys(
        &self,
        kind: KeyKind,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<String>, Report<WebhookError>> {
        let mut ring = self.load(kind)?;
        let purged = ring.purge_retained(older_than);

        if !purged.is_empty() {
            self.save(kind, &ring)?;
            log::info!("Purged {} retained {} key(s): {:?}", purged.len(), kind, purged);
        }

        Ok(purged)
    }

    /// # Errors
    ///
    /// Returns a [`WebhookError::Storage`] if the ring cannot be read.
    pub fn list_keys(&self, kind: KeyKind) -> Result<KeyListing, Report<WebhookError>> {
        let ring = self.load(kind)?;
        Ok(KeyListing {
            active: ring.active.as_ref().map(|key| key.kid.clone()),
            retained: ring.retained.iter().map(|key| key.kid.clone()).collect(),
        })
    }
}

/// Returns the active key of a ring snapshot.
///
/// # Errors
///
/// Returns [`WebhookError::NotConfigured`] when the ring has no active key.
pub fn active_key(ring: &KeyRing, kind: KeyKind) -> Result<&SigningKeyConfig, Report<WebhookError>> {
    ring.active.as_ref().ok_or_else(|| {
        Report::new(WebhookError::NotConfigured {
            message: format!("no {} key has been configured", kind),
        })
    })
}
