//! The secrets engine backend.
//!
//! [`Backend`] owns the settings, the storage handle and one readers-writer
//! lock. Reads take the shared lock only while loading a snapshot; mutations
//! hold the exclusive lock for their whole read-modify-write. Signing and
//! verification crypto always runs after the guard is dropped.

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, TimeDelta, Utc};
use error_stack::Report;
use serde::{Deserialize, Serialize};

use crate::audit::{AuditLog, VerificationRecord};
use crate::destination::{Destination, DestinationRegistry, DestinationSpec};
use crate::error::WebhookError;
use crate::jws::certificate::{publish_certificate, JwksDocument, PublishedCertificate};
use crate::jws::envelope::parse_compact;
use crate::jws::keys::KeyKind;
use crate::jws::keystore::{
    active_key, KeyListing, KeyMaterial, KeyRotationResult, KeyStore, SigningKeyConfig,
};
use crate::jws::signing::{RequestSigner, SignedRequest};
use crate::jws::verification::{VerificationOutcome, VerifiedEnvelope, Verifier};
use crate::settings::Settings;
use crate::storage::Storage;

/// Source of the current time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// What one purge pass removed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurgeSummary {
    pub jws_keys: Vec<String>,
    pub client_keys: Vec<String>,
    pub verification_records: usize,
}

impl PurgeSummary {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.jws_keys.is_empty() && self.client_keys.is_empty() && self.verification_records == 0
    }
}

pub struct Backend {
    settings: Settings,
    storage: Arc<dyn Storage>,
    lock: RwLock<()>,
    clock: Arc<dyn Clock>,
}

impl Backend {
    #[must_use]
    pub fn new(settings: Settings, storage: Arc<dyn Storage>) -> Self {
        Self {
            settings,
            storage,
            lock: RwLock::new(()),
            clock: Arc::new(SystemClock),
        }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, ()>, Report<WebhookError>> {
        self.lock
            .read()
            .map_err(|_| Report::new(WebhookError::storage("backend lock poisoned")))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, ()>, Report<WebhookError>> {
        self.lock
            .write()
            .map_err(|_| Report::new(WebhookError::storage("backend lock poisoned")))
    }

    fn keys(&self) -> KeyStore<'_> {
        KeyStore::new(self.storage.as_ref())
    }

    fn destinations(&self) -> DestinationRegistry<'_> {
        DestinationRegistry::new(self.storage.as_ref())
    }

    // Key store

    /// Stores a new active key of `kind`, retaining the previous one.
    ///
    /// # Errors
    ///
    /// Returns [`WebhookError::InvalidKeyMaterial`] for bad input and
    /// [`WebhookError::Storage`] on persistence failure.
    pub fn configure_signing_key(
        &self,
        kind: KeyKind,
        material: &KeyMaterial,
    ) -> Result<KeyRotationResult, Report<WebhookError>> {
        let _guard = self.write()?;
        self.keys()
            .configure_signing_key(kind, material, self.clock.now())
    }

    /// # Errors
    ///
    /// Returns [`WebhookError::NotConfigured`] when no key of `kind` exists.
    pub fn get_active_signing_key(
        &self,
        kind: KeyKind,
    ) -> Result<SigningKeyConfig, Report<WebhookError>> {
        let _guard = self.read()?;
        self.keys().get_active_signing_key(kind)
    }

    /// # Errors
    ///
    /// Returns [`WebhookError::UnknownKey`] when `kid` is neither active nor retained.
    pub fn get_signing_key_by_id(
        &self,
        kind: KeyKind,
        kid: &str,
    ) -> Result<SigningKeyConfig, Report<WebhookError>> {
        let _guard = self.read()?;
        self.keys().get_signing_key_by_id(kind, kid)
    }

    /// # Errors
    ///
    /// Returns [`WebhookError::Storage`] on persistence failure.
    pub fn purge_retained_keys(
        &self,
        kind: KeyKind,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<String>, Report<WebhookError>> {
        let _guard = self.write()?;
        self.keys().purge_retained_keys(kind, older_than)
    }

    /// # Errors
    ///
    /// Returns [`WebhookError::Storage`] if the ring cannot be read.
    pub fn list_keys(&self, kind: KeyKind) -> Result<KeyListing, Report<WebhookError>> {
        let _guard = self.read()?;
        self.keys().list_keys(kind)
    }

    // Certificate publisher

    fn fetch_certificate(
        &self,
        kind: KeyKind,
    ) -> Result<PublishedCertificate, Report<WebhookError>> {
        let ring = {
            let _guard = self.read()?;
            self.keys().load(kind)?
        };
        publish_certificate(&ring, kind)
    }

    /// # Errors
    ///
    /// Returns [`WebhookError::NotConfigured`] when no JWS key is active.
    pub fn fetch_jws_certificate(&self) -> Result<PublishedCertificate, Report<WebhookError>> {
        self.fetch_certificate(KeyKind::Jws)
    }

    /// # Errors
    ///
    /// Returns [`WebhookError::NotConfigured`] when no client key is active.
    pub fn fetch_client_certificate(&self) -> Result<PublishedCertificate, Report<WebhookError>> {
        self.fetch_certificate(KeyKind::Client)
    }

    /// Active and retained JWS public keys.
    ///
    /// # Errors
    ///
    /// Returns [`WebhookError::Storage`] if the ring cannot be read.
    pub fn fetch_jws_key_set(&self) -> Result<JwksDocument, Report<WebhookError>> {
        let ring = {
            let _guard = self.read()?;
            self.keys().load(KeyKind::Jws)?
        };
        Ok(JwksDocument::from_ring(&ring))
    }

    // Destination registry

    /// # Errors
    ///
    /// Returns [`WebhookError::InvalidDestination`] if validation fails.
    pub fn upsert_destination(
        &self,
        name: &str,
        spec: DestinationSpec,
    ) -> Result<Destination, Report<WebhookError>> {
        let _guard = self.write()?;
        self.destinations()
            .upsert_destination(name, spec, self.clock.now())
    }

    /// # Errors
    ///
    /// Returns [`WebhookError::UnknownDestination`] if `name` is not registered.
    pub fn get_destination(&self, name: &str) -> Result<Destination, Report<WebhookError>> {
        let _guard = self.read()?;
        self.destinations().get_destination(name)
    }

    /// # Errors
    ///
    /// Returns [`WebhookError::Storage`] if the listing fails.
    pub fn list_destinations(&self) -> Result<Vec<String>, Report<WebhookError>> {
        let _guard = self.read()?;
        self.destinations().list_destinations()
    }

    /// # Errors
    ///
    /// Returns [`WebhookError::Storage`] if the delete fails.
    pub fn delete_destination(&self, name: &str) -> Result<bool, Report<WebhookError>> {
        let _guard = self.write()?;
        self.destinations().delete_destination(name)
    }

    // Signer / verifier

    /// Signs `payload` for the destination `name`, optionally toward `target`.
    ///
    /// # Errors
    ///
    /// Returns [`WebhookError::UnknownDestination`],
    /// [`WebhookError::NotConfigured`] or [`WebhookError::BadRequest`] as
    /// described on [`RequestSigner::sign`].
    pub fn sign(
        &self,
        payload: &[u8],
        name: &str,
        target: Option<&str>,
    ) -> Result<SignedRequest, Report<WebhookError>> {
        let (destination, key, client_key) = {
            let _guard = self.read()?;
            let destination = self.destinations().get_destination(name)?;
            let jws_ring = self.keys().load(KeyKind::Jws)?;
            let key = active_key(&jws_ring, KeyKind::Jws)?.clone();
            let client_key = if destination.mutual_tls {
                self.keys().load(KeyKind::Client)?.active
            } else {
                None
            };
            (destination, key, client_key)
        };

        RequestSigner::new(self.settings.signing.issuer.as_str()).sign(
            payload,
            &destination,
            target,
            &key,
            client_key.as_ref(),
            self.clock.now(),
        )
    }

    /// Verifies a compact JWS over `payload` for destination `name` and
    /// records the outcome in the audit trail.
    ///
    /// # Errors
    ///
    /// Returns the rejection as [`WebhookError::UnknownDestination`],
    /// [`WebhookError::UnknownKey`], [`WebhookError::SignatureInvalid`] or
    /// [`WebhookError::EnvelopeExpired`]; storage failures pass through
    /// unrecorded.
    pub fn verify(
        &self,
        payload: &[u8],
        token: &str,
        name: &str,
    ) -> Result<VerifiedEnvelope, Report<WebhookError>> {
        let now = self.clock.now();
        let result = self.verify_at(payload, token, name, now);

        let Some(outcome) = VerificationOutcome::classify(&result) else {
            return result;
        };

        let reason = match &result {
            Ok(_) => None,
            Err(report) => {
                log::warn!(
                    "Rejected envelope for '{}': {}",
                    name,
                    report.current_context()
                );
                Some(report.current_context().kind().to_string())
            }
        };

        if self.settings.audit.enabled {
            let kid = match &result {
                Ok(verified) => Some(verified.kid.clone()),
                Err(_) => parse_compact(token).ok().and_then(|parsed| parsed.header.kid),
            };
            let record = VerificationRecord::new(name, kid, outcome, reason, now);
            // Records live under fresh keys, so the shared lock suffices. It
            // still excludes a concurrent audit purge.
            let _guard = self.read()?;
            AuditLog::new(self.storage.as_ref()).record(&record)?;
        }

        result
    }

    fn verify_at(
        &self,
        payload: &[u8],
        token: &str,
        name: &str,
        now: DateTime<Utc>,
    ) -> Result<VerifiedEnvelope, Report<WebhookError>> {
        let (destination, ring) = {
            let _guard = self.read()?;
            let destination = self.destinations().get_destination(name)?;
            let ring = self.keys().load(KeyKind::Jws)?;
            (destination, ring)
        };

        Verifier::new(&self.settings.signing).verify(payload, token, &destination, &ring, now)
    }

    // Retention

    /// Purges retained keys and audit records past their configured retention.
    ///
    /// # Errors
    ///
    /// Returns [`WebhookError::Storage`] on the first failing storage call.
    pub fn purge_expired(&self) -> Result<PurgeSummary, Report<WebhookError>> {
        let now = self.clock.now();
        let key_cutoff = retention_cutoff(now, self.settings.signing.key_retention());

        let _guard = self.write()?;
        let keys = self.keys();
        let mut summary = PurgeSummary {
            jws_keys: keys.purge_retained_keys(KeyKind::Jws, key_cutoff)?,
            client_keys: keys.purge_retained_keys(KeyKind::Client, key_cutoff)?,
            verification_records: 0,
        };

        if self.settings.audit.enabled {
            let audit_cutoff = retention_cutoff(now, self.settings.audit.retention());
            summary.verification_records =
                AuditLog::new(self.storage.as_ref()).purge(audit_cutoff)?;
        }

        Ok(summary)
    }

    /// Ids of stored verification records.
    ///
    /// # Errors
    ///
    /// Returns [`WebhookError::Storage`] if the listing fails.
    pub fn list_verification_records(&self) -> Result<Vec<String>, Report<WebhookError>> {
        let _guard = self.read()?;
        AuditLog::new(self.storage.as_ref()).list()
    }

    /// # Errors
    ///
    /// Returns [`WebhookError::Storage`] if the read fails.
    pub fn get_verification_record(
        &self,
        id: &str,
    ) -> Result<Option<VerificationRecord>, Report<WebhookError>> {
        let _guard = self.read()?;
        AuditLog::new(self.storage.as_ref()).get(id)
    }
}

fn retention_cutoff(now: DateTime<Utc>, retention: std::time::Duration) -> DateTime<Utc> {
    TimeDelta::from_std(retention)
        .ok()
        .and_then(|retention| now.checked_sub_signed(retention))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
