//! Public key publication.
//!
//! Relying parties fetch the active certificate to pin a key, or the JWKS to
//! accept any key that may still appear on in-flight envelopes (active plus
//! retained). Nothing published here ever carries private material.

use chrono::{DateTime, Utc};
use error_stack::Report;
use jose_jwk::Jwk;
use serde::{Deserialize, Serialize};

use crate::error::WebhookError;

use super::keys::KeyKind;
use super::keystore::{active_key, KeyRing};

/// Active public key of one [`KeyKind`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishedCertificate {
    pub kid: String,
    pub algorithm: String,
    pub created_at: DateTime<Utc>,
    pub certificate: Jwk,
}

/// Returns the active certificate of a ring snapshot.
///
/// # Errors
///
/// Returns [`WebhookError::NotConfigured`] when no key of `kind` is active.
pub fn publish_certificate(
    ring: &KeyRing,
    kind: KeyKind,
) -> Result<PublishedCertificate, Report<WebhookError>> {
    let key = active_key(ring, kind)?;
    Ok(PublishedCertificate {
        kid: key.kid.clone(),
        algorithm: key.algorithm.clone(),
        created_at: key.created_at,
        certificate: key.certificate.clone(),
    })
}

/// JSON Web Key Set document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JwksDocument {
    pub keys: Vec<Jwk>,
}

impl JwksDocument {
    /// Every resolvable key of the ring, active first.
    #[must_use]
    pub fn from_ring(ring: &KeyRing) -> Self {
        Self {
            keys: ring.public_keys(),
        }
    }
}
