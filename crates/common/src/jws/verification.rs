//! Inbound envelope verification.
//!
//! Checks run in a fixed order: key resolution, signature, payload digest,
//! issuer and audience, then freshness. The first failure wins.

use std::time::Duration;

use chrono::{DateTime, Utc};
use derive_more::Display;
use ed25519_dalek::VerifyingKey;
use error_stack::{Report, ResultExt};
use serde::{Deserialize, Serialize};

use crate::destination::{Destination, TrustAnchor};
use crate::error::WebhookError;
use crate::settings::Signing;

use super::envelope::{parse_compact, payload_digest, Claims};
use super::keys::verifying_key_from_jwk;
use super::keystore::KeyRing;

/// Result of a successful verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifiedEnvelope {
    pub destination: String,
    pub kid: String,
    pub issued_at: i64,
    pub claims: Claims,
}

/// Lifecycle of a verification attempt. Every attempt starts `Pending` and
/// ends in exactly one terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
pub enum VerificationOutcome {
    #[display("pending")]
    Pending,
    #[display("accepted")]
    Accepted,
    #[display("rejected_signature")]
    RejectedSignature,
    #[display("rejected_expired")]
    RejectedExpired,
    #[display("rejected_unknown_destination")]
    RejectedUnknownDestination,
    #[display("rejected_unknown_key")]
    RejectedUnknownKey,
}

impl VerificationOutcome {
    /// Maps a verification result onto its terminal state.
    ///
    /// Returns `None` for failures that say nothing about the envelope itself,
    /// such as storage errors; those propagate instead of being recorded.
    #[must_use]
    pub fn classify(result: &Result<VerifiedEnvelope, Report<WebhookError>>) -> Option<Self> {
        match result {
            Ok(_) => Some(Self::Accepted),
            Err(report) => match report.current_context() {
                WebhookError::SignatureInvalid { .. } => Some(Self::RejectedSignature),
                WebhookError::EnvelopeExpired { .. } => Some(Self::RejectedExpired),
                WebhookError::UnknownDestination { .. } => Some(Self::RejectedUnknownDestination),
                WebhookError::UnknownKey { .. } => Some(Self::RejectedUnknownKey),
                _ => None,
            },
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

pub struct Verifier {
    issuer: String,
    freshness_window: i64,
    clock_skew: i64,
}

impl Verifier {
    #[must_use]
    pub fn new(signing: &Signing) -> Self {
        Self {
            issuer: signing.issuer.clone(),
            freshness_window: whole_seconds(signing.freshness_window()),
            clock_skew: whole_seconds(signing.clock_skew()),
        }
    }

    /// Verifies a compact JWS over `payload` claimed to come from or be meant
    /// for `destination`.
    ///
    /// For [`TrustAnchor::Jws`] destinations the envelope must have been issued
    /// by this backend (`iss` is the configured issuer, `aud` the destination)
    /// and the kid resolves against `ring`, active or retained. For
    /// [`TrustAnchor::PublicKey`] destinations the destination is the issuer
    /// and the kid must match the pinned key.
    ///
    /// # Errors
    ///
    /// - [`WebhookError::UnknownKey`] if the kid cannot be resolved
    /// - [`WebhookError::SignatureInvalid`] if the token is malformed, the
    ///   signature or digest does not match, or the issuer/audience is wrong
    /// - [`WebhookError::EnvelopeExpired`] if `iat` is outside the window
    pub fn verify(
        &self,
        payload: &[u8],
        token: &str,
        destination: &Destination,
        ring: &KeyRing,
        now: DateTime<Utc>,
    ) -> Result<VerifiedEnvelope, Report<WebhookError>> {
        let parsed = parse_compact(token)?;

        let kid = parsed.header.kid.clone().ok_or_else(|| {
            Report::new(WebhookError::SignatureInvalid {
                message: "JWS header has no kid".into(),
            })
        })?;

        let verifying_key = resolve_key(&kid, destination, ring)?;

        verifying_key
            .verify_strict(parsed.signing_input.as_bytes(), &parsed.signature)
            .map_err(|_| {
                Report::new(WebhookError::SignatureInvalid {
                    message: "signature does not match".into(),
                })
            })
            .attach(format!("kid: {}", kid))?;

        if parsed.claims.sha256 != payload_digest(payload) {
            return Err(Report::new(WebhookError::SignatureInvalid {
                message: "payload digest does not match".into(),
            }));
        }

        let (expected_iss, expected_aud) = match destination.trust_anchor {
            TrustAnchor::Jws => (self.issuer.as_str(), destination.name.as_str()),
            TrustAnchor::PublicKey { .. } => (destination.name.as_str(), self.issuer.as_str()),
        };
        if parsed.claims.iss != expected_iss || parsed.claims.aud != expected_aud {
            return Err(Report::new(WebhookError::SignatureInvalid {
                message: format!(
                    "envelope issued by '{}' for '{}', expected '{}' for '{}'",
                    parsed.claims.iss, parsed.claims.aud, expected_iss, expected_aud
                ),
            }));
        }

        self.check_freshness(parsed.claims.iat, now)?;

        log::debug!(
            "Verified envelope for '{}' signed with kid '{}'",
            destination.name,
            kid
        );

        Ok(VerifiedEnvelope {
            destination: destination.name.clone(),
            kid,
            issued_at: parsed.claims.iat,
            claims: parsed.claims,
        })
    }

    fn check_freshness(&self, issued_at: i64, now: DateTime<Utc>) -> Result<(), Report<WebhookError>> {
        let checked_at = now.timestamp();
        let age = checked_at.saturating_sub(issued_at);

        if age > self.freshness_window || age < -self.clock_skew {
            return Err(Report::new(WebhookError::EnvelopeExpired {
                issued_at,
                checked_at,
            }));
        }
        Ok(())
    }
}

fn whole_seconds(duration: Duration) -> i64 {
    i64::try_from(duration.as_secs()).unwrap_or(i64::MAX)
}

fn resolve_key(
    kid: &str,
    destination: &Destination,
    ring: &KeyRing,
) -> Result<VerifyingKey, Report<WebhookError>> {
    let unknown = || {
        Report::new(WebhookError::UnknownKey {
            kid: kid.to_string(),
        })
    };

    match &destination.trust_anchor {
        TrustAnchor::Jws => ring.find(kid).ok_or_else(unknown)?.verifying_key(),
        TrustAnchor::PublicKey { jwk } => {
            if destination.trust_anchor.pinned_kid() != Some(kid) {
                return Err(unknown());
            }
            verifying_key_from_jwk(jwk)
        }
    }
}
