//! Outbound request signing.
//!
//! The signer works on snapshots: the caller resolves the destination and the
//! active key(s) under the backend lock, releases it, then signs.

use chrono::{DateTime, Utc};
use ed25519_dalek::Signer as Ed25519Signer;
use error_stack::Report;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::destination::Destination;
use crate::error::WebhookError;

use super::envelope::{compact, payload_digest, signing_input, Claims, Header, SignedEnvelope};
use super::keystore::SigningKeyConfig;

/// Identifies the client certificate a transport must present for mutual TLS.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientCertificateRef {
    pub kid: String,
}

/// A signed request ready to hand to the transport.
#[derive(Debug, Clone)]
pub struct SignedRequest {
    pub destination: String,
    pub url: Url,
    pub envelope: SignedEnvelope,
    pub client_certificate: Option<ClientCertificateRef>,
}

pub struct RequestSigner {
    issuer: String,
}

impl RequestSigner {
    #[must_use]
    pub fn new(issuer: impl Into<String>) -> Self {
        Self {
            issuer: issuer.into(),
        }
    }

    /// Signs `payload` for `destination` with `key`.
    ///
    /// `target` overrides the destination url and must pass its allowlist.
    /// `client_key` is required when the destination uses mutual TLS.
    ///
    /// # Errors
    ///
    /// Returns [`WebhookError::BadRequest`] if `target` is not allowed,
    /// [`WebhookError::NotConfigured`] if mutual TLS is required but no client key
    /// is available, [`WebhookError::Storage`] if the key snapshot is corrupt.
    pub fn sign(
        &self,
        payload: &[u8],
        destination: &Destination,
        target: Option<&str>,
        key: &SigningKeyConfig,
        client_key: Option<&SigningKeyConfig>,
        issued_at: DateTime<Utc>,
    ) -> Result<SignedRequest, Report<WebhookError>> {
        let url = resolve_target(destination, target)?;

        let client_certificate = if destination.mutual_tls {
            let client_key = client_key.ok_or_else(|| {
                Report::new(WebhookError::NotConfigured {
                    message: format!(
                        "destination '{}' requires mutual TLS but no client key is configured",
                        destination.name
                    ),
                })
            })?;
            Some(ClientCertificateRef {
                kid: client_key.kid.clone(),
            })
        } else {
            None
        };

        let header = Header::new(key.kid.clone());
        let claims = Claims {
            iss: self.issuer.clone(),
            aud: destination.name.clone(),
            iat: issued_at.timestamp(),
            jti: uuid::Uuid::new_v4().to_string(),
            sha256: payload_digest(payload),
        };

        let envelope = sign_claims(payload, &header, &claims, key)?;

        log::debug!(
            "Signed {} byte payload for '{}' with kid '{}'",
            payload.len(),
            destination.name,
            key.kid
        );

        Ok(SignedRequest {
            destination: destination.name.clone(),
            url,
            envelope,
            client_certificate,
        })
    }
}

/// Signs arbitrary claims with `key`.
///
/// # Errors
///
/// Returns [`WebhookError::Storage`] if the stored key cannot be decoded.
pub fn sign_claims(
    payload: &[u8],
    header: &Header,
    claims: &Claims,
    key: &SigningKeyConfig,
) -> Result<SignedEnvelope, Report<WebhookError>> {
    let signing_key = key.signing_key()?;
    let input = signing_input(header, claims)?;
    let signature = signing_key.sign(input.as_bytes());

    Ok(SignedEnvelope {
        payload: payload.to_vec(),
        signature: compact(&input, &signature),
        kid: key.kid.clone(),
        issued_at: claims.iat,
    })
}

fn resolve_target(
    destination: &Destination,
    target: Option<&str>,
) -> Result<Url, Report<WebhookError>> {
    let raw = target.unwrap_or(destination.url.as_str());
    let url = Url::parse(raw).map_err(|e| {
        Report::new(WebhookError::bad_request(format!(
            "invalid target url '{}': {}",
            raw, e
        )))
    })?;

    if !destination.allows_url(&url) {
        return Err(Report::new(WebhookError::bad_request(format!(
            "target host is not allowed for destination '{}'",
            destination.name
        ))));
    }

    Ok(url)
}

#[cfg(test)]
mod tests {
    use ed25519_dalek::Verifier;

    use super::*;
    use crate::jws::envelope::parse_compact;
    use crate::jws::keys::KeyKind;
    use crate::test_support::tests::{configured_key, fixed_now, jws_destination};

    #[test]
    fn test_sign_embeds_kid_and_claims() {
        let key = configured_key(KeyKind::Jws);
        let destination = jws_destination("billing", "https://billing.internal/hook");
        let signer = RequestSigner::new("vault-webhook");

        let signed = signer
            .sign(b"{\"amount\":10}", &destination, None, &key, None, fixed_now())
            .expect("should sign payload");

        assert_eq!(signed.envelope.kid, key.kid);
        assert_eq!(signed.envelope.issued_at, fixed_now().timestamp());
        assert_eq!(signed.url.as_str(), "https://billing.internal/hook");
        assert!(signed.client_certificate.is_none());

        let parsed = parse_compact(&signed.envelope.signature).expect("should parse JWS");
        assert_eq!(parsed.header.kid.as_deref(), Some(key.kid.as_str()));
        assert_eq!(parsed.claims.iss, "vault-webhook");
        assert_eq!(parsed.claims.aud, "billing");
        assert_eq!(parsed.claims.sha256, payload_digest(b"{\"amount\":10}"));

        let verifying_key = key.verifying_key().expect("should decode verifying key");
        assert!(verifying_key
            .verify(parsed.signing_input.as_bytes(), &parsed.signature)
            .is_ok());
    }

    #[test]
    fn test_sign_rejects_target_outside_allowlist() {
        let key = configured_key(KeyKind::Jws);
        let destination = jws_destination("billing", "https://billing.internal/hook");
        let signer = RequestSigner::new("vault-webhook");

        let err = signer
            .sign(
                b"x",
                &destination,
                Some("https://attacker.example.com/"),
                &key,
                None,
                fixed_now(),
            )
            .expect_err("foreign host should be rejected");
        assert!(matches!(
            err.current_context(),
            WebhookError::BadRequest { .. }
        ));

        let signed = signer
            .sign(
                b"x",
                &destination,
                Some("https://billing.internal/other"),
                &key,
                None,
                fixed_now(),
            )
            .expect("same host should be allowed");
        assert_eq!(signed.url.path(), "/other");
    }

    #[test]
    fn test_mutual_tls_requires_client_key() {
        let key = configured_key(KeyKind::Jws);
        let client = configured_key(KeyKind::Client);
        let mut destination = jws_destination("billing", "https://billing.internal/hook");
        destination.mutual_tls = true;
        let signer = RequestSigner::new("vault-webhook");

        let err = signer
            .sign(b"x", &destination, None, &key, None, fixed_now())
            .expect_err("missing client key should fail");
        assert!(matches!(
            err.current_context(),
            WebhookError::NotConfigured { .. }
        ));

        let signed = signer
            .sign(b"x", &destination, None, &key, Some(&client), fixed_now())
            .expect("should sign with client cert");
        assert_eq!(
            signed.client_certificate,
            Some(ClientCertificateRef {
                kid: client.kid.clone()
            })
        );
    }

    #[test]
    fn test_signatures_use_unique_jti() {
        let key = configured_key(KeyKind::Jws);
        let destination = jws_destination("billing", "https://billing.internal/hook");
        let signer = RequestSigner::new("vault-webhook");

        let a = signer
            .sign(b"same", &destination, None, &key, None, fixed_now())
            .expect("first signature");
        let b = signer
            .sign(b"same", &destination, None, &key, None, fixed_now())
            .expect("second signature");

        let a = parse_compact(&a.envelope.signature).expect("parse first");
        let b = parse_compact(&b.envelope.signature).expect("parse second");
        assert_ne!(a.claims.jti, b.claims.jti);
    }
}
