//! Compact JWS encoding of signed envelopes.
//!
//! Header: `{"alg":"EdDSA","typ":"JWT","kid":...}`.
//! Claims: `{"iss","aud","iat","jti","sha256"}` where `sha256` is the
//! base64url digest of the request body, which travels out-of-band.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use ed25519_dalek::Signature;
use error_stack::Report;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::constants::JWS_TYPE;
use crate::error::WebhookError;

use super::keys::JWS_ALGORITHM;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub alg: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub typ: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,
}

impl Header {
    #[must_use]
    pub fn new(kid: impl Into<String>) -> Self {
        Self {
            alg: JWS_ALGORITHM.to_string(),
            typ: Some(JWS_TYPE.to_string()),
            kid: Some(kid.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub iss: String,
    pub aud: String,
    pub iat: i64,
    pub jti: String,
    /// base64url(SHA-256(payload))
    pub sha256: String,
}

/// A signed payload. Exists only for the duration of a sign or verify call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedEnvelope {
    pub payload: Vec<u8>,
    /// Compact JWS serialization.
    pub signature: String,
    pub kid: String,
    pub issued_at: i64,
}

/// A compact JWS split into its decoded parts.
#[derive(Debug, Clone)]
pub struct ParsedJws {
    pub header: Header,
    pub claims: Claims,
    pub signing_input: String,
    pub signature: Signature,
}

#[must_use]
pub fn payload_digest(payload: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(payload))
}

/// Serializes `header` and `claims` into the JWS signing input.
///
/// # Errors
///
/// Returns [`WebhookError::BadRequest`] if either part fails to serialize.
pub fn signing_input(header: &Header, claims: &Claims) -> Result<String, Report<WebhookError>> {
    let header_json = serde_json::to_vec(header).map_err(|e| {
        Report::new(WebhookError::bad_request(format!(
            "Failed to serialize JWS header: {}",
            e
        )))
    })?;
    let claims_json = serde_json::to_vec(claims).map_err(|e| {
        Report::new(WebhookError::bad_request(format!(
            "Failed to serialize JWS claims: {}",
            e
        )))
    })?;

    Ok(format!(
        "{}.{}",
        URL_SAFE_NO_PAD.encode(header_json),
        URL_SAFE_NO_PAD.encode(claims_json)
    ))
}

#[must_use]
pub fn compact(signing_input: &str, signature: &Signature) -> String {
    format!(
        "{}.{}",
        signing_input,
        URL_SAFE_NO_PAD.encode(signature.to_bytes())
    )
}

fn invalid(message: impl Into<String>) -> Report<WebhookError> {
    Report::new(WebhookError::SignatureInvalid {
        message: message.into(),
    })
}

/// Splits and decodes a compact JWS. Any structural problem is a
/// [`WebhookError::SignatureInvalid`].
///
/// # Errors
///
/// Returns [`WebhookError::SignatureInvalid`] for anything other than three
/// well-formed base64url segments with JSON header and claims and a 64-byte
/// signature.
pub fn parse_compact(token: &str) -> Result<ParsedJws, Report<WebhookError>> {
    let mut parts = token.trim().split('.');
    let (Some(header_b64), Some(claims_b64), Some(signature_b64), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(invalid("JWS must have three segments"));
    };

    let header_json = URL_SAFE_NO_PAD
        .decode(header_b64)
        .map_err(|e| invalid(format!("Failed to decode JWS header: {}", e)))?;
    let header: Header = serde_json::from_slice(&header_json)
        .map_err(|e| invalid(format!("Failed to parse JWS header: {}", e)))?;

    if header.alg != JWS_ALGORITHM {
        return Err(invalid(format!("unsupported alg '{}'", header.alg)));
    }

    let claims_json = URL_SAFE_NO_PAD
        .decode(claims_b64)
        .map_err(|e| invalid(format!("Failed to decode JWS claims: {}", e)))?;
    let claims: Claims = serde_json::from_slice(&claims_json)
        .map_err(|e| invalid(format!("Failed to parse JWS claims: {}", e)))?;

    let signature_bytes = URL_SAFE_NO_PAD
        .decode(signature_b64)
        .map_err(|e| invalid(format!("Failed to decode signature: {}", e)))?;
    let signature_array: [u8; 64] = signature_bytes
        .try_into()
        .map_err(|_| invalid("Signature must be 64 bytes"))?;

    Ok(ParsedJws {
        header,
        claims,
        signing_input: format!("{}.{}", header_b64, claims_b64),
        signature: Signature::from_bytes(&signature_array),
    })
}
