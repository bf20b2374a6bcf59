//! Request handlers behind the route table.
//!
//! Each handler decodes the request data into a typed request, calls the
//! backend and returns the JSON body of a successful response. Errors are
//! turned into responses by the router.

use base64::{engine::general_purpose, Engine};
use chrono::{DateTime, TimeDelta, Utc};
use error_stack::{Report, ResultExt};
use jose_jwk::Jwk;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::backend::Backend;
use crate::destination::DestinationSpec;
use crate::error::WebhookError;
use crate::jws::envelope::Claims;
use crate::jws::keys::KeyKind;
use crate::jws::keystore::KeyMaterial;
use crate::jws::signing::ClientCertificateRef;

fn parse_data<T: DeserializeOwned>(data: Map<String, Value>) -> Result<T, Report<WebhookError>> {
    serde_json::from_value(Value::Object(data))
        .map_err(|e| Report::new(WebhookError::bad_request(format!("Invalid request data: {}", e))))
}

fn to_json<T: Serialize>(value: &T) -> Result<Value, Report<WebhookError>> {
    serde_json::to_value(value).change_context(WebhookError::storage("Failed to serialize response"))
}

/// How a payload string in request data is encoded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadEncoding {
    #[default]
    Utf8,
    Base64,
}

impl PayloadEncoding {
    fn decode(self, payload: String) -> Result<Vec<u8>, Report<WebhookError>> {
        match self {
            Self::Utf8 => Ok(payload.into_bytes()),
            Self::Base64 => general_purpose::STANDARD.decode(payload.trim()).map_err(|e| {
                Report::new(WebhookError::bad_request(format!(
                    "payload is not valid base64: {}",
                    e
                )))
            }),
        }
    }
}

// Keys

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct ConfigureKeyRequest {
    /// Ed25519 seed, base64. Omit to generate a new key.
    #[serde(default)]
    pub private_key: Option<String>,
    #[serde(default)]
    pub algorithm: Option<String>,
    #[serde(default)]
    pub kid: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ConfigureKeyResponse {
    pub kid: String,
    pub previous_kid: Option<String>,
    pub retained_kids: Vec<String>,
    pub certificate: Jwk,
}

/// Configures (or rotates) the key of `kind`.
///
/// # Errors
///
/// Returns [`WebhookError::BadRequest`] for malformed data and whatever
/// [`Backend::configure_signing_key`] returns.
pub fn handle_configure_key(
    backend: &Backend,
    kind: KeyKind,
    data: Map<String, Value>,
) -> Result<Value, Report<WebhookError>> {
    let request: ConfigureKeyRequest = parse_data(data)?;
    let material = KeyMaterial {
        private_key: request.private_key.map(String::into_bytes),
        algorithm: request.algorithm,
        kid: request.kid,
    };

    let result = backend.configure_signing_key(kind, &material)?;

    to_json(&ConfigureKeyResponse {
        kid: result.new_kid,
        previous_kid: result.previous_kid,
        retained_kids: result.retained_kids,
        certificate: result.jwk,
    })
}

/// # Errors
///
/// Returns [`WebhookError::Storage`] if the ring cannot be read.
pub fn handle_list_keys(backend: &Backend, kind: KeyKind) -> Result<Value, Report<WebhookError>> {
    to_json(&backend.list_keys(kind)?)
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct PurgeKeysRequest {
    /// Absolute cutoff. Takes precedence over `older_than_secs`.
    #[serde(default)]
    pub older_than: Option<DateTime<Utc>>,
    /// Cutoff relative to now. Defaults to the configured key retention.
    #[serde(default)]
    pub older_than_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct PurgeKeysResponse {
    pub purged: Vec<String>,
}

/// # Errors
///
/// Returns [`WebhookError::BadRequest`] if the cutoff is out of range.
pub fn handle_purge_keys(
    backend: &Backend,
    kind: KeyKind,
    data: Map<String, Value>,
) -> Result<Value, Report<WebhookError>> {
    let request: PurgeKeysRequest = parse_data(data)?;

    let cutoff = match request.older_than {
        Some(cutoff) => cutoff,
        None => {
            let secs = request
                .older_than_secs
                .unwrap_or(backend.settings().signing.key_retention_secs);
            i64::try_from(secs)
                .ok()
                .and_then(TimeDelta::try_seconds)
                .and_then(|age| backend.now().checked_sub_signed(age))
                .ok_or_else(|| {
                    Report::new(WebhookError::bad_request(format!(
                        "older_than_secs {} is out of range",
                        secs
                    )))
                })?
        }
    };

    let purged = backend.purge_retained_keys(kind, cutoff)?;
    to_json(&PurgeKeysResponse { purged })
}

// Certificates

/// # Errors
///
/// Returns [`WebhookError::NotConfigured`] when no key of `kind` is active.
pub fn handle_fetch_certificate(
    backend: &Backend,
    kind: KeyKind,
) -> Result<Value, Report<WebhookError>> {
    let certificate = match kind {
        KeyKind::Jws => backend.fetch_jws_certificate()?,
        KeyKind::Client => backend.fetch_client_certificate()?,
    };
    to_json(&certificate)
}

/// # Errors
///
/// Returns [`WebhookError::Storage`] if the ring cannot be read.
pub fn handle_fetch_jwks(backend: &Backend) -> Result<Value, Report<WebhookError>> {
    to_json(&backend.fetch_jws_key_set()?)
}

// Destinations

#[derive(Debug, Deserialize, Serialize)]
pub struct UpsertDestinationRequest {
    pub name: String,
    #[serde(flatten)]
    pub spec: DestinationSpec,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct NameRequest {
    pub name: String,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ListResponse {
    pub keys: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct DeleteResponse {
    pub deleted: bool,
}

/// # Errors
///
/// Returns [`WebhookError::InvalidDestination`] if validation fails.
pub fn handle_upsert_destination(
    backend: &Backend,
    data: Map<String, Value>,
) -> Result<Value, Report<WebhookError>> {
    let request: UpsertDestinationRequest = parse_data(data)?;
    to_json(&backend.upsert_destination(&request.name, request.spec)?)
}

/// Reads a destination named in the request data.
///
/// # Errors
///
/// Returns [`WebhookError::UnknownDestination`] if it is not registered.
pub fn handle_read_destination(
    backend: &Backend,
    data: Map<String, Value>,
) -> Result<Value, Report<WebhookError>> {
    let request: NameRequest = parse_data(data)?;
    handle_get_destination(backend, &request.name)
}

/// # Errors
///
/// Returns [`WebhookError::UnknownDestination`] if `name` is not registered.
pub fn handle_get_destination(backend: &Backend, name: &str) -> Result<Value, Report<WebhookError>> {
    to_json(&backend.get_destination(name)?)
}

/// # Errors
///
/// Returns [`WebhookError::Storage`] if the listing fails.
pub fn handle_list_destinations(backend: &Backend) -> Result<Value, Report<WebhookError>> {
    to_json(&ListResponse {
        keys: backend.list_destinations()?,
    })
}

/// # Errors
///
/// Returns [`WebhookError::Storage`] if the delete fails.
pub fn handle_delete_destination(
    backend: &Backend,
    name: &str,
) -> Result<Value, Report<WebhookError>> {
    to_json(&DeleteResponse {
        deleted: backend.delete_destination(name)?,
    })
}

// Sign / verify

#[derive(Debug, Deserialize, Serialize)]
pub struct SignRequest {
    pub payload: String,
    #[serde(default)]
    pub payload_encoding: PayloadEncoding,
    /// Target url; defaults to the destination url.
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct SignResponse {
    pub destination: String,
    pub url: String,
    pub signature: String,
    pub kid: String,
    pub issued_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_certificate: Option<ClientCertificateRef>,
}

/// Signs a payload for destination `name`.
///
/// # Errors
///
/// Returns the errors of [`Backend::sign`], or [`WebhookError::BadRequest`]
/// for malformed data.
pub fn handle_sign(
    backend: &Backend,
    name: &str,
    data: Map<String, Value>,
) -> Result<Value, Report<WebhookError>> {
    let request: SignRequest = parse_data(data)?;
    let payload = request.payload_encoding.decode(request.payload)?;

    let signed = backend.sign(&payload, name, request.url.as_deref())?;

    to_json(&SignResponse {
        destination: signed.destination,
        url: signed.url.to_string(),
        signature: signed.envelope.signature,
        kid: signed.envelope.kid,
        issued_at: signed.envelope.issued_at,
        client_certificate: signed.client_certificate,
    })
}

#[derive(Debug, Deserialize, Serialize)]
pub struct VerifyRequest {
    pub destination: String,
    pub payload: String,
    #[serde(default)]
    pub payload_encoding: PayloadEncoding,
    /// Compact JWS.
    pub signature: String,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct VerifyResponse {
    pub verified: bool,
    pub destination: String,
    pub kid: String,
    pub issued_at: i64,
    pub claims: Claims,
}

/// Verifies an inbound envelope. Rejections are returned as errors.
///
/// # Errors
///
/// Returns the rejection from [`Backend::verify`].
pub fn handle_verify(backend: &Backend, data: Map<String, Value>) -> Result<Value, Report<WebhookError>> {
    let request: VerifyRequest = parse_data(data)?;
    let payload = request.payload_encoding.decode(request.payload)?;

    let verified = backend.verify(&payload, &request.signature, &request.destination)?;

    to_json(&VerifyResponse {
        verified: true,
        destination: verified.destination,
        kid: verified.kid,
        issued_at: verified.issued_at,
        claims: verified.claims,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::storage::MemoryStorage;
    use crate::test_support::tests::create_test_settings;

    fn data(value: Value) -> Map<String, Value> {
        value
            .as_object()
            .cloned()
            .expect("test data should be an object")
    }

    fn backend() -> Backend {
        Backend::new(create_test_settings(), Arc::new(MemoryStorage::new()))
    }

    #[test]
    fn test_configure_key_imports_seed() {
        let backend = backend();
        let seed = general_purpose::STANDARD.encode([7u8; 32]);

        let body = handle_configure_key(
            &backend,
            KeyKind::Jws,
            data(json!({ "private_key": seed, "kid": "ops-1" })),
        )
        .expect("should configure key");

        assert_eq!(body["kid"], "ops-1");
        assert_eq!(body["certificate"]["kid"], "ops-1");
        assert!(body["certificate"].get("d").is_none());
        assert!(body.get("private_key").is_none());
    }

    #[test]
    fn test_configure_key_rejects_unknown_algorithm() {
        let err = handle_configure_key(
            &backend(),
            KeyKind::Jws,
            data(json!({ "algorithm": "RS256" })),
        )
        .expect_err("RS256 should be rejected");
        assert!(matches!(
            err.current_context(),
            WebhookError::InvalidKeyMaterial { .. }
        ));
    }

    #[test]
    fn test_destination_flow() {
        let backend = backend();
        handle_upsert_destination(
            &backend,
            data(json!({
                "name": "billing",
                "url": "https://billing.internal/hook",
                "trust_anchor": { "type": "jws" },
                "metadata": { "team": "payments" }
            })),
        )
        .expect("should upsert destination");

        let body = handle_read_destination(&backend, data(json!({ "name": "billing" })))
            .expect("should read destination");
        assert_eq!(body["url"], "https://billing.internal/hook");
        assert_eq!(body["metadata"]["team"], "payments");

        let body = handle_list_destinations(&backend).expect("should list destinations");
        assert_eq!(body["keys"], json!(["billing"]));

        let body = handle_delete_destination(&backend, "billing").expect("should delete");
        assert_eq!(body["deleted"], true);
        let body = handle_delete_destination(&backend, "billing").expect("should delete again");
        assert_eq!(body["deleted"], false);
    }

    #[test]
    fn test_sign_and_verify_with_base64_payload() {
        let backend = backend();
        handle_configure_key(&backend, KeyKind::Jws, Map::new()).expect("should configure key");
        handle_upsert_destination(
            &backend,
            data(json!({
                "name": "billing",
                "url": "https://billing.internal/hook",
                "trust_anchor": { "type": "jws" }
            })),
        )
        .expect("should upsert destination");

        let payload = general_purpose::STANDARD.encode([0u8, 159, 146, 150]);
        let signed = handle_sign(
            &backend,
            "billing",
            data(json!({ "payload": payload, "payload_encoding": "base64" })),
        )
        .expect("should sign");
        assert_eq!(signed["url"], "https://billing.internal/hook");

        let verified = handle_verify(
            &backend,
            data(json!({
                "destination": "billing",
                "payload": payload,
                "payload_encoding": "base64",
                "signature": signed["signature"],
            })),
        )
        .expect("should verify");
        assert_eq!(verified["verified"], true);
        assert_eq!(verified["kid"], signed["kid"]);
    }

    #[test]
    fn test_bad_request_data() {
        let err = handle_sign(&backend(), "billing", data(json!({ "payload": 5 })))
            .expect_err("non-string payload should fail");
        assert!(matches!(
            err.current_context(),
            WebhookError::BadRequest { .. }
        ));

        let err = handle_sign(
            &backend(),
            "billing",
            data(json!({ "payload": "%%%", "payload_encoding": "base64" })),
        )
        .expect_err("invalid base64 should fail");
        assert!(matches!(
            err.current_context(),
            WebhookError::BadRequest { .. }
        ));
    }

    #[test]
    fn test_purge_keys_with_relative_cutoff() {
        let backend = backend();
        handle_configure_key(&backend, KeyKind::Client, Map::new()).expect("first key");
        handle_configure_key(&backend, KeyKind::Client, Map::new()).expect("second key");

        let body = handle_purge_keys(&backend, KeyKind::Client, Map::new())
            .expect("should purge with default retention");
        assert_eq!(body["purged"], json!([]));

        let body = handle_purge_keys(
            &backend,
            KeyKind::Client,
            data(json!({ "older_than": "2999-01-01T00:00:00Z" })),
        )
        .expect("should purge with absolute cutoff");
        assert_eq!(body["purged"].as_array().map(Vec::len), Some(1));
    }
}
