//! Ed25519 key material and its JWK encoding.

use base64::{engine::general_purpose, Engine};
use chrono::{DateTime, Utc};
use derive_more::Display;
use ed25519_dalek::{SigningKey, VerifyingKey};
use error_stack::Report;
use jose_jwk::{
    jose_jwa::{Algorithm, Signing},
    Jwk, Key, Okp, OkpCurves, Parameters,
};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::constants::{CLIENT_KEY_CONFIG_PATH, JWS_KEY_CONFIG_PATH};
use crate::error::WebhookError;

/// The only JWS algorithm this backend signs with.
pub const JWS_ALGORITHM: &str = "EdDSA";

/// Which key ring an operation addresses.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyKind {
    /// Payload signing key published for relying parties.
    #[display("jws")]
    Jws,
    /// Client-auth key used for mutual TLS toward destinations.
    #[display("client")]
    Client,
}

impl KeyKind {
    /// Storage path of the key ring for this kind.
    #[must_use]
    pub fn config_path(self) -> &'static str {
        match self {
            Self::Jws => JWS_KEY_CONFIG_PATH,
            Self::Client => CLIENT_KEY_CONFIG_PATH,
        }
    }
}

pub struct Keypair {
    pub signing_key: SigningKey,
    pub verifying_key: VerifyingKey,
}

impl Keypair {
    #[must_use]
    pub fn generate() -> Self {
        let mut csprng = OsRng;

        let signing_key = SigningKey::generate(&mut csprng);
        Self::from_signing_key(signing_key)
    }

    #[must_use]
    pub fn from_signing_key(signing_key: SigningKey) -> Self {
        let verifying_key = signing_key.verifying_key();

        Self {
            signing_key,
            verifying_key,
        }
    }

    #[must_use]
    pub fn get_jwk(&self, kid: String) -> Jwk {
        public_jwk(&self.verifying_key, kid)
    }
}

/// Builds the public-only JWK for a verifying key.
#[must_use]
pub fn public_jwk(verifying_key: &VerifyingKey, kid: String) -> Jwk {
    let okp = Okp {
        crv: OkpCurves::Ed25519,
        x: verifying_key.as_bytes().to_vec().into(),
        d: None, // No private key in JWK (public only)
    };

    Jwk {
        key: Key::Okp(okp),
        prm: Parameters {
            kid: Some(kid),
            alg: Some(Algorithm::Signing(Signing::EdDsa)),
            ..Default::default()
        },
    }
}

/// Checks the algorithm tag supplied by an operator.
///
/// # Errors
///
/// Returns [`WebhookError::InvalidKeyMaterial`] for anything but `EdDSA`.
pub fn validate_algorithm(algorithm: &str) -> Result<(), Report<WebhookError>> {
    if algorithm == JWS_ALGORITHM {
        Ok(())
    } else {
        Err(Report::new(WebhookError::InvalidKeyMaterial {
            message: format!(
                "unsupported algorithm '{}', expected '{}'",
                algorithm, JWS_ALGORITHM
            ),
        }))
    }
}

/// Parses an Ed25519 seed supplied either raw (32 bytes) or base64 encoded.
///
/// # Errors
///
/// Returns [`WebhookError::InvalidKeyMaterial`] if the bytes cannot be decoded to
/// exactly 32 bytes.
pub fn parse_ed25519_signing_key(key_bytes: &[u8]) -> Result<SigningKey, Report<WebhookError>> {
    let bytes = if key_bytes.len() > 32 {
        let trimmed = trim_ascii(key_bytes);
        general_purpose::STANDARD
            .decode(trimmed)
            .or_else(|_| general_purpose::URL_SAFE_NO_PAD.decode(trimmed))
            .map_err(|_| {
                Report::new(WebhookError::InvalidKeyMaterial {
                    message: "Failed to decode base64 key".into(),
                })
            })?
    } else {
        key_bytes.to_vec()
    };

    let key_array: [u8; 32] = bytes.try_into().map_err(|_| {
        Report::new(WebhookError::InvalidKeyMaterial {
            message: "Invalid key length (expected 32 bytes for Ed25519)".into(),
        })
    })?;

    Ok(SigningKey::from_bytes(&key_array))
}

fn trim_ascii(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |idx| idx + 1);
    &bytes[start..end]
}

/// Extracts the Ed25519 verifying key from a public JWK.
///
/// # Errors
///
/// Returns [`WebhookError::InvalidKeyMaterial`] when the JWK is not an Ed25519
/// OKP key, carries private material, or has a malformed `x` parameter.
pub fn verifying_key_from_jwk(jwk: &Jwk) -> Result<VerifyingKey, Report<WebhookError>> {
    let okp = match &jwk.key {
        Key::Okp(okp) => okp,
        _ => {
            return Err(Report::new(WebhookError::InvalidKeyMaterial {
                message: "JWK must be an OKP key".into(),
            }))
        }
    };

    if okp.crv != OkpCurves::Ed25519 {
        return Err(Report::new(WebhookError::InvalidKeyMaterial {
            message: "JWK curve must be Ed25519".into(),
        }));
    }

    if okp.d.is_some() {
        return Err(Report::new(WebhookError::InvalidKeyMaterial {
            message: "JWK must not contain private key material".into(),
        }));
    }

    let x: &[u8] = &okp.x;
    let verifying_key_bytes: [u8; 32] = x.try_into().map_err(|_| {
        Report::new(WebhookError::InvalidKeyMaterial {
            message: "Public key must be 32 bytes".into(),
        })
    })?;

    VerifyingKey::from_bytes(&verifying_key_bytes).map_err(|e| {
        Report::new(WebhookError::InvalidKeyMaterial {
            message: format!("Failed to create verifying key: {}", e),
        })
    })
}

/// Generates a key id of the form `<kind>-YYYYMMDD-<8 hex>`.
#[must_use]
pub fn generate_kid(kind: KeyKind, now: DateTime<Utc>) -> String {
    let mut suffix = [0u8; 4];
    OsRng.fill_bytes(&mut suffix);
    format!("{}-{}-{}", kind, now.format("%Y%m%d"), hex::encode(suffix))
}
