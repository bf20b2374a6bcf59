//! JWS signing keys, envelopes, signing and verification.
//!
//! Keys are Ed25519 and published as OKP JWKs. Envelopes are compact JWS with
//! `alg: EdDSA`; the payload itself is never embedded, only its SHA-256.

pub mod certificate;
pub mod envelope;
pub mod keys;
pub mod keystore;
pub mod signing;
pub mod verification;

pub use certificate::{publish_certificate, JwksDocument, PublishedCertificate};
pub use envelope::{Claims, Header, SignedEnvelope};
pub use keys::{KeyKind, Keypair, JWS_ALGORITHM};
pub use keystore::{KeyListing, KeyMaterial, KeyRing, KeyRotationResult, KeyStore, SigningKeyConfig};
pub use signing::{ClientCertificateRef, RequestSigner, SignedRequest};
pub use verification::{VerificationOutcome, VerifiedEnvelope, Verifier};
