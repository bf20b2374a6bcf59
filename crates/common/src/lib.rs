//! Webhook secrets engine.
//!
//! This crate signs outbound HTTP request payloads with JWS on behalf of
//! privileged callers, publishes the public keys relying parties verify them
//! with, and verifies inbound signed requests against a registry of allowed
//! destinations. Storage and the host's request transport are collaborators;
//! the crate owns key lifecycle, the destination registry and the JWS engine.
//!
//! # Modules
//!
//! - [`audit`]: Verification audit records under local-only storage
//! - [`backend`]: The backend object, its lock and its operations
//! - [`constants`]: Storage and route paths
//! - [`destination`]: Destination registry and trust anchors
//! - [`endpoints`]: Typed request handlers
//! - [`error`]: Error types and HTTP status mapping
//! - [`jws`]: Signing keys, JWS envelopes, signer and verifier
//! - [`router`]: Route table, path policy and request dispatch
//! - [`settings`]: Configuration management and validation
//! - [`storage`]: Storage collaborator trait and in-memory implementation
//! - [`sweep`]: Background retention sweep
//! - [`test_support`]: Testing utilities and fixtures

pub mod audit;
pub mod backend;
pub mod constants;
pub mod destination;
pub mod endpoints;
pub mod error;
pub mod jws;
pub mod router;
pub mod settings;
pub mod storage;
pub mod sweep;
pub mod test_support;

pub use backend::Backend;
pub use error::WebhookError;
pub use settings::Settings;
