//! Error types for the webhook secrets engine.
//!
//! Every failure is reported as an [`error_stack::Report`] over
//! [`WebhookError`]. The variant is the stable kind that callers and audit
//! records match on; attachments carry the human context.

use core::error::Error;

use derive_more::Display;
use error_stack::Report;
use http::StatusCode;

#[derive(Debug, Display)]
pub enum WebhookError {
    /// Key material or algorithm failed validation.
    #[display("Invalid key material: {message}")]
    InvalidKeyMaterial { message: String },

    /// No active key of the requested kind has been configured.
    #[display("Not configured: {message}")]
    NotConfigured { message: String },

    /// The key id is neither active nor retained.
    #[display("Unknown key: {kid}")]
    UnknownKey { kid: String },

    #[display("Unknown destination: {name}")]
    UnknownDestination { name: String },

    /// Destination spec failed validation.
    #[display("Invalid destination: {message}")]
    InvalidDestination { message: String },

    #[display("Signature invalid: {message}")]
    SignatureInvalid { message: String },

    /// The envelope `iat` fell outside the freshness window.
    #[display("Envelope expired: issued at {issued_at}, checked at {checked_at}")]
    EnvelopeExpired { issued_at: i64, checked_at: i64 },

    /// Pass-through failure from the storage collaborator.
    #[display("Storage failure: {message}")]
    Storage { message: String },

    #[display("Bad request: {message}")]
    BadRequest { message: String },

    #[display("Permission denied: {message}")]
    PermissionDenied { message: String },

    #[display("Unsupported operation: {message}")]
    UnsupportedOperation { message: String },

    #[display("Unknown path: {path}")]
    UnknownPath { path: String },

    #[display("Configuration error: {message}")]
    Configuration { message: String },
}

impl Error for WebhookError {}

impl WebhookError {
    /// Short machine-readable kind, used in responses and audit records.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidKeyMaterial { .. } => "invalid_key_material",
            Self::NotConfigured { .. } => "not_configured",
            Self::UnknownKey { .. } => "unknown_key",
            Self::UnknownDestination { .. } => "unknown_destination",
            Self::InvalidDestination { .. } => "invalid_destination",
            Self::SignatureInvalid { .. } => "signature_invalid",
            Self::EnvelopeExpired { .. } => "envelope_expired",
            Self::Storage { .. } => "storage_failure",
            Self::BadRequest { .. } => "bad_request",
            Self::PermissionDenied { .. } => "permission_denied",
            Self::UnsupportedOperation { .. } => "unsupported_operation",
            Self::UnknownPath { .. } => "unknown_path",
            Self::Configuration { .. } => "configuration",
        }
    }

    pub(crate) fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    pub(crate) fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest {
            message: message.into(),
        }
    }
}

/// Maps errors onto the status codes surfaced by the request router.
pub trait IntoHttpResponse {
    /// HTTP status code for this error.
    fn status_code(&self) -> StatusCode;

    /// Message safe to show to the caller.
    fn user_message(&self) -> String;
}

impl IntoHttpResponse for WebhookError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidKeyMaterial { .. }
            | Self::InvalidDestination { .. }
            | Self::BadRequest { .. } => StatusCode::BAD_REQUEST,
            Self::NotConfigured { .. } => StatusCode::PRECONDITION_FAILED,
            Self::UnknownKey { .. } | Self::UnknownDestination { .. } | Self::UnknownPath { .. } => {
                StatusCode::NOT_FOUND
            }
            Self::SignatureInvalid { .. } | Self::EnvelopeExpired { .. } => {
                StatusCode::UNAUTHORIZED
            }
            Self::PermissionDenied { .. } => StatusCode::FORBIDDEN,
            Self::UnsupportedOperation { .. } => StatusCode::METHOD_NOT_ALLOWED,
            Self::Storage { .. } | Self::Configuration { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn user_message(&self) -> String {
        self.to_string()
    }
}

/// Builds the JSON body for an error response from a report.
#[must_use]
pub fn error_body(report: &Report<WebhookError>) -> serde_json::Value {
    let error = report.current_context();
    serde_json::json!({
        "kind": error.kind(),
        "error": error.user_message(),
    })
}
