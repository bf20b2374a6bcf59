//! Path routing for the secrets engine.
//!
//! Paths are matched against a static table into a [`Route`], then the
//! `(Route, Operation)` pair is dispatched exhaustively. Every error is
//! rendered as a JSON response; nothing escapes as a panic or a bare `Err`.

use derive_more::Display;
use error_stack::Report;
use http::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::backend::Backend;
use crate::constants::{
    CLIENT_KEY_CONFIG_PATH, JWS_KEY_CONFIG_PATH, PATH_CLIENT_CERTIFICATE, PATH_CONFIG_CLIENT,
    PATH_CONFIG_CLIENT_PURGE, PATH_CONFIG_DESTINATION, PATH_CONFIG_DESTINATIONS, PATH_CONFIG_JWS,
    PATH_CONFIG_JWS_PURGE, PATH_DESTINATION_PREFIX, PATH_JWS_CERTIFICATE, PATH_JWS_JWKS,
    PATH_SIGN_PREFIX, PATH_VERIFY, VERIFY_PREFIX,
};
use crate::endpoints;
use crate::error::{error_body, IntoHttpResponse, WebhookError};
use crate::jws::keys::KeyKind;
use crate::storage::is_valid_path_segment;

/// Storage and authentication policy by path.
#[derive(Debug, Clone, Copy)]
pub struct PathsSpecial {
    /// Paths served without a caller identity.
    pub unauthenticated: &'static [&'static str],
    /// Storage prefixes that are never replicated.
    pub local_storage: &'static [&'static str],
    /// Storage paths that must be seal-wrapped.
    pub seal_wrap_storage: &'static [&'static str],
}

pub const PATHS_SPECIAL: PathsSpecial = PathsSpecial {
    unauthenticated: &[PATH_JWS_CERTIFICATE, PATH_CLIENT_CERTIFICATE, PATH_JWS_JWKS],
    local_storage: &[VERIFY_PREFIX],
    seal_wrap_storage: &[JWS_KEY_CONFIG_PATH, CLIENT_KEY_CONFIG_PATH],
};

impl PathsSpecial {
    #[must_use]
    pub fn is_unauthenticated(&self, path: &str) -> bool {
        self.unauthenticated.contains(&path)
    }

    #[must_use]
    pub fn is_local(&self, storage_key: &str) -> bool {
        self.local_storage
            .iter()
            .any(|prefix| storage_key.starts_with(prefix))
    }

    #[must_use]
    pub fn requires_seal_wrap(&self, storage_key: &str) -> bool {
        self.seal_wrap_storage.contains(&storage_key)
    }
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    #[display("read")]
    Read,
    #[display("create")]
    Create,
    #[display("update")]
    Update,
    #[display("delete")]
    Delete,
    #[display("list")]
    List,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    ConfigKeys(KeyKind),
    PurgeKeys(KeyKind),
    Certificate(KeyKind),
    Jwks,
    ConfigDestination,
    ConfigDestinations,
    Destination(String),
    Sign(String),
    Verify,
}

impl Route {
    /// Matches a request path, ignoring leading and trailing slashes.
    #[must_use]
    pub fn match_path(path: &str) -> Option<Self> {
        let path = path.trim_matches('/');

        let route = match path {
            PATH_CONFIG_JWS => Self::ConfigKeys(KeyKind::Jws),
            PATH_CONFIG_CLIENT => Self::ConfigKeys(KeyKind::Client),
            PATH_CONFIG_JWS_PURGE => Self::PurgeKeys(KeyKind::Jws),
            PATH_CONFIG_CLIENT_PURGE => Self::PurgeKeys(KeyKind::Client),
            PATH_JWS_CERTIFICATE => Self::Certificate(KeyKind::Jws),
            PATH_CLIENT_CERTIFICATE => Self::Certificate(KeyKind::Client),
            PATH_JWS_JWKS => Self::Jwks,
            PATH_CONFIG_DESTINATION => Self::ConfigDestination,
            PATH_CONFIG_DESTINATIONS => Self::ConfigDestinations,
            PATH_VERIFY => Self::Verify,
            _ => {
                if let Some(name) = path.strip_prefix(PATH_DESTINATION_PREFIX) {
                    Self::Destination(single_segment(name)?)
                } else if let Some(name) = path.strip_prefix(PATH_SIGN_PREFIX) {
                    Self::Sign(single_segment(name)?)
                } else {
                    return None;
                }
            }
        };
        Some(route)
    }

    #[must_use]
    pub fn is_unauthenticated(&self) -> bool {
        matches!(self, Self::Certificate(_) | Self::Jwks)
    }
}

fn single_segment(name: &str) -> Option<String> {
    is_valid_path_segment(name).then(|| name.to_string())
}

/// Identity of an authenticated caller, as established by the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallerIdentity {
    pub entity_id: String,
    #[serde(default)]
    pub policies: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Request {
    pub operation: Operation,
    pub path: String,
    pub data: Map<String, Value>,
    pub caller: Option<CallerIdentity>,
}

impl Request {
    #[must_use]
    pub fn new(operation: Operation, path: impl Into<String>) -> Self {
        Self {
            operation,
            path: path.into(),
            data: Map::new(),
            caller: None,
        }
    }

    #[must_use]
    pub fn with_data(mut self, data: Map<String, Value>) -> Self {
        self.data = data;
        self
    }

    #[must_use]
    pub fn with_caller(mut self, caller: CallerIdentity) -> Self {
        self.caller = Some(caller);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub status: StatusCode,
    pub data: Value,
}

impl Response {
    #[must_use]
    pub fn ok(data: Value) -> Self {
        Self {
            status: StatusCode::OK,
            data,
        }
    }

    #[must_use]
    pub fn from_error(report: &Report<WebhookError>) -> Self {
        let error = report.current_context();
        let status = error.status_code();
        if status.is_server_error() {
            log::error!("Request failed: {:?}", report);
        } else {
            log::debug!("Request rejected: {}", error);
        }
        Self {
            status,
            data: error_body(report),
        }
    }
}

/// Routes `request` to its handler and renders the outcome.
#[must_use]
pub fn handle_request(backend: &Backend, request: Request) -> Response {
    match route_request(backend, request) {
        Ok(data) => Response::ok(data),
        Err(report) => Response::from_error(&report),
    }
}

/// Routes `request` to its handler.
///
/// # Errors
///
/// Returns [`WebhookError::UnknownPath`] for unmatched paths,
/// [`WebhookError::PermissionDenied`] when an authenticated path has no
/// caller, [`WebhookError::UnsupportedOperation`] when the path does not
/// accept the operation, or the handler's error.
pub fn route_request(backend: &Backend, request: Request) -> Result<Value, Report<WebhookError>> {
    let Request {
        operation,
        path,
        data,
        caller,
    } = request;

    let route = Route::match_path(&path).ok_or_else(|| {
        Report::new(WebhookError::UnknownPath { path: path.clone() })
    })?;

    if !route.is_unauthenticated() && caller.is_none() {
        return Err(Report::new(WebhookError::PermissionDenied {
            message: format!("'{}' requires an authenticated caller", path),
        }));
    }

    log::debug!("{} {}", operation, path);

    match (route, operation) {
        (Route::ConfigKeys(kind), Operation::Create | Operation::Update) => {
            endpoints::handle_configure_key(backend, kind, data)
        }
        (Route::ConfigKeys(kind), Operation::Read) => endpoints::handle_list_keys(backend, kind),
        (Route::PurgeKeys(kind), Operation::Create | Operation::Update) => {
            endpoints::handle_purge_keys(backend, kind, data)
        }
        (Route::Certificate(kind), Operation::Read) => {
            endpoints::handle_fetch_certificate(backend, kind)
        }
        (Route::Jwks, Operation::Read) => endpoints::handle_fetch_jwks(backend),
        (Route::ConfigDestination, Operation::Create | Operation::Update) => {
            endpoints::handle_upsert_destination(backend, data)
        }
        (Route::ConfigDestination, Operation::Read) => {
            endpoints::handle_read_destination(backend, data)
        }
        (Route::ConfigDestinations, Operation::List | Operation::Read) => {
            endpoints::handle_list_destinations(backend)
        }
        (Route::Destination(name), Operation::Read) => {
            endpoints::handle_get_destination(backend, &name)
        }
        (Route::Destination(name), Operation::Delete) => {
            endpoints::handle_delete_destination(backend, &name)
        }
        (Route::Sign(name), Operation::Create | Operation::Update) => {
            endpoints::handle_sign(backend, &name, data)
        }
        (Route::Verify, Operation::Create | Operation::Update) => {
            endpoints::handle_verify(backend, data)
        }
        (_, operation) => Err(Report::new(WebhookError::UnsupportedOperation {
            message: format!("'{}' does not support {}", path, operation),
        })),
    }
}
