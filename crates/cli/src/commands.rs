//! Operator commands.
//!
//! Every command that has a route is sent through the backend's request
//! router, so the CLI sees exactly the responses a remote caller would.
//! Retention and audit reads, which have no route, call the backend directly.
//!
//! Settings are loaded from an optional TOML file and merged with environment
//! variables prefixed with `VAULT_WEBHOOK__`.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use base64::{engine::general_purpose, Engine as _};
use error_stack::Report;
use serde_json::{json, Map, Value};
use vault_webhook_common::constants::{
    PATH_CLIENT_CERTIFICATE, PATH_CONFIG_CLIENT, PATH_CONFIG_CLIENT_PURGE,
    PATH_CONFIG_DESTINATION, PATH_CONFIG_DESTINATIONS, PATH_CONFIG_JWS, PATH_CONFIG_JWS_PURGE,
    PATH_DESTINATION_PREFIX, PATH_JWS_CERTIFICATE, PATH_JWS_JWKS, PATH_SIGN_PREFIX, PATH_VERIFY,
};
use vault_webhook_common::error::WebhookError;
use vault_webhook_common::jws::KeyKind;
use vault_webhook_common::router::{handle_request, CallerIdentity, Operation, Request, Response};
use vault_webhook_common::{Backend, Settings};

use crate::error::CliError;
use crate::storage::FileStorage;

const OPERATOR_ENTITY: &str = "whcli";
const OPERATOR_POLICY: &str = "operator";

/// Loads settings, applying environment overrides. Without a file the defaults
/// are used as the base.
pub(crate) fn load_settings(config: Option<&Path>, verbose: bool) -> Result<Settings, CliError> {
    let content = match config {
        Some(path) => {
            if verbose {
                log::info!("Loading config from: {}", path.display());
            }
            fs::read_to_string(path)?
        }
        None => String::new(),
    };

    Settings::from_toml(&content)
        .map_err(|e| CliError::Config(format!("Failed to parse and merge config: {:?}", e)))
}

pub(crate) fn open_backend(settings: Settings, storage: &Path) -> Result<Backend, CliError> {
    let storage = FileStorage::open(storage).map_err(|report| backend_error(&report))?;
    Ok(Backend::new(settings, Arc::new(storage)))
}

/// Effective settings as TOML.
pub(crate) fn show_config(settings: &Settings) -> Result<String, CliError> {
    settings
        .to_canonical_toml()
        .map_err(|e| CliError::Config(format!("Failed to serialize config: {:?}", e)))
}

fn backend_error(report: &Report<WebhookError>) -> CliError {
    let response = Response::from_error(report);
    CliError::Backend {
        status: response.status.as_u16(),
        body: response.data.to_string(),
    }
}

fn operator() -> CallerIdentity {
    CallerIdentity {
        entity_id: OPERATOR_ENTITY.to_string(),
        policies: vec![OPERATOR_POLICY.to_string()],
    }
}

fn call(
    backend: &Backend,
    operation: Operation,
    path: &str,
    data: Value,
    authenticated: bool,
) -> Result<Value, CliError> {
    let data = match data {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            return Err(CliError::Input(format!(
                "request data must be an object, got {}",
                other
            )))
        }
    };

    let mut request = Request::new(operation, path).with_data(data);
    if authenticated {
        request = request.with_caller(operator());
    }

    let response = handle_request(backend, request);
    if response.status.is_success() {
        Ok(response.data)
    } else {
        Err(CliError::Backend {
            status: response.status.as_u16(),
            body: response.data.to_string(),
        })
    }
}

fn key_paths(kind: KeyKind) -> (&'static str, &'static str, &'static str) {
    match kind {
        KeyKind::Jws => (PATH_CONFIG_JWS, PATH_CONFIG_JWS_PURGE, PATH_JWS_CERTIFICATE),
        KeyKind::Client => (
            PATH_CONFIG_CLIENT,
            PATH_CONFIG_CLIENT_PURGE,
            PATH_CLIENT_CERTIFICATE,
        ),
    }
}

/// Reads a key file. Text files are passed through as base64; anything else is
/// treated as a raw seed.
fn read_key_material(path: &Path) -> Result<String, CliError> {
    let bytes = fs::read(path)?;
    Ok(match String::from_utf8(bytes) {
        Ok(text) => text.trim().to_string(),
        Err(e) => general_purpose::STANDARD.encode(e.into_bytes()),
    })
}

// Keys

pub(crate) fn configure_key(
    backend: &Backend,
    kind: KeyKind,
    kid: Option<String>,
    material_file: Option<&Path>,
) -> Result<Value, CliError> {
    let private_key = material_file.map(read_key_material).transpose()?;
    let (config_path, _, _) = key_paths(kind);
    call(
        backend,
        Operation::Update,
        config_path,
        json!({ "kid": kid, "private_key": private_key }),
        true,
    )
}

pub(crate) fn list_keys(backend: &Backend, kind: KeyKind) -> Result<Value, CliError> {
    let (config_path, _, _) = key_paths(kind);
    call(backend, Operation::Read, config_path, Value::Null, true)
}

pub(crate) fn purge_keys(
    backend: &Backend,
    kind: KeyKind,
    older_than_secs: Option<u64>,
) -> Result<Value, CliError> {
    let (_, purge_path, _) = key_paths(kind);
    call(
        backend,
        Operation::Update,
        purge_path,
        json!({ "older_than_secs": older_than_secs }),
        true,
    )
}

/// Fetches public material the way a relying party would, without a caller.
pub(crate) fn certificate(backend: &Backend, kind: KeyKind, jwks: bool) -> Result<Value, CliError> {
    let path = match (kind, jwks) {
        (KeyKind::Jws, true) => PATH_JWS_JWKS,
        (KeyKind::Client, true) => {
            return Err(CliError::Input(
                "a key set is only published for the jws key".to_string(),
            ))
        }
        (kind, false) => key_paths(kind).2,
    };
    call(backend, Operation::Read, path, Value::Null, false)
}

// Destinations

#[derive(Debug, Default)]
pub(crate) struct DestinationArgs {
    pub url: String,
    pub allowed_hosts: Vec<String>,
    pub public_key_file: Option<std::path::PathBuf>,
    pub mutual_tls: bool,
    pub metadata: Vec<(String, String)>,
}

pub(crate) fn upsert_destination(
    backend: &Backend,
    name: &str,
    args: DestinationArgs,
) -> Result<Value, CliError> {
    let trust_anchor = match &args.public_key_file {
        Some(path) => {
            let jwk: Value = serde_json::from_str(&fs::read_to_string(path)?)?;
            json!({ "type": "public_key", "jwk": jwk })
        }
        None => json!({ "type": "jws" }),
    };
    let metadata: BTreeMap<String, String> = args.metadata.into_iter().collect();

    call(
        backend,
        Operation::Update,
        PATH_CONFIG_DESTINATION,
        json!({
            "name": name,
            "url": args.url,
            "allowed_hosts": args.allowed_hosts,
            "trust_anchor": trust_anchor,
            "mutual_tls": args.mutual_tls,
            "metadata": metadata,
        }),
        true,
    )
}

pub(crate) fn get_destination(backend: &Backend, name: &str) -> Result<Value, CliError> {
    let path = format!("{}{}", PATH_DESTINATION_PREFIX, name);
    call(backend, Operation::Read, &path, Value::Null, true)
}

pub(crate) fn delete_destination(backend: &Backend, name: &str) -> Result<Value, CliError> {
    let path = format!("{}{}", PATH_DESTINATION_PREFIX, name);
    call(backend, Operation::Delete, &path, Value::Null, true)
}

pub(crate) fn list_destinations(backend: &Backend) -> Result<Value, CliError> {
    call(
        backend,
        Operation::List,
        PATH_CONFIG_DESTINATIONS,
        Value::Null,
        true,
    )
}

// Sign / verify

pub(crate) fn sign(
    backend: &Backend,
    name: &str,
    payload_file: &Path,
    url: Option<String>,
) -> Result<Value, CliError> {
    let payload = fs::read(payload_file)?;
    let path = format!("{}{}", PATH_SIGN_PREFIX, name);
    call(
        backend,
        Operation::Update,
        &path,
        json!({
            "payload": general_purpose::STANDARD.encode(payload),
            "payload_encoding": "base64",
            "url": url,
        }),
        true,
    )
}

pub(crate) fn verify(
    backend: &Backend,
    name: &str,
    payload_file: &Path,
    signature: &str,
) -> Result<Value, CliError> {
    let payload = fs::read(payload_file)?;
    call(
        backend,
        Operation::Update,
        PATH_VERIFY,
        json!({
            "destination": name,
            "payload": general_purpose::STANDARD.encode(payload),
            "payload_encoding": "base64",
            "signature": signature.trim(),
        }),
        true,
    )
}

// Retention and audit

pub(crate) fn purge_expired(backend: &Backend) -> Result<Value, CliError> {
    let summary = backend
        .purge_expired()
        .map_err(|report| backend_error(&report))?;
    Ok(serde_json::to_value(summary)?)
}

pub(crate) fn list_audit(backend: &Backend) -> Result<Value, CliError> {
    let keys = backend
        .list_verification_records()
        .map_err(|report| backend_error(&report))?;
    Ok(json!({ "keys": keys }))
}

pub(crate) fn get_audit(backend: &Backend, id: &str) -> Result<Value, CliError> {
    match backend
        .get_verification_record(id)
        .map_err(|report| backend_error(&report))?
    {
        Some(record) => Ok(serde_json::to_value(record)?),
        None => Err(CliError::Input(format!("no verification record '{}'", id))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixture {
        dir: tempfile::TempDir,
        backend: Backend,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().expect("should create temp dir");
            let backend = open_backend(Settings::default(), &dir.path().join("store"))
                .expect("should open backend");
            Self { dir, backend }
        }

        fn reopen(&self) -> Backend {
            open_backend(Settings::default(), &self.dir.path().join("store"))
                .expect("should reopen backend")
        }

        fn write(&self, name: &str, contents: &[u8]) -> std::path::PathBuf {
            let path = self.dir.path().join(name);
            fs::write(&path, contents).expect("should write file");
            path
        }
    }

    fn crm_destination() -> DestinationArgs {
        DestinationArgs {
            url: "https://crm.example.com/hooks".to_string(),
            metadata: vec![("team".to_string(), "sales".to_string())],
            ..DestinationArgs::default()
        }
    }

    #[test]
    fn test_sign_verify_through_file_storage() {
        let fixture = Fixture::new();
        let configured = configure_key(&fixture.backend, KeyKind::Jws, None, None)
            .expect("should configure key");
        let kid = configured["kid"].as_str().expect("kid should be a string");

        upsert_destination(&fixture.backend, "crm", crm_destination())
            .expect("should upsert destination");

        let payload = fixture.write("payload.json", br#"{"event":"created"}"#);
        let signed = sign(&fixture.backend, "crm", &payload, None).expect("should sign");
        assert_eq!(signed["kid"], kid);
        let signature = signed["signature"]
            .as_str()
            .expect("signature should be a string");

        // A fresh backend over the same directory sees the persisted state.
        let reopened = fixture.reopen();
        let verified = verify(&reopened, "crm", &payload, signature).expect("should verify");
        assert_eq!(verified["verified"], true);
        assert_eq!(verified["destination"], "crm");

        let records = list_audit(&reopened).expect("should list audit records");
        let id = records["keys"][0]
            .as_str()
            .expect("record id should be a string");
        let record = get_audit(&reopened, id).expect("should read audit record");
        assert_eq!(record["outcome"], "accepted");
    }

    #[test]
    fn test_tampered_payload_is_rejected() {
        let fixture = Fixture::new();
        configure_key(&fixture.backend, KeyKind::Jws, None, None).expect("should configure key");
        upsert_destination(&fixture.backend, "crm", crm_destination())
            .expect("should upsert destination");

        let payload = fixture.write("payload.bin", b"original");
        let signed = sign(&fixture.backend, "crm", &payload, None).expect("should sign");
        let signature = signed["signature"].as_str().expect("signature");

        let tampered = fixture.write("tampered.bin", b"0riginal");
        let err = verify(&fixture.backend, "crm", &tampered, signature)
            .expect_err("tampered payload should be rejected");
        assert!(
            matches!(err, CliError::Backend { status: 401, ref body } if body.contains("signature_invalid")),
            "unexpected error: {}",
            err
        );
    }

    #[test]
    fn test_configure_key_from_material_file() {
        let fixture = Fixture::new();
        let seed = fixture.write("seed.txt", general_purpose::STANDARD.encode([7u8; 32]).as_bytes());

        let first = configure_key(
            &fixture.backend,
            KeyKind::Client,
            Some("client-a".to_string()),
            Some(&seed),
        )
        .expect("should import key");
        assert_eq!(first["kid"], "client-a");

        let raw = fixture.write("seed.bin", &[0xFFu8; 32]);
        let second = configure_key(
            &fixture.backend,
            KeyKind::Client,
            Some("client-b".to_string()),
            Some(&raw),
        )
        .expect("should import raw seed");
        assert_eq!(second["previous_kid"], "client-a");

        let listing = list_keys(&fixture.backend, KeyKind::Client).expect("should list keys");
        assert_eq!(listing["active"], "client-b");
        assert_eq!(listing["retained"], json!(["client-a"]));
    }

    #[test]
    fn test_certificates_are_public() {
        let fixture = Fixture::new();
        configure_key(&fixture.backend, KeyKind::Jws, None, None).expect("should configure key");

        let cert = certificate(&fixture.backend, KeyKind::Jws, false).expect("should fetch cert");
        assert!(cert["certificate"].get("d").is_none());

        let jwks = certificate(&fixture.backend, KeyKind::Jws, true).expect("should fetch jwks");
        assert_eq!(jwks["keys"].as_array().map(Vec::len), Some(1));

        certificate(&fixture.backend, KeyKind::Client, true)
            .expect_err("client key set should be refused");
    }

    #[test]
    fn test_destination_lifecycle() {
        let fixture = Fixture::new();
        upsert_destination(&fixture.backend, "crm", crm_destination()).expect("should upsert");
        upsert_destination(&fixture.backend, "billing", crm_destination()).expect("should upsert");

        let listed = list_destinations(&fixture.backend).expect("should list");
        assert_eq!(listed["keys"], json!(["billing", "crm"]));

        let crm = get_destination(&fixture.backend, "crm").expect("should get");
        assert_eq!(crm["metadata"]["team"], "sales");

        let deleted = delete_destination(&fixture.backend, "crm").expect("should delete");
        assert_eq!(deleted["deleted"], true);
        let again = delete_destination(&fixture.backend, "crm").expect("delete should be idempotent");
        assert_eq!(again["deleted"], false);

        let err = get_destination(&fixture.backend, "crm").expect_err("should be gone");
        assert!(matches!(err, CliError::Backend { status: 404, .. }));
    }

    #[test]
    fn test_purge_commands() {
        let fixture = Fixture::new();
        configure_key(&fixture.backend, KeyKind::Jws, None, None).expect("should configure key");
        configure_key(&fixture.backend, KeyKind::Jws, None, None).expect("should rotate key");

        // The retained key was demoted moments ago, inside both cutoffs.
        let purged = purge_keys(&fixture.backend, KeyKind::Jws, Some(3600)).expect("should purge");
        assert_eq!(purged["purged"], json!([]));

        let summary = purge_expired(&fixture.backend).expect("should sweep");
        assert_eq!(summary["jws_keys"], json!([]));
        assert_eq!(summary["verification_records"], 0);

        let listing = list_keys(&fixture.backend, KeyKind::Jws).expect("should list keys");
        assert_eq!(listing["retained"].as_array().map(Vec::len), Some(1));
    }

    #[test]
    fn test_show_config_reflects_defaults() {
        let settings = load_settings(None, false).expect("should load default settings");
        let toml = show_config(&settings).expect("should render config");
        assert!(toml.contains("[signing]"));
    }
}
