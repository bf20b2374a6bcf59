//! Destination registry.
//!
//! A destination is a named external identity allowed to receive signed
//! traffic from the backend or to send signed traffic to it. Entries live at
//! `destination/<name>`; names are listed in lexicographic order and deleting
//! an absent name is a no-op.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use error_stack::{Report, ResultExt};
use jose_jwk::Jwk;
use serde::{Deserialize, Serialize};
use url::Url;
use validator::{Validate, ValidationError};

use crate::constants::DESTINATION_PREFIX;
use crate::error::WebhookError;
use crate::jws::keys::verifying_key_from_jwk;
use crate::storage::{is_valid_path_segment, Storage, StorageEntry};

/// Material used to check signatures exchanged with a destination.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TrustAnchor {
    /// The destination verifies with the backend's published JWS key set, and
    /// envelopes claimed for it are checked against the key store.
    Jws,
    /// The destination signs inbound envelopes with this pinned Ed25519 key.
    PublicKey { jwk: Jwk },
}

impl TrustAnchor {
    /// Kid of the pinned key, if any.
    #[must_use]
    pub fn pinned_kid(&self) -> Option<&str> {
        match self {
            Self::Jws => None,
            Self::PublicKey { jwk } => jwk.prm.kid.as_deref(),
        }
    }
}

fn validate_trust_anchor(anchor: &TrustAnchor) -> Result<(), ValidationError> {
    let TrustAnchor::PublicKey { jwk } = anchor else {
        return Ok(());
    };

    match jwk.prm.kid.as_deref() {
        Some(kid) if !kid.trim().is_empty() => {}
        _ => {
            return Err(ValidationError::new("trust_anchor")
                .with_message("public key trust anchor requires a kid".into()))
        }
    }

    verifying_key_from_jwk(jwk).map_err(|report| {
        ValidationError::new("trust_anchor").with_message(report.current_context().to_string().into())
    })?;

    Ok(())
}

fn validate_allowlist(spec: &DestinationSpec) -> Result<(), ValidationError> {
    let url = Url::parse(&spec.url).map_err(|_| {
        ValidationError::new("url").with_message("url must be absolute".into())
    })?;

    if !matches!(url.scheme(), "https" | "http") {
        return Err(ValidationError::new("url").with_message("url scheme must be http or https".into()));
    }

    let Some(host) = url.host_str() else {
        return Err(ValidationError::new("url").with_message("url must have a host".into()));
    };

    for allowed in &spec.allowed_hosts {
        if allowed.trim().is_empty() || allowed.contains('/') {
            return Err(ValidationError::new("allowed_hosts")
                .with_message(format!("invalid allowed host '{}'", allowed).into()));
        }
    }

    if !spec.allowed_hosts.is_empty() && !host_matches(&spec.allowed_hosts, host) {
        return Err(ValidationError::new("allowed_hosts")
            .with_message(format!("url host '{}' is not in allowed_hosts", host).into()));
    }

    Ok(())
}

fn host_matches(allowed_hosts: &[String], host: &str) -> bool {
    let host = host.to_ascii_lowercase();
    allowed_hosts.iter().any(|allowed| {
        let allowed = allowed.trim().to_ascii_lowercase();
        match allowed.strip_prefix("*.") {
            Some(suffix) => host
                .strip_suffix(suffix)
                .is_some_and(|rest| rest.ends_with('.') && rest.len() > 1),
            None => host == allowed,
        }
    })
}

/// Operator-supplied destination definition.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[validate(schema(function = "validate_allowlist"))]
pub struct DestinationSpec {
    #[validate(url)]
    pub url: String,
    /// Hosts signed traffic may target. Empty means the `url` host only.
    /// A leading `*.` matches any subdomain.
    #[serde(default)]
    pub allowed_hosts: Vec<String>,
    #[validate(custom(function = "validate_trust_anchor"))]
    pub trust_anchor: TrustAnchor,
    #[serde(default)]
    pub mutual_tls: bool,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Destination {
    pub name: String,
    pub url: String,
    pub allowed_hosts: Vec<String>,
    pub trust_anchor: TrustAnchor,
    pub mutual_tls: bool,
    pub metadata: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Destination {
    fn from_spec(name: &str, spec: DestinationSpec, now: DateTime<Utc>) -> Self {
        Self {
            name: name.to_string(),
            url: spec.url,
            allowed_hosts: spec
                .allowed_hosts
                .iter()
                .map(|host| host.trim().to_ascii_lowercase())
                .collect(),
            trust_anchor: spec.trust_anchor,
            mutual_tls: spec.mutual_tls,
            metadata: spec.metadata,
            created_at: now,
            updated_at: now,
        }
    }

    /// True when `url` targets a host this destination may receive traffic on.
    #[must_use]
    pub fn allows_url(&self, url: &Url) -> bool {
        let Some(host) = url.host_str() else {
            return false;
        };
        if !matches!(url.scheme(), "https" | "http") {
            return false;
        }
        if self.allowed_hosts.is_empty() {
            return Url::parse(&self.url)
                .ok()
                .and_then(|own| own.host_str().map(|h| h.eq_ignore_ascii_case(host)))
                .unwrap_or(false);
        }
        host_matches(&self.allowed_hosts, host)
    }

    /// Compares everything but timestamps.
    fn same_spec(&self, other: &Self) -> bool {
        self.url == other.url
            && self.allowed_hosts == other.allowed_hosts
            && self.mutual_tls == other.mutual_tls
            && self.metadata == other.metadata
            && serde_json::to_value(&self.trust_anchor).ok()
                == serde_json::to_value(&other.trust_anchor).ok()
    }
}

fn destination_path(name: &str) -> String {
    format!("{}{}", DESTINATION_PREFIX, name)
}

fn unknown(name: &str) -> Report<WebhookError> {
    Report::new(WebhookError::UnknownDestination {
        name: name.to_string(),
    })
}

/// Storage-backed destination registry. Locking is the caller's concern.
pub struct DestinationRegistry<'a> {
    storage: &'a dyn Storage,
}

impl<'a> DestinationRegistry<'a> {
    #[must_use]
    pub fn new(storage: &'a dyn Storage) -> Self {
        Self { storage }
    }

    /// Validates `spec` and inserts or replaces `name`. Re-submitting an
    /// identical spec leaves the stored record untouched.
    ///
    /// # Errors
    ///
    /// Returns [`WebhookError::InvalidDestination`] if the name or spec fails
    /// validation, [`WebhookError::Storage`] if persistence fails.
    pub fn upsert_destination(
        &self,
        name: &str,
        spec: DestinationSpec,
        now: DateTime<Utc>,
    ) -> Result<Destination, Report<WebhookError>> {
        if !is_valid_path_segment(name) {
            return Err(Report::new(WebhookError::InvalidDestination {
                message: format!("malformed destination name '{}'", name),
            }));
        }

        spec.validate()
            .map_err(|e| {
                Report::new(WebhookError::InvalidDestination {
                    message: e.to_string(),
                })
            })
            .attach(format!("destination: {}", name))?;

        let mut destination = Destination::from_spec(name, spec, now);

        if let Some(existing) = self.find(name)? {
            if existing.same_spec(&destination) {
                log::debug!("Destination '{}' unchanged", name);
                return Ok(existing);
            }
            destination.created_at = existing.created_at;
        }

        let entry = StorageEntry::json(destination_path(name), &destination)?;
        self.storage
            .put(entry)
            .attach(format!("while saving destination '{}'", name))?;

        log::info!("Stored destination '{}' -> {}", name, destination.url);
        Ok(destination)
    }

    fn find(&self, name: &str) -> Result<Option<Destination>, Report<WebhookError>> {
        if !is_valid_path_segment(name) {
            return Ok(None);
        }

        self.storage
            .get(&destination_path(name))
            .attach(format!("while loading destination '{}'", name))?
            .map(|entry| entry.decode())
            .transpose()
    }

    /// # Errors
    ///
    /// Returns [`WebhookError::UnknownDestination`] if `name` is not registered.
    pub fn get_destination(&self, name: &str) -> Result<Destination, Report<WebhookError>> {
        self.find(name)?.ok_or_else(|| unknown(name))
    }

    /// Registered names in lexicographic order.
    ///
    /// # Errors
    ///
    /// Returns a [`WebhookError::Storage`] if the listing fails.
    pub fn list_destinations(&self) -> Result<Vec<String>, Report<WebhookError>> {
        let mut names: Vec<String> = self
            .storage
            .list(DESTINATION_PREFIX)
            .attach("while listing destinations")?
            .into_iter()
            .filter(|name| !name.ends_with('/'))
            .collect();
        names.sort();
        Ok(names)
    }

    /// Removes `name`. Returns whether it existed; absent names are not an error.
    ///
    /// # Errors
    ///
    /// Returns a [`WebhookError::Storage`] if the delete fails.
    pub fn delete_destination(&self, name: &str) -> Result<bool, Report<WebhookError>> {
        if self.find(name)?.is_none() {
            return Ok(false);
        }

        self.storage
            .delete(&destination_path(name))
            .attach(format!("while deleting destination '{}'", name))?;

        log::info!("Deleted destination '{}'", name);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::jws::keys::Keypair;
    use crate::storage::MemoryStorage;
    use crate::test_support::tests::{fixed_now, jws_destination_spec};

    #[test]
    fn test_upsert_and_get() {
        let storage = MemoryStorage::new();
        let registry = DestinationRegistry::new(&storage);

        let stored = registry
            .upsert_destination("billing", jws_destination_spec("https://billing.internal/hook"), fixed_now())
            .expect("should upsert destination");
        assert_eq!(stored.name, "billing");

        let fetched = registry
            .get_destination("billing")
            .expect("should fetch destination");
        assert_eq!(fetched.url, "https://billing.internal/hook");
        assert!(matches!(fetched.trust_anchor, TrustAnchor::Jws));

        let entry = storage
            .get("destination/billing")
            .expect("should read storage")
            .expect("destination should be stored");
        assert!(!entry.seal_wrap);
    }

    #[test]
    fn test_get_unknown_destination() {
        let storage = MemoryStorage::new();
        let registry = DestinationRegistry::new(&storage);

        let err = registry
            .get_destination("nope")
            .expect_err("unknown destination should fail");
        assert!(matches!(
            err.current_context(),
            WebhookError::UnknownDestination { .. }
        ));

        let err = registry
            .get_destination("../config/keys/jws")
            .expect_err("path traversal should be unknown");
        assert!(matches!(
            err.current_context(),
            WebhookError::UnknownDestination { .. }
        ));
    }

    #[test]
    fn test_list_is_lexicographic() {
        let storage = MemoryStorage::new();
        let registry = DestinationRegistry::new(&storage);
        for name in ["zeta", "alpha", "mid"] {
            registry
                .upsert_destination(name, jws_destination_spec("https://example.com/"), fixed_now())
                .expect("should upsert destination");
        }

        let names = registry.list_destinations().expect("should list");
        assert_eq!(names, vec!["alpha", "mid", "zeta"]);
    }

    #[test]
    fn test_repeated_upsert_is_noop() {
        let storage = MemoryStorage::new();
        let registry = DestinationRegistry::new(&storage);
        let spec = jws_destination_spec("https://billing.internal/hook");

        let first = registry
            .upsert_destination("billing", spec.clone(), fixed_now())
            .expect("first upsert");
        let second = registry
            .upsert_destination("billing", spec, fixed_now() + Duration::hours(1))
            .expect("second upsert");

        assert_eq!(first.updated_at, second.updated_at);
        assert_eq!(
            serde_json::to_value(&first).expect("serialize first"),
            serde_json::to_value(&second).expect("serialize second")
        );
    }

    #[test]
    fn test_update_preserves_created_at() {
        let storage = MemoryStorage::new();
        let registry = DestinationRegistry::new(&storage);

        let first = registry
            .upsert_destination("billing", jws_destination_spec("https://a.example.com/"), fixed_now())
            .expect("first upsert");
        let later = fixed_now() + Duration::hours(2);
        let second = registry
            .upsert_destination("billing", jws_destination_spec("https://b.example.com/"), later)
            .expect("second upsert");

        assert_eq!(second.created_at, first.created_at);
        assert_eq!(second.updated_at, later);
        assert_eq!(second.url, "https://b.example.com/");
    }

    #[test]
    fn test_delete_is_idempotent() {
        let storage = MemoryStorage::new();
        let registry = DestinationRegistry::new(&storage);
        registry
            .upsert_destination("billing", jws_destination_spec("https://example.com/"), fixed_now())
            .expect("should upsert");
        registry
            .upsert_destination("crm", jws_destination_spec("https://crm.example.com/"), fixed_now())
            .expect("should upsert");

        assert!(registry.delete_destination("billing").expect("first delete"));
        assert!(!registry.delete_destination("billing").expect("second delete"));
        assert!(!registry.delete_destination("never-existed").expect("absent delete"));

        assert!(registry.get_destination("billing").is_err());
        assert!(registry.get_destination("crm").is_ok());
    }

    #[test]
    fn test_rejects_invalid_specs() {
        let storage = MemoryStorage::new();
        let registry = DestinationRegistry::new(&storage);

        let mut not_allowed = jws_destination_spec("https://evil.example.org/");
        not_allowed.allowed_hosts = vec!["good.example.com".into()];

        let mut no_kid = jws_destination_spec("https://example.com/");
        let mut jwk = Keypair::generate().get_jwk("k".into());
        jwk.prm.kid = None;
        no_kid.trust_anchor = TrustAnchor::PublicKey { jwk };

        let cases = [
            ("bad-url", jws_destination_spec("not a url")),
            ("bad-scheme", jws_destination_spec("ftp://example.com/")),
            ("not-allowed", not_allowed),
            ("no-kid", no_kid),
        ];

        for (name, spec) in cases {
            let err = registry
                .upsert_destination(name, spec, fixed_now())
                .expect_err("invalid spec should fail");
            assert!(
                matches!(err.current_context(), WebhookError::InvalidDestination { .. }),
                "{} should be InvalidDestination",
                name
            );
        }

        let err = registry
            .upsert_destination("bad/name", jws_destination_spec("https://example.com/"), fixed_now())
            .expect_err("malformed name should fail");
        assert!(matches!(
            err.current_context(),
            WebhookError::InvalidDestination { .. }
        ));

        assert!(registry.list_destinations().expect("should list").is_empty());
    }

    #[test]
    fn test_allows_url_respects_allowlist() {
        let storage = MemoryStorage::new();
        let registry = DestinationRegistry::new(&storage);

        let mut spec = jws_destination_spec("https://api.billing.example.com/hook");
        spec.allowed_hosts = vec!["*.billing.example.com".into(), "Legacy.Example.com".into()];
        let destination = registry
            .upsert_destination("billing", spec, fixed_now())
            .expect("should upsert");

        let allowed = |raw: &str| destination.allows_url(&Url::parse(raw).expect("valid url"));
        assert!(allowed("https://api.billing.example.com/other"));
        assert!(allowed("https://eu.billing.example.com/"));
        assert!(allowed("https://legacy.example.com/"));
        assert!(!allowed("https://billing.example.com/"));
        assert!(!allowed("https://evilbilling.example.com/"));
        assert!(!allowed("ftp://api.billing.example.com/"));

        let open = registry
            .upsert_destination("crm", jws_destination_spec("https://crm.example.com/"), fixed_now())
            .expect("should upsert");
        assert!(open.allows_url(&Url::parse("https://crm.example.com/x").expect("valid url")));
        assert!(!open.allows_url(&Url::parse("https://other.example.com/").expect("valid url")));
    }
}
