#[cfg(test)]
pub mod tests {
    use std::collections::BTreeMap;
    use std::sync::{Arc, Mutex};

    use chrono::{DateTime, Duration, TimeZone, Utc};
    use error_stack::Report;

    use crate::backend::Clock;
    use crate::destination::{Destination, DestinationRegistry, DestinationSpec, TrustAnchor};
    use crate::error::WebhookError;
    use crate::jws::keys::{KeyKind, Keypair};
    use crate::jws::keystore::{KeyMaterial, KeyStore, SigningKeyConfig};
    use crate::settings::Settings;
    use crate::storage::{MemoryStorage, Storage, StorageEntry};

    pub fn crate_test_settings_str() -> String {
        r#"
            [signing]
            issuer = "vault-webhook"
            freshness_window_secs = 300
            clock_skew_secs = 30
            key_retention_secs = 3600

            [audit]
            enabled = true
            retention_secs = 86400

            [sweep]
            enabled = false
            interval_secs = 60
            "#
        .to_string()
    }

    pub fn create_test_settings() -> Settings {
        let toml_str = crate_test_settings_str();
        Settings::from_toml(&toml_str).expect("Invalid config")
    }

    pub fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0)
            .single()
            .expect("valid timestamp")
    }

    /// Clock that only moves when told to.
    pub struct ManualClock(Mutex<DateTime<Utc>>);

    impl ManualClock {
        pub fn new(now: DateTime<Utc>) -> Arc<Self> {
            Arc::new(Self(Mutex::new(now)))
        }

        pub fn advance(&self, by: Duration) {
            let mut now = self.0.lock().expect("should lock clock");
            *now += by;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.0.lock().expect("should lock clock")
        }
    }

    /// Storage whose every call fails.
    pub struct FailingStorage;

    impl Storage for FailingStorage {
        fn get(&self, _key: &str) -> Result<Option<StorageEntry>, Report<WebhookError>> {
            Err(Report::new(WebhookError::storage("storage unavailable")))
        }

        fn put(&self, _entry: StorageEntry) -> Result<(), Report<WebhookError>> {
            Err(Report::new(WebhookError::storage("storage unavailable")))
        }

        fn delete(&self, _key: &str) -> Result<(), Report<WebhookError>> {
            Err(Report::new(WebhookError::storage("storage unavailable")))
        }

        fn list(&self, _prefix: &str) -> Result<Vec<String>, Report<WebhookError>> {
            Err(Report::new(WebhookError::storage("storage unavailable")))
        }
    }

    pub fn configured_key(kind: KeyKind) -> SigningKeyConfig {
        let storage = MemoryStorage::new();
        let store = KeyStore::new(&storage);
        store
            .configure_signing_key(kind, &KeyMaterial::default(), fixed_now())
            .expect("should configure key");
        store
            .get_active_signing_key(kind)
            .expect("should have active key")
    }

    pub fn key_config_from(keypair: &Keypair, kid: &str) -> SigningKeyConfig {
        SigningKeyConfig::new(kid.to_string(), keypair, fixed_now(), None)
    }

    pub fn jws_destination_spec(url: &str) -> DestinationSpec {
        DestinationSpec {
            url: url.to_string(),
            allowed_hosts: Vec::new(),
            trust_anchor: TrustAnchor::Jws,
            mutual_tls: false,
            metadata: BTreeMap::new(),
        }
    }

    pub fn jws_destination(name: &str, url: &str) -> Destination {
        let storage = MemoryStorage::new();
        DestinationRegistry::new(&storage)
            .upsert_destination(name, jws_destination_spec(url), fixed_now())
            .expect("should upsert destination")
    }

    pub fn public_key_destination(
        name: &str,
        url: &str,
        keypair: &Keypair,
        kid: &str,
    ) -> Destination {
        let mut spec = jws_destination_spec(url);
        spec.trust_anchor = TrustAnchor::PublicKey {
            jwk: keypair.get_jwk(kid.to_string()),
        };
        let storage = MemoryStorage::new();
        DestinationRegistry::new(&storage)
            .upsert_destination(name, spec, fixed_now())
            .expect("should upsert destination")
    }
}
