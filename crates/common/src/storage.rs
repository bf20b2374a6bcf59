//! Storage collaborator abstraction.
//!
//! The backend treats storage as an opaque key-value store addressed by
//! slash-separated paths. Writes that must be encrypted at rest are flagged
//! with `seal_wrap` on the entry; which paths require it is declared by the
//! route table (see [`crate::router::PATHS_SPECIAL`]).

use std::collections::BTreeMap;
use std::sync::Mutex;

use error_stack::{Report, ResultExt};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::WebhookError;
use crate::router::PATHS_SPECIAL;

static PATH_SEGMENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]{0,127}$").expect("should compile segment regex")
});

/// Returns true when `segment` can be used as a single storage path segment
/// (destination names, key ids).
#[must_use]
pub fn is_valid_path_segment(segment: &str) -> bool {
    PATH_SEGMENT.is_match(segment) && !segment.contains("..")
}

/// A single stored value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageEntry {
    pub key: String,
    pub value: Vec<u8>,
    /// Request additional encryption-at-rest for this entry.
    #[serde(default)]
    pub seal_wrap: bool,
}

impl StorageEntry {
    #[must_use]
    pub fn new(key: impl Into<String>, value: Vec<u8>) -> Self {
        Self {
            key: key.into(),
            value,
            seal_wrap: false,
        }
    }

    /// Serializes `value` as JSON into a new entry, seal-wrapped when
    /// [`PATHS_SPECIAL`] requires it for `key`.
    ///
    /// # Errors
    ///
    /// Returns a [`WebhookError::Storage`] if serialization fails.
    pub fn json<T: Serialize>(
        key: impl Into<String>,
        value: &T,
    ) -> Result<Self, Report<WebhookError>> {
        let key = key.into();
        let seal_wrap = PATHS_SPECIAL.requires_seal_wrap(&key);
        let bytes = serde_json::to_vec(value)
            .change_context(WebhookError::storage("Failed to encode entry"))
            .attach(format!("key: {}", key))?;

        Ok(Self {
            key,
            value: bytes,
            seal_wrap,
        })
    }

    /// Decodes the JSON value held by this entry.
    ///
    /// # Errors
    ///
    /// Returns a [`WebhookError::Storage`] if the stored bytes are not valid JSON
    /// for `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, Report<WebhookError>> {
        serde_json::from_slice(&self.value)
            .change_context(WebhookError::storage("Failed to decode entry"))
            .attach(format!("key: {}", self.key))
    }
}

/// Path-addressed key-value store.
///
/// Implementations are expected to make each `put`/`delete` atomic per key
/// and to surface failures synchronously.
pub trait Storage: Send + Sync {
    /// Retrieve an entry, `Ok(None)` when absent.
    fn get(&self, key: &str) -> Result<Option<StorageEntry>, Report<WebhookError>>;

    /// Insert or replace an entry.
    fn put(&self, entry: StorageEntry) -> Result<(), Report<WebhookError>>;

    /// Remove an entry. Removing an absent key is not an error.
    fn delete(&self, key: &str) -> Result<(), Report<WebhookError>>;

    /// Immediate children of `prefix`, sorted. Nested prefixes are returned with a
    /// trailing `/`.
    fn list(&self, prefix: &str) -> Result<Vec<String>, Report<WebhookError>>;
}

/// Collects the immediate children of `prefix` from a sorted key iterator.
pub fn children_of<'a>(prefix: &str, keys: impl Iterator<Item = &'a str>) -> Vec<String> {
    let mut children: Vec<String> = Vec::new();
    for key in keys {
        let Some(rest) = key.strip_prefix(prefix) else {
            continue;
        };
        if rest.is_empty() {
            continue;
        }
        let child = match rest.find('/') {
            Some(idx) => &rest[..=idx],
            None => rest,
        };
        children.push(child.to_string());
    }
    children.sort();
    children.dedup();
    children
}

/// In-process storage used by tests and embedded deployments.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: Mutex<BTreeMap<String, StorageEntry>>,
}

impl MemoryStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, StorageEntry>>, Report<WebhookError>>
    {
        self.entries
            .lock()
            .map_err(|_| Report::new(WebhookError::storage("memory storage lock poisoned")))
    }
}

impl Storage for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<StorageEntry>, Report<WebhookError>> {
        Ok(self.entries()?.get(key).cloned())
    }

    fn put(&self, entry: StorageEntry) -> Result<(), Report<WebhookError>> {
        self.entries()?.insert(entry.key.clone(), entry);
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), Report<WebhookError>> {
        self.entries()?.remove(key);
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, Report<WebhookError>> {
        let entries = self.entries()?;
        Ok(children_of(prefix, entries.keys().map(String::as_str)))
    }
}
