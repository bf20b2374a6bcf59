//! Verification audit trail.
//!
//! Each classified verification attempt is written to `verify/<id>`. The prefix
//! is local-only storage, so records are never replicated.

use chrono::{DateTime, Utc};
use error_stack::{Report, ResultExt};
use serde::{Deserialize, Serialize};

use crate::constants::VERIFY_PREFIX;
use crate::error::WebhookError;
use crate::jws::verification::VerificationOutcome;
use crate::storage::{is_valid_path_segment, Storage, StorageEntry};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationRecord {
    pub id: String,
    pub destination: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,
    pub outcome: VerificationOutcome,
    /// Error kind for rejected attempts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub checked_at: DateTime<Utc>,
}

impl VerificationRecord {
    #[must_use]
    pub fn new(
        destination: impl Into<String>,
        kid: Option<String>,
        outcome: VerificationOutcome,
        reason: Option<String>,
        checked_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().simple().to_string(),
            destination: destination.into(),
            kid,
            outcome,
            reason,
            checked_at,
        }
    }
}

fn record_path(id: &str) -> String {
    format!("{}{}", VERIFY_PREFIX, id)
}

pub struct AuditLog<'a> {
    storage: &'a dyn Storage,
}

impl<'a> AuditLog<'a> {
    #[must_use]
    pub fn new(storage: &'a dyn Storage) -> Self {
        Self { storage }
    }

    /// # Errors
    ///
    /// Returns a [`WebhookError::Storage`] if the write fails.
    pub fn record(&self, record: &VerificationRecord) -> Result<(), Report<WebhookError>> {
        let entry = StorageEntry::json(record_path(&record.id), record)?;
        self.storage
            .put(entry)
            .attach(format!("while writing verification record '{}'", record.id))
    }

    /// # Errors
    ///
    /// Returns a [`WebhookError::Storage`] if the listing fails.
    pub fn list(&self) -> Result<Vec<String>, Report<WebhookError>> {
        Ok(self
            .storage
            .list(VERIFY_PREFIX)
            .attach("while listing verification records")?
            .into_iter()
            .filter(|id| !id.ends_with('/'))
            .collect())
    }

    /// # Errors
    ///
    /// Returns a [`WebhookError::Storage`] if the read or decode fails.
    pub fn get(&self, id: &str) -> Result<Option<VerificationRecord>, Report<WebhookError>> {
        if !is_valid_path_segment(id) {
            return Ok(None);
        }
        self.storage
            .get(&record_path(id))
            .attach(format!("while reading verification record '{}'", id))?
            .map(|entry| entry.decode())
            .transpose()
    }

    /// Deletes records checked before `older_than`. Returns how many were removed.
    ///
    /// # Errors
    ///
    /// Returns a [`WebhookError::Storage`] if any read or delete fails.
    pub fn purge(&self, older_than: DateTime<Utc>) -> Result<usize, Report<WebhookError>> {
        let mut purged = 0;
        for id in self.list()? {
            let Some(record) = self.get(&id)? else {
                continue;
            };
            if record.checked_at < older_than {
                self.storage
                    .delete(&record_path(&id))
                    .attach(format!("while deleting verification record '{}'", id))?;
                purged += 1;
            }
        }

        if purged > 0 {
            log::info!("Purged {} verification record(s)", purged);
        }
        Ok(purged)
    }
}
