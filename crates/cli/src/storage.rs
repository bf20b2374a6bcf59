//! File-backed storage for operator use.
//!
//! Each key is persisted as one JSON file under the storage root, at the key's
//! path with a `.json` suffix. The file records the seal-wrap flag next to the
//! base64 value so the intent survives between runs.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use base64::{engine::general_purpose, Engine as _};
use error_stack::{Report, ResultExt};
use serde::{Deserialize, Serialize};
use vault_webhook_common::error::WebhookError;
use vault_webhook_common::storage::{children_of, Storage, StorageEntry};

const FILE_SUFFIX: &str = ".json";

#[derive(Debug, Serialize, Deserialize)]
struct FileRecord {
    seal_wrap: bool,
    value: String,
}

fn storage_error(message: impl Into<String>) -> WebhookError {
    WebhookError::Storage {
        message: message.into(),
    }
}

/// Directory part of a list prefix. Listing walks only this subtree.
fn list_base(prefix: &str) -> Result<&str, Report<WebhookError>> {
    let base = prefix.rfind('/').map_or("", |idx| &prefix[..=idx]);
    if base.contains('\\') || base.split('/').any(|segment| segment == "." || segment == "..") {
        return Err(Report::new(storage_error(format!(
            "Invalid storage prefix: {}",
            prefix
        ))));
    }
    Ok(base)
}

#[derive(Debug, Clone)]
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    /// Opens (creating if needed) a storage directory.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, Report<WebhookError>> {
        let root = root.into();
        fs::create_dir_all(&root)
            .change_context(storage_error("Failed to create storage directory"))
            .attach(format!("path: {}", root.display()))?;
        Ok(Self { root })
    }

    fn file_path(&self, key: &str) -> Result<PathBuf, Report<WebhookError>> {
        let valid = !key.is_empty()
            && !key.contains('\\')
            && key
                .split('/')
                .all(|segment| !segment.is_empty() && segment != "." && segment != "..");
        if !valid {
            return Err(Report::new(storage_error(format!(
                "Invalid storage key: {}",
                key
            ))));
        }
        Ok(self.root.join(format!("{}{}", key, FILE_SUFFIX)))
    }

    fn collect_keys(
        &self,
        dir: &Path,
        prefix: &str,
        keys: &mut Vec<String>,
    ) -> Result<(), Report<WebhookError>> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                return Err(Report::new(e)
                    .change_context(storage_error("Failed to read storage directory"))
                    .attach(format!("path: {}", dir.display())))
            }
        };

        for entry in entries {
            let entry = entry.change_context(storage_error("Failed to read directory entry"))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let file_type = entry
                .file_type()
                .change_context(storage_error("Failed to stat directory entry"))?;

            if file_type.is_dir() {
                self.collect_keys(&entry.path(), &format!("{}{}/", prefix, name), keys)?;
            } else if let Some(stem) = name.strip_suffix(FILE_SUFFIX) {
                keys.push(format!("{}{}", prefix, stem));
            }
        }
        Ok(())
    }
}

impl Storage for FileStorage {
    fn get(&self, key: &str) -> Result<Option<StorageEntry>, Report<WebhookError>> {
        let path = self.file_path(key)?;
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(Report::new(e)
                    .change_context(storage_error("Failed to read entry"))
                    .attach(format!("key: {}", key)))
            }
        };

        let record: FileRecord = serde_json::from_slice(&bytes)
            .change_context(storage_error("Corrupt storage file"))
            .attach(format!("key: {}", key))?;
        let value = general_purpose::STANDARD
            .decode(record.value)
            .change_context(storage_error("Corrupt storage value"))
            .attach(format!("key: {}", key))?;

        Ok(Some(StorageEntry {
            key: key.to_string(),
            value,
            seal_wrap: record.seal_wrap,
        }))
    }

    fn put(&self, entry: StorageEntry) -> Result<(), Report<WebhookError>> {
        let path = self.file_path(&entry.key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .change_context(storage_error("Failed to create storage directory"))
                .attach(format!("key: {}", entry.key))?;
        }

        let record = FileRecord {
            seal_wrap: entry.seal_wrap,
            value: general_purpose::STANDARD.encode(&entry.value),
        };
        let bytes = serde_json::to_vec_pretty(&record)
            .change_context(storage_error("Failed to encode entry"))?;

        // Write then rename so readers never see a partial file.
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, bytes)
            .change_context(storage_error("Failed to write entry"))
            .attach(format!("key: {}", entry.key))?;
        fs::rename(&tmp, &path)
            .change_context(storage_error("Failed to commit entry"))
            .attach(format!("key: {}", entry.key))?;

        log::debug!("Stored '{}' (seal_wrap: {})", entry.key, entry.seal_wrap);
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), Report<WebhookError>> {
        let path = self.file_path(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Report::new(e)
                .change_context(storage_error("Failed to delete entry"))
                .attach(format!("key: {}", key))),
        }
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, Report<WebhookError>> {
        let base = list_base(prefix)?;
        let mut keys = Vec::new();
        self.collect_keys(&self.root.join(base), base, &mut keys)?;
        keys.sort();
        Ok(children_of(prefix, keys.iter().map(String::as_str)))
    }
}
