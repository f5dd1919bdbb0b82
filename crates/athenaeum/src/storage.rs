use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use redb::{Database, ReadableTable, TableDefinition};

use crate::error::{AthenaeumError, Result};

const ENTRIES_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("entries");

/// Injected collaborator that owns durability. `save` replaces the entire
/// map atomically; ordering within `load` is irrelevant.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    async fn load(&self) -> Result<HashMap<String, Vec<u8>>>;
    async fn save(&self, entries: &HashMap<String, Vec<u8>>) -> Result<()>;
    async fn close(&self) -> Result<()>;

    /// Filesystem path backing this store, when there is one. Used only to
    /// name the `.corrupt` sidecar; backends with no on-disk path return
    /// `None` and corrupt entries are reported through logging alone.
    fn data_path(&self) -> Option<&Path> {
        None
    }
}

/// File-backed `StorageBackend` over a [`redb`] database. `save` is a
/// single write transaction that clears and re-populates the table, so a
/// crash mid-save leaves either the old or the new content, never a mix.
pub struct FileStorageBackend {
    db: Database,
    path: PathBuf,
}

impl FileStorageBackend {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(AthenaeumError::StacksIo)?;
        }

        let db = Database::create(&path).map_err(|e| AthenaeumError::StacksCorrupt {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        {
            let tx = db.begin_write().map_err(|e| AthenaeumError::Stacks(e.to_string()))?;
            tx.open_table(ENTRIES_TABLE)
                .map_err(|e| AthenaeumError::Stacks(e.to_string()))?;
            tx.commit().map_err(|e| AthenaeumError::Stacks(e.to_string()))?;
        }

        Ok(Self { db, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl StorageBackend for FileStorageBackend {
    async fn load(&self) -> Result<HashMap<String, Vec<u8>>> {
        let tx = self
            .db
            .begin_read()
            .map_err(|e| AthenaeumError::Stacks(e.to_string()))?;
        let table = tx
            .open_table(ENTRIES_TABLE)
            .map_err(|e| AthenaeumError::Stacks(e.to_string()))?;

        let mut entries = HashMap::new();
        let iter = table.iter().map_err(|e| AthenaeumError::Stacks(e.to_string()))?;
        for item in iter {
            let (key, value) = item.map_err(|e| AthenaeumError::Stacks(e.to_string()))?;
            entries.insert(key.value().to_string(), value.value().to_vec());
        }
        Ok(entries)
    }

    async fn save(&self, entries: &HashMap<String, Vec<u8>>) -> Result<()> {
        let tx = self
            .db
            .begin_write()
            .map_err(|e| AthenaeumError::Stacks(e.to_string()))?;
        {
            let mut table = tx
                .open_table(ENTRIES_TABLE)
                .map_err(|e| AthenaeumError::Stacks(e.to_string()))?;

            let existing_keys: Vec<String> = {
                let iter = table.iter().map_err(|e| AthenaeumError::Stacks(e.to_string()))?;
                iter.filter_map(|r| r.ok().map(|(k, _)| k.value().to_string()))
                    .collect()
            };
            for key in &existing_keys {
                table
                    .remove(key.as_str())
                    .map_err(|e| AthenaeumError::Stacks(e.to_string()))?;
            }

            for (id, bytes) in entries {
                table
                    .insert(id.as_str(), bytes.as_slice())
                    .map_err(|e| AthenaeumError::Stacks(e.to_string()))?;
            }
        }
        tx.commit().map_err(|e| AthenaeumError::Stacks(e.to_string()))?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    fn data_path(&self) -> Option<&Path> {
        Some(&self.path)
    }
}

/// Preserves a raw record that failed to decode, alongside the id it was
/// stored under and the failure reason, instead of silently discarding it.
pub fn write_corrupt_sidecar(data_path: &Path, id: &str, raw: &[u8], reason: &str) -> Result<()> {
    let sidecar_path = data_path.with_extension("corrupt");
    let mut existing = std::fs::read_to_string(&sidecar_path).unwrap_or_default();
    existing.push_str(&format!(
        "{{\"id\":{id:?},\"reason\":{reason:?},\"len\":{}}}\n",
        raw.len()
    ));
    std::fs::write(&sidecar_path, existing).map_err(AthenaeumError::StacksIo)
}
