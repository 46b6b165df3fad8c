//! Registry of the table spaces of one database directory.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use parking_lot::{MutexGuard, RwLock};
use tracing::info;
use uuid::Uuid;

use crate::error::{Result, SerialDbError};
use crate::storage::table_space::{table_space_file_name, TableSpace};
use crate::storage::PageJournal;
use crate::types::{TableSpaceId, TransId};

/// Owns every open [`TableSpace`] of a database.
pub struct TableSpaceManager {
    directory: PathBuf,
    database_id: Uuid,
    cache_pages: usize,
    spaces: RwLock<BTreeMap<TableSpaceId, Arc<TableSpace>>>,
    journal: RwLock<Option<Weak<dyn PageJournal>>>,
}

impl TableSpaceManager {
    /// Creates a database directory holding an empty table space 0.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or the file cannot be created.
    pub fn create(directory: &Path, cache_pages: usize) -> Result<Self> {
        fs::create_dir_all(directory).map_err(|e| {
            SerialDbError::StorageError(format!("failed to create {}: {e}", directory.display()))
        })?;
        let database_id = Uuid::new_v4();
        let space = TableSpace::create(directory, 0, database_id, cache_pages)?;
        Ok(Self {
            directory: directory.to_path_buf(),
            database_id,
            cache_pages,
            spaces: RwLock::new(BTreeMap::from([(0, Arc::new(space))])),
            journal: RwLock::new(None),
        })
    }

    /// Opens every `tablespace_<id>.db` file in `directory`.
    ///
    /// # Errors
    ///
    /// Returns an error if table space 0 is missing, a file cannot be
    /// opened, or the files belong to different databases.
    pub fn open(directory: &Path, cache_pages: usize) -> Result<Self> {
        let entries = fs::read_dir(directory).map_err(|e| {
            SerialDbError::InvalidDatabaseFile(format!("cannot read {}: {e}", directory.display()))
        })?;

        let mut spaces = BTreeMap::new();
        for entry in entries {
            let entry = entry.map_err(|e| SerialDbError::StorageError(e.to_string()))?;
            let name = entry.file_name();
            let Some(id) = name
                .to_str()
                .and_then(|n| n.strip_prefix("tablespace_"))
                .and_then(|n| n.strip_suffix(".db"))
                .and_then(|n| n.parse::<TableSpaceId>().ok())
            else {
                continue;
            };
            spaces.insert(id, Arc::new(TableSpace::open(&entry.path(), id, cache_pages)?));
        }

        let database_id = spaces
            .get(&0)
            .map(|space| space.database_id())
            .ok_or_else(|| {
                SerialDbError::InvalidDatabaseFile(format!(
                    "{} has no {}",
                    directory.display(),
                    table_space_file_name(0)
                ))
            })?;
        if let Some(stranger) = spaces.values().find(|s| s.database_id() != database_id) {
            return Err(SerialDbError::CorruptedDatabase(format!(
                "table space {} belongs to another database",
                stranger.id()
            )));
        }

        info!(directory = %directory.display(), table_spaces = spaces.len(), "opened table spaces");
        Ok(Self {
            directory: directory.to_path_buf(),
            database_id,
            cache_pages,
            spaces: RwLock::new(spaces),
            journal: RwLock::new(None),
        })
    }

    /// Returns the database directory.
    #[must_use]
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Returns the id shared by every table space of the database.
    #[must_use]
    pub fn database_id(&self) -> Uuid {
        self.database_id
    }

    /// Attaches a journal to every current and future table space.
    pub fn set_journal(&self, journal: Weak<dyn PageJournal>) {
        for space in self.spaces.read().values() {
            space.set_journal(journal.clone());
        }
        *self.journal.write() = Some(journal);
    }

    /// Creates a new table space file.
    ///
    /// # Errors
    ///
    /// Returns an error if the id is taken or the file cannot be created.
    pub fn create_table_space(&self, id: TableSpaceId) -> Result<Arc<TableSpace>> {
        let mut spaces = self.spaces.write();
        if spaces.contains_key(&id) {
            return Err(SerialDbError::StorageError(format!("table space {id} already exists")));
        }
        let space = Arc::new(TableSpace::create(&self.directory, id, self.database_id, self.cache_pages)?);
        if let Some(journal) = self.journal.read().clone() {
            space.set_journal(journal);
        }
        spaces.insert(id, Arc::clone(&space));
        Ok(space)
    }

    /// Looks up a table space.
    ///
    /// # Errors
    ///
    /// Returns `TableSpaceNotFound` for an unknown id.
    pub fn get(&self, id: TableSpaceId) -> Result<Arc<TableSpace>> {
        self.spaces
            .read()
            .get(&id)
            .cloned()
            .ok_or(SerialDbError::TableSpaceNotFound(id))
    }

    /// All table spaces, in id order.
    #[must_use]
    pub fn all(&self) -> Vec<Arc<TableSpace>> {
        self.spaces.read().values().cloned().collect()
    }

    /// Next transaction id hint: the highest one stored in any header.
    #[must_use]
    pub fn next_transaction_id(&self) -> TransId {
        self.spaces
            .read()
            .values()
            .map(|s| s.next_transaction_id())
            .max()
            .unwrap_or(1)
    }

    /// Records the next transaction id in table space 0.
    ///
    /// # Errors
    ///
    /// Returns an error if the header cannot be written.
    pub fn set_next_transaction_id(&self, next: TransId) -> Result<()> {
        self.get(0)?.set_next_transaction_id(next)
    }

    /// Writes every dirty page of every table space.
    ///
    /// # Errors
    ///
    /// Returns the first write failure.
    pub fn flush_all(&self) -> Result<usize> {
        let mut written = 0;
        for space in self.all() {
            written += space.flush()?;
        }
        Ok(written)
    }
}

/// Structure locks of a set of table spaces, held together.
pub struct StructureLocks<'a> {
    _guards: Vec<MutexGuard<'a, ()>>,
}

impl<'a> StructureLocks<'a> {
    /// Locks every table space in `spaces`, in order.
    #[must_use]
    pub fn acquire(spaces: &'a [Arc<TableSpace>]) -> Self {
        Self {
            _guards: spaces.iter().map(|s| s.lock_structure()).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_open_finds_every_table_space() {
        let temp_dir = TempDir::new().unwrap();
        let database_id;
        {
            let manager = TableSpaceManager::create(temp_dir.path(), 16).unwrap();
            database_id = manager.database_id();
            manager.create_table_space(3).unwrap();
            assert!(manager.create_table_space(3).is_err());
            manager.set_next_transaction_id(120).unwrap();
            manager.flush_all().unwrap();
        }

        let manager = TableSpaceManager::open(temp_dir.path(), 16).unwrap();
        assert_eq!(manager.database_id(), database_id);
        let ids: Vec<_> = manager.all().iter().map(|s| s.id()).collect();
        assert_eq!(ids, vec![0, 3]);
        assert_eq!(manager.next_transaction_id(), 120);
        assert!(matches!(manager.get(7), Err(SerialDbError::TableSpaceNotFound(7))));
    }

    #[test]
    fn test_open_requires_table_space_zero() {
        let temp_dir = TempDir::new().unwrap();
        assert!(TableSpaceManager::open(temp_dir.path(), 16).is_err());
    }
}
