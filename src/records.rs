//! Shared persistence machinery for the layer, image and container stores.
//!
//! Every sub-store keeps its records as one JSON array on disk, guarded by a
//! lock file in the same directory. In memory the array lives in a
//! [`Records`] value, which owns the records and the derived id and name
//! indices; callers only ever see borrows of it, so no reference into the
//! backing vector can survive a mutation.
//!
//! Access to a sub-store goes through [`FileStore::lock`], which follows the
//! protocol every cooperating process obeys:
//!
//! 1. take the lock,
//! 2. reload from disk if another writer touched the lock file,
//! 3. mutate and save (which marks the store dirty),
//! 4. on release, write a fresh last-write token if anything was saved.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};

use base64::prelude::*;
use cap_std::fs::Dir;
use log::{trace, warn};
use serde::{de::DeserializeOwned, Serialize};

use crate::error::{Result, StorageError};
use crate::lockfile::{LockFile, LockGuard};
use crate::util::atomic_write;

/// A record kept in a [`Records`] table.
pub(crate) trait Record: Clone + Serialize + DeserializeOwned {
    fn id(&self) -> &str;
    fn names(&self) -> &[String];
    fn names_mut(&mut self) -> &mut Vec<String>;
}

/// An ordered table of records with id and name indices.
///
/// Record order is preserved across insertions and removals, and matches the
/// order of the JSON array on disk.
#[derive(Debug, Clone)]
pub(crate) struct Records<T> {
    items: Vec<T>,
    /// id → position in `items`.
    by_id: HashMap<String, usize>,
    /// name → id.
    by_name: HashMap<String, String>,
}

impl<T> Default for Records<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            by_id: HashMap::new(),
            by_name: HashMap::new(),
        }
    }
}

impl<T: Record> Records<T> {
    pub(crate) fn from_vec(items: Vec<T>) -> Self {
        let mut records = Self {
            items,
            ..Default::default()
        };
        records.reindex();
        records
    }

    /// Load a table from the JSON file `name` in `dir`.  A missing or empty file is an empty
    /// table.
    pub(crate) fn read(dir: &Dir, name: &str) -> Result<Self> {
        let data = match dir.read(name) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        if data.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self::default());
        }
        Ok(Self::from_vec(serde_json::from_slice(&data)?))
    }

    /// Atomically replace the JSON file `name` in `dir` with this table.
    pub(crate) fn write(&self, dir: &Dir, name: &str) -> Result<()> {
        let data = serde_json::to_vec(&self.items)?;
        atomic_write(dir, name, &data)?;
        trace!("wrote {} records to {name}", self.items.len());
        Ok(())
    }

    fn reindex(&mut self) {
        self.by_id.clear();
        self.by_name.clear();
        for (n, item) in self.items.iter().enumerate() {
            self.by_id.insert(item.id().to_string(), n);
            for name in item.names() {
                self.by_name.insert(name.clone(), item.id().to_string());
            }
        }
    }

    /// Map a name or an id to the canonical id.  Names win over ids.
    pub(crate) fn resolve(&self, key: &str) -> Option<&str> {
        if let Some(id) = self.by_name.get(key) {
            return Some(id.as_str());
        }
        self.by_id.get_key_value(key).map(|(id, _)| id.as_str())
    }

    /// Map a name (only) to an id.
    pub(crate) fn lookup_name(&self, name: &str) -> Option<&str> {
        self.by_name.get(name).map(String::as_str)
    }

    /// The record with this exact id.
    pub(crate) fn get(&self, id: &str) -> Option<&T> {
        self.by_id.get(id).map(|&n| &self.items[n])
    }

    /// Mutable access to a record.  Names must be changed with
    /// [`Records::set_names`] so that the indices stay in sync.
    pub(crate) fn get_mut(&mut self, id: &str) -> Option<&mut T> {
        let n = *self.by_id.get(id)?;
        Some(&mut self.items[n])
    }

    /// The record with this name or id.
    pub(crate) fn find(&self, key: &str) -> Option<&T> {
        self.get(self.resolve(key)?)
    }

    /// Check that neither `id` nor any of `names` is taken.
    pub(crate) fn check_new(&self, id: &str, names: &[String]) -> Result<()> {
        if self.by_id.contains_key(id) {
            return Err(StorageError::DuplicateId(id.to_string()));
        }
        if let Some(name) = names.iter().find(|name| self.by_name.contains_key(*name)) {
            return Err(StorageError::DuplicateName(name.clone()));
        }
        Ok(())
    }

    /// Append a record.  Callers check for collisions with [`Records::check_new`] first.
    pub(crate) fn insert(&mut self, item: T) {
        let id = item.id().to_string();
        for name in item.names() {
            self.by_name.insert(name.clone(), id.clone());
        }
        self.by_id.insert(id, self.items.len());
        self.items.push(item);
    }

    /// Remove the record with this id, returning it.
    pub(crate) fn remove(&mut self, id: &str) -> Option<T> {
        let n = *self.by_id.get(id)?;
        let item = self.items.remove(n);
        self.reindex();
        Some(item)
    }

    /// Replace a record's names.  Names held by other records are taken away
    /// from them.
    pub(crate) fn set_names(&mut self, id: &str, names: Vec<String>) -> bool {
        let Some(&n) = self.by_id.get(id) else {
            return false;
        };
        for name in &names {
            if let Some(holder) = self.by_name.get(name).filter(|holder| *holder != id) {
                let other = self.by_id[holder];
                self.items[other].names_mut().retain(|other| other != name);
            }
        }
        *self.items[n].names_mut() = names;
        self.reindex();
        true
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.items.iter_mut()
    }

    pub(crate) fn ids(&self) -> Vec<String> {
        self.items.iter().map(|item| item.id().to_string()).collect()
    }

    pub(crate) fn to_vec(&self) -> Vec<T> {
        self.items.clone()
    }
}

/// Location of the blob stored under `key` for record `id`, relative to the
/// sub-store directory.
///
/// Keys are arbitrary strings; the file name is their base64 encoding.
pub(crate) fn big_data_path(id: &str, key: &str) -> Result<PathBuf> {
    if key.is_empty() {
        return Err(StorageError::InvalidArgument(
            "big data key must not be empty".to_string(),
        ));
    }
    Ok(Path::new(id).join(BASE64_STANDARD.encode(key)))
}

/// A sub-store whose state is mirrored in files guarded by one lock file.
pub(crate) trait FileBasedStore {
    /// Discard in-memory state and re-read it from disk.
    fn load(&mut self) -> Result<()>;

    /// Report (and reset) whether anything was saved since the last call.
    fn take_dirty(&mut self) -> bool;
}

/// A sub-store together with the lock file that guards it.
#[derive(Debug)]
pub(crate) struct FileStore<S> {
    lockfile: LockFile,
    store: S,
}

impl<S: FileBasedStore> FileStore<S> {
    /// Open the lock file and perform the initial load under the lock.
    pub(crate) fn open(lock_path: &Path, store: S) -> Result<Self> {
        let mut this = Self {
            lockfile: LockFile::open(lock_path)?,
            store,
        };
        {
            let mut lock = this.lockfile.lock()?;
            lock.modified();
            let loaded = this.store.load();
            if this.store.take_dirty() {
                lock.touch()?;
            }
            loaded?;
        }
        Ok(this)
    }

    /// Lock the store, reloading it first if another writer changed it.
    pub(crate) fn lock(&mut self) -> Result<StoreGuard<'_, S>> {
        let mut lock = self.lockfile.lock()?;
        if lock.modified() {
            trace!("reloading after foreign write to {:?}", lock.path());
            if let Err(e) = self.store.load() {
                if self.store.take_dirty() {
                    lock.touch()?;
                }
                return Err(e);
            }
        }
        Ok(StoreGuard {
            lock,
            store: &mut self.store,
        })
    }
}

/// Exclusive access to a loaded sub-store.
///
/// Dropping the guard writes a new last-write token if the store saved
/// anything, then releases the lock.
#[derive(Debug)]
pub(crate) struct StoreGuard<'a, S: FileBasedStore> {
    lock: LockGuard<'a>,
    store: &'a mut S,
}

impl<S: FileBasedStore> Deref for StoreGuard<'_, S> {
    type Target = S;

    fn deref(&self) -> &S {
        self.store
    }
}

impl<S: FileBasedStore> DerefMut for StoreGuard<'_, S> {
    fn deref_mut(&mut self) -> &mut S {
        self.store
    }
}

impl<S: FileBasedStore> Drop for StoreGuard<'_, S> {
    fn drop(&mut self) {
        if self.store.take_dirty() {
            if let Err(e) = self.lock.touch() {
                warn!("updating last-write token in {:?}: {e}", self.lock.path());
            }
        }
    }
}
