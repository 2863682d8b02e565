//! The container store.
//!
//! A container pairs an image with a writable layer that belongs to it
//! alone. Besides names and IDs, containers can be found by the ID of their
//! layer.
//!
//! ```text
//! <graph-root>/<driver>-containers/
//! +-- containers.json
//! +-- containers.lock
//! +-- <container-id>/
//!     +-- <base64(key)>
//! ```

use std::collections::{BTreeMap, HashMap};
use std::io::ErrorKind;
use std::path::PathBuf;

use cap_std::ambient_authority;
use cap_std::fs::Dir;
use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, StorageError};
use crate::layers::create_private_dir;
use crate::records::{big_data_path, FileBasedStore, Record, Records};
use crate::util::{atomic_write, create_private_dir_at, generate_random_id};

/// A container record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Container {
    pub id: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub names: Vec<String>,

    /// ID of the image the container was created from.
    #[serde(rename = "image", default)]
    pub image_id: String,

    /// ID of the container's own read-write layer.
    #[serde(rename = "layer", default)]
    pub layer_id: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub metadata: String,

    #[serde(rename = "big-data-names", default, skip_serializing_if = "Vec::is_empty")]
    pub big_data_names: Vec<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub flags: BTreeMap<String, Value>,
}

impl Record for Container {
    fn id(&self) -> &str {
        &self.id
    }

    fn names(&self) -> &[String] {
        &self.names
    }

    fn names_mut(&mut self) -> &mut Vec<String> {
        &mut self.names
    }
}

pub(crate) struct ContainerStore {
    path: PathBuf,
    dir: Dir,
    records: Records<Container>,
    /// layer ID → container ID
    by_layer: HashMap<String, String>,
    dirty: bool,
}

impl ContainerStore {
    pub(crate) fn new(path: PathBuf) -> Result<Self> {
        create_private_dir(&path)?;
        let dir = Dir::open_ambient_dir(&path, ambient_authority())?;
        Ok(Self {
            path,
            dir,
            records: Records::default(),
            by_layer: HashMap::new(),
            dirty: false,
        })
    }

    pub(crate) fn lock_path(&self) -> PathBuf {
        self.path.join("containers.lock")
    }

    fn save(&mut self) -> Result<()> {
        self.dirty = true;
        self.records.write(&self.dir, "containers.json")
    }

    fn reindex_layers(&mut self) {
        self.by_layer = self
            .records
            .iter()
            .map(|container| (container.layer_id.clone(), container.id.clone()))
            .collect();
    }

    /// Resolve a container name, layer ID or container ID, in that order.
    pub(crate) fn resolve_id(&self, key: &str) -> Result<String> {
        self.records
            .lookup_name(key)
            .or_else(|| self.by_layer.get(key).map(String::as_str))
            .or_else(|| self.records.get(key).map(|container| container.id.as_str()))
            .map(str::to_string)
            .ok_or_else(|| StorageError::ContainerUnknown(key.to_string()))
    }

    fn container_mut(&mut self, key: &str) -> Result<&mut Container> {
        let id = self.resolve_id(key)?;
        self.records
            .get_mut(&id)
            .ok_or(StorageError::ContainerUnknown(id))
    }

    /// Record a new container.  The caller has created `layer_id` for it.
    pub(crate) fn create(
        &mut self,
        id: Option<&str>,
        names: &[String],
        image_id: &str,
        layer_id: &str,
        metadata: &str,
    ) -> Result<Container> {
        let id = match id.filter(|id| !id.is_empty()) {
            Some(id) => id.to_string(),
            None => generate_random_id(),
        };
        self.records.check_new(&id, names)?;
        let container = Container {
            id: id.clone(),
            names: names.to_vec(),
            image_id: image_id.to_string(),
            layer_id: layer_id.to_string(),
            metadata: metadata.to_string(),
            ..Default::default()
        };
        self.records.insert(container.clone());
        self.by_layer.insert(layer_id.to_string(), id.clone());
        if let Err(e) = self.save() {
            self.records.remove(&id);
            self.reindex_layers();
            return Err(e);
        }
        debug!("created container {id} with layer {layer_id}");
        Ok(container)
    }

    pub(crate) fn get(&self, key: &str) -> Result<Container> {
        let id = self.resolve_id(key)?;
        self.records
            .get(&id)
            .cloned()
            .ok_or(StorageError::ContainerUnknown(id))
    }

    pub(crate) fn containers(&self) -> Vec<Container> {
        self.records.to_vec()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Container> {
        self.records.iter()
    }

    /// Whether `layer_id` is some container's layer.
    pub(crate) fn owns_layer(&self, layer_id: &str) -> bool {
        self.by_layer.contains_key(layer_id)
    }

    /// Remove a container record and its big data.  Its layer is left alone.
    pub(crate) fn delete(&mut self, key: &str) -> Result<()> {
        let id = self.resolve_id(key)?;
        self.records.remove(&id);
        self.reindex_layers();
        self.save()?;
        match self.dir.remove_dir_all(&id) {
            Err(e) if e.kind() != ErrorKind::NotFound => return Err(e.into()),
            _ => {}
        }
        debug!("deleted container {id}");
        Ok(())
    }

    pub(crate) fn wipe(&mut self) -> Result<()> {
        for id in self.records.ids() {
            self.delete(&id)?;
        }
        Ok(())
    }

    pub(crate) fn set_names(&mut self, key: &str, names: Vec<String>) -> Result<()> {
        let id = self.resolve_id(key)?;
        self.records.set_names(&id, names);
        self.save()
    }

    pub(crate) fn metadata(&self, key: &str) -> Result<String> {
        Ok(self.get(key)?.metadata)
    }

    pub(crate) fn set_metadata(&mut self, key: &str, metadata: &str) -> Result<()> {
        self.container_mut(key)?.metadata = metadata.to_string();
        self.save()
    }

    pub(crate) fn set_flag(&mut self, key: &str, flag: &str, value: Value) -> Result<()> {
        self.container_mut(key)?.flags.insert(flag.to_string(), value);
        self.save()
    }

    pub(crate) fn clear_flag(&mut self, key: &str, flag: &str) -> Result<()> {
        self.container_mut(key)?.flags.remove(flag);
        self.save()
    }

    pub(crate) fn big_data(&self, key: &str, name: &str) -> Result<Vec<u8>> {
        let id = self.resolve_id(key)?;
        Ok(self.dir.read(big_data_path(&id, name)?)?)
    }

    pub(crate) fn big_data_names(&self, key: &str) -> Result<Vec<String>> {
        Ok(self.get(key)?.big_data_names)
    }

    pub(crate) fn set_big_data(&mut self, key: &str, name: &str, data: &[u8]) -> Result<()> {
        let id = self.resolve_id(key)?;
        let path = big_data_path(&id, name)?;
        if let Some(parent) = path.parent() {
            create_private_dir_at(&self.dir, parent)?;
        }
        atomic_write(&self.dir, &path, data)?;
        let container = self.container_mut(&id)?;
        if !container.big_data_names.iter().any(|known| known == name) {
            container.big_data_names.push(name.to_string());
            self.save()?;
        }
        Ok(())
    }
}

impl FileBasedStore for ContainerStore {
    fn load(&mut self) -> Result<()> {
        self.records = Records::read(&self.dir, "containers.json")?;
        self.reindex_layers();
        Ok(())
    }

    fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, ContainerStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ContainerStore::new(dir.path().join("test-containers")).unwrap();
        (dir, store)
    }

    #[test]
    fn test_lookup_by_layer() {
        let (_dir, mut store) = store();
        store
            .create(Some("c0"), &["web".into()], "i0", "l1", "")
            .unwrap();

        assert_eq!(store.resolve_id("web").unwrap(), "c0");
        assert_eq!(store.resolve_id("l1").unwrap(), "c0");
        assert_eq!(store.resolve_id("c0").unwrap(), "c0");
        assert!(store.owns_layer("l1"));
        assert!(!store.owns_layer("c0"));
        assert_eq!(store.get("l1").unwrap().image_id, "i0");

        let mut reloaded = ContainerStore::new(store.path.clone()).unwrap();
        reloaded.load().unwrap();
        assert_eq!(reloaded.resolve_id("l1").unwrap(), "c0");

        store.delete("web").unwrap();
        assert!(store.resolve_id("l1").is_err());
        assert!(!store.owns_layer("l1"));
        assert!(matches!(
            store.get("c0"),
            Err(StorageError::ContainerUnknown(_))
        ));
    }

    #[test]
    fn test_duplicate_name_leaves_no_record() {
        let (_dir, mut store) = store();
        store.create(Some("c0"), &["web".into()], "i0", "l1", "").unwrap();
        assert!(matches!(
            store.create(Some("c1"), &["web".into()], "i0", "l2", ""),
            Err(StorageError::DuplicateName(_))
        ));
        assert!(!store.owns_layer("l2"));
        assert_eq!(store.containers().len(), 1);
    }

    #[test]
    fn test_big_data_and_metadata() {
        let (_dir, mut store) = store();
        store.create(Some("c0"), &[], "i0", "l1", "m").unwrap();
        store.set_big_data("l1", "state", b"running").unwrap();
        assert_eq!(store.big_data("c0", "state").unwrap(), b"running");
        assert_eq!(store.big_data_names("c0").unwrap(), ["state"]);
        assert!(matches!(
            store.big_data("nope", "state"),
            Err(StorageError::ContainerUnknown(_))
        ));

        assert_eq!(store.metadata("c0").unwrap(), "m");
        store.set_metadata("c0", "n").unwrap();
        assert_eq!(store.metadata("l1").unwrap(), "n");

        store.wipe().unwrap();
        assert!(store.containers().is_empty());
        assert!(!store.dir.exists("c0"));
    }
}
