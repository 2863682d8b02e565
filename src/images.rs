//! The image store.
//!
//! An image is a named reference to a top layer plus arbitrary metadata and
//! "big data" blobs (manifests, configurations) stored next to the record.
//!
//! ```text
//! <graph-root>/<driver>-images/
//! +-- images.json           # Image records
//! +-- images.lock
//! +-- <image-id>/
//!     +-- <base64(key)>     # One file per big data item
//! ```

use std::collections::BTreeMap;
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

/// An image record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Image {
    pub id: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub names: Vec<String>,

    /// ID of the image's top layer.
    #[serde(rename = "layer", default)]
    pub top_layer: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub metadata: String,

    #[serde(rename = "big-data-names", default, skip_serializing_if = "Vec::is_empty")]
    pub big_data_names: Vec<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub flags: BTreeMap<String, Value>,
}

impl Record for Image {
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

pub(crate) struct ImageStore {
    path: PathBuf,
    dir: Dir,
    records: Records<Image>,
    dirty: bool,
}

impl ImageStore {
    pub(crate) fn new(path: PathBuf) -> Result<Self> {
        create_private_dir(&path)?;
        let dir = Dir::open_ambient_dir(&path, ambient_authority())?;
        Ok(Self {
            path,
            dir,
            records: Records::default(),
            dirty: false,
        })
    }

    pub(crate) fn lock_path(&self) -> PathBuf {
        self.path.join("images.lock")
    }

    fn save(&mut self) -> Result<()> {
        self.dirty = true;
        self.records.write(&self.dir, "images.json")
    }

    pub(crate) fn resolve_id(&self, key: &str) -> Result<String> {
        self.records
            .resolve(key)
            .map(str::to_string)
            .ok_or_else(|| StorageError::ImageUnknown(key.to_string()))
    }

    fn image_mut(&mut self, key: &str) -> Result<&mut Image> {
        let id = self.resolve_id(key)?;
        self.records
            .get_mut(&id)
            .ok_or(StorageError::ImageUnknown(id))
    }

    /// Record a new image.  The caller has resolved `top_layer` to a layer ID.
    pub(crate) fn create(
        &mut self,
        id: Option<&str>,
        names: &[String],
        top_layer: &str,
        metadata: &str,
    ) -> Result<Image> {
        let id = match id.filter(|id| !id.is_empty()) {
            Some(id) => id.to_string(),
            None => generate_random_id(),
        };
        self.records.check_new(&id, names)?;
        let image = Image {
            id: id.clone(),
            names: names.to_vec(),
            top_layer: top_layer.to_string(),
            metadata: metadata.to_string(),
            ..Default::default()
        };
        self.records.insert(image.clone());
        if let Err(e) = self.save() {
            self.records.remove(&id);
            return Err(e);
        }
        debug!("created image {id} on layer {top_layer}");
        Ok(image)
    }

    pub(crate) fn get(&self, key: &str) -> Result<Image> {
        self.records
            .find(key)
            .cloned()
            .ok_or_else(|| StorageError::ImageUnknown(key.to_string()))
    }

    pub(crate) fn images(&self) -> Vec<Image> {
        self.records.to_vec()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Image> {
        self.records.iter()
    }

    /// Images whose top layer is `layer`.
    pub(crate) fn by_top_layer(&self, layer: &str) -> Vec<Image> {
        self.records
            .iter()
            .filter(|image| image.top_layer == layer)
            .cloned()
            .collect()
    }

    /// Remove an image record and its big data.
    pub(crate) fn delete(&mut self, key: &str) -> Result<()> {
        let id = self.resolve_id(key)?;
        self.records.remove(&id);
        self.save()?;
        match self.dir.remove_dir_all(&id) {
            Err(e) if e.kind() != ErrorKind::NotFound => return Err(e.into()),
            _ => {}
        }
        debug!("deleted image {id}");
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
        self.image_mut(key)?.metadata = metadata.to_string();
        self.save()
    }

    pub(crate) fn set_flag(&mut self, key: &str, flag: &str, value: Value) -> Result<()> {
        self.image_mut(key)?.flags.insert(flag.to_string(), value);
        self.save()
    }

    pub(crate) fn clear_flag(&mut self, key: &str, flag: &str) -> Result<()> {
        self.image_mut(key)?.flags.remove(flag);
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
        let image = self.image_mut(&id)?;
        if !image.big_data_names.iter().any(|known| known == name) {
            image.big_data_names.push(name.to_string());
            self.save()?;
        }
        Ok(())
    }
}

impl FileBasedStore for ImageStore {
    fn load(&mut self) -> Result<()> {
        self.records = Records::read(&self.dir, "images.json")?;
        Ok(())
    }

    fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use super::*;

    fn store() -> (tempfile::TempDir, ImageStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ImageStore::new(dir.path().join("test-images")).unwrap();
        (dir, store)
    }

    #[test]
    fn test_create_and_reload() {
        let (_dir, mut store) = store();
        let image = store
            .create(Some("i0"), &["fedora".into()], "l0", "{}")
            .unwrap();
        assert_eq!(image.top_layer, "l0");

        let mut reloaded = ImageStore::new(store.path.clone()).unwrap();
        reloaded.load().unwrap();
        assert_eq!(reloaded.get("fedora").unwrap(), image);
        assert_eq!(reloaded.resolve_id("fedora").unwrap(), "i0");
        assert!(matches!(
            reloaded.resolve_id("fed"),
            Err(StorageError::ImageUnknown(_))
        ));
    }

    #[test]
    fn test_duplicates() {
        let (_dir, mut store) = store();
        store.create(Some("i0"), &["a".into()], "l0", "").unwrap();
        assert!(matches!(
            store.create(Some("i0"), &[], "l0", ""),
            Err(StorageError::DuplicateId(_))
        ));
        assert!(matches!(
            store.create(None, &["a".into()], "l0", ""),
            Err(StorageError::DuplicateName(_))
        ));
        assert_eq!(store.images().len(), 1);
    }

    #[test]
    fn test_big_data() {
        let (_dir, mut store) = store();
        store.create(Some("i0"), &["img".into()], "l0", "").unwrap();

        store.set_big_data("img", "manifest", b"{}").unwrap();
        store.set_big_data("i0", "manifest", b"{\"v\":2}").unwrap();
        store.set_big_data("i0", "config/with/slashes", b"cfg").unwrap();

        assert_eq!(store.big_data("img", "manifest").unwrap(), b"{\"v\":2}");
        assert_eq!(store.big_data("i0", "config/with/slashes").unwrap(), b"cfg");
        assert_eq!(
            store.big_data_names("i0").unwrap(),
            ["manifest", "config/with/slashes"]
        );
        assert!(matches!(
            store.set_big_data("i0", "", b""),
            Err(StorageError::InvalidArgument(_))
        ));
        assert!(matches!(
            store.set_big_data("nope", "k", b""),
            Err(StorageError::ImageUnknown(_))
        ));

        let blob = store.path.join("i0").join("bWFuaWZlc3Q=");
        assert_eq!(std::fs::read(blob).unwrap(), b"{\"v\":2}");
        let mode = std::fs::metadata(store.path.join("i0"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o700);

        store.delete("img").unwrap();
        assert!(!store.dir.exists("i0"));
        assert!(store.resolve_id("i0").is_err());
    }

    #[test]
    fn test_metadata_flags_names() {
        let (_dir, mut store) = store();
        store.create(Some("i0"), &["a".into()], "l0", "").unwrap();
        store.create(Some("i1"), &["b".into()], "l0", "").unwrap();

        store.set_metadata("a", "meta").unwrap();
        assert_eq!(store.metadata("i0").unwrap(), "meta");

        store.set_flag("i0", "pinned", Value::Bool(true)).unwrap();
        assert_eq!(store.get("i0").unwrap().flags["pinned"], Value::Bool(true));
        store.clear_flag("i0", "pinned").unwrap();
        assert!(store.get("i0").unwrap().flags.is_empty());

        store.set_names("i1", vec!["a".into(), "c".into()]).unwrap();
        assert!(store.get("i0").unwrap().names.is_empty());
        assert_eq!(store.resolve_id("a").unwrap(), "i1");
        assert_eq!(store.by_top_layer("l0").len(), 2);

        store.wipe().unwrap();
        assert!(store.images().is_empty());
    }
}
