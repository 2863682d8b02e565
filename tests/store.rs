use std::{
    collections::HashMap,
    fs,
    io::{self, Read},
    path::PathBuf,
    sync::Arc,
};

use anyhow::Result;
use similar_asserts::assert_eq;

use cstore::{
    Change, Driver, Entity, LayerOptions, LockFile, StorageError, Store, StoreOptions,
};

/// A driver that only keeps an empty directory per layer.
struct DirDriver {
    root: PathBuf,
}

impl Driver for DirDriver {
    fn name(&self) -> &str {
        "dir"
    }

    fn status(&self) -> Vec<(String, String)> {
        vec![]
    }

    fn create(
        &self,
        id: &str,
        _parent: Option<&str>,
        _mount_label: &str,
        _options: &HashMap<String, String>,
    ) -> io::Result<()> {
        fs::create_dir_all(self.root.join(id))
    }

    fn create_read_write(
        &self,
        id: &str,
        parent: Option<&str>,
        mount_label: &str,
        options: &HashMap<String, String>,
    ) -> io::Result<()> {
        self.create(id, parent, mount_label, options)
    }

    fn remove(&self, id: &str) -> io::Result<()> {
        fs::remove_dir_all(self.root.join(id))
    }

    fn get(&self, id: &str, _mount_label: &str) -> io::Result<PathBuf> {
        Ok(self.root.join(id))
    }

    fn put(&self, _id: &str) -> io::Result<()> {
        Err(io::ErrorKind::NotFound.into())
    }

    fn exists(&self, id: &str) -> bool {
        self.root.join(id).exists()
    }

    fn diff(&self, _id: &str, _parent: Option<&str>) -> io::Result<Box<dyn Read>> {
        Ok(Box::new(io::empty()))
    }

    fn changes(&self, _id: &str, _parent: Option<&str>) -> io::Result<Vec<Change>> {
        Ok(vec![])
    }

    fn apply_diff(&self, _id: &str, _parent: Option<&str>, diff: &mut dyn Read) -> io::Result<u64> {
        io::copy(diff, &mut io::sink())
    }

    fn diff_size(&self, _id: &str, _parent: Option<&str>) -> io::Result<u64> {
        Ok(0)
    }

    fn cleanup(&self) -> io::Result<()> {
        Ok(())
    }
}

fn open(dir: &tempfile::TempDir) -> Result<Store> {
    let options = StoreOptions {
        driver: String::new(),
        ..StoreOptions::under(dir.path())
    };
    let driver = Arc::new(DirDriver {
        root: options.graph_root.join("dir"),
    });
    Ok(Store::open(options, driver)?)
}

#[test]
fn test_layer_image_container_scenario() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut store = open(&dir)?;

    let l0 = store.create_layer(LayerOptions {
        names: vec!["L0".into()],
        ..Default::default()
    })?;
    let i0 = store.create_image(None, &["I0".into()], "L0", "")?;
    assert_eq!(i0.top_layer, l0.id);
    let c0 = store.create_container(None, &["C0".into()], "I0", None, "")?;
    let l1 = store.layer(&c0.layer_id)?;
    assert_eq!(l1.parent.as_deref(), Some(l0.id.as_str()));

    let err = store.delete_image("I0", true).unwrap_err();
    assert!(matches!(err, StorageError::ImageUsedByContainer(_)), "{err}");

    store.delete_container("C0")?;
    assert_eq!(store.delete_image("I0", true)?, [l0.id.clone()]);
    assert_eq!(store.resolve("L0")?, None);
    assert!(!dir.path().join("root/dir").join(&l0.id).exists());
    Ok(())
}

#[test]
fn test_records_on_disk() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut store = open(&dir)?;
    let layer = store.create_layer(LayerOptions::default())?;
    assert_eq!(layer.id.len(), 64);

    let layers: serde_json::Value =
        serde_json::from_slice(&fs::read(dir.path().join("root/dir-layers/layers.json"))?)?;
    assert_eq!(layers, serde_json::json!([{"id": layer.id}]));

    // a second handle picks up what the first wrote
    let mut other = open(&dir)?;
    assert_eq!(other.resolve(&layer.id)?, Some(Entity::Layer(layer.id.clone())));
    other.set_names(&layer.id, &["base".into()])?;
    assert_eq!(store.names(&layer.id)?, ["base"]);
    Ok(())
}

#[test]
fn test_unmount_of_already_unmounted_layer() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut store = open(&dir)?;
    let layer = store.create_layer(LayerOptions::default())?;
    store.mount(&layer.id, None)?;
    // the driver reports the layer as not mounted, which is fine
    store.unmount(&layer.id)?;
    assert_eq!(store.layer(&layer.id)?.mount_count, 0);
    Ok(())
}

#[test]
fn test_lock_file() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("test.lock");
    let mut ours = LockFile::open(&path)?;
    let mut theirs = LockFile::open(&path)?;

    ours.lock()?.touch()?;
    let first = ours.get_last_write()?;
    assert!(!first.is_empty());

    {
        let mut guard = theirs.try_lock()?;
        assert!(guard.modified());
        assert!(!guard.modified());
    }
    assert_eq!(theirs.get_last_write()?, first);

    // our own write is not a foreign modification
    assert!(!ours.lock()?.modified());
    theirs.lock()?.touch()?;
    assert!(ours.lock()?.modified());
    Ok(())
}

#[test]
fn test_options_from_file() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let conf = dir.path().join("storage.conf");
    fs::write(
        &conf,
        format!(
            "[storage]\ndriver = \"dir\"\nroot = \"{}\"\nrun_root = \"{}\"\n",
            dir.path().join("graph").display(),
            dir.path().join("run").display()
        ),
    )?;
    let options = StoreOptions::from_file(&conf)?;
    assert_eq!(options.driver, "dir");

    let driver = Arc::new(DirDriver {
        root: options.graph_root.join("dir"),
    });
    let store = Store::open(options, driver)?;
    assert_eq!(store.graph_root(), dir.path().join("graph"));
    assert!(dir.path().join("graph/dir-images").is_dir());
    assert!(dir.path().join("run/dir-layers").is_dir());

    fs::write(&conf, "[storage\n")?;
    assert!(matches!(
        StoreOptions::from_file(&conf),
        Err(StorageError::Config(_))
    ));
    Ok(())
}
