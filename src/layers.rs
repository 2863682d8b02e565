//! The layer store: records of copy-on-write layers kept by the graph driver.
//!
//! Layers form a forest through their `parent` links. The store keeps the
//! records in `layers.json` and the mount reference counts in
//! `mountpoints.json` below the run root, which is usually a tmpfs so that
//! mount state does not survive a reboot.
//!
//! # Layer Directory Structure
//!
//! ```text
//! <graph-root>/<driver>-layers/
//! +-- layers.json             # Layer records
//! +-- layers.lock             # Lock file with last-write token
//! +-- <layer-id>.tar-split.gz # Tar-split metadata of the applied diff
//!
//! <run-root>/<driver>-layers/
//! +-- mountpoints.json        # [{id, path, count}] for mounted layers
//! ```
//!
//! # Crash recovery
//!
//! A layer created together with a diff is saved with the `incomplete` flag
//! before the diff is applied, and the flag is cleared once it has been.
//! Loading the store deletes every layer that still carries the flag.

use std::collections::{BTreeMap, HashMap};
use std::fs::DirBuilder;
use std::io::{self, BufWriter, ErrorKind, Read, Seek, SeekFrom};
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use cap_std::ambient_authority;
use cap_std::fs::Dir;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::compression::{self, Compression};
use crate::driver::{Change, DirFileGetter, Driver};
use crate::error::{Result, StorageError};
use crate::records::{FileBasedStore, Record, Records};
use crate::tar_split::{self, TarSplitPacker, TarSplitReader, TAR_SPLIT_SUFFIX};
use crate::util::{atomic_write, clean_path, generate_random_id, DigestReader, Digester};

/// Flag marking a layer whose diff has not been fully applied.
pub const INCOMPLETE_FLAG: &str = "incomplete";

/// Flag recording the compression of the diff the layer was built from.
pub const COMPRESSION_FLAG: &str = "diff-compression";

const LAYERS_FILE: &str = "layers.json";
const MOUNTS_FILE: &str = "mountpoints.json";

/// A copy-on-write layer.
///
/// `mount_point` and `mount_count` are runtime state: they are kept in
/// `mountpoints.json`, not in `layers.json`. A layer is mounted exactly when
/// `mount_count > 0`, and then `mount_point` is set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Layer {
    /// Layer ID (a caller-supplied value or 64 random hex digits).
    pub id: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub names: Vec<String>,

    /// ID of the layer this one builds upon.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub metadata: String,

    /// SELinux label used when mounting.
    #[serde(rename = "mountlabel", default, skip_serializing_if = "String::is_empty")]
    pub mount_label: String,

    #[serde(skip)]
    pub mount_point: Option<PathBuf>,

    #[serde(skip)]
    pub mount_count: u32,

    /// sha256 of the uncompressed diff applied to this layer.
    #[serde(rename = "diff-digest", default, skip_serializing_if = "Option::is_none")]
    pub diff_digest: Option<String>,

    #[serde(rename = "diff-size", default, skip_serializing_if = "Option::is_none")]
    pub diff_size: Option<u64>,

    /// sha256 of the diff as it was supplied, possibly compressed.
    #[serde(
        rename = "compressed-diff-digest",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub compressed_diff_digest: Option<String>,

    #[serde(
        rename = "compressed-size",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub compressed_size: Option<u64>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub flags: BTreeMap<String, Value>,
}

impl Layer {
    /// Whether the layer was saved before its diff finished applying.
    pub fn is_incomplete(&self) -> bool {
        self.flags.get(INCOMPLETE_FLAG) == Some(&Value::Bool(true))
    }

    fn compression(&self) -> Compression {
        self.flags
            .get(COMPRESSION_FLAG)
            .map(Compression::from_flag)
            .unwrap_or_default()
    }
}

impl Record for Layer {
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

/// Parameters for creating a layer.
#[derive(Debug, Clone, Default)]
pub struct LayerOptions {
    /// Explicit ID; a random one is generated if `None`.
    pub id: Option<String>,
    /// Name or ID of the parent layer.
    pub parent: Option<String>,
    pub names: Vec<String>,
    pub mount_label: String,
    /// Ask the driver for a layer that will be written to.
    pub writable: bool,
    /// Driver-specific options, e.g. `size`.
    pub driver_options: HashMap<String, String>,
    pub flags: BTreeMap<String, Value>,
}

/// Entry in mountpoints.json.
#[derive(Debug, Serialize, Deserialize)]
struct MountPoint {
    id: String,
    path: PathBuf,
    count: u32,
}

/// Layer records plus the driver that holds their data.
pub(crate) struct LayerStore {
    driver: Arc<dyn Driver>,
    /// `<graph-root>/<driver>-layers`
    layer_path: PathBuf,
    layer_dir: Dir,
    /// `<run-root>/<driver>-layers`
    run_dir: Dir,
    records: Records<Layer>,
    /// Mount path → layer ID.
    by_mount: HashMap<PathBuf, String>,
    dirty: bool,
}

pub(crate) fn create_private_dir(path: &Path) -> io::Result<()> {
    DirBuilder::new().recursive(true).mode(0o700).create(path)
}

impl LayerStore {
    pub(crate) fn new(driver: Arc<dyn Driver>, layer_path: PathBuf, run_path: PathBuf) -> Result<Self> {
        create_private_dir(&layer_path)?;
        create_private_dir(&run_path)?;
        let layer_dir = Dir::open_ambient_dir(&layer_path, ambient_authority())?;
        let run_dir = Dir::open_ambient_dir(&run_path, ambient_authority())?;
        Ok(Self {
            driver,
            layer_path,
            layer_dir,
            run_dir,
            records: Records::default(),
            by_mount: HashMap::new(),
            dirty: false,
        })
    }

    pub(crate) fn lock_path(&self) -> PathBuf {
        self.layer_path.join("layers.lock")
    }

    /// Name of a layer's tar-split file in the layer directory.
    fn tspath(id: &str) -> String {
        format!("{id}{TAR_SPLIT_SUFFIX}")
    }

    fn save(&mut self) -> Result<()> {
        self.dirty = true;
        self.records.write(&self.layer_dir, LAYERS_FILE)?;
        let mounts: Vec<MountPoint> = self
            .records
            .iter()
            .filter_map(|layer| {
                let path = layer.mount_point.as_ref().filter(|_| layer.mount_count > 0)?;
                Some(MountPoint {
                    id: layer.id.clone(),
                    path: path.clone(),
                    count: layer.mount_count,
                })
            })
            .collect();
        atomic_write(&self.run_dir, MOUNTS_FILE, &serde_json::to_vec(&mounts)?)?;
        Ok(())
    }

    fn read_mounts(&self) -> Result<Vec<MountPoint>> {
        match self.run_dir.read(MOUNTS_FILE) {
            Ok(data) if data.iter().all(u8::is_ascii_whitespace) => Ok(vec![]),
            Ok(data) => Ok(serde_json::from_slice(&data)?),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(vec![]),
            Err(e) => Err(e.into()),
        }
    }

    /// Resolve a name or ID to a layer ID.
    pub(crate) fn resolve_id(&self, key: &str) -> Result<String> {
        self.records
            .resolve(key)
            .map(str::to_string)
            .ok_or_else(|| StorageError::LayerUnknown(key.to_string()))
    }

    fn layer_mut(&mut self, id: &str) -> Result<&mut Layer> {
        self.records
            .get_mut(id)
            .ok_or_else(|| StorageError::LayerUnknown(id.to_string()))
    }

    pub(crate) fn get(&self, key: &str) -> Result<Layer> {
        self.records
            .find(key)
            .cloned()
            .ok_or_else(|| StorageError::LayerUnknown(key.to_string()))
    }

    pub(crate) fn exists(&self, key: &str) -> bool {
        self.records.resolve(key).is_some()
    }

    pub(crate) fn layers(&self) -> Vec<Layer> {
        self.records.to_vec()
    }

    /// IDs of the layers whose parent is `id`, in record order.
    pub(crate) fn children(&self, id: &str) -> Vec<String> {
        self.records
            .iter()
            .filter(|layer| layer.parent.as_deref() == Some(id))
            .map(|layer| layer.id.clone())
            .collect()
    }

    pub(crate) fn status(&self) -> Vec<(String, String)> {
        self.driver.status()
    }

    /// Create a layer, optionally populating it from `diff`.
    pub(crate) fn put(&mut self, options: LayerOptions, diff: Option<&mut dyn Read>) -> Result<Layer> {
        let parent = match options.parent.as_deref().filter(|p| !p.is_empty()) {
            Some(parent) => Some(self.resolve_id(parent)?),
            None => None,
        };
        let id = match options.id.filter(|id| !id.is_empty()) {
            Some(id) => id,
            None => generate_random_id(),
        };
        self.records.check_new(&id, &options.names)?;

        if options.writable {
            self.driver.create_read_write(
                &id,
                parent.as_deref(),
                &options.mount_label,
                &options.driver_options,
            )?;
        } else {
            self.driver.create(
                &id,
                parent.as_deref(),
                &options.mount_label,
                &options.driver_options,
            )?;
        }

        let mut layer = Layer {
            id: id.clone(),
            names: options.names,
            parent,
            mount_label: options.mount_label,
            flags: options.flags,
            ..Default::default()
        };
        if diff.is_some() {
            layer.flags.insert(INCOMPLETE_FLAG.to_string(), Value::Bool(true));
        }
        self.records.insert(layer);
        if let Err(e) = self.save() {
            self.records.remove(&id);
            if let Err(e) = self.driver.remove(&id) {
                warn!("removing unrecorded layer {id}: {e}");
            }
            return Err(e);
        }

        if let Some(diff) = diff {
            let applied = self.apply_diff_to(&id, diff).and_then(|_| {
                self.layer_mut(&id)?.flags.remove(INCOMPLETE_FLAG);
                self.save()
            });
            if let Err(e) = applied {
                if let Err(e) = self.delete_id(&id) {
                    warn!("deleting incomplete layer {id}: {e}");
                }
                return Err(e);
            }
        }

        debug!("created layer {id}");
        self.get(&id)
    }

    /// Mount a layer, returning its path.  Only the first of nested mounts
    /// reaches the driver.
    pub(crate) fn mount(&mut self, key: &str, mount_label: Option<&str>) -> Result<PathBuf> {
        let id = self.resolve_id(key)?;
        let layer = self.layer_mut(&id)?;
        if layer.mount_count > 0 {
            if let Some(path) = layer.mount_point.clone() {
                layer.mount_count += 1;
                self.save()?;
                return Ok(path);
            }
        }

        let label = match mount_label.filter(|label| !label.is_empty()) {
            Some(label) => label.to_string(),
            None => layer.mount_label.clone(),
        };
        let path = clean_path(self.driver.get(&id, &label)?);
        debug!("mounted layer {id} at {path:?}");

        let layer = self
            .records
            .get_mut(&id)
            .ok_or_else(|| StorageError::LayerUnknown(id.clone()))?;
        if let Some(old) = layer.mount_point.replace(path.clone()) {
            self.by_mount.remove(&old);
        }
        layer.mount_count = 1;
        self.by_mount.insert(path.clone(), id);
        self.save()?;
        Ok(path)
    }

    /// Unmount a layer given its mount path, name or ID.
    pub(crate) fn unmount(&mut self, key: &str) -> Result<()> {
        let id = match self.by_mount.get(&clean_path(key)) {
            Some(id) => id.clone(),
            None => self.resolve_id(key)?,
        };
        self.unmount_id(&id)
    }

    fn unmount_id(&mut self, id: &str) -> Result<()> {
        let layer = self.layer_mut(id)?;
        match layer.mount_count {
            0 => return Err(StorageError::LayerNotMounted(id.to_string())),
            1 => {}
            _ => {
                layer.mount_count -= 1;
                return self.save();
            }
        }

        match self.driver.put(id) {
            Err(e) if e.kind() != ErrorKind::NotFound => return Err(e.into()),
            _ => debug!("unmounted layer {id}"),
        }
        let layer = self
            .records
            .get_mut(id)
            .ok_or_else(|| StorageError::LayerUnknown(id.to_string()))?;
        layer.mount_count = 0;
        if let Some(path) = layer.mount_point.take() {
            self.by_mount.remove(&path);
        }
        self.save()
    }

    /// Delete a layer and its data.  The caller checks that nothing depends on it.
    pub(crate) fn delete(&mut self, key: &str) -> Result<()> {
        let id = self.resolve_id(key)?;
        self.delete_id(&id)
    }

    fn delete_id(&mut self, id: &str) -> Result<()> {
        while self.layer_mut(id)?.mount_count > 0 {
            self.unmount_id(id)?;
        }
        self.driver.remove(id)?;
        if let Err(e) = self.layer_dir.remove_file(Self::tspath(id)) {
            if e.kind() != ErrorKind::NotFound {
                warn!("removing tar-split data of layer {id}: {e}");
            }
        }
        self.records.remove(id);
        debug!("deleted layer {id}");
        self.save()
    }

    /// Delete every layer, children before their parents.
    pub(crate) fn wipe(&mut self) -> Result<()> {
        loop {
            let leaf = self
                .records
                .iter()
                .find(|layer| self.children(&layer.id).is_empty())
                .map(|layer| layer.id.clone());
            match leaf {
                Some(id) => self.delete_id(&id)?,
                None => return Ok(()),
            }
        }
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
        let id = self.resolve_id(key)?;
        self.layer_mut(&id)?.metadata = metadata.to_string();
        self.save()
    }

    pub(crate) fn set_flag(&mut self, key: &str, flag: &str, value: Value) -> Result<()> {
        let id = self.resolve_id(key)?;
        self.layer_mut(&id)?.flags.insert(flag.to_string(), value);
        self.save()
    }

    pub(crate) fn clear_flag(&mut self, key: &str, flag: &str) -> Result<()> {
        let id = self.resolve_id(key)?;
        self.layer_mut(&id)?.flags.remove(flag);
        self.save()
    }

    pub(crate) fn layers_by_compressed_digest(&self, digest: &str) -> Vec<Layer> {
        self.records
            .iter()
            .filter(|layer| layer.compressed_diff_digest.as_deref() == Some(digest))
            .cloned()
            .collect()
    }

    pub(crate) fn layers_by_uncompressed_digest(&self, digest: &str) -> Vec<Layer> {
        self.records
            .iter()
            .filter(|layer| layer.diff_digest.as_deref() == Some(digest))
            .cloned()
            .collect()
    }

    /// Resolve the `to` layer and the layer it is compared against, which
    /// defaults to its parent.
    fn from_and_to(&self, from: Option<&str>, to: &str) -> Result<(Option<String>, Layer)> {
        let to = self.get(to)?;
        let from = match from.filter(|from| !from.is_empty()) {
            Some(from) => Some(self.records.resolve(from).unwrap_or(from).to_string()),
            None => to.parent.clone(),
        };
        Ok((from, to))
    }

    pub(crate) fn changes(&self, from: Option<&str>, to: &str) -> Result<Vec<Change>> {
        let (from, to) = self.from_and_to(from, to)?;
        Ok(self.driver.changes(&to.id, from.as_deref())?)
    }

    pub(crate) fn diff_size(&self, from: Option<&str>, to: &str) -> Result<u64> {
        let (from, to) = self.from_and_to(from, to)?;
        Ok(self.driver.diff_size(&to.id, from.as_deref())?)
    }

    /// Produce the diff between `from` (default: the parent) and `to`,
    /// compressed the way `to`'s own diff was.
    ///
    /// Against the parent, the stream is rebuilt byte for byte from the
    /// recorded tar-split data.  Otherwise, or if there is no such record,
    /// the driver computes the diff.
    pub(crate) fn diff(&mut self, from: Option<&str>, to: &str) -> Result<Box<dyn Read>> {
        let (from, to) = self.from_and_to(from, to)?;
        let compression = to.compression();

        let tsfile = if from == to.parent {
            match self.layer_dir.open(Self::tspath(&to.id)) {
                Ok(file) => Some(file),
                Err(e) if e.kind() == ErrorKind::NotFound => None,
                Err(e) => return Err(e.into()),
            }
        } else {
            None
        };
        let Some(tsfile) = tsfile else {
            let diff = self.driver.diff(&to.id, from.as_deref())?;
            return Ok(compression::compress(compression, diff)?);
        };

        let entries = TarSplitReader::new(tsfile);
        let mut spool = BufWriter::new(tempfile::tempfile()?);
        match self.driver.diff_getter(&to.id)? {
            Some(getter) => {
                tar_split::assemble(entries, getter.as_ref(), &mut spool)?;
            }
            None => {
                let root = self.mount(&to.id, None)?;
                let assembled = tar_split::assemble(entries, &DirFileGetter { root }, &mut spool);
                let unmounted = self.unmount_id(&to.id);
                assembled?;
                unmounted?;
            }
        }
        let mut spool = spool.into_inner().map_err(|e| e.into_error())?;
        spool.seek(SeekFrom::Start(0))?;
        Ok(compression::compress(compression, spool)?)
    }

    /// Apply a (possibly compressed) tar stream to a layer and record its
    /// tar-split data and digests.
    pub(crate) fn apply_diff(&mut self, to: &str, diff: &mut dyn Read) -> Result<u64> {
        let id = self.resolve_id(to)?;
        self.apply_diff_to(&id, diff)
    }

    fn apply_diff_to(&mut self, id: &str, diff: &mut dyn Read) -> Result<u64> {
        let parent = self.layer_mut(id)?.parent.clone();

        let mut compressed = Digester::default();
        let (compression, stream) = compression::peek(DigestReader::new(diff, &mut compressed))?;
        let mut packer = TarSplitPacker::new(compression::decompress(compression, stream)?);
        let size = self.driver.apply_diff(id, parent.as_deref(), &mut packer)?;
        // the driver may stop reading at the end-of-archive marker
        io::copy(&mut packer, &mut io::sink())?;
        let packed = packer.finish()?;
        let (compressed_digest, compressed_size) = compressed.finish();

        atomic_write(
            &self.layer_dir,
            Self::tspath(id),
            &tar_split::encode(&packed.entries)?,
        )?;

        let layer = self.layer_mut(id)?;
        if compression == Compression::Uncompressed {
            layer.flags.remove(COMPRESSION_FLAG);
        } else {
            layer
                .flags
                .insert(COMPRESSION_FLAG.to_string(), compression.flag_value());
        }
        layer.compressed_diff_digest = Some(compressed_digest);
        layer.compressed_size = Some(compressed_size);
        layer.diff_digest = Some(packed.digest);
        layer.diff_size = Some(packed.size);
        debug!("applied {size} bytes of {compression:?} diff to layer {id}");
        self.save()?;
        Ok(size)
    }
}

impl FileBasedStore for LayerStore {
    fn load(&mut self) -> Result<()> {
        let mut records = Records::<Layer>::read(&self.layer_dir, LAYERS_FILE)?;
        for layer in records.iter_mut() {
            if layer.parent.as_deref() == Some("") {
                layer.parent = None;
            }
        }

        let mut by_mount = HashMap::new();
        for mount in self.read_mounts()? {
            if mount.path.as_os_str().is_empty() || mount.count == 0 {
                continue;
            }
            if let Some(layer) = records.get_mut(&mount.id) {
                by_mount.insert(mount.path.clone(), mount.id.clone());
                layer.mount_point = Some(mount.path);
                layer.mount_count = mount.count;
            }
        }
        self.records = records;
        self.by_mount = by_mount;

        // Remove anything a previous user of this store marked as incomplete
        // but did not manage to delete.
        let incomplete: Vec<String> = self
            .records
            .iter()
            .filter(|layer| layer.is_incomplete())
            .map(|layer| layer.id.clone())
            .collect();
        for id in incomplete {
            warn!("removing incomplete layer {id}");
            self.delete_id(&id)?;
        }
        Ok(())
    }

    fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }
}
