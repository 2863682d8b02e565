//! The top-level store.
//!
//! [`Store`] composes the layer, image and container stores and enforces the
//! rules that span them: an image's top layer and a container's layer cannot
//! be deleted from under them, a container always gets a layer of its own,
//! and deleting an image takes the layers only it was using along with it.
//!
//! # Directory Structure
//!
//! ```text
//! <graph-root>/
//! +-- storage.lock
//! +-- mounts/
//! +-- tmp/
//! +-- <driver>/                # Left to the graph driver
//! +-- <driver>-layers/
//! +-- <driver>-images/
//! +-- <driver>-containers/
//!
//! <run-root>/
//! +-- <driver>-layers/mountpoints.json
//! ```
//!
//! # Locking
//!
//! Every operation takes the locks of the sub-stores it needs, always in the
//! order layers, images, containers. Each sub-store re-reads its files if
//! another process wrote them since this handle last looked.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use cstore::{LayerOptions, Store, StoreOptions};
//! # fn driver() -> Arc<dyn cstore::Driver> { unimplemented!() }
//!
//! let mut store = Store::open(StoreOptions::default(), driver())?;
//! let base = store.create_layer(LayerOptions::default())?;
//! let image = store.create_image(None, &["fedora".to_string()], &base.id, "")?;
//! let container = store.create_container(None, &[], &image.id, None, "")?;
//! let root = store.mount(&container.id, None)?;
//! # Ok::<(), cstore::StorageError>(())
//! ```

use std::collections::{HashMap, HashSet};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::StoreOptions;
use crate::containers::{Container, ContainerStore};
use crate::driver::{Change, Driver};
use crate::error::{Result, StorageError};
use crate::images::{Image, ImageStore};
use crate::layers::{create_private_dir, Layer, LayerOptions, LayerStore};
use crate::lockfile::LockFile;
use crate::records::{FileStore, StoreGuard};
use crate::util::dedup_names;

/// What an identifier refers to, as found by [`Store::resolve`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entity {
    Container(String),
    Image(String),
    Layer(String),
}

impl Entity {
    /// The canonical ID of the entity.
    pub fn id(&self) -> &str {
        match self {
            Self::Container(id) | Self::Image(id) | Self::Layer(id) => id,
        }
    }
}

/// How [`Store::crawl_with`] treats container layers while collecting the
/// children of each layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CrawlMode {
    /// Container layers are leaves: each is left out of the layer graph, and
    /// every other layer is still considered.
    #[default]
    SkipContainerLayers,
    /// Collecting stops at the first container layer in record order, so
    /// layers recorded after it are not part of the graph.
    StopAtFirstContainerLayer,
}

/// Everything that depends on a layer, as computed by [`Store::crawl`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Users {
    /// The last ID the query resolved to.
    pub id: String,
    /// The layer the dependencies were computed for.
    #[serde(rename = "layer")]
    pub layer_id: String,
    #[serde(rename = "directlayers", default, skip_serializing_if = "Vec::is_empty")]
    pub layers_direct: Vec<String>,
    #[serde(rename = "indirectlayers", default, skip_serializing_if = "Vec::is_empty")]
    pub layers_indirect: Vec<String>,
    #[serde(rename = "directimages", default, skip_serializing_if = "Vec::is_empty")]
    pub images_direct: Vec<String>,
    #[serde(rename = "indirectimages", default, skip_serializing_if = "Vec::is_empty")]
    pub images_indirect: Vec<String>,
    #[serde(rename = "directcontainers", default, skip_serializing_if = "Vec::is_empty")]
    pub containers_direct: Vec<String>,
    #[serde(rename = "indirectcontainers", default, skip_serializing_if = "Vec::is_empty")]
    pub containers_indirect: Vec<String>,
}

/// Local storage for layers, images and containers.
pub struct Store {
    graph_root: PathBuf,
    run_root: PathBuf,
    driver_name: String,
    driver_options: Vec<String>,
    driver: Arc<dyn Driver>,
    _graph_lock: LockFile,
    layers: FileStore<LayerStore>,
    images: FileStore<ImageStore>,
    containers: FileStore<ContainerStore>,
}

/// All three sub-stores, locked in order.
struct Stores<'a> {
    layers: StoreGuard<'a, LayerStore>,
    images: StoreGuard<'a, ImageStore>,
    containers: StoreGuard<'a, ContainerStore>,
}

impl Store {
    /// Open (creating as needed) the store described by `options`, using
    /// `driver` for layer contents.
    pub fn open(options: StoreOptions, driver: Arc<dyn Driver>) -> Result<Self> {
        let driver_name = if options.driver.is_empty() {
            driver.name().to_string()
        } else {
            options.driver.clone()
        };
        let graph_root = options.graph_root;
        let run_root = options.run_root;

        create_private_dir(&run_root)?;
        create_private_dir(&graph_root)?;
        for subdir in ["mounts", "tmp", driver_name.as_str()] {
            create_private_dir(&graph_root.join(subdir))?;
        }

        let mut graph_lock = LockFile::open(graph_root.join("storage.lock"))?;
        let (layers, images, containers) = {
            let _lock = graph_lock.lock()?;

            let layer_store = LayerStore::new(
                Arc::clone(&driver),
                graph_root.join(format!("{driver_name}-layers")),
                run_root.join(format!("{driver_name}-layers")),
            )?;
            let layers = FileStore::open(&layer_store.lock_path(), layer_store)?;

            let image_store = ImageStore::new(graph_root.join(format!("{driver_name}-images")))?;
            let images = FileStore::open(&image_store.lock_path(), image_store)?;

            let container_store =
                ContainerStore::new(graph_root.join(format!("{driver_name}-containers")))?;
            let containers = FileStore::open(&container_store.lock_path(), container_store)?;

            (layers, images, containers)
        };
        debug!("opened {driver_name} store at {graph_root:?}");

        Ok(Self {
            graph_root,
            run_root,
            driver_name,
            driver_options: options.driver_options,
            driver,
            _graph_lock: graph_lock,
            layers,
            images,
            containers,
        })
    }

    pub fn graph_root(&self) -> &Path {
        &self.graph_root
    }

    pub fn run_root(&self) -> &Path {
        &self.run_root
    }

    pub fn graph_driver_name(&self) -> &str {
        &self.driver_name
    }

    pub fn graph_options(&self) -> &[String] {
        &self.driver_options
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    fn lock_all(&mut self) -> Result<Stores<'_>> {
        let layers = self.layers.lock()?;
        let images = self.images.lock()?;
        let containers = self.containers.lock()?;
        Ok(Stores {
            layers,
            images,
            containers,
        })
    }

    /// Create a layer, optionally populated from a (possibly compressed)
    /// tar stream.
    ///
    /// The parent may be given by name or ID, and must not be a container's
    /// layer.  If applying `diff` fails, the layer is removed again.
    pub fn put_layer(&mut self, options: LayerOptions, diff: Option<&mut dyn Read>) -> Result<Layer> {
        let mut s = self.lock_all()?;
        let mut options = options;
        if let Some(parent) = options.parent.as_deref().filter(|parent| !parent.is_empty()) {
            let parent = s.layers.resolve_id(parent)?;
            if s.containers.owns_layer(&parent) {
                return Err(StorageError::ParentIsContainer(parent));
            }
            options.parent = Some(parent);
        }
        s.layers.put(options, diff)
    }

    /// Create an empty layer.
    pub fn create_layer(&mut self, options: LayerOptions) -> Result<Layer> {
        self.put_layer(options, None)
    }

    /// Create an image whose top layer is `layer` (a name or ID).
    pub fn create_image(
        &mut self,
        id: Option<&str>,
        names: &[String],
        layer: &str,
        metadata: &str,
    ) -> Result<Image> {
        let mut s = self.lock_all()?;
        let layer = s.layers.resolve_id(layer)?;
        s.images.create(id, names, &layer, metadata)
    }

    /// Create a container from `image`, along with a new writable layer on
    /// top of the image's top layer.
    ///
    /// `layer_id` picks the ID of that layer; a random one is used if `None`.
    pub fn create_container(
        &mut self,
        id: Option<&str>,
        names: &[String],
        image: &str,
        layer_id: Option<&str>,
        metadata: &str,
    ) -> Result<Container> {
        let mut s = self.lock_all()?;
        let image = s.images.get(image)?;
        let layer = s.layers.put(
            LayerOptions {
                id: layer_id.map(str::to_string),
                parent: Some(image.top_layer.clone()),
                writable: true,
                ..Default::default()
            },
            None,
        )?;
        match s.containers.create(id, names, &image.id, &layer.id, metadata) {
            Ok(container) => Ok(container),
            Err(e) => {
                if let Err(e) = s.layers.delete(&layer.id) {
                    warn!("deleting layer {} of uncreated container: {e}", layer.id);
                }
                Err(e)
            }
        }
    }

    /// Delete a layer that nothing depends on.
    pub fn delete_layer(&mut self, id: &str) -> Result<()> {
        self.lock_all()?.delete_layer(id)
    }

    /// Delete an image and those of its layers that nothing else uses.
    ///
    /// Returns the IDs of those layers, child first.  With `commit` false
    /// nothing is changed and the result is what would have been deleted.
    pub fn delete_image(&mut self, id: &str, commit: bool) -> Result<Vec<String>> {
        self.lock_all()?.delete_image(id, commit)
    }

    /// Delete a container and its layer.
    pub fn delete_container(&mut self, id: &str) -> Result<()> {
        self.lock_all()?.delete_container(id)
    }

    /// Delete whatever `id` refers to.
    ///
    /// Containers go with their layer.  An image is removed by itself, its
    /// layers are kept.
    pub fn delete(&mut self, id: &str) -> Result<()> {
        let mut s = self.lock_all()?;
        match s.resolve(id) {
            Some(Entity::Container(id)) => s.delete_container(&id),
            Some(Entity::Image(id)) => {
                s.check_image_unused(&id)?;
                s.images.delete(&id)
            }
            Some(Entity::Layer(id)) => s.delete_layer(&id),
            None => Err(StorageError::NotAnId(id.to_string())),
        }
    }

    /// Find what `id` (a name or ID) refers to.  Containers are tried first,
    /// then images, then layers.
    pub fn resolve(&mut self, id: &str) -> Result<Option<Entity>> {
        Ok(self.lock_all()?.resolve(id))
    }

    pub fn exists(&mut self, id: &str) -> Result<bool> {
        Ok(self.resolve(id)?.is_some())
    }

    /// Translate a name or ID into the ID of the entity it refers to.
    pub fn lookup(&mut self, name: &str) -> Result<String> {
        match self.resolve(name)? {
            Some(entity) => Ok(entity.id().to_string()),
            None => Err(StorageError::NotAnId(name.to_string())),
        }
    }

    /// Replace the names of a container, image or layer.  Duplicates are
    /// dropped; names held by another entity of the same kind move over.
    pub fn set_names(&mut self, id: &str, names: &[String]) -> Result<()> {
        let names = dedup_names(names);
        let mut s = self.lock_all()?;
        match s.resolve(id) {
            Some(Entity::Container(id)) => s.containers.set_names(&id, names),
            Some(Entity::Image(id)) => s.images.set_names(&id, names),
            Some(Entity::Layer(id)) => s.layers.set_names(&id, names),
            None => Err(StorageError::NotAnId(id.to_string())),
        }
    }

    pub fn names(&mut self, id: &str) -> Result<Vec<String>> {
        let s = self.lock_all()?;
        match s.resolve(id) {
            Some(Entity::Container(id)) => Ok(s.containers.get(&id)?.names),
            Some(Entity::Image(id)) => Ok(s.images.get(&id)?.names),
            Some(Entity::Layer(id)) => Ok(s.layers.get(&id)?.names),
            None => Err(StorageError::NotAnId(id.to_string())),
        }
    }

    pub fn metadata(&mut self, id: &str) -> Result<String> {
        let s = self.lock_all()?;
        match s.resolve(id) {
            Some(Entity::Container(id)) => s.containers.metadata(&id),
            Some(Entity::Image(id)) => s.images.metadata(&id),
            Some(Entity::Layer(id)) => s.layers.metadata(&id),
            None => Err(StorageError::NotAnId(id.to_string())),
        }
    }

    pub fn set_metadata(&mut self, id: &str, metadata: &str) -> Result<()> {
        let mut s = self.lock_all()?;
        match s.resolve(id) {
            Some(Entity::Container(id)) => s.containers.set_metadata(&id, metadata),
            Some(Entity::Image(id)) => s.images.set_metadata(&id, metadata),
            Some(Entity::Layer(id)) => s.layers.set_metadata(&id, metadata),
            None => Err(StorageError::NotAnId(id.to_string())),
        }
    }

    /// Set a flag on a container, image or layer.
    pub fn set_flag(&mut self, id: &str, flag: &str, value: Value) -> Result<()> {
        let mut s = self.lock_all()?;
        match s.resolve(id) {
            Some(Entity::Container(id)) => s.containers.set_flag(&id, flag, value),
            Some(Entity::Image(id)) => s.images.set_flag(&id, flag, value),
            Some(Entity::Layer(id)) => s.layers.set_flag(&id, flag, value),
            None => Err(StorageError::NotAnId(id.to_string())),
        }
    }

    pub fn clear_flag(&mut self, id: &str, flag: &str) -> Result<()> {
        let mut s = self.lock_all()?;
        match s.resolve(id) {
            Some(Entity::Container(id)) => s.containers.clear_flag(&id, flag),
            Some(Entity::Image(id)) => s.images.clear_flag(&id, flag),
            Some(Entity::Layer(id)) => s.layers.clear_flag(&id, flag),
            None => Err(StorageError::NotAnId(id.to_string())),
        }
    }

    /// Find the layers, images and containers that depend on the layer `id`
    /// refers to (directly, or through an image or container).
    ///
    /// `id` is followed from container to image to layer, and [`Users::id`]
    /// is the last entity it resolved to: for a container or image whose
    /// layer exists, that is the layer.
    pub fn crawl(&mut self, id: &str) -> Result<Users> {
        self.crawl_with(id, CrawlMode::default())
    }

    pub fn crawl_with(&mut self, id: &str, mode: CrawlMode) -> Result<Users> {
        self.lock_all()?.crawl(id, mode)
    }

    /// Mount a layer, or a container's layer, and return its path.
    pub fn mount(&mut self, id: &str, mount_label: Option<&str>) -> Result<PathBuf> {
        let mut layers = self.layers.lock()?;
        let containers = self.containers.lock()?;
        match containers.get(id) {
            Ok(container) => layers.mount(&container.layer_id, mount_label),
            Err(_) => layers.mount(id, mount_label),
        }
    }

    /// Undo one [`Store::mount`].  `id` may also be the mount path.
    pub fn unmount(&mut self, id: &str) -> Result<()> {
        let mut layers = self.layers.lock()?;
        let containers = self.containers.lock()?;
        match containers.get(id) {
            Ok(container) => layers.unmount(&container.layer_id),
            Err(_) => layers.unmount(id),
        }
    }

    /// Tar stream of the differences between `from` (default: the parent of
    /// `to`) and `to`, compressed the way `to`'s diff was supplied.
    pub fn diff(&mut self, from: Option<&str>, to: &str) -> Result<Box<dyn Read>> {
        self.layers.lock()?.diff(from, to)
    }

    /// Populate layer `to` from a (possibly compressed) tar stream.
    pub fn apply_diff(&mut self, to: &str, diff: &mut dyn Read) -> Result<u64> {
        self.layers.lock()?.apply_diff(to, diff)
    }

    pub fn diff_size(&mut self, from: Option<&str>, to: &str) -> Result<u64> {
        self.layers.lock()?.diff_size(from, to)
    }

    pub fn changes(&mut self, from: Option<&str>, to: &str) -> Result<Vec<Change>> {
        self.layers.lock()?.changes(from, to)
    }

    /// Status reported by the graph driver.
    pub fn status(&mut self) -> Result<Vec<(String, String)>> {
        Ok(self.layers.lock()?.status())
    }

    pub fn version(&self) -> Vec<(String, String)> {
        vec![("Version".to_string(), env!("CARGO_PKG_VERSION").to_string())]
    }

    /// Delete all containers, images and layers.
    pub fn wipe(&mut self) -> Result<()> {
        let mut s = self.lock_all()?;
        s.containers.wipe()?;
        s.images.wipe()?;
        s.layers.wipe()
    }

    pub fn layers(&mut self) -> Result<Vec<Layer>> {
        Ok(self.layers.lock()?.layers())
    }

    pub fn images(&mut self) -> Result<Vec<Image>> {
        Ok(self.images.lock()?.images())
    }

    pub fn containers(&mut self) -> Result<Vec<Container>> {
        Ok(self.containers.lock()?.containers())
    }

    pub fn layer(&mut self, id: &str) -> Result<Layer> {
        self.layers.lock()?.get(id)
    }

    pub fn image(&mut self, id: &str) -> Result<Image> {
        self.images.lock()?.get(id)
    }

    pub fn container(&mut self, id: &str) -> Result<Container> {
        self.containers.lock()?.get(id)
    }

    /// Images whose top layer is `layer` (a name or ID).
    pub fn images_by_top_layer(&mut self, layer: &str) -> Result<Vec<Image>> {
        let layer = self.layers.lock()?.resolve_id(layer)?;
        Ok(self.images.lock()?.by_top_layer(&layer))
    }

    /// The container owning `layer` (a name or ID).
    pub fn container_by_layer(&mut self, layer: &str) -> Result<Container> {
        let layer = self.layers.lock()?.resolve_id(layer)?;
        let containers = self.containers.lock()?;
        if !containers.owns_layer(&layer) {
            return Err(StorageError::ContainerUnknown(layer));
        }
        containers.get(&layer)
    }

    pub fn layers_by_compressed_digest(&mut self, digest: &str) -> Result<Vec<Layer>> {
        Ok(self.layers.lock()?.layers_by_compressed_digest(digest))
    }

    pub fn layers_by_uncompressed_digest(&mut self, digest: &str) -> Result<Vec<Layer>> {
        Ok(self.layers.lock()?.layers_by_uncompressed_digest(digest))
    }

    pub fn image_big_data(&mut self, id: &str, key: &str) -> Result<Vec<u8>> {
        self.images.lock()?.big_data(id, key)
    }

    pub fn image_big_data_names(&mut self, id: &str) -> Result<Vec<String>> {
        self.images.lock()?.big_data_names(id)
    }

    pub fn set_image_big_data(&mut self, id: &str, key: &str, data: &[u8]) -> Result<()> {
        self.images.lock()?.set_big_data(id, key, data)
    }

    pub fn container_big_data(&mut self, id: &str, key: &str) -> Result<Vec<u8>> {
        self.containers.lock()?.big_data(id, key)
    }

    pub fn container_big_data_names(&mut self, id: &str) -> Result<Vec<String>> {
        self.containers.lock()?.big_data_names(id)
    }

    pub fn set_container_big_data(&mut self, id: &str, key: &str, data: &[u8]) -> Result<()> {
        self.containers.lock()?.set_big_data(id, key, data)
    }
}

impl Stores<'_> {
    fn resolve(&self, id: &str) -> Option<Entity> {
        if let Ok(id) = self.containers.resolve_id(id) {
            return Some(Entity::Container(id));
        }
        if let Ok(id) = self.images.resolve_id(id) {
            return Some(Entity::Image(id));
        }
        self.layers.resolve_id(id).ok().map(Entity::Layer)
    }

    fn check_image_unused(&self, id: &str) -> Result<()> {
        if self.containers.iter().any(|container| container.image_id == id) {
            return Err(StorageError::ImageUsedByContainer(id.to_string()));
        }
        Ok(())
    }

    fn delete_layer(&mut self, id: &str) -> Result<()> {
        let Ok(id) = self.layers.resolve_id(id) else {
            return Err(StorageError::NotALayer(id.to_string()));
        };
        if !self.layers.children(&id).is_empty() {
            return Err(StorageError::LayerHasChildren(id));
        }
        if self.images.iter().any(|image| image.top_layer == id) {
            return Err(StorageError::LayerUsedByImage(id));
        }
        if self.containers.owns_layer(&id) {
            return Err(StorageError::LayerUsedByContainer(id));
        }
        self.layers.delete(&id)
    }

    fn delete_image(&mut self, id: &str, commit: bool) -> Result<Vec<String>> {
        let Ok(image) = self.images.get(id) else {
            return Err(StorageError::NotAnImage(id.to_string()));
        };
        self.check_image_unused(&image.id)?;

        let other_top_layers: HashSet<&str> = self
            .images
            .iter()
            .filter(|other| other.id != image.id)
            .map(|other| other.top_layer.as_str())
            .collect();

        // Walk down from the top layer for as long as each layer is used by
        // nothing but the image and the layer above it.
        let mut doomed: Vec<String> = vec![];
        let mut next = Some(image.top_layer.clone()).filter(|layer| !layer.is_empty());
        while let Some(layer) = next {
            if self.containers.owns_layer(&layer) || other_top_layers.contains(layer.as_str()) {
                break;
            }
            let Ok(record) = self.layers.get(&layer) else {
                break;
            };
            let shared = self
                .layers
                .children(&layer)
                .iter()
                .any(|child| doomed.last() != Some(child));
            if shared {
                break;
            }
            next = record.parent;
            doomed.push(layer);
        }

        if commit {
            self.images.delete(&image.id)?;
            for layer in &doomed {
                self.layers.delete(layer)?;
            }
            debug!("deleted image {} and {} layers", image.id, doomed.len());
        }
        Ok(doomed)
    }

    fn delete_container(&mut self, id: &str) -> Result<()> {
        let Ok(container) = self.containers.get(id) else {
            return Err(StorageError::NotAContainer(id.to_string()));
        };
        if self.layers.exists(&container.layer_id) {
            self.layers.delete(&container.layer_id)?;
        }
        self.containers.delete(&container.id)
    }

    fn crawl(&self, id: &str, mode: CrawlMode) -> Result<Users> {
        let mut resolved: Option<String> = None;
        let mut layer_id = id.to_string();
        if let Ok(container) = self.containers.get(id) {
            resolved = Some(container.id);
            layer_id = container.layer_id;
        }
        if let Ok(image) = self.images.get(&layer_id) {
            resolved = Some(image.id);
            layer_id = image.top_layer;
        }
        match self.layers.get(&layer_id) {
            Ok(layer) => {
                resolved = Some(layer.id.clone());
                layer_id = layer.id;
            }
            Err(_) if resolved.is_none() => {
                return Err(StorageError::LayerUnknown(id.to_string()));
            }
            Err(_) => {}
        }

        let mut children: HashMap<String, Vec<String>> = HashMap::new();
        for layer in self.layers.layers() {
            if self.containers.owns_layer(&layer.id) {
                match mode {
                    CrawlMode::SkipContainerLayers => continue,
                    CrawlMode::StopAtFirstContainerLayer => break,
                }
            }
            children
                .entry(layer.parent.unwrap_or_default())
                .or_default()
                .push(layer.id);
        }

        let layers_direct = children.get(&layer_id).cloned().unwrap_or_default();
        let mut layers_indirect = vec![];
        let mut examined = HashSet::new();
        let mut queue = layers_direct.clone();
        let mut n = 0;
        while n < queue.len() {
            let layer = queue[n].clone();
            n += 1;
            if !examined.insert(layer.clone()) {
                continue;
            }
            for child in children.get(&layer).into_iter().flatten() {
                queue.push(child.clone());
                layers_indirect.push(child.clone());
            }
        }

        let mut users = Users {
            id: resolved.unwrap_or_else(|| layer_id.clone()),
            layer_id: layer_id.clone(),
            layers_direct,
            layers_indirect,
            ..Default::default()
        };
        for image in self.images.iter() {
            if image.top_layer == layer_id {
                users.images_direct.push(image.id.clone());
            } else if examined.contains(&image.top_layer) {
                users.images_indirect.push(image.id.clone());
            }
        }
        for container in self.containers.iter() {
            let parent = self
                .layers
                .get(&container.layer_id)
                .ok()
                .and_then(|layer| layer.parent)
                .unwrap_or_default();
            if parent == layer_id {
                users.containers_direct.push(container.id.clone());
            } else if examined.contains(&parent) {
                users.containers_indirect.push(container.id.clone());
            }
        }
        Ok(users)
    }
}
