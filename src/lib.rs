//! Read-write local storage for container layers, images and containers.
//!
//! This library keeps the metadata of copy-on-write filesystem layers, the
//! images built from them and the containers instantiated from images, in
//! the on-disk format used by containers/storage. Several processes may share
//! one store: every change is made under a lock file and written atomically,
//! and each process reloads when another one has written.
//!
//! The filesystem work (creating, mounting and diffing layers) is done by a
//! graph driver supplied by the caller as an implementation of [`Driver`].
//!
//! # Overview
//!
//! - [`Store`] is the entry point; it ties the three record stores together
//!   and refuses operations that would leave dangling references.
//! - Layer diffs are tar streams, optionally gzip or zstd compressed. When a
//!   diff is applied its tar-split metadata is kept, so that
//!   [`Store::diff`] can later reproduce the original stream bit for bit.
//! - [`StoreOptions`] says where the store lives and can be read from a
//!   `storage.conf` file.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use cstore::{LayerOptions, Store, StoreOptions};
//! # fn driver() -> Arc<dyn cstore::Driver> { unimplemented!() }
//!
//! let options = StoreOptions::from_file("/etc/containers/storage.conf")?;
//! let mut store = Store::open(options, driver())?;
//! let mut tarball = std::fs::File::open("layer.tar.gz")?;
//! let layer = store.put_layer(LayerOptions::default(), Some(&mut tarball))?;
//! println!("{} {:?}", layer.id, layer.diff_digest);
//! # Ok::<(), cstore::StorageError>(())
//! ```

pub mod compression;
pub mod config;
pub mod containers;
pub mod driver;
pub mod error;
pub mod images;
pub mod layers;
pub mod lockfile;
mod records;
pub mod store;
pub mod tar_split;
mod util;


pub use compression::Compression;
pub use config::StoreOptions;
pub use containers::Container;
pub use driver::{Change, ChangeKind, Driver, FileGetter};
pub use error::{Result, StorageError};
pub use images::Image;
pub use layers::{Layer, LayerOptions};
pub use lockfile::{LastWrite, LockError, LockFile, LockGuard};
pub use store::{CrawlMode, Entity, Store, Users};
pub use tar_split::{TarSplitEntry, TarSplitReader};
pub use util::generate_random_id;
