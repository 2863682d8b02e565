//! The graph driver interface.
//!
//! A graph driver performs the filesystem-level work behind the layer store:
//! creating and removing copy-on-write layers, mounting them, and producing
//! or applying tar diffs. The store only records and orchestrates; every
//! physical operation is delegated to an implementation of [`Driver`].
//!
//! Drivers report failures as [`std::io::Error`]; the store surfaces them
//! unchanged as [`StorageError::Io`](crate::StorageError::Io).

use std::collections::HashMap;
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};

/// How a path differs between a layer and its reference layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Modify,
    Add,
    Delete,
}

/// One entry of a layer's change list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    /// Absolute path inside the layer, e.g. `/etc/hosts`.
    pub path: String,
    pub kind: ChangeKind,
}

/// Fetches the content of files inside one layer, by path relative to its root.
///
/// Used to reassemble a layer's original tar stream without mounting it.
/// Paths are member names from the tar stream, e.g. `./etc/hosts`, and need
/// not be valid UTF-8.
pub trait FileGetter {
    fn get(&self, path: &Path) -> io::Result<Box<dyn Read>>;
}

/// Filesystem backend for the layer store.
///
/// `parent` arguments name the layer a diff is computed against or that a new
/// layer builds upon; `None` means the empty base.
pub trait Driver {
    /// Short name of the driver, used to name the store's subdirectories.
    fn name(&self) -> &str;

    /// Free-form key/value pairs describing the driver's state.
    fn status(&self) -> Vec<(String, String)>;

    /// Create a read-only layer.
    fn create(
        &self,
        id: &str,
        parent: Option<&str>,
        mount_label: &str,
        options: &HashMap<String, String>,
    ) -> io::Result<()>;

    /// Create a layer that will be written to, e.g. a container's layer.
    fn create_read_write(
        &self,
        id: &str,
        parent: Option<&str>,
        mount_label: &str,
        options: &HashMap<String, String>,
    ) -> io::Result<()>;

    /// Remove a layer's data.
    fn remove(&self, id: &str) -> io::Result<()>;

    /// Mount a layer and return the path of its root.
    fn get(&self, id: &str, mount_label: &str) -> io::Result<PathBuf>;

    /// Unmount a layer.  An error of kind [`io::ErrorKind::NotFound`] means it
    /// was already unmounted.
    fn put(&self, id: &str) -> io::Result<()>;

    fn exists(&self, id: &str) -> bool;

    /// Produce an uncompressed tar stream of the differences between `parent`
    /// and `id`.
    fn diff(&self, id: &str, parent: Option<&str>) -> io::Result<Box<dyn Read>>;

    /// List the paths that differ between `parent` and `id`.
    fn changes(&self, id: &str, parent: Option<&str>) -> io::Result<Vec<Change>>;

    /// Extract an uncompressed tar stream into the layer, returning the size
    /// of the applied content.
    fn apply_diff(&self, id: &str, parent: Option<&str>, diff: &mut dyn Read) -> io::Result<u64>;

    /// Estimate the size of the stream [`Driver::diff`] would produce.
    fn diff_size(&self, id: &str, parent: Option<&str>) -> io::Result<u64>;

    /// Direct access to a layer's files, if the driver can provide it without
    /// a mount.
    fn diff_getter(&self, _id: &str) -> io::Result<Option<Box<dyn FileGetter>>> {
        Ok(None)
    }

    /// Release any resources held by the driver.
    fn cleanup(&self) -> io::Result<()>;
}

/// A [`FileGetter`] that opens files below a directory, such as a mounted layer.
#[derive(Debug)]
pub(crate) struct DirFileGetter {
    pub(crate) root: PathBuf,
}

impl FileGetter for DirFileGetter {
    fn get(&self, path: &Path) -> io::Result<Box<dyn Read>> {
        let relative: PathBuf = path
            .components()
            .filter(|component| matches!(component, Component::Normal(_)))
            .collect();
        Ok(Box::new(std::fs::File::open(self.root.join(relative))?))
    }
}

#[cfg(test)]
mod tests {
    use std::ffi::OsStr;
    use std::os::unix::ffi::OsStrExt;

    use super::*;

    #[test]
    fn test_dir_file_getter_paths() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("etc")).unwrap();
        std::fs::write(dir.path().join("etc/hosts"), "127.0.0.1 localhost\n").unwrap();
        let odd = OsStr::from_bytes(b"caf\xe9");
        std::fs::write(dir.path().join(odd), "x").unwrap();

        let getter = DirFileGetter {
            root: dir.path().to_path_buf(),
        };
        for name in ["etc/hosts", "./etc/hosts", "/etc/hosts"] {
            let mut content = String::new();
            getter
                .get(Path::new(name))
                .unwrap()
                .read_to_string(&mut content)
                .unwrap();
            assert_eq!(content, "127.0.0.1 localhost\n", "{name}");
        }
        assert!(getter.get(Path::new(odd)).is_ok());
        assert_eq!(
            getter.get(Path::new("missing")).err().unwrap().kind(),
            io::ErrorKind::NotFound
        );
    }
}
