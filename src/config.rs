//! Store configuration.
//!
//! Options can be built in code, or read from a `storage.conf`-style file:
//!
//! ```toml
//! [storage]
//! driver = "overlay"
//! root = "/var/lib/containers/storage"
//! run_root = "/run/containers/storage"
//! options = ["overlay.mountopt=nodev"]
//! ```
//!
//! Settings missing from the file keep their defaults. The default driver
//! name and driver options come from `$STORAGE_DRIVER` and the
//! comma-separated `$STORAGE_OPTS`.

use std::env;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::Result;

/// Default location of the graph root.
pub const DEFAULT_GRAPH_ROOT: &str = "/var/lib/containers/storage";

/// Default location of the run root.
pub const DEFAULT_RUN_ROOT: &str = "/var/run/containers/storage";

/// Where and how a [`Store`](crate::Store) keeps its data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreOptions {
    /// Persistent data: layer contents, records and big data.
    pub graph_root: PathBuf,

    /// Transient data such as mount reference counts.
    pub run_root: PathBuf,

    /// Name of the graph driver.  Empty means the driver's own name.
    pub driver: String,

    /// Options handed to the graph driver.
    pub driver_options: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    storage: StorageTable,
}

#[derive(Debug, Default, Deserialize)]
struct StorageTable {
    driver: Option<String>,
    root: Option<PathBuf>,
    run_root: Option<PathBuf>,
    options: Option<Vec<String>>,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self::with_env(
            env::var("STORAGE_DRIVER").ok(),
            env::var("STORAGE_OPTS").ok(),
        )
    }
}

impl StoreOptions {
    fn with_env(driver: Option<String>, options: Option<String>) -> Self {
        let driver_options = options
            .map(|opts| {
                opts.split(',')
                    .map(str::trim)
                    .filter(|opt| !opt.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Self {
            graph_root: PathBuf::from(DEFAULT_GRAPH_ROOT),
            run_root: PathBuf::from(DEFAULT_RUN_ROOT),
            driver: driver.unwrap_or_default(),
            driver_options,
        }
    }

    /// Options with both roots below one directory, as used by tests and
    /// rootless setups.
    pub fn under(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            graph_root: root.join("root"),
            run_root: root.join("runroot"),
            ..Self::default()
        }
    }

    /// Parse the `[storage]` table of a configuration file.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML content is invalid.
    pub fn from_toml(content: &str) -> std::result::Result<Self, toml::de::Error> {
        let file: ConfigFile = toml::from_str(content)?;
        Ok(file.storage.apply(Self::default()))
    }

    /// Read and parse a configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(Self::from_toml(&content)?)
    }
}

impl StorageTable {
    fn apply(self, mut options: StoreOptions) -> StoreOptions {
        if let Some(driver) = self.driver {
            options.driver = driver;
        }
        if let Some(root) = self.root {
            options.graph_root = root;
        }
        if let Some(run_root) = self.run_root {
            options.run_root = run_root;
        }
        if let Some(driver_options) = self.options {
            options.driver_options = driver_options;
        }
        options
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_basic_config() {
        let config_str = r#"
[storage]
driver = "overlay"
root = "/srv/storage"
run_root = "/run/user/1000/storage"
options = ["overlay.mountopt=nodev", "overlay.size=10G"]
"#;
        let options = StoreOptions::from_toml(config_str).unwrap();
        assert_eq!(options.driver, "overlay");
        assert_eq!(options.graph_root, PathBuf::from("/srv/storage"));
        assert_eq!(options.run_root, PathBuf::from("/run/user/1000/storage"));
        assert_eq!(
            options.driver_options,
            ["overlay.mountopt=nodev", "overlay.size=10G"]
        );
    }

    #[test]
    fn test_missing_settings_keep_defaults() {
        let options = StorageTable {
            root: Some("/srv/storage".into()),
            ..Default::default()
        }
        .apply(StoreOptions::with_env(Some("vfs".into()), None));
        assert_eq!(options.graph_root, PathBuf::from("/srv/storage"));
        assert_eq!(options.run_root, PathBuf::from(DEFAULT_RUN_ROOT));
        assert_eq!(options.driver, "vfs");

        assert!(StoreOptions::from_toml("").is_ok());
    }

    #[test]
    fn test_env_defaults() {
        let options = StoreOptions::with_env(None, Some("a=1, b=2,,".into()));
        assert_eq!(options.driver, "");
        assert_eq!(options.driver_options, ["a=1", "b=2"]);
        assert_eq!(options.graph_root, PathBuf::from(DEFAULT_GRAPH_ROOT));
    }

    #[test]
    fn test_invalid_config() {
        assert!(StoreOptions::from_toml("[storage]\ndriver = 3\n").is_err());
    }
}
