//! Error types for the cstore library.
//!
//! All operations that can fail return a [`Result<T>`] which is an alias for
//! `Result<T, StorageError>`.
//!
//! # Error Categories
//!
//! - **Not found**: [`LayerUnknown`], [`ImageUnknown`], [`ContainerUnknown`]
//! - **Conflicts**: [`DuplicateId`], [`DuplicateName`]
//! - **Referential integrity**: [`LayerHasChildren`], [`LayerUsedByImage`],
//!   [`LayerUsedByContainer`], [`ImageUsedByContainer`], [`ParentIsContainer`]
//! - **Kind mismatch**: [`NotALayer`], [`NotAnImage`], [`NotAContainer`], [`NotAnId`]
//! - **System errors**: [`Io`], [`JsonParse`], [`Lock`]
//!
//! Driver failures surface as [`Io`] with the driver's error unchanged.
//!
//! [`LayerUnknown`]: StorageError::LayerUnknown
//! [`ImageUnknown`]: StorageError::ImageUnknown
//! [`ContainerUnknown`]: StorageError::ContainerUnknown
//! [`DuplicateId`]: StorageError::DuplicateId
//! [`DuplicateName`]: StorageError::DuplicateName
//! [`LayerHasChildren`]: StorageError::LayerHasChildren
//! [`LayerUsedByImage`]: StorageError::LayerUsedByImage
//! [`LayerUsedByContainer`]: StorageError::LayerUsedByContainer
//! [`ImageUsedByContainer`]: StorageError::ImageUsedByContainer
//! [`ParentIsContainer`]: StorageError::ParentIsContainer
//! [`NotALayer`]: StorageError::NotALayer
//! [`NotAnImage`]: StorageError::NotAnImage
//! [`NotAContainer`]: StorageError::NotAContainer
//! [`NotAnId`]: StorageError::NotAnId
//! [`Io`]: StorageError::Io
//! [`JsonParse`]: StorageError::JsonParse
//! [`Lock`]: StorageError::Lock

/// Result type alias for operations that may return a StorageError.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Error types for storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// No layer with the given name or ID.
    #[error("layer not known: {0}")]
    LayerUnknown(String),

    /// No image with the given name or ID.
    #[error("image not known: {0}")]
    ImageUnknown(String),

    /// No container with the given name or ID.
    #[error("container not known: {0}")]
    ContainerUnknown(String),

    /// The requested ID is already in use.
    #[error("that ID is already in use: {0}")]
    DuplicateId(String),

    /// One of the requested names is already in use.
    #[error("that name is already in use: {0}")]
    DuplicateName(String),

    /// The layer is the parent of at least one other layer.
    #[error("layer has children: {0}")]
    LayerHasChildren(String),

    /// The layer is the top layer of an image.
    #[error("layer is in use by an image: {0}")]
    LayerUsedByImage(String),

    /// The layer belongs to a container.
    #[error("layer is in use by a container: {0}")]
    LayerUsedByContainer(String),

    /// The image is referenced by a container.
    #[error("image is in use by a container: {0}")]
    ImageUsedByContainer(String),

    /// The would-be parent layer is a container's layer.
    #[error("would-be parent layer is a container: {0}")]
    ParentIsContainer(String),

    /// The identifier does not name a layer.
    #[error("identifier is not a layer: {0}")]
    NotALayer(String),

    /// The identifier does not name an image.
    #[error("identifier is not an image: {0}")]
    NotAnImage(String),

    /// The identifier does not name a container.
    #[error("identifier is not a container: {0}")]
    NotAContainer(String),

    /// The identifier names nothing at all.
    #[error("identifier is not a layer, image, or container: {0}")]
    NotAnId(String),

    /// Unmount was requested for a layer that is not mounted.
    #[error("layer is not mounted: {0}")]
    LayerNotMounted(String),

    /// A caller-supplied argument was rejected.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Error related to tar-split processing.
    #[error("tar-split error: {0}")]
    TarSplitError(String),

    /// I/O error, including errors reported by the graph driver.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding or decoding error.
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    /// Invalid storage configuration.
    #[error("configuration error: {0}")]
    Config(#[from] toml::de::Error),

    /// Lock file operation failed.
    #[error("lock error: {0}")]
    Lock(#[from] crate::lockfile::LockError),
}
