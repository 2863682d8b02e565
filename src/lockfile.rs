//! Lock file implementation compatible with containers/storage.
//!
//! This module provides file-based locking that interoperates with other
//! containers/storage users of the same lock files. It uses POSIX fcntl locks
//! for cross-process synchronization; exclusive access inside the process
//! is expressed through `&mut` borrows of the [`LockFile`].
//!
//! # LastWrite Token
//!
//! The lock file stores a 64-byte "last write" token that allows callers to
//! detect if any writer has modified shared state since they last checked.
//! The format is:
//! - bytes 0-7: Unix timestamp (nanoseconds, little-endian)
//! - bytes 8-15: Counter (little-endian)
//! - bytes 16-19: Process ID (little-endian)
//! - bytes 20-63: Random bytes
//!
//! The token is only ever read or written while the lock is held, so both
//! operations live on [`LockGuard`].

use std::fs::{File, OpenOptions};
use std::os::fd::AsFd;
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::thread::sleep;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{trace, warn};
use rand::RngCore;
use rustix::fs::{fcntl_lock, FlockOperation};

/// Size of the LastWrite token in bytes.
const LAST_WRITE_SIZE: usize = 64;

/// First sleep between two attempts to take a contended lock.
const LOCK_RETRY_MIN: Duration = Duration::from_millis(1);

/// Upper bound for the sleep between two attempts.
const LOCK_RETRY_MAX: Duration = Duration::from_millis(50);

/// Error types for lock file operations.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// I/O error during lock file operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Lock file operation failed.
    #[error("lock operation failed: {0}")]
    LockFailed(#[from] rustix::io::Errno),

    /// Would block on non-blocking lock attempt.
    #[error("lock would block")]
    WouldBlock,
}

/// Result type for lock file operations.
pub type Result<T> = std::result::Result<T, LockError>;

/// A 64-byte token representing the last write to the lock file.
///
/// This token can be used to detect if any writer has modified shared state
/// since the token was obtained. The format is compatible with the Go
/// implementation in containers/storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastWrite {
    /// Unix timestamp in nanoseconds.
    timestamp_nanos: u64,
    /// Monotonic counter.
    counter: u64,
    /// Process ID of the writer.
    pid: u32,
    /// Random bytes for uniqueness.
    random: [u8; 44],
}

impl LastWrite {
    /// Generate a fresh token for this process.
    fn generate(counter: u64) -> Self {
        let timestamp_nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or_default();
        let mut random = [0u8; 44];
        rand::rng().fill_bytes(&mut random);

        Self {
            timestamp_nanos,
            counter,
            pid: std::process::id(),
            random,
        }
    }

    /// Deserialize a LastWrite token from a 64-byte array.
    fn from_bytes(buf: &[u8; LAST_WRITE_SIZE]) -> Self {
        let mut timestamp_nanos = [0u8; 8];
        timestamp_nanos.copy_from_slice(&buf[0..8]);
        let mut counter = [0u8; 8];
        counter.copy_from_slice(&buf[8..16]);
        let mut pid = [0u8; 4];
        pid.copy_from_slice(&buf[16..20]);
        let mut random = [0u8; 44];
        random.copy_from_slice(&buf[20..64]);

        Self {
            timestamp_nanos: u64::from_le_bytes(timestamp_nanos),
            counter: u64::from_le_bytes(counter),
            pid: u32::from_le_bytes(pid),
            random,
        }
    }

    /// Serialize this token into its 64-byte on-disk form.
    fn to_bytes(&self) -> [u8; LAST_WRITE_SIZE] {
        let mut buf = [0u8; LAST_WRITE_SIZE];
        buf[0..8].copy_from_slice(&self.timestamp_nanos.to_le_bytes());
        buf[8..16].copy_from_slice(&self.counter.to_le_bytes());
        buf[16..20].copy_from_slice(&self.pid.to_le_bytes());
        buf[20..64].copy_from_slice(&self.random);
        buf
    }

    /// Check if this token represents an empty/uninitialized state.
    pub fn is_empty(&self) -> bool {
        self.timestamp_nanos == 0 && self.counter == 0 && self.pid == 0
    }
}

impl Default for LastWrite {
    fn default() -> Self {
        Self {
            timestamp_nanos: 0,
            counter: 0,
            pid: 0,
            random: [0u8; 44],
        }
    }
}

/// A file-based exclusive lock compatible with containers/storage.
///
/// Besides the lock itself the file carries the [`LastWrite`] token of the
/// most recent writer. The handle remembers the last token it wrote or
/// observed, which is what [`LockGuard::modified`] compares against.
#[derive(Debug)]
pub struct LockFile {
    /// Path to the lock file.
    path: PathBuf,
    /// Open handle; the fcntl lock is attached to it.
    file: File,
    /// The token this handle last wrote or observed.
    last_write: LastWrite,
    /// Number of tokens written through this handle.
    counter: u64,
}

/// RAII guard for an exclusive lock.
///
/// The lock is released when this guard is dropped.
#[derive(Debug)]
pub struct LockGuard<'a> {
    lockfile: &'a mut LockFile,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        // Release the fcntl lock
        let _ = fcntl_lock(self.lockfile.file.as_fd(), FlockOperation::Unlock);
        trace!("released {:?}", self.lockfile.path);
    }
}

impl LockFile {
    /// Open a lock file at the specified path, creating it if necessary.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or created.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o600)
            .open(&path)?;

        Ok(Self {
            path,
            file,
            last_write: LastWrite::default(),
            counter: 0,
        })
    }

    /// Get the path to the lock file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Acquire the exclusive lock, waiting until it is available.
    ///
    /// Contention is handled by retrying a non-blocking attempt with a short
    /// sleep that doubles up to a fixed ceiling, so a waiter never spins.
    /// There is no overall timeout.
    ///
    /// Returns a guard that releases the lock when dropped.
    pub fn lock(&mut self) -> Result<LockGuard<'_>> {
        let mut delay = LOCK_RETRY_MIN;
        loop {
            match fcntl_lock(self.file.as_fd(), FlockOperation::NonBlockingLockExclusive) {
                Ok(()) => break,
                Err(rustix::io::Errno::AGAIN) | Err(rustix::io::Errno::ACCESS) => {
                    sleep(delay);
                    delay = (delay * 2).min(LOCK_RETRY_MAX);
                }
                Err(rustix::io::Errno::INTR) => continue,
                Err(e) => return Err(LockError::LockFailed(e)),
            }
        }
        trace!("acquired {:?}", self.path);
        Ok(LockGuard { lockfile: self })
    }

    /// Try to acquire the exclusive lock without blocking.
    ///
    /// Returns `Err(LockError::WouldBlock)` if the lock is not available.
    pub fn try_lock(&mut self) -> Result<LockGuard<'_>> {
        match fcntl_lock(self.file.as_fd(), FlockOperation::NonBlockingLockExclusive) {
            Ok(()) => Ok(LockGuard { lockfile: self }),
            Err(rustix::io::Errno::AGAIN) | Err(rustix::io::Errno::ACCESS) => {
                Err(LockError::WouldBlock)
            }
            Err(e) => Err(LockError::LockFailed(e)),
        }
    }

    /// Read the current LastWrite token from the lock file.
    ///
    /// This reads the token directly from the file, not from cache.
    pub fn get_last_write(&self) -> Result<LastWrite> {
        let mut buf = [0u8; LAST_WRITE_SIZE];
        match self.file.read_exact_at(&mut buf, 0) {
            Ok(()) => Ok(LastWrite::from_bytes(&buf)),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                // File is empty or too small - return empty token
                Ok(LastWrite::default())
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl LockGuard<'_> {
    /// Get the path to the underlying lock file.
    pub fn path(&self) -> &Path {
        &self.lockfile.path
    }

    /// Record a write: store a fresh token in the lock file and remember it
    /// as this handle's own.
    pub fn touch(&mut self) -> Result<()> {
        let lockfile = &mut *self.lockfile;
        lockfile.counter += 1;
        let token = LastWrite::generate(lockfile.counter);
        lockfile.file.write_all_at(&token.to_bytes(), 0)?;
        lockfile.last_write = token;
        Ok(())
    }

    /// Check whether someone else wrote since this handle last wrote or looked.
    ///
    /// The token read is remembered, so a second call without an intervening
    /// foreign write returns `false`. Failing to read the token counts as a
    /// modification.
    pub fn modified(&mut self) -> bool {
        let lockfile = &mut *self.lockfile;
        match lockfile.get_last_write() {
            Ok(current) => {
                let changed = current != lockfile.last_write;
                lockfile.last_write = current;
                changed
            }
            Err(e) => {
                warn!("reading last-write token from {:?}: {e}", lockfile.path);
                true
            }
        }
    }
}
