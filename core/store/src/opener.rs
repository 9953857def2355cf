//! Opening the database root: lock file, network marker, clean-shutdown
//! marker and the validation policy for the storage layers underneath.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::immutable::{ChunkLayout, ImmutableDb};
use crate::ledger::SnapshotStore;
use crate::volatile::VolatileDb;
use crate::{
    ImmutableValidation, StoreConfig, StoreError, VolatileValidation, io_err,
};

const MARKER_FILE: &str = "protocolMagicId";
const CLEAN_FILE: &str = "clean";
const LOCK_FILE: &str = "lock";

const IMMUTABLE_DIR: &str = "immutable";
const VOLATILE_DIR: &str = "volatile";
const LEDGER_DIR: &str = "ledger";

#[derive(Debug, thiserror::Error)]
pub enum StoreOpenerError {
    /// I/O or corruption while opening one of the layers.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Another process holds the advisory lock on this database root.
    #[error("database at {0} is locked by another process")]
    AlreadyLocked(PathBuf),

    /// The root belongs to a different network.
    ///
    /// Prevents pointing a node at a database produced under another
    /// protocol magic.
    #[error("database network magic is {got}, node is configured for {want}")]
    DbMarkerMismatch { got: u32, want: u32 },

    /// The network marker file exists but does not parse.
    #[error("unreadable network marker at {0}")]
    InvalidMarker(PathBuf),
}

/// Builder for opening a database root.
///
/// Typical usage:
///
/// ```ignore
/// let storage = StoreOpener::new(&root, StoreConfig::default(), magic)
///     .with_validation(ImmutableValidation::ValidateAllChunks, VolatileValidation::ValidateAll)
///     .open()?;
/// ```
pub struct StoreOpener {
    root: PathBuf,
    config: StoreConfig,
    magic: u32,
    immutable_validation: ImmutableValidation,
    volatile_validation: VolatileValidation,
}

impl StoreOpener {
    pub fn new(root: &Path, config: StoreConfig, magic: u32) -> Self {
        StoreOpener {
            root: root.to_path_buf(),
            config,
            magic,
            immutable_validation: ImmutableValidation::ValidateMostRecentChunk,
            volatile_validation: VolatileValidation::NoValidation,
        }
    }

    /// Requested validation effort. Overridden to full validation when the
    /// previous shutdown was not clean.
    pub fn with_validation(
        mut self,
        immutable: ImmutableValidation,
        volatile: VolatileValidation,
    ) -> Self {
        self.immutable_validation = immutable;
        self.volatile_validation = volatile;
        self
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn open(self) -> Result<NodeStorage, StoreOpenerError> {
        fs::create_dir_all(&self.root).map_err(|e| io_err(&self.root, e))?;
        let lock = acquire_lock(&self.root)?;
        check_or_write_marker(&self.root, self.magic)?;

        let clean_path = self.root.join(CLEAN_FILE);
        let was_clean = clean_path.exists();
        if was_clean {
            // Removed now so that a crash before the next clean shutdown
            // forces full validation.
            fs::remove_file(&clean_path).map_err(|e| io_err(&clean_path, e))?;
        }
        let (immutable_validation, volatile_validation) = if was_clean {
            (self.immutable_validation, self.volatile_validation)
        } else {
            tracing::warn!(
                target: "store",
                root = %self.root.display(),
                "previous shutdown was not clean; validating everything",
            );
            (ImmutableValidation::ValidateAllChunks, VolatileValidation::ValidateAll)
        };

        let layout = ChunkLayout { slots_per_chunk: self.config.slots_per_chunk };
        let immutable =
            ImmutableDb::open(&self.root.join(IMMUTABLE_DIR), layout, immutable_validation)?;
        let volatile = VolatileDb::open(
            &self.root.join(VOLATILE_DIR),
            self.config.max_blocks_per_file,
            volatile_validation,
        )?;
        let snapshots =
            SnapshotStore::open(&self.root.join(LEDGER_DIR), self.config.snapshot_retention)?;

        Ok(NodeStorage { root: self.root, immutable, volatile, snapshots, was_clean, _lock: lock })
    }
}

/// The opened database root: the three layers plus the root-level
/// bookkeeping. Holding this value holds the advisory lock.
pub struct NodeStorage {
    root: PathBuf,
    pub immutable: ImmutableDb,
    pub volatile: VolatileDb,
    pub snapshots: SnapshotStore,
    was_clean: bool,
    _lock: LockFile,
}

impl fmt::Debug for NodeStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeStorage").field("root", &self.root).finish_non_exhaustive()
    }
}

impl NodeStorage {
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether the clean-shutdown marker was present when this root was
    /// opened.
    pub fn was_clean_shutdown(&self) -> bool {
        self.was_clean
    }

    /// Writes the clean-shutdown marker. The next open may then skip full
    /// validation.
    pub fn mark_clean_shutdown(&self) -> Result<(), StoreError> {
        let path = self.root.join(CLEAN_FILE);
        let file = File::create(&path).map_err(|e| io_err(&path, e))?;
        file.sync_all().map_err(|e| io_err(&path, e))?;
        Ok(())
    }
}

struct LockFile {
    _file: File,
}

fn acquire_lock(root: &Path) -> Result<LockFile, StoreOpenerError> {
    let path = root.join(LOCK_FILE);
    let file =
        OpenOptions::new().create(true).write(true).open(&path).map_err(|e| io_err(&path, e))?;
    rustix::fs::flock(&file, rustix::fs::FlockOperation::NonBlockingLockExclusive).map_err(
        |errno| {
            if errno == rustix::io::Errno::WOULDBLOCK || errno == rustix::io::Errno::AGAIN {
                StoreOpenerError::AlreadyLocked(path.clone())
            } else {
                StoreOpenerError::Store(io_err(&path, errno.into()))
            }
        },
    )?;
    Ok(LockFile { _file: file })
}

fn check_or_write_marker(root: &Path, magic: u32) -> Result<(), StoreOpenerError> {
    let path = root.join(MARKER_FILE);
    match fs::read_to_string(&path) {
        Ok(contents) => {
            let got: u32 = contents
                .trim()
                .parse()
                .map_err(|_| StoreOpenerError::InvalidMarker(path.clone()))?;
            if got != magic {
                return Err(StoreOpenerError::DbMarkerMismatch { got, want: magic });
            }
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let mut file = File::create(&path).map_err(|e| io_err(&path, e))?;
            writeln!(file, "{magic}").map_err(|e| io_err(&path, e))?;
            file.sync_all().map_err(|e| io_err(&path, e))?;
            Ok(())
        }
        Err(e) => Err(StoreOpenerError::Store(io_err(&path, e))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn opener(root: &Path, magic: u32) -> StoreOpener {
        StoreOpener::new(root, StoreConfig::default(), magic)
    }

    #[test]
    fn fresh_root_gets_marker_and_layout() {
        let dir = tempfile::tempdir().unwrap();
        let storage = opener(dir.path(), 42).open().unwrap();
        assert!(!storage.was_clean_shutdown());
        assert!(dir.path().join(MARKER_FILE).exists());
        assert!(dir.path().join(IMMUTABLE_DIR).is_dir());
        assert!(dir.path().join(VOLATILE_DIR).is_dir());
        assert!(dir.path().join(LEDGER_DIR).is_dir());
    }

    #[test]
    fn marker_mismatch_refuses_open() {
        let dir = tempfile::tempdir().unwrap();
        drop(opener(dir.path(), 42).open().unwrap());
        assert_matches!(
            opener(dir.path(), 7).open(),
            Err(StoreOpenerError::DbMarkerMismatch { got: 42, want: 7 })
        );
    }

    #[test]
    fn second_opener_is_locked_out() {
        let dir = tempfile::tempdir().unwrap();
        let storage = opener(dir.path(), 42).open().unwrap();
        assert_matches!(
            opener(dir.path(), 42).open(),
            Err(StoreOpenerError::AlreadyLocked(_))
        );
        drop(storage);
        assert!(opener(dir.path(), 42).open().is_ok());
    }

    #[test]
    fn clean_marker_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        {
            let storage = opener(dir.path(), 42).open().unwrap();
            storage.mark_clean_shutdown().unwrap();
        }
        {
            let storage = opener(dir.path(), 42).open().unwrap();
            assert!(storage.was_clean_shutdown());
            // The marker is consumed; crashing now means an unclean open.
        }
        let storage = opener(dir.path(), 42).open().unwrap();
        assert!(!storage.was_clean_shutdown());
    }
}
