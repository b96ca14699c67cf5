//! Shared "file buffer" objects, deduplicated by `(device, inode, type,
//! tag)` identity, per spec.md §3 File-table objects.
//!
//! Grounded on the original's `ofd` table (`fildes/ofd.h`): one shared
//! object per distinct open file description, reference-counted, carrying
//! the file type's concurrency mode. Identity is immutable once
//! initialized; the Rust rendition clears it naturally by dropping the
//! `Arc` rather than an explicit refcount field, since nothing here needs
//! to observe the count except "has it reached zero" (handled by `Drop`).

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::RwLock;

/// What kind of file a descriptor refers to, decided once from `fstat` at
/// first attach and never revisited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileType {
    Regular,
    Pipe,
    Socket,
    CharDevice,
    Other,
}

impl FileType {
    #[must_use]
    pub const fn from_stat_mode(mode: libc::mode_t) -> Self {
        match mode & libc::S_IFMT {
            libc::S_IFREG => Self::Regular,
            libc::S_IFIFO => Self::Pipe,
            libc::S_IFSOCK => Self::Socket,
            libc::S_IFCHR => Self::CharDevice,
            _ => Self::Other,
        }
    }

    /// The file type's concurrency mode, per spec.md §3: persistent
    /// regular files get two-phase locking (writes are undoable); sockets,
    /// pipes and character devices cannot be rolled back in general, so
    /// operations on them go through the irrevocable-only path instead of
    /// taking a field lock.
    #[must_use]
    pub const fn concurrency_mode(self) -> ConcurrencyMode {
        match self {
            Self::Regular => ConcurrencyMode::TwoPl,
            Self::Pipe | Self::Socket | Self::CharDevice | Self::Other => ConcurrencyMode::NoUndo,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConcurrencyMode {
    /// The operation requires irrevocable mode; no field lock is taken.
    NoUndo,
    /// Strict two-phase locking over the file's content field.
    TwoPl,
}

/// Immutable identity of a shared file buffer. For regular files, `dev`
/// and `ino` alone already identify the file uniquely, so `tag` is zero;
/// pipes and sockets lack a stable cross-fd identity in this model, so
/// `tag` carries the fd that first observed them, preventing unrelated
/// pipes/sockets from being spuriously deduplicated onto one buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileIdentity {
    pub dev: u64,
    pub ino: u64,
    pub file_type: FileType,
    pub tag: u64,
}

/// A shared file buffer: one per distinct open file description. Reference
/// counted via `Arc`; the underlying table entry is cleared when the last
/// `Arc` drops (testable by nothing remaining to `upgrade()`).
pub struct FileBuffer {
    identity: FileIdentity,
    mode: ConcurrencyMode,
    /// Field lock over the buffer's content, per spec.md §3/§5: two-phase
    /// locking for persistent files. Acquired per-operation with a
    /// non-blocking try-lock (a failure is a conflict, not a block), and
    /// released only at apply/undo time — never inside `lock`/`unlock`.
    pub(crate) content_lock: Arc<RwLock<()>>,
}

impl FileBuffer {
    #[must_use]
    pub const fn identity(&self) -> FileIdentity {
        self.identity
    }

    #[must_use]
    pub const fn mode(&self) -> ConcurrencyMode {
        self.mode
    }
}

#[derive(Default)]
pub struct FileTable {
    entries: RwLock<HashMap<FileIdentity, Weak<FileBuffer>>>,
}

impl FileTable {
    /// Returns the shared buffer for `identity`, creating one if this is
    /// the first live reference. Lock-order: a read attempt first (the
    /// common case once a buffer is warm), falling back to a write lock
    /// only to install a fresh entry or replace a stale (fully-dropped)
    /// one.
    pub fn get_or_create(&self, identity: FileIdentity, mode: ConcurrencyMode) -> Arc<FileBuffer> {
        if let Some(buf) = self.entries.read().get(&identity).and_then(Weak::upgrade) {
            return buf;
        }
        let mut entries = self.entries.write();
        if let Some(buf) = entries.get(&identity).and_then(Weak::upgrade) {
            return buf;
        }
        let buf = Arc::new(FileBuffer {
            identity,
            mode,
            content_lock: Arc::new(RwLock::new(())),
        });
        entries.insert(identity, Arc::downgrade(&buf));
        buf
    }
}

static FILE_TABLE: OnceLock<FileTable> = OnceLock::new();

pub fn file_table() -> &'static FileTable {
    FILE_TABLE.get_or_init(FileTable::default)
}
