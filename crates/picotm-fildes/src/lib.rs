//! File-table module: fd/file objects, per-descriptor and per-file-buffer
//! locking, and a representative POSIX file/socket op set, per
//! SPEC_FULL.md §3/§4.6.
//!
//! Grounded on the original's `fildes` module (`fd.h`/`fd_tx.h`/`ofd.h`):
//! a process-wide fd table and file-buffer table, two-phase locking over
//! regular files, and an irrevocable-only path for descriptors that cannot
//! be rolled back (sockets, pipes, character devices).

mod fd;
mod file;
mod module;

pub use fd::{fd_table, Fd, FdState, FdTable};
pub use file::{file_table, ConcurrencyMode, FileBuffer, FileIdentity, FileTable, FileType};
pub use module::{
    accept_tx, close_tx, connect_tx, dup2_tx, lseek_tx, mkstemp_tx, read_tx, write_tx, Whence,
};
