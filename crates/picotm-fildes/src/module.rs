//! File-table module: registers with `picotm-core` and exposes the
//! representative read/write/lseek/close/mkstemp/dup2/connect/accept
//! operations, each following the four-step protocol of spec.md §4.6.
//!
//! Syscalls are issued directly through `libc` rather than through a
//! higher-level wrapper crate: the C ABI these thin wrappers sit on top of
//! (`read`/`write`/`lseek`/`close`/`dup2`/`mkstemp`/`connect`/`accept`) is
//! part of spec.md §6's "C-ABI-shaped" framing, and matches the grain size
//! of a module that is explicitly scoped to a representative op set, not a
//! full POSIX wrapper catalog.

use std::cell::{Cell, RefCell};
use std::ffi::c_void;
use std::os::fd::RawFd;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::RawRwLock;

use picotm_core::{append_event, go_irrevocable, is_irrevocable, register_module, ErrorSlot, ModuleCallbacks};
use picotm_error::{PicotmError, Result};
use picotm_types::{Cookie, ModuleId, Opcode};
use tracing::debug;

use crate::fd::{fd_table, Fd, FdState};
use crate::file::{ConcurrencyMode, FileBuffer};

const OPCODE_READ: u16 = 0;
const OPCODE_WRITE: u16 = 1;
const OPCODE_LSEEK: u16 = 2;
const OPCODE_CLOSE: u16 = 3;
const OPCODE_MKSTEMP: u16 = 4;
const OPCODE_DUP2: u16 = 5;
const OPCODE_CONNECT: u16 = 6;
const OPCODE_ACCEPT: u16 = 7;

/// Seek origin, mirroring `SEEK_SET`/`SEEK_CUR`/`SEEK_END`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Set,
    Cur,
    End,
}

impl Whence {
    const fn to_libc(self) -> libc::c_int {
        match self {
            Self::Set => libc::SEEK_SET,
            Self::Cur => libc::SEEK_CUR,
            Self::End => libc::SEEK_END,
        }
    }
}

enum HeldLock {
    StateWrite(ArcRwLockWriteGuard<RawRwLock, FdState>),
    ContentRead(ArcRwLockReadGuard<RawRwLock, ()>),
    ContentWrite(ArcRwLockWriteGuard<RawRwLock, ()>),
}

enum OpKind {
    Read,
    Write { fd: RawFd, offset_before: i64, old_bytes: Vec<u8> },
    Lseek { fd: RawFd, old_offset: i64 },
    Close { fd_obj: Arc<Fd> },
    Mkstemp { fd: RawFd, path: PathBuf },
    /// Dup2/connect/accept: irrevocable-only, nothing to apply or undo.
    Irrevocable,
}

struct OpRecord {
    kind: OpKind,
    locks: Vec<HeldLock>,
}

#[derive(Default)]
struct FildesTx {
    ops: Vec<OpRecord>,
}

thread_local! {
    static STATE: RefCell<FildesTx> = RefCell::new(FildesTx::default());
    static MODULE_ID: Cell<Option<ModuleId>> = const { Cell::new(None) };
}

fn with_state<R>(f: impl FnOnce(&mut FildesTx) -> R) -> R {
    STATE.with(|cell| f(&mut cell.borrow_mut()))
}

fn current_errno() -> i32 {
    // SAFETY: see `picotm_errno::current_errno` — valid for the thread's
    // lifetime.
    unsafe { *libc::__errno_location() }
}

fn raw_read(fd: RawFd, buf: &mut [u8]) -> Result<usize> {
    // SAFETY: `buf` is a valid, uniquely-borrowed slice for its length.
    let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast::<c_void>(), buf.len()) };
    if n < 0 {
        return Err(PicotmError::errno(current_errno()));
    }
    Ok(n as usize)
}

fn raw_write(fd: RawFd, data: &[u8]) -> Result<usize> {
    // SAFETY: `data` is a valid slice for its length; the kernel only reads
    // from it.
    let n = unsafe { libc::write(fd, data.as_ptr().cast::<c_void>(), data.len()) };
    if n < 0 {
        return Err(PicotmError::errno(current_errno()));
    }
    Ok(n as usize)
}

fn raw_lseek(fd: RawFd, offset: i64, whence: Whence) -> Result<i64> {
    // SAFETY: plain syscall wrapper, no memory involved.
    let pos = unsafe { libc::lseek(fd, offset, whence.to_libc()) };
    if pos < 0 {
        return Err(PicotmError::errno(current_errno()));
    }
    Ok(pos)
}

fn raw_close(fd: RawFd) {
    // SAFETY: `fd` is a descriptor this module owns exclusively for the
    // duration of the close.
    unsafe {
        libc::close(fd);
    }
}

struct FildesCallbacks;

impl ModuleCallbacks for FildesCallbacks {
    fn apply_event(&mut self, _opcode: Opcode, cookie: Cookie, error: &mut ErrorSlot) {
        with_state(|state| {
            let Some(op) = state.ops.get_mut(cookie.0 as usize) else {
                error.set(PicotmError::internal("fildes apply: cookie out of range"));
                return;
            };
            if let OpKind::Close { fd_obj } = &op.kind {
                let raw = fd_obj.raw_fd();
                raw_close(raw);
                fd_table().forget(raw);
                debug!(fd = raw, "fildes: close committed, fd released to OS");
            }
            // Read/Write/Lseek/Mkstemp already performed their side effect
            // eagerly when the operation was issued; commit only releases
            // the lock held since then.
            op.locks.clear();
        });
    }

    fn undo_event(&mut self, _opcode: Opcode, cookie: Cookie, error: &mut ErrorSlot) {
        with_state(|state| {
            let Some(op) = state.ops.get_mut(cookie.0 as usize) else {
                error.set(PicotmError::internal("fildes undo: cookie out of range"));
                return;
            };
            match &op.kind {
                OpKind::Write { fd, offset_before, old_bytes } => {
                    if let Err(e) = raw_lseek(*fd, *offset_before, Whence::Set)
                        .and_then(|_| raw_write(*fd, old_bytes))
                    {
                        error.set(e);
                    }
                }
                OpKind::Lseek { fd, old_offset } => {
                    if let Err(e) = raw_lseek(*fd, *old_offset, Whence::Set) {
                        error.set(e);
                    }
                }
                OpKind::Close { .. } => {
                    if let Some(HeldLock::StateWrite(guard)) = op.locks.first_mut() {
                        **guard = FdState::InUse;
                    }
                }
                OpKind::Mkstemp { fd, path } => {
                    raw_close(*fd);
                    fd_table().forget(*fd);
                    let _ = std::fs::remove_file(path);
                }
                OpKind::Read | OpKind::Irrevocable => {}
            }
            op.locks.clear();
        });
    }

    fn finish(&mut self, _error: &mut ErrorSlot) {
        with_state(|state| state.ops.clear());
    }
}

fn ensure_registered() -> ModuleId {
    MODULE_ID.with(|cell| {
        if let Some(id) = cell.get() {
            return id;
        }
        let id = register_module(Box::new(FildesCallbacks));
        cell.set(Some(id));
        id
    })
}

fn conflict(fd: RawFd) -> PicotmError {
    PicotmError::conflicting(Some(picotm_error::ConflictHandle(fd as u64)))
}

fn require_irrevocable() -> Result<()> {
    if is_irrevocable() {
        return Ok(());
    }
    go_irrevocable()
}

fn try_state_write(fd_obj: &Fd) -> Result<ArcRwLockWriteGuard<RawRwLock, FdState>> {
    fd_obj.state.try_write_arc().ok_or_else(|| conflict(fd_obj.raw_fd()))
}

fn try_content_read(fd: RawFd, buffer: &FileBuffer) -> Result<ArcRwLockReadGuard<RawRwLock, ()>> {
    buffer.content_lock.try_read_arc().ok_or_else(|| conflict(fd))
}

fn try_content_write(fd: RawFd, buffer: &FileBuffer) -> Result<ArcRwLockWriteGuard<RawRwLock, ()>> {
    buffer.content_lock.try_write_arc().ok_or_else(|| conflict(fd))
}

/// Attaches to `fd`'s shared file buffer, taking the field lock its
/// concurrency mode requires: a content read/write lock for two-phase-
/// locked (regular) files, or a bid for irrevocable mode for files that
/// cannot be rolled back (sockets, pipes, character devices).
fn attach_for(fd: RawFd, fd_obj: &Fd, want_write: bool) -> Result<Vec<HeldLock>> {
    let buffer = fd_obj.file();
    match buffer.mode() {
        ConcurrencyMode::TwoPl => {
            let lock = if want_write {
                HeldLock::ContentWrite(try_content_write(fd, &buffer)?)
            } else {
                HeldLock::ContentRead(try_content_read(fd, &buffer)?)
            };
            Ok(vec![lock])
        }
        ConcurrencyMode::NoUndo => {
            require_irrevocable()?;
            Ok(Vec::new())
        }
    }
}

fn push_op(opcode: u16, kind: OpKind, mut locks: Vec<HeldLock>, state_lock: Option<HeldLock>) -> Result<()> {
    if let Some(lock) = state_lock {
        locks.insert(0, lock);
    }
    let module_id = ensure_registered();
    let cookie = with_state(|state| {
        state.ops.push(OpRecord { kind, locks });
        u32::try_from(state.ops.len() - 1).expect("fildes op table overflowed u32")
    });
    append_event(module_id, Opcode(opcode), Cookie(cookie))
}

/// Reads up to `buf.len()` bytes from `fd` at its current offset.
pub fn read_tx(fd: RawFd, buf: &mut [u8]) -> Result<usize> {
    let fd_obj = fd_table().resolve(fd)?;
    let state_guard = try_state_write(&fd_obj)?;
    let content_locks = attach_for(fd, &fd_obj, false)?;
    let n = raw_read(fd, buf)?;
    push_op(OPCODE_READ, OpKind::Read, content_locks, Some(HeldLock::StateWrite(state_guard)))?;
    Ok(n)
}

/// Writes `data` to `fd` at its current offset, logging the prior bytes at
/// that range so an abort can restore them.
pub fn write_tx(fd: RawFd, data: &[u8]) -> Result<usize> {
    let fd_obj = fd_table().resolve(fd)?;
    let state_guard = try_state_write(&fd_obj)?;
    let content_locks = attach_for(fd, &fd_obj, true)?;

    let offset_before = raw_lseek(fd, 0, Whence::Cur)?;
    let mut old_bytes = vec![0u8; data.len()];
    let read_n = raw_read(fd, &mut old_bytes)?;
    old_bytes.truncate(read_n);
    raw_lseek(fd, offset_before, Whence::Set)?;

    let n = raw_write(fd, data)?;
    push_op(
        OPCODE_WRITE,
        OpKind::Write { fd, offset_before, old_bytes },
        content_locks,
        Some(HeldLock::StateWrite(state_guard)),
    )?;
    Ok(n)
}

/// Repositions `fd`'s offset, logging the old offset for undo.
pub fn lseek_tx(fd: RawFd, offset: i64, whence: Whence) -> Result<i64> {
    let fd_obj = fd_table().resolve(fd)?;
    let state_guard = try_state_write(&fd_obj)?;
    let content_locks = attach_for(fd, &fd_obj, true)?;

    let old_offset = raw_lseek(fd, 0, Whence::Cur)?;
    let new_offset = raw_lseek(fd, offset, whence)?;
    push_op(
        OPCODE_LSEEK,
        OpKind::Lseek { fd, old_offset },
        content_locks,
        Some(HeldLock::StateWrite(state_guard)),
    )?;
    Ok(new_offset)
}

/// Transitions `fd` to `Closing`. The OS fd is only actually released on
/// commit; an abort reverts the descriptor to `InUse`.
pub fn close_tx(fd: RawFd) -> Result<()> {
    let fd_obj = fd_table().resolve(fd)?;
    let mut state_guard = try_state_write(&fd_obj)?;
    *state_guard = FdState::Closing;
    push_op(
        OPCODE_CLOSE,
        OpKind::Close { fd_obj: Arc::clone(&fd_obj) },
        Vec::new(),
        Some(HeldLock::StateWrite(state_guard)),
    )
}

/// Creates a uniquely-named temporary file from `template` (which must end
/// in `XXXXXX`), returning its fd and realized path. Aborting removes the
/// file and closes the fd (spec.md testable property / scenario 4).
pub fn mkstemp_tx(template: &str) -> Result<(RawFd, PathBuf)> {
    let mut bytes: Vec<u8> = template.bytes().chain(std::iter::once(0)).collect();
    // SAFETY: `bytes` is a NUL-terminated, mutable buffer `mkstemp` may
    // rewrite the trailing `XXXXXX` of in place.
    let fd = unsafe { libc::mkstemp(bytes.as_mut_ptr().cast::<libc::c_char>()) };
    if fd < 0 {
        return Err(PicotmError::errno(current_errno()));
    }
    bytes.pop(); // drop the NUL terminator before building the path
    let path = PathBuf::from(String::from_utf8_lossy(&bytes).into_owned());
    push_op(OPCODE_MKSTEMP, OpKind::Mkstemp { fd, path: path.clone() }, Vec::new(), None)?;
    Ok((fd, path))
}

/// Duplicates `oldfd` onto `newfd`. Always irrevocable: `dup2` cannot be
/// undone in general (it may silently close an fd the rest of the process
/// still holds open), so the transaction must hold the irrevocable token
/// before issuing it, per spec.md §4.6.
pub fn dup2_tx(oldfd: RawFd, newfd: RawFd) -> Result<RawFd> {
    require_irrevocable()?;
    // SAFETY: thin wrapper over the `dup2` syscall; both fds are owned by
    // the caller per the usual `dup2` contract.
    let fd = unsafe { libc::dup2(oldfd, newfd) };
    if fd < 0 {
        return Err(PicotmError::errno(current_errno()));
    }
    push_op(OPCODE_DUP2, OpKind::Irrevocable, Vec::new(), None)?;
    Ok(fd)
}

/// Connects `fd` to `addr`. Connecting to a network peer cannot be rolled
/// back, so this requires irrevocable mode (restarting if it cannot be
/// obtained) rather than a field lock.
///
/// # Safety
/// `addr` must point to a valid sockaddr of at least `addrlen` bytes, per
/// the `connect(2)` contract.
pub unsafe fn connect_tx(fd: RawFd, addr: *const libc::sockaddr, addrlen: libc::socklen_t) -> Result<()> {
    require_irrevocable()?;
    let rc = libc::connect(fd, addr, addrlen);
    if rc != 0 {
        return Err(PicotmError::errno(current_errno()));
    }
    push_op(OPCODE_CONNECT, OpKind::Irrevocable, Vec::new(), None)
}

/// Accepts a connection on `fd`. Same irrevocable-only rationale as
/// [`connect_tx`].
pub fn accept_tx(fd: RawFd) -> Result<RawFd> {
    require_irrevocable()?;
    // SAFETY: null out-pointers are permitted by `accept(2)` when the
    // peer address is not needed.
    let accepted = unsafe { libc::accept(fd, std::ptr::null_mut(), std::ptr::null_mut()) };
    if accepted < 0 {
        return Err(PicotmError::errno(current_errno()));
    }
    push_op(OPCODE_ACCEPT, OpKind::Irrevocable, Vec::new(), None)?;
    Ok(accepted)
}
