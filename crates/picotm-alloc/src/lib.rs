//! Allocator module: deferred-free and undoable-alloc bookkeeping.
//!
//! Grounded on `allocator_tx.c`'s two-command table (`CMD_FREE`,
//! `CMD_POSIX_MEMALIGN`): a `free()` is recorded but not executed until
//! commit (so abort leaves the pointer live); a `posix_memalign()`
//! allocates eagerly and is only undone (freed) on abort. `calloc_tx`,
//! `malloc_tx` and `realloc_tx` compose these two primitives with TM
//! privatization of the destination buffer, per spec.md §4.4.

use std::cell::RefCell;

use picotm_core::{append_event, register_module, ErrorSlot, ModuleCallbacks};
use picotm_error::{PicotmError, Result};
use picotm_types::{Cookie, ModuleId, Opcode};
use picotm_tm::PrivatizeMode;

const OPCODE_FREE: u16 = 0;
const OPCODE_POSIX_MEMALIGN: u16 = 1;

/// Default alignment used when the caller does not request one (matches
/// `malloc`'s implicit max-alignment guarantee).
pub const DEFAULT_ALIGNMENT: usize = std::mem::align_of::<libc::max_align_t>();

fn round_to_word(size: usize) -> usize {
    let mask = std::mem::size_of::<usize>() - 1;
    (size + mask) & !mask
}

#[derive(Default)]
struct AllocatorTx {
    /// Pointers scheduled for free (commit) or allocated (undo on abort),
    /// indexed by cookie — mirrors `allocator_tx::ptrtab`.
    ptrtab: Vec<usize>,
}

impl AllocatorTx {
    fn append(&mut self, ptr: usize, opcode: u16, module_id: ModuleId) -> Result<()> {
        let cookie = u32::try_from(self.ptrtab.len())
            .map_err(|_| PicotmError::internal("allocator ptrtab overflowed u32"))?;
        self.ptrtab.push(ptr);
        append_event(module_id, Opcode(opcode), Cookie(cookie))
    }
}

thread_local! {
    static STATE: RefCell<AllocatorTx> = RefCell::new(AllocatorTx::default());
    static MODULE_ID: std::cell::Cell<Option<ModuleId>> = const { std::cell::Cell::new(None) };
}

struct AllocatorCallbacks;

impl ModuleCallbacks for AllocatorCallbacks {
    fn apply_event(&mut self, opcode: Opcode, cookie: Cookie, error: &mut ErrorSlot) {
        STATE.with(|state| {
            let state = state.borrow();
            let Some(&ptr) = state.ptrtab.get(cookie.0 as usize) else {
                error.set(PicotmError::internal("allocator apply: cookie out of range"));
                return;
            };
            if opcode.0 == OPCODE_FREE {
                // SAFETY: `ptr` was recorded by `exec_free` from a pointer
                // the caller obtained from this allocator and has not
                // freed since (picotm's single-free discipline).
                unsafe { libc::free(ptr as *mut libc::c_void) };
            }
            // PosixMemalign needs no apply step: the allocation already
            // happened eagerly in `exec_posix_memalign`.
        });
    }

    fn undo_event(&mut self, opcode: Opcode, cookie: Cookie, error: &mut ErrorSlot) {
        STATE.with(|state| {
            let state = state.borrow();
            let Some(&ptr) = state.ptrtab.get(cookie.0 as usize) else {
                error.set(PicotmError::internal("allocator undo: cookie out of range"));
                return;
            };
            if opcode.0 == OPCODE_POSIX_MEMALIGN {
                // SAFETY: the allocation made by `exec_posix_memalign` is
                // rolled back because the transaction that made it never
                // committed.
                unsafe { libc::free(ptr as *mut libc::c_void) };
            }
            // Free needs no undo step: the pointer was never actually
            // freed, so it is already in its pre-transaction state.
        });
    }

    fn finish(&mut self, _error: &mut ErrorSlot) {
        STATE.with(|state| state.borrow_mut().ptrtab.clear());
    }
}

fn ensure_registered() -> ModuleId {
    MODULE_ID.with(|cell| {
        if let Some(id) = cell.get() {
            return id;
        }
        let id = register_module(Box::new(AllocatorCallbacks));
        cell.set(Some(id));
        id
    })
}

/// Records `ptr` to be freed at commit. Not freed immediately: if the
/// transaction aborts, the pointer remains live.
pub fn exec_free(ptr: usize) -> Result<()> {
    let module_id = ensure_registered();
    STATE.with(|state| state.borrow_mut().append(ptr, OPCODE_FREE, module_id))
}

/// Allocates `size` bytes aligned to `alignment` immediately, recording the
/// result so abort frees it again.
pub fn exec_posix_memalign(size: usize, alignment: usize) -> Result<usize> {
    let module_id = ensure_registered();
    let mut mem: *mut libc::c_void = std::ptr::null_mut();
    // SAFETY: `mem` is a valid out-pointer; `alignment` and the rounded
    // size are validated by `posix_memalign` itself (non-power-of-two
    // alignment is reported back as an errno, not undefined behavior).
    let err = unsafe { libc::posix_memalign(&mut mem, alignment, round_to_word(size)) };
    if err != 0 {
        return Err(PicotmError::errno(err));
    }
    let ptr = mem as usize;
    STATE.with(|state| state.borrow_mut().append(ptr, OPCODE_POSIX_MEMALIGN, module_id))?;
    Ok(ptr)
}

/// Transactional `malloc`: allocates `size` bytes and privatizes them for
/// exclusive use by this transaction.
pub fn malloc_tx(size: usize) -> Result<usize> {
    let ptr = exec_posix_memalign(size, DEFAULT_ALIGNMENT)?;
    picotm_tm::privatize(ptr, size, PrivatizeMode::Store)?;
    Ok(ptr)
}

/// Transactional `calloc`: allocates and zero-initializes `nmemb * size`
/// bytes, then privatizes them.
pub fn calloc_tx(nmemb: usize, size: usize) -> Result<usize> {
    let total = nmemb
        .checked_mul(size)
        .ok_or_else(|| PicotmError::errno(libc::ENOMEM))?;
    let ptr = exec_posix_memalign(total, DEFAULT_ALIGNMENT)?;
    // SAFETY: `ptr` was just allocated by us with `total` bytes and is not
    // yet visible to any other transaction.
    unsafe { std::ptr::write_bytes(ptr as *mut u8, 0, total) };
    picotm_tm::privatize(ptr, total, PrivatizeMode::Store)?;
    Ok(ptr)
}

/// Transactional `realloc`: `ptr == 0` behaves like `malloc_tx`; otherwise
/// allocates a new block, copies the lesser of the old and new sizes, and
/// schedules the old block for free at commit.
pub fn realloc_tx(ptr: usize, old_size: usize, new_size: usize) -> Result<usize> {
    if ptr == 0 {
        return malloc_tx(new_size);
    }
    let new_ptr = exec_posix_memalign(new_size, DEFAULT_ALIGNMENT)?;
    let copy_len = old_size.min(new_size);
    if copy_len > 0 {
        picotm_tm::loadstore(ptr, new_ptr, copy_len)?;
    }
    picotm_tm::privatize(new_ptr, new_size, PrivatizeMode::Store)?;
    exec_free(ptr)?;
    Ok(new_ptr)
}
