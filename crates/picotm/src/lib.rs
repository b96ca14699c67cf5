//! Public facade over the picotm runtime: wires the module kernel
//! (`picotm-core`) together with its resource modules (`picotm-tm`,
//! `picotm-alloc`, `picotm-errno`, `picotm-fildes`, `picotm-numeric`) and
//! exposes the §6 external-interface surface as safe Rust.
//!
//! `atomically` is the entry point application code calls instead of the
//! original's `picotm_begin`/`picotm_commit`/`picotm_end` triad: it owns
//! the restart loop (§4.0's resolution of the Design Notes' open point on
//! the restart mechanism), retrying `body` on `Conflicting` errors per
//! `picotm_core::RuntimeConfig`'s bounded-retry/backoff policy and forcing
//! irrevocable mode once the budget is exhausted.

pub use picotm_core::RuntimeConfig;
pub use picotm_error::{ConflictHandle, ErrorCode, ErrorKind, PicotmError, Result};
pub use picotm_types::{Cookie, Event, ModuleId, Opcode};

pub use picotm_core::{
    register_module, uninit_all, ErrorSlot, ModuleCallbacks,
};

/// TM (transactional memory) operations, re-exported at the top level the
/// way the original's wrappers call directly into `libpicotm`'s `tm`
/// module without an extra namespace.
pub mod tm {
    pub use picotm_tm::{load, loadstore, privatize, privatize_c, store, PrivatizeMode};
}

/// Allocator-module operations.
pub mod alloc {
    pub use picotm_alloc::{calloc_tx, exec_free, exec_posix_memalign, malloc_tx, realloc_tx};
}

/// Errno-module operations.
pub mod errno {
    pub use picotm_errno::{current_errno, is_saved, recovery, save, set_recovery, RecoveryPolicy};
}

/// File-table module operations.
pub mod fildes {
    pub use picotm_fildes::{
        accept_tx, close_tx, connect_tx, dup2_tx, lseek_tx, mkstemp_tx, read_tx, write_tx, Whence,
    };
}

/// Checked-arithmetic modules, one per integer type covered by the
/// representative subset (§4.7).
pub mod numeric {
    pub use picotm_numeric::{cast_tx, i32_ops, i64_ops, u32_ops, u64_ops};
}

/// Runs `body` to completion inside a transaction using the default
/// restart policy ([`RuntimeConfig::default`]). Equivalent to the
/// original's `picotm_begin(); body(); picotm_commit(); picotm_end();`
/// triad, minus the explicit calls: restart and irrevocable escalation
/// are handled internally.
pub fn atomically<T>(body: impl FnMut() -> Result<T>) -> Result<T> {
    picotm_core::run_transaction(&RuntimeConfig::default(), body)
}

/// Same as [`atomically`] with an explicit restart policy, for callers
/// that need a tighter or looser retry budget than the default.
pub fn atomically_with_config<T>(
    config: &RuntimeConfig,
    body: impl FnMut() -> Result<T>,
) -> Result<T> {
    picotm_core::run_transaction(config, body)
}

/// Promotes the current transaction to irrevocable mode. Must be called
/// from inside a transaction body; succeeds at most once globally at a
/// time (§4.1).
pub fn go_irrevocable() -> Result<()> {
    picotm_core::go_irrevocable()
}

#[must_use]
pub fn is_irrevocable() -> bool {
    picotm_core::is_irrevocable()
}

/// Introduces work into the current transaction's event log outside of a
/// module's own wrapper functions — the sole way (along with
/// [`inject_event`]) to append an event per §4.2.
pub fn append_event(module: ModuleId, opcode: Opcode, cookie: Cookie) -> Result<()> {
    picotm_core::append_event(module, opcode, cookie)
}

/// Records an event unconditionally, even when no opcode would otherwise
/// be emitted — the errno module's idempotent `save()` is built on this.
pub fn inject_event(module: ModuleId, opcode: Opcode, cookie: Cookie) -> Result<()> {
    picotm_core::inject_event(module, opcode, cookie)
}

/// The error-status accessors of §6. The Rust rendition threads errors
/// through `Result` rather than a side-channel "last error" the state
/// machine buffers for later inspection (DESIGN.md records this as the
/// resolution of the long-jump-vs-Result Design Notes point), so these
/// operate directly on a `PicotmError` a caller already has in hand —
/// typically the `Err` returned from [`atomically`] — instead of reading
/// implicit thread-local state.
#[must_use]
pub const fn error_status(error: &PicotmError) -> &ErrorKind {
    error.kind()
}

/// The errno value the application would observe for `error`, if any.
#[must_use]
pub const fn error_as_errno(error: &PicotmError) -> Option<i32> {
    error.as_errno()
}

/// Re-tags `error` as a conflicting access against `handle`, for module
/// code that detects a conflict after already constructing an error of a
/// different kind (mirrors `picotm_error_mark_as_conflicting`).
#[must_use]
pub fn error_mark_conflicting(handle: Option<ConflictHandle>) -> PicotmError {
    PicotmError::conflicting(handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Round-trip / idempotence laws (spec.md §8).

    #[test]
    fn begin_commit_with_no_operations_is_a_no_op() {
        let result = atomically(|| Ok::<(), PicotmError>(()));
        assert!(result.is_ok());
        assert!(!is_irrevocable());
    }

    #[test]
    fn store_then_load_within_one_transaction_reads_own_write() {
        let mut buf = [0u8; 8];
        let addr = buf.as_mut_ptr() as usize;
        atomically(|| {
            tm::store(addr, b"picotm!!")?;
            let mut out = [0u8; 8];
            tm::load(addr, &mut out)?;
            assert_eq!(&out, b"picotm!!");
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn privatize_loadstore_then_commit_equals_a_plain_memcpy() {
        let mut buf = [0u8; 4];
        let addr = buf.as_mut_ptr() as usize;
        atomically(|| {
            tm::privatize(addr, 4, tm::PrivatizeMode::LoadStore)?;
            tm::store(addr, &[1, 2, 3, 4])?;
            Ok(())
        })
        .unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);
    }

    #[test]
    fn begin_abort_is_equivalent_to_no_state_change() {
        let mut buf = [0u8; 4];
        let addr = buf.as_mut_ptr() as usize;
        buf.copy_from_slice(&[9, 9, 9, 9]);

        let result: Result<()> = atomically(|| {
            tm::store(addr, &[1, 2, 3, 4])?;
            Err(PicotmError::internal("force abort"))
        });
        assert!(result.is_err());
        assert_eq!(buf, [9, 9, 9, 9], "aborted store must never reach memory");
    }

    #[test]
    fn arithmetic_overflow_surfaces_as_errno_erange() {
        let result = atomically(|| numeric::i32_ops::add_tx(i32::MAX, 1));
        let err = result.unwrap_err();
        assert_eq!(error_as_errno(&err), Some(libc::ERANGE));
    }
}
