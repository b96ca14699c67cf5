//! Errno module: save-once-per-transaction of the thread's `errno`, with
//! undo-time restore.
//!
//! Grounded on `error_tx.c`: a single `ERROR_TX_FLAG_ERRNO_SAVED` flag
//! guards `save()` so only the first call in a transaction captures
//! `errno`; `undo` restores it; `finish` (called on both commit and
//! abort) clears the saved flag. `save()` always injects an event even
//! though it carries no module-specific opcode, because the registry's
//! event log is the only channel `undo`/`finish` are driven through.

use std::cell::Cell;

use picotm_core::{inject_event, register_module, ErrorSlot, ModuleCallbacks};
use picotm_error::Result;
use picotm_types::{Cookie, ModuleId, Opcode};

const OPCODE_SAVE: u16 = 0;

/// Whether the errno module retries automatically on a recoverable errno
/// or always surfaces it to the caller, per spec.md §3 Errno-module state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecoveryPolicy {
    #[default]
    Auto,
    Full,
}

#[derive(Default)]
struct ErrnoTx {
    saved_errno: i32,
    saved: bool,
    recovery: RecoveryPolicy,
}

thread_local! {
    static STATE: Cell<ErrnoTx> = Cell::new(ErrnoTx::default());
    static MODULE_ID: Cell<Option<ModuleId>> = const { Cell::new(None) };
}

fn with_state<R>(f: impl FnOnce(&mut ErrnoTx) -> R) -> R {
    STATE.with(|cell| {
        let mut state = cell.take();
        let result = f(&mut state);
        cell.set(state);
        result
    })
}

/// Reads the current thread's `errno`.
#[must_use]
pub fn current_errno() -> i32 {
    // SAFETY: `__errno_location` returns a valid pointer to the calling
    // thread's errno storage for the lifetime of the thread.
    unsafe { *libc::__errno_location() }
}

fn set_errno(value: i32) {
    // SAFETY: see `current_errno`.
    unsafe {
        *libc::__errno_location() = value;
    }
}

struct ErrnoCallbacks;

impl ModuleCallbacks for ErrnoCallbacks {
    fn undo_event(&mut self, _opcode: Opcode, _cookie: Cookie, _error: &mut ErrorSlot) {
        with_state(|state| {
            if state.saved {
                set_errno(state.saved_errno);
            }
        });
    }

    fn finish(&mut self, _error: &mut ErrorSlot) {
        with_state(|state| {
            state.saved = false;
        });
    }
}

fn ensure_registered() -> ModuleId {
    MODULE_ID.with(|cell| {
        if let Some(id) = cell.get() {
            return id;
        }
        let id = register_module(Box::new(ErrnoCallbacks));
        cell.set(Some(id));
        id
    })
}

/// Saves the current `errno` for this transaction, idempotently: the first
/// call per transaction captures the value and injects an undo-capable
/// event; later calls before the transaction ends are no-ops (testable
/// property 5: at most one errno event per transaction).
pub fn save() -> Result<()> {
    let module_id = ensure_registered();
    let already_saved = with_state(|state| state.saved);
    if already_saved {
        return Ok(());
    }
    let errno = current_errno();
    with_state(|state| {
        state.saved_errno = errno;
        state.saved = true;
    });
    inject_event(module_id, Opcode(OPCODE_SAVE), Cookie::ZERO)
}

#[must_use]
pub fn is_saved() -> bool {
    with_state(|state| state.saved)
}

pub fn set_recovery(policy: RecoveryPolicy) {
    with_state(|state| state.recovery = policy);
}

#[must_use]
pub fn recovery() -> RecoveryPolicy {
    with_state(|state| state.recovery)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reset() {
        STATE.with(|cell| cell.set(ErrnoTx::default()));
        picotm_core::uninit_all();
        MODULE_ID.with(|c| c.set(None));
        picotm_core::force_active_for_test();
    }

    #[test]
    fn save_is_idempotent_within_a_transaction() {
        reset();
        set_errno(5);
        save().unwrap();
        set_errno(42);
        save().unwrap(); // no-op: already saved
        assert_eq!(with_state(|s| s.saved_errno), 5);
        reset();
    }

    #[test]
    fn undo_restores_the_saved_errno() {
        reset();
        set_errno(5);
        save().unwrap();
        set_errno(42);

        let mut slot = ErrorSlot::new();
        let mut cb = ErrnoCallbacks;
        cb.undo_event(Opcode(OPCODE_SAVE), Cookie::ZERO, &mut slot);
        assert!(!slot.is_set());
        assert_eq!(current_errno(), 5);
        reset();
    }

    #[test]
    fn finish_clears_the_saved_flag_for_the_next_transaction() {
        reset();
        set_errno(7);
        save().unwrap();
        assert!(is_saved());

        let mut slot = ErrorSlot::new();
        let mut cb = ErrnoCallbacks;
        cb.finish(&mut slot);
        assert!(!slot.is_set());
        assert!(!is_saved());
        reset();
    }

    #[test]
    fn recovery_policy_defaults_to_auto() {
        reset();
        assert_eq!(recovery(), RecoveryPolicy::Auto);
        set_recovery(RecoveryPolicy::Full);
        assert_eq!(recovery(), RecoveryPolicy::Full);
        reset();
    }
}
