//! Per-thread transaction state machine driving the commit/abort/restart
//! protocol over every registered module.

use std::cell::RefCell;
use std::sync::Mutex;
use std::time::Duration;

use picotm_error::{ErrorKind, PicotmError, Result};
use picotm_types::{Cookie, Event, ModuleId, Opcode};
use tracing::{debug, error, info};

use crate::event_log::EventLog;
use crate::registry::{self, ErrorSlot};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Inactive,
    Active,
    Committing,
    Aborting,
    Irrevocable,
    Poisoned,
}

/// Bounds on the restart/backoff policy of §4.1: a bounded number of
/// retries with optional exponential backoff, after which the runtime
/// forces irrevocable acquisition.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeConfig {
    pub max_restarts_before_irrevocable: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_restarts_before_irrevocable: 16,
            backoff_base: Duration::from_micros(50),
            backoff_cap: Duration::from_millis(10),
        }
    }
}

/// The global irrevocable token: at most one transaction process-wide may
/// be Irrevocable at any instant (universal invariant 8).
static IRREVOCABLE_TOKEN: Mutex<()> = Mutex::new(());

struct Transaction {
    state: TxnState,
    attempt: u32,
    irrevocable_guard: Option<std::sync::MutexGuard<'static, ()>>,
    event_log: EventLog,
}

impl Transaction {
    const fn new() -> Self {
        Self {
            state: TxnState::Inactive,
            attempt: 0,
            irrevocable_guard: None,
            event_log: EventLog::new(),
        }
    }
}

thread_local! {
    static TXN: RefCell<Transaction> = RefCell::new(Transaction::new());
}

/// Appends an event to the current thread's active transaction. Returns an
/// internal error if called with no transaction active — a programming
/// error in caller code, not a runtime condition the spec contemplates.
pub fn append_event(module_id: ModuleId, opcode: Opcode, cookie: Cookie) -> Result<()> {
    TXN.with_borrow_mut(|txn| {
        if txn.state != TxnState::Active {
            return Err(PicotmError::internal(
                "append_event called with no active transaction",
            ));
        }
        txn.event_log.append(Event::new(module_id, opcode, cookie));
        Ok(())
    })
}

/// Records an event unconditionally, even when the calling module has no
/// opcode it would otherwise emit (the errno module's use case). Mechanically
/// identical to [`append_event`]; kept as a distinct name for parity with
/// the two operations the registry exposes.
pub fn inject_event(module_id: ModuleId, opcode: Opcode, cookie: Cookie) -> Result<()> {
    append_event(module_id, opcode, cookie)
}

#[must_use]
pub fn is_irrevocable() -> bool {
    TXN.with_borrow(|txn| txn.state == TxnState::Irrevocable)
}

/// Promotes the current transaction to Irrevocable. Succeeds at most once
/// globally at a time, serialized via a single global token. If the token
/// is already held, this reports a conflict and the caller must restart.
pub fn go_irrevocable() -> Result<()> {
    TXN.with_borrow_mut(|txn| {
        if txn.state == TxnState::Irrevocable {
            return Ok(());
        }
        match IRREVOCABLE_TOKEN.try_lock() {
            Ok(guard) => {
                txn.irrevocable_guard = Some(guard);
                txn.state = TxnState::Irrevocable;
                info!("transaction promoted to irrevocable");
                Ok(())
            }
            Err(_) => {
                debug!("irrevocable token held elsewhere, signalling conflict");
                Err(PicotmError::conflicting(None))
            }
        }
    })
}

fn release_irrevocable(txn: &mut Transaction) {
    txn.irrevocable_guard = None;
}

/// Whether the attempt in progress holds the global irrevocable token.
/// Checked instead of `txn.state == TxnState::Irrevocable` because `commit`
/// overwrites `state` to `Committing` before validate/apply run, which
/// would otherwise hide that the attempt started out irrevocable; the
/// guard itself is only ever set by `go_irrevocable` and cleared by
/// `release_irrevocable`, so it stays a reliable witness across that
/// transition.
fn holds_irrevocable_token() -> bool {
    TXN.with_borrow(|txn| txn.irrevocable_guard.is_some())
}

/// An irrevocable transaction must never abort (universal invariant 8);
/// a conflict that reaches it here is non-recoverable. Skips the abort
/// protocol entirely, poisons the thread's transaction handle, and marks
/// the error non-recoverable for the caller.
fn fatal_irrevocable_conflict(err: PicotmError) -> PicotmError {
    TXN.with_borrow_mut(|txn| {
        txn.event_log.clear();
        txn.state = TxnState::Poisoned;
        release_irrevocable(txn);
    });
    error!(%err, "conflict while irrevocable is non-recoverable, transaction poisoned");
    err.mark_non_recoverable()
}

fn run_phase(
    name: &'static str,
    mut f: impl FnMut(&mut dyn registry::ModuleCallbacks, &mut ErrorSlot),
) -> Result<()> {
    let mut first_error: Option<PicotmError> = None;
    registry::for_each_in_order(|module| {
        if first_error.is_some() {
            return;
        }
        let mut slot = ErrorSlot::new();
        f(module, &mut slot);
        if let Some(err) = slot.take() {
            error!(phase = name, %err, "module phase reported an error");
            first_error = Some(err);
        }
    });
    first_error.map_or(Ok(()), Err)
}

fn run_phase_reverse(
    name: &'static str,
    mut f: impl FnMut(&mut dyn registry::ModuleCallbacks, &mut ErrorSlot),
) -> Result<()> {
    let mut first_error: Option<PicotmError> = None;
    registry::for_each_in_reverse(|module| {
        if first_error.is_some() {
            return;
        }
        let mut slot = ErrorSlot::new();
        f(module, &mut slot);
        if let Some(err) = slot.take() {
            error!(phase = name, %err, "module phase reported an error");
            first_error = Some(err);
        }
    });
    first_error.map_or(Ok(()), Err)
}

fn begin() {
    TXN.with_borrow_mut(|txn| {
        let fresh = txn.state == TxnState::Inactive;
        txn.state = TxnState::Active;
        txn.event_log.clear();
        if fresh {
            txn.attempt = 0;
        }
        debug!(attempt = txn.attempt, "transaction begin");
    });
}

/// Runs the commit protocol: lock, validate, apply, update_cc, finish,
/// clear logs, unlock.
fn commit() -> Result<()> {
    TXN.with_borrow_mut(|txn| txn.state = TxnState::Committing);

    run_phase("lock", |m, e| m.lock(e))?;
    run_phase("validate", |m, e| m.validate(true, e))?;

    let events: Vec<Event> = TXN.with_borrow(|txn| txn.event_log.iter_forward().copied().collect());
    for event in events {
        let mut slot = ErrorSlot::new();
        registry::dispatch_to(event.module_id, |m| {
            m.apply_event(event.opcode, event.cookie, &mut slot);
        });
        if let Some(err) = slot.take() {
            error!(%err, "apply_event reported an error");
            return Err(err);
        }
    }

    run_phase("update_cc", |m, e| m.update_cc(false, e))?;
    run_phase("finish", |m, e| m.finish(e))?;

    TXN.with_borrow_mut(|txn| txn.event_log.clear());
    run_phase("unlock", |m, e| m.unlock(e))?;

    TXN.with_borrow_mut(|txn| {
        txn.state = TxnState::Inactive;
        release_irrevocable(txn);
    });
    info!("transaction committed");
    Ok(())
}

/// Runs the abort protocol: undo (reverse order), clear_cc (reverse
/// registration order), finish.
fn abort() {
    TXN.with_borrow_mut(|txn| txn.state = TxnState::Aborting);

    let events: Vec<Event> =
        TXN.with_borrow(|txn| txn.event_log.iter_backward().copied().collect());
    for event in events {
        let mut slot = ErrorSlot::new();
        registry::dispatch_to(event.module_id, |m| {
            m.undo_event(event.opcode, event.cookie, &mut slot);
        });
        // Undo errors are not themselves recoverable by restarting (we are
        // already unwinding); surface via tracing, continue unwinding.
        if let Some(err) = slot.take() {
            error!(%err, "undo_event reported an error");
        }
    }

    let _ = run_phase_reverse("clear_cc", |m, e| m.clear_cc(false, e));
    let _ = run_phase_reverse("finish", |m, e| m.finish(e));

    TXN.with_borrow_mut(|txn| {
        txn.event_log.clear();
        txn.attempt += 1;
        txn.state = TxnState::Inactive;
        release_irrevocable(txn);
    });
    debug!("transaction aborted");
}

fn backoff_delay(config: &RuntimeConfig, attempt: u32) -> Duration {
    let scaled = config.backoff_base.saturating_mul(1u32 << attempt.min(16));
    scaled.min(config.backoff_cap)
}

/// Runs `body` to completion inside a transaction, retrying on conflicts
/// per `config`'s restart policy and forcing irrevocable mode once the
/// retry budget is exhausted. This is the driver behind the facade crate's
/// `atomically()`.
pub fn run_transaction<T>(config: &RuntimeConfig, mut body: impl FnMut() -> Result<T>) -> Result<T> {
    loop {
        begin();
        let outcome = body();

        match outcome {
            Ok(value) => match commit() {
                Ok(()) => return Ok(value),
                Err(err) if err.is_conflicting() => {
                    if holds_irrevocable_token() {
                        return Err(fatal_irrevocable_conflict(err));
                    }
                    abort();
                }
                Err(err) => {
                    abort();
                    return Err(err);
                }
            },
            Err(err) if err.is_conflicting() => {
                if holds_irrevocable_token() {
                    return Err(fatal_irrevocable_conflict(err));
                }
                abort();
            }
            Err(err) => {
                abort();
                return Err(err);
            }
        }

        let attempt = TXN.with_borrow(|txn| txn.attempt);
        if attempt >= config.max_restarts_before_irrevocable {
            if let Err(err) = go_irrevocable() {
                return Err(err);
            }
            continue;
        }

        let delay = backoff_delay(config, attempt);
        if delay > Duration::ZERO {
            std::thread::sleep(delay);
        }
    }
}

/// Forces the current thread's transaction into `Active` state, bypassing
/// `run_transaction`. Exists only so a module crate's own unit tests can
/// call its `*_tx`/`exec_*`/`save` entry points directly, the way they
/// would be called from inside a real transaction body; production code
/// never needs this since `run_transaction` already calls `begin()`.
#[cfg(feature = "test-util")]
pub fn force_active_for_test() {
    TXN.with_borrow_mut(|txn| {
        txn.state = TxnState::Active;
        txn.event_log.clear();
    });
}

/// Returns the Error value's errno/error-code view for the last error seen
/// by the caller, per §6's status accessors. Callers typically just
/// inspect the `PicotmError` returned from `atomically`/`run_transaction`
/// directly; this module does not buffer a separate "last error" because
/// the Rust rendition threads errors through `Result` rather than a
/// side channel.
pub const fn error_kind_matches_conflict(kind: &ErrorKind) -> bool {
    matches!(kind, ErrorKind::Conflicting(_))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::register_module;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    struct NoopModule;
    impl registry::ModuleCallbacks for NoopModule {}

    #[test]
    fn begin_commit_with_no_operations_is_a_no_op() {
        register_module(Box::new(NoopModule));
        let result = run_transaction(&RuntimeConfig::default(), || Ok::<(), PicotmError>(()));
        assert!(result.is_ok());
        assert_eq!(TXN.with_borrow(|t| t.state), TxnState::Inactive);
        registry::uninit_all();
    }

    struct ConflictOnceThenOk(Arc<AtomicU32>);
    impl registry::ModuleCallbacks for ConflictOnceThenOk {}

    #[test]
    fn conflicting_body_error_retries_until_success() {
        register_module(Box::new(ConflictOnceThenOk(Arc::new(AtomicU32::new(0)))));
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = attempts.clone();

        let result = run_transaction(&RuntimeConfig::default(), move || {
            let n = attempts_clone.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                Err(PicotmError::conflicting(None))
            } else {
                Ok(())
            }
        });

        assert!(result.is_ok());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        registry::uninit_all();
    }

    #[test]
    fn non_recoverable_error_propagates_without_retry() {
        register_module(Box::new(NoopModule));
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = attempts.clone();

        let result: Result<()> = run_transaction(&RuntimeConfig::default(), move || {
            attempts_clone.fetch_add(1, Ordering::SeqCst);
            Err(PicotmError::internal("boom"))
        });

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        registry::uninit_all();
    }

    #[test]
    fn irrevocable_token_excludes_concurrent_holders() {
        assert!(!is_irrevocable());
        go_irrevocable().unwrap();
        assert!(is_irrevocable());
        TXN.with_borrow_mut(|txn| {
            txn.event_log.clear();
            release_irrevocable(txn);
            txn.state = TxnState::Inactive;
        });
    }
}
