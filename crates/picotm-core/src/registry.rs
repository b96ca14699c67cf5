//! Module registry: a per-thread, append-only list of registered modules.
//!
//! Registration is single-assignment per thread per module — each module
//! crate registers itself lazily, the first time it is used on a given
//! thread, and stays registered until thread exit. All registered modules
//! participate in every commit/abort phase; a module that was never touched
//! during a particular transaction simply sees an empty slice of its own
//! events and its callbacks are no-ops by default.

use std::cell::RefCell;

use picotm_error::PicotmError;
use picotm_types::{Cookie, ModuleId, Opcode};

/// The channel module code writes failures into instead of returning them,
/// mirroring the source's `recover_from` contract: a callback does not
/// return `Result`, it records at most one error and the caller (the state
/// machine) inspects the slot afterwards.
#[derive(Debug, Default)]
pub struct ErrorSlot(Option<PicotmError>);

impl ErrorSlot {
    #[must_use]
    pub const fn new() -> Self {
        Self(None)
    }

    /// Records an error. Only the first call has effect per slot use; later
    /// calls are ignored, matching "at most one error per phase."
    pub fn set(&mut self, error: PicotmError) {
        if self.0.is_none() {
            self.0 = Some(error);
        }
    }

    #[must_use]
    pub fn is_set(&self) -> bool {
        self.0.is_some()
    }

    pub fn take(&mut self) -> Option<PicotmError> {
        self.0.take()
    }
}

/// The callback surface a module registers with the runtime. Every method
/// is optional; the default implementation is a no-op, matching the
/// source's "any callback may be absent" registration contract.
pub trait ModuleCallbacks: Send {
    /// Called on commit entry, in registration order.
    fn lock(&mut self, error: &mut ErrorSlot) {
        let _ = error;
    }

    /// Called on commit exit, in registration order.
    fn unlock(&mut self, error: &mut ErrorSlot) {
        let _ = error;
    }

    /// Called for consistency checks during commit's validate phase.
    fn validate(&mut self, is_end_of_tx: bool, error: &mut ErrorSlot) {
        let _ = (is_end_of_tx, error);
    }

    /// Dispatches one of this module's own events during the apply phase.
    fn apply_event(&mut self, opcode: Opcode, cookie: Cookie, error: &mut ErrorSlot) {
        let _ = (opcode, cookie, error);
    }

    /// Dispatches one of this module's own events during the undo phase.
    fn undo_event(&mut self, opcode: Opcode, cookie: Cookie, error: &mut ErrorSlot) {
        let _ = (opcode, cookie, error);
    }

    /// Releases speculative concurrency-control state on commit.
    fn update_cc(&mut self, noundo: bool, error: &mut ErrorSlot) {
        let _ = (noundo, error);
    }

    /// Releases speculative concurrency-control state on abort.
    fn clear_cc(&mut self, noundo: bool, error: &mut ErrorSlot) {
        let _ = (noundo, error);
    }

    /// Always called last, before lock release, regardless of outcome.
    fn finish(&mut self, error: &mut ErrorSlot) {
        let _ = error;
    }

    /// Called at thread teardown.
    fn uninit(&mut self) {}
}

struct Registration {
    id: ModuleId,
    callbacks: Box<dyn ModuleCallbacks>,
}

thread_local! {
    static REGISTRY: RefCell<Vec<Registration>> = const { RefCell::new(Vec::new()) };
}

/// Registers a module on the current thread, returning its id. Call this
/// lazily from a module's own thread-local "get or init" accessor, not
/// eagerly at program start.
pub fn register_module(callbacks: Box<dyn ModuleCallbacks>) -> ModuleId {
    REGISTRY.with_borrow_mut(|registry| {
        let id = ModuleId::new(
            u16::try_from(registry.len()).expect("module registry overflowed u16"),
        );
        registry.push(Registration { id, callbacks });
        id
    })
}

/// Visits every registered module, in registration order.
pub(crate) fn for_each_in_order(mut f: impl FnMut(&mut dyn ModuleCallbacks)) {
    REGISTRY.with_borrow_mut(|registry| {
        for reg in registry.iter_mut() {
            f(reg.callbacks.as_mut());
        }
    });
}

/// Visits every registered module, in reverse registration order.
pub(crate) fn for_each_in_reverse(mut f: impl FnMut(&mut dyn ModuleCallbacks)) {
    REGISTRY.with_borrow_mut(|registry| {
        for reg in registry.iter_mut().rev() {
            f(reg.callbacks.as_mut());
        }
    });
}

/// Dispatches a single event to the module it belongs to.
pub(crate) fn dispatch_to(module_id: ModuleId, mut f: impl FnMut(&mut dyn ModuleCallbacks)) {
    REGISTRY.with_borrow_mut(|registry| {
        if let Some(reg) = registry.iter_mut().find(|reg| reg.id == module_id) {
            f(reg.callbacks.as_mut());
        }
    });
}

/// Runs `uninit` on every module and drops the registry. Intended to be
/// called as a thread winds down (e.g. from a thread-local destructor in
/// an embedding crate); picotm-core does not call this automatically.
pub fn uninit_all() {
    REGISTRY.with_borrow_mut(|registry| {
        for reg in registry.iter_mut() {
            reg.callbacks.uninit();
        }
        registry.clear();
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    struct CountingModule(Arc<AtomicU32>);

    impl ModuleCallbacks for CountingModule {
        fn lock(&mut self, _error: &mut ErrorSlot) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn registration_order_is_preserved_across_dispatch() {
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        struct Recording(Arc<parking_lot::Mutex<Vec<u16>>>, u16);
        impl ModuleCallbacks for Recording {
            fn lock(&mut self, _error: &mut ErrorSlot) {
                self.0.lock().push(self.1);
            }
        }

        let a = register_module(Box::new(Recording(order.clone(), 100)));
        let b = register_module(Box::new(Recording(order.clone(), 200)));
        assert!(a.get() < b.get());

        for_each_in_order(|m| {
            let mut slot = ErrorSlot::new();
            m.lock(&mut slot);
        });

        assert_eq!(*order.lock(), vec![100, 200]);
        uninit_all();
    }

    #[test]
    fn error_slot_keeps_first_error_only() {
        let mut slot = ErrorSlot::new();
        slot.set(PicotmError::internal("first"));
        slot.set(PicotmError::internal("second"));
        let err = slot.take().unwrap();
        assert_eq!(err.to_string(), "general error: first");
    }

    #[test]
    fn lock_callback_is_invoked() {
        let counter = Arc::new(AtomicU32::new(0));
        register_module(Box::new(CountingModule(counter.clone())));
        for_each_in_order(|m| {
            let mut slot = ErrorSlot::new();
            m.lock(&mut slot);
        });
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        uninit_all();
    }
}
