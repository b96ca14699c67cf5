//! Module registry, event log, and per-thread transaction state machine —
//! the kernel every picotm module plugs into.

mod event_log;
mod registry;
mod txn;

pub use event_log::EventLog;
pub use registry::{register_module, uninit_all, ErrorSlot, ModuleCallbacks};
pub use txn::{
    append_event, go_irrevocable, inject_event, is_irrevocable, run_transaction, RuntimeConfig,
};
