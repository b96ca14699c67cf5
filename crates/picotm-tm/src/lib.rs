//! Runtime-side transactional memory: the frame map, per-transaction page
//! log, and the TM module that wires load/store/loadstore/privatize into
//! the `picotm-core` commit/abort protocol via page-level two-phase
//! locking with optimistic reads.

mod frame;
mod frame_map;
mod module;
mod page_log;

pub use frame::{Frame, OwnerToken, BLOCK_BITS, BLOCK_SIZE};
pub use frame_map::FrameMap;
pub use module::{
    load, loadstore, privatize, privatize_c, store, PrivatizeMode, PRIVATIZE_C_MAX_SCAN,
};
pub use page_log::{PageLog, PageOp};
