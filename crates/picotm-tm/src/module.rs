//! Runtime-side transactional-memory module: registers with
//! `picotm-core`, owns the process-wide frame map and the per-thread page
//! log, and exposes the load/store/loadstore/privatize operations
//! wrappers call.

use std::cell::{Cell, RefCell};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

use picotm_core::{append_event, register_module, ErrorSlot, ModuleCallbacks};
use picotm_error::{PicotmError, Result};
use picotm_types::{Cookie, ModuleId, Opcode};
use tracing::debug;

use crate::frame::OwnerToken;
use crate::frame_map::FrameMap;
use crate::page_log::PageLog;

/// Bound on how far `privatize_c` scans looking for a terminator byte,
/// per SPEC_FULL.md §4.3 (the distilled spec leaves this unspecified; this
/// follows the original's default page-sized scan window).
pub const PRIVATIZE_C_MAX_SCAN: usize = 4096;

/// What a `privatize` call promises about future access to the region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrivatizeMode {
    Load,
    Store,
    LoadStore,
}

const OPCODE_LOAD: u16 = 0;
const OPCODE_STORE: u16 = 1;
const OPCODE_LOADSTORE: u16 = 2;
const OPCODE_PRIVATIZE: u16 = 3;

static FRAME_MAP: OnceLock<FrameMap> = OnceLock::new();

fn frame_map() -> &'static FrameMap {
    FRAME_MAP.get_or_init(FrameMap::new)
}

static NEXT_OWNER: AtomicU64 = AtomicU64::new(1);

fn fresh_owner() -> OwnerToken {
    NEXT_OWNER.fetch_add(1, Ordering::Relaxed)
}

struct TmState {
    owner: OwnerToken,
    page_log: PageLog,
    /// Apply/undo are driven once per commit/abort even though the event
    /// log may carry several TM events (one per operation): the page log
    /// already holds the complete, correctly ordered picture, and cookie
    /// is always zero (the module "reconstructs the page list on
    /// apply/undo" per spec.md §4.3 step 4). This flag makes the second
    /// and later dispatches within one phase no-ops.
    phase_done: bool,
}

impl TmState {
    const fn new() -> Self {
        Self { owner: 0, page_log: PageLog::new(), phase_done: false }
    }

    fn owner_or_assign(&mut self) -> OwnerToken {
        if self.owner == 0 {
            self.owner = fresh_owner();
        }
        self.owner
    }
}

thread_local! {
    static STATE: RefCell<TmState> = RefCell::new(TmState::new());
    static MODULE_ID: Cell<Option<ModuleId>> = const { Cell::new(None) };
}

/// A zero-sized marker: all its methods reach the same thread's `STATE`
/// directly, since the registry that holds it is itself thread-local and
/// a module's callbacks only ever run on the thread that registered them.
struct TmCallbacks;

impl ModuleCallbacks for TmCallbacks {
    fn validate(&mut self, _is_end_of_tx: bool, error: &mut ErrorSlot) {
        STATE.with(|state| {
            if let Err(err) = state.borrow().page_log.validate() {
                error.set(err);
            }
        });
    }

    fn apply_event(&mut self, _opcode: Opcode, _cookie: Cookie, _error: &mut ErrorSlot) {
        STATE.with(|state| {
            let mut state = state.borrow_mut();
            if state.phase_done {
                return;
            }
            let owner = state.owner;
            state.page_log.apply(owner);
            state.phase_done = true;
        });
    }

    fn undo_event(&mut self, _opcode: Opcode, _cookie: Cookie, _error: &mut ErrorSlot) {
        STATE.with(|state| {
            let mut state = state.borrow_mut();
            if state.phase_done {
                return;
            }
            let owner = state.owner;
            state.page_log.undo(owner);
            state.phase_done = true;
        });
    }

    fn finish(&mut self, _error: &mut ErrorSlot) {
        STATE.with(|state| {
            let mut state = state.borrow_mut();
            state.owner = 0;
            state.phase_done = false;
        });
        debug!("tm module finished transaction");
    }
}

fn ensure_registered() -> ModuleId {
    MODULE_ID.with(|cell| {
        if let Some(id) = cell.get() {
            return id;
        }
        let id = register_module(Box::new(TmCallbacks));
        cell.set(Some(id));
        id
    })
}

fn with_state<R>(f: impl FnOnce(&mut TmState) -> R) -> R {
    STATE.with(|state| f(&mut state.borrow_mut()))
}

fn record_op(opcode: u16) -> Result<()> {
    let module_id = ensure_registered();
    append_event(module_id, Opcode(opcode), Cookie::ZERO)
}

/// Copies `buf.len()` bytes from process memory at `addr` into `buf`,
/// consulting this transaction's uncommitted stores first.
pub fn load(addr: usize, buf: &mut [u8]) -> Result<()> {
    let owner = with_state(TmState::owner_or_assign);
    with_state(|state| state.page_log.load(frame_map(), owner, addr, buf))?;
    record_op(OPCODE_LOAD)
}

/// Buffers `data` for write-back to process memory at commit.
pub fn store(addr: usize, data: &[u8]) -> Result<()> {
    let owner = with_state(TmState::owner_or_assign);
    with_state(|state| state.page_log.store(frame_map(), owner, addr, data))?;
    record_op(OPCODE_STORE)
}

/// Copies `size` bytes from `src` to `dst`, transactionally.
pub fn loadstore(src: usize, dst: usize, size: usize) -> Result<()> {
    let owner = with_state(TmState::owner_or_assign);
    with_state(|state| state.page_log.loadstore(frame_map(), owner, src, dst, size))?;
    record_op(OPCODE_LOADSTORE)
}

/// Promises that `size` bytes at `addr` will only be accessed inside this
/// transaction, letting the runtime treat the region as owned memory.
pub fn privatize(addr: usize, size: usize, mode: PrivatizeMode) -> Result<()> {
    let owner = with_state(TmState::owner_or_assign);
    with_state(|state| state.page_log.privatize(frame_map(), owner, addr, size, mode))?;
    record_op(OPCODE_PRIVATIZE)
}

/// Privatizes bytes starting at `addr` up to and including the first
/// occurrence of `terminator`, bounded by [`PRIVATIZE_C_MAX_SCAN`]. Returns
/// the number of bytes privatized (including the terminator), or an
/// internal error if the terminator was not found within the bound.
pub fn privatize_c(addr: usize, terminator: u8, mode: PrivatizeMode) -> Result<usize> {
    for scanned in 1..=PRIVATIZE_C_MAX_SCAN {
        let mut byte = [0u8; 1];
        // Loads one byte at a time through the transactional path so the
        // scan itself participates in the page log like any other read.
        load(addr + scanned - 1, &mut byte)?;
        if byte[0] == terminator {
            privatize(addr, scanned, mode)?;
            return Ok(scanned);
        }
    }
    Err(PicotmError::internal(format!(
        "privatize_c: no terminator found within {PRIVATIZE_C_MAX_SCAN} bytes"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reset_thread_state() {
        // Release any frames still held by the previous test before
        // dropping its state, since `FRAME_MAP` is a process-wide static
        // shared by every test in this binary.
        with_state(|s| {
            let owner = s.owner;
            s.page_log.undo(owner);
        });
        STATE.with(|s| *s.borrow_mut() = TmState::new());
        picotm_core::uninit_all();
        MODULE_ID.with(|c| c.set(None));
        picotm_core::force_active_for_test();
    }

    #[test]
    fn store_then_load_round_trips() {
        reset_thread_state();
        let mut buf = [0u8; 16];
        let addr = buf.as_mut_ptr() as usize;
        store(addr, b"hello, picotm!!!").unwrap();
        let mut out = [0u8; 16];
        load(addr, &mut out).unwrap();
        assert_eq!(&out, b"hello, picotm!!!");
        reset_thread_state();
    }

    #[test]
    fn privatize_c_finds_a_nul_terminator() {
        reset_thread_state();
        let mut buf = *b"abc\0xyz";
        let addr = buf.as_mut_ptr() as usize;
        let n = privatize_c(addr, 0, PrivatizeMode::LoadStore).unwrap();
        assert_eq!(n, 4);
        reset_thread_state();
    }

    #[test]
    fn loadstore_then_apply_publishes_destination() {
        reset_thread_state();
        let mut src = *b"xyzw";
        let mut dst = [0u8; 4];
        loadstore(src.as_mut_ptr() as usize, dst.as_mut_ptr() as usize, 4).unwrap();

        let module_id = ensure_registered();
        with_state(|state| {
            let owner = state.owner;
            state.page_log.apply(owner);
        });
        let _ = module_id;
        assert_eq!(&dst, b"xyzw");
        reset_thread_state();
    }
}
