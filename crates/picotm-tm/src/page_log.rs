//! Per-transaction record of loaded/stored memory regions.
//!
//! One [`PageRecord`] per touched frame, in first-touch order. Grounded on
//! `vmem_tx.c`'s page list: a shadow buffer holding the frame's bytes at
//! first touch, a write mask recording which of those bytes this
//! transaction has since overwritten, and the operation kind that decides
//! what validate/apply/undo do with the record.

use std::collections::HashMap;

use picotm_error::{PicotmError, Result};

use crate::frame::{Frame, OwnerToken, BLOCK_MASK, BLOCK_SIZE};
use crate::frame_map::FrameMap;
use crate::module::PrivatizeMode;

/// What a page was touched for. `LoadStore` is the union of `Load` and
/// `Store`: validate checks its read portion, apply writes back its
/// written portion, exactly as if it were two records. `Privatize` carries
/// the mode the caller promised: a store-mode privatize is followed by a
/// direct write to the region that never goes through [`PageLog::store`],
/// so (like plain `Store`) it must not be read-checked at validate time;
/// a load or load-store privatize still reads through the region and is
/// checked like `Load`/`LoadStore`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageOp {
    Load,
    Store,
    LoadStore,
    Privatize(PrivatizeMode),
}

impl PageOp {
    /// Folds a new touch into the existing op for a page already present
    /// in the log (e.g. a `load` followed later by a `store` on the same
    /// frame becomes `LoadStore`).
    const fn merge(self, other: Self) -> Self {
        use PageOp::{Load, LoadStore, Privatize, Store};
        match (self, other) {
            (Privatize(a), Privatize(b)) => Privatize(merge_privatize_modes(a, b)),
            (Privatize(m), _) | (_, Privatize(m)) => Privatize(m),
            (Load, Load) => Load,
            (Store, Store) => Store,
            _ => LoadStore,
        }
    }

    const fn needs_read_check(self) -> bool {
        !matches!(self, Self::Store | Self::Privatize(PrivatizeMode::Store))
    }
}

/// Folds two privatize modes observed for the same page (e.g. re-privatized
/// after an earlier privatize of the same region): picks the stricter mode,
/// matching `PageOp::merge`'s own Load+Store -> LoadStore fallback.
const fn merge_privatize_modes(a: PrivatizeMode, b: PrivatizeMode) -> PrivatizeMode {
    use PrivatizeMode::{Load, LoadStore, Store};
    match (a, b) {
        (Store, Store) => Store,
        (Load, Load) => Load,
        _ => LoadStore,
    }
}

struct PageRecord {
    /// The frame this page shadows. Valid for as long as the `FrameMap`
    /// that produced it is alive — the caller of every [`PageLog`] method
    /// is required to pass the same, still-live map across a
    /// touch/validate/apply/undo cycle (in practice, the one process-wide
    /// map the TM module owns).
    frame: *const Frame,
    op: PageOp,
    /// Bytes at the frame's address as observed at first touch.
    original: [u8; BLOCK_SIZE],
    /// The transaction's working copy; stores write here, loads read from
    /// here once the page exists (read-your-own-writes).
    shadow: [u8; BLOCK_SIZE],
    /// Bit `i` set means byte `i` of `shadow` has been written by `store`.
    written: u8,
}

impl PageRecord {
    fn frame(&self) -> &Frame {
        // SAFETY: see the field doc comment on `frame`.
        unsafe { &*self.frame }
    }
}

/// Per-transaction, thread-private log of touched pages.
#[derive(Default)]
pub struct PageLog {
    pages: Vec<PageRecord>,
    index: HashMap<usize, usize>,
}

impl PageLog {
    #[must_use]
    pub fn new() -> Self {
        Self { pages: Vec::new(), index: HashMap::new() }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn clear(&mut self) {
        self.pages.clear();
        self.index.clear();
    }

    /// Finds or creates the page record for `frame`, locking it for `owner`
    /// if this is the first touch. Returns a conflict if another
    /// transaction already owns the frame.
    fn page_for(&mut self, frame: &Frame, owner: OwnerToken, op: PageOp) -> Result<usize> {
        let block_index = frame.block_index();
        if let Some(&pos) = self.index.get(&block_index) {
            self.pages[pos].op = self.pages[pos].op.merge(op);
            return Ok(pos);
        }

        frame.try_lock(owner)?;
        // SAFETY: we hold the frame's ownership token exclusively, so no
        // other transaction may read or write this block concurrently; the
        // address is valid for `BLOCK_SIZE` bytes because the caller only
        // ever transacts over memory it legitimately owns.
        let original = unsafe { std::ptr::read(frame.address() as *const [u8; BLOCK_SIZE]) };

        self.pages.push(PageRecord {
            frame: frame as *const Frame,
            op,
            original,
            shadow: original,
            written: 0,
        });
        let pos = self.pages.len() - 1;
        self.index.insert(block_index, pos);
        Ok(pos)
    }

    /// Copies `out.len()` bytes starting at `addr` into `out`, consulting
    /// the shadow buffer for any bytes already written this transaction.
    pub fn load(
        &mut self,
        frame_map: &FrameMap,
        owner: OwnerToken,
        addr: usize,
        out: &mut [u8],
    ) -> Result<()> {
        let mut cur = addr;
        let mut filled = 0usize;
        while filled < out.len() {
            let frame = frame_map.get_or_insert(cur);
            let block_off = cur & BLOCK_MASK;
            let chunk = (BLOCK_SIZE - block_off).min(out.len() - filled);

            let pos = self.page_for(frame, owner, PageOp::Load)?;
            let record = &self.pages[pos];
            out[filled..filled + chunk].copy_from_slice(&record.shadow[block_off..block_off + chunk]);

            cur += chunk;
            filled += chunk;
        }
        Ok(())
    }

    /// Buffers `data` for write-back at commit.
    pub fn store(
        &mut self,
        frame_map: &FrameMap,
        owner: OwnerToken,
        addr: usize,
        data: &[u8],
    ) -> Result<()> {
        let mut cur = addr;
        let mut sent = 0usize;
        while sent < data.len() {
            let frame = frame_map.get_or_insert(cur);
            let block_off = cur & BLOCK_MASK;
            let chunk = (BLOCK_SIZE - block_off).min(data.len() - sent);

            let pos = self.page_for(frame, owner, PageOp::Store)?;
            let record = &mut self.pages[pos];
            record.shadow[block_off..block_off + chunk]
                .copy_from_slice(&data[sent..sent + chunk]);
            for i in block_off..block_off + chunk {
                record.written |= 1 << i;
            }

            cur += chunk;
            sent += chunk;
        }
        Ok(())
    }

    /// Copies `size` bytes from `src` to `dst` as a single transactional
    /// operation: reads `src` (participating in validate like `load`) and
    /// buffers the result at `dst` (participating in apply like `store`).
    pub fn loadstore(
        &mut self,
        frame_map: &FrameMap,
        owner: OwnerToken,
        src: usize,
        dst: usize,
        size: usize,
    ) -> Result<()> {
        let mut buf = vec![0u8; size];
        self.load(frame_map, owner, src, &mut buf)?;
        self.store(frame_map, owner, dst, &buf)?;
        // Tag every touched page (both src and dst ranges) as LoadStore so
        // validate checks the read portion even where store already set
        // Store; `page_for`'s merge already folds Load+Store into
        // LoadStore for any frame touched by both ranges, and this pass
        // folds in frames touched only by the read side.
        for pos in self.pages_touching(src, size) {
            self.pages[pos].op = self.pages[pos].op.merge(PageOp::LoadStore);
        }
        Ok(())
    }

    fn pages_touching(&self, addr: usize, size: usize) -> Vec<usize> {
        let mut out = Vec::new();
        let mut cur = addr;
        let mut remaining = size;
        while remaining > 0 {
            let block_index = cur >> crate::frame::BLOCK_BITS;
            if let Some(&pos) = self.index.get(&block_index) {
                out.push(pos);
            }
            let block_off = cur & BLOCK_MASK;
            let chunk = (BLOCK_SIZE - block_off).min(remaining);
            cur += chunk;
            remaining -= chunk;
        }
        out
    }

    /// Marks `len` bytes at `addr` as privatized: owned by this
    /// transaction for the remainder of its lifetime. No read/write
    /// traffic happens here; it only ensures the covering pages exist and
    /// are locked, tagged `Privatize(mode)` (a store-mode privatize skips
    /// the validate read-check, on the expectation that the caller writes
    /// fresh data directly into the region next; load and load-store
    /// privatize are still checked like `Load`/`LoadStore`). apply/undo
    /// only release the lock either way.
    pub fn privatize(
        &mut self,
        frame_map: &FrameMap,
        owner: OwnerToken,
        addr: usize,
        len: usize,
        mode: PrivatizeMode,
    ) -> Result<()> {
        let mut cur = addr;
        let mut remaining = len;
        while remaining > 0 {
            let frame = frame_map.get_or_insert(cur);
            self.page_for(frame, owner, PageOp::Privatize(mode))?;
            let block_off = cur & BLOCK_MASK;
            let chunk = (BLOCK_SIZE - block_off).min(remaining);
            cur += chunk;
            remaining -= chunk;
        }
        Ok(())
    }

    /// Validates every page: for any page whose untouched (unwritten)
    /// portion was read, the live bytes at that address must still match
    /// the snapshot taken at first touch. Write-only pages and store-mode
    /// privatized pages need no check.
    pub fn validate(&self) -> Result<()> {
        for record in &self.pages {
            if !record.op.needs_read_check() {
                continue;
            }
            let frame = record.frame();
            // SAFETY: the frame is still locked by this transaction (only
            // released in apply/undo), so no concurrent writer can race
            // this read.
            let live = unsafe { std::ptr::read(frame.address() as *const [u8; BLOCK_SIZE]) };
            for i in 0..BLOCK_SIZE {
                let untouched = record.written & (1 << i) == 0;
                if untouched && live[i] != record.original[i] {
                    return Err(PicotmError::conflicting(Some(picotm_error::ConflictHandle(
                        frame.block_index() as u64,
                    ))));
                }
            }
        }
        Ok(())
    }

    /// Writes back every stored byte range to process memory, then
    /// releases each frame lock, in log order.
    pub fn apply(&mut self, owner: OwnerToken) {
        for record in &self.pages {
            let frame = record.frame();
            if record.written != 0 {
                // SAFETY: this transaction exclusively owns the frame
                // until it is unlocked immediately below.
                unsafe {
                    let dst = frame.address() as *mut u8;
                    for i in 0..BLOCK_SIZE {
                        if record.written & (1 << i) != 0 {
                            *dst.add(i) = record.shadow[i];
                        }
                    }
                }
            }
            frame.unlock(owner);
        }
        self.clear();
    }

    /// Releases every frame lock in reverse order. No memory rollback is
    /// needed: stores only ever touched the shadow buffer.
    pub fn undo(&mut self, owner: OwnerToken) {
        for record in self.pages.iter().rev() {
            record.frame().unlock(owner);
        }
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_then_load_within_one_transaction_reads_own_write() {
        let map = FrameMap::new();
        let mut log = PageLog::new();
        let mut buf = [0u8; 8];
        let addr = buf.as_mut_ptr() as usize;

        log.store(&map, 1, addr, &[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        let mut out = [0u8; 8];
        log.load(&map, 1, addr, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 4, 5, 6, 7, 8]);
        log.undo(1);
        assert_eq!(buf, [0u8; 8], "undo must not publish shadow writes");
    }

    #[test]
    fn apply_publishes_stores_to_process_memory() {
        let map = FrameMap::new();
        let mut log = PageLog::new();
        let mut buf = [0u8; 8];
        let addr = buf.as_mut_ptr() as usize;

        log.store(&map, 1, addr, &[9; 8]).unwrap();
        log.apply(1);
        assert_eq!(buf, [9u8; 8]);
    }

    #[test]
    fn second_transaction_cannot_touch_a_locked_frame() {
        let map = FrameMap::new();
        let mut a = PageLog::new();
        let mut b = PageLog::new();
        let mut buf = [0u8; 8];
        let addr = buf.as_mut_ptr() as usize;

        let mut scratch = [0u8; 8];
        a.load(&map, 1, addr, &mut scratch).unwrap();
        let err = b.load(&map, 2, addr, &mut scratch).unwrap_err();
        assert!(err.is_conflicting());
        a.undo(1);
    }

    #[test]
    fn loadstore_copies_between_two_addresses() {
        let map = FrameMap::new();
        let mut log = PageLog::new();
        let mut src = [7u8; 8];
        let mut dst = [0u8; 8];
        log.loadstore(&map, 1, src.as_mut_ptr() as usize, dst.as_mut_ptr() as usize, 8)
            .unwrap();
        log.apply(1);
        assert_eq!(dst, [7u8; 8]);
    }

    #[test]
    fn store_mode_privatize_then_direct_write_validates_clean() {
        let map = FrameMap::new();
        let mut log = PageLog::new();
        let mut buf = [0u8; 8];
        let addr = buf.as_mut_ptr() as usize;

        log.privatize(&map, 1, addr, 8, PrivatizeMode::Store).unwrap();
        // A direct write bypassing `store`, the pattern the allocator
        // crate's `malloc_tx`/`calloc_tx` use on freshly privatized memory.
        buf = [0xAB; 8];
        assert!(
            log.validate().is_ok(),
            "a store-mode privatized page must not be read-checked"
        );
        log.undo(1);
    }

    #[test]
    fn load_mode_privatize_still_validates_reads() {
        let map = FrameMap::new();
        let mut log = PageLog::new();
        let mut buf = [0u8; 8];
        let addr = buf.as_mut_ptr() as usize;

        log.privatize(&map, 1, addr, 8, PrivatizeMode::Load).unwrap();
        buf = [0xAB; 8];
        let err = log.validate().unwrap_err();
        assert!(err.is_conflicting());
        log.undo(1);
    }

    #[test]
    fn validate_passes_when_no_other_transaction_interfered() {
        let map = FrameMap::new();
        let mut log = PageLog::new();
        let mut buf = [0u8; 8];
        let addr = buf.as_mut_ptr() as usize;
        let mut scratch = [0u8; 8];
        log.load(&map, 1, addr, &mut scratch).unwrap();
        assert!(log.validate().is_ok());
        log.undo(1);
    }
}
