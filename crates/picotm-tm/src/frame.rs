//! A lockable, fixed-size block of process address space.
//!
//! Block size is `2^BLOCK_BITS` bytes; the reference value (and the only
//! value this crate instantiates) is `BLOCK_BITS = 3`, an 8-byte block —
//! matching the original's `TM_BLOCK_SIZE_BITS`.

use std::sync::atomic::{AtomicU64, Ordering};

use picotm_error::PicotmError;

/// Number of address bits covered by one frame. `2^BLOCK_BITS` bytes.
pub const BLOCK_BITS: u32 = 3;
/// Size in bytes of the memory region one frame covers.
pub const BLOCK_SIZE: usize = 1 << BLOCK_BITS;
pub const BLOCK_MASK: usize = BLOCK_SIZE - 1;

/// A non-zero owner token minted by the TM module, identifying the
/// transaction attempt that currently holds a frame for writing. `0` means
/// unowned.
pub type OwnerToken = u64;

/// Lockable block of address space. Owner is non-zero only while a
/// transaction holds the frame; the block index is fixed at construction
/// and never changes.
#[derive(Debug)]
pub struct Frame {
    block_index: usize,
    owner: AtomicU64,
}

impl Frame {
    #[must_use]
    pub const fn new(block_index: usize) -> Self {
        Self { block_index, owner: AtomicU64::new(0) }
    }

    #[must_use]
    pub const fn block_index(&self) -> usize {
        self.block_index
    }

    #[must_use]
    pub fn address(&self) -> usize {
        self.block_index << BLOCK_BITS
    }

    #[must_use]
    pub fn owner(&self) -> OwnerToken {
        self.owner.load(Ordering::Acquire)
    }

    /// Attempts to take ownership of this frame via compare-and-exchange
    /// against an unowned (zero) frame. On failure, returns a `Conflicting`
    /// error carrying this frame's block index as the referent, per §4.3
    /// step 2: "signal Conflicting with that frame as the referent."
    pub fn try_lock(&self, owner: OwnerToken) -> Result<(), PicotmError> {
        debug_assert_ne!(owner, 0, "owner token must be non-zero");
        if self.owner.load(Ordering::Relaxed) != 0 {
            return Err(conflict(self.block_index));
        }
        self.owner
            .compare_exchange(0, owner, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| conflict(self.block_index))
    }

    /// Releases ownership. A no-op if the frame is already unowned.
    pub fn unlock(&self, owner: OwnerToken) {
        let _ = self.owner.compare_exchange(
            owner,
            0,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }
}

fn conflict(block_index: usize) -> PicotmError {
    PicotmError::conflicting(Some(picotm_error::ConflictHandle(block_index as u64)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_frame_is_unowned() {
        let frame = Frame::new(7);
        assert_eq!(frame.owner(), 0);
        assert_eq!(frame.block_index(), 7);
    }

    #[test]
    fn try_lock_succeeds_once_then_conflicts() {
        let frame = Frame::new(0);
        frame.try_lock(11).unwrap();
        let err = frame.try_lock(22).unwrap_err();
        assert!(err.is_conflicting());
    }

    #[test]
    fn unlock_then_relock_by_other_owner_succeeds() {
        let frame = Frame::new(0);
        frame.try_lock(11).unwrap();
        frame.unlock(11);
        assert_eq!(frame.owner(), 0);
        frame.try_lock(22).unwrap();
        assert_eq!(frame.owner(), 22);
    }

    #[test]
    fn address_derives_from_block_index() {
        let frame = Frame::new(5);
        assert_eq!(frame.address(), 5 * BLOCK_SIZE);
    }
}
