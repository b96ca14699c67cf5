//! Shared newtypes used across picotm modules: module ids, opcodes, cookies
//! and the event records that make up a transaction's event log.

/// Identifies a registered module for the lifetime of a thread's registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ModuleId(u16);

impl ModuleId {
    #[must_use]
    pub const fn new(id: u16) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn get(self) -> u16 {
        self.0
    }
}

/// A module-private opcode, interpreted only by the module that appended it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Opcode(pub u16);

/// A module-private 32-bit handle, typically an index into that module's
/// own scratch table. Zero is a valid cookie (used when a module
/// reconstructs its state from transaction-local storage instead).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Cookie(pub u32);

impl Cookie {
    pub const ZERO: Self = Self(0);
}

/// An immutable record `(module_id, opcode, cookie)` appended to the event
/// log. Events are visited head-to-tail on commit, tail-to-head on abort.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Event {
    pub module_id: ModuleId,
    pub opcode: Opcode,
    pub cookie: Cookie,
}

impl Event {
    #[must_use]
    pub const fn new(module_id: ModuleId, opcode: Opcode, cookie: Cookie) -> Self {
        Self { module_id, opcode, cookie }
    }
}

bitflags::bitflags! {
    /// Flags on a non-undo-capable operation, mirroring the `isnoundo`
    /// parameter threaded through the original file-table wrapper template.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpFlags: u8 {
        /// The operation cannot be undone; any failure after it executes
        /// forces the transaction irrevocable.
        const NO_UNDO = 1 << 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cookie_zero_is_a_valid_distinct_value() {
        assert_eq!(Cookie::ZERO, Cookie(0));
    }

    #[test]
    fn event_fields_round_trip() {
        let event = Event::new(ModuleId::new(3), Opcode(7), Cookie(42));
        assert_eq!(event.module_id.get(), 3);
        assert_eq!(event.opcode.0, 7);
        assert_eq!(event.cookie.0, 42);
    }
}
