//! Versioned type identifiers.
//!
//! A `TypeId` packs a slot index and a generation counter into 32 bits. The
//! slot index addresses the global type table; the generation is bumped every
//! time a freed slot is reused, so an id held across a removal never resolves
//! to the type that replaced it.

use core::fmt;

/// Identifies a registered [`Type`](crate::types::Type).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TypeId(u32);

/// The id of "no type" (void). Slot 0 of the type table is reserved for it.
pub const NONE_ID: TypeId = TypeId(0);

impl TypeId {
    /// Number of bits used for the slot index.
    pub const INDEX_BITS: u32 = 20;
    /// Number of bits used for the generation counter.
    pub const GENERATION_BITS: u32 = 32 - Self::INDEX_BITS;
    /// Maximum number of slots in the type table.
    pub const MAX_TYPES: usize = 1 << Self::INDEX_BITS;

    const INDEX_MASK: u32 = (1 << Self::INDEX_BITS) - 1;
    const GENERATION_MASK: u32 = (1 << Self::GENERATION_BITS) - 1;

    /// Create an id from its parts. `index` must be below [`TypeId::MAX_TYPES`].
    pub const fn new(index: usize, generation: u32) -> Self {
        debug_assert!(index < Self::MAX_TYPES);
        TypeId(
            (index as u32 & Self::INDEX_MASK)
                | ((generation & Self::GENERATION_MASK) << Self::INDEX_BITS),
        )
    }

    /// Slot index into the type table.
    pub const fn index(self) -> usize {
        (self.0 & Self::INDEX_MASK) as usize
    }

    /// Generation of the slot this id was issued for.
    pub const fn generation(self) -> u32 {
        self.0 >> Self::INDEX_BITS
    }

    /// The id the same slot receives on its next reuse.
    pub const fn next(self) -> Self {
        Self::new(self.index(), self.generation().wrapping_add(1))
    }

    /// Raw packed representation.
    pub const fn to_bits(self) -> u32 {
        self.0
    }

    /// Rebuild an id from [`TypeId::to_bits`].
    pub const fn from_bits(bits: u32) -> Self {
        TypeId(bits)
    }

    /// Whether this is [`NONE_ID`].
    pub const fn is_none(self) -> bool {
        self.0 == NONE_ID.0
    }
}

impl Default for TypeId {
    fn default() -> Self {
        NONE_ID
    }
}

impl fmt::Debug for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TypeId({}v{})", self.index(), self.generation())
    }
}

impl fmt::Display for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index(), self.generation())
    }
}
