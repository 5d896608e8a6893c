//! Address-keyed tag storage for a policy validation engine.
//!
//! Every architectural location the engine tracks metadata for (memory-mapped
//! SoC elements, registers, CSRs) carries a [`Tag`]: a compact identifier for
//! a canonical metadata label set. This crate provides the storage side only;
//! resolving label sets to tags lives in `warden-meta`.

mod bus;
mod file;
mod provider;
mod range;

pub use bus::{TagBus, TagBusError};
pub use file::TagFile;
pub use provider::{TagProvider, UniformTags, WordTags, DEFAULT_GRANULARITY};
pub use range::AddressRange;

use core::fmt;

#[cfg(test)]
mod tests;

/// Canonical runtime identifier for a metadata label set.
///
/// Tags are issued by the metadata converter for one configuration generation;
/// equality is identity of the canonical interned representation, so two
/// label-set-equal metadata sets always compare equal here. Reloading the
/// configuration invalidates every previously issued tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tag(u64);

impl Tag {
    /// Reconstructs a tag from its raw bits.
    ///
    /// The bits must have been obtained from [`Tag::to_bits`] under the
    /// current configuration generation; this is the escape hatch for the
    /// bulk-load administrative surface, not a general constructor.
    pub const fn from_bits(bits: u64) -> Self {
        Tag(bits)
    }

    pub const fn to_bits(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tag:{:#x}", self.0)
    }
}

/// Errors returned by address-keyed tag reads and writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagError {
    /// The address is not covered by any registered provider.
    Unmapped { addr: u64 },
}

impl fmt::Display for TagError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TagError::Unmapped { addr } => {
                write!(f, "address 0x{addr:x} is not covered by any tag provider")
            }
        }
    }
}

impl std::error::Error for TagError {}

pub type TagResult<T> = Result<T, TagError>;
