use core::fmt;

use crate::{AddressRange, Tag, TagError, TagProvider, TagResult};

/// Errors registering a provider on a [`TagBus`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagBusError {
    /// The new range overlaps a range that is already registered.
    Overlap {
        new: AddressRange,
        existing: AddressRange,
    },
    /// The provider's storage is smaller than the range it is registered for.
    SizeMismatch {
        range: AddressRange,
        provider_size: u64,
    },
}

impl fmt::Display for TagBusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TagBusError::Overlap { new, existing } => {
                write!(f, "tag ranges overlap: new={new} existing={existing}")
            }
            TagBusError::SizeMismatch {
                range,
                provider_size,
            } => write!(
                f,
                "provider of size 0x{provider_size:x} does not cover range {range}"
            ),
        }
    }
}

impl std::error::Error for TagBusError {}

/// Dispatches address-keyed tag reads and writes to the provider owning the
/// address.
///
/// Ranges are kept sorted by `(start, end)` with lookup via binary search into
/// a parallel array of owned providers. The bus is built once from
/// configuration and then read/written continuously from the host's execution
/// loop, so dispatch stays allocation-free.
#[derive(Debug, Default)]
pub struct TagBus {
    ranges: Vec<AddressRange>,
    providers: Vec<TagProvider>,
}

impl TagBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ranges(&self) -> &[AddressRange] {
        &self.ranges
    }

    /// Registers exclusive ownership of `range` to `provider`.
    ///
    /// Overlap with an already registered non-empty range is rejected; empty
    /// ranges (`start == end`) register fine and simply never match a query.
    pub fn add_provider(
        &mut self,
        range: AddressRange,
        provider: TagProvider,
    ) -> Result<(), TagBusError> {
        if provider.size() < range.len() {
            return Err(TagBusError::SizeMismatch {
                range,
                provider_size: provider.size(),
            });
        }

        let idx = self
            .ranges
            .partition_point(|r| (r.start, r.end) < (range.start, range.end));

        if !range.is_empty() {
            // Empty neighbors never overlap anything; skip past them to the
            // nearest real range on each side.
            let before = self.ranges[..idx].iter().rev().find(|r| !r.is_empty());
            if let Some(prev) = before {
                if prev.overlaps(&range) {
                    return Err(TagBusError::Overlap {
                        new: range,
                        existing: *prev,
                    });
                }
            }
            let after = self.ranges[idx..].iter().find(|r| !r.is_empty());
            if let Some(next) = after {
                if next.overlaps(&range) {
                    return Err(TagBusError::Overlap {
                        new: range,
                        existing: *next,
                    });
                }
            }
        }

        self.ranges.insert(idx, range);
        self.providers.insert(idx, provider);
        Ok(())
    }

    #[inline]
    fn owner_index(&self, addr: u64) -> Option<usize> {
        let idx = self.ranges.partition_point(|r| r.start <= addr);
        // Walk back over empty ranges sharing the candidate position; the
        // first non-empty range either contains `addr` or nothing does.
        let mut cand = idx;
        while cand > 0 {
            cand -= 1;
            let r = &self.ranges[cand];
            if r.contains(addr) {
                return Some(cand);
            }
            if !r.is_empty() {
                return None;
            }
        }
        None
    }

    pub fn is_mapped(&self, addr: u64) -> bool {
        self.owner_index(addr).is_some()
    }

    /// Tag currently attached to `addr`.
    pub fn get_tag(&self, addr: u64) -> TagResult<Tag> {
        let idx = self.owner_index(addr).ok_or(TagError::Unmapped { addr })?;
        Ok(self.providers[idx].get(addr - self.ranges[idx].start))
    }

    /// Writes `tag` at `addr`, honoring the owning provider's granularity
    /// semantics (a uniform provider retags its entire range).
    pub fn set_tag(&mut self, addr: u64, tag: Tag) -> TagResult<()> {
        let idx = self.owner_index(addr).ok_or(TagError::Unmapped { addr })?;
        self.providers[idx].set(addr - self.ranges[idx].start, tag);
        Ok(())
    }

    /// Bulk-assigns `tag` to every location in `[start, end)`, bypassing
    /// per-word dispatch.
    ///
    /// The whole span must be covered by registered providers: a gap fails
    /// with the first unmapped address and nothing is written. An empty span
    /// is a no-op.
    pub fn load_range(&mut self, start: u64, end: u64, tag: Tag) -> TagResult<()> {
        if start >= end {
            return Ok(());
        }

        // Validate coverage before mutating anything so a gap cannot leave a
        // partial bulk load behind.
        let mut owners = Vec::new();
        let mut cursor = start;
        while cursor < end {
            let idx = self
                .owner_index(cursor)
                .ok_or(TagError::Unmapped { addr: cursor })?;
            owners.push(idx);
            cursor = self.ranges[idx].end;
        }

        for idx in owners {
            let range = self.ranges[idx];
            let lo = start.max(range.start);
            let hi = end.min(range.end);
            self.providers[idx].fill(lo - range.start, hi - lo, tag);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{UniformTags, WordTags};

    fn t(bits: u64) -> Tag {
        Tag::from_bits(bits)
    }

    fn uniform(range: AddressRange, tag: Tag) -> TagProvider {
        TagProvider::Uniform(UniformTags::new(range.len(), tag))
    }

    fn words(range: AddressRange, tag: Tag) -> TagProvider {
        TagProvider::Heterogeneous(WordTags::new(range.len(), 4, tag))
    }

    #[test]
    fn dispatch_routes_to_owning_provider() {
        let mut bus = TagBus::new();
        let a = AddressRange::new(0x1000, 0x1010);
        let b = AddressRange::new(0x2000, 0x2100);
        bus.add_provider(a, uniform(a, t(1))).unwrap();
        bus.add_provider(b, words(b, t(2))).unwrap();

        assert_eq!(bus.get_tag(0x1008).unwrap(), t(1));
        assert_eq!(bus.get_tag(0x2080).unwrap(), t(2));

        bus.set_tag(0x2080, t(9)).unwrap();
        assert_eq!(bus.get_tag(0x2080).unwrap(), t(9));
        assert_eq!(bus.get_tag(0x2084).unwrap(), t(2));
    }

    #[test]
    fn uniform_write_is_region_wide_through_the_bus() {
        let mut bus = TagBus::new();
        let r = AddressRange::new(0x1000, 0x1010);
        bus.add_provider(r, uniform(r, t(7))).unwrap();

        bus.set_tag(0x1004, t(9)).unwrap();
        assert_eq!(bus.get_tag(0x1000).unwrap(), t(9));
        assert_eq!(bus.get_tag(0x100F).unwrap(), t(9));
    }

    #[test]
    fn unmapped_addresses_fault() {
        let mut bus = TagBus::new();
        let r = AddressRange::new(0x1000, 0x1010);
        bus.add_provider(r, uniform(r, t(7))).unwrap();

        assert_eq!(
            bus.get_tag(0x1010),
            Err(TagError::Unmapped { addr: 0x1010 })
        );
        assert_eq!(bus.get_tag(0x0FFF), Err(TagError::Unmapped { addr: 0xFFF }));
        assert_eq!(
            bus.set_tag(0x3000, t(1)),
            Err(TagError::Unmapped { addr: 0x3000 })
        );
    }

    #[test]
    fn empty_range_registers_but_never_matches() {
        let mut bus = TagBus::new();
        let empty = AddressRange::new(0x2000, 0x2000);
        bus.add_provider(empty, uniform(empty, t(1))).unwrap();

        assert_eq!(
            bus.get_tag(0x2000),
            Err(TagError::Unmapped { addr: 0x2000 })
        );
    }

    #[test]
    fn empty_range_does_not_shadow_a_covering_range() {
        let mut bus = TagBus::new();
        let big = AddressRange::new(0x0, 0x100);
        let empty = AddressRange::new(0x50, 0x50);
        bus.add_provider(big, uniform(big, t(3))).unwrap();
        bus.add_provider(empty, uniform(empty, t(4))).unwrap();

        assert_eq!(bus.get_tag(0x50).unwrap(), t(3));
        assert_eq!(bus.get_tag(0x60).unwrap(), t(3));
    }

    #[test]
    fn overlapping_registration_is_rejected() {
        let mut bus = TagBus::new();
        let a = AddressRange::new(0x1000, 0x2000);
        bus.add_provider(a, uniform(a, t(1))).unwrap();

        let b = AddressRange::new(0x1800, 0x2800);
        let err = bus.add_provider(b, uniform(b, t(2))).unwrap_err();
        assert_eq!(err, TagBusError::Overlap { new: b, existing: a });

        // Adjacent ranges are fine.
        let c = AddressRange::new(0x2000, 0x3000);
        bus.add_provider(c, uniform(c, t(3))).unwrap();
    }

    #[test]
    fn undersized_provider_is_rejected() {
        let mut bus = TagBus::new();
        let r = AddressRange::new(0x0, 0x100);
        let err = bus
            .add_provider(r, TagProvider::Uniform(UniformTags::new(0x80, t(1))))
            .unwrap_err();
        assert!(matches!(err, TagBusError::SizeMismatch { .. }));
    }

    #[test]
    fn load_range_spans_providers() {
        let mut bus = TagBus::new();
        let a = AddressRange::new(0x1000, 0x1010);
        let b = AddressRange::new(0x1010, 0x1020);
        bus.add_provider(a, uniform(a, t(1))).unwrap();
        bus.add_provider(b, words(b, t(2))).unwrap();

        bus.load_range(0x1008, 0x1018, t(5)).unwrap();
        // The uniform provider retags its whole range; the heterogeneous one
        // only the covered words.
        assert_eq!(bus.get_tag(0x1000).unwrap(), t(5));
        assert_eq!(bus.get_tag(0x1010).unwrap(), t(5));
        assert_eq!(bus.get_tag(0x1014).unwrap(), t(5));
        assert_eq!(bus.get_tag(0x1018).unwrap(), t(2));
    }

    #[test]
    fn load_range_with_gap_faults_and_writes_nothing() {
        let mut bus = TagBus::new();
        let a = AddressRange::new(0x1000, 0x1010);
        let b = AddressRange::new(0x1020, 0x1030);
        bus.add_provider(a, words(a, t(1))).unwrap();
        bus.add_provider(b, words(b, t(2))).unwrap();

        assert_eq!(
            bus.load_range(0x1008, 0x1028, t(9)),
            Err(TagError::Unmapped { addr: 0x1010 })
        );
        assert_eq!(bus.get_tag(0x1008).unwrap(), t(1));
        assert_eq!(bus.get_tag(0x1020).unwrap(), t(2));
    }
}
