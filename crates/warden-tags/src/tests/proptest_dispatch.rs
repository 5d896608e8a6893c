use proptest::prelude::*;

use crate::{AddressRange, Tag, TagBus, TagProvider, UniformTags, WordTags};

#[derive(Clone, Debug)]
struct Layout {
    ranges: Vec<AddressRange>,
    heterogeneous: Vec<bool>,
}

prop_compose! {
    /// Builds a set of pairwise disjoint ranges by walking the address space
    /// left to right with random gaps and lengths.
    fn arb_layout(max_ranges: usize)(
        gaps in prop::collection::vec(0u64..0x100, 1..=8),
        lens in prop::collection::vec(1u64..0x100, 1..=8),
        hetero in prop::collection::vec(any::<bool>(), 8),
    ) -> Layout {
        let count = gaps.len().min(lens.len()).min(max_ranges);
        let mut ranges = Vec::with_capacity(count);
        let mut cursor = 0u64;
        for i in 0..count {
            let start = cursor + gaps[i] + 1;
            let end = start + lens[i];
            ranges.push(AddressRange::new(start, end));
            cursor = end;
        }
        Layout { ranges, heterogeneous: hetero[..count].to_vec() }
    }
}

fn build_bus(layout: &Layout) -> TagBus {
    let mut bus = TagBus::new();
    for (i, range) in layout.ranges.iter().enumerate() {
        let initial = Tag::from_bits(i as u64 + 1);
        let provider = if layout.heterogeneous[i] {
            TagProvider::Heterogeneous(WordTags::new(range.len(), 4, initial))
        } else {
            TagProvider::Uniform(UniformTags::new(range.len(), initial))
        };
        bus.add_provider(*range, provider).unwrap();
    }
    bus
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn get_after_set_returns_the_written_tag(
        layout in arb_layout(8),
        picks in prop::collection::vec((0usize..8, 0u64..0x100, 1u64..0x1000), 1..32),
    ) {
        let mut bus = build_bus(&layout);

        for (range_idx, offset, bits) in picks {
            let range = layout.ranges[range_idx % layout.ranges.len()];
            let addr = range.start + offset % range.len();
            let tag = Tag::from_bits(bits);

            bus.set_tag(addr, tag).unwrap();
            prop_assert_eq!(bus.get_tag(addr).unwrap(), tag);
        }
    }

    #[test]
    fn uniform_set_is_visible_across_the_whole_range(
        layout in arb_layout(8),
        bits in 1u64..0x1000,
    ) {
        let mut bus = build_bus(&layout);

        for (i, range) in layout.ranges.iter().enumerate() {
            if layout.heterogeneous[i] {
                continue;
            }
            let tag = Tag::from_bits(bits);
            bus.set_tag(range.start + range.len() / 2, tag).unwrap();
            prop_assert_eq!(bus.get_tag(range.start).unwrap(), tag);
            prop_assert_eq!(bus.get_tag(range.end - 1).unwrap(), tag);
        }
    }

    #[test]
    fn gap_addresses_always_fault(layout in arb_layout(8)) {
        let bus = build_bus(&layout);

        for range in &layout.ranges {
            // One address past the end is either a gap or the next range's
            // start; the address just before the start is always a gap by
            // construction.
            prop_assert!(bus.get_tag(range.start - 1).is_err());
            prop_assert!(bus.get_tag(range.start).is_ok());
            prop_assert!(bus.get_tag(range.end - 1).is_ok());
        }
    }
}
