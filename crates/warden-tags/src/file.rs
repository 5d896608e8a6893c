use std::collections::HashMap;

use crate::Tag;

/// Sparse tag storage for a flat address space (registers, CSRs).
///
/// Unlike the bus-backed memory spaces there is no unmapped fault here: every
/// address reads as the default tag until explicitly overwritten, and the
/// default is fixed for the lifetime of one configuration generation.
#[derive(Debug, Clone)]
pub struct TagFile {
    default: Tag,
    tags: HashMap<u64, Tag>,
}

impl TagFile {
    pub fn new(default: Tag) -> Self {
        Self {
            default,
            tags: HashMap::new(),
        }
    }

    pub fn default_tag(&self) -> Tag {
        self.default
    }

    #[inline]
    pub fn get(&self, addr: u64) -> Tag {
        self.tags.get(&addr).copied().unwrap_or(self.default)
    }

    #[inline]
    pub fn set(&mut self, addr: u64, tag: Tag) {
        if tag == self.default {
            self.tags.remove(&addr);
        } else {
            self.tags.insert(addr, tag);
        }
    }

    /// Drops every override, returning the whole space to the default tag.
    pub fn reset(&mut self) {
        self.tags.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_addresses_read_the_default() {
        let file = TagFile::new(Tag::from_bits(3));
        assert_eq!(file.get(0), Tag::from_bits(3));
        assert_eq!(file.get(31), Tag::from_bits(3));
    }

    #[test]
    fn overrides_are_per_address() {
        let mut file = TagFile::new(Tag::from_bits(0));
        file.set(5, Tag::from_bits(7));
        assert_eq!(file.get(5), Tag::from_bits(7));
        assert_eq!(file.get(6), Tag::from_bits(0));

        file.reset();
        assert_eq!(file.get(5), Tag::from_bits(0));
    }

    #[test]
    fn writing_the_default_clears_the_override() {
        let mut file = TagFile::new(Tag::from_bits(1));
        file.set(2, Tag::from_bits(9));
        file.set(2, Tag::from_bits(1));
        assert_eq!(file.get(2), Tag::from_bits(1));
        assert!(file.tags.is_empty());
    }
}
