use core::fmt;
use std::num::NonZeroUsize;

use lru::LruCache;
use warden_policy::{Decision, InputTags, OpcodeClass};

/// Default bound on cached decisions. Working sets are small (one entry per
/// distinct opcode-class x tag-tuple combination the program exercises), so
/// this is generous.
pub const DEFAULT_RULE_CACHE_CAPACITY: usize = 16 * 1024;

/// Cache key: opcode class plus the ordered input tag tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RuleKey {
    pub class: OpcodeClass,
    pub inputs: InputTags,
}

/// Hit/miss counters and occupancy, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RuleCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub len: usize,
    pub capacity: usize,
}

impl fmt::Display for RuleCacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "rule cache: {} hits / {} misses, {}/{} entries",
            self.hits, self.misses, self.len, self.capacity
        )
    }
}

/// Memoized policy decisions, LRU-bounded.
///
/// Entries are only meaningful under the configuration generation that
/// produced them; reloads clear the cache in full. Under a fixed generation a
/// cached decision is always equal to a freshly computed one, so the cache is
/// transparent to correctness.
pub struct RuleCache {
    entries: LruCache<RuleKey, Decision>,
    hits: u64,
    misses: u64,
}

impl RuleCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(capacity),
            hits: 0,
            misses: 0,
        }
    }

    /// Cached decision for `key`, updating the hit/miss counters.
    pub fn lookup(&mut self, key: &RuleKey) -> Option<Decision> {
        match self.entries.get(key) {
            Some(decision) => {
                self.hits += 1;
                Some(decision.clone())
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    pub fn insert(&mut self, key: RuleKey, decision: Decision) {
        self.entries.put(key, decision);
    }

    /// Drops every entry and resets the counters. Used on configuration
    /// reload, where all cached tags become meaningless.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.hits = 0;
        self.misses = 0;
    }

    pub fn stats(&self) -> RuleCacheStats {
        RuleCacheStats {
            hits: self.hits,
            misses: self.misses,
            len: self.entries.len(),
            capacity: self.entries.cap().get(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_policy::OutputTags;
    use warden_tags::Tag;

    fn key(class: u32, pc_bits: u64) -> RuleKey {
        RuleKey {
            class: OpcodeClass(class),
            inputs: InputTags {
                pc: Tag::from_bits(pc_bits),
                ci: Tag::from_bits(0),
                op1: None,
                op2: None,
                op3: None,
                csr: None,
                mem: None,
            },
        }
    }

    #[test]
    fn lookup_counts_hits_and_misses() {
        let mut cache = RuleCache::new(8);
        let k = key(1, 1);
        assert!(cache.lookup(&k).is_none());
        cache.insert(k, Decision::allow(OutputTags::default()));
        assert!(cache.lookup(&k).is_some());

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.len, 1);
    }

    #[test]
    fn capacity_evicts_least_recently_used() {
        let mut cache = RuleCache::new(2);
        cache.insert(key(1, 1), Decision::allow(OutputTags::default()));
        cache.insert(key(2, 2), Decision::allow(OutputTags::default()));
        // Touch the first so the second is the eviction candidate.
        assert!(cache.lookup(&key(1, 1)).is_some());
        cache.insert(key(3, 3), Decision::allow(OutputTags::default()));

        assert!(cache.lookup(&key(1, 1)).is_some());
        assert!(cache.lookup(&key(2, 2)).is_none());
        assert!(cache.lookup(&key(3, 3)).is_some());
    }

    #[test]
    fn clear_resets_entries_and_counters() {
        let mut cache = RuleCache::new(8);
        cache.insert(key(1, 1), Decision::allow(OutputTags::default()));
        let _ = cache.lookup(&key(1, 1));
        cache.clear();

        let stats = cache.stats();
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.misses, 0);
        assert_eq!(stats.len, 0);
        assert!(cache.lookup(&key(1, 1)).is_none());
    }
}
