//! Diagnostic and introspection surface over the validation engine:
//! watchpoints, hook resolution and per-entity tag queries.
//!
//! Everything here is read-only with respect to tag state; the engine feeds
//! events in during validate/commit and tooling drains them out.

use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use warden_tags::Tag;

/// Tag space a watchpoint monitors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TagSpace {
    Pc,
    Register,
    Csr,
    Memory,
}

/// Protocol phase during which a watched address was touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessPhase {
    Validate,
    Commit,
}

/// One enriched diagnostic event.
///
/// `tag` carries the raw bits of the location's current tag (tags are only
/// meaningful within the generation that recorded the event).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DebugEvent {
    WatchHit {
        space: TagSpace,
        phase: AccessPhase,
        addr: u64,
        tag: u64,
        pc: u64,
        /// Current memory word value, for memory-space hits.
        value: Option<u64>,
    },
    HookReached { name: String, pc: u64 },
}

/// Exact-address watchpoints over the four tag spaces.
///
/// A hit requires address equality; neighbors are never reported.
#[derive(Debug, Default)]
pub struct WatchManager {
    pc: bool,
    registers: HashSet<u64>,
    csrs: HashSet<u64>,
    memory: HashSet<u64>,
}

impl WatchManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_pc_watch(&mut self, enabled: bool) {
        self.pc = enabled;
    }

    pub fn pc_watched(&self) -> bool {
        self.pc
    }

    pub fn watch_register(&mut self, addr: u64) {
        self.registers.insert(addr);
    }

    pub fn unwatch_register(&mut self, addr: u64) -> bool {
        self.registers.remove(&addr)
    }

    pub fn register_watched(&self, addr: u64) -> bool {
        self.registers.contains(&addr)
    }

    pub fn watch_csr(&mut self, addr: u64) {
        self.csrs.insert(addr);
    }

    pub fn unwatch_csr(&mut self, addr: u64) -> bool {
        self.csrs.remove(&addr)
    }

    pub fn csr_watched(&self, addr: u64) -> bool {
        self.csrs.contains(&addr)
    }

    pub fn watch_memory(&mut self, addr: u64) {
        self.memory.insert(addr);
    }

    pub fn unwatch_memory(&mut self, addr: u64) -> bool {
        self.memory.remove(&addr)
    }

    pub fn memory_watched(&self, addr: u64) -> bool {
        self.memory.contains(&addr)
    }

    pub fn clear(&mut self) {
        self.pc = false;
        self.registers.clear();
        self.csrs.clear();
        self.memory.clear();
    }
}

/// Bounded drop-oldest queue of diagnostic events.
#[derive(Debug)]
pub struct DebugEventQueue {
    max_events: usize,
    events: VecDeque<DebugEvent>,
}

impl Default for DebugEventQueue {
    fn default() -> Self {
        Self::new(4096)
    }
}

impl DebugEventQueue {
    pub fn new(max_events: usize) -> Self {
        Self {
            max_events: max_events.max(1),
            events: VecDeque::new(),
        }
    }

    pub fn record(&mut self, event: DebugEvent) {
        if self.events.len() == self.max_events {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }

    pub fn drain(&mut self, max: usize) -> Vec<DebugEvent> {
        let mut out = Vec::new();
        let max = max.min(self.events.len());
        for _ in 0..max {
            if let Some(event) = self.events.pop_front() {
                out.push(event);
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    pub fn export_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&self.events)
    }
}

/// Named, resolvable addresses at which the host wants to be notified.
///
/// Symbol information comes from the host (it owns the loaded image); the
/// table resolves names to addresses and tracks which ones are armed.
#[derive(Debug, Default)]
pub struct HookTable {
    symbols: HashMap<String, u64>,
    armed: HashMap<String, u64>,
    armed_addrs: HashMap<u64, String>,
}

impl HookTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the symbol table. Armed hooks are dropped: their addresses
    /// were resolved against the previous symbols.
    pub fn set_symbols<I>(&mut self, symbols: I)
    where
        I: IntoIterator<Item = (String, u64)>,
    {
        self.symbols = symbols.into_iter().collect();
        self.armed.clear();
        self.armed_addrs.clear();
    }

    /// Resolves `name` and arms it. Returns false when the name is unknown
    /// to the symbol information.
    pub fn set_hook(&mut self, name: &str) -> bool {
        let Some(addr) = self.symbols.get(name).copied() else {
            return false;
        };
        self.armed.insert(name.to_owned(), addr);
        self.armed_addrs.insert(addr, name.to_owned());
        true
    }

    pub fn hook_address(&self, name: &str) -> Option<u64> {
        self.armed
            .get(name)
            .or_else(|| self.symbols.get(name))
            .copied()
    }

    /// Name of the armed hook at `addr`, if any.
    pub fn armed_at(&self, addr: u64) -> Option<&str> {
        self.armed_addrs.get(&addr).map(String::as_str)
    }

    pub fn clear_hooks(&mut self) {
        self.armed.clear();
        self.armed_addrs.clear();
    }
}

/// Read-only map from traceable entity id to its ordered tag sequence.
#[derive(Debug, Default)]
pub struct EntityTagStore {
    entries: HashMap<u64, Vec<Tag>>,
}

impl EntityTagStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: u64, tags: Vec<Tag>) {
        self.entries.insert(id, tags);
    }

    /// Number of tags associated with `id`; zero for unknown entities.
    pub fn tag_count(&self, id: u64) -> usize {
        self.entries.get(&id).map_or(0, Vec::len)
    }

    pub fn tag_at(&self, id: u64, index: usize) -> Option<Tag> {
        self.entries.get(&id)?.get(index).copied()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
