//! The validate/commit protocol and its memoized decisions.
//!
//! One [`ValidationEngine`] value holds everything the protocol needs: the
//! tag bus built from configuration, the metadata converter, the rule cache
//! and the registered host callbacks. There is no ambient global engine;
//! embedders construct as many independent engines as they like and serialize
//! calls into each one externally (the engine spawns no threads and takes no
//! locks).
//!
//! Per instruction, the host drives:
//!
//! 1. [`ValidationEngine::validate`] — a pure query that gathers the current
//!    input tags, consults the rule cache (or the external policy on a miss)
//!    and parks the resulting decision as pending.
//! 2. [`ValidationEngine::commit`] — applies the pending decision's output
//!    tags. Squashed or faulting instructions simply skip this step; the next
//!    `validate` silently discards the stale pending decision.

mod cache;
mod host;

pub use cache::{RuleCache, RuleCacheStats, RuleKey, DEFAULT_RULE_CACHE_CAPACITY};
pub use host::HostAccess;

use std::path::Path;

use thiserror::Error;
use warden_config::{ConfigError, SocTagConfiguration};
use warden_debug::{
    AccessPhase, DebugEvent, DebugEventQueue, EntityTagStore, HookTable, TagSpace, WatchManager,
};
use warden_meta::{Generation, MetaError, MetaSetFactory, TagConverter};
use warden_policy::{Decision, InputTags, PolicyModule, Verdict, Violation};
use warden_tags::{Tag, TagBus, TagError, TagFile};

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    /// No configuration has been loaded yet.
    #[error("no configuration loaded")]
    NotConfigured,
    /// Host callbacks have not been registered.
    #[error("host callbacks not registered")]
    NoCallbacks,
    #[error(transparent)]
    Tag(#[from] TagError),
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Result of a [`ValidationEngine::commit`] call.
///
/// `NoPending` is a status, not an error: committing while idle (or twice for
/// the same decision) performs no tag mutation and is reported here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed,
    NoPending,
}

/// Everything rebuilt wholesale by a configuration load.
struct LoadedState {
    factory: MetaSetFactory,
    converter: TagConverter,
    bus: TagBus,
    pc_tag: Tag,
    registers: TagFile,
    csrs: TagFile,
}

/// A validated decision waiting for its commit.
struct PendingDecision {
    decision: Decision,
    pc: u64,
    rd: Option<u8>,
    csr_addr: Option<u64>,
    mem_addr: Option<u64>,
}

pub struct ValidationEngine {
    policy: Box<dyn PolicyModule>,
    host: Option<Box<dyn HostAccess>>,
    state: Option<LoadedState>,
    cache: RuleCache,
    generation: Generation,
    pending: Option<PendingDecision>,
    violation: Option<Violation>,
    watches: WatchManager,
    events: DebugEventQueue,
    hooks: HookTable,
    entities: EntityTagStore,
}

impl ValidationEngine {
    pub fn new(policy: Box<dyn PolicyModule>) -> Self {
        Self::with_cache_capacity(policy, DEFAULT_RULE_CACHE_CAPACITY)
    }

    pub fn with_cache_capacity(policy: Box<dyn PolicyModule>, capacity: usize) -> Self {
        Self {
            policy,
            host: None,
            state: None,
            cache: RuleCache::new(capacity),
            generation: Generation::default(),
            pending: None,
            violation: None,
            watches: WatchManager::new(),
            events: DebugEventQueue::default(),
            hooks: HookTable::new(),
            entities: EntityTagStore::new(),
        }
    }

    /// Registers the host accessors used during validate.
    pub fn set_callbacks(&mut self, host: Box<dyn HostAccess>) {
        self.host = Some(host);
    }

    /// Loads (or reloads) the declarative address map and policy metadata
    /// from a file.
    ///
    /// Fatal on malformed input: the error is returned and the previously
    /// loaded configuration, if any, stays fully in effect. On success every
    /// previously issued tag and the entire rule cache are invalidated.
    pub fn set_metadata(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let config = SocTagConfiguration::from_path(path)?;
        self.install(config)
    }

    /// [`ValidationEngine::set_metadata`] for an in-memory document.
    pub fn set_metadata_str(&mut self, doc: &str) -> Result<()> {
        let config = SocTagConfiguration::from_json_str(doc)?;
        self.install(config)
    }

    fn install(&mut self, config: SocTagConfiguration) -> Result<()> {
        // Build the whole replacement state before touching `self` so a bad
        // document cannot leave a partially loaded configuration behind.
        let factory = config.build_factory();
        let mut converter = TagConverter::new();
        let mut bus = TagBus::new();
        config.apply(&mut bus, &factory, &mut converter)?;

        let defaults = config.defaults();
        let pc_tag = resolve_default(&factory, &mut converter, defaults.pc.as_deref())
            .map_err(ConfigError::from)?;
        let reg_tag = resolve_default(&factory, &mut converter, defaults.register.as_deref())
            .map_err(ConfigError::from)?;
        let csr_tag = resolve_default(&factory, &mut converter, defaults.csr.as_deref())
            .map_err(ConfigError::from)?;

        let mut entities = EntityTagStore::new();
        for (id, names) in config.entities() {
            let mut tags = Vec::with_capacity(names.len());
            for name in names {
                let set = factory.get_meta_set(name).map_err(ConfigError::from)?;
                tags.push(converter.meta_set_to_tag(set));
            }
            entities.insert(*id, tags);
        }

        self.hooks.set_symbols(config.symbols().iter().cloned());
        self.entities = entities;
        self.state = Some(LoadedState {
            factory,
            converter,
            bus,
            pc_tag,
            registers: TagFile::new(reg_tag),
            csrs: TagFile::new(csr_tag),
        });
        self.generation = self.generation.next();
        self.cache.clear();
        self.pending = None;
        self.violation = None;
        self.events.clear();

        tracing::info!(
            generation = self.generation.value(),
            elements = config.elements().len(),
            "configuration loaded"
        );
        Ok(())
    }

    /// Asks whether the instruction at `pc` may retire, given current tags.
    ///
    /// Pure query: tag storage is never mutated here. On Allow the decision
    /// is parked as pending (replacing any previous pending decision — this
    /// is the cancellation path for squashed instructions). On Deny a
    /// structured violation is recorded and nothing becomes committable. A
    /// runtime fault leaves any pending decision untouched.
    pub fn validate(&mut self, pc: u64, instr: u32) -> Result<Verdict> {
        let state = self.state.as_mut().ok_or(EngineError::NotConfigured)?;
        let host = self.host.as_mut().ok_or(EngineError::NoCallbacks)?;

        let class = self.policy.classify(pc, instr);

        let code_addr = host.fix_address(pc);
        let ci = state.bus.get_tag(code_addr)?;

        let op1 = class.rs1.map(|r| state.registers.get(u64::from(r)));
        let op2 = class.rs2.map(|r| state.registers.get(u64::from(r)));
        let op3 = class.rs3.map(|r| state.registers.get(u64::from(r)));
        let csr = class.csr.map(|addr| state.csrs.get(addr));

        let (mem_addr, mem) = match class.mem {
            Some(access) => {
                let base = host.read_register(u64::from(access.base));
                let vaddr = base.wrapping_add(access.offset as u64);
                let addr = host.fix_address(vaddr);
                (Some(addr), Some(state.bus.get_tag(addr)?))
            }
            None => (None, None),
        };

        let inputs = InputTags {
            pc: state.pc_tag,
            ci,
            op1,
            op2,
            op3,
            csr,
            mem,
        };

        if self.watches.pc_watched() {
            self.events.record(DebugEvent::WatchHit {
                space: TagSpace::Pc,
                phase: AccessPhase::Validate,
                addr: pc,
                tag: state.pc_tag.to_bits(),
                pc,
                value: None,
            });
        }
        for reg in [class.rs1, class.rs2, class.rs3].into_iter().flatten() {
            let addr = u64::from(reg);
            if self.watches.register_watched(addr) {
                self.events.record(DebugEvent::WatchHit {
                    space: TagSpace::Register,
                    phase: AccessPhase::Validate,
                    addr,
                    tag: state.registers.get(addr).to_bits(),
                    pc,
                    value: None,
                });
            }
        }
        if let Some(addr) = class.csr {
            if self.watches.csr_watched(addr) {
                self.events.record(DebugEvent::WatchHit {
                    space: TagSpace::Csr,
                    phase: AccessPhase::Validate,
                    addr,
                    tag: state.csrs.get(addr).to_bits(),
                    pc,
                    value: None,
                });
            }
        }
        if let (Some(addr), Some(tag)) = (mem_addr, mem) {
            if self.watches.memory_watched(addr) {
                let value = Some(host.read_memory(addr));
                self.events.record(DebugEvent::WatchHit {
                    space: TagSpace::Memory,
                    phase: AccessPhase::Validate,
                    addr,
                    tag: tag.to_bits(),
                    pc,
                    value,
                });
            }
        }
        if let Some(name) = self.hooks.armed_at(pc) {
            let name = name.to_owned();
            self.events.record(DebugEvent::HookReached { name, pc });
        }

        let key = RuleKey {
            class: class.opcode_class,
            inputs,
        };
        let decision = match self.cache.lookup(&key) {
            Some(decision) => decision,
            None => {
                let decision = self.policy.evaluate(class.opcode_class, &inputs);
                self.cache.insert(key, decision.clone());
                decision
            }
        };

        match decision.verdict {
            Verdict::Allow => {
                self.pending = Some(PendingDecision {
                    decision,
                    pc,
                    rd: class.rd,
                    csr_addr: class.csr,
                    mem_addr,
                });
                Ok(Verdict::Allow)
            }
            Verdict::Deny => {
                self.pending = None;
                let rule = decision
                    .diagnostic
                    .clone()
                    .unwrap_or_else(|| "policy deny".to_owned());
                tracing::debug!(pc, rule = %rule, "validation denied");
                self.violation = Some(Violation { pc, rule, inputs });
                Ok(Verdict::Deny)
            }
        }
    }

    /// Applies the pending decision's output tags and returns to idle.
    ///
    /// The memory tag write is the only fallible one and happens first, so a
    /// fault restores the pending decision and leaves tag state untouched.
    pub fn commit(&mut self) -> Result<CommitOutcome> {
        let state = self.state.as_mut().ok_or(EngineError::NotConfigured)?;
        let Some(pending) = self.pending.take() else {
            return Ok(CommitOutcome::NoPending);
        };
        let outputs = pending.decision.outputs;

        if let (Some(addr), Some(tag)) = (pending.mem_addr, outputs.mem) {
            if let Err(err) = state.bus.set_tag(addr, tag) {
                self.pending = Some(pending);
                return Err(err.into());
            }
            if self.watches.memory_watched(addr) {
                let value = self.host.as_mut().map(|h| h.read_memory(addr));
                self.events.record(DebugEvent::WatchHit {
                    space: TagSpace::Memory,
                    phase: AccessPhase::Commit,
                    addr,
                    tag: tag.to_bits(),
                    pc: pending.pc,
                    value,
                });
            }
        }

        if let Some(tag) = outputs.pc {
            state.pc_tag = tag;
            if self.watches.pc_watched() {
                self.events.record(DebugEvent::WatchHit {
                    space: TagSpace::Pc,
                    phase: AccessPhase::Commit,
                    addr: pending.pc,
                    tag: tag.to_bits(),
                    pc: pending.pc,
                    value: None,
                });
            }
        }
        if let (Some(rd), Some(tag)) = (pending.rd, outputs.rd) {
            let addr = u64::from(rd);
            state.registers.set(addr, tag);
            if self.watches.register_watched(addr) {
                self.events.record(DebugEvent::WatchHit {
                    space: TagSpace::Register,
                    phase: AccessPhase::Commit,
                    addr,
                    tag: tag.to_bits(),
                    pc: pending.pc,
                    value: None,
                });
            }
        }
        if let (Some(addr), Some(tag)) = (pending.csr_addr, outputs.csr) {
            state.csrs.set(addr, tag);
            if self.watches.csr_watched(addr) {
                self.events.record(DebugEvent::WatchHit {
                    space: TagSpace::Csr,
                    phase: AccessPhase::Commit,
                    addr,
                    tag: tag.to_bits(),
                    pc: pending.pc,
                    value: None,
                });
            }
        }

        Ok(CommitOutcome::Committed)
    }

    // --- tag administration ----------------------------------------------

    /// Bulk-assigns a tag (by raw bits, as previously issued under the
    /// current generation) to `[start, end)`, bypassing per-word dispatch.
    pub fn load_tag_range(&mut self, start: u64, end: u64, tag_bits: u64) -> Result<()> {
        let state = self.state.as_mut().ok_or(EngineError::NotConfigured)?;
        state.bus.load_range(start, end, Tag::from_bits(tag_bits))?;
        Ok(())
    }

    // --- introspection ---------------------------------------------------

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn pending_verdict(&self) -> Option<Verdict> {
        self.pending.as_ref().map(|p| p.decision.verdict)
    }

    /// The most recent deny, if any.
    pub fn violation(&self) -> Option<&Violation> {
        self.violation.as_ref()
    }

    pub fn rule_cache_stats(&self) -> RuleCacheStats {
        self.cache.stats()
    }

    pub fn pc_tag(&self) -> Option<Tag> {
        self.state.as_ref().map(|s| s.pc_tag)
    }

    pub fn reg_tag(&self, addr: u64) -> Option<Tag> {
        self.state.as_ref().map(|s| s.registers.get(addr))
    }

    pub fn csr_tag(&self, addr: u64) -> Option<Tag> {
        self.state.as_ref().map(|s| s.csrs.get(addr))
    }

    pub fn mem_tag(&self, addr: u64) -> Result<Tag> {
        let state = self.state.as_ref().ok_or(EngineError::NotConfigured)?;
        Ok(state.bus.get_tag(addr)?)
    }

    // --- watchpoints and debug events ------------------------------------

    pub fn set_pc_watch(&mut self, enabled: bool) {
        self.watches.set_pc_watch(enabled);
    }

    pub fn set_reg_watch(&mut self, addr: u64) {
        self.watches.watch_register(addr);
    }

    pub fn set_csr_watch(&mut self, addr: u64) {
        self.watches.watch_csr(addr);
    }

    pub fn set_mem_watch(&mut self, addr: u64) {
        self.watches.watch_memory(addr);
    }

    pub fn clear_watches(&mut self) {
        self.watches.clear();
    }

    pub fn drain_debug_events(&mut self, max: usize) -> Vec<DebugEvent> {
        self.events.drain(max)
    }

    // --- hooks ------------------------------------------------------------

    /// Resolves `name` against the configured symbol information and arms it.
    /// Returns false for unknown names.
    pub fn set_hook(&mut self, name: &str) -> bool {
        self.hooks.set_hook(name)
    }

    pub fn hook_address(&self, name: &str) -> Option<u64> {
        self.hooks.hook_address(name)
    }

    // --- entity tags ------------------------------------------------------

    pub fn entity_tag_count(&self, id: u64) -> u64 {
        self.entities.tag_count(id) as u64
    }

    pub fn entity_tag(&self, id: u64, index: usize) -> Option<Tag> {
        self.entities.tag_at(id, index)
    }

    // --- buffer-based descriptions ---------------------------------------
    //
    // These keep the embedder-facing contract of the C-style surface: the
    // caller owns the buffer, the write is truncated to its capacity, and the
    // return value is the number of bytes written. Internally the message is
    // an owned string.

    pub fn describe_violation(&self, dest: &mut [u8]) -> usize {
        let msg = match &self.violation {
            Some(v) => {
                let mut msg = format!("violation at pc=0x{:x}: {}", v.pc, v.rule);
                if let Some(state) = &self.state {
                    msg.push_str(" [pc ");
                    msg.push_str(&state.converter.describe(v.inputs.pc, &state.factory));
                    msg.push_str(", ci ");
                    msg.push_str(&state.converter.describe(v.inputs.ci, &state.factory));
                    for (slot, tag) in [
                        ("op1", v.inputs.op1),
                        ("op2", v.inputs.op2),
                        ("op3", v.inputs.op3),
                        ("csr", v.inputs.csr),
                        ("mem", v.inputs.mem),
                    ] {
                        if let Some(tag) = tag {
                            msg.push_str(", ");
                            msg.push_str(slot);
                            msg.push(' ');
                            msg.push_str(&state.converter.describe(tag, &state.factory));
                        }
                    }
                    msg.push(']');
                }
                msg
            }
            None => "no violation".to_owned(),
        };
        write_truncated(dest, &msg)
    }

    pub fn describe_pc_tag(&self, dest: &mut [u8]) -> usize {
        let msg = match &self.state {
            Some(state) => state.converter.describe(state.pc_tag, &state.factory),
            None => "no configuration loaded".to_owned(),
        };
        write_truncated(dest, &msg)
    }

    pub fn describe_reg_tag(&self, dest: &mut [u8], addr: u64) -> usize {
        let msg = match &self.state {
            Some(state) => state
                .converter
                .describe(state.registers.get(addr), &state.factory),
            None => "no configuration loaded".to_owned(),
        };
        write_truncated(dest, &msg)
    }

    pub fn describe_csr_tag(&self, dest: &mut [u8], addr: u64) -> usize {
        let msg = match &self.state {
            Some(state) => state.converter.describe(state.csrs.get(addr), &state.factory),
            None => "no configuration loaded".to_owned(),
        };
        write_truncated(dest, &msg)
    }

    pub fn describe_mem_tag(&self, dest: &mut [u8], addr: u64) -> usize {
        let msg = match &self.state {
            Some(state) => match state.bus.get_tag(addr) {
                Ok(tag) => state.converter.describe(tag, &state.factory),
                Err(err) => err.to_string(),
            },
            None => "no configuration loaded".to_owned(),
        };
        write_truncated(dest, &msg)
    }
}

fn resolve_default(
    factory: &MetaSetFactory,
    converter: &mut TagConverter,
    name: Option<&str>,
) -> std::result::Result<Tag, MetaError> {
    match name {
        Some(name) => Ok(converter.meta_set_to_tag(factory.get_meta_set(name)?)),
        None => Ok(converter.default_tag()),
    }
}

/// Copies at most `dest.len()` bytes of `msg` into `dest`, returning the
/// byte count actually written.
fn write_truncated(dest: &mut [u8], msg: &str) -> usize {
    let n = dest.len().min(msg.len());
    dest[..n].copy_from_slice(&msg.as_bytes()[..n]);
    n
}
