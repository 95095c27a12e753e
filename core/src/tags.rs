//! Tag Holder and Tagger Runner (component I, §3, §4.3).

use std::collections::{HashMap, HashSet};

use bitflags::bitflags;

use crate::directory::{AllocationIndex, Directory};
use crate::edge_predicate::EdgePredicate;
use crate::external::VirtualAddressMap;
use crate::graph::Graph;
use crate::word::Word;

bitflags! {
    /// Per-tag behavior flags, mirroring the teacher's small `bitflags!`-backed flag sets.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TagFlags: u8 {
        /// This tag's edges may be marked `favored` by the tagger that assigns it.
        const SUPPORTS_FAVORED_REFERENCES = 1 << 0;
        /// Once assigned, a weaker (later) tagger may not overwrite this tag.
        const IS_TERMINAL = 1 << 1;
    }
}

/// The four escalating phases a [`Tagger`] is invoked in, cheapest first (§4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    QuickInitialCheck,
    MediumCheck,
    SlowCheck,
    WeakCheck,
}

impl Phase {
    pub const ALL: [Phase; 4] = [
        Phase::QuickInitialCheck,
        Phase::MediumCheck,
        Phase::SlowCheck,
        Phase::WeakCheck,
    ];
}

/// Per-allocation tag index; `0` means untagged. Index into the registered-tag table.
pub type TagIndex = u32;

struct RegisteredTag {
    name: String,
    flags: TagFlags,
}

/// Per-allocation small-integer tag index, plus the registered-tag table and its name→indices
/// reverse map (one name may cover several variants of the same pattern).
pub struct TagHolder {
    tag_of: Vec<TagIndex>,
    registered: Vec<RegisteredTag>,
    indices_by_name: HashMap<String, HashSet<TagIndex>>,
}

const UNTAGGED: TagIndex = 0;

impl TagHolder {
    pub fn new(num_allocations: usize) -> Self {
        TagHolder {
            tag_of: vec![UNTAGGED; num_allocations],
            // Index 0 is reserved for "untagged" and has no name.
            registered: vec![RegisteredTag { name: String::new(), flags: TagFlags::empty() }],
            indices_by_name: HashMap::new(),
        }
    }

    pub fn register_tag(&mut self, name: &str, flags: TagFlags) -> TagIndex {
        let index = self.registered.len() as TagIndex;
        self.registered.push(RegisteredTag { name: name.to_string(), flags });
        self.indices_by_name.entry(name.to_string()).or_default().insert(index);
        index
    }

    /// Assigns `tag` to `index` unless it already holds a non-zero, terminal tag.
    /// Returns whether the assignment took effect.
    pub fn tag_allocation(&mut self, index: AllocationIndex, tag: TagIndex) -> bool {
        let slot = &mut self.tag_of[index as usize];
        if *slot != UNTAGGED && self.registered[*slot as usize].flags.contains(TagFlags::IS_TERMINAL) {
            return false;
        }
        *slot = tag;
        true
    }

    #[inline]
    pub fn get_tag_index(&self, index: AllocationIndex) -> TagIndex {
        self.tag_of[index as usize]
    }

    pub fn tag_indices(&self, name: &str) -> Option<&HashSet<TagIndex>> {
        self.indices_by_name.get(name)
    }

    pub fn name_of(&self, tag: TagIndex) -> &str {
        &self.registered[tag as usize].name
    }

    pub fn flags_of(&self, tag: TagIndex) -> TagFlags {
        self.registered[tag as usize].flags
    }

    pub fn supports_favored_references(&self, index: AllocationIndex) -> bool {
        self.flags_of(self.get_tag_index(index)).contains(TagFlags::SUPPORTS_FAVORED_REFERENCES)
    }
}

/// Context handed to every tagger invocation: everything built so far (Directory, Graph, the
/// two edge predicates) plus the address map for re-reading allocation contents.
pub struct TaggerContext<'a, W: Word> {
    pub directory: &'a Directory<W>,
    pub graph: &'a Graph<W>,
    pub map: &'a dyn VirtualAddressMap<W>,
    pub tainted: &'a mut EdgePredicate,
    pub favored: &'a mut EdgePredicate,
}

/// A pattern tagger. Each entry point may freely mutate edge predicates via `ctx.edges` but
/// must never panic on malformed input — environmental misses are simply "no match" (§7).
pub trait Tagger<W: Word> {
    /// Walks allocations by index, deciding purely from the allocation's own contents.
    /// `is_unsigned` is true when the first word isn't a recognized signature.
    fn tag_from_allocation(
        &self,
        ctx: &mut TaggerContext<'_, W>,
        tags: &mut TagHolder,
        index: AllocationIndex,
        phase: Phase,
        is_unsigned: bool,
    );

    /// Walks allocations by index, but decides by inspecting the allocation's *outgoing*
    /// edges to other already-tagged candidate allocations.
    fn tag_from_referenced(
        &self,
        ctx: &mut TaggerContext<'_, W>,
        tags: &mut TagHolder,
        index: AllocationIndex,
        phase: Phase,
    );
}

/// Drives the 4-phase protocol: phases outer, allocations inner, so every allocation reaches
/// the next phase together and an early-quitting tagger can simply not re-register interest.
pub struct TaggerRunner<W: Word> {
    taggers: Vec<Box<dyn Tagger<W>>>,
}

impl<W: Word> Default for TaggerRunner<W> {
    fn default() -> Self {
        TaggerRunner { taggers: Vec::new() }
    }
}

impl<W: Word> TaggerRunner<W> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tagger: Box<dyn Tagger<W>>) {
        self.taggers.push(tagger);
    }

    /// Runs the full pre-pass: for each phase, for each allocation, for each tagger, call both
    /// entry points. Runs exactly once, before any query (§3 lifecycle).
    pub fn run(
        &self,
        directory: &Directory<W>,
        graph: &Graph<W>,
        map: &dyn VirtualAddressMap<W>,
        tainted: &mut EdgePredicate,
        favored: &mut EdgePredicate,
        tags: &mut TagHolder,
        is_unsigned: impl Fn(AllocationIndex) -> bool,
    ) {
        let mut ctx = TaggerContext { directory, graph, map, tainted, favored };
        for phase in Phase::ALL {
            for index in 0..directory.num_allocations() as AllocationIndex {
                for tagger in &self.taggers {
                    tagger.tag_from_allocation(&mut ctx, tags, index, phase, is_unsigned(index));
                    tagger.tag_from_referenced(&mut ctx, tags, index, phase);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_nonzero_tag_wins_unless_terminal() {
        let mut tags = TagHolder::new(2);
        let a = tags.register_tag("A", TagFlags::empty());
        let b = tags.register_tag("B", TagFlags::IS_TERMINAL);
        assert!(tags.tag_allocation(0, a));
        assert!(tags.tag_allocation(0, b), "non-terminal tag may be overwritten");
        assert!(!tags.tag_allocation(0, a), "terminal tag may not be overwritten");
        assert_eq!(tags.get_tag_index(0), b);
    }

    #[test]
    fn name_maps_to_multiple_indices() {
        let mut tags = TagHolder::new(1);
        let v1 = tags.register_tag("VectorBody", TagFlags::empty());
        let v2 = tags.register_tag("VectorBody", TagFlags::empty());
        let indices = tags.tag_indices("VectorBody").unwrap();
        assert!(indices.contains(&v1) && indices.contains(&v2));
    }
}
