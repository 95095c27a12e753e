//! Anchor Analysis (component G, §3, §4.2).
//!
//! Finds the four categories of anchor points (static memory, thread stacks, CPU registers,
//! externally-identified roots), runs one BFS per category to label distances and clear the
//! leaked flag, classifies every used allocation as anchored/leaked/unreferenced, and walks
//! anchor chains for reporting.

use std::collections::{HashMap, VecDeque};

use log::warn;

use crate::directory::{AllocationIndex, Directory};
use crate::distances::{IndexedDistances, NARROW_OVERFLOW_SENTINEL};
use crate::external::{ExternalAnchorPointChecker, StackRegistry, ThreadMap};
use crate::graph::Graph;
use crate::image::ContiguousImage;
use crate::word::Word;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AnchorCategory {
    Static,
    Stack,
    Register,
    External,
    /// Not a root category of its own: an allocation reachable from a register or stack root
    /// but not from any static or external root. Derived from the other four, not tracked by a
    /// BFS pass of its own.
    ThreadOnly,
}

/// The categories with their own root set and BFS pass. `ThreadOnly` is derived from these and
/// excluded here; see [`AnchorAnalysis::is_anchor_point`].
pub const CATEGORIES: [AnchorCategory; 4] = [
    AnchorCategory::Static,
    AnchorCategory::Stack,
    AnchorCategory::Register,
    AnchorCategory::External,
];

/// One root at which an allocation is anchored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnchorRoot<W: Word> {
    Address(W),
    Register { thread_num: usize, register_num: usize },
    External(&'static str),
}

struct CategoryState<W: Word> {
    roots: HashMap<AllocationIndex, Vec<AnchorRoot<W>>>,
    distances: IndexedDistances,
}

impl<W: Word> CategoryState<W> {
    fn new(n: usize) -> Self {
        CategoryState { roots: HashMap::new(), distances: IndexedDistances::new(n) }
    }
}

pub struct AnchorAnalysis<W: Word> {
    states: HashMap<AnchorCategory, CategoryState<W>>,
    leaked: Vec<bool>,
}

impl<W: Word> AnchorAnalysis<W> {
    /// Runs the full analysis: anchor discovery in all four categories, then one BFS per
    /// category over `graph`, then leaked/anchored/unreferenced classification.
    #[allow(clippy::too_many_arguments)]
    pub fn build(
        directory: &Directory<W>,
        graph: &Graph<W>,
        static_ranges: &[(W, W)],
        stacks: Option<&dyn StackRegistry<W>>,
        threads: Option<&dyn ThreadMap<W>>,
        external: Option<&dyn ExternalAnchorPointChecker<W>>,
        map: &dyn crate::external::VirtualAddressMap<W>,
    ) -> Self {
        let n = directory.num_allocations();
        let mut states: HashMap<AnchorCategory, CategoryState<W>> = HashMap::new();
        for cat in CATEGORIES {
            states.insert(cat, CategoryState::new(n));
        }

        find_address_range_anchors(directory, map, static_ranges, states.get_mut(&AnchorCategory::Static).unwrap());

        if let Some(registry) = stacks {
            let mut ranges: Vec<(W, W)> = Vec::new();
            registry.visit_stacks(&mut |base, limit, _kind, _top, _bottom, _thread| {
                ranges.push((base, limit));
                true
            });
            find_address_range_anchors(directory, map, &ranges, states.get_mut(&AnchorCategory::Stack).unwrap());
        }

        if let Some(threads) = threads {
            let state = states.get_mut(&AnchorCategory::Register).unwrap();
            for thread in threads.threads() {
                for (reg_num, &value) in thread.registers.iter().enumerate() {
                    let target = directory.index_of(value);
                    if target == directory.sentinel() {
                        continue;
                    }
                    if !directory.allocation_at(target).used() {
                        continue;
                    }
                    state
                        .roots
                        .entry(target)
                        .or_default()
                        .push(AnchorRoot::Register { thread_num: thread.thread_num, register_num: reg_num });
                }
            }
        }

        if let Some(checker) = external {
            let state = states.get_mut(&AnchorCategory::External).unwrap();
            for (index, allocation) in directory.iter() {
                if !allocation.used() {
                    continue;
                }
                let image = ContiguousImage::new(directory, map, index);
                if let Some(reason) = checker.external_reason(index, image.words()) {
                    if reason.is_empty() {
                        warn!("external anchor checker returned an empty reason for allocation {index}");
                    }
                    state.roots.entry(index).or_default().push(AnchorRoot::External(reason));
                }
            }
        }

        let mut leaked = vec![false; n];
        for (i, allocation) in directory.iter() {
            leaked[i as usize] = allocation.used();
        }

        for cat in CATEGORIES {
            let state = states.get_mut(&cat).unwrap();
            bfs(directory, graph, state, &mut leaked);
        }

        AnchorAnalysis { states, leaked }
    }

    pub fn is_leaked(&self, index: AllocationIndex) -> bool {
        self.leaked[index as usize]
    }

    pub fn is_anchored(&self, directory: &Directory<W>, index: AllocationIndex) -> bool {
        directory.allocation_at(index).used() && !self.is_leaked(index)
    }

    pub fn is_unreferenced(&self, directory: &Directory<W>, graph: &Graph<W>, index: AllocationIndex) -> bool {
        if !self.is_leaked(index) {
            return false;
        }
        graph
            .incoming(index)
            .iter()
            .all(|&source| !directory.allocation_at(source).used())
    }

    pub fn is_anchor_point(&self, category: AnchorCategory, index: AllocationIndex) -> bool {
        match category {
            AnchorCategory::ThreadOnly => self.is_thread_only_anchor_point(index),
            _ => self.states[&category].roots.contains_key(&index),
        }
    }

    pub fn is_any_anchor_point(&self, index: AllocationIndex) -> bool {
        !self.is_leaked(index) && CATEGORIES.iter().any(|&cat| self.is_anchor_point(cat, index))
    }

    pub fn distance(&self, category: AnchorCategory, index: AllocationIndex) -> u32 {
        self.states[&category].distances.get(index)
    }

    /// Reachable from a register or stack root, but not from any static or external root.
    pub fn is_thread_only_anchored(&self, index: AllocationIndex) -> bool {
        (self.states[&AnchorCategory::Register].distances.get(index) > 0
            || self.states[&AnchorCategory::Stack].distances.get(index) > 0)
            && self.states[&AnchorCategory::Static].distances.get(index) == 0
            && self.states[&AnchorCategory::External].distances.get(index) == 0
    }

    /// Reachable in exactly one hop from a register or stack root, and not reachable at all
    /// from a static or external root.
    pub fn is_thread_only_anchor_point(&self, index: AllocationIndex) -> bool {
        (self.states[&AnchorCategory::Register].distances.get(index) == 1
            || self.states[&AnchorCategory::Stack].distances.get(index) == 1)
            && self.states[&AnchorCategory::Static].distances.get(index) == 0
            && self.states[&AnchorCategory::External].distances.get(index) == 0
    }

    pub fn roots(&self, category: AnchorCategory, index: AllocationIndex) -> Option<&[AnchorRoot<W>]> {
        self.states[&category].roots.get(&index).map(Vec::as_slice)
    }

    /// Walks the anchor chain from `target` back to an anchor point of `category`, subject to
    /// `budget`. Returns `None` if the budget disallows reporting this chain (cap reached, or
    /// an indirect chain requested after a direct chain has already been shown).
    pub fn walk_chain(
        &self,
        directory: &Directory<W>,
        graph: &Graph<W>,
        category: AnchorCategory,
        target: AllocationIndex,
        budget: &mut ChainBudget,
    ) -> Option<Vec<AnchorChainEvent<W>>> {
        let state = &self.states[&category];

        if let Some(roots) = state.roots.get(&target) {
            if !budget.allow(true) {
                return None;
            }
            return Some(vec![AnchorChainEvent::Header { category, roots: roots.clone() }]);
        }

        let path = find_decreasing_path(directory, graph, state, target)?;
        if !budget.allow(false) {
            return None;
        }

        let anchor = *path.last().unwrap();
        let roots = state.roots.get(&anchor).cloned().unwrap_or_default();
        let mut events = vec![AnchorChainEvent::Header { category, roots }];
        for pair in path.windows(2).rev() {
            events.push(AnchorChainEvent::ChainLink { from: pair[1], to: pair[0] });
        }
        Some(events)
    }
}

/// Caps anchor-chain reporting at a small number of chains, and stops emitting indirect chains
/// once the first direct chain has been shown, so reports stay readable (§4.2).
pub struct ChainBudget {
    remaining: usize,
    seen_direct: bool,
}

impl Default for ChainBudget {
    fn default() -> Self {
        ChainBudget { remaining: 10, seen_direct: false }
    }
}

impl ChainBudget {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a budget capped at `remaining` chains instead of the default 10, for callers that
    /// size it from a `QueryDefaults::max_anchor_chain_fanout`.
    pub fn with_limit(remaining: usize) -> Self {
        ChainBudget { remaining, seen_direct: false }
    }

    fn allow(&mut self, is_direct: bool) -> bool {
        if self.remaining == 0 {
            return false;
        }
        if !is_direct && self.seen_direct {
            return false;
        }
        self.remaining -= 1;
        if is_direct {
            self.seen_direct = true;
        }
        true
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnchorChainEvent<W: Word> {
    Header { category: AnchorCategory, roots: Vec<AnchorRoot<W>> },
    ChainLink { from: AllocationIndex, to: AllocationIndex },
}

/// DFS over incoming edges of `target`, seeking a path of used allocations whose distances
/// strictly decrease down to some anchor point. Accepts two equal distances only when both
/// equal the current width's overflow sentinel (preserved quirk, see `distances.rs`).
fn find_decreasing_path<W: Word>(
    directory: &Directory<W>,
    graph: &Graph<W>,
    state: &CategoryState<W>,
    target: AllocationIndex,
) -> Option<Vec<AllocationIndex>> {
    let sentinel = state.distances.current_overflow_sentinel();
    let mut path = vec![target];
    let mut current = target;
    let mut guard = directory.num_allocations() + 1;
    loop {
        if guard == 0 {
            return None;
        }
        guard -= 1;
        if state.roots.contains_key(&current) {
            return Some(path);
        }
        let current_distance = state.distances.get(current);
        let next = graph.incoming(current).iter().copied().find(|&source| {
            directory.allocation_at(source).used() && {
                let d = state.distances.get(source);
                d < current_distance || (d == current_distance && d == sentinel)
            }
        });
        match next {
            Some(source) => {
                path.push(source);
                current = source;
            }
            None => return None,
        }
    }
}

fn find_address_range_anchors<W: Word>(
    directory: &Directory<W>,
    map: &dyn crate::external::VirtualAddressMap<W>,
    ranges: &[(W, W)],
    state: &mut CategoryState<W>,
) {
    for &(base, limit) in ranges {
        let mut addr = base.as_u64();
        let limit = limit.as_u64();
        while addr + W::BYTES as u64 <= limit {
            if let Some(value) = map.read_pointer(W::from_u64(addr)) {
                let target = directory.index_of(value);
                if target != directory.sentinel() && directory.allocation_at(target).used() {
                    state.roots.entry(target).or_default().push(AnchorRoot::Address(W::from_u64(addr)));
                }
            }
            addr += W::BYTES as u64;
        }
    }
}

fn bfs<W: Word>(directory: &Directory<W>, graph: &Graph<W>, state: &mut CategoryState<W>, leaked: &mut [bool]) {
    let mut visited = vec![false; directory.num_allocations()];
    let mut queue: VecDeque<AllocationIndex> = VecDeque::new();

    for &index in state.roots.keys() {
        if visited[index as usize] {
            continue;
        }
        visited[index as usize] = true;
        state.distances.set(index, 1);
        leaked[index as usize] = false;
        queue.push_back(index);
    }

    while let Some(current) = queue.pop_front() {
        let current_distance = state.distances.get(current);
        for &target in graph.outgoing(current) {
            if visited[target as usize] || !directory.allocation_at(target).used() {
                continue;
            }
            visited[target as usize] = true;
            state.distances.set(target, current_distance + 1);
            leaked[target as usize] = false;
            queue.push_back(target);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::Allocation;
    use crate::external::RangeAttributes;

    struct ChainMap {
        addrs: Vec<u64>,
    }
    impl crate::external::VirtualAddressMap<u64> for ChainMap {
        fn find_mapped_memory_image(&self, addr: u64) -> Option<&[u8]> {
            self.addrs.iter().position(|&a| a == addr).and_then(|i| {
                self.addrs.get(i + 1).map(|&next| Box::leak(next.to_le_bytes().to_vec().into_boxed_slice()) as &[u8])
            })
        }
        fn read_pointer(&self, addr: u64) -> Option<u64> {
            self.find_mapped_memory_image(addr)
                .map(|b| u64::from_le_bytes(b[..8].try_into().unwrap()))
        }
        fn visit_ranges(&self, _visitor: &mut dyn FnMut(RangeAttributes<u64>)) {}
    }

    #[test]
    fn ring_with_no_anchors_is_fully_leaked() {
        let addrs = vec![0x1000u64, 0x1010, 0x1020, 0x1030, 0x1000];
        let directory = Directory::new(
            addrs[..4].iter().map(|&a| Allocation::new(a, 16, true)).collect(),
            vec![false; 4],
        );
        let map = ChainMap { addrs };
        let graph = Graph::build(&directory, &map, None);
        let analysis = AnchorAnalysis::build(&directory, &graph, &[], None, None, None, &map);
        for i in 0..4u32 {
            assert!(analysis.is_leaked(i));
            assert!(!analysis.is_unreferenced(&directory, &graph, i), "every node has a used incoming edge");
        }
    }

    #[test]
    fn static_root_anchors_a_chain_and_walker_replays_it() {
        // static_addr -> A -> B -> C (a linear chain, not a ring)
        let addrs = vec![0x2000u64, 0x1000, 0x1010, 0x1020, 0];
        struct LinearMap {
            static_addr: u64,
            a: u64,
            b: u64,
            c: u64,
        }
        impl crate::external::VirtualAddressMap<u64> for LinearMap {
            fn find_mapped_memory_image(&self, addr: u64) -> Option<&[u8]> {
                let next = if addr == self.static_addr {
                    self.a
                } else if addr == self.a {
                    self.b
                } else if addr == self.b {
                    self.c
                } else {
                    return None;
                };
                Some(Box::leak(next.to_le_bytes().to_vec().into_boxed_slice()))
            }
            fn read_pointer(&self, addr: u64) -> Option<u64> {
                self.find_mapped_memory_image(addr).map(|b| u64::from_le_bytes(b[..8].try_into().unwrap()))
            }
            fn visit_ranges(&self, _visitor: &mut dyn FnMut(RangeAttributes<u64>)) {}
        }
        let _ = addrs;
        let map = LinearMap { static_addr: 0x2000, a: 0x1000, b: 0x1010, c: 0x1020 };
        let directory = Directory::new(
            vec![
                Allocation::new(0x1000u64, 16, true),
                Allocation::new(0x1010u64, 16, true),
                Allocation::new(0x1020u64, 16, true),
            ],
            vec![false; 3],
        );
        let graph = Graph::build(&directory, &map, None);
        let static_ranges = [(0x2000u64, 0x2008u64)];
        let analysis = AnchorAnalysis::build(&directory, &graph, &static_ranges, None, None, None, &map);

        assert!(analysis.is_anchor_point(AnchorCategory::Static, 0));
        assert_eq!(analysis.distance(AnchorCategory::Static, 0), 1);
        assert_eq!(analysis.distance(AnchorCategory::Static, 1), 2);
        assert_eq!(analysis.distance(AnchorCategory::Static, 2), 3);
        for i in 0..3u32 {
            assert!(!analysis.is_leaked(i));
        }

        let mut budget = ChainBudget::new();
        let events = analysis.walk_chain(&directory, &graph, AnchorCategory::Static, 2, &mut budget).unwrap();
        assert_eq!(
            events,
            vec![
                AnchorChainEvent::Header { category: AnchorCategory::Static, roots: vec![AnchorRoot::Address(0x2000)] },
                AnchorChainEvent::ChainLink { from: 0, to: 1 },
                AnchorChainEvent::ChainLink { from: 1, to: 2 },
            ]
        );
    }

    struct OneThread {
        registers: Vec<crate::external::ThreadRegisters<u64>>,
    }
    impl ThreadMap<u64> for OneThread {
        fn threads(&self) -> &[crate::external::ThreadRegisters<u64>] {
            &self.registers
        }
        fn register_name(&self, register_num: usize) -> &str {
            if register_num == 0 { "rax" } else { "rbx" }
        }
    }

    #[test]
    fn register_only_root_is_thread_only_but_not_static() {
        let addrs = vec![0x1000u64, 0x1010, 0];
        let map = ChainMap { addrs };
        let directory = Directory::new(
            vec![Allocation::new(0x1000u64, 16, true), Allocation::new(0x1010u64, 16, true)],
            vec![false; 2],
        );
        let graph = Graph::build(&directory, &map, None);
        let threads = OneThread {
            registers: vec![crate::external::ThreadRegisters { thread_num: 0, stack_pointer: 0, registers: vec![0x1000] }],
        };
        let analysis = AnchorAnalysis::build(&directory, &graph, &[], None, Some(&threads), None, &map);

        assert!(analysis.is_anchor_point(AnchorCategory::ThreadOnly, 0));
        assert!(analysis.is_thread_only_anchored(0));
        assert!(analysis.is_thread_only_anchored(1), "B is reachable through A, still thread-only");
        assert!(!analysis.is_anchor_point(AnchorCategory::ThreadOnly, 1), "B is 2 hops away, not a root itself");
    }

    #[test]
    fn static_root_disqualifies_thread_only() {
        let addrs = vec![0x2000u64, 0x1000, 0];
        struct StaticAndRegister {
            static_addr: u64,
            a: u64,
        }
        impl crate::external::VirtualAddressMap<u64> for StaticAndRegister {
            fn find_mapped_memory_image(&self, addr: u64) -> Option<&[u8]> {
                if addr == self.static_addr {
                    Some(Box::leak(self.a.to_le_bytes().to_vec().into_boxed_slice()))
                } else {
                    None
                }
            }
            fn read_pointer(&self, addr: u64) -> Option<u64> {
                self.find_mapped_memory_image(addr).map(|b| u64::from_le_bytes(b[..8].try_into().unwrap()))
            }
            fn visit_ranges(&self, _visitor: &mut dyn FnMut(RangeAttributes<u64>)) {}
        }
        let _ = addrs;
        let map = StaticAndRegister { static_addr: 0x2000, a: 0x1000 };
        let directory = Directory::new(vec![Allocation::new(0x1000u64, 16, true)], vec![false]);
        let graph = Graph::build(&directory, &map, None);
        let threads = OneThread {
            registers: vec![crate::external::ThreadRegisters { thread_num: 0, stack_pointer: 0, registers: vec![0x1000] }],
        };
        let static_ranges = [(0x2000u64, 0x2008u64)];
        let analysis = AnchorAnalysis::build(&directory, &graph, &static_ranges, None, Some(&threads), None, &map);

        assert!(!analysis.is_thread_only_anchored(0), "also reachable from a static root");
    }
}
