//! Allocation Graph (component E, §3, §4.1).
//!
//! A compact, bidirectional CSR-style edge index. Built once from the Directory in two
//! streaming passes; never mutated afterwards (edge *labels* — tainted/favored — live in
//! [`crate::edge_predicate::EdgePredicate`], not here).

use std::collections::BTreeSet;

use log::trace;

use crate::directory::{AllocationIndex, Directory};
use crate::external::{ObscuredReferenceChecker, VirtualAddressMap};
use crate::image::ContiguousImage;
use crate::word::Word;

/// Dense index into the combined outgoing/incoming edge namespace (§3: "the same edge has two
/// indices"). `EdgeIndex == total_edges` is the sentinel "no such edge".
pub type EdgeIndex = u32;

pub struct Graph<W: Word> {
    num_allocations: usize,
    total_edges: EdgeIndex,
    first_outgoing: Vec<EdgeIndex>,
    outgoing: Vec<AllocationIndex>,
    first_incoming: Vec<EdgeIndex>,
    incoming: Vec<AllocationIndex>,
    _word: std::marker::PhantomData<W>,
}

impl<W: Word> Graph<W> {
    /// Builds the graph with the two-pass algorithm of §4.1: count distinct targets per
    /// source to size the CSR arrays, then fill them in reverse source order so that each
    /// target's incoming-source list ends up sorted (matching source-index order, which
    /// tracks address order since the Directory is sorted by address).
    pub fn build(
        directory: &Directory<W>,
        map: &dyn VirtualAddressMap<W>,
        obscured: Option<&dyn ObscuredReferenceChecker<W>>,
    ) -> Self {
        let n = directory.num_allocations();
        let sentinel = directory.sentinel();

        let mut first_outgoing = vec![0u32; n + 1];
        let mut incoming_counts = vec![0u32; n];
        let mut total_edges: EdgeIndex = 0;

        trace!("graph build: pass 1 (count) over {n} allocations");
        for i in 0..n {
            let targets = distinct_targets(directory, map, obscured, i as AllocationIndex, sentinel);
            for &t in &targets {
                incoming_counts[t as usize] += 1;
            }
            total_edges += targets.len() as u32;
            first_outgoing[i + 1] = total_edges;
        }

        let mut first_incoming = vec![0u32; n + 1];
        for t in 0..n {
            first_incoming[t + 1] = first_incoming[t] + incoming_counts[t];
        }
        assert_eq!(
            first_incoming[n], total_edges,
            "pass-1 target sets must agree between outgoing and incoming counts"
        );

        let mut outgoing = vec![sentinel; total_edges as usize];
        let mut incoming = vec![sentinel; total_edges as usize];

        trace!("graph build: pass 2 (fill) over {n} allocations");
        for i in (0..n).rev() {
            let targets = distinct_targets(directory, map, obscured, i as AllocationIndex, sentinel);
            let base = first_outgoing[i] as usize;
            for (k, &t) in targets.iter().enumerate() {
                outgoing[base + k] = t;
                first_incoming[t as usize + 1] -= 1;
                incoming[first_incoming[t as usize + 1] as usize] = i as AllocationIndex;
            }
        }

        Graph {
            num_allocations: n,
            total_edges,
            first_outgoing,
            outgoing,
            first_incoming,
            incoming,
            _word: std::marker::PhantomData,
        }
    }

    #[inline]
    pub fn total_edges(&self) -> EdgeIndex {
        self.total_edges
    }

    #[inline]
    pub fn num_allocations(&self) -> usize {
        self.num_allocations
    }

    pub fn outgoing(&self, source: AllocationIndex) -> &[AllocationIndex] {
        if (source as usize) >= self.num_allocations {
            return &[];
        }
        let s = source as usize;
        &self.outgoing[self.first_outgoing[s] as usize..self.first_outgoing[s + 1] as usize]
    }

    pub fn incoming(&self, target: AllocationIndex) -> &[AllocationIndex] {
        if (target as usize) >= self.num_allocations {
            return &[];
        }
        let t = target as usize;
        &self.incoming[self.first_incoming[t] as usize..self.first_incoming[t + 1] as usize]
    }

    /// Binary search for the outgoing edge from `source` to `target`. Returns
    /// `total_edges()` if no such edge exists.
    pub fn outgoing_edge_index(&self, source: AllocationIndex, target: AllocationIndex) -> EdgeIndex {
        let slice = self.outgoing(source);
        match slice.binary_search(&target) {
            Ok(i) => self.first_outgoing[source as usize] + i as u32,
            Err(_) => self.total_edges,
        }
    }

    /// Binary search for the incoming edge into `target` from `source`. Returns
    /// `total_edges()` if no such edge exists.
    pub fn incoming_edge_index(&self, source: AllocationIndex, target: AllocationIndex) -> EdgeIndex {
        let slice = self.incoming(target);
        match slice.binary_search(&source) {
            Ok(i) => self.first_incoming[target as usize] + i as u32,
            Err(_) => self.total_edges,
        }
    }

    pub fn target_for_outgoing(&self, edge: EdgeIndex) -> AllocationIndex {
        if edge < self.total_edges {
            self.outgoing[edge as usize]
        } else {
            self.num_allocations as AllocationIndex
        }
    }

    pub fn source_for_incoming(&self, edge: EdgeIndex) -> AllocationIndex {
        if edge < self.total_edges {
            self.incoming[edge as usize]
        } else {
            self.num_allocations as AllocationIndex
        }
    }

    /// Maps an arbitrary address to the outgoing edge of `source` whose target allocation
    /// contains it, or `None` if none of `source`'s outgoing edges land there. Relies on the
    /// fact that allocation indices are assigned in address order, so the outgoing slice
    /// (sorted by index) is also sorted by address.
    pub fn target_allocation_index(&self, directory: &Directory<W>, source: AllocationIndex, addr: W) -> AllocationIndex {
        binary_search_containing(directory, self.outgoing(source), addr)
            .unwrap_or(self.num_allocations as AllocationIndex)
    }

    pub fn source_allocation_index(&self, directory: &Directory<W>, target: AllocationIndex, addr: W) -> AllocationIndex {
        binary_search_containing(directory, self.incoming(target), addr)
            .unwrap_or(self.num_allocations as AllocationIndex)
    }
}

fn binary_search_containing<W: Word>(
    directory: &Directory<W>,
    slice: &[AllocationIndex],
    addr: W,
) -> Option<AllocationIndex> {
    let mut lo = 0usize;
    let mut hi = slice.len();
    while lo < hi {
        let mid = (lo + hi) / 2;
        let idx = slice[mid];
        let allocation = directory.allocation_at(idx);
        if addr.as_u64() < allocation.address().as_u64() {
            hi = mid;
        } else if allocation.contains(addr) {
            return Some(idx);
        } else {
            lo = mid + 1;
        }
    }
    None
}

/// Distinct, sorted set of allocation indices that `source`'s payload points at (excluding
/// itself and non-allocations). Recomputed on demand in both graph-build passes rather than
/// cached, per the streaming design (§4.1): this keeps peak memory at O(N) instead of O(E).
fn distinct_targets<W: Word>(
    directory: &Directory<W>,
    map: &dyn VirtualAddressMap<W>,
    obscured: Option<&dyn ObscuredReferenceChecker<W>>,
    source: AllocationIndex,
    sentinel: AllocationIndex,
) -> Vec<AllocationIndex> {
    let image = ContiguousImage::new(directory, map, source);
    let mut targets = BTreeSet::new();
    for &w in image.words() {
        let mut t = directory.index_of(w);
        if t == sentinel {
            if let Some(checker) = obscured {
                if let Some(resolved) = checker.index_of(w) {
                    t = resolved;
                }
            }
        }
        if t != sentinel && t != source {
            targets.insert(t);
        }
    }
    targets.into_iter().collect()
}
