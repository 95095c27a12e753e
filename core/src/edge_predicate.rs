//! Edge Predicate (component H, edge-label half, §3).
//!
//! Boolean per-edge labels — `tainted` and `favored` — each stored twice (once indexed by
//! outgoing edge index, once by incoming edge index) so both directions can be queried in
//! O(1) without a graph lookup; writes keep the two halves in sync.

use crate::directory::AllocationIndex;
use crate::graph::{EdgeIndex, Graph};
use crate::word::Word;

pub struct EdgePredicate {
    by_outgoing: Vec<bool>,
    by_incoming: Vec<bool>,
}

impl EdgePredicate {
    pub fn new(total_edges: EdgeIndex) -> Self {
        EdgePredicate {
            by_outgoing: vec![false; total_edges as usize],
            by_incoming: vec![false; total_edges as usize],
        }
    }

    pub fn set<W: Word>(&mut self, graph: &Graph<W>, source: AllocationIndex, target: AllocationIndex, value: bool) {
        let out_ix = graph.outgoing_edge_index(source, target);
        let in_ix = graph.incoming_edge_index(source, target);
        if out_ix < graph.total_edges() {
            self.by_outgoing[out_ix as usize] = value;
        }
        if in_ix < graph.total_edges() {
            self.by_incoming[in_ix as usize] = value;
        }
    }

    pub fn set_all_outgoing<W: Word>(&mut self, graph: &Graph<W>, source: AllocationIndex, value: bool) {
        for &target in graph.outgoing(source) {
            self.set(graph, source, target, value);
        }
    }

    pub fn set_all_incoming<W: Word>(&mut self, graph: &Graph<W>, target: AllocationIndex, value: bool) {
        for &source in graph.incoming(target) {
            self.set(graph, source, target, value);
        }
    }

    pub fn for_edge<W: Word>(&self, graph: &Graph<W>, source: AllocationIndex, target: AllocationIndex) -> bool {
        let out_ix = graph.outgoing_edge_index(source, target);
        self.for_outgoing(out_ix)
    }

    #[inline]
    pub fn for_outgoing(&self, edge: EdgeIndex) -> bool {
        self.by_outgoing.get(edge as usize).copied().unwrap_or(false)
    }

    #[inline]
    pub fn for_incoming(&self, edge: EdgeIndex) -> bool {
        self.by_incoming.get(edge as usize).copied().unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{Allocation, Directory};
    use crate::external::{RangeAttributes, VirtualAddressMap};

    struct NoEdges;
    impl VirtualAddressMap<u64> for NoEdges {
        fn find_mapped_memory_image(&self, _addr: u64) -> Option<&[u8]> {
            None
        }
        fn read_pointer(&self, _addr: u64) -> Option<u64> {
            None
        }
        fn visit_ranges(&self, _visitor: &mut dyn FnMut(RangeAttributes<u64>)) {}
    }

    #[test]
    fn set_is_visible_from_both_directions() {
        // H -> P is the only edge we need; build a 2-node graph with an explicit edge via a
        // VirtualAddressMap that returns P's address as H's only word.
        struct OneEdge;
        impl VirtualAddressMap<u64> for OneEdge {
            fn find_mapped_memory_image(&self, addr: u64) -> Option<&[u8]> {
                if addr == 0x1000 {
                    Some(&[0x10, 0x20, 0, 0, 0, 0, 0, 0])
                } else {
                    None
                }
            }
            fn read_pointer(&self, addr: u64) -> Option<u64> {
                self.find_mapped_memory_image(addr)
                    .map(|b| u64::from_le_bytes(b[..8].try_into().unwrap()))
            }
            fn visit_ranges(&self, _visitor: &mut dyn FnMut(RangeAttributes<u64>)) {}
        }

        let directory = Directory::new(
            vec![Allocation::new(0x1000u64, 8, true), Allocation::new(0x2010u64, 8, true)],
            vec![false, false],
        );
        let graph = Graph::build(&directory, &OneEdge, None);
        assert_eq!(graph.total_edges(), 1);

        let mut pred = EdgePredicate::new(graph.total_edges());
        pred.set(&graph, 0, 1, true);
        assert!(pred.for_edge(&graph, 0, 1));
        let in_ix = graph.incoming_edge_index(0, 1);
        assert!(pred.for_incoming(in_ix));
    }
}
