//! Reference Constraint (component L, §4.6).
//!
//! Parameterized incoming/outgoing edge-count check: counts edges matching a used-state,
//! signature/pattern, and taint/unfavored filter, then tests the tally against a bound.
//! Short-circuits as soon as the bound is decided either way.

use crate::directory::{AllocationIndex, Directory};
use crate::edge_predicate::EdgePredicate;
use crate::external::VirtualAddressMap;
use crate::graph::Graph;
use crate::image::ContiguousImage;
use crate::signature::{SignatureChecker, SignatureDirectory};
use crate::tags::TagHolder;
use crate::word::Word;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Incoming,
    Outgoing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Boundary {
    Min,
    Max,
}

pub struct ReferenceConstraint<W: Word> {
    signature: SignatureChecker<W>,
    count: u64,
    boundary: Boundary,
    direction: Direction,
    wanted_used: bool,
    skip_tainted: bool,
    skip_unfavored: bool,
}

impl<W: Word> ReferenceConstraint<W> {
    pub fn new(
        signature: SignatureChecker<W>,
        count: u64,
        boundary: Boundary,
        direction: Direction,
        wanted_used: bool,
        skip_tainted: bool,
        skip_unfavored: bool,
    ) -> Self {
        ReferenceConstraint { signature, count, boundary, direction, wanted_used, skip_tainted, skip_unfavored }
    }

    /// Evaluates the constraint against `index`'s edges in `self.direction`.
    #[allow(clippy::too_many_arguments)]
    pub fn check(
        &self,
        directory: &Directory<W>,
        graph: &Graph<W>,
        map: &dyn VirtualAddressMap<W>,
        tainted: &EdgePredicate,
        favored: &EdgePredicate,
        signatures: &SignatureDirectory<W>,
        tags: &TagHolder,
        index: AllocationIndex,
    ) -> bool {
        let neighbors: &[AllocationIndex] = match self.direction {
            Direction::Outgoing => graph.outgoing(index),
            Direction::Incoming => graph.incoming(index),
        };

        let mut tally: u64 = 0;
        for &neighbor in neighbors {
            let allocation = directory.allocation_at(neighbor);
            if allocation.used() != self.wanted_used {
                continue;
            }
            if self.skip_tainted {
                let edge_tainted = match self.direction {
                    Direction::Outgoing => tainted.for_outgoing(graph_edge_index(graph, index, neighbor, self.direction)),
                    Direction::Incoming => tainted.for_incoming(graph_edge_index(graph, index, neighbor, self.direction)),
                };
                if edge_tainted {
                    continue;
                }
            }
            if self.skip_unfavored {
                let edge_favored = match self.direction {
                    Direction::Outgoing => favored.for_outgoing(graph_edge_index(graph, index, neighbor, self.direction)),
                    Direction::Incoming => favored.for_incoming(graph_edge_index(graph, index, neighbor, self.direction)),
                };
                if !edge_favored {
                    continue;
                }
            }
            let image = ContiguousImage::new(directory, map, neighbor);
            let first_word = image.word_at(0);
            if !self.signature.check(neighbor, first_word, signatures, tags) {
                continue;
            }
            tally += 1;

            if self.decided(tally) {
                return self.satisfies(tally);
            }
        }
        self.satisfies(tally)
    }

    fn decided(&self, tally: u64) -> bool {
        match self.boundary {
            Boundary::Min => tally >= self.count,
            Boundary::Max => tally > self.count,
        }
    }

    fn satisfies(&self, tally: u64) -> bool {
        match self.boundary {
            Boundary::Min => tally >= self.count,
            Boundary::Max => tally <= self.count,
        }
    }
}

fn graph_edge_index<W: Word>(
    graph: &Graph<W>,
    index: AllocationIndex,
    neighbor: AllocationIndex,
    direction: Direction,
) -> crate::graph::EdgeIndex {
    match direction {
        Direction::Outgoing => graph.outgoing_edge_index(index, neighbor),
        Direction::Incoming => graph.incoming_edge_index(neighbor, index),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::Allocation;
    use crate::external::{RangeAttributes, VirtualAddressMap};

    struct RingMap;
    impl VirtualAddressMap<u64> for RingMap {
        fn find_mapped_memory_image(&self, addr: u64) -> Option<&[u8]> {
            let next = match addr {
                0x1000 => 0x1010,
                0x1010 => 0x1020,
                0x1020 => 0x1030,
                0x1030 => 0x1000,
                _ => return None,
            };
            Some(Box::leak(next.to_le_bytes().to_vec().into_boxed_slice()))
        }
        fn read_pointer(&self, addr: u64) -> Option<u64> {
            self.find_mapped_memory_image(addr).map(|b| u64::from_le_bytes(b[..8].try_into().unwrap()))
        }
        fn visit_ranges(&self, _visitor: &mut dyn FnMut(RangeAttributes<u64>)) {}
    }

    #[test]
    fn min_and_max_incoming_match_scenario_six() {
        let directory = Directory::new(
            vec![
                Allocation::new(0x1000u64, 16, true),
                Allocation::new(0x1010u64, 16, true),
                Allocation::new(0x1020u64, 16, true),
                Allocation::new(0x1030u64, 16, true),
            ],
            vec![false; 4],
        );
        let map = RingMap;
        let graph = Graph::build(&directory, &map, None);
        let tainted = EdgePredicate::new(graph.total_edges());
        let favored = EdgePredicate::new(graph.total_edges());
        let signatures: SignatureDirectory<u64> = SignatureDirectory::new();
        let tags = TagHolder::new(4);

        let exactly_one = ReferenceConstraint::new(
            SignatureChecker::accept_all(),
            1,
            Boundary::Min,
            Direction::Incoming,
            true,
            false,
            false,
        );
        for i in 0..4u32 {
            assert!(exactly_one.check(&directory, &graph, &map, &tainted, &favored, &signatures, &tags, i));
        }

        let at_most_one = ReferenceConstraint::new(
            SignatureChecker::accept_all(),
            1,
            Boundary::Max,
            Direction::Incoming,
            true,
            false,
            false,
        );
        for i in 0..4u32 {
            assert!(at_most_one.check(&directory, &graph, &map, &tainted, &favored, &signatures, &tags, i));
        }

        let at_least_two = ReferenceConstraint::new(
            SignatureChecker::accept_all(),
            2,
            Boundary::Min,
            Direction::Incoming,
            true,
            false,
            false,
        );
        for i in 0..4u32 {
            assert!(!at_least_two.check(&directory, &graph, &map, &tainted, &favored, &signatures, &tags, i));
        }
    }
}
