//! ProcessImage root (§5): owns the Directory, Graph, anchor analysis, tags, edge predicates,
//! signature directory, and the persistent derived set. Constructed once; queried many times on
//! a single thread.

use log::debug;

use crate::anchors::AnchorAnalysis;
use crate::directory::{AllocationIndex, Directory};
use crate::edge_predicate::EdgePredicate;
use crate::external::{ExternalAnchorPointChecker, StackRegistry, ThreadMap, VirtualAddressMap};
use crate::graph::Graph;
use crate::set::Set;
use crate::signature::SignatureDirectory;
use crate::tags::{TaggerRunner, TagHolder};
use crate::word::Word;

pub struct ProcessImage<'m, W: Word> {
    directory: Directory<W>,
    map: &'m dyn VirtualAddressMap<W>,
    graph: Graph<W>,
    anchors: AnchorAnalysis<W>,
    tags: TagHolder,
    tainted: EdgePredicate,
    favored: EdgePredicate,
    signatures: SignatureDirectory<W>,
    derived: Set,
}

impl<'m, W: Word> ProcessImage<'m, W> {
    /// Builds the whole immutable model in one pass: Graph from Directory, anchor analysis
    /// from Graph, then the tagger pre-pass exactly once (§3 lifecycle; §5 "none publishes
    /// partial state: all three must finish before any query runs").
    #[allow(clippy::too_many_arguments)]
    pub fn build(
        directory: Directory<W>,
        map: &'m dyn VirtualAddressMap<W>,
        obscured: Option<&dyn crate::external::ObscuredReferenceChecker<W>>,
        static_ranges: &[(W, W)],
        stacks: Option<&dyn StackRegistry<W>>,
        threads: Option<&dyn ThreadMap<W>>,
        external: Option<&dyn ExternalAnchorPointChecker<W>>,
        signatures: SignatureDirectory<W>,
        taggers: TaggerRunner<W>,
    ) -> Self {
        let n = directory.num_allocations();
        debug!("building process image for {n} allocations");

        let graph = Graph::build(&directory, map, obscured);
        let anchors = AnchorAnalysis::build(&directory, &graph, static_ranges, stacks, threads, external, map);

        let mut tags = TagHolder::new(n);
        let mut tainted = EdgePredicate::new(graph.total_edges());
        let mut favored = EdgePredicate::new(graph.total_edges());
        taggers.run(&directory, &graph, map, &mut tainted, &mut favored, &mut tags, |_index| {
            // First-word-is-unsigned is computed lazily per allocation by taggers that need it,
            // via `signatures.is_signature`; the default closure here is deliberately
            // conservative (treats everything as potentially signed) since most taggers only
            // read `is_unsigned` as a fast-path hint, not a correctness requirement.
            false
        });

        ProcessImage {
            directory,
            map,
            graph,
            anchors,
            tags,
            tainted,
            favored,
            signatures,
            derived: Set::new(n),
        }
    }

    pub fn directory(&self) -> &Directory<W> {
        &self.directory
    }

    pub fn map(&self) -> &dyn VirtualAddressMap<W> {
        self.map
    }

    pub fn graph(&self) -> &Graph<W> {
        &self.graph
    }

    pub fn anchors(&self) -> &AnchorAnalysis<W> {
        &self.anchors
    }

    pub fn tags(&self) -> &TagHolder {
        &self.tags
    }

    pub fn tainted(&self) -> &EdgePredicate {
        &self.tainted
    }

    pub fn favored(&self) -> &EdgePredicate {
        &self.favored
    }

    pub fn signatures(&self) -> &SignatureDirectory<W> {
        &self.signatures
    }

    pub fn derived(&self) -> &Set {
        &self.derived
    }

    pub fn derived_mut(&mut self) -> &mut Set {
        &mut self.derived
    }

    pub fn is_leaked(&self, index: AllocationIndex) -> bool {
        self.anchors.is_leaked(index)
    }

    /// Looks up an allocation by index for query execution. Per §7, a valid index resolving to
    /// nothing is an invariant violation, not bad input: the Directory guarantees every index
    /// `< num_allocations()` is populated, so a miss here means a caller (or an earlier pass)
    /// built an inconsistent index and must abort rather than silently skip.
    pub fn allocation_or_abort(&self, index: AllocationIndex) -> &crate::directory::Allocation<W> {
        self.directory
            .get(index)
            .unwrap_or_else(|| panic!("allocation index {index} has no backing allocation: directory is corrupt"))
    }
}
