//! Offline post-mortem heap forensics over a captured process image: an allocation directory,
//! a pointer graph between allocations, anchor-reachability analysis, heuristic type tagging,
//! and a query pipeline for slicing the result set.
//!
//! This crate never touches a live process or a core file; it operates entirely over the
//! [`external::VirtualAddressMap`] and related traits a caller supplies, so it has no
//! allocator-, platform-, or format-specific code of its own.

pub mod anchors;
pub mod annotate;
pub mod describe;
pub mod directory;
pub mod distances;
pub mod edge_predicate;
pub mod error;
pub mod extend;
pub mod external;
pub mod graph;
pub mod image;
pub mod iterators;
pub mod process_image;
pub mod query;
pub mod reference_constraint;
pub mod set;
pub mod signature;
pub mod tags;
pub mod taggers;
pub mod word;

pub use anchors::{AnchorAnalysis, AnchorCategory, AnchorChainEvent, AnchorRoot, ChainBudget};
pub use annotate::{Annotator, AnnotatorRegistry, InlineStringAnnotator};
pub use describe::{Describer, DescriberRegistry};
pub use directory::{Allocation, AllocationIndex, Directory};
pub use distances::IndexedDistances;
pub use edge_predicate::EdgePredicate;
pub use error::{ExtendRuleError, QueryError, SignatureError};
pub use extend::{extend, EdgeDirection, ExtensionMachine, ExtensionOptions, ExtensionVisitor, Rule};
pub use external::{
    ExternalAnchorPointChecker, ObscuredReferenceChecker, RangeAttributes, StackKind, StackRegistry, ThreadMap,
    ThreadRegisters, VirtualAddressMap,
};
pub use graph::{EdgeIndex, Graph};
pub use image::ContiguousImage;
pub use iterators::{FreeOutgoing, SeedIterator};
pub use process_image::ProcessImage;
pub use query::{run_pipeline, Counter, Enumerator, Lister, QueryDefaults, QuerySwitches, SetOperation, Visitor};
pub use reference_constraint::{Boundary, Direction, ReferenceConstraint};
pub use set::Set;
pub use signature::{SignatureChecker, SignatureDirectory};
pub use tags::{Phase, Tagger, TaggerContext, TaggerRunner, TagFlags, TagHolder, TagIndex};
pub use taggers::VectorBodyTagger;
pub use word::Word;
