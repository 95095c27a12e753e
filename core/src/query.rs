//! Visitor trait and the Set-based Subcommand pipeline (component L, §4.7).

use crate::directory::{AllocationIndex, Directory};
use crate::error::QueryError;
use crate::extend::{extend, ExtensionMachine, ExtensionOptions, ExtensionVisitor};
use crate::reference_constraint::{Boundary, Direction, ReferenceConstraint};
use crate::set::Set;
use crate::signature::{SignatureChecker, SignatureDirectory};
use crate::tags::TagHolder;
use crate::word::Word;

/// Consumes allocations that survive the pipeline (§4.7's final step).
pub trait Visitor<W: Word> {
    fn visit(&mut self, directory: &Directory<W>, index: AllocationIndex);
}

/// Counts surviving allocations; produces no per-item output.
#[derive(Default)]
pub struct Counter {
    pub count: u64,
}

impl<W: Word> Visitor<W> for Counter {
    fn visit(&mut self, _directory: &Directory<W>, _index: AllocationIndex) {
        self.count += 1;
    }
}

/// Lists surviving allocation indices in visit order.
#[derive(Default)]
pub struct Lister {
    pub indices: Vec<AllocationIndex>,
}

impl<W: Word> Visitor<W> for Lister {
    fn visit(&mut self, _directory: &Directory<W>, index: AllocationIndex) {
        self.indices.push(index);
    }
}

/// Emits `(index, address)` pairs, matching the original's `Enumerator` one-line-per-allocation
/// report.
#[derive(Default)]
pub struct Enumerator<W: Word> {
    pub entries: Vec<(AllocationIndex, W)>,
}

impl<W: Word> Visitor<W> for Enumerator<W> {
    fn visit(&mut self, directory: &Directory<W>, index: AllocationIndex) {
        self.entries.push((index, directory.allocation_at(index).address()));
    }
}

struct VisitorAdapter<'a, W: Word> {
    visitor: &'a mut dyn Visitor<W>,
    directory: &'a Directory<W>,
}

impl<'a, W: Word> ExtensionVisitor<W> for VisitorAdapter<'a, W> {
    fn visit(&mut self, index: AllocationIndex) {
        self.visitor.visit(self.directory, index);
    }
}

/// `/setOperation` target: what to do with the per-query visited set once the pipeline has run
/// (§4.7 note: "callers own its lifetime so /setOperation can union or subtract it into a
/// persistent derived set afterwards").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOperation {
    Assign,
    Subtract,
}

/// Fully-validated query parameters (§6 query-time switches, §7 bulk pre-validation).
pub struct QuerySwitches<W: Word> {
    pub min_size: Option<u64>,
    pub max_size: Option<u64>,
    pub signature: SignatureChecker<W>,
    pub reference_constraints: Vec<ReferenceConstraint<W>>,
    pub geometric_sample_base: Option<u64>,
    pub extension: Option<ExtensionMachine<W>>,
    pub options: ExtensionOptions,
    pub set_operation: Option<SetOperation>,
}

impl<W: Word> QuerySwitches<W> {
    pub fn new(signature: SignatureChecker<W>) -> Self {
        QuerySwitches {
            min_size: None,
            max_size: None,
            signature,
            reference_constraints: Vec::new(),
            geometric_sample_base: None,
            extension: None,
            options: ExtensionOptions::default(),
            set_operation: None,
        }
    }

    pub fn validate_geometric_base(base: u64) -> Result<u64, QueryError> {
        if base < 2 {
            return Err(QueryError::BadGeometricBase(base));
        }
        Ok(base)
    }

    /// Bulk-validating textual switch parser (§6, §7): parses a flat `/switch value` token
    /// stream into a `QuerySwitches`, collecting every error instead of stopping at the first
    /// one, mirroring the base subcommand's `switchError |= ...` accumulation. `graph_available`
    /// gates `/min{in,out}going`-style switches, which need the Allocation Graph to mean anything.
    pub fn parse(
        args: &[&str],
        signatures: &SignatureDirectory<W>,
        tags: &TagHolder,
        defaults: &QueryDefaults,
        graph_available: bool,
    ) -> Result<Self, Vec<QueryError>> {
        let mut errors: Vec<QueryError> = Vec::new();

        let mut min_size: Option<u64> = None;
        let mut max_size: Option<u64> = None;
        let mut signature_text: Option<&str> = None;
        let mut allow_missing_signatures = defaults.allow_missing_signatures;
        let mut allow_missing_signatures_seen = false;
        let mut geometric_sample_base = defaults.geometric_sample_base;
        let mut geometric_seen = false;
        let mut set_operation: Option<SetOperation> = None;
        let mut set_operation_seen = false;
        let mut comment_extensions = false;
        let mut comment_extensions_seen = false;
        let mut skip_tainted_references = false;
        let mut skip_tainted_seen = false;
        let mut skip_unfavored_references = false;
        let mut skip_unfavored_seen = false;
        let mut rule_texts: Vec<&str> = Vec::new();
        let mut start_state_label: Option<&str> = None;
        let mut reference_specs: Vec<(&'static str, Boundary, Direction, bool, &str)> = Vec::new();

        let mut i = 0;
        while i < args.len() {
            let token = args[i];
            i += 1;
            let Some(name) = token.strip_prefix('/') else {
                errors.push(QueryError::UnknownSwitch(token.to_string()));
                continue;
            };

            macro_rules! value_or_continue {
                ($switch:literal) => {
                    match args.get(i) {
                        Some(&v) => {
                            i += 1;
                            v
                        }
                        None => {
                            errors.push(QueryError::MissingArgument($switch));
                            continue;
                        }
                    }
                };
            }

            match name {
                "size" => {
                    let v = value_or_continue!("size");
                    match parse_hex(v) {
                        Some(size) => {
                            min_size = Some(min_size.map_or(size, |m| m.max(size)));
                            max_size = Some(max_size.map_or(size, |m| m.min(size)));
                        }
                        None => errors.push(QueryError::BadArgument("size", v.to_string())),
                    }
                }
                "minsize" => {
                    let v = value_or_continue!("minsize");
                    match parse_hex(v) {
                        Some(size) => min_size = Some(min_size.map_or(size, |m| m.max(size))),
                        None => errors.push(QueryError::BadArgument("minsize", v.to_string())),
                    }
                }
                "maxsize" => {
                    let v = value_or_continue!("maxsize");
                    match parse_hex(v) {
                        Some(size) => max_size = Some(max_size.map_or(size, |m| m.min(size))),
                        None => errors.push(QueryError::BadArgument("maxsize", v.to_string())),
                    }
                }
                "signature" => {
                    signature_text = Some(value_or_continue!("signature"));
                }
                "geometricSample" => {
                    let v = value_or_continue!("geometricSample");
                    if geometric_seen {
                        errors.push(QueryError::DuplicateSwitch("geometricSample"));
                    }
                    geometric_seen = true;
                    match v.parse::<u64>() {
                        Ok(base) => match Self::validate_geometric_base(base) {
                            Ok(base) => geometric_sample_base = Some(base),
                            Err(err) => errors.push(err),
                        },
                        Err(_) => errors.push(QueryError::BadArgument("geometricSample", v.to_string())),
                    }
                }
                "setOperation" => {
                    let v = value_or_continue!("setOperation");
                    if set_operation_seen {
                        errors.push(QueryError::DuplicateSwitch("setOperation"));
                    }
                    set_operation_seen = true;
                    match v {
                        "assign" => set_operation = Some(SetOperation::Assign),
                        "subtract" => set_operation = Some(SetOperation::Subtract),
                        _ => errors.push(QueryError::BadSetOperation(v.to_string())),
                    }
                }
                "commentExtensions" => {
                    let v = value_or_continue!("commentExtensions");
                    if comment_extensions_seen {
                        errors.push(QueryError::DuplicateSwitch("commentExtensions"));
                    }
                    comment_extensions_seen = true;
                    match parse_bool(v) {
                        Some(b) => comment_extensions = b,
                        None => errors.push(QueryError::BadBoolean("commentExtensions", v.to_string())),
                    }
                }
                "skipTaintedReferences" => {
                    let v = value_or_continue!("skipTaintedReferences");
                    if skip_tainted_seen {
                        errors.push(QueryError::DuplicateSwitch("skipTaintedReferences"));
                    }
                    skip_tainted_seen = true;
                    match parse_bool(v) {
                        Some(b) => skip_tainted_references = b,
                        None => errors.push(QueryError::BadBoolean("skipTaintedReferences", v.to_string())),
                    }
                }
                "skipUnfavoredReferences" => {
                    let v = value_or_continue!("skipUnfavoredReferences");
                    if skip_unfavored_seen {
                        errors.push(QueryError::DuplicateSwitch("skipUnfavoredReferences"));
                    }
                    skip_unfavored_seen = true;
                    match parse_bool(v) {
                        Some(b) => skip_unfavored_references = b,
                        None => errors.push(QueryError::BadBoolean("skipUnfavoredReferences", v.to_string())),
                    }
                }
                "allowMissingSignatures" => {
                    let v = value_or_continue!("allowMissingSignatures");
                    if allow_missing_signatures_seen {
                        errors.push(QueryError::DuplicateSwitch("allowMissingSignatures"));
                    }
                    allow_missing_signatures_seen = true;
                    match parse_bool(v) {
                        Some(b) => allow_missing_signatures = b,
                        None => errors.push(QueryError::BadBoolean("allowMissingSignatures", v.to_string())),
                    }
                }
                "extend" => {
                    rule_texts.push(value_or_continue!("extend"));
                }
                "extendStartState" => {
                    start_state_label = Some(value_or_continue!("extendStartState"));
                }
                "minincoming" => reference_specs.push((
                    "minincoming",
                    Boundary::Min,
                    Direction::Incoming,
                    true,
                    value_or_continue!("minincoming"),
                )),
                "maxincoming" => reference_specs.push((
                    "maxincoming",
                    Boundary::Max,
                    Direction::Incoming,
                    true,
                    value_or_continue!("maxincoming"),
                )),
                "minoutgoing" => reference_specs.push((
                    "minoutgoing",
                    Boundary::Min,
                    Direction::Outgoing,
                    true,
                    value_or_continue!("minoutgoing"),
                )),
                "maxoutgoing" => reference_specs.push((
                    "maxoutgoing",
                    Boundary::Max,
                    Direction::Outgoing,
                    true,
                    value_or_continue!("maxoutgoing"),
                )),
                "minfreeoutgoing" => reference_specs.push((
                    "minfreeoutgoing",
                    Boundary::Min,
                    Direction::Outgoing,
                    false,
                    value_or_continue!("minfreeoutgoing"),
                )),
                other => errors.push(QueryError::UnknownSwitch(other.to_string())),
            }
        }

        if !reference_specs.is_empty() && !graph_available {
            errors.push(QueryError::GraphRequired);
        }

        let mut reference_constraints = Vec::new();
        for (switch, boundary, direction, wanted_used, value) in reference_specs {
            if !graph_available {
                continue;
            }
            let (signature_part, count_part) = match value.split_once('=') {
                Some((sig, count)) => (sig, count),
                None => ("", value),
            };
            let count = match count_part.parse::<u64>() {
                Ok(count) => count,
                Err(_) => {
                    errors.push(QueryError::BadArgument(switch, value.to_string()));
                    continue;
                }
            };
            match SignatureChecker::parse(signature_part, signatures, tags, allow_missing_signatures) {
                Ok(checker) => reference_constraints.push(ReferenceConstraint::new(
                    checker,
                    count,
                    boundary,
                    direction,
                    wanted_used,
                    skip_tainted_references,
                    skip_unfavored_references,
                )),
                Err(err) => errors.push(QueryError::Signature(err)),
            }
        }

        let extension = if rule_texts.is_empty() {
            None
        } else {
            match ExtensionMachine::compile(&rule_texts, signatures, tags, allow_missing_signatures) {
                Ok(machine) => {
                    if let Some(label) = start_state_label {
                        if let Err(err) = machine.resolve_label("/extendStartState", label) {
                            errors.push(QueryError::Extend(err));
                        }
                    }
                    Some(machine)
                }
                Err(err) => {
                    errors.push(QueryError::Extend(err));
                    None
                }
            }
        };

        let signature = match signature_text {
            Some(text) => match SignatureChecker::parse(text, signatures, tags, allow_missing_signatures) {
                Ok(checker) => checker,
                Err(err) => {
                    errors.push(QueryError::Signature(err));
                    SignatureChecker::accept_all()
                }
            },
            None => SignatureChecker::accept_all(),
        };

        if !errors.is_empty() {
            return Err(errors);
        }

        Ok(QuerySwitches {
            min_size,
            max_size,
            signature,
            reference_constraints,
            geometric_sample_base,
            extension,
            options: ExtensionOptions {
                skip_tainted_references,
                skip_unfavored_references,
                comment_extensions,
            },
            set_operation,
        })
    }

    fn size_ok(&self, size: u64) -> bool {
        if let Some(min) = self.min_size {
            if size < min {
                return false;
            }
        }
        if let Some(max) = self.max_size {
            if size > max {
                return false;
            }
        }
        true
    }

    fn geometric_sample_skip(&self, visit_number: u64) -> bool {
        match self.geometric_sample_base {
            None => false,
            Some(base) => {
                // Visits entries numbered 1, b, b^2, ... (1-indexed).
                let mut next = 1u64;
                loop {
                    if next == visit_number {
                        return false;
                    }
                    if next > visit_number {
                        return true;
                    }
                    next = match next.checked_mul(base) {
                        Some(v) => v,
                        None => return true,
                    };
                }
            }
        }
    }
}

/// User-overridable defaults merged in before a query's textual switches are parsed (§10). The
/// CLI layer loads this from a `--config <path>` JSON file; a query without one gets
/// `QueryDefaults::default()`, which reproduces the base subcommand's hardcoded defaults.
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct QueryDefaults {
    pub geometric_sample_base: Option<u64>,
    pub allow_missing_signatures: bool,
    pub max_anchor_chain_fanout: usize,
}

impl Default for QueryDefaults {
    fn default() -> Self {
        QueryDefaults { geometric_sample_base: None, allow_missing_signatures: false, max_anchor_chain_fanout: 10 }
    }
}

fn parse_hex(text: &str) -> Option<u64> {
    u64::from_str_radix(text.trim_start_matches("0x"), 16).ok()
}

fn parse_bool(text: &str) -> Option<bool> {
    match text {
        "on" => Some(true),
        "off" => Some(false),
        _ => None,
    }
}

/// Runs §4.7's pipeline over `iterator`, visiting survivors through `extension`/`visitor`.
/// Resets `visited` at the start (callers own its lifetime so `/setOperation` can union or
/// subtract it into a persistent derived set afterwards).
#[allow(clippy::too_many_arguments)]
pub fn run_pipeline<W: Word>(
    switches: &QuerySwitches<W>,
    directory: &Directory<W>,
    map: &dyn crate::external::VirtualAddressMap<W>,
    graph: &crate::graph::Graph<W>,
    tainted: &crate::edge_predicate::EdgePredicate,
    favored: &crate::edge_predicate::EdgePredicate,
    signatures: &SignatureDirectory<W>,
    tags: &TagHolder,
    is_leaked: &dyn Fn(AllocationIndex) -> bool,
    iterator: impl Iterator<Item = AllocationIndex>,
    visited: &mut Set,
    visitor: &mut dyn Visitor<W>,
) {
    visited.clear();
    let mut visit_number: u64 = 0;

    for index in iterator {
        let allocation = directory.allocation_at(index);
        if !switches.size_ok(allocation.size()) {
            continue;
        }

        let image = crate::image::ContiguousImage::new(directory, map, index);
        if !switches.signature.check(index, image.word_at(0), signatures, tags) {
            continue;
        }

        if switches
            .reference_constraints
            .iter()
            .any(|rc| !rc.check(directory, graph, map, tainted, favored, signatures, tags, index))
        {
            continue;
        }

        visit_number += 1;
        if switches.geometric_sample_skip(visit_number) {
            continue;
        }

        let mut adapter = VisitorAdapter { visitor, directory };
        match &switches.extension {
            Some(machine) => extend(
                machine,
                directory,
                map,
                graph,
                tainted,
                favored,
                signatures,
                tags,
                is_leaked,
                index,
                visited,
                &switches.options,
                &mut adapter,
            ),
            None => {
                if !visited.has(index) {
                    visited.add(index);
                    adapter.visit(index);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::Allocation;
    use crate::error::ExtendRuleError;
    use crate::external::{RangeAttributes, VirtualAddressMap};
    use crate::graph::Graph;
    use crate::iterators::SeedIterator;

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
    fn counter_counts_all_used_allocations() {
        let directory = Directory::new(
            vec![
                Allocation::new(0x1000u64, 16, true),
                Allocation::new(0x1010u64, 16, false),
                Allocation::new(0x1020u64, 16, true),
            ],
            vec![false; 3],
        );
        let map = NoEdges;
        let graph = Graph::build(&directory, &map, None);
        let tainted = crate::edge_predicate::EdgePredicate::new(graph.total_edges());
        let favored = crate::edge_predicate::EdgePredicate::new(graph.total_edges());
        let signatures: SignatureDirectory<u64> = SignatureDirectory::new();
        let tags = TagHolder::new(3);
        let switches = QuerySwitches::new(SignatureChecker::accept_all());

        let mut visited = Set::new(3);
        let mut counter = Counter::default();
        run_pipeline(
            &switches,
            &directory,
            &map,
            &graph,
            &tainted,
            &favored,
            &signatures,
            &tags,
            &|_| false,
            SeedIterator::used(&directory),
            &mut visited,
            &mut counter,
        );
        assert_eq!(counter.count, 2);
    }

    #[test]
    fn geometric_sample_visits_powers_of_base() {
        let switches = QuerySwitches::<u64>::new(SignatureChecker::accept_all());
        let mut with_base = QuerySwitches::<u64>::new(SignatureChecker::accept_all());
        with_base.geometric_sample_base = Some(2);
        assert!(!with_base.geometric_sample_skip(1));
        assert!(with_base.geometric_sample_skip(3));
        assert!(!with_base.geometric_sample_skip(4));
        assert!(!switches.geometric_sample_skip(5), "no base means every visit counts");
    }

    #[test]
    fn parse_accepts_size_and_geometric_sample_switches() {
        let signatures: SignatureDirectory<u64> = SignatureDirectory::new();
        let tags = TagHolder::new(1);
        let switches = QuerySwitches::parse(
            &["/minsize", "0x10", "/maxsize", "0x100", "/geometricSample", "2"],
            &signatures,
            &tags,
            &QueryDefaults::default(),
            true,
        )
        .unwrap();
        assert_eq!(switches.min_size, Some(0x10));
        assert_eq!(switches.max_size, Some(0x100));
        assert_eq!(switches.geometric_sample_base, Some(2));
    }

    #[test]
    fn parse_collects_every_error_instead_of_stopping_at_the_first() {
        let signatures: SignatureDirectory<u64> = SignatureDirectory::new();
        let tags = TagHolder::new(1);
        let errors = QuerySwitches::parse(
            &["/minsize", "not-hex", "/setOperation", "bogus", "/geometricSample", "1"],
            &signatures,
            &tags,
            &QueryDefaults::default(),
            true,
        )
        .unwrap_err();
        assert_eq!(errors.len(), 3, "{errors:?}");
    }

    #[test]
    fn parse_rejects_duplicate_geometric_sample_switch() {
        let signatures: SignatureDirectory<u64> = SignatureDirectory::new();
        let tags = TagHolder::new(1);
        let errors = QuerySwitches::parse(
            &["/geometricSample", "2", "/geometricSample", "3"],
            &signatures,
            &tags,
            &QueryDefaults::default(),
            true,
        )
        .unwrap_err();
        assert!(matches!(errors[0], QueryError::DuplicateSwitch("geometricSample")));
    }

    #[test]
    fn parse_requires_graph_for_reference_constraints() {
        let signatures: SignatureDirectory<u64> = SignatureDirectory::new();
        let tags = TagHolder::new(1);
        let errors = QuerySwitches::parse(&["/minincoming", "1"], &signatures, &tags, &QueryDefaults::default(), false)
            .unwrap_err();
        assert!(matches!(errors[0], QueryError::GraphRequired));
    }

    #[test]
    fn parse_builds_reference_constraints_when_graph_is_available() {
        let signatures: SignatureDirectory<u64> = SignatureDirectory::new();
        let tags = TagHolder::new(1);
        let switches =
            QuerySwitches::parse(&["/minincoming", "1", "/maxincoming", "1"], &signatures, &tags, &QueryDefaults::default(), true)
                .unwrap();
        assert_eq!(switches.reference_constraints.len(), 2);
    }

    #[test]
    fn parse_compiles_extend_rules_and_validates_extend_start_state() {
        let signatures: SignatureDirectory<u64> = SignatureDirectory::new();
        let tags = TagHolder::new(1);

        let switches = QuerySwitches::parse(
            &["/extend", "->=>lvl1", "/extendStartState", "lvl1"],
            &signatures,
            &tags,
            &QueryDefaults::default(),
            true,
        )
        .unwrap();
        assert!(switches.extension.unwrap().is_enabled());

        let errors = QuerySwitches::parse(
            &["/extend", "->=>lvl1", "/extendStartState", "nowhere"],
            &signatures,
            &tags,
            &QueryDefaults::default(),
            true,
        )
        .unwrap_err();
        assert!(matches!(errors[0], QueryError::Extend(ExtendRuleError::UnknownTargetState(_, _))));
    }

    #[test]
    fn parse_reports_unknown_switch_names() {
        let signatures: SignatureDirectory<u64> = SignatureDirectory::new();
        let tags = TagHolder::new(1);
        let errors = QuerySwitches::parse(&["/bogus", "1"], &signatures, &tags, &QueryDefaults::default(), true).unwrap_err();
        assert!(matches!(errors[0], QueryError::UnknownSwitch(ref s) if s == "bogus"));
    }
}
