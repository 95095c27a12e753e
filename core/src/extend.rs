//! Extended Visitor — set extension state machine (component K, §4.5).
//!
//! Compiles `/extend` rule text into a small state machine (base state 0 is the state every
//! seed member starts in), then walks it with an explicit stack of extension contexts so long
//! chains (e.g. linked lists) never grow the call stack.

use std::collections::HashMap;

use crate::directory::AllocationIndex;
use crate::edge_predicate::EdgePredicate;
use crate::error::ExtendRuleError;
use crate::graph::Graph;
use crate::image::ContiguousImage;
use crate::set::Set;
use crate::signature::{SignatureChecker, SignatureDirectory};
use crate::tags::TagHolder;
use crate::word::Word;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeDirection {
    /// `->`
    Outgoing,
    /// `~>`: outgoing, and the target must be leaked.
    OutgoingLeakedOnly,
    /// `<-`
    Incoming,
}

/// One compiled `/extend` rule. Constraint strings are pre-parsed into [`SignatureChecker`]s at
/// compile time (§4.4); `target_state` is a resolved state index, not a label.
pub struct Rule<W: Word> {
    pub member_constraint: SignatureChecker<W>,
    pub member_offset: Option<usize>,
    pub direction: EdgeDirection,
    pub extension_constraint: SignatureChecker<W>,
    pub extension_offset: Option<usize>,
    pub target_state: usize,
}

/// A compiled machine: state 0 is the base state every seed member enters at. `rules_by_state`
/// groups rules by the base state they apply in, preserving argument order within a bucket.
pub struct ExtensionMachine<W: Word> {
    rules_by_state: Vec<Vec<Rule<W>>>,
    /// State index -> label, kept for diagnostics (`state_labels[0]` is always `""`).
    pub state_labels: Vec<String>,
}

impl<W: Word> ExtensionMachine<W> {
    /// Parses and compiles a set of `/extend <rule>` argument strings (in the order given on
    /// the command line) into a validated machine. Rejects the configuration if no rule has
    /// base state 0 — the machine would never leave the base state.
    pub fn compile(
        rule_texts: &[&str],
        signatures: &SignatureDirectory<W>,
        tags: &TagHolder,
        allow_missing_signatures: bool,
    ) -> Result<Self, ExtendRuleError> {
        let mut state_labels: Vec<String> = vec![String::new()];
        let mut state_index: HashMap<String, usize> = HashMap::new();
        state_index.insert(String::new(), 0);

        struct Parsed<'a> {
            member_text: &'a str,
            member_offset: Option<usize>,
            direction: EdgeDirection,
            extension_text: &'a str,
            extension_offset: Option<usize>,
            base_label: String,
            target_label: String,
        }

        let mut parsed_rules: Vec<Parsed> = Vec::new();
        for &text in rule_texts {
            let (body, target_label) = match text.split_once("=>") {
                Some((b, t)) => (b, t.to_string()),
                None => (text, String::new()),
            };
            let (dir_str, dir) = if let Some(pos) = body.find("~>") {
                (pos, EdgeDirection::OutgoingLeakedOnly)
            } else if let Some(pos) = body.find("->") {
                (pos, EdgeDirection::Outgoing)
            } else if let Some(pos) = body.find("<-") {
                (pos, EdgeDirection::Incoming)
            } else {
                return Err(ExtendRuleError::MissingDirection(text.to_string()));
            };
            let marker_len = 2;
            let member_part = &body[..dir_str];
            let extension_part = &body[dir_str + marker_len..];

            let (member_text, member_offset) = split_offset(member_part, text)?;
            let (extension_text, extension_offset) = split_offset(extension_part, text)?;

            // The base state is whichever previously-declared label the member constraint
            // names; an unrecognized name is just a plain constraint in the base state.
            let base_label = if state_index.contains_key(member_text) {
                member_text.to_string()
            } else {
                String::new()
            };

            parsed_rules.push(Parsed {
                member_text,
                member_offset,
                direction: dir,
                extension_text,
                extension_offset,
                base_label,
                target_label,
            });
        }

        for rule in &parsed_rules {
            if !state_index.contains_key(&rule.target_label) {
                state_index.insert(rule.target_label.clone(), state_labels.len());
                state_labels.push(rule.target_label.clone());
            }
        }

        let mut rules_by_state: Vec<Vec<Rule<W>>> = (0..state_labels.len()).map(|_| Vec::new()).collect();
        let mut seen_base_for_state: HashMap<usize, Vec<&str>> = HashMap::new();
        for rule in &parsed_rules {
            let base_state = state_index[&rule.base_label];
            let target_state = state_index[&rule.target_label];

            let bucket_names = seen_base_for_state.entry(base_state).or_default();
            if bucket_names.contains(&rule.member_text) && !rule.member_text.is_empty() {
                return Err(ExtendRuleError::DuplicateBaseState(
                    rule.member_text.to_string(),
                    state_labels[base_state].clone(),
                ));
            }
            bucket_names.push(rule.member_text);

            let member_constraint =
                SignatureChecker::parse(rule.member_text, signatures, tags, allow_missing_signatures)
                    .map_err(|_| ExtendRuleError::BadOffset(rule.member_text.to_string()))?;
            let extension_constraint =
                SignatureChecker::parse(rule.extension_text, signatures, tags, allow_missing_signatures)
                    .map_err(|_| ExtendRuleError::BadOffset(rule.extension_text.to_string()))?;

            rules_by_state[base_state].push(Rule {
                member_constraint,
                member_offset: rule.member_offset,
                direction: rule.direction,
                extension_constraint,
                extension_offset: rule.extension_offset,
                target_state,
            });
        }

        if rules_by_state[0].is_empty() && !rule_texts.is_empty() {
            return Err(ExtendRuleError::UnreachableBaseState);
        }

        Ok(ExtensionMachine { rules_by_state, state_labels })
    }

    pub fn is_enabled(&self) -> bool {
        !self.rules_by_state.is_empty() && self.rules_by_state.iter().any(|b| !b.is_empty())
    }

    /// Resolves a state label declared by some rule's `=>label` target to its state index, for
    /// switches that reference a state by name rather than compiling it themselves (e.g.
    /// `/extendStartState`). Errs if no rule in this machine ever used `label` as a target.
    pub fn resolve_label(&self, switch: &'static str, label: &str) -> Result<usize, ExtendRuleError> {
        self.state_labels
            .iter()
            .position(|l| l == label)
            .ok_or_else(|| ExtendRuleError::UnknownTargetState(switch.to_string(), label.to_string()))
    }
}

fn split_offset<'a>(text: &'a str, whole_rule: &str) -> Result<(&'a str, Option<usize>), ExtendRuleError> {
    match text.rsplit_once('@') {
        Some((name, hex)) => {
            let offset = usize::from_str_radix(hex, 16)
                .map_err(|_| ExtendRuleError::BadOffset(whole_rule.to_string()))?;
            Ok((name, Some(offset)))
        }
        None => Ok((text, None)),
    }
}

/// One frame of the explicit traversal stack: the member currently being extended, the state
/// it's in, the index of the next rule to try in that state's bucket, and how far we've already
/// enumerated that rule's candidates.
struct Frame {
    member: AllocationIndex,
    state: usize,
    rule_index: usize,
    candidate_index: usize,
}

pub trait ExtensionVisitor<W: Word> {
    fn visit(&mut self, index: AllocationIndex);
    fn comment(&mut self, _message: &str) {}
}

pub struct ExtensionOptions {
    pub skip_tainted_references: bool,
    pub skip_unfavored_references: bool,
    pub comment_extensions: bool,
}

impl Default for ExtensionOptions {
    fn default() -> Self {
        ExtensionOptions { skip_tainted_references: false, skip_unfavored_references: false, comment_extensions: false }
    }
}

/// Runs the extension for one seed member, visiting every reachable allocation at most once.
#[allow(clippy::too_many_arguments)]
pub fn extend<W: Word>(
    machine: &ExtensionMachine<W>,
    directory: &crate::directory::Directory<W>,
    map: &dyn crate::external::VirtualAddressMap<W>,
    graph: &Graph<W>,
    tainted: &EdgePredicate,
    favored: &EdgePredicate,
    signatures: &SignatureDirectory<W>,
    tags: &TagHolder,
    is_leaked: &dyn Fn(AllocationIndex) -> bool,
    seed: AllocationIndex,
    visited: &mut Set,
    options: &ExtensionOptions,
    visitor: &mut dyn ExtensionVisitor<W>,
) {
    if !machine.is_enabled() {
        visitor.visit(seed);
        return;
    }
    if visited.has(seed) {
        if options.comment_extensions {
            visitor.comment("already visited");
        }
        return;
    }
    visited.add(seed);
    visitor.visit(seed);

    let mut stack = vec![Frame { member: seed, state: 0, rule_index: 0, candidate_index: 0 }];

    while let Some(frame) = stack.last_mut() {
        let bucket = &machine.rules_by_state[frame.state];
        if frame.rule_index >= bucket.len() {
            stack.pop();
            continue;
        }
        let rule = &bucket[frame.rule_index];
        let member_image = ContiguousImage::new(directory, map, frame.member);
        let member_first_word = member_image.word_at(0);
        if !rule.member_constraint.check(frame.member, member_first_word, signatures, tags) {
            frame.rule_index += 1;
            frame.candidate_index = 0;
            continue;
        }

        // An offset-in-member only pins a single candidate address when the reference is
        // outgoing (the word at that offset is dereferenced directly); an incoming reference
        // still has to walk every incoming edge, since there's no way to read "what points at
        // offset X of me" other than checking each candidate below.
        let candidates: Vec<AllocationIndex> = match (rule.member_offset, rule.direction) {
            (Some(offset), EdgeDirection::Outgoing | EdgeDirection::OutgoingLeakedOnly) => member_image
                .word_at(offset)
                .map(|addr| graph.target_allocation_index(directory, frame.member, addr))
                .filter(|&t| (t as usize) < directory.num_allocations())
                .into_iter()
                .collect(),
            (_, EdgeDirection::Outgoing | EdgeDirection::OutgoingLeakedOnly) => graph.outgoing(frame.member).to_vec(),
            (_, EdgeDirection::Incoming) => graph.incoming(frame.member).to_vec(),
        };

        let member_address = directory.allocation_at(frame.member).address();
        let member_size = directory.allocation_at(frame.member).size();

        let mut found = None;
        let mut next_candidate_index = frame.candidate_index;
        while next_candidate_index < candidates.len() {
            let candidate = candidates[next_candidate_index];
            next_candidate_index += 1;

            if rule.direction == EdgeDirection::OutgoingLeakedOnly && !is_leaked(candidate) {
                continue;
            }

            // Free allocations are never valid extension targets (mirrors the ground-truth
            // `!candidateAllocation->IsUsed()` guard).
            let candidate_allocation = directory.allocation_at(candidate);
            let candidate_image = ContiguousImage::new(directory, map, candidate);
            let candidate_first_word = candidate_image.word_at(0);
            if !candidate_allocation.used()
                || !rule.extension_constraint.check(candidate, candidate_first_word, signatures, tags)
            {
                continue;
            }

            if let Some(extension_offset) = rule.extension_offset {
                if candidate_image.word_at(extension_offset).is_none() {
                    continue;
                }
                let candidate_address = candidate_allocation.address();
                let extension_target =
                    W::from_u64(candidate_address.as_u64() + (extension_offset * W::BYTES) as u64);
                let matches = match rule.direction {
                    EdgeDirection::Outgoing | EdgeDirection::OutgoingLeakedOnly => match rule.member_offset {
                        // Already pinned to a single candidate by dereferencing this exact
                        // offset; re-derive the address and require it lands exactly on the
                        // extension offset (the original's inline check at resolution time).
                        Some(member_offset) => member_image
                            .word_at(member_offset)
                            .is_some_and(|w| w.as_u64() == extension_target.as_u64()),
                        None => member_image.words().iter().any(|&w| w.as_u64() == extension_target.as_u64()),
                    },
                    EdgeDirection::Incoming => match candidate_image.word_at(extension_offset) {
                        Some(pointer_in_candidate) => match rule.member_offset {
                            Some(member_offset) => {
                                let expected =
                                    W::from_u64(member_address.as_u64() + (member_offset * W::BYTES) as u64);
                                pointer_in_candidate.as_u64() == expected.as_u64()
                            }
                            None => {
                                let a = pointer_in_candidate.as_u64();
                                a >= member_address.as_u64() && a < member_address.as_u64() + member_size
                            }
                        },
                        None => false,
                    },
                };
                if !matches {
                    continue;
                }
            } else if let (Some(member_offset), EdgeDirection::Incoming) = (rule.member_offset, rule.direction) {
                // No offset-in-extension: fall back to scanning the candidate for an aligned
                // pointer back to the exact word the member rule named.
                let expected = W::from_u64(member_address.as_u64() + (member_offset * W::BYTES) as u64);
                if !candidate_image.words().iter().any(|&w| w.as_u64() == expected.as_u64()) {
                    continue;
                }
            }

            if options.skip_tainted_references {
                let edge = match rule.direction {
                    EdgeDirection::Incoming => tainted.for_incoming(graph.incoming_edge_index(candidate, frame.member)),
                    _ => tainted.for_outgoing(graph.outgoing_edge_index(frame.member, candidate)),
                };
                if edge {
                    continue;
                }
            }
            if options.skip_unfavored_references {
                let edge = match rule.direction {
                    EdgeDirection::Incoming => favored.for_incoming(graph.incoming_edge_index(candidate, frame.member)),
                    _ => favored.for_outgoing(graph.outgoing_edge_index(frame.member, candidate)),
                };
                if !edge {
                    continue;
                }
            }

            found = Some(candidate);
            break;
        }

        frame.candidate_index = next_candidate_index;

        match found {
            Some(candidate) if !visited.has(candidate) => {
                visited.add(candidate);
                visitor.visit(candidate);
                let new_state = rule.target_state;
                stack.push(Frame { member: candidate, state: new_state, rule_index: 0, candidate_index: 0 });
            }
            Some(_) => {
                // Already visited: loop back to try the same rule again for any remaining
                // candidates rather than pushing a frame (avoids re-visiting).
            }
            None => {
                frame.rule_index += 1;
                frame.candidate_index = 0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{Allocation, Directory};
    use crate::external::{RangeAttributes, VirtualAddressMap};

    struct Chain {
        s: u64,
        a: u64,
        b: u64,
        c: u64,
    }
    impl VirtualAddressMap<u64> for Chain {
        fn find_mapped_memory_image(&self, addr: u64) -> Option<&[u8]> {
            let next = if addr == self.s {
                self.a
            } else if addr == self.a {
                self.b
            } else {
                return None;
            };
            let _ = self.c;
            Some(Box::leak(next.to_le_bytes().to_vec().into_boxed_slice()))
        }
        fn read_pointer(&self, addr: u64) -> Option<u64> {
            self.find_mapped_memory_image(addr).map(|b| u64::from_le_bytes(b[..8].try_into().unwrap()))
        }
        fn visit_ranges(&self, _visitor: &mut dyn FnMut(RangeAttributes<u64>)) {}
    }

    struct RecordingVisitor(Vec<AllocationIndex>);
    impl<W: Word> ExtensionVisitor<W> for RecordingVisitor {
        fn visit(&mut self, index: AllocationIndex) {
            self.0.push(index);
        }
    }

    #[test]
    fn extension_rule_visits_s_then_a_and_stops_at_lvl1() {
        // S -> A -> B (B is also pointed at by A; C is unused in this 2-hop scenario).
        let chain = Chain { s: 0x9000, a: 0x1000, b: 0x1010, c: 0x1020 };
        let directory = Directory::new(
            vec![
                Allocation::new(chain.s, 8, true),
                Allocation::new(chain.a, 8, true),
                Allocation::new(chain.b, 8, true),
            ],
            vec![false; 3],
        );
        let graph = Graph::build(&directory, &chain, None);
        let tainted = EdgePredicate::new(graph.total_edges());
        let favored = EdgePredicate::new(graph.total_edges());
        let signatures: SignatureDirectory<u64> = SignatureDirectory::new();
        let tags = TagHolder::new(3);

        let machine = ExtensionMachine::compile(&["->=>lvl1"], &signatures, &tags, true).unwrap();
        assert!(machine.is_enabled());

        let mut visited = Set::new(3);
        let mut visitor = RecordingVisitor(Vec::new());
        let options = ExtensionOptions::default();
        extend(
            &machine,
            &directory,
            &chain,
            &graph,
            &tainted,
            &favored,
            &signatures,
            &tags,
            &|_i| false,
            0,
            &mut visited,
            &options,
            &mut visitor,
        );

        assert_eq!(visitor.0, vec![0, 1], "B must not be visited: lvl1 has no rules");
    }

    #[test]
    fn missing_direction_marker_is_an_error() {
        let signatures: SignatureDirectory<u64> = SignatureDirectory::new();
        let tags = TagHolder::new(1);
        assert!(ExtensionMachine::compile(&["foo bar"], &signatures, &tags, true).is_err());
    }

    #[test]
    fn resolve_label_finds_declared_targets_and_rejects_unknown_ones() {
        let signatures: SignatureDirectory<u64> = SignatureDirectory::new();
        let tags = TagHolder::new(1);
        let machine = ExtensionMachine::compile(&["->=>lvl1"], &signatures, &tags, true).unwrap();

        assert_eq!(machine.resolve_label("/extendStartState", "lvl1"), Ok(1));
        assert_eq!(machine.resolve_label("/extendStartState", ""), Ok(0));
        assert_eq!(
            machine.resolve_label("/extendStartState", "nope"),
            Err(ExtendRuleError::UnknownTargetState("/extendStartState".to_string(), "nope".to_string()))
        );
    }
}
