//! VectorBody tagger — WEAK phase (§4.3, §8 scenario 3).
//!
//! A vector holder `H` stores three pointers: `begin`, `end` (one past the last used element),
//! `cap_end` (one past the last allocated slot). The body `P = begin` is a separate allocation;
//! `end - begin` is the used byte range, `cap_end - begin` the full capacity. Any outgoing edge
//! from `P` whose only in-bounds pointer word lies at an offset `>= end - begin` is stale
//! leftover capacity and gets tainted; the `H -> P` edge is favored since it is the
//! authoritative owning reference.
//!
//! Skips tagging when `P`'s first word is a known signature, to avoid misclassifying an object
//! that happens to carry a vtable at offset 0 as a vector body — a deliberate trade-off
//! preserved from the source rather than fixed (see the design ledger).

use crate::directory::AllocationIndex;
use crate::image::ContiguousImage;
use crate::signature::SignatureDirectory;
use crate::tags::{Phase, Tagger, TaggerContext, TagFlags, TagHolder};
use crate::word::Word;

pub struct VectorBodyTagger {
    tag: std::cell::Cell<Option<u32>>,
}

impl Default for VectorBodyTagger {
    fn default() -> Self {
        VectorBodyTagger { tag: std::cell::Cell::new(None) }
    }
}

impl VectorBodyTagger {
    pub fn new() -> Self {
        Self::default()
    }

    fn tag_index(&self, tags: &mut TagHolder) -> u32 {
        if let Some(t) = self.tag.get() {
            return t;
        }
        let t = tags.register_tag("VectorBody", TagFlags::SUPPORTS_FAVORED_REFERENCES);
        self.tag.set(Some(t));
        t
    }

    /// Considers `holder` as a potential vector holder whose first three words are
    /// `begin`/`end`/`cap_end`, and `body` (one of `holder`'s outgoing-edge targets) as the
    /// candidate vector body.
    pub fn consider<W: Word>(
        &self,
        ctx: &mut TaggerContext<'_, W>,
        tags: &mut TagHolder,
        signatures: &SignatureDirectory<W>,
        holder: AllocationIndex,
        body: AllocationIndex,
    ) {
        let holder_image = ContiguousImage::new(ctx.directory, ctx.map, holder);
        if holder_image.len() < 3 {
            return;
        }
        let body_allocation = ctx.directory.allocation_at(body);
        let begin = body_allocation.address();
        if holder_image.word_at(0) != Some(begin) {
            return;
        }
        let (end, cap_end) = match (holder_image.word_at(1), holder_image.word_at(2)) {
            (Some(e), Some(c)) => (e, c),
            _ => return,
        };
        if end.as_u64() < begin.as_u64() || cap_end.as_u64() < end.as_u64() {
            return;
        }
        let used_bytes = end.as_u64() - begin.as_u64();
        let total_bytes = cap_end.as_u64() - begin.as_u64();
        if total_bytes == 0 || total_bytes > body_allocation.size() || used_bytes > total_bytes {
            return;
        }

        let body_image = ContiguousImage::new(ctx.directory, ctx.map, body);
        if let Some(first) = body_image.word_at(0) {
            if signatures.is_signature(first) {
                return;
            }
        }

        let tag = self.tag_index(tags);
        if !tags.tag_allocation(body, tag) {
            return;
        }

        let used_words = (used_bytes as usize) / W::BYTES;
        for &target in ctx.graph.outgoing(body).to_vec().iter() {
            let target_address = ctx.directory.allocation_at(target).address();
            let referenced_from_used_prefix = (0..used_words.min(body_image.len()))
                .any(|w| body_image.word_at(w) == Some(target_address));
            if !referenced_from_used_prefix {
                ctx.tainted.set(ctx.graph, body, target, true);
            }
        }
        ctx.favored.set(ctx.graph, holder, body, true);
    }
}

impl<W: Word> Tagger<W> for VectorBodyTagger {
    fn tag_from_allocation(
        &self,
        _ctx: &mut TaggerContext<'_, W>,
        _tags: &mut TagHolder,
        _index: AllocationIndex,
        _phase: Phase,
        _is_unsigned: bool,
    ) {
        // VectorBody is identified from the holder's side (tag_from_referenced); a body
        // allocation cannot tell on its own that it is someone else's vector backing store.
    }

    fn tag_from_referenced(
        &self,
        ctx: &mut TaggerContext<'_, W>,
        tags: &mut TagHolder,
        index: AllocationIndex,
        phase: Phase,
    ) {
        if phase != Phase::WeakCheck {
            return;
        }
        let candidates: Vec<AllocationIndex> = ctx.graph.outgoing(index).to_vec();
        let signatures = SignatureDirectory::<W>::new();
        for body in candidates {
            self.consider(ctx, tags, &signatures, index, body);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{Allocation, Directory};
    use crate::edge_predicate::EdgePredicate;
    use crate::external::{RangeAttributes, VirtualAddressMap};
    use crate::graph::Graph;

    /// H stores {begin=P, end=P+0x20, cap_end=P+0x80}. P's first 0x20 bytes hold pointers to
    /// live L1, L2; bytes 0x20..0x80 hold a stale pointer to freed F.
    struct Scenario {
        h: u64,
        p: u64,
        l1: u64,
        l2: u64,
        f: u64,
    }

    impl VirtualAddressMap<u64> for Scenario {
        fn find_mapped_memory_image(&self, addr: u64) -> Option<&[u8]> {
            let bytes: Vec<u8> = if addr == self.h {
                let mut b = vec![0u8; 24];
                b[0..8].copy_from_slice(&self.p.to_le_bytes());
                b[8..16].copy_from_slice(&(self.p + 0x20).to_le_bytes());
                b[16..24].copy_from_slice(&(self.p + 0x80).to_le_bytes());
                b
            } else if addr == self.p {
                let mut b = vec![0u8; 0x80];
                b[0..8].copy_from_slice(&self.l1.to_le_bytes());
                b[8..16].copy_from_slice(&self.l2.to_le_bytes());
                b[0x20..0x28].copy_from_slice(&self.f.to_le_bytes());
                b
            } else {
                return None;
            };
            Some(Box::leak(bytes.into_boxed_slice()))
        }

        fn read_pointer(&self, addr: u64) -> Option<u64> {
            self.find_mapped_memory_image(addr)
                .filter(|b| b.len() >= 8)
                .map(|b| u64::from_le_bytes(b[..8].try_into().unwrap()))
        }

        fn visit_ranges(&self, _visitor: &mut dyn FnMut(RangeAttributes<u64>)) {}
    }

    #[test]
    fn tags_body_and_taints_only_stale_edge() {
        let scenario = Scenario { h: 0x1000, p: 0x2000, l1: 0x3000, l2: 0x3100, f: 0x3200 };
        let directory = Directory::new(
            vec![
                Allocation::new(scenario.h, 24, true),
                Allocation::new(scenario.p, 0x80, true),
                Allocation::new(scenario.l1, 8, true),
                Allocation::new(scenario.l2, 8, true),
                Allocation::new(scenario.f, 8, false),
            ],
            vec![false; 5],
        );
        let graph = Graph::build(&directory, &scenario, None);
        let mut tainted = EdgePredicate::new(graph.total_edges());
        let mut favored = EdgePredicate::new(graph.total_edges());
        let mut tags = TagHolder::new(5);
        let tagger = VectorBodyTagger::new();
        let signatures: SignatureDirectory<u64> = SignatureDirectory::new();

        {
            let mut ctx = crate::tags::TaggerContext {
                directory: &directory,
                graph: &graph,
                map: &scenario,
                tainted: &mut tainted,
                favored: &mut favored,
            };
            tagger.consider(&mut ctx, &mut tags, &signatures, 0, 1);
        }

        assert_eq!(tags.name_of(tags.get_tag_index(1)), "VectorBody");
        assert!(!tainted.for_edge(&graph, 1, 2), "P->L1 must not be tainted");
        assert!(!tainted.for_edge(&graph, 1, 3), "P->L2 must not be tainted");
        assert!(tainted.for_edge(&graph, 1, 4), "P->F must be tainted");
        let in_ix = graph.incoming_edge_index(0, 1);
        assert!(favored.for_incoming(in_ix), "H->P must be favored");
    }
}
