//! Annotator framework (§4.5, wiring supplemented per SPEC_FULL §10).
//!
//! `/annotate` rules select annotation sequences whose constraints match an allocation's
//! state/signature/pattern; for each pointer-word offset, offset-specific annotators run
//! before wildcard ones, and the first whose [`Annotator::annotate`] advances past the current
//! offset wins.

use crate::directory::AllocationIndex;
use crate::image::ContiguousImage;
use crate::word::Word;

/// Decorates one pointer-word-sized slot of an allocation with a short label.
pub trait Annotator<W: Word> {
    fn name(&self) -> &str;

    /// Attempts to annotate the word at `offset` (in words). Returns `Some((label,
    /// next_offset))` on success, where `next_offset > offset`; `None` if this annotator does
    /// not apply here.
    fn annotate(&self, image: &ContiguousImage<'_, W>, offset: usize) -> Option<(String, usize)>;
}

struct Registration<W: Word> {
    /// `None` means "wildcard": applies at every offset not claimed by an offset-specific rule.
    offset: Option<usize>,
    annotator: Box<dyn Annotator<W>>,
}

/// Holds registered annotators and resolves, word by word, which one fires.
pub struct AnnotatorRegistry<W: Word> {
    registrations: Vec<Registration<W>>,
}

impl<W: Word> Default for AnnotatorRegistry<W> {
    fn default() -> Self {
        AnnotatorRegistry { registrations: Vec::new() }
    }
}

impl<W: Word> AnnotatorRegistry<W> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_at_offset(&mut self, offset: usize, annotator: Box<dyn Annotator<W>>) {
        self.registrations.push(Registration { offset: Some(offset), annotator });
    }

    pub fn register_wildcard(&mut self, annotator: Box<dyn Annotator<W>>) {
        self.registrations.push(Registration { offset: None, annotator });
    }

    /// Runs every offset from 0 to `image.len()`, producing `(offset, label)` pairs. At each
    /// offset, offset-specific registrations are tried before wildcards; the first match wins
    /// and the cursor jumps to its reported `next_offset`.
    pub fn annotate_all(&self, _index: AllocationIndex, image: &ContiguousImage<'_, W>) -> Vec<(usize, String)> {
        let mut results = Vec::new();
        let mut offset = 0usize;
        while offset < image.len() {
            let specific = self
                .registrations
                .iter()
                .filter(|r| r.offset == Some(offset))
                .find_map(|r| r.annotator.annotate(image, offset));
            let hit = specific.or_else(|| {
                self.registrations
                    .iter()
                    .filter(|r| r.offset.is_none())
                    .find_map(|r| r.annotator.annotate(image, offset))
            });
            match hit {
                Some((label, next)) => {
                    results.push((offset, label));
                    offset = next.max(offset + 1);
                }
                None => offset += 1,
            }
        }
        results
    }
}

/// Recognizes a short-string-optimization-style inline string: a length word followed by
/// inline character bytes, modeled as a wildcard annotator over any allocation.
pub struct InlineStringAnnotator;

impl<W: Word> Annotator<W> for InlineStringAnnotator {
    fn name(&self) -> &str {
        "InlineString"
    }

    fn annotate(&self, image: &ContiguousImage<'_, W>, offset: usize) -> Option<(String, usize)> {
        let len_word = image.word_at(offset)?;
        let len = len_word.as_u64();
        if len == 0 || len > 23 {
            return None;
        }
        Some((format!("inline string, len {len}"), offset + 1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{Allocation, Directory};
    use crate::external::{RangeAttributes, VirtualAddressMap};

    struct FixedWords(Vec<u64>);
    impl VirtualAddressMap<u64> for FixedWords {
        fn find_mapped_memory_image(&self, addr: u64) -> Option<&[u8]> {
            if addr != 0x1000 {
                return None;
            }
            let mut bytes = Vec::new();
            for w in &self.0 {
                bytes.extend_from_slice(&w.to_le_bytes());
            }
            Some(Box::leak(bytes.into_boxed_slice()))
        }
        fn read_pointer(&self, _addr: u64) -> Option<u64> {
            None
        }
        fn visit_ranges(&self, _visitor: &mut dyn FnMut(RangeAttributes<u64>)) {}
    }

    #[test]
    fn wildcard_fires_when_no_offset_specific_rule_matches() {
        let directory = Directory::new(vec![Allocation::new(0x1000u64, 16, true)], vec![false]);
        let map = FixedWords(vec![5, 0xdeadbeef]);
        let image = ContiguousImage::new(&directory, &map, 0);
        let mut registry: AnnotatorRegistry<u64> = AnnotatorRegistry::new();
        registry.register_wildcard(Box::new(InlineStringAnnotator));
        let hits = registry.annotate_all(0, &image);
        assert_eq!(hits, vec![(0, "inline string, len 5".to_string())]);
    }
}
