//! Contiguous Image (component C, §3).
//!
//! A uniform, word-sized view over one allocation's payload. Where the underlying map has no
//! bytes for part of the range (e.g. an all-zero page elided from the snapshot), this
//! materializes an in-memory zero-filled copy so callers read uniformly without caring which
//! parts were actually present in the core file.

use crate::directory::{AllocationIndex, Directory};
use crate::external::VirtualAddressMap;
use crate::word::Word;

pub struct ContiguousImage<'a, W: Word> {
    words: Vec<W>,
    index: AllocationIndex,
}

impl<'a, W: Word> ContiguousImage<'a, W> {
    /// Builds the image for `index`. Cheap to construct repeatedly; callers typically
    /// re-point an owned `ContiguousImage` at a new index per loop iteration rather than
    /// keep many alive, matching the "not owned by the Directory; cheap to re-point" note.
    pub fn new(
        directory: &Directory<W>,
        map: &dyn VirtualAddressMap<W>,
        index: AllocationIndex,
    ) -> Self {
        let allocation = directory.allocation_at(index);
        let size = allocation.size() as usize;
        let num_words = size / W::BYTES;
        let mut words = Vec::with_capacity(num_words);

        let mut offset: u64 = 0;
        while (offset as usize) < num_words * W::BYTES {
            let addr = W::from_u64(allocation.address().as_u64() + offset);
            match map.find_mapped_memory_image(addr) {
                Some(bytes) if bytes.len() >= W::BYTES => {
                    let remaining_words =
                        (bytes.len() / W::BYTES).min(num_words - words.len());
                    for i in 0..remaining_words {
                        words.push(read_word::<W>(&bytes[i * W::BYTES..]));
                    }
                    offset += (remaining_words * W::BYTES) as u64;
                }
                _ => {
                    // Unmapped (or a too-short fragment): treat the rest of the page as a
                    // single zero-filled word and move on one word at a time.
                    words.push(W::from_u64(0));
                    offset += W::BYTES as u64;
                }
            }
        }

        ContiguousImage { words, index }
    }

    #[inline]
    pub fn index(&self) -> AllocationIndex {
        self.index
    }

    #[inline]
    pub fn words(&self) -> &[W] {
        &self.words
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.words.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn word_at(&self, word_offset: usize) -> Option<W> {
        self.words.get(word_offset).copied()
    }
}

fn read_word<W: Word>(bytes: &[u8]) -> W {
    if W::BYTES == 4 {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(&bytes[..4]);
        W::from_u64(u32::from_le_bytes(buf) as u64)
    } else {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&bytes[..8]);
        W::from_u64(u64::from_le_bytes(buf))
    }
}
