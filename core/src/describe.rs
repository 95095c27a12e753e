//! Pattern describer seam (supplemented feature, SPEC_FULL §10).
//!
//! Once a tagger assigns a pattern tag, a registered [`Describer`] renders a short structural
//! explanation for the `describe`/`explain` visitors (§4.7). Untagged allocations, and tagged
//! allocations with no registered describer, fall back to a generic one-line summary instead of
//! producing nothing.

use crate::directory::{AllocationIndex, Directory};
use crate::tags::TagHolder;
use crate::word::Word;

/// Renders a short structural explanation for allocations carrying a particular tag.
pub trait Describer<W: Word> {
    /// The tag name this describer handles (must match a name passed to
    /// [`TagHolder::register_tag`]).
    fn tag_name(&self) -> &str;

    /// One-line description of `index`, given its raw contents.
    fn describe(&self, directory: &Directory<W>, tags: &TagHolder, index: AllocationIndex) -> String;
}

/// Looks describers up by tag index, falling back to a generic summary.
pub struct DescriberRegistry<W: Word> {
    by_tag_name: std::collections::HashMap<String, Box<dyn Describer<W>>>,
}

impl<W: Word> Default for DescriberRegistry<W> {
    fn default() -> Self {
        DescriberRegistry { by_tag_name: std::collections::HashMap::new() }
    }
}

impl<W: Word> DescriberRegistry<W> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, describer: Box<dyn Describer<W>>) {
        self.by_tag_name.insert(describer.tag_name().to_string(), describer);
    }

    pub fn describe(&self, directory: &Directory<W>, tags: &TagHolder, index: AllocationIndex) -> String {
        let tag = tags.get_tag_index(index);
        if tag == 0 {
            return generic_summary(directory, index);
        }
        let name = tags.name_of(tag);
        match self.by_tag_name.get(name) {
            Some(describer) => describer.describe(directory, tags, index),
            None => generic_summary(directory, index),
        }
    }
}

fn generic_summary<W: Word>(directory: &Directory<W>, index: AllocationIndex) -> String {
    let allocation = directory.allocation_at(index);
    format!(
        "allocation {index} at {:#x}, {} bytes, {}",
        allocation.address().as_u64(),
        allocation.size(),
        if allocation.used() { "used" } else { "free" }
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::Allocation;
    use crate::tags::TagFlags;

    struct VectorBodyDescriber;
    impl Describer<u64> for VectorBodyDescriber {
        fn tag_name(&self) -> &str {
            "VectorBody"
        }
        fn describe(&self, directory: &Directory<u64>, _tags: &TagHolder, index: AllocationIndex) -> String {
            format!("vector body, {} bytes", directory.allocation_at(index).size())
        }
    }

    #[test]
    fn falls_back_to_generic_summary_when_untagged() {
        let directory = Directory::new(vec![Allocation::new(0x1000u64, 16, true)], vec![false]);
        let tags = TagHolder::new(1);
        let registry: DescriberRegistry<u64> = DescriberRegistry::new();
        assert!(registry.describe(&directory, &tags, 0).contains("0x1000"));
    }

    #[test]
    fn dispatches_to_registered_describer_by_tag_name() {
        let directory = Directory::new(vec![Allocation::new(0x1000u64, 16, true)], vec![false]);
        let mut tags = TagHolder::new(1);
        let tag = tags.register_tag("VectorBody", TagFlags::empty());
        tags.tag_allocation(0, tag);
        let mut registry: DescriberRegistry<u64> = DescriberRegistry::new();
        registry.register(Box::new(VectorBodyDescriber));
        assert_eq!(registry.describe(&directory, &tags, 0), "vector body, 16 bytes");
    }
}
