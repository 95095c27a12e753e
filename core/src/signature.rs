//! Signature / Anchor / Type Directories and Signature Checker (components D, J, §3, §4.4).

use std::collections::{HashMap, HashSet};

use crate::directory::AllocationIndex;
use crate::error::SignatureError;
use crate::tags::TagHolder;
use crate::word::Word;

/// Name ↔ signature-word map. A name may resolve to several words (e.g. a vtable defined in
/// more than one loaded module), matching the source's "potentially multiple signatures for a
/// given name" note.
pub struct SignatureDirectory<W: Word> {
    by_name: HashMap<String, HashSet<W>>,
    names_by_word: HashMap<W, String>,
}

impl<W: Word> Default for SignatureDirectory<W> {
    fn default() -> Self {
        SignatureDirectory {
            by_name: HashMap::new(),
            names_by_word: HashMap::new(),
        }
    }
}

impl<W: Word> SignatureDirectory<W> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &str, word: W) {
        self.by_name.entry(name.to_string()).or_default().insert(word);
        self.names_by_word.insert(word, name.to_string());
    }

    pub fn signatures_of(&self, name: &str) -> Option<&HashSet<W>> {
        self.by_name.get(name)
    }

    pub fn is_signature(&self, word: W) -> bool {
        self.names_by_word.contains_key(&word)
    }

    pub fn name_of(&self, word: W) -> Option<&str> {
        self.names_by_word.get(&word).map(String::as_str)
    }
}

/// A parsed `/signature`-style textual constraint (§4.4).
enum Constraint<W: Word> {
    AcceptAll,
    Unsigned,
    ExactWord(W),
    NamedSignature(HashSet<W>),
    NamedPattern(HashSet<u32>),
}

/// Evaluates a signature/pattern string against an allocation's first word and/or tag index.
/// Parsing happens once per query; `check` is then O(1).
pub struct SignatureChecker<W: Word> {
    constraint: Constraint<W>,
}

impl<W: Word> SignatureChecker<W> {
    pub fn parse(
        text: &str,
        signatures: &SignatureDirectory<W>,
        tags: &TagHolder,
        allow_missing: bool,
    ) -> Result<Self, SignatureError> {
        let constraint = if text.is_empty() {
            Constraint::AcceptAll
        } else if text == "-" {
            Constraint::Unsigned
        } else if let Some(pattern_name) = text.strip_prefix('%') {
            match tags.tag_indices(pattern_name) {
                Some(set) => Constraint::NamedPattern(set.clone()),
                None if allow_missing => Constraint::NamedPattern(HashSet::new()),
                None => return Err(SignatureError::UnknownPattern(pattern_name.to_string())),
            }
        } else if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
            let v = u64::from_str_radix(hex, 16)
                .map_err(|_| SignatureError::BadHexAddress(text.to_string()))?;
            Constraint::ExactWord(W::from_u64(v))
        } else if looks_like_bare_hex(text) {
            let v = u64::from_str_radix(text, 16)
                .map_err(|_| SignatureError::BadHexAddress(text.to_string()))?;
            Constraint::ExactWord(W::from_u64(v))
        } else {
            match signatures.signatures_of(text) {
                Some(set) => Constraint::NamedSignature(set.clone()),
                None if allow_missing => Constraint::NamedSignature(HashSet::new()),
                None => return Err(SignatureError::UnknownSignature(text.to_string())),
            }
        };
        Ok(SignatureChecker { constraint })
    }

    pub fn accept_all() -> Self {
        SignatureChecker { constraint: Constraint::AcceptAll }
    }

    /// `first_word` is the allocation's first pointer-aligned word, if it has one (zero-sized
    /// allocations have none and only match `AcceptAll`/`Unsigned`).
    pub fn check(
        &self,
        index: AllocationIndex,
        first_word: Option<W>,
        signatures: &SignatureDirectory<W>,
        tags: &TagHolder,
    ) -> bool {
        match &self.constraint {
            Constraint::AcceptAll => true,
            Constraint::Unsigned => match first_word {
                Some(w) => !signatures.is_signature(w),
                None => true,
            },
            Constraint::ExactWord(expected) => first_word == Some(*expected),
            Constraint::NamedSignature(set) => match first_word {
                Some(w) => set.contains(&w),
                None => false,
            },
            Constraint::NamedPattern(set) => set.contains(&tags.get_tag_index(index)),
        }
    }
}

/// A bare hex constraint has no `0x` prefix in the original grammar but is still meant as an
/// address when it parses as hex and isn't a plausible signature *name* — names in this domain
/// are conventionally mangled C++ identifiers, which always contain a non-hex-digit character.
/// Anything that is purely hex digits is therefore treated as an address.
fn looks_like_bare_hex(text: &str) -> bool {
    !text.is_empty() && text.chars().all(|c| c.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_constraint_accepts_everything() {
        let sigs: SignatureDirectory<u64> = SignatureDirectory::new();
        let tags = TagHolder::new(1);
        let checker = SignatureChecker::parse("", &sigs, &tags, false).unwrap();
        assert!(checker.check(0, Some(0xdead), &sigs, &tags));
        assert!(checker.check(0, None, &sigs, &tags));
    }

    #[test]
    fn unsigned_constraint() {
        let mut sigs: SignatureDirectory<u64> = SignatureDirectory::new();
        sigs.register("Foo::vtable", 0x4000);
        let tags = TagHolder::new(1);
        let checker = SignatureChecker::parse("-", &sigs, &tags, false).unwrap();
        assert!(checker.check(0, Some(0x9999), &sigs, &tags));
        assert!(!checker.check(0, Some(0x4000), &sigs, &tags));
    }

    #[test]
    fn named_signature_constraint() {
        let mut sigs: SignatureDirectory<u64> = SignatureDirectory::new();
        sigs.register("Foo::vtable", 0x4000);
        let tags = TagHolder::new(1);
        let checker = SignatureChecker::parse("Foo::vtable", &sigs, &tags, false).unwrap();
        assert!(checker.check(0, Some(0x4000), &sigs, &tags));
        assert!(!checker.check(0, Some(0x4001), &sigs, &tags));
    }

    #[test]
    fn unknown_name_is_an_error_unless_allowed() {
        let sigs: SignatureDirectory<u64> = SignatureDirectory::new();
        let tags = TagHolder::new(1);
        assert!(SignatureChecker::parse("Bogus::vtable", &sigs, &tags, false).is_err());
        assert!(SignatureChecker::parse("Bogus::vtable", &sigs, &tags, true).is_ok());
    }

    #[test]
    fn hex_address_constraint() {
        let sigs: SignatureDirectory<u64> = SignatureDirectory::new();
        let tags = TagHolder::new(1);
        let checker = SignatureChecker::parse("0x1234", &sigs, &tags, false).unwrap();
        assert!(checker.check(0, Some(0x1234), &sigs, &tags));
        assert!(!checker.check(0, Some(0x1235), &sigs, &tags));
    }
}
