//! Upstream trait contracts (§6). These are implemented by whatever extracts allocations from
//! a concrete core-file format and a concrete allocator layout; the core only ever depends on
//! these traits, never on a specific format.

use crate::directory::AllocationIndex;
use crate::word::Word;

/// Read-only, random-access view of a process's virtual memory.
///
/// Implementors typically back this with a memory-mapped core file. Reads never fail loudly:
/// missing bytes (unmapped ranges, truncated cores) are reported through the return value,
/// never an exception or panic, matching the "exceptions → Result/Option" redesign note.
pub trait VirtualAddressMap<W: Word> {
    /// Largest contiguous mapped image starting at `addr`, or `None` if `addr` is unmapped.
    fn find_mapped_memory_image(&self, addr: W) -> Option<&[u8]>;

    /// Read one pointer-sized word at `addr`. `None` if any byte of it is unmapped.
    fn read_pointer(&self, addr: W) -> Option<W>;

    /// Iterate over the mapped ranges and their attributes.
    fn visit_ranges(&self, visitor: &mut dyn FnMut(RangeAttributes<W>));
}

/// Attributes of one contiguous mapped range, as reported by [`VirtualAddressMap::visit_ranges`].
#[derive(Debug, Clone, Copy)]
pub struct RangeAttributes<W: Word> {
    pub base: W,
    pub limit: W,
    pub readable: bool,
    pub writable: bool,
    pub executable: bool,
    pub mapped: bool,
    pub truncated: bool,
}

/// One thread's register file, as captured in the image.
#[derive(Debug, Clone)]
pub struct ThreadRegisters<W: Word> {
    pub thread_num: usize,
    pub stack_pointer: W,
    pub registers: Vec<W>,
}

/// Enumerable set of threads and their registers.
pub trait ThreadMap<W: Word> {
    fn threads(&self) -> &[ThreadRegisters<W>];
    fn register_name(&self, register_num: usize) -> &str;
}

/// Kind of stack region, as reported by [`StackRegistry::visit_stacks`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackKind {
    Main,
    Secondary,
    Guard,
}

/// Callback-enumeration of thread stack regions.
pub trait StackRegistry<W: Word> {
    /// Visits every known stack region. The callback returns `false` to stop early.
    fn visit_stacks(
        &self,
        visitor: &mut dyn FnMut(W, W, StackKind, W, W, usize) -> bool,
    );

    /// Visits the single stack region containing `addr`, if any.
    fn visit_stack(&self, addr: W, visitor: &mut dyn FnMut(W, W, StackKind, W, W, usize));
}

/// Resolves compressed / tagged pointers (e.g. V8-style compressed heap pointers) to an
/// allocation index when the Directory's plain `index_of` comes up empty.
pub trait ObscuredReferenceChecker<W: Word> {
    fn index_of(&self, word: W) -> Option<AllocationIndex>;
}

/// Lets an allocation be anchored purely by its own contents (e.g. a well-known header), apart
/// from being reachable from static/stack/register roots.
pub trait ExternalAnchorPointChecker<W: Word> {
    /// Returns a static reason string if `index`'s contents imply externally-imposed liveness.
    fn external_reason(&self, index: AllocationIndex, image: &[W]) -> Option<&'static str>;
}
