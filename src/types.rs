use crate::heap::Heap;

// ------------------------------------------------------
// Layout constants
// ------------------------------------------------------

// Allocation granule. Every address handed out is a multiple of this, and
// the in-place free-region header occupies exactly one granule.
pub const ALIGNMENT_LOG: u32 = 3;
pub const ALIGNMENT: u32 = 1 << ALIGNMENT_LOG;

// Terminator for the compressed `next_offset` links. Never a legal offset:
// the logical offset space is validated to stay well below it.
pub const END_OF_LIST: u32 = u32::MAX;

// Capacity of the segment table in segmented mode.
pub const MAX_SEGMENT_COUNT: usize = 64;

// Hard ceiling on the logical offset space, so that offset arithmetic
// (`offset + size`) cannot wrap and the sentinel stays distinct.
pub const MAX_OFFSET_SPACE: usize = 1 << 31;

// ------------------------------------------------------
// Backend and GC types
// ------------------------------------------------------

/// Storage strategy behind a heap, fixed at `init`.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum HeapBackend {
    /// One fixed-size reserved area.
    Static,
    /// Up to `segment_count` equal segments acquired on demand.
    Segmented,
    /// A fixed area with system-allocator-style accounting.
    DynamicEmul,
    /// Pass-through to the platform general-purpose allocator.
    System,
}

/// How aggressively a reclamation callback should collect.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum GcSeverity {
    Low,
    High,
}

/// Reclamation hook invoked between allocation attempts under memory
/// pressure. Receives the heap (so it can return blocks via `free`) and the
/// opaque context registered with it. Must not allocate from the heap.
pub type GcCallback = fn(heap: &mut Heap, context: *mut (), severity: GcSeverity);

// ------------------------------------------------------
// Helpers
// ------------------------------------------------------

/// Round `size` up to the next multiple of `align` (a power of two).
#[inline]
pub fn align_up(size: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (size + align - 1) & !(align - 1)
}
