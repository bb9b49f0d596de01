use crate::types::*;

// Default capacity of the reserved area (static and dynamic-emulation
// backends).
pub const DEFAULT_HEAP_SIZE: usize = 512 * 1024;

// Defaults for the segmented backend: 32 segments of 16 KiB.
pub const DEFAULT_SEGMENT_SIZE: usize = 16 * 1024;
pub const DEFAULT_SEGMENT_COUNT: usize = 32;

// System-allocator emulation defaults: per-block bookkeeping overhead and
// the alignment the platform allocator rounds block sizes to.
pub const DEFAULT_SYSTEM_BLOCK_METADATA: usize = 8;
pub const DEFAULT_SYSTEM_ALIGNMENT: usize = 16;

/// Per-heap configuration, fixed at `Heap::init`.
#[derive(Copy, Clone, Debug)]
pub struct HeapOptions {
    pub backend: HeapBackend,
    /// Area capacity for `Static`/`DynamicEmul`; lazy-GC ceiling for
    /// `System`.
    pub heap_size: usize,
    /// Step by which the soft trigger threshold grows and shrinks.
    pub desired_limit: usize,
    pub segment_size: usize,
    pub segment_count: usize,
    /// Run the reclamation callback at `High` severity before every
    /// allocation.
    pub pre_gc_each_alloc: bool,
    /// Trigger the pre-allocation `Low` pass only when the projected total
    /// exceeds the absolute capacity rather than the soft threshold.
    pub lazy_gc: bool,
    /// Exempt small blocks from system-allocator metadata accounting
    /// (dynamic-emulation backend only).
    pub slab_small_blocks: bool,
    pub system_block_metadata: usize,
    pub system_alignment: usize,
}

impl HeapOptions {
    pub fn static_heap(heap_size: usize) -> HeapOptions {
        HeapOptions {
            backend: HeapBackend::Static,
            heap_size,
            desired_limit: default_desired_limit(heap_size),
            ..HeapOptions::default()
        }
    }

    pub fn segmented(segment_size: usize, segment_count: usize) -> HeapOptions {
        let heap_size = segment_size * segment_count;
        HeapOptions {
            backend: HeapBackend::Segmented,
            heap_size,
            desired_limit: default_desired_limit(heap_size),
            segment_size,
            segment_count,
            ..HeapOptions::default()
        }
    }

    pub fn dynamic_emul(heap_size: usize) -> HeapOptions {
        HeapOptions {
            backend: HeapBackend::DynamicEmul,
            heap_size,
            desired_limit: default_desired_limit(heap_size),
            ..HeapOptions::default()
        }
    }

    pub fn system() -> HeapOptions {
        HeapOptions {
            backend: HeapBackend::System,
            ..HeapOptions::default()
        }
    }

    /// Total byte capacity of the logical offset space (`heap_size` for the
    /// area backends, the full segment geometry for segmented mode).
    pub fn capacity(&self) -> usize {
        match self.backend {
            HeapBackend::Segmented => self.segment_size * self.segment_count,
            _ => self.heap_size,
        }
    }

    // Configuration errors are programming errors; they are asserted, not
    // propagated.
    pub(crate) fn validate(&self) {
        let align = ALIGNMENT as usize;
        assert!(self.desired_limit > 0, "desired_limit must be positive");
        match self.backend {
            HeapBackend::Static | HeapBackend::DynamicEmul => {
                assert!(self.heap_size >= align && self.heap_size % align == 0);
                assert!(self.heap_size < MAX_OFFSET_SPACE);
            }
            HeapBackend::Segmented => {
                assert!(self.segment_size >= align && self.segment_size % align == 0);
                assert!(self.segment_count >= 1 && self.segment_count <= MAX_SEGMENT_COUNT);
                assert!(self.segment_size * self.segment_count < MAX_OFFSET_SPACE);
            }
            HeapBackend::System => {
                assert!(self.system_alignment.is_power_of_two());
            }
        }
    }
}

impl Default for HeapOptions {
    fn default() -> HeapOptions {
        HeapOptions {
            backend: HeapBackend::Static,
            heap_size: DEFAULT_HEAP_SIZE,
            desired_limit: default_desired_limit(DEFAULT_HEAP_SIZE),
            segment_size: DEFAULT_SEGMENT_SIZE,
            segment_count: DEFAULT_SEGMENT_COUNT,
            pre_gc_each_alloc: false,
            lazy_gc: false,
            slab_small_blocks: false,
            system_block_metadata: DEFAULT_SYSTEM_BLOCK_METADATA,
            system_alignment: DEFAULT_SYSTEM_ALIGNMENT,
        }
    }
}

// A fraction of the capacity, capped so large heaps still trigger early
// collection passes.
fn default_desired_limit(heap_size: usize) -> usize {
    let limit = heap_size / 32;
    let limit = if limit > 8 * 1024 { 8 * 1024 } else { limit };
    if limit < ALIGNMENT as usize {
        ALIGNMENT as usize
    } else {
        limit
    }
}
