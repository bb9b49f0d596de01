//! Compressed (offset-form) pointers.
//!
//! Intra-heap links are stored as 32-bit offsets from the area base rather
//! than host pointers. In segmented mode the offset space is the union of
//! the segment ranges and the owning segment is found by integer division;
//! the pass-through backend never narrows pointers.

use crate::heap::Heap;
use crate::types::*;

impl Heap {
    /// Convert a live heap address to its 32-bit offset.
    ///
    /// `ptr` must lie inside the heap area and be granule-aligned; both are
    /// debug-asserted.
    pub fn compress(&self, ptr: *const u8) -> u32 {
        debug_assert!(self.backend() != HeapBackend::System);
        debug_assert!(!ptr.is_null());
        debug_assert!(ptr as usize % ALIGNMENT as usize == 0);
        debug_assert!(self.is_heap_pointer(ptr));
        match self.backend() {
            HeapBackend::Segmented => {
                let seg_size = self.options.segment_size;
                for (index, segment) in self.segments[..self.options.segment_count]
                    .iter()
                    .enumerate()
                {
                    if !segment.allocated {
                        continue;
                    }
                    let base = segment.base as usize;
                    let addr = ptr as usize;
                    if addr >= base && addr < base + seg_size {
                        return (index * seg_size + (addr - base)) as u32;
                    }
                }
                unreachable!("pointer outside every allocated segment")
            }
            _ => (ptr as usize - self.base as usize) as u32,
        }
    }

    /// Convert a 32-bit offset back to a host address.
    ///
    /// `offset` must be a granule-aligned offset below the logical area
    /// size (in particular not `END_OF_LIST`); debug-asserted.
    pub fn decompress(&self, offset: u32) -> *mut u8 {
        debug_assert!(self.backend() != HeapBackend::System);
        debug_assert!(offset != END_OF_LIST);
        debug_assert!(offset < self.area_size);
        debug_assert!(offset % ALIGNMENT == 0);
        match self.backend() {
            HeapBackend::Segmented => {
                let seg_size = self.options.segment_size;
                let index = offset as usize / seg_size;
                let segment = &self.segments[index];
                debug_assert!(segment.allocated);
                unsafe { segment.base.add(offset as usize % seg_size) }
            }
            _ => unsafe { self.base.add(offset as usize) },
        }
    }

    /// Whether `ptr` falls inside memory owned by this heap. Used by debug
    /// assertions on the free path; the pass-through backend owns no area
    /// and answers `true`.
    pub fn is_heap_pointer(&self, ptr: *const u8) -> bool {
        let addr = ptr as usize;
        match self.backend() {
            HeapBackend::Static | HeapBackend::DynamicEmul => {
                addr >= self.base as usize && addr < self.base as usize + self.area_size as usize
            }
            HeapBackend::Segmented => {
                let seg_size = self.options.segment_size;
                self.segments[..self.options.segment_count].iter().any(|segment| {
                    segment.allocated
                        && addr >= segment.base as usize
                        && addr < segment.base as usize + seg_size
                })
            }
            HeapBackend::System => true,
        }
    }
}
