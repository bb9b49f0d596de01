//! Address-ordered singly-linked free list with in-place headers.
//!
//! Each free region stores its header in its own first granule; handing a
//! region to a caller overwrites the header by definition. Links are
//! compressed offsets, the list is strictly ascending, and no two entries
//! are ever adjacent (insertion coalesces). A single cached predecessor
//! (`skip`) shortcuts the ordered-insert search.

use core::ptr;

use crate::heap::Heap;
use crate::types::*;

/// In-place header of a free region, exactly one granule wide.
#[repr(C)]
pub(crate) struct FreeHeader {
    /// Total region length in bytes; a multiple of the granule, `>=` it.
    pub size: u32,
    /// Offset of the next free region, or `END_OF_LIST`.
    pub next_offset: u32,
}

const _HEADER_IS_ONE_GRANULE: [(); ALIGNMENT as usize] = [(); core::mem::size_of::<FreeHeader>()];

/// A position in the free list: the sentinel head or a live node.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub(crate) enum ListPos {
    Head,
    Node(u32),
}

impl Heap {
    #[inline]
    pub(crate) unsafe fn header(&self, offset: u32) -> *mut FreeHeader {
        self.decompress(offset) as *mut FreeHeader
    }

    #[inline]
    fn next_of(&self, pos: ListPos) -> u32 {
        match pos {
            ListPos::Head => self.first_next,
            ListPos::Node(offset) => unsafe { (*self.header(offset)).next_offset },
        }
    }

    #[inline]
    fn set_next(&mut self, pos: ListPos, value: u32) {
        match pos {
            ListPos::Head => self.first_next = value,
            ListPos::Node(offset) => unsafe { (*self.header(offset)).next_offset = value },
        }
    }

    // Host address one past the end of a region. Logical neighbours are only
    // mergeable when they are also contiguous in host memory (segment groups
    // are separate reservations).
    #[inline]
    fn region_end_addr(&self, offset: u32, size: u32) -> usize {
        self.decompress(offset) as usize + size as usize
    }

    /// Take `need` bytes from the list, first-fit. Returns the offset of the
    /// carved block, or `None` when no region is large enough.
    pub(crate) unsafe fn list_alloc(&mut self, need: u32) -> Option<u32> {
        debug_assert!(need >= ALIGNMENT && need % ALIGNMENT == 0);
        if need == ALIGNMENT && self.first_next != END_OF_LIST {
            Some(self.list_alloc_fast())
        } else {
            self.list_alloc_first_fit(need)
        }
    }

    // Single-granule requests always fit the first region: either unlink it
    // or shrink it in place by advancing its header one granule.
    unsafe fn list_alloc_fast(&mut self) -> u32 {
        let offset = self.first_next;
        let header = self.header(offset);
        if (*header).size == ALIGNMENT {
            self.first_next = (*header).next_offset;
            if self.skip == ListPos::Node(offset) {
                self.skip = ListPos::Head;
            }
        } else {
            let rest = offset + ALIGNMENT;
            ptr::write(
                self.header(rest),
                FreeHeader {
                    size: (*header).size - ALIGNMENT,
                    next_offset: (*header).next_offset,
                },
            );
            self.first_next = rest;
            if self.skip == ListPos::Node(offset) {
                self.skip = ListPos::Node(rest);
            }
        }
        offset
    }

    unsafe fn list_alloc_first_fit(&mut self, need: u32) -> Option<u32> {
        let mut prev = ListPos::Head;
        let mut current = self.first_next;
        while current != END_OF_LIST {
            self.stats.alloc_iter_count += 1;
            let header = self.header(current);
            let size = (*header).size;
            let next = (*header).next_offset;
            if size >= need {
                if size > need {
                    // Split: the residual keeps the tail of the region.
                    let rest = current + need;
                    ptr::write(
                        self.header(rest),
                        FreeHeader {
                            size: size - need,
                            next_offset: next,
                        },
                    );
                    self.set_next(prev, rest);
                } else {
                    self.set_next(prev, next);
                }
                self.skip = prev;
                return Some(current);
            }
            prev = ListPos::Node(current);
            current = next;
        }
        None
    }

    /// Insert the region `[offset, offset + size)` at its sorted position,
    /// coalescing with either neighbour when the spans touch.
    pub(crate) unsafe fn list_insert(&mut self, offset: u32, size: u32) {
        debug_assert!(offset % ALIGNMENT == 0);
        debug_assert!(size >= ALIGNMENT && size % ALIGNMENT == 0);

        // The list is offset-sorted, so when the cached predecessor sits
        // below the new region no earlier node can be its insertion point.
        let mut prev = match self.skip {
            ListPos::Node(skip) if offset > skip => {
                self.stats.skip_count += 1;
                ListPos::Node(skip)
            }
            _ => {
                self.stats.nonskip_count += 1;
                ListPos::Head
            }
        };
        loop {
            let next = self.next_of(prev);
            if next >= offset {
                break;
            }
            self.stats.free_iter_count += 1;
            prev = ListPos::Node(next);
        }
        let next = self.next_of(prev);
        debug_assert!(next != offset, "region already free");

        let merged = match prev {
            ListPos::Node(prev_offset) => {
                let prev_header = self.header(prev_offset);
                let prev_size = (*prev_header).size;
                if prev_offset + prev_size == offset
                    && self.region_end_addr(prev_offset, prev_size) == self.decompress(offset) as usize
                {
                    (*prev_header).size = prev_size + size;
                    prev_offset
                } else {
                    ptr::write(self.header(offset), FreeHeader { size, next_offset: next });
                    self.set_next(prev, offset);
                    offset
                }
            }
            ListPos::Head => {
                ptr::write(self.header(offset), FreeHeader { size, next_offset: next });
                self.first_next = offset;
                offset
            }
        };

        let merged_header = self.header(merged);
        if next != END_OF_LIST {
            let merged_size = (*merged_header).size;
            if merged + merged_size == next
                && self.region_end_addr(merged, merged_size) == self.decompress(next) as usize
            {
                let next_header = self.header(next);
                (*merged_header).size = merged_size + (*next_header).size;
                (*merged_header).next_offset = (*next_header).next_offset;
            } else {
                (*merged_header).next_offset = next;
            }
        } else {
            (*merged_header).next_offset = END_OF_LIST;
        }

        self.skip = prev;
    }

    /// Test-only view of the list as `(offset, size)` pairs in link order.
    #[cfg(test)]
    pub(crate) fn free_regions(&self) -> Vec<(u32, u32)> {
        let mut regions = Vec::new();
        let mut current = self.first_next;
        while current != END_OF_LIST {
            unsafe {
                let header = self.header(current);
                regions.push((current, (*header).size));
                current = (*header).next_offset;
            }
        }
        regions
    }
}

#[cfg(test)]
mod tests {
    use crate::options::HeapOptions;
    use crate::Heap;

    fn small_heap() -> Heap {
        Heap::init(HeapOptions::static_heap(256))
    }

    #[test]
    fn init_installs_single_spanning_region() {
        let heap = small_heap();
        assert_eq!(heap.free_regions(), vec![(0, 256)]);
        heap.finalize();
    }

    #[test]
    fn sequential_allocations_are_adjacent() {
        let mut heap = small_heap();
        let p1 = heap.alloc(16);
        let p2 = heap.alloc(16);
        assert_eq!(p2 as usize - p1 as usize, 16);
        assert_eq!(heap.free_regions(), vec![(32, 256 - 32)]);
        unsafe {
            heap.free(p1, 16);
            heap.free(p2, 16);
        }
        heap.finalize();
    }

    #[test]
    fn free_order_coalesces_back_to_one_region() {
        let mut heap = small_heap();
        let p1 = heap.alloc(16);
        let p2 = heap.alloc(16);
        unsafe { heap.free(p1, 16) };
        assert_eq!(heap.free_regions(), vec![(0, 16), (32, 224)]);
        unsafe { heap.free(p2, 16) };
        assert_eq!(heap.free_regions(), vec![(0, 256)]);
        heap.finalize();
    }

    #[test]
    fn fast_path_unlinks_exact_granule_region() {
        let mut heap = small_heap();
        let a = heap.alloc(8);
        let b = heap.alloc(8);
        let c = heap.alloc(232);
        unsafe { heap.free(a, 8) };
        assert_eq!(heap.free_regions(), vec![(0, 8), (248, 8)]);

        // The first region is exactly one granule: the fast path must
        // unlink it and point the head at its successor.
        let iters_before = heap.stats_snapshot().alloc_iter_count;
        let p = heap.alloc(8);
        assert_eq!(heap.compress(p), 0);
        assert_eq!(heap.free_regions(), vec![(248, 8)]);
        assert_eq!(heap.stats_snapshot().alloc_iter_count, iters_before);
        unsafe {
            heap.free(p, 8);
            heap.free(b, 8);
            heap.free(c, 232);
        }
        heap.finalize();
    }

    #[test]
    fn fast_path_shrinks_larger_first_region_in_place() {
        let mut heap = small_heap();
        let p = heap.alloc(8);
        assert_eq!(heap.compress(p), 0);
        assert_eq!(heap.free_regions(), vec![(8, 248)]);
        unsafe { heap.free(p, 8) };
        heap.finalize();
    }

    #[test]
    fn split_leaves_residual_region() {
        let mut heap = small_heap();
        let p = heap.alloc(100);
        // 100 rounds up to 104; the residual keeps the tail.
        assert_eq!(heap.free_regions(), vec![(104, 152)]);
        unsafe { heap.free(p, 100) };
        assert_eq!(heap.free_regions(), vec![(0, 256)]);
        heap.finalize();
    }

    #[test]
    fn skip_pointer_accelerates_ascending_frees() {
        let mut heap = small_heap();
        let a = heap.alloc(16);
        let b = heap.alloc(16);
        let c = heap.alloc(16);
        let d = heap.alloc(16);
        unsafe {
            heap.free(b, 16);
            heap.free(d, 16);
            // c sits above the cached predecessor left by the previous
            // frees, so this insert may start from it.
            heap.free(c, 16);
            heap.free(a, 16);
        }
        assert_eq!(heap.free_regions(), vec![(0, 256)]);
        let stats = heap.stats_snapshot();
        assert_eq!(stats.skip_count, 1);
        assert_eq!(stats.nonskip_count, 3);
        heap.finalize();
    }

    #[test]
    fn coalescing_is_complete_in_any_free_order() {
        let orders: [[usize; 4]; 4] = [[0, 1, 2, 3], [3, 2, 1, 0], [1, 3, 0, 2], [2, 0, 3, 1]];
        for order in orders.iter() {
            let mut heap = small_heap();
            let blocks: Vec<*mut u8> = (0..4).map(|_| heap.alloc(32)).collect();
            for &index in order.iter() {
                unsafe { heap.free(blocks[index], 32) };
            }
            assert_eq!(heap.free_regions(), vec![(0, 256)]);
            heap.finalize();
        }
    }

    #[test]
    fn alloc_then_free_restores_list_exactly() {
        let mut heap = small_heap();
        let a = heap.alloc(24);
        let b = heap.alloc(40);
        unsafe { heap.free(a, 24) };
        let before = heap.free_regions();
        let p = heap.alloc(16);
        unsafe { heap.free(p, 16) };
        assert_eq!(heap.free_regions(), before);
        unsafe { heap.free(b, 40) };
        heap.finalize();
    }

    #[test]
    fn exhausted_list_walk_returns_null() {
        let mut heap = small_heap();
        let p = heap.alloc(200);
        assert!(heap.alloc_null_on_error(100).is_null());
        unsafe { heap.free(p, 200) };
        heap.finalize();
    }
}
