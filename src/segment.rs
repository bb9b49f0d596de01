//! Segment table for the segmented backend.
//!
//! The logical offset space is carved into `segment_count` equal segments;
//! backing memory is acquired in groups of adjacent segments (one OS
//! reservation per group, so blocks may span segments within a group) and
//! released at finalize. The free list ignores segment boundaries, but the
//! per-segment occupancy counters must not: both the allocate and free
//! paths go through the same range walker below.

use core::ptr::null_mut;

use log::trace;

use crate::heap::Heap;
use crate::os;
use crate::types::*;

/// One entry of the segment table.
#[derive(Copy, Clone)]
pub(crate) struct Segment {
    /// Host base of this segment's backing, inside its group reservation.
    pub base: *mut u8,
    /// Bytes currently allocated from this segment's logical range.
    pub occupied_size: u32,
    /// Number of segments in the OS reservation starting here; zero for
    /// non-head members.
    pub group_len: u16,
    /// Whether backing is currently attached.
    pub allocated: bool,
}

pub(crate) const EMPTY_SEGMENT: Segment = Segment {
    base: null_mut(),
    occupied_size: 0,
    group_len: 0,
    allocated: false,
};

impl Heap {
    /// Attach backing for enough adjacent segments to cover `need` bytes
    /// and splice the new space into the free list. Returns `false` when no
    /// suitable run of unallocated segments exists or the platform refuses
    /// the reservation.
    pub(crate) fn seg_acquire_group(&mut self, need: usize) -> bool {
        debug_assert!(self.backend() == HeapBackend::Segmented);
        let seg_size = self.options.segment_size;
        let count = (align_up(need, ALIGNMENT as usize) + seg_size - 1) / seg_size;
        let count = if count == 0 { 1 } else { count };

        let mut start = None;
        let mut run = 0;
        for index in 0..self.options.segment_count {
            if self.segments[index].allocated {
                run = 0;
            } else {
                run += 1;
                if run == count {
                    start = Some(index + 1 - count);
                    break;
                }
            }
        }
        let start = match start {
            Some(index) => index,
            None => return false,
        };

        let backing = os::alloc(count * seg_size);
        if backing.is_null() {
            return false;
        }
        for member in 0..count {
            let segment = &mut self.segments[start + member];
            segment.base = unsafe { backing.add(member * seg_size) };
            segment.occupied_size = 0;
            segment.group_len = 0;
            segment.allocated = true;
        }
        self.segments[start].group_len = count as u16;
        trace!(
            "attached segment group [{}..{}), {} bytes",
            start,
            start + count,
            count * seg_size
        );
        unsafe { self.list_insert((start * seg_size) as u32, (count * seg_size) as u32) };
        true
    }

    /// Detach every group reservation and reset the table.
    pub(crate) fn seg_release_all(&mut self) {
        let seg_size = self.options.segment_size;
        for index in 0..self.options.segment_count {
            let group_len = self.segments[index].group_len as usize;
            if self.segments[index].allocated && group_len > 0 {
                unsafe { os::free(self.segments[index].base, group_len * seg_size) };
            }
        }
        for segment in self.segments.iter_mut() {
            *segment = EMPTY_SEGMENT;
        }
    }

    /// Attribute the granule range of a block to every segment it touches.
    /// Allocation and free both charge through this walk, so the occupancy
    /// sum always equals the live-block total.
    pub(crate) fn seg_update_occupied(&mut self, offset: u32, size: u32, add: bool) {
        let seg_size = self.options.segment_size as u32;
        let last = offset + size - ALIGNMENT;
        let first_index = offset / seg_size;
        let last_index = last / seg_size;
        let mut cursor = offset;
        for index in first_index..=last_index {
            let seg_end = (index + 1) * seg_size;
            let chunk_last = if last < seg_end - ALIGNMENT {
                last
            } else {
                seg_end - ALIGNMENT
            };
            let chunk = chunk_last - cursor + ALIGNMENT;
            let segment = &mut self.segments[index as usize];
            debug_assert!(segment.allocated);
            if add {
                segment.occupied_size += chunk;
                debug_assert!(segment.occupied_size <= seg_size);
            } else {
                debug_assert!(segment.occupied_size >= chunk);
                segment.occupied_size -= chunk;
            }
            cursor = seg_end;
        }
    }

    #[cfg(test)]
    pub(crate) fn segment_occupancy(&self) -> Vec<u32> {
        self.segments[..self.options.segment_count]
            .iter()
            .map(|segment| segment.occupied_size)
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn allocated_segment_count(&self) -> usize {
        self.segments[..self.options.segment_count]
            .iter()
            .filter(|segment| segment.allocated)
            .count()
    }
}
