//! Pass-through backend and system-allocator cost accounting.
//!
//! In `System` mode every block comes straight from the platform allocator
//! and the free-list, skip and segment machinery is inert; only the
//! counters are maintained. The `DynamicEmul` backend allocates from the
//! area free list but charges `allocated_heap_size` as a system allocator
//! would, including the per-block metadata overhead, so budget decisions
//! model a dynamically growing heap.

use crate::heap::Heap;
use crate::os;
use crate::types::align_up;

impl Heap {
    pub(crate) fn system_alloc(&mut self, size: usize) -> *mut u8 {
        let ptr = os::sys_alloc(size);
        if ptr.is_null() {
            return ptr;
        }
        self.blocks_size += size;
        self.block_count += 1;
        self.allocated_heap_size += self.system_block_cost(size);
        self.system_metadata_size += self.options.system_block_metadata;
        self.grow_limit();
        self.stat_alloc(size, size);
        ptr
    }

    pub(crate) unsafe fn system_free(&mut self, ptr: *mut u8, size: usize) {
        os::sys_free(ptr);
        self.blocks_size -= size;
        self.block_count -= 1;
        self.allocated_heap_size -= self.system_block_cost(size);
        self.system_metadata_size -= self.options.system_block_metadata;
        self.stat_free(size, size);
    }

    // What the platform allocator would consume for this block: the payload
    // plus its bookkeeping, rounded to the system alignment.
    fn system_block_cost(&self, size: usize) -> usize {
        align_up(size + self.options.system_block_metadata, self.options.system_alignment)
    }

    // Slab-mode small blocks are served from dedicated pools by the system
    // they emulate, so they carry no per-block metadata.
    fn emul_exempt(&self, small: bool) -> bool {
        small && self.options.slab_small_blocks
    }

    pub(crate) fn emul_account_alloc(&mut self, size: usize, aligned: usize, small: bool) {
        if self.emul_exempt(small) {
            self.allocated_heap_size += aligned;
        } else {
            self.allocated_heap_size += self.system_block_cost(size);
            self.system_metadata_size += self.options.system_block_metadata;
        }
    }

    pub(crate) fn emul_account_free(&mut self, size: usize, aligned: usize, small: bool) {
        if self.emul_exempt(small) {
            self.allocated_heap_size -= aligned;
        } else {
            self.allocated_heap_size -= self.system_block_cost(size);
            self.system_metadata_size -= self.options.system_block_metadata;
        }
    }
}
