//! Platform backing memory for heap areas and segment groups.

use core::ptr::null_mut;

use log::warn;

/// Reserve and commit a read-write region of `size` bytes, or null on
/// failure. The returned region is page-backed and zero-initialized.
#[cfg(unix)]
pub fn alloc(size: usize) -> *mut u8 {
    if size == 0 {
        return null_mut();
    }
    let p = unsafe {
        libc::mmap(
            null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if p == libc::MAP_FAILED {
        warn!("mmap failed: {}, size {}", errno::errno(), size);
        return null_mut();
    }
    p as *mut u8
}

/// Release a region obtained from [`alloc`].
///
/// # Safety
///
/// `ptr` must have been returned by [`alloc`] with this exact `size`, and
/// must not be used afterwards.
#[cfg(unix)]
pub unsafe fn free(ptr: *mut u8, size: usize) {
    if ptr.is_null() || size == 0 {
        return;
    }
    if libc::munmap(ptr as *mut libc::c_void, size) == -1 {
        warn!(
            "munmap failed: {}, addr {:08x}, size {}",
            errno::errno(),
            ptr as usize,
            size
        );
    }
}

#[cfg(windows)]
pub fn alloc(size: usize) -> *mut u8 {
    use winapi::um::errhandlingapi::GetLastError;
    use winapi::um::memoryapi::VirtualAlloc;
    use winapi::um::winnt::{MEM_COMMIT, MEM_RESERVE, PAGE_READWRITE};

    if size == 0 {
        return null_mut();
    }
    let p = unsafe { VirtualAlloc(null_mut(), size, MEM_RESERVE | MEM_COMMIT, PAGE_READWRITE) };
    if p.is_null() {
        warn!("VirtualAlloc failed: error {}, size {}", unsafe { GetLastError() }, size);
    }
    p as *mut u8
}

/// # Safety
///
/// `ptr` must have been returned by [`alloc`] and must not be used
/// afterwards.
#[cfg(windows)]
pub unsafe fn free(ptr: *mut u8, _size: usize) {
    use winapi::um::errhandlingapi::GetLastError;
    use winapi::um::memoryapi::VirtualFree;
    use winapi::um::winnt::MEM_RELEASE;

    if ptr.is_null() {
        return;
    }
    if VirtualFree(ptr as *mut _, 0, MEM_RELEASE) == 0 {
        warn!("VirtualFree failed: error {}, addr {:08x}", GetLastError(), ptr as usize);
    }
}

/// Allocate from the platform general-purpose allocator (pass-through
/// backend).
#[cfg(unix)]
pub fn sys_alloc(size: usize) -> *mut u8 {
    unsafe { libc::malloc(size) as *mut u8 }
}

/// # Safety
///
/// `ptr` must have been returned by [`sys_alloc`] and not yet freed.
#[cfg(unix)]
pub unsafe fn sys_free(ptr: *mut u8) {
    libc::free(ptr as *mut libc::c_void);
}

#[cfg(windows)]
pub fn sys_alloc(size: usize) -> *mut u8 {
    use winapi::um::heapapi::{GetProcessHeap, HeapAlloc};

    unsafe { HeapAlloc(GetProcessHeap(), 0, size) as *mut u8 }
}

/// # Safety
///
/// `ptr` must have been returned by [`sys_alloc`] and not yet freed.
#[cfg(windows)]
pub unsafe fn sys_free(ptr: *mut u8) {
    use winapi::um::heapapi::{GetProcessHeap, HeapFree};

    HeapFree(GetProcessHeap(), 0, ptr as *mut _);
}
