// =============================================================================
// Tern OS - Heap Allocator
// =============================================================================
// The global allocator (linked_list_allocator) backs `Box`/`Vec` and, through
// `HeapFrames`, every sized and aligned physical block bring-up requests:
// page tables, BAR windows, rings and context arrays. RAM is identity mapped,
// so a heap pointer is also the block's physical address.
// =============================================================================

use alloc::alloc::{alloc_zeroed, dealloc, Layout};

use crate::hal::{PhysAddr, PhysAllocator};

#[cfg(target_os = "none")]
mod global {
    use linked_list_allocator::LockedHeap;

    use crate::config::{HEAP_SIZE, HEAP_START};

    #[global_allocator]
    static ALLOCATOR: LockedHeap = LockedHeap::empty();

    pub fn init() {
        // SAFETY: the heap window is RAM past the kernel image, used by
        // nothing else, and init runs once before the first allocation
        unsafe {
            ALLOCATOR.lock().init(HEAP_START as *mut u8, HEAP_SIZE);
        }
        log::info!(
            "heap initialized at {:#x} ({} MiB)",
            HEAP_START,
            HEAP_SIZE / 1024 / 1024
        );
    }
}

#[cfg(target_os = "none")]
pub use global::init;

/// Zeroed, aligned blocks carved from the kernel heap.
#[derive(Debug, Default)]
pub struct HeapFrames;

impl PhysAllocator for HeapFrames {
    fn allocate(&mut self, size: usize, align: usize) -> Option<PhysAddr> {
        if size == 0 {
            return None;
        }
        let layout = Layout::from_size_align(size, align).ok()?;
        // SAFETY: layout has a non-zero size
        let ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() {
            log::warn!("heap exhausted: {:#x} bytes aligned to {:#x}", size, align);
            None
        } else {
            Some(ptr as PhysAddr)
        }
    }

    fn free(&mut self, addr: PhysAddr, size: usize, align: usize) {
        if addr == 0 || size == 0 {
            return;
        }
        if let Ok(layout) = Layout::from_size_align(size, align) {
            // SAFETY: callers return blocks obtained from `allocate` with the
            // same size and alignment
            unsafe { dealloc(addr as *mut u8, layout) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_are_aligned_and_zeroed() {
        let mut frames = HeapFrames;
        let addr = frames.allocate(0x1000, 0x1000).unwrap();
        assert_eq!(addr % 0x1000, 0);
        let bytes = unsafe { core::slice::from_raw_parts(addr as *const u8, 0x1000) };
        assert!(bytes.iter().all(|&b| b == 0));
        frames.free(addr, 0x1000, 0x1000);
    }

    #[test]
    fn rejects_empty_and_malformed_requests() {
        let mut frames = HeapFrames;
        assert_eq!(frames.allocate(0, 64), None);
        assert_eq!(frames.allocate(64, 3), None);
    }
}
