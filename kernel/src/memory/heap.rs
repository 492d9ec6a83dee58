//! Kernel Heap (C3) — a first-fit allocator over tagged block headers.
//!
//! Replaces the teacher's thin wrapper around the external `smallheap` crate (dropped from
//! Cargo.toml; see DESIGN.md) with the block-header scheme spec.md §3/§4.3 actually describes:
//! each block is a 32-bit cell packing `{ in_use: 1 bit, size: 31 bits }` immediately followed by
//! its payload, where `size` counts the header *and* the payload together -- the block chain's
//! sizes therefore sum to exactly `HEAP_END - HEAP_START` regardless of allocation history (§8
//! property 3). Allocation is a linear first-fit scan; a block larger than the request (plus room
//! for a new header) is split, and adjacent free blocks are merged back together on every
//! `dealloc`.
//!
//! Alignment above `HEADER_SIZE` (4 bytes) is handled by searching for an aligned data pointer
//! inside a candidate free block and placing the header immediately before it. Any alignment
//! padding before that header becomes its own free stub if there's room for one; if the gap is
//! smaller than a header, it's permanently unusable slack. This kernel never allocates anything
//! wider than pointer-aligned, so the common path never pays for this.

use core::alloc::{GlobalAlloc, Layout};
use core::cell::RefCell;
use core::mem::size_of;

const HEADER_SIZE: usize = size_of::<u32>();
const IN_USE_BIT: u32 = 1 << 31;
const SIZE_MASK: u32 = !IN_USE_BIT;

fn round_up(x: usize, align: usize) -> usize {
    (x + align - 1) & !(align - 1)
}

struct FirstFitHeap {
    start: usize,
    end: usize,
}

impl FirstFitHeap {
    const fn empty() -> Self {
        FirstFitHeap { start: 0, end: 0 }
    }

    unsafe fn header_ptr(addr: usize) -> *mut u32 {
        addr as *mut u32
    }

    /// `size` here is the block's *total* length -- header plus payload -- per spec.md §3/§4.3.
    unsafe fn read_header(addr: usize) -> (bool, usize) {
        let raw = *Self::header_ptr(addr);
        (raw & IN_USE_BIT != 0, (raw & SIZE_MASK) as usize)
    }

    unsafe fn write_header(addr: usize, in_use: bool, size: usize) {
        debug_assert!((size as u32) & IN_USE_BIT == 0, "block too large to encode");
        let raw = (if in_use { IN_USE_BIT } else { 0 }) | (size as u32 & SIZE_MASK);
        *Self::header_ptr(addr) = raw;
    }

    /// Add a new region of memory to the heap, either establishing it for the first time or
    /// appending a contiguous extension (used when the heap grows by a page on an allocation
    /// miss).
    unsafe fn extend(&mut self, region_start: *mut u8, region_size: usize) {
        assert!(region_size > HEADER_SIZE, "heap region too small for a single header");
        let addr = region_start as usize;

        if self.start == 0 {
            self.start = addr;
            self.end = addr + region_size;
        } else {
            assert_eq!(addr, self.end, "heap can only grow contiguously at its current end");
            self.end = addr + region_size;
        }

        Self::write_header(addr, false, region_size);
        self.coalesce();
    }

    fn size(&self) -> usize {
        if self.start == 0 {
            return 0;
        }
        let mut total = 0;
        let mut addr = self.start;
        unsafe {
            while addr + HEADER_SIZE <= self.end {
                let (in_use, size) = Self::read_header(addr);
                if !in_use {
                    total += size;
                }
                addr += size;
            }
        }
        total
    }

    unsafe fn malloc(&mut self, size: usize, align: usize) -> Option<*mut u8> {
        if self.start == 0 {
            return None;
        }
        let needed = round_up(size.max(1) + HEADER_SIZE, HEADER_SIZE);
        let align = align.max(1);

        let mut addr = self.start;
        while addr + HEADER_SIZE <= self.end {
            let (in_use, block_size) = Self::read_header(addr);
            let block_end = addr + block_size;

            if !in_use {
                let naive_data = addr + HEADER_SIZE;
                let aligned_data = round_up(naive_data, align);
                let header_addr = aligned_data - HEADER_SIZE;

                if header_addr >= addr && header_addr + needed <= block_end {
                    let available = block_end - header_addr;

                    if available >= needed + HEADER_SIZE + 1 {
                        Self::write_header(header_addr, true, needed);
                        let next_addr = header_addr + needed;
                        Self::write_header(next_addr, false, block_end - next_addr);
                    } else {
                        Self::write_header(header_addr, true, available);
                    }

                    if header_addr > addr {
                        if header_addr - addr >= HEADER_SIZE {
                            Self::write_header(addr, false, header_addr - addr);
                        }
                        // else: smaller than a header, permanently unusable alignment slack.
                    }

                    return Some(aligned_data as *mut u8);
                }
            }

            addr = block_end;
        }
        None
    }

    unsafe fn free(&mut self, ptr: *mut u8) {
        let header_addr = ptr as usize - HEADER_SIZE;
        let (in_use, size) = Self::read_header(header_addr);
        debug_assert!(in_use, "dealloc of a pointer whose header is already free");
        Self::write_header(header_addr, false, size);
        self.coalesce();
    }

    /// Merge every run of adjacent free blocks. Linear in the number of blocks; fine for a
    /// teaching kernel where allocator throughput is not a design goal.
    unsafe fn coalesce(&mut self) {
        let mut addr = self.start;
        while addr + HEADER_SIZE < self.end {
            let (in_use, size) = Self::read_header(addr);
            let next_addr = addr + size;
            if !in_use && next_addr + HEADER_SIZE <= self.end {
                let (next_in_use, next_size) = Self::read_header(next_addr);
                if !next_in_use {
                    Self::write_header(addr, false, size + next_size);
                    continue;
                }
            }
            addr = next_addr;
        }
    }

    /// Test-only diagnostic: `(in_use, size)` for every block in order, used to pin down exact
    /// intermediate layouts (§8 scenario E3) rather than just aggregate byte counts.
    #[cfg(test)]
    unsafe fn blocks(&self) -> alloc::vec::Vec<(bool, usize)> {
        let mut out = alloc::vec::Vec::new();
        let mut addr = self.start;
        while addr + HEADER_SIZE <= self.end {
            let (in_use, size) = Self::read_header(addr);
            out.push((in_use, size));
            addr += size;
        }
        out
    }
}

/// A wrapper around the first-fit heap for use as the `global_allocator`.
pub struct KernelAllocator {
    heap: RefCell<FirstFitHeap>,
}

impl KernelAllocator {
    pub const fn new() -> Self {
        KernelAllocator {
            heap: RefCell::new(FirstFitHeap::empty()),
        }
    }

    pub unsafe fn extend(&mut self, start: *mut u8, size: usize) {
        self.heap.borrow_mut().extend(start, size)
    }

    pub fn size(&self) -> usize {
        self.heap.borrow().size()
    }
}

unsafe impl GlobalAlloc for KernelAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        match self.heap.borrow_mut().malloc(layout.size(), layout.align()) {
            Some(p) => p,
            None => core::ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        self.heap.borrow_mut().free(ptr)
    }
}

/// Initialize the kernel heap proper, once paging has mapped a real heap region.
pub fn init(allocator: &mut KernelAllocator, start: usize, size: usize) {
    unsafe {
        allocator.extend(start as *mut u8, size);
    }

    let free_size = allocator.size();

    printk!(
        "\theap inited - start addr: 0x{:x}, end addr: 0x{:x}, {} bytes\n",
        start,
        start + size,
        free_size,
    );
}

/// Grow the heap by one page when an allocation misses: map a fresh PFA frame at the heap's
/// current end via the VMM, then fold it into the allocator. Separate from the page-fault path:
/// heap growth is driven explicitly here, not by demand-paging a stray address.
pub fn grow_by_page(allocator: &mut KernelAllocator, current_end: usize) {
    let pfn = crate::memory::pfa::allocate();
    assert_ne!(pfn, crate::memory::pfa::OUT_OF_MEMORY, "heap growth: PFA exhausted");
    crate::memory::vmm::map(current_end as u64, pfn * crate::memory::pfa::FRAME_SIZE, false);
    unsafe {
        allocator.extend(current_end as *mut u8, crate::memory::pfa::FRAME_SIZE as usize);
    }
}

#[alloc_error_handler]
fn oom(layout: Layout) -> ! {
    panic!("heap OOM requesting {} bytes (align {})", layout.size(), layout.align());
}

pub mod early {
    use super::KernelAllocator;

    /// Reserve some space in the kernel's BSS for a small initial kernel heap, exactly the
    /// teacher's trick for bootstrapping allocation before paging has mapped a real heap region.
    static mut INITIAL_KHEAP_SPACE: InitialHeapSpace = InitialHeapSpace::empty();

    const INITIAL_KHEAP_SPACE_SIZE: usize = 4 << 12;

    #[repr(C, align(4096))]
    struct InitialHeapSpace([u8; INITIAL_KHEAP_SPACE_SIZE]);

    impl InitialHeapSpace {
        const fn empty() -> Self {
            InitialHeapSpace([0; INITIAL_KHEAP_SPACE_SIZE])
        }
    }

    pub fn init(allocator: &mut KernelAllocator) {
        let init_heap_start = unsafe { (&mut INITIAL_KHEAP_SPACE) as *mut InitialHeapSpace }.cast();
        unsafe {
            allocator.extend(init_heap_start, INITIAL_KHEAP_SPACE_SIZE);
        }

        printk!(
            "\tearly heap inited - start addr: 0x{:x}, end addr: 0x{:x}, {} bytes\n",
            init_heap_start as usize,
            init_heap_start as usize + INITIAL_KHEAP_SPACE_SIZE,
            INITIAL_KHEAP_SPACE_SIZE,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    #[test]
    fn alloc_then_free_is_reusable() {
        let mut region = vec![0u8; 4096];
        let mut heap = FirstFitHeap::empty();
        unsafe {
            heap.extend(region.as_mut_ptr(), region.len());
            let a = heap.malloc(64, 8).unwrap();
            heap.free(a);
            let b = heap.malloc(64, 8).unwrap();
            assert_eq!(a, b);
        }
    }

    #[test]
    fn split_then_coalesce_restores_original_size() {
        let mut region = vec![0u8; 4096];
        let mut heap = FirstFitHeap::empty();
        unsafe {
            heap.extend(region.as_mut_ptr(), region.len());
            let before = heap.size();
            let a = heap.malloc(64, 8).unwrap();
            let b = heap.malloc(64, 8).unwrap();
            heap.free(a);
            heap.free(b);
            assert_eq!(heap.size(), before);
        }
    }

    #[test]
    fn exhaustion_returns_null() {
        let mut region = vec![0u8; 256];
        let mut heap = FirstFitHeap::empty();
        unsafe {
            heap.extend(region.as_mut_ptr(), region.len());
            assert!(heap.malloc(1024, 8).is_none());
        }
    }

    /// Block chain sizes always sum to the initial region size, whatever the allocation history
    /// (§8 property 3) -- now true by construction since every header's `size` field includes
    /// itself.
    #[test]
    fn block_sizes_always_sum_to_region_size() {
        let mut region = vec![0u8; 4096];
        let mut heap = FirstFitHeap::empty();
        unsafe {
            heap.extend(region.as_mut_ptr(), region.len());
            let p1 = heap.malloc(100, 1).unwrap();
            let p2 = heap.malloc(100, 1).unwrap();
            heap.free(p1);
            let p3 = heap.malloc(50, 1).unwrap();
            let p4 = heap.malloc(44, 1).unwrap();
            let total: usize = heap.blocks().iter().map(|(_, size)| size).sum();
            assert_eq!(total, 4096);
            heap.free(p2);
            heap.free(p3);
            heap.free(p4);
            let total: usize = heap.blocks().iter().map(|(_, size)| size).sum();
            assert_eq!(total, 4096);
        }
    }

    /// Reproduces §8 scenario E3 verbatim: `p1=malloc(100); p2=malloc(100); free(p1);
    /// p3=malloc(50); p4=malloc(44); free(p2); free(p3); free(p4)` against a 4096-byte region,
    /// checking the exact block-size sequence at each step and that it ends as a single free
    /// block spanning the whole heap.
    #[test]
    fn e3_malloc_free_sequence_matches_spec() {
        let mut region = vec![0u8; 4096];
        let mut heap = FirstFitHeap::empty();
        unsafe {
            heap.extend(region.as_mut_ptr(), region.len());

            let p1 = heap.malloc(100, 1).unwrap();
            let p2 = heap.malloc(100, 1).unwrap();
            assert_eq!(heap.blocks().as_slice(), [(true, 104), (true, 104), (false, 3888)]);

            heap.free(p1);
            assert_eq!(heap.blocks().as_slice(), [(false, 104), (true, 104), (false, 3888)]);

            let p3 = heap.malloc(50, 1).unwrap();
            assert_eq!(
                heap.blocks().as_slice(),
                [(true, 56), (false, 48), (true, 104), (false, 3888)]
            );

            let p4 = heap.malloc(44, 1).unwrap();
            assert_eq!(
                heap.blocks().as_slice(),
                [(true, 56), (true, 48), (true, 104), (false, 3888)]
            );

            heap.free(p2);
            heap.free(p3);
            heap.free(p4);
            assert_eq!(heap.blocks().as_slice(), [(false, 4096)]);
        }
    }
}
