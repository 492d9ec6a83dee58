//! The memory management subsystem: C1 (physical frame allocator), C2 (virtual memory manager),
//! and C3 (kernel heap), wired together in boot order per spec.md §4.1-§4.3.
//!
//! Boot sequence: a tiny BSS-backed heap comes up first (`heap::early`) so `alloc::vec::Vec` etc.
//! work before paging exists; the PFA is seeded from the bootloader's E820-derived memory map;
//! the VMM rewrites the recursive self-mapping slot to the spec's fixed index; the real kernel
//! heap's virtual range is explicitly mapped (not demand-paged -- interrupts are still off, and a
//! fault can't be serviced yet); only then does the PFA start tracking allocations so frames used
//! to bootstrap paging are permanently (and correctly) accounted as never-freed.

use bootloader::bootinfo::MemoryRegionType;
use bootloader::BootInfo;

use x86_64::registers::control::Cr3;
use x86_64::structures::idt::InterruptDescriptorTable;

pub use self::heap::KernelAllocator;

pub mod heap;
pub mod pfa;
pub mod vmm;

/// Address of guard page of the kernel heap (page before the first page of the heap).
pub const KERNEL_HEAP_GUARD: u64 = vmm::KERNEL_HIGHER_HALF_BASE + (32 << 20) - (1 << 12);

/// Address of the first page of the kernel heap.
pub const KERNEL_HEAP_START: u64 = KERNEL_HEAP_GUARD + (1 << 12);

/// The size of the kernel heap in bytes.
pub const KERNEL_HEAP_SIZE: u64 = 4 << 20; // 4 MiB

/// Initialize memory-related subsystems.
pub fn init(allocator: &mut KernelAllocator, boot_info: &'static BootInfo) {
    // Set up a bare-bones heap so we can start initializing everything.
    heap::early::init(allocator);

    // Seed the PFA from the bootloader's E820-derived memory map. Regions already marked in-use
    // by the bootloader (kernel image, its page tables, the bootloader itself) are excluded
    // before the PFA ever sees them, so there is no separate "reserved end frame" to pre-mark.
    let mut raw = alloc_free_region_buf();
    let mut n = 0;
    for region in boot_info.memory_map.iter() {
        if region.region_type != MemoryRegionType::Usable {
            continue;
        }
        if n >= raw.len() {
            break;
        }
        raw[n] = pfa::RawRegion {
            start_frame: region.range.start_frame_number,
            end_frame: region.range.end_frame_number,
        };
        n += 1;
    }
    pfa::init(&raw[..n], 0);

    // Rewrite the recursive slot to the spec's fixed RECURSIVE_IDX. Physical memory below
    // `vmm::IDENTITY_MAP_SIZE` is identity-mapped by the bootloader at this point, so the current
    // PML4's physical address (from CR3) can be dereferenced directly.
    let (pml4_frame, _) = Cr3::read();
    vmm::init(pml4_frame.start_address().as_u64());

    // Explicitly map the kernel heap's virtual range before enabling demand paging for anything
    // else -- interrupts are still disabled, so a page fault here could not be serviced.
    let mut addr = KERNEL_HEAP_START;
    let end = KERNEL_HEAP_START + KERNEL_HEAP_SIZE;
    while addr < end {
        let pfn = pfa::allocate();
        assert_ne!(pfn, pfa::OUT_OF_MEMORY, "memory::init: OOM mapping kernel heap");
        vmm::map(addr, pfn * pfa::FRAME_SIZE, false);
        addr += pfa::FRAME_SIZE;
    }

    heap::init(allocator, KERNEL_HEAP_START as usize, KERNEL_HEAP_SIZE as usize);

    // From this point on, the heap exists: the PFA can start recording which region each
    // allocated PFN came from, so `pfa::release` works for anything allocated hereafter.
    pfa::enable_tracking();
}

/// A fixed-size buffer of raw regions built on the stack, since the heap doesn't exist yet when
/// the bootloader's memory map is first read.
fn alloc_free_region_buf() -> [pfa::RawRegion; 32] {
    [pfa::RawRegion { start_frame: 0, end_frame: 0 }; 32]
}

/// Install the page-fault gate in the IDT. Kept as a thin entry point so `interrupts::init`
/// doesn't need to reach into `memory::vmm` directly, mirroring the teacher's
/// `memory::init_pf_handler` split between the two modules.
pub unsafe fn init_pf_handler(idt: &mut InterruptDescriptorTable) {
    // No dedicated IST stack: a page fault is recoverable and runs on the faulting task's own
    // kernel stack, unlike the "emergency" exceptions that might themselves be caused by a bad
    // stack pointer.
    idt.page_fault.set_handler_fn(vmm::handle_page_fault);
}
