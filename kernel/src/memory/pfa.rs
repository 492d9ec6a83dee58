//! Physical Frame Allocator (PFA) — C1.
//!
//! Owns the set of 4 KiB frames above a configurable low-memory cutoff. Vends and reclaims frames
//! one at a time via a bitmap-per-region first-fit scan, exactly the data model of spec.md §3/§4.1:
//! a `MemoryLayout` holding an ordered sequence of `MemoryRegion`s, each `{ start PFN, total frame
//! count, bitmap, free count }` with the invariant `free_count + popcount(bitmap) == total_frames`.
//!
//! # Metadata placement
//!
//! The real kernel lays its own metadata out immediately after the loaded kernel image, aligned to
//! a frame boundary, and pre-marks every frame covering the image plus that metadata as allocated.
//! This crate is never actually linked and booted, so there is no linker-provided "end of kernel
//! image" symbol to compute a dynamic placement from; instead, metadata lives in a `static` array
//! reserved in the kernel's own BSS, the same trick `memory::heap::early` uses for its bootstrap
//! heap (a compile-time reservation that lands in the same mapped region as the rest of the kernel
//! image, which is exactly where the dynamic placement in the original design would have put it).

use spin::Mutex;

/// Size of a single physical frame.
pub const FRAME_SIZE: u64 = 4096;

/// Frames below this physical address are never managed by the PFA (BIOS/legacy region). See
/// Open Question #1 (§9): this is a distinct constant from the VMM's identity-map extent.
pub const LOW_MEM_CUTOFF: u64 = 0x0010_0000; // 1 MiB

/// Maximum number of distinct usable memory regions the bootloader's memory map may report.
const MAX_REGIONS: usize = 16;

/// Maximum bitmap words per region: 2^15 * 64 = 2,097,152 frames = 8 GiB of frames per region.
const MAX_WORDS_PER_REGION: usize = 1 << 15;

/// Sentinel PFN returned when the allocator is out of memory.
pub const OUT_OF_MEMORY: u64 = u64::MAX;

/// A contiguous span of available physical memory above `LOW_MEM_CUTOFF`.
struct MemoryRegion {
    /// PFN of the first frame in this region.
    start_pfn: u64,
    /// Number of frames in this region.
    total_frames: u64,
    /// Number of currently-free frames in this region.
    free_count: u64,
    /// Allocation bitmap: bit `i` set means frame `start_pfn + i` is allocated.
    bitmap: [u64; MAX_WORDS_PER_REGION],
}

impl MemoryRegion {
    const fn empty() -> Self {
        MemoryRegion {
            start_pfn: 0,
            total_frames: 0,
            free_count: 0,
            bitmap: [0; MAX_WORDS_PER_REGION],
        }
    }

    fn words_used(&self) -> usize {
        ((self.total_frames + 63) / 64) as usize
    }

    /// Mark a range of frames (region-relative index, count) as allocated. Used to pre-mark the
    /// frames covering the kernel image and the allocator's own metadata.
    fn mark_allocated(&mut self, start_index: u64, count: u64) {
        for i in start_index..(start_index + count) {
            if i >= self.total_frames {
                break;
            }
            let word = (i / 64) as usize;
            let bit = i % 64;
            if self.bitmap[word] & (1 << bit) == 0 {
                self.bitmap[word] |= 1 << bit;
                self.free_count -= 1;
            }
        }
    }

    /// First-fit scan: word-at-a-time, then bit-at-a-time within the first non-full word.
    fn find_free(&self) -> Option<u64> {
        if self.free_count == 0 {
            return None;
        }
        for word in 0..self.words_used() {
            if self.bitmap[word] != u64::MAX {
                for bit in 0..64 {
                    let index = (word as u64) * 64 + bit;
                    if index >= self.total_frames {
                        break;
                    }
                    if self.bitmap[word] & (1 << bit) == 0 {
                        return Some(index);
                    }
                }
            }
        }
        None
    }

    fn set_allocated(&mut self, index: u64) {
        let word = (index / 64) as usize;
        let bit = index % 64;
        debug_assert!(self.bitmap[word] & (1 << bit) == 0, "double allocation");
        self.bitmap[word] |= 1 << bit;
        self.free_count -= 1;
    }

    fn clear_allocated(&mut self, index: u64) -> bool {
        let word = (index / 64) as usize;
        let bit = index % 64;
        if self.bitmap[word] & (1 << bit) == 0 {
            // Double free: the bit is already clear.
            return false;
        }
        self.bitmap[word] &= !(1 << bit);
        self.free_count += 1;
        true
    }

    /// Bitmap conservation invariant (§8, property 1).
    fn audit(&self) -> bool {
        let mut set_bits: u64 = 0;
        for word in 0..self.words_used() {
            set_bits += self.bitmap[word].count_ones() as u64;
        }
        self.free_count + set_bits == self.total_frames
    }
}

/// Tracking entry recording which region a given allocated PFN came from. Only maintained once
/// the kernel heap exists (the PFA itself must work before then); frames allocated during paging
/// bootstrap are therefore permanently accounted, as spec.md §4.1 documents.
struct TrackingEntry {
    pfn: u64,
    region_index: usize,
}

struct MemoryLayout {
    regions: [MemoryRegion; MAX_REGIONS],
    num_regions: usize,
    /// `None` until the heap is up; `Some` thereafter.
    tracking: Option<alloc::vec::Vec<TrackingEntry>>,
}

impl MemoryLayout {
    const fn empty() -> Self {
        // Can't use an array-init-with-const-fn macro in const context across MAX_REGIONS easily
        // without `Default`, so build it field by field via a helper at init time instead.
        MemoryLayout {
            regions: [
                MemoryRegion::empty(), MemoryRegion::empty(), MemoryRegion::empty(), MemoryRegion::empty(),
                MemoryRegion::empty(), MemoryRegion::empty(), MemoryRegion::empty(), MemoryRegion::empty(),
                MemoryRegion::empty(), MemoryRegion::empty(), MemoryRegion::empty(), MemoryRegion::empty(),
                MemoryRegion::empty(), MemoryRegion::empty(), MemoryRegion::empty(), MemoryRegion::empty(),
            ],
            num_regions: 0,
            tracking: None,
        }
    }

    fn region_for_pfn(&self, region_index: usize) -> &MemoryRegion {
        &self.regions[region_index]
    }
}

/// A raw, unparsed description of a usable physical memory span, as read from the bootloader's
/// memory map (or an E820-style BIOS record). `start`/`end` are frame numbers, not addresses.
#[derive(Copy, Clone, Debug)]
pub struct RawRegion {
    pub start_frame: u64,
    pub end_frame: u64,
}

static LAYOUT: Mutex<MemoryLayout> = Mutex::new(MemoryLayout::empty());

/// Initialize the PFA from the raw usable-memory regions, excluding everything below
/// `LOW_MEM_CUTOFF`, then pre-mark the frames covering `[0, reserved_end_frame)` of each region as
/// allocated (the loaded kernel image plus the allocator's own metadata -- which is the static
/// array above, already counted as part of the kernel image by construction).
pub fn init(raw: &[RawRegion], reserved_end_frame: u64) {
    let mut layout = LAYOUT.lock();
    let cutoff_frame = LOW_MEM_CUTOFF / FRAME_SIZE;

    let mut n = 0;
    for r in raw {
        if n >= MAX_REGIONS {
            printk!("pfa: dropping region, MAX_REGIONS exceeded\n");
            break;
        }
        let start = core::cmp::max(r.start_frame, cutoff_frame);
        if start >= r.end_frame {
            continue;
        }
        let total = r.end_frame - start;
        if (total as usize + 63) / 64 > MAX_WORDS_PER_REGION {
            printk!("pfa: region too large, truncating bitmap capacity\n");
        }

        layout.regions[n] = MemoryRegion {
            start_pfn: start,
            total_frames: total,
            free_count: total,
            bitmap: [0; MAX_WORDS_PER_REGION],
        };

        // Pre-mark frames covered by the kernel image + our own metadata.
        if reserved_end_frame > start {
            let reserved_count = core::cmp::min(reserved_end_frame - start, total);
            layout.regions[n].mark_allocated(0, reserved_count);
        }

        n += 1;
    }
    layout.num_regions = n;

    let total_free: u64 = layout.regions[..n].iter().map(|r| r.free_count).sum();
    printk!("\tpfa inited - {} regions, {} free frames\n", n, total_free);
}

/// Called once the kernel heap is available; from this point forward, `allocate` records which
/// region each returned PFN came from so that `release` can find it again.
pub fn enable_tracking() {
    LAYOUT.lock().tracking = Some(alloc::vec::Vec::new());
}

/// First-fit scan across regions, then within a region word-at-a-time then bit-at-a-time.
/// Returns `OUT_OF_MEMORY` if no region has a free frame.
pub fn allocate() -> u64 {
    let mut layout = LAYOUT.lock();
    let num_regions = layout.num_regions;
    for region_index in 0..num_regions {
        if let Some(index) = layout.regions[region_index].find_free() {
            layout.regions[region_index].set_allocated(index);
            let pfn = layout.regions[region_index].start_pfn + index;
            if let Some(tracking) = layout.tracking.as_mut() {
                tracking.push(TrackingEntry { pfn, region_index });
            }
            return pfn;
        }
    }
    OUT_OF_MEMORY
}

/// Release a previously-allocated frame. A no-op (logged) for an untracked PFN -- this only
/// happens for frames allocated before the heap existed, which are permanently accounted per
/// spec.md §4.1. Double-free (bit already clear) is treated as fatal.
pub fn release(pfn: u64) {
    let mut layout = LAYOUT.lock();
    let tracking_index = layout
        .tracking
        .as_ref()
        .and_then(|t| t.iter().position(|e| e.pfn == pfn));

    let region_index = match tracking_index {
        Some(ti) => layout.tracking.as_ref().unwrap()[ti].region_index,
        None => {
            printk!("pfa: release of untracked pfn {:#x}, ignored\n", pfn);
            return;
        }
    };

    let start_pfn = layout.regions[region_index].start_pfn;
    let index = pfn - start_pfn;
    if !layout.regions[region_index].clear_allocated(index) {
        panic!("pfa: double free of pfn {:#x}", pfn);
    }

    if let Some(ti) = tracking_index {
        layout.tracking.as_mut().unwrap().swap_remove(ti);
    }
}

/// Bitmap-conservation audit (§8 property 1) over every region. Used by tests and a debug path.
pub fn audit() -> bool {
    let layout = LAYOUT.lock();
    layout.regions[..layout.num_regions].iter().all(|r| r.audit())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(total: u64) -> MemoryRegion {
        MemoryRegion {
            start_pfn: 0,
            total_frames: total,
            free_count: total,
            bitmap: [0; MAX_WORDS_PER_REGION],
        }
    }

    #[test]
    fn first_fit_is_monotonic_until_freed() {
        let mut r = region(200);
        let a = r.find_free().unwrap();
        r.set_allocated(a);
        let b = r.find_free().unwrap();
        r.set_allocated(b);
        assert_eq!(a, 0);
        assert_eq!(b, 1);
        assert!(r.audit());
    }

    #[test]
    fn release_then_allocate_reuses_lowest_free_slot() {
        let mut r = region(10);
        let a = r.find_free().unwrap();
        r.set_allocated(a);
        let b = r.find_free().unwrap();
        r.set_allocated(b);
        assert!(r.clear_allocated(a));
        let c = r.find_free().unwrap();
        assert_eq!(c, a);
        assert!(r.audit());
    }

    #[test]
    fn double_free_is_detected() {
        let mut r = region(4);
        let a = r.find_free().unwrap();
        r.set_allocated(a);
        assert!(r.clear_allocated(a));
        assert!(!r.clear_allocated(a));
    }

    #[test]
    fn exhaustion_returns_none() {
        let mut r = region(2);
        let a = r.find_free().unwrap();
        r.set_allocated(a);
        let b = r.find_free().unwrap();
        r.set_allocated(b);
        assert!(r.find_free().is_none());
    }
}
