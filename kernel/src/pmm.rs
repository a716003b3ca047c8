//! Bitmap physical memory manager.
//!
//! One bit per 4 KiB page; bit set means "not free." Placed itself inside a
//! usable region it discovers during init, reserved immediately after.

use spin::Mutex;

use crate::boot::{BootInfo, MemoryRegionKind};
use crate::error::{KernelError, KernelResult};

pub const PAGE_SIZE: usize = 0x1000;
const RESERVED_LOW_MEM: u64 = 0x100000;

pub static PMM: Mutex<Pmm> = Mutex::new(Pmm::new_invalid());

pub struct Pmm {
    hhdm_offset: u64,
    bitmap_base: *mut u8,
    bitmap_len: usize,
    total_pages: usize,
    last_used_index: usize,
}

unsafe impl Send for Pmm {}

impl Pmm {
    pub const fn new_invalid() -> Self {
        Self { hhdm_offset: 0, bitmap_base: core::ptr::null_mut(), bitmap_len: 0, total_pages: 0, last_used_index: 0 }
    }

    fn phys_to_virt(&self, paddr: u64) -> *mut u8 {
        (paddr + self.hhdm_offset) as *mut u8
    }

    fn bitmap(&mut self) -> &mut [u8] {
        unsafe { core::slice::from_raw_parts_mut(self.bitmap_base, self.bitmap_len) }
    }

    /// Scans the bootloader memory map, places the bitmap in a usable region,
    /// and reserves everything not explicitly usable. Must run exactly once.
    pub fn init(&mut self, boot: &BootInfo) -> KernelResult<()> {
        self.hhdm_offset = boot.hhdm_offset;

        let mut max_address: u64 = 0;
        for region in boot.memory_regions() {
            if matches!(
                region.kind,
                MemoryRegionKind::Usable | MemoryRegionKind::BootloaderReclaimable | MemoryRegionKind::KernelAndModules
            ) {
                max_address = max_address.max(region.base + region.length);
            }
        }

        let total_pages = (max_address as usize + PAGE_SIZE - 1) / PAGE_SIZE;
        let bitmap_bytes = (total_pages + 7) / 8;

        let bitmap_region = boot
            .memory_regions()
            .iter()
            .find(|r| r.kind == MemoryRegionKind::Usable && r.length as usize >= bitmap_bytes)
            .ok_or(KernelError::OutOfMemory)?;

        self.bitmap_base = self.phys_to_virt(bitmap_region.base);
        self.bitmap_len = bitmap_bytes;
        self.total_pages = total_pages;
        self.last_used_index = 0;

        self.bitmap().fill(0xFF);

        for region in boot.memory_regions() {
            if region.kind != MemoryRegionKind::Usable {
                continue;
            }
            let start_page = (region.base / PAGE_SIZE as u64) as usize;
            let end_page = ((region.base + region.length) / PAGE_SIZE as u64) as usize;
            clear_bits(self.bitmap(), start_page, end_page);
        }

        let bitmap_start_page = (bitmap_region.base / PAGE_SIZE as u64) as usize;
        let bitmap_page_count = (bitmap_bytes + PAGE_SIZE - 1) / PAGE_SIZE;
        set_bits(self.bitmap(), bitmap_start_page, bitmap_start_page + bitmap_page_count);

        let low_mem_pages = (RESERVED_LOW_MEM as usize) / PAGE_SIZE;
        set_bits(self.bitmap(), 0, low_mem_pages.min(total_pages));

        Ok(())
    }

    /// First-fit search for `n` consecutive free pages starting from the roving
    /// cursor, wrapping once. Returns the base physical address, or `None` (OOM).
    pub fn allocate_pages(&mut self, n: usize) -> Option<u64> {
        if n == 0 || n > self.total_pages {
            return None;
        }

        let start = self.last_used_index;
        let total_pages = self.total_pages;
        let found = find_clear_run(self.bitmap(), start, total_pages, n)
            .or_else(|| find_clear_run(self.bitmap(), 0, start, n));

        let base_page = found?;
        set_bits(self.bitmap(), base_page, base_page + n);
        self.last_used_index = base_page + n;
        Some(base_page as u64 * PAGE_SIZE as u64)
    }

    pub fn allocate_page(&mut self) -> Option<u64> {
        self.allocate_pages(1)
    }

    /// Clears `n` bits starting at `base/PAGE_SIZE`. Out-of-range indices are
    /// silently ignored; the caller is always the sole owner of a valid range.
    pub fn free_pages(&mut self, base: u64, n: usize) {
        let base_page = (base / PAGE_SIZE as u64) as usize;
        let total_pages = self.total_pages;
        let end_page = (base_page + n).min(total_pages);
        if base_page >= total_pages {
            return;
        }
        clear_bits(self.bitmap(), base_page, end_page);
        if base_page < self.last_used_index {
            self.last_used_index = base_page;
        }
    }

    pub fn total_pages(&self) -> usize {
        self.total_pages
    }
}

fn set_bits(bitmap: &mut [u8], start: usize, end: usize) {
    for page in start..end {
        bitmap[page / 8] |= 1 << (page % 8);
    }
}

fn clear_bits(bitmap: &mut [u8], start: usize, end: usize) {
    for page in start..end {
        bitmap[page / 8] &= !(1 << (page % 8));
    }
}

fn test_bit(bitmap: &[u8], page: usize) -> bool {
    bitmap[page / 8] & (1 << (page % 8)) != 0
}

/// Finds the first run of `n` clear bits within `[from, to)`, lowest index wins.
fn find_clear_run(bitmap: &[u8], from: usize, to: usize, n: usize) -> Option<usize> {
    let mut run_start = from;
    let mut run_len = 0;
    for page in from..to {
        if test_bit(bitmap, page) {
            run_len = 0;
            run_start = page + 1;
        } else {
            run_len += 1;
            if run_len == n {
                return Some(run_start);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_clear_round_trip() {
        let mut bitmap = [0u8; 4];
        set_bits(&mut bitmap, 0, 5);
        assert_eq!(bitmap[0], 0b0001_1111);
        clear_bits(&mut bitmap, 1, 3);
        assert_eq!(bitmap[0], 0b0001_1001);
        assert!(test_bit(&bitmap, 0));
        assert!(!test_bit(&bitmap, 1));
        assert!(test_bit(&bitmap, 4));
    }

    #[test]
    fn find_run_skips_reserved_pages() {
        let mut bitmap = [0xFFu8; 4];
        clear_bits(&mut bitmap, 10, 14);
        assert_eq!(find_clear_run(&bitmap, 0, 32, 4), Some(10));
        assert_eq!(find_clear_run(&bitmap, 0, 32, 5), None);
    }

    #[test]
    fn lowest_index_run_wins() {
        let mut bitmap = [0xFFu8; 8];
        clear_bits(&mut bitmap, 3, 6);
        clear_bits(&mut bitmap, 20, 30);
        assert_eq!(find_clear_run(&bitmap, 0, 64, 3), Some(3));
    }
}
