//! Virtual memory manager: owns the kernel's top-level page table, maps the
//! HHDM and kernel image at init, and exposes `map_page`/`map_huge_page` for
//! everything that comes after (heap, ELF loader).

use amd64::paging::{
    pdpt_index, pdt_index, pml4t_index, pt_index, PDE_MAPPED_SIZE, PTE,
};
use amd64::registers::CR3;
use spin::Mutex;

use crate::boot::BootInfo;
use crate::error::{KernelError, KernelResult};
use crate::pmm::{Pmm, PAGE_SIZE};

type Table = [PTE; 512];

pub static VMM: Mutex<Vmm> = Mutex::new(Vmm::new_invalid());

pub struct Vmm {
    hhdm_offset: u64,
    pml4_phys: u64,
}

unsafe impl Send for Vmm {}

impl Vmm {
    pub const fn new_invalid() -> Self {
        Self { hhdm_offset: 0, pml4_phys: 0 }
    }

    pub fn phys_to_virt(&self, paddr: u64) -> u64 {
        paddr + self.hhdm_offset
    }

    pub fn virt_to_phys(&self, vaddr: u64) -> u64 {
        vaddr - self.hhdm_offset
    }

    fn table_mut(&self, phys: u64) -> &'static mut Table {
        unsafe { &mut *(self.phys_to_virt(phys) as *mut Table) }
    }

    /// Allocates a zeroed physical page and returns its address, or `OutOfMemory`.
    fn alloc_table(&self, pmm: &mut Pmm) -> KernelResult<u64> {
        let phys = pmm.allocate_page().ok_or(KernelError::OutOfMemory)?;
        self.table_mut(phys).fill(PTE::empty());
        Ok(phys)
    }

    /// Builds the kernel's own PML4: identity-maps all physical memory at the
    /// HHDM offset and maps the kernel image, then loads CR3.
    pub fn init(&mut self, boot: &BootInfo, pmm: &mut Pmm) -> KernelResult<()> {
        self.hhdm_offset = boot.hhdm_offset;
        self.pml4_phys = self.alloc_table(pmm)?;

        for region in boot.memory_regions() {
            let vbase = region.base + boot.hhdm_offset;
            self.map_region(pmm, vbase, region.base, region.length, PTE::WRITE | PTE::NO_EXECUTE, 0)?;
        }

        let kernel_size = boot
            .memory_regions()
            .iter()
            .filter(|r| r.kind == crate::boot::MemoryRegionKind::KernelAndModules)
            .map(|r| r.length)
            .max()
            .unwrap_or(PDE_MAPPED_SIZE);

        self.map_region(
            pmm,
            boot.kernel_virtual_base,
            boot.kernel_physical_base,
            kernel_size,
            PTE::WRITE,
            0,
        )?;

        unsafe {
            CR3::set_nflags(self.pml4_phys as usize);
        }

        Ok(())
    }

    /// Maps `[paddr, paddr+len)` at `vaddr`, using 2 MiB pages wherever the
    /// remaining range and alignment allow, 4 KiB otherwise.
    fn map_region(&mut self, pmm: &mut Pmm, vaddr: u64, paddr: u64, len: u64, flags: PTE, pks_key: u8) -> KernelResult<()> {
        let mut offset = 0u64;
        while offset < len {
            let v = vaddr + offset;
            let p = paddr + offset;
            let remaining = len - offset;

            if v % PDE_MAPPED_SIZE == 0 && p % PDE_MAPPED_SIZE == 0 && remaining >= PDE_MAPPED_SIZE {
                // 2 MiB HHDM leaves are R/W only; NX applies to the 4 KiB path below.
                self.map_huge_page(pmm, v, p, flags - PTE::NO_EXECUTE, pks_key)?;
                offset += PDE_MAPPED_SIZE;
            } else {
                self.map_page(pmm, v, p, flags, pks_key)?;
                offset += PAGE_SIZE as u64;
            }
        }
        Ok(())
    }

    /// Walks PML4→PDPT→PD, allocating missing intermediate tables, and
    /// installs `paddr` as a leaf 4 KiB PTE with `flags` and `pks_key`.
    pub fn map_page(&mut self, pmm: &mut Pmm, vaddr: u64, paddr: u64, flags: PTE, pks_key: u8) -> KernelResult<()> {
        let pt_phys = self.walk_to_pt(pmm, vaddr)?;
        let pt = self.table_mut(pt_phys);
        let key_bits = PTE::from_bits_truncate((pks_key as u64) << 59);
        pt[pt_index(vaddr)] = PTE::from_paddr(paddr & PTE::BASE_MASK.bits()) | flags | key_bits | PTE::PRESENT;
        invlpg(vaddr);
        Ok(())
    }

    /// Walks PML4→PDPT only, then installs a huge (2 MiB) leaf PD entry.
    /// `paddr` must already be 2 MiB-aligned.
    pub fn map_huge_page(&mut self, pmm: &mut Pmm, vaddr: u64, paddr: u64, flags: PTE, pks_key: u8) -> KernelResult<()> {
        let pd_phys = self.walk_to_pd(pmm, vaddr)?;
        let pd = self.table_mut(pd_phys);
        let key_bits = PTE::from_bits_truncate((pks_key as u64) << 59);
        pd[pdt_index(vaddr)] =
            PTE::from_paddr(paddr & PTE::BASE_MASK.bits()) | flags | key_bits | PTE::PRESENT | PTE::HUGE_PAGE;
        invlpg(vaddr);
        Ok(())
    }

    fn walk_to_pd(&mut self, pmm: &mut Pmm, vaddr: u64) -> KernelResult<u64> {
        let pml4 = self.table_mut(self.pml4_phys);
        let pdpt_phys = branch(pml4, pml4t_index(vaddr), |pmm| self.alloc_table(pmm), pmm)?;
        let pdpt = self.table_mut(pdpt_phys);
        branch(pdpt, pdpt_index(vaddr), |pmm| self.alloc_table(pmm), pmm)
    }

    fn walk_to_pt(&mut self, pmm: &mut Pmm, vaddr: u64) -> KernelResult<u64> {
        let pd_phys = self.walk_to_pd(pmm, vaddr)?;
        let pd = self.table_mut(pd_phys);
        branch(pd, pdt_index(vaddr), |pmm| self.alloc_table(pmm), pmm)
    }
}

/// Returns the physical address referenced by `table[index]`, allocating and
/// installing an intermediate table if the entry is not yet present.
/// Intermediate entries carry no PKS key; only leaves do.
fn branch(table: &mut Table, index: usize, alloc: impl FnOnce(&mut Pmm) -> KernelResult<u64>, pmm: &mut Pmm) -> KernelResult<u64> {
    let entry = table[index];
    if entry.contains(PTE::PRESENT) {
        Ok(entry.get_paddr())
    } else {
        let phys = alloc(pmm)?;
        table[index] = PTE::from_paddr(phys) | PTE::PRESENT | PTE::WRITE;
        Ok(phys)
    }
}

fn invlpg(vaddr: u64) {
    unsafe {
        core::arch::asm!("invlpg [{}]", in(reg) vaddr, options(nostack, preserves_flags));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pte_preserves_protection_key_bits() {
        let key: u64 = 0b1011;
        let pte = PTE::from_paddr(0x4000) | PTE::WRITE | PTE::from_bits_truncate(key << 59) | PTE::PRESENT;
        assert_eq!((pte.bits() & PTE::PROTECTION_KEY_MASK.bits()) >> 59, key);
        assert_eq!(pte.get_paddr(), 0x4000);
        assert!(pte.contains(PTE::WRITE | PTE::PRESENT));
    }

    #[test]
    fn huge_page_entry_sets_huge_bit() {
        let pte = PTE::from_paddr(0x20_0000) | PTE::WRITE | PTE::PRESENT | PTE::HUGE_PAGE;
        assert!(pte.contains(PTE::HUGE_PAGE));
        assert_eq!(pte.get_paddr(), 0x20_0000);
    }

    #[test]
    fn huge_hhdm_flags_drop_no_execute() {
        // §4.2: 2 MiB HHDM mappings are R/W only; NX applies to the 4 KiB path.
        let hhdm_flags = PTE::WRITE | PTE::NO_EXECUTE;
        let huge_flags = hhdm_flags - PTE::NO_EXECUTE;
        assert!(huge_flags.contains(PTE::WRITE));
        assert!(!huge_flags.contains(PTE::NO_EXECUTE));
    }
}
