//! ELF64 program loader.
//!
//! Maps PT_LOAD segments of an in-memory image into the shared address space
//! and hands back the entry point; the caller invokes it with the kernel
//! table pointer in RDI per the SysV calling convention.

use elf_rs::{Elf, ElfFile, ProgramType};

use crate::error::{KernelError, KernelResult};
use crate::pmm::{PAGE_SIZE, PMM};
use crate::vmm::VMM;
use amd64::paging::PTE;

const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;
const EM_X86_64: u16 = 0x3E;
const ET_EXEC: u16 = 2;
const ET_DYN: u16 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadError {
    InvalidMagic,
    InvalidClass,
    InvalidEndian,
    InvalidMachine,
    InvalidType,
    LoadFailed,
}

/// Checks the raw ELF identification bytes before handing the image to
/// `elf_rs`, so validation failures are reported with the exact reason named
/// in §4.6 rather than collapsed into a single parse error.
fn validate_header(data: &[u8]) -> Result<(), LoadError> {
    if data.len() < 20 || data[0..4] != ELF_MAGIC {
        return Err(LoadError::InvalidMagic);
    }
    if data[4] != ELFCLASS64 {
        return Err(LoadError::InvalidClass);
    }
    if data[5] != ELFDATA2LSB {
        return Err(LoadError::InvalidEndian);
    }

    let e_type = u16::from_le_bytes([data[16], data[17]]);
    let e_machine = u16::from_le_bytes([data[18], data[19]]);

    if e_machine != EM_X86_64 {
        return Err(LoadError::InvalidMachine);
    }
    if e_type != ET_EXEC && e_type != ET_DYN {
        return Err(LoadError::InvalidType);
    }

    Ok(())
}

/// Loads every PT_LOAD segment of `data` into the running address space and
/// returns the entry point. Per-segment `p_flags` is read but not enforced
/// (§9 open question: left unenforced, matching the loaded image's own
/// intent rather than hardening it here).
pub fn load(data: &'static [u8]) -> KernelResult<u64> {
    validate_header(data).map_err(KernelError::MalformedElf)?;

    let elf = match Elf::from_bytes(data).map_err(|_| KernelError::MalformedElf(LoadError::LoadFailed))? {
        Elf::Elf64(elf) => elf,
        Elf::Elf32(_) => return Err(KernelError::MalformedElf(LoadError::InvalidClass)),
    };

    for phdr in elf.program_headers().iter().filter(|p| p.ph_type() == ProgramType::LOAD) {
        let vaddr = phdr.vaddr();
        let memsz = phdr.memsz();
        let filesz = phdr.filesz();
        let file_offset = phdr.offset();

        let page_size = PAGE_SIZE as u64;
        let start = vaddr & !(page_size - 1);
        let end = (vaddr + memsz + page_size - 1) & !(page_size - 1);

        let mut page = start;
        while page < end {
            let phys = PMM.lock().allocate_page().ok_or(KernelError::OutOfMemory)?;
            VMM.lock()
                .map_page(&mut PMM.lock(), page, phys, PTE::WRITE, 0)
                .map_err(|_| KernelError::MalformedElf(LoadError::LoadFailed))?;
            page += page_size;
        }

        unsafe {
            let src = data.as_ptr().add(file_offset as usize);
            let dst = vaddr as *mut u8;
            core::ptr::copy_nonoverlapping(src, dst, filesz as usize);
            core::ptr::write_bytes(dst.add(filesz as usize), 0, (memsz - filesz) as usize);
        }
    }

    Ok(elf.entry_point())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_bad_magic() {
        let data = [0u8; 20];
        assert_eq!(validate_header(&data), Err(LoadError::InvalidMagic));
    }

    #[test]
    fn rejects_32_bit_class() {
        let mut data = [0u8; 20];
        data[0..4].copy_from_slice(&ELF_MAGIC);
        data[4] = 1; // ELFCLASS32
        assert_eq!(validate_header(&data), Err(LoadError::InvalidClass));
    }

    #[test]
    fn rejects_big_endian() {
        let mut data = [0u8; 20];
        data[0..4].copy_from_slice(&ELF_MAGIC);
        data[4] = ELFCLASS64;
        data[5] = 2; // ELFDATA2MSB
        assert_eq!(validate_header(&data), Err(LoadError::InvalidEndian));
    }

    #[test]
    fn rejects_wrong_machine() {
        let mut data = [0u8; 20];
        data[0..4].copy_from_slice(&ELF_MAGIC);
        data[4] = ELFCLASS64;
        data[5] = ELFDATA2LSB;
        data[16..18].copy_from_slice(&ET_EXEC.to_le_bytes());
        data[18..20].copy_from_slice(&0xABCDu16.to_le_bytes());
        assert_eq!(validate_header(&data), Err(LoadError::InvalidMachine));
    }

    #[test]
    fn accepts_well_formed_header() {
        let mut data = [0u8; 20];
        data[0..4].copy_from_slice(&ELF_MAGIC);
        data[4] = ELFCLASS64;
        data[5] = ELFDATA2LSB;
        data[16..18].copy_from_slice(&ET_EXEC.to_le_bytes());
        data[18..20].copy_from_slice(&EM_X86_64.to_le_bytes());
        assert_eq!(validate_header(&data), Ok(()));
    }
}
