//! Limine handoff.
//!
//! Request statics live here and nowhere else; everything downstream of
//! `collect()` reads a plain `BootInfo` instead of `limine` response types,
//! so a future protocol bump only touches this file.

use limine::{
    LimineFramebufferRequest, LimineHhdmRequest, LimineKernelAddressRequest,
    LimineMemmapRequest, LimineMemoryMapEntryType, LimineModuleRequest,
};

use crate::error::{KernelError, KernelResult};

static BASE_REVISION: limine::LimineBaseRevision = limine::LimineBaseRevision::new(2);

#[used]
#[link_section = ".requests"]
static MEMMAP_REQUEST: LimineMemmapRequest = LimineMemmapRequest::new(0);

#[used]
#[link_section = ".requests"]
static HHDM_REQUEST: LimineHhdmRequest = LimineHhdmRequest::new(0);

#[used]
#[link_section = ".requests"]
static FRAMEBUFFER_REQUEST: LimineFramebufferRequest = LimineFramebufferRequest::new(0);

#[used]
#[link_section = ".requests"]
static KERNEL_ADDRESS_REQUEST: LimineKernelAddressRequest = LimineKernelAddressRequest::new(0);

#[used]
#[link_section = ".requests"]
static MODULE_REQUEST: LimineModuleRequest = LimineModuleRequest::new(0);

pub const MAX_MEMORY_REGIONS: usize = 64;
pub const MAX_MODULES: usize = 16;
const MAX_MODULE_PATH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryRegionKind {
    Usable,
    Reserved,
    AcpiReclaimable,
    AcpiNvs,
    BadMemory,
    BootloaderReclaimable,
    KernelAndModules,
    Framebuffer,
}

impl From<LimineMemoryMapEntryType> for MemoryRegionKind {
    fn from(kind: LimineMemoryMapEntryType) -> Self {
        match kind {
            LimineMemoryMapEntryType::Usable => MemoryRegionKind::Usable,
            LimineMemoryMapEntryType::Reserved => MemoryRegionKind::Reserved,
            LimineMemoryMapEntryType::AcpiReclaimable => MemoryRegionKind::AcpiReclaimable,
            LimineMemoryMapEntryType::AcpiNvs => MemoryRegionKind::AcpiNvs,
            LimineMemoryMapEntryType::BadMemory => MemoryRegionKind::BadMemory,
            LimineMemoryMapEntryType::BootloaderReclaimable => MemoryRegionKind::BootloaderReclaimable,
            LimineMemoryMapEntryType::KernelAndModules => MemoryRegionKind::KernelAndModules,
            LimineMemoryMapEntryType::Framebuffer => MemoryRegionKind::Framebuffer,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    pub base: u64,
    pub length: u64,
    pub kind: MemoryRegionKind,
}

impl Default for MemoryRegion {
    fn default() -> Self {
        Self { base: 0, length: 0, kind: MemoryRegionKind::Reserved }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FramebufferInfo {
    pub address: *mut u8,
    pub width: usize,
    pub height: usize,
    pub pitch: usize,
    pub bpp: u16,
}

#[derive(Clone, Copy)]
pub struct ModuleInfo {
    path_buf: [u8; MAX_MODULE_PATH],
    path_len: usize,
    pub address: *mut u8,
    pub size: usize,
}

impl Default for ModuleInfo {
    fn default() -> Self {
        Self { path_buf: [0; MAX_MODULE_PATH], path_len: 0, address: core::ptr::null_mut(), size: 0 }
    }
}

impl ModuleInfo {
    pub fn path(&self) -> &str {
        core::str::from_utf8(&self.path_buf[..self.path_len]).unwrap_or("")
    }
}

/// Flattened, owned snapshot of everything the kernel needs from the bootloader.
/// Assembled once in `collect()`; nothing downstream touches a `limine` type again.
pub struct BootInfo {
    pub hhdm_offset: u64,
    pub kernel_virtual_base: u64,
    pub kernel_physical_base: u64,
    memory_regions: [MemoryRegion; MAX_MEMORY_REGIONS],
    memory_region_count: usize,
    pub framebuffer: Option<FramebufferInfo>,
    modules: [ModuleInfo; MAX_MODULES],
    module_count: usize,
}

impl BootInfo {
    pub fn memory_regions(&self) -> &[MemoryRegion] {
        &self.memory_regions[..self.memory_region_count]
    }

    pub fn modules(&self) -> &[ModuleInfo] {
        &self.modules[..self.module_count]
    }

    pub fn find_module(&self, needle: &str) -> Option<&ModuleInfo> {
        self.modules().iter().find(|m| m.path().contains(needle))
    }
}

/// Reads every live Limine response and assembles a `BootInfo`. Must run before
/// any other subsystem; a missing response here is always fatal (§7 "Missing
/// bootloader response at init").
pub fn collect() -> KernelResult<BootInfo> {
    if !BASE_REVISION.is_supported() {
        return Err(KernelError::MissingBootResponse("base revision"));
    }

    let hhdm = HHDM_REQUEST.get_response().get().ok_or(KernelError::MissingBootResponse("hhdm"))?;
    let kernel_address = KERNEL_ADDRESS_REQUEST
        .get_response()
        .get()
        .ok_or(KernelError::MissingBootResponse("kernel address"))?;
    let memmap = MEMMAP_REQUEST.get_response().get().ok_or(KernelError::MissingBootResponse("memmap"))?;

    let mut memory_regions = [MemoryRegion::default(); MAX_MEMORY_REGIONS];
    let mut memory_region_count = 0;
    for entry in memmap.memmap().iter().take(MAX_MEMORY_REGIONS) {
        memory_regions[memory_region_count] = MemoryRegion {
            base: entry.base,
            length: entry.len,
            kind: MemoryRegionKind::from(entry.typ),
        };
        memory_region_count += 1;
    }

    let framebuffer = FRAMEBUFFER_REQUEST.get_response().get().and_then(|resp| {
        resp.framebuffers().first().map(|fb| FramebufferInfo {
            address: fb.address.as_ptr().unwrap_or(core::ptr::null_mut()),
            width: fb.width as usize,
            height: fb.height as usize,
            pitch: fb.pitch as usize,
            bpp: fb.bpp,
        })
    });

    let mut modules = [ModuleInfo::default(); MAX_MODULES];
    let mut module_count = 0;
    if let Some(module_resp) = MODULE_REQUEST.get_response().get() {
        for module in module_resp.modules().iter().take(MAX_MODULES) {
            let mut info = ModuleInfo::default();
            let path_bytes = module.path.to_str().map(|s| s.to_bytes()).unwrap_or(&[]);
            let copy_len = path_bytes.len().min(MAX_MODULE_PATH);
            info.path_buf[..copy_len].copy_from_slice(&path_bytes[..copy_len]);
            info.path_len = copy_len;
            info.address = module.base.as_ptr().unwrap_or(core::ptr::null_mut());
            info.size = module.length as usize;
            modules[module_count] = info;
            module_count += 1;
        }
    }

    Ok(BootInfo {
        hhdm_offset: hhdm.offset,
        kernel_virtual_base: kernel_address.virtual_base,
        kernel_physical_base: kernel_address.physical_base,
        memory_regions,
        memory_region_count,
        framebuffer,
        modules,
        module_count,
    })
}
