//! The kernel-table ABI: the sole user↔kernel interface in this SASOS model,
//! replacing a `syscall` trap gateway with a fixed-layout function-pointer
//! record handed to every loaded program as its first argument.

use crate::keyboard::KEYBOARD;
use crate::out::uart::UART_COM1;
use crate::pmm::PMM;
use crate::vmm::VMM;

pub const MAGIC: u64 = 0xDEADC0DE;

/// Calibrated against QEMU `-cpu max`; not derived from any timer (§9 open question).
const SLEEP_ITERS_PER_MS: u64 = 1_000_000;

pub type LogFn = extern "C" fn(*const u8, usize);
pub type DrawRectFn = extern "C" fn(u32, u32, u32, u32, u32);
pub type PollKeyFn = extern "C" fn() -> u8;
pub type SleepMsFn = extern "C" fn(u64);
pub type AllocPagesFn = extern "C" fn(u64) -> *mut u8;

/// Fixed-layout, C-ABI record: magic followed by five function pointers, each
/// field 8 bytes, total 48 bytes. Field offsets are part of the contract.
#[repr(C)]
pub struct KernelTable {
    pub magic: u64,
    pub log: LogFn,
    pub draw_rect: DrawRectFn,
    pub poll_key: PollKeyFn,
    pub sleep_ms: SleepMsFn,
    pub alloc_pages: AllocPagesFn,
}

impl KernelTable {
    pub const fn new() -> Self {
        Self {
            magic: MAGIC,
            log: kt_log,
            draw_rect: kt_draw_rect,
            poll_key: kt_poll_key,
            sleep_ms: kt_sleep_ms,
            alloc_pages: kt_alloc_pages,
        }
    }
}

/// The single global instance; its address is passed in RDI to every loaded
/// entry point. Constructed once, never mutated after.
pub static KERNEL_TABLE: KernelTable = KernelTable::new();

/// Writes `len` bytes verbatim to the serial port. No prefix, no trailing newline.
extern "C" fn kt_log(ptr: *const u8, len: usize) {
    let bytes = unsafe { core::slice::from_raw_parts(ptr, len) };
    let mut uart = UART_COM1.0.lock();
    for &byte in bytes {
        uart.write_byte(byte);
    }
}

/// Fills a rectangle in 32-bit ARGB (`0xAARRGGBB`); out-of-bounds pixels are
/// clipped; no-op if no framebuffer was ever installed.
extern "C" fn kt_draw_rect(x: u32, y: u32, w: u32, h: u32, color: u32) {
    use crate::out::framebuffer::Color;
    use crate::out::terminal::TERM1;

    let argb = color.to_be_bytes();
    let color = Color::new(argb[1], argb[2], argb[3], argb[0]);

    let mut term = TERM1.lock();
    if let Some(fb) = term.framebuffer_mut() {
        let (x, y, w, h) = (x as usize, y as usize, w as usize, h as usize);
        let clipped_w = w.min(fb.width.saturating_sub(x));
        let clipped_h = h.min(fb.height.saturating_sub(y));
        if clipped_w > 0 && clipped_h > 0 {
            unsafe { fb.fill_rect(x, y, clipped_w, clipped_h, color) };
        }
    }
}

/// Returns the next buffered ASCII byte, or 0 for "no key." Never blocks.
extern "C" fn kt_poll_key() -> u8 {
    KEYBOARD.lock().pop().unwrap_or(0)
}

/// Busy-waits approximately `ms` milliseconds (§9: documented heuristic,
/// to be replaced once a timer exists).
extern "C" fn kt_sleep_ms(ms: u64) {
    let iters = ms.saturating_mul(SLEEP_ITERS_PER_MS);
    for _ in 0..iters {
        core::hint::spin_loop();
    }
}

/// Allocates `n` contiguous physical pages, returns their HHDM virtual
/// address, or null on OOM.
extern "C" fn kt_alloc_pages(n: u64) -> *mut u8 {
    match PMM.lock().allocate_pages(n as usize) {
        Some(phys) => VMM.lock().phys_to_virt(phys) as *mut u8,
        None => core::ptr::null_mut(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::size_of;

    #[test]
    fn layout_is_exactly_48_bytes() {
        assert_eq!(size_of::<KernelTable>(), 48);
    }

    #[test]
    fn field_offsets_match_the_contract() {
        let table = KernelTable::new();
        let base = &table as *const _ as usize;
        assert_eq!(&table.magic as *const _ as usize - base, 0);
        assert_eq!(&table.log as *const _ as usize - base, 8);
        assert_eq!(&table.draw_rect as *const _ as usize - base, 16);
        assert_eq!(&table.poll_key as *const _ as usize - base, 24);
        assert_eq!(&table.sleep_ms as *const _ as usize - base, 32);
        assert_eq!(&table.alloc_pages as *const _ as usize - base, 40);
    }

    #[test]
    fn magic_matches_documented_constant() {
        assert_eq!(KernelTable::new().magic, 0xDEADC0DE);
    }
}
