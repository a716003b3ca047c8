#![no_std]
#![no_main]

#![feature(alloc_error_handler)]

use core::alloc::Layout;
use core::panic::PanicInfo;

use libkernel::{boot, cfg, err, heap, interrupts, keyboard, log, out::terminal, pks, pmm, shell, vmm, warn};

#[alloc_error_handler]
fn alloc_error_handler(layout: Layout) -> ! {
    err!("allocator error: {:?}", layout);
    amd64::hlt_loop();
}

/// Boot entry point (§2 "Boot sequence"). Order is load-bearing throughout:
/// descriptor tables before anything that can fault, PMM before VMM before
/// heap, every subsystem quiesced before `sti` flips interrupts live.
#[no_mangle]
pub extern "C" fn _start() -> ! {
    log!("Kernel Started");

    interrupts::install_gdt();
    log!("GDT Initialized");

    interrupts::install_idt();
    log!("IDT Initialized");

    let boot_info = match boot::collect() {
        Ok(info) => info,
        Err(reason) => {
            err!("failed to collect boot info: {}", reason);
            amd64::hlt_loop();
        }
    };
    log!("Base Revision Supported");

    // Absence is tolerated either way (`pks` module); whether it's reported as
    // a warning or an error only reflects whether this build expected it.
    if pks::init() {
        log!("PKS: Enabled");
    } else if cfg::expect_pks_bool() {
        err!("PKS: Not supported");
    } else {
        warn!("PKS: Not supported");
    }

    interrupts::remap_and_mask_pic();

    pmm::PMM.lock().init(&boot_info).unwrap_or_else(|reason| {
        err!("pmm init failed: {}", reason);
        amd64::hlt_loop();
    });
    log!("PMM: Initialization Complete");

    vmm::VMM.lock().init(&boot_info, &mut pmm::PMM.lock()).unwrap_or_else(|reason| {
        err!("vmm init failed: {}", reason);
        amd64::hlt_loop();
    });
    log!("VMM: Initialization Complete");

    heap::init(boot_info.hhdm_offset);

    interrupts::init_lapic(&mut pmm::PMM.lock(), &mut vmm::VMM.lock());
    interrupts::init_ioapic(&mut pmm::PMM.lock(), &mut vmm::VMM.lock());
    interrupts::install_irq_gate(interrupts::KEYBOARD_VECTOR, keyboard::keyboard_interrupt);
    interrupts::set_irq(1, interrupts::KEYBOARD_VECTOR, 0);

    // The bootloader's framebuffer response carries no explicit channel-order
    // tag in the flattened `BootInfo`; every target this has booted on
    // reports BGRA, so that is the fixed assumption here.
    if let Some(fb) = boot_info.framebuffer {
        let frame_buffer = unsafe {
            libkernel::out::framebuffer::FrameBuffer::new(
                fb.address, fb.width, fb.height, fb.pitch, libkernel::out::framebuffer::PixelFormat::BGRA,
            )
        };
        terminal::TERM1.lock().install_framebuffer(frame_buffer);
    }

    amd64::interrupts::sti();

    shell::run(&boot_info);
}

#[panic_handler]
fn panic_handler(info: &PanicInfo) -> ! {
    amd64::interrupts::cli();
    err!("{}", info);
    amd64::hlt_loop();
}
