//! The interrupt spine: GDT, IDT, common fault handler, LAPIC/IOAPIC bring-up,
//! and legacy-PIC quiescence (§4.4, §2 steps 2-5).
//!
//! Every vector shares one generated stub shape and one `InterruptFrame`
//! record instead of a pile of ad hoc per-vector assembly wrappers that could
//! disagree with each other about stack layout, so the dispatcher is a pure
//! function of the frame regardless of which vector fired.

use amd64::interrupts::{IntTrapGate, Ssdt};
use amd64::paging::PTE;
use amd64::ports::Port;
use amd64::registers::cr2_read;
use amd64::segmentation::{self, CodeSegDesc, DataSegDesc, SegSel};
use amd64::PrivLvl;
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::pmm::Pmm;
use crate::vmm::Vmm;

pub const KERNEL_CODE_SEL: SegSel = SegSel::new_gdt(PrivLvl::Ring0, 1);
pub const KERNEL_DATA_SEL: SegSel = SegSel::new_gdt(PrivLvl::Ring0, 2);

const GDT_LEN: usize = 3;
static mut GDT: [u64; GDT_LEN] = [0; GDT_LEN];

/// Builds the three-entry table (§4.4) and reloads every segment register.
/// Must run before the IDT is loaded: a far return needs a valid code selector.
pub fn install_gdt() {
    let code = (CodeSegDesc::default() | CodeSegDesc::DPL_RING0).bits();
    let data = DataSegDesc::default().bits();

    unsafe {
        GDT = [0, code, data];
        segmentation::lgdt(core::ptr::slice_from_raw_parts_mut(GDT.as_mut_ptr(), GDT_LEN));
        segmentation::cs_write(KERNEL_CODE_SEL);
        core::arch::asm!(
            "mov ds, {0:x}",
            "mov es, {0:x}",
            "mov fs, {0:x}",
            "mov gs, {0:x}",
            "mov ss, {0:x}",
            in(reg) KERNEL_DATA_SEL.to_bits(),
        );
    }
}

// INTERRUPT FRAME AND STUBS

/// The fixed-layout frame every vector stub marshals before calling
/// `common_handler` (§3 "Interrupt frame"). General-purpose registers first
/// (push order, so lowest address is `r15`), then the synthetic vector/error
/// pair the stub supplies, then the five words the CPU itself pushed.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct InterruptFrame {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rbp: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,
    pub vector: u64,
    pub error_code: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

/// Vectors whose exception pushes a real hardware error code; every other
/// vector's stub pushes a synthetic zero in its place (§3, §4.4). Used only
/// by the unit test below; the stub table itself hardcodes the same set as
/// `err`/`noerr` macro tokens, since `asm!`'s template must be a literal.
const fn has_error_code(vector: u8) -> bool {
    matches!(vector, 8 | 10 | 11 | 12 | 13 | 14 | 17 | 21 | 29 | 30)
}

/// Common handler: logs the frame, reads CR2 on a page fault, halts.
/// A pure function of the frame per the stub/dispatcher split above.
extern "C" fn common_handler(frame: *const InterruptFrame) -> ! {
    let frame = unsafe { &*frame };

    crate::err!(
        "cpu exception: vector={} error_code={:#x} rip={:#x} cs={:#x} rflags={:#x} rsp={:#x}",
        frame.vector, frame.error_code, frame.rip, frame.cs, frame.rflags, frame.rsp
    );
    if frame.vector == 14 {
        crate::err!("faulting address (CR2): {:p}", cr2_read());
    }

    amd64::hlt_loop();
}

/// Generates one naked per-vector stub matching §4.4's description: push a
/// synthetic error code (only for vectors that don't get a real one), push
/// the vector number, save every GPR in `InterruptFrame`'s field order, call
/// the common handler with a pointer to the frame.
macro_rules! stub {
    ($name:ident, $vector:literal, err) => { stub!(@emit $name, $vector, ""); };
    ($name:ident, $vector:literal, noerr) => { stub!(@emit $name, $vector, "push 0\n"); };
    (@emit $name:ident, $vector:literal, $pushes_err:literal) => {
        #[naked]
        unsafe extern "C" fn $name() -> ! {
            core::arch::asm!(
                core::concat!(
                    $pushes_err,
                    "push ", core::stringify!($vector), "\n",
                    "push rax\n push rbx\n push rcx\n push rdx\n",
                    "push rsi\n push rdi\n push rbp\n",
                    "push r8\n push r9\n push r10\n push r11\n",
                    "push r12\n push r13\n push r14\n push r15\n",
                    "mov rdi, rsp\n",
                    "call {handler}\n",
                ),
                handler = sym common_handler,
                options(noreturn),
            )
        }
    };
}

macro_rules! stub_table {
    ($(($name:ident, $vector:literal, $has_err:ident)),* $(,)?) => {
        $(
            stub!($name, $vector, $has_err);
        )*
        const STUB_ADDRS: [unsafe extern "C" fn() -> !; 32] = [ $($name),* ];
    };
}

stub_table!(
    (stub_00, 0, noerr), (stub_01, 1, noerr), (stub_02, 2, noerr), (stub_03, 3, noerr),
    (stub_04, 4, noerr), (stub_05, 5, noerr), (stub_06, 6, noerr), (stub_07, 7, noerr),
    (stub_08, 8, err),   (stub_09, 9, noerr), (stub_10, 10, err),  (stub_11, 11, err),
    (stub_12, 12, err),  (stub_13, 13, err),  (stub_14, 14, err),  (stub_15, 15, noerr),
    (stub_16, 16, noerr),(stub_17, 17, err),  (stub_18, 18, noerr),(stub_19, 19, noerr),
    (stub_20, 20, noerr),(stub_21, 21, err),  (stub_22, 22, noerr),(stub_23, 23, noerr),
    (stub_24, 24, noerr),(stub_25, 25, noerr),(stub_26, 26, noerr),(stub_27, 27, noerr),
    (stub_28, 28, noerr),(stub_29, 29, err),  (stub_30, 30, err),  (stub_31, 31, noerr),
);

// IDT

const IDT_LEN: usize = 256;
static mut IDT: MaybeUninit<[IntTrapGate<()>; IDT_LEN]> = MaybeUninit::uninit();

/// Vector IRQ1 (keyboard) is routed to (§5, §11.3). Placed well clear of the
/// 32 CPU-exception vectors and the legacy PIC's remapped 0x20..0x2F range.
pub const KEYBOARD_VECTOR: u8 = 0x21;

/// Populates all 256 entries (32 CPU-exception gates, the rest left absent)
/// and loads IDTR. Must run before `sti` (§2 step 3, §4.4 ordering).
pub fn install_idt() {
    unsafe {
        let idt = IDT.as_mut_ptr();
        for i in 0..IDT_LEN {
            (*idt)[i] = IntTrapGate::missing(Ssdt::InterruptGate);
        }
        for (vector, stub) in STUB_ADDRS.iter().enumerate() {
            (*idt)[vector] =
                IntTrapGate::new(*stub as u64, KERNEL_CODE_SEL, 0, Ssdt::InterruptGate, PrivLvl::Ring0);
        }

        let limit = (IDT_LEN * core::mem::size_of::<IntTrapGate<()>>() - 1) as u16;
        amd64::interrupts::lidt_raw(limit, idt as *const amd64::interrupts::InterruptDesciptorTable);
    }
}

/// Installs a gate for an `x86-interrupt`-ABI handler (IRQ lines, as opposed
/// to the naked CPU-exception stubs above). `IntTrapGate`'s generic parameter
/// is a zero-sized marker only, so reusing the flat `IntTrapGate<()>` table
/// for a differently-typed handler is just a pointer value, not a layout change.
pub fn install_irq_gate(vector: u8, handler: amd64::interrupts::Handler) {
    unsafe {
        let idt = IDT.as_mut_ptr();
        (*idt)[vector as usize] = IntTrapGate::new(
            handler as usize as u64,
            KERNEL_CODE_SEL,
            0,
            Ssdt::InterruptGate,
            PrivLvl::Ring0,
        );
    }
}

// LAPIC

const LAPIC_PHYS_BASE: u64 = 0xFEE0_0000;
const LAPIC_SPURIOUS_OFFSET: u64 = 0xF0;
const LAPIC_EOI_OFFSET: u64 = 0xB0;
const LAPIC_SPURIOUS_ENABLE: u32 = 1 << 8;

static LAPIC_VIRT_BASE: AtomicU64 = AtomicU64::new(0);

unsafe fn mmio_write(base: u64, offset: u64, value: u32) {
    ((base + offset) as *mut u32).write_volatile(value);
}

/// Maps the LAPIC's MMIO page through HHDM with caching disabled, then
/// enables it by writing the spurious-vector register (§4.4).
pub fn init_lapic(pmm: &mut Pmm, vmm: &mut Vmm) {
    let virt = vmm.phys_to_virt(LAPIC_PHYS_BASE);
    let _ = vmm.map_page(pmm, virt, LAPIC_PHYS_BASE, PTE::WRITE | PTE::PAGE_CACHE_DISABLE | PTE::NO_EXECUTE, 0);
    LAPIC_VIRT_BASE.store(virt, Ordering::Release);

    unsafe {
        mmio_write(virt, LAPIC_SPURIOUS_OFFSET, LAPIC_SPURIOUS_ENABLE | 0xFF);
    }
}

/// Sends End-Of-Interrupt. Must be the last action of every IRQ handler
/// path (§5: failing to send it silently mutes the line).
pub fn lapic_eoi() {
    let base = LAPIC_VIRT_BASE.load(Ordering::Acquire);
    if base != 0 {
        unsafe { mmio_write(base, LAPIC_EOI_OFFSET, 0) };
    }
}

// IOAPIC

const IOAPIC_PHYS_BASE: u64 = 0xFEC0_0000;
const IOAPIC_IOREGSEL: u64 = 0x00;
const IOAPIC_IOWIN: u64 = 0x10;
const IOAPIC_REDTBL_BASE: u32 = 0x10;

static IOAPIC_VIRT_BASE: AtomicU64 = AtomicU64::new(0);

unsafe fn ioapic_write(base: u64, reg: u32, value: u32) {
    ((base + IOAPIC_IOREGSEL) as *mut u32).write_volatile(reg);
    ((base + IOAPIC_IOWIN) as *mut u32).write_volatile(value);
}

/// Maps the IOAPIC MMIO page (§4.4). Per-IRQ programming happens separately
/// via `set_irq`, once the handler it targets is ready to receive interrupts.
pub fn init_ioapic(pmm: &mut Pmm, vmm: &mut Vmm) {
    let virt = vmm.phys_to_virt(IOAPIC_PHYS_BASE);
    let _ = vmm.map_page(pmm, virt, IOAPIC_PHYS_BASE, PTE::WRITE | PTE::PAGE_CACHE_DISABLE | PTE::NO_EXECUTE, 0);
    IOAPIC_VIRT_BASE.store(virt, Ordering::Release);
}

/// Routes legacy `irq` to `vector` on the CPU identified by `apic_id`:
/// fixed delivery mode, physical destination, active-high, edge-triggered,
/// unmasked (§4.4).
pub fn set_irq(irq: u8, vector: u8, apic_id: u8) {
    let base = IOAPIC_VIRT_BASE.load(Ordering::Acquire);
    if base == 0 {
        return;
    }
    let low_reg = IOAPIC_REDTBL_BASE + irq as u32 * 2;
    let high_reg = low_reg + 1;

    unsafe {
        ioapic_write(base, high_reg, (apic_id as u32) << 24);
        ioapic_write(base, low_reg, vector as u32);
    }
}

// LEGACY PIC

const PIC1_CMD: u16 = 0x20;
const PIC1_DATA: u16 = 0x21;
const PIC2_CMD: u16 = 0xA0;
const PIC2_DATA: u16 = 0xA1;

const ICW1_INIT: u8 = 0x10;
const ICW1_ICW4: u8 = 0x01;
const ICW4_8086: u8 = 0x01;

/// Remaps both PICs to vectors 0x20..0x2F so a stray legacy IRQ can't collide
/// with a CPU exception vector, then fully masks them; the IOAPIC is the
/// interrupt controller actually in use (§4.4).
pub fn remap_and_mask_pic() {
    let mut cmd1: Port<u8> = unsafe { Port::new(PIC1_CMD, u8::MAX) };
    let mut data1: Port<u8> = unsafe { Port::new(PIC1_DATA, u8::MAX) };
    let mut cmd2: Port<u8> = unsafe { Port::new(PIC2_CMD, u8::MAX) };
    let mut data2: Port<u8> = unsafe { Port::new(PIC2_DATA, u8::MAX) };

    unsafe {
        let _ = cmd1.write(ICW1_INIT | ICW1_ICW4);
        let _ = cmd2.write(ICW1_INIT | ICW1_ICW4);
        let _ = data1.write(0x20); // master offset: vector 0x20
        let _ = data2.write(0x28); // slave offset: vector 0x28
        let _ = data1.write(4); // tell master about slave on IRQ2
        let _ = data2.write(2); // tell slave its cascade identity
        let _ = data1.write(ICW4_8086);
        let _ = data2.write(ICW4_8086);

        let _ = data1.write(0xFF);
        let _ = data2.write(0xFF);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_vectors_match_amd64_manual() {
        for v in 0u8..32 {
            let expected = matches!(v, 8 | 10 | 11 | 12 | 13 | 14 | 17 | 21 | 29 | 30);
            assert_eq!(has_error_code(v), expected);
        }
    }

    #[test]
    fn interrupt_frame_ends_with_cpu_pushed_words() {
        use core::mem::size_of;
        // r15..rax (15 regs) + vector + error_code + rip/cs/rflags/rsp/ss (5), all u64
        assert_eq!(size_of::<InterruptFrame>(), (15 + 2 + 5) * 8);
    }

    #[test]
    fn kernel_selectors_match_documented_values() {
        assert_eq!(KERNEL_CODE_SEL.to_bits(), 0x08);
        assert_eq!(KERNEL_DATA_SEL.to_bits(), 0x10);
    }
}
