//! Common error taxonomy for fallible, non-ABI internal operations.
//!
//! Anything directly consumed by a C-ABI caller (PMM/heap/KernelTable entry
//! points) keeps the raw null-pointer/zero conventions documented at each
//! call site; this enum is for Rust-to-Rust call paths only.

use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// A response the kernel depends on was never populated by the bootloader,
    /// or the base revision it negotiated was rejected.
    MissingBootResponse(&'static str),
    /// PMM or VMM ran out of backing memory while servicing a mapping request.
    OutOfMemory,
    /// A virtual address could not be mapped (missing intermediate table, bad alignment).
    MapFailed,
    /// ELF image failed validation; see `elf::LoadError` for the specific reason.
    MalformedElf(crate::elf::LoadError),
    /// An unrecoverable CPU exception reached the common interrupt handler.
    CpuException(u8),
    /// The keyboard ring buffer was full when a new scancode arrived.
    KeyboardOverflow,
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelError::MissingBootResponse(what) => write!(f, "missing boot response: {}", what),
            KernelError::OutOfMemory => write!(f, "out of memory"),
            KernelError::MapFailed => write!(f, "virtual mapping failed"),
            KernelError::MalformedElf(reason) => write!(f, "malformed elf: {:?}", reason),
            KernelError::CpuException(vector) => write!(f, "cpu exception, vector {}", vector),
            KernelError::KeyboardOverflow => write!(f, "keyboard buffer overflow"),
        }
    }
}

pub type KernelResult<T> = Result<T, KernelError>;
