//! Protection Keys for Supervisor (PKS) detection and bring-up.
//!
//! PKS gates supervisor-mode PTE access by a 4-bit key via the PKRS MSR; it is
//! the substrate the SASOS model uses instead of ring transitions. Absence is
//! tolerated: the kernel runs on, PKS-keyed PTEs just have their key bits
//! ignored by the CPU.

use amd64::registers::{wrmsr, CR4};
use raw_cpuid::native_cpuid::cpuid_count;

/// PKRS: Protection Key Rights for Supervisor-mode pages.
const PKRS_MSR: u64 = 0x691;
const CPUID_LEAF_EXTENDED_FEATURES: u32 = 7;
const PKS_ECX_BIT: u32 = 1 << 31;

/// CPUID leaf 7, sub-leaf 0, ECX bit 31.
pub fn is_supported() -> bool {
    let result = cpuid_count(CPUID_LEAF_EXTENDED_FEATURES, 0);
    result.ecx & PKS_ECX_BIT != 0
}

/// Sets CR4.PKS and zeroes PKRS (every key permits full access until a domain
/// narrows its own mask before crossing into untrusted code).
///
/// # Safety
/// Must run after the IDT is installed (a PKS violation on startup would
/// otherwise double-fault with no handler) and only once.
pub unsafe fn enable() {
    CR4::write(CR4::read() | CR4::PKS);
    wrmsr(PKRS_MSR, 0);
}

/// Probes support and enables PKS if present, per the bring-up sequence in §2.
/// Returns whether PKS ended up enabled.
pub fn init() -> bool {
    if is_supported() {
        unsafe { enable() };
        true
    } else {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pks_bit_matches_cr4_pks_constant() {
        assert_eq!(CR4::PKS.bits(), 1 << 24);
    }

    #[test]
    fn pkrs_msr_matches_documented_address() {
        assert_eq!(PKRS_MSR, 0x691);
    }
}
