//! VMX execution-control adjustment.
//!
//! Every control field has a paired capability MSR whose low dword is the set
//! of bits the processor requires to be one and whose high dword is the set
//! it allows to be one. Writing anything else makes VM entry fail, so every
//! desired control value is passed through here first.

use crate::intel::vp::{
    VMX_MSR_COUNT, VMX_MSR_ENTRY_CTLS_TRUE, VMX_MSR_EXIT_CTLS_TRUE, VMX_MSR_PINBASED_CTLS_TRUE,
    VMX_MSR_PROCBASED_CTLS2, VMX_MSR_PROCBASED_CTLS_TRUE,
};

/// The adjustable control fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmxControl {
    PinBased,
    ProcessorBased,
    ProcessorBased2,
    VmExit,
    VmEntry,
}

/// Legalizes `desired` for the given control field using the capability MSRs
/// captured for this processor.
///
/// The capability probe requires VMX_BASIC bit 55, so the TRUE variants of
/// the control MSRs are always the authoritative pair. The secondary controls
/// have no TRUE variant.
pub fn adjust_vmx_controls(control: VmxControl, desired: u64, vmx_msrs: &[u64; VMX_MSR_COUNT]) -> u64 {
    let capability = vmx_msrs[match control {
        VmxControl::PinBased => VMX_MSR_PINBASED_CTLS_TRUE,
        VmxControl::ProcessorBased => VMX_MSR_PROCBASED_CTLS_TRUE,
        VmxControl::ProcessorBased2 => VMX_MSR_PROCBASED_CTLS2,
        VmxControl::VmExit => VMX_MSR_EXIT_CTLS_TRUE,
        VmxControl::VmEntry => VMX_MSR_ENTRY_CTLS_TRUE,
    }];
    adjust_msr(capability, desired)
}

/// The raw adjustment rule: keep the desired bits hardware allows to be one,
/// then add the bits hardware requires to be one.
pub fn adjust_msr(capability: u64, desired: u64) -> u64 {
    let allowed_one = capability >> 32;
    let required_one = capability & 0xFFFF_FFFF;
    (desired & allowed_one) | required_one
}

#[cfg(test)]
mod tests {
    use super::*;

    // Deterministic pseudo-random values; no external crates needed.
    fn xorshift(state: &mut u64) -> u64 {
        *state ^= *state << 13;
        *state ^= *state >> 7;
        *state ^= *state << 17;
        *state
    }

    #[test]
    fn adjustment_honors_required_and_allowed_bits() {
        let mut seed = 0x2545_F491_4F6C_DD1Du64;
        for _ in 0..10_000 {
            let desired = xorshift(&mut seed) & 0xFFFF_FFFF;
            let allowed_one = xorshift(&mut seed) & 0xFFFF_FFFF;
            // Required-one bits are always allowed to be one on hardware.
            let required_one = xorshift(&mut seed) & allowed_one;
            let capability = (allowed_one << 32) | required_one;

            let result = adjust_msr(capability, desired);

            // No forbidden-one bits.
            assert_eq!(result & !allowed_one, 0);
            // Every required-one bit set.
            assert_eq!(result | required_one, result);
            // Every desired bit the hardware permits survives.
            assert_eq!(result & desired & allowed_one, desired & allowed_one);
        }
    }

    #[test]
    fn adjustment_of_zero_desired_yields_required_bits() {
        let capability = (0xFFFF_0000u64 << 32) | 0x0000_F000;
        assert_eq!(adjust_msr(capability, 0), 0x0000_F000);
    }
}
