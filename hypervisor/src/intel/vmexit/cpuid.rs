//! CPUID VM-exit handler: the guest's window into the processor, and the
//! hypervisor's unload signal.

use crate::{
    hal::Hal,
    intel::{
        descriptor::RPL_MASK,
        vmexit::{ExitType, VpState},
        vp::{TEARDOWN_CPUID_LEAF, TEARDOWN_CPUID_SUBLEAF},
    },
};

/// CPUID.1:ECX bit 31, reserved by both vendors to advertise a hypervisor.
const HYPERVISOR_PRESENT: u32 = 1 << 31;

pub fn handle_cpuid<H: Hal>(state: &mut VpState<'_>) -> ExitType {
    let leaf = state.frame.rax as u32;
    let subleaf = state.frame.rcx as u32;

    // The distinguished teardown sequence, accepted from ring 0 only so user
    // mode cannot unload the hypervisor out from under the kernel.
    let guest_cpl = state.guest_cs & RPL_MASK;
    if leaf == TEARDOWN_CPUID_LEAF && subleaf == TEARDOWN_CPUID_SUBLEAF && guest_cpl == 0 {
        state.exit_vm = true;
        return ExitType::IncrementRip;
    }

    // Otherwise answer with what the processor itself says.
    let mut result = H::cpuid(leaf, subleaf);

    // The features leaf additionally reports that a hypervisor is running,
    // which is also what keeps a second copy of this driver from loading.
    if leaf == 1 {
        result.ecx |= HYPERVISOR_PRESENT;
    }

    state.frame.rax = u64::from(result.eax);
    state.frame.rbx = u64::from(result.ebx);
    state.frame.rcx = u64::from(result.ecx);
    state.frame.rdx = u64::from(result.edx);

    ExitType::IncrementRip
}
