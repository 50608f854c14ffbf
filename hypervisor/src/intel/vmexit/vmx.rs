//! Handler for the VMX instruction family (and GETSEC) executed by the
//! guest.

use {
    crate::intel::{
        support,
        vmexit::{ExitType, VpState},
    },
    x86::vmx::vmcs,
};

/// RFLAGS.CF, the VMfailInvalid signal.
const CARRY_FLAG: u64 = 1 << 0;

/// The guest is not getting nested virtualization; fail the instruction the
/// way hardware outside VMX operation would, by raising CF.
pub fn handle_vmx_instruction(state: &mut VpState<'_>) -> ExitType {
    state.guest_rflags |= CARRY_FLAG;
    support::vmwrite(vmcs::guest::RFLAGS, state.guest_rflags);

    ExitType::IncrementRip
}
