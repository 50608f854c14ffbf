//! EPT-violation VM-exit handler.
//!
//! The identity map built at load time covers installed RAM plus the APIC
//! page; device MMIO shows up here on first touch and is mapped on demand.

use {
    crate::{
        hal::Hal,
        intel::{
            support,
            vmexit::{ExitType, VpState},
        },
    },
    log::*,
    x86::vmx::vmcs,
};

/// Maps the faulting page and lets the guest re-run the access. A violation
/// that is not a missing translation means the tree itself is wrong, which
/// the EPT engine reports as fatal; nothing useful can continue from there.
pub fn handle_ept_violation<H: Hal>(state: &mut VpState<'_>) -> ExitType {
    let guest_pa = support::vmread(vmcs::ro::GUEST_PHYSICAL_ADDR_FULL);
    let qualification = support::vmread(vmcs::ro::EXIT_QUALIFICATION);

    trace!("EPT violation at gpa {guest_pa:#x}, qualification {qualification:#x}, rip {:#x}", state.guest_rip);

    let Some(global) = crate::vmm::global() else {
        panic!("EPT violation with no global state");
    };

    if let Err(e) = global.ept.lock().handle_violation::<H>(guest_pa, qualification) {
        panic!("failed to map gpa {guest_pa:#x} on demand: {e}");
    }

    // The faulting access has not executed; let it run against the new
    // mapping.
    ExitType::Continue
}
