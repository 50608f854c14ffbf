//! XSETBV VM-exit handler.

use crate::intel::{
    support,
    vmexit::{ExitType, VpState},
};

/// XSETBV exits unconditionally under VMX; replay it with the guest's
/// operands on the real processor.
pub fn handle_xsetbv(state: &mut VpState<'_>) -> ExitType {
    let xcr = state.frame.rcx as u32;
    let value = (state.frame.rdx << 32) | (state.frame.rax & 0xFFFF_FFFF);

    unsafe { support::xsetbv(xcr, value) };

    ExitType::IncrementRip
}
