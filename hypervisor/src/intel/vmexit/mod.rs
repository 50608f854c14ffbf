//! VM-exit routing.
//!
//! With no optional exiting enabled, the only exits that can occur are the
//! unconditional ones (CPUID, INVD, XSETBV, the VMX instruction family,
//! GETSEC) and EPT violations from the lazy identity map. Anything else
//! means the control fields are not what this crate believes they are.

use {
    crate::{
        hal::Hal,
        intel::{capture::ContextFrame, support, vp::VpData},
    },
    log::*,
    x86::vmx::vmcs,
};

pub mod cpuid;
pub mod ept_violation;
pub mod invd;
pub mod vmx;
pub mod xsetbv;

/// What the dispatcher should do with the guest RIP afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitType {
    /// Step over the instruction that exited.
    IncrementRip,
    /// Re-run it, typically after fixing the reason it exited.
    Continue,
}

/// Basic exit reasons this hypervisor can see.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ExitReason {
    Cpuid = 10,
    Invd = 13,
    Vmcall = 18,
    Vmclear = 19,
    Vmlaunch = 20,
    Vmptrld = 21,
    Vmptrst = 22,
    Vmread = 23,
    Vmresume = 24,
    Vmwrite = 25,
    Vmxoff = 26,
    Vmxon = 27,
    EptViolation = 48,
    Invept = 50,
    Invvpid = 53,
    Xsetbv = 55,
}

impl ExitReason {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            10 => Some(Self::Cpuid),
            13 => Some(Self::Invd),
            18 => Some(Self::Vmcall),
            19 => Some(Self::Vmclear),
            20 => Some(Self::Vmlaunch),
            21 => Some(Self::Vmptrld),
            22 => Some(Self::Vmptrst),
            23 => Some(Self::Vmread),
            24 => Some(Self::Vmresume),
            25 => Some(Self::Vmwrite),
            26 => Some(Self::Vmxoff),
            27 => Some(Self::Vmxon),
            48 => Some(Self::EptViolation),
            50 => Some(Self::Invept),
            53 => Some(Self::Invvpid),
            55 => Some(Self::Xsetbv),
            _ => None,
        }
    }
}

/// Per-exit view of the guest, assembled by the entry handler around the
/// register frame the trampoline saved.
pub struct VpState<'a> {
    pub frame: &'a mut ContextFrame,
    pub guest_rip: u64,
    pub guest_rsp: u64,
    pub guest_rflags: u64,
    /// Guest CS selector; its RPL gates the teardown request.
    pub guest_cs: u16,
    pub exit_reason: u32,
    /// Set by the CPUID handler when the guest asked the hypervisor to
    /// unload.
    pub exit_vm: bool,
}

/// Routes one VM-exit. Installed into the global state as a function pointer
/// at initialization, which is what lets the non-generic entry path reach
/// HAL-generic handlers.
pub fn dispatch<H: Hal>(state: &mut VpState<'_>, vp: &mut VpData) {
    let exit_type = match ExitReason::from_u32(state.exit_reason) {
        Some(ExitReason::Cpuid) => cpuid::handle_cpuid::<H>(state),
        Some(ExitReason::Invd) => invd::handle_invd(),
        Some(ExitReason::Xsetbv) => xsetbv::handle_xsetbv(state),
        Some(ExitReason::EptViolation) => ept_violation::handle_ept_violation::<H>(state),
        Some(
            ExitReason::Vmcall
            | ExitReason::Vmclear
            | ExitReason::Vmlaunch
            | ExitReason::Vmptrld
            | ExitReason::Vmptrst
            | ExitReason::Vmread
            | ExitReason::Vmresume
            | ExitReason::Vmwrite
            | ExitReason::Vmxoff
            | ExitReason::Vmxon
            | ExitReason::Invept
            | ExitReason::Invvpid,
        ) => vmx::handle_vmx_instruction(state),
        None => {
            error!(
                "unhandled VM-exit {} on vp {} at rip {:#x}",
                state.exit_reason, vp.index, state.guest_rip
            );
            panic!("unhandled VM-exit reason {}", state.exit_reason);
        }
    };

    if exit_type == ExitType::IncrementRip {
        state.guest_rip += support::vmread(vmcs::ro::VMEXIT_INSTRUCTION_LEN);
        support::vmwrite(vmcs::guest::RIP, state.guest_rip);
    }
}
