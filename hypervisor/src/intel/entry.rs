//! The hypervisor entry point hardware jumps to on every VM-exit, and the
//! resume/teardown plumbing around it.
//!
//! HOST_RSP points at the context frame carved out of the top of the per-VP
//! stack, so the trampoline stores guest registers with plain indexed moves,
//! hands the frame to the Rust handler, and never adjusts RSP first. The
//! handler does not return: it either restores context into a VMRESUME thunk
//! or, on teardown, back into the guest with VMX switched off.

use {
    crate::intel::{
        capture::{ContextFrame, restore_context},
        support,
        vmexit::VpState,
        vp::VpData,
    },
    core::{arch::global_asm, mem::offset_of},
    log::*,
    x86::vmx::vmcs,
};

unsafe extern "efiapi" {
    /// The value VMCS HOST_RIP is programmed with.
    pub fn vmx_entry() -> !;
}

global_asm!(
    r#"
    .global vmx_entry
vmx_entry:
    // RSP = the per-VP context frame. Guest RSP/RIP/RFLAGS live in the VMCS;
    // everything else is only here.
    mov     [rsp + {rax}], rax
    mov     [rsp + {rcx}], rcx
    mov     [rsp + {rdx}], rdx
    mov     [rsp + {rbx}], rbx
    mov     [rsp + {rbp}], rbp
    mov     [rsp + {rsi}], rsi
    mov     [rsp + {rdi}], rdi
    mov     [rsp + {r8}],  r8
    mov     [rsp + {r9}],  r9
    mov     [rsp + {r10}], r10
    mov     [rsp + {r11}], r11
    mov     [rsp + {r12}], r12
    mov     [rsp + {r13}], r13
    mov     [rsp + {r14}], r14
    mov     [rsp + {r15}], r15

    // Root-mode segment and flag state, for the restore stub.
    mov     word ptr [rsp + {seg_cs}], cs
    mov     word ptr [rsp + {seg_ss}], ss
    mov     word ptr [rsp + {seg_ds}], ds
    mov     word ptr [rsp + {seg_es}], es
    mov     word ptr [rsp + {seg_fs}], fs
    mov     word ptr [rsp + {seg_gs}], gs
    pushfq
    pop     rax
    mov     [rsp + {rflags}], rax

    // Frame pointer argument, shadow space, and off to Rust; the handler
    // never comes back.
    mov     rcx, rsp
    sub     rsp, 0x20
    call    {handler}
    int3
"#,
    rax = const offset_of!(ContextFrame, rax),
    rcx = const offset_of!(ContextFrame, rcx),
    rdx = const offset_of!(ContextFrame, rdx),
    rbx = const offset_of!(ContextFrame, rbx),
    rbp = const offset_of!(ContextFrame, rbp),
    rsi = const offset_of!(ContextFrame, rsi),
    rdi = const offset_of!(ContextFrame, rdi),
    r8 = const offset_of!(ContextFrame, r8),
    r9 = const offset_of!(ContextFrame, r9),
    r10 = const offset_of!(ContextFrame, r10),
    r11 = const offset_of!(ContextFrame, r11),
    r12 = const offset_of!(ContextFrame, r12),
    r13 = const offset_of!(ContextFrame, r13),
    r14 = const offset_of!(ContextFrame, r14),
    r15 = const offset_of!(ContextFrame, r15),
    rflags = const offset_of!(ContextFrame, rflags),
    seg_cs = const offset_of!(ContextFrame, seg_cs),
    seg_ss = const offset_of!(ContextFrame, seg_ss),
    seg_ds = const offset_of!(ContextFrame, seg_ds),
    seg_es = const offset_of!(ContextFrame, seg_es),
    seg_fs = const offset_of!(ContextFrame, seg_fs),
    seg_gs = const offset_of!(ContextFrame, seg_gs),
    handler = sym vmx_exit_handler,
);

/// Rust half of the VM-exit path.
///
/// Reads the volatile guest state out of the VMCS, routes the exit, advances
/// the guest RIP where the handler asked for it, and leaves through one of
/// the two context restores.
extern "efiapi" fn vmx_exit_handler(frame: &mut ContextFrame) -> ! {
    let Some(global) = crate::vmm::global() else {
        panic!("VM-exit with no global state");
    };
    let vp = unsafe { &mut *VpData::from_exit_frame(&raw mut *frame) };

    let mut state = VpState {
        guest_rip: support::vmread(vmcs::guest::RIP),
        guest_rsp: support::vmread(vmcs::guest::RSP),
        guest_rflags: support::vmread(vmcs::guest::RFLAGS),
        guest_cs: support::vmread(vmcs::guest::CS_SELECTOR) as u16,
        exit_reason: support::vmread(vmcs::ro::EXIT_REASON) as u32 & 0xFFFF,
        frame,
        exit_vm: false,
    };

    (global.dispatch)(&mut state, vp);

    if state.exit_vm {
        teardown_and_leave(state, vp);
    }

    // Hand the frame to the restore stub pointed at the VMRESUME thunk. The
    // stack below the frame is free, so the frame address itself serves as a
    // valid stack for the thunk.
    let frame_address = &raw const *state.frame as u64;
    state.frame.rip = vmx_resume as u64;
    state.frame.rsp = frame_address;
    unsafe { restore_context(state.frame) };
}

/// Executes the teardown requested by the guest: put the descriptor tables
/// and address space back exactly as captured, aim the frame at the
/// instruction after the magic CPUID, switch VMX off, and jump.
fn teardown_and_leave(state: VpState<'_>, vp: &mut VpData) -> ! {
    debug!("vp {} leaving VMX", vp.index);

    // Root mode forced the GDTR/IDTR limits to 0xFFFF; restore the real
    // values before anything (PatchGuard included) notices.
    unsafe {
        support::lgdt(vp.special_registers.gdtr_base, vp.special_registers.gdtr_limit);
        support::lidt(vp.special_registers.idtr_base, vp.special_registers.idtr_limit);
    }

    // This exit may have interrupted any process; continuing on the host CR3
    // (the system address space) would strand the interrupted thread.
    unsafe { support::write_cr3(support::vmread(vmcs::guest::CR3)) };

    state.frame.rip = state.guest_rip;
    state.frame.rsp = state.guest_rsp;
    state.frame.rflags = state.guest_rflags;
    state.frame.seg_cs = state.guest_cs;
    state.frame.seg_ss = support::vmread(vmcs::guest::SS_SELECTOR) as u16;

    support::vmxoff();
    unsafe { restore_context(state.frame) };
}

/// VMRESUME, broken out so it can be the target of a context restore.
/// Reaching the end means the resume failed, which is unrecoverable.
extern "efiapi" fn vmx_resume() -> ! {
    let _ = support::vmresume();
    let instruction_error = support::vmread(vmcs::ro::VM_INSTRUCTION_ERROR);
    panic!("VMRESUME failed with instruction error {instruction_error}");
}
