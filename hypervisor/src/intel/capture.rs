//! Capture and restore of live processor context.
//!
//! The launch dance depends on recording the exact point after the capture
//! stub as the place where the guest will "wake up": VMLAUNCH puts the
//! processor back there, and the restore stub puts it back there a second
//! time with every general-purpose register holding its originally captured
//! value.

use {
    crate::intel::support,
    core::{arch::global_asm, mem::offset_of},
    static_assertions::const_assert_eq,
    x86::msr,
};

/// Register state captured by the assembly stubs and shared with the VM-exit
/// trampoline, which stores guest registers in the same layout.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct ContextFrame {
    pub rax: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rbx: u64,
    pub rsp: u64,
    pub rbp: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rflags: u64,
    pub seg_cs: u16,
    pub seg_ss: u16,
    pub seg_ds: u16,
    pub seg_es: u16,
    pub seg_fs: u16,
    pub seg_gs: u16,
    pub reserved: u32,
}

// The frame sits at the top of the host stack, which the ABI requires to be
// 16-byte aligned.
const_assert_eq!(size_of::<ContextFrame>() % 16, 0);

/// Control, debug, and descriptor-table state that the VMCS needs but that no
/// context frame carries.
#[derive(Debug, Clone, Copy, Default)]
pub struct SpecialRegisters {
    pub cr0: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub kernel_dr7: u64,
    pub debug_control: u64,
    pub msr_fs_base: u64,
    pub msr_gs_base: u64,
    pub gdtr_base: u64,
    pub gdtr_limit: u16,
    pub idtr_base: u64,
    pub idtr_limit: u16,
    pub tr: u16,
    pub ldtr: u16,
}

impl SpecialRegisters {
    /// Snapshots the registers of the current processor.
    pub fn capture() -> Self {
        let gdtr = support::sgdt();
        let idtr = support::sidt();

        Self {
            cr0: support::cr0(),
            cr3: support::cr3(),
            cr4: support::cr4(),
            kernel_dr7: support::dr7(),
            debug_control: support::rdmsr(msr::IA32_DEBUGCTL),
            msr_fs_base: support::rdmsr(msr::IA32_FS_BASE),
            msr_gs_base: support::rdmsr(msr::IA32_GS_BASE),
            gdtr_base: gdtr.base as u64,
            gdtr_limit: gdtr.limit,
            idtr_base: idtr.base as u64,
            idtr_limit: idtr.limit,
            tr: support::tr(),
            ldtr: support::ldtr(),
        }
    }
}

unsafe extern "efiapi" {
    /// Writes the caller's register state into `frame`.
    ///
    /// The recorded RIP is the instruction right after the call and the
    /// recorded RSP is the caller's stack pointer as it stands at that
    /// instruction. A transfer to the recorded RIP/RSP therefore looks to the
    /// caller like this function returning one more time.
    pub fn capture_context(frame: *mut ContextFrame);

    /// Loads the register state in `frame` and continues at its RIP, never
    /// returning. CS, SS, RSP, RIP, and RFLAGS are reloaded together with an
    /// IRETQ; DS, ES, and the GPRs are reloaded directly. FS and GS are left
    /// alone so their base registers survive.
    pub fn restore_context(frame: *const ContextFrame) -> !;
}

global_asm!(
    r#"
    .global capture_context
capture_context:
    // RCX = frame. The stored RCX is the pointer itself, which is exactly
    // what the register held at the call site.
    mov     [rcx + {rax}], rax
    mov     [rcx + {rcx}], rcx
    mov     [rcx + {rdx}], rdx
    mov     [rcx + {rbx}], rbx
    mov     [rcx + {rbp}], rbp
    mov     [rcx + {rsi}], rsi
    mov     [rcx + {rdi}], rdi
    mov     [rcx + {r8}],  r8
    mov     [rcx + {r9}],  r9
    mov     [rcx + {r10}], r10
    mov     [rcx + {r11}], r11
    mov     [rcx + {r12}], r12
    mov     [rcx + {r13}], r13
    mov     [rcx + {r14}], r14
    mov     [rcx + {r15}], r15

    pushfq
    pop     rax
    mov     [rcx + {rflags}], rax

    // Return address and the stack pointer the caller sees after `ret`.
    mov     rax, [rsp]
    mov     [rcx + {rip}], rax
    lea     rax, [rsp + 8]
    mov     [rcx + {rsp}], rax

    mov     word ptr [rcx + {seg_cs}], cs
    mov     word ptr [rcx + {seg_ss}], ss
    mov     word ptr [rcx + {seg_ds}], ds
    mov     word ptr [rcx + {seg_es}], es
    mov     word ptr [rcx + {seg_fs}], fs
    mov     word ptr [rcx + {seg_gs}], gs

    ret

    .global restore_context
restore_context:
    // Build the IRETQ frame on the current stack: SS, RSP, RFLAGS, CS, RIP.
    movzx   eax, word ptr [rcx + {seg_ss}]
    push    rax
    push    qword ptr [rcx + {rsp}]
    push    qword ptr [rcx + {rflags}]
    movzx   eax, word ptr [rcx + {seg_cs}]
    push    rax
    push    qword ptr [rcx + {rip}]

    mov     ds, word ptr [rcx + {seg_ds}]
    mov     es, word ptr [rcx + {seg_es}]

    mov     rax, [rcx + {rax}]
    mov     rdx, [rcx + {rdx}]
    mov     rbx, [rcx + {rbx}]
    mov     rbp, [rcx + {rbp}]
    mov     rsi, [rcx + {rsi}]
    mov     rdi, [rcx + {rdi}]
    mov     r8,  [rcx + {r8}]
    mov     r9,  [rcx + {r9}]
    mov     r10, [rcx + {r10}]
    mov     r11, [rcx + {r11}]
    mov     r12, [rcx + {r12}]
    mov     r13, [rcx + {r13}]
    mov     r14, [rcx + {r14}]
    mov     r15, [rcx + {r15}]
    mov     rcx, [rcx + {rcx}]

    iretq
"#,
    rax = const offset_of!(ContextFrame, rax),
    rcx = const offset_of!(ContextFrame, rcx),
    rdx = const offset_of!(ContextFrame, rdx),
    rbx = const offset_of!(ContextFrame, rbx),
    rsp = const offset_of!(ContextFrame, rsp),
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
    rip = const offset_of!(ContextFrame, rip),
    rflags = const offset_of!(ContextFrame, rflags),
    seg_cs = const offset_of!(ContextFrame, seg_cs),
    seg_ss = const offset_of!(ContextFrame, seg_ss),
    seg_ds = const offset_of!(ContextFrame, seg_ds),
    seg_es = const offset_of!(ContextFrame, seg_es),
    seg_fs = const offset_of!(ContextFrame, seg_fs),
    seg_gs = const offset_of!(ContextFrame, seg_gs),
);
