//! Population of the VMCS for one processor.
//!
//! The guest state is a mirror of the processor state captured moments ago,
//! so that VMLAUNCH drops the processor back into the interrupted code as its
//! own guest. The host state points at the hypervisor entry trampoline and a
//! private stack.

use {
    crate::intel::{
        controls::{VmxControl, adjust_vmx_controls},
        descriptor::{RPL_MASK, VmxSegmentDescriptor},
        entry::vmx_entry,
        support::vmwrite,
        vp::VpData,
    },
    log::*,
    static_assertions::const_assert_eq,
    x86::{
        bits64::paging::BASE_PAGE_SIZE,
        vmx::vmcs,
    },
};

/// The 4 KiB VMCS region. Only the revision identifier and abort indicator
/// have an architectural layout; the rest belongs to hardware.
#[repr(C, align(4096))]
pub struct VmcsRegion {
    pub revision_id: u32,
    pub abort_indicator: u32,
    pub reserved: [u8; BASE_PAGE_SIZE - 8],
}

const_assert_eq!(size_of::<VmcsRegion>(), BASE_PAGE_SIZE);

/// Fills in the currently loaded VMCS from the captured state in `vp` and the
/// shared `eptp` and `msr_bitmap_pa`.
pub fn setup_vmcs_for_vp(vp: &VpData, eptp: u64, msr_bitmap_pa: u64) {
    debug!("populating VMCS for vp {}", vp.index);

    setup_control_fields(vp, eptp, msr_bitmap_pa);
    setup_guest_and_host_segments(vp);
    setup_guest_and_host_system_state(vp);

    debug!("VMCS for vp {} populated", vp.index);
}

fn setup_control_fields(vp: &VpData, eptp: u64, msr_bitmap_pa: u64) {
    use vmcs::control::{EntryControls, ExitControls, PrimaryControls, SecondaryControls};

    // Required for any VMCS that is not a shadow VMCS.
    vmwrite(vmcs::guest::LINK_PTR_FULL, u64::MAX);

    // A missing MSR bitmap would trap every MSR access, so an all-zero one is
    // installed instead: no MSR exits at all.
    vmwrite(vmcs::control::MSR_BITMAPS_ADDR_FULL, msr_bitmap_pa);

    // Any non-zero VPID keeps the guest TLB entries tagged.
    vmwrite(vmcs::control::VPID, 1u64);

    vmwrite(vmcs::control::EPTP_FULL, eptp);

    // RDTSCP and XSAVES are used freely by current Windows and Linux kernels;
    // without these controls their first use would fault. The adjustment
    // drops whichever of them this processor does not actually know.
    const SECONDARY_CTL: u64 = (SecondaryControls::ENABLE_RDTSCP.bits()
        | SecondaryControls::ENABLE_XSAVES_XRSTORS.bits()
        | SecondaryControls::ENABLE_VPID.bits()
        | SecondaryControls::ENABLE_EPT.bits()) as u64;
    const PRIMARY_CTL: u64 =
        (PrimaryControls::USE_MSR_BITMAPS.bits() | PrimaryControls::SECONDARY_CONTROLS.bits()) as u64;
    const EXIT_CTL: u64 =
        (ExitControls::ACK_INTERRUPT_ON_EXIT.bits() | ExitControls::HOST_ADDRESS_SPACE_SIZE.bits()) as u64;
    const ENTRY_CTL: u64 = EntryControls::IA32E_MODE_GUEST.bits() as u64;
    const PINBASED_CTL: u64 = 0;

    let msrs = &vp.vmx_msrs;
    vmwrite(
        vmcs::control::SECONDARY_PROCBASED_EXEC_CONTROLS,
        adjust_vmx_controls(VmxControl::ProcessorBased2, SECONDARY_CTL, msrs),
    );
    vmwrite(
        vmcs::control::PINBASED_EXEC_CONTROLS,
        adjust_vmx_controls(VmxControl::PinBased, PINBASED_CTL, msrs),
    );
    vmwrite(
        vmcs::control::PRIMARY_PROCBASED_EXEC_CONTROLS,
        adjust_vmx_controls(VmxControl::ProcessorBased, PRIMARY_CTL, msrs),
    );
    vmwrite(
        vmcs::control::VMEXIT_CONTROLS,
        adjust_vmx_controls(VmxControl::VmExit, EXIT_CTL, msrs),
    );
    vmwrite(
        vmcs::control::VMENTRY_CONTROLS,
        adjust_vmx_controls(VmxControl::VmEntry, ENTRY_CTL, msrs),
    );
}

/// Loads one guest segment from the captured GDT and gives the host the same
/// selector with the RPL bits dropped.
fn setup_guest_and_host_segments(vp: &VpData) {
    let gdt_base = vp.special_registers.gdtr_base;
    let context = &vp.host_context;

    let cs = unsafe { VmxSegmentDescriptor::from_gdt(gdt_base, context.seg_cs) };
    vmwrite(vmcs::guest::CS_SELECTOR, cs.selector);
    vmwrite(vmcs::guest::CS_LIMIT, cs.limit);
    vmwrite(vmcs::guest::CS_ACCESS_RIGHTS, cs.access_rights);
    vmwrite(vmcs::guest::CS_BASE, cs.base);
    vmwrite(vmcs::host::CS_SELECTOR, context.seg_cs & !RPL_MASK);

    let ss = unsafe { VmxSegmentDescriptor::from_gdt(gdt_base, context.seg_ss) };
    vmwrite(vmcs::guest::SS_SELECTOR, ss.selector);
    vmwrite(vmcs::guest::SS_LIMIT, ss.limit);
    vmwrite(vmcs::guest::SS_ACCESS_RIGHTS, ss.access_rights);
    vmwrite(vmcs::guest::SS_BASE, ss.base);
    vmwrite(vmcs::host::SS_SELECTOR, context.seg_ss & !RPL_MASK);

    let ds = unsafe { VmxSegmentDescriptor::from_gdt(gdt_base, context.seg_ds) };
    vmwrite(vmcs::guest::DS_SELECTOR, ds.selector);
    vmwrite(vmcs::guest::DS_LIMIT, ds.limit);
    vmwrite(vmcs::guest::DS_ACCESS_RIGHTS, ds.access_rights);
    vmwrite(vmcs::guest::DS_BASE, ds.base);
    vmwrite(vmcs::host::DS_SELECTOR, context.seg_ds & !RPL_MASK);

    let es = unsafe { VmxSegmentDescriptor::from_gdt(gdt_base, context.seg_es) };
    vmwrite(vmcs::guest::ES_SELECTOR, es.selector);
    vmwrite(vmcs::guest::ES_LIMIT, es.limit);
    vmwrite(vmcs::guest::ES_ACCESS_RIGHTS, es.access_rights);
    vmwrite(vmcs::guest::ES_BASE, es.base);
    vmwrite(vmcs::host::ES_SELECTOR, context.seg_es & !RPL_MASK);

    // FS: the compatibility-mode TEB. The decoded base matters on both
    // sides.
    let fs = unsafe { VmxSegmentDescriptor::from_gdt(gdt_base, context.seg_fs) };
    vmwrite(vmcs::guest::FS_SELECTOR, fs.selector);
    vmwrite(vmcs::guest::FS_LIMIT, fs.limit);
    vmwrite(vmcs::guest::FS_ACCESS_RIGHTS, fs.access_rights);
    vmwrite(vmcs::guest::FS_BASE, fs.base);
    vmwrite(vmcs::host::FS_BASE, fs.base);
    vmwrite(vmcs::host::FS_SELECTOR, context.seg_fs & !RPL_MASK);

    // GS: in long mode the descriptor base is meaningless; the captured MSR
    // value is the real one, on both sides.
    let gs = unsafe { VmxSegmentDescriptor::from_gdt(gdt_base, context.seg_gs) };
    vmwrite(vmcs::guest::GS_SELECTOR, gs.selector);
    vmwrite(vmcs::guest::GS_LIMIT, gs.limit);
    vmwrite(vmcs::guest::GS_ACCESS_RIGHTS, gs.access_rights);
    vmwrite(vmcs::guest::GS_BASE, vp.special_registers.msr_gs_base);
    vmwrite(vmcs::host::GS_BASE, vp.special_registers.msr_gs_base);
    vmwrite(vmcs::host::GS_SELECTOR, context.seg_gs & !RPL_MASK);

    let tr = unsafe { VmxSegmentDescriptor::from_gdt(gdt_base, vp.special_registers.tr) };
    vmwrite(vmcs::guest::TR_SELECTOR, tr.selector);
    vmwrite(vmcs::guest::TR_LIMIT, tr.limit);
    vmwrite(vmcs::guest::TR_ACCESS_RIGHTS, tr.access_rights);
    vmwrite(vmcs::guest::TR_BASE, tr.base);
    vmwrite(vmcs::host::TR_BASE, tr.base);
    vmwrite(vmcs::host::TR_SELECTOR, vp.special_registers.tr & !RPL_MASK);

    // The guest keeps its LDT; the host has no LDTR field to set.
    let ldtr = unsafe { VmxSegmentDescriptor::from_gdt(gdt_base, vp.special_registers.ldtr) };
    vmwrite(vmcs::guest::LDTR_SELECTOR, ldtr.selector);
    vmwrite(vmcs::guest::LDTR_LIMIT, ldtr.limit);
    vmwrite(vmcs::guest::LDTR_ACCESS_RIGHTS, ldtr.access_rights);
    vmwrite(vmcs::guest::LDTR_BASE, ldtr.base);
}

fn setup_guest_and_host_system_state(vp: &VpData) {
    let special = &vp.special_registers;
    let context = &vp.host_context;

    vmwrite(vmcs::guest::GDTR_BASE, special.gdtr_base);
    vmwrite(vmcs::guest::GDTR_LIMIT, special.gdtr_limit);
    vmwrite(vmcs::host::GDTR_BASE, special.gdtr_base);

    vmwrite(vmcs::guest::IDTR_BASE, special.idtr_base);
    vmwrite(vmcs::guest::IDTR_LIMIT, special.idtr_limit);
    vmwrite(vmcs::host::IDTR_BASE, special.idtr_base);

    // CR0/CR4 were already narrowed to the VMX fixed-bit envelope when root
    // mode was entered; guest, host, and the read shadows all agree.
    vmwrite(vmcs::guest::CR0, special.cr0);
    vmwrite(vmcs::host::CR0, special.cr0);
    vmwrite(vmcs::control::CR0_READ_SHADOW, special.cr0);

    vmwrite(vmcs::guest::CR4, special.cr4);
    vmwrite(vmcs::host::CR4, special.cr4);
    vmwrite(vmcs::control::CR4_READ_SHADOW, special.cr4);

    // The guest stays in whatever address space it was interrupted in. The
    // host must not: this code may be running on top of an arbitrary user
    // process, and the hypervisor needs an address space that is always
    // valid, so it borrows the system process page tables.
    vmwrite(vmcs::guest::CR3, special.cr3);
    vmwrite(vmcs::host::CR3, vp.system_cr3);

    vmwrite(vmcs::guest::IA32_DEBUGCTL_FULL, special.debug_control);
    vmwrite(vmcs::guest::DR7, special.kernel_dr7);

    // The exact spot where the capture stub recorded its caller: VMLAUNCH
    // "returns" there.
    vmwrite(vmcs::guest::RSP, context.rsp);
    vmwrite(vmcs::guest::RIP, context.rip);
    vmwrite(vmcs::guest::RFLAGS, context.rflags);

    // On VM-exit the trampoline finds a context frame already carved out at
    // the top of the per-VP stack; its address doubles as the stack pointer.
    vmwrite(vmcs::host::RSP, vp.exit_frame_address());
    vmwrite(vmcs::host::RIP, vmx_entry as usize as u64);
}
