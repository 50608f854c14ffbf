//! VMX root-mode entry for one processor.

use {
    crate::{
        error::HypervisorError,
        hal::Hal,
        intel::{
            ept::MemoryType,
            support,
            vp::{VMX_MSR_BASIC, VMX_MSR_CR0_FIXED0, VMX_MSR_CR0_FIXED1, VMX_MSR_CR4_FIXED0, VMX_MSR_CR4_FIXED1, VpData},
        },
    },
    bit_field::BitField,
    log::*,
    static_assertions::const_assert_eq,
    x86::bits64::paging::BASE_PAGE_SIZE,
};

/// The 4 KiB region named by VMXON. Hardware owns everything past the
/// revision identifier.
#[repr(C, align(4096))]
pub struct VmxonRegion {
    pub revision_id: u32,
    pub reserved: [u8; BASE_PAGE_SIZE - 4],
}

const_assert_eq!(size_of::<VmxonRegion>(), BASE_PAGE_SIZE);

/// Puts the current processor into VMX root operation with an active VMCS.
///
/// Validates what IA32_VMX_BASIC promises, stamps the revision identifiers,
/// narrows CR0/CR4 to their fixed-bit envelopes (updating the captured copies
/// so the VMCS later mirrors reality), and runs VMXON → VMCLEAR → VMPTRLD.
/// Any failure leaves the processor outside VMX.
pub fn enter_root_mode<H: Hal>(vp: &mut VpData) -> Result<(), HypervisorError> {
    let basic = vp.vmx_msrs[VMX_MSR_BASIC];

    // A VMCS bigger than a page would not fit the regions we carved out.
    if basic.get_bits(32..45) > BASE_PAGE_SIZE as u64 {
        return Err(HypervisorError::Unsupported);
    }

    // The VMCS must be cacheable as ordinary writeback memory.
    if basic.get_bits(50..54) != MemoryType::WriteBack as u64 {
        return Err(HypervisorError::Unsupported);
    }

    // Bit 55 makes the TRUE control MSRs authoritative; the control setup
    // depends on them.
    if !basic.get_bit(55) {
        return Err(HypervisorError::Unsupported);
    }

    let revision_id = basic as u32 & 0x7FFF_FFFF;
    vp.vmxon.revision_id = revision_id;
    vp.vmcs.revision_id = revision_id;

    vp.vmxon_pa = H::virt_to_phys((&raw const vp.vmxon).cast());
    vp.vmcs_pa = H::virt_to_phys((&raw const vp.vmcs).cast());

    // Fold the must-be-one/must-be-zero envelopes into the captured control
    // registers, then make the live registers match.
    let special = &mut vp.special_registers;
    special.cr0 &= vp.vmx_msrs[VMX_MSR_CR0_FIXED1] & 0xFFFF_FFFF;
    special.cr0 |= vp.vmx_msrs[VMX_MSR_CR0_FIXED0] & 0xFFFF_FFFF;
    special.cr4 &= vp.vmx_msrs[VMX_MSR_CR4_FIXED1] & 0xFFFF_FFFF;
    special.cr4 |= vp.vmx_msrs[VMX_MSR_CR4_FIXED0] & 0xFFFF_FFFF;

    unsafe {
        support::write_cr0(special.cr0);
        support::write_cr4(special.cr4);
    }

    support::vmxon(vp.vmxon_pa)?;

    if let Err(e) = support::vmclear(vp.vmcs_pa).and_then(|()| support::vmptrld(vp.vmcs_pa)) {
        error!("activating the VMCS failed on vp {}", vp.index);
        support::vmxoff();
        return Err(e);
    }

    Ok(())
}
