//! Thin wrappers over the instructions the rest of the crate needs.
//!
//! VMX instructions report failure through ZF/CF rather than a return value;
//! the wrappers here translate that discipline into `Result` where a caller
//! can meaningfully react, and panic where failure would mean the VMCS field
//! encoding itself is wrong.

use {
    crate::error::HypervisorError,
    core::arch::asm,
    x86::{
        controlregs,
        cpuid::{CpuIdResult, cpuid},
        dtables::{self, DescriptorTablePointer},
        msr,
        segmentation::{SegmentSelector, load_ds, load_es, load_fs},
    },
};

/// Reads a model-specific register.
pub fn rdmsr(msr: u32) -> u64 {
    unsafe { msr::rdmsr(msr) }
}

/// Executes CPUID with both leaf and sub-leaf.
pub fn cpuid(leaf: u32, subleaf: u32) -> CpuIdResult {
    cpuid!(leaf, subleaf)
}

/// Reads CR3.
pub fn cr3() -> u64 {
    unsafe { controlregs::cr3() }
}

/// Writes CR3.
///
/// # Safety
///
/// The caller must provide the physical address of a valid PML4.
pub unsafe fn write_cr3(value: u64) {
    unsafe { controlregs::cr3_write(value) };
}

/// Reads CR0 as a raw value, fixed bits and all.
pub fn cr0() -> u64 {
    x86_64::registers::control::Cr0::read_raw()
}

/// Writes CR0 from a raw value.
pub unsafe fn write_cr0(value: u64) {
    unsafe { x86_64::registers::control::Cr0::write_raw(value) };
}

/// Reads CR4 as a raw value.
pub fn cr4() -> u64 {
    x86_64::registers::control::Cr4::read_raw()
}

/// Writes CR4 from a raw value.
pub unsafe fn write_cr4(value: u64) {
    unsafe { x86_64::registers::control::Cr4::write_raw(value) };
}

/// Reads the current GDTR.
pub fn sgdt() -> DescriptorTablePointer<u64> {
    let mut gdtr = DescriptorTablePointer::default();
    unsafe { dtables::sgdt(&mut gdtr) };
    gdtr
}

/// Reads the current IDTR.
pub fn sidt() -> DescriptorTablePointer<u64> {
    let mut idtr = DescriptorTablePointer::default();
    unsafe { dtables::sidt(&mut idtr) };
    idtr
}

/// Loads a descriptor table pointer rebuilt from a captured base and limit
/// into the GDTR.
pub unsafe fn lgdt(base: u64, limit: u16) {
    let gdtr = DescriptorTablePointer { limit, base: base as *const u64 };
    unsafe { dtables::lgdt(&gdtr) };
}

/// Same as [`lgdt`], for the IDTR.
pub unsafe fn lidt(base: u64, limit: u16) {
    let idtr = DescriptorTablePointer { limit, base: base as *const u64 };
    unsafe { dtables::lidt(&idtr) };
}

/// Reads the task register selector.
pub fn tr() -> u16 {
    unsafe { x86::task::tr().bits() }
}

/// Reads the local descriptor table register selector.
pub fn ldtr() -> u16 {
    unsafe { dtables::ldtr().bits() }
}

/// Reads DR7.
pub fn dr7() -> u64 {
    unsafe { x86::debugregs::dr7().0 as u64 }
}

/// Reads the current RFLAGS.
pub fn rflags() -> u64 {
    x86::bits64::rflags::read().bits()
}

/// Reads a segment limit with the LSL instruction. Returns zero for
/// selectors the current GDT cannot describe.
pub fn segment_limit(selector: u16) -> u32 {
    let limit: u32;
    unsafe {
        asm!(
            "xor {limit:e}, {limit:e}",
            "lsl {limit:e}, {selector:e}",
            limit = out(reg) limit,
            selector = in(reg) selector as u32,
            options(nomem, nostack),
        );
    }
    limit
}

/// Reloads the data segments clobbered by the teardown context restore.
/// `data` goes into DS and ES, `compat_teb` into FS.
pub unsafe fn reload_data_segments(data: u16, compat_teb: u16) {
    unsafe {
        load_ds(SegmentSelector::from_raw(data));
        load_es(SegmentSelector::from_raw(data));
        load_fs(SegmentSelector::from_raw(compat_teb));
    }
}

/// Enters VMX root operation with the given VMXON region.
pub fn vmxon(vmxon_pa: u64) -> Result<(), HypervisorError> {
    unsafe { x86::bits64::vmx::vmxon(vmxon_pa) }.map_err(|_| HypervisorError::VmxFail)
}

/// Leaves VMX root operation. Failure is ignored: this runs on abort paths
/// where the processor may already be outside VMX.
pub fn vmxoff() {
    let _ = unsafe { x86::bits64::vmx::vmxoff() };
}

/// Clears the given VMCS, putting it into the inactive state.
pub fn vmclear(vmcs_pa: u64) -> Result<(), HypervisorError> {
    unsafe { x86::bits64::vmx::vmclear(vmcs_pa) }.map_err(|_| HypervisorError::VmxFail)
}

/// Makes the given VMCS current and active.
pub fn vmptrld(vmcs_pa: u64) -> Result<(), HypervisorError> {
    unsafe { x86::bits64::vmx::vmptrld(vmcs_pa) }.map_err(|_| HypervisorError::VmxFail)
}

/// Launches the current VMCS. Only ever returns on failure.
pub fn vmlaunch() -> HypervisorError {
    match unsafe { x86::bits64::vmx::vmlaunch() } {
        Ok(()) | Err(_) => HypervisorError::VmxFail,
    }
}

/// Resumes the current VMCS. Only ever returns on failure.
pub fn vmresume() -> HypervisorError {
    match unsafe { x86::bits64::vmx::vmresume() } {
        Ok(()) | Err(_) => HypervisorError::VmxFail,
    }
}

/// Reads a VMCS field. The fields this crate reads are unconditionally valid
/// while a VMCS is active, so failure is treated as a bug.
pub fn vmread(field: u32) -> u64 {
    match unsafe { x86::bits64::vmx::vmread(field) } {
        Ok(value) => value,
        Err(_) => panic!("VMREAD({field:#x}) failed"),
    }
}

/// Writes a VMCS field, panicking on failure for the same reason as
/// [`vmread`].
pub fn vmwrite<T: Into<u64>>(field: u32, value: T) {
    let value = value.into();
    if unsafe { x86::bits64::vmx::vmwrite(field, value) }.is_err() {
        panic!("VMWRITE({field:#x}, {value:#x}) failed");
    }
}

/// Invalidates cached EPT translations for a single EPTP.
pub fn invept_single_context(eptp: u64) {
    #[repr(C)]
    struct InveptDescriptor {
        eptp: u64,
        reserved: u64,
    }

    const INVEPT_SINGLE_CONTEXT: u64 = 1;

    let descriptor = InveptDescriptor { eptp, reserved: 0 };
    unsafe {
        asm!(
            "invept {kind}, [{descriptor}]",
            kind = in(reg) INVEPT_SINGLE_CONTEXT,
            descriptor = in(reg) &descriptor,
            options(nostack),
        );
    }
}

/// Writes back and invalidates the processor caches.
pub fn wbinvd() {
    unsafe { asm!("wbinvd", options(nostack)) };
}

/// Sets an extended control register from the guest-supplied parts.
pub unsafe fn xsetbv(xcr: u32, value: u64) {
    unsafe {
        asm!(
            "xsetbv",
            in("ecx") xcr,
            in("eax") value as u32,
            in("edx") (value >> 32) as u32,
            options(nostack),
        );
    }
}
