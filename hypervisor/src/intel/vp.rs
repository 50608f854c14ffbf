//! Per-processor state and the launch dance that slides the running OS into
//! a virtual machine without it noticing.

use {
    crate::{
        error::HypervisorError,
        hal::Hal,
        intel::{
            capture::{ContextFrame, SpecialRegisters, capture_context, restore_context},
            ept::Ept,
            support,
            vmcs::{VmcsRegion, setup_vmcs_for_vp},
            vmexit::VpState,
            vmxon::{VmxonRegion, enter_root_mode},
        },
    },
    core::ptr::{self, read_volatile, write_volatile},
    log::*,
    spin::Mutex,
    static_assertions::{const_assert, const_assert_eq},
    x86::{bits64::paging::BASE_PAGE_SIZE, msr},
};

/// Capability MSRs IA32_VMX_BASIC through IA32_VMX_VMFUNC, read once per
/// processor at launch. The names below index into that block.
pub const VMX_MSR_COUNT: usize = 17;

pub const VMX_MSR_BASIC: usize = 0;
pub const VMX_MSR_CR0_FIXED0: usize = 6;
pub const VMX_MSR_CR0_FIXED1: usize = 7;
pub const VMX_MSR_CR4_FIXED0: usize = 8;
pub const VMX_MSR_CR4_FIXED1: usize = 9;
pub const VMX_MSR_PROCBASED_CTLS2: usize = 11;
pub const VMX_MSR_PINBASED_CTLS_TRUE: usize = 13;
pub const VMX_MSR_PROCBASED_CTLS_TRUE: usize = 14;
pub const VMX_MSR_EXIT_CTLS_TRUE: usize = 15;
pub const VMX_MSR_ENTRY_CTLS_TRUE: usize = 16;

/// A standard-size kernel stack for the hypervisor itself.
pub const HOST_STACK_SIZE: usize = 24 * 1024;

/// Launch flag values. The flag is written and read with volatile accesses
/// because the function observing it is re-entered by hardware with dirty
/// registers; memory is the only thing it can trust.
pub const VP_PRE_LAUNCH: u32 = 0;
pub const VP_LAUNCHED: u32 = 1;
pub const VP_RESUMED: u32 = 2;

/// Windows x64 GDT layout: the user data selector and the compatibility-mode
/// TEB selector, which the teardown path must put back.
const KGDT64_R3_DATA: u16 = 0x28;
const KGDT64_R3_CMTEB: u16 = 0x50;
const RPL_USER: u16 = 3;

/// The distinguished CPUID sequence that asks the hypervisor to unload.
pub const TEARDOWN_CPUID_LEAF: u32 = 0x4141_4141;
pub const TEARDOWN_CPUID_SUBLEAF: u32 = 0x4242_4242;

/// The dedicated hypervisor stack. The VM-exit context frame occupies the
/// top; HOST_RSP points directly at it, so the trampoline never has to adjust
/// RSP before storing registers.
#[repr(C, align(16))]
pub struct HostStack {
    #[allow(dead_code)]
    stack: [u8; HOST_STACK_SIZE - size_of::<ContextFrame>()],
    pub exit_frame: ContextFrame,
}

const_assert_eq!(size_of::<HostStack>(), HOST_STACK_SIZE);
const_assert!((HOST_STACK_SIZE - size_of::<ContextFrame>()) % 16 == 0);

/// Everything one logical processor needs, carved out of the global
/// contiguous block.
#[repr(C, align(4096))]
pub struct VpData {
    pub vmxon: VmxonRegion,
    pub vmcs: VmcsRegion,
    pub host_stack: HostStack,
    pub host_context: ContextFrame,
    pub special_registers: SpecialRegisters,
    pub vmx_msrs: [u64; VMX_MSR_COUNT],
    pub vmxon_pa: u64,
    pub vmcs_pa: u64,
    pub system_cr3: u64,
    pub index: u32,
    launch_state: u32,
}

impl VpData {
    pub fn launch_state(&self) -> u32 {
        unsafe { read_volatile(&self.launch_state) }
    }

    pub fn set_launch_state(&mut self, state: u32) {
        unsafe { write_volatile(&mut self.launch_state, state) };
    }

    /// Address of the VM-exit context frame, which is also HOST_RSP.
    pub fn exit_frame_address(&self) -> u64 {
        &raw const self.host_stack.exit_frame as u64
    }

    /// Recovers the owning `VpData` from the frame pointer the trampoline
    /// hands to the exit handler.
    ///
    /// # Safety
    ///
    /// `frame` must be the `exit_frame` of a live `VpData`.
    pub unsafe fn from_exit_frame(frame: *mut ContextFrame) -> *mut VpData {
        let offset = core::mem::offset_of!(VpData, host_stack) + core::mem::offset_of!(HostStack, exit_frame);
        (frame as usize - offset) as *mut VpData
    }
}

/// The zeroed page shared by every VMCS as the MSR bitmap: no MSR exits.
#[repr(C, align(4096))]
pub struct MsrBitmap([u8; BASE_PAGE_SIZE]);

const_assert_eq!(size_of::<MsrBitmap>(), BASE_PAGE_SIZE);

/// Signature of the monomorphized VM-exit dispatcher installed at
/// initialization, so the non-generic trampoline handler can reach the
/// HAL-generic handlers.
pub type ExitDispatch = fn(&mut VpState<'_>, &mut VpData);

/// Process-wide hypervisor state: the shared MSR bitmap, the EPT tree and
/// its published pointer, and one `VpData` per logical processor laid out
/// directly behind this header in the same physically contiguous block.
#[repr(C, align(4096))]
pub struct GlobalData {
    msr_bitmap: MsrBitmap,
    pub ept: Mutex<Ept>,
    /// Written once after the EPT build, read lock-free everywhere else.
    pub eptp: u64,
    pub dispatch: ExitDispatch,
    pub vp_count: u32,
}

impl GlobalData {
    /// Bytes needed for the header plus `vp_count` per-processor slots.
    pub fn allocation_size(vp_count: u32) -> usize {
        size_of::<GlobalData>() + vp_count as usize * size_of::<VpData>()
    }

    pub fn msr_bitmap_address(&self) -> *const u8 {
        self.msr_bitmap.0.as_ptr()
    }

    /// The per-processor slot for `index`.
    ///
    /// The array lives immediately behind the header; `GlobalData` is
    /// page-aligned and page-granular, so the slots are too.
    pub fn vp(&self, index: u32) -> *mut VpData {
        debug_assert!(index < self.vp_count);
        unsafe { (ptr::from_ref(self) as *mut u8).add(size_of::<GlobalData>()).cast::<VpData>().add(index as usize) }
    }
}

// The header size must keep the trailing VpData slots page-aligned.
const_assert_eq!(size_of::<GlobalData>() % BASE_PAGE_SIZE, 0);

/// Brings the current processor under the hypervisor.
///
/// This function is observed three times on a successful launch: once
/// normally, once when VMLAUNCH "returns" to the capture point as the guest,
/// and once more after the context restore. The volatile launch flag tells
/// the passes apart. After the capture point, nothing may be trusted except
/// what is re-derived from global state through memory.
#[inline(never)]
pub fn virtualize_current_processor<H: Hal>(system_cr3: u64) -> Result<(), HypervisorError> {
    let global = crate::vmm::global().ok_or(HypervisorError::NotInitialized)?;
    let vp = unsafe { &mut *global.vp(H::current_processor_index()) };

    // Snapshot the state the VMCS will need, then the full register context.
    // The capture records the instruction after itself as the resume point.
    vp.special_registers = SpecialRegisters::capture();
    unsafe { capture_context(&mut vp.host_context) };

    // From here on, execution may be a hardware re-entry running on dirty
    // registers: go back to the published global for every pointer and branch
    // only on the volatile flag.
    let global = crate::vmm::global().ok_or(HypervisorError::NotInitialized)?;
    let vp = unsafe { &mut *global.vp(H::current_processor_index()) };
    match vp.launch_state() {
        VP_PRE_LAUNCH => {
            vp.system_cr3 = system_cr3;
            launch_virtual_processor::<H>(vp, global)
        }
        VP_LAUNCHED => {
            // VMLAUNCH worked: this is the guest, running on dirty registers.
            // Mark the final state and restore the frame captured above; that
            // lands at the capture point once more, with pristine registers.
            vp.set_launch_state(VP_RESUMED);
            unsafe { restore_context(&vp.host_context) };
        }
        _ => {
            debug!("vp {} virtualized", vp.index);
            Ok(())
        }
    }
}

/// Reads the capability MSRs, enters root mode, builds the VMCS, and pulls
/// the trigger. Returns only on failure, with the processor back outside
/// VMX.
fn launch_virtual_processor<H: Hal>(vp: &mut VpData, global: &GlobalData) -> Result<(), HypervisorError> {
    for (i, slot) in vp.vmx_msrs.iter_mut().enumerate() {
        *slot = H::read_msr(msr::IA32_VMX_BASIC + i as u32);
    }

    enter_root_mode::<H>(vp)?;

    let msr_bitmap_pa = H::virt_to_phys(global.msr_bitmap_address());
    setup_vmcs_for_vp(vp, global.eptp, msr_bitmap_pa);

    // The guest-side pass keys off this value.
    vp.set_launch_state(VP_LAUNCHED);

    // On success the next instruction retired is the guest's, at the capture
    // point. Falling through here means the launch failed.
    let err = support::vmlaunch();
    let instruction_error = support::vmread(x86::vmx::vmcs::ro::VM_INSTRUCTION_ERROR);
    error!("VMLAUNCH failed on vp {} with instruction error {instruction_error}", vp.index);

    vp.set_launch_state(VP_PRE_LAUNCH);
    support::vmxoff();
    Err(err)
}

/// Asks the hypervisor to let go of the current processor.
///
/// The exit handler catches the distinguished CPUID, executes VMXOFF, and
/// restores context to the instruction right after it. That restore comes in
/// through an IRETQ, which drops the RPL bits from the data segments, so they
/// are put back explicitly before returning; a compatibility-mode thread
/// would otherwise fault on the next segment load.
pub fn devirtualize_current_processor() {
    let _ = support::cpuid(TEARDOWN_CPUID_LEAF, TEARDOWN_CPUID_SUBLEAF);

    unsafe { support::reload_data_segments(KGDT64_R3_DATA | RPL_USER, KGDT64_R3_CMTEB | RPL_USER) };
}
