//! Global hypervisor lifecycle and the per-processor dispatch boundary.
//!
//! The wrapper driver calls [`probe`] and [`initialize`] once from its entry
//! point, then fans [`on_load`] out to every logical processor at elevated
//! priority. Unload is the mirror image: [`on_unload`] per processor, then
//! [`teardown`] once.

use {
    crate::{
        error::HypervisorError,
        hal::Hal,
        intel::{
            ept::Ept,
            vmexit,
            vp::{self, GlobalData, VpData},
        },
    },
    bitflags::bitflags,
    core::{
        ptr::{self, NonNull},
        sync::atomic::{AtomicPtr, Ordering},
    },
    log::*,
    spin::Mutex,
    x86::msr,
};

/// The one process-wide [`GlobalData`], published here once initialization
/// has fully succeeded.
static GLOBAL: AtomicPtr<GlobalData> = AtomicPtr::new(ptr::null_mut());

/// The published global state, if the hypervisor is initialized.
pub fn global() -> Option<&'static GlobalData> {
    unsafe { GLOBAL.load(Ordering::Acquire).as_ref() }
}

bitflags! {
    /// IA32_FEATURE_CONTROL bits the probe cares about.
    struct FeatureControl: u64 {
        const LOCKED = 1 << 0;
        const VMXON_INSIDE_SMX = 1 << 1;
        const VMXON_OUTSIDE_SMX = 1 << 2;
    }
}

/// CPUID.1:ECX feature bits.
const FEATURE_VMX: u32 = 1 << 5;
const FEATURE_HYPERVISOR_PRESENT: u32 = 1 << 31;

/// "GenuineIntel", as CPUID leaf 0 delivers it in EBX/EDX/ECX.
const VENDOR_EBX_GENU: u32 = 0x756E_6547;
const VENDOR_EDX_INEI: u32 = 0x4965_6E69;
const VENDOR_ECX_NTEL: u32 = 0x6C65_746E;

/// Decides whether this machine can be virtualized at all. Called before
/// anything is allocated, so a refusal is free.
pub fn probe<H: Hal>() -> Result<(), HypervisorError> {
    let vendor = H::cpuid(0, 0);
    if (vendor.ebx, vendor.edx, vendor.ecx) != (VENDOR_EBX_GENU, VENDOR_EDX_INEI, VENDOR_ECX_NTEL) {
        warn!("not an Intel processor");
        return Err(HypervisorError::Unsupported);
    }

    let features = H::cpuid(1, 0);
    if features.ecx & FEATURE_VMX == 0 {
        warn!("VMX is not supported");
        return Err(HypervisorError::Unsupported);
    }

    // Someone else is already virtualizing this machine; nesting under them
    // is explicitly not on the menu.
    if features.ecx & FEATURE_HYPERVISOR_PRESENT != 0 {
        warn!("a hypervisor is already present");
        return Err(HypervisorError::Unsupported);
    }

    // An unlocked feature-control MSR means firmware never finished its job.
    // Locking it ourselves is possible but is firmware's call to make, not
    // ours.
    let feature_control = FeatureControl::from_bits_truncate(H::read_msr(msr::IA32_FEATURE_CONTROL));
    if !feature_control.contains(FeatureControl::LOCKED) {
        warn!("IA32_FEATURE_CONTROL is not locked");
        return Err(HypervisorError::Unsupported);
    }
    if !feature_control.contains(FeatureControl::VMXON_OUTSIDE_SMX) {
        warn!("VMXON outside SMX is disabled");
        return Err(HypervisorError::Unsupported);
    }

    // The secondary-control bit must itself be allowed-one before the
    // secondary capability MSR means anything.
    if H::read_msr(msr::IA32_VMX_PROCBASED_CTLS) & (1 << 63) == 0 {
        warn!("secondary processor-based controls are not available");
        return Err(HypervisorError::Unsupported);
    }

    if H::read_msr(msr::IA32_VMX_PROCBASED_CTLS2) & (1 << 33) == 0 {
        warn!("EPT is not available");
        return Err(HypervisorError::Unsupported);
    }

    Ok(())
}

/// Allocates and publishes the global state: the shared MSR bitmap, the
/// per-processor array, and the fully built EPT identity map.
pub fn initialize<H: Hal>() -> Result<(), HypervisorError> {
    probe::<H>()?;

    if global().is_some() {
        error!("hypervisor already initialized");
        return Err(HypervisorError::Fatal);
    }

    let vp_count = H::processor_count();
    let bytes = GlobalData::allocation_size(vp_count);
    let block = H::allocate_contiguous(bytes).ok_or(HypervisorError::OutOfResources)?;

    let global = block.as_ptr().cast::<GlobalData>();
    unsafe {
        // Zeroing covers the MSR bitmap (its entire point) and every VpData
        // slot, including the launch flags.
        ptr::write_bytes(block.as_ptr(), 0, bytes);

        (*global).ept = Mutex::new(Ept::new());
        (*global).eptp = 0;
        (*global).dispatch = vmexit::dispatch::<H>;
        (*global).vp_count = vp_count;

        let vps = block.as_ptr().add(size_of::<GlobalData>()).cast::<VpData>();
        for i in 0..vp_count {
            (*vps.add(i as usize)).index = i;
        }
    }

    // Build the identity map before any processor can launch against it.
    let eptp = {
        let global = unsafe { &*global };
        let mut ept = global.ept.lock();
        match ept.initialize::<H>() {
            Ok(()) => ept.eptp(),
            Err(e) => {
                drop(ept);
                H::free_contiguous(block, bytes);
                return Err(e);
            }
        }
    };
    unsafe { (*global).eptp = eptp };

    GLOBAL.store(global, Ordering::Release);
    info!("hypervisor global state ready for {vp_count} processors");

    Ok(())
}

/// Frees everything [`initialize`] built. Call only after every processor
/// has been devirtualized. Harmless if initialization never happened.
pub fn teardown<H: Hal>() {
    let global = GLOBAL.swap(ptr::null_mut(), Ordering::AcqRel);
    let Some(global_ref) = (unsafe { global.as_ref() }) else {
        return;
    };

    global_ref.ept.lock().cleanup::<H>();

    let bytes = GlobalData::allocation_size(global_ref.vp_count);
    if let Some(block) = NonNull::new(global.cast::<u8>()) {
        H::free_contiguous(block, bytes);
    }
}

/// Per-processor bring-up, run on each CPU by the wrapper's dispatch
/// primitive. `system_cr3` is the system process page-table root, which
/// becomes the hypervisor's own address space on this processor.
pub fn on_load<H: Hal>(system_cr3: u64) -> Result<(), HypervisorError> {
    vp::virtualize_current_processor::<H>(system_cr3)
}

/// Per-processor teardown. After this returns the processor executes
/// normally again.
pub fn on_unload() {
    vp::devirtualize_current_processor();
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::hal::testing::{self, STATE, TestHal},
        x86::cpuid::CpuIdResult,
    };

    /// Puts the stubbed platform into a fully capable state.
    fn stub_supported_platform() {
        let mut state = STATE.lock().unwrap();
        state.cpuid.insert(
            (0, 0),
            CpuIdResult { eax: 0x16, ebx: VENDOR_EBX_GENU, ecx: VENDOR_ECX_NTEL, edx: VENDOR_EDX_INEI },
        );
        state.cpuid.insert((1, 0), CpuIdResult { eax: 0, ebx: 0, ecx: FEATURE_VMX, edx: 0 });
        state.msrs.insert(msr::IA32_FEATURE_CONTROL, 0b101); // locked + outside SMX
        state.msrs.insert(msr::IA32_VMX_PROCBASED_CTLS, 1 << 63);
        state.msrs.insert(msr::IA32_VMX_PROCBASED_CTLS2, 1 << 33);
    }

    #[test]
    fn probe_accepts_a_capable_platform() {
        let _guard = testing::reset();
        stub_supported_platform();

        assert_eq!(probe::<TestHal>(), Ok(()));
    }

    #[test]
    fn probe_rejects_missing_ept() {
        let _guard = testing::reset();
        stub_supported_platform();
        STATE.lock().unwrap().msrs.insert(msr::IA32_VMX_PROCBASED_CTLS2, 0);

        assert_eq!(probe::<TestHal>(), Err(HypervisorError::Unsupported));
    }

    #[test]
    fn probe_rejects_unlocked_feature_control() {
        let _guard = testing::reset();
        stub_supported_platform();
        STATE.lock().unwrap().msrs.insert(msr::IA32_FEATURE_CONTROL, 0b100);

        assert_eq!(probe::<TestHal>(), Err(HypervisorError::Unsupported));
    }

    #[test]
    fn probe_rejects_vmxon_disabled_outside_smx() {
        let _guard = testing::reset();
        stub_supported_platform();
        STATE.lock().unwrap().msrs.insert(msr::IA32_FEATURE_CONTROL, 0b001);

        assert_eq!(probe::<TestHal>(), Err(HypervisorError::Unsupported));
    }

    #[test]
    fn probe_rejects_missing_secondary_controls() {
        let _guard = testing::reset();
        stub_supported_platform();
        STATE.lock().unwrap().msrs.insert(msr::IA32_VMX_PROCBASED_CTLS, 0);

        assert_eq!(probe::<TestHal>(), Err(HypervisorError::Unsupported));
    }

    #[test]
    fn probe_rejects_existing_hypervisor() {
        let _guard = testing::reset();
        stub_supported_platform();
        STATE.lock().unwrap().cpuid.insert(
            (1, 0),
            CpuIdResult { eax: 0, ebx: 0, ecx: FEATURE_VMX | FEATURE_HYPERVISOR_PRESENT, edx: 0 },
        );

        assert_eq!(probe::<TestHal>(), Err(HypervisorError::Unsupported));
    }

    #[test]
    fn probe_rejects_non_intel_vendor() {
        let _guard = testing::reset();
        stub_supported_platform();
        // "AuthenticAMD"
        STATE.lock().unwrap().cpuid.insert(
            (0, 0),
            CpuIdResult { eax: 0x10, ebx: 0x6874_7541, ecx: 0x444D_4163, edx: 0x6974_6E65 },
        );

        assert_eq!(probe::<TestHal>(), Err(HypervisorError::Unsupported));
    }

    #[test]
    fn initialize_publishes_global_state_and_teardown_frees_it() {
        let _guard = testing::reset();
        stub_supported_platform();
        STATE.lock().unwrap().ranges =
            vec![crate::hal::PhysicalMemoryRange { base: 0, bytes: 0x4000 }];

        initialize::<TestHal>().unwrap();

        let global = global().expect("global state published");
        assert_ne!(global.eptp, 0);
        assert_eq!(global.vp_count, 1);
        assert!(!global.vp(0).is_null());

        // The MSR bitmap page must start out all zero: no MSR exits.
        let bitmap = unsafe { core::slice::from_raw_parts(global.msr_bitmap_address(), 4096) };
        assert!(bitmap.iter().all(|&b| b == 0));

        teardown::<TestHal>();
        assert!(super::global().is_none());
        assert_eq!(STATE.lock().unwrap().outstanding_allocations(), 0);

        // A second teardown must be a no-op.
        teardown::<TestHal>();
    }

    #[test]
    fn initialize_unwinds_when_the_ept_build_runs_dry() {
        let _guard = testing::reset();
        stub_supported_platform();
        STATE.lock().unwrap().ranges =
            vec![crate::hal::PhysicalMemoryRange { base: 0, bytes: 0x40_0000 }];
        STATE.lock().unwrap().fail_from = Some(4);

        assert_eq!(initialize::<TestHal>(), Err(HypervisorError::OutOfResources));
        assert!(global().is_none());
        assert_eq!(STATE.lock().unwrap().outstanding_allocations(), 0);
    }

    #[test]
    fn probe_failure_allocates_nothing() {
        let _guard = testing::reset();
        // Nothing stubbed: vendor check fails immediately.
        assert_eq!(initialize::<TestHal>(), Err(HypervisorError::Unsupported));
        assert_eq!(STATE.lock().unwrap().alloc_calls, 0);
    }
}
