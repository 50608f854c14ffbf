//! The seam between the hypervisor core and the hosting OS.
//!
//! Everything the core needs from its environment, memory services, CPU
//! identity, and the handful of instructions the unit tests must be able to
//! intercept, goes through [`Hal`]. The loadable-driver wrapper implements the
//! OS-facing functions; the instruction-shaped ones come with default bodies
//! that execute the real thing.

use {
    crate::intel::support,
    alloc::vec::Vec,
    core::ptr::NonNull,
    x86::cpuid::CpuIdResult,
};

/// One physically contiguous region of installed RAM.
///
/// The wrapper translates the OS range list (ordered, non-overlapping,
/// zero-length sentinel already consumed) into these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysicalMemoryRange {
    /// First byte of the range, 4 KiB aligned.
    pub base: u64,
    /// Length of the range in bytes.
    pub bytes: u64,
}

/// OS and platform services supplied by the wrapper.
pub trait Hal {
    /// Allocates `bytes` of 4 KiB-aligned, physically contiguous,
    /// non-executable (where the OS supports it) memory and returns its
    /// kernel virtual address. The memory is not required to be zeroed.
    fn allocate_contiguous(bytes: usize) -> Option<NonNull<u8>>;

    /// Returns memory obtained from [`Hal::allocate_contiguous`].
    fn free_contiguous(va: NonNull<u8>, bytes: usize);

    /// Translates a kernel virtual address to its physical address.
    fn virt_to_phys(va: *const u8) -> u64;

    /// Translates a physical address of kernel memory back to a virtual
    /// address usable by the hypervisor.
    fn phys_to_virt(pa: u64) -> *mut u8;

    /// The physical memory map of the machine.
    fn physical_memory_ranges() -> Vec<PhysicalMemoryRange>;

    /// Index of the processor this is called on. Callers run at a priority
    /// that keeps the thread pinned, so the value is stable for the duration
    /// of a dispatch callback.
    fn current_processor_index() -> u32;

    /// Number of logical processors, across all processor groups.
    fn processor_count() -> u32;

    /// Reads a model-specific register.
    fn read_msr(msr: u32) -> u64 {
        support::rdmsr(msr)
    }

    /// Executes CPUID for the given leaf and sub-leaf.
    fn cpuid(leaf: u32, subleaf: u32) -> CpuIdResult {
        support::cpuid(leaf, subleaf)
    }

    /// Invalidates cached EPT translations derived from `eptp`.
    fn invept_single_context(eptp: u64) {
        support::invept_single_context(eptp);
    }
}

/// In-process stand-in for the OS services, used by the unit tests.
///
/// Physical and virtual addresses are identical here, which keeps the page
/// walks honest: an entry's PFN shifted back up must be the address of the
/// child table it was derived from.
#[cfg(test)]
pub(crate) mod testing {
    use {
        super::{Hal, PhysicalMemoryRange},
        core::ptr::NonNull,
        std::{
            alloc::{Layout, alloc, dealloc},
            collections::BTreeMap,
            sync::{Mutex, MutexGuard},
        },
        x86::cpuid::CpuIdResult,
    };

    pub struct TestHalState {
        /// Live allocations, keyed by address.
        pub allocations: BTreeMap<usize, usize>,
        /// Total number of allocation attempts so far.
        pub alloc_calls: usize,
        /// When set, the n-th allocation attempt (1-based) and all later ones
        /// fail.
        pub fail_from: Option<usize>,
        pub msrs: BTreeMap<u32, u64>,
        pub cpuid: BTreeMap<(u32, u32), CpuIdResult>,
        pub ranges: Vec<PhysicalMemoryRange>,
        pub invept_count: usize,
    }

    impl TestHalState {
        const fn new() -> Self {
            Self {
                allocations: BTreeMap::new(),
                alloc_calls: 0,
                fail_from: None,
                msrs: BTreeMap::new(),
                cpuid: BTreeMap::new(),
                ranges: Vec::new(),
                invept_count: 0,
            }
        }

        pub fn outstanding_allocations(&self) -> usize {
            self.allocations.len()
        }
    }

    pub static STATE: Mutex<TestHalState> = Mutex::new(TestHalState::new());

    /// Serializes tests that touch the shared state.
    static TEST_LOCK: Mutex<()> = Mutex::new(());

    /// Default APIC base reported by the stubbed IA32_APIC_BASE MSR
    /// (enable bit set, base at the architectural default).
    pub const TEST_APIC_BASE_MSR: u64 = 0xFEE0_0900;

    /// Takes the test lock and resets the stub state to a baseline every test
    /// can build on.
    pub fn reset() -> MutexGuard<'static, ()> {
        let guard = TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let mut state = STATE.lock().unwrap();
        for (&va, &bytes) in &state.allocations {
            unsafe { dealloc(va as *mut u8, Layout::from_size_align(bytes, 0x1000).unwrap()) };
        }
        *state = TestHalState::new();
        state.msrs.insert(x86::msr::IA32_APIC_BASE, TEST_APIC_BASE_MSR);
        guard
    }

    pub struct TestHal;

    impl Hal for TestHal {
        fn allocate_contiguous(bytes: usize) -> Option<NonNull<u8>> {
            let mut state = STATE.lock().unwrap();
            state.alloc_calls += 1;
            if let Some(n) = state.fail_from {
                if state.alloc_calls >= n {
                    return None;
                }
            }
            let layout = Layout::from_size_align(bytes, 0x1000).unwrap();
            let va = unsafe { alloc(layout) };
            let va = NonNull::new(va)?;
            state.allocations.insert(va.as_ptr() as usize, bytes);
            Some(va)
        }

        fn free_contiguous(va: NonNull<u8>, bytes: usize) {
            let mut state = STATE.lock().unwrap();
            let recorded = state.allocations.remove(&(va.as_ptr() as usize));
            assert_eq!(recorded, Some(bytes), "freeing memory that was never allocated");
            unsafe { dealloc(va.as_ptr(), Layout::from_size_align(bytes, 0x1000).unwrap()) };
        }

        fn virt_to_phys(va: *const u8) -> u64 {
            va as u64
        }

        fn phys_to_virt(pa: u64) -> *mut u8 {
            pa as *mut u8
        }

        fn physical_memory_ranges() -> Vec<PhysicalMemoryRange> {
            STATE.lock().unwrap().ranges.clone()
        }

        fn current_processor_index() -> u32 {
            0
        }

        fn processor_count() -> u32 {
            1
        }

        fn read_msr(msr: u32) -> u64 {
            *STATE.lock().unwrap().msrs.get(&msr).unwrap_or(&0)
        }

        fn cpuid(leaf: u32, subleaf: u32) -> CpuIdResult {
            *STATE
                .lock()
                .unwrap()
                .cpuid
                .get(&(leaf, subleaf))
                .unwrap_or(&CpuIdResult { eax: 0, ebx: 0, ecx: 0, edx: 0 })
        }

        fn invept_single_context(_eptp: u64) {
            STATE.lock().unwrap().invept_count += 1;
        }
    }
}
