//! Extended Page Tables: the second-level translation that lets the guest OS
//! keep using "physical" addresses while the hypervisor owns the real map.
//!
//! The tree is a straight identity map built at load time from the OS
//! physical-memory ranges, four levels deep, 4 KiB leaves only. Pages the
//! initial walk cannot know about (MMIO, most importantly) are materialized
//! on demand from the EPT-violation handler.
//!
//! Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual:
//! 29.3 THE EXTENDED PAGE TABLE MECHANISM (EPT)

use {
    crate::{error::HypervisorError, hal::Hal},
    bitfield::bitfield,
    core::ptr::{self, NonNull},
    log::*,
    static_assertions::const_assert_eq,
    x86::{
        bits64::paging::{BASE_PAGE_SHIFT, BASE_PAGE_SIZE, VAddr, pd_index, pdpt_index, pml4_index, pt_index},
        msr,
    },
};

/// Entries per table at every level.
const ENTRY_COUNT: usize = 512;

/// Levels in the walk; the EPTP encodes this minus one.
const PAGE_WALK_LEVELS: u32 = 4;

/// Bits of IA32_APIC_BASE holding the page-aligned APIC base.
const APIC_BASE_PAGE_MASK: u64 = 0x000F_FFFF_FFFF_F000;

/// EPT memory types. Values other than these cause EPT misconfigurations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum MemoryType {
    Uncacheable = 0,
    WriteCombining = 1,
    WriteThrough = 4,
    WriteProtected = 5,
    WriteBack = 6,
}

bitfield! {
    /// The extended-page-table pointer: where hardware finds the PML4 and how
    /// it should walk it.
    #[derive(Clone, Copy)]
    pub struct Eptp(u64);
    impl Debug;

    pub memory_type, set_memory_type: 2, 0;
    pub page_walk_length, set_page_walk_length: 5, 3;
    pub enable_access_dirty, set_enable_access_dirty: 6;
    pub pfn, set_pfn: 51, 12;
}

const_assert_eq!(size_of::<Eptp>(), 8);

bitfield! {
    /// One 64-bit entry, at any level of the tree.
    ///
    /// Non-leaf entries use `pfn` to reference the next table and leave the
    /// memory-type bits clear; leaf entries carry the mapped frame and a
    /// memory type. The bit positions are hardware-defined, which is the
    /// whole reason this is explicit bit arithmetic instead of a struct.
    #[derive(Clone, Copy)]
    pub struct EptEntry(u64);
    impl Debug;

    pub readable, set_readable: 0;
    pub writable, set_writable: 1;
    pub executable, set_executable: 2;
    pub memory_type, set_memory_type: 5, 3;
    pub large, set_large: 7;
    pub accessed, set_accessed: 8;
    pub dirty, set_dirty: 9;
    pub pfn, set_pfn: 51, 12;
    pub suppress_ve, set_suppress_ve: 63;
}

const_assert_eq!(size_of::<EptEntry>(), 8);

bitfield! {
    /// Exit qualification reported for an EPT violation.
    #[derive(Clone, Copy)]
    pub struct EptViolationQualification(u64);
    impl Debug;

    pub read_access, set_read_access: 0;
    pub write_access, set_write_access: 1;
    pub execute_access, set_execute_access: 2;
    pub entry_readable, set_entry_readable: 3;
    pub entry_writable, set_entry_writable: 4;
    pub entry_executable, set_entry_executable: 5;
}

impl EptViolationQualification {
    /// True when the walk found no entry at all, as opposed to an entry that
    /// denied the access.
    pub fn entry_missing(&self) -> bool {
        self.0 & (0b111 << 3) == 0
    }
}

/// The EPT tree. One instance exists per load, shared by every processor;
/// mutation is serialized by the mutex the owner wraps this in.
pub struct Ept {
    pml4: *mut EptEntry,
    eptp: Eptp,
}

// The table pointers reference contiguous kernel memory that is valid on
// every processor.
unsafe impl Send for Ept {}

impl Ept {
    /// An engine with no tree. [`Ept::initialize`] builds the real thing.
    pub const fn new() -> Self {
        Self {
            pml4: ptr::null_mut(),
            eptp: Eptp(0),
        }
    }

    /// Allocates the PML4, identity-maps every page of every physical memory
    /// range plus the local APIC page, and derives the EPTP.
    ///
    /// On allocation failure the partially built tree is torn down before the
    /// error is returned.
    pub fn initialize<H: Hal>(&mut self) -> Result<(), HypervisorError> {
        debug_assert!(self.pml4.is_null());

        self.pml4 = Self::allocate_table::<H>()?;

        if let Err(e) = self.build_identity_map::<H>() {
            self.cleanup::<H>();
            return Err(e);
        }

        let mut eptp = Eptp(0);
        eptp.set_pfn(H::virt_to_phys(self.pml4.cast()) >> BASE_PAGE_SHIFT);
        eptp.set_page_walk_length(u64::from(PAGE_WALK_LEVELS - 1));
        eptp.set_memory_type(MemoryType::WriteBack as u64);
        self.eptp = eptp;

        Ok(())
    }

    /// The EPTP value describing this tree. Zero until initialized.
    pub fn eptp(&self) -> u64 {
        self.eptp.0
    }

    /// Frees the whole tree depth-first. Safe to call again afterwards, and
    /// on an engine that never got a PML4.
    pub fn cleanup<H: Hal>(&mut self) {
        if self.pml4.is_null() {
            return;
        }

        for pml4_slot in 0..ENTRY_COUNT {
            let pml4e = unsafe { *self.pml4.add(pml4_slot) };
            if pml4e.0 == 0 {
                continue;
            }

            let pdpt = Self::table_from_entry::<H>(pml4e);
            for pdpt_slot in 0..ENTRY_COUNT {
                let pdpte = unsafe { *pdpt.add(pdpt_slot) };
                if pdpte.0 == 0 || pdpte.large() {
                    continue;
                }

                let pd = Self::table_from_entry::<H>(pdpte);
                for pd_slot in 0..ENTRY_COUNT {
                    let pde = unsafe { *pd.add(pd_slot) };
                    if pde.0 == 0 || pde.large() {
                        continue;
                    }

                    Self::free_table::<H>(Self::table_from_entry::<H>(pde));
                }

                Self::free_table::<H>(pd);
            }

            Self::free_table::<H>(pdpt);
        }

        Self::free_table::<H>(self.pml4);
        self.pml4 = ptr::null_mut();
        self.eptp = Eptp(0);
    }

    /// Installs an identity mapping for the 4 KiB page containing `gpa`,
    /// creating intermediate tables as needed. An already-present leaf is
    /// left untouched.
    pub fn map_page<H: Hal>(&mut self, gpa: u64) -> Result<(), HypervisorError> {
        if self.pml4.is_null() {
            return Err(HypervisorError::NotInitialized);
        }

        Self::populate_identity::<H>(self.pml4, PAGE_WALK_LEVELS, gpa)
    }

    /// Services an EPT violation for `gpa`.
    ///
    /// A missing translation is expected, lazily mapped, and flushed with a
    /// single-context INVEPT. A violation on a *present* entry means the tree
    /// is granting the wrong rights somewhere; there is nothing sensible to
    /// do about that, so it is reported as fatal without touching the tree.
    pub fn handle_violation<H: Hal>(&mut self, gpa: u64, qualification: u64) -> Result<(), HypervisorError> {
        let qualification = EptViolationQualification(qualification);

        if !qualification.entry_missing() {
            error!("EPT violation with a present entry: gpa={gpa:#x} qualification={qualification:#x?}");
            return Err(HypervisorError::Fatal);
        }

        self.map_page::<H>(gpa)?;
        H::invept_single_context(self.eptp.0);

        Ok(())
    }

    /// Walks every physical memory range the OS reports and maps each 4 KiB
    /// page in it, then maps the local APIC page, which sits in MMIO space
    /// and is touched far too early after launch to leave to the violation
    /// handler.
    fn build_identity_map<H: Hal>(&mut self) -> Result<(), HypervisorError> {
        let ranges = H::physical_memory_ranges();

        for range in &ranges {
            let mut page = range.base;
            while page < range.base + range.bytes {
                Self::populate_identity::<H>(self.pml4, PAGE_WALK_LEVELS, page)?;
                page += BASE_PAGE_SIZE as u64;
            }
        }

        let apic_base = H::read_msr(msr::IA32_APIC_BASE) & APIC_BASE_PAGE_MASK;
        Self::populate_identity::<H>(self.pml4, PAGE_WALK_LEVELS, apic_base)?;

        trace!("identity map built over {} ranges, APIC at {apic_base:#x}", ranges.len());

        Ok(())
    }

    /// Descends one level of the walk for `gpa`, creating the next table if
    /// the entry is empty, and installs the leaf at the bottom. The depth is
    /// bounded at four, which keeps the recursive form both safe and easier
    /// to follow than the unrolled loop.
    fn populate_identity<H: Hal>(table: *mut EptEntry, level: u32, gpa: u64) -> Result<(), HypervisorError> {
        let index = match level {
            4 => pml4_index(VAddr::from(gpa)),
            3 => pdpt_index(VAddr::from(gpa)),
            2 => pd_index(VAddr::from(gpa)),
            _ => pt_index(VAddr::from(gpa)),
        };
        let entry = unsafe { &mut *table.add(index) };

        if level == 1 {
            if entry.0 == 0 {
                entry.set_readable(true);
                entry.set_writable(true);
                entry.set_executable(true);
                entry.set_memory_type(MemoryType::WriteBack as u64);
                entry.set_pfn(gpa >> BASE_PAGE_SHIFT);
            }
            return Ok(());
        }

        let next = if entry.0 == 0 {
            let next = Self::allocate_table::<H>()?;
            entry.set_readable(true);
            entry.set_writable(true);
            entry.set_executable(true);
            entry.set_pfn(H::virt_to_phys(next.cast()) >> BASE_PAGE_SHIFT);
            next
        } else {
            Self::table_from_entry::<H>(*entry)
        };

        Self::populate_identity::<H>(next, level - 1, gpa)
    }

    /// Allocates and zeroes one 4 KiB table.
    fn allocate_table<H: Hal>() -> Result<*mut EptEntry, HypervisorError> {
        let table = H::allocate_contiguous(BASE_PAGE_SIZE).ok_or(HypervisorError::OutOfResources)?;
        unsafe { ptr::write_bytes(table.as_ptr(), 0, BASE_PAGE_SIZE) };
        Ok(table.as_ptr().cast())
    }

    fn free_table<H: Hal>(table: *mut EptEntry) {
        if let Some(va) = NonNull::new(table.cast::<u8>()) {
            H::free_contiguous(va, BASE_PAGE_SIZE);
        }
    }

    /// Follows a non-leaf entry back to the virtual address of its child.
    fn table_from_entry<H: Hal>(entry: EptEntry) -> *mut EptEntry {
        H::phys_to_virt(entry.pfn() << BASE_PAGE_SHIFT).cast()
    }
}

impl Default for Ept {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::hal::{
            PhysicalMemoryRange,
            testing::{self, STATE, TestHal},
        },
        std::collections::BTreeSet,
    };

    /// Everything the walk can tell us about a tree, collected host-side.
    #[derive(Default)]
    struct TreeView {
        /// Virtual (== physical) addresses of every table, per level.
        tables: Vec<usize>,
        /// Child PFNs referenced by non-leaf entries.
        children: Vec<u64>,
        /// (gpa, entry) for every installed leaf.
        leaves: Vec<(u64, EptEntry)>,
    }

    fn view(ept: &Ept) -> TreeView {
        let mut v = TreeView::default();
        if ept.pml4.is_null() {
            return v;
        }
        v.tables.push(ept.pml4 as usize);
        for i in 0..ENTRY_COUNT {
            let pml4e = unsafe { *ept.pml4.add(i) };
            if pml4e.0 == 0 {
                continue;
            }
            assert_nonleaf(pml4e);
            v.children.push(pml4e.pfn());
            let pdpt = (pml4e.pfn() << BASE_PAGE_SHIFT) as *mut EptEntry;
            v.tables.push(pdpt as usize);
            for j in 0..ENTRY_COUNT {
                let pdpte = unsafe { *pdpt.add(j) };
                if pdpte.0 == 0 {
                    continue;
                }
                assert_nonleaf(pdpte);
                v.children.push(pdpte.pfn());
                let pd = (pdpte.pfn() << BASE_PAGE_SHIFT) as *mut EptEntry;
                v.tables.push(pd as usize);
                for k in 0..ENTRY_COUNT {
                    let pde = unsafe { *pd.add(k) };
                    if pde.0 == 0 {
                        continue;
                    }
                    assert_nonleaf(pde);
                    v.children.push(pde.pfn());
                    let pt = (pde.pfn() << BASE_PAGE_SHIFT) as *mut EptEntry;
                    v.tables.push(pt as usize);
                    for l in 0..ENTRY_COUNT {
                        let pte = unsafe { *pt.add(l) };
                        if pte.0 == 0 {
                            continue;
                        }
                        let gpa = ((i as u64) << 39) | ((j as u64) << 30) | ((k as u64) << 21) | ((l as u64) << 12);
                        v.leaves.push((gpa, pte));
                    }
                }
            }
        }
        v
    }

    fn assert_nonleaf(entry: EptEntry) {
        assert!(entry.readable() && entry.writable() && entry.executable());
        assert!(!entry.large());
    }

    fn leaf_gpas(v: &TreeView) -> BTreeSet<u64> {
        v.leaves.iter().map(|(gpa, _)| *gpa).collect()
    }

    fn set_ranges(ranges: &[PhysicalMemoryRange]) {
        STATE.lock().unwrap().ranges = ranges.to_vec();
    }

    fn outstanding() -> usize {
        STATE.lock().unwrap().outstanding_allocations()
    }

    fn alloc_calls() -> usize {
        STATE.lock().unwrap().alloc_calls
    }

    fn invept_count() -> usize {
        STATE.lock().unwrap().invept_count
    }

    /// Default APIC frame the stubbed MSR reports.
    const APIC_GPA: u64 = 0xFEE0_0000;

    #[test]
    fn address_decomposition_round_trips() {
        for gpa in [0u64, 0x1000, 0xFEE0_0000, 0x7FFF_FFFF_F123, 0xFFFF_FFFF_FFFF, 0x0000_8123_4567_89AB] {
            let gpa = gpa & 0xFFFF_FFFF_FFFF; // 48-bit physical
            let va = VAddr::from(gpa);
            let rebuilt = ((pml4_index(va) as u64) << 39)
                | ((pdpt_index(va) as u64) << 30)
                | ((pd_index(va) as u64) << 21)
                | ((pt_index(va) as u64) << 12)
                | (gpa & 0xFFF);
            assert_eq!(rebuilt, gpa);
        }
    }

    #[test]
    fn mapped_leaves_are_well_formed_identity_entries() {
        let _guard = testing::reset();
        set_ranges(&[]);

        let mut ept = Ept::new();
        ept.initialize::<TestHal>().unwrap();
        for gpa in [0u64, 0x1000, 0x20_3000, 0x7FFF_F000, 0x1_0000_0000] {
            ept.map_page::<TestHal>(gpa).unwrap();
        }

        let v = view(&ept);
        for &(gpa, pte) in &v.leaves {
            assert!(pte.readable() && pte.writable() && pte.executable());
            assert_eq!(pte.memory_type(), MemoryType::WriteBack as u64);
            assert_eq!(pte.pfn(), gpa >> BASE_PAGE_SHIFT);
        }

        // Strict tree: no two parent entries share a child.
        let unique: BTreeSet<u64> = v.children.iter().copied().collect();
        assert_eq!(unique.len(), v.children.len());

        ept.cleanup::<TestHal>();
        assert_eq!(outstanding(), 0);
    }

    #[test]
    fn map_page_is_idempotent() {
        let _guard = testing::reset();
        set_ranges(&[]);

        let mut ept = Ept::new();
        ept.initialize::<TestHal>().unwrap();

        ept.map_page::<TestHal>(0x5000).unwrap();
        let allocs_after_first = alloc_calls();
        let first = view(&ept).leaves;

        ept.map_page::<TestHal>(0x5000).unwrap();
        assert_eq!(alloc_calls(), allocs_after_first);
        let second = view(&ept).leaves;

        assert_eq!(first.len(), second.len());
        for (a, b) in first.iter().zip(second.iter()) {
            assert_eq!(a.0, b.0);
            assert_eq!((a.1).0, (b.1).0);
        }

        ept.cleanup::<TestHal>();
    }

    #[test]
    fn initialize_covers_ranges_and_apic() {
        let _guard = testing::reset();
        set_ranges(&[
            PhysicalMemoryRange { base: 0x0000, bytes: 0x3000 },
            PhysicalMemoryRange { base: 0x8000, bytes: 0x1000 },
        ]);

        let mut ept = Ept::new();
        ept.initialize::<TestHal>().unwrap();

        let expected: BTreeSet<u64> = [0x0000, 0x1000, 0x2000, 0x8000, APIC_GPA].into_iter().collect();
        assert_eq!(leaf_gpas(&view(&ept)), expected);

        ept.cleanup::<TestHal>();
        assert_eq!(outstanding(), 0);
    }

    #[test]
    fn eptp_references_the_pml4_with_writeback_four_level_walk() {
        let _guard = testing::reset();
        set_ranges(&[]);

        let mut ept = Ept::new();
        ept.initialize::<TestHal>().unwrap();

        let eptp = Eptp(ept.eptp());
        assert_eq!(eptp.memory_type(), MemoryType::WriteBack as u64);
        assert_eq!(eptp.page_walk_length(), 3);
        assert_eq!(eptp.pfn() << BASE_PAGE_SHIFT, ept.pml4 as u64);

        ept.cleanup::<TestHal>();
        assert_eq!(Eptp(ept.eptp()).0, 0);
    }

    #[test]
    fn single_range_build_matches_expected_shape() {
        // A megabyte of RAM at zero plus the APIC page: 257 leaves, six
        // tables (PML4, one PDPT, and a PD+PT pair under PDPT slots 0 and 3),
        // and only PML4[0] populated.
        let _guard = testing::reset();
        set_ranges(&[PhysicalMemoryRange { base: 0, bytes: 0x10_0000 }]);

        let mut ept = Ept::new();
        ept.initialize::<TestHal>().unwrap();

        let v = view(&ept);
        assert_eq!(v.leaves.len(), 257);
        assert_eq!(v.tables.len(), 6);

        let set_pml4_slots: Vec<usize> =
            (0..ENTRY_COUNT).filter(|&i| unsafe { *ept.pml4.add(i) }.0 != 0).collect();
        assert_eq!(set_pml4_slots, vec![0]);

        ept.cleanup::<TestHal>();
        assert_eq!(outstanding(), 0);
    }

    #[test]
    fn disjoint_ranges_share_one_page_table() {
        let _guard = testing::reset();
        set_ranges(&[
            PhysicalMemoryRange { base: 0x1000, bytes: 0x1000 },
            PhysicalMemoryRange { base: 0x4000, bytes: 0x1000 },
        ]);

        let mut ept = Ept::new();
        ept.initialize::<TestHal>().unwrap();

        let v = view(&ept);
        assert_eq!(v.leaves.len(), 3); // two RAM pages plus the APIC page

        // Both RAM pages land in the same page table, at slots 1 and 4.
        let pml4e = unsafe { *ept.pml4 };
        let pdpt = (pml4e.pfn() << BASE_PAGE_SHIFT) as *mut EptEntry;
        let pdpte = unsafe { *pdpt };
        let pd = (pdpte.pfn() << BASE_PAGE_SHIFT) as *mut EptEntry;
        let pde = unsafe { *pd };
        let pt = (pde.pfn() << BASE_PAGE_SHIFT) as *mut EptEntry;
        let set_pt_slots: Vec<usize> = (0..ENTRY_COUNT).filter(|&i| unsafe { *pt.add(i) }.0 != 0).collect();
        assert_eq!(set_pt_slots, vec![1, 4]);

        ept.cleanup::<TestHal>();
    }

    #[test]
    fn violation_on_missing_entry_maps_and_invalidates() {
        let _guard = testing::reset();
        set_ranges(&[]);

        let mut ept = Ept::new();
        ept.initialize::<TestHal>().unwrap();
        let leaves_before = view(&ept).leaves.len();

        ept.handle_violation::<TestHal>(0x7000, 0).unwrap();

        let v = view(&ept);
        assert_eq!(v.leaves.len(), leaves_before + 1);
        assert!(leaf_gpas(&v).contains(&0x7000));
        assert_eq!(invept_count(), 1);

        ept.cleanup::<TestHal>();
    }

    #[test]
    fn violation_on_present_entry_is_fatal_and_mutates_nothing() {
        let _guard = testing::reset();
        set_ranges(&[]);

        let mut ept = Ept::new();
        ept.initialize::<TestHal>().unwrap();
        let allocs_before = alloc_calls();
        let leaves_before = view(&ept).leaves.len();

        // Read access denied by an execute-only entry: present, wrong rights.
        let qualification = (1 << 0) | (1 << 5);
        assert_eq!(
            ept.handle_violation::<TestHal>(0x7000, qualification),
            Err(HypervisorError::Fatal)
        );

        assert_eq!(alloc_calls(), allocs_before);
        assert_eq!(view(&ept).leaves.len(), leaves_before);
        assert_eq!(invept_count(), 0);

        ept.cleanup::<TestHal>();
    }

    #[test]
    fn allocation_failure_mid_build_unwinds_completely() {
        let _guard = testing::reset();
        set_ranges(&[PhysicalMemoryRange { base: 0, bytes: 0x40_0000 }]);
        STATE.lock().unwrap().fail_from = Some(4);

        let mut ept = Ept::new();
        assert_eq!(ept.initialize::<TestHal>(), Err(HypervisorError::OutOfResources));

        // initialize unwound itself; an extra cleanup must be a no-op.
        ept.cleanup::<TestHal>();
        assert_eq!(outstanding(), 0);
    }

    #[test]
    fn cleanup_frees_exactly_what_was_allocated() {
        let _guard = testing::reset();
        set_ranges(&[PhysicalMemoryRange { base: 0, bytes: 0x8000 }]);

        let mut ept = Ept::new();
        ept.initialize::<TestHal>().unwrap();
        // Spread extra mappings across distant parts of the address space.
        for gpa in [0x4000_0000u64, 0x2_0000_0000, 0x7F_FFFF_F000] {
            ept.map_page::<TestHal>(gpa).unwrap();
        }
        assert!(outstanding() > 0);

        ept.cleanup::<TestHal>();
        assert_eq!(outstanding(), 0);

        // Idempotent on an already-freed tree.
        ept.cleanup::<TestHal>();
        assert_eq!(outstanding(), 0);
    }

    #[test]
    fn map_page_without_initialize_is_rejected() {
        let _guard = testing::reset();

        let mut ept = Ept::new();
        assert_eq!(ept.map_page::<TestHal>(0x1000), Err(HypervisorError::NotInitialized));
    }
}
