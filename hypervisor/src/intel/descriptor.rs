//! Conversion of live GDT entries into the shape the VMCS wants.
//!
//! Guest segment state is not captured wholesale by hardware; each segment is
//! described to the VMCS as a (selector, limit, access rights, base) tuple
//! decoded from the descriptor the selector points at.

use {crate::intel::support, bit_field::BitField};

/// Low two bits of a selector: the requested privilege level.
pub const RPL_MASK: u16 = 0b11;

/// Bit 2 of a selector: set when it indexes the LDT instead of the GDT.
const SELECTOR_TABLE_INDEX: u16 = 0b100;

/// The access-rights bit VMX uses to mark a segment register as not usable.
const ACCESS_RIGHTS_UNUSABLE: u32 = 1 << 16;

/// A segment described the way the VMCS guest-state area expects it.
#[derive(Debug, Clone, Copy, Default)]
pub struct VmxSegmentDescriptor {
    pub selector: u16,
    pub limit: u32,
    pub access_rights: u32,
    pub base: u64,
}

impl VmxSegmentDescriptor {
    /// Decodes the descriptor `selector` references in the GDT at `gdt_base`.
    ///
    /// # Safety
    ///
    /// `gdt_base` must point at a GDT whose limit covers `selector`,
    /// including the high eight bytes of 16-byte system descriptors.
    pub unsafe fn from_gdt(gdt_base: u64, selector: u16) -> Self {
        // Kernel selectors never reference the LDT on x64.
        debug_assert_eq!(selector & SELECTOR_TABLE_INDEX, 0);

        let entry = unsafe { *((gdt_base + u64::from(selector & !RPL_MASK)) as *const u64) };

        // Byte 5: type, S, DPL, P. Byte 6: limit 19:16, AVL, L, D/B, G.
        let flags1 = entry.get_bits(40..48) as u32;
        let flags2 = entry.get_bits(48..56) as u32;

        // The three base fields of the legacy descriptor layout.
        let mut base = entry.get_bits(16..40) | (entry.get_bits(56..64) << 24);

        // System descriptors (S clear in the type byte) are 16 bytes; the
        // upper half of the base lives in the next GDT slot. The AVL position
        // does not carry this information, only the top bit of Type does.
        if flags1 & 0b1_0000 == 0 {
            let upper = unsafe { *((gdt_base + u64::from(selector & !RPL_MASK) + 8) as *const u64) };
            base |= (upper & 0xFFFF_FFFF) << 32;
        }

        // VMX access rights: the two flag bytes with the limit nibble
        // (bits 11:8) squeezed out, plus the unusable bit for descriptors
        // that are not present.
        let mut access_rights = flags1 | ((flags2 & 0xF0) << 8);
        if flags1 & 0b1000_0000 == 0 {
            access_rights |= ACCESS_RIGHTS_UNUSABLE;
        }

        Self {
            selector,
            limit: support::segment_limit(selector),
            access_rights,
            base,
        }
    }
}
