//! INVD VM-exit handler.

use crate::intel::{
    support,
    vmexit::ExitType,
};

/// Dropping caches without writeback would throw away dirty hypervisor state
/// along with the guest's. Hyper-V serves INVD as WBINVD for the same
/// reason, and nothing in a running kernel distinguishes the two.
pub fn handle_invd() -> ExitType {
    support::wbinvd();
    ExitType::IncrementRip
}
