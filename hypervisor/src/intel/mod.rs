//! Intel VT-x specific machinery: VMX region management, EPT, VMCS setup,
//! the per-processor launch dance, and the VM-exit path.

pub mod capture;
pub mod controls;
pub mod descriptor;
pub mod entry;
pub mod ept;
pub mod support;
pub mod vmcs;
pub mod vmexit;
pub mod vmxon;
pub mod vp;
