//! Error types returned by the hypervisor core.

use thiserror::Error;

/// Every way the hypervisor can fail.
///
/// The variants map onto the recovery policy of the caller: `Unsupported`
/// surfaces from the capability probe before anything is allocated,
/// `OutOfResources` unwinds through [`crate::intel::ept::Ept::cleanup`], and
/// `VmxFail` aborts the launch on the current processor only, leaving peers
/// untouched.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HypervisorError {
    #[error("hardware or firmware lacks a required virtualization capability")]
    Unsupported,

    #[error("a contiguous physical allocation failed")]
    OutOfResources,

    #[error("a VMX instruction reported failure")]
    VmxFail,

    #[error("the hypervisor reached a state it cannot recover from")]
    Fatal,

    #[error("the hypervisor global state has not been initialized")]
    NotInitialized,
}
