//! Core of a minimal Intel VT-x type-2 hypervisor.
//!
//! After loading, every logical processor enters VMX root operation with the
//! already-running OS becoming the guest of an identity-mapped virtual
//! machine. The guest keeps executing with near-native performance until a
//! distinguished CPUID sequence tears the hypervisor back down.
//!
//! The crate deliberately stops at the dispatch boundary: the loadable-driver
//! wrapper, the cross-processor dispatch primitive, and the OS memory
//! services are reached through the [`hal::Hal`] trait and are not
//! implemented here.

#![cfg_attr(not(test), no_std)]

extern crate alloc;
extern crate static_assertions;

pub mod error;
pub mod hal;
pub mod intel;
pub mod vmm;
