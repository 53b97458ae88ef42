//! CPUID leaf access.
//!
//! Capability discovery reads feature-enumeration leaves through the
//! [`Cpuid`] trait so that tests can supply canned leaves for arbitrary
//! platforms. [`NativeCpuid`] executes the instruction on the calling CPU.

use crate::common::{Error, Result};

/// Raw output registers of one CPUID invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuidRegs {
    /// EAX output.
    pub eax: u32,
    /// EBX output.
    pub ebx: u32,
    /// ECX output.
    pub ecx: u32,
    /// EDX output.
    pub edx: u32,
}

/// Source of CPUID leaf data.
pub trait Cpuid: Send {
    /// Reads one enumeration leaf.
    ///
    /// # Arguments
    ///
    /// * `leaf` - The leaf number (initial EAX).
    /// * `subleaf` - The sub-leaf number (initial ECX).
    ///
    /// # Returns
    ///
    /// The four output registers of the invocation.
    fn leaf(&self, leaf: u32, subleaf: u32) -> Result<CpuidRegs>;
}

/// Executes the CPUID instruction on the calling CPU.
///
/// Feature-enumeration leaves are identical on every logical CPU, so no
/// affinity pinning is needed for discovery.
#[derive(Debug, Default)]
pub struct NativeCpuid;

impl Cpuid for NativeCpuid {
    #[cfg(target_arch = "x86_64")]
    fn leaf(&self, leaf: u32, subleaf: u32) -> Result<CpuidRegs> {
        // SAFETY: __cpuid_count has no memory effects; it only reads the
        // requested leaf into registers.
        let r = unsafe { core::arch::x86_64::__cpuid_count(leaf, subleaf) };
        Ok(CpuidRegs {
            eax: r.eax,
            ebx: r.ebx,
            ecx: r.ecx,
            edx: r.edx,
        })
    }

    #[cfg(not(target_arch = "x86_64"))]
    fn leaf(&self, _leaf: u32, _subleaf: u32) -> Result<CpuidRegs> {
        Err(Error::Resource(
            "CPUID enumeration requires an x86-64 host".into(),
        ))
    }
}

/// Decodes the vendor identification string.
///
/// # Arguments
///
/// * `leaf0` - The output registers of leaf 0.
///
/// # Returns
///
/// The 12-byte vendor string in register order (EBX, EDX, ECX).
pub fn vendor_string(leaf0: CpuidRegs) -> [u8; 12] {
    let mut s = [0u8; 12];
    s[0..4].copy_from_slice(&leaf0.ebx.to_le_bytes());
    s[4..8].copy_from_slice(&leaf0.edx.to_le_bytes());
    s[8..12].copy_from_slice(&leaf0.ecx.to_le_bytes());
    s
}
