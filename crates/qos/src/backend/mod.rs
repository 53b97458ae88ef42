//! Back-end registry.
//!
//! Three interfaces expose the same capability set:
//! 1. **Registers:** Per-logical-CPU model-specific registers.
//! 2. **Kernel filesystem:** The resctrl pseudo-filesystem.
//! 3. **Memory-mapped:** Register blocks for device-side agents,
//!    additive to either CPU-side interface.
//!
//! The CPU-side choice is an enum of operation sets rather than a trait:
//! each variant only carries the operations it really has, and the
//! monitoring and allocation managers match on the variant. Calls that
//! have no implementation on the active variant uniformly return
//! [`Error::InterfaceUnsupported`](crate::common::Error).

pub mod mmio;
pub mod msr;
pub mod resctrl;

use crate::backend::mmio::MmioBackend;
use crate::backend::msr::MsrBackend;
use crate::backend::resctrl::ResctrlBackend;
use crate::common::{Error, Result};
use crate::config::Interface;

/// The active CPU-side back-end.
#[derive(Debug)]
pub enum CpuBackend {
    /// Direct model-specific-register access.
    Msr(MsrBackend),
    /// Kernel resctrl filesystem.
    Resctrl(ResctrlBackend),
}

impl CpuBackend {
    /// # Returns
    ///
    /// `true` when the kernel filesystem is active.
    pub fn is_resctrl(&self) -> bool {
        matches!(self, CpuBackend::Resctrl(_))
    }

    /// # Returns
    ///
    /// The register back-end, or the uniform unsupported error.
    pub fn as_msr(&self) -> Result<&MsrBackend> {
        match self {
            CpuBackend::Msr(b) => Ok(b),
            CpuBackend::Resctrl(_) => Err(Error::InterfaceUnsupported),
        }
    }

    /// # Returns
    ///
    /// The filesystem back-end, or the uniform unsupported error.
    pub fn as_resctrl(&self) -> Result<&ResctrlBackend> {
        match self {
            CpuBackend::Resctrl(b) => Ok(b),
            CpuBackend::Msr(_) => Err(Error::InterfaceUnsupported),
        }
    }
}

/// All back-ends selected at init.
#[derive(Debug)]
pub struct Backends {
    /// The CPU-side interface.
    pub cpu: CpuBackend,
    /// The additive memory-mapped interface, when requested and described
    /// by firmware.
    pub mmio: Option<MmioBackend>,
}

impl Backends {
    /// # Returns
    ///
    /// The memory-mapped back-end, or the uniform unsupported error.
    pub fn mmio(&self) -> Result<&MmioBackend> {
        self.mmio.as_ref().ok_or(Error::InterfaceUnsupported)
    }
}

/// The CPU-side interface an [`Interface`] request resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedCpuInterface {
    /// Direct register access.
    Msr,
    /// Kernel filesystem.
    Resctrl,
}

/// Resolves the configured interface against what the host offers.
///
/// `Auto` and `Mmio` prefer the kernel filesystem when one is mounted and
/// fall back to registers; an explicit `Filesystem` request fails when
/// none is mounted.
///
/// # Arguments
///
/// * `interface` - The configured interface choice.
/// * `resctrl_present` - Whether a resctrl filesystem is mounted.
///
/// # Returns
///
/// The CPU-side interface to open.
pub fn resolve_cpu_interface(
    interface: Interface,
    resctrl_present: bool,
) -> Result<ResolvedCpuInterface> {
    match interface {
        Interface::Register => Ok(ResolvedCpuInterface::Msr),
        Interface::Filesystem => {
            if resctrl_present {
                Ok(ResolvedCpuInterface::Resctrl)
            } else {
                Err(Error::Resource("resctrl filesystem not mounted".into()))
            }
        }
        Interface::Auto | Interface::Mmio => Ok(if resctrl_present {
            ResolvedCpuInterface::Resctrl
        } else {
            ResolvedCpuInterface::Msr
        }),
    }
}
