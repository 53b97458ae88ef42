//! Shared test infrastructure.

pub mod platform;

pub use mock_hw::{MockCpuid, MockMsr};
pub use platform::{
    amd_cpuid, toy_cpuid, toy_msr, toy_qos, toy_qos_custom, toy_qos_with, toy_sysfs, ToyQos,
};
