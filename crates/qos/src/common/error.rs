//! Library error definitions.
//!
//! Every public operation returns [`Result`]. The variants mirror the status
//! codes callers have to distinguish:
//! 1. **Caller errors:** `Parameter`, `Init`, `InterfaceUnsupported`.
//! 2. **Platform errors:** `Resource`, `PerfInUse`, `Busy`, `Transport`.
//! 3. **Monitoring outcomes:** `Overflow`, `Unavailable`.
//! 4. **Text handling:** `Parse` for the resctrl schemata and firmware tables.

use thiserror::Error;

/// Result alias used by every public operation in this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Error returned by library operations.
///
/// Out-parameters documented on each entry point are only meaningful when the
/// operation returns `Ok`. Unless noted otherwise on the operation, an error
/// means no state was changed.
#[derive(Debug, Error)]
pub enum Error {
    /// Caller violated a precondition documented on the entry point.
    #[error("invalid parameter: {0}")]
    Parameter(String),

    /// Called before init, after fini, or init called twice.
    #[error("library not initialized")]
    Init,

    /// A capability required by the call is not present on this platform,
    /// or a required system resource could not be obtained.
    #[error("capability not supported: {0}")]
    Resource(String),

    /// Performance counters required for IPC or LLC-miss monitoring are
    /// already in use by another program. State was left unchanged.
    #[error("performance counters already in use")]
    PerfInUse,

    /// A monitoring group requested cores already participating in another
    /// live group. No partial bind was performed.
    #[error("core {0} is already monitored by another group")]
    Busy(u32),

    /// A register read/write or pseudo-filesystem access failed at the OS
    /// boundary.
    #[error("transport failure: {msg}")]
    Transport {
        /// What was being accessed.
        msg: String,
        /// The underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// A counter wrapped during the last poll. Delta fields were adjusted
    /// and are still valid.
    #[error("counter wrapped during last poll")]
    Overflow,

    /// The hardware reported the monitoring sample as not ready after the
    /// retry budget was spent.
    #[error("monitoring data not available")]
    Unavailable,

    /// The requested call has no implementation on the active back-end.
    #[error("operation not supported on the active interface")]
    InterfaceUnsupported,

    /// Structural error in a textual or binary platform description.
    #[error("parse error: {0}")]
    Parse(String),

    /// Any other failure. The accompanying message describes it.
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Wraps an OS-level failure with context about what was being accessed.
    ///
    /// # Arguments
    ///
    /// * `msg` - What was being accessed when the failure happened.
    /// * `source` - The underlying OS error.
    ///
    /// # Returns
    ///
    /// A `Transport` error carrying both.
    pub fn transport(msg: impl Into<String>, source: std::io::Error) -> Self {
        Error::Transport {
            msg: msg.into(),
            source,
        }
    }

    /// Shorthand for a `Parameter` error with a formatted message.
    ///
    /// # Arguments
    ///
    /// * `msg` - The precondition the caller violated.
    ///
    /// # Returns
    ///
    /// A `Parameter` error carrying the message.
    pub fn param(msg: impl Into<String>) -> Self {
        Error::Parameter(msg.into())
    }
}
