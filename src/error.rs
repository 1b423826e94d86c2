//! Error types shared by the datapath modules.

use std::io;

use thiserror::Error;

/// Error kinds surfaced by the core. The CLI layer maps each of these to a
/// diagnostic and a nonzero exit code.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid configuration value or inconsistent parameter set.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A syscall failed during setup or on the datapath.
    #[error("{op}: {source}")]
    Os {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    /// A capacity-bounded table is full.
    #[error("capacity exceeded: {0}")]
    Capacity(&'static str),

    /// The next TX slot is still owned by the kernel. Transient; the caller
    /// may retry after waiting for writability.
    #[error("transmit ring busy")]
    TxBusy,
}

impl Error {
    /// Capture `errno` for a failed syscall.
    pub(crate) fn os(op: &'static str) -> Self {
        Error::Os {
            op,
            source: io::Error::last_os_error(),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
