//! The error taxonomy of the crate.
//!
//! Only [`Error::Format`] is fatal to a whole decode: it means the file is
//! not a minidump. Everything else is raised at the smallest enclosing decode
//! unit (one stream, one module, one thread, one walk step) and converted by
//! the caller into "this item is unavailable" while its siblings stay usable.
use std::io;

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// The file is not a minidump. Aborts the whole decode.
    #[error("invalid dump format: {0}")]
    Format(String),

    /// An entity inside the dump is internally inconsistent, for example an
    /// implausible entry count or an export directory with fewer functions
    /// than names. Fatal only to the entity being decoded.
    #[error("corrupt {0}")]
    Corrupt(String),

    /// A computed virtual address is not readable from the reconstructed
    /// address space. Never fatal; walks and reads stop and keep whatever
    /// they collected so far.
    #[error("unreadable memory at {addr:#x}: {reason}")]
    MemoryFault { addr: u64, reason: &'static str },

    /// The requested value is legitimately absent from this dump, which is
    /// different from corruption. The command line on Vista and later is the
    /// canonical example.
    #[error("data unavailable: {0}")]
    DataUnavailable(&'static str),

    /// A fixed-layout structure ran off the end of its stream or of the file.
    #[error("truncated structure: {0}")]
    Truncated(#[from] scroll::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// Build a [`Error::Corrupt`] from anything displayable.
    pub(crate) fn corrupt(what: impl std::fmt::Display) -> Self {
        Self::Corrupt(what.to_string())
    }

    /// Shorthand for a fault at `addr`.
    pub(crate) fn fault(addr: u64, reason: &'static str) -> Self {
        Self::MemoryFault { addr, reason }
    }
}
