use thiserror::Error;

/// Errors surfaced by public [`crate::Ftl`] operations.
///
/// Bad-block discovery is deliberately not a variant here: per the FTL's
/// propagation policy a newly discovered bad block is remapped and logged,
/// never surfaced to the caller, as long as a spare block exists.
#[derive(Debug, Error)]
pub enum FtlError {
    /// No spare block is available even after running garbage collection.
    #[error("no spare block available")]
    NoSpace,

    /// The low-level driver reported an unrecoverable read/write/erase
    /// failure, or an uncorrectable ECC error was returned for a read.
    #[error("flash i/o failure: {0}")]
    Io(String),

    /// A command-DMA batch reported the target page as locked; the caller
    /// may retry once.
    #[error("device busy")]
    Busy,

    /// The on-flash block table failed validation and `auto_format_flash`
    /// is disabled, so no usable mapping could be recovered at mount.
    #[error("block table corrupt and auto-format disabled")]
    Corrupt,

    /// A [`crate::config::FtlConfig`] precondition was violated.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

pub type Result<T> = core::result::Result<T, FtlError>;
