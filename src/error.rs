//! Error types for packet-level parsing and for the higher-level Snipper/Project API.

use std::fmt::Debug;
use std::io;
use thiserror::Error;

/// Errors that may be encountered while parsing an MPEG transport stream at the packet level.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ParseErrorDetails {
    /// Encountered when a [`crate::SliceReader`] reads out of bounds.
    /// The [`usize`] parameter is the length of the offending read.
    PacketOverrun(usize),
    /// MPEG-TS packet headers must contain a sync byte of 0x47.
    /// This is the error when encountering any other value.
    LostSync,
    /// Encountered for inconsistent adaptation field parses.
    BadAdaptationHeader,
    /// Encountered for inconsistent PSI header/section parses.
    BadPsiHeader,
    /// Encountered for inconsistent PES header parses.
    BadPesHeader,
    /// Encountered when a PSI unit fails its CRC32 check.
    PsiCrcMismatch,
}

/// A packet-level parse error, carrying the byte offset within the packet it was found at.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ParseError {
    /// Byte index within the packet that the error was encountered.
    pub location: usize,
    /// Information about the error.
    pub details: ParseErrorDetails,
}

/// [`std::result::Result`] alias that uses [`ParseError`].
pub type ParseResult<T> = Result<T, ParseError>;

/// Top-level error type for the Snipper/Project API.
///
/// Packet-level [`ParseError`]s are recovered locally by the analyzer (logged and
/// resynchronized); only IO, state, and sink failures propagate this far, per the
/// error-handling design: only these are considered fatal to the operation in progress.
#[derive(Error, Debug)]
pub enum SnipperError {
    /// File open, read, write, or seek failure.
    #[error("IO error on {path}: {source}")]
    Io {
        /// Path the failing operation was performed against.
        path: String,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },

    /// `add_slice` was called with a frame id outside `[0, iframe_count] ∪ {FRAME_ID_INVALID}`.
    #[error("frame id {0} is not a valid slice boundary")]
    IndexMiss(u32),

    /// An API call was made in a lifecycle state that does not permit it, e.g. `write` before
    /// `analyze`, or a reentrant `write`.
    #[error("operation not permitted in current state: {0}")]
    StateViolation(&'static str),

    /// The analyze or write pass was stopped by an explicit cancel signal.
    #[error("operation cancelled")]
    Cancelled,

    /// The sink callback supplied to `write` returned `false`.
    #[error("sink aborted the write at byte offset {0}")]
    SinkFailure(u64),

    /// The project file could not be parsed as JSON.
    #[error("invalid project file: {0}")]
    Project(#[from] serde_json::Error),
}

impl SnipperError {
    /// Wrap an IO error with the path that was being operated on.
    pub fn io(path: impl Into<String>, source: io::Error) -> Self {
        SnipperError::Io {
            path: path.into(),
            source,
        }
    }
}

/// [`std::result::Result`] alias that uses [`SnipperError`].
pub type Result<T> = std::result::Result<T, SnipperError>;
