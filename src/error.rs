//! Error types for the backup/restore engine.

use thiserror::Error;

/// Main error type for backup and restore operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Conflicting or malformed options. Reported before any session exists.
    #[error("invalid configuration: {reason}")]
    Config { reason: String },

    /// A device could not be opened, is locked, or carries no recognizable
    /// volume signature. Session creation fails atomically.
    #[error("cannot initialize session: {reason}")]
    Init { reason: String },

    /// The volume turned out to be structurally inconsistent during the
    /// initial enumeration phase.
    #[error("volume scan failed: {reason}")]
    Scan { reason: String },

    /// A fault inside a state handler. The session that raised this is
    /// permanently halted; later driver calls return it again.
    #[error("{0}")]
    Stream(#[from] StreamError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias used throughout the library.
pub type Result<T> = std::result::Result<T, Error>;

/// A structured stream fault recorded by a state handler.
///
/// Handlers on the hot path only store the kind and its payload; the message
/// is rendered when the error is displayed, never when it is recorded.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    #[error("short read at sector {sector} ({count} sectors requested)")]
    ShortRead { sector: u64, count: u32 },

    #[error("short write at sector {sector} ({count} sectors requested)")]
    ShortWrite { sector: u64, count: u32 },

    #[error("error reading inode {inode}")]
    InodeRead { inode: u32 },

    #[error("error writing inode {inode}")]
    InodeWrite { inode: u32 },

    #[error("inode sector claims {count} extents (limit {limit})")]
    ExtentCount { count: u32, limit: u32 },

    #[error("compression failure in state {state}")]
    Compressor { state: &'static str },

    #[error("decompression failure in state {state}")]
    Decompressor { state: &'static str },

    #[error("unknown backup magic {magic:#010x}")]
    BadMagic { magic: u32 },

    #[error("backup stream checksum mismatch (got {got:#010x})")]
    BadChecksum { got: u32 },

    #[error("target device {devno} too small: need {need} sectors, have {have}")]
    TargetTooSmall { devno: u8, need: u64, have: u64 },

    #[error("no target device {devno} for partition {partno}")]
    MissingDevice { devno: u8, partno: u8 },

    #[error("restore session not started before destructive state {state}")]
    NotStarted { state: &'static str },

    #[error("backup stream ended early in state {state}")]
    Truncated { state: &'static str },

    #[error("{context}")]
    Other { context: &'static str },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_errors_format_lazily() {
        let err = StreamError::ShortRead { sector: 1122, count: 2 };
        assert_eq!(
            err.to_string(),
            "short read at sector 1122 (2 sectors requested)"
        );
    }

    #[test]
    fn stream_error_wraps_into_main_error() {
        let err: Error = StreamError::BadMagic { magic: 0xdeadbeef }.into();
        assert!(err.to_string().contains("0xdeadbeef"));
    }
}
