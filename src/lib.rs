//! Backup and restore engine for MFS volume sets.
//!
//! The engine captures a proprietary on-disk filesystem (raw partitions
//! plus MFS metadata) as a versioned, resumable, checksummed and optionally
//! compressed byte stream, and writes such a stream back onto a target
//! volume set. The core is a cooperative state machine walking a fixed
//! sequence of logical regions: [`session::BackupSession`] pulls bytes out
//! through [`BackupSession::read`](session::BackupSession::read), and
//! [`restore::RestoreSession`] mirrors it push-driven.
//!
//! Volume access is abstracted behind the traits in [`volume`];
//! [`synthetic`] provides in-memory implementations for tests and
//! round-trip verification.

pub mod backup;
pub mod checksum;
pub mod cli;
pub mod compress;
pub mod device;
pub mod error;
pub mod format;
pub mod progress;
pub mod restore;
pub mod segment;
pub mod session;
pub mod state;
pub mod synthetic;
pub mod volume;

pub use error::{Error, Result, StreamError};
