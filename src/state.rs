//! Backup/restore state machine states.
//!
//! Both directions walk the same fixed sequence of logical regions. Each
//! state owns its own typed scratch payload inside the enum variant, so
//! advancing to the next state constructs a fresh value and can never leak
//! scratch data across a transition.

use crate::format::{Format, InodeHeader};

/// One state of the engine, with its resumption scratch embedded.
///
/// The scratch captures the entire resumption cursor: a handler that has to
/// be re-entered for a region too large for one call stores its progress
/// here and nowhere else.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum BackupState {
    /// Scans the volume for what should be backed up. No stream bytes.
    #[default]
    ScanMfs,
    /// The image header.
    Begin,
    /// Packed partition descriptor list.
    InfoPartitions { index: usize },
    /// Packed MFS block range list (V1 only).
    InfoBlocks { index: usize },
    /// Packed MFS volume pair list.
    InfoMfsPartitions { index: usize },
    /// Packed zone map descriptor list (V3 only).
    InfoZoneMaps { index: usize },
    /// Variable-length extra-info records. `offset` is the byte position
    /// inside the record currently being transferred.
    InfoExtra { index: usize, offset: usize },
    /// Zero-pad the packed info region to a 512-byte boundary.
    InfoEnd,
    /// Sector 0 of the primary device.
    BootBlock,
    /// Raw partition bodies, in list order.
    Partitions { index: usize, offset: u64 },
    /// Loads the MFS volume set (restore only; no stream bytes on backup).
    MfsInit,
    /// Raw MFS data ranges (V1 only).
    Blocks { index: usize, offset: u64 },
    /// Sector 0 of the MFS volume set (V3 only from here on).
    VolumeHeader,
    /// Region referenced by the volume header.
    TransactionLog { offset: u64 },
    /// Region referenced by the volume header.
    UnkRegion { offset: u64 },
    /// Recreate zone maps and reinitialize MFS (restore only).
    MfsReinit,
    /// Per-inode metadata sector plus 512-byte-aligned data.
    Inodes {
        index: usize,
        offset: u64,
        header: Option<Box<InodeHeader>>,
    },
    /// The 512-byte trailer ending in the stream checksum.
    Complete { padded: bool },
    /// Terminal; no further stream bytes.
    Done,
}

impl BackupState {
    /// The state that follows this one for the given format version.
    pub fn next(&self, format: Format) -> BackupState {
        use BackupState::*;
        match (self, format) {
            (ScanMfs, _) => Begin,
            (Begin, _) => InfoPartitions { index: 0 },
            (InfoPartitions { .. }, Format::V1) => InfoBlocks { index: 0 },
            (InfoPartitions { .. }, Format::V3) => InfoMfsPartitions { index: 0 },
            (InfoBlocks { .. }, _) => InfoMfsPartitions { index: 0 },
            (InfoMfsPartitions { .. }, Format::V1) => InfoExtra { index: 0, offset: 0 },
            (InfoMfsPartitions { .. }, Format::V3) => InfoZoneMaps { index: 0 },
            (InfoZoneMaps { .. }, _) => InfoExtra { index: 0, offset: 0 },
            (InfoExtra { .. }, _) => InfoEnd,
            (InfoEnd, _) => BootBlock,
            (BootBlock, _) => Partitions { index: 0, offset: 0 },
            (Partitions { .. }, _) => MfsInit,
            (MfsInit, Format::V1) => Blocks { index: 0, offset: 0 },
            (MfsInit, Format::V3) => VolumeHeader,
            (Blocks { .. }, _) => Complete { padded: false },
            (VolumeHeader, _) => TransactionLog { offset: 0 },
            (TransactionLog { .. }, _) => UnkRegion { offset: 0 },
            (UnkRegion { .. }, _) => MfsReinit,
            (MfsReinit, _) => Inodes { index: 0, offset: 0, header: None },
            (Inodes { .. }, _) => Complete { padded: false },
            (Complete { .. }, _) => Done,
            (Done, _) => Done,
        }
    }

    /// Stable name for logging and stream errors.
    pub fn name(&self) -> &'static str {
        use BackupState::*;
        match self {
            ScanMfs => "ScanMfs",
            Begin => "Begin",
            InfoPartitions { .. } => "InfoPartitions",
            InfoBlocks { .. } => "InfoBlocks",
            InfoMfsPartitions { .. } => "InfoMfsPartitions",
            InfoZoneMaps { .. } => "InfoZoneMaps",
            InfoExtra { .. } => "InfoExtra",
            InfoEnd => "InfoEnd",
            BootBlock => "BootBlock",
            Partitions { .. } => "Partitions",
            MfsInit => "MfsInit",
            Blocks { .. } => "Blocks",
            VolumeHeader => "VolumeHeader",
            TransactionLog { .. } => "TransactionLog",
            UnkRegion { .. } => "UnkRegion",
            MfsReinit => "MfsReinit",
            Inodes { .. } => "Inodes",
            Complete { .. } => "Complete",
            Done => "Done",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use BackupState::*;

    fn walk(format: Format) -> Vec<&'static str> {
        let mut names = Vec::new();
        let mut state = BackupState::default();
        loop {
            names.push(state.name());
            if state == Done {
                return names;
            }
            state = state.next(format);
        }
    }

    #[test]
    fn v1_state_order() {
        assert_eq!(
            walk(Format::V1),
            [
                "ScanMfs",
                "Begin",
                "InfoPartitions",
                "InfoBlocks",
                "InfoMfsPartitions",
                "InfoExtra",
                "InfoEnd",
                "BootBlock",
                "Partitions",
                "MfsInit",
                "Blocks",
                "Complete",
                "Done",
            ]
        );
    }

    #[test]
    fn v3_state_order() {
        assert_eq!(
            walk(Format::V3),
            [
                "ScanMfs",
                "Begin",
                "InfoPartitions",
                "InfoMfsPartitions",
                "InfoZoneMaps",
                "InfoExtra",
                "InfoEnd",
                "BootBlock",
                "Partitions",
                "MfsInit",
                "VolumeHeader",
                "TransactionLog",
                "UnkRegion",
                "MfsReinit",
                "Inodes",
                "Complete",
                "Done",
            ]
        );
    }

    #[test]
    fn transitions_construct_fresh_scratch() {
        // Mid-region progress in one state must not survive into the next.
        let state = Partitions { index: 3, offset: 99 };
        assert_eq!(state.next(Format::V1), MfsInit);
        assert_eq!(MfsInit.next(Format::V1), Blocks { index: 0, offset: 0 });

        let state = Inodes {
            index: 41,
            offset: 7,
            header: Some(Box::new(InodeHeader::default())),
        };
        match state.next(Format::V3) {
            Complete { padded } => assert!(!padded),
            other => panic!("unexpected state {other:?}"),
        }
    }

    #[test]
    fn done_is_terminal() {
        assert_eq!(Done.next(Format::V1), Done);
        assert_eq!(Done.next(Format::V3), Done);
    }
}
