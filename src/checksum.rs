//! Running integrity checksum over the logical backup stream.
//!
//! The engine feeds every pre-compression byte of the image through a CRC-32
//! and closes the image with a 512-byte trailer whose final word completes
//! the checksum. A verifier hashing the entire logical stream, trailer
//! included, always lands on the same residual value; any single corrupted
//! byte moves it.

use crate::device::SECTOR_SIZE;
use crate::{Result, StreamError};

/// Finalized CRC-32 of any stream that ends in its own appended CRC-32.
pub const STREAM_RESIDUAL: u32 = 0x2144_df1c;

/// Running CRC-32 over the logical (pre-compression) stream.
#[derive(Clone, Default)]
pub struct StreamCrc {
    hasher: crc32fast::Hasher,
}

impl StreamCrc {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    /// Finalized value of everything fed so far, without consuming the
    /// running state.
    pub fn finalize(&self) -> u32 {
        self.hasher.clone().finalize()
    }

    /// Produce the closing trailer block: zero padding with the stream CRC
    /// in the last four bytes.
    pub fn trailer(&self) -> [u8; SECTOR_SIZE] {
        let mut block = [0u8; SECTOR_SIZE];
        let mut hasher = self.hasher.clone();
        hasher.update(&block[..SECTOR_SIZE - 4]);
        let crc = hasher.finalize();
        block[SECTOR_SIZE - 4..].copy_from_slice(&crc.to_le_bytes());
        block
    }

    /// Check the residual after the whole stream, trailer included, has been
    /// fed through `update`.
    pub fn verify_residual(&self) -> Result<()> {
        let got = self.hasher.clone().finalize();
        if got != STREAM_RESIDUAL {
            return Err(StreamError::BadChecksum { got }.into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream_with_trailer(body: &[u8]) -> Vec<u8> {
        let mut crc = StreamCrc::new();
        crc.update(body);
        let trailer = crc.trailer();
        let mut stream = body.to_vec();
        stream.extend_from_slice(&trailer);
        stream
    }

    #[test]
    fn closed_stream_hits_the_residual() {
        let stream = stream_with_trailer(b"some backup payload");
        let mut check = StreamCrc::new();
        check.update(&stream);
        check.verify_residual().unwrap();
    }

    #[test]
    fn empty_body_still_closes() {
        let stream = stream_with_trailer(&[]);
        assert_eq!(stream.len(), SECTOR_SIZE);
        let mut check = StreamCrc::new();
        check.update(&stream);
        check.verify_residual().unwrap();
    }

    #[test]
    fn any_single_byte_flip_breaks_the_residual() {
        let stream = stream_with_trailer(&[0x17u8; 1024]);
        for pos in [0, 511, 1024, stream.len() - 1] {
            let mut bad = stream.clone();
            bad[pos] ^= 0x40;
            let mut check = StreamCrc::new();
            check.update(&bad);
            assert!(check.verify_residual().is_err(), "corruption at {pos} went undetected");
        }
    }
}
