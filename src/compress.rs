//! Streaming zlib adapter.
//!
//! When a compression level is set, everything after the header sector runs
//! through one zlib stream for the life of the session. The state machine
//! only advances once the compressor has accepted the raw bytes a handler
//! produced, and end-of-stream flushes the compressor even after every state
//! has reported complete.

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

use crate::{Result, StreamError};

const CHUNK: usize = 32 * 1024;

/// Compressing half, used by backup sessions.
pub struct StreamCompressor {
    z: Compress,
    finished: bool,
}

impl StreamCompressor {
    pub fn new(level: u32) -> Self {
        Self {
            z: Compress::new(Compression::new(level), true),
            finished: false,
        }
    }

    /// Compress `input` fully, appending the produced bytes to `out`.
    pub fn write(&mut self, mut input: &[u8], out: &mut Vec<u8>) -> Result<()> {
        while !input.is_empty() {
            out.reserve(CHUNK);
            let before = self.z.total_in();
            let status = self
                .z
                .compress_vec(input, out, FlushCompress::None)
                .map_err(|_| StreamError::Compressor { state: "write" })?;
            let consumed = (self.z.total_in() - before) as usize;
            input = &input[consumed..];
            if status == Status::StreamEnd {
                return Err(StreamError::Compressor { state: "write" }.into());
            }
        }
        Ok(())
    }

    /// Flush all internal buffering and terminate the zlib stream.
    pub fn finish(&mut self, out: &mut Vec<u8>) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        loop {
            out.reserve(CHUNK);
            let status = self
                .z
                .compress_vec(&[], out, FlushCompress::Finish)
                .map_err(|_| StreamError::Compressor { state: "finish" })?;
            if status == Status::StreamEnd {
                self.finished = true;
                return Ok(());
            }
        }
    }
}

/// Decompressing half, used by restore sessions.
pub struct StreamDecompressor {
    z: Decompress,
    done: bool,
}

impl StreamDecompressor {
    pub fn new() -> Self {
        Self {
            z: Decompress::new(true),
            done: false,
        }
    }

    /// Whether the zlib stream has reached its end marker.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Decompress `input` fully, appending the recovered bytes to `out`.
    /// Input past the end of the zlib stream is ignored.
    pub fn write(&mut self, mut input: &[u8], out: &mut Vec<u8>) -> Result<()> {
        while !input.is_empty() && !self.done {
            out.reserve(CHUNK);
            let before = self.z.total_in();
            let status = self
                .z
                .decompress_vec(input, out, FlushDecompress::None)
                .map_err(|_| StreamError::Decompressor { state: "write" })?;
            let consumed = (self.z.total_in() - before) as usize;
            input = &input[consumed..];
            if status == Status::StreamEnd {
                self.done = true;
            } else if consumed == 0 && status == Status::BufError {
                // Needs more input than we have so far.
                return Ok(());
            }
        }
        Ok(())
    }
}

impl Default for StreamDecompressor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compress_then_decompress_round_trips() {
        let body: Vec<u8> = (0..64 * 1024u32).map(|i| (i % 251) as u8).collect();

        let mut comp = StreamCompressor::new(6);
        let mut packed = Vec::new();
        // Feed in uneven pieces to exercise the streaming path.
        for piece in body.chunks(7000) {
            comp.write(piece, &mut packed).unwrap();
        }
        comp.finish(&mut packed).unwrap();
        assert!(packed.len() < body.len());

        let mut decomp = StreamDecompressor::new();
        let mut unpacked = Vec::new();
        for piece in packed.chunks(513) {
            decomp.write(piece, &mut unpacked).unwrap();
        }
        assert!(decomp.is_done());
        assert_eq!(unpacked, body);
    }

    #[test]
    fn finish_is_idempotent() {
        let mut comp = StreamCompressor::new(1);
        let mut out = Vec::new();
        comp.write(b"abc", &mut out).unwrap();
        comp.finish(&mut out).unwrap();
        let len = out.len();
        comp.finish(&mut out).unwrap();
        assert_eq!(out.len(), len);
    }

    #[test]
    fn trailing_garbage_after_stream_end_is_ignored() {
        let mut comp = StreamCompressor::new(9);
        let mut packed = Vec::new();
        comp.write(b"payload", &mut packed).unwrap();
        comp.finish(&mut packed).unwrap();
        packed.extend_from_slice(b"not zlib");

        let mut decomp = StreamDecompressor::new();
        let mut unpacked = Vec::new();
        decomp.write(&packed, &mut unpacked).unwrap();
        assert!(decomp.is_done());
        assert_eq!(unpacked, b"payload");
    }
}
