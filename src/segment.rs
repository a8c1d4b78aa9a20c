//! Segment thresholds.
//!
//! A threshold splits one logical image across multiple fixed-capacity
//! sinks. The engine itself is segmentation-agnostic; this boundary layer
//! watches the byte stream and rolls to a new sink when the configured cap
//! would be exceeded. Splitting never alters the logical byte stream.

use std::io::Write;

use tracing::info;

use crate::device::SECTOR_SIZE;
use crate::format::{BF_STREAMTOT, BF_THRESHTOT};
use crate::{Error, Result};

/// How a threshold value is accounted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Threshold {
    /// No cap; one sink takes the whole image.
    Unlimited,
    /// Cap each segment at this many sectors.
    PerSegment(u64),
    /// Cap the running total across all segments.
    CumulativeTotal(u64),
    /// Cap the streamed total, counted as bytes leave the engine.
    StreamingTotal(u64),
}

impl Threshold {
    /// Flag bits this mode contributes to the image header. Per-segment
    /// caps are plain sector counts and carry no accounting flag.
    pub fn flag_bits(&self) -> u32 {
        match self {
            Threshold::Unlimited | Threshold::PerSegment(_) => 0,
            Threshold::CumulativeTotal(_) => BF_THRESHTOT,
            Threshold::StreamingTotal(_) => BF_STREAMTOT,
        }
    }
}

/// Convert a kilobyte threshold argument to sectors.
pub fn kilobytes_to_sectors(kb: u64) -> u64 {
    kb * 2048
}

/// A sink that splits the stream into numbered segments.
///
/// `open_segment` is called with the segment ordinal (0-based) whenever the
/// current segment is full; writes stay sector-granular, so a boundary is
/// never overshot by more than one 512-byte unit.
pub struct SegmentSink<F> {
    threshold: Threshold,
    open_segment: F,
    current: Option<Box<dyn Write>>,
    segment: usize,
    segment_sectors: u64,
    total_sectors: u64,
}

impl<F> SegmentSink<F>
where
    F: FnMut(usize) -> std::io::Result<Box<dyn Write>>,
{
    pub fn new(threshold: Threshold, open_segment: F) -> Self {
        Self {
            threshold,
            open_segment,
            current: None,
            segment: 0,
            segment_sectors: 0,
            total_sectors: 0,
        }
    }

    pub fn segments(&self) -> usize {
        self.segment
    }

    pub fn total_sectors(&self) -> u64 {
        self.total_sectors
    }

    fn capacity_left(&self) -> u64 {
        match self.threshold {
            Threshold::Unlimited => u64::MAX,
            Threshold::PerSegment(cap) => cap.saturating_sub(self.segment_sectors),
            Threshold::CumulativeTotal(cap) | Threshold::StreamingTotal(cap) => {
                cap.saturating_sub(self.total_sectors)
            }
        }
    }

    fn roll(&mut self) -> Result<()> {
        let sink = (self.open_segment)(self.segment).map_err(Error::Io)?;
        info!(segment = self.segment, "opened output segment");
        self.current = Some(sink);
        self.segment += 1;
        self.segment_sectors = 0;
        Ok(())
    }

    /// Write one engine buffer, rolling segments as thresholds fill.
    ///
    /// The totals-based modes have nowhere left to roll to once the cap is
    /// reached; they fail instead of silently truncating the image.
    pub fn write(&mut self, mut buf: &[u8]) -> Result<()> {
        while !buf.is_empty() {
            if self.current.is_none() {
                self.roll()?;
            }
            let left = self.capacity_left();
            if left == 0 {
                match self.threshold {
                    Threshold::PerSegment(_) => {
                        self.roll()?;
                        continue;
                    }
                    _ => {
                        return Err(Error::Io(std::io::Error::new(
                            std::io::ErrorKind::WriteZero,
                            "backup total exceeds the configured threshold",
                        )));
                    }
                }
            }
            let take = (buf.len() as u64)
                .min(left.saturating_mul(SECTOR_SIZE as u64)) as usize;
            // A partial trailing sector still counts as one write unit.
            let sectors_taken = (take as u64).div_ceil(SECTOR_SIZE as u64);
            self.current
                .as_mut()
                .unwrap()
                .write_all(&buf[..take])
                .map_err(Error::Io)?;
            self.segment_sectors += sectors_taken;
            self.total_sectors += sectors_taken;
            buf = &buf[take..];
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        if let Some(sink) = self.current.as_mut() {
            sink.flush().map_err(Error::Io)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    type Segments = Arc<Mutex<Vec<Vec<u8>>>>;

    struct SegmentWriter {
        segments: Segments,
        index: usize,
    }

    impl Write for SegmentWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.segments.lock().unwrap()[self.index].extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn collecting_sink(
        threshold: Threshold,
    ) -> (SegmentSink<impl FnMut(usize) -> std::io::Result<Box<dyn Write>>>, Segments) {
        let segments: Segments = Arc::new(Mutex::new(Vec::new()));
        let handle = segments.clone();
        let sink = SegmentSink::new(threshold, move |index| {
            let mut all = handle.lock().unwrap();
            assert_eq!(all.len(), index);
            all.push(Vec::new());
            Ok(Box::new(SegmentWriter { segments: handle.clone(), index })
                as Box<dyn Write>)
        });
        (sink, segments)
    }

    #[test]
    fn unlimited_uses_one_segment() {
        let (mut sink, segments) = collecting_sink(Threshold::Unlimited);
        sink.write(&[0u8; 5 * SECTOR_SIZE]).unwrap();
        sink.write(&[1u8; 3 * SECTOR_SIZE]).unwrap();
        assert_eq!(segments.lock().unwrap().len(), 1);
        assert_eq!(sink.total_sectors(), 8);
    }

    #[test]
    fn per_segment_threshold_rolls_without_overshoot() {
        let (mut sink, segments) = collecting_sink(Threshold::PerSegment(4));
        sink.write(&vec![7u8; 10 * SECTOR_SIZE]).unwrap();
        let all = segments.lock().unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].len(), 4 * SECTOR_SIZE);
        assert_eq!(all[1].len(), 4 * SECTOR_SIZE);
        assert_eq!(all[2].len(), 2 * SECTOR_SIZE);
        // Reassembled segments are the original stream.
        let whole: Vec<u8> = all.iter().flatten().copied().collect();
        assert_eq!(whole, vec![7u8; 10 * SECTOR_SIZE]);
    }

    #[test]
    fn segment_boundary_allows_partial_trailing_sector() {
        let (mut sink, segments) = collecting_sink(Threshold::PerSegment(2));
        // 2.5 sectors: the half sector may finish the current write unit
        // but never starts a new one past the cap.
        sink.write(&vec![3u8; 2 * SECTOR_SIZE + 256]).unwrap();
        let all = segments.lock().unwrap();
        assert_eq!(all[0].len(), 2 * SECTOR_SIZE);
        assert!(all[1].len() <= 2 * SECTOR_SIZE);
    }

    #[test]
    fn cumulative_total_fails_instead_of_truncating() {
        let (mut sink, _) = collecting_sink(Threshold::CumulativeTotal(2));
        assert!(sink.write(&[0u8; 2 * SECTOR_SIZE]).is_ok());
        assert!(sink.write(&[0u8; SECTOR_SIZE]).is_err());
    }

    #[test]
    fn threshold_flag_bits() {
        assert_eq!(Threshold::Unlimited.flag_bits(), 0);
        assert_eq!(Threshold::PerSegment(1).flag_bits(), 0);
        assert_eq!(Threshold::CumulativeTotal(1).flag_bits(), BF_THRESHTOT);
        assert_eq!(Threshold::StreamingTotal(1).flag_bits(), BF_STREAMTOT);
    }

    #[test]
    fn kilobyte_conversion() {
        assert_eq!(kilobytes_to_sectors(1), 2048);
        assert_eq!(kilobytes_to_sectors(100), 204_800);
    }
}
