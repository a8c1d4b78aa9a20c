//! Progress and sizing arithmetic.

use crate::format::ZONE_MEDIA;
use crate::volume::ZoneExtent;

/// Sectors of standard-definition recording per hour.
pub const SD_SECTORS_PER_HOUR: u64 = 1_630_000;

/// Volumes below this size carry no firmware reservation.
const RESERVE_FLOOR: u64 = 14_680_064;
/// Volumes above this size carry the full reservation.
const RESERVE_CEILING: u64 = 75_497_472;
/// The full firmware reservation, in sectors.
const RESERVE_FULL: u64 = 12_582_912;

/// Fixed-point completion percentage in hundredths (0..=10000).
///
/// The scaling strategy is picked from the magnitude of `max` so the
/// intermediate product never overflows 32 bits.
pub fn percent(current: u32, max: u32) -> u32 {
    if max == 0 {
        return 0;
    }
    if max <= 0x7fff_ffff / 10_000 {
        current * 10_000 / max
    } else if max <= 0x7fff_ffff / 100 {
        current * 100 / (max / 100)
    } else {
        current / (max / 10_000)
    }
}

/// Usable sectors of a volume after the firmware reservation.
///
/// The reservation is zero below the floor, grows at a quarter of the
/// excess above it, and saturates at the full fixed amount; the curve is
/// continuous and monotonic over the whole range.
pub fn sectors_no_reserved(sectors: u64) -> u64 {
    let reserved = sectors
        .saturating_sub(RESERVE_FLOOR)
        .div_euclid(4)
        .min(RESERVE_FULL);
    sectors - reserved
}

/// Accumulated media capacity milestones, in sectors.
///
/// Media zones accumulate; each non-media zone boundary collapses what has
/// accumulated so far into a single milestone. The result is one running
/// total per upgrade step of the drive.
pub fn media_tiers(zones: &[ZoneExtent]) -> Vec<u64> {
    let mut sizes: Vec<u64> = Vec::new();
    for zone in zones {
        if zone.zone_type == ZONE_MEDIA {
            sizes.push(zone.size);
        } else {
            while sizes.len() > 1 {
                let last = sizes.pop().unwrap();
                sizes[0] += last;
            }
        }
    }
    let mut tiers = Vec::with_capacity(sizes.len());
    let mut running = 0u64;
    for size in sizes {
        running += size;
        tiers.push(running);
    }
    tiers
}

/// Media sectors that will land in the image, given the sector count of the
/// backed-up volume prefix.
pub fn media_in_backup(zones: &[ZoneExtent], backup_sectors: u64) -> u64 {
    zones
        .iter()
        .filter(|z| z.zone_type == ZONE_MEDIA && z.first < backup_sectors)
        .map(|z| z.size)
        .sum()
}

/// Estimated standard-definition recording hours for a capacity tier.
pub fn recording_hours(sectors: u64) -> u64 {
    sectors_no_reserved(sectors) / SD_SECTORS_PER_HOUR
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{ZONE_APPLICATION, ZONE_INODE};

    #[test]
    fn percent_endpoints() {
        for max in [1u32, 9_999, 214_748, 0x7fff_ffff / 100, 0x7fff_fff0] {
            assert_eq!(percent(0, max), 0, "max={max}");
            let full = percent(max, max);
            assert!((9_990..=10_000).contains(&full), "max={max} full={full}");
        }
    }

    #[test]
    fn percent_monotonic_in_all_regimes() {
        for max in [10_000u32, 30_000_000, 0x7fff_fff0] {
            let mut last = 0;
            for step in 0..=100u32 {
                let x = (max as u64 * step as u64 / 100) as u32;
                let p = percent(x, max);
                assert!(p >= last, "max={max} x={x}: {p} < {last}");
                last = p;
            }
        }
    }

    #[test]
    fn percent_zero_max_is_zero() {
        assert_eq!(percent(0, 0), 0);
    }

    #[test]
    fn reserve_curve_shape() {
        assert_eq!(sectors_no_reserved(0), 0);
        // Below the floor nothing is reserved.
        assert_eq!(sectors_no_reserved(RESERVE_FLOOR - 1), RESERVE_FLOOR - 1);
        assert_eq!(sectors_no_reserved(RESERVE_FLOOR), RESERVE_FLOOR);
        // Quarter slope in the middle.
        assert_eq!(
            sectors_no_reserved(RESERVE_FLOOR + 4000),
            RESERVE_FLOOR + 4000 - 1000
        );
        // Saturated at the top.
        assert_eq!(
            sectors_no_reserved(RESERVE_CEILING + 10),
            RESERVE_CEILING + 10 - RESERVE_FULL
        );
    }

    #[test]
    fn reserve_curve_monotonic_and_continuous() {
        let saturation = RESERVE_FLOOR + RESERVE_FULL * 4;
        let mut last = 0;
        for x in [
            0,
            1,
            RESERVE_FLOOR - 1,
            RESERVE_FLOOR,
            RESERVE_FLOOR + 1,
            saturation - 1,
            saturation,
            saturation + 1,
            RESERVE_CEILING,
            RESERVE_CEILING + 1,
            u32::MAX as u64,
        ] {
            let y = sectors_no_reserved(x);
            assert!(y >= last, "curve decreased at {x}");
            // A one-sector step never moves the output by more than one.
            assert!(y - sectors_no_reserved(x.saturating_sub(1)) <= 1);
            last = y;
        }
    }

    fn zone(zone_type: u32, first: u64, size: u64) -> ZoneExtent {
        ZoneExtent { zone_type, first, size }
    }

    #[test]
    fn media_tiers_collapse_at_non_media_boundaries() {
        // Original drive: inode, app, media; upgrade added app + media.
        let zones = [
            zone(ZONE_INODE, 100, 50),
            zone(ZONE_APPLICATION, 200, 500),
            zone(ZONE_MEDIA, 1_000, 8_000),
            zone(ZONE_MEDIA, 9_000, 2_000),
            zone(ZONE_APPLICATION, 11_000, 500),
            zone(ZONE_MEDIA, 12_000, 6_000),
        ];
        assert_eq!(media_tiers(&zones), vec![10_000, 16_000]);
    }

    #[test]
    fn media_in_backup_counts_prefix_zones() {
        let zones = [
            zone(ZONE_MEDIA, 1_000, 8_000),
            zone(ZONE_MEDIA, 50_000, 2_000),
        ];
        assert_eq!(media_in_backup(&zones, 10_000), 8_000);
        assert_eq!(media_in_backup(&zones, 60_000), 10_000);
    }
}
