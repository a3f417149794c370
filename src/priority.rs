//! User priority levels and their 802.1Q PCP encoding.
//!
//! The eight PCP values are not ordered the way their numbers suggest: PCP 1
//! ("background") ranks below PCP 0 ("best effort"). The table keeps that
//! inversion, so on a full range level 0 goes out tagged 1 and level 1 tagged 0.

use static_assertions::const_assert_eq;

use crate::errors::{Error, Result};

/// PCP value carried in the VLAN tag for each absolute priority level.
pub const PRIORITY_TO_PCP: [u8; 8] = [1, 0, 2, 3, 4, 5, 6, 7];

const_assert_eq!(PRIORITY_TO_PCP[0], 1);
const_assert_eq!(PRIORITY_TO_PCP[1], 0);

/// The contiguous slice of hardware priority levels one driver instance uses.
///
/// Caller-visible levels always run from zero; `lowest` anchors them on the
/// hardware scale, so a range of `(2, 5)` exposes levels `0..=3`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriorityRange {
    lowest: u8,
    highest: u8,
}

impl PriorityRange {
    pub const MAX_HW_LEVEL: u8 = 7;

    pub fn new(lowest: u8, highest: u8) -> Result<Self> {
        if lowest > highest || highest > Self::MAX_HW_LEVEL {
            return Err(Error::Config(
                "priority range must satisfy lowest <= highest <= 7",
            ));
        }
        Ok(PriorityRange { lowest, highest })
    }

    /// Highest caller-visible level; valid levels are `0..=max_level()`.
    pub fn max_level(&self) -> u8 {
        self.highest - self.lowest
    }

    /// Maps a caller-visible level to its PCP value, failing fast on levels
    /// outside the configured range.
    pub fn pcp_for(&self, level: u8) -> Result<u8> {
        if level > self.max_level() {
            return Err(Error::BadPriority {
                requested: level,
                max: self.max_level(),
            });
        }
        Ok(PRIORITY_TO_PCP[(self.lowest + level) as usize])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_range_keeps_quirk() {
        let range = PriorityRange::new(0, 7).unwrap();
        let mapped: Vec<u8> = (0..=7).map(|l| range.pcp_for(l).unwrap()).collect();
        assert_eq!(mapped, vec![1, 0, 2, 3, 4, 5, 6, 7]);
    }

    #[test]
    fn test_sub_range_offsets_into_table() {
        let range = PriorityRange::new(2, 5).unwrap();
        assert_eq!(range.max_level(), 3);
        let mapped: Vec<u8> = (0..=3).map(|l| range.pcp_for(l).unwrap()).collect();
        assert_eq!(mapped, vec![2, 3, 4, 5]);
    }

    #[test]
    fn test_single_level_range() {
        let range = PriorityRange::new(3, 3).unwrap();
        assert_eq!(range.max_level(), 0);
        assert_eq!(range.pcp_for(0).unwrap(), 3);
        assert!(matches!(
            range.pcp_for(1),
            Err(Error::BadPriority { requested: 1, max: 0 })
        ));
    }

    #[test]
    fn test_out_of_range_level_fails_fast() {
        let range = PriorityRange::new(0, 7).unwrap();
        assert!(matches!(
            range.pcp_for(8),
            Err(Error::BadPriority { requested: 8, max: 7 })
        ));
    }

    #[test]
    fn test_bad_ranges_rejected() {
        assert!(PriorityRange::new(5, 2).is_err());
        assert!(PriorityRange::new(0, 8).is_err());
    }
}
