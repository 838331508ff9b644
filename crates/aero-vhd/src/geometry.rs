use serde::{Deserialize, Serialize};

use crate::SECTOR_SIZE;

/// Largest sector count a VHD CHS triple can address (65535 × 16 × 255).
const MAX_CHS_SECTORS: u64 = 65535 * 16 * 255;

/// Cylinder/head/sector geometry as stored in the footer at offset 0x38.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Geometry {
    pub cylinders: u16,
    pub heads: u8,
    pub sectors_per_track: u8,
}

impl Geometry {
    pub const fn new(cylinders: u16, heads: u8, sectors_per_track: u8) -> Self {
        Self {
            cylinders,
            heads,
            sectors_per_track,
        }
    }

    /// Geometry for `capacity` bytes using the algorithm from the VHD format appendix.
    ///
    /// The result can address less than `capacity`; the footer's size fields stay authoritative.
    pub fn from_capacity(capacity: u64) -> Self {
        let total_sectors = (capacity / SECTOR_SIZE as u64).min(MAX_CHS_SECTORS);

        let (heads, sectors_per_track, cyl_times_heads) = if total_sectors > 65535 * 16 * 63 {
            (16u64, 255u64, total_sectors / 255)
        } else {
            let mut spt = 17u64;
            let mut cyl_times_heads = total_sectors / spt;
            let mut heads = cyl_times_heads.div_ceil(1024).max(4);

            if cyl_times_heads >= heads * 1024 || heads > 16 {
                spt = 31;
                heads = 16;
                cyl_times_heads = total_sectors / spt;
            }

            if cyl_times_heads >= heads * 1024 {
                spt = 63;
                heads = 16;
                cyl_times_heads = total_sectors / spt;
            }

            (heads, spt, cyl_times_heads)
        };

        let cylinders = cyl_times_heads / heads;
        Self {
            cylinders: cylinders.min(u16::MAX as u64) as u16,
            heads: heads as u8,
            sectors_per_track: sectors_per_track as u8,
        }
    }

    pub fn total_sectors(&self) -> u64 {
        self.cylinders as u64 * self.heads as u64 * self.sectors_per_track as u64
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.total_sectors() * SECTOR_SIZE as u64
    }

    pub(crate) fn to_bytes(self) -> [u8; 4] {
        let c = self.cylinders.to_be_bytes();
        [c[0], c[1], self.heads, self.sectors_per_track]
    }

    pub(crate) fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            cylinders: u16::from_be_bytes([bytes[0], bytes[1]]),
            heads: bytes[2],
            sectors_per_track: bytes[3],
        }
    }
}

impl std::fmt::Display for Geometry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "({}/{}/{})",
            self.cylinders, self.heads, self.sectors_per_track
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_disks_use_17_sectors_per_track() {
        let g = Geometry::from_capacity(10 * 1024 * 1024);
        assert_eq!(g, Geometry::new(301, 4, 17));
        assert!(g.capacity_bytes() <= 10 * 1024 * 1024);
    }

    #[test]
    fn medium_disks_step_up_to_63_spt() {
        let g = Geometry::from_capacity(1024 * 1024 * 1024);
        assert_eq!(g.heads, 16);
        assert_eq!(g.sectors_per_track, 63);
        assert_eq!(g.cylinders, 2080);
    }

    #[test]
    fn huge_disks_clamp_to_max_geometry() {
        let g = Geometry::from_capacity(4 * 1024 * 1024 * 1024 * 1024);
        assert_eq!(g, Geometry::new(65535, 16, 255));
    }

    #[test]
    fn byte_layout_is_big_endian_cylinders() {
        let g = Geometry::new(0x1234, 16, 63);
        assert_eq!(g.to_bytes(), [0x12, 0x34, 16, 63]);
        assert_eq!(Geometry::from_bytes(&g.to_bytes()), g);
    }
}
