use crate::{DiskError, Result, StorageBackend};

pub fn align_up_u64(value: u64, alignment: u64) -> Result<u64> {
    if alignment == 0 {
        return Err(DiskError::OffsetOverflow);
    }
    let rem = value % alignment;
    if rem == 0 {
        return Ok(value);
    }
    value
        .checked_add(alignment - rem)
        .ok_or(DiskError::OffsetOverflow)
}

pub fn align_down_u64(value: u64, alignment: u64) -> u64 {
    if alignment == 0 {
        return value;
    }
    value - value % alignment
}

pub fn div_ceil_u64(n: u64, d: u64) -> Result<u64> {
    if d == 0 {
        return Err(DiskError::OffsetOverflow);
    }
    Ok(n.div_ceil(d))
}

pub fn checked_range(offset: u64, len: usize, capacity: u64) -> Result<()> {
    let end = offset
        .checked_add(len as u64)
        .ok_or(DiskError::OffsetOverflow)?;
    if end > capacity {
        return Err(DiskError::OutOfBounds {
            offset,
            len,
            capacity,
        });
    }
    Ok(())
}

/// Ones'-complement of the byte sum, as used by both the footer and the dynamic header.
///
/// `skip` is the byte range of the stored checksum field; those bytes are treated as zero.
pub(crate) fn vhd_checksum(buf: &[u8], skip: std::ops::Range<usize>) -> u32 {
    let mut sum = 0u32;
    for (i, b) in buf.iter().enumerate() {
        if skip.contains(&i) {
            continue;
        }
        sum = sum.wrapping_add(*b as u32);
    }
    !sum
}

pub(crate) fn be_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

pub(crate) fn be_u64(bytes: &[u8]) -> u64 {
    u64::from_be_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ])
}

/// Writes `len` zero bytes starting at `offset`, in bounded chunks.
pub(crate) fn write_zeroes<B: StorageBackend + ?Sized>(
    backend: &mut B,
    mut offset: u64,
    mut len: u64,
) -> Result<()> {
    const CHUNK: usize = 64 * 1024;
    let buf = [0u8; CHUNK];
    while len > 0 {
        let to_write = len.min(CHUNK as u64) as usize;
        backend.write_at(offset, &buf[..to_write])?;
        offset = offset
            .checked_add(to_write as u64)
            .ok_or(DiskError::OffsetOverflow)?;
        len -= to_write as u64;
    }
    Ok(())
}

/// Seconds between the Unix epoch and 2000-01-01T00:00:00Z, the VHD timestamp epoch.
pub const VHD_EPOCH_UNIX_SECS: u64 = 946_684_800;

/// Current time as a VHD timestamp. Times before 2000 (or past 2136) saturate.
pub fn vhd_timestamp_now() -> u32 {
    let unix = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    unix.saturating_sub(VHD_EPOCH_UNIX_SECS)
        .min(u32::MAX as u64) as u32
}
