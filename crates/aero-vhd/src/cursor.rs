use std::io::{self, Read, Seek, SeekFrom, Write};

use crate::{DiskError, VirtualDisk};

/// Positioned `std::io` access to a [`VirtualDisk`].
///
/// Reads stop at the end of the disk (returning 0 there); reading from a position past the
/// end and writing beyond capacity are errors. Seeking past the end is allowed.
#[derive(Debug)]
pub struct DiskCursor<D> {
    disk: D,
    pos: u64,
}

impl<D: VirtualDisk> DiskCursor<D> {
    pub fn new(disk: D) -> Self {
        Self { disk, pos: 0 }
    }

    pub fn position(&self) -> u64 {
        self.pos
    }

    pub fn get_ref(&self) -> &D {
        &self.disk
    }

    pub fn get_mut(&mut self) -> &mut D {
        &mut self.disk
    }

    pub fn into_inner(self) -> D {
        self.disk
    }
}

impl<D: VirtualDisk> Read for DiskCursor<D> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let capacity = self.disk.capacity_bytes();
        if self.pos > capacity {
            return Err(DiskError::OutOfBounds {
                offset: self.pos,
                len: buf.len(),
                capacity,
            }
            .into());
        }
        let n = (capacity - self.pos).min(buf.len() as u64) as usize;
        if n == 0 {
            return Ok(0);
        }
        self.disk.read_at(self.pos, &mut buf[..n])?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl<D: VirtualDisk> Write for DiskCursor<D> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.disk.write_at(self.pos, buf)?;
        self.pos = self.pos.checked_add(buf.len() as u64).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "stream position overflow")
        })?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(self.disk.flush()?)
    }
}

impl<D: VirtualDisk> Seek for DiskCursor<D> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let (base, delta) = match pos {
            SeekFrom::Start(offset) => {
                self.pos = offset;
                return Ok(offset);
            }
            SeekFrom::Current(delta) => (i128::from(self.pos), delta),
            SeekFrom::End(delta) => (i128::from(self.disk.capacity_bytes()), delta),
        };

        let next = base + i128::from(delta);
        if next < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "attempt to seek before start of disk",
            ));
        }
        self.pos = u64::try_from(next)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "seek position overflow"))?;
        Ok(self.pos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MemBackend, RawDisk, ZeroDisk};

    #[test]
    fn read_write_seek_follow_position() {
        let disk = RawDisk::create(MemBackend::new(), 4096).unwrap();
        let mut cursor = DiskCursor::new(disk);

        cursor.seek(SeekFrom::Start(1000)).unwrap();
        cursor.write_all(b"abcdef").unwrap();
        assert_eq!(cursor.position(), 1006);

        cursor.seek(SeekFrom::Current(-4)).unwrap();
        let mut buf = [0u8; 4];
        cursor.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"cdef");

        assert_eq!(cursor.seek(SeekFrom::End(-1)).unwrap(), 4095);
        let mut tail = [0u8; 10];
        assert_eq!(cursor.read(&mut tail).unwrap(), 1);
        assert_eq!(cursor.read(&mut tail).unwrap(), 0);
    }

    #[test]
    fn out_of_range_access_fails() {
        let mut cursor = DiskCursor::new(ZeroDisk::new(512));
        assert_eq!(
            cursor.seek(SeekFrom::Current(-1)).unwrap_err().kind(),
            io::ErrorKind::InvalidInput
        );

        cursor.seek(SeekFrom::Start(600)).unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(
            cursor.read(&mut buf).unwrap_err().kind(),
            io::ErrorKind::UnexpectedEof
        );

        let disk = RawDisk::create(MemBackend::new(), 512).unwrap();
        let mut cursor = DiskCursor::new(disk);
        cursor.seek(SeekFrom::Start(510)).unwrap();
        assert!(cursor.write(&[1, 2, 3, 4]).is_err());
    }
}
