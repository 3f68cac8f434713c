use crate::block::BlockDevice;
use crate::catalog::FileExtentVal;
use crate::crypto::XtsContext;
use crate::error::{ApfsError, Result};

/// A decoded, logically-ordered run of a data stream's file extents, ready
/// for random-access reads. Holes between extents (and past the last
/// extent, up to `logical_size`) read as zero.
pub struct ExtentMap {
    logical_size: u64,
    /// (logical_start, physical_block_num, length_bytes, crypto_id)
    entries: Vec<(u64, u64, u64, u64)>,
}

impl ExtentMap {
    /// Build from a data stream's `FILE_EXTENT` rows, each paired with its
    /// true logical offset as read from the row's key (spec §3/§4.10).
    /// Extents are not necessarily densely packed — a sparse file has gaps
    /// between them — so the logical position comes from the key, never
    /// from summing preceding lengths.
    pub fn build(extents: &[(u64, FileExtentVal)], logical_size: u64) -> Self {
        let mut entries = Vec::with_capacity(extents.len());

        for (logical_offset, extent) in extents {
            let length = extent.length();
            if length == 0 {
                continue;
            }
            entries.push((*logical_offset, extent.phys_block_num, length, extent.crypto_id));
        }

        ExtentMap { logical_size, entries }
    }

    pub fn logical_size(&self) -> u64 {
        self.logical_size
    }

    fn find(&self, logical_offset: u64) -> Option<&(u64, u64, u64, u64)> {
        self.entries
            .iter()
            .find(|&&(start, _, length, _)| logical_offset >= start && logical_offset < start + length)
    }

    /// Read up to `buf.len()` bytes starting at logical `offset`. Returns
    /// the number of bytes written, decrypting per-block when the covering
    /// extent's `crypto_id` is non-zero. Gaps between extents, and the tail
    /// past the last extent, materialize as zero bytes.
    pub fn read_at(
        &self,
        device: &dyn BlockDevice,
        block_size: u32,
        crypto: Option<&XtsContext>,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<usize> {
        if offset >= self.logical_size {
            return Ok(0);
        }
        let block_size = block_size as u64;
        let want = (buf.len() as u64).min(self.logical_size - offset) as usize;
        let mut done = 0usize;

        while done < want {
            let logical_pos = offset + done as usize as u64;

            match self.find(logical_pos) {
                None => {
                    // hole: zero-fill up to the next extent start or end of file
                    let next_start = self
                        .entries
                        .iter()
                        .map(|&(start, ..)| start)
                        .filter(|&start| start > logical_pos)
                        .min()
                        .unwrap_or(self.logical_size);
                    let hole_len = (next_start - logical_pos).min((want - done) as u64) as usize;
                    for b in &mut buf[done..done + hole_len] {
                        *b = 0;
                    }
                    done += hole_len;
                }
                Some(&(ext_start, phys_block_num, ext_len, crypto_id)) => {
                    let ext_offset = logical_pos - ext_start;
                    let block_index = ext_offset / block_size;
                    let within_block = (ext_offset % block_size) as usize;
                    let block_number = phys_block_num + block_index;

                    let mut block = vec![0u8; block_size as usize];
                    device.read_exact_at(block_number * block_size, &mut block)?;

                    if crypto_id != 0 {
                        let ctx = crypto.ok_or(ApfsError::Locked)?;
                        let mut fixed: [u8; 4096] = block
                            .as_slice()
                            .try_into()
                            .map_err(|_| ApfsError::Malformed("non-4096 block size with encryption".into()))?;
                        ctx.decrypt_block(block_number, &mut fixed);
                        block = fixed.to_vec();
                    }

                    let remaining_in_extent = (ext_len - ext_offset).min(block_size - within_block as u64);
                    let chunk = (remaining_in_extent as usize).min(want - done);
                    buf[done..done + chunk].copy_from_slice(&block[within_block..within_block + chunk]);
                    done += chunk;
                }
            }
        }

        Ok(done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::ReaderDevice;
    use std::io::Cursor;

    fn extent(logical_offset: u64, phys: u64, len: u64, crypto_id: u64) -> (u64, FileExtentVal) {
        (logical_offset, FileExtentVal { flags_and_length: len, phys_block_num: phys, crypto_id })
    }

    #[test]
    fn test_contiguous_read() {
        let data = (0..(4096u32 * 2)).map(|i| (i % 256) as u8).collect::<Vec<u8>>();
        let device = ReaderDevice::new(Cursor::new(data.clone()));

        let extents = vec![extent(0, 0, 4096 * 2, 0)];
        let map = ExtentMap::build(&extents, 4096 * 2);

        let mut buf = [0u8; 10];
        let n = map.read_at(&device, 4096, None, 4090, &mut buf).unwrap();
        assert_eq!(n, 10);
        assert_eq!(&buf[..], &data[4090..4100]);
    }

    #[test]
    fn test_hole_reads_zero() {
        let device = ReaderDevice::new(Cursor::new(vec![0xffu8; 4096 * 4]));
        // extent covers only the first block; logical size spans two blocks' worth
        let extents = vec![extent(0, 0, 4096, 0)];
        let map = ExtentMap::build(&extents, 4096 * 2);

        let mut buf = [0xAAu8; 8];
        let n = map.read_at(&device, 4096, None, 4096, &mut buf).unwrap();
        assert_eq!(n, 8);
        assert_eq!(buf, [0u8; 8]);
    }

    #[test]
    fn test_encrypted_extent_without_context_is_locked() {
        let device = ReaderDevice::new(Cursor::new(vec![0u8; 4096]));
        let extents = vec![extent(0, 0, 4096, 7)];
        let map = ExtentMap::build(&extents, 4096);

        let mut buf = [0u8; 4];
        let err = map.read_at(&device, 4096, None, 0, &mut buf).unwrap_err();
        assert!(matches!(err, ApfsError::Locked));
    }

    /// An interior hole: extents at logical offsets 0 and 2*block_size,
    /// with a one-block gap between them that must read as zero and must
    /// not shift the second extent's data into the gap.
    #[test]
    fn test_interior_hole_does_not_shift_following_extent() {
        let block_size = 4096u64;
        let mut disk = vec![0u8; (block_size * 4) as usize];
        for b in disk[(block_size as usize)..(block_size as usize * 2)].iter_mut() {
            *b = 0x42;
        }
        let device = ReaderDevice::new(Cursor::new(disk));

        // logical block 0 -> physical block 1, logical block 2 -> physical block 1 again (reused below)
        let extents = vec![extent(0, 1, block_size, 0), extent(2 * block_size, 1, block_size, 0)];
        let map = ExtentMap::build(&extents, 3 * block_size);

        // the hole (logical block 1) must read as zero
        let mut hole_buf = [0xAAu8; 4096];
        let n = map.read_at(&device, 4096, None, block_size, &mut hole_buf).unwrap();
        assert_eq!(n, 4096);
        assert_eq!(hole_buf, [0u8; 4096]);

        // the extent after the hole must read at its own true logical offset, not shifted
        let mut after_hole = [0u8; 4];
        let n = map.read_at(&device, 4096, None, 2 * block_size, &mut after_hole).unwrap();
        assert_eq!(n, 4);
        assert_eq!(after_hole, [0x42, 0x42, 0x42, 0x42]);
    }
}
