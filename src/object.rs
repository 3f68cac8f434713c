use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;

use crate::block::BlockDevice;
use crate::error::{ApfsError, Result};
use crate::fletcher;

// Object type constants (lower 16 bits of type_and_flags)
pub const OBJECT_TYPE_NX_SUPERBLOCK: u32 = 0x01;
pub const OBJECT_TYPE_BTREE: u32 = 0x02;
pub const OBJECT_TYPE_BTREE_NODE: u32 = 0x03;
pub const OBJECT_TYPE_SPACEMAN: u32 = 0x05;
pub const OBJECT_TYPE_OMAP: u32 = 0x0B;
pub const OBJECT_TYPE_CHECKPOINT_MAP: u32 = 0x0C;
pub const OBJECT_TYPE_FS: u32 = 0x0D;

// Object flag masks (upper 16 bits of type_and_flags). A plain "virtual" object
// carries no storage-type bit at all — 0 is virtual, not physical.
pub const OBJ_VIRTUAL: u32 = 0x00000000;
pub const OBJ_EPHEMERAL: u32 = 0x80000000;
pub const OBJ_PHYSICAL: u32 = 0x40000000;
pub const OBJ_STORAGE_TYPE_MASK: u32 = 0xC0000000;
pub const OBJECT_TYPE_MASK: u32 = 0x0000FFFF;

/// 32-byte header present on every APFS on-disk object. All fields are little-endian.
#[derive(Debug, Clone)]
pub struct ObjectHeader {
    pub checksum: u64,       // 0x00
    pub oid: u64,            // 0x08
    pub xid: u64,            // 0x10
    pub type_and_flags: u32, // 0x18
    pub subtype: u32,        // 0x1C
}

impl ObjectHeader {
    /// Size of the on-disk header in bytes
    pub const SIZE: usize = 32;

    /// Parse an object header from the first 32 bytes of a block
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(ApfsError::Malformed(format!(
                "object header too short: {} bytes",
                data.len()
            )));
        }

        let mut cursor = Cursor::new(data);
        Ok(ObjectHeader {
            checksum: cursor.read_u64::<LittleEndian>()?,
            oid: cursor.read_u64::<LittleEndian>()?,
            xid: cursor.read_u64::<LittleEndian>()?,
            type_and_flags: cursor.read_u32::<LittleEndian>()?,
            subtype: cursor.read_u32::<LittleEndian>()?,
        })
    }

    /// Get the object type (lower 16 bits, no flags)
    pub fn object_type(&self) -> u32 {
        self.type_and_flags & OBJECT_TYPE_MASK
    }

    /// Get the storage type flags (upper 2 bits)
    pub fn storage_type(&self) -> u32 {
        self.type_and_flags & OBJ_STORAGE_TYPE_MASK
    }

    /// Whether this is a physical object (address = block number, no indirection)
    pub fn is_physical(&self) -> bool {
        self.storage_type() == OBJ_PHYSICAL
    }

    /// Whether this object lives in the virtual (OMAP-indirected) namespace
    pub fn is_virtual(&self) -> bool {
        self.storage_type() == OBJ_VIRTUAL
    }

    /// Whether this object lives in the ephemeral (checkpoint-map-indirected) namespace
    pub fn is_ephemeral(&self) -> bool {
        self.storage_type() == OBJ_EPHEMERAL
    }
}

/// Read a full block at the given block number, verify its checksum, and parse the header.
pub fn read_object(device: &dyn BlockDevice, block_number: u64, block_size: u32) -> Result<(ObjectHeader, Vec<u8>)> {
    let block = read_block(device, block_number, block_size)?;

    if !fletcher::verify_object(&block) {
        return Err(ApfsError::ChecksumMismatch);
    }

    let header = ObjectHeader::parse(&block)?;
    Ok((header, block))
}

/// Read a block at the given block number without checksum verification.
pub fn read_block(device: &dyn BlockDevice, block_number: u64, block_size: u32) -> Result<Vec<u8>> {
    let offset = block_number * block_size as u64;
    let mut block = vec![0u8; block_size as usize];
    device.read_exact_at(offset, &mut block)?;
    Ok(block)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_parse_roundtrip() {
        let mut block = vec![0u8; 64];
        block[8..16].copy_from_slice(&42u64.to_le_bytes());
        block[16..24].copy_from_slice(&7u64.to_le_bytes());
        block[24..28].copy_from_slice(&OBJECT_TYPE_BTREE.to_le_bytes());
        block[28..32].copy_from_slice(&0u32.to_le_bytes());

        let header = ObjectHeader::parse(&block).unwrap();
        assert_eq!(header.oid, 42);
        assert_eq!(header.xid, 7);
        assert_eq!(header.object_type(), OBJECT_TYPE_BTREE);
        assert!(header.is_virtual());
    }

    #[test]
    fn test_storage_type_flags() {
        let mut block = vec![0u8; 64];
        block[24..28].copy_from_slice(&(OBJECT_TYPE_OMAP | OBJ_PHYSICAL).to_le_bytes());
        let header = ObjectHeader::parse(&block).unwrap();
        assert!(header.is_physical());
        assert!(!header.is_virtual());
        assert!(!header.is_ephemeral());
    }
}
