//! Snapshot-metadata B-tree: maps a transaction identifier to the physical
//! block of that snapshot's own volume superblock, plus its user-facing
//! name.

use byteorder::{LittleEndian, ReadBytesExt};
use std::cmp::Ordering;
use std::io::Cursor;

use crate::block::BlockDevice;
use crate::btree::{self, OidResolver};
use crate::error::{ApfsError, Result};

/// One row of the snapshot-metadata tree (`j_snap_metadata_val_t`). Unlike
/// a live volume, a snapshot's superblock is reached by a direct physical
/// block address — it was already resolved once, at snapshot-creation
/// time, and is never indirected through the object map again.
#[derive(Debug, Clone)]
pub struct SnapshotInfo {
    pub xid: u64,
    pub volume_superblock_block: u64,
    pub name: String,
}

const SNAP_METADATA_VAL_FIXED: usize = 40;

fn parse_snap_metadata_val(key: &[u8], val: &[u8]) -> Result<SnapshotInfo> {
    if key.len() < 8 {
        return Err(ApfsError::Malformed("snapshot metadata key too short".into()));
    }
    let xid = u64::from_le_bytes(key[0..8].try_into().unwrap());

    if val.len() < SNAP_METADATA_VAL_FIXED {
        return Err(ApfsError::Malformed("snapshot metadata value too short".into()));
    }
    let mut cursor = Cursor::new(val);
    let _extentref_tree_oid = cursor.read_u64::<LittleEndian>()?;
    let _sblock_oid = cursor.read_u64::<LittleEndian>()?;
    let _create_time = cursor.read_u64::<LittleEndian>()?;
    let _change_time = cursor.read_u64::<LittleEndian>()?;
    let _inum = cursor.read_u64::<LittleEndian>()?;
    let _extentref_tree_type = cursor.read_u32::<LittleEndian>()?;
    let _flags = cursor.read_u32::<LittleEndian>()?;
    let name_len = cursor.read_u16::<LittleEndian>()? as usize;

    let name_start = SNAP_METADATA_VAL_FIXED;
    let name_end = name_start
        .checked_add(name_len)
        .ok_or_else(|| ApfsError::Malformed("snapshot name length overflow".into()))?;
    if name_end > val.len() {
        return Err(ApfsError::Malformed("snapshot name extends beyond value".into()));
    }
    let name_bytes = &val[name_start..name_end];
    let nul = name_bytes.iter().position(|&b| b == 0).unwrap_or(name_bytes.len());
    let name = String::from_utf8_lossy(&name_bytes[..nul]).into_owned();

    // sblock_oid doubles as the physical block for a snapshot's frozen
    // superblock — it is never re-resolved through the live object map.
    Ok(SnapshotInfo { xid, volume_superblock_block: _sblock_oid, name })
}

/// Enumerate every snapshot recorded in a volume's snapshot-metadata tree,
/// in ascending XID order (the tree's natural key order).
pub fn list_snapshots(
    device: &dyn BlockDevice,
    tree_root: u64,
    block_size: u32,
    resolver: &dyn OidResolver,
) -> Result<Vec<SnapshotInfo>> {
    let entries = btree::scan_all(device, tree_root, block_size, 8, 0, resolver)?;
    entries.iter().map(|(key, val)| parse_snap_metadata_val(key, val)).collect()
}

/// Look up one snapshot by its transaction identifier.
pub fn lookup_snapshot(
    device: &dyn BlockDevice,
    tree_root: u64,
    block_size: u32,
    resolver: &dyn OidResolver,
    xid: u64,
) -> Result<SnapshotInfo> {
    let compare_fn = |key: &[u8]| -> Ordering {
        if key.len() < 8 {
            return Ordering::Less;
        }
        let key_xid = u64::from_le_bytes(key[0..8].try_into().unwrap());
        key_xid.cmp(&xid)
    };

    let val = btree::btree_lookup(device, tree_root, block_size, 8, 0, &compare_fn, resolver)?;
    match val {
        Some(data) => {
            let key = xid.to_le_bytes();
            parse_snap_metadata_val(&key, &data)
        }
        None => Err(ApfsError::NotFound(format!("snapshot xid {xid}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_val(sblock_oid: u64, name: &str) -> Vec<u8> {
        let mut v = Vec::new();
        v.extend_from_slice(&0u64.to_le_bytes()); // extentref_tree_oid
        v.extend_from_slice(&sblock_oid.to_le_bytes());
        v.extend_from_slice(&0u64.to_le_bytes()); // create_time
        v.extend_from_slice(&0u64.to_le_bytes()); // change_time
        v.extend_from_slice(&0u64.to_le_bytes()); // inum
        v.extend_from_slice(&0u32.to_le_bytes()); // extentref_tree_type
        v.extend_from_slice(&0u32.to_le_bytes()); // flags
        let name_bytes = name.as_bytes();
        v.extend_from_slice(&((name_bytes.len() + 1) as u16).to_le_bytes());
        v.extend_from_slice(name_bytes);
        v.push(0);
        v
    }

    #[test]
    fn test_parse_snap_metadata_val() {
        let key = 42u64.to_le_bytes();
        let val = sample_val(1000, "before-update");
        let info = parse_snap_metadata_val(&key, &val).unwrap();
        assert_eq!(info.xid, 42);
        assert_eq!(info.volume_superblock_block, 1000);
        assert_eq!(info.name, "before-update");
    }

    #[test]
    fn test_value_too_short_is_malformed() {
        let key = 1u64.to_le_bytes();
        assert!(parse_snap_metadata_val(&key, &[0u8; 4]).is_err());
    }
}
