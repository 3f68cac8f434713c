use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;

use crate::block::BlockDevice;
use crate::btree::{self, OidResolver, Physical};
use crate::error::{ApfsError, Result};
use crate::object::{self, ObjectHeader};

/// OMAP key: (oid: u64, xid: u64) — 16 bytes, fixed-size.
const OMAP_KEY_SIZE: u32 = 16;
/// OMAP value: (flags: u32, size: u32, paddr: u64) — 16 bytes, fixed-size.
const OMAP_VAL_SIZE: u32 = 16;

/// Set on an object-map value whose row records a tombstone rather than a
/// live mapping; a resolve against such a row must surface as not-found.
const OMAP_VAL_DELETED: u32 = 0x00000001;

/// Physical location of an object map's own B-tree root, read from the
/// `omap_phys_t` structure that follows the object header.
pub struct ObjectMap {
    pub tree_root: u64,
}

impl ObjectMap {
    /// Read the `omap_phys_t` at a given physical block.
    pub fn read(device: &dyn BlockDevice, omap_block: u64, block_size: u32) -> Result<Self> {
        let block_data = object::read_block(device, omap_block, block_size)?;

        // omap_phys_t layout after obj_phys_t (32 bytes):
        //   om_flags: u32, om_snap_count: u32,
        //   om_tree_type: u32, om_snapshot_tree_type: u32,
        //   om_tree_oid: u64  <- physical block of the omap's own B-tree root
        let mut cursor = Cursor::new(&block_data[ObjectHeader::SIZE..]);
        let _om_flags = cursor.read_u32::<LittleEndian>()?;
        let _om_snap_count = cursor.read_u32::<LittleEndian>()?;
        let _om_tree_type = cursor.read_u32::<LittleEndian>()?;
        let _om_snapshot_tree_type = cursor.read_u32::<LittleEndian>()?;
        let om_tree_oid = cursor.read_u64::<LittleEndian>()?;

        Ok(ObjectMap { tree_root: om_tree_oid })
    }
}

/// An `OidResolver` that delegates virtual-OID resolution to an object map
/// pinned at a fixed transaction: the result is the largest-XID row not
/// exceeding `target_xid` for the matching OID. Rows flagged deleted, and
/// OIDs with no qualifying row, surface as `NotFound`.
pub struct Omap {
    pub tree_root: u64,
    pub block_size: u32,
    pub target_xid: u64,
}

impl Omap {
    pub fn new(tree_root: u64, block_size: u32, target_xid: u64) -> Self {
        Omap { tree_root, block_size, target_xid }
    }

    pub fn lookup(&self, device: &dyn BlockDevice, oid: u64) -> Result<u64> {
        omap_lookup(device, self.tree_root, self.block_size, oid, self.target_xid)
    }
}

impl OidResolver for Omap {
    fn resolve(&self, device: &dyn BlockDevice, oid: u64) -> Result<u64> {
        self.lookup(device, oid)
    }
}

/// Look up a virtual OID in an object-map B-tree, constrained to the
/// largest XID not exceeding `target_xid`. OMAP keys sort by `(oid, xid)`
/// ascending, so every row for a given OID forms a contiguous run; we scan
/// that run and keep the highest XID that still qualifies.
pub fn omap_lookup(
    device: &dyn BlockDevice,
    omap_tree_root: u64,
    block_size: u32,
    oid: u64,
    target_xid: u64,
) -> Result<u64> {
    let range_fn = |key: &[u8]| -> Option<bool> {
        if key.len() < 16 {
            return Some(false);
        }
        let key_oid = u64::from_le_bytes([key[0], key[1], key[2], key[3], key[4], key[5], key[6], key[7]]);
        match key_oid.cmp(&oid) {
            std::cmp::Ordering::Less => Some(false),
            std::cmp::Ordering::Equal => Some(true),
            std::cmp::Ordering::Greater => None,
        }
    };

    let entries = btree::btree_scan(device, omap_tree_root, block_size, OMAP_KEY_SIZE, OMAP_VAL_SIZE, &range_fn, &Physical)?;

    let mut best: Option<(u64, u64)> = None; // (xid, paddr)
    for (key, val) in &entries {
        if key.len() < 16 {
            continue;
        }
        let xid = u64::from_le_bytes([key[8], key[9], key[10], key[11], key[12], key[13], key[14], key[15]]);
        if xid > target_xid {
            continue;
        }
        if best.map_or(true, |(best_xid, _)| xid > best_xid) {
            let (paddr, deleted) = parse_omap_val(val)?;
            if !deleted {
                best = Some((xid, paddr));
            }
        }
    }

    best.map(|(_, paddr)| paddr)
        .ok_or_else(|| ApfsError::NotFound(format!("object map has no entry for oid {oid} at or before xid {target_xid}")))
}

/// Parse an OMAP value: `(flags: u32, size: u32, paddr: u64)`. Returns the
/// physical block address and whether the `deleted` flag is set.
fn parse_omap_val(val: &[u8]) -> Result<(u64, bool)> {
    if val.len() < 16 {
        return Err(ApfsError::Malformed("omap value too short".into()));
    }
    let flags = u32::from_le_bytes([val[0], val[1], val[2], val[3]]);
    let paddr = u64::from_le_bytes([val[8], val[9], val[10], val[11], val[12], val[13], val[14], val[15]]);
    Ok((paddr, flags & OMAP_VAL_DELETED != 0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::ReaderDevice;
    use crate::superblock;

    #[test]
    fn test_parse_omap_val_deleted_flag() {
        let mut val = [0u8; 16];
        val[0..4].copy_from_slice(&OMAP_VAL_DELETED.to_le_bytes());
        val[8..16].copy_from_slice(&42u64.to_le_bytes());
        let (paddr, deleted) = parse_omap_val(&val).unwrap();
        assert_eq!(paddr, 42);
        assert!(deleted);
    }

    #[test]
    fn test_parse_omap_val_too_short() {
        assert!(parse_omap_val(&[0u8; 8]).is_err());
    }

    /// Requires tests/appfs.raw fixture. Run with `cargo test -- --ignored`.
    #[test]
    #[ignore]
    fn test_omap_lookup_fixture() {
        let file = std::fs::File::open("tests/appfs.raw").unwrap();
        let device = ReaderDevice::new(file);

        let nxsb = superblock::read_nxsb(&device).unwrap();
        let (latest, _map) = superblock::scan_checkpoint(&device, &nxsb).unwrap();

        let om = ObjectMap::read(&device, latest.omap_oid, latest.block_size).unwrap();
        let vol_oid = latest.fs_oids.iter().find(|&&o| o != 0).copied().unwrap();

        let vol_block = omap_lookup(&device, om.tree_root, latest.block_size, vol_oid, latest.next_xid - 1).unwrap();
        assert!(vol_block > 0 && vol_block < latest.block_count);

        let vol_data = object::read_block(&device, vol_block, latest.block_size).unwrap();
        let vol_sb = superblock::ApfsSuperblock::parse(&vol_data).unwrap();
        assert_eq!(vol_sb.magic, superblock::APSB_MAGIC);
    }
}
