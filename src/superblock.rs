use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;

use crate::block::BlockDevice;
use crate::error::{ApfsError, Result};
use crate::object::{self, ObjectHeader, OBJECT_TYPE_CHECKPOINT_MAP, OBJECT_TYPE_NX_SUPERBLOCK};

/// NX_MAGIC = "NXSB" as little-endian u32
pub const NX_MAGIC: u32 = 0x4253584E;

/// APSB_MAGIC = "APSB" as little-endian u32
pub const APSB_MAGIC: u32 = 0x42535041;

/// Maximum number of volume OIDs in a container
pub const NX_MAX_FILE_SYSTEMS: usize = 100;

/// incompatible_features bit 0: "version 1, unsupported"
const NX_INCOMPAT_VERSION1: u64 = 0x1;
/// incompatible_features bit 8: Fusion container, accepted read-only
const NX_INCOMPAT_FUSION: u64 = 0x100;

/// Container superblock (NXSB) — the root structure of an APFS container.
#[derive(Debug, Clone)]
pub struct NxSuperblock {
    pub header: ObjectHeader,
    pub magic: u32,
    pub block_size: u32,
    pub block_count: u64,
    pub features: u64,
    pub readonly_compatible_features: u64,
    pub incompatible_features: u64,
    pub uuid: [u8; 16],
    pub next_oid: u64,
    pub next_xid: u64,
    pub xp_desc_blocks: u32,
    pub xp_data_blocks: u32,
    pub xp_desc_base: u64, // paddr_t — physical block of checkpoint descriptor area
    pub xp_data_base: u64,
    pub xp_desc_next: u32,
    pub xp_data_next: u32,
    pub xp_desc_index: u32,
    pub xp_desc_len: u32,
    pub xp_data_index: u32,
    pub xp_data_len: u32,
    pub spaceman_oid: u64,
    pub omap_oid: u64, // Physical block of container object map
    pub reaper_oid: u64,
    pub max_file_systems: u32,
    pub fs_oids: Vec<u64>, // Volume superblock OIDs (virtual), zero-terminated slots
    pub keylocker_block: u64,
    pub keylocker_blocks: u64,
}

impl NxSuperblock {
    /// Parse the container superblock from a raw block. Checks the
    /// invariants spec.md §4.3 names: `"NXSB"` signature, block size exactly
    /// 4096, incompat-flags bit 0 clear, descriptor block count nonzero with
    /// MSB clear, max volumes ≤ 100.
    pub fn parse(block: &[u8]) -> Result<Self> {
        let header = ObjectHeader::parse(block)?;
        let mut cursor = Cursor::new(block);
        cursor.set_position(ObjectHeader::SIZE as u64);

        let magic = cursor.read_u32::<LittleEndian>()?;
        if magic != NX_MAGIC {
            return Err(ApfsError::InvalidMagic(magic));
        }

        let block_size = cursor.read_u32::<LittleEndian>()?;
        if block_size != 4096 {
            return Err(ApfsError::UnsupportedFormat(format!(
                "block size {block_size} unsupported, only 4096 is accepted"
            )));
        }

        let block_count = cursor.read_u64::<LittleEndian>()?;
        let features = cursor.read_u64::<LittleEndian>()?;
        let readonly_compatible_features = cursor.read_u64::<LittleEndian>()?;
        let incompatible_features = cursor.read_u64::<LittleEndian>()?;

        if incompatible_features & NX_INCOMPAT_VERSION1 != 0 {
            return Err(ApfsError::UnsupportedFormat(
                "container is APFS version 1, unsupported".into(),
            ));
        }

        let mut uuid = [0u8; 16];
        std::io::Read::read_exact(&mut cursor, &mut uuid)?;

        let next_oid = cursor.read_u64::<LittleEndian>()?;
        let next_xid = cursor.read_u64::<LittleEndian>()?;

        let xp_desc_blocks = cursor.read_u32::<LittleEndian>()?;
        let xp_data_blocks = cursor.read_u32::<LittleEndian>()?;
        let xp_desc_base = cursor.read_u64::<LittleEndian>()?;
        let xp_data_base = cursor.read_u64::<LittleEndian>()?;
        let xp_desc_next = cursor.read_u32::<LittleEndian>()?;
        let xp_data_next = cursor.read_u32::<LittleEndian>()?;
        let xp_desc_index = cursor.read_u32::<LittleEndian>()?;
        let xp_desc_len = cursor.read_u32::<LittleEndian>()?;
        let xp_data_index = cursor.read_u32::<LittleEndian>()?;
        let xp_data_len = cursor.read_u32::<LittleEndian>()?;

        // xp_desc_blocks' MSB flags a checkpoint area stored as a tree
        // rather than a plain ring; the source treats that layout the same
        // way for reads. The count itself must have the MSB clear and be
        // nonzero.
        if (xp_desc_blocks & 0x8000_0000) != 0 || xp_desc_blocks == 0 {
            return Err(ApfsError::Malformed(
                "checkpoint descriptor area has invalid block count".into(),
            ));
        }

        let spaceman_oid = cursor.read_u64::<LittleEndian>()?;
        let omap_oid = cursor.read_u64::<LittleEndian>()?;
        let reaper_oid = cursor.read_u64::<LittleEndian>()?;

        let _test_type = cursor.read_u32::<LittleEndian>()?; // nx_test_type
        let max_file_systems = cursor.read_u32::<LittleEndian>()?;
        if max_file_systems as usize > NX_MAX_FILE_SYSTEMS {
            return Err(ApfsError::Malformed(format!(
                "max_file_systems {max_file_systems} exceeds {NX_MAX_FILE_SYSTEMS}"
            )));
        }

        let mut fs_oids = Vec::with_capacity(NX_MAX_FILE_SYSTEMS);
        for _ in 0..NX_MAX_FILE_SYSTEMS {
            fs_oids.push(cursor.read_u64::<LittleEndian>()?);
        }

        // keybag_locker_t: pr_start_paddr: u64, pr_block_count: u64. Present
        // immediately after the fs_oids array.
        let keylocker_block = cursor.read_u64::<LittleEndian>()?;
        let keylocker_blocks = cursor.read_u64::<LittleEndian>()?;

        Ok(NxSuperblock {
            header,
            magic,
            block_size,
            block_count,
            features,
            readonly_compatible_features,
            incompatible_features,
            uuid,
            next_oid,
            next_xid,
            xp_desc_blocks,
            xp_data_blocks,
            xp_desc_base,
            xp_data_base,
            xp_desc_next,
            xp_data_next,
            xp_desc_index,
            xp_desc_len,
            xp_data_index,
            xp_data_len,
            spaceman_oid,
            omap_oid,
            reaper_oid,
            max_file_systems,
            fs_oids,
            keylocker_block,
            keylocker_blocks,
        })
    }

    /// Number of non-zero slots in `fs_oids`; trailing holes never extend
    /// the count, matching spec.md §4.3 ("do not attempt to fill gaps").
    pub fn number_of_volumes(&self) -> usize {
        self.fs_oids.iter().filter(|&&o| o != 0).count()
    }

    /// Bit 8 of incompatible_features: a Fusion (dual-tier) container.
    /// Accepted and read via its primary tier only, per spec.md §1/§9.
    pub fn is_fusion(&self) -> bool {
        self.incompatible_features & NX_INCOMPAT_FUSION != 0
    }
}

/// Volume superblock (APSB) — one per filesystem within a container.
#[derive(Debug, Clone)]
pub struct ApfsSuperblock {
    pub header: ObjectHeader,
    pub magic: u32,
    pub fs_index: u32,
    pub features: u64,
    pub readonly_compatible_features: u64,
    pub incompatible_features: u64,
    pub unmount_time: u64,
    pub fs_reserve_block_count: u64,
    pub fs_quota_block_count: u64,
    pub fs_alloc_count: u64,
    pub root_tree_type: u32,
    pub extentref_tree_type: u32,
    pub snap_meta_tree_type: u32,
    pub omap_oid: u64,      // Physical block of volume object map
    pub root_tree_oid: u64, // Virtual OID of the catalog (fs root) B-tree
    pub extentref_tree_oid: u64,
    pub snap_meta_tree_oid: u64,
    pub revert_to_xid: u64,
    pub revert_to_sblock_oid: u64,
    pub next_obj_id: u64,
    pub num_files: u64,
    pub num_directories: u64,
    pub num_symlinks: u64,
    pub num_other_fsobjects: u64,
    pub num_snapshots: u64,
    pub total_blocks_alloced: u64,
    pub total_blocks_freed: u64,
    pub uuid: [u8; 16],
    pub last_mod_time: u64,
    pub fs_flags: u64,
    pub volume_name: String,
}

/// incompatible_features bit 0: case-insensitive lookups via case folding.
const APFS_INCOMPAT_CASE_INSENSITIVE: u64 = 0x1;
/// fs_flags bit 0: volume is unencrypted.
const APFS_FS_UNENCRYPTED: u64 = 0x1;

impl ApfsSuperblock {
    /// Parse volume superblock from a raw block.
    pub fn parse(block: &[u8]) -> Result<Self> {
        let header = ObjectHeader::parse(block)?;
        let mut cursor = Cursor::new(block);
        cursor.set_position(ObjectHeader::SIZE as u64);

        let magic = cursor.read_u32::<LittleEndian>()?;
        if magic != APSB_MAGIC {
            return Err(ApfsError::InvalidMagic(magic));
        }

        let fs_index = cursor.read_u32::<LittleEndian>()?;
        let features = cursor.read_u64::<LittleEndian>()?;
        let readonly_compatible_features = cursor.read_u64::<LittleEndian>()?;
        let incompatible_features = cursor.read_u64::<LittleEndian>()?;
        let unmount_time = cursor.read_u64::<LittleEndian>()?;
        let fs_reserve_block_count = cursor.read_u64::<LittleEndian>()?;
        let fs_quota_block_count = cursor.read_u64::<LittleEndian>()?;
        let fs_alloc_count = cursor.read_u64::<LittleEndian>()?;

        // wrapped_meta_crypto_state_t (20 bytes): major/minor version, cp
        // flags, persistent class, key os version, key revision, unused.
        let mut _skip = [0u8; 20];
        std::io::Read::read_exact(&mut cursor, &mut _skip)?;

        let root_tree_type = cursor.read_u32::<LittleEndian>()?;
        let extentref_tree_type = cursor.read_u32::<LittleEndian>()?;
        let snap_meta_tree_type = cursor.read_u32::<LittleEndian>()?;

        let omap_oid = cursor.read_u64::<LittleEndian>()?;
        let root_tree_oid = cursor.read_u64::<LittleEndian>()?;
        let extentref_tree_oid = cursor.read_u64::<LittleEndian>()?;
        let snap_meta_tree_oid = cursor.read_u64::<LittleEndian>()?;

        let revert_to_xid = cursor.read_u64::<LittleEndian>()?;
        let revert_to_sblock_oid = cursor.read_u64::<LittleEndian>()?;

        let next_obj_id = cursor.read_u64::<LittleEndian>()?;
        let num_files = cursor.read_u64::<LittleEndian>()?;
        let num_directories = cursor.read_u64::<LittleEndian>()?;
        let num_symlinks = cursor.read_u64::<LittleEndian>()?;
        let num_other_fsobjects = cursor.read_u64::<LittleEndian>()?;
        let num_snapshots = cursor.read_u64::<LittleEndian>()?;
        let total_blocks_alloced = cursor.read_u64::<LittleEndian>()?;
        let total_blocks_freed = cursor.read_u64::<LittleEndian>()?;

        let mut uuid = [0u8; 16];
        std::io::Read::read_exact(&mut cursor, &mut uuid)?;

        let last_mod_time = cursor.read_u64::<LittleEndian>()?;
        let fs_flags = cursor.read_u64::<LittleEndian>()?;

        // formatted_by (apfs_modified_by_t: 32-byte name + 8-byte timestamp + 8-byte last_xid)
        let mut _formatted_by = [0u8; 48];
        std::io::Read::read_exact(&mut cursor, &mut _formatted_by)?;

        // modified_by array: 8 entries of apfs_modified_by_t (48 bytes each)
        let mut _modified_by = [0u8; 48];
        for _ in 0..8 {
            std::io::Read::read_exact(&mut cursor, &mut _modified_by)?;
        }

        // volume_name: null-terminated UTF-8, up to 256 bytes
        let mut name_buf = [0u8; 256];
        std::io::Read::read_exact(&mut cursor, &mut name_buf)?;
        let volume_name = {
            let nul_pos = name_buf.iter().position(|&b| b == 0).unwrap_or(256);
            String::from_utf8_lossy(&name_buf[..nul_pos]).to_string()
        };

        Ok(ApfsSuperblock {
            header,
            magic,
            fs_index,
            features,
            readonly_compatible_features,
            incompatible_features,
            unmount_time,
            fs_reserve_block_count,
            fs_quota_block_count,
            fs_alloc_count,
            root_tree_type,
            extentref_tree_type,
            snap_meta_tree_type,
            omap_oid,
            root_tree_oid,
            extentref_tree_oid,
            snap_meta_tree_oid,
            revert_to_xid,
            revert_to_sblock_oid,
            next_obj_id,
            num_files,
            num_directories,
            num_symlinks,
            num_other_fsobjects,
            num_snapshots,
            total_blocks_alloced,
            total_blocks_freed,
            uuid,
            last_mod_time,
            fs_flags,
            volume_name,
        })
    }

    pub fn is_case_insensitive(&self) -> bool {
        self.incompatible_features & APFS_INCOMPAT_CASE_INSENSITIVE != 0
    }

    pub fn is_unencrypted(&self) -> bool {
        self.fs_flags & APFS_FS_UNENCRYPTED != 0
    }
}

/// One record of a checkpoint-map block (`checkpoint_mapping_t`): maps an
/// ephemeral OID of one transaction to the physical block holding it.
#[derive(Debug, Clone)]
pub struct CheckpointMapping {
    pub object_type: u32,
    pub object_subtype: u32,
    pub size: u32,
    pub fs_oid: u64,
    pub oid: u64,
    pub paddr: u64,
}

/// A checkpoint-map block (`checkpoint_map_phys_t`): object type
/// `0x4000000c`, subtype `0`, at most 101 entries (spec.md §3/§9).
#[derive(Debug, Clone)]
pub struct CheckpointMap {
    pub header: ObjectHeader,
    pub entries: Vec<CheckpointMapping>,
}

const CHECKPOINT_MAP_ENTRY_MAX: u32 = 101;
/// Full type_and_flags value a checkpoint-map object must carry: kind
/// `0x000c` with the ephemeral storage-type bits set.
const CHECKPOINT_MAP_FULL_TYPE: u32 = 0x4000_000c;

impl CheckpointMap {
    pub fn parse(block: &[u8]) -> Result<Self> {
        let header = ObjectHeader::parse(block)?;
        if header.type_and_flags != CHECKPOINT_MAP_FULL_TYPE {
            return Err(ApfsError::Malformed(format!(
                "checkpoint map has wrong type 0x{:08x}",
                header.type_and_flags
            )));
        }
        if header.subtype != 0 {
            return Err(ApfsError::Malformed("checkpoint map subtype must be 0".into()));
        }

        let mut cursor = Cursor::new(&block[ObjectHeader::SIZE..]);
        let _cpm_flags = cursor.read_u32::<LittleEndian>()?;
        let cpm_count = cursor.read_u32::<LittleEndian>()?;
        if cpm_count > CHECKPOINT_MAP_ENTRY_MAX {
            return Err(ApfsError::Malformed(format!(
                "checkpoint map entry_count {cpm_count} exceeds {CHECKPOINT_MAP_ENTRY_MAX}"
            )));
        }

        let mut entries = Vec::with_capacity(cpm_count as usize);
        for _ in 0..cpm_count {
            let object_type = cursor.read_u32::<LittleEndian>()?;
            let object_subtype = cursor.read_u32::<LittleEndian>()?;
            let size = cursor.read_u32::<LittleEndian>()?;
            let _pad = cursor.read_u32::<LittleEndian>()?;
            let fs_oid = cursor.read_u64::<LittleEndian>()?;
            let oid = cursor.read_u64::<LittleEndian>()?;
            let paddr = cursor.read_u64::<LittleEndian>()?;
            entries.push(CheckpointMapping {
                object_type,
                object_subtype,
                size,
                fs_oid,
                oid,
                paddr,
            });
        }

        Ok(CheckpointMap { header, entries })
    }

    /// Resolve an ephemeral OID within this checkpoint's map to its
    /// physical block.
    pub fn resolve(&self, oid: u64) -> Option<u64> {
        self.entries.iter().find(|e| e.oid == oid).map(|e| e.paddr)
    }
}

/// Scan the checkpoint-descriptor area and select the superblock + map with
/// the highest valid XID, per spec.md §4.4. Iterates `xp_desc_blocks + 1`
/// ring slots (the source's own off-by-one, reproduced deliberately).
pub fn scan_checkpoint(
    device: &dyn BlockDevice,
    nxsb: &NxSuperblock,
) -> Result<(NxSuperblock, CheckpointMap)> {
    let block_size = nxsb.block_size;
    let base = nxsb.xp_desc_base;
    let count = nxsb.xp_desc_blocks as u64;

    let mut best_sb = nxsb.clone();
    let mut best_sb_xid = nxsb.header.xid;
    let mut best_map: Option<CheckpointMap> = None;
    let mut best_map_xid: u64 = 0;

    for i in 0..=count {
        let block_num = base + (i % count.max(1));
        let block = match object::read_block(device, block_num, block_size) {
            Ok(b) => b,
            Err(_) => continue,
        };
        if !crate::fletcher::verify_object(&block) {
            // ChecksumMismatch is recoverable here: skip and keep scanning.
            continue;
        }
        let header = match ObjectHeader::parse(&block) {
            Ok(h) => h,
            Err(_) => continue,
        };

        match header.object_type() {
            t if t == OBJECT_TYPE_NX_SUPERBLOCK => {
                if let Ok(sb) = NxSuperblock::parse(&block) {
                    if sb.header.xid > best_sb_xid {
                        best_sb_xid = sb.header.xid;
                        best_sb = sb;
                    }
                }
            }
            t if t == OBJECT_TYPE_CHECKPOINT_MAP => {
                if let Ok(map) = CheckpointMap::parse(&block) {
                    if map.header.xid > best_map_xid {
                        best_map_xid = map.header.xid;
                        best_map = Some(map);
                    }
                }
            }
            _ => continue,
        }
    }

    let map = best_map.ok_or(ApfsError::MissingCheckpointMap)?;
    Ok((best_sb, map))
}

/// Read and parse the container superblock from block 0.
pub fn read_nxsb(device: &dyn BlockDevice) -> Result<NxSuperblock> {
    let block = object::read_block(device, 0, 4096)?;
    if !crate::fletcher::verify_object(&block) {
        return Err(ApfsError::ChecksumMismatch);
    }
    NxSuperblock::parse(&block)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::ReaderDevice;
    use std::io::BufReader;

    fn open_appfs() -> Option<ReaderDevice<BufReader<std::fs::File>>> {
        let file = std::fs::File::open("tests/appfs.raw").ok()?;
        Some(ReaderDevice::new(BufReader::new(file)))
    }

    /// Requires tests/appfs.raw fixture. Run with `cargo test -- --ignored`.
    #[test]
    #[ignore]
    fn test_parse_nxsb() {
        let device = open_appfs().unwrap();
        let nxsb = read_nxsb(&device).unwrap();
        assert_eq!(nxsb.magic, NX_MAGIC);
        assert_eq!(nxsb.block_size, 4096);
        assert!(nxsb.block_count > 0);
    }

    /// Requires tests/appfs.raw fixture. Run with `cargo test -- --ignored`.
    #[test]
    #[ignore]
    fn test_checkpoint_scan() {
        let device = open_appfs().unwrap();
        let nxsb = read_nxsb(&device).unwrap();
        let (latest, map) = scan_checkpoint(&device, &nxsb).unwrap();
        assert!(latest.header.xid >= nxsb.header.xid);
        assert_eq!(map.header.object_type(), OBJECT_TYPE_CHECKPOINT_MAP);
    }

    #[test]
    fn test_nxsb_invalid_magic() {
        let mut block = vec![0u8; 4096];
        block[24..28].copy_from_slice(&0x01u32.to_le_bytes()); // type = NX_SUPERBLOCK
        block[32..36].copy_from_slice(&0xDEADBEEFu32.to_le_bytes());

        let result = NxSuperblock::parse(&block);
        assert!(matches!(result, Err(ApfsError::InvalidMagic(0xDEADBEEF))));
    }

    #[test]
    fn test_checkpoint_map_wrong_type_rejected() {
        let mut block = vec![0u8; 4096];
        block[24..28].copy_from_slice(&0x0000000du32.to_le_bytes());
        let checksum = crate::fletcher::fletcher64(&block[8..]);
        block[0..8].copy_from_slice(&checksum.to_le_bytes());
        assert!(CheckpointMap::parse(&block).is_err());
    }

    #[test]
    fn test_checkpoint_map_entry_count_bound() {
        let mut block = vec![0u8; 4096];
        block[24..28].copy_from_slice(&CHECKPOINT_MAP_FULL_TYPE.to_le_bytes());
        block[32..36].copy_from_slice(&0u32.to_le_bytes()); // cpm_flags
        block[36..40].copy_from_slice(&102u32.to_le_bytes()); // cpm_count > 101
        assert!(matches!(CheckpointMap::parse(&block), Err(ApfsError::Malformed(_))));
    }
}
