use byteorder::{LittleEndian, ReadBytesExt};
use std::cmp::Ordering;
use std::io::Cursor;

use crate::block::BlockDevice;
use crate::btree::{self, OidResolver};
use crate::error::{ApfsError, Result};
use crate::name;

// Catalog record types (j_obj_types), stored in the top 4 bits of the key's obj_id_and_type.
pub const J_TYPE_SNAP_METADATA: u8 = 1;
pub const J_TYPE_EXTENT: u8 = 2;
pub const J_TYPE_INODE: u8 = 3;
pub const J_TYPE_XATTR: u8 = 4;
pub const J_TYPE_SIBLING_LINK: u8 = 5;
pub const J_TYPE_DSTREAM_ID: u8 = 6;
pub const J_TYPE_CRYPTO_STATE: u8 = 7;
pub const J_TYPE_FILE_EXTENT: u8 = 8;
pub const J_TYPE_DIR_REC: u8 = 9;
pub const J_TYPE_DIR_STATS: u8 = 10;
pub const J_TYPE_SNAP_NAME: u8 = 11;
pub const J_TYPE_SIBLING_MAP: u8 = 12;

// Well-known OIDs
pub const ROOT_DIR_PARENT: u64 = 1;
pub const ROOT_DIR_RECORD: u64 = 2;

// Inode types (from BSD mode)
pub const INODE_DIR_TYPE: u16 = 0o040000; // S_IFDIR
pub const INODE_FILE_TYPE: u16 = 0o100000; // S_IFREG
pub const INODE_SYMLINK_TYPE: u16 = 0o120000; // S_IFLNK

// Inode extended-field types (INO_EXT_TYPE_*). Unknown types are tolerated.
pub const INO_EXT_TYPE_NAME: u8 = 4;
pub const INO_EXT_TYPE_DSTREAM: u8 = 8;

// Directory-record extended-field types (DREC_EXT_TYPE_*). Any type other
// than SIBLING_ID is a structural error, unlike inode xfields.
pub const DREC_EXT_TYPE_SIBLING_ID: u8 = 1;

// XATTR value flags (j_xattr_flags)
pub const XATTR_DATA_STREAM: u16 = 0x0001;
pub const XATTR_DATA_EMBEDDED: u16 = 0x0002;

// DT_* directory entry type constants
pub const DT_REG: u16 = 8;
pub const DT_DIR: u16 = 4;
pub const DT_LNK: u16 = 10;

/// One decoded TLV extended-field entry from an inode or dirent trailer.
#[derive(Debug, Clone)]
pub struct ExtendedField {
    pub field_type: u8,
    pub flags: u8,
    pub data: Vec<u8>,
}

/// Parse a `u16 count, u16 reserved` TLV trailer into typed entries.
/// `strict` controls whether an unrecognized field type is an error
/// (dirent trailers) or simply carried opaquely (inode trailers).
fn parse_xfields(data: &[u8], known_types: &[u8], strict: bool) -> Result<Vec<ExtendedField>> {
    if data.len() < 4 {
        return Ok(Vec::new());
    }
    let count = u16::from_le_bytes([data[0], data[1]]) as usize;
    if count == 0 {
        return Ok(Vec::new());
    }

    let descriptors_start = 4;
    let descriptors_end = descriptors_start
        .checked_add(count * 4)
        .ok_or_else(|| ApfsError::Malformed("xfield descriptor table overflow".into()))?;
    if descriptors_end > data.len() {
        return Err(ApfsError::Malformed("xfield descriptor table out of bounds".into()));
    }

    let mut fields = Vec::with_capacity(count);
    let mut data_offset = descriptors_end;

    for i in 0..count {
        let off = descriptors_start + i * 4;
        let field_type = data[off];
        let flags = data[off + 1];
        let size = u16::from_le_bytes([data[off + 2], data[off + 3]]) as usize;

        if strict && !known_types.contains(&field_type) {
            return Err(ApfsError::Malformed(format!("unknown dirent xfield type {field_type}")));
        }

        let end = data_offset
            .checked_add(size)
            .ok_or_else(|| ApfsError::Malformed("xfield value offset overflow".into()))?;
        if end > data.len() {
            return Err(ApfsError::Malformed("xfield value out of bounds".into()));
        }

        fields.push(ExtendedField { field_type, flags, data: data[data_offset..end].to_vec() });

        let padded = (size + 7) & !7;
        data_offset = data_offset
            .checked_add(padded)
            .ok_or_else(|| ApfsError::Malformed("xfield value offset overflow".into()))?;
    }

    Ok(fields)
}

/// A data stream's size/allocation accounting (`j_dstream_t`), carried by
/// an inode's type-8 extended field.
#[derive(Debug, Clone, Copy, Default)]
pub struct DstreamAttr {
    pub size: u64,
    pub alloced_size: u64,
    pub default_crypto_id: u64,
    pub total_bytes_written: u64,
    pub total_bytes_read: u64,
}

impl DstreamAttr {
    const SIZE: usize = 40;

    fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(ApfsError::Malformed("dstream attribute too short".into()));
        }
        let mut cursor = Cursor::new(data);
        Ok(DstreamAttr {
            size: cursor.read_u64::<LittleEndian>()?,
            alloced_size: cursor.read_u64::<LittleEndian>()?,
            default_crypto_id: cursor.read_u64::<LittleEndian>()?,
            total_bytes_written: cursor.read_u64::<LittleEndian>()?,
            total_bytes_read: cursor.read_u64::<LittleEndian>()?,
        })
    }
}

/// Parsed inode value from a catalog record (`j_inode_val_t`).
#[derive(Debug, Clone)]
pub struct InodeVal {
    pub parent_id: u64,
    pub private_id: u64,
    pub create_time: i64,
    pub modify_time: i64,
    pub change_time: i64,
    pub access_time: i64,
    pub internal_flags: u64,
    pub nchildren_or_nlink: i32,
    pub default_protection_class: u32,
    pub write_generation_counter: u32,
    pub bsd_flags: u32,
    pub uid: u32,
    pub gid: u32,
    pub mode: u16,
    pub pad1: u16,
    pub uncompressed_size: u64,
    /// Extended fields carried in the trailer, in on-disk order.
    pub xfields: Vec<ExtendedField>,
    /// Type-4 extended field, if present: the inode's own stored name.
    pub name: Option<String>,
    /// Type-8 extended field, if present: authoritative data-stream sizing.
    pub dstream: Option<DstreamAttr>,
}

impl InodeVal {
    const FIXED_SIZE: usize = 92;

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::FIXED_SIZE {
            return Err(ApfsError::Malformed(format!("inode value too short: {} bytes", data.len())));
        }
        let mut cursor = Cursor::new(data);
        let parent_id = cursor.read_u64::<LittleEndian>()?;
        let private_id = cursor.read_u64::<LittleEndian>()?;
        let create_time = cursor.read_i64::<LittleEndian>()?;
        let modify_time = cursor.read_i64::<LittleEndian>()?;
        let change_time = cursor.read_i64::<LittleEndian>()?;
        let access_time = cursor.read_i64::<LittleEndian>()?;
        let internal_flags = cursor.read_u64::<LittleEndian>()?;
        let nchildren_or_nlink = cursor.read_i32::<LittleEndian>()?;
        let default_protection_class = cursor.read_u32::<LittleEndian>()?;
        let write_generation_counter = cursor.read_u32::<LittleEndian>()?;
        let bsd_flags = cursor.read_u32::<LittleEndian>()?;
        let uid = cursor.read_u32::<LittleEndian>()?;
        let gid = cursor.read_u32::<LittleEndian>()?;
        let mode = cursor.read_u16::<LittleEndian>()?;
        let pad1 = cursor.read_u16::<LittleEndian>()?;
        let uncompressed_size = cursor.read_u64::<LittleEndian>()?;

        let xfields = parse_xfields(&data[Self::FIXED_SIZE..], &[], false)?;

        let name = xfields
            .iter()
            .find(|f| f.field_type == INO_EXT_TYPE_NAME)
            .map(|f| {
                let nul = f.data.iter().position(|&b| b == 0).unwrap_or(f.data.len());
                String::from_utf8_lossy(&f.data[..nul]).into_owned()
            });

        let dstream = xfields
            .iter()
            .find(|f| f.field_type == INO_EXT_TYPE_DSTREAM)
            .map(|f| DstreamAttr::parse(&f.data))
            .transpose()?;

        Ok(InodeVal {
            parent_id,
            private_id,
            create_time,
            modify_time,
            change_time,
            access_time,
            internal_flags,
            nchildren_or_nlink,
            default_protection_class,
            write_generation_counter,
            bsd_flags,
            uid,
            gid,
            mode,
            pad1,
            uncompressed_size,
            xfields,
            name,
            dstream,
        })
    }

    pub fn kind(&self) -> u16 {
        self.mode & 0o170000
    }

    /// Logical file size: the data-stream xfield is authoritative when present.
    pub fn size(&self) -> u64 {
        self.dstream.map(|d| d.size).unwrap_or(self.uncompressed_size)
    }

    pub fn nlink(&self) -> u32 {
        self.nchildren_or_nlink as u32
    }
}

/// Directory record value (`j_drec_val_t`).
#[derive(Debug, Clone)]
pub struct DrecVal {
    pub file_id: u64,
    pub date_added: i64,
    pub flags: u16,
}

impl DrecVal {
    const FIXED_SIZE: usize = 18;

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::FIXED_SIZE {
            return Err(ApfsError::Malformed(format!("drec value too short: {} bytes", data.len())));
        }
        let mut cursor = Cursor::new(data);
        let file_id = cursor.read_u64::<LittleEndian>()?;
        let date_added = cursor.read_i64::<LittleEndian>()?;
        let flags = cursor.read_u16::<LittleEndian>()?;

        // Dirent xfield trailer, if any: only DREC_EXT_TYPE_SIBLING_ID is known here.
        parse_xfields(&data[Self::FIXED_SIZE..], &[DREC_EXT_TYPE_SIBLING_ID], true)?;

        Ok(DrecVal { file_id, date_added, flags })
    }

    pub fn file_type(&self) -> u16 {
        self.flags & 0x000F
    }
}

/// File extent value (`j_file_extent_val_t`).
#[derive(Debug, Clone)]
pub struct FileExtentVal {
    pub flags_and_length: u64,
    pub phys_block_num: u64,
    pub crypto_id: u64,
}

impl FileExtentVal {
    const SIZE: usize = 24;

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(ApfsError::Malformed(format!("file extent value too short: {} bytes", data.len())));
        }
        let mut cursor = Cursor::new(data);
        Ok(FileExtentVal {
            flags_and_length: cursor.read_u64::<LittleEndian>()?,
            phys_block_num: cursor.read_u64::<LittleEndian>()?,
            crypto_id: cursor.read_u64::<LittleEndian>()?,
        })
    }

    /// Logical length in bytes (lower 56 bits; top 8 are flags).
    pub fn length(&self) -> u64 {
        self.flags_and_length & 0x00FF_FFFF_FFFF_FFFF
    }
}

/// Extended attribute value (`j_xattr_val_t`).
#[derive(Debug, Clone)]
pub struct XattrVal {
    pub flags: u16,
    pub data: Vec<u8>,
}

impl XattrVal {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 4 {
            return Err(ApfsError::Malformed("xattr value too short".into()));
        }
        let flags = u16::from_le_bytes([data[0], data[1]]);
        let xdata_len = u16::from_le_bytes([data[2], data[3]]) as usize;
        let start = 4;
        let end = start
            .checked_add(xdata_len)
            .ok_or_else(|| ApfsError::Malformed("xattr data length overflow".into()))?;
        if end > data.len() {
            return Err(ApfsError::Malformed("xattr data extends beyond value".into()));
        }
        Ok(XattrVal { flags, data: data[start..end].to_vec() })
    }

    pub fn is_stream_reference(&self) -> bool {
        self.flags & XATTR_DATA_STREAM != 0
    }

    pub fn is_embedded(&self) -> bool {
        self.flags & XATTR_DATA_EMBEDDED != 0
    }
}

/// An external data-stream reference (`j_xattr_dstream_t`): 8 bytes of
/// owning OID followed by a `j_dstream_t`.
pub struct XattrStreamRef {
    pub xattr_obj_id: u64,
    pub dstream: DstreamAttr,
}

impl XattrStreamRef {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 8 {
            return Err(ApfsError::Malformed("xattr stream reference too short".into()));
        }
        let xattr_obj_id = u64::from_le_bytes(data[0..8].try_into().unwrap());
        let dstream = DstreamAttr::parse(&data[8..])?;
        Ok(XattrStreamRef { xattr_obj_id, dstream })
    }
}

/// Decode the 8-byte catalog key header: `(fsid, data_type)`.
fn decode_catalog_key(key_bytes: &[u8]) -> Result<(u64, u8)> {
    if key_bytes.len() < 8 {
        return Err(ApfsError::Malformed("catalog key too short".into()));
    }
    let obj_id_and_type = u64::from_le_bytes(key_bytes[0..8].try_into().unwrap());
    let obj_id = obj_id_and_type & 0x0FFF_FFFF_FFFF_FFFF;
    let j_type = ((obj_id_and_type >> 60) & 0xF) as u8;
    Ok((obj_id, j_type))
}

/// A decoded name-bearing key (dirent or xattr): the stored name plus, for
/// the hashed dirent form, its precomputed hash.
struct NameKey {
    name: String,
    hash: Option<u32>,
}

/// Decode a name field starting at `name_start` with length `name_len`
/// (which includes a trailing NUL in the on-disk encoding).
fn read_name_field(key_bytes: &[u8], name_start: usize, name_len: usize) -> Result<String> {
    let name_end = name_start
        .checked_add(name_len)
        .ok_or_else(|| ApfsError::Malformed("name field length overflow".into()))?;
    if name_len == 0 {
        return Err(ApfsError::Malformed("dirent name_size is zero".into()));
    }
    if name_end > key_bytes.len() {
        return Err(ApfsError::Malformed(format!(
            "name extends beyond key: name_end={name_end}, key_len={}",
            key_bytes.len()
        )));
    }
    let name_bytes = &key_bytes[name_start..name_end];
    let nul_pos = name_bytes.iter().position(|&b| b == 0).unwrap_or(name_bytes.len());
    Ok(String::from_utf8_lossy(&name_bytes[..nul_pos]).into_owned())
}

/// Decode a directory-record key, distinguishing plain vs. hashed form per
/// the `name_size < (key_len - 10)` heuristic: read the candidate u16
/// `name_size` at offset 8; if it looks too small for the key's actual
/// length, offset 8 is really a `u32` combined hash+size field instead.
fn decode_drec_key(key_bytes: &[u8]) -> Result<NameKey> {
    if key_bytes.len() < 10 {
        return Err(ApfsError::Malformed("drec key too short".into()));
    }
    let key_len = key_bytes.len();
    let candidate_name_size = u16::from_le_bytes([key_bytes[8], key_bytes[9]]) as usize;

    if candidate_name_size < key_len.saturating_sub(10) {
        if key_bytes.len() < 12 {
            return Err(ApfsError::Malformed("hashed drec key too short".into()));
        }
        let combined = u32::from_le_bytes(key_bytes[8..12].try_into().unwrap());
        let name_len = (combined & 0x3FF) as usize;
        let hash = (combined >> 10) & name::NAME_HASH_MASK;
        let name = read_name_field(key_bytes, 12, name_len)?;
        Ok(NameKey { name, hash: Some(hash) })
    } else {
        let name_len = candidate_name_size & 0x3FF;
        let name = read_name_field(key_bytes, 10, name_len)?;
        Ok(NameKey { name, hash: None })
    }
}

/// Decode an xattr key: `u16 name_size` followed by the UTF-8 name.
fn decode_xattr_key(key_bytes: &[u8]) -> Result<String> {
    if key_bytes.len() < 10 {
        return Err(ApfsError::Malformed("xattr key too short".into()));
    }
    let name_len = u16::from_le_bytes([key_bytes[8], key_bytes[9]]) as usize;
    read_name_field(key_bytes, 10, name_len)
}

fn compare_catalog_keys(oid_a: u64, type_a: u8, oid_b: u64, type_b: u8) -> Ordering {
    match oid_a.cmp(&oid_b) {
        Ordering::Equal => type_a.cmp(&type_b),
        ord => ord,
    }
}

/// Scan every record with a given `(fsid, data_type)`, stopping as soon as
/// the key sorts past it (catalog keys sort by fsid then data_type).
fn scan_records(
    device: &dyn BlockDevice,
    catalog_root: u64,
    block_size: u32,
    resolver: &dyn OidResolver,
    fsid: u64,
    data_type: u8,
) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
    let range_fn = |key: &[u8]| -> Option<bool> {
        match decode_catalog_key(key) {
            Ok((oid, j_type)) => match compare_catalog_keys(oid, j_type, fsid, data_type) {
                Ordering::Less => Some(false),
                Ordering::Equal => Some(true),
                Ordering::Greater => None,
            },
            Err(_) => Some(false),
        }
    };
    btree::btree_scan(device, catalog_root, block_size, 0, 0, &range_fn, resolver)
}

/// Look up an inode record by file-system identifier.
pub fn lookup_inode(
    device: &dyn BlockDevice,
    catalog_root: u64,
    block_size: u32,
    resolver: &dyn OidResolver,
    oid: u64,
) -> Result<InodeVal> {
    let compare_fn = |key: &[u8]| -> Ordering {
        match decode_catalog_key(key) {
            Ok((key_oid, key_type)) => compare_catalog_keys(key_oid, key_type, oid, J_TYPE_INODE),
            Err(_) => Ordering::Less,
        }
    };

    let val = btree::btree_lookup(device, catalog_root, block_size, 0, 0, &compare_fn, resolver)?;
    match val {
        Some(data) => InodeVal::parse(&data),
        None => Err(ApfsError::NotFound(format!("inode fsid {oid}"))),
    }
}

/// List every directory-record entry whose parent is `parent_oid`, in
/// on-disk (key) order.
pub fn list_children(
    device: &dyn BlockDevice,
    catalog_root: u64,
    block_size: u32,
    resolver: &dyn OidResolver,
    parent_oid: u64,
) -> Result<Vec<(String, DrecVal)>> {
    let entries = scan_records(device, catalog_root, block_size, resolver, parent_oid, J_TYPE_DIR_REC)?;

    let mut out = Vec::with_capacity(entries.len());
    for (key, val) in &entries {
        let name_key = decode_drec_key(key)?;
        let drec = DrecVal::parse(val)?;
        out.push((name_key.name, drec));
    }
    Ok(out)
}

/// Look up a single directory record by name under `parent_oid`, honoring
/// the volume's case-folding mode. Hashed dirents compare by hash first
/// (short-circuiting on mismatch) before falling back to canonical name
/// comparison.
pub fn lookup_drec_by_name(
    device: &dyn BlockDevice,
    catalog_root: u64,
    block_size: u32,
    resolver: &dyn OidResolver,
    parent_oid: u64,
    target_name: &str,
    case_insensitive: bool,
) -> Result<DrecVal> {
    let target_hash = name::hash_name(target_name, case_insensitive);
    let entries = scan_records(device, catalog_root, block_size, resolver, parent_oid, J_TYPE_DIR_REC)?;

    for (key, val) in &entries {
        let name_key = decode_drec_key(key)?;
        if let Some(hash) = name_key.hash {
            if hash != target_hash {
                continue;
            }
        }
        if name::names_equal(&name_key.name, target_name, case_insensitive) {
            return DrecVal::parse(val);
        }
    }

    Err(ApfsError::NotFound(target_name.to_string()))
}

/// List every extended attribute on `fsid`, decoded into `(name, value)` pairs.
pub fn list_xattrs(
    device: &dyn BlockDevice,
    catalog_root: u64,
    block_size: u32,
    resolver: &dyn OidResolver,
    fsid: u64,
) -> Result<Vec<(String, XattrVal)>> {
    let entries = scan_records(device, catalog_root, block_size, resolver, fsid, J_TYPE_XATTR)?;
    let mut out = Vec::with_capacity(entries.len());
    for (key, val) in &entries {
        let name = decode_xattr_key(key)?;
        let xattr = XattrVal::parse(val)?;
        out.push((name, xattr));
    }
    Ok(out)
}

/// Look up one named extended attribute on `fsid`, if present.
pub fn lookup_xattr(
    device: &dyn BlockDevice,
    catalog_root: u64,
    block_size: u32,
    resolver: &dyn OidResolver,
    fsid: u64,
    name: &str,
) -> Result<Option<XattrVal>> {
    let attrs = list_xattrs(device, catalog_root, block_size, resolver, fsid)?;
    Ok(attrs.into_iter().find(|(n, _)| n == name).map(|(_, v)| v))
}

/// Decode a `FILE_EXTENT` key: the 8-byte fsid/type header followed by a
/// `u64` logical offset (spec §3, tag 8).
fn decode_file_extent_key(key_bytes: &[u8]) -> Result<u64> {
    if key_bytes.len() < 16 {
        return Err(ApfsError::Malformed("file extent key too short".into()));
    }
    Ok(u64::from_le_bytes(key_bytes[8..16].try_into().unwrap()))
}

/// List every `FILE_EXTENT` row for a data-stream OID, paired with its true
/// logical offset from the key (not reconstructed by summing lengths —
/// a sparse file's extents are not densely packed), in ascending
/// logical-offset order (the natural key order the B-tree already
/// maintains — no separate sort is required).
pub fn lookup_extents(
    device: &dyn BlockDevice,
    catalog_root: u64,
    block_size: u32,
    resolver: &dyn OidResolver,
    data_stream_oid: u64,
) -> Result<Vec<(u64, FileExtentVal)>> {
    let entries = scan_records(device, catalog_root, block_size, resolver, data_stream_oid, J_TYPE_FILE_EXTENT)?;
    entries
        .iter()
        .map(|(key, val)| Ok((decode_file_extent_key(key)?, FileExtentVal::parse(val)?)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drec_val_parse() {
        let mut data = Vec::new();
        data.extend_from_slice(&42u64.to_le_bytes());
        data.extend_from_slice(&1000i64.to_le_bytes());
        data.extend_from_slice(&(DT_DIR).to_le_bytes());

        let drec = DrecVal::parse(&data).unwrap();
        assert_eq!(drec.file_id, 42);
        assert_eq!(drec.date_added, 1000);
        assert_eq!(drec.file_type(), DT_DIR);
    }

    #[test]
    fn test_file_extent_val_parse() {
        let flags_and_length: u64 = 0xAB00_0000_0000_1000;
        let mut data = Vec::new();
        data.extend_from_slice(&flags_and_length.to_le_bytes());
        data.extend_from_slice(&100u64.to_le_bytes());
        data.extend_from_slice(&0u64.to_le_bytes());

        let extent = FileExtentVal::parse(&data).unwrap();
        assert_eq!(extent.length(), 0x1000);
        assert_eq!(extent.phys_block_num, 100);
        assert_eq!(extent.crypto_id, 0);
    }

    #[test]
    fn test_decode_file_extent_key() {
        let mut key = Vec::new();
        key.extend_from_slice(&((J_TYPE_FILE_EXTENT as u64) << 60 | 7).to_le_bytes());
        key.extend_from_slice(&65536u64.to_le_bytes());

        let offset = decode_file_extent_key(&key).unwrap();
        assert_eq!(offset, 65536);
    }

    #[test]
    fn test_decode_plain_drec_key() {
        let mut key = Vec::new();
        key.extend_from_slice(&((J_TYPE_DIR_REC as u64) << 60 | 2).to_le_bytes());
        let name = b"hello.txt\0";
        key.extend_from_slice(&(name.len() as u16).to_le_bytes());
        key.extend_from_slice(name);

        let decoded = decode_drec_key(&key).unwrap();
        assert_eq!(decoded.name, "hello.txt");
        assert!(decoded.hash.is_none());
    }

    #[test]
    fn test_decode_hashed_drec_key() {
        let name = b"file_499.bin\0";
        let name_len = name.len() as u32;
        let hash: u32 = 0x1234;
        let combined = (hash << 10) | (name_len & 0x3FF);

        let mut key = Vec::new();
        key.extend_from_slice(&((J_TYPE_DIR_REC as u64) << 60 | 2).to_le_bytes());
        key.extend_from_slice(&combined.to_le_bytes());
        key.extend_from_slice(name);

        let decoded = decode_drec_key(&key).unwrap();
        assert_eq!(decoded.name, "file_499.bin");
        assert_eq!(decoded.hash, Some(hash));
    }

    #[test]
    fn test_xattr_val_embedded() {
        let mut data = Vec::new();
        data.extend_from_slice(&XATTR_DATA_EMBEDDED.to_le_bytes());
        data.extend_from_slice(&3u16.to_le_bytes());
        data.extend_from_slice(b"abc");

        let xattr = XattrVal::parse(&data).unwrap();
        assert!(xattr.is_embedded());
        assert!(!xattr.is_stream_reference());
        assert_eq!(xattr.data, b"abc");
    }

    #[test]
    fn test_dirent_unknown_xfield_is_malformed() {
        let mut data = Vec::new();
        data.extend_from_slice(&42u64.to_le_bytes());
        data.extend_from_slice(&1000i64.to_le_bytes());
        data.extend_from_slice(&(DT_REG).to_le_bytes());
        // one xfield of unknown type 99, zero-length value
        data.extend_from_slice(&1u16.to_le_bytes());
        data.extend_from_slice(&0u16.to_le_bytes());
        data.extend_from_slice(&[99u8, 0, 0, 0]);

        assert!(DrecVal::parse(&data).is_err());
    }

    #[test]
    fn test_inode_unknown_xfield_tolerated() {
        let mut data = vec![0u8; InodeVal::FIXED_SIZE];
        data.extend_from_slice(&1u16.to_le_bytes());
        data.extend_from_slice(&0u16.to_le_bytes());
        data.extend_from_slice(&[200u8, 0, 0, 0]);

        let inode = InodeVal::parse(&data).unwrap();
        assert_eq!(inode.xfields.len(), 1);
        assert_eq!(inode.xfields[0].field_type, 200);
    }
}
