use byteorder::{LittleEndian, ReadBytesExt};
use std::cmp::Ordering;
use std::io::Cursor;

use crate::block::BlockDevice;
use crate::error::{ApfsError, Result};
use crate::object::{self, ObjectHeader};

// B-tree node flags (from btn_flags)
pub const BTNODE_ROOT: u16 = 0x0001;
pub const BTNODE_LEAF: u16 = 0x0002;
pub const BTNODE_FIXED_KV_SIZE: u16 = 0x0004;

// BTreeInfo flags (bt_flags)
/// Child links hold physical block numbers directly, not virtual OIDs.
pub const BTREE_PHYSICAL: u32 = 0x0001;

/// B-tree node header — 24 bytes after the object header: `btn_flags`,
/// `btn_level`, `btn_nkeys`, then four `nloc_t { off, len }` pairs (table
/// space, free space, key free list, value free list).
#[derive(Debug, Clone)]
pub struct BTreeNodeHeader {
    pub btn_flags: u16,
    pub btn_level: u16,
    pub btn_nkeys: u32,
    pub btn_table_space_off: u16,
    pub btn_table_space_len: u16,
    pub btn_free_space_off: u16,
    pub btn_free_space_len: u16,
    pub btn_key_free_list_off: u16,
    pub btn_key_free_list_len: u16,
    pub btn_val_free_list_off: u16,
    pub btn_val_free_list_len: u16,
}

impl BTreeNodeHeader {
    pub const SIZE: usize = 24;

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(ApfsError::Malformed("btree node header too short".into()));
        }
        let mut cursor = Cursor::new(data);
        Ok(BTreeNodeHeader {
            btn_flags: cursor.read_u16::<LittleEndian>()?,
            btn_level: cursor.read_u16::<LittleEndian>()?,
            btn_nkeys: cursor.read_u32::<LittleEndian>()?,
            btn_table_space_off: cursor.read_u16::<LittleEndian>()?,
            btn_table_space_len: cursor.read_u16::<LittleEndian>()?,
            btn_free_space_off: cursor.read_u16::<LittleEndian>()?,
            btn_free_space_len: cursor.read_u16::<LittleEndian>()?,
            btn_key_free_list_off: cursor.read_u16::<LittleEndian>()?,
            btn_key_free_list_len: cursor.read_u16::<LittleEndian>()?,
            btn_val_free_list_off: cursor.read_u16::<LittleEndian>()?,
            btn_val_free_list_len: cursor.read_u16::<LittleEndian>()?,
        })
    }

    pub fn is_leaf(&self) -> bool {
        self.btn_flags & BTNODE_LEAF != 0
    }

    pub fn is_root(&self) -> bool {
        self.btn_flags & BTNODE_ROOT != 0
    }

    pub fn is_fixed_kv(&self) -> bool {
        self.btn_flags & BTNODE_FIXED_KV_SIZE != 0
    }
}

/// BTreeInfo — 40 bytes at the very end of a root node's block.
#[derive(Debug, Clone)]
pub struct BTreeInfo {
    pub bt_fixed: BTreeInfoFixed,
    pub bt_longest_key: u32,
    pub bt_longest_val: u32,
    pub bt_key_count: u64,
    pub bt_node_count: u64,
}

#[derive(Debug, Clone)]
pub struct BTreeInfoFixed {
    pub bt_flags: u32,
    pub bt_node_size: u32,
    pub bt_key_size: u32,
    pub bt_val_size: u32,
}

impl BTreeInfo {
    pub const SIZE: usize = 40;

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(ApfsError::Malformed("btree info too short".into()));
        }
        let mut cursor = Cursor::new(data);
        let bt_flags = cursor.read_u32::<LittleEndian>()?;
        let bt_node_size = cursor.read_u32::<LittleEndian>()?;
        let bt_key_size = cursor.read_u32::<LittleEndian>()?;
        let bt_val_size = cursor.read_u32::<LittleEndian>()?;
        let bt_longest_key = cursor.read_u32::<LittleEndian>()?;
        let bt_longest_val = cursor.read_u32::<LittleEndian>()?;
        let bt_key_count = cursor.read_u64::<LittleEndian>()?;
        let bt_node_count = cursor.read_u64::<LittleEndian>()?;

        Ok(BTreeInfo {
            bt_fixed: BTreeInfoFixed {
                bt_flags,
                bt_node_size,
                bt_key_size,
                bt_val_size,
            },
            bt_longest_key,
            bt_longest_val,
            bt_key_count,
            bt_node_count,
        })
    }
}

/// A Table of Contents entry (fixed-size KV: 4 bytes, variable-size: 8 bytes)
#[derive(Debug, Clone)]
pub struct TocEntry {
    pub key_off: u16,
    pub key_len: u16, // 0 for fixed-size KV
    pub val_off: u16,
    pub val_len: u16, // 0 for fixed-size KV
}

/// A parsed APFS B-tree node with extracted key-value pairs.
pub struct BTreeNode {
    pub header: ObjectHeader,
    pub node_header: BTreeNodeHeader,
    pub toc: Vec<TocEntry>,
    pub block_data: Vec<u8>,
    pub key_area_off: usize, // Absolute offset within block_data where key area starts
    pub val_area_end: usize, // Absolute offset within block_data where val area ends
    pub info: Option<BTreeInfo>,
}

impl BTreeNode {
    /// Parse a B-tree node from a raw block.
    pub fn parse(block: &[u8]) -> Result<Self> {
        let header = ObjectHeader::parse(block)?;
        let node_header = BTreeNodeHeader::parse(&block[ObjectHeader::SIZE..])?;

        let toc_start = ObjectHeader::SIZE + BTreeNodeHeader::SIZE + node_header.btn_table_space_off as usize;
        let fixed_kv = node_header.is_fixed_kv();

        let key_area_off = ObjectHeader::SIZE
            + BTreeNodeHeader::SIZE
            + node_header.btn_table_space_off as usize
            + node_header.btn_table_space_len as usize;

        let info = if node_header.is_root() {
            if block.len() < BTreeInfo::SIZE {
                return Err(ApfsError::Malformed("root node too short for btree info".into()));
            }
            let info_start = block.len() - BTreeInfo::SIZE;
            Some(BTreeInfo::parse(&block[info_start..])?)
        } else {
            None
        };

        let val_area_end = if node_header.is_root() {
            block.len() - BTreeInfo::SIZE
        } else {
            block.len()
        };

        let mut toc = Vec::with_capacity(node_header.btn_nkeys as usize);
        if toc_start > block.len() {
            return Err(ApfsError::Malformed("toc start out of bounds".into()));
        }
        let mut cursor = Cursor::new(&block[toc_start..]);

        for _ in 0..node_header.btn_nkeys {
            if fixed_kv {
                let key_off = cursor.read_u16::<LittleEndian>()?;
                let val_off = cursor.read_u16::<LittleEndian>()?;
                toc.push(TocEntry { key_off, key_len: 0, val_off, val_len: 0 });
            } else {
                let key_off = cursor.read_u16::<LittleEndian>()?;
                let key_len = cursor.read_u16::<LittleEndian>()?;
                let val_off = cursor.read_u16::<LittleEndian>()?;
                let val_len = cursor.read_u16::<LittleEndian>()?;
                toc.push(TocEntry { key_off, key_len, val_off, val_len });
            }
        }

        Ok(BTreeNode {
            header,
            node_header,
            toc,
            block_data: block.to_vec(),
            key_area_off,
            val_area_end,
            info,
        })
    }

    /// Get the key bytes for a given TOC index. Returns `Malformed` if the
    /// entry indexes outside the block — the caller aborts the query rather
    /// than trusting a corrupt node.
    pub fn key(&self, index: usize, fixed_key_size: u32) -> Result<&[u8]> {
        let entry = self.toc.get(index).ok_or_else(|| ApfsError::Malformed("toc index out of range".into()))?;
        let start = self.key_area_off + entry.key_off as usize;
        let len = if self.node_header.is_fixed_kv() { fixed_key_size as usize } else { entry.key_len as usize };
        let end = start
            .checked_add(len)
            .ok_or_else(|| ApfsError::Malformed("key offset overflow".into()))?;
        if end > self.block_data.len() {
            return Err(ApfsError::Malformed(format!(
                "key out of bounds: start={start}, len={len}, block_size={}",
                self.block_data.len()
            )));
        }
        Ok(&self.block_data[start..end])
    }

    /// Get the value bytes for a given TOC index. Internal-node values are
    /// always an 8-byte child link (OID or physical block number).
    pub fn value(&self, index: usize, fixed_val_size: u32) -> Result<&[u8]> {
        let entry = self.toc.get(index).ok_or_else(|| ApfsError::Malformed("toc index out of range".into()))?;
        let len = if !self.node_header.is_leaf() {
            8
        } else if self.node_header.is_fixed_kv() {
            fixed_val_size as usize
        } else {
            entry.val_len as usize
        };

        let val_off = entry.val_off as usize;
        if val_off > self.val_area_end {
            return Err(ApfsError::Malformed("value offset exceeds value area".into()));
        }
        let start = self.val_area_end - val_off;
        let end = start
            .checked_add(len)
            .ok_or_else(|| ApfsError::Malformed("value offset overflow".into()))?;
        if end > self.block_data.len() || start < self.key_area_off {
            return Err(ApfsError::Malformed(format!(
                "value out of bounds: start={start}, len={len}, val_area_end={}, block_size={}",
                self.val_area_end,
                self.block_data.len()
            )));
        }
        Ok(&self.block_data[start..end])
    }

    /// For internal nodes, get the child link at a given index. Its meaning
    /// (physical block vs. virtual OID) is decided by the tree's
    /// `BTREE_PHYSICAL` flag, not by this accessor.
    pub fn child_link(&self, index: usize) -> Result<u64> {
        let val = self.value(index, 8)?;
        if val.len() < 8 {
            return Err(ApfsError::Malformed("child link too short".into()));
        }
        Ok(u64::from_le_bytes([val[0], val[1], val[2], val[3], val[4], val[5], val[6], val[7]]))
    }
}

/// Resolves a B-tree child link to a physical block number. Internal
/// (non-leaf) nodes store either a physical block number directly or a
/// virtual OID that must be resolved through an object map at a fixed XID —
/// which one is a property of the tree, decided once, not per-node.
pub trait OidResolver {
    fn resolve(&self, device: &dyn BlockDevice, oid: u64) -> Result<u64>;
}

/// Identity resolver: child links are already physical block numbers (used
/// by the object map's own B-tree, and any tree with `BTREE_PHYSICAL` set).
pub struct Physical;

impl OidResolver for Physical {
    fn resolve(&self, _device: &dyn BlockDevice, oid: u64) -> Result<u64> {
        Ok(oid)
    }
}

/// Look up a key in a B-tree. `compare_fn` returns the ordering of a node
/// key relative to the search key. Returns the raw value bytes if found.
pub fn btree_lookup<F>(
    device: &dyn BlockDevice,
    root_block: u64,
    block_size: u32,
    fixed_key_size: u32,
    fixed_val_size: u32,
    compare_fn: &F,
    resolver: &dyn OidResolver,
) -> Result<Option<Vec<u8>>>
where
    F: Fn(&[u8]) -> Ordering,
{
    let block_data = object::read_block(device, root_block, block_size)?;
    let node = BTreeNode::parse(&block_data)?;

    let (fks, fvs) = fixed_sizes(&node, fixed_key_size, fixed_val_size);
    btree_lookup_node(device, &node, block_size, fks, fvs, compare_fn, resolver)
}

fn fixed_sizes(node: &BTreeNode, fixed_key_size: u32, fixed_val_size: u32) -> (u32, u32) {
    if let Some(ref info) = node.info {
        (
            if info.bt_fixed.bt_key_size > 0 { info.bt_fixed.bt_key_size } else { fixed_key_size },
            if info.bt_fixed.bt_val_size > 0 { info.bt_fixed.bt_val_size } else { fixed_val_size },
        )
    } else {
        (fixed_key_size, fixed_val_size)
    }
}

fn btree_lookup_node<F>(
    device: &dyn BlockDevice,
    node: &BTreeNode,
    block_size: u32,
    fixed_key_size: u32,
    fixed_val_size: u32,
    compare_fn: &F,
    resolver: &dyn OidResolver,
) -> Result<Option<Vec<u8>>>
where
    F: Fn(&[u8]) -> Ordering,
{
    if node.node_header.is_leaf() {
        for i in 0..node.node_header.btn_nkeys as usize {
            let key = node.key(i, fixed_key_size)?;
            match compare_fn(key) {
                Ordering::Equal => return Ok(Some(node.value(i, fixed_val_size)?.to_vec())),
                Ordering::Greater => return Ok(None),
                Ordering::Less => continue,
            }
        }
        Ok(None)
    } else {
        let mut child_idx: Option<usize> = None;
        for i in 0..node.node_header.btn_nkeys as usize {
            let key = node.key(i, fixed_key_size)?;
            match compare_fn(key) {
                Ordering::Less | Ordering::Equal => child_idx = Some(i),
                Ordering::Greater => break,
            }
        }

        let child_idx = match child_idx {
            Some(i) => i,
            None => return Ok(None),
        };

        let child_oid = node.child_link(child_idx)?;
        let child_block = resolver.resolve(device, child_oid)?;
        let child_data = object::read_block(device, child_block, block_size)?;
        let child_node = BTreeNode::parse(&child_data)?;

        btree_lookup_node(device, &child_node, block_size, fixed_key_size, fixed_val_size, compare_fn, resolver)
    }
}

/// Scan a B-tree, collecting all key-value pairs for which `range_fn`
/// returns `Some(true)`. `Some(false)` skips and keeps scanning;
/// `None` stops the scan (used for ordered-range bail-out).
pub fn btree_scan<F>(
    device: &dyn BlockDevice,
    root_block: u64,
    block_size: u32,
    fixed_key_size: u32,
    fixed_val_size: u32,
    range_fn: &F,
    resolver: &dyn OidResolver,
) -> Result<Vec<(Vec<u8>, Vec<u8>)>>
where
    F: Fn(&[u8]) -> Option<bool>,
{
    let block_data = object::read_block(device, root_block, block_size)?;
    let node = BTreeNode::parse(&block_data)?;
    let (fks, fvs) = fixed_sizes(&node, fixed_key_size, fixed_val_size);

    let mut results = Vec::new();
    btree_scan_node(device, &node, block_size, fks, fvs, range_fn, &mut results, resolver)?;
    Ok(results)
}

fn btree_scan_node<F>(
    device: &dyn BlockDevice,
    node: &BTreeNode,
    block_size: u32,
    fixed_key_size: u32,
    fixed_val_size: u32,
    range_fn: &F,
    results: &mut Vec<(Vec<u8>, Vec<u8>)>,
    resolver: &dyn OidResolver,
) -> Result<bool>
where
    F: Fn(&[u8]) -> Option<bool>,
{
    if node.node_header.is_leaf() {
        for i in 0..node.node_header.btn_nkeys as usize {
            let key = node.key(i, fixed_key_size)?;
            match range_fn(key) {
                Some(true) => results.push((key.to_vec(), node.value(i, fixed_val_size)?.to_vec())),
                Some(false) => continue,
                None => return Ok(false),
            }
        }
        Ok(true)
    } else {
        // Prune like btree_lookup_node: a child's key is its subtree's
        // minimum key, so the last child whose key isn't already past the
        // target range is the first child that can hold a match. Starting
        // the scan there (instead of at child 0) is what keeps a range scan
        // O(log n) rather than O(n) in the tree's size.
        let mut start_idx = None;
        for i in 0..node.node_header.btn_nkeys as usize {
            let key = node.key(i, fixed_key_size)?;
            match range_fn(key) {
                Some(_) => start_idx = Some(i),
                None => break,
            }
        }
        let Some(start_idx) = start_idx else {
            // Even this node's first child starts past the target range:
            // nothing here or in any later sibling can match.
            return Ok(false);
        };

        for i in start_idx..node.node_header.btn_nkeys as usize {
            let child_oid = node.child_link(i)?;
            let child_block = resolver.resolve(device, child_oid)?;
            let child_data = object::read_block(device, child_block, block_size)?;
            let child_node = BTreeNode::parse(&child_data)?;

            if !btree_scan_node(device, &child_node, block_size, fixed_key_size, fixed_val_size, range_fn, results, resolver)? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

/// Full depth-first walk of every leaf entry, unconditionally. A thin
/// wrapper over `btree_scan` with an always-true range function, used by
/// object-map bulk lookups and snapshot enumeration.
pub fn scan_all(
    device: &dyn BlockDevice,
    root_block: u64,
    block_size: u32,
    fixed_key_size: u32,
    fixed_val_size: u32,
    resolver: &dyn OidResolver,
) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
    btree_scan(device, root_block, block_size, fixed_key_size, fixed_val_size, &|_| Some(true), resolver)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_header_parse_leaf() {
        let mut data = vec![0u8; 24];
        data[0..2].copy_from_slice(&BTNODE_LEAF.to_le_bytes());
        data[4..8].copy_from_slice(&3u32.to_le_bytes());
        let header = BTreeNodeHeader::parse(&data).unwrap();
        assert!(header.is_leaf());
        assert!(!header.is_root());
        assert_eq!(header.btn_nkeys, 3);
    }

    #[test]
    fn test_node_header_too_short() {
        assert!(BTreeNodeHeader::parse(&[0u8; 4]).is_err());
    }
}
